use std::sync::Arc;
use std::time::Duration;

use crate::core::config::Settings;
use crate::progress::aggregator::ProgressAggregator;
use crate::progress::broadcaster::ProgressBroadcaster;
use crate::progress::registry::SessionRegistry;
use crate::progress::unknown_images::UnknownImageCache;
use crate::services::storage::StorageService;

#[derive(Clone)]
pub(crate) struct AppState {
    inner: Arc<InnerState>,
}

struct InnerState {
    settings: Settings,
    broadcaster: ProgressBroadcaster,
    aggregator: ProgressAggregator,
    unknown_images: UnknownImageCache,
    storage: Option<StorageService>,
    queue_configured: bool,
}

impl AppState {
    pub(crate) fn new(
        settings: Settings,
        storage: Option<StorageService>,
        queue_configured: bool,
    ) -> Self {
        let registry = SessionRegistry::new();
        let unknown_images = UnknownImageCache::new();
        let broadcaster =
            ProgressBroadcaster::new(registry.clone(), settings.progress().sse_buffer_size);
        let aggregator = ProgressAggregator::new(
            registry,
            unknown_images.clone(),
            storage.clone(),
            Duration::from_secs(settings.progress().presigned_url_expire_minutes * 60),
        );

        Self {
            inner: Arc::new(InnerState {
                settings,
                broadcaster,
                aggregator,
                unknown_images,
                storage,
                queue_configured,
            }),
        }
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub(crate) fn broadcaster(&self) -> &ProgressBroadcaster {
        &self.inner.broadcaster
    }

    pub(crate) fn aggregator(&self) -> &ProgressAggregator {
        &self.inner.aggregator
    }

    pub(crate) fn unknown_images(&self) -> &UnknownImageCache {
        &self.inner.unknown_images
    }

    pub(crate) fn storage(&self) -> Option<&StorageService> {
        self.inner.storage.as_ref()
    }

    pub(crate) fn queue_configured(&self) -> bool {
        self.inner.queue_configured
    }
}
