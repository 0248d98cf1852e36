use std::time::Duration;

use anyhow::Context;
use serde_json::{Map, Value};

use super::events::{RecognitionEvent, UNKNOWN_STUDENT_ID};
use super::registry::SessionRegistry;
use super::session::{normalize_exam_code, SessionSnapshot, SessionStatus};
use super::unknown_images::UnknownImageCache;
use crate::services::storage::{self, StorageService};

/// Result of applying one recognition event: the session state after the
/// event, and the normalized payload to broadcast.
pub(crate) struct AppliedEvent {
    pub(crate) snapshot: SessionSnapshot,
    pub(crate) payload: Value,
}

/// Applies raw recognition events to their target session. All session
/// mutation happens inside one critical section per event; the presigning
/// side effect for unattributed images runs after the lock is released.
#[derive(Clone)]
pub(crate) struct ProgressAggregator {
    registry: SessionRegistry,
    unknown_images: UnknownImageCache,
    storage: Option<StorageService>,
    presign_expiry: Duration,
}

impl ProgressAggregator {
    pub(crate) fn new(
        registry: SessionRegistry,
        unknown_images: UnknownImageCache,
        storage: Option<StorageService>,
        presign_expiry: Duration,
    ) -> Self {
        Self { registry, unknown_images, storage, presign_expiry }
    }

    /// Returns `Ok(None)` when the event is deliberately dropped (missing
    /// exam code, no session, duplicate, session removed mid-flight); those
    /// are expected conditions, not processing failures, and the message is
    /// still acknowledged.
    pub(crate) async fn apply(&self, raw: Value) -> anyhow::Result<Option<AppliedEvent>> {
        let event: RecognitionEvent =
            serde_json::from_value(raw.clone()).context("Malformed recognition event")?;

        let exam_code = event
            .exam_code
            .as_deref()
            .map(normalize_exam_code)
            .filter(|code| !code.is_empty());
        let Some(exam_code) = exam_code else {
            tracing::warn!("Recognition event without exam code dropped");
            return Ok(None);
        };

        let Some(session) = self.registry.get(&exam_code) else {
            tracing::warn!(exam_code = %exam_code, "No session found for recognition event");
            return Ok(None);
        };

        let filename = event.filename.as_deref().filter(|name| !name.is_empty());

        let snapshot = {
            let mut guard = session.lock().await;
            if guard.is_closed() {
                tracing::warn!(exam_code = %exam_code, "Session removed while event was in flight");
                return Ok(None);
            }

            if let Some(filename) = filename {
                if !guard.record_key(filename) {
                    tracing::info!(exam_code = %exam_code, filename, "Duplicate file ignored");
                    metrics::counter!("recognition_duplicates_total").increment(1);
                    return Ok(None);
                }
            }

            guard.set_total_if_positive(event.total);
            guard.resolve_status(event.status.as_deref().map(SessionStatus::parse));
            guard.touch();
            guard.snapshot()
        };

        let mut generated_urls = None;
        if event.student_id.as_deref() == Some(UNKNOWN_STUDENT_ID) {
            if let Some(filename) = filename {
                match self.presign_unknown_image(&exam_code, filename).await {
                    Ok(Some(url)) => {
                        self.unknown_images.save(&exam_code, std::slice::from_ref(&url));
                        tracing::info!(
                            exam_code = %exam_code,
                            filename,
                            "Cached unattributed image URL"
                        );
                        generated_urls = Some(vec![url]);
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::error!(
                            exam_code = %exam_code,
                            filename,
                            error = %err,
                            "Failed to presign unattributed image"
                        );
                    }
                }
            }
        } else if let Some(urls) = &event.presigned_urls {
            self.unknown_images.save(&exam_code, urls);
        }

        tracing::info!(
            exam_code = %snapshot.exam_code,
            index = snapshot.index,
            total = snapshot.total,
            status = snapshot.status.as_str(),
            "Progress updated"
        );

        let payload = normalized_payload(raw, &snapshot, generated_urls);
        Ok(Some(AppliedEvent { snapshot, payload }))
    }

    async fn presign_unknown_image(
        &self,
        exam_code: &str,
        filename: &str,
    ) -> anyhow::Result<Option<String>> {
        let Some(storage) = &self.storage else {
            tracing::debug!(exam_code, "S3 storage not configured; skipping unknown-image URL");
            return Ok(None);
        };

        let key = storage::unknown_id_key(exam_code, filename);
        let url = storage.presign_get(&key, self.presign_expiry).await?;
        Ok(Some(url))
    }
}

/// Folds the authoritative session fields into the raw event so observers
/// always see the deduplicated count, the current total, and the resolved
/// status regardless of what the producer reported.
fn normalized_payload(
    raw: Value,
    snapshot: &SessionSnapshot,
    generated_urls: Option<Vec<String>>,
) -> Value {
    let mut map = match raw {
        Value::Object(map) => map,
        _ => Map::new(),
    };

    map.insert("examCode".to_string(), Value::from(snapshot.exam_code.clone()));
    map.insert("index".to_string(), Value::from(snapshot.index));
    map.insert("total".to_string(), Value::from(snapshot.total));
    map.insert("status".to_string(), Value::from(snapshot.status.as_str()));
    if let Some(urls) = generated_urls {
        map.insert("presignedUrls".to_string(), Value::from(urls));
    }

    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Settings;
    use crate::test_support;
    use serde_json::json;

    fn aggregator() -> (ProgressAggregator, SessionRegistry, UnknownImageCache) {
        let registry = SessionRegistry::new();
        let cache = UnknownImageCache::new();
        let aggregator = ProgressAggregator::new(
            registry.clone(),
            cache.clone(),
            None,
            Duration::from_secs(600),
        );
        (aggregator, registry, cache)
    }

    #[tokio::test]
    async fn distinct_files_accumulate_until_completed() {
        let (aggregator, registry, _) = aggregator();
        registry.get_or_create("ABC123", "Midterm", 0).await;

        let applied = aggregator
            .apply(json!({"examCode": "ABC123", "filename": "a.jpg", "total": 3}))
            .await
            .expect("apply")
            .expect("applied");
        assert_eq!(applied.snapshot.index, 1);
        assert_eq!(applied.snapshot.total, 3);
        assert_eq!(applied.snapshot.status, SessionStatus::Processing);

        // Redelivery of a.jpg is a strict no-op.
        let duplicate = aggregator
            .apply(json!({"examCode": "ABC123", "filename": "a.jpg"}))
            .await
            .expect("apply");
        assert!(duplicate.is_none());

        for filename in ["b.jpg", "c.jpg"] {
            aggregator
                .apply(json!({"examCode": "ABC123", "filename": filename}))
                .await
                .expect("apply")
                .expect("applied");
        }

        let snapshot = registry.snapshot("ABC123").await.expect("snapshot");
        assert_eq!(snapshot.index, 3);
        assert_eq!(snapshot.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn duplicate_does_not_touch_last_update_time() {
        let (aggregator, registry, _) = aggregator();
        let session = registry.get_or_create("ABC123", "Midterm", 0).await;

        aggregator
            .apply(json!({"examCode": "ABC123", "filename": "a.jpg"}))
            .await
            .expect("apply")
            .expect("applied");
        let before = session.lock().await.last_update_time();

        tokio::time::sleep(Duration::from_millis(5)).await;
        aggregator
            .apply(json!({"examCode": "ABC123", "filename": "a.jpg"}))
            .await
            .expect("apply");

        assert_eq!(session.lock().await.last_update_time(), before);
    }

    #[tokio::test]
    async fn event_for_unknown_session_is_dropped() {
        let (aggregator, _, _) = aggregator();
        let applied = aggregator
            .apply(json!({"examCode": "NOPE42", "filename": "a.jpg"}))
            .await
            .expect("apply");
        assert!(applied.is_none());
    }

    #[tokio::test]
    async fn event_without_exam_code_is_dropped() {
        let (aggregator, _, _) = aggregator();
        let applied = aggregator.apply(json!({"filename": "a.jpg"})).await.expect("apply");
        assert!(applied.is_none());
    }

    #[tokio::test]
    async fn reported_index_clamps_but_ledger_keeps_growing() {
        let (aggregator, registry, _) = aggregator();
        let session = registry.get_or_create("ABC123", "Midterm", 2).await;

        for filename in ["a.jpg", "b.jpg", "c.jpg"] {
            aggregator
                .apply(json!({"examCode": "ABC123", "filename": filename}))
                .await
                .expect("apply")
                .expect("applied");
        }

        let snapshot = registry.snapshot("ABC123").await.expect("snapshot");
        assert_eq!(snapshot.index, 2);
        assert_eq!(snapshot.status, SessionStatus::Completed);
        assert_eq!(session.lock().await.processed_count(), 3);
    }

    #[tokio::test]
    async fn payload_overrides_producer_fields_and_keeps_the_rest() {
        let (aggregator, registry, _) = aggregator();
        registry.get_or_create("ABC123", "Midterm", 0).await;

        let applied = aggregator
            .apply(json!({
                "exam_code": " abc123 ",
                "student_id": "32201234",
                "filename": "a.jpg",
                "total": "3",
                "status": "queued"
            }))
            .await
            .expect("apply")
            .expect("applied");

        assert_eq!(applied.payload["examCode"], "ABC123");
        assert_eq!(applied.payload["index"], 1);
        assert_eq!(applied.payload["total"], 3);
        assert_eq!(applied.payload["status"], "processing");
        assert_eq!(applied.payload["student_id"], "32201234");
    }

    #[tokio::test]
    async fn carried_presigned_urls_land_in_cache() {
        let (aggregator, registry, cache) = aggregator();
        registry.get_or_create("ABC123", "Midterm", 0).await;

        aggregator
            .apply(json!({
                "examCode": "ABC123",
                "studentId": "32201234",
                "filename": "a.jpg",
                "presignedUrls": ["https://host/header/ABC123/unknown_id/a.jpg?sig=1"]
            }))
            .await
            .expect("apply")
            .expect("applied");

        assert_eq!(cache.get("ABC123").len(), 1);
    }

    #[tokio::test]
    async fn unknown_id_event_generates_and_caches_url() {
        let _guard = test_support::env_lock().await;
        test_support::set_test_env();
        test_support::set_test_storage_env();

        let settings = Settings::load().expect("settings");
        let storage = StorageService::from_settings(&settings)
            .await
            .expect("storage")
            .expect("storage enabled");

        let registry = SessionRegistry::new();
        let cache = UnknownImageCache::new();
        let aggregator = ProgressAggregator::new(
            registry.clone(),
            cache.clone(),
            Some(storage),
            Duration::from_secs(600),
        );
        registry.get_or_create("ABC123", "Midterm", 0).await;

        let applied = aggregator
            .apply(json!({
                "examCode": "ABC123",
                "studentId": "unknown_id",
                "filename": "x.jpg"
            }))
            .await
            .expect("apply")
            .expect("applied");

        let urls = cache.get("ABC123");
        assert_eq!(urls.len(), 1);
        assert!(urls[0].contains("x.jpg"));
        assert!(applied.payload["presignedUrls"].is_array());
    }
}
