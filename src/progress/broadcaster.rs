use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::events::ProgressEvent;
use super::registry::SessionRegistry;
use super::session::{normalize_exam_code, SessionSnapshot, SessionStatus};

struct Subscriber {
    id: Uuid,
    tx: mpsc::Sender<ProgressEvent>,
}

/// Fans normalized events out to every live subscription of an exam code.
/// Each subscriber owns a bounded channel: a slow consumer loses events
/// instead of backpressuring the queue poller, and a disconnected one is
/// pruned on the next send.
#[derive(Clone)]
pub(crate) struct ProgressBroadcaster {
    registry: SessionRegistry,
    subscribers: Arc<DashMap<String, Vec<Subscriber>>>,
    buffer_size: usize,
}

impl ProgressBroadcaster {
    pub(crate) fn new(registry: SessionRegistry, buffer_size: usize) -> Self {
        Self { registry, subscribers: Arc::new(DashMap::new()), buffer_size }
    }

    pub(crate) fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Registers a new subscription, creating the session if absent. The
    /// first frame on the channel is a `connected` event carrying the
    /// current snapshot so late joiners render immediately.
    pub(crate) async fn connect(
        &self,
        exam_code: &str,
        exam_name: &str,
        total: u32,
    ) -> mpsc::Receiver<ProgressEvent> {
        let code = normalize_exam_code(exam_code);
        let session = self.registry.get_or_create(&code, exam_name, total).await;
        let snapshot = session.lock().await.snapshot();

        let (tx, rx) = mpsc::channel(self.buffer_size);
        let _ = tx.try_send(ProgressEvent::new(
            "connected",
            serde_json::to_value(&snapshot).unwrap_or_default(),
        ));

        let id = Uuid::new_v4();
        self.subscribers.entry(code.clone()).or_default().push(Subscriber { id, tx });

        tracing::info!(exam_code = %code, subscriber = %id, "Subscriber connected");
        metrics::counter!("sse_connections_total").increment(1);

        rx
    }

    /// Delivers a named event to every open subscription of the exam code.
    /// Returns the number of subscribers it reached. Never errors: a full
    /// buffer drops this event for that subscriber, a closed channel drops
    /// the subscription itself.
    pub(crate) fn send(&self, exam_code: &str, event: &str, data: Value) -> usize {
        let code = normalize_exam_code(exam_code);
        let message = ProgressEvent::new(event, data);

        let mut delivered = 0;
        if let Some(mut entry) = self.subscribers.get_mut(&code) {
            entry.retain(|subscriber| match subscriber.tx.try_send(message.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!(
                        exam_code = %code,
                        subscriber = %subscriber.id,
                        event = %message.event,
                        "Subscriber buffer full; event dropped"
                    );
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!(
                        exam_code = %code,
                        subscriber = %subscriber.id,
                        "Pruned disconnected subscriber"
                    );
                    false
                }
            });
        } else {
            tracing::debug!(exam_code = %code, event = %message.event, "No subscribers for event");
        }

        self.subscribers.remove_if(&code, |_, subscribers| subscribers.is_empty());
        metrics::counter!("sse_events_sent_total", "event" => message.event.clone())
            .increment(delivered as u64);

        delivered
    }

    /// Convenience path for progress computed outside a raw queue event.
    /// Updates the session under its lock and emits a `progress` frame.
    pub(crate) async fn update_progress(&self, exam_code: &str, index: u32, total: u32) {
        let code = normalize_exam_code(exam_code);
        let Some(session) = self.registry.get(&code) else {
            tracing::warn!(exam_code = %code, "No session found for progress update");
            return;
        };

        let snapshot = {
            let mut guard = session.lock().await;
            if guard.is_closed() {
                return;
            }
            guard.set_total_if_positive(Some(total));
            if guard.total() > 0 && index >= guard.total() {
                guard.resolve_status(Some(SessionStatus::Completed));
            } else {
                guard.resolve_status(None);
            }
            guard.touch();
            guard.snapshot()
        };

        let reported = if snapshot.total > 0 { index.min(snapshot.total) } else { index };
        self.send(
            &code,
            "progress",
            json!({
                "examCode": snapshot.exam_code,
                "index": reported,
                "total": snapshot.total,
                "status": snapshot.status.as_str(),
            }),
        );
    }

    pub(crate) async fn session(&self, exam_code: &str) -> Option<SessionSnapshot> {
        self.registry.snapshot(exam_code).await
    }

    pub(crate) async fn active_sessions(&self) -> Vec<SessionSnapshot> {
        self.registry.snapshots().await
    }

    /// Force-closes every subscription for the code and deletes the
    /// session. Dropping the senders ends each client stream. Idempotent.
    pub(crate) async fn remove(&self, exam_code: &str) -> bool {
        let code = normalize_exam_code(exam_code);
        if let Some((_, subscribers)) = self.subscribers.remove(&code) {
            tracing::info!(
                exam_code = %code,
                subscribers = subscribers.len(),
                "Closing subscriptions"
            );
        }

        self.registry.remove(&code).await
    }

    pub(crate) fn subscriber_count(&self, exam_code: &str) -> usize {
        self.subscribers
            .get(&normalize_exam_code(exam_code))
            .map(|entry| entry.len())
            .unwrap_or(0)
    }
}
