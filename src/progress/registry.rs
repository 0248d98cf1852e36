use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use super::session::{normalize_exam_code, Session, SessionSnapshot};

/// Concurrency-safe table of per-exam progress sessions. The map gives
/// fine-grained per-shard access; each session carries its own lock so
/// mutations for unrelated exam codes never contend.
#[derive(Clone)]
pub(crate) struct SessionRegistry {
    sessions: Arc<DashMap<String, Arc<Mutex<Session>>>>,
}

impl SessionRegistry {
    pub(crate) fn new() -> Self {
        Self { sessions: Arc::new(DashMap::new()) }
    }

    /// Idempotent creation shared by both entry points (stream connect and
    /// first event). An existing session keeps its metadata, but a caller
    /// that already knows a positive total seeds it.
    pub(crate) async fn get_or_create(
        &self,
        exam_code: &str,
        exam_name: &str,
        total: u32,
    ) -> Arc<Mutex<Session>> {
        let code = normalize_exam_code(exam_code);
        let session = self
            .sessions
            .entry(code.clone())
            .or_insert_with(|| {
                tracing::info!(exam_code = %code, exam_name, total, "Created progress session");
                Arc::new(Mutex::new(Session::new(code.clone(), exam_name.to_string(), total)))
            })
            .clone();

        if total > 0 {
            session.lock().await.set_total_if_positive(Some(total));
        }

        session
    }

    pub(crate) fn get(&self, exam_code: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions.get(&normalize_exam_code(exam_code)).map(|entry| entry.clone())
    }

    pub(crate) async fn snapshot(&self, exam_code: &str) -> Option<SessionSnapshot> {
        let session = self.get(exam_code)?;
        let guard = session.lock().await;
        Some(guard.snapshot())
    }

    pub(crate) async fn snapshots(&self) -> Vec<SessionSnapshot> {
        let sessions: Vec<Arc<Mutex<Session>>> =
            self.sessions.iter().map(|entry| entry.value().clone()).collect();

        let mut result = Vec::with_capacity(sessions.len());
        for session in sessions {
            result.push(session.lock().await.snapshot());
        }
        result
    }

    /// Deletes the session and invalidates it under its own lock, so an
    /// aggregation still holding the `Arc` sees a closed session rather
    /// than writing into a detached copy. Idempotent.
    pub(crate) async fn remove(&self, exam_code: &str) -> bool {
        let code = normalize_exam_code(exam_code);
        let Some((_, session)) = self.sessions.remove(&code) else {
            return false;
        };

        session.lock().await.close();
        tracing::info!(exam_code = %code, "Removed progress session");
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_or_create_is_idempotent_and_normalizes() {
        let registry = SessionRegistry::new();
        let first = registry.get_or_create("  abc123 ", "Midterm", 0).await;
        let second = registry.get_or_create("ABC123", "Other name", 0).await;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);

        let guard = first.lock().await;
        assert_eq!(guard.exam_code(), "ABC123");
    }

    #[tokio::test]
    async fn later_connect_seeds_total_on_existing_session() {
        let registry = SessionRegistry::new();
        registry.get_or_create("ABC123", "Midterm", 0).await;
        registry.get_or_create("ABC123", "Midterm", 30).await;

        let snapshot = registry.snapshot("ABC123").await.expect("snapshot");
        assert_eq!(snapshot.total, 30);
    }

    #[tokio::test]
    async fn remove_is_idempotent_and_closes_held_handles() {
        let registry = SessionRegistry::new();
        let held = registry.get_or_create("ABC123", "Midterm", 0).await;

        assert!(registry.remove("ABC123").await);
        assert!(!registry.remove("ABC123").await);
        assert!(registry.snapshot("ABC123").await.is_none());
        assert!(held.lock().await.is_closed());
    }
}
