use std::collections::HashSet;

use serde::Serialize;
use time::PrimitiveDateTime;

use crate::core::time::{format_primitive, primitive_now_utc};

/// Exam codes arrive from several producers with inconsistent casing and
/// stray whitespace; every map key goes through this first.
pub(crate) fn normalize_exam_code(raw: &str) -> String {
    raw.trim().to_uppercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum SessionStatus {
    Processing,
    Completed,
    Error,
}

impl SessionStatus {
    pub(crate) fn parse(value: &str) -> Self {
        match value {
            "completed" => SessionStatus::Completed,
            "error" => SessionStatus::Error,
            _ => SessionStatus::Processing,
        }
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Processing => "processing",
            SessionStatus::Completed => "completed",
            SessionStatus::Error => "error",
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Error)
    }
}

/// Authoritative progress record for one exam code. Owned by the registry;
/// mutated only behind the registry's per-session lock.
#[derive(Debug)]
pub(crate) struct Session {
    exam_code: String,
    exam_name: String,
    total: u32,
    processed_keys: HashSet<String>,
    status: SessionStatus,
    last_update_time: PrimitiveDateTime,
    closed: bool,
}

impl Session {
    pub(crate) fn new(exam_code: String, exam_name: String, total: u32) -> Self {
        Self {
            exam_code,
            exam_name,
            total,
            processed_keys: HashSet::new(),
            status: SessionStatus::Processing,
            last_update_time: primitive_now_utc(),
            closed: false,
        }
    }

    pub(crate) fn exam_code(&self) -> &str {
        &self.exam_code
    }

    pub(crate) fn total(&self) -> u32 {
        self.total
    }

    pub(crate) fn status(&self) -> SessionStatus {
        self.status
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    /// Invalidates the session so an in-flight aggregation that still holds
    /// the `Arc` observes removal instead of resurrecting the entry.
    pub(crate) fn close(&mut self) {
        self.closed = true;
    }

    pub(crate) fn processed_count(&self) -> u32 {
        self.processed_keys.len() as u32
    }

    /// Progress as reported to clients: the dedup-ledger size, clamped to
    /// `total` when a total is known. The ledger itself is never truncated.
    pub(crate) fn reported_index(&self) -> u32 {
        let count = self.processed_count();
        if self.total > 0 && count > self.total {
            self.total
        } else {
            count
        }
    }

    /// Records a processed item identifier. Returns false for a duplicate,
    /// in which case nothing about the session changed.
    pub(crate) fn record_key(&mut self, filename: &str) -> bool {
        self.processed_keys.insert(filename.to_string())
    }

    /// Totals are discovered progressively by the producer; a positive value
    /// replaces whatever was stored, zero or absent keeps the old one.
    pub(crate) fn set_total_if_positive(&mut self, total: Option<u32>) {
        if let Some(total) = total.filter(|value| *value > 0) {
            self.total = total;
        }
    }

    /// Applies the producer's claimed status, overriding to `Completed` when
    /// the ledger has caught up with a known total. A terminal status never
    /// reverts to `Processing`; only an explicit error can supersede it.
    pub(crate) fn resolve_status(&mut self, claimed: Option<SessionStatus>) {
        let mut next = claimed.unwrap_or(SessionStatus::Processing);
        if self.total > 0 && self.processed_count() >= self.total {
            next = SessionStatus::Completed;
        }
        if self.status.is_terminal() && next == SessionStatus::Processing {
            return;
        }
        self.status = next;
    }

    pub(crate) fn touch(&mut self) {
        self.last_update_time = primitive_now_utc();
    }

    pub(crate) fn last_update_time(&self) -> PrimitiveDateTime {
        self.last_update_time
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            exam_code: self.exam_code.clone(),
            exam_name: self.exam_name.clone(),
            index: self.reported_index(),
            total: self.total,
            status: self.status,
            last_update_time: format_primitive(self.last_update_time),
        }
    }
}

/// Read-only copy handed to API readers and folded into broadcast payloads.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SessionSnapshot {
    pub(crate) exam_code: String,
    pub(crate) exam_name: String,
    pub(crate) index: u32,
    pub(crate) total: u32,
    pub(crate) status: SessionStatus,
    pub(crate) last_update_time: String,
}
