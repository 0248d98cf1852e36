use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;

use super::session::normalize_exam_code;

/// Transient workspace for presigned URLs of images that could not be
/// attributed to a student. Keyed by exam code, then by decoded filename so
/// a re-signed URL for the same file replaces the stale one. No expiry;
/// entries live until the client reconciles them and clears the bucket.
#[derive(Clone)]
pub(crate) struct UnknownImageCache {
    buckets: Arc<DashMap<String, HashMap<String, String>>>,
}

impl UnknownImageCache {
    pub(crate) fn new() -> Self {
        Self { buckets: Arc::new(DashMap::new()) }
    }

    pub(crate) fn save(&self, exam_code: &str, urls: &[String]) {
        let code = normalize_exam_code(exam_code);
        let mut bucket = self.buckets.entry(code).or_default();
        for url in urls {
            if let Some(filename) = decoded_filename(url) {
                bucket.insert(filename, url.clone());
            }
        }
    }

    /// Snapshot copy; safe to iterate while writers keep mutating the
    /// live bucket.
    pub(crate) fn get(&self, exam_code: &str) -> Vec<String> {
        self.buckets
            .get(&normalize_exam_code(exam_code))
            .map(|bucket| bucket.values().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn clear(&self, exam_code: &str) {
        self.buckets.remove(&normalize_exam_code(exam_code));
    }
}

/// Trailing path component of a URL, percent-decoded, with any query
/// string stripped. Presigned URLs for the same object differ only in the
/// query, so this is the stable identity of the underlying file.
pub(crate) fn decoded_filename(url: &str) -> Option<String> {
    let path = url.split('?').next()?;
    let filename = path.rsplit('/').next()?;
    if filename.is_empty() {
        return None;
    }
    match urlencoding::decode(filename) {
        Ok(decoded) => Some(decoded.into_owned()),
        Err(_) => None,
    }
}
