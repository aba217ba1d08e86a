use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use vocario_core::config::MAX_DEDUP_WINDOW_SECS;

/// Remembers provider message ids for a sliding window so webhook retries are processed once.
pub struct MessageDeduplicator {
    window: Duration,
    seen: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl MessageDeduplicator {
    /// Windows longer than [`MAX_DEDUP_WINDOW_SECS`] are shortened to it.
    pub fn new(window_secs: u64) -> Self {
        let window = i64::try_from(window_secs.min(MAX_DEDUP_WINDOW_SECS)).unwrap_or(86_400);
        Self { window: Duration::seconds(window), seen: Mutex::new(HashMap::new()) }
    }

    /// Records `sid` and returns `true` the first time it is seen inside the window.
    pub async fn first_seen(&self, sid: &str, now: DateTime<Utc>) -> bool {
        let mut seen = self.seen.lock().await;
        seen.retain(|_, at| now.signed_duration_since(*at) <= self.window);
        if seen.contains_key(sid) {
            return false;
        }
        seen.insert(sid.to_owned(), now);
        true
    }

    /// Drops `sid` so a provider retry of a message that failed is processed again.
    pub async fn forget(&self, sid: &str) {
        self.seen.lock().await.remove(sid);
    }

    pub async fn tracked(&self) -> usize {
        self.seen.lock().await.len()
    }
}
