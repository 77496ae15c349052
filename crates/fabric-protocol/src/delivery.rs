use std::collections::HashMap;

use crate::constants::DEFAULT_DUPLICATE_WINDOW_SECS;

/// Rolling record of visited markers seen by one node.
/// A marker seen again within the window is a re-delivery of the same
/// flood along a cycle in the mesh. Expired entries are evicted on each check.
pub struct DeliveryLog {
    /// marker → first-seen timestamp (seconds)
    seen: HashMap<String, u64>,
    window_secs: u64,
}

impl DeliveryLog {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_DUPLICATE_WINDOW_SECS)
    }

    pub fn with_window(window_secs: u64) -> Self {
        Self { seen: HashMap::new(), window_secs }
    }

    /// Record `marker` and report whether it had already been seen.
    pub fn check_and_insert(&mut self, marker: &str) -> bool {
        self.check_and_insert_at(marker, current_timestamp_secs())
    }

    /// As [`check_and_insert`](Self::check_and_insert) with an explicit clock.
    pub fn check_and_insert_at(&mut self, marker: &str, now: u64) -> bool {
        let window = self.window_secs;
        self.seen.retain(|_, ts| now.saturating_sub(*ts) < window);

        if self.seen.contains_key(marker) {
            return true;
        }
        self.seen.insert(marker.to_string(), now);
        false
    }

    /// Returns the number of tracked markers.
    pub fn size(&self) -> usize { self.seen.len() }
}

impl Default for DeliveryLog {
    fn default() -> Self { Self::new() }
}

pub fn current_timestamp_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
