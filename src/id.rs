//! Timestamp and suffix helpers for Stagehand
//!
//! Workspace directories must be unique per task attempt, so suffixes mix a
//! caller-supplied seed with the current time and a process-wide counter.

use chrono::Utc;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU32, Ordering};

static COUNTER: AtomicU32 = AtomicU32::new(0);

/// Get current time in milliseconds since epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Generate an 8-char hex suffix unique to this seed/instant/call.
///
/// Format: first 8 hex chars of `sha256(seed + timestamp + counter)`.
/// Example: `a3f1c09b`
pub fn unique_suffix(seed: &str) -> String {
    let counter = COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(now_ms().to_le_bytes());
    hasher.update(counter.to_le_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..4])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ms_returns_reasonable_timestamp() {
        let ts = now_ms();
        // Should be after 2020-01-01 and before 2100-01-01
        assert!(ts > 1577836800000);
        assert!(ts < 4102444800000);
    }

    #[test]
    fn test_unique_suffix_format() {
        let suffix = unique_suffix("task-1");
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_unique_suffix_uniqueness() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            let suffix = unique_suffix("task-1");
            assert!(seen.insert(suffix), "generated duplicate suffix");
        }
    }

    #[test]
    fn test_unique_suffix_differs_across_seeds() {
        // Same instant, different seeds: the digest input differs by seed
        // and counter, so collisions here would indicate a broken hash.
        assert_ne!(unique_suffix("task-1"), unique_suffix("task-2"));
    }
}
