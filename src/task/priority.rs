//! Named priority bands.
//!
//! Priorities are plain integers; higher is more urgent. The bands are used
//! for display, for the Priority strategy's reserved-capacity threshold, and
//! for the aging-boost ceiling. They never gate admission by themselves.

/// Must-run-now work, also the aging-boost ceiling
pub const PRIORITY_CRITICAL: i64 = 10;

/// Threshold for reserved capacity under the Priority strategy
pub const PRIORITY_HIGH: i64 = 8;

/// Default band for unclassified issues
pub const PRIORITY_MEDIUM: i64 = 5;

/// Background work
pub const PRIORITY_LOW: i64 = 2;

/// Run only when nothing else is waiting
pub const PRIORITY_DEFERRED: i64 = 0;

/// Band name for a numeric priority, by threshold.
pub fn priority_name(priority: i64) -> &'static str {
    if priority >= PRIORITY_CRITICAL {
        "critical"
    } else if priority >= PRIORITY_HIGH {
        "high"
    } else if priority >= PRIORITY_MEDIUM {
        "medium"
    } else if priority >= PRIORITY_LOW {
        "low"
    } else {
        "deferred"
    }
}
