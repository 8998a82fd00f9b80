//! Resource capacity accounting.
//!
//! The scheduler reserves per-task resources before admitting work and
//! releases them on every completion, failure, and cancellation path. The
//! manager's counters are its own single-owner state behind an internal
//! lock; callers never hold this lock together with the task-table lock.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, error};

/// Per-task reservation request, sized by the active strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceRequirements {
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub disk_mb: u64,

    /// Marker-poll cadence for the monitor stage; stage default when None
    pub monitor_interval: Option<Duration>,
}

impl Default for ResourceRequirements {
    fn default() -> Self {
        Self {
            cpu_cores: 1,
            memory_mb: 512,
            disk_mb: 1024,
            monitor_interval: None,
        }
    }
}

/// Point-in-time view of free capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacitySnapshot {
    pub available_slots: usize,
    pub cpu_cores: u32,
    pub memory_mb: u64,
}

/// Capacity reporting and per-task reservations.
///
/// `acquire` returning false is not an error: admission is simply deferred
/// until capacity frees up. `release` is idempotent.
pub trait ResourceManager: Send + Sync {
    fn available_capacity(&self) -> CapacitySnapshot;

    fn acquire(&self, task_id: &str, requirements: &ResourceRequirements) -> bool;

    fn release(&self, task_id: &str);
}

/// Default fixed-pool implementation: a slot count plus CPU and memory
/// totals, decremented per grant.
pub struct FixedPoolManager {
    slots: usize,
    cpu_cores: u32,
    memory_mb: u64,
    inner: Mutex<PoolState>,
}

#[derive(Default)]
struct PoolState {
    grants: HashMap<String, ResourceRequirements>,
    used_cpu: u32,
    used_memory_mb: u64,
}

impl FixedPoolManager {
    pub fn new(slots: usize, cpu_cores: u32, memory_mb: u64) -> Self {
        Self {
            slots,
            cpu_cores,
            memory_mb,
            inner: Mutex::new(PoolState::default()),
        }
    }
}

impl ResourceManager for FixedPoolManager {
    fn available_capacity(&self) -> CapacitySnapshot {
        match self.inner.lock() {
            Ok(inner) => CapacitySnapshot {
                available_slots: self.slots.saturating_sub(inner.grants.len()),
                cpu_cores: self.cpu_cores.saturating_sub(inner.used_cpu),
                memory_mb: self.memory_mb.saturating_sub(inner.used_memory_mb),
            },
            Err(e) => {
                error!("resource pool lock poisoned: {}", e);
                CapacitySnapshot {
                    available_slots: 0,
                    cpu_cores: 0,
                    memory_mb: 0,
                }
            }
        }
    }

    fn acquire(&self, task_id: &str, requirements: &ResourceRequirements) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            error!(task_id = %task_id, "resource pool lock poisoned, deferring admission");
            return false;
        };

        if inner.grants.contains_key(task_id) {
            error!(task_id = %task_id, "acquire without matching release");
            return false;
        }

        let fits = inner.grants.len() < self.slots
            && inner.used_cpu + requirements.cpu_cores <= self.cpu_cores
            && inner.used_memory_mb + requirements.memory_mb <= self.memory_mb;
        if !fits {
            debug!(task_id = %task_id, "insufficient capacity, admission deferred");
            return false;
        }

        inner.used_cpu += requirements.cpu_cores;
        inner.used_memory_mb += requirements.memory_mb;
        inner.grants.insert(task_id.to_string(), requirements.clone());
        debug!(
            task_id = %task_id,
            cpu = requirements.cpu_cores,
            memory_mb = requirements.memory_mb,
            "resources acquired"
        );
        true
    }

    fn release(&self, task_id: &str) {
        let Ok(mut inner) = self.inner.lock() else {
            error!(task_id = %task_id, "resource pool lock poisoned during release");
            return;
        };

        if let Some(granted) = inner.grants.remove(task_id) {
            inner.used_cpu = inner.used_cpu.saturating_sub(granted.cpu_cores);
            inner.used_memory_mb = inner.used_memory_mb.saturating_sub(granted.memory_mb);
            debug!(task_id = %task_id, "resources released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool() -> FixedPoolManager {
        FixedPoolManager::new(2, 4, 2048)
    }

    #[test]
    fn test_acquire_and_release_pairing() {
        let pool = small_pool();
        let req = ResourceRequirements::default();

        assert!(pool.acquire("a", &req));
        let snapshot = pool.available_capacity();
        assert_eq!(snapshot.available_slots, 1);
        assert_eq!(snapshot.cpu_cores, 3);
        assert_eq!(snapshot.memory_mb, 1536);

        pool.release("a");
        let snapshot = pool.available_capacity();
        assert_eq!(snapshot.available_slots, 2);
        assert_eq!(snapshot.cpu_cores, 4);
        assert_eq!(snapshot.memory_mb, 2048);
    }

    #[test]
    fn test_slot_exhaustion_defers() {
        let pool = small_pool();
        let req = ResourceRequirements::default();

        assert!(pool.acquire("a", &req));
        assert!(pool.acquire("b", &req));
        assert!(!pool.acquire("c", &req));

        pool.release("a");
        assert!(pool.acquire("c", &req));
    }

    #[test]
    fn test_memory_exhaustion_defers() {
        let pool = small_pool();
        let big = ResourceRequirements {
            memory_mb: 1536,
            ..Default::default()
        };

        assert!(pool.acquire("a", &big));
        // One slot remains but not enough memory
        assert!(!pool.acquire("b", &big));
    }

    #[test]
    fn test_release_is_idempotent() {
        let pool = small_pool();
        let req = ResourceRequirements::default();

        assert!(pool.acquire("a", &req));
        pool.release("a");
        pool.release("a");

        let snapshot = pool.available_capacity();
        assert_eq!(snapshot.available_slots, 2);
        assert_eq!(snapshot.cpu_cores, 4);
    }

    #[test]
    fn test_double_acquire_rejected() {
        let pool = small_pool();
        let req = ResourceRequirements::default();

        assert!(pool.acquire("a", &req));
        assert!(!pool.acquire("a", &req));

        // The first grant is still intact
        assert_eq!(pool.available_capacity().available_slots, 1);
    }

    #[test]
    fn test_release_unknown_is_noop() {
        let pool = small_pool();
        pool.release("ghost");
        assert_eq!(pool.available_capacity().available_slots, 2);
    }
}
