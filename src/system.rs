//! System usage snapshots (CPU, memory, disk).
//!
//! Sampled on the housekeeping tick, cached for the `/device/usage` stream
//! and written to the time-series store.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, RwLock};
use sysinfo::{Disks, System};

#[derive(Debug, Clone, Serialize)]
pub struct UsageSnapshot {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub disk_percent: f64,
    pub disk_used_bytes: u64,
    pub disk_total_bytes: u64,
}

/// Shared cache holding the most recent snapshot.
pub type UsageCache = Arc<RwLock<Option<UsageSnapshot>>>;

pub struct UsageSampler {
    system: Mutex<System>,
    cache: UsageCache,
}

impl UsageSampler {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            cache: Arc::new(RwLock::new(None)),
        }
    }

    pub fn cache(&self) -> UsageCache {
        self.cache.clone()
    }

    /// Refresh counters and publish a new snapshot. CPU usage is averaged
    /// since the previous call, so the first sample reads near zero.
    pub fn sample(&self) -> UsageSnapshot {
        let (cpu_percent, memory_used, memory_total) = {
            let mut system = match self.system.lock() {
                Ok(s) => s,
                Err(poisoned) => poisoned.into_inner(),
            };
            system.refresh_cpu_usage();
            system.refresh_memory();
            (
                f64::from(system.global_cpu_usage()),
                system.used_memory(),
                system.total_memory(),
            )
        };

        let disks = Disks::new_with_refreshed_list();
        let (disk_total, disk_available) = disks
            .list()
            .iter()
            .fold((0u64, 0u64), |(total, avail), disk| {
                (total + disk.total_space(), avail + disk.available_space())
            });
        let disk_used = disk_total.saturating_sub(disk_available);

        let snapshot = UsageSnapshot {
            timestamp: Utc::now(),
            cpu_percent,
            memory_percent: percent(memory_used, memory_total),
            memory_used_bytes: memory_used,
            memory_total_bytes: memory_total,
            disk_percent: percent(disk_used, disk_total),
            disk_used_bytes: disk_used,
            disk_total_bytes: disk_total,
        };
        if let Ok(mut slot) = self.cache.write() {
            *slot = Some(snapshot.clone());
        }
        snapshot
    }
}

impl Default for UsageSampler {
    fn default() -> Self {
        Self::new()
    }
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 / total as f64 * 100.0
    }
}
