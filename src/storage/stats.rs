use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Engine-wide counters. Updated lock-free from the data path; snapshotted
/// for the status endpoint.
#[derive(Debug, Default)]
pub struct EngineStats {
    pub records_appended: AtomicU64,
    pub records_committed: AtomicU64,
    pub records_lost: AtomicU64,
    pub records_dropped_backpressure: AtomicU64,
    pub loss_events: AtomicU64,
    pub chain_corruptions: AtomicU64,
    pub checksum_failures: AtomicU64,
    pub quarantined_sectors: AtomicU64,
    pub spill_sectors: AtomicU64,
    pub pagein_sectors: AtomicU64,
    pub last_error: Mutex<Option<String>>,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump(&self, counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn snapshot(&self) -> EngineCounters {
        EngineCounters {
            records_appended: self.records_appended.load(Ordering::Relaxed),
            records_committed: self.records_committed.load(Ordering::Relaxed),
            records_lost: self.records_lost.load(Ordering::Relaxed),
            records_dropped_backpressure: self
                .records_dropped_backpressure
                .load(Ordering::Relaxed),
            loss_events: self.loss_events.load(Ordering::Relaxed),
            chain_corruptions: self.chain_corruptions.load(Ordering::Relaxed),
            checksum_failures: self.checksum_failures.load(Ordering::Relaxed),
            quarantined_sectors: self.quarantined_sectors.load(Ordering::Relaxed),
            spill_sectors: self.spill_sectors.load(Ordering::Relaxed),
            pagein_sectors: self.pagein_sectors.load(Ordering::Relaxed),
            last_error: self.last_error.lock().ok().and_then(|g| g.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineCounters {
    pub records_appended: u64,
    pub records_committed: u64,
    pub records_lost: u64,
    pub records_dropped_backpressure: u64,
    pub loss_events: u64,
    pub chain_corruptions: u64,
    pub checksum_failures: u64,
    pub quarantined_sectors: u64,
    pub spill_sectors: u64,
    pub pagein_sectors: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SensorStatus {
    pub id: u32,
    pub name: String,
    pub backlog_records: u64,
    pub pending_records: u64,
    pub appended_records: u64,
    pub committed_records: u64,
    pub lost_records: u64,
    pub ram_sectors: usize,
    pub staged_sectors: usize,
    pub disk_sectors: u64,
    pub degraded: bool,
    pub recovering: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub pool_sectors_used: usize,
    pub pool_sectors_total: usize,
    pub pool_fill: f64,
    pub disk_live_bytes: u64,
    pub disk_budget_bytes: u64,
    pub sensors: Vec<SensorStatus>,
    pub counters: EngineCounters,
}
