//! The storage engine: one explicit value owning the sector pool, the
//! per-sensor chains and the disk spool. Created at startup (after
//! recovery) and shared behind an `Arc` by producers, the uploader and the
//! controller.
//!
//! Lock order is chain lock → pool/spool locks, always. No call path takes
//! two chain locks at once.

use crate::config::Config;
use crate::error::{StoreError, StoreResult};
use crate::sensors::{SensorTable, ValueKind};
use crate::storage::chain::{ClaimToken, SensorChain};
use crate::storage::pool::SectorPool;
use crate::storage::sector::{Record, Sector};
use crate::storage::spool::{DiskSpool, RecoveryReport};
use crate::storage::stats::{EngineStats, EngineStatus, SensorStatus};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub spool_dir: PathBuf,
    pub quarantine_dir: PathBuf,
    pub pool_sector_count: usize,
    pub sector_size_bytes: usize,
    pub per_sensor_max_sectors: usize,
    pub min_resident_sectors: usize,
    pub stage_limit: usize,
    pub disk_budget_bytes: u64,
    pub keep_free_bytes: u64,
    pub soft_fill_threshold: f64,
}

impl From<&Config> for EngineConfig {
    fn from(config: &Config) -> Self {
        Self {
            spool_dir: config.spool_dir.clone(),
            quarantine_dir: config.quarantine_dir.clone(),
            pool_sector_count: config.pool_sector_count,
            sector_size_bytes: config.sector_size_bytes,
            per_sensor_max_sectors: config.per_sensor_max_sectors,
            min_resident_sectors: config.min_resident_sectors,
            stage_limit: config.stage_limit,
            disk_budget_bytes: config.disk_budget_bytes,
            keep_free_bytes: config.keep_free_bytes,
            soft_fill_threshold: config.soft_fill_threshold,
        }
    }
}

pub struct StorageEngine {
    cfg: EngineConfig,
    sensors: SensorTable,
    pool: SectorPool,
    spool: DiskSpool,
    chains: HashMap<u32, Mutex<SensorChain>>,
    stats: EngineStats,
    pressure: Notify,
    shutting_down: AtomicBool,
}

impl StorageEngine {
    /// Build the engine and run startup recovery: spool files are
    /// validated, the pool generation counter is seeded past anything the
    /// disk has seen, and chains with pending on-disk data start in the
    /// recovering state (their RAM head pages in on first peek).
    pub fn open(cfg: EngineConfig, sensors: SensorTable) -> StoreResult<(Self, RecoveryReport)> {
        let pool = SectorPool::new(cfg.pool_sector_count, cfg.sector_size_bytes);
        let (spool, report) = DiskSpool::open(
            &cfg.spool_dir,
            &cfg.quarantine_dir,
            sensors.ids(),
            cfg.sector_size_bytes,
            cfg.keep_free_bytes,
        )?;
        pool.seed_generation(report.max_generation().wrapping_add(1));

        let stats = EngineStats::new();
        let mut chains = HashMap::with_capacity(sensors.len());
        for &sensor_id in sensors.ids() {
            let descriptor = sensors
                .get(sensor_id)
                .ok_or(StoreError::UnknownSensor(sensor_id))?;
            let mut chain = SensorChain::new(
                sensor_id,
                descriptor.value_type.record_len(),
                cfg.per_sensor_max_sectors,
                cfg.min_resident_sectors,
            );
            if let Some(recovery) = report.sensors.iter().find(|s| s.sensor_id == sensor_id) {
                if recovery.disk_records > 0 {
                    chain.mark_recovered(recovery.disk_records);
                }
                if recovery.quarantined_sectors > 0 {
                    stats.bump(&stats.quarantined_sectors, recovery.quarantined_sectors);
                    stats.bump(&stats.checksum_failures, recovery.quarantined_sectors);
                    stats.bump(&stats.loss_events, recovery.quarantined_sectors);
                }
            }
            chains.insert(sensor_id, Mutex::new(chain));
        }

        tracing::info!(
            sensors = sensors.len(),
            recovered_records = report.total_records(),
            quarantined = report.total_quarantined(),
            "storage engine opened"
        );

        Ok((
            Self {
                cfg,
                sensors,
                pool,
                spool,
                chains,
                stats,
                pressure: Notify::new(),
                shutting_down: AtomicBool::new(false),
            },
            report,
        ))
    }

    pub fn sensors(&self) -> &SensorTable {
        &self.sensors
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn pool_fill(&self) -> f64 {
        self.pool.fill_ratio()
    }

    pub fn pool_capacity(&self) -> usize {
        self.pool.capacity()
    }

    pub fn disk_live_bytes(&self) -> u64 {
        self.spool.live_bytes()
    }

    pub fn disk_budget_bytes(&self) -> u64 {
        self.cfg.disk_budget_bytes
    }

    /// Controller wakeup: producers signal when the pool crosses the soft
    /// watermark or an append hits the wall.
    pub fn pressure(&self) -> &Notify {
        &self.pressure
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Producer entry point.
    pub fn append(
        &self,
        sensor_id: u32,
        timestamp_ms: u64,
        raw_value: u32,
        event_kind: u8,
    ) -> StoreResult<()> {
        if self.is_shutting_down() {
            return Err(StoreError::Dropped {
                reason: "shutting down",
            });
        }
        let descriptor = self
            .sensors
            .get(sensor_id)
            .ok_or(StoreError::UnknownSensor(sensor_id))?;
        let event_kind = match descriptor.value_type {
            ValueKind::Event => event_kind,
            _ => 0,
        };

        let mut chain = self.lock_chain(sensor_id)?;
        if chain.is_degraded() && chain.pending_records() == 0 {
            self.rebuild_chain(&mut chain);
        }
        let result = match chain.append(&self.pool, timestamp_ms, raw_value, event_kind) {
            Err(StoreError::PoolFull) => {
                // Make room from this chain alone; other chains belong to
                // the controller (we must not take a second chain lock).
                match self.spill_locked(&mut chain) {
                    Ok(true) => chain.append(&self.pool, timestamp_ms, raw_value, event_kind),
                    Ok(false) => Err(StoreError::PoolFull),
                    Err(err) => {
                        tracing::warn!(sensor_id, error = %err, "inline spill failed");
                        self.stats.record_error(err.to_string());
                        Err(StoreError::PoolFull)
                    }
                }
            }
            other => other,
        };

        match result {
            Ok(()) => {
                self.stats.bump(&self.stats.records_appended, 1);
                if self.pool.fill_ratio() >= self.cfg.soft_fill_threshold {
                    self.pressure.notify_one();
                }
                Ok(())
            }
            Err(StoreError::PoolFull) => {
                self.pressure.notify_one();
                self.stats.bump(&self.stats.records_dropped_backpressure, 1);
                Err(StoreError::Dropped {
                    reason: "sector pool exhausted",
                })
            }
            Err(err) if err.is_corruption() => {
                self.recover_corrupt_chain(&mut chain, &err);
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Read up to `max` unclaimed records, paging the on-disk head in
    /// transparently. A corrupt chain yields the records before the bad
    /// link and degrades; the rebuild runs once no claim is outstanding.
    pub fn peek(&self, sensor_id: u32, max: usize) -> StoreResult<Vec<Record>> {
        let mut chain = self.lock_chain(sensor_id)?;
        if chain.is_degraded() {
            if chain.pending_records() == 0 {
                self.rebuild_chain(&mut chain);
            } else {
                return Ok(Vec::new());
            }
        }

        while chain.staged_len() < self.cfg.stage_limit {
            let unstaged = self.unstaged_disk(&chain)?;
            if unstaged == 0 {
                break;
            }
            if !self.page_in_one(&mut chain)? {
                break;
            }
        }

        let unstaged = self.unstaged_disk(&chain)?;
        let was_degraded = chain.is_degraded();
        let records = chain.peek(&self.pool, max, unstaged)?;
        if chain.is_degraded() && !was_degraded {
            self.note_chain_corruption(chain.sensor_id());
        }
        Ok(records)
    }

    pub fn claim(&self, sensor_id: u32, count: usize) -> StoreResult<ClaimToken> {
        let mut chain = self.lock_chain(sensor_id)?;
        chain.claim(&self.pool, count)
    }

    /// The only erase path: applied exactly once per acknowledged claim.
    pub fn commit(&self, token: ClaimToken) -> StoreResult<()> {
        let sensor_id = token.sensor_id;
        let count = token.count as u64;
        let mut chain = self.lock_chain(sensor_id)?;
        let spool = &self.spool;
        match chain.commit(&self.pool, token, || spool.drop_head(sensor_id)) {
            Ok(()) => {
                self.stats.bump(&self.stats.records_committed, count);
                Ok(())
            }
            Err(err) if err.is_corruption() => {
                self.recover_corrupt_chain(&mut chain, &err);
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    pub fn rollback(&self, token: ClaimToken) -> StoreResult<()> {
        let mut chain = self.lock_chain(token.sensor_id)?;
        chain.rollback(token)
    }

    /// Records the uploader could claim, per sensor, for packet weighting.
    pub fn sensor_backlogs(&self) -> Vec<(u32, u64)> {
        self.sensors
            .ids()
            .iter()
            .filter_map(|&id| {
                let chain = self.chains.get(&id)?.lock().ok()?;
                if chain.is_degraded() {
                    return None;
                }
                let backlog = chain
                    .backlog_records()
                    .saturating_sub(chain.pending_records() as u64);
                Some((id, backlog))
            })
            .collect()
    }

    pub fn total_backlog(&self) -> u64 {
        self.sensor_backlogs().iter().map(|(_, n)| n).sum()
    }

    /// Evict the oldest evictable RAM sector of one chain. Returns false
    /// when the chain has nothing safely evictable.
    pub fn spill_chain_once(&self, sensor_id: u32) -> StoreResult<bool> {
        let mut chain = self.lock_chain(sensor_id)?;
        self.spill_locked(&mut chain)
    }

    pub fn ram_sectors(&self, sensor_id: u32) -> StoreResult<usize> {
        Ok(self.lock_chain(sensor_id)?.ram_sectors())
    }

    /// Back-pressure relief: drop the globally oldest on-disk sector,
    /// never touching claimed records. Returns the victim and records lost.
    pub fn drop_oldest_disk_sector(&self) -> StoreResult<Option<(u32, u64)>> {
        let mut victim: Option<(u32, u64)> = None;
        for &sensor_id in self.sensors.ids() {
            let chain = self.lock_chain(sensor_id)?;
            if chain.staged_len() > 0 && chain.pending_records() > 0 {
                continue;
            }
            let timestamp = if chain.staged_len() > 0 {
                chain.staged_head_first_timestamp(&self.pool).ok().flatten()
            } else if self.spool.disk_sector_count(sensor_id)? > 0 {
                self.spool.head_first_timestamp(sensor_id)?
            } else {
                None
            };
            if let Some(ts) = timestamp {
                if victim.map(|(_, best)| ts < best).unwrap_or(true) {
                    victim = Some((sensor_id, ts));
                }
            }
        }
        let Some((sensor_id, _)) = victim else {
            return Ok(None);
        };

        let mut chain = self.lock_chain(sensor_id)?;
        let lost = if chain.staged_len() > 0 {
            if chain.pending_records() > 0 {
                return Ok(None);
            }
            let lost = chain.drop_staged_head(&self.pool)? as u64;
            self.spool.drop_head(sensor_id)?;
            lost
        } else {
            let lost = self.spool.drop_head_sector(sensor_id)?;
            chain.note_disk_records_lost(lost);
            lost
        };
        self.stats.bump(&self.stats.records_lost, lost);
        self.stats.bump(&self.stats.loss_events, 1);
        tracing::warn!(sensor_id, lost, "dropped oldest on-disk sector");
        Ok(Some((sensor_id, lost)))
    }

    /// Periodic maintenance: persist sidecars and compact spool files whose
    /// dead prefix dominates.
    pub fn sync_and_compact(&self) -> StoreResult<()> {
        self.spool.flush_sidecars()?;
        for &sensor_id in self.sensors.ids() {
            self.spool.compact(sensor_id)?;
        }
        Ok(())
    }

    /// Clean-shutdown flush: every chain's sidecar reaches disk.
    pub fn flush(&self) -> StoreResult<()> {
        self.spool.flush_sidecars()
    }

    pub fn status(&self) -> EngineStatus {
        let mut sensors = Vec::with_capacity(self.sensors.len());
        for &sensor_id in self.sensors.ids() {
            let Ok(chain) = self.lock_chain(sensor_id) else {
                continue;
            };
            let disk_sectors = self.spool.disk_sector_count(sensor_id).unwrap_or(0);
            let name = self
                .sensors
                .get(sensor_id)
                .map(|d| d.name.clone())
                .unwrap_or_default();
            sensors.push(SensorStatus {
                id: sensor_id,
                name,
                backlog_records: chain.backlog_records(),
                pending_records: chain.pending_records() as u64,
                appended_records: chain.appended_records(),
                committed_records: chain.committed_records(),
                lost_records: chain.lost_records(),
                ram_sectors: chain.ram_sectors(),
                staged_sectors: chain.staged_len(),
                disk_sectors,
                degraded: chain.is_degraded(),
                recovering: chain.is_recovering(),
            });
        }
        EngineStatus {
            pool_sectors_used: self.pool.used(),
            pool_sectors_total: self.pool.capacity(),
            pool_fill: self.pool.fill_ratio(),
            disk_live_bytes: self.spool.live_bytes(),
            disk_budget_bytes: self.cfg.disk_budget_bytes,
            sensors,
            counters: self.stats.snapshot(),
        }
    }

    fn lock_chain(&self, sensor_id: u32) -> StoreResult<MutexGuard<'_, SensorChain>> {
        self.chains
            .get(&sensor_id)
            .map(|slot| slot.lock().expect("chain lock poisoned"))
            .ok_or(StoreError::UnknownSensor(sensor_id))
    }

    fn unstaged_disk(&self, chain: &SensorChain) -> StoreResult<u64> {
        let total = self.spool.disk_sector_count(chain.sensor_id())?;
        Ok(total.saturating_sub(chain.staged_len() as u64))
    }

    /// Spill this chain's evictable head, if any. Called with the chain
    /// lock held; the sector write is the longest I/O performed under it.
    fn spill_locked(&self, chain: &mut SensorChain) -> StoreResult<bool> {
        let sensor_id = chain.sensor_id();
        let unstaged = self.unstaged_disk(chain)?;
        if chain.evictable_head(&self.pool, unstaged)?.is_none() {
            return Ok(false);
        }
        let (href, bytes) = chain.snapshot_head_for_spill(&self.pool)?;
        self.spool.spill(sensor_id, &bytes, href.generation)?;
        chain.unlink_head_after_spill(&self.pool)?;
        self.stats.bump(&self.stats.spill_sectors, 1);
        tracing::trace!(sensor_id, sector = href.id, "spilled sector to disk");
        Ok(true)
    }

    /// Page the oldest unstaged on-disk sector into RAM. Returns false when
    /// nothing could be staged right now (pool full, or a corrupt sector
    /// that is not yet at the physical head).
    fn page_in_one(&self, chain: &mut SensorChain) -> StoreResult<bool> {
        let sensor_id = chain.sensor_id();
        let index = chain.staged_len() as u64;
        let bytes = self.spool.read_sector(sensor_id, index)?;
        let decoded = match Sector::decode(&bytes, sensor_id, index) {
            Ok(decoded) if decoded.sensor_id == sensor_id => Some(decoded),
            _ => None,
        };

        let Some(decoded) = decoded else {
            self.stats.bump(&self.stats.checksum_failures, 1);
            if index > 0 {
                // Not at the physical head yet; commits will drain the
                // staged prefix and expose it for quarantine.
                return Ok(false);
            }
            let lost = self.spool.quarantine_head(sensor_id, "checksum mismatch on page-in")?;
            chain.note_disk_records_lost(lost);
            self.stats.bump(&self.stats.quarantined_sectors, 1);
            self.stats.bump(&self.stats.loss_events, 1);
            self.stats.bump(&self.stats.records_lost, lost);
            return Ok(true);
        };

        let sref = match self.pool.allocate(sensor_id, chain.record_len()) {
            Ok(sref) => sref,
            Err(StoreError::PoolFull) => {
                self.pressure.notify_one();
                return Ok(false);
            }
            Err(err) => return Err(err),
        };
        if let Err(err) = self.pool.with_sector(sref, |s| s.adopt(&decoded)) {
            let _ = self.pool.free(sref.id);
            return Err(err);
        }
        chain.push_staged(sref);
        self.stats.bump(&self.stats.pagein_sectors, 1);
        Ok(true)
    }

    fn note_chain_corruption(&self, sensor_id: u32) {
        self.stats.bump(&self.stats.chain_corruptions, 1);
        self.stats
            .record_error(format!("chain corruption on sensor {sensor_id}"));
        tracing::error!(sensor_id, "chain corruption detected; sensor degraded");
    }

    /// Chain corruption is non-fatal for other sensors: reclaim this
    /// sensor's pool slots, rebuild the chain from its on-disk state and
    /// count what the RAM side lost.
    fn recover_corrupt_chain(&self, chain: &mut SensorChain, err: &StoreError) {
        chain.mark_degraded();
        self.note_chain_corruption(chain.sensor_id());
        self.stats.record_error(err.to_string());
        self.rebuild_chain(chain);
    }

    fn rebuild_chain(&self, chain: &mut SensorChain) {
        let sensor_id = chain.sensor_id();
        let reclaimed = self.pool.sweep_sensor(sensor_id);
        let disk_records = self.count_disk_records(sensor_id);
        let lost = chain.rebuild_from_disk(disk_records);
        if lost > 0 {
            self.stats.bump(&self.stats.records_lost, lost);
            self.stats.bump(&self.stats.loss_events, 1);
        }
        tracing::warn!(
            sensor_id,
            reclaimed_sectors = reclaimed,
            disk_records,
            lost,
            "chain rebuilt from on-disk state"
        );
    }

    /// Corrupt the head sector's forward link of a chain, for the
    /// corruption scenario tests.
    #[cfg(test)]
    pub(crate) fn sabotage_head_link_for_tests(&self, sensor_id: u32) {
        if let Ok(chain) = self.lock_chain(sensor_id) {
            chain.sabotage_head_link(&self.pool);
        }
    }

    fn count_disk_records(&self, sensor_id: u32) -> u64 {
        let Ok(total) = self.spool.disk_sector_count(sensor_id) else {
            return 0;
        };
        let mut records = 0u64;
        for index in 0..total {
            let Ok(bytes) = self.spool.read_sector(sensor_id, index) else {
                continue;
            };
            if let Ok(sector) = Sector::decode(&bytes, sensor_id, index) {
                if sector.sensor_id == sensor_id {
                    records += sector.record_count as u64;
                }
            }
        }
        records
    }
}
