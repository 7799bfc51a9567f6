//! Tiered-storage controller: watches pool pressure, decides when chains
//! spill to disk, relieves sustained back-pressure by dropping the oldest
//! on-disk sectors, and runs the periodic sidecar sync + compaction pass.
//!
//! The per-chain state machine (RAM-only → mixed → disk-heavy → drained) is
//! implicit in the ratio of RAM to disk sectors; the controller only ever
//! acts on one chain lock at a time.

use crate::config::Config;
use crate::error::StoreResult;
use crate::platform;
use crate::storage::engine::StorageEngine;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub soft_fill_threshold: f64,
    pub hard_fill_threshold: f64,
    pub spill_target_fill: f64,
    pub drop_fill_threshold: f64,
    pub drop_pressure_window: Duration,
    pub tick_interval: Duration,
    pub sidecar_sync_interval: Duration,
    pub disk_budget_bytes: u64,
}

impl From<&Config> for ControllerConfig {
    fn from(config: &Config) -> Self {
        Self {
            soft_fill_threshold: config.soft_fill_threshold,
            hard_fill_threshold: config.hard_fill_threshold,
            spill_target_fill: config.spill_target_fill,
            drop_fill_threshold: config.drop_fill_threshold,
            drop_pressure_window: config.drop_pressure_window,
            tick_interval: config.controller_tick_interval,
            sidecar_sync_interval: config.sidecar_sync_interval,
            disk_budget_bytes: config.disk_budget_bytes,
        }
    }
}

/// Pressure episode: when the pool stays past the drop threshold and the
/// uploader makes no commit progress for the whole window, data starts
/// falling off the old end of the disk.
struct PressureEpisode {
    since_ms: u64,
    committed_at_start: u64,
}

pub async fn run_controller(engine: Arc<StorageEngine>, cfg: ControllerConfig) {
    let mut ticker = tokio::time::interval(cfg.tick_interval);
    let mut episode: Option<PressureEpisode> = None;
    let mut last_sync_ms = platform::monotonic_ms();
    let sync_interval_ms = cfg.sidecar_sync_interval.as_millis() as u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = engine.pressure().notified() => {}
        }
        if engine.is_shutting_down() {
            break;
        }

        if let Err(err) = run_tick(&engine, &cfg, &mut episode) {
            engine.stats().record_error(err.to_string());
            tracing::warn!(error = %err, "controller tick failed");
        }

        let now_ms = platform::monotonic_ms();
        if now_ms.saturating_sub(last_sync_ms) >= sync_interval_ms {
            if let Err(err) = engine.sync_and_compact() {
                tracing::warn!(error = %err, "sidecar sync failed");
            }
            last_sync_ms = platform::monotonic_ms();
        }
    }
    tracing::info!("controller exiting");
}

fn run_tick(
    engine: &StorageEngine,
    cfg: &ControllerConfig,
    episode: &mut Option<PressureEpisode>,
) -> StoreResult<()> {
    let fill = engine.pool_fill();
    if fill >= cfg.hard_fill_threshold {
        let spilled = spill_until(engine, cfg.spill_target_fill)?;
        tracing::debug!(fill, spilled, "hard threshold spill pass");
    } else if fill >= cfg.soft_fill_threshold {
        let spilled = spill_fair_share(engine)?;
        if spilled > 0 {
            tracing::debug!(fill, spilled, "soft threshold spill pass");
        }
    }

    relieve_pressure(engine, cfg, episode)?;
    enforce_disk_budget(engine, cfg)?;
    Ok(())
}

/// Soft-threshold policy: chains holding more RAM sectors than their fair
/// share of the pool give sectors back, oldest first.
pub fn spill_fair_share(engine: &StorageEngine) -> StoreResult<usize> {
    let sensors = engine.sensors().ids().to_vec();
    if sensors.is_empty() {
        return Ok(0);
    }
    let fair_share = (engine.pool_capacity() / sensors.len()).max(1);
    let mut spilled = 0;
    for sensor_id in sensors {
        while engine.ram_sectors(sensor_id)? > fair_share {
            if !engine.spill_chain_once(sensor_id)? {
                break;
            }
            spilled += 1;
        }
    }
    Ok(spilled)
}

/// Hard-threshold policy: spill round-robin across every chain until the
/// pool drops to the target fill or nothing more can move.
pub fn spill_until(engine: &StorageEngine, target_fill: f64) -> StoreResult<usize> {
    let sensors = engine.sensors().ids().to_vec();
    let mut spilled = 0;
    loop {
        if engine.pool_fill() <= target_fill {
            break;
        }
        let mut progress = false;
        for &sensor_id in &sensors {
            if engine.pool_fill() <= target_fill {
                break;
            }
            if engine.spill_chain_once(sensor_id)? {
                spilled += 1;
                progress = true;
            }
        }
        if !progress {
            break;
        }
    }
    Ok(spilled)
}

fn relieve_pressure(
    engine: &StorageEngine,
    cfg: &ControllerConfig,
    episode: &mut Option<PressureEpisode>,
) -> StoreResult<()> {
    let fill = engine.pool_fill();
    if fill < cfg.drop_fill_threshold {
        *episode = None;
        return Ok(());
    }

    let committed = engine
        .stats()
        .records_committed
        .load(Ordering::Relaxed);
    let now_ms = platform::monotonic_ms();
    match episode {
        None => {
            *episode = Some(PressureEpisode {
                since_ms: now_ms,
                committed_at_start: committed,
            });
        }
        Some(state) => {
            if committed != state.committed_at_start {
                // The uploader is draining; restart the window.
                state.since_ms = now_ms;
                state.committed_at_start = committed;
            } else if now_ms.saturating_sub(state.since_ms)
                >= cfg.drop_pressure_window.as_millis() as u64
            {
                if let Some((sensor_id, lost)) = engine.drop_oldest_disk_sector()? {
                    tracing::warn!(
                        sensor_id,
                        lost,
                        fill,
                        "sustained back-pressure; dropped oldest on-disk sector"
                    );
                }
                state.since_ms = now_ms;
                state.committed_at_start = committed;
            }
        }
    }
    Ok(())
}

fn enforce_disk_budget(engine: &StorageEngine, cfg: &ControllerConfig) -> StoreResult<()> {
    let mut guard = 0;
    while engine.disk_live_bytes() > cfg.disk_budget_bytes && guard < 64 {
        if engine.drop_oldest_disk_sector()?.is_none() {
            break;
        }
        guard += 1;
    }
    Ok(())
}
