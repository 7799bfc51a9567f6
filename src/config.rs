use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub gateway_name: String,
    pub http_bind: String,
    pub uplink_endpoint: String,
    pub sensor_table_path: PathBuf,
    pub spool_dir: PathBuf,
    pub quarantine_dir: PathBuf,

    pub pool_sector_count: usize,
    pub sector_size_bytes: usize,
    pub soft_fill_threshold: f64,
    pub hard_fill_threshold: f64,
    pub spill_target_fill: f64,
    pub drop_fill_threshold: f64,
    pub drop_pressure_window: Duration,
    pub per_sensor_max_sectors: usize,
    pub min_resident_sectors: usize,
    pub stage_limit: usize,
    pub disk_budget_bytes: u64,
    pub keep_free_bytes: u64,

    pub upload_packet_budget_bytes: usize,
    pub upload_request_timeout: Duration,
    pub retry_budget_per_sensor: u32,
    pub mute_cooldown: Duration,
    pub min_batch_records: u64,
    pub uploader_poll_interval: Duration,
    pub controller_tick_interval: Duration,
    pub sidecar_sync_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let gateway_name = env_string("GATEWAY_NAME", Some("telematics-gw".to_string()))?;
        let http_bind = env_string("GATEWAY_HTTP_BIND", Some("127.0.0.1:9208".to_string()))?;
        let uplink_endpoint = env_string(
            "GATEWAY_UPLINK_ENDPOINT",
            Some("http://127.0.0.1:9209/v1/ingest".to_string()),
        )?;
        let sensor_table_path = PathBuf::from(env_string(
            "GATEWAY_SENSOR_TABLE",
            Some("/opt/telematics/etc/sensors.json".to_string()),
        )?);
        let spool_dir = PathBuf::from(env_string(
            "GATEWAY_SPOOL_DIR",
            Some("/opt/telematics/storage/spool".to_string()),
        )?);
        let quarantine_dir = match env_optional("GATEWAY_QUARANTINE_DIR") {
            Some(raw) => PathBuf::from(raw),
            None => spool_dir.join("quarantine"),
        };

        let pool_sector_count = env_u64("GATEWAY_POOL_SECTOR_COUNT", Some(4096))? as usize;
        let sector_size_bytes = env_u64("GATEWAY_SECTOR_SIZE_BYTES", Some(512))? as usize;
        let soft_fill_threshold = env_f64("GATEWAY_SOFT_FILL_THRESHOLD", Some(0.70))?;
        let hard_fill_threshold = env_f64("GATEWAY_HARD_FILL_THRESHOLD", Some(0.80))?;
        let spill_target_fill = env_f64("GATEWAY_SPILL_TARGET_FILL", Some(0.60))?;
        let drop_fill_threshold = env_f64("GATEWAY_DROP_FILL_THRESHOLD", Some(0.90))?;
        let drop_pressure_window =
            Duration::from_millis(env_u64("GATEWAY_DROP_PRESSURE_WINDOW_MS", Some(30_000))?);
        let per_sensor_max_sectors =
            env_u64("GATEWAY_PER_SENSOR_MAX_SECTORS", Some(256))? as usize;
        let min_resident_sectors = env_u64("GATEWAY_MIN_RESIDENT_SECTORS", Some(2))? as usize;
        let stage_limit = env_u64("GATEWAY_STAGE_LIMIT", Some(4))? as usize;
        let disk_budget_bytes =
            env_u64("GATEWAY_DISK_BUDGET_BYTES", Some(256 * 1024 * 1024))?;
        let keep_free_bytes = env_u64("GATEWAY_KEEP_FREE_BYTES", Some(64 * 1024 * 1024))?;

        let upload_packet_budget_bytes =
            env_u64("GATEWAY_UPLOAD_PACKET_BUDGET_BYTES", Some(16 * 1024))? as usize;
        let upload_request_timeout =
            Duration::from_millis(env_u64("GATEWAY_UPLOAD_REQUEST_TIMEOUT_MS", Some(10_000))?);
        let retry_budget_per_sensor =
            env_u64("GATEWAY_RETRY_BUDGET_PER_SENSOR", Some(5))? as u32;
        let mute_cooldown =
            Duration::from_millis(env_u64("GATEWAY_MUTE_COOLDOWN_MS", Some(30_000))?);
        let min_batch_records = env_u64("GATEWAY_MIN_BATCH_RECORDS", Some(32))?;
        let uploader_poll_interval =
            Duration::from_millis(env_u64("GATEWAY_UPLOADER_POLL_MS", Some(250))?);
        let controller_tick_interval =
            Duration::from_millis(env_u64("GATEWAY_CONTROLLER_TICK_MS", Some(200))?);
        let sidecar_sync_interval =
            Duration::from_millis(env_u64("GATEWAY_SIDECAR_SYNC_MS", Some(5_000))?);

        let config = Self {
            gateway_name,
            http_bind,
            uplink_endpoint,
            sensor_table_path,
            spool_dir,
            quarantine_dir,
            pool_sector_count,
            sector_size_bytes,
            soft_fill_threshold,
            hard_fill_threshold,
            spill_target_fill,
            drop_fill_threshold,
            drop_pressure_window,
            per_sensor_max_sectors,
            min_resident_sectors,
            stage_limit,
            disk_budget_bytes,
            keep_free_bytes,
            upload_packet_budget_bytes,
            upload_request_timeout,
            retry_budget_per_sensor,
            mute_cooldown,
            min_batch_records,
            uploader_poll_interval,
            controller_tick_interval,
            sidecar_sync_interval,
        };
        config.validate()?;
        Ok(config)
    }

    /// Startup-time sanity checks. A config that fails here refuses to run.
    pub fn validate(&self) -> Result<()> {
        if self.pool_sector_count < 8 {
            bail!("pool_sector_count must be at least 8");
        }
        // 16 is the largest record size (event sensors); a multiple of it
        // packs every sensor type without stranding payload bytes.
        if self.sector_size_bytes < 64 || self.sector_size_bytes % 16 != 0 {
            bail!("sector_size_bytes must be >= 64 and a multiple of 16");
        }
        if !(0.0 < self.spill_target_fill
            && self.spill_target_fill < self.soft_fill_threshold
            && self.soft_fill_threshold < self.hard_fill_threshold
            && self.hard_fill_threshold < self.drop_fill_threshold
            && self.drop_fill_threshold <= 1.0)
        {
            bail!(
                "fill thresholds must satisfy 0 < target {} < soft {} < hard {} < drop {} <= 1",
                self.spill_target_fill,
                self.soft_fill_threshold,
                self.hard_fill_threshold,
                self.drop_fill_threshold
            );
        }
        if self.per_sensor_max_sectors == 0 {
            bail!("per_sensor_max_sectors must be positive");
        }
        if self.stage_limit == 0 {
            bail!("stage_limit must be positive");
        }
        if self.min_resident_sectors < 1 {
            bail!("min_resident_sectors must be at least 1");
        }
        if self.upload_packet_budget_bytes < 64 {
            bail!("upload_packet_budget_bytes must be at least 64");
        }
        if self.upload_request_timeout.is_zero() {
            bail!("upload_request_timeout_ms must be positive");
        }
        Ok(())
    }
}

fn env_string(key: &str, default: Option<String>) -> Result<String> {
    match env::var(key) {
        Ok(value) => Ok(value.trim().to_string()),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_u64(key: &str, default: Option<u64>) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_f64(key: &str, default: Option<f64>) -> Result<f64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<f64>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config {
            gateway_name: "gw-test".to_string(),
            http_bind: "127.0.0.1:0".to_string(),
            uplink_endpoint: "http://127.0.0.1:0/v1/ingest".to_string(),
            sensor_table_path: PathBuf::from("sensors.json"),
            spool_dir: PathBuf::from("spool"),
            quarantine_dir: PathBuf::from("spool/quarantine"),
            pool_sector_count: 64,
            sector_size_bytes: 256,
            soft_fill_threshold: 0.70,
            hard_fill_threshold: 0.80,
            spill_target_fill: 0.60,
            drop_fill_threshold: 0.90,
            drop_pressure_window: Duration::from_secs(30),
            per_sensor_max_sectors: 256,
            min_resident_sectors: 2,
            stage_limit: 4,
            disk_budget_bytes: 1024 * 1024,
            keep_free_bytes: 0,
            upload_packet_budget_bytes: 4096,
            upload_request_timeout: Duration::from_secs(10),
            retry_budget_per_sensor: 5,
            mute_cooldown: Duration::from_secs(30),
            min_batch_records: 1,
            uploader_poll_interval: Duration::from_millis(250),
            controller_tick_interval: Duration::from_millis(200),
            sidecar_sync_interval: Duration::from_secs(5),
        }
    }

    #[test]
    fn accepts_defaults() {
        base().validate().unwrap();
    }

    #[test]
    fn rejects_misordered_thresholds() {
        let mut config = base();
        config.soft_fill_threshold = 0.85;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_tiny_sectors() {
        let mut config = base();
        config.sector_size_bytes = 32;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_sector_size_that_strands_payload_bytes() {
        let mut config = base();
        // 500 % 16 != 0: event records would leave unusable tail bytes.
        config.sector_size_bytes = 500;
        assert!(config.validate().is_err());
    }
}
