//! Upload coordinator: drains sensor chains into size-bounded packets,
//! claims exactly what each packet carries, and reconciles storage with the
//! server's verdict. A positive acknowledgement is the only code path that
//! erases data; rejects, timeouts and malformed responses all roll the
//! claims back. At most one packet is in flight at any time.

use crate::config::Config;
use crate::platform;
use crate::storage::chain::ClaimToken;
use crate::storage::engine::StorageEngine;
use crate::transport::{
    decode_response, encode_packet, PacketGroup, Transport, UplinkStatus, PACKET_PREFIX_LEN,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct UplinkConfig {
    pub packet_budget_bytes: usize,
    pub request_timeout: Duration,
    pub retry_budget_per_sensor: u32,
    pub mute_cooldown: Duration,
    pub min_batch_records: u64,
    pub poll_interval: Duration,
    pub state_path: PathBuf,
}

impl From<&Config> for UplinkConfig {
    fn from(config: &Config) -> Self {
        Self {
            packet_budget_bytes: config.upload_packet_budget_bytes,
            request_timeout: config.upload_request_timeout,
            retry_budget_per_sensor: config.retry_budget_per_sensor,
            mute_cooldown: config.mute_cooldown,
            min_batch_records: config.min_batch_records,
            poll_interval: config.uploader_poll_interval,
            state_path: config.spool_dir.join("gateway.json"),
        }
    }
}

/// Uplink counters, shared with the status endpoint.
#[derive(Debug, Default)]
pub struct UplinkStats {
    pub packets_sent: AtomicU64,
    pub packets_acked: AtomicU64,
    pub packets_rejected: AtomicU64,
    pub packets_server_error: AtomicU64,
    pub packets_timed_out: AtomicU64,
    pub packets_malformed: AtomicU64,
    pub next_sequence: AtomicU64,
    pub muted_sensors: AtomicU64,
    pub gateway_id: Mutex<String>,
    pub last_error: Mutex<Option<String>>,
}

impl UplinkStats {
    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn snapshot(&self) -> UplinkCounters {
        UplinkCounters {
            gateway_id: self.gateway_id.lock().map(|g| g.clone()).unwrap_or_default(),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_acked: self.packets_acked.load(Ordering::Relaxed),
            packets_rejected: self.packets_rejected.load(Ordering::Relaxed),
            packets_server_error: self.packets_server_error.load(Ordering::Relaxed),
            packets_timed_out: self.packets_timed_out.load(Ordering::Relaxed),
            packets_malformed: self.packets_malformed.load(Ordering::Relaxed),
            next_sequence: self.next_sequence.load(Ordering::Relaxed),
            muted_sensors: self.muted_sensors.load(Ordering::Relaxed),
            last_error: self.last_error.lock().ok().and_then(|g| g.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UplinkCounters {
    pub gateway_id: String,
    pub packets_sent: u64,
    pub packets_acked: u64,
    pub packets_rejected: u64,
    pub packets_server_error: u64,
    pub packets_timed_out: u64,
    pub packets_malformed: u64,
    pub next_sequence: u64,
    pub muted_sensors: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GatewayStateDisk {
    gateway_id: String,
    next_sequence: u64,
}

fn load_or_init_gateway_state(path: &PathBuf) -> Result<(Uuid, u64)> {
    if path.exists() {
        let raw = std::fs::read_to_string(path).context("read gateway state")?;
        let parsed: GatewayStateDisk = serde_json::from_str(&raw).context("parse gateway state")?;
        let gateway_id = Uuid::parse_str(parsed.gateway_id.trim()).context("invalid gateway_id")?;
        return Ok((gateway_id, parsed.next_sequence));
    }
    Ok((Uuid::new_v4(), 1))
}

#[derive(Debug, Default)]
struct SensorFailure {
    consecutive: u32,
    /// Monotonic deadline past which the sensor may be retried.
    muted_until_ms: Option<u64>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing claimable right now.
    Idle,
    /// Packet acknowledged and committed.
    Committed(usize),
    /// Packet failed; claims rolled back.
    RolledBack,
}

pub struct UploadCoordinator {
    engine: Arc<StorageEngine>,
    transport: Arc<dyn Transport>,
    cfg: UplinkConfig,
    stats: Arc<UplinkStats>,
    gateway_id: Uuid,
    next_sequence: u64,
    failures: HashMap<u32, SensorFailure>,
    round: usize,
}

impl UploadCoordinator {
    pub fn new(
        engine: Arc<StorageEngine>,
        transport: Arc<dyn Transport>,
        cfg: UplinkConfig,
    ) -> Result<Self> {
        let (gateway_id, next_sequence) = load_or_init_gateway_state(&cfg.state_path)?;
        let stats = Arc::new(UplinkStats::default());
        if let Ok(mut guard) = stats.gateway_id.lock() {
            *guard = gateway_id.to_string();
        }
        stats.next_sequence.store(next_sequence, Ordering::Relaxed);
        Ok(Self {
            engine,
            transport,
            cfg,
            stats,
            gateway_id,
            next_sequence,
            failures: HashMap::new(),
            round: 0,
        })
    }

    pub fn stats(&self) -> Arc<UplinkStats> {
        self.stats.clone()
    }

    pub async fn run(mut self) {
        loop {
            if self.engine.is_shutting_down() {
                break;
            }
            let backlog = self.engine.total_backlog();
            if backlog == 0 {
                sleep(self.cfg.poll_interval).await;
                continue;
            }
            if backlog < self.cfg.min_batch_records {
                // Small backlog drains at poll cadence instead of per-sample.
                sleep(self.cfg.poll_interval).await;
                if self.engine.is_shutting_down() {
                    break;
                }
            }
            match self.run_cycle().await {
                Ok(CycleOutcome::Committed(_)) => {}
                Ok(_) => sleep(self.cfg.poll_interval).await,
                Err(err) => {
                    self.stats.record_error(err.to_string());
                    tracing::warn!(error = %err, "upload cycle failed");
                    sleep(self.cfg.poll_interval).await;
                }
            }
        }
        if let Err(err) = self.persist_state() {
            tracing::warn!(error = %err, "failed to persist gateway state at shutdown");
        }
        tracing::info!("upload coordinator exiting");
    }

    /// Assemble one packet, send it, resolve the claims.
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome> {
        let (groups, tokens) = self.assemble_packet()?;
        if groups.is_empty() {
            return Ok(CycleOutcome::Idle);
        }
        let record_total: usize = groups.iter().map(|g| g.records.len()).sum();
        let sequence_no = self.next_sequence;
        let packet = encode_packet(&self.gateway_id, sequence_no, &groups);
        self.next_sequence += 1;
        self.stats
            .next_sequence
            .store(self.next_sequence, Ordering::Relaxed);
        if let Err(err) = self.persist_state() {
            tracing::debug!(error = %err, "failed to persist gateway state");
        }

        self.stats.packets_sent.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            sequence_no,
            sensors = groups.len(),
            records = record_total,
            bytes = packet.len(),
            "sending upload packet"
        );

        let sensor_ids: Vec<u32> = groups.iter().map(|g| g.sensor_id).collect();
        let result = tokio::time::timeout(self.cfg.request_timeout, self.transport.send(packet)).await;

        match result {
            Ok(Ok(bytes)) => match decode_response(&bytes) {
                Ok(response) if response.sequence_no == sequence_no => match response.status {
                    UplinkStatus::Ok => {
                        self.commit_all(tokens);
                        self.note_success(&sensor_ids);
                        self.stats.packets_acked.fetch_add(1, Ordering::Relaxed);
                        Ok(CycleOutcome::Committed(record_total))
                    }
                    UplinkStatus::Reject => {
                        self.rollback_all(tokens);
                        self.note_failures(&sensor_ids);
                        self.stats.packets_rejected.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(sequence_no, "packet rejected by server");
                        Ok(CycleOutcome::RolledBack)
                    }
                    UplinkStatus::ServerError => {
                        self.rollback_all(tokens);
                        self.note_failures(&sensor_ids);
                        self.stats
                            .packets_server_error
                            .fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(sequence_no, "server error; will retry");
                        Ok(CycleOutcome::RolledBack)
                    }
                },
                _ => {
                    // Unparseable body or wrong sequence: not an
                    // acknowledgement, so nothing may be erased.
                    self.rollback_all(tokens);
                    self.stats.packets_malformed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(sequence_no, "malformed response; rolled back");
                    Ok(CycleOutcome::RolledBack)
                }
            },
            Ok(Err(err)) => {
                self.rollback_all(tokens);
                self.note_failures(&sensor_ids);
                self.stats.record_error(err.to_string());
                tracing::warn!(sequence_no, error = %err, "transport failure; rolled back");
                Ok(CycleOutcome::RolledBack)
            }
            Err(_elapsed) => {
                // The server is treated as not having received the packet;
                // duplicates are resolved server-side via the sequence number.
                self.rollback_all(tokens);
                self.note_failures(&sensor_ids);
                self.stats.packets_timed_out.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(sequence_no, "request timed out; rolled back");
                Ok(CycleOutcome::RolledBack)
            }
        }
    }

    /// Round-robin over sensors ordered by backlog, peeking each into the
    /// packet until the byte budget runs out, then claiming exactly what
    /// was peeked.
    fn assemble_packet(&mut self) -> Result<(Vec<PacketGroup>, Vec<ClaimToken>)> {
        let mut backlogs = self.engine.sensor_backlogs();
        backlogs.retain(|&(sensor_id, backlog)| backlog > 0 && !self.is_muted(sensor_id));
        if backlogs.is_empty() {
            self.refresh_muted_gauge();
            return Ok((Vec::new(), Vec::new()));
        }
        backlogs.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let rotation = self.round % backlogs.len();
        self.round = self.round.wrapping_add(1);
        backlogs.rotate_left(rotation);

        let mut budget = self
            .cfg
            .packet_budget_bytes
            .saturating_sub(PACKET_PREFIX_LEN);
        let mut groups: Vec<PacketGroup> = Vec::new();
        let mut tokens: Vec<ClaimToken> = Vec::new();

        for (sensor_id, _) in backlogs {
            let Some(descriptor) = self.engine.sensors().get(sensor_id) else {
                continue;
            };
            let wire_len = descriptor.value_type.wire_len();
            let header = crate::transport::GROUP_HEADER_LEN;
            if budget <= header + wire_len {
                break;
            }
            let max_records = (budget - header) / wire_len;
            let records = match self.engine.peek(sensor_id, max_records) {
                Ok(records) => records,
                Err(err) => {
                    // Degraded sensors heal on their own; skip this round.
                    tracing::debug!(sensor_id, error = %err, "peek failed during assembly");
                    continue;
                }
            };
            if records.is_empty() {
                continue;
            }
            match self.engine.claim(sensor_id, records.len()) {
                Ok(token) => {
                    budget -= header + records.len() * wire_len;
                    groups.push(PacketGroup {
                        sensor_id,
                        value_kind: descriptor.value_type,
                        records,
                    });
                    tokens.push(token);
                }
                Err(err) => {
                    tracing::warn!(sensor_id, error = %err, "claim failed during assembly");
                }
            }
        }
        self.refresh_muted_gauge();
        Ok((groups, tokens))
    }

    fn commit_all(&self, tokens: Vec<ClaimToken>) {
        for token in tokens {
            let sensor_id = token.sensor_id;
            if let Err(err) = self.engine.commit(token) {
                tracing::error!(sensor_id, error = %err, "commit failed after ack");
            }
        }
    }

    fn rollback_all(&self, tokens: Vec<ClaimToken>) {
        for token in tokens {
            let sensor_id = token.sensor_id;
            if let Err(err) = self.engine.rollback(token) {
                tracing::error!(sensor_id, error = %err, "rollback failed");
            }
        }
    }

    fn note_success(&mut self, sensor_ids: &[u32]) {
        for sensor_id in sensor_ids {
            self.failures.remove(sensor_id);
        }
        self.refresh_muted_gauge();
    }

    /// Consecutive-failure budget: a sensor that keeps poisoning packets is
    /// muted for a cooldown window so the rest can drain.
    fn note_failures(&mut self, sensor_ids: &[u32]) {
        let cooldown_ms = self.cfg.mute_cooldown.as_millis() as u64;
        for &sensor_id in sensor_ids {
            let failure = self.failures.entry(sensor_id).or_default();
            failure.consecutive += 1;
            if failure.consecutive >= self.cfg.retry_budget_per_sensor {
                failure.muted_until_ms =
                    Some(platform::monotonic_ms().saturating_add(cooldown_ms));
                failure.consecutive = 0;
                tracing::warn!(
                    sensor_id,
                    cooldown_ms,
                    "sensor muted after repeated upload failures"
                );
            }
        }
        self.refresh_muted_gauge();
    }

    fn is_muted(&mut self, sensor_id: u32) -> bool {
        if let Some(failure) = self.failures.get_mut(&sensor_id) {
            if let Some(until) = failure.muted_until_ms {
                if platform::monotonic_ms() < until {
                    return true;
                }
                failure.muted_until_ms = None;
            }
        }
        false
    }

    fn refresh_muted_gauge(&self) {
        let now = platform::monotonic_ms();
        let muted = self
            .failures
            .values()
            .filter(|f| f.muted_until_ms.map(|until| until > now).unwrap_or(false))
            .count() as u64;
        self.stats.muted_sensors.store(muted, Ordering::Relaxed);
    }

    fn persist_state(&self) -> Result<()> {
        platform::persist_json_atomic(
            &self.cfg.state_path,
            &GatewayStateDisk {
                gateway_id: self.gateway_id.to_string(),
                next_sequence: self.next_sequence,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::{SensorDescriptor, SensorTable, ValueKind};
    use crate::storage::engine::{EngineConfig, StorageEngine};
    use crate::transport::{
        decode_packet, encode_response, TransportError, UplinkResponse,
    };
    use futures::future::BoxFuture;
    use std::collections::VecDeque;
    use tempfile::TempDir;

    #[derive(Debug, Clone, Copy)]
    enum Reply {
        Ack,
        Reject,
        ServerError,
        Garbage,
        WrongSequence,
        Hang,
    }

    struct MockTransport {
        replies: Mutex<VecDeque<Reply>>,
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl MockTransport {
        fn new(replies: Vec<Reply>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent_packets(&self) -> Vec<Vec<u8>> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl Transport for MockTransport {
        fn send(&self, packet: Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>, TransportError>> {
            let sequence_no = u64::from_le_bytes(packet[16..24].try_into().unwrap());
            self.sent.lock().unwrap().push(packet);
            let reply = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Reply::Ack);
            Box::pin(async move {
                let status = match reply {
                    Reply::Ack => UplinkStatus::Ok,
                    Reply::Reject => UplinkStatus::Reject,
                    Reply::ServerError => UplinkStatus::ServerError,
                    Reply::Garbage => return Ok(vec![0xBA, 0xD0]),
                    Reply::WrongSequence => {
                        return Ok(encode_response(&UplinkResponse {
                            sequence_no: sequence_no.wrapping_add(999),
                            status: UplinkStatus::Ok,
                        }))
                    }
                    Reply::Hang => {
                        sleep(Duration::from_secs(3600)).await;
                        return Err(TransportError::Io("hung".to_string()));
                    }
                };
                Ok(encode_response(&UplinkResponse {
                    sequence_no,
                    status,
                }))
            })
        }
    }

    fn sensor_table() -> SensorTable {
        SensorTable::from_descriptors(vec![
            SensorDescriptor {
                id: 1,
                name: "coolant-temp".to_string(),
                value_type: ValueKind::U32,
                sample_rate_hint: 10,
            },
            SensorDescriptor {
                id: 2,
                name: "door-events".to_string(),
                value_type: ValueKind::Event,
                sample_rate_hint: 1,
            },
        ])
        .unwrap()
    }

    fn test_engine(dir: &TempDir) -> Arc<StorageEngine> {
        let cfg = EngineConfig {
            spool_dir: dir.path().to_path_buf(),
            quarantine_dir: dir.path().join("quarantine"),
            pool_sector_count: 16,
            // Two 12-byte records per numeric sector.
            sector_size_bytes: 24,
            per_sensor_max_sectors: 64,
            min_resident_sectors: 1,
            stage_limit: 4,
            disk_budget_bytes: 1024 * 1024,
            keep_free_bytes: 0,
            soft_fill_threshold: 0.70,
        };
        let (engine, _report) = StorageEngine::open(cfg, sensor_table()).unwrap();
        Arc::new(engine)
    }

    fn test_cfg(dir: &TempDir) -> UplinkConfig {
        UplinkConfig {
            packet_budget_bytes: 4096,
            request_timeout: Duration::from_millis(200),
            retry_budget_per_sensor: 2,
            mute_cooldown: Duration::from_secs(60),
            min_batch_records: 1,
            poll_interval: Duration::from_millis(10),
            state_path: dir.path().join("gateway.json"),
        }
    }

    fn coordinator(
        engine: &Arc<StorageEngine>,
        transport: Arc<MockTransport>,
        dir: &TempDir,
    ) -> UploadCoordinator {
        UploadCoordinator::new(engine.clone(), transport, test_cfg(dir)).unwrap()
    }

    #[tokio::test]
    async fn ack_commits_exactly_the_claimed_records() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);
        for ts in 1..=3u64 {
            engine.append(1, ts, 10 + ts as u32, 0).unwrap();
        }

        let transport = MockTransport::new(vec![Reply::Ack]);
        let mut uplink = coordinator(&engine, transport.clone(), &dir);
        let outcome = uplink.run_cycle().await.unwrap();
        assert_eq!(outcome, CycleOutcome::Committed(3));

        let sent = transport.sent_packets();
        assert_eq!(sent.len(), 1);
        let decoded = decode_packet(&sent[0], |id| match id {
            1 => Some(ValueKind::U32),
            2 => Some(ValueKind::Event),
            _ => None,
        })
        .unwrap();
        assert_eq!(decoded.groups.len(), 1);
        let (sensor_id, records) = &decoded.groups[0];
        assert_eq!(*sensor_id, 1);
        let timestamps: Vec<u64> = records.iter().map(|r| r.timestamp_ms).collect();
        assert_eq!(timestamps, vec![1, 2, 3]);

        let status = engine.status();
        let sensor = status.sensors.iter().find(|s| s.id == 1).unwrap();
        assert_eq!(sensor.committed_records, 3);
        assert_eq!(sensor.pending_records, 0);
        assert_eq!(sensor.backlog_records, 0);
        // The sealed sector was freed; only the tail remains allocated.
        assert_eq!(status.pool_sectors_used, 1);
        assert!(engine.peek(1, 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn reject_rolls_back_without_erasing() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);
        for ts in 1..=3u64 {
            engine.append(1, ts, ts as u32, 0).unwrap();
        }

        let transport = MockTransport::new(vec![Reply::Reject]);
        let mut uplink = coordinator(&engine, transport, &dir);
        let outcome = uplink.run_cycle().await.unwrap();
        assert_eq!(outcome, CycleOutcome::RolledBack);

        let status = engine.status();
        let sensor = status.sensors.iter().find(|s| s.id == 1).unwrap();
        assert_eq!(sensor.committed_records, 0);
        assert_eq!(sensor.pending_records, 0);
        assert_eq!(sensor.backlog_records, 3);
        assert_eq!(engine.peek(1, 10).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn timeout_never_erases() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);
        for ts in 1..=4u64 {
            engine.append(1, ts, ts as u32, 0).unwrap();
        }

        let transport = MockTransport::new(vec![Reply::Hang]);
        let mut uplink = coordinator(&engine, transport, &dir);
        let outcome = uplink.run_cycle().await.unwrap();
        assert_eq!(outcome, CycleOutcome::RolledBack);
        assert_eq!(
            uplink.stats().packets_timed_out.load(Ordering::Relaxed),
            1
        );

        let status = engine.status();
        let sensor = status.sensors.iter().find(|s| s.id == 1).unwrap();
        assert_eq!(sensor.committed_records, 0);
        assert_eq!(sensor.backlog_records, 4);
        assert_eq!(engine.peek(1, 10).unwrap().len(), 4);
    }

    #[tokio::test]
    async fn malformed_and_wrong_sequence_responses_roll_back() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);
        engine.append(1, 1, 1, 0).unwrap();

        let transport = MockTransport::new(vec![Reply::Garbage, Reply::WrongSequence, Reply::Ack]);
        let mut uplink = coordinator(&engine, transport, &dir);

        assert_eq!(uplink.run_cycle().await.unwrap(), CycleOutcome::RolledBack);
        assert_eq!(uplink.run_cycle().await.unwrap(), CycleOutcome::RolledBack);
        assert_eq!(
            uplink.stats().packets_malformed.load(Ordering::Relaxed),
            2
        );

        assert_eq!(uplink.run_cycle().await.unwrap(), CycleOutcome::Committed(1));
    }

    #[tokio::test]
    async fn sequence_numbers_increase_per_packet() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);
        let transport = MockTransport::new(vec![Reply::Ack, Reply::Ack]);
        let mut uplink = coordinator(&engine, transport.clone(), &dir);

        engine.append(1, 1, 1, 0).unwrap();
        uplink.run_cycle().await.unwrap();
        engine.append(1, 2, 2, 0).unwrap();
        uplink.run_cycle().await.unwrap();

        let sent = transport.sent_packets();
        let seq_a = u64::from_le_bytes(sent[0][16..24].try_into().unwrap());
        let seq_b = u64::from_le_bytes(sent[1][16..24].try_into().unwrap());
        assert_eq!(seq_b, seq_a + 1);
    }

    #[tokio::test]
    async fn sequence_survives_coordinator_restart() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);
        let transport = MockTransport::new(vec![Reply::Ack]);
        let first_seq = {
            let mut uplink = coordinator(&engine, transport.clone(), &dir);
            engine.append(1, 1, 1, 0).unwrap();
            uplink.run_cycle().await.unwrap();
            uplink.next_sequence
        };

        let uplink = coordinator(&engine, MockTransport::new(vec![]), &dir);
        assert_eq!(uplink.next_sequence, first_seq);
        let sent = transport.sent_packets();
        let sent_gateway = Uuid::from_bytes(sent[0][0..16].try_into().unwrap());
        assert_eq!(uplink.gateway_id, sent_gateway);
    }

    #[tokio::test]
    async fn both_sensors_share_one_packet() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);
        engine.append(1, 1, 11, 0).unwrap();
        engine.append(2, 2, 1, 3).unwrap();

        let transport = MockTransport::new(vec![Reply::Ack]);
        let mut uplink = coordinator(&engine, transport.clone(), &dir);
        assert_eq!(uplink.run_cycle().await.unwrap(), CycleOutcome::Committed(2));

        let sent = transport.sent_packets();
        let decoded = decode_packet(&sent[0], |id| match id {
            1 => Some(ValueKind::U32),
            2 => Some(ValueKind::Event),
            _ => None,
        })
        .unwrap();
        assert_eq!(decoded.groups.len(), 2);
        let event_group = decoded.groups.iter().find(|(id, _)| *id == 2).unwrap();
        assert_eq!(event_group.1[0].event_kind, 3);
    }

    #[tokio::test]
    async fn packet_budget_bounds_claimed_records() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);
        for ts in 1..=10u64 {
            engine.append(1, ts, ts as u32, 0).unwrap();
        }

        let mut cfg = test_cfg(&dir);
        // Room for the prefix, one group header and three 12-byte records.
        cfg.packet_budget_bytes = PACKET_PREFIX_LEN + 6 + 3 * 12;
        let transport = MockTransport::new(vec![Reply::Ack]);
        let mut uplink =
            UploadCoordinator::new(engine.clone(), transport.clone(), cfg).unwrap();
        assert_eq!(uplink.run_cycle().await.unwrap(), CycleOutcome::Committed(3));

        let status = engine.status();
        let sensor = status.sensors.iter().find(|s| s.id == 1).unwrap();
        assert_eq!(sensor.committed_records, 3);
        assert_eq!(sensor.backlog_records, 7);
    }

    #[tokio::test]
    async fn repeated_failures_mute_the_sensor() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);
        engine.append(1, 1, 1, 0).unwrap();

        // retry_budget_per_sensor = 2 in the test config.
        let transport = MockTransport::new(vec![Reply::Reject, Reply::Reject]);
        let mut uplink = coordinator(&engine, transport.clone(), &dir);
        assert_eq!(uplink.run_cycle().await.unwrap(), CycleOutcome::RolledBack);
        assert_eq!(uplink.run_cycle().await.unwrap(), CycleOutcome::RolledBack);

        // Muted now: nothing is assembled even though backlog remains.
        assert_eq!(uplink.run_cycle().await.unwrap(), CycleOutcome::Idle);
        assert_eq!(uplink.stats().muted_sensors.load(Ordering::Relaxed), 1);
        assert_eq!(transport.sent_packets().len(), 2);
    }
}
