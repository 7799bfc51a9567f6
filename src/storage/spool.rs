//! Per-sensor disk spool. Each sensor owns `sensor_<id>.dat`, a
//! concatenation of whole encoded sectors in chain order, plus a
//! `sensor_<id>.idx` sidecar recording the live window and the generation
//! at the last spill. Sectors failing their checksum are moved to the
//! quarantine directory with a reason file instead of blocking the sensor.
//!
//! The live window is `[head_offset, next_write_offset)`. `drop_head` only
//! advances the offset; dead prefixes are reclaimed by the periodic
//! compaction pass so flash writes stay bounded.

use crate::error::{StoreError, StoreResult};
use crate::platform;
use crate::storage::sector::{Sector, SECTOR_HEADER_LEN};
use crc32c::crc32c;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Display;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Serialize, Deserialize)]
struct SidecarDisk {
    head_offset: u64,
    next_write_offset: u64,
    generation_at_spill: u32,
    checksum: u32,
}

fn sidecar_checksum(head_offset: u64, next_write_offset: u64, generation_at_spill: u32) -> u32 {
    let mut buf = [0u8; 20];
    buf[0..8].copy_from_slice(&head_offset.to_le_bytes());
    buf[8..16].copy_from_slice(&next_write_offset.to_le_bytes());
    buf[16..20].copy_from_slice(&generation_at_spill.to_le_bytes());
    crc32c(&buf)
}

#[derive(Debug)]
struct SpoolFile {
    data_path: PathBuf,
    idx_path: PathBuf,
    file: fs::File,
    head_offset: u64,
    next_write_offset: u64,
    generation_at_spill: u32,
}

/// Per-sensor outcome of startup recovery.
#[derive(Debug, Clone)]
pub struct SensorRecovery {
    pub sensor_id: u32,
    pub disk_sectors: u64,
    pub disk_records: u64,
    pub quarantined_sectors: u64,
    pub sidecar_derived: bool,
    pub max_generation: u32,
}

#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub sensors: Vec<SensorRecovery>,
}

impl RecoveryReport {
    pub fn max_generation(&self) -> u32 {
        self.sensors.iter().map(|s| s.max_generation).max().unwrap_or(0)
    }

    pub fn total_records(&self) -> u64 {
        self.sensors.iter().map(|s| s.disk_records).sum()
    }

    pub fn total_quarantined(&self) -> u64 {
        self.sensors.iter().map(|s| s.quarantined_sectors).sum()
    }
}

pub struct DiskSpool {
    dir: PathBuf,
    quarantine_dir: PathBuf,
    sector_disk_len: u64,
    keep_free_bytes: u64,
    files: HashMap<u32, Mutex<SpoolFile>>,
}

impl DiskSpool {
    /// Open the spool directory, recovering every sensor file found or
    /// creating empty ones. Returns the spool plus what recovery saw.
    pub fn open(
        dir: &Path,
        quarantine_dir: &Path,
        sensor_ids: &[u32],
        payload_len: usize,
        keep_free_bytes: u64,
    ) -> StoreResult<(Self, RecoveryReport)> {
        fs::create_dir_all(dir)?;
        fs::create_dir_all(quarantine_dir)?;
        let sector_disk_len = (SECTOR_HEADER_LEN + payload_len) as u64;

        let mut files = HashMap::with_capacity(sensor_ids.len());
        let mut report = RecoveryReport::default();
        for &sensor_id in sensor_ids {
            let (file, recovery) =
                recover_sensor_file(dir, quarantine_dir, sensor_id, sector_disk_len)?;
            report.sensors.push(recovery);
            files.insert(sensor_id, Mutex::new(file));
        }

        Ok((
            Self {
                dir: dir.to_path_buf(),
                quarantine_dir: quarantine_dir.to_path_buf(),
                sector_disk_len,
                keep_free_bytes,
                files,
            },
            report,
        ))
    }

    pub fn sector_disk_len(&self) -> u64 {
        self.sector_disk_len
    }

    pub fn disk_sector_count(&self, sensor_id: u32) -> StoreResult<u64> {
        let state = self.lock(sensor_id)?;
        Ok((state.next_write_offset - state.head_offset) / self.sector_disk_len)
    }

    /// Bytes in live windows across all sensors (dead prefixes excluded;
    /// compaction reclaims those).
    pub fn live_bytes(&self) -> u64 {
        self.files
            .values()
            .map(|slot| {
                let state = slot.lock().expect("spool lock poisoned");
                state.next_write_offset - state.head_offset
            })
            .sum()
    }

    /// Append one encoded sector to the sensor's file and persist the
    /// sidecar. The caller frees the RAM copy only after this returns Ok.
    pub fn spill(&self, sensor_id: u32, bytes: &[u8], generation: u32) -> StoreResult<()> {
        if bytes.len() as u64 != self.sector_disk_len {
            return Err(io_other("spill size mismatch"));
        }
        // Keep a floor of free space for the OS and logs; the controller
        // reacts to this with oldest-drop instead of wedging the producer.
        if self.keep_free_bytes > 0 {
            if let Ok(free) = platform::free_bytes(&self.dir) {
                if free < self.keep_free_bytes {
                    return Err(StoreError::DiskFull);
                }
            }
        }
        let mut state = self.lock(sensor_id)?;
        let offset = state.next_write_offset;
        state.file.seek(SeekFrom::Start(offset))?;
        state.file.write_all(bytes)?;
        state.file.sync_data()?;
        state.next_write_offset = offset + bytes.len() as u64;
        state.generation_at_spill = generation;
        persist_sidecar(&state)?;
        Ok(())
    }

    /// Read the sector `index` positions past the on-disk head.
    pub fn read_sector(&self, sensor_id: u32, index: u64) -> StoreResult<Vec<u8>> {
        let mut state = self.lock(sensor_id)?;
        let offset = state.head_offset + index * self.sector_disk_len;
        if offset + self.sector_disk_len > state.next_write_offset {
            return Err(io_other("sector read past spool window"));
        }
        let mut buf = vec![0u8; self.sector_disk_len as usize];
        state.file.seek(SeekFrom::Start(offset))?;
        state.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Advance the on-disk head past one committed sector. Space is
    /// reclaimed lazily by compaction.
    pub fn drop_head(&self, sensor_id: u32) -> StoreResult<()> {
        let mut state = self.lock(sensor_id)?;
        if state.head_offset + self.sector_disk_len > state.next_write_offset {
            return Err(io_other("drop_head past spool window"));
        }
        state.head_offset += self.sector_disk_len;
        persist_sidecar(&state)?;
        Ok(())
    }

    /// Drop the oldest on-disk sector (back-pressure path), returning how
    /// many records it held. A sector that no longer decodes counts as zero
    /// records but is still skipped.
    pub fn drop_head_sector(&self, sensor_id: u32) -> StoreResult<u64> {
        let mut state = self.lock(sensor_id)?;
        if state.head_offset + self.sector_disk_len > state.next_write_offset {
            return Ok(0);
        }
        let mut buf = vec![0u8; self.sector_disk_len as usize];
        let head_offset = state.head_offset;
        state.file.seek(SeekFrom::Start(head_offset))?;
        state.file.read_exact(&mut buf)?;
        let records = Sector::decode(&buf, sensor_id, 0)
            .map(|s| s.record_count as u64)
            .unwrap_or(0);
        state.head_offset += self.sector_disk_len;
        persist_sidecar(&state)?;
        Ok(records)
    }

    /// First timestamp of the oldest on-disk sector, for drop-victim
    /// selection. A corrupt head reads as timestamp 0 so it is picked first.
    pub fn head_first_timestamp(&self, sensor_id: u32) -> StoreResult<Option<u64>> {
        let mut state = self.lock(sensor_id)?;
        if state.head_offset >= state.next_write_offset {
            return Ok(None);
        }
        let mut buf = vec![0u8; self.sector_disk_len as usize];
        let head_offset = state.head_offset;
        state.file.seek(SeekFrom::Start(head_offset))?;
        state.file.read_exact(&mut buf)?;
        Ok(Some(
            Sector::decode(&buf, sensor_id, 0)
                .map(|s| s.first_timestamp_ms)
                .unwrap_or(0),
        ))
    }

    /// Move the corrupt on-disk head sector to quarantine and advance past
    /// it. Returns the records written off (zero when even the header is
    /// unreadable).
    pub fn quarantine_head(&self, sensor_id: u32, reason: &str) -> StoreResult<u64> {
        let mut state = self.lock(sensor_id)?;
        if state.head_offset + self.sector_disk_len > state.next_write_offset {
            return Ok(0);
        }
        let mut buf = vec![0u8; self.sector_disk_len as usize];
        let head_offset = state.head_offset;
        state.file.seek(SeekFrom::Start(head_offset))?;
        state.file.read_exact(&mut buf)?;
        let records = header_record_count(&buf);
        quarantine_sector(&self.quarantine_dir, sensor_id, &buf, reason)?;
        state.head_offset += self.sector_disk_len;
        persist_sidecar(&state)?;
        Ok(records)
    }

    /// Rewrite the file when the dead prefix dominates it. Bounded work:
    /// one pass over the live window, at most once per trigger.
    pub fn compact(&self, sensor_id: u32) -> StoreResult<bool> {
        let mut state = self.lock(sensor_id)?;
        let live = state.next_write_offset - state.head_offset;
        if state.head_offset == 0 || state.head_offset < live.max(self.sector_disk_len) {
            return Ok(false);
        }

        let tmp_path = state.data_path.with_extension("dat.tmp");
        let mut tmp = fs::File::create(&tmp_path)?;
        let mut remaining = live;
        let head_offset = state.head_offset;
        state.file.seek(SeekFrom::Start(head_offset))?;
        let mut buf = vec![0u8; self.sector_disk_len as usize];
        while remaining > 0 {
            state.file.read_exact(&mut buf)?;
            tmp.write_all(&buf)?;
            remaining -= self.sector_disk_len;
        }
        tmp.sync_data()?;
        fs::rename(&tmp_path, &state.data_path)?;

        state.file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&state.data_path)?;
        state.head_offset = 0;
        state.next_write_offset = live;
        persist_sidecar(&state)?;
        tracing::debug!(sensor_id, live_bytes = live, "compacted spool file");
        Ok(true)
    }

    /// Persist every sidecar. Called on clean shutdown and periodically.
    pub fn flush_sidecars(&self) -> StoreResult<()> {
        for slot in self.files.values() {
            let state = slot.lock().expect("spool lock poisoned");
            state.file.sync_data().ok();
            persist_sidecar(&state)?;
        }
        Ok(())
    }

    fn lock(&self, sensor_id: u32) -> StoreResult<std::sync::MutexGuard<'_, SpoolFile>> {
        self.files
            .get(&sensor_id)
            .map(|slot| slot.lock().expect("spool lock poisoned"))
            .ok_or(StoreError::UnknownSensor(sensor_id))
    }
}

fn io_other(err: impl Display) -> StoreError {
    StoreError::Io(std::io::Error::other(err.to_string()))
}

fn data_path(dir: &Path, sensor_id: u32) -> PathBuf {
    dir.join(format!("sensor_{sensor_id}.dat"))
}

fn idx_path(dir: &Path, sensor_id: u32) -> PathBuf {
    dir.join(format!("sensor_{sensor_id}.idx"))
}

fn persist_sidecar(state: &SpoolFile) -> StoreResult<()> {
    let disk = SidecarDisk {
        head_offset: state.head_offset,
        next_write_offset: state.next_write_offset,
        generation_at_spill: state.generation_at_spill,
        checksum: sidecar_checksum(
            state.head_offset,
            state.next_write_offset,
            state.generation_at_spill,
        ),
    };
    platform::persist_json_atomic(&state.idx_path, &disk).map_err(io_other)
}

fn load_sidecar(path: &Path) -> Option<(u64, u64, u32)> {
    let raw = fs::read_to_string(path).ok()?;
    let parsed: SidecarDisk = serde_json::from_str(&raw).ok()?;
    let expected = sidecar_checksum(
        parsed.head_offset,
        parsed.next_write_offset,
        parsed.generation_at_spill,
    );
    if parsed.checksum != expected {
        return None;
    }
    Some((
        parsed.head_offset,
        parsed.next_write_offset,
        parsed.generation_at_spill,
    ))
}

fn header_record_count(bytes: &[u8]) -> u64 {
    if bytes.len() < SECTOR_HEADER_LEN || &bytes[0..8] != crate::storage::sector::SECTOR_MAGIC {
        return 0;
    }
    u16::from_le_bytes(bytes[20..22].try_into().unwrap_or([0, 0])) as u64
}

/// Hands out a process-unique suffix so quarantined sectors never clobber
/// each other inside one millisecond.
fn next_quarantine_seq() -> u64 {
    static QUARANTINE_SEQ: AtomicU64 = AtomicU64::new(0);
    QUARANTINE_SEQ.fetch_add(1, Ordering::Relaxed)
}

fn quarantine_sector(
    quarantine_dir: &Path,
    sensor_id: u32,
    bytes: &[u8],
    reason: &str,
) -> StoreResult<()> {
    let stamp = platform::wall_ms();
    let seq = next_quarantine_seq();
    let base = quarantine_dir.join(format!("sensor_{sensor_id}_{stamp}_{seq}"));
    fs::write(base.with_extension("bad"), bytes)?;
    fs::write(
        base.with_extension("reason"),
        format!("{reason}\nsensor_id={sensor_id}\nwall_ms={stamp}\n"),
    )?;
    tracing::warn!(sensor_id, reason, "quarantined sector");
    Ok(())
}

/// Startup recovery for one sensor file: establish the live window from the
/// sidecar (or derive it by scanning), validate every sector in it, and
/// rewrite the file without the corrupt ones.
fn recover_sensor_file(
    dir: &Path,
    quarantine_dir: &Path,
    sensor_id: u32,
    sector_disk_len: u64,
) -> StoreResult<(SpoolFile, SensorRecovery)> {
    let data_path = data_path(dir, sensor_id);
    let idx_path = idx_path(dir, sensor_id);
    let mut file = fs::OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&data_path)?;
    let file_len = file.metadata()?.len();

    let sidecar = load_sidecar(&idx_path).filter(|(head, next, _)| {
        head <= next
            && *next <= file_len
            && head % sector_disk_len == 0
            && next % sector_disk_len == 0
    });
    let sidecar_derived = sidecar.is_none();
    let (head_offset, next_write_offset, generation_at_spill) = match sidecar {
        Some(window) => window,
        None => {
            // Sidecar missing or corrupt: every checksum-valid sector in the
            // file is considered pending. Duplicate delivery is resolved
            // upstream by the packet sequence number.
            (0, file_len - file_len % sector_disk_len, 0)
        }
    };

    // A trailing fragment past the window is a torn spill; discard it.
    if file_len > next_write_offset {
        tracing::debug!(
            sensor_id,
            discarded = file_len - next_write_offset,
            "truncating bytes past spool window"
        );
        file.set_len(next_write_offset)?;
    }

    let mut valid: Vec<Vec<u8>> = Vec::new();
    let mut quarantined_sectors = 0u64;
    let mut disk_records = 0u64;
    let mut max_generation = generation_at_spill;
    let mut offset = head_offset;
    let mut buf = vec![0u8; sector_disk_len as usize];
    while offset + sector_disk_len <= next_write_offset {
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        let disk_index = (offset - head_offset) / sector_disk_len;
        match Sector::decode(&buf, sensor_id, disk_index) {
            Ok(decoded) if decoded.sensor_id == sensor_id => {
                disk_records += decoded.record_count as u64;
                max_generation = max_generation.max(decoded.generation);
                valid.push(buf.clone());
            }
            Ok(_) => {
                quarantine_sector(quarantine_dir, sensor_id, &buf, "sensor_id mismatch")?;
                quarantined_sectors += 1;
            }
            Err(_) => {
                quarantine_sector(quarantine_dir, sensor_id, &buf, "checksum mismatch")?;
                quarantined_sectors += 1;
            }
        }
        offset += sector_disk_len;
    }

    let mut state = SpoolFile {
        data_path,
        idx_path,
        file,
        head_offset,
        next_write_offset,
        generation_at_spill,
    };

    if quarantined_sectors > 0 || sidecar_derived {
        // Rewrite the window with only the surviving sectors so the live
        // region is contiguous again.
        let tmp_path = state.data_path.with_extension("dat.tmp");
        let mut tmp = fs::File::create(&tmp_path)?;
        for sector in &valid {
            tmp.write_all(sector)?;
        }
        tmp.sync_data()?;
        fs::rename(&tmp_path, &state.data_path)?;
        state.file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&state.data_path)?;
        state.head_offset = 0;
        state.next_write_offset = valid.len() as u64 * sector_disk_len;
    }
    persist_sidecar(&state)?;

    if quarantined_sectors > 0 {
        tracing::warn!(
            sensor_id,
            quarantined_sectors,
            "recovery quarantined corrupt sectors"
        );
    }
    let recovery = SensorRecovery {
        sensor_id,
        disk_sectors: (state.next_write_offset - state.head_offset) / sector_disk_len,
        disk_records,
        quarantined_sectors,
        sidecar_derived,
        max_generation,
    };
    Ok((state, recovery))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PAYLOAD: usize = 48;

    fn encoded_sector(sensor_id: u32, generation: u32, timestamps: &[u64]) -> Vec<u8> {
        let mut sector = Sector::new(PAYLOAD);
        sector.reset(sensor_id, 12);
        sector.generation = generation;
        for &ts in timestamps {
            assert!(sector.push_record(ts, ts as u32, 0));
        }
        sector.encode()
    }

    fn open_single(dir: &TempDir) -> (DiskSpool, RecoveryReport) {
        let quarantine = dir.path().join("quarantine");
        DiskSpool::open(dir.path(), &quarantine, &[5], PAYLOAD, 0).unwrap()
    }

    #[test]
    fn spill_read_drop_round_trip() {
        let dir = TempDir::new().unwrap();
        let (spool, _) = open_single(&dir);

        spool.spill(5, &encoded_sector(5, 1, &[10, 11]), 1).unwrap();
        spool.spill(5, &encoded_sector(5, 2, &[12]), 2).unwrap();
        assert_eq!(spool.disk_sector_count(5).unwrap(), 2);

        let bytes = spool.read_sector(5, 0).unwrap();
        let decoded = Sector::decode(&bytes, 5, 0).unwrap();
        assert_eq!(decoded.first_timestamp_ms, 10);

        spool.drop_head(5).unwrap();
        let bytes = spool.read_sector(5, 0).unwrap();
        let decoded = Sector::decode(&bytes, 5, 0).unwrap();
        assert_eq!(decoded.first_timestamp_ms, 12);
    }

    #[test]
    fn recovery_restores_window_from_sidecar() {
        let dir = TempDir::new().unwrap();
        {
            let (spool, _) = open_single(&dir);
            spool.spill(5, &encoded_sector(5, 1, &[1, 2]), 1).unwrap();
            spool.spill(5, &encoded_sector(5, 2, &[3, 4]), 2).unwrap();
            spool.drop_head(5).unwrap();
        }
        let (spool, report) = open_single(&dir);
        assert_eq!(spool.disk_sector_count(5).unwrap(), 1);
        let sensor = &report.sensors[0];
        assert!(!sensor.sidecar_derived);
        assert_eq!(sensor.disk_records, 2);
        assert_eq!(sensor.max_generation, 2);
    }

    #[test]
    fn recovery_derives_window_when_sidecar_is_corrupt() {
        let dir = TempDir::new().unwrap();
        {
            let (spool, _) = open_single(&dir);
            spool.spill(5, &encoded_sector(5, 1, &[1, 2]), 1).unwrap();
            spool.spill(5, &encoded_sector(5, 2, &[3]), 2).unwrap();
        }
        fs::write(dir.path().join("sensor_5.idx"), b"{not json").unwrap();

        let (spool, report) = open_single(&dir);
        let sensor = &report.sensors[0];
        assert!(sensor.sidecar_derived);
        assert_eq!(sensor.disk_records, 3);
        assert_eq!(spool.disk_sector_count(5).unwrap(), 2);
    }

    #[test]
    fn recovery_quarantines_corrupt_sector_and_keeps_the_rest() {
        let dir = TempDir::new().unwrap();
        {
            let (spool, _) = open_single(&dir);
            spool.spill(5, &encoded_sector(5, 1, &[1, 2]), 1).unwrap();
            spool.spill(5, &encoded_sector(5, 2, &[3, 4]), 2).unwrap();
        }
        // Flip a payload bit in the first sector.
        let path = dir.path().join("sensor_5.dat");
        let mut raw = fs::read(&path).unwrap();
        raw[SECTOR_HEADER_LEN + 1] ^= 0x01;
        fs::write(&path, raw).unwrap();

        let (spool, report) = open_single(&dir);
        let sensor = &report.sensors[0];
        assert_eq!(sensor.quarantined_sectors, 1);
        assert_eq!(sensor.disk_records, 2);
        assert_eq!(spool.disk_sector_count(5).unwrap(), 1);

        let quarantined: Vec<_> = fs::read_dir(dir.path().join("quarantine"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert!(quarantined.iter().any(|name| name.ends_with(".bad")));
        assert!(quarantined.iter().any(|name| name.ends_with(".reason")));
    }

    #[test]
    fn truncates_torn_tail_spill() {
        let dir = TempDir::new().unwrap();
        {
            let (spool, _) = open_single(&dir);
            spool.spill(5, &encoded_sector(5, 1, &[1, 2]), 1).unwrap();
        }
        // Simulate a crash mid-spill: append half a sector with no sidecar
        // update.
        let path = dir.path().join("sensor_5.dat");
        let mut raw = fs::read(&path).unwrap();
        let half = encoded_sector(5, 2, &[9]);
        raw.extend_from_slice(&half[..half.len() / 2]);
        fs::write(&path, raw).unwrap();

        let (spool, report) = open_single(&dir);
        assert_eq!(spool.disk_sector_count(5).unwrap(), 1);
        assert_eq!(report.sensors[0].disk_records, 2);
    }

    #[test]
    fn compaction_reclaims_dead_prefix() {
        let dir = TempDir::new().unwrap();
        let (spool, _) = open_single(&dir);
        for generation in 0..4u32 {
            spool
                .spill(5, &encoded_sector(5, generation, &[generation as u64]), generation)
                .unwrap();
        }
        spool.drop_head(5).unwrap();
        spool.drop_head(5).unwrap();
        spool.drop_head(5).unwrap();

        assert!(spool.compact(5).unwrap());
        assert_eq!(spool.disk_sector_count(5).unwrap(), 1);
        let len = fs::metadata(dir.path().join("sensor_5.dat")).unwrap().len();
        assert_eq!(len, spool.sector_disk_len());

        let bytes = spool.read_sector(5, 0).unwrap();
        let decoded = Sector::decode(&bytes, 5, 0).unwrap();
        assert_eq!(decoded.first_timestamp_ms, 3);
    }

    #[test]
    fn drop_head_sector_reports_record_count() {
        let dir = TempDir::new().unwrap();
        let (spool, _) = open_single(&dir);
        spool.spill(5, &encoded_sector(5, 1, &[1, 2]), 1).unwrap();
        assert_eq!(spool.drop_head_sector(5).unwrap(), 2);
        assert_eq!(spool.disk_sector_count(5).unwrap(), 0);
    }
}
