//! Per-sensor chain of sectors.
//!
//! A chain is, oldest to newest:
//!
//! 1. the on-disk region of the sensor's spool file,
//! 2. `staged`: RAM copies of the oldest on-disk sectors, paged in for
//!    reading (FIFO, each standalone),
//! 3. the RAM list proper: `ram_head` linked via `next_sector_id` up to
//!    `tail`, the only write target.
//!
//! Reads (peek/claim) consume the readable prefix: staged sectors, then
//! (only once every on-disk sector has been staged) the RAM list. The
//! uploader claims records, and the matching commit is the only path that
//! erases them; rollback returns them untouched. All methods expect the
//! caller to hold this chain's lock.

use crate::error::{StoreError, StoreResult};
use crate::storage::pool::SectorPool;
use crate::storage::sector::{Record, Sector, SectorRef, NULL_SECTOR};
use std::collections::VecDeque;

/// Read-cursor position, for diagnostics and claim bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainCursor {
    pub sector: SectorRef,
    pub record: u16,
}

/// Receipt for claimed records. Single-use: `commit` and `rollback` consume
/// it, and the chain cross-checks the count against its pending state.
#[derive(Debug)]
pub struct ClaimToken {
    pub sensor_id: u32,
    pub start: ChainCursor,
    pub count: usize,
}

#[derive(Debug, Clone, Copy)]
struct SectorMeta {
    sensor_id: u32,
    record_count: usize,
    next: Option<SectorRef>,
    first_timestamp_ms: u64,
}

#[derive(Debug)]
pub struct SensorChain {
    sensor_id: u32,
    record_len: u16,
    max_walk_sectors: usize,
    min_resident_sectors: usize,

    ram_head: Option<SectorRef>,
    tail: Option<SectorRef>,
    ram_sectors: usize,
    staged: VecDeque<SectorRef>,

    /// Records of the first readable sector already committed (erased).
    head_consumed: usize,
    /// Records claimed by the in-flight packet; invisible to peeks.
    pending: usize,

    backlog_records: u64,
    appended_records: u64,
    committed_records: u64,
    lost_records: u64,
    degraded: bool,
    recovering: bool,
}

impl SensorChain {
    pub fn new(
        sensor_id: u32,
        record_len: u16,
        max_walk_sectors: usize,
        min_resident_sectors: usize,
    ) -> Self {
        Self {
            sensor_id,
            record_len,
            max_walk_sectors,
            min_resident_sectors,
            ram_head: None,
            tail: None,
            ram_sectors: 0,
            staged: VecDeque::new(),
            head_consumed: 0,
            pending: 0,
            backlog_records: 0,
            appended_records: 0,
            committed_records: 0,
            lost_records: 0,
            degraded: false,
            recovering: false,
        }
    }

    pub fn sensor_id(&self) -> u32 {
        self.sensor_id
    }

    pub fn record_len(&self) -> u16 {
        self.record_len
    }

    pub fn backlog_records(&self) -> u64 {
        self.backlog_records
    }

    pub fn pending_records(&self) -> usize {
        self.pending
    }

    pub fn appended_records(&self) -> u64 {
        self.appended_records
    }

    pub fn committed_records(&self) -> u64 {
        self.committed_records
    }

    pub fn lost_records(&self) -> u64 {
        self.lost_records
    }

    pub fn ram_sectors(&self) -> usize {
        self.ram_sectors
    }

    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering
    }

    pub fn mark_recovered(&mut self, disk_records: u64) {
        self.recovering = true;
        self.backlog_records = disk_records;
    }

    /// Append one record, allocating and linking a fresh tail sector when
    /// the current one is sealed or the timestamp would run backwards
    /// within it.
    pub fn append(
        &mut self,
        pool: &SectorPool,
        timestamp_ms: u64,
        value: u32,
        event_kind: u8,
    ) -> StoreResult<()> {
        let needs_new_tail = match self.tail {
            None => true,
            Some(tref) => self.with_own_sector(pool, tref, "tail", |s| {
                s.is_full() || (s.record_count > 0 && timestamp_ms < s.last_timestamp_ms)
            })?,
        };

        if needs_new_tail {
            let new_ref = pool.allocate(self.sensor_id, self.record_len)?;
            if let Some(old_tail) = self.tail {
                let linked = self.with_own_sector(pool, old_tail, "tail link", |s| {
                    s.next_sector_id = new_ref.id;
                    s.next_generation = new_ref.generation;
                });
                if let Err(err) = linked {
                    let _ = pool.free(new_ref.id);
                    return Err(err);
                }
            } else {
                self.ram_head = Some(new_ref);
            }
            self.tail = Some(new_ref);
            self.ram_sectors += 1;
        }

        let tref = self.tail.expect("tail present after allocation");
        let pushed = self.with_own_sector(pool, tref, "tail write", |s| {
            s.push_record(timestamp_ms, value, event_kind)
        })?;
        if !pushed {
            // Sealed between the check and the write; cannot happen while
            // the chain lock is held.
            return Err(self.corrupt("tail sealed during append"));
        }
        self.appended_records += 1;
        self.backlog_records += 1;
        Ok(())
    }

    /// Return up to `max` records starting at the read cursor without
    /// advancing it.
    ///
    /// A corrupt link mid-walk does not fail the call: the records before
    /// the bad link are returned (they are still claim- and commit-safe)
    /// and the chain transitions to degraded so the uploader skips it until
    /// it is rebuilt from disk.
    pub fn peek(
        &mut self,
        pool: &SectorPool,
        max: usize,
        unstaged_disk: u64,
    ) -> StoreResult<Vec<Record>> {
        let mut out = Vec::new();
        if max == 0 {
            return Ok(out);
        }
        let mut skip = self.head_consumed + self.pending;
        let mut steps = 0usize;

        let staged: Vec<SectorRef> = self.staged.iter().copied().collect();
        for sref in staged {
            steps += 1;
            if steps > self.max_walk_sectors {
                self.note_corruption("walk bound exceeded");
                return Ok(out);
            }
            match self.collect_records(pool, sref, "staged walk", &mut skip, max, &mut out) {
                Ok(_) => {}
                Err(err) if err.is_corruption() => {
                    self.note_corruption("staged walk");
                    return Ok(out);
                }
                Err(err) => return Err(err),
            }
            if out.len() >= max {
                return Ok(out);
            }
        }

        if unstaged_disk > 0 {
            // The RAM list is newer than unread on-disk sectors; stop here
            // and let the caller page more in.
            return Ok(out);
        }

        let mut cursor = self.ram_head;
        while let Some(sref) = cursor {
            steps += 1;
            if steps > self.max_walk_sectors {
                self.note_corruption("walk bound exceeded");
                return Ok(out);
            }
            match self.collect_records(pool, sref, "ram walk", &mut skip, max, &mut out) {
                Ok(meta) => {
                    if out.len() >= max {
                        break;
                    }
                    cursor = meta.next;
                }
                Err(err) if err.is_corruption() => {
                    self.note_corruption("ram walk");
                    return Ok(out);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(out)
    }

    fn note_corruption(&mut self, location: &'static str) {
        self.degraded = true;
        tracing::warn!(
            sensor_id = self.sensor_id,
            location,
            "chain corruption during walk; sensor degraded"
        );
    }

    /// Claim `count` records previously returned by `peek`. Exactly one
    /// claim may be outstanding per sensor.
    pub fn claim(&mut self, pool: &SectorPool, count: usize) -> StoreResult<ClaimToken> {
        if count == 0 || self.pending != 0 {
            return Err(StoreError::ClaimViolation(self.sensor_id));
        }
        let start = self
            .current_cursor(pool)?
            .ok_or(StoreError::ClaimViolation(self.sensor_id))?;
        self.pending = count;
        Ok(ClaimToken {
            sensor_id: self.sensor_id,
            start,
            count,
        })
    }

    /// Erase exactly the claimed records by advancing the head past them,
    /// freeing every fully-consumed sector. `on_drop_disk_head` is invoked
    /// once per freed staged sector so the spool can advance its on-disk
    /// head offset.
    pub fn commit(
        &mut self,
        pool: &SectorPool,
        token: ClaimToken,
        mut on_drop_disk_head: impl FnMut() -> StoreResult<()>,
    ) -> StoreResult<()> {
        if token.sensor_id != self.sensor_id || token.count != self.pending {
            return Err(StoreError::ClaimViolation(self.sensor_id));
        }
        let mut remaining = token.count;

        while remaining > 0 {
            if let Some(&sref) = self.staged.front() {
                let meta = self.meta(pool, sref, "commit staged")?;
                let avail = meta.record_count - self.head_consumed;
                if remaining >= avail {
                    remaining -= avail;
                    self.staged.pop_front();
                    pool.free(sref.id)?;
                    on_drop_disk_head()?;
                    self.head_consumed = 0;
                } else {
                    self.head_consumed += remaining;
                    remaining = 0;
                }
                continue;
            }

            let Some(href) = self.ram_head else {
                return Err(StoreError::ClaimViolation(self.sensor_id));
            };
            let meta = self.meta(pool, href, "commit ram")?;
            let avail = meta.record_count - self.head_consumed;
            let is_tail = Some(href) == self.tail;

            if remaining >= avail && !is_tail {
                let next = meta.next.ok_or_else(|| self.corrupt("commit missing link"))?;
                remaining -= avail;
                pool.free(href.id)?;
                self.ram_sectors -= 1;
                self.ram_head = Some(next);
                self.head_consumed = 0;
            } else if remaining >= avail {
                // Unsealed tail: consume in place, the slot stays writable.
                if remaining > avail {
                    return Err(StoreError::ClaimViolation(self.sensor_id));
                }
                self.head_consumed = meta.record_count;
                remaining = 0;
            } else {
                self.head_consumed += remaining;
                remaining = 0;
            }
        }

        self.pending = 0;
        self.committed_records += token.count as u64;
        self.backlog_records = self.backlog_records.saturating_sub(token.count as u64);
        Ok(())
    }

    /// Return claimed records to the readable set; nothing is erased.
    pub fn rollback(&mut self, token: ClaimToken) -> StoreResult<()> {
        if token.sensor_id != self.sensor_id || token.count != self.pending {
            return Err(StoreError::ClaimViolation(self.sensor_id));
        }
        self.pending = 0;
        Ok(())
    }

    /// The oldest RAM-list sector, if evicting it to disk is currently
    /// order- and claim-safe.
    pub fn evictable_head(
        &self,
        pool: &SectorPool,
        unstaged_disk: u64,
    ) -> StoreResult<Option<SectorRef>> {
        let Some(href) = self.ram_head else {
            return Ok(None);
        };
        if Some(href) == self.tail {
            return Ok(None);
        }
        if self.ram_sectors <= self.min_resident_sectors {
            return Ok(None);
        }
        if unstaged_disk == 0 {
            // RAM list is readable; refuse to evict under the cursor.
            let mut staged_records = 0usize;
            for sref in &self.staged {
                staged_records += self.meta(pool, *sref, "evict check")?.record_count;
            }
            if self.head_consumed + self.pending > staged_records {
                return Ok(None);
            }
        }
        Ok(Some(href))
    }

    /// Serialize the RAM head for spilling. The chain link is blanked in the
    /// copy; on-disk order is authoritative for spilled sectors.
    pub fn snapshot_head_for_spill(&self, pool: &SectorPool) -> StoreResult<(SectorRef, Vec<u8>)> {
        let href = self
            .ram_head
            .ok_or_else(|| self.corrupt("spill without head"))?;
        let bytes = self.with_own_sector(pool, href, "spill snapshot", |s| {
            let saved = (s.next_sector_id, s.next_generation);
            s.next_sector_id = NULL_SECTOR;
            s.next_generation = 0;
            let bytes = s.encode();
            s.next_sector_id = saved.0;
            s.next_generation = saved.1;
            bytes
        })?;
        Ok((href, bytes))
    }

    /// Drop the RAM head after its bytes reached disk.
    pub fn unlink_head_after_spill(&mut self, pool: &SectorPool) -> StoreResult<()> {
        let href = self
            .ram_head
            .ok_or_else(|| self.corrupt("unlink without head"))?;
        let meta = self.meta(pool, href, "unlink head")?;
        let next = meta.next.ok_or_else(|| self.corrupt("unlink missing link"))?;
        pool.free(href.id)?;
        self.ram_sectors -= 1;
        self.ram_head = Some(next);
        Ok(())
    }

    /// Adopt a paged-in copy of the oldest unstaged disk sector.
    pub fn push_staged(&mut self, sref: SectorRef) {
        self.staged.push_back(sref);
        self.recovering = false;
    }

    /// Drop the staged head copy without committing it (its disk sector is
    /// being dropped for back-pressure). Returns the records lost.
    pub fn drop_staged_head(&mut self, pool: &SectorPool) -> StoreResult<usize> {
        let Some(sref) = self.staged.pop_front() else {
            return Ok(0);
        };
        let meta = self.meta(pool, sref, "drop staged")?;
        let lost = meta.record_count - self.head_consumed;
        self.head_consumed = 0;
        pool.free(sref.id)?;
        self.lost_records += lost as u64;
        self.backlog_records = self.backlog_records.saturating_sub(lost as u64);
        Ok(lost)
    }

    /// Account for unstaged disk sectors dropped by the spool.
    pub fn note_disk_records_lost(&mut self, records: u64) {
        self.lost_records += records;
        self.backlog_records = self.backlog_records.saturating_sub(records);
    }

    pub fn mark_degraded(&mut self) {
        self.degraded = true;
    }

    /// Rebuild after corruption: throw away the RAM side (the pool sweep
    /// reclaims the slots), keep the on-disk region, reset cursors. Returns
    /// the records written off.
    pub fn rebuild_from_disk(&mut self, disk_records: u64) -> u64 {
        let lost = self.backlog_records.saturating_sub(disk_records);
        self.ram_head = None;
        self.tail = None;
        self.ram_sectors = 0;
        self.staged.clear();
        self.head_consumed = 0;
        self.pending = 0;
        self.backlog_records = disk_records;
        self.lost_records += lost;
        self.degraded = false;
        self.recovering = true;
        lost
    }

    /// First timestamp of the oldest readable sector, for drop-victim
    /// selection.
    pub fn staged_head_first_timestamp(&self, pool: &SectorPool) -> StoreResult<Option<u64>> {
        match self.staged.front() {
            Some(sref) => Ok(Some(
                self.meta(pool, *sref, "head timestamp")?.first_timestamp_ms,
            )),
            None => Ok(None),
        }
    }

    fn current_cursor(&self, _pool: &SectorPool) -> StoreResult<Option<ChainCursor>> {
        let first = self.staged.front().copied().or(self.ram_head);
        Ok(first.map(|sector| ChainCursor {
            sector,
            record: self.head_consumed as u16,
        }))
    }

    /// Read sector metadata, translating a stale reference into a chain
    /// corruption and rejecting a sector that belongs to another sensor.
    fn meta(
        &self,
        pool: &SectorPool,
        sref: SectorRef,
        location: &'static str,
    ) -> StoreResult<SectorMeta> {
        let meta = pool
            .with_sector(sref, |s| SectorMeta {
                sensor_id: s.sensor_id,
                record_count: s.record_count as usize,
                next: if s.next_sector_id == NULL_SECTOR {
                    None
                } else {
                    Some(SectorRef {
                        id: s.next_sector_id,
                        generation: s.next_generation,
                    })
                },
                first_timestamp_ms: s.first_timestamp_ms,
            })
            .map_err(|_| self.corrupt(location))?;
        if meta.sensor_id != self.sensor_id {
            return Err(self.corrupt(location));
        }
        Ok(meta)
    }

    fn with_own_sector<R>(
        &self,
        pool: &SectorPool,
        sref: SectorRef,
        location: &'static str,
        f: impl FnOnce(&mut Sector) -> R,
    ) -> StoreResult<R> {
        pool.with_sector(sref, f).map_err(|_| self.corrupt(location))
    }

    fn collect_records(
        &self,
        pool: &SectorPool,
        sref: SectorRef,
        location: &'static str,
        skip: &mut usize,
        max: usize,
        out: &mut Vec<Record>,
    ) -> StoreResult<SectorMeta> {
        let meta = self.meta(pool, sref, location)?;
        if *skip >= meta.record_count {
            *skip -= meta.record_count;
            return Ok(meta);
        }
        let from = *skip;
        *skip = 0;
        self.with_own_sector(pool, sref, location, |s| {
            for index in from..s.record_count as usize {
                if out.len() >= max {
                    break;
                }
                if let Some(record) = s.record_at(index) {
                    out.push(record);
                }
            }
        })?;
        Ok(meta)
    }

    fn corrupt(&self, location: &'static str) -> StoreError {
        StoreError::ChainCorruption {
            sensor_id: self.sensor_id,
            location,
        }
    }

    /// Flip the head sector's forward link generation so the next walk sees
    /// a stale reference.
    #[cfg(test)]
    pub(crate) fn sabotage_head_link(&self, pool: &SectorPool) {
        if let Some(href) = self.ram_head {
            let _ = pool.with_sector(href, |s| {
                s.next_generation = s.next_generation.wrapping_add(7);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool() -> SectorPool {
        // 24-byte payload => two 12-byte records per sector.
        SectorPool::new(8, 24)
    }

    fn chain() -> SensorChain {
        SensorChain::new(7, 12, 64, 1)
    }

    fn no_disk_drop() -> impl FnMut() -> StoreResult<()> {
        || Ok(())
    }

    #[test]
    fn append_links_new_tail_when_sealed() {
        let pool = small_pool();
        let mut chain = chain();
        for i in 0..3u64 {
            chain.append(&pool, i + 1, 10 + i as u32, 0).unwrap();
        }
        assert_eq!(chain.ram_sectors(), 2);
        assert_eq!(chain.backlog_records(), 3);

        let records = chain.peek(&pool, 10, 0).unwrap();
        let timestamps: Vec<u64> = records.iter().map(|r| r.timestamp_ms).collect();
        assert_eq!(timestamps, vec![1, 2, 3]);
    }

    #[test]
    fn timestamp_regression_seals_sector() {
        let pool = small_pool();
        let mut chain = chain();
        chain.append(&pool, 100, 1, 0).unwrap();
        chain.append(&pool, 50, 2, 0).unwrap();
        // The regressing record landed in a fresh sector.
        assert_eq!(chain.ram_sectors(), 2);
        let records = chain.peek(&pool, 10, 0).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn claim_commit_frees_consumed_sectors() {
        let pool = small_pool();
        let mut chain = chain();
        for i in 0..3u64 {
            chain.append(&pool, i + 1, i as u32, 0).unwrap();
        }
        let peeked = chain.peek(&pool, 10, 0).unwrap();
        assert_eq!(peeked.len(), 3);
        let token = chain.claim(&pool, peeked.len()).unwrap();
        assert_eq!(chain.pending_records(), 3);

        chain.commit(&pool, token, no_disk_drop()).unwrap();
        assert_eq!(chain.pending_records(), 0);
        assert_eq!(chain.committed_records(), 3);
        assert_eq!(chain.backlog_records(), 0);
        // The sealed first sector was freed; the tail stays allocated.
        assert_eq!(pool.used(), 1);
        assert!(chain.peek(&pool, 10, 0).unwrap().is_empty());
    }

    #[test]
    fn rollback_restores_readability() {
        let pool = small_pool();
        let mut chain = chain();
        for i in 0..3u64 {
            chain.append(&pool, i + 1, i as u32, 0).unwrap();
        }
        let peeked = chain.peek(&pool, 10, 0).unwrap();
        let token = chain.claim(&pool, peeked.len()).unwrap();

        // Claimed records are invisible to further peeks.
        assert!(chain.peek(&pool, 10, 0).unwrap().is_empty());

        chain.rollback(token).unwrap();
        assert_eq!(chain.pending_records(), 0);
        let again = chain.peek(&pool, 10, 0).unwrap();
        assert_eq!(again.len(), 3);
        assert_eq!(again, peeked);
    }

    #[test]
    fn only_one_claim_outstanding() {
        let pool = small_pool();
        let mut chain = chain();
        chain.append(&pool, 1, 1, 0).unwrap();
        chain.peek(&pool, 1, 0).unwrap();
        let _token = chain.claim(&pool, 1).unwrap();
        assert!(matches!(
            chain.claim(&pool, 1),
            Err(StoreError::ClaimViolation(7))
        ));
    }

    #[test]
    fn corrupt_link_truncates_walk_and_degrades() {
        let pool = small_pool();
        let mut chain = chain();
        for i in 0..4u64 {
            chain.append(&pool, i + 1, i as u32, 0).unwrap();
        }
        assert_eq!(chain.ram_sectors(), 2);

        chain.sabotage_head_link(&pool);

        // Records before the bad link survive; the chain is degraded.
        let records = chain.peek(&pool, 10, 0).unwrap();
        let timestamps: Vec<u64> = records.iter().map(|r| r.timestamp_ms).collect();
        assert_eq!(timestamps, vec![1, 2]);
        assert!(chain.is_degraded());

        // The surviving prefix is still claim- and commit-safe.
        let token = chain.claim(&pool, 2).unwrap();
        chain.commit(&pool, token, no_disk_drop()).unwrap();
        assert_eq!(chain.committed_records(), 2);
    }

    #[test]
    fn walk_bound_truncates_and_degrades() {
        let pool = SectorPool::new(8, 12);
        let mut chain = SensorChain::new(7, 12, 2, 1);
        for i in 0..4u64 {
            chain.append(&pool, i + 1, 0, 0).unwrap();
        }
        // 4 single-record sectors against a walk bound of 2.
        let records = chain.peek(&pool, 10, 0).unwrap();
        assert_eq!(records.len(), 2);
        assert!(chain.is_degraded());
    }

    #[test]
    fn partial_commit_leaves_cursor_mid_sector() {
        let pool = small_pool();
        let mut chain = chain();
        for i in 0..4u64 {
            chain.append(&pool, i + 1, i as u32, 0).unwrap();
        }
        chain.peek(&pool, 3, 0).unwrap();
        let token = chain.claim(&pool, 3).unwrap();
        chain.commit(&pool, token, no_disk_drop()).unwrap();

        let rest = chain.peek(&pool, 10, 0).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].timestamp_ms, 4);
        assert_eq!(pool.used(), 1);
    }

    #[test]
    fn peek_stops_at_unstaged_disk_boundary() {
        let pool = small_pool();
        let mut chain = chain();
        chain.append(&pool, 1, 1, 0).unwrap();
        // Pretend one disk sector is not yet staged: the RAM list must not
        // be readable past the gap.
        let records = chain.peek(&pool, 10, 1).unwrap();
        assert!(records.is_empty());
    }
}
