//! Bounded RAM sector pool. Slots are pre-allocated at startup; `allocate`
//! and `free` serialise on a single pool lock, while the sector contents
//! themselves sit behind per-slot mutexes so record writes never contend on
//! the pool lock. Chain mutation rules guarantee a slot is only ever touched
//! under its owning chain's lock, so the slot mutexes are uncontended in
//! practice.

use crate::error::{StoreError, StoreResult};
use crate::storage::sector::{Sector, SectorRef};
use std::sync::Mutex;

struct PoolState {
    free: Vec<u32>,
    allocated: Vec<bool>,
}

pub struct SectorPool {
    sectors: Vec<Mutex<Sector>>,
    state: Mutex<PoolState>,
}

impl SectorPool {
    pub fn new(sector_count: usize, payload_len: usize) -> Self {
        let sectors = (0..sector_count)
            .map(|_| Mutex::new(Sector::new(payload_len)))
            .collect();
        // Hand out low ids first.
        let free = (0..sector_count as u32).rev().collect();
        Self {
            sectors,
            state: Mutex::new(PoolState {
                free,
                allocated: vec![false; sector_count],
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.sectors.len()
    }

    pub fn used(&self) -> usize {
        let state = self.state.lock().expect("pool lock poisoned");
        self.sectors.len() - state.free.len()
    }

    pub fn fill_ratio(&self) -> f64 {
        if self.sectors.is_empty() {
            return 1.0;
        }
        self.used() as f64 / self.sectors.len() as f64
    }

    /// Hand out a zeroed sector. The slot's generation was bumped when it
    /// was last freed, so no stale reference can match the returned ref.
    pub fn allocate(&self, sensor_id: u32, record_len: u16) -> StoreResult<SectorRef> {
        let id = {
            let mut state = self.state.lock().expect("pool lock poisoned");
            let Some(id) = state.free.pop() else {
                return Err(StoreError::PoolFull);
            };
            state.allocated[id as usize] = true;
            id
        };
        let mut sector = self.sectors[id as usize].lock().expect("sector lock poisoned");
        sector.reset(sensor_id, record_len);
        Ok(SectorRef {
            id,
            generation: sector.generation,
        })
    }

    /// Return a sector to the free list and bump its generation so any link
    /// still pointing at it fails the generation check.
    pub fn free(&self, id: u32) -> StoreResult<()> {
        {
            let mut state = self.state.lock().expect("pool lock poisoned");
            let slot = state
                .allocated
                .get_mut(id as usize)
                .ok_or(StoreError::InvalidRef { id, generation: 0 })?;
            if !*slot {
                return Err(StoreError::InvalidRef { id, generation: 0 });
            }
            *slot = false;
            state.free.push(id);
        }
        let mut sector = self.sectors[id as usize].lock().expect("sector lock poisoned");
        sector.generation = sector.generation.wrapping_add(1);
        sector.record_count = 0;
        sector.next_sector_id = crate::storage::sector::NULL_SECTOR;
        Ok(())
    }

    /// Run `f` against the referenced sector after validating that the slot
    /// is live and the generation matches. A mismatch means the caller holds
    /// a stale reference.
    pub fn with_sector<R>(
        &self,
        sref: SectorRef,
        f: impl FnOnce(&mut Sector) -> R,
    ) -> StoreResult<R> {
        let live = {
            let state = self.state.lock().expect("pool lock poisoned");
            state
                .allocated
                .get(sref.id as usize)
                .copied()
                .unwrap_or(false)
        };
        if !live {
            return Err(StoreError::InvalidRef {
                id: sref.id,
                generation: sref.generation,
            });
        }
        let mut sector = self.sectors[sref.id as usize]
            .lock()
            .expect("sector lock poisoned");
        if sector.generation != sref.generation {
            return Err(StoreError::InvalidRef {
                id: sref.id,
                generation: sref.generation,
            });
        }
        Ok(f(&mut sector))
    }

    /// Seed every slot's generation to at least `floor`. Used at recovery so
    /// links persisted before the crash can never collide with fresh ones.
    pub fn seed_generation(&self, floor: u32) {
        for slot in &self.sectors {
            let mut sector = slot.lock().expect("sector lock poisoned");
            if sector.generation < floor {
                sector.generation = floor;
            }
        }
    }

    /// Free every live slot carrying `sensor_id`. Used when a degraded
    /// chain is rebuilt: a corrupt link can strand sectors that no walk can
    /// reach any more, and this sweep reclaims them.
    pub fn sweep_sensor(&self, sensor_id: u32) -> usize {
        let mut reclaimed = 0;
        for id in 0..self.sectors.len() as u32 {
            let live = {
                let state = self.state.lock().expect("pool lock poisoned");
                state.allocated[id as usize]
            };
            if !live {
                continue;
            }
            let matches = {
                let sector = self.sectors[id as usize].lock().expect("sector lock poisoned");
                sector.sensor_id == sensor_id
            };
            if matches && self.free(id).is_ok() {
                reclaimed += 1;
            }
        }
        reclaimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_free_cycle_bumps_generation() {
        let pool = SectorPool::new(8, 96);
        let first = pool.allocate(1, 12).unwrap();
        pool.free(first.id).unwrap();
        let second = pool.allocate(1, 12).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.generation, first.generation + 1);

        // The stale reference no longer resolves.
        let err = pool.with_sector(first, |_| ()).unwrap_err();
        assert!(matches!(err, StoreError::InvalidRef { .. }));
    }

    #[test]
    fn pool_full_is_reported() {
        let pool = SectorPool::new(2, 48);
        pool.allocate(1, 12).unwrap();
        pool.allocate(1, 12).unwrap();
        assert!(matches!(pool.allocate(1, 12), Err(StoreError::PoolFull)));
        assert!((pool.fill_ratio() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn double_free_is_rejected() {
        let pool = SectorPool::new(2, 48);
        let sref = pool.allocate(3, 12).unwrap();
        pool.free(sref.id).unwrap();
        assert!(matches!(
            pool.free(sref.id),
            Err(StoreError::InvalidRef { .. })
        ));
    }

    #[test]
    fn sweep_reclaims_only_matching_sensor() {
        let pool = SectorPool::new(4, 48);
        let a = pool.allocate(1, 12).unwrap();
        let _b = pool.allocate(2, 12).unwrap();
        assert_eq!(pool.sweep_sensor(1), 1);
        assert_eq!(pool.used(), 1);
        assert!(pool.with_sector(a, |_| ()).is_err());
    }
}
