use thiserror::Error;

/// Storage-side failures. Every data-path operation returns one of these
/// explicitly; none of them unwinds past the calling task.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sector pool exhausted")]
    PoolFull,

    #[error("unknown sensor {0}")]
    UnknownSensor(u32),

    #[error("sample dropped: {reason}")]
    Dropped { reason: &'static str },

    #[error("invalid sector reference {id} (generation {generation})")]
    InvalidRef { id: u32, generation: u32 },

    #[error("chain corruption on sensor {sensor_id} at {location}")]
    ChainCorruption {
        sensor_id: u32,
        location: &'static str,
    },

    #[error("sector checksum mismatch on sensor {sensor_id} (disk index {disk_index})")]
    SectorChecksumMismatch { sensor_id: u32, disk_index: u64 },

    #[error("claim state violation on sensor {0}")]
    ClaimViolation(u32),

    #[error("spool disk budget exhausted")]
    DiskFull,

    #[error("spool i/o: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    /// Corruption errors degrade the sensor; everything else is transient.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StoreError::ChainCorruption { .. }
                | StoreError::SectorChecksumMismatch { .. }
                | StoreError::InvalidRef { .. }
        )
    }
}
