use std::time::Duration;

use iocmd_bdev::{IoKind, Lba};
use rustix::io::Errno;

use crate::stage::Stage;

/// Failures before the first command is submitted.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("could not open bdev {name}: {errno}")]
    Open { name: String, errno: Errno },
    #[error("could not create bdev I/O channel")]
    Channel,
    #[error("failed to allocate {len} bytes buffer aligned to {align}")]
    BufferAlloc { len: usize, align: usize },
    #[error("zoned bdev reports no zones")]
    NoZones,
    #[error("zoned bdev reports a zero zone size")]
    ZeroZoneSize,
    #[error("{num_zones} zones of {zone_size} exceed the bdev of {num_blocks} blocks")]
    ZonesBeyondDevice {
        num_zones: u64,
        zone_size: Lba,
        num_blocks: u64,
    },
    #[error("buffer of {blocks} exceeds the max zone append size {max}")]
    AppendTooLarge { blocks: Lba, max: Lba },
    #[error("buffer of {blocks} exceeds the zone capacity {capacity}")]
    ExceedsZoneCapacity { blocks: Lba, capacity: Lba },
}

/// The reason a run ended in failure.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Setup(#[from] SetupError),
    #[error("{kind} of unit {unit} failed to submit during {stage}: {errno}")]
    Submit {
        stage: Stage,
        unit: u64,
        kind: IoKind,
        errno: Errno,
    },
    #[error("failed to queue io-wait during {stage}: {errno}")]
    IoWait { stage: Stage, errno: Errno },
    #[error("{kind} of unit {unit} completed with error during {stage}: {errno}")]
    Completion {
        stage: Stage,
        unit: u64,
        kind: IoKind,
        errno: Errno,
    },
    #[error("data read at {offset} during {stage} (unit {unit}) does not match what was written")]
    DataMismatch { stage: Stage, unit: u64, offset: Lba },
    #[error("{stage} made no progress in {timeout:?} ({completed}/{expected} units completed)")]
    StageTimeout {
        stage: Stage,
        timeout: Duration,
        completed: u32,
        expected: u32,
    },
    #[error("{stage} stalled: device has nothing outstanding ({completed}/{expected} units completed)")]
    Stalled {
        stage: Stage,
        completed: u32,
        expected: u32,
    },
}

impl RunError {
    /// The stage the run failed in, if it got that far.
    #[must_use]
    pub fn stage(&self) -> Option<Stage> {
        match self {
            RunError::Setup(_) => None,
            RunError::Submit { stage, .. }
            | RunError::IoWait { stage, .. }
            | RunError::Completion { stage, .. }
            | RunError::DataMismatch { stage, .. }
            | RunError::StageTimeout { stage, .. }
            | RunError::Stalled { stage, .. } => Some(*stage),
        }
    }
}
