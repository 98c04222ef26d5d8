//! The block device layer driven by `iocmd`.
//!
//! A [`Bdev`] is opened through a [`Desc`], which hands out [`IoChannel`]s. Every I/O submission
//! on a channel is non-blocking: it is either accepted, rejected with [`Errno::NOMEM`] when the
//! device is temporarily out of resources, or rejected with a hard error. Accepted operations
//! complete later as [`Event::Completion`], carrying back the [`Tag`] given at submission.
//!
//! [`Errno::NOMEM`]: rustix::io::Errno::NOMEM
mod bdev;
mod buf;
mod malloc;

use std::{fmt, ops};

pub use bdev::*;
pub use buf::DmaBuf;
pub use malloc::*;

/// Size or offset in unit of logical blocks of the device.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(transparent)
)]
pub struct Lba(pub u64);

impl fmt::Display for Lba {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)?;
        "b".fmt(f)
    }
}

impl fmt::LowerHex for Lba {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl Lba {
    /// The start of the zone containing this block, for zones of `zone_size` blocks.
    #[must_use]
    pub const fn zone_start(self, zone_size: Lba) -> Lba {
        Lba(self.0 - self.0 % zone_size.0)
    }

    #[must_use]
    pub const fn bytes(self, block_size: u32) -> u64 {
        match self.0.checked_mul(block_size as u64) {
            Some(bytes) => bytes,
            None => panic!("overflow"),
        }
    }

    #[must_use]
    pub const fn try_from_bytes(bytes: u64, block_size: u32) -> Option<Self> {
        if bytes % block_size as u64 == 0 {
            Some(Self(bytes / block_size as u64))
        } else {
            None
        }
    }
}

impl ops::Add for Lba {
    type Output = Lba;

    fn add(self, rhs: Lba) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl ops::AddAssign for Lba {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl ops::Sub for Lba {
    type Output = Lba;

    fn sub(self, rhs: Lba) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

impl ops::Mul<u64> for Lba {
    type Output = Self;

    fn mul(self, rhs: u64) -> Self::Output {
        Self(self.0 * rhs)
    }
}

impl ops::Div<Lba> for Lba {
    type Output = u64;

    fn div(self, rhs: Self) -> Self::Output {
        self.0 / rhs.0
    }
}

impl ops::Rem<Lba> for Lba {
    type Output = Lba;

    fn rem(self, rhs: Lba) -> Self::Output {
        Lba(self.0 % rhs.0)
    }
}
