//! Device properties reported to the user and consumed by the zoned stages.
use std::fmt;

use bytesize::ByteSize;
use iocmd_bdev::{Bdev, Lba, ZoneInfo};
use serde::Serialize;

use crate::error::SetupError;

/// Zone layout and limits as advertised by the device, without issuing any command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ZoneLimits {
    pub num_zones: u64,
    pub zone_size: Lba,
    /// Zero for no limit.
    pub max_open_zones: u32,
    /// Zero for no limit.
    pub max_active_zones: u32,
    /// Zero for no limit.
    pub max_append_size: Lba,
}

impl ZoneLimits {
    /// Returns `None` for a conventional device.
    #[must_use]
    pub fn query<B: Bdev + ?Sized>(bdev: &B) -> Option<Self> {
        bdev.is_zoned().then(|| Self {
            num_zones: bdev.num_zones(),
            zone_size: bdev.zone_size(),
            max_open_zones: bdev.max_open_zones(),
            max_active_zones: bdev.max_active_zones(),
            max_append_size: bdev.max_zone_append_size(),
        })
    }
}

/// The zone geometry established by the discovery stage. It is never changed afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ZoneGeometry {
    #[serde(flatten)]
    pub limits: ZoneLimits,
    /// From the zone report of the first zone.
    pub zone_capacity: Lba,
    pub num_blocks: u64,
}

impl ZoneGeometry {
    /// Combine the device limits with the reported first zone.
    #[must_use]
    pub fn discover<B: Bdev + ?Sized>(bdev: &B, first_zone: &ZoneInfo) -> Self {
        let limits = ZoneLimits::query(bdev).unwrap_or(ZoneLimits {
            num_zones: 0,
            zone_size: Lba(0),
            max_open_zones: 0,
            max_active_zones: 0,
            max_append_size: Lba(0),
        });
        Self {
            limits,
            zone_capacity: first_zone.capacity,
            num_blocks: bdev.num_blocks(),
        }
    }

    #[must_use]
    pub fn num_zones(&self) -> u64 {
        self.limits.num_zones
    }

    /// The first block of zone index `zone`.
    #[must_use]
    pub fn zone_start(&self, zone: u64) -> Lba {
        self.limits.zone_size * zone
    }

    /// Check that the zone stages can operate with a buffer of `buf_blocks`.
    pub fn validate(&self, buf_blocks: Lba) -> Result<(), SetupError> {
        let ZoneLimits {
            num_zones,
            zone_size,
            ..
        } = self.limits;
        if num_zones == 0 {
            return Err(SetupError::NoZones);
        }
        if zone_size.0 == 0 {
            return Err(SetupError::ZeroZoneSize);
        }
        if zone_size
            .0
            .checked_mul(num_zones)
            .is_none_or(|end| end > self.num_blocks)
        {
            return Err(SetupError::ZonesBeyondDevice {
                num_zones,
                zone_size,
                num_blocks: self.num_blocks,
            });
        }
        let max = self.limits.max_append_size;
        if max.0 != 0 && buf_blocks > max {
            return Err(SetupError::AppendTooLarge {
                blocks: buf_blocks,
                max,
            });
        }
        if buf_blocks > self.zone_capacity {
            return Err(SetupError::ExceedsZoneCapacity {
                blocks: buf_blocks,
                capacity: self.zone_capacity,
            });
        }
        Ok(())
    }
}

impl fmt::Display for ZoneGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let l = &self.limits;
        writeln!(f, "[zone info]")?;
        writeln!(f, "num zone: {} zones", l.num_zones)?;
        writeln!(f, "zone size: {} blocks", l.zone_size.0)?;
        writeln!(f, "zone capacity: {} blocks", self.zone_capacity.0)?;
        writeln!(f, "max open zone: {} zones", l.max_open_zones)?;
        writeln!(f, "max active zone: {} zones", l.max_active_zones)?;
        write!(f, "max append size: {} blocks", l.max_append_size.0)
    }
}

/// Properties of a device, for the `info` command.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub name: String,
    pub block_size: u32,
    pub write_unit_size: u32,
    pub buf_align: usize,
    pub num_blocks: u64,
    pub zoned: Option<ZoneLimits>,
}

impl DeviceInfo {
    #[must_use]
    pub fn query<B: Bdev + ?Sized>(bdev: &B) -> Self {
        Self {
            name: bdev.name().to_owned(),
            block_size: bdev.block_size(),
            write_unit_size: bdev.write_unit_size(),
            buf_align: bdev.buf_align(),
            num_blocks: bdev.num_blocks(),
            zoned: ZoneLimits::query(bdev),
        }
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let capacity = ByteSize(Lba(self.num_blocks).bytes(self.block_size));
        writeln!(f, "[bdev]")?;
        writeln!(f, "name: {}", self.name)?;
        writeln!(f, "block size: {} bytes", self.block_size)?;
        writeln!(f, "num blocks: {} blocks ({capacity})", self.num_blocks)?;
        writeln!(f, "write unit size: {} blocks", self.write_unit_size)?;
        write!(f, "buf align: {} bytes", self.buf_align)?;
        let Some(l) = &self.zoned else {
            return write!(f, "\nzoned: no");
        };
        writeln!(f, "\nzoned: yes")?;
        writeln!(f, "num zone: {} zones", l.num_zones)?;
        writeln!(f, "zone size: {} blocks", l.zone_size.0)?;
        writeln!(f, "max open zone: {} zones", l.max_open_zones)?;
        writeln!(f, "max active zone: {} zones", l.max_active_zones)?;
        write!(f, "max append size: {} blocks", l.max_append_size.0)
    }
}

#[cfg(test)]
mod tests {
    use iocmd_bdev::{MallocBdev, MallocParams, ZoneCond, ZonedParams};

    use super::*;

    fn zoned_bdev() -> MallocBdev {
        let mut params = MallocParams::zoned(4096, 4096, 20);
        params.zoned = Some(ZonedParams {
            zone_capacity: Lba(4000),
            max_open_zones: 14,
            max_active_zones: 14,
            max_zone_append_size: Lba(256),
            ..params.zoned.unwrap()
        });
        MallocBdev::new("Zoned0", params).unwrap()
    }

    #[test]
    fn discover_and_report() {
        let bdev = zoned_bdev();
        let first = bdev.zone_info(0).unwrap();
        assert_eq!(first.cond, ZoneCond::Empty);
        let geo = ZoneGeometry::discover(&bdev, &first);
        assert_eq!(geo.num_zones(), 20);
        assert_eq!(geo.zone_start(3), Lba(3 * 4096));
        assert_eq!(
            geo.to_string(),
            "\
[zone info]
num zone: 20 zones
zone size: 4096 blocks
zone capacity: 4000 blocks
max open zone: 14 zones
max active zone: 14 zones
max append size: 256 blocks",
        );
        geo.validate(Lba(1)).unwrap();
    }

    #[test]
    fn validation() {
        let bdev = zoned_bdev();
        let geo = ZoneGeometry::discover(&bdev, &bdev.zone_info(0).unwrap());
        assert!(matches!(
            geo.validate(Lba(257)),
            Err(SetupError::AppendTooLarge { .. })
        ));

        let mut unlimited = geo;
        unlimited.limits.max_append_size = Lba(0);
        unlimited.validate(Lba(4000)).unwrap();
        assert!(matches!(
            unlimited.validate(Lba(4001)),
            Err(SetupError::ExceedsZoneCapacity { .. })
        ));

        let mut bogus = unlimited;
        bogus.limits.zone_size = Lba(0);
        assert!(matches!(
            bogus.validate(Lba(1)),
            Err(SetupError::ZeroZoneSize)
        ));

        let mut bogus = unlimited;
        bogus.limits.num_zones = 21;
        assert!(matches!(
            bogus.validate(Lba(1)),
            Err(SetupError::ZonesBeyondDevice {
                num_zones: 21,
                num_blocks: 81920,
                ..
            })
        ));
        bogus.limits.num_zones = u64::MAX;
        assert!(matches!(
            bogus.validate(Lba(1)),
            Err(SetupError::ZonesBeyondDevice { .. })
        ));

        unlimited.limits.num_zones = 0;
        assert!(matches!(
            unlimited.validate(Lba(1)),
            Err(SetupError::NoZones)
        ));
    }

    #[test]
    fn device_info() {
        let conv = MallocBdev::new("Malloc1", MallocParams::new(512, 2048)).unwrap();
        let info = DeviceInfo::query(&conv);
        assert!(info.zoned.is_none());
        assert!(info.to_string().ends_with("zoned: no"));
        assert!(info.to_string().contains("num blocks: 2048 blocks ("));

        let info = DeviceInfo::query(&zoned_bdev());
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["zoned"]["num_zones"], 20);
        assert_eq!(json["zoned"]["max_append_size"], 256);
        assert_eq!(json["block_size"], 4096);
    }
}
