//! The fixed stages of the pipeline and their order.
use std::fmt;
use std::ops::Range;

use iocmd_bdev::{IoKind, Tag, ZoneAction};

/// Zones reset before anything is written.
pub const RESET_ZONES: Range<u64> = 0..15;
/// Zones appended to, then read back.
pub const APPEND_ZONES: Range<u64> = 0..5;
pub const OPEN_ZONES: Range<u64> = 5..15;
pub const CLOSE_ZONES: Range<u64> = 10..15;
/// Appends target the zone containing this block offset relative to the zone start.
pub const APPEND_PROBE_OFFSET: u64 = 87;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Stage {
    GeometryDiscovery,
    ZoneReset,
    ZoneAppend,
    ZoneRead,
    ZoneOpen,
    ZoneClose,
    Write,
    Read,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Stage::GeometryDiscovery => "geometry discovery",
            Stage::ZoneReset => "zone reset",
            Stage::ZoneAppend => "zone append",
            Stage::ZoneRead => "zone read",
            Stage::ZoneOpen => "zone open",
            Stage::ZoneClose => "zone close",
            Stage::Write => "write",
            Stage::Read => "read",
        })
    }
}

impl Stage {
    const ALL: [Stage; 8] = [
        Stage::GeometryDiscovery,
        Stage::ZoneReset,
        Stage::ZoneAppend,
        Stage::ZoneRead,
        Stage::ZoneOpen,
        Stage::ZoneClose,
        Stage::Write,
        Stage::Read,
    ];

    #[must_use]
    pub fn kind(self) -> IoKind {
        match self {
            Stage::GeometryDiscovery => IoKind::GetZoneInfo,
            Stage::ZoneReset => IoKind::Zone(ZoneAction::Reset),
            Stage::ZoneAppend => IoKind::ZoneAppend,
            Stage::ZoneRead | Stage::Read => IoKind::Read,
            Stage::ZoneOpen => IoKind::Zone(ZoneAction::Open),
            Stage::ZoneClose => IoKind::Zone(ZoneAction::Close),
            Stage::Write => IoKind::Write,
        }
    }

    /// The unit indices of this stage on a device with `nr_zones` zones. Units of zone stages are
    /// zone indices, clamped to the zones present.
    #[must_use]
    pub fn units(self, nr_zones: u64) -> Range<u64> {
        let clamp = |r: Range<u64>| r.start.min(nr_zones)..r.end.min(nr_zones);
        match self {
            Stage::GeometryDiscovery | Stage::Write | Stage::Read => 0..1,
            Stage::ZoneReset => clamp(RESET_ZONES),
            Stage::ZoneAppend | Stage::ZoneRead => clamp(APPEND_ZONES),
            Stage::ZoneOpen => clamp(OPEN_ZONES),
            Stage::ZoneClose => clamp(CLOSE_ZONES),
        }
    }

    /// The progress line printed when the stage is entered.
    pub(crate) fn banner(self, units: &Range<u64>) -> String {
        let zones = || match units.end.checked_sub(1) {
            Some(last) if !units.is_empty() => format!("zone #{} ~ zone #{last}", units.start),
            _ => "no zones".to_owned(),
        };
        match self {
            Stage::GeometryDiscovery => "Get zone info...".to_owned(),
            Stage::ZoneReset => format!("Reset {}...", zones()),
            Stage::ZoneAppend => format!("Append & implicit open {}...", zones()),
            Stage::ZoneRead => format!("Read {}...", zones()),
            Stage::ZoneOpen => format!("Open {}...", zones()),
            Stage::ZoneClose => format!("Close {}...", zones()),
            Stage::Write => "Writing to the bdev...".to_owned(),
            Stage::Read => "Reading from the bdev...".to_owned(),
        }
    }

    /// The progress line printed when the stage reaches its completion target.
    pub(crate) fn done_message(self) -> &'static str {
        match self {
            Stage::GeometryDiscovery => "Get zone info complete",
            Stage::ZoneReset => "Reset zone complete",
            Stage::ZoneAppend => "Append complete",
            Stage::ZoneRead => "Read complete",
            Stage::ZoneOpen => "Open complete",
            Stage::ZoneClose => "Close complete",
            Stage::Write => "Write complete",
            Stage::Read => "Read complete",
        }
    }
}

/// The pipeline variant, selected by whether the device is zoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Zoned,
    Sequential,
}

impl Mode {
    const ZONED: &'static [Stage] = &[
        Stage::GeometryDiscovery,
        Stage::ZoneReset,
        Stage::ZoneAppend,
        Stage::ZoneRead,
        Stage::ZoneOpen,
        Stage::ZoneClose,
    ];
    const SEQUENTIAL: &'static [Stage] = &[Stage::Write, Stage::Read];

    #[must_use]
    pub fn for_device(zoned: bool) -> Self {
        if zoned {
            Mode::Zoned
        } else {
            Mode::Sequential
        }
    }

    #[must_use]
    pub fn stages(self) -> &'static [Stage] {
        match self {
            Mode::Zoned => Self::ZONED,
            Mode::Sequential => Self::SEQUENTIAL,
        }
    }

    #[must_use]
    pub fn first(self) -> Stage {
        self.stages()[0]
    }

    /// The stage after `stage`, or `None` if `stage` is the last one.
    #[must_use]
    pub fn next(self, stage: Stage) -> Option<Stage> {
        let stages = self.stages();
        let idx = stages
            .iter()
            .position(|&s| s == stage)
            .unwrap_or_else(|| panic!("{stage} is not a stage of {self:?} pipeline"));
        stages.get(idx + 1).copied()
    }
}

/// Identifies one unit of one stage. Travels through the device as the submission [`Tag`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnitTag {
    pub stage: Stage,
    pub unit: u64,
}

impl fmt::Display for UnitTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}#{}", self.stage, self.unit)
    }
}

impl From<UnitTag> for Tag {
    fn from(tag: UnitTag) -> Self {
        debug_assert!(tag.unit < 1 << 32);
        Tag((u64::from(tag.stage as u8) << 32) | tag.unit)
    }
}

impl TryFrom<Tag> for UnitTag {
    type Error = Tag;

    fn try_from(tag: Tag) -> Result<Self, Self::Error> {
        let stage = *Stage::ALL.get((tag.0 >> 32) as usize).ok_or(tag)?;
        Ok(Self {
            stage,
            unit: tag.0 & u64::from(u32::MAX),
        })
    }
}
