use std::fmt;

use bytes::Bytes;
use rustix::io::Errno;

use crate::{DmaBuf, Lba};

/// Opaque context of a submission, handed back unchanged in its [`Completion`] or io-wait
/// [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ZoneAction {
    Reset,
    Open,
    Close,
    Finish,
}

impl fmt::Display for ZoneAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            ZoneAction::Reset => "reset",
            ZoneAction::Open => "open",
            ZoneAction::Close => "close",
            ZoneAction::Finish => "finish",
        })
    }
}

/// The kind of an I/O command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoKind {
    Read,
    Write,
    Zone(ZoneAction),
    ZoneAppend,
    GetZoneInfo,
}

impl fmt::Display for IoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoKind::Read => f.pad("read"),
            IoKind::Write => f.pad("write"),
            IoKind::Zone(action) => write!(f, "zone {action}"),
            IoKind::ZoneAppend => f.pad("zone append"),
            IoKind::GetZoneInfo => f.pad("get zone info"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ZoneCond {
    Empty,
    ImpOpen,
    ExpOpen,
    Closed,
    Full,
}

impl ZoneCond {
    #[must_use]
    pub fn is_open(self) -> bool {
        matches!(self, ZoneCond::ImpOpen | ZoneCond::ExpOpen)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneInfo {
    /// The first block of the zone.
    pub zone_id: Lba,
    /// Absolute position of the write pointer.
    pub write_pointer: Lba,
    /// Writable blocks of the zone, which may be less than the zone size.
    pub capacity: Lba,
    pub cond: ZoneCond,
}

/// The successful result of a completed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoOutput {
    Done,
    Read(Bytes),
    /// The block where the zone append landed.
    Appended(Lba),
    Zones(Vec<ZoneInfo>),
}

#[derive(Debug)]
pub struct Completion {
    pub tag: Tag,
    pub kind: IoKind,
    pub result: Result<IoOutput, Errno>,
}

#[derive(Debug)]
pub enum Event {
    Completion(Completion),
    /// Resources became available for the io-wait registered with this tag.
    IoWait(Tag),
}

/// A block device, possibly zoned.
///
/// Zone related queries return zero on conventional devices.
pub trait Bdev {
    type Channel<'a>: IoChannel
    where
        Self: 'a;

    fn name(&self) -> &str;
    fn block_size(&self) -> u32;
    /// Number of blocks in the minimal write unit.
    fn write_unit_size(&self) -> u32;
    fn buf_align(&self) -> usize;
    fn num_blocks(&self) -> u64;
    fn is_zoned(&self) -> bool;
    fn num_zones(&self) -> u64;
    fn zone_size(&self) -> Lba;
    fn max_open_zones(&self) -> u32;
    fn max_active_zones(&self) -> u32;
    fn max_zone_append_size(&self) -> Lba;

    /// The id, ie. the first block, of the zone containing `lba`.
    fn zone_id(&self, lba: Lba) -> Lba {
        let zone_size = self.zone_size();
        if zone_size.0 == 0 {
            lba
        } else {
            lba.zone_start(zone_size)
        }
    }

    /// Called on [`Desc::open`].
    fn claim(&self, write: bool) -> Result<(), Errno>;
    /// Called when a [`Desc`] is dropped.
    fn release(&self);

    fn get_io_channel(&self) -> Option<Self::Channel<'_>>;

    /// Allocate a zeroed buffer suitable for I/O on this device.
    fn dma_zalloc(&self, len: usize) -> Option<DmaBuf> {
        DmaBuf::zeroed(len, self.buf_align())
    }
}

/// A per-thread submission channel of a [`Bdev`]. It is put back when dropped.
///
/// Every submission returns immediately. `Err(Errno::NOMEM)` means the device is temporarily
/// out of resources and the caller may register a [`IoChannel::queue_io_wait`]. Data buffers are
/// copied on submission.
pub trait IoChannel {
    fn read(&mut self, offset: Lba, len: Lba, tag: Tag) -> Result<(), Errno>;

    fn write(&mut self, offset: Lba, data: &[u8], tag: Tag) -> Result<(), Errno>;

    fn zone_management(&mut self, zone_id: Lba, action: ZoneAction, tag: Tag)
        -> Result<(), Errno>;

    fn zone_append(&mut self, zone_id: Lba, data: &[u8], tag: Tag) -> Result<(), Errno>;

    fn get_zone_info(&mut self, zone_id: Lba, nr_zones: usize, tag: Tag) -> Result<(), Errno>;

    /// Register to be notified once, via [`Event::IoWait`] with `tag`, when resources for a new
    /// submission become available.
    fn queue_io_wait(&mut self, tag: Tag) -> Result<(), Errno>;

    /// Wait for the next event. Returns `None` if nothing is outstanding on this channel, so no
    /// event would ever arrive.
    async fn next_event(&mut self) -> Option<Event>;
}

/// An opened descriptor of a [`Bdev`]. The device is released when this is dropped.
pub struct Desc<'a, B: Bdev + ?Sized> {
    bdev: &'a B,
}

impl<B: Bdev + ?Sized> fmt::Debug for Desc<'_, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Desc")
            .field("bdev", &self.bdev.name())
            .finish()
    }
}

impl<'a, B: Bdev + ?Sized> Desc<'a, B> {
    pub fn open(bdev: &'a B, write: bool) -> Result<Self, Errno> {
        bdev.claim(write)?;
        tracing::debug!(bdev = bdev.name(), write, "opened bdev");
        Ok(Self { bdev })
    }

    #[must_use]
    pub fn bdev(&self) -> &'a B {
        self.bdev
    }

    #[must_use]
    pub fn get_io_channel(&self) -> Option<B::Channel<'a>> {
        self.bdev.get_io_channel()
    }
}

impl<B: Bdev + ?Sized> Drop for Desc<'_, B> {
    fn drop(&mut self) {
        tracing::debug!(bdev = self.bdev.name(), "closing bdev");
        self.bdev.release();
    }
}
