//! A memory backed block device.
//!
//! Accepted commands are queued on the submitting channel and executed one at a time when the
//! channel is polled for events, in the configured [`CompletionOrder`]. The queue is bounded by
//! `queue_depth`; a submission on a full queue is rejected with `NOMEM` and io-waits are fired
//! as slots free up.
use std::collections::{HashMap, VecDeque};
use std::future;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustix::io::Errno;

use crate::{
    Bdev, Completion, DmaBuf, Event, IoChannel, IoKind, IoOutput, Lba, Tag, ZoneAction, ZoneCond,
    ZoneInfo,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Deserialize),
    serde(rename_all = "snake_case")
)]
pub enum CompletionOrder {
    #[default]
    Fifo,
    Lifo,
    /// Uniformly random, seeded for reproducibility.
    Shuffled(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZonedParams {
    pub zone_size: Lba,
    pub zone_capacity: Lba,
    /// Zero for no limit.
    pub max_open_zones: u32,
    /// Zero for no limit.
    pub max_active_zones: u32,
    /// Zero for no limit.
    pub max_zone_append_size: Lba,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MallocParams {
    pub block_size: u32,
    pub num_blocks: u64,
    pub write_unit_size: u32,
    pub buf_align: usize,
    pub queue_depth: usize,
    pub completion_order: CompletionOrder,
    pub zoned: Option<ZonedParams>,
}

impl MallocParams {
    /// A conventional device with a write unit of one block.
    #[must_use]
    pub fn new(block_size: u32, num_blocks: u64) -> Self {
        Self {
            block_size,
            num_blocks,
            write_unit_size: 1,
            buf_align: block_size as usize,
            queue_depth: 64,
            completion_order: CompletionOrder::Fifo,
            zoned: None,
        }
    }

    /// A zoned device of `nr_zones` zones, each with full capacity and without limits.
    #[must_use]
    pub fn zoned(block_size: u32, zone_size: u64, nr_zones: u64) -> Self {
        Self {
            zoned: Some(ZonedParams {
                zone_size: Lba(zone_size),
                zone_capacity: Lba(zone_size),
                max_open_zones: 0,
                max_active_zones: 0,
                max_zone_append_size: Lba(0),
            }),
            ..Self::new(block_size, zone_size * nr_zones)
        }
    }

    fn check(&self) -> Result<(), &'static str> {
        if !self.block_size.is_power_of_two() {
            return Err("block size must be a power of two");
        }
        if self.num_blocks == 0 || self.write_unit_size == 0 || self.queue_depth == 0 {
            return Err("block count, write unit and queue depth must be non-zero");
        }
        if !self.buf_align.is_power_of_two() {
            return Err("buffer alignment must be a power of two");
        }
        if let Some(zoned) = &self.zoned {
            if zoned.zone_size.0 == 0 || self.num_blocks % zoned.zone_size.0 != 0 {
                return Err("block count must be a non-zero multiple of zone size");
            }
            if zoned.zone_capacity.0 == 0 || zoned.zone_capacity > zoned.zone_size {
                return Err("zone capacity must be in range [1, zone_size]");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Reject matching submissions with this code.
    Reject(Errno),
    /// Reject the next `n` matching submissions with `NOMEM`.
    Busy(u32),
    /// Accept matching submissions, then complete them with this code.
    Fail(Errno),
    /// Accept matching submissions and never complete them.
    Lose,
}

#[derive(Debug, Clone, Copy)]
struct FaultRule {
    kind: IoKind,
    zone: Option<u64>,
    fault: Fault,
}

/// Snapshot of device counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub descs_opened: u64,
    pub descs_closed: u64,
    pub channels_opened: u64,
    pub channels_released: u64,
    /// Accepted submissions.
    pub submitted: u64,
    /// Submissions rejected with `NOMEM`.
    pub busy: u64,
    /// Submissions rejected with other errors.
    pub rejected: u64,
    pub io_wait_fired: u64,
    pub completed: u64,
    pub failed: u64,
    /// Accepted commands still outstanding when their channel was released.
    pub abandoned: u64,
}

#[derive(Debug, Default)]
struct Accounting {
    descs_opened: AtomicU64,
    descs_closed: AtomicU64,
    channels_opened: AtomicU64,
    channels_released: AtomicU64,
    submitted: AtomicU64,
    busy: AtomicU64,
    rejected: AtomicU64,
    io_wait_fired: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    abandoned: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Clone, Copy)]
struct ZoneState {
    rel_wp: u64,
    cond: ZoneCond,
}

impl Default for ZoneState {
    fn default() -> Self {
        Self {
            rel_wp: 0,
            cond: ZoneCond::Empty,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    /// Written blocks. Unwritten blocks read as zeros.
    blocks: HashMap<u64, Bytes>,
    zones: Box<[ZoneState]>,
    faults: Vec<FaultRule>,
    submitted: HashMap<IoKind, u64>,
    fail_alloc: bool,
    fail_channel: bool,
}

#[derive(Debug)]
pub struct MallocBdev {
    name: String,
    params: MallocParams,
    state: Mutex<State>,
    accounting: Accounting,
}

impl MallocBdev {
    pub fn new(name: impl Into<String>, params: MallocParams) -> Result<Self, Errno> {
        let name = name.into();
        if let Err(reason) = params.check() {
            tracing::error!(%name, reason, "invalid malloc bdev parameters");
            return Err(Errno::INVAL);
        }
        let nr_zones = params
            .zoned
            .map_or(0, |zoned| params.num_blocks / zoned.zone_size.0);
        let state = State {
            zones: vec![ZoneState::default(); nr_zones as usize].into(),
            ..State::default()
        };
        Ok(Self {
            name,
            params,
            state: Mutex::new(state),
            accounting: Accounting::default(),
        })
    }

    #[must_use]
    pub fn params(&self) -> &MallocParams {
        &self.params
    }

    /// Inject a fault for commands of `kind`, targeting zone index `zone` or any block if `None`.
    pub fn inject(&self, kind: IoKind, zone: Option<u64>, fault: Fault) {
        tracing::debug!(bdev = %self.name, %kind, ?zone, ?fault, "injecting fault");
        self.state.lock().faults.push(FaultRule { kind, zone, fault });
    }

    pub fn set_alloc_fails(&self, fails: bool) {
        self.state.lock().fail_alloc = fails;
    }

    pub fn set_channel_unavailable(&self, unavailable: bool) {
        self.state.lock().fail_channel = unavailable;
    }

    #[must_use]
    pub fn stats(&self) -> Stats {
        let a = &self.accounting;
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        Stats {
            descs_opened: get(&a.descs_opened),
            descs_closed: get(&a.descs_closed),
            channels_opened: get(&a.channels_opened),
            channels_released: get(&a.channels_released),
            submitted: get(&a.submitted),
            busy: get(&a.busy),
            rejected: get(&a.rejected),
            io_wait_fired: get(&a.io_wait_fired),
            completed: get(&a.completed),
            failed: get(&a.failed),
            abandoned: get(&a.abandoned),
        }
    }

    /// Accepted submissions of `kind`.
    #[must_use]
    pub fn submitted(&self, kind: IoKind) -> u64 {
        self.state
            .lock()
            .submitted
            .get(&kind)
            .copied()
            .unwrap_or(0)
    }

    #[must_use]
    pub fn zone_info(&self, zone: u64) -> Option<ZoneInfo> {
        let zoned = self.params.zoned?;
        let state = self.state.lock();
        let z = state.zones.get(zone as usize)?;
        Some(zone_info(&zoned, zone, z))
    }

    fn zone_of(&self, lba: Lba) -> Option<u64> {
        self.params.zoned.map(|zoned| lba / zoned.zone_size)
    }

    fn check_range(&self, offset: Lba, len: Lba) -> Result<(), Errno> {
        match offset.0.checked_add(len.0) {
            Some(end) if len.0 != 0 && end <= self.params.num_blocks => Ok(()),
            _ => {
                tracing::error!(bdev = %self.name, %offset, %len, "invalid range");
                Err(Errno::INVAL)
            }
        }
    }

    fn check_data(&self, offset: Lba, data: &[u8]) -> Result<Lba, Errno> {
        let Some(len) = Lba::try_from_bytes(data.len() as u64, self.params.block_size) else {
            tracing::error!(bdev = %self.name, len = data.len(), "unaligned buffer");
            return Err(Errno::INVAL);
        };
        self.check_range(offset, len)?;
        Ok(len)
    }

    fn check_zone_id(&self, zone_id: Lba) -> Result<(ZonedParams, u64), Errno> {
        let Some(zoned) = self.params.zoned else {
            return Err(Errno::OPNOTSUPP);
        };
        if zone_id.0 % zoned.zone_size.0 != 0 || zone_id.0 >= self.params.num_blocks {
            tracing::error!(bdev = %self.name, %zone_id, "invalid zone id");
            return Err(Errno::INVAL);
        }
        Ok((zoned, zone_id / zoned.zone_size))
    }

    fn execute(&self, io: PendingIo) -> Completion {
        let result = match io.fail {
            Some(errno) => Err(errno),
            None => self.state.lock().execute(&self.params, io.op),
        };
        match &result {
            Ok(_) => bump(&self.accounting.completed),
            Err(errno) => {
                bump(&self.accounting.failed);
                tracing::debug!(bdev = %self.name, kind = %io.kind, %errno, "command failed");
            }
        }
        Completion {
            tag: io.tag,
            kind: io.kind,
            result,
        }
    }
}

fn zone_info(zoned: &ZonedParams, zone: u64, z: &ZoneState) -> ZoneInfo {
    let zone_id = zoned.zone_size * zone;
    ZoneInfo {
        zone_id,
        write_pointer: zone_id + Lba(z.rel_wp),
        capacity: zoned.zone_capacity,
        cond: z.cond,
    }
}

impl State {
    fn execute(&mut self, params: &MallocParams, op: Op) -> Result<IoOutput, Errno> {
        let bs = params.block_size as usize;
        match op {
            Op::Read { offset, len } => {
                let mut buf = BytesMut::with_capacity(len.0 as usize * bs);
                for lba in offset.0..offset.0 + len.0 {
                    match self.blocks.get(&lba) {
                        Some(block) => buf.extend_from_slice(block),
                        None => buf.resize(buf.len() + bs, 0),
                    }
                }
                Ok(IoOutput::Read(buf.freeze()))
            }
            Op::Write { offset, data } => {
                if let Some(zoned) = &params.zoned {
                    let zone = offset / zoned.zone_size;
                    let z = self.zones[zone as usize];
                    if zoned.zone_size * zone + Lba(z.rel_wp) != offset {
                        tracing::warn!(zone, rel_wp = z.rel_wp, %offset, "nonsequential write");
                        return Err(Errno::IO);
                    }
                    self.advance_wp(zoned, zone, &data, bs)?;
                }
                self.store(offset, &data, bs);
                Ok(IoOutput::Done)
            }
            Op::Zone { zone, action } => {
                let zoned = params.zoned.as_ref().expect("checked on submission");
                self.manage_zone(zoned, zone, action)?;
                Ok(IoOutput::Done)
            }
            Op::Append { zone, data } => {
                let zoned = params.zoned.as_ref().expect("checked on submission");
                let prev_wp = zoned.zone_size * zone + Lba(self.zones[zone as usize].rel_wp);
                self.advance_wp(zoned, zone, &data, bs)?;
                self.store(prev_wp, &data, bs);
                Ok(IoOutput::Appended(prev_wp))
            }
            Op::ZoneInfo { zone, nr_zones } => {
                let zoned = params.zoned.as_ref().expect("checked on submission");
                let infos = self.zones[zone as usize..]
                    .iter()
                    .zip(zone..)
                    .take(nr_zones)
                    .map(|(z, zone)| zone_info(zoned, zone, z))
                    .collect();
                Ok(IoOutput::Zones(infos))
            }
        }
    }

    fn store(&mut self, offset: Lba, data: &Bytes, bs: usize) {
        for (i, lba) in (offset.0..).take(data.len() / bs).enumerate() {
            self.blocks.insert(lba, data.slice(i * bs..(i + 1) * bs));
        }
    }

    fn advance_wp(
        &mut self,
        zoned: &ZonedParams,
        zone: u64,
        data: &Bytes,
        bs: usize,
    ) -> Result<(), Errno> {
        let z = self.zones[zone as usize];
        let new_rel_wp = z
            .rel_wp
            .checked_add((data.len() / bs) as u64)
            .filter(|&wp| wp <= zoned.zone_capacity.0)
            .ok_or(Errno::IO)?;
        let cond = match z.cond {
            ZoneCond::Full => return Err(Errno::IO),
            _ if new_rel_wp == zoned.zone_capacity.0 => ZoneCond::Full,
            ZoneCond::Empty | ZoneCond::Closed => {
                self.check_open_limits(zoned, z.cond)?;
                ZoneCond::ImpOpen
            }
            cond => cond,
        };
        self.zones[zone as usize] = ZoneState {
            rel_wp: new_rel_wp,
            cond,
        };
        Ok(())
    }

    /// Check the limits for a zone in `from` condition becoming open.
    fn check_open_limits(&self, zoned: &ZonedParams, from: ZoneCond) -> Result<(), Errno> {
        let open = self.zones.iter().filter(|z| z.cond.is_open()).count();
        if zoned.max_open_zones != 0 && open >= zoned.max_open_zones as usize {
            tracing::warn!(open, max = zoned.max_open_zones, "too many open zones");
            return Err(Errno::IO);
        }
        let active = open
            + self
                .zones
                .iter()
                .filter(|z| z.cond == ZoneCond::Closed)
                .count();
        if from == ZoneCond::Empty
            && zoned.max_active_zones != 0
            && active >= zoned.max_active_zones as usize
        {
            tracing::warn!(active, max = zoned.max_active_zones, "too many active zones");
            return Err(Errno::IO);
        }
        Ok(())
    }

    fn manage_zone(
        &mut self,
        zoned: &ZonedParams,
        zone: u64,
        action: ZoneAction,
    ) -> Result<(), Errno> {
        let z = self.zones[zone as usize];
        let cond = match (action, z.cond) {
            (ZoneAction::Reset, _) => {
                let start = (zoned.zone_size * zone).0;
                for lba in start..start + z.rel_wp {
                    self.blocks.remove(&lba);
                }
                self.zones[zone as usize] = ZoneState::default();
                return Ok(());
            }
            (ZoneAction::Open, ZoneCond::Empty | ZoneCond::Closed) => {
                self.check_open_limits(zoned, z.cond)?;
                ZoneCond::ExpOpen
            }
            (ZoneAction::Open, ZoneCond::ImpOpen | ZoneCond::ExpOpen) => ZoneCond::ExpOpen,
            (ZoneAction::Close, ZoneCond::ImpOpen | ZoneCond::ExpOpen) => {
                if z.rel_wp == 0 {
                    ZoneCond::Empty
                } else {
                    ZoneCond::Closed
                }
            }
            (ZoneAction::Close, ZoneCond::Empty | ZoneCond::Closed) => z.cond,
            (ZoneAction::Open | ZoneAction::Close, ZoneCond::Full) => return Err(Errno::IO),
            (ZoneAction::Finish, _) => {
                self.zones[zone as usize] = ZoneState {
                    rel_wp: zoned.zone_capacity.0,
                    cond: ZoneCond::Full,
                };
                return Ok(());
            }
        };
        self.zones[zone as usize].cond = cond;
        Ok(())
    }
}

impl Bdev for MallocBdev {
    type Channel<'a>
        = MallocChannel<'a>
    where
        Self: 'a;

    fn name(&self) -> &str {
        &self.name
    }

    fn block_size(&self) -> u32 {
        self.params.block_size
    }

    fn write_unit_size(&self) -> u32 {
        self.params.write_unit_size
    }

    fn buf_align(&self) -> usize {
        self.params.buf_align
    }

    fn num_blocks(&self) -> u64 {
        self.params.num_blocks
    }

    fn is_zoned(&self) -> bool {
        self.params.zoned.is_some()
    }

    fn num_zones(&self) -> u64 {
        self.params
            .zoned
            .map_or(0, |zoned| self.params.num_blocks / zoned.zone_size.0)
    }

    fn zone_size(&self) -> Lba {
        self.params.zoned.map_or(Lba(0), |zoned| zoned.zone_size)
    }

    fn max_open_zones(&self) -> u32 {
        self.params.zoned.map_or(0, |zoned| zoned.max_open_zones)
    }

    fn max_active_zones(&self) -> u32 {
        self.params.zoned.map_or(0, |zoned| zoned.max_active_zones)
    }

    fn max_zone_append_size(&self) -> Lba {
        self.params
            .zoned
            .map_or(Lba(0), |zoned| zoned.max_zone_append_size)
    }

    fn claim(&self, _write: bool) -> Result<(), Errno> {
        bump(&self.accounting.descs_opened);
        Ok(())
    }

    fn release(&self) {
        bump(&self.accounting.descs_closed);
    }

    fn get_io_channel(&self) -> Option<Self::Channel<'_>> {
        if self.state.lock().fail_channel {
            return None;
        }
        bump(&self.accounting.channels_opened);
        let rng = match self.params.completion_order {
            CompletionOrder::Shuffled(seed) => Some(StdRng::seed_from_u64(seed)),
            CompletionOrder::Fifo | CompletionOrder::Lifo => None,
        };
        Some(MallocChannel {
            bdev: self,
            pending: VecDeque::new(),
            lost: 0,
            waiters: VecDeque::new(),
            fired: VecDeque::new(),
            rng,
        })
    }

    fn dma_zalloc(&self, len: usize) -> Option<DmaBuf> {
        if self.state.lock().fail_alloc {
            return None;
        }
        DmaBuf::zeroed(len, self.params.buf_align)
    }
}

#[derive(Debug)]
enum Op {
    Read { offset: Lba, len: Lba },
    Write { offset: Lba, data: Bytes },
    Zone { zone: u64, action: ZoneAction },
    Append { zone: u64, data: Bytes },
    ZoneInfo { zone: u64, nr_zones: usize },
}

#[derive(Debug)]
struct PendingIo {
    tag: Tag,
    kind: IoKind,
    op: Op,
    fail: Option<Errno>,
}

enum Admission {
    Complete,
    Fail(Errno),
    Lose,
}

#[derive(Debug)]
pub struct MallocChannel<'a> {
    bdev: &'a MallocBdev,
    pending: VecDeque<PendingIo>,
    /// Accepted commands which will never complete. They still occupy the queue.
    lost: usize,
    waiters: VecDeque<Tag>,
    /// Io-waits to be fired before the next completion.
    fired: VecDeque<Tag>,
    rng: Option<StdRng>,
}

impl MallocChannel<'_> {
    fn in_flight(&self) -> usize {
        self.pending.len() + self.lost
    }

    fn submit(
        &mut self,
        kind: IoKind,
        zone: Option<u64>,
        tag: Tag,
        op: impl FnOnce() -> Op,
    ) -> Result<(), Errno> {
        let bdev = self.bdev;
        let mut state = bdev.state.lock();
        let mut admission = Admission::Complete;
        for rule in state
            .faults
            .iter_mut()
            .filter(|rule| rule.kind == kind && (rule.zone.is_none() || rule.zone == zone))
        {
            match &mut rule.fault {
                Fault::Reject(errno) => {
                    bump(&bdev.accounting.rejected);
                    return Err(*errno);
                }
                Fault::Busy(0) => {}
                Fault::Busy(n) => {
                    *n -= 1;
                    bump(&bdev.accounting.busy);
                    return Err(Errno::NOMEM);
                }
                Fault::Fail(errno) => admission = Admission::Fail(*errno),
                Fault::Lose => admission = Admission::Lose,
            }
        }
        if self.in_flight() >= bdev.params.queue_depth {
            bump(&bdev.accounting.busy);
            tracing::trace!(bdev = %bdev.name, %kind, "queue full");
            return Err(Errno::NOMEM);
        }
        *state.submitted.entry(kind).or_default() += 1;
        drop(state);
        bump(&bdev.accounting.submitted);

        let fail = match admission {
            Admission::Complete => None,
            Admission::Fail(errno) => Some(errno),
            Admission::Lose => {
                self.lost += 1;
                return Ok(());
            }
        };
        self.pending.push_back(PendingIo {
            tag,
            kind,
            op: op(),
            fail,
        });
        Ok(())
    }

    fn fire(&mut self, tag: Tag) -> Event {
        bump(&self.bdev.accounting.io_wait_fired);
        Event::IoWait(tag)
    }
}

impl IoChannel for MallocChannel<'_> {
    fn read(&mut self, offset: Lba, len: Lba, tag: Tag) -> Result<(), Errno> {
        self.bdev.check_range(offset, len)?;
        let zone = self.bdev.zone_of(offset);
        self.submit(IoKind::Read, zone, tag, || Op::Read { offset, len })
    }

    fn write(&mut self, offset: Lba, data: &[u8], tag: Tag) -> Result<(), Errno> {
        self.bdev.check_data(offset, data)?;
        let zone = self.bdev.zone_of(offset);
        self.submit(IoKind::Write, zone, tag, || Op::Write {
            offset,
            data: Bytes::copy_from_slice(data),
        })
    }

    fn zone_management(
        &mut self,
        zone_id: Lba,
        action: ZoneAction,
        tag: Tag,
    ) -> Result<(), Errno> {
        let (_, zone) = self.bdev.check_zone_id(zone_id)?;
        self.submit(IoKind::Zone(action), Some(zone), tag, || Op::Zone {
            zone,
            action,
        })
    }

    fn zone_append(&mut self, zone_id: Lba, data: &[u8], tag: Tag) -> Result<(), Errno> {
        let (zoned, zone) = self.bdev.check_zone_id(zone_id)?;
        let len = self.bdev.check_data(zone_id, data)?;
        if zoned.max_zone_append_size.0 != 0 && len > zoned.max_zone_append_size {
            tracing::error!(%len, max = %zoned.max_zone_append_size, "zone append too large");
            return Err(Errno::INVAL);
        }
        self.submit(IoKind::ZoneAppend, Some(zone), tag, || Op::Append {
            zone,
            data: Bytes::copy_from_slice(data),
        })
    }

    fn get_zone_info(&mut self, zone_id: Lba, nr_zones: usize, tag: Tag) -> Result<(), Errno> {
        let (_, zone) = self.bdev.check_zone_id(zone_id)?;
        if nr_zones == 0 {
            return Err(Errno::INVAL);
        }
        self.submit(IoKind::GetZoneInfo, Some(zone), tag, || Op::ZoneInfo {
            zone,
            nr_zones,
        })
    }

    fn queue_io_wait(&mut self, tag: Tag) -> Result<(), Errno> {
        self.waiters.push_back(tag);
        Ok(())
    }

    async fn next_event(&mut self) -> Option<Event> {
        // Completions are never delivered inside the submission call stack.
        tokio::task::yield_now().await;

        if let Some(tag) = self.fired.pop_front() {
            return Some(self.fire(tag));
        }

        if self.pending.is_empty() {
            if self.in_flight() < self.bdev.params.queue_depth {
                if let Some(tag) = self.waiters.pop_front() {
                    return Some(self.fire(tag));
                }
            }
            if self.lost != 0 || !self.waiters.is_empty() {
                return future::pending().await;
            }
            return None;
        }

        let idx = match self.bdev.params.completion_order {
            CompletionOrder::Fifo => 0,
            CompletionOrder::Lifo => self.pending.len() - 1,
            CompletionOrder::Shuffled(_) => self
                .rng
                .as_mut()
                .expect("rng is created for shuffled order")
                .random_range(0..self.pending.len()),
        };
        let io = self.pending.remove(idx).expect("index is in range");
        let completion = self.bdev.execute(io);

        // One slot is freed.
        if let Some(tag) = self.waiters.pop_front() {
            self.fired.push_back(tag);
        }
        Some(Event::Completion(completion))
    }
}

impl Drop for MallocChannel<'_> {
    fn drop(&mut self) {
        let in_flight = self.in_flight();
        if in_flight != 0 {
            tracing::warn!(bdev = %self.bdev.name, in_flight, "channel released with commands in flight");
            self.bdev
                .accounting
                .abandoned
                .fetch_add(in_flight as u64, Ordering::Relaxed);
        }
        bump(&self.bdev.accounting.channels_released);
    }
}

/// Named devices available to be opened.
#[derive(Debug, Default)]
pub struct BdevRegistry {
    bdevs: Vec<MallocBdev>,
}

impl BdevRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, bdev: MallocBdev) -> Result<(), Errno> {
        if self.get(bdev.name()).is_some() {
            tracing::error!(name = bdev.name(), "bdev already exists");
            return Err(Errno::EXIST);
        }
        self.bdevs.push(bdev);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&MallocBdev> {
        self.bdevs.iter().find(|bdev| bdev.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MallocBdev> + '_ {
        self.bdevs.iter()
    }
}
