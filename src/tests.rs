use std::fmt::Write;
use std::mem;

use bytes::Bytes;
use iocmd_bdev::{
    Bdev, CompletionOrder, DmaBuf, Event, Fault, IoChannel, IoKind, IoOutput, Lba, MallocBdev,
    MallocChannel, MallocParams, Tag, ZoneAction,
};
use parking_lot::Mutex;
use rstest::rstest;
use rustix::io::Errno;

use crate::error::{RunError, SetupError};
use crate::pipeline::{self, Outcome, RunOptions, State};
use crate::stage::{Mode, Stage, UnitTag};

/// A [`MallocBdev`] recording every submission and event.
#[derive(Debug)]
pub struct TestBdev {
    inner: MallocBdev,
    log: Mutex<String>,
    quirks: Mutex<Quirks>,
}

/// Misbehaviors layered over the inner device.
#[derive(Debug, Default, Clone, Copy)]
struct Quirks {
    corrupt_reads: bool,
    zone_size: Option<Lba>,
    num_zones: Option<u64>,
    /// Swallow the completion of this unit.
    lost: Option<UnitTag>,
    io_wait_error: Option<Errno>,
}

impl TestBdev {
    pub fn new(params: MallocParams) -> Self {
        Self {
            inner: MallocBdev::new("Test0", params).unwrap(),
            log: Mutex::default(),
            quirks: Mutex::default(),
        }
    }

    pub fn zoned(nr_zones: u64) -> Self {
        Self::new(MallocParams::zoned(4096, 4096, nr_zones))
    }

    pub fn drain_log(&self) -> String {
        mem::take(&mut self.log.lock())
    }
}

macro_rules! act {
    ($this:expr, $($tt:tt)*) => {
        write!(*$this.log.lock(), "{};", format_args!($($tt)*)).unwrap()
    };
}

impl Bdev for TestBdev {
    type Channel<'a>
        = TestChannel<'a>
    where
        Self: 'a;

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn block_size(&self) -> u32 {
        self.inner.block_size()
    }

    fn write_unit_size(&self) -> u32 {
        self.inner.write_unit_size()
    }

    fn buf_align(&self) -> usize {
        self.inner.buf_align()
    }

    fn num_blocks(&self) -> u64 {
        self.inner.num_blocks()
    }

    fn is_zoned(&self) -> bool {
        self.inner.is_zoned()
    }

    fn num_zones(&self) -> u64 {
        self.quirks
            .lock()
            .num_zones
            .unwrap_or_else(|| self.inner.num_zones())
    }

    fn zone_size(&self) -> Lba {
        self.quirks
            .lock()
            .zone_size
            .unwrap_or_else(|| self.inner.zone_size())
    }

    fn max_open_zones(&self) -> u32 {
        self.inner.max_open_zones()
    }

    fn max_active_zones(&self) -> u32 {
        self.inner.max_active_zones()
    }

    fn max_zone_append_size(&self) -> Lba {
        self.inner.max_zone_append_size()
    }

    fn claim(&self, write: bool) -> Result<(), Errno> {
        act!(self, "open");
        self.inner.claim(write)
    }

    fn release(&self) {
        act!(self, "close");
        self.inner.release();
    }

    fn get_io_channel(&self) -> Option<Self::Channel<'_>> {
        let inner = self.inner.get_io_channel()?;
        act!(self, "channel");
        Some(TestChannel { bdev: self, inner })
    }

    fn dma_zalloc(&self, len: usize) -> Option<DmaBuf> {
        self.inner.dma_zalloc(len)
    }
}

#[derive(Debug)]
pub struct TestChannel<'a> {
    bdev: &'a TestBdev,
    inner: MallocChannel<'a>,
}

impl TestChannel<'_> {
    fn log_submit(&self, tag: Tag, ret: Result<(), Errno>) -> Result<(), Errno> {
        let tag = UnitTag::try_from(tag).unwrap();
        match ret {
            Ok(()) => act!(self.bdev, "{tag}"),
            Err(Errno::NOMEM) => act!(self.bdev, "{tag}!busy"),
            Err(_) => act!(self.bdev, "{tag}!err"),
        }
        ret
    }
}

impl Drop for TestChannel<'_> {
    fn drop(&mut self) {
        act!(self.bdev, "put");
    }
}

impl IoChannel for TestChannel<'_> {
    fn read(&mut self, offset: Lba, len: Lba, tag: Tag) -> Result<(), Errno> {
        let ret = self.inner.read(offset, len, tag);
        self.log_submit(tag, ret)
    }

    fn write(&mut self, offset: Lba, data: &[u8], tag: Tag) -> Result<(), Errno> {
        let ret = self.inner.write(offset, data, tag);
        self.log_submit(tag, ret)
    }

    fn zone_management(
        &mut self,
        zone_id: Lba,
        action: ZoneAction,
        tag: Tag,
    ) -> Result<(), Errno> {
        let ret = self.inner.zone_management(zone_id, action, tag);
        self.log_submit(tag, ret)
    }

    fn zone_append(&mut self, zone_id: Lba, data: &[u8], tag: Tag) -> Result<(), Errno> {
        let ret = self.inner.zone_append(zone_id, data, tag);
        self.log_submit(tag, ret)
    }

    fn get_zone_info(&mut self, zone_id: Lba, nr_zones: usize, tag: Tag) -> Result<(), Errno> {
        let ret = self.inner.get_zone_info(zone_id, nr_zones, tag);
        self.log_submit(tag, ret)
    }

    fn queue_io_wait(&mut self, tag: Tag) -> Result<(), Errno> {
        if let Some(errno) = self.bdev.quirks.lock().io_wait_error {
            act!(self.bdev, "wait!err");
            return Err(errno);
        }
        act!(self.bdev, "wait");
        self.inner.queue_io_wait(tag)
    }

    async fn next_event(&mut self) -> Option<Event> {
        loop {
            let mut event = self.inner.next_event().await;
            let quirks = *self.bdev.quirks.lock();
            match &mut event {
                Some(Event::Completion(c)) => {
                    let tag = UnitTag::try_from(c.tag).unwrap();
                    if quirks.lost == Some(tag) {
                        act!(self.bdev, "lost {tag}");
                        continue;
                    }
                    match &mut c.result {
                        Ok(output) => {
                            if let IoOutput::Read(data) = output {
                                if quirks.corrupt_reads {
                                    *data = Bytes::from(vec![0xFF; data.len()]);
                                }
                            }
                            act!(self.bdev, "done {tag}");
                        }
                        Err(_) => act!(self.bdev, "fail {tag}"),
                    }
                }
                Some(Event::IoWait(_)) => act!(self.bdev, "fire"),
                None => act!(self.bdev, "idle"),
            }
            return event;
        }
    }
}

async fn run(bdev: &TestBdev) -> (Outcome, String) {
    let mut out = Vec::new();
    let outcome = pipeline::run(bdev, RunOptions::default(), &mut out).await;
    (outcome, String::from_utf8(out).unwrap())
}

fn entries(log: &str) -> Vec<&str> {
    log.split_terminator(';').collect()
}

fn count(entries: &[&str], entry: &str) -> usize {
    entries.iter().filter(|&&e| e == entry).count()
}

#[tokio::test]
async fn sequential() {
    let bdev = TestBdev::new(MallocParams::new(4096, 16));
    let (outcome, out) = run(&bdev).await;
    outcome.result.as_ref().unwrap();
    assert_eq!(outcome.state(), State::Success);
    assert_eq!(outcome.geometry, None);
    assert_eq!(outcome.completed, [Stage::Write, Stage::Read]);
    assert_eq!(
        bdev.drain_log(),
        "open;channel;Write#0;done Write#0;Read#0;done Read#0;put;close;",
    );
    assert_eq!(
        out,
        "\
Writing to the bdev...
Write complete
Reading from the bdev...
Read string from bdev : Hello World!
Read complete
",
    );
}

#[tokio::test]
async fn zoned_stage_barriers() {
    let mut params = MallocParams::zoned(4096, 4096, 20);
    params.completion_order = CompletionOrder::Lifo;
    let bdev = TestBdev::new(params);
    let (outcome, out) = run(&bdev).await;
    outcome.result.as_ref().unwrap();
    assert_eq!(outcome.completed, Mode::Zoned.stages());

    let log = bdev.drain_log();
    let log = entries(&log);
    assert_eq!(log[..3], ["open", "channel", "GeometryDiscovery#0"]);
    assert_eq!(log[log.len() - 2..], ["put", "close"]);
    for (stage, expect) in Mode::Zoned.stages().iter().zip([1, 15, 5, 5, 10, 5]) {
        let done = log
            .iter()
            .filter(|e| e.starts_with(&format!("done {stage:?}#")))
            .count();
        assert_eq!(done, expect, "{stage}");
    }
    for pair in Mode::Zoned.stages().windows(2) {
        let last_done = log
            .iter()
            .rposition(|e| e.starts_with(&format!("done {:?}#", pair[0])))
            .unwrap();
        let first_submit = log
            .iter()
            .position(|e| e.starts_with(&format!("{:?}#", pair[1])))
            .unwrap();
        assert!(last_done < first_submit, "{} overlaps {}", pair[0], pair[1]);
    }
    assert_eq!(count(&log, "ZoneOpen#5"), 1);
    assert_eq!(count(&log, "ZoneOpen#14"), 1);
    assert_eq!(count(&log, "ZoneClose#9"), 0);

    assert!(out.starts_with(
        "Get zone info...\nGet zone info complete\n[zone info]\nnum zone: 20 zones\n"
    ));
    assert!(out.contains("Reset zone #0 ~ zone #14...\n"));
    assert!(out.contains("append: offset_blocks = 0x57, zone_id=0x0\n"));
    assert!(out.contains("append: offset_blocks = 0x4057, zone_id=0x4000\n"));
    assert!(out.contains("read: offset_blocks = 0x3000\n"));
    assert_eq!(out.matches("Hello World!\n").count(), 5);
    assert!(out.ends_with("Open complete\nClose zone #10 ~ zone #14...\nClose complete\n"));
}

#[tokio::test]
async fn retry_never_reissues_accepted_units() {
    let mut params = MallocParams::zoned(4096, 4096, 20);
    params.queue_depth = 3;
    params.completion_order = CompletionOrder::Lifo;
    let bdev = TestBdev::new(params);
    let (outcome, _) = run(&bdev).await;
    outcome.result.as_ref().unwrap();

    let log = bdev.drain_log();
    let log = entries(&log);
    assert!(count(&log, "ZoneReset#3!busy") >= 1);
    assert!(count(&log, "wait") >= 1);
    assert_eq!(count(&log, "wait"), count(&log, "fire"));
    for stage in Mode::Zoned.stages() {
        for unit in stage.units(20) {
            let tag = UnitTag {
                stage: *stage,
                unit,
            };
            assert_eq!(count(&log, &tag.to_string()), 1, "{tag}");
            assert_eq!(count(&log, &format!("done {tag}")), 1, "{tag}");
        }
    }

    // Deferred units are retried in order.
    let resets = log
        .iter()
        .filter_map(|e| e.strip_prefix("ZoneReset#"))
        .filter(|e| !e.ends_with("!busy"))
        .map(|e| e.parse::<u64>().unwrap())
        .collect::<Vec<_>>();
    assert_eq!(resets, (0..15).collect::<Vec<_>>());

    let stats = bdev.inner.stats();
    assert_eq!(stats.submitted, 41);
    assert_eq!(stats.completed, 41);
    assert_eq!(stats.io_wait_fired, count(&log, "fire") as u64);
}

#[tokio::test]
async fn forced_busy_on_idle_device() {
    let bdev = TestBdev::zoned(20);
    bdev.inner
        .inject(IoKind::ZoneAppend, Some(2), Fault::Busy(2));
    let (outcome, out) = run(&bdev).await;
    outcome.result.as_ref().unwrap();

    let log = bdev.drain_log();
    let log = entries(&log);
    assert_eq!(count(&log, "ZoneAppend#2!busy"), 2);
    assert_eq!(count(&log, "ZoneAppend#2"), 1);
    // Units behind the busy one wait for it.
    let busy = log.iter().position(|&e| e == "ZoneAppend#2!busy").unwrap();
    let retried = log.iter().position(|&e| e == "ZoneAppend#2").unwrap();
    let next = log.iter().position(|&e| e == "ZoneAppend#3").unwrap();
    assert!(busy < retried && retried < next);
    assert_eq!(out.matches("append: ").count(), 5);
}

#[tokio::test]
async fn submit_error_stops_the_stage() {
    let bdev = TestBdev::zoned(20);
    bdev.inner.inject(
        IoKind::Zone(ZoneAction::Reset),
        Some(3),
        Fault::Reject(Errno::INVAL),
    );
    let (outcome, _) = run(&bdev).await;
    assert_eq!(outcome.state(), State::Failed);
    assert!(matches!(
        outcome.result,
        Err(RunError::Submit {
            stage: Stage::ZoneReset,
            unit: 3,
            errno: Errno::INVAL,
            ..
        })
    ));
    assert_eq!(outcome.completed, [Stage::GeometryDiscovery]);

    let log = bdev.drain_log();
    let log = entries(&log);
    let failed = log.iter().position(|&e| e == "ZoneReset#3!err").unwrap();
    assert_eq!(count(&log, "ZoneReset#4"), 0);
    // In-flight units are drained before the channel is put back.
    assert_eq!(
        log[failed + 1..],
        [
            "done ZoneReset#0",
            "done ZoneReset#1",
            "done ZoneReset#2",
            "put",
            "close",
        ],
    );
    assert_eq!(bdev.inner.stats().abandoned, 0);
}

#[tokio::test]
async fn completion_failure_drains_in_flight() {
    let bdev = TestBdev::zoned(20);
    bdev.inner.inject(
        IoKind::Zone(ZoneAction::Reset),
        Some(0),
        Fault::Fail(Errno::IO),
    );
    let (outcome, _) = run(&bdev).await;
    assert!(matches!(
        outcome.result,
        Err(RunError::Completion {
            stage: Stage::ZoneReset,
            unit: 0,
            ..
        })
    ));

    let log = bdev.drain_log();
    let log = entries(&log);
    let failed = log.iter().position(|&e| e == "fail ZoneReset#0").unwrap();
    assert!(log[failed + 1..log.len() - 2]
        .iter()
        .all(|e| e.starts_with("done ZoneReset#")));
    assert_eq!(log.len() - 2 - (failed + 1), 14);
    assert_eq!(count(&log, "ZoneAppend#0"), 0);
}

#[tokio::test]
async fn data_mismatch_is_fatal() {
    let bdev = TestBdev::zoned(20);
    bdev.quirks.lock().corrupt_reads = true;
    let (outcome, out) = run(&bdev).await;
    assert!(matches!(
        outcome.result,
        Err(RunError::DataMismatch {
            stage: Stage::ZoneRead,
            unit: 0,
            offset: Lba(0),
        })
    ));
    assert_eq!(outcome.result.as_ref().unwrap_err().stage(), Some(Stage::ZoneRead));
    assert!(!out.contains("Hello World!"));
    assert_eq!(count(&entries(&bdev.drain_log()), "ZoneOpen#5"), 0);
}

#[tokio::test]
async fn small_device_skips_empty_stages() {
    let bdev = TestBdev::zoned(4);
    let (outcome, out) = run(&bdev).await;
    outcome.result.as_ref().unwrap();
    assert_eq!(outcome.completed, Mode::Zoned.stages());
    assert_eq!(outcome.geometry.unwrap().num_zones(), 4);

    let log = bdev.drain_log();
    let log = entries(&log);
    assert_eq!(count(&log, "ZoneReset#3"), 1);
    assert_eq!(count(&log, "ZoneReset#4"), 0);
    assert_eq!(count(&log, "ZoneAppend#3"), 1);
    assert!(!log.iter().any(|e| e.starts_with("ZoneOpen") || e.starts_with("ZoneClose")));
    assert!(out.ends_with(
        "Open no zones...\nOpen complete\nClose no zones...\nClose complete\n"
    ));
}

#[rstest]
#[case::zero_zone_size(None, Some(Lba(0)))]
#[case::zones_beyond_device(Some(40), None)]
#[tokio::test]
async fn bogus_zone_layout_is_rejected(
    #[case] num_zones: Option<u64>,
    #[case] zone_size: Option<Lba>,
) {
    let bdev = TestBdev::zoned(20);
    *bdev.quirks.lock() = Quirks {
        num_zones,
        zone_size,
        ..Quirks::default()
    };
    let (outcome, out) = run(&bdev).await;
    let err = outcome.result.as_ref().unwrap_err();
    assert!(
        matches!(
            err,
            RunError::Setup(SetupError::ZeroZoneSize | SetupError::ZonesBeyondDevice { .. })
        ),
        "{err:?}",
    );
    if num_zones.is_some() {
        assert!(
            matches!(
                err,
                RunError::Setup(SetupError::ZonesBeyondDevice {
                    num_zones: 40,
                    zone_size: Lba(4096),
                    num_blocks: 81920,
                })
            ),
            "{err:?}",
        );
    }
    assert_eq!(outcome.completed, [Stage::GeometryDiscovery]);
    assert!(
        out.starts_with("Get zone info...\nGet zone info complete\n[zone info]\n"),
        "{out}",
    );
    assert!(!out.contains("Reset zone"), "{out}");
    assert_eq!(
        bdev.drain_log(),
        "open;channel;GeometryDiscovery#0;done GeometryDiscovery#0;put;close;",
    );
}

#[tokio::test]
async fn lost_completion_stalls_the_stage() {
    let bdev = TestBdev::zoned(20);
    bdev.quirks.lock().lost = Some(UnitTag {
        stage: Stage::ZoneReset,
        unit: 14,
    });
    let (outcome, _) = run(&bdev).await;
    assert!(matches!(
        outcome.result,
        Err(RunError::Stalled {
            stage: Stage::ZoneReset,
            completed: 14,
            expected: 15,
        })
    ));
    assert_eq!(outcome.completed, [Stage::GeometryDiscovery]);

    let log = bdev.drain_log();
    let log = entries(&log);
    // The drain sees the same idle device, then everything is released.
    assert_eq!(
        log[log.len() - 6..],
        [
            "done ZoneReset#13",
            "lost ZoneReset#14",
            "idle",
            "idle",
            "put",
            "close",
        ],
    );
    assert_eq!(count(&log, "ZoneAppend#0"), 0);
}

#[tokio::test]
async fn io_wait_failure_is_fatal() {
    let mut params = MallocParams::zoned(4096, 4096, 20);
    params.queue_depth = 3;
    let bdev = TestBdev::new(params);
    bdev.quirks.lock().io_wait_error = Some(Errno::AGAIN);
    let (outcome, _) = run(&bdev).await;
    assert!(matches!(
        outcome.result,
        Err(RunError::IoWait {
            stage: Stage::ZoneReset,
            errno: Errno::AGAIN,
        })
    ));
    assert_eq!(outcome.result.as_ref().unwrap_err().stage(), Some(Stage::ZoneReset));

    let log = bdev.drain_log();
    let log = entries(&log);
    let busy = log.iter().position(|&e| e == "ZoneReset#3!busy").unwrap();
    assert_eq!(
        log[busy + 1..],
        [
            "wait!err",
            "done ZoneReset#0",
            "done ZoneReset#1",
            "done ZoneReset#2",
            "put",
            "close",
        ],
    );
    assert_eq!(count(&log, "ZoneReset#4"), 0);
}
