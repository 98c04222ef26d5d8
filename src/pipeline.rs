//! Drives one device through the fixed pipeline of stages.
//!
//! All units of a stage are submitted at once. Their completions are counted, and only when the
//! last one arrives is the next stage entered. Submissions refused with `NOMEM` are deferred per
//! unit and resubmitted in order when the device fires the io-wait. The first hard error ends
//! the run: no more units are submitted, in-flight ones are drained, then the channel and the
//! descriptor are released.
use std::borrow::Cow;
use std::io::Write;
use std::time::Duration;

use iocmd_bdev::{
    Bdev, Completion, Desc, DmaBuf, Event, IoChannel, IoOutput, Lba, Tag, ZoneAction,
};
use rustix::io::Errno;

use crate::backpressure::Backpressure;
use crate::barrier::CompletionCounter;
use crate::error::{RunError, SetupError};
use crate::geometry::ZoneGeometry;
use crate::report::Progress;
use crate::stage::{Mode, Stage, UnitTag, APPEND_PROBE_OFFSET};

/// Leading content of the I/O buffer. The rest is zeros.
pub const PAYLOAD: &[u8] = b"Hello World!\n";

#[derive(Debug, Default, Clone, Copy)]
pub struct RunOptions {
    /// Fail the run if no event arrives for this long while a stage is in progress.
    pub stage_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Running(Stage),
    Success,
    Failed,
}

/// The result of a run, after every resource is released.
#[derive(Debug)]
pub struct Outcome {
    pub result: Result<(), RunError>,
    /// Set once geometry discovery completed.
    pub geometry: Option<ZoneGeometry>,
    /// Stages which reached their completion target, in order.
    pub completed: Vec<Stage>,
}

impl Outcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    #[must_use]
    pub fn state(&self) -> State {
        if self.is_success() {
            State::Success
        } else {
            State::Failed
        }
    }
}

/// Open `bdev`, run the pipeline selected by its zoned capability and release it.
///
/// Progress is written to `out`.
pub async fn run<B: Bdev + ?Sized, W: Write>(bdev: &B, options: RunOptions, out: W) -> Outcome {
    match Run::setup(bdev, options, out) {
        Ok(run) => run.drive().await,
        Err(err) => {
            tracing::error!(bdev = bdev.name(), %err, "setup failed");
            Outcome {
                result: Err(err.into()),
                geometry: None,
                completed: Vec::new(),
            }
        }
    }
}

enum Submitted {
    Accepted,
    Busy,
}

struct Run<'a, B: Bdev + ?Sized + 'a, W> {
    // NB. Order matters. The channel must be put back before the descriptor is closed.
    channel: B::Channel<'a>,
    desc: Desc<'a, B>,
    buf: DmaBuf,
    buf_blocks: Lba,
    /// What every read is expected to return.
    expected: Box<[u8]>,
    mode: Mode,
    state: State,
    counter: CompletionCounter,
    backpressure: Backpressure,
    in_flight: usize,
    geometry: Option<ZoneGeometry>,
    completed: Vec<Stage>,
    options: RunOptions,
    progress: Progress<W>,
}

impl<'a, B: Bdev + ?Sized + 'a, W: Write> Run<'a, B, W> {
    fn setup(bdev: &'a B, options: RunOptions, out: W) -> Result<Self, SetupError> {
        tracing::info!(bdev = bdev.name(), "opening bdev");
        let desc = Desc::open(bdev, true).map_err(|errno| SetupError::Open {
            name: bdev.name().to_owned(),
            errno,
        })?;

        tracing::info!("opening io channel");
        let channel = desc.get_io_channel().ok_or(SetupError::Channel)?;

        let buf_blocks = Lba(bdev.write_unit_size().into());
        let len = buf_blocks.bytes(bdev.block_size()) as usize;
        let mut buf = bdev.dma_zalloc(len).ok_or(SetupError::BufferAlloc {
            len,
            align: bdev.buf_align(),
        })?;
        let n = PAYLOAD.len().min(len);
        buf[..n].copy_from_slice(&PAYLOAD[..n]);
        let expected = buf.to_vec().into_boxed_slice();

        let mode = Mode::for_device(bdev.is_zoned());
        tracing::debug!(?mode, len, align = buf.align(), "run context ready");
        Ok(Self {
            channel,
            desc,
            buf,
            buf_blocks,
            expected,
            mode,
            state: State::Running(mode.first()),
            counter: CompletionCounter::new(0..0),
            backpressure: Backpressure::default(),
            in_flight: 0,
            geometry: None,
            completed: Vec::new(),
            options,
            progress: Progress::new(out),
        })
    }

    async fn drive(mut self) -> Outcome {
        let result = self.drive_stages().await;
        self.teardown(result).await
    }

    async fn drive_stages(&mut self) -> Result<(), RunError> {
        self.enter(self.mode.first())?;
        while let State::Running(stage) = self.state {
            match self.next_event(stage).await? {
                Event::Completion(completion) => self.on_completion(completion)?,
                Event::IoWait(tag) => self.on_io_wait(stage, tag)?,
            }
        }
        Ok(())
    }

    async fn next_event(&mut self, stage: Stage) -> Result<Event, RunError> {
        let event = match self.options.stage_timeout {
            None => self.channel.next_event().await,
            Some(timeout) => tokio::time::timeout(timeout, self.channel.next_event())
                .await
                .map_err(|_| RunError::StageTimeout {
                    stage,
                    timeout,
                    completed: self.counter.completed(),
                    expected: self.counter.expected(),
                })?,
        };
        event.ok_or(RunError::Stalled {
            stage,
            completed: self.counter.completed(),
            expected: self.counter.expected(),
        })
    }

    fn nr_zones(&self) -> u64 {
        self.geometry.map_or(0, |geo| geo.num_zones())
    }

    fn geometry(&self) -> &ZoneGeometry {
        self.geometry
            .as_ref()
            .expect("zone stages run after geometry discovery")
    }

    /// Enter `stage` and submit all its units. Stages without units are passed through.
    fn enter(&mut self, mut stage: Stage) -> Result<(), RunError> {
        loop {
            self.state = State::Running(stage);
            let units = stage.units(self.nr_zones());
            self.progress.line(stage.banner(&units));
            self.counter = CompletionCounter::new(units.clone());
            if !units.is_empty() {
                tracing::debug!(%stage, ?units, "entering stage");
                for unit in units {
                    self.submit_or_defer(stage, unit)?;
                }
                return Ok(());
            }
            tracing::info!(%stage, "no units on this device, skipping");
            match self.finish(stage)? {
                Some(next) => stage = next,
                None => return Ok(()),
            }
        }
    }

    /// Mark `stage` as reached and return the next one, if any.
    ///
    /// The discovered geometry is reported and checked here, after the discovery stage is done.
    fn finish(&mut self, stage: Stage) -> Result<Option<Stage>, RunError> {
        assert!(self.counter.is_reached());
        assert_eq!(self.in_flight, 0, "{stage} finished with commands in flight");
        assert!(self.backpressure.is_empty());
        self.progress.line(stage.done_message());
        self.completed.push(stage);
        if stage == Stage::GeometryDiscovery {
            let geo = *self.geometry();
            self.progress.line(geo);
            geo.validate(self.buf_blocks)?;
        }
        let next = self.mode.next(stage);
        if next.is_none() {
            tracing::info!("all stages complete");
            self.state = State::Success;
        }
        Ok(next)
    }

    fn submit_or_defer(&mut self, stage: Stage, unit: u64) -> Result<(), RunError> {
        // Never overtake units already waiting.
        if !self.backpressure.is_empty() {
            self.backpressure.defer(unit);
            return Ok(());
        }
        match self.submit_unit(stage, unit)? {
            Submitted::Accepted => Ok(()),
            Submitted::Busy => {
                self.backpressure.defer(unit);
                self.arm(stage)
            }
        }
    }

    fn arm(&mut self, stage: Stage) -> Result<(), RunError> {
        if self.backpressure.is_armed() {
            return Ok(());
        }
        let tag = Tag::from(UnitTag { stage, unit: 0 });
        self.channel
            .queue_io_wait(tag)
            .map_err(|errno| RunError::IoWait { stage, errno })?;
        self.backpressure.arm(tag);
        Ok(())
    }

    fn submit_unit(&mut self, stage: Stage, unit: u64) -> Result<Submitted, RunError> {
        match self.issue(stage, unit) {
            Ok(()) => {
                self.in_flight += 1;
                Ok(Submitted::Accepted)
            }
            Err(Errno::NOMEM) => {
                tracing::debug!(%stage, unit, "queueing io");
                Ok(Submitted::Busy)
            }
            Err(errno) => {
                let kind = stage.kind();
                tracing::error!(%stage, unit, %kind, %errno, "failed to submit");
                Err(RunError::Submit {
                    stage,
                    unit,
                    kind,
                    errno,
                })
            }
        }
    }

    /// The zone id and the probed block of an append of `unit`.
    fn append_target(&self, unit: u64) -> (Lba, Lba) {
        let geo = self.geometry();
        let probe = geo.zone_start(unit) + Lba(APPEND_PROBE_OFFSET % geo.limits.zone_size.0);
        (self.desc.bdev().zone_id(probe), probe)
    }

    /// Submit `unit` of `stage`, reporting it once accepted.
    fn issue(&mut self, stage: Stage, unit: u64) -> Result<(), Errno> {
        let tag = Tag::from(UnitTag { stage, unit });
        match stage {
            Stage::GeometryDiscovery => self.channel.get_zone_info(Lba(0), 1, tag),
            Stage::ZoneReset | Stage::ZoneOpen | Stage::ZoneClose => {
                let action = match stage {
                    Stage::ZoneReset => ZoneAction::Reset,
                    Stage::ZoneOpen => ZoneAction::Open,
                    _ => ZoneAction::Close,
                };
                let zone_id = self.geometry().zone_start(unit);
                self.channel.zone_management(zone_id, action, tag)
            }
            Stage::ZoneAppend => {
                let (zone_id, probe) = self.append_target(unit);
                self.channel.zone_append(zone_id, &self.buf, tag)?;
                self.progress.line(format_args!(
                    "append: offset_blocks = {probe:#x}, zone_id={zone_id:#x}"
                ));
                Ok(())
            }
            Stage::ZoneRead => {
                let offset = self.geometry().zone_start(unit);
                self.buf.fill(0);
                self.channel.read(offset, self.buf_blocks, tag)?;
                self.progress
                    .line(format_args!("read: offset_blocks = {offset:#x}"));
                Ok(())
            }
            Stage::Write => self.channel.write(Lba(0), &self.buf, tag),
            Stage::Read => {
                self.buf.fill(0);
                self.channel.read(Lba(0), self.buf_blocks, tag)
            }
        }
    }

    fn on_io_wait(&mut self, stage: Stage, tag: Tag) -> Result<(), RunError> {
        if !self.backpressure.fire(tag) {
            tracing::warn!(?tag, "ignoring unexpected io-wait");
            return Ok(());
        }
        tracing::debug!(%stage, deferred = self.backpressure.len(), "resubmitting deferred units");
        while let Some(unit) = self.backpressure.pop() {
            match self.submit_unit(stage, unit)? {
                Submitted::Accepted => {}
                Submitted::Busy => {
                    self.backpressure.requeue(unit);
                    return self.arm(stage);
                }
            }
        }
        Ok(())
    }

    fn on_completion(&mut self, completion: Completion) -> Result<(), RunError> {
        let tag = UnitTag::try_from(completion.tag)
            .unwrap_or_else(|tag| panic!("completion with foreign tag {tag:?}"));
        assert_eq!(
            self.state,
            State::Running(tag.stage),
            "completion of {tag} outside its stage",
        );
        self.in_flight -= 1;

        let output = match completion.result {
            Ok(output) => output,
            Err(errno) => {
                tracing::error!(%tag, kind = %completion.kind, %errno, "bdev io error");
                return Err(RunError::Completion {
                    stage: tag.stage,
                    unit: tag.unit,
                    kind: completion.kind,
                    errno,
                });
            }
        };
        self.handle_output(tag, output)?;
        tracing::trace!(%tag, "unit complete");

        if self.counter.complete(tag.unit) {
            if let Some(next) = self.finish(tag.stage)? {
                self.enter(next)?;
            }
        }
        Ok(())
    }

    fn handle_output(&mut self, tag: UnitTag, output: IoOutput) -> Result<(), RunError> {
        match (tag.stage, output) {
            (Stage::GeometryDiscovery, IoOutput::Zones(zones)) => {
                assert!(self.geometry.is_none(), "geometry is discovered once");
                let first = zones.first().ok_or(SetupError::NoZones)?;
                self.geometry = Some(ZoneGeometry::discover(self.desc.bdev(), first));
            }
            (Stage::ZoneAppend, IoOutput::Appended(lba)) => {
                tracing::debug!(%tag, %lba, "appended");
            }
            (stage @ (Stage::ZoneRead | Stage::Read), IoOutput::Read(data)) => {
                let offset = match stage {
                    Stage::ZoneRead => self.geometry().zone_start(tag.unit),
                    _ => Lba(0),
                };
                let n = data.len().min(self.buf.len());
                self.buf[..n].copy_from_slice(&data[..n]);
                if data.len() != self.buf.len() || *self.buf != *self.expected {
                    tracing::error!(%tag, %offset, "read data mismatch");
                    return Err(RunError::DataMismatch {
                        stage,
                        unit: tag.unit,
                        offset,
                    });
                }
                let text = text_of(&self.buf);
                match stage {
                    Stage::Read => self
                        .progress
                        .line(format_args!("Read string from bdev : {text}")),
                    _ => self.progress.line(text),
                }
            }
            (_, IoOutput::Done) => {}
            (stage, output) => unreachable!("unexpected output of {stage}: {output:?}"),
        }
        Ok(())
    }

    /// Release everything exactly once. Consumes the run.
    async fn teardown(mut self, result: Result<(), RunError>) -> Outcome {
        self.state = match &result {
            Ok(()) => State::Success,
            Err(err) => {
                tracing::error!(%err, "run failed");
                State::Failed
            }
        };
        let dropped = self.backpressure.clear();
        if dropped != 0 {
            tracing::debug!(dropped, "dropping deferred units");
        }
        if self.in_flight != 0 {
            self.drain().await;
        }

        let Run {
            channel,
            desc,
            geometry,
            completed,
            ..
        } = self;
        tracing::debug!("closing io channel");
        drop(channel);
        drop(desc);
        Outcome {
            result,
            geometry,
            completed,
        }
    }

    /// Wait for in-flight units so the device does not complete into a released channel.
    async fn drain(&mut self) {
        tracing::info!(in_flight = self.in_flight, "waiting for in-flight commands");
        while self.in_flight != 0 {
            let event = match self.options.stage_timeout {
                None => self.channel.next_event().await,
                Some(timeout) => {
                    match tokio::time::timeout(timeout, self.channel.next_event()).await {
                        Ok(event) => event,
                        Err(_) => {
                            tracing::warn!(in_flight = self.in_flight, "gave up draining");
                            return;
                        }
                    }
                }
            };
            match event {
                Some(Event::Completion(completion)) => {
                    self.in_flight -= 1;
                    if let Err(errno) = completion.result {
                        tracing::debug!(tag = ?completion.tag, %errno, "drained failed command");
                    }
                }
                Some(Event::IoWait(_)) => {}
                None => {
                    tracing::warn!(in_flight = self.in_flight, "device lost in-flight commands");
                    return;
                }
            }
        }
    }
}

/// The leading text of a buffer, up to the first NUL.
fn text_of(buf: &[u8]) -> Cow<'_, str> {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    match String::from_utf8_lossy(&buf[..end]) {
        Cow::Borrowed(s) => Cow::Borrowed(s.trim_end()),
        Cow::Owned(s) => Cow::Owned(s.trim_end().to_owned()),
    }
}
