// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The two-stage decode scheduler.
//!
//! [`Decoder`] runs the pipelined configuration: a parser stage that turns
//! input packets into hardware tasks and a hardware stage that completes them
//! and feeds the display path. [`AdvancedDecoder`] runs the one-shot task
//! configuration instead. Both share the same registries and collaborator
//! wiring; only the driving threads differ.

pub mod advanced;
mod hal_stage;
mod parser_stage;
mod sync;

pub use self::advanced::AdvancedDecoder;
pub use self::advanced::DecodeJob;

use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::backend::HalBackend;
use crate::backend::HalCfg;
use crate::backend::NotifyCb;
use crate::backend::Parser;
use crate::backend::ParserCfg;
use crate::backend::PostProc;
use crate::buffer::BufferGroup;
use crate::frame::Frame;
use crate::packet::Packet;
use crate::slots::BufferSlots;
use crate::slots::SlotFlag;
use crate::slots::SlotQueue;
use crate::task::TaskFlags;
use crate::task::TaskGroup;
use crate::task::TaskState;
use crate::timestamp::TimestampQueue;
use crate::Coding;

use self::sync::StageSync;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to initialize the parser collaborator: {0}")]
    ParserInit(#[source] anyhow::Error),
    #[error("failed to initialize the hardware collaborator: {0}")]
    HalInit(#[source] anyhow::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Runtime configuration commands. Every command is forwarded to the parser
/// and hardware collaborators before the scheduler acts on it, so backends
/// can piggyback on the ones they care about.
#[derive(Clone, Debug)]
pub enum Command {
    /// Seed the frame-slot geometry before the first packet arrives.
    SetFrameInfo(Frame),
    /// Scrub error and discard markers from output frames.
    SetDisableError(bool),
    /// Re-attach input packet timestamps to output frames in arrival order.
    SetPresentTimeOrder(bool),
    /// Allow the lazy post-processor start on interlaced content.
    SetEnableDeinterlace(bool),
    /// Consumer acknowledgement of a geometry change; unblocks the parser.
    SetInfoChangeReady,
}

#[derive(Clone, Debug)]
pub struct DecoderConfig {
    pub coding: Coding,
    /// Input packets may carry several access units.
    pub need_split: bool,
    /// Run with one extra task handle so a second decode can start before
    /// the first is retired.
    pub fast_mode: bool,
    /// Timestamps come from the bitstream rather than the packet envelope.
    pub internal_pts: bool,
    /// Size of the frame buffer pool.
    pub frame_buffer_count: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            coding: Coding::H264,
            need_split: false,
            fast_mode: false,
            internal_pts: false,
            frame_buffer_count: 12,
        }
    }
}

impl DecoderConfig {
    fn task_count(&self) -> usize {
        if self.fast_mode {
            3
        } else {
            2
        }
    }
}

/// Frames allowed to sit in the output list before the parser stops pulling
/// input. Empirical bound inherited from shipping configurations.
pub(crate) const DISPLAY_PENDING_MAX: usize = 4;

/// State shared between the scheduler stages and the client-facing surface.
pub(crate) struct DecoderCore {
    pub(crate) coding: Coding,
    pub(crate) fast_mode: bool,

    pub(crate) parser: Mutex<Box<dyn Parser>>,
    pub(crate) hal: Box<dyn HalBackend>,
    pub(crate) vproc: Mutex<Option<Box<dyn PostProc>>>,
    pub(crate) vproc_active: AtomicBool,

    pub(crate) frame_slots: Arc<BufferSlots>,
    pub(crate) packet_slots: Arc<BufferSlots>,
    pub(crate) tasks: TaskGroup,
    pub(crate) timestamps: TimestampQueue,
    pub(crate) packet_group: BufferGroup,
    pub(crate) frame_group: BufferGroup,

    /// Input packet queue.
    pub(crate) packets: Mutex<VecDeque<Packet>>,
    /// Output frame list, drained by the client.
    pub(crate) frames: Mutex<VecDeque<Frame>>,
    pub(crate) frames_cv: Condvar,
    /// Serializes display-queue drains.
    pub(crate) display_lock: Mutex<()>,

    /// Job ports of the one-shot task path.
    pub(crate) jobs_in: Mutex<VecDeque<DecodeJob>>,
    pub(crate) jobs_out: Mutex<VecDeque<DecodeJob>>,
    pub(crate) jobs_cv: Condvar,

    pub(crate) parser_sync: Arc<StageSync>,
    pub(crate) hal_sync: Arc<StageSync>,
    /// Set by the client to request a reset, cleared by the parser stage once
    /// the pipeline is clean. Written under the parser control lock.
    pub(crate) reset_flag: AtomicBool,
    /// Hardware stage acknowledgement that it drained for reset. Written
    /// under the hardware control lock.
    pub(crate) hal_reset_done: AtomicBool,

    pub(crate) disable_error: AtomicBool,
    pub(crate) use_preset_time_order: AtomicBool,
    pub(crate) enable_deinterlace: AtomicBool,

    pub(crate) task_put_count: AtomicU64,
    pub(crate) task_get_count: AtomicU64,
    pub(crate) packet_put_count: AtomicU64,
    pub(crate) packet_get_count: AtomicU64,
    pub(crate) frame_put_count: AtomicU64,
}

impl DecoderCore {
    fn new<P, H>(
        cfg: &DecoderConfig,
        parser_factory: P,
        hal_factory: H,
        post_proc: Option<Box<dyn PostProc>>,
    ) -> Result<Arc<Self>>
    where
        P: FnOnce(ParserCfg) -> anyhow::Result<Box<dyn Parser>>,
        H: FnOnce(HalCfg) -> anyhow::Result<Box<dyn HalBackend>>,
    {
        let task_count = cfg.task_count();
        let frame_slots = Arc::new(BufferSlots::new(0));
        let packet_slots = Arc::new(BufferSlots::new(task_count));

        let parser_sync = Arc::new(StageSync::new());
        let hal_sync = Arc::new(StageSync::new());
        let notify: NotifyCb = {
            let parser_sync = Arc::clone(&parser_sync);
            let hal_sync = Arc::clone(&hal_sync);
            Arc::new(move || {
                parser_sync.signal();
                hal_sync.signal();
            })
        };

        let parser = parser_factory(ParserCfg {
            coding: cfg.coding,
            frame_slots: Arc::clone(&frame_slots),
            packet_slots: Arc::clone(&packet_slots),
            task_count,
            need_split: cfg.need_split,
            internal_pts: cfg.internal_pts,
            notify: Arc::clone(&notify),
        })
        .map_err(Error::ParserInit)?;

        let hal = hal_factory(HalCfg {
            coding: cfg.coding,
            frame_slots: Arc::clone(&frame_slots),
            packet_slots: Arc::clone(&packet_slots),
            task_count,
            fast_mode: cfg.fast_mode,
            notify,
        })
        .map_err(Error::HalInit)?;

        let packet_group = BufferGroup::with_limit(task_count);
        let frame_group = BufferGroup::with_limit(cfg.frame_buffer_count);
        // A returned buffer may be exactly what the parser stage blocked on.
        for group in [&packet_group, &frame_group] {
            let parser_sync = Arc::clone(&parser_sync);
            group.set_notify(Arc::new(move || parser_sync.signal()));
        }

        Ok(Arc::new(Self {
            coding: cfg.coding,
            fast_mode: cfg.fast_mode,
            parser: Mutex::new(parser),
            hal,
            vproc: Mutex::new(post_proc),
            vproc_active: AtomicBool::new(false),
            frame_slots,
            packet_slots,
            tasks: TaskGroup::new(task_count),
            timestamps: TimestampQueue::new(),
            packet_group,
            frame_group,
            packets: Mutex::new(VecDeque::new()),
            frames: Mutex::new(VecDeque::new()),
            frames_cv: Condvar::new(),
            display_lock: Mutex::new(()),
            jobs_in: Mutex::new(VecDeque::new()),
            jobs_out: Mutex::new(VecDeque::new()),
            jobs_cv: Condvar::new(),
            parser_sync,
            hal_sync,
            reset_flag: AtomicBool::new(false),
            hal_reset_done: AtomicBool::new(false),
            disable_error: AtomicBool::new(false),
            use_preset_time_order: AtomicBool::new(false),
            enable_deinterlace: AtomicBool::new(true),
            task_put_count: AtomicU64::new(0),
            task_get_count: AtomicU64::new(0),
            packet_put_count: AtomicU64::new(0),
            packet_get_count: AtomicU64::new(0),
            frame_put_count: AtomicU64::new(0),
        }))
    }

    pub(crate) fn flush_collaborators(&self) {
        self.parser.lock().unwrap().flush();
        self.hal.flush();
    }

    /// Emits the frame held by `index` (or a synthetic one when `index` is
    /// `None`) to the display path, applying the protocol markers in `flags`.
    pub(crate) fn put_frame(&self, index: Option<usize>, flags: &TaskFlags) {
        let mut index = index;
        let mut frame;

        match index {
            Some(slot) => {
                frame = self.frame_slots.frame(slot).unwrap_or_default();
                if frame.mode.is_interlaced()
                    && self.enable_deinterlace.load(Ordering::SeqCst)
                    && !self.vproc_active.load(Ordering::SeqCst)
                {
                    self.start_post_proc();
                }
            }
            None => {
                // Only the end-of-stream beacon arrives without a slot. When
                // post-processing is active it needs a real slot to travel
                // through, so synthesize one.
                debug_assert!(flags.eos && !flags.info_change);
                if self.vproc_active.load(Ordering::SeqCst) {
                    match self.frame_slots.get_unused() {
                        Some(slot) => {
                            self.frame_slots.default_frame(slot);
                            self.frame_slots.set_flag(slot, SlotFlag::CodecReady);
                            self.frame_slots.with_frame_mut(slot, |f| f.eos = true);
                            frame = self.frame_slots.frame(slot).unwrap_or_default();
                            index = Some(slot);
                        }
                        None => {
                            log::error!("no free slot for the end-of-stream frame");
                            frame = Frame { eos: true, ..Default::default() };
                        }
                    }
                } else {
                    frame = Frame { eos: true, ..Default::default() };
                }
            }
        }

        if self.disable_error.load(Ordering::SeqCst) {
            frame.errinfo = false;
            frame.discard = false;
        }

        if flags.info_change {
            // Mark the slot consumable so it survives the queue round trip.
            if let Some(slot) = index {
                self.frame_slots.set_flag(slot, SlotFlag::CodecReady);
            }
        } else if self.use_preset_time_order.load(Ordering::SeqCst) {
            match self.timestamps.pull() {
                Some((pts, dts)) => {
                    frame.pts = pts;
                    frame.dts = dts;
                }
                None => log::error!("present timestamp queue ran dry"),
            }
        }
        frame.info_change = flags.info_change;

        if flags.eos {
            frame.eos = true;
            if flags.had_error {
                if flags.used_for_ref {
                    frame.errinfo = true;
                } else {
                    frame.discard = true;
                }
            }
            self.timestamps.flush();
        }

        match index {
            Some(slot) if self.vproc_active.load(Ordering::SeqCst) => {
                self.frame_slots.with_frame_mut(slot, |f| {
                    let buffer = f.buffer.clone();
                    *f = frame.clone();
                    f.buffer = buffer;
                });
                self.frame_slots.set_flag(slot, SlotFlag::QueueUse);
                self.frame_slots.enqueue(slot, SlotQueue::Deinterlace);
                if let Some(proc) = self.vproc.lock().unwrap().as_mut() {
                    proc.signal();
                }
            }
            _ => {
                log::trace!("output frame pts {}", frame.pts);
                self.frames.lock().unwrap().push_back(frame);
                self.frame_put_count.fetch_add(1, Ordering::SeqCst);
                self.frames_cv.notify_one();
            }
        }
    }

    /// Drains the display queue to the output, tagging the final frame with
    /// the end-of-stream marker when `flags` carries it.
    pub(crate) fn push_display(&self, flags: &TaskFlags) {
        let _output = self.display_lock.lock().unwrap();
        let mut tmp = *flags;
        tmp.eos = false;
        while let Some(index) = self.frame_slots.dequeue(SlotQueue::Display) {
            if flags.eos && self.frame_slots.queue_is_empty(SlotQueue::Display) {
                tmp.eos = true;
            }
            self.put_frame(Some(index), &tmp);
            self.frame_slots.clr_flag(index, SlotFlag::QueueUse);
        }
    }

    fn start_post_proc(&self) {
        let mut vproc = self.vproc.lock().unwrap();
        if let Some(proc) = vproc.as_mut() {
            match proc.start() {
                Ok(()) => {
                    log::debug!("post-processor started for interlaced content");
                    self.vproc_active.store(true, Ordering::SeqCst);
                }
                Err(e) => log::error!("failed to start the post-processor: {e:#}"),
            }
        }
    }

    fn reset_post_proc(&self) {
        if let Some(proc) = self.vproc.lock().unwrap().as_mut() {
            proc.reset();
        }
    }

    pub(crate) fn handle_control(&self, cmd: &Command) {
        self.parser.lock().unwrap().control(cmd);
        self.hal.control(cmd);

        match cmd {
            Command::SetFrameInfo(info) => {
                log::debug!(
                    "seeding default geometry {}x{} strides {}x{}",
                    info.width,
                    info.height,
                    info.hor_stride,
                    info.ver_stride
                );
                self.frame_slots.set_info(info);
            }
            Command::SetDisableError(value) => {
                self.disable_error.store(*value, Ordering::SeqCst);
            }
            Command::SetPresentTimeOrder(value) => {
                self.use_preset_time_order.store(*value, Ordering::SeqCst);
            }
            Command::SetEnableDeinterlace(value) => {
                self.enable_deinterlace.store(*value, Ordering::SeqCst);
            }
            Command::SetInfoChangeReady => {
                self.frame_slots.ready();
                self.parser_sync.signal();
            }
        }
    }
}

/// The pipelined decoder. Packets go in through [`put_packet`], decoded
/// frames come out through [`try_get_frame`] or [`get_frame_timeout`].
///
/// [`put_packet`]: Decoder::put_packet
/// [`try_get_frame`]: Decoder::try_get_frame
/// [`get_frame_timeout`]: Decoder::get_frame_timeout
pub struct Decoder {
    core: Arc<DecoderCore>,
    parser_thread: Option<thread::JoinHandle<()>>,
    hal_thread: Option<thread::JoinHandle<()>>,
}

impl Decoder {
    pub fn new<P, H>(cfg: DecoderConfig, parser_factory: P, hal_factory: H) -> Result<Self>
    where
        P: FnOnce(ParserCfg) -> anyhow::Result<Box<dyn Parser>>,
        H: FnOnce(HalCfg) -> anyhow::Result<Box<dyn HalBackend>>,
    {
        Self::build(cfg, parser_factory, hal_factory, None)
    }

    /// Like [`new`](Self::new), with a post-processor the pipeline may start
    /// lazily on interlaced content.
    pub fn with_post_proc<P, H>(
        cfg: DecoderConfig,
        parser_factory: P,
        hal_factory: H,
        post_proc: Box<dyn PostProc>,
    ) -> Result<Self>
    where
        P: FnOnce(ParserCfg) -> anyhow::Result<Box<dyn Parser>>,
        H: FnOnce(HalCfg) -> anyhow::Result<Box<dyn HalBackend>>,
    {
        Self::build(cfg, parser_factory, hal_factory, Some(post_proc))
    }

    fn build<P, H>(
        cfg: DecoderConfig,
        parser_factory: P,
        hal_factory: H,
        post_proc: Option<Box<dyn PostProc>>,
    ) -> Result<Self>
    where
        P: FnOnce(ParserCfg) -> anyhow::Result<Box<dyn Parser>>,
        H: FnOnce(HalCfg) -> anyhow::Result<Box<dyn HalBackend>>,
    {
        let core = DecoderCore::new(&cfg, parser_factory, hal_factory, post_proc)?;

        let parser_thread = {
            let core = Arc::clone(&core);
            thread::Builder::new()
                .name("vdec-parser".into())
                .spawn(move || parser_stage::run(core))
                .map_err(|e| Error::Other(e.into()))?
        };
        let hal_thread = {
            let core = Arc::clone(&core);
            thread::Builder::new()
                .name("vdec-hal".into())
                .spawn(move || hal_stage::run(core))
                .map_err(|e| Error::Other(e.into()))?
        };

        Ok(Self { core, parser_thread: Some(parser_thread), hal_thread: Some(hal_thread) })
    }

    /// Queues one compressed packet for decoding.
    pub fn put_packet(&self, packet: Packet) {
        self.core.packets.lock().unwrap().push_back(packet);
        self.core.packet_put_count.fetch_add(1, Ordering::SeqCst);
        self.core.parser_sync.signal();
    }

    /// Takes the next decoded frame, if one is ready.
    pub fn try_get_frame(&self) -> Option<Frame> {
        let frame = self.core.frames.lock().unwrap().pop_front();
        if frame.is_some() {
            // Room opened up in the output list.
            self.core.parser_sync.signal();
        }
        frame
    }

    /// Takes the next decoded frame, waiting up to `timeout` for one.
    pub fn get_frame_timeout(&self, timeout: Duration) -> Option<Frame> {
        let guard = self.core.frames.lock().unwrap();
        let (mut guard, _) = self
            .core
            .frames_cv
            .wait_timeout_while(guard, timeout, |frames| frames.is_empty())
            .unwrap();
        let frame = guard.pop_front();
        drop(guard);
        if frame.is_some() {
            self.core.parser_sync.signal();
        }
        frame
    }

    /// Number of decoded frames waiting for the client.
    pub fn pending_frames(&self) -> usize {
        self.core.frames.lock().unwrap().len()
    }

    /// Number of live frame slots.
    pub fn used_slot_count(&self) -> usize {
        self.core.frame_slots.used_count()
    }

    /// Halts decoding and returns the pipeline to a clean state. Pending
    /// input and undelivered output are dropped. Blocks until both stages
    /// have drained.
    pub fn reset(&self) {
        // Stateless codings hold no pipeline history worth draining.
        if self.core.coding.is_stateless() {
            log::debug!("reset skipped for stateless coding");
            return;
        }

        self.core.packets.lock().unwrap().clear();

        let core = &self.core;
        core.parser_sync.update_control(|| core.reset_flag.store(true, Ordering::SeqCst));
        core.parser_sync.signal();
        core.parser_sync.wait_control_while(|| {
            core.reset_flag.load(Ordering::SeqCst) && core.parser_sync.is_running()
        });

        // Frames emitted while the pipeline drained are stale now.
        self.core.frames.lock().unwrap().clear();
    }

    /// Forwards a flush to both collaborators. Unlike [`reset`](Self::reset)
    /// this does not drain the pipeline.
    pub fn flush(&self) {
        self.core.flush_collaborators();
    }

    /// Applies a configuration command.
    pub fn control(&self, cmd: &Command) {
        self.core.handle_control(cmd);
    }
}

impl Drop for Decoder {
    fn drop(&mut self) {
        self.core.parser_sync.stop();
        if let Some(thread) = self.parser_thread.take() {
            let _ = thread.join();
        }

        // Let the hardware stage retire anything still queued so the task
        // accounting balances before it exits.
        while self.core.tasks.any(TaskState::Processing) {
            self.core.hal_sync.signal();
            thread::sleep(Duration::from_millis(1));
        }
        self.core.hal_sync.stop();
        if let Some(thread) = self.hal_thread.take() {
            let _ = thread.join();
        }

        self.core.reset_post_proc();
        self.core.frame_group.clear();
        self.core.packet_group.clear();
    }
}
