// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Software stand-ins for the parser and hardware collaborators.
//!
//! Their only purpose is to let the scheduler run so it can be tested in
//! isolation. They speak a tiny synthetic bitstream where every access unit
//! is one self-describing record:
//!
//! ```text
//! 0..2   magic b"AU"
//! 2      flags (keyframe, ref, corrupt, interlaced)
//! 3      reserved
//! 4..6   width, LE
//! 6..8   height, LE
//! 8..16  pts, LE
//! 16..18 payload length, LE
//! 18..   payload
//! ```
//!
//! The dummy hardware "decodes" by copying the payload into the frame buffer
//! and queueing the slot for display, which is enough to observe ordering,
//! backpressure and lifetime behavior end to end.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Context;

use crate::backend::HalBackend;
use crate::backend::HalCfg;
use crate::backend::Parser;
use crate::backend::ParserCfg;
use crate::backend::PostProc;
use crate::frame::Frame;
use crate::frame::FrameMode;
use crate::packet::Packet;
use crate::slots::BufferSlots;
use crate::slots::SlotFlag;
use crate::slots::SlotQueue;
use crate::task::HalDecTask;
use crate::DecodedFormat;
use crate::Resolution;

pub const AU_KEYFRAME: u8 = 1 << 0;
pub const AU_REF: u8 = 1 << 1;
pub const AU_CORRUPT: u8 = 1 << 2;
pub const AU_INTERLACED: u8 = 1 << 3;

const AU_MAGIC: &[u8; 2] = b"AU";
const AU_HEADER_LEN: usize = 18;

/// Builds one access-unit record.
pub fn access_unit(resolution: Resolution, pts: i64, flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut record = Vec::with_capacity(AU_HEADER_LEN + payload.len());
    record.extend_from_slice(AU_MAGIC);
    record.push(flags);
    record.push(0);
    record.extend_from_slice(&(resolution.width as u16).to_le_bytes());
    record.extend_from_slice(&(resolution.height as u16).to_le_bytes());
    record.extend_from_slice(&pts.to_le_bytes());
    record.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    record.extend_from_slice(payload);
    record
}

#[derive(Debug, Clone, Copy)]
struct AuHeader {
    flags: u8,
    resolution: Resolution,
    pts: i64,
}

impl AuHeader {
    fn keyframe(&self) -> bool {
        self.flags & AU_KEYFRAME != 0
    }

    fn used_for_ref(&self) -> bool {
        self.flags & AU_REF != 0
    }

    fn corrupt(&self) -> bool {
        self.flags & AU_CORRUPT != 0
    }

    fn interlaced(&self) -> bool {
        self.flags & AU_INTERLACED != 0
    }
}

/// Parses one record from the start of `data`.
fn parse_au(data: &[u8]) -> Option<(AuHeader, &[u8])> {
    if data.len() < AU_HEADER_LEN || &data[0..2] != AU_MAGIC {
        return None;
    }
    let width = u16::from_le_bytes([data[4], data[5]]) as u32;
    let height = u16::from_le_bytes([data[6], data[7]]) as u32;
    let pts = i64::from_le_bytes(data[8..16].try_into().unwrap());
    let payload_len = u16::from_le_bytes([data[16], data[17]]) as usize;
    let payload = data.get(AU_HEADER_LEN..AU_HEADER_LEN + payload_len)?;
    Some((
        AuHeader { flags: data[2], resolution: Resolution { width, height }, pts },
        payload,
    ))
}

fn record_len(payload: &[u8]) -> usize {
    AU_HEADER_LEN + payload.len()
}

/// Parser stand-in. Splits records, allocates output slots and binds the
/// previous reference picture so reference lifetimes are exercised.
pub struct DummyParser {
    frame_slots: Arc<BufferSlots>,
    need_split: bool,
    internal_pts: bool,
    frame_slot_count: usize,
    geometry: Option<Frame>,
    last_ref: Option<usize>,
}

impl DummyParser {
    pub fn new(cfg: ParserCfg) -> Self {
        Self {
            frame_slots: cfg.frame_slots,
            need_split: cfg.need_split,
            internal_pts: cfg.internal_pts,
            // In-flight outputs plus pending display frames plus one reference.
            frame_slot_count: cfg.task_count + 7,
            geometry: None,
            last_ref: None,
        }
    }

    /// Extracts the next record from the packet, skipping garbage. Returns
    /// the record bytes with the cursor advanced past them.
    fn split_one(&self, packet: &mut Packet) -> Option<Vec<u8>> {
        loop {
            let data = packet.remaining();
            let start = data.windows(2).position(|w| w == AU_MAGIC)?;
            match parse_au(&data[start..]) {
                Some((_, payload)) => {
                    let end = start + record_len(payload);
                    let record = data[start..end].to_vec();
                    packet.advance(end);
                    return Some(record);
                }
                None => {
                    // Truncated or bogus magic, resync past it.
                    packet.advance(start + 2);
                    if packet.is_empty() {
                        return None;
                    }
                }
            }
        }
    }
}

impl Parser for DummyParser {
    fn prepare(&mut self, packet: &mut Packet, task: &mut HalDecTask) -> anyhow::Result<()> {
        task.valid = false;
        task.prepared = None;

        if packet.is_empty() {
            if packet.eos {
                task.flags.eos = true;
            }
            return Ok(());
        }

        let record = if self.need_split {
            self.split_one(packet)
        } else {
            let data = packet.remaining().to_vec();
            packet.consume();
            parse_au(&data).is_some().then_some(data)
        };

        let Some(record) = record else {
            packet.consume();
            if packet.eos {
                task.flags.eos = true;
            }
            return Ok(());
        };

        let (header, _) = parse_au(&record).unwrap();
        let pts = if self.internal_pts { header.pts } else { packet.pts };
        task.prepared = Some(Packet::new(record).with_pts(pts).with_dts(packet.dts));
        task.valid = true;
        if packet.eos && packet.is_empty() {
            task.flags.eos = true;
        }
        Ok(())
    }

    fn parse(&mut self, task: &mut HalDecTask) -> anyhow::Result<()> {
        if !task.valid {
            return Ok(());
        }
        let prepared = task.prepared.as_ref().context("parse without a prepared unit")?;
        let (header, _) =
            parse_au(prepared.remaining()).context("malformed access unit record")?;

        let template = Frame::with_geometry(header.resolution, DecodedFormat::NV12);
        let changed = match &self.geometry {
            Some(current) => !current.same_geometry(&template),
            None => true,
        };
        if changed {
            let first = self.geometry.is_none();
            self.geometry = Some(template.clone());
            self.frame_slots.configure(self.frame_slot_count, &template);
            if !first {
                // References never cross a geometry change.
                self.last_ref = None;
            }
        }

        let Some(output) = self.frame_slots.get_unused() else {
            task.valid = false;
            return Ok(());
        };
        self.frame_slots.set_flag(output, SlotFlag::HalOutput);
        task.output = Some(output);

        let mut record = template;
        record.pts = prepared.pts;
        record.dts = prepared.dts;
        record.mode = if header.interlaced() {
            FrameMode::InterlacedTopFirst
        } else {
            FrameMode::Progressive
        };
        self.frame_slots.set_frame(output, record);

        if !header.keyframe() {
            if let Some(reference) = self.last_ref {
                // The previous reference may already have left the pipeline.
                if self.frame_slots.is_in_use(reference) {
                    task.refer.push(reference);
                    self.frame_slots.set_flag(reference, SlotFlag::HalInput);
                }
            }
        }
        if header.used_for_ref() {
            task.flags.used_for_ref = true;
            self.last_ref = Some(output);
        }
        if header.corrupt() {
            task.flags.had_error = true;
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.last_ref = None;
    }

    fn flush(&mut self) {}
}

/// Execution counters exposed by [`DummyHal`] so tests can observe the
/// pipelining depth.
#[derive(Default)]
pub struct HalStats {
    current: AtomicUsize,
    max: AtomicUsize,
    waits: AtomicUsize,
}

impl HalStats {
    /// Highest number of tasks that were started but not yet waited on.
    pub fn max_inflight(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.waits.load(Ordering::SeqCst)
    }
}

/// Hardware stand-in: copies the access-unit payload into the frame buffer
/// and queues the decoded slot for display.
pub struct DummyHal {
    frame_slots: Arc<BufferSlots>,
    packet_slots: Arc<BufferSlots>,
    stats: Arc<HalStats>,
}

impl DummyHal {
    pub fn new(cfg: HalCfg) -> Self {
        Self::with_stats(cfg, Arc::new(HalStats::default()))
    }

    pub fn with_stats(cfg: HalCfg, stats: Arc<HalStats>) -> Self {
        Self { frame_slots: cfg.frame_slots, packet_slots: cfg.packet_slots, stats }
    }
}

impl HalBackend for DummyHal {
    fn reg_gen(&self, task: &HalDecTask) -> anyhow::Result<()> {
        anyhow::ensure!(task.valid, "register generation for an invalid task");
        anyhow::ensure!(task.input.is_some(), "task has no input slot");
        anyhow::ensure!(task.output.is_some(), "task has no output slot");
        Ok(())
    }

    fn start(&self, _task: &HalDecTask) -> anyhow::Result<()> {
        let current = self.stats.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max.fetch_max(current, Ordering::SeqCst);
        Ok(())
    }

    fn wait(&self, task: &HalDecTask) -> anyhow::Result<()> {
        let input = task.input.context("wait on a task with no input slot")?;
        let output = task.output.context("wait on a task with no output slot")?;

        let payload = self
            .packet_slots
            .buffer(input)
            .and_then(|buf| buf.with_data(|data| parse_au(data).map(|(_, p)| p.to_vec())));
        let payload = payload.unwrap_or_default();
        if let Some(out) = self.frame_slots.buffer(output) {
            out.with_data_mut(|data| {
                let len = payload.len().min(data.len());
                data[..len].copy_from_slice(&payload[..len]);
            });
        }
        if task.flags.had_error {
            self.frame_slots.with_frame_mut(output, |frame| frame.errinfo = true);
        }

        // The decoded picture is ready for the display path.
        self.frame_slots.set_flag(output, SlotFlag::QueueUse);
        self.frame_slots.enqueue(output, SlotQueue::Display);

        self.stats.current.fetch_sub(1, Ordering::SeqCst);
        self.stats.waits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn reset(&self) {}

    fn flush(&self) {}
}

/// Post-processor stand-in recording the calls it receives.
#[derive(Default)]
pub struct ProcStats {
    started: AtomicBool,
    signals: AtomicUsize,
    resets: AtomicUsize,
}

impl ProcStats {
    pub fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn signals(&self) -> usize {
        self.signals.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

pub struct DummyProc {
    stats: Arc<ProcStats>,
}

impl DummyProc {
    pub fn new(stats: Arc<ProcStats>) -> Self {
        Self { stats }
    }
}

impl PostProc for DummyProc {
    fn start(&mut self) -> anyhow::Result<()> {
        self.stats.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn signal(&mut self) {
        self.stats.signals.fetch_add(1, Ordering::SeqCst);
    }

    fn reset(&mut self) {
        self.stats.resets.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NotifyCb;
    use crate::Coding;

    fn parser_cfg(need_split: bool, frame_slots: Arc<BufferSlots>) -> ParserCfg {
        ParserCfg {
            coding: Coding::Dummy,
            frame_slots,
            packet_slots: Arc::new(BufferSlots::new(2)),
            task_count: 2,
            need_split,
            internal_pts: true,
            notify: Arc::new(|| {}) as NotifyCb,
        }
    }

    #[test]
    fn record_roundtrip() {
        let record =
            access_unit(Resolution::from((320, 240)), 40, AU_KEYFRAME | AU_REF, b"payload");
        let (header, payload) = parse_au(&record).unwrap();
        assert_eq!(header.resolution, Resolution::from((320, 240)));
        assert_eq!(header.pts, 40);
        assert!(header.keyframe());
        assert!(header.used_for_ref());
        assert!(!header.corrupt());
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn prepare_splits_multiple_units() {
        let frame_slots = Arc::new(BufferSlots::new(0));
        let mut parser = DummyParser::new(parser_cfg(true, frame_slots));

        let mut stream = Vec::new();
        for pts in [0i64, 40, 80] {
            stream.extend(access_unit(Resolution::from((64, 64)), pts, AU_KEYFRAME, b"x"));
        }
        let mut packet = Packet::new(stream).with_eos();

        for pts in [0i64, 40, 80] {
            let mut task = HalDecTask::default();
            parser.prepare(&mut packet, &mut task).unwrap();
            assert!(task.valid);
            assert_eq!(task.prepared.as_ref().unwrap().pts, pts);
        }
        assert!(packet.is_empty());

        // A consumed eos packet prepares no further unit, only the eos flag.
        let mut task = HalDecTask::default();
        parser.prepare(&mut packet, &mut task).unwrap();
        assert!(!task.valid);
        assert!(task.flags.eos);
    }

    #[test]
    fn parse_allocates_output_and_reference() {
        let frame_slots = Arc::new(BufferSlots::new(0));
        let mut parser = DummyParser::new(parser_cfg(false, Arc::clone(&frame_slots)));

        let mut key = HalDecTask {
            valid: true,
            prepared: Some(Packet::new(access_unit(
                Resolution::from((64, 64)),
                0,
                AU_KEYFRAME | AU_REF,
                b"k",
            ))),
            ..Default::default()
        };
        parser.parse(&mut key).unwrap();
        let key_output = key.output.unwrap();
        assert!(key.flags.used_for_ref);
        assert!(key.refer.is_empty());

        let mut inter = HalDecTask {
            valid: true,
            prepared: Some(Packet::new(access_unit(Resolution::from((64, 64)), 40, 0, b"p"))),
            ..Default::default()
        };
        parser.parse(&mut inter).unwrap();
        assert_ne!(inter.output, Some(key_output));
        assert_eq!(inter.refer, vec![key_output]);
    }

    #[test]
    fn first_geometry_does_not_latch() {
        let frame_slots = Arc::new(BufferSlots::new(0));
        let mut parser = DummyParser::new(parser_cfg(false, Arc::clone(&frame_slots)));

        let mut task = HalDecTask {
            valid: true,
            prepared: Some(Packet::new(access_unit(
                Resolution::from((320, 240)),
                0,
                AU_KEYFRAME,
                b"",
            ))),
            ..Default::default()
        };
        parser.parse(&mut task).unwrap();
        assert!(!frame_slots.is_changed());

        let mut task = HalDecTask {
            valid: true,
            prepared: Some(Packet::new(access_unit(
                Resolution::from((1280, 720)),
                40,
                AU_KEYFRAME,
                b"",
            ))),
            ..Default::default()
        };
        parser.parse(&mut task).unwrap();
        assert!(frame_slots.is_changed());
    }
}
