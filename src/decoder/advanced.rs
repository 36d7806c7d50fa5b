// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! One-shot task path.
//!
//! The caller supplies matched (input packet, output frame) pairs and the
//! whole decode runs synchronously on one thread: prepare, parse, register
//! generation, start, wait, metadata copy-back. No pipelining, no task
//! group, no display queue. Decode problems come back as `errinfo` on the
//! output frame rather than through the pipeline error paths.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::backend::HalBackend;
use crate::backend::HalCfg;
use crate::backend::Parser;
use crate::backend::ParserCfg;
use crate::decoder::DecoderConfig;
use crate::decoder::DecoderCore;
use crate::decoder::Error;
use crate::decoder::Result;
use crate::frame::Frame;
use crate::packet::Packet;
use crate::slots::SlotFlag;
use crate::slots::SlotQueue;
use crate::task::HalDecTask;

/// One caller-supplied unit of work for the one-shot path.
#[derive(Debug)]
pub struct DecodeJob {
    pub packet: Packet,
    pub frame: Frame,
}

/// Decoder variant processing [`DecodeJob`]s one at a time.
pub struct AdvancedDecoder {
    core: Arc<DecoderCore>,
    thread: Option<thread::JoinHandle<()>>,
}

impl AdvancedDecoder {
    pub fn new<P, H>(cfg: DecoderConfig, parser_factory: P, hal_factory: H) -> Result<Self>
    where
        P: FnOnce(ParserCfg) -> anyhow::Result<Box<dyn Parser>>,
        H: FnOnce(HalCfg) -> anyhow::Result<Box<dyn HalBackend>>,
    {
        let core = DecoderCore::new(&cfg, parser_factory, hal_factory, None)?;
        let thread = {
            let core = Arc::clone(&core);
            thread::Builder::new()
                .name("vdec-task".into())
                .spawn(move || run(core))
                .map_err(|e| Error::Other(e.into()))?
        };
        Ok(Self { core, thread: Some(thread) })
    }

    /// Queues a job for decoding.
    pub fn submit_job(&self, job: DecodeJob) {
        self.core.jobs_in.lock().unwrap().push_back(job);
        self.core.parser_sync.signal();
    }

    /// Takes the next finished job, waiting up to `timeout` for one.
    pub fn wait_job(&self, timeout: Duration) -> Option<DecodeJob> {
        let guard = self.core.jobs_out.lock().unwrap();
        let (mut guard, _) = self
            .core
            .jobs_cv
            .wait_timeout_while(guard, timeout, |jobs| jobs.is_empty())
            .unwrap();
        guard.pop_front()
    }
}

impl Drop for AdvancedDecoder {
    fn drop(&mut self) {
        self.core.parser_sync.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run(core: Arc<DecoderCore>) {
    loop {
        let job = core.jobs_in.lock().unwrap().pop_front();
        let Some(mut job) = job else {
            if !core.parser_sync.wait_for_work(|| false) {
                break;
            }
            continue;
        };

        process(&core, &mut job);

        core.jobs_out.lock().unwrap().push_back(job);
        core.jobs_cv.notify_one();
    }
    log::debug!("task stage exited");
}

fn process(core: &DecoderCore, job: &mut DecodeJob) {
    let mut task = HalDecTask::default();

    let Some(input_buffer) = job.packet.buffer.clone() else {
        // The packet carries no hardware-reachable payload. Hand back a
        // fresh frame marked bad, discarding the caller's descriptor.
        log::warn!("input packet carries no buffer");
        job.frame = Frame { errinfo: true, ..Default::default() };
        return;
    };

    if let Err(e) = core.parser.lock().unwrap().prepare(&mut job.packet, &mut task) {
        log::error!("prepare failed: {e:#}");
        job.frame.errinfo = true;
        return;
    }

    if task.flags.eos && !task.valid {
        job.frame.eos = true;
        return;
    }
    if !task.valid {
        job.frame.errinfo = true;
        return;
    }

    if task.input.is_none() {
        task.input = core.packet_slots.get_unused();
    }
    let Some(input) = task.input else {
        log::error!("no packet slot available");
        job.frame.errinfo = true;
        return;
    };
    core.packet_slots.set_buffer(input, &input_buffer);
    core.packet_slots.set_flag(input, SlotFlag::CodecReady);
    core.packet_slots.set_flag(input, SlotFlag::HalInput);

    if let Err(e) = core.parser.lock().unwrap().parse(&mut task) {
        log::error!("parse failed: {e:#}");
        job.frame.errinfo = true;
        core.packet_slots.clr_flag(input, SlotFlag::HalInput);
        return;
    }
    let Some(output) = task.output.filter(|_| task.valid) else {
        job.frame.errinfo = true;
        core.packet_slots.clr_flag(input, SlotFlag::HalInput);
        return;
    };

    if core.frame_slots.is_changed() {
        let slot_size = core.frame_slots.buffer_size();
        let buffer_size = job.frame.buffer.as_ref().map(|b| b.size()).unwrap_or(0);
        if slot_size == buffer_size {
            core.frame_slots.ready();
        } else {
            log::error!("slot size {} does not match caller buffer size {}", slot_size, buffer_size);
            assert_eq!(slot_size, buffer_size);
        }
    }

    if let Some(output_buffer) = job.frame.buffer.clone() {
        core.frame_slots.set_buffer(output, &output_buffer);
    }

    let executed = core
        .hal
        .reg_gen(&task)
        .and_then(|_| core.hal.start(&task))
        .and_then(|_| core.hal.wait(&task));
    if let Err(e) = executed {
        log::error!("hardware execution failed: {e:#}");
        job.frame.errinfo = true;
    }

    // Copy the decoded picture metadata back onto the caller's frame.
    if let Some(decoded) = core.frame_slots.frame(output) {
        job.frame.width = decoded.width;
        job.frame.height = decoded.height;
        job.frame.hor_stride = decoded.hor_stride;
        job.frame.ver_stride = decoded.ver_stride;
        job.frame.format = decoded.format;
        job.frame.pts = decoded.pts;
        job.frame.errinfo |= decoded.errinfo;
    }

    core.packet_slots.clr_flag(input, SlotFlag::HalInput);
    core.frame_slots.clr_flag(output, SlotFlag::HalOutput);
    for &reference in &task.refer {
        core.frame_slots.clr_flag(reference, SlotFlag::HalInput);
    }
    // This path bypasses the display queue entirely; drop any membership
    // the codec recorded for the decoded picture.
    while let Some(index) = core.frame_slots.dequeue(SlotQueue::Display) {
        core.frame_slots.clr_flag(index, SlotFlag::QueueUse);
    }
}
