// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The parser stage.
//!
//! One cooperative in-flight [`DecTask`] is advanced step by step: acquire a
//! task handle, pull a packet, prepare one access unit, stage it into a
//! packet slot, gate on pipeline depth and output resources, parse, then
//! start the hardware and submit the handle. Every step is idempotent until
//! its status bit is set, so a turn that blocks can be replayed from the top
//! after the blocking condition clears. Each blocking reason is mirrored in
//! a wait bit; the set of wait bits names exactly what another stage (or the
//! client) must do for this one to move again.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use thiserror::Error;

use crate::decoder::DecoderCore;
use crate::decoder::DISPLAY_PENDING_MAX;
use crate::packet::Packet;
use crate::slots::SlotFlag;
use crate::task::HalDecTask;
use crate::task::TaskHnd;
use crate::task::TaskState;

/// Why the current turn could not complete. Everything except `Again` means
/// the stage should sleep until some shared state changes.
#[derive(Debug, Error)]
enum StepError {
    #[error("progress is possible without new input")]
    Again,
    #[error("waiting for pipeline resources")]
    Waiting,
    #[error("display list holds too many undelivered frames")]
    DisplayFull,
    #[error("no frame buffer or frame slot available")]
    BufferFull,
    #[error("geometry change pending consumer acknowledgement")]
    Stream,
}

impl StepError {
    fn is_blocking(&self) -> bool {
        !matches!(self, StepError::Again)
    }
}

/// Blocking reasons of the in-flight task, one bit per precondition.
#[derive(Debug, Default, Clone, Copy)]
struct ParserWait {
    task_handle: bool,
    packet_slot: bool,
    packet_buffer: bool,
    prev_task: bool,
    info_change: bool,
    frame_buffer: bool,
    frame_slot: bool,
    display_full: bool,
    all_done: bool,
}

/// Progress markers of the in-flight task. A marker stays set across blocked
/// turns so the corresponding step is not repeated.
#[derive(Debug, Default, Clone, Copy)]
struct TaskStatus {
    /// An access unit was prepared and awaits the rest of the pipeline.
    prepared: bool,
    /// The payload was copied into the packet slot.
    payload_copied: bool,
    /// The previously submitted task has been retired.
    prev_retired: bool,
    /// The geometry-change beacon for this task has been submitted.
    info_beacon_sent: bool,
    /// The prepared unit was analyzed and its slots are bound.
    parsed: bool,
}

/// The parser stage's single in-flight decode task.
struct DecTask {
    hnd: Option<TaskHnd>,
    status: TaskStatus,
    wait: ParserWait,
    info: HalDecTask,
}

impl DecTask {
    fn new() -> Self {
        Self {
            hnd: None,
            // There is no previous task to wait on at stream start.
            status: TaskStatus { prev_retired: true, ..Default::default() },
            wait: ParserWait::default(),
            info: HalDecTask::default(),
        }
    }
}

pub(crate) fn run(core: Arc<DecoderCore>) {
    let mut task = DecTask::new();
    // The input packet currently being split into access units.
    let mut held: Option<Packet> = None;

    loop {
        if !core.parser_sync.wait_for_work(|| core.reset_flag.load(Ordering::SeqCst)) {
            break;
        }

        if core.reset_flag.load(Ordering::SeqCst) {
            reset_pipeline(&core, &mut task, &mut held);
            core.parser_sync.update_control(|| {
                core.hal_reset_done.store(false, Ordering::SeqCst);
                core.reset_flag.store(false, Ordering::SeqCst);
            });
            continue;
        }

        // Drain all progress available right now, then go back to sleep.
        loop {
            if core.reset_flag.load(Ordering::SeqCst) || !core.parser_sync.is_running() {
                break;
            }
            match try_proc(&core, &mut task, &mut held) {
                Ok(()) => {}
                Err(e) if e.is_blocking() => {
                    log::trace!("parser blocked: {} (wait {:?})", e, task.wait);
                    break;
                }
                Err(_) => {}
            }
        }
    }

    // Balance the packet-slot reference of a task that never got submitted.
    if task.status.payload_copied {
        if let Some(input) = task.info.input {
            core.packet_slots.clr_flag(input, SlotFlag::HalInput);
        }
    }
    core.packet_group.clear();
    log::debug!("parser stage exited");
}

/// Attaches the in-flight task to its handle and hands it to the hardware
/// stage.
fn submit(core: &DecoderCore, task: &mut DecTask) {
    let hnd = task.hnd.take().expect("submit without a task handle");
    core.tasks.set_info(hnd, &task.info);
    core.tasks.set_status(hnd, TaskState::Processing);
    core.task_put_count.fetch_add(1, Ordering::SeqCst);
    core.hal_sync.signal();
}

/// One scheduling turn. Advances the in-flight task as far as the shared
/// state allows; returns `Ok` when a task was submitted.
fn try_proc(
    core: &DecoderCore,
    task: &mut DecTask,
    held: &mut Option<Packet>,
) -> Result<(), StepError> {
    // 1. A handle must be held before anything else is staged.
    if task.hnd.is_none() {
        match core.tasks.get_hnd(TaskState::Idle) {
            Some(hnd) => {
                task.hnd = Some(hnd);
                task.wait.task_handle = false;
            }
            None => {
                task.wait.task_handle = true;
                return Err(StepError::Waiting);
            }
        }
    }

    // 2./3. Pull a packet and prepare one access unit out of it. A packet
    // is kept across turns until the parser has consumed it completely.
    if !task.status.prepared {
        if held.is_none() {
            let Some(packet) = core.packets.lock().unwrap().pop_front() else {
                return Err(StepError::Waiting);
            };
            if core.use_preset_time_order.load(Ordering::SeqCst) {
                core.timestamps.push(packet.pts, packet.dts);
            }
            core.packet_get_count.fetch_add(1, Ordering::SeqCst);
            *held = Some(packet);
        }

        {
            let packet = held.as_mut().expect("held packet must exist here");
            log::trace!("input packet pts {}", packet.pts);
            if let Err(e) = core.parser.lock().unwrap().prepare(packet, &mut task.info) {
                log::warn!("prepare failed: {e:#}");
            }
            if packet.is_empty() {
                *held = None;
            }
        }

        task.status.prepared = task.info.valid;

        // End of stream can surface at prepare with no unit left to decode.
        // The beacon still travels the pipeline so every frame ahead of it
        // is delivered before the eos frame.
        if task.info.flags.eos && !task.info.valid {
            submit(core, task);
            task.info = HalDecTask::default();
            return Err(StepError::Again);
        }
        if !task.status.prepared {
            // The packet yielded nothing; try the next one.
            task.info = HalDecTask::default();
            return Err(StepError::Again);
        }
    }

    debug_assert!(task.info.prepared.is_some());

    // 4. Stage the payload into a packet slot.
    if task.info.input.is_none() {
        task.info.input = core.packet_slots.get_unused();
    }
    task.wait.packet_slot = task.info.input.is_none();
    if task.wait.packet_slot {
        return Err(StepError::Waiting);
    }
    let input = task.info.input.expect("packet slot index just checked");

    // 5. Back the slot with memory sized for the prepared unit.
    let stream_size = task.info.prepared.as_ref().map(|p| p.len()).unwrap_or(0);
    let pkt_buf = match core.packet_slots.buffer(input) {
        Some(buffer) => {
            debug_assert!(buffer.size() >= stream_size);
            Some(buffer)
        }
        None => core.packet_group.alloc(stream_size).map(|buffer| {
            core.packet_slots.set_buffer(input, &buffer);
            buffer
        }),
    };
    task.wait.packet_buffer = pkt_buf.is_none();
    let Some(pkt_buf) = pkt_buf else {
        return Err(StepError::Waiting);
    };

    // 6. Copy the payload. From here on hardware may read the slot.
    if !task.status.payload_copied {
        if let Some(prepared) = task.info.prepared.as_ref() {
            pkt_buf.fill(prepared.remaining());
        }
        core.packet_slots.set_flag(input, SlotFlag::CodecReady);
        core.packet_slots.set_flag(input, SlotFlag::HalInput);
        task.status.payload_copied = true;
    }

    // 7. Pipeline depth gate. Outside fast mode the previous task must be
    // retired first; in fast mode only an explicit wait-done request stalls
    // the stage, and only until the hardware stage has fully drained.
    if !core.fast_mode {
        if !task.status.prev_retired {
            match core.tasks.get_hnd(TaskState::ProcDone) {
                Some(prev) => {
                    task.status.prev_retired = true;
                    task.wait.prev_task = false;
                    core.tasks.set_status(prev, TaskState::Idle);
                }
                None => {
                    task.wait.prev_task = true;
                    return Err(StepError::Waiting);
                }
            }
        }
    } else if task.wait.all_done {
        if core.tasks.any(TaskState::Processing) {
            return Err(StepError::Waiting);
        }
        task.wait.all_done = false;
    }

    // 8. Display backpressure.
    task.wait.display_full = core.frames.lock().unwrap().len() > DISPLAY_PENDING_MAX;
    if task.wait.display_full {
        return Err(StepError::DisplayFull);
    }

    // 9. Frame buffer pool backpressure. The post-processor holds extra
    // buffers, so leave it more headroom when it runs.
    let reserve = if core.vproc_active.load(Ordering::SeqCst) { 3 } else { 1 };
    task.wait.frame_buffer = core.frame_group.unused() < reserve;
    if task.wait.frame_buffer {
        return Err(StepError::BufferFull);
    }

    // 10. A free frame slot must exist before parse may allocate one.
    task.wait.frame_slot = core.frame_slots.unused_count() == 0;
    if task.wait.frame_slot {
        return Err(StepError::BufferFull);
    }

    // 11. Parse: bind the output slot and the reference slots.
    if !task.status.parsed {
        if let Err(e) = core.parser.lock().unwrap().parse(&mut task.info) {
            log::warn!("parse failed: {e:#}");
            task.info.valid = false;
        }
        task.status.parsed = true;
    }

    if task.info.output.is_none() || !task.info.valid {
        // End of stream found during parse with nothing decodable left:
        // same beacon as in step 3. Anything else simply abandons the turn.
        if task.info.flags.eos {
            submit(core, task);
        } else if let Some(hnd) = task.hnd.take() {
            core.tasks.set_status(hnd, TaskState::Idle);
        }

        if task.status.payload_copied {
            core.packet_slots.clr_flag(input, SlotFlag::HalInput);
            task.status.payload_copied = false;
        }
        task.status.prepared = false;
        task.status.parsed = false;
        task.info = HalDecTask::default();
        return Err(StepError::Again);
    }

    // The parse may have latched a geometry change. Announce it once via an
    // in-band beacon, then hold position until the consumer acknowledges.
    if core.frame_slots.is_changed() {
        if !task.status.info_beacon_sent {
            task.info.flags.info_change = true;
            submit(core, task);
            task.status.info_beacon_sent = true;
            return Err(StepError::Stream);
        }
    }
    task.wait.info_change = core.frame_slots.is_changed();
    if task.wait.info_change {
        return Err(StepError::Stream);
    }
    task.status.info_beacon_sent = false;
    task.info.flags.info_change = false;

    // The beacon consumed the previous handle; a fresh one is re-acquired at
    // step 1 on the turn after the acknowledgement.
    debug_assert!(task.hnd.is_some());

    // 12. Back the output slot with a frame buffer.
    let output = task.info.output.expect("output slot bound by parse");
    let frm_buf = match core.frame_slots.buffer(output) {
        Some(buffer) => Some(buffer),
        None => core.frame_group.alloc(core.frame_slots.buffer_size()).map(|buffer| {
            core.frame_slots.set_buffer(output, &buffer);
            buffer
        }),
    };
    task.wait.frame_buffer = frm_buf.is_none();
    if task.wait.frame_buffer {
        return Err(StepError::Waiting);
    }

    // 13. Generate the register set and kick the hardware.
    if let Err(e) = core.hal.reg_gen(&task.info) {
        log::error!("register generation failed: {e:#}");
        task.info.flags.had_error = true;
    } else if let Err(e) = core.hal.start(&task.info) {
        log::error!("hardware start failed: {e:#}");
        task.info.flags.had_error = true;
    }

    // 14. Hand over to the hardware stage and begin a fresh task.
    task.wait.all_done = task.info.flags.wait_done;
    submit(core, task);
    task.status.payload_copied = false;
    task.status.prepared = false;
    task.status.parsed = false;
    task.status.prev_retired = false;
    task.info = HalDecTask::default();

    Ok(())
}

/// Returns the pipeline to a clean state. Runs on the parser thread while
/// the client blocks on the control condvar.
fn reset_pipeline(core: &DecoderCore, task: &mut DecTask, held: &mut Option<Packet>) {
    log::debug!("reset: waiting for the hardware stage to drain");
    while core.tasks.any(TaskState::Processing) {
        core.hal_sync.update_control(|| core.hal_reset_done.store(false, Ordering::SeqCst));
        core.hal_sync.signal();
        core.hal_sync.wait_control_while(|| {
            !core.hal_reset_done.load(Ordering::SeqCst) && core.hal_sync.is_running()
        });
        if !core.hal_sync.is_running() {
            break;
        }
    }

    log::debug!("reset: recycling retired handles");
    while let Some(hnd) = core.tasks.get_hnd(TaskState::ProcDone) {
        core.tasks.set_status(hnd, TaskState::Idle);
    }

    if core.tasks.any(TaskState::Processing) {
        panic!(
            "task left unprocessed across reset: put {} get {}",
            core.task_put_count.load(Ordering::SeqCst),
            core.task_get_count.load(Ordering::SeqCst)
        );
    }

    task.status.prepared = false;
    task.status.prev_retired = true;
    task.info.valid = false;
    core.parser.lock().unwrap().reset();
    core.hal.reset();
    core.reset_post_proc();

    if task.wait.info_change {
        log::warn!("reset during a pending geometry change");
        if let Some(output) = task.info.output {
            core.frame_slots.reset(output);
        }
    }

    if task.status.parsed {
        log::debug!("reset: dropping slot references of the unsubmitted task");
        if !task.wait.info_change {
            if let Some(output) = task.info.output {
                core.frame_slots.clr_flag(output, SlotFlag::HalOutput);
            }
        }
        for &reference in &task.info.refer {
            core.frame_slots.clr_flag(reference, SlotFlag::HalInput);
        }
    }

    // Release the partially consumed input packet.
    *held = None;

    // Undelivered frames in either output queue only held a queue
    // reference; drop it.
    {
        let _output = core.display_lock.lock().unwrap();
        for queue in [crate::slots::SlotQueue::Display, crate::slots::SlotQueue::Deinterlace] {
            while let Some(index) = core.frame_slots.dequeue(queue) {
                core.frame_slots.clr_flag(index, SlotFlag::QueueUse);
            }
        }
    }

    if core.use_preset_time_order.load(Ordering::SeqCst) {
        core.timestamps.flush();
    }

    if task.status.payload_copied {
        if let Some(input) = task.info.input {
            core.packet_slots.clr_flag(input, SlotFlag::HalInput);
        }
        task.status.payload_copied = false;
    } else if let Some(input) = task.info.input {
        // Allocated but never staged; force it back to the pool.
        core.packet_slots.reset(input);
    }

    *task = DecTask::new();
    log::debug!("reset: pipeline clean");
}
