// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The hardware stage.
//!
//! Drains `Processing` handles in submission order: waits for the engine,
//! releases the slot references the task held, retires the handle and pushes
//! completed frames down the display path. Beacon tasks (geometry change,
//! end of stream) carry no image data and are answered with synthetic
//! frames. The parser is signalled after every state change it could be
//! blocked on.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::decoder::DecoderCore;
use crate::slots::SlotFlag;
use crate::task::TaskState;

pub(crate) fn run(core: Arc<DecoderCore>) {
    'outer: loop {
        let mut hnd = core.tasks.get_hnd(TaskState::Processing);
        while hnd.is_none() {
            // Nothing left in flight; acknowledge a pending reset before
            // going back to sleep.
            if core.reset_flag.load(Ordering::SeqCst)
                && !core.hal_reset_done.load(Ordering::SeqCst)
            {
                core.hal_sync.update_control(|| core.hal_reset_done.store(true, Ordering::SeqCst));
            }
            if !core.hal_sync.wait_for_work(|| false) {
                break 'outer;
            }
            hnd = core.tasks.get_hnd(TaskState::Processing);
        }
        let hnd = hnd.expect("a processing handle was just found");

        core.task_get_count.fetch_add(1, Ordering::SeqCst);
        let task = core.tasks.get_info(hnd);

        // Geometry-change beacon: drain everything decoded under the old
        // geometry, then emit one empty frame announcing the change.
        if task.flags.info_change {
            log::debug!("geometry change reached the hardware stage");
            core.flush_collaborators();
            core.push_display(&task.flags);
            core.put_frame(task.output, &task.flags);

            core.tasks.set_status(hnd, TaskState::Idle);
            core.parser_sync.signal();
            continue;
        }

        // End-of-stream beacon: no image data, flush the display path and
        // emit the final frame.
        if task.flags.eos && !task.valid {
            core.push_display(&task.flags);
            core.put_frame(None, &task.flags);

            core.tasks.set_status(hnd, TaskState::Idle);
            core.parser_sync.signal();
            continue;
        }

        if let Err(e) = core.hal.wait(&task) {
            log::error!("hardware wait failed: {e:#}");
        }

        // The engine is done reading the compressed payload.
        if let Some(input) = task.input {
            core.packet_slots.clr_flag(input, SlotFlag::HalInput);
        }
        if let Some(output) = task.output {
            core.frame_slots.clr_flag(output, SlotFlag::HalOutput);
        }
        for &reference in &task.refer {
            core.frame_slots.clr_flag(reference, SlotFlag::HalInput);
        }

        if task.flags.eos {
            core.flush_collaborators();
        }
        // Deliver before retiring the handle: once the parser passes its
        // previous-task gate it must see an up-to-date output list length.
        core.push_display(&task.flags);

        // In fast mode the handle goes straight back to the pool; otherwise
        // the parser recycles it through its previous-task gate.
        let retired = if core.fast_mode { TaskState::Idle } else { TaskState::ProcDone };
        core.tasks.set_status(hnd, retired);
        core.parser_sync.signal();
    }

    let put = core.task_put_count.load(Ordering::SeqCst);
    let get = core.task_get_count.load(Ordering::SeqCst);
    assert_eq!(put, get, "task put/get mismatch at hardware stage exit");
    log::debug!("hardware stage exited");
}
