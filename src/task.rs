// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hardware task descriptors and the handle ring they travel through.
//!
//! The parser stage fills a [`HalDecTask`], attaches it to an idle handle and
//! flips the handle to `Processing`; the hardware stage drains `Processing`
//! handles in submission order and retires them to `Idle` (fast mode) or
//! `ProcDone` (so the parser recycles them, gating pipeline depth).

use std::sync::Mutex;

use crate::packet::Packet;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Processing,
    ProcDone,
}

/// Protocol and error markers riding on a task.
#[derive(Clone, Copy, Debug, Default)]
pub struct TaskFlags {
    /// The stream ends with this task.
    pub eos: bool,
    /// The task announces a stream geometry change instead of image data.
    pub info_change: bool,
    /// The decode is known to produce a damaged picture.
    pub had_error: bool,
    /// Later pictures predict from this one.
    pub used_for_ref: bool,
    /// The pipeline must fully drain before the next task may start.
    pub wait_done: bool,
}

/// One decode task descriptor, as handed to the hardware layer.
#[derive(Clone, Debug, Default)]
pub struct HalDecTask {
    /// A complete access unit is bound and the task can be executed.
    pub valid: bool,
    pub flags: TaskFlags,
    /// Packet-slot index holding the compressed payload.
    pub input: Option<usize>,
    /// Frame-slot index receiving the decoded picture.
    pub output: Option<usize>,
    /// Frame-slot indices of the reference pictures this decode reads.
    pub refer: Vec<usize>,
    /// The prepared access unit, before it is copied into the packet slot.
    pub prepared: Option<Packet>,
}

/// Handle into a [`TaskGroup`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TaskHnd(usize);

struct TaskSlot {
    state: TaskState,
    /// Order of entry into the current state, for FIFO hand-out.
    seq: u64,
    info: HalDecTask,
}

struct GroupInner {
    slots: Vec<TaskSlot>,
    next_seq: u64,
}

/// A fixed ring of task handles, internally locked.
pub struct TaskGroup {
    inner: Mutex<GroupInner>,
}

impl TaskGroup {
    pub fn new(count: usize) -> Self {
        let slots = (0..count)
            .map(|seq| TaskSlot {
                state: TaskState::Idle,
                seq: seq as u64,
                info: HalDecTask::default(),
            })
            .collect();
        Self { inner: Mutex::new(GroupInner { slots, next_seq: count as u64 }) }
    }

    /// Returns the handle that entered `state` first, if any.
    pub fn get_hnd(&self, state: TaskState) -> Option<TaskHnd> {
        let inner = self.inner.lock().unwrap();
        inner
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == state)
            .min_by_key(|(_, s)| s.seq)
            .map(|(i, _)| TaskHnd(i))
    }

    pub fn set_status(&self, hnd: TaskHnd, state: TaskState) {
        let mut inner = self.inner.lock().unwrap();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let slot = &mut inner.slots[hnd.0];
        slot.state = state;
        slot.seq = seq;
    }

    pub fn set_info(&self, hnd: TaskHnd, info: &HalDecTask) {
        self.inner.lock().unwrap().slots[hnd.0].info = info.clone();
    }

    pub fn get_info(&self, hnd: TaskHnd) -> HalDecTask {
        self.inner.lock().unwrap().slots[hnd.0].info.clone()
    }

    /// Whether any handle currently sits in `state`.
    pub fn any(&self, state: TaskState) -> bool {
        self.inner.lock().unwrap().slots.iter().any(|s| s.state == state)
    }

    pub fn count(&self, state: TaskState) -> usize {
        self.inner.lock().unwrap().slots.iter().filter(|s| s.state == state).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_cycle_through_states() {
        let group = TaskGroup::new(2);
        assert!(group.any(TaskState::Idle));
        assert!(!group.any(TaskState::Processing));

        let a = group.get_hnd(TaskState::Idle).unwrap();
        group.set_status(a, TaskState::Processing);
        let b = group.get_hnd(TaskState::Idle).unwrap();
        assert_ne!(a, b);
        group.set_status(b, TaskState::Processing);
        assert!(group.get_hnd(TaskState::Idle).is_none());
        assert_eq!(group.count(TaskState::Processing), 2);

        group.set_status(a, TaskState::ProcDone);
        group.set_status(a, TaskState::Idle);
        assert_eq!(group.get_hnd(TaskState::Idle), Some(a));
    }

    #[test]
    fn processing_is_fifo() {
        let group = TaskGroup::new(3);
        let first = group.get_hnd(TaskState::Idle).unwrap();
        group.set_status(first, TaskState::Processing);
        let second = group.get_hnd(TaskState::Idle).unwrap();
        group.set_status(second, TaskState::Processing);

        assert_eq!(group.get_hnd(TaskState::Processing), Some(first));
        group.set_status(first, TaskState::Idle);
        assert_eq!(group.get_hnd(TaskState::Processing), Some(second));
    }

    #[test]
    fn info_rides_the_handle() {
        let group = TaskGroup::new(1);
        let hnd = group.get_hnd(TaskState::Idle).unwrap();
        let mut info = HalDecTask { valid: true, ..Default::default() };
        info.output = Some(3);
        info.flags.eos = true;
        group.set_info(hnd, &info);

        let back = group.get_info(hnd);
        assert!(back.valid);
        assert_eq!(back.output, Some(3));
        assert!(back.flags.eos);
    }
}
