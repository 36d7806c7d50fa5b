// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-stage synchronization.
//!
//! Each scheduler stage owns one work condvar and one control condvar. Work
//! signals are counted so a wake-up posted while the stage is busy is never
//! lost; the stage consumes all pending signals at once and re-derives what
//! to do from shared state, so spurious wake-ups are harmless. The control
//! pair is reserved for the reset handshake.

use std::sync::Condvar;
use std::sync::Mutex;

struct WorkState {
    running: bool,
    pending: u32,
}

pub(crate) struct StageSync {
    work: Mutex<WorkState>,
    work_cv: Condvar,
    control: Mutex<()>,
    control_cv: Condvar,
}

impl StageSync {
    pub fn new() -> Self {
        Self {
            work: Mutex::new(WorkState { running: true, pending: 0 }),
            work_cv: Condvar::new(),
            control: Mutex::new(()),
            control_cv: Condvar::new(),
        }
    }

    /// Posts one work signal.
    pub fn signal(&self) {
        let mut state = self.work.lock().unwrap();
        state.pending = state.pending.saturating_add(1);
        self.work_cv.notify_one();
    }

    /// Sleeps until work is signalled, the stage is stopped, or `urgent`
    /// holds. Consumes all pending signals. Returns false once stopped.
    pub fn wait_for_work(&self, urgent: impl Fn() -> bool) -> bool {
        let mut state = self.work.lock().unwrap();
        while state.running && state.pending == 0 && !urgent() {
            state = self.work_cv.wait(state).unwrap();
        }
        state.pending = 0;
        state.running
    }

    pub fn is_running(&self) -> bool {
        self.work.lock().unwrap().running
    }

    /// Stops the stage and wakes anything sleeping on either condvar.
    pub fn stop(&self) {
        {
            let mut state = self.work.lock().unwrap();
            state.running = false;
            self.work_cv.notify_all();
        }
        let _control = self.control.lock().unwrap();
        self.control_cv.notify_all();
    }

    /// Runs `f` under the control lock and wakes control waiters. Any flag a
    /// control waiter checks must be written through here, otherwise the
    /// update can race with the waiter going to sleep.
    pub fn update_control(&self, f: impl FnOnce()) {
        let _control = self.control.lock().unwrap();
        f();
        self.control_cv.notify_all();
    }

    /// Sleeps on the control condvar while `pred` holds.
    pub fn wait_control_while(&self, pred: impl Fn() -> bool) {
        let mut guard = self.control.lock().unwrap();
        while pred() {
            guard = self.control_cv.wait(guard).unwrap();
        }
    }
}
