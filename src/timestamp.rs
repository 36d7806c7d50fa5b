// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! FIFO preserving input presentation timestamps for output frames.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Stores the (pts, dts) of every input packet so they can be re-attached to
/// decoded frames in arrival order when present-time-order mode is on.
#[derive(Default)]
pub struct TimestampQueue {
    queue: Mutex<VecDeque<(i64, i64)>>,
}

impl TimestampQueue {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn push(&self, pts: i64, dts: i64) {
        self.queue.lock().unwrap().push_back((pts, dts));
    }

    pub fn pull(&self) -> Option<(i64, i64)> {
        self.queue.lock().unwrap().pop_front()
    }

    pub fn flush(&self) {
        self.queue.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let ts = TimestampQueue::new();
        ts.push(0, 0);
        ts.push(40, 20);
        assert_eq!(ts.pull(), Some((0, 0)));
        assert_eq!(ts.pull(), Some((40, 20)));
        assert_eq!(ts.pull(), None);
    }

    #[test]
    fn flush_empties() {
        let ts = TimestampQueue::new();
        ts.push(0, 0);
        ts.push(40, 40);
        ts.flush();
        assert!(ts.is_empty());
        assert_eq!(ts.pull(), None);
    }
}
