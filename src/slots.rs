// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Slot registries tracking buffers through the decode pipeline.
//!
//! A slot is a stable index that follows one packet or one frame buffer
//! through its overlapping uses: hardware input, hardware output, reference
//! for a later decode, queued for display. Each use is a counted flag; a slot
//! stays alive while any count is non-zero and returns to the free pool, with
//! its buffer reference dropped, when the last one is cleared. Flag set/clear
//! pairs must balance; unbalanced clears panic in debug builds.
//!
//! `CodecReady` is not a reason to live. It marks the slot's data as valid
//! for hardware consumption and is dropped together with the buffer when the
//! slot is freed.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::buffer::Buffer;
use crate::frame::Frame;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SlotFlag {
    /// Slot data is valid for the codec/hardware.
    CodecReady,
    /// Hardware reads from this slot (packet payload or reference picture).
    HalInput,
    /// Hardware writes the decoded picture into this slot.
    HalOutput,
    /// The slot sits in one of the output queues.
    QueueUse,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SlotQueue {
    Display,
    Deinterlace,
}

impl SlotQueue {
    fn index(self) -> usize {
        match self {
            SlotQueue::Display => 0,
            SlotQueue::Deinterlace => 1,
        }
    }
}

#[derive(Default)]
struct Slot {
    in_use: bool,
    codec_ready: bool,
    hal_input: u32,
    hal_output: u32,
    queue_use: u32,
    buffer: Option<Buffer>,
    frame: Option<Frame>,
}

impl Slot {
    fn live_count(&self) -> u32 {
        self.hal_input + self.hal_output + self.queue_use
    }

    fn release(&mut self) {
        self.in_use = false;
        self.codec_ready = false;
        self.buffer = None;
        self.frame = None;
    }
}

struct SlotsInner {
    slots: Vec<Slot>,
    queues: [VecDeque<usize>; 2],
    info: Option<Frame>,
    changed: bool,
    buf_size: usize,
}

/// One registry of buffer slots, internally locked.
pub struct BufferSlots {
    inner: Mutex<SlotsInner>,
}

impl BufferSlots {
    pub fn new(count: usize) -> Self {
        let mut slots = Vec::new();
        slots.resize_with(count, Slot::default);
        Self {
            inner: Mutex::new(SlotsInner {
                slots,
                queues: [VecDeque::new(), VecDeque::new()],
                info: None,
                changed: false,
                buf_size: 0,
            }),
        }
    }

    /// (Re)configures the registry for `count` slots of `info` geometry.
    ///
    /// The first configuration applies silently. Any later change of geometry
    /// latches the changed condition until the consumer acknowledges it with
    /// [`ready`](Self::ready). The slot count never shrinks so indices held
    /// by in-flight tasks stay valid.
    pub fn configure(&self, count: usize, info: &Frame) {
        let mut inner = self.inner.lock().unwrap();
        if count > inner.slots.len() {
            let grow = count - inner.slots.len();
            inner.slots.extend((0..grow).map(|_| Slot::default()));
        }
        let latch = matches!(&inner.info, Some(prev) if !prev.same_geometry(info));
        if latch {
            log::debug!(
                "slot geometry change to {}x{} ({}x{} aligned)",
                info.width,
                info.height,
                info.hor_stride,
                info.ver_stride
            );
            inner.changed = true;
        }
        inner.buf_size = info.buffer_size();
        inner.info = Some(info.clone());
    }

    /// Seeds the geometry template without touching the slot count.
    pub fn set_info(&self, info: &Frame) {
        let count = self.inner.lock().unwrap().slots.len();
        self.configure(count, info);
    }

    /// Takes a free slot out of the pool.
    pub fn get_unused(&self) -> Option<usize> {
        let mut inner = self.inner.lock().unwrap();
        let index = inner.slots.iter().position(|s| !s.in_use)?;
        let slot = &mut inner.slots[index];
        slot.in_use = true;
        slot.codec_ready = false;
        debug_assert_eq!(slot.live_count(), 0);
        Some(index)
    }

    pub fn set_flag(&self, index: usize, flag: SlotFlag) {
        let mut inner = self.inner.lock().unwrap();
        let slot = &mut inner.slots[index];
        debug_assert!(slot.in_use, "flag set on free slot {}", index);
        match flag {
            SlotFlag::CodecReady => slot.codec_ready = true,
            SlotFlag::HalInput => slot.hal_input += 1,
            SlotFlag::HalOutput => slot.hal_output += 1,
            SlotFlag::QueueUse => slot.queue_use += 1,
        }
    }

    /// Drops one use of the slot. Clearing the last use frees the slot and
    /// releases its buffer reference.
    pub fn clr_flag(&self, index: usize, flag: SlotFlag) {
        let mut inner = self.inner.lock().unwrap();
        let slot = &mut inner.slots[index];
        match flag {
            SlotFlag::CodecReady => slot.codec_ready = false,
            SlotFlag::HalInput => {
                debug_assert!(slot.hal_input > 0, "unbalanced HalInput clear on {}", index);
                slot.hal_input = slot.hal_input.saturating_sub(1);
            }
            SlotFlag::HalOutput => {
                debug_assert!(slot.hal_output > 0, "unbalanced HalOutput clear on {}", index);
                slot.hal_output = slot.hal_output.saturating_sub(1);
            }
            SlotFlag::QueueUse => {
                debug_assert!(slot.queue_use > 0, "unbalanced QueueUse clear on {}", index);
                slot.queue_use = slot.queue_use.saturating_sub(1);
            }
        }
        if slot.in_use && slot.live_count() == 0 {
            slot.release();
        }
    }

    /// Unconditionally clears every use of the slot. Reset path only.
    pub fn reset(&self, index: usize) {
        let mut inner = self.inner.lock().unwrap();
        for queue in inner.queues.iter_mut() {
            queue.retain(|&i| i != index);
        }
        let slot = &mut inner.slots[index];
        slot.hal_input = 0;
        slot.hal_output = 0;
        slot.queue_use = 0;
        slot.release();
    }

    pub fn set_buffer(&self, index: usize, buffer: &Buffer) {
        let mut inner = self.inner.lock().unwrap();
        let slot = &mut inner.slots[index];
        slot.buffer = Some(buffer.clone());
        if let Some(frame) = slot.frame.as_mut() {
            frame.buffer = Some(buffer.clone());
        }
    }

    pub fn buffer(&self, index: usize) -> Option<Buffer> {
        self.inner.lock().unwrap().slots[index].buffer.clone()
    }

    pub fn set_frame(&self, index: usize, frame: Frame) {
        let mut inner = self.inner.lock().unwrap();
        let slot = &mut inner.slots[index];
        let mut frame = frame;
        if frame.buffer.is_none() {
            frame.buffer = slot.buffer.clone();
        }
        slot.frame = Some(frame);
    }

    pub fn frame(&self, index: usize) -> Option<Frame> {
        self.inner.lock().unwrap().slots[index].frame.clone()
    }

    pub fn with_frame_mut<R>(&self, index: usize, f: impl FnOnce(&mut Frame) -> R) -> Option<R> {
        let mut inner = self.inner.lock().unwrap();
        inner.slots[index].frame.as_mut().map(f)
    }

    /// Fills the slot's frame record from the geometry template and returns a
    /// copy of it.
    pub fn default_frame(&self, index: usize) -> Frame {
        let mut inner = self.inner.lock().unwrap();
        let frame = inner.info.clone().unwrap_or_default();
        inner.slots[index].frame = Some(frame.clone());
        frame
    }

    pub fn enqueue(&self, index: usize, queue: SlotQueue) {
        let mut inner = self.inner.lock().unwrap();
        inner.queues[queue.index()].push_back(index);
    }

    pub fn dequeue(&self, queue: SlotQueue) -> Option<usize> {
        let mut inner = self.inner.lock().unwrap();
        inner.queues[queue.index()].pop_front()
    }

    pub fn queue_is_empty(&self, queue: SlotQueue) -> bool {
        self.inner.lock().unwrap().queues[queue.index()].is_empty()
    }

    /// Whether the geometry changed since the last acknowledgement.
    pub fn is_changed(&self) -> bool {
        self.inner.lock().unwrap().changed
    }

    /// Consumer acknowledgement of a geometry change.
    pub fn ready(&self) {
        self.inner.lock().unwrap().changed = false;
    }

    /// Required backing-buffer size for the current geometry.
    pub fn buffer_size(&self) -> usize {
        self.inner.lock().unwrap().buf_size
    }

    pub fn unused_count(&self) -> usize {
        self.inner.lock().unwrap().slots.iter().filter(|s| !s.in_use).count()
    }

    pub fn used_count(&self) -> usize {
        self.inner.lock().unwrap().slots.iter().filter(|s| s.in_use).count()
    }

    pub fn is_in_use(&self, index: usize) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.slots.get(index).map(|s| s.in_use).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DecodedFormat;
    use crate::Resolution;

    fn geometry(width: u32, height: u32) -> Frame {
        Frame::with_geometry(Resolution::from((width, height)), DecodedFormat::NV12)
    }

    #[test]
    fn slot_lifecycle() {
        let slots = BufferSlots::new(2);
        let a = slots.get_unused().unwrap();
        let b = slots.get_unused().unwrap();
        assert_ne!(a, b);
        assert!(slots.get_unused().is_none());
        assert_eq!(slots.used_count(), 2);

        slots.set_flag(a, SlotFlag::HalOutput);
        slots.set_flag(a, SlotFlag::QueueUse);
        slots.clr_flag(a, SlotFlag::HalOutput);
        assert!(slots.is_in_use(a));
        slots.clr_flag(a, SlotFlag::QueueUse);
        assert!(!slots.is_in_use(a));
        assert_eq!(slots.unused_count(), 1);

        // Slot b never got a use flag; reset frees it.
        slots.reset(b);
        assert_eq!(slots.used_count(), 0);
    }

    #[test]
    fn buffer_released_with_last_flag() {
        let group = crate::buffer::BufferGroup::with_limit(1);
        let slots = BufferSlots::new(1);
        let idx = slots.get_unused().unwrap();
        let buf = group.alloc(64).unwrap();
        slots.set_buffer(idx, &buf);
        drop(buf);
        assert_eq!(group.unused(), 0);

        slots.set_flag(idx, SlotFlag::HalInput);
        slots.clr_flag(idx, SlotFlag::HalInput);
        assert_eq!(group.unused(), 1);
    }

    #[test]
    fn counted_flags_nest() {
        let slots = BufferSlots::new(1);
        let idx = slots.get_unused().unwrap();
        // Two tasks referencing the same picture.
        slots.set_flag(idx, SlotFlag::HalInput);
        slots.set_flag(idx, SlotFlag::HalInput);
        slots.clr_flag(idx, SlotFlag::HalInput);
        assert!(slots.is_in_use(idx));
        slots.clr_flag(idx, SlotFlag::HalInput);
        assert!(!slots.is_in_use(idx));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "unbalanced")]
    fn unbalanced_clear_panics() {
        let slots = BufferSlots::new(1);
        let idx = slots.get_unused().unwrap();
        slots.set_flag(idx, SlotFlag::HalOutput);
        slots.clr_flag(idx, SlotFlag::HalOutput);
        let idx = slots.get_unused().unwrap();
        slots.clr_flag(idx, SlotFlag::HalOutput);
    }

    #[test]
    fn queue_preserves_order() {
        let slots = BufferSlots::new(3);
        for expected in 0..3 {
            let idx = slots.get_unused().unwrap();
            assert_eq!(idx, expected);
            slots.set_flag(idx, SlotFlag::QueueUse);
            slots.enqueue(idx, SlotQueue::Display);
        }
        assert_eq!(slots.dequeue(SlotQueue::Display), Some(0));
        assert_eq!(slots.dequeue(SlotQueue::Display), Some(1));
        assert!(!slots.queue_is_empty(SlotQueue::Display));
        assert_eq!(slots.dequeue(SlotQueue::Display), Some(2));
        assert_eq!(slots.dequeue(SlotQueue::Display), None);
    }

    #[test]
    fn geometry_latch() {
        let slots = BufferSlots::new(2);
        slots.configure(2, &geometry(320, 240));
        // Initial configuration is not a change.
        assert!(!slots.is_changed());
        assert_eq!(slots.buffer_size(), 320 * 240 * 3 / 2);

        slots.configure(2, &geometry(320, 240));
        assert!(!slots.is_changed());

        slots.configure(4, &geometry(1280, 720));
        assert!(slots.is_changed());
        assert_eq!(slots.unused_count(), 4);
        // Latch holds until acknowledged.
        assert!(slots.is_changed());
        slots.ready();
        assert!(!slots.is_changed());
    }
}
