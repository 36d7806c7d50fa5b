// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Collaborator interfaces of the decode pipeline.
//!
//! The scheduler core is codec and hardware agnostic. Everything that knows
//! bitstream syntax lives behind [`Parser`], everything that touches decode
//! registers behind [`HalBackend`], and the optional deinterlacer behind
//! [`PostProc`]. The [`dummy`] module provides software implementations so
//! the scheduler can be driven without either.

pub mod dummy;

use std::sync::Arc;

use crate::decoder::Command;
use crate::packet::Packet;
use crate::slots::BufferSlots;
use crate::task::HalDecTask;
use crate::Coding;

/// Callback collaborators may invoke to wake the scheduler stages, e.g. from
/// an interrupt handler or a resource-release path.
pub type NotifyCb = Arc<dyn Fn() + Send + Sync>;

/// Everything a parser needs to bind itself to the pipeline.
pub struct ParserCfg {
    pub coding: Coding,
    pub frame_slots: Arc<BufferSlots>,
    pub packet_slots: Arc<BufferSlots>,
    pub task_count: usize,
    /// Input packets may carry several access units and must be split.
    pub need_split: bool,
    /// Timestamps come from the bitstream rather than the packet envelope.
    pub internal_pts: bool,
    pub notify: NotifyCb,
}

pub struct HalCfg {
    pub coding: Coding,
    pub frame_slots: Arc<BufferSlots>,
    pub packet_slots: Arc<BufferSlots>,
    pub task_count: usize,
    pub fast_mode: bool,
    pub notify: NotifyCb,
}

/// Bitstream parser collaborator.
///
/// `prepare` extracts at most one access unit from the packet and advances
/// its cursor; `parse` analyzes the prepared unit, allocates the output frame
/// slot and binds the reference slots the decode will read.
pub trait Parser: Send {
    fn prepare(&mut self, packet: &mut Packet, task: &mut HalDecTask) -> anyhow::Result<()>;

    fn parse(&mut self, task: &mut HalDecTask) -> anyhow::Result<()>;

    /// Drops all inter-frame state, e.g. after a seek.
    fn reset(&mut self);

    fn flush(&mut self);

    fn control(&mut self, _cmd: &Command) {}
}

/// Hardware decode engine collaborator.
///
/// `wait` blocks until the submitted task completes on the engine. The handle
/// is shared between both scheduler stages (one stage can start the next task
/// while the other waits on the previous one), so implementations synchronize
/// internally.
pub trait HalBackend: Send + Sync {
    /// Translates the task into a register set.
    fn reg_gen(&self, task: &HalDecTask) -> anyhow::Result<()>;

    /// Kicks off execution of the task on the engine.
    fn start(&self, task: &HalDecTask) -> anyhow::Result<()>;

    /// Blocks until the task completes.
    fn wait(&self, task: &HalDecTask) -> anyhow::Result<()>;

    fn reset(&self);

    fn flush(&self);

    fn control(&self, _cmd: &Command) {}
}

/// Post-processing (deinterlace) collaborator. Started lazily by the
/// pipeline when the first interlaced frame shows up and deinterlacing is
/// enabled; consumes slots from the deinterlace queue.
pub trait PostProc: Send {
    fn start(&mut self) -> anyhow::Result<()>;

    /// Wakes the post-processor after a slot was queued for it.
    fn signal(&mut self);

    fn reset(&mut self);
}
