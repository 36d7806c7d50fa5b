// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Compressed input packets.

use std::sync::Arc;

use crate::buffer::Buffer;

/// An opaque carrier of compressed bytes.
///
/// The payload is shared, so cloning a packet is cheap. The read cursor
/// tracks how much of the payload the parser has consumed; a packet is
/// released back to its producer once the cursor reaches the end.
#[derive(Clone, Debug, Default)]
pub struct Packet {
    data: Arc<[u8]>,
    pos: usize,
    pub pts: i64,
    pub dts: i64,
    pub eos: bool,
    /// Hardware-reachable memory holding the payload, when the caller
    /// provides it directly (task mode).
    pub buffer: Option<Buffer>,
}

impl Packet {
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self { data: data.into(), ..Default::default() }
    }

    pub fn with_pts(mut self, pts: i64) -> Self {
        self.pts = pts;
        self
    }

    pub fn with_dts(mut self, dts: i64) -> Self {
        self.dts = dts;
        self
    }

    pub fn with_eos(mut self) -> Self {
        self.eos = true;
        self
    }

    /// An empty packet whose only purpose is to signal end of stream.
    pub fn eos_marker() -> Self {
        Self { eos: true, ..Default::default() }
    }

    /// The unconsumed part of the payload.
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    pub fn len(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Moves the read cursor forward by `n` bytes.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.len());
        self.pos = (self.pos + n).min(self.data.len());
    }

    /// Consumes the rest of the payload.
    pub fn consume(&mut self) {
        self.pos = self.data.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_tracks_consumption() {
        let mut pkt = Packet::new(vec![0u8; 10]).with_pts(40);
        assert_eq!(pkt.len(), 10);
        pkt.advance(4);
        assert_eq!(pkt.len(), 6);
        assert_eq!(pkt.remaining().len(), 6);
        pkt.consume();
        assert!(pkt.is_empty());
        assert_eq!(pkt.pts, 40);
    }

    #[test]
    fn eos_marker_is_empty() {
        let pkt = Packet::eos_marker();
        assert!(pkt.eos);
        assert!(pkt.is_empty());
    }
}
