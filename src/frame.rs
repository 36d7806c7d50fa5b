// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoded frame descriptors.

use crate::buffer::Buffer;
use crate::frame_size;
use crate::DecodedFormat;
use crate::Resolution;

/// Scan mode of the decoded picture.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum FrameMode {
    #[default]
    Progressive,
    InterlacedTopFirst,
    InterlacedBottomFirst,
}

impl FrameMode {
    pub fn is_interlaced(self) -> bool {
        !matches!(self, FrameMode::Progressive)
    }
}

/// Describes one decoded picture.
///
/// The descriptor does not own its slot; the pixel memory travels along as a
/// shared [`Buffer`] reference so that a frame handed to the client stays
/// readable after its slot has been recycled.
#[derive(Clone, Debug, Default)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub hor_stride: u32,
    pub ver_stride: u32,
    pub format: DecodedFormat,
    pub mode: FrameMode,
    pub pts: i64,
    pub dts: i64,
    /// The picture was decoded but its content is damaged.
    pub errinfo: bool,
    /// The picture should not be shown at all.
    pub discard: bool,
    pub eos: bool,
    pub info_change: bool,
    pub buffer: Option<Buffer>,
}

impl Frame {
    /// A geometry template for `resolution`, strides aligned the way the
    /// hardware expects them.
    pub fn with_geometry(resolution: Resolution, format: DecodedFormat) -> Self {
        Self {
            width: resolution.width,
            height: resolution.height,
            hor_stride: align16(resolution.width),
            ver_stride: align16(resolution.height),
            format,
            ..Default::default()
        }
    }

    pub fn resolution(&self) -> Resolution {
        Resolution { width: self.width, height: self.height }
    }

    /// Backing-buffer size required for this geometry.
    pub fn buffer_size(&self) -> usize {
        frame_size(self.format, self.hor_stride as usize, self.ver_stride as usize)
    }

    /// Whether `other` describes the same buffer geometry.
    pub fn same_geometry(&self, other: &Frame) -> bool {
        self.width == other.width
            && self.height == other.height
            && self.hor_stride == other.hor_stride
            && self.ver_stride == other.ver_stride
            && self.format == other.format
    }
}

fn align16(v: u32) -> u32 {
    (v + 15) & !15
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_template() {
        let frame = Frame::with_geometry(Resolution::from((320, 242)), DecodedFormat::NV12);
        assert_eq!(frame.hor_stride, 320);
        assert_eq!(frame.ver_stride, 256);
        assert_eq!(frame.buffer_size(), 320 * 256 * 3 / 2);
    }

    #[test]
    fn geometry_comparison_ignores_timestamps() {
        let a = Frame::with_geometry(Resolution::from((320, 240)), DecodedFormat::NV12);
        let mut b = a.clone();
        b.pts = 40;
        assert!(a.same_geometry(&b));
        b.width = 640;
        assert!(!a.same_geometry(&b));
    }
}
