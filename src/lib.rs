// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Scheduler core for a hardware-accelerated video decoder.
//!
//! The crate couples a software bitstream parser to a hardware decode engine
//! through a two-stage, pipelined scheduler. The parser stage turns compressed
//! packets into hardware task descriptors; the hardware stage submits them,
//! waits for completion and releases decoded frames for display. Both stages
//! share two bounded slot registries (one for packet buffers, one for frame
//! buffers) that track every buffer through its overlapping lifetimes.
//!
//! The concrete parsers and the register-level hardware layer are pluggable
//! collaborators behind the traits in [`backend`]; [`backend::dummy`] provides
//! software stand-ins so the scheduler can be exercised without hardware.

pub mod backend;
pub mod buffer;
pub mod decoder;
pub mod frame;
pub mod packet;
pub mod slots;
pub mod task;
pub mod timestamp;

use std::str::FromStr;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl From<(u32, u32)> for Resolution {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

/// Formats that decoded frame buffers can be laid out as.
///
/// The conventions here largely follow these of libyuv.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DecodedFormat {
    /// Y, U and V planes, 4:2:0 sampling, 8 bits per sample.
    I420,
    /// One Y and one interleaved UV plane, 4:2:0 sampling, 8 bits per sample.
    NV12,
    /// Y, U and V planes, 4:2:0 sampling, 16 bits per sample, LE. Only the 10 LSBs are used.
    I010,
    /// Y, U and V planes, 4:2:0 sampling, 16 bits per sample, LE. Only the 12 LSBs are used.
    I012,
}

impl Default for DecodedFormat {
    fn default() -> Self {
        DecodedFormat::NV12
    }
}

impl FromStr for DecodedFormat {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "i420" | "I420" => Ok(DecodedFormat::I420),
            "nv12" | "NV12" => Ok(DecodedFormat::NV12),
            "i010" | "I010" => Ok(DecodedFormat::I010),
            "i012" | "I012" => Ok(DecodedFormat::I012),
            _ => Err("unrecognized output format. Valid values: i420, nv12, i010, i012"),
        }
    }
}

/// Coding type of the input bitstream.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Coding {
    H264,
    H265,
    Vp9,
    Mjpeg,
    /// Synthetic coding understood by the collaborators in [`backend::dummy`].
    Dummy,
}

impl Coding {
    /// Stateless codings keep no inter-frame state, so there is no pipeline
    /// history to drain on reset.
    pub fn is_stateless(self) -> bool {
        matches!(self, Coding::Mjpeg)
    }
}

/// Returns the size required to back a frame of `format` with `hor_stride` x
/// `ver_stride` samples. This is the minimum size of the buffer attached to a
/// frame slot before hardware can write into it.
pub fn frame_size(format: DecodedFormat, hor_stride: usize, ver_stride: usize) -> usize {
    match format {
        DecodedFormat::I420 | DecodedFormat::NV12 => {
            let y_size = hor_stride * ver_stride;
            // U and V samples need to be aligned to 2.
            let uv_size = ((hor_stride + 1) / 2) * ((ver_stride + 1) / 2) * 2;

            y_size + uv_size
        }
        DecodedFormat::I010 | DecodedFormat::I012 => {
            frame_size(DecodedFormat::I420, hor_stride, ver_stride) * 2
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_size_nv12() {
        assert_eq!(frame_size(DecodedFormat::NV12, 320, 240), 320 * 240 * 3 / 2);
        // Odd dimensions round the chroma planes up.
        assert_eq!(frame_size(DecodedFormat::I420, 3, 3), 9 + 2 * 4);
    }

    #[test]
    fn frame_size_high_bit_depth() {
        assert_eq!(
            frame_size(DecodedFormat::I010, 320, 240),
            frame_size(DecodedFormat::I420, 320, 240) * 2
        );
    }

    #[test]
    fn stateless_codings() {
        assert!(Coding::Mjpeg.is_stateless());
        assert!(!Coding::H264.is_stateless());
    }
}
