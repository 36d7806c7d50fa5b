// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! End-to-end scheduler tests against the dummy collaborators.

use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use vdec_pipeline::backend::dummy::access_unit;
use vdec_pipeline::backend::dummy::DummyHal;
use vdec_pipeline::backend::dummy::DummyParser;
use vdec_pipeline::backend::dummy::DummyProc;
use vdec_pipeline::backend::dummy::HalStats;
use vdec_pipeline::backend::dummy::ProcStats;
use vdec_pipeline::backend::dummy::AU_CORRUPT;
use vdec_pipeline::backend::dummy::AU_INTERLACED;
use vdec_pipeline::backend::dummy::AU_KEYFRAME;
use vdec_pipeline::backend::dummy::AU_REF;
use vdec_pipeline::buffer::BufferGroup;
use vdec_pipeline::decoder::AdvancedDecoder;
use vdec_pipeline::decoder::Command;
use vdec_pipeline::decoder::DecodeJob;
use vdec_pipeline::decoder::Decoder;
use vdec_pipeline::decoder::DecoderConfig;
use vdec_pipeline::frame::Frame;
use vdec_pipeline::packet::Packet;
use vdec_pipeline::Coding;
use vdec_pipeline::DecodedFormat;
use vdec_pipeline::Resolution;

const TIMEOUT: Duration = Duration::from_secs(2);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn dummy_cfg() -> DecoderConfig {
    DecoderConfig { coding: Coding::Dummy, internal_pts: true, ..Default::default() }
}

fn new_decoder(cfg: DecoderConfig) -> Decoder {
    Decoder::new(
        cfg,
        |cfg| Ok(Box::new(DummyParser::new(cfg))),
        |cfg| Ok(Box::new(DummyHal::new(cfg))),
    )
    .unwrap()
}

fn new_decoder_with_stats(cfg: DecoderConfig) -> (Decoder, Arc<HalStats>) {
    let stats = Arc::new(HalStats::default());
    let hal_stats = Arc::clone(&stats);
    let decoder = Decoder::new(
        cfg,
        |cfg| Ok(Box::new(DummyParser::new(cfg))),
        move |cfg| Ok(Box::new(DummyHal::with_stats(cfg, hal_stats))),
    )
    .unwrap();
    (decoder, stats)
}

fn res(width: u32, height: u32) -> Resolution {
    Resolution::from((width, height))
}

/// Collects frames until one carries eos, acknowledging geometry changes on
/// the way like a real client would.
fn collect_until_eos(decoder: &Decoder, max: usize) -> Vec<Frame> {
    let mut frames = Vec::new();
    while frames.len() < max {
        let Some(frame) = decoder.get_frame_timeout(TIMEOUT) else {
            break;
        };
        let eos = frame.eos;
        let info_change = frame.info_change;
        frames.push(frame);
        if info_change {
            decoder.control(&Command::SetInfoChangeReady);
        }
        if eos {
            break;
        }
    }
    frames
}

#[test]
fn minimal_stream() {
    init_logging();
    let decoder = new_decoder(dummy_cfg());

    decoder.put_packet(
        Packet::new(access_unit(res(320, 240), 0, AU_KEYFRAME, b"first")).with_pts(0),
    );
    decoder.put_packet(
        Packet::new(access_unit(res(320, 240), 40, AU_KEYFRAME, b"second"))
            .with_pts(40)
            .with_eos(),
    );

    let frames = collect_until_eos(&decoder, 8);
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].pts, 0);
    assert_eq!(frames[1].pts, 40);
    assert!(!frames[0].eos);
    assert!(frames[1].eos);
    assert!(frames.iter().all(|f| !f.errinfo && !f.discard));
    assert_eq!(frames[0].width, 320);
    assert_eq!(frames[0].height, 240);

    // The payload went through the packet slot into the frame buffer.
    frames[0].buffer.as_ref().unwrap().with_data(|data| assert_eq!(&data[..5], b"first"));
    frames[1].buffer.as_ref().unwrap().with_data(|data| assert_eq!(&data[..6], b"second"));
}

#[test]
fn one_packet_splits_into_three_frames() {
    init_logging();
    let decoder = new_decoder(DecoderConfig { need_split: true, ..dummy_cfg() });

    let mut stream = Vec::new();
    for pts in [0i64, 40, 80] {
        stream.extend(access_unit(res(176, 144), pts, AU_KEYFRAME, &[pts as u8; 32]));
    }
    decoder.put_packet(Packet::new(stream).with_eos());

    let frames = collect_until_eos(&decoder, 8);
    assert_eq!(frames.len(), 3);
    assert_eq!(frames.iter().map(|f| f.pts).collect::<Vec<_>>(), vec![0, 40, 80]);
    assert!(frames[2].eos);
}

#[test]
fn present_time_order_restores_packet_timestamps() {
    init_logging();
    let decoder = new_decoder(dummy_cfg());
    decoder.control(&Command::SetPresentTimeOrder(true));

    // Bitstream timestamps diverge from the packet envelope on purpose.
    decoder.put_packet(
        Packet::new(access_unit(res(64, 64), 1000, AU_KEYFRAME, b"a"))
            .with_pts(0)
            .with_dts(-10),
    );
    decoder.put_packet(
        Packet::new(access_unit(res(64, 64), 2000, AU_KEYFRAME, b"b"))
            .with_pts(40)
            .with_dts(30)
            .with_eos(),
    );

    let frames = collect_until_eos(&decoder, 8);
    assert_eq!(frames.len(), 2);
    assert_eq!((frames[0].pts, frames[0].dts), (0, -10));
    assert_eq!((frames[1].pts, frames[1].dts), (40, 30));
}

#[test]
fn eos_only_packet_still_produces_one_eos_frame() {
    init_logging();
    let decoder = new_decoder(dummy_cfg());
    decoder.put_packet(Packet::eos_marker());

    let frames = collect_until_eos(&decoder, 4);
    assert_eq!(frames.len(), 1);
    assert!(frames[0].eos);
    // The beacon carries no image data.
    assert!(frames[0].buffer.is_none());
}

#[test]
fn info_change_drains_before_switching_geometry() {
    init_logging();
    let decoder = new_decoder(dummy_cfg());

    for (pts, geometry) in [(0, (320, 240)), (40, (320, 240)), (80, (1280, 720))] {
        decoder.put_packet(Packet::new(access_unit(
            res(geometry.0, geometry.1),
            pts,
            AU_KEYFRAME,
            b"au",
        )));
    }
    decoder.put_packet(
        Packet::new(access_unit(res(1280, 720), 120, AU_KEYFRAME, b"au")).with_eos(),
    );

    let frames = collect_until_eos(&decoder, 16);
    assert_eq!(frames.len(), 5);

    // Old geometry fully delivered first.
    assert_eq!(frames[0].width, 320);
    assert_eq!(frames[1].width, 320);
    assert!(!frames[0].info_change && !frames[1].info_change);

    // One empty frame announces the change, already carrying the new
    // geometry.
    assert!(frames[2].info_change);
    assert_eq!(frames[2].width, 1280);

    // New geometry afterwards.
    assert_eq!(frames[3].width, 1280);
    assert!(!frames[3].info_change);
    assert_eq!(frames[4].width, 1280);
    assert!(frames[4].eos);
    assert_eq!(frames.iter().map(|f| f.pts).collect::<Vec<_>>()[3..], [80, 120]);
}

#[test]
fn reset_mid_stream_and_decode_again() {
    init_logging();
    let decoder = new_decoder(dummy_cfg());

    decoder.put_packet(Packet::new(access_unit(
        res(320, 240),
        0,
        AU_KEYFRAME | AU_REF,
        b"k",
    )));
    for i in 1..10i64 {
        decoder.put_packet(Packet::new(access_unit(res(320, 240), i * 40, AU_REF, b"p")));
    }

    for _ in 0..3 {
        assert!(decoder.get_frame_timeout(TIMEOUT).is_some());
    }

    decoder.reset();
    assert_eq!(decoder.used_slot_count(), 0);
    assert_eq!(decoder.pending_frames(), 0);

    // Idempotent: a second reset reaches the same state.
    decoder.reset();
    assert_eq!(decoder.used_slot_count(), 0);

    // A fresh stream decodes normally afterwards.
    decoder.put_packet(Packet::new(access_unit(res(320, 240), 0, AU_KEYFRAME, b"n")));
    decoder.put_packet(
        Packet::new(access_unit(res(320, 240), 40, AU_KEYFRAME, b"n")).with_eos(),
    );
    let frames = collect_until_eos(&decoder, 8);
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[1].pts, 40);
    assert!(frames[1].eos);
}

#[test]
fn reset_is_a_noop_for_stateless_coding() {
    init_logging();
    let decoder = new_decoder(DecoderConfig { coding: Coding::Mjpeg, ..dummy_cfg() });

    decoder.put_packet(Packet::new(access_unit(res(64, 64), 0, AU_KEYFRAME, b"j")));
    assert!(decoder.get_frame_timeout(TIMEOUT).is_some());

    // Returns immediately and the pipeline keeps decoding.
    decoder.reset();
    decoder.put_packet(
        Packet::new(access_unit(res(64, 64), 40, AU_KEYFRAME, b"j")).with_eos(),
    );
    let frames = collect_until_eos(&decoder, 4);
    assert!(frames.iter().any(|f| f.eos));
}

#[test]
fn display_backpressure_stops_the_parser() {
    init_logging();
    let decoder = new_decoder(dummy_cfg());

    for i in 0..12i64 {
        decoder.put_packet(Packet::new(access_unit(res(64, 64), i * 40, AU_KEYFRAME, b"x")));
    }

    // With nobody consuming, the output list settles at its bound.
    let deadline = Instant::now() + TIMEOUT;
    while decoder.pending_frames() < 5 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    thread::sleep(Duration::from_millis(50));
    assert_eq!(decoder.pending_frames(), 5);

    // Draining resumes the parser and nothing was dropped.
    let mut received = 0;
    while received < 12 {
        match decoder.get_frame_timeout(TIMEOUT) {
            Some(_) => received += 1,
            None => break,
        }
    }
    assert_eq!(received, 12);
}

#[test]
fn fast_mode_bounds_pipelining_depth() {
    init_logging();
    let (decoder, stats) = new_decoder_with_stats(DecoderConfig {
        fast_mode: true,
        ..dummy_cfg()
    });

    decoder.put_packet(Packet::new(access_unit(
        res(64, 64),
        0,
        AU_KEYFRAME | AU_REF,
        b"k",
    )));
    for i in 1..30i64 {
        decoder.put_packet(Packet::new(access_unit(res(64, 64), i * 40, AU_REF, b"p")));
    }
    decoder.put_packet(Packet::eos_marker());

    let frames = collect_until_eos(&decoder, 64);
    assert_eq!(frames.len(), 31);
    assert!(frames[30].eos);

    // Three task handles cap the number of concurrently started decodes.
    assert!(stats.max_inflight() <= 3, "inflight depth {}", stats.max_inflight());
    assert_eq!(stats.completed(), 30);
}

#[test]
fn non_fast_mode_serializes_hardware() {
    init_logging();
    let (decoder, stats) = new_decoder_with_stats(dummy_cfg());

    for i in 0..8i64 {
        decoder.put_packet(Packet::new(access_unit(res(64, 64), i * 40, AU_KEYFRAME, b"x")));
    }
    decoder.put_packet(Packet::eos_marker());

    let frames = collect_until_eos(&decoder, 16);
    assert_eq!(frames.len(), 9);
    // The previous-task gate keeps one decode on the engine at a time.
    assert!(stats.max_inflight() <= 1, "inflight depth {}", stats.max_inflight());
}

#[test]
fn corrupt_frame_reports_errinfo_unless_disabled() {
    init_logging();

    let decoder = new_decoder(dummy_cfg());
    decoder.put_packet(Packet::new(access_unit(
        res(64, 64),
        0,
        AU_KEYFRAME | AU_CORRUPT,
        b"bad",
    )));
    decoder.put_packet(Packet::eos_marker());
    let frames = collect_until_eos(&decoder, 4);
    assert_eq!(frames.len(), 2);
    assert!(frames[0].errinfo);

    let decoder = new_decoder(dummy_cfg());
    decoder.control(&Command::SetDisableError(true));
    decoder.put_packet(Packet::new(access_unit(
        res(64, 64),
        0,
        AU_KEYFRAME | AU_CORRUPT,
        b"bad",
    )));
    decoder.put_packet(Packet::eos_marker());
    let frames = collect_until_eos(&decoder, 4);
    assert_eq!(frames.len(), 2);
    assert!(!frames[0].errinfo);
    assert!(!frames[0].discard);
}

#[test]
fn interlaced_content_starts_the_post_processor() {
    init_logging();
    let stats = Arc::new(ProcStats::default());
    let proc_stats = Arc::clone(&stats);
    let decoder = Decoder::with_post_proc(
        dummy_cfg(),
        |cfg| Ok(Box::new(DummyParser::new(cfg))),
        |cfg| Ok(Box::new(DummyHal::new(cfg))),
        Box::new(DummyProc::new(proc_stats)),
    )
    .unwrap();

    decoder.put_packet(Packet::new(access_unit(
        res(320, 240),
        0,
        AU_KEYFRAME | AU_INTERLACED,
        b"field",
    )));

    let deadline = Instant::now() + TIMEOUT;
    while stats.signals() == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(stats.started());
    assert!(stats.signals() >= 1);
    // The frame went to the post-processing queue, not the output list.
    assert_eq!(decoder.pending_frames(), 0);
}

#[test]
fn flush_on_idle_pipeline_is_a_noop() {
    init_logging();
    let decoder = new_decoder(dummy_cfg());
    decoder.flush();
    decoder.flush();
    assert_eq!(decoder.pending_frames(), 0);
    assert_eq!(decoder.used_slot_count(), 0);
}

#[test]
fn init_and_teardown_leak_nothing() {
    init_logging();
    let group = BufferGroup::with_limit(4);
    {
        let decoder = new_decoder(dummy_cfg());
        decoder.put_packet(
            Packet::new(access_unit(res(64, 64), 0, AU_KEYFRAME, b"x")).with_eos(),
        );
        let frames = collect_until_eos(&decoder, 4);
        assert_eq!(frames.len(), 1);
    }
    // An unrelated group is untouched by the decoder teardown.
    assert_eq!(group.unused(), 4);
}

#[test]
fn advanced_path_decodes_one_shot_jobs() {
    init_logging();
    let advanced = AdvancedDecoder::new(
        dummy_cfg(),
        |cfg| Ok(Box::new(DummyParser::new(cfg))),
        |cfg| Ok(Box::new(DummyHal::new(cfg))),
    )
    .unwrap();

    let group = BufferGroup::with_limit(4);
    let record = access_unit(res(64, 64), 9, AU_KEYFRAME, b"one-shot");
    let input = group.alloc(record.len()).unwrap();
    input.fill(&record);
    let mut packet = Packet::new(record);
    packet.buffer = Some(input);

    let mut frame = Frame::with_geometry(res(64, 64), DecodedFormat::NV12);
    frame.buffer = Some(group.alloc(frame.buffer_size()).unwrap());

    advanced.submit_job(DecodeJob { packet, frame });
    let job = advanced.wait_job(TIMEOUT).unwrap();
    assert!(!job.frame.errinfo);
    assert_eq!(job.frame.width, 64);
    assert_eq!(job.frame.pts, 9);
    job.frame.buffer.as_ref().unwrap().with_data(|data| assert_eq!(&data[..8], b"one-shot"));

    // A packet without hardware-reachable memory comes back as an error
    // frame.
    let record = access_unit(res(64, 64), 10, AU_KEYFRAME, b"no-buf");
    advanced.submit_job(DecodeJob {
        packet: Packet::new(record),
        frame: Frame::with_geometry(res(64, 64), DecodedFormat::NV12),
    });
    let job = advanced.wait_job(TIMEOUT).unwrap();
    assert!(job.frame.errinfo);
}
