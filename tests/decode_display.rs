// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! End-to-end decode and display flow against the in-process fakes: decode
//! an IDR picture into a video surface, mix it onto an output surface, and
//! run the output surface through a presentation queue.

use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use tegra_vdp::backend::dummy::DummyBackend;
use tegra_vdp::config::Config;
use tegra_vdp::device::Device;
use tegra_vdp::error::Result;
use tegra_vdp::h264::decoder::BitstreamBuffer;
use tegra_vdp::h264::decoder::PictureInfoH264;
use tegra_vdp::h264::decoder::Profile;
use tegra_vdp::h264::decoder::BITSTREAM_BUFFER_VERSION;
use tegra_vdp::host1x::DummyChannel;
use tegra_vdp::mem::fake::FakeAllocator;
use tegra_vdp::pixbuf::PixelFormat;
use tegra_vdp::presentation::QueueTarget;
use tegra_vdp::surface::PresentationStatus;
use tegra_vdp::surface::Surface;
use tegra_vdp::sync::Mutex;

// Start code, IDR NAL header, first_mb_in_slice ue(0), slice_type ue(2) = I.
const IDR_SLICE: &[u8] = &[0x00, 0x00, 0x00, 0x01, 0x65, 0xb0];

#[derive(Default)]
struct RecordingTarget {
    presented: Mutex<Vec<u64>>,
}

impl QueueTarget for RecordingTarget {
    fn present(&self, surface: &Arc<Surface>) -> Result<()> {
        self.presented.lock().push(surface.serial());
        Ok(())
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn wait_for<F: Fn() -> bool>(condition: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn decode_mix_and_present_one_frame() {
    init_logging();
    let backend = Arc::new(DummyBackend::new());
    let device = Device::with_backend(
        Arc::new(FakeAllocator::new()),
        Arc::new(DummyChannel::new()),
        backend.clone(),
        Config::default(),
    );

    // Decode a single IDR picture with no references.
    let video = device.create_video_surface(352, 288).unwrap();
    let decoder = device
        .create_decoder(Profile::H264Baseline, 352, 288, 2)
        .unwrap();
    let info = PictureInfoH264 {
        is_reference: true,
        frame_mbs_only_flag: true,
        direct_8x8_inference_flag: true,
        ..Default::default()
    };
    let buffers = [BitstreamBuffer {
        struct_version: BITSTREAM_BUFFER_VERSION,
        data: IDR_SLICE,
    }];
    device.decoder_render(decoder, video, &info, &buffers).unwrap();

    let decodes = backend.take_decodes();
    assert_eq!(decodes.len(), 1);
    assert_eq!(decodes[0].dpb_len, 1);
    assert_eq!(decodes[0].params.pic_width_in_mbs, 22);
    assert_eq!(decodes[0].params.pic_height_in_mbs, 18);

    // Mix onto an output surface. Identity conversion and 1:1 scale, so the
    // copy is deferred rather than composited.
    let output = device
        .create_output_surface(352, 288, PixelFormat::Argb8888)
        .unwrap();
    let mixer = device.create_mixer().unwrap();
    device
        .mixer_render(mixer, video, output, None, None, &[])
        .unwrap();

    // Present; the deferred transfer is consumed on display.
    let target = Arc::new(RecordingTarget::default());
    let target_handle = device.register_queue_target(target.clone()).unwrap();
    let queue = device.create_presentation_queue(target_handle).unwrap();
    device
        .presentation_queue_display(queue, output, device.presentation_queue_get_time())
        .unwrap();
    wait_for(|| {
        matches!(
            device.presentation_queue_query_status(queue, output),
            Ok((PresentationStatus::Visible, _))
        )
    });
    let output_serial = device.surface(output).unwrap().serial();
    assert_eq!(target.presented.lock().as_slice(), &[output_serial]);

    // Full teardown leaves no dangling handles.
    device.destroy_presentation_queue(queue).unwrap();
    device.destroy_queue_target(target_handle).unwrap();
    device.destroy_mixer(mixer).unwrap();
    device.destroy_decoder(decoder).unwrap();
    device.destroy_surface(output).unwrap();
    device.destroy_surface(video).unwrap();
}

#[test]
fn recycled_surfaces_decode_p_frames_against_references() {
    init_logging();
    let backend = Arc::new(DummyBackend::new());
    let device = Device::with_backend(
        Arc::new(FakeAllocator::new()),
        Arc::new(DummyChannel::new()),
        backend.clone(),
        Config::default(),
    );
    let decoder = device
        .create_decoder(Profile::H264Main, 176, 144, 2)
        .unwrap();

    // IDR into the first surface.
    let first = device.create_video_surface(176, 144).unwrap();
    let idr_info = PictureInfoH264 {
        is_reference: true,
        frame_mbs_only_flag: true,
        ..Default::default()
    };
    let idr = [BitstreamBuffer {
        struct_version: BITSTREAM_BUFFER_VERSION,
        data: IDR_SLICE,
    }];
    device.decoder_render(decoder, first, &idr_info, &idr).unwrap();

    // P picture referencing the IDR frame.
    // Non-IDR NAL header, first_mb_in_slice ue(0), slice_type ue(0) = P.
    let p_slice: &[u8] = &[0x00, 0x00, 0x00, 0x01, 0x41, 0xc0];
    let second = device.create_video_surface(176, 144).unwrap();
    let p_info = PictureInfoH264 {
        is_reference: true,
        frame_mbs_only_flag: true,
        frame_num: 1,
        field_order_cnt: [2, 2],
        references: vec![tegra_vdp::h264::decoder::ReferenceFrameH264 {
            surface: Some(device.surface(first).unwrap()),
            frame_idx: 0,
            field_order_cnt: [0, 0],
            top_is_reference: true,
            bottom_is_reference: true,
            ..Default::default()
        }],
        ..Default::default()
    };
    let p = [BitstreamBuffer {
        struct_version: BITSTREAM_BUFFER_VERSION,
        data: p_slice,
    }];
    device
        .decoder_render(
            decoder,
            second,
            &p_info,
            &p,
        )
        .unwrap();

    let decodes = backend.take_decodes();
    assert_eq!(decodes.len(), 2);
    assert_eq!(decodes[0].dpb_len, 1);
    assert_eq!(decodes[1].dpb_len, 2);
    assert_eq!(decodes[1].pocs, vec![2, 0]);

    // Destroy and recreate: the cache hands the same memory back.
    let first_serial = device.surface(first).unwrap().serial();
    device.destroy_surface(first).unwrap();
    let recycled = device.create_video_surface(176, 144).unwrap();
    assert_eq!(device.surface(recycled).unwrap().serial(), first_serial);
}
