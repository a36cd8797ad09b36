// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The device-specific decode ioctl backend.
//!
//! Two versions of the request structure exist in the wild; the newer one
//! carries a trailing reserved field. A kernel that only understands the
//! legacy layout rejects the current one with "operation not supported", at
//! which point this backend silently repacks into the legacy layout and
//! stays on it for the lifetime of the device handle.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;

use log::error;
use log::info;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

use crate::error::Result;
use crate::error::VdpError;
use crate::h264::reflist::DpbFrame;
use crate::ioctl;
use crate::sync::Mutex;

use super::DecodeBackend;
use super::DecodeParams;

const VDE_DEVICE: &str = "/dev/tegra_vde";

pub const FRAME_FLAG_B_FRAME: u32 = 1 << 0;
pub const FRAME_FLAG_REFERENCE: u32 = 1 << 1;

/// DPB entry layout shared by both ABI versions up to the reserved tail.
#[repr(C)]
#[derive(Copy, Clone, Default, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct VdeH264Frame {
    pub y_fd: i32,
    pub cb_fd: i32,
    pub cr_fd: i32,
    pub aux_fd: i32,
    pub y_offset: u32,
    pub cb_offset: u32,
    pub cr_offset: u32,
    pub aux_offset: u32,
    pub frame_num: u32,
    pub flags: u32,
    pub reserved: [u32; 6],
}

/// Legacy DPB entry, identical minus the reserved tail.
#[repr(C)]
#[derive(Copy, Clone, Default, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct VdeH264FrameLegacy {
    pub y_fd: i32,
    pub cb_fd: i32,
    pub cr_fd: i32,
    pub aux_fd: i32,
    pub y_offset: u32,
    pub cb_offset: u32,
    pub cr_offset: u32,
    pub cr_offset2: u32,
    pub frame_num: u32,
    pub flags: u32,
}

/// Current decode request layout.
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct VdeH264DecoderCtx {
    pub bitstream_data_fd: i32,
    pub bitstream_data_offset: u32,
    pub dpb_frames_ptr: u64,
    pub dpb_frames_nb: u32,
    pub dpb_ref_frames_with_earlier_poc_nb: u32,
    pub baseline_profile: u32,
    pub level_idc: u32,
    pub log2_max_pic_order_cnt_lsb: u32,
    pub log2_max_frame_num: u32,
    pub pic_order_cnt_type: u32,
    pub direct_8x8_inference_flag: u32,
    pub pic_width_in_mbs: u32,
    pub pic_height_in_mbs: u32,
    pub pic_init_qp: u32,
    pub deblocking_filter_control_present_flag: u32,
    pub constrained_intra_pred_flag: u32,
    pub chroma_qp_index_offset: u32,
    pub pic_order_present_flag: u32,
    pub num_ref_idx_l0_active_minus1: u32,
    pub num_ref_idx_l1_active_minus1: u32,
    pub reserved: [u32; 11],
}

/// Legacy decode request, identical minus the reserved tail.
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct VdeH264DecoderCtxLegacy {
    pub bitstream_data_fd: i32,
    pub bitstream_data_offset: u32,
    pub dpb_frames_ptr: u64,
    pub dpb_frames_nb: u32,
    pub dpb_ref_frames_with_earlier_poc_nb: u32,
    pub baseline_profile: u32,
    pub level_idc: u32,
    pub log2_max_pic_order_cnt_lsb: u32,
    pub log2_max_frame_num: u32,
    pub pic_order_cnt_type: u32,
    pub direct_8x8_inference_flag: u32,
    pub pic_width_in_mbs: u32,
    pub pic_height_in_mbs: u32,
    pub pic_init_qp: u32,
    pub deblocking_filter_control_present_flag: u32,
    pub constrained_intra_pred_flag: u32,
    pub chroma_qp_index_offset: u32,
    pub pic_order_present_flag: u32,
    pub num_ref_idx_l0_active_minus1: u32,
    pub num_ref_idx_l1_active_minus1: u32,
}

const VDE_IOCTL_MAGIC: u32 = b'v' as u32;
const VDE_IOCTL_DECODE_NR: u32 = 0x01;

fn decode_h264_nr() -> ioctl::IoctlNr {
    ioctl::iow::<VdeH264DecoderCtx>(VDE_IOCTL_MAGIC, VDE_IOCTL_DECODE_NR)
}

fn decode_h264_legacy_nr() -> ioctl::IoctlNr {
    ioctl::iow::<VdeH264DecoderCtxLegacy>(VDE_IOCTL_MAGIC, VDE_IOCTL_DECODE_NR)
}

/// Maps a level_idc to the engine's level index. Levels 1.1 through 5.0 map
/// to 2..=14; everything else, including the level 5.1 this driver always
/// requests, maps to 15.
pub fn level_index(level_idc: u8) -> u32 {
    match level_idc {
        11 => 2,
        12 => 3,
        13 => 4,
        20 => 5,
        21 => 6,
        22 => 7,
        30 => 8,
        31 => 9,
        32 => 10,
        40 => 11,
        41 => 12,
        42 => 13,
        50 => 14,
        _ => 15,
    }
}

/// Which request layout this device handle speaks. Starts on `Current` and
/// permanently degrades to `Legacy` on the first "operation not supported".
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IoctlAbi {
    Current,
    Legacy,
}

pub struct VdeBackend {
    file: File,
    abi: Mutex<IoctlAbi>,
}

fn frame_flags(frame: &DpbFrame) -> u32 {
    let mut flags = 0;
    if frame.is_reference {
        flags |= FRAME_FLAG_REFERENCE;
    }
    if frame.is_b_frame {
        flags |= FRAME_FLAG_B_FRAME;
    }
    flags
}

fn pack_frames(dpb: &[DpbFrame]) -> Vec<VdeH264Frame> {
    dpb.iter()
        .map(|frame| VdeH264Frame {
            y_fd: frame.planes.y_fd,
            cb_fd: frame.planes.cb_fd,
            cr_fd: frame.planes.cr_fd,
            aux_fd: frame.planes.aux_fd,
            y_offset: frame.planes.y_offset,
            cb_offset: frame.planes.cb_offset,
            cr_offset: frame.planes.cr_offset,
            aux_offset: frame.planes.aux_offset,
            frame_num: frame.frame_num as u32,
            flags: frame_flags(frame),
            reserved: [0; 6],
        })
        .collect()
}

fn pack_frames_legacy(dpb: &[DpbFrame]) -> Vec<VdeH264FrameLegacy> {
    dpb.iter()
        .map(|frame| VdeH264FrameLegacy {
            y_fd: frame.planes.y_fd,
            cb_fd: frame.planes.cb_fd,
            cr_fd: frame.planes.cr_fd,
            aux_fd: frame.planes.aux_fd,
            y_offset: frame.planes.y_offset,
            cb_offset: frame.planes.cb_offset,
            cr_offset: frame.planes.cr_offset,
            cr_offset2: frame.planes.cr_offset,
            frame_num: frame.frame_num as u32,
            flags: frame_flags(frame),
        })
        .collect()
}

fn pack_ctx(params: &DecodeParams, frames_ptr: u64, frames_nb: u32) -> VdeH264DecoderCtx {
    VdeH264DecoderCtx {
        bitstream_data_fd: params.bitstream_fd,
        bitstream_data_offset: params.bitstream_offset,
        dpb_frames_ptr: frames_ptr,
        dpb_frames_nb: frames_nb,
        dpb_ref_frames_with_earlier_poc_nb: params.refs_earlier,
        baseline_profile: params.baseline_profile as u32,
        level_idc: level_index(params.level_idc),
        log2_max_pic_order_cnt_lsb: params.log2_max_pic_order_cnt_lsb as u32,
        log2_max_frame_num: params.log2_max_frame_num as u32,
        pic_order_cnt_type: params.pic_order_cnt_type as u32,
        direct_8x8_inference_flag: params.direct_8x8_inference as u32,
        pic_width_in_mbs: params.pic_width_in_mbs,
        pic_height_in_mbs: params.pic_height_in_mbs,
        pic_init_qp: params.pic_init_qp,
        deblocking_filter_control_present_flag: params.deblocking_filter_control_present as u32,
        constrained_intra_pred_flag: params.constrained_intra_pred as u32,
        chroma_qp_index_offset: params.chroma_qp_index_offset as u32,
        pic_order_present_flag: params.pic_order_present as u32,
        num_ref_idx_l0_active_minus1: params.num_ref_idx_l0_active_minus1 as u32,
        num_ref_idx_l1_active_minus1: params.num_ref_idx_l1_active_minus1 as u32,
        reserved: [0; 11],
    }
}

fn pack_ctx_legacy(
    params: &DecodeParams,
    frames_ptr: u64,
    frames_nb: u32,
) -> VdeH264DecoderCtxLegacy {
    let current = pack_ctx(params, frames_ptr, frames_nb);
    VdeH264DecoderCtxLegacy {
        bitstream_data_fd: current.bitstream_data_fd,
        bitstream_data_offset: current.bitstream_data_offset,
        dpb_frames_ptr: current.dpb_frames_ptr,
        dpb_frames_nb: current.dpb_frames_nb,
        dpb_ref_frames_with_earlier_poc_nb: current.dpb_ref_frames_with_earlier_poc_nb,
        baseline_profile: current.baseline_profile,
        level_idc: current.level_idc,
        log2_max_pic_order_cnt_lsb: current.log2_max_pic_order_cnt_lsb,
        log2_max_frame_num: current.log2_max_frame_num,
        pic_order_cnt_type: current.pic_order_cnt_type,
        direct_8x8_inference_flag: current.direct_8x8_inference_flag,
        pic_width_in_mbs: current.pic_width_in_mbs,
        pic_height_in_mbs: current.pic_height_in_mbs,
        pic_init_qp: current.pic_init_qp,
        deblocking_filter_control_present_flag: current.deblocking_filter_control_present_flag,
        constrained_intra_pred_flag: current.constrained_intra_pred_flag,
        chroma_qp_index_offset: current.chroma_qp_index_offset,
        pic_order_present_flag: current.pic_order_present_flag,
        num_ref_idx_l0_active_minus1: current.num_ref_idx_l0_active_minus1,
        num_ref_idx_l1_active_minus1: current.num_ref_idx_l1_active_minus1,
    }
}

fn is_not_supported(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::ENOTTY) | Some(libc::EOPNOTSUPP)
    )
}

/// Runs `submit` with the device's current ABI, degrading to the legacy
/// layout exactly once on "operation not supported". The degradation is
/// sticky: later pictures go straight to the legacy path.
fn run_with_fallback(
    abi: &Mutex<IoctlAbi>,
    mut submit: impl FnMut(IoctlAbi) -> io::Result<()>,
) -> Result<()> {
    let current_abi = *abi.lock();
    match submit(current_abi) {
        Ok(()) => Ok(()),
        Err(err) if current_abi == IoctlAbi::Current && is_not_supported(&err) => {
            info!("kernel lacks the current decode ABI, retrying with the legacy layout");
            *abi.lock() = IoctlAbi::Legacy;
            submit(IoctlAbi::Legacy).map_err(|e| {
                error!("legacy decode ioctl failed: {}", e);
                VdpError::Io(e)
            })
        }
        Err(err) => {
            error!("decode ioctl failed: {}", err);
            Err(VdpError::Io(err))
        }
    }
}

impl VdeBackend {
    /// Opens the decode engine device node. An absent or unopenable node is
    /// a resource error, surfaced before any decode is attempted.
    pub fn open() -> Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .open(VDE_DEVICE)
            .map_err(|e| {
                error!("cannot open {}: {}", VDE_DEVICE, e);
                VdpError::Resources
            })?;
        Ok(VdeBackend {
            file,
            abi: Mutex::new(IoctlAbi::Current),
        })
    }
}

impl DecodeBackend for VdeBackend {
    fn decode(&self, params: &DecodeParams, dpb: &[DpbFrame]) -> Result<()> {
        let fd = self.file.as_raw_fd();
        run_with_fallback(&self.abi, |abi| match abi {
            IoctlAbi::Current => {
                let frames = pack_frames(dpb);
                let ctx = pack_ctx(params, frames.as_ptr() as u64, frames.len() as u32);
                // Safe because the request number matches the struct layout
                // and `frames` outlives the call.
                unsafe { ioctl::ioctl_with_ref(fd, decode_h264_nr(), &ctx) }
            }
            IoctlAbi::Legacy => {
                let frames = pack_frames_legacy(dpb);
                let ctx = pack_ctx_legacy(params, frames.as_ptr() as u64, frames.len() as u32);
                // Safe for the same reason as above.
                unsafe { ioctl::ioctl_with_ref(fd, decode_h264_legacy_nr(), &ctx) }
            }
        })
    }
}
