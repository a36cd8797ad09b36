// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decode engine backends.
//!
//! The marshaled picture state can reach the hardware through two kernel
//! interfaces: the device-specific decode ioctl (`vde`) or, on newer
//! kernels, the stateless V4L2 request API (`v4l2`). Detection prefers V4L2
//! when a matching device node exists; the debug configuration forces the
//! ioctl path. `dummy` records decode calls for tests.

pub mod dummy;
pub mod v4l2;
pub mod vde;

use std::os::unix::io::RawFd;
use std::sync::Arc;

use log::info;

use crate::config::Config;
use crate::error::Result;
use crate::h264::reflist::DpbFrame;

/// Per-picture decode state, marshaled by the backend into its kernel ABI.
///
/// This is the backend-neutral intermediate representation; the two vde
/// struct layouts and the V4L2 control blocks are all serialized from it.
#[derive(Clone, Debug)]
pub struct DecodeParams {
    pub bitstream_fd: RawFd,
    pub bitstream_offset: u32,
    /// POC mode only: references preceding the sort delimiter.
    pub refs_earlier: u32,
    pub baseline_profile: bool,
    pub level_idc: u8,
    pub log2_max_pic_order_cnt_lsb: u8,
    pub log2_max_frame_num: u8,
    pub pic_order_cnt_type: u8,
    pub direct_8x8_inference: bool,
    pub pic_width_in_mbs: u32,
    pub pic_height_in_mbs: u32,
    pub pic_init_qp: u32,
    pub deblocking_filter_control_present: bool,
    pub constrained_intra_pred: bool,
    pub chroma_qp_index_offset: i8,
    pub pic_order_present: bool,
    pub num_ref_idx_l0_active_minus1: u8,
    pub num_ref_idx_l1_active_minus1: u8,
}

/// A decode engine.
pub trait DecodeBackend: Send + Sync {
    /// Submits one picture. `dpb[0]` is the currently-decoding frame.
    fn decode(&self, params: &DecodeParams, dpb: &[DpbFrame]) -> Result<()>;
}

/// Picks the decode backend for a device: the stateless V4L2 decoder when
/// one is present and not overridden, the decode ioctl otherwise.
pub fn detect(config: &Config) -> Result<Arc<dyn DecodeBackend>> {
    if !config.force_vde_backend {
        if let Some(backend) = v4l2::V4l2Backend::find()? {
            info!("using stateless V4L2 decode backend");
            return Ok(Arc::new(backend));
        }
    }
    Ok(Arc::new(vde::VdeBackend::open()?))
}
