// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The H.264 decoder object: per-picture validation, bitstream assembly,
//! reference list construction, and submission to the decode backend.
//!
//! The hardware is a baseline-class frame decoder. CAVLC only, no weighted
//! prediction, no interlaced content; pictures requesting those are rejected
//! up front with `Unsupported` before any memory or engine work happens.

use std::sync::Arc;

use log::warn;

use crate::backend::DecodeBackend;
use crate::backend::DecodeParams;
use crate::config::Config;
use crate::error::Result;
use crate::error::VdpError;
use crate::h264::nalu_reader::NaluReader;
use crate::h264::reflist;
use crate::h264::reflist::DpbFrame;
use crate::h264::reflist::FramePlanes;
use crate::h264::reflist::MAX_REFERENCES;
use crate::h264::SliceType;
use crate::mem::BitstreamPool;
use crate::mem::BufferAllocator;
use crate::surface::Surface;
use crate::surface::SurfaceKind;

/// Version tag expected in every [`BitstreamBuffer`].
pub const BITSTREAM_BUFFER_VERSION: u32 = 1;

/// Largest coded dimension the engine accepts.
pub const MAX_CODED_DIM: u32 = 2032;

/// The level the hardware is always programmed for, regardless of what the
/// stream announces.
const HARDWARE_LEVEL_IDC: u8 = 51;

/// One application-supplied chunk of slice data. Chunks are concatenated in
/// submission order into a single hardware bitstream buffer.
pub struct BitstreamBuffer<'a> {
    pub struct_version: u32,
    pub data: &'a [u8],
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Profile {
    H264Baseline,
    H264ConstrainedBaseline,
    H264Main,
    H264High,
}

impl Profile {
    pub fn is_baseline(&self) -> bool {
        matches!(self, Profile::H264Baseline | Profile::H264ConstrainedBaseline)
    }

    /// Whether this hardware generation can decode the profile at all.
    pub fn is_supported(&self) -> bool {
        !matches!(self, Profile::H264High)
    }
}

/// One reference frame slot as supplied with the picture info. A slot with
/// no surface is an empty DPB slot.
#[derive(Clone, Default)]
pub struct ReferenceFrameH264 {
    pub surface: Option<Arc<Surface>>,
    pub frame_idx: u32,
    pub field_order_cnt: [i32; 2],
    pub is_long_term: bool,
    pub top_is_reference: bool,
    pub bottom_is_reference: bool,
}

/// Per-picture decode parameters, mirroring the relevant SPS/PPS and slice
/// state the application parsed out of band.
#[derive(Clone, Default)]
pub struct PictureInfoH264 {
    pub references: Vec<ReferenceFrameH264>,
    pub field_order_cnt: [i32; 2],
    pub is_reference: bool,
    pub frame_num: u16,
    pub num_ref_frames: u8,
    pub frame_mbs_only_flag: bool,
    pub constrained_intra_pred_flag: bool,
    pub weighted_pred_flag: bool,
    pub weighted_bipred_idc: u8,
    pub entropy_coding_mode_flag: bool,
    pub pic_init_qp_minus26: i8,
    pub chroma_qp_index_offset: i8,
    pub num_ref_idx_l0_active_minus1: u8,
    pub num_ref_idx_l1_active_minus1: u8,
    pub log2_max_frame_num_minus4: u8,
    pub pic_order_cnt_type: u8,
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub direct_8x8_inference_flag: bool,
    pub pic_order_present_flag: bool,
    pub deblocking_filter_control_present_flag: bool,
    pub redundant_pic_cnt_present_flag: bool,
}

pub struct Decoder {
    profile: Profile,
    width: u32,
    height: u32,
    max_references: u32,
    backend: Arc<dyn DecodeBackend>,
    pool: BitstreamPool,
}

impl Decoder {
    pub fn new(
        allocator: Arc<dyn BufferAllocator>,
        backend: Arc<dyn DecodeBackend>,
        _config: &Config,
        profile: Profile,
        width: u32,
        height: u32,
        max_references: u32,
    ) -> Result<Decoder> {
        if !profile.is_supported() {
            return Err(VdpError::Unsupported("H.264 high profile"));
        }
        if width == 0 || height == 0 || width > MAX_CODED_DIM || height > MAX_CODED_DIM {
            return Err(VdpError::InvalidSize);
        }
        if max_references as usize > MAX_REFERENCES {
            return Err(VdpError::InvalidParameter("max_references"));
        }
        Ok(Decoder {
            profile,
            width,
            height,
            max_references,
            backend,
            pool: BitstreamPool::new(allocator),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn profile(&self) -> Profile {
        self.profile
    }

    /// Decodes one picture into `target`.
    pub fn decode(
        &self,
        target: &Arc<Surface>,
        info: &PictureInfoH264,
        buffers: &[BitstreamBuffer],
    ) -> Result<()> {
        if target.kind() != SurfaceKind::Video {
            return Err(VdpError::InvalidParameter("decode target kind"));
        }
        if target.width() < self.width || target.height() < self.height {
            return Err(VdpError::InvalidSize);
        }
        reject_unsupported(info)?;

        let data = assemble_bitstream(buffers)?;
        let slice_type = classify_slice(&data)?;
        let reference_planes = self.snapshot_reference_planes(target, info)?;

        // The surface lock is held across marshalling and submission; the
        // engine writes into this pixel buffer.
        let target_state = target.lock_state();
        let current = DpbFrame {
            planes: planes_of(&target_state.pixbuf)?,
            frame_num: info.frame_num as i32,
            poc: info.field_order_cnt[0],
            is_reference: info.is_reference,
            is_b_frame: slice_type.is_b(),
        };

        let references: Vec<reflist::ReferenceFrame> = info
            .references
            .iter()
            .zip(&reference_planes)
            .map(|(slot, planes)| reflist::ReferenceFrame {
                planes: match planes {
                    RefPlanes::Current => Some(current.planes),
                    RefPlanes::Resolved(planes) => Some(*planes),
                    RefPlanes::Empty => None,
                },
                frame_idx: slot.frame_idx,
                field_order_cnt: slot.field_order_cnt,
                is_long_term: slot.is_long_term,
                top_is_reference: slot.top_is_reference,
                bottom_is_reference: slot.bottom_is_reference,
            })
            .collect();
        let frame_num_wrap = info.frame_num == 0;
        let max_frame_num = 1i32 << (info.log2_max_frame_num_minus4 + 4);
        let list = if info.pic_order_cnt_type == 0 {
            reflist::get_refs_sorted(
                current,
                &references,
                slice_type.is_b(),
                frame_num_wrap,
                max_frame_num,
            )
        } else {
            reflist::get_refs_dpb_order(current, &references, frame_num_wrap, max_frame_num)
        };

        let bo = self.pool.acquire(data.len() as u32)?;
        bo.write(0, &data)?;
        // The engine reads whole words past the slice end; the tail of the
        // allocation must be deterministic.
        let tail = bo.size() - data.len() as u32;
        if tail > 0 {
            bo.write(data.len() as u32, &vec![0u8; tail as usize])?;
        }

        let params = DecodeParams {
            bitstream_fd: bo.export_fd()?,
            bitstream_offset: 0,
            refs_earlier: list.refs_earlier as u32,
            baseline_profile: self.profile.is_baseline(),
            level_idc: HARDWARE_LEVEL_IDC,
            log2_max_pic_order_cnt_lsb: info.log2_max_pic_order_cnt_lsb_minus4 + 4,
            log2_max_frame_num: info.log2_max_frame_num_minus4 + 4,
            pic_order_cnt_type: info.pic_order_cnt_type,
            direct_8x8_inference: info.direct_8x8_inference_flag,
            pic_width_in_mbs: self.width.div_ceil(16),
            pic_height_in_mbs: self.height.div_ceil(16),
            pic_init_qp: (info.pic_init_qp_minus26 as i32 + 26) as u32,
            deblocking_filter_control_present: info.deblocking_filter_control_present_flag,
            constrained_intra_pred: info.constrained_intra_pred_flag,
            chroma_qp_index_offset: info.chroma_qp_index_offset,
            pic_order_present: info.pic_order_present_flag,
            num_ref_idx_l0_active_minus1: info.num_ref_idx_l0_active_minus1,
            num_ref_idx_l1_active_minus1: info.num_ref_idx_l1_active_minus1,
        };
        self.backend.decode(&params, &list.frames)?;
        target_state.pixbuf.check_guard();
        Ok(())
    }

    /// Reads each reference slot's plane descriptors up front. Reference
    /// surface locks are taken one at a time, and never while the decode
    /// target's lock is held, so two concurrent decodes with crossed target
    /// and reference surfaces cannot deadlock. A slot naming the target
    /// itself is resolved from the target's planes later, under its lock.
    fn snapshot_reference_planes(
        &self,
        target: &Arc<Surface>,
        info: &PictureInfoH264,
    ) -> Result<Vec<RefPlanes>> {
        let limit = (self.max_references as usize).min(MAX_REFERENCES);
        let mut out = Vec::with_capacity(info.references.len().min(limit));
        for slot in info.references.iter().take(limit) {
            out.push(match &slot.surface {
                Some(surface) if Arc::ptr_eq(surface, target) => RefPlanes::Current,
                Some(surface) => RefPlanes::Resolved(planes_of(&surface.lock_state().pixbuf)?),
                None => RefPlanes::Empty,
            });
        }
        Ok(out)
    }
}

/// Where a reference slot's plane descriptors come from.
enum RefPlanes {
    /// The slot references the picture being decoded.
    Current,
    Resolved(FramePlanes),
    Empty,
}

fn reject_unsupported(info: &PictureInfoH264) -> Result<()> {
    if info.entropy_coding_mode_flag {
        return Err(VdpError::Unsupported("CABAC entropy coding"));
    }
    if info.weighted_pred_flag {
        return Err(VdpError::Unsupported("weighted prediction"));
    }
    if info.weighted_bipred_idc == 1 {
        return Err(VdpError::Unsupported("explicit weighted bi-prediction"));
    }
    if !info.frame_mbs_only_flag {
        return Err(VdpError::Unsupported("interlaced coding"));
    }
    Ok(())
}

fn planes_of(pixbuf: &crate::pixbuf::PixelBuffer) -> Result<FramePlanes> {
    Ok(FramePlanes {
        y_fd: pixbuf.plane(0).bo.export_fd()?,
        cb_fd: pixbuf.plane(1).bo.export_fd()?,
        cr_fd: pixbuf.plane(2).bo.export_fd()?,
        aux_fd: -1,
        y_offset: pixbuf.plane(0).offset,
        cb_offset: pixbuf.plane(1).offset,
        cr_offset: pixbuf.plane(2).offset,
        aux_offset: 0,
    })
}

fn assemble_bitstream(buffers: &[BitstreamBuffer]) -> Result<Vec<u8>> {
    let mut total = 0usize;
    for buffer in buffers {
        if buffer.struct_version != BITSTREAM_BUFFER_VERSION {
            return Err(VdpError::BadStructVersion(buffer.struct_version));
        }
        total += buffer.data.len();
    }
    if total == 0 {
        return Err(VdpError::InvalidParameter("empty bitstream"));
    }
    let mut data = Vec::with_capacity(total);
    for buffer in buffers {
        data.extend_from_slice(buffer.data);
    }
    Ok(data)
}

/// Locates the start code and reads the slice type out of the slice header.
///
/// Streams that open with something other than a start code are logged and
/// decoded anyway with an assumed 4-byte code; some demuxers hand us slices
/// with the code already stripped and the hardware copes.
fn classify_slice(data: &[u8]) -> Result<SliceType> {
    let start_len = if data.starts_with(&[0, 0, 1]) {
        3
    } else if data.starts_with(&[0, 0, 0, 1]) {
        4
    } else {
        warn!("bitstream does not begin with a start code");
        4
    };
    // NAL header byte, then the slice header bits.
    if data.len() < start_len + 2 {
        return Err(VdpError::InvalidParameter("truncated slice"));
    }
    let mut reader = NaluReader::new(&data[start_len + 1..]);
    let slice_type_field = (|| -> anyhow::Result<u32> {
        let _first_mb_in_slice = reader.read_ue()?;
        reader.read_ue()
    })()
    .map_err(|_| VdpError::InvalidParameter("unparseable slice header"))?;
    if slice_type_field >= 10 {
        warn!("slice_type {} out of range", slice_type_field);
    }
    Ok(SliceType::from_slice_type_field(slice_type_field))
}
