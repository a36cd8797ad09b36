// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Stateless V4L2 decode backend.
//!
//! Newer kernels expose the decode engine as a stateless V4L2 decoder
//! driven through the media request API: per-picture control blocks
//! (sequence, picture, decode parameters) are attached to a request object,
//! the bitstream buffer is queued against that request, the request is
//! submitted, and completion is a poll on the request fd followed by a
//! dequeue. Discovery scans the numbered video device nodes for a matching
//! driver name.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::os::unix::io::FromRawFd;
use std::os::unix::io::RawFd;

use log::debug;
use log::error;

use crate::error::Result;
use crate::error::VdpError;
use crate::h264::reflist::DpbFrame;
use crate::ioctl;
use crate::sync::Mutex;

use super::DecodeBackend;
use super::DecodeParams;

/// Driver name reported by the stateless decoder for this engine.
const DRIVER_NAME: &[u8] = b"tegra-vde";
const MAX_VIDEO_NODES: u32 = 64;
const MAX_MEDIA_NODES: u32 = 16;

// V4L2 / media-controller ABI subset.

#[repr(C)]
#[derive(Copy, Clone)]
struct V4l2Capability {
    driver: [u8; 16],
    card: [u8; 32],
    bus_info: [u8; 32],
    version: u32,
    capabilities: u32,
    device_caps: u32,
    reserved: [u32; 3],
}

#[repr(C)]
#[derive(Copy, Clone)]
struct MediaDeviceInfo {
    driver: [u8; 16],
    model: [u8; 32],
    serial: [u8; 40],
    bus_info: [u8; 32],
    media_version: u32,
    hw_revision: u32,
    driver_version: u32,
    reserved: [u32; 31],
}

// The kernel declares v4l2_ext_control packed: the payload union sits at
// byte offset 12 and the struct is 20 bytes.
#[repr(C, packed)]
#[derive(Copy, Clone, Default)]
struct V4l2ExtControl {
    id: u32,
    size: u32,
    reserved2: [u32; 1],
    value64: u64, // union; control payloads pass a pointer here
}

#[repr(C)]
struct V4l2ExtControls {
    which: u32,
    count: u32,
    error_idx: u32,
    request_fd: i32,
    reserved: [u32; 1],
    controls: *mut V4l2ExtControl,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
struct V4l2Buffer {
    index: u32,
    buf_type: u32,
    bytesused: u32,
    flags: u32,
    field: u32,
    timestamp: [u64; 2],
    timecode: [u32; 4],
    sequence: u32,
    memory: u32,
    m_fd: i32, // union m; dma-buf member
    m_pad: u32,
    length: u32,
    reserved2: u32,
    request_fd: i32,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
struct V4l2RequestBuffers {
    count: u32,
    buf_type: u32,
    memory: u32,
    capabilities: u32,
    flags: u8,
    reserved: [u8; 3],
}

const V4L2_BUF_TYPE_VIDEO_OUTPUT: u32 = 2;
const V4L2_MEMORY_DMABUF: u32 = 4;
const V4L2_CTRL_WHICH_REQUEST_VAL: u32 = 0x0f01_0000;
const V4L2_BUF_FLAG_REQUEST_FD: u32 = 0x0080_0000;

// Stateless H.264 control IDs.
const V4L2_CID_CODEC_STATELESS_BASE: u32 = 0x00a4_0900;
const V4L2_CID_STATELESS_H264_SPS: u32 = V4L2_CID_CODEC_STATELESS_BASE + 2;
const V4L2_CID_STATELESS_H264_PPS: u32 = V4L2_CID_CODEC_STATELESS_BASE + 3;
const V4L2_CID_STATELESS_H264_DECODE_PARAMS: u32 = V4L2_CID_CODEC_STATELESS_BASE + 7;

#[repr(C)]
#[derive(Copy, Clone)]
struct V4l2CtrlH264Sps {
    profile_idc: u8,
    constraint_set_flags: u8,
    level_idc: u8,
    seq_parameter_set_id: u8,
    chroma_format_idc: u8,
    bit_depth_luma_minus8: u8,
    bit_depth_chroma_minus8: u8,
    log2_max_frame_num_minus4: u8,
    pic_order_cnt_type: u8,
    log2_max_pic_order_cnt_lsb_minus4: u8,
    max_num_ref_frames: u8,
    num_ref_frames_in_pic_order_cnt_cycle: u8,
    offset_for_ref_frame: [i32; 255],
    offset_for_non_ref_pic: i32,
    offset_for_top_to_bottom_field: i32,
    pic_width_in_mbs_minus1: u16,
    pic_height_in_map_units_minus1: u16,
    flags: u32,
}

impl Default for V4l2CtrlH264Sps {
    fn default() -> Self {
        // Safe to zero: every field is plain data.
        unsafe { std::mem::zeroed() }
    }
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
struct V4l2CtrlH264Pps {
    pic_parameter_set_id: u8,
    seq_parameter_set_id: u8,
    num_slice_groups_minus1: u8,
    num_ref_idx_l0_default_active_minus1: u8,
    num_ref_idx_l1_default_active_minus1: u8,
    weighted_bipred_idc: u8,
    pic_init_qp_minus26: i8,
    pic_init_qs_minus26: i8,
    chroma_qp_index_offset: i8,
    second_chroma_qp_index_offset: i8,
    flags: u16,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
struct V4l2H264DpbEntry {
    reference_ts: u64,
    pic_num: u32,
    frame_num: u16,
    fields: u8,
    reserved: [u8; 5],
    top_field_order_cnt: i32,
    bottom_field_order_cnt: i32,
    flags: u32,
}

const V4L2_H264_DPB_ENTRY_FLAG_VALID: u32 = 0x1;
const V4L2_H264_DPB_ENTRY_FLAG_ACTIVE: u32 = 0x2;

#[repr(C)]
#[derive(Copy, Clone)]
struct V4l2CtrlH264DecodeParams {
    dpb: [V4l2H264DpbEntry; 16],
    nal_ref_idc: u16,
    frame_num: u16,
    top_field_order_cnt: i32,
    bottom_field_order_cnt: i32,
    idr_pic_id: u16,
    pic_order_cnt_lsb: u16,
    delta_pic_order_cnt_bottom: i32,
    delta_pic_order_cnt0: i32,
    delta_pic_order_cnt1: i32,
    dec_ref_pic_marking_bit_size: u32,
    pic_order_cnt_bit_size: u32,
    slice_group_change_cycle: u32,
    reserved: u32,
    flags: u32,
}

impl Default for V4l2CtrlH264DecodeParams {
    fn default() -> Self {
        // Safe to zero: every field is plain data.
        unsafe { std::mem::zeroed() }
    }
}

const VIDIOC_MAGIC: u32 = b'V' as u32;
fn vidioc_querycap() -> ioctl::IoctlNr {
    ioctl::ior::<V4l2Capability>(VIDIOC_MAGIC, 0)
}
fn vidioc_reqbufs() -> ioctl::IoctlNr {
    ioctl::iowr::<V4l2RequestBuffers>(VIDIOC_MAGIC, 8)
}
fn vidioc_qbuf() -> ioctl::IoctlNr {
    ioctl::iowr::<V4l2Buffer>(VIDIOC_MAGIC, 15)
}
fn vidioc_dqbuf() -> ioctl::IoctlNr {
    ioctl::iowr::<V4l2Buffer>(VIDIOC_MAGIC, 17)
}
fn vidioc_s_ext_ctrls() -> ioctl::IoctlNr {
    ioctl::iowr::<V4l2ExtControls>(VIDIOC_MAGIC, 72)
}

const MEDIA_MAGIC: u32 = b'|' as u32;
fn media_ioc_device_info() -> ioctl::IoctlNr {
    ioctl::iowr::<MediaDeviceInfo>(MEDIA_MAGIC, 0)
}
fn media_ioc_request_alloc() -> ioctl::IoctlNr {
    ioctl::ior::<i32>(MEDIA_MAGIC, 5)
}
fn media_request_ioc_queue() -> ioctl::IoctlNr {
    ioctl::io(MEDIA_MAGIC, 0x80)
}

fn name_matches(reported: &[u8]) -> bool {
    reported.len() >= DRIVER_NAME.len()
        && &reported[..DRIVER_NAME.len()] == DRIVER_NAME
        && reported.get(DRIVER_NAME.len()).copied().unwrap_or(0) == 0
}

fn open_node(path: &str) -> Option<File> {
    File::options().read(true).write(true).open(path).ok()
}

pub struct V4l2Backend {
    video: File,
    media: File,
    /// Serializes submissions; one request is in flight at a time.
    in_flight: Mutex<()>,
}

impl V4l2Backend {
    /// Scans the numbered video device nodes for the stateless decoder, and
    /// its media controller node for request allocation. `Ok(None)` means no
    /// matching node exists and the caller should fall back to the decode
    /// ioctl.
    pub fn find() -> Result<Option<V4l2Backend>> {
        let Some(video) = Self::find_video_node() else {
            return Ok(None);
        };
        let Some(media) = Self::find_media_node() else {
            debug!("stateless decoder found but no matching media node");
            return Ok(None);
        };
        let backend = V4l2Backend {
            video,
            media,
            in_flight: Mutex::new(()),
        };
        backend.setup_output_queue()?;
        Ok(Some(backend))
    }

    fn find_video_node() -> Option<File> {
        for n in 0..MAX_VIDEO_NODES {
            let Some(file) = open_node(&format!("/dev/video{}", n)) else {
                continue;
            };
            let mut cap: V4l2Capability = unsafe { std::mem::zeroed() };
            let ok = unsafe {
                ioctl::ioctl_with_mut_ref(file.as_raw_fd(), vidioc_querycap(), &mut cap).is_ok()
            };
            if ok && name_matches(&cap.driver) {
                debug!("stateless decoder at /dev/video{}", n);
                return Some(file);
            }
        }
        None
    }

    fn find_media_node() -> Option<File> {
        for n in 0..MAX_MEDIA_NODES {
            let Some(file) = open_node(&format!("/dev/media{}", n)) else {
                continue;
            };
            let mut info: MediaDeviceInfo = unsafe { std::mem::zeroed() };
            let ok = unsafe {
                ioctl::ioctl_with_mut_ref(file.as_raw_fd(), media_ioc_device_info(), &mut info)
                    .is_ok()
            };
            if ok && name_matches(&info.driver) {
                return Some(file);
            }
        }
        None
    }

    fn setup_output_queue(&self) -> Result<()> {
        let mut reqbufs = V4l2RequestBuffers {
            count: 1,
            buf_type: V4L2_BUF_TYPE_VIDEO_OUTPUT,
            memory: V4L2_MEMORY_DMABUF,
            ..Default::default()
        };
        unsafe {
            ioctl::ioctl_with_mut_ref(self.video.as_raw_fd(), vidioc_reqbufs(), &mut reqbufs)
        }
        .map_err(VdpError::Io)
    }

    fn alloc_request(&self) -> Result<File> {
        let mut fd: i32 = -1;
        unsafe {
            ioctl::ioctl_with_mut_ref(self.media.as_raw_fd(), media_ioc_request_alloc(), &mut fd)
        }
        .map_err(VdpError::Io)?;
        if fd < 0 {
            return Err(VdpError::Resources);
        }
        // Safe because the kernel just handed us sole ownership of this fd.
        Ok(unsafe { File::from_raw_fd(fd) })
    }

    fn set_controls(&self, request_fd: RawFd, params: &DecodeParams, dpb: &[DpbFrame]) -> Result<()> {
        let mut sps = V4l2CtrlH264Sps {
            profile_idc: if params.baseline_profile { 66 } else { 100 },
            level_idc: params.level_idc,
            log2_max_frame_num_minus4: params.log2_max_frame_num.saturating_sub(4),
            pic_order_cnt_type: params.pic_order_cnt_type,
            log2_max_pic_order_cnt_lsb_minus4: params.log2_max_pic_order_cnt_lsb.saturating_sub(4),
            max_num_ref_frames: (dpb.len().saturating_sub(1)) as u8,
            pic_width_in_mbs_minus1: (params.pic_width_in_mbs.saturating_sub(1)) as u16,
            pic_height_in_map_units_minus1: (params.pic_height_in_mbs.saturating_sub(1)) as u16,
            ..Default::default()
        };
        let mut pps = V4l2CtrlH264Pps {
            pic_init_qp_minus26: (params.pic_init_qp as i32 - 26) as i8,
            chroma_qp_index_offset: params.chroma_qp_index_offset,
            num_ref_idx_l0_default_active_minus1: params.num_ref_idx_l0_active_minus1,
            num_ref_idx_l1_default_active_minus1: params.num_ref_idx_l1_active_minus1,
            ..Default::default()
        };
        let mut decode_params = V4l2CtrlH264DecodeParams::default();
        let current = &dpb[0];
        decode_params.frame_num = current.frame_num as u16;
        decode_params.top_field_order_cnt = current.poc;
        decode_params.bottom_field_order_cnt = current.poc;
        for (entry, frame) in decode_params.dpb.iter_mut().zip(dpb.iter().skip(1)) {
            entry.frame_num = frame.frame_num as u16;
            entry.pic_num = frame.frame_num as u32;
            entry.top_field_order_cnt = frame.poc;
            entry.bottom_field_order_cnt = frame.poc;
            entry.flags = V4L2_H264_DPB_ENTRY_FLAG_VALID | V4L2_H264_DPB_ENTRY_FLAG_ACTIVE;
        }

        let mut controls = [
            V4l2ExtControl {
                id: V4L2_CID_STATELESS_H264_SPS,
                size: std::mem::size_of::<V4l2CtrlH264Sps>() as u32,
                value64: &mut sps as *mut _ as u64,
                ..Default::default()
            },
            V4l2ExtControl {
                id: V4L2_CID_STATELESS_H264_PPS,
                size: std::mem::size_of::<V4l2CtrlH264Pps>() as u32,
                value64: &mut pps as *mut _ as u64,
                ..Default::default()
            },
            V4l2ExtControl {
                id: V4L2_CID_STATELESS_H264_DECODE_PARAMS,
                size: std::mem::size_of::<V4l2CtrlH264DecodeParams>() as u32,
                value64: &mut decode_params as *mut _ as u64,
                ..Default::default()
            },
        ];
        let mut ext = V4l2ExtControls {
            which: V4L2_CTRL_WHICH_REQUEST_VAL,
            count: controls.len() as u32,
            error_idx: 0,
            request_fd,
            reserved: [0],
            controls: controls.as_mut_ptr(),
        };
        unsafe { ioctl::ioctl_with_mut_ref(self.video.as_raw_fd(), vidioc_s_ext_ctrls(), &mut ext) }
            .map_err(VdpError::Io)
    }

    fn queue_bitstream(&self, request_fd: RawFd, params: &DecodeParams) -> Result<()> {
        let mut buffer = V4l2Buffer {
            index: 0,
            buf_type: V4L2_BUF_TYPE_VIDEO_OUTPUT,
            memory: V4L2_MEMORY_DMABUF,
            m_fd: params.bitstream_fd,
            bytesused: 0,
            flags: V4L2_BUF_FLAG_REQUEST_FD,
            request_fd,
            ..Default::default()
        };
        unsafe { ioctl::ioctl_with_mut_ref(self.video.as_raw_fd(), vidioc_qbuf(), &mut buffer) }
            .map_err(VdpError::Io)
    }

    fn submit_and_wait(&self, request: &File) -> Result<()> {
        let ret = unsafe { libc::ioctl(request.as_raw_fd(), media_request_ioc_queue() as _) };
        if ret < 0 {
            return Err(VdpError::Io(io::Error::last_os_error()));
        }
        let mut pollfd = libc::pollfd {
            fd: request.as_raw_fd(),
            events: libc::POLLPRI,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut pollfd, 1, 2000) };
        if ret <= 0 {
            error!("decode request did not complete");
            return Err(VdpError::Io(io::Error::last_os_error()));
        }
        let mut buffer = V4l2Buffer {
            buf_type: V4L2_BUF_TYPE_VIDEO_OUTPUT,
            memory: V4L2_MEMORY_DMABUF,
            ..Default::default()
        };
        unsafe { ioctl::ioctl_with_mut_ref(self.video.as_raw_fd(), vidioc_dqbuf(), &mut buffer) }
            .map_err(VdpError::Io)
    }
}

impl DecodeBackend for V4l2Backend {
    fn decode(&self, params: &DecodeParams, dpb: &[DpbFrame]) -> Result<()> {
        let _guard = self.in_flight.lock();
        let request = self.alloc_request()?;
        self.set_controls(request.as_raw_fd(), params, dpb)?;
        self.queue_bitstream(request.as_raw_fd(), params)?;
        self.submit_and_wait(&request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_name_matching() {
        let mut exact = [0u8; 16];
        exact[..9].copy_from_slice(b"tegra-vde");
        assert!(name_matches(&exact));

        let mut prefixed = [0u8; 16];
        prefixed[..11].copy_from_slice(b"tegra-vdeXY");
        assert!(!name_matches(&prefixed));

        assert!(!name_matches(b"other-driver\0\0\0\0"));
    }

    #[test]
    fn request_api_abi_matches_kernel_headers() {
        // v4l2_ext_control is packed; a natural layout would put the payload
        // at offset 16 and desynchronize every S_EXT_CTRLS call.
        assert_eq!(std::mem::size_of::<V4l2ExtControl>(), 20);
        assert_eq!(std::mem::offset_of!(V4l2ExtControl, value64), 12);
        // Stateless H.264 control IDs from v4l2-controls.h.
        assert_eq!(V4L2_CID_STATELESS_H264_SPS, 0x00a4_0902);
        assert_eq!(V4L2_CID_STATELESS_H264_PPS, 0x00a4_0903);
        assert_eq!(V4L2_CID_STATELESS_H264_DECODE_PARAMS, 0x00a4_0907);
        // MEDIA_REQUEST_IOC_QUEUE is _IO('|', 0x80).
        assert_eq!(media_request_ioc_queue(), 0x7c80);
    }

    #[test]
    fn dpb_control_block_is_abi_sized() {
        // 16 entries of 32 bytes plus the trailer; a layout drift here would
        // desynchronize us from the kernel.
        assert_eq!(std::mem::size_of::<V4l2H264DpbEntry>(), 32);
        assert_eq!(
            std::mem::size_of::<V4l2CtrlH264DecodeParams>(),
            16 * 32 + 48
        );
    }
}
