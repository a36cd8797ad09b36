// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reference list construction for the hardware decoder.
//!
//! The decode engine consumes a contiguous DPB array with the
//! currently-decoding picture at index 0 and the resolved references after
//! it. Two orderings exist, selected by `pic_order_cnt_type`: POC-sorted
//! (type 0) and plain submission order (everything else).
//!
//! Degenerate inputs (duplicate POCs, a POC equal to the sort delimiter,
//! non-positive POCs among queued references) are logged and tolerated: the
//! hardware/bitstream combination is unverified there, and this driver
//! prefers best-effort playback over conformance rejection.

use std::os::unix::io::RawFd;

use log::debug;
use log::warn;

/// Maximum number of reference frames the hardware accepts.
pub const MAX_REFERENCES: usize = 16;

/// The hardware's frame number field is 23 bits wide.
pub const FRAME_NUM_MASK: i64 = 0x7f_ffff;

/// Plane descriptors of one frame as the decode engine sees them.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FramePlanes {
    pub y_fd: RawFd,
    pub cb_fd: RawFd,
    pub cr_fd: RawFd,
    pub aux_fd: RawFd,
    pub y_offset: u32,
    pub cb_offset: u32,
    pub cr_offset: u32,
    pub aux_offset: u32,
}

/// One DPB entry.
#[derive(Clone, Debug)]
pub struct DpbFrame {
    pub planes: FramePlanes,
    pub frame_num: i32,
    pub poc: i32,
    pub is_reference: bool,
    pub is_b_frame: bool,
}

/// A reference frame descriptor as supplied by the application. A slot with
/// `planes == None` carries an invalid handle and contributes nothing.
#[derive(Clone, Debug, Default)]
pub struct ReferenceFrame {
    pub planes: Option<FramePlanes>,
    pub frame_idx: u32,
    pub field_order_cnt: [i32; 2],
    pub is_long_term: bool,
    pub top_is_reference: bool,
    pub bottom_is_reference: bool,
}

/// The assembled DPB array: current picture at index 0, references after.
pub struct DpbList {
    pub frames: Vec<DpbFrame>,
    /// POC mode only: number of references whose POC precedes the delimiter.
    pub refs_earlier: usize,
}

impl DpbList {
    pub fn ref_count(&self) -> usize {
        self.frames.len() - 1
    }
}

/// Applies the frame-number wraparound correction. When the current
/// picture's `frame_num` is 0 every reference's stored frame number becomes
/// `(frame_idx - max_frame_num) & 0x7fffff`.
fn ref_frame_num(reference: &ReferenceFrame, wrap: bool, max_frame_num: i32) -> i32 {
    if wrap {
        ((reference.frame_idx as i64 - max_frame_num as i64) & FRAME_NUM_MASK) as i32
    } else {
        reference.frame_idx as i32
    }
}

fn ref_entry(reference: &ReferenceFrame, wrap: bool, max_frame_num: i32) -> Option<DpbFrame> {
    let planes = reference.planes?;
    Some(DpbFrame {
        planes,
        frame_num: ref_frame_num(reference, wrap, max_frame_num),
        poc: reference.field_order_cnt[0],
        is_reference: true,
        is_b_frame: false,
    })
}

/// Builds the DPB in submission order: each valid reference contributes one
/// entry, input slot order preserved.
pub fn get_refs_dpb_order(
    current: DpbFrame,
    references: &[ReferenceFrame],
    frame_num_wrap: bool,
    max_frame_num: i32,
) -> DpbList {
    let mut frames = Vec::with_capacity(references.len() + 1);
    frames.push(current);
    for reference in references {
        if let Some(entry) = ref_entry(reference, frame_num_wrap, max_frame_num) {
            frames.push(entry);
        }
    }
    if frames.len() == 1 {
        debug!("picture has no valid references");
    }
    DpbList {
        frames,
        refs_earlier: 0,
    }
}

/// Builds the POC-sorted DPB used with `pic_order_cnt_type == 0`.
///
/// References are insertion-sorted around a delimiter: the current picture's
/// POC for B-slices, `i32::MAX` otherwise. Entries below the delimiter come
/// first in ascending POC order, entries at/above it follow in ascending
/// order. The tie-break rules mirror the submission hardware's expectations
/// exactly; do not normalize them.
pub fn get_refs_sorted(
    current: DpbFrame,
    references: &[ReferenceFrame],
    is_b_slice: bool,
    frame_num_wrap: bool,
    max_frame_num: i32,
) -> DpbList {
    let delimiter = if is_b_slice { current.poc } else { i32::MAX };
    let mut sorted: Vec<DpbFrame> = Vec::with_capacity(references.len());

    for reference in references {
        let Some(entry) = ref_entry(reference, frame_num_wrap, max_frame_num) else {
            continue;
        };
        let poc = entry.poc;
        if poc == delimiter {
            warn!("reference POC {} equals the sort delimiter", poc);
        }
        let mut index = 0;
        while index < sorted.len() {
            let node_poc = sorted[index].poc;
            if node_poc == poc {
                warn!("duplicate reference POC {}", poc);
            }
            if node_poc <= 0 {
                warn!("non-positive reference POC {} in sorted list", node_poc);
            }
            if poc < delimiter {
                // Below-delimiter candidates go after lower below-delimiter
                // nodes and before anything at or past the delimiter.
                if node_poc >= delimiter || node_poc >= poc {
                    break;
                }
            } else {
                // At/above-delimiter candidates go before the first strictly
                // greater node.
                if node_poc > poc {
                    break;
                }
            }
            index += 1;
        }
        sorted.insert(index, entry);
    }

    if sorted.is_empty() {
        debug!("picture has no valid references");
    }
    let refs_earlier = sorted.iter().filter(|f| f.poc < delimiter).count();
    let mut frames = Vec::with_capacity(sorted.len() + 1);
    frames.push(current);
    frames.extend(sorted);
    DpbList {
        frames,
        refs_earlier,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planes(fd: RawFd) -> FramePlanes {
        FramePlanes {
            y_fd: fd,
            cb_fd: fd,
            cr_fd: fd,
            aux_fd: -1,
            ..Default::default()
        }
    }

    fn reference(fd: RawFd, frame_idx: u32, poc: i32) -> ReferenceFrame {
        ReferenceFrame {
            planes: Some(planes(fd)),
            frame_idx,
            field_order_cnt: [poc, poc],
            top_is_reference: true,
            bottom_is_reference: true,
            ..Default::default()
        }
    }

    fn current(poc: i32) -> DpbFrame {
        DpbFrame {
            planes: planes(1),
            frame_num: 3,
            poc,
            is_reference: true,
            is_b_frame: false,
        }
    }

    #[test]
    fn dpb_order_preserves_slots_and_skips_invalid() {
        let refs = vec![
            reference(10, 7, 30),
            ReferenceFrame::default(),
            reference(11, 5, 10),
            reference(12, 6, 20),
        ];
        let list = get_refs_dpb_order(current(40), &refs, false, 16);
        assert_eq!(list.ref_count(), 3);
        assert_eq!(list.frames[0].planes.y_fd, 1);
        let fds: Vec<RawFd> = list.frames[1..].iter().map(|f| f.planes.y_fd).collect();
        assert_eq!(fds, vec![10, 11, 12]);
        assert_eq!(list.refs_earlier, 0);
    }

    #[test]
    fn sorted_b_slice_partitions_around_current_poc() {
        let refs = vec![
            reference(10, 1, 60),
            reference(11, 2, 20),
            reference(12, 3, 40),
            reference(13, 4, 80),
            reference(14, 5, 10),
        ];
        // Current POC 50: {10, 20, 40} are earlier, {60, 80} later.
        let list = get_refs_sorted(current(50), &refs, true, false, 16);
        let pocs: Vec<i32> = list.frames[1..].iter().map(|f| f.poc).collect();
        assert_eq!(pocs, vec![10, 20, 40, 60, 80]);
        assert_eq!(list.refs_earlier, 3);
    }

    #[test]
    fn sorted_non_b_slice_is_fully_ascending() {
        let refs = vec![
            reference(10, 1, 30),
            reference(11, 2, 10),
            reference(12, 3, 20),
        ];
        let list = get_refs_sorted(current(40), &refs, false, false, 16);
        let pocs: Vec<i32> = list.frames[1..].iter().map(|f| f.poc).collect();
        assert_eq!(pocs, vec![10, 20, 30]);
        // Delimiter is i32::MAX, so everything counts as earlier.
        assert_eq!(list.refs_earlier, 3);
    }

    #[test]
    fn duplicate_pocs_are_kept() {
        let refs = vec![
            reference(10, 1, 20),
            reference(11, 2, 20),
            reference(12, 3, 10),
        ];
        let list = get_refs_sorted(current(50), &refs, true, false, 16);
        assert_eq!(list.ref_count(), 3);
        let pocs: Vec<i32> = list.frames[1..].iter().map(|f| f.poc).collect();
        assert_eq!(pocs, vec![10, 20, 20]);
        assert_eq!(list.refs_earlier, 3);
    }

    #[test]
    fn frame_num_wraparound_correction() {
        let max_frame_num = 1 << 4;
        let refs = vec![reference(10, 3, 10)];
        let list = get_refs_dpb_order(current(40), &refs, true, max_frame_num);
        assert_eq!(
            list.frames[1].frame_num,
            ((3i64 - max_frame_num as i64) & FRAME_NUM_MASK) as i32
        );

        let unwrapped = get_refs_dpb_order(current(40), &refs, false, max_frame_num);
        assert_eq!(unwrapped.frames[1].frame_num, 3);
    }

    #[test]
    fn empty_reference_list_is_allowed() {
        let list = get_refs_sorted(current(0), &[], false, false, 16);
        assert_eq!(list.ref_count(), 0);
        assert_eq!(list.refs_earlier, 0);
    }
}
