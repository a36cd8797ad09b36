// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! H.264 decode: slice classification, reference list construction, and the
//! decode entry point feeding the hardware engine.

pub mod decoder;
pub mod nalu_reader;
pub mod reflist;

/// Slice classification read from the slice header. SP/SI fold into their
/// P/I counterparts for DPB flagging purposes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SliceType {
    P,
    B,
    I,
    Sp,
    Si,
}

impl SliceType {
    /// Maps a `slice_type` syntax element to its classification. Values of
    /// 5..=9 alias 0..=4 per the standard; anything >= 10 is out of range
    /// and handled by the caller as a bitstream warning.
    pub fn from_slice_type_field(value: u32) -> SliceType {
        match value % 5 {
            0 => SliceType::P,
            1 => SliceType::B,
            2 => SliceType::I,
            3 => SliceType::Sp,
            _ => SliceType::Si,
        }
    }

    pub fn is_b(&self) -> bool {
        matches!(self, SliceType::B)
    }
}
