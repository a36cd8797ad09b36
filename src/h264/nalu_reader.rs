// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A small big-endian bit reader for slice header fields.
//!
//! The decoder only consumes the first two Exp-Golomb fields of each slice
//! header (to classify the picture); it does not conformance-parse. Those
//! fields end well before the earliest position an emulation-prevention byte
//! can occur, so no epb stripping is needed here.

use std::io::Cursor;

use anyhow::anyhow;
use anyhow::Result;
use bytes::Buf;

pub struct NaluReader<T> {
    data: Cursor<T>,
    /// Bits of the current byte that have not been consumed yet, left
    /// aligned in the low `remaining` bits.
    curr_byte: u32,
    remaining: usize,
}

impl<T: AsRef<[u8]>> NaluReader<T> {
    pub fn new(data: T) -> Self {
        NaluReader {
            data: Cursor::new(data),
            curr_byte: 0,
            remaining: 0,
        }
    }

    fn refill(&mut self) -> Result<()> {
        if !self.data.has_remaining() {
            return Err(anyhow!("end of bitstream"));
        }
        self.curr_byte = self.data.get_u8() as u32;
        self.remaining = 8;
        Ok(())
    }

    /// Reads up to 31 bits, most significant first.
    pub fn read_bits(&mut self, num_bits: usize) -> Result<u32> {
        if num_bits > 31 {
            return Err(anyhow!("more than 31 bits requested at once"));
        }
        let mut needed = num_bits;
        let mut out: u32 = 0;
        while needed > 0 {
            if self.remaining == 0 {
                self.refill()?;
            }
            let take = needed.min(self.remaining);
            let shift = self.remaining - take;
            let bits = (self.curr_byte >> shift) & ((1 << take) - 1);
            out = (out << take) | bits;
            self.remaining -= take;
            needed -= take;
        }
        Ok(out)
    }

    pub fn read_bit(&mut self) -> Result<bool> {
        Ok(self.read_bits(1)? != 0)
    }

    /// Reads one unsigned Exp-Golomb coded value (`ue(v)`).
    pub fn read_ue(&mut self) -> Result<u32> {
        let mut leading_zeros = 0;
        while !self.read_bit()? {
            leading_zeros += 1;
            if leading_zeros > 31 {
                return Err(anyhow!("invalid Exp-Golomb code"));
            }
        }
        let suffix = self.read_bits(leading_zeros)?;
        Ok((1u32 << leading_zeros) - 1 + suffix)
    }

    /// Reads one signed Exp-Golomb coded value (`se(v)`).
    pub fn read_se(&mut self) -> Result<i32> {
        let ue = self.read_ue()?;
        let abs = ue.div_ceil(2) as i32;
        if ue % 2 == 0 {
            Ok(-abs)
        } else {
            Ok(abs)
        }
    }
}
