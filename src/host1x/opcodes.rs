// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bit-packed host1x opcode words.
//!
//! Each command word carries a 4-bit opcode in its top nibble followed by an
//! opcode-specific payload. These match the channel protocol the hardware
//! command FIFO parses.

use super::EngineClass;

/// Switch the channel to `class`, optionally writing `mask`-selected
/// registers starting at `offset`.
pub const fn setclass(class: EngineClass, offset: u32, mask: u32) -> u32 {
    (0x0 << 28) | ((offset & 0xfff) << 16) | ((class as u32) << 6) | (mask & 0x3f)
}

/// Write `count` words to consecutive registers starting at `offset`.
pub const fn incr(offset: u32, count: u32) -> u32 {
    (0x1 << 28) | ((offset & 0xfff) << 16) | (count & 0xffff)
}

/// Write `count` words to the single register at `offset`.
pub const fn nonincr(offset: u32, count: u32) -> u32 {
    (0x2 << 28) | ((offset & 0xfff) << 16) | (count & 0xffff)
}

/// Write one word per set bit of `mask` to registers relative to `offset`.
pub const fn mask(offset: u32, mask: u32) -> u32 {
    (0x3 << 28) | ((offset & 0xfff) << 16) | (mask & 0xffff)
}

/// Write the 16-bit immediate `value` to the register at `offset`.
pub const fn imm(offset: u32, value: u32) -> u32 {
    (0x4 << 28) | ((offset & 0xfff) << 16) | (value & 0xffff)
}

/// Register in the host1x class taking a syncpoint increment request.
pub const HOST1X_INCR_SYNCPT: u32 = 0x0;

/// Condition field value: increment when the engine raises OP_DONE.
pub const SYNCPT_COND_OP_DONE: u32 = 0x1;

/// Word written to `HOST1X_INCR_SYNCPT` requesting an OP_DONE increment of
/// syncpoint `id`.
pub const fn syncpt_incr_op_done(id: u32) -> u32 {
    (SYNCPT_COND_OP_DONE << 8) | (id & 0xff)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_encodings() {
        assert_eq!(setclass(EngineClass::Gr2d, 0, 0), 0x0000_1440);
        assert_eq!(incr(0x2b, 2), 0x102b_0002);
        assert_eq!(nonincr(0x9, 1), 0x2009_0001);
        assert_eq!(mask(0x1e, 0x9), 0x301e_0009);
        assert_eq!(imm(0x9, 0x112), 0x4009_0112);
    }
}
