// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! 2D engine command generation: clears, blits, and scaled blits.
//!
//! Every operation validates its rectangles against the pixel buffers before
//! pushing a single word, so a rejected operation leaves the stream
//! untouched. The caller owns the stream lifecycle (`begin`/`end`/submit).

use crate::error::Result;
use crate::error::VdpError;
use crate::host1x::opcodes;
use crate::host1x::EngineClass;
use crate::host1x::Stream;
use crate::pixbuf::Layout;
use crate::pixbuf::PixelBuffer;
use crate::pixbuf::Rect;

// GR2D registers.
const TRIGGER: u32 = 0x009;
const CONTROLSECOND: u32 = 0x01c;
const CONTROLMAIN: u32 = 0x01e;
const ROPFADE: u32 = 0x025;
const DSTBA: u32 = 0x02b;
const DSTST: u32 = 0x02e;
const SRCBA: u32 = 0x031;
const SRCST: u32 = 0x033;
const SRCFGC: u32 = 0x035;
const SRCSIZE: u32 = 0x038;
const DSTSIZE: u32 = 0x039;
const SRCPS: u32 = 0x03a;
const DSTPS: u32 = 0x03b;

// CONTROLMAIN bits.
const CM_DATA_FLOW_BITBLT: u32 = 1 << 0;
const CM_SOLID_FILL: u32 = 1 << 2;
const CM_BPP_32: u32 = 2 << 16;
const CM_BPP_8: u32 = 0 << 16;
const CM_XDIR_NEGATIVE: u32 = 1 << 20;
const CM_YDIR_NEGATIVE: u32 = 1 << 21;
const CM_SRC_TILED: u32 = 1 << 24;
const CM_DST_TILED: u32 = 1 << 25;

fn packed_point(x: u32, y: u32) -> u32 {
    (y << 16) | (x & 0xffff)
}

fn packed_size(width: u32, height: u32) -> u32 {
    (height << 16) | (width & 0xffff)
}

/// Applies the engine's addressing constraints to an x coordinate: tiled
/// surfaces address in 32-pixel steps, linear YUV in 2-pixel steps.
fn masked_x(pb: &PixelBuffer, x: u32) -> u32 {
    match pb.layout() {
        Layout::Tiled16 => x & !31,
        Layout::Linear => {
            if pb.format().is_yuv() {
                x & !1
            } else {
                x
            }
        }
    }
}

fn bpp_bits(pb: &PixelBuffer) -> u32 {
    if pb.format().is_yuv() {
        CM_BPP_8
    } else {
        CM_BPP_32
    }
}

fn tiling_bits(src: Option<&PixelBuffer>, dst: &PixelBuffer) -> u32 {
    let mut bits = 0;
    if dst.layout() == Layout::Tiled16 {
        bits |= CM_DST_TILED;
    }
    if let Some(src) = src {
        if src.layout() == Layout::Tiled16 {
            bits |= CM_SRC_TILED;
        }
    }
    bits
}

/// Direction flags for a self-overlapping in-place blit, chosen so every
/// source pixel is read before it is overwritten.
fn overlap_direction(dst_rect: &Rect, src_rect: &Rect) -> u32 {
    let mut bits = 0;
    if dst_rect.y > src_rect.y {
        bits |= CM_YDIR_NEGATIVE;
    }
    if dst_rect.x > src_rect.x {
        bits |= CM_XDIR_NEGATIVE;
    }
    bits
}

fn same_backing(a: &PixelBuffer, b: &PixelBuffer) -> bool {
    match (a.plane(0).bo.export_fd(), b.plane(0).bo.export_fd()) {
        (Ok(fa), Ok(fb)) => fa == fb && a.plane(0).offset == b.plane(0).offset,
        _ => false,
    }
}

/// Fills `rect` of `dst` with `color`.
pub fn clear(stream: &mut Stream, dst: &PixelBuffer, rect: &Rect, color: u32) -> Result<()> {
    if !dst.contains(rect) {
        return Err(VdpError::InvalidRect);
    }
    let x = masked_x(dst, rect.x);

    stream.ensure_space(16)?;
    stream.push_setclass(EngineClass::Gr2d)?;
    stream.push_word(opcodes::mask(CONTROLSECOND, 0x1))?;
    stream.push_word(0)?;
    stream.push_word(opcodes::incr(CONTROLMAIN, 1))?;
    stream.push_word(CM_DATA_FLOW_BITBLT | CM_SOLID_FILL | bpp_bits(dst) | tiling_bits(None, dst))?;
    stream.push_word(opcodes::mask(ROPFADE, 0x1))?;
    stream.push_word(0xcc)?; // copy ROP
    stream.push_word(opcodes::incr(DSTBA, 1))?;
    stream.push_reloc(dst.plane(0).bo.clone(), dst.plane(0).offset)?;
    stream.push_word(opcodes::incr(DSTST, 1))?;
    stream.push_word(dst.pitch())?;
    stream.push_word(opcodes::incr(SRCFGC, 1))?;
    stream.push_word(color)?;
    stream.push_word(opcodes::incr(DSTSIZE, 1))?;
    stream.push_word(packed_size(rect.width, rect.height))?;
    stream.push_word(opcodes::incr(DSTPS, 1))?;
    stream.push_word(packed_point(x, rect.y))?;
    stream.push_word(opcodes::nonincr(TRIGGER, 1))?;
    stream.push_word(packed_point(x + rect.width - 1, rect.y + rect.height - 1))?;
    Ok(())
}

/// 1:1 copy of `src_rect` from `src` into `dst_rect` of `dst`. The two
/// rectangles must have identical dimensions. In-place overlapping copies
/// pick a traversal direction that reads before overwriting.
pub fn blit(
    stream: &mut Stream,
    dst: &PixelBuffer,
    dst_rect: &Rect,
    src: &PixelBuffer,
    src_rect: &Rect,
) -> Result<()> {
    if dst_rect.width != src_rect.width || dst_rect.height != src_rect.height {
        return Err(VdpError::InvalidSize);
    }
    if !dst.contains(dst_rect) || !src.contains(src_rect) {
        return Err(VdpError::InvalidRect);
    }

    let mut control = CM_DATA_FLOW_BITBLT | bpp_bits(dst) | tiling_bits(Some(src), dst);
    if same_backing(src, dst) && dst_rect.overlaps(src_rect) {
        control |= overlap_direction(dst_rect, src_rect);
    }
    let dx = masked_x(dst, dst_rect.x);
    let sx = masked_x(src, src_rect.x);

    stream.ensure_space(18)?;
    stream.push_setclass(EngineClass::Gr2d)?;
    stream.push_word(opcodes::mask(CONTROLSECOND, 0x1))?;
    stream.push_word(0)?;
    stream.push_word(opcodes::incr(CONTROLMAIN, 1))?;
    stream.push_word(control)?;
    stream.push_word(opcodes::mask(ROPFADE, 0x1))?;
    stream.push_word(0xcc)?;
    stream.push_word(opcodes::incr(DSTBA, 1))?;
    stream.push_reloc(dst.plane(0).bo.clone(), dst.plane(0).offset)?;
    stream.push_word(opcodes::incr(DSTST, 1))?;
    stream.push_word(dst.pitch())?;
    stream.push_word(opcodes::incr(SRCBA, 1))?;
    stream.push_reloc(src.plane(0).bo.clone(), src.plane(0).offset)?;
    stream.push_word(opcodes::incr(SRCST, 1))?;
    stream.push_word(src.pitch())?;
    stream.push_word(opcodes::incr(DSTSIZE, 1))?;
    stream.push_word(packed_size(dst_rect.width, dst_rect.height))?;
    stream.push_word(opcodes::incr(SRCPS, 2))?;
    stream.push_word(packed_point(sx, src_rect.y))?;
    stream.push_word(packed_point(dx, dst_rect.y))?;
    stream.push_word(opcodes::nonincr(TRIGGER, 1))?;
    stream.push_word(packed_point(
        dx + dst_rect.width - 1,
        dst_rect.y + dst_rect.height - 1,
    ))?;
    Ok(())
}

// GR2D_SB scale ratio registers.
const SB_SRC_SIZE: u32 = 0x044;
const SB_DST_SIZE: u32 = 0x045;
const SB_RATIO_X: u32 = 0x046;
const SB_RATIO_Y: u32 = 0x047;

/// 16.16 fixed-point ratio of src to dst extent.
fn scale_ratio(src: u32, dst: u32) -> u32 {
    (((src as u64) << 16) / dst.max(1) as u64) as u32
}

/// Scaling copy through the 2D scaling variant of the engine.
pub fn scaled_blit(
    stream: &mut Stream,
    dst: &PixelBuffer,
    dst_rect: &Rect,
    src: &PixelBuffer,
    src_rect: &Rect,
) -> Result<()> {
    if !dst.contains(dst_rect) || !src.contains(src_rect) {
        return Err(VdpError::InvalidRect);
    }
    if dst_rect.width == src_rect.width && dst_rect.height == src_rect.height {
        return blit(stream, dst, dst_rect, src, src_rect);
    }
    let dx = masked_x(dst, dst_rect.x);
    let sx = masked_x(src, src_rect.x);

    stream.ensure_space(22)?;
    stream.push_setclass(EngineClass::Gr2dSb)?;
    stream.push_word(opcodes::incr(CONTROLMAIN, 1))?;
    stream.push_word(CM_DATA_FLOW_BITBLT | bpp_bits(dst) | tiling_bits(Some(src), dst))?;
    stream.push_word(opcodes::incr(DSTBA, 1))?;
    stream.push_reloc(dst.plane(0).bo.clone(), dst.plane(0).offset)?;
    stream.push_word(opcodes::incr(DSTST, 1))?;
    stream.push_word(dst.pitch())?;
    stream.push_word(opcodes::incr(SRCBA, 1))?;
    stream.push_reloc(src.plane(0).bo.clone(), src.plane(0).offset)?;
    stream.push_word(opcodes::incr(SRCST, 1))?;
    stream.push_word(src.pitch())?;
    stream.push_word(opcodes::incr(SB_SRC_SIZE, 2))?;
    stream.push_word(packed_size(src_rect.width, src_rect.height))?;
    stream.push_word(packed_size(dst_rect.width, dst_rect.height))?;
    stream.push_word(opcodes::incr(SB_RATIO_X, 2))?;
    stream.push_word(scale_ratio(src_rect.width, dst_rect.width))?;
    stream.push_word(scale_ratio(src_rect.height, dst_rect.height))?;
    stream.push_word(opcodes::incr(SRCPS, 2))?;
    stream.push_word(packed_point(sx, src_rect.y))?;
    stream.push_word(packed_point(dx, dst_rect.y))?;
    stream.push_word(opcodes::nonincr(TRIGGER, 1))?;
    stream.push_word(packed_point(
        dx + dst_rect.width - 1,
        dst_rect.y + dst_rect.height - 1,
    ))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::Config;
    use crate::host1x::DummyChannel;
    use crate::mem::fake::FakeAllocator;
    use crate::pixbuf::PixelFormat;

    /// The word written by the `incr(CONTROLMAIN, 1)` pair.
    fn controlmain_payload(words: &[u32]) -> Option<u32> {
        words
            .iter()
            .position(|&w| w == opcodes::incr(CONTROLMAIN, 1))
            .and_then(|i| words.get(i + 1).copied())
    }

    fn pb(width: u32, height: u32) -> PixelBuffer {
        PixelBuffer::alloc(
            &FakeAllocator::new(),
            &Config::default(),
            width,
            height,
            PixelFormat::Argb8888,
            Layout::Linear,
        )
        .unwrap()
    }

    #[test]
    fn out_of_range_rect_pushes_nothing() {
        let channel = Arc::new(DummyChannel::new());
        let mut stream = Stream::new(channel.clone());
        let dst = pb(64, 64);
        stream.begin().unwrap();
        let err = clear(&mut stream, &dst, &Rect::new(60, 0, 8, 8), 0);
        assert!(matches!(err, Err(VdpError::InvalidRect)));
        stream.end().unwrap();
        stream.flush().unwrap();
        let jobs = channel.take_submitted();
        // Only the end-of-job sync marker words are present.
        assert_eq!(jobs[0].relocs.len(), 0);
    }

    #[test]
    fn mismatched_blit_rects_rejected() {
        let channel = Arc::new(DummyChannel::new());
        let mut stream = Stream::new(channel);
        let dst = pb(64, 64);
        let src = pb(64, 64);
        stream.begin().unwrap();
        assert!(matches!(
            blit(
                &mut stream,
                &dst,
                &Rect::new(0, 0, 8, 8),
                &src,
                &Rect::new(0, 0, 8, 4)
            ),
            Err(VdpError::InvalidSize)
        ));
    }

    #[test]
    fn overlapping_in_place_blit_sets_direction() {
        let channel = Arc::new(DummyChannel::new());
        let mut stream = Stream::new(channel.clone());
        let surface = pb(64, 64);
        stream.begin().unwrap();
        // Copy down-right onto itself: both directions must be negative.
        blit(
            &mut stream,
            &surface,
            &Rect::new(8, 8, 32, 32),
            &surface,
            &Rect::new(0, 0, 32, 32),
        )
        .unwrap();
        stream.end().unwrap();
        stream.flush().unwrap();
        let jobs = channel.take_submitted();
        let control = controlmain_payload(&jobs[0].words).expect("no CONTROLMAIN write");
        assert_eq!(
            control & (CM_XDIR_NEGATIVE | CM_YDIR_NEGATIVE),
            CM_XDIR_NEGATIVE | CM_YDIR_NEGATIVE
        );
    }

    #[test]
    fn disjoint_in_place_blit_keeps_default_direction() {
        let channel = Arc::new(DummyChannel::new());
        let mut stream = Stream::new(channel.clone());
        let surface = pb(128, 64);
        stream.begin().unwrap();
        blit(
            &mut stream,
            &surface,
            &Rect::new(64, 0, 32, 32),
            &surface,
            &Rect::new(0, 0, 32, 32),
        )
        .unwrap();
        stream.end().unwrap();
        stream.flush().unwrap();
        let jobs = channel.take_submitted();
        let control = controlmain_payload(&jobs[0].words).expect("no CONTROLMAIN write");
        assert_eq!(control & (CM_XDIR_NEGATIVE | CM_YDIR_NEGATIVE), 0);
    }

    #[test]
    fn clear_emits_dst_reloc() {
        let channel = Arc::new(DummyChannel::new());
        let mut stream = Stream::new(channel.clone());
        let dst = pb(64, 64);
        stream.begin().unwrap();
        clear(&mut stream, &dst, &Rect::whole(64, 64), 0xff00_00ff).unwrap();
        stream.end().unwrap();
        stream.flush().unwrap();
        let jobs = channel.take_submitted();
        assert_eq!(jobs[0].relocs.len(), 1);
        assert!(jobs[0].words.contains(&0xff00_00ff));
    }
}
