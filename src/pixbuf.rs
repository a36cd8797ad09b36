// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Pixel buffer layout math and out-of-bounds write detection.
//!
//! A pixel buffer describes the backing plane(s) of one image: buffer
//! objects, per-plane byte offsets, pitches, and the tiling layout. When the
//! debug configuration is active, a fixed guard region filled with a known
//! pattern follows each plane; every engine operation that touched the buffer
//! re-reads that pattern afterwards and aborts on mismatch, because hardware
//! writing outside its addressed region leaves nothing safe to continue with.

use log::error;

use crate::config::Config;
use crate::error::Result;
use crate::error::VdpError;
use crate::mem::align_up;
use crate::mem::BoRef;
use crate::mem::BufferAllocator;

/// Guard bytes appended after each plane in debug mode.
pub const GUARD_SIZE: u32 = 16 * 1024;

/// Largest width or height accepted for any allocation. Keeps every
/// pitch and plane-size product inside `u32`.
pub const MAX_PIXBUF_DIM: u32 = 16384;

/// Deterministic repeating guard pattern.
const GUARD_PATTERN: [u8; 4] = [0xde, 0xad, 0xbe, 0xef];

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Rect {
            x,
            y,
            width,
            height,
        }
    }

    pub fn whole(width: u32, height: u32) -> Self {
        Rect::new(0, 0, width, height)
    }

    /// Exclusive right edge. Widened so degenerate rectangles near
    /// `u32::MAX` cannot wrap during validation.
    pub fn x1(&self) -> u64 {
        self.x as u64 + self.width as u64
    }

    /// Exclusive bottom edge.
    pub fn y1(&self) -> u64 {
        self.y as u64 + self.height as u64
    }

    /// Whether `self` and `other` cover any common pixel.
    pub fn overlaps(&self, other: &Rect) -> bool {
        (self.x as u64) < other.x1()
            && (other.x as u64) < self.x1()
            && (self.y as u64) < other.y1()
            && (other.y as u64) < self.y1()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Argb8888,
    Rgba8888,
    Bgra8888,
    /// Planar 4:2:0 YUV, one luma plane and two half-resolution chroma
    /// planes.
    Yuv420,
}

impl PixelFormat {
    /// Bytes per pixel of plane 0.
    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            PixelFormat::Argb8888 | PixelFormat::Rgba8888 | PixelFormat::Bgra8888 => 4,
            PixelFormat::Yuv420 => 1,
        }
    }

    pub fn is_yuv(&self) -> bool {
        matches!(self, PixelFormat::Yuv420)
    }

    /// Height alignment granularity for linear allocations.
    fn height_granularity(&self) -> u32 {
        if self.is_yuv() {
            16
        } else {
            1
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Layout {
    Linear,
    /// 16x16 tiled.
    Tiled16,
}

/// One backing plane.
pub struct Plane {
    pub bo: BoRef,
    pub offset: u32,
    pub pitch: u32,
    /// Plane data bytes, guard region excluded.
    pub size: u32,
}

pub struct PixelBuffer {
    width: u32,
    height: u32,
    format: PixelFormat,
    layout: Layout,
    pitch: u32,
    pitch_uv: u32,
    planes: Vec<Plane>,
    guarded: bool,
}

struct PlaneSpec {
    pitch: u32,
    size: u32,
}

fn plane_specs(width: u32, height: u32, format: PixelFormat, layout: Layout) -> Vec<PlaneSpec> {
    match format {
        PixelFormat::Yuv420 => {
            let pitch = align_up(width, 16);
            let height_aligned = align_up(height, format.height_granularity());
            let pitch_uv = align_up(width.div_ceil(2), 16);
            let uv_height = match layout {
                // Tiled layouts round the chroma height up to whole tiles.
                Layout::Tiled16 => align_up(height.div_ceil(2), 16),
                Layout::Linear => align_up(height.div_ceil(2), 8),
            };
            vec![
                PlaneSpec {
                    pitch,
                    size: pitch * height_aligned,
                },
                PlaneSpec {
                    pitch: pitch_uv,
                    size: pitch_uv * uv_height,
                },
                PlaneSpec {
                    pitch: pitch_uv,
                    size: pitch_uv * uv_height,
                },
            ]
        }
        _ => {
            let pitch = align_up(width * format.bytes_per_pixel(), 16);
            let height_aligned = align_up(height, format.height_granularity());
            vec![PlaneSpec {
                pitch,
                size: pitch * height_aligned,
            }]
        }
    }
}

fn guard_byte(i: u32) -> u8 {
    GUARD_PATTERN[(i % 4) as usize]
}

fn fill_guard(bo: &BoRef, offset: u32) -> Result<()> {
    let pattern: Vec<u8> = (0..GUARD_SIZE).map(guard_byte).collect();
    bo.write(offset, &pattern)
}

impl PixelBuffer {
    /// Allocates the backing plane(s) for a `width`x`height` image.
    ///
    /// Planar YUV places all three planes in one buffer object at computed
    /// offsets unless the `split-video-planes` feature selects three separate
    /// allocations.
    pub fn alloc(
        allocator: &dyn BufferAllocator,
        config: &Config,
        width: u32,
        height: u32,
        format: PixelFormat,
        layout: Layout,
    ) -> Result<PixelBuffer> {
        if width == 0 || height == 0 || width > MAX_PIXBUF_DIM || height > MAX_PIXBUF_DIM {
            return Err(VdpError::InvalidSize);
        }
        let specs = plane_specs(width, height, format, layout);
        let guarded = config.debug;
        let guard = if guarded { GUARD_SIZE } else { 0 };

        let split = cfg!(feature = "split-video-planes") && format.is_yuv();
        let mut planes = Vec::with_capacity(specs.len());
        if split {
            for spec in &specs {
                let bo = allocator.alloc(spec.size + guard)?;
                if guarded {
                    fill_guard(&bo, spec.size)?;
                }
                planes.push(Plane {
                    bo,
                    offset: 0,
                    pitch: spec.pitch,
                    size: spec.size,
                });
            }
        } else {
            let total: u32 = specs.iter().map(|s| s.size + guard).sum();
            let bo = allocator.alloc(total)?;
            let mut offset = 0;
            for spec in &specs {
                if guarded {
                    fill_guard(&bo, offset + spec.size)?;
                }
                planes.push(Plane {
                    bo: bo.clone(),
                    offset,
                    pitch: spec.pitch,
                    size: spec.size,
                });
                offset += spec.size + guard;
            }
        }

        let pitch = specs[0].pitch;
        let pitch_uv = specs.get(1).map(|s| s.pitch).unwrap_or(0);
        Ok(PixelBuffer {
            width,
            height,
            format,
            layout,
            pitch,
            pitch_uv,
            planes,
            guarded,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn pitch(&self) -> u32 {
        self.pitch
    }

    pub fn pitch_uv(&self) -> u32 {
        self.pitch_uv
    }

    pub fn num_planes(&self) -> usize {
        self.planes.len()
    }

    pub fn plane(&self, index: usize) -> &Plane {
        &self.planes[index]
    }

    /// Whether `rect` lies entirely within the image.
    pub fn contains(&self, rect: &Rect) -> bool {
        rect.x1() <= self.width as u64 && rect.y1() <= self.height as u64
    }

    /// Re-reads every guard region and aborts the process on mismatch.
    ///
    /// A mismatch means the fixed-function hardware scribbled past the
    /// region it was addressed with; continuing would operate on corrupted
    /// process memory, so this is deliberately fatal rather than an error
    /// return.
    pub fn check_guard(&self) {
        if !self.guarded {
            return;
        }
        let mut readback = vec![0u8; GUARD_SIZE as usize];
        for (plane_index, plane) in self.planes.iter().enumerate() {
            if plane
                .bo
                .read(plane.offset + plane.size, &mut readback)
                .is_err()
            {
                continue;
            }
            for (i, &byte) in readback.iter().enumerate() {
                if byte != guard_byte(i as u32) {
                    error!(
                        "guard region of plane {} corrupted at byte {}: {:#04x} != {:#04x}",
                        plane_index,
                        i,
                        byte,
                        guard_byte(i as u32)
                    );
                    panic!("hardware wrote outside its pixel buffer; aborting");
                }
            }
        }
    }

    /// CPU upload of packed rows into plane `plane_index` within `rect`.
    /// `src_pitch` is the row stride of `data`.
    pub fn upload(
        &self,
        plane_index: usize,
        rect: &Rect,
        data: &[u8],
        src_pitch: u32,
    ) -> Result<()> {
        if !self.contains(rect) {
            return Err(VdpError::InvalidRect);
        }
        let bpp = self.format.bytes_per_pixel();
        let plane = self.plane(plane_index);
        let row_bytes = (rect.width * bpp) as usize;
        for row in 0..rect.height {
            let src_start = (row * src_pitch) as usize;
            let dst = plane.offset + (rect.y + row) * plane.pitch + rect.x * bpp;
            plane.bo.write(dst, &data[src_start..src_start + row_bytes])?;
        }
        Ok(())
    }

    /// CPU read-back of `rect` rows from plane `plane_index`.
    pub fn download(
        &self,
        plane_index: usize,
        rect: &Rect,
        data: &mut [u8],
        dst_pitch: u32,
    ) -> Result<()> {
        if !self.contains(rect) {
            return Err(VdpError::InvalidRect);
        }
        let bpp = self.format.bytes_per_pixel();
        let plane = self.plane(plane_index);
        let row_bytes = (rect.width * bpp) as usize;
        for row in 0..rect.height {
            let dst_start = (row * dst_pitch) as usize;
            let src = plane.offset + (rect.y + row) * plane.pitch + rect.x * bpp;
            plane
                .bo
                .read(src, &mut data[dst_start..dst_start + row_bytes])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::fake::FakeAllocator;

    fn debug_config() -> Config {
        Config {
            debug: true,
            ..Default::default()
        }
    }

    #[test]
    fn rgb_layout_is_pitch_aligned() {
        let allocator = FakeAllocator::new();
        let pb = PixelBuffer::alloc(
            &allocator,
            &Config::default(),
            33,
            7,
            PixelFormat::Argb8888,
            Layout::Linear,
        )
        .unwrap();
        assert_eq!(pb.pitch() % 16, 0);
        assert!(pb.pitch() >= 33 * 4);
        assert_eq!(pb.num_planes(), 1);
    }

    #[test]
    fn yuv_unified_planes_share_one_bo() {
        let allocator = FakeAllocator::new();
        let pb = PixelBuffer::alloc(
            &allocator,
            &Config::default(),
            352,
            288,
            PixelFormat::Yuv420,
            Layout::Linear,
        )
        .unwrap();
        assert_eq!(pb.num_planes(), 3);
        if cfg!(not(feature = "split-video-planes")) {
            let fd0 = pb.plane(0).bo.export_fd().unwrap();
            assert_eq!(pb.plane(1).bo.export_fd().unwrap(), fd0);
            assert_eq!(pb.plane(2).bo.export_fd().unwrap(), fd0);
            assert!(pb.plane(1).offset > pb.plane(0).offset);
        }
    }

    #[test]
    fn zero_size_rejected() {
        let allocator = FakeAllocator::new();
        assert!(matches!(
            PixelBuffer::alloc(
                &allocator,
                &Config::default(),
                0,
                16,
                PixelFormat::Argb8888,
                Layout::Linear
            ),
            Err(VdpError::InvalidSize)
        ));
    }

    #[test]
    fn oversized_dimensions_rejected() {
        let allocator = FakeAllocator::new();
        // Large enough that the pitch computation would wrap u32.
        assert!(matches!(
            PixelBuffer::alloc(
                &allocator,
                &Config::default(),
                1 << 30,
                16,
                PixelFormat::Argb8888,
                Layout::Linear
            ),
            Err(VdpError::InvalidSize)
        ));
        assert!(matches!(
            PixelBuffer::alloc(
                &allocator,
                &Config::default(),
                16,
                MAX_PIXBUF_DIM + 1,
                PixelFormat::Yuv420,
                Layout::Tiled16
            ),
            Err(VdpError::InvalidSize)
        ));
    }

    #[test]
    fn intact_guard_passes_silently() {
        let allocator = FakeAllocator::new();
        let pb = PixelBuffer::alloc(
            &allocator,
            &debug_config(),
            64,
            64,
            PixelFormat::Argb8888,
            Layout::Linear,
        )
        .unwrap();
        pb.check_guard();
    }

    #[test]
    #[should_panic(expected = "outside its pixel buffer")]
    fn corrupted_guard_is_fatal() {
        let allocator = FakeAllocator::new();
        let pb = PixelBuffer::alloc(
            &allocator,
            &debug_config(),
            64,
            64,
            PixelFormat::Argb8888,
            Layout::Linear,
        )
        .unwrap();
        let plane = pb.plane(0);
        // Flip a single word in the middle of the guard region.
        plane.bo.write(plane.offset + plane.size + 512, &[0; 4]).unwrap();
        pb.check_guard();
    }

    #[test]
    fn upload_download_roundtrip() {
        let allocator = FakeAllocator::new();
        let pb = PixelBuffer::alloc(
            &allocator,
            &Config::default(),
            8,
            8,
            PixelFormat::Argb8888,
            Layout::Linear,
        )
        .unwrap();
        let rect = Rect::new(2, 2, 4, 4);
        let src: Vec<u8> = (0..4 * 4 * 4).map(|i| i as u8).collect();
        pb.upload(0, &rect, &src, 16).unwrap();
        let mut dst = vec![0u8; src.len()];
        pb.download(0, &rect, &mut dst, 16).unwrap();
        assert_eq!(src, dst);
    }

    #[test]
    fn out_of_bounds_rect_rejected() {
        let allocator = FakeAllocator::new();
        let pb = PixelBuffer::alloc(
            &allocator,
            &Config::default(),
            8,
            8,
            PixelFormat::Argb8888,
            Layout::Linear,
        )
        .unwrap();
        let rect = Rect::new(6, 0, 4, 4);
        assert!(matches!(
            pb.upload(0, &rect, &[0; 64], 16),
            Err(VdpError::InvalidRect)
        ));
    }
}
