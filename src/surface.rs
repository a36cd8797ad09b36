// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Surfaces: reference-counted image handles and the shared-surface fast
//! path.
//!
//! A surface owns its pixel buffer and a command stream for engine
//! operations against it. Shared ownership is `Arc`; the last clone to drop
//! tears the backing memory down. The surface lock must be held while
//! issuing commands against the surface's pixel buffer.
//!
//! A "shared surface" is a deferred video-to-display transfer: instead of
//! eagerly compositing a video surface onto a display surface, a pairing is
//! recorded and the pixel copy happens when the display surface is next
//! consumed. Killing the pairing releases the video reference without
//! transferring.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::MutexGuard;
use std::time::Instant;

use crate::config::Config;
use crate::error::Result;
use crate::error::VdpError;
use crate::g2d;
use crate::host1x::Channel;
use crate::host1x::Stream;
use crate::mem::BufferAllocator;
use crate::pixbuf::Layout;
use crate::pixbuf::PixelBuffer;
use crate::pixbuf::PixelFormat;
use crate::pixbuf::Rect;
use crate::sync::Condvar;
use crate::sync::Mutex;

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SurfaceKind {
    Video,
    Bitmap,
    Output,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PresentationStatus {
    Idle,
    Queued,
    Visible,
}

/// Deferred video-to-display transfer. Holds one reference to each side for
/// its whole lifetime; consuming or killing it is the only way to release
/// them.
pub struct SharedSurface {
    pub video: Arc<Surface>,
    pub display: Arc<Surface>,
    pub src_rect: Rect,
    pub dst_rect: Rect,
    /// Pending background clear applied at transfer time.
    pub background: Option<u32>,
}

pub struct SurfaceState {
    pub pixbuf: PixelBuffer,
    pub stream: Stream,
    pub status: PresentationStatus,
    pub earliest_presentation: Option<Instant>,
    /// Active pairing where `self` is the display side.
    pub shared: Option<Arc<SharedSurface>>,
    pub destroyed: bool,
}

pub struct Surface {
    serial: u64,
    device_id: u64,
    kind: SurfaceKind,
    width: u32,
    height: u32,
    format: PixelFormat,
    state: Mutex<SurfaceState>,
    idle_cv: Condvar,
}

impl Surface {
    pub fn new(
        device_id: u64,
        allocator: &dyn BufferAllocator,
        channel: Arc<dyn Channel>,
        config: &Config,
        kind: SurfaceKind,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<Arc<Surface>> {
        let layout = if kind == SurfaceKind::Video {
            Layout::Tiled16
        } else {
            Layout::Linear
        };
        let pixbuf = PixelBuffer::alloc(allocator, config, width, height, format, layout)?;
        Ok(Arc::new(Surface {
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            device_id,
            kind,
            width,
            height,
            format,
            state: Mutex::new(SurfaceState {
                pixbuf,
                stream: Stream::new(channel),
                status: PresentationStatus::Idle,
                earliest_presentation: None,
                shared: None,
                destroyed: false,
            }),
            idle_cv: Condvar::new(),
        }))
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn device_id(&self) -> u64 {
        self.device_id
    }

    pub fn kind(&self) -> SurfaceKind {
        self.kind
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

    pub fn lock_state(&self) -> MutexGuard<SurfaceState> {
        self.state.lock()
    }

    pub fn try_lock_state(&self) -> Option<MutexGuard<SurfaceState>> {
        self.state.try_lock()
    }

    pub fn idle_cv(&self) -> &Condvar {
        &self.idle_cv
    }

    /// Whether this surface can satisfy a cache request for the given
    /// parameters. Matching is on immutable identity only.
    pub fn matches(
        &self,
        device_id: u64,
        width: u32,
        height: u32,
        format: PixelFormat,
        kind: SurfaceKind,
    ) -> bool {
        self.device_id == device_id
            && self.width == width
            && self.height == height
            && self.format == format
            && self.kind == kind
    }

    pub fn status(&self) -> PresentationStatus {
        self.state.lock().status
    }

    pub fn set_status(&self, status: PresentationStatus) {
        let mut state = self.state.lock();
        state.status = status;
        if status == PresentationStatus::Idle {
            self.idle_cv.notify_all();
        }
    }

    /// Marks the surface destroyed. The backing memory stays alive while the
    /// cache (or any other holder) keeps a reference.
    pub fn mark_destroyed(&self) {
        self.state.lock().destroyed = true;
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    /// Revives a surface pulled back out of the cache.
    pub fn revive(&self) {
        let mut state = self.state.lock();
        state.destroyed = false;
        state.status = PresentationStatus::Idle;
        state.earliest_presentation = None;
    }

    /// Clears `rect` to `color` through the 2D engine.
    pub fn clear_rect(&self, rect: &Rect, color: u32) -> Result<()> {
        let mut state = self.state.lock();
        let SurfaceState { pixbuf, stream, .. } = &mut *state;
        stream.begin()?;
        if let Err(e) = g2d::clear(stream, pixbuf, rect, color) {
            // A rejected operation must reach the hardware queue with
            // nothing, not an empty job.
            stream.abort();
            return Err(e);
        }
        stream.end()?;
        stream.flush()?;
        pixbuf.check_guard();
        Ok(())
    }
}

/// Establishes a pairing, superseding (and killing) any existing pairing on
/// the display surface. At most one pairing is active per display surface.
pub fn create_shared(
    video: Arc<Surface>,
    display: Arc<Surface>,
    src_rect: Rect,
    dst_rect: Rect,
    background: Option<u32>,
) -> Result<()> {
    if video.kind() != SurfaceKind::Video || display.kind() == SurfaceKind::Video {
        return Err(VdpError::InvalidParameter("shared surface kinds"));
    }
    let shared = Arc::new(SharedSurface {
        video,
        display: display.clone(),
        src_rect,
        dst_rect,
        background,
    });
    let mut state = display.lock_state();
    // Superseding an unconsumed pairing drops the old video reference
    // without a transfer.
    state.shared = Some(shared);
    Ok(())
}

/// Drops the display surface's pairing without transferring. Used when the
/// display surface is about to be overwritten by another compositing path.
pub fn kill_shared(display: &Surface) {
    let mut state = display.lock_state();
    state.shared = None;
}

/// Consumes the pairing: applies the pending background clear, then blits
/// the video rectangle onto the display surface. No-op without a pairing.
pub fn transfer_shared(display: &Arc<Surface>) -> Result<()> {
    let shared = {
        let mut state = display.lock_state();
        match state.shared.take() {
            Some(shared) => shared,
            None => return Ok(()),
        }
    };

    // Display lock first, then video: the pairing holds both alive, and all
    // transfer paths use this order.
    let mut display_state = display.lock_state();
    let video_state = shared.video.lock_state();

    let SurfaceState { pixbuf, stream, .. } = &mut *display_state;
    stream.begin()?;
    let result = (|| {
        if let Some(color) = shared.background {
            g2d::clear(
                stream,
                pixbuf,
                &Rect::whole(display.width(), display.height()),
                color,
            )?;
        }
        g2d::scaled_blit(
            stream,
            pixbuf,
            &shared.dst_rect,
            &video_state.pixbuf,
            &shared.src_rect,
        )
    })();
    match result {
        Ok(()) => {
            stream.end()?;
            stream.flush()?;
            pixbuf.check_guard();
            video_state.pixbuf.check_guard();
            Ok(())
        }
        Err(e) => {
            stream.abort();
            Err(e)
        }
    }
}

/// Whether the display surface currently carries a pairing.
pub fn has_shared(display: &Surface) -> bool {
    display.lock_state().shared.is_some()
}
