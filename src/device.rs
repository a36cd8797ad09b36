// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The device object and the handle-based public entry points.
//!
//! A device owns the buffer allocator, the host1x channel, the decode
//! backend, and one handle table per object kind. All tables sit behind a
//! single registry lock that is only ever held to translate handles;
//! per-object work happens on the looked-up `Arc` after the lock is
//! released.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use log::info;

use crate::backend;
use crate::backend::DecodeBackend;
use crate::cache;
use crate::cache::SurfaceCache;
use crate::config::Config;
use crate::error::Result;
use crate::error::VdpError;
use crate::h264::decoder::BitstreamBuffer;
use crate::h264::decoder::Decoder;
use crate::h264::decoder::PictureInfoH264;
use crate::h264::decoder::Profile;
use crate::h264::decoder::MAX_CODED_DIM;
use crate::h264::reflist::MAX_REFERENCES;
use crate::handles::Handle;
use crate::handles::HandleTable;
use crate::host1x::Channel;
use crate::mem::BufferAllocator;
use crate::mixer::CscMatrix;
use crate::mixer::Mixer;
use crate::mixer::OutputLayer;
use crate::pixbuf::PixelFormat;
use crate::pixbuf::Rect;
use crate::presentation::PresentationQueue;
use crate::presentation::QueueTarget;
use crate::surface::PresentationStatus;
use crate::surface::Surface;
use crate::surface::SurfaceKind;
use crate::sync::Mutex;

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);

/// A registered presentation target.
pub struct TargetEntry {
    target: Arc<dyn QueueTarget>,
}

/// What the decoder reports for a capability query.
#[derive(Copy, Clone, Debug)]
pub struct DecoderCapabilities {
    pub supported: bool,
    pub max_level: u8,
    pub max_references: u32,
    pub max_width: u32,
    pub max_height: u32,
}

#[derive(Default)]
struct Registry {
    surfaces: HandleTable<Surface>,
    decoders: HandleTable<Decoder>,
    mixers: HandleTable<Mixer>,
    queues: HandleTable<PresentationQueue>,
    targets: HandleTable<TargetEntry>,
}

pub struct Device {
    id: u64,
    config: Config,
    allocator: Arc<dyn BufferAllocator>,
    channel: Arc<dyn Channel>,
    backend: Arc<dyn DecodeBackend>,
    registry: Mutex<Registry>,
    cache: SurfaceCache,
}

impl Device {
    /// Opens a device against real kernel interfaces, with the configuration
    /// taken from the environment.
    pub fn new(
        allocator: Arc<dyn BufferAllocator>,
        channel: Arc<dyn Channel>,
    ) -> Result<Arc<Device>> {
        let config = Config::from_env();
        let backend = backend::detect(&config)?;
        Ok(Self::assemble(allocator, channel, backend, config))
    }

    /// Builds a device from explicit parts. Tests use this with the fake
    /// allocator, the dummy channel, and the recording backend.
    pub fn with_backend(
        allocator: Arc<dyn BufferAllocator>,
        channel: Arc<dyn Channel>,
        backend: Arc<dyn DecodeBackend>,
        config: Config,
    ) -> Arc<Device> {
        Self::assemble(allocator, channel, backend, config)
    }

    fn assemble(
        allocator: Arc<dyn BufferAllocator>,
        channel: Arc<dyn Channel>,
        backend: Arc<dyn DecodeBackend>,
        config: Config,
    ) -> Arc<Device> {
        let id = NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed);
        info!("device {} created, config {:?}", id, config);
        Arc::new(Device {
            id,
            config,
            allocator,
            channel,
            backend,
            registry: Mutex::new(Registry::default()),
            cache: SurfaceCache::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn create_surface(
        &self,
        kind: SurfaceKind,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<Handle<Surface>> {
        let surface = match cache::take_cached(self.id, width, height, format, kind) {
            Some(surface) => surface,
            None => Surface::new(
                self.id,
                self.allocator.as_ref(),
                self.channel.clone(),
                &self.config,
                kind,
                width,
                height,
                format,
            )?,
        };
        self.registry.lock().surfaces.insert(surface)
    }

    pub fn create_video_surface(&self, width: u32, height: u32) -> Result<Handle<Surface>> {
        self.create_surface(SurfaceKind::Video, width, height, PixelFormat::Yuv420)
    }

    pub fn create_output_surface(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<Handle<Surface>> {
        if format.is_yuv() {
            return Err(VdpError::InvalidParameter("output surface format"));
        }
        self.create_surface(SurfaceKind::Output, width, height, format)
    }

    pub fn create_bitmap_surface(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<Handle<Surface>> {
        if format.is_yuv() {
            return Err(VdpError::InvalidParameter("bitmap surface format"));
        }
        self.create_surface(SurfaceKind::Bitmap, width, height, format)
    }

    pub fn surface(&self, handle: Handle<Surface>) -> Result<Arc<Surface>> {
        self.registry.lock().surfaces.get(handle)
    }

    /// Destroys the handle. The surface itself is parked in the cache so an
    /// equally-shaped creation can reuse its memory; outstanding references
    /// (DPB slots, pending transfers, the presentation queue) keep working.
    pub fn destroy_surface(&self, handle: Handle<Surface>) -> Result<()> {
        let surface = self.registry.lock().surfaces.remove(handle)?;
        surface.mark_destroyed();
        self.cache.insert(surface);
        Ok(())
    }

    /// CPU upload into one plane of a surface.
    pub fn surface_put_bits(
        &self,
        handle: Handle<Surface>,
        plane: usize,
        rect: &Rect,
        data: &[u8],
        src_pitch: u32,
    ) -> Result<()> {
        let surface = self.surface(handle)?;
        let state = surface.lock_state();
        state.pixbuf.upload(plane, rect, data, src_pitch)
    }

    /// CPU read-back from one plane of a surface.
    pub fn surface_get_bits(
        &self,
        handle: Handle<Surface>,
        plane: usize,
        rect: &Rect,
        data: &mut [u8],
        dst_pitch: u32,
    ) -> Result<()> {
        let surface = self.surface(handle)?;
        let state = surface.lock_state();
        state.pixbuf.download(plane, rect, data, dst_pitch)
    }

    /// Fills `rect` of an output or bitmap surface with a solid color.
    pub fn surface_fill(
        &self,
        handle: Handle<Surface>,
        rect: &Rect,
        color: u32,
    ) -> Result<()> {
        let surface = self.surface(handle)?;
        if surface.kind() == SurfaceKind::Video {
            return Err(VdpError::InvalidParameter("fill target kind"));
        }
        surface.clear_rect(rect, color)
    }

    pub fn create_decoder(
        &self,
        profile: Profile,
        width: u32,
        height: u32,
        max_references: u32,
    ) -> Result<Handle<Decoder>> {
        let decoder = Decoder::new(
            self.allocator.clone(),
            self.backend.clone(),
            &self.config,
            profile,
            width,
            height,
            max_references,
        )?;
        self.registry.lock().decoders.insert(Arc::new(decoder))
    }

    pub fn destroy_decoder(&self, handle: Handle<Decoder>) -> Result<()> {
        self.registry.lock().decoders.remove(handle).map(drop)
    }

    /// Decodes one picture into the target video surface.
    pub fn decoder_render(
        &self,
        decoder_handle: Handle<Decoder>,
        target_handle: Handle<Surface>,
        info: &PictureInfoH264,
        buffers: &[BitstreamBuffer],
    ) -> Result<()> {
        let (decoder, target) = {
            let registry = self.registry.lock();
            (
                registry.decoders.get(decoder_handle)?,
                registry.surfaces.get(target_handle)?,
            )
        };
        decoder.decode(&target, info, buffers)
    }

    /// Reports what the decode hardware can do for `profile`.
    pub fn query_capabilities(&self, profile: Profile) -> DecoderCapabilities {
        DecoderCapabilities {
            supported: profile.is_supported(),
            max_level: 51,
            max_references: MAX_REFERENCES as u32,
            max_width: MAX_CODED_DIM,
            max_height: MAX_CODED_DIM,
        }
    }

    pub fn create_mixer(&self) -> Result<Handle<Mixer>> {
        self.registry
            .lock()
            .mixers
            .insert(Arc::new(Mixer::new(&self.config)))
    }

    pub fn destroy_mixer(&self, handle: Handle<Mixer>) -> Result<()> {
        self.registry.lock().mixers.remove(handle).map(drop)
    }

    pub fn mixer_set_background_color(&self, handle: Handle<Mixer>, color: u32) -> Result<()> {
        self.registry.lock().mixers.get(handle)?.set_background_color(color);
        Ok(())
    }

    pub fn mixer_set_csc_matrix(
        &self,
        handle: Handle<Mixer>,
        matrix: Option<CscMatrix>,
    ) -> Result<()> {
        self.registry.lock().mixers.get(handle)?.set_csc_matrix(matrix);
        Ok(())
    }

    pub fn mixer_render(
        &self,
        mixer_handle: Handle<Mixer>,
        video_handle: Handle<Surface>,
        output_handle: Handle<Surface>,
        src_rect: Option<Rect>,
        dst_rect: Option<Rect>,
        layers: &[OutputLayer],
    ) -> Result<()> {
        let (mixer, video, output) = {
            let registry = self.registry.lock();
            (
                registry.mixers.get(mixer_handle)?,
                registry.surfaces.get(video_handle)?,
                registry.surfaces.get(output_handle)?,
            )
        };
        mixer.render(&video, &output, src_rect, dst_rect, layers)
    }

    /// Registers the sink that displayed surfaces are handed to.
    pub fn register_queue_target(
        &self,
        target: Arc<dyn QueueTarget>,
    ) -> Result<Handle<TargetEntry>> {
        self.registry
            .lock()
            .targets
            .insert(Arc::new(TargetEntry { target }))
    }

    pub fn destroy_queue_target(&self, handle: Handle<TargetEntry>) -> Result<()> {
        self.registry.lock().targets.remove(handle).map(drop)
    }

    pub fn create_presentation_queue(
        &self,
        target_handle: Handle<TargetEntry>,
    ) -> Result<Handle<PresentationQueue>> {
        let target = self.registry.lock().targets.get(target_handle)?.target.clone();
        self.registry
            .lock()
            .queues
            .insert(Arc::new(PresentationQueue::new(target)))
    }

    /// Destroys the queue: its thread drains, pending surfaces go idle, and
    /// waiters wake.
    pub fn destroy_presentation_queue(&self, handle: Handle<PresentationQueue>) -> Result<()> {
        self.registry.lock().queues.remove(handle).map(drop)
    }

    pub fn presentation_queue_display(
        &self,
        queue_handle: Handle<PresentationQueue>,
        surface_handle: Handle<Surface>,
        earliest: Instant,
    ) -> Result<()> {
        let (queue, surface) = {
            let registry = self.registry.lock();
            (
                registry.queues.get(queue_handle)?,
                registry.surfaces.get(surface_handle)?,
            )
        };
        queue.display(surface, earliest)
    }

    pub fn presentation_queue_block_until_idle(
        &self,
        queue_handle: Handle<PresentationQueue>,
        surface_handle: Handle<Surface>,
    ) -> Result<()> {
        let (queue, surface) = {
            let registry = self.registry.lock();
            (
                registry.queues.get(queue_handle)?,
                registry.surfaces.get(surface_handle)?,
            )
        };
        queue.block_until_idle(&surface);
        Ok(())
    }

    pub fn presentation_queue_query_status(
        &self,
        queue_handle: Handle<PresentationQueue>,
        surface_handle: Handle<Surface>,
    ) -> Result<(PresentationStatus, Option<Instant>)> {
        let (queue, surface) = {
            let registry = self.registry.lock();
            (
                registry.queues.get(queue_handle)?,
                registry.surfaces.get(surface_handle)?,
            )
        };
        Ok(queue.query_status(&surface))
    }

    pub fn presentation_queue_set_background_color(
        &self,
        handle: Handle<PresentationQueue>,
        color: u32,
    ) -> Result<()> {
        self.registry.lock().queues.get(handle)?.set_background_color(color);
        Ok(())
    }

    pub fn presentation_queue_get_time(&self) -> Instant {
        PresentationQueue::get_time()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        info!("device {} destroyed", self.id);
    }
}
