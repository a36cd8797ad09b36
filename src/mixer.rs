// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Video mixer: routes decoded video onto output surfaces.
//!
//! Rendering has two paths. The fast path defers the pixel copy by pairing
//! the video surface with the output surface (see [`crate::surface`]); the
//! copy then happens at most once, when the output surface is actually
//! consumed. The immediate path composites through the 2D engine right away
//! and is taken whenever the pairing cannot represent the request: extra
//! layers, a custom color conversion matrix, a scale the engine cannot do in
//! one pass, or the configuration forcing it.

use std::sync::Arc;

use log::trace;

use crate::config::Config;
use crate::error::Result;
use crate::error::VdpError;
use crate::g2d;
use crate::pixbuf::Rect;
use crate::surface;
use crate::surface::Surface;
use crate::surface::SurfaceKind;
use crate::surface::SurfaceState;
use crate::sync::Mutex;

/// Largest single-pass scale factor, either direction.
const MAX_SCALE_FACTOR: u32 = 4;

/// A 3x4 color conversion matrix. Row-major, last column is the offset.
pub type CscMatrix = [[f32; 4]; 3];

const CSC_IDENTITY: CscMatrix = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
];

fn csc_is_identity(matrix: &CscMatrix) -> bool {
    matrix
        .iter()
        .flatten()
        .zip(CSC_IDENTITY.iter().flatten())
        .all(|(a, b)| (a - b).abs() < 1e-6)
}

/// An extra surface composited over the video.
pub struct OutputLayer {
    pub source: Arc<Surface>,
    pub src_rect: Option<Rect>,
    pub dst_rect: Option<Rect>,
}

struct MixerState {
    background: u32,
    csc_identity: bool,
}

pub struct Mixer {
    config: Config,
    state: Mutex<MixerState>,
}

impl Mixer {
    pub fn new(config: &Config) -> Mixer {
        Mixer {
            config: config.clone(),
            state: Mutex::new(MixerState {
                background: 0xff00_0000,
                csc_identity: true,
            }),
        }
    }

    pub fn set_background_color(&self, color: u32) {
        self.state.lock().background = color;
    }

    /// `None` restores the identity matrix. Any non-identity matrix forces
    /// the immediate compositing path; the 2D engine has no CSC stage.
    pub fn set_csc_matrix(&self, matrix: Option<CscMatrix>) {
        self.state.lock().csc_identity = match matrix {
            None => true,
            Some(m) => csc_is_identity(&m),
        };
    }

    /// Renders `video` (and any `layers`) onto `output`.
    pub fn render(
        &self,
        video: &Arc<Surface>,
        output: &Arc<Surface>,
        src_rect: Option<Rect>,
        dst_rect: Option<Rect>,
        layers: &[OutputLayer],
    ) -> Result<()> {
        if video.kind() != SurfaceKind::Video {
            return Err(VdpError::InvalidParameter("mixer video surface kind"));
        }
        if output.kind() != SurfaceKind::Output {
            return Err(VdpError::InvalidParameter("mixer output surface kind"));
        }
        let src = src_rect.unwrap_or_else(|| Rect::whole(video.width(), video.height()));
        let dst = dst_rect.unwrap_or_else(|| Rect::whole(output.width(), output.height()));
        if src.width == 0 || src.height == 0 || dst.width == 0 || dst.height == 0 {
            return Err(VdpError::InvalidRect);
        }

        let (background, csc_identity) = {
            let state = self.state.lock();
            (state.background, state.csc_identity)
        };
        let full_output = dst == Rect::whole(output.width(), output.height());

        if self.fast_path_eligible(csc_identity, &src, &dst, layers) {
            trace!("mixer: deferring video transfer");
            let pending_background = if full_output { None } else { Some(background) };
            return surface::create_shared(
                video.clone(),
                output.clone(),
                src,
                dst,
                pending_background,
            );
        }

        trace!("mixer: immediate composite");
        // This path overwrites the output now, so any deferred transfer
        // aimed at it is stale.
        surface::kill_shared(output);
        let mut output_state = output.lock_state();
        let SurfaceState { pixbuf, stream, .. } = &mut *output_state;
        stream.begin()?;
        let result = (|| {
            if !full_output {
                g2d::clear(
                    stream,
                    pixbuf,
                    &Rect::whole(output.width(), output.height()),
                    background,
                )?;
            }
            {
                let video_state = video.lock_state();
                g2d::scaled_blit(stream, pixbuf, &dst, &video_state.pixbuf, &src)?;
            }
            for layer in layers {
                let layer_src = layer
                    .src_rect
                    .unwrap_or_else(|| Rect::whole(layer.source.width(), layer.source.height()));
                let layer_dst = layer.dst_rect.unwrap_or(dst);
                let layer_state = layer.source.lock_state();
                g2d::scaled_blit(stream, pixbuf, &layer_dst, &layer_state.pixbuf, &layer_src)?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => {
                stream.end()?;
                stream.flush()?;
                pixbuf.check_guard();
                Ok(())
            }
            Err(e) => {
                stream.abort();
                Err(e)
            }
        }
    }

    fn fast_path_eligible(
        &self,
        csc_identity: bool,
        src: &Rect,
        dst: &Rect,
        layers: &[OutputLayer],
    ) -> bool {
        if self.config.force_software_compose || !csc_identity || !layers.is_empty() {
            return false;
        }
        scale_in_range(src.width, dst.width) && scale_in_range(src.height, dst.height)
    }
}

fn scale_in_range(src: u32, dst: u32) -> bool {
    dst <= src * MAX_SCALE_FACTOR && src <= dst * MAX_SCALE_FACTOR
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host1x::DummyChannel;
    use crate::mem::fake::FakeAllocator;
    use crate::pixbuf::PixelFormat;

    fn make(kind: SurfaceKind, width: u32, height: u32) -> (Arc<DummyChannel>, Arc<Surface>) {
        let format = if kind == SurfaceKind::Video {
            PixelFormat::Yuv420
        } else {
            PixelFormat::Argb8888
        };
        let channel = Arc::new(DummyChannel::new());
        let surface = Surface::new(
            1,
            &FakeAllocator::new(),
            channel.clone(),
            &Config::default(),
            kind,
            width,
            height,
            format,
        )
        .unwrap();
        (channel, surface)
    }

    #[test]
    fn eligible_render_defers_the_copy() {
        let mixer = Mixer::new(&Config::default());
        let (_, video) = make(SurfaceKind::Video, 64, 64);
        let (output_channel, output) = make(SurfaceKind::Output, 128, 128);
        mixer.render(&video, &output, None, None, &[]).unwrap();
        assert!(surface::has_shared(&output));
        assert_eq!(output_channel.submitted_count(), 0);
    }

    #[test]
    fn forced_software_compose_is_immediate() {
        let config = Config {
            force_software_compose: true,
            ..Default::default()
        };
        let mixer = Mixer::new(&config);
        let (_, video) = make(SurfaceKind::Video, 64, 64);
        let (output_channel, output) = make(SurfaceKind::Output, 64, 64);
        mixer.render(&video, &output, None, None, &[]).unwrap();
        assert!(!surface::has_shared(&output));
        assert_eq!(output_channel.submitted_count(), 1);
    }

    #[test]
    fn custom_csc_matrix_disables_fast_path() {
        let mixer = Mixer::new(&Config::default());
        let mut matrix = CSC_IDENTITY;
        matrix[0][3] = 0.5;
        mixer.set_csc_matrix(Some(matrix));
        let (_, video) = make(SurfaceKind::Video, 64, 64);
        let (output_channel, output) = make(SurfaceKind::Output, 64, 64);
        mixer.render(&video, &output, None, None, &[]).unwrap();
        assert!(!surface::has_shared(&output));
        assert_eq!(output_channel.submitted_count(), 1);

        // Restoring identity restores the fast path.
        mixer.set_csc_matrix(None);
        mixer.render(&video, &output, None, None, &[]).unwrap();
        assert!(surface::has_shared(&output));
    }

    #[test]
    fn extreme_scale_falls_back() {
        let mixer = Mixer::new(&Config::default());
        let (_, video) = make(SurfaceKind::Video, 512, 512);
        let (output_channel, output) = make(SurfaceKind::Output, 64, 64);
        mixer.render(&video, &output, None, None, &[]).unwrap();
        assert!(!surface::has_shared(&output));
        assert_eq!(output_channel.submitted_count(), 1);
    }

    #[test]
    fn layers_force_immediate_composite() {
        let mixer = Mixer::new(&Config::default());
        let (_, video) = make(SurfaceKind::Video, 64, 64);
        let (_, overlay) = make(SurfaceKind::Bitmap, 16, 16);
        let (output_channel, output) = make(SurfaceKind::Output, 64, 64);
        let layers = [OutputLayer {
            source: overlay,
            src_rect: None,
            dst_rect: Some(Rect::new(0, 0, 16, 16)),
        }];
        mixer.render(&video, &output, None, None, &layers).unwrap();
        assert!(!surface::has_shared(&output));
        assert_eq!(output_channel.submitted_count(), 1);
    }

    #[test]
    fn rejected_composite_submits_nothing() {
        let mixer = Mixer::new(&Config::default());
        let (_, video) = make(SurfaceKind::Video, 64, 64);
        let (_, overlay) = make(SurfaceKind::Bitmap, 16, 16);
        let (output_channel, output) = make(SurfaceKind::Output, 64, 64);
        // Layer destination hangs off the output's edge.
        let layers = [OutputLayer {
            source: overlay,
            src_rect: None,
            dst_rect: Some(Rect::new(60, 60, 16, 16)),
        }];
        assert!(matches!(
            mixer.render(&video, &output, None, None, &layers),
            Err(VdpError::InvalidRect)
        ));
        assert_eq!(output_channel.submitted_count(), 0);
    }

    #[test]
    fn wrong_surface_kinds_rejected() {
        let mixer = Mixer::new(&Config::default());
        let (_, bitmap) = make(SurfaceKind::Bitmap, 64, 64);
        let (_, output) = make(SurfaceKind::Output, 64, 64);
        assert!(matches!(
            mixer.render(&bitmap, &output, None, None, &[]),
            Err(VdpError::InvalidParameter(_))
        ));
        let (_, video) = make(SurfaceKind::Video, 64, 64);
        assert!(matches!(
            mixer.render(&video, &bitmap, None, None, &[]),
            Err(VdpError::InvalidParameter(_))
        ));
    }
}
