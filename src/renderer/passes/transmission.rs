//! Transmission Pass
//!
//! Transmissive materials sample what lies behind them. Before any
//! transmissive item is drawn, the opaque list is rendered into an offscreen
//! target, back faces of double-sided transmissive items are added on top,
//! and the target is resolved with mipmaps. The main passes then bind it as
//! `transmissionSamplerMap`.

use glam::Vec2;
use rustc_hash::FxHashMap;
use wgpu::ColorWrites;

use super::{FrameContext, PassConfig, ViewData, draw_item, material_for};
use crate::renderer::PassPhase;
use crate::renderer::device::BufferMask;
use crate::renderer::program::ProgramContext;
use crate::renderer::render_list::RenderList;
use crate::renderer::settings::ToneMapping;
use crate::renderer::targets::RenderTargetDesc;
use crate::resources::{ColorSpace, RenderTargetId, Side, TextureSource, UniformValue};
use crate::scene::{CameraId, Viewport};

/// One offscreen target per view camera, so views of different sizes do
/// not fight over a single allocation.
#[derive(Debug, Default)]
pub(crate) struct TransmissionPass {
    targets: FxHashMap<CameraId, RenderTargetId>,
}

impl TransmissionPass {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn target(&self, camera: CameraId) -> Option<RenderTargetId> {
        self.targets.get(&camera).copied()
    }

    /// Disposes the targets of view cameras not in `views`.
    pub fn retain_views(&mut self, frame: &mut FrameContext<'_>, views: &[CameraId]) {
        self.targets.retain(|camera, target| {
            if views.contains(camera) {
                return true;
            }
            frame.targets.dispose(frame.device, *target);
            log::debug!("Released transmission target of camera {camera:?}");
            false
        });
    }

    /// Renders the background of `list`'s transmissive items for one view.
    /// Returns the uniforms that sample it, or `None` when nothing was drawn.
    pub fn render(
        &mut self,
        frame: &mut FrameContext<'_>,
        list: &RenderList,
        view: &ViewData,
        main: &PassConfig,
        index: u32,
    ) -> Option<Vec<(String, UniformValue)>> {
        if list.transmissive().next().is_none() {
            return None;
        }

        let scale = frame.settings.transmission.resolution_scale;
        let (width, height) = target_size(view.viewport, scale);
        let target = self.ensure_target(frame, view.camera, width, height)?;
        let framebuffer = match frame.targets.ensure(frame.device, target) {
            Ok(framebuffer) => framebuffer,
            Err(err) => {
                log::warn!("Transmission target unavailable: {err}");
                return None;
            }
        };

        let viewport = Viewport::new(0, 0, width, height);
        frame.state.bind_framebuffer(frame.device, Some(framebuffer));
        frame.state.set_viewport(frame.device, viewport);
        frame
            .state
            .set_clear_color(frame.device, frame.settings.clear_color());
        frame.state.set_color_mask(frame.device, ColorWrites::ALL);
        frame.state.set_depth_write(frame.device, true);
        frame.device.clear(BufferMask::COLOR | BufferMask::DEPTH);

        let pass = PassConfig {
            phase: PassPhase::Transmission(index),
            ctx: ProgramContext {
                tone_mapping: ToneMapping::None,
                output_color_space: ColorSpace::LinearSrgb,
                ..main.ctx
            },
            offscreen: true,
            frame_uniforms: main.frame_uniforms.clone(),
            lights_buffer: main.lights_buffer,
        };
        let offscreen_view = ViewData {
            viewport,
            ..view.clone()
        };

        for item in list.opaque() {
            let Some(material) = material_for(frame.scene, item) else {
                continue;
            };
            draw_item(frame, item, material, material.settings().side, &offscreen_view, &pass);
        }
        for item in list.transmissive() {
            let Some(material) = material_for(frame.scene, item) else {
                continue;
            };
            if material.settings().side == Side::Double {
                draw_item(frame, item, material, Side::Back, &offscreen_view, &pass);
            }
        }

        frame.targets.resolve(frame.device, target);

        Some(vec![
            (
                String::from("transmissionSamplerMap"),
                UniformValue::Texture(TextureSource::Target(target)),
            ),
            (
                String::from("transmissionSamplerSize"),
                UniformValue::Vec2(Vec2::new(width as f32, height as f32)),
            ),
        ])
    }

    fn ensure_target(
        &mut self,
        frame: &mut FrameContext<'_>,
        camera: CameraId,
        width: u32,
        height: u32,
    ) -> Option<RenderTargetId> {
        let caps = frame.device.capabilities();

        if let Some(&id) = self.targets.get(&camera)
            && frame.targets.contains(id)
        {
            return match frame.targets.resize(caps, id, width, height) {
                Ok(_) => Some(id),
                Err(err) => {
                    log::warn!("Transmission target not resized: {err}");
                    None
                }
            };
        }

        let float = wgpu::TextureFormat::Rgba16Float;
        let color = if caps.float_render_targets && caps.supports_format(float) {
            float
        } else {
            wgpu::TextureFormat::Rgba8Unorm
        };
        let requested = frame.settings.transmission.samples.max(1);
        let desc = RenderTargetDesc {
            color: Some(color),
            samples: requested.min(caps.max_samples.max(1)),
            mipmaps: true,
            ..RenderTargetDesc::new(width, height)
        };

        match frame.targets.create(caps, desc) {
            Ok(id) => {
                log::debug!(
                    "Created transmission target {width}x{height} ({color:?}, {} samples)",
                    desc.samples
                );
                self.targets.insert(camera, id);
                Some(id)
            }
            Err(err) => {
                log::warn!("Transmission target not created: {err}");
                None
            }
        }
    }

    pub fn clear(&mut self) {
        self.targets.clear();
    }
}

fn target_size(viewport: Viewport, scale: f32) -> (u32, u32) {
    let scaled = |v: u32| ((v as f32 * scale).round() as u32).max(1);
    (scaled(viewport.width), scaled(viewport.height))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_size_scales_with_the_viewport() {
        assert_eq!(target_size(Viewport::new(0, 0, 800, 600), 0.5), (400, 300));
        assert_eq!(target_size(Viewport::new(0, 0, 1, 1), 0.25), (1, 1));
    }
}
