//! Shadow Pass
//!
//! Renders every shadow-casting light's map before the main passes. Casters
//! draw with a per-material depth variant (directional and spot lights) or a
//! distance variant (point lights); the variant keeps the source's alpha
//! test, alpha maps and, when `clip_shadows` is set, its clipping planes.
//!
//! Point lights render six faces into one map laid out as a 4x2 atlas:
//!
//! ```text
//! +----+----+----+----+
//! |    | -Y |    | +Y |
//! +----+----+----+----+
//! | -X | -Z | +X | +Z |
//! +----+----+----+----+
//! ```

use rustc_hash::{FxHashMap, FxHashSet};
use wgpu::ColorWrites;

use super::{FrameContext, PassConfig, ViewData, draw_item};
use crate::renderer::PassPhase;
use crate::renderer::device::BufferMask;
use crate::renderer::lights::{ShadowCaster, ShadowKind};
use crate::renderer::program::ProgramContext;
use crate::renderer::render_list::ListFilter;
use crate::renderer::state::StateLocks;
use crate::renderer::targets::RenderTargetDesc;
use crate::resources::{
    ColorSpace, DepthPacking, Material, MaterialId, MaterialKind, MaterialMaps, MaterialSettings,
    RenderTargetId, TextureSource, UniformValue,
};
use crate::scene::{Camera, NodeHandle, Viewport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct VariantKey {
    source: MaterialId,
    /// Point lights get one variant each; the light position is a uniform
    light: Option<NodeHandle>,
}

#[derive(Debug)]
struct Variant {
    source_version: u64,
    material: Material,
}

#[derive(Debug, Default)]
pub(crate) struct ShadowPass {
    maps: FxHashMap<NodeHandle, RenderTargetId>,
    variants: FxHashMap<VariantKey, Variant>,
}

impl ShadowPass {
    pub fn new() -> Self {
        Self::default()
    }

    /// Renders all maps and returns the sampler bindings for the main
    /// passes.
    pub fn render(
        &mut self,
        frame: &mut FrameContext<'_>,
        casters: &[ShadowCaster],
    ) -> Vec<(String, UniformValue)> {
        self.release_stale(frame, casters);
        if casters.is_empty() {
            return Vec::new();
        }

        let pass = PassConfig {
            phase: PassPhase::Shadow,
            ctx: ProgramContext {
                output_color_space: ColorSpace::LinearSrgb,
                local_clipping: frame.settings.local_clipping_enabled,
                precision: frame.settings.precision,
                ..ProgramContext::default()
            },
            offscreen: true,
            frame_uniforms: Vec::new(),
            lights_buffer: None,
        };

        let mut bindings = Vec::with_capacity(casters.len());
        for caster in casters {
            let Some(target) = self.map_for(frame, caster) else {
                continue;
            };
            let framebuffer = match frame.targets.ensure(frame.device, target) {
                Ok(framebuffer) => framebuffer,
                Err(err) => {
                    log::warn!("Shadow map of light {:?} unavailable: {err}", caster.node);
                    continue;
                }
            };

            frame.state.bind_framebuffer(frame.device, Some(framebuffer));
            frame.state.set_viewport(
                frame.device,
                Viewport::new(0, 0, caster.map_width, caster.map_height),
            );
            frame.state.set_clear_color(frame.device, wgpu::Color::WHITE);
            frame.state.set_color_mask(frame.device, ColorWrites::ALL);
            frame.state.set_depth_write(frame.device, true);
            frame.device.clear(BufferMask::COLOR | BufferMask::DEPTH);
            // Packed depth goes to the color attachment whatever the material says.
            frame.state.lock(StateLocks::COLOR_MASK);

            for face in &caster.faces {
                self.render_face(frame, caster, &face.camera, face.viewport, &pass);
            }

            frame.state.unlock(StateLocks::COLOR_MASK);
            bindings.push((
                caster.uniform_name.clone(),
                UniformValue::Texture(TextureSource::Target(target)),
            ));
        }
        bindings
    }

    fn render_face(
        &mut self,
        frame: &mut FrameContext<'_>,
        caster: &ShadowCaster,
        camera: &Camera,
        viewport: Viewport,
        pass: &PassConfig,
    ) {
        frame.state.set_viewport(frame.device, viewport);
        let view = ViewData::new(camera, viewport, &[]);

        let mut list = frame.lists.take(camera.id());
        frame
            .builder
            .build(frame.scene, camera, ListFilter::ShadowCasters, true, &mut list);

        for item in list.opaque() {
            let Some(source) = frame.scene.material(item.material) else {
                continue;
            };
            if !source.settings().visible {
                continue;
            }
            let variant = self.variant(source, caster);
            let side = variant.settings().side;
            draw_item(frame, item, variant, side, &view, pass);
        }

        frame.lists.put(camera.id(), list);
    }

    /// Map target for `caster`, created or resized to the caster's size.
    fn map_for(
        &mut self,
        frame: &mut FrameContext<'_>,
        caster: &ShadowCaster,
    ) -> Option<RenderTargetId> {
        let caps = frame.device.capabilities();
        let (width, height) = (caster.map_width, caster.map_height);

        if let Some(&id) = self.maps.get(&caster.node)
            && frame.targets.contains(id)
        {
            return match frame.targets.resize(caps, id, width, height) {
                Ok(_) => Some(id),
                Err(err) => {
                    log::warn!("Shadow map of light {:?} not resized: {err}", caster.node);
                    None
                }
            };
        }

        let desc = RenderTargetDesc {
            color: Some(wgpu::TextureFormat::Rgba8Unorm),
            depth: true,
            ..RenderTargetDesc::new(width, height)
        };
        match frame.targets.create(caps, desc) {
            Ok(id) => {
                self.maps.insert(caster.node, id);
                Some(id)
            }
            Err(err) => {
                log::warn!("Shadow map of light {:?} not created: {err}", caster.node);
                None
            }
        }
    }

    /// Depth or distance material standing in for `source`.
    fn variant(&mut self, source: &Material, caster: &ShadowCaster) -> &Material {
        let key = VariantKey {
            source: source.id(),
            light: (caster.kind == ShadowKind::Point).then_some(caster.node),
        };

        let variant = self.variants.entry(key).or_insert_with(|| Variant {
            source_version: source.version(),
            material: shadow_material(source, caster),
        });
        // Updated in place so the variant keeps its identity and program.
        if variant.source_version != source.version() {
            let fresh = shadow_material(source, caster);
            *variant.material.settings_mut() = fresh.settings().clone();
            *variant.material.maps_mut() = *fresh.maps();
            *variant.material.kind_mut() = fresh.kind().clone();
            variant.source_version = source.version();
        }
        if let MaterialKind::Distance {
            reference_position,
            near,
            far,
        } = variant.material.kind()
            && (*reference_position, *near, *far)
                != (caster.light_position, caster.camera_near, caster.camera_far)
        {
            *variant.material.kind_mut() = distance_kind(caster);
        }
        &variant.material
    }

    /// Frees maps and point-light variants of lights that stopped casting.
    fn release_stale(&mut self, frame: &mut FrameContext<'_>, casters: &[ShadowCaster]) {
        let live: FxHashSet<NodeHandle> = casters.iter().map(|c| c.node).collect();

        self.maps.retain(|node, id| {
            if live.contains(node) {
                return true;
            }
            frame.targets.dispose(frame.device, *id);
            false
        });
        self.variants.retain(|key, variant| {
            if key.light.is_none_or(|node| live.contains(&node)) {
                return true;
            }
            frame
                .bindings
                .dispose_material(frame.device, frame.programs, variant.material.id());
            false
        });
    }

    /// Drops the variants of a disposed material. Returns their ids so the
    /// caller can release their programs.
    pub fn forget_material(&mut self, source: MaterialId) -> Vec<MaterialId> {
        let mut ids = Vec::new();
        self.variants.retain(|key, variant| {
            if key.source != source {
                return true;
            }
            ids.push(variant.material.id());
            false
        });
        ids
    }

    /// Ids of every variant material, for teardown.
    pub fn variant_ids(&self) -> impl Iterator<Item = MaterialId> + '_ {
        self.variants.values().map(|v| v.material.id())
    }

    pub fn clear(&mut self) {
        self.maps.clear();
        self.variants.clear();
    }
}

fn distance_kind(caster: &ShadowCaster) -> MaterialKind {
    MaterialKind::Distance {
        reference_position: caster.light_position,
        near: caster.camera_near,
        far: caster.camera_far,
    }
}

fn shadow_material(source: &Material, caster: &ShadowCaster) -> Material {
    let kind = match caster.kind {
        ShadowKind::Point => distance_kind(caster),
        ShadowKind::Directional | ShadowKind::Spot => MaterialKind::Depth {
            packing: DepthPacking::Rgba,
        },
    };

    let s = source.settings();
    let settings = MaterialSettings {
        side: s.shadow_side.unwrap_or_else(|| s.side.shadow_default()),
        alpha_test: s.alpha_test,
        clipping_planes: if s.clip_shadows {
            s.clipping_planes.clone()
        } else {
            Vec::new()
        },
        clip_intersection: s.clip_intersection,
        ..MaterialSettings::default()
    };
    let maps = MaterialMaps {
        map: source.maps().map,
        alpha_map: source.maps().alpha_map,
        displacement_map: source.maps().displacement_map,
        ..MaterialMaps::default()
    };

    let mut material = Material::new(kind).with_settings(settings).with_maps(maps);
    material.name = format!("{} (shadow)", source.name);
    material
}
