//! Forward Renderer
//!
//! [`Renderer`] owns every cache and mirror of one GPU context and drives a
//! frame through a fixed pass order:
//!
//! ```text
//! Idle ─> Shadow ─> Transmission(0..n) ─> Opaque ─> Transparent ─> Idle
//! ```
//!
//! The shadow and transmission passes are skipped when there is nothing for
//! them to do. Per-draw failures degrade that draw only. A lost context
//! aborts the frame; all device-side caches are forgotten and rebuilt lazily
//! once the context is back.
//!
//! Submodules:
//! - [`device`]: the GL-style [`GpuDevice`] trait and the recording
//!   [`HeadlessDevice`]
//! - [`state`]: redundant-state elimination ([`StateDiffer`])
//! - [`uniforms`]: per-program uniform diffing and texture units
//! - [`program`]: program keys, shader generation and the [`ProgramCache`]
//! - [`lights`]: light aggregation and shadow cameras
//! - [`render_list`]: traversal, culling, bucketing and sorting
//! - [`targets`]: offscreen render targets

pub mod device;
pub mod lights;
pub(crate) mod materials;
pub(crate) mod passes;
pub mod program;
pub mod readback;
pub mod render_list;
pub(crate) mod resources;
pub mod settings;
pub mod state;
pub mod targets;
pub mod uniforms;

use glam::Vec4;

pub use device::{DeviceCapabilities, DeviceCommand, GpuDevice, HeadlessDevice, PixelRect};
pub use lights::LightsState;
pub use passes::DrawRecord;
pub use program::{ProgramCache, ProgramId, ProgramKey, ProgramParameters, ShaderDiagnostics};
pub use readback::ReadPixelsFuture;
pub use render_list::{DrawItem, RenderList, RenderListBuilder, RenderLists};
pub use settings::{Precision, RendererSettings, ShadowMapType, ToneMapping};
pub use state::StateDiffer;
pub use targets::{RenderTargetDesc, RenderTargetManager};
pub use uniforms::UniformBinder;

pub use crate::resources::{RenderTargetId, UniformValue};

use crate::errors::{RenderError, Result};
use crate::renderer::device::{BufferMask, BufferTarget, GpuBuffer};
use crate::renderer::materials::MaterialBindings;
use crate::renderer::passes::shadow::ShadowPass;
use crate::renderer::passes::transmission::TransmissionPass;
use crate::renderer::passes::{FrameContext, PassConfig, ViewData};
use crate::renderer::program::{FogKind, ProgramContext};
use crate::renderer::render_list::ListFilter;
use crate::renderer::resources::{GeometryCache, TextureCache};
use crate::resources::{GeometryHandle, MaterialId, TextureHandle};
use crate::scene::{Camera, CameraId, Fog, Scene, Viewport};
use crate::utils::interner;

// ============================================================================
// Frame state and statistics
// ============================================================================

/// Where the renderer is within a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PassPhase {
    #[default]
    Idle,
    Shadow,
    /// Transmission background of the n-th view
    Transmission(u32),
    Opaque,
    Transparent,
}

/// Statistics of the last frame plus cache totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderInfo {
    /// Frames rendered so far
    pub frame: u64,
    pub draw_calls: u32,
    pub triangles: u64,
    pub lines: u64,
    pub points: u64,
    /// Live cached programs
    pub programs: usize,
    /// Program builds attempted so far
    pub compile_events: u64,
}

impl RenderInfo {
    fn begin_frame(&mut self) {
        self.frame += 1;
        self.draw_calls = 0;
        self.triangles = 0;
        self.lines = 0;
        self.points = 0;
    }

    pub(crate) fn record_draw(
        &mut self,
        topology: wgpu::PrimitiveTopology,
        count: u32,
        instances: u32,
    ) {
        use wgpu::PrimitiveTopology as T;

        self.draw_calls += 1;
        let count = u64::from(count);
        let primitives = match topology {
            T::TriangleList => count / 3,
            T::TriangleStrip => count.saturating_sub(2),
            T::LineList => count / 2,
            T::LineStrip => count.saturating_sub(1),
            T::PointList => count,
        };
        let primitives = primitives * u64::from(instances);
        match topology {
            T::TriangleList | T::TriangleStrip => self.triangles += primitives,
            T::LineList | T::LineStrip => self.lines += primitives,
            T::PointList => self.points += primitives,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LightsBuffer {
    buffer: GpuBuffer,
    len: usize,
}

// ============================================================================
// Renderer
// ============================================================================

/// Forward renderer bound to one GPU context.
///
/// ```rust,ignore
/// let device = HeadlessDevice::new(800, 600);
/// let mut renderer = Renderer::new(device, RendererSettings::default())?;
/// renderer.render(&mut scene, &camera);
/// println!("{} draw calls", renderer.info().draw_calls);
/// ```
pub struct Renderer<D: GpuDevice> {
    device: D,
    settings: RendererSettings,

    state: StateDiffer,
    binder: UniformBinder,
    programs: ProgramCache,
    bindings: MaterialBindings,
    textures: TextureCache,
    geometries: GeometryCache,
    targets: RenderTargetManager,

    lights: LightsState,
    lights_buffer: Option<LightsBuffer>,
    builder: RenderListBuilder,
    lists: RenderLists,
    shadows: ShadowPass,
    transmission: TransmissionPass,

    render_target: Option<RenderTargetId>,
    viewport: Option<Viewport>,
    phase: PassPhase,
    info: RenderInfo,
    draw_log: Vec<DrawRecord>,
    context_lost: bool,
}

impl<D: GpuDevice> Renderer<D> {
    /// Creates a renderer. Invalid settings are rejected here.
    pub fn new(device: D, settings: RendererSettings) -> Result<Self> {
        settings.validate()?;
        interner::preload_common_defines();

        let max_texture_units = device.capabilities().max_texture_units;
        log::debug!(
            "Renderer created ({max_texture_units} texture units, {:?} precision)",
            settings.precision
        );
        Ok(Self {
            device,
            settings,
            state: StateDiffer::new(),
            binder: UniformBinder::new(max_texture_units),
            programs: ProgramCache::new(),
            bindings: MaterialBindings::new(),
            textures: TextureCache::new(),
            geometries: GeometryCache::new(),
            targets: RenderTargetManager::new(),
            lights: LightsState::new(),
            lights_buffer: None,
            builder: RenderListBuilder::new(),
            lists: RenderLists::new(),
            shadows: ShadowPass::new(),
            transmission: TransmissionPass::new(),
            render_target: None,
            viewport: None,
            phase: PassPhase::Idle,
            info: RenderInfo::default(),
            draw_log: Vec::new(),
            context_lost: false,
        })
    }

    // === Frame ===

    /// Renders `scene` from `camera` into the current render target.
    ///
    /// World matrices are brought up to date first. Nothing is drawn while
    /// the context is lost.
    pub fn render(&mut self, scene: &mut Scene, camera: &Camera) {
        self.draw_log.clear();
        if self.device.is_context_lost() {
            self.on_context_lost();
            return;
        }
        if self.context_lost {
            log::info!("GPU context restored; resources will be rebuilt on demand");
            self.context_lost = false;
        }

        scene.update_world_matrices();
        let scene: &Scene = scene;

        self.info.begin_frame();
        self.binder.begin_frame();
        self.bindings
            .prune(&mut self.device, &mut self.programs, scene);
        self.forget_freed_programs();
        self.lights.setup(scene, self.settings.shadow_map.enabled);

        let completed = self.render_frame(scene, camera);
        let evicted = self.lists.evict_unused();
        if evicted > 0 {
            log::debug!("Dropped {evicted} render lists of cameras not drawn this frame");
        }

        self.phase = PassPhase::Idle;
        self.info.programs = self.programs.len();
        self.info.compile_events = self.programs.compile_events();
        if !completed {
            self.on_context_lost();
        }
    }

    /// Runs the passes. Returns `false` when the context was lost midway.
    fn render_frame(&mut self, scene: &Scene, camera: &Camera) -> bool {
        let mut list = self.lists.take(camera.id());
        self.builder.build(
            scene,
            camera,
            ListFilter::Main,
            self.settings.sort_objects,
            &mut list,
        );

        let Self {
            device,
            settings,
            state,
            binder,
            programs,
            bindings,
            textures,
            geometries,
            targets,
            lights,
            lights_buffer,
            builder,
            lists,
            shadows,
            transmission,
            render_target,
            viewport,
            phase,
            info,
            draw_log,
            ..
        } = self;

        let mut frame = FrameContext {
            device,
            scene,
            settings,
            state,
            binder,
            programs,
            bindings,
            textures,
            geometries,
            targets,
            builder,
            lists,
            info,
            draw_log,
        };

        // --- Shadow ---
        *phase = PassPhase::Shadow;
        let shadow_uniforms = shadows.render(&mut frame, lights.shadow_casters());
        if frame.device.is_context_lost() {
            frame.lists.put(camera.id(), list);
            return false;
        }

        // --- Main target ---
        let (framebuffer, size, target_color_space) = match *render_target {
            Some(id) => {
                let framebuffer = match frame.targets.ensure(frame.device, id) {
                    Ok(framebuffer) => framebuffer,
                    Err(err) => {
                        log::error!("Render target unavailable, frame skipped: {err}");
                        frame.lists.put(camera.id(), list);
                        return !frame.device.is_context_lost();
                    }
                };
                let desc = frame.targets.desc(id).copied().unwrap_or_default();
                (Some(framebuffer), (desc.width, desc.height), Some(desc.color_space))
            }
            None => (None, frame.device.drawing_buffer_size(), None),
        };
        let full = Viewport::new(0, 0, size.0, size.1);

        frame.state.bind_framebuffer(frame.device, framebuffer);
        frame
            .state
            .set_viewport(frame.device, viewport.unwrap_or(full));
        auto_clear(&mut frame);

        let (fog, mut frame_uniforms) = fog_uniforms(scene.fog.as_ref());
        frame_uniforms.push((
            String::from("toneMappingExposure"),
            UniformValue::Float(frame.settings.tone_mapping_exposure),
        ));
        frame_uniforms.extend(shadow_uniforms);

        let global_planes: Vec<Vec4> = frame
            .settings
            .clipping_planes
            .iter()
            .map(|p| Vec4::from_array(*p))
            .collect();
        let ctx = ProgramContext {
            lights: lights.counts(),
            shadow_map_enabled: frame.settings.shadow_map.enabled,
            shadow_map_type: frame.settings.shadow_map.kind,
            tone_mapping: if render_target.is_some() {
                ToneMapping::None
            } else {
                frame.settings.tone_mapping
            },
            output_color_space: target_color_space.unwrap_or(frame.settings.output_color_space),
            clipping_planes: global_planes.len() as u32,
            local_clipping: frame.settings.local_clipping_enabled,
            fog,
            precision: frame.settings.precision,
        };

        // --- Views ---
        let views: Vec<(&Camera, Viewport)> = if camera.is_array_camera() {
            camera
                .sub_cameras
                .iter()
                .map(|sub| (sub, sub.viewport.unwrap_or(full)))
                .collect()
        } else {
            vec![(camera, viewport.or(camera.viewport).unwrap_or(full))]
        };

        let view_ids: Vec<CameraId> = views.iter().map(|(c, _)| c.id()).collect();
        transmission.retain_views(&mut frame, &view_ids);

        let mut completed = true;
        for (index, (view_camera, view_viewport)) in views.into_iter().enumerate() {
            let view = ViewData::new(view_camera, view_viewport, &global_planes);
            let changed = lights.setup_view(view.view);
            let buffer = upload_lights(frame.device, lights_buffer, lights.bytes(), changed);

            let mut pass = PassConfig {
                phase: PassPhase::Opaque,
                ctx,
                offscreen: render_target.is_some(),
                frame_uniforms: frame_uniforms.clone(),
                lights_buffer: Some(buffer),
            };

            if list.transmissive().next().is_some() {
                let index = index as u32;
                *phase = PassPhase::Transmission(index);
                if let Some(extra) = transmission.render(&mut frame, &list, &view, &pass, index) {
                    pass.frame_uniforms.extend(extra);
                }
                frame.state.bind_framebuffer(frame.device, framebuffer);
            }
            frame.state.set_viewport(frame.device, view.viewport);

            *phase = PassPhase::Opaque;
            pass.phase = PassPhase::Opaque;
            passes::opaque::render(&mut frame, &list, &view, &pass);

            *phase = PassPhase::Transparent;
            pass.phase = PassPhase::Transparent;
            passes::transparent::render(&mut frame, &list, &view, &pass);

            if frame.device.is_context_lost() {
                completed = false;
                break;
            }
        }

        if completed && let Some(id) = *render_target {
            frame.targets.resolve(frame.device, id);
        }
        frame.lists.put(camera.id(), list);
        completed
    }

    /// Forgets every device object once per loss.
    fn on_context_lost(&mut self) {
        if self.context_lost {
            return;
        }
        log::info!("GPU context lost; rendering is suspended until it is restored");
        self.context_lost = true;
        self.invalidate_device_state();
    }

    fn invalidate_device_state(&mut self) {
        self.programs.invalidate();
        self.bindings.invalidate();
        self.binder.reset();
        self.state.reset();
        self.textures.invalidate();
        self.geometries.invalidate();
        self.targets.invalidate();
        self.lights_buffer = None;
    }

    fn forget_freed_programs(&mut self) {
        for (id, gpu) in self.bindings.take_freed() {
            self.binder.forget(id);
            self.state.forget_program(gpu);
        }
    }

    // === Render targets ===

    /// Selects the target of subsequent frames; `None` renders to the
    /// default framebuffer.
    pub fn set_render_target(&mut self, target: Option<RenderTargetId>) -> Result<()> {
        if let Some(id) = target
            && !self.targets.contains(id)
        {
            return Err(RenderError::InvalidConfiguration(format!(
                "unknown render target {id:?}"
            )));
        }
        self.render_target = target;
        Ok(())
    }

    #[must_use]
    pub fn render_target(&self) -> Option<RenderTargetId> {
        self.render_target
    }

    pub fn create_render_target(&mut self, desc: RenderTargetDesc) -> Result<RenderTargetId> {
        self.targets.create(self.device.capabilities(), desc)
    }

    /// Returns `true` when the size changed; storage follows on next use.
    pub fn resize_render_target(
        &mut self,
        target: RenderTargetId,
        width: u32,
        height: u32,
    ) -> Result<bool> {
        self.targets
            .resize(self.device.capabilities(), target, width, height)
    }

    /// Frees a target. Returns `false` when it was already disposed.
    pub fn dispose_render_target(&mut self, target: RenderTargetId) -> bool {
        if let Some(framebuffer) = self.targets.resolve_framebuffer(target) {
            self.state.forget_framebuffer(framebuffer);
        }
        for texture in [
            self.targets.color_texture(target),
            self.targets.depth_texture(target),
        ]
        .into_iter()
        .flatten()
        {
            self.binder.forget_texture(texture);
        }
        if self.render_target == Some(target) {
            self.render_target = None;
        }
        self.targets.dispose(&mut self.device, target)
    }

    /// Overrides the viewport of the main view; `None` uses the camera's or
    /// the full target.
    pub fn set_viewport(&mut self, viewport: Option<Viewport>) {
        self.viewport = viewport;
    }

    // === Resource disposal ===

    /// Releases the programs held for `material`, including its shadow
    /// variants. Returns `false` when nothing was held, so repeated calls
    /// are no-ops.
    pub fn dispose_material(&mut self, material: MaterialId) -> bool {
        let mut released =
            self.bindings
                .dispose_material(&mut self.device, &mut self.programs, material);
        for variant in self.shadows.forget_material(material) {
            released |=
                self.bindings
                    .dispose_material(&mut self.device, &mut self.programs, variant);
        }
        self.forget_freed_programs();
        released
    }

    pub fn dispose_texture(&mut self, texture: TextureHandle) -> bool {
        let gpu = self.textures.get(texture);
        let disposed = self.textures.dispose(&mut self.device, texture);
        if let Some(gpu) = gpu {
            self.binder.forget_texture(gpu);
        }
        disposed
    }

    pub fn dispose_geometry(&mut self, geometry: GeometryHandle) -> bool {
        self.geometries.dispose(&mut self.device, geometry)
    }

    /// Frees every device object the renderer created. The renderer stays
    /// usable; later frames recreate what they need.
    pub fn dispose(&mut self) {
        if !self.device.is_context_lost() {
            let variants: Vec<MaterialId> = self.shadows.variant_ids().collect();
            for variant in variants {
                self.bindings
                    .dispose_material(&mut self.device, &mut self.programs, variant);
            }
            self.programs.dispose(&mut self.device);
            self.textures.dispose_all(&mut self.device);
            self.geometries.dispose_all(&mut self.device);
            self.targets.dispose_all(&mut self.device);
            if let Some(lights) = self.lights_buffer.take() {
                self.device.delete_buffer(lights.buffer);
            }
        }
        self.invalidate_device_state();
        self.targets = RenderTargetManager::new();
        self.lists.dispose();
        self.shadows.clear();
        self.transmission.clear();
        self.render_target = None;
        self.draw_log.clear();
        log::debug!("Renderer disposed");
    }

    // === Settings and introspection ===

    #[must_use]
    pub fn settings(&self) -> &RendererSettings {
        &self.settings
    }

    /// Replaces the settings after validating them. Programs whose inputs
    /// change are rebuilt on their next draw.
    pub fn set_settings(&mut self, settings: RendererSettings) -> Result<()> {
        settings.validate()?;
        self.settings = settings;
        Ok(())
    }

    #[must_use]
    pub fn info(&self) -> RenderInfo {
        self.info
    }

    #[must_use]
    pub fn phase(&self) -> PassPhase {
        self.phase
    }

    /// Draws of the last frame in submission order.
    #[must_use]
    pub fn draw_log(&self) -> &[DrawRecord] {
        &self.draw_log
    }

    /// Build logs of `material`'s last failed program, if it draws with the
    /// fallback.
    #[must_use]
    pub fn material_diagnostics(&self, material: MaterialId) -> Option<&ShaderDiagnostics> {
        self.bindings.diagnostics(material)
    }

    /// Program `material` was last drawn with.
    #[must_use]
    pub fn material_program(&self, material: MaterialId) -> Option<ProgramId> {
        self.bindings.program_of(material)
    }

    #[must_use]
    pub fn program_cache(&self) -> &ProgramCache {
        &self.programs
    }

    #[must_use]
    pub fn lights(&self) -> &LightsState {
        &self.lights
    }

    #[must_use]
    pub fn render_lists(&self) -> &RenderLists {
        &self.lists
    }

    #[must_use]
    pub fn render_targets(&self) -> &RenderTargetManager {
        &self.targets
    }

    #[must_use]
    pub fn state(&self) -> &StateDiffer {
        &self.state
    }

    #[must_use]
    pub fn is_context_lost(&self) -> bool {
        self.context_lost || self.device.is_context_lost()
    }

    #[must_use]
    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }
}

// ============================================================================
// Frame helpers
// ============================================================================

fn auto_clear(frame: &mut FrameContext<'_>) {
    let settings = frame.settings;
    if !settings.auto_clear {
        return;
    }

    let mut mask = BufferMask::empty();
    if settings.auto_clear_color {
        let color = frame.scene.background.map_or_else(
            || settings.clear_color(),
            |[r, g, b, a]| wgpu::Color {
                r: f64::from(r),
                g: f64::from(g),
                b: f64::from(b),
                a: f64::from(a),
            },
        );
        frame.state.set_clear_color(frame.device, color);
        frame.state.set_color_mask(frame.device, wgpu::ColorWrites::ALL);
        mask |= BufferMask::COLOR;
    }
    if settings.auto_clear_depth {
        frame.state.set_depth_write(frame.device, true);
        mask |= BufferMask::DEPTH;
    }
    if settings.auto_clear_stencil {
        mask |= BufferMask::STENCIL;
    }
    if !mask.is_empty() {
        frame.device.clear(mask);
    }
}

fn fog_uniforms(fog: Option<&Fog>) -> (FogKind, Vec<(String, UniformValue)>) {
    match fog {
        None => (FogKind::None, Vec::new()),
        Some(Fog::Linear { color, near, far }) => (
            FogKind::Linear,
            vec![
                (String::from("fogColor"), UniformValue::Vec3(*color)),
                (String::from("fogNear"), UniformValue::Float(*near)),
                (String::from("fogFar"), UniformValue::Float(*far)),
            ],
        ),
        Some(Fog::Exp2 { color, density }) => (
            FogKind::Exp2,
            vec![
                (String::from("fogColor"), UniformValue::Vec3(*color)),
                (String::from("fogDensity"), UniformValue::Float(*density)),
            ],
        ),
    }
}

/// Writes the `Lights` block, recreating the buffer when its size changed.
fn upload_lights(
    device: &mut dyn GpuDevice,
    slot: &mut Option<LightsBuffer>,
    bytes: &[u8],
    changed: bool,
) -> GpuBuffer {
    match slot {
        Some(current) if current.len == bytes.len() => {
            if changed {
                device.update_buffer(current.buffer, 0, bytes);
            }
            current.buffer
        }
        _ => {
            if let Some(old) = slot.take() {
                device.delete_buffer(old.buffer);
            }
            let buffer = device.create_buffer(BufferTarget::Uniform, bytes);
            *slot = Some(LightsBuffer {
                buffer,
                len: bytes.len(),
            });
            buffer
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statistics_count_primitives_per_topology() {
        let mut info = RenderInfo::default();
        info.record_draw(wgpu::PrimitiveTopology::TriangleList, 36, 1);
        info.record_draw(wgpu::PrimitiveTopology::TriangleStrip, 4, 3);
        info.record_draw(wgpu::PrimitiveTopology::LineList, 8, 1);
        info.record_draw(wgpu::PrimitiveTopology::PointList, 5, 2);

        assert_eq!(info.draw_calls, 4);
        assert_eq!(info.triangles, 12 + 6);
        assert_eq!(info.lines, 4);
        assert_eq!(info.points, 10);

        info.begin_frame();
        assert_eq!(info.draw_calls, 0);
        assert_eq!(info.frame, 1);
    }

    #[test]
    fn invalid_settings_are_rejected_on_construction() {
        let settings = RendererSettings {
            tone_mapping_exposure: -1.0,
            ..RendererSettings::default()
        };
        let result = Renderer::new(HeadlessDevice::new(4, 4), settings);
        assert!(matches!(result, Err(RenderError::InvalidConfiguration(_))));
    }

    #[test]
    fn lights_block_is_recreated_only_on_size_change() {
        let mut device = HeadlessDevice::new(4, 4);
        let mut slot = None;
        let a = upload_lights(&mut device, &mut slot, &[0; 16], true);
        let b = upload_lights(&mut device, &mut slot, &[1; 16], true);
        assert_eq!(a, b);
        let c = upload_lights(&mut device, &mut slot, &[0; 32], true);
        assert_ne!(a, c);
        assert_eq!(device.live_buffers(), 1);
    }
}
