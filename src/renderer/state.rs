//! Fixed-Function State Tracking
//!
//! [`StateDiffer`] mirrors the device's blend, depth, stencil, cull and
//! viewport state and forwards a setter to the device only when the value
//! differs from the mirror. Every fixed-function change in the pipeline goes
//! through here, so the mirror always equals the actual device state.
//!
//! Sub-states can be locked (see [`StateLocks`]); a locked sub-state ignores
//! every set until it is unlocked. The shadow pass uses this to pin the color
//! mask while per-material depth state keeps flowing.

use rustc_hash::FxHashMap;
use wgpu::{BlendFactor as F, BlendOperation, ColorWrites, CompareFunction, Face, FrontFace};

use super::device::{Capability, GpuBuffer, GpuDevice, GpuFramebuffer, GpuProgram};
use crate::resources::{Blending, MaterialSettings, PolygonOffset, Side, StencilSettings};
use crate::scene::Viewport;

bitflags::bitflags! {
    /// Sub-states that can be frozen.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StateLocks: u8 {
        const COLOR_MASK = 1 << 0;
        const DEPTH      = 1 << 1;
        const STENCIL    = 1 << 2;
    }
}

const CAPABILITY_COUNT: usize = 6;

fn capability_index(capability: Capability) -> usize {
    match capability {
        Capability::Blend => 0,
        Capability::DepthTest => 1,
        Capability::CullFace => 2,
        Capability::StencilTest => 3,
        Capability::PolygonOffsetFill => 4,
        Capability::AlphaToCoverage => 5,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlendFunc {
    pub equation_color: BlendOperation,
    pub equation_alpha: BlendOperation,
    pub src_color: F,
    pub dst_color: F,
    pub src_alpha: F,
    pub dst_alpha: F,
}

impl BlendFunc {
    const fn add(src_color: F, dst_color: F, src_alpha: F, dst_alpha: F) -> Self {
        Self {
            equation_color: BlendOperation::Add,
            equation_alpha: BlendOperation::Add,
            src_color,
            dst_color,
            src_alpha,
            dst_alpha,
        }
    }

    /// Factors for a blending mode; `None` for [`Blending::None`].
    #[must_use]
    pub fn for_blending(blending: &Blending, premultiplied: bool) -> Option<Self> {
        let func = match (blending, premultiplied) {
            (Blending::None, _) => return None,
            (Blending::Normal, true) => {
                Self::add(F::One, F::OneMinusSrcAlpha, F::One, F::OneMinusSrcAlpha)
            }
            (Blending::Normal, false) => {
                Self::add(F::SrcAlpha, F::OneMinusSrcAlpha, F::One, F::OneMinusSrcAlpha)
            }
            (Blending::Additive, true) => Self::add(F::One, F::One, F::One, F::One),
            (Blending::Additive, false) => Self::add(F::SrcAlpha, F::One, F::SrcAlpha, F::One),
            (Blending::Subtractive, true) => {
                Self::add(F::Zero, F::OneMinusSrc, F::Zero, F::OneMinusSrcAlpha)
            }
            (Blending::Subtractive, false) => Self::add(F::Zero, F::OneMinusSrc, F::Zero, F::One),
            (Blending::Multiply, true) => Self::add(F::Zero, F::Src, F::Zero, F::SrcAlpha),
            (Blending::Multiply, false) => Self::add(F::Zero, F::Src, F::Zero, F::Src),
            (Blending::Custom(custom), _) => Self {
                equation_color: custom.equation,
                equation_alpha: custom.equation_alpha.unwrap_or(custom.equation),
                src_color: custom.src,
                dst_color: custom.dst,
                src_alpha: custom.src_alpha.unwrap_or(custom.src),
                dst_alpha: custom.dst_alpha.unwrap_or(custom.dst),
            },
        };
        Some(func)
    }
}

/// Mirror of the device's fixed-function state. `None` means unknown, so
/// the next set always reaches the device.
///
/// Parameters of a disabled sub-state (blend function, stencil, polygon
/// offset) keep the values last written to the device, so re-enabling with
/// the same values costs no calls. [`GpuStateSnapshot::effective`] drops them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GpuStateSnapshot {
    pub capabilities: [Option<bool>; CAPABILITY_COUNT],
    pub blend: Option<BlendFunc>,
    pub depth_func: Option<CompareFunction>,
    pub depth_write: Option<bool>,
    pub color_mask: Option<ColorWrites>,
    pub cull_face: Option<Face>,
    pub front_face: Option<FrontFace>,
    pub stencil_func: Option<(CompareFunction, u32, u32)>,
    pub stencil_op: Option<[wgpu::StencilOperation; 3]>,
    pub stencil_write_mask: Option<u32>,
    pub polygon_offset: Option<(f32, f32)>,
    pub viewport: Option<Viewport>,
    pub clear_color: Option<wgpu::Color>,
}

impl GpuStateSnapshot {
    #[must_use]
    pub fn capability(&self, capability: Capability) -> Option<bool> {
        self.capabilities[capability_index(capability)]
    }

    /// The state that affects drawing: parameters of disabled sub-states
    /// are cleared.
    #[must_use]
    pub fn effective(&self) -> Self {
        let mut state = self.clone();
        if state.capability(Capability::Blend) != Some(true) {
            state.blend = None;
        }
        if state.capability(Capability::StencilTest) != Some(true) {
            state.stencil_func = None;
            state.stencil_op = None;
            state.stencil_write_mask = None;
        }
        if state.capability(Capability::PolygonOffsetFill) != Some(true) {
            state.polygon_offset = None;
        }
        state
    }
}

/// Change-gated fixed-function state.
#[derive(Debug, Default)]
pub struct StateDiffer {
    current: GpuStateSnapshot,
    program: Option<Option<GpuProgram>>,
    framebuffer: Option<Option<GpuFramebuffer>>,
    uniform_blocks: FxHashMap<u32, GpuBuffer>,
    locks: StateLocks,
}

impl StateDiffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn snapshot(&self) -> &GpuStateSnapshot {
        &self.current
    }

    /// Forgets the mirror; the next set of every sub-state reaches the device.
    pub fn reset(&mut self) {
        self.current = GpuStateSnapshot::default();
        self.program = None;
        self.framebuffer = None;
        self.uniform_blocks.clear();
        self.locks = StateLocks::empty();
    }

    // === Locks ===

    pub fn lock(&mut self, locks: StateLocks) {
        self.locks |= locks;
    }

    pub fn unlock(&mut self, locks: StateLocks) {
        self.locks -= locks;
    }

    #[must_use]
    pub fn locks(&self) -> StateLocks {
        self.locks
    }

    // === Material state ===

    /// Applies the full fixed-function state for drawing `settings`.
    pub fn set_material(
        &mut self,
        device: &mut dyn GpuDevice,
        settings: &MaterialSettings,
        front_face_cw: bool,
    ) {
        self.set_material_side(device, settings, settings.side, front_face_cw);
    }

    /// As [`set_material`](Self::set_material) with an overridden side, for
    /// shadow rendering and two-pass transparency.
    pub fn set_material_side(
        &mut self,
        device: &mut dyn GpuDevice,
        settings: &MaterialSettings,
        side: Side,
        front_face_cw: bool,
    ) {
        self.set_cull(device, side, front_face_cw);

        let blending = if matches!(settings.blending, Blending::Normal) && !settings.transparent {
            Blending::None
        } else {
            settings.blending
        };
        self.set_blending(device, &blending, settings.premultiplied_alpha);

        self.set_depth_test(device, settings.depth_test);
        self.set_depth_func(device, settings.depth_func);
        self.set_depth_write(device, settings.depth_write);
        self.set_color_write(device, settings.color_write);
        self.set_stencil(device, settings.stencil.as_ref());
        self.set_polygon_offset(device, settings.polygon_offset);
        self.set_capability(
            device,
            Capability::AlphaToCoverage,
            settings.alpha_to_coverage,
        );
    }

    // === Individual sub-states ===

    pub fn set_capability(&mut self, device: &mut dyn GpuDevice, capability: Capability, on: bool) {
        let slot = &mut self.current.capabilities[capability_index(capability)];
        if *slot != Some(on) {
            device.set_capability(capability, on);
            *slot = Some(on);
        }
    }

    pub fn set_cull(&mut self, device: &mut dyn GpuDevice, side: Side, front_face_cw: bool) {
        if side == Side::Double {
            self.set_capability(device, Capability::CullFace, false);
        } else {
            self.set_capability(device, Capability::CullFace, true);
        }

        let flip = (side == Side::Back) != front_face_cw;
        let front = if flip { FrontFace::Cw } else { FrontFace::Ccw };
        if self.current.front_face != Some(front) {
            device.front_face(front);
            self.current.front_face = Some(front);
        }
        if self.current.cull_face != Some(Face::Back) {
            device.cull_face(Face::Back);
            self.current.cull_face = Some(Face::Back);
        }
    }

    pub fn set_blending(
        &mut self,
        device: &mut dyn GpuDevice,
        blending: &Blending,
        premultiplied: bool,
    ) {
        let Some(func) = BlendFunc::for_blending(blending, premultiplied) else {
            self.set_capability(device, Capability::Blend, false);
            return;
        };
        self.set_capability(device, Capability::Blend, true);

        let previous = self.current.blend;
        if previous.map(|p| (p.equation_color, p.equation_alpha))
            != Some((func.equation_color, func.equation_alpha))
        {
            device.blend_equation(func.equation_color, func.equation_alpha);
        }
        if previous.map(|p| (p.src_color, p.dst_color, p.src_alpha, p.dst_alpha))
            != Some((func.src_color, func.dst_color, func.src_alpha, func.dst_alpha))
        {
            device.blend_func(func.src_color, func.dst_color, func.src_alpha, func.dst_alpha);
        }
        self.current.blend = Some(func);
    }

    pub fn set_depth_test(&mut self, device: &mut dyn GpuDevice, enabled: bool) {
        if !self.locks.contains(StateLocks::DEPTH) {
            self.set_capability(device, Capability::DepthTest, enabled);
        }
    }

    pub fn set_depth_func(&mut self, device: &mut dyn GpuDevice, func: CompareFunction) {
        if self.locks.contains(StateLocks::DEPTH) || self.current.depth_func == Some(func) {
            return;
        }
        device.depth_func(func);
        self.current.depth_func = Some(func);
    }

    pub fn set_depth_write(&mut self, device: &mut dyn GpuDevice, write: bool) {
        if self.locks.contains(StateLocks::DEPTH) || self.current.depth_write == Some(write) {
            return;
        }
        device.depth_mask(write);
        self.current.depth_write = Some(write);
    }

    pub fn set_color_write(&mut self, device: &mut dyn GpuDevice, write: bool) {
        let mask = if write {
            ColorWrites::ALL
        } else {
            ColorWrites::empty()
        };
        self.set_color_mask(device, mask);
    }

    pub fn set_color_mask(&mut self, device: &mut dyn GpuDevice, mask: ColorWrites) {
        if self.locks.contains(StateLocks::COLOR_MASK) || self.current.color_mask == Some(mask) {
            return;
        }
        device.color_mask(mask);
        self.current.color_mask = Some(mask);
    }

    pub fn set_stencil(&mut self, device: &mut dyn GpuDevice, stencil: Option<&StencilSettings>) {
        if self.locks.contains(StateLocks::STENCIL) {
            return;
        }
        let Some(s) = stencil else {
            self.set_capability(device, Capability::StencilTest, false);
            return;
        };
        self.set_capability(device, Capability::StencilTest, true);

        if self.current.stencil_write_mask != Some(s.write_mask) {
            device.stencil_mask(s.write_mask);
            self.current.stencil_write_mask = Some(s.write_mask);
        }
        let func = (s.func, s.reference, s.func_mask);
        if self.current.stencil_func != Some(func) {
            device.stencil_func(s.func, s.reference, s.func_mask);
            self.current.stencil_func = Some(func);
        }
        let ops = [s.fail, s.depth_fail, s.pass];
        if self.current.stencil_op != Some(ops) {
            device.stencil_op(s.fail, s.depth_fail, s.pass);
            self.current.stencil_op = Some(ops);
        }
    }

    pub fn set_polygon_offset(
        &mut self,
        device: &mut dyn GpuDevice,
        offset: Option<PolygonOffset>,
    ) {
        let Some(offset) = offset else {
            self.set_capability(device, Capability::PolygonOffsetFill, false);
            return;
        };
        self.set_capability(device, Capability::PolygonOffsetFill, true);
        let value = (offset.factor, offset.units);
        if self.current.polygon_offset != Some(value) {
            device.polygon_offset(offset.factor, offset.units);
            self.current.polygon_offset = Some(value);
        }
    }

    pub fn set_viewport(&mut self, device: &mut dyn GpuDevice, viewport: Viewport) {
        if self.current.viewport != Some(viewport) {
            device.viewport(viewport);
            self.current.viewport = Some(viewport);
        }
    }

    pub fn set_clear_color(&mut self, device: &mut dyn GpuDevice, color: wgpu::Color) {
        if self.current.clear_color != Some(color) {
            device.clear_color(color);
            self.current.clear_color = Some(color);
        }
    }

    // === Bindings ===

    /// Returns `true` when the program actually changed.
    pub fn use_program(&mut self, device: &mut dyn GpuDevice, program: Option<GpuProgram>) -> bool {
        if self.program == Some(program) {
            return false;
        }
        device.use_program(program);
        self.program = Some(program);
        true
    }

    #[must_use]
    pub fn current_program(&self) -> Option<GpuProgram> {
        self.program.flatten()
    }

    pub fn bind_framebuffer(
        &mut self,
        device: &mut dyn GpuDevice,
        framebuffer: Option<GpuFramebuffer>,
    ) -> bool {
        if self.framebuffer == Some(framebuffer) {
            return false;
        }
        device.bind_framebuffer(framebuffer);
        self.framebuffer = Some(framebuffer);
        true
    }

    pub fn bind_uniform_block(
        &mut self,
        device: &mut dyn GpuDevice,
        binding_point: u32,
        buffer: GpuBuffer,
    ) {
        if self.uniform_blocks.get(&binding_point) != Some(&buffer) {
            device.bind_buffer_base(binding_point, buffer);
            self.uniform_blocks.insert(binding_point, buffer);
        }
    }

    /// Drops mirrors referring to a deleted program or framebuffer.
    pub fn forget_program(&mut self, program: GpuProgram) {
        if self.program == Some(Some(program)) {
            self.program = None;
        }
    }

    pub fn forget_framebuffer(&mut self, framebuffer: GpuFramebuffer) {
        if self.framebuffer == Some(Some(framebuffer)) {
            self.framebuffer = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::device::HeadlessDevice;

    fn transparent_double() -> MaterialSettings {
        MaterialSettings {
            transparent: true,
            side: Side::Double,
            ..Default::default()
        }
    }

    fn additive_front() -> MaterialSettings {
        MaterialSettings {
            transparent: true,
            blending: Blending::Additive,
            depth_write: false,
            ..Default::default()
        }
    }

    #[test]
    fn second_identical_set_issues_nothing() {
        let mut device = HeadlessDevice::new(8, 8);
        let mut state = StateDiffer::new();
        let settings = transparent_double();

        state.set_material(&mut device, &settings, false);
        assert!(!device.commands().is_empty());

        device.clear_commands();
        state.set_material(&mut device, &settings, false);
        assert!(device.commands().is_empty());
    }

    #[test]
    fn state_is_history_independent() {
        let mut device = HeadlessDevice::new(8, 8);
        let mut state = StateDiffer::new();
        let a = transparent_double();
        let b = additive_front();

        state.set_material(&mut device, &a, false);
        let after_a = state.snapshot().clone();

        state.set_material(&mut device, &b, false);
        state.set_material(&mut device, &a, false);
        assert_eq!(*state.snapshot(), after_a);
    }

    #[test]
    fn opaque_state_does_not_depend_on_earlier_blending() {
        let mut fresh_device = HeadlessDevice::new(8, 8);
        let mut fresh = StateDiffer::new();
        let opaque = MaterialSettings::default();
        fresh.set_material(&mut fresh_device, &opaque, false);

        let mut device = HeadlessDevice::new(8, 8);
        let mut state = StateDiffer::new();
        let stenciled = MaterialSettings {
            stencil: Some(StencilSettings::default()),
            polygon_offset: Some(PolygonOffset {
                factor: 1.0,
                units: 2.0,
            }),
            ..additive_front()
        };
        state.set_material(&mut device, &stenciled, false);
        state.set_material(&mut device, &opaque, false);

        assert_ne!(state.snapshot(), fresh.snapshot());
        assert_eq!(state.snapshot().effective(), fresh.snapshot().effective());
        assert_eq!(state.snapshot().effective().blend, None);
    }

    #[test]
    fn normal_blending_on_opaque_disables_blend() {
        let mut device = HeadlessDevice::new(8, 8);
        let mut state = StateDiffer::new();
        state.set_material(&mut device, &MaterialSettings::default(), false);
        assert_eq!(state.snapshot().capability(Capability::Blend), Some(false));
    }

    #[test]
    fn back_side_flips_front_face() {
        let mut device = HeadlessDevice::new(8, 8);
        let mut state = StateDiffer::new();
        state.set_cull(&mut device, Side::Back, false);
        assert_eq!(state.snapshot().front_face, Some(FrontFace::Cw));

        // Mirrored transforms flip again.
        state.set_cull(&mut device, Side::Back, true);
        assert_eq!(state.snapshot().front_face, Some(FrontFace::Ccw));
    }

    #[test]
    fn locked_color_mask_ignores_sets() {
        let mut device = HeadlessDevice::new(8, 8);
        let mut state = StateDiffer::new();
        state.set_color_write(&mut device, true);
        state.lock(StateLocks::COLOR_MASK);

        device.clear_commands();
        state.set_color_write(&mut device, false);
        assert!(device.commands().is_empty());
        assert_eq!(state.snapshot().color_mask, Some(ColorWrites::ALL));

        state.unlock(StateLocks::COLOR_MASK);
        state.set_color_write(&mut device, false);
        assert_eq!(state.snapshot().color_mask, Some(ColorWrites::empty()));
    }

    #[test]
    fn premultiplied_normal_uses_one_source_factor() {
        let func = BlendFunc::for_blending(&Blending::Normal, true).unwrap();
        assert_eq!(func.src_color, F::One);
        assert!(BlendFunc::for_blending(&Blending::None, false).is_none());
    }
}
