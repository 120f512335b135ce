//! Render Passes
//!
//! A frame runs `shadow → transmission → opaque → transparent`. Every pass
//! draws through [`draw_item`], which resolves the program, uploads the
//! uniforms that changed, applies fixed-function state and issues the draw.
//!
//! [`FrameContext`] holds one borrow per renderer subsystem so a pass can
//! use several of them at once; the borrow checker splits the fields.

pub mod opaque;
pub mod shadow;
pub mod transmission;
pub mod transparent;

use glam::{Mat3, Mat4, Vec3, Vec4};
use smallvec::smallvec;

use crate::renderer::device::{GpuBuffer, GpuDevice};
use crate::renderer::lights::LIGHTS_BINDING_POINT;
use crate::renderer::materials::MaterialBindings;
use crate::renderer::program::{ObjectFeatures, ProgramCache, ProgramContext};
use crate::renderer::render_list::{DrawItem, RenderListBuilder, RenderLists};
use crate::renderer::resources::{GeometryCache, TextureCache};
use crate::renderer::settings::RendererSettings;
use crate::renderer::state::StateDiffer;
use crate::renderer::targets::RenderTargetManager;
use crate::renderer::uniforms::UniformBinder;
use crate::renderer::{PassPhase, RenderInfo};
use crate::resources::{
    AttributeSemantic, Geometry, Material, MaterialId, Side, TextureSource, UniformList,
    UniformValue,
};
use crate::scene::{Camera, CameraId, Mesh, Node, NodeHandle, Scene, Viewport};

/// Borrowed renderer state for one `render()` call.
pub(crate) struct FrameContext<'a> {
    pub device: &'a mut dyn GpuDevice,
    pub scene: &'a Scene,
    pub settings: &'a RendererSettings,
    pub state: &'a mut StateDiffer,
    pub binder: &'a mut UniformBinder,
    pub programs: &'a mut ProgramCache,
    pub bindings: &'a mut MaterialBindings,
    pub textures: &'a mut TextureCache,
    pub geometries: &'a mut GeometryCache,
    pub targets: &'a mut RenderTargetManager,
    pub builder: &'a mut RenderListBuilder,
    pub lists: &'a mut RenderLists,
    pub info: &'a mut RenderInfo,
    pub draw_log: &'a mut Vec<DrawRecord>,
}

/// One issued draw, in submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawRecord {
    pub phase: PassPhase,
    pub node: NodeHandle,
    pub material: MaterialId,
    pub side: Side,
}

// ============================================================================
// View
// ============================================================================

/// Camera data for the draws of one view.
#[derive(Debug, Clone)]
pub(crate) struct ViewData {
    pub camera: CameraId,
    pub view: Mat4,
    pub projection: Mat4,
    pub position: Vec3,
    pub viewport: Viewport,
    /// Global clipping planes in view space
    pub clipping: Vec<Vec4>,
}

impl ViewData {
    pub fn new(camera: &Camera, viewport: Viewport, global_planes: &[Vec4]) -> Self {
        let view = camera.view_matrix();
        Self {
            camera: camera.id(),
            view,
            projection: camera.projection_matrix(),
            position: camera.position(),
            viewport,
            clipping: global_planes.iter().map(|p| plane_to_view(view, *p)).collect(),
        }
    }

    fn uniforms(&self) -> [(&'static str, UniformValue); 3] {
        [
            ("projectionMatrix", UniformValue::Mat4(self.projection)),
            ("viewMatrix", UniformValue::Mat4(self.view)),
            ("cameraPosition", UniformValue::Vec3(self.position)),
        ]
    }
}

/// World plane `(n, c)` with `n·p + c = 0` into view space.
pub(crate) fn plane_to_view(view: Mat4, plane: Vec4) -> Vec4 {
    view.inverse().transpose() * plane
}

// ============================================================================
// Pass configuration
// ============================================================================

pub(crate) struct PassConfig {
    pub phase: PassPhase,
    pub ctx: ProgramContext,
    /// Rendering into an internal offscreen target
    pub offscreen: bool,
    /// Uniforms shared by every draw of the pass: exposure, fog, shadow maps,
    /// the transmission sample
    pub frame_uniforms: Vec<(String, UniformValue)>,
    pub lights_buffer: Option<GpuBuffer>,
}

/// Material an item is drawn with in the main passes.
pub(crate) fn material_for<'s>(scene: &'s Scene, item: &DrawItem) -> Option<&'s Material> {
    scene
        .override_material
        .as_ref()
        .or_else(|| scene.material(item.material))
}

fn object_features(node: &Node, mesh: &Mesh, geometry: &Geometry) -> ObjectFeatures {
    let instances = mesh.instances.as_ref();
    ObjectFeatures {
        skinning: mesh.skin.is_some(),
        bones: mesh.skin.as_ref().map_or(0, |s| s.bone_matrices.len() as u32),
        morph_targets: geometry.active_morph_targets() as u32,
        instancing: instances.is_some(),
        instancing_color: instances.is_some_and(|i| i.colors().is_some()),
        vertex_colors: geometry.has_attribute(AttributeSemantic::Color),
        vertex_tangents: geometry.has_attribute(AttributeSemantic::Tangent),
        uv1: geometry.has_attribute(AttributeSemantic::Uv1),
        receive_shadow: node.receive_shadow,
    }
}

fn object_uniforms(
    node: &Node,
    mesh: &Mesh,
    object: &ObjectFeatures,
    view: &ViewData,
) -> UniformList<'static> {
    let world = node.world_matrix();
    let model_view = view.view * world;
    let normal = Mat3::from_mat4(model_view).inverse().transpose();
    let mut out: UniformList<'static> = smallvec![
        ("modelMatrix", UniformValue::Mat4(world)),
        ("modelViewMatrix", UniformValue::Mat4(model_view)),
        ("normalMatrix", UniformValue::Mat3(normal)),
    ];

    if let Some(skin) = &mesh.skin {
        out.push(("bindMatrix", UniformValue::Mat4(skin.bind_matrix)));
        out.push(("bindMatrixInverse", UniformValue::Mat4(skin.bind_matrix.inverse())));
        out.push(("boneMatrices", UniformValue::Mat4Array(skin.bone_matrices.clone())));
    }
    if object.morph_targets > 0 {
        let mut influences = mesh.morph_influences.clone();
        influences.resize(object.morph_targets as usize, 0.0);
        out.push(("morphTargetInfluences", UniformValue::FloatArray(influences)));
    }
    out
}

/// Global planes followed by the material's own, all in view space.
fn clipping_planes(view: &ViewData, material: &Material, local: bool) -> Vec<Vec4> {
    let mut planes = view.clipping.clone();
    if local {
        planes.extend(
            material
                .settings()
                .clipping_planes
                .iter()
                .map(|p| plane_to_view(view.view, *p)),
        );
    }
    planes
}

// ============================================================================
// Draw
// ============================================================================

/// Draws one item with `material` on `side`. Failures degrade this draw
/// only.
pub(crate) fn draw_item(
    frame: &mut FrameContext<'_>,
    item: &DrawItem,
    material: &Material,
    side: Side,
    view: &ViewData,
    pass: &PassConfig,
) {
    let scene = frame.scene;
    let Some(node) = scene.node(item.node) else {
        return;
    };
    let Some(mesh) = node.as_mesh() else {
        return;
    };
    let Some(geometry) = scene.geometry(item.geometry) else {
        log::warn!("Mesh '{}' references a missing geometry", node.name);
        return;
    };
    let (first, count) = geometry.draw_span(item.group.as_ref());
    let instances = mesh.instances.as_ref().map_or(1, |i| i.count());
    if count == 0 || instances == 0 {
        return;
    }

    let object = object_features(node, mesh, geometry);
    let program = frame.bindings.resolve(
        frame.device,
        frame.programs,
        material,
        item.node,
        &object,
        &pass.ctx,
        pass.offscreen,
    );
    for (id, gpu) in frame.bindings.take_freed() {
        frame.binder.forget(id);
        frame.state.forget_program(gpu);
    }
    let Some(program) = program else {
        log::error!("No program available for material '{}'", material.name);
        return;
    };
    let Some(entry) = frame.programs.get(program) else {
        return;
    };

    frame.state.use_program(frame.device, Some(entry.gpu));
    frame.binder.begin_draw();
    if entry.lights_block.is_some()
        && let Some(buffer) = pass.lights_buffer
    {
        frame
            .state
            .bind_uniform_block(frame.device, LIGHTS_BINDING_POINT, buffer);
    }
    frame
        .binder
        .upload_view(frame.device, program, entry, view.camera, &view.uniforms());

    let mut values = UniformList::new();
    material.write_uniforms(&mut values);
    for (_, value) in &values {
        if let UniformValue::Texture(TextureSource::Texture(handle)) = value
            && let Some(texture) = scene.texture(*handle)
        {
            frame.textures.prepare(frame.device, *handle, texture);
        }
    }
    for texture in frame.textures.take_freed() {
        frame.binder.forget_texture(texture);
    }

    let textures = &*frame.textures;
    let targets = &*frame.targets;
    let resolve = |source: &TextureSource| match *source {
        TextureSource::Texture(handle) => textures.get(handle),
        TextureSource::Target(id) => targets.color_texture(id),
        TextureSource::TargetDepth(id) => targets.depth_texture(id),
    };

    frame
        .binder
        .upload(frame.device, program, entry, values.iter(), &resolve);
    for (name, value) in &pass.frame_uniforms {
        frame
            .binder
            .set(frame.device, program, entry, name, value, &resolve);
    }
    let object_values = object_uniforms(node, mesh, &object, view);
    frame
        .binder
        .upload(frame.device, program, entry, object_values.iter(), &resolve);
    let planes = clipping_planes(view, material, pass.ctx.local_clipping);
    if !planes.is_empty() {
        let value = UniformValue::Vec4Array(planes);
        frame
            .binder
            .set(frame.device, program, entry, "clippingPlanes", &value, &resolve);
    }

    let front_face_cw = node.world_matrix().determinant() < 0.0;
    frame
        .state
        .set_material_side(frame.device, material.settings(), side, front_face_cw);

    let instance_data = mesh.instances.as_ref().map(|i| (item.node, i));
    let indexed = frame
        .geometries
        .bind(frame.device, item.geometry, geometry, instance_data);
    frame
        .device
        .draw(geometry.topology, first, count, instances, indexed);

    frame.info.record_draw(geometry.topology, count, instances);
    frame.draw_log.push(DrawRecord {
        phase: pass.phase,
        node: item.node,
        material: material.id(),
        side,
    });
}

#[cfg(test)]
mod tests {
    use glam::{Mat4, Vec3, Vec4};

    use super::*;

    #[test]
    fn planes_follow_the_camera_into_view_space() {
        let mut camera = Camera::new_perspective(60.0, 1.0, 0.1, 100.0);
        camera.look_at(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y);

        // x = 1 in world space; the camera sits on the z axis so x is kept.
        let world = Vec4::new(-1.0, 0.0, 0.0, 1.0);
        let plane = plane_to_view(camera.view_matrix(), world);
        assert!((plane - world).length() < 1e-5);

        let view = ViewData::new(&camera, Viewport::new(0, 0, 1, 1), &[world]);
        assert_eq!(view.clipping.len(), 1);
    }

    #[test]
    fn plane_distance_is_preserved_under_translation() {
        let view = Mat4::from_translation(Vec3::new(0.0, 0.0, -5.0));
        let plane = plane_to_view(view, Vec4::new(0.0, 0.0, 1.0, 0.0));
        let point_view = view.transform_point3(Vec3::new(0.0, 0.0, 2.0));
        let distance = plane.truncate().dot(point_view) + plane.w;
        assert!((distance - 2.0).abs() < 1e-5);
    }
}
