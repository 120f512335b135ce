//! Frame Pipeline Tests
//!
//! End-to-end frames on the recording device:
//! - Pass ordering (shadow, transmission, opaque, transparent)
//! - Program sharing, reference counts and disposal
//! - Redundant state elimination across frames
//! - Fail-soft shader builds and context loss recovery
//! - Render targets, array cameras and statistics

use glam::{Mat4, Vec3};

use myth_forward::renderer::{
    DeviceCommand, HeadlessDevice, PassPhase, RenderTargetDesc, Renderer, RendererSettings,
};
use myth_forward::resources::{
    Geometry, Material, MaterialHandle, MaterialKind, PhysicalParams, ShaderMaterial, Side,
};
use myth_forward::scene::{Camera, Light, LightShadow, NodeHandle, Scene, Viewport};

// ============================================================================
// Fixtures
// ============================================================================

fn cube() -> Geometry {
    #[rustfmt::skip]
    let positions = vec![
        -1.0, -1.0, -1.0,  1.0, -1.0, -1.0,  1.0,  1.0, -1.0, -1.0,  1.0, -1.0,
        -1.0, -1.0,  1.0,  1.0, -1.0,  1.0,  1.0,  1.0,  1.0, -1.0,  1.0,  1.0,
    ];
    #[rustfmt::skip]
    let indices = vec![
        0, 2, 1, 0, 3, 2,  4, 5, 6, 4, 6, 7,  0, 1, 5, 0, 5, 4,
        2, 3, 7, 2, 7, 6,  1, 2, 6, 1, 6, 5,  0, 4, 7, 0, 7, 3,
    ];
    let mut geometry = Geometry::from_positions(positions, Some(indices));
    geometry.compute_bounding_sphere();
    geometry
}

fn plane() -> Geometry {
    let mut geometry = Geometry::from_positions(
        vec![-1.0, -1.0, 0.0, 1.0, -1.0, 0.0, 1.0, 1.0, 0.0, -1.0, 1.0, 0.0],
        Some(vec![0, 1, 2, 0, 2, 3]),
    );
    geometry.compute_bounding_sphere();
    geometry
}

fn camera() -> Camera {
    let mut camera = Camera::new_perspective(60.0, 1.0, 0.1, 100.0);
    camera.look_at(Vec3::new(0.0, 0.0, 10.0), Vec3::ZERO, Vec3::Y);
    camera
}

fn renderer() -> Renderer<HeadlessDevice> {
    let _ = env_logger::builder().is_test(true).try_init();
    Renderer::new(HeadlessDevice::new(64, 64), RendererSettings::default())
        .expect("default settings are valid")
}

fn add_mesh(scene: &mut Scene, geometry: Geometry, material: MaterialHandle, z: f32) -> NodeHandle {
    let geometry = scene.add_geometry(geometry);
    let node = scene.add_mesh(geometry, material);
    if let Some(node) = scene.node_mut(node) {
        node.local_matrix = Mat4::from_translation(Vec3::new(0.0, 0.0, z));
    }
    node
}

fn transparent(kind: MaterialKind) -> Material {
    let mut material = Material::new(kind);
    material.settings_mut().transparent = true;
    material.settings_mut().opacity = 0.5;
    material
}

fn phases(renderer: &Renderer<HeadlessDevice>) -> Vec<PassPhase> {
    renderer.draw_log().iter().map(|r| r.phase).collect()
}

// ============================================================================
// Pass ordering
// ============================================================================

#[test]
fn opaque_cube_is_drawn_before_transparent_plane() {
    let mut scene = Scene::new();
    // Inserted first and closer to the camera; still drawn last.
    let glass = scene.add_material(transparent(MaterialKind::basic(Vec3::X)));
    let plane_node = add_mesh(&mut scene, plane(), glass, 2.0);
    let solid = scene.add_material(Material::new(MaterialKind::standard(Vec3::ONE)));
    let cube_node = add_mesh(&mut scene, cube(), solid, 0.0);

    let mut renderer = renderer();
    renderer.render(&mut scene, &camera());

    let nodes: Vec<NodeHandle> = renderer.draw_log().iter().map(|r| r.node).collect();
    assert_eq!(nodes, vec![cube_node, plane_node]);
    assert_eq!(phases(&renderer), vec![PassPhase::Opaque, PassPhase::Transparent]);
    assert_eq!(renderer.phase(), PassPhase::Idle);
}

#[test]
fn transparent_depth_never_increases_along_the_list() {
    let mut scene = Scene::new();
    for z in [1.0, -3.0, 4.0, 0.0, -1.5] {
        let material = scene.add_material(transparent(MaterialKind::basic(Vec3::ONE)));
        add_mesh(&mut scene, plane(), material, z);
    }
    let camera = camera();
    let mut renderer = renderer();
    renderer.render(&mut scene, &camera);

    let list = renderer
        .render_lists()
        .peek(camera.id())
        .expect("main list is kept between frames");
    let depths: Vec<f32> = list.transparent().map(|item| item.z).collect();
    assert_eq!(depths.len(), 5);
    assert!(depths.windows(2).all(|w| w[0] >= w[1]), "{depths:?}");
}

#[test]
fn unchanged_scene_keeps_its_draw_order() {
    let mut scene = Scene::new();
    let shared = scene.add_material(Material::new(MaterialKind::basic(Vec3::ONE)));
    for i in 0..6 {
        let material = if i % 2 == 0 {
            shared
        } else {
            scene.add_material(transparent(MaterialKind::basic(Vec3::Y)))
        };
        add_mesh(&mut scene, plane(), material, i as f32 - 3.0);
    }
    let camera = camera();
    let mut renderer = renderer();

    renderer.render(&mut scene, &camera);
    let first = renderer.draw_log().to_vec();
    renderer.render(&mut scene, &camera);
    assert_eq!(renderer.draw_log(), first.as_slice());
}

#[test]
fn double_sided_transparent_draws_back_faces_first() {
    let mut scene = Scene::new();
    let mut material = transparent(MaterialKind::basic(Vec3::ONE));
    material.settings_mut().side = Side::Double;
    let material = scene.add_material(material);
    add_mesh(&mut scene, cube(), material, 0.0);

    let mut renderer = renderer();
    renderer.render(&mut scene, &camera());

    let sides: Vec<Side> = renderer.draw_log().iter().map(|r| r.side).collect();
    assert_eq!(sides, vec![Side::Back, Side::Front]);

    // A single-pass request draws both sides at once.
    if let Some(material) = scene.material_mut(material) {
        material.settings_mut().force_single_pass = true;
    }
    renderer.render(&mut scene, &camera());
    let sides: Vec<Side> = renderer.draw_log().iter().map(|r| r.side).collect();
    assert_eq!(sides, vec![Side::Double]);
}

#[test]
fn shadow_maps_render_before_the_main_passes() {
    let mut scene = Scene::new();
    let solid = scene.add_material(Material::new(MaterialKind::standard(Vec3::ONE)));
    let caster = add_mesh(&mut scene, cube(), solid, 0.0);
    if let Some(node) = scene.node_mut(caster) {
        node.cast_shadow = true;
        node.receive_shadow = true;
        node.frustum_culled = false;
    }
    let mut sun = Light::new_directional(Vec3::ONE, 1.0);
    sun.shadow = Some(LightShadow::default());
    let sun = scene.add_light(sun);
    if let Some(node) = scene.node_mut(sun) {
        node.cast_shadow = true;
        node.set_position(Vec3::new(3.0, 10.0, 3.0));
    }

    let mut settings = RendererSettings::default();
    settings.shadow_map.enabled = true;
    let mut renderer = Renderer::new(HeadlessDevice::new(64, 64), settings).unwrap();
    renderer.render(&mut scene, &camera());

    let log = renderer.draw_log();
    assert_eq!(phases(&renderer), vec![PassPhase::Shadow, PassPhase::Opaque]);
    let source = scene.material(solid).unwrap().id();
    assert_ne!(log[0].material, source, "casters draw with a depth variant");
    assert_eq!(log[1].material, source);
    assert_eq!(renderer.lights().shadow_casters().len(), 1);

    // Disabled shadows skip the pass entirely.
    let mut settings = renderer.settings().clone();
    settings.shadow_map.enabled = false;
    renderer.set_settings(settings).unwrap();
    renderer.render(&mut scene, &camera());
    assert_eq!(phases(&renderer), vec![PassPhase::Opaque]);
}

#[test]
fn transmission_background_precedes_the_opaque_pass() {
    let mut scene = Scene::new();
    let solid = scene.add_material(Material::new(MaterialKind::basic(Vec3::ONE)));
    let backdrop = add_mesh(&mut scene, plane(), solid, -2.0);
    let mut glass = Material::new(MaterialKind::physical(PhysicalParams {
        transmission: 1.0,
        thickness: 0.5,
        ..PhysicalParams::default()
    }));
    glass.settings_mut().side = Side::Double;
    let glass = scene.add_material(glass);
    let orb = add_mesh(&mut scene, cube(), glass, 0.0);

    let mut renderer = renderer();
    renderer.render(&mut scene, &camera());

    let log = renderer.draw_log();
    let background: Vec<_> = log
        .iter()
        .filter(|r| r.phase == PassPhase::Transmission(0))
        .map(|r| (r.node, r.side))
        .collect();
    assert_eq!(background, vec![(backdrop, Side::Front), (orb, Side::Back)]);

    let main: Vec<_> = log
        .iter()
        .filter(|r| r.phase == PassPhase::Opaque)
        .map(|r| r.node)
        .collect();
    assert_eq!(main, vec![backdrop, orb]);
    assert!(
        log.iter()
            .position(|r| r.phase == PassPhase::Opaque)
            .unwrap()
            > log
                .iter()
                .rposition(|r| r.phase == PassPhase::Transmission(0))
                .unwrap()
    );
}

#[test]
fn scenes_without_transmission_skip_its_pass() {
    let mut scene = Scene::new();
    let solid = scene.add_material(Material::new(MaterialKind::basic(Vec3::ONE)));
    add_mesh(&mut scene, cube(), solid, 0.0);

    let mut renderer = renderer();
    renderer.render(&mut scene, &camera());
    assert!(
        renderer
            .draw_log()
            .iter()
            .all(|r| !matches!(r.phase, PassPhase::Transmission(_)))
    );
    assert_eq!(renderer.render_targets().len(), 0);
}

// ============================================================================
// Programs and state
// ============================================================================

#[test]
fn shared_material_compiles_once_with_two_references() {
    let mut scene = Scene::new();
    let material = scene.add_material(Material::new(MaterialKind::phong(Vec3::ONE)));
    add_mesh(&mut scene, cube(), material, 0.0);
    add_mesh(&mut scene, cube(), material, -2.0);

    let mut renderer = renderer();
    renderer.render(&mut scene, &camera());

    assert_eq!(renderer.info().compile_events, 1);
    let id = scene.material(material).unwrap().id();
    let program = renderer.material_program(id).expect("material was drawn");
    assert_eq!(renderer.program_cache().used_times(program), 2);
}

#[test]
fn equal_materials_share_a_program() {
    let mut scene = Scene::new();
    let a = scene.add_material(Material::new(MaterialKind::lambert(Vec3::X)));
    let b = scene.add_material(Material::new(MaterialKind::lambert(Vec3::Y)));
    add_mesh(&mut scene, cube(), a, 0.0);
    add_mesh(&mut scene, cube(), b, -2.0);

    let mut renderer = renderer();
    renderer.render(&mut scene, &camera());

    let pa = renderer.material_program(scene.material(a).unwrap().id());
    let pb = renderer.material_program(scene.material(b).unwrap().id());
    assert!(pa.is_some());
    assert_eq!(pa, pb);
    assert_eq!(renderer.info().programs, 1);
}

#[test]
fn disposing_a_material_repeatedly_frees_its_program_once() {
    let mut scene = Scene::new();
    let material = scene.add_material(Material::new(MaterialKind::basic(Vec3::ONE)));
    add_mesh(&mut scene, cube(), material, 0.0);

    let mut renderer = renderer();
    renderer.render(&mut scene, &camera());
    let id = scene.material(material).unwrap().id();
    renderer.device_mut().clear_commands();

    assert!(renderer.dispose_material(id));
    assert!(!renderer.dispose_material(id));
    assert!(!renderer.dispose_material(id));

    let deletes = renderer
        .device()
        .count_commands(|c| matches!(c, DeviceCommand::DeleteProgram(_)));
    assert_eq!(deletes, 1);
    assert_eq!(renderer.program_cache().len(), 0);
}

#[test]
fn second_identical_frame_issues_no_state_changes() {
    let mut scene = Scene::new();
    let material = scene.add_material(Material::new(MaterialKind::standard(Vec3::ONE)));
    add_mesh(&mut scene, cube(), material, 0.0);
    scene.add_light(Light::new_ambient(Vec3::ONE, 0.3));

    let camera = camera();
    let mut renderer = renderer();
    renderer.render(&mut scene, &camera);
    renderer.device_mut().clear_commands();
    renderer.render(&mut scene, &camera);

    let device = renderer.device();
    assert_eq!(device.count_commands(DeviceCommand::is_state_change), 0);
    assert_eq!(
        device.count_commands(|c| matches!(c, DeviceCommand::CreateProgram(_))),
        0
    );
    assert_eq!(
        device.count_commands(|c| matches!(c, DeviceCommand::Draw { .. })),
        1
    );
}

#[test]
fn broken_custom_shader_falls_back_without_stopping_the_frame() {
    let mut scene = Scene::new();
    let broken = Material::new(MaterialKind::Shader(ShaderMaterial::new(
        "void main() { gl_Position = vec4(0.0); }",
        "void main() { BROKEN_SYMBOL; }",
    )));
    let broken_id = broken.id();
    let broken = scene.add_material(broken);
    let healthy = scene.add_material(Material::new(MaterialKind::basic(Vec3::ONE)));
    add_mesh(&mut scene, cube(), broken, 0.0);
    add_mesh(&mut scene, cube(), healthy, -2.0);

    let mut device = HeadlessDevice::new(64, 64);
    device.fail_shaders_containing("BROKEN_SYMBOL");
    let mut renderer = Renderer::new(device, RendererSettings::default()).unwrap();
    renderer.render(&mut scene, &camera());

    assert_eq!(renderer.draw_log().len(), 2);
    let diagnostics = renderer
        .material_diagnostics(broken_id)
        .expect("failure is reported");
    assert!(!diagnostics.is_empty());
    let healthy_id = scene.material(healthy).unwrap().id();
    assert!(renderer.material_diagnostics(healthy_id).is_none());

    // The failure is remembered; the next frame does not retry the build.
    let compiles = renderer.info().compile_events;
    renderer.render(&mut scene, &camera());
    assert_eq!(renderer.info().compile_events, compiles);
    assert_eq!(renderer.draw_log().len(), 2);
}

#[test]
fn override_material_replaces_every_main_draw() {
    let mut scene = Scene::new();
    let a = scene.add_material(Material::new(MaterialKind::basic(Vec3::X)));
    let b = scene.add_material(Material::new(MaterialKind::phong(Vec3::Y)));
    add_mesh(&mut scene, cube(), a, 0.0);
    add_mesh(&mut scene, cube(), b, -2.0);
    let replacement = Material::new(MaterialKind::basic(Vec3::ONE));
    let replacement_id = replacement.id();
    scene.override_material = Some(replacement);

    let mut renderer = renderer();
    renderer.render(&mut scene, &camera());

    assert_eq!(renderer.draw_log().len(), 2);
    assert!(renderer.draw_log().iter().all(|r| r.material == replacement_id));
}

// ============================================================================
// Context loss
// ============================================================================

#[test]
fn lost_context_suspends_and_restored_context_rebuilds() {
    let mut scene = Scene::new();
    let material = scene.add_material(Material::new(MaterialKind::basic(Vec3::ONE)));
    add_mesh(&mut scene, cube(), material, 0.0);
    let camera = camera();

    let mut renderer = renderer();
    renderer.render(&mut scene, &camera);
    let compiles = renderer.info().compile_events;

    renderer.device_mut().lose_context();
    renderer.render(&mut scene, &camera);
    assert!(renderer.is_context_lost());
    assert!(renderer.draw_log().is_empty());
    assert_eq!(renderer.program_cache().len(), 0);

    renderer.device_mut().restore_context();
    renderer.render(&mut scene, &camera);
    assert!(!renderer.is_context_lost());
    assert_eq!(renderer.draw_log().len(), 1);
    assert_eq!(renderer.info().compile_events, compiles + 1);
    assert_eq!(renderer.device().live_programs(), 1);
}

// ============================================================================
// Targets, views and statistics
// ============================================================================

#[test]
fn target_resize_reallocates_exactly_once() {
    let mut scene = Scene::new();
    let material = scene.add_material(Material::new(MaterialKind::basic(Vec3::ONE)));
    add_mesh(&mut scene, cube(), material, 0.0);
    let camera = camera();

    let mut renderer = renderer();
    let target = renderer
        .create_render_target(RenderTargetDesc::new(256, 256))
        .unwrap();
    renderer.set_render_target(Some(target)).unwrap();
    renderer.render(&mut scene, &camera);
    assert_eq!(renderer.render_targets().allocations(), 1);

    assert!(renderer.resize_render_target(target, 512, 512).unwrap());
    renderer.render(&mut scene, &camera);
    renderer.render(&mut scene, &camera);
    assert_eq!(renderer.render_targets().allocations(), 2);

    assert!(!renderer.resize_render_target(target, 512, 512).unwrap());
    assert!(renderer.dispose_render_target(target));
    assert_eq!(renderer.render_target(), None);
    assert!(renderer.set_render_target(Some(target)).is_err());
}

#[test]
fn array_camera_draws_once_per_sub_camera() {
    let mut scene = Scene::new();
    let material = scene.add_material(Material::new(MaterialKind::basic(Vec3::ONE)));
    add_mesh(&mut scene, cube(), material, 0.0);

    let mut rig = camera();
    for x in [0, 32] {
        let mut eye = camera();
        eye.viewport = Some(Viewport::new(x, 0, 32, 64));
        rig.sub_cameras.push(eye);
    }

    let mut renderer = renderer();
    renderer.render(&mut scene, &rig);

    assert_eq!(renderer.draw_log().len(), 2);
    assert_eq!(renderer.info().draw_calls, 2);
    let viewports = renderer
        .device()
        .count_commands(|c| matches!(c, DeviceCommand::Viewport(v) if v.width == 32));
    assert!(viewports >= 2);
}

#[test]
fn array_camera_keeps_one_transmission_target_per_view() {
    let mut scene = Scene::new();
    let glass = scene.add_material(Material::new(MaterialKind::physical(PhysicalParams {
        transmission: 1.0,
        ..PhysicalParams::default()
    })));
    add_mesh(&mut scene, cube(), glass, 0.0);

    let mut rig = camera();
    for (x, width) in [(0, 16), (16, 48)] {
        let mut eye = camera();
        eye.viewport = Some(Viewport::new(x, 0, width, 64));
        rig.sub_cameras.push(eye);
    }

    let mut renderer = renderer();
    let mut allocations = Vec::new();
    for _ in 0..4 {
        let before = renderer.render_targets().allocations();
        renderer.render(&mut scene, &rig);
        allocations.push(renderer.render_targets().allocations() - before);
    }
    assert_eq!(allocations, vec![2, 0, 0, 0]);
    assert_eq!(renderer.render_targets().len(), 2);

    // Views that are no longer drawn give their targets back.
    renderer.render(&mut scene, &camera());
    assert_eq!(renderer.render_targets().len(), 1);
}

#[test]
fn render_lists_of_departed_cameras_are_dropped() {
    let mut scene = Scene::new();
    let material = scene.add_material(Material::new(MaterialKind::basic(Vec3::ONE)));
    add_mesh(&mut scene, cube(), material, 0.0);

    let base = camera();
    let mut renderer = renderer();
    for _ in 0..100 {
        renderer.render(&mut scene, &base.clone());
    }
    assert_eq!(renderer.render_lists().len(), 1);

    renderer.render(&mut scene, &base);
    renderer.render(&mut scene, &base);
    assert_eq!(renderer.render_lists().len(), 1);
    assert!(renderer.render_lists().peek(base.id()).is_some());
}

#[test]
fn statistics_describe_the_last_frame() {
    let mut scene = Scene::new();
    let material = scene.add_material(Material::new(MaterialKind::basic(Vec3::ONE)));
    add_mesh(&mut scene, cube(), material, 0.0);
    add_mesh(&mut scene, plane(), material, -2.0);

    let camera = camera();
    let mut renderer = renderer();
    renderer.render(&mut scene, &camera);
    renderer.render(&mut scene, &camera);

    let info = renderer.info();
    assert_eq!(info.frame, 2);
    assert_eq!(info.draw_calls, 2);
    assert_eq!(info.triangles, 12 + 2);
    assert_eq!(info.lines, 0);
    assert_eq!(info.programs, 1);
}

#[test]
fn dispose_frees_every_device_object() {
    let mut scene = Scene::new();
    let material = scene.add_material(Material::new(MaterialKind::standard(Vec3::ONE)));
    add_mesh(&mut scene, cube(), material, 0.0);
    scene.add_light(Light::new_point(Vec3::ONE, 1.0, 0.0));

    let mut renderer = renderer();
    let target = renderer
        .create_render_target(RenderTargetDesc::new(32, 32))
        .unwrap();
    renderer.set_render_target(Some(target)).unwrap();
    renderer.render(&mut scene, &camera());

    renderer.dispose();
    renderer.dispose();
    let device = renderer.device();
    assert_eq!(device.live_programs(), 0);
    assert_eq!(device.live_buffers(), 0);
    assert_eq!(device.live_framebuffers(), 0);
    assert_eq!(device.live_textures(), 0);
}
