//! Light Aggregation
//!
//! [`LightsState`] collects the visible lights of a scene once per frame,
//! orders shadow casters first within each light type, builds the shadow
//! cameras and packs everything into one std140 `Lights` uniform block.
//!
//! Block layout (every array present only when its count is non-zero):
//!
//! ```text
//! vec4                    ambient
//! DirectionalLight        directionalLights[NUM_DIR_LIGHTS]
//! PointLight              pointLights[NUM_POINT_LIGHTS]
//! SpotLight               spotLights[NUM_SPOT_LIGHTS]
//! HemisphereLight         hemisphereLights[NUM_HEMI_LIGHTS]
//! LightShadow             directionalLightShadows[NUM_DIR_LIGHT_SHADOWS]
//! mat4                    directionalShadowMatrix[NUM_DIR_LIGHT_SHADOWS]
//! LightShadow             spotLightShadows[NUM_SPOT_LIGHT_SHADOWS]
//! mat4                    spotShadowMatrix[NUM_SPOT_LIGHT_SHADOWS]
//! PointLightShadow        pointLightShadows[NUM_POINT_LIGHT_SHADOWS]
//! mat4                    pointShadowMatrix[NUM_POINT_LIGHT_SHADOWS]
//! ```
//!
//! Light positions and directions are stored in view space, so the block is
//! repacked per camera by [`LightsState::setup_view`]; its version only moves
//! when the packed bytes actually change.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3};
use rustc_hash::FxHashMap;

use crate::scene::{Camera, LightKind, LightShadow, NodeHandle, Projection, Scene, Viewport};

/// Uniform block binding point of the `Lights` block.
pub const LIGHTS_BINDING_POINT: u32 = 0;

// ============================================================================
// std140 structs
// ============================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct DirectionalLightUniform {
    pub direction: Vec3,
    pub _pad0: f32,
    pub color: Vec3,
    pub _pad1: f32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct PointLightUniform {
    pub position: Vec3,
    pub distance: f32,
    pub color: Vec3,
    pub decay: f32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct SpotLightUniform {
    pub position: Vec3,
    pub distance: f32,
    pub direction: Vec3,
    pub cone_cos: f32,
    pub color: Vec3,
    pub penumbra_cos: f32,
    pub decay: f32,
    pub _pad: [f32; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct HemisphereLightUniform {
    pub direction: Vec3,
    pub _pad0: f32,
    pub sky_color: Vec3,
    pub _pad1: f32,
    pub ground_color: Vec3,
    pub _pad2: f32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct LightShadowUniform {
    pub bias: f32,
    pub normal_bias: f32,
    pub radius: f32,
    pub _pad0: f32,
    pub map_size: Vec2,
    pub _pad1: Vec2,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct PointLightShadowUniform {
    pub bias: f32,
    pub normal_bias: f32,
    pub radius: f32,
    pub _pad0: f32,
    pub map_size: Vec2,
    pub camera_near: f32,
    pub camera_far: f32,
}

// ============================================================================
// Counts
// ============================================================================

/// Light configuration that feeds program keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct LightCounts {
    pub directional: u32,
    pub point: u32,
    pub spot: u32,
    pub hemi: u32,
    pub directional_shadows: u32,
    pub point_shadows: u32,
    pub spot_shadows: u32,
}

impl LightCounts {
    #[must_use]
    pub fn shadow_total(&self) -> u32 {
        self.directional_shadows + self.point_shadows + self.spot_shadows
    }
}

// ============================================================================
// Shadow casters
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShadowKind {
    Directional,
    Spot,
    Point,
}

/// One render of a shadow map: a camera and the region of the map it fills.
#[derive(Debug, Clone)]
pub struct ShadowFace {
    pub camera: Camera,
    pub viewport: Viewport,
}

#[derive(Debug, Clone)]
pub struct ShadowCaster {
    pub node: NodeHandle,
    pub kind: ShadowKind,
    pub shadow: LightShadow,
    pub faces: Vec<ShadowFace>,
    pub map_width: u32,
    pub map_height: u32,
    /// World to shadow-map texture space (light translation for point lights)
    pub matrix: Mat4,
    pub light_position: Vec3,
    pub camera_near: f32,
    pub camera_far: f32,
    /// Sampler uniform the map is bound to, e.g. `spotShadowMap0`
    pub uniform_name: String,
}

// Cube face directions and ups, in +X, -X, +Z, -Z, +Y, -Y order.
const CUBE_DIRECTIONS: [Vec3; 6] = [
    Vec3::X,
    Vec3::NEG_X,
    Vec3::Z,
    Vec3::NEG_Z,
    Vec3::Y,
    Vec3::NEG_Y,
];
const CUBE_UPS: [Vec3; 6] = [Vec3::Y, Vec3::Y, Vec3::Y, Vec3::Y, Vec3::Z, Vec3::NEG_Z];
// Face cells of the 4x2 point shadow atlas.
const CUBE_CELLS: [(i32, i32); 6] = [(2, 1), (0, 1), (3, 1), (1, 1), (3, 0), (1, 0)];

const DEFAULT_SHADOW_FAR: f32 = 500.0;

/// `[-1, 1]` clip xy to `[0, 1]` texture coordinates; depth is already `[0, 1]`.
const SHADOW_BIAS: Mat4 = Mat4::from_cols_array(&[
    0.5, 0.0, 0.0, 0.0, //
    0.0, 0.5, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.5, 0.5, 0.0, 1.0,
]);

fn safe_up(direction: Vec3) -> Vec3 {
    if direction.normalize_or_zero().y.abs() > 0.99 {
        Vec3::Z
    } else {
        Vec3::Y
    }
}

// ============================================================================
// LightsState
// ============================================================================

#[derive(Debug, Clone)]
struct DirectionalData {
    position: Vec3,
    target: Vec3,
    color: Vec3,
}

#[derive(Debug, Clone)]
struct PointData {
    position: Vec3,
    color: Vec3,
    distance: f32,
    decay: f32,
}

#[derive(Debug, Clone)]
struct SpotData {
    position: Vec3,
    target: Vec3,
    color: Vec3,
    distance: f32,
    cone_cos: f32,
    penumbra_cos: f32,
    decay: f32,
}

#[derive(Debug, Clone)]
struct HemiData {
    position: Vec3,
    sky: Vec3,
    ground: Vec3,
}

/// Per-frame light aggregation.
#[derive(Debug, Default)]
pub struct LightsState {
    counts: LightCounts,
    ambient: Vec3,
    directional: Vec<DirectionalData>,
    point: Vec<PointData>,
    spot: Vec<SpotData>,
    hemi: Vec<HemiData>,
    casters: Vec<ShadowCaster>,

    bytes: Vec<u8>,
    version: u64,
}

impl LightsState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn counts(&self) -> LightCounts {
        self.counts
    }

    #[must_use]
    pub fn shadow_casters(&self) -> &[ShadowCaster] {
        &self.casters
    }

    /// Packed `Lights` block for the last [`setup_view`](Self::setup_view).
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Bumped whenever [`bytes`](Self::bytes) changes.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Collects the scene's visible lights. Shadow casters are ordered first
    /// within each type so light `i` and shadow `i` refer to the same light.
    pub fn setup(&mut self, scene: &Scene, shadows_enabled: bool) {
        let mut previous_faces: FxHashMap<NodeHandle, Vec<ShadowFace>> = self
            .casters
            .drain(..)
            .map(|caster| (caster.node, caster.faces))
            .collect();

        self.ambient = Vec3::ZERO;
        self.directional.clear();
        self.point.clear();
        self.spot.clear();
        self.hemi.clear();

        let mut lights: Vec<_> = scene
            .lights()
            .map(|(handle, node, light)| {
                let casts = shadows_enabled && node.cast_shadow && light.can_cast_shadow();
                (handle, node, light, casts)
            })
            .collect();
        lights.sort_by_key(|&(_, _, _, casts)| !casts);

        let mut counts = LightCounts::default();
        let mut dir_casters = Vec::new();
        let mut spot_casters = Vec::new();
        let mut point_casters = Vec::new();

        for (handle, node, light, casts) in lights {
            let color = light.color * light.intensity;
            let position = node.world_position();
            let shadow = light.shadow.clone().unwrap_or_default();

            match &light.kind {
                LightKind::Ambient => self.ambient += color,
                LightKind::Hemisphere { ground_color } => {
                    counts.hemi += 1;
                    self.hemi.push(HemiData {
                        position,
                        sky: color,
                        ground: *ground_color * light.intensity,
                    });
                }
                LightKind::Directional { target } => {
                    counts.directional += 1;
                    self.directional.push(DirectionalData {
                        position,
                        target: *target,
                        color,
                    });
                    if casts {
                        let faces = previous_faces.remove(&handle).unwrap_or_default();
                        dir_casters.push(directional_caster(
                            handle, &shadow, position, *target, faces,
                        ));
                    }
                }
                LightKind::Point { distance, decay } => {
                    counts.point += 1;
                    self.point.push(PointData {
                        position,
                        color,
                        distance: *distance,
                        decay: *decay,
                    });
                    if casts {
                        let faces = previous_faces.remove(&handle).unwrap_or_default();
                        point_casters.push(point_caster(
                            handle, &shadow, position, *distance, faces,
                        ));
                    }
                }
                LightKind::Spot {
                    target,
                    distance,
                    angle,
                    penumbra,
                    decay,
                } => {
                    counts.spot += 1;
                    self.spot.push(SpotData {
                        position,
                        target: *target,
                        color,
                        distance: *distance,
                        cone_cos: angle.cos(),
                        penumbra_cos: (angle * (1.0 - penumbra)).cos(),
                        decay: *decay,
                    });
                    if casts {
                        let faces = previous_faces.remove(&handle).unwrap_or_default();
                        spot_casters.push(spot_caster(
                            handle, &shadow, position, *target, *distance, *angle, faces,
                        ));
                    }
                }
            }
        }

        counts.directional_shadows = dir_casters.len() as u32;
        counts.spot_shadows = spot_casters.len() as u32;
        counts.point_shadows = point_casters.len() as u32;
        for (prefix, list) in [
            ("directionalShadowMap", &mut dir_casters),
            ("spotShadowMap", &mut spot_casters),
            ("pointShadowMap", &mut point_casters),
        ] {
            for (i, caster) in list.iter_mut().enumerate() {
                caster.uniform_name = format!("{prefix}{i}");
            }
        }

        self.casters.extend(dir_casters);
        self.casters.extend(spot_casters);
        self.casters.extend(point_casters);
        self.counts = counts;
    }

    /// Packs the block for a camera's view matrix. Returns `true` when the
    /// bytes changed.
    pub fn setup_view(&mut self, view: Mat4) -> bool {
        let mut out: Vec<u8> = Vec::with_capacity(self.bytes.len().max(16));
        out.extend_from_slice(bytemuck::bytes_of(&self.ambient.extend(0.0)));

        for d in &self.directional {
            let direction = view.transform_vector3(d.position - d.target).normalize_or_zero();
            push(
                &mut out,
                &DirectionalLightUniform {
                    direction,
                    color: d.color,
                    ..Default::default()
                },
            );
        }
        for p in &self.point {
            push(
                &mut out,
                &PointLightUniform {
                    position: view.transform_point3(p.position),
                    distance: p.distance,
                    color: p.color,
                    decay: p.decay,
                },
            );
        }
        for s in &self.spot {
            push(
                &mut out,
                &SpotLightUniform {
                    position: view.transform_point3(s.position),
                    distance: s.distance,
                    direction: view.transform_vector3(s.position - s.target).normalize_or_zero(),
                    cone_cos: s.cone_cos,
                    color: s.color,
                    penumbra_cos: s.penumbra_cos,
                    decay: s.decay,
                    _pad: [0.0; 3],
                },
            );
        }
        for h in &self.hemi {
            push(
                &mut out,
                &HemisphereLightUniform {
                    direction: view.transform_vector3(h.position).normalize_or_zero(),
                    sky_color: h.sky,
                    ground_color: h.ground,
                    ..Default::default()
                },
            );
        }

        for kind in [ShadowKind::Directional, ShadowKind::Spot] {
            let casters = self.casters.iter().filter(|c| c.kind == kind);
            for caster in casters.clone() {
                push(
                    &mut out,
                    &LightShadowUniform {
                        bias: caster.shadow.bias,
                        normal_bias: caster.shadow.normal_bias,
                        radius: caster.shadow.radius,
                        map_size: Vec2::new(caster.map_width as f32, caster.map_height as f32),
                        ..Default::default()
                    },
                );
            }
            for caster in casters {
                push(&mut out, &caster.matrix);
            }
        }
        let points = self.casters.iter().filter(|c| c.kind == ShadowKind::Point);
        for caster in points.clone() {
            push(
                &mut out,
                &PointLightShadowUniform {
                    bias: caster.shadow.bias,
                    normal_bias: caster.shadow.normal_bias,
                    radius: caster.shadow.radius,
                    _pad0: 0.0,
                    map_size: Vec2::new(caster.map_width as f32, caster.map_height as f32),
                    camera_near: caster.camera_near,
                    camera_far: caster.camera_far,
                },
            );
        }
        for caster in points {
            push(&mut out, &caster.matrix);
        }

        if out == self.bytes {
            return false;
        }
        self.bytes = out;
        self.version = self.version.wrapping_add(1);
        true
    }
}

fn push<T: Pod>(out: &mut Vec<u8>, value: &T) {
    out.extend_from_slice(bytemuck::bytes_of(value));
}

fn shadow_far(shadow: &LightShadow, distance: f32) -> f32 {
    if shadow.camera_far > 0.0 {
        shadow.camera_far
    } else if distance > 0.0 {
        distance
    } else {
        DEFAULT_SHADOW_FAR
    }
}

/// Reuses the previous frame's cameras so their identities stay stable.
fn face_camera(
    faces: &mut Vec<ShadowFace>,
    index: usize,
    projection: Projection,
    near: f32,
    far: f32,
) -> &mut Camera {
    if faces.len() <= index {
        faces.push(ShadowFace {
            camera: Camera::with_projection(projection, near, far),
            viewport: Viewport::default(),
        });
    }
    let camera = &mut faces[index].camera;
    camera.projection = projection;
    camera.near = near;
    camera.far = far;
    camera.update_projection_matrix();
    camera
}

fn directional_caster(
    node: NodeHandle,
    shadow: &LightShadow,
    position: Vec3,
    target: Vec3,
    mut faces: Vec<ShadowFace>,
) -> ShadowCaster {
    let e = shadow.ortho_extent;
    let far = shadow_far(shadow, 0.0);
    faces.truncate(1);
    let camera = face_camera(
        &mut faces,
        0,
        Projection::Orthographic {
            left: -e,
            right: e,
            bottom: -e,
            top: e,
        },
        shadow.camera_near,
        far,
    );
    camera.look_at(position, target, safe_up(target - position));
    let matrix = SHADOW_BIAS * camera.view_projection_matrix();
    faces[0].viewport = Viewport::new(0, 0, shadow.map_size, shadow.map_size);

    ShadowCaster {
        node,
        kind: ShadowKind::Directional,
        shadow: shadow.clone(),
        faces,
        map_width: shadow.map_size,
        map_height: shadow.map_size,
        matrix,
        light_position: position,
        camera_near: shadow.camera_near,
        camera_far: far,
        uniform_name: String::new(),
    }
}

fn spot_caster(
    node: NodeHandle,
    shadow: &LightShadow,
    position: Vec3,
    target: Vec3,
    distance: f32,
    angle: f32,
    mut faces: Vec<ShadowFace>,
) -> ShadowCaster {
    let far = shadow_far(shadow, distance);
    faces.truncate(1);
    let camera = face_camera(
        &mut faces,
        0,
        Projection::Perspective {
            fov_y: (angle * 2.0).clamp(0.01, std::f32::consts::PI - 0.01),
            aspect: 1.0,
        },
        shadow.camera_near,
        far,
    );
    camera.look_at(position, target, safe_up(target - position));
    let matrix = SHADOW_BIAS * camera.view_projection_matrix();
    faces[0].viewport = Viewport::new(0, 0, shadow.map_size, shadow.map_size);

    ShadowCaster {
        node,
        kind: ShadowKind::Spot,
        shadow: shadow.clone(),
        faces,
        map_width: shadow.map_size,
        map_height: shadow.map_size,
        matrix,
        light_position: position,
        camera_near: shadow.camera_near,
        camera_far: far,
        uniform_name: String::new(),
    }
}

fn point_caster(
    node: NodeHandle,
    shadow: &LightShadow,
    position: Vec3,
    distance: f32,
    mut faces: Vec<ShadowFace>,
) -> ShadowCaster {
    let far = shadow_far(shadow, distance);
    let size = shadow.map_size;
    faces.truncate(6);
    for (i, ((direction, up), (cx, cy))) in CUBE_DIRECTIONS
        .iter()
        .zip(CUBE_UPS)
        .zip(CUBE_CELLS)
        .enumerate()
    {
        let camera = face_camera(
            &mut faces,
            i,
            Projection::Perspective {
                fov_y: std::f32::consts::FRAC_PI_2,
                aspect: 1.0,
            },
            shadow.camera_near,
            far,
        );
        camera.look_at(position, position + *direction, up);
        faces[i].viewport = Viewport::new(cx * size as i32, cy * size as i32, size, size);
    }

    ShadowCaster {
        node,
        kind: ShadowKind::Point,
        shadow: shadow.clone(),
        faces,
        map_width: size * 4,
        map_height: size * 2,
        matrix: Mat4::from_translation(-position),
        light_position: position,
        camera_near: shadow.camera_near,
        camera_far: far,
        uniform_name: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{Light, Node};

    fn shadowed(mut node: Node) -> Node {
        node.cast_shadow = true;
        node
    }

    #[test]
    fn counts_and_caster_order() {
        let mut scene = Scene::new();
        scene.add_node(Node::light(Light::new_directional(Vec3::ONE, 1.0)));
        scene.add_node(shadowed(Node::light(Light::new_directional(Vec3::ONE, 2.0))));
        scene.add_node(Node::light(Light::new_ambient(Vec3::ONE, 0.5)));
        scene.add_node(shadowed(
            Node::light(Light::new_point(Vec3::ONE, 1.0, 10.0)).with_position(Vec3::Y),
        ));
        scene.update_world_matrices();

        let mut lights = LightsState::new();
        lights.setup(&scene, true);
        let counts = lights.counts();
        assert_eq!(counts.directional, 2);
        assert_eq!(counts.directional_shadows, 1);
        assert_eq!(counts.point_shadows, 1);

        // The shadowed directional light is packed first.
        assert_eq!(lights.directional[0].color, Vec3::splat(2.0));

        let point = &lights.shadow_casters()[1];
        assert_eq!(point.kind, ShadowKind::Point);
        assert_eq!(point.faces.len(), 6);
        assert_eq!((point.map_width, point.map_height), (2048, 1024));
        assert_eq!(point.uniform_name, "pointShadowMap0");
    }

    #[test]
    fn shadows_disabled_yields_no_casters() {
        let mut scene = Scene::new();
        scene.add_node(shadowed(Node::light(Light::new_directional(Vec3::ONE, 1.0))));
        scene.update_world_matrices();

        let mut lights = LightsState::new();
        lights.setup(&scene, false);
        assert!(lights.shadow_casters().is_empty());
        assert_eq!(lights.counts().directional, 1);
    }

    #[test]
    fn block_version_moves_only_on_change() {
        let mut scene = Scene::new();
        scene.add_node(Node::light(Light::new_point(Vec3::ONE, 1.0, 0.0)).with_position(Vec3::X));
        scene.update_world_matrices();

        let mut lights = LightsState::new();
        lights.setup(&scene, false);
        assert!(lights.setup_view(Mat4::IDENTITY));
        let version = lights.version();
        assert!(!lights.setup_view(Mat4::IDENTITY));
        assert_eq!(lights.version(), version);

        assert!(lights.setup_view(Mat4::from_translation(Vec3::Z)));
        assert_eq!(lights.bytes().len(), 16 + 32);
    }

    #[test]
    fn shadow_cameras_keep_identity_across_frames() {
        let mut scene = Scene::new();
        scene.add_node(shadowed(
            Node::light(Light::new_spot(Vec3::ONE, 1.0, 20.0, 0.5, 0.1))
                .with_position(Vec3::Y * 5.0),
        ));
        scene.update_world_matrices();

        let mut lights = LightsState::new();
        lights.setup(&scene, true);
        let first = lights.shadow_casters()[0].faces[0].camera.id();
        lights.setup(&scene, true);
        assert_eq!(lights.shadow_casters()[0].faces[0].camera.id(), first);
    }
}
