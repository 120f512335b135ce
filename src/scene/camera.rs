//! Cameras and Frustum
//!
//! Cameras are plain values owned by the caller. The renderer reads their
//! matrices, viewport and layer mask; array cameras carry sub-cameras that
//! each draw the parent's render list into their own viewport.

use std::sync::atomic::{AtomicU64, Ordering};

use glam::{Mat4, Vec3, Vec4};

use super::node::Layers;

/// Identity used to key render lists and view-uniform tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CameraId(pub u64);

static NEXT_CAMERA_ID: AtomicU64 = AtomicU64::new(1);

impl CameraId {
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_CAMERA_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Pixel rectangle, origin bottom-left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Viewport {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    #[must_use]
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Projection {
    Perspective {
        /// Vertical field of view in radians
        fov_y: f32,
        aspect: f32,
    },
    Orthographic {
        left: f32,
        right: f32,
        bottom: f32,
        top: f32,
    },
}

#[derive(Debug)]
pub struct Camera {
    id: CameraId,
    pub projection: Projection,
    pub near: f32,
    pub far: f32,
    pub layers: Layers,
    /// Explicit viewport; `None` covers the whole target
    pub viewport: Option<Viewport>,
    /// Array camera members, each drawn into its own viewport
    pub sub_cameras: Vec<Camera>,

    world_matrix: Mat4,
    view_matrix: Mat4,
    projection_matrix: Mat4,
}

impl Clone for Camera {
    /// Clones get a fresh identity so they never share view-uniform state.
    fn clone(&self) -> Self {
        Self {
            id: CameraId::next(),
            projection: self.projection,
            near: self.near,
            far: self.far,
            layers: self.layers,
            viewport: self.viewport,
            sub_cameras: self.sub_cameras.clone(),
            world_matrix: self.world_matrix,
            view_matrix: self.view_matrix,
            projection_matrix: self.projection_matrix,
        }
    }
}

impl Camera {
    /// Perspective camera; `fov_y_degrees` is the vertical field of view.
    #[must_use]
    pub fn new_perspective(fov_y_degrees: f32, aspect: f32, near: f32, far: f32) -> Self {
        Self::with_projection(
            Projection::Perspective {
                fov_y: fov_y_degrees.to_radians(),
                aspect,
            },
            near,
            far,
        )
    }

    #[must_use]
    pub fn new_orthographic(
        left: f32,
        right: f32,
        bottom: f32,
        top: f32,
        near: f32,
        far: f32,
    ) -> Self {
        Self::with_projection(
            Projection::Orthographic {
                left,
                right,
                bottom,
                top,
            },
            near,
            far,
        )
    }

    #[must_use]
    pub fn with_projection(projection: Projection, near: f32, far: f32) -> Self {
        let mut camera = Self {
            id: CameraId::next(),
            projection,
            near,
            far,
            layers: Layers::default(),
            viewport: None,
            sub_cameras: Vec::new(),
            world_matrix: Mat4::IDENTITY,
            view_matrix: Mat4::IDENTITY,
            projection_matrix: Mat4::IDENTITY,
        };
        camera.update_projection_matrix();
        camera
    }

    #[must_use]
    pub fn id(&self) -> CameraId {
        self.id
    }

    /// Recomputes the projection matrix after editing `projection`, `near`
    /// or `far`. Depth maps to `[0, 1]`.
    pub fn update_projection_matrix(&mut self) {
        self.projection_matrix = match self.projection {
            Projection::Perspective { fov_y, aspect } => {
                Mat4::perspective_rh(fov_y, aspect, self.near, self.far)
            }
            Projection::Orthographic {
                left,
                right,
                bottom,
                top,
            } => Mat4::orthographic_rh(left, right, bottom, top, self.near, self.far),
        };
    }

    pub fn set_world_matrix(&mut self, world: Mat4) {
        self.world_matrix = world;
        self.view_matrix = world.inverse();
    }

    pub fn set_position(&mut self, position: Vec3) {
        let mut world = self.world_matrix;
        world.w_axis = position.extend(1.0);
        self.set_world_matrix(world);
    }

    /// Orients the camera at `eye` to look at `target`.
    pub fn look_at(&mut self, eye: Vec3, target: Vec3, up: Vec3) {
        let view = Mat4::look_at_rh(eye, target, up);
        self.view_matrix = view;
        self.world_matrix = view.inverse();
    }

    #[must_use]
    pub fn world_matrix(&self) -> Mat4 {
        self.world_matrix
    }

    #[must_use]
    pub fn view_matrix(&self) -> Mat4 {
        self.view_matrix
    }

    #[must_use]
    pub fn projection_matrix(&self) -> Mat4 {
        self.projection_matrix
    }

    #[must_use]
    pub fn view_projection_matrix(&self) -> Mat4 {
        self.projection_matrix * self.view_matrix
    }

    #[must_use]
    pub fn position(&self) -> Vec3 {
        self.world_matrix.w_axis.truncate()
    }

    #[must_use]
    pub fn frustum(&self) -> Frustum {
        Frustum::from_matrix(self.view_projection_matrix())
    }

    #[must_use]
    pub fn is_array_camera(&self) -> bool {
        !self.sub_cameras.is_empty()
    }
}

/// Six clip planes `(normal, d)` with normals pointing inwards.
#[derive(Debug, Clone, Copy, Default)]
pub struct Frustum {
    planes: [Vec4; 6], // Left, Right, Bottom, Top, Near, Far
}

impl Frustum {
    /// Gribb-Hartmann extraction for a `[0, 1]` depth range.
    #[must_use]
    pub fn from_matrix(m: Mat4) -> Self {
        let rows = [m.row(0), m.row(1), m.row(2), m.row(3)];

        let mut planes = [
            rows[3] + rows[0],
            rows[3] - rows[0],
            rows[3] + rows[1],
            rows[3] - rows[1],
            rows[2],
            rows[3] - rows[2],
        ];

        for plane in &mut planes {
            let length = plane.truncate().length();
            if length > 0.0 {
                *plane /= length;
            }
        }

        Self { planes }
    }

    #[must_use]
    pub fn planes(&self) -> &[Vec4; 6] {
        &self.planes
    }

    #[must_use]
    pub fn intersects_sphere(&self, center: Vec3, radius: f32) -> bool {
        self.planes
            .iter()
            .all(|plane| plane.truncate().dot(center) + plane.w >= -radius)
    }

    #[must_use]
    pub fn contains_point(&self, point: Vec3) -> bool {
        self.intersects_sphere(point, 0.0)
    }
}
