use glam::{Mat4, Vec3};

use crate::resources::version_tracker::ChangeTracker;
use crate::resources::{GeometryHandle, MaterialHandle};
use crate::scene::NodeHandle;
use crate::scene::light::Light;

/// 32-bit layer mask. An object is drawn by a camera when the masks share at
/// least one bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Layers(pub u32);

impl Default for Layers {
    fn default() -> Self {
        Self(1)
    }
}

impl Layers {
    pub const ALL: Self = Self(u32::MAX);

    pub fn set(&mut self, layer: u32) {
        self.0 = 1 << layer;
    }

    pub fn enable(&mut self, layer: u32) {
        self.0 |= 1 << layer;
    }

    pub fn disable(&mut self, layer: u32) {
        self.0 &= !(1 << layer);
    }

    #[must_use]
    pub fn test(self, other: Layers) -> bool {
        self.0 & other.0 != 0
    }
}

/// A mesh uses one material, or one material per geometry group.
#[derive(Debug, Clone, PartialEq)]
pub enum MaterialSlot {
    Single(MaterialHandle),
    Multi(Vec<MaterialHandle>),
}

/// Bone matrices (bone world × inverse bind), computed by the animation
/// system.
#[derive(Debug, Clone, PartialEq)]
pub struct Skin {
    pub bone_matrices: Vec<Mat4>,
    pub bind_matrix: Mat4,
}

/// Per-instance transforms and optional colors.
#[derive(Debug, Clone)]
pub struct Instances {
    matrices: Vec<Mat4>,
    colors: Option<Vec<Vec3>>,
    tracker: ChangeTracker,
}

impl Instances {
    #[must_use]
    pub fn new(matrices: Vec<Mat4>) -> Self {
        Self {
            matrices,
            colors: None,
            tracker: ChangeTracker::new(),
        }
    }

    #[must_use]
    pub fn count(&self) -> u32 {
        self.matrices.len() as u32
    }

    #[must_use]
    pub fn matrices(&self) -> &[Mat4] {
        &self.matrices
    }

    #[must_use]
    pub fn colors(&self) -> Option<&[Vec3]> {
        self.colors.as_deref()
    }

    pub fn set_matrix(&mut self, index: usize, matrix: Mat4) {
        if let Some(m) = self.matrices.get_mut(index) {
            *m = matrix;
            self.tracker.changed();
        }
    }

    pub fn set_colors(&mut self, colors: Vec<Vec3>) {
        self.colors = Some(colors);
        self.tracker.changed();
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.tracker.version()
    }
}

#[derive(Debug, Clone)]
pub struct Mesh {
    pub geometry: GeometryHandle,
    pub material: MaterialSlot,
    pub skin: Option<Skin>,
    /// Weights of the geometry's morph targets
    pub morph_influences: Vec<f32>,
    pub instances: Option<Instances>,
}

impl Mesh {
    #[must_use]
    pub fn new(geometry: GeometryHandle, material: MaterialHandle) -> Self {
        Self {
            geometry,
            material: MaterialSlot::Single(material),
            skin: None,
            morph_influences: Vec::new(),
            instances: None,
        }
    }

    #[must_use]
    pub fn new_multi(geometry: GeometryHandle, materials: Vec<MaterialHandle>) -> Self {
        Self {
            material: MaterialSlot::Multi(materials),
            ..Self::new(geometry, MaterialHandle::default())
        }
    }
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Group,
    Mesh(Mesh),
    Light(Light),
}

/// Scene node. The hierarchy and world transforms are maintained by
/// [`Scene`](crate::scene::Scene); the renderer only reads them.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    pub visible: bool,
    pub layers: Layers,
    pub local_matrix: Mat4,
    pub render_order: i32,
    /// Assigns a group order to this node and every descendant
    pub group_order: Option<i32>,
    pub frustum_culled: bool,
    pub cast_shadow: bool,
    pub receive_shadow: bool,

    pub(crate) id: u32,
    pub(crate) parent: Option<NodeHandle>,
    pub(crate) children: Vec<NodeHandle>,
    pub(crate) world_matrix: Mat4,
}

impl Node {
    #[must_use]
    pub fn new(kind: NodeKind) -> Self {
        Self {
            name: String::new(),
            kind,
            visible: true,
            layers: Layers::default(),
            local_matrix: Mat4::IDENTITY,
            render_order: 0,
            group_order: None,
            frustum_culled: true,
            cast_shadow: false,
            receive_shadow: false,
            id: 0,
            parent: None,
            children: Vec::new(),
            world_matrix: Mat4::IDENTITY,
        }
    }

    #[must_use]
    pub fn group() -> Self {
        Self::new(NodeKind::Group)
    }

    #[must_use]
    pub fn mesh(mesh: Mesh) -> Self {
        Self::new(NodeKind::Mesh(mesh))
    }

    #[must_use]
    pub fn light(light: Light) -> Self {
        Self::new(NodeKind::Light(light))
    }

    #[must_use]
    pub fn with_position(mut self, position: Vec3) -> Self {
        self.local_matrix.w_axis = position.extend(1.0);
        self
    }

    pub fn set_position(&mut self, position: Vec3) {
        self.local_matrix.w_axis = position.extend(1.0);
    }

    /// Stable per-scene object id; breaks sort ties.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn parent(&self) -> Option<NodeHandle> {
        self.parent
    }

    #[must_use]
    pub fn children(&self) -> &[NodeHandle] {
        &self.children
    }

    #[must_use]
    pub fn world_matrix(&self) -> Mat4 {
        self.world_matrix
    }

    #[must_use]
    pub fn world_position(&self) -> Vec3 {
        self.world_matrix.w_axis.truncate()
    }

    #[must_use]
    pub fn as_mesh(&self) -> Option<&Mesh> {
        match &self.kind {
            NodeKind::Mesh(mesh) => Some(mesh),
            _ => None,
        }
    }

    pub fn as_mesh_mut(&mut self) -> Option<&mut Mesh> {
        match &mut self.kind {
            NodeKind::Mesh(mesh) => Some(mesh),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_light(&self) -> Option<&Light> {
        match &self.kind {
            NodeKind::Light(light) => Some(light),
            _ => None,
        }
    }
}
