//! Scene Graph
//!
//! The retained-mode input of the renderer:
//! - [`Scene`]: node tree and resource arenas
//! - [`Node`]: hierarchy, visibility, layers, ordering and shadow flags
//! - [`Camera`] / [`Frustum`]: view, projection, viewport, culling
//! - [`Light`]: tagged light kinds with optional shadow configuration

pub mod camera;
pub mod light;
pub mod node;
#[allow(clippy::module_inception)]
pub mod scene;

use slotmap::new_key_type;

new_key_type! {
    /// Handle of a [`Node`] in the scene arena.
    pub struct NodeHandle;
}

pub use camera::{Camera, CameraId, Frustum, Projection, Viewport};
pub use light::{Light, LightKind, LightShadow};
pub use node::{Instances, Layers, MaterialSlot, Mesh, Node, NodeKind, Skin};
pub use scene::{Fog, Scene};
