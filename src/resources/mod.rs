//! Core Resource Definitions
//!
//! CPU-side data the pipeline consumes, independent of any device:
//!
//! - [`Material`]: closed, versioned material description with a derived
//!   feature-flag view
//! - [`Geometry`]: vertex attributes, indices, groups and bounds
//! - [`Texture`]: texel data and sampling configuration
//! - [`ShaderDefines`]: interned `#define` sets
//! - [`UniformValue`]: typed uniform payloads compared by value
//!
//! Resources live in the [`Scene`](crate::scene::Scene) arenas and are
//! addressed with the slotmap handles declared here.

pub mod geometry;
pub mod material;
pub mod shader_defines;
pub mod texture;
pub mod uniforms;
pub mod version_tracker;

use slotmap::new_key_type;

new_key_type! {
    /// Handle of a [`Geometry`] in the scene arena.
    pub struct GeometryHandle;
    /// Handle of a [`Material`] in the scene arena.
    pub struct MaterialHandle;
    /// Handle of a [`Texture`] in the scene arena.
    pub struct TextureHandle;
    /// Handle of a render target owned by the
    /// [`RenderTargetManager`](crate::renderer::RenderTargetManager).
    pub struct RenderTargetId;
}

pub use geometry::{
    Attribute, AttributeSemantic, BoundingSphere, DrawRange, Geometry, GeometryGroup,
};
pub use material::{
    Blending, CustomBlending, DepthPacking, Material, MaterialFeatures, MaterialId, MaterialKind,
    MaterialMaps, MaterialSettings, PhysicalParams, PolygonOffset, ShaderFamily, ShaderMaterial,
    Side, StandardParams, StencilSettings,
};
pub use shader_defines::ShaderDefines;
pub use texture::{ColorSpace, Texture, TextureKind, TextureSampler, TextureSource};
pub use uniforms::{UniformList, UniformValue};
pub use version_tracker::{ChangeTracker, MutGuard};
