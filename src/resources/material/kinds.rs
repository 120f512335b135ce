//! Material kinds and their per-kind parameters.

use std::collections::BTreeMap;
use std::sync::Arc;

use glam::{Vec2, Vec3};

use crate::resources::shader_defines::ShaderDefines;
use crate::resources::uniforms::UniformValue;

/// Template family a material compiles against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShaderFamily {
    Basic,
    Lambert,
    Phong,
    Standard,
    Physical,
    Depth,
    Distance,
    Custom,
}

impl ShaderFamily {
    /// Template file stem.
    #[must_use]
    pub fn template(self) -> &'static str {
        match self {
            Self::Basic => "meshbasic",
            Self::Lambert => "meshlambert",
            Self::Phong => "meshphong",
            Self::Standard | Self::Physical => "meshphysical",
            Self::Depth => "depth",
            Self::Distance => "distance",
            Self::Custom => "custom",
        }
    }

    #[must_use]
    pub fn uses_lights(self) -> bool {
        matches!(
            self,
            Self::Lambert | Self::Phong | Self::Standard | Self::Physical
        )
    }

    pub(crate) fn index(self) -> u64 {
        self as u64
    }
}

/// How a depth material encodes depth into the color output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DepthPacking {
    #[default]
    Basic,
    Rgba,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StandardParams {
    pub color: Vec3,
    pub emissive: Vec3,
    pub emissive_intensity: f32,
    pub roughness: f32,
    pub metalness: f32,
    pub env_map_intensity: f32,
    pub normal_scale: Vec2,
}

impl Default for StandardParams {
    fn default() -> Self {
        Self {
            color: Vec3::ONE,
            emissive: Vec3::ZERO,
            emissive_intensity: 1.0,
            roughness: 1.0,
            metalness: 0.0,
            env_map_intensity: 1.0,
            normal_scale: Vec2::ONE,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhysicalParams {
    pub standard: StandardParams,
    pub clearcoat: f32,
    pub clearcoat_roughness: f32,
    pub sheen: f32,
    pub sheen_color: Vec3,
    pub sheen_roughness: f32,
    pub transmission: f32,
    pub thickness: f32,
    pub ior: f32,
    /// `f32::INFINITY` disables attenuation
    pub attenuation_distance: f32,
    pub attenuation_color: Vec3,
    pub specular_intensity: f32,
    pub specular_color: Vec3,
}

impl Default for PhysicalParams {
    fn default() -> Self {
        Self {
            standard: StandardParams::default(),
            clearcoat: 0.0,
            clearcoat_roughness: 0.0,
            sheen: 0.0,
            sheen_color: Vec3::ZERO,
            sheen_roughness: 1.0,
            transmission: 0.0,
            thickness: 0.0,
            ior: 1.5,
            attenuation_distance: f32::INFINITY,
            attenuation_color: Vec3::ONE,
            specular_intensity: 1.0,
            specular_color: Vec3::ONE,
        }
    }
}

/// User-provided GLSL. `#include <chunk>` lines are inlined from the chunk
/// library before compiling.
#[derive(Debug, Clone, PartialEq)]
pub struct ShaderMaterial {
    pub vertex: Arc<str>,
    pub fragment: Arc<str>,
    pub uniforms: BTreeMap<String, UniformValue>,
    pub defines: ShaderDefines,
    /// Consume the scene lights block
    pub lights: bool,
}

impl ShaderMaterial {
    #[must_use]
    pub fn new(vertex: impl Into<Arc<str>>, fragment: impl Into<Arc<str>>) -> Self {
        Self {
            vertex: vertex.into(),
            fragment: fragment.into(),
            uniforms: BTreeMap::new(),
            defines: ShaderDefines::new(),
            lights: false,
        }
    }

    #[must_use]
    pub fn with_uniform(mut self, name: &str, value: impl Into<UniformValue>) -> Self {
        self.uniforms.insert(name.to_string(), value.into());
        self
    }
}

/// Closed set of material kinds with per-kind payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum MaterialKind {
    /// Unlit color.
    Basic { color: Vec3 },
    /// Per-vertex diffuse lighting.
    Lambert { color: Vec3, emissive: Vec3 },
    /// Blinn-Phong.
    Phong {
        color: Vec3,
        emissive: Vec3,
        specular: Vec3,
        shininess: f32,
    },
    Standard(StandardParams),
    Physical(PhysicalParams),
    /// Writes depth only; used for shadow maps of directional and spot
    /// lights.
    Depth { packing: DepthPacking },
    /// Writes normalized distance to a reference point; used for point light
    /// shadow maps.
    Distance {
        reference_position: Vec3,
        near: f32,
        far: f32,
    },
    Shader(ShaderMaterial),
}

impl MaterialKind {
    #[must_use]
    pub fn basic(color: Vec3) -> Self {
        Self::Basic { color }
    }

    #[must_use]
    pub fn lambert(color: Vec3) -> Self {
        Self::Lambert {
            color,
            emissive: Vec3::ZERO,
        }
    }

    #[must_use]
    pub fn phong(color: Vec3) -> Self {
        Self::Phong {
            color,
            emissive: Vec3::ZERO,
            specular: Vec3::splat(0.067),
            shininess: 30.0,
        }
    }

    #[must_use]
    pub fn standard(color: Vec3) -> Self {
        Self::Standard(StandardParams {
            color,
            ..StandardParams::default()
        })
    }

    #[must_use]
    pub fn physical(params: PhysicalParams) -> Self {
        Self::Physical(params)
    }

    #[must_use]
    pub fn family(&self) -> ShaderFamily {
        match self {
            Self::Basic { .. } => ShaderFamily::Basic,
            Self::Lambert { .. } => ShaderFamily::Lambert,
            Self::Phong { .. } => ShaderFamily::Phong,
            Self::Standard(_) => ShaderFamily::Standard,
            Self::Physical(_) => ShaderFamily::Physical,
            Self::Depth { .. } => ShaderFamily::Depth,
            Self::Distance { .. } => ShaderFamily::Distance,
            Self::Shader(_) => ShaderFamily::Custom,
        }
    }

    #[must_use]
    pub fn uses_lights(&self) -> bool {
        match self {
            Self::Shader(shader) => shader.lights,
            other => other.family().uses_lights(),
        }
    }

    /// Base color, if the kind has one.
    #[must_use]
    pub fn color(&self) -> Option<Vec3> {
        match self {
            Self::Basic { color } | Self::Lambert { color, .. } | Self::Phong { color, .. } => {
                Some(*color)
            }
            Self::Standard(p) => Some(p.color),
            Self::Physical(p) => Some(p.standard.color),
            _ => None,
        }
    }
}
