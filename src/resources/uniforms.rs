//! Uniform Values
//!
//! [`UniformValue`] is the typed payload of one uniform slot. Values compare
//! by content, which is what the
//! [`UniformBinder`](crate::renderer::UniformBinder) uses to skip redundant
//! device writes.

use glam::{Mat3, Mat4, Vec2, Vec3, Vec4};
use smallvec::SmallVec;

use super::texture::TextureSource;

/// GLSL type of a reflected uniform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UniformType {
    Float,
    Int,
    Bool,
    Vec2,
    Vec3,
    Vec4,
    Mat3,
    Mat4,
    Sampler2D,
    SamplerCube,
    Sampler2DShadow,
}

impl UniformType {
    /// Maps a GLSL type keyword.
    #[must_use]
    pub fn from_glsl(ty: &str) -> Option<Self> {
        Some(match ty {
            "float" => Self::Float,
            "int" | "uint" => Self::Int,
            "bool" => Self::Bool,
            "vec2" => Self::Vec2,
            "vec3" => Self::Vec3,
            "vec4" => Self::Vec4,
            "mat3" => Self::Mat3,
            "mat4" => Self::Mat4,
            "sampler2D" => Self::Sampler2D,
            "samplerCube" => Self::SamplerCube,
            "sampler2DShadow" => Self::Sampler2DShadow,
            _ => return None,
        })
    }

    #[must_use]
    pub fn is_sampler(self) -> bool {
        matches!(
            self,
            Self::Sampler2D | Self::SamplerCube | Self::Sampler2DShadow
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UniformValue {
    Float(f32),
    Int(i32),
    Bool(bool),
    Vec2(Vec2),
    Vec3(Vec3),
    Vec4(Vec4),
    Mat3(Mat3),
    Mat4(Mat4),
    FloatArray(Vec<f32>),
    Vec3Array(Vec<Vec3>),
    Vec4Array(Vec<Vec4>),
    Mat4Array(Vec<Mat4>),
    Texture(TextureSource),
}

impl UniformValue {
    #[must_use]
    pub fn is_texture(&self) -> bool {
        matches!(self, Self::Texture(_))
    }
}

impl From<f32> for UniformValue {
    fn from(v: f32) -> Self {
        Self::Float(v)
    }
}

impl From<i32> for UniformValue {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for UniformValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<Vec2> for UniformValue {
    fn from(v: Vec2) -> Self {
        Self::Vec2(v)
    }
}

impl From<Vec3> for UniformValue {
    fn from(v: Vec3) -> Self {
        Self::Vec3(v)
    }
}

impl From<Vec4> for UniformValue {
    fn from(v: Vec4) -> Self {
        Self::Vec4(v)
    }
}

impl From<Mat3> for UniformValue {
    fn from(v: Mat3) -> Self {
        Self::Mat3(v)
    }
}

impl From<Mat4> for UniformValue {
    fn from(v: Mat4) -> Self {
        Self::Mat4(v)
    }
}

impl From<TextureSource> for UniformValue {
    fn from(v: TextureSource) -> Self {
        Self::Texture(v)
    }
}

/// Per-draw uniform list. Names borrow from the material for custom
/// uniforms and are `'static` for built-ins.
pub type UniformList<'a> = SmallVec<[(&'a str, UniformValue); 24]>;
