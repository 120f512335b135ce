//! Materials
//!
//! A [`Material`] is a closed, versioned description: a [`MaterialKind`]
//! payload, fixed-function [`MaterialSettings`] and texture [`MaterialMaps`].
//! Mutation goes through guards that bump the version on drop, so the
//! renderer re-derives the program key only when something changed.
//!
//! The derived [`MaterialFeatures`] view is the material's contribution to
//! the program cache key.

mod kinds;

pub use kinds::{
    DepthPacking, MaterialKind, PhysicalParams, ShaderFamily, ShaderMaterial, StandardParams,
};

use std::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use glam::Vec4;

use crate::resources::TextureHandle;
use crate::resources::texture::TextureSource;
use crate::resources::uniforms::{UniformList, UniformValue};
use crate::resources::version_tracker::{ChangeTracker, MutGuard};

bitflags! {
    /// Feature-flag projection of a material. Two materials with equal
    /// features, family and custom sources share a program.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct MaterialFeatures: u64 {
        const MAP                     = 1 << 0;
        const ALPHA_MAP               = 1 << 1;
        const AO_MAP                  = 1 << 2;
        const LIGHT_MAP               = 1 << 3;
        const EMISSIVE_MAP            = 1 << 4;
        const BUMP_MAP                = 1 << 5;
        const NORMAL_MAP              = 1 << 6;
        const DISPLACEMENT_MAP        = 1 << 7;
        const SPECULAR_MAP            = 1 << 8;
        const ROUGHNESS_MAP           = 1 << 9;
        const METALNESS_MAP           = 1 << 10;
        const ENV_MAP                 = 1 << 11;
        const CLEARCOAT               = 1 << 12;
        const CLEARCOAT_MAP           = 1 << 13;
        const CLEARCOAT_ROUGHNESS_MAP = 1 << 14;
        const CLEARCOAT_NORMAL_MAP    = 1 << 15;
        const SHEEN                   = 1 << 16;
        const SHEEN_COLOR_MAP         = 1 << 17;
        const TRANSMISSION            = 1 << 18;
        const TRANSMISSION_MAP        = 1 << 19;
        const THICKNESS_MAP           = 1 << 20;
        const SPECULAR_INTENSITY_MAP  = 1 << 21;
        const ATTENUATION             = 1 << 22;
        const VERTEX_COLORS           = 1 << 23;
        const FLAT_SHADING            = 1 << 24;
        const DOUBLE_SIDED            = 1 << 25;
        const FLIP_SIDED              = 1 << 26;
        const ALPHA_TEST              = 1 << 27;
        const ALPHA_HASH              = 1 << 28;
        const ALPHA_TO_COVERAGE       = 1 << 29;
        const PREMULTIPLIED_ALPHA     = 1 << 30;
        const TRANSPARENT             = 1 << 31;
        const DITHERING               = 1 << 32;
        const FOG                     = 1 << 33;
        const TONE_MAPPED             = 1 << 34;
        const DEPTH_PACKING_RGBA      = 1 << 35;
        const CLIP_INTERSECTION       = 1 << 36;
        const SHADER_LIGHTS           = 1 << 37;
        const PHYSICAL_SPECULAR       = 1 << 38;
        const IOR                     = 1 << 39;
    }
}

/// Stable material identity used for sorting and cache ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MaterialId(pub u64);

static NEXT_MATERIAL_ID: AtomicU64 = AtomicU64::new(1);

impl MaterialId {
    fn next() -> Self {
        Self(NEXT_MATERIAL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Side {
    #[default]
    Front,
    Back,
    Double,
}

impl Side {
    /// Side rendered into shadow maps when no explicit shadow side is set.
    #[must_use]
    pub fn shadow_default(self) -> Self {
        match self {
            Self::Front => Self::Back,
            Self::Back => Self::Front,
            Self::Double => Self::Double,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CustomBlending {
    pub src: wgpu::BlendFactor,
    pub dst: wgpu::BlendFactor,
    pub equation: wgpu::BlendOperation,
    /// Alpha channel; `None` mirrors the color channel
    pub src_alpha: Option<wgpu::BlendFactor>,
    pub dst_alpha: Option<wgpu::BlendFactor>,
    pub equation_alpha: Option<wgpu::BlendOperation>,
}

impl Default for CustomBlending {
    fn default() -> Self {
        Self {
            src: wgpu::BlendFactor::SrcAlpha,
            dst: wgpu::BlendFactor::OneMinusSrcAlpha,
            equation: wgpu::BlendOperation::Add,
            src_alpha: None,
            dst_alpha: None,
            equation_alpha: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Blending {
    None,
    #[default]
    Normal,
    Additive,
    Subtractive,
    Multiply,
    Custom(CustomBlending),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StencilSettings {
    pub func: wgpu::CompareFunction,
    pub reference: u32,
    pub func_mask: u32,
    pub write_mask: u32,
    pub fail: wgpu::StencilOperation,
    pub depth_fail: wgpu::StencilOperation,
    pub pass: wgpu::StencilOperation,
}

impl Default for StencilSettings {
    fn default() -> Self {
        Self {
            func: wgpu::CompareFunction::Always,
            reference: 0,
            func_mask: 0xff,
            write_mask: 0xff,
            fail: wgpu::StencilOperation::Keep,
            depth_fail: wgpu::StencilOperation::Keep,
            pass: wgpu::StencilOperation::Keep,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PolygonOffset {
    pub factor: f32,
    pub units: f32,
}

/// Fixed-function and pipeline-relevant settings.
#[derive(Debug, Clone, PartialEq)]
pub struct MaterialSettings {
    pub visible: bool,
    pub side: Side,
    /// Overrides [`Side::shadow_default`] in the shadow pass
    pub shadow_side: Option<Side>,
    pub transparent: bool,
    pub opacity: f32,
    pub blending: Blending,
    pub premultiplied_alpha: bool,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_func: wgpu::CompareFunction,
    /// `Some` enables the stencil test
    pub stencil: Option<StencilSettings>,
    pub polygon_offset: Option<PolygonOffset>,
    pub color_write: bool,
    /// Fragments with alpha below this are discarded; `0.0` disables
    pub alpha_test: f32,
    pub alpha_hash: bool,
    pub alpha_to_coverage: bool,
    pub vertex_colors: bool,
    pub flat_shading: bool,
    pub fog: bool,
    pub tone_mapped: bool,
    pub dithering: bool,
    /// Draw double-sided transparent objects in one pass
    pub force_single_pass: bool,
    /// World-space local clipping planes `(normal, constant)`
    pub clipping_planes: Vec<Vec4>,
    pub clip_intersection: bool,
    pub clip_shadows: bool,
}

impl Default for MaterialSettings {
    fn default() -> Self {
        Self {
            visible: true,
            side: Side::Front,
            shadow_side: None,
            transparent: false,
            opacity: 1.0,
            blending: Blending::Normal,
            premultiplied_alpha: false,
            depth_test: true,
            depth_write: true,
            depth_func: wgpu::CompareFunction::LessEqual,
            stencil: None,
            polygon_offset: None,
            color_write: true,
            alpha_test: 0.0,
            alpha_hash: false,
            alpha_to_coverage: false,
            vertex_colors: false,
            flat_shading: false,
            fog: true,
            tone_mapped: true,
            dithering: false,
            force_single_pass: false,
            clipping_planes: Vec::new(),
            clip_intersection: false,
            clip_shadows: false,
        }
    }
}

/// Optional texture maps.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MaterialMaps {
    pub map: Option<TextureHandle>,
    pub alpha_map: Option<TextureHandle>,
    pub ao_map: Option<TextureHandle>,
    pub light_map: Option<TextureHandle>,
    pub emissive_map: Option<TextureHandle>,
    pub bump_map: Option<TextureHandle>,
    pub normal_map: Option<TextureHandle>,
    pub displacement_map: Option<TextureHandle>,
    pub specular_map: Option<TextureHandle>,
    pub roughness_map: Option<TextureHandle>,
    pub metalness_map: Option<TextureHandle>,
    pub env_map: Option<TextureHandle>,
    pub clearcoat_map: Option<TextureHandle>,
    pub clearcoat_roughness_map: Option<TextureHandle>,
    pub clearcoat_normal_map: Option<TextureHandle>,
    pub sheen_color_map: Option<TextureHandle>,
    pub transmission_map: Option<TextureHandle>,
    pub thickness_map: Option<TextureHandle>,
    pub specular_intensity_map: Option<TextureHandle>,
}

impl MaterialMaps {
    /// `(uniform name, feature bit, handle)` for every map slot.
    fn slots(&self) -> [(&'static str, MaterialFeatures, Option<TextureHandle>); 19] {
        use MaterialFeatures as F;
        [
            ("map", F::MAP, self.map),
            ("alphaMap", F::ALPHA_MAP, self.alpha_map),
            ("aoMap", F::AO_MAP, self.ao_map),
            ("lightMap", F::LIGHT_MAP, self.light_map),
            ("emissiveMap", F::EMISSIVE_MAP, self.emissive_map),
            ("bumpMap", F::BUMP_MAP, self.bump_map),
            ("normalMap", F::NORMAL_MAP, self.normal_map),
            ("displacementMap", F::DISPLACEMENT_MAP, self.displacement_map),
            ("specularMap", F::SPECULAR_MAP, self.specular_map),
            ("roughnessMap", F::ROUGHNESS_MAP, self.roughness_map),
            ("metalnessMap", F::METALNESS_MAP, self.metalness_map),
            ("envMap", F::ENV_MAP, self.env_map),
            ("clearcoatMap", F::CLEARCOAT_MAP, self.clearcoat_map),
            (
                "clearcoatRoughnessMap",
                F::CLEARCOAT_ROUGHNESS_MAP,
                self.clearcoat_roughness_map,
            ),
            (
                "clearcoatNormalMap",
                F::CLEARCOAT_NORMAL_MAP,
                self.clearcoat_normal_map,
            ),
            ("sheenColorMap", F::SHEEN_COLOR_MAP, self.sheen_color_map),
            ("transmissionMap", F::TRANSMISSION_MAP, self.transmission_map),
            ("thicknessMap", F::THICKNESS_MAP, self.thickness_map),
            (
                "specularIntensityMap",
                F::SPECULAR_INTENSITY_MAP,
                self.specular_intensity_map,
            ),
        ]
    }

    /// Iterates the present maps as `(uniform name, handle)`.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, TextureHandle)> {
        self.slots()
            .into_iter()
            .filter_map(|(name, _, handle)| handle.map(|h| (name, h)))
    }
}

#[derive(Debug)]
pub struct Material {
    pub name: String,
    id: MaterialId,
    kind: MaterialKind,
    settings: MaterialSettings,
    maps: MaterialMaps,
    tracker: ChangeTracker,
}

impl Clone for Material {
    /// Clones get a fresh identity, like any newly created material.
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            id: MaterialId::next(),
            kind: self.kind.clone(),
            settings: self.settings.clone(),
            maps: self.maps,
            tracker: ChangeTracker::new(),
        }
    }
}

impl Material {
    #[must_use]
    pub fn new(kind: MaterialKind) -> Self {
        Self {
            name: String::new(),
            id: MaterialId::next(),
            kind,
            settings: MaterialSettings::default(),
            maps: MaterialMaps::default(),
            tracker: ChangeTracker::new(),
        }
    }

    #[must_use]
    pub fn with_settings(mut self, settings: MaterialSettings) -> Self {
        self.settings = settings;
        self
    }

    #[must_use]
    pub fn with_maps(mut self, maps: MaterialMaps) -> Self {
        self.maps = maps;
        self
    }

    #[must_use]
    pub fn id(&self) -> MaterialId {
        self.id
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.tracker.version()
    }

    #[must_use]
    pub fn kind(&self) -> &MaterialKind {
        &self.kind
    }

    #[must_use]
    pub fn settings(&self) -> &MaterialSettings {
        &self.settings
    }

    #[must_use]
    pub fn maps(&self) -> &MaterialMaps {
        &self.maps
    }

    pub fn kind_mut(&mut self) -> MutGuard<'_, MaterialKind> {
        self.tracker.guard(&mut self.kind)
    }

    pub fn settings_mut(&mut self) -> MutGuard<'_, MaterialSettings> {
        self.tracker.guard(&mut self.settings)
    }

    pub fn maps_mut(&mut self) -> MutGuard<'_, MaterialMaps> {
        self.tracker.guard(&mut self.maps)
    }

    /// Bumps the version after changes made outside the guards.
    pub fn needs_update(&mut self) {
        self.tracker.changed();
    }

    #[must_use]
    pub fn family(&self) -> ShaderFamily {
        self.kind.family()
    }

    /// Transmission factor; only physical materials transmit.
    #[must_use]
    pub fn transmission(&self) -> f32 {
        match &self.kind {
            MaterialKind::Physical(p) => p.transmission,
            _ => 0.0,
        }
    }

    /// Whether the material is drawn with blending enabled.
    #[must_use]
    pub fn is_blended(&self) -> bool {
        self.settings.transparent && self.settings.blending != Blending::None
    }

    /// Derives the feature-flag projection.
    #[must_use]
    pub fn features(&self) -> MaterialFeatures {
        use MaterialFeatures as F;

        let mut features = F::empty();
        for (_, bit, handle) in self.maps.slots() {
            if handle.is_some() {
                features |= bit;
            }
        }

        let s = &self.settings;
        features.set(F::VERTEX_COLORS, s.vertex_colors);
        features.set(F::FLAT_SHADING, s.flat_shading);
        features.set(F::DOUBLE_SIDED, s.side == Side::Double);
        features.set(F::FLIP_SIDED, s.side == Side::Back);
        features.set(F::ALPHA_TEST, s.alpha_test > 0.0);
        features.set(F::ALPHA_HASH, s.alpha_hash);
        features.set(F::ALPHA_TO_COVERAGE, s.alpha_to_coverage);
        features.set(F::PREMULTIPLIED_ALPHA, s.premultiplied_alpha);
        features.set(F::TRANSPARENT, s.transparent);
        features.set(F::DITHERING, s.dithering);
        features.set(F::FOG, s.fog);
        features.set(F::TONE_MAPPED, s.tone_mapped);
        features.set(F::CLIP_INTERSECTION, s.clip_intersection);

        match &self.kind {
            MaterialKind::Physical(p) => {
                features.set(F::CLEARCOAT, p.clearcoat > 0.0);
                features.set(F::SHEEN, p.sheen > 0.0);
                features.set(F::TRANSMISSION, p.transmission > 0.0);
                features.set(F::ATTENUATION, p.attenuation_distance.is_finite());
                features.set(
                    F::PHYSICAL_SPECULAR,
                    p.specular_intensity != 1.0 || p.specular_color != glam::Vec3::ONE,
                );
                features.set(F::IOR, (p.ior - 1.5).abs() > f32::EPSILON);
            }
            MaterialKind::Depth { packing } => {
                features.set(F::DEPTH_PACKING_RGBA, *packing == DepthPacking::Rgba);
            }
            MaterialKind::Shader(shader) => {
                features.set(F::SHADER_LIGHTS, shader.lights);
            }
            _ => {}
        }

        features
    }

    /// Appends the material's uniform values.
    pub fn write_uniforms<'a>(&'a self, out: &mut UniformList<'a>) {
        let s = &self.settings;
        out.push(("opacity", UniformValue::Float(s.opacity)));
        if s.alpha_test > 0.0 {
            out.push(("alphaTest", UniformValue::Float(s.alpha_test)));
        }
        if let Some(color) = self.kind.color() {
            out.push(("diffuse", UniformValue::Vec3(color)));
        }

        match &self.kind {
            MaterialKind::Basic { .. } => {}
            MaterialKind::Lambert { emissive, .. } => {
                out.push(("emissive", UniformValue::Vec3(*emissive)));
            }
            MaterialKind::Phong {
                emissive,
                specular,
                shininess,
                ..
            } => {
                out.push(("emissive", UniformValue::Vec3(*emissive)));
                out.push(("specular", UniformValue::Vec3(*specular)));
                out.push(("shininess", UniformValue::Float(shininess.max(1e-4))));
            }
            MaterialKind::Standard(p) => write_standard(p, out),
            MaterialKind::Physical(p) => {
                write_standard(&p.standard, out);
                out.push(("clearcoat", UniformValue::Float(p.clearcoat)));
                out.push((
                    "clearcoatRoughness",
                    UniformValue::Float(p.clearcoat_roughness),
                ));
                out.push(("sheen", UniformValue::Float(p.sheen)));
                out.push(("sheenColor", UniformValue::Vec3(p.sheen_color)));
                out.push(("sheenRoughness", UniformValue::Float(p.sheen_roughness)));
                out.push(("transmission", UniformValue::Float(p.transmission)));
                out.push(("thickness", UniformValue::Float(p.thickness)));
                out.push(("ior", UniformValue::Float(p.ior)));
                out.push((
                    "attenuationDistance",
                    UniformValue::Float(p.attenuation_distance),
                ));
                out.push(("attenuationColor", UniformValue::Vec3(p.attenuation_color)));
                out.push((
                    "specularIntensity",
                    UniformValue::Float(p.specular_intensity),
                ));
                out.push(("specularColor", UniformValue::Vec3(p.specular_color)));
            }
            MaterialKind::Depth { .. } => {}
            MaterialKind::Distance {
                reference_position,
                near,
                far,
            } => {
                out.push((
                    "referencePosition",
                    UniformValue::Vec3(*reference_position),
                ));
                out.push(("nearDistance", UniformValue::Float(*near)));
                out.push(("farDistance", UniformValue::Float(*far)));
            }
            MaterialKind::Shader(shader) => {
                for (name, value) in &shader.uniforms {
                    out.push((name.as_str(), value.clone()));
                }
            }
        }

        for (name, handle) in self.maps.iter() {
            out.push((name, UniformValue::Texture(TextureSource::Texture(handle))));
        }
    }
}

fn write_standard(p: &StandardParams, out: &mut UniformList<'_>) {
    out.push((
        "emissive",
        UniformValue::Vec3(p.emissive * p.emissive_intensity),
    ));
    out.push(("roughness", UniformValue::Float(p.roughness)));
    out.push(("metalness", UniformValue::Float(p.metalness)));
    out.push(("envMapIntensity", UniformValue::Float(p.env_map_intensity)));
    out.push(("normalScale", UniformValue::Vec2(p.normal_scale)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn guards_bump_version() {
        let mut material = Material::new(MaterialKind::basic(Vec3::ONE));
        let v0 = material.version();
        material.settings_mut().transparent = true;
        assert_eq!(material.version(), v0 + 1);
        {
            let mut kind = material.kind_mut();
            *kind = MaterialKind::phong(Vec3::X);
        }
        assert_eq!(material.version(), v0 + 2);
    }

    #[test]
    fn clone_gets_fresh_identity() {
        let material = Material::new(MaterialKind::basic(Vec3::ONE));
        let copy = material.clone();
        assert_ne!(material.id(), copy.id());
        assert_eq!(material.features(), copy.features());
    }

    #[test]
    fn features_reflect_settings_and_kind() {
        let mut material = Material::new(MaterialKind::physical(PhysicalParams {
            transmission: 0.5,
            ..PhysicalParams::default()
        }));
        material.settings_mut().side = Side::Double;
        let f = material.features();
        assert!(f.contains(MaterialFeatures::TRANSMISSION | MaterialFeatures::DOUBLE_SIDED));
        assert!(!f.contains(MaterialFeatures::MAP));
        assert!((material.transmission() - 0.5).abs() < f32::EPSILON);
    }
}
