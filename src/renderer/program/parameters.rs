//! Program Parameters and Keys
//!
//! [`ProgramParameters`] is the complete input of shader generation: the
//! material's feature-flag projection, the drawn object's features and the
//! frame context (lights, shadows, tone mapping, clipping, fog).
//! [`ProgramKey`] is its deterministic bit-packed form. Two parameter sets
//! with equal keys generate byte-identical source.

use std::sync::Arc;

use xxhash_rust::xxh3::xxh3_64;

use crate::renderer::lights::LightCounts;
use crate::renderer::settings::{Precision, ShadowMapType, ToneMapping};
use crate::resources::{
    ColorSpace, Material, MaterialFeatures, MaterialKind, ShaderDefines, ShaderFamily,
};

/// Per-object inputs that select a program variant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ObjectFeatures {
    pub skinning: bool,
    pub bones: u32,
    pub morph_targets: u32,
    pub instancing: bool,
    pub instancing_color: bool,
    /// Geometry carries a color attribute
    pub vertex_colors: bool,
    pub vertex_tangents: bool,
    pub uv1: bool,
    pub receive_shadow: bool,
}

impl ObjectFeatures {
    fn bits(&self) -> u64 {
        u64::from(self.skinning)
            | u64::from(self.instancing) << 1
            | u64::from(self.instancing_color) << 2
            | u64::from(self.vertex_colors) << 3
            | u64::from(self.vertex_tangents) << 4
            | u64::from(self.uv1) << 5
            | u64::from(self.receive_shadow) << 6
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum FogKind {
    #[default]
    None,
    Linear,
    Exp2,
}

/// Frame-level inputs shared by every draw of a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramContext {
    pub lights: LightCounts,
    pub shadow_map_enabled: bool,
    pub shadow_map_type: ShadowMapType,
    /// Already `None` when rendering into an offscreen target
    pub tone_mapping: ToneMapping,
    pub output_color_space: ColorSpace,
    /// Global clipping planes in effect
    pub clipping_planes: u32,
    /// Whether material clipping planes are honored
    pub local_clipping: bool,
    pub fog: FogKind,
    pub precision: Precision,
}

impl Default for ProgramContext {
    fn default() -> Self {
        Self {
            lights: LightCounts::default(),
            shadow_map_enabled: false,
            shadow_map_type: ShadowMapType::default(),
            tone_mapping: ToneMapping::None,
            output_color_space: ColorSpace::Srgb,
            clipping_planes: 0,
            local_clipping: false,
            fog: FogKind::None,
            precision: Precision::Highp,
        }
    }
}

/// Bit-packed program identity.
///
/// - `words[0]`: material feature bits
/// - `words[1]`: shadow configuration, tone mapping, color space, fog and
///   precision
/// - `words[2]`: object feature bits
/// - `counts`: light counts, clipping counts, morph target and bone counts,
///   stored unclamped since each one is emitted as a define
///
/// Custom shader materials add content hashes of both sources and their
/// define set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramKey {
    pub family: ShaderFamily,
    pub words: [u64; 3],
    pub counts: [u32; 11],
    pub custom_vertex: u64,
    pub custom_fragment: u64,
    pub custom_defines: u64,
}

/// User-provided shader source.
#[derive(Debug, Clone)]
pub struct CustomSource {
    pub vertex: Arc<str>,
    pub fragment: Arc<str>,
    pub defines: ShaderDefines,
}

const FEATURE_DEFINES: &[(MaterialFeatures, &str)] = &[
    (MaterialFeatures::MAP, "USE_MAP"),
    (MaterialFeatures::ALPHA_MAP, "USE_ALPHAMAP"),
    (MaterialFeatures::AO_MAP, "USE_AOMAP"),
    (MaterialFeatures::LIGHT_MAP, "USE_LIGHTMAP"),
    (MaterialFeatures::EMISSIVE_MAP, "USE_EMISSIVEMAP"),
    (MaterialFeatures::BUMP_MAP, "USE_BUMPMAP"),
    (MaterialFeatures::NORMAL_MAP, "USE_NORMALMAP"),
    (MaterialFeatures::DISPLACEMENT_MAP, "USE_DISPLACEMENTMAP"),
    (MaterialFeatures::SPECULAR_MAP, "USE_SPECULARMAP"),
    (MaterialFeatures::ROUGHNESS_MAP, "USE_ROUGHNESSMAP"),
    (MaterialFeatures::METALNESS_MAP, "USE_METALNESSMAP"),
    (MaterialFeatures::ENV_MAP, "USE_ENVMAP"),
    (MaterialFeatures::CLEARCOAT, "USE_CLEARCOAT"),
    (MaterialFeatures::CLEARCOAT_MAP, "USE_CLEARCOATMAP"),
    (MaterialFeatures::CLEARCOAT_ROUGHNESS_MAP, "USE_CLEARCOAT_ROUGHNESSMAP"),
    (MaterialFeatures::CLEARCOAT_NORMAL_MAP, "USE_CLEARCOAT_NORMALMAP"),
    (MaterialFeatures::SHEEN, "USE_SHEEN"),
    (MaterialFeatures::SHEEN_COLOR_MAP, "USE_SHEEN_COLORMAP"),
    (MaterialFeatures::TRANSMISSION, "USE_TRANSMISSION"),
    (MaterialFeatures::TRANSMISSION_MAP, "USE_TRANSMISSIONMAP"),
    (MaterialFeatures::THICKNESS_MAP, "USE_THICKNESSMAP"),
    (MaterialFeatures::SPECULAR_INTENSITY_MAP, "USE_SPECULAR_INTENSITYMAP"),
    (MaterialFeatures::ATTENUATION, "USE_ATTENUATION"),
    (MaterialFeatures::FLAT_SHADING, "FLAT_SHADED"),
    (MaterialFeatures::DOUBLE_SIDED, "DOUBLE_SIDED"),
    (MaterialFeatures::FLIP_SIDED, "FLIP_SIDED"),
    (MaterialFeatures::ALPHA_TEST, "USE_ALPHATEST"),
    (MaterialFeatures::ALPHA_HASH, "USE_ALPHAHASH"),
    (MaterialFeatures::ALPHA_TO_COVERAGE, "ALPHA_TO_COVERAGE"),
    (MaterialFeatures::PREMULTIPLIED_ALPHA, "PREMULTIPLIED_ALPHA"),
    (MaterialFeatures::DITHERING, "DITHERING"),
    (MaterialFeatures::DEPTH_PACKING_RGBA, "DEPTH_PACKING_RGBA"),
    (MaterialFeatures::PHYSICAL_SPECULAR, "USE_SPECULAR"),
    (MaterialFeatures::IOR, "USE_IOR"),
];

/// Everything shader generation depends on.
#[derive(Debug, Clone)]
pub struct ProgramParameters {
    pub family: ShaderFamily,
    pub features: MaterialFeatures,
    pub object: ObjectFeatures,
    pub lights: LightCounts,
    pub shadow_map_enabled: bool,
    pub shadow_map_type: ShadowMapType,
    pub tone_mapping: ToneMapping,
    pub output_color_space: ColorSpace,
    pub num_clipping_planes: u32,
    pub num_clip_intersection: u32,
    pub fog: FogKind,
    pub precision: Precision,
    pub custom: Option<CustomSource>,
}

impl ProgramParameters {
    /// Projects a material, an object and the frame context onto the inputs
    /// that affect generated source. Inputs a family ignores are zeroed so
    /// they never split the cache.
    #[must_use]
    pub fn new(material: &Material, object: &ObjectFeatures, ctx: &ProgramContext) -> Self {
        let family = material.family();
        let mut features = material.features();
        let settings = material.settings();
        let uses_lights = material.kind().uses_lights();

        let fog = if features.contains(MaterialFeatures::FOG) {
            ctx.fog
        } else {
            FogKind::None
        };
        features.set(MaterialFeatures::FOG, fog != FogKind::None);

        let tone_mapping = if features.contains(MaterialFeatures::TONE_MAPPED) {
            ctx.tone_mapping
        } else {
            ToneMapping::None
        };
        features.set(MaterialFeatures::TONE_MAPPED, tone_mapping != ToneMapping::None);

        let local = if ctx.local_clipping {
            settings.clipping_planes.len() as u32
        } else {
            0
        };
        let num_clip_intersection = if settings.clip_intersection { local } else { 0 };
        if num_clip_intersection == 0 {
            features.remove(MaterialFeatures::CLIP_INTERSECTION);
        }

        let lights = if uses_lights {
            ctx.lights
        } else {
            LightCounts::default()
        };
        let shadow_map_enabled = uses_lights
            && ctx.shadow_map_enabled
            && object.receive_shadow
            && lights.shadow_total() > 0;

        let mut object = *object;
        if !shadow_map_enabled {
            object.receive_shadow = false;
        }
        if !object.skinning {
            object.bones = 0;
        }

        let custom = match material.kind() {
            MaterialKind::Shader(shader) => Some(CustomSource {
                vertex: shader.vertex.clone(),
                fragment: shader.fragment.clone(),
                defines: shader.defines.clone(),
            }),
            _ => None,
        };

        Self {
            family,
            features,
            object,
            lights,
            shadow_map_enabled,
            shadow_map_type: ctx.shadow_map_type,
            tone_mapping,
            output_color_space: ctx.output_color_space,
            num_clipping_planes: ctx.clipping_planes + local,
            num_clip_intersection,
            fog,
            precision: ctx.precision,
            custom,
        }
    }

    /// Deterministic cache key.
    #[must_use]
    pub fn key(&self) -> ProgramKey {
        let l = &self.lights;
        let color_space = match self.output_color_space {
            ColorSpace::Srgb => 0,
            ColorSpace::LinearSrgb => 1,
        };
        let word1 = u64::from(self.shadow_map_enabled)
            | (self.shadow_map_type as u64) << 1
            | self.tone_mapping.index() << 4
            | color_space << 8
            | (self.fog as u64) << 10
            | (self.precision as u64) << 12;
        let counts = [
            l.directional,
            l.point,
            l.spot,
            l.hemi,
            l.directional_shadows,
            l.point_shadows,
            l.spot_shadows,
            self.num_clipping_planes,
            self.num_clip_intersection,
            self.object.morph_targets,
            self.object.bones,
        ];

        let (custom_vertex, custom_fragment, custom_defines) = match &self.custom {
            Some(custom) => (
                xxh3_64(custom.vertex.as_bytes()),
                xxh3_64(custom.fragment.as_bytes()),
                custom.defines.compute_hash(),
            ),
            None => (0, 0, 0),
        };

        ProgramKey {
            family: self.family,
            words: [self.features.bits(), word1, self.object.bits()],
            counts,
            custom_vertex,
            custom_fragment,
            custom_defines,
        }
    }

    /// Display name used in logs and diagnostics.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.family.template()
    }

    /// Macro set prepended to both stages.
    #[must_use]
    pub fn defines(&self) -> ShaderDefines {
        let mut d = ShaderDefines::with_capacity(32);

        for &(flag, name) in FEATURE_DEFINES {
            if self.features.contains(flag) {
                d.set(name, "1");
            }
        }
        match self.family {
            ShaderFamily::Standard => d.set("STANDARD", "1"),
            ShaderFamily::Physical => {
                d.set("STANDARD", "1");
                d.set("PHYSICAL", "1");
            }
            _ => {}
        }
        if !self.features.contains(MaterialFeatures::TRANSPARENT) {
            d.set("OPAQUE", "1");
        }

        // Object
        let o = &self.object;
        let vertex_colors =
            self.features.contains(MaterialFeatures::VERTEX_COLORS) && o.vertex_colors;
        d.set_flag("USE_COLOR", vertex_colors || o.instancing_color);
        d.set_flag("USE_COLOR_ATTRIBUTE", vertex_colors);
        d.set_flag("USE_INSTANCING", o.instancing);
        d.set_flag("USE_INSTANCING_COLOR", o.instancing_color);
        if o.skinning {
            d.set("USE_SKINNING", "1");
            d.set_value("MAX_BONES", o.bones.max(1));
        }
        if o.morph_targets > 0 {
            d.set("USE_MORPHTARGETS", "1");
            d.set_value("MORPHTARGETS_COUNT", o.morph_targets);
        }
        d.set_flag(
            "USE_TANGENT",
            o.vertex_tangents && self.features.contains(MaterialFeatures::NORMAL_MAP),
        );
        d.set_flag(
            "USE_UV1",
            o.uv1
                && self
                    .features
                    .intersects(MaterialFeatures::AO_MAP | MaterialFeatures::LIGHT_MAP),
        );

        // Lights
        let l = &self.lights;
        d.set_value("NUM_DIR_LIGHTS", l.directional);
        d.set_value("NUM_POINT_LIGHTS", l.point);
        d.set_value("NUM_SPOT_LIGHTS", l.spot);
        d.set_value("NUM_HEMI_LIGHTS", l.hemi);
        if self.shadow_map_enabled {
            d.set("USE_SHADOWMAP", "1");
            d.set(self.shadow_map_type.define(), "1");
            d.set_value("NUM_DIR_LIGHT_SHADOWS", l.directional_shadows);
            d.set_value("NUM_POINT_LIGHT_SHADOWS", l.point_shadows);
            d.set_value("NUM_SPOT_LIGHT_SHADOWS", l.spot_shadows);
        }
        if self.family.uses_lights() || self.features.contains(MaterialFeatures::SHADER_LIGHTS) {
            d.set("USE_LIGHTS", "1");
        }

        // Output
        if let Some(function) = self.tone_mapping.function() {
            d.set("TONE_MAPPING", "1");
            d.set("TONE_MAPPING_FUNCTION", function);
        }
        if self.output_color_space == ColorSpace::Srgb {
            d.set("SRGB_OUTPUT", "1");
        }

        d.set_value("NUM_CLIPPING_PLANES", self.num_clipping_planes);
        d.set_value(
            "UNION_CLIPPING_PLANES",
            self.num_clipping_planes - self.num_clip_intersection,
        );

        match self.fog {
            FogKind::None => {}
            FogKind::Linear => d.set("USE_FOG", "1"),
            FogKind::Exp2 => {
                d.set("USE_FOG", "1");
                d.set("FOG_EXP2", "1");
            }
        }

        if let Some(custom) = &self.custom {
            d.merge(&custom.defines);
        }
        d
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::*;
    use crate::resources::{MaterialSettings, ShaderMaterial};

    fn lit_context() -> ProgramContext {
        ProgramContext {
            lights: LightCounts {
                directional: 2,
                point: 1,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn large_light_counts_keep_distinct_keys() {
        let phong = Material::new(MaterialKind::phong(Vec3::ONE));
        let with = |point: u32| {
            let ctx = ProgramContext {
                lights: LightCounts {
                    point,
                    ..Default::default()
                },
                ..Default::default()
            };
            ProgramParameters::new(&phong, &ObjectFeatures::default(), &ctx)
        };
        for (a, b) in [(255, 256), (300, 44), (0, 256)] {
            assert_ne!(with(a).key(), with(b).key(), "{a} vs {b} point lights");
        }
        assert_eq!(with(300).key(), with(300).key());
    }

    #[test]
    fn unlit_family_ignores_lights() {
        let basic = Material::new(MaterialKind::basic(Vec3::ONE));
        let a = ProgramParameters::new(&basic, &ObjectFeatures::default(), &lit_context());
        let unlit = ProgramContext::default();
        let b = ProgramParameters::new(&basic, &ObjectFeatures::default(), &unlit);
        assert_eq!(a.key(), b.key());

        let phong = Material::new(MaterialKind::phong(Vec3::ONE));
        let c = ProgramParameters::new(&phong, &ObjectFeatures::default(), &lit_context());
        let d = ProgramParameters::new(&phong, &ObjectFeatures::default(), &unlit);
        assert_ne!(c.key(), d.key());
    }

    #[test]
    fn equal_projections_share_keys_across_materials() {
        let a = Material::new(MaterialKind::standard(Vec3::X));
        let b = Material::new(MaterialKind::standard(Vec3::Y));
        let ctx = lit_context();
        let object = ObjectFeatures::default();
        assert_eq!(
            ProgramParameters::new(&a, &object, &ctx).key(),
            ProgramParameters::new(&b, &object, &ctx).key()
        );
    }

    #[test]
    fn custom_source_participates_in_key() {
        let a = Material::new(MaterialKind::Shader(ShaderMaterial::new(
            "void main(){}",
            "void main(){}",
        )));
        let b = Material::new(MaterialKind::Shader(ShaderMaterial::new(
            "void main(){}",
            "void main(){ }",
        )));
        let ctx = ProgramContext::default();
        let object = ObjectFeatures::default();
        assert_ne!(
            ProgramParameters::new(&a, &object, &ctx).key(),
            ProgramParameters::new(&b, &object, &ctx).key()
        );
    }

    #[test]
    fn fog_requires_scene_fog() {
        let material = Material::new(MaterialKind::basic(Vec3::ONE));
        let object = ObjectFeatures::default();
        let no_fog = ProgramParameters::new(&material, &object, &ProgramContext::default());
        assert!(!no_fog.defines().contains("USE_FOG"));

        let ctx = ProgramContext {
            fog: FogKind::Exp2,
            ..Default::default()
        };
        let fog = ProgramParameters::new(&material, &object, &ctx);
        assert_eq!(fog.defines().get("FOG_EXP2"), Some("1"));
        assert_ne!(fog.key(), no_fog.key());
    }

    #[test]
    fn local_clipping_counts_intersection_planes() {
        let settings = MaterialSettings {
            clipping_planes: vec![glam::Vec4::X, glam::Vec4::Y],
            clip_intersection: true,
            ..Default::default()
        };
        let material = Material::new(MaterialKind::basic(Vec3::ONE)).with_settings(settings);
        let ctx = ProgramContext {
            clipping_planes: 1,
            local_clipping: true,
            ..Default::default()
        };
        let params = ProgramParameters::new(&material, &ObjectFeatures::default(), &ctx);
        let defines = params.defines();
        assert_eq!(defines.get("NUM_CLIPPING_PLANES"), Some("3"));
        assert_eq!(defines.get("UNION_CLIPPING_PLANES"), Some("1"));
    }
}
