//! Shader Source Generation
//!
//! A pure function from [`ProgramParameters`] to GLSL. Each stage is:
//!
//! ```text
//! #version 300 es
//! precision <p> float; precision <p> int;
//! #define ...            (sorted by name)
//! <rendered template>
//! ```
//!
//! No device is involved, so generation is unit-testable on its own.

use std::collections::BTreeMap;

use serde::Serialize;

use super::parameters::ProgramParameters;
use super::shader_manager::{expand_include_directives, get_env};
use crate::errors::Result;
use crate::renderer::settings::Precision;
use crate::resources::ShaderDefines;

/// Generated source of both stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderSources {
    pub vertex: String,
    pub fragment: String,
}

#[derive(Serialize)]
struct ShaderContext {
    #[serde(flatten)]
    defines: BTreeMap<String, String>,
}

fn header(precision: Precision, defines: &ShaderDefines) -> String {
    let p = precision.as_str();
    format!(
        "#version 300 es\nprecision {p} float;\nprecision {p} int;\nprecision {p} sampler2D;\n{}",
        defines.to_prelude()
    )
}

pub struct ShaderGenerator;

impl ShaderGenerator {
    /// Generates both stages for `params`.
    pub fn generate(params: &ProgramParameters) -> Result<ShaderSources> {
        let env = get_env();
        let defines = params.defines();
        let header = header(params.precision, &defines);
        let ctx = ShaderContext {
            defines: defines.to_map(),
        };

        let (vertex, fragment) = match &params.custom {
            Some(custom) => {
                let vertex = format!(
                    "{{$ include \"custom_prefix_vertex\" $}}\n{}",
                    expand_include_directives(&custom.vertex)
                );
                let fragment = format!(
                    "{{$ include \"custom_prefix_fragment\" $}}\n{}",
                    expand_include_directives(&custom.fragment)
                );
                (
                    env.render_str(&vertex, &ctx)?,
                    env.render_str(&fragment, &ctx)?,
                )
            }
            None => {
                let name = params.family.template();
                (
                    env.get_template(&format!("{name}.vert"))?.render(&ctx)?,
                    env.get_template(&format!("{name}.frag"))?.render(&ctx)?,
                )
            }
        };

        Ok(ShaderSources {
            vertex: format!("{header}{vertex}"),
            fragment: format!("{header}{fragment}"),
        })
    }

    /// Source of the placeholder program drawn in place of programs that
    /// failed to build.
    pub fn fallback(precision: Precision) -> Result<ShaderSources> {
        let env = get_env();
        let header = header(precision, &ShaderDefines::new());
        let ctx = ShaderContext {
            defines: BTreeMap::new(),
        };
        Ok(ShaderSources {
            vertex: format!("{header}{}", env.get_template("fallback.vert")?.render(&ctx)?),
            fragment: format!("{header}{}", env.get_template("fallback.frag")?.render(&ctx)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::*;
    use crate::renderer::lights::LightCounts;
    use crate::renderer::program::{ObjectFeatures, ProgramContext};
    use crate::resources::{Material, MaterialKind, ShaderMaterial};

    fn generate(material: &Material, ctx: &ProgramContext) -> ShaderSources {
        let params = ProgramParameters::new(material, &ObjectFeatures::default(), ctx);
        ShaderGenerator::generate(&params).unwrap()
    }

    #[test]
    fn generation_is_deterministic() {
        let material = Material::new(MaterialKind::phong(Vec3::ONE));
        let ctx = ProgramContext {
            lights: LightCounts {
                point: 2,
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(generate(&material, &ctx), generate(&material, &ctx));
    }

    #[test]
    fn header_and_defines_lead_each_stage() {
        let material = Material::new(MaterialKind::basic(Vec3::ONE));
        let sources = generate(&material, &ProgramContext::default());
        assert!(sources.vertex.starts_with("#version 300 es\nprecision highp float;"));
        assert!(sources.fragment.contains("#define NUM_DIR_LIGHTS 0\n"));
        assert!(sources.fragment.contains("void main()"));
    }

    #[test]
    fn light_loops_follow_counts() {
        let material = Material::new(MaterialKind::standard(Vec3::ONE));
        let ctx = ProgramContext {
            lights: LightCounts {
                directional: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        let sources = generate(&material, &ctx);
        assert!(sources.fragment.contains("directionalLights[NUM_DIR_LIGHTS]"));
        assert!(!sources.fragment.contains("pointLights[NUM_POINT_LIGHTS]"));
    }

    #[test]
    fn custom_shaders_expand_chunk_includes() {
        let material = Material::new(MaterialKind::Shader(ShaderMaterial::new(
            "#include <packing>\n\
             void main() {\n\
               gl_Position = projectionMatrix * modelViewMatrix * vec4(position, 1.0);\n\
             }",
            "out vec4 fragColor;\nvoid main() { fragColor = vec4(1.0); }",
        )));
        let sources = generate(&material, &ProgramContext::default());
        assert!(!sources.vertex.contains("#include"));
        assert!(sources.vertex.contains("uniform mat4 projectionMatrix;"));
    }

    #[test]
    fn fallback_renders() {
        let sources = ShaderGenerator::fallback(Precision::Mediump).unwrap();
        assert!(sources.fragment.contains("precision mediump float;"));
    }
}
