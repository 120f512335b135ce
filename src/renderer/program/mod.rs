//! Shader Programs
//!
//! - [`parameters`]: material/object/context projection and [`ProgramKey`]
//! - [`shader_gen`]: pure parameters-to-GLSL generation
//! - [`shader_manager`]: the embedded template library
//! - [`cache`]: the refcounted [`ProgramCache`]

pub mod cache;
pub mod parameters;
pub mod shader_gen;
pub mod shader_manager;

use std::fmt;

pub use cache::{ProgramCache, ProgramEntry, ProgramId};
pub use parameters::{
    CustomSource, FogKind, ObjectFeatures, ProgramContext, ProgramKey, ProgramParameters,
};
pub use shader_gen::{ShaderGenerator, ShaderSources};

/// Logs collected from a failed program build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShaderDiagnostics {
    /// Template family, e.g. `meshphong`
    pub program: String,
    pub vertex_log: String,
    pub fragment_log: String,
    pub link_log: String,
    /// Set when the template library itself failed
    pub template_error: Option<String>,
}

impl ShaderDiagnostics {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vertex_log.is_empty()
            && self.fragment_log.is_empty()
            && self.link_log.is_empty()
            && self.template_error.is_none()
    }
}

impl fmt::Display for ShaderDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(err) = &self.template_error {
            writeln!(f, "template: {err}")?;
        }
        for (stage, log) in [
            ("vertex", &self.vertex_log),
            ("fragment", &self.fragment_log),
            ("link", &self.link_log),
        ] {
            if !log.is_empty() {
                writeln!(f, "{stage}: {}", log.trim_end())?;
            }
        }
        Ok(())
    }
}
