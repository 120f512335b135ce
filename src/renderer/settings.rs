//! Renderer Settings
//!
//! [`RendererSettings`] is the renderer's configuration surface. It is plain
//! data: serializable with `serde`, loadable from JSON, and validated before
//! a [`Renderer`](super::Renderer) accepts it.
//!
//! ```rust,ignore
//! use myth_forward::renderer::RendererSettings;
//!
//! let settings = RendererSettings::from_json(r#"{
//!     "tone_mapping": "aces_filmic",
//!     "shadow_map": { "enabled": true, "kind": "pcf_soft" }
//! }"#)?;
//! ```

use serde::{Deserialize, Serialize};

use crate::errors::{RenderError, Result};
use crate::resources::ColorSpace;

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// Shadow filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShadowMapType {
    Basic,
    #[default]
    Pcf,
    PcfSoft,
    Vsm,
}

impl ShadowMapType {
    #[must_use]
    pub fn define(self) -> &'static str {
        match self {
            Self::Basic => "SHADOWMAP_TYPE_BASIC",
            Self::Pcf => "SHADOWMAP_TYPE_PCF",
            Self::PcfSoft => "SHADOWMAP_TYPE_PCF_SOFT",
            Self::Vsm => "SHADOWMAP_TYPE_VSM",
        }
    }
}

/// Output tone mapping operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToneMapping {
    #[default]
    None,
    Linear,
    Reinhard,
    Cineon,
    AcesFilmic,
    AgX,
    Neutral,
}

impl ToneMapping {
    /// Name of the tone mapping function in the shader library.
    #[must_use]
    pub fn function(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Linear => Some("LinearToneMapping"),
            Self::Reinhard => Some("ReinhardToneMapping"),
            Self::Cineon => Some("CineonToneMapping"),
            Self::AcesFilmic => Some("ACESFilmicToneMapping"),
            Self::AgX => Some("AgXToneMapping"),
            Self::Neutral => Some("NeutralToneMapping"),
        }
    }

    pub(crate) fn index(self) -> u64 {
        self as u64
    }
}

/// Float precision qualifier for generated shaders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    Lowp,
    Mediump,
    #[default]
    Highp,
}

impl Precision {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lowp => "lowp",
            Self::Mediump => "mediump",
            Self::Highp => "highp",
        }
    }
}

// ---------------------------------------------------------------------------
// Grouped settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadowMapSettings {
    pub enabled: bool,
    pub kind: ShadowMapType,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransmissionSettings {
    /// Size of the transmission target relative to the drawing buffer
    pub resolution_scale: f32,
    /// MSAA samples of the transmission target; `0` or `1` disables
    pub samples: u32,
}

impl Default for TransmissionSettings {
    fn default() -> Self {
        Self {
            resolution_scale: 1.0,
            samples: 4,
        }
    }
}

/// Fence polling schedule of the async readback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadbackSettings {
    pub initial_backoff_us: u64,
    pub max_backoff_us: u64,
}

impl Default for ReadbackSettings {
    fn default() -> Self {
        Self {
            initial_backoff_us: 50,
            max_backoff_us: 4_000,
        }
    }
}

// ---------------------------------------------------------------------------
// RendererSettings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererSettings {
    /// Master switch for clearing at the start of `render()`
    pub auto_clear: bool,
    pub auto_clear_color: bool,
    pub auto_clear_depth: bool,
    pub auto_clear_stencil: bool,
    /// Linear RGBA clear color
    pub clear_color: [f32; 4],
    /// Sort render lists; unsorted lists keep traversal order
    pub sort_objects: bool,
    pub shadow_map: ShadowMapSettings,
    pub tone_mapping: ToneMapping,
    pub tone_mapping_exposure: f32,
    pub output_color_space: ColorSpace,
    /// Global world-space clipping planes `(normal, constant)`
    pub clipping_planes: Vec<[f32; 4]>,
    /// Honor per-material clipping planes
    pub local_clipping_enabled: bool,
    pub transmission: TransmissionSettings,
    pub readback: ReadbackSettings,
    pub precision: Precision,
}

impl Default for RendererSettings {
    fn default() -> Self {
        Self {
            auto_clear: true,
            auto_clear_color: true,
            auto_clear_depth: true,
            auto_clear_stencil: true,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            sort_objects: true,
            shadow_map: ShadowMapSettings::default(),
            tone_mapping: ToneMapping::None,
            tone_mapping_exposure: 1.0,
            output_color_space: ColorSpace::Srgb,
            clipping_planes: Vec::new(),
            local_clipping_enabled: false,
            transmission: TransmissionSettings::default(),
            readback: ReadbackSettings::default(),
            precision: Precision::Highp,
        }
    }
}

impl RendererSettings {
    /// Parses and validates settings. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Rejects values the pipeline cannot honor.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(RenderError::InvalidConfiguration(msg));

        if self.clear_color.iter().any(|c| !c.is_finite()) {
            return invalid(format!("clear_color must be finite, got {:?}", self.clear_color));
        }
        if !self.tone_mapping_exposure.is_finite() || self.tone_mapping_exposure < 0.0 {
            return invalid(format!(
                "tone_mapping_exposure must be a non-negative number, got {}",
                self.tone_mapping_exposure
            ));
        }
        let scale = self.transmission.resolution_scale;
        if !(scale > 0.0 && scale <= 4.0) {
            return invalid(format!(
                "transmission.resolution_scale must be in (0, 4], got {scale}"
            ));
        }
        let samples = self.transmission.samples;
        if samples > 1 && !samples.is_power_of_two() {
            return invalid(format!(
                "transmission.samples must be a power of two, got {samples}"
            ));
        }
        for plane in &self.clipping_planes {
            let normal = glam::Vec3::new(plane[0], plane[1], plane[2]);
            if plane.iter().any(|c| !c.is_finite()) || normal.length_squared() == 0.0 {
                return invalid(format!("clipping plane {plane:?} has no valid normal"));
            }
        }
        let readback = self.readback;
        if readback.initial_backoff_us == 0
            || readback.max_backoff_us < readback.initial_backoff_us
        {
            return invalid(format!(
                "readback backoff must satisfy 0 < initial ({}) <= max ({})",
                readback.initial_backoff_us, readback.max_backoff_us
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn clear_color(&self) -> wgpu::Color {
        let [r, g, b, a] = self.clear_color;
        wgpu::Color {
            r: f64::from(r),
            g: f64::from(g),
            b: f64::from(b),
            a: f64::from(a),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_yields_defaults() {
        let settings = RendererSettings::from_json("{}").unwrap();
        assert_eq!(settings, RendererSettings::default());
    }

    #[test]
    fn parses_nested_fields() {
        let settings = RendererSettings::from_json(
            r#"{ "tone_mapping": "aces_filmic",
                 "shadow_map": { "enabled": true, "kind": "pcf_soft" },
                 "transmission": { "resolution_scale": 0.5 } }"#,
        )
        .unwrap();
        assert_eq!(settings.tone_mapping, ToneMapping::AcesFilmic);
        assert!(settings.shadow_map.enabled);
        assert_eq!(settings.shadow_map.kind, ShadowMapType::PcfSoft);
        assert_eq!(settings.transmission.resolution_scale, 0.5);
        assert_eq!(settings.transmission.samples, 4);
    }

    #[test]
    fn rejects_invalid_values() {
        let err = RendererSettings::from_json(r#"{ "transmission": { "samples": 3 } }"#);
        assert!(matches!(err, Err(RenderError::InvalidConfiguration(_))));

        let err = RendererSettings::from_json(r#"{ "clipping_planes": [[0, 0, 0, 1]] }"#);
        assert!(matches!(err, Err(RenderError::InvalidConfiguration(_))));

        let err = RendererSettings::from_json("{ not json");
        assert!(matches!(err, Err(RenderError::Config(_))));
    }
}
