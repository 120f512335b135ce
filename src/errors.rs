//! Error Types
//!
//! This module defines the error types used throughout the pipeline.
//!
//! # Overview
//!
//! [`RenderError`] mirrors the four failure classes of the renderer:
//!
//! - **Shader compilation**: per-program, logged with source context. The
//!   renderer itself never returns this from `render()`; it degrades the
//!   affected draw to a placeholder program and keeps the diagnostics on the
//!   material. The variant exists for callers compiling programs directly.
//! - **Resource exhaustion**: texture units or uniform-block binding points.
//! - **Invalid configuration**: an unsupported feature/format combination,
//!   raised synchronously to the caller that requested it.
//! - **Context loss**: the device went away; caches are rebuilt lazily.
//!
//! # Usage
//!
//! All fallible public APIs return [`Result<T>`], an alias for
//! `std::result::Result<T, RenderError>`.

use thiserror::Error;

use crate::renderer::program::ShaderDiagnostics;

/// The main error type for the rendering pipeline.
#[derive(Error, Debug)]
pub enum RenderError {
    // ========================================================================
    // Per-program errors
    // ========================================================================
    /// A program failed to compile or link.
    #[error("Shader program '{name}' failed to build:\n{diagnostics}")]
    ShaderCompile {
        /// Shader family name (e.g. `meshphong`)
        name: String,
        /// Collected logs of both stages and the link step
        diagnostics: ShaderDiagnostics,
    },

    /// The template library could not produce source for a program.
    #[error("Shader template error: {0}")]
    ShaderTemplate(String),

    // ========================================================================
    // Resource errors
    // ========================================================================
    /// A fixed-size device resource pool ran out.
    #[error("Resource exhausted: {resource} (requested {requested}, available {available})")]
    ResourceExhaustion {
        /// Which pool ran out
        resource: &'static str,
        /// Index or count that was requested
        requested: u32,
        /// Pool size reported by the device
        available: u32,
    },

    /// A device-level object could not be created.
    #[error("Device error: {0}")]
    Device(String),

    // ========================================================================
    // Configuration errors
    // ========================================================================
    /// The caller requested an unsupported feature/format combination.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Settings could not be parsed.
    #[error("Config parse error: {0}")]
    Config(#[from] serde_json::Error),

    // ========================================================================
    // Device lifecycle
    // ========================================================================
    /// The device context was lost; no commands can be issued until restore.
    #[error("Device context lost")]
    ContextLost,
}

impl From<minijinja::Error> for RenderError {
    fn from(err: minijinja::Error) -> Self {
        RenderError::ShaderTemplate(err.to_string())
    }
}

/// Alias for `Result<T, RenderError>`.
pub type Result<T> = std::result::Result<T, RenderError>;
