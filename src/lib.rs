#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::too_many_arguments)]

pub mod errors;
pub mod renderer;
pub mod resources;
pub mod scene;
pub mod utils;

pub use errors::{RenderError, Result};
pub use renderer::{
    GpuDevice, HeadlessDevice, PassPhase, RenderInfo, RenderTargetDesc, Renderer,
    RendererSettings,
};
pub use resources::{
    ColorSpace, Geometry, Material, MaterialKind, MaterialSettings, ShaderDefines, Side, Texture,
};
pub use scene::{Camera, Light, Node, Scene};
pub use utils::interner;
