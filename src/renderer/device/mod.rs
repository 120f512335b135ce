//! GPU Command Interface
//!
//! [`GpuDevice`] is the narrow, GL-style command surface the pipeline drives:
//! shader objects with info logs, uniform reflection and writes, uniform
//! blocks, textures, renderbuffers, framebuffers, fixed-function state,
//! draws, fences and pixel reads. Fixed-function vocabulary reuses the
//! `wgpu` state enums.
//!
//! Objects are addressed by small integer handles. Every call is legal while
//! the context is lost; creation returns dead handles and queries return
//! defaults until the context is restored.

mod headless;

pub use headless::{DeviceCommand, HeadlessDevice};

use crate::errors::Result;
use crate::resources::TextureKind;
use crate::resources::uniforms::{UniformType, UniformValue};
use crate::scene::Viewport;

macro_rules! gpu_handle {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub u32);
        )*
    };
}

gpu_handle!(
    /// Compiled shader stage object.
    GpuShader,
    /// Linked program object.
    GpuProgram,
    GpuTexture,
    GpuRenderbuffer,
    GpuFramebuffer,
    /// Vertex, index, uniform or pixel-pack buffer.
    GpuBuffer,
    GpuFence,
    UniformLocation,
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

/// Reflected active uniform.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveUniform {
    pub name: String,
    pub ty: UniformType,
    /// Declared array length; `1` for scalars
    pub array_len: u32,
    pub location: UniformLocation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferTarget {
    Vertex,
    Index,
    Uniform,
    PixelPack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Blend,
    DepthTest,
    CullFace,
    StencilTest,
    PolygonOffsetFill,
    AlphaToCoverage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureDescriptor {
    pub kind: TextureKind,
    pub width: u32,
    pub height: u32,
    pub format: wgpu::TextureFormat,
    pub mip_levels: u32,
}

/// One framebuffer attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attachment {
    Texture(GpuTexture),
    Renderbuffer(GpuRenderbuffer),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FramebufferAttachments {
    pub color: Option<Attachment>,
    /// Depth or combined depth-stencil
    pub depth: Option<Attachment>,
    pub stencil: bool,
}

bitflags::bitflags! {
    /// Buffers touched by `clear` / `blit_framebuffer`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferMask: u8 {
        const COLOR   = 1 << 0;
        const DEPTH   = 1 << 1;
        const STENCIL = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Limits reported by the device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceCapabilities {
    pub max_texture_size: u32,
    pub max_texture_units: u32,
    pub max_uniform_buffer_bindings: u32,
    pub max_samples: u32,
    pub float_render_targets: bool,
    pub formats: Vec<wgpu::TextureFormat>,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        use wgpu::TextureFormat as F;
        Self {
            max_texture_size: 4096,
            max_texture_units: 16,
            max_uniform_buffer_bindings: 24,
            max_samples: 4,
            float_render_targets: true,
            formats: vec![
                F::Rgba8Unorm,
                F::Rgba8UnormSrgb,
                F::R8Unorm,
                F::Rg8Unorm,
                F::Rgba16Float,
                F::Rgba32Float,
                F::Depth24Plus,
                F::Depth24PlusStencil8,
                F::Depth32Float,
            ],
        }
    }
}

impl DeviceCapabilities {
    #[must_use]
    pub fn supports_format(&self, format: wgpu::TextureFormat) -> bool {
        self.formats.contains(&format)
    }
}

/// GL-style command interface.
pub trait GpuDevice {
    fn capabilities(&self) -> &DeviceCapabilities;
    fn is_context_lost(&self) -> bool;
    /// Size of the default framebuffer.
    fn drawing_buffer_size(&self) -> (u32, u32);

    // --- Shaders and programs ---
    fn create_shader(&mut self, stage: ShaderStage, source: &str) -> GpuShader;
    fn shader_compiled(&self, shader: GpuShader) -> bool;
    fn shader_info_log(&self, shader: GpuShader) -> String;
    fn delete_shader(&mut self, shader: GpuShader);
    /// Attaches both stages and links.
    fn create_program(&mut self, vertex: GpuShader, fragment: GpuShader) -> GpuProgram;
    fn program_linked(&self, program: GpuProgram) -> bool;
    fn program_info_log(&self, program: GpuProgram) -> String;
    fn delete_program(&mut self, program: GpuProgram);
    fn active_uniforms(&self, program: GpuProgram) -> Vec<ActiveUniform>;
    fn uniform_block_index(&self, program: GpuProgram, name: &str) -> Option<u32>;
    fn uniform_block_binding(&mut self, program: GpuProgram, block: u32, binding_point: u32);
    fn use_program(&mut self, program: Option<GpuProgram>);
    /// Writes a non-texture value; samplers receive `Int(unit)`.
    fn uniform(&mut self, location: UniformLocation, value: &UniformValue);

    // --- Buffers ---
    fn create_buffer(&mut self, target: BufferTarget, data: &[u8]) -> GpuBuffer;
    fn update_buffer(&mut self, buffer: GpuBuffer, offset: u64, data: &[u8]);
    fn delete_buffer(&mut self, buffer: GpuBuffer);
    fn bind_buffer_base(&mut self, binding_point: u32, buffer: GpuBuffer);
    /// Binds a float vertex attribute; `divisor` 1 makes it per-instance.
    fn vertex_attribute(
        &mut self,
        location: u32,
        buffer: GpuBuffer,
        item_size: u32,
        stride: u32,
        offset: u32,
        divisor: u32,
    );
    fn disable_vertex_attribute(&mut self, location: u32);
    fn bind_index_buffer(&mut self, buffer: Option<GpuBuffer>);

    // --- Textures ---
    fn create_texture(&mut self, desc: &TextureDescriptor) -> GpuTexture;
    fn upload_texture(&mut self, texture: GpuTexture, layer: u32, data: &[u8]);
    fn generate_mipmaps(&mut self, texture: GpuTexture);
    fn delete_texture(&mut self, texture: GpuTexture);
    fn bind_texture(&mut self, unit: u32, texture: Option<GpuTexture>);

    // --- Render targets ---
    fn create_renderbuffer(
        &mut self,
        format: wgpu::TextureFormat,
        width: u32,
        height: u32,
        samples: u32,
    ) -> GpuRenderbuffer;
    fn delete_renderbuffer(&mut self, renderbuffer: GpuRenderbuffer);
    fn create_framebuffer(&mut self, attachments: &FramebufferAttachments) -> GpuFramebuffer;
    fn framebuffer_complete(&self, framebuffer: GpuFramebuffer) -> bool;
    fn delete_framebuffer(&mut self, framebuffer: GpuFramebuffer);
    /// `None` binds the default framebuffer.
    fn bind_framebuffer(&mut self, framebuffer: Option<GpuFramebuffer>);
    fn blit_framebuffer(
        &mut self,
        src: GpuFramebuffer,
        dst: GpuFramebuffer,
        width: u32,
        height: u32,
        mask: BufferMask,
    );

    // --- Fixed function ---
    fn set_capability(&mut self, capability: Capability, enabled: bool);
    fn blend_equation(&mut self, color: wgpu::BlendOperation, alpha: wgpu::BlendOperation);
    fn blend_func(
        &mut self,
        src_color: wgpu::BlendFactor,
        dst_color: wgpu::BlendFactor,
        src_alpha: wgpu::BlendFactor,
        dst_alpha: wgpu::BlendFactor,
    );
    fn depth_func(&mut self, func: wgpu::CompareFunction);
    fn depth_mask(&mut self, write: bool);
    fn color_mask(&mut self, mask: wgpu::ColorWrites);
    fn cull_face(&mut self, face: wgpu::Face);
    fn front_face(&mut self, face: wgpu::FrontFace);
    fn stencil_func(&mut self, func: wgpu::CompareFunction, reference: u32, mask: u32);
    fn stencil_op(
        &mut self,
        fail: wgpu::StencilOperation,
        depth_fail: wgpu::StencilOperation,
        pass: wgpu::StencilOperation,
    );
    fn stencil_mask(&mut self, mask: u32);
    fn polygon_offset(&mut self, factor: f32, units: f32);
    fn viewport(&mut self, viewport: Viewport);
    fn clear_color(&mut self, color: wgpu::Color);
    fn clear(&mut self, mask: BufferMask);

    // --- Draws ---
    fn draw(
        &mut self,
        topology: wgpu::PrimitiveTopology,
        first: u32,
        count: u32,
        instances: u32,
        indexed: bool,
    );

    // --- Sync and readback ---
    fn fence(&mut self) -> GpuFence;
    /// Non-blocking status query.
    fn fence_signaled(&mut self, fence: GpuFence) -> bool;
    fn delete_fence(&mut self, fence: GpuFence);
    /// Reads RGBA8 pixels of the bound framebuffer into `out`.
    fn read_pixels(&mut self, rect: PixelRect, out: &mut [u8]) -> Result<()>;
    /// Queues a read of the bound framebuffer into a pixel-pack buffer.
    fn read_pixels_to_buffer(&mut self, rect: PixelRect, buffer: GpuBuffer);
    fn read_buffer(&mut self, buffer: GpuBuffer, out: &mut [u8]) -> Result<()>;
}
