//! Headless device.
//!
//! Records every command it receives, reflects uniforms from the submitted
//! GLSL, tracks object lifetimes and emulates the failure modes the pipeline
//! must survive: shader compile errors, context loss and fence latency.
//! Pixel reads return the color the bound framebuffer was last cleared to.

use rustc_hash::FxHashMap;

use super::{
    ActiveUniform, Attachment, BufferMask, BufferTarget, Capability, DeviceCapabilities,
    FramebufferAttachments, GpuBuffer, GpuDevice, GpuFence, GpuFramebuffer, GpuProgram,
    GpuRenderbuffer, GpuShader, GpuTexture, PixelRect, ShaderStage, TextureDescriptor,
    UniformLocation,
};
use crate::errors::{RenderError, Result};
use crate::resources::uniforms::{UniformType, UniformValue};
use crate::scene::Viewport;

/// One recorded device call.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCommand {
    CreateShader { shader: GpuShader, stage: ShaderStage },
    DeleteShader(GpuShader),
    CreateProgram(GpuProgram),
    DeleteProgram(GpuProgram),
    UniformBlockBinding { program: GpuProgram, block: u32, binding_point: u32 },
    UseProgram(Option<GpuProgram>),
    Uniform { location: UniformLocation, value: UniformValue },
    CreateBuffer { buffer: GpuBuffer, target: BufferTarget, size: usize },
    UpdateBuffer { buffer: GpuBuffer, offset: u64, size: usize },
    DeleteBuffer(GpuBuffer),
    BindBufferBase { binding_point: u32, buffer: GpuBuffer },
    VertexAttribute { location: u32, buffer: GpuBuffer, divisor: u32 },
    DisableVertexAttribute(u32),
    BindIndexBuffer(Option<GpuBuffer>),
    CreateTexture { texture: GpuTexture, desc: TextureDescriptor },
    UploadTexture { texture: GpuTexture, layer: u32, size: usize },
    GenerateMipmaps(GpuTexture),
    DeleteTexture(GpuTexture),
    BindTexture { unit: u32, texture: Option<GpuTexture> },
    CreateRenderbuffer { renderbuffer: GpuRenderbuffer, width: u32, height: u32, samples: u32 },
    DeleteRenderbuffer(GpuRenderbuffer),
    CreateFramebuffer(GpuFramebuffer),
    DeleteFramebuffer(GpuFramebuffer),
    BindFramebuffer(Option<GpuFramebuffer>),
    BlitFramebuffer { src: GpuFramebuffer, dst: GpuFramebuffer, mask: BufferMask },
    SetCapability { capability: Capability, enabled: bool },
    BlendEquation { color: wgpu::BlendOperation, alpha: wgpu::BlendOperation },
    BlendFunc {
        src_color: wgpu::BlendFactor,
        dst_color: wgpu::BlendFactor,
        src_alpha: wgpu::BlendFactor,
        dst_alpha: wgpu::BlendFactor,
    },
    DepthFunc(wgpu::CompareFunction),
    DepthMask(bool),
    ColorMask(wgpu::ColorWrites),
    CullFace(wgpu::Face),
    FrontFace(wgpu::FrontFace),
    StencilFunc { func: wgpu::CompareFunction, reference: u32, mask: u32 },
    StencilOp {
        fail: wgpu::StencilOperation,
        depth_fail: wgpu::StencilOperation,
        pass: wgpu::StencilOperation,
    },
    StencilMask(u32),
    PolygonOffset { factor: f32, units: f32 },
    Viewport(Viewport),
    ClearColor(wgpu::Color),
    Clear(BufferMask),
    Draw {
        topology: wgpu::PrimitiveTopology,
        first: u32,
        count: u32,
        instances: u32,
        indexed: bool,
        program: Option<GpuProgram>,
        framebuffer: Option<GpuFramebuffer>,
    },
    Fence(GpuFence),
    ReadPixels(PixelRect),
    ContextLost,
    ContextRestored,
}

impl DeviceCommand {
    /// Whether the command changes fixed-function state.
    #[must_use]
    pub fn is_state_change(&self) -> bool {
        matches!(
            self,
            Self::SetCapability { .. }
                | Self::BlendEquation { .. }
                | Self::BlendFunc { .. }
                | Self::DepthFunc(_)
                | Self::DepthMask(_)
                | Self::ColorMask(_)
                | Self::CullFace(_)
                | Self::FrontFace(_)
                | Self::StencilFunc { .. }
                | Self::StencilOp { .. }
                | Self::StencilMask(_)
                | Self::PolygonOffset { .. }
                | Self::Viewport(_)
        )
    }
}

#[derive(Debug)]
struct ShaderObject {
    compiled: bool,
    log: String,
    source: String,
}

#[derive(Debug)]
struct ProgramObject {
    linked: bool,
    log: String,
    uniforms: Vec<ActiveUniform>,
    blocks: Vec<String>,
}

#[derive(Debug)]
struct FramebufferObject {
    width: u32,
    height: u32,
    complete: bool,
    pixel: [u8; 4],
}

/// Recording device used for tests and tooling.
#[derive(Debug)]
pub struct HeadlessDevice {
    caps: DeviceCapabilities,
    width: u32,
    height: u32,
    next_handle: u32,
    lost: bool,

    shaders: FxHashMap<GpuShader, ShaderObject>,
    programs: FxHashMap<GpuProgram, ProgramObject>,
    textures: FxHashMap<GpuTexture, TextureDescriptor>,
    renderbuffers: FxHashMap<GpuRenderbuffer, (u32, u32)>,
    framebuffers: FxHashMap<GpuFramebuffer, FramebufferObject>,
    buffers: FxHashMap<GpuBuffer, Vec<u8>>,
    fences: FxHashMap<GpuFence, u32>,

    default_pixel: [u8; 4],
    bound_framebuffer: Option<GpuFramebuffer>,
    current_program: Option<GpuProgram>,
    clear_color: wgpu::Color,

    fail_patterns: Vec<String>,
    fence_latency: u32,
    commands: Vec<DeviceCommand>,
}

impl HeadlessDevice {
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self::with_capabilities(width, height, DeviceCapabilities::default())
    }

    #[must_use]
    pub fn with_capabilities(width: u32, height: u32, caps: DeviceCapabilities) -> Self {
        Self {
            caps,
            width,
            height,
            next_handle: 1,
            lost: false,
            shaders: FxHashMap::default(),
            programs: FxHashMap::default(),
            textures: FxHashMap::default(),
            renderbuffers: FxHashMap::default(),
            framebuffers: FxHashMap::default(),
            buffers: FxHashMap::default(),
            fences: FxHashMap::default(),
            default_pixel: [0, 0, 0, 0],
            bound_framebuffer: None,
            current_program: None,
            clear_color: wgpu::Color::TRANSPARENT,
            fail_patterns: Vec::new(),
            fence_latency: 0,
            commands: Vec::new(),
        }
    }

    // === Test controls ===

    /// Any shader whose source contains `pattern` fails to compile.
    pub fn fail_shaders_containing(&mut self, pattern: impl Into<String>) {
        self.fail_patterns.push(pattern.into());
    }

    /// Number of status queries a fence needs before it reports signaled.
    pub fn set_fence_latency(&mut self, polls: u32) {
        self.fence_latency = polls;
    }

    /// Drops every object, as a real driver does on context loss.
    pub fn lose_context(&mut self) {
        log::info!("HeadlessDevice: context lost");
        self.lost = true;
        self.shaders.clear();
        self.programs.clear();
        self.textures.clear();
        self.renderbuffers.clear();
        self.framebuffers.clear();
        self.buffers.clear();
        self.fences.clear();
        self.bound_framebuffer = None;
        self.current_program = None;
        self.commands.push(DeviceCommand::ContextLost);
    }

    pub fn restore_context(&mut self) {
        log::info!("HeadlessDevice: context restored");
        self.lost = false;
        self.commands.push(DeviceCommand::ContextRestored);
    }

    // === Inspection ===

    #[must_use]
    pub fn commands(&self) -> &[DeviceCommand] {
        &self.commands
    }

    pub fn clear_commands(&mut self) {
        self.commands.clear();
    }

    #[must_use]
    pub fn count_commands(&self, pred: impl Fn(&DeviceCommand) -> bool) -> usize {
        self.commands.iter().filter(|c| pred(c)).count()
    }

    #[must_use]
    pub fn live_programs(&self) -> usize {
        self.programs.len()
    }

    #[must_use]
    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    #[must_use]
    pub fn live_framebuffers(&self) -> usize {
        self.framebuffers.len()
    }

    #[must_use]
    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    // === Internals ===

    fn alloc(&mut self) -> u32 {
        let id = self.next_handle;
        self.next_handle += 1;
        id
    }

    fn record(&mut self, command: DeviceCommand) {
        if !self.lost {
            self.commands.push(command);
        }
    }

    fn compile(&self, source: &str) -> (bool, String) {
        for (line_no, line) in source.lines().enumerate() {
            if let Some(message) = line.trim_start().strip_prefix("#error") {
                return (
                    false,
                    format!("ERROR: 0:{}: '#error' : {}", line_no + 1, message.trim()),
                );
            }
        }
        for pattern in &self.fail_patterns {
            if let Some(line_no) = source.lines().position(|l| l.contains(pattern.as_str())) {
                return (
                    false,
                    format!("ERROR: 0:{}: '{pattern}' : syntax error", line_no + 1),
                );
            }
        }
        (true, String::new())
    }

    fn bound_size(&self) -> Option<(u32, u32)> {
        match self.bound_framebuffer {
            None => Some((self.width, self.height)),
            Some(fb) => self.framebuffers.get(&fb).map(|f| (f.width, f.height)),
        }
    }

    fn bound_pixel(&self) -> [u8; 4] {
        self.bound_framebuffer
            .and_then(|fb| self.framebuffers.get(&fb))
            .map_or(self.default_pixel, |f| f.pixel)
    }

    fn attachment_size(&self, attachment: Attachment) -> Option<(u32, u32)> {
        match attachment {
            Attachment::Texture(t) => self.textures.get(&t).map(|d| (d.width, d.height)),
            Attachment::Renderbuffer(r) => self.renderbuffers.get(&r).copied(),
        }
    }

    fn pixels(&self, rect: PixelRect) -> Result<Vec<u8>> {
        if self.lost {
            return Err(RenderError::ContextLost);
        }
        let (w, h) = self
            .bound_size()
            .ok_or_else(|| RenderError::Device("No framebuffer bound for read".into()))?;
        if rect.x + rect.width > w || rect.y + rect.height > h {
            return Err(RenderError::InvalidConfiguration(format!(
                "Read rectangle {rect:?} outside {w}x{h} framebuffer"
            )));
        }
        let pixel = self.bound_pixel();
        let count = (rect.width * rect.height) as usize;
        Ok(pixel.iter().copied().cycle().take(count * 4).collect())
    }
}

/// Parses active uniforms and uniform blocks out of GLSL source.
fn reflect(sources: [&str; 2]) -> (Vec<(String, UniformType, u32)>, Vec<String>) {
    let mut defines: FxHashMap<String, u32> = FxHashMap::default();
    let mut uniforms: Vec<(String, UniformType, u32)> = Vec::new();
    let mut blocks = Vec::new();

    for source in sources {
        let mut in_block = false;
        for raw in source.lines() {
            let line = raw.trim();
            if in_block {
                if line.starts_with('}') {
                    in_block = false;
                }
                continue;
            }
            if let Some(rest) = line.strip_prefix("#define ") {
                let mut parts = rest.split_whitespace();
                if let (Some(name), Some(value)) = (parts.next(), parts.next())
                    && let Ok(value) = value.parse()
                {
                    defines.insert(name.to_string(), value);
                }
                continue;
            }
            let Some(pos) = line.find("uniform ") else {
                continue;
            };
            if pos > 0 && !line.starts_with("layout") {
                continue;
            }
            let decl = &line[pos + "uniform ".len()..];
            if decl.ends_with('{') {
                if let Some(name) = decl.split_whitespace().next() {
                    blocks.push(name.to_string());
                }
                in_block = true;
                continue;
            }
            let decl = decl.trim_end_matches(';');
            let tokens: Vec<&str> = decl
                .split_whitespace()
                .filter(|t| !matches!(*t, "lowp" | "mediump" | "highp"))
                .collect();
            let [ty, name] = tokens.as_slice() else {
                continue;
            };
            let Some(ty) = UniformType::from_glsl(ty) else {
                continue;
            };
            let (name, len) = match name.split_once('[') {
                Some((base, rest)) => {
                    let size = rest.trim_end_matches(']');
                    let len = size
                        .parse()
                        .ok()
                        .or_else(|| defines.get(size).copied())
                        .unwrap_or(1);
                    (base.to_string(), len)
                }
                None => ((*name).to_string(), 1),
            };
            if !uniforms.iter().any(|(n, _, _)| *n == name) {
                uniforms.push((name, ty, len));
            }
        }
    }

    (uniforms, blocks)
}

impl GpuDevice for HeadlessDevice {
    fn capabilities(&self) -> &DeviceCapabilities {
        &self.caps
    }

    fn is_context_lost(&self) -> bool {
        self.lost
    }

    fn drawing_buffer_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn create_shader(&mut self, stage: ShaderStage, source: &str) -> GpuShader {
        if self.lost {
            return GpuShader(0);
        }
        let shader = GpuShader(self.alloc());
        let (compiled, log) = self.compile(source);
        self.shaders.insert(
            shader,
            ShaderObject {
                compiled,
                log,
                source: source.to_string(),
            },
        );
        self.record(DeviceCommand::CreateShader { shader, stage });
        shader
    }

    fn shader_compiled(&self, shader: GpuShader) -> bool {
        self.shaders.get(&shader).is_some_and(|s| s.compiled)
    }

    fn shader_info_log(&self, shader: GpuShader) -> String {
        self.shaders
            .get(&shader)
            .map(|s| s.log.clone())
            .unwrap_or_default()
    }

    fn delete_shader(&mut self, shader: GpuShader) {
        if self.shaders.remove(&shader).is_some() {
            self.record(DeviceCommand::DeleteShader(shader));
        }
    }

    fn create_program(&mut self, vertex: GpuShader, fragment: GpuShader) -> GpuProgram {
        if self.lost {
            return GpuProgram(0);
        }
        let program = GpuProgram(self.alloc());
        let (linked, log, uniforms, blocks) =
            match (self.shaders.get(&vertex), self.shaders.get(&fragment)) {
                (Some(v), Some(f)) if v.compiled && f.compiled => {
                    let (uniforms, blocks) = reflect([&v.source, &f.source]);
                    (true, String::new(), uniforms, blocks)
                }
                _ => (
                    false,
                    "ERROR: Link failed: one or more attached shaders not compiled".to_string(),
                    Vec::new(),
                    Vec::new(),
                ),
            };

        let mut active = Vec::with_capacity(uniforms.len());
        for (name, ty, array_len) in uniforms {
            let location = UniformLocation(self.alloc());
            active.push(ActiveUniform {
                name,
                ty,
                array_len,
                location,
            });
        }

        self.programs.insert(
            program,
            ProgramObject {
                linked,
                log,
                uniforms: active,
                blocks,
            },
        );
        self.record(DeviceCommand::CreateProgram(program));
        program
    }

    fn program_linked(&self, program: GpuProgram) -> bool {
        self.programs.get(&program).is_some_and(|p| p.linked)
    }

    fn program_info_log(&self, program: GpuProgram) -> String {
        self.programs
            .get(&program)
            .map(|p| p.log.clone())
            .unwrap_or_default()
    }

    fn delete_program(&mut self, program: GpuProgram) {
        if self.programs.remove(&program).is_some() {
            if self.current_program == Some(program) {
                self.current_program = None;
            }
            self.record(DeviceCommand::DeleteProgram(program));
        }
    }

    fn active_uniforms(&self, program: GpuProgram) -> Vec<ActiveUniform> {
        self.programs
            .get(&program)
            .map(|p| p.uniforms.clone())
            .unwrap_or_default()
    }

    fn uniform_block_index(&self, program: GpuProgram, name: &str) -> Option<u32> {
        self.programs
            .get(&program)?
            .blocks
            .iter()
            .position(|b| b == name)
            .map(|i| i as u32)
    }

    fn uniform_block_binding(&mut self, program: GpuProgram, block: u32, binding_point: u32) {
        self.record(DeviceCommand::UniformBlockBinding {
            program,
            block,
            binding_point,
        });
    }

    fn use_program(&mut self, program: Option<GpuProgram>) {
        self.current_program = program;
        self.record(DeviceCommand::UseProgram(program));
    }

    fn uniform(&mut self, location: UniformLocation, value: &UniformValue) {
        self.record(DeviceCommand::Uniform {
            location,
            value: value.clone(),
        });
    }

    fn create_buffer(&mut self, target: BufferTarget, data: &[u8]) -> GpuBuffer {
        if self.lost {
            return GpuBuffer(0);
        }
        let buffer = GpuBuffer(self.alloc());
        self.buffers.insert(buffer, data.to_vec());
        self.record(DeviceCommand::CreateBuffer {
            buffer,
            target,
            size: data.len(),
        });
        buffer
    }

    fn update_buffer(&mut self, buffer: GpuBuffer, offset: u64, data: &[u8]) {
        let Some(storage) = self.buffers.get_mut(&buffer) else {
            return;
        };
        let start = offset as usize;
        let end = start + data.len();
        if storage.len() < end {
            storage.resize(end, 0);
        }
        storage[start..end].copy_from_slice(data);
        self.record(DeviceCommand::UpdateBuffer {
            buffer,
            offset,
            size: data.len(),
        });
    }

    fn delete_buffer(&mut self, buffer: GpuBuffer) {
        if self.buffers.remove(&buffer).is_some() {
            self.record(DeviceCommand::DeleteBuffer(buffer));
        }
    }

    fn bind_buffer_base(&mut self, binding_point: u32, buffer: GpuBuffer) {
        self.record(DeviceCommand::BindBufferBase {
            binding_point,
            buffer,
        });
    }

    fn vertex_attribute(
        &mut self,
        location: u32,
        buffer: GpuBuffer,
        _item_size: u32,
        _stride: u32,
        _offset: u32,
        divisor: u32,
    ) {
        self.record(DeviceCommand::VertexAttribute {
            location,
            buffer,
            divisor,
        });
    }

    fn disable_vertex_attribute(&mut self, location: u32) {
        self.record(DeviceCommand::DisableVertexAttribute(location));
    }

    fn bind_index_buffer(&mut self, buffer: Option<GpuBuffer>) {
        self.record(DeviceCommand::BindIndexBuffer(buffer));
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> GpuTexture {
        if self.lost {
            return GpuTexture(0);
        }
        let texture = GpuTexture(self.alloc());
        self.textures.insert(texture, *desc);
        self.record(DeviceCommand::CreateTexture {
            texture,
            desc: *desc,
        });
        texture
    }

    fn upload_texture(&mut self, texture: GpuTexture, layer: u32, data: &[u8]) {
        if self.textures.contains_key(&texture) {
            self.record(DeviceCommand::UploadTexture {
                texture,
                layer,
                size: data.len(),
            });
        }
    }

    fn generate_mipmaps(&mut self, texture: GpuTexture) {
        if self.textures.contains_key(&texture) {
            self.record(DeviceCommand::GenerateMipmaps(texture));
        }
    }

    fn delete_texture(&mut self, texture: GpuTexture) {
        if self.textures.remove(&texture).is_some() {
            self.record(DeviceCommand::DeleteTexture(texture));
        }
    }

    fn bind_texture(&mut self, unit: u32, texture: Option<GpuTexture>) {
        self.record(DeviceCommand::BindTexture { unit, texture });
    }

    fn create_renderbuffer(
        &mut self,
        _format: wgpu::TextureFormat,
        width: u32,
        height: u32,
        samples: u32,
    ) -> GpuRenderbuffer {
        if self.lost {
            return GpuRenderbuffer(0);
        }
        let renderbuffer = GpuRenderbuffer(self.alloc());
        self.renderbuffers.insert(renderbuffer, (width, height));
        self.record(DeviceCommand::CreateRenderbuffer {
            renderbuffer,
            width,
            height,
            samples,
        });
        renderbuffer
    }

    fn delete_renderbuffer(&mut self, renderbuffer: GpuRenderbuffer) {
        if self.renderbuffers.remove(&renderbuffer).is_some() {
            self.record(DeviceCommand::DeleteRenderbuffer(renderbuffer));
        }
    }

    fn create_framebuffer(&mut self, attachments: &FramebufferAttachments) -> GpuFramebuffer {
        if self.lost {
            return GpuFramebuffer(0);
        }
        let framebuffer = GpuFramebuffer(self.alloc());
        let sizes: Vec<Option<(u32, u32)>> = [attachments.color, attachments.depth]
            .into_iter()
            .flatten()
            .map(|a| self.attachment_size(a))
            .collect();
        let first = sizes.first().copied().flatten();
        let complete = !sizes.is_empty() && sizes.iter().all(|s| s.is_some() && *s == first);
        let (width, height) = first.unwrap_or((0, 0));

        self.framebuffers.insert(
            framebuffer,
            FramebufferObject {
                width,
                height,
                complete,
                pixel: [0, 0, 0, 0],
            },
        );
        self.record(DeviceCommand::CreateFramebuffer(framebuffer));
        framebuffer
    }

    fn framebuffer_complete(&self, framebuffer: GpuFramebuffer) -> bool {
        self.framebuffers
            .get(&framebuffer)
            .is_some_and(|f| f.complete)
    }

    fn delete_framebuffer(&mut self, framebuffer: GpuFramebuffer) {
        if self.framebuffers.remove(&framebuffer).is_some() {
            if self.bound_framebuffer == Some(framebuffer) {
                self.bound_framebuffer = None;
            }
            self.record(DeviceCommand::DeleteFramebuffer(framebuffer));
        }
    }

    fn bind_framebuffer(&mut self, framebuffer: Option<GpuFramebuffer>) {
        self.bound_framebuffer = framebuffer;
        self.record(DeviceCommand::BindFramebuffer(framebuffer));
    }

    fn blit_framebuffer(
        &mut self,
        src: GpuFramebuffer,
        dst: GpuFramebuffer,
        _width: u32,
        _height: u32,
        mask: BufferMask,
    ) {
        let pixel = self.framebuffers.get(&src).map(|f| f.pixel);
        if let (Some(pixel), Some(target)) = (pixel, self.framebuffers.get_mut(&dst))
            && mask.contains(BufferMask::COLOR)
        {
            target.pixel = pixel;
        }
        self.record(DeviceCommand::BlitFramebuffer { src, dst, mask });
    }

    fn set_capability(&mut self, capability: Capability, enabled: bool) {
        self.record(DeviceCommand::SetCapability {
            capability,
            enabled,
        });
    }

    fn blend_equation(&mut self, color: wgpu::BlendOperation, alpha: wgpu::BlendOperation) {
        self.record(DeviceCommand::BlendEquation { color, alpha });
    }

    fn blend_func(
        &mut self,
        src_color: wgpu::BlendFactor,
        dst_color: wgpu::BlendFactor,
        src_alpha: wgpu::BlendFactor,
        dst_alpha: wgpu::BlendFactor,
    ) {
        self.record(DeviceCommand::BlendFunc {
            src_color,
            dst_color,
            src_alpha,
            dst_alpha,
        });
    }

    fn depth_func(&mut self, func: wgpu::CompareFunction) {
        self.record(DeviceCommand::DepthFunc(func));
    }

    fn depth_mask(&mut self, write: bool) {
        self.record(DeviceCommand::DepthMask(write));
    }

    fn color_mask(&mut self, mask: wgpu::ColorWrites) {
        self.record(DeviceCommand::ColorMask(mask));
    }

    fn cull_face(&mut self, face: wgpu::Face) {
        self.record(DeviceCommand::CullFace(face));
    }

    fn front_face(&mut self, face: wgpu::FrontFace) {
        self.record(DeviceCommand::FrontFace(face));
    }

    fn stencil_func(&mut self, func: wgpu::CompareFunction, reference: u32, mask: u32) {
        self.record(DeviceCommand::StencilFunc {
            func,
            reference,
            mask,
        });
    }

    fn stencil_op(
        &mut self,
        fail: wgpu::StencilOperation,
        depth_fail: wgpu::StencilOperation,
        pass: wgpu::StencilOperation,
    ) {
        self.record(DeviceCommand::StencilOp {
            fail,
            depth_fail,
            pass,
        });
    }

    fn stencil_mask(&mut self, mask: u32) {
        self.record(DeviceCommand::StencilMask(mask));
    }

    fn polygon_offset(&mut self, factor: f32, units: f32) {
        self.record(DeviceCommand::PolygonOffset { factor, units });
    }

    fn viewport(&mut self, viewport: Viewport) {
        self.record(DeviceCommand::Viewport(viewport));
    }

    fn clear_color(&mut self, color: wgpu::Color) {
        self.clear_color = color;
        self.record(DeviceCommand::ClearColor(color));
    }

    fn clear(&mut self, mask: BufferMask) {
        if self.lost {
            return;
        }
        if mask.contains(BufferMask::COLOR) {
            let c = self.clear_color;
            let to_u8 = |v: f64| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
            let pixel = [to_u8(c.r), to_u8(c.g), to_u8(c.b), to_u8(c.a)];
            match self.bound_framebuffer.and_then(|fb| self.framebuffers.get_mut(&fb)) {
                Some(fb) => fb.pixel = pixel,
                None => self.default_pixel = pixel,
            }
        }
        self.record(DeviceCommand::Clear(mask));
    }

    fn draw(
        &mut self,
        topology: wgpu::PrimitiveTopology,
        first: u32,
        count: u32,
        instances: u32,
        indexed: bool,
    ) {
        let program = self.current_program;
        let framebuffer = self.bound_framebuffer;
        self.record(DeviceCommand::Draw {
            topology,
            first,
            count,
            instances,
            indexed,
            program,
            framebuffer,
        });
    }

    fn fence(&mut self) -> GpuFence {
        if self.lost {
            return GpuFence(0);
        }
        let fence = GpuFence(self.alloc());
        self.fences.insert(fence, self.fence_latency);
        self.record(DeviceCommand::Fence(fence));
        fence
    }

    fn fence_signaled(&mut self, fence: GpuFence) -> bool {
        match self.fences.get_mut(&fence) {
            Some(0) => true,
            Some(remaining) => {
                *remaining -= 1;
                false
            }
            // Unknown fences (e.g. after context loss) never block.
            None => true,
        }
    }

    fn delete_fence(&mut self, fence: GpuFence) {
        self.fences.remove(&fence);
    }

    fn read_pixels(&mut self, rect: PixelRect, out: &mut [u8]) -> Result<()> {
        let pixels = self.pixels(rect)?;
        if out.len() != pixels.len() {
            return Err(RenderError::InvalidConfiguration(format!(
                "Readback buffer holds {} bytes, {} required",
                out.len(),
                pixels.len()
            )));
        }
        out.copy_from_slice(&pixels);
        self.record(DeviceCommand::ReadPixels(rect));
        Ok(())
    }

    fn read_pixels_to_buffer(&mut self, rect: PixelRect, buffer: GpuBuffer) {
        let Ok(pixels) = self.pixels(rect) else {
            return;
        };
        if let Some(storage) = self.buffers.get_mut(&buffer) {
            *storage = pixels;
        }
        self.record(DeviceCommand::ReadPixels(rect));
    }

    fn read_buffer(&mut self, buffer: GpuBuffer, out: &mut [u8]) -> Result<()> {
        if self.lost {
            return Err(RenderError::ContextLost);
        }
        let storage = self
            .buffers
            .get(&buffer)
            .ok_or_else(|| RenderError::Device(format!("Unknown buffer {buffer:?}")))?;
        let n = out.len().min(storage.len());
        out[..n].copy_from_slice(&storage[..n]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VERT: &str = "#version 300 es
#define MAX_BONES 4
uniform mat4 modelMatrix;
uniform highp mat4 boneMatrices[MAX_BONES];
layout(std140) uniform Lights {
  vec4 ambient;
};
void main() {}
";
    const FRAG: &str = "#version 300 es
uniform vec3 diffuse;
uniform sampler2D map;
uniform mat4 modelMatrix;
void main() {}
";

    #[test]
    fn reflects_uniforms_and_blocks() {
        let mut device = HeadlessDevice::new(4, 4);
        let v = device.create_shader(ShaderStage::Vertex, VERT);
        let f = device.create_shader(ShaderStage::Fragment, FRAG);
        let program = device.create_program(v, f);

        assert!(device.program_linked(program));
        let uniforms = device.active_uniforms(program);
        let names: Vec<&str> = uniforms.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, ["modelMatrix", "boneMatrices", "diffuse", "map"]);
        assert_eq!(uniforms[1].array_len, 4);
        assert_eq!(uniforms[3].ty, UniformType::Sampler2D);
        assert_eq!(device.uniform_block_index(program, "Lights"), Some(0));
    }

    #[test]
    fn error_directive_fails_compile_and_link() {
        let mut device = HeadlessDevice::new(4, 4);
        let v = device.create_shader(ShaderStage::Vertex, VERT);
        let f = device.create_shader(ShaderStage::Fragment, "void main() {\n#error broken\n}");
        assert!(!device.shader_compiled(f));
        assert!(device.shader_info_log(f).contains("0:2"));

        let program = device.create_program(v, f);
        assert!(!device.program_linked(program));
    }

    #[test]
    fn fence_respects_latency() {
        let mut device = HeadlessDevice::new(4, 4);
        device.set_fence_latency(2);
        let fence = device.fence();
        assert!(!device.fence_signaled(fence));
        assert!(!device.fence_signaled(fence));
        assert!(device.fence_signaled(fence));
    }

    #[test]
    fn clear_color_is_read_back() {
        let mut device = HeadlessDevice::new(2, 2);
        device.clear_color(wgpu::Color::RED);
        device.clear(BufferMask::COLOR);
        let mut out = vec![0u8; 16];
        device
            .read_pixels(
                PixelRect {
                    x: 0,
                    y: 0,
                    width: 2,
                    height: 2,
                },
                &mut out,
            )
            .unwrap();
        assert_eq!(&out[..4], &[255, 0, 0, 255]);
    }

    #[test]
    fn lost_context_drops_objects_and_silences_commands() {
        let mut device = HeadlessDevice::new(2, 2);
        let _ = device.create_buffer(BufferTarget::Uniform, &[0; 16]);
        device.lose_context();
        assert_eq!(device.live_buffers(), 0);

        device.clear_commands();
        device.depth_mask(false);
        assert!(device.commands().is_empty());
        assert_eq!(device.create_shader(ShaderStage::Vertex, VERT), GpuShader(0));
    }
}
