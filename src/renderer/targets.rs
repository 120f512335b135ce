//! Render Targets
//!
//! Offscreen framebuffers with their color / depth / stencil attachments.
//! Creating a target only records its descriptor; device objects are
//! allocated lazily by [`RenderTargetManager::ensure`] on first use and again
//! after a size change.
//!
//! # Multisampling
//!
//! ```text
//! samples > 1:   draw ──► msaa framebuffer (renderbuffers)
//!                              │ resolve(): blit
//!                              ▼
//!                resolve framebuffer (textures) ──► sampled
//! ```
//!
//! Sampling a multisampled target is only valid after
//! [`RenderTargetManager::resolve`], which also regenerates mipmaps.

use slotmap::SlotMap;

use crate::errors::{RenderError, Result};
use crate::renderer::device::{
    Attachment, BufferMask, DeviceCapabilities, FramebufferAttachments, GpuDevice,
    GpuFramebuffer, GpuRenderbuffer, GpuTexture, TextureDescriptor,
};
use crate::resources::{ColorSpace, RenderTargetId, TextureKind};

/// Render target configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderTargetDesc {
    pub width: u32,
    pub height: u32,
    /// `None` for depth-only targets
    pub color: Option<wgpu::TextureFormat>,
    pub depth: bool,
    pub stencil: bool,
    /// Store depth in a sampleable texture instead of a renderbuffer
    pub depth_texture: bool,
    pub samples: u32,
    pub mipmaps: bool,
    pub color_space: ColorSpace,
}

impl Default for RenderTargetDesc {
    fn default() -> Self {
        Self {
            width: 1,
            height: 1,
            color: Some(wgpu::TextureFormat::Rgba8Unorm),
            depth: true,
            stencil: false,
            depth_texture: false,
            samples: 1,
            mipmaps: false,
            color_space: ColorSpace::LinearSrgb,
        }
    }
}

impl RenderTargetDesc {
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..Default::default()
        }
    }

    fn depth_format(&self) -> wgpu::TextureFormat {
        if self.stencil {
            wgpu::TextureFormat::Depth24PlusStencil8
        } else {
            wgpu::TextureFormat::Depth24Plus
        }
    }

    fn mip_levels(&self) -> u32 {
        if self.mipmaps {
            32 - self.width.max(self.height).max(1).leading_zeros()
        } else {
            1
        }
    }

    /// Rejects combinations the device cannot back.
    pub fn validate(&self, caps: &DeviceCapabilities) -> Result<()> {
        let invalid = |msg: String| Err(RenderError::InvalidConfiguration(msg));

        if self.width == 0 || self.height == 0 {
            return invalid(format!(
                "render target size {}x{} must be non-zero",
                self.width, self.height
            ));
        }
        if self.width > caps.max_texture_size || self.height > caps.max_texture_size {
            return invalid(format!(
                "render target size {}x{} exceeds the device limit {}",
                self.width, self.height, caps.max_texture_size
            ));
        }
        if !self.samples.is_power_of_two() || self.samples > caps.max_samples {
            return invalid(format!(
                "{} samples requested, device supports powers of two up to {}",
                self.samples, caps.max_samples
            ));
        }
        if self.stencil && !self.depth {
            return invalid("a stencil attachment requires a depth attachment".into());
        }
        if self.color.is_none() && !self.depth {
            return invalid("render target has no attachments".into());
        }
        if let Some(format) = self.color {
            if !caps.supports_format(format) {
                return invalid(format!("color format {format:?} is not renderable"));
            }
            let float = matches!(
                format,
                wgpu::TextureFormat::Rgba16Float | wgpu::TextureFormat::Rgba32Float
            );
            if float && !caps.float_render_targets {
                return invalid(format!("float color format {format:?} is not supported"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct MsaaAttachments {
    framebuffer: GpuFramebuffer,
    color: Option<GpuRenderbuffer>,
    depth: Option<GpuRenderbuffer>,
}

#[derive(Debug, Clone, Copy)]
struct GpuTarget {
    width: u32,
    height: u32,
    framebuffer: GpuFramebuffer,
    color: Option<GpuTexture>,
    depth_texture: Option<GpuTexture>,
    depth_renderbuffer: Option<GpuRenderbuffer>,
    msaa: Option<MsaaAttachments>,
}

#[derive(Debug)]
struct TargetEntry {
    desc: RenderTargetDesc,
    gpu: Option<GpuTarget>,
}

#[derive(Debug, Default)]
pub struct RenderTargetManager {
    targets: SlotMap<RenderTargetId, TargetEntry>,
    allocations: u64,
}

impl RenderTargetManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a target. No device objects are created yet.
    pub fn create(
        &mut self,
        caps: &DeviceCapabilities,
        desc: RenderTargetDesc,
    ) -> Result<RenderTargetId> {
        desc.validate(caps)?;
        Ok(self.targets.insert(TargetEntry { desc, gpu: None }))
    }

    /// Updates the size. Storage is reallocated by the next `ensure`.
    /// Returns `true` when the size changed.
    pub fn resize(
        &mut self,
        caps: &DeviceCapabilities,
        id: RenderTargetId,
        width: u32,
        height: u32,
    ) -> Result<bool> {
        let entry = self.targets.get_mut(id).ok_or_else(|| {
            RenderError::InvalidConfiguration(format!("unknown render target {id:?}"))
        })?;
        if entry.desc.width == width && entry.desc.height == height {
            return Ok(false);
        }
        let desc = RenderTargetDesc {
            width,
            height,
            ..entry.desc
        };
        desc.validate(caps)?;
        entry.desc = desc;
        Ok(true)
    }

    /// Allocates or reallocates backing storage when missing or stale and
    /// returns the framebuffer to draw into.
    pub fn ensure(
        &mut self,
        device: &mut dyn GpuDevice,
        id: RenderTargetId,
    ) -> Result<GpuFramebuffer> {
        let entry = self.targets.get_mut(id).ok_or_else(|| {
            RenderError::InvalidConfiguration(format!("unknown render target {id:?}"))
        })?;

        if let Some(gpu) = entry.gpu {
            if gpu.width == entry.desc.width && gpu.height == entry.desc.height {
                return Ok(gpu.msaa.map_or(gpu.framebuffer, |m| m.framebuffer));
            }
            free(device, &gpu);
            entry.gpu = None;
        }

        let gpu = allocate(device, &entry.desc)?;
        entry.gpu = Some(gpu);
        self.allocations += 1;
        log::debug!(
            "Allocated render target {:?} ({}x{}, {} samples)",
            id,
            gpu.width,
            gpu.height,
            entry.desc.samples
        );
        Ok(gpu.msaa.map_or(gpu.framebuffer, |m| m.framebuffer))
    }

    /// Blits multisampled attachments into the sampleable ones and
    /// regenerates color mipmaps.
    pub fn resolve(&self, device: &mut dyn GpuDevice, id: RenderTargetId) {
        let Some(entry) = self.targets.get(id) else {
            return;
        };
        let Some(gpu) = entry.gpu else {
            return;
        };
        if let Some(msaa) = gpu.msaa {
            let mut mask = BufferMask::empty();
            if gpu.color.is_some() {
                mask |= BufferMask::COLOR;
            }
            if gpu.depth_texture.is_some() {
                mask |= BufferMask::DEPTH;
            }
            device.blit_framebuffer(msaa.framebuffer, gpu.framebuffer, gpu.width, gpu.height, mask);
        }
        if entry.desc.mipmaps
            && let Some(color) = gpu.color
        {
            device.generate_mipmaps(color);
        }
    }

    /// Frees the target. Returns `false` when it was already disposed.
    pub fn dispose(&mut self, device: &mut dyn GpuDevice, id: RenderTargetId) -> bool {
        let Some(entry) = self.targets.remove(id) else {
            return false;
        };
        if let Some(gpu) = entry.gpu {
            free(device, &gpu);
        }
        log::debug!("Disposed render target {id:?}");
        true
    }

    #[must_use]
    pub fn desc(&self, id: RenderTargetId) -> Option<&RenderTargetDesc> {
        self.targets.get(id).map(|e| &e.desc)
    }

    #[must_use]
    pub fn contains(&self, id: RenderTargetId) -> bool {
        self.targets.contains_key(id)
    }

    /// Resolved color texture, once allocated.
    #[must_use]
    pub fn color_texture(&self, id: RenderTargetId) -> Option<GpuTexture> {
        self.targets.get(id)?.gpu?.color
    }

    #[must_use]
    pub fn depth_texture(&self, id: RenderTargetId) -> Option<GpuTexture> {
        self.targets.get(id)?.gpu?.depth_texture
    }

    /// Single-sampled framebuffer holding the resolved attachments.
    #[must_use]
    pub fn resolve_framebuffer(&self, id: RenderTargetId) -> Option<GpuFramebuffer> {
        Some(self.targets.get(id)?.gpu?.framebuffer)
    }

    /// Storage allocations performed so far.
    #[must_use]
    pub fn allocations(&self) -> u64 {
        self.allocations
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Drops device objects without device calls, after context loss.
    /// Descriptors survive; storage is recreated by the next `ensure`.
    pub fn invalidate(&mut self) {
        for entry in self.targets.values_mut() {
            entry.gpu = None;
        }
    }

    pub fn dispose_all(&mut self, device: &mut dyn GpuDevice) {
        for (_, entry) in self.targets.drain() {
            if let Some(gpu) = entry.gpu {
                free(device, &gpu);
            }
        }
    }
}

fn allocate(device: &mut dyn GpuDevice, desc: &RenderTargetDesc) -> Result<GpuTarget> {
    let (width, height) = (desc.width, desc.height);

    let color = desc.color.map(|format| {
        device.create_texture(&TextureDescriptor {
            kind: TextureKind::D2,
            width,
            height,
            format,
            mip_levels: desc.mip_levels(),
        })
    });

    let (depth_texture, depth_renderbuffer) = match (desc.depth, desc.depth_texture) {
        (false, _) => (None, None),
        (true, true) => {
            let texture = device.create_texture(&TextureDescriptor {
                kind: TextureKind::D2,
                width,
                height,
                format: desc.depth_format(),
                mip_levels: 1,
            });
            (Some(texture), None)
        }
        // Depth lives only in the multisampled framebuffer.
        (true, false) if desc.samples > 1 && desc.color.is_some() => (None, None),
        (true, false) => {
            let rb = device.create_renderbuffer(desc.depth_format(), width, height, 1);
            (None, Some(rb))
        }
    };

    let framebuffer = device.create_framebuffer(&FramebufferAttachments {
        color: color.map(Attachment::Texture),
        depth: depth_texture
            .map(Attachment::Texture)
            .or(depth_renderbuffer.map(Attachment::Renderbuffer)),
        stencil: desc.stencil,
    });

    let msaa = (desc.samples > 1).then(|| {
        let color_rb = desc
            .color
            .map(|format| device.create_renderbuffer(format, width, height, desc.samples));
        let depth_rb = desc.depth.then(|| {
            device.create_renderbuffer(desc.depth_format(), width, height, desc.samples)
        });
        let framebuffer = device.create_framebuffer(&FramebufferAttachments {
            color: color_rb.map(Attachment::Renderbuffer),
            depth: depth_rb.map(Attachment::Renderbuffer),
            stencil: desc.stencil,
        });
        MsaaAttachments {
            framebuffer,
            color: color_rb,
            depth: depth_rb,
        }
    });

    let gpu = GpuTarget {
        width,
        height,
        framebuffer,
        color,
        depth_texture,
        depth_renderbuffer,
        msaa,
    };

    let complete = device.framebuffer_complete(framebuffer)
        && msaa.is_none_or(|m| device.framebuffer_complete(m.framebuffer));
    if !complete && !device.is_context_lost() {
        free(device, &gpu);
        return Err(RenderError::Device(format!(
            "render target framebuffer {width}x{height} is incomplete"
        )));
    }
    Ok(gpu)
}

fn free(device: &mut dyn GpuDevice, gpu: &GpuTarget) {
    if let Some(msaa) = gpu.msaa {
        device.delete_framebuffer(msaa.framebuffer);
        if let Some(rb) = msaa.color {
            device.delete_renderbuffer(rb);
        }
        if let Some(rb) = msaa.depth {
            device.delete_renderbuffer(rb);
        }
    }
    device.delete_framebuffer(gpu.framebuffer);
    if let Some(texture) = gpu.color {
        device.delete_texture(texture);
    }
    if let Some(texture) = gpu.depth_texture {
        device.delete_texture(texture);
    }
    if let Some(rb) = gpu.depth_renderbuffer {
        device.delete_renderbuffer(rb);
    }
}
