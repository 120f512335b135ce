//! Textures
//!
//! A [`Texture`] is the CPU-side description of a sampled image. The
//! [`TextureCache`](crate::renderer::resources::TextureCache) uploads it on
//! first use and again whenever its version moves.

use serde::{Deserialize, Serialize};

use super::version_tracker::ChangeTracker;
use super::{RenderTargetId, TextureHandle};

/// Dimensionality of a sampled texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureKind {
    D2,
    /// Six square faces, stored +X, -X, +Y, -Y, +Z, -Z.
    Cube,
}

/// Color space of texel data or of a render output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorSpace {
    #[default]
    Srgb,
    LinearSrgb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureSampler {
    pub address_mode_u: wgpu::AddressMode,
    pub address_mode_v: wgpu::AddressMode,
    pub mag_filter: wgpu::FilterMode,
    pub min_filter: wgpu::FilterMode,
    pub mipmap_filter: wgpu::MipmapFilterMode,
}

impl Default for TextureSampler {
    fn default() -> Self {
        Self {
            address_mode_u: wgpu::AddressMode::Repeat,
            address_mode_v: wgpu::AddressMode::Repeat,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::MipmapFilterMode::Linear,
        }
    }
}

/// Where a sampler uniform reads its texels from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureSource {
    /// A scene texture.
    Texture(TextureHandle),
    /// The (resolved) color attachment of a render target.
    Target(RenderTargetId),
    /// The depth attachment of a render target created with a depth texture.
    TargetDepth(RenderTargetId),
}

#[derive(Debug, Clone)]
pub struct Texture {
    pub name: String,
    pub kind: TextureKind,
    pub width: u32,
    pub height: u32,
    pub format: wgpu::TextureFormat,
    pub sampler: TextureSampler,
    pub generate_mipmaps: bool,
    pub color_space: ColorSpace,
    data: Option<Vec<u8>>,
    tracker: ChangeTracker,
}

impl Texture {
    /// Creates a 2D texture. `data` holds tightly packed rows.
    #[must_use]
    pub fn new_2d(
        width: u32,
        height: u32,
        format: wgpu::TextureFormat,
        data: Option<Vec<u8>>,
    ) -> Self {
        Self {
            name: "Texture".to_string(),
            kind: TextureKind::D2,
            width,
            height,
            format,
            sampler: TextureSampler::default(),
            generate_mipmaps: true,
            color_space: ColorSpace::Srgb,
            data,
            tracker: ChangeTracker::new(),
        }
    }

    /// Creates a cube texture with square faces of `size`.
    #[must_use]
    pub fn new_cube(size: u32, format: wgpu::TextureFormat, data: Option<Vec<u8>>) -> Self {
        Self {
            kind: TextureKind::Cube,
            ..Self::new_2d(size, size, format, data)
        }
    }

    /// Solid RGBA8 texture, handy for placeholders and tests.
    #[must_use]
    pub fn solid_rgba8(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let texels = (width * height) as usize;
        let data = rgba.iter().copied().cycle().take(texels * 4).collect();
        Self::new_2d(width, height, wgpu::TextureFormat::Rgba8Unorm, Some(data))
    }

    #[must_use]
    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    /// Replaces texel data and schedules a re-upload.
    pub fn set_data(&mut self, data: Vec<u8>) {
        self.data = Some(data);
        self.tracker.changed();
    }

    /// Resizes the texture, dropping any texel data.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.data = None;
        self.tracker.changed();
    }

    /// Schedules a re-upload after direct field edits.
    pub fn needs_update(&mut self) {
        self.tracker.changed();
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.tracker.version()
    }

    #[must_use]
    pub fn layer_count(&self) -> u32 {
        match self.kind {
            TextureKind::D2 => 1,
            TextureKind::Cube => 6,
        }
    }

    #[must_use]
    pub fn mip_level_count(&self) -> u32 {
        if self.generate_mipmaps {
            32 - self.width.max(self.height).max(1).leading_zeros()
        } else {
            1
        }
    }
}
