//! GPU Resource Caches
//!
//! Device-side copies of scene geometry, instance data and textures. Each
//! entry remembers the CPU version it was uploaded from and is re-uploaded
//! only when that version moves.

use glam::Vec3;
use slotmap::SecondaryMap;
use smallvec::SmallVec;

use crate::renderer::device::{BufferTarget, GpuBuffer, GpuDevice, GpuTexture, TextureDescriptor};
use crate::resources::geometry::{
    INSTANCE_COLOR_LOCATION, INSTANCE_MATRIX_LOCATION, MORPH_TARGET_LOCATION,
};
use crate::resources::{Geometry, GeometryHandle, Texture, TextureHandle};
use crate::scene::{Instances, NodeHandle};

// ============================================================================
// Textures
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct TextureEntry {
    version: u64,
    /// `None` when the texture could not be created
    gpu: Option<GpuTexture>,
}

/// Uploaded scene textures.
#[derive(Debug, Default)]
pub struct TextureCache {
    entries: SecondaryMap<TextureHandle, TextureEntry>,
    freed: Vec<GpuTexture>,
    uploads: u64,
}

impl TextureCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Uploads `texture` when missing or stale. A texture the device cannot
    /// hold is reported once per version and resolves to `None`.
    pub fn prepare(
        &mut self,
        device: &mut dyn GpuDevice,
        handle: TextureHandle,
        texture: &Texture,
    ) -> Option<GpuTexture> {
        if let Some(entry) = self.entries.get(handle)
            && entry.version == texture.version()
        {
            return entry.gpu;
        }

        if let Some(old) = self.entries.remove(handle).and_then(|e| e.gpu) {
            device.delete_texture(old);
            self.freed.push(old);
        }

        let gpu = match unusable_reason(device, texture) {
            Some(reason) => {
                log::warn!("Texture '{}' skipped: {reason}", texture.name);
                None
            }
            None => Some(upload(device, texture)),
        };
        if gpu.is_some() {
            self.uploads += 1;
        }
        self.entries.insert(
            handle,
            TextureEntry {
                version: texture.version(),
                gpu,
            },
        );
        gpu
    }

    /// Last uploaded texture, without touching the device.
    #[must_use]
    pub fn get(&self, handle: TextureHandle) -> Option<GpuTexture> {
        self.entries.get(handle)?.gpu
    }

    #[must_use]
    pub fn uploads(&self) -> u64 {
        self.uploads
    }

    /// Device textures deleted since the last call.
    pub fn take_freed(&mut self) -> Vec<GpuTexture> {
        std::mem::take(&mut self.freed)
    }

    pub fn dispose(&mut self, device: &mut dyn GpuDevice, handle: TextureHandle) -> bool {
        let Some(entry) = self.entries.remove(handle) else {
            return false;
        };
        if let Some(gpu) = entry.gpu {
            device.delete_texture(gpu);
            self.freed.push(gpu);
        }
        true
    }

    pub fn invalidate(&mut self) {
        self.entries.clear();
        self.freed.clear();
    }

    pub fn dispose_all(&mut self, device: &mut dyn GpuDevice) {
        for (_, entry) in self.entries.drain() {
            if let Some(gpu) = entry.gpu {
                device.delete_texture(gpu);
            }
        }
        self.freed.clear();
    }
}

fn unusable_reason(device: &dyn GpuDevice, texture: &Texture) -> Option<String> {
    let caps = device.capabilities();
    if texture.width == 0 || texture.height == 0 {
        return Some(format!("zero size {}x{}", texture.width, texture.height));
    }
    if texture.width > caps.max_texture_size || texture.height > caps.max_texture_size {
        return Some(format!(
            "{}x{} exceeds the device limit {}",
            texture.width, texture.height, caps.max_texture_size
        ));
    }
    if !caps.supports_format(texture.format) {
        return Some(format!("format {:?} is not supported", texture.format));
    }
    None
}

fn upload(device: &mut dyn GpuDevice, texture: &Texture) -> GpuTexture {
    let mip_levels = texture.mip_level_count();
    let gpu = device.create_texture(&TextureDescriptor {
        kind: texture.kind,
        width: texture.width,
        height: texture.height,
        format: texture.format,
        mip_levels,
    });
    if let Some(data) = texture.data() {
        let layers = texture.layer_count() as usize;
        let layer_len = data.len() / layers;
        if layer_len > 0 {
            for (layer, bytes) in data.chunks_exact(layer_len).take(layers).enumerate() {
                device.upload_texture(gpu, layer as u32, bytes);
            }
        }
        if mip_levels > 1 {
            device.generate_mipmaps(gpu);
        }
    }
    gpu
}

// ============================================================================
// Geometry
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct VertexBinding {
    location: u32,
    buffer: GpuBuffer,
    item_size: u32,
}

#[derive(Debug)]
struct GpuGeometry {
    version: u64,
    attributes: SmallVec<[VertexBinding; 8]>,
    morph_targets: SmallVec<[GpuBuffer; 3]>,
    index: Option<GpuBuffer>,
}

impl GpuGeometry {
    fn buffers(&self) -> impl Iterator<Item = GpuBuffer> + '_ {
        self.attributes
            .iter()
            .map(|a| a.buffer)
            .chain(self.morph_targets.iter().copied())
            .chain(self.index)
    }
}

#[derive(Debug)]
struct GpuInstances {
    version: u64,
    matrices: GpuBuffer,
    colors: Option<GpuBuffer>,
}

/// Which vertex state is currently bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BoundKey {
    geometry: GeometryHandle,
    geometry_version: u64,
    instances: Option<(NodeHandle, u64)>,
    morph_targets: usize,
}

/// Uploaded geometry buffers and per-node instance buffers.
#[derive(Debug, Default)]
pub struct GeometryCache {
    geometries: SecondaryMap<GeometryHandle, GpuGeometry>,
    instances: SecondaryMap<NodeHandle, GpuInstances>,
    bound: Option<BoundKey>,
    /// Bit per enabled attribute location
    enabled: u32,
    uploads: u64,
}

impl GeometryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer uploads performed so far.
    #[must_use]
    pub fn uploads(&self) -> u64 {
        self.uploads
    }

    /// Uploads and binds the vertex state of one draw. Returns whether the
    /// draw is indexed.
    pub fn bind(
        &mut self,
        device: &mut dyn GpuDevice,
        handle: GeometryHandle,
        geometry: &Geometry,
        instances: Option<(NodeHandle, &Instances)>,
    ) -> bool {
        self.prepare_geometry(device, handle, geometry);
        if let Some((node, data)) = instances {
            self.prepare_instances(device, node, data);
        }

        let key = BoundKey {
            geometry: handle,
            geometry_version: geometry.version(),
            instances: instances.map(|(node, data)| (node, data.version())),
            morph_targets: geometry.active_morph_targets(),
        };
        let indexed = geometry.index().is_some();
        if self.bound == Some(key) {
            return indexed;
        }

        let mut enabled = 0u32;
        if let Some(gpu) = self.geometries.get(handle) {
            for a in &gpu.attributes {
                device.vertex_attribute(a.location, a.buffer, a.item_size, 0, 0, 0);
                enabled |= 1 << a.location;
            }
            for (i, &buffer) in gpu.morph_targets.iter().take(key.morph_targets).enumerate() {
                let location = MORPH_TARGET_LOCATION + i as u32;
                device.vertex_attribute(location, buffer, 3, 0, 0, 0);
                enabled |= 1 << location;
            }
            device.bind_index_buffer(gpu.index);
        }

        if let Some((node, _)) = instances
            && let Some(gpu) = self.instances.get(node)
        {
            for column in 0..4 {
                let location = INSTANCE_MATRIX_LOCATION + column;
                device.vertex_attribute(location, gpu.matrices, 4, 64, column * 16, 1);
                enabled |= 1 << location;
            }
            if let Some(colors) = gpu.colors {
                device.vertex_attribute(INSTANCE_COLOR_LOCATION, colors, 3, 0, 0, 1);
                enabled |= 1 << INSTANCE_COLOR_LOCATION;
            }
        }

        let stale = self.enabled & !enabled;
        for location in 0..32 {
            if stale & (1 << location) != 0 {
                device.disable_vertex_attribute(location);
            }
        }
        self.enabled = enabled;
        self.bound = Some(key);
        indexed
    }

    fn prepare_geometry(
        &mut self,
        device: &mut dyn GpuDevice,
        handle: GeometryHandle,
        geometry: &Geometry,
    ) {
        if self
            .geometries
            .get(handle)
            .is_some_and(|g| g.version == geometry.version())
        {
            return;
        }
        if let Some(old) = self.geometries.remove(handle) {
            old.buffers().for_each(|b| device.delete_buffer(b));
        }

        let attributes = geometry
            .attributes()
            .map(|(semantic, attribute)| VertexBinding {
                location: semantic.location(),
                buffer: device.create_buffer(
                    BufferTarget::Vertex,
                    bytemuck::cast_slice(&attribute.data),
                ),
                item_size: attribute.item_size,
            })
            .collect();
        let morph_targets = geometry
            .morph_targets()
            .iter()
            .take(geometry.active_morph_targets())
            .map(|t| device.create_buffer(BufferTarget::Vertex, bytemuck::cast_slice(&t.data)))
            .collect();
        let index = geometry
            .index()
            .map(|i| device.create_buffer(BufferTarget::Index, bytemuck::cast_slice(i)));

        self.geometries.insert(
            handle,
            GpuGeometry {
                version: geometry.version(),
                attributes,
                morph_targets,
                index,
            },
        );
        self.uploads += 1;
        self.bound = None;
        log::debug!("Uploaded geometry '{}'", geometry.name);
    }

    fn prepare_instances(
        &mut self,
        device: &mut dyn GpuDevice,
        node: NodeHandle,
        data: &Instances,
    ) {
        if self
            .instances
            .get(node)
            .is_some_and(|g| g.version == data.version())
        {
            return;
        }
        if let Some(old) = self.instances.remove(node) {
            device.delete_buffer(old.matrices);
            if let Some(colors) = old.colors {
                device.delete_buffer(colors);
            }
        }
        let matrices =
            device.create_buffer(BufferTarget::Vertex, bytemuck::cast_slice(data.matrices()));
        let colors = data.colors().map(|c: &[Vec3]| {
            device.create_buffer(BufferTarget::Vertex, bytemuck::cast_slice(c))
        });
        self.instances.insert(
            node,
            GpuInstances {
                version: data.version(),
                matrices,
                colors,
            },
        );
        self.uploads += 1;
        self.bound = None;
    }

    /// Forgets the bound vertex state, e.g. at the start of a frame.
    pub fn unbind(&mut self) {
        self.bound = None;
    }

    pub fn dispose(&mut self, device: &mut dyn GpuDevice, handle: GeometryHandle) -> bool {
        let Some(gpu) = self.geometries.remove(handle) else {
            return false;
        };
        gpu.buffers().for_each(|b| device.delete_buffer(b));
        if self.bound.is_some_and(|b| b.geometry == handle) {
            self.bound = None;
        }
        true
    }

    pub fn invalidate(&mut self) {
        self.geometries.clear();
        self.instances.clear();
        self.bound = None;
        self.enabled = 0;
    }

    pub fn dispose_all(&mut self, device: &mut dyn GpuDevice) {
        for (_, gpu) in self.geometries.drain() {
            gpu.buffers().for_each(|b| device.delete_buffer(b));
        }
        for (_, gpu) in self.instances.drain() {
            device.delete_buffer(gpu.matrices);
            if let Some(colors) = gpu.colors {
                device.delete_buffer(colors);
            }
        }
        self.bound = None;
        self.enabled = 0;
    }
}

#[cfg(test)]
mod tests {
    use slotmap::SlotMap;

    use super::*;
    use crate::renderer::device::{DeviceCommand, HeadlessDevice};

    fn triangle() -> Geometry {
        Geometry::from_positions(
            vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
            Some(vec![0, 1, 2]),
        )
    }

    #[test]
    fn geometry_uploads_once_per_version() {
        let mut device = HeadlessDevice::new(8, 8);
        let mut handles: SlotMap<GeometryHandle, ()> = SlotMap::with_key();
        let handle = handles.insert(());
        let mut cache = GeometryCache::new();
        let mut geometry = triangle();

        assert!(cache.bind(&mut device, handle, &geometry, None));
        cache.unbind();
        cache.bind(&mut device, handle, &geometry, None);
        assert_eq!(cache.uploads(), 1);

        geometry.needs_update();
        cache.bind(&mut device, handle, &geometry, None);
        assert_eq!(cache.uploads(), 2);
        assert_eq!(device.live_buffers(), 2);
    }

    #[test]
    fn rebinding_the_same_geometry_is_skipped() {
        let mut device = HeadlessDevice::new(8, 8);
        let mut handles: SlotMap<GeometryHandle, ()> = SlotMap::with_key();
        let handle = handles.insert(());
        let mut cache = GeometryCache::new();
        let geometry = triangle();

        cache.bind(&mut device, handle, &geometry, None);
        device.clear_commands();
        cache.bind(&mut device, handle, &geometry, None);
        assert!(device.commands().is_empty());
    }

    #[test]
    fn instance_matrices_use_divisor_one() {
        let mut device = HeadlessDevice::new(8, 8);
        let mut handles: SlotMap<GeometryHandle, ()> = SlotMap::with_key();
        let mut nodes: SlotMap<NodeHandle, ()> = SlotMap::with_key();
        let handle = handles.insert(());
        let node = nodes.insert(());
        let mut cache = GeometryCache::new();
        let instances = Instances::new(vec![glam::Mat4::IDENTITY; 3]);

        cache.bind(&mut device, handle, &triangle(), Some((node, &instances)));
        let per_instance = device.count_commands(|c| {
            matches!(c, DeviceCommand::VertexAttribute { divisor: 1, .. })
        });
        assert_eq!(per_instance, 4);
    }

    #[test]
    fn unusable_textures_resolve_to_none() {
        let mut device = HeadlessDevice::new(8, 8);
        let mut handles: SlotMap<TextureHandle, ()> = SlotMap::with_key();
        let mut cache = TextureCache::new();

        let empty = Texture::new_2d(0, 4, wgpu::TextureFormat::Rgba8Unorm, None);
        assert!(cache.prepare(&mut device, handles.insert(()), &empty).is_none());

        let huge = Texture::new_2d(1 << 20, 4, wgpu::TextureFormat::Rgba8Unorm, None);
        assert!(cache.prepare(&mut device, handles.insert(()), &huge).is_none());

        let solid = Texture::solid_rgba8(2, 2, [255, 0, 0, 255]);
        let handle = handles.insert(());
        assert!(cache.prepare(&mut device, handle, &solid).is_some());
        assert!(cache.prepare(&mut device, handle, &solid).is_some());
        assert_eq!(cache.uploads(), 1);
        assert_eq!(device.live_textures(), 1);
    }
}
