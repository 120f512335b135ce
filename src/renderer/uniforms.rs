//! Uniform Binding
//!
//! [`UniformBinder`] keeps, per program, the value last written to every
//! active uniform and only issues a device write when the new value differs.
//! Sampler uniforms are assigned texture units in declaration order per draw;
//! a unit is rebound only when the texture bound to it changes.
//!
//! View uniforms (projection, view, camera position) are re-checked only when
//! the bound program or the camera changes identity.

use rustc_hash::FxHashMap;
use slotmap::SecondaryMap;

use crate::errors::RenderError;
use crate::renderer::device::{GpuDevice, GpuTexture, UniformLocation};
use crate::renderer::program::{ProgramEntry, ProgramId};
use crate::resources::TextureSource;
use crate::resources::uniforms::{UniformType, UniformValue};
use crate::scene::CameraId;
use crate::utils::interner::{self, Symbol};

#[derive(Debug)]
struct Slot {
    location: UniformLocation,
    ty: UniformType,
    last: Option<UniformValue>,
}

#[derive(Debug, Default)]
struct ProgramUniforms {
    slots: FxHashMap<Symbol, Slot>,
}

/// Resolves a sampler source to a device texture. `None` unbinds the unit.
pub type TextureResolver<'a> = dyn Fn(&TextureSource) -> Option<GpuTexture> + 'a;

#[derive(Debug)]
pub struct UniformBinder {
    programs: SecondaryMap<ProgramId, ProgramUniforms>,
    max_texture_units: u32,
    next_unit: u32,
    bound_units: Vec<Option<GpuTexture>>,
    view_key: Option<(ProgramId, CameraId)>,
    exhaustion_reported: bool,
    writes: u64,
}

impl UniformBinder {
    #[must_use]
    pub fn new(max_texture_units: u32) -> Self {
        Self {
            programs: SecondaryMap::new(),
            max_texture_units,
            next_unit: 0,
            bound_units: vec![None; max_texture_units as usize],
            view_key: None,
            exhaustion_reported: false,
            writes: 0,
        }
    }

    /// Forgets the view identity so the next draw re-checks camera uniforms.
    pub fn begin_frame(&mut self) {
        self.view_key = None;
        self.exhaustion_reported = false;
    }

    /// Resets texture unit allocation. Call once per draw before uploads.
    pub fn begin_draw(&mut self) {
        self.next_unit = 0;
    }

    /// Number of uniform writes and texture binds issued so far.
    #[must_use]
    pub fn writes(&self) -> u64 {
        self.writes
    }

    fn slots(&mut self, id: ProgramId, entry: &ProgramEntry) -> &mut ProgramUniforms {
        if !self.programs.contains_key(id) {
            let slots = entry
                .uniforms
                .iter()
                .map(|u| {
                    let slot = Slot {
                        location: u.location,
                        ty: u.ty,
                        last: None,
                    };
                    (interner::intern(&u.name), slot)
                })
                .collect();
            self.programs.insert(id, ProgramUniforms { slots });
        }
        // Inserted above when missing.
        &mut self.programs[id]
    }

    /// Uploads one value. Returns `true` when a device call was issued.
    pub fn set(
        &mut self,
        device: &mut dyn GpuDevice,
        id: ProgramId,
        entry: &ProgramEntry,
        name: &str,
        value: &UniformValue,
        resolve: &TextureResolver<'_>,
    ) -> bool {
        let Some(symbol) = interner::get(name) else {
            return false;
        };
        if !self.slots(id, entry).slots.contains_key(&symbol) {
            return false;
        }

        if let UniformValue::Texture(source) = value {
            return self.set_texture(device, id, symbol, source, resolve);
        }

        let Some(slot) = self.programs.get_mut(id).and_then(|p| p.slots.get_mut(&symbol)) else {
            return false;
        };
        if slot.ty.is_sampler() || slot.last.as_ref() == Some(value) {
            return false;
        }
        device.uniform(slot.location, value);
        slot.last = Some(value.clone());
        self.writes += 1;
        true
    }

    fn set_texture(
        &mut self,
        device: &mut dyn GpuDevice,
        id: ProgramId,
        symbol: Symbol,
        source: &TextureSource,
        resolve: &TextureResolver<'_>,
    ) -> bool {
        let unit = self.next_unit;
        if unit >= self.max_texture_units {
            if !self.exhaustion_reported {
                let err = RenderError::ResourceExhaustion {
                    resource: "texture units",
                    requested: unit + 1,
                    available: self.max_texture_units,
                };
                log::warn!("{err}; sampler '{}' skipped", interner::resolve(symbol));
                self.exhaustion_reported = true;
            }
            return false;
        }
        self.next_unit += 1;

        let mut issued = false;
        let texture = resolve(source);
        if self.bound_units[unit as usize] != texture {
            device.bind_texture(unit, texture);
            self.bound_units[unit as usize] = texture;
            self.writes += 1;
            issued = true;
        }

        let unit_value = UniformValue::Int(unit as i32);
        if let Some(slot) = self.programs.get_mut(id).and_then(|p| p.slots.get_mut(&symbol))
            && slot.last.as_ref() != Some(&unit_value)
        {
            device.uniform(slot.location, &unit_value);
            slot.last = Some(unit_value);
            self.writes += 1;
            issued = true;
        }
        issued
    }

    /// Uploads a list of values in order.
    pub fn upload<'v>(
        &mut self,
        device: &mut dyn GpuDevice,
        id: ProgramId,
        entry: &ProgramEntry,
        values: impl IntoIterator<Item = &'v (&'v str, UniformValue)>,
        resolve: &TextureResolver<'_>,
    ) {
        for (name, value) in values {
            self.set(device, id, entry, name, value, resolve);
        }
    }

    /// Uploads camera uniforms when the `(program, camera)` pair changed.
    /// Returns `false` when the pair was already current.
    pub fn upload_view(
        &mut self,
        device: &mut dyn GpuDevice,
        id: ProgramId,
        entry: &ProgramEntry,
        camera: CameraId,
        values: &[(&str, UniformValue)],
    ) -> bool {
        if self.view_key == Some((id, camera)) {
            return false;
        }
        self.view_key = Some((id, camera));
        for (name, value) in values {
            self.set(device, id, entry, name, value, &|_| None);
        }
        true
    }

    /// Drops the snapshot of a freed program.
    pub fn forget(&mut self, id: ProgramId) {
        self.programs.remove(id);
        if self.view_key.is_some_and(|(p, _)| p == id) {
            self.view_key = None;
        }
    }

    /// Forgets a deleted texture so its unit is rebound next time.
    pub fn forget_texture(&mut self, texture: GpuTexture) {
        for bound in &mut self.bound_units {
            if *bound == Some(texture) {
                *bound = None;
            }
        }
    }

    /// Drops all tracked device state, e.g. after context loss.
    pub fn reset(&mut self) {
        self.programs.clear();
        self.bound_units.iter_mut().for_each(|b| *b = None);
        self.view_key = None;
        self.next_unit = 0;
    }
}

#[cfg(test)]
mod tests {
    use glam::{Mat4, Vec3};

    use super::*;
    use crate::renderer::device::{DeviceCommand, HeadlessDevice};
    use crate::renderer::program::{ObjectFeatures, ProgramCache, ProgramContext, ProgramParameters};
    use crate::resources::{Material, MaterialKind, MaterialMaps, TextureHandle};

    fn program(
        device: &mut HeadlessDevice,
        cache: &mut ProgramCache,
        material: &Material,
    ) -> ProgramId {
        let ctx = ProgramContext::default();
        let params = ProgramParameters::new(material, &ObjectFeatures::default(), &ctx);
        cache.acquire(device, &params).unwrap()
    }

    fn uniform_writes(device: &HeadlessDevice) -> usize {
        device.count_commands(|c| matches!(c, DeviceCommand::Uniform { .. }))
    }

    #[test]
    fn unchanged_values_are_not_reuploaded() {
        let mut device = HeadlessDevice::new(64, 64);
        let mut cache = ProgramCache::new();
        let material = Material::new(MaterialKind::basic(Vec3::ONE));
        let id = program(&mut device, &mut cache, &material);
        let entry = cache.get(id).unwrap();
        let mut binder = UniformBinder::new(16);

        device.clear_commands();
        let diffuse = UniformValue::Vec3(Vec3::new(1.0, 0.0, 0.0));
        assert!(binder.set(&mut device, id, entry, "diffuse", &diffuse, &|_| None));
        assert!(!binder.set(&mut device, id, entry, "diffuse", &diffuse, &|_| None));
        assert_eq!(uniform_writes(&device), 1);

        let changed = UniformValue::Vec3(Vec3::ONE);
        assert!(binder.set(&mut device, id, entry, "diffuse", &changed, &|_| None));
        assert_eq!(uniform_writes(&device), 2);
    }

    #[test]
    fn unknown_uniforms_are_ignored() {
        let mut device = HeadlessDevice::new(64, 64);
        let mut cache = ProgramCache::new();
        let material = Material::new(MaterialKind::basic(Vec3::ONE));
        let id = program(&mut device, &mut cache, &material);
        let entry = cache.get(id).unwrap();
        let mut binder = UniformBinder::new(16);

        device.clear_commands();
        let value = UniformValue::Float(1.0);
        assert!(!binder.set(&mut device, id, entry, "shininess", &value, &|_| None));
        assert!(device.commands().is_empty());
    }

    #[test]
    fn view_uniforms_follow_program_and_camera_identity() {
        let mut device = HeadlessDevice::new(64, 64);
        let mut cache = ProgramCache::new();
        let material = Material::new(MaterialKind::basic(Vec3::ONE));
        let id = program(&mut device, &mut cache, &material);
        let entry = cache.get(id).unwrap();
        let mut binder = UniformBinder::new(16);

        let view = [("projectionMatrix", UniformValue::Mat4(Mat4::IDENTITY))];
        let camera = CameraId::next();
        assert!(binder.upload_view(&mut device, id, entry, camera, &view));
        assert!(!binder.upload_view(&mut device, id, entry, camera, &view));
        assert!(binder.upload_view(&mut device, id, entry, CameraId::next(), &view));
    }

    #[test]
    fn texture_units_rebind_only_on_change() {
        let mut device = HeadlessDevice::new(64, 64);
        let mut cache = ProgramCache::new();
        let material = Material::new(MaterialKind::basic(Vec3::ONE)).with_maps(MaterialMaps {
            map: Some(TextureHandle::default()),
            ..Default::default()
        });
        let id = program(&mut device, &mut cache, &material);
        let entry = cache.get(id).unwrap();
        let mut binder = UniformBinder::new(16);

        let source = UniformValue::Texture(TextureSource::Texture(TextureHandle::default()));
        let resolve = |_: &TextureSource| Some(GpuTexture(7));

        device.clear_commands();
        binder.begin_draw();
        assert!(binder.set(&mut device, id, entry, "map", &source, &resolve));
        binder.begin_draw();
        assert!(!binder.set(&mut device, id, entry, "map", &source, &resolve));
        let binds = device.count_commands(|c| matches!(c, DeviceCommand::BindTexture { .. }));
        assert_eq!(binds, 1);
    }

    #[test]
    fn exhausted_units_skip_the_sampler() {
        let mut device = HeadlessDevice::new(64, 64);
        let mut cache = ProgramCache::new();
        let material = Material::new(MaterialKind::basic(Vec3::ONE)).with_maps(MaterialMaps {
            map: Some(TextureHandle::default()),
            ..Default::default()
        });
        let id = program(&mut device, &mut cache, &material);
        let entry = cache.get(id).unwrap();
        let mut binder = UniformBinder::new(0);

        let source = UniformValue::Texture(TextureSource::Texture(TextureHandle::default()));
        device.clear_commands();
        binder.begin_draw();
        assert!(!binder.set(&mut device, id, entry, "map", &source, &|_| Some(GpuTexture(1))));
        assert!(device.commands().is_empty());
    }
}
