//! Material Program Bindings
//!
//! Each `(material, object, target kind)` triple that gets drawn holds one
//! reference on a [`ProgramCache`] entry. The binding remembers the key it
//! was resolved with; when a material's freshly derived key differs, the old
//! reference is released and the new program acquired.
//!
//! Build failures are recorded per material and the binding is pointed at
//! the pinned fallback program, so the failing key is not recompiled every
//! frame.

use rustc_hash::FxHashMap;

use crate::renderer::device::{GpuDevice, GpuProgram};
use crate::renderer::program::{
    ObjectFeatures, ProgramCache, ProgramContext, ProgramId, ProgramKey, ProgramParameters,
    ShaderDiagnostics,
};
use crate::resources::{Material, MaterialId};
use crate::scene::{NodeHandle, Scene};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct BindingKey {
    material: MaterialId,
    node: NodeHandle,
    /// Offscreen passes compile without tone mapping
    offscreen: bool,
}

#[derive(Debug, Clone, Copy)]
struct Binding {
    program: ProgramId,
    key: ProgramKey,
    material_version: u64,
    object: ObjectFeatures,
    ctx: ProgramContext,
    /// Holds a cache reference; `false` for the fallback program
    owned: bool,
}

#[derive(Debug, Default)]
pub(crate) struct MaterialBindings {
    bindings: FxHashMap<BindingKey, Binding>,
    diagnostics: FxHashMap<MaterialId, ShaderDiagnostics>,
    /// Programs freed by releases since the last `take_freed`
    freed: Vec<(ProgramId, GpuProgram)>,
}

fn release(
    freed: &mut Vec<(ProgramId, GpuProgram)>,
    device: &mut dyn GpuDevice,
    programs: &mut ProgramCache,
    id: ProgramId,
) {
    let gpu = programs.get(id).map(|e| e.gpu);
    if programs.release(device, id)
        && let Some(gpu) = gpu
    {
        freed.push((id, gpu));
    }
}

impl MaterialBindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Program to draw `material` on `node` with. `None` only when even the
    /// fallback program cannot be built.
    pub fn resolve(
        &mut self,
        device: &mut dyn GpuDevice,
        programs: &mut ProgramCache,
        material: &Material,
        node: NodeHandle,
        object: &ObjectFeatures,
        ctx: &ProgramContext,
        offscreen: bool,
    ) -> Option<ProgramId> {
        let binding_key = BindingKey {
            material: material.id(),
            node,
            offscreen,
        };

        if let Some(b) = self.bindings.get(&binding_key)
            && b.material_version == material.version()
            && b.object == *object
            && b.ctx == *ctx
            && programs.get(b.program).is_some()
        {
            return Some(b.program);
        }

        let params = ProgramParameters::new(material, object, ctx);
        let key = params.key();

        if let Some(b) = self.bindings.get_mut(&binding_key)
            && b.key == key
            && programs.get(b.program).is_some()
        {
            b.material_version = material.version();
            b.object = *object;
            b.ctx = *ctx;
            return Some(b.program);
        }

        if let Some(old) = self.bindings.remove(&binding_key)
            && old.owned
        {
            log::debug!("Material '{}' changed program key", material.name);
            release(&mut self.freed, device, programs, old.program);
        }

        let (program, owned) = match programs.acquire(device, &params) {
            Ok(id) => {
                self.diagnostics.remove(&material.id());
                (id, true)
            }
            Err(diagnostics) => {
                log::warn!(
                    "Material '{}' ({}) draws with the fallback program",
                    material.name,
                    params.name()
                );
                self.diagnostics.insert(material.id(), diagnostics);
                (programs.fallback(device, ctx.precision)?, false)
            }
        };

        self.bindings.insert(
            binding_key,
            Binding {
                program,
                key,
                material_version: material.version(),
                object: *object,
                ctx: *ctx,
                owned,
            },
        );
        Some(program)
    }

    /// Last build failure of a material, if its current program failed.
    pub fn diagnostics(&self, material: MaterialId) -> Option<&ShaderDiagnostics> {
        self.diagnostics.get(&material)
    }

    /// Program a material was last resolved to on any object.
    pub fn program_of(&self, material: MaterialId) -> Option<ProgramId> {
        self.bindings
            .iter()
            .find(|(k, _)| k.material == material)
            .map(|(_, b)| b.program)
    }

    /// Releases every reference held for `material`. Returns `false` when
    /// nothing was bound, so repeated disposal is a no-op.
    pub fn dispose_material(
        &mut self,
        device: &mut dyn GpuDevice,
        programs: &mut ProgramCache,
        material: MaterialId,
    ) -> bool {
        let mut released = false;
        let freed = &mut self.freed;
        self.bindings.retain(|key, binding| {
            if key.material != material {
                return true;
            }
            if binding.owned {
                release(freed, device, programs, binding.program);
            }
            released = true;
            false
        });
        released |= self.diagnostics.remove(&material).is_some();
        released
    }

    /// Releases bindings whose node left the scene.
    pub fn prune(
        &mut self,
        device: &mut dyn GpuDevice,
        programs: &mut ProgramCache,
        scene: &Scene,
    ) {
        let freed = &mut self.freed;
        self.bindings.retain(|key, binding| {
            if scene.node(key.node).is_some() {
                return true;
            }
            if binding.owned {
                release(freed, device, programs, binding.program);
            }
            false
        });
    }

    /// Drains programs freed since the last call, so per-program state
    /// mirrors can be dropped.
    pub fn take_freed(&mut self) -> Vec<(ProgramId, GpuProgram)> {
        std::mem::take(&mut self.freed)
    }

    /// Forgets all bindings without releasing; the cache was invalidated.
    pub fn invalidate(&mut self) {
        self.bindings.clear();
        self.freed.clear();
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec3;
    use slotmap::SlotMap;

    use super::*;
    use crate::renderer::device::HeadlessDevice;
    use crate::resources::MaterialKind;

    fn nodes(n: usize) -> Vec<NodeHandle> {
        let mut map: SlotMap<NodeHandle, ()> = SlotMap::with_key();
        (0..n).map(|_| map.insert(())).collect()
    }

    #[test]
    fn two_objects_share_one_program_with_two_references() {
        let mut device = HeadlessDevice::new(4, 4);
        let mut programs = ProgramCache::new();
        let mut bindings = MaterialBindings::new();
        let material = Material::new(MaterialKind::basic(Vec3::ONE));
        let ctx = ProgramContext::default();
        let object = ObjectFeatures::default();
        let n = nodes(2);

        let mut resolve = |node| {
            bindings.resolve(&mut device, &mut programs, &material, node, &object, &ctx, false)
        };
        let a = resolve(n[0]);
        let b = resolve(n[1]);
        // Resolving again on a later frame takes no new reference.
        let c = resolve(n[0]);
        assert_eq!(a, b);
        assert_eq!(a, c);
        let id = a.unwrap();
        assert_eq!(programs.compile_events(), 1);
        assert_eq!(programs.used_times(id), 2);
    }

    #[test]
    fn key_change_releases_previous_program() {
        let mut device = HeadlessDevice::new(4, 4);
        let mut programs = ProgramCache::new();
        let mut bindings = MaterialBindings::new();
        let mut material = Material::new(MaterialKind::basic(Vec3::ONE));
        let ctx = ProgramContext::default();
        let object = ObjectFeatures::default();
        let node = nodes(1)[0];

        let first = bindings
            .resolve(&mut device, &mut programs, &material, node, &object, &ctx, false)
            .unwrap();
        material.settings_mut().alpha_test = 0.5;
        let second = bindings
            .resolve(&mut device, &mut programs, &material, node, &object, &ctx, false)
            .unwrap();

        assert_ne!(first, second);
        assert!(programs.get(first).is_none());
        assert_eq!(programs.len(), 1);
        let freed = bindings.take_freed();
        assert_eq!(freed.len(), 1);
        assert_eq!(freed[0].0, first);
    }

    #[test]
    fn repeated_disposal_frees_once() {
        let mut device = HeadlessDevice::new(4, 4);
        let mut programs = ProgramCache::new();
        let mut bindings = MaterialBindings::new();
        let material = Material::new(MaterialKind::basic(Vec3::ONE));
        let ctx = ProgramContext::default();
        let object = ObjectFeatures::default();
        for node in nodes(3) {
            bindings.resolve(&mut device, &mut programs, &material, node, &object, &ctx, false);
        }

        assert!(bindings.dispose_material(&mut device, &mut programs, material.id()));
        assert!(!bindings.dispose_material(&mut device, &mut programs, material.id()));
        assert!(!bindings.dispose_material(&mut device, &mut programs, material.id()));
        assert!(programs.is_empty());
        assert_eq!(device.live_programs(), 0);
    }
}
