//! Program Cache
//!
//! Maps a [`ProgramKey`] to one compiled and linked program, shared by every
//! draw whose parameters project onto that key. Entries are refcounted:
//! [`ProgramCache::acquire`] increments, [`ProgramCache::release`] decrements
//! and frees the GPU program when the count reaches zero.
//!
//! Failed builds are never inserted. The caller keeps the returned
//! [`ShaderDiagnostics`] and draws with [`ProgramCache::fallback`], a pinned
//! placeholder program compiled on first need.

use rustc_hash::FxHashMap;
use slotmap::{SlotMap, new_key_type};

use super::shader_gen::{ShaderGenerator, ShaderSources};
use super::shader_manager::{error_line, numbered_context};
use super::{ProgramKey, ProgramParameters, ShaderDiagnostics};
use crate::renderer::device::{ActiveUniform, GpuDevice, GpuProgram, ShaderStage};
use crate::renderer::lights::LIGHTS_BINDING_POINT;
use crate::renderer::settings::Precision;

new_key_type! {
    pub struct ProgramId;
}

#[derive(Debug)]
pub struct ProgramEntry {
    /// `None` for the fallback program
    pub key: Option<ProgramKey>,
    pub name: &'static str,
    pub gpu: GpuProgram,
    pub used_times: u32,
    pub uniforms: Vec<ActiveUniform>,
    /// Index of the `Lights` block, if the program declares it
    pub lights_block: Option<u32>,
}

#[derive(Debug, Default)]
pub struct ProgramCache {
    programs: SlotMap<ProgramId, ProgramEntry>,
    lookup: FxHashMap<ProgramKey, ProgramId>,
    fallback: Option<ProgramId>,
    compile_events: u64,
}

impl ProgramCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the program for `params`, compiling it on a miss. Each
    /// successful call takes one reference.
    pub fn acquire(
        &mut self,
        device: &mut dyn GpuDevice,
        params: &ProgramParameters,
    ) -> Result<ProgramId, ShaderDiagnostics> {
        let key = params.key();
        if let Some(&id) = self.lookup.get(&key)
            && let Some(entry) = self.programs.get_mut(id)
        {
            entry.used_times += 1;
            log::trace!("Program cache hit: {} ({} users)", entry.name, entry.used_times);
            return Ok(id);
        }

        let name = params.name();
        let sources = ShaderGenerator::generate(params).map_err(|err| {
            log::error!("Shader template for '{name}' failed: {err}");
            ShaderDiagnostics {
                program: name.to_string(),
                template_error: Some(err.to_string()),
                ..Default::default()
            }
        })?;

        let entry = self.build(device, name, Some(key), &sources)?;
        let id = self.programs.insert(entry);
        self.lookup.insert(key, id);
        log::debug!("Compiled program '{name}' ({} live)", self.lookup.len());
        Ok(id)
    }

    /// Drops one reference. Returns `true` when the program was freed.
    pub fn release(&mut self, device: &mut dyn GpuDevice, id: ProgramId) -> bool {
        if self.fallback == Some(id) {
            return false;
        }
        let Some(entry) = self.programs.get_mut(id) else {
            log::warn!("Released a program that is no longer cached");
            return false;
        };

        entry.used_times = entry.used_times.saturating_sub(1);
        if entry.used_times > 0 {
            return false;
        }

        if let Some(entry) = self.programs.remove(id) {
            device.delete_program(entry.gpu);
            if let Some(key) = entry.key {
                self.lookup.remove(&key);
            }
            log::debug!("Freed program '{}'", entry.name);
        }
        true
    }

    /// The placeholder program, compiled on first use. `None` only if even
    /// the placeholder fails to build.
    pub fn fallback(
        &mut self,
        device: &mut dyn GpuDevice,
        precision: Precision,
    ) -> Option<ProgramId> {
        if let Some(id) = self.fallback
            && self.programs.contains_key(id)
        {
            return Some(id);
        }

        let sources = match ShaderGenerator::fallback(precision) {
            Ok(sources) => sources,
            Err(err) => {
                log::error!("Fallback shader template failed: {err}");
                return None;
            }
        };
        let entry = self.build(device, "fallback", None, &sources).ok()?;
        let id = self.programs.insert(entry);
        self.fallback = Some(id);
        Some(id)
    }

    #[must_use]
    pub fn is_fallback(&self, id: ProgramId) -> bool {
        self.fallback == Some(id)
    }

    #[must_use]
    pub fn get(&self, id: ProgramId) -> Option<&ProgramEntry> {
        self.programs.get(id)
    }

    #[must_use]
    pub fn lookup(&self, key: &ProgramKey) -> Option<ProgramId> {
        self.lookup.get(key).copied()
    }

    #[must_use]
    pub fn used_times(&self, id: ProgramId) -> u32 {
        self.programs.get(id).map_or(0, |e| e.used_times)
    }

    /// Live keyed programs, excluding the placeholder.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lookup.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lookup.is_empty()
    }

    /// Number of compile/link attempts so far.
    #[must_use]
    pub fn compile_events(&self) -> u64 {
        self.compile_events
    }

    /// Forgets every program without touching the device; used after the
    /// context was lost and the objects are already gone.
    pub fn invalidate(&mut self) {
        self.programs.clear();
        self.lookup.clear();
        self.fallback = None;
    }

    /// Deletes every program.
    pub fn dispose(&mut self, device: &mut dyn GpuDevice) {
        for (_, entry) in self.programs.drain() {
            device.delete_program(entry.gpu);
        }
        self.lookup.clear();
        self.fallback = None;
    }

    fn build(
        &mut self,
        device: &mut dyn GpuDevice,
        name: &'static str,
        key: Option<ProgramKey>,
        sources: &ShaderSources,
    ) -> Result<ProgramEntry, ShaderDiagnostics> {
        self.compile_events += 1;

        let vs = device.create_shader(ShaderStage::Vertex, &sources.vertex);
        let fs = device.create_shader(ShaderStage::Fragment, &sources.fragment);
        let gpu = device.create_program(vs, fs);

        let linked = device.program_linked(gpu);
        if !linked {
            let mut diagnostics = ShaderDiagnostics {
                program: name.to_string(),
                link_log: device.program_info_log(gpu),
                ..Default::default()
            };
            if !device.shader_compiled(vs) {
                diagnostics.vertex_log = device.shader_info_log(vs);
            }
            if !device.shader_compiled(fs) {
                diagnostics.fragment_log = device.shader_info_log(fs);
            }
            log_failure(&diagnostics, sources);

            device.delete_shader(vs);
            device.delete_shader(fs);
            device.delete_program(gpu);
            return Err(diagnostics);
        }

        device.delete_shader(vs);
        device.delete_shader(fs);

        let uniforms = device.active_uniforms(gpu);
        let lights_block = device.uniform_block_index(gpu, "Lights");
        if let Some(block) = lights_block {
            device.uniform_block_binding(gpu, block, LIGHTS_BINDING_POINT);
        }

        Ok(ProgramEntry {
            key,
            name,
            gpu,
            used_times: u32::from(key.is_some()),
            uniforms,
            lights_block,
        })
    }
}

fn log_failure(diagnostics: &ShaderDiagnostics, sources: &ShaderSources) {
    let mut message = format!("Shader program '{}' failed to build\n", diagnostics.program);
    for (stage, log, source) in [
        ("vertex", &diagnostics.vertex_log, &sources.vertex),
        ("fragment", &diagnostics.fragment_log, &sources.fragment),
    ] {
        if log.is_empty() {
            continue;
        }
        message.push_str(&format!("{stage}: {}\n", log.trim_end()));
        if let Some(line) = error_line(log) {
            message.push_str(&numbered_context(source, line));
        }
    }
    if !diagnostics.link_log.is_empty() {
        message.push_str(&format!("link: {}\n", diagnostics.link_log.trim_end()));
    }
    log::error!("{message}");
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::*;
    use crate::renderer::device::HeadlessDevice;
    use crate::renderer::program::{ObjectFeatures, ProgramContext};
    use crate::resources::{Material, MaterialKind, ShaderMaterial};

    fn params(material: &Material) -> ProgramParameters {
        ProgramParameters::new(material, &ObjectFeatures::default(), &ProgramContext::default())
    }

    #[test]
    fn shared_key_compiles_once() {
        let mut device = HeadlessDevice::new(4, 4);
        let mut cache = ProgramCache::new();
        let a = Material::new(MaterialKind::basic(Vec3::X));
        let b = Material::new(MaterialKind::basic(Vec3::Y));

        let pa = cache.acquire(&mut device, &params(&a)).unwrap();
        let pb = cache.acquire(&mut device, &params(&b)).unwrap();
        assert_eq!(pa, pb);
        assert_eq!(cache.compile_events(), 1);
        assert_eq!(cache.used_times(pa), 2);
    }

    #[test]
    fn release_frees_at_zero_only_once() {
        let mut device = HeadlessDevice::new(4, 4);
        let mut cache = ProgramCache::new();
        let material = Material::new(MaterialKind::basic(Vec3::ONE));
        let id = cache.acquire(&mut device, &params(&material)).unwrap();
        let _ = cache.acquire(&mut device, &params(&material)).unwrap();

        assert!(!cache.release(&mut device, id));
        assert!(cache.release(&mut device, id));
        assert!(!cache.release(&mut device, id));
        assert!(cache.is_empty());
        assert_eq!(device.live_programs(), 0);
    }

    #[test]
    fn failed_build_reports_logs_and_is_not_cached() {
        let mut device = HeadlessDevice::new(4, 4);
        let mut cache = ProgramCache::new();
        let material = Material::new(MaterialKind::Shader(ShaderMaterial::new(
            "void main() { gl_Position = vec4(0.0); }",
            "void main() {\n#error missing semicolon\n}",
        )));

        let diagnostics = cache.acquire(&mut device, &params(&material)).unwrap_err();
        assert!(diagnostics.fragment_log.contains("#error"));
        assert!(diagnostics.vertex_log.is_empty());
        assert!(cache.is_empty());

        let fallback = cache.fallback(&mut device, Precision::Highp).unwrap();
        assert!(cache.is_fallback(fallback));
        assert!(!cache.release(&mut device, fallback));
        assert!(cache.get(fallback).is_some());
    }

    #[test]
    fn lights_block_is_bound_to_fixed_point() {
        let mut device = HeadlessDevice::new(4, 4);
        let mut cache = ProgramCache::new();
        let material = Material::new(MaterialKind::standard(Vec3::ONE));
        let ctx = ProgramContext {
            lights: crate::renderer::lights::LightCounts {
                directional: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        let p = ProgramParameters::new(&material, &ObjectFeatures::default(), &ctx);
        let id = cache.acquire(&mut device, &p).unwrap();
        assert!(cache.get(id).unwrap().lights_block.is_some());
    }
}
