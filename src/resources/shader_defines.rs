//! Shader Define Sets
//!
//! A program permutation is described by a set of `#define NAME VALUE` pairs.
//! [`ShaderDefines`] stores them as interned [`Symbol`] pairs in a vector
//! sorted by key symbol, so two sets built in a different insertion order
//! compare and hash identically.
//!
//! # Usage
//!
//! ```rust,ignore
//! use myth_forward::resources::ShaderDefines;
//!
//! let mut defines = ShaderDefines::new();
//! defines.set_flag("USE_MAP", true);
//! defines.set_value("NUM_DIR_LIGHTS", 2);
//!
//! let hash = defines.compute_hash();
//! ```

use std::collections::BTreeMap;
use std::fmt::Display;
use std::hash::{Hash, Hasher};

use crate::utils::interner::{self, Symbol};

/// A collection of shader macro definitions.
///
/// - Insertion/lookup: O(log n) binary search on the key symbol
/// - Comparison/hash: over the sorted symbol pairs, no string access
#[derive(Debug, Clone, Default)]
pub struct ShaderDefines {
    defines: Vec<(Symbol, Symbol)>,
}

impl ShaderDefines {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            defines: Vec::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            defines: Vec::with_capacity(capacity),
        }
    }

    /// Sets `key` to `value`, replacing any previous value.
    pub fn set(&mut self, key: &str, value: &str) {
        self.set_symbol(interner::intern(key), interner::intern(value));
    }

    /// Defines `key` as `1` when `enabled`, removes it otherwise.
    pub fn set_flag(&mut self, key: &str, enabled: bool) {
        if enabled {
            self.set(key, "1");
        } else {
            self.remove(key);
        }
    }

    /// Sets `key` to the display form of `value`.
    pub fn set_value(&mut self, key: &str, value: impl Display) {
        self.set(key, &value.to_string());
    }

    #[inline]
    pub fn set_symbol(&mut self, key: Symbol, value: Symbol) {
        match self.defines.binary_search_by_key(&key, |&(k, _)| k) {
            Ok(idx) => self.defines[idx].1 = value,
            Err(idx) => self.defines.insert(idx, (key, value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> bool {
        let Some(key_sym) = interner::get(key) else {
            return false;
        };
        if let Ok(idx) = self.defines.binary_search_by_key(&key_sym, |&(k, _)| k) {
            self.defines.remove(idx);
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        interner::get(key).is_some_and(|key_sym| {
            self.defines
                .binary_search_by_key(&key_sym, |&(k, _)| k)
                .is_ok()
        })
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&'static str> {
        let key_sym = interner::get(key)?;
        self.defines
            .binary_search_by_key(&key_sym, |&(k, _)| k)
            .ok()
            .map(|idx| interner::resolve(self.defines[idx].1))
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.defines.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.defines.is_empty()
    }

    /// Iterates the resolved `(name, value)` pairs in symbol order.
    pub fn iter_strings(&self) -> impl Iterator<Item = (&'static str, &'static str)> + '_ {
        self.defines
            .iter()
            .map(|&(k, v)| (interner::resolve(k), interner::resolve(v)))
    }

    /// Name-ordered map, used for template rendering and the `#define`
    /// prelude so generated sources are byte-stable.
    #[must_use]
    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.iter_strings()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    /// Renders the set as `#define` lines, sorted by name.
    #[must_use]
    pub fn to_prelude(&self) -> String {
        let mut out = String::new();
        for (name, value) in self.to_map() {
            out.push_str("#define ");
            out.push_str(&name);
            out.push(' ');
            out.push_str(&value);
            out.push('\n');
        }
        out
    }

    /// Values from `other` override values in `self`.
    pub fn merge(&mut self, other: &ShaderDefines) {
        for &(key, value) in &other.defines {
            self.set_symbol(key, value);
        }
    }

    #[must_use]
    pub fn compute_hash(&self) -> u64 {
        use std::hash::BuildHasher;

        rustc_hash::FxBuildHasher.hash_one(self)
    }
}

impl Hash for ShaderDefines {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.defines.hash(state);
    }
}

impl PartialEq for ShaderDefines {
    fn eq(&self, other: &Self) -> bool {
        self.defines == other.defines
    }
}

impl Eq for ShaderDefines {}

impl From<&[(&str, &str)]> for ShaderDefines {
    fn from(defines: &[(&str, &str)]) -> Self {
        let mut result = Self::with_capacity(defines.len());
        for (k, v) in defines {
            result.set(k, v);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_flag_adds_and_removes() {
        let mut defines = ShaderDefines::new();
        defines.set_flag("USE_MAP", true);
        defines.set_flag("USE_NORMALMAP", true);
        assert_eq!(defines.get("USE_MAP"), Some("1"));

        defines.set_flag("USE_MAP", false);
        assert!(!defines.contains("USE_MAP"));
        assert!(defines.contains("USE_NORMALMAP"));
    }

    #[test]
    fn test_merge_overrides() {
        let mut d1 = ShaderDefines::new();
        d1.set("A_DEF", "1");
        d1.set("B_DEF", "2");

        let mut d2 = ShaderDefines::new();
        d2.set("B_DEF", "3");
        d2.set("C_DEF", "4");

        d1.merge(&d2);

        assert_eq!(d1.get("A_DEF"), Some("1"));
        assert_eq!(d1.get("B_DEF"), Some("3"));
        assert_eq!(d1.get("C_DEF"), Some("4"));
    }

    #[test]
    fn test_hash_ignores_insertion_order() {
        let mut d1 = ShaderDefines::new();
        d1.set("X_DEF", "1");
        d1.set_value("Y_DEF", 2);

        let mut d2 = ShaderDefines::new();
        d2.set_value("Y_DEF", 2);
        d2.set("X_DEF", "1");

        assert_eq!(d1, d2);
        assert_eq!(d1.compute_hash(), d2.compute_hash());
    }

    #[test]
    fn test_prelude_sorted_by_name() {
        let mut defines = ShaderDefines::new();
        defines.set_value("NUM_SPOT_LIGHTS", 1);
        defines.set_flag("USE_FOG", true);
        defines.set_value("NUM_DIR_LIGHTS", 2);

        assert_eq!(
            defines.to_prelude(),
            "#define NUM_DIR_LIGHTS 2\n#define NUM_SPOT_LIGHTS 1\n#define USE_FOG 1\n"
        );
    }
}
