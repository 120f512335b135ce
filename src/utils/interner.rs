//! Global String Interner
//!
//! Turns define names and values into integer [`Symbol`]s so that define sets
//! can be compared and hashed without touching string data. This is the
//! backing store for [`ShaderDefines`](crate::resources::ShaderDefines).

use std::sync::LazyLock;

use lasso::{Spur, ThreadedRodeo};

static INTERNER: LazyLock<ThreadedRodeo> = LazyLock::new(ThreadedRodeo::new);

/// Compact integer handle for an interned string.
pub type Symbol = Spur;

/// Interns `s`, returning the existing symbol when already present.
#[inline]
pub fn intern(s: &str) -> Symbol {
    INTERNER.get_or_intern(s)
}

/// Looks up `s` without allocating.
#[inline]
pub fn get(s: &str) -> Option<Symbol> {
    INTERNER.get(s)
}

/// Resolves a symbol back to its string.
///
/// # Panics
/// Panics if the symbol did not come from this interner.
#[inline]
pub fn resolve(sym: Symbol) -> &'static str {
    INTERNER.resolve(&sym)
}

/// Pre-interns the define names every program key produces.
///
/// Called once when a renderer is constructed so the hot path only performs
/// lookups.
pub fn preload_common_defines() {
    let common = [
        // Material maps
        "USE_MAP",
        "USE_ALPHAMAP",
        "USE_AOMAP",
        "USE_LIGHTMAP",
        "USE_EMISSIVEMAP",
        "USE_BUMPMAP",
        "USE_NORMALMAP",
        "USE_DISPLACEMENTMAP",
        "USE_SPECULARMAP",
        "USE_ROUGHNESSMAP",
        "USE_METALNESSMAP",
        "USE_ENVMAP",
        "USE_CLEARCOAT",
        "USE_SHEEN",
        "USE_TRANSMISSION",
        "USE_IRIDESCENCE",
        // Object features
        "USE_SKINNING",
        "USE_MORPHTARGETS",
        "USE_INSTANCING",
        "USE_INSTANCING_COLOR",
        "USE_COLOR",
        // Context
        "USE_FOG",
        "FOG_EXP2",
        "USE_SHADOWMAP",
        "NUM_DIR_LIGHTS",
        "NUM_POINT_LIGHTS",
        "NUM_SPOT_LIGHTS",
        "NUM_HEMI_LIGHTS",
        "NUM_CLIPPING_PLANES",
        "TONE_MAPPING",
        // Common values
        "0",
        "1",
    ];

    for name in common {
        intern(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_and_resolve() {
        let s1 = intern("USE_FOG");
        let s2 = intern("USE_FOG");
        let s3 = intern("USE_MAP");

        assert_eq!(s1, s2);
        assert_ne!(s1, s3);

        assert_eq!(resolve(s1), "USE_FOG");
        assert_eq!(resolve(s3), "USE_MAP");
    }

    #[test]
    fn test_get_does_not_intern() {
        let _ = intern("EXISTING_DEFINE");

        assert!(get("EXISTING_DEFINE").is_some());
        assert!(get("NEVER_INTERNED_DEFINE").is_none());
    }
}
