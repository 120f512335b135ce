//! Utility Module
//!
//! - [`interner`]: String interning for define names and values
//!
//! ```rust,ignore
//! use myth_forward::utils::interner;
//!
//! let sym1 = interner::intern("USE_NORMALMAP");
//! let sym2 = interner::intern("USE_NORMALMAP");
//! assert_eq!(sym1, sym2);
//! ```

pub mod interner;

pub use interner::Symbol;
