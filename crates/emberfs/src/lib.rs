#![forbid(unsafe_code)]
//! emberfs public API facade.
//!
//! Re-exports the engine from `ember-core` through a stable external
//! interface. This is the crate downstream consumers depend on.

pub use ember_core::*;
