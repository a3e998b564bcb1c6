//! Derivation model for the kiln build store.
//!
//! A derivation describes how to build a package: its sources, dependencies,
//! build instructions, and outputs. Derivations are content-addressed,
//! meaning their identity is determined by their contents, not by a name or
//! version number.

mod derivation;
mod hash;
mod output;

pub use derivation::*;
pub use hash::*;
pub use output::*;
