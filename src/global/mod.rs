//! Distributed dense arrays: distribution model, element types and registry.

pub mod distribution;
pub mod element;
pub mod registry;

pub use distribution::{Distribution, Patch, block_range};
pub use registry::{GaHandle, GlobalArrays, LocalView};
