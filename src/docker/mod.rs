//! Docker image archive unpacking.
//!
//! This module reads `docker save` style archives, locates the nested
//! per-layer archives inside them and unpacks each one into its own
//! directory.

/// Image archive reading and layer member discovery
pub mod archive;
/// Image-level orchestration of a full unpack run
pub mod image;
/// Unpacking of a single nested layer archive
pub mod layer;
/// Per-layer outcome records and the run summary
pub mod report;

pub use archive::*;
pub use image::*;
pub use layer::*;
pub use report::*;
