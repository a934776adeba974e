//! Dataset loading and preprocessing.
//!
//! - JSON dataset ingest + shape validation (`dataset`)
//! - leave-out mutations (NPI zeroing, region masking, reopening masks)

pub mod dataset;

pub use dataset::*;
