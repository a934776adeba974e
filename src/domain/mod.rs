//! Domain types used throughout the run driver.
//!
//! This module defines:
//!
//! - the per-run configuration (`RunConfig`, `RunVariant`)
//! - prior descriptors and build-dictionary values (`PriorSpec`, `BuildValue`)
//! - reduced outputs (`RhatSummary`, `SummaryRecord`)

pub mod types;

pub use types::*;
