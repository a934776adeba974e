//! Input/output helpers.
//!
//! - output path planning (`paths`)
//! - full-trace archive read/write (`archive`)
//! - summary and per-region result JSON (`summary`)
//! - line-oriented NPI-effect trace files (`cm_trace`)

pub mod archive;
pub mod cm_trace;
pub mod paths;
pub mod summary;

pub use archive::*;
pub use cm_trace::*;
pub use paths::*;
pub use summary::*;
