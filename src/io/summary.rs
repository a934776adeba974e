//! Summary and per-region result persistence.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use crate::domain::SummaryRecord;
use crate::error::AppError;
use crate::reduce::RegionResults;

/// Write the summary record as pretty-printed UTF-8 JSON.
pub fn write_summary_json(path: &Path, record: &SummaryRecord) -> Result<(), AppError> {
    let file = File::create(path)
        .map_err(|e| AppError::io(format!("Failed to create summary '{}': {e}", path.display())))?;
    serde_json::to_writer_pretty(BufWriter::new(file), record)
        .map_err(|e| AppError::io(format!("Failed to write summary '{}': {e}", path.display())))?;
    Ok(())
}

/// Write the held-out region's results object.
pub fn write_region_results(path: &Path, results: &RegionResults) -> Result<(), AppError> {
    let file = File::create(path).map_err(|e| {
        AppError::io(format!(
            "Failed to create region results '{}': {e}",
            path.display()
        ))
    })?;
    serde_json::to_writer_pretty(BufWriter::new(file), results).map_err(|e| {
        AppError::io(format!(
            "Failed to write region results '{}': {e}",
            path.display()
        ))
    })?;
    Ok(())
}
