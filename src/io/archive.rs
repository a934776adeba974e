//! Read/write the full-trace archive.
//!
//! The archive is the "portable" representation of a combined run: dimension
//! lengths, named coordinate axes (region / day / NPI), and the posterior plus
//! optional predictive variable groups, each variable stored with its dims,
//! shape, and flat values. The path keeps the `.netcdf` suffix of the original
//! drivers; the content is a self-describing JSON document with the same
//! round-trip guarantee (coordinates are recoverable from the archive alone).

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::reduce::{CombinedRun, Coords};
use crate::sampler::{SampleArray, Trace};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveVar {
    pub dims: Vec<String>,
    pub shape: Vec<usize>,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveCoords {
    #[serde(rename = "R")]
    pub regions: Vec<String>,
    #[serde(rename = "D")]
    pub days: Vec<String>,
    #[serde(rename = "CM")]
    pub cm_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleStats {
    pub diverging: Vec<bool>,
}

/// On-disk archive schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceArchive {
    pub tool: String,
    pub model_name: String,
    pub chains: usize,
    pub draws: usize,
    pub dims: IndexMap<String, usize>,
    pub coords: ArchiveCoords,
    pub posterior: IndexMap<String, ArchiveVar>,
    pub sample_stats: SampleStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prior_predictive: Option<IndexMap<String, ArchiveVar>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub posterior_predictive: Option<IndexMap<String, ArchiveVar>>,
}

fn to_vars(group: &IndexMap<String, SampleArray>) -> IndexMap<String, ArchiveVar> {
    group
        .iter()
        .map(|(name, arr)| {
            (
                name.clone(),
                ArchiveVar {
                    dims: arr.dims.clone(),
                    shape: arr.shape.clone(),
                    values: arr.values.clone(),
                },
            )
        })
        .collect()
}

fn from_vars(group: IndexMap<String, ArchiveVar>) -> IndexMap<String, SampleArray> {
    group
        .into_iter()
        .map(|(name, var)| (name, SampleArray::new(var.dims, var.shape, var.values)))
        .collect()
}

impl TraceArchive {
    pub fn from_run(run: &CombinedRun) -> TraceArchive {
        let mut dims = IndexMap::new();
        dims.insert("chain".to_string(), run.posterior.chains);
        dims.insert("draw".to_string(), run.posterior.draws);
        dims.insert("R".to_string(), run.coords.regions.len());
        dims.insert("D".to_string(), run.coords.days.len());
        dims.insert("CM".to_string(), run.coords.cm_names.len());
        TraceArchive {
            tool: "epi".to_string(),
            model_name: run.model_name.clone(),
            chains: run.posterior.chains,
            draws: run.posterior.draws,
            dims,
            coords: ArchiveCoords {
                regions: run.coords.regions.clone(),
                days: run.coords.days.clone(),
                cm_names: run.coords.cm_names.clone(),
            },
            posterior: to_vars(&run.posterior.vars),
            sample_stats: SampleStats {
                diverging: run.posterior.diverging.clone(),
            },
            prior_predictive: run.prior_predictive.as_ref().map(to_vars),
            posterior_predictive: run.posterior_predictive.as_ref().map(to_vars),
        }
    }

    pub fn into_run(self) -> CombinedRun {
        CombinedRun {
            model_name: self.model_name,
            coords: Coords {
                regions: self.coords.regions,
                days: self.coords.days,
                cm_names: self.coords.cm_names,
            },
            posterior: Trace {
                chains: self.chains,
                draws: self.draws,
                vars: from_vars(self.posterior),
                diverging: self.sample_stats.diverging,
            },
            prior_predictive: self.prior_predictive.map(from_vars),
            posterior_predictive: self.posterior_predictive.map(from_vars),
        }
    }
}

/// Write the combined run to the full-output path.
pub fn write_archive(path: &Path, run: &CombinedRun) -> Result<(), AppError> {
    let file = File::create(path)
        .map_err(|e| AppError::io(format!("Failed to create archive '{}': {e}", path.display())))?;
    serde_json::to_writer(BufWriter::new(file), &TraceArchive::from_run(run))
        .map_err(|e| AppError::io(format!("Failed to write archive '{}': {e}", path.display())))?;
    Ok(())
}

/// Read a combined run back from an archive.
pub fn read_archive(path: &Path) -> Result<CombinedRun, AppError> {
    let file = File::open(path)
        .map_err(|e| AppError::io(format!("Failed to open archive '{}': {e}", path.display())))?;
    let archive: TraceArchive = serde_json::from_reader(BufReader::new(file))
        .map_err(|e| AppError::io(format!("Invalid archive '{}': {e}", path.display())))?;
    Ok(archive.into_run())
}
