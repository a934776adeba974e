//! Shared domain types.
//!
//! These types are intentionally kept lightweight and serializable so they can be:
//!
//! - used in-memory while a run executes
//! - embedded in the JSON summary record
//! - reloaded later for cross-run comparisons

use std::path::PathBuf;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// A prior distribution descriptor, as passed into model construction.
///
/// The `type` discriminator matches the wire form used in build dictionaries:
/// `{"type": "fixed", "value": 1.0}` and so on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PriorSpec {
    Fixed { value: f64 },
    Normal { mean: f64, scale: f64 },
    TruncNormal { mean: f64 },
}

/// One value in a model build dictionary.
///
/// Free-form `--model_build_arg_<name>=<value>` extras arrive as strings and are
/// coerced to integers or floats where parseable; prior descriptors come from
/// the typed CLI layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BuildValue {
    Int(i64),
    Float(f64),
    Prior(PriorSpec),
    Str(String),
}

impl BuildValue {
    /// Parse a raw extras token value: integer first, then float, else string.
    pub fn parse(raw: &str) -> BuildValue {
        if let Ok(i) = raw.parse::<i64>() {
            return BuildValue::Int(i);
        }
        if let Ok(f) = raw.parse::<f64>() {
            return BuildValue::Float(f);
        }
        BuildValue::Str(raw.to_string())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            BuildValue::Int(i) => Some(*i as f64),
            BuildValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            BuildValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_prior(&self) -> Option<&PriorSpec> {
        match self {
            BuildValue::Prior(p) => Some(p),
            _ => None,
        }
    }
}

/// The model build dictionary: an ordered mapping passed once, by value, into
/// model construction. Later merge layers overwrite identically named keys.
pub type ModelBuildDict = IndexMap<String, BuildValue>;

/// Which driver variant this invocation runs.
///
/// Each variant corresponds to one of the original driver scripts; they share
/// the same pipeline and differ in path layout, dataset mutation, and extra
/// persisted artifacts.
#[derive(Debug, Clone, PartialEq)]
pub enum RunVariant {
    /// Plain run: `runs/...` output layout, no dataset mutation.
    Plain,
    /// Sensitivity-analysis run with CLI-configurable priors.
    Custom,
    /// Zero out the named NPI columns before model construction.
    NpiLeaveout { npis: Vec<usize> },
    /// Mask one region from training and persist its held-out slice.
    RegionHoldout { region: String },
}

impl RunVariant {
    /// Sensitivity-analysis variants nest output under
    /// `sensitivity_analysis/<config>/<tag>/`; the plain run uses `runs/`.
    pub fn is_sensitivity(&self) -> bool {
        !matches!(self, RunVariant::Plain)
    }
}

/// Fully resolved per-run configuration. Created once from CLI input,
/// immutable thereafter.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub data_path: PathBuf,
    pub last_day: Option<String>,
    pub output_base: Option<String>,
    pub no_log: bool,
    pub force_progress: bool,
    pub target_accept: f64,
    pub model_config_name: String,
    pub basic_r_mean: f64,
    pub max_r_day_prior: String,
    pub max_r_day: f64,
    pub max_r_day_scale: f64,
    pub exp_tag: String,
    pub model_type: String,
    pub n_samples: usize,
    pub n_chains: usize,
    pub seed: u64,
    /// Free-form `--model_build_arg_*` overrides, in argv order.
    pub extras: ModelBuildDict,
}

impl RunConfig {
    /// Resolve the seasonality peak-day prior descriptor from the CLI fields.
    ///
    /// Any selector other than `fixed` or `normal` is a configuration error,
    /// raised before model construction begins.
    pub fn max_r_day_prior_spec(&self) -> Result<PriorSpec, AppError> {
        match self.max_r_day_prior.as_str() {
            "fixed" => Ok(PriorSpec::Fixed {
                value: self.max_r_day,
            }),
            "normal" => Ok(PriorSpec::Normal {
                mean: 1.0,
                scale: self.max_r_day_scale,
            }),
            other => Err(AppError::config(format!(
                "Invalid --max_R_day_prior '{other}' (expected 'fixed' or 'normal')"
            ))),
        }
    }
}

/// Percentile summary of the potential-scale-reduction diagnostic across all
/// monitored variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RhatSummary {
    pub med: f64,
    pub upper: f64,
    pub lower: f64,
    pub max: f64,
    pub min: f64,
}

/// The flattened summary record written once per invocation.
///
/// `samples` holds selected posterior variables reshaped to
/// `(chains * draws, entity dims...)` nested arrays; it is flattened into the
/// top-level JSON object alongside the named fields.
#[derive(Debug, Clone, Serialize)]
pub struct SummaryRecord {
    pub model_name: String,
    pub model_config_name: String,
    pub divergences: usize,
    pub time_per_sample: f64,
    pub total_runtime: f64,
    pub rhat: Option<RhatSummary>,
    pub data_path: String,
    pub cm_names: Vec<String>,
    pub exp_tag: String,
    pub exp_config: ModelBuildDict,
    pub model_kwargs: ModelBuildDict,
    #[serde(flatten)]
    pub samples: IndexMap<String, serde_json::Value>,
}
