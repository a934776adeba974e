//! Model build dictionary assembly.
//!
//! The build dictionary is layered from three sources, in order of increasing
//! precedence:
//!
//! 1. default epidemiological priors ([`EpiParams::model_build_dict`])
//! 2. CLI-derived overrides (seasonality prior descriptor, basic-R mean)
//! 3. free-form `--model_build_arg_*` extras
//!
//! Later layers overwrite identically named keys. No validation against the
//! model's accepted parameter set happens here; unknown keys surface when
//! model construction rejects them.

use crate::domain::{BuildValue, ModelBuildDict, PriorSpec, RunConfig};
use crate::error::AppError;

/// Provider of default epidemiological priors.
///
/// Numeric defaults follow the Brauner et al. dataset conventions: basic R
/// mean 3.28, generation interval mean 5.06 days.
#[derive(Debug, Clone, Default)]
pub struct EpiParams;

impl EpiParams {
    pub fn model_build_dict(&self) -> ModelBuildDict {
        let mut bd = ModelBuildDict::new();
        bd.insert("R_prior_mean".to_string(), BuildValue::Float(3.28));
        bd.insert("R_noise_scale".to_string(), BuildValue::Float(0.5));
        bd.insert("cm_prior_scale".to_string(), BuildValue::Float(0.2));
        bd.insert("growth_noise_scale".to_string(), BuildValue::Float(0.2));
        bd.insert(
            "generation_interval_mean".to_string(),
            BuildValue::Float(5.06),
        );
        bd.insert(
            "seasonality_prior_scale".to_string(),
            BuildValue::Float(0.3),
        );
        bd.insert("seasonality_peak_index".to_string(), BuildValue::Int(0));
        bd
    }
}

/// Merge build-dictionary layers; later layers win on key collisions.
pub fn merge_layers(layers: &[&ModelBuildDict]) -> ModelBuildDict {
    let mut bd = ModelBuildDict::new();
    for layer in layers {
        for (k, v) in layer.iter() {
            bd.insert(k.clone(), v.clone());
        }
    }
    bd
}

/// Assemble the full build dictionary for a run.
///
/// `with_cli_priors` is false for the plain `run` driver, which takes no
/// prior-shaping flags and layers only defaults + extras.
pub fn assemble_build_dict(
    cfg: &RunConfig,
    with_cli_priors: bool,
) -> Result<ModelBuildDict, AppError> {
    let defaults = EpiParams.model_build_dict();
    let bd = if with_cli_priors {
        let mut cli = ModelBuildDict::new();
        cli.insert(
            "max_R_day_prior".to_string(),
            BuildValue::Prior(cfg.max_r_day_prior_spec()?),
        );
        // The trunc-normal descriptor is carried for the output record; the
        // plain mean is what model construction reads.
        cli.insert(
            "basic_R_prior".to_string(),
            BuildValue::Prior(PriorSpec::TruncNormal {
                mean: cfg.basic_r_mean,
            }),
        );
        cli.insert(
            "R_prior_mean".to_string(),
            BuildValue::Float(cfg.basic_r_mean),
        );
        merge_layers(&[&defaults, &cli, &cfg.extras])
    } else {
        merge_layers(&[&defaults, &cfg.extras])
    };
    Ok(bd)
}

/// Render the build dictionary the way the drivers print it: `BD = {...}`.
pub fn format_build_dict(bd: &ModelBuildDict) -> String {
    match serde_json::to_string(bd) {
        Ok(s) => s,
        Err(_) => format!("{bd:?}"),
    }
}
