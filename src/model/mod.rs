//! Epidemiological growth models over NPI activation data.
//!
//! A [`BuiltModel`] is the consumable form of one registered model variant:
//! a named parameter-vector layout plus a log-posterior over it. The
//! likelihood links daily log-growth of observed counts to the instantaneous
//! reproduction number implied by each region's basic R, the active NPIs'
//! multiplicative effects, and (for seasonal variants) a cosine seasonality
//! term:
//!
//! `R_t(r, d) = RegionR_r * exp(-sum_i alpha_i * active(r, i, d)) * s(d)`
//! `g_pred(r, d) = (R_t - 1) / generation_interval_mean`
//!
//! Observed growth is `ln((y_{d+1}+1)/(y_d+1))`; masked (NaN) observations
//! drop out of the likelihood.

use chrono::{Datelike, NaiveDate};
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::data::Dataset;
use crate::domain::{BuildValue, ModelBuildDict, PriorSpec};
use crate::error::AppError;

pub mod build;

pub use build::{EpiParams, assemble_build_dict, format_build_dict, merge_layers};

/// Registered model variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelVariant {
    Default,
    CasesOnly,
    DeathsOnly,
    Seasonal,
}

impl ModelVariant {
    /// Resolve a `--model_type` string to a registered variant.
    pub fn from_str(s: &str) -> Result<ModelVariant, AppError> {
        match s {
            "default" => Ok(ModelVariant::Default),
            "cases_only" => Ok(ModelVariant::CasesOnly),
            "deaths_only" => Ok(ModelVariant::DeathsOnly),
            "seasonal" => Ok(ModelVariant::Seasonal),
            other => Err(AppError::config(format!(
                "Unknown model type '{other}' (registered: default, cases_only, deaths_only, seasonal)"
            ))),
        }
    }

    /// Class-style name recorded in the summary.
    pub fn model_name(self) -> &'static str {
        match self {
            ModelVariant::Default => "DefaultModel",
            ModelVariant::CasesOnly => "CasesOnlyModel",
            ModelVariant::DeathsOnly => "DeathsOnlyModel",
            ModelVariant::Seasonal => "SeasonalModel",
        }
    }

    pub fn uses_cases(self) -> bool {
        !matches!(self, ModelVariant::DeathsOnly)
    }

    pub fn uses_deaths(self) -> bool {
        matches!(self, ModelVariant::Default | ModelVariant::DeathsOnly)
    }

    pub fn is_seasonal(self) -> bool {
        matches!(self, ModelVariant::Seasonal)
    }
}

/// One named block of the flat parameter vector, with its entity dims.
#[derive(Debug, Clone)]
pub struct ParamBlock {
    pub name: String,
    /// Entity axes beyond (chain, draw), e.g. `[("CM", 3)]`.
    pub dims: Vec<(String, usize)>,
    pub offset: usize,
    pub size: usize,
}

/// One growth observation: region, day index, observed log-growth.
#[derive(Debug, Clone, Copy)]
struct GrowthObs {
    region: usize,
    day: usize,
    growth: f64,
}

/// Resolved day prior for the seasonal peak.
#[derive(Debug, Clone)]
enum MaxRDay {
    Fixed(f64),
    Free { mean: f64, scale: f64 },
}

/// Keys model construction accepts; anything else is a build rejection.
const RECOGNIZED_KEYS: &[&str] = &[
    "R_prior_mean",
    "R_noise_scale",
    "cm_prior_scale",
    "growth_noise_scale",
    "generation_interval_mean",
    "seasonality_prior_scale",
    "seasonality_peak_index",
    "max_R_day_prior",
    "basic_R_prior",
];

/// A constructed model: parameter layout, resolved priors, and the data the
/// likelihood runs over. Immutable once built.
#[derive(Debug)]
pub struct BuiltModel {
    pub variant: ModelVariant,
    pub blocks: Vec<ParamBlock>,
    pub dim: usize,
    pub n_regions: usize,
    pub n_cms: usize,
    pub n_days: usize,

    r_prior_mean: f64,
    r_noise_scale: f64,
    cm_prior_scale: f64,
    growth_noise_scale: f64,
    gi_mean: f64,
    seasonality_prior_scale: f64,
    seasonality_peak_index: i64,
    max_r_day: MaxRDay,

    active_cms: Vec<f64>,
    case_obs: Vec<GrowthObs>,
    death_obs: Vec<GrowthObs>,
    /// First finite case count per region, seed for predictive simulation.
    case_seeds: Vec<f64>,
    day_of_year: Vec<f64>,
}

/// Construct a model from a dataset and an assembled build dictionary.
///
/// Unknown or ill-typed keys are rejected here, not pre-validated upstream.
pub fn build_model(
    variant: ModelVariant,
    data: &Dataset,
    bd: &ModelBuildDict,
) -> Result<BuiltModel, AppError> {
    for key in bd.keys() {
        if !RECOGNIZED_KEYS.contains(&key.as_str()) {
            return Err(AppError::model(format!(
                "Model build rejected unknown key '{key}'"
            )));
        }
    }
    let float_key = |key: &str, default: f64| -> Result<f64, AppError> {
        match bd.get(key) {
            None => Ok(default),
            Some(v) => v.as_f64().ok_or_else(|| {
                AppError::model(format!("Model build key '{key}' must be numeric, got {v:?}"))
            }),
        }
    };

    let max_r_day = match bd.get("max_R_day_prior") {
        None => MaxRDay::Fixed(1.0),
        Some(BuildValue::Prior(PriorSpec::Fixed { value })) => MaxRDay::Fixed(*value),
        Some(BuildValue::Prior(PriorSpec::Normal { mean, scale })) => MaxRDay::Free {
            mean: *mean,
            scale: *scale,
        },
        Some(v) => {
            return Err(AppError::model(format!(
                "Model build key 'max_R_day_prior' must be a fixed/normal prior, got {v:?}"
            )));
        }
    };

    let seasonality_peak_index = match bd.get("seasonality_peak_index") {
        None => 0,
        Some(v) => v.as_i64().ok_or_else(|| {
            AppError::model(format!(
                "Model build key 'seasonality_peak_index' must be an integer, got {v:?}"
            ))
        })?,
    };

    let mut blocks = Vec::new();
    let mut offset = 0usize;
    let mut push = |name: &str, dims: Vec<(String, usize)>, blocks: &mut Vec<ParamBlock>| {
        let size = dims.iter().map(|(_, n)| n).product::<usize>().max(1);
        blocks.push(ParamBlock {
            name: name.to_string(),
            dims,
            offset,
            size,
        });
        offset += size;
    };
    push(
        "CM_Alpha",
        vec![("CM".to_string(), data.n_cms())],
        &mut blocks,
    );
    push(
        "RegionR",
        vec![("R".to_string(), data.n_regions())],
        &mut blocks,
    );
    push("GrowthNoiseScale", vec![], &mut blocks);
    if variant.is_seasonal() {
        push("seasonality_beta1", vec![], &mut blocks);
        if matches!(max_r_day, MaxRDay::Free { .. }) {
            push("seasonality_max_R_day", vec![], &mut blocks);
        }
    }

    let case_obs = if variant.uses_cases() {
        growth_observations(data, |r, d| data.cases(r, d))
    } else {
        Vec::new()
    };
    let death_obs = if variant.uses_deaths() {
        growth_observations(data, |r, d| data.deaths(r, d))
    } else {
        Vec::new()
    };

    let case_seeds = (0..data.n_regions())
        .map(|r| {
            (0..data.n_days())
                .map(|d| data.cases(r, d))
                .find(|v| v.is_finite() && *v >= 0.0)
                .unwrap_or(1.0)
                .max(1.0)
        })
        .collect();

    let day_of_year = data
        .days
        .iter()
        .enumerate()
        .map(|(i, label)| match NaiveDate::parse_from_str(label, "%Y-%m-%d") {
            Ok(date) => date.ordinal() as f64,
            Err(_) => i as f64,
        })
        .collect();

    Ok(BuiltModel {
        variant,
        blocks,
        dim: offset,
        n_regions: data.n_regions(),
        n_cms: data.n_cms(),
        n_days: data.n_days(),
        r_prior_mean: float_key("R_prior_mean", 3.28)?,
        r_noise_scale: float_key("R_noise_scale", 0.5)?,
        cm_prior_scale: float_key("cm_prior_scale", 0.2)?,
        growth_noise_scale: float_key("growth_noise_scale", 0.2)?,
        gi_mean: float_key("generation_interval_mean", 5.06)?,
        seasonality_prior_scale: float_key("seasonality_prior_scale", 0.3)?,
        seasonality_peak_index,
        max_r_day,
        active_cms: data.active_cms.clone(),
        case_obs,
        death_obs,
        case_seeds,
        day_of_year,
    })
}

fn growth_observations(data: &Dataset, value: impl Fn(usize, usize) -> f64) -> Vec<GrowthObs> {
    let mut obs = Vec::new();
    for r in 0..data.n_regions() {
        for d in 0..data.n_days().saturating_sub(1) {
            let y0 = value(r, d);
            let y1 = value(r, d + 1);
            if y0.is_finite() && y1.is_finite() && y0 >= 0.0 && y1 >= 0.0 {
                obs.push(GrowthObs {
                    region: r,
                    day: d,
                    growth: ((y1 + 1.0) / (y0 + 1.0)).ln(),
                });
            }
        }
    }
    obs
}

impl BuiltModel {
    pub fn block(&self, name: &str) -> Option<&ParamBlock> {
        self.blocks.iter().find(|b| b.name == name)
    }

    /// Number of growth observations entering the likelihood.
    pub fn n_observations(&self) -> usize {
        self.case_obs.len() + self.death_obs.len()
    }

    fn seasonal_multiplier(&self, day: usize, beta1: f64, peak_day: f64) -> f64 {
        let doy = self.day_of_year[day] + self.seasonality_peak_index as f64;
        (beta1 * (std::f64::consts::TAU * (doy - peak_day) / 365.0).cos()).exp()
    }

    fn seasonal_params(&self, theta: &[f64]) -> (f64, f64) {
        if !self.variant.is_seasonal() {
            return (0.0, 1.0);
        }
        let beta1 = self
            .block("seasonality_beta1")
            .map(|b| theta[b.offset])
            .unwrap_or(0.0);
        let peak = match (&self.max_r_day, self.block("seasonality_max_R_day")) {
            (_, Some(b)) => theta[b.offset],
            (MaxRDay::Fixed(v), None) => *v,
            (MaxRDay::Free { mean, .. }, None) => *mean,
        };
        (beta1, peak)
    }

    fn rt(&self, theta: &[f64], region: usize, day: usize, beta1: f64, peak: f64) -> f64 {
        let alpha_off = self.blocks[0].offset;
        let r_off = self.blocks[1].offset;
        let mut effect = 0.0;
        for i in 0..self.n_cms {
            effect +=
                theta[alpha_off + i] * self.active_cms[(region * self.n_cms + i) * self.n_days + day];
        }
        let seasonal = if self.variant.is_seasonal() {
            self.seasonal_multiplier(day, beta1, peak)
        } else {
            1.0
        };
        theta[r_off + region] * (-effect).exp() * seasonal
    }

    fn predicted_growth(&self, rt: f64) -> f64 {
        (rt - 1.0) / self.gi_mean
    }

    /// Unnormalized log-posterior. Returns `-inf` for out-of-support points
    /// and NaN only on numerical blowup (flagged as a divergence upstream).
    pub fn log_posterior(&self, theta: &[f64]) -> f64 {
        let mut lp = 0.0;
        let alpha = &self.blocks[0];
        let region_r = &self.blocks[1];
        let Some(sigma_block) = self.block("GrowthNoiseScale") else {
            return f64::NEG_INFINITY;
        };
        let sigma = theta[sigma_block.offset];
        if !(sigma > 0.0) {
            return f64::NEG_INFINITY;
        }

        for i in 0..alpha.size {
            let z = theta[alpha.offset + i] / self.cm_prior_scale;
            lp += -0.5 * z * z;
        }
        for r in 0..region_r.size {
            let value = theta[region_r.offset + r];
            if value <= 0.0 {
                return f64::NEG_INFINITY;
            }
            let z = (value - self.r_prior_mean) / self.r_noise_scale;
            lp += -0.5 * z * z;
        }
        // Half-normal on the growth noise scale.
        let zs = sigma / self.growth_noise_scale;
        lp += -0.5 * zs * zs;

        let (beta1, peak) = self.seasonal_params(theta);
        if self.variant.is_seasonal() {
            let zb = beta1 / self.seasonality_prior_scale;
            lp += -0.5 * zb * zb;
            if let (MaxRDay::Free { mean, scale }, Some(_)) =
                (&self.max_r_day, self.block("seasonality_max_R_day"))
            {
                let zp = (peak - mean) / scale;
                lp += -0.5 * zp * zp;
            }
        }

        let ln_sigma = sigma.ln();
        for obs in self.case_obs.iter().chain(self.death_obs.iter()) {
            let rt = self.rt(theta, obs.region, obs.day, beta1, peak);
            let z = (obs.growth - self.predicted_growth(rt)) / sigma;
            lp += -0.5 * z * z - ln_sigma;
        }
        lp
    }

    /// Initial point for a chain: prior means with a small jitter.
    pub fn initial_point(&self, rng: &mut impl Rng) -> Vec<f64> {
        let mut theta = vec![0.0; self.dim];
        for block in &self.blocks {
            for k in 0..block.size {
                let base = match block.name.as_str() {
                    "RegionR" => self.r_prior_mean,
                    "GrowthNoiseScale" => self.growth_noise_scale,
                    "seasonality_max_R_day" => match &self.max_r_day {
                        MaxRDay::Fixed(v) => *v,
                        MaxRDay::Free { mean, .. } => *mean,
                    },
                    _ => 0.0,
                };
                let z: f64 = rand_distr::StandardNormal.sample(rng);
                theta[block.offset + k] = base + 0.01 * z;
            }
        }
        // Keep strictly-positive parameters in support after jitter.
        if let Some(b) = self.block("GrowthNoiseScale") {
            theta[b.offset] = theta[b.offset].abs().max(1e-3);
        }
        if let Some(b) = self.block("RegionR") {
            for k in 0..b.size {
                theta[b.offset + k] = theta[b.offset + k].max(0.1);
            }
        }
        theta
    }

    /// Simulate expected daily counts for one parameter vector, seeded from
    /// the first observed count per region. Used for predictive sampling.
    pub fn expected_cases(&self, theta: &[f64]) -> Vec<f64> {
        let (beta1, peak) = self.seasonal_params(theta);
        let mut out = vec![0.0; self.n_regions * self.n_days];
        for r in 0..self.n_regions {
            let mut y = self.case_seeds[r];
            out[r * self.n_days] = y;
            for d in 0..self.n_days - 1 {
                let rt = self.rt(theta, r, d, beta1, peak);
                y *= self.predicted_growth(rt).exp();
                out[r * self.n_days + d + 1] = y;
            }
        }
        out
    }

    /// Prior draw of a full parameter vector. Used for prior-predictive
    /// sampling; best-effort callers tolerate failure.
    pub fn prior_draw(&self, rng: &mut impl Rng) -> Result<Vec<f64>, AppError> {
        let mut theta = vec![0.0; self.dim];
        for block in &self.blocks {
            for k in 0..block.size {
                let idx = block.offset + k;
                theta[idx] = match block.name.as_str() {
                    "CM_Alpha" => sample_normal(rng, 0.0, self.cm_prior_scale)?,
                    "RegionR" => sample_normal(rng, self.r_prior_mean, self.r_noise_scale)?.max(0.01),
                    "GrowthNoiseScale" => {
                        sample_normal(rng, 0.0, self.growth_noise_scale)?.abs().max(1e-3)
                    }
                    "seasonality_beta1" => sample_normal(rng, 0.0, self.seasonality_prior_scale)?,
                    "seasonality_max_R_day" => match &self.max_r_day {
                        MaxRDay::Fixed(v) => *v,
                        MaxRDay::Free { mean, scale } => sample_normal(rng, *mean, *scale)?,
                    },
                    _ => 0.0,
                };
            }
        }
        Ok(theta)
    }
}

fn sample_normal(rng: &mut impl Rng, mean: f64, scale: f64) -> Result<f64, AppError> {
    let dist = Normal::new(mean, scale)
        .map_err(|e| AppError::model(format!("Degenerate prior scale {scale}: {e}")))?;
    Ok(dist.sample(rng))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::dataset::tests::synthetic;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn default_bd() -> ModelBuildDict {
        EpiParams.model_build_dict()
    }

    #[test]
    fn registry_resolves_known_variants_and_rejects_others() {
        assert_eq!(
            ModelVariant::from_str("default").unwrap().model_name(),
            "DefaultModel"
        );
        assert_eq!(
            ModelVariant::from_str("deaths_only").unwrap().model_name(),
            "DeathsOnlyModel"
        );
        assert!(ModelVariant::from_str("renewal").is_err());
    }

    #[test]
    fn unknown_build_key_is_rejected_at_construction() {
        let data = synthetic();
        let mut bd = default_bd();
        bd.insert("not_a_real_knob".to_string(), BuildValue::Int(1));
        let err = build_model(ModelVariant::Default, &data, &bd).unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn parameter_layout_matches_dataset_shape() {
        let data = synthetic();
        let model = build_model(ModelVariant::Default, &data, &default_bd()).unwrap();
        let alpha = model.block("CM_Alpha").unwrap();
        assert_eq!(alpha.dims, vec![("CM".to_string(), 1)]);
        let region_r = model.block("RegionR").unwrap();
        assert_eq!(region_r.size, 2);
        assert!(model.block("seasonality_beta1").is_none());
        assert_eq!(model.dim, 1 + 2 + 1);
    }

    #[test]
    fn seasonal_variant_adds_seasonality_parameters() {
        let data = synthetic();
        let mut bd = default_bd();
        bd.insert(
            "max_R_day_prior".to_string(),
            BuildValue::Prior(PriorSpec::Normal {
                mean: 1.0,
                scale: 42.0,
            }),
        );
        let model = build_model(ModelVariant::Seasonal, &data, &bd).unwrap();
        assert!(model.block("seasonality_beta1").is_some());
        assert!(model.block("seasonality_max_R_day").is_some());

        // Fixed prior keeps the peak day out of the parameter vector.
        bd.insert(
            "max_R_day_prior".to_string(),
            BuildValue::Prior(PriorSpec::Fixed { value: 1.0 }),
        );
        let model = build_model(ModelVariant::Seasonal, &data, &bd).unwrap();
        assert!(model.block("seasonality_max_R_day").is_none());
    }

    #[test]
    fn log_posterior_is_finite_at_the_initial_point() {
        let data = synthetic();
        let model = build_model(ModelVariant::Default, &data, &default_bd()).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let theta = model.initial_point(&mut rng);
        assert!(model.log_posterior(&theta).is_finite());
        assert!(model.n_observations() > 0);
    }

    #[test]
    fn negative_region_r_is_out_of_support() {
        let data = synthetic();
        let model = build_model(ModelVariant::Default, &data, &default_bd()).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let mut theta = model.initial_point(&mut rng);
        let block = model.block("RegionR").unwrap();
        theta[block.offset] = -1.0;
        assert_eq!(model.log_posterior(&theta), f64::NEG_INFINITY);
    }

    #[test]
    fn expected_cases_start_from_the_observed_seed() {
        let data = synthetic();
        let model = build_model(ModelVariant::Default, &data, &default_bd()).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let theta = model.initial_point(&mut rng);
        let expected = model.expected_cases(&theta);
        assert_eq!(expected.len(), 2 * 3);
        assert_eq!(expected[0], 100.0);
        assert!(expected.iter().all(|v| v.is_finite() && *v > 0.0));
    }
}
