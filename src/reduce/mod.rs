//! Result reduction: combine the trace with predictive samples, compute
//! convergence diagnostics, and build the flattened summary record.
//!
//! Prior-predictive and posterior-predictive sampling are best-effort
//! enrichment: each is attempted independently and absence is a valid
//! outcome, not an error. The potential-scale-reduction diagnostic (split
//! R-hat) is likewise reported as absent when there are too few draws or
//! chains to compute it meaningfully.

use indexmap::IndexMap;
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::data::Dataset;
use crate::domain::{ModelBuildDict, RhatSummary, SummaryRecord};
use crate::error::AppError;
use crate::model::BuiltModel;
use crate::sampler::{SampleArray, Trace};

/// Named coordinate axes carried alongside the trace.
#[derive(Debug, Clone, PartialEq)]
pub struct Coords {
    pub regions: Vec<String>,
    pub days: Vec<String>,
    pub cm_names: Vec<String>,
}

impl Coords {
    pub fn from_dataset(data: &Dataset) -> Coords {
        Coords {
            regions: data.regions.clone(),
            days: data.days.clone(),
            cm_names: data.cm_names.clone(),
        }
    }
}

/// The combined result object: posterior trace plus optional predictive
/// sample groups, with named coordinates. This is what gets archived.
#[derive(Debug, Clone)]
pub struct CombinedRun {
    pub model_name: String,
    pub coords: Coords,
    pub posterior: Trace,
    pub prior_predictive: Option<IndexMap<String, SampleArray>>,
    pub posterior_predictive: Option<IndexMap<String, SampleArray>>,
}

/// Combine trace and predictive samples. Predictive failures are swallowed:
/// the corresponding group is recorded as absent and the run proceeds.
pub fn combine(
    model: &BuiltModel,
    model_name: &str,
    coords: Coords,
    posterior: Trace,
    seed: u64,
) -> CombinedRun {
    let prior_predictive = sample_prior_predictive(model, 500.min(posterior.draws.max(1)), seed).ok();
    let posterior_predictive = sample_posterior_predictive(model, &posterior).ok();
    CombinedRun {
        model_name: model_name.to_string(),
        coords,
        posterior,
        prior_predictive,
        posterior_predictive,
    }
}

/// Simulate expected case trajectories from prior parameter draws
/// (one chain, `draws` samples).
pub fn sample_prior_predictive(
    model: &BuiltModel,
    draws: usize,
    seed: u64,
) -> Result<IndexMap<String, SampleArray>, AppError> {
    if draws == 0 || model.n_days == 0 {
        return Err(AppError::model("Nothing to simulate for prior predictive"));
    }
    let mut rng = StdRng::seed_from_u64(seed ^ 0x70726972);
    let mut values = Vec::with_capacity(draws * model.n_regions * model.n_days);
    for _ in 0..draws {
        let theta = model.prior_draw(&mut rng)?;
        values.extend(model.expected_cases(&theta));
    }
    let mut group = IndexMap::new();
    group.insert(
        "ExpectedCases".to_string(),
        SampleArray::new(
            vec![
                "chain".to_string(),
                "draw".to_string(),
                "R".to_string(),
                "D".to_string(),
            ],
            vec![1, draws, model.n_regions, model.n_days],
            values,
        ),
    );
    Ok(group)
}

/// Simulate expected case trajectories for every posterior draw.
pub fn sample_posterior_predictive(
    model: &BuiltModel,
    trace: &Trace,
) -> Result<IndexMap<String, SampleArray>, AppError> {
    if trace.draws == 0 {
        return Err(AppError::model("Empty trace for posterior predictive"));
    }
    let mut values = Vec::with_capacity(trace.chains * trace.draws * model.n_regions * model.n_days);
    let mut theta = vec![0.0; model.dim];
    for chain in 0..trace.chains {
        for draw in 0..trace.draws {
            for block in &model.blocks {
                let arr = trace.var(&block.name).ok_or_else(|| {
                    AppError::model(format!("Trace is missing variable '{}'", block.name))
                })?;
                for k in 0..block.size {
                    theta[block.offset + k] = arr.at(chain, draw, k);
                }
            }
            values.extend(model.expected_cases(&theta));
        }
    }
    let mut group = IndexMap::new();
    group.insert(
        "ExpectedCases".to_string(),
        SampleArray::new(
            vec![
                "chain".to_string(),
                "draw".to_string(),
                "R".to_string(),
                "D".to_string(),
            ],
            vec![trace.chains, trace.draws, model.n_regions, model.n_days],
            values,
        ),
    );
    Ok(group)
}

/// Split potential-scale-reduction statistic for one entity slice of a
/// sample array. Chains are split in half, so the effective chain count is
/// doubled and the draw count halved.
fn split_rhat_scalar(arr: &SampleArray, entity: usize) -> f64 {
    let chains = arr.shape[0];
    let draws = arr.shape[1];
    let half = draws / 2;
    if half < 2 || chains < 1 {
        return f64::NAN;
    }
    let n_split = 2 * chains;
    let mut means = Vec::with_capacity(n_split);
    let mut variances = Vec::with_capacity(n_split);
    for c in 0..chains {
        for part in 0..2 {
            let start = part * half;
            let mut mean = 0.0;
            for d in 0..half {
                mean += arr.at(c, start + d, entity);
            }
            mean /= half as f64;
            let mut var = 0.0;
            for d in 0..half {
                let delta = arr.at(c, start + d, entity) - mean;
                var += delta * delta;
            }
            var /= (half - 1) as f64;
            means.push(mean);
            variances.push(var);
        }
    }

    let w = variances.iter().sum::<f64>() / n_split as f64;
    let grand = means.iter().sum::<f64>() / n_split as f64;
    let b = half as f64
        * means.iter().map(|m| (m - grand) * (m - grand)).sum::<f64>()
        / (n_split - 1) as f64;
    let var_plus = (half as f64 - 1.0) / half as f64 * w + b / half as f64;
    (var_plus / w).sqrt()
}

/// R-hat for every entity of every monitored variable, flattened.
pub fn all_rhat(trace: &Trace) -> Vec<f64> {
    let mut out = Vec::new();
    for arr in trace.vars.values() {
        for entity in 0..arr.entity_len() {
            out.push(split_rhat_scalar(arr, entity));
        }
    }
    out
}

/// Percentile with linear interpolation between order statistics.
pub fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let rank = q / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = rank - lo as f64;
        sorted[lo] * (1.0 - frac) + sorted[hi] * frac
    }
}

/// Percentile summary of the convergence diagnostic.
///
/// Present only when draws >= 4 and chains >= 2; non-finite per-variable
/// values (constant slices, for instance) are discarded first.
pub fn rhat_summary(trace: &Trace) -> Option<RhatSummary> {
    if trace.draws < 4 || trace.chains < 2 {
        return None;
    }
    let mut values: Vec<f64> = all_rhat(trace).into_iter().filter(|v| v.is_finite()).collect();
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let max = values[values.len() - 1];
    let min = values[0];
    Some(RhatSummary {
        med: percentile(&values, 50.0),
        upper: percentile(&values, 97.5),
        lower: percentile(&values, 2.5),
        max,
        min,
    })
}

/// Reshape a sample array to `(chains * draws, entity dims...)` nested JSON.
fn flat_samples_value(arr: &SampleArray) -> serde_json::Value {
    let chains = arr.shape[0];
    let draws = arr.shape[1];
    let entity = arr.entity_len();
    let mut samples = Vec::with_capacity(chains * draws);
    for c in 0..chains {
        for d in 0..draws {
            if arr.shape.len() <= 2 {
                samples.push(serde_json::json!(arr.at(c, d, 0)));
            } else {
                let row: Vec<f64> = (0..entity).map(|k| arr.at(c, d, k)).collect();
                samples.push(serde_json::json!(row));
            }
        }
    }
    serde_json::Value::Array(samples)
}

/// Selected posterior variables copied into the summary, renamed.
const SUMMARY_KEYMAP: &[(&str, &str)] = &[
    ("seasonality_beta1", "seasonality_beta1"),
    ("seasonality_max_R_day", "seasonality_max_R_day"),
    ("seasonality_local_beta1", "seasonality_local_beta1"),
    ("CM_Alpha", "alpha_i"),
    ("MeanRegionR", "mean_region_R"),
];

/// Copy the keymapped posterior variables that are present in the trace.
pub fn load_keys_from_samples(trace: &Trace) -> IndexMap<String, serde_json::Value> {
    let mut out = IndexMap::new();
    for (key, renamed) in SUMMARY_KEYMAP {
        if let Some(arr) = trace.var(key) {
            out.insert(renamed.to_string(), flat_samples_value(arr));
        }
    }
    out
}

/// Build the one summary record written per invocation.
#[allow(clippy::too_many_arguments)]
pub fn build_summary_record(
    run: &CombinedRun,
    model_config_name: &str,
    exp_tag: &str,
    data_path: &str,
    bd: &ModelBuildDict,
    total_runtime: f64,
    n_samples: usize,
) -> SummaryRecord {
    SummaryRecord {
        model_name: run.model_name.clone(),
        model_config_name: model_config_name.to_string(),
        divergences: run.posterior.divergences(),
        time_per_sample: total_runtime / n_samples.max(1) as f64,
        total_runtime,
        rhat: rhat_summary(&run.posterior),
        data_path: data_path.to_string(),
        cm_names: run.coords.cm_names.clone(),
        exp_tag: exp_tag.to_string(),
        exp_config: bd.clone(),
        model_kwargs: bd.clone(),
        samples: load_keys_from_samples(&run.posterior),
    }
}

/// Per-region holdout results: the held-out region's posterior slice plus
/// shared global variables. Serialized in place of the full summary record
/// for region-holdout runs.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RegionResults {
    pub region: String,
    #[serde(rename = "CMReduction")]
    pub cm_reduction: Vec<Vec<f64>>,
    #[serde(rename = "RegionR")]
    pub region_r: Vec<f64>,
    #[serde(rename = "MeanRegionR")]
    pub mean_region_r: Option<Vec<f64>>,
    #[serde(rename = "ExpectedCases")]
    pub expected_cases: Option<Vec<Vec<f64>>>,
}

/// Slice the trace down to one region.
pub fn region_results(
    run: &CombinedRun,
    region_index: usize,
    region: &str,
) -> Result<RegionResults, AppError> {
    let trace = &run.posterior;
    let reduction = trace
        .var("CMReduction")
        .ok_or_else(|| AppError::model("Trace is missing CMReduction"))?;
    let region_r = trace
        .var("RegionR")
        .ok_or_else(|| AppError::model("Trace is missing RegionR"))?;
    if region_index >= region_r.entity_len() {
        return Err(AppError::model(format!(
            "Region index {region_index} out of range for trace"
        )));
    }

    let mut cm_reduction = Vec::with_capacity(trace.chains * trace.draws);
    let mut r_slice = Vec::with_capacity(trace.chains * trace.draws);
    for c in 0..trace.chains {
        for d in 0..trace.draws {
            cm_reduction.push(
                (0..reduction.entity_len())
                    .map(|k| reduction.at(c, d, k))
                    .collect(),
            );
            r_slice.push(region_r.at(c, d, region_index));
        }
    }

    let mean_region_r = trace.var("MeanRegionR").map(|arr| {
        (0..trace.chains)
            .flat_map(|c| (0..trace.draws).map(move |d| (c, d)))
            .map(|(c, d)| arr.at(c, d, 0))
            .collect()
    });

    let expected_cases = run.posterior_predictive.as_ref().and_then(|group| {
        let arr = group.get("ExpectedCases")?;
        let n_days = *arr.shape.last()?;
        let mut rows = Vec::with_capacity(trace.chains * trace.draws);
        for c in 0..arr.shape[0] {
            for d in 0..arr.shape[1] {
                let row: Vec<f64> = (0..n_days)
                    .map(|day| arr.at(c, d, region_index * n_days + day))
                    .collect();
                rows.push(row);
            }
        }
        Some(rows)
    });

    Ok(RegionResults {
        region: region.to_string(),
        cm_reduction,
        region_r: r_slice,
        mean_region_r,
        expected_cases,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;

    fn trace_from(chains: usize, draws: usize, vars: Vec<(&str, SampleArray)>) -> Trace {
        let mut map = IndexMap::new();
        for (name, arr) in vars {
            map.insert(name.to_string(), arr);
        }
        Trace {
            chains,
            draws,
            vars: map,
            diverging: vec![false; chains * draws],
        }
    }

    fn scalar_var(chains: usize, draws: usize, values: Vec<f64>) -> SampleArray {
        SampleArray::new(
            vec!["chain".to_string(), "draw".to_string()],
            vec![chains, draws],
            values,
        )
    }

    #[test]
    fn percentile_interpolates_linearly() {
        let values = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile(&values, 0.0), 1.0);
        assert_eq!(percentile(&values, 100.0), 4.0);
        assert!((percentile(&values, 50.0) - 2.5).abs() < 1e-12);
    }

    #[test]
    fn rhat_is_near_one_for_well_mixed_chains() {
        // Two chains drawing from the same alternating pattern.
        let values = vec![1.0, 2.0, 1.0, 2.0, 1.1, 1.9, 1.1, 1.9];
        let trace = trace_from(2, 4, vec![("x", scalar_var(2, 4, values))]);
        let summary = rhat_summary(&trace).unwrap();
        assert!(summary.med < 1.5, "med was {}", summary.med);
        assert!(summary.min <= summary.med && summary.med <= summary.max);
    }

    #[test]
    fn rhat_is_large_for_separated_chains() {
        let values = vec![0.0, 0.1, 0.0, 0.1, 10.0, 10.1, 10.0, 10.1];
        let trace = trace_from(2, 4, vec![("x", scalar_var(2, 4, values))]);
        let summary = rhat_summary(&trace).unwrap();
        assert!(summary.max > 2.0, "max was {}", summary.max);
    }

    #[test]
    fn rhat_is_absent_below_the_sample_and_chain_floor() {
        let trace = trace_from(2, 3, vec![("x", scalar_var(2, 3, vec![0.0; 6]))]);
        assert!(rhat_summary(&trace).is_none());
        let trace = trace_from(1, 8, vec![("x", scalar_var(1, 8, vec![0.0; 8]))]);
        assert!(rhat_summary(&trace).is_none());
    }

    #[test]
    fn constant_slices_are_dropped_not_crashed() {
        // Constant chains give W = 0 -> non-finite rhat, which is filtered.
        let trace = trace_from(2, 4, vec![("x", scalar_var(2, 4, vec![1.0; 8]))]);
        assert!(rhat_summary(&trace).is_none());
    }

    #[test]
    fn flat_samples_reshape_chain_and_draw_into_one_axis() {
        let arr = SampleArray::new(
            vec!["chain".to_string(), "draw".to_string(), "CM".to_string()],
            vec![2, 2, 1],
            vec![0.1, 0.2, 0.3, 0.4],
        );
        let trace = trace_from(2, 2, vec![("CM_Alpha", arr)]);
        let samples = load_keys_from_samples(&trace);
        let alpha = samples.get("alpha_i").unwrap();
        assert_eq!(alpha, &serde_json::json!([[0.1], [0.2], [0.3], [0.4]]));
        assert!(samples.get("seasonality_beta1").is_none());
    }
}
