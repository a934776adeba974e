//! Command-line parsing for the inference run driver.
//!
//! The goal of this module is to keep **argument parsing** and **command dispatch**
//! separate from the modeling/sampling code. Each subcommand corresponds to one
//! of the original driver scripts (plain run, sensitivity-analysis custom run,
//! NPI leave-out, region holdout); they share most of their flag surface.
//!
//! Free-form `--model_build_arg_<name>=<value>` tokens are *not* clap flags:
//! they are split out of argv before parsing (see [`split_model_build_args`])
//! and merged into the build dictionary with highest precedence.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::domain::{BuildValue, ModelBuildDict};
use crate::error::AppError;

/// Prefix marking a free-form model-build override token.
pub const MODEL_BUILD_ARG_PREFIX: &str = "--model_build_arg_";

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(
    name = "epi",
    version,
    about = "Bayesian NPI-effectiveness inference run driver"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Plain inference run: sample the model and archive the full trace.
    Run(RunArgs),
    /// Sensitivity-analysis run with CLI-configurable seasonality/R priors.
    Custom(CustomArgs),
    /// Zero out selected NPI columns before fitting (leave-out analysis).
    NpiLeaveout(NpiLeaveoutArgs),
    /// Hold out one region from training and persist its posterior slice.
    RegionHoldout(RegionHoldoutArgs),
}

/// Flags contributed to every driver variant (the shared experiment surface).
#[derive(Debug, Parser, Clone)]
pub struct SharedArgs {
    /// Experiment tag embedded in output paths and the summary record.
    #[arg(long = "exp_tag", default_value = "default")]
    pub exp_tag: String,

    /// Registered model variant (default, cases_only, deaths_only, seasonal).
    #[arg(long = "model_type", default_value = "default")]
    pub model_type: String,

    /// Posterior draws per chain.
    #[arg(long = "n_samples", default_value_t = 500)]
    pub n_samples: usize,

    /// Number of chains (also the parallel core count).
    #[arg(long = "n_chains", default_value_t = 4)]
    pub n_chains: usize,

    /// RNG seed for chain initialization.
    #[arg(long = "seed", default_value_t = 42)]
    pub seed: u64,
}

/// Arguments for the plain `run` driver.
#[derive(Debug, Parser, Clone)]
pub struct RunArgs {
    /// Dataset path.
    pub data: PathBuf,

    /// Truncate the dataset's day range (Brauner data: 2020-05-30).
    #[arg(long = "last_day")]
    pub last_day: Option<String>,

    /// Override the derived output path prefix.
    #[arg(long = "output_base")]
    pub output_base: Option<String>,

    /// Disable the log-file tee.
    #[arg(short = 'n', long = "no_log")]
    pub no_log: bool,

    /// Force per-chain progress lines even when stdout is not a terminal.
    #[arg(short = 'P', long = "force_progress")]
    pub force_progress: bool,

    #[command(flatten)]
    pub shared: SharedArgs,
}

/// Arguments for the sensitivity-analysis drivers.
#[derive(Debug, Parser, Clone)]
pub struct CustomArgs {
    /// Dataset path.
    #[arg(long = "data")]
    pub data: PathBuf,

    /// Truncate the dataset's day range (Brauner data: 2020-05-30).
    #[arg(long = "last_day")]
    pub last_day: Option<String>,

    /// Disable the log-file tee.
    #[arg(short = 'n', long = "no_log")]
    pub no_log: bool,

    /// Force per-chain progress lines even when stdout is not a terminal.
    #[arg(short = 'P', long = "force_progress")]
    pub force_progress: bool,

    /// Sampler target acceptance probability.
    #[arg(long = "target_accept", default_value_t = 0.96)]
    pub target_accept: f64,

    /// Model configuration tag. Used for output-path nesting and data identification.
    #[arg(long = "model_config_name", default_value = "default")]
    pub model_config_name: String,

    /// Override destination path prefix (adding '.log', '_summary.json', '_full.netcdf').
    #[arg(long = "output_base")]
    pub output_base: Option<String>,

    /// Basic R mean (default 3.28, 1.35 for Sharma et al.).
    #[arg(long = "basic_R_mean", default_value_t = 3.28)]
    pub basic_r_mean: f64,

    /// Prior for the day of the seasonally-highest R ('fixed', 'normal').
    #[arg(long = "max_R_day_prior", default_value = "fixed")]
    pub max_r_day_prior: String,

    /// Day of the seasonally-highest R (1..365, default 1 = Jan 1).
    #[arg(long = "max_R_day", default_value_t = 1.0)]
    pub max_r_day: f64,

    /// Scale for the day of the seasonally-highest R (mean is 1 = Jan 1).
    #[arg(long = "max_R_day_scale", default_value_t = 42.0)]
    pub max_r_day_scale: f64,

    #[command(flatten)]
    pub shared: SharedArgs,
}

/// `npi-leaveout`: sensitivity flags plus the NPI indices to zero out.
#[derive(Debug, Parser, Clone)]
pub struct NpiLeaveoutArgs {
    /// Indices of NPI columns to zero out.
    #[arg(long = "npis", num_args = 1.., required = true)]
    pub npis: Vec<usize>,

    #[command(flatten)]
    pub custom: CustomArgs,
}

/// `region-holdout`: sensitivity flags plus the held-out region.
#[derive(Debug, Parser, Clone)]
pub struct RegionHoldoutArgs {
    /// Region to leave out (alpha-2 code).
    #[arg(long = "rg")]
    pub region: String,

    #[command(flatten)]
    pub custom: CustomArgs,
}

/// Split `--model_build_arg_<name>=<value>` tokens out of argv.
///
/// Returns the remaining argv (for clap) and the extracted `(name, value)`
/// pairs in their original order. A prefix token without `=` is a
/// configuration error rather than a silent pass-through.
pub fn split_model_build_args(
    argv: Vec<String>,
) -> Result<(Vec<String>, Vec<(String, String)>), AppError> {
    let mut rest = Vec::with_capacity(argv.len());
    let mut extras = Vec::new();
    for arg in argv {
        let Some(tail) = arg.strip_prefix(MODEL_BUILD_ARG_PREFIX) else {
            rest.push(arg);
            continue;
        };
        let Some((name, value)) = tail.split_once('=') else {
            return Err(AppError::config(format!(
                "Malformed model build arg '{arg}' (expected {MODEL_BUILD_ARG_PREFIX}<name>=<value>)"
            )));
        };
        if name.is_empty() {
            return Err(AppError::config(format!(
                "Malformed model build arg '{arg}' (empty name)"
            )));
        }
        extras.push((name.to_string(), value.to_string()));
    }
    Ok((rest, extras))
}

/// Parse extracted extras into an ordered build-override map.
///
/// Values are coerced to integers or floats where parseable and kept as
/// strings otherwise. A repeated name keeps its first position but takes the
/// last value, matching last-wins merge semantics.
pub fn parse_extra_model_args(extras: &[(String, String)]) -> ModelBuildDict {
    let mut map = ModelBuildDict::new();
    for (name, value) in extras {
        map.insert(name.clone(), BuildValue::parse(value));
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn split_extracts_model_build_args_in_order() {
        let (rest, extras) = split_model_build_args(argv(&[
            "epi",
            "custom",
            "--data",
            "d.json",
            "--model_build_arg_seasonality_peak_index=1",
            "--model_build_arg_cm_prior_scale=0.3",
        ]))
        .unwrap();
        assert_eq!(rest, argv(&["epi", "custom", "--data", "d.json"]));
        assert_eq!(
            extras,
            vec![
                ("seasonality_peak_index".to_string(), "1".to_string()),
                ("cm_prior_scale".to_string(), "0.3".to_string()),
            ]
        );
    }

    #[test]
    fn split_rejects_prefix_token_without_value() {
        let err = split_model_build_args(argv(&["epi", "--model_build_arg_foo"])).unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn extras_are_coerced_and_last_wins() {
        let extras = vec![
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "0.5".to_string()),
            ("c".to_string(), "hello".to_string()),
            ("a".to_string(), "2".to_string()),
        ];
        let map = parse_extra_model_args(&extras);
        assert_eq!(map.get("a"), Some(&BuildValue::Int(2)));
        assert_eq!(map.get("b"), Some(&BuildValue::Float(0.5)));
        assert_eq!(map.get("c"), Some(&BuildValue::Str("hello".to_string())));
    }

    #[test]
    fn custom_subcommand_parses_prior_flags() {
        let cli = Cli::try_parse_from([
            "epi",
            "custom",
            "--data",
            "d.json",
            "--max_R_day_prior",
            "normal",
            "--max_R_day_scale",
            "21.0",
            "--n_samples",
            "8",
            "--n_chains",
            "2",
        ])
        .unwrap();
        match cli.command {
            Command::Custom(args) => {
                assert_eq!(args.max_r_day_prior, "normal");
                assert_eq!(args.max_r_day_scale, 21.0);
                assert_eq!(args.shared.n_samples, 8);
                assert_eq!(args.shared.n_chains, 2);
                assert_eq!(args.target_accept, 0.96);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn npi_leaveout_takes_multiple_indices() {
        let cli = Cli::try_parse_from([
            "epi",
            "npi-leaveout",
            "--npis",
            "0",
            "3",
            "--data",
            "d.json",
        ])
        .unwrap();
        match cli.command {
            Command::NpiLeaveout(args) => assert_eq!(args.npis, vec![0, 3]),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
