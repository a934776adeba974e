//! Top-level application orchestration.
//!
//! `src/main.rs` is intentionally tiny; this module is the "real main" that:
//! - splits free-form model-build tokens out of argv
//! - parses CLI arguments
//! - resolves each subcommand into a `RunConfig` + `RunVariant`
//! - hands off to the shared pipeline

use clap::Parser;

use crate::cli::{Command, CustomArgs, RunArgs};
use crate::domain::{ModelBuildDict, RunConfig, RunVariant};
use crate::error::AppError;

pub mod pipeline;

/// Entry point for the `epi` binary.
pub fn run() -> Result<(), AppError> {
    // Pin linear-algebra thread pools while we are still single-threaded;
    // mutating the environment after workers exist would race.
    crate::sampler::limit_blas_threads();

    // `--model_build_arg_<name>=<value>` tokens are an open-ended override
    // channel, not clap flags: pull them out before parsing so any unknown
    // name flows through to model construction instead of being rejected here.
    let (argv, extra_tokens) = crate::cli::split_model_build_args(std::env::args().collect())?;
    let cli = crate::cli::Cli::parse_from(argv);
    let extras = crate::cli::parse_extra_model_args(&extra_tokens);

    match cli.command {
        Command::Run(args) => {
            let cfg = run_config_from_run_args(args, extras);
            pipeline::run_driver(&cfg, &RunVariant::Plain)
        }
        Command::Custom(args) => {
            let cfg = run_config_from_custom_args(args, extras, None);
            pipeline::run_driver(&cfg, &RunVariant::Custom)
        }
        Command::NpiLeaveout(args) => {
            let variant = RunVariant::NpiLeaveout {
                npis: args.npis.clone(),
            };
            // Leave-out analyses were only ever run against the Brauner
            // dataset window; keep its cutoff when none is given.
            let cfg = run_config_from_custom_args(args.custom, extras, Some("2020-05-30"));
            pipeline::run_driver(&cfg, &variant)
        }
        Command::RegionHoldout(args) => {
            let variant = RunVariant::RegionHoldout {
                region: args.region.clone(),
            };
            let cfg = run_config_from_custom_args(args.custom, extras, Some("2020-05-30"));
            pipeline::run_driver(&cfg, &variant)
        }
    }
}

pub fn run_config_from_run_args(args: RunArgs, extras: ModelBuildDict) -> RunConfig {
    RunConfig {
        data_path: args.data,
        last_day: args.last_day,
        output_base: args.output_base,
        no_log: args.no_log,
        force_progress: args.force_progress,
        target_accept: 0.96,
        model_config_name: "default".to_string(),
        basic_r_mean: 3.28,
        max_r_day_prior: "fixed".to_string(),
        max_r_day: 1.0,
        max_r_day_scale: 42.0,
        exp_tag: args.shared.exp_tag,
        model_type: args.shared.model_type,
        n_samples: args.shared.n_samples,
        n_chains: args.shared.n_chains,
        seed: args.shared.seed,
        extras,
    }
}

pub fn run_config_from_custom_args(
    args: CustomArgs,
    extras: ModelBuildDict,
    default_last_day: Option<&str>,
) -> RunConfig {
    RunConfig {
        data_path: args.data,
        last_day: args
            .last_day
            .or_else(|| default_last_day.map(str::to_string)),
        output_base: args.output_base,
        no_log: args.no_log,
        force_progress: args.force_progress,
        target_accept: args.target_accept,
        model_config_name: args.model_config_name,
        basic_r_mean: args.basic_r_mean,
        max_r_day_prior: args.max_r_day_prior,
        max_r_day: args.max_r_day,
        max_r_day_scale: args.max_r_day_scale,
        exp_tag: args.shared.exp_tag,
        model_type: args.shared.model_type,
        n_samples: args.shared.n_samples,
        n_chains: args.shared.n_chains,
        seed: args.shared.seed,
        extras,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn leaveout_defaults_the_brauner_cutoff() {
        let cli = crate::cli::Cli::try_parse_from([
            "epi",
            "npi-leaveout",
            "--npis",
            "1",
            "--data",
            "d.json",
        ])
        .unwrap();
        let Command::NpiLeaveout(args) = cli.command else {
            panic!("wrong command");
        };
        let cfg =
            run_config_from_custom_args(args.custom, ModelBuildDict::new(), Some("2020-05-30"));
        assert_eq!(cfg.last_day.as_deref(), Some("2020-05-30"));
    }

    #[test]
    fn explicit_last_day_wins_over_the_default() {
        let cli = crate::cli::Cli::try_parse_from([
            "epi",
            "region-holdout",
            "--rg",
            "GB",
            "--data",
            "d.json",
            "--last_day",
            "2020-04-15",
        ])
        .unwrap();
        let Command::RegionHoldout(args) = cli.command else {
            panic!("wrong command");
        };
        let cfg =
            run_config_from_custom_args(args.custom, ModelBuildDict::new(), Some("2020-05-30"));
        assert_eq!(cfg.last_day.as_deref(), Some("2020-04-15"));
    }
}
