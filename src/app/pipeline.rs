//! The shared run pipeline used by every driver variant.
//!
//! One linear pass per invocation, no branching back:
//! plan paths -> attach logging -> load data -> mutate (leave-out variants)
//! -> assemble build dict -> build model -> sample -> reduce -> persist.
//! Any failure in a stage is terminal for the run; there are no retries.

use chrono::Local;

use crate::data::{Dataset, preprocess_data};
use crate::domain::{RunConfig, RunVariant};
use crate::error::AppError;
use crate::io::{
    OutputPaths, RunKind, plan_outputs, write_archive, write_cm_trace, write_region_results,
    write_summary_json,
};
use crate::logging::RunLog;
use crate::model::{ModelVariant, assemble_build_dict, build_model, format_build_dict};
use crate::reduce::{Coords, build_summary_record, combine, region_results};
use crate::sampler::{SamplerSettings, sample};

/// Run one driver invocation end to end.
pub fn run_driver(cfg: &RunConfig, variant: &RunVariant) -> Result<(), AppError> {
    let kind = if variant.is_sensitivity() {
        RunKind::Sensitivity {
            model_config_name: cfg.model_config_name.clone(),
        }
    } else {
        RunKind::Plain
    };
    let paths = plan_outputs(
        cfg.output_base.as_deref(),
        &kind,
        &cfg.exp_tag,
        &cfg.model_type,
        &Local::now(),
        std::process::id(),
    )?;

    // Logging must attach before any further diagnostic output, or those
    // lines never reach the log file.
    let log = if cfg.no_log {
        RunLog::disabled()
    } else {
        let log = RunLog::attach(Some(&paths.log))?;
        log.line(format!("Logging to {}", paths.log.display()));
        log
    };
    log.line(format!(
        "CMD: {}",
        std::env::args().collect::<Vec<_>>().join(" ")
    ));

    let mut data = preprocess_data(&cfg.data_path, cfg.last_day.as_deref())?;
    let holdout_index = apply_variant_mutation(&mut data, variant, &cfg.model_type)?;

    log.line(format!("\nData loaded from {}:", cfg.data_path.display()));
    log.line(format!(
        "NPI CMs ({}): {:?}",
        data.n_cms(),
        data.cm_names
    ));
    log.line(format!("Regions ({}): {:?}", data.n_regions(), data.regions));
    log.line(format!(
        "Days ({}): {} .. {}",
        data.n_days(),
        data.days.first().map(String::as_str).unwrap_or("-"),
        data.days.last().map(String::as_str).unwrap_or("-"),
    ));

    let model_variant = ModelVariant::from_str(&cfg.model_type)?;
    let bd = assemble_build_dict(cfg, variant.is_sensitivity())?;
    log.line(format!("\nBD = {}", format_build_dict(&bd)));

    log.line("\nBuilding model ...");
    let model = build_model(model_variant, &data, &bd)?;

    log.line("Running inference ...\n");
    let settings = SamplerSettings::for_run(cfg);
    let start = std::time::Instant::now();
    let trace = sample(&model, &settings, &log)?;
    let total_runtime = start.elapsed().as_secs_f64();

    log.line("\nSaving trace archive ...");
    let run = combine(
        &model,
        model_variant.model_name(),
        Coords::from_dataset(&data),
        trace,
        cfg.seed,
    );
    write_archive(&paths.full, &run)?;

    log.line("Saving summary ...");
    let record = build_summary_record(
        &run,
        &cfg.model_config_name,
        &cfg.exp_tag,
        &cfg.data_path.to_string_lossy(),
        &bd,
        total_runtime,
        cfg.n_samples,
    );
    write_summary_json(&paths.summary, &record)?;

    persist_variant_artifacts(&run, variant, holdout_index, &paths, &log)?;

    log.line(format!(
        "\nDone: {} divergences, runtime {:.1}s",
        record.divergences, total_runtime
    ));
    Ok(())
}

/// Apply the variant's dataset mutation; returns the held-out region index
/// for region-holdout runs.
fn apply_variant_mutation(
    data: &mut Dataset,
    variant: &RunVariant,
    model_type: &str,
) -> Result<Option<usize>, AppError> {
    match variant {
        RunVariant::Plain | RunVariant::Custom => Ok(None),
        RunVariant::NpiLeaveout { npis } => {
            data.mask_reopenings();
            for npi in npis {
                data.zero_npi(*npi)?;
            }
            Ok(None)
        }
        RunVariant::RegionHoldout { region } => {
            data.mask_reopenings();
            if model_type.contains("deaths_only") {
                data.remove_regions_min_deaths(5.0);
            }
            Ok(Some(data.mask_region(region)?))
        }
    }
}

/// Variant-specific artifacts beyond archive + summary.
fn persist_variant_artifacts(
    run: &crate::reduce::CombinedRun,
    variant: &RunVariant,
    holdout_index: Option<usize>,
    paths: &OutputPaths,
    log: &RunLog,
) -> Result<(), AppError> {
    match variant {
        RunVariant::Plain | RunVariant::Custom => Ok(()),
        RunVariant::NpiLeaveout { npis } => {
            let reduction = run
                .posterior
                .var("CMReduction")
                .ok_or_else(|| AppError::model("Trace is missing CMReduction"))?;
            let joined: String = npis.iter().map(usize::to_string).collect();
            let path = paths.sibling(&format!("_npi{joined}.txt"));
            log.line(format!("Saving CM trace to {}", path.display()));
            write_cm_trace(&path, reduction)
        }
        RunVariant::RegionHoldout { region } => {
            let index = holdout_index.ok_or_else(|| {
                AppError::model("Region holdout finished without a held-out index")
            })?;
            let results = region_results(run, index, region)?;
            let results_path = paths.sibling(&format!("_{region}.json"));
            log.line(format!("Saving holdout results to {}", results_path.display()));
            write_region_results(&results_path, &results)?;

            let reduction = run
                .posterior
                .var("CMReduction")
                .ok_or_else(|| AppError::model("Trace is missing CMReduction"))?;
            write_cm_trace(&paths.sibling(&format!("_{region}.txt")), reduction)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ModelBuildDict;
    use std::path::PathBuf;

    fn write_synthetic_dataset(dir: &std::path::Path) -> PathBuf {
        let json = r#"{
            "regions": ["GB", "DE"],
            "days": ["2020-03-01", "2020-03-02", "2020-03-03"],
            "cm_names": ["School Closure"],
            "active_cms": [[[0, 1, 1]], [[0, 0, 1]]],
            "new_cases": [[100, 130, 150], [80, 110, 140]],
            "new_deaths": [[5, 6, 8], [3, 4, 6]]
        }"#;
        let path = dir.join("synthetic.json");
        std::fs::write(&path, json).unwrap();
        path
    }

    fn config(data_path: PathBuf, base: &str) -> RunConfig {
        RunConfig {
            data_path,
            last_day: None,
            output_base: Some(base.to_string()),
            no_log: true,
            force_progress: false,
            target_accept: 0.96,
            model_config_name: "default".to_string(),
            basic_r_mean: 3.28,
            max_r_day_prior: "fixed".to_string(),
            max_r_day: 1.0,
            max_r_day_scale: 42.0,
            exp_tag: "default".to_string(),
            model_type: "default".to_string(),
            n_samples: 4,
            n_chains: 2,
            seed: 42,
            extras: ModelBuildDict::new(),
        }
    }

    #[test]
    fn custom_run_completes_and_writes_summary_and_archive() {
        let dir = std::env::temp_dir().join(format!("epi-runs-e2e-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let data_path = write_synthetic_dataset(&dir);
        let base = dir.join("custom_run").to_string_lossy().into_owned();
        let cfg = config(data_path, &base);

        run_driver(&cfg, &RunVariant::Custom).unwrap();

        let summary: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(format!("{base}_summary.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(summary["model_name"], "DefaultModel");
        assert_eq!(summary["cm_names"], serde_json::json!(["School Closure"]));
        assert!(summary["divergences"].as_u64().is_some());
        for field in ["med", "upper", "lower", "max", "min"] {
            assert!(
                summary["rhat"][field].as_f64().is_some(),
                "rhat.{field} missing: {summary}"
            );
        }
        assert_eq!(summary["exp_config"]["R_prior_mean"], 3.28);
        assert!(summary["alpha_i"].as_array().is_some());

        let run = crate::io::read_archive(std::path::Path::new(&format!("{base}_full.netcdf")))
            .unwrap();
        assert_eq!(run.coords.cm_names, vec!["School Closure".to_string()]);
        assert_eq!(run.coords.regions.len(), 2);
        assert_eq!(run.posterior.draws, 4);
        assert_eq!(run.posterior.chains, 2);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn region_holdout_writes_per_region_results_and_cm_trace() {
        let dir = std::env::temp_dir().join(format!("epi-runs-e2e-rg-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let data_path = write_synthetic_dataset(&dir);
        let base = dir.join("holdout_run").to_string_lossy().into_owned();
        let cfg = config(data_path, &base);

        run_driver(
            &cfg,
            &RunVariant::RegionHoldout {
                region: "DE".to_string(),
            },
        )
        .unwrap();

        let results: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(format!("{base}_DE.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(results["region"], "DE");
        assert_eq!(results["CMReduction"].as_array().unwrap().len(), 8);
        assert_eq!(results["RegionR"].as_array().unwrap().len(), 8);

        let cm_trace = std::fs::read_to_string(format!("{base}_DE.txt")).unwrap();
        assert_eq!(cm_trace.lines().count(), 8);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn npi_leaveout_zeroes_the_column_and_writes_the_trace() {
        let dir = std::env::temp_dir().join(format!("epi-runs-e2e-npi-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let data_path = write_synthetic_dataset(&dir);
        let base = dir.join("leaveout_run").to_string_lossy().into_owned();
        let cfg = config(data_path, &base);

        run_driver(&cfg, &RunVariant::NpiLeaveout { npis: vec![0] }).unwrap();
        assert!(std::fs::metadata(format!("{base}_npi0.txt")).is_ok());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn unknown_model_type_fails_before_sampling() {
        let dir = std::env::temp_dir().join(format!("epi-runs-e2e-bad-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let data_path = write_synthetic_dataset(&dir);
        let base = dir.join("bad_run").to_string_lossy().into_owned();
        let mut cfg = config(data_path, &base);
        cfg.model_type = "renewal".to_string();

        let err = run_driver(&cfg, &RunVariant::Custom).unwrap_err();
        assert_eq!(err.exit_code(), 1);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
