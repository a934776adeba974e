//! Output path planning.
//!
//! Each invocation owns one output-path prefix. When `--output_base` is not
//! given, the prefix is derived from experiment tag, model type, a
//! second-precision timestamp, and the process id, so two runs can only
//! collide if they share a pid inside the same second. Callers who override
//! the base are responsible for uniqueness themselves.
//!
//! Plain runs live under `runs/`; sensitivity-analysis runs nest under
//! `sensitivity_analysis/<model-config-name>/<experiment-tag>/`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use crate::error::AppError;

/// Which output layout a run uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunKind {
    Plain,
    Sensitivity { model_config_name: String },
}

/// The sibling artifact paths derived from one base prefix.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputPaths {
    pub base: String,
    pub log: PathBuf,
    pub full: PathBuf,
    pub summary: PathBuf,
}

impl OutputPaths {
    /// Extra artifact path derived by suffixing the base (holdout results,
    /// NPI-effect traces).
    pub fn sibling(&self, suffix: &str) -> PathBuf {
        PathBuf::from(format!("{}{suffix}", self.base))
    }
}

/// Derive the base prefix for a run without an explicit `--output_base`.
pub fn derive_base(
    kind: &RunKind,
    exp_tag: &str,
    model_type: &str,
    now: &DateTime<Local>,
    pid: u32,
) -> String {
    match kind {
        RunKind::Plain => {
            let ts = now.format("%Y-%m-%d-%H:%M:%S");
            format!("runs/{exp_tag}_{model_type}_{ts}_pid{pid}")
        }
        RunKind::Sensitivity { model_config_name } => {
            let ts = now.format("%Y-%m-%d-%H%M%S");
            format!(
                "sensitivity_analysis/{model_config_name}/{exp_tag}/{model_type}_{ts}_pid{pid}"
            )
        }
    }
}

/// Plan the run's output paths and ensure the parent directory exists.
pub fn plan_outputs(
    output_base: Option<&str>,
    kind: &RunKind,
    exp_tag: &str,
    model_type: &str,
    now: &DateTime<Local>,
    pid: u32,
) -> Result<OutputPaths, AppError> {
    let base = match output_base {
        Some(b) if !b.is_empty() => b.to_string(),
        _ => derive_base(kind, exp_tag, model_type, now, pid),
    };

    if let Some(parent) = Path::new(&base).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                AppError::io(format!(
                    "Failed to create output directory '{}': {e}",
                    parent.display()
                ))
            })?;
        }
    }

    let (full_suffix, summary_suffix) = match kind {
        RunKind::Plain => (".netcdf", ".txt"),
        RunKind::Sensitivity { .. } => ("_full.netcdf", "_summary.json"),
    };
    Ok(OutputPaths {
        log: PathBuf::from(format!("{base}.log")),
        full: PathBuf::from(format!("{base}{full_suffix}")),
        summary: PathBuf::from(format!("{base}{summary_suffix}")),
        base,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2020, 5, 30, h, m, s).unwrap()
    }

    fn tmp_base(name: &str) -> String {
        std::env::temp_dir()
            .join(format!("epi-runs-paths-{}", std::process::id()))
            .join(name)
            .to_string_lossy()
            .into_owned()
    }

    #[test]
    fn derived_paths_share_one_prefix() {
        let kind = RunKind::Sensitivity {
            model_config_name: "default".to_string(),
        };
        let base = tmp_base("sens");
        let paths =
            plan_outputs(Some(&base), &kind, "tag", "default", &at(1, 2, 3), 77).unwrap();
        assert_eq!(paths.log, PathBuf::from(format!("{base}.log")));
        assert_eq!(paths.full, PathBuf::from(format!("{base}_full.netcdf")));
        assert_eq!(paths.summary, PathBuf::from(format!("{base}_summary.json")));
        assert_eq!(paths.sibling("_GB.json"), PathBuf::from(format!("{base}_GB.json")));
    }

    #[test]
    fn derived_base_embeds_tag_model_timestamp_and_pid() {
        let base = derive_base(&RunKind::Plain, "exp1", "seasonal", &at(13, 5, 9), 4242);
        assert_eq!(base, "runs/exp1_seasonal_2020-05-30-13:05:09_pid4242");

        let kind = RunKind::Sensitivity {
            model_config_name: "cfgA".to_string(),
        };
        let base = derive_base(&kind, "exp1", "default", &at(13, 5, 9), 4242);
        assert_eq!(
            base,
            "sensitivity_analysis/cfgA/exp1/default_2020-05-30-130509_pid4242"
        );
    }

    #[test]
    fn bases_differ_across_seconds_for_the_same_pid() {
        let a = derive_base(&RunKind::Plain, "t", "m", &at(1, 0, 0), 7);
        let b = derive_base(&RunKind::Plain, "t", "m", &at(1, 0, 1), 7);
        assert_ne!(a, b);
    }

    #[test]
    fn planning_creates_the_parent_directory() {
        let base = tmp_base("nested/deeper/run");
        let paths = plan_outputs(Some(&base), &RunKind::Plain, "t", "m", &at(0, 0, 0), 1).unwrap();
        let parent = Path::new(&paths.base).parent().unwrap();
        assert!(parent.is_dir());
        std::fs::remove_dir_all(
            std::env::temp_dir().join(format!("epi-runs-paths-{}", std::process::id())),
        )
        .unwrap();
    }

    #[test]
    fn empty_override_falls_back_to_derivation() {
        let paths = plan_outputs(
            Some(""),
            &RunKind::Plain,
            "tag",
            "default",
            &at(2, 2, 2),
            9,
        )
        .unwrap();
        assert!(paths.base.starts_with("runs/tag_default_"));
        // Best-effort cleanup of the created `runs/` directory.
        let _ = std::fs::remove_dir("runs");
    }
}
