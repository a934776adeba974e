//! Run logging: a tee of diagnostic output to stdout and a per-run log file.
//!
//! The original drivers redirected the process's stdout/stderr file
//! descriptors into a `tee` subprocess. That is ambient, irreversible global
//! state; here it becomes an explicit handle acquired once at startup. All
//! pipeline diagnostics go through [`RunLog::line`], which writes to the real
//! stdout and, unless logging is disabled, appends to the log file.
//!
//! The handle must be attached before any diagnostic output is produced,
//! otherwise early lines are missing from the log file. It is never detached;
//! it lives until process exit.

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use crate::error::AppError;

/// Tee'd diagnostic output for one run.
///
/// Cloneable handles are not needed: the pipeline passes `&RunLog` down, and
/// the file is behind a mutex so parallel sampler chains can report progress.
pub struct RunLog {
    file: Option<Mutex<File>>,
}

impl RunLog {
    /// Attach the run log. When `path` is `None` (no-log mode), lines go to
    /// stdout only.
    pub fn attach(path: Option<&Path>) -> Result<RunLog, AppError> {
        let file = match path {
            Some(p) => {
                let f = File::create(p).map_err(|e| {
                    AppError::io(format!("Failed to create log file '{}': {e}", p.display()))
                })?;
                Some(Mutex::new(f))
            }
            None => None,
        };
        Ok(RunLog { file })
    }

    /// A log that only prints to stdout. Used by tests and no-log runs.
    pub fn disabled() -> RunLog {
        RunLog { file: None }
    }

    /// Write one diagnostic line to stdout and the log file.
    pub fn line(&self, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        println!("{msg}");
        if let Some(file) = &self.file {
            // A poisoned mutex means another chain panicked mid-write; the
            // run is doomed anyway, so drop the log line rather than panic.
            if let Ok(mut f) = file.lock() {
                let _ = writeln!(f, "{msg}");
            }
        }
    }

    /// Whether a log file is attached.
    pub fn is_attached(&self) -> bool {
        self.file.is_some()
    }
}
