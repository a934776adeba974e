//! Line-oriented NPI-effect trace files.
//!
//! Leave-out and holdout runs persist the `CMReduction` samples as plain
//! text: one line per posterior sample, per-NPI values space-separated. These
//! files feed downstream plotting scripts that predate the JSON summary.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::AppError;
use crate::sampler::SampleArray;

/// Write one line per `(chain, draw)` sample of a trace variable.
pub fn write_cm_trace(path: &Path, arr: &SampleArray) -> Result<(), AppError> {
    let file = File::create(path).map_err(|e| {
        AppError::io(format!("Failed to create CM trace '{}': {e}", path.display()))
    })?;
    let mut out = BufWriter::new(file);
    let chains = arr.shape[0];
    let draws = arr.shape[1];
    for c in 0..chains {
        for d in 0..draws {
            let mut line = String::new();
            for k in 0..arr.entity_len() {
                if k > 0 {
                    line.push(' ');
                }
                line.push_str(&format!("{:.6}", arr.at(c, d, k)));
            }
            writeln!(out, "{line}").map_err(|e| {
                AppError::io(format!("Failed to write CM trace '{}': {e}", path.display()))
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_line_per_sample_with_per_npi_columns() {
        let arr = SampleArray::new(
            vec!["chain".to_string(), "draw".to_string(), "CM".to_string()],
            vec![2, 2, 2],
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0],
        );
        let dir = std::env::temp_dir().join(format!("epi-runs-cmtrace-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("01.txt");
        write_cm_trace(&path, &arr).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "1.000000 2.000000");
        assert_eq!(lines[3], "7.000000 8.000000");
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
