//! NPI dataset: regions × NPIs × days plus observed case/death counts.
//!
//! The on-disk form is a JSON document:
//!
//! ```json
//! {
//!   "regions": ["GB", "DE"],
//!   "days": ["2020-03-01", "2020-03-02"],
//!   "cm_names": ["School Closure"],
//!   "active_cms": [[[0, 1]], [[1, 1]]],
//!   "new_cases": [[120, 140], [80, null]],
//!   "new_deaths": [[3, 4], [1, 2]]
//! }
//! ```
//!
//! `active_cms` is indexed `[region][npi][day]`; `null` observations are
//! missing data and are excluded from the likelihood. Leave-out drivers mutate
//! the dataset in place (zero an NPI column, mask a region) before model
//! construction; after that the dataset is consumed and never written back.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::Deserialize;

use crate::error::AppError;

#[derive(Debug, Deserialize)]
struct RawDataset {
    regions: Vec<String>,
    days: Vec<String>,
    cm_names: Vec<String>,
    active_cms: Vec<Vec<Vec<f64>>>,
    new_cases: Vec<Vec<Option<f64>>>,
    new_deaths: Vec<Vec<Option<f64>>>,
}

/// In-memory dataset. Observation matrices are flat row-major arrays with
/// `f64::NAN` marking masked or missing entries.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub regions: Vec<String>,
    pub days: Vec<String>,
    pub cm_names: Vec<String>,
    /// `[region][npi][day]`, flattened.
    pub active_cms: Vec<f64>,
    /// `[region][day]`, flattened. NaN = masked/missing.
    pub new_cases: Vec<f64>,
    /// `[region][day]`, flattened. NaN = masked/missing.
    pub new_deaths: Vec<f64>,
}

impl Dataset {
    pub fn n_regions(&self) -> usize {
        self.regions.len()
    }

    pub fn n_cms(&self) -> usize {
        self.cm_names.len()
    }

    pub fn n_days(&self) -> usize {
        self.days.len()
    }

    pub fn active_cm(&self, r: usize, i: usize, d: usize) -> f64 {
        self.active_cms[(r * self.n_cms() + i) * self.n_days() + d]
    }

    pub fn cases(&self, r: usize, d: usize) -> f64 {
        self.new_cases[r * self.n_days() + d]
    }

    pub fn deaths(&self, r: usize, d: usize) -> f64 {
        self.new_deaths[r * self.n_days() + d]
    }

    /// Zero out one NPI column across all regions and days.
    pub fn zero_npi(&mut self, npi: usize) -> Result<(), AppError> {
        if npi >= self.n_cms() {
            return Err(AppError::config(format!(
                "NPI index {npi} out of range (dataset has {} NPIs)",
                self.n_cms()
            )));
        }
        let (n_cms, n_days) = (self.n_cms(), self.n_days());
        for r in 0..self.n_regions() {
            let base = (r * n_cms + npi) * n_days;
            for d in 0..n_days {
                self.active_cms[base + d] = 0.0;
            }
        }
        Ok(())
    }

    /// Mask one region's observations (it stays in the region axis so its
    /// posterior slice can still be evaluated against held-out data).
    /// Returns the region's index.
    pub fn mask_region(&mut self, code: &str) -> Result<usize, AppError> {
        let Some(r) = self.regions.iter().position(|c| c == code) else {
            return Err(AppError::config(format!(
                "Region '{code}' not present in dataset"
            )));
        };
        let n_days = self.n_days();
        for d in 0..n_days {
            self.new_cases[r * n_days + d] = f64::NAN;
            self.new_deaths[r * n_days + d] = f64::NAN;
        }
        Ok(r)
    }

    /// Mask observations from the first day any NPI is lifted in a region.
    ///
    /// Reopenings are not modeled; data after them would bias the NPI effect
    /// estimates downward.
    pub fn mask_reopenings(&mut self) {
        let (n_cms, n_days) = (self.n_cms(), self.n_days());
        for r in 0..self.n_regions() {
            let mut first_lift = None;
            'scan: for d in 1..n_days {
                for i in 0..n_cms {
                    let prev = self.active_cms[(r * n_cms + i) * n_days + d - 1];
                    let cur = self.active_cms[(r * n_cms + i) * n_days + d];
                    if prev > 0.0 && cur == 0.0 {
                        first_lift = Some(d);
                        break 'scan;
                    }
                }
            }
            if let Some(d0) = first_lift {
                for d in d0..n_days {
                    self.new_cases[r * n_days + d] = f64::NAN;
                    self.new_deaths[r * n_days + d] = f64::NAN;
                }
            }
        }
    }

    /// Drop regions whose total recorded deaths fall below `min_deaths`.
    /// Used by deaths-only model variants.
    pub fn remove_regions_min_deaths(&mut self, min_deaths: f64) {
        let n_days = self.n_days();
        let n_cms = self.n_cms();
        let keep: Vec<usize> = (0..self.n_regions())
            .filter(|&r| {
                let total: f64 = (0..n_days)
                    .map(|d| self.new_deaths[r * n_days + d])
                    .filter(|v| v.is_finite())
                    .sum();
                total >= min_deaths
            })
            .collect();
        if keep.len() == self.n_regions() {
            return;
        }

        let mut regions = Vec::with_capacity(keep.len());
        let mut active_cms = Vec::with_capacity(keep.len() * n_cms * n_days);
        let mut new_cases = Vec::with_capacity(keep.len() * n_days);
        let mut new_deaths = Vec::with_capacity(keep.len() * n_days);
        for &r in &keep {
            regions.push(self.regions[r].clone());
            active_cms
                .extend_from_slice(&self.active_cms[r * n_cms * n_days..(r + 1) * n_cms * n_days]);
            new_cases.extend_from_slice(&self.new_cases[r * n_days..(r + 1) * n_days]);
            new_deaths.extend_from_slice(&self.new_deaths[r * n_days..(r + 1) * n_days]);
        }
        self.regions = regions;
        self.active_cms = active_cms;
        self.new_cases = new_cases;
        self.new_deaths = new_deaths;
    }

    /// Truncate the day axis to days `<= last_day` (ISO date labels compare
    /// lexicographically).
    fn truncate_to_last_day(&mut self, last_day: &str) -> Result<(), AppError> {
        let n_keep = self.days.iter().filter(|d| d.as_str() <= last_day).count();
        if n_keep == 0 {
            return Err(AppError::config(format!(
                "--last_day {last_day} precedes the dataset's first day"
            )));
        }
        if n_keep == self.n_days() {
            return Ok(());
        }
        let (n_cms, n_days) = (self.n_cms(), self.n_days());
        let mut active_cms = Vec::with_capacity(self.n_regions() * n_cms * n_keep);
        let mut new_cases = Vec::with_capacity(self.n_regions() * n_keep);
        let mut new_deaths = Vec::with_capacity(self.n_regions() * n_keep);
        for r in 0..self.n_regions() {
            for i in 0..n_cms {
                let base = (r * n_cms + i) * n_days;
                active_cms.extend_from_slice(&self.active_cms[base..base + n_keep]);
            }
            new_cases.extend_from_slice(&self.new_cases[r * n_days..r * n_days + n_keep]);
            new_deaths.extend_from_slice(&self.new_deaths[r * n_days..r * n_days + n_keep]);
        }
        self.days.truncate(n_keep);
        self.active_cms = active_cms;
        self.new_cases = new_cases;
        self.new_deaths = new_deaths;
        Ok(())
    }
}

/// Load and validate a dataset, optionally truncating the day range.
pub fn preprocess_data(path: &Path, last_day: Option<&str>) -> Result<Dataset, AppError> {
    let file = File::open(path)
        .map_err(|e| AppError::io(format!("Failed to open dataset '{}': {e}", path.display())))?;
    let raw: RawDataset = serde_json::from_reader(BufReader::new(file))
        .map_err(|e| AppError::io(format!("Invalid dataset '{}': {e}", path.display())))?;
    let mut data = validate(raw, path)?;
    if let Some(last_day) = last_day {
        data.truncate_to_last_day(last_day)?;
    }
    Ok(data)
}

fn validate(raw: RawDataset, path: &Path) -> Result<Dataset, AppError> {
    let n_r = raw.regions.len();
    let n_c = raw.cm_names.len();
    let n_d = raw.days.len();
    let shape_err = |what: &str| {
        AppError::io(format!(
            "Dataset '{}': {what} does not match regions={n_r} x NPIs={n_c} x days={n_d}",
            path.display()
        ))
    };

    if n_r == 0 || n_d == 0 {
        return Err(AppError::io(format!(
            "Dataset '{}' has no regions or no days",
            path.display()
        )));
    }
    if raw.active_cms.len() != n_r || raw.new_cases.len() != n_r || raw.new_deaths.len() != n_r {
        return Err(shape_err("region axis"));
    }

    let mut active_cms = Vec::with_capacity(n_r * n_c * n_d);
    for per_region in &raw.active_cms {
        if per_region.len() != n_c {
            return Err(shape_err("active_cms NPI axis"));
        }
        for per_cm in per_region {
            if per_cm.len() != n_d {
                return Err(shape_err("active_cms day axis"));
            }
            active_cms.extend_from_slice(per_cm);
        }
    }

    let flatten_obs = |rows: &[Vec<Option<f64>>], what: &str| -> Result<Vec<f64>, AppError> {
        let mut out = Vec::with_capacity(n_r * n_d);
        for row in rows {
            if row.len() != n_d {
                return Err(shape_err(what));
            }
            out.extend(row.iter().map(|v| v.unwrap_or(f64::NAN)));
        }
        Ok(out)
    };
    let new_cases = flatten_obs(&raw.new_cases, "new_cases day axis")?;
    let new_deaths = flatten_obs(&raw.new_deaths, "new_deaths day axis")?;

    Ok(Dataset {
        regions: raw.regions,
        days: raw.days,
        cm_names: raw.cm_names,
        active_cms,
        new_cases,
        new_deaths,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A tiny 2-region, 3-day, 1-NPI dataset shared by tests across modules.
    pub(crate) fn synthetic() -> Dataset {
        Dataset {
            regions: vec!["GB".to_string(), "DE".to_string()],
            days: vec![
                "2020-03-01".to_string(),
                "2020-03-02".to_string(),
                "2020-03-03".to_string(),
            ],
            cm_names: vec!["School Closure".to_string()],
            active_cms: vec![
                0.0, 1.0, 1.0, // GB
                0.0, 0.0, 1.0, // DE
            ],
            new_cases: vec![100.0, 130.0, 150.0, 80.0, 110.0, 140.0],
            new_deaths: vec![5.0, 6.0, 8.0, 3.0, 4.0, 6.0],
        }
    }

    #[test]
    fn truncate_keeps_days_up_to_last_day() {
        let mut data = synthetic();
        data.truncate_to_last_day("2020-03-02").unwrap();
        assert_eq!(data.n_days(), 2);
        assert_eq!(data.active_cm(0, 0, 1), 1.0);
        assert_eq!(data.cases(1, 1), 110.0);
    }

    #[test]
    fn truncate_before_first_day_is_an_error() {
        let mut data = synthetic();
        assert!(data.truncate_to_last_day("2020-02-01").is_err());
    }

    #[test]
    fn zero_npi_clears_the_column_everywhere() {
        let mut data = synthetic();
        data.zero_npi(0).unwrap();
        assert!(data.active_cms.iter().all(|&v| v == 0.0));
        assert!(data.zero_npi(1).is_err());
    }

    #[test]
    fn mask_region_keeps_the_region_axis() {
        let mut data = synthetic();
        let idx = data.mask_region("DE").unwrap();
        assert_eq!(idx, 1);
        assert_eq!(data.n_regions(), 2);
        assert!(data.cases(1, 0).is_nan());
        assert!(data.deaths(1, 2).is_nan());
        assert!(data.cases(0, 0).is_finite());
        assert!(data.mask_region("XX").is_err());
    }

    #[test]
    fn mask_reopenings_masks_from_first_lift() {
        let mut data = synthetic();
        // GB lifts its NPI on day 2.
        data.active_cms[2] = 0.0;
        data.mask_reopenings();
        assert!(data.cases(0, 2).is_nan());
        assert!(data.cases(0, 1).is_finite());
        // DE never lifts anything.
        assert!(data.cases(1, 2).is_finite());
    }

    #[test]
    fn remove_regions_min_deaths_drops_sparse_regions() {
        let mut data = synthetic();
        data.remove_regions_min_deaths(15.0);
        assert_eq!(data.regions, vec!["GB".to_string()]);
        assert_eq!(data.new_cases.len(), 3);
        assert_eq!(data.active_cms.len(), 3);
    }

    #[test]
    fn loader_roundtrips_json_with_nulls() {
        let json = r#"{
            "regions": ["GB"],
            "days": ["2020-03-01", "2020-03-02"],
            "cm_names": ["Masks"],
            "active_cms": [[[0, 1]]],
            "new_cases": [[10, null]],
            "new_deaths": [[0, 1]]
        }"#;
        let dir = std::env::temp_dir().join(format!("epi-runs-data-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("tiny.json");
        std::fs::write(&path, json).unwrap();

        let data = preprocess_data(&path, None).unwrap();
        assert_eq!(data.n_regions(), 1);
        assert_eq!(data.cases(0, 0), 10.0);
        assert!(data.cases(0, 1).is_nan());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
