//! Linear coupling amplitude |f1001| from the harmonic secondary lines.
//!
//! The horizontal spectrum at a sensor carries a line at the vertical tune
//! (`AMP01`) and the vertical spectrum one at the horizontal tune (`AMP10`).
//! To first order
//!
//! ```text
//! |f1001| = ½ √(AMP01 · AMP10)
//! ```
//!
//! with the uncertainty propagated from `ERRAMP01` / `ERRAMP10`. Sensors that
//! the harmonic analysis dropped on either plane carry no value, never a
//! placeholder.

use crate::error::{Result, SomaError};
use crate::paths;
use crate::tfs::TfsTable;
use crate::types::Axis;
use std::collections::HashMap;
use std::path::Path;

pub const F1001_FILE: &str = "f1001.tfs";
const AMP_COL: &str = "|F1001|";
const ERR_COL: &str = "ERR|F1001|";
const STD_COL: &str = "STD|F1001|";

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CouplingSample {
    pub amplitude: Option<f64>,
    pub error: Option<f64>,
}

/// `(|f1001|, error)` from the two secondary lines and their errors.
pub fn f1001(amp_h: f64, err_h: f64, amp_v: f64, err_v: f64) -> (f64, f64) {
    let a = amp_h * amp_v;
    let amplitude = 0.5 * a.sqrt();
    let error = ((err_h * amp_v).powi(2) / (16.0 * a) + (err_v * amp_h).powi(2) / (16.0 * a)).sqrt();
    (amplitude, error)
}

impl CouplingSample {
    pub fn from_lines(amp_h: f64, err_h: f64, amp_v: f64, err_v: f64) -> Self {
        let (amplitude, error) = f1001(amp_h, err_h, amp_v, err_v);
        Self {
            amplitude: amplitude.is_finite().then_some(amplitude),
            error: error.is_finite().then_some(error),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-run estimate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct CouplingEstimate {
    pub run: String,
    pub sensors: Vec<(String, CouplingSample)>,
}

/// Sensor names of a converted file: data lines whose plane field is `0`.
pub fn read_bpms(sdds: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(sdds).map_err(|_| SomaError::MissingInput {
        stage: "coupling".to_string(),
        path: sdds.to_path_buf(),
    })?;
    Ok(text
        .lines()
        .filter(|l| !l.starts_with('#') && l.starts_with('0'))
        .filter_map(|l| l.split_whitespace().nth(1).map(str::to_string))
        .collect())
}

fn read_line(path: &Path, amp: &str, err: &str) -> Result<HashMap<String, (f64, f64)>> {
    if !path.is_file() {
        return Err(SomaError::MissingInput {
            stage: "coupling".to_string(),
            path: path.to_path_buf(),
        });
    }
    let table = TfsTable::read(path)?;
    let names = table.str_column("NAME")?;
    let amps = table.f64_column(amp)?;
    let errs = table.f64_column(err)?;
    Ok(names
        .into_iter()
        .zip(amps.into_iter().zip(errs))
        .map(|(n, v)| (n.to_string(), v))
        .collect())
}

impl CouplingEstimate {
    /// Estimate every sensor in `bpms` from the run's `linx`/`liny` tables.
    pub fn from_harmonic(harmonic: &Path, run: &str, bpms: &[String]) -> Result<Self> {
        let h = read_line(&paths::lin_file(harmonic, run, Axis::X), "AMP01", "ERRAMP01")?;
        let v = read_line(&paths::lin_file(harmonic, run, Axis::Y), "AMP10", "ERRAMP10")?;
        let sensors = bpms
            .iter()
            .map(|bpm| {
                let sample = match (h.get(bpm), v.get(bpm)) {
                    (Some(&(ah, eh)), Some(&(av, ev))) => CouplingSample::from_lines(ah, eh, av, ev),
                    _ => CouplingSample::default(),
                };
                (bpm.clone(), sample)
            })
            .collect();
        Ok(Self {
            run: run.to_string(),
            sensors,
        })
    }

    pub fn sample(&self, sensor: &str) -> Option<CouplingSample> {
        self.sensors
            .iter()
            .find(|(n, _)| n == sensor)
            .map(|(_, s)| *s)
    }

    pub fn to_table(&self) -> TfsTable {
        let mut t = TfsTable::new(&[("NAME", "%s"), (AMP_COL, "%le"), (ERR_COL, "%le")]);
        for (name, s) in &self.sensors {
            t.push_row(vec![name.clone(), render(s.amplitude), render(s.error)]);
        }
        t
    }

    pub fn read(path: &Path, run: &str) -> Result<Self> {
        let table = TfsTable::read(path)?;
        let names = table.str_column("NAME")?;
        let amps = table.f64_column(AMP_COL)?;
        let errs = table.f64_column(ERR_COL)?;
        let sensors = names
            .into_iter()
            .zip(amps.into_iter().zip(errs))
            .map(|(n, (a, e))| {
                let sample = CouplingSample {
                    amplitude: present(a),
                    error: present(e),
                };
                (n.to_string(), sample)
            })
            .collect();
        Ok(Self {
            run: run.to_string(),
            sensors,
        })
    }
}

fn render(v: Option<f64>) -> String {
    v.map(|x| x.to_string()).unwrap_or_else(|| "NaN".to_string())
}

fn present(v: f64) -> Option<f64> {
    (!v.is_nan()).then_some(v)
}

// ---------------------------------------------------------------------------
// Across runs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct SensorAverage {
    pub name: String,
    pub mean: Option<f64>,
    /// Sample standard deviation; needs at least two runs.
    pub std: Option<f64>,
    pub samples: usize,
}

/// Per-sensor mean and sample standard deviation of |f1001| over runs,
/// skipping absent values. Sensor order is order of first appearance.
pub fn average(estimates: &[CouplingEstimate]) -> Vec<SensorAverage> {
    let mut order: Vec<&str> = Vec::new();
    let mut values: HashMap<&str, Vec<f64>> = HashMap::new();
    for est in estimates {
        for (name, s) in &est.sensors {
            let entry = values.entry(name.as_str()).or_insert_with(|| {
                order.push(name.as_str());
                Vec::new()
            });
            if let Some(a) = s.amplitude {
                entry.push(a);
            }
        }
    }
    order
        .into_iter()
        .map(|name| {
            let v = &values[name];
            let n = v.len();
            let mean = (n > 0).then(|| v.iter().sum::<f64>() / n as f64);
            let std = match mean {
                Some(m) if n > 1 => {
                    Some((v.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (n - 1) as f64).sqrt())
                }
                _ => None,
            };
            SensorAverage {
                name: name.to_string(),
                mean,
                std,
                samples: n,
            }
        })
        .collect()
}

pub fn average_table(avg: &[SensorAverage]) -> TfsTable {
    let mut t = TfsTable::new(&[("NAME", "%s"), (AMP_COL, "%le"), (STD_COL, "%le"), ("NRUNS", "%d")]);
    for s in avg {
        t.push_row(vec![
            s.name.clone(),
            render(s.mean),
            render(s.std),
            s.samples.to_string(),
        ]);
    }
    t
}

// ---------------------------------------------------------------------------
// Stage entry point
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct CouplingSummary {
    pub runs: usize,
    pub failed: Vec<String>,
}

/// Write `<optics>/<run>/f1001.tfs` for every converted run, and the
/// cross-run average to `<optics>/average/f1001.tfs` when `all_files` is set.
pub fn analyse(sdds_dir: &Path, harmonic: &Path, optics: &Path, all_files: bool) -> Result<CouplingSummary> {
    let runs = paths::converted_files(sdds_dir)?;
    if runs.is_empty() {
        return Err(SomaError::MissingInput {
            stage: "coupling".to_string(),
            path: sdds_dir.to_path_buf(),
        });
    }
    let mut summary = CouplingSummary::default();
    let mut estimates = Vec::new();
    for run in &runs {
        let estimate = read_bpms(&sdds_dir.join(run))
            .and_then(|bpms| CouplingEstimate::from_harmonic(harmonic, run, &bpms));
        match estimate {
            Ok(est) => {
                est.to_table().write(&optics.join(run).join(F1001_FILE))?;
                estimates.push(est);
                summary.runs += 1;
            }
            Err(e) => {
                tracing::warn!(run = run.as_str(), "coupling skipped: {e}");
                summary.failed.push(run.clone());
            }
        }
    }
    if all_files {
        let avg = average(&estimates);
        average_table(&avg).write(&paths::average_dir(optics).join(F1001_FILE))?;
    }
    tracing::info!(runs = summary.runs, failed = summary.failed.len(), "coupling estimated");
    Ok(summary)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
