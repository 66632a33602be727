//! BPM amplitude calibration.
//!
//! The optics tool measures β twice: from phase advances (insensitive to BPM
//! gain) and from oscillation amplitudes (scaled by the gain squared). Their
//! ratio per sensor is the calibration factor
//!
//! ```text
//! factor = beta_amp / beta_phase
//! ```
//!
//! and since the amplitude goes with √β, a calibrated amplitude is
//! `amp / √factor`. The calibrate stage applies this to every synched `lin`
//! file and writes the result, with all other harmonic files, to
//! `calibrated_harmonic/`.

use crate::config::Parameters;
use crate::error::{Result, SomaError};
use crate::paths;
use crate::tfs::TfsTable;
use crate::types::Axis;
use std::collections::{HashMap, HashSet};
use std::path::Path;

#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationRecord {
    pub axis: Axis,
    /// Sensor and factor, in phase-table order.
    pub factors: Vec<(String, f64)>,
    /// Sensors left uncorrected: missing from one table or with an unusable β.
    pub excluded: Vec<String>,
}

impl CalibrationRecord {
    /// Pair the two β tables of `axis` found in `dir`.
    pub fn estimate(dir: &Path, axis: Axis) -> Result<Self> {
        let phase = read_beta(&dir.join(format!("beta_phase_{}.tfs", axis.as_str())), axis)?;
        let amp = read_beta(&dir.join(format!("beta_amplitude_{}.tfs", axis.as_str())), axis)?;
        Ok(Self::from_betas(axis, &phase, &amp))
    }

    pub fn from_betas(axis: Axis, phase: &[(String, f64)], amp: &[(String, f64)]) -> Self {
        let amp_by_name: HashMap<&str, f64> = amp.iter().map(|(n, b)| (n.as_str(), *b)).collect();
        let phase_names: HashSet<&str> = phase.iter().map(|(n, _)| n.as_str()).collect();

        let mut factors = Vec::new();
        let mut excluded = Vec::new();
        for (name, beta_phase) in phase {
            match amp_by_name.get(name.as_str()) {
                Some(beta_amp) if usable(*beta_phase) && usable(*beta_amp) => {
                    factors.push((name.clone(), beta_amp / beta_phase));
                }
                _ => excluded.push(name.clone()),
            }
        }
        excluded.extend(
            amp.iter()
                .filter(|(n, _)| !phase_names.contains(n.as_str()))
                .map(|(n, _)| n.clone()),
        );
        Self {
            axis,
            factors,
            excluded,
        }
    }

    pub fn factor(&self, sensor: &str) -> Option<f64> {
        self.factors
            .iter()
            .find(|(n, _)| n == sensor)
            .map(|(_, f)| *f)
    }

    /// Rescale the `AMP<PL>` column of a harmonic `lin` table in place.
    /// Returns how many rows were corrected.
    pub fn apply(&self, lin: &mut TfsTable) -> Result<usize> {
        let amp_col = format!("AMP{}", self.axis.upper());
        let source = lin.source().to_path_buf();
        let name_idx = lin.column_index("NAME").ok_or_else(|| SomaError::MalformedTable {
            path: source.clone(),
            reason: "missing column 'NAME'".to_string(),
        })?;
        let amp_idx = lin.column_index(&amp_col).ok_or_else(|| SomaError::MalformedTable {
            path: source.clone(),
            reason: format!("missing column '{amp_col}'"),
        })?;

        let mut corrected = 0;
        for row in &mut lin.rows {
            let Some(factor) = self.factor(&row[name_idx]) else {
                continue;
            };
            let amp: f64 = row[amp_idx].parse().map_err(|_| SomaError::MalformedTable {
                path: source.clone(),
                reason: format!("{amp_col} of {} is not a number", row[name_idx]),
            })?;
            row[amp_idx] = (amp / factor.sqrt()).to_string();
            corrected += 1;
        }
        Ok(corrected)
    }

    /// Factors as a TFS table (`NAME`, `CALIBRATION`).
    pub fn to_table(&self) -> TfsTable {
        let mut t = TfsTable::new(&[("NAME", "%s"), ("CALIBRATION", "%le")]);
        t.push_header("PLANE", "%s", self.axis.upper());
        t.push_header("EXCLUDED", "%d", self.excluded.len().to_string());
        for (name, f) in &self.factors {
            t.push_row(vec![name.clone(), f.to_string()]);
        }
        t
    }
}

fn usable(beta: f64) -> bool {
    beta.is_finite() && beta > 0.0
}

fn read_beta(path: &Path, axis: Axis) -> Result<Vec<(String, f64)>> {
    if !path.is_file() {
        return Err(SomaError::MissingInput {
            stage: "calibrate".to_string(),
            path: path.to_path_buf(),
        });
    }
    let table = TfsTable::read(path)?;
    let names = table.str_column("NAME")?;
    let betas = table.f64_column(&format!("BET{}", axis.upper()))?;
    Ok(names.into_iter().map(str::to_string).zip(betas).collect())
}

// ---------------------------------------------------------------------------
// Stage entry point
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct CalibrationSummary {
    pub runs: usize,
    pub corrected: usize,
    pub excluded: usize,
    /// `<run> (<axis>)` for every plane copied through uncalibrated.
    pub failed: Vec<String>,
}

fn has_betas(dir: &Path, axis: Axis) -> bool {
    ["beta_phase", "beta_amplitude"]
        .iter()
        .all(|kind| dir.join(format!("{kind}_{}.tfs", axis.as_str())).is_file())
}

/// Calibrate every synched harmonic run into `calibrated_harmonic/`.
///
/// Factors come from the run's own synched optics directory when it holds
/// the β tables, otherwise from the averaged optics. A plane with neither is
/// copied through uncalibrated and reported as failed.
pub fn calibrate_all(params: &Parameters) -> Result<CalibrationSummary> {
    let main = &params.main_output_path;
    let harmonic = main.join(paths::SYNCHED_HARMONIC_DIR);
    let optics = main.join(paths::SYNCHED_OPTICS_DIR);
    let average_dir = paths::average_dir(&optics);
    let output = main.join(paths::CALIBRATED_HARMONIC_DIR);

    let runs = paths::harmonic_runs(&harmonic)?;
    if runs.is_empty() {
        return Err(SomaError::MissingInput {
            stage: "calibrate".to_string(),
            path: harmonic,
        });
    }
    crate::io::ensure_dir(&output)?;

    let mut summary = CalibrationSummary::default();
    let mut average: HashMap<Axis, CalibrationRecord> = HashMap::new();
    for run in &runs {
        let run_dir = optics.join(run);
        for axis in Axis::all() {
            let src = paths::lin_file(&harmonic, run, *axis);
            let dst = paths::lin_file(&output, run, *axis);

            let record = if has_betas(&run_dir, *axis) {
                CalibrationRecord::estimate(&run_dir, *axis)?
            } else if let Some(r) = average.get(axis) {
                r.clone()
            } else if has_betas(&average_dir, *axis) {
                let r = CalibrationRecord::estimate(&average_dir, *axis)?;
                average.insert(*axis, r.clone());
                r
            } else {
                tracing::warn!(
                    run = run.as_str(),
                    axis = axis.as_str(),
                    dir = %run_dir.display(),
                    "no beta tables, copying amplitudes uncalibrated"
                );
                std::fs::copy(&src, &dst)?;
                summary.failed.push(format!("{run} ({})", axis.as_str()));
                continue;
            };

            let mut lin = TfsTable::read(&src)?;
            let corrected = record.apply(&mut lin)?;
            lin.write(&dst)?;
            record
                .to_table()
                .write(&output.join(format!("{run}.calibration{}", axis.as_str())))?;

            if !record.excluded.is_empty() {
                tracing::warn!(
                    run = run.as_str(),
                    axis = axis.as_str(),
                    excluded = record.excluded.len(),
                    "sensors left uncalibrated"
                );
            }
            summary.corrected += corrected;
            summary.excluded += record.excluded.len();
        }
        copy_other_outputs(&harmonic, &output, run)?;
        summary.runs += 1;
    }
    tracing::info!(
        runs = summary.runs,
        corrected = summary.corrected,
        excluded = summary.excluded,
        failed = summary.failed.len(),
        "calibration applied"
    );
    Ok(summary)
}

/// Carry the run's remaining harmonic files over unchanged.
fn copy_other_outputs(from: &Path, to: &Path, run: &str) -> Result<()> {
    let prefix = format!("{run}.");
    for name in crate::io::list_names(from)? {
        let is_lin = Axis::all()
            .iter()
            .any(|a| name == format!("{run}.lin{}", a.as_str()));
        if name.starts_with(&prefix) && !is_lin {
            std::fs::copy(from.join(&name), to.join(&name))?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{params_in, write_table};
    use tempfile::TempDir;

    fn pairs(v: &[(&str, f64)]) -> Vec<(String, f64)> {
        v.iter().map(|(n, b)| (n.to_string(), *b)).collect()
    }

    #[test]
    fn factor_is_amp_over_phase() {
        let r = CalibrationRecord::from_betas(
            Axis::X,
            &pairs(&[("BPM1", 10.0), ("BPM2", 20.0), ("BPM3", 5.0)]),
            &pairs(&[("BPM1", 12.1), ("BPM2", 20.0), ("BPM4", 7.0)]),
        );
        assert!((r.factor("BPM1").unwrap() - 1.21).abs() < 1e-12);
        assert_eq!(r.factor("BPM2"), Some(1.0));
        assert_eq!(r.excluded, vec!["BPM3", "BPM4"]);
    }

    #[test]
    fn bad_betas_are_excluded() {
        let r = CalibrationRecord::from_betas(
            Axis::Y,
            &pairs(&[("BPM1", 0.0), ("BPM2", f64::NAN)]),
            &pairs(&[("BPM1", 1.0), ("BPM2", 1.0)]),
        );
        assert!(r.factors.is_empty());
        assert_eq!(r.excluded.len(), 2);
    }

    #[test]
    fn calibrate_rescales_amplitude() {
        let dir = TempDir::new().unwrap();
        let params = params_in(dir.path());
        let main = &params.main_output_path;
        let harmonic = main.join(paths::SYNCHED_HARMONIC_DIR);
        let optics = main.join(paths::SYNCHED_OPTICS_DIR).join("HER_1.sdds");

        write_table(&optics.join("beta_phase_x.tfs"), &["NAME", "BETX"], &[&["BPM1", "10.0"], &["BPM2", "4.0"]]);
        write_table(&optics.join("beta_amplitude_x.tfs"), &["NAME", "BETX"], &[&["BPM1", "12.1"]]);
        write_table(&optics.join("beta_phase_y.tfs"), &["NAME", "BETY"], &[&["BPM1", "3.0"]]);
        write_table(&optics.join("beta_amplitude_y.tfs"), &["NAME", "BETY"], &[&["BPM1", "3.0"]]);
        write_table(
            &harmonic.join("HER_1.sdds.linx"),
            &["NAME", "AMPX", "AMP01"],
            &[&["BPM1", "2.2", "0.1"], &["BPM2", "1.0", "0.2"]],
        );
        write_table(&harmonic.join("HER_1.sdds.liny"), &["NAME", "AMPY"], &[&["BPM1", "1.5"]]);
        std::fs::write(harmonic.join("HER_1.sdds.ampsx"), b"spectrum").unwrap();

        let summary = calibrate_all(&params).unwrap();
        assert_eq!(summary.runs, 1);
        assert_eq!(summary.corrected, 2);
        assert_eq!(summary.excluded, 1);

        let out = main.join(paths::CALIBRATED_HARMONIC_DIR);
        let linx = TfsTable::read(&out.join("HER_1.sdds.linx")).unwrap();
        let amps = linx.f64_column("AMPX").unwrap();
        assert!((amps[0] - 2.0).abs() < 1e-12);
        assert_eq!(amps[1], 1.0);
        assert_eq!(linx.f64_column("AMP01").unwrap(), vec![0.1, 0.2]);
        assert_eq!(std::fs::read(out.join("HER_1.sdds.ampsx")).unwrap(), b"spectrum");
    }

    fn write_betas(dir: &Path, phase: &str, amp: &str) {
        for (axis, col) in [("x", "BETX"), ("y", "BETY")] {
            write_table(&dir.join(format!("beta_phase_{axis}.tfs")), &["NAME", col], &[&["BPM1", phase]]);
            write_table(&dir.join(format!("beta_amplitude_{axis}.tfs")), &["NAME", col], &[&["BPM1", amp]]);
        }
    }

    fn write_lins(harmonic: &Path, run: &str) {
        write_table(&harmonic.join(format!("{run}.linx")), &["NAME", "AMPX"], &[&["BPM1", "2.0"]]);
        write_table(&harmonic.join(format!("{run}.liny")), &["NAME", "AMPY"], &[&["BPM1", "2.0"]]);
    }

    #[test]
    fn run_dir_without_betas_falls_back_to_average() {
        let dir = TempDir::new().unwrap();
        let params = params_in(dir.path());
        let main = &params.main_output_path;
        let harmonic = main.join(paths::SYNCHED_HARMONIC_DIR);
        let optics = main.join(paths::SYNCHED_OPTICS_DIR);

        write_lins(&harmonic, "HER_1.sdds");
        // Per-run coupling output only, as written in all-files mode.
        write_table(&optics.join("HER_1.sdds/f1001.tfs"), &["NAME", "|F1001|"], &[&["BPM1", "3.0"]]);
        write_betas(&paths::average_dir(&optics), "1.0", "4.0");

        let summary = calibrate_all(&params).unwrap();
        assert!(summary.failed.is_empty());
        assert_eq!(summary.corrected, 2);
        let out = main.join(paths::CALIBRATED_HARMONIC_DIR);
        let linx = TfsTable::read(&out.join("HER_1.sdds.linx")).unwrap();
        assert_eq!(linx.f64_column("AMPX").unwrap(), vec![1.0]);
    }

    #[test]
    fn run_without_optics_is_copied_and_reported() {
        let dir = TempDir::new().unwrap();
        let params = params_in(dir.path());
        let main = &params.main_output_path;
        let harmonic = main.join(paths::SYNCHED_HARMONIC_DIR);
        let optics = main.join(paths::SYNCHED_OPTICS_DIR);

        write_lins(&harmonic, "HER_1.sdds");
        write_lins(&harmonic, "HER_2.sdds");
        write_betas(&optics.join("HER_1.sdds"), "1.0", "4.0");

        let summary = calibrate_all(&params).unwrap();
        assert_eq!(summary.runs, 2);
        assert_eq!(summary.failed, vec!["HER_2.sdds (x)", "HER_2.sdds (y)"]);

        let out = main.join(paths::CALIBRATED_HARMONIC_DIR);
        let calibrated = TfsTable::read(&out.join("HER_1.sdds.linx")).unwrap();
        assert_eq!(calibrated.f64_column("AMPX").unwrap(), vec![1.0]);
        assert_eq!(
            std::fs::read(out.join("HER_2.sdds.linx")).unwrap(),
            std::fs::read(harmonic.join("HER_2.sdds.linx")).unwrap()
        );
        assert!(!out.join("HER_2.sdds.calibrationx").exists());
    }

    #[test]
    fn missing_beta_table_is_missing_input() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            CalibrationRecord::estimate(dir.path(), Axis::X),
            Err(SomaError::MissingInput { .. })
        ));
    }
}
