//! BPM synchronisation feedback.
//!
//! The first-pass phase advance of every sensor, measured against the model,
//! reveals sensors that record a whole turn early or late. Each run gets a
//! sync file per axis listing the integer turn offset of every sensor; the
//! second conversion pass feeds the kick-axis file back to SAD so the turn
//! data are realigned before the harmonic analysis runs again.
//!
//! Sync file, one line per sensor:
//!
//! ```text
//! "MQC1LE"->+0
//! "MQD2LE"->-1
//! "MQF3LE"->?
//! ```

use crate::config::Parameters;
use crate::dictionary::FileDictionary;
use crate::error::{Result, SomaError};
use crate::paths;
use crate::sad::ConversionRun;
use crate::tfs::TfsTable;
use crate::types::Axis;
use regex::Regex;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// SyncOffset
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOffset {
    Offset(i32),
    /// Too close to a half turn to tell which way the sensor is off.
    Undetermined,
}

impl SyncOffset {
    /// Classify a phase difference in units of 2π.
    pub fn from_phase(delta: f64, margin: f64) -> Self {
        if !delta.is_finite() {
            return SyncOffset::Undetermined;
        }
        let frac = delta - delta.floor();
        if (frac - 0.5).abs() <= margin {
            return SyncOffset::Undetermined;
        }
        SyncOffset::Offset(delta.round() as i32)
    }

    /// Offset applied during conversion; undetermined sensors are left alone.
    pub fn effective(self) -> i32 {
        match self {
            SyncOffset::Offset(n) => n,
            SyncOffset::Undetermined => 0,
        }
    }
}

impl fmt::Display for SyncOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncOffset::Offset(n) => write!(f, "{n:+}"),
            SyncOffset::Undetermined => f.write_str("?"),
        }
    }
}

// ---------------------------------------------------------------------------
// SyncRecord
// ---------------------------------------------------------------------------

/// Offsets of every sensor of one run on one axis, in phase-table order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRecord {
    pub run: String,
    pub axis: Axis,
    pub sensors: Vec<(String, SyncOffset)>,
}

static LINE_RE: OnceLock<Regex> = OnceLock::new();

fn line_re() -> &'static Regex {
    LINE_RE.get_or_init(|| Regex::new(r#"^"([^"]+)"->([+-]\d+|\?)$"#).expect("static regex"))
}

impl SyncRecord {
    /// One entry per sensor; a repeated name keeps its first value.
    pub fn detect(run: &str, axis: Axis, phases: &[(String, f64)], margin: f64) -> Self {
        let mut seen = HashSet::new();
        let sensors = phases
            .iter()
            .filter(|(name, _)| seen.insert(name.clone()))
            .map(|(name, delta)| (name.clone(), SyncOffset::from_phase(*delta, margin)))
            .collect();
        Self {
            run: run.to_string(),
            axis,
            sensors,
        }
    }

    pub fn offset(&self, sensor: &str) -> Option<SyncOffset> {
        self.sensors
            .iter()
            .find(|(n, _)| n == sensor)
            .map(|(_, o)| *o)
    }

    /// Whether any sensor needs shifting.
    pub fn has_correction(&self) -> bool {
        self.sensors.iter().any(|(_, o)| o.effective() != 0)
    }

    pub fn out_of_sync(&self) -> usize {
        self.sensors.iter().filter(|(_, o)| o.effective() != 0).count()
    }

    pub fn undetermined(&self) -> usize {
        self.sensors
            .iter()
            .filter(|(_, o)| *o == SyncOffset::Undetermined)
            .count()
    }

    pub fn render(&self) -> String {
        self.sensors
            .iter()
            .map(|(name, offset)| format!("\"{name}\"->{offset}\n"))
            .collect()
    }

    pub fn parse(text: &str, run: &str, axis: Axis, path: &Path) -> Result<Self> {
        let mut sensors = Vec::new();
        for (i, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let caps = line_re().captures(line).ok_or_else(|| SomaError::MalformedTable {
                path: path.to_path_buf(),
                reason: format!("line {}: not a sync entry: {line}", i + 1),
            })?;
            let offset = match &caps[2] {
                "?" => SyncOffset::Undetermined,
                n => SyncOffset::Offset(n.parse().map_err(|_| SomaError::MalformedTable {
                    path: path.to_path_buf(),
                    reason: format!("line {}: offset out of range", i + 1),
                })?),
            };
            sensors.push((caps[1].to_string(), offset));
        }
        Ok(Self {
            run: run.to_string(),
            axis,
            sensors,
        })
    }

    pub fn write(&self, main: &Path) -> Result<PathBuf> {
        let path = paths::sync_file(main, self.axis, &self.run);
        crate::io::atomic_write(&path, self.render().as_bytes())?;
        Ok(path)
    }

    /// The stored record for `run`, if one was written.
    pub fn read(main: &Path, axis: Axis, run: &str) -> Result<Option<Self>> {
        let path = paths::sync_file(main, axis, run);
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)?;
        Self::parse(&text, run, axis, &path).map(Some)
    }
}

// ---------------------------------------------------------------------------
// Phase tables
// ---------------------------------------------------------------------------

/// Measured minus model phase advance per sensor, from `phase_<ax>.tfs` or
/// the legacy `getphase<ax>.out`.
pub fn read_phase(dir: &Path, run: &str, axis: Axis) -> Result<Vec<(String, f64)>> {
    let tfs = dir.join(format!("phase_{}.tfs", axis.as_str()));
    let legacy = dir.join(format!("getphase{}.out", axis.as_str()));
    let up = axis.upper();

    if tfs.is_file() {
        let table = TfsTable::read(&tfs)?;
        let names = table.str_column("NAME")?;
        let delta = table.f64_column(&format!("DELTAPH{up}"))?;
        return Ok(names.into_iter().map(str::to_string).zip(delta).collect());
    }
    if legacy.is_file() {
        let table = TfsTable::read(&legacy)?;
        let names = table.str_column("NAME")?;
        let phase = table.f64_column(&format!("PHASE{up}"))?;
        let model = table.f64_column(&format!("PH{up}MDL"))?;
        return Ok(names
            .into_iter()
            .map(str::to_string)
            .zip(phase.iter().zip(&model).map(|(p, m)| p - m))
            .collect());
    }
    Err(SomaError::NoPhaseOutput {
        run: run.to_string(),
        dir: dir.to_path_buf(),
    })
}

// ---------------------------------------------------------------------------
// Stage entry points
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct SyncSummary {
    pub written: usize,
    pub corrected_runs: usize,
    pub failed: Vec<String>,
}

/// Write a sync file for every run and axis from the first-pass optics.
///
/// Runs without a per-run optics directory fall back to the averaged result.
/// A run with no phase output at all is logged and left without a sync file.
pub fn detect_all(params: &Parameters, dict: &FileDictionary) -> Result<SyncSummary> {
    let main = &params.main_output_path;
    let optics = main.join(paths::UNSYNCHED_OPTICS_DIR);
    let margin = params.tuning.sync_ambiguity_margin;
    let mut summary = SyncSummary::default();

    for (i, entry) in dict.entries().iter().enumerate() {
        let run = entry.canonical.as_str();
        let run_dir = optics.join(run);
        let dir = if run_dir.is_dir() {
            run_dir
        } else {
            paths::average_dir(&optics)
        };
        let mut corrected = false;
        for axis in Axis::all() {
            match read_phase(&dir, run, *axis) {
                Ok(phases) => {
                    let record = SyncRecord::detect(run, *axis, &phases, margin);
                    tracing::info!(
                        run,
                        axis = axis.as_str(),
                        sensors = record.sensors.len(),
                        out_of_sync = record.out_of_sync(),
                        undetermined = record.undetermined(),
                        "sync {}/{}",
                        i + 1,
                        dict.len()
                    );
                    corrected |= *axis == params.kickax && record.has_correction();
                    record.write(main)?;
                    summary.written += 1;
                }
                Err(e) if e.is_recoverable() => {
                    tracing::warn!(run, axis = axis.as_str(), "{e}");
                    summary.failed.push(format!("{run} ({})", axis.as_str()));
                }
                Err(e) => return Err(e),
            }
        }
        if corrected {
            summary.corrected_runs += 1;
        }
    }
    Ok(summary)
}

/// Second-pass conversion inputs: each dictionary entry paired with its
/// kick-axis sync file when that run has at least one offset sensor.
pub fn corrected_runs(params: &Parameters, dict: &FileDictionary, output_dir: &Path) -> Result<Vec<ConversionRun>> {
    let main = &params.main_output_path;
    dict.entries()
        .iter()
        .map(|entry| {
            let record = SyncRecord::read(main, params.kickax, &entry.canonical)?;
            let sync = record
                .filter(SyncRecord::has_correction)
                .map(|_| paths::sync_file(main, params.kickax, &entry.canonical));
            Ok(ConversionRun {
                raw: entry.raw.clone(),
                output: output_dir.join(&entry.canonical),
                sync,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
