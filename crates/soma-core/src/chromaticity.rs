//! Chromaticity from the tune measured at several momentum offsets.
//!
//! The averaged optics output lists, per kick, the momentum deviation and
//! the measured tune. A cubic in δp through those points gives the tune and
//! its first three derivatives at δp = 0. The same fit over the off-momentum
//! model sweep gives the model values for comparison.

use crate::error::{Result, SomaError};
use crate::fit::CubicFit;
use crate::paths;
use crate::tfs::TfsTable;
use crate::types::Axis;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Data-row fields of the kick table.
const KICK_DPP_FIELD: usize = 1;
const KICK_TUNE_FIELD: usize = 3;
const KICK_TUNE_ERR_FIELD: usize = 4;

/// Tune and its first three momentum derivatives at zero, each with an error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Derivatives(pub [(f64, f64); 4]);

impl Derivatives {
    pub fn from_fit(fit: &CubicFit) -> Self {
        Self([0, 1, 2, 3].map(|k| fit.derivative_at_zero(k)))
    }

    pub fn tune(&self) -> (f64, f64) {
        self.0[0]
    }

    /// Q'(0)
    pub fn linear(&self) -> (f64, f64) {
        self.0[1]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChromaticityResult {
    pub axis: Axis,
    pub measured: Derivatives,
    pub model: Option<Derivatives>,
    pub points: usize,
}

impl ChromaticityResult {
    pub fn render(&self) -> String {
        let mut out = String::new();
        render_block(&mut out, "", self.axis, &self.measured);
        if let Some(model) = &self.model {
            out.push('\n');
            render_block(&mut out, "MDL ", self.axis, model);
        }
        out
    }

    pub fn write(&self, optics: &Path) -> Result<PathBuf> {
        let path = output_path(optics, self.axis);
        crate::io::atomic_write(&path, self.render().as_bytes())?;
        Ok(path)
    }
}

fn render_block(out: &mut String, prefix: &str, axis: Axis, d: &Derivatives) {
    for (order, (value, err)) in d.0.iter().enumerate() {
        let primes = "'".repeat(order);
        let _ = writeln!(out, "@ {prefix}Q{primes}{} {value} +/- {err}", axis.as_str());
    }
}

pub fn output_path(optics: &Path, axis: Axis) -> PathBuf {
    paths::average_dir(optics).join(format!("chromaticity_{}.tfs", axis.as_str()))
}

// ---------------------------------------------------------------------------
// Measurement
// ---------------------------------------------------------------------------

/// `(dpp, Q, Q error)` triples from `kick_<pl>.tfs` or the legacy
/// `getkick.out` in `<optics>/average/`.
pub fn read_kick(optics: &Path, axis: Axis) -> Result<Vec<(f64, f64, f64)>> {
    let avg = paths::average_dir(optics);
    let tfs = avg.join(format!("kick_{}.tfs", axis.as_str()));
    let legacy = avg.join("getkick.out");
    let path = if tfs.is_file() {
        tfs
    } else if legacy.is_file() {
        legacy
    } else {
        return Err(SomaError::MissingInput {
            stage: "chromaticity".to_string(),
            path: tfs,
        });
    };
    let table = TfsTable::read(&path)?;
    let dpp = table.f64_at(KICK_DPP_FIELD)?;
    let q = table.f64_at(KICK_TUNE_FIELD)?;
    let err = table.f64_at(KICK_TUNE_ERR_FIELD)?;
    Ok(dpp
        .into_iter()
        .zip(q)
        .zip(err)
        .map(|((d, q), e)| (d, q, e))
        .collect())
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// One row of `tune_over_mom.txt`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPoint {
    pub dpp: f64,
    pub qx: f64,
    pub qy: f64,
}

impl ModelPoint {
    pub fn tune(&self, axis: Axis) -> f64 {
        match axis {
            Axis::X => self.qx,
            Axis::Y => self.qy,
        }
    }
}

/// Collect the sweep tables' `Q1`/`Q2` headers, sorted by momentum.
pub fn build_tune_over_mom(model_dir: &Path) -> Result<Vec<ModelPoint>> {
    let mut points = Vec::new();
    for name in crate::io::list_names(model_dir)? {
        let Some(dpp) = name
            .strip_prefix(paths::OFF_MOMENTUM_PREFIX)
            .and_then(|rest| rest.strip_suffix(".dat"))
        else {
            continue;
        };
        let Ok(dpp) = dpp.parse::<f64>() else {
            continue;
        };
        let table = TfsTable::read(&model_dir.join(&name))?;
        points.push(ModelPoint {
            dpp,
            qx: table.header_f64("Q1")?,
            qy: table.header_f64("Q2")?,
        });
    }
    points.sort_by(|a, b| a.dpp.total_cmp(&b.dpp));
    Ok(points)
}

pub fn render_tune_over_mom(points: &[ModelPoint]) -> String {
    let mut out = String::from("DPP \t QX \t QY \n");
    for p in points {
        let _ = writeln!(out, "{}\t{}\t{}", paths::format_dpp(p.dpp), p.qx, p.qy);
    }
    out
}

pub fn parse_tune_over_mom(text: &str, path: &Path) -> Result<Vec<ModelPoint>> {
    text.lines()
        .skip(1)
        .filter(|l| !l.trim().is_empty())
        .enumerate()
        .map(|(i, line)| {
            let nums: Vec<f64> = line
                .split_whitespace()
                .map(str::parse)
                .collect::<std::result::Result<_, _>>()
                .map_err(|_| SomaError::MalformedTable {
                    path: path.to_path_buf(),
                    reason: format!("row {}: not numeric", i + 1),
                })?;
            match nums.as_slice() {
                [dpp, qx, qy, ..] => Ok(ModelPoint {
                    dpp: *dpp,
                    qx: *qx,
                    qy: *qy,
                }),
                _ => Err(SomaError::MalformedTable {
                    path: path.to_path_buf(),
                    reason: format!("row {}: expected DPP QX QY", i + 1),
                }),
            }
        })
        .collect()
}

/// Load `tune_over_mom.txt`, writing it from the sweep tables first if absent.
pub fn load_tune_over_mom(model_dir: &Path) -> Result<Vec<ModelPoint>> {
    let path = paths::tune_over_mom_path(model_dir);
    if !path.is_file() {
        let points = build_tune_over_mom(model_dir)?;
        if !points.is_empty() {
            crate::io::atomic_write(&path, render_tune_over_mom(&points).as_bytes())?;
            tracing::info!(points = points.len(), path = %path.display(), "tune over momentum written");
        }
        return Ok(points);
    }
    let text = std::fs::read_to_string(&path)?;
    parse_tune_over_mom(&text, &path)
}

/// Cubic fit of the model tune over `|dpp| < limit`.
pub fn fit_model(points: &[ModelPoint], axis: Axis, limit: f64) -> Result<Derivatives> {
    let (x, y): (Vec<f64>, Vec<f64>) = points
        .iter()
        .filter(|p| p.dpp.abs() < limit)
        .map(|p| (p.dpp, p.tune(axis)))
        .unzip();
    Ok(Derivatives::from_fit(&CubicFit::fit(&x, &y)?))
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Fit the measurement for one plane and, where possible, the model.
pub fn estimate(optics: &Path, model_dir: &Path, axis: Axis, limit: f64) -> Result<ChromaticityResult> {
    let samples = read_kick(optics, axis)?;
    let x: Vec<f64> = samples.iter().map(|s| s.0).collect();
    let y: Vec<f64> = samples.iter().map(|s| s.1).collect();
    let measured = Derivatives::from_fit(&CubicFit::fit(&x, &y)?);

    let model = match load_tune_over_mom(model_dir).and_then(|pts| fit_model(&pts, axis, limit)) {
        Ok(d) => Some(d),
        Err(e) => {
            tracing::warn!(axis = axis.as_str(), "no usable model chromaticity: {e}");
            None
        }
    };
    Ok(ChromaticityResult {
        axis,
        measured,
        model,
        points: samples.len(),
    })
}

/// Estimate and write both planes.
pub fn analyse(optics: &Path, model_dir: &Path, limit: f64) -> Result<Vec<ChromaticityResult>> {
    let mut results = Vec::new();
    for axis in Axis::all() {
        let result = estimate(optics, model_dir, *axis, limit)?;
        let path = result.write(optics)?;
        let (q1, e1) = result.measured.linear();
        tracing::info!(axis = axis.as_str(), q1, e1, path = %path.display(), "chromaticity");
        results.push(result);
    }
    Ok(results)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
