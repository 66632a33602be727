//! SAD scripts for conversion, the lattice model and the off-momentum sweep.
//!
//! Scripts are rendered to strings here and written under
//! `<main_output>/scripts/` by the pipeline, which hands their path to `gsad`.

use crate::error::{Result, SomaError};
use crate::paths;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Marker the conversion routine reads as "no sync correction".
pub const NO_SYNC: &str = "None";

pub const MODEL_SCRIPT: &str = "model_and_tune.sad";
pub const TUNE_GUESS_FILE: &str = "tune_guess.txt";

/// Number of sweep points on each side of zero, in steps of 1e-4.
const SWEEP_HALF_WIDTH: i32 = 10;
const SWEEP_STEP: f64 = 1e-4;

/// Name of the beam line: second token of the first lattice line whose first
/// token is `LINE`.
pub fn line_name(lattice: &Path) -> Result<String> {
    let text = std::fs::read_to_string(lattice).map_err(|_| SomaError::MissingInput {
        stage: "model".to_string(),
        path: lattice.to_path_buf(),
    })?;
    text.lines()
        .find_map(|line| {
            let mut tokens = line.split_whitespace();
            match (tokens.next(), tokens.next()) {
                (Some("LINE"), Some(name)) => Some(name.to_string()),
                _ => None,
            }
        })
        .ok_or_else(|| SomaError::MalformedTable {
            path: lattice.to_path_buf(),
            reason: "no LINE definition".to_string(),
        })
}

/// Shared preamble: read the lattice, select the line, compute optics.
fn preamble(out: &mut String, lattice: &Path, line: &str, dp0: Option<f64>) {
    let _ = writeln!(out, "read \"{}\" ;", lattice.display());
    let _ = writeln!(out, "FFS USE {line};");
    let _ = writeln!(out, "CELL;");
    if let Some(dpp) = dp0 {
        let _ = writeln!(out, "DP0={};", paths::format_dpp(dpp));
    }
    let _ = writeln!(out, "CALC;");
}

// ---------------------------------------------------------------------------
// Conversion
// ---------------------------------------------------------------------------

/// One file handed to `FormatBPMRead`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionRun {
    pub raw: PathBuf,
    pub output: PathBuf,
    /// Sync file of the kick axis, or `None` for an uncorrected conversion.
    pub sync: Option<PathBuf>,
}

pub fn conversion_script(lattice: &Path, line: &str, library: &str, runs: &[ConversionRun]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "read \"{}\" ;", lattice.display());
    out.push('\n');
    let _ = writeln!(out, "FFS USE {line};");
    let _ = writeln!(out, "CELL; CALC;");
    let _ = writeln!(out, "emit;");
    let _ = writeln!(out, "Get[\"{library}\"];");
    out.push('\n');
    out.push_str("runs = {\n");
    for (i, run) in runs.iter().enumerate() {
        let sync = run
            .sync
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| NO_SYNC.to_string());
        let sep = if i + 1 < runs.len() { "," } else { "" };
        let _ = writeln!(
            out,
            "    {{\"{}\", \"{}\", \"{}\"}}{sep}",
            run.raw.display(),
            run.output.display(),
            sync
        );
    }
    out.push_str("};\n");
    out.push_str("Do[\n");
    out.push_str("    Print[\"Converting \"//runs[i, 1]//\" -> \"//runs[i, 2]];\n");
    out.push_str("    FormatBPMRead[runs[i, 1], runs[i, 2], runs[i, 3]];\n");
    out.push_str("    ,{i, 1, Length[runs]}];\n");
    out.push('\n');
    out.push_str("abort;\n");
    out
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// Model twiss tables plus the tune guess file.
pub fn model_script(lattice: &Path, line: &str, library: &str, model_dir: &Path) -> String {
    let mut out = String::new();
    preamble(&mut out, lattice, line, None);
    out.push_str("em = Emittance[];\n\n");
    let _ = writeln!(out, "Get[\"{library}\"];\n");
    let _ = writeln!(out, "fn1 = \"{}\";", paths::twiss_path(model_dir).display());
    let _ = writeln!(
        out,
        "fn2 = \"{}\";",
        model_dir.join(paths::TWISS_ELEMENTS_FILE).display()
    );
    out.push_str("SaveTwiss[fn1, fn2];\n\n");
    let _ = writeln!(
        out,
        "file = OpenWrite[\"{}\"];",
        model_dir.join(TUNE_GUESS_FILE).display()
    );
    out.push_str("WriteString[file, \"Qx = \", Twiss[\"nx\", $$$]/(2*Pi), \"\\n\"];\n");
    out.push_str("WriteString[file, \"Qy = \", Twiss[\"ny\", $$$]/(2*Pi), \"\\n\"];\n");
    out.push_str("Close[file];\n\n");
    out.push_str("abort;\n");
    out
}

/// Twiss tables at one momentum deviation.
pub fn off_momentum_script(lattice: &Path, line: &str, library: &str, model_dir: &Path, dpp: f64) -> String {
    let mut out = String::new();
    preamble(&mut out, lattice, line, Some(dpp));
    out.push_str("em = Emittance[];\n\n");
    let _ = writeln!(out, "Get[\"{library}\"];\n");
    let _ = writeln!(
        out,
        "fn1 = \"{}\";",
        paths::off_momentum_twiss(model_dir, dpp).display()
    );
    let _ = writeln!(
        out,
        "fn2 = \"{}\";",
        paths::off_momentum_elements(model_dir, dpp).display()
    );
    out.push_str("SaveTwiss[fn1, fn2];\n\n");
    out.push_str("abort;\n");
    out
}

/// Momentum deviations of the sweep: -1e-3 to 1e-3 in steps of 1e-4.
pub fn sweep_points() -> Vec<f64> {
    (-SWEEP_HALF_WIDTH..=SWEEP_HALF_WIDTH)
        .map(|i| f64::from(i) * SWEEP_STEP)
        .collect()
}

/// Error definitions written next to the model.
pub fn error_definitions() -> &'static str {
    "@ Energy\t%s\t4 or 7 GeV\n\
     @ Info\t\t%s\tPreliminary error definition file for SuperKEKB\n\
     @ RELATIVE \t%s\tMAINFIELD\n\
     @ RADIUS \t%le\t0.017\n\
     \n\
     *\tPATTERN\t\tdK1\t\tdX\t\tdS\t\tMAINFIELD\n\
     $\t%s\t\t%le\t\t%le\t\t%le\t\t%s\n\
     \n    ^Q\t\t0.001\t\t0\t\t0.000\t\tQUAD\n\
     \x20   ^S     \t\t0      \t\t0       \t0.0001       \tSEXT\n\
     \x20   ^MQ    \t\t0\t    \t0       \t0       \tBPM\n"
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn line_name_from_first_line_statement() {
        let dir = TempDir::new().unwrap();
        let lattice = dir.path().join("sher.sad");
        std::fs::write(
            &lattice,
            "MOMENTUM = 7e9;\n\nLINE ASCE = (A B C);\nLINE OTHER = (D);\n",
        )
        .unwrap();
        assert_eq!(line_name(&lattice).unwrap(), "ASCE");
    }

    #[test]
    fn lattice_without_line_is_rejected() {
        let dir = TempDir::new().unwrap();
        let lattice = dir.path().join("empty.sad");
        std::fs::write(&lattice, "MOMENTUM = 7e9;\n").unwrap();
        assert!(matches!(line_name(&lattice), Err(SomaError::MalformedTable { .. })));
    }

    #[test]
    fn conversion_lists_each_run_with_its_sync_marker() {
        let runs = vec![
            ConversionRun {
                raw: "/raw/HER_1.data".into(),
                output: "/out/synched_sdds/HER_1.sdds".into(),
                sync: Some("/out/outofphasex/HER_1.sdds.txt".into()),
            },
            ConversionRun {
                raw: "/raw/HER_2.data".into(),
                output: "/out/synched_sdds/HER_2.sdds".into(),
                sync: None,
            },
        ];
        let s = conversion_script(Path::new("/lat/sher.sad"), "ASCE", "func.n", &runs);
        assert!(s.contains(
            "{\"/raw/HER_1.data\", \"/out/synched_sdds/HER_1.sdds\", \"/out/outofphasex/HER_1.sdds.txt\"},\n"
        ));
        assert!(s.contains("{\"/raw/HER_2.data\", \"/out/synched_sdds/HER_2.sdds\", \"None\"}\n"));
        assert!(s.contains("FormatBPMRead[runs[i, 1], runs[i, 2], runs[i, 3]]"));
        assert!(s.ends_with("abort;\n"));
    }

    #[test]
    fn sweep_has_21_points_with_exact_names() {
        let pts = sweep_points();
        assert_eq!(pts.len(), 21);
        assert_eq!(paths::format_dpp(pts[0]), "-0.001");
        assert_eq!(paths::format_dpp(pts[10]), "0.0");
        assert_eq!(paths::format_dpp(pts[15]), "0.0005");
        let s = off_momentum_script(Path::new("/l.sad"), "ASCE", "func.n", Path::new("/m"), pts[15]);
        assert!(s.contains("DP0=0.0005;"));
        assert!(s.contains("/m/twiss_dp0_0.0005.dat"));
    }
}
