use crate::types::Axis;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants (relative to the main output path)
// ---------------------------------------------------------------------------

pub const UNSYNCHED_SDDS_DIR: &str = "unsynched_sdds";
pub const SYNCHED_SDDS_DIR: &str = "synched_sdds";
pub const UNSYNCHED_HARMONIC_DIR: &str = "unsynched_harmonic";
pub const SYNCHED_HARMONIC_DIR: &str = "synched_harmonic";
pub const CALIBRATED_HARMONIC_DIR: &str = "calibrated_harmonic";
pub const UNSYNCHED_OPTICS_DIR: &str = "unsynched_optics";
pub const SYNCHED_OPTICS_DIR: &str = "synched_optics";
pub const CALIBRATED_OPTICS_DIR: &str = "calibrated_optics";
pub const OUT_OF_PHASE_PREFIX: &str = "outofphase";
pub const AVERAGE_DIR: &str = "average";
pub const SCRIPTS_DIR: &str = "scripts";

pub const LEDGER_FILE: &str = "pipeline.yaml";

// Model directory contents
pub const TWISS_FILE: &str = "twiss.dat";
pub const TWISS_ELEMENTS_FILE: &str = "twiss_elements.dat";
pub const ERROR_DEFS_FILE: &str = "error_deffs.txt";
pub const TUNE_OVER_MOM_FILE: &str = "tune_over_mom.txt";
pub const OFF_MOMENTUM_PREFIX: &str = "twiss_dp0_";

// Raw and converted file extensions
pub const RAW_EXT: &str = ".data";
pub const CONVERTED_EXT: &str = ".sdds";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn ledger_path(main: &Path) -> PathBuf {
    main.join(LEDGER_FILE)
}

/// Directory holding per-run sync files for one axis.
pub fn out_of_phase_dir(main: &Path, axis: Axis) -> PathBuf {
    main.join(format!("{OUT_OF_PHASE_PREFIX}{}", axis.as_str()))
}

/// Sync file of one run, keyed by the run's canonical name.
pub fn sync_file(main: &Path, axis: Axis, canonical: &str) -> PathBuf {
    out_of_phase_dir(main, axis).join(format!("{canonical}.txt"))
}

pub fn scripts_dir(main: &Path) -> PathBuf {
    main.join(SCRIPTS_DIR)
}

pub fn average_dir(optics: &Path) -> PathBuf {
    optics.join(AVERAGE_DIR)
}

pub fn twiss_path(model: &Path) -> PathBuf {
    model.join(TWISS_FILE)
}

pub fn tune_over_mom_path(model: &Path) -> PathBuf {
    model.join(TUNE_OVER_MOM_FILE)
}

/// Off-momentum model table for one momentum deviation.
pub fn off_momentum_twiss(model: &Path, dpp: f64) -> PathBuf {
    model.join(format!("{OFF_MOMENTUM_PREFIX}{}.dat", format_dpp(dpp)))
}

pub fn off_momentum_elements(model: &Path, dpp: f64) -> PathBuf {
    model.join(format!("twiss_elements_dp0_{}.dat", format_dpp(dpp)))
}

/// Momentum deviation rounded to four decimals, rendered the way the sweep
/// file names have always been written (`-0.001`, `0.0`, `0.0005`).
pub fn format_dpp(dpp: f64) -> String {
    let rounded = (dpp * 1e4).round() / 1e4;
    let rounded = if rounded == 0.0 { 0.0 } else { rounded };
    let s = format!("{rounded}");
    if s.contains('.') || s.contains('e') {
        s
    } else {
        format!("{s}.0")
    }
}

/// Harmonic output of one run for one axis (`<run>.linx`).
pub fn lin_file(harmonic: &Path, run: &str, axis: Axis) -> PathBuf {
    harmonic.join(format!("{run}.lin{}", axis.as_str()))
}

/// Runs with harmonic output in `harmonic`, identified by their `.linx`
/// file, sorted by name.
pub fn harmonic_runs(harmonic: &Path) -> crate::error::Result<Vec<String>> {
    if !harmonic.is_dir() {
        return Ok(Vec::new());
    }
    let mut runs: Vec<String> = crate::io::list_names(harmonic)?
        .into_iter()
        .filter_map(|name| name.strip_suffix(".linx").map(str::to_string))
        .collect();
    runs.sort();
    Ok(runs)
}

/// Converted files in `sdds_dir`, sorted by name.
pub fn converted_files(sdds_dir: &Path) -> crate::error::Result<Vec<String>> {
    if !sdds_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files: Vec<String> = crate::io::list_names(sdds_dir)?
        .into_iter()
        .filter(|name| name.ends_with(CONVERTED_EXT))
        .collect();
    files.sort();
    Ok(files)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_helpers() {
        let main = Path::new("/tmp/study");
        assert_eq!(
            sync_file(main, Axis::X, "HER_2020_01_01.sdds"),
            PathBuf::from("/tmp/study/outofphasex/HER_2020_01_01.sdds.txt")
        );
        assert_eq!(
            lin_file(Path::new("/h"), "run.sdds", Axis::Y),
            PathBuf::from("/h/run.sdds.liny")
        );
        assert_eq!(ledger_path(main), PathBuf::from("/tmp/study/pipeline.yaml"));
    }

    #[test]
    fn dpp_formatting_matches_sweep_names() {
        assert_eq!(format_dpp(-1e-3), "-0.001");
        assert_eq!(format_dpp(0.0), "0.0");
        assert_eq!(format_dpp(-0.0), "0.0");
        assert_eq!(format_dpp(5e-4), "0.0005");
        assert_eq!(format_dpp(3.0000000000000003e-4), "0.0003");
    }
}
