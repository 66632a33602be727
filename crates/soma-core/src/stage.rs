use crate::config::Parameters;
use crate::error::SomaError;
use crate::paths;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// StageKind / Pass
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Model,
    Convert,
    Harmonic,
    Optics,
    DetectSync,
    Calibrate,
}

impl StageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Model => "model",
            StageKind::Convert => "convert",
            StageKind::Harmonic => "harmonic",
            StageKind::Optics => "optics",
            StageKind::DetectSync => "detect_sync",
            StageKind::Calibrate => "calibrate",
        }
    }
}

/// Which corrections have been applied to a stage's inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pass {
    Unsynched,
    Synched,
    Calibrated,
}

impl Pass {
    pub fn as_str(self) -> &'static str {
        match self {
            Pass::Unsynched => "unsynched",
            Pass::Synched => "synched",
            Pass::Calibrated => "calibrated",
        }
    }
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stage {
    pub kind: StageKind,
    pub pass: Pass,
}

impl Stage {
    pub const MODEL: Stage = Stage::of(StageKind::Model, Pass::Unsynched);
    pub const CONVERT_UNSYNCHED: Stage = Stage::of(StageKind::Convert, Pass::Unsynched);
    pub const HARMONIC_UNSYNCHED: Stage = Stage::of(StageKind::Harmonic, Pass::Unsynched);
    pub const OPTICS_UNSYNCHED: Stage = Stage::of(StageKind::Optics, Pass::Unsynched);
    pub const DETECT_SYNC: Stage = Stage::of(StageKind::DetectSync, Pass::Unsynched);
    pub const CONVERT_SYNCHED: Stage = Stage::of(StageKind::Convert, Pass::Synched);
    pub const HARMONIC_SYNCHED: Stage = Stage::of(StageKind::Harmonic, Pass::Synched);
    pub const OPTICS_SYNCHED: Stage = Stage::of(StageKind::Optics, Pass::Synched);
    pub const CALIBRATE: Stage = Stage::of(StageKind::Calibrate, Pass::Synched);
    pub const OPTICS_CALIBRATED: Stage = Stage::of(StageKind::Optics, Pass::Calibrated);

    const fn of(kind: StageKind, pass: Pass) -> Stage {
        Stage { kind, pass }
    }

    /// Every stage, in the only order stages may execute.
    pub fn pipeline_order() -> &'static [Stage] {
        &[
            Stage::MODEL,
            Stage::CONVERT_UNSYNCHED,
            Stage::HARMONIC_UNSYNCHED,
            Stage::OPTICS_UNSYNCHED,
            Stage::DETECT_SYNC,
            Stage::CONVERT_SYNCHED,
            Stage::HARMONIC_SYNCHED,
            Stage::OPTICS_SYNCHED,
            Stage::CALIBRATE,
            Stage::OPTICS_CALIBRATED,
        ]
    }

    pub fn index(self) -> usize {
        Stage::pipeline_order()
            .iter()
            .position(|s| *s == self)
            .unwrap_or(usize::MAX)
    }

    /// Stages whose outputs this stage reads.
    pub fn prerequisites(self) -> &'static [Stage] {
        match self {
            Stage::MODEL | Stage::CONVERT_UNSYNCHED => &[],
            Stage::HARMONIC_UNSYNCHED => &[Stage::MODEL, Stage::CONVERT_UNSYNCHED],
            Stage::OPTICS_UNSYNCHED => &[Stage::MODEL, Stage::HARMONIC_UNSYNCHED],
            Stage::DETECT_SYNC => &[Stage::OPTICS_UNSYNCHED],
            Stage::CONVERT_SYNCHED => &[Stage::DETECT_SYNC],
            Stage::HARMONIC_SYNCHED => &[Stage::MODEL, Stage::CONVERT_SYNCHED],
            Stage::OPTICS_SYNCHED => &[Stage::MODEL, Stage::HARMONIC_SYNCHED],
            Stage::CALIBRATE => &[Stage::OPTICS_SYNCHED],
            Stage::OPTICS_CALIBRATED => &[Stage::MODEL, Stage::CALIBRATE],
            _ => &[],
        }
    }

    /// Output directories. The first is the one whose contents decide
    /// whether the stage has already run.
    pub fn output_dirs(self, params: &Parameters) -> Vec<PathBuf> {
        let main = &params.main_output_path;
        match (self.kind, self.pass) {
            (StageKind::Model, _) => vec![params.model_path.clone()],
            (StageKind::Convert, Pass::Synched) => vec![main.join(paths::SYNCHED_SDDS_DIR)],
            (StageKind::Convert, _) => vec![main.join(paths::UNSYNCHED_SDDS_DIR)],
            (StageKind::Harmonic, Pass::Synched) => {
                vec![main.join(paths::SYNCHED_HARMONIC_DIR)]
            }
            (StageKind::Harmonic, _) => vec![main.join(paths::UNSYNCHED_HARMONIC_DIR)],
            (StageKind::Calibrate, _) => vec![main.join(paths::CALIBRATED_HARMONIC_DIR)],
            (StageKind::Optics, Pass::Unsynched) => vec![main.join(paths::UNSYNCHED_OPTICS_DIR)],
            (StageKind::Optics, Pass::Synched) => vec![main.join(paths::SYNCHED_OPTICS_DIR)],
            (StageKind::Optics, Pass::Calibrated) => {
                vec![main.join(paths::CALIBRATED_OPTICS_DIR)]
            }
            (StageKind::DetectSync, _) => {
                let kick = params.kickax;
                let mut dirs = vec![paths::out_of_phase_dir(main, kick)];
                for axis in crate::types::Axis::all() {
                    if *axis != kick {
                        dirs.push(paths::out_of_phase_dir(main, *axis));
                    }
                }
                dirs
            }
        }
    }

    pub fn output_dir(self, params: &Parameters) -> PathBuf {
        self.output_dirs(params).remove(0)
    }

    /// Name used on the command line and in the ledger (`optics:synched`).
    pub fn name(self) -> String {
        match self.kind {
            StageKind::Model | StageKind::DetectSync | StageKind::Calibrate => {
                self.kind.as_str().to_string()
            }
            _ => format!("{}:{}", self.kind.as_str(), self.pass.as_str()),
        }
    }
}

impl PartialOrd for Stage {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Stage {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.index().cmp(&other.index())
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl std::str::FromStr for Stage {
    type Err = SomaError;

    /// Accepts canonical names (`harmonic:unsynched`) and the short flags
    /// (`harmonic1`, `asynch`, `calib`, `optics3`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "model" => Ok(Stage::MODEL),
            "convert:unsynched" | "convert1" => Ok(Stage::CONVERT_UNSYNCHED),
            "harmonic:unsynched" | "harmonic1" => Ok(Stage::HARMONIC_UNSYNCHED),
            "optics:unsynched" | "optics1" => Ok(Stage::OPTICS_UNSYNCHED),
            "detect_sync" | "asynch" => Ok(Stage::DETECT_SYNC),
            "convert:synched" | "convert2" => Ok(Stage::CONVERT_SYNCHED),
            "harmonic:synched" | "harmonic2" => Ok(Stage::HARMONIC_SYNCHED),
            "optics:synched" | "optics2" => Ok(Stage::OPTICS_SYNCHED),
            "calibrate" | "calib" => Ok(Stage::CALIBRATE),
            "optics:calibrated" | "optics3" => Ok(Stage::OPTICS_CALIBRATED),
            _ => Err(SomaError::InvalidStage(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
