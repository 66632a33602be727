//! Durable record of what each stage has produced.
//!
//! A stage is complete when its primary output directory exists and is
//! non-empty. Every run/skip question goes through [`StageStore`]; nothing
//! else in the pipeline inspects stage directories directly.

use crate::config::Parameters;
use crate::decision::{Decision, DecisionProvider, DecisionRequest};
use crate::error::{Result, SomaError};
use crate::io;
use crate::stage::Stage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Upper bound on "ask again" answers before giving up on a decision.
const MAX_ASKS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    Run,
    Skip,
    Ask,
}

pub struct StageStore<'a> {
    params: &'a Parameters,
}

impl<'a> StageStore<'a> {
    pub fn new(params: &'a Parameters) -> Self {
        Self { params }
    }

    pub fn output_dir(&self, stage: Stage) -> PathBuf {
        stage.output_dir(self.params)
    }

    /// Whether the stage has already produced output.
    pub fn is_complete(&self, stage: Stage) -> bool {
        io::is_non_empty_dir(&self.output_dir(stage))
    }

    /// `Run` for a missing (now created) or empty directory, `Ask` for a
    /// populated one. Never `Skip`: skipping requires a decision.
    pub fn should_run(&self, stage: Stage) -> Result<Readiness> {
        let dir = self.output_dir(stage);
        if !dir.exists() {
            io::ensure_dir(&dir)?;
            return Ok(Readiness::Run);
        }
        if io::is_non_empty_dir(&dir) {
            Ok(Readiness::Ask)
        } else {
            Ok(Readiness::Run)
        }
    }

    /// Settle `should_run` into `Run` or `Skip`, consulting `decisions` for a
    /// populated directory. An overwrite clears every output directory of the
    /// stage before returning.
    pub fn resolve(&self, stage: Stage, decisions: &mut dyn DecisionProvider) -> Result<Readiness> {
        match self.should_run(stage)? {
            Readiness::Ask => {}
            other => return Ok(other),
        }
        let dir = self.output_dir(stage);
        let contents = io::list_names(&dir)?;
        for _ in 0..MAX_ASKS {
            let request = DecisionRequest {
                stage,
                dir: &dir,
                contents: &contents,
            };
            match decisions.decide(&request) {
                Some(Decision::Overwrite) => {
                    tracing::info!(stage = %stage, dir = %dir.display(), "clearing stage output");
                    self.clear(stage)?;
                    return Ok(Readiness::Run);
                }
                Some(Decision::Skip) => {
                    tracing::info!(stage = %stage, dir = %dir.display(), "keeping existing output");
                    return Ok(Readiness::Skip);
                }
                Some(Decision::AskAgain) => continue,
                None => break,
            }
        }
        Err(SomaError::DestructiveActionNotConfirmed {
            stage: stage.name(),
            path: dir,
        })
    }

    /// Create every output directory of the stage.
    pub fn prepare(&self, stage: Stage) -> Result<()> {
        for dir in stage.output_dirs(self.params) {
            io::ensure_dir(&dir)?;
        }
        Ok(())
    }

    /// Empty every output directory of the stage. Completes fully before the
    /// stage writes anything.
    pub fn clear(&self, stage: Stage) -> Result<()> {
        for dir in stage.output_dirs(self.params) {
            if dir.exists() {
                io::clear_dir(&dir)?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::{FixedDecision, Refuse};
    use crate::test_utils::params_in;
    use tempfile::TempDir;

    #[test]
    fn missing_dir_runs_and_is_created() {
        let dir = TempDir::new().unwrap();
        let params = params_in(dir.path());
        let store = StageStore::new(&params);
        assert_eq!(store.should_run(Stage::CONVERT_UNSYNCHED).unwrap(), Readiness::Run);
        assert!(store.output_dir(Stage::CONVERT_UNSYNCHED).is_dir());
        assert!(!store.is_complete(Stage::CONVERT_UNSYNCHED));
    }

    #[test]
    fn populated_dir_asks() {
        let dir = TempDir::new().unwrap();
        let params = params_in(dir.path());
        let store = StageStore::new(&params);
        let out = store.output_dir(Stage::HARMONIC_UNSYNCHED);
        std::fs::create_dir_all(&out).unwrap();
        assert_eq!(store.should_run(Stage::HARMONIC_UNSYNCHED).unwrap(), Readiness::Run);
        std::fs::write(out.join("a.sdds.linx"), b"x").unwrap();
        assert_eq!(store.should_run(Stage::HARMONIC_UNSYNCHED).unwrap(), Readiness::Ask);
        assert!(store.is_complete(Stage::HARMONIC_UNSYNCHED));
    }

    #[test]
    fn refusal_is_not_confirmed_and_leaves_files() {
        let dir = TempDir::new().unwrap();
        let params = params_in(dir.path());
        let store = StageStore::new(&params);
        let out = store.output_dir(Stage::OPTICS_SYNCHED);
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(out.join("beta_phase_x.tfs"), b"keep me").unwrap();

        let err = store.resolve(Stage::OPTICS_SYNCHED, &mut Refuse).unwrap_err();
        assert!(matches!(err, SomaError::DestructiveActionNotConfirmed { .. }));
        assert_eq!(std::fs::read(out.join("beta_phase_x.tfs")).unwrap(), b"keep me");

        let r = store
            .resolve(Stage::OPTICS_SYNCHED, &mut FixedDecision(Decision::Skip))
            .unwrap();
        assert_eq!(r, Readiness::Skip);
        assert_eq!(std::fs::read(out.join("beta_phase_x.tfs")).unwrap(), b"keep me");
    }

    #[test]
    fn endless_ask_again_gives_up() {
        let dir = TempDir::new().unwrap();
        let params = params_in(dir.path());
        let store = StageStore::new(&params);
        let out = store.output_dir(Stage::MODEL);
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(out.join("twiss.dat"), b"x").unwrap();
        let err = store
            .resolve(Stage::MODEL, &mut FixedDecision(Decision::AskAgain))
            .unwrap_err();
        assert!(matches!(err, SomaError::DestructiveActionNotConfirmed { .. }));
    }

    #[test]
    fn overwrite_clears_all_stage_dirs() {
        let dir = TempDir::new().unwrap();
        let params = params_in(dir.path());
        let store = StageStore::new(&params);
        store.prepare(Stage::DETECT_SYNC).unwrap();
        for out in Stage::DETECT_SYNC.output_dirs(&params) {
            std::fs::write(out.join("run.sdds.txt"), b"\"BPM1\"->+1\n").unwrap();
        }
        let r = store
            .resolve(Stage::DETECT_SYNC, &mut FixedDecision(Decision::Overwrite))
            .unwrap();
        assert_eq!(r, Readiness::Run);
        for out in Stage::DETECT_SYNC.output_dirs(&params) {
            assert!(out.is_dir());
            assert!(!io::is_non_empty_dir(&out));
        }
    }
}
