//! Stage sequencing: which stages run, in what order, and what each one does.
//!
//! The fixed order is
//!
//! ```text
//! model → convert:unsynched → harmonic:unsynched → optics:unsynched
//!       → detect_sync → convert:synched → harmonic:synched → optics:synched
//!       → calibrate → optics:calibrated
//! ```
//!
//! A request names any subset of stages. [`Pipeline::plan`] adds every
//! prerequisite whose output is missing, recursively, and the result always
//! executes in the fixed order. Each stage first settles with the
//! [`StageStore`] whether it runs at all; only then does it touch its output
//! directory.

use crate::calibration;
use crate::chromaticity;
use crate::config::Parameters;
use crate::coupling;
use crate::decision::DecisionProvider;
use crate::dictionary::FileDictionary;
use crate::error::{Result, SomaError};
use crate::io;
use crate::ledger::{HistoryEntry, Ledger, Outcome};
use crate::paths;
use crate::sad::{self, ConversionRun};
use crate::stage::{Pass, Stage, StageKind};
use crate::store::{Readiness, StageStore};
use crate::sync;
use crate::tool_runner::{self, HarmonicArgs, Invocation, ProcessRunner, Suite, Tunes};
use crate::types::Toolchain;
use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Turn windows cut out of an oversized converted file.
const CUT_WINDOW: u32 = 5000;
const CUT_TURNS: u32 = 50_000;

/// Layout of the timestamp embedded in run names (`HER_2021_05_12_10_31_02.sdds`).
const RUN_TIME_FORMAT: &str = "%Y_%m_%d_%H_%M_%S";

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    Requested,
    /// Pulled in because its outputs are missing.
    Prerequisite,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanStep {
    pub stage: Stage,
    pub reason: Reason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub steps: Vec<PlanStep>,
}

impl Plan {
    pub fn stages(&self) -> Vec<Stage> {
        self.steps.iter().map(|s| s.stage).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Ran,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub status: StageStatus,
    /// Inputs handled by the stage (files, runs or scripts).
    pub processed: usize,
    /// Inputs whose tool call failed; the stage carried on without them.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl StageReport {
    fn new(stage: Stage, status: StageStatus) -> Self {
        Self {
            stage,
            status,
            processed: 0,
            failed: Vec::new(),
            notes: Vec::new(),
        }
    }

    fn to_history(&self) -> HistoryEntry {
        let outcome = match self.status {
            StageStatus::Ran => Outcome::Ran,
            StageStatus::Skipped => Outcome::Skipped,
        };
        let mut entry = HistoryEntry::new(self.stage, outcome);
        entry.processed = self.processed;
        entry.failed_inputs = self.failed.clone();
        if !self.notes.is_empty() {
            entry.note = Some(self.notes.join("; "));
        }
        entry
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    pub toolchain: Toolchain,
    /// Optics over all runs at once into `average/`, plus chromaticity.
    pub all_files: bool,
}

pub struct Pipeline<'a> {
    params: &'a Parameters,
    options: PipelineOptions,
    runner: &'a mut dyn ProcessRunner,
    decisions: &'a mut dyn DecisionProvider,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        params: &'a Parameters,
        options: PipelineOptions,
        runner: &'a mut dyn ProcessRunner,
        decisions: &'a mut dyn DecisionProvider,
    ) -> Self {
        Self {
            params,
            options,
            runner,
            decisions,
        }
    }

    fn store(&self) -> StageStore<'a> {
        StageStore::new(self.params)
    }

    /// Requested stages plus every prerequisite without output, in pipeline
    /// order.
    pub fn plan(&self, requested: &[Stage]) -> Plan {
        let store = self.store();
        let wanted: BTreeSet<Stage> = requested.iter().copied().collect();
        let mut chosen = wanted.clone();
        let mut pending: Vec<Stage> = wanted.iter().copied().collect();
        while let Some(stage) = pending.pop() {
            for pre in stage.prerequisites() {
                if !chosen.contains(pre) && !store.is_complete(*pre) {
                    chosen.insert(*pre);
                    pending.push(*pre);
                }
            }
        }
        Plan {
            steps: chosen
                .into_iter()
                .map(|stage| PlanStep {
                    stage,
                    reason: if wanted.contains(&stage) {
                        Reason::Requested
                    } else {
                        Reason::Prerequisite
                    },
                })
                .collect(),
        }
    }

    /// Plan, then execute every step. Each outcome goes to the ledger; the
    /// first fatal error is recorded and returned.
    pub fn run(&mut self, requested: &[Stage]) -> Result<Vec<StageReport>> {
        let plan = self.plan(requested);
        let main = self.params.main_output_path.clone();
        io::ensure_dir(&main)?;
        let mut ledger = Ledger::load(&main)?;

        let mut reports = Vec::new();
        for step in &plan.steps {
            if step.reason == Reason::Prerequisite {
                tracing::info!(stage = %step.stage, "running missing prerequisite");
            }
            match self.run_stage(step.stage) {
                Ok(report) => {
                    ledger.record(report.to_history());
                    ledger.save(&main)?;
                    reports.push(report);
                }
                Err(e) => {
                    let mut entry = HistoryEntry::new(step.stage, Outcome::Failed);
                    entry.note = Some(e.to_string());
                    ledger.record(entry);
                    ledger.save(&main)?;
                    return Err(e);
                }
            }
        }
        Ok(reports)
    }

    pub fn run_stage(&mut self, stage: Stage) -> Result<StageReport> {
        let store = self.store();
        if store.resolve(stage, self.decisions)? == Readiness::Skip {
            return Ok(StageReport::new(stage, StageStatus::Skipped));
        }
        store.prepare(stage)?;
        tracing::info!(stage = %stage, dir = %store.output_dir(stage).display(), "stage started");

        let report = match stage.kind {
            StageKind::Model => self.model(stage)?,
            StageKind::Convert => self.convert(stage)?,
            StageKind::Harmonic => self.harmonic(stage)?,
            StageKind::Optics => self.optics(stage)?,
            StageKind::DetectSync => self.detect_sync(stage)?,
            StageKind::Calibrate => self.calibrate(stage)?,
        };
        tracing::info!(
            stage = %stage,
            processed = report.processed,
            failed = report.failed.len(),
            "stage finished"
        );
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Stages
    // -----------------------------------------------------------------------

    fn model(&mut self, stage: Stage) -> Result<StageReport> {
        let p = self.params;
        let line = self.line_name(stage)?;
        let model_dir = &p.model_path;
        let library = &p.tuning.sad_library;
        let mut report = StageReport::new(stage, StageStatus::Ran);

        io::atomic_write(
            &model_dir.join(paths::ERROR_DEFS_FILE),
            sad::error_definitions().as_bytes(),
        )?;

        let script = self.write_script(
            sad::MODEL_SCRIPT,
            &sad::model_script(&p.lattice, &line, library, model_dir),
        )?;
        tool_runner::run_checked(self.runner, &tool_runner::sad(&p.gsad, &script), sad::MODEL_SCRIPT)?;
        report.processed += 1;

        let points = sad::sweep_points();
        for (i, dpp) in points.iter().enumerate() {
            let name = format!("offmom_{}.sad", paths::format_dpp(*dpp));
            let script = self.write_script(
                &name,
                &sad::off_momentum_script(&p.lattice, &line, library, model_dir, *dpp),
            )?;
            tracing::debug!("off-momentum model {}/{}", i + 1, points.len());
            self.run_recoverable(&tool_runner::sad(&p.gsad, &script), &name, &mut report)?;
        }
        Ok(report)
    }

    fn convert(&mut self, stage: Stage) -> Result<StageReport> {
        let p = self.params;
        let out_dir = stage.output_dir(p);
        let runs: Vec<ConversionRun> = if stage.pass == Pass::Unsynched {
            let dict = FileDictionary::ensure(
                &p.file_dict,
                &p.input_data_path,
                &p.ring_id,
                p.tuning.create_missing_dictionary,
            )?;
            if dict.is_empty() {
                return Err(SomaError::MissingInput {
                    stage: stage.name(),
                    path: p.input_data_path.clone(),
                });
            }
            dict.entries()
                .iter()
                .map(|e| ConversionRun {
                    raw: e.raw.clone(),
                    output: out_dir.join(&e.canonical),
                    sync: None,
                })
                .collect()
        } else {
            let sync_dir = Stage::DETECT_SYNC.output_dir(p);
            if !sync_dir.is_dir() {
                return Err(SomaError::MissingInput {
                    stage: stage.name(),
                    path: sync_dir,
                });
            }
            let dict = FileDictionary::load(&p.file_dict)?;
            sync::corrected_runs(p, &dict, &out_dir)?
        };

        let line = self.line_name(stage)?;
        let name = format!("convert_{}.sad", stage.pass.as_str());
        let script = self.write_script(
            &name,
            &sad::conversion_script(&p.lattice, &line, &p.tuning.sad_library, &runs),
        )?;
        tool_runner::run_checked(self.runner, &tool_runner::sad(&p.gsad, &script), &name)?;

        let mut report = StageReport::new(stage, StageStatus::Ran);
        report.processed = runs.len();
        let corrected = runs.iter().filter(|r| r.sync.is_some()).count();
        if stage.pass == Pass::Synched {
            report.notes.push(format!("{corrected} runs sync-corrected"));
        }
        self.cut_large_files(&out_dir, &mut report)?;
        Ok(report)
    }

    /// Split converted files above the size limit into turn windows.
    fn cut_large_files(&mut self, dir: &Path, report: &mut StageReport) -> Result<()> {
        let p = self.params;
        let limit = p.tuning.large_file_bytes;
        let mut large = Vec::new();
        for name in paths::converted_files(dir)? {
            if name.contains("cut") {
                continue;
            }
            if std::fs::metadata(dir.join(&name))?.len() > limit {
                large.push(name);
            }
        }
        if large.is_empty() {
            return Ok(());
        }
        let python = self.suite()?.python;
        for name in &large {
            tracing::info!(file = name.as_str(), "splitting oversized file");
            let mut start = 0;
            while start < CUT_TURNS {
                let inv = tool_runner::cut(
                    &python,
                    &p.tuning.cut_script,
                    &dir.join(name),
                    dir,
                    start,
                    start + CUT_WINDOW,
                );
                self.run_recoverable(&inv, &format!("{name} [{start}..{}]", start + CUT_WINDOW), report)?;
                start += CUT_WINDOW;
            }
        }
        report.notes.push(format!("{} oversized files split", large.len()));
        Ok(())
    }

    fn harmonic(&mut self, stage: Stage) -> Result<StageReport> {
        let p = self.params;
        let sdds_dir = converted_dir(p, stage.pass);
        let files = paths::converted_files(&sdds_dir)?;
        if files.is_empty() {
            return Err(SomaError::MissingInput {
                stage: stage.name(),
                path: sdds_dir,
            });
        }
        let tunes = Tunes::from_model(&p.model_path)?;
        let suite = self.suite()?;
        let out_dir = stage.output_dir(p);
        let mut report = StageReport::new(stage, StageStatus::Ran);

        for (i, file) in files.iter().enumerate() {
            tracing::info!(file = file.as_str(), "harmonic analysis {}/{}", i + 1, files.len());
            let path = sdds_dir.join(file);
            let args = HarmonicArgs {
                file: &path,
                output_dir: &out_dir,
                model_dir: &p.model_path,
                tunes,
                nturns: p.nturns,
                tolerance: p.tuning.tune_tolerance,
            };
            self.run_recoverable(&tool_runner::harmonic(&suite, &args), file, &mut report)?;
        }
        Ok(report)
    }

    fn optics(&mut self, stage: Stage) -> Result<StageReport> {
        let p = self.params;
        let harmonic = harmonic_dir(p, stage.pass);
        if paths::harmonic_runs(&harmonic)?.is_empty() {
            return Err(SomaError::MissingInput {
                stage: stage.name(),
                path: harmonic,
            });
        }
        let sdds_dir = converted_dir(p, stage.pass);
        let runs = order_runs(paths::converted_files(&sdds_dir)?);
        let suite = self.suite()?;
        let out_dir = stage.output_dir(p);
        let ring = p.ring();
        let mut report = StageReport::new(stage, StageStatus::Ran);

        if self.options.all_files {
            let files: Vec<PathBuf> = runs.iter().map(|r| harmonic.join(r)).collect();
            let inv = tool_runner::optics_batch(&suite, &files, &paths::average_dir(&out_dir), &p.model_path, &ring);
            self.run_recoverable(&inv, "average", &mut report)?;
            report.processed = runs.len();
        } else {
            for (i, run) in runs.iter().enumerate() {
                tracing::info!(run = run.as_str(), "optics {}/{}", i + 1, runs.len());
                let inv = tool_runner::optics_single(
                    &suite,
                    &harmonic.join(run),
                    &out_dir.join(run),
                    &p.model_path,
                    &ring,
                );
                self.run_recoverable(&inv, run, &mut report)?;
            }
        }

        if self.options.all_files {
            match chromaticity::analyse(&out_dir, &p.model_path, p.tuning.chroma_model_dpp_limit) {
                Ok(results) => report
                    .notes
                    .push(format!("chromaticity written for {} planes", results.len())),
                Err(e) => {
                    tracing::warn!(stage = %stage, "chromaticity skipped: {e}");
                    report.notes.push(format!("chromaticity skipped: {e}"));
                }
            }
        }
        if stage.pass == Pass::Synched {
            match coupling::analyse(&sdds_dir, &harmonic, &out_dir, self.options.all_files) {
                Ok(summary) => report
                    .notes
                    .push(format!("coupling estimated for {} runs", summary.runs)),
                Err(e) => {
                    tracing::warn!(stage = %stage, "coupling skipped: {e}");
                    report.notes.push(format!("coupling skipped: {e}"));
                }
            }
        }
        Ok(report)
    }

    fn detect_sync(&mut self, stage: Stage) -> Result<StageReport> {
        let p = self.params;
        let optics = Stage::OPTICS_UNSYNCHED.output_dir(p);
        if !io::is_non_empty_dir(&optics) {
            return Err(SomaError::MissingInput {
                stage: stage.name(),
                path: optics,
            });
        }
        let dict = FileDictionary::load(&p.file_dict)?;
        let summary = sync::detect_all(p, &dict)?;
        let mut report = StageReport::new(stage, StageStatus::Ran);
        report.processed = summary.written;
        report.failed = summary.failed;
        report
            .notes
            .push(format!("{} runs need correction", summary.corrected_runs));
        Ok(report)
    }

    fn calibrate(&mut self, stage: Stage) -> Result<StageReport> {
        let summary = calibration::calibrate_all(self.params)?;
        let mut report = StageReport::new(stage, StageStatus::Ran);
        report.processed = summary.runs;
        report.failed = summary.failed;
        report.notes.push(format!(
            "{} amplitudes corrected, {} sensors excluded",
            summary.corrected, summary.excluded
        ));
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn suite(&self) -> Result<Suite> {
        let (python, src) = self.params.toolchain_paths(self.options.toolchain)?;
        Ok(Suite {
            toolchain: self.options.toolchain,
            python,
            src,
        })
    }

    fn line_name(&self, stage: Stage) -> Result<String> {
        let lattice = &self.params.lattice;
        if !lattice.is_file() {
            return Err(SomaError::MissingInput {
                stage: stage.name(),
                path: lattice.clone(),
            });
        }
        sad::line_name(lattice)
    }

    fn write_script(&self, name: &str, body: &str) -> Result<PathBuf> {
        let path = paths::scripts_dir(&self.params.main_output_path).join(name);
        io::atomic_write(&path, body.as_bytes())?;
        Ok(path)
    }

    /// Run one per-input tool call. A failed tool is recorded in `report`;
    /// anything that stops tools from running at all is returned.
    fn run_recoverable(&mut self, inv: &Invocation, input: &str, report: &mut StageReport) -> Result<()> {
        match tool_runner::run_checked(self.runner, inv, input) {
            Ok(()) => {
                report.processed += 1;
                Ok(())
            }
            Err(e) if e.is_recoverable() => {
                tracing::warn!("{e}");
                report.failed.push(input.to_string());
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Converted input of a pass; calibrated optics reads the synched files.
fn converted_dir(params: &Parameters, pass: Pass) -> PathBuf {
    match pass {
        Pass::Unsynched => Stage::CONVERT_UNSYNCHED.output_dir(params),
        Pass::Synched | Pass::Calibrated => Stage::CONVERT_SYNCHED.output_dir(params),
    }
}

fn harmonic_dir(params: &Parameters, pass: Pass) -> PathBuf {
    match pass {
        Pass::Unsynched => Stage::HARMONIC_UNSYNCHED.output_dir(params),
        Pass::Synched => Stage::HARMONIC_SYNCHED.output_dir(params),
        Pass::Calibrated => Stage::CALIBRATE.output_dir(params),
    }
}

/// Chronological order when every run name carries a timestamp after its
/// four-character prefix, otherwise the order given.
pub fn order_runs(runs: Vec<String>) -> Vec<String> {
    let times: Option<Vec<NaiveDateTime>> = runs.iter().map(|r| run_time(r)).collect();
    match times {
        Some(times) => {
            let mut paired: Vec<(NaiveDateTime, String)> = times.into_iter().zip(runs).collect();
            paired.sort_by(|a, b| a.0.cmp(&b.0));
            paired.into_iter().map(|(_, r)| r).collect()
        }
        None => runs,
    }
}

fn run_time(run: &str) -> Option<NaiveDateTime> {
    let stem = run.strip_suffix(paths::CONVERTED_EXT)?;
    let stamp = stem.get(4..)?;
    NaiveDateTime::parse_from_str(stamp, RUN_TIME_FORMAT).ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::Refuse;
    use crate::test_utils::params_in;
    use crate::tool_runner::ToolExit;
    use tempfile::TempDir;

    struct NoTools;
    impl ProcessRunner for NoTools {
        fn run(&mut self, _: &Invocation) -> Result<ToolExit> {
            Ok(ToolExit::ok())
        }
    }

    fn options() -> PipelineOptions {
        PipelineOptions {
            toolchain: Toolchain::Omc3,
            all_files: false,
        }
    }

    #[test]
    fn optics_alone_pulls_in_missing_prerequisites() {
        let dir = TempDir::new().unwrap();
        let params = params_in(dir.path());
        let (mut runner, mut decisions) = (NoTools, Refuse);
        let pipeline = Pipeline::new(&params, options(), &mut runner, &mut decisions);
        let plan = pipeline.plan(&[Stage::OPTICS_UNSYNCHED]);
        assert_eq!(
            plan.stages(),
            vec![
                Stage::MODEL,
                Stage::CONVERT_UNSYNCHED,
                Stage::HARMONIC_UNSYNCHED,
                Stage::OPTICS_UNSYNCHED
            ]
        );
        assert_eq!(plan.steps[3].reason, Reason::Requested);
        assert_eq!(plan.steps[0].reason, Reason::Prerequisite);
    }

    #[test]
    fn completed_prerequisites_are_not_repeated() {
        let dir = TempDir::new().unwrap();
        let params = params_in(dir.path());
        for stage in [Stage::MODEL, Stage::CONVERT_UNSYNCHED] {
            let out = stage.output_dir(&params);
            std::fs::create_dir_all(&out).unwrap();
            std::fs::write(out.join("marker"), b"x").unwrap();
        }
        let (mut runner, mut decisions) = (NoTools, Refuse);
        let pipeline = Pipeline::new(&params, options(), &mut runner, &mut decisions);
        let plan = pipeline.plan(&[Stage::OPTICS_UNSYNCHED]);
        assert_eq!(
            plan.stages(),
            vec![Stage::HARMONIC_UNSYNCHED, Stage::OPTICS_UNSYNCHED]
        );
    }

    #[test]
    fn request_order_does_not_matter() {
        let dir = TempDir::new().unwrap();
        let params = params_in(dir.path());
        let (mut runner, mut decisions) = (NoTools, Refuse);
        let pipeline = Pipeline::new(&params, options(), &mut runner, &mut decisions);
        let a = pipeline.plan(&[Stage::CALIBRATE, Stage::MODEL, Stage::DETECT_SYNC]);
        let b = pipeline.plan(&[Stage::DETECT_SYNC, Stage::CALIBRATE, Stage::MODEL]);
        assert_eq!(a, b);
        let stages = a.stages();
        let mut sorted = stages.clone();
        sorted.sort();
        assert_eq!(stages, sorted);
    }

    #[test]
    fn harmonic_without_converted_files_is_missing_input() {
        let dir = TempDir::new().unwrap();
        let params = params_in(dir.path());
        let (mut runner, mut decisions) = (NoTools, Refuse);
        let mut pipeline = Pipeline::new(&params, options(), &mut runner, &mut decisions);
        match pipeline.run_stage(Stage::HARMONIC_UNSYNCHED) {
            Err(SomaError::MissingInput { stage, path }) => {
                assert_eq!(stage, "harmonic:unsynched");
                assert_eq!(path, params.main_output_path.join(paths::UNSYNCHED_SDDS_DIR));
            }
            other => panic!("expected MissingInput, got {other:?}"),
        }
    }

    #[test]
    fn runs_ordered_by_embedded_time() {
        let runs = vec![
            "HER_2021_05_12_10_31_02.sdds".to_string(),
            "HER_2021_05_12_09_00_00.sdds".to_string(),
        ];
        assert_eq!(
            order_runs(runs.clone()),
            vec![runs[1].clone(), runs[0].clone()]
        );
        let mixed = vec!["HER_b.sdds".to_string(), "HER_2021_05_12_09_00_00.sdds".to_string()];
        assert_eq!(order_runs(mixed.clone()), mixed);
    }
}
