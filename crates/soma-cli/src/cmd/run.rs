use super::{load_parameters, StageArgs};
use crate::output::{print_json, print_table};
use anyhow::Context;
use soma_core::decision::{Decision, DecisionProvider, FixedDecision, Prompt, Refuse};
use soma_core::pipeline::{Pipeline, StageReport, StageStatus};
use soma_core::tool_runner::SystemRunner;
use std::path::Path;

/// What to do with a stage whose output directory already has files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    Ask,
    Overwrite,
    Keep,
    Refuse,
}

impl Policy {
    pub fn from_flags(overwrite: bool, keep: bool, no_input: bool) -> Self {
        if overwrite {
            Policy::Overwrite
        } else if keep {
            Policy::Keep
        } else if no_input {
            Policy::Refuse
        } else {
            Policy::Ask
        }
    }

    fn provider(self) -> Box<dyn DecisionProvider> {
        match self {
            Policy::Ask => Box::new(Prompt::new(std::io::stdin().lock(), std::io::stderr())),
            Policy::Overwrite => Box::new(FixedDecision(Decision::Overwrite)),
            Policy::Keep => Box::new(FixedDecision(Decision::Skip)),
            Policy::Refuse => Box::new(Refuse),
        }
    }
}

pub fn run(parameters: &Path, stages: &StageArgs, policy: Policy, json: bool) -> anyhow::Result<()> {
    let requested = stages.require()?;
    let params = load_parameters(parameters)?;
    let options = stages.options();
    tracing::info!(
        toolchain = %options.toolchain,
        all_files = options.all_files,
        main = %params.main_output_path.display(),
        "starting pipeline"
    );

    let mut runner = SystemRunner;
    let mut decisions = policy.provider();
    let reports = Pipeline::new(&params, options, &mut runner, decisions.as_mut())
        .run(&requested)
        .context("pipeline stopped")?;

    if json {
        return print_json(&reports);
    }
    print_reports(&reports);
    Ok(())
}

fn print_reports(reports: &[StageReport]) {
    let rows = reports
        .iter()
        .map(|r| {
            vec![
                r.stage.to_string(),
                match r.status {
                    StageStatus::Ran => "ran".to_string(),
                    StageStatus::Skipped => "skipped".to_string(),
                },
                r.processed.to_string(),
                r.failed.join(", "),
                r.notes.join("; "),
            ]
        })
        .collect();
    print_table(&["STAGE", "STATUS", "PROCESSED", "FAILED", "NOTES"], rows);
}
