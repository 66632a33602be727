use super::{load_parameters, StageArgs};
use crate::output::{print_json, print_table};
use soma_core::decision::Refuse;
use soma_core::pipeline::{Pipeline, Reason};
use soma_core::stage::Stage;
use soma_core::store::StageStore;
use soma_core::tool_runner::{Invocation, ProcessRunner, ToolExit};
use std::path::Path;

/// Stands in for the real runner; planning never spawns anything.
struct NoSpawn;

impl ProcessRunner for NoSpawn {
    fn run(&mut self, invocation: &Invocation) -> soma_core::Result<ToolExit> {
        Err(soma_core::SomaError::ToolSpawnFailed {
            program: invocation.program.display().to_string(),
            reason: "planning only".to_string(),
        })
    }
}

pub fn run(parameters: &Path, stages: &StageArgs, json: bool) -> anyhow::Result<()> {
    let requested = stages.require()?;
    let params = load_parameters(parameters)?;
    let mut runner = NoSpawn;
    let mut decisions = Refuse;
    let pipeline = Pipeline::new(&params, stages.options(), &mut runner, &mut decisions);
    let plan = pipeline.plan(&requested);

    if json {
        return print_json(&plan);
    }

    let store = StageStore::new(&params);
    let rows = plan
        .steps
        .iter()
        .map(|step| {
            vec![
                step.stage.to_string(),
                match step.reason {
                    Reason::Requested => "requested".to_string(),
                    Reason::Prerequisite => "prerequisite".to_string(),
                },
                output_state(&store, step.stage).to_string(),
            ]
        })
        .collect();
    print_table(&["STAGE", "REASON", "OUTPUT"], rows);
    Ok(())
}

fn output_state(store: &StageStore<'_>, stage: Stage) -> &'static str {
    if store.is_complete(stage) {
        "populated (will ask)"
    } else {
        "empty"
    }
}
