use super::load_parameters;
use crate::output::{print_json, print_table};
use anyhow::Context;
use serde::Serialize;
use soma_core::ledger::{HistoryEntry, Ledger, Outcome};
use soma_core::stage::Stage;
use soma_core::store::StageStore;
use std::path::Path;

#[derive(Serialize)]
struct StageStatusRow<'a> {
    stage: String,
    populated: bool,
    last: Option<&'a HistoryEntry>,
}

pub fn run(parameters: &Path, json: bool) -> anyhow::Result<()> {
    let params = load_parameters(parameters)?;
    let main = &params.main_output_path;
    let ledger = Ledger::load(main)
        .with_context(|| format!("failed to read pipeline ledger in {}", main.display()))?;
    let store = StageStore::new(&params);

    let rows: Vec<StageStatusRow> = Stage::pipeline_order()
        .iter()
        .map(|&stage| StageStatusRow {
            stage: stage.to_string(),
            populated: store.is_complete(stage),
            last: ledger.last_for(stage),
        })
        .collect();

    if json {
        return print_json(&rows);
    }

    if ledger.history.is_empty() {
        println!("No stage has run yet in {}.", main.display());
    }
    let table = rows
        .iter()
        .map(|row| {
            let (outcome, when, processed, note) = match row.last {
                Some(entry) => (
                    outcome_label(entry.outcome),
                    entry.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
                    entry.processed.to_string(),
                    entry.note.clone().unwrap_or_default(),
                ),
                None => ("-", "-".to_string(), "-".to_string(), String::new()),
            };
            vec![
                row.stage.clone(),
                if row.populated { "yes" } else { "no" }.to_string(),
                outcome.to_string(),
                when,
                processed,
                note,
            ]
        })
        .collect();
    print_table(
        &["STAGE", "OUTPUT", "LAST", "AT (UTC)", "PROCESSED", "NOTE"],
        table,
    );
    Ok(())
}

fn outcome_label(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::Ran => "ran",
        Outcome::Skipped => "skipped",
        Outcome::Failed => "failed",
    }
}
