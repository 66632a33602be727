mod cmd;
mod output;

use clap::{Parser, Subcommand};
use cmd::StageArgs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "soma",
    about = "Staged beam-position optics analysis: conversion, harmonic analysis, optics, sync and calibration",
    version,
    propagate_version = true
)]
struct Cli {
    /// Parameters file (YAML, or the legacy `key = value` format)
    #[arg(
        long,
        global = true,
        env = "SOMA_PARAMETERS",
        default_value = "parameters.txt"
    )]
    parameters: PathBuf,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the selected stages, plus any prerequisite whose outputs are missing
    Run {
        #[command(flatten)]
        stages: StageArgs,

        /// Clear populated stage directories without asking
        #[arg(long, conflicts_with_all = ["keep", "no_input"])]
        overwrite: bool,

        /// Keep populated stage directories and skip those stages
        #[arg(long, conflicts_with = "no_input")]
        keep: bool,

        /// Never prompt; a populated stage directory is an error
        #[arg(long)]
        no_input: bool,
    },

    /// Show which stages a run would execute, without running anything
    Plan {
        #[command(flatten)]
        stages: StageArgs,
    },

    /// Show the last recorded outcome of every stage
    Status,
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Run { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Run {
            stages,
            overwrite,
            keep,
            no_input,
        } => {
            let policy = cmd::run::Policy::from_flags(overwrite, keep, no_input);
            cmd::run::run(&cli.parameters, &stages, policy, cli.json)
        }
        Commands::Plan { stages } => cmd::plan::run(&cli.parameters, &stages, cli.json),
        Commands::Status => cmd::status::run(&cli.parameters, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
