pub mod plan;
pub mod run;
pub mod status;

use anyhow::Context;
use clap::Args;
use soma_core::config::Parameters;
use soma_core::pipeline::PipelineOptions;
use soma_core::stage::Stage;
use soma_core::types::Toolchain;
use std::path::Path;

/// Stage selection shared by `run` and `plan`. Flags may be given in any
/// order; stages always execute in pipeline order.
#[derive(Args, Debug, Default)]
pub struct StageArgs {
    /// Build the model and the off-momentum sweep
    #[arg(long)]
    pub model: bool,
    /// Convert raw files without sync correction
    #[arg(long)]
    pub convert1: bool,
    /// Harmonic analysis of the unsynched files
    #[arg(long)]
    pub harmonic1: bool,
    /// Optics of the unsynched files
    #[arg(long)]
    pub optics1: bool,
    /// Detect out-of-sync sensors from the unsynched optics
    #[arg(long)]
    pub asynch: bool,
    /// Convert raw files again, applying the sync corrections
    #[arg(long)]
    pub convert2: bool,
    /// Harmonic analysis of the synched files
    #[arg(long)]
    pub harmonic2: bool,
    /// Optics of the synched files, plus coupling
    #[arg(long)]
    pub optics2: bool,
    /// Calibrate the synched harmonic amplitudes
    #[arg(long)]
    pub calib: bool,
    /// Optics of the calibrated files
    #[arg(long)]
    pub optics3: bool,
    /// Every stage
    #[arg(long)]
    pub all: bool,

    /// Run optics over all files at once into `average/` and fit chromaticity
    #[arg(long, visible_alias = "all_files")]
    pub all_files: bool,
    /// Use omc3 (python 3) instead of BetaBeat.src
    #[arg(long)]
    pub omc3: bool,
}

impl StageArgs {
    /// Selected stages in pipeline order.
    pub fn requested(&self) -> Vec<Stage> {
        if self.all {
            return Stage::pipeline_order().to_vec();
        }
        let flags = [
            (self.model, Stage::MODEL),
            (self.convert1, Stage::CONVERT_UNSYNCHED),
            (self.harmonic1, Stage::HARMONIC_UNSYNCHED),
            (self.optics1, Stage::OPTICS_UNSYNCHED),
            (self.asynch, Stage::DETECT_SYNC),
            (self.convert2, Stage::CONVERT_SYNCHED),
            (self.harmonic2, Stage::HARMONIC_SYNCHED),
            (self.optics2, Stage::OPTICS_SYNCHED),
            (self.calib, Stage::CALIBRATE),
            (self.optics3, Stage::OPTICS_CALIBRATED),
        ];
        flags
            .into_iter()
            .filter_map(|(on, stage)| on.then_some(stage))
            .collect()
    }

    /// Like [`requested`](Self::requested), but an empty selection is an error.
    pub fn require(&self) -> anyhow::Result<Vec<Stage>> {
        let stages = self.requested();
        if stages.is_empty() {
            anyhow::bail!("no stage selected (use --all or a stage flag such as --model, see --help)");
        }
        Ok(stages)
    }

    pub fn options(&self) -> PipelineOptions {
        PipelineOptions {
            toolchain: if self.omc3 {
                Toolchain::Omc3
            } else {
                Toolchain::BetaBeat
            },
            all_files: self.all_files,
        }
    }
}

pub fn load_parameters(path: &Path) -> anyhow::Result<Parameters> {
    Parameters::load(path)
        .with_context(|| format!("failed to load parameters from {}", path.display()))
}
