use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SomaError {
    #[error("stage '{stage}': missing input {}", path.display())]
    MissingInput { stage: String, path: PathBuf },

    #[error("malformed file dictionary {} (line {line}): {reason}", path.display())]
    MalformedDictionary {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("raw files {} and {} both convert to '{canonical}'", first.display(), second.display())]
    DuplicateCanonicalName {
        canonical: String,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("{tool} failed on {input} (exit code {code:?})")]
    ExternalToolFailure {
        tool: String,
        input: String,
        code: Option<i32>,
    },

    #[error("fit failed: {0}")]
    FitFailure(String),

    #[error("stage '{stage}': {} is not empty and no overwrite decision was given", path.display())]
    DestructiveActionNotConfirmed { stage: String, path: PathBuf },

    #[error("no phase output for run '{run}' in {}", dir.display())]
    NoPhaseOutput { run: String, dir: PathBuf },

    #[error("malformed table {}: {reason}", path.display())]
    MalformedTable { path: PathBuf, reason: String },

    #[error("missing parameter '{0}'")]
    MissingParameter(String),

    #[error("executable not found: {0}")]
    ToolNotFound(String),

    #[error("failed to spawn {program}: {reason}")]
    ToolSpawnFailed { program: String, reason: String },

    #[error("invalid stage: {0}")]
    InvalidStage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl SomaError {
    /// Per-file failures that a batch stage records and moves past.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SomaError::ExternalToolFailure { .. }
                | SomaError::NoPhaseOutput { .. }
                | SomaError::FitFailure(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SomaError>;
