//! Typed invocations of the external tools and the process abstraction that
//! executes them.
//!
//! Every tool call is an [`Invocation`]: program, argument vector and working
//! directory. Nothing is assembled into a shell string. A [`ProcessRunner`]
//! executes invocations; [`SystemRunner`] spawns real processes and tests
//! substitute their own runner.
//!
//! # Tools
//! - SAD (`gsad <script>`): conversion, model and off-momentum sweep
//! - harmonic analysis: `hole_in_one.py --harpy` (omc3) or the BetaBeat.src
//!   `hole_in_one.py ... harpy` form
//! - optics analysis: `hole_in_one.py --optics` (omc3) or `GetLLM/GetLLM.py`
//! - file splitting: `cutSDDS.py`

use crate::error::{Result, SomaError};
use crate::paths;
use crate::tfs::TfsTable;
use crate::types::Toolchain;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

const ACCELERATOR: &str = "skekb";

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Sad,
    Harmonic,
    Optics,
    Cut,
}

impl ToolKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolKind::Sad => "sad",
            ToolKind::Harmonic => "harmonic",
            ToolKind::Optics => "optics",
            ToolKind::Cut => "cut",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Invocation {
    pub tool: ToolKind,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl Invocation {
    fn new(tool: ToolKind, program: &Path) -> Self {
        Self {
            tool,
            program: program.to_path_buf(),
            args: Vec::new(),
            cwd: None,
        }
    }

    fn arg(mut self, a: impl AsRef<str>) -> Self {
        self.args.push(a.as_ref().to_string());
        self
    }

    fn path(self, p: &Path) -> Self {
        let s = p.to_string_lossy().into_owned();
        self.arg(s)
    }

    pub fn in_dir(mut self, cwd: &Path) -> Self {
        self.cwd = Some(cwd.to_path_buf());
        self
    }

    /// Display form for logs and dry runs.
    pub fn command_line(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// Exit of a finished tool process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolExit {
    pub success: bool,
    pub code: Option<i32>,
}

impl ToolExit {
    pub fn ok() -> Self {
        Self {
            success: true,
            code: Some(0),
        }
    }

    pub fn failed(code: i32) -> Self {
        Self {
            success: false,
            code: Some(code),
        }
    }
}

// ---------------------------------------------------------------------------
// ProcessRunner
// ---------------------------------------------------------------------------

pub trait ProcessRunner {
    /// Run to completion. `Err` only when the process could not be started;
    /// a non-zero exit is reported through [`ToolExit`].
    fn run(&mut self, invocation: &Invocation) -> Result<ToolExit>;
}

/// Run `invocation` and turn a non-zero exit into `ExternalToolFailure`.
pub fn run_checked(
    runner: &mut dyn ProcessRunner,
    invocation: &Invocation,
    input: &str,
) -> Result<()> {
    tracing::debug!(tool = invocation.tool.as_str(), cmd = %invocation.command_line(), "invoking");
    let exit = runner.run(invocation)?;
    if exit.success {
        Ok(())
    } else {
        Err(SomaError::ExternalToolFailure {
            tool: invocation.tool.as_str().to_string(),
            input: input.to_string(),
            code: exit.code,
        })
    }
}

/// Blocking subprocesses; tool output flows through to the terminal.
#[derive(Debug, Default)]
pub struct SystemRunner;

impl ProcessRunner for SystemRunner {
    fn run(&mut self, invocation: &Invocation) -> Result<ToolExit> {
        let program = resolve_program(&invocation.program)?;
        let mut cmd = Command::new(&program);
        cmd.args(&invocation.args);
        if let Some(cwd) = &invocation.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());

        let status = cmd.status().map_err(|e| SomaError::ToolSpawnFailed {
            program: program.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(ToolExit {
            success: status.success(),
            code: status.code(),
        })
    }
}

/// Bare names are looked up on `PATH`; anything with a directory part must
/// exist as given.
pub fn resolve_program(program: &Path) -> Result<PathBuf> {
    if program.components().count() > 1 {
        if program.exists() {
            return Ok(program.to_path_buf());
        }
        return Err(SomaError::ToolNotFound(program.display().to_string()));
    }
    which::which(program).map_err(|_| SomaError::ToolNotFound(program.display().to_string()))
}

// ---------------------------------------------------------------------------
// Tunes
// ---------------------------------------------------------------------------

/// Fractional tunes used as harmonic-analysis guesses.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tunes {
    pub x: f64,
    pub y: f64,
}

impl Tunes {
    /// Read `Q1`/`Q2` from the model twiss table and keep the fractional part.
    pub fn from_model(model_dir: &Path) -> Result<Self> {
        let path = paths::twiss_path(model_dir);
        if !path.exists() {
            return Err(SomaError::MissingInput {
                stage: "harmonic".to_string(),
                path,
            });
        }
        let table = TfsTable::read(&path)?;
        let q1 = table.header_f64("Q1")?;
        let q2 = table.header_f64("Q2")?;
        Ok(Self {
            x: q1 - q1.floor(),
            y: q2 - q2.floor(),
        })
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// Analysis suite location: interpreter plus source root.
#[derive(Debug, Clone)]
pub struct Suite {
    pub toolchain: Toolchain,
    pub python: PathBuf,
    pub src: PathBuf,
}

pub fn sad(gsad: &Path, script: &Path) -> Invocation {
    Invocation::new(ToolKind::Sad, gsad).path(script)
}

pub struct HarmonicArgs<'a> {
    pub file: &'a Path,
    pub output_dir: &'a Path,
    pub model_dir: &'a Path,
    pub tunes: Tunes,
    pub nturns: u32,
    pub tolerance: f64,
}

pub fn harmonic(suite: &Suite, a: &HarmonicArgs<'_>) -> Invocation {
    let twiss = paths::twiss_path(a.model_dir);
    let base = Invocation::new(ToolKind::Harmonic, &suite.python)
        .path(&suite.src.join("hole_in_one.py"));
    match suite.toolchain {
        Toolchain::Omc3 => base
            .arg("--harpy")
            .arg("--files")
            .path(a.file)
            .arg("--outputdir")
            .path(a.output_dir)
            .arg("--model")
            .path(&twiss)
            .arg("--tunes")
            .arg(a.tunes.x.to_string())
            .arg(a.tunes.y.to_string())
            .arg("0")
            .arg("--nattunes")
            .arg(a.tunes.x.to_string())
            .arg(a.tunes.y.to_string())
            .arg("0")
            .arg("--turns")
            .arg("0")
            .arg(a.nturns.to_string())
            .arg("--tolerance")
            .arg(a.tolerance.to_string())
            .arg("--unit")
            .arg("mm")
            .arg("--to_write")
            .arg("lin")
            .arg("--sing_val")
            .arg("20")
            .arg("--max_peak")
            .arg("10.0")
            .arg("--tune_clean_limit")
            .arg("1e-3"),
        Toolchain::BetaBeat => base
            .arg("--file")
            .path(a.file)
            .arg("--outputdir")
            .path(a.output_dir)
            .arg("--model")
            .path(&twiss)
            .arg("--startturn")
            .arg("2")
            .arg("--endturn")
            .arg(a.nturns.to_string())
            .arg("harpy")
            .arg("--harpy_mode")
            .arg("bpm")
            .arg(format!("--tunex={}", a.tunes.x))
            .arg(format!("--tuney={}", a.tunes.y))
            .arg(format!("--nattunex={}", a.tunes.x))
            .arg(format!("--nattuney={}", a.tunes.y))
            .arg(format!("--tolerance={}", a.tolerance))
            .arg("--tune_clean_limit=1e-4"),
    }
}

/// Optics of a single run, written to `output_dir`.
pub fn optics_single(
    suite: &Suite,
    file: &Path,
    output_dir: &Path,
    model_dir: &Path,
    ring: &str,
) -> Invocation {
    match suite.toolchain {
        Toolchain::Omc3 => Invocation::new(ToolKind::Optics, &suite.python)
            .path(&suite.src.join("hole_in_one.py"))
            .arg("--optics")
            .arg("--files")
            .path(file)
            .arg("--outputdir")
            .path(output_dir)
            .arg("--model_dir")
            .path(model_dir)
            .arg("--accel")
            .arg(ACCELERATOR)
            .arg("--ring")
            .arg(ring)
            .arg("--compensation")
            .arg("none"),
        Toolchain::BetaBeat => Invocation::new(ToolKind::Optics, &suite.python)
            .path(&suite.src.join("GetLLM").join("GetLLM.py"))
            .arg("--model")
            .path(&paths::twiss_path(model_dir))
            .arg("--accel")
            .arg(ACCELERATOR)
            .arg("--files")
            .path(file)
            .arg("-b")
            .arg("m")
            .arg("--coupling")
            .arg("0")
            .arg("--output")
            .path(output_dir),
    }
}

/// Optics averaged over every run at once.
pub fn optics_batch(
    suite: &Suite,
    files: &[PathBuf],
    output_dir: &Path,
    model_dir: &Path,
    ring: &str,
) -> Invocation {
    match suite.toolchain {
        Toolchain::Omc3 => {
            let mut inv = Invocation::new(ToolKind::Optics, &suite.python)
                .path(&suite.src.join("hole_in_one.py"))
                .arg("--optics")
                .arg("--accel")
                .arg(ACCELERATOR)
                .arg("--ring")
                .arg(ring)
                .arg("--compensation")
                .arg("none")
                .arg("--model_dir")
                .path(model_dir)
                .arg("--outputdir")
                .path(output_dir)
                .arg("--files");
            for f in files {
                inv = inv.path(f);
            }
            inv
        }
        Toolchain::BetaBeat => {
            let joined = files
                .iter()
                .map(|f| f.to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join(",");
            Invocation::new(ToolKind::Optics, &suite.python)
                .path(&suite.src.join("GetLLM").join("GetLLM.py"))
                .arg("--model")
                .path(&paths::twiss_path(model_dir))
                .arg("--accel")
                .arg(ACCELERATOR)
                .arg("--files")
                .arg(joined)
                .arg("-k")
                .arg("10000")
                .arg("-e")
                .arg("10000")
                .arg("-b")
                .arg("m")
                .arg("--coupling")
                .arg("0")
                .arg("--output")
                .path(output_dir)
        }
    }
}

/// Split `file` into the turn window `start..end`.
pub fn cut(python: &Path, script: &Path, file: &Path, output_dir: &Path, start: u32, end: u32) -> Invocation {
    Invocation::new(ToolKind::Cut, python)
        .path(script)
        .arg("--file")
        .path(file)
        .arg("--output")
        .path(output_dir)
        .arg("--start")
        .arg(start.to_string())
        .arg("--end")
        .arg(end.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
