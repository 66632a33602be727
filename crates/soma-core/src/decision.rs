//! Decisions about stages whose output directory is already populated.
//!
//! The controller never clears a populated directory on its own. It asks a
//! [`DecisionProvider`], which may be a terminal prompt, a fixed policy for
//! unattended runs, or a provider that refuses to decide.

use crate::stage::Stage;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Clear the directory and run the stage again.
    Overwrite,
    /// Keep the existing outputs and move on.
    Skip,
    /// No answer yet; the controller asks again.
    AskAgain,
}

pub struct DecisionRequest<'a> {
    pub stage: Stage,
    pub dir: &'a Path,
    pub contents: &'a [String],
}

pub trait DecisionProvider {
    /// `None` means no decision can be obtained.
    fn decide(&mut self, request: &DecisionRequest<'_>) -> Option<Decision>;
}

// ---------------------------------------------------------------------------
// Fixed policies
// ---------------------------------------------------------------------------

/// Same answer for every stage (`--overwrite` / `--keep`).
pub struct FixedDecision(pub Decision);

impl DecisionProvider for FixedDecision {
    fn decide(&mut self, _request: &DecisionRequest<'_>) -> Option<Decision> {
        Some(self.0)
    }
}

/// Never decides; every populated stage is a `DestructiveActionNotConfirmed`.
pub struct Refuse;

impl DecisionProvider for Refuse {
    fn decide(&mut self, _request: &DecisionRequest<'_>) -> Option<Decision> {
        None
    }
}

// ---------------------------------------------------------------------------
// Prompt
// ---------------------------------------------------------------------------

/// Asks on a line-oriented terminal: `yes`, `no` or `show`.
pub struct Prompt<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> Prompt<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }
}

impl<R: BufRead, W: Write> DecisionProvider for Prompt<R, W> {
    fn decide(&mut self, request: &DecisionRequest<'_>) -> Option<Decision> {
        let _ = writeln!(
            self.output,
            "[{}] {} contains files. Clean it and start from scratch? (yes, no, show)",
            request.stage,
            request.dir.display()
        );
        let _ = self.output.flush();

        let mut line = String::new();
        match self.input.read_line(&mut line) {
            Ok(0) | Err(_) => return None,
            Ok(_) => {}
        }
        match line.trim() {
            "yes" | "y" => Some(Decision::Overwrite),
            "no" | "n" => Some(Decision::Skip),
            "show" | "show contents" => {
                for name in request.contents {
                    let _ = writeln!(self.output, "  {name}");
                }
                Some(Decision::AskAgain)
            }
            other => {
                let _ = writeln!(self.output, "Please answer yes, no or show (got '{other}').");
                Some(Decision::AskAgain)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn request<'a>(contents: &'a [String]) -> DecisionRequest<'a> {
        DecisionRequest {
            stage: Stage::CONVERT_UNSYNCHED,
            dir: Path::new("/out/unsynched_sdds"),
            contents,
        }
    }

    #[test]
    fn prompt_maps_answers() {
        let contents = vec!["a.sdds".to_string()];
        let mut out = Vec::new();
        let mut p = Prompt::new(Cursor::new("show\nmaybe\nyes\n"), &mut out);
        assert_eq!(p.decide(&request(&contents)), Some(Decision::AskAgain));
        assert_eq!(p.decide(&request(&contents)), Some(Decision::AskAgain));
        assert_eq!(p.decide(&request(&contents)), Some(Decision::Overwrite));
        assert_eq!(p.decide(&request(&contents)), None);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("a.sdds"));
        assert!(text.contains("convert:unsynched"));
    }

    #[test]
    fn fixed_and_refuse() {
        let contents = Vec::new();
        assert_eq!(
            FixedDecision(Decision::Skip).decide(&request(&contents)),
            Some(Decision::Skip)
        );
        assert_eq!(Refuse.decide(&request(&contents)), None);
    }
}
