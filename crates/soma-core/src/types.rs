use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Axis
// ---------------------------------------------------------------------------

/// Transverse plane. Used both for BPM readings and optics tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    #[serde(alias = "X")]
    X,
    #[serde(alias = "Y")]
    Y,
}

impl Axis {
    pub fn all() -> &'static [Axis] {
        &[Axis::X, Axis::Y]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Axis::X => "x",
            Axis::Y => "y",
        }
    }

    /// Upper-case suffix used in TFS column names (`BETX`, `DELTAPHY`, ...).
    pub fn upper(self) -> &'static str {
        match self {
            Axis::X => "X",
            Axis::Y => "Y",
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Axis {
    type Err = crate::error::SomaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "x" => Ok(Axis::X),
            "y" => Ok(Axis::Y),
            _ => Err(crate::error::SomaError::MissingParameter(format!(
                "axis '{s}' (expected x or y)"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Toolchain
// ---------------------------------------------------------------------------

/// Which analysis suite provides the harmonic and optics tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Toolchain {
    /// BetaBeat.src under python 2 (`hole_in_one.py` + `GetLLM.py`).
    BetaBeat,
    /// omc3 under python 3 (`hole_in_one.py --harpy/--optics`).
    Omc3,
}

impl Toolchain {
    pub fn as_str(self) -> &'static str {
        match self {
            Toolchain::BetaBeat => "betabeat",
            Toolchain::Omc3 => "omc3",
        }
    }
}

impl fmt::Display for Toolchain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
