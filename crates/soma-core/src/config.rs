use crate::error::{Result, SomaError};
use crate::types::{Axis, Toolchain};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Everything a pipeline run needs to know about the study: where the raw
/// data lives, the lattice, output locations and the external executables.
///
/// Loaded from YAML, or from the legacy `key = value` parameters file where
/// `#` starts a comment line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameters {
    pub nturns: u32,
    #[serde(rename = "ringID")]
    pub ring_id: String,
    pub lattice: PathBuf,
    pub input_data_path: PathBuf,
    pub kickax: Axis,
    pub model_path: PathBuf,
    pub main_output_path: PathBuf,
    pub file_dict: PathBuf,
    pub gsad: PathBuf,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python_exe: Option<PathBuf>,
    #[serde(rename = "BetaBeatsrc_path", default, skip_serializing_if = "Option::is_none")]
    pub betabeat_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python3_exe: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub omc3_path: Option<PathBuf>,

    #[serde(default)]
    pub tuning: Tuning,
}

/// Optional knobs; every field has the value the pipeline has always used.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tuning {
    /// SAD helper library loaded by every generated script.
    #[serde(default = "default_sad_library")]
    pub sad_library: String,
    /// Script that splits oversized converted files into turn windows.
    #[serde(default = "default_cut_script")]
    pub cut_script: PathBuf,
    /// Converted files above this many bytes are split.
    #[serde(default = "default_large_file_bytes")]
    pub large_file_bytes: u64,
    /// Tune search window handed to the harmonic analysis.
    #[serde(default = "default_tune_tolerance")]
    pub tune_tolerance: f64,
    /// Phase differences this close to a half turn are left undetermined.
    #[serde(default = "default_ambiguity_margin")]
    pub sync_ambiguity_margin: f64,
    /// Model points beyond this momentum deviation are not fitted.
    #[serde(default = "default_model_dpp_limit")]
    pub chroma_model_dpp_limit: f64,
    /// Generate the file dictionary from the raw directory when it is absent.
    #[serde(default = "default_true")]
    pub create_missing_dictionary: bool,
}

fn default_sad_library() -> String {
    "func.n".to_string()
}

fn default_cut_script() -> PathBuf {
    PathBuf::from("cutSDDS.py")
}

fn default_large_file_bytes() -> u64 {
    100_000_000
}

fn default_tune_tolerance() -> f64 {
    0.1
}

fn default_ambiguity_margin() -> f64 {
    0.05
}

fn default_model_dpp_limit() -> f64 {
    2.5e-3
}

fn default_true() -> bool {
    true
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            sad_library: default_sad_library(),
            cut_script: default_cut_script(),
            large_file_bytes: default_large_file_bytes(),
            tune_tolerance: default_tune_tolerance(),
            sync_ambiguity_margin: default_ambiguity_margin(),
            chroma_model_dpp_limit: default_model_dpp_limit(),
            create_missing_dictionary: default_true(),
        }
    }
}

impl Parameters {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(SomaError::MissingInput {
                stage: "parameters".to_string(),
                path: path.to_path_buf(),
            });
        }
        let data = std::fs::read_to_string(path)?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        if is_yaml {
            Ok(serde_yaml::from_str(&data)?)
        } else {
            Self::from_legacy(&data)
        }
    }

    /// Parse the `key = value` format. The value is everything after the
    /// second whitespace-separated token, rejoined with single spaces.
    pub fn from_legacy(data: &str) -> Result<Self> {
        let mut map = Mapping::new();
        let mut tuning = Mapping::new();
        for line in data.lines() {
            if line.starts_with('#') {
                continue;
            }
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let Some(key) = tokens.first() else {
                continue;
            };
            let value = tokens.get(2..).map(|t| t.join(" ")).unwrap_or_default();
            let target = if TUNING_KEYS.contains(key) {
                &mut tuning
            } else {
                &mut map
            };
            target.insert(Value::String((*key).to_string()), scalar(&value));
        }
        if !tuning.is_empty() {
            map.insert(Value::String("tuning".to_string()), Value::Mapping(tuning));
        }
        let params: Parameters = serde_yaml::from_value(Value::Mapping(map))?;
        Ok(params)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(path, data.as_bytes())
    }

    /// Ring identifier as used on the optics command line (lower case).
    pub fn ring(&self) -> String {
        self.ring_id.to_lowercase()
    }

    /// Interpreter and source root of the selected analysis suite.
    pub fn toolchain_paths(&self, toolchain: Toolchain) -> Result<(PathBuf, PathBuf)> {
        let (exe, exe_key, src, src_key) = match toolchain {
            Toolchain::BetaBeat => (
                &self.python_exe,
                "python_exe",
                &self.betabeat_path,
                "BetaBeatsrc_path",
            ),
            Toolchain::Omc3 => (
                &self.python3_exe,
                "python3_exe",
                &self.omc3_path,
                "omc3_path",
            ),
        };
        let exe = exe
            .clone()
            .ok_or_else(|| SomaError::MissingParameter(exe_key.to_string()))?;
        let src = src
            .clone()
            .ok_or_else(|| SomaError::MissingParameter(src_key.to_string()))?;
        Ok((exe, src))
    }
}

const TUNING_KEYS: &[&str] = &[
    "sad_library",
    "cut_script",
    "large_file_bytes",
    "tune_tolerance",
    "sync_ambiguity_margin",
    "chroma_model_dpp_limit",
    "create_missing_dictionary",
];

/// Interpret a legacy value as a YAML scalar so numbers and booleans land in
/// typed fields; anything structured stays a plain string.
fn scalar(raw: &str) -> Value {
    match serde_yaml::from_str::<Value>(raw) {
        Ok(v @ (Value::Number(_) | Value::Bool(_) | Value::String(_))) => v,
        _ => Value::String(raw.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const LEGACY: &str = "\
# SuperKEKB HER study
nturns = 4000
ringID = HER
lattice = /data/lattice/sher.sad
input_data_path = /data/raw/
kickax = X
model_path = /data/model/
main_output_path = /data/out/
file_dict = /data/file_dict.txt
gsad = /usr/local/bin/gs
python3_exe = /usr/bin/python3
omc3_path = /opt/omc3/omc3/
tune_tolerance = 0.05
";

    #[test]
    fn legacy_file_parses_into_typed_fields() {
        let p = Parameters::from_legacy(LEGACY).unwrap();
        assert_eq!(p.nturns, 4000);
        assert_eq!(p.ring(), "her");
        assert_eq!(p.kickax, Axis::X);
        assert_eq!(p.main_output_path, PathBuf::from("/data/out/"));
        assert!(p.python_exe.is_none());
        assert!((p.tuning.tune_tolerance - 0.05).abs() < 1e-12);
        assert_eq!(p.tuning.sad_library, "func.n");
    }

    #[test]
    fn missing_required_key_fails() {
        let data = LEGACY.replace("nturns = 4000\n", "");
        assert!(Parameters::from_legacy(&data).is_err());
    }

    #[test]
    fn toolchain_paths_report_missing_key() {
        let p = Parameters::from_legacy(LEGACY).unwrap();
        let (exe, src) = p.toolchain_paths(Toolchain::Omc3).unwrap();
        assert_eq!(exe, PathBuf::from("/usr/bin/python3"));
        assert_eq!(src, PathBuf::from("/opt/omc3/omc3/"));
        match p.toolchain_paths(Toolchain::BetaBeat) {
            Err(SomaError::MissingParameter(k)) => assert_eq!(k, "python_exe"),
            other => panic!("expected MissingParameter, got {other:?}"),
        }
    }

    #[test]
    fn yaml_roundtrip() {
        let dir = TempDir::new().unwrap();
        let p = Parameters::from_legacy(LEGACY).unwrap();
        let path = dir.path().join("parameters.yaml");
        p.save(&path).unwrap();
        let loaded = Parameters::load(&path).unwrap();
        assert_eq!(loaded.nturns, 4000);
        assert_eq!(loaded.ring_id, "HER");
        assert_eq!(loaded.omc3_path, p.omc3_path);
    }

    #[test]
    fn missing_file_is_missing_input() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            Parameters::load(&dir.path().join("nope.txt")),
            Err(SomaError::MissingInput { .. })
        ));
    }
}
