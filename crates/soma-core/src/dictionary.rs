//! The file dictionary: raw BPM dumps mapped to canonical converted names.
//!
//! Stored in the SAD list syntax the conversion script reads directly:
//!
//! ```text
//! {
//!     {"/data/raw/HER_2020_01_01_10_00_00.data", "HER_2020_01_01_10_00_00.sdds"},
//!     {"/data/raw/HER_2020_01_01_10_05_00.data", "HER_2020_01_01_10_05_00.sdds"}
//! }
//! ```
//!
//! Entry order is significant: the position of an entry is the index of the
//! repeated measurement it belongs to.

use crate::error::{Result, SomaError};
use crate::paths::{CONVERTED_EXT, RAW_EXT};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DictionaryEntry {
    pub raw: PathBuf,
    pub canonical: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileDictionary {
    entries: Vec<DictionaryEntry>,
}

static ENTRY_RE: OnceLock<Regex> = OnceLock::new();

fn entry_re() -> &'static Regex {
    ENTRY_RE.get_or_init(|| {
        Regex::new(r#"\{\s*"([^"]*)"\s*,\s*"([^"]*)"\s*\}"#).expect("static regex")
    })
}

impl FileDictionary {
    /// Build from explicit entries; canonical names must be unique.
    pub fn from_entries(entries: Vec<DictionaryEntry>) -> Result<Self> {
        {
            let mut seen: HashMap<&str, &Path> = HashMap::new();
            for e in &entries {
                if let Some(first) = seen.insert(e.canonical.as_str(), e.raw.as_path()) {
                    return Err(SomaError::DuplicateCanonicalName {
                        canonical: e.canonical.clone(),
                        first: first.to_path_buf(),
                        second: e.raw.clone(),
                    });
                }
            }
        }
        Ok(Self { entries })
    }

    /// Every `.data` file in `raw_dir` whose name starts with `ring_id`
    /// (case-insensitive), in directory-listing order.
    pub fn build(raw_dir: &Path, ring_id: &str) -> Result<Self> {
        if !raw_dir.is_dir() {
            return Err(SomaError::MissingInput {
                stage: "convert".to_string(),
                path: raw_dir.to_path_buf(),
            });
        }
        let prefix = ring_id.to_lowercase();
        let mut entries = Vec::new();
        for name in crate::io::list_names(raw_dir)? {
            let Some(stem) = name.strip_suffix(RAW_EXT) else {
                continue;
            };
            if !name.to_lowercase().starts_with(&prefix) {
                continue;
            }
            entries.push(DictionaryEntry {
                raw: raw_dir.join(&name),
                canonical: format!("{stem}{CONVERTED_EXT}"),
            });
        }
        tracing::info!(
            dir = %raw_dir.display(),
            ring = ring_id,
            entries = entries.len(),
            "generated file dictionary"
        );
        Ok(Self { entries })
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(SomaError::MissingInput {
                stage: "convert".to_string(),
                path: path.to_path_buf(),
            });
        }
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text, path)
    }

    pub fn parse(text: &str, path: &Path) -> Result<Self> {
        let malformed = |line: usize, reason: String| SomaError::MalformedDictionary {
            path: path.to_path_buf(),
            line,
            reason,
        };

        let open = text
            .find('{')
            .ok_or_else(|| malformed(1, "expected a braced list".to_string()))?;
        let close = text
            .rfind('}')
            .filter(|&c| c > open)
            .ok_or_else(|| malformed(1, "unterminated list".to_string()))?;
        if !text[..open].trim().is_empty() || !text[close + 1..].trim().is_empty() {
            return Err(malformed(1, "text outside the braced list".to_string()));
        }

        let first_line = text[..open].matches('\n').count() + 1;
        let inner = &text[open + 1..close];
        let mut entries = Vec::new();
        let mut seen = HashSet::new();

        for (i, line) in inner.lines().enumerate() {
            let lineno = first_line + i;
            for caps in entry_re().captures_iter(line) {
                let raw = &caps[1];
                let canonical = &caps[2];
                if raw.is_empty() || canonical.is_empty() {
                    return Err(malformed(lineno, "empty path in entry".to_string()));
                }
                if !seen.insert(canonical.to_string()) {
                    return Err(malformed(
                        lineno,
                        format!("duplicate canonical name '{canonical}'"),
                    ));
                }
                entries.push(DictionaryEntry {
                    raw: PathBuf::from(raw),
                    canonical: canonical.to_string(),
                });
            }
            let rest = entry_re().replace_all(line, "");
            if !rest.chars().all(|c| c.is_whitespace() || c == ',') {
                return Err(malformed(
                    lineno,
                    format!("unparsable entry: {}", line.trim()),
                ));
            }
        }
        Ok(Self { entries })
    }

    pub fn render(&self) -> String {
        let body: Vec<String> = self
            .entries
            .iter()
            .map(|e| format!("    {{\"{}\", \"{}\"}}", e.raw.display(), e.canonical))
            .collect();
        format!("{{\n{}\n}}\n", body.join(",\n"))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        crate::io::atomic_write(path, self.render().as_bytes())
    }

    /// Load the dictionary at `path`; when absent and `create` is set,
    /// generate it from `raw_dir` and save it for later passes.
    pub fn ensure(path: &Path, raw_dir: &Path, ring_id: &str, create: bool) -> Result<Self> {
        if path.exists() {
            tracing::info!(path = %path.display(), "file dictionary found");
            return Self::load(path);
        }
        if !create {
            return Err(SomaError::MissingInput {
                stage: "convert".to_string(),
                path: path.to_path_buf(),
            });
        }
        let dict = Self::build(raw_dir, ring_id)?;
        dict.save(path)?;
        Ok(dict)
    }

    pub fn entries(&self) -> &[DictionaryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index of the repeated measurement a canonical name belongs to.
    pub fn position(&self, canonical: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.canonical == canonical)
    }

    /// A copy with entries sorted by canonical name, for deterministic replay.
    pub fn sorted(&self) -> Self {
        let mut entries = self.entries.clone();
        entries.sort_by(|a, b| a.canonical.cmp(&b.canonical));
        Self { entries }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), b"").unwrap();
    }

    #[test]
    fn build_matches_ring_prefix_case_insensitively() {
        let dir = TempDir::new().unwrap();
        for name in [
            "HER_2020_01_01_10_00_00.data",
            "her_2020_01_01_10_05_00.data",
            "LER_2020_01_01_10_00_00.data",
            "HER_notes.txt",
            "xHER_2020.data",
        ] {
            touch(dir.path(), name);
        }
        let dict = FileDictionary::build(dir.path(), "her").unwrap().sorted();
        let names: Vec<&str> = dict.entries().iter().map(|e| e.canonical.as_str()).collect();
        assert_eq!(
            names,
            vec!["HER_2020_01_01_10_00_00.sdds", "her_2020_01_01_10_05_00.sdds"]
        );
        for e in dict.entries() {
            assert!(e.raw.starts_with(dir.path()));
            assert!(e.raw.to_string_lossy().ends_with(".data"));
        }
    }

    #[test]
    fn every_matching_file_appears_exactly_once() {
        let dir = TempDir::new().unwrap();
        for i in 0..12 {
            touch(dir.path(), &format!("HER_{i:02}.data"));
            touch(dir.path(), &format!("LER_{i:02}.data"));
        }
        let dict = FileDictionary::build(dir.path(), "HER").unwrap();
        assert_eq!(dict.len(), 12);
        for i in 0..12 {
            let canonical = format!("HER_{i:02}.sdds");
            assert!(dict.position(&canonical).is_some(), "{canonical} missing");
        }
        assert!(dict.entries().iter().all(|e| !e.canonical.starts_with("LER")));
    }

    #[test]
    fn save_then_load_preserves_order() {
        let dir = TempDir::new().unwrap();
        let dict = FileDictionary::from_entries(vec![
            DictionaryEntry {
                raw: PathBuf::from("/raw/HER_b.data"),
                canonical: "HER_b.sdds".to_string(),
            },
            DictionaryEntry {
                raw: PathBuf::from("/raw/HER_a.data"),
                canonical: "HER_a.sdds".to_string(),
            },
        ])
        .unwrap();
        let path = dir.path().join("file_dict.txt");
        dict.save(&path).unwrap();
        let loaded = FileDictionary::load(&path).unwrap();
        assert_eq!(loaded, dict);
        assert_eq!(loaded.position("HER_b.sdds"), Some(0));
    }

    #[test]
    fn duplicate_entries_name_both_raw_files() {
        let entry = |raw: &str| DictionaryEntry {
            raw: PathBuf::from(raw),
            canonical: "HER_a.sdds".to_string(),
        };
        let err = FileDictionary::from_entries(vec![entry("/raw/HER_a.data"), entry("/old/HER_a.data")])
            .unwrap_err();
        match &err {
            SomaError::DuplicateCanonicalName {
                canonical,
                first,
                second,
            } => {
                assert_eq!(canonical, "HER_a.sdds");
                assert_eq!(first, Path::new("/raw/HER_a.data"));
                assert_eq!(second, Path::new("/old/HER_a.data"));
            }
            other => panic!("expected DuplicateCanonicalName, got {other:?}"),
        }
        let message = err.to_string();
        assert!(message.contains("/raw/HER_a.data"));
        assert!(message.contains("/old/HER_a.data"));
    }

    #[test]
    fn parses_single_line_list() {
        let text = r#"{{"/r/a.data", "a.sdds"}, {"/r/b.data", "b.sdds"}}"#;
        let dict = FileDictionary::parse(text, Path::new("d.txt")).unwrap();
        assert_eq!(dict.len(), 2);
        assert_eq!(dict.entries()[1].canonical, "b.sdds");
    }

    #[test]
    fn malformed_entry_reports_line() {
        let text = "{\n    {\"/r/a.data\", \"a.sdds\"},\n    {\"/r/b.data\" \"b.sdds\"}\n}\n";
        match FileDictionary::parse(text, Path::new("d.txt")) {
            Err(SomaError::MalformedDictionary { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected MalformedDictionary, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_canonical_is_malformed() {
        let text = "{\n    {\"/r/a.data\", \"a.sdds\"},\n    {\"/r/b.data\", \"a.sdds\"}\n}\n";
        assert!(matches!(
            FileDictionary::parse(text, Path::new("d.txt")),
            Err(SomaError::MalformedDictionary { line: 3, .. })
        ));
    }

    #[test]
    fn ensure_creates_missing_dictionary() {
        let dir = TempDir::new().unwrap();
        let raw = dir.path().join("raw");
        std::fs::create_dir_all(&raw).unwrap();
        touch(&raw, "LER_1.data");
        let path = dir.path().join("file_dict.txt");

        assert!(matches!(
            FileDictionary::ensure(&path, &raw, "LER", false),
            Err(SomaError::MissingInput { .. })
        ));
        let dict = FileDictionary::ensure(&path, &raw, "LER", true).unwrap();
        assert_eq!(dict.len(), 1);
        assert!(path.exists());
    }
}
