//! Reader and writer for the TFS table format shared by the model, harmonic
//! and optics tools.
//!
//! ```text
//! @ Q1 %le 44.53          header: name, type, value
//! * NAME S BETX           column names
//! $ %s %le %le            column types
//!  "BPM1" 10.2 14.7       one row per element
//! ```
//!
//! Legacy `.out` files from the BetaBeat.src suite use the same layout.

use crate::error::{Result, SomaError};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TfsTable {
    pub headers: Vec<(String, String, String)>,
    pub columns: Vec<String>,
    pub types: Vec<String>,
    pub rows: Vec<Vec<String>>,
    source: PathBuf,
}

impl TfsTable {
    /// Empty table with the given `(name, type)` columns.
    pub fn new(columns: &[(&str, &str)]) -> Self {
        Self {
            columns: columns.iter().map(|(n, _)| n.to_string()).collect(),
            types: columns.iter().map(|(_, t)| t.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text, path)
    }

    pub fn parse(text: &str, source: &Path) -> Result<Self> {
        let mut table = TfsTable {
            source: source.to_path_buf(),
            ..Self::default()
        };
        for (lineno, line) in text.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if let Some(rest) = trimmed.strip_prefix('@') {
                let mut tokens = rest.split_whitespace();
                let name = tokens.next().unwrap_or_default().to_string();
                let kind = tokens.next().unwrap_or_default().to_string();
                let value = tokens.collect::<Vec<_>>().join(" ");
                table.headers.push((name, kind, unquote(&value).to_string()));
            } else if let Some(rest) = trimmed.strip_prefix('*') {
                table.columns = rest.split_whitespace().map(str::to_string).collect();
            } else if let Some(rest) = trimmed.strip_prefix('$') {
                table.types = rest.split_whitespace().map(str::to_string).collect();
            } else {
                let row: Vec<String> = trimmed
                    .split_whitespace()
                    .map(|t| unquote(t).to_string())
                    .collect();
                if !table.columns.is_empty() && row.len() < table.columns.len() {
                    return Err(table.malformed(format!(
                        "line {}: expected {} fields, found {}",
                        lineno + 1,
                        table.columns.len(),
                        row.len()
                    )));
                }
                table.rows.push(row);
            }
        }
        Ok(table)
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    // -----------------------------------------------------------------------
    // Headers
    // -----------------------------------------------------------------------

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _, _)| n == name)
            .map(|(_, _, v)| v.as_str())
    }

    pub fn header_f64(&self, name: &str) -> Result<f64> {
        let raw = self
            .header(name)
            .ok_or_else(|| self.malformed(format!("missing header '{name}'")))?;
        raw.parse::<f64>()
            .map_err(|_| self.malformed(format!("header '{name}' is not a number: {raw}")))
    }

    pub fn push_header(&mut self, name: &str, kind: &str, value: impl Into<String>) {
        self.headers
            .push((name.to_string(), kind.to_string(), value.into()));
    }

    // -----------------------------------------------------------------------
    // Columns
    // -----------------------------------------------------------------------

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn str_column(&self, name: &str) -> Result<Vec<&str>> {
        let idx = self.require(name)?;
        Ok(self.rows.iter().map(|r| r[idx].as_str()).collect())
    }

    pub fn f64_column(&self, name: &str) -> Result<Vec<f64>> {
        let idx = self.require(name)?;
        self.f64_at(idx)
    }

    /// Numeric values of the `idx`-th field of every row, for files whose
    /// column names vary between tool versions.
    pub fn f64_at(&self, idx: usize) -> Result<Vec<f64>> {
        self.rows
            .iter()
            .enumerate()
            .map(|(i, r)| {
                let raw = r
                    .get(idx)
                    .ok_or_else(|| self.malformed(format!("row {i} has no field {idx}")))?;
                raw.parse::<f64>()
                    .map_err(|_| self.malformed(format!("row {i} field {idx} is not a number: {raw}")))
            })
            .collect()
    }

    pub fn push_row(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }

    fn require(&self, name: &str) -> Result<usize> {
        self.column_index(name)
            .ok_or_else(|| self.malformed(format!("missing column '{name}'")))
    }

    fn malformed(&self, reason: String) -> SomaError {
        SomaError::MalformedTable {
            path: self.source.clone(),
            reason,
        }
    }

    // -----------------------------------------------------------------------
    // Writing
    // -----------------------------------------------------------------------

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (name, kind, value) in &self.headers {
            if kind == "%s" {
                let _ = writeln!(out, "@ {name} {kind} \"{value}\"");
            } else {
                let _ = writeln!(out, "@ {name} {kind} {value}");
            }
        }
        let _ = writeln!(out, "* {}", self.columns.join(" "));
        let _ = writeln!(out, "$ {}", self.types.join(" "));
        for row in &self.rows {
            let cells: Vec<String> = row
                .iter()
                .zip(self.types.iter().map(String::as_str).chain(std::iter::repeat("")))
                .map(|(cell, kind)| {
                    if kind == "%s" {
                        format!("\"{cell}\"")
                    } else {
                        cell.clone()
                    }
                })
                .collect();
            let _ = writeln!(out, " {}", cells.join(" "));
        }
        out
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        crate::io::atomic_write(path, self.render().as_bytes())
    }
}

fn unquote(s: &str) -> &str {
    s.trim_matches('"')
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const PHASE: &str = r#"@ TYPE %s "PHASEX"
@ Q1 %le 0.5312
@ Q2 %le 0.5719
* NAME NAME2 S S2 PHASEX ERRPHASEX PHMDLX DELTAPHX
$ %s %s %le %le %le %le %le %le
 "BPM1" "BPM2" 1.0 2.0 0.81 0.001 0.79 1.02
 "BPM2" "BPM3" 2.0 3.0 0.40 0.001 0.43 -0.03
"#;

    #[test]
    fn parses_headers_columns_and_rows() {
        let t = TfsTable::parse(PHASE, Path::new("phase_x.tfs")).unwrap();
        assert_eq!(t.header("TYPE"), Some("PHASEX"));
        assert!((t.header_f64("Q1").unwrap() - 0.5312).abs() < 1e-12);
        assert_eq!(t.str_column("NAME").unwrap(), vec!["BPM1", "BPM2"]);
        assert_eq!(t.f64_column("DELTAPHX").unwrap(), vec![1.02, -0.03]);
        assert_eq!(t.f64_at(2).unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn missing_column_names_the_file() {
        let t = TfsTable::parse(PHASE, Path::new("phase_x.tfs")).unwrap();
        let err = t.f64_column("BETX").unwrap_err().to_string();
        assert!(err.contains("phase_x.tfs"), "{err}");
        assert!(err.contains("BETX"), "{err}");
    }

    #[test]
    fn short_row_is_malformed() {
        let text = "* NAME BETX\n$ %s %le\n \"BPM1\"\n";
        assert!(matches!(
            TfsTable::parse(text, Path::new("t.tfs")),
            Err(SomaError::MalformedTable { .. })
        ));
    }

    #[test]
    fn rendered_table_parses_back() {
        let mut t = TfsTable::new(&[("NAME", "%s"), ("|F1001|", "%le")]);
        t.push_header("RUN", "%s", "HER_2020.sdds");
        t.push_row(vec!["BPM1".into(), "3".into()]);
        t.push_row(vec!["BPM2".into(), "NaN".into()]);
        let back = TfsTable::parse(&t.render(), Path::new("f1001.tfs")).unwrap();
        assert_eq!(back.header("RUN"), Some("HER_2020.sdds"));
        assert_eq!(back.str_column("NAME").unwrap(), vec!["BPM1", "BPM2"]);
        let v = back.f64_column("|F1001|").unwrap();
        assert_eq!(v[0], 3.0);
        assert!(v[1].is_nan());
    }
}
