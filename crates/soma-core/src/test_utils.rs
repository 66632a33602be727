use crate::config::{Parameters, Tuning};
use crate::types::Axis;
use std::path::Path;

/// Parameters rooted in a scratch directory.
pub fn params_in(root: &Path) -> Parameters {
    Parameters {
        nturns: 1000,
        ring_id: "HER".to_string(),
        lattice: root.join("lattice.sad"),
        input_data_path: root.join("raw"),
        kickax: Axis::X,
        model_path: root.join("model"),
        main_output_path: root.join("out"),
        file_dict: root.join("file_dict.txt"),
        gsad: "gs".into(),
        python_exe: None,
        betabeat_path: None,
        python3_exe: Some("python3".into()),
        omc3_path: Some(root.join("omc3")),
        tuning: Tuning::default(),
    }
}

/// Minimal TFS text with the given string and numeric columns.
pub fn write_table(path: &Path, columns: &[&str], rows: &[&[&str]]) {
    let mut text = format!("* {}\n$", columns.join(" "));
    for (i, _) in columns.iter().enumerate() {
        text.push_str(if i == 0 { " %s" } else { " %le" });
    }
    text.push('\n');
    for row in rows {
        text.push(' ');
        text.push_str(&row.join(" "));
        text.push('\n');
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, text).unwrap();
}
