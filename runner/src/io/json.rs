//! JSON file helpers shared by the run-directory stores.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Read and deserialize a JSON file.
pub fn read_json<T: DeserializeOwned>(path: &Path, label: &str) -> Result<T> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {label} {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {label} {}", path.display()))
}

/// Serialize `value` as pretty JSON with a trailing newline and write it atomically.
pub fn write_json<T: Serialize>(path: &Path, value: &T, label: &str) -> Result<()> {
    let mut buf =
        serde_json::to_string_pretty(value).with_context(|| format!("serialize {label}"))?;
    buf.push('\n');
    write_atomic(path, &buf, label)
}

/// Write `contents` to a sibling temp file, then rename over `path`.
///
/// Readers see either the old or the new contents, never a partial write.
pub fn write_atomic(path: &Path, contents: &str, label: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{label} path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = tmp_sibling(path);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp {label} {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {label} {}", path.display()))?;
    Ok(())
}

fn tmp_sibling(path: &Path) -> std::path::PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    /// Verifies pretty output with trailing newline and no leftover temp file.
    #[test]
    fn write_json_is_pretty_and_leaves_no_temp() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("state.json");

        write_json(&path, &json!({"a": 1}), "state").expect("write");

        let contents = fs::read_to_string(&path).expect("read");
        assert_eq!(contents, "{\n  \"a\": 1\n}\n");
        assert!(!temp.path().join("nested").join("state.json.tmp").exists());

        let value: Value = read_json(&path, "state").expect("read json");
        assert_eq!(value, json!({"a": 1}));
    }

    #[test]
    fn read_json_reports_path_on_parse_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("bad.json");
        fs::write(&path, "{").expect("write");

        let err = read_json::<Value>(&path, "run record").unwrap_err();
        assert!(format!("{err}").starts_with("parse run record "));
    }
}
