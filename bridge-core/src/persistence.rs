// bridge-core/src/persistence.rs
//
// JSON state files in the host's user-data directory. Each file has exactly
// one writer (debounced) and one loader (at start); writes are best-effort
// and never affect the correctness of in-memory state.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

/// Load a JSON state file. A missing file is not an error.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read state file {}", path.display()))?;
    let value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse state file {}", path.display()))?;
    Ok(Some(value))
}

/// Write a JSON state file atomically: serialize to a sibling temp file, then
/// rename into place so a crash mid-write never truncates existing state.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create state directory {}", parent.display()))?;
    }
    let content = serde_json::to_string_pretty(value).context("Failed to serialize state")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, content)
        .with_context(|| format!("Failed to write state file {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to replace state file {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::collections::HashMap;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct State {
        entries: HashMap<String, i64>,
    }

    #[test]
    fn test_load_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded: Option<State> = load_json(&dir.path().join("absent.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_write_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut entries = HashMap::new();
        entries.insert("12345".to_string(), 42);
        let state = State { entries };

        write_json(&path, &state).unwrap();
        let loaded: State = load_json(&path).unwrap().unwrap();
        assert_eq!(loaded, state);
        // temp file must not linger
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_write_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/state.json");
        write_json(&path, &vec![1, 2, 3]).unwrap();
        let loaded: Vec<i32> = load_json(&path).unwrap().unwrap();
        assert_eq!(loaded, vec![1, 2, 3]);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();
        let result: Result<Option<State>> = load_json(&path);
        assert!(result.is_err());
    }
}
