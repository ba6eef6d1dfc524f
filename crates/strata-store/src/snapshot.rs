//! JSON file snapshots for store state.
//!
//! One file per domain under `{state_path}/state/{domain}.json`, written on
//! every commit. A missing or corrupt file yields a fresh default rather
//! than an error, so a damaged snapshot never blocks startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub struct JsonSnapshot {
    path: PathBuf,
}

impl JsonSnapshot {
    pub fn new(state_path: &Path, domain: &str) -> Self {
        let path = state_path.join("state").join(format!("{domain}.json"));
        Self { path }
    }

    /// Load the snapshot, or the default when the file is absent or corrupt.
    pub fn load<T>(&self) -> T
    where
        T: for<'de> Deserialize<'de> + Default,
    {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(path = %self.path.display(), error = %e, "corrupt snapshot, starting fresh");
                T::default()
            }),
            Err(_) => {
                debug!(path = %self.path.display(), "no snapshot, starting fresh");
                T::default()
            }
        }
    }

    /// Write the snapshot, creating directories as needed.
    pub fn save<T: Serialize>(&self, data: &T) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(data).map_err(std::io::Error::other)?;
        std::fs::write(&self.path, content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn snapshot_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let snap = JsonSnapshot::new(dir.path(), "test");

        let mut data = HashMap::new();
        data.insert("k".to_string(), 42u32);
        snap.save(&data).expect("save");

        let loaded: HashMap<String, u32> = snap.load();
        assert_eq!(loaded.get("k"), Some(&42));
    }

    #[test]
    fn missing_snapshot_loads_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let snap = JsonSnapshot::new(dir.path(), "absent");
        let loaded: Vec<String> = snap.load();
        assert!(loaded.is_empty());
    }

    #[test]
    fn corrupt_snapshot_loads_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state_dir = dir.path().join("state");
        std::fs::create_dir_all(&state_dir).expect("mkdir");
        std::fs::write(state_dir.join("bad.json"), "{not json").expect("write");

        let snap = JsonSnapshot::new(dir.path(), "bad");
        let loaded: HashMap<String, String> = snap.load();
        assert!(loaded.is_empty());
    }
}
