//! Named storage for large stage outputs.
//!
//! Artifacts live in an rw-locked in-memory map. Entries larger than the
//! spill threshold are written to `<base_dir>/artifacts/<id>.json` and the
//! map retains the path instead of the payload.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use orrery_types::{OrreryError, Result};

/// Payloads above this size are file-backed.
pub const SPILL_THRESHOLD: usize = 100 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactInfo {
    pub id: String,
    pub name: String,
    pub size_bytes: usize,
    pub stored_at: chrono::DateTime<chrono::Utc>,
    pub file_backed: bool,
}

enum Stored {
    Inline(serde_json::Value),
    File(PathBuf),
}

struct Entry {
    info: ArtifactInfo,
    stored: Stored,
}

pub struct ArtifactStore {
    entries: RwLock<HashMap<String, Entry>>,
    base_dir: Option<PathBuf>,
}

impl ArtifactStore {
    /// In-memory only; nothing spills to disk.
    pub fn in_memory() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            base_dir: None,
        }
    }

    /// Spills oversized artifacts under `base_dir/artifacts/`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            base_dir: Some(base_dir.into()),
        }
    }

    pub fn store(
        &self,
        id: impl Into<String>,
        name: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<ArtifactInfo> {
        let id = id.into();
        let serialized = serde_json::to_vec(&value)?;
        let size_bytes = serialized.len();
        let spill = size_bytes > SPILL_THRESHOLD && self.base_dir.is_some();

        let stored = if spill {
            let dir = self
                .base_dir
                .as_ref()
                .map(|d| d.join("artifacts"))
                .unwrap_or_default();
            std::fs::create_dir_all(&dir)?;
            let path = dir.join(format!("{id}.json"));
            std::fs::write(&path, &serialized)?;
            Stored::File(path)
        } else {
            Stored::Inline(value)
        };

        let info = ArtifactInfo {
            id: id.clone(),
            name: name.into(),
            size_bytes,
            stored_at: chrono::Utc::now(),
            file_backed: spill,
        };
        self.entries
            .write()
            .expect("artifact lock poisoned")
            .insert(id, Entry { info: info.clone(), stored });
        Ok(info)
    }

    pub fn retrieve(&self, id: &str) -> Result<serde_json::Value> {
        let entries = self.entries.read().expect("artifact lock poisoned");
        let entry = entries.get(id).ok_or_else(|| {
            OrreryError::Other(format!("artifact not found: {id}"))
        })?;
        match &entry.stored {
            Stored::Inline(value) => Ok(value.clone()),
            Stored::File(path) => {
                let data = std::fs::read_to_string(path)?;
                Ok(serde_json::from_str(&data)?)
            }
        }
    }

    pub fn has(&self, id: &str) -> bool {
        self.entries
            .read()
            .expect("artifact lock poisoned")
            .contains_key(id)
    }

    pub fn list(&self) -> Vec<ArtifactInfo> {
        let mut infos: Vec<ArtifactInfo> = self
            .entries
            .read()
            .expect("artifact lock poisoned")
            .values()
            .map(|e| e.info.clone())
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }
}
