use std::path::PathBuf;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::agent::history::Turn;

/// Everything the agent persists across a restart: the conversation log and
/// the active goal prompt, if any.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct MemorySnapshot {
    pub turns: Vec<Turn>,
    #[serde(default)]
    pub self_prompt: Option<String>,
}

/// Persistence collaborator. Saves must be idempotent; `load` returns the
/// last-saved snapshot or `None` if nothing was ever saved.
pub trait MemoryStore: Send + Sync {
    fn save(&self, snapshot: &MemorySnapshot) -> anyhow::Result<()>;
    fn load(&self) -> anyhow::Result<Option<MemorySnapshot>>;
}

/// Flat JSON snapshot on disk, one file per agent.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl MemoryStore for FileStore {
    fn save(&self, snapshot: &MemorySnapshot) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create memory dir {}", parent.display()))?;
        }
        let text = serde_json::to_string_pretty(snapshot).context("encode memory snapshot")?;
        std::fs::write(&self.path, text)
            .with_context(|| format!("write memory snapshot {}", self.path.display()))
    }

    fn load(&self) -> anyhow::Result<Option<MemorySnapshot>> {
        if !self.path.is_file() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&self.path)
            .with_context(|| format!("read memory snapshot {}", self.path.display()))?;
        let snapshot = serde_json::from_str(&text).context("decode memory snapshot")?;
        Ok(Some(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::history::{Speaker, Turn};

    #[test]
    fn load_without_save_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("mem.json"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn save_then_load_round_trips_order_and_goal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("mem.json"));

        let snapshot = MemorySnapshot {
            turns: vec![
                Turn::new(Speaker::Player("steve".into()), "hello"),
                Turn::new(Speaker::Agent, "hi there"),
                Turn::system("something happened"),
            ],
            self_prompt: Some("build a shelter".into()),
        };
        store.save(&snapshot).unwrap();
        // Saves are idempotent.
        store.save(&snapshot).unwrap();

        let loaded = store.load().unwrap().expect("snapshot");
        assert_eq!(loaded, snapshot);
    }
}
