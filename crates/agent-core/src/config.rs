use std::env;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Deserialize;

/// Process-level configuration, read-only to the core.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Character identities; one control-core process per entry.
    pub profiles: Vec<String>,
    #[serde(default)]
    pub load_memory: bool,
    #[serde(default)]
    pub init_message: Option<String>,
    /// Maximum turns kept in history.
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    /// Per-turn command budget; `-1` means unbounded.
    #[serde(default = "default_unbounded")]
    pub max_commands: i64,
    /// Chat the full command syntax instead of a terse `*used x*` note.
    #[serde(default = "default_true")]
    pub verbose_commands: bool,
    /// Chat one-liners for automatic mode behaviors.
    #[serde(default = "default_true")]
    pub narrate_behavior: bool,
    /// Allow the generate-new-action command to synthesize step scripts.
    #[serde(default)]
    pub allow_custom_actions: bool,
    /// Wall-clock budget for generated actions, in minutes; `-1` = no limit.
    #[serde(default = "default_action_timeout_mins")]
    pub action_timeout_mins: i64,
    #[serde(default)]
    pub language: Option<String>,
}

fn default_max_messages() -> usize {
    300
}

fn default_unbounded() -> i64 {
    -1
}

fn default_true() -> bool {
    true
}

fn default_action_timeout_mins() -> i64 {
    10
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            profiles: vec!["roambot".to_string()],
            load_memory: false,
            init_message: None,
            max_messages: default_max_messages(),
            max_commands: default_unbounded(),
            verbose_commands: true,
            narrate_behavior: true,
            allow_custom_actions: false,
            action_timeout_mins: default_action_timeout_mins(),
            language: None,
        }
    }
}

/// Minimal TOML config loader.
///
/// Search order:
/// 1) `ROAMBOT_CONFIG_DIR/<relative_path>`
/// 2) `./<relative_path>`
/// 3) `<repo_root>/config/<relative_path>` (repo-local convenience)
pub struct ConfigLoader;

impl ConfigLoader {
    pub fn parse_from_file<T: DeserializeOwned>(relative_path: &str) -> anyhow::Result<T> {
        let path = Self::resolve_path(relative_path)?;
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        Self::parse_from_string(text)
    }

    pub fn parse_from_string<T: DeserializeOwned>(text: String) -> anyhow::Result<T> {
        toml::from_str(&text).with_context(|| "Failed to parse TOML")
    }

    fn resolve_path(relative_path: &str) -> anyhow::Result<PathBuf> {
        let rel = Path::new(relative_path);

        if let Some(root) = env::var_os("ROAMBOT_CONFIG_DIR") {
            let candidate = PathBuf::from(root).join(rel);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }

        if let Ok(cwd) = env::current_dir() {
            let candidate = cwd.join(rel);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }

        // Repo convenience: <repo_root>/config/<relative_path>.
        // This crate typically lives at <repo_root>/crates/agent-core.
        let candidate = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .ancestors()
            .nth(2)
            .ok_or_else(|| anyhow::anyhow!("CARGO_MANIFEST_DIR has insufficient ancestors"))?
            .join("config")
            .join(rel);
        if candidate.is_file() {
            return Ok(candidate);
        }

        anyhow::bail!("Config file not found for {:?}", rel);
    }
}
