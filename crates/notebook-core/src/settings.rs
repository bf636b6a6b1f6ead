//! Settings for the notebook core.
//!
//! Settings are stored in a JSON file in the user's config directory:
//! - macOS: ~/Library/Application Support/runt-notebook/core-settings.json
//! - Linux: ~/.config/runt-notebook/core-settings.json
//! - Windows: C:\Users\<User>\AppData\Roaming\runt-notebook\core-settings.json

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::cell::CellKind;

/// How arriving output events are merged into a cell's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputPolicy {
    /// Each event replaces the whole output with just that event.
    #[default]
    ReplaceLatest,
    /// Events accumulate in arrival order.
    Append,
}

impl std::fmt::Display for OutputPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputPolicy::ReplaceLatest => write!(f, "replace_latest"),
            OutputPolicy::Append => write!(f, "append"),
        }
    }
}

const DEFAULT_EVENT_CAPACITY: usize = 256;
const DEFAULT_QUEUE_CAPACITY: usize = 100;

fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub output_policy: OutputPolicy,

    /// Kind of cells added without an explicit kind
    #[serde(default)]
    pub default_cell_kind: CellKind,

    /// Buffer size of the store's change broadcast
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Buffer size of the execution queue command channel
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            output_policy: OutputPolicy::ReplaceLatest,
            default_cell_kind: CellKind::Code,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Get the path to the settings file
pub fn settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("runt-notebook")
        .join("core-settings.json")
}

/// Load settings from disk, returning defaults if the file is missing or unreadable
pub fn load_settings() -> Settings {
    load_settings_from(&settings_path())
}

pub fn load_settings_from(path: &Path) -> Settings {
    if !path.exists() {
        return Settings::default();
    }
    match std::fs::read_to_string(path)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
    {
        Some(settings) => settings,
        None => {
            log::warn!("[settings] Ignoring unreadable settings at {:?}", path);
            Settings::default()
        }
    }
}

/// Save settings to disk
pub fn save_settings(settings: &Settings) -> Result<()> {
    save_settings_to(settings, &settings_path())
}

pub fn save_settings_to(settings: &Settings, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(settings)?)?;
    Ok(())
}
