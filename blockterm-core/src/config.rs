// blockterm-core/src/config.rs

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

/// Executable names that override the built-in classification table.
/// These are consulted before any built-in rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierOverrides {
    pub fullscreen: Vec<String>,
    pub interactive: Vec<String>,
    pub continuous: Vec<String>,
    pub one_shot: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub cols: u16,
    pub rows: u16,
    /// WHATWG encoding label of the connection's output stream.
    pub encoding: String,
    /// Shell program for local sessions. `None` picks the platform default.
    pub shell: Option<String>,
    /// Export OSC 133 prompt markers from the local shell.
    pub shell_integration: bool,
    /// Regex matched against the trailing line of output; a match counts
    /// as a shell prompt (for shells that emit no OSC 133 markers).
    pub prompt_pattern: Option<String>,
    /// Capacity of the session event channel.
    pub event_capacity: usize,
    pub classifier: ClassifierOverrides,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cols: 120,
            rows: 30,
            encoding: "utf-8".to_string(),
            shell: None,
            shell_integration: true,
            prompt_pattern: None,
            event_capacity: 1024,
            classifier: ClassifierOverrides::default(),
        }
    }
}

impl SessionConfig {
    /// Read a JSON config file. Missing fields take their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    /// Load from the default location, falling back to defaults when the
    /// file does not exist.
    pub fn load_or_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(path),
            _ => Ok(Self::default()),
        }
    }

    /// `<config dir>/blockterm/config.json`
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "blockterm").map(|dirs| dirs.config_dir().join("config.json"))
    }

    pub fn shell_program(&self) -> String {
        if let Some(shell) = &self.shell {
            return shell.clone();
        }
        if cfg!(windows) {
            "powershell.exe".to_string()
        } else {
            std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string())
        }
    }
}
