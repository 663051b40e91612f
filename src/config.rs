use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::circle::DEFAULT_BASE_URL;
use crate::error::{CiWaitError, Result};

/// Configuration file structure for ciwait.
///
/// Loaded from `~/.config/ciwait/config.toml` (per-platform config dir);
/// every value can be overridden by CLI flags or the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// CI personal API token
    pub token: Option<String>,

    /// API base URL
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Git remote to poll and push to
    #[serde(default = "default_remote")]
    pub remote: String,

    /// Effective CI cost per container-minute, in cents; feeds the cost
    /// line printed while a build is queued
    #[serde(default = "default_cost_per_minute")]
    pub cost_per_minute: f64,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_remote() -> String {
    "origin".to_string()
}

fn default_cost_per_minute() -> f64 {
    // rough list price of one medium Linux container
    0.6
}

impl Default for Config {
    fn default() -> Self {
        Self {
            token: None,
            base_url: default_base_url(),
            remote: default_remote(),
            cost_per_minute: default_cost_per_minute(),
        }
    }
}

impl Config {
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("ciwait").join("config.toml"))
    }

    /// Load from the default location; a missing file yields the defaults.
    pub fn load() -> Result<Self> {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|e| CiWaitError::Config(format!("{}: {e}", path.display())))
    }
}
