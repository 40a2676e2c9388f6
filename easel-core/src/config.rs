//! Configuration types for the easel runtime

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::history::DEFAULT_CAPACITY;
use crate::DeviceMap;

/// Main engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory scanned for model checkpoints
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,

    /// Directory generated images are written to
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// JSON record set describing saved images
    #[serde(default)]
    pub metadata_file: Option<PathBuf>,

    /// JSON list of recent prompts
    #[serde(default)]
    pub history_file: Option<PathBuf>,

    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// How long shutdown waits for a running worker before tearing down
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    #[serde(default = "default_device")]
    pub device: DeviceMap,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            models_dir: default_models_dir(),
            output_dir: default_output_dir(),
            metadata_file: None,
            history_file: None,
            history_capacity: default_history_capacity(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            device: default_device(),
        }
    }
}

fn env_path(var: &str) -> Option<PathBuf> {
    std::env::var(var)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

fn default_models_dir() -> PathBuf {
    env_path("EASEL_MODELS_DIR").unwrap_or_else(|| PathBuf::from("models"))
}

fn default_output_dir() -> PathBuf {
    env_path("EASEL_OUTPUT_DIR").unwrap_or_else(|| PathBuf::from("output"))
}

fn default_history_capacity() -> usize {
    DEFAULT_CAPACITY
}

fn default_shutdown_grace_ms() -> u64 {
    2000
}

fn default_device() -> DeviceMap {
    match std::env::var("EASEL_FORCE_CPU") {
        Ok(value) if matches!(value.trim(), "1" | "true" | "yes") => DeviceMap::ForceCpu,
        _ => DeviceMap::default(),
    }
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("failed to parse config {}", path.display()))
    }

    pub fn metadata_file(&self) -> PathBuf {
        self.metadata_file
            .clone()
            .unwrap_or_else(|| self.output_dir.join("image_data.json"))
    }

    pub fn history_file(&self) -> PathBuf {
        self.history_file
            .clone()
            .unwrap_or_else(|| self.output_dir.join("prompt_history.json"))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.output_dir)?;
        std::fs::create_dir_all(&self.models_dir)
    }
}
