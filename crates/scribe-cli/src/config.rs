//! Configuration management for the scribe CLI

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use scribe_core::config as paths;
use scribe_core::model::CommandSpec;

/// CLI configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory override; `REBELSCRIBE_DATA_DIR` or `~/.rebelscribe` otherwise
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// Model search directories
    pub model_dirs: Vec<PathBuf>,

    /// Defaults for new templates
    pub generation: GenerationConfig,

    /// Defaults for new batches
    pub batch: BatchConfig,

    /// External inference executable
    pub backend: CommandSpec,
}

/// Generation defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Maximum number of tokens to generate
    pub max_tokens: usize,

    /// Runs per prompt
    pub num_runs: u32,

    /// Temperature for sampling
    pub temperature: f32,

    /// Top-p sampling threshold
    pub top_p: f32,
}

/// Batch execution defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Run units on a worker pool
    pub parallel: bool,

    /// Worker pool size when parallel
    pub max_workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            model_dirs: vec![PathBuf::from("./models")],
            generation: GenerationConfig::default(),
            batch: BatchConfig::default(),
            backend: CommandSpec::default(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: 100,
            num_runs: 3,
            temperature: 0.7,
            top_p: 0.9,
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            parallel: false,
            max_workers: num_cpus::get().clamp(1, 4),
        }
    }
}

fn expand(path: &Path) -> PathBuf {
    match shellexpand::full(&path.to_string_lossy()) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => path.to_path_buf(),
    }
}

impl Config {
    /// Load configuration from file or create default
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let config_path = match config_path {
            Some(path) => path.to_path_buf(),
            None => Self::default_config_path(),
        };

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

            Ok(config)
        } else {
            let config = Config::default();
            config.save(&config_path)?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Get default configuration file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| dirs::home_dir().unwrap_or_default().join(".config"))
            .join("rebelscribe")
            .join("config.toml")
    }

    /// Effective data directory
    pub fn data_dir(&self) -> PathBuf {
        match &self.data_dir {
            Some(dir) => expand(dir),
            None => paths::data_dir(),
        }
    }

    /// Registry file inside the effective data directory
    pub fn registry_path(&self) -> PathBuf {
        paths::registry_path_in(&self.data_dir())
    }

    /// Configured model directories followed by `<data_dir>/models`
    pub fn model_search_dirs(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = self.model_dirs.iter().map(|d| expand(d)).collect();
        let managed = self.data_dir().join("models");
        if !dirs.contains(&managed) {
            dirs.push(managed);
        }
        dirs
    }
}
