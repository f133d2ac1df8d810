// Configuration management for the tokenmesh CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/tokenmesh/config.json
// - Linux: ~/.config/tokenmesh/config.json
// - Windows: %APPDATA%\tokenmesh\config.json

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokenmesh_core::TokenMeshConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name shown to recipients in permission requests
    pub node_name: String,

    /// Mesh, chunking and transfer settings
    pub mesh: TokenMeshConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: "tokenmesh".to_string(),
            mesh: TokenMeshConfig::default(),
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("tokenmesh");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, or defaults if none is saved
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
        let config: Config =
            serde_json::from_str(&contents).context("Failed to parse config file")?;
        config
            .mesh
            .validate()
            .context("Config file holds invalid settings")?;
        Ok(config)
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value (does not save)
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "node_name" => {
                if value.is_empty() {
                    anyhow::bail!("node_name cannot be empty");
                }
                self.node_name = value.to_string();
            }
            "send_retries" => {
                self.mesh.mesh.send_retries = value.parse().context("Invalid number")?;
            }
            "max_chunk_size" => {
                self.mesh.chunking.max_chunk_size = value.parse().context("Invalid number")?;
            }
            "approval_timeout_ms" => {
                self.mesh.transfer.approval_timeout_ms =
                    value.parse().context("Invalid number")?;
            }
            "transfer_timeout_ms" => {
                self.mesh.transfer.transfer_timeout_ms =
                    value.parse().context("Invalid number")?;
            }
            "legacy_fallback" => {
                self.mesh.transfer.legacy_fallback =
                    value.parse().context("Invalid boolean value")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        self.mesh.validate().context("Rejected config value")?;
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "node_name" => Some(self.node_name.clone()),
            "send_retries" => Some(self.mesh.mesh.send_retries.to_string()),
            "max_chunk_size" => Some(self.mesh.chunking.max_chunk_size.to_string()),
            "approval_timeout_ms" => Some(self.mesh.transfer.approval_timeout_ms.to_string()),
            "transfer_timeout_ms" => Some(self.mesh.transfer.transfer_timeout_ms.to_string()),
            "legacy_fallback" => Some(self.mesh.transfer.legacy_fallback.to_string()),
            _ => None,
        }
    }

    /// List all settable values
    pub fn list(&self) -> Vec<(String, String)> {
        [
            "node_name",
            "send_retries",
            "max_chunk_size",
            "approval_timeout_ms",
            "transfer_timeout_ms",
            "legacy_fallback",
        ]
        .iter()
        .filter_map(|key| self.get(key).map(|value| (key.to_string(), value)))
        .collect()
    }
}
