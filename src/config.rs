use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

const CONFIG_FILE: &str = "config.json";

/// Thresholds for the fuzzy alias reconciliation. They were tuned by hand
/// against real CLI output, so they stay adjustable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AliasMatching {
    pub max_edit_distance: usize,
    /// Substring containment only counts when the shorter string is longer than this.
    pub min_substring_len: usize,
}

impl Default for AliasMatching {
    fn default() -> Self {
        Self {
            max_edit_distance: 3,
            min_substring_len: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TelemetryConfig {
    pub interval_ms: u64,
    pub vendor_tolerance_mb: u64,
    pub shared_ceiling_mb: u64,
    pub min_used_floor_mb: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            vendor_tolerance_mb: 512,
            shared_ceiling_mb: 64 * 1024,
            min_used_floor_mb: 256,
        }
    }
}

impl TelemetryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(100))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    pub cli_program: String,
    pub default_model: Option<String>,
    pub default_aliases: Vec<String>,
    pub status_timeout_secs: u64,
    pub health_timeout_secs: u64,
    pub chat_timeout_secs: u64,
    pub settle_delay_ms: u64,
    pub max_tokens: u32,
    pub temperature: f32,
    pub alias_matching: AliasMatching,
    pub telemetry: TelemetryConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            cli_program: "foundry".to_string(),
            default_model: None,
            default_aliases: Vec::new(),
            status_timeout_secs: 5,
            health_timeout_secs: 5,
            chat_timeout_secs: 300,
            settle_delay_ms: 3000,
            max_tokens: 2048,
            temperature: 0.7,
            alias_matching: AliasMatching::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl AppConfig {
    /// Read `config.json` from `data_dir`. A missing or broken file yields defaults.
    pub fn load(data_dir: &Path) -> Self {
        let path = data_dir.join(CONFIG_FILE);
        match Self::read(&path) {
            Ok(Some(cfg)) => cfg,
            Ok(None) => Self::default(),
            Err(e) => {
                log::warn!("[config] ignoring {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    fn read(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&text)?))
    }

    pub fn save(&self, data_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(data_dir)?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(data_dir.join(CONFIG_FILE), content)?;
        Ok(())
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_secs(self.status_timeout_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn chat_timeout(&self) -> Duration {
        Duration::from_secs(self.chat_timeout_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("inferdesk")
}
