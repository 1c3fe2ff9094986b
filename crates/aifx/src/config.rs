//! Application configuration, persisted as JSON.

use std::path::{Path, PathBuf};

use anyhow::Context;
use forensics_core::Stage;
use serde::{Deserialize, Serialize};

/// Global configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Stages run when `--stage` is not given.
    #[serde(default = "default_stages")]
    pub default_stages: Vec<Stage>,
    /// Extra template indicator substrings, matched case-insensitively.
    #[serde(default)]
    pub extra_indicators: Vec<String>,
    /// Exit with status 1 when any report is not OK.
    #[serde(default = "default_fail_exit_code")]
    pub fail_exit_code: bool,
}

fn default_stages() -> Vec<Stage> {
    Stage::ALL.to_vec()
}
fn default_fail_exit_code() -> bool {
    true
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            default_stages: default_stages(),
            extra_indicators: Vec::new(),
            fail_exit_code: default_fail_exit_code(),
        }
    }
}

/// Split a comma-separated list, dropping empty items.
fn list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

impl AppConfig {
    /// Platform config directory: `~/.config/aifx/`
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("aifx")
    }

    fn config_file() -> PathBuf {
        Self::config_dir().join("config.json")
    }

    /// Load from disk, or return defaults if the file doesn't exist.
    pub fn load_or_default() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_file())
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&data)
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Persist to disk.
    pub fn save(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(Self::config_dir())?;
        self.save_to(&Self::config_file())
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)
            .with_context(|| format!("failed to write config {}", path.display()))
    }

    /// Update one field from its textual form.
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "default_stages" => {
                let stages = list(value)
                    .map(str::parse::<Stage>)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| anyhow::anyhow!(e))?;
                if stages.is_empty() {
                    anyhow::bail!("default_stages needs at least one stage");
                }
                self.default_stages = stages;
            }
            "extra_indicators" => {
                self.extra_indicators = list(value).map(String::from).collect();
            }
            "fail_exit_code" => {
                self.fail_exit_code = value
                    .parse()
                    .with_context(|| format!("fail_exit_code expects true or false, got '{value}'"))?;
            }
            _ => anyhow::bail!("Unknown config key: {key}"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AppConfig::load_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(cfg, AppConfig::default());
        assert_eq!(cfg.default_stages, vec![Stage::Sha256, Stage::Structure]);
        assert!(cfg.fail_exit_code);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut cfg = AppConfig::default();
        cfg.set("default_stages", "structure").unwrap();
        cfg.set("extra_indicators", "jailbreak, ,sudo rm").unwrap();
        cfg.set("fail_exit_code", "false").unwrap();
        cfg.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.default_stages, vec![Stage::Structure]);
        assert_eq!(loaded.extra_indicators, vec!["jailbreak", "sudo rm"]);
        assert!(!loaded.fail_exit_code);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"extra_indicators":["x"]}"#).unwrap();
        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.extra_indicators, vec!["x"]);
        assert_eq!(cfg.default_stages, Stage::ALL.to_vec());
        assert!(cfg.fail_exit_code);
    }

    #[test]
    fn rejects_bad_values() {
        let mut cfg = AppConfig::default();
        assert!(cfg.set("default_stages", "sha256,hash").is_err());
        assert!(cfg.set("default_stages", "").is_err());
        assert!(cfg.set("fail_exit_code", "maybe").is_err());
        assert!(cfg.set("port", "8080").is_err());
        assert_eq!(cfg, AppConfig::default());
    }
}
