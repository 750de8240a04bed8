use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Keys accepted by `overseerctl config set`.
pub const KEYS: [&str; 2] = ["url", "timeout_secs"];
const MAX_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default = "default_url")]
    pub url: String,
    /// Per-request limit against the control API.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_url() -> String {
    "http://127.0.0.1:8091".to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl CliConfig {
    /// Config file path: ~/.config/overseer/cli.toml
    pub fn path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Cannot determine config directory")?
            .join("overseer");
        Ok(config_dir.join("cli.toml"))
    }

    /// Load config from file, falling back to defaults.
    /// `OVERSEER_URL` and `OVERSEER_CLI_TIMEOUT_SECS` override the file.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_file_only()?;
        config.apply_env(
            std::env::var("OVERSEER_URL").ok(),
            std::env::var("OVERSEER_CLI_TIMEOUT_SECS").ok(),
        )?;
        Ok(config)
    }

    fn apply_env(&mut self, url: Option<String>, timeout: Option<String>) -> Result<()> {
        if let Some(url) = url {
            self.url = parse_url(&url)?;
        }
        if let Some(timeout) = timeout {
            self.timeout_secs = parse_timeout(&timeout)
                .context("Invalid OVERSEER_CLI_TIMEOUT_SECS")?;
        }
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    fn load_file_only() -> Result<Self> {
        let path = Self::path()?;
        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    /// Set a single config key and save. Env overrides are not written back.
    pub fn set(key: &str, value: &str) -> Result<()> {
        let mut config = Self::load_file_only()?;
        config.assign(key, value)?;
        config.save()
    }

    fn assign(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "url" => self.url = parse_url(value)?,
            "timeout_secs" => self.timeout_secs = parse_timeout(value)?,
            _ => anyhow::bail!("Unknown config key: {key}. Valid keys: {}", KEYS.join(", ")),
        }
        Ok(())
    }
}

fn parse_url(value: &str) -> Result<String> {
    if !value.starts_with("http://") && !value.starts_with("https://") {
        anyhow::bail!("url must start with http:// or https://");
    }
    Ok(value.trim_end_matches('/').to_string())
}

fn parse_timeout(value: &str) -> Result<u64> {
    let secs: u64 = value
        .trim()
        .parse()
        .with_context(|| format!("timeout_secs must be a whole number of seconds, got {value:?}"))?;
    if secs == 0 || secs > MAX_TIMEOUT_SECS {
        anyhow::bail!("timeout_secs must be in 1..={MAX_TIMEOUT_SECS}");
    }
    Ok(secs)
}
