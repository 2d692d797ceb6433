//! Persistent CLI configuration (TOML in the platform config dir)

use anyhow::{bail, Context, Result};
use chat_engine::EngineConfig;
use serde::{Deserialize, Serialize};
use shared::ApiClientConfig;
use std::fs;
use std::path::{Path, PathBuf};
use url::Url;

pub const DEFAULT_BACKEND_URL: &str = "http://localhost:8000";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct CliConfig {
    pub backend_url: Option<String>,
    pub auth_token: Option<String>,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl CliConfig {
    pub fn config_path() -> Result<PathBuf> {
        let dir = dirs::config_dir().context("Failed to determine config directory")?;
        Ok(dir.join("business-chat").join("config.toml"))
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path).context("Failed to read config file")?;
        let config = toml::from_str(&contents).context("Failed to parse config file")?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Write through a temp file and rename
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let temp_path = path.with_extension("tmp");
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&temp_path, contents).context("Failed to write temp config file")?;
        fs::rename(&temp_path, path).context("Failed to rename config file")?;
        tracing::info!("Saved config to {}", path.display());
        Ok(())
    }

    /// Connection settings, with command-line values taking precedence
    pub fn api_config(&self, url: Option<&str>, token: Option<&str>) -> Result<ApiClientConfig> {
        let backend_url = url
            .or(self.backend_url.as_deref())
            .unwrap_or(DEFAULT_BACKEND_URL);
        let backend_url = validate_backend_url(backend_url)?;

        let config = ApiClientConfig::new(backend_url);
        Ok(match token.or(self.auth_token.as_deref()) {
            Some(token) => config.with_token(token),
            None => config,
        })
    }
}

/// Accept only http(s) base URLs; the channel URL is derived from them
pub fn validate_backend_url(raw: &str) -> Result<String> {
    let parsed = Url::parse(raw).with_context(|| format!("Invalid backend URL: {}", raw))?;
    match parsed.scheme() {
        "http" | "https" => Ok(raw.trim_end_matches('/').to_string()),
        other => bail!("Backend URL must be http or https, got {}", other),
    }
}
