use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
struct ConfigFile {
    server: ServerConfig,
    auth: AuthConfig,
    providers: ProvidersConfig,
    storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
struct ServerConfig {
    listen_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
struct AuthConfig {
    /// Absent or empty password disables authentication entirely.
    password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ProvidersConfig {
    openai_api_key: Option<String>,
    anthropic_api_key: Option<String>,
    gemini_api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct StorageConfig {
    data_dir: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub auth_password: Option<String>,
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub data_dir: PathBuf,
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config_file: ConfigFile =
            toml::from_str(&content).context("Failed to parse config file")?;

        let auth_password = config_file
            .auth
            .password
            .filter(|p| !p.trim().is_empty());

        Ok(Self {
            listen_addr: config_file.server.listen_addr,
            auth_password,
            openai_api_key: config_file.providers.openai_api_key,
            anthropic_api_key: config_file.providers.anthropic_api_key,
            gemini_api_key: config_file.providers.gemini_api_key,
            data_dir: config_file.storage.data_dir.into(),
        })
    }

    pub fn load() -> Result<Self> {
        Self::from_file("config.toml")
    }
}
