use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub mpv: MpvConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Where the persisted player settings (volume, crossfade, EQ, ...) live.
    #[serde(default = "default_settings_file")]
    pub settings_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Endpoints of the external resolver service (stream URLs, loudness,
/// lyrics, recommendations).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    #[serde(default = "default_resolver_base_url")]
    pub base_url: String,
    /// Media-transport proxy.  When set, resolved stream URLs are handed to
    /// the channels as `{proxy_base}?url=<encoded>`.
    #[serde(default)]
    pub proxy_base: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MpvConfig {
    /// Explicit mpv binary; falls back to a bundled copy, then `PATH`.
    #[serde(default)]
    pub binary: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            settings_file: default_settings_file(),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            base_url: default_resolver_base_url(),
            proxy_base: None,
        }
    }
}

fn default_settings_file() -> PathBuf {
    platform::data_dir().join("settings.json")
}

fn default_bind_address() -> String {
    platform::CONTROL_TCP_HOST.to_string()
}

fn default_port() -> u16 {
    platform::CONTROL_TCP_PORT
}

fn default_resolver_base_url() -> String {
    "http://127.0.0.1:3535/api".to_string()
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            control: ControlConfig::default(),
            resolver: ResolverConfig::default(),
            mpv: MpvConfig::default(),
        }
    }
}
