// Service configuration: defaults, optional TOML file, environment
// overrides.
//
// Two families of environment variables are recognized. `WHISPER_*`
// keys (SERVER_URL, MODEL, LANGUAGE, VAD_MODEL, AUTO_START) configure
// the backend the way the whisper.cpp ecosystem expects. `SPEECH2TEXT_`
// prefixed keys override any nested setting through the config crate,
// with `__` between path segments (e.g. SPEECH2TEXT_HTTP__PORT).

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::capture::CaptureSettings;
use crate::server::ServerSettings;

/// Top-level configuration for the service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Transcription backend settings.
    pub server: ServerSettings,
    /// Audio capture settings.
    pub capture: CaptureSettings,
    /// HTTP control surface settings.
    pub http: HttpSettings,
}

/// Where the HTTP control surface listens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub bind: String,
    pub port: u16,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8099,
        }
    }
}

impl HttpSettings {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

impl ServiceConfig {
    /// Loads configuration: defaults, then the TOML file if given, then
    /// `SPEECH2TEXT_*` and finally `WHISPER_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix("SPEECH2TEXT").separator("__"))
            .build()
            .context("Failed to load configuration")?;

        let mut cfg: ServiceConfig = settings
            .try_deserialize()
            .context("Invalid configuration")?;
        cfg.server
            .overlay(|key| std::env::var(key).ok().filter(|value| !value.is_empty()));
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        Self::load(Some(path))
    }
}
