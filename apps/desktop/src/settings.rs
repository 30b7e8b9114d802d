use std::path::Path;

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "presenter.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PresenterSettings {
    pub server_url: String,
    /// Category id or name to open at startup.
    #[serde(default)]
    pub category: Option<String>,
    pub live: bool,
    pub voice: bool,
    pub locale: String,
}

impl Default for PresenterSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".to_string(),
            category: None,
            live: true,
            voice: true,
            locale: "es-MX".to_string(),
        }
    }
}

/// Defaults, then `path` (or `presenter.toml` when present), then
/// `PRESENTER__*` environment variables.
pub fn load(path: Option<&Path>) -> Result<PresenterSettings> {
    let mut builder = with_defaults(Config::builder())?;
    match path {
        Some(path) => builder = builder.add_source(File::from(path)),
        None => {
            builder = builder.add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Toml).required(false))
        }
    }
    builder = builder.add_source(
        Environment::with_prefix("PRESENTER")
            .separator("__")
            .try_parsing(true),
    );
    builder
        .build()
        .context("failed to read presenter settings")?
        .try_deserialize()
        .context("invalid presenter settings")
}

fn with_defaults(
    builder: config::ConfigBuilder<config::builder::DefaultState>,
) -> Result<config::ConfigBuilder<config::builder::DefaultState>> {
    let defaults = PresenterSettings::default();
    Ok(builder
        .set_default("server_url", defaults.server_url)?
        .set_default("live", defaults.live)?
        .set_default("voice", defaults.voice)?
        .set_default("locale", defaults.locale)?)
}

#[cfg(test)]
fn from_toml(contents: &str) -> Result<PresenterSettings> {
    with_defaults(Config::builder())?
        .add_source(File::from_str(contents, FileFormat::Toml))
        .build()?
        .try_deserialize()
        .context("invalid presenter settings")
}
