use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;
use url::Url;

pub const DEFAULT_CONFIG_FILE: &str = "admin.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid backend url '{value}': {source}")]
    InvalidUrl {
        value: String,
        source: url::ParseError,
    },
    #[error("backend url '{0}' must use http or https")]
    UnsupportedScheme(String),
    #[error("backend anon key is not configured (set BACKEND_ANON_KEY)")]
    MissingAnonKey,
    #[error("invalid value '{value}' for {key}")]
    InvalidNumber { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub backend_url: String,
    pub anon_key: Option<String>,
    pub session_db_url: Option<String>,
    pub session_key: String,
    pub request_timeout_secs: u64,
    pub connector_function: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend_url: "http://127.0.0.1:54321".into(),
            anon_key: None,
            session_db_url: None,
            session_key: storage::DEFAULT_SESSION_KEY.into(),
            request_timeout_secs: 30,
            connector_function: "send-message".into(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSettings {
    backend_url: Option<String>,
    anon_key: Option<String>,
    session_db_url: Option<String>,
    session_key: Option<String>,
    request_timeout_secs: Option<u64>,
    connector_function: Option<String>,
}

/// Validated connection parameters for [`crate::backend::BackendClient`].
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub base_url: Url,
    pub anon_key: String,
    pub request_timeout: Duration,
    pub connector_function: String,
}

impl Settings {
    pub fn backend_config(&self) -> Result<BackendConfig, ConfigError> {
        let base_url =
            Url::parse(self.backend_url.trim()).map_err(|source| ConfigError::InvalidUrl {
                value: self.backend_url.clone(),
                source,
            })?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(ConfigError::UnsupportedScheme(self.backend_url.clone()));
        }
        let anon_key = self
            .anon_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or(ConfigError::MissingAnonKey)?;

        Ok(BackendConfig {
            base_url,
            anon_key: anon_key.to_string(),
            request_timeout: Duration::from_secs(self.request_timeout_secs.max(1)),
            connector_function: self.connector_function.clone(),
        })
    }
}

/// Loads settings from defaults, then the config file, then the process environment.
///
/// An explicitly given file must exist; the default `admin.toml` is optional.
pub fn load_settings(config_path: Option<&Path>) -> Result<Settings, ConfigError> {
    load_settings_with(config_path, |key| std::env::var(key).ok())
}

pub fn load_settings_with(
    config_path: Option<&Path>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<Settings, ConfigError> {
    let mut settings = Settings::default();

    let file_settings = match config_path {
        Some(path) => Some(read_file_settings(path)?),
        None => {
            let default_path = Path::new(DEFAULT_CONFIG_FILE);
            if default_path.exists() {
                Some(read_file_settings(default_path)?)
            } else {
                None
            }
        }
    };

    if let Some(file_cfg) = file_settings {
        if let Some(v) = file_cfg.backend_url {
            settings.backend_url = v;
        }
        if let Some(v) = file_cfg.anon_key {
            settings.anon_key = Some(v);
        }
        if let Some(v) = file_cfg.session_db_url {
            settings.session_db_url = Some(v);
        }
        if let Some(v) = file_cfg.session_key {
            settings.session_key = v;
        }
        if let Some(v) = file_cfg.request_timeout_secs {
            settings.request_timeout_secs = v;
        }
        if let Some(v) = file_cfg.connector_function {
            settings.connector_function = v;
        }
    }

    if let Some(v) = env("BACKEND_URL") {
        settings.backend_url = v;
    }
    if let Some(v) = env("APP__BACKEND_URL") {
        settings.backend_url = v;
    }

    if let Some(v) = env("BACKEND_ANON_KEY") {
        settings.anon_key = Some(v);
    }
    if let Some(v) = env("APP__BACKEND_ANON_KEY") {
        settings.anon_key = Some(v);
    }

    if let Some(v) = env("APP__SESSION_DB_URL") {
        settings.session_db_url = Some(v);
    }
    if let Some(v) = env("APP__SESSION_KEY") {
        settings.session_key = v;
    }

    if let Some(v) = env("APP__REQUEST_TIMEOUT_SECS") {
        settings.request_timeout_secs = v.trim().parse().map_err(|_| ConfigError::InvalidNumber {
            key: "APP__REQUEST_TIMEOUT_SECS",
            value: v.clone(),
        })?;
    }

    if let Some(v) = env("APP__CONNECTOR_FUNCTION") {
        settings.connector_function = v;
    }

    Ok(settings)
}

fn read_file_settings(path: &Path) -> Result<FileSettings, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
