//! Configuration management for ledgerlens
//!
//! Stores settings in ~/.config/ledgerlens/config.json

use crate::extract::client::RetryPolicy;
use crate::extract::limits::RequestLimits;
use crate::extract::models::{
    ProviderSpec, Topology, DEFAULT_AGGREGATOR_BASE_URL, DEFAULT_HOSTED_BASE_URL,
};
use crate::extract::validate::ValidationMode;
use crate::util::mask_secret;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const HOSTED_PROVIDER: &str = "primary-hosted";
pub const AGGREGATOR_PROVIDER: &str = "aggregator";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not determine config directory")]
    NoConfigDir,
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("default_provider `{0}` names no configured provider")]
    UnknownDefaultProvider(String),
    #[error("invalid {field} `{value}`: {reason}")]
    InvalidUrl {
        field: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Hosted provider key; `GEMINI_API_KEY` takes precedence.
    pub gemini_api_key: Option<String>,
    /// Aggregator key; `OPENROUTER_API_KEY` takes precedence.
    pub openrouter_api_key: Option<String>,
    pub hosted_base_url: Option<String>,
    pub aggregator_base_url: Option<String>,
    pub default_provider: String,
    /// Hard wall-clock limit for a single provider call.
    pub timeout_ms: u64,
    pub retry: RetryPolicy,
    pub validation_mode: ValidationMode,
    pub limits: RequestLimits,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gemini_api_key: None,
            openrouter_api_key: None,
            hosted_base_url: None,
            aggregator_base_url: None,
            default_provider: HOSTED_PROVIDER.to_string(),
            timeout_ms: 120_000,
            retry: RetryPolicy::default(),
            validation_mode: ValidationMode::default(),
            limits: RequestLimits::default(),
        }
    }
}

impl Config {
    /// Get the config directory path
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("ledgerlens"))
    }

    /// Get the config file path
    pub fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.json"))
    }

    /// Load config from disk, or return default
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    /// Load from an explicit path. A corrupt file is moved aside and defaults are used.
    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = fs::read_to_string(path) else {
            return Self::default();
        };
        match serde_json::from_str(&content) {
            Ok(config) => config,
            Err(err) => {
                preserve_corrupt_config(path, &content);
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "config file was corrupted; a backup was saved and defaults were loaded"
                );
                Self::default()
            }
        }
    }

    /// Save config to disk
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = Self::config_path().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
                path: dir.to_path_buf(),
                source,
            })?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Err(e) = fs::set_permissions(dir, fs::Permissions::from_mode(0o700)) {
                    tracing::warn!("Failed to set config directory permissions: {}", e);
                }
            }
        }

        let content = serde_json::to_string_pretty(self)?;
        write_config_atomic(path, &content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Provider id to API key, environment first.
    pub fn credentials(&self) -> HashMap<String, String> {
        self.credentials_with(|name| std::env::var(name).ok())
    }

    pub fn credentials_with(&self, env: impl Fn(&str) -> Option<String>) -> HashMap<String, String> {
        let mut out = HashMap::new();
        let pairs = [
            (HOSTED_PROVIDER, "GEMINI_API_KEY", &self.gemini_api_key),
            (AGGREGATOR_PROVIDER, "OPENROUTER_API_KEY", &self.openrouter_api_key),
        ];
        for (provider, var, stored) in pairs {
            let key = env(var)
                .filter(|k| !k.trim().is_empty())
                .or_else(|| stored.clone().filter(|k| !k.trim().is_empty()));
            if let Some(key) = key {
                out.insert(provider.to_string(), key.trim().to_string());
            }
        }
        out
    }

    /// Reject endpoint overrides that are not absolute http(s) URLs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let overrides = [
            ("hosted_base_url", &self.hosted_base_url),
            ("aggregator_base_url", &self.aggregator_base_url),
        ];
        for (field, value) in overrides {
            let Some(value) = value else { continue };
            let invalid = |reason: String| ConfigError::InvalidUrl {
                field,
                value: value.clone(),
                reason,
            };
            let parsed = Url::parse(value).map_err(|e| invalid(e.to_string()))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(invalid(format!("unsupported scheme `{}`", parsed.scheme())));
            }
        }
        if Topology::from_config(self)
            .provider(&self.default_provider)
            .is_none()
        {
            return Err(ConfigError::UnknownDefaultProvider(
                self.default_provider.clone(),
            ));
        }
        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }

    /// Copy safe to print: keys reduced to their last four characters.
    pub fn masked(&self) -> Self {
        Self {
            gemini_api_key: self.gemini_api_key.as_deref().map(mask_secret),
            openrouter_api_key: self.openrouter_api_key.as_deref().map(mask_secret),
            ..self.clone()
        }
    }

    /// Get the config file location for display
    pub fn config_location() -> String {
        Self::config_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "~/.config/ledgerlens/config.json".to_string())
    }
}

impl Topology {
    /// Build the provider table, honouring endpoint overrides.
    pub fn from_config(config: &Config) -> Self {
        let hosted = ProviderSpec::hosted(
            config
                .hosted_base_url
                .as_deref()
                .unwrap_or(DEFAULT_HOSTED_BASE_URL),
        );
        let aggregator = ProviderSpec::aggregator(
            config
                .aggregator_base_url
                .as_deref()
                .unwrap_or(DEFAULT_AGGREGATOR_BASE_URL),
        );
        Topology::new(vec![hosted, aggregator], &config.default_provider)
    }
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

fn write_config_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    use std::fs::OpenOptions;

    let tmp_path = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = file.set_permissions(fs::Permissions::from_mode(0o600)) {
            tracing::warn!("Failed to set temp config file permissions: {}", e);
        }
    }

    file.write_all(content.as_bytes())?;

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert!(config.gemini_api_key.is_none());
        assert_eq!(config.default_provider, HOSTED_PROVIDER);
        assert_eq!(config.validation_mode, ValidationMode::Lenient);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = Config {
            openrouter_api_key: Some("sk-or-test".to_string()),
            timeout_ms: 5_000,
            validation_mode: ValidationMode::Strict,
            ..Config::default()
        };
        config.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path), config);
        assert!(!path.with_extension("tmp").exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn corrupt_config_is_preserved_and_defaults_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(Config::load_from(&path), Config::default());
        assert!(path.with_extension("json.corrupt").exists());
    }

    #[test]
    fn partial_config_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"timeout_ms": 900, "retry": {"max_attempts": 2}}"#).unwrap();
        let config = Config::load_from(&path);
        assert_eq!(config.timeout_ms, 900);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.base_ms, RetryPolicy::default().base_ms);
        assert_eq!(config.limits, RequestLimits::default());
    }

    #[test]
    fn environment_keys_take_precedence() {
        let config = Config {
            gemini_api_key: Some("stored-gemini".to_string()),
            openrouter_api_key: Some("stored-or".to_string()),
            ..Config::default()
        };
        let creds = config.credentials_with(|name| {
            (name == "GEMINI_API_KEY").then(|| "env-gemini".to_string())
        });
        assert_eq!(creds[HOSTED_PROVIDER], "env-gemini");
        assert_eq!(creds[AGGREGATOR_PROVIDER], "stored-or");

        let empty = Config::default().credentials_with(|_| Some("  ".to_string()));
        assert!(empty.is_empty());
    }

    #[test]
    fn masked_hides_keys() {
        let config = Config {
            gemini_api_key: Some("AIzaSecretValue1234".to_string()),
            ..Config::default()
        };
        let masked = config.masked();
        assert!(masked.gemini_api_key.unwrap().ends_with("1234"));
        assert!(!serde_json::to_string(&config.masked()).unwrap().contains("Secret"));
    }

    #[test]
    fn endpoint_overrides_must_be_http_urls() {
        let ok = Config {
            aggregator_base_url: Some("https://proxy.internal/api/v1".to_string()),
            ..Config::default()
        };
        assert!(ok.validate().is_ok());
        let relative = Config {
            hosted_base_url: Some("/v1beta".to_string()),
            ..Config::default()
        };
        assert!(matches!(
            relative.validate(),
            Err(ConfigError::InvalidUrl { field: "hosted_base_url", .. })
        ));
        let ftp = Config {
            hosted_base_url: Some("ftp://example.com".to_string()),
            ..Config::default()
        };
        assert!(ftp.validate().is_err());
    }

    #[test]
    fn default_provider_must_exist() {
        let config = Config {
            default_provider: "anthropic".to_string(),
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownDefaultProvider(name)) if name == "anthropic"
        ));
        let aggregator = Config {
            default_provider: AGGREGATOR_PROVIDER.to_string(),
            ..Config::default()
        };
        assert!(aggregator.validate().is_ok());
    }

    #[test]
    fn topology_honours_endpoint_overrides() {
        let config = Config {
            hosted_base_url: Some("http://127.0.0.1:9000".to_string()),
            default_provider: AGGREGATOR_PROVIDER.to_string(),
            ..Config::default()
        };
        let topology = Topology::from_config(&config);
        assert_eq!(topology.default_provider(), AGGREGATOR_PROVIDER);
        let hosted = topology.provider(HOSTED_PROVIDER).unwrap();
        assert!(hosted.endpoint_for("m").starts_with("http://127.0.0.1:9000/"));
    }
}
