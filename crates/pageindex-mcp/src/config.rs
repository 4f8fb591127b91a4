//! Environment configuration.

use pageindex_client::callback::RedirectTarget;
use pageindex_client::oauth::DEFAULT_REDIRECT_URL;
use pageindex_client::{ClientKind, DEFAULT_TIMEOUT};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default remote endpoint base.
pub const DEFAULT_API_URL: &str = "https://pageindex.vercel.app";

/// Invalid configuration value.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid {var}={value:?}: {reason}")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
    pub reason: String,
}

impl ConfigError {
    fn new(var: &'static str, value: &str, reason: impl Into<String>) -> Self {
        Self {
            var,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Bridge configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub api_url: String,
    /// Static bearer token; disables OAuth when set.
    pub api_key: Option<String>,
    pub redirect_url: String,
    pub client_kind: ClientKind,
    /// Credential file; `None` means the default location.
    pub credentials_path: Option<PathBuf>,
    pub timeout: Duration,
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            api_key: None,
            redirect_url: DEFAULT_REDIRECT_URL.to_string(),
            client_kind: ClientKind::Cli,
            credentials_path: None,
            timeout: DEFAULT_TIMEOUT,
            debug: false,
        }
    }
}

impl Config {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `get` to read variables. Empty values count as unset.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut config = Self::default();

        if let Some(url) = get("PAGEINDEX_API_URL") {
            config.api_url = url;
        }
        config.api_key = get("PAGEINDEX_API_KEY");
        if let Some(url) = get("PAGEINDEX_REDIRECT_URL") {
            config.redirect_url = url;
        }
        if let Some(kind) = get("PAGEINDEX_CLIENT_KIND") {
            config.client_kind = kind
                .parse()
                .map_err(|e: String| ConfigError::new("PAGEINDEX_CLIENT_KIND", &kind, e))?;
        }
        config.credentials_path = get("PAGEINDEX_CREDENTIALS_PATH").map(PathBuf::from);
        if let Some(ms) = get("CONNECTION_TIMEOUT") {
            config.timeout = parse_timeout(&ms)?;
        }
        if let Some(debug) = get("DEBUG") {
            config.debug = matches!(debug.to_ascii_lowercase().as_str(), "true" | "1");
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the values that other components parse later.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match url::Url::parse(&self.api_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(_) => {
                return Err(ConfigError::new(
                    "PAGEINDEX_API_URL",
                    &self.api_url,
                    "expected an http or https URL",
                ))
            }
            Err(e) => return Err(ConfigError::new("PAGEINDEX_API_URL", &self.api_url, e.to_string())),
        }

        RedirectTarget::parse(&self.redirect_url).map_err(|e| {
            ConfigError::new("PAGEINDEX_REDIRECT_URL", &self.redirect_url, e.to_string())
        })?;

        Ok(())
    }

    pub fn uses_api_key(&self) -> bool {
        self.api_key.is_some()
    }
}

/// Parse a timeout in milliseconds.
pub fn parse_timeout(ms: &str) -> Result<Duration, ConfigError> {
    match ms.parse::<u64>() {
        Ok(0) => Err(ConfigError::new("CONNECTION_TIMEOUT", ms, "must be positive")),
        Ok(ms) => Ok(Duration::from_millis(ms)),
        Err(e) => Err(ConfigError::new("CONNECTION_TIMEOUT", ms, e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.api_url, "https://pageindex.vercel.app");
        assert_eq!(config.redirect_url, "http://localhost:8090/callback");
        assert_eq!(config.timeout, Duration::from_millis(30_000));
        assert!(!config.uses_api_key());
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("PAGEINDEX_API_URL", "http://127.0.0.1:9000"),
            ("PAGEINDEX_API_KEY", "pi-key"),
            ("PAGEINDEX_CLIENT_KIND", "MCPB"),
            ("PAGEINDEX_CREDENTIALS_PATH", "/tmp/creds.json"),
            ("CONNECTION_TIMEOUT", "5000"),
            ("DEBUG", "true"),
        ])
        .unwrap();

        assert_eq!(config.api_url, "http://127.0.0.1:9000");
        assert_eq!(config.api_key.as_deref(), Some("pi-key"));
        assert_eq!(config.client_kind, ClientKind::Mcpb);
        assert_eq!(config.credentials_path, Some(PathBuf::from("/tmp/creds.json")));
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert!(config.debug);
    }

    #[test]
    fn test_empty_values_are_unset() {
        let config = load(&[("PAGEINDEX_API_KEY", "  "), ("DEBUG", "")]).unwrap();
        assert!(config.api_key.is_none());
        assert!(!config.debug);
    }

    #[test]
    fn test_invalid_values() {
        assert_eq!(load(&[("CONNECTION_TIMEOUT", "soon")]).unwrap_err().var, "CONNECTION_TIMEOUT");
        assert_eq!(load(&[("CONNECTION_TIMEOUT", "0")]).unwrap_err().var, "CONNECTION_TIMEOUT");
        assert_eq!(
            load(&[("PAGEINDEX_CLIENT_KIND", "browser")]).unwrap_err().var,
            "PAGEINDEX_CLIENT_KIND"
        );
        assert_eq!(
            load(&[("PAGEINDEX_API_URL", "ftp://example.com")]).unwrap_err().var,
            "PAGEINDEX_API_URL"
        );
        assert_eq!(
            load(&[("PAGEINDEX_REDIRECT_URL", "not a url")]).unwrap_err().var,
            "PAGEINDEX_REDIRECT_URL"
        );
    }
}
