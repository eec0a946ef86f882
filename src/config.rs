// Dropbox client configuration
// Endpoints, timeouts and integration constants, persisted as JSON

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::providers::RequestTimeouts;

pub const DEFAULT_AUTH_URL: &str = "https://www.dropbox.com/oauth2/authorize";
pub const DEFAULT_TOKEN_URL: &str = "https://api.dropboxapi.com/oauth2/token";
pub const DEFAULT_API_BASE: &str = "https://api.dropboxapi.com/2";
pub const DEFAULT_CONTENT_BASE: &str = "https://content.dropboxapi.com/2";
pub const DEFAULT_URL_PREFIX: &str = "edd-dropbox://";

/// Client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// OAuth2 consent page
    pub auth_url: String,
    /// OAuth2 token endpoint (code exchange and refresh)
    pub token_url: String,
    /// RPC endpoints (JSON in, JSON out)
    pub api_base: String,
    /// Content endpoints (binary upload)
    pub content_base: String,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub user_agent: String,
    /// Marks a stored file reference as Dropbox-resident
    pub url_prefix: String,
    /// Folder selector stops after this many folders
    pub folder_limit: usize,
    /// Lifetime of an unused OAuth CSRF state
    pub oauth_state_ttl_secs: u64,
    /// Used when the token endpoint omits `expires_in`
    pub default_expires_in_secs: u64,
    /// Freshness marker lapses this long before the real expiry
    pub freshness_margin_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            auth_url: DEFAULT_AUTH_URL.to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            content_base: DEFAULT_CONTENT_BASE.to_string(),
            connect_timeout_secs: 5,
            request_timeout_secs: 10,
            user_agent: format!("edd-dropbox-storage/{}", env!("CARGO_PKG_VERSION")),
            url_prefix: DEFAULT_URL_PREFIX.to_string(),
            folder_limit: 50,
            oauth_state_ttl_secs: 600,
            default_expires_in_secs: 14400,
            freshness_margin_secs: 300,
        }
    }
}

impl ClientConfig {
    pub fn timeouts(&self) -> RequestTimeouts {
        RequestTimeouts {
            connect: Duration::from_secs(self.connect_timeout_secs),
            total: Duration::from_secs(self.request_timeout_secs),
        }
    }

    pub fn oauth_state_ttl(&self) -> Duration {
        Duration::from_secs(self.oauth_state_ttl_secs)
    }

    pub fn freshness_margin(&self) -> Duration {
        Duration::from_secs(self.freshness_margin_secs)
    }
}

/// Get the path to the config file
pub fn get_config_path() -> PathBuf {
    let config_dir = dirs::config_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")));
    config_dir.join("edd-dropbox").join("config.json")
}

/// Load configuration from `path`, falling back to defaults
pub fn load_config_from(path: &Path) -> ClientConfig {
    if path.exists() {
        match fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!("Failed to parse config {:?}: {}", path, e);
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read config {:?}: {}", path, e);
            }
        }
    }

    ClientConfig::default()
}

/// Save configuration to `path`; an invalid config is never written
pub fn save_config_to(path: &Path, config: &ClientConfig) -> Result<(), String> {
    validate_config(config)?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
    }

    let content = serde_json::to_string_pretty(config)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;

    fs::write(path, content).map_err(|e| format!("Failed to write config: {}", e))?;

    tracing::info!("Config saved to {:?}", path);
    Ok(())
}

/// Validate configuration
pub fn validate_config(config: &ClientConfig) -> Result<(), String> {
    for (name, value) in [
        ("auth_url", &config.auth_url),
        ("token_url", &config.token_url),
        ("api_base", &config.api_base),
        ("content_base", &config.content_base),
    ] {
        let parsed = url::Url::parse(value).map_err(|e| format!("{} is not a valid URL: {}", name, e))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(format!("{} must use http or https", name));
        }
    }

    if config.connect_timeout_secs == 0 || config.request_timeout_secs == 0 {
        return Err("Timeouts must be greater than zero".to_string());
    }

    if config.url_prefix.is_empty() {
        return Err("URL prefix cannot be empty".to_string());
    }

    if config.folder_limit == 0 {
        return Err("Folder limit must be at least 1".to_string());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.auth_url, "https://www.dropbox.com/oauth2/authorize");
        assert_eq!(config.timeouts(), RequestTimeouts::default());
        assert_eq!(config.folder_limit, 50);
        assert_eq!(config.url_prefix, "edd-dropbox://");
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let json = r#"{"api_base":"http://127.0.0.1:8080/2","request_timeout_secs":30}"#;
        let config: ClientConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.api_base, "http://127.0.0.1:8080/2");
        assert_eq!(config.request_timeout_secs, 30);
        assert_eq!(config.connect_timeout_secs, 5);
        assert_eq!(config.content_base, DEFAULT_CONTENT_BASE);
    }

    #[test]
    fn test_validate_config() {
        let mut config = ClientConfig::default();

        config.api_base = "ftp://example.com".to_string();
        assert!(validate_config(&config).is_err());

        config = ClientConfig::default();
        config.request_timeout_secs = 0;
        assert!(validate_config(&config).is_err());

        config = ClientConfig::default();
        config.url_prefix = String::new();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = ClientConfig {
            folder_limit: 10,
            ..Default::default()
        };
        save_config_to(&path, &config).unwrap();
        assert_eq!(load_config_from(&path), config);
    }

    #[test]
    fn test_save_refuses_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let config = ClientConfig {
            folder_limit: 0,
            ..Default::default()
        };
        assert!(save_config_to(&path, &config).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_unparsable_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "not json").unwrap();
        assert_eq!(load_config_from(&path), ClientConfig::default());
    }
}
