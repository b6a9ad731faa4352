use std::path::PathBuf;
use std::time::Duration;
use url::Url;

pub const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:8080/_hakoniwa/api";
pub const DEFAULT_STORAGE_KEY: &str = "portal-local-obfuscation-key";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 3000;
pub const DEFAULT_LOG_FILTER: &str = "portal=info,portal_client=info";
pub const LOG_ENV: &str = "PORTAL_LOG";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub state_file: PathBuf,
    pub storage_key: String,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("base url is empty")]
    EmptyBaseUrl,
    #[error("invalid base url {0}: expected an http or https url")]
    InvalidBaseUrl(String),
    #[error("invalid poll interval {0}: expected milliseconds greater than zero")]
    InvalidPollInterval(String),
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let api_base_url = normalize_base_url(
            &lookup("PORTAL_API_BASE_URL").unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()),
        )?;
        let state_file = lookup("PORTAL_STATE_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("portal-client-state.json"));
        let storage_key =
            lookup("PORTAL_STORAGE_KEY").unwrap_or_else(|| DEFAULT_STORAGE_KEY.to_string());
        let poll_interval = match lookup("PORTAL_POLL_INTERVAL_MS") {
            None => Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => Duration::from_millis(ms),
                _ => return Err(ConfigError::InvalidPollInterval(raw)),
            },
        };
        Ok(Self {
            api_base_url,
            state_file,
            storage_key,
            poll_interval,
        })
    }

    /// Applies command-line overrides on top of the environment.
    pub fn with_overrides(
        mut self,
        base_url: Option<&str>,
        state_file: Option<PathBuf>,
    ) -> Result<Self, ConfigError> {
        if let Some(base_url) = base_url {
            self.api_base_url = normalize_base_url(base_url)?;
        }
        if let Some(state_file) = state_file {
            self.state_file = state_file;
        }
        Ok(self)
    }
}

pub fn normalize_base_url(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(ConfigError::EmptyBaseUrl);
    }
    let parsed = Url::parse(trimmed).map_err(|_| ConfigError::InvalidBaseUrl(raw.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(ConfigError::InvalidBaseUrl(raw.to_string()));
    }
    Ok(trimmed.to_string())
}
