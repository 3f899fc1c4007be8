use std::{env, fs, path::Path, path::PathBuf, time::Duration};

use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_LANGFUSE_URL: &str = "https://cloud.langfuse.com";

pub const DEFAULT_CONCURRENCY: usize = 10;
pub const DEFAULT_OBSERVATION_LIMIT: usize = 50;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing configuration: set the {0} environment variable")]
    MissingEnv(&'static str),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Connection settings for the trace store and its ingestion endpoint.
#[derive(Debug, Clone)]
pub struct LangfuseConfig {
    pub base_url: String,
    pub public_key: String,
    pub secret_key: String,
    pub request_timeout: Duration,
}

impl LangfuseConfig {
    pub fn new(public_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_LANGFUSE_URL.to_string(),
            public_key: public_key.into(),
            secret_key: secret_key.into(),
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let public_key = env::var("LANGFUSE_PUBLIC_KEY")
            .map_err(|_| ConfigError::MissingEnv("LANGFUSE_PUBLIC_KEY"))?;
        let secret_key = env::var("LANGFUSE_SECRET_KEY")
            .map_err(|_| ConfigError::MissingEnv("LANGFUSE_SECRET_KEY"))?;
        let mut config = Self::new(public_key, secret_key);

        if let Ok(base_url) = env::var("LANGFUSE_BASE_URL").or_else(|_| env::var("LANGFUSE_HOST")) {
            config.base_url = base_url;
        }
        if let Ok(timeout_ms) = env::var("LANGFUSE_REQUEST_TIMEOUT_MS") {
            if let Ok(ms) = timeout_ms.parse::<u64>() {
                config.request_timeout = Duration::from_millis(ms);
            }
        }

        Ok(config)
    }

    /// Joins `segments` onto the base URL, keeping any path prefix it has.
    pub fn api_url(&self, segments: &[&str]) -> Result<Url, String> {
        let mut url = Url::parse(&self.base_url).map_err(|error| error.to_string())?;
        url.path_segments_mut()
            .map_err(|_| format!("{} cannot be a base url", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

/// Engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Maximum generation observations fetched per trace.
    pub observation_limit: usize,
    /// Batch size when a request does not set one.
    pub default_concurrency: usize,
    /// Where run payloads are written.
    pub results_dir: PathBuf,
    /// Where completed step outputs are kept between retries.
    pub steps_dir: PathBuf,
    /// Public prefix for payload URLs; `file://` URLs are returned when unset.
    pub results_base_url: Option<String>,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            observation_limit: DEFAULT_OBSERVATION_LIMIT,
            default_concurrency: DEFAULT_CONCURRENCY,
            results_dir: PathBuf::from("./data/eval-runs"),
            steps_dir: PathBuf::from("./data/steps"),
            results_base_url: None,
        }
    }
}

impl ReplayConfig {
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Loads `path` when given, then applies `REPLAY_*` overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Ok(value) = env::var("REPLAY_OBSERVATION_LIMIT") {
            self.observation_limit = parse_count("REPLAY_OBSERVATION_LIMIT", &value)?;
        }
        if let Ok(value) = env::var("REPLAY_DEFAULT_CONCURRENCY") {
            self.default_concurrency = parse_count("REPLAY_DEFAULT_CONCURRENCY", &value)?;
        }
        if let Ok(value) = env::var("REPLAY_RESULTS_DIR") {
            self.results_dir = PathBuf::from(value);
        }
        if let Ok(value) = env::var("REPLAY_STEPS_DIR") {
            self.steps_dir = PathBuf::from(value);
        }
        if let Ok(value) = env::var("REPLAY_RESULTS_BASE_URL") {
            self.results_base_url = Some(value);
        }
        Ok(self)
    }
}

fn parse_count(key: &'static str, value: &str) -> Result<usize, ConfigError> {
    match value.trim().parse::<usize>() {
        Ok(count) if count > 0 => Ok(count),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_fills_missing_fields_with_defaults() {
        let config = ReplayConfig::from_yaml_str("observation_limit: 5\nresults_base_url: https://blobs.example\n")
            .unwrap();
        assert_eq!(config.observation_limit, 5);
        assert_eq!(config.default_concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(config.results_base_url.as_deref(), Some("https://blobs.example"));
    }

    #[test]
    fn api_url_keeps_path_prefix() {
        let config = LangfuseConfig::new("pk", "sk").with_base_url("https://host.example/langfuse/");
        let url = config.api_url(&["api", "public", "traces", "t 1"]).unwrap();
        assert_eq!(url.as_str(), "https://host.example/langfuse/api/public/traces/t%201");
    }

    #[test]
    fn rejects_zero_counts() {
        assert!(matches!(
            parse_count("REPLAY_DEFAULT_CONCURRENCY", "0"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert_eq!(parse_count("REPLAY_DEFAULT_CONCURRENCY", " 4 ").unwrap(), 4);
    }
}
