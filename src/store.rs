use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::{ConfigError, LangfuseConfig};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("trace store returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid trace store url: {0}")]
    InvalidUrl(String),

    #[error("failed to decode trace store response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub output: Value,
}

impl TraceRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }
}

/// One generation recorded under a trace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub output: Value,
}

impl Observation {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = output;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TraceSnapshot {
    pub trace: TraceRecord,
    pub observations: Vec<Observation>,
}

#[async_trait]
pub trait TraceStore: Send + Sync {
    async fn trace(&self, trace_id: &str) -> Result<TraceRecord, StoreError>;

    async fn generations(&self, trace_id: &str, limit: usize)
        -> Result<Vec<Observation>, StoreError>;
}

#[derive(Debug, Deserialize)]
struct ObservationPage {
    #[serde(default)]
    data: Vec<Observation>,
}

/// Client for the public trace API, authenticated with a key pair.
#[derive(Debug, Clone)]
pub struct HttpTraceStore {
    client: Client,
    config: LangfuseConfig,
}

impl HttpTraceStore {
    pub fn new(config: LangfuseConfig) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { client, config })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let config = LangfuseConfig::from_env()?;
        Self::new(config).map_err(|error| ConfigError::InvalidValue {
            key: "LANGFUSE_BASE_URL",
            value: error.to_string(),
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, StoreError> {
        self.config.api_url(segments).map_err(StoreError::InvalidUrl)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: Url,
        query: &[(&str, String)],
    ) -> Result<T, StoreError> {
        let response = self
            .client
            .get(url)
            .basic_auth(&self.config.public_key, Some(&self.config.secret_key))
            .query(query)
            .send()
            .await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl TraceStore for HttpTraceStore {
    async fn trace(&self, trace_id: &str) -> Result<TraceRecord, StoreError> {
        let url = self.url(&["api", "public", "traces", trace_id])?;
        self.get_json(url, &[]).await
    }

    async fn generations(
        &self,
        trace_id: &str,
        limit: usize,
    ) -> Result<Vec<Observation>, StoreError> {
        let url = self.url(&["api", "public", "observations"])?;
        let page: ObservationPage = self
            .get_json(
                url,
                &[
                    ("traceId", trace_id.to_string()),
                    ("type", "GENERATION".to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        Ok(page.data)
    }
}

/// In-process store for tests and offline replays.
#[derive(Debug, Clone, Default)]
pub struct MemoryTraceStore {
    traces: HashMap<String, TraceRecord>,
    observations: HashMap<String, Vec<Observation>>,
    failing_observations: HashSet<String>,
}

impl MemoryTraceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_trace(mut self, trace: TraceRecord, observations: Vec<Observation>) -> Self {
        self.observations.insert(trace.id.clone(), observations);
        self.traces.insert(trace.id.clone(), trace);
        self
    }

    /// Makes observation fetches for `trace_id` fail.
    pub fn with_failing_observations(mut self, trace_id: impl Into<String>) -> Self {
        self.failing_observations.insert(trace_id.into());
        self
    }
}

#[async_trait]
impl TraceStore for MemoryTraceStore {
    async fn trace(&self, trace_id: &str) -> Result<TraceRecord, StoreError> {
        self.traces
            .get(trace_id)
            .cloned()
            .ok_or_else(|| StoreError::Status {
                status: 404,
                body: format!("trace {trace_id} not found"),
            })
    }

    async fn generations(
        &self,
        trace_id: &str,
        limit: usize,
    ) -> Result<Vec<Observation>, StoreError> {
        if self.failing_observations.contains(trace_id) {
            return Err(StoreError::Status {
                status: 503,
                body: "observations unavailable".to_string(),
            });
        }
        Ok(self
            .observations
            .get(trace_id)
            .map(|list| list.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}
