use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{ConfigError, LangfuseConfig};
use crate::types::TokenUsage;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("ingestion endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid ingestion url: {0}")]
    InvalidUrl(String),
}

/// The aggregate trace opened for one evaluation run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunTrace {
    pub id: String,
    pub name: String,
    pub metadata: Value,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRecord {
    pub trace_id: String,
    pub name: String,
    pub model: String,
    pub provider: String,
    pub input: Value,
    pub output: Value,
    pub usage: Option<TokenUsage>,
    pub metadata: Value,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceUpdate {
    pub id: String,
    pub output: Value,
    pub metadata: Value,
}

#[async_trait]
pub trait Telemetry: Send + Sync {
    fn create_trace(&self, trace: RunTrace);

    fn record_generation(&self, generation: GenerationRecord);

    fn update_trace(&self, update: TraceUpdate);

    async fn flush(&self) -> Result<(), TelemetryError>;
}

#[derive(Debug, Clone, Serialize)]
struct IngestionEvent {
    id: String,
    timestamp: String,
    #[serde(rename = "type")]
    kind: &'static str,
    body: Value,
}

impl IngestionEvent {
    fn new(kind: &'static str, body: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now().to_rfc3339(),
            kind,
            body,
        }
    }
}

/// Buffers events and sends them as one batch to the public ingestion API.
pub struct LangfuseTelemetry {
    client: Client,
    config: LangfuseConfig,
    pending: Mutex<Vec<IngestionEvent>>,
}

impl LangfuseTelemetry {
    pub fn new(config: LangfuseConfig) -> Result<Self, TelemetryError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            client,
            config,
            pending: Mutex::new(Vec::new()),
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let config = LangfuseConfig::from_env()?;
        Self::new(config).map_err(|error| ConfigError::InvalidValue {
            key: "LANGFUSE_BASE_URL",
            value: error.to_string(),
        })
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    fn push(&self, event: IngestionEvent) {
        self.pending.lock().unwrap().push(event);
    }
}

fn usage_body(usage: &TokenUsage) -> Value {
    json!({
        "input": usage.prompt_tokens,
        "output": usage.completion_tokens,
        "total": usage.total_tokens,
        "unit": "TOKENS",
    })
}

#[async_trait]
impl Telemetry for LangfuseTelemetry {
    fn create_trace(&self, trace: RunTrace) {
        self.push(IngestionEvent::new(
            "trace-create",
            json!({
                "id": trace.id,
                "name": trace.name,
                "metadata": trace.metadata,
                "tags": trace.tags,
                "timestamp": Utc::now().to_rfc3339(),
            }),
        ));
    }

    fn record_generation(&self, generation: GenerationRecord) {
        let mut body = Map::new();
        body.insert("id".into(), json!(Uuid::new_v4().to_string()));
        body.insert("traceId".into(), json!(generation.trace_id));
        body.insert("name".into(), json!(generation.name));
        body.insert("model".into(), json!(generation.model));
        body.insert("input".into(), generation.input);
        body.insert("output".into(), generation.output);
        body.insert("startTime".into(), json!(generation.start_time.to_rfc3339()));
        body.insert("endTime".into(), json!(generation.end_time.to_rfc3339()));
        body.insert("metadata".into(), generation.metadata);
        if let Some(usage) = &generation.usage {
            body.insert("usage".into(), usage_body(usage));
        }
        self.push(IngestionEvent::new("generation-create", Value::Object(body)));
    }

    fn update_trace(&self, update: TraceUpdate) {
        // trace-create upserts by id
        self.push(IngestionEvent::new(
            "trace-create",
            json!({
                "id": update.id,
                "output": update.output,
                "metadata": update.metadata,
            }),
        ));
    }

    async fn flush(&self) -> Result<(), TelemetryError> {
        let batch = std::mem::take(&mut *self.pending.lock().unwrap());
        if batch.is_empty() {
            return Ok(());
        }

        let url = self
            .config
            .api_url(&["api", "public", "ingestion"])
            .map_err(TelemetryError::InvalidUrl)?;
        let count = batch.len();

        let sent = async {
            let response = self
                .client
                .post(url)
                .basic_auth(&self.config.public_key, Some(&self.config.secret_key))
                .json(&json!({ "batch": &batch }))
                .send()
                .await?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(TelemetryError::Status {
                    status: status.as_u16(),
                    body,
                });
            }
            Ok(())
        }
        .await;

        match sent {
            Ok(()) => {
                debug!(events = count, "flushed telemetry");
                Ok(())
            }
            Err(error) => {
                warn!(events = count, %error, "telemetry flush failed; events kept for retry");
                let mut pending = self.pending.lock().unwrap();
                let newer = std::mem::replace(&mut *pending, batch);
                pending.extend(newer);
                Err(error)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    TraceCreated(RunTrace),
    Generation(GenerationRecord),
    TraceUpdated(TraceUpdate),
}

/// Keeps every event in memory. Events only count as delivered after `flush`.
#[derive(Debug, Default)]
pub struct MemoryTelemetry {
    pending: Mutex<Vec<TelemetryEvent>>,
    flushed: Mutex<Vec<TelemetryEvent>>,
}

impl MemoryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flushed(&self) -> Vec<TelemetryEvent> {
        self.flushed.lock().unwrap().clone()
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn generations(&self) -> Vec<GenerationRecord> {
        self.flushed()
            .into_iter()
            .filter_map(|event| match event {
                TelemetryEvent::Generation(record) => Some(record),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: TelemetryEvent) {
        self.pending.lock().unwrap().push(event);
    }
}

#[async_trait]
impl Telemetry for MemoryTelemetry {
    fn create_trace(&self, trace: RunTrace) {
        self.push(TelemetryEvent::TraceCreated(trace));
    }

    fn record_generation(&self, generation: GenerationRecord) {
        self.push(TelemetryEvent::Generation(generation));
    }

    fn update_trace(&self, update: TraceUpdate) {
        self.push(TelemetryEvent::TraceUpdated(update));
    }

    async fn flush(&self) -> Result<(), TelemetryError> {
        let batch = std::mem::take(&mut *self.pending.lock().unwrap());
        self.flushed.lock().unwrap().extend(batch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_trace() -> RunTrace {
        RunTrace {
            id: "run-1".into(),
            name: "eval".into(),
            metadata: json!({ "model": "m" }),
            tags: vec!["replay".into()],
        }
    }

    #[tokio::test]
    async fn memory_telemetry_delivers_on_flush() {
        let telemetry = MemoryTelemetry::new();
        telemetry.create_trace(run_trace());
        assert_eq!(telemetry.pending(), 1);
        assert!(telemetry.flushed().is_empty());

        telemetry.flush().await.unwrap();
        assert_eq!(telemetry.pending(), 0);
        assert_eq!(telemetry.flushed(), vec![TelemetryEvent::TraceCreated(run_trace())]);
    }

    #[tokio::test]
    async fn failed_flush_keeps_events() {
        let config = LangfuseConfig::new("pk", "sk").with_base_url("http://127.0.0.1:9");
        let telemetry = LangfuseTelemetry::new(config).unwrap();
        telemetry.create_trace(run_trace());
        telemetry.update_trace(TraceUpdate {
            id: "run-1".into(),
            output: json!({}),
            metadata: json!({}),
        });

        assert!(telemetry.flush().await.is_err());
        assert_eq!(telemetry.pending(), 2);
    }

    #[test]
    fn usage_maps_to_ingestion_shape() {
        let body = usage_body(&TokenUsage::new(3, 4));
        assert_eq!(body, json!({ "input": 3, "output": 4, "total": 7, "unit": "TOKENS" }));
    }
}
