use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::providers::ProviderKind;
use crate::resolver::ResolveHint;

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("concurrency must be at least 1")]
    InvalidConcurrency,
    #[error("at least one trace id is required")]
    NoTraces,
    #[error("trace reference {0} has an empty id")]
    EmptyTraceId(usize),
    #[error("a target model is required")]
    MissingModel,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid JSON request: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid YAML request: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// A trace to replay, optionally with facts already known about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TraceRef {
    Id(String),
    #[serde(rename_all = "camelCase")]
    Detailed {
        trace_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        observation_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        original_output: Option<String>,
    },
}

impl TraceRef {
    pub fn trace_id(&self) -> &str {
        match self {
            TraceRef::Id(id) => id,
            TraceRef::Detailed { trace_id, .. } => trace_id,
        }
    }

    /// `None` when the reference carries nothing beyond the id.
    pub fn hint(&self) -> Option<ResolveHint> {
        match self {
            TraceRef::Detailed {
                observation_id,
                original_output,
                ..
            } if observation_id.is_some() || original_output.is_some() => Some(ResolveHint {
                observation_id: observation_id.clone(),
                original_output: original_output.clone(),
            }),
            _ => None,
        }
    }
}

impl From<&str> for TraceRef {
    fn from(id: &str) -> Self {
        TraceRef::Id(id.to_string())
    }
}

/// Everything needed to replay a draft prompt over a set of traces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalRunRequest {
    /// Draft prompt template.
    pub prompt: String,
    pub traces: Vec<TraceRef>,
    pub model: String,
    pub provider: ProviderKind,
    #[serde(default = "default_run_name")]
    pub run_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verbosity: Option<String>,
    /// Pre-assigned id for the aggregate telemetry trace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_trace_id: Option<String>,
}

fn default_run_name() -> String {
    "replay".to_string()
}

impl EvalRunRequest {
    pub fn new(
        prompt: impl Into<String>,
        traces: Vec<TraceRef>,
        provider: ProviderKind,
        model: impl Into<String>,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            traces,
            model: model.into(),
            provider,
            run_name: default_run_name(),
            prompt_name: None,
            prompt_version: None,
            concurrency: None,
            reasoning: None,
            verbosity: None,
            run_trace_id: None,
        }
    }

    pub fn with_run_name(mut self, name: impl Into<String>) -> Self {
        self.run_name = name.into();
        self
    }

    pub fn with_prompt_name(mut self, name: impl Into<String>) -> Self {
        self.prompt_name = Some(name.into());
        self
    }

    pub fn with_prompt_version(mut self, version: u32) -> Self {
        self.prompt_version = Some(version);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    pub fn with_verbosity(mut self, verbosity: impl Into<String>) -> Self {
        self.verbosity = Some(verbosity.into());
        self
    }

    pub fn with_run_trace_id(mut self, id: impl Into<String>) -> Self {
        self.run_trace_id = Some(id.into());
        self
    }

    pub fn validate(&self) -> Result<(), RequestError> {
        if self.concurrency == Some(0) {
            return Err(RequestError::InvalidConcurrency);
        }
        if self.traces.is_empty() {
            return Err(RequestError::NoTraces);
        }
        if let Some(index) = self
            .traces
            .iter()
            .position(|trace| trace.trace_id().trim().is_empty())
        {
            return Err(RequestError::EmptyTraceId(index));
        }
        if self.model.trim().is_empty() {
            return Err(RequestError::MissingModel);
        }
        Ok(())
    }

    pub fn concurrency_or(&self, default: usize) -> usize {
        self.concurrency.unwrap_or(default).max(1)
    }

    /// Reads a request from JSON, or YAML when the extension is `.yaml`/`.yml`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RequestError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let yaml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("yaml" | "yml")
        );
        if yaml {
            Ok(serde_yaml::from_str(&content)?)
        } else {
            Ok(serde_json::from_str(&content)?)
        }
    }
}

/// One trigger of a run. The id keys step memoization, so redelivering the
/// same event resumes instead of starting over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub id: String,
    pub request: EvalRunRequest,
}

impl RunEvent {
    pub fn new(request: EvalRunRequest) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            request,
        }
    }

    pub fn with_id(id: impl Into<String>, request: EvalRunRequest) -> Self {
        Self {
            id: id.into(),
            request,
        }
    }

    /// Id of the aggregate run: the pre-assigned trace id, else the event id.
    pub fn run_id(&self) -> String {
        self.request
            .run_trace_id
            .clone()
            .unwrap_or_else(|| self.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn trace_refs_accept_both_shapes() {
        let refs: Vec<TraceRef> = serde_json::from_value(json!([
            "t-1",
            { "traceId": "t-2", "observationId": "o-9", "originalOutput": "old" },
            { "traceId": "t-3" }
        ]))
        .unwrap();

        assert_eq!(refs[0], TraceRef::Id("t-1".into()));
        assert_eq!(refs[1].trace_id(), "t-2");
        assert_eq!(refs[1].hint().unwrap().observation_id.as_deref(), Some("o-9"));
        assert!(refs[2].hint().is_none());
    }

    #[test]
    fn yaml_request_uses_camel_case_keys() {
        let request: EvalRunRequest = serde_yaml::from_str(
            "prompt: 'Hello {{name}}'\ntraces: [a, b]\nmodel: gpt-test\nprovider: openai\nrunName: smoke\nconcurrency: 2\n",
        )
        .unwrap();
        assert_eq!(request.provider, ProviderKind::OpenAI);
        assert_eq!(request.run_name, "smoke");
        assert_eq!(request.concurrency_or(10), 2);
        assert!(request.validate().is_ok());
    }

    #[test]
    fn validation_rejects_unusable_requests() {
        let base = EvalRunRequest::new("p", vec!["t".into()], ProviderKind::Gemini, "m");

        assert!(matches!(
            base.clone().with_concurrency(0).validate(),
            Err(RequestError::InvalidConcurrency)
        ));
        assert!(matches!(
            EvalRunRequest { traces: vec![], ..base.clone() }.validate(),
            Err(RequestError::NoTraces)
        ));
        assert!(matches!(
            EvalRunRequest { traces: vec!["t".into(), " ".into()], ..base.clone() }.validate(),
            Err(RequestError::EmptyTraceId(1))
        ));
        assert!(matches!(
            EvalRunRequest { model: "".into(), ..base }.validate(),
            Err(RequestError::MissingModel)
        ));
    }
}
