use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::executor::{strip_code_fence, ExecutionOutput};
use crate::resolver::{ReplayInputs, VariableSource};
use crate::template::TemplateDialect;
use crate::tools::NormalizedToolCall;
use crate::types::TokenUsage;

/// Outcome of replaying one trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEvalResult {
    pub trace_id: String,
    pub success: bool,
    pub variables: Map<String, Value>,
    pub output: Option<String>,
    pub parsed: Option<Value>,
    pub original_output: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<NormalizedToolCall>,
    pub usage: Option<TokenUsage>,
    pub latency_ms: u64,
    pub error: Option<String>,
    pub observation_id: Option<String>,
    pub source: Option<VariableSource>,
    pub dialect: Option<TemplateDialect>,
    #[serde(default)]
    pub validation_errors: Vec<String>,
    pub output_matches_original: Option<bool>,
}

impl TraceEvalResult {
    pub fn failed(trace_id: impl Into<String>, error: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            trace_id: trace_id.into(),
            success: false,
            variables: Map::new(),
            output: None,
            parsed: None,
            original_output: None,
            tool_calls: Vec::new(),
            usage: None,
            latency_ms,
            error: Some(error.into()),
            observation_id: None,
            source: None,
            dialect: None,
            validation_errors: Vec::new(),
            output_matches_original: None,
        }
    }

    /// Failure after inputs were resolved; keeps what was resolved.
    pub fn failed_with_inputs(
        trace_id: impl Into<String>,
        inputs: ReplayInputs,
        dialect: TemplateDialect,
        error: impl Into<String>,
        latency_ms: u64,
    ) -> Self {
        Self {
            variables: inputs.variables,
            original_output: inputs.original_output,
            observation_id: inputs.observation_id,
            source: Some(inputs.source),
            dialect: Some(dialect),
            ..Self::failed(trace_id, error, latency_ms)
        }
    }

    pub fn succeeded(
        trace_id: impl Into<String>,
        inputs: ReplayInputs,
        dialect: TemplateDialect,
        output: ExecutionOutput,
        latency_ms: u64,
    ) -> Self {
        let matches = inputs
            .original_output
            .as_deref()
            .map(|original| outputs_match(&output.text, original));

        Self {
            trace_id: trace_id.into(),
            success: true,
            variables: inputs.variables,
            output: Some(output.text),
            parsed: output.parsed,
            original_output: inputs.original_output,
            tool_calls: output.tool_calls,
            usage: output.usage,
            latency_ms,
            error: None,
            observation_id: inputs.observation_id,
            source: Some(inputs.source),
            dialect: Some(dialect),
            validation_errors: output.validation_errors,
            output_matches_original: matches,
        }
    }
}

/// Compares as JSON when both sides parse, otherwise as trimmed text.
pub fn outputs_match(output: &str, original: &str) -> bool {
    let as_json = |text: &str| serde_json::from_str::<Value>(strip_code_fence(text)).ok();
    match (as_json(output), as_json(original)) {
        (Some(left), Some(right)) => left == right,
        _ => output.trim() == original.trim(),
    }
}

/// Aggregate of one evaluation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalRunResult {
    pub run_id: String,
    pub run_name: String,
    pub total: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub matching_count: usize,
    pub usage: TokenUsage,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub results_url: Option<String>,
    pub results: Vec<TraceEvalResult>,
}

impl EvalRunResult {
    pub fn aggregate(
        run_id: impl Into<String>,
        run_name: impl Into<String>,
        results: Vec<TraceEvalResult>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        let success_count = results.iter().filter(|r| r.success).count();
        let matching_count = results
            .iter()
            .filter(|r| r.output_matches_original == Some(true))
            .count();
        let mut usage = TokenUsage::default();
        for result in &results {
            if let Some(item) = &result.usage {
                usage.accumulate(item);
            }
        }

        Self {
            run_id: run_id.into(),
            run_name: run_name.into(),
            total: results.len(),
            success_count,
            failure_count: results.len() - success_count,
            matching_count,
            usage,
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
            results_url: None,
            results,
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &TraceEvalResult> {
        self.results.iter().filter(|r| !r.success)
    }

    /// The run without its per-trace results.
    pub fn summary(&self) -> Result<Value, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        if let Some(object) = value.as_object_mut() {
            object.remove("results");
        }
        Ok(value)
    }
}
