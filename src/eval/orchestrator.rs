use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::blob::{BlobStore, FsBlobStore};
use crate::config::{ConfigError, ReplayConfig, DEFAULT_CONCURRENCY};
use crate::eval::report::{EvalRunResult, TraceEvalResult};
use crate::eval::request::{EvalRunRequest, RequestError, RunEvent, TraceRef};
use crate::executor::{EvalExecutor, ExecutionConfig};
use crate::providers::{gemini::Gemini, openai::OpenAI};
use crate::resolver::{ResolveHint, TraceResolver};
use crate::steps::{FileStepStore, StepError, StepStore, Steps};
use crate::store::HttpTraceStore;
use crate::telemetry::{LangfuseTelemetry, RunTrace, TraceUpdate};
use crate::template;

pub const STEP_CREATE_TRACE: &str = "create-trace";
pub const STEP_RUN_EVALUATIONS: &str = "run-evaluations";
pub const STEP_PERSIST_RESULTS: &str = "persist-results";
pub const STEP_UPDATE_TRACE: &str = "update-trace";

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid run request: {0}")]
    InvalidRequest(#[from] RequestError),

    #[error(transparent)]
    Step(#[from] StepError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunStart {
    run_trace_id: String,
    started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Evaluations {
    results: Vec<TraceEvalResult>,
    finished_at: DateTime<Utc>,
}

pub struct RunOrchestrator {
    resolver: TraceResolver,
    executor: EvalExecutor,
    blobs: Arc<dyn BlobStore>,
    steps: Arc<dyn StepStore>,
    default_concurrency: usize,
}

impl RunOrchestrator {
    pub fn new(
        resolver: TraceResolver,
        executor: EvalExecutor,
        blobs: Arc<dyn BlobStore>,
        steps: Arc<dyn StepStore>,
    ) -> Self {
        Self {
            resolver,
            executor,
            blobs,
            steps,
            default_concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn with_default_concurrency(mut self, concurrency: usize) -> Self {
        self.default_concurrency = concurrency.max(1);
        self
    }

    /// Wires the HTTP trace store, ingestion telemetry, file-backed blob and
    /// step stores, and whichever providers have credentials in the
    /// environment. A provider without credentials fails its runs with
    /// `MissingProvider`.
    pub fn from_env(config: &ReplayConfig) -> Result<Self, ConfigError> {
        let store = HttpTraceStore::from_env()?;
        let telemetry = LangfuseTelemetry::from_env()?;

        let mut executor = EvalExecutor::new(Arc::new(telemetry));
        match OpenAI::from_env() {
            Ok(provider) => executor = executor.with_chat_provider(Arc::new(provider)),
            Err(error) => warn!(%error, "openai provider unavailable"),
        }
        match Gemini::from_env() {
            Ok(provider) => executor = executor.with_generative_provider(Arc::new(provider)),
            Err(error) => warn!(%error, "gemini provider unavailable"),
        }

        let mut blobs = FsBlobStore::new(&config.results_dir);
        if let Some(base_url) = &config.results_base_url {
            blobs = blobs.with_public_base_url(base_url.clone());
        }

        Ok(Self::new(
            TraceResolver::new(Arc::new(store), config.observation_limit),
            executor,
            Arc::new(blobs),
            Arc::new(FileStepStore::new(&config.steps_dir)),
        )
        .with_default_concurrency(config.default_concurrency))
    }

    pub async fn run(&self, event: &RunEvent) -> Result<EvalRunResult, OrchestratorError> {
        let request = &event.request;
        request.validate()?;

        let steps = Steps::new(self.steps.clone(), event.id.clone());
        let concurrency = request.concurrency_or(self.default_concurrency);

        let start: RunStart = steps
            .run(STEP_CREATE_TRACE, async {
                let run_trace_id = event.run_id();
                self.executor.telemetry().create_trace(RunTrace {
                    id: run_trace_id.clone(),
                    name: format!("eval-run: {}", request.run_name),
                    metadata: json!({
                        "model": request.model,
                        "provider": request.provider,
                        "promptName": request.prompt_name,
                        "promptVersion": request.prompt_version,
                        "traceCount": request.traces.len(),
                        "concurrency": concurrency,
                    }),
                    tags: vec!["eval-run".to_string()],
                });
                Ok::<_, OrchestratorError>(RunStart {
                    run_trace_id,
                    started_at: Utc::now(),
                })
            })
            .await?;
        let run_id = start.run_trace_id.clone();

        info!(
            run_id = %run_id,
            event_id = %event.id,
            traces = request.traces.len(),
            concurrency,
            "starting evaluation run"
        );

        let evaluations: Evaluations = steps
            .run(STEP_RUN_EVALUATIONS, async {
                let results = self.evaluate_all(request, &run_id, concurrency).await;
                Ok::<_, OrchestratorError>(Evaluations {
                    results,
                    finished_at: Utc::now(),
                })
            })
            .await?;

        let mut run = EvalRunResult::aggregate(
            run_id.clone(),
            request.run_name.clone(),
            evaluations.results,
            start.started_at,
            evaluations.finished_at,
        );

        let summary = run.summary()?;
        let results_url: Option<String> = steps
            .run(STEP_PERSIST_RESULTS, async {
                let key = blob_key(&request.run_name, &run_id);
                let payload = json!({
                    "run": summary,
                    "request": request,
                    "results": run.results,
                });
                match self.blobs.put(&key, &payload).await {
                    Ok(url) => Ok::<_, OrchestratorError>(Some(url)),
                    Err(error) => {
                        warn!(run_id = %run_id, key = %key, %error, "failed to persist run payload");
                        Ok(None)
                    }
                }
            })
            .await?;
        run.results_url = results_url;

        steps
            .run(STEP_UPDATE_TRACE, async {
                self.executor.telemetry().update_trace(TraceUpdate {
                    id: run_id.clone(),
                    output: json!({
                        "total": run.total,
                        "successCount": run.success_count,
                        "failureCount": run.failure_count,
                        "matchingCount": run.matching_count,
                        "durationMs": run.duration_ms,
                        "resultsUrl": run.results_url,
                    }),
                    metadata: json!({ "usage": run.usage }),
                });
                Ok::<_, OrchestratorError>(())
            })
            .await?;

        if let Err(error) = self.executor.telemetry().flush().await {
            warn!(run_id = %run_id, %error, "telemetry flush failed");
        }

        info!(
            run_id = %run_id,
            total = run.total,
            succeeded = run.success_count,
            failed = run.failure_count,
            matching = run.matching_count,
            duration_ms = run.duration_ms,
            "evaluation run finished"
        );
        Ok(run)
    }

    async fn evaluate_all(
        &self,
        request: &EvalRunRequest,
        run_id: &str,
        concurrency: usize,
    ) -> Vec<TraceEvalResult> {
        let mut known: HashMap<&str, ResolveHint> = HashMap::new();
        for trace in &request.traces {
            if let Some(hint) = trace.hint() {
                known.entry(trace.trace_id()).or_insert(hint);
            }
        }

        let mut results = Vec::with_capacity(request.traces.len());
        for (index, batch) in request.traces.chunks(concurrency).enumerate() {
            debug!(run_id, batch = index, size = batch.len(), "running batch");
            let outcomes = join_all(batch.iter().map(|trace| {
                let hint = known.get(trace.trace_id()).cloned().unwrap_or_default();
                self.evaluate(trace, hint, request, run_id)
            }))
            .await;
            results.extend(outcomes);
        }
        results
    }

    async fn evaluate(
        &self,
        trace: &TraceRef,
        hint: ResolveHint,
        request: &EvalRunRequest,
        run_id: &str,
    ) -> TraceEvalResult {
        let trace_id = trace.trace_id();
        let started = Instant::now();

        let inputs = match self
            .resolver
            .resolve(trace_id, request.prompt_name.as_deref(), &hint)
            .await
        {
            Ok(inputs) => inputs,
            Err(error) => {
                warn!(trace_id, %error, "trace resolution failed");
                return TraceEvalResult::failed(trace_id, error.to_string(), elapsed_ms(started));
            }
        };

        let prompt = template::fill(&request.prompt, &inputs.variables);
        let dialect = prompt.dialect();

        let mut config = ExecutionConfig::new(request.provider, request.model.clone())
            .with_source_trace(trace_id)
            .with_run_trace(run_id);
        config.reasoning = request.reasoning.clone();
        config.verbosity = request.verbosity.clone();
        config.prompt_name = request.prompt_name.clone();

        let outcome = self
            .executor
            .run(&prompt, inputs.schema.as_ref(), inputs.tools.as_deref(), &config)
            .await;
        let latency_ms = elapsed_ms(started);

        match outcome {
            Ok(output) => TraceEvalResult::succeeded(trace_id, inputs, dialect, output, latency_ms),
            Err(error) => {
                warn!(trace_id, %error, "replay failed");
                TraceEvalResult::failed_with_inputs(
                    trace_id,
                    inputs,
                    dialect,
                    error.to_string(),
                    latency_ms,
                )
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Lower-case, dash-separated form of `name` usable in a storage key.
pub fn slug(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let trimmed = slug.trim_matches('-');
    if trimmed.is_empty() {
        "run".to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn blob_key(run_name: &str, run_id: &str) -> String {
    format!("eval-runs/{}-{}.json", slug(run_name), run_id)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{json, Value};

    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::providers::scripted::{ScriptedProvider, ScriptedReply};
    use crate::providers::ProviderKind;
    use crate::steps::MemoryStepStore;
    use crate::store::{MemoryTraceStore, Observation, TraceRecord};
    use crate::telemetry::{MemoryTelemetry, TelemetryEvent};

    struct Harness {
        provider: Arc<ScriptedProvider>,
        blobs: Arc<MemoryBlobStore>,
        steps: Arc<MemoryStepStore>,
        telemetry: Arc<MemoryTelemetry>,
        orchestrator: RunOrchestrator,
    }

    fn traced(id: &str, name: &str) -> TraceRecord {
        TraceRecord::new(id).with_metadata(json!({ "variables": { "name": name } }))
    }

    fn harness(store: MemoryTraceStore, provider: ScriptedProvider, blobs: MemoryBlobStore) -> Harness {
        let provider = Arc::new(provider);
        let blobs = Arc::new(blobs);
        let steps = Arc::new(MemoryStepStore::new());
        let telemetry = Arc::new(MemoryTelemetry::new());
        let executor = EvalExecutor::new(telemetry.clone()).with_chat_provider(provider.clone());
        let orchestrator = RunOrchestrator::new(
            TraceResolver::new(Arc::new(store), 50),
            executor,
            blobs.clone(),
            steps.clone(),
        );
        Harness {
            provider,
            blobs,
            steps,
            telemetry,
            orchestrator,
        }
    }

    fn echo() -> ScriptedProvider {
        ScriptedProvider::from_fn(|prompt| Ok(ScriptedReply::text(prompt.trim_start_matches("user: "))))
    }

    fn request(traces: &[&str]) -> EvalRunRequest {
        EvalRunRequest::new(
            "Hello {{name}}!",
            traces.iter().map(|t| TraceRef::from(*t)).collect(),
            ProviderKind::OpenAI,
            "gpt-test",
        )
        .with_run_name("Nightly Check")
    }

    #[tokio::test]
    async fn batches_are_sequential_and_bounded() {
        let ids: Vec<String> = (0..23).map(|i| format!("t{i}")).collect();
        let mut store = MemoryTraceStore::new();
        for id in &ids {
            store = store.with_trace(traced(id, id), vec![]);
        }
        // The last trace of each full batch is slow, so a sliding window
        // would start the next trace before it finishes.
        let provider = echo().with_delay_fn(|prompt| {
            if prompt.ends_with("t9!") || prompt.ends_with("t19!") {
                Duration::from_millis(80)
            } else {
                Duration::from_millis(20)
            }
        });
        let h = harness(store, provider, MemoryBlobStore::new());
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let event = RunEvent::new(request(&refs).with_concurrency(10));

        let run = h.orchestrator.run(&event).await.unwrap();

        assert_eq!(h.provider.call_count(), 23);
        assert_eq!(h.provider.peak_concurrency(), 10);
        assert_eq!(run.total, 23);
        assert_eq!(run.success_count, 23);
        let order: Vec<&str> = run.results.iter().map(|r| r.trace_id.as_str()).collect();
        assert_eq!(order, refs);

        let mut spans = h.provider.spans();
        spans.sort_by_key(|span| span.started);
        let mut groups: Vec<Vec<String>> = Vec::new();
        let mut latest_finish = None;
        for span in spans {
            let finished = span.finished.unwrap();
            if groups.is_empty() || latest_finish.is_some_and(|latest| span.started > latest) {
                groups.push(Vec::new());
            }
            latest_finish = latest_finish.max(Some(finished));
            let id = span.prompt.trim_start_matches("user: Hello ").trim_end_matches('!');
            groups.last_mut().unwrap().push(id.to_string());
        }

        let sizes: Vec<usize> = groups.iter().map(Vec::len).collect();
        assert_eq!(sizes, [10, 10, 3]);
        for (index, group) in groups.iter().enumerate() {
            let mut members = group.clone();
            members.sort();
            let mut expected: Vec<String> = ids.iter().skip(index * 10).take(10).cloned().collect();
            expected.sort();
            assert_eq!(members, expected, "batch {index}");
        }
    }

    #[tokio::test]
    async fn unresolvable_trace_fails_alone() {
        let store = MemoryTraceStore::new()
            .with_trace(traced("a", "Ada"), vec![])
            .with_trace(TraceRecord::new("empty"), vec![Observation::new("o1")])
            .with_trace(traced("b", "Bob"), vec![]);
        let h = harness(store, echo(), MemoryBlobStore::new());

        let run = h
            .orchestrator
            .run(&RunEvent::new(request(&["a", "empty", "b", "missing"])))
            .await
            .unwrap();

        assert_eq!(run.total, 4);
        assert_eq!(run.success_count, 2);
        assert_eq!(run.failure_count, 2);
        assert_eq!(run.results[0].output.as_deref(), Some("Hello Ada!"));

        let empty = &run.results[1];
        assert!(!empty.success);
        assert!(empty.error.as_deref().unwrap().contains("no variables found"));
        assert!(run.results[3].error.as_deref().unwrap().contains("could not be fetched"));
    }

    #[tokio::test]
    async fn provider_failure_keeps_resolved_inputs() {
        let store = MemoryTraceStore::new().with_trace(traced("a", "Ada"), vec![]);
        let provider = ScriptedProvider::from_fn(|_| Err("rate limited".to_string()));
        let h = harness(store, provider, MemoryBlobStore::new());

        let run = h.orchestrator.run(&RunEvent::new(request(&["a"]))).await.unwrap();
        let result = &run.results[0];

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("provider error: rate limited"));
        assert_eq!(result.variables["name"], json!("Ada"));
    }

    #[tokio::test]
    async fn payload_is_persisted_and_telemetry_flushed() {
        let store = MemoryTraceStore::new().with_trace(
            traced("a", "Ada"),
            vec![Observation::new("o1").with_output(json!("Hello Ada!"))],
        );
        let h = harness(store, echo(), MemoryBlobStore::new());
        let event = RunEvent::with_id("evt-1", request(&["a"]));

        let run = h.orchestrator.run(&event).await.unwrap();

        let key = "eval-runs/nightly-check-evt-1.json";
        assert_eq!(run.results_url.as_deref(), Some("memory://eval-runs/nightly-check-evt-1.json"));
        assert_eq!(run.matching_count, 1);

        let payload: Value = h.blobs.get(key).unwrap();
        assert!(payload["run"].get("results").is_none());
        assert_eq!(payload["run"]["runName"], json!("Nightly Check"));
        assert_eq!(payload["request"]["model"], json!("gpt-test"));
        assert_eq!(payload["results"][0]["traceId"], json!("a"));

        assert_eq!(h.telemetry.pending(), 0);
        let events = h.telemetry.flushed();
        assert!(matches!(events.first(), Some(TelemetryEvent::TraceCreated(t)) if t.id == "evt-1"));
        assert!(matches!(events.last(), Some(TelemetryEvent::TraceUpdated(u)) if u.id == "evt-1"));
        assert_eq!(h.telemetry.generations().len(), 1);
    }

    #[tokio::test]
    async fn persistence_failure_does_not_fail_the_run() {
        let store = MemoryTraceStore::new().with_trace(traced("a", "Ada"), vec![]);
        let h = harness(store, echo(), MemoryBlobStore::failing());

        let run = h.orchestrator.run(&RunEvent::new(request(&["a"]))).await.unwrap();
        assert!(run.results_url.is_none());
        assert_eq!(run.success_count, 1);
    }

    #[tokio::test]
    async fn redelivered_event_replays_completed_steps() {
        let store = MemoryTraceStore::new().with_trace(traced("a", "Ada"), vec![]);
        let h = harness(store, echo(), MemoryBlobStore::new());
        let event = RunEvent::with_id("evt-7", request(&["a"]).with_run_trace_id("run-7"));

        let first = h.orchestrator.run(&event).await.unwrap();
        let second = h.orchestrator.run(&event).await.unwrap();

        assert_eq!(h.provider.call_count(), 1);
        assert_eq!(first, second);
        assert_eq!(first.run_id, "run-7");
        assert_eq!(
            h.steps.completed("evt-7"),
            vec![
                STEP_CREATE_TRACE.to_string(),
                STEP_PERSIST_RESULTS.to_string(),
                STEP_RUN_EVALUATIONS.to_string(),
                STEP_UPDATE_TRACE.to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn zero_concurrency_is_rejected_before_any_step() {
        let h = harness(MemoryTraceStore::new(), echo(), MemoryBlobStore::new());
        let event = RunEvent::with_id("evt-0", request(&["a"]).with_concurrency(0));

        let error = h.orchestrator.run(&event).await.unwrap_err();
        assert!(matches!(
            error,
            OrchestratorError::InvalidRequest(RequestError::InvalidConcurrency)
        ));
        assert!(h.steps.completed("evt-0").is_empty());
        assert_eq!(h.provider.call_count(), 0);
    }

    #[test]
    fn keys_use_slugged_run_names() {
        assert_eq!(slug("Nightly  Check / v2"), "nightly-check-v2");
        assert_eq!(slug("***"), "run");
        assert_eq!(blob_key("My Run", "abc"), "eval-runs/my-run-abc.json");
    }
}
