use std::sync::Arc;

use replaykit::{
    blob::MemoryBlobStore,
    eval::request::{EvalRunRequest, RunEvent, TraceRef},
    functions::{FunctionCall, ToolCall},
    providers::scripted::{ScriptedProvider, ScriptedReply},
    store::{MemoryTraceStore, Observation, TraceRecord},
    steps::MemoryStepStore,
    telemetry::MemoryTelemetry,
    EvalExecutor, ProviderKind, RunOrchestrator, TemplateDialect, TokenUsage, TraceResolver,
    VariableSource,
};
use serde_json::json;

const TEMPLATE: &str = "[SYSTEM]\nYou triage support tickets for {{product}}.\n[USER]\n{{ticket}}";

fn store() -> MemoryTraceStore {
    let schema = json!({
        "type": "object",
        "shape": {
            "category": { "type": "enum", "values": ["billing", "outage", "other"] },
            "urgent": { "type": "boolean" },
            "note": { "type": "optional", "innerType": { "type": "string" } }
        }
    });
    let tools = json!([
        {
            "name": "lookup_account",
            "description": "Find the customer account",
            "parameters": { "type": "object", "shape": { "email": { "type": "string" } } }
        }
    ]);

    MemoryTraceStore::new()
        .with_trace(
            TraceRecord::new("t-billing").with_metadata(json!({
                "variables": { "product": "Acme Cloud", "ticket": "I was charged twice" }
            })),
            vec![
                Observation::new("o-1").with_name("embed-ticket"),
                Observation::new("o-2")
                    .with_name("triage-ticket")
                    .with_metadata(json!({ "schema": schema, "tools": tools }))
                    .with_output(json!({ "category": "billing", "urgent": false })),
            ],
        )
        .with_trace(
            TraceRecord::new("t-outage").with_input(json!({
                "variables": { "product": "Acme Cloud", "ticket": "Everything is down" }
            })),
            vec![Observation::new("o-3")
                .with_name("triage-ticket")
                .with_metadata(json!({ "schema": schema }))
                .with_output(json!({ "category": "outage", "urgent": true }))],
        )
        .with_trace(
            TraceRecord::new("t-empty").with_metadata(json!({ "env": 3 })),
            vec![Observation::new("o-4").with_name("triage-ticket")],
        )
}

fn provider() -> ScriptedProvider {
    ScriptedProvider::from_fn(|prompt| {
        if prompt.contains("charged twice") {
            Ok(ScriptedReply::text("```json\n{\"urgent\": false, \"category\": \"billing\"}\n```")
                .with_tool_call(ToolCall::new(FunctionCall::new(
                    "lookup_account",
                    json!({ "email": "a@example.com" }),
                )))
                .with_usage(TokenUsage::new(40, 12)))
        } else {
            Ok(ScriptedReply::text("{\"category\": \"other\", \"urgent\": \"yes\"}")
                .with_usage(TokenUsage::new(30, 8)))
        }
    })
}

#[tokio::test]
async fn replays_traces_end_to_end() {
    let provider = Arc::new(provider());
    let telemetry = Arc::new(MemoryTelemetry::new());
    let blobs = Arc::new(MemoryBlobStore::new());
    let executor = EvalExecutor::new(telemetry.clone()).with_generative_provider(provider.clone());
    let orchestrator = RunOrchestrator::new(
        TraceResolver::new(Arc::new(store()), 50),
        executor,
        blobs.clone(),
        Arc::new(MemoryStepStore::new()),
    );

    let request = EvalRunRequest::new(
        TEMPLATE,
        vec![
            TraceRef::from("t-billing"),
            TraceRef::from("t-empty"),
            TraceRef::Detailed {
                trace_id: "t-outage".into(),
                observation_id: None,
                original_output: Some("{\"category\":\"outage\",\"urgent\":true}".into()),
            },
        ],
        ProviderKind::Gemini,
        "gemini-2.5-flash",
    )
    .with_run_name("Triage v3")
    .with_prompt_name("triageTicket")
    .with_reasoning("low")
    .with_concurrency(2);

    let run = orchestrator
        .run(&RunEvent::with_id("evt-e2e", request))
        .await
        .unwrap();

    assert_eq!(run.total, 3);
    assert_eq!(run.success_count, 2);
    assert_eq!(run.failure_count, 1);
    assert_eq!(run.matching_count, 1);
    assert_eq!(run.usage, TokenUsage::new(70, 20));
    assert_eq!(
        run.results_url.as_deref(),
        Some("memory://eval-runs/triage-v3-evt-e2e.json")
    );

    let billing = &run.results[0];
    assert!(billing.success);
    assert_eq!(billing.observation_id.as_deref(), Some("o-2"));
    assert_eq!(billing.source, Some(VariableSource::TraceMetadata));
    assert_eq!(billing.dialect, Some(TemplateDialect::MarkerBlocks));
    assert_eq!(billing.parsed, Some(json!({ "category": "billing", "urgent": false })));
    assert_eq!(billing.output_matches_original, Some(true));
    assert_eq!(billing.tool_calls[0].name, "lookup_account");
    assert!(billing.tool_calls[0].id.starts_with("call_"));

    let empty = &run.results[1];
    assert!(!empty.success);
    assert!(empty
        .error
        .as_deref()
        .unwrap()
        .contains("no variables found for trace t-empty"));

    let outage = &run.results[2];
    assert!(outage.success);
    assert_eq!(outage.source, Some(VariableSource::TraceInput));
    assert!(outage.parsed.is_none());
    assert!(!outage.validation_errors.is_empty());
    assert_eq!(outage.output_matches_original, Some(false));

    let calls = provider.calls();
    assert_eq!(calls.len(), 2);
    let billing_call = calls
        .iter()
        .find(|call| call.prompt.contains("charged twice"))
        .unwrap();
    assert_eq!(
        billing_call.prompt,
        "[SYSTEM]\nYou triage support tickets for Acme Cloud.\n\n[USER]\nI was charged twice"
    );
    assert_eq!(billing_call.reasoning.as_deref(), Some("1024"));
    let schema = billing_call.schema.as_ref().unwrap();
    assert_eq!(schema["type"], json!("OBJECT"));
    assert_eq!(schema["required"], json!(["category", "urgent"]));
    assert_eq!(
        billing_call.tools.as_ref().unwrap()[0]["functionDeclarations"][0]["name"],
        json!("lookup_account")
    );

    assert_eq!(telemetry.pending(), 0);
    assert_eq!(telemetry.generations().len(), 2);

    let payload = blobs.get("eval-runs/triage-v3-evt-e2e.json").unwrap();
    assert_eq!(payload["run"]["failureCount"], json!(1));
    assert_eq!(payload["results"].as_array().unwrap().len(), 3);
}
