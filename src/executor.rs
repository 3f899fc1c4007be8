use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::providers::openai::json_schema_response_format;
use crate::providers::{GenerativeProvider, LLMProvider, ProviderKind};
use crate::schema::{self, NeutralSchema};
use crate::telemetry::{GenerationRecord, Telemetry};
use crate::template::FilledPrompt;
use crate::tools::{self, normalize_tool_calls, NeutralTool, NormalizedToolCall};
use crate::types::{CompletionRequest, GenerateRequest, TokenUsage};
use crate::LLMError;

/// Per-call settings.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub provider: ProviderKind,
    pub model: String,
    pub reasoning: Option<String>,
    pub verbosity: Option<String>,
    /// Recorded trace being replayed.
    pub source_trace_id: Option<String>,
    /// Telemetry trace the generation is attached to.
    pub run_trace_id: Option<String>,
    pub prompt_name: Option<String>,
}

impl ExecutionConfig {
    pub fn new(provider: ProviderKind, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            reasoning: None,
            verbosity: None,
            source_trace_id: None,
            run_trace_id: None,
            prompt_name: None,
        }
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    pub fn with_verbosity(mut self, verbosity: impl Into<String>) -> Self {
        self.verbosity = Some(verbosity.into());
        self
    }

    pub fn with_source_trace(mut self, trace_id: impl Into<String>) -> Self {
        self.source_trace_id = Some(trace_id.into());
        self
    }

    pub fn with_run_trace(mut self, trace_id: impl Into<String>) -> Self {
        self.run_trace_id = Some(trace_id.into());
        self
    }

    pub fn with_prompt_name(mut self, name: impl Into<String>) -> Self {
        self.prompt_name = Some(name.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    pub text: String,
    /// Parsed structured output; `None` when there is no schema or the
    /// output failed re-validation.
    pub parsed: Option<Value>,
    pub validation_errors: Vec<String>,
    pub tool_calls: Vec<NormalizedToolCall>,
    pub usage: Option<TokenUsage>,
}

struct RawOutput {
    text: String,
    tool_calls: Vec<crate::functions::ToolCall>,
    usage: Option<TokenUsage>,
}

pub struct EvalExecutor {
    chat: Option<Arc<dyn LLMProvider>>,
    generative: Option<Arc<dyn GenerativeProvider>>,
    telemetry: Arc<dyn Telemetry>,
}

impl EvalExecutor {
    pub fn new(telemetry: Arc<dyn Telemetry>) -> Self {
        Self {
            chat: None,
            generative: None,
            telemetry,
        }
    }

    /// Provider used for `openai` runs.
    pub fn with_chat_provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.chat = Some(provider);
        self
    }

    /// Provider used for `gemini` runs.
    pub fn with_generative_provider(mut self, provider: Arc<dyn GenerativeProvider>) -> Self {
        self.generative = Some(provider);
        self
    }

    pub fn telemetry(&self) -> &Arc<dyn Telemetry> {
        &self.telemetry
    }

    pub async fn run(
        &self,
        prompt: &FilledPrompt,
        schema: Option<&NeutralSchema>,
        tools: Option<&[NeutralTool]>,
        config: &ExecutionConfig,
    ) -> Result<ExecutionOutput, LLMError> {
        let tools = tools.filter(|list| !list.is_empty());
        let started = Utc::now();

        let (input, raw) = match config.provider {
            ProviderKind::OpenAI => {
                let request = self.chat_request(prompt, schema, tools, config);
                let input = json!(request.messages);
                (input, self.call_chat(request).await)
            }
            ProviderKind::Gemini => {
                let request = self.generate_request(prompt, schema, tools, config);
                let input = json!(request.prompt);
                (input, self.call_generative(request).await)
            }
        };

        let output_value = match &raw {
            Ok(raw) => json!(raw.text),
            Err(error) => json!({ "error": error.to_string() }),
        };
        self.telemetry.record_generation(GenerationRecord {
            trace_id: config
                .run_trace_id
                .clone()
                .or_else(|| config.source_trace_id.clone())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            name: config
                .prompt_name
                .clone()
                .unwrap_or_else(|| "replay".to_string()),
            model: config.model.clone(),
            provider: config.provider.to_string(),
            input,
            output: output_value,
            usage: raw.as_ref().ok().and_then(|raw| raw.usage),
            metadata: json!({
                "sourceTraceId": config.source_trace_id,
                "dialect": prompt.dialect().as_str(),
                "hasSchema": schema.is_some(),
                "hasTools": tools.is_some(),
                "reasoning": config.reasoning,
                "verbosity": config.verbosity,
            }),
            start_time: started,
            end_time: Utc::now(),
        });

        let raw = raw?;
        let (parsed, validation_errors) = match schema {
            Some(schema) => check_structured(schema, &raw.text),
            None => (None, Vec::new()),
        };
        if !validation_errors.is_empty() {
            warn!(
                trace_id = config.source_trace_id.as_deref().unwrap_or("-"),
                errors = validation_errors.len(),
                "structured output failed re-validation"
            );
        }

        Ok(ExecutionOutput {
            text: raw.text,
            parsed,
            validation_errors,
            tool_calls: normalize_tool_calls(raw.tool_calls),
            usage: raw.usage,
        })
    }

    fn chat_request(
        &self,
        prompt: &FilledPrompt,
        schema: Option<&NeutralSchema>,
        tools: Option<&[NeutralTool]>,
        config: &ExecutionConfig,
    ) -> CompletionRequest {
        let mut request = CompletionRequest::new(config.model.clone(), prompt.to_messages());
        if let Some(schema) = schema {
            let native = schema::translate(schema, ProviderKind::OpenAI);
            request = request.with_response_format(json_schema_response_format(
                &response_format_name(config.prompt_name.as_deref()),
                native,
            ));
        }
        if let Some(tools) = tools {
            request = request.with_tools(tools::openai_tools(tools));
        }
        if let Some(reasoning) = &config.reasoning {
            request = request.with_reasoning_effort(reasoning.clone());
        }
        if let Some(verbosity) = &config.verbosity {
            request = request.with_verbosity(verbosity.clone());
        }
        request
    }

    fn generate_request(
        &self,
        prompt: &FilledPrompt,
        schema: Option<&NeutralSchema>,
        tools: Option<&[NeutralTool]>,
        config: &ExecutionConfig,
    ) -> GenerateRequest {
        let mut request = GenerateRequest::new(config.model.clone(), prompt.to_prompt_text());
        if let Some(schema) = schema {
            request = request.with_response_schema(schema::translate(schema, ProviderKind::Gemini));
        }
        if let Some(tools) = tools {
            request = request.with_tools(tools::gemini_tools(tools));
        }
        if let Some(budget) = config.reasoning.as_deref().and_then(thinking_budget) {
            request = request.with_thinking_budget(budget);
        }
        if let Some(trace_id) = &config.source_trace_id {
            request = request.with_label("source_trace_id", trace_id.clone());
        }
        request
    }

    async fn call_chat(&self, request: CompletionRequest) -> Result<RawOutput, LLMError> {
        let provider = self.chat.as_ref().ok_or(LLMError::MissingProvider("openai"))?;
        debug!(provider = provider.name(), model = %request.model, "calling chat provider");
        let response = provider.complete(request).await?;
        Ok(RawOutput {
            text: response.message.content.unwrap_or_default(),
            tool_calls: response.message.tool_calls,
            usage: response.usage,
        })
    }

    async fn call_generative(&self, request: GenerateRequest) -> Result<RawOutput, LLMError> {
        let provider = self
            .generative
            .as_ref()
            .ok_or(LLMError::MissingProvider("gemini"))?;
        debug!(provider = provider.name(), model = %request.model, "calling generative provider");
        let response = provider.generate(request).await?;
        Ok(RawOutput {
            text: response.text,
            tool_calls: response.function_calls,
            usage: response.usage_metadata.map(TokenUsage::from),
        })
    }
}

/// The json_schema format name allows `[a-zA-Z0-9_-]` only.
fn response_format_name(prompt_name: Option<&str>) -> String {
    let name: String = prompt_name
        .unwrap_or("replay_output")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .take(64)
        .collect();
    if name.is_empty() {
        "replay_output".to_string()
    } else {
        name
    }
}

/// Maps a reasoning hint to a thinking token budget. Numbers pass through.
fn thinking_budget(reasoning: &str) -> Option<i32> {
    let hint = reasoning.trim().to_ascii_lowercase();
    if let Ok(budget) = hint.parse::<i32>() {
        return Some(budget);
    }
    match hint.as_str() {
        "none" | "minimal" => Some(0),
        "low" => Some(1024),
        "medium" => Some(8192),
        "high" => Some(24576),
        _ => None,
    }
}

/// Strips one surrounding Markdown code fence, if present.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some((_, body)) = rest.split_once('\n') else {
        return trimmed;
    };
    body.trim_end()
        .strip_suffix("```")
        .map(str::trim)
        .unwrap_or(trimmed)
}

fn check_structured(schema: &NeutralSchema, text: &str) -> (Option<Value>, Vec<String>) {
    let value = match serde_json::from_str::<Value>(strip_code_fence(text)) {
        Ok(value) => value,
        Err(error) => return (None, vec![format!("output is not valid JSON: {error}")]),
    };
    match schema::validate(schema, &value) {
        Ok(()) => (Some(value), Vec::new()),
        Err(errors) => (None, errors),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::{FunctionCall, ToolCall};
    use crate::providers::scripted::{ScriptedProvider, ScriptedReply};
    use crate::telemetry::MemoryTelemetry;
    use crate::types::{ChatMessage, MessageRole};
    use crate::template::TemplateDialect;

    fn conversation() -> FilledPrompt {
        FilledPrompt::Messages {
            dialect: TemplateDialect::MarkerBlocks,
            messages: vec![ChatMessage::system("Be brief."), ChatMessage::user("Hi")],
        }
    }

    fn person_schema() -> NeutralSchema {
        NeutralSchema::object([
            ("name", NeutralSchema::string()),
            ("age", NeutralSchema::number().optional()),
        ])
    }

    #[tokio::test]
    async fn chat_path_sends_messages_schema_and_tools() {
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptedReply::text(
            "```json\n{\"name\":\"Ada\"}\n```",
        )
        .with_usage(TokenUsage::new(10, 5))]));
        let telemetry = Arc::new(MemoryTelemetry::new());
        let executor = EvalExecutor::new(telemetry.clone()).with_chat_provider(provider.clone());
        let tools = vec![NeutralTool::new("lookup")];

        let config = ExecutionConfig::new(ProviderKind::OpenAI, "gpt-test")
            .with_reasoning("low")
            .with_source_trace("t-1")
            .with_run_trace("run-1");
        let output = executor
            .run(&conversation(), Some(&person_schema()), Some(&tools), &config)
            .await
            .unwrap();

        assert_eq!(output.parsed, Some(json!({ "name": "Ada" })));
        assert!(output.validation_errors.is_empty());
        assert_eq!(output.usage, Some(TokenUsage::new(10, 5)));

        let call = &provider.calls()[0];
        assert_eq!(call.prompt, "system: Be brief.\nuser: Hi");
        assert_eq!(call.reasoning.as_deref(), Some("low"));
        assert_eq!(call.schema.as_ref().unwrap()["type"], json!("json_schema"));
        assert_eq!(call.tools.as_ref().unwrap()[0]["function"]["name"], json!("lookup"));

        telemetry.flush().await.unwrap();
        let generations = telemetry.generations();
        assert_eq!(generations.len(), 1);
        assert_eq!(generations[0].trace_id, "run-1");
        assert_eq!(generations[0].metadata["dialect"], json!("marker-blocks"));
        assert_eq!(generations[0].metadata["hasTools"], json!(true));
    }

    #[tokio::test]
    async fn generative_path_flattens_with_markers() {
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptedReply::text("hello")]));
        let executor = EvalExecutor::new(Arc::new(MemoryTelemetry::new()))
            .with_generative_provider(provider.clone());

        let config = ExecutionConfig::new(ProviderKind::Gemini, "gemini-test").with_reasoning("high");
        let output = executor.run(&conversation(), None, None, &config).await.unwrap();

        assert_eq!(output.text, "hello");
        assert!(output.parsed.is_none());
        let call = &provider.calls()[0];
        assert_eq!(call.prompt, "[SYSTEM]\nBe brief.\n\n[USER]\nHi");
        assert_eq!(call.reasoning.as_deref(), Some("24576"));
        assert!(call.schema.is_none());
    }

    #[tokio::test]
    async fn failed_validation_keeps_text_and_reports_errors() {
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptedReply::text(
            "{\"age\": 3}",
        )]));
        let executor =
            EvalExecutor::new(Arc::new(MemoryTelemetry::new())).with_generative_provider(provider);
        let config = ExecutionConfig::new(ProviderKind::Gemini, "g");

        let output = executor
            .run(
                &FilledPrompt::Text { text: "x".into() },
                Some(&person_schema()),
                None,
                &config,
            )
            .await
            .unwrap();

        assert_eq!(output.text, "{\"age\": 3}");
        assert!(output.parsed.is_none());
        assert!(!output.validation_errors.is_empty());
    }

    #[tokio::test]
    async fn tool_calls_are_normalized() {
        let reply = ScriptedReply::text("")
            .with_tool_call(ToolCall::new(FunctionCall::new("lookup", json!("{\"q\":\"x\"}"))));
        let provider = Arc::new(ScriptedProvider::new(vec![reply]));
        let executor =
            EvalExecutor::new(Arc::new(MemoryTelemetry::new())).with_chat_provider(provider);

        let output = executor
            .run(
                &FilledPrompt::Text { text: "x".into() },
                None,
                None,
                &ExecutionConfig::new(ProviderKind::OpenAI, "m"),
            )
            .await
            .unwrap();

        assert_eq!(output.tool_calls.len(), 1);
        assert!(output.tool_calls[0].id.starts_with("call_"));
        assert_eq!(output.tool_calls[0].arguments, json!({ "q": "x" }));
    }

    #[tokio::test]
    async fn unconfigured_provider_is_reported_and_recorded() {
        let telemetry = Arc::new(MemoryTelemetry::new());
        let executor = EvalExecutor::new(telemetry.clone());

        let error = executor
            .run(
                &FilledPrompt::Text { text: "x".into() },
                None,
                None,
                &ExecutionConfig::new(ProviderKind::Gemini, "m"),
            )
            .await
            .unwrap_err();
        assert!(matches!(error, LLMError::MissingProvider("gemini")));

        telemetry.flush().await.unwrap();
        assert!(telemetry.generations()[0].output.get("error").is_some());
    }

    #[test]
    fn plain_text_becomes_single_user_message() {
        let messages = FilledPrompt::Text { text: "x".into() }.to_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, MessageRole::User);
    }

    #[test]
    fn fence_stripping() {
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```\n[1]\n```\n"), "[1]");
        assert_eq!(strip_code_fence("  {\"a\":1} "), "{\"a\":1}");
        assert_eq!(strip_code_fence("```oops"), "```oops");
    }

    #[test]
    fn format_names_are_sanitized() {
        assert_eq!(response_format_name(Some("triage/router v2")), "triage_router_v2");
        assert_eq!(response_format_name(None), "replay_output");
    }
}
