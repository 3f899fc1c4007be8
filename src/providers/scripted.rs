use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    functions::ToolCall,
    providers::{GenerativeProvider, LLMProvider},
    types::{
        ChatMessage, CompletionRequest, CompletionResponse, GenerateRequest, GenerateResponse,
        TokenUsage, UsageMetadata,
    },
    LLMError,
};

#[derive(Debug, Clone, Default)]
pub struct ScriptedReply {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<TokenUsage>,
}

impl ScriptedReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_tool_call(mut self, call: ToolCall) -> Self {
        self.tool_calls.push(call);
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// When a call started and finished, on a clock that ticks once per event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSpan {
    pub prompt: String,
    pub started: usize,
    pub finished: Option<usize>,
}

/// What the provider was asked to do on one call.
#[derive(Debug, Clone)]
pub struct ScriptedCall {
    pub model: String,
    pub prompt: String,
    pub schema: Option<Value>,
    pub tools: Option<Value>,
    pub reasoning: Option<String>,
}

type Responder = Box<dyn Fn(&str) -> Result<ScriptedReply, String> + Send + Sync>;
type Delay = Box<dyn Fn(&str) -> Duration + Send + Sync>;

pub struct ScriptedProvider {
    responder: Responder,
    delay: Option<Delay>,
    calls: Mutex<Vec<ScriptedCall>>,
    spans: Mutex<Vec<CallSpan>>,
    clock: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        let queue = Mutex::new(VecDeque::from(replies));
        Self::from_fn(move |_| {
            queue
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| "no more scripted responses".to_string())
        })
    }

    pub fn from_fn<F>(responder: F) -> Self
    where
        F: Fn(&str) -> Result<ScriptedReply, String> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            delay: None,
            calls: Mutex::new(Vec::new()),
            spans: Mutex::new(Vec::new()),
            clock: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        self.with_delay_fn(move |_| delay)
    }

    /// Per-prompt latency.
    pub fn with_delay_fn<F>(mut self, delay: F) -> Self
    where
        F: Fn(&str) -> Duration + Send + Sync + 'static,
    {
        self.delay = Some(Box::new(delay));
        self
    }

    pub fn calls(&self) -> Vec<ScriptedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn spans(&self) -> Vec<CallSpan> {
        self.spans.lock().unwrap().clone()
    }

    /// Highest number of calls that were in progress at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn respond(&self, call: ScriptedCall) -> Result<ScriptedReply, LLMError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);

        let prompt = call.prompt.clone();
        self.calls.lock().unwrap().push(call);
        let span = {
            let mut spans = self.spans.lock().unwrap();
            spans.push(CallSpan {
                prompt: prompt.clone(),
                started: self.clock.fetch_add(1, Ordering::SeqCst),
                finished: None,
            });
            spans.len() - 1
        };

        if let Some(delay) = &self.delay {
            tokio::time::sleep(delay(&prompt)).await;
        }

        let reply = (self.responder)(&prompt).map_err(LLMError::Provider);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.spans.lock().unwrap()[span].finished =
            Some(self.clock.fetch_add(1, Ordering::SeqCst));
        reply
    }
}

fn flatten(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|message| format!("{}: {}", message.role, message.text().unwrap_or_default()))
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(serde_json::to_value(&request.tools)?)
        };
        let call = ScriptedCall {
            model: request.model,
            prompt: flatten(&request.messages),
            schema: request.response_format,
            tools,
            reasoning: request.reasoning_effort,
        };

        let reply = self.respond(call).await?;
        Ok(CompletionResponse {
            message: ChatMessage::assistant(reply.text).with_tool_calls(reply.tool_calls),
            usage: reply.usage,
        })
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

#[async_trait]
impl GenerativeProvider for ScriptedProvider {
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, LLMError> {
        let call = ScriptedCall {
            model: request.model,
            prompt: request.prompt,
            schema: request.response_schema,
            tools: request.tools,
            reasoning: request.thinking_budget.map(|budget| budget.to_string()),
        };

        let reply = self.respond(call).await?;
        Ok(GenerateResponse {
            text: reply.text,
            usage_metadata: reply.usage.map(|usage| UsageMetadata {
                prompt_token_count: usage.prompt_tokens,
                candidates_token_count: usage.completion_tokens,
                total_token_count: usage.total_tokens,
            }),
            function_calls: reply.tool_calls,
        })
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
