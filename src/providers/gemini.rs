use std::{collections::BTreeMap, env, time::Duration};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    error::LLMError,
    functions::{decode_arguments, FunctionCall, ToolCall},
    providers::GenerativeProvider,
    types::{GenerateRequest, GenerateResponse, UsageMetadata},
};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const VERTEX_HOST: &str = "aiplatform.googleapis.com";

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub base_url: String,
    pub request_timeout: Duration,
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(120),
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
}

#[derive(Debug, Clone)]
pub struct Gemini {
    client: Client,
    config: GeminiConfig,
}

impl Gemini {
    pub fn new(api_key: impl Into<String>) -> Result<Self, LLMError> {
        Self::from_config(GeminiConfig::new(api_key))
    }

    pub fn from_env() -> Result<Self, LLMError> {
        let api_key = env::var("GEMINI_API_KEY")
            .or_else(|_| env::var("GOOGLE_API_KEY"))
            .map_err(|_| LLMError::MissingApiKey("GEMINI_API_KEY"))?;
        let mut config = GeminiConfig::new(api_key);

        if let Ok(base_url) = env::var("GEMINI_BASE_URL") {
            config.base_url = base_url;
        }
        if let Ok(timeout_ms) = env::var("GEMINI_REQUEST_TIMEOUT_MS") {
            if let Ok(ms) = timeout_ms.parse::<u64>() {
                config.request_timeout = Duration::from_millis(ms);
            }
        }

        Self::from_config(config)
    }

    pub fn from_config(config: GeminiConfig) -> Result<Self, LLMError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self { client, config })
    }

    fn endpoint(&self, model: &str) -> String {
        let model = model.trim_start_matches("models/");
        format!(
            "{}/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            model
        )
    }

    /// Request labels are a Vertex AI field; the public Gemini API rejects them.
    fn accepts_labels(&self) -> bool {
        self.config.base_url.contains(VERTEX_HOST)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentBody {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<RawFunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    thought: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawFunctionCall {
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_schema: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_config: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorEnvelope {
    error: GeminiError,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    message: String,
}

fn build_body(request: GenerateRequest, with_labels: bool) -> (String, GenerateContentBody) {
    let GenerateRequest {
        model,
        prompt,
        response_schema,
        tools,
        thinking_budget,
        labels,
    } = request;

    let generation_config = if response_schema.is_some() || thinking_budget.is_some() {
        Some(GenerationConfig {
            response_mime_type: response_schema.as_ref().map(|_| "application/json"),
            response_schema,
            thinking_config: thinking_budget
                .map(|budget| serde_json::json!({ "thinkingBudget": budget })),
        })
    } else {
        None
    };

    let body = GenerateContentBody {
        contents: vec![Content {
            role: Some("user".to_string()),
            parts: vec![Part {
                text: Some(prompt),
                ..Part::default()
            }],
        }],
        tools,
        generation_config,
        labels: if with_labels { labels } else { BTreeMap::new() },
    };

    (model, body)
}

fn into_response(parsed: GenerateContentResponse) -> Result<GenerateResponse, LLMError> {
    let candidate = parsed
        .candidates
        .into_iter()
        .next()
        .ok_or(LLMError::InvalidResponse("response did not contain any candidates"))?;

    let mut text = String::new();
    let mut function_calls = Vec::new();

    for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
        if part.thought == Some(true) {
            continue;
        }
        if let Some(chunk) = part.text {
            text.push_str(&chunk);
        }
        if let Some(call) = part.function_call {
            let args = match call.args {
                Value::Null => Value::Object(Map::new()),
                other => other,
            };
            let (arguments, raw_arguments) = decode_arguments(args);
            let mut function = FunctionCall::new(call.name, arguments);
            function.raw_arguments = raw_arguments;
            let mut tool_call = ToolCall::new(function);
            tool_call.id = call.id.filter(|id| !id.is_empty());
            function_calls.push(tool_call);
        }
    }

    Ok(GenerateResponse {
        text,
        usage_metadata: parsed.usage_metadata,
        function_calls,
    })
}

#[async_trait]
impl GenerativeProvider for Gemini {
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, LLMError> {
        let (model, body) = build_body(request, self.accepts_labels());

        let response = self
            .client
            .post(self.endpoint(&model))
            .header("x-goog-api-key", &self.config.api_key)
            .json(&body)
            .send()
            .await?;
        let status = response.status();

        if !status.is_success() {
            let text = response.text().await?;
            if let Ok(error) = serde_json::from_str::<GeminiErrorEnvelope>(&text) {
                return Err(LLMError::Provider(error.error.message));
            }

            return Err(LLMError::Provider(format!("unexpected status {status}: {text}")));
        }

        let parsed: GenerateContentResponse = response.json().await?;
        into_response(parsed)
    }

    fn name(&self) -> &'static str {
        "gemini"
    }
}
