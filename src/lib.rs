pub mod blob;
pub mod config;
pub mod error;
pub mod eval;
pub mod executor;
pub mod functions;
pub mod providers;
pub mod resolver;
pub mod schema;
pub mod steps;
pub mod store;
pub mod telemetry;
pub mod template;
pub mod tools;
pub mod types;

pub use error::LLMError;
pub use providers::{GenerativeProvider, LLMProvider, ProviderKind};
pub use types::{
    ChatMessage, CompletionRequest, CompletionResponse, GenerateRequest, GenerateResponse,
    MessageRole, TokenUsage,
};
pub use functions::{FunctionCall, FunctionDefinition, Tool, ToolCall};
pub use template::{fill, FilledPrompt, TemplateDialect};
pub use schema::{NeutralSchema, SchemaKind};
pub use tools::{NeutralTool, NormalizedToolCall};
pub use store::{HttpTraceStore, MemoryTraceStore, Observation, TraceRecord, TraceStore};
pub use resolver::{ReplayInputs, ResolveError, ResolveHint, TraceResolver, VariableSource};
pub use executor::{EvalExecutor, ExecutionConfig, ExecutionOutput};
pub use telemetry::{LangfuseTelemetry, MemoryTelemetry, Telemetry};
pub use blob::{BlobStore, FsBlobStore, MemoryBlobStore};
pub use steps::{FileStepStore, MemoryStepStore, StepStore, Steps};
pub use config::{LangfuseConfig, ReplayConfig};
pub use eval::{
    orchestrator::{OrchestratorError, RunOrchestrator},
    report::{EvalRunResult, TraceEvalResult},
    request::{EvalRunRequest, RunEvent, TraceRef},
};
