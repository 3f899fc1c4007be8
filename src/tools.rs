use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::warn;
use uuid::Uuid;

use crate::functions::{decode_arguments, FunctionDefinition, Tool, ToolCall};
use crate::providers::ProviderKind;
use crate::schema::{self, NeutralSchema};

/// Provider-neutral function-calling tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeutralTool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<NeutralSchema>,
}

impl NeutralTool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            parameters: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_parameters(mut self, parameters: NeutralSchema) -> Self {
        self.parameters = Some(parameters);
        self
    }
}

/// Decodes the encoded tool list stored in observation metadata. Entries
/// without a name are dropped; an undecodable parameter schema is dropped
/// while the tool itself is kept.
pub fn decode_tools(value: &Value) -> Vec<NeutralTool> {
    let Some(entries) = value.as_array() else {
        warn!("tool metadata is not a list");
        return Vec::new();
    };

    let mut tools = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        let Some(name) = entry.get("name").and_then(Value::as_str).filter(|n| !n.is_empty()) else {
            warn!(index, "skipping tool without a name");
            continue;
        };

        let mut tool = NeutralTool::new(name);
        tool.description = entry
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string);
        tool.parameters = match entry.get("parameters") {
            None | Some(Value::Null) => None,
            Some(node) => match NeutralSchema::from_value(node) {
                Ok(schema) => Some(schema),
                Err(error) => {
                    warn!(tool = name, %error, "dropping undecodable tool parameters");
                    None
                }
            },
        };
        tools.push(tool);
    }
    tools
}

#[derive(Debug, Clone, PartialEq)]
pub enum NativeTools {
    OpenAI(Vec<Tool>),
    Gemini(Value),
}

pub fn translate(tools: &[NeutralTool], provider: ProviderKind) -> NativeTools {
    match provider {
        ProviderKind::OpenAI => NativeTools::OpenAI(openai_tools(tools)),
        ProviderKind::Gemini => NativeTools::Gemini(gemini_tools(tools)),
    }
}

pub fn openai_tools(tools: &[NeutralTool]) -> Vec<Tool> {
    tools
        .iter()
        .map(|tool| {
            let mut definition = FunctionDefinition::new(tool.name.clone());
            definition.description = tool.description.clone();
            definition.parameters = tool
                .parameters
                .as_ref()
                .map(|p| schema::translate(p, ProviderKind::OpenAI));
            definition.to_tool()
        })
        .collect()
}

pub fn gemini_tools(tools: &[NeutralTool]) -> Value {
    let declarations: Vec<Value> = tools
        .iter()
        .map(|tool| {
            let mut declaration = Map::new();
            declaration.insert("name".to_string(), json!(tool.name));
            if let Some(description) = &tool.description {
                declaration.insert("description".to_string(), json!(description));
            }
            if let Some(parameters) = &tool.parameters {
                declaration.insert(
                    "parameters".to_string(),
                    schema::translate(parameters, ProviderKind::Gemini),
                );
            }
            Value::Object(declaration)
        })
        .collect();

    json!([{ "functionDeclarations": declarations }])
}

/// A tool invocation in the shape stored with results, whichever provider made it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

pub fn normalize_tool_calls(calls: Vec<ToolCall>) -> Vec<NormalizedToolCall> {
    calls
        .into_iter()
        .map(|call| {
            let arguments = match call.function.arguments {
                text @ Value::String(_) => decode_arguments(text).0,
                other => other,
            };
            NormalizedToolCall {
                id: call
                    .id
                    .unwrap_or_else(|| format!("call_{}", Uuid::new_v4().simple())),
                name: call.function.name,
                arguments,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::FunctionCall;

    fn encoded() -> Value {
        json!([
            {
                "name": "search",
                "description": "Search the docs",
                "parameters": {
                    "type": "object",
                    "shape": {
                        "query": { "type": "string" },
                        "limit": { "type": "optional", "innerType": { "type": "number", "int": true } }
                    }
                }
            },
            { "description": "nameless" },
            { "name": "ping" }
        ])
    }

    #[test]
    fn decode_skips_nameless_entries() {
        let tools = decode_tools(&encoded());
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["search", "ping"]);
        assert!(tools[1].description.is_none());
        assert!(tools[1].parameters.is_none());
    }

    #[test]
    fn openai_shape_omits_absent_fields() {
        let tools = openai_tools(&decode_tools(&encoded()));
        let value = serde_json::to_value(&tools).unwrap();

        assert_eq!(value[0]["type"], json!("function"));
        assert_eq!(value[0]["function"]["name"], json!("search"));
        assert_eq!(value[0]["function"]["parameters"]["required"], json!(["query"]));
        assert_eq!(value[1], json!({ "type": "function", "function": { "name": "ping" } }));
    }

    #[test]
    fn gemini_shape_groups_declarations() {
        let value = gemini_tools(&decode_tools(&encoded()));
        let declarations = &value[0]["functionDeclarations"];

        assert_eq!(declarations[0]["parameters"]["type"], json!("OBJECT"));
        assert_eq!(
            declarations[0]["parameters"]["properties"]["limit"],
            json!({ "type": "INTEGER" })
        );
        assert_eq!(declarations[1], json!({ "name": "ping" }));
    }

    #[test]
    fn normalization_generates_missing_ids_and_parses_arguments() {
        let calls = vec![
            ToolCall::new(FunctionCall::new("a", json!("{\"x\":1}"))).with_id("given"),
            ToolCall::new(FunctionCall::new("b", json!({ "y": 2 }))),
        ];
        let normalized = normalize_tool_calls(calls);

        assert_eq!(normalized[0].id, "given");
        assert_eq!(normalized[0].arguments, json!({ "x": 1 }));
        assert!(normalized[1].id.starts_with("call_"));
        assert_eq!(normalized[1].arguments, json!({ "y": 2 }));
    }
}
