//! Provider-neutral output schemas.
//!
//! Schemas travel in observation metadata as a small tagged JSON encoding
//! (`{"type": "object", "shape": {...}}`). They decode into [`NeutralSchema`],
//! a closed set of node kinds, and from there translate into each provider's
//! constrained-output format. Translation is lossy in a few documented places
//! (regex constraints, mixed unions, unknown kinds); those degrade to an
//! unconstrained string instead of failing. A separate lossless rendering is
//! used to validate provider output after the fact.

use jsonschema::{Draft, JSONSchema};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::providers::ProviderKind;

#[derive(Debug, Error, PartialEq)]
pub enum SchemaError {
    #[error("schema node must be a JSON object")]
    NotAnObject,
    #[error("schema node is missing its `type` tag")]
    MissingType,
    #[error("`{kind}` schema node is missing `{field}`")]
    MissingField { kind: String, field: &'static str },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct NeutralSchema {
    pub kind: SchemaKind,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchemaKind {
    String { pattern: Option<String> },
    Number { integer: bool },
    Boolean,
    Array(Box<NeutralSchema>),
    Object(Vec<(String, NeutralSchema)>),
    Enum(Vec<String>),
    Optional(Box<NeutralSchema>),
    Nullable(Box<NeutralSchema>),
    Default {
        inner: Box<NeutralSchema>,
        value: Option<Value>,
    },
    Literal(Value),
    Union(Vec<NeutralSchema>),
    /// Refinements and transforms; only the wrapped type matters here.
    Refined(Box<NeutralSchema>),
    Unknown(String),
}

impl NeutralSchema {
    pub fn new(kind: SchemaKind) -> Self {
        Self {
            kind,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn string() -> Self {
        Self::new(SchemaKind::String { pattern: None })
    }

    pub fn number() -> Self {
        Self::new(SchemaKind::Number { integer: false })
    }

    pub fn boolean() -> Self {
        Self::new(SchemaKind::Boolean)
    }

    pub fn array(element: NeutralSchema) -> Self {
        Self::new(SchemaKind::Array(Box::new(element)))
    }

    pub fn object<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, NeutralSchema)>,
        K: Into<String>,
    {
        Self::new(SchemaKind::Object(
            fields.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        ))
    }

    pub fn optional(self) -> Self {
        Self::new(SchemaKind::Optional(Box::new(self)))
    }

    pub fn nullable(self) -> Self {
        Self::new(SchemaKind::Nullable(Box::new(self)))
    }

    pub fn literal(value: Value) -> Self {
        Self::new(SchemaKind::Literal(value))
    }

    pub fn union(options: Vec<NeutralSchema>) -> Self {
        Self::new(SchemaKind::Union(options))
    }

    pub fn from_value(value: &Value) -> Result<Self, SchemaError> {
        let object = value.as_object().ok_or(SchemaError::NotAnObject)?;
        let tag = object
            .get("type")
            .and_then(Value::as_str)
            .ok_or(SchemaError::MissingType)?;

        let child = |field: &'static str| -> Result<Box<NeutralSchema>, SchemaError> {
            let node = object.get(field).ok_or_else(|| SchemaError::MissingField {
                kind: tag.to_string(),
                field,
            })?;
            Ok(Box::new(NeutralSchema::decode_nested(node)))
        };

        let kind = match tag {
            "string" => SchemaKind::String {
                pattern: object
                    .get("regex")
                    .or_else(|| object.get("pattern"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
            },
            "number" => SchemaKind::Number {
                integer: object.get("int").and_then(Value::as_bool).unwrap_or(false),
            },
            "boolean" => SchemaKind::Boolean,
            "array" => SchemaKind::Array(child("element")?),
            "object" => {
                let shape = object
                    .get("shape")
                    .and_then(Value::as_object)
                    .ok_or_else(|| SchemaError::MissingField {
                        kind: tag.to_string(),
                        field: "shape",
                    })?;
                let mut fields = Vec::with_capacity(shape.len());
                for (name, node) in shape {
                    fields.push((name.clone(), NeutralSchema::decode_nested(node)));
                }
                SchemaKind::Object(fields)
            }
            "enum" => {
                let values = object
                    .get("values")
                    .and_then(Value::as_array)
                    .ok_or_else(|| SchemaError::MissingField {
                        kind: tag.to_string(),
                        field: "values",
                    })?;
                SchemaKind::Enum(
                    values
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect(),
                )
            }
            "optional" => SchemaKind::Optional(child("innerType")?),
            "nullable" => SchemaKind::Nullable(child("innerType")?),
            "default" => SchemaKind::Default {
                inner: child("innerType")?,
                value: object.get("defaultValue").cloned(),
            },
            "literal" => SchemaKind::Literal(object.get("value").cloned().unwrap_or(Value::Null)),
            "union" => {
                let options = object
                    .get("options")
                    .and_then(Value::as_array)
                    .ok_or_else(|| SchemaError::MissingField {
                        kind: tag.to_string(),
                        field: "options",
                    })?;
                SchemaKind::Union(options.iter().map(NeutralSchema::decode_nested).collect())
            }
            "refined" | "effects" => SchemaKind::Refined(child("innerType")?),
            other => SchemaKind::Unknown(other.to_string()),
        };

        Ok(Self {
            kind,
            description: object
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    /// Children that fail to decode become `Unknown` so one bad field
    /// does not cost the rest of the schema.
    fn decode_nested(value: &Value) -> Self {
        NeutralSchema::from_value(value).unwrap_or_else(|error| {
            let tag = value
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("untagged");
            warn!(%error, kind = %tag, "undecodable schema node treated as unknown");
            Self {
                kind: SchemaKind::Unknown(tag.to_string()),
                description: value
                    .get("description")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }
        })
    }

    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        let mut put = |key: &str, value: Value| {
            object.insert(key.to_string(), value);
        };

        match &self.kind {
            SchemaKind::String { pattern } => {
                put("type", json!("string"));
                if let Some(pattern) = pattern {
                    put("regex", json!(pattern));
                }
            }
            SchemaKind::Number { integer } => {
                put("type", json!("number"));
                if *integer {
                    put("int", json!(true));
                }
            }
            SchemaKind::Boolean => put("type", json!("boolean")),
            SchemaKind::Array(element) => {
                put("type", json!("array"));
                put("element", element.to_value());
            }
            SchemaKind::Object(fields) => {
                put("type", json!("object"));
                let shape: Map<String, Value> = fields
                    .iter()
                    .map(|(name, node)| (name.clone(), node.to_value()))
                    .collect();
                put("shape", Value::Object(shape));
            }
            SchemaKind::Enum(values) => {
                put("type", json!("enum"));
                put("values", json!(values));
            }
            SchemaKind::Optional(inner) => {
                put("type", json!("optional"));
                put("innerType", inner.to_value());
            }
            SchemaKind::Nullable(inner) => {
                put("type", json!("nullable"));
                put("innerType", inner.to_value());
            }
            SchemaKind::Default { inner, value } => {
                put("type", json!("default"));
                put("innerType", inner.to_value());
                if let Some(value) = value {
                    put("defaultValue", value.clone());
                }
            }
            SchemaKind::Literal(value) => {
                put("type", json!("literal"));
                put("value", value.clone());
            }
            SchemaKind::Union(options) => {
                put("type", json!("union"));
                put(
                    "options",
                    Value::Array(options.iter().map(NeutralSchema::to_value).collect()),
                );
            }
            SchemaKind::Refined(inner) => {
                put("type", json!("refined"));
                put("innerType", inner.to_value());
            }
            SchemaKind::Unknown(tag) => put("type", json!(tag)),
        }

        if let Some(description) = &self.description {
            object.insert("description".to_string(), json!(description));
        }
        Value::Object(object)
    }

    /// True when an enclosing object should not list this field as required.
    pub fn is_optional(&self) -> bool {
        match &self.kind {
            SchemaKind::Optional(_) | SchemaKind::Default { .. } => true,
            SchemaKind::Refined(inner) => inner.is_optional(),
            _ => false,
        }
    }

    fn unwrap_optional(&self) -> &NeutralSchema {
        match &self.kind {
            SchemaKind::Optional(inner) | SchemaKind::Default { inner, .. } => {
                inner.unwrap_optional()
            }
            _ => self,
        }
    }

    fn field_description(&self) -> Option<&str> {
        self.description
            .as_deref()
            .or_else(|| match &self.kind {
                SchemaKind::Optional(inner)
                | SchemaKind::Nullable(inner)
                | SchemaKind::Default { inner, .. }
                | SchemaKind::Refined(inner) => inner.field_description(),
                _ => None,
            })
    }
}

impl TryFrom<Value> for NeutralSchema {
    type Error = SchemaError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        NeutralSchema::from_value(&value)
    }
}

impl From<NeutralSchema> for Value {
    fn from(schema: NeutralSchema) -> Self {
        schema.to_value()
    }
}

/// Native constrained-output schema for `provider`.
pub fn translate(schema: &NeutralSchema, provider: ProviderKind) -> Value {
    match provider {
        ProviderKind::OpenAI => JsonSchemaTarget::Provider.render(schema),
        ProviderKind::Gemini => gemini_schema(schema),
    }
}

/// Lossless JSON Schema used to re-validate output independently of what the
/// provider enforced.
pub fn validation_schema(schema: &NeutralSchema) -> Value {
    JsonSchemaTarget::Validation.render(schema)
}

pub fn validate(schema: &NeutralSchema, instance: &Value) -> Result<(), Vec<String>> {
    let rendered = validation_schema(schema);
    let compiled = JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(&rendered)
        .map_err(|e| vec![format!("invalid validation schema: {e}")])?;

    let result = match compiled.validate(instance) {
        Ok(()) => Ok(()),
        Err(errors) => Err(errors.map(|e| e.to_string()).collect()),
    };
    result
}

fn literal_type(value: &Value) -> &'static str {
    match value {
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::Null => "null",
        _ => "string",
    }
}

fn string_literals(options: &[NeutralSchema]) -> Option<Vec<Value>> {
    if options.is_empty() {
        return None;
    }
    options
        .iter()
        .map(|option| match &option.kind {
            SchemaKind::Literal(value @ Value::String(_)) => Some(value.clone()),
            _ => None,
        })
        .collect()
}

fn gemini_schema(schema: &NeutralSchema) -> Value {
    match &schema.kind {
        SchemaKind::String { pattern } => {
            if pattern.is_some() {
                debug!("regex constraint dropped for gemini schema");
            }
            json!({ "type": "STRING" })
        }
        SchemaKind::Number { integer: true } => json!({ "type": "INTEGER" }),
        SchemaKind::Number { integer: false } => json!({ "type": "NUMBER" }),
        SchemaKind::Boolean => json!({ "type": "BOOLEAN" }),
        SchemaKind::Array(element) => json!({ "type": "ARRAY", "items": gemini_schema(element) }),
        SchemaKind::Object(fields) => {
            let mut properties = Map::new();
            let mut required = Vec::new();
            for (name, field) in fields {
                let mut translated = gemini_schema(field.unwrap_optional());
                if let (Some(description), Some(object)) =
                    (field.field_description(), translated.as_object_mut())
                {
                    object.insert("description".to_string(), json!(description));
                }
                properties.insert(name.clone(), translated);
                if !field.is_optional() {
                    required.push(json!(name));
                }
            }
            let mut object = json!({ "type": "OBJECT", "properties": properties });
            if !required.is_empty() {
                object["required"] = Value::Array(required);
            }
            object
        }
        SchemaKind::Enum(values) => json!({ "type": "STRING", "enum": values }),
        SchemaKind::Optional(inner)
        | SchemaKind::Default { inner, .. }
        | SchemaKind::Refined(inner) => gemini_schema(inner),
        SchemaKind::Nullable(inner) => {
            let mut translated = gemini_schema(inner);
            if let Some(object) = translated.as_object_mut() {
                object.insert("nullable".to_string(), json!(true));
            }
            translated
        }
        SchemaKind::Literal(value) => json!({
            "type": literal_type(value).to_ascii_uppercase(),
            "enum": [value],
        }),
        SchemaKind::Union(options) => match string_literals(options) {
            Some(values) => json!({ "type": "STRING", "enum": values }),
            None => match options.first() {
                Some(first) => {
                    debug!(members = options.len(), "mixed union narrowed to first member");
                    gemini_schema(first)
                }
                None => {
                    warn!("empty union translated as unconstrained string");
                    json!({ "type": "STRING" })
                }
            },
        },
        SchemaKind::Unknown(tag) => {
            warn!(kind = %tag, "unsupported schema kind translated as string");
            json!({ "type": "STRING" })
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum JsonSchemaTarget {
    /// What a provider accepts for constrained decoding.
    Provider,
    /// Everything the neutral schema says, for post-hoc validation.
    Validation,
}

impl JsonSchemaTarget {
    fn render(self, schema: &NeutralSchema) -> Value {
        let lossless = self == JsonSchemaTarget::Validation;

        match &schema.kind {
            SchemaKind::String { pattern } => match pattern {
                Some(pattern) if lossless => json!({ "type": "string", "pattern": pattern }),
                Some(_) => {
                    debug!("regex constraint dropped for provider schema");
                    json!({ "type": "string" })
                }
                None => json!({ "type": "string" }),
            },
            SchemaKind::Number { integer: true } => json!({ "type": "integer" }),
            SchemaKind::Number { integer: false } => json!({ "type": "number" }),
            SchemaKind::Boolean => json!({ "type": "boolean" }),
            SchemaKind::Array(element) => json!({ "type": "array", "items": self.render(element) }),
            SchemaKind::Object(fields) => {
                let mut properties = Map::new();
                let mut required = Vec::new();
                for (name, field) in fields {
                    let mut translated = self.render(field.unwrap_optional());
                    if let (Some(description), Some(object)) =
                        (field.field_description(), translated.as_object_mut())
                    {
                        object.insert("description".to_string(), json!(description));
                    }
                    properties.insert(name.clone(), translated);
                    if !field.is_optional() {
                        required.push(json!(name));
                    }
                }
                let mut object = json!({
                    "type": "object",
                    "properties": properties,
                    "required": required,
                });
                if !lossless {
                    object["additionalProperties"] = json!(false);
                }
                object
            }
            SchemaKind::Enum(values) => json!({ "type": "string", "enum": values }),
            SchemaKind::Optional(inner)
            | SchemaKind::Default { inner, .. }
            | SchemaKind::Refined(inner) => self.render(inner),
            SchemaKind::Nullable(inner) => {
                let mut translated = self.render(inner);
                match translated.get("type").and_then(Value::as_str).map(str::to_string) {
                    Some(kind) if !lossless || translated.get("enum").is_none() => {
                        translated["type"] = json!([kind, "null"]);
                        if let Some(values) = translated.get_mut("enum").and_then(Value::as_array_mut) {
                            if !values.contains(&Value::Null) {
                                values.push(Value::Null);
                            }
                        }
                        translated
                    }
                    _ => json!({ "anyOf": [translated, { "type": "null" }] }),
                }
            }
            SchemaKind::Literal(value) if lossless => json!({ "const": value }),
            SchemaKind::Literal(value) => json!({ "type": literal_type(value), "enum": [value] }),
            SchemaKind::Union(options) if lossless => json!({
                "anyOf": options.iter().map(|o| self.render(o)).collect::<Vec<_>>(),
            }),
            SchemaKind::Union(options) => match string_literals(options) {
                Some(values) => json!({ "type": "string", "enum": values }),
                None => match options.first() {
                    Some(first) => {
                        debug!(members = options.len(), "mixed union narrowed to first member");
                        self.render(first)
                    }
                    None => {
                        warn!("empty union translated as unconstrained string");
                        json!({ "type": "string" })
                    }
                },
            },
            SchemaKind::Unknown(tag) if lossless => {
                debug!(kind = %tag, "unsupported schema kind accepts any value");
                json!({})
            }
            SchemaKind::Unknown(tag) => {
                warn!(kind = %tag, "unsupported schema kind translated as string");
                json!({ "type": "string" })
            }
        }
    }
}
