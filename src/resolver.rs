use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::schema::NeutralSchema;
use crate::store::{Observation, StoreError, TraceRecord, TraceSnapshot, TraceStore};
use crate::tools::{decode_tools, NeutralTool};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("trace {trace_id} could not be fetched: {source}")]
    TraceUnavailable {
        trace_id: String,
        #[source]
        source: StoreError,
    },

    #[error(
        "no variables found for trace {trace_id} in trace metadata, trace input, or observation metadata"
    )]
    NoVariables { trace_id: String },
}

/// Where the replay variables were found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableSource {
    /// `trace.metadata.variables`
    TraceMetadata,
    /// The whole trace metadata object, taken as the variable bag. This is a
    /// heuristic and can pick up metadata that was never meant as variables.
    TraceMetadataBag,
    /// `trace.input.variables`
    TraceInput,
    /// `observation.metadata.variables` on the first observation carrying it.
    ObservationMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayInputs {
    pub variables: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<NeutralSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<NeutralTool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation_id: Option<String>,
    pub source: VariableSource,
}

/// Facts the caller already knows about a trace.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolveHint {
    pub observation_id: Option<String>,
    pub original_output: Option<String>,
}

pub struct TraceResolver {
    store: Arc<dyn TraceStore>,
    observation_limit: usize,
}

impl TraceResolver {
    pub fn new(store: Arc<dyn TraceStore>, observation_limit: usize) -> Self {
        Self {
            store,
            observation_limit: observation_limit.max(1),
        }
    }

    pub async fn snapshot(&self, trace_id: &str) -> Result<TraceSnapshot, ResolveError> {
        let trace = self
            .store
            .trace(trace_id)
            .await
            .map_err(|source| ResolveError::TraceUnavailable {
                trace_id: trace_id.to_string(),
                source,
            })?;

        let observations = match self.store.generations(trace_id, self.observation_limit).await {
            Ok(observations) => observations,
            Err(error) => {
                warn!(trace_id, %error, "observation fetch failed; continuing without observations");
                Vec::new()
            }
        };

        Ok(TraceSnapshot { trace, observations })
    }

    pub async fn resolve(
        &self,
        trace_id: &str,
        prompt_name: Option<&str>,
        hint: &ResolveHint,
    ) -> Result<ReplayInputs, ResolveError> {
        let snapshot = self.snapshot(trace_id).await?;
        let inputs = resolve_snapshot(trace_id, &snapshot, prompt_name, hint)?;

        info!(
            trace_id,
            source = ?inputs.source,
            observation_id = inputs.observation_id.as_deref().unwrap_or("-"),
            variables = inputs.variables.len(),
            has_schema = inputs.schema.is_some(),
            has_tools = inputs.tools.is_some(),
            "resolved replay inputs"
        );
        Ok(inputs)
    }
}

pub fn resolve_snapshot(
    trace_id: &str,
    snapshot: &TraceSnapshot,
    prompt_name: Option<&str>,
    hint: &ResolveHint,
) -> Result<ReplayInputs, ResolveError> {
    let observations = &snapshot.observations;

    let hinted = hint
        .observation_id
        .as_deref()
        .and_then(|id| observations.iter().find(|o| o.id == id));
    let matched = hinted.or_else(|| match_observation(observations, prompt_name));

    let (variables, source, carrier) = find_variables(&snapshot.trace, observations, hinted).ok_or_else(
        || ResolveError::NoVariables {
            trace_id: trace_id.to_string(),
        },
    )?;

    let original_output = match &hint.original_output {
        Some(cached) => Some(cached.clone()),
        None => carrier.or(matched).and_then(|o| output_text(&o.output)),
    };

    Ok(ReplayInputs {
        variables,
        schema: matched.and_then(observation_schema),
        tools: matched.and_then(observation_tools),
        original_output,
        observation_id: matched.map(|o| o.id.clone()),
        source,
    })
}

fn normalize(name: &str) -> String {
    name.to_lowercase().replace('-', "")
}

fn metadata_str<'a>(metadata: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| metadata.get(*key).and_then(Value::as_str))
        .filter(|value| !value.is_empty())
}

/// Picks the observation that corresponds to `prompt_name`. The rules are
/// tried in order across all observations, and the first rule with a hit
/// decides. Without a name or a hit, the first observation is used.
pub fn match_observation<'a>(
    observations: &'a [Observation],
    prompt_name: Option<&str>,
) -> Option<&'a Observation> {
    let Some(name) = prompt_name.map(str::trim).filter(|n| !n.is_empty()) else {
        return observations.first();
    };
    let wanted = normalize(name);

    let exact = |o: &&Observation| o.name.as_deref() == Some(name);
    let by_name = |o: &&Observation| {
        o.name
            .as_deref()
            .map(normalize)
            .is_some_and(|n| !wanted.is_empty() && n.contains(&wanted))
    };
    let by_function = |o: &&Observation| {
        metadata_str(&o.metadata, &["functionName", "function_name"])
            .map(normalize)
            .is_some_and(|f| !f.is_empty() && (f.contains(&wanted) || wanted.contains(&f)))
    };
    let by_prompt = |o: &&Observation| {
        metadata_str(&o.metadata, &["promptName", "prompt_name"])
            .is_some_and(|p| p == name || p.contains(name))
    };

    let found = observations
        .iter()
        .find(exact)
        .or_else(|| observations.iter().find(by_name))
        .or_else(|| observations.iter().find(by_function))
        .or_else(|| observations.iter().find(by_prompt));

    if found.is_none() {
        debug!(prompt_name = name, "no observation matched; using the first one");
    }
    found.or_else(|| observations.first())
}

fn non_empty_object(value: Option<&Value>) -> Option<&Map<String, Value>> {
    value.and_then(Value::as_object).filter(|map| !map.is_empty())
}

fn find_variables<'a>(
    trace: &TraceRecord,
    observations: &'a [Observation],
    hinted: Option<&'a Observation>,
) -> Option<(Map<String, Value>, VariableSource, Option<&'a Observation>)> {
    if let Some(variables) = non_empty_object(trace.metadata.get("variables")) {
        return Some((variables.clone(), VariableSource::TraceMetadata, None));
    }

    if let Some(bag) = trace.metadata.as_object() {
        let flat = !bag.is_empty()
            && !bag.contains_key("variables")
            && bag.values().all(|v| v.is_string() || v.is_object());
        if flat {
            return Some((bag.clone(), VariableSource::TraceMetadataBag, None));
        }
    }

    if let Some(variables) = non_empty_object(trace.input.get("variables")) {
        return Some((variables.clone(), VariableSource::TraceInput, None));
    }

    // A known observation is checked before the fetch-order scan.
    hinted.into_iter().chain(observations).find_map(|observation| {
        non_empty_object(observation.metadata.get("variables")).map(|variables| {
            (
                variables.clone(),
                VariableSource::ObservationMetadata,
                Some(observation),
            )
        })
    })
}

/// Original output in comparable text form.
pub fn output_text(output: &Value) -> Option<String> {
    match output {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

fn observation_schema(observation: &Observation) -> Option<NeutralSchema> {
    let node = observation.metadata.get("schema").filter(|v| !v.is_null())?;
    match NeutralSchema::from_value(node) {
        Ok(schema) => Some(schema),
        Err(error) => {
            warn!(observation_id = %observation.id, %error, "ignoring undecodable schema");
            None
        }
    }
}

fn observation_tools(observation: &Observation) -> Option<Vec<NeutralTool>> {
    let node = observation.metadata.get("tools").filter(|v| !v.is_null())?;
    let tools = decode_tools(node);
    if tools.is_empty() {
        None
    } else {
        Some(tools)
    }
}
