use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::types::{ChatMessage, MessageRole};

static RE_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\[(SYSTEM|USER|ASSISTANT)\]").unwrap());

static RE_PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{([^{}]+)\}\}|\{([^{}]+)\}").unwrap());

static RE_LEFTOVER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{?[\w-]+\}\}?").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TemplateDialect {
    StructuredArray,
    MarkerBlocks,
    PlainText,
}

impl TemplateDialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateDialect::StructuredArray => "structured-array",
            TemplateDialect::MarkerBlocks => "marker-blocks",
            TemplateDialect::PlainText => "plain-text",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilledPrompt {
    Messages {
        dialect: TemplateDialect,
        messages: Vec<ChatMessage>,
    },
    Text {
        text: String,
    },
}

impl FilledPrompt {
    pub fn dialect(&self) -> TemplateDialect {
        match self {
            FilledPrompt::Messages { dialect, .. } => *dialect,
            FilledPrompt::Text { .. } => TemplateDialect::PlainText,
        }
    }

    /// Message list for chat-style providers. Plain text becomes one user message.
    pub fn to_messages(&self) -> Vec<ChatMessage> {
        match self {
            FilledPrompt::Messages { messages, .. } => messages.clone(),
            FilledPrompt::Text { text } => vec![ChatMessage::user(text.clone())],
        }
    }

    /// Single prompt string for providers without a message list. Roles are
    /// written back as marker lines.
    pub fn to_prompt_text(&self) -> String {
        match self {
            FilledPrompt::Text { text } => text.clone(),
            FilledPrompt::Messages { messages, .. } => messages
                .iter()
                .map(|message| {
                    format!(
                        "{}\n{}",
                        message.role.marker(),
                        message.text().unwrap_or_default()
                    )
                })
                .collect::<Vec<_>>()
                .join("\n\n"),
        }
    }
}

enum ParsedTemplate {
    Structured(Vec<(MessageRole, String)>),
    Markers(Vec<(MessageRole, String)>),
    Plain(String),
}

pub fn detect_dialect(template: &str) -> TemplateDialect {
    match parse(template) {
        ParsedTemplate::Structured(_) => TemplateDialect::StructuredArray,
        ParsedTemplate::Markers(_) => TemplateDialect::MarkerBlocks,
        ParsedTemplate::Plain(_) => TemplateDialect::PlainText,
    }
}

pub fn fill(template: &str, variables: &Map<String, Value>) -> FilledPrompt {
    let table = lookup_table(variables);

    match parse(template) {
        ParsedTemplate::Structured(segments) => FilledPrompt::Messages {
            dialect: TemplateDialect::StructuredArray,
            messages: fill_segments(segments, &table),
        },
        ParsedTemplate::Markers(segments) => FilledPrompt::Messages {
            dialect: TemplateDialect::MarkerBlocks,
            messages: fill_segments(segments, &table),
        },
        ParsedTemplate::Plain(text) => FilledPrompt::Text {
            text: substitute(&text, &table),
        },
    }
}

/// Fills a single piece of text without dialect detection.
pub fn fill_text(text: &str, variables: &Map<String, Value>) -> String {
    substitute(text, &lookup_table(variables))
}

fn parse(template: &str) -> ParsedTemplate {
    if let Some(segments) = parse_structured(template) {
        return ParsedTemplate::Structured(segments);
    }
    if let Some(segments) = parse_markers(template) {
        return ParsedTemplate::Markers(segments);
    }
    ParsedTemplate::Plain(template.to_string())
}

fn parse_structured(template: &str) -> Option<Vec<(MessageRole, String)>> {
    let trimmed = template.trim();
    if !trimmed.starts_with('[') {
        return None;
    }

    let Ok(Value::Array(items)) = serde_json::from_str::<Value>(trimmed) else {
        return None;
    };

    let mut items = items.iter();
    let first = message_entry(items.next()?)?;
    let mut segments = vec![first];

    for (offset, item) in items.enumerate() {
        match message_entry(item) {
            Some(entry) => segments.push(entry),
            None => debug!(index = offset + 1, "skipping template entry without role/content"),
        }
    }

    Some(segments)
}

fn message_entry(value: &Value) -> Option<(MessageRole, String)> {
    let role = MessageRole::parse(value.get("role")?.as_str()?)?;
    let content = value.get("content")?.as_str()?;
    Some((role, content.to_string()))
}

fn parse_markers(template: &str) -> Option<Vec<(MessageRole, String)>> {
    if !RE_MARKER.is_match(template) {
        return None;
    }

    let mut segments = Vec::new();
    // Text ahead of the first marker is treated as system instructions.
    let mut role = MessageRole::System;
    let mut cursor = 0;

    for captures in RE_MARKER.captures_iter(template) {
        let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        push_segment(&mut segments, role, &template[cursor..whole.start()]);
        role = MessageRole::parse(name.as_str()).unwrap_or(MessageRole::User);
        cursor = whole.end();
    }
    push_segment(&mut segments, role, &template[cursor..]);

    Some(segments)
}

fn push_segment(segments: &mut Vec<(MessageRole, String)>, role: MessageRole, text: &str) {
    let text = text.trim();
    if !text.is_empty() {
        segments.push((role, text.to_string()));
    }
}

fn fill_segments(
    segments: Vec<(MessageRole, String)>,
    table: &HashMap<String, String>,
) -> Vec<ChatMessage> {
    segments
        .into_iter()
        .map(|(role, content)| ChatMessage::new(role, substitute(&content, table)))
        .collect()
}

/// Placeholder name → replacement. Each key also answers to its
/// hyphen/underscore-swapped spelling; the first key in insertion order wins
/// when two spellings collide.
fn lookup_table(variables: &Map<String, Value>) -> HashMap<String, String> {
    let mut table = HashMap::with_capacity(variables.len() * 2);
    for (key, value) in variables {
        let replacement = value_text(value);
        table
            .entry(key.clone())
            .or_insert_with(|| replacement.clone());
        let swapped = swap_separators(key);
        if swapped != *key {
            table.entry(swapped).or_insert(replacement);
        }
    }
    table
}

fn swap_separators(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            '-' => '_',
            '_' => '-',
            other => other,
        })
        .collect()
}

fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn substitute(text: &str, table: &HashMap<String, String>) -> String {
    let replaced = RE_PLACEHOLDER.replace_all(text, |captures: &Captures<'_>| {
        let name = captures
            .get(1)
            .or_else(|| captures.get(2))
            .map(|m| m.as_str())
            .unwrap_or_default();
        match table.get(name) {
            Some(value) => value.clone(),
            None => captures[0].to_string(),
        }
    });

    strip_leftovers(replaced.into_owned())
}

fn strip_leftovers(mut text: String) -> String {
    // Removing one placeholder can join braces into a new one, so repeat.
    while RE_LEFTOVER.is_match(&text) {
        text = RE_LEFTOVER.replace_all(&text, "").into_owned();
    }
    text
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn vars(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn fills_plain_text() {
        let filled = fill("Hello {{name}}!", &vars(json!({ "name": "Ada" })));
        assert_eq!(filled.dialect(), TemplateDialect::PlainText);
        assert_eq!(filled, FilledPrompt::Text { text: "Hello Ada!".into() });
    }

    #[test]
    fn fills_structured_array() {
        let template =
            r#"[{"role":"system","content":"Use {{ctx}}"},{"role":"user","content":"{{q}}"}]"#;
        let filled = fill(template, &vars(json!({ "ctx": "docs", "q": "help" })));

        assert_eq!(filled.dialect(), TemplateDialect::StructuredArray);
        let messages = filled.to_messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::System);
        assert_eq!(messages[0].text(), Some("Use docs"));
        assert_eq!(messages[1].role, MessageRole::User);
        assert_eq!(messages[1].text(), Some("help"));
    }

    #[test]
    fn array_without_role_falls_through() {
        let template = r#"[{"text":"hi {name}"}]"#;
        assert_eq!(detect_dialect(template), TemplateDialect::PlainText);

        let filled = fill(template, &vars(json!({ "name": "Bo" })));
        assert_eq!(
            filled,
            FilledPrompt::Text { text: r#"[{"text":"hi Bo"}]"#.into() }
        );
    }

    #[test]
    fn bracketed_marker_is_not_mistaken_for_json() {
        let template = "[USER] what is {topic}?";
        assert_eq!(detect_dialect(template), TemplateDialect::MarkerBlocks);
    }

    #[test]
    fn splits_marker_blocks_case_insensitively() {
        let template = "Preamble\n[system]\nBe brief.\n[USER]\nAsk about {{topic}}\n[Assistant]\n\n";
        let filled = fill(template, &vars(json!({ "topic": "rust" })));

        assert_eq!(filled.dialect(), TemplateDialect::MarkerBlocks);
        let messages = filled.to_messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, MessageRole::System);
        assert_eq!(messages[0].text(), Some("Preamble"));
        assert_eq!(messages[1].text(), Some("Be brief."));
        assert_eq!(messages[2].role, MessageRole::User);
        assert_eq!(messages[2].text(), Some("Ask about rust"));
    }

    #[test]
    fn empty_template_is_empty_plain_text() {
        let filled = fill("", &Map::new());
        assert_eq!(filled, FilledPrompt::Text { text: String::new() });
    }

    #[test]
    fn swapped_separator_spelling_resolves() {
        let filled = fill("{{a_b}}", &vars(json!({ "a-b": "x" })));
        assert_eq!(filled, FilledPrompt::Text { text: "x".into() });

        let filled = fill("{user-name}", &vars(json!({ "user_name": "y" })));
        assert_eq!(filled, FilledPrompt::Text { text: "y".into() });
    }

    #[test]
    fn replacements_are_not_rescanned() {
        let filled = fill(
            "{{first}} and {{second}}",
            &vars(json!({ "first": "{{second}}", "second": "two" })),
        );
        // The inserted placeholder is not substituted, then gets stripped.
        assert_eq!(filled, FilledPrompt::Text { text: " and two".into() });
    }

    #[test]
    fn non_string_values_use_compact_json() {
        let filled = fill(
            "{{n}}|{{flag}}|{{obj}}|{{missing}}|{{none}}",
            &vars(json!({ "n": 3, "flag": true, "obj": { "a": 1 }, "none": null })),
        );
        assert_eq!(filled, FilledPrompt::Text { text: r#"3|true|{"a":1}||"#.into() });
    }

    #[test]
    fn substitution_is_case_sensitive() {
        let filled = fill("{{Name}}", &vars(json!({ "name": "Ada" })));
        assert_eq!(filled, FilledPrompt::Text { text: String::new() });
    }

    #[test]
    fn leaves_no_placeholders_behind() {
        let templates = [
            "{{a{b}}}",
            "{{{x}}}",
            "{{unknown}} {also-unknown} {{half}",
            "[USER] {{q}} {z}",
            r#"[{"role":"user","content":"{{deep_{er}}}"}]"#,
        ];
        let variables = vars(json!({ "q": "{{nested}}" }));

        for template in templates {
            let filled = fill(template, &variables);
            let texts = match &filled {
                FilledPrompt::Text { text } => vec![text.clone()],
                FilledPrompt::Messages { messages, .. } => messages
                    .iter()
                    .map(|m| m.text().unwrap_or_default().to_string())
                    .collect(),
            };
            for text in texts {
                assert!(!RE_LEFTOVER.is_match(&text), "{template:?} left {text:?}");
            }
        }
    }

    #[test]
    fn filling_twice_is_stable() {
        let variables = vars(json!({ "name": "Ada", "task": "sum {x}" }));
        let once = fill_text("Hi {{name}}, please {{task}} {{other}}", &variables);
        let twice = fill_text(&once, &variables);
        assert_eq!(once, twice);
        assert_eq!(once, "Hi Ada, please sum  ");
    }

    #[test]
    fn flattened_prompt_reinserts_markers() {
        let filled = fill(
            r#"[{"role":"system","content":"S"},{"role":"user","content":"U"}]"#,
            &Map::new(),
        );
        assert_eq!(filled.to_prompt_text(), "[SYSTEM]\nS\n\n[USER]\nU");
    }
}
