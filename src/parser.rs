//! Output parsers: the last stage of a `prompt | model | parser` pipeline.

use crate::{
    error::StageResult,
    stage::{Stage, StageStream},
    types::text_from_value,
};
use futures::{
    future::{self, BoxFuture},
    stream::BoxStream,
    FutureExt, StreamExt,
};
use serde_json::Value;

/// Returns the text of a model response.
///
/// Incremental: every message fragment becomes one string fragment.
#[derive(Debug, Clone, Default)]
pub struct StrOutputParser;

impl Stage for StrOutputParser {
    fn name(&self) -> &str {
        "str_output_parser"
    }

    fn invoke(&self, input: Value) -> BoxFuture<'_, StageResult<Value>> {
        future::ready(text_from_value(&input).map(Value::String)).boxed()
    }

    fn transform<'a>(&'a self, input: BoxStream<'a, Value>) -> StageStream<'a> {
        input
            .map(|fragment| text_from_value(&fragment).map(Value::String))
            .boxed()
    }
}

/// Parses a model response as JSON.
///
/// Waits for the complete response, drops a `<think>...</think>` block, then
/// tries the text as-is, a fenced code block, and finally the span from the
/// first `{` or `[` to its last matching closer.
#[derive(Debug, Clone, Default)]
pub struct JsonOutputParser;

impl Stage for JsonOutputParser {
    fn name(&self) -> &str {
        "json_output_parser"
    }

    fn invoke(&self, input: Value) -> BoxFuture<'_, StageResult<Value>> {
        let result = text_from_value(&input)
            .and_then(|text| Ok(parse_json(&strip_thinking(&text))?));
        future::ready(result).boxed()
    }
}

/// Drop a `<think>...</think>` block (DeepSeek R1 style) from a response.
///
/// The closing tag must follow the opening one; otherwise the text is
/// returned unchanged.
pub fn strip_thinking(text: &str) -> String {
    let think_start = "<think>";
    let think_end = "</think>";

    let Some(start_idx) = text.find(think_start) else {
        return text.to_string();
    };
    let body_start = start_idx + think_start.len();
    let Some(end_idx) = text[body_start..].find(think_end).map(|i| body_start + i) else {
        return text.to_string();
    };

    let mut cleaned = String::with_capacity(text.len());
    cleaned.push_str(&text[..start_idx]);
    cleaned.push_str(&text[end_idx + think_end.len()..]);
    cleaned.trim().to_string()
}

/// Parse model text as JSON, with defensive extraction.
pub fn parse_json(text: &str) -> anyhow::Result<Value> {
    let trimmed = text.trim();

    if let Ok(val) = serde_json::from_str::<Value>(trimmed) {
        return Ok(val);
    }

    if let Some(json_str) = extract_json_block(trimmed) {
        if let Ok(val) = serde_json::from_str::<Value>(&json_str) {
            return Ok(val);
        }
    }

    // First { or [ up to the last matching closer
    if let Some(idx) = trimmed.find(['{', '[']) {
        let candidate = &trimmed[idx..];
        let close = if candidate.starts_with('{') { '}' } else { ']' };
        if let Some(end) = candidate.rfind(close) {
            if let Ok(val) = serde_json::from_str::<Value>(&candidate[..=end]) {
                return Ok(val);
            }
        }
    }

    let preview: String = trimmed.chars().take(200).collect();
    anyhow::bail!("Failed to parse model output as JSON. Raw text: {}", preview)
}

/// Extract the body of the first fenced code block.
fn extract_json_block(text: &str) -> Option<String> {
    let markers = ["```json", "```JSON", "```"];
    for marker in markers {
        if let Some(start) = text.find(marker) {
            let content_start = start + marker.len();
            if let Some(end) = text[content_start..].find("```") {
                return Some(text[content_start..content_start + end].trim().to_string());
            }
        }
    }
    None
}
