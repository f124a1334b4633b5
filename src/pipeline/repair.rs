//! Parse-or-repair gate for model output.
//!
//! A raw completion is decoded by a stage-specific decoder. If decoding fails
//! (not JSON, or JSON of the wrong shape) exactly one repair request is sent
//! that asks the model to coerce its own output into the stage schema. A
//! second failure is reported to the stage, which substitutes its fallback.

use serde_json::{Map, Value};
use thiserror::Error;

use super::llm::{CompletionRequest, LlmClient};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContractError {
    #[error("Model output is not valid JSON: {0}")]
    Parse(String),

    #[error("Model output does not match the expected schema: {0}")]
    Schema(String),
}

/// Result of running a completion through the gate.
#[derive(Debug, Clone, PartialEq)]
pub enum GateResult<T> {
    Clean(T),
    Repaired(T),
    Failed(String),
}

/// How to ask for a repair: the prompt is built from the broken text.
pub struct RepairPlan<'a, F>
where
    F: FnOnce(&str) -> String,
{
    pub system: Option<&'a str>,
    pub max_tokens: u32,
    pub prompt: F,
}

/// Extract a JSON block from LLM response text.
/// Handles responses that include text before/after the JSON.
pub fn extract_json_block(response: &str) -> Option<&str> {
    let trimmed = response.trim();

    // Strip markdown code fences if present
    if let Some(start) = trimmed.find("```json") {
        let after_fence = &trimmed[start + 7..];
        if let Some(end) = after_fence.find("```") {
            return Some(after_fence[..end].trim());
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after_fence = &trimmed[start + 3..];
        if let Some(end) = after_fence.find("```") {
            let block = after_fence[..end].trim();
            if block.starts_with('{') || block.starts_with('[') {
                return Some(block);
            }
        }
    }

    // Find the first { and last }
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            return Some(&trimmed[start..=end]);
        }
    }

    None
}

/// Locate and parse the JSON object in a completion.
pub fn parse_json_object(response: &str) -> Result<Map<String, Value>, ContractError> {
    let block = extract_json_block(response)
        .ok_or_else(|| ContractError::Parse("no JSON block found".into()))?;
    let value: Value =
        serde_json::from_str(block).map_err(|e| ContractError::Parse(e.to_string()))?;
    match value {
        Value::Object(map) => Ok(map),
        other => Err(ContractError::Schema(format!(
            "expected a JSON object, found {}",
            json_kind(&other)
        ))),
    }
}

/// Fetch a key that must hold an array.
pub fn require_array<'a>(
    object: &'a Map<String, Value>,
    key: &str,
) -> Result<&'a Vec<Value>, ContractError> {
    match object.get(key) {
        Some(Value::Array(items)) => Ok(items),
        Some(other) => Err(ContractError::Schema(format!(
            "`{key}` must be an array, found {}",
            json_kind(other)
        ))),
        None => Err(ContractError::Schema(format!("missing `{key}`"))),
    }
}

/// Collect the string members of an array, trimmed, skipping everything else.
pub fn string_items(items: &[Value]) -> Vec<String> {
    items
        .iter()
        .filter_map(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Decode `raw`; on failure, send one repair request and decode that.
pub fn repair_response<T, F>(
    llm: &dyn LlmClient,
    stage: &'static str,
    raw: &str,
    plan: RepairPlan<'_, F>,
    decode: impl Fn(&str) -> Result<T, ContractError>,
) -> GateResult<T>
where
    F: FnOnce(&str) -> String,
{
    let first_error = match decode(raw) {
        Ok(value) => return GateResult::Clean(value),
        Err(e) => e,
    };

    tracing::warn!(stage, error = %first_error, "Model output rejected, requesting repair");

    let prompt = (plan.prompt)(raw);
    let mut request = CompletionRequest::new(&prompt, plan.max_tokens);
    if let Some(system) = plan.system {
        request = request.with_system(system);
    }

    let repaired = match llm.complete(&request) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(stage, error = %e, "Repair request failed");
            return GateResult::Failed(format!("{first_error}; repair request failed: {e}"));
        }
    };

    match decode(&repaired) {
        Ok(value) => {
            tracing::info!(stage, "Model output repaired");
            GateResult::Repaired(value)
        }
        Err(e) => {
            tracing::warn!(stage, error = %e, "Repaired output still rejected");
            GateResult::Failed(format!("{first_error}; repair rejected: {e}"))
        }
    }
}

/// Call the model, then run the completion through `repair_response`.
/// A failed first call has nothing to repair and fails immediately.
pub fn complete_with_repair<T, F>(
    llm: &dyn LlmClient,
    stage: &'static str,
    request: &CompletionRequest<'_>,
    plan: RepairPlan<'_, F>,
    decode: impl Fn(&str) -> Result<T, ContractError>,
) -> GateResult<T>
where
    F: FnOnce(&str) -> String,
{
    match llm.complete(request) {
        Ok(raw) => repair_response(llm, stage, &raw, plan, decode),
        Err(e) => {
            tracing::warn!(stage, error = %e, "Model call failed");
            GateResult::Failed(format!("model call failed: {e}"))
        }
    }
}
