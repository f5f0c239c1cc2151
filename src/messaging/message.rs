//! # Task Message Codec
//!
//! Defines the two queue message variants (map, reduce) and the decoding
//! rules for raw payloads. Decoding is deliberately stricter than serde
//! derive alone: required strings must be non-empty, numerics are coerced
//! from strings when a producer stringified them, and `attempt` falls back
//! to 0 when absent, negative, or non-finite. Anything else is an
//! `InvalidMessage`, which the caller drops rather than requeues.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PipelineError, Result};
use crate::storage::blob::Locator;

/// A unit of work pulled from the queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskMessage {
    Map(MapTask),
    Reduce(ReduceTask),
}

/// Summarize one source chunk into one partial result blob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapTask {
    pub source_uri: String,
    pub result_uri: String,
    pub generator: String,
    pub generator_model: String,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Combine all map results for one issue into one final record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReduceTask {
    pub dependency_result_uris: Vec<String>,
    pub prompt: String,
    pub issue_id: String,
    pub meeting: MeetingInfo,
    pub generator: String,
    pub generator_model: String,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms_hint: Option<u64>,
}

/// Meeting metadata carried by the reduce task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeetingInfo {
    pub issue_id: String,
    pub meeting_name: String,
    pub house: String,
    pub date: String,
    #[serde(default)]
    pub speech_count: u32,
}

impl TaskMessage {
    /// Decode and validate a raw queue payload.
    pub fn decode(raw: &Value) -> Result<Self> {
        let obj = raw
            .as_object()
            .ok_or_else(|| PipelineError::invalid_message("payload is not a JSON object"))?;

        let kind = obj
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| PipelineError::invalid_message("missing 'kind' discriminant"))?;

        match kind {
            "map" => Self::decode_map(obj),
            "reduce" => Self::decode_reduce(obj),
            other => Err(PipelineError::invalid_message(format!(
                "unrecognized task kind '{other}'"
            ))),
        }
    }

    /// Decode from raw bytes off the queue.
    pub fn decode_bytes(raw: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(raw)
            .map_err(|e| PipelineError::invalid_message(format!("payload is not JSON: {e}")))?;
        Self::decode(&value)
    }

    /// Serialize for publishing.
    pub fn encode(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(PipelineError::from)
    }

    fn decode_map(obj: &serde_json::Map<String, Value>) -> Result<Self> {
        let source_uri = require_locator(obj, "sourceUri")?;
        let result_uri = require_locator(obj, "resultUri")?;
        Ok(TaskMessage::Map(MapTask {
            source_uri,
            result_uri,
            generator: require_string(obj, "generator")?,
            generator_model: require_string(obj, "generatorModel")?,
            attempt: coerce_attempt(obj.get("attempt")),
            metadata: obj.get("metadata").cloned(),
        }))
    }

    fn decode_reduce(obj: &serde_json::Map<String, Value>) -> Result<Self> {
        let uris = obj
            .get("dependencyResultUris")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                PipelineError::invalid_message("'dependencyResultUris' must be an array")
            })?;
        if uris.is_empty() {
            return Err(PipelineError::invalid_message(
                "'dependencyResultUris' must not be empty",
            ));
        }
        let mut dependency_result_uris = Vec::with_capacity(uris.len());
        for uri in uris {
            let uri = uri.as_str().filter(|s| !s.is_empty()).ok_or_else(|| {
                PipelineError::invalid_message("dependency locator must be a non-empty string")
            })?;
            Locator::parse(uri)?;
            dependency_result_uris.push(uri.to_string());
        }

        let meeting_obj = obj
            .get("meeting")
            .and_then(Value::as_object)
            .ok_or_else(|| PipelineError::invalid_message("'meeting' must be an object"))?;
        let meeting = MeetingInfo {
            issue_id: require_string(meeting_obj, "issueId")?,
            meeting_name: require_string(meeting_obj, "meetingName")?,
            house: require_string(meeting_obj, "house")?,
            date: require_string(meeting_obj, "date")?,
            speech_count: coerce_non_negative(meeting_obj.get("speechCount")) as u32,
        };

        Ok(TaskMessage::Reduce(ReduceTask {
            dependency_result_uris,
            prompt: require_string(obj, "prompt")?,
            issue_id: require_string(obj, "issueId")?,
            meeting,
            generator: require_string(obj, "generator")?,
            generator_model: require_string(obj, "generatorModel")?,
            attempt: coerce_attempt(obj.get("attempt")),
            retry_delay_ms_hint: obj
                .get("retryDelayMsHint")
                .map(|v| coerce_non_negative(Some(v))),
        }))
    }

    /// Wire name of the task kind, for log records.
    pub fn kind_str(&self) -> &'static str {
        match self {
            TaskMessage::Map(_) => "map",
            TaskMessage::Reduce(_) => "reduce",
        }
    }

    /// Current delivery attempt.
    pub fn attempt(&self) -> u32 {
        match self {
            TaskMessage::Map(task) => task.attempt,
            TaskMessage::Reduce(task) => task.attempt,
        }
    }

    /// Identifier used in log records: the output locator for map tasks, the
    /// issue id for reduce tasks.
    pub fn task_id(&self) -> &str {
        match self {
            TaskMessage::Map(task) => &task.result_uri,
            TaskMessage::Reduce(task) => &task.issue_id,
        }
    }

    /// Copy of this message with the attempt counter incremented, ready for
    /// republishing.
    pub fn next_attempt(&self) -> Self {
        let mut copy = self.clone();
        match &mut copy {
            TaskMessage::Map(task) => task.attempt += 1,
            TaskMessage::Reduce(task) => task.attempt += 1,
        }
        copy
    }

    /// The message's own requeue delay hint, if any.
    pub fn retry_delay_hint_secs(&self) -> Option<u64> {
        match self {
            TaskMessage::Map(_) => None,
            TaskMessage::Reduce(task) => task.retry_delay_ms_hint.map(|ms| ms.div_ceil(1000)),
        }
    }
}

fn require_string(obj: &serde_json::Map<String, Value>, key: &str) -> Result<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            PipelineError::invalid_message(format!("'{key}' must be a non-empty string"))
        })
}

fn require_locator(obj: &serde_json::Map<String, Value>, key: &str) -> Result<String> {
    let value = require_string(obj, key)?;
    Locator::parse(&value)
        .map_err(|_| PipelineError::invalid_message(format!("'{key}' is not a valid locator")))?;
    Ok(value)
}

/// Attempt counter coercion: numbers and numeric strings are accepted;
/// absent, negative, or non-finite values default to 0.
fn coerce_attempt(value: Option<&Value>) -> u32 {
    coerce_non_negative(value).min(u32::MAX as u64) as u32
}

fn coerce_non_negative(value: Option<&Value>) -> u64 {
    let parsed = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(n) if n.is_finite() && n >= 0.0 => n as u64,
        _ => 0,
    }
}
