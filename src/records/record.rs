//! # Record Model
//!
//! The final persisted entity plus the two partial shapes feeding it: the
//! chunk results emitted by map tasks and the partial record parsed from
//! the reduce-stage generation response. Merging is a pure function over
//! typed partials; unknown generator fields pass through untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

use crate::error::{PipelineError, Result};
use crate::messaging::message::MeetingInfo;
use crate::records::dates;

/// Closed enumeration of meeting kinds. Unrecognized generator output
/// degrades to `Other` rather than failing the reduce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Plenary,
    Committee,
    Budget,
    Audit,
    #[default]
    Other,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Plenary => "plenary",
            RecordKind::Committee => "committee",
            RecordKind::Budget => "budget",
            RecordKind::Audit => "audit",
            RecordKind::Other => "other",
        }
    }
}

impl<'de> Deserialize<'de> for RecordKind {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.as_str() {
            "plenary" => RecordKind::Plenary,
            "committee" => RecordKind::Committee,
            "budget" => RecordKind::Budget,
            "audit" => RecordKind::Audit,
            _ => RecordKind::Other,
        })
    }
}

/// Final summarized meeting record, written once per reduce task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: String,
    pub title: String,
    /// Canonical UTC timestamp; lexicographic order equals chronological
    pub date: String,
    /// Always recomputed to match `date`
    pub month: String,
    pub kind: RecordKind,
    pub session: u32,
    pub house: String,
    pub meeting_name: String,
    pub categories: Vec<String>,
    pub description: String,
    pub summary: String,
    pub soft_summary: String,
    pub middle_summary: Vec<String>,
    pub dialogs: Vec<Value>,
    pub participants: Vec<String>,
    pub keywords: Vec<String>,
    pub terms: Vec<Value>,
}

/// Partial result blob written by one map task. Every field may be absent;
/// unknown fields pass through `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_points: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participants: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dialogs: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terms: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keywords: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChunkResult {
    /// Parse a chunk result blob. Map outputs are raw generator text, so
    /// anything unparseable degrades to an empty partial.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        parse_loose_json(bytes)
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default()
    }

    /// Participant entries flattened to display names. Entries may be plain
    /// strings or objects carrying a `name` field.
    pub fn participant_names(&self) -> Vec<String> {
        self.participants
            .iter()
            .flatten()
            .filter_map(|entry| match entry {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Object(obj) => obj
                    .get("name")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
                _ => None,
            })
            .collect()
    }
}

/// Record-shaped partial parsed from the reduce-stage generation response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<RecordKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub categories: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soft_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub middle_summary: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dialogs: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participants: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keywords: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terms: Option<Vec<Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PartialRecord {
    /// Parse the generator's response defensively: anything that is not a
    /// JSON object yields an empty partial rather than an error.
    pub fn from_generated(text: &str) -> Self {
        parse_loose_json(text.as_bytes())
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default()
    }

    /// Union-fill the array fields from chunk results. The base (generator)
    /// values come first and win on overlap; chunk extras are appended and
    /// the whole list deduplicated by full-value equality.
    pub fn merge_chunks(mut self, chunks: &[ChunkResult]) -> Self {
        let mut dialogs = self.dialogs.take().unwrap_or_default();
        let mut terms = self.terms.take().unwrap_or_default();
        let mut keywords = self.keywords.take().unwrap_or_default();
        let mut participants: Vec<String> = flatten_participant_values(
            self.participants.take().unwrap_or_default(),
        );

        for chunk in chunks {
            dialogs.extend(chunk.dialogs.iter().flatten().cloned());
            terms.extend(chunk.terms.iter().flatten().cloned());
            keywords.extend(chunk.keywords.iter().flatten().cloned());
            participants.extend(chunk.participant_names());
        }

        self.dialogs = Some(dedup_by_key(dialogs, |v| v.to_string()));
        self.terms = Some(dedup_by_key(terms, |v| v.to_string()));
        self.keywords = Some(dedup_by_key(keywords, |k| k.clone()));
        self.participants = Some(
            dedup_by_key(participants, |p| p.clone())
                .into_iter()
                .map(Value::String)
                .collect(),
        );
        self
    }

    /// Assemble the final record. Identity and meeting facts come from the
    /// task message; the generator output supplies the summarized content.
    pub fn into_record(self, issue_id: &str, meeting: &MeetingInfo) -> Result<Record> {
        if issue_id.is_empty() {
            return Err(PipelineError::invalid_record("record id is empty"));
        }
        let date = dates::normalize_timestamp_str(&meeting.date)?;
        let month = dates::month_bucket(&date)?;

        Ok(Record {
            id: issue_id.to_string(),
            title: self.title.unwrap_or_default(),
            date,
            month,
            kind: self.kind.unwrap_or_default(),
            session: self.session.unwrap_or(0),
            house: meeting.house.clone(),
            meeting_name: meeting.meeting_name.clone(),
            categories: self.categories.unwrap_or_default(),
            description: self.description.unwrap_or_default(),
            summary: self.summary.unwrap_or_default(),
            soft_summary: self.soft_summary.unwrap_or_default(),
            middle_summary: self.middle_summary.unwrap_or_default(),
            dialogs: self.dialogs.unwrap_or_default(),
            participants: flatten_participant_values(self.participants.unwrap_or_default()),
            keywords: self.keywords.unwrap_or_default(),
            terms: self.terms.unwrap_or_default(),
        })
    }
}

fn flatten_participant_values(values: Vec<Value>) -> Vec<String> {
    values
        .into_iter()
        .filter_map(|entry| match entry {
            Value::String(s) if !s.is_empty() => Some(s),
            Value::Object(obj) => obj
                .get("name")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            _ => None,
        })
        .collect()
}

/// Deduplicate preserving first occurrence, keyed by a caller-supplied
/// function.
pub fn dedup_by_key<T, K, F>(items: Vec<T>, key: F) -> Vec<T>
where
    K: std::hash::Hash + Eq,
    F: Fn(&T) -> K,
{
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(key(item)))
        .collect()
}

/// Parse bytes as a JSON object, tolerating generator chatter around the
/// object (code fences, leading prose) by slicing from the first `{` to the
/// last `}`.
fn parse_loose_json(bytes: &[u8]) -> Option<Value> {
    if let Ok(value) = serde_json::from_slice::<Value>(bytes) {
        if value.is_object() {
            return Some(value);
        }
    }
    let text = std::str::from_utf8(bytes).ok()?;
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&text[start..=end])
        .ok()
        .filter(Value::is_object)
}
