use serde::{Deserialize, Deserializer};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Entry type enum
// ---------------------------------------------------------------------------

/// The `type` field in a JSONL transcript line.
///
/// Only the variants the completion detector cares about are modelled.
/// Any other type string deserializes to `Other` via `#[serde(other)]`,
/// so new Claude Code entry types never break parsing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryType {
    User,
    Assistant,
    Summary,
    System,
    #[default]
    #[serde(other)]
    Other,
}

// ---------------------------------------------------------------------------
// Message / content blocks
// ---------------------------------------------------------------------------

/// The `message` object embedded inside a transcript line.
///
/// `content` stays a raw `Value`: it is a plain string for some entries and
/// an array of typed blocks for others.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    pub role: Option<String>,
    pub content: Value,
}

/// Tool names whose `file_path` input counts as a changed file.
const WRITE_TOOLS: &[&str] = &["Write", "Edit"];

impl Message {
    /// `true` when the message was authored by the assistant.
    pub fn is_assistant(&self) -> bool {
        self.role.as_deref() == Some("assistant")
    }

    /// Iterate the `file_path` inputs of write-class `tool_use` blocks.
    ///
    /// Blocks that are not objects, are not `tool_use`, name another tool,
    /// or lack a non-empty string `file_path` are skipped.
    pub fn written_paths(&self) -> impl Iterator<Item = &str> {
        self.content
            .as_array()
            .into_iter()
            .flatten()
            .filter(|block| block.get("type").and_then(Value::as_str) == Some("tool_use"))
            .filter(|block| {
                block
                    .get("name")
                    .and_then(Value::as_str)
                    .is_some_and(|name| WRITE_TOOLS.contains(&name))
            })
            .filter_map(|block| block.get("input")?.get("file_path")?.as_str())
            .filter(|path| !path.is_empty())
    }
}

// ---------------------------------------------------------------------------
// LogEntry struct
// ---------------------------------------------------------------------------

/// A single parsed transcript line.
///
/// `#[serde(default)]` at the struct level lets any field be missing;
/// unknown fields are ignored.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LogEntry {
    #[serde(rename = "type")]
    pub entry_type: EntryType,

    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,

    /// ISO 8601 / RFC 3339 timestamp.
    pub timestamp: Option<String>,

    /// Working directory of the session when the line was written.
    pub cwd: Option<String>,

    /// `None` when absent or not an object.
    #[serde(deserialize_with = "lenient_message")]
    pub message: Option<Message>,
}

/// Accept any JSON for `message`. Non-objects become `None` and a
/// non-string `role` is dropped, so the rest of the line still parses.
fn lenient_message<'de, D>(deserializer: D) -> Result<Option<Message>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    let Value::Object(mut fields) = value else {
        return Ok(None);
    };
    Ok(Some(Message {
        role: fields
            .get("role")
            .and_then(Value::as_str)
            .map(str::to_owned),
        content: fields.remove("content").unwrap_or(Value::Null),
    }))
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a single JSONL line into a `LogEntry`.
///
/// Takes bytes so callers never need to validate UTF-8 up front; invalid
/// UTF-8 surfaces as a JSON error like any other malformed line.
pub fn parse_jsonl_line(line: &[u8]) -> Result<LogEntry, serde_json::Error> {
    serde_json::from_slice(line)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
