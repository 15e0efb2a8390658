//! Shared message primitives.
//!
//! A conversation turn is a sequence of [`Message`]s, each an ordered list
//! of [`Part`]s: plain text, media references, native tool calls, and tool
//! results. These types are the lingua franca between the pipeline, the
//! provider contract, and the state store — everything here is plain data
//! that serializes to a stable JSON shape.
//!
//! # Example
//!
//! ```rust
//! use colloquy::message::{Message, Part, Role};
//!
//! let msg = Message::user("What is the weather in Berlin?");
//! assert_eq!(msg.role, Role::User);
//! assert_eq!(msg.text(), "What is the weather in Berlin?");
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Role of a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System authored message that primes or constrains assistant behaviour.
    System,
    /// End-user input.
    User,
    /// Model output (text and/or tool calls).
    Assistant,
    /// Tool-result message correlating with a prior assistant tool call.
    Tool,
}

/// A native tool call requested by the model.
///
/// Arguments are transported as a JSON **string**; the tool registry
/// re-parses them against the descriptor's input schema before dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallPart {
    /// Provider-assigned call id, e.g. `"call_abc123"`.
    pub id: String,
    /// Name of the tool to invoke.
    pub name: String,
    /// Raw JSON argument payload.
    pub arguments: String,
}

/// The outcome of a tool call, fed back to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultPart {
    /// Id of the [`ToolCallPart`] this result answers.
    pub tool_call_id: String,
    /// Result payload, or an error description when `is_error` is set.
    pub content: serde_json::Value,
    /// True when the tool failed; the model is given the chance to recover.
    #[serde(default)]
    pub is_error: bool,
}

/// Handle to media bytes that were externalized to a storage service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaHandle {
    /// Storage scheme, e.g. `"mem"` or `"s3"`.
    pub scheme: String,
    /// Opaque locator within the scheme.
    pub uri: String,
    /// MIME type of the stored bytes.
    pub mime: String,
    /// Byte size of the stored payload.
    pub size: u64,
    /// Hex SHA-256 of the payload.
    pub checksum: String,
}

/// Where the bytes of a media part live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MediaSource {
    /// Bytes carried inline in the message.
    Inline { data: Vec<u8> },
    /// Remote URL the provider can fetch.
    Url { url: String },
    /// Local file path.
    File { path: PathBuf },
    /// Externalized bytes owned by a media storage service.
    Handle { handle: MediaHandle },
}

/// A media reference part (image, audio, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaPart {
    /// MIME type, e.g. `"image/png"` or `"audio/pcm"`.
    pub mime: String,
    /// Location of the bytes.
    pub source: MediaSource,
}

/// One element of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    /// Plain text.
    Text { text: String },
    /// Media reference.
    Media(MediaPart),
    /// Native tool call requested by the assistant.
    ToolCall(ToolCallPart),
    /// Result of a tool call.
    ToolResult(ToolResultPart),
}

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Author role.
    pub role: Role,
    /// Ordered parts.
    pub parts: Vec<Part>,
    /// Turn index within the conversation. Assigned by the state store on
    /// append; `None` for messages not yet persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_index: Option<u64>,
    /// Creation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Provider-reported or estimated token count for this message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_count: Option<u32>,
    /// When this message was compressed into a summary, the index of that
    /// summary in the conversation's summary log.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summarized_into: Option<u64>,
}

impl Message {
    /// Build a message with a single text part.
    pub fn plain(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![Part::Text { text: text.into() }],
            turn_index: None,
            timestamp: Some(Utc::now()),
            token_count: None,
            summarized_into: None,
        }
    }

    /// Build a system message.
    pub fn system(text: impl Into<String>) -> Self {
        Self::plain(Role::System, text)
    }

    /// Build a user message.
    pub fn user(text: impl Into<String>) -> Self {
        Self::plain(Role::User, text)
    }

    /// Build an assistant message.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, text)
    }

    /// Build a tool-role message carrying a single result part.
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        content: serde_json::Value,
        is_error: bool,
    ) -> Self {
        Self {
            role: Role::Tool,
            parts: vec![Part::ToolResult(ToolResultPart {
                tool_call_id: tool_call_id.into(),
                content,
                is_error,
            })],
            turn_index: None,
            timestamp: Some(Utc::now()),
            token_count: None,
            summarized_into: None,
        }
    }

    /// Build a message from explicit parts.
    pub fn from_parts(role: Role, parts: Vec<Part>) -> Self {
        Self {
            role,
            parts,
            turn_index: None,
            timestamp: Some(Utc::now()),
            token_count: None,
            summarized_into: None,
        }
    }

    /// Concatenated text of all text parts.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let Part::Text { text } = part {
                out.push_str(text);
            }
        }
        out
    }

    /// All tool-call parts, in order.
    pub fn tool_calls(&self) -> Vec<&ToolCallPart> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::ToolCall(tc) => Some(tc),
                _ => None,
            })
            .collect()
    }

    /// All tool-result parts, in order.
    pub fn tool_results(&self) -> Vec<&ToolResultPart> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::ToolResult(tr) => Some(tr),
                _ => None,
            })
            .collect()
    }

    /// True when any part is a media reference.
    pub fn has_media(&self) -> bool {
        self.parts.iter().any(|p| matches!(p, Part::Media(_)))
    }

    /// Token count: provider-reported when present, else the chars/4
    /// estimate used throughout the runtime for budget accounting.
    pub fn tokens(&self) -> u32 {
        if let Some(count) = self.token_count {
            return count;
        }
        estimate_tokens(&self.text())
    }
}

/// Estimate the number of tokens in a string, one token per 4 characters.
///
/// Rough but serviceable for budget bookkeeping when the provider does not
/// report usage.
pub fn estimate_tokens(text: &str) -> u32 {
    ((text.len() / 4).max(1)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_accessor_concatenates_parts() {
        let msg = Message::from_parts(
            Role::Assistant,
            vec![
                Part::Text {
                    text: "Hello ".into(),
                },
                Part::ToolCall(ToolCallPart {
                    id: "t1".into(),
                    name: "lookup".into(),
                    arguments: "{}".into(),
                }),
                Part::Text {
                    text: "world".into(),
                },
            ],
        );
        assert_eq!(msg.text(), "Hello world");
        assert_eq!(msg.tool_calls().len(), 1);
    }

    #[test]
    fn serde_round_trip() {
        let msg = Message::from_parts(
            Role::Tool,
            vec![Part::ToolResult(ToolResultPart {
                tool_call_id: "t1".into(),
                content: serde_json::json!({"sum": 5}),
                is_error: false,
            })],
        );
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn token_estimate_floors_at_one() {
        assert_eq!(estimate_tokens(""), 1);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
    }
}
