//! Provider-agnostic model contract.
//!
//! A [`Provider`] translates runtime requests into a concrete vendor wire
//! format and returns responses in a uniform shape. The contract covers
//! four capabilities — one-shot generation, streaming deltas, duplex audio
//! sessions, and embeddings — and implementations advertise the subset
//! they support via [`Provider::capabilities`]. The runtime never sees a
//! vendor wire encoding; it sees only these types.
//!
//! # Basic request/response
//!
//! ```rust,no_run
//! use colloquy::message::Message;
//! use colloquy::provider::{GenerateParams, Provider};
//! use colloquy::providers::mock::ScriptedProvider;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let provider = ScriptedProvider::new("mock-1").reply_text("pong");
//! let result = provider
//!     .generate(&[Message::user("ping")], &[], &GenerateParams::default())
//!     .await?;
//! assert_eq!(result.message.text(), "pong");
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use futures_util::stream::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio::sync::mpsc;

use crate::colloquy::error::BoxError;
use crate::colloquy::message::{Message, ToolCallPart, ToolResultPart};

/// How many tokens were spent on prompt vs. completion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt/input tokens billed by the provider.
    pub input_tokens: u64,
    /// Generated/output tokens billed by the provider.
    pub output_tokens: u64,
    /// Convenience total equal to `input_tokens + output_tokens`.
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Accumulate another usage record into this one.
    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Why the provider stopped generating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural end of the response.
    Stop,
    /// The model requested one or more tool calls.
    ToolCalls,
    /// The max-token limit was hit.
    Length,
    /// The response was cut off by an interruption (duplex barge-in).
    Interrupted,
    /// Provider-specific reason not covered above.
    Other(String),
}

/// Per-call generation parameters, merged from pack prompt parameters and
/// per-conversation overrides.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerateParams {
    /// Model override; `None` uses the provider's configured model.
    pub model: Option<String>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Output token cap.
    pub max_tokens: Option<u32>,
    /// Nucleus sampling parameter.
    pub top_p: Option<f32>,
}

/// Provider-visible tool schema.
///
/// Derived from a registered tool descriptor; serialized by concrete
/// providers into their native `tools` array shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name as it appears to the model.
    pub name: String,
    /// Description surfaced to the model to aid tool selection.
    pub description: String,
    /// JSON Schema object describing the accepted arguments.
    pub parameters_schema: serde_json::Value,
}

/// Result of a one-shot [`Provider::generate`] call.
#[derive(Debug, Clone)]
pub struct GenerateResult {
    /// The assistant message, possibly containing tool-call parts.
    pub message: Message,
    /// Token accounting, when the provider reports it.
    pub usage: Option<TokenUsage>,
    /// Stop reason.
    pub finish_reason: FinishReason,
}

/// One element of a streaming generation.
#[derive(Debug, Clone)]
pub enum StreamElement {
    /// Incremental text.
    TextDelta(String),
    /// Incremental tool-call data. `name_delta` and `args_delta` fragments
    /// for the same `id` are concatenated by the consumer before dispatch.
    ToolCallDelta {
        /// Call id; present at least on the first delta for a call.
        id: Option<String>,
        /// Fragment of the tool name.
        name_delta: Option<String>,
        /// Fragment of the JSON argument string.
        args_delta: Option<String>,
    },
    /// Terminal element carrying the assembled message and usage.
    MessageComplete(GenerateResult),
    /// Terminal error.
    Error(String),
}

/// Stream of generation elements compatible with `Send` executors.
pub type ElementStream = Pin<Box<dyn Stream<Item = Result<StreamElement, BoxError>> + Send>>;

// ---------------------------------------------------------------------------
// Duplex session types
// ---------------------------------------------------------------------------

/// Raw PCM audio with its framing parameters.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Sample bytes.
    pub data: Vec<u8>,
    /// Samples per second, e.g. 16_000.
    pub sample_rate: u32,
    /// Channel count.
    pub channels: u16,
    /// MIME type, e.g. `"audio/pcm"`.
    pub mime: String,
}

/// Output modality requested from a duplex session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modality {
    /// Text deltas.
    Text,
    /// Audio deltas.
    Audio,
}

/// Options for opening a duplex session.
#[derive(Debug, Clone)]
pub struct DuplexOptions {
    /// Input audio framing.
    pub sample_rate: u32,
    /// Input channel count.
    pub channels: u16,
    /// Input MIME type.
    pub mime: String,
    /// Requested response modalities.
    pub response_modalities: Vec<Modality>,
    /// Tools visible to the session.
    pub tools: Vec<ToolDefinition>,
    /// System priming text.
    pub system: Option<String>,
}

/// One element on a duplex session's response channel.
#[derive(Debug, Clone)]
pub enum ResponseElement {
    /// Incremental assistant text.
    TextDelta(String),
    /// Incremental assistant audio.
    AudioDelta(Vec<u8>),
    /// Transcription of user audio.
    Transcription(String),
    /// The user barged in; buffered output was discarded.
    Interrupted,
    /// The model requested a tool call mid-stream.
    ToolCall(ToolCallPart),
    /// The turn finished.
    FinishReason(FinishReason),
    /// Session-level error.
    Error(String),
}

/// Long-lived bidirectional audio channel to a provider.
///
/// Obtained from [`Provider::open_duplex`]. The response receiver is taken
/// exactly once; the runtime's duplex driver owns it for the session's
/// lifetime.
#[async_trait]
pub trait DuplexSession: Send {
    /// Push an audio chunk into the session.
    async fn send_chunk(&mut self, chunk: AudioChunk) -> Result<(), BoxError>;

    /// Mark the logical end of the current user turn (client-driven VAD).
    async fn send_end_of_stream(&mut self) -> Result<(), BoxError>;

    /// Feed a tool result back into the session mid-stream.
    async fn send_tool_result(&mut self, result: ToolResultPart) -> Result<(), BoxError>;

    /// Take the response channel. Returns `None` after the first call.
    fn responses(&mut self) -> Option<mpsc::Receiver<ResponseElement>>;

    /// Close the session and release provider resources.
    async fn close(&mut self) -> Result<(), BoxError>;
}

// ---------------------------------------------------------------------------
// Provider trait
// ---------------------------------------------------------------------------

/// The capability subset a provider implementation supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// One-shot request/response generation.
    pub generate: bool,
    /// Streaming generation.
    pub streaming: bool,
    /// Duplex audio sessions.
    pub duplex: bool,
    /// Text embeddings.
    pub embeddings: bool,
}

impl Capabilities {
    /// Generation only; the default for minimal implementations.
    pub const fn generate_only() -> Self {
        Self {
            generate: true,
            streaming: false,
            duplex: false,
            embeddings: false,
        }
    }

    /// Every capability.
    pub const fn all() -> Self {
        Self {
            generate: true,
            streaming: true,
            duplex: true,
            embeddings: true,
        }
    }
}

/// Trait-driven abstraction over a concrete model backend.
///
/// Implementations **must** be thread-safe (`Send + Sync`) so they can be
/// shared between conversations. Default methods reject the optional
/// capabilities; implementations override exactly what they support and
/// advertise it via [`capabilities`](Provider::capabilities).
#[async_trait]
pub trait Provider: Send + Sync {
    /// One-shot chat completion. `messages` must include any system
    /// priming; `tools` carries the provider-visible schemas.
    async fn generate(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        params: &GenerateParams,
    ) -> Result<GenerateResult, BoxError>;

    /// Streaming generation. Default: unsupported.
    async fn generate_stream(
        &self,
        _messages: &[Message],
        _tools: &[ToolDefinition],
        _params: &GenerateParams,
    ) -> Result<ElementStream, BoxError> {
        Err("provider does not support streaming".into())
    }

    /// Open a duplex audio session. Default: unsupported.
    async fn open_duplex(&self, _options: DuplexOptions) -> Result<Box<dyn DuplexSession>, BoxError> {
        Err("provider does not support duplex sessions".into())
    }

    /// Embed a batch of texts. Default: unsupported.
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, BoxError> {
        Err("provider does not support embeddings".into())
    }

    /// Identifier of the upstream model, e.g. `"gpt-4.1"`.
    fn model_name(&self) -> &str;

    /// Supported capability subset.
    fn capabilities(&self) -> Capabilities {
        Capabilities::generate_only()
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Bounded exponential backoff for transient provider errors.
///
/// Applied inside the provider stage: rate limits, timeouts, and
/// connection resets are retried up to `max_attempts`; cancellation is
/// never retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first. `1` disables retries.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each subsequent one.
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> std::time::Duration {
        let factor = 1u64 << (retry.saturating_sub(1)).min(16);
        std::time::Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}
