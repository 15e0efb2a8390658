//! Error types for the runtime.
//!
//! All fallible public operations return [`RuntimeError`] (or a
//! `Box<dyn Error + Send + Sync>` at pluggable trait seams, which the
//! pipeline wraps into a [`RuntimeError`] variant before it reaches the
//! caller). The variants follow the runtime's failure taxonomy:
//! configuration errors fail [`Conversation::open`](crate::Conversation::open),
//! everything else fails the current turn, never the conversation.

use std::error::Error;
use std::fmt;

/// Boxed error type used at async trait boundaries (providers, stores,
/// tool executors) so implementations can surface their own error types.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Unified error type returned by conversation operations.
#[derive(Debug)]
pub enum RuntimeError {
    /// The referenced pack could not be located or read.
    PackNotFound(String),
    /// The pack does not define the requested prompt.
    PromptNotFound(String),
    /// The pack failed schema or cross-reference validation.
    InvalidPack(String),
    /// No provider was given and none could be detected from the model
    /// name or process credentials.
    ProviderNotDetected,
    /// The conversation handle was closed; no further turns are accepted.
    ConversationClosed,
    /// A prompt references (or a call names) a tool that is not registered.
    ToolNotRegistered(String),
    /// A provider call failed after retries were exhausted.
    Provider {
        /// Underlying provider error text.
        message: String,
        /// Number of attempts made, including the first.
        attempts: u32,
    },
    /// A tool failed in a way the model was not given a chance to recover
    /// from (executor crash, timeout with `max_rounds` exhausted).
    Tool {
        /// Name of the failing tool.
        tool: String,
        /// Failure description.
        message: String,
    },
    /// Argument or option validation failed.
    Validation(String),
    /// The state store reported an error. Surfaced verbatim.
    Store(String),
    /// The operation was cancelled through its cancellation token.
    Cancelled,
    /// A duplex session failed before reaching its partial-success floor.
    Duplex {
        /// Failure description.
        message: String,
        /// Turns completed before the failure.
        completed_turns: u32,
    },
    /// The tool loop reached `max_rounds` without converging.
    MaxRoundsExceeded {
        /// The configured round limit.
        rounds: u32,
    },
    /// `resolve_tool`/`reject_tool` was called for an id that was already
    /// resolved or rejected.
    PendingAlreadyResolved(String),
    /// `resolve_tool`/`reject_tool` was called for an unknown id.
    UnknownPendingTool(String),
    /// An unknown option key was supplied at open.
    UnknownOption(String),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::PackNotFound(what) => write!(f, "pack not found: {}", what),
            RuntimeError::PromptNotFound(name) => write!(f, "prompt not found: {}", name),
            RuntimeError::InvalidPack(msg) => write!(f, "invalid pack: {}", msg),
            RuntimeError::ProviderNotDetected => {
                write!(f, "no provider configured and none detectable from environment")
            }
            RuntimeError::ConversationClosed => write!(f, "conversation is closed"),
            RuntimeError::ToolNotRegistered(name) => write!(f, "tool not registered: {}", name),
            RuntimeError::Provider { message, attempts } => {
                write!(f, "provider error after {} attempt(s): {}", attempts, message)
            }
            RuntimeError::Tool { tool, message } => {
                write!(f, "tool '{}' failed: {}", tool, message)
            }
            RuntimeError::Validation(msg) => write!(f, "validation error: {}", msg),
            RuntimeError::Store(msg) => write!(f, "state store error: {}", msg),
            RuntimeError::Cancelled => write!(f, "operation cancelled"),
            RuntimeError::Duplex {
                message,
                completed_turns,
            } => write!(
                f,
                "duplex session failed after {} completed turn(s): {}",
                completed_turns, message
            ),
            RuntimeError::MaxRoundsExceeded { rounds } => {
                write!(f, "tool loop exceeded {} round(s)", rounds)
            }
            RuntimeError::PendingAlreadyResolved(id) => {
                write!(f, "pending tool call already resolved: {}", id)
            }
            RuntimeError::UnknownPendingTool(id) => {
                write!(f, "unknown pending tool call: {}", id)
            }
            RuntimeError::UnknownOption(key) => write!(f, "unknown option: {}", key),
        }
    }
}

impl Error for RuntimeError {}

impl RuntimeError {
    /// True when the error is a cancellation, which callers must not retry.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RuntimeError::Cancelled)
    }

    /// True for configuration errors that can only occur at open time.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            RuntimeError::PackNotFound(_)
                | RuntimeError::PromptNotFound(_)
                | RuntimeError::InvalidPack(_)
                | RuntimeError::ProviderNotDetected
                | RuntimeError::ToolNotRegistered(_)
                | RuntimeError::UnknownOption(_)
        )
    }

    /// Wrap a store-layer error.
    pub fn store(err: impl fmt::Display) -> Self {
        RuntimeError::Store(err.to_string())
    }
}
