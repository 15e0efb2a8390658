//! The per-turn tool loop.
//!
//! One turn may span several provider rounds: the model is called, any
//! tool calls in its reply are validated and dispatched (concurrently,
//! under a parallelism cap, each with its own timeout), the results are
//! appended as tool-role messages, and the model is called again — until
//! a reply carries no tool calls or the round budget runs out. Approval-
//! gated calls suspend the loop instead of blocking it; the conversation
//! resumes it when the last pending call resolves.
//!
//! Message order within a turn is fixed: assistant text/tool-calls, then
//! tool results in the order the assistant requested them, then the next
//! assistant message, until stop.

use log::warn;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use futures_util::StreamExt;

use crate::colloquy::conversation::StreamChunk;
use crate::colloquy::error::RuntimeError;
use crate::colloquy::event::{EventBus, EventScope, EventType};
use crate::colloquy::message::{Message, Part, Role, ToolCallPart};
use crate::colloquy::provider::{
    FinishReason, GenerateParams, GenerateResult, Provider, RetryPolicy, StreamElement,
    ToolDefinition, TokenUsage,
};
use crate::colloquy::tool_registry::{
    ToolContext, ToolExecution, ToolInvocation, ToolOutcome, ToolRegistry,
};

/// What the model may do with tools this turn.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ToolChoice {
    /// The model decides.
    #[default]
    Auto,
    /// At least one tool call is expected.
    Required,
    /// No tool schemas are sent; stray calls are rejected.
    None,
    /// Only the named tool is visible.
    Specific(String),
}

/// Per-turn tool policy.
#[derive(Debug, Clone)]
pub struct ToolPolicy {
    /// Tool-choice mode.
    pub tool_choice: ToolChoice,
    /// Provider rounds per turn. Zero forbids tool execution entirely.
    pub max_rounds: u32,
    /// Executed tool calls per turn; excess calls get error results.
    pub max_tool_calls_per_turn: u32,
    /// Names elided from the provider-visible schema and rejected if
    /// called anyway.
    pub blocklist: Vec<String>,
    /// Concurrent executions within one round.
    pub parallelism: usize,
}

impl Default for ToolPolicy {
    fn default() -> Self {
        Self {
            tool_choice: ToolChoice::Auto,
            max_rounds: 5,
            max_tool_calls_per_turn: 16,
            blocklist: Vec::new(),
            parallelism: 4,
        }
    }
}

/// A tool call suspended on out-of-band approval.
#[derive(Debug, Clone)]
pub struct PendingToolCall {
    /// Call id, used with `resolve_tool`/`reject_tool`.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Validated arguments.
    pub arguments: serde_json::Value,
    /// Reason reported by the approval check.
    pub reason: String,
}

/// Everything a finished (or suspended) loop produced.
#[derive(Debug)]
pub struct ToolLoopOutcome {
    /// The last assistant message.
    pub assistant: Message,
    /// All messages produced this turn, in log order.
    pub output_messages: Vec<Message>,
    /// Tool calls that were dispatched (executed or suspended).
    pub tool_calls: Vec<ToolCallPart>,
    /// Calls awaiting approval. Non-empty means the loop suspended.
    pub pending: Vec<PendingToolCall>,
    /// Token usage accumulated across rounds.
    pub usage: TokenUsage,
    /// Rounds consumed, including the suspended one.
    pub rounds: u32,
    /// Stop reason of the final provider reply.
    pub finish_reason: FinishReason,
}

/// Shared plumbing for one loop run.
pub struct ToolLoopRun<'a> {
    /// Provider to call.
    pub provider: &'a Arc<dyn Provider>,
    /// Registry resolving and executing tools.
    pub registry: &'a Arc<ToolRegistry>,
    /// Policy for this turn.
    pub policy: &'a ToolPolicy,
    /// Generation parameters.
    pub params: &'a GenerateParams,
    /// Names of the tools this prompt exposes.
    pub tool_names: &'a [String],
    /// Dispatch context (conversation id, variable snapshot).
    pub context: ToolContext,
    /// Event correlation ids.
    pub scope: &'a EventScope,
    /// Event bus.
    pub bus: &'a Arc<EventBus>,
    /// Cancellation token for the turn.
    pub cancel: &'a CancellationToken,
    /// Retry policy for transient provider failures.
    pub retry: &'a RetryPolicy,
    /// When set, text deltas and tool calls are forwarded as stream
    /// chunks (streaming pipelines).
    pub stream_tx: Option<mpsc::Sender<StreamChunk>>,
    /// Round counter start; non-zero when resuming after approvals.
    pub start_round: u32,
}

impl<'a> ToolLoopRun<'a> {
    /// Provider-visible definitions after applying tool choice and the
    /// blocklist.
    fn visible_definitions(&self) -> Vec<ToolDefinition> {
        match &self.policy.tool_choice {
            ToolChoice::None => Vec::new(),
            ToolChoice::Specific(name) => self
                .registry
                .definitions_for(&[name.clone()], &self.policy.blocklist),
            ToolChoice::Auto | ToolChoice::Required => self
                .registry
                .definitions_for(self.tool_names, &self.policy.blocklist),
        }
    }

    /// Run the loop over an already-assembled context. `messages` must
    /// end with the current user input (or the resume point's tool
    /// results).
    pub async fn run(&self, mut messages: Vec<Message>) -> Result<ToolLoopOutcome, RuntimeError> {
        let definitions = self.visible_definitions();
        let mut outputs: Vec<Message> = Vec::new();
        let mut executed_calls: Vec<ToolCallPart> = Vec::new();
        let mut usage = TokenUsage::default();
        let mut round = self.start_round;
        let mut executed_count: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Err(RuntimeError::Cancelled);
            }
            round += 1;

            self.bus.publish(self.scope.event(
                EventType::ProviderCallStarted,
                serde_json::json!({
                    "model": self.provider.model_name(),
                    "round": round,
                }),
            ));
            let started = Instant::now();
            let result = self.call_provider(&messages, &definitions).await;
            let result = match result {
                Ok(result) => result,
                Err(err) => {
                    self.bus.publish(self.scope.event(
                        EventType::ProviderCallFailed,
                        serde_json::json!({
                            "model": self.provider.model_name(),
                            "round": round,
                            "error": err.to_string(),
                        }),
                    ));
                    return Err(err);
                }
            };
            if let Some(call_usage) = &result.usage {
                usage.add(call_usage);
            }
            self.bus.publish(self.scope.event(
                EventType::ProviderCallCompleted,
                serde_json::json!({
                    "model": self.provider.model_name(),
                    "round": round,
                    "elapsed_ms": started.elapsed().as_millis() as u64,
                    "input_tokens": result.usage.as_ref().map(|u| u.input_tokens),
                    "output_tokens": result.usage.as_ref().map(|u| u.output_tokens),
                    "total_tokens": result.usage.as_ref().map(|u| u.total_tokens),
                }),
            ));

            let assistant = result.message.clone();
            messages.push(assistant.clone());
            outputs.push(assistant.clone());

            let calls: Vec<ToolCallPart> =
                assistant.tool_calls().into_iter().cloned().collect();
            if calls.is_empty() {
                if matches!(self.policy.tool_choice, ToolChoice::Required) && round == 1 {
                    warn!("tool_choice=required but the model made no tool calls");
                }
                return Ok(ToolLoopOutcome {
                    assistant,
                    output_messages: outputs,
                    tool_calls: executed_calls,
                    pending: Vec::new(),
                    usage,
                    rounds: round,
                    finish_reason: result.finish_reason,
                });
            }

            // Forward tool calls on the stream (strictly as tool-call
            // chunks, never synthetic text).
            if let Some(tx) = &self.stream_tx {
                for call in &calls {
                    let _ = tx.send(StreamChunk::ToolCall(call.clone())).await;
                }
            }

            if round > self.policy.max_rounds {
                // Out of rounds: the calls are answered with error
                // results so the model can see what happened, but nothing
                // executes.
                for call in &calls {
                    outputs.push(Message::tool_result(
                        &call.id,
                        serde_json::Value::String(format!(
                            "tool round limit of {} reached; '{}' was not executed",
                            self.policy.max_rounds, call.name
                        )),
                        true,
                    ));
                }
                return Ok(ToolLoopOutcome {
                    assistant,
                    output_messages: outputs,
                    tool_calls: executed_calls,
                    pending: Vec::new(),
                    usage,
                    rounds: round,
                    finish_reason: result.finish_reason,
                });
            }

            // Execute the round's calls concurrently, capped, keeping
            // result order aligned with call order.
            let mut round_results: Vec<(ToolCallPart, RoundResult)> = Vec::new();
            let mut batch: Vec<(ToolCallPart, Option<String>)> = Vec::new();
            for call in calls {
                let rejection = if self.policy.blocklist.contains(&call.name) {
                    Some(format!("tool '{}' is blocked by policy", call.name))
                } else if matches!(self.policy.tool_choice, ToolChoice::None) {
                    Some("tool execution is disabled for this turn".to_string())
                } else if executed_count >= self.policy.max_tool_calls_per_turn {
                    Some(format!(
                        "per-turn tool call limit of {} reached",
                        self.policy.max_tool_calls_per_turn
                    ))
                } else {
                    executed_count += 1;
                    None
                };
                batch.push((call, rejection));
            }

            let results = futures_util::stream::iter(batch.into_iter().map(
                |(call, rejection)| async move {
                    let result = self.run_one_call(&call, rejection).await;
                    (call, result)
                },
            ))
            .buffered(self.policy.parallelism.max(1))
            .collect::<Vec<_>>()
            .await;
            round_results.extend(results);

            if self.cancel.is_cancelled() {
                return Err(RuntimeError::Cancelled);
            }

            let mut pending: Vec<PendingToolCall> = Vec::new();
            for (call, result) in round_results {
                executed_calls.push(call.clone());
                match result {
                    RoundResult::Completed(outcome) => {
                        let message =
                            Message::tool_result(&call.id, outcome.content, outcome.is_error);
                        messages.push(message.clone());
                        outputs.push(message);
                    }
                    RoundResult::Pending { reason, arguments } => {
                        pending.push(PendingToolCall {
                            id: call.id.clone(),
                            name: call.name.clone(),
                            arguments,
                            reason,
                        });
                    }
                }
            }

            if !pending.is_empty() {
                // Suspend; the conversation resumes from here once every
                // pending call is resolved or rejected.
                return Ok(ToolLoopOutcome {
                    assistant,
                    output_messages: outputs,
                    tool_calls: executed_calls,
                    pending,
                    usage,
                    rounds: round,
                    finish_reason: FinishReason::ToolCalls,
                });
            }
        }
    }

    async fn call_provider(
        &self,
        messages: &[Message],
        definitions: &[ToolDefinition],
    ) -> Result<GenerateResult, RuntimeError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let call = async {
                if self.stream_tx.is_some() && self.provider.capabilities().streaming {
                    self.stream_round(messages, definitions).await
                } else {
                    self.provider
                        .generate(messages, definitions, self.params)
                        .await
                        .map_err(|e| e.to_string())
                }
            };
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => return Err(RuntimeError::Cancelled),
                outcome = call => outcome,
            };
            match outcome {
                Ok(result) => return Ok(result),
                Err(message) => {
                    if attempt >= self.retry.max_attempts {
                        return Err(RuntimeError::Provider {
                            message,
                            attempts: attempt,
                        });
                    }
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        "provider call failed (attempt {}), retrying in {:?}: {}",
                        attempt, delay, message
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(RuntimeError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// One streaming provider round: forward text deltas, assemble tool-
    /// call deltas, and return the completed result.
    async fn stream_round(
        &self,
        messages: &[Message],
        definitions: &[ToolDefinition],
    ) -> Result<GenerateResult, String> {
        let tx = self.stream_tx.as_ref().expect("stream_round without sink");
        let mut stream = self
            .provider
            .generate_stream(messages, definitions, self.params)
            .await
            .map_err(|e| e.to_string())?;

        let mut text = String::new();
        let mut partial_calls: Vec<ToolCallPart> = Vec::new();
        let mut complete: Option<GenerateResult> = None;

        loop {
            let element = tokio::select! {
                _ = self.cancel.cancelled() => return Err("cancelled".to_string()),
                element = stream.next() => element,
            };
            let Some(element) = element else { break };
            match element.map_err(|e| e.to_string())? {
                StreamElement::TextDelta(delta) => {
                    text.push_str(&delta);
                    let _ = tx.send(StreamChunk::Text(delta)).await;
                }
                StreamElement::ToolCallDelta {
                    id,
                    name_delta,
                    args_delta,
                } => {
                    accumulate_tool_delta(&mut partial_calls, id, name_delta, args_delta);
                }
                StreamElement::MessageComplete(result) => {
                    complete = Some(result);
                }
                StreamElement::Error(message) => return Err(message),
            }
        }

        Ok(complete.unwrap_or_else(|| {
            // Stream ended without a terminal element; build the message
            // from the accumulated deltas.
            let mut parts = Vec::new();
            if !text.is_empty() {
                parts.push(Part::Text { text });
            }
            let had_calls = !partial_calls.is_empty();
            parts.extend(partial_calls.into_iter().map(Part::ToolCall));
            GenerateResult {
                message: Message::from_parts(Role::Assistant, parts),
                usage: None,
                finish_reason: if had_calls {
                    FinishReason::ToolCalls
                } else {
                    FinishReason::Stop
                },
            }
        }))
    }

    async fn run_one_call(&self, call: &ToolCallPart, rejection: Option<String>) -> RoundResult {
        if let Some(reason) = rejection {
            self.bus.publish(self.scope.event(
                EventType::ToolCallFailed,
                serde_json::json!({"tool": call.name, "id": call.id, "error": reason}),
            ));
            return RoundResult::Completed(ToolOutcome::error(reason));
        }

        let arguments = match self.registry.validate_arguments(&call.name, &call.arguments) {
            Ok(arguments) => arguments,
            Err(message) => {
                self.bus.publish(self.scope.event(
                    EventType::ValidationFailed,
                    serde_json::json!({"tool": call.name, "id": call.id, "error": message}),
                ));
                return RoundResult::Completed(ToolOutcome::error(message));
            }
        };

        self.bus.publish(self.scope.event(
            EventType::ToolCallStarted,
            serde_json::json!({"tool": call.name, "id": call.id}),
        ));
        let started = Instant::now();
        let execution = self
            .registry
            .dispatch(ToolInvocation {
                id: call.id.clone(),
                name: call.name.clone(),
                arguments: arguments.clone(),
                context: self.context.clone(),
            })
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match execution {
            ToolExecution::Completed(outcome) => {
                let event_type = if outcome.is_error {
                    EventType::ToolCallFailed
                } else {
                    EventType::ToolCallCompleted
                };
                self.bus.publish(self.scope.event(
                    event_type,
                    serde_json::json!({
                        "tool": call.name,
                        "id": call.id,
                        "elapsed_ms": elapsed_ms,
                        "is_error": outcome.is_error,
                    }),
                ));
                RoundResult::Completed(outcome)
            }
            ToolExecution::Pending { reason } => {
                self.bus.publish(self.scope.event(
                    EventType::ToolCallCompleted,
                    serde_json::json!({
                        "tool": call.name,
                        "id": call.id,
                        "elapsed_ms": elapsed_ms,
                        "pending": true,
                        "reason": reason,
                    }),
                ));
                RoundResult::Pending {
                    reason,
                    arguments,
                }
            }
        }
    }
}

enum RoundResult {
    Completed(ToolOutcome),
    Pending {
        reason: String,
        arguments: serde_json::Value,
    },
}

/// Fold a tool-call delta into the partial call list, concatenating name
/// and argument fragments per id.
pub fn accumulate_tool_delta(
    calls: &mut Vec<ToolCallPart>,
    id: Option<String>,
    name_delta: Option<String>,
    args_delta: Option<String>,
) {
    let target = match id {
        Some(id) => {
            if let Some(pos) = calls.iter().position(|c| c.id == id) {
                pos
            } else {
                calls.push(ToolCallPart {
                    id,
                    name: String::new(),
                    arguments: String::new(),
                });
                calls.len() - 1
            }
        }
        // Deltas without an id extend the most recent call.
        None => match calls.len().checked_sub(1) {
            Some(pos) => pos,
            None => return,
        },
    };
    if let Some(name) = name_delta {
        calls[target].name.push_str(&name);
    }
    if let Some(args) = args_delta {
        calls[target].arguments.push_str(&args);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deltas_concatenate_per_id() {
        let mut calls = Vec::new();
        accumulate_tool_delta(
            &mut calls,
            Some("t1".into()),
            Some("ad".into()),
            Some("{\"a\"".into()),
        );
        accumulate_tool_delta(&mut calls, Some("t1".into()), Some("d".into()), Some(": 2}".into()));
        accumulate_tool_delta(&mut calls, Some("t2".into()), Some("other".into()), None);

        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "add");
        assert_eq!(calls[0].arguments, "{\"a\": 2}");
        assert_eq!(calls[1].name, "other");
    }

    #[test]
    fn idless_delta_extends_latest_call() {
        let mut calls = Vec::new();
        accumulate_tool_delta(&mut calls, Some("t1".into()), Some("add".into()), None);
        accumulate_tool_delta(&mut calls, None, None, Some("{}".into()));
        assert_eq!(calls[0].arguments, "{}");

        // Without any call to extend, the delta is dropped.
        let mut empty = Vec::new();
        accumulate_tool_delta(&mut empty, None, None, Some("{}".into()));
        assert!(empty.is_empty());
    }
}
