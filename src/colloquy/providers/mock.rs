//! Deterministic scripted provider.
//!
//! [`ScriptedProvider`] replays a queue of canned replies and records every
//! request it receives. It backs the runtime's own test suite, the mock
//! execution modes of the tool registry, and the external evaluation
//! harness, which needs byte-stable replays. It supports all four provider
//! capabilities: scripted generation, streaming (replies are re-cut into
//! deltas), duplex sessions with scripted turns, and table-driven
//! embeddings with a hash fallback.

use async_trait::async_trait;
use futures_util::stream;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::colloquy::error::BoxError;
use crate::colloquy::message::{Message, Part, Role, ToolCallPart, ToolResultPart};
use crate::colloquy::provider::{
    AudioChunk, Capabilities, DuplexOptions, DuplexSession, ElementStream, FinishReason,
    GenerateParams, GenerateResult, Provider, ResponseElement, StreamElement, ToolDefinition,
    TokenUsage,
};

/// One canned reply in a [`ScriptedProvider`] script.
#[derive(Debug, Clone)]
pub struct ScriptedReply {
    message: Message,
    usage: Option<TokenUsage>,
    finish_reason: FinishReason,
}

impl ScriptedReply {
    /// A plain text assistant reply.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            message: Message::assistant(text),
            usage: None,
            finish_reason: FinishReason::Stop,
        }
    }

    /// An assistant reply requesting a single tool call.
    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            message: Message::from_parts(
                Role::Assistant,
                vec![Part::ToolCall(ToolCallPart {
                    id: id.into(),
                    name: name.into(),
                    arguments: arguments.to_string(),
                })],
            ),
            usage: None,
            finish_reason: FinishReason::ToolCalls,
        }
    }

    /// An arbitrary prebuilt assistant message.
    pub fn message(message: Message) -> Self {
        let finish_reason = if message.tool_calls().is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolCalls
        };
        Self {
            message,
            usage: None,
            finish_reason,
        }
    }

    /// Attach token usage to this reply.
    pub fn with_usage(mut self, input: u64, output: u64) -> Self {
        self.usage = Some(TokenUsage {
            input_tokens: input,
            output_tokens: output,
            total_tokens: input + output,
        });
        self
    }
}

/// Replay-based provider for tests and evaluation runs.
///
/// Replies are consumed front-to-back across `generate` and
/// `generate_stream`; an exhausted script is an error, which makes missing
/// expectations loud in tests.
pub struct ScriptedProvider {
    model: String,
    replies: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<Vec<Message>>>,
    embeddings: Mutex<HashMap<String, Vec<f32>>>,
    duplex_turns: Mutex<VecDeque<Vec<ResponseElement>>>,
    stream_delay: Option<Duration>,
}

impl ScriptedProvider {
    /// Create an empty script for the given model name.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            replies: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            embeddings: Mutex::new(HashMap::new()),
            duplex_turns: Mutex::new(VecDeque::new()),
            stream_delay: None,
        }
    }

    /// Queue a plain text reply.
    pub fn reply_text(self, text: impl Into<String>) -> Self {
        self.push(ScriptedReply::text(text))
    }

    /// Queue a tool-call reply.
    pub fn reply_tool_call(
        self,
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        self.push(ScriptedReply::tool_call(id, name, arguments))
    }

    /// Queue an arbitrary reply.
    pub fn reply(self, reply: ScriptedReply) -> Self {
        self.push(reply)
    }

    /// Register a fixed embedding for an exact text. Unregistered texts
    /// fall back to a deterministic hash-derived vector.
    pub fn with_embedding(self, text: impl Into<String>, vector: Vec<f32>) -> Self {
        self.embeddings.lock().unwrap().insert(text.into(), vector);
        self
    }

    /// Queue a scripted duplex turn: the elements played onto the response
    /// channel when the next end-of-turn arrives.
    pub fn duplex_turn(self, elements: Vec<ResponseElement>) -> Self {
        self.duplex_turns.lock().unwrap().push_back(elements);
        self
    }

    /// Insert a pause before each streamed element (for cancellation tests).
    pub fn with_stream_delay(mut self, delay: Duration) -> Self {
        self.stream_delay = Some(delay);
        self
    }

    /// Snapshot of every message list this provider has been called with.
    pub fn recorded_requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().unwrap().clone()
    }

    fn push(self, reply: ScriptedReply) -> Self {
        self.replies.lock().unwrap().push_back(reply);
        self
    }

    fn next_reply(&self, messages: &[Message]) -> Result<ScriptedReply, BoxError> {
        self.requests.lock().unwrap().push(messages.to_vec());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| -> BoxError { "scripted provider: script exhausted".into() })
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn generate(
        &self,
        messages: &[Message],
        _tools: &[ToolDefinition],
        _params: &GenerateParams,
    ) -> Result<GenerateResult, BoxError> {
        let reply = self.next_reply(messages)?;
        Ok(GenerateResult {
            message: reply.message,
            usage: reply.usage,
            finish_reason: reply.finish_reason,
        })
    }

    async fn generate_stream(
        &self,
        messages: &[Message],
        _tools: &[ToolDefinition],
        _params: &GenerateParams,
    ) -> Result<ElementStream, BoxError> {
        let reply = self.next_reply(messages)?;
        let mut elements: Vec<Result<StreamElement, BoxError>> = Vec::new();

        for part in &reply.message.parts {
            match part {
                Part::Text { text } => {
                    // Re-cut into word deltas so consumers see realistic
                    // incremental output.
                    for word in split_keeping_spaces(text) {
                        elements.push(Ok(StreamElement::TextDelta(word)));
                    }
                }
                Part::ToolCall(tc) => {
                    let (head, tail) = tc.arguments.split_at(tc.arguments.len() / 2);
                    elements.push(Ok(StreamElement::ToolCallDelta {
                        id: Some(tc.id.clone()),
                        name_delta: Some(tc.name.clone()),
                        args_delta: Some(head.to_string()),
                    }));
                    elements.push(Ok(StreamElement::ToolCallDelta {
                        id: Some(tc.id.clone()),
                        name_delta: None,
                        args_delta: Some(tail.to_string()),
                    }));
                }
                _ => {}
            }
        }
        elements.push(Ok(StreamElement::MessageComplete(GenerateResult {
            message: reply.message,
            usage: reply.usage,
            finish_reason: reply.finish_reason,
        })));

        let delay = self.stream_delay;
        let stream = stream::iter(elements);
        if let Some(delay) = delay {
            let paced = futures_util::StreamExt::then(stream, move |el| async move {
                tokio::time::sleep(delay).await;
                el
            });
            Ok(Box::pin(paced))
        } else {
            Ok(Box::pin(stream))
        }
    }

    async fn open_duplex(&self, _options: DuplexOptions) -> Result<Box<dyn DuplexSession>, BoxError> {
        let turns: VecDeque<Vec<ResponseElement>> =
            std::mem::take(&mut *self.duplex_turns.lock().unwrap());
        let (tx, rx) = mpsc::channel(64);
        Ok(Box::new(MockDuplexSession {
            turns,
            tx,
            rx: Some(rx),
            chunks_received: 0,
            tool_results: Vec::new(),
        }))
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BoxError> {
        let table = self.embeddings.lock().unwrap();
        Ok(texts
            .iter()
            .map(|t| table.get(t).cloned().unwrap_or_else(|| hash_embedding(t)))
            .collect())
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }
}

/// Scripted duplex session handed out by [`ScriptedProvider::open_duplex`].
///
/// Audio chunks are counted and discarded; each end-of-stream plays the
/// next scripted turn onto the response channel.
pub struct MockDuplexSession {
    turns: VecDeque<Vec<ResponseElement>>,
    tx: mpsc::Sender<ResponseElement>,
    rx: Option<mpsc::Receiver<ResponseElement>>,
    chunks_received: u64,
    tool_results: Vec<ToolResultPart>,
}

impl MockDuplexSession {
    /// Number of audio chunks pushed into the session so far.
    pub fn chunks_received(&self) -> u64 {
        self.chunks_received
    }
}

#[async_trait]
impl DuplexSession for MockDuplexSession {
    async fn send_chunk(&mut self, _chunk: AudioChunk) -> Result<(), BoxError> {
        self.chunks_received += 1;
        Ok(())
    }

    async fn send_end_of_stream(&mut self) -> Result<(), BoxError> {
        let turn = self.turns.pop_front().unwrap_or_else(|| {
            vec![ResponseElement::Error(
                "scripted duplex: no turn scripted".to_string(),
            )]
        });
        for element in turn {
            if self.tx.send(element).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    async fn send_tool_result(&mut self, result: ToolResultPart) -> Result<(), BoxError> {
        self.tool_results.push(result);
        Ok(())
    }

    fn responses(&mut self) -> Option<mpsc::Receiver<ResponseElement>> {
        self.rx.take()
    }

    async fn close(&mut self) -> Result<(), BoxError> {
        Ok(())
    }
}

fn split_keeping_spaces(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if ch == ' ' {
            out.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

/// Deterministic pseudo-embedding so unconfigured texts still embed.
fn hash_embedding(text: &str) -> Vec<f32> {
    let mut state: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in text.bytes() {
        state ^= byte as u64;
        state = state.wrapping_mul(0x100_0000_01b3);
    }
    (0..8)
        .map(|i| ((state >> (i * 8)) & 0xFF) as f32 / 255.0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn replays_in_order_and_records_requests() {
        let provider = ScriptedProvider::new("mock")
            .reply_text("first")
            .reply_text("second");

        let r1 = provider
            .generate(&[Message::user("a")], &[], &GenerateParams::default())
            .await
            .unwrap();
        let r2 = provider
            .generate(&[Message::user("b")], &[], &GenerateParams::default())
            .await
            .unwrap();
        assert_eq!(r1.message.text(), "first");
        assert_eq!(r2.message.text(), "second");
        assert_eq!(provider.recorded_requests().len(), 2);
    }

    #[tokio::test]
    async fn exhausted_script_errors() {
        let provider = ScriptedProvider::new("mock");
        let err = provider
            .generate(&[Message::user("a")], &[], &GenerateParams::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exhausted"));
    }

    #[tokio::test]
    async fn stream_recuts_text_into_deltas() {
        let provider = ScriptedProvider::new("mock").reply_text("one two three");
        let mut stream = provider
            .generate_stream(&[Message::user("q")], &[], &GenerateParams::default())
            .await
            .unwrap();

        let mut text = String::new();
        let mut deltas = 0;
        while let Some(el) = stream.next().await {
            match el.unwrap() {
                StreamElement::TextDelta(d) => {
                    deltas += 1;
                    text.push_str(&d);
                }
                StreamElement::MessageComplete(result) => {
                    assert_eq!(result.message.text(), "one two three");
                }
                other => panic!("unexpected element: {:?}", other),
            }
        }
        assert_eq!(text, "one two three");
        assert!(deltas >= 3);
    }

    #[tokio::test]
    async fn tool_call_streams_as_concatenatable_deltas() {
        let provider =
            ScriptedProvider::new("mock").reply_tool_call("t1", "add", serde_json::json!({"a": 2}));
        let mut stream = provider
            .generate_stream(&[Message::user("q")], &[], &GenerateParams::default())
            .await
            .unwrap();

        let mut args = String::new();
        while let Some(el) = stream.next().await {
            if let StreamElement::ToolCallDelta { args_delta, .. } = el.unwrap() {
                if let Some(a) = args_delta {
                    args.push_str(&a);
                }
            }
        }
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&args).unwrap(),
            serde_json::json!({"a": 2})
        );
    }

    #[tokio::test]
    async fn scripted_duplex_plays_turn_on_end_of_stream() {
        let provider = ScriptedProvider::new("mock").duplex_turn(vec![
            ResponseElement::TextDelta("hi".into()),
            ResponseElement::FinishReason(FinishReason::Stop),
        ]);
        let mut session = provider
            .open_duplex(DuplexOptions {
                sample_rate: 16_000,
                channels: 1,
                mime: "audio/pcm".into(),
                response_modalities: vec![crate::colloquy::provider::Modality::Text],
                tools: vec![],
                system: None,
            })
            .await
            .unwrap();

        let mut rx = session.responses().unwrap();
        session.send_end_of_stream().await.unwrap();
        assert!(matches!(rx.recv().await, Some(ResponseElement::TextDelta(_))));
        assert!(matches!(
            rx.recv().await,
            Some(ResponseElement::FinishReason(FinishReason::Stop))
        ));
    }

    #[test]
    fn hash_embedding_is_stable() {
        assert_eq!(hash_embedding("abc"), hash_embedding("abc"));
        assert_ne!(hash_embedding("abc"), hash_embedding("abd"));
    }
}
