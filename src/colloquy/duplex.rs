//! Duplex audio session driver.
//!
//! When a conversation is opened in duplex mode, the provider stage is
//! replaced by a long-lived [`DuplexHandle`] that multiplexes audio input
//! and model output. Turn boundaries come either from the provider's own
//! endpointer (ASM mode: audio passes straight through, sent in bursts)
//! or from the client-side [`VoiceActivityDetector`]. The handle owns
//! barge-in: when the user starts speaking while the model is emitting
//! audio, the response stream signals `Interrupted`, buffered output for
//! that turn is discarded, in-flight tool calls are flushed, and the
//! partial assistant text is persisted.
//!
//! Tool calls arriving mid-stream are dispatched through the same
//! registry rules as the request/response loop, with their results fed
//! back into the provider session.

use log::{debug, warn};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::colloquy::error::RuntimeError;
use crate::colloquy::event::{EventBus, EventScope, EventType};
use crate::colloquy::message::{MediaPart, MediaSource, Message, Part, Role};
use crate::colloquy::provider::{
    AudioChunk, DuplexOptions, DuplexSession, Modality, Provider, ResponseElement,
};
use crate::colloquy::store::StateStore;
use crate::colloquy::tool_registry::{ToolContext, ToolExecution, ToolInvocation, ToolRegistry};
use crate::colloquy::vad::{VadConfig, VadEvent, VoiceActivityDetector};

/// How user turn boundaries are detected.
#[derive(Debug, Clone)]
pub enum TurnDetection {
    /// Provider-native endpointing; audio passes through unpaced.
    Asm,
    /// Client-side energy VAD.
    Vad(VadConfig),
}

/// Per-session failure handling knobs.
#[derive(Debug, Clone)]
pub struct DuplexResilience {
    /// Retries tolerated across per-turn failures before the session is
    /// considered failed.
    pub max_retries: u32,
    /// Delay before continuing after a per-turn failure.
    pub retry_delay_ms: u64,
    /// Pause inserted between turns (paced replay scenarios).
    pub inter_turn_delay_ms: u64,
    /// A session ending after at least this many completed turns counts
    /// as success. Zero means any mid-session termination fails.
    pub partial_success_min_turns: u32,
    /// Treat a server-side end on what would have been the final turn as
    /// success.
    pub ignore_last_turn_session_end: bool,
}

impl Default for DuplexResilience {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_delay_ms: 500,
            inter_turn_delay_ms: 0,
            partial_success_min_turns: 1,
            ignore_last_turn_session_end: true,
        }
    }
}

/// Configuration for a duplex conversation.
#[derive(Debug, Clone)]
pub struct DuplexConfig {
    /// Turn-boundary detection mode.
    pub detection: TurnDetection,
    /// Failure handling.
    pub resilience: DuplexResilience,
    /// Requested response modalities.
    pub response_modalities: Vec<Modality>,
    /// Input sample rate.
    pub sample_rate: u32,
    /// Input channel count.
    pub channels: u16,
    /// Input MIME type.
    pub mime: String,
}

impl Default for DuplexConfig {
    fn default() -> Self {
        Self {
            detection: TurnDetection::Vad(VadConfig::default()),
            resilience: DuplexResilience::default(),
            response_modalities: vec![Modality::Text, Modality::Audio],
            sample_rate: 16_000,
            channels: 1,
            mime: "audio/pcm".to_string(),
        }
    }
}

/// Outcome summary returned by [`DuplexHandle::finish`].
#[derive(Debug, Clone)]
pub struct DuplexSummary {
    /// Turns that ran to a finish reason.
    pub completed_turns: u32,
    /// Whether the session ended on a session-level error that the
    /// partial-success rules forgave.
    pub degraded: bool,
}

struct DuplexShared {
    session: Mutex<Box<dyn DuplexSession>>,
    out_tx: mpsc::Sender<ResponseElement>,
    interrupted: AtomicBool,
    model_speaking: AtomicBool,
    completed_turns: AtomicU32,
    failures: AtomicU32,
    partial_text: StdMutex<String>,
    session_error: StdMutex<Option<String>>,
    tool_cancel: StdMutex<CancellationToken>,
    store: Option<Arc<dyn StateStore>>,
    conversation_id: String,
    registry: Arc<ToolRegistry>,
    bus: Arc<EventBus>,
    scope: EventScope,
    resilience: DuplexResilience,
    mime: String,
}

impl DuplexShared {
    async fn append_messages(&self, messages: Vec<Message>) {
        let Some(store) = &self.store else { return };
        let outcome = match store.as_message_appender() {
            Some(appender) => appender
                .append_messages(&self.conversation_id, messages)
                .await
                .map(|_| ()),
            None => match store.load(&self.conversation_id).await {
                Ok(mut state) => {
                    for mut message in messages {
                        message.turn_index = Some(state.message_count);
                        state.messages.push(message);
                        state.message_count += 1;
                    }
                    store.save(&self.conversation_id, state).await
                }
                Err(err) => Err(err),
            },
        };
        if let Err(err) = outcome {
            warn!("duplex state append failed: {}", err);
            self.bus.publish(self.scope.event(
                EventType::StateSaveFailed,
                serde_json::json!({"error": err.to_string()}),
            ));
        }
    }

    /// Signal interruption on the response stream, persist the partial
    /// assistant text, and flush tool calls for the interrupted turn.
    async fn interrupt(&self) {
        if self.interrupted.swap(true, Ordering::SeqCst) {
            return;
        }
        // Flush in-flight tool calls for this turn.
        let fresh = CancellationToken::new();
        let old = std::mem::replace(&mut *self.tool_cancel.lock().unwrap(), fresh);
        old.cancel();

        let partial = std::mem::take(&mut *self.partial_text.lock().unwrap());
        if !partial.is_empty() {
            self.append_messages(vec![Message::assistant(partial)]).await;
        }
        let _ = self.out_tx.send(ResponseElement::Interrupted).await;
        self.bus.publish(
            self.scope
                .event(EventType::StreamInterrupted, serde_json::json!({})),
        );
    }
}

/// A live duplex session bound to a conversation.
pub struct DuplexHandle {
    shared: Arc<DuplexShared>,
    vad: Option<StdMutex<VoiceActivityDetector>>,
    user_audio: StdMutex<Vec<u8>>,
    out_rx: StdMutex<Option<mpsc::Receiver<ResponseElement>>>,
    driver: tokio::task::JoinHandle<()>,
    detection: TurnDetection,
    sample_rate: u32,
    channels: u16,
}

impl DuplexHandle {
    /// Open a duplex session against the provider and start the response
    /// driver.
    pub async fn open(
        provider: &Arc<dyn Provider>,
        config: DuplexConfig,
        system: Option<String>,
        registry: Arc<ToolRegistry>,
        store: Option<Arc<dyn StateStore>>,
        conversation_id: String,
        bus: Arc<EventBus>,
        scope: EventScope,
    ) -> Result<Self, RuntimeError> {
        let tools = registry.definitions_for(&registry.names(), &[]);
        let mut session = provider
            .open_duplex(DuplexOptions {
                sample_rate: config.sample_rate,
                channels: config.channels,
                mime: config.mime.clone(),
                response_modalities: config.response_modalities.clone(),
                tools,
                system,
            })
            .await
            .map_err(|e| RuntimeError::Duplex {
                message: e.to_string(),
                completed_turns: 0,
            })?;
        let responses = session.responses().ok_or_else(|| RuntimeError::Duplex {
            message: "provider session yielded no response channel".into(),
            completed_turns: 0,
        })?;

        let (out_tx, out_rx) = mpsc::channel(256);
        let shared = Arc::new(DuplexShared {
            session: Mutex::new(session),
            out_tx,
            interrupted: AtomicBool::new(false),
            model_speaking: AtomicBool::new(false),
            completed_turns: AtomicU32::new(0),
            failures: AtomicU32::new(0),
            partial_text: StdMutex::new(String::new()),
            session_error: StdMutex::new(None),
            tool_cancel: StdMutex::new(CancellationToken::new()),
            store,
            conversation_id,
            registry,
            bus: bus.clone(),
            scope: scope.clone(),
            resilience: config.resilience.clone(),
            mime: config.mime.clone(),
        });

        bus.publish(scope.event(EventType::StreamStarted, serde_json::json!({"mode": "duplex"})));

        let driver = tokio::spawn(drive_responses(Arc::clone(&shared), responses));

        let vad = match &config.detection {
            TurnDetection::Vad(vad_config) => Some(StdMutex::new(VoiceActivityDetector::new(
                vad_config.clone(),
            ))),
            TurnDetection::Asm => None,
        };

        Ok(Self {
            shared,
            vad,
            user_audio: StdMutex::new(Vec::new()),
            out_rx: StdMutex::new(Some(out_rx)),
            driver,
            detection: config.detection,
            sample_rate: config.sample_rate,
            channels: config.channels,
        })
    }

    /// Take the response channel. Returns `None` after the first call.
    pub fn responses(&self) -> Option<mpsc::Receiver<ResponseElement>> {
        self.out_rx.lock().unwrap().take()
    }

    /// Push raw PCM into the session. Under VAD detection this also feeds
    /// the endpointer, which may trigger barge-in or end-of-turn.
    pub async fn send_audio(&self, data: Vec<u8>) -> Result<(), RuntimeError> {
        self.user_audio.lock().unwrap().extend_from_slice(&data);

        let mut end_of_turn = false;
        if let Some(vad) = &self.vad {
            let event = vad.lock().unwrap().process_bytes(&data);
            match event {
                VadEvent::SpeechStarted => {
                    if self.shared.model_speaking.load(Ordering::SeqCst) {
                        self.shared.interrupt().await;
                    }
                }
                VadEvent::EndOfTurn => end_of_turn = true,
                VadEvent::None => {}
            }
        }

        {
            let mut session = self.shared.session.lock().await;
            session
                .send_chunk(AudioChunk {
                    data,
                    sample_rate: self.sample_rate,
                    channels: self.channels,
                    mime: self.shared.mime.clone(),
                })
                .await
                .map_err(|e| self.duplex_error(e.to_string()))?;
        }

        if end_of_turn {
            self.end_of_turn().await?;
        }
        Ok(())
    }

    /// Explicitly mark the user-turn boundary (client-driven VAD mode
    /// exposes this; ASM callers never need it).
    pub async fn end_of_turn(&self) -> Result<(), RuntimeError> {
        // One user audio message per turn.
        let audio: Vec<u8> = std::mem::take(&mut *self.user_audio.lock().unwrap());
        if !audio.is_empty() {
            self.shared
                .append_messages(vec![Message::from_parts(
                    Role::User,
                    vec![Part::Media(MediaPart {
                        mime: self.shared.mime.clone(),
                        source: MediaSource::Inline { data: audio },
                    })],
                )])
                .await;
        }
        if let Some(vad) = &self.vad {
            vad.lock().unwrap().reset();
        }
        let mut session = self.shared.session.lock().await;
        session
            .send_end_of_stream()
            .await
            .map_err(|e| self.duplex_error(e.to_string()))
    }

    /// Turns completed so far.
    pub fn completed_turns(&self) -> u32 {
        self.shared.completed_turns.load(Ordering::SeqCst)
    }

    /// Detection mode this handle runs.
    pub fn detection(&self) -> &TurnDetection {
        &self.detection
    }

    /// Close the session and classify the outcome against the resilience
    /// rules.
    pub async fn finish(self) -> Result<DuplexSummary, RuntimeError> {
        {
            let mut session = self.shared.session.lock().await;
            let _ = session.close().await;
        }
        self.driver.abort();
        self.shared.bus.publish(
            self.shared
                .scope
                .event(EventType::StreamCompleted, serde_json::json!({"mode": "duplex"})),
        );

        let completed = self.shared.completed_turns.load(Ordering::SeqCst);
        let error = self.shared.session_error.lock().unwrap().clone();
        match error {
            None => Ok(DuplexSummary {
                completed_turns: completed,
                degraded: false,
            }),
            Some(message) => {
                let floor = self.shared.resilience.partial_success_min_turns;
                if floor == 0 {
                    // A zero floor never forgives mid-session termination.
                    return Err(RuntimeError::Duplex {
                        message,
                        completed_turns: completed,
                    });
                }
                let mid_turn = !self.shared.partial_text.lock().unwrap().is_empty();
                let forgiven = completed >= floor
                    || (self.shared.resilience.ignore_last_turn_session_end
                        && completed > 0
                        && !mid_turn);
                if forgiven {
                    Ok(DuplexSummary {
                        completed_turns: completed,
                        degraded: true,
                    })
                } else {
                    Err(RuntimeError::Duplex {
                        message,
                        completed_turns: completed,
                    })
                }
            }
        }
    }

    fn duplex_error(&self, message: String) -> RuntimeError {
        RuntimeError::Duplex {
            message,
            completed_turns: self.shared.completed_turns.load(Ordering::SeqCst),
        }
    }
}

/// Response-side driver: consumes provider elements, applies interruption
/// gating, runs mid-stream tool calls, persists turn transcripts, and
/// forwards everything to the caller.
async fn drive_responses(shared: Arc<DuplexShared>, mut responses: mpsc::Receiver<ResponseElement>) {
    let out_tx = shared.out_tx.clone();
    while let Some(element) = responses.recv().await {
        match element {
            ResponseElement::TextDelta(delta) => {
                if shared.interrupted.load(Ordering::SeqCst) {
                    continue;
                }
                shared.partial_text.lock().unwrap().push_str(&delta);
                let _ = out_tx.send(ResponseElement::TextDelta(delta)).await;
            }
            ResponseElement::AudioDelta(audio) => {
                if shared.interrupted.load(Ordering::SeqCst) {
                    // Drain buffered output for the interrupted turn.
                    continue;
                }
                shared.model_speaking.store(true, Ordering::SeqCst);
                let _ = out_tx.send(ResponseElement::AudioDelta(audio)).await;
            }
            ResponseElement::Transcription(text) => {
                let _ = out_tx.send(ResponseElement::Transcription(text)).await;
            }
            ResponseElement::Interrupted => {
                // interrupt() forwards the element itself.
                shared.interrupt().await;
            }
            ResponseElement::ToolCall(call) => {
                if shared.interrupted.load(Ordering::SeqCst) {
                    continue;
                }
                let _ = out_tx.send(ResponseElement::ToolCall(call.clone())).await;
                run_duplex_tool(&shared, call).await;
            }
            ResponseElement::FinishReason(reason) => {
                let partial = std::mem::take(&mut *shared.partial_text.lock().unwrap());
                if !partial.is_empty() {
                    shared.append_messages(vec![Message::assistant(partial)]).await;
                }
                shared.completed_turns.fetch_add(1, Ordering::SeqCst);
                shared.model_speaking.store(false, Ordering::SeqCst);
                shared.interrupted.store(false, Ordering::SeqCst);
                let _ = out_tx.send(ResponseElement::FinishReason(reason)).await;
                if shared.resilience.inter_turn_delay_ms > 0 {
                    tokio::time::sleep(std::time::Duration::from_millis(
                        shared.resilience.inter_turn_delay_ms,
                    ))
                    .await;
                }
            }
            ResponseElement::Error(message) => {
                let failures = shared.failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures <= shared.resilience.max_retries {
                    warn!(
                        "duplex turn failure {}/{}, continuing: {}",
                        failures, shared.resilience.max_retries, message
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(
                        shared.resilience.retry_delay_ms,
                    ))
                    .await;
                    continue;
                }
                *shared.session_error.lock().unwrap() = Some(message.clone());
                let _ = out_tx.send(ResponseElement::Error(message)).await;
                break;
            }
        }
    }
    debug!("duplex response driver ended");
}

async fn run_duplex_tool(shared: &Arc<DuplexShared>, call: crate::colloquy::message::ToolCallPart) {
    let cancel = shared.tool_cancel.lock().unwrap().clone();

    let arguments = match shared.registry.validate_arguments(&call.name, &call.arguments) {
        Ok(arguments) => arguments,
        Err(message) => {
            shared.bus.publish(shared.scope.event(
                EventType::ValidationFailed,
                serde_json::json!({"tool": call.name, "id": call.id, "error": message}),
            ));
            let result = crate::colloquy::message::ToolResultPart {
                tool_call_id: call.id.clone(),
                content: serde_json::Value::String(message),
                is_error: true,
            };
            let mut session = shared.session.lock().await;
            let _ = session.send_tool_result(result).await;
            return;
        }
    };

    shared.bus.publish(shared.scope.event(
        EventType::ToolCallStarted,
        serde_json::json!({"tool": call.name, "id": call.id, "duplex": true}),
    ));

    let execution = tokio::select! {
        _ = cancel.cancelled() => {
            // Interrupted mid-execution; the result is flushed, never sent.
            shared.bus.publish(shared.scope.event(
                EventType::ToolCallFailed,
                serde_json::json!({"tool": call.name, "id": call.id, "error": "flushed by interruption"}),
            ));
            return;
        }
        execution = shared.registry.dispatch(ToolInvocation {
            id: call.id.clone(),
            name: call.name.clone(),
            arguments,
            context: ToolContext {
                conversation_id: shared.conversation_id.clone(),
                variables: Default::default(),
            },
        }) => execution,
    };

    let outcome = match execution {
        ToolExecution::Completed(outcome) => outcome,
        ToolExecution::Pending { reason } => {
            // Approval gating does not suspend a live audio session; the
            // model is told immediately.
            crate::colloquy::tool_registry::ToolOutcome::error(format!(
                "tool '{}' requires approval and cannot run mid-stream: {}",
                call.name, reason
            ))
        }
    };

    shared.bus.publish(shared.scope.event(
        if outcome.is_error {
            EventType::ToolCallFailed
        } else {
            EventType::ToolCallCompleted
        },
        serde_json::json!({"tool": call.name, "id": call.id, "duplex": true}),
    ));

    if cancel.is_cancelled() {
        return;
    }
    let result = crate::colloquy::message::ToolResultPart {
        tool_call_id: call.id,
        content: outcome.content,
        is_error: outcome.is_error,
    };
    let mut session = shared.session.lock().await;
    let _ = session.send_tool_result(result).await;
}
