//! Duplex audio sessions: VAD turn detection, barge-in, resilience
//! classification, and mid-stream tools.

use colloquy::conversation::{Conversation, ConversationOptions};
use colloquy::duplex::{DuplexConfig, DuplexResilience, TurnDetection};
use colloquy::message::Role;
use colloquy::pack::Pack;
use colloquy::provider::{FinishReason, ResponseElement};
use colloquy::providers::mock::ScriptedProvider;
use colloquy::store::{MemoryStore, StateStore};
use colloquy::vad::VadConfig;
use std::sync::Arc;
use std::time::Duration;

fn plain_pack() -> Pack {
    Pack::from_json(
        r#"{"id": "p", "name": "p", "version": "1",
            "prompts": {"chat": {"id": "c"}}}"#,
    )
    .unwrap()
}

fn speech_bytes(ms: usize) -> Vec<u8> {
    let samples = ms * 16;
    (0..samples)
        .flat_map(|i| {
            let sample: i16 = if i % 2 == 0 { 8000 } else { -8000 };
            sample.to_le_bytes()
        })
        .collect()
}

fn silence_bytes(ms: usize) -> Vec<u8> {
    vec![0u8; ms * 16 * 2]
}

async fn duplex_conversation(
    provider: ScriptedProvider,
    store: Arc<dyn StateStore>,
    resilience: DuplexResilience,
) -> Arc<Conversation> {
    let mut options = ConversationOptions::default();
    options.provider = Some(Arc::new(provider));
    options.state_store = Some(store);
    options.duplex = Some(DuplexConfig {
        detection: TurnDetection::Vad(VadConfig {
            silence_threshold_ms: 500,
            min_speech_ms: 200,
            ..VadConfig::default()
        }),
        resilience,
        ..DuplexConfig::default()
    });
    Conversation::open(plain_pack(), "chat", options).await.unwrap()
}

#[tokio::test]
async fn vad_turn_produces_text_and_persists_transcript() {
    colloquy::init_logger();
    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
    let provider = ScriptedProvider::new("mock").duplex_turn(vec![
        ResponseElement::TextDelta("Sure, ".into()),
        ResponseElement::TextDelta("done.".into()),
        ResponseElement::FinishReason(FinishReason::Stop),
    ]);
    let conversation =
        duplex_conversation(provider, store.clone(), DuplexResilience::default()).await;

    let handle = conversation.open_duplex().await.unwrap();
    let mut responses = handle.responses().unwrap();

    // 1.2 s of speech in 20 ms frames, then 800 ms of silence. The VAD
    // must emit end-of-turn exactly once, at the 500 ms silence mark.
    for _ in 0..60 {
        handle.send_audio(speech_bytes(20)).await.unwrap();
    }
    for _ in 0..40 {
        handle.send_audio(silence_bytes(20)).await.unwrap();
    }

    let mut text = String::new();
    let mut finished = false;
    while let Ok(Some(element)) =
        tokio::time::timeout(Duration::from_secs(2), responses.recv()).await
    {
        match element {
            ResponseElement::TextDelta(delta) => text.push_str(&delta),
            ResponseElement::FinishReason(_) => {
                finished = true;
                break;
            }
            other => panic!("unexpected element: {:?}", other),
        }
    }
    assert!(finished);
    assert_eq!(text, "Sure, done.");
    assert_eq!(handle.completed_turns(), 1);

    // Wait for the driver's store writes to land.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let state = store.load(conversation.id()).await.unwrap();
    assert_eq!(state.messages.len(), 2);
    assert_eq!(state.messages[0].role, Role::User);
    assert!(state.messages[0].has_media());
    assert_eq!(state.messages[1].role, Role::Assistant);
    assert_eq!(state.messages[1].text(), "Sure, done.");

    let summary = handle.finish().await.unwrap();
    assert_eq!(summary.completed_turns, 1);
    assert!(!summary.degraded);
}

#[tokio::test]
async fn barge_in_interrupts_and_persists_partial_text() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
    // First turn: the model starts speaking (audio) and produces partial
    // text but never finishes.
    let provider = ScriptedProvider::new("mock").duplex_turn(vec![
        ResponseElement::AudioDelta(vec![0u8; 640]),
        ResponseElement::TextDelta("I was going to say".into()),
    ]);
    let conversation =
        duplex_conversation(provider, store.clone(), DuplexResilience::default()).await;

    let handle = conversation.open_duplex().await.unwrap();
    let mut responses = handle.responses().unwrap();

    // Complete a user turn so the scripted response starts flowing.
    for _ in 0..20 {
        handle.send_audio(speech_bytes(20)).await.unwrap();
    }
    for _ in 0..30 {
        handle.send_audio(silence_bytes(20)).await.unwrap();
    }
    // Let the driver consume the audio + text deltas.
    let first = tokio::time::timeout(Duration::from_secs(2), responses.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(first, ResponseElement::AudioDelta(_)));
    let second = tokio::time::timeout(Duration::from_secs(2), responses.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(second, ResponseElement::TextDelta(_)));

    // The user barges in while the model is mid-response.
    for _ in 0..20 {
        handle.send_audio(speech_bytes(20)).await.unwrap();
    }
    let mut saw_interrupted = false;
    while let Ok(Some(element)) =
        tokio::time::timeout(Duration::from_millis(500), responses.recv()).await
    {
        if matches!(element, ResponseElement::Interrupted) {
            saw_interrupted = true;
            break;
        }
    }
    assert!(saw_interrupted);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let state = store.load(conversation.id()).await.unwrap();
    // The partial assistant text was written to the store.
    assert!(state
        .messages
        .iter()
        .any(|m| m.role == Role::Assistant && m.text() == "I was going to say"));
}

#[tokio::test]
async fn zero_partial_success_floor_fails_on_session_error() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
    let provider = ScriptedProvider::new("mock").duplex_turn(vec![
        ResponseElement::TextDelta("hi".into()),
        ResponseElement::FinishReason(FinishReason::Stop),
        ResponseElement::Error("connection lost".into()),
    ]);
    let resilience = DuplexResilience {
        max_retries: 0,
        partial_success_min_turns: 0,
        ..DuplexResilience::default()
    };
    let conversation = duplex_conversation(provider, store, resilience).await;
    let handle = conversation.open_duplex().await.unwrap();
    let mut responses = handle.responses().unwrap();

    for _ in 0..20 {
        handle.send_audio(speech_bytes(20)).await.unwrap();
    }
    for _ in 0..30 {
        handle.send_audio(silence_bytes(20)).await.unwrap();
    }
    // Drain until the channel closes on the error.
    while let Ok(Some(_)) =
        tokio::time::timeout(Duration::from_secs(2), responses.recv()).await
    {}

    let err = handle.finish().await.unwrap_err();
    assert!(matches!(
        err,
        colloquy::RuntimeError::Duplex { completed_turns: 1, .. }
    ));
}

#[tokio::test]
async fn partial_success_floor_forgives_late_errors() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
    let provider = ScriptedProvider::new("mock").duplex_turn(vec![
        ResponseElement::TextDelta("turn one".into()),
        ResponseElement::FinishReason(FinishReason::Stop),
        ResponseElement::Error("dropped at the end".into()),
    ]);
    let resilience = DuplexResilience {
        max_retries: 0,
        partial_success_min_turns: 1,
        ..DuplexResilience::default()
    };
    let conversation = duplex_conversation(provider, store, resilience).await;
    let handle = conversation.open_duplex().await.unwrap();
    let mut responses = handle.responses().unwrap();

    for _ in 0..20 {
        handle.send_audio(speech_bytes(20)).await.unwrap();
    }
    for _ in 0..30 {
        handle.send_audio(silence_bytes(20)).await.unwrap();
    }
    while let Ok(Some(_)) =
        tokio::time::timeout(Duration::from_secs(2), responses.recv()).await
    {}

    let summary = handle.finish().await.unwrap();
    assert_eq!(summary.completed_turns, 1);
    assert!(summary.degraded);
}

#[tokio::test]
async fn mid_stream_tool_call_is_executed_and_fed_back() {
    let pack = Pack::from_json(
        r#"{
        "id": "p", "name": "p", "version": "1",
        "prompts": {"chat": {"id": "c", "tool_refs": ["lookup"]}},
        "tools": [{
            "name": "lookup",
            "description": "Looks something up",
            "input_schema": {"type": "object"},
            "mode": "mock-static",
            "config": {"result": {"answer": 42}}
        }]
    }"#,
    )
    .unwrap();

    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
    let provider = ScriptedProvider::new("mock").duplex_turn(vec![
        ResponseElement::ToolCall(colloquy::message::ToolCallPart {
            id: "t1".into(),
            name: "lookup".into(),
            arguments: "{}".into(),
        }),
        ResponseElement::TextDelta("the answer is 42".into()),
        ResponseElement::FinishReason(FinishReason::Stop),
    ]);

    let mut options = ConversationOptions::default();
    options.provider = Some(Arc::new(provider));
    options.state_store = Some(store);
    options.duplex = Some(DuplexConfig::default());
    let conversation = Conversation::open(pack, "chat", options).await.unwrap();

    let handle = conversation.open_duplex().await.unwrap();
    let mut responses = handle.responses().unwrap();

    for _ in 0..20 {
        handle.send_audio(speech_bytes(20)).await.unwrap();
    }
    for _ in 0..30 {
        handle.send_audio(silence_bytes(20)).await.unwrap();
    }

    let mut saw_tool_call = false;
    let mut text = String::new();
    while let Ok(Some(element)) =
        tokio::time::timeout(Duration::from_secs(2), responses.recv()).await
    {
        match element {
            ResponseElement::ToolCall(call) => {
                saw_tool_call = true;
                assert_eq!(call.name, "lookup");
            }
            ResponseElement::TextDelta(delta) => text.push_str(&delta),
            ResponseElement::FinishReason(_) => break,
            other => panic!("unexpected element: {:?}", other),
        }
    }
    assert!(saw_tool_call);
    assert_eq!(text, "the answer is 42");
    handle.finish().await.unwrap();
}
