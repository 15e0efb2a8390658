//! Long-conversation context management: hot window, auto-summarization,
//! retrieval, and the store invariants they rely on.

use colloquy::conversation::{Conversation, ConversationOptions, RetrievalConfig, SummarizeConfig};
use colloquy::context_assembly::{QuerySource, RetrievalOptions};
use colloquy::message::Role;
use colloquy::pack::Pack;
use colloquy::providers::mock::ScriptedProvider;
use colloquy::store::{MemoryStore, StateStore};
use std::sync::Arc;

fn plain_pack() -> Pack {
    Pack::from_json(
        r#"{"id": "p", "name": "p", "version": "1",
            "prompts": {"chat": {"id": "c"}}}"#,
    )
    .unwrap()
}

#[tokio::test]
async fn long_conversation_summarizes_and_windows() {
    colloquy::init_logger();
    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());

    let mut provider = ScriptedProvider::new("mock");
    for i in 1..=9 {
        provider = provider.reply_text(format!("reply {}", i));
    }
    let provider = Arc::new(provider);

    let mut summarizer = ScriptedProvider::new("summarizer");
    for i in 1..=6 {
        summarizer = summarizer.reply_text(format!("summary {}", i));
    }

    let mut options = ConversationOptions::default();
    options.provider = Some(provider.clone() as Arc<dyn colloquy::Provider>);
    options.state_store = Some(store.clone());
    options.context_window = Some(4);
    options.auto_summarize = Some(SummarizeConfig {
        provider: Some(Arc::new(summarizer)),
        threshold: 6,
        batch_size: 4,
    });

    let conversation = Conversation::open(plain_pack(), "chat", options).await.unwrap();
    for i in 1..=8 {
        conversation.send(format!("turn {} user", i)).await.unwrap();
    }

    let state = store.load(conversation.id()).await.unwrap();
    assert_eq!(state.messages.len(), 16);

    // Turn indices are strictly increasing with no gaps.
    let turns: Vec<u64> = state.messages.iter().filter_map(|m| m.turn_index).collect();
    assert_eq!(turns, (0..16).collect::<Vec<u64>>());

    // Summaries exist, start at turn 0, and cover a contiguous
    // non-overlapping prefix in batch_size strides.
    assert!(!state.summaries.is_empty());
    assert_eq!(state.summaries[0].start_turn, 0);
    assert_eq!(state.summaries[0].end_turn, 3);
    let mut expected_start = 0;
    for summary in &state.summaries {
        assert_eq!(summary.start_turn, expected_start);
        assert_eq!(summary.end_turn, summary.start_turn + 3);
        expected_start = summary.end_turn + 1;
    }
    // Summarized messages carry the back-reference.
    let last_covered = state.summaries.last().unwrap().end_turn;
    for message in &state.messages {
        let turn = message.turn_index.unwrap();
        if turn <= last_covered {
            assert!(message.summarized_into.is_some());
        } else {
            assert!(message.summarized_into.is_none());
        }
    }

    // Turn 9: the context is summaries (as system messages) + the last 4
    // messages + the new user input.
    conversation.send("turn 9 user").await.unwrap();
    let requests = provider.recorded_requests();
    let request = requests.last().unwrap();

    let system_count = request.iter().filter(|m| m.role == Role::System).count();
    assert_eq!(system_count, state.summaries.len());
    for message in request.iter().take(system_count) {
        assert!(message.text().starts_with("summary"));
    }
    let non_system: Vec<_> = request.iter().filter(|m| m.role != Role::System).collect();
    assert_eq!(non_system.len(), 5); // hot window of 4 + new user input
    assert_eq!(non_system.last().unwrap().text(), "turn 9 user");
    // The hot window holds only unsummarized suffix messages.
    for message in &non_system[..4] {
        assert!(message.turn_index.unwrap() > last_covered);
    }
}

#[tokio::test]
async fn zero_context_window_sends_only_summaries_and_input() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
    let provider = Arc::new(
        ScriptedProvider::new("mock")
            .reply_text("a")
            .reply_text("b")
            .reply_text("c"),
    );
    let mut options = ConversationOptions::default();
    options.provider = Some(provider.clone() as Arc<dyn colloquy::Provider>);
    options.state_store = Some(store);
    options.context_window = Some(0);

    let conversation = Conversation::open(plain_pack(), "chat", options).await.unwrap();
    conversation.send("one").await.unwrap();
    conversation.send("two").await.unwrap();
    conversation.send("three").await.unwrap();

    let request = provider.recorded_requests().last().unwrap().clone();
    assert_eq!(request.len(), 1);
    assert_eq!(request[0].text(), "three");
}

#[tokio::test]
async fn token_budget_slides_out_old_messages() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
    let mut provider = ScriptedProvider::new("mock");
    for i in 1..=6 {
        provider = provider.reply_text(format!("assistant padding reply number {}", i));
    }
    let provider = Arc::new(provider);

    let mut options = ConversationOptions::default();
    options.provider = Some(provider.clone() as Arc<dyn colloquy::Provider>);
    options.state_store = Some(store);
    options.token_budget = Some(40);

    let conversation = Conversation::open(plain_pack(), "chat", options).await.unwrap();
    for i in 1..=6 {
        conversation
            .send(format!("user message with plenty of words {}", i))
            .await
            .unwrap();
    }

    let request = provider.recorded_requests().last().unwrap().clone();
    let total_tokens: u64 = request.iter().map(|m| m.tokens() as u64).sum();
    assert!(total_tokens <= 40, "context over budget: {}", total_tokens);
    // The newest user input always survives.
    assert!(request.last().unwrap().text().contains("6"));
}

#[tokio::test]
async fn retrieval_pulls_relevant_older_messages_into_context() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());

    // Embeddings: the favorite-color exchange matches the final question;
    // everything else is orthogonal.
    let mut provider = ScriptedProvider::new("mock")
        .with_embedding("my favorite color is teal", vec![1.0, 0.0])
        .with_embedding("noted, teal it is", vec![0.9, 0.1])
        .with_embedding("what was my favorite color?", vec![1.0, 0.0]);
    for reply in ["noted, teal it is", "fine", "fine", "fine", "teal"] {
        provider = provider.reply_text(reply);
    }
    let provider = Arc::new(provider);

    let mut options = ConversationOptions::default();
    options.provider = Some(provider.clone() as Arc<dyn colloquy::Provider>);
    options.state_store = Some(store);
    options.context_window = Some(2);
    options.retrieval = Some(RetrievalConfig {
        provider: None, // reuse the main provider's embeddings
        options: RetrievalOptions {
            top_k: 2,
            query_source: QuerySource::LastUser,
        },
    });

    let conversation = Conversation::open(plain_pack(), "chat", options).await.unwrap();
    conversation.send("my favorite color is teal").await.unwrap();
    conversation.send("talk about the weather").await.unwrap();
    conversation.send("and sports").await.unwrap();
    conversation.send("and food").await.unwrap();

    let response = conversation.send("what was my favorite color?").await.unwrap();
    assert_eq!(response.text, "teal");

    let request = provider.recorded_requests().last().unwrap().clone();
    // The early exchange was outside the 2-message hot window but must
    // have been retrieved back in, ahead of the hot window.
    let texts: Vec<String> = request.iter().map(|m| m.text()).collect();
    assert!(
        texts.iter().any(|t| t == "my favorite color is teal"),
        "retrieved message missing from context: {:?}",
        texts
    );
    let retrieved_pos = texts
        .iter()
        .position(|t| t == "my favorite color is teal")
        .unwrap();
    let hot_pos = texts.iter().position(|t| t == "and food").unwrap();
    assert!(retrieved_pos < hot_pos);
}

#[tokio::test]
async fn save_then_load_round_trips_messages_and_summaries() {
    let store = MemoryStore::new();
    let conversation_id = "round-trip";
    use colloquy::message::Message;
    use colloquy::store::{MessageAppender, Summary, SummaryStore};

    store
        .append_messages(
            conversation_id,
            vec![
                Message::user("q1"),
                Message::assistant("a1"),
                Message::user("q2"),
                Message::assistant("a2"),
            ],
        )
        .await
        .unwrap();
    store
        .append_summary(
            conversation_id,
            Summary {
                start_turn: 0,
                end_turn: 1,
                content: "first exchange".into(),
                created_at: chrono::Utc::now(),
            },
        )
        .await
        .unwrap();

    let state = store.load(conversation_id).await.unwrap();
    store.save(conversation_id, state.clone()).await.unwrap();
    let reloaded = store.load(conversation_id).await.unwrap();
    assert_eq!(reloaded.messages, state.messages);
    assert_eq!(reloaded.summaries, state.summaries);
}
