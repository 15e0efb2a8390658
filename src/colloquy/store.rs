//! Conversation persistence.
//!
//! The pipeline talks to an injected [`StateStore`]. The mandatory surface
//! is whole-state load/save; stores that can do better expose optional
//! capability traits the pipeline probes at runtime — tail reads for the
//! hot window, atomic appends for incremental saves, a summary log, and an
//! embedding index for semantic retrieval. The bundled [`MemoryStore`]
//! implements all of them behind a mutex-guarded map; a Redis-backed store
//! would map appends to `RPUSH`, tail reads to `LRANGE -n -1`, and
//! summaries to a parallel list.
//!
//! Every mutation (`save`, `append_messages`, `append_summary`) is
//! linearizable per conversation id.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::colloquy::error::BoxError;
use crate::colloquy::message::Message;

/// A compressed representation of a contiguous message range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    /// First turn index covered (inclusive).
    pub start_turn: u64,
    /// Last turn index covered (inclusive).
    pub end_turn: u64,
    /// Summary text.
    pub content: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Full persisted state of one conversation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationState {
    /// Ordered message log.
    pub messages: Vec<Message>,
    /// Ordered summary log; ranges are contiguous, non-overlapping and
    /// cover a prefix of the message log.
    pub summaries: Vec<Summary>,
    /// Free-form metadata.
    pub metadata: HashMap<String, String>,
    /// Running count of messages ever appended (the next turn index).
    pub message_count: u64,
    /// Creation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Last-modified time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Mandatory persistence interface.
///
/// Implementations must be safe for concurrent callers; each conversation
/// id is its own synchronization domain. The `as_*` accessors expose the
/// optional fast paths; the default `None` makes the pipeline fall back to
/// whole-state load/mutate/save.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the full state for a conversation. Unknown ids yield an empty
    /// state.
    async fn load(&self, id: &str) -> Result<ConversationState, BoxError>;

    /// Persist the full state atomically with respect to `id`.
    async fn save(&self, id: &str, state: ConversationState) -> Result<(), BoxError>;

    /// Remove all state for `id`.
    async fn delete(&self, id: &str) -> Result<(), BoxError>;

    /// True when any state exists for `id`.
    async fn exists(&self, id: &str) -> Result<bool, BoxError>;

    /// Tail-read fast path, when supported.
    fn as_message_reader(&self) -> Option<&dyn MessageReader> {
        None
    }

    /// Atomic-append fast path, when supported.
    fn as_message_appender(&self) -> Option<&dyn MessageAppender> {
        None
    }

    /// Summary log fast path, when supported.
    fn as_summary_store(&self) -> Option<&dyn SummaryStore> {
        None
    }

    /// Semantic retrieval index, when supported.
    fn as_embedding_index(&self) -> Option<&dyn EmbeddingIndex> {
        None
    }
}

/// Tail reads without loading the whole state.
#[async_trait]
pub trait MessageReader: Send + Sync {
    /// Up to the last `n` messages, in log order.
    async fn load_tail(&self, id: &str, n: usize) -> Result<Vec<Message>, BoxError>;

    /// Number of messages appended so far.
    async fn message_count(&self, id: &str) -> Result<u64, BoxError>;
}

/// Atomic appends that assign turn indices.
#[async_trait]
pub trait MessageAppender: Send + Sync {
    /// Append messages atomically and return the assigned turn indices,
    /// strictly increasing with no gaps.
    async fn append_messages(&self, id: &str, msgs: Vec<Message>) -> Result<Vec<u64>, BoxError>;
}

/// Summary log access.
#[async_trait]
pub trait SummaryStore: Send + Sync {
    /// All summaries in range order.
    async fn load_summaries(&self, id: &str) -> Result<Vec<Summary>, BoxError>;

    /// Append a summary atomically.
    async fn append_summary(&self, id: &str, summary: Summary) -> Result<(), BoxError>;
}

/// Semantic retrieval over messages older than the hot window.
#[async_trait]
pub trait EmbeddingIndex: Send + Sync {
    /// Messages outside the last `hot_window` entries, ranked by cosine
    /// similarity to `query` descending, at most `top_k`. Callers re-sort
    /// chronologically before splicing into context.
    async fn search_older(
        &self,
        id: &str,
        hot_window: usize,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<Message>, BoxError>;

    /// Record the embedding for a stored message so it becomes searchable.
    async fn index_message(&self, id: &str, turn_index: u64, embedding: Vec<f32>)
        -> Result<(), BoxError>;
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StoredConversation {
    state: ConversationState,
    embeddings: HashMap<u64, Vec<f32>>,
}

/// In-memory store implementing every capability.
///
/// Suitable for tests, evaluation runs, and single-process deployments
/// that do not need durability.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<HashMap<String, StoredConversation>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self, id: &str) -> Result<ConversationState, BoxError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.get(id).map(|c| c.state.clone()).unwrap_or_default())
    }

    async fn save(&self, id: &str, mut state: ConversationState) -> Result<(), BoxError> {
        let now = Utc::now();
        if state.created_at.is_none() {
            state.created_at = Some(now);
        }
        state.updated_at = Some(now);
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entry(id.to_string()).or_default();
        entry.state = state;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), BoxError> {
        self.inner.lock().unwrap().remove(id);
        Ok(())
    }

    async fn exists(&self, id: &str) -> Result<bool, BoxError> {
        Ok(self.inner.lock().unwrap().contains_key(id))
    }

    fn as_message_reader(&self) -> Option<&dyn MessageReader> {
        Some(self)
    }

    fn as_message_appender(&self) -> Option<&dyn MessageAppender> {
        Some(self)
    }

    fn as_summary_store(&self) -> Option<&dyn SummaryStore> {
        Some(self)
    }

    fn as_embedding_index(&self) -> Option<&dyn EmbeddingIndex> {
        Some(self)
    }
}

#[async_trait]
impl MessageReader for MemoryStore {
    async fn load_tail(&self, id: &str, n: usize) -> Result<Vec<Message>, BoxError> {
        let inner = self.inner.lock().unwrap();
        let messages = inner
            .get(id)
            .map(|c| c.state.messages.as_slice())
            .unwrap_or(&[]);
        let start = messages.len().saturating_sub(n);
        Ok(messages[start..].to_vec())
    }

    async fn message_count(&self, id: &str) -> Result<u64, BoxError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.get(id).map(|c| c.state.message_count).unwrap_or(0))
    }
}

#[async_trait]
impl MessageAppender for MemoryStore {
    async fn append_messages(&self, id: &str, msgs: Vec<Message>) -> Result<Vec<u64>, BoxError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entry(id.to_string()).or_default();
        if entry.state.created_at.is_none() {
            entry.state.created_at = Some(now);
        }
        entry.state.updated_at = Some(now);

        let mut indices = Vec::with_capacity(msgs.len());
        for mut msg in msgs {
            let index = entry.state.message_count;
            msg.turn_index = Some(index);
            entry.state.messages.push(msg);
            entry.state.message_count += 1;
            indices.push(index);
        }
        Ok(indices)
    }
}

#[async_trait]
impl SummaryStore for MemoryStore {
    async fn load_summaries(&self, id: &str) -> Result<Vec<Summary>, BoxError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .get(id)
            .map(|c| c.state.summaries.clone())
            .unwrap_or_default())
    }

    async fn append_summary(&self, id: &str, summary: Summary) -> Result<(), BoxError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entry(id.to_string()).or_default();
        if let Some(last) = entry.state.summaries.last() {
            if summary.start_turn <= last.end_turn {
                return Err(format!(
                    "summary range [{}, {}] overlaps previous end {}",
                    summary.start_turn, summary.end_turn, last.end_turn
                )
                .into());
            }
        }
        let summary_index = entry.state.summaries.len() as u64;
        for msg in &mut entry.state.messages {
            if let Some(turn) = msg.turn_index {
                if turn >= summary.start_turn && turn <= summary.end_turn {
                    msg.summarized_into = Some(summary_index);
                }
            }
        }
        entry.state.summaries.push(summary);
        entry.state.updated_at = Some(Utc::now());
        Ok(())
    }
}

#[async_trait]
impl EmbeddingIndex for MemoryStore {
    async fn search_older(
        &self,
        id: &str,
        hot_window: usize,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<Message>, BoxError> {
        let inner = self.inner.lock().unwrap();
        let Some(conv) = inner.get(id) else {
            return Ok(Vec::new());
        };
        let older_end = conv.state.messages.len().saturating_sub(hot_window);
        let mut scored: Vec<(f32, &Message)> = conv.state.messages[..older_end]
            .iter()
            .filter_map(|m| {
                let turn = m.turn_index?;
                let emb = conv.embeddings.get(&turn)?;
                Some((cosine_similarity(query, emb), m))
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored
            .into_iter()
            .take(top_k)
            .map(|(_, m)| m.clone())
            .collect())
    }

    async fn index_message(
        &self,
        id: &str,
        turn_index: u64,
        embedding: Vec<f32>,
    ) -> Result<(), BoxError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entry(id.to_string()).or_default();
        entry.embeddings.insert(turn_index, embedding);
        Ok(())
    }
}

/// Cosine similarity; zero when either vector has zero magnitude or the
/// dimensions disagree.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    dot / (mag_a * mag_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_assigns_monotonic_indices() {
        let store = MemoryStore::new();
        let idx = store
            .append_messages("c1", vec![Message::user("a"), Message::assistant("b")])
            .await
            .unwrap();
        assert_eq!(idx, vec![0, 1]);

        let idx = store
            .append_messages("c1", vec![Message::user("c")])
            .await
            .unwrap();
        assert_eq!(idx, vec![2]);

        let state = store.load("c1").await.unwrap();
        assert_eq!(state.message_count, 3);
        let turns: Vec<u64> = state.messages.iter().filter_map(|m| m.turn_index).collect();
        assert_eq!(turns, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let store = MemoryStore::new();
        store
            .append_messages("c1", vec![Message::user("hello")])
            .await
            .unwrap();
        let state = store.load("c1").await.unwrap();
        store.save("c1", state.clone()).await.unwrap();
        let reloaded = store.load("c1").await.unwrap();
        assert_eq!(reloaded.messages, state.messages);
        assert_eq!(reloaded.summaries, state.summaries);
    }

    #[tokio::test]
    async fn overlapping_summary_is_rejected() {
        let store = MemoryStore::new();
        store
            .append_messages("c1", (0..6).map(|i| Message::user(format!("m{}", i))).collect())
            .await
            .unwrap();
        store
            .append_summary(
                "c1",
                Summary {
                    start_turn: 0,
                    end_turn: 3,
                    content: "first".into(),
                    created_at: Utc::now(),
                },
            )
            .await
            .unwrap();
        let err = store
            .append_summary(
                "c1",
                Summary {
                    start_turn: 2,
                    end_turn: 5,
                    content: "overlap".into(),
                    created_at: Utc::now(),
                },
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("overlaps"));
    }

    #[tokio::test]
    async fn summaries_backfill_summarized_into() {
        let store = MemoryStore::new();
        store
            .append_messages("c1", (0..4).map(|i| Message::user(format!("m{}", i))).collect())
            .await
            .unwrap();
        store
            .append_summary(
                "c1",
                Summary {
                    start_turn: 0,
                    end_turn: 1,
                    content: "s".into(),
                    created_at: Utc::now(),
                },
            )
            .await
            .unwrap();
        let state = store.load("c1").await.unwrap();
        assert_eq!(state.messages[0].summarized_into, Some(0));
        assert_eq!(state.messages[1].summarized_into, Some(0));
        assert_eq!(state.messages[2].summarized_into, None);
    }

    #[tokio::test]
    async fn tail_read_returns_suffix() {
        let store = MemoryStore::new();
        store
            .append_messages("c1", (0..5).map(|i| Message::user(format!("m{}", i))).collect())
            .await
            .unwrap();
        let tail = store.load_tail("c1", 2).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].text(), "m3");
        assert_eq!(tail[1].text(), "m4");

        // Larger than the log returns everything.
        assert_eq!(store.load_tail("c1", 50).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn search_older_excludes_hot_window() {
        let store = MemoryStore::new();
        store
            .append_messages("c1", (0..4).map(|i| Message::user(format!("m{}", i))).collect())
            .await
            .unwrap();
        for turn in 0..4u64 {
            store
                .index_message("c1", turn, vec![1.0, 0.0])
                .await
                .unwrap();
        }
        let hits = store
            .search_older("c1", 2, &[1.0, 0.0], 10)
            .await
            .unwrap();
        let turns: Vec<u64> = hits.iter().filter_map(|m| m.turn_index).collect();
        assert_eq!(turns.len(), 2);
        assert!(turns.iter().all(|t| *t < 2));
    }

    #[test]
    fn cosine_similarity_bounds() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }
}
