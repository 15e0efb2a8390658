//! Outgoing context construction.
//!
//! Builds the message sequence sent to the provider from three tiers:
//! stored summaries (prepended as system messages), semantically retrieved
//! older messages (spliced in chronological order between the summary
//! prefix and the hot window, deduplicated against both), and the hot
//! window of the last N messages. A separate token budget can further
//! truncate the result, either by dropping oldest-first (`Sliding`) or by
//! embedding similarity against a configurable query (`Relevance`).

use log::warn;
use std::collections::HashSet;
use std::sync::Arc;

use crate::colloquy::error::{BoxError, RuntimeError};
use crate::colloquy::message::{Message, Role};
use crate::colloquy::provider::Provider;
use crate::colloquy::store::{cosine_similarity, StateStore};

/// How the token budget shrinks an over-size context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TruncationStrategy {
    /// Drop oldest non-system messages first.
    #[default]
    Sliding,
    /// Drop lowest-similarity messages first.
    Relevance,
}

/// What the relevance query is computed from.
#[derive(Debug, Clone, PartialEq)]
pub enum QuerySource {
    /// The text of the last user message.
    LastUser,
    /// Concatenated text of the last `n` messages.
    LastN(usize),
    /// Fixed text.
    Custom(String),
}

/// Semantic-retrieval configuration.
#[derive(Debug, Clone)]
pub struct RetrievalOptions {
    /// Maximum retrieved messages.
    pub top_k: usize,
    /// Query source for the retrieval embedding.
    pub query_source: QuerySource,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            top_k: 4,
            query_source: QuerySource::LastUser,
        }
    }
}

/// Token-budget truncation configuration.
#[derive(Debug, Clone)]
pub struct BudgetOptions {
    /// Budget in tokens (estimated where the provider reports none).
    pub token_budget: u32,
    /// Truncation strategy.
    pub strategy: TruncationStrategy,
    /// Most-recent messages that are never dropped.
    pub min_recent: usize,
    /// Keep system-role messages regardless of score or age.
    pub always_keep_system: bool,
    /// Messages scoring at or above this similarity are dropped last.
    pub similarity_threshold: f32,
    /// Query source for relevance scoring.
    pub query_source: QuerySource,
}

impl BudgetOptions {
    /// Sliding-window truncation at the given budget.
    pub fn sliding(token_budget: u32) -> Self {
        Self {
            token_budget,
            strategy: TruncationStrategy::Sliding,
            min_recent: 2,
            always_keep_system: true,
            similarity_threshold: 0.0,
            query_source: QuerySource::LastUser,
        }
    }

    /// Relevance truncation at the given budget.
    pub fn relevance(token_budget: u32) -> Self {
        Self {
            strategy: TruncationStrategy::Relevance,
            ..Self::sliding(token_budget)
        }
    }
}

/// The assembled context plus per-tier counts for observability.
#[derive(Debug, Clone)]
pub struct AssembledContext {
    /// Final ordered message list, ending with the current user input.
    pub messages: Vec<Message>,
    /// Number of summary system-messages prepended.
    pub summary_count: usize,
    /// Number of retrieved older messages spliced in.
    pub retrieved_count: usize,
    /// Number of hot-window messages.
    pub hot_count: usize,
}

/// Resolve the query text for retrieval or relevance scoring.
pub fn query_text(source: &QuerySource, messages: &[Message]) -> String {
    match source {
        QuerySource::LastUser => messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.text())
            .unwrap_or_default(),
        QuerySource::LastN(n) => {
            let start = messages.len().saturating_sub(*n);
            messages[start..]
                .iter()
                .map(|m| m.text())
                .collect::<Vec<_>>()
                .join("\n")
        }
        QuerySource::Custom(text) => text.clone(),
    }
}

/// Build the outgoing context: summaries, retrieval, hot window, and the
/// current user input last.
///
/// `retrieval` carries the embedding provider alongside its options; it is
/// skipped (with a warning) when the store has no embedding index or the
/// embed call fails.
pub async fn assemble(
    store: Option<&Arc<dyn StateStore>>,
    conversation_id: &str,
    context_window: Option<usize>,
    retrieval: Option<(&Arc<dyn Provider>, &RetrievalOptions)>,
    user_message: Message,
) -> Result<AssembledContext, RuntimeError> {
    let mut summaries = Vec::new();
    let mut hot = Vec::new();

    if let Some(store) = store {
        summaries = match store.as_summary_store() {
            Some(summary_store) => summary_store
                .load_summaries(conversation_id)
                .await
                .map_err(RuntimeError::store)?,
            None => store
                .load(conversation_id)
                .await
                .map_err(RuntimeError::store)?
                .summaries,
        };

        hot = match context_window {
            Some(0) => Vec::new(),
            Some(n) => match store.as_message_reader() {
                Some(reader) => reader
                    .load_tail(conversation_id, n)
                    .await
                    .map_err(RuntimeError::store)?,
                None => {
                    let state = store.load(conversation_id).await.map_err(RuntimeError::store)?;
                    let start = state.messages.len().saturating_sub(n);
                    state.messages[start..].to_vec()
                }
            },
            None => {
                store
                    .load(conversation_id)
                    .await
                    .map_err(RuntimeError::store)?
                    .messages
            }
        };
    }

    // Messages already compressed into a summary never re-enter the hot
    // window tier.
    hot.retain(|m| m.summarized_into.is_none());

    let mut retrieved = Vec::new();
    if let (Some(store), Some((provider, options))) = (store, retrieval) {
        if let Some(index) = store.as_embedding_index() {
            let mut probe = hot.clone();
            probe.push(user_message.clone());
            let query = query_text(&options.query_source, &probe);
            match embed_one(provider, &query).await {
                Ok(embedding) => {
                    let hits = index
                        .search_older(
                            conversation_id,
                            context_window.unwrap_or(0),
                            &embedding,
                            options.top_k,
                        )
                        .await
                        .map_err(RuntimeError::store)?;
                    let hot_turns: HashSet<u64> =
                        hot.iter().filter_map(|m| m.turn_index).collect();
                    retrieved = hits
                        .into_iter()
                        .filter(|m| {
                            m.summarized_into.is_none()
                                && m.turn_index.map(|t| !hot_turns.contains(&t)).unwrap_or(true)
                        })
                        .collect::<Vec<_>>();
                    // Store returns similarity order; context wants time order.
                    retrieved.sort_by_key(|m| m.turn_index.unwrap_or(u64::MAX));
                }
                Err(err) => {
                    warn!("retrieval embedding failed, skipping retrieval: {}", err);
                }
            }
        }
    }

    let summary_count = summaries.len();
    let retrieved_count = retrieved.len();
    let hot_count = hot.len();

    let mut messages =
        Vec::with_capacity(summary_count + retrieved_count + hot_count + 1);
    for summary in summaries {
        messages.push(Message::system(summary.content));
    }
    messages.extend(retrieved);
    messages.extend(hot);
    messages.push(user_message);

    Ok(AssembledContext {
        messages,
        summary_count,
        retrieved_count,
        hot_count,
    })
}

/// Truncate an assembled context to the token budget.
///
/// The final message (current user input) and the `min_recent` most
/// recent messages are never dropped; system messages are kept when
/// `always_keep_system` is set. Relevance mode scores droppable messages
/// against the query embedding and sheds the least similar first, with
/// messages at or above `similarity_threshold` shed last.
pub async fn apply_budget(
    mut messages: Vec<Message>,
    options: &BudgetOptions,
    embedder: Option<&Arc<dyn Provider>>,
) -> Result<Vec<Message>, RuntimeError> {
    let total = |msgs: &[Message]| -> u64 { msgs.iter().map(|m| m.tokens() as u64).sum() };
    if total(&messages) <= options.token_budget as u64 {
        return Ok(messages);
    }

    let protected: HashSet<usize> = {
        let mut set = HashSet::new();
        let len = messages.len();
        for i in len.saturating_sub(options.min_recent.max(1))..len {
            set.insert(i);
        }
        if options.always_keep_system {
            for (i, m) in messages.iter().enumerate() {
                if m.role == Role::System {
                    set.insert(i);
                }
            }
        }
        set
    };

    // Positions we may shed, in drop order.
    let drop_order: Vec<usize> = match options.strategy {
        TruncationStrategy::Sliding => (0..messages.len())
            .filter(|i| !protected.contains(i))
            .collect(),
        TruncationStrategy::Relevance => {
            let Some(provider) = embedder else {
                warn!("relevance truncation without an embedding provider, falling back to sliding");
                return Box::pin(apply_budget(
                    messages,
                    &BudgetOptions {
                        strategy: TruncationStrategy::Sliding,
                        ..options.clone()
                    },
                    None,
                ))
                .await;
            };
            let query = query_text(&options.query_source, &messages);
            let query_embedding = embed_one(provider, &query)
                .await
                .map_err(|e| RuntimeError::Validation(format!("relevance embedding failed: {}", e)))?;

            let candidates: Vec<usize> = (0..messages.len())
                .filter(|i| !protected.contains(i))
                .collect();
            let texts: Vec<String> = candidates.iter().map(|&i| messages[i].text()).collect();
            let embeddings = provider
                .embed(&texts)
                .await
                .map_err(|e| RuntimeError::Validation(format!("relevance embedding failed: {}", e)))?;

            let mut scored: Vec<(usize, f32)> = candidates
                .iter()
                .zip(embeddings.iter())
                .map(|(&i, emb)| (i, cosine_similarity(&query_embedding, emb)))
                .collect();
            // Below-threshold messages shed first, lowest similarity
            // leading; above-threshold ones only if the budget still
            // does not fit.
            scored.sort_by(|a, b| {
                let a_keep = a.1 >= options.similarity_threshold;
                let b_keep = b.1 >= options.similarity_threshold;
                a_keep
                    .cmp(&b_keep)
                    .then(a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            });
            scored.into_iter().map(|(i, _)| i).collect()
        }
    };

    let mut to_drop: HashSet<usize> = HashSet::new();
    for index in drop_order {
        if total(&keep(&messages, &to_drop)) <= options.token_budget as u64 {
            break;
        }
        to_drop.insert(index);
    }

    messages = keep(&messages, &to_drop);
    Ok(messages)
}

fn keep(messages: &[Message], dropped: &HashSet<usize>) -> Vec<Message> {
    messages
        .iter()
        .enumerate()
        .filter(|(i, _)| !dropped.contains(i))
        .map(|(_, m)| m.clone())
        .collect()
}

async fn embed_one(provider: &Arc<dyn Provider>, text: &str) -> Result<Vec<f32>, BoxError> {
    let mut vectors = provider.embed(&[text.to_string()]).await?;
    if vectors.is_empty() {
        return Err("embedding provider returned no vectors".into());
    }
    Ok(vectors.remove(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::colloquy::providers::mock::ScriptedProvider;
    use crate::colloquy::store::{MemoryStore, MessageAppender, StateStore, Summary};
    use chrono::Utc;

    async fn seeded_store() -> Arc<dyn StateStore> {
        let store = MemoryStore::new();
        store
            .append_messages(
                "c1",
                (0..8)
                    .map(|i| {
                        if i % 2 == 0 {
                            Message::user(format!("user {}", i))
                        } else {
                            Message::assistant(format!("assistant {}", i))
                        }
                    })
                    .collect(),
            )
            .await
            .unwrap();
        Arc::new(store)
    }

    #[tokio::test]
    async fn summaries_lead_hot_window_trails() {
        let store = seeded_store().await;
        store
            .as_summary_store()
            .unwrap()
            .append_summary(
                "c1",
                Summary {
                    start_turn: 0,
                    end_turn: 3,
                    content: "early chatter".into(),
                    created_at: Utc::now(),
                },
            )
            .await
            .unwrap();

        let assembled = assemble(Some(&store), "c1", Some(4), None, Message::user("now"))
            .await
            .unwrap();

        assert_eq!(assembled.summary_count, 1);
        assert_eq!(assembled.hot_count, 4);
        assert_eq!(assembled.messages[0].role, Role::System);
        assert_eq!(assembled.messages[0].text(), "early chatter");
        let last = assembled.messages.last().unwrap();
        assert_eq!(last.text(), "now");
        // Hot window holds turns 4..8.
        assert_eq!(assembled.messages[1].turn_index, Some(4));
    }

    #[tokio::test]
    async fn zero_context_window_skips_hot_window() {
        let store = seeded_store().await;
        let assembled = assemble(Some(&store), "c1", Some(0), None, Message::user("q"))
            .await
            .unwrap();
        assert_eq!(assembled.hot_count, 0);
        assert_eq!(assembled.messages.len(), 1);
    }

    #[tokio::test]
    async fn no_window_loads_full_history() {
        let store = seeded_store().await;
        let assembled = assemble(Some(&store), "c1", None, None, Message::user("q"))
            .await
            .unwrap();
        assert_eq!(assembled.hot_count, 8);
    }

    #[tokio::test]
    async fn retrieval_splices_older_messages_chronologically() {
        let store = seeded_store().await;
        let index = store.as_embedding_index().unwrap();
        // Messages 1 and 3 are relevant to the query; the rest are not.
        for turn in 0..8u64 {
            let embedding = if turn == 1 || turn == 3 {
                vec![1.0, 0.0]
            } else {
                vec![0.0, 1.0]
            };
            index.index_message("c1", turn, embedding).await.unwrap();
        }

        let provider: Arc<dyn Provider> =
            Arc::new(ScriptedProvider::new("mock").with_embedding("query", vec![1.0, 0.0]));
        let options = RetrievalOptions {
            top_k: 2,
            query_source: QuerySource::Custom("query".into()),
        };

        let assembled = assemble(
            Some(&store),
            "c1",
            Some(2),
            Some((&provider, &options)),
            Message::user("now"),
        )
        .await
        .unwrap();

        assert_eq!(assembled.retrieved_count, 2);
        let turns: Vec<Option<u64>> = assembled.messages[..2].iter().map(|m| m.turn_index).collect();
        assert_eq!(turns, vec![Some(1), Some(3)]);
        // Followed by hot window (6, 7) and the user input.
        assert_eq!(assembled.messages[2].turn_index, Some(6));
    }

    #[tokio::test]
    async fn sliding_budget_drops_oldest_non_system() {
        let mut messages = vec![Message::system("keep me")];
        for i in 0..10 {
            messages.push(Message::user(format!(
                "message number {} with some padding text to cost tokens",
                i
            )));
        }
        let budget = BudgetOptions::sliding(60);
        let trimmed = apply_budget(messages, &budget, None).await.unwrap();

        assert_eq!(trimmed[0].role, Role::System);
        // Oldest user messages went first; the most recent survive.
        assert!(trimmed.iter().any(|m| m.text().contains("number 9")));
        assert!(!trimmed.iter().any(|m| m.text().contains("number 0")));
    }

    #[tokio::test]
    async fn relevance_budget_drops_least_similar() {
        let provider_impl = ScriptedProvider::new("mock")
            .with_embedding("the query", vec![1.0, 0.0])
            .with_embedding("on topic message with lots of relevant padding", vec![0.9, 0.1])
            .with_embedding("off topic message with lots of padding text!", vec![0.0, 1.0]);
        let provider: Arc<dyn Provider> = Arc::new(provider_impl);

        let messages = vec![
            Message::user("on topic message with lots of relevant padding"),
            Message::user("off topic message with lots of padding text!"),
            Message::user("final user message kept by min_recent rule"),
        ];
        let budget = BudgetOptions {
            token_budget: 25,
            min_recent: 1,
            query_source: QuerySource::Custom("the query".into()),
            ..BudgetOptions::relevance(25)
        };
        let trimmed = apply_budget(messages, &budget, Some(&provider)).await.unwrap();

        assert!(trimmed.iter().any(|m| m.text().starts_with("on topic")));
        assert!(!trimmed.iter().any(|m| m.text().starts_with("off topic")));
        assert!(trimmed.iter().any(|m| m.text().starts_with("final")));
    }
}
