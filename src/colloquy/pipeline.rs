//! The turn pipeline.
//!
//! Each `send` or `stream` runs a fixed, ordered list of [`Stage`]s over a
//! mutable [`TurnContext`]: PromptAssembly resolves the pack prompt and
//! merges overrides, Template renders system/user text from the variable
//! map, ContextAssembly builds the outgoing message sequence,
//! MediaPreprocess bounds inline images, the Provider stage drives the
//! tool loop, and IncrementalSave appends the turn delta and triggers
//! auto-summarization. A stage error fails the turn, never the
//! conversation. Every stage emits `stage.started` / `stage.completed` /
//! `stage.failed` events with elapsed time.

use async_trait::async_trait;
use log::{error, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::colloquy::context_assembly::{self, BudgetOptions, RetrievalOptions};
use crate::colloquy::conversation::StreamChunk;
use crate::colloquy::error::RuntimeError;
use crate::colloquy::event::{EventBus, EventScope, EventType};
use crate::colloquy::media::{
    is_supported_image, preprocess_image, MediaPolicy, MediaStorage,
};
use crate::colloquy::message::{MediaSource, Message, Part, Role};
use crate::colloquy::pack::{Pack, Prompt};
use crate::colloquy::provider::{FinishReason, GenerateParams, Provider, RetryPolicy, TokenUsage};
use crate::colloquy::store::{StateStore, Summary};
use crate::colloquy::template::{self, VariableContext, VariableProvider};
use crate::colloquy::tool_loop::{PendingToolCall, ToolLoopRun, ToolPolicy};
use crate::colloquy::tool_registry::{ToolContext, ToolRegistry};
use crate::colloquy::message::ToolCallPart;

/// Mutable state threaded through the stages of one turn.
pub struct TurnContext {
    /// Conversation id.
    pub conversation_id: String,
    /// Event correlation ids for this run.
    pub scope: EventScope,
    /// Event bus.
    pub bus: Arc<EventBus>,
    /// Cancellation token for the turn.
    pub cancel: CancellationToken,
    /// Name of the prompt being run.
    pub prompt_name: String,
    /// Raw user input text.
    pub input_text: String,
    /// Additional input parts (media) supplied with the turn.
    pub input_parts: Vec<Part>,
    /// Stream sink for streaming turns.
    pub stream_tx: Option<mpsc::Sender<StreamChunk>>,

    // Filled by PromptAssembly.
    /// Resolved prompt.
    pub prompt: Option<Prompt>,
    /// Merged generation parameters.
    pub params: GenerateParams,
    /// Tools the prompt exposes.
    pub tool_names: Vec<String>,

    // Filled by Template.
    /// Resolved variables.
    pub variables: HashMap<String, String>,
    /// Rendered system text.
    pub system_text: String,
    /// Rendered user message (text plus input parts).
    pub user_message: Option<Message>,

    // Filled by ContextAssembly.
    /// The message sequence sent to the provider; ends with the user
    /// message.
    pub outgoing: Vec<Message>,

    // Filled by the provider stage.
    /// Messages produced this turn, in log order.
    pub outputs: Vec<Message>,
    /// Dispatched tool calls.
    pub tool_calls: Vec<ToolCallPart>,
    /// Calls suspended on approval.
    pub pending: Vec<PendingToolCall>,
    /// Accumulated usage.
    pub usage: TokenUsage,
    /// Rounds consumed.
    pub rounds: u32,
    /// Final finish reason.
    pub finish_reason: FinishReason,

    // Filled by IncrementalSave.
    /// Turn indices assigned to the appended messages.
    pub appended_turns: Vec<u64>,
}

impl TurnContext {
    /// Fresh context for a turn.
    pub fn new(
        conversation_id: String,
        scope: EventScope,
        bus: Arc<EventBus>,
        cancel: CancellationToken,
        prompt_name: String,
        input_text: String,
        input_parts: Vec<Part>,
    ) -> Self {
        Self {
            conversation_id,
            scope,
            bus,
            cancel,
            prompt_name,
            input_text,
            input_parts,
            stream_tx: None,
            prompt: None,
            params: GenerateParams::default(),
            tool_names: Vec::new(),
            variables: HashMap::new(),
            system_text: String::new(),
            user_message: None,
            outgoing: Vec::new(),
            outputs: Vec::new(),
            tool_calls: Vec::new(),
            pending: Vec::new(),
            usage: TokenUsage::default(),
            rounds: 0,
            finish_reason: FinishReason::Stop,
            appended_turns: Vec::new(),
        }
    }
}

/// One pipeline stage.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Stage name used in events and logs.
    fn name(&self) -> &str;

    /// Run the stage, mutating the turn context.
    async fn run(&self, ctx: &mut TurnContext) -> Result<(), RuntimeError>;
}

/// An ordered list of stages executed once per turn.
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
}

impl Pipeline {
    /// Build a pipeline from explicit stages.
    pub fn new(stages: Vec<Arc<dyn Stage>>) -> Self {
        Self { stages }
    }

    /// Run every stage in order. The first failure stops the pipeline and
    /// fails the turn.
    pub async fn run(&self, ctx: &mut TurnContext) -> Result<(), RuntimeError> {
        ctx.bus.publish(ctx.scope.event(
            EventType::PipelineStarted,
            serde_json::json!({"prompt": ctx.prompt_name}),
        ));
        for stage in &self.stages {
            if ctx.cancel.is_cancelled() {
                ctx.bus.publish(ctx.scope.event(
                    EventType::PipelineFailed,
                    serde_json::json!({"error": "cancelled", "stage": stage.name()}),
                ));
                return Err(RuntimeError::Cancelled);
            }
            ctx.bus.publish(ctx.scope.event(
                EventType::StageStarted,
                serde_json::json!({"stage": stage.name()}),
            ));
            let started = Instant::now();
            match stage.run(ctx).await {
                Ok(()) => {
                    ctx.bus.publish(ctx.scope.event(
                        EventType::StageCompleted,
                        serde_json::json!({
                            "stage": stage.name(),
                            "elapsed_ms": started.elapsed().as_millis() as u64,
                            "total_tokens": ctx.usage.total_tokens,
                        }),
                    ));
                }
                Err(err) => {
                    ctx.bus.publish(ctx.scope.event(
                        EventType::StageFailed,
                        serde_json::json!({
                            "stage": stage.name(),
                            "elapsed_ms": started.elapsed().as_millis() as u64,
                            "error": err.to_string(),
                        }),
                    ));
                    ctx.bus.publish(ctx.scope.event(
                        EventType::PipelineFailed,
                        serde_json::json!({"stage": stage.name(), "error": err.to_string()}),
                    ));
                    return Err(err);
                }
            }
        }
        ctx.bus.publish(ctx.scope.event(
            EventType::PipelineCompleted,
            serde_json::json!({
                "prompt": ctx.prompt_name,
                "rounds": ctx.rounds,
                "total_tokens": ctx.usage.total_tokens,
            }),
        ));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PromptAssembly
// ---------------------------------------------------------------------------

/// Per-conversation overrides merged over the prompt's parameters.
#[derive(Debug, Clone, Default)]
pub struct PromptOverrides {
    /// Model override.
    pub model: Option<String>,
    /// Temperature override.
    pub temperature: Option<f32>,
    /// Max-token override.
    pub max_tokens: Option<u32>,
}

/// Resolves the named prompt and merges call overrides.
pub struct PromptAssemblyStage {
    pack: Arc<Pack>,
    overrides: PromptOverrides,
}

impl PromptAssemblyStage {
    /// Build the stage.
    pub fn new(pack: Arc<Pack>, overrides: PromptOverrides) -> Self {
        Self { pack, overrides }
    }
}

#[async_trait]
impl Stage for PromptAssemblyStage {
    fn name(&self) -> &str {
        "prompt_assembly"
    }

    async fn run(&self, ctx: &mut TurnContext) -> Result<(), RuntimeError> {
        let prompt = self
            .pack
            .prompt(&ctx.prompt_name)
            .ok_or_else(|| RuntimeError::PromptNotFound(ctx.prompt_name.clone()))?
            .clone();

        ctx.params = GenerateParams {
            model: self.overrides.model.clone(),
            temperature: self.overrides.temperature.or(prompt.parameters.temperature),
            max_tokens: self.overrides.max_tokens.or(prompt.parameters.max_tokens),
            top_p: prompt.parameters.top_p,
        };
        ctx.tool_names = prompt.tool_refs.clone();
        ctx.prompt = Some(prompt);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Template
// ---------------------------------------------------------------------------

/// Renders the system and user templates from the variable map.
pub struct TemplateStage {
    statics: Arc<std::sync::RwLock<HashMap<String, String>>>,
    providers: Arc<std::sync::RwLock<Vec<Arc<dyn VariableProvider>>>>,
    store: Option<Arc<dyn StateStore>>,
}

impl TemplateStage {
    /// Build the stage over the conversation's variable scope.
    pub fn new(
        statics: Arc<std::sync::RwLock<HashMap<String, String>>>,
        providers: Arc<std::sync::RwLock<Vec<Arc<dyn VariableProvider>>>>,
        store: Option<Arc<dyn StateStore>>,
    ) -> Self {
        Self {
            statics,
            providers,
            store,
        }
    }
}

#[async_trait]
impl Stage for TemplateStage {
    fn name(&self) -> &str {
        "template"
    }

    async fn run(&self, ctx: &mut TurnContext) -> Result<(), RuntimeError> {
        let prompt = ctx.prompt.as_ref().expect("template before prompt assembly");
        let statics = self.statics.read().unwrap().clone();
        let providers = self.providers.read().unwrap().clone();
        let var_ctx = VariableContext {
            conversation_id: ctx.conversation_id.clone(),
            store: self.store.clone(),
        };
        let mut variables = template::resolve_variables(&statics, &providers, &var_ctx).await?;
        // The raw input is always addressable from the user template.
        variables
            .entry("input".to_string())
            .or_insert_with(|| ctx.input_text.clone());

        let required = prompt.required_variables();
        ctx.system_text = template::render(&prompt.system_template, &variables, &required)?;
        let rendered_user = template::render(&prompt.user_template, &variables, &required)?;
        let user_text = if rendered_user.trim().is_empty() {
            ctx.input_text.clone()
        } else {
            rendered_user
        };

        let mut parts = vec![Part::Text { text: user_text }];
        parts.extend(ctx.input_parts.clone());
        ctx.user_message = Some(Message::from_parts(Role::User, parts));
        ctx.variables = variables;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ContextAssembly
// ---------------------------------------------------------------------------

/// Builds the outgoing message sequence (summaries, retrieval, hot
/// window, token budget).
pub struct ContextAssemblyStage {
    store: Option<Arc<dyn StateStore>>,
    context_window: Option<usize>,
    retrieval: Option<(Arc<dyn Provider>, RetrievalOptions)>,
    budget: Option<BudgetOptions>,
}

impl ContextAssemblyStage {
    /// Build the stage.
    pub fn new(
        store: Option<Arc<dyn StateStore>>,
        context_window: Option<usize>,
        retrieval: Option<(Arc<dyn Provider>, RetrievalOptions)>,
        budget: Option<BudgetOptions>,
    ) -> Self {
        Self {
            store,
            context_window,
            retrieval,
            budget,
        }
    }
}

#[async_trait]
impl Stage for ContextAssemblyStage {
    fn name(&self) -> &str {
        "context_assembly"
    }

    async fn run(&self, ctx: &mut TurnContext) -> Result<(), RuntimeError> {
        let user_message = ctx
            .user_message
            .clone()
            .expect("context assembly before template");
        let retrieval = self
            .retrieval
            .as_ref()
            .map(|(provider, options)| (provider, options));

        let assembled = context_assembly::assemble(
            self.store.as_ref(),
            &ctx.conversation_id,
            self.context_window,
            retrieval,
            user_message,
        )
        .await?;

        ctx.bus.publish(ctx.scope.event(
            EventType::ContextAssembled,
            serde_json::json!({
                "messages": assembled.messages.len(),
                "summaries": assembled.summary_count,
                "retrieved": assembled.retrieved_count,
                "hot_window": assembled.hot_count,
            }),
        ));

        let mut messages = assembled.messages;
        if !ctx.system_text.is_empty() {
            messages.insert(0, Message::system(ctx.system_text.clone()));
        }
        if let Some(budget) = &self.budget {
            let embedder = self.retrieval.as_ref().map(|(p, _)| p);
            messages = context_assembly::apply_budget(messages, budget, embedder).await?;
        }
        ctx.outgoing = messages;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MediaPreprocess
// ---------------------------------------------------------------------------

/// Bounds inline images in the outgoing user message and externalizes
/// oversized media to storage.
pub struct MediaPreprocessStage {
    policy: MediaPolicy,
    storage: Option<Arc<dyn MediaStorage>>,
    externalize_threshold: Option<usize>,
}

impl MediaPreprocessStage {
    /// Build the stage.
    pub fn new(
        policy: MediaPolicy,
        storage: Option<Arc<dyn MediaStorage>>,
        externalize_threshold: Option<usize>,
    ) -> Self {
        Self {
            policy,
            storage,
            externalize_threshold,
        }
    }
}

#[async_trait]
impl Stage for MediaPreprocessStage {
    fn name(&self) -> &str {
        "media_preprocess"
    }

    async fn run(&self, ctx: &mut TurnContext) -> Result<(), RuntimeError> {
        let Some(user_message) = ctx.outgoing.last_mut() else {
            return Ok(());
        };
        if !user_message.has_media() {
            return Ok(());
        }

        for part in &mut user_message.parts {
            let Part::Media(media) = part else { continue };

            if is_supported_image(&media.mime) {
                if let MediaSource::Inline { data } = &media.source {
                    let before = data.len();
                    let processed = preprocess_image(data, &media.mime, &self.policy)
                        .map_err(|e| RuntimeError::Validation(e.to_string()))?;
                    if processed.changed {
                        ctx.bus.publish(ctx.scope.event(
                            EventType::MultimodalProcessed,
                            serde_json::json!({
                                "mime": processed.mime,
                                "before_bytes": before,
                                "after_bytes": processed.data.len(),
                                "width": processed.width,
                                "height": processed.height,
                            }),
                        ));
                        media.mime = processed.mime.clone();
                        media.source = MediaSource::Inline {
                            data: processed.data,
                        };
                    }
                }
            }

            // Externalize anything still inline and over the threshold.
            if let (Some(storage), Some(threshold)) =
                (self.storage.as_ref(), self.externalize_threshold)
            {
                if let MediaSource::Inline { data } = &media.source {
                    if data.len() > threshold {
                        let handle = storage
                            .put(&media.mime, data.clone())
                            .await
                            .map_err(RuntimeError::store)?;
                        media.source = MediaSource::Handle { handle };
                    }
                }
            }
        }

        // The user message in context mirrors what will be saved.
        ctx.user_message = Some(user_message.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Provider / tool loop stage
// ---------------------------------------------------------------------------

/// Drives the provider and tool loop over the assembled context.
pub struct ProviderStage {
    provider: Arc<dyn Provider>,
    registry: Arc<ToolRegistry>,
    policy: ToolPolicy,
    retry: RetryPolicy,
}

impl ProviderStage {
    /// Build the stage.
    pub fn new(
        provider: Arc<dyn Provider>,
        registry: Arc<ToolRegistry>,
        policy: ToolPolicy,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            provider,
            registry,
            policy,
            retry,
        }
    }
}

#[async_trait]
impl Stage for ProviderStage {
    fn name(&self) -> &str {
        "provider"
    }

    async fn run(&self, ctx: &mut TurnContext) -> Result<(), RuntimeError> {
        let run = ToolLoopRun {
            provider: &self.provider,
            registry: &self.registry,
            policy: &self.policy,
            params: &ctx.params,
            tool_names: &ctx.tool_names,
            context: ToolContext {
                conversation_id: ctx.conversation_id.clone(),
                variables: ctx.variables.clone(),
            },
            scope: &ctx.scope,
            bus: &ctx.bus,
            cancel: &ctx.cancel,
            retry: &self.retry,
            stream_tx: ctx.stream_tx.clone(),
            start_round: 0,
        };
        let outcome = run.run(ctx.outgoing.clone()).await?;

        ctx.outputs = outcome.output_messages;
        ctx.tool_calls = outcome.tool_calls;
        ctx.pending = outcome.pending;
        ctx.usage.add(&outcome.usage);
        ctx.rounds = outcome.rounds;
        ctx.finish_reason = outcome.finish_reason;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// IncrementalSave
// ---------------------------------------------------------------------------

/// Auto-summarization configuration.
#[derive(Clone)]
pub struct SummarizeOptions {
    /// Provider used to write summaries.
    pub provider: Arc<dyn Provider>,
    /// Total message count above which summarization fires.
    pub threshold: usize,
    /// Messages compressed per summary.
    pub batch_size: usize,
}

/// The fixed prompt sent to the summary provider.
pub const SUMMARIZATION_PROMPT: &str = "Summarize the following conversation segment. \
Preserve facts, names, decisions, and unresolved questions. Reply with the summary only.";

/// Appends the turn delta and runs auto-summarization.
pub struct IncrementalSaveStage {
    store: Option<Arc<dyn StateStore>>,
    summarize: Option<SummarizeOptions>,
    /// Embedding provider used to index appended messages for retrieval.
    index_embedder: Option<Arc<dyn Provider>>,
}

impl IncrementalSaveStage {
    /// Build the stage.
    pub fn new(
        store: Option<Arc<dyn StateStore>>,
        summarize: Option<SummarizeOptions>,
        index_embedder: Option<Arc<dyn Provider>>,
    ) -> Self {
        Self {
            store,
            summarize,
            index_embedder,
        }
    }

    async fn append(
        &self,
        store: &Arc<dyn StateStore>,
        conversation_id: &str,
        messages: Vec<Message>,
    ) -> Result<Vec<u64>, RuntimeError> {
        if let Some(appender) = store.as_message_appender() {
            return appender
                .append_messages(conversation_id, messages)
                .await
                .map_err(RuntimeError::store);
        }
        // Slow path: load-mutate-save with manual index assignment.
        let mut state = store
            .load(conversation_id)
            .await
            .map_err(RuntimeError::store)?;
        let mut indices = Vec::with_capacity(messages.len());
        for mut message in messages {
            let index = state.message_count;
            message.turn_index = Some(index);
            state.messages.push(message);
            state.message_count += 1;
            indices.push(index);
        }
        store
            .save(conversation_id, state)
            .await
            .map_err(RuntimeError::store)?;
        Ok(indices)
    }

    async fn maybe_summarize(&self, store: &Arc<dyn StateStore>, ctx: &TurnContext) {
        let Some(options) = &self.summarize else { return };
        let state = match store.load(&ctx.conversation_id).await {
            Ok(state) => state,
            Err(err) => {
                warn!("summarization skipped, load failed: {}", err);
                return;
            }
        };

        let last_end = state.summaries.last().map(|s| s.end_turn + 1).unwrap_or(0);
        let unsummarized = state.message_count.saturating_sub(last_end);
        if unsummarized as usize <= options.threshold
            || (unsummarized as usize) < options.batch_size
        {
            return;
        }

        let start = last_end;
        let end = start + options.batch_size as u64 - 1;
        let batch: Vec<&Message> = state
            .messages
            .iter()
            .filter(|m| m.turn_index.map(|t| t >= start && t <= end).unwrap_or(false))
            .collect();
        if batch.is_empty() {
            return;
        }

        let transcript: String = batch
            .iter()
            .map(|m| format!("{:?}: {}", m.role, m.text()))
            .collect::<Vec<_>>()
            .join("\n");
        let request = vec![
            Message::system(SUMMARIZATION_PROMPT),
            Message::user(transcript),
        ];
        let content = match options
            .provider
            .generate(&request, &[], &GenerateParams::default())
            .await
        {
            Ok(result) => result.message.text(),
            Err(err) => {
                warn!("summarization failed, turn unaffected: {}", err);
                return;
            }
        };

        let summary = Summary {
            start_turn: start,
            end_turn: end,
            content,
            created_at: chrono::Utc::now(),
        };
        let outcome = match store.as_summary_store() {
            Some(summary_store) => summary_store.append_summary(&ctx.conversation_id, summary).await,
            None => {
                // Fall back to whole-state mutation.
                match store.load(&ctx.conversation_id).await {
                    Ok(mut state) => {
                        state.summaries.push(summary);
                        store.save(&ctx.conversation_id, state).await
                    }
                    Err(err) => Err(err),
                }
            }
        };
        match outcome {
            Ok(()) => {
                ctx.bus.publish(ctx.scope.event(
                    EventType::ContextSummarized,
                    serde_json::json!({"start_turn": start, "end_turn": end}),
                ));
            }
            Err(err) => warn!("summary append failed, turn unaffected: {}", err),
        }
    }

    async fn maybe_index(
        &self,
        store: &Arc<dyn StateStore>,
        conversation_id: &str,
        messages: &[Message],
        indices: &[u64],
    ) {
        let Some(embedder) = &self.index_embedder else { return };
        let Some(index) = store.as_embedding_index() else { return };
        let texts: Vec<String> = messages.iter().map(|m| m.text()).collect();
        let embeddings = match embedder.embed(&texts).await {
            Ok(embeddings) => embeddings,
            Err(err) => {
                warn!("embedding index skipped: {}", err);
                return;
            }
        };
        for (turn, embedding) in indices.iter().zip(embeddings) {
            if let Err(err) = index.index_message(conversation_id, *turn, embedding).await {
                warn!("embedding index write failed for turn {}: {}", turn, err);
            }
        }
    }
}

#[async_trait]
impl Stage for IncrementalSaveStage {
    fn name(&self) -> &str {
        "incremental_save"
    }

    async fn run(&self, ctx: &mut TurnContext) -> Result<(), RuntimeError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let user_message = ctx
            .user_message
            .clone()
            .expect("incremental save before template");

        let mut delta = Vec::with_capacity(1 + ctx.outputs.len());
        delta.push(user_message);
        delta.extend(ctx.outputs.iter().cloned());

        match self.append(store, &ctx.conversation_id, delta.clone()).await {
            Ok(indices) => {
                ctx.appended_turns = indices.clone();
                ctx.bus.publish(ctx.scope.event(
                    EventType::MessageAppended,
                    serde_json::json!({"count": indices.len()}),
                ));
                ctx.bus.publish(ctx.scope.event(
                    EventType::StateSaved,
                    serde_json::json!({"turns": indices}),
                ));
                self.maybe_index(store, &ctx.conversation_id, &delta, &indices)
                    .await;
                self.maybe_summarize(store, ctx).await;
                Ok(())
            }
            Err(err) => {
                // The assistant response is still returned to the caller;
                // the failure is surfaced through events.
                error!("incremental save failed: {}", err);
                ctx.bus.publish(ctx.scope.event(
                    EventType::StateSaveFailed,
                    serde_json::json!({"error": err.to_string()}),
                ));
                Ok(())
            }
        }
    }
}
