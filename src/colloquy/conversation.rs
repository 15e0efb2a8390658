//! The conversation handle.
//!
//! [`Conversation`] is the single developer-facing entry point: open it
//! from a pack and a prompt name, then drive turns with [`send`] or
//! [`stream`]. The handle owns the turn pipeline, a per-conversation
//! variable scope, a tool registry with user-registered handlers, and the
//! suspension bookkeeping for approval-gated tools. Concurrent calls on
//! one conversation serialize on an internal turn lock; separate
//! conversations are fully independent even when they share a store,
//! provider, registry, or pack.
//!
//! # Example
//!
//! ```rust,no_run
//! use colloquy::conversation::{Conversation, ConversationOptions};
//! use colloquy::pack::Pack;
//! use colloquy::providers::mock::ScriptedProvider;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let pack = Pack::from_json(r#"{
//!     "id": "demo", "name": "demo", "version": "1",
//!     "prompts": {"chat": {"id": "c", "system_template": "You are {{persona}}.", "user_template": "{{q}}"}}
//! }"#)?;
//!
//! let mut options = ConversationOptions::default();
//! options.provider = Some(Arc::new(ScriptedProvider::new("mock").reply_text("pong")));
//! let conversation = Conversation::open(pack, "chat", options).await?;
//! conversation.set_var("persona", "echo-bot");
//! conversation.set_var("q", "ping");
//! let response = conversation.send("ping").await?;
//! assert_eq!(response.text, "pong");
//! # Ok(())
//! # }
//! ```

use log::warn;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::colloquy::context_assembly::{
    BudgetOptions, QuerySource, RetrievalOptions, TruncationStrategy,
};
use crate::colloquy::duplex::{DuplexConfig, DuplexHandle};
use crate::colloquy::error::RuntimeError;
use crate::colloquy::event::{EventBus, EventScope, EventSubscriber, EventType};
use crate::colloquy::mcp_registry::{McpExecutor, McpRegistry};
use crate::colloquy::media::{MediaPolicy, MediaStorage};
use crate::colloquy::message::{Message, Part, Role, ToolCallPart};
use crate::colloquy::pack::Pack;
use crate::colloquy::pipeline::{
    ContextAssemblyStage, IncrementalSaveStage, MediaPreprocessStage, Pipeline, PromptAssemblyStage,
    PromptOverrides, ProviderStage, Stage, SummarizeOptions, TemplateStage, TurnContext,
};
use crate::colloquy::provider::{GenerateParams, Provider, RetryPolicy, TokenUsage};
use crate::colloquy::providers::detect::{detect_provider, ProviderFactory, ProviderKind};
use crate::colloquy::template::VariableProvider;
use crate::colloquy::tool_executors::{ApprovalCheck, AsyncToolHandler, CtxToolHandler, ToolHandler};
use crate::colloquy::tool_loop::{PendingToolCall, ToolLoopRun, ToolPolicy};
use crate::colloquy::tool_registry::{
    ExecutionMode, HttpToolConfig, ToolContext, ToolDescriptor, ToolOutcome, ToolRegistry,
};
use crate::colloquy::store::StateStore;

/// One element of a [`Conversation::stream`] sequence.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    /// Incremental assistant text.
    Text(String),
    /// A tool call the model made (results are not replayed as text).
    ToolCall(ToolCallPart),
    /// The turn finished; no further chunks follow.
    Done,
    /// The turn failed; no further chunks follow.
    Error(String),
}

/// Whether a cancelled stream persists the partial assistant turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PartialSavePolicy {
    /// Only the user message is persisted (default).
    #[default]
    None,
    /// The user message and the partial assistant text are persisted.
    AssistantOnly,
}

/// Semantic-retrieval configuration for a conversation.
#[derive(Clone)]
pub struct RetrievalConfig {
    /// Embedding provider; defaults to the conversation's main provider.
    pub provider: Option<Arc<dyn Provider>>,
    /// Retrieval options.
    pub options: RetrievalOptions,
}

/// Auto-summarization configuration for a conversation.
#[derive(Clone)]
pub struct SummarizeConfig {
    /// Summary provider; defaults to the conversation's main provider.
    pub provider: Option<Arc<dyn Provider>>,
    /// Unsummarized message count above which summarization fires.
    pub threshold: usize,
    /// Messages compressed per summary.
    pub batch_size: usize,
}

/// Per-1k-token prices for cost accounting.
#[derive(Debug, Clone, Copy)]
pub struct ModelRate {
    /// Price per 1k input tokens.
    pub input_per_1k: f64,
    /// Price per 1k output tokens.
    pub output_per_1k: f64,
}

/// Model-name-keyed price table.
#[derive(Debug, Clone, Default)]
pub struct CostTable {
    rates: HashMap<String, ModelRate>,
}

impl CostTable {
    /// Empty table (all costs report zero).
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rate for a model.
    pub fn with_rate(mut self, model: impl Into<String>, rate: ModelRate) -> Self {
        self.rates.insert(model.into(), rate);
        self
    }

    /// Cost of a usage record under the given model, zero when unknown.
    pub fn cost(&self, model: &str, usage: &TokenUsage) -> f64 {
        match self.rates.get(model) {
            Some(rate) => {
                usage.input_tokens as f64 / 1000.0 * rate.input_per_1k
                    + usage.output_tokens as f64 / 1000.0 * rate.output_per_1k
            }
            None => 0.0,
        }
    }
}

/// A completed turn, handed to the eval dispatcher.
#[derive(Debug, Clone)]
pub struct TurnRecord {
    /// Conversation id.
    pub conversation_id: String,
    /// Prompt name that ran.
    pub prompt: String,
    /// Final assistant text.
    pub response_text: String,
    /// Usage for the turn.
    pub usage: TokenUsage,
}

/// Receives completed turns for evaluation. Delivery never fails the
/// turn.
pub trait EvalDispatcher: Send + Sync {
    /// Handle one completed turn.
    fn on_turn(&self, record: &TurnRecord);
}

/// Everything configurable at [`Conversation::open`].
///
/// Unknown string-keyed options (via [`apply_kv`](Self::apply_kv)) fail
/// synchronously.
#[derive(Clone, Default)]
pub struct ConversationOptions {
    /// Model override applied to every provider call.
    pub model: Option<String>,
    /// Temperature override.
    pub temperature: Option<f32>,
    /// Max-token override.
    pub max_tokens: Option<u32>,
    /// Explicit provider; skips detection.
    pub provider: Option<Arc<dyn Provider>>,
    /// Factories used when the provider is detected rather than given.
    pub provider_factories: HashMap<ProviderKind, Arc<dyn ProviderFactory>>,
    /// State store; without one the conversation is stateless.
    pub state_store: Option<Arc<dyn StateStore>>,
    /// Conversation id; generated when absent.
    pub conversation_id: Option<String>,
    /// Hot-window size (`None` = full history, `Some(0)` = none).
    pub context_window: Option<usize>,
    /// Semantic retrieval.
    pub retrieval: Option<RetrievalConfig>,
    /// Auto-summarization.
    pub auto_summarize: Option<SummarizeConfig>,
    /// Media storage for externalized bytes.
    pub media_storage: Option<Arc<dyn MediaStorage>>,
    /// Inline media above this many bytes is externalized.
    pub media_size_threshold: Option<usize>,
    /// Image preprocessing limits.
    pub media_policy: MediaPolicy,
    /// Variable providers pulled each turn, in order.
    pub variable_providers: Vec<Arc<dyn VariableProvider>>,
    /// Initial static variables.
    pub variables: HashMap<String, String>,
    /// Duplex mode configuration; `Some` replaces the provider stage with
    /// a duplex session for [`Conversation::open_duplex`].
    pub duplex: Option<DuplexConfig>,
    /// Token budget for the outgoing context.
    pub token_budget: Option<u32>,
    /// Truncation strategy under the token budget.
    pub truncation_strategy: TruncationStrategy,
    /// Tool policy.
    pub tool_policy: ToolPolicy,
    /// Retry policy for transient provider errors.
    pub retry: RetryPolicy,
    /// Partial-save policy for cancelled streams.
    pub partial_save: PartialSavePolicy,
    /// Price table for [`Response::cost`].
    pub cost_table: Option<CostTable>,
    /// Eval dispatcher hook.
    pub eval_dispatcher: Option<Arc<dyn EvalDispatcher>>,
    /// MCP servers to spawn and discover at open.
    pub mcp_servers: Vec<mcp::ServerConfig>,
    /// Event subscribers registered at open.
    pub subscribers: Vec<Arc<dyn EventSubscriber>>,
}

impl ConversationOptions {
    /// Apply a string-keyed option (config-file ingestion). Unknown keys
    /// fail synchronously.
    pub fn apply_kv(&mut self, key: &str, value: &str) -> Result<(), RuntimeError> {
        let parse_err =
            |k: &str, v: &str| RuntimeError::Validation(format!("option '{}': bad value '{}'", k, v));
        match key {
            "model" => self.model = Some(value.to_string()),
            "temperature" => {
                self.temperature = Some(value.parse().map_err(|_| parse_err(key, value))?)
            }
            "max_tokens" => {
                self.max_tokens = Some(value.parse().map_err(|_| parse_err(key, value))?)
            }
            "conversation_id" => self.conversation_id = Some(value.to_string()),
            "context_window" => {
                self.context_window = Some(value.parse().map_err(|_| parse_err(key, value))?)
            }
            "token_budget" => {
                self.token_budget = Some(value.parse().map_err(|_| parse_err(key, value))?)
            }
            "truncation_strategy" => {
                self.truncation_strategy = match value {
                    "sliding" => TruncationStrategy::Sliding,
                    "relevance" => TruncationStrategy::Relevance,
                    _ => return Err(parse_err(key, value)),
                }
            }
            "media_size_threshold" => {
                self.media_size_threshold = Some(value.parse().map_err(|_| parse_err(key, value))?)
            }
            "max_rounds" => {
                self.tool_policy.max_rounds = value.parse().map_err(|_| parse_err(key, value))?
            }
            "partial_save" => {
                self.partial_save = match value {
                    "none" => PartialSavePolicy::None,
                    "assistant_only" => PartialSavePolicy::AssistantOnly,
                    _ => return Err(parse_err(key, value)),
                }
            }
            other => return Err(RuntimeError::UnknownOption(other.to_string())),
        }
        Ok(())
    }
}

/// Result of a completed (or suspended) [`Conversation::send`].
#[derive(Debug, Clone)]
pub struct Response {
    /// Final assistant text.
    pub text: String,
    /// Tool calls made during the turn, in dispatch order.
    pub tool_calls: Vec<ToolCallPart>,
    /// Calls awaiting approval; non-empty means the turn is suspended.
    pub pending_tools: Vec<PendingToolCall>,
    /// Token accounting across all rounds.
    pub usage: TokenUsage,
    /// Cost under the configured [`CostTable`], zero without one.
    pub cost: f64,
    /// Turn index of the assistant message, when a store is configured.
    pub assistant_message_id: Option<u64>,
}

struct TurnSuspension {
    calls: HashMap<String, PendingToolCall>,
    order: Vec<String>,
    remaining: HashSet<String>,
    results: HashMap<String, Message>,
    messages: Vec<Message>,
    rounds: u32,
    usage: TokenUsage,
    params: GenerateParams,
    tool_names: Vec<String>,
    variables: HashMap<String, String>,
}

/// The conversation handle. See the module docs for an overview.
pub struct Conversation {
    id: String,
    session_id: String,
    pack: Arc<Pack>,
    prompt_name: String,
    provider: Arc<dyn Provider>,
    store: Option<Arc<dyn StateStore>>,
    registry: Arc<ToolRegistry>,
    mcp: Option<Arc<McpRegistry>>,
    bus: Arc<EventBus>,
    pipeline: Arc<Pipeline>,
    vars: Arc<StdRwLock<HashMap<String, String>>>,
    var_providers: Arc<StdRwLock<Vec<Arc<dyn VariableProvider>>>>,
    turn_lock: Mutex<()>,
    closed: AtomicBool,
    suspensions: StdMutex<HashMap<String, Arc<StdMutex<TurnSuspension>>>>,
    resolved_ids: StdMutex<HashSet<String>>,
    options: ConversationOptions,
}

impl std::fmt::Debug for Conversation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conversation")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("prompt_name", &self.prompt_name)
            .finish_non_exhaustive()
    }
}

impl Conversation {
    /// Open a conversation over a pack and prompt.
    ///
    /// Fails fast on configuration errors: unknown prompt, invalid pack
    /// tool schema, unresolvable provider, or a prompt `tool_ref` with no
    /// registered descriptor.
    pub async fn open(
        pack: Pack,
        prompt_name: impl Into<String>,
        options: ConversationOptions,
    ) -> Result<Arc<Self>, RuntimeError> {
        Self::open_internal(Arc::new(pack), prompt_name.into(), options, None).await
    }

    async fn open_internal(
        pack: Arc<Pack>,
        prompt_name: String,
        options: ConversationOptions,
        shared_mcp: Option<Arc<McpRegistry>>,
    ) -> Result<Arc<Self>, RuntimeError> {
        let prompt = pack
            .prompt(&prompt_name)
            .ok_or_else(|| RuntimeError::PromptNotFound(prompt_name.clone()))?
            .clone();

        let provider = match &options.provider {
            Some(provider) => Arc::clone(provider),
            None => {
                let kind = detect_provider(options.model.as_deref())
                    .ok_or(RuntimeError::ProviderNotDetected)?;
                let factory = options
                    .provider_factories
                    .get(&kind)
                    .ok_or(RuntimeError::ProviderNotDetected)?;
                factory
                    .create(options.model.as_deref())
                    .map_err(|e| RuntimeError::Provider {
                        message: e.to_string(),
                        attempts: 1,
                    })?
            }
        };

        let registry = Arc::new(ToolRegistry::new());
        for descriptor in &pack.tools {
            registry
                .register(descriptor.clone())
                .map_err(|e| RuntimeError::InvalidPack(e.to_string()))?;
        }

        // MCP servers spawn and discover now so the tool index exists
        // before the first turn.
        let mcp = if let Some(shared) = shared_mcp {
            Some(shared)
        } else if !options.mcp_servers.is_empty() {
            Some(Arc::new(McpRegistry::new(options.mcp_servers.clone())))
        } else {
            None
        };
        if let Some(mcp) = &mcp {
            registry.set_executor(Arc::new(McpExecutor::new(Arc::clone(mcp))));
            let tools = mcp.discover().await.map_err(|err| {
                RuntimeError::Validation(format!("mcp discovery failed: {}", err))
            })?;
            register_mcp_tools(&registry, tools);
        }

        for tool_ref in &prompt.tool_refs {
            if !registry.contains(tool_ref) {
                return Err(RuntimeError::ToolNotRegistered(tool_ref.clone()));
            }
        }

        let bus = Arc::new(EventBus::new());
        for subscriber in &options.subscribers {
            bus.subscribe(Arc::clone(subscriber));
        }

        let id = options
            .conversation_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let session_id = uuid::Uuid::new_v4().to_string();

        let vars = Arc::new(StdRwLock::new(options.variables.clone()));
        let var_providers = Arc::new(StdRwLock::new(options.variable_providers.clone()));

        let pipeline = build_pipeline(
            &pack,
            &provider,
            &registry,
            &options,
            &vars,
            &var_providers,
        );

        Ok(Arc::new(Self {
            id,
            session_id,
            pack,
            prompt_name,
            provider,
            store: options.state_store.clone(),
            registry,
            mcp,
            bus,
            pipeline: Arc::new(pipeline),
            vars,
            var_providers,
            turn_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            suspensions: StdMutex::new(HashMap::new()),
            resolved_ids: StdMutex::new(HashSet::new()),
            options,
        }))
    }

    /// Stable conversation id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The pack this conversation runs.
    pub fn pack(&self) -> &Arc<Pack> {
        &self.pack
    }

    /// The underlying event bus, for late subscriptions.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.bus
    }

    fn ensure_open(&self) -> Result<(), RuntimeError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(RuntimeError::ConversationClosed)
        } else {
            Ok(())
        }
    }

    fn new_scope(&self) -> EventScope {
        EventScope {
            run_id: uuid::Uuid::new_v4().to_string(),
            session_id: self.session_id.clone(),
            conversation_id: self.id.clone(),
        }
    }

    // ---- Variables ----

    /// Set one variable.
    pub fn set_var(&self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.write().unwrap().insert(name.into(), value.into());
    }

    /// Read one variable.
    pub fn get_var(&self, name: &str) -> Option<String> {
        self.vars.read().unwrap().get(name).cloned()
    }

    /// Set many variables.
    pub fn set_vars(&self, vars: impl IntoIterator<Item = (String, String)>) {
        self.vars.write().unwrap().extend(vars);
    }

    /// Import environment variables with the given prefix; the prefix is
    /// stripped and the remainder lowercased (`APP_USER_NAME` with prefix
    /// `APP_` becomes `user_name`).
    pub fn set_vars_from_env(&self, prefix: &str) {
        let mut vars = self.vars.write().unwrap();
        for (key, value) in std::env::vars() {
            if let Some(rest) = key.strip_prefix(prefix) {
                if !rest.is_empty() {
                    vars.insert(rest.to_ascii_lowercase(), value);
                }
            }
        }
    }

    /// Register a variable provider, pulled on each subsequent turn.
    pub fn add_variable_provider(&self, provider: Arc<dyn VariableProvider>) {
        self.var_providers.write().unwrap().push(provider);
    }

    // ---- Tool registration ----

    /// Register a synchronous tool handler, creating a permissive
    /// descriptor when the pack does not ship one. Replaces any prior
    /// handler of the same name.
    pub fn on_tool(&self, name: &str, handler: ToolHandler) -> Result<(), RuntimeError> {
        self.ensure_custom_descriptor(name)?;
        self.registry.custom_executor().register(name, handler);
        Ok(())
    }

    /// Register an async handler receiving the dispatch context.
    pub fn on_tool_ctx(&self, name: &str, handler: CtxToolHandler) -> Result<(), RuntimeError> {
        self.ensure_custom_descriptor(name)?;
        self.registry.custom_executor().register_ctx(name, handler);
        Ok(())
    }

    /// Register several synchronous handlers.
    pub fn on_tools(
        &self,
        handlers: impl IntoIterator<Item = (String, ToolHandler)>,
    ) -> Result<(), RuntimeError> {
        for (name, handler) in handlers {
            self.on_tool(&name, handler)?;
        }
        Ok(())
    }

    /// Register an approval-gated tool: `check` may suspend a call, and
    /// `body` runs on approval (or immediately when allowed).
    pub fn on_tool_async(
        &self,
        name: &str,
        check: ApprovalCheck,
        body: AsyncToolHandler,
    ) -> Result<(), RuntimeError> {
        if !self.registry.contains(name) {
            self.registry.register(ToolDescriptor::async_approval(
                name,
                format!("Approval-gated tool '{}'", name),
                serde_json::json!({"type": "object"}),
            ))?;
        }
        self.registry.approval_executor().register(name, check, body);
        Ok(())
    }

    /// Register an HTTP-backed tool.
    pub fn on_tool_http(
        &self,
        name: &str,
        description: &str,
        input_schema: serde_json::Value,
        config: HttpToolConfig,
    ) -> Result<(), RuntimeError> {
        self.registry
            .register(ToolDescriptor::http(name, description, input_schema, config))
    }

    fn ensure_custom_descriptor(&self, name: &str) -> Result<(), RuntimeError> {
        match self.registry.descriptor(name) {
            Some(descriptor) if descriptor.mode == ExecutionMode::Custom => Ok(()),
            Some(_) => Ok(()), // Pack descriptor stays authoritative.
            None => self.registry.register(ToolDescriptor::custom(
                name,
                format!("Custom tool '{}'", name),
                serde_json::json!({"type": "object"}),
            )),
        }
    }

    // ---- Turns ----

    /// Run one turn to completion.
    pub async fn send(&self, input: impl Into<String>) -> Result<Response, RuntimeError> {
        self.send_with(input.into(), Vec::new(), CancellationToken::new())
            .await
    }

    /// Run one turn with extra input parts (media) and a cancellation
    /// token. Cancelling before the save stage leaves the store
    /// untouched.
    pub async fn send_with(
        &self,
        text: String,
        parts: Vec<Part>,
        cancel: CancellationToken,
    ) -> Result<Response, RuntimeError> {
        self.ensure_open()?;
        let _turn = self.turn_lock.lock().await;
        let scope = self.new_scope();
        let mut ctx = TurnContext::new(
            self.id.clone(),
            scope,
            Arc::clone(&self.bus),
            cancel,
            self.prompt_name.clone(),
            text,
            parts,
        );
        self.pipeline.run(&mut ctx).await?;
        self.store_suspension(&ctx);
        let response = self.build_response(&ctx);
        self.dispatch_eval(&response);
        Ok(response)
    }

    /// Run one streaming turn. The returned sequence is lazy, finite, and
    /// non-restartable; it ends with `Done` or `Error`.
    pub fn stream(self: &Arc<Self>, input: impl Into<String>) -> ReceiverStream<StreamChunk> {
        self.stream_with(input.into(), Vec::new(), CancellationToken::new())
    }

    /// Streaming turn with explicit parts and cancellation. Cancelling
    /// closes the provider stream; by default only the user message is
    /// persisted (see [`PartialSavePolicy`]).
    pub fn stream_with(
        self: &Arc<Self>,
        text: String,
        parts: Vec<Part>,
        cancel: CancellationToken,
    ) -> ReceiverStream<StreamChunk> {
        let (tx, rx) = mpsc::channel(32);
        let conversation = Arc::clone(self);
        tokio::spawn(async move {
            if conversation.ensure_open().is_err() {
                let _ = tx
                    .send(StreamChunk::Error(RuntimeError::ConversationClosed.to_string()))
                    .await;
                return;
            }
            let _turn = conversation.turn_lock.lock().await;
            let scope = conversation.new_scope();
            conversation
                .bus
                .publish(scope.event(EventType::StreamStarted, serde_json::json!({})));

            // Text chunks pass through a recorder so a cancelled turn can
            // still persist the partial assistant text when configured.
            let partial_text = Arc::new(StdMutex::new(String::new()));
            let (inner_tx, mut inner_rx) = mpsc::channel::<StreamChunk>(32);
            let forward = {
                let tx = tx.clone();
                let partial_text = Arc::clone(&partial_text);
                tokio::spawn(async move {
                    while let Some(chunk) = inner_rx.recv().await {
                        if let StreamChunk::Text(delta) = &chunk {
                            partial_text.lock().unwrap().push_str(delta);
                        }
                        if tx.send(chunk).await.is_err() {
                            break;
                        }
                    }
                })
            };

            let mut ctx = TurnContext::new(
                conversation.id.clone(),
                scope.clone(),
                Arc::clone(&conversation.bus),
                cancel,
                conversation.prompt_name.clone(),
                text,
                parts,
            );
            ctx.stream_tx = Some(inner_tx);
            let result = conversation.pipeline.run(&mut ctx).await;
            ctx.stream_tx = None;
            let _ = forward.await;

            match result {
                Ok(()) => {
                    conversation.store_suspension(&ctx);
                    let response = conversation.build_response(&ctx);
                    conversation.dispatch_eval(&response);
                    conversation
                        .bus
                        .publish(scope.event(EventType::StreamCompleted, serde_json::json!({})));
                    let _ = tx.send(StreamChunk::Done).await;
                }
                Err(err) if err.is_cancelled() => {
                    conversation
                        .bus
                        .publish(scope.event(EventType::StreamCancelled, serde_json::json!({})));
                    let partial = partial_text.lock().unwrap().clone();
                    conversation.persist_cancelled_stream(&ctx, &partial).await;
                    let _ = tx.send(StreamChunk::Error("cancelled".to_string())).await;
                }
                Err(err) => {
                    conversation.bus.publish(scope.event(
                        EventType::StreamFailed,
                        serde_json::json!({"error": err.to_string()}),
                    ));
                    let _ = tx.send(StreamChunk::Error(err.to_string())).await;
                }
            }
        });
        ReceiverStream::new(rx)
    }

    /// The user message of a cancelled stream is persisted (it was fully
    /// received); the partial assistant text follows only under
    /// `AssistantOnly`.
    async fn persist_cancelled_stream(&self, ctx: &TurnContext, partial: &str) {
        let Some(store) = &self.store else { return };
        let Some(user_message) = ctx.user_message.clone() else {
            return;
        };
        let mut delta = vec![user_message];
        if self.options.partial_save == PartialSavePolicy::AssistantOnly && !partial.is_empty() {
            delta.push(Message::assistant(partial.to_string()));
        }
        if let Err(err) = append_to_store(store, &self.id, delta).await {
            warn!("post-cancellation save failed: {}", err);
        }
    }

    fn store_suspension(&self, ctx: &TurnContext) {
        if ctx.pending.is_empty() {
            return;
        }
        // The loop's message state at suspension: assembled context plus
        // everything produced this turn.
        let mut messages = ctx.outgoing.clone();
        messages.extend(ctx.outputs.iter().cloned());

        let order: Vec<String> = ctx.pending.iter().map(|p| p.id.clone()).collect();
        let suspension = Arc::new(StdMutex::new(TurnSuspension {
            calls: ctx
                .pending
                .iter()
                .map(|p| (p.id.clone(), p.clone()))
                .collect(),
            order: order.clone(),
            remaining: order.iter().cloned().collect(),
            results: HashMap::new(),
            messages,
            rounds: ctx.rounds,
            usage: ctx.usage.clone(),
            params: ctx.params.clone(),
            tool_names: ctx.tool_names.clone(),
            variables: ctx.variables.clone(),
        }));
        let mut suspensions = self.suspensions.lock().unwrap();
        for id in order {
            suspensions.insert(id, Arc::clone(&suspension));
        }
    }

    fn build_response(&self, ctx: &TurnContext) -> Response {
        let text = ctx
            .outputs
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.text())
            .unwrap_or_default();

        // The delta saved was [user] + outputs; map the last assistant
        // message to its assigned turn index.
        let assistant_message_id = ctx
            .outputs
            .iter()
            .rposition(|m| m.role == Role::Assistant)
            .and_then(|pos| ctx.appended_turns.get(pos + 1).copied());

        let cost = self
            .options
            .cost_table
            .as_ref()
            .map(|table| table.cost(self.provider.model_name(), &ctx.usage))
            .unwrap_or(0.0);

        Response {
            text,
            tool_calls: ctx.tool_calls.clone(),
            pending_tools: ctx.pending.clone(),
            usage: ctx.usage.clone(),
            cost,
            assistant_message_id,
        }
    }

    fn dispatch_eval(&self, response: &Response) {
        if let Some(dispatcher) = &self.options.eval_dispatcher {
            dispatcher.on_turn(&TurnRecord {
                conversation_id: self.id.clone(),
                prompt: self.prompt_name.clone(),
                response_text: response.text.clone(),
                usage: response.usage.clone(),
            });
        }
    }

    // ---- Async approval ----

    /// Approve a pending tool call: the deferred body executes, and once
    /// every pending call of the round is settled, the turn resumes and
    /// its Response is returned.
    pub async fn resolve_tool(&self, id: &str) -> Result<Option<Response>, RuntimeError> {
        self.complete_pending(id, None).await
    }

    /// Reject a pending tool call with a synthetic error tool-result.
    pub async fn reject_tool(
        &self,
        id: &str,
        reason: &str,
    ) -> Result<Option<Response>, RuntimeError> {
        self.complete_pending(id, Some(reason.to_string())).await
    }

    async fn complete_pending(
        &self,
        id: &str,
        rejection: Option<String>,
    ) -> Result<Option<Response>, RuntimeError> {
        self.ensure_open()?;
        let suspension = {
            let mut suspensions = self.suspensions.lock().unwrap();
            suspensions.remove(id)
        };
        let Some(suspension) = suspension else {
            return if self.resolved_ids.lock().unwrap().contains(id) {
                Err(RuntimeError::PendingAlreadyResolved(id.to_string()))
            } else {
                Err(RuntimeError::UnknownPendingTool(id.to_string()))
            };
        };
        self.resolved_ids.lock().unwrap().insert(id.to_string());

        let (name, arguments) = {
            let guard = suspension.lock().unwrap();
            let call = guard.calls.get(id).expect("suspension missing its call");
            (call.name.clone(), call.arguments.clone())
        };

        let outcome = match rejection {
            Some(reason) => ToolOutcome::error(format!("rejected: {}", reason)),
            None => {
                self.registry
                    .approval_executor()
                    .run_deferred(&name, arguments)
                    .await
            }
        };

        let resume = {
            let mut guard = suspension.lock().unwrap();
            guard
                .results
                .insert(id.to_string(), Message::tool_result(id, outcome.content, outcome.is_error));
            guard.remaining.remove(id);
            guard.remaining.is_empty()
        };
        if !resume {
            return Ok(None);
        }

        // Last pending call settled: resume the turn.
        let _turn = self.turn_lock.lock().await;
        let scope = self.new_scope();
        let (mut messages, result_messages, rounds, prior_usage, params, tool_names, variables) = {
            let mut guard = suspension.lock().unwrap();
            let order = guard.order.clone();
            let result_messages: Vec<Message> = order
                .iter()
                .filter_map(|id| guard.results.remove(id))
                .collect();
            (
                guard.messages.clone(),
                result_messages,
                guard.rounds,
                guard.usage.clone(),
                guard.params.clone(),
                guard.tool_names.clone(),
                guard.variables.clone(),
            )
        };

        if let Some(store) = &self.store {
            append_to_store(store, &self.id, result_messages.clone())
                .await
                .map_err(RuntimeError::store)?;
        }
        messages.extend(result_messages.clone());

        if rounds >= self.options.tool_policy.max_rounds {
            return Err(RuntimeError::MaxRoundsExceeded {
                rounds: self.options.tool_policy.max_rounds,
            });
        }

        let cancel = CancellationToken::new();
        let run = ToolLoopRun {
            provider: &self.provider,
            registry: &self.registry,
            policy: &self.options.tool_policy,
            params: &params,
            tool_names: &tool_names,
            context: ToolContext {
                conversation_id: self.id.clone(),
                variables,
            },
            scope: &scope,
            bus: &self.bus,
            cancel: &cancel,
            retry: &self.options.retry,
            stream_tx: None,
            start_round: rounds,
        };
        let outcome = run.run(messages).await?;

        let mut appended_turns = Vec::new();
        if let Some(store) = &self.store {
            appended_turns = append_to_store(store, &self.id, outcome.output_messages.clone())
                .await
                .map_err(RuntimeError::store)?;
        }

        let mut ctx_like = TurnContext::new(
            self.id.clone(),
            scope,
            Arc::clone(&self.bus),
            CancellationToken::new(),
            self.prompt_name.clone(),
            String::new(),
            Vec::new(),
        );
        ctx_like.outputs = outcome.output_messages;
        ctx_like.tool_calls = outcome.tool_calls;
        ctx_like.pending = outcome.pending;
        ctx_like.usage = prior_usage;
        ctx_like.usage.add(&outcome.usage);
        ctx_like.rounds = outcome.rounds;
        ctx_like.finish_reason = outcome.finish_reason;
        // The resume path appends outputs only (no user message), so the
        // turn map is offset by one relative to build_response's delta.
        ctx_like.appended_turns = std::iter::once(u64::MAX)
            .chain(appended_turns)
            .collect();

        self.store_suspension(&ctx_like);
        let response = self.build_response(&ctx_like);
        self.dispatch_eval(&response);
        Ok(Some(response))
    }

    // ---- History & lifecycle ----

    /// The persisted message log.
    pub async fn messages(&self) -> Result<Vec<Message>, RuntimeError> {
        let Some(store) = &self.store else {
            return Ok(Vec::new());
        };
        Ok(store
            .load(&self.id)
            .await
            .map_err(RuntimeError::store)?
            .messages)
    }

    /// Drop all persisted state for this conversation.
    pub async fn clear(&self) -> Result<(), RuntimeError> {
        if let Some(store) = &self.store {
            store.delete(&self.id).await.map_err(RuntimeError::store)?;
        }
        Ok(())
    }

    /// Fork into an independent conversation: same pack and provider,
    /// fresh variable and handler scope, history copied into a new
    /// conversation id. Future appends on either side are isolated.
    pub async fn fork(&self) -> Result<Arc<Self>, RuntimeError> {
        self.ensure_open()?;
        let mut options = self.options.clone();
        options.conversation_id = Some(uuid::Uuid::new_v4().to_string());
        options.provider = Some(Arc::clone(&self.provider));
        options.variables = self.vars.read().unwrap().clone();

        let fork = Self::open_internal(
            Arc::clone(&self.pack),
            self.prompt_name.clone(),
            options,
            self.mcp.clone(),
        )
        .await?;

        // Copy-at-fork: the child sees the parent's history as of now.
        if let Some(store) = &self.store {
            let state = store.load(&self.id).await.map_err(RuntimeError::store)?;
            store
                .save(fork.id(), state)
                .await
                .map_err(RuntimeError::store)?;
        }
        Ok(fork)
    }

    /// Open the duplex session for a conversation configured with duplex
    /// mode. The provider stage is bypassed for the session's lifetime.
    pub async fn open_duplex(&self) -> Result<DuplexHandle, RuntimeError> {
        self.ensure_open()?;
        let config = self
            .options
            .duplex
            .clone()
            .ok_or_else(|| RuntimeError::Validation("conversation not opened in duplex mode".into()))?;

        let prompt = self
            .pack
            .prompt(&self.prompt_name)
            .ok_or_else(|| RuntimeError::PromptNotFound(self.prompt_name.clone()))?;
        let statics = self.vars.read().unwrap().clone();
        let system = crate::colloquy::template::render(
            &prompt.system_template,
            &statics,
            &prompt.required_variables(),
        )?;

        DuplexHandle::open(
            &self.provider,
            config,
            if system.is_empty() { None } else { Some(system) },
            Arc::clone(&self.registry),
            self.store.clone(),
            self.id.clone(),
            Arc::clone(&self.bus),
            self.new_scope(),
        )
        .await
    }

    /// Close the conversation: waits for any in-flight turn, shuts down
    /// MCP clients, and stops event delivery. Subsequent operations fail
    /// with [`RuntimeError::ConversationClosed`].
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Drain the in-flight turn, if any.
        let _turn = self.turn_lock.lock().await;
        if let Some(mcp) = &self.mcp {
            mcp.close_all().await;
        }
        self.bus.close();
    }
}

fn register_mcp_tools(registry: &Arc<ToolRegistry>, tools: Vec<(String, mcp::ToolInfo)>) {
    for (server, info) in tools {
        if registry.contains(&info.name) {
            // Pack and user registrations win over discovery.
            continue;
        }
        let schema = if info.input_schema.is_object() {
            info.input_schema.clone()
        } else {
            serde_json::json!({"type": "object"})
        };
        let mut descriptor = ToolDescriptor::mcp(&info.name, &info.description, schema);
        descriptor.config.server = Some(server);
        if let Err(err) = registry.register(descriptor) {
            warn!("skipping mcp tool '{}': {}", info.name, err);
        }
    }
}

async fn append_to_store(
    store: &Arc<dyn StateStore>,
    conversation_id: &str,
    messages: Vec<Message>,
) -> Result<Vec<u64>, crate::colloquy::error::BoxError> {
    if messages.is_empty() {
        return Ok(Vec::new());
    }
    if let Some(appender) = store.as_message_appender() {
        return appender.append_messages(conversation_id, messages).await;
    }
    let mut state = store.load(conversation_id).await?;
    let mut indices = Vec::with_capacity(messages.len());
    for mut message in messages {
        let index = state.message_count;
        message.turn_index = Some(index);
        state.messages.push(message);
        state.message_count += 1;
        indices.push(index);
    }
    store.save(conversation_id, state).await?;
    Ok(indices)
}

fn build_pipeline(
    pack: &Arc<Pack>,
    provider: &Arc<dyn Provider>,
    registry: &Arc<ToolRegistry>,
    options: &ConversationOptions,
    vars: &Arc<StdRwLock<HashMap<String, String>>>,
    var_providers: &Arc<StdRwLock<Vec<Arc<dyn VariableProvider>>>>,
) -> Pipeline {
    let retrieval = options.retrieval.as_ref().map(|config| {
        (
            config.provider.clone().unwrap_or_else(|| Arc::clone(provider)),
            config.options.clone(),
        )
    });
    let budget = options.token_budget.map(|budget| BudgetOptions {
        token_budget: budget,
        strategy: options.truncation_strategy,
        min_recent: 2,
        always_keep_system: true,
        similarity_threshold: 0.0,
        query_source: QuerySource::LastUser,
    });
    let summarize = options.auto_summarize.as_ref().map(|config| SummarizeOptions {
        provider: config.provider.clone().unwrap_or_else(|| Arc::clone(provider)),
        threshold: config.threshold,
        batch_size: config.batch_size,
    });
    let index_embedder = retrieval.as_ref().map(|(provider, _)| Arc::clone(provider));

    let stages: Vec<Arc<dyn Stage>> = vec![
        Arc::new(PromptAssemblyStage::new(
            Arc::clone(pack),
            PromptOverrides {
                model: options.model.clone(),
                temperature: options.temperature,
                max_tokens: options.max_tokens,
            },
        )),
        Arc::new(TemplateStage::new(
            Arc::clone(vars),
            Arc::clone(var_providers),
            options.state_store.clone(),
        )),
        Arc::new(ContextAssemblyStage::new(
            options.state_store.clone(),
            options.context_window,
            retrieval,
            budget,
        )),
        Arc::new(MediaPreprocessStage::new(
            options.media_policy.clone(),
            options.media_storage.clone(),
            options.media_size_threshold,
        )),
        Arc::new(ProviderStage::new(
            Arc::clone(provider),
            Arc::clone(registry),
            options.tool_policy.clone(),
            options.retry.clone(),
        )),
        Arc::new(IncrementalSaveStage::new(
            options.state_store.clone(),
            summarize,
            index_embedder,
        )),
    ];
    Pipeline::new(stages)
}
