//! Built-in tool executors.
//!
//! One executor per [`ExecutionMode`](crate::tool_registry::ExecutionMode):
//! fixed mock results, argument-templated mocks, user-registered handler
//! functions (sync and async, with or without a context argument), an
//! HTTP executor with `${ENV_VAR}` secret expansion and response
//! redaction, and the approval-gated executor whose `check` function can
//! suspend a call until `resolve_tool`/`reject_tool` completes it. The
//! MCP executor lives with the client registry in
//! [`mcp_registry`](crate::mcp_registry).

use async_trait::async_trait;
use log::warn;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use crate::colloquy::error::BoxError;
use crate::colloquy::tool_registry::{
    ExecutionMode, ToolContext, ToolDescriptor, ToolExecution, ToolExecutor, ToolInvocation,
    ToolOutcome,
};

/// Boxed future used by async handler registrations.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Synchronous tool handler.
pub type ToolHandler =
    Arc<dyn Fn(serde_json::Value) -> Result<serde_json::Value, BoxError> + Send + Sync>;

/// Asynchronous tool handler.
pub type AsyncToolHandler = Arc<
    dyn Fn(serde_json::Value) -> BoxFuture<Result<serde_json::Value, BoxError>> + Send + Sync,
>;

/// Asynchronous tool handler that also receives the dispatch context.
pub type CtxToolHandler = Arc<
    dyn Fn(ToolContext, serde_json::Value) -> BoxFuture<Result<serde_json::Value, BoxError>>
        + Send
        + Sync,
>;

/// Decision returned by an approval check.
#[derive(Debug, Clone)]
pub enum ApprovalDecision {
    /// Execute immediately.
    Allow,
    /// Suspend the call and surface it on the Response.
    Pending {
        /// Why approval is needed.
        reason: String,
    },
}

/// Approval check run before an async-approval tool executes.
pub type ApprovalCheck = Arc<dyn Fn(&serde_json::Value) -> ApprovalDecision + Send + Sync>;

// ---------------------------------------------------------------------------
// Mock executors
// ---------------------------------------------------------------------------

/// Returns the descriptor's configured fixed result.
pub struct MockStaticExecutor;

#[async_trait]
impl ToolExecutor for MockStaticExecutor {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::MockStatic
    }

    async fn execute(
        &self,
        descriptor: &ToolDescriptor,
        _invocation: &ToolInvocation,
    ) -> Result<ToolExecution, BoxError> {
        let result = descriptor
            .config
            .result
            .clone()
            .ok_or_else(|| -> BoxError {
                format!("tool '{}' has no mock result configured", descriptor.name).into()
            })?;
        Ok(ToolExecution::Completed(ToolOutcome::ok(result)))
    }
}

/// Renders the descriptor's JSON template against the call arguments.
///
/// A string value that is exactly `"{{field}}"` is replaced by the typed
/// argument value; other strings get textual substitution.
pub struct MockTemplateExecutor;

#[async_trait]
impl ToolExecutor for MockTemplateExecutor {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::MockTemplate
    }

    async fn execute(
        &self,
        descriptor: &ToolDescriptor,
        invocation: &ToolInvocation,
    ) -> Result<ToolExecution, BoxError> {
        let template = descriptor
            .config
            .template
            .clone()
            .ok_or_else(|| -> BoxError {
                format!("tool '{}' has no template configured", descriptor.name).into()
            })?;
        let rendered = render_template_value(&template, &invocation.arguments);
        Ok(ToolExecution::Completed(ToolOutcome::ok(rendered)))
    }
}

fn render_template_value(
    template: &serde_json::Value,
    args: &serde_json::Value,
) -> serde_json::Value {
    match template {
        serde_json::Value::String(text) => {
            // Whole-value placeholder keeps the argument's JSON type.
            if text.starts_with("{{") && text.ends_with("}}") {
                let name = text[2..text.len() - 2].trim();
                if let Some(value) = args.get(name) {
                    return value.clone();
                }
            }
            let mut out = text.clone();
            if let Some(fields) = args.as_object() {
                for (key, value) in fields {
                    let needle = format!("{{{{{}}}}}", key);
                    if out.contains(&needle) {
                        let replacement = match value {
                            serde_json::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        out = out.replace(&needle, &replacement);
                    }
                }
            }
            serde_json::Value::String(out)
        }
        serde_json::Value::Array(items) => serde_json::Value::Array(
            items.iter().map(|v| render_template_value(v, args)).collect(),
        ),
        serde_json::Value::Object(fields) => serde_json::Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), render_template_value(v, args)))
                .collect(),
        ),
        other => other.clone(),
    }
}

// ---------------------------------------------------------------------------
// Custom executor
// ---------------------------------------------------------------------------

enum CustomHandler {
    Sync(ToolHandler),
    Async(AsyncToolHandler),
    Ctx(CtxToolHandler),
}

/// Dispatches to user-registered handler functions.
///
/// Registering a handler under an existing name replaces the previous
/// handler.
pub struct CustomExecutor {
    handlers: RwLock<HashMap<String, CustomHandler>>,
}

impl CustomExecutor {
    /// Create an empty executor.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a synchronous handler.
    pub fn register(&self, name: impl Into<String>, handler: ToolHandler) {
        self.handlers
            .write()
            .unwrap()
            .insert(name.into(), CustomHandler::Sync(handler));
    }

    /// Register an asynchronous handler.
    pub fn register_async(&self, name: impl Into<String>, handler: AsyncToolHandler) {
        self.handlers
            .write()
            .unwrap()
            .insert(name.into(), CustomHandler::Async(handler));
    }

    /// Register an asynchronous handler that receives the dispatch context.
    pub fn register_ctx(&self, name: impl Into<String>, handler: CtxToolHandler) {
        self.handlers
            .write()
            .unwrap()
            .insert(name.into(), CustomHandler::Ctx(handler));
    }

    /// Remove a handler.
    pub fn unregister(&self, name: &str) {
        self.handlers.write().unwrap().remove(name);
    }
}

impl Default for CustomExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolExecutor for CustomExecutor {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Custom
    }

    async fn execute(
        &self,
        descriptor: &ToolDescriptor,
        invocation: &ToolInvocation,
    ) -> Result<ToolExecution, BoxError> {
        // Clone the handler out so the lock is not held across await.
        let handler = {
            let handlers = self.handlers.read().unwrap();
            match handlers.get(&descriptor.name) {
                Some(CustomHandler::Sync(h)) => CustomHandler::Sync(Arc::clone(h)),
                Some(CustomHandler::Async(h)) => CustomHandler::Async(Arc::clone(h)),
                Some(CustomHandler::Ctx(h)) => CustomHandler::Ctx(Arc::clone(h)),
                None => {
                    return Ok(ToolExecution::Completed(ToolOutcome::error(format!(
                        "no handler registered for tool '{}'",
                        descriptor.name
                    ))))
                }
            }
        };

        let result = match handler {
            CustomHandler::Sync(h) => h(invocation.arguments.clone()),
            CustomHandler::Async(h) => h(invocation.arguments.clone()).await,
            CustomHandler::Ctx(h) => {
                h(invocation.context.clone(), invocation.arguments.clone()).await
            }
        };
        Ok(ToolExecution::Completed(match result {
            Ok(value) => ToolOutcome::ok(value),
            Err(err) => ToolOutcome::error(err.to_string()),
        }))
    }
}

// ---------------------------------------------------------------------------
// HTTP executor
// ---------------------------------------------------------------------------

/// Executes HTTP-mode tools with reqwest.
///
/// Headers may reference secrets as `${ENV_VAR}`; the expansion happens at
/// call time so rotated credentials are picked up. Top-level response
/// fields named in the descriptor's `redact` list are removed before the
/// result is returned (and therefore before it reaches the message log or
/// any event payload).
pub struct HttpExecutor {
    client: reqwest::Client,
}

impl HttpExecutor {
    /// Create an executor with a default client.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolExecutor for HttpExecutor {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Http
    }

    async fn execute(
        &self,
        descriptor: &ToolDescriptor,
        invocation: &ToolInvocation,
    ) -> Result<ToolExecution, BoxError> {
        let config = descriptor.config.http.as_ref().ok_or_else(|| -> BoxError {
            format!("tool '{}' has no http config", descriptor.name).into()
        })?;

        let mut request = match config.method.to_ascii_uppercase().as_str() {
            "GET" => {
                let mut req = self.client.get(&config.url);
                if let Some(fields) = invocation.arguments.as_object() {
                    let query: Vec<(String, String)> = fields
                        .iter()
                        .map(|(k, v)| {
                            let value = match v {
                                serde_json::Value::String(s) => s.clone(),
                                other => other.to_string(),
                            };
                            (k.clone(), value)
                        })
                        .collect();
                    req = req.query(&query);
                }
                req
            }
            "POST" => self.client.post(&config.url).json(&invocation.arguments),
            other => {
                return Ok(ToolExecution::Completed(ToolOutcome::error(format!(
                    "unsupported http method '{}'",
                    other
                ))))
            }
        };

        for (name, value) in &config.headers {
            match expand_env_refs(value) {
                Ok(expanded) => request = request.header(name, expanded),
                Err(missing) => {
                    return Ok(ToolExecution::Completed(ToolOutcome::error(format!(
                        "header '{}' references unset environment variable '{}'",
                        name, missing
                    ))))
                }
            }
        }

        let response = request.timeout(descriptor.timeout()).send().await?;
        let status = response.status();
        let body = response.text().await?;

        let mut content = match serde_json::from_str::<serde_json::Value>(&body) {
            Ok(value) => value,
            Err(_) => serde_json::Value::String(body),
        };
        if let Some(fields) = content.as_object_mut() {
            for key in &config.redact {
                if fields.remove(key).is_some() {
                    warn!("redacted field '{}' from tool '{}' response", key, descriptor.name);
                }
            }
        }

        if status.is_success() {
            Ok(ToolExecution::Completed(ToolOutcome::ok(content)))
        } else {
            Ok(ToolExecution::Completed(ToolOutcome::error(format!(
                "http status {}: {}",
                status.as_u16(),
                content
            ))))
        }
    }
}

/// Expand `${VAR}` references against the process environment. Returns the
/// name of the first unset variable on failure.
fn expand_env_refs(value: &str) -> Result<String, String> {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match std::env::var(name) {
                    Ok(v) => out.push_str(&v),
                    Err(_) => return Err(name.to_string()),
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    Ok(out)
}

// ---------------------------------------------------------------------------
// Async-approval executor
// ---------------------------------------------------------------------------

/// Approval-gated executor.
///
/// Each registered tool carries a `check` function and a deferred body.
/// When the check allows, the body runs inline like any other tool; when
/// it returns pending, the dispatch suspends and the tool loop surfaces
/// the pending entry on the Response for a later
/// `resolve_tool`/`reject_tool`.
pub struct AsyncApprovalExecutor {
    checks: RwLock<HashMap<String, ApprovalCheck>>,
    bodies: RwLock<HashMap<String, AsyncToolHandler>>,
}

impl AsyncApprovalExecutor {
    /// Create an empty executor.
    pub fn new() -> Self {
        Self {
            checks: RwLock::new(HashMap::new()),
            bodies: RwLock::new(HashMap::new()),
        }
    }

    /// Register the check and deferred body for a tool. Replaces prior
    /// registrations of the same name.
    pub fn register(&self, name: impl Into<String>, check: ApprovalCheck, body: AsyncToolHandler) {
        let name = name.into();
        self.checks.write().unwrap().insert(name.clone(), check);
        self.bodies.write().unwrap().insert(name, body);
    }

    /// Run the deferred body for a previously suspended call. Used by
    /// `resolve_tool`.
    pub async fn run_deferred(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> ToolOutcome {
        let body = self.bodies.read().unwrap().get(name).cloned();
        match body {
            Some(body) => match body(arguments).await {
                Ok(value) => ToolOutcome::ok(value),
                Err(err) => ToolOutcome::error(err.to_string()),
            },
            None => ToolOutcome::error(format!("no deferred body registered for '{}'", name)),
        }
    }
}

impl Default for AsyncApprovalExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolExecutor for AsyncApprovalExecutor {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::AsyncApproval
    }

    async fn execute(
        &self,
        descriptor: &ToolDescriptor,
        invocation: &ToolInvocation,
    ) -> Result<ToolExecution, BoxError> {
        let check = self.checks.read().unwrap().get(&descriptor.name).cloned();
        let decision = match check {
            Some(check) => check(&invocation.arguments),
            // No check registered means nothing gates execution.
            None => ApprovalDecision::Allow,
        };
        match decision {
            ApprovalDecision::Allow => {
                let outcome = self
                    .run_deferred(&descriptor.name, invocation.arguments.clone())
                    .await;
                Ok(ToolExecution::Completed(outcome))
            }
            ApprovalDecision::Pending { reason } => Ok(ToolExecution::Pending { reason }),
        }
    }
}
