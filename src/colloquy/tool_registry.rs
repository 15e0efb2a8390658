//! Tool descriptors, validation, and the registry.
//!
//! Tools are described by a [`ToolDescriptor`] — name, JSON-Schema input,
//! an execution mode, and mode-specific config — and dispatched through a
//! [`ToolRegistry`] that holds one executor per mode. Arguments arrive as
//! JSON strings from the provider; the registry re-parses and validates
//! them against the descriptor's compiled schema before dispatch, and an
//! argument mismatch becomes an error tool-result the model can recover
//! from rather than a turn failure.
//!
//! # Registering and dispatching
//!
//! ```rust,no_run
//! use colloquy::tool_registry::{ToolDescriptor, ToolRegistry};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let registry = ToolRegistry::new();
//! registry
//!     .register(ToolDescriptor::mock_static(
//!         "add",
//!         "Adds two numbers",
//!         serde_json::json!({
//!             "type": "object",
//!             "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
//!             "required": ["a", "b"]
//!         }),
//!         serde_json::json!({"sum": 5}),
//!     ))
//!     .unwrap();
//! # }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::colloquy::error::{BoxError, RuntimeError};
use crate::colloquy::provider::ToolDefinition;

/// How a tool is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    /// Returns a fixed JSON result from config.
    MockStatic,
    /// Renders a JSON template against the call arguments.
    MockTemplate,
    /// GET/POST against a configured URL.
    Http,
    /// Routed to an MCP server via the client registry.
    Mcp,
    /// User-registered handler function.
    Custom,
    /// Execution gated on an out-of-band approval.
    AsyncApproval,
}

/// HTTP-mode configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpToolConfig {
    /// Target URL.
    pub url: String,
    /// `"GET"` or `"POST"` (default POST).
    #[serde(default = "default_method")]
    pub method: String,
    /// Request headers. Values may reference secrets as `${ENV_VAR}`.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Top-level response fields removed before the result enters the
    /// message log or events.
    #[serde(default)]
    pub redact: Vec<String>,
}

fn default_method() -> String {
    "POST".to_string()
}

/// Mode-specific configuration carried by a descriptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolConfig {
    /// mock-static: the fixed result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// mock-template: the JSON template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<serde_json::Value>,
    /// http: request configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpToolConfig>,
    /// mcp: pin the call to a named server instead of the discovery index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
}

/// Full description of a registered tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Unique name within a registry.
    pub name: String,
    /// Description surfaced to the model.
    pub description: String,
    /// JSON Schema for the arguments.
    pub input_schema: serde_json::Value,
    /// Optional JSON Schema for the result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,
    /// Execution mode.
    pub mode: ExecutionMode,
    /// Per-call timeout in milliseconds (default 30s).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Mode-specific configuration.
    #[serde(default)]
    pub config: ToolConfig,
}

impl ToolDescriptor {
    /// Default per-call timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Descriptor for a custom-handler tool.
    pub fn custom(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            output_schema: None,
            mode: ExecutionMode::Custom,
            timeout_ms: None,
            config: ToolConfig::default(),
        }
    }

    /// Descriptor returning a fixed result.
    pub fn mock_static(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: serde_json::Value,
        result: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            output_schema: None,
            mode: ExecutionMode::MockStatic,
            timeout_ms: None,
            config: ToolConfig {
                result: Some(result),
                ..ToolConfig::default()
            },
        }
    }

    /// Descriptor rendering a JSON template against the arguments.
    pub fn mock_template(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: serde_json::Value,
        template: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            output_schema: None,
            mode: ExecutionMode::MockTemplate,
            timeout_ms: None,
            config: ToolConfig {
                template: Some(template),
                ..ToolConfig::default()
            },
        }
    }

    /// Descriptor for an HTTP-backed tool.
    pub fn http(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: serde_json::Value,
        http: HttpToolConfig,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            output_schema: None,
            mode: ExecutionMode::Http,
            timeout_ms: None,
            config: ToolConfig {
                http: Some(http),
                ..ToolConfig::default()
            },
        }
    }

    /// Descriptor for an MCP-routed tool.
    pub fn mcp(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            output_schema: None,
            mode: ExecutionMode::Mcp,
            timeout_ms: None,
            config: ToolConfig::default(),
        }
    }

    /// Descriptor for an approval-gated tool.
    pub fn async_approval(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            output_schema: None,
            mode: ExecutionMode::AsyncApproval,
            timeout_ms: None,
            config: ToolConfig::default(),
        }
    }

    /// Override the per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Effective timeout for a call.
    pub fn timeout(&self) -> Duration {
        self.timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(Self::DEFAULT_TIMEOUT)
    }

    /// Provider-visible schema for this descriptor.
    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters_schema: self.input_schema.clone(),
        }
    }
}

/// Result of a tool execution, in the shape fed back to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    /// Result payload (or error description).
    pub content: serde_json::Value,
    /// True when the execution failed.
    pub is_error: bool,
}

impl ToolOutcome {
    /// Successful outcome.
    pub fn ok(content: serde_json::Value) -> Self {
        Self {
            content,
            is_error: false,
        }
    }

    /// Failed outcome carrying the error text.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: serde_json::Value::String(message.into()),
            is_error: true,
        }
    }
}

/// Context handed to executors and custom handlers.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    /// Conversation the call belongs to.
    pub conversation_id: String,
    /// Snapshot of the conversation's variables at dispatch time.
    pub variables: HashMap<String, String>,
}

/// One validated tool call ready for execution.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    /// Provider-assigned call id.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Parsed, schema-validated arguments.
    pub arguments: serde_json::Value,
    /// Dispatch context.
    pub context: ToolContext,
}

/// Outcome of a dispatch: completed, or suspended pending approval.
#[derive(Debug, Clone)]
pub enum ToolExecution {
    /// The tool ran (successfully or not).
    Completed(ToolOutcome),
    /// The call is awaiting out-of-band approval.
    Pending {
        /// Why the call was suspended.
        reason: String,
    },
}

/// Executes calls for one [`ExecutionMode`].
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// The mode this executor serves.
    fn mode(&self) -> ExecutionMode;

    /// Execute one call.
    async fn execute(
        &self,
        descriptor: &ToolDescriptor,
        invocation: &ToolInvocation,
    ) -> Result<ToolExecution, BoxError>;
}

struct Registered {
    descriptor: ToolDescriptor,
    validator: Arc<jsonschema::Validator>,
}

/// Registry of tool descriptors with one executor per mode.
///
/// Registration is lock-protected; dispatch takes read locks only.
/// Registering a descriptor (or executor) under an existing name (mode)
/// replaces the previous entry.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Registered>>,
    executors: RwLock<HashMap<ExecutionMode, Arc<dyn ToolExecutor>>>,
    custom: Arc<crate::colloquy::tool_executors::CustomExecutor>,
    approval: Arc<crate::colloquy::tool_executors::AsyncApprovalExecutor>,
}

impl ToolRegistry {
    /// Create a registry pre-wired with the built-in executors for the
    /// mock, custom, http, and async-approval modes. The MCP executor is
    /// wired by the conversation when MCP servers are configured.
    pub fn new() -> Self {
        use crate::colloquy::tool_executors::{
            AsyncApprovalExecutor, CustomExecutor, HttpExecutor, MockStaticExecutor,
            MockTemplateExecutor,
        };
        let custom = Arc::new(CustomExecutor::new());
        let approval = Arc::new(AsyncApprovalExecutor::new());
        let registry = Self {
            tools: RwLock::new(HashMap::new()),
            executors: RwLock::new(HashMap::new()),
            custom: Arc::clone(&custom),
            approval: Arc::clone(&approval),
        };
        registry.set_executor(Arc::new(MockStaticExecutor));
        registry.set_executor(Arc::new(MockTemplateExecutor));
        registry.set_executor(Arc::new(HttpExecutor::new()));
        registry.set_executor(custom);
        registry.set_executor(approval);
        registry
    }

    /// The executor backing `Custom`-mode tools, for handler registration.
    pub fn custom_executor(&self) -> &Arc<crate::colloquy::tool_executors::CustomExecutor> {
        &self.custom
    }

    /// The executor backing `AsyncApproval`-mode tools, for approval
    /// registration and deferred resolution.
    pub fn approval_executor(
        &self,
    ) -> &Arc<crate::colloquy::tool_executors::AsyncApprovalExecutor> {
        &self.approval
    }

    /// Install (or replace) the executor for its mode.
    pub fn set_executor(&self, executor: Arc<dyn ToolExecutor>) {
        self.executors
            .write()
            .unwrap()
            .insert(executor.mode(), executor);
    }

    /// Borrow the executor registered for a mode.
    pub fn executor(&self, mode: ExecutionMode) -> Option<Arc<dyn ToolExecutor>> {
        self.executors.read().unwrap().get(&mode).cloned()
    }

    /// Register a descriptor, compiling its input schema. Replaces any
    /// prior descriptor with the same name.
    pub fn register(&self, descriptor: ToolDescriptor) -> Result<(), RuntimeError> {
        let validator = jsonschema::validator_for(&descriptor.input_schema).map_err(|e| {
            RuntimeError::Validation(format!(
                "tool '{}' has an invalid input schema: {}",
                descriptor.name, e
            ))
        })?;
        self.tools.write().unwrap().insert(
            descriptor.name.clone(),
            Registered {
                descriptor,
                validator: Arc::new(validator),
            },
        );
        Ok(())
    }

    /// Remove a descriptor.
    pub fn remove(&self, name: &str) -> bool {
        self.tools.write().unwrap().remove(name).is_some()
    }

    /// True when a descriptor with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.tools.read().unwrap().contains_key(name)
    }

    /// Clone of the named descriptor.
    pub fn descriptor(&self, name: &str) -> Option<ToolDescriptor> {
        self.tools
            .read()
            .unwrap()
            .get(name)
            .map(|r| r.descriptor.clone())
    }

    /// All registered names.
    pub fn names(&self) -> Vec<String> {
        self.tools.read().unwrap().keys().cloned().collect()
    }

    /// Provider-visible definitions for the given names, eliding any in
    /// the blocklist. Unknown names are skipped.
    pub fn definitions_for(&self, names: &[String], blocklist: &[String]) -> Vec<ToolDefinition> {
        let tools = self.tools.read().unwrap();
        names
            .iter()
            .filter(|n| !blocklist.contains(n))
            .filter_map(|n| tools.get(n).map(|r| r.descriptor.definition()))
            .collect()
    }

    /// Parse a raw JSON argument string and validate it against the
    /// descriptor's schema. Returns the parsed value or a human-readable
    /// error suitable for an error tool-result.
    pub fn validate_arguments(
        &self,
        name: &str,
        raw_arguments: &str,
    ) -> Result<serde_json::Value, String> {
        let tools = self.tools.read().unwrap();
        let registered = tools
            .get(name)
            .ok_or_else(|| format!("tool not registered: {}", name))?;
        let value: serde_json::Value = serde_json::from_str(raw_arguments)
            .map_err(|e| format!("arguments are not valid JSON: {}", e))?;
        if !registered.validator.is_valid(&value) {
            let details: Vec<String> = registered
                .validator
                .iter_errors(&value)
                .map(|e| e.to_string())
                .collect();
            return Err(format!(
                "arguments failed schema validation: {}",
                details.join("; ")
            ));
        }
        Ok(value)
    }

    /// Dispatch a validated invocation to its mode executor, enforcing the
    /// descriptor timeout. Executor errors and timeouts come back as error
    /// outcomes so the model can recover.
    pub async fn dispatch(&self, invocation: ToolInvocation) -> ToolExecution {
        let Some(descriptor) = self.descriptor(&invocation.name) else {
            return ToolExecution::Completed(ToolOutcome::error(format!(
                "tool not registered: {}",
                invocation.name
            )));
        };
        let Some(executor) = self.executor(descriptor.mode) else {
            return ToolExecution::Completed(ToolOutcome::error(format!(
                "no executor installed for mode {:?}",
                descriptor.mode
            )));
        };

        match tokio::time::timeout(descriptor.timeout(), executor.execute(&descriptor, &invocation))
            .await
        {
            Ok(Ok(execution)) => execution,
            Ok(Err(err)) => ToolExecution::Completed(ToolOutcome::error(err.to_string())),
            Err(_) => ToolExecution::Completed(ToolOutcome::error(format!(
                "tool '{}' timed out after {:?}",
                invocation.name,
                descriptor.timeout()
            ))),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_schema() -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
            "required": ["a", "b"]
        })
    }

    #[test]
    fn register_and_lookup() {
        let registry = ToolRegistry::new();
        registry
            .register(ToolDescriptor::mock_static(
                "add",
                "Adds",
                add_schema(),
                serde_json::json!({"sum": 5}),
            ))
            .unwrap();
        assert!(registry.contains("add"));
        assert_eq!(registry.descriptor("add").unwrap().mode, ExecutionMode::MockStatic);
    }

    #[test]
    fn invalid_schema_rejected_at_registration() {
        let registry = ToolRegistry::new();
        let err = registry
            .register(ToolDescriptor::custom(
                "bad",
                "Broken",
                serde_json::json!({"type": "not-a-type"}),
            ))
            .unwrap_err();
        assert!(err.to_string().contains("invalid input schema"));
    }

    #[test]
    fn argument_validation() {
        let registry = ToolRegistry::new();
        registry
            .register(ToolDescriptor::mock_static(
                "add",
                "Adds",
                add_schema(),
                serde_json::json!({"sum": 5}),
            ))
            .unwrap();

        assert!(registry.validate_arguments("add", r#"{"a": 2, "b": 3}"#).is_ok());
        assert!(registry
            .validate_arguments("add", r#"{"a": "two"}"#)
            .unwrap_err()
            .contains("schema validation"));
        assert!(registry
            .validate_arguments("add", "not json")
            .unwrap_err()
            .contains("not valid JSON"));
        assert!(registry
            .validate_arguments("missing", "{}")
            .unwrap_err()
            .contains("not registered"));
    }

    #[test]
    fn blocklist_elides_definitions() {
        let registry = ToolRegistry::new();
        for name in ["a", "b"] {
            registry
                .register(ToolDescriptor::mock_static(
                    name,
                    "t",
                    serde_json::json!({"type": "object"}),
                    serde_json::json!({}),
                ))
                .unwrap();
        }
        let defs = registry.definitions_for(
            &["a".to_string(), "b".to_string()],
            &["b".to_string()],
        );
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "a");
    }

    #[tokio::test]
    async fn dispatch_unknown_tool_is_recoverable() {
        let registry = ToolRegistry::new();
        let execution = registry
            .dispatch(ToolInvocation {
                id: "t1".into(),
                name: "ghost".into(),
                arguments: serde_json::json!({}),
                context: ToolContext::default(),
            })
            .await;
        match execution {
            ToolExecution::Completed(outcome) => assert!(outcome.is_error),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
