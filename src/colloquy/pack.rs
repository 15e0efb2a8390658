//! Compiled prompt packs.
//!
//! A pack is an immutable JSON bundle of prompts, tool descriptors, eval
//! definitions, and optional agent/workflow metadata, produced by an
//! external compiler. The loader parses, validates cross-references, and
//! content-addresses the pack by SHA-256. The workflow section is
//! metadata only: it is validated here but never executed by this
//! runtime.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;

use crate::colloquy::error::RuntimeError;
use crate::colloquy::tool_registry::ToolDescriptor;

/// Template engine declaration carried by a pack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateEngine {
    /// Engine version.
    pub version: String,
    /// Syntax identifier; this runtime implements `{{name}}` only.
    pub syntax: String,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self {
            version: "1".to_string(),
            syntax: "{{name}}".to_string(),
        }
    }
}

/// Sampling parameters attached to a prompt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptParameters {
    /// Sampling temperature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Output token cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Nucleus sampling parameter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
}

/// A declared template variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableDecl {
    /// Variable name as it appears in `{{name}}`.
    pub name: String,
    /// Declared type (informational).
    #[serde(rename = "type", default = "default_var_type")]
    pub var_type: String,
    /// When true, rendering without a value fails the turn.
    #[serde(default)]
    pub required: bool,
}

fn default_var_type() -> String {
    "string".to_string()
}

/// A named prompt within a pack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prompt {
    /// Stable prompt id.
    pub id: String,
    /// System template.
    #[serde(default)]
    pub system_template: String,
    /// User template.
    #[serde(default)]
    pub user_template: String,
    /// Sampling parameters.
    #[serde(default)]
    pub parameters: PromptParameters,
    /// Declared variables.
    #[serde(default)]
    pub variables: Vec<VariableDecl>,
    /// Names of pack tools this prompt exposes to the model.
    #[serde(default)]
    pub tool_refs: Vec<String>,
    /// Names of evals attached to this prompt.
    #[serde(default)]
    pub eval_refs: Vec<String>,
}

impl Prompt {
    /// Names of variables declared `required`.
    pub fn required_variables(&self) -> std::collections::HashSet<String> {
        self.variables
            .iter()
            .filter(|v| v.required)
            .map(|v| v.name.clone())
            .collect()
    }
}

/// An eval definition (consumed by the external harness).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalDef {
    /// Eval name.
    pub name: String,
    /// Harness-specific configuration, passed through untouched.
    #[serde(flatten)]
    pub config: HashMap<String, serde_json::Value>,
}

/// An agent member declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMember {
    /// Member description.
    #[serde(default)]
    pub description: String,
    /// Accepted input MIME modes (`type/subtype`).
    #[serde(default)]
    pub input_modes: Vec<String>,
    /// Produced output MIME modes (`type/subtype`).
    #[serde(default)]
    pub output_modes: Vec<String>,
    /// Free-form tags.
    #[serde(default)]
    pub tags: Vec<String>,
}

/// The agents section of a pack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsSection {
    /// Entry member; must be a key of `members`.
    pub entry: String,
    /// Member declarations; every key must be a prompt name.
    pub members: HashMap<String, AgentMember>,
}

/// One workflow state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    /// Prompt executed in this state; must be a prompt name.
    pub prompt_task: String,
    /// Event → target-state transitions.
    #[serde(default)]
    pub on_event: HashMap<String, String>,
}

/// The workflow section of a pack (metadata only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Schema version; must be 1.
    pub version: u32,
    /// Initial state; must be a key of `states`.
    pub entry: String,
    /// State machine.
    pub states: HashMap<String, WorkflowState>,
}

/// A loaded, validated, content-addressed pack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pack {
    /// Pack id.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Pack version string.
    pub version: String,
    /// Template engine declaration.
    #[serde(default)]
    pub template_engine: TemplateEngine,
    /// Named prompts.
    pub prompts: HashMap<String, Prompt>,
    /// Tool descriptors shipped with the pack.
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
    /// Eval definitions.
    #[serde(default)]
    pub evals: Vec<EvalDef>,
    /// Agent metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agents: Option<AgentsSection>,
    /// Workflow metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<Workflow>,
    /// Hex SHA-256 of the source bytes. Computed at load.
    #[serde(skip)]
    checksum: String,
}

impl Pack {
    /// Parse and validate a pack from JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RuntimeError> {
        let mut pack: Pack = serde_json::from_slice(bytes)
            .map_err(|e| RuntimeError::InvalidPack(e.to_string()))?;
        pack.checksum = hex_digest(bytes);
        pack.validate()?;
        Ok(pack)
    }

    /// Parse and validate a pack from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, RuntimeError> {
        Self::from_bytes(json.as_bytes())
    }

    /// Load, parse, and validate a pack file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RuntimeError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|e| RuntimeError::PackNotFound(format!("{}: {}", path.display(), e)))?;
        Self::from_bytes(&bytes)
    }

    /// Hex SHA-256 of the pack's source bytes.
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// Look up a prompt by name.
    pub fn prompt(&self, name: &str) -> Option<&Prompt> {
        self.prompts.get(name)
    }

    /// Look up a shipped tool descriptor by name.
    pub fn tool(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.iter().find(|t| t.name == name)
    }

    /// Validate cross-references. Called by the loaders; public so packs
    /// constructed in code can be checked too.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        if let Some(agents) = &self.agents {
            if !agents.members.contains_key(&agents.entry) {
                return Err(invalid(format!(
                    "agents.entry '{}' is not a member",
                    agents.entry
                )));
            }
            for (name, member) in &agents.members {
                if !self.prompts.contains_key(name) {
                    return Err(invalid(format!(
                        "agent member '{}' has no matching prompt",
                        name
                    )));
                }
                for mode in member.input_modes.iter().chain(&member.output_modes) {
                    if !is_mime(mode) {
                        return Err(invalid(format!(
                            "agent member '{}' mode '{}' is not type/subtype",
                            name, mode
                        )));
                    }
                }
            }
        }

        if let Some(workflow) = &self.workflow {
            if workflow.version != 1 {
                return Err(invalid(format!(
                    "workflow.version {} is unsupported (expected 1)",
                    workflow.version
                )));
            }
            if !workflow.states.contains_key(&workflow.entry) {
                return Err(invalid(format!(
                    "workflow.entry '{}' is not a state",
                    workflow.entry
                )));
            }
            for (name, state) in &workflow.states {
                if !self.prompts.contains_key(&state.prompt_task) {
                    return Err(invalid(format!(
                        "workflow state '{}' references unknown prompt '{}'",
                        name, state.prompt_task
                    )));
                }
                for target in state.on_event.values() {
                    if !workflow.states.contains_key(target) {
                        return Err(invalid(format!(
                            "workflow state '{}' transitions to unknown state '{}'",
                            name, target
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

fn invalid(msg: String) -> RuntimeError {
    RuntimeError::InvalidPack(msg)
}

fn is_mime(mode: &str) -> bool {
    let mut parts = mode.splitn(2, '/');
    matches!(
        (parts.next(), parts.next()),
        (Some(t), Some(s)) if !t.is_empty() && !s.is_empty()
    )
}

fn hex_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}
