//! Template rendering and variable resolution.
//!
//! The runtime supports exactly one template syntax: `{{name}}`
//! substitution with no control flow. Values come from the conversation's
//! static variable map and from registered [`VariableProvider`]s, which
//! are pulled once per turn and merged left-to-right (later providers
//! win, statics lose to providers only for keys a provider actually
//! yields — statics are applied first).
//!
//! A variable that renders with no value is an error when the pack
//! declares it `required`, and an empty string otherwise. A provider that
//! fails is skipped with a warning unless it is marked required, in which
//! case the turn fails.

use async_trait::async_trait;
use chrono::Utc;
use log::warn;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::colloquy::error::{BoxError, RuntimeError};
use crate::colloquy::store::StateStore;

/// Context handed to variable providers on each pull.
pub struct VariableContext {
    /// Conversation being rendered for.
    pub conversation_id: String,
    /// The conversation's store, when one is configured.
    pub store: Option<Arc<dyn StateStore>>,
}

/// A producer of template variables.
///
/// Providers are asked, not notified: the pipeline pulls on each turn.
#[async_trait]
pub trait VariableProvider: Send + Sync {
    /// Stable provider name for logging.
    fn name(&self) -> &str;

    /// Produce this provider's variables for the current turn.
    async fn provide(&self, ctx: &VariableContext) -> Result<HashMap<String, String>, BoxError>;

    /// When true, a failure of this provider fails the turn instead of
    /// degrading gracefully.
    fn required(&self) -> bool {
        false
    }
}

/// Render a template, substituting `{{name}}` occurrences.
///
/// `required` holds the names the pack declares as required; a missing
/// required variable is a validation error, any other missing variable
/// renders empty. Unterminated `{{` sequences are kept literal.
pub fn render(
    template: &str,
    vars: &HashMap<String, String>,
    required: &HashSet<String>,
) -> Result<String, RuntimeError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        match after.find("}}") {
            Some(close) => {
                let name = after[..close].trim();
                match vars.get(name) {
                    Some(value) => out.push_str(value),
                    None if required.contains(name) => {
                        return Err(RuntimeError::Validation(format!(
                            "required variable '{}' is undefined",
                            name
                        )));
                    }
                    None => {}
                }
                rest = &after[close + 2..];
            }
            None => {
                // No closing braces; emit the remainder verbatim.
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    Ok(out)
}

/// Merge static variables and provider output into the final variable map.
///
/// Statics apply first; providers are pulled in registration order and
/// merged left-to-right, so a later provider overrides an earlier one
/// (and statics) for keys it yields.
pub async fn resolve_variables(
    statics: &HashMap<String, String>,
    providers: &[Arc<dyn VariableProvider>],
    ctx: &VariableContext,
) -> Result<HashMap<String, String>, RuntimeError> {
    let mut merged = statics.clone();
    for provider in providers {
        match provider.provide(ctx).await {
            Ok(vars) => merged.extend(vars),
            Err(err) if provider.required() => {
                return Err(RuntimeError::Validation(format!(
                    "required variable provider '{}' failed: {}",
                    provider.name(),
                    err
                )));
            }
            Err(err) => {
                warn!(
                    "variable provider '{}' failed, skipping: {}",
                    provider.name(),
                    err
                );
            }
        }
    }
    Ok(merged)
}

// ---------------------------------------------------------------------------
// Built-in providers
// ---------------------------------------------------------------------------

/// Provides `time`, `date`, `datetime`, and `timezone` (UTC).
pub struct TimeVariableProvider;

#[async_trait]
impl VariableProvider for TimeVariableProvider {
    fn name(&self) -> &str {
        "time"
    }

    async fn provide(&self, _ctx: &VariableContext) -> Result<HashMap<String, String>, BoxError> {
        let now = Utc::now();
        let mut vars = HashMap::new();
        vars.insert("time".to_string(), now.format("%H:%M:%S").to_string());
        vars.insert("date".to_string(), now.format("%Y-%m-%d").to_string());
        vars.insert("datetime".to_string(), now.to_rfc3339());
        vars.insert("timezone".to_string(), "UTC".to_string());
        Ok(vars)
    }
}

/// Exposes the conversation's store metadata entries as variables.
pub struct StateVariableProvider;

#[async_trait]
impl VariableProvider for StateVariableProvider {
    fn name(&self) -> &str {
        "state"
    }

    async fn provide(&self, ctx: &VariableContext) -> Result<HashMap<String, String>, BoxError> {
        let Some(store) = &ctx.store else {
            return Ok(HashMap::new());
        };
        let state = store.load(&ctx.conversation_id).await?;
        Ok(state.metadata.into_iter().collect())
    }
}

/// Ordered composition of providers, merged left-to-right.
pub struct ChainVariableProvider {
    name: String,
    providers: Vec<Arc<dyn VariableProvider>>,
}

impl ChainVariableProvider {
    /// Compose the given providers under one name.
    pub fn new(name: impl Into<String>, providers: Vec<Arc<dyn VariableProvider>>) -> Self {
        Self {
            name: name.into(),
            providers,
        }
    }
}

#[async_trait]
impl VariableProvider for ChainVariableProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn provide(&self, ctx: &VariableContext) -> Result<HashMap<String, String>, BoxError> {
        let mut merged = HashMap::new();
        for provider in &self.providers {
            merged.extend(provider.provide(ctx).await?);
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_required() -> HashSet<String> {
        HashSet::new()
    }

    #[test]
    fn substitutes_known_variables() {
        let mut vars = HashMap::new();
        vars.insert("persona".to_string(), "echo-bot".to_string());
        let out = render("You are {{persona}}.", &vars, &no_required()).unwrap();
        assert_eq!(out, "You are echo-bot.");
    }

    #[test]
    fn missing_optional_renders_empty() {
        let out = render("Hello {{who}}!", &HashMap::new(), &no_required()).unwrap();
        assert_eq!(out, "Hello !");
    }

    #[test]
    fn missing_required_fails() {
        let mut required = HashSet::new();
        required.insert("who".to_string());
        let err = render("Hello {{who}}!", &HashMap::new(), &required).unwrap_err();
        assert!(err.to_string().contains("who"));
    }

    #[test]
    fn unterminated_braces_stay_literal() {
        let out = render("open {{name and done", &HashMap::new(), &no_required()).unwrap();
        assert_eq!(out, "open {{name and done");
    }

    #[test]
    fn whitespace_in_names_is_trimmed() {
        let mut vars = HashMap::new();
        vars.insert("q".to_string(), "ping".to_string());
        assert_eq!(render("{{ q }}", &vars, &no_required()).unwrap(), "ping");
    }

    struct FixedProvider {
        key: &'static str,
        value: &'static str,
        fail: bool,
        required: bool,
    }

    #[async_trait]
    impl VariableProvider for FixedProvider {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn provide(
            &self,
            _ctx: &VariableContext,
        ) -> Result<HashMap<String, String>, BoxError> {
            if self.fail {
                return Err("boom".into());
            }
            let mut vars = HashMap::new();
            vars.insert(self.key.to_string(), self.value.to_string());
            Ok(vars)
        }

        fn required(&self) -> bool {
            self.required
        }
    }

    fn ctx() -> VariableContext {
        VariableContext {
            conversation_id: "c".into(),
            store: None,
        }
    }

    #[tokio::test]
    async fn later_provider_wins() {
        let mut statics = HashMap::new();
        statics.insert("k".to_string(), "static".to_string());
        let providers: Vec<Arc<dyn VariableProvider>> = vec![
            Arc::new(FixedProvider {
                key: "k",
                value: "first",
                fail: false,
                required: false,
            }),
            Arc::new(FixedProvider {
                key: "k",
                value: "second",
                fail: false,
                required: false,
            }),
        ];
        let merged = resolve_variables(&statics, &providers, &ctx()).await.unwrap();
        assert_eq!(merged["k"], "second");
    }

    #[tokio::test]
    async fn optional_provider_failure_degrades() {
        let providers: Vec<Arc<dyn VariableProvider>> = vec![Arc::new(FixedProvider {
            key: "k",
            value: "v",
            fail: true,
            required: false,
        })];
        let merged = resolve_variables(&HashMap::new(), &providers, &ctx())
            .await
            .unwrap();
        assert!(merged.is_empty());
    }

    #[tokio::test]
    async fn required_provider_failure_fails_turn() {
        let providers: Vec<Arc<dyn VariableProvider>> = vec![Arc::new(FixedProvider {
            key: "k",
            value: "v",
            fail: true,
            required: true,
        })];
        assert!(resolve_variables(&HashMap::new(), &providers, &ctx())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn time_provider_yields_expected_keys() {
        let vars = TimeVariableProvider.provide(&ctx()).await.unwrap();
        assert!(vars.contains_key("time"));
        assert!(vars.contains_key("date"));
        assert_eq!(vars["timezone"], "UTC");
    }
}
