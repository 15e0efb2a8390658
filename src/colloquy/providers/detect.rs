//! Provider detection.
//!
//! When a conversation is opened without an explicit provider, the runtime
//! resolves one in two steps: an explicit model name wins on prefix match
//! (`claude*` → Anthropic, `gpt*`/`o<digit>*` → OpenAI, `gemini*` →
//! Gemini), otherwise the first vendor with credentials in the process
//! environment is chosen, in the order OpenAI → Anthropic → Gemini.
//! Construction of the actual [`Provider`](crate::provider::Provider) is
//! delegated to a registered [`ProviderFactory`] so wire encodings stay
//! outside the runtime.

use std::sync::Arc;

use crate::colloquy::error::BoxError;
use crate::colloquy::provider::Provider;

/// A detectable model vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    /// OpenAI (`gpt*`, `o<digit>*` models, `OPENAI_API_KEY`).
    OpenAi,
    /// Anthropic (`claude*` models, `ANTHROPIC_API_KEY`).
    Anthropic,
    /// Google Gemini (`gemini*` models, `GEMINI_API_KEY`/`GOOGLE_API_KEY`).
    Gemini,
}

/// Builds a [`Provider`] for a detected vendor.
///
/// Registered on the conversation options; the runtime calls it at open
/// time with the (possibly overridden) model name.
pub trait ProviderFactory: Send + Sync {
    /// Construct a provider, reading credentials from wherever the
    /// implementation keeps them.
    fn create(&self, model: Option<&str>) -> Result<Arc<dyn Provider>, BoxError>;
}

/// Detect a vendor from an optional model name and the process
/// environment.
pub fn detect_provider(model: Option<&str>) -> Option<ProviderKind> {
    detect_with_lookup(model, |key| std::env::var(key).ok())
}

/// Detection core with an injectable environment lookup, for tests.
pub fn detect_with_lookup(
    model: Option<&str>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Option<ProviderKind> {
    if let Some(kind) = model.and_then(kind_from_model) {
        return Some(kind);
    }
    let has = |key: &str| lookup(key).map(|v| !v.is_empty()).unwrap_or(false);
    if has("OPENAI_API_KEY") {
        Some(ProviderKind::OpenAi)
    } else if has("ANTHROPIC_API_KEY") {
        Some(ProviderKind::Anthropic)
    } else if has("GEMINI_API_KEY") || has("GOOGLE_API_KEY") {
        Some(ProviderKind::Gemini)
    } else {
        None
    }
}

/// Map a model name to its vendor by prefix, or `None` when unrecognized.
pub fn kind_from_model(model: &str) -> Option<ProviderKind> {
    let lower = model.to_ascii_lowercase();
    if lower.starts_with("claude") {
        return Some(ProviderKind::Anthropic);
    }
    if lower.starts_with("gpt") {
        return Some(ProviderKind::OpenAi);
    }
    if lower.starts_with("gemini") {
        return Some(ProviderKind::Gemini);
    }
    // "o1", "o3-mini", ... but not arbitrary o-words.
    let mut chars = lower.chars();
    if chars.next() == Some('o') && chars.next().map(|c| c.is_ascii_digit()).unwrap_or(false) {
        return Some(ProviderKind::OpenAi);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_prefix_wins_over_env() {
        let kind = detect_with_lookup(Some("claude-sonnet-4"), |_| {
            Some("set".to_string()) // every credential present
        });
        assert_eq!(kind, Some(ProviderKind::Anthropic));
    }

    #[test]
    fn openai_o_series_is_digit_gated() {
        assert_eq!(kind_from_model("o3-mini"), Some(ProviderKind::OpenAi));
        assert_eq!(kind_from_model("ollama-llama3"), None);
    }

    #[test]
    fn env_priority_is_openai_first() {
        let kind = detect_with_lookup(None, |key| match key {
            "OPENAI_API_KEY" | "ANTHROPIC_API_KEY" => Some("k".into()),
            _ => None,
        });
        assert_eq!(kind, Some(ProviderKind::OpenAi));

        let kind = detect_with_lookup(None, |key| match key {
            "GOOGLE_API_KEY" => Some("k".into()),
            _ => None,
        });
        assert_eq!(kind, Some(ProviderKind::Gemini));
    }

    #[test]
    fn nothing_resolvable() {
        assert_eq!(detect_with_lookup(None, |_| None), None);
        assert_eq!(detect_with_lookup(Some("mistral-7b"), |_| None), None);
    }
}
