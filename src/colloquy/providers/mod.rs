//! Provider implementations and selection helpers.
//!
//! Concrete vendor wire encodings live outside this crate; what ships here
//! is the [`detect`] logic that picks a vendor from a model name or the
//! process environment, and the deterministic [`mock`] provider used by
//! tests and the evaluation harness.

pub mod detect;
pub mod mock;

pub use detect::{detect_provider, ProviderFactory, ProviderKind};
