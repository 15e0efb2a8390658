// src/lib.rs

// The top-level `colloquy` module holds the runtime.
pub mod colloquy;

// The workspace member carrying the MCP wire primitives, re-exported so
// applications configure servers without a separate dependency.
pub use mcp;

// Re-export the modules and the types most applications touch so callers
// don't have to navigate the whole hierarchy.
pub use colloquy::{
    context_assembly, conversation, duplex, error, event, mcp_registry, media, message, metrics,
    pack, pipeline, provider, providers, store, template, tool_executors, tool_loop, tool_registry,
    vad,
};

pub use colloquy::conversation::{Conversation, ConversationOptions, Response, StreamChunk};
pub use colloquy::error::RuntimeError;
pub use colloquy::message::{Message, Role};
pub use colloquy::pack::Pack;
pub use colloquy::provider::Provider;
pub use colloquy::store::{MemoryStore, StateStore};

/// Initialize env_logger once for examples and tests. Repeated calls are
/// harmless.
pub fn init_logger() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .is_test(false)
        .try_init();
}
