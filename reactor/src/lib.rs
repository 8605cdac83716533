#![deny(missing_docs)]
//! # reactor — umbrella crate
//!
//! Provides a single import surface for the Reactor redesign (`redesign/v2`).
//! Re-exports protocol and key implementations behind feature flags, plus a
//! `prelude` for the happy path.

#[cfg(feature = "core")]
pub use layer0;
#[cfg(feature = "core")]
pub use reactor_context;
#[cfg(feature = "hooks")]
pub use reactor_hooks;
#[cfg(feature = "core")]
pub use reactor_memory;
#[cfg(feature = "op-react")]
pub use reactor_op_react;
#[cfg(feature = "core")]
pub use reactor_parser;
#[cfg(feature = "provider-ollama")]
pub use reactor_provider_ollama;
#[cfg(feature = "state-fs")]
pub use reactor_state_fs;
#[cfg(feature = "core")]
pub use reactor_tool;
#[cfg(feature = "core")]
pub use reactor_turn;

/// Happy-path imports for composing Reactor systems.
pub mod prelude {
    #[cfg(feature = "core")]
    pub use layer0::{
        AgentId, Content, ContentBlock, Effect, Environment, ExitReason, Hook, HookAction,
        HookContext, HookPoint, Operator, OperatorConfig, OperatorInput, OperatorOutput, Scope,
        SessionId, StateReader, StateStore, WorkflowId,
    };

    #[cfg(feature = "hooks")]
    pub use reactor_hooks::HookRegistry;

    #[cfg(feature = "core")]
    pub use reactor_memory::{MemoryScope, MemoryStore};

    #[cfg(feature = "core")]
    pub use reactor_parser::{parse_agent_step, AgentStep};

    #[cfg(feature = "core")]
    pub use reactor_tool::{ToolDyn, ToolError, ToolRegistry};

    #[cfg(feature = "core")]
    pub use reactor_turn::provider::{Provider, ProviderError};

    #[cfg(feature = "op-react")]
    pub use reactor_op_react::{AgentConfig, AgentLoop};

    #[cfg(feature = "state-fs")]
    pub use reactor_state_fs::chat::ChatStore;
}
