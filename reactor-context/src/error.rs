//! Errors from assembling or compressing a context window.

use thiserror::Error;

/// Errors from the context manager and compressor.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ContextError {
    /// The assembled prompt still exceeds the window after every
    /// compression attempt; treated by the agent loop as a fatal step
    /// error that triggers self-reflection.
    #[error("prompt of {tokens} tokens exceeds the {window} token window after compression")]
    Overflow {
        /// Tokens in the prompt after the last compression attempt.
        tokens: usize,
        /// The configured context window.
        window: usize,
    },

    /// LLM-driven summarization failed; callers fall back to the
    /// non-LLM truncation path described alongside the compressor.
    #[error("summarization failed: {0}")]
    Summarization(String),

    /// The embedding or vector-index layer failed.
    #[error("memory error: {0}")]
    Memory(#[from] reactor_memory::MemoryError),

    /// The provider call backing summarization failed.
    #[error("provider error: {0}")]
    Provider(#[from] reactor_turn::provider::ProviderError),
}
