//! L2 history: the chronological message stream, possibly compressed.

use reactor_turn::types::ProviderMessage;
use serde::{Deserialize, Serialize};

/// One message in history plus whether it is a C4-produced summary
/// standing in for a discarded span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// The message itself.
    pub message: ProviderMessage,
    /// Set when this entry replaces a compressed span rather than being
    /// an original message.
    pub compressed: bool,
}

impl HistoryEntry {
    /// Wrap an original (uncompressed) message.
    pub fn original(message: ProviderMessage) -> Self {
        Self {
            message,
            compressed: false,
        }
    }

    /// Wrap a summary message produced by the compressor.
    pub fn summary(message: ProviderMessage) -> Self {
        Self {
            message,
            compressed: true,
        }
    }
}

/// Strictly chronological sequence of [`HistoryEntry`]s.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryBlock {
    entries: Vec<HistoryEntry>,
}

impl HistoryBlock {
    /// An empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message to the end of history.
    pub fn push(&mut self, message: ProviderMessage) {
        self.entries.push(HistoryEntry::original(message));
    }

    /// All entries in chronological order.
    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether history is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replace the entries in `range` with a single compressed summary
    /// message, preserving chronological order. Panics on an out-of-range
    /// or empty span, mirroring `Vec::splice`'s own contract.
    pub fn replace_span(&mut self, range: std::ops::Range<usize>, summary: ProviderMessage) {
        assert!(range.end <= self.entries.len(), "span out of range");
        assert!(!range.is_empty(), "span must be non-empty");
        self.entries
            .splice(range, std::iter::once(HistoryEntry::summary(summary)));
    }
}
