//! C5: assembles a token-bounded prompt from system, scratchpad,
//! retrieved memory, and history, compressing on overflow.
//!
//! Generalizes `reactor_turn::context::ContextStrategy`'s single-class,
//! un-budgeted `token_estimate`/`should_compact`/`compact` shape into the
//! five weighted classes in [`crate::budget::BudgetConfig`]; the existing
//! `SlidingWindow` strategy is the un-budgeted special case of this
//! component's L2 class alone.

use crate::budget::BudgetConfig;
use crate::compressor::{Compressor, CompressorConfig};
use crate::error::ContextError;
use crate::history::HistoryBlock;
use crate::scratchpad::Scratchpad;
use reactor_memory::{Embedder, MemoryScope, MemoryStore};
use reactor_turn::provider::Provider;
use reactor_turn::types::{ContentPart, ProviderMessage, Role};
use regex::Regex;
use std::sync::OnceLock;

/// Tunables for the L3 dynamic-`k` retrieval step (resolved Open Question:
/// exposed here rather than hardcoded, see `DESIGN.md`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryConfig {
    /// Minimum records retrieved per query, before growth.
    pub k_min: usize,
    /// Maximum records retrieved per query.
    pub k_max: usize,
    /// `k` stops growing once the next candidate's similarity falls more
    /// than this far below the top result's similarity.
    pub similarity_floor: f32,
    /// Importance at or above which a fact extracted during span
    /// compression is written into L3.
    pub fact_importance_floor: f32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            k_min: 2,
            k_max: 7,
            similarity_floor: 0.15,
            fact_importance_floor: 0.5,
        }
    }
}

/// How many times [`ContextManager::assemble`] will attempt a further
/// compression pass before giving up with [`ContextError::Overflow`].
const MAX_COMPRESSION_ATTEMPTS: usize = 3;

/// Synthetic per-image token cost, structured or inline.
const IMAGE_TOKEN_COST: usize = 65;

fn token_estimate(text: &str) -> usize {
    text.len() / 4
}

/// Matches the inline image payload markers (`[IMAGE_DATA:...]`,
/// `[PAGE_<n>_IMAGE_DATA:...]`) embedded in message text.
fn image_marker_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\[(?:IMAGE_DATA|PAGE_\d+_IMAGE_DATA):[^\]]*\]").expect("valid marker regex")
    })
}

/// Token cost of a text part: `IMAGE_TOKEN_COST` per inline image marker,
/// plus the usual char-count estimate over everything else.
fn text_tokens(text: &str) -> usize {
    let pattern = image_marker_pattern();
    let marker_count = pattern.find_iter(text).count();
    if marker_count == 0 {
        return token_estimate(text);
    }
    let remainder = pattern.replace_all(text, "");
    marker_count * IMAGE_TOKEN_COST + token_estimate(&remainder)
}

fn message_tokens(message: &ProviderMessage) -> usize {
    message
        .content
        .iter()
        .map(|part| match part {
            ContentPart::Text { text } => text_tokens(text),
            ContentPart::ToolUse { input, .. } => token_estimate(&input.to_string()),
            ContentPart::ToolResult { content, .. } => token_estimate(content),
            ContentPart::Image { .. } => IMAGE_TOKEN_COST,
        })
        .sum::<usize>()
        + 4
}

/// Builds the per-cycle prompt from the five priority classes.
pub struct ContextManager<'p, P: Provider> {
    budget: BudgetConfig,
    memory_config: MemoryConfig,
    compressor: Compressor<'p, P>,
}

impl<'p, P: Provider> ContextManager<'p, P> {
    /// Construct a manager over `provider`, used only for the
    /// compressor's summarisation calls.
    pub fn new(
        provider: &'p P,
        budget: BudgetConfig,
        memory_config: MemoryConfig,
        compressor_config: CompressorConfig,
    ) -> Self {
        Self {
            budget,
            memory_config,
            compressor: Compressor::new(provider, compressor_config),
        }
    }

    /// Assemble the ordered prompt for the next model call.
    ///
    /// `memory_scopes` is searched for retrieval; the first entry is
    /// where newly extracted facts from span compression are written
    /// back (normally the active chat's scope, with `global` listed
    /// after it for retrieval-only access).
    pub async fn assemble<E: Embedder>(
        &self,
        system_prompt: &str,
        scratchpad: &mut Scratchpad,
        history: &mut HistoryBlock,
        memory: &MemoryStore,
        embedder: &E,
        memory_scopes: &[MemoryScope],
        query_text: &str,
        current_turn: Vec<ProviderMessage>,
    ) -> Result<Vec<ProviderMessage>, ContextError> {
        let alloc = self.budget.allocate();

        scratchpad.truncate_to_budget(alloc.scratchpad_ceiling);
        let scratchpad_message = scratchpad.to_message();

        let system_message = ProviderMessage {
            role: Role::System,
            content: vec![ContentPart::Text {
                text: system_prompt.to_string(),
            }],
        };

        let memory_section = self
            .retrieve_memory(memory, embedder, memory_scopes, query_text, alloc.memory_ceiling)
            .await?;
        let memory_tokens = memory_section
            .as_ref()
            .map(message_tokens)
            .unwrap_or(0);

        let history_budget = alloc
            .remaining_after_fixed
            .saturating_sub(memory_tokens)
            .min(self.budget.history_ceiling_tokens());

        // Step 4: one span-compression pass if history alone overflows its
        // share. This is the only place spans get summarised; once, not
        // repeatedly, since re-summarising an already-compressed span
        // makes no further progress.
        let (fits, cut) = self.fit_history(history, history_budget);
        if !fits && cut > 0 {
            let span: Vec<ProviderMessage> = history.entries()[..cut]
                .iter()
                .map(|e| e.message.clone())
                .collect();
            let (summary, facts) = self.compressor.compress_span(&span).await?;
            history.replace_span(0..cut, summary);
            if let Some(scope) = memory_scopes.first() {
                for fact in facts
                    .into_iter()
                    .filter(|f| f.importance >= self.memory_config.fact_importance_floor)
                {
                    if let Ok(embedding) = embedder.embed(&fact.text).await {
                        let _ = memory.add(scope.clone(), fact.text, embedding, fact.importance).await;
                    }
                }
            }
        }

        let selected_history: Vec<ProviderMessage> =
            history.entries().iter().map(|e| e.message.clone()).collect();

        let mut prompt = Vec::with_capacity(selected_history.len() + 4);
        prompt.push(system_message);
        prompt.extend(selected_history);
        if let Some(section) = memory_section {
            prompt.push(section);
        }
        prompt.push(scratchpad_message);
        prompt.extend(current_turn);

        // Step 5: if the assembled prompt still overflows the window
        // (the span pass above only targets history's own share), shrink
        // the single largest block in place until it fits or we give up.
        let mut attempts = 0;
        while total_tokens(&prompt) > self.budget.window {
            if attempts >= MAX_COMPRESSION_ATTEMPTS {
                return Err(ContextError::Overflow {
                    tokens: total_tokens(&prompt),
                    window: self.budget.window,
                });
            }
            let (idx, current_tokens) = prompt
                .iter()
                .enumerate()
                .map(|(i, m)| (i, message_tokens(m)))
                .max_by_key(|(_, t)| *t)
                .expect("prompt is non-empty");
            let shrunk = self.compressor.compress_block(&prompt[idx], current_tokens / 2);
            prompt[idx] = shrunk;
            attempts += 1;
        }

        Ok(prompt)
    }

    /// Returns `(fits, cut)`: whether the full history fits in
    /// `budget_tokens`, and if not, how many of the *oldest* entries
    /// (`history.entries()[..cut]`) must be compressed away to make room
    /// for the rest.
    fn fit_history(&self, history: &HistoryBlock, budget_tokens: usize) -> (bool, usize) {
        let entries = history.entries();
        let total: usize = entries.iter().map(|e| message_tokens(&e.message)).sum();
        if total <= budget_tokens {
            return (true, 0);
        }

        let mut running = 0usize;
        let mut keep_from = entries.len();
        for (i, entry) in entries.iter().enumerate().rev() {
            let t = message_tokens(&entry.message);
            if running + t > budget_tokens {
                keep_from = i + 1;
                break;
            }
            running += t;
            keep_from = i;
        }
        (false, keep_from)
    }

    async fn retrieve_memory<E: Embedder>(
        &self,
        memory: &MemoryStore,
        embedder: &E,
        scopes: &[MemoryScope],
        query_text: &str,
        ceiling_tokens: usize,
    ) -> Result<Option<ProviderMessage>, ContextError> {
        if scopes.is_empty() || query_text.is_empty() {
            return Ok(None);
        }
        let query_embedding = embedder.embed(query_text).await?;
        let all = memory.search(scopes, &query_embedding, self.memory_config.k_max).await?;
        if all.is_empty() {
            return Ok(None);
        }

        let mut k = self.memory_config.k_min.min(all.len());
        let top_similarity = all[0].similarity;
        while k < all.len().min(self.memory_config.k_max) {
            let rendered_tokens: usize = all[..k + 1].iter().map(|h| token_estimate(&h.record.text)).sum();
            if rendered_tokens > ceiling_tokens {
                break;
            }
            if top_similarity - all[k].similarity > self.memory_config.similarity_floor {
                break;
            }
            k += 1;
        }
        while k > 0 && all[..k].iter().map(|h| token_estimate(&h.record.text)).sum::<usize>() > ceiling_tokens {
            k -= 1;
        }
        if k == 0 {
            return Ok(None);
        }

        let mut text = String::from("Retrieved memory:");
        for hit in &all[..k] {
            text.push_str("\n- ");
            text.push_str(&hit.record.text);
        }
        Ok(Some(ProviderMessage {
            role: Role::System,
            content: vec![ContentPart::Text { text }],
        }))
    }
}

fn total_tokens(prompt: &[ProviderMessage]) -> usize {
    prompt.iter().map(message_tokens).sum()
}
