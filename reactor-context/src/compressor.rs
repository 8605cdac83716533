//! C4: LLM-assisted summarisation of oversized blocks, plus fact
//! extraction for L3.
//!
//! Grounded on the shape of a now-superseded context-strategy sketch that
//! once lived in this workspace: split messages into preserved-recent and
//! to-be-summarised spans, issue one bounded [`Provider::complete`] call
//! with a fixed system instruction and low temperature, and reassemble.
//! Reimplemented here against `ProviderMessage`/`ContentPart` with two
//! additions that sketch never had: fact extraction feeding L3, and the
//! image-retention rule for block-overflow compression.

use crate::error::ContextError;
use reactor_turn::provider::Provider;
use reactor_turn::types::{ContentPart, ImageSource, ProviderMessage, ProviderRequest, Role};
use regex::Regex;
use std::sync::OnceLock;

/// Tuning for the compressor's LLM call and image-retention rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompressorConfig {
    /// Target length, in tokens, of a span summary.
    pub target_summary_tokens: usize,
    /// Images kept per message on block-overflow compression; the rest
    /// are dropped with a visible notice.
    pub max_images_retained: usize,
    /// Sampling temperature for the summarisation call.
    pub temperature: f64,
}

impl Default for CompressorConfig {
    fn default() -> Self {
        Self {
            target_summary_tokens: 200,
            max_images_retained: 3,
            temperature: 0.2,
        }
    }
}

/// A fact pulled out of a span, earmarked for L3 insertion if its
/// importance clears the caller's threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedFact {
    /// The fact text (a URL, path, version string, or similar).
    pub text: String,
    /// Heuristic importance in `[0, 1]`.
    pub importance: f32,
}

const SUMMARIZE_INSTRUCTION: &str = "Summarize the following conversation span for an autonomous agent's history. \
Preserve: every user intent encountered, each tool call and whether it succeeded, \
and any extracted facts (URLs, file paths, identifiers, version numbers, decisions). \
Be concise; the summary replaces the original messages in the agent's memory.";

/// LLM-assisted span/block compressor.
pub struct Compressor<'p, P: Provider> {
    provider: &'p P,
    config: CompressorConfig,
}

impl<'p, P: Provider> Compressor<'p, P> {
    /// Build a compressor over `provider` with the given tuning.
    pub fn new(provider: &'p P, config: CompressorConfig) -> Self {
        Self { provider, config }
    }

    /// Compress a contiguous span into one `system` summary message, plus
    /// the facts extracted from it. Falls back to non-LLM truncation if
    /// the provider call fails, per the spec's overflow-handling rule.
    pub async fn compress_span(
        &self,
        span: &[ProviderMessage],
    ) -> Result<(ProviderMessage, Vec<ExtractedFact>), ContextError> {
        let facts = extract_facts(span);
        let request = ProviderRequest {
            model: None,
            messages: span.to_vec(),
            tools: Vec::new(),
            max_tokens: Some((self.config.target_summary_tokens as u32).saturating_mul(2)),
            temperature: Some(self.config.temperature),
            system: Some(SUMMARIZE_INSTRUCTION.to_string()),
            extra: serde_json::Value::Null,
        };

        match self.provider.complete(request).await {
            Ok(response) => {
                let text = response_text(&response.content);
                Ok((system_message(text), facts))
            }
            Err(err) => {
                tracing::warn!(error = %err, "span summarization failed, falling back to truncation");
                Ok((self.truncate_fallback(span), facts))
            }
        }
    }

    /// Non-LLM fallback: concatenate the span's text and truncate to the
    /// target length, so a failed or skipped model call never blocks
    /// compaction entirely.
    fn truncate_fallback(&self, span: &[ProviderMessage]) -> ProviderMessage {
        let mut text = String::new();
        for message in span {
            text.push_str(&response_text(&message.content));
            text.push(' ');
        }
        let budget_chars = self.config.target_summary_tokens.saturating_mul(4);
        text.truncate(budget_chars);
        system_message(format!("[truncated summary] {text}"))
    }

    /// Block-overflow compression for a single message: retain at most
    /// `max_images_retained` images, replacing the rest with a visible
    /// drop notice, then (if the text portion alone is still over
    /// `budget_tokens`) truncate the text.
    pub fn compress_block(&self, message: &ProviderMessage, budget_tokens: usize) -> ProviderMessage {
        let image_count = message
            .content
            .iter()
            .filter(|p| matches!(p, ContentPart::Image { .. }))
            .count();

        let mut content = Vec::new();
        let keep_from = image_count.saturating_sub(self.config.max_images_retained);
        let mut seen_images = 0;
        let mut dropped = 0;

        for part in &message.content {
            match part {
                ContentPart::Image { .. } => {
                    if seen_images >= keep_from {
                        content.push(part.clone());
                    } else {
                        dropped += 1;
                    }
                    seen_images += 1;
                }
                other => content.push(other.clone()),
            }
        }
        if dropped > 0 {
            content.push(ContentPart::Text {
                text: format!("[IMAGES_OMITTED:{dropped}]"),
            });
        }

        let budget_chars = budget_tokens.saturating_mul(4);
        let text_len: usize = content
            .iter()
            .map(|p| match p {
                ContentPart::Text { text } => text.len(),
                ContentPart::ToolResult { content, .. } => content.len(),
                _ => 0,
            })
            .sum();
        if text_len > budget_chars {
            for part in content.iter_mut() {
                match part {
                    ContentPart::Text { text } => text.truncate(budget_chars),
                    ContentPart::ToolResult { content, .. } => content.truncate(budget_chars),
                    _ => {}
                }
            }
        }

        ProviderMessage {
            role: message.role.clone(),
            content,
        }
    }
}

fn response_text(parts: &[ContentPart]) -> String {
    parts
        .iter()
        .filter_map(|p| match p {
            ContentPart::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn system_message(text: String) -> ProviderMessage {
    ProviderMessage {
        role: Role::System,
        content: vec![ContentPart::Text { text }],
    }
}

fn patterns() -> &'static (Regex, Regex, Regex) {
    static PATTERNS: OnceLock<(Regex, Regex, Regex)> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        (
            Regex::new(r"https?://[^\s]+").expect("valid url regex"),
            Regex::new(r"(?:\./|/)[\w./-]+\.\w+").expect("valid path regex"),
            Regex::new(r"\bv?\d+\.\d+(?:\.\d+)?\b").expect("valid version regex"),
        )
    })
}

/// Extract URLs, file paths, and version strings from a span's text.
///
/// Used internally to feed L3 when a span is compressed away, and by the
/// agent loop to decide whether a fresh tool observation is worth a
/// scratchpad fact before the observation itself scrolls out of history.
pub fn extract_facts(span: &[ProviderMessage]) -> Vec<ExtractedFact> {
    let (url_re, path_re, version_re) = patterns();
    let mut facts = Vec::new();
    for message in span {
        let text = response_text(&message.content);
        for m in url_re.find_iter(&text) {
            facts.push(ExtractedFact {
                text: m.as_str().to_string(),
                importance: 0.7,
            });
        }
        for m in path_re.find_iter(&text) {
            facts.push(ExtractedFact {
                text: m.as_str().to_string(),
                importance: 0.6,
            });
        }
        for m in version_re.find_iter(&text) {
            facts.push(ExtractedFact {
                text: m.as_str().to_string(),
                importance: 0.4,
            });
        }
    }
    facts.sort_by(|a, b| a.text.cmp(&b.text));
    facts.dedup_by(|a, b| a.text == b.text);
    facts
}
