//! L1 scratchpad: the small, always-in-prompt working memory.

use reactor_turn::types::{ContentPart, ProviderMessage, Role};
use serde::{Deserialize, Serialize};

/// Default cap on `recent_facts` before the oldest entries are dropped.
pub const DEFAULT_MAX_FACTS: usize = 12;

/// Goal, plan, last observation, and a bounded fact list. Mutated by the
/// agent loop after every cycle; never exceeds `max_facts` entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scratchpad {
    /// The task the agent is working toward.
    pub goal: String,
    /// The current plan, free text.
    pub plan: String,
    /// A short summary of the most recent tool observation.
    pub last_observation: Option<String>,
    /// Facts worth keeping in every prompt, oldest first.
    pub recent_facts: Vec<String>,
    /// Cap on `recent_facts.len()`; oldest facts are dropped on overflow.
    #[serde(default = "default_max_facts")]
    pub max_facts: usize,
}

fn default_max_facts() -> usize {
    DEFAULT_MAX_FACTS
}

impl Scratchpad {
    /// A blank scratchpad seeded with a goal.
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            plan: String::new(),
            last_observation: None,
            recent_facts: Vec::new(),
            max_facts: DEFAULT_MAX_FACTS,
        }
    }

    /// Append a fact, dropping the oldest once `max_facts` is exceeded.
    pub fn push_fact(&mut self, fact: impl Into<String>) {
        self.recent_facts.push(fact.into());
        while self.recent_facts.len() > self.max_facts {
            self.recent_facts.remove(0);
        }
    }

    /// Record the latest tool observation summary.
    pub fn set_last_observation(&mut self, summary: impl Into<String>) {
        self.last_observation = Some(summary.into());
    }

    /// Render as a single text block for prompt assembly.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("Goal: ");
        out.push_str(&self.goal);
        if !self.plan.is_empty() {
            out.push_str("\nPlan: ");
            out.push_str(&self.plan);
        }
        if let Some(obs) = &self.last_observation {
            out.push_str("\nLast observation: ");
            out.push_str(obs);
        }
        if !self.recent_facts.is_empty() {
            out.push_str("\nFacts:");
            for fact in &self.recent_facts {
                out.push_str("\n- ");
                out.push_str(fact);
            }
        }
        out
    }

    /// Render as a `system`-role prompt message.
    pub fn to_message(&self) -> ProviderMessage {
        ProviderMessage {
            role: Role::System,
            content: vec![ContentPart::Text {
                text: self.render(),
            }],
        }
    }

    /// Truncate the rendered text to fit `budget_tokens` (4 chars/token),
    /// dropping the oldest facts first, then shortening the plan. The
    /// non-LLM fallback used when the scratchpad itself is too small a
    /// block to be worth an LLM summarization call.
    pub fn truncate_to_budget(&mut self, budget_tokens: usize) {
        let budget_chars = budget_tokens.saturating_mul(4);
        while self.render().len() > budget_chars && !self.recent_facts.is_empty() {
            self.recent_facts.remove(0);
        }
        if self.render().len() > budget_chars {
            let keep = budget_chars.saturating_sub(self.goal.len() + 16);
            self.plan.truncate(keep);
        }
    }
}
