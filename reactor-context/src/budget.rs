//! Five-class token budget for prompt assembly.

/// A share of the window plus its hard floor/ceiling, all expressed as
/// fractions of the window (e.g. `0.15` = 15%).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassBudget {
    /// Default share of the window.
    pub share: f64,
    /// Minimum share this class may be squeezed to.
    pub floor: f64,
    /// Maximum share this class may grow to, or `None` for unbounded.
    pub ceiling: Option<f64>,
}

impl ClassBudget {
    fn tokens(&self, window: usize) -> usize {
        let frac = self.ceiling.unwrap_or(self.share);
        ((window as f64) * frac) as usize
    }

    fn floor_tokens(&self, window: usize) -> usize {
        ((window as f64) * self.floor) as usize
    }
}

/// The five context-window classes and their shares, mirroring the
/// workspace's `AgentConfig`-style static-defaults-plus-override pattern.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetConfig {
    /// Total model context window, in tokens.
    pub window: usize,
    /// System prompt: fixed share, no floor/ceiling flexibility.
    pub system: ClassBudget,
    /// L1 scratchpad.
    pub scratchpad: ClassBudget,
    /// L3 retrieved memory.
    pub memory: ClassBudget,
    /// L2 history.
    pub history: ClassBudget,
    /// Reserve held back for the completion itself.
    pub reserve: ClassBudget,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            window: 24_576,
            system: ClassBudget {
                share: 0.15,
                floor: 0.15,
                ceiling: Some(0.15),
            },
            scratchpad: ClassBudget {
                share: 0.10,
                floor: 0.05,
                ceiling: Some(0.15),
            },
            memory: ClassBudget {
                share: 0.20,
                floor: 0.05,
                ceiling: Some(0.30),
            },
            history: ClassBudget {
                share: 0.50,
                floor: 0.30,
                ceiling: Some(0.70),
            },
            reserve: ClassBudget {
                share: 0.05,
                floor: 0.05,
                ceiling: None,
            },
        }
    }
}

/// The token ceiling resolved for each class, before the dynamic
/// redistribution step that hands L3's unused headroom to L2.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Allocation {
    /// Ceiling for the system prompt.
    pub system_ceiling: usize,
    /// Ceiling for the scratchpad.
    pub scratchpad_ceiling: usize,
    /// Ceiling for retrieved memory.
    pub memory_ceiling: usize,
    /// Tokens reserved for the completion.
    pub reserve_tokens: usize,
    /// Budget left for history after system/scratchpad/reserve are taken
    /// out of the window; the memory class is carved out of this at
    /// search time, and whatever memory doesn't use flows to history.
    pub remaining_after_fixed: usize,
}

impl BudgetConfig {
    /// Resolve ceilings and the remaining (memory + history) budget.
    pub fn allocate(&self) -> Allocation {
        let system_ceiling = self.system.tokens(self.window);
        let scratchpad_ceiling = self.scratchpad.tokens(self.window);
        let memory_ceiling = self.memory.tokens(self.window);
        let reserve_tokens = self.reserve.floor_tokens(self.window).max(
            (self.reserve.share * self.window as f64) as usize,
        );
        let remaining_after_fixed = self
            .window
            .saturating_sub(system_ceiling)
            .saturating_sub(scratchpad_ceiling)
            .saturating_sub(reserve_tokens);
        Allocation {
            system_ceiling,
            scratchpad_ceiling,
            memory_ceiling,
            reserve_tokens,
            remaining_after_fixed,
        }
    }

    /// History's hard floor, in tokens, used to detect an unsatisfiable
    /// allocation (too little left over once memory has taken its share).
    pub fn history_floor_tokens(&self) -> usize {
        self.history.floor_tokens(self.window)
    }

    /// History's hard ceiling, in tokens.
    pub fn history_ceiling_tokens(&self) -> usize {
        self.history.tokens(self.window)
    }
}
