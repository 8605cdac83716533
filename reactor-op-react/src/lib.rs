#![deny(missing_docs)]
//! Agent loop operator — Reason/Act/Observe over flag-delimited model output.
//!
//! Implements `layer0::Operator` by running, per user task: assemble the
//! layered context (C5) → call the model → parse its response into an
//! [`reactor_parser::AgentStep`] (C1) → dispatch the chosen tool (C2) →
//! fold the observation back into the chat's scratchpad/history (C6) →
//! repeat until the model calls `finish` or the cycle limit is reached.
//!
//! Generalizes the workspace's existing hook dispatch
//! (`PreInference`/`PostInference`/`PreToolUse`/`PostToolUse`/`ExitCheck`)
//! and per-turn metadata/cost accounting from native provider tool-calling
//! to this flag-delimited text protocol; the cycle limit, loop-protection
//! fingerprint cache, and self-reflection injection are new state threaded
//! through the same loop shape.

use async_trait::async_trait;
use layer0::content::Content;
use layer0::duration::DurationMs;
use layer0::error::OperatorError;
use layer0::hook::{HookAction, HookContext, HookPoint};
use layer0::operator::{
    ExitReason, Operator, OperatorInput, OperatorMetadata, OperatorOutput, ToolCallRecord,
};
use reactor_context::{
    BudgetConfig, CompressorConfig, ContextError, ContextManager, MemoryConfig, extract_facts,
};
use reactor_hooks::HookRegistry;
use reactor_memory::{Embedder, MemoryScope, MemoryStore};
use reactor_parser::{AgentStep, ParseError, parse_agent_step};
use reactor_state_fs::chat::{Chat, ChatStore, ChatStoreError};
use reactor_tool::{SideEffectClass, ToolRegistry};
use reactor_turn::provider::Provider;
use reactor_turn::types::{ContentPart, ProviderMessage, ProviderRequest, Role, StopReason};
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Default number of reasoning cycles before a task times out.
pub const DEFAULT_MAX_CYCLES: u32 = 50;

/// How many times [`AgentLoop`] will retry context assembly, shrinking the
/// history ceiling or dropping memory retrieval, before giving up.
const MAX_ASSEMBLY_ATTEMPTS: usize = 3;

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Static configuration for an [`AgentLoop`] instance.
pub struct AgentConfig {
    /// Base system prompt, prepended to the rendered tool list and grammar.
    pub system_prompt: String,
    /// Default model identifier, used when the task doesn't override it.
    pub default_model: String,
    /// Default max tokens per model call.
    pub default_max_tokens: u32,
    /// Default cycle limit before a task returns a timeout result.
    pub max_cycles: u32,
    /// Five-class token budget for C5.
    pub budget: BudgetConfig,
    /// L3 retrieval tunables for C5.
    pub memory_config: MemoryConfig,
    /// Compression tunables for C4.
    pub compressor_config: CompressorConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            default_model: String::new(),
            default_max_tokens: 4096,
            max_cycles: DEFAULT_MAX_CYCLES,
            budget: BudgetConfig::default(),
            memory_config: MemoryConfig::default(),
            compressor_config: CompressorConfig::default(),
        }
    }
}

/// Resolved configuration merging defaults with per-request overrides.
struct ResolvedConfig {
    model: Option<String>,
    system: String,
    max_cycles: u32,
    max_cost: Option<Decimal>,
    max_duration: Option<DurationMs>,
    allowed_tools: Option<Vec<String>>,
    max_tokens: u32,
}

/// Drives the Reason/Act/Observe cycle over a chat's persisted state.
///
/// Generic over `P: Provider` and `E: Embedder` (neither is object-safe).
/// The object-safe boundary is `layer0::Operator`, implemented below via
/// `#[async_trait]`.
pub struct AgentLoop<P: Provider, E: Embedder> {
    provider: P,
    embedder: E,
    tools: ToolRegistry,
    chats: ChatStore,
    memory: Arc<MemoryStore>,
    hooks: HookRegistry,
    config: AgentConfig,
}

impl<P: Provider, E: Embedder> AgentLoop<P, E> {
    /// Create a new loop with all dependencies.
    ///
    /// `memory` is the shared store both this loop and any registered
    /// memory tools (list/add/delete) close over; they are ordinary
    /// `ToolDyn` entries in `tools`, not hardcoded here.
    pub fn new(
        provider: P,
        embedder: E,
        tools: ToolRegistry,
        chats: ChatStore,
        memory: Arc<MemoryStore>,
        hooks: HookRegistry,
        config: AgentConfig,
    ) -> Self {
        Self {
            provider,
            embedder,
            tools,
            chats,
            memory,
            hooks,
            config,
        }
    }

    fn resolve_config(&self, input: &OperatorInput) -> ResolvedConfig {
        let tc = input.config.as_ref();
        let system = match tc.and_then(|c| c.system_addendum.as_ref()) {
            Some(addendum) => format!("{}\n{}", self.config.system_prompt, addendum),
            None => self.config.system_prompt.clone(),
        };
        ResolvedConfig {
            model: tc.and_then(|c| c.model.clone()).or_else(|| {
                if self.config.default_model.is_empty() {
                    None
                } else {
                    Some(self.config.default_model.clone())
                }
            }),
            system,
            // `OperatorConfig` has no dedicated cycle-limit field; `max_turns`
            // plays that role here, matching the spec's framing of
            // `MAX_CYCLES` as the direct generalization of turn limits.
            max_cycles: tc
                .and_then(|c| c.max_turns)
                .unwrap_or(self.config.max_cycles),
            max_cost: tc.and_then(|c| c.max_cost),
            max_duration: tc.and_then(|c| c.max_duration),
            allowed_tools: tc.and_then(|c| c.allowed_tools.clone()),
            max_tokens: self.config.default_max_tokens,
        }
    }

    fn render_system_prompt(&self, config: &ResolvedConfig) -> String {
        let mut out = config.system.clone();
        out.push_str(
            "\n\nRespond with exactly one step in this format:\n\
             <THOUGHT>\n<your reasoning>\n\
             <TOOL>\n<tool name>\n\
             <PARAMS>\n<one-line JSON object>\n\
             <CONTENT>\n<optional raw payload>\n\
             <END>\n\n\
             Call `finish` with {\"final_answer\": \"...\"} once the task is done.\n\n\
             Available tools:\n",
        );
        for tool in self.tools.iter() {
            if let Some(allowed) = &config.allowed_tools {
                if !allowed.iter().any(|a| a == tool.name()) {
                    continue;
                }
            }
            out.push_str("- ");
            out.push_str(tool.name());
            out.push_str(": ");
            out.push_str(tool.description());
            out.push('\n');
        }
        out.push_str("- finish: End the task and return final_answer.\n");
        out
    }

    fn chat_id(&self, input: &OperatorInput) -> String {
        input
            .session
            .as_ref()
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|| "default".to_string())
    }

    async fn load_or_create_chat(&self, id: &str) -> Result<Chat, OperatorError> {
        match self.chats.load(id).await {
            Ok(chat) => Ok(chat),
            Err(ChatStoreError::NotFound(_)) => self
                .chats
                .create(id, id)
                .await
                .map_err(|e| OperatorError::Other(Box::new(e))),
            Err(e) => Err(OperatorError::Other(Box::new(e))),
        }
    }

    /// Assemble the next prompt, retrying with a shrunk history ceiling on
    /// overflow and disabling memory retrieval for the rest of the task if
    /// the memory index itself is the problem.
    async fn assemble_with_recovery(
        &self,
        system_prompt: &str,
        chat: &mut Chat,
        memory_scopes: &mut Vec<MemoryScope>,
        query_text: &str,
        current_turn: Vec<ProviderMessage>,
    ) -> Result<Vec<ProviderMessage>, OperatorError> {
        let mut budget = self.config.budget;
        for attempt in 0..MAX_ASSEMBLY_ATTEMPTS {
            let manager = ContextManager::new(
                &self.provider,
                budget,
                self.config.memory_config,
                self.config.compressor_config,
            );
            let outcome = manager
                .assemble(
                    system_prompt,
                    &mut chat.scratchpad,
                    &mut chat.history,
                    &self.memory,
                    &self.embedder,
                    memory_scopes,
                    query_text,
                    current_turn.clone(),
                )
                .await;
            match outcome {
                Ok(prompt) => return Ok(prompt),
                Err(ContextError::Overflow { .. }) if attempt + 1 < MAX_ASSEMBLY_ATTEMPTS => {
                    let ceiling = budget.history.ceiling.unwrap_or(budget.history.share);
                    budget.history.ceiling = Some((ceiling * 0.5).max(budget.history.floor));
                }
                Err(ContextError::Memory(e)) if !memory_scopes.is_empty() => {
                    tracing::warn!(error = %e, "disabling memory retrieval for this task");
                    memory_scopes.clear();
                }
                Err(e) => return Err(OperatorError::ContextAssembly(e.to_string())),
            }
        }
        Err(OperatorError::ContextAssembly(
            "context assembly did not converge".into(),
        ))
    }

    fn build_hook_context(
        &self,
        point: HookPoint,
        tokens_used: u64,
        cost: Decimal,
        turns_completed: u32,
        elapsed: DurationMs,
    ) -> HookContext {
        let mut ctx = HookContext::new(point);
        ctx.tokens_used = tokens_used;
        ctx.cost = cost;
        ctx.turns_completed = turns_completed;
        ctx.elapsed = elapsed;
        ctx
    }

    fn build_metadata(
        &self,
        tokens_in: u64,
        tokens_out: u64,
        cost: Decimal,
        turns_used: u32,
        tools_called: Vec<ToolCallRecord>,
        duration: DurationMs,
    ) -> OperatorMetadata {
        let mut meta = OperatorMetadata::default();
        meta.tokens_in = tokens_in;
        meta.tokens_out = tokens_out;
        meta.cost = cost;
        meta.turns_used = turns_used;
        meta.tools_called = tools_called;
        meta.duration = duration;
        meta
    }

    fn make_output(message: Content, exit_reason: ExitReason, metadata: OperatorMetadata) -> OperatorOutput {
        let mut output = OperatorOutput::new(message, exit_reason);
        output.metadata = metadata;
        output
    }
}

fn response_text(parts: &[ContentPart]) -> String {
    parts
        .iter()
        .filter_map(|part| match part {
            ContentPart::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn observation_message(summary: &str) -> ProviderMessage {
    ProviderMessage {
        role: Role::User,
        content: vec![ContentPart::Text {
            text: format!("Observation: {summary}"),
        }],
    }
}

fn assistant_message(raw: &str) -> ProviderMessage {
    ProviderMessage {
        role: Role::Assistant,
        content: vec![ContentPart::Text {
            text: raw.to_string(),
        }],
    }
}

fn directive_message(text: String) -> ProviderMessage {
    ProviderMessage {
        role: Role::User,
        content: vec![ContentPart::Text { text }],
    }
}

fn final_answer(step: &AgentStep) -> String {
    step.params
        .get("final_answer")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .or_else(|| step.content.clone())
        .unwrap_or_default()
}

fn timeout_content(thought: &str, observation: &str) -> Content {
    Content::text(format!(
        "Cycle limit reached.\nLast thought: {thought}\nLast observation: {observation}"
    ))
}

/// Canonical key for loop protection: tool name plus normalized params, so
/// whitespace or key order don't defeat duplicate detection.
fn fingerprint(tool: &str, params: &Value) -> String {
    format!("{tool}:{}", normalize_value(params))
}

fn normalize_value(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let parts: Vec<String> = entries
                .iter()
                .map(|(k, v)| format!("{k}={}", normalize_value(v)))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(normalize_value).collect();
            format!("[{}]", parts.join(","))
        }
        Value::String(s) => s.trim().to_lowercase(),
        other => other.to_string(),
    }
}

#[async_trait]
impl<P: Provider + 'static, E: Embedder + 'static> Operator for AgentLoop<P, E> {
    async fn execute(&self, input: OperatorInput) -> Result<OperatorOutput, OperatorError> {
        let start = Instant::now();
        let config = self.resolve_config(&input);
        let chat_id = self.chat_id(&input);
        let mut chat = self.load_or_create_chat(&chat_id).await?;
        let mut memory_scopes = vec![MemoryScope::Chat(chat_id.clone()), MemoryScope::Global];

        let user_text = input.message.as_text().unwrap_or_default().to_string();
        chat.scratchpad.goal = user_text.clone();
        chat.history.push(ProviderMessage {
            role: Role::User,
            content: vec![ContentPart::Text {
                text: user_text.clone(),
            }],
        });

        let system_prompt = self.render_system_prompt(&config);

        let mut total_tokens_in: u64 = 0;
        let mut total_tokens_out: u64 = 0;
        let mut total_cost = Decimal::ZERO;
        let mut cycles_used: u32 = 0;
        let mut tool_records: Vec<ToolCallRecord> = vec![];
        let mut seen_network_calls: HashSet<String> = HashSet::new();
        let mut reflected_tools: HashSet<String> = HashSet::new();
        let mut pending_directive: Option<String> = None;
        let mut last_thought = String::new();
        let mut last_observation = String::new();

        let result = loop {
            cycles_used += 1;
            let elapsed = || DurationMs::from(start.elapsed());

            let hook_ctx = self.build_hook_context(
                HookPoint::PreInference,
                total_tokens_in + total_tokens_out,
                total_cost,
                cycles_used - 1,
                elapsed(),
            );
            if let HookAction::Halt { reason } = self.hooks.dispatch(&hook_ctx).await {
                break Ok(Self::make_output(
                    Content::text(last_thought.clone()),
                    ExitReason::ObserverHalt { reason },
                    self.build_metadata(
                        total_tokens_in,
                        total_tokens_out,
                        total_cost,
                        cycles_used,
                        tool_records.clone(),
                        elapsed(),
                    ),
                ));
            }

            let mut current_turn = Vec::new();
            if let Some(directive) = pending_directive.take() {
                current_turn.push(directive_message(directive));
            }

            let prompt = match self
                .assemble_with_recovery(
                    &system_prompt,
                    &mut chat,
                    &mut memory_scopes,
                    &user_text,
                    current_turn,
                )
                .await
            {
                Ok(prompt) => prompt,
                Err(e) => break Err(e),
            };

            let request = ProviderRequest {
                model: config.model.clone(),
                messages: prompt,
                tools: vec![],
                max_tokens: Some(config.max_tokens),
                temperature: None,
                system: Some(system_prompt.clone()),
                extra: input.metadata.clone(),
            };

            let response = match self.provider.complete(request).await {
                Ok(r) => r,
                Err(e) => {
                    break Err(if e.is_retryable() {
                        OperatorError::Retryable(e.to_string())
                    } else {
                        OperatorError::Model(e.to_string())
                    });
                }
            };

            total_tokens_in += response.usage.input_tokens;
            total_tokens_out += response.usage.output_tokens;
            if let Some(cost) = response.cost {
                total_cost += cost;
            }

            let mut hook_ctx = self.build_hook_context(
                HookPoint::PostInference,
                total_tokens_in + total_tokens_out,
                total_cost,
                cycles_used,
                elapsed(),
            );
            hook_ctx.model_output = Some(reactor_turn::convert::parts_to_content(&response.content));
            if let HookAction::Halt { reason } = self.hooks.dispatch(&hook_ctx).await {
                break Ok(Self::make_output(
                    Content::text(last_thought.clone()),
                    ExitReason::ObserverHalt { reason },
                    self.build_metadata(
                        total_tokens_in,
                        total_tokens_out,
                        total_cost,
                        cycles_used,
                        tool_records.clone(),
                        elapsed(),
                    ),
                ));
            }

            if response.stop_reason == StopReason::ContentFilter {
                break Err(OperatorError::Model("content filtered".into()));
            }

            let raw_text = response_text(&response.content);
            chat.history.push(assistant_message(&raw_text));

            let step = match parse_agent_step(&raw_text) {
                Ok(step) => step,
                Err(e) => {
                    let message = parse_error_guidance(&e);
                    chat.history.push(observation_message(&message));
                    chat.scratchpad.set_last_observation(message.clone());
                    last_observation = message;
                    if cycles_used >= config.max_cycles {
                        break Ok(Self::make_output(
                            timeout_content(&last_thought, &last_observation),
                            ExitReason::MaxTurns,
                            self.build_metadata(
                                total_tokens_in,
                                total_tokens_out,
                                total_cost,
                                cycles_used,
                                tool_records.clone(),
                                elapsed(),
                            ),
                        ));
                    }
                    continue;
                }
            };
            last_thought = step.thought.clone();

            if step.tool == "finish" {
                break Ok(Self::make_output(
                    Content::text(final_answer(&step)),
                    ExitReason::Complete,
                    self.build_metadata(
                        total_tokens_in,
                        total_tokens_out,
                        total_cost,
                        cycles_used,
                        tool_records.clone(),
                        elapsed(),
                    ),
                ));
            }

            let side_effect = self
                .tools
                .get(&step.tool)
                .map(|t| t.side_effect_class())
                .unwrap_or(SideEffectClass::Read);

            if side_effect == SideEffectClass::Network {
                let fp = fingerprint(&step.tool, &step.params);
                if !seen_network_calls.insert(fp) {
                    let guidance = format!(
                        "You already called `{}` with these parameters. Reuse the prior observation ({}) or narrow the query instead of repeating the call.",
                        step.tool, last_observation
                    );
                    chat.history.push(observation_message(&guidance));
                    chat.scratchpad.set_last_observation(guidance.clone());
                    last_observation = guidance;
                    if cycles_used >= config.max_cycles {
                        break Ok(Self::make_output(
                            timeout_content(&last_thought, &last_observation),
                            ExitReason::MaxTurns,
                            self.build_metadata(
                                total_tokens_in,
                                total_tokens_out,
                                total_cost,
                                cycles_used,
                                tool_records.clone(),
                                elapsed(),
                            ),
                        ));
                    }
                    continue;
                }
            }

            let mut hook_ctx = HookContext::new(HookPoint::PreToolUse);
            hook_ctx.tool_name = Some(step.tool.clone());
            hook_ctx.tool_input = Some(step.params.clone());
            hook_ctx.tokens_used = total_tokens_in + total_tokens_out;
            hook_ctx.cost = total_cost;
            hook_ctx.turns_completed = cycles_used;
            hook_ctx.elapsed = elapsed();

            let mut actual_params = step.params.clone();
            match self.hooks.dispatch(&hook_ctx).await {
                HookAction::Halt { reason } => {
                    break Ok(Self::make_output(
                        Content::text(last_thought.clone()),
                        ExitReason::ObserverHalt { reason },
                        self.build_metadata(
                            total_tokens_in,
                            total_tokens_out,
                            total_cost,
                            cycles_used,
                            tool_records.clone(),
                            elapsed(),
                        ),
                    ));
                }
                HookAction::SkipTool { reason } => {
                    let guidance = format!("Skipped: {reason}");
                    chat.history.push(observation_message(&guidance));
                    chat.scratchpad.set_last_observation(guidance.clone());
                    last_observation = guidance;
                    tool_records.push(ToolCallRecord::new(step.tool.clone(), DurationMs::ZERO, false));
                    if cycles_used >= config.max_cycles {
                        break Ok(Self::make_output(
                            timeout_content(&last_thought, &last_observation),
                            ExitReason::MaxTurns,
                            self.build_metadata(
                                total_tokens_in,
                                total_tokens_out,
                                total_cost,
                                cycles_used,
                                tool_records.clone(),
                                elapsed(),
                            ),
                        ));
                    }
                    continue;
                }
                HookAction::ModifyToolInput { new_input } => actual_params = new_input,
                HookAction::Continue => {}
                _ => {}
            }

            let tool_start = Instant::now();
            let mut observation = self.tools.dispatch(&step.tool, actual_params).await;
            let tool_duration = DurationMs::from(tool_start.elapsed());
            tool_records.push(ToolCallRecord::new(step.tool.clone(), tool_duration, observation.ok));

            let mut hook_ctx = HookContext::new(HookPoint::PostToolUse);
            hook_ctx.tool_name = Some(step.tool.clone());
            hook_ctx.tool_result = Some(observation.summary.clone());
            hook_ctx.tokens_used = total_tokens_in + total_tokens_out;
            hook_ctx.cost = total_cost;
            hook_ctx.turns_completed = cycles_used;
            hook_ctx.elapsed = elapsed();

            match self.hooks.dispatch(&hook_ctx).await {
                HookAction::Halt { reason } => {
                    break Ok(Self::make_output(
                        Content::text(last_thought.clone()),
                        ExitReason::ObserverHalt { reason },
                        self.build_metadata(
                            total_tokens_in,
                            total_tokens_out,
                            total_cost,
                            cycles_used,
                            tool_records.clone(),
                            elapsed(),
                        ),
                    ));
                }
                HookAction::ModifyToolOutput { new_output } => {
                    observation.summary = new_output.to_string();
                }
                _ => {}
            }

            if !observation.ok && reflected_tools.insert(step.tool.clone()) {
                pending_directive = Some(format!(
                    "The previous tool call to `{}` failed with: {}. Propose a different approach.",
                    step.tool, observation.summary
                ));
            }

            chat.history.push(observation_message(&observation.summary));
            chat.scratchpad.set_last_observation(observation.summary.clone());
            last_observation = observation.summary.clone();

            for fact in extract_facts(&[observation_message(&observation.summary)])
                .into_iter()
                .filter(|f| f.importance >= self.config.memory_config.fact_importance_floor)
            {
                chat.scratchpad.push_fact(fact.text);
            }

            if cycles_used >= config.max_cycles {
                break Ok(Self::make_output(
                    timeout_content(&last_thought, &last_observation),
                    ExitReason::MaxTurns,
                    self.build_metadata(
                        total_tokens_in,
                        total_tokens_out,
                        total_cost,
                        cycles_used,
                        tool_records.clone(),
                        elapsed(),
                    ),
                ));
            }

            if let Some(max_cost) = config.max_cost {
                if total_cost >= max_cost {
                    break Ok(Self::make_output(
                        timeout_content(&last_thought, &last_observation),
                        ExitReason::BudgetExhausted,
                        self.build_metadata(
                            total_tokens_in,
                            total_tokens_out,
                            total_cost,
                            cycles_used,
                            tool_records.clone(),
                            elapsed(),
                        ),
                    ));
                }
            }

            if let Some(max_duration) = config.max_duration {
                if start.elapsed() >= max_duration.to_std() {
                    break Ok(Self::make_output(
                        timeout_content(&last_thought, &last_observation),
                        ExitReason::Timeout,
                        self.build_metadata(
                            total_tokens_in,
                            total_tokens_out,
                            total_cost,
                            cycles_used,
                            tool_records.clone(),
                            elapsed(),
                        ),
                    ));
                }
            }

            let hook_ctx = self.build_hook_context(
                HookPoint::ExitCheck,
                total_tokens_in + total_tokens_out,
                total_cost,
                cycles_used,
                elapsed(),
            );
            if let HookAction::Halt { reason } = self.hooks.dispatch(&hook_ctx).await {
                break Ok(Self::make_output(
                    Content::text(last_thought.clone()),
                    ExitReason::ObserverHalt { reason },
                    self.build_metadata(
                        total_tokens_in,
                        total_tokens_out,
                        total_cost,
                        cycles_used,
                        tool_records.clone(),
                        elapsed(),
                    ),
                ));
            }
        };

        chat.metadata.updated_at = now_unix();
        let _ = self.chats.save(&chat).await;
        result
    }
}

fn parse_error_guidance(e: &ParseError) -> String {
    format!(
        "Your previous response could not be parsed ({e}). Respond using the <THOUGHT>/<TOOL>/<PARAMS>/<CONTENT>/<END> format."
    )
}
