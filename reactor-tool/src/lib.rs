#![deny(missing_docs)]
//! Tool interface and registry for reactor.
//!
//! Defines the [`ToolDyn`] trait for object-safe tool abstraction and
//! [`ToolRegistry`] for managing collections of tools. Any tool source
//! (local function, MCP server, HTTP endpoint) implements [`ToolDyn`].
//!
//! [`ToolRegistry::dispatch`] is the contract the agent loop drives: it
//! validates params against the tool's schema, enforces a per-tool
//! timeout, and always returns an [`Observation`] rather than letting a
//! handler panic or hang take the loop down with it.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors from tool operations.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ToolError {
    /// The requested tool was not found in the registry.
    #[error("tool not found: {0}")]
    NotFound(String),

    /// Tool execution failed.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// The input provided to the tool was invalid.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The tool did not complete within its timeout.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Classifies the kind of side effect a tool call may have.
///
/// The agent loop's loop-protection rule only fires for `Network` calls,
/// and `Finish` marks the one tool allowed to end the task.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SideEffectClass {
    /// Reads state without changing anything (file read, list, search).
    Read,
    /// Changes local state (file write/create/edit).
    Write,
    /// Runs external code (shell execution, code analysis that shells out).
    Exec,
    /// Performs a network request (search, web fetch).
    Network,
    /// Reads or writes the agent's own memory.
    Memory,
    /// The distinguished tool that ends the task.
    Finish,
}

/// The outcome of a tool call, as seen by the agent loop.
///
/// Handlers may return a plain string (wrapped as `ok: true`) or build an
/// `Observation` directly when they need to report failure without the
/// call itself erroring.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    /// Whether the tool call succeeded.
    pub ok: bool,
    /// Short, model-facing summary of the result.
    pub summary: String,
    /// Optional raw/full output, for tools whose summary is lossy.
    pub raw: Option<String>,
}

impl Observation {
    /// Build a successful observation.
    pub fn ok(summary: impl Into<String>) -> Self {
        Self {
            ok: true,
            summary: summary.into(),
            raw: None,
        }
    }

    /// Build a failed observation.
    pub fn failed(summary: impl Into<String>) -> Self {
        Self {
            ok: false,
            summary: summary.into(),
            raw: None,
        }
    }

    /// Attach raw/full output to this observation.
    pub fn with_raw(mut self, raw: impl Into<String>) -> Self {
        self.raw = Some(raw.into());
        self
    }
}

/// Object-safe trait for tool implementations.
///
/// Any tool source (local function, MCP server, HTTP endpoint) implements
/// this trait. Tools are stored as `Arc<dyn ToolDyn>` in [`ToolRegistry`].
pub trait ToolDyn: Send + Sync {
    /// The tool's unique name.
    fn name(&self) -> &str;

    /// Human-readable description of what the tool does.
    fn description(&self) -> &str;

    /// JSON Schema for the tool's input parameters.
    fn input_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given input.
    fn call(
        &self,
        input: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, ToolError>> + Send + '_>>;

    /// How this tool's calls should be classified for loop-protection and
    /// audit purposes. Defaults to `Read` for tools that don't override it.
    fn side_effect_class(&self) -> SideEffectClass {
        SideEffectClass::Read
    }

    /// Timeout applied to [`ToolDyn::call`] by [`ToolRegistry::dispatch`].
    /// Defaults to 30 seconds.
    fn timeout(&self) -> Duration {
        Duration::from_secs(30)
    }
}

/// Validate `input` against a tool's JSON Schema.
///
/// This is a structural check over the subset of JSON Schema the tool set
/// actually needs (`type: "object"`, `required`, and per-property `type`),
/// not a general-purpose schema engine. Returns a human-readable message
/// on the first violation found.
pub fn validate_against_schema(input: &serde_json::Value, schema: &serde_json::Value) -> Result<(), String> {
    let Some(schema_obj) = schema.as_object() else {
        return Ok(());
    };

    if schema_obj.get("type").and_then(|t| t.as_str()) == Some("object") && !input.is_object() {
        return Err("expected a JSON object".to_string());
    }

    let input_obj = input.as_object();

    if let Some(required) = schema_obj.get("required").and_then(|r| r.as_array()) {
        for field in required {
            let Some(field_name) = field.as_str() else {
                continue;
            };
            let present = input_obj.is_some_and(|obj| obj.contains_key(field_name));
            if !present {
                return Err(format!("missing required field: {field_name}"));
            }
        }
    }

    if let (Some(properties), Some(input_obj)) = (
        schema_obj.get("properties").and_then(|p| p.as_object()),
        input_obj,
    ) {
        for (key, value) in input_obj {
            let Some(prop_type) = properties
                .get(key)
                .and_then(|p| p.as_object())
                .and_then(|p| p.get("type"))
                .and_then(|t| t.as_str())
            else {
                continue;
            };
            if !json_value_matches_type(value, prop_type) {
                return Err(format!("field {key} does not match declared type {prop_type}"));
            }
        }
    }

    Ok(())
}

fn json_value_matches_type(value: &serde_json::Value, ty: &str) -> bool {
    match ty {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

/// Registry of tools available to a turn.
///
/// Holds tools as `Arc<dyn ToolDyn>` keyed by name. The turn's ReAct loop
/// uses this to look up and execute tools requested by the model.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolDyn>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. Overwrites any existing tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn ToolDyn>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn ToolDyn>> {
        self.tools.get(name)
    }

    /// Iterate over all registered tools.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ToolDyn>> {
        self.tools.values()
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Validate, dispatch with a timeout, and normalise the result into an
    /// [`Observation`]. Never returns `Err` for a missing tool or bad
    /// input — those are reported as a failed observation, matching the
    /// loop's "all tool-related errors are recovered locally" policy.
    pub async fn dispatch(&self, name: &str, params: serde_json::Value) -> Observation {
        let Some(tool) = self.get(name) else {
            return Observation::failed(format!("unknown tool: {name}"));
        };

        if let Err(reason) = validate_against_schema(&params, &tool.input_schema()) {
            return Observation::failed(format!("invalid params: {reason}"));
        }

        match tokio::time::timeout(tool.timeout(), tool.call(params)).await {
            Ok(Ok(value)) => Observation::ok(value.to_string()),
            Ok(Err(e)) => Observation::failed(e.to_string()),
            Err(_) => Observation::failed(format!(
                "tool {name} timed out after {:?}",
                tool.timeout()
            )),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn _assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn tool_dyn_is_object_safe() {
        _assert_send_sync::<Arc<dyn ToolDyn>>();
    }

    #[test]
    fn tool_error_display() {
        assert_eq!(
            ToolError::NotFound("bash".into()).to_string(),
            "tool not found: bash"
        );
        assert_eq!(
            ToolError::ExecutionFailed("timeout".into()).to_string(),
            "execution failed: timeout"
        );
        assert_eq!(
            ToolError::InvalidInput("missing field".into()).to_string(),
            "invalid input: missing field"
        );
    }

    struct EchoTool;

    impl ToolDyn for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echoes input back"
        }
        fn input_schema(&self) -> serde_json::Value {
            json!({"type": "object"})
        }
        fn call(
            &self,
            input: serde_json::Value,
        ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, ToolError>> + Send + '_>>
        {
            Box::pin(async move { Ok(json!({"echoed": input})) })
        }
    }

    struct FailTool;

    impl ToolDyn for FailTool {
        fn name(&self) -> &str {
            "fail"
        }
        fn description(&self) -> &str {
            "Always fails"
        }
        fn input_schema(&self) -> serde_json::Value {
            json!({"type": "object"})
        }
        fn call(
            &self,
            _input: serde_json::Value,
        ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, ToolError>> + Send + '_>>
        {
            Box::pin(async { Err(ToolError::ExecutionFailed("always fails".into())) })
        }
    }

    #[test]
    fn registry_add_and_get() {
        let mut reg = ToolRegistry::new();
        assert!(reg.is_empty());

        reg.register(Arc::new(EchoTool));
        assert_eq!(reg.len(), 1);
        assert!(reg.get("echo").is_some());
        assert!(reg.get("nonexistent").is_none());
    }

    #[test]
    fn registry_iter() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(EchoTool));
        reg.register(Arc::new(FailTool));

        let names: Vec<&str> = reg.iter().map(|t| t.name()).collect();
        assert!(names.contains(&"echo"));
        assert!(names.contains(&"fail"));
    }

    #[tokio::test]
    async fn registry_call_tool() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(EchoTool));

        let tool = reg.get("echo").unwrap();
        let result = tool.call(json!({"msg": "hello"})).await.unwrap();
        assert_eq!(result, json!({"echoed": {"msg": "hello"}}));
    }

    #[tokio::test]
    async fn registry_call_failing_tool() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(FailTool));

        let tool = reg.get("fail").unwrap();
        let result = tool.call(json!({})).await;
        assert!(result.is_err());
    }

    #[test]
    fn registry_overwrite() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(EchoTool));
        assert_eq!(reg.len(), 1);

        // Register another tool with the same name
        reg.register(Arc::new(EchoTool));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn default_side_effect_class_is_read() {
        assert_eq!(EchoTool.side_effect_class(), SideEffectClass::Read);
    }

    struct NetworkTool;

    impl ToolDyn for NetworkTool {
        fn name(&self) -> &str {
            "web_fetch"
        }
        fn description(&self) -> &str {
            "Fetches a URL"
        }
        fn input_schema(&self) -> serde_json::Value {
            json!({"type": "object", "required": ["url"], "properties": {"url": {"type": "string"}}})
        }
        fn call(
            &self,
            input: serde_json::Value,
        ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, ToolError>> + Send + '_>>
        {
            Box::pin(async move { Ok(json!({"fetched": input})) })
        }
        fn side_effect_class(&self) -> SideEffectClass {
            SideEffectClass::Network
        }
    }

    struct SlowTool;

    impl ToolDyn for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "Never finishes"
        }
        fn input_schema(&self) -> serde_json::Value {
            json!({"type": "object"})
        }
        fn call(
            &self,
            _input: serde_json::Value,
        ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, ToolError>> + Send + '_>>
        {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(json!({}))
            })
        }
        fn timeout(&self) -> Duration {
            Duration::from_millis(10)
        }
    }

    #[test]
    fn observation_builders() {
        let ok = Observation::ok("done").with_raw("full output");
        assert!(ok.ok);
        assert_eq!(ok.summary, "done");
        assert_eq!(ok.raw.as_deref(), Some("full output"));

        let failed = Observation::failed("bad input");
        assert!(!failed.ok);
    }

    #[test]
    fn validate_against_schema_requires_required_fields() {
        let schema = json!({"type": "object", "required": ["url"]});
        assert!(validate_against_schema(&json!({"url": "x"}), &schema).is_ok());
        assert!(validate_against_schema(&json!({}), &schema).is_err());
    }

    #[test]
    fn validate_against_schema_checks_property_types() {
        let schema = json!({
            "type": "object",
            "properties": {"count": {"type": "integer"}}
        });
        assert!(validate_against_schema(&json!({"count": 3}), &schema).is_ok());
        assert!(validate_against_schema(&json!({"count": "three"}), &schema).is_err());
    }

    #[test]
    fn validate_against_schema_rejects_non_object_when_object_required() {
        let schema = json!({"type": "object"});
        assert!(validate_against_schema(&json!("not an object"), &schema).is_err());
    }

    #[tokio::test]
    async fn dispatch_unknown_tool_is_failed_observation_not_error() {
        let reg = ToolRegistry::new();
        let obs = reg.dispatch("nonexistent", json!({})).await;
        assert!(!obs.ok);
        assert!(obs.summary.contains("unknown tool"));
    }

    #[tokio::test]
    async fn dispatch_invalid_params_skips_handler() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(NetworkTool));

        let obs = reg.dispatch("web_fetch", json!({})).await;
        assert!(!obs.ok);
        assert!(obs.summary.contains("invalid params"));
    }

    #[tokio::test]
    async fn dispatch_success_wraps_handler_output() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(EchoTool));

        let obs = reg.dispatch("echo", json!({"msg": "hi"})).await;
        assert!(obs.ok);
    }

    #[tokio::test]
    async fn dispatch_handler_error_is_failed_observation() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(FailTool));

        let obs = reg.dispatch("fail", json!({})).await;
        assert!(!obs.ok);
        assert!(obs.summary.contains("always fails"));
    }

    #[tokio::test]
    async fn dispatch_times_out_slow_tool() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(SlowTool));

        let obs = reg.dispatch("slow", json!({})).await;
        assert!(!obs.ok);
        assert!(obs.summary.contains("timed out"));
    }
}
