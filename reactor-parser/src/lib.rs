#![deny(missing_docs)]
//! Parses raw model text into a structured [`AgentStep`].
//!
//! The primary format is flag-delimited to avoid quoting pathologies in
//! model output:
//!
//! ```text
//! <THOUGHT>
//! <free text>
//! <TOOL>
//! <tool name>
//! <PARAMS>
//! <one-line JSON object>
//! <CONTENT>
//! <raw multi-line payload; terminated by <END>>
//! <END>
//! ```
//!
//! `<THOUGHT>` and `<TOOL>` are required by the model but the parser
//! tolerates a missing thought. When the flag format can't be recognised
//! at all, [`parse_agent_step`] falls back to a single top-level JSON
//! object with fields `thought`, `tool`, `params`, `content?`.

use serde_json::Value;
use thiserror::Error;

/// A parsed reasoning step: thought, chosen tool, its parameters, and an
/// optional raw content payload for tools that accept free-form bodies.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentStep {
    /// The model's reasoning for this step. Empty if omitted.
    pub thought: String,
    /// Name of the tool to invoke.
    pub tool: String,
    /// Tool parameters, parsed as a JSON object (empty object if absent).
    pub params: Value,
    /// Raw multi-line payload for tools that accept free-form bodies
    /// (file writes, long strings). `None` if no `<CONTENT>` block.
    pub content: Option<String>,
}

/// Errors from parsing a model response into an [`AgentStep`].
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ParseError {
    /// Neither the flag format nor the JSON fallback yielded a tool name.
    #[error("no tool name found in flag format or JSON fallback")]
    NoTool,

    /// The JSON fallback text could not be parsed as a JSON object.
    #[error("JSON fallback is not a valid object: {0}")]
    InvalidJson(String),
}

const THOUGHT: &str = "<THOUGHT>";
const TOOL: &str = "<TOOL>";
const PARAMS: &str = "<PARAMS>";
const CONTENT: &str = "<CONTENT>";
const END: &str = "<END>";

/// Parse raw model output into an [`AgentStep`].
///
/// Tries the flag-delimited primary format first; if no `<TOOL>` marker
/// (and non-empty tool name) is found, falls back to parsing `raw` as a
/// single JSON object with `tool`/`thought`/`params`/`content` fields.
pub fn parse_agent_step(raw: &str) -> Result<AgentStep, ParseError> {
    if let Some(step) = parse_flag_format(raw) {
        return Ok(step);
    }
    parse_json_fallback(raw)
}

/// Render an [`AgentStep`] back into the canonical flag form.
///
/// Used by tests to check `parse(emit(s)) == s`; the runtime loop never
/// calls this (model output is never synthesised by the agent itself).
pub fn emit_agent_step(step: &AgentStep) -> String {
    let mut out = String::new();
    out.push_str(THOUGHT);
    out.push('\n');
    out.push_str(&step.thought);
    out.push('\n');
    out.push_str(TOOL);
    out.push('\n');
    out.push_str(&step.tool);
    out.push('\n');
    out.push_str(PARAMS);
    out.push('\n');
    out.push_str(&step.params.to_string());
    if let Some(content) = &step.content {
        out.push('\n');
        out.push_str(CONTENT);
        out.push('\n');
        out.push_str(content);
        out.push('\n');
        out.push_str(END);
    }
    out
}

/// Find the byte offset of `marker` when it starts a line: either at the
/// very beginning of `s`, or immediately after a `\n`.
fn find_line_marker(s: &str, marker: &str) -> Option<usize> {
    if s.starts_with(marker) {
        return Some(0);
    }
    let pattern = format!("\n{marker}");
    s.find(&pattern).map(|i| i + 1)
}

fn parse_flag_format(raw: &str) -> Option<AgentStep> {
    let tool_pos = find_line_marker(raw, TOOL)?;
    let thought_pos = find_line_marker(raw, THOUGHT);
    let params_pos = find_line_marker(raw, PARAMS).filter(|&p| p > tool_pos);
    let content_pos = find_line_marker(raw, CONTENT).filter(|&p| p > tool_pos);
    let end_pos = find_line_marker(raw, END).filter(|&p| p > tool_pos);

    let thought = thought_pos
        .filter(|&p| p < tool_pos)
        .map(|p| raw[p + THOUGHT.len()..tool_pos].trim().to_string())
        .unwrap_or_default();

    let tool_seg_end = [params_pos, content_pos, end_pos]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(raw.len());
    let tool = raw[tool_pos + TOOL.len()..tool_seg_end].trim().to_string();
    if tool.is_empty() {
        return None;
    }

    let params = match params_pos {
        Some(p) => {
            let seg_end = [content_pos, end_pos]
                .into_iter()
                .flatten()
                .min()
                .unwrap_or(raw.len());
            let text = raw[p + PARAMS.len()..seg_end].trim();
            serde_json::from_str::<Value>(text).unwrap_or_else(|_| serde_json::json!({}))
        }
        None => serde_json::json!({}),
    };

    let content = content_pos.map(|p| {
        let mut start = p + CONTENT.len();
        if raw.as_bytes().get(start) == Some(&b'\n') {
            start += 1;
        }
        let seg_end = match end_pos {
            Some(ep) if ep > 0 && raw.as_bytes().get(ep - 1) == Some(&b'\n') && ep - 1 >= start => {
                ep - 1
            }
            Some(ep) => ep,
            None => raw.len(),
        };
        raw[start..seg_end.max(start)].to_string()
    });

    Some(AgentStep {
        thought,
        tool,
        params,
        content,
    })
}

fn parse_json_fallback(raw: &str) -> Result<AgentStep, ParseError> {
    let value: Value =
        serde_json::from_str(raw.trim()).map_err(|e| ParseError::InvalidJson(e.to_string()))?;
    let obj = value
        .as_object()
        .ok_or_else(|| ParseError::InvalidJson("top-level value is not an object".into()))?;
    let tool = obj
        .get("tool")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or(ParseError::NoTool)?
        .to_string();
    let thought = obj
        .get("thought")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let params = obj.get("params").cloned().unwrap_or_else(|| serde_json::json!({}));
    let content = obj.get("content").and_then(Value::as_str).map(str::to_string);

    Ok(AgentStep {
        thought,
        tool,
        params,
        content,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_full_flag_format() {
        let raw = "<THOUGHT>\nI should look at the file\n<TOOL>\nread_file\n<PARAMS>\n{\"path\":\"a.txt\"}\n<CONTENT>\nhello\nworld\n<END>";
        let step = parse_agent_step(raw).unwrap();
        assert_eq!(step.thought, "I should look at the file");
        assert_eq!(step.tool, "read_file");
        assert_eq!(step.params, json!({"path": "a.txt"}));
        assert_eq!(step.content.as_deref(), Some("hello\nworld"));
    }

    #[test]
    fn missing_thought_synthesises_empty_thought() {
        // S5: <THOUGHT> block missing but <TOOL> and <PARAMS> present.
        let raw = "<TOOL>\nfinish\n<PARAMS>\n{\"final_answer\":\"done\"}";
        let step = parse_agent_step(raw).unwrap();
        assert_eq!(step.thought, "");
        assert_eq!(step.tool, "finish");
        assert_eq!(step.params, json!({"final_answer": "done"}));
    }

    #[test]
    fn missing_params_defaults_to_empty_object() {
        let raw = "<THOUGHT>\nthinking\n<TOOL>\nfinish";
        let step = parse_agent_step(raw).unwrap();
        assert_eq!(step.params, json!({}));
        assert_eq!(step.content, None);
    }

    #[test]
    fn content_preserves_interior_whitespace_and_regex() {
        // Property 5: arbitrary regex, nested braces, raw multi-line code.
        let raw = "<THOUGHT>\nextracting\n<TOOL>\ncreate_file\n<PARAMS>\n{\"path\":\"p.py\"}\n<CONTENT>\nimport re\n\npattern = re.compile(r'\\d+\\.\\d+')\n\ndef f(x):\n    return {\"a\": {\"b\": 1}}\n<END>";
        let step = parse_agent_step(raw).unwrap();
        assert_eq!(
            step.content.as_deref(),
            Some("import re\n\npattern = re.compile(r'\\d+\\.\\d+')\n\ndef f(x):\n    return {\"a\": {\"b\": 1}}")
        );
    }

    #[test]
    fn content_without_end_marker_runs_to_end_of_string() {
        let raw = "<TOOL>\ncreate_file\n<CONTENT>\nunterminated payload";
        let step = parse_agent_step(raw).unwrap();
        assert_eq!(step.content.as_deref(), Some("unterminated payload"));
    }

    #[test]
    fn json_fallback_when_no_flag_format() {
        let raw = r#"{"thought": "ok", "tool": "finish", "params": {"final_answer": "x"}}"#;
        let step = parse_agent_step(raw).unwrap();
        assert_eq!(step.thought, "ok");
        assert_eq!(step.tool, "finish");
        assert_eq!(step.params, json!({"final_answer": "x"}));
    }

    #[test]
    fn json_fallback_with_content_field() {
        let raw = r#"{"tool": "create_file", "content": "line1\nline2"}"#;
        let step = parse_agent_step(raw).unwrap();
        assert_eq!(step.content.as_deref(), Some("line1\nline2"));
    }

    #[test]
    fn no_tool_anywhere_is_parse_error() {
        let raw = "just some prose with no markers and no json";
        let err = parse_agent_step(raw).unwrap_err();
        assert!(matches!(err, ParseError::InvalidJson(_)));
    }

    #[test]
    fn json_fallback_missing_tool_field_is_no_tool_error() {
        let raw = r#"{"thought": "hmm"}"#;
        let err = parse_agent_step(raw).unwrap_err();
        assert!(matches!(err, ParseError::NoTool));
    }

    #[test]
    fn empty_tool_name_in_flag_format_falls_back_to_json() {
        // <TOOL> present but the segment before the next marker is blank ->
        // flag format rejected (empty tool name), JSON fallback tried. The
        // raw text as a whole still isn't valid JSON, so this ends up an
        // InvalidJson error rather than silently accepting an empty tool.
        let raw = "<TOOL>\n<PARAMS>\n{}\n";
        let err = parse_agent_step(raw).unwrap_err();
        assert!(matches!(err, ParseError::InvalidJson(_)));
    }

    #[test]
    fn round_trip_emit_then_parse() {
        let step = AgentStep {
            thought: "Let's check the docs".to_string(),
            tool: "web_fetch".to_string(),
            params: json!({"url": "https://example.com"}),
            content: Some("body text\nwith a second line".to_string()),
        };
        let emitted = emit_agent_step(&step);
        let parsed = parse_agent_step(&emitted).unwrap();
        assert_eq!(parsed, step);
    }

    #[test]
    fn round_trip_without_content() {
        let step = AgentStep {
            thought: String::new(),
            tool: "finish".to_string(),
            params: json!({"final_answer": "done"}),
            content: None,
        };
        let emitted = emit_agent_step(&step);
        let parsed = parse_agent_step(&emitted).unwrap();
        assert_eq!(parsed, step);
    }

    #[test]
    fn round_trip_with_empty_content() {
        let step = AgentStep {
            thought: "t".to_string(),
            tool: "create_file".to_string(),
            params: json!({}),
            content: Some(String::new()),
        };
        let emitted = emit_agent_step(&step);
        let parsed = parse_agent_step(&emitted).unwrap();
        assert_eq!(parsed, step);
    }
}
