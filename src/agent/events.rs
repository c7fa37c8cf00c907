//! Typed view of the agent's structured output stream.
//!
//! The agent emits one JSON event per stdout line. Lines that fail to parse
//! are kept as [`AgentEvent::Raw`] rather than dropped, so observers always
//! see the complete stream.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::LogSeverity;

/// Events emitted by the agent CLI in structured output mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        model: Option<String>,
    },
    Assistant {
        message: AssistantMessage,
    },
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },
    Result(ResultEvent),
    Error {
        message: String,
    },
    /// A line the parser could not recognise, kept verbatim.
    Raw {
        line: String,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        name: String,
        #[serde(default)]
        input: Value,
    },
}

/// Terminal event carrying final text, token usage, and cost.
///
/// The exact field layout is agent-version-specific: cost may arrive as
/// top-level `cost`, as `total_cost_usd`, or nested under `usage`, and
/// usage may be missing entirely. All shapes are tolerated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, alias = "total_cost_usd", skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

impl ResultEvent {
    pub fn input_tokens(&self) -> Option<i64> {
        self.usage.as_ref().and_then(|u| u.input_tokens)
    }

    pub fn output_tokens(&self) -> Option<i64> {
        self.usage.as_ref().and_then(|u| u.output_tokens)
    }

    pub fn cost_usd(&self) -> Option<f64> {
        self.cost.or_else(|| self.usage.as_ref().and_then(|u| u.cost))
    }
}

/// Parse one stdout line into a typed event, falling back to `Raw`.
pub fn parse_line(line: &str) -> AgentEvent {
    match serde_json::from_str::<AgentEvent>(line) {
        Ok(event) => event,
        Err(_) => AgentEvent::Raw {
            line: line.to_string(),
        },
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max).collect();
        format!("{}...", cut)
    }
}

impl AgentEvent {
    /// Log severity for the entry mirroring this event.
    pub fn severity(&self) -> LogSeverity {
        match self {
            AgentEvent::Error { .. } => LogSeverity::Error,
            _ => LogSeverity::Info,
        }
    }

    /// Short UI-visible summary for the task log.
    pub fn summary(&self) -> String {
        match self {
            AgentEvent::System { model, .. } => match model {
                Some(m) => format!("agent session started (model {})", m),
                None => "agent session started".to_string(),
            },
            AgentEvent::Assistant { message } => {
                let mut parts = Vec::new();
                for block in &message.content {
                    match block {
                        ContentBlock::Text { text } => parts.push(truncate(text, 200)),
                        ContentBlock::ToolUse { name, .. } => {
                            parts.push(format!("[tool: {}]", name))
                        }
                    }
                }
                if parts.is_empty() {
                    "assistant message".to_string()
                } else {
                    parts.join(" ")
                }
            }
            AgentEvent::ToolUse { name, input } => {
                let args = serde_json::to_string(input).unwrap_or_default();
                format!("tool: {} {}", name, truncate(&args, 120))
            }
            AgentEvent::Result(res) => {
                let label = res.subtype.as_deref().unwrap_or("result");
                match (res.input_tokens(), res.output_tokens(), res.cost_usd()) {
                    (Some(i), Some(o), Some(c)) => {
                        format!("{}: {} in / {} out tokens, ${:.4}", label, i, o, c)
                    }
                    _ => label.to_string(),
                }
            }
            AgentEvent::Error { message } => truncate(message, 200),
            AgentEvent::Raw { line } => truncate(line, 200),
        }
    }

    /// Text contributed to the final `output` accumulation.
    pub fn assistant_text(&self) -> Option<String> {
        match self {
            AgentEvent::Assistant { message } => {
                let text: Vec<&str> = message
                    .content
                    .iter()
                    .filter_map(|block| match block {
                        ContentBlock::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect();
                if text.is_empty() {
                    None
                } else {
                    Some(text.join("\n"))
                }
            }
            _ => None,
        }
    }

    pub fn as_result(&self) -> Option<&ResultEvent> {
        match self {
            AgentEvent::Result(res) => Some(res),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_system_event() {
        let line = r#"{"type":"system","subtype":"init","model":"sonnet-4","session_id":"abc"}"#;
        match parse_line(line) {
            AgentEvent::System { subtype, model } => {
                assert_eq!(subtype.as_deref(), Some("init"));
                assert_eq!(model.as_deref(), Some("sonnet-4"));
            }
            other => panic!("expected System event, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_assistant_with_text_and_tool_use() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"working on it"},{"type":"tool_use","id":"toolu_1","name":"Bash","input":{"command":"ls"}}]}}"#;
        let event = parse_line(line);
        assert_eq!(event.assistant_text().as_deref(), Some("working on it"));
        assert!(event.summary().contains("[tool: Bash]"));
        assert_eq!(event.severity(), LogSeverity::Info);
    }

    #[test]
    fn test_parse_result_with_nested_usage() {
        let line = r#"{"type":"result","subtype":"success","result":"Done","usage":{"input_tokens":10,"output_tokens":5},"total_cost_usd":0.01}"#;
        let event = parse_line(line);
        let res = event.as_result().expect("expected Result event");
        assert_eq!(res.result.as_deref(), Some("Done"));
        assert_eq!(res.input_tokens(), Some(10));
        assert_eq!(res.output_tokens(), Some(5));
        assert_eq!(res.cost_usd(), Some(0.01));
    }

    #[test]
    fn test_parse_result_cost_variants() {
        // Top-level `cost`.
        let res = parse_line(r#"{"type":"result","cost":0.5}"#);
        assert_eq!(res.as_result().unwrap().cost_usd(), Some(0.5));

        // Nested under usage.
        let res = parse_line(r#"{"type":"result","usage":{"cost":0.25}}"#);
        assert_eq!(res.as_result().unwrap().cost_usd(), Some(0.25));

        // Missing entirely.
        let res = parse_line(r#"{"type":"result","subtype":"success"}"#);
        let res = res.as_result().unwrap();
        assert_eq!(res.cost_usd(), None);
        assert_eq!(res.input_tokens(), None);
    }

    #[test]
    fn test_parse_error_event() {
        let event = parse_line(r#"{"type":"error","message":"rate limited"}"#);
        assert_eq!(event.severity(), LogSeverity::Error);
        assert_eq!(event.summary(), "rate limited");
    }

    #[test]
    fn test_unrecognised_line_becomes_raw() {
        let event = parse_line("plain text, not json");
        match &event {
            AgentEvent::Raw { line } => assert_eq!(line, "plain text, not json"),
            other => panic!("expected Raw, got {:?}", other),
        }
        assert_eq!(event.severity(), LogSeverity::Info);

        // Valid JSON with an unknown tag is also kept raw.
        let event = parse_line(r#"{"type":"telemetry","data":1}"#);
        assert!(matches!(event, AgentEvent::Raw { .. }));
    }

    #[test]
    fn test_round_trip_preserves_semantic_fields() {
        let line = r#"{"type":"result","subtype":"success","result":"final text","usage":{"input_tokens":100,"output_tokens":42},"total_cost_usd":0.07}"#;
        let event = parse_line(line);
        let encoded = serde_json::to_string(&event).unwrap();
        let reparsed = parse_line(&encoded);
        let (a, b) = (event.as_result().unwrap(), reparsed.as_result().unwrap());
        assert_eq!(a.result, b.result);
        assert_eq!(a.input_tokens(), b.input_tokens());
        assert_eq!(a.output_tokens(), b.output_tokens());
        assert_eq!(a.cost_usd(), b.cost_usd());

        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hello"}]}}"#;
        let event = parse_line(line);
        let reparsed = parse_line(&serde_json::to_string(&event).unwrap());
        assert_eq!(event.assistant_text(), reparsed.assistant_text());
    }

    #[test]
    fn test_oversized_event_parses_whole() {
        let big_text = "x".repeat(2 * 1024 * 1024);
        let line = format!(
            r#"{{"type":"assistant","message":{{"content":[{{"type":"text","text":"{}"}}]}}}}"#,
            big_text
        );
        let event = parse_line(&line);
        assert_eq!(event.assistant_text().map(|t| t.len()), Some(big_text.len()));
    }
}
