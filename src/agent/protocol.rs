//! Line-JSON protocol types for agent CLI communication
//!
//! Every message on the agent's stdio is one JSON object per line. Outbound
//! frames are [`UserInput`]; inbound frames are [`Envelope`]. The envelope
//! payload is treated as opaque here; classification happens in the
//! dispatcher.

use serde::{Deserialize, Serialize};

/// One inbound frame from the agent's stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type (`system`, `message`, `text`, `tool_use`, `error`, ...)
    #[serde(rename = "type")]
    pub kind: String,

    /// Optional subtype (`init`, `start`, `result`, `process_error`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,

    /// Opaque payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<serde_json::Value>,

    /// Agent-assigned session id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// Parent tool-use id for nested tool output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_tool_use_id: Option<String>,

    /// Result text for terminal envelopes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,

    /// Error marker
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_error: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl Envelope {
    /// Whether this is the agent's `{type:"system", subtype:"init"}` envelope.
    pub fn is_init(&self) -> bool {
        self.kind == "system" && self.subtype.as_deref() == Some("init")
    }

    /// Build a `process_error` envelope from a classified stderr line.
    ///
    /// The payload is constructed as a JSON value so embedded quotes in the
    /// stderr text are always escaped correctly.
    pub fn process_error(session_id: &str, stderr_line: &str) -> Self {
        let payload = serde_json::json!({
            "error": friendly_stderr_message(stderr_line),
            "source": "agent_process",
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "details": stderr_line,
        });
        Self {
            kind: "error".to_string(),
            subtype: Some("process_error".to_string()),
            message: Some(payload),
            session_id: Some(session_id.to_string()),
            parent_tool_use_id: None,
            result: None,
            is_error: true,
        }
    }
}

/// One outbound frame to the agent's stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInput {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: InputMessage,
}

/// Message body of an outbound frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputMessage {
    pub role: String,
    pub content: Vec<ContentBlock>,
}

impl UserInput {
    /// Build a standard user text frame.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "user".to_string(),
            message: InputMessage {
                role: "user".to_string(),
                content: vec![ContentBlock::Text { text: text.into() }],
            },
        }
    }
}

/// Content block within an assistant or user message payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: serde_json::Value,
        #[serde(default)]
        is_error: bool,
    },
    Thinking {
        thinking: String,
    },
}

/// Assistant message payload carried inside a `message` envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

/// Serialize an outbound frame as a single newline-terminated JSON line.
pub fn encode_line(input: &UserInput) -> crate::Result<String> {
    let mut line = serde_json::to_string(input)?;
    line.push('\n');
    Ok(line)
}

/// Parse one stdout line as an [`Envelope`].
pub fn decode_line(line: &str) -> crate::Result<Envelope> {
    Ok(serde_json::from_str(line)?)
}

/// Extract the non-empty text blocks of an assistant `message` payload.
///
/// Returns an error when the payload does not parse as a message body (the
/// caller falls back to posting the raw payload). Non-assistant roles and
/// empty text blocks yield no output.
pub fn assistant_texts(payload: &serde_json::Value) -> crate::Result<Vec<String>> {
    let message: AssistantMessage = serde_json::from_value(payload.clone())?;
    if message.role.as_deref() != Some("assistant") {
        return Ok(Vec::new());
    }
    Ok(collect_texts(&message.content))
}

/// Extract the non-empty text blocks of a `text` payload, ignoring role.
pub fn content_texts(payload: &serde_json::Value) -> crate::Result<Vec<String>> {
    #[derive(Deserialize)]
    struct Body {
        #[serde(default)]
        content: Vec<ContentBlock>,
    }
    let body: Body = serde_json::from_value(payload.clone())?;
    Ok(collect_texts(&body.content))
}

fn collect_texts(blocks: &[ContentBlock]) -> Vec<String> {
    blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } if !text.is_empty() => Some(text.clone()),
            _ => None,
        })
        .collect()
}

/// Whether a stderr line indicates a process-level problem worth lifting
/// into an error envelope.
pub fn stderr_is_critical(line: &str) -> bool {
    let lower = line.to_lowercase();
    lower.contains("error") || lower.contains("failed") || lower.contains("timeout")
}

/// Map a raw agent stderr line onto a user-presentable message.
pub fn friendly_stderr_message(line: &str) -> &'static str {
    let lower = line.to_lowercase();

    if lower.contains("syntaxerror") && lower.contains("json") {
        return "Invalid input format. Please ensure your input is properly \
                formatted text or valid JSON.";
    }
    if lower.contains("parsing") && lower.contains("error") {
        return "Unable to process your input. Please check the format and try again.";
    }
    if lower.contains("timeout") {
        return "Request timed out. Please try again or simplify your request.";
    }
    if lower.contains("failed") {
        return "Command failed to execute. Please check your input and try again.";
    }

    "An error occurred while processing your request. Please try again."
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_init_envelope() {
        let line = r#"{"type":"system","subtype":"init","session_id":"S1"}"#;
        let envelope = decode_line(line).unwrap();
        assert!(envelope.is_init());
        assert_eq!(envelope.session_id.as_deref(), Some("S1"));
    }

    #[test]
    fn test_decode_malformed_line_fails() {
        assert!(decode_line("not json at all").is_err());
        assert!(decode_line("{\"type\":").is_err());
    }

    #[test]
    fn test_encode_line_is_single_line() {
        let input = UserInput::text("hello\nworld");
        let line = encode_line(&input).unwrap();
        assert!(line.ends_with('\n'));
        // The newline in the text must be escaped, not literal
        assert_eq!(line.matches('\n').count(), 1);
        assert!(line.contains(r#""type":"user""#));
        assert!(line.contains(r#""role":"user""#));
    }

    #[test]
    fn test_process_error_escapes_quotes() {
        let envelope = Envelope::process_error("S1", r#"error: unexpected "token" here"#);
        assert_eq!(envelope.kind, "error");
        assert_eq!(envelope.subtype.as_deref(), Some("process_error"));
        assert!(envelope.is_error);

        // The whole envelope must serialize to valid single-line JSON
        let serialized = serde_json::to_string(&envelope).unwrap();
        let reparsed: Envelope = serde_json::from_str(&serialized).unwrap();
        let details = reparsed.message.unwrap()["details"].as_str().unwrap().to_string();
        assert_eq!(details, r#"error: unexpected "token" here"#);
    }

    #[test]
    fn test_assistant_texts() {
        let payload = serde_json::json!({
            "id": "msg1",
            "role": "assistant",
            "content": [
                {"type": "text", "text": "hi"},
                {"type": "text", "text": ""},
                {"type": "tool_use", "id": "t1", "name": "Bash", "input": {}},
                {"type": "text", "text": "there"}
            ]
        });
        let texts = assistant_texts(&payload).unwrap();
        assert_eq!(texts, vec!["hi", "there"]);
    }

    #[test]
    fn test_assistant_texts_skips_non_assistant_role() {
        let payload = serde_json::json!({
            "role": "user",
            "content": [{"type": "text", "text": "hi"}]
        });
        assert!(assistant_texts(&payload).unwrap().is_empty());
    }

    #[test]
    fn test_assistant_texts_malformed_payload_errors() {
        let payload = serde_json::json!("just a string");
        assert!(assistant_texts(&payload).is_err());
    }

    #[test]
    fn test_content_texts_ignores_role() {
        let payload = serde_json::json!({
            "content": [{"type": "text", "text": "ok"}]
        });
        assert_eq!(content_texts(&payload).unwrap(), vec!["ok"]);
    }

    #[test]
    fn test_stderr_classification() {
        assert!(stderr_is_critical("Error: something broke"));
        assert!(stderr_is_critical("request FAILED"));
        assert!(stderr_is_critical("operation timeout"));
        assert!(!stderr_is_critical("note: everything is fine"));
    }

    #[test]
    fn test_friendly_stderr_messages() {
        assert!(friendly_stderr_message("SyntaxError: bad JSON input").contains("Invalid input"));
        assert!(friendly_stderr_message("parsing error near line 3").contains("check the format"));
        assert!(friendly_stderr_message("connect timeout").contains("timed out"));
        assert!(friendly_stderr_message("command failed").contains("failed to execute"));
        assert!(friendly_stderr_message("something else").contains("An error occurred"));
    }
}
