//! Chat-completion wire protocol.
//!
//! Request bodies follow the OpenAI chat-completions shape, extended with a
//! `file_data` content part carrying base64 attachments. Responses are passed
//! through as raw JSON; only the few fields the proxy reads are typed here.
//!
//! Streaming responses use server-sent events: one `data: <json>\n\n` event per
//! chunk, terminated by `data: [DONE]\n\n`.

use {
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

// ── Constants ────────────────────────────────────────────────────────────────

/// Payload of the terminal SSE event.
pub const DONE: &str = "[DONE]";

pub mod error_types {
    pub const INVALID_REQUEST: &str = "invalid_request_error";
    pub const AUTHENTICATION: &str = "authentication_error";
    pub const UPSTREAM: &str = "upstream_error";
    pub const INTERNAL: &str = "internal_error";
}

// ── Request ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub messages: Vec<ChatTurn>,
    #[serde(default)]
    pub stream: bool,
}

impl ChatCompletionRequest {
    /// The requested model, or `default` when absent or empty.
    pub fn resolved_model<'a>(&'a self, default: &'a str) -> &'a str {
        self.model
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(default)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: MessageContent,
}

impl ChatTurn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    /// Scalar text content; `None` for multi-part turns.
    pub fn text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(t) => Some(t),
            MessageContent::Parts(_) => None,
        }
    }
}

/// Either a plain string or a list of typed parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        #[serde(default)]
        text: String,
    },
    ImageUrl {
        #[serde(default)]
        image_url: Value,
    },
    FileData {
        file_data: FileBlob,
    },
    /// Any part type the proxy does not understand.
    #[serde(other)]
    Other,
}

/// A base64-encoded attachment sent inline with a message.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct FileBlob {
    pub name: String,
    #[serde(default = "default_mime")]
    pub mime: String,
    /// Base64 (standard alphabet) file contents.
    pub data: String,
}

fn default_mime() -> String {
    "application/octet-stream".into()
}

impl std::fmt::Debug for FileBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBlob")
            .field("name", &self.name)
            .field("mime", &self.mime)
            .field("data_len", &self.data.len())
            .finish()
    }
}

// ── Responses ────────────────────────────────────────────────────────────────

/// `choices[0].message.content` of a buffered completion.
pub fn message_content(completion: &Value) -> Option<&str> {
    completion
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
}

/// `choices[0].delta.content` of a streamed chunk, empty when absent or null.
pub fn delta_content(chunk: &Value) -> &str {
    chunk
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
        .unwrap_or("")
}

/// `usage.total_tokens`, when the provider reported it.
pub fn total_tokens(completion: &Value) -> Option<u64> {
    completion
        .pointer("/usage/total_tokens")
        .and_then(Value::as_u64)
}

// ── Errors ───────────────────────────────────────────────────────────────────

/// OpenAI-style error envelope: `{"error": {"message", "type"}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorShape,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorShape {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl ErrorBody {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorShape {
                message: message.into(),
                kind: kind.into(),
            },
        }
    }
}

// ── SSE ──────────────────────────────────────────────────────────────────────

/// One parsed `data:` line of an event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SseLine {
    Data(Value),
    Done,
}

/// Parse one line of an event stream.
///
/// Returns `None` for blank lines, comments, non-`data` fields and payloads
/// that are not JSON.
pub fn parse_sse_line(line: &str) -> Option<SseLine> {
    let data = line.trim_end_matches('\r').strip_prefix("data:")?.trim_start();
    if data == DONE {
        return Some(SseLine::Done);
    }
    serde_json::from_str(data).ok().map(SseLine::Data)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, serde_json::json};

    #[test]
    fn scalar_and_multipart_content_deserialize() {
        let req: ChatCompletionRequest = serde_json::from_value(json!({
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": [
                    {"type": "text", "text": "see attached"},
                    {"type": "image_url", "image_url": {"url": "https://x/y.png"}},
                    {"type": "file_data", "file_data": {"name": "a.txt", "mime": "text/plain", "data": "aGk="}},
                    {"type": "input_audio", "input_audio": {}}
                ]}
            ]
        }))
        .unwrap();

        assert!(!req.stream);
        assert_eq!(req.messages[0].text(), Some("be brief"));
        let MessageContent::Parts(parts) = &req.messages[1].content else {
            panic!("expected parts");
        };
        assert_eq!(parts.len(), 4);
        assert!(matches!(&parts[0], ContentPart::Text { text } if text == "see attached"));
        assert!(matches!(&parts[1], ContentPart::ImageUrl { .. }));
        assert!(matches!(&parts[2], ContentPart::FileData { file_data } if file_data.name == "a.txt"));
        assert_eq!(parts[3], ContentPart::Other);
    }

    #[test]
    fn file_blob_mime_defaults() {
        let blob: FileBlob = serde_json::from_value(json!({"name": "x", "data": ""})).unwrap();
        assert_eq!(blob.mime, "application/octet-stream");
        assert!(!format!("{blob:?}").contains("data:"));
    }

    #[test]
    fn unknown_role_is_rejected() {
        let res = serde_json::from_value::<ChatTurn>(json!({"role": "wizard", "content": "hi"}));
        assert!(res.is_err());
    }

    #[test]
    fn resolved_model_falls_back_on_missing_or_blank() {
        let mut req = ChatCompletionRequest {
            model: None,
            messages: vec![],
            stream: false,
        };
        assert_eq!(req.resolved_model("gpt-4o"), "gpt-4o");
        req.model = Some("  ".into());
        assert_eq!(req.resolved_model("gpt-4o"), "gpt-4o");
        req.model = Some("gpt-4o-mini".into());
        assert_eq!(req.resolved_model("gpt-4o"), "gpt-4o-mini");
    }

    #[test]
    fn response_accessors() {
        let completion = json!({
            "choices": [{"message": {"role": "assistant", "content": "Hi"}}],
            "usage": {"total_tokens": 12}
        });
        assert_eq!(message_content(&completion), Some("Hi"));
        assert_eq!(total_tokens(&completion), Some(12));

        assert_eq!(delta_content(&json!({"choices": [{"delta": {"content": "He"}}]})), "He");
        assert_eq!(delta_content(&json!({"choices": [{"delta": {"content": null}}]})), "");
        assert_eq!(delta_content(&json!({"choices": []})), "");
    }

    #[test]
    fn sse_lines() {
        assert_eq!(parse_sse_line("data: [DONE]"), Some(SseLine::Done));
        assert_eq!(
            parse_sse_line("data: {\"a\":1}\r"),
            Some(SseLine::Data(json!({"a": 1})))
        );
        assert_eq!(parse_sse_line("data:{\"a\":2}"), Some(SseLine::Data(json!({"a": 2}))));
        assert_eq!(parse_sse_line(": keep-alive"), None);
        assert_eq!(parse_sse_line("event: ping"), None);
        assert_eq!(parse_sse_line("data: not json"), None);
        assert_eq!(parse_sse_line(""), None);
    }

    #[test]
    fn error_body_shape() {
        let body = serde_json::to_value(ErrorBody::new(error_types::UPSTREAM, "boom")).unwrap();
        assert_eq!(body, json!({"error": {"message": "boom", "type": "upstream_error"}}));
    }
}
