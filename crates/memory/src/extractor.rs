//! Turning a finished exchange into long-term memories.

use std::sync::Arc;

use {async_trait::async_trait, serde_json::Value, tracing::debug};

use {
    brainproxy_common::TenantId,
    brainproxy_protocol::{ChatTurn, Role, message_content},
    brainproxy_providers::CompletionProvider,
};

use crate::index::Memory;

#[async_trait]
pub trait MemoryExtractor: Send + Sync {
    /// Memories worth keeping from `exchange` (which ends with the assistant turn).
    async fn extract(&self, exchange: &[ChatTurn]) -> anyhow::Result<Vec<Memory>>;
}

/// Result of a configured extraction override.
pub enum ExtractionOverride {
    /// Run this extractor instead of the tenant's default one.
    Replacement(Arc<dyn MemoryExtractor>),
    /// Persist exactly these memories. Empty means nothing is written.
    Memories(Vec<Memory>),
    /// Write nothing for this exchange.
    Skip,
}

/// Application hook consulted before the default extractor on every write-back.
#[async_trait]
pub trait MemoryOverride: Send + Sync {
    async fn extract(
        &self,
        tenant: &TenantId,
        exchange: &[ChatTurn],
    ) -> anyhow::Result<ExtractionOverride>;
}

const EXTRACTION_PROMPT: &str = "You maintain long-term memory for an assistant. \
Read the conversation and list durable facts worth remembering about the user, \
their work, or their preferences. Each fact must stand on its own in one short \
sentence. Ignore small talk and anything only relevant to this conversation. \
Reply with a JSON array of strings and nothing else; reply [] if there is nothing to keep.";

/// Asks a completion model to distill memories from the transcript.
pub struct LlmMemoryExtractor {
    provider: Arc<dyn CompletionProvider>,
    model: String,
}

impl LlmMemoryExtractor {
    pub fn new(provider: Arc<dyn CompletionProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

/// Plain-text transcript of the scalar turns, system turns excluded.
fn transcript(exchange: &[ChatTurn]) -> String {
    exchange
        .iter()
        .filter(|t| t.role != Role::System)
        .filter_map(|t| t.text().map(|text| format!("{}: {text}", role_label(t.role))))
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl MemoryExtractor for LlmMemoryExtractor {
    async fn extract(&self, exchange: &[ChatTurn]) -> anyhow::Result<Vec<Memory>> {
        let transcript = transcript(exchange);
        if transcript.trim().is_empty() {
            return Ok(Vec::new());
        }
        let prompt = [
            ChatTurn::system(EXTRACTION_PROMPT),
            ChatTurn::user(transcript),
        ];
        let completion = self.provider.complete(&prompt, &self.model).await?;
        let reply = message_content(&completion)
            .ok_or_else(|| anyhow::anyhow!("extraction reply has no message content"))?;
        let memories = parse_memories(reply);
        debug!(model = %self.model, count = memories.len(), "memories extracted");
        Ok(memories)
    }
}

/// Parse a model reply into memories.
///
/// Accepts a JSON array (optionally inside a code fence) of strings or
/// objects; anything else is read as one memory per non-empty line, with list
/// markers stripped.
pub fn parse_memories(reply: &str) -> Vec<Memory> {
    let body = strip_code_fence(reply.trim());

    if let Ok(items) = serde_json::from_str::<Vec<Value>>(body) {
        return items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(s) if s.trim().is_empty() => None,
                Value::String(s) => Some(Memory::Text(s.trim().to_string())),
                Value::Null => None,
                other => Some(Memory::Structured(other)),
            })
            .collect();
    }

    body.lines()
        .map(strip_list_marker)
        .filter(|line| !line.is_empty() && *line != "[]")
        .map(|line| Memory::Text(line.to_string()))
        .collect()
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the info string ("json") on the opening line.
    let rest = rest.split_once('\n').map_or("", |(_, body)| body);
    rest.trim_end().trim_end_matches("```").trim()
}

fn strip_list_marker(line: &str) -> &str {
    let line = line.trim();
    if let Some(rest) = line
        .strip_prefix("- ")
        .or_else(|| line.strip_prefix("* "))
    {
        return rest.trim();
    }
    let digits = line.chars().take_while(char::is_ascii_digit).count();
    if digits > 0
        && let Some(rest) = line[digits..]
            .strip_prefix(". ")
            .or_else(|| line[digits..].strip_prefix(") "))
    {
        return rest.trim();
    }
    line
}
