//! Upstream completion providers.
//!
//! A [`CompletionProvider`] forwards an already-augmented conversation to an
//! LLM backend, either waiting for the whole completion or handing back a
//! stream of raw chunk objects.

pub mod openai_compat;

use std::pin::Pin;

use {async_trait::async_trait, futures::Stream, serde_json::Value};

use brainproxy_protocol::ChatTurn;

pub use openai_compat::OpenAiCompatProvider;

/// Raw provider chunks, in arrival order. An `Err` item ends the stream.
pub type ChunkStream = Pin<Box<dyn Stream<Item = anyhow::Result<Value>> + Send>>;

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Wait for the full completion and return the provider's response body.
    async fn complete(&self, messages: &[ChatTurn], model: &str) -> anyhow::Result<Value>;

    /// Start an incremental completion.
    ///
    /// Errors establishing the stream are returned directly; failures after
    /// the first chunk arrive as an `Err` item.
    async fn stream(&self, messages: &[ChatTurn], model: &str) -> anyhow::Result<ChunkStream>;
}

/// Process-wide HTTP client for callers that need no custom timeouts.
pub fn shared_http_client() -> &'static reqwest::Client {
    static CLIENT: std::sync::LazyLock<reqwest::Client> =
        std::sync::LazyLock::new(reqwest::Client::new);
    &CLIENT
}
