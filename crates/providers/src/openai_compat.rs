//! Provider for any OpenAI-compatible `/chat/completions` endpoint.

use std::time::Duration;

use {
    async_trait::async_trait,
    futures::StreamExt,
    secrecy::{ExposeSecret, Secret},
    serde_json::Value,
    tracing::{debug, trace, warn},
};

use brainproxy_protocol::{ChatTurn, SseLine, parse_sse_line};

use crate::{ChunkStream, CompletionProvider};

pub struct OpenAiCompatProvider {
    api_key: Option<Secret<String>>,
    base_url: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(api_key: Option<Secret<String>>, base_url: impl Into<String>) -> Self {
        Self {
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(120),
            client: crate::shared_http_client().clone(),
        }
    }

    /// Bound for buffered requests. Streams are not cut off by this.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn request(&self, body: &Value) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .post(self.endpoint())
            .header("content-type", "application/json")
            .json(body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key.expose_secret());
        }
        req
    }
}

fn request_body(messages: &[ChatTurn], model: &str, stream: bool) -> Value {
    serde_json::json!({
        "model": model,
        "messages": messages,
        "stream": stream,
    })
}

async fn error_for_status(resp: reqwest::Response, model: &str) -> anyhow::Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body_text = resp.text().await.unwrap_or_default();
    warn!(status = %status, model, body = %body_text, "upstream API error");
    anyhow::bail!("upstream API error HTTP {status}: {body_text}")
}

#[async_trait]
impl CompletionProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        "openai-compat"
    }

    async fn complete(&self, messages: &[ChatTurn], model: &str) -> anyhow::Result<Value> {
        let body = request_body(messages, model, false);
        debug!(model, messages_count = messages.len(), "upstream complete request");
        trace!(body = %body, "upstream request body");

        let resp = self.request(&body).timeout(self.timeout).send().await?;
        let resp = error_for_status(resp, model).await?;
        let value = resp.json::<Value>().await?;
        trace!(response = %value, "upstream raw response");
        Ok(value)
    }

    async fn stream(&self, messages: &[ChatTurn], model: &str) -> anyhow::Result<ChunkStream> {
        let body = request_body(messages, model, true);
        debug!(model, messages_count = messages.len(), "upstream stream request");

        let resp = self.request(&body).send().await?;
        let resp = error_for_status(resp, model).await?;

        Ok(Box::pin(async_stream::stream! {
            let mut byte_stream = resp.bytes_stream();
            let mut lines = LineBuffer::default();

            while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(anyhow::Error::new(e).context("upstream stream interrupted"));
                        return;
                    }
                };
                for line in lines.push(&chunk) {
                    match parse_sse_line(line.trim_end()) {
                        Some(SseLine::Done) => return,
                        Some(SseLine::Data(value)) => yield Ok(value),
                        None => {}
                    }
                }
            }

            // Stream closed without a trailing newline.
            if let Some(SseLine::Data(value)) = lines.finish().as_deref().and_then(|l| parse_sse_line(l.trim())) {
                yield Ok(value);
            }
        }))
    }
}

/// Splits a byte stream into lines. Bytes are held until their line is
/// complete, so a multi-byte character split across reads decodes intact.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// The unterminated tail, if any.
    fn finish(self) -> Option<String> {
        (!self.pending.is_empty()).then(|| String::from_utf8_lossy(&self.pending).into_owned())
    }
}
