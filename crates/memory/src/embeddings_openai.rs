//! OpenAI-compatible embeddings provider using the `/embeddings` endpoint.

use async_trait::async_trait;
use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
    tracing::debug,
};

use crate::embeddings::EmbeddingProvider;

pub struct OpenAiEmbeddingProvider {
    client: reqwest::Client,
    api_key: Option<Secret<String>>,
    base_url: String,
    model: String,
    dims: usize,
}

impl OpenAiEmbeddingProvider {
    /// `base_url` includes the API version segment, e.g. `https://api.openai.com/v1`.
    pub fn new(api_key: Option<Secret<String>>, base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: "text-embedding-3-small".to_string(),
            dims: 1536,
        }
    }

    #[must_use]
    pub fn with_model(mut self, model: String, dims: usize) -> Self {
        self.model = model;
        self.dims = dims;
        self
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddingProvider {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| anyhow::anyhow!("empty embedding response"))
    }

    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!(model = %self.model, count = texts.len(), "embedding batch");

        let mut req = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .json(&EmbeddingRequest {
                model: &self.model,
                input: texts,
            });
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key.expose_secret());
        }

        let mut resp = req
            .send()
            .await?
            .error_for_status()?
            .json::<EmbeddingResponse>()
            .await?;

        if resp.data.len() != texts.len() {
            anyhow::bail!(
                "embedding response has {} vectors for {} inputs",
                resp.data.len(),
                texts.len()
            );
        }
        resp.data.sort_by_key(|d| d.index);
        Ok(resp.data.into_iter().map(|d| d.embedding).collect())
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn provider_key(&self) -> &str {
        &self.base_url
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}
