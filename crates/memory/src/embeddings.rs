use async_trait::async_trait;

/// Turns text into vectors for similarity search.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;

    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    fn model_name(&self) -> &str;

    /// Identifies the backend in the embedding cache, together with the model.
    fn provider_key(&self) -> &str {
        "default"
    }

    fn dimensions(&self) -> usize;
}
