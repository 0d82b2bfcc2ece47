//! Documents, memories, and the index traits the proxy stores them through.

use std::sync::Arc;

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    serde_json::{Map, Value},
};

/// Unit of retrievable text stored in, and returned by, a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Document {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: Map::new(),
        }
    }

    #[must_use]
    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// A piece of extracted long-term knowledge.
#[derive(Debug, Clone, PartialEq)]
pub enum Memory {
    Text(String),
    Structured(Value),
}

impl Memory {
    /// Searchable text form.
    pub fn content(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Structured(Value::String(s)) => s.clone(),
            Self::Structured(value) => ["content", "text", "fact"]
                .iter()
                .find_map(|k| value.get(k).and_then(Value::as_str))
                .map(str::to_string)
                .unwrap_or_else(|| value.to_string()),
        }
    }

    pub fn into_document(self) -> Document {
        let doc = Document::new(self.content()).with_meta("kind", "memory");
        match self {
            Self::Text(_) => doc,
            Self::Structured(value) => doc.with_meta("structured", value),
        }
    }
}

/// One named collection of documents.
#[async_trait]
pub trait DocumentIndex: Send + Sync {
    /// Add documents in one batch. Re-adding identical content is allowed.
    async fn add(&self, documents: Vec<Document>) -> anyhow::Result<()>;

    /// Up to `k` documents most relevant to `query`, best first.
    async fn search(&self, query: &str, k: usize) -> anyhow::Result<Vec<Document>>;
}

/// Opens collection handles. Collections spring into existence on first use.
#[async_trait]
pub trait IndexFactory: Send + Sync {
    async fn open(&self, collection: &str) -> anyhow::Result<Arc<dyn DocumentIndex>>;
}
