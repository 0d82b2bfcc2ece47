//! Tenant document indexes and long-term memory.
//!
//! Every tenant owns two collections in one SQLite database: `<tenant>` for
//! ingested documents and `<tenant>_memory` for extracted memories. Search is
//! FTS5 keyword ranking, optionally blended with embedding similarity.

pub mod embeddings;
pub mod embeddings_openai;
pub mod extractor;
pub mod index;
pub mod manager;
pub mod schema;
pub mod search;
pub mod store_sqlite;

pub use {
    embeddings::EmbeddingProvider,
    embeddings_openai::OpenAiEmbeddingProvider,
    extractor::{ExtractionOverride, LlmMemoryExtractor, MemoryExtractor, MemoryOverride},
    index::{Document, DocumentIndex, IndexFactory, Memory},
    manager::{MemoryHandle, MemoryService},
    schema::run_migrations,
    store_sqlite::{SearchWeights, SqliteIndex, SqliteIndexFactory},
};
