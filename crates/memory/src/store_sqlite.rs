//! SQLite implementation of the `DocumentIndex` and `IndexFactory` traits.

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use {
    async_trait::async_trait,
    serde_json::{Map, Value},
    sha2::{Digest, Sha256},
    sqlx::SqlitePool,
    tracing::{debug, warn},
};

use crate::{
    embeddings::EmbeddingProvider,
    index::{Document, DocumentIndex, IndexFactory},
    search::{SearchResult, fts_query, merge_results},
};

/// Score weights used when an embedding provider is configured.
#[derive(Debug, Clone, Copy)]
pub struct SearchWeights {
    pub vector: f32,
    pub keyword: f32,
}

impl Default for SearchWeights {
    fn default() -> Self {
        Self {
            vector: 0.7,
            keyword: 0.3,
        }
    }
}

/// Cached embeddings kept before the least recently used are evicted.
pub const EMBEDDING_CACHE_MAX_ROWS: usize = 50_000;

/// Hands out collection handles over one shared pool.
#[derive(Clone)]
pub struct SqliteIndexFactory {
    pool: SqlitePool,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    weights: SearchWeights,
    cache_rows: usize,
}

impl SqliteIndexFactory {
    /// Keyword (FTS) search only.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            embedder: None,
            weights: SearchWeights::default(),
            cache_rows: EMBEDDING_CACHE_MAX_ROWS,
        }
    }

    /// Hybrid (vector + keyword) search.
    #[must_use]
    pub fn with_embeddings(
        mut self,
        embedder: Arc<dyn EmbeddingProvider>,
        weights: SearchWeights,
    ) -> Self {
        self.embedder = Some(embedder);
        self.weights = weights;
        self
    }

    #[must_use]
    pub fn with_embedding_cache_limit(mut self, rows: usize) -> Self {
        self.cache_rows = rows;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn index(&self, collection: &str) -> SqliteIndex {
        SqliteIndex {
            pool: self.pool.clone(),
            collection: collection.to_string(),
            embedder: self.embedder.clone(),
            weights: self.weights,
            cache_rows: self.cache_rows,
        }
    }
}

#[async_trait]
impl IndexFactory for SqliteIndexFactory {
    async fn open(&self, collection: &str) -> anyhow::Result<Arc<dyn DocumentIndex>> {
        debug!(collection, "opening sqlite collection");
        Ok(Arc::new(self.index(collection)))
    }
}

pub struct SqliteIndex {
    pool: SqlitePool,
    collection: String,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    weights: SearchWeights,
    cache_rows: usize,
}

/// Content-addressed id: identical text in one collection is stored once.
pub fn document_id(collection: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(collection.as_bytes());
    hasher.update([0u8]);
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn content_hash(content: &str) -> String {
    format!("{:x}", Sha256::digest(content.as_bytes()))
}

/// Deserialize a BLOB of little-endian f32s.
fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Serialize a slice of f32s to a BLOB of little-endian bytes.
fn vec_to_blob(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}

fn parse_metadata(raw: &str) -> Map<String, Value> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl SqliteIndex {
    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub async fn count(&self) -> anyhow::Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT count(*) FROM documents WHERE collection = ?")
            .bind(&self.collection)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    /// Embeddings for a batch, or `None` when no provider is set or it fails.
    ///
    /// Vectors already in the embedding cache are reused; only the misses go
    /// to the provider, and their results are cached.
    async fn embed_documents(&self, documents: &[Document]) -> Option<Vec<Vec<f32>>> {
        let embedder = self.embedder.as_ref()?;
        let (provider, model) = (embedder.provider_key(), embedder.model_name());
        let hashes: Vec<String> = documents.iter().map(|d| content_hash(&d.content)).collect();

        let mut vectors: Vec<Option<Vec<f32>>> = Vec::with_capacity(hashes.len());
        for hash in &hashes {
            let hit = self
                .cached_embedding(provider, model, hash)
                .await
                .unwrap_or_else(|e| {
                    warn!(error = %e, "embedding cache lookup failed");
                    None
                });
            vectors.push(hit);
        }
        let misses: Vec<usize> = vectors
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_none())
            .map(|(i, _)| i)
            .collect();
        debug!(
            collection = %self.collection,
            hits = hashes.len() - misses.len(),
            misses = misses.len(),
            "embedding cache"
        );
        if misses.is_empty() {
            return vectors.into_iter().collect();
        }

        let texts: Vec<String> = misses.iter().map(|&i| documents[i].content.clone()).collect();
        let fresh = match embedder.embed_batch(&texts).await {
            Ok(fresh) if fresh.len() == texts.len() => fresh,
            Ok(fresh) => {
                warn!(
                    collection = %self.collection,
                    expected = texts.len(),
                    got = fresh.len(),
                    "embedding count mismatch, storing without vectors"
                );
                return None;
            },
            Err(e) => {
                warn!(collection = %self.collection, error = %e, "embedding failed, storing without vectors");
                return None;
            },
        };

        for (&i, vector) in misses.iter().zip(fresh) {
            if let Err(e) = self.cache_embedding(provider, model, &hashes[i], &vector).await {
                warn!(error = %e, "failed to cache embedding");
            }
            vectors[i] = Some(vector);
        }
        if count_cached_embeddings(&self.pool).await.unwrap_or(0) > self.cache_rows {
            match evict_embedding_cache(&self.pool, self.cache_rows).await {
                Ok(evicted) => debug!(evicted, "embedding cache: evicted old entries"),
                Err(e) => warn!(error = %e, "embedding cache eviction failed"),
            }
        }
        vectors.into_iter().collect()
    }

    /// Look up a cached vector, marking it recently used.
    async fn cached_embedding(
        &self,
        provider: &str,
        model: &str,
        hash: &str,
    ) -> anyhow::Result<Option<Vec<f32>>> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as(
            "UPDATE embedding_cache SET updated_at = ?
             WHERE provider = ? AND model = ? AND hash = ?
             RETURNING embedding",
        )
        .bind(unix_now())
        .bind(provider)
        .bind(model)
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(blob,)| blob_to_vec(&blob)))
    }

    async fn cache_embedding(
        &self,
        provider: &str,
        model: &str,
        hash: &str,
        embedding: &[f32],
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO embedding_cache (provider, model, hash, embedding, dims, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(provider, model, hash) DO UPDATE SET
               embedding = excluded.embedding, dims = excluded.dims, updated_at = excluded.updated_at",
        )
        .bind(provider)
        .bind(model)
        .bind(hash)
        .bind(vec_to_blob(embedding))
        .bind(embedding.len() as i64)
        .bind(unix_now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn keyword_search(
        &self,
        query: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<SearchResult>> {
        let Some(fts) = fts_query(query) else {
            return Ok(Vec::new());
        };
        let rows: Vec<(String, String, String, f64)> = sqlx::query_as(
            "SELECT d.id, d.content, d.metadata, bm25(documents_fts) AS score
             FROM documents_fts
             JOIN documents d ON d.rowid = documents_fts.rowid
             WHERE documents_fts MATCH ? AND d.collection = ?
             ORDER BY score
             LIMIT ?",
        )
        .bind(fts)
        .bind(&self.collection)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        // bm25 is negative (lower = better). Normalize to 0..1.
        let min_rank = rows.iter().map(|r| r.3).fold(f64::INFINITY, f64::min);
        let max_rank = rows.iter().map(|r| r.3).fold(f64::NEG_INFINITY, f64::max);
        let range = max_rank - min_rank;

        Ok(rows
            .into_iter()
            .map(|(id, content, metadata, rank)| {
                let score = if range.abs() < 1e-9 {
                    1.0
                } else {
                    (1.0 - ((rank - min_rank) / range)) as f32
                };
                SearchResult {
                    id,
                    score,
                    content,
                    metadata: parse_metadata(&metadata),
                }
            })
            .collect())
    }

    pub async fn vector_search(
        &self,
        query_embedding: &[f32],
        limit: usize,
    ) -> anyhow::Result<Vec<SearchResult>> {
        // Cosine similarity is computed in-process over the collection.
        let rows: Vec<(String, String, String, Vec<u8>)> = sqlx::query_as(
            "SELECT id, content, metadata, embedding FROM documents
             WHERE collection = ? AND embedding IS NOT NULL",
        )
        .bind(&self.collection)
        .fetch_all(&self.pool)
        .await?;

        let mut scored: Vec<SearchResult> = rows
            .into_iter()
            .map(|(id, content, metadata, emb)| SearchResult {
                score: cosine_similarity(query_embedding, &blob_to_vec(&emb)),
                id,
                content,
                metadata: parse_metadata(&metadata),
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(limit);
        Ok(scored)
    }

    /// Hybrid search when an embedder is configured, keyword-only otherwise.
    pub async fn search_scored(
        &self,
        query: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<SearchResult>> {
        if query.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let Some(embedder) = &self.embedder else {
            return self.keyword_search(query, limit).await;
        };

        let query_embedding = match embedder.embed(query).await {
            Ok(v) => v,
            Err(e) => {
                warn!(collection = %self.collection, error = %e, "query embedding failed, keyword search only");
                return self.keyword_search(query, limit).await;
            },
        };

        let fetch_limit = limit * 3; // over-fetch for merging
        let vector_results = self.vector_search(&query_embedding, fetch_limit).await?;
        let keyword_results = self.keyword_search(query, fetch_limit).await?;

        let mut merged = merge_results(
            &vector_results,
            &keyword_results,
            self.weights.vector,
            self.weights.keyword,
        );
        merged.truncate(limit);
        Ok(merged)
    }
}

/// Number of cached embeddings across all collections.
pub async fn count_cached_embeddings(pool: &SqlitePool) -> anyhow::Result<usize> {
    let (count,): (i64,) = sqlx::query_as("SELECT count(*) FROM embedding_cache")
        .fetch_one(pool)
        .await?;
    Ok(count as usize)
}

/// Drop the least recently used embeddings beyond `keep`. Returns how many
/// were removed.
pub async fn evict_embedding_cache(pool: &SqlitePool, keep: usize) -> anyhow::Result<u64> {
    let result = sqlx::query(
        "DELETE FROM embedding_cache WHERE rowid IN (
            SELECT rowid FROM embedding_cache
            ORDER BY updated_at ASC, rowid ASC
            LIMIT MAX(0, (SELECT count(*) FROM embedding_cache) - ?)
        )",
    )
    .bind(keep as i64)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

#[async_trait]
impl DocumentIndex for SqliteIndex {
    async fn add(&self, documents: Vec<Document>) -> anyhow::Result<()> {
        if documents.is_empty() {
            return Ok(());
        }
        let embeddings = self.embed_documents(&documents).await;
        let model = embeddings
            .as_ref()
            .and(self.embedder.as_ref())
            .map(|e| e.model_name().to_string());
        let now = unix_now();

        let mut tx = self.pool.begin().await?;
        for (i, doc) in documents.iter().enumerate() {
            let blob = embeddings.as_ref().map(|e| vec_to_blob(&e[i]));
            sqlx::query(
                "INSERT INTO documents (id, collection, content, metadata, embedding, model, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO NOTHING",
            )
            .bind(document_id(&self.collection, &doc.content))
            .bind(&self.collection)
            .bind(&doc.content)
            .bind(serde_json::to_string(&doc.metadata)?)
            .bind(blob)
            .bind(&model)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        debug!(collection = %self.collection, count = documents.len(), "documents added");
        Ok(())
    }

    async fn search(&self, query: &str, k: usize) -> anyhow::Result<Vec<Document>> {
        Ok(self
            .search_scored(query, k)
            .await?
            .into_iter()
            .map(Document::from)
            .collect())
    }
}
