//! Hybrid search: combine vector similarity and keyword/FTS results.

use std::collections::HashMap;

use {
    serde::Serialize,
    serde_json::{Map, Value},
};

use crate::index::Document;

/// A scored hit from one collection.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub id: String,
    pub score: f32,
    pub content: String,
    pub metadata: Map<String, Value>,
}

impl From<SearchResult> for Document {
    fn from(r: SearchResult) -> Self {
        Self {
            content: r.content,
            metadata: r.metadata,
        }
    }
}

/// Reduce free text to an FTS5 query: every alphanumeric run becomes a quoted
/// term, terms are OR-ed. Returns `None` when nothing searchable remains.
pub fn fts_query(text: &str) -> Option<String> {
    let terms: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t.to_lowercase()))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

/// Merge vector and keyword results with weighted scores. Deduplicates by id.
pub fn merge_results(
    vector: &[SearchResult],
    keyword: &[SearchResult],
    vector_weight: f32,
    keyword_weight: f32,
) -> Vec<SearchResult> {
    let mut scores: HashMap<String, (f32, SearchResult)> = HashMap::new();

    for r in vector {
        let entry = scores.entry(r.id.clone()).or_insert((0.0, r.clone()));
        entry.0 += r.score * vector_weight;
    }

    for r in keyword {
        let entry = scores.entry(r.id.clone()).or_insert((0.0, r.clone()));
        entry.0 += r.score * keyword_weight;
    }

    let mut results: Vec<SearchResult> = scores
        .into_values()
        .map(|(score, mut r)| {
            r.score = score;
            r
        })
        .collect();

    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    results
}
