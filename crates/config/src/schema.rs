//! Config schema types.
use std::path::{Path, PathBuf};

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrainProxyConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub storage: StorageConfig,
    pub ingest: IngestConfig,
    pub retrieval: RetrievalConfig,
    pub memory: MemoryConfig,
    pub embeddings: EmbeddingsConfig,
    pub auth: AuthConfig,
}

impl BrainProxyConfig {
    /// Copy of the config with every secret replaced by a placeholder.
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut cfg = self.clone();
        let mask = |s: &Option<Secret<String>>| s.as_ref().map(|_| Secret::new(REDACTED.into()));
        cfg.upstream.api_key = mask(&self.upstream.api_key);
        cfg.embeddings.api_key = mask(&self.embeddings.api_key);
        cfg.auth.api_keys = self
            .auth
            .api_keys
            .iter()
            .map(|_| Secret::new(REDACTED.into()))
            .collect();
        cfg
    }
}

pub const REDACTED: &str = "[REDACTED]";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Maximum accepted request body, in megabytes.
    pub body_limit_mb: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 8080,
            body_limit_mb: 64,
        }
    }
}

/// The OpenAI-compatible endpoint requests are forwarded to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    #[serde(
        default,
        serialize_with = "serialize_option_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub api_key: Option<Secret<String>>,
    /// Model used when a request does not name one.
    pub default_model: String,
    pub timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            api_key: None,
            default_model: "gpt-4o".into(),
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root for stored attachments; each tenant gets a subdirectory.
    pub dir: String,
    /// SQLite database holding every tenant's documents and memories.
    /// Relative paths resolve against `dir`.
    pub index_db: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: "tenants".into(),
            index_db: "index.db".into(),
        }
    }
}

impl StorageConfig {
    pub fn root(&self) -> PathBuf {
        PathBuf::from(&self.dir)
    }

    pub fn index_db_path(&self) -> PathBuf {
        let db = Path::new(&self.index_db);
        if db.is_absolute() {
            db.to_path_buf()
        } else {
            self.root().join(db)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Attachments whose decoded size exceeds this are skipped.
    pub max_upload_mb: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self { max_upload_mb: 20 }
    }
}

impl IngestConfig {
    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self { top_k: 4 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub enabled: bool,
    pub top_k: usize,
    /// Model the default extractor asks to distill memories from a transcript.
    pub extraction_model: String,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            top_k: 6,
            extraction_model: "gpt-4o-mini".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingsConfig {
    pub enabled: bool,
    /// Falls back to `upstream.base_url` when unset.
    pub base_url: Option<String>,
    #[serde(
        default,
        serialize_with = "serialize_option_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub api_key: Option<Secret<String>>,
    pub model: String,
    pub dimensions: usize,
    pub vector_weight: f32,
    pub keyword_weight: f32,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: None,
            api_key: None,
            model: "text-embedding-3-small".into(),
            dimensions: 1536,
            vector_weight: 0.7,
            keyword_weight: 0.3,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Accepted bearer keys. Empty leaves the proxy open.
    #[serde(serialize_with = "serialize_secret_vec")]
    pub api_keys: Vec<Secret<String>>,
}

// ── Serde helpers for Secret<String> ────────────────────────────────────────

fn serialize_option_secret<S: serde::Serializer>(
    secret: &Option<Secret<String>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match secret {
        Some(s) => serializer.serialize_some(s.expose_secret()),
        None => serializer.serialize_none(),
    }
}

fn serialize_secret_vec<S: serde::Serializer>(
    secrets: &[Secret<String>],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(secrets.iter().map(|s| s.expose_secret()))
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = BrainProxyConfig::default();
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.upstream.default_model, "gpt-4o");
        assert_eq!(cfg.ingest.max_upload_bytes(), 20 * 1024 * 1024);
        assert_eq!(cfg.retrieval.top_k, 4);
        assert_eq!(cfg.memory.top_k, 6);
        assert!(cfg.memory.enabled);
        assert!(!cfg.embeddings.enabled);
        assert!(cfg.auth.api_keys.is_empty());
        assert_eq!(
            cfg.storage.index_db_path(),
            PathBuf::from("tenants").join("index.db")
        );
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: BrainProxyConfig = toml::from_str(
            r#"
[server]
port = 9000

[auth]
api_keys = ["k1"]
"#,
        )
        .unwrap();
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.server.bind, "127.0.0.1");
        assert_eq!(cfg.auth.api_keys[0].expose_secret(), "k1");
    }

    #[test]
    fn redacted_hides_every_secret() {
        let mut cfg = BrainProxyConfig::default();
        cfg.upstream.api_key = Some(Secret::new("sk-live".into()));
        cfg.auth.api_keys = vec![Secret::new("k1".into())];

        let out = toml::to_string_pretty(&cfg.redacted()).unwrap();
        assert!(!out.contains("sk-live"));
        assert!(!out.contains("\"k1\""));
        assert!(out.contains(REDACTED));
        // Original untouched.
        assert_eq!(
            cfg.upstream.api_key.as_ref().unwrap().expose_secret(),
            "sk-live"
        );
    }
}
