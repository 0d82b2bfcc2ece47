//! Configuration loading, validation, and env substitution.
//!
//! Config files: `brainproxy.toml`, `brainproxy.yaml`, or `brainproxy.json`
//! Searched in `./` then `~/.config/brainproxy/`.
//!
//! Supports `${ENV_VAR}` and `${ENV_VAR:-fallback}` substitution in the raw text.

pub mod env_subst;
pub mod error;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    error::{Error, Result},
    loader::{config_dir, discover_and_load, load_config, load_or_discover, to_toml},
    schema::{
        AuthConfig, BrainProxyConfig, EmbeddingsConfig, IngestConfig, MemoryConfig,
        RetrievalConfig, ServerConfig, StorageConfig, UpstreamConfig,
    },
    validate::{Diagnostic, Severity, ValidationResult},
};
