//! Wiring collaborators from configuration.

use std::{sync::Arc, time::Duration};

use tracing::info;

use {
    brainproxy_common::hooks::HookRegistry,
    brainproxy_config::BrainProxyConfig,
    brainproxy_memory::{
        LlmMemoryExtractor, MemoryService, OpenAiEmbeddingProvider, SearchWeights,
        SqliteIndexFactory, schema,
    },
    brainproxy_providers::{CompletionProvider, openai_compat::OpenAiCompatProvider},
};

use crate::{
    hooks::{ApiKeyAuth, UsageLogger},
    ingest::{DocumentIngestor, PlainTextExtractor},
    proxy::{BrainProxy, ProxySettings},
};

/// Shared state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub proxy: Arc<BrainProxy>,
    pub version: &'static str,
}

impl AppState {
    pub fn new(proxy: Arc<BrainProxy>) -> Self {
        Self {
            proxy,
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

/// The hook registry configured by `auth` plus the built-in usage logger.
pub fn build_hooks(config: &BrainProxyConfig) -> HookRegistry {
    let mut hooks = HookRegistry::new();
    if !config.auth.api_keys.is_empty() {
        hooks.register(Arc::new(ApiKeyAuth::new(config.auth.api_keys.clone())));
    }
    hooks.register(Arc::new(UsageLogger));
    hooks
}

/// Open the index database and assemble the proxy described by `config`.
pub async fn build_proxy(config: &BrainProxyConfig) -> anyhow::Result<BrainProxy> {
    build_proxy_with_hooks(config, build_hooks(config)).await
}

/// Like [`build_proxy`], dispatching to a caller-supplied registry.
pub async fn build_proxy_with_hooks(
    config: &BrainProxyConfig,
    hooks: HookRegistry,
) -> anyhow::Result<BrainProxy> {
    let db_path = config.storage.index_db_path();
    let pool = schema::open_pool(&db_path).await?;
    info!(path = %db_path.display(), "index database ready");

    let mut factory = SqliteIndexFactory::new(pool);
    if config.embeddings.enabled {
        let embeddings = &config.embeddings;
        let provider = OpenAiEmbeddingProvider::new(
            embeddings
                .api_key
                .clone()
                .or_else(|| config.upstream.api_key.clone()),
            embeddings
                .base_url
                .clone()
                .unwrap_or_else(|| config.upstream.base_url.clone()),
        )
        .with_model(embeddings.model.clone(), embeddings.dimensions);
        factory = factory.with_embeddings(Arc::new(provider), SearchWeights {
            vector: embeddings.vector_weight,
            keyword: embeddings.keyword_weight,
        });
        info!(model = %embeddings.model, "hybrid search enabled");
    }
    let factory = Arc::new(factory);

    let provider: Arc<dyn CompletionProvider> = Arc::new(
        OpenAiCompatProvider::new(
            config.upstream.api_key.clone(),
            config.upstream.base_url.clone(),
        )
        .with_timeout(Duration::from_secs(config.upstream.timeout_secs)),
    );

    let hooks = Arc::new(hooks);

    let extractor = Arc::new(LlmMemoryExtractor::new(
        Arc::clone(&provider),
        config.memory.extraction_model.clone(),
    ));
    let memory = Arc::new(
        MemoryService::new(factory.clone(), extractor)
            .enabled(config.memory.enabled)
            .with_hooks(Arc::clone(&hooks)),
    );

    let ingestor = DocumentIngestor::new(
        config.storage.root(),
        Arc::new(PlainTextExtractor),
        factory.clone(),
    )
    .with_hooks(Arc::clone(&hooks));

    Ok(BrainProxy::new(
        ProxySettings::from_config(config),
        provider,
        factory,
        ingestor,
        memory,
        hooks,
    ))
}
