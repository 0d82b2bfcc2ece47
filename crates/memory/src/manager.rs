//! Per-tenant memory: lazily built handles, retrieval, and write-back.

use std::sync::Arc;

use {
    dashmap::DashMap,
    tokio::sync::OnceCell,
    tracing::{debug, info, warn},
};

use {
    brainproxy_common::{
        TenantId,
        hooks::{HookPayload, HookRegistry},
    },
    brainproxy_protocol::ChatTurn,
};

use crate::{
    extractor::{ExtractionOverride, MemoryExtractor, MemoryOverride},
    index::{DocumentIndex, IndexFactory, Memory},
};

/// A tenant's memory triple: the extractor plus the collection it searches
/// and stores through.
pub struct MemoryHandle {
    extractor: Arc<dyn MemoryExtractor>,
    index: Arc<dyn DocumentIndex>,
}

impl MemoryHandle {
    pub fn extractor(&self) -> &Arc<dyn MemoryExtractor> {
        &self.extractor
    }

    pub async fn search(&self, query: &str, k: usize) -> anyhow::Result<Vec<String>> {
        Ok(self
            .index
            .search(query, k)
            .await?
            .into_iter()
            .map(|d| d.content)
            .collect())
    }

    pub async fn store(&self, memories: Vec<Memory>) -> anyhow::Result<()> {
        self.index
            .add(memories.into_iter().map(Memory::into_document).collect())
            .await
    }
}

pub struct MemoryService {
    enabled: bool,
    factory: Arc<dyn IndexFactory>,
    extractor: Arc<dyn MemoryExtractor>,
    override_hook: Option<Arc<dyn MemoryOverride>>,
    hooks: Option<Arc<HookRegistry>>,
    handles: DashMap<TenantId, Arc<OnceCell<Arc<MemoryHandle>>>>,
}

impl MemoryService {
    pub fn new(factory: Arc<dyn IndexFactory>, extractor: Arc<dyn MemoryExtractor>) -> Self {
        Self {
            enabled: true,
            factory,
            extractor,
            override_hook: None,
            hooks: None,
            handles: DashMap::new(),
        }
    }

    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_override(mut self, hook: Arc<dyn MemoryOverride>) -> Self {
        self.override_hook = Some(hook);
        self
    }

    /// Registry notified with `MemoriesWritten` after each successful write.
    #[must_use]
    pub fn with_hooks(mut self, hooks: Arc<HookRegistry>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The tenant's handle, built on first use. Concurrent first calls for one
    /// tenant share a single construction.
    pub async fn handle(&self, tenant: &TenantId) -> anyhow::Result<Arc<MemoryHandle>> {
        let cell = Arc::clone(self.handles.entry(tenant.clone()).or_default().value());
        let handle = cell
            .get_or_try_init(|| async {
                let collection = tenant.memory_collection();
                let index = self.factory.open(&collection).await?;
                info!(tenant = %tenant, collection = %collection, "memory handle ready");
                Ok::<_, anyhow::Error>(Arc::new(MemoryHandle {
                    extractor: Arc::clone(&self.extractor),
                    index,
                }))
            })
            .await?;
        Ok(Arc::clone(handle))
    }

    /// Newline-joined contents of the top `k` memories for `query`.
    ///
    /// Empty when memory is disabled, the query is missing or blank, or the
    /// lookup fails.
    pub async fn retrieve(&self, tenant: &TenantId, query: Option<&str>, k: usize) -> String {
        let Some(query) = query.filter(|q| !q.trim().is_empty()) else {
            return String::new();
        };
        if !self.enabled || k == 0 {
            return String::new();
        }

        let found = match self.handle(tenant).await {
            Ok(handle) => handle.search(query, k).await,
            Err(e) => Err(e),
        };
        match found {
            Ok(memories) => {
                debug!(tenant = %tenant, count = memories.len(), "memories retrieved");
                memories.join("\n")
            },
            Err(e) => {
                warn!(tenant = %tenant, error = %e, "memory retrieval failed");
                String::new()
            },
        }
    }

    /// Extract and persist memories from a finished exchange. Returns how many
    /// were written; every failure is logged and yields 0.
    pub async fn write(&self, tenant: &TenantId, exchange: &[ChatTurn]) -> usize {
        if !self.enabled {
            return 0;
        }
        match self.try_write(tenant, exchange).await {
            Ok(count) => count,
            Err(e) => {
                warn!(tenant = %tenant, error = %e, "memory write failed");
                0
            },
        }
    }

    async fn try_write(&self, tenant: &TenantId, exchange: &[ChatTurn]) -> anyhow::Result<usize> {
        let handle = self.handle(tenant).await?;

        let extractor = match &self.override_hook {
            Some(hook) => match hook.extract(tenant, exchange).await? {
                ExtractionOverride::Skip => {
                    debug!(tenant = %tenant, "memory override skipped write");
                    return Ok(0);
                },
                ExtractionOverride::Memories(memories) => {
                    return self.persist(tenant, &handle, memories).await;
                },
                ExtractionOverride::Replacement(extractor) => extractor,
            },
            None => Arc::clone(handle.extractor()),
        };

        let memories = extractor.extract(exchange).await?;
        self.persist(tenant, &handle, memories).await
    }

    async fn persist(
        &self,
        tenant: &TenantId,
        handle: &MemoryHandle,
        memories: Vec<Memory>,
    ) -> anyhow::Result<usize> {
        if memories.is_empty() {
            return Ok(0);
        }
        let count = memories.len();
        handle.store(memories).await?;
        info!(tenant = %tenant, count, "memories written");

        if let Some(hooks) = &self.hooks {
            hooks
                .dispatch(&HookPayload::MemoriesWritten {
                    tenant: tenant.to_string(),
                    count,
                })
                .await;
        }
        Ok(count)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use {async_trait::async_trait, serde_json::json};

    use crate::{index::Document, schema::memory_pool, store_sqlite::SqliteIndexFactory};

    use super::*;

    /// Wraps the SQLite factory and counts `open` calls per collection.
    struct CountingFactory {
        inner: SqliteIndexFactory,
        opens: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl IndexFactory for CountingFactory {
        async fn open(&self, collection: &str) -> anyhow::Result<Arc<dyn DocumentIndex>> {
            tokio::task::yield_now().await;
            self.opens.lock().unwrap().push(collection.to_string());
            self.inner.open(collection).await
        }
    }

    struct FixedExtractor {
        memories: Vec<Memory>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MemoryExtractor for FixedExtractor {
        async fn extract(&self, _exchange: &[ChatTurn]) -> anyhow::Result<Vec<Memory>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.memories.clone())
        }
    }

    struct FailingExtractor;

    #[async_trait]
    impl MemoryExtractor for FailingExtractor {
        async fn extract(&self, _exchange: &[ChatTurn]) -> anyhow::Result<Vec<Memory>> {
            anyhow::bail!("model unavailable")
        }
    }

    fn tenant(id: &str) -> TenantId {
        TenantId::parse(id).unwrap()
    }

    fn exchange() -> Vec<ChatTurn> {
        vec![
            ChatTurn::user("I moved to Oslo"),
            ChatTurn::assistant("Noted"),
        ]
    }

    async fn setup(memories: Vec<&str>) -> (MemoryService, Arc<CountingFactory>, Arc<FixedExtractor>) {
        let factory = Arc::new(CountingFactory {
            inner: SqliteIndexFactory::new(memory_pool().await.unwrap()),
            opens: Mutex::new(Vec::new()),
        });
        let extractor = Arc::new(FixedExtractor {
            memories: memories.into_iter().map(|m| Memory::Text(m.into())).collect(),
            calls: AtomicUsize::new(0),
        });
        let service = MemoryService::new(factory.clone(), extractor.clone());
        (service, factory, extractor)
    }

    #[tokio::test]
    async fn handle_is_built_once_per_tenant() {
        let (service, factory, _) = setup(vec![]).await;
        let service = Arc::new(service);
        let acme = tenant("acme");

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let service = Arc::clone(&service);
            let acme = acme.clone();
            tasks.push(tokio::spawn(async move { service.handle(&acme).await.unwrap() }));
        }
        let handles: Vec<_> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert!(handles.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));

        service.handle(&tenant("globex")).await.unwrap();
        let mut opens = factory.opens.lock().unwrap().clone();
        opens.sort();
        assert_eq!(opens, vec!["mem:acme", "mem:globex"]);
    }

    #[tokio::test]
    async fn write_then_retrieve() {
        let (service, _, extractor) = setup(vec!["User lives in Oslo", "User likes tea"]).await;
        let acme = tenant("acme");

        assert_eq!(service.write(&acme, &exchange()).await, 2);
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);

        let block = service.retrieve(&acme, Some("where does the user live? Oslo"), 6).await;
        assert!(block.contains("User lives in Oslo"));

        // Tenants are isolated.
        let other = service.retrieve(&tenant("globex"), Some("Oslo"), 6).await;
        assert_eq!(other, "");
    }

    #[tokio::test]
    async fn retrieve_returns_empty_without_query_or_when_disabled() {
        let (service, factory, _) = setup(vec!["x"]).await;
        let acme = tenant("acme");
        assert_eq!(service.retrieve(&acme, None, 6).await, "");
        assert_eq!(service.retrieve(&acme, Some("  "), 6).await, "");
        // Blank queries never construct a handle.
        assert!(factory.opens.lock().unwrap().is_empty());

        let service = service.enabled(false);
        assert_eq!(service.retrieve(&acme, Some("x"), 6).await, "");
        assert_eq!(service.write(&acme, &exchange()).await, 0);
    }

    #[tokio::test]
    async fn empty_extraction_writes_nothing() {
        let (service, factory, _) = setup(vec![]).await;
        let acme = tenant("acme");
        assert_eq!(service.write(&acme, &exchange()).await, 0);
        let count = factory.inner.index("mem:acme").count().await.unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn extractor_failure_is_swallowed() {
        let factory = Arc::new(SqliteIndexFactory::new(memory_pool().await.unwrap()));
        let service = MemoryService::new(factory, Arc::new(FailingExtractor));
        assert_eq!(service.write(&tenant("acme"), &exchange()).await, 0);
    }

    struct StaticOverride(Mutex<Option<ExtractionOverride>>);

    #[async_trait]
    impl MemoryOverride for StaticOverride {
        async fn extract(
            &self,
            _tenant: &TenantId,
            _exchange: &[ChatTurn],
        ) -> anyhow::Result<ExtractionOverride> {
            Ok(self.0.lock().unwrap().take().unwrap_or(ExtractionOverride::Skip))
        }
    }

    #[tokio::test]
    async fn override_variants() {
        let acme = tenant("acme");

        // Skip: default extractor never runs.
        let (service, _, extractor) = setup(vec!["default"]).await;
        let service = service.with_override(Arc::new(StaticOverride(Mutex::new(Some(
            ExtractionOverride::Skip,
        )))));
        assert_eq!(service.write(&acme, &exchange()).await, 0);
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 0);

        // Memories: persisted as given, structured ones included.
        let (service, factory, extractor) = setup(vec!["default"]).await;
        let service = service.with_override(Arc::new(StaticOverride(Mutex::new(Some(
            ExtractionOverride::Memories(vec![
                Memory::Text("from override".into()),
                Memory::Structured(json!({"content": "structured fact"})),
            ]),
        )))));
        assert_eq!(service.write(&acme, &exchange()).await, 2);
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 0);
        let stored: Vec<Document> = factory
            .inner
            .index("mem:acme")
            .search("structured fact", 4)
            .await
            .unwrap();
        assert_eq!(stored[0].content, "structured fact");

        // Memories with an empty list writes nothing.
        let (service, _, _) = setup(vec!["default"]).await;
        let service = service.with_override(Arc::new(StaticOverride(Mutex::new(Some(
            ExtractionOverride::Memories(vec![]),
        )))));
        assert_eq!(service.write(&acme, &exchange()).await, 0);

        // Replacement: the replacement runs instead of the default.
        let replacement = Arc::new(FixedExtractor {
            memories: vec![Memory::Text("replacement".into())],
            calls: AtomicUsize::new(0),
        });
        let (service, _, extractor) = setup(vec!["default"]).await;
        let service = service.with_override(Arc::new(StaticOverride(Mutex::new(Some(
            ExtractionOverride::Replacement(replacement.clone()),
        )))));
        assert_eq!(service.write(&acme, &exchange()).await, 1);
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 0);
        assert_eq!(replacement.calls.load(Ordering::SeqCst), 1);
        assert_eq!(service.retrieve(&acme, Some("replacement"), 6).await, "replacement");
    }
}
