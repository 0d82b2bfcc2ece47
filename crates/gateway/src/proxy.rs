//! The augmentation pipeline behind `POST /v1/{tenant}/chat/completions`.

use std::{collections::BTreeMap, sync::Arc, time::Instant};

use {
    serde_json::Value,
    tokio::{sync::mpsc, task::JoinHandle},
    tracing::{debug, info, warn},
};

use {
    brainproxy_common::{
        TenantId,
        hooks::{HookAction, HookPayload, HookRegistry},
    },
    brainproxy_config::BrainProxyConfig,
    brainproxy_memory::{IndexFactory, MemoryService},
    brainproxy_protocol::{ChatCompletionRequest, ChatTurn},
    brainproxy_providers::CompletionProvider,
};

use crate::{
    context,
    error::ProxyError,
    ingest::DocumentIngestor,
    normalize::normalize,
    relay::{ExchangeRecorder, Frame, spawn_buffered_writeback, spawn_stream_relay},
};

/// Frames buffered between the relay task and a slow client.
const STREAM_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub default_model: String,
    pub retrieval_top_k: usize,
    pub memory_top_k: usize,
    pub max_upload_bytes: u64,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self::from_config(&BrainProxyConfig::default())
    }
}

impl ProxySettings {
    pub fn from_config(config: &BrainProxyConfig) -> Self {
        Self {
            default_model: config.upstream.default_model.clone(),
            retrieval_top_k: config.retrieval.top_k,
            memory_top_k: config.memory.top_k,
            max_upload_bytes: config.ingest.max_upload_bytes(),
        }
    }
}

/// What the client gets back. The attached task finishes write-back and
/// usage reporting after the response itself is complete.
pub enum ProxyResponse {
    Buffered {
        body: Value,
        writeback: JoinHandle<()>,
    },
    Streaming {
        frames: mpsc::Receiver<Frame>,
        relay: JoinHandle<()>,
    },
}

pub struct BrainProxy {
    settings: ProxySettings,
    provider: Arc<dyn CompletionProvider>,
    documents: Arc<dyn IndexFactory>,
    ingestor: DocumentIngestor,
    memory: Arc<MemoryService>,
    hooks: Arc<HookRegistry>,
}

impl BrainProxy {
    pub fn new(
        settings: ProxySettings,
        provider: Arc<dyn CompletionProvider>,
        documents: Arc<dyn IndexFactory>,
        ingestor: DocumentIngestor,
        memory: Arc<MemoryService>,
        hooks: Arc<HookRegistry>,
    ) -> Self {
        Self {
            settings,
            provider,
            documents,
            ingestor,
            memory,
            hooks,
        }
    }

    pub fn settings(&self) -> &ProxySettings {
        &self.settings
    }

    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.hooks
    }

    pub fn memory(&self) -> &Arc<MemoryService> {
        &self.memory
    }

    /// Run the `RequestReceived` hooks. A block becomes a 401.
    pub async fn authorize(
        &self,
        tenant: &str,
        method: &str,
        path: &str,
        headers: BTreeMap<String, String>,
    ) -> Result<(), ProxyError> {
        let payload = HookPayload::RequestReceived {
            tenant: tenant.to_string(),
            method: method.to_string(),
            path: path.to_string(),
            headers,
        };
        match self.hooks.dispatch(&payload).await {
            HookAction::Continue => Ok(()),
            HookAction::Block(reason) => Err(ProxyError::Unauthorized(reason)),
        }
    }

    /// Normalize, ingest, augment, dispatch, and hand back the response.
    pub async fn handle(
        &self,
        tenant: &TenantId,
        request: ChatCompletionRequest,
    ) -> Result<ProxyResponse, ProxyError> {
        if request.messages.is_empty() {
            return Err(ProxyError::InvalidRequest(
                "messages must be a non-empty array".into(),
            ));
        }
        let model = request
            .resolved_model(&self.settings.default_model)
            .to_string();

        let normalized = normalize(&request.messages, self.settings.max_upload_bytes);
        if !normalized.files.is_empty() {
            let report = self.ingestor.ingest(tenant, normalized.files).await;
            debug!(tenant = %tenant, stored = report.stored.len(), documents = report.documents, "attachments processed");
        }
        let augmented = self.augment(tenant, normalized.turns).await;

        info!(
            tenant = %tenant,
            model = %model,
            stream = request.stream,
            turns = augmented.len(),
            "dispatching completion"
        );

        let started = Instant::now();
        let recorder = ExchangeRecorder::new(
            tenant.clone(),
            model.clone(),
            augmented.clone(),
            started,
            Arc::clone(&self.memory),
            Arc::clone(&self.hooks),
        );

        if request.stream {
            let chunks = self
                .provider
                .stream(&augmented, &model)
                .await
                .map_err(|e| ProxyError::upstream(&e))?;
            let (frames, relay) = spawn_stream_relay(chunks, recorder, STREAM_BUFFER);
            Ok(ProxyResponse::Streaming { frames, relay })
        } else {
            let body = self
                .provider
                .complete(&augmented, &model)
                .await
                .map_err(|e| ProxyError::upstream(&e))?;
            let writeback = spawn_buffered_writeback(recorder, &body);
            Ok(ProxyResponse::Buffered { body, writeback })
        }
    }

    /// Memories first, then document excerpts, both just before the last turn.
    async fn augment(&self, tenant: &TenantId, turns: Vec<ChatTurn>) -> Vec<ChatTurn> {
        let query = turns.last().and_then(ChatTurn::text);
        let memories = self
            .memory
            .retrieve(tenant, query, self.settings.memory_top_k)
            .await;
        let turns = context::with_memories(turns, &memories);

        if self.settings.retrieval_top_k == 0 {
            return turns;
        }
        let index = match self.documents.open(&tenant.document_collection()).await {
            Ok(index) => index,
            Err(e) => {
                warn!(tenant = %tenant, error = %e, "document index unavailable");
                return turns;
            },
        };
        let fallback = turns.clone();
        match context::with_documents(index.as_ref(), turns, self.settings.retrieval_top_k).await {
            Ok(turns) => turns,
            Err(e) => {
                warn!(tenant = %tenant, error = %e, "document retrieval failed");
                fallback
            },
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use {
        async_trait::async_trait,
        base64::{Engine as _, engine::general_purpose::STANDARD},
        brainproxy_common::hooks::{HookEvent, HookHandler},
        brainproxy_memory::{
            Document, DocumentIndex, Memory, MemoryExtractor, SqliteIndexFactory,
            schema::memory_pool,
        },
        brainproxy_providers::ChunkStream,
        futures::stream,
        serde_json::json,
    };

    use {
        super::*,
        crate::ingest::PlainTextExtractor,
    };

    #[derive(Default)]
    struct FakeProvider {
        calls: Mutex<Vec<(Vec<ChatTurn>, String)>>,
        fail: bool,
    }

    #[async_trait]
    impl CompletionProvider for FakeProvider {
        fn name(&self) -> &str {
            "fake"
        }

        async fn complete(&self, messages: &[ChatTurn], model: &str) -> anyhow::Result<Value> {
            self.calls
                .lock()
                .unwrap()
                .push((messages.to_vec(), model.to_string()));
            if self.fail {
                anyhow::bail!("upstream API error HTTP 500: boom");
            }
            Ok(json!({
                "choices": [{"message": {"role": "assistant", "content": "Hi!"}}],
                "usage": {"total_tokens": 7}
            }))
        }

        async fn stream(&self, messages: &[ChatTurn], model: &str) -> anyhow::Result<ChunkStream> {
            self.calls
                .lock()
                .unwrap()
                .push((messages.to_vec(), model.to_string()));
            if self.fail {
                anyhow::bail!("upstream API error HTTP 500: boom");
            }
            let chunks: Vec<anyhow::Result<Value>> = vec![
                Ok(json!({"choices": [{"delta": {"content": "Hel"}}]})),
                Ok(json!({"choices": [{"delta": {"content": "lo"}}]})),
            ];
            Ok(Box::pin(stream::iter(chunks)))
        }
    }

    struct FixedExtractor(Vec<&'static str>);

    #[async_trait]
    impl MemoryExtractor for FixedExtractor {
        async fn extract(&self, _exchange: &[ChatTurn]) -> anyhow::Result<Vec<Memory>> {
            Ok(self.0.iter().map(|m| Memory::Text((*m).into())).collect())
        }
    }

    struct DenyAll;

    #[async_trait]
    impl HookHandler for DenyAll {
        fn name(&self) -> &str {
            "deny-all"
        }

        fn events(&self) -> &[HookEvent] {
            &[HookEvent::RequestReceived]
        }

        async fn handle(
            &self,
            _event: HookEvent,
            _payload: &HookPayload,
        ) -> anyhow::Result<HookAction> {
            Ok(HookAction::Block("nope".into()))
        }
    }

    struct Harness {
        proxy: BrainProxy,
        provider: Arc<FakeProvider>,
        factory: Arc<SqliteIndexFactory>,
        _tmp: tempfile::TempDir,
    }

    async fn harness(provider: FakeProvider, hooks: HookRegistry) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let provider = Arc::new(provider);
        let factory = Arc::new(SqliteIndexFactory::new(memory_pool().await.unwrap()));
        let hooks = Arc::new(hooks);
        let memory = Arc::new(
            MemoryService::new(factory.clone(), Arc::new(FixedExtractor(vec![
                "User works at Acme",
            ])))
            .with_hooks(hooks.clone()),
        );
        let ingestor = DocumentIngestor::new(
            tmp.path(),
            Arc::new(PlainTextExtractor),
            factory.clone(),
        );
        let proxy = BrainProxy::new(
            ProxySettings::default(),
            provider.clone(),
            factory.clone(),
            ingestor,
            memory,
            hooks,
        );
        Harness {
            proxy,
            provider,
            factory,
            _tmp: tmp,
        }
    }

    fn request(value: Value) -> ChatCompletionRequest {
        serde_json::from_value(value).unwrap()
    }

    fn acme() -> TenantId {
        TenantId::parse("acme").unwrap()
    }

    #[tokio::test]
    async fn buffered_passthrough_then_memory_written() {
        let h = harness(FakeProvider::default(), HookRegistry::new()).await;
        let resp = h
            .proxy
            .handle(
                &acme(),
                request(json!({"messages": [{"role": "user", "content": "Hello"}]})),
            )
            .await
            .unwrap();

        let ProxyResponse::Buffered { body, writeback } = resp else {
            panic!("expected buffered response");
        };
        assert_eq!(body["choices"][0]["message"]["content"], "Hi!");
        writeback.await.unwrap();

        let calls = h.provider.calls.lock().unwrap();
        assert_eq!(calls[0].0, vec![ChatTurn::user("Hello")]);
        assert_eq!(calls[0].1, "gpt-4o");
        drop(calls);

        let memories = h.factory.index("mem:acme").count().await.unwrap();
        assert_eq!(memories, 1);
    }

    #[tokio::test]
    async fn attachment_is_ingested_and_retrieved_for_same_request() {
        let h = harness(FakeProvider::default(), HookRegistry::new()).await;
        let data = STANDARD.encode("Q3 revenue was $5M");
        let req = request(json!({
            "model": "gpt-4o-mini",
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "What was Q3 revenue?"},
                {"type": "file_data", "file_data": {"name": "notes.txt", "mime": "text/plain", "data": data}}
            ]}]
        }));
        let resp = h.proxy.handle(&acme(), req).await.unwrap();
        if let ProxyResponse::Buffered { writeback, .. } = resp {
            writeback.await.unwrap();
        }

        let calls = h.provider.calls.lock().unwrap();
        let (sent, model) = &calls[0];
        assert_eq!(model, "gpt-4o-mini");
        assert_eq!(sent.len(), 2);
        assert_eq!(
            sent[0],
            ChatTurn::system("Relevant context from documents:\n\nQ3 revenue was $5M")
        );
        assert_eq!(sent[1], ChatTurn::user("What was Q3 revenue?"));
    }

    #[tokio::test]
    async fn memories_from_earlier_exchange_are_injected() {
        let h = harness(FakeProvider::default(), HookRegistry::new()).await;
        h.factory
            .index("mem:acme")
            .add(vec![Document::new("User works at Acme")])
            .await
            .unwrap();

        let resp = h
            .proxy
            .handle(
                &acme(),
                request(json!({"messages": [
                    {"role": "user", "content": "Where does the user work? Acme?"}
                ]})),
            )
            .await
            .unwrap();
        if let ProxyResponse::Buffered { writeback, .. } = resp {
            writeback.await.unwrap();
        }

        let calls = h.provider.calls.lock().unwrap();
        assert_eq!(
            calls[0].0[0],
            ChatTurn::system("Relevant memories:\nUser works at Acme")
        );
    }

    #[tokio::test]
    async fn lookalike_tenant_cannot_see_memories() {
        let h = harness(FakeProvider::default(), HookRegistry::new()).await;
        let resp = h
            .proxy
            .handle(
                &acme(),
                request(json!({"messages": [{"role": "user", "content": "I work at Acme"}]})),
            )
            .await
            .unwrap();
        if let ProxyResponse::Buffered { writeback, .. } = resp {
            writeback.await.unwrap();
        }
        assert_eq!(h.factory.index("mem:acme").count().await.unwrap(), 1);

        let lookalike = TenantId::parse("acme_memory").unwrap();
        let question = "Where does the user work? Acme?";
        let resp = h
            .proxy
            .handle(
                &lookalike,
                request(json!({"messages": [{"role": "user", "content": question}]})),
            )
            .await
            .unwrap();
        if let ProxyResponse::Buffered { writeback, .. } = resp {
            writeback.await.unwrap();
        }

        let calls = h.provider.calls.lock().unwrap();
        assert_eq!(calls[1].0, vec![ChatTurn::user(question)]);
    }

    #[tokio::test]
    async fn streaming_relays_frames() {
        let h = harness(FakeProvider::default(), HookRegistry::new()).await;
        let resp = h
            .proxy
            .handle(
                &acme(),
                request(json!({"stream": true, "messages": [{"role": "user", "content": "Hi"}]})),
            )
            .await
            .unwrap();
        let ProxyResponse::Streaming { mut frames, relay } = resp else {
            panic!("expected streaming response");
        };
        let mut payloads = Vec::new();
        while let Some(frame) = frames.recv().await {
            payloads.push(frame.payload());
        }
        relay.await.unwrap();
        assert_eq!(payloads.len(), 3);
        assert_eq!(payloads[2], "[DONE]");
    }

    #[tokio::test]
    async fn empty_messages_is_rejected_before_dispatch() {
        let h = harness(FakeProvider::default(), HookRegistry::new()).await;
        let err = h
            .proxy
            .handle(&acme(), request(json!({"messages": []})))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ProxyError::InvalidRequest(_)));
        assert!(h.provider.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn upstream_failure_maps_to_bad_gateway() {
        let provider = FakeProvider {
            fail: true,
            ..Default::default()
        };
        let h = harness(provider, HookRegistry::new()).await;
        let err = h
            .proxy
            .handle(
                &acme(),
                request(json!({"messages": [{"role": "user", "content": "Hi"}]})),
            )
            .await
            .err()
            .unwrap();
        assert_eq!(err.status().as_u16(), 502);
        assert!(err.to_string().contains("HTTP 500"));
    }

    #[tokio::test]
    async fn blocking_hook_denies_request() {
        let mut hooks = HookRegistry::new();
        hooks.register(Arc::new(DenyAll));
        let h = harness(FakeProvider::default(), hooks).await;
        let err = h
            .proxy
            .authorize("acme", "POST", "/v1/acme/chat/completions", BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Unauthorized(ref r) if r == "nope"));
    }
}
