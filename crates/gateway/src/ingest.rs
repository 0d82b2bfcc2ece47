//! Persisting uploaded attachments and indexing their text per tenant.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use {
    async_trait::async_trait,
    sha2::{Digest, Sha256},
    tracing::{debug, info, warn},
};

use {
    brainproxy_common::{
        TenantId,
        hooks::{HookPayload, HookRegistry},
    },
    brainproxy_memory::{Document, IndexFactory},
};

use crate::normalize::Attachment;

/// Pulls indexable text out of a stored file.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    /// Text content of the file at `path`; empty when the type isn't supported.
    async fn extract(&self, path: &Path, mime: &str) -> anyhow::Result<String>;
}

/// Reads text-like files as UTF-8. Known binary types yield nothing; unknown
/// types are accepted only when the bytes are valid UTF-8.
pub struct PlainTextExtractor;

const TEXT_APPLICATION_TYPES: &[&str] = &[
    "application/json",
    "application/xml",
    "application/yaml",
    "application/x-yaml",
    "application/toml",
    "application/csv",
    "application/javascript",
    "application/markdown",
    "application/x-ndjson",
    "application/sql",
];

fn base_mime(mime: &str) -> String {
    mime.split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

fn is_text_mime(mime: &str) -> bool {
    mime.starts_with("text/")
        || mime.ends_with("+json")
        || mime.ends_with("+xml")
        || TEXT_APPLICATION_TYPES.contains(&mime)
}

fn is_binary_mime(mime: &str) -> bool {
    ["image/", "audio/", "video/", "font/"]
        .iter()
        .any(|prefix| mime.starts_with(prefix))
        || matches!(
            mime,
            "application/pdf"
                | "application/zip"
                | "application/gzip"
                | "application/x-tar"
                | "application/x-7z-compressed"
                | "application/wasm"
        )
}

#[async_trait]
impl TextExtractor for PlainTextExtractor {
    async fn extract(&self, path: &Path, mime: &str) -> anyhow::Result<String> {
        let mime = base_mime(mime);
        if is_binary_mime(&mime) {
            return Ok(String::new());
        }
        let bytes = tokio::fs::read(path).await?;
        if is_text_mime(&mime) {
            return Ok(String::from_utf8_lossy(&bytes).into_owned());
        }
        Ok(String::from_utf8(bytes).unwrap_or_default())
    }
}

/// Make an uploaded file name safe to use as a path component.
///
/// Spaces become `_`, anything outside `[A-Za-z0-9._-]` is removed and leading
/// dots are trimmed. Falls back to `upload` when nothing is left.
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c == ' ' { '_' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .collect();
    let trimmed = cleaned.trim_start_matches('.');
    if trimmed.is_empty() {
        "upload".to_string()
    } else {
        trimmed.to_string()
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[derive(Debug, Default)]
pub struct IngestReport {
    /// Where each accepted attachment was written, in input order.
    pub stored: Vec<PathBuf>,
    /// Documents handed to the tenant index.
    pub documents: usize,
}

pub struct DocumentIngestor {
    root: PathBuf,
    extractor: Arc<dyn TextExtractor>,
    indexes: Arc<dyn IndexFactory>,
    hooks: Option<Arc<HookRegistry>>,
}

impl DocumentIngestor {
    pub fn new(
        root: impl Into<PathBuf>,
        extractor: Arc<dyn TextExtractor>,
        indexes: Arc<dyn IndexFactory>,
    ) -> Self {
        Self {
            root: root.into(),
            extractor,
            indexes,
            hooks: None,
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<HookRegistry>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store every attachment under `<root>/<tenant>/` and index the ones
    /// with extractable text in a single batch.
    ///
    /// Failures on individual files are logged and skipped.
    pub async fn ingest(&self, tenant: &TenantId, files: Vec<Attachment>) -> IngestReport {
        let dir = self.root.join(tenant.as_str());
        let mut report = IngestReport::default();
        let mut documents = Vec::new();
        let mut names = Vec::new();

        for file in files {
            match self.store_one(&dir, &file).await {
                Ok((path, Some(document))) => {
                    report.stored.push(path);
                    names.push(file.name);
                    documents.push(document);
                },
                Ok((path, None)) => {
                    debug!(tenant = %tenant, file = %file.name, mime = %file.mime, "no text extracted");
                    report.stored.push(path);
                },
                Err(e) => {
                    warn!(tenant = %tenant, file = %file.name, error = %e, "failed to store attachment");
                },
            }
        }

        if documents.is_empty() {
            return report;
        }

        let count = documents.len();
        let indexed = async {
            let index = self.indexes.open(&tenant.document_collection()).await?;
            index.add(documents).await
        }
        .await;
        if let Err(e) = indexed {
            warn!(tenant = %tenant, error = %e, "failed to index attachments");
            return report;
        }

        report.documents = count;
        info!(tenant = %tenant, documents = count, "attachments indexed");

        if let Some(hooks) = &self.hooks {
            hooks
                .dispatch(&HookPayload::DocumentsIngested {
                    tenant: tenant.to_string(),
                    files: names,
                    documents: count,
                })
                .await;
        }
        report
    }

    async fn store_one(
        &self,
        dir: &Path,
        file: &Attachment,
    ) -> anyhow::Result<(PathBuf, Option<Document>)> {
        let digest = sha256_hex(&file.bytes);
        let path = dir.join(format!("{}_{}", &digest[..8], sanitize_name(&file.name)));

        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(&path, &file.bytes).await?;

        let text = self.extractor.extract(&path, &file.mime).await?;
        if text.trim().is_empty() {
            return Ok((path, None));
        }

        let document = Document::new(text)
            .with_meta("name", file.name.as_str())
            .with_meta("mime", file.mime.as_str())
            .with_meta("sha256", digest)
            .with_meta("path", path.display().to_string());
        Ok((path, Some(document)))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use {
        brainproxy_common::hooks::{HookAction, HookEvent, HookHandler},
        brainproxy_memory::DocumentIndex,
    };

    use super::*;

    #[derive(Default)]
    struct RecordingIndex {
        added: Mutex<Vec<Vec<Document>>>,
        opened: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DocumentIndex for RecordingIndex {
        async fn add(&self, documents: Vec<Document>) -> anyhow::Result<()> {
            self.added.lock().unwrap().push(documents);
            Ok(())
        }

        async fn search(&self, _query: &str, _k: usize) -> anyhow::Result<Vec<Document>> {
            Ok(Vec::new())
        }
    }

    struct SharedFactory(Arc<RecordingIndex>);

    #[async_trait]
    impl IndexFactory for SharedFactory {
        async fn open(&self, collection: &str) -> anyhow::Result<Arc<dyn DocumentIndex>> {
            self.0.opened.lock().unwrap().push(collection.to_string());
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct IngestWatcher {
        seen: Mutex<Vec<HookPayload>>,
    }

    #[async_trait]
    impl HookHandler for IngestWatcher {
        fn name(&self) -> &str {
            "ingest-watcher"
        }

        fn events(&self) -> &[HookEvent] {
            &[HookEvent::DocumentsIngested]
        }

        async fn handle(
            &self,
            _event: HookEvent,
            payload: &HookPayload,
        ) -> anyhow::Result<HookAction> {
            self.seen.lock().unwrap().push(payload.clone());
            Ok(HookAction::Continue)
        }
    }

    fn attachment(name: &str, mime: &str, bytes: &[u8]) -> Attachment {
        Attachment {
            name: name.into(),
            mime: mime.into(),
            bytes: bytes.to_vec(),
        }
    }

    fn setup(root: &Path) -> (DocumentIngestor, Arc<RecordingIndex>) {
        let index = Arc::new(RecordingIndex::default());
        let ingestor = DocumentIngestor::new(
            root,
            Arc::new(PlainTextExtractor),
            Arc::new(SharedFactory(index.clone())),
        );
        (ingestor, index)
    }

    #[test]
    fn fingerprint_is_lowercase_hex_sha256() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn sanitize_rules() {
        assert_eq!(sanitize_name("notes.txt"), "notes.txt");
        assert_eq!(sanitize_name("Q3 report (final).md"), "Q3_report_final.md");
        assert_eq!(sanitize_name("../../etc/passwd"), "etcpasswd");
        assert_eq!(sanitize_name("...hidden"), "hidden");
        assert_eq!(sanitize_name("日本語"), "upload");
        assert_eq!(sanitize_name(""), "upload");
    }

    #[tokio::test]
    async fn stores_under_tenant_dir_and_indexes_once() {
        let tmp = tempfile::tempdir().unwrap();
        let (ingestor, index) = setup(tmp.path());
        let mut registry = HookRegistry::new();
        let watcher = Arc::new(IngestWatcher::default());
        registry.register(watcher.clone());
        let ingestor = ingestor.with_hooks(Arc::new(registry));
        let tenant = TenantId::parse("acme").unwrap();

        let report = ingestor
            .ingest(&tenant, vec![
                attachment("notes.txt", "text/plain", b"Q3 revenue was $5M"),
                attachment("data.json", "application/json", b"{\"a\": 1}"),
            ])
            .await;

        assert_eq!(report.documents, 2);
        assert_eq!(report.stored.len(), 2);
        let digest = sha256_hex(b"Q3 revenue was $5M");
        let expected = tmp
            .path()
            .join("acme")
            .join(format!("{}_notes.txt", &digest[..8]));
        assert_eq!(report.stored[0], expected);
        assert_eq!(
            std::fs::read(&expected).unwrap(),
            b"Q3 revenue was $5M".to_vec()
        );

        assert_eq!(*index.opened.lock().unwrap(), vec!["doc:acme".to_string()]);
        let added = index.added.lock().unwrap();
        assert_eq!(added.len(), 1, "one batch per request");
        assert_eq!(added[0][0].content, "Q3 revenue was $5M");
        assert_eq!(added[0][0].metadata["name"], "notes.txt");

        let seen = watcher.seen.lock().unwrap();
        assert!(matches!(
            &seen[0],
            HookPayload::DocumentsIngested { tenant, documents: 2, .. } if tenant == "acme"
        ));
    }

    #[tokio::test]
    async fn identical_bytes_share_one_path() {
        let tmp = tempfile::tempdir().unwrap();
        let (ingestor, index) = setup(tmp.path());
        let tenant = TenantId::parse("acme").unwrap();

        let report = ingestor
            .ingest(&tenant, vec![
                attachment("a.txt", "text/plain", b"same bytes"),
                attachment("a.txt", "text/plain", b"same bytes"),
            ])
            .await;

        assert_eq!(report.stored[0], report.stored[1]);
        let files = std::fs::read_dir(tmp.path().join("acme")).unwrap().count();
        assert_eq!(files, 1);
        assert_eq!(index.added.lock().unwrap()[0].len(), 2);
    }

    #[tokio::test]
    async fn binary_files_are_stored_but_not_indexed() {
        let tmp = tempfile::tempdir().unwrap();
        let (ingestor, index) = setup(tmp.path());
        let tenant = TenantId::parse("acme").unwrap();

        let report = ingestor
            .ingest(&tenant, vec![attachment(
                "logo.png",
                "image/png",
                &[0x89, b'P', b'N', b'G'],
            )])
            .await;

        assert_eq!(report.stored.len(), 1);
        assert_eq!(report.documents, 0);
        assert!(index.added.lock().unwrap().is_empty());
        assert!(index.opened.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn extractor_handles_unknown_types() {
        let tmp = tempfile::tempdir().unwrap();
        let utf8 = tmp.path().join("u");
        let binary = tmp.path().join("b");
        std::fs::write(&utf8, "plain words").unwrap();
        std::fs::write(&binary, [0xff, 0xfe, 0x00]).unwrap();

        let ex = PlainTextExtractor;
        assert_eq!(
            ex.extract(&utf8, "application/octet-stream").await.unwrap(),
            "plain words"
        );
        assert_eq!(ex.extract(&binary, "application/octet-stream").await.unwrap(), "");
        assert_eq!(
            ex.extract(&utf8, "text/markdown; charset=utf-8").await.unwrap(),
            "plain words"
        );
        assert_eq!(ex.extract(&utf8, "application/pdf").await.unwrap(), "");
    }
}
