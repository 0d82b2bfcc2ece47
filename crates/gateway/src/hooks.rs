//! Built-in hook handlers: bearer-key auth and usage logging.

use {
    async_trait::async_trait,
    secrecy::{ExposeSecret, Secret},
    sha2::{Digest, Sha256},
    tracing::info,
};

use brainproxy_common::hooks::{HookAction, HookEvent, HookHandler, HookPayload};

/// Rejects requests whose `Authorization: Bearer` token is not one of the
/// configured keys.
///
/// Only SHA-256 digests of the keys are kept. A presented token is hashed and
/// compared digest to digest, so the comparison time depends on neither the
/// key contents nor their lengths.
pub struct ApiKeyAuth {
    digests: Vec<[u8; 32]>,
}

impl ApiKeyAuth {
    pub fn new(keys: Vec<Secret<String>>) -> Self {
        Self {
            digests: keys.iter().map(|k| key_digest(k.expose_secret())).collect(),
        }
    }

    fn accepts(&self, token: &str) -> bool {
        let presented = key_digest(token);
        self.digests.iter().fold(false, |found, digest| {
            let diff = digest
                .iter()
                .zip(&presented)
                .fold(0u8, |acc, (a, b)| acc | (a ^ b));
            found | (diff == 0)
        })
    }
}

fn key_digest(key: &str) -> [u8; 32] {
    Sha256::digest(key.as_bytes()).into()
}

#[async_trait]
impl HookHandler for ApiKeyAuth {
    fn name(&self) -> &str {
        "api-key-auth"
    }

    fn events(&self) -> &[HookEvent] {
        &[HookEvent::RequestReceived]
    }

    fn priority(&self) -> i32 {
        100
    }

    async fn handle(&self, _event: HookEvent, payload: &HookPayload) -> anyhow::Result<HookAction> {
        let HookPayload::RequestReceived { headers, .. } = payload else {
            return Ok(HookAction::Continue);
        };
        let Some(value) = headers.get("authorization") else {
            return Ok(HookAction::Block("missing API key".into()));
        };
        let token = value
            .strip_prefix("Bearer ")
            .or_else(|| value.strip_prefix("bearer "))
            .unwrap_or(value)
            .trim();
        if self.accepts(token) {
            Ok(HookAction::Continue)
        } else {
            Ok(HookAction::Block("invalid API key".into()))
        }
    }
}

/// Emits one structured log line per recorded usage event.
pub struct UsageLogger;

#[async_trait]
impl HookHandler for UsageLogger {
    fn name(&self) -> &str {
        "usage-logger"
    }

    fn events(&self) -> &[HookEvent] {
        &[HookEvent::UsageRecorded]
    }

    async fn handle(&self, _event: HookEvent, payload: &HookPayload) -> anyhow::Result<HookAction> {
        if let HookPayload::UsageRecorded {
            tenant,
            model,
            tokens,
            seconds,
            streamed,
        } = payload
        {
            info!(tenant = %tenant, model = %model, tokens, seconds, streamed, "usage");
        }
        Ok(HookAction::Continue)
    }
}
