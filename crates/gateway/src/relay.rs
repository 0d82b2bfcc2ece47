//! Delivering upstream output to the client and recording the finished
//! exchange afterwards.
//!
//! Both delivery modes end the same way: the full conversation plus the
//! assistant reply goes to memory write-back, then usage is reported. That
//! work runs on a detached task so the client never waits for it.

use std::{sync::Arc, time::Instant};

use {
    futures::StreamExt,
    serde_json::Value,
    tokio::{sync::mpsc, task::JoinHandle},
    tracing::{debug, warn},
};

use {
    brainproxy_common::{
        TenantId,
        hooks::{HookPayload, HookRegistry},
    },
    brainproxy_memory::MemoryService,
    brainproxy_protocol::{
        ChatTurn, DONE, ErrorBody, delta_content, error_types, message_content, total_tokens,
    },
    brainproxy_providers::ChunkStream,
};

/// One unit of a streamed response, in emission order.
#[derive(Debug, Clone)]
pub enum Frame {
    /// An upstream chunk, forwarded untouched.
    Chunk(Value),
    /// The upstream stream failed mid-flight.
    Error(ErrorBody),
    /// End of stream. Always the last frame.
    Done,
}

impl Frame {
    /// The `data:` payload of this frame's SSE event.
    pub fn payload(&self) -> String {
        match self {
            Self::Chunk(chunk) => chunk.to_string(),
            Self::Error(body) => serde_json::to_string(body).unwrap_or_default(),
            Self::Done => DONE.to_string(),
        }
    }
}

/// Everything needed to persist an exchange once the reply is known.
pub struct ExchangeRecorder {
    tenant: TenantId,
    model: String,
    conversation: Vec<ChatTurn>,
    started: Instant,
    memory: Arc<MemoryService>,
    hooks: Arc<HookRegistry>,
}

impl ExchangeRecorder {
    pub fn new(
        tenant: TenantId,
        model: impl Into<String>,
        conversation: Vec<ChatTurn>,
        started: Instant,
        memory: Arc<MemoryService>,
        hooks: Arc<HookRegistry>,
    ) -> Self {
        Self {
            tenant,
            model: model.into(),
            conversation,
            started,
            memory,
            hooks,
        }
    }

    /// Write the exchange back to memory, then report usage when `tokens`
    /// is known.
    pub async fn finish(self, reply: String, tokens: Option<u64>, streamed: bool) {
        let seconds = self.started.elapsed().as_secs_f64();

        let mut exchange = self.conversation;
        exchange.push(ChatTurn::assistant(reply));
        let written = self.memory.write(&self.tenant, &exchange).await;
        debug!(tenant = %self.tenant, written, streamed, "exchange recorded");

        let Some(tokens) = tokens else {
            debug!(tenant = %self.tenant, model = %self.model, "completion carried no usage");
            return;
        };
        self.hooks
            .dispatch(&HookPayload::UsageRecorded {
                tenant: self.tenant.to_string(),
                model: self.model,
                tokens,
                seconds,
                streamed,
            })
            .await;
    }
}

/// Record a buffered completion in the background.
pub fn spawn_buffered_writeback(recorder: ExchangeRecorder, completion: &Value) -> JoinHandle<()> {
    let reply = message_content(completion).unwrap_or_default().to_string();
    let tokens = total_tokens(completion);
    tokio::spawn(recorder.finish(reply, tokens, false))
}

/// Forward `chunks` as frames on a bounded channel, then record the exchange.
///
/// Token usage for a stream is the character count of the concatenated
/// deltas. If the receiver is dropped the relay stops pulling from upstream
/// and records whatever text it has accumulated.
pub fn spawn_stream_relay(
    mut chunks: ChunkStream,
    recorder: ExchangeRecorder,
    buffer: usize,
) -> (mpsc::Receiver<Frame>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(buffer.max(1));

    let task = tokio::spawn(async move {
        let mut reply = String::new();
        let mut client_gone = false;

        loop {
            let item = tokio::select! {
                biased;
                () = tx.closed() => {
                    client_gone = true;
                    break;
                },
                item = chunks.next() => item,
            };
            let Some(item) = item else {
                break;
            };
            match item {
                Ok(chunk) => {
                    reply.push_str(delta_content(&chunk));
                    if tx.send(Frame::Chunk(chunk)).await.is_err() {
                        client_gone = true;
                        break;
                    }
                },
                Err(e) => {
                    warn!(tenant = %recorder.tenant, error = %e, "upstream stream failed");
                    let body = ErrorBody::new(error_types::UPSTREAM, format!("{e:#}"));
                    if tx.send(Frame::Error(body)).await.is_err() {
                        client_gone = true;
                    }
                    break;
                },
            }
        }

        if client_gone {
            debug!(tenant = %recorder.tenant, "client disconnected mid-stream");
        } else {
            let _ = tx.send(Frame::Done).await;
        }
        drop(tx);

        let tokens = reply.chars().count() as u64;
        recorder.finish(reply, Some(tokens), true).await;
    });

    (rx, task)
}
