//! Hook event system.
//!
//! The proxy exposes two extension points to the surrounding application:
//! an auth check that runs before any request processing, and fire-and-forget
//! sinks for usage accounting and ingestion/memory notifications. Both are
//! expressed as [`HookHandler`]s registered in a [`HookRegistry`].

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use {
    anyhow::Result,
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    tracing::{debug, info, warn},
};

/// Points in the request lifecycle where handlers run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookEvent {
    /// A chat request arrived; runs before the body is parsed. May block.
    RequestReceived,
    /// Attachments were extracted and submitted to a tenant's document index.
    DocumentsIngested,
    /// New memories were persisted for a tenant.
    MemoriesWritten,
    /// A request finished and its token usage is known.
    UsageRecorded,
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl HookEvent {
    pub const ALL: &'static [HookEvent] = &[
        Self::RequestReceived,
        Self::DocumentsIngested,
        Self::MemoriesWritten,
        Self::UsageRecorded,
    ];

    /// Read-only events cannot affect the request, so their handlers run
    /// concurrently and their verdicts are ignored.
    pub fn is_read_only(&self) -> bool {
        !matches!(self, Self::RequestReceived)
    }
}

/// Data handed to handlers; the variant determines the event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum HookPayload {
    RequestReceived {
        tenant: String,
        method: String,
        path: String,
        /// Lower-cased header names mapped to their (UTF-8) values.
        headers: BTreeMap<String, String>,
    },
    DocumentsIngested {
        tenant: String,
        files: Vec<String>,
        documents: usize,
    },
    MemoriesWritten {
        tenant: String,
        count: usize,
    },
    UsageRecorded {
        tenant: String,
        model: String,
        /// Exact token count in buffered mode, delta character count when streamed.
        tokens: u64,
        seconds: f64,
        streamed: bool,
    },
}

impl HookPayload {
    pub fn event(&self) -> HookEvent {
        match self {
            Self::RequestReceived { .. } => HookEvent::RequestReceived,
            Self::DocumentsIngested { .. } => HookEvent::DocumentsIngested,
            Self::MemoriesWritten { .. } => HookEvent::MemoriesWritten,
            Self::UsageRecorded { .. } => HookEvent::UsageRecorded,
        }
    }

    pub fn tenant(&self) -> &str {
        match self {
            Self::RequestReceived { tenant, .. }
            | Self::DocumentsIngested { tenant, .. }
            | Self::MemoriesWritten { tenant, .. }
            | Self::UsageRecorded { tenant, .. } => tenant,
        }
    }
}


/// A handler's verdict.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub enum HookAction {
    #[default]
    Continue,
    /// Reject the request. Only honored for [`HookEvent::RequestReceived`].
    Block(String),
}

#[async_trait]
pub trait HookHandler: Send + Sync {
    fn name(&self) -> &str;

    fn events(&self) -> &[HookEvent];

    /// Handlers with a higher priority run earlier.
    fn priority(&self) -> i32 {
        0
    }

    async fn handle(&self, event: HookEvent, payload: &HookPayload) -> Result<HookAction>;
}

/// Point-in-time view of one handler's call history.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HandlerHealth {
    pub calls: u64,
    pub failures: u64,
    pub consecutive_failures: u64,
    pub avg_latency: Duration,
    /// Whether the circuit breaker currently keeps the handler from running.
    pub tripped: bool,
}

#[derive(Debug, Default)]
struct Health {
    calls: u64,
    failures: u64,
    streak: u64,
    latency: Duration,
    tripped_at: Option<Instant>,
}

#[derive(Debug, Clone, Copy)]
struct Breaker {
    threshold: u64,
    cooldown: Duration,
}

/// One registration. The health record is shared by every event the handler
/// subscribes to.
#[derive(Clone)]
struct Registered {
    handler: Arc<dyn HookHandler>,
    health: Arc<Mutex<Health>>,
}

impl Registered {
    fn name(&self) -> &str {
        self.handler.name()
    }

    fn health(&self) -> MutexGuard<'_, Health> {
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the breaker lets this handler run now. A tripped handler is
    /// given a fresh streak once the cooldown has passed.
    fn admitted(&self, breaker: Breaker) -> bool {
        let mut health = self.health();
        let tripped_at = health.tripped_at;
        match tripped_at {
            Some(at) if at.elapsed() < breaker.cooldown => false,
            Some(_) => {
                health.tripped_at = None;
                health.streak = 0;
                info!(handler = self.name(), "hook circuit breaker reset");
                true
            },
            None if health.streak >= breaker.threshold => {
                health.tripped_at = Some(Instant::now());
                warn!(handler = self.name(), failures = health.streak, "hook circuit breaker tripped");
                false
            },
            None => true,
        }
    }

    async fn call(&self, event: HookEvent, payload: &HookPayload) -> Result<HookAction> {
        let started = Instant::now();
        let result = self.handler.handle(event, payload).await;

        let mut health = self.health();
        health.calls += 1;
        health.latency += started.elapsed();
        if result.is_ok() {
            health.streak = 0;
        } else {
            health.failures += 1;
            health.streak += 1;
        }
        result
    }

    fn snapshot(&self) -> HandlerHealth {
        let health = self.health();
        let avg_latency = u32::try_from(health.calls)
            .ok()
            .filter(|calls| *calls > 0)
            .map_or(Duration::ZERO, |calls| health.latency / calls);
        HandlerHealth {
            calls: health.calls,
            failures: health.failures,
            consecutive_failures: health.streak,
            avg_latency,
            tripped: health.tripped_at.is_some(),
        }
    }
}

/// Handlers by event, in priority order.
pub struct HookRegistry {
    by_event: HashMap<HookEvent, Vec<Registered>>,
    breaker: Breaker,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self {
            by_event: HashMap::new(),
            breaker: Breaker {
                threshold: 3,
                cooldown: Duration::from_secs(60),
            },
        }
    }

    /// Stop calling a handler after `threshold` consecutive failures, for
    /// `cooldown`.
    #[must_use]
    pub fn with_circuit_breaker(mut self, threshold: u64, cooldown: Duration) -> Self {
        self.breaker = Breaker {
            threshold,
            cooldown,
        };
        self
    }

    pub fn register(&mut self, handler: Arc<dyn HookHandler>) {
        let registered = Registered {
            handler: Arc::clone(&handler),
            health: Arc::default(),
        };
        for event in handler.events() {
            let list = self.by_event.entry(*event).or_default();
            list.push(registered.clone());
            // Stable, so equal priorities keep registration order.
            list.sort_by_key(|r| std::cmp::Reverse(r.handler.priority()));
        }
        info!(handler = handler.name(), priority = handler.priority(), "hook handler registered");
    }

    pub fn has_handlers(&self, event: HookEvent) -> bool {
        self.by_event.get(&event).is_some_and(|list| !list.is_empty())
    }

    pub fn handler_health(&self, name: &str) -> Option<HandlerHealth> {
        self.by_event
            .values()
            .flatten()
            .find(|r| r.name() == name)
            .map(Registered::snapshot)
    }

    /// Sorted, deduplicated handler names.
    pub fn handler_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .by_event
            .values()
            .flatten()
            .map(|r| r.name().to_string())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Run every handler subscribed to the payload's event.
    ///
    /// Read-only events fan out concurrently and always yield
    /// [`HookAction::Continue`]; failures are logged. `RequestReceived` runs
    /// handlers one at a time and stops at the first block. There a handler
    /// that errors, or that the circuit breaker has tripped, also blocks, so a
    /// broken auth check never lets requests through.
    pub async fn dispatch(&self, payload: &HookPayload) -> HookAction {
        let event = payload.event();
        let Some(list) = self.by_event.get(&event).filter(|l| !l.is_empty()) else {
            return HookAction::Continue;
        };
        debug!(event = %event, tenant = payload.tenant(), handlers = list.len(), "dispatching hook");

        if event.is_read_only() {
            self.notify(event, payload, list).await;
            HookAction::Continue
        } else {
            self.gate(event, payload, list).await
        }
    }

    async fn notify(&self, event: HookEvent, payload: &HookPayload, list: &[Registered]) {
        let calls = list
            .iter()
            .filter(|r| r.admitted(self.breaker))
            .map(|r| async move { (r.name(), r.call(event, payload).await) });

        for (name, result) in futures::future::join_all(calls).await {
            if let Err(e) = result {
                warn!(handler = name, event = %event, error = %e, "hook handler failed");
            }
        }
    }

    async fn gate(&self, event: HookEvent, payload: &HookPayload, list: &[Registered]) -> HookAction {
        for registered in list {
            if !registered.admitted(self.breaker) {
                warn!(handler = registered.name(), event = %event, "hook handler unavailable, blocking");
                return HookAction::Block(format!("{} unavailable", registered.name()));
            }
            match registered.call(event, payload).await {
                Ok(HookAction::Continue) => {},
                Ok(HookAction::Block(reason)) => {
                    info!(handler = registered.name(), event = %event, reason = %reason, "request blocked by hook");
                    return HookAction::Block(reason);
                },
                Err(e) => {
                    warn!(handler = registered.name(), event = %event, error = %e, "hook handler failed, blocking");
                    return HookAction::Block(format!("{} failed", registered.name()));
                },
            }
        }
        HookAction::Continue
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}
