//! Local tunnel relay.
//!
//! Accepts asks from local callers, republishes them on the project's
//! decision channel and parks each caller until a matching
//! `resolve_local_request` event arrives, the hold timeout passes, or the
//! caller goes away. Asks published through `submit` are tracked instead,
//! so their status can be polled.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::errors::{LetsPingError, Result};
use crate::models::ask::LOCAL_REQUEST_ID_PREFIX;
use crate::models::{AskRequest, Decision, Status};
use crate::protocol::DecisionChannel;
use crate::transport::{ChannelEvent, ConnectionState, DecisionTransport};

pub mod pending;
pub mod submitted;

pub use pending::{PendingGuard, PendingOutcome, PendingTable};
pub use submitted::SubmittedTable;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub project_id: String,
    /// Upper bound on how long one ask may hold its caller.
    pub max_hold: Duration,
    /// How often the janitor sweeps entries that outlived `max_hold`.
    pub sweep_interval: Duration,
}

impl RelayConfig {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            max_hold: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
        }
    }

    pub fn with_max_hold(mut self, max_hold: Duration) -> Self {
        self.max_hold = max_hold;
        self
    }

    /// Hold duration for one ask: its declared timeout, capped by `max_hold`.
    pub fn hold_for(&self, ask: &AskRequest) -> Duration {
        ask.timeout_duration()
            .map(|t| t.min(self.max_hold))
            .unwrap_or(self.max_hold)
    }
}

/// A caller parked on the pending table, waiting for its decision.
pub struct ParkedAsk {
    pub request_id: String,
    payload: Option<Value>,
    hold: Duration,
    rx: oneshot::Receiver<PendingOutcome>,
    _guard: PendingGuard,
}

impl ParkedAsk {
    pub fn hold(&self) -> Duration {
        self.hold
    }

    /// Payload as originally submitted.
    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }

    /// Waits for the decision. The entry is released on every exit path.
    pub async fn wait(self) -> Result<Decision> {
        let id = self.request_id.clone();
        match tokio::time::timeout(self.hold, self.rx).await {
            Ok(Ok(PendingOutcome::Resolved(decision))) => Ok(decision),
            Ok(Ok(PendingOutcome::Superseded)) => Err(LetsPingError::Superseded { id }),
            Ok(Ok(PendingOutcome::Expired)) | Err(_) => {
                warn!(request_id = %id, "hold timeout elapsed without a decision");
                Err(LetsPingError::Timeout { id })
            }
            Ok(Err(_)) => Err(LetsPingError::Transport("relay shut down".into())),
        }
    }
}

/// One relay instance: pending table, decision transport and the
/// background tasks that connect them.
pub struct Relay {
    config: RelayConfig,
    pending: Arc<PendingTable>,
    submitted: Arc<SubmittedTable>,
    transport: Arc<dyn DecisionTransport>,
    connection: watch::Receiver<ConnectionState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Relay {
    pub fn new(config: RelayConfig, transport: Arc<dyn DecisionTransport>) -> Arc<Self> {
        let connection = transport.connection_state();
        Arc::new(Self {
            config,
            pending: Arc::new(PendingTable::new()),
            submitted: Arc::new(SubmittedTable::new()),
            transport,
            connection,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Subscribes to the decision channel and spawns the listener, the
    /// connectivity logger and the stale-entry janitor. The tasks hold the
    /// tables, never the relay, and are aborted when the relay is dropped.
    pub fn start(&self) {
        let mut events = self.transport.subscribe();
        let listener = {
            let pending = Arc::clone(&self.pending);
            let submitted = Arc::clone(&self.submitted);
            tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    dispatch_event(&pending, &submitted, event);
                }
                debug!("decision channel stream ended");
            })
        };

        let watcher = {
            let mut state = self.transport.connection_state();
            tokio::spawn(async move {
                while state.changed().await.is_ok() {
                    let current = *state.borrow();
                    match current {
                        ConnectionState::Connected => info!("✓ connected to decision channel"),
                        ConnectionState::Disconnected => warn!("⚠ disconnected from decision channel"),
                        ConnectionState::Connecting => debug!("connecting to decision channel"),
                    }
                }
            })
        };

        let janitor = {
            let pending = Arc::clone(&self.pending);
            let submitted = Arc::clone(&self.submitted);
            let max_hold = self.config.max_hold;
            let every = self.config.sweep_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(every);
                loop {
                    ticker.tick().await;
                    let evicted = pending.evict_older_than(max_hold);
                    if evicted > 0 {
                        info!(evicted, "evicted stale pending requests");
                    }
                    let forgotten = submitted.evict_older_than(max_hold);
                    if forgotten > 0 {
                        debug!(forgotten, "forgot aged submitted asks");
                    }
                }
            })
        };

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.extend([listener, watcher, janitor]);
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    pub fn submitted(&self) -> &SubmittedTable {
        &self.submitted
    }

    /// Whether the decision-channel subscription is currently live.
    pub fn is_connected(&self) -> bool {
        *self.connection.borrow() == ConnectionState::Connected
    }

    /// Validates the ask, settles its id and stamps the relay context
    /// (`project_id`, `status`, `created_at`, `isLocal`).
    pub fn prepare(&self, mut ask: AskRequest) -> Result<(String, AskRequest)> {
        ask.validate()?;
        ask.check_schema();
        let id = ask.ensure_id(LOCAL_REQUEST_ID_PREFIX);
        ask.created_at = Some(Utc::now());
        ask.extra.insert("project_id".into(), Value::String(self.config.project_id.clone()));
        ask.extra.insert("status".into(), Value::String(Status::Pending.to_string()));
        ask.extra.insert("isLocal".into(), Value::Bool(true));
        Ok((id, ask))
    }

    /// Registers the caller, then publishes the ask. If publishing fails
    /// the registration is released before the error is returned.
    pub async fn park(&self, ask: AskRequest) -> Result<ParkedAsk> {
        let (id, ask) = self.prepare(ask)?;
        let hold = self.config.hold_for(&ask);
        let payload = ask.payload.clone();

        let (tx, rx) = oneshot::channel();
        let registration = self.pending.register(&id, tx);
        let guard = PendingGuard::new(Arc::clone(&self.pending), registration);

        info!(request_id = %id, service = %ask.service_name(), "⚡ intercepted ask");
        self.transport.publish(ChannelEvent::LocalRequest(ask)).await?;

        Ok(ParkedAsk {
            request_id: id,
            payload,
            hold,
            rx,
            _guard: guard,
        })
    }

    pub fn handle_event(&self, event: ChannelEvent) {
        dispatch_event(&self.pending, &self.submitted, event);
    }

    /// Completes the waiter for `request_id`, or records the decision for a
    /// submitted ask. Returns false when the id is unknown to both.
    pub fn resolve(&self, request_id: &str, decision: Decision) -> bool {
        resolve_in(&self.pending, &self.submitted, request_id, decision)
    }

    /// Stops background tasks, fails outstanding waiters and closes the
    /// transport.
    pub async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            task.abort();
        }
        let outstanding = self.pending.len();
        self.pending.clear();
        self.submitted.clear();
        self.transport.shutdown().await;
        info!(outstanding, "relay shut down");
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        if let Ok(tasks) = self.tasks.get_mut() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

fn dispatch_event(pending: &PendingTable, submitted: &SubmittedTable, event: ChannelEvent) {
    match event {
        ChannelEvent::ResolveLocalRequest(payload) => {
            let decision = payload.into_decision();
            let id = decision.request_id.clone();
            let status = decision.status;
            if resolve_in(pending, submitted, &id, decision) {
                info!(request_id = %id, status = %status, "➤ resolving");
            }
        }
        ChannelEvent::LocalRequest(ask) => {
            debug!(request_id = ?ask.id, "ignoring echoed local_request");
        }
    }
}

fn resolve_in(
    pending: &PendingTable,
    submitted: &SubmittedTable,
    request_id: &str,
    decision: Decision,
) -> bool {
    let recorded = submitted.record(request_id, decision.clone());
    let woke = pending.resolve(request_id, decision);
    recorded || woke
}

#[async_trait]
impl DecisionChannel for Relay {
    async fn submit(&self, ask: &AskRequest) -> Result<String> {
        let (id, ask) = self.prepare(ask.clone())?;
        self.submitted.track(&id);
        if let Err(e) = self.transport.publish(ChannelEvent::LocalRequest(ask)).await {
            self.submitted.forget(&id);
            return Err(e);
        }
        info!(request_id = %id, "⚡ submitted ask");
        Ok(id)
    }

    async fn fetch_status(&self, request_id: &str) -> Result<Decision> {
        if self.pending.contains(request_id) {
            return Ok(Decision::pending(request_id));
        }
        self.submitted
            .get(request_id)
            .ok_or_else(|| LetsPingError::NotFound {
                id: request_id.to_string(),
            })
    }

    async fn ask(&self, ask: AskRequest) -> Result<Decision> {
        let parked = self.park(ask).await?;
        let original = parked.payload().cloned();
        let decision = parked.wait().await?;
        Ok(decision.with_original_payload(original.as_ref()))
    }
}
