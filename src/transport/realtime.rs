//! Realtime broadcast channel over WebSocket.
//!
//! Speaks the Phoenix channel protocol used by hosted realtime services:
//!   1. Connect to `<realtime_url>/realtime/v1/websocket?apikey=..&vsn=1.0.0`
//!   2. `phx_join` the project topic (`realtime:project:<id>`)
//!   3. Send `broadcast` frames for outgoing events, heartbeat every 30s
//!   4. Forward incoming `broadcast` frames to subscribers
//!
//! On any connection loss the state flips to `Disconnected` and the channel
//! resubscribes with capped exponential backoff until shut down. A socket
//! that stops answering heartbeats counts as lost.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use futures::SinkExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep};
use tokio_stream::wrappers::BroadcastStream;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use super::{ChannelEvent, ConnectionState, DecisionTransport};
use crate::errors::{LetsPingError, Result};

const PHOENIX_TOPIC: &str = "phoenix";

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Base URL of the realtime service (http(s) or ws(s)).
    pub url: String,
    pub api_key: String,
    /// Project scoping the channel.
    pub project_id: String,
    pub heartbeat_interval_secs: u64,
    /// Unanswered heartbeats after which the connection is dropped.
    pub max_missed_heartbeats: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
}

impl RealtimeConfig {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            project_id: project_id.into(),
            heartbeat_interval_secs: 30,
            max_missed_heartbeats: 2,
            reconnect_base_delay_ms: 1000,
            reconnect_max_delay_ms: 30_000,
        }
    }

    pub fn topic(&self) -> String {
        format!("realtime:project:{}", self.project_id)
    }

    /// WebSocket endpoint derived from `url`.
    pub fn websocket_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.url)
            .map_err(|e| LetsPingError::Configuration(format!("invalid realtime URL '{}': {}", self.url, e)))?;
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            "http" | "ws" => "ws",
            other => {
                return Err(LetsPingError::Configuration(format!(
                    "unsupported realtime URL scheme '{}'",
                    other
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| LetsPingError::Configuration("cannot set websocket scheme".into()))?;
        if !url.path().ends_with("/websocket") {
            let path = format!("{}/realtime/v1/websocket", url.path().trim_end_matches('/'));
            url.set_path(&path);
        }
        url.query_pairs_mut()
            .append_pair("apikey", &self.api_key)
            .append_pair("vsn", "1.0.0");
        Ok(url)
    }

    fn reconnect_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self
            .reconnect_base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.reconnect_max_delay_ms);
        Duration::from_millis(delay)
    }
}

/// One Phoenix channel frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhoenixMessage {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub msg_ref: Option<String>,
}

impl PhoenixMessage {
    fn join(topic: &str, msg_ref: String) -> Self {
        Self {
            topic: topic.to_string(),
            event: "phx_join".into(),
            payload: json!({ "config": { "broadcast": { "self": false, "ack": false } } }),
            msg_ref: Some(msg_ref),
        }
    }

    fn heartbeat(msg_ref: String) -> Self {
        Self {
            topic: PHOENIX_TOPIC.into(),
            event: "heartbeat".into(),
            payload: json!({}),
            msg_ref: Some(msg_ref),
        }
    }

    /// Wraps a channel event in a `broadcast` frame.
    pub fn broadcast(topic: &str, event: &ChannelEvent, msg_ref: String) -> Result<Self> {
        let payload = match serde_json::to_value(event)? {
            Value::Object(mut obj) => obj.remove("payload").unwrap_or(Value::Null),
            _ => Value::Null,
        };
        Ok(Self {
            topic: topic.to_string(),
            event: "broadcast".into(),
            payload: json!({ "type": "broadcast", "event": event.name(), "payload": payload }),
            msg_ref: Some(msg_ref),
        })
    }

    /// Extracts the channel event from an incoming `broadcast` frame.
    /// Unknown event names yield `None`.
    pub fn into_channel_event(self) -> Option<ChannelEvent> {
        if self.event != "broadcast" {
            return None;
        }
        let name = self.payload.get("event")?.clone();
        let inner = self.payload.get("payload").cloned().unwrap_or(Value::Null);
        match serde_json::from_value(json!({ "event": name, "payload": inner })) {
            Ok(event) => Some(event),
            Err(e) => {
                debug!("ignoring broadcast {}: {}", name, e);
                None
            }
        }
    }

    fn is_ok_reply_to(&self, msg_ref: &str) -> bool {
        self.event == "phx_reply"
            && self.msg_ref.as_deref() == Some(msg_ref)
            && self.payload.get("status").and_then(Value::as_str) == Some("ok")
    }
}

/// Heartbeats sent and acknowledged on one connection. Refs are `hb<n>`.
#[derive(Debug, Default)]
struct HeartbeatTracker {
    sent: AtomicU64,
    acked: AtomicU64,
}

impl HeartbeatTracker {
    /// Counts a new heartbeat and returns its ref.
    fn beat(&self) -> String {
        let n = self.sent.fetch_add(1, Ordering::SeqCst) + 1;
        format!("hb{}", n)
    }

    /// Consumes a `phx_reply` to one of our heartbeats. Returns false for
    /// any other frame.
    fn observe(&self, msg: &PhoenixMessage) -> bool {
        if msg.topic != PHOENIX_TOPIC || msg.event != "phx_reply" {
            return false;
        }
        let Some(n) = msg
            .msg_ref
            .as_deref()
            .and_then(|r| r.strip_prefix("hb"))
            .and_then(|n| n.parse::<u64>().ok())
        else {
            return false;
        };
        self.acked.fetch_max(n, Ordering::SeqCst);
        true
    }

    fn outstanding(&self) -> u64 {
        self.sent
            .load(Ordering::SeqCst)
            .saturating_sub(self.acked.load(Ordering::SeqCst))
    }
}

/// Realtime decision channel with automatic resubscription.
pub struct RealtimeChannel {
    config: RealtimeConfig,
    topic: String,
    events: broadcast::Sender<ChannelEvent>,
    state: watch::Sender<ConnectionState>,
    outbound: Mutex<Option<mpsc::Sender<Message>>>,
    next_ref: AtomicU64,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeChannel {
    pub fn new(config: RealtimeConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            topic: config.topic(),
            config,
            events,
            state,
            outbound: Mutex::new(None),
            next_ref: AtomicU64::new(1),
            task: std::sync::Mutex::new(None),
        })
    }

    /// Spawns the connect/resubscribe loop. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let url = self.config.websocket_url()?;
        let mut guard = self
            .task
            .lock()
            .map_err(|_| LetsPingError::Transport("realtime task lock poisoned".into()))?;
        if guard.is_some() {
            return Ok(());
        }
        let this = Arc::clone(self);
        *guard = Some(tokio::spawn(async move { this.run(url).await }));
        Ok(())
    }

    fn make_ref(&self) -> String {
        self.next_ref.fetch_add(1, Ordering::Relaxed).to_string()
    }

    async fn run(self: Arc<Self>, url: Url) {
        let mut attempt: u32 = 0;
        loop {
            self.state.send_replace(ConnectionState::Connecting);
            info!(topic = %self.topic, "connecting to realtime channel");

            match self.connect_once(&url).await {
                Ok(true) => attempt = 0,
                Ok(false) => {}
                Err(e) => warn!(topic = %self.topic, "realtime connection failed: {}", e),
            }

            *self.outbound.lock().await = None;
            self.state.send_replace(ConnectionState::Disconnected);
            warn!(topic = %self.topic, "disconnected from realtime channel");

            attempt = attempt.saturating_add(1);
            let delay = self.config.reconnect_delay(attempt);
            info!(attempt, delay_ms = delay.as_millis() as u64, "scheduling resubscribe");
            sleep(delay).await;
        }
    }

    /// Runs one connection until it drops. Returns whether the join succeeded.
    async fn connect_once(&self, url: &Url) -> Result<bool> {
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| LetsPingError::Transport(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let (msg_tx, mut msg_rx) = mpsc::channel::<Message>(100);
        let writer = tokio::spawn(async move {
            while let Some(msg) = msg_rx.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let join_ref = self.make_ref();
        let join = serde_json::to_string(&PhoenixMessage::join(&self.topic, join_ref.clone()))?;
        if msg_tx.send(Message::Text(join)).await.is_err() {
            writer.abort();
            return Err(LetsPingError::Transport("websocket writer closed".into()));
        }

        let tracker = Arc::new(HeartbeatTracker::default());
        let (stale_tx, mut stale_rx) = oneshot::channel::<u64>();
        let heartbeat_tx = msg_tx.clone();
        let heartbeat_secs = self.config.heartbeat_interval_secs.max(1);
        let max_missed = self.config.max_missed_heartbeats.max(1);
        let beats = Arc::clone(&tracker);
        let heartbeat = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(heartbeat_secs));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let missed = beats.outstanding();
                if missed >= max_missed {
                    let _ = stale_tx.send(missed);
                    break;
                }
                let Ok(json) = serde_json::to_string(&PhoenixMessage::heartbeat(beats.beat())) else {
                    break;
                };
                if heartbeat_tx.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        });

        let mut joined = false;
        loop {
            let frame = tokio::select! {
                frame = read.next() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
                missed = &mut stale_rx => {
                    if let Ok(missed) = missed {
                        warn!(topic = %self.topic, missed, "heartbeats unanswered, dropping connection");
                    }
                    break;
                }
            };
            match frame {
                Ok(Message::Text(text)) => {
                    let msg: PhoenixMessage = match serde_json::from_str(&text) {
                        Ok(m) => m,
                        Err(e) => {
                            warn!("unparseable realtime frame: {}", e);
                            continue;
                        }
                    };
                    if tracker.observe(&msg) {
                        continue;
                    }
                    if !joined && msg.is_ok_reply_to(&join_ref) {
                        joined = true;
                        *self.outbound.lock().await = Some(msg_tx.clone());
                        self.state.send_replace(ConnectionState::Connected);
                        info!(topic = %self.topic, "subscribed to realtime channel");
                        continue;
                    }
                    match msg.event.as_str() {
                        "phx_error" | "phx_close" if msg.topic == self.topic => {
                            warn!(topic = %self.topic, event = %msg.event, "channel closed by server");
                            break;
                        }
                        "broadcast" => {
                            if let Some(event) = msg.into_channel_event() {
                                let _ = self.events.send(event);
                            }
                        }
                        _ => {}
                    }
                }
                Ok(Message::Ping(data)) => {
                    let _ = msg_tx.send(Message::Pong(data)).await;
                }
                Ok(Message::Close(_)) => {
                    info!("realtime connection closed");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    error!("websocket error: {}", e);
                    break;
                }
            }
        }

        heartbeat.abort();
        writer.abort();
        Ok(joined)
    }
}

#[async_trait]
impl DecisionTransport for RealtimeChannel {
    async fn publish(&self, event: ChannelEvent) -> Result<()> {
        let frame = PhoenixMessage::broadcast(&self.topic, &event, self.make_ref())?;
        let json = serde_json::to_string(&frame)?;
        let outbound = self.outbound.lock().await;
        let sender = outbound
            .as_ref()
            .ok_or_else(|| LetsPingError::Transport("not subscribed to realtime channel".into()))?;
        sender
            .send(Message::Text(json))
            .await
            .map_err(|e| LetsPingError::Transport(e.to_string()))
    }

    fn subscribe(&self) -> BoxStream<'static, ChannelEvent> {
        BroadcastStream::new(self.events.subscribe())
            .filter_map(|item| async move { item.ok() })
            .boxed()
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    async fn shutdown(&self) {
        let handle = self.task.lock().ok().and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            handle.abort();
        }
        *self.outbound.lock().await = None;
        self.state.send_replace(ConnectionState::Disconnected);
    }
}
