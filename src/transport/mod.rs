//! Decision transport adapters.
//!
//! A decision transport is a publish/subscribe channel scoped to one
//! project. Two event kinds travel over it: `local_request` (ask, relay →
//! dashboard) and `resolve_local_request` (decision, dashboard → relay).

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::errors::Result;
use crate::models::decision::ResolvePayload;
use crate::models::AskRequest;

pub mod memory;
pub mod realtime;

pub use memory::InMemoryBus;
pub use realtime::{RealtimeChannel, RealtimeConfig};

pub const LOCAL_REQUEST_EVENT: &str = "local_request";
pub const RESOLVE_LOCAL_REQUEST_EVENT: &str = "resolve_local_request";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "payload")]
pub enum ChannelEvent {
    #[serde(rename = "local_request")]
    LocalRequest(AskRequest),
    #[serde(rename = "resolve_local_request")]
    ResolveLocalRequest(ResolvePayload),
}

impl ChannelEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ChannelEvent::LocalRequest(_) => LOCAL_REQUEST_EVENT,
            ChannelEvent::ResolveLocalRequest(_) => RESOLVE_LOCAL_REQUEST_EVENT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[async_trait]
pub trait DecisionTransport: Send + Sync {
    /// Broadcasts `event` to every subscriber of the channel.
    async fn publish(&self, event: ChannelEvent) -> Result<()>;

    /// Stream of events received on the channel from now on.
    fn subscribe(&self) -> BoxStream<'static, ChannelEvent>;

    /// Live view of the subscription's connectivity.
    fn connection_state(&self) -> watch::Receiver<ConnectionState>;

    /// Tears down background connection tasks. Default: nothing to stop.
    async fn shutdown(&self) {}
}
