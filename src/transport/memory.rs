use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::BroadcastStream;

use super::{ChannelEvent, ConnectionState, DecisionTransport};
use crate::errors::{LetsPingError, Result};

/// In-process decision channel backed by a tokio broadcast. Used by tests
/// and by embedders that run the dashboard side in the same process.
pub struct InMemoryBus {
    tx: broadcast::Sender<ChannelEvent>,
    state: watch::Sender<ConnectionState>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        let (state, _) = watch::channel(ConnectionState::Connected);
        Self { tx, state }
    }

    /// Simulates loss or recovery of the subscription.
    pub fn set_connected(&self, connected: bool) {
        let next = if connected {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };
        self.state.send_replace(next);
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DecisionTransport for InMemoryBus {
    async fn publish(&self, event: ChannelEvent) -> Result<()> {
        if *self.state.borrow() != ConnectionState::Connected {
            return Err(LetsPingError::Transport("in-memory bus is disconnected".into()));
        }
        // No subscribers is not an error: the event is simply unobserved.
        let _ = self.tx.send(event);
        Ok(())
    }

    fn subscribe(&self) -> BoxStream<'static, ChannelEvent> {
        BroadcastStream::new(self.tx.subscribe())
            .filter_map(|item| async move {
                match item {
                    Ok(event) => Some(event),
                    Err(e) => {
                        tracing::warn!("decision bus subscriber lagged: {}", e);
                        None
                    }
                }
            })
            .boxed()
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }
}
