//! The ask/resolve contract shared by both deployment shapes.
//!
//! [`crate::client::LetsPing`] implements it by polling the hosted API;
//! [`crate::relay::Relay`] implements it by parking the caller until a push
//! event resolves the ask.

use async_trait::async_trait;

use crate::errors::Result;
use crate::models::{AskRequest, Decision};

#[async_trait]
pub trait DecisionChannel: Send + Sync {
    /// Publishes the ask to the decision channel and returns its id.
    async fn submit(&self, ask: &AskRequest) -> Result<String>;

    /// Current status of `request_id`; PENDING while undecided.
    async fn fetch_status(&self, request_id: &str) -> Result<Decision>;

    /// Submits the ask and waits for exactly one terminal decision. The
    /// returned payload is the reviewer's patch if any, else the original.
    async fn ask(&self, ask: AskRequest) -> Result<Decision>;
}
