//! LetsPing: human-in-the-loop approvals for AI agents.
//!
//! Two ways to get a decision on an ask:
//! - [`client::LetsPing`] submits to the hosted API and polls with backoff.
//! - [`relay::Relay`] parks a local caller on a pending table until a
//!   decision is pushed over the project's decision channel.
//!
//! Both implement [`protocol::DecisionChannel`].

pub mod api;
pub mod cli;
pub mod client;
pub mod config;
pub mod errors;
pub mod models;
pub mod poller;
pub mod protocol;
pub mod relay;
pub mod telemetry;
pub mod transport;

pub use client::{ApiFlavor, ApprovalTool, ClientOptions, LetsPing};
pub use errors::{LetsPingError, Result};
pub use models::{AskRequest, Decision, Priority, Status};
pub use protocol::DecisionChannel;
pub use relay::{Relay, RelayConfig};
