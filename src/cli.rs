use clap::{Parser, Subcommand, ValueEnum};

use crate::models::Priority;

/// LetsPing: human-in-the-loop approvals for AI agents
#[derive(Parser)]
#[command(name = "letsping", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the local tunnel relay
    Dev {
        /// Port to bind (overrides LETSPING_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Submit an ask and wait for the decision
    Ask {
        #[command(flatten)]
        ask: AskArgs,
        /// Seconds to wait for a decision
        #[arg(long)]
        timeout: Option<u64>,
        /// Return as soon as the ask is accepted
        #[arg(long)]
        no_wait: bool,
    },

    /// Submit an ask without waiting; prints the request id
    Defer {
        #[command(flatten)]
        ask: AskArgs,
    },

    /// Fetch the current status of a request
    Status { request_id: String },
}

#[derive(clap::Args)]
pub struct AskArgs {
    /// Service the action belongs to (e.g. stripe, db-ops)
    #[arg(long)]
    pub service: String,
    #[arg(long)]
    pub action: String,
    /// JSON object describing the proposed action
    #[arg(long, default_value = "{}")]
    pub payload: String,
    #[arg(long, value_enum, default_value = "medium")]
    pub priority: PriorityArg,
    #[arg(long)]
    pub description: Option<String>,
    /// Caller-supplied id, for idempotent replays
    #[arg(long)]
    pub id: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum PriorityArg {
    Low,
    Medium,
    High,
    Critical,
}

impl From<PriorityArg> for Priority {
    fn from(p: PriorityArg) -> Self {
        match p {
            PriorityArg::Low => Priority::Low,
            PriorityArg::Medium => Priority::Medium,
            PriorityArg::High => Priority::High,
            PriorityArg::Critical => Priority::Critical,
        }
    }
}
