use std::time::Duration;

use serde::Deserialize;

use crate::client::DEFAULT_BASE_URL;
use crate::errors::{LetsPingError, Result};

pub const DEFAULT_PORT: u16 = 3005;
pub const DEFAULT_DASHBOARD_URL: &str = "https://letsping.co";
pub const DEFAULT_REALTIME_URL: &str = "https://tqphlqmmamdjoufqnnka.supabase.co";
pub const DEFAULT_HOLD_TIMEOUT_SECS: u64 = 3600;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Bearer key for the hosted API. Required by every client command.
    pub api_key: Option<String>,
    pub base_url: String,
    /// Project whose decision channel the relay joins. Required by `dev`.
    pub project_id: Option<String>,
    pub port: u16,
    pub dashboard_url: String,
    pub realtime_url: String,
    /// Falls back to `api_key` when unset.
    pub realtime_key: Option<String>,
    /// Upper bound on how long the relay holds one ingest connection.
    pub hold_timeout_secs: u64,
}

impl Config {
    pub fn require_api_key(&self) -> Result<&str> {
        self.api_key.as_deref().ok_or_else(|| {
            LetsPingError::Configuration(
                "LETSPING_API_KEY is not set. Get a key from the dashboard and export it".into(),
            )
        })
    }

    pub fn require_project_id(&self) -> Result<&str> {
        self.project_id.as_deref().ok_or_else(|| {
            LetsPingError::Configuration(
                "LETSPING_PROJECT_ID is not set. The tunnel needs a project to join".into(),
            )
        })
    }

    pub fn realtime_key(&self) -> Result<&str> {
        match self.realtime_key.as_deref() {
            Some(key) => Ok(key),
            None => self.require_api_key(),
        }
    }

    pub fn hold_timeout(&self) -> Duration {
        Duration::from_secs(self.hold_timeout_secs)
    }
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();
    Ok(load_from(|key| std::env::var(key).ok()))
}

/// Builds a config from an arbitrary variable lookup. Blank values count as
/// unset.
pub fn load_from<F>(lookup: F) -> Config
where
    F: Fn(&str) -> Option<String>,
{
    let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    Config {
        api_key: var("LETSPING_API_KEY"),
        base_url: var("LETSPING_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.into()),
        project_id: var("LETSPING_PROJECT_ID"),
        port: var("LETSPING_PORT")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PORT),
        dashboard_url: var("LETSPING_DASHBOARD_URL")
            .unwrap_or_else(|| DEFAULT_DASHBOARD_URL.into()),
        realtime_url: var("LETSPING_REALTIME_URL").unwrap_or_else(|| DEFAULT_REALTIME_URL.into()),
        realtime_key: var("LETSPING_REALTIME_KEY"),
        hold_timeout_secs: var("LETSPING_HOLD_TIMEOUT_SECS")
            .and_then(|v| v.parse().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_HOLD_TIMEOUT_SECS),
    }
}
