use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use letsping::cli::{self, AskArgs};
use letsping::config::{self, Config};
use letsping::relay::{Relay, RelayConfig};
use letsping::transport::{RealtimeChannel, RealtimeConfig};
use letsping::{telemetry, AskRequest, DecisionChannel, LetsPing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init()?;

    let cfg = config::load()?;
    let args = cli::Cli::parse();

    let result = match args.command {
        Some(cli::Commands::Dev { port }) => {
            let port = port.unwrap_or(cfg.port);
            run_dev_tunnel(cfg, port).await
        }
        Some(cli::Commands::Ask { ask, timeout, no_wait }) => {
            handle_ask(&cfg, ask, timeout, no_wait).await
        }
        Some(cli::Commands::Defer { ask }) => handle_defer(&cfg, ask).await,
        Some(cli::Commands::Status { request_id }) => handle_status(&cfg, &request_id).await,
        None => {
            let port = cfg.port;
            run_dev_tunnel(cfg, port).await
        }
    };

    telemetry::shutdown();

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

async fn run_dev_tunnel(cfg: Config, port: u16) -> anyhow::Result<()> {
    let project_id = cfg.require_project_id()?.to_string();
    let realtime_key = cfg.realtime_key()?.to_string();

    tracing::info!("Connecting to decision channel...");
    let channel = RealtimeChannel::new(RealtimeConfig::new(
        cfg.realtime_url.clone(),
        realtime_key,
        project_id.clone(),
    ));
    channel.start().context("failed to start realtime channel")?;

    let relay = Relay::new(
        RelayConfig::new(project_id).with_max_hold(cfg.hold_timeout()),
        channel,
    );
    relay.start();

    let app = letsping::api::gateway_router(relay.clone());

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    println!();
    println!("  LetsPing tunnel active");
    println!("  ➜ Ingest:    http://{}/ingest", addr);
    println!("  ➜ Dashboard: {}", cfg.dashboard_url);
    println!();
    tracing::info!("LetsPing relay listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    relay.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down tunnel");
}

fn build_ask(args: AskArgs) -> anyhow::Result<AskRequest> {
    let payload: serde_json::Value =
        serde_json::from_str(&args.payload).context("--payload must be valid JSON")?;
    let mut ask = AskRequest::new(args.service, args.action, payload).with_priority(args.priority.into());
    if let Some(description) = args.description {
        ask = ask.with_description(description);
    }
    if let Some(id) = args.id {
        ask = ask.with_id(id);
    }
    Ok(ask)
}

async fn handle_ask(
    cfg: &Config,
    args: AskArgs,
    timeout: Option<u64>,
    no_wait: bool,
) -> anyhow::Result<()> {
    let client = LetsPing::from_config(cfg)?;
    let mut ask = build_ask(args)?;
    if let Some(secs) = timeout {
        ask = ask.with_timeout(Duration::from_secs(secs));
    }

    let decision = if no_wait {
        client.ask_nonblocking(&ask).await?
    } else {
        println!("⏳ Waiting for a human decision...");
        client.ask(ask).await?
    };
    println!("{}", serde_json::to_string_pretty(&decision)?);
    Ok(())
}

async fn handle_defer(cfg: &Config, args: AskArgs) -> anyhow::Result<()> {
    let client = LetsPing::from_config(cfg)?;
    let id = client.defer(&build_ask(args)?).await?;
    println!("{}", id);
    Ok(())
}

async fn handle_status(cfg: &Config, request_id: &str) -> anyhow::Result<()> {
    let client = LetsPing::from_config(cfg)?;
    let decision = client.get_status(request_id).await?;
    println!("{}", serde_json::to_string_pretty(&decision)?);
    Ok(())
}
