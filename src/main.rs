//! Authenticating, policy-enforcing, protocol-aware reverse proxy.
//!
//! Brokers client access to Postgres, Redis, HTTP, and raw TCP backends
//! through short-lived tunnels: a control-plane HTTP API issues and
//! tracks connection handles, a second listener accepts the raw tunnel
//! sockets and hands each one to the protocol interceptor that matches
//! its connection's kind.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::{Arg, Command};
use futures::FutureExt;
use tokio::task::JoinError;
use tracing::info;

use brokerd::approval::ApprovalCoordinator;
use brokerd::audit::AuditSink;
use brokerd::config::{self, ConfigHandle};
use brokerd::http_surface::{self, AppState};
use brokerd::identity::LocalValidator;
use brokerd::manager::{self, ConnectionManager};

/// Flattens `Result<Result<T>>` into `Result<T>`, for `try_join_all`
/// over a mix of `tokio::spawn` handles.
async fn flatten_err(
    f: impl std::future::Future<Output = Result<anyhow::Result<()>, JoinError>>,
) -> anyhow::Result<()> {
    f.map(|r| r.context("join error").and_then(|x| x)).await
}

fn cli() -> Command {
    Command::new("brokerd")
        .disable_help_flag(true)
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .help("path to the broker's YAML configuration file")
                .default_value("broker.yaml"),
        )
        .arg(
            Arg::new("control-addr")
                .long("control-addr")
                .help("override the control-plane listen address (default: 127.0.0.1:<server.port>)"),
        )
        .arg(
            Arg::new("tunnel-addr")
                .long("tunnel-addr")
                .help("override the tunnel listen address (default: 127.0.0.1:<server.port + 1>)"),
        )
        .arg(
            Arg::new("sweep-interval")
                .long("sweep-interval")
                .help("how often the connection manager sweeps for expired handles")
                .default_value("10s"),
        )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli().get_matches();

    let config_path = args.get_one::<String>("config").unwrap();
    let snapshot = config::load_from_path(config_path)
        .with_context(|| format!("loading configuration from {config_path}"))?;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(snapshot.raw.logging.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(atty::is(atty::Stream::Stdout))
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting brokerd");
    brokerd::metrics::init();

    let control_addr: SocketAddr = match args.get_one::<String>("control-addr") {
        Some(addr) => addr.parse().context("invalid --control-addr")?,
        None => format!("127.0.0.1:{}", snapshot.raw.server.port)
            .parse()
            .context("invalid server.port in config")?,
    };
    let tunnel_addr: SocketAddr = match args.get_one::<String>("tunnel-addr") {
        Some(addr) => addr.parse().context("invalid --tunnel-addr")?,
        None => format!("127.0.0.1:{}", snapshot.raw.server.port as u32 + 1)
            .parse()
            .context("invalid derived tunnel address")?,
    };
    let sweep_interval = humantime::parse_duration(
        args.get_one::<String>("sweep-interval").unwrap(),
    )
    .context("invalid --sweep-interval")?;

    let audit_memory_bytes = snapshot
        .raw
        .logging
        .audit_memory_mb
        .unwrap_or(16)
        .saturating_mul(1024 * 1024);
    let audit = Arc::new(
        AuditSink::open(&snapshot.raw.logging.audit_log_path, audit_memory_bytes)
            .context("opening audit log")?,
    );

    let validator = Arc::new(LocalValidator::new(
        snapshot.raw.auth.jwt_secret.clone().into_bytes(),
        snapshot.raw.auth.token_expiry.as_secs(),
        snapshot.raw.auth.users.clone(),
    ));

    let approval = Arc::new(
        ApprovalCoordinator::from_config(snapshot.raw.approval.as_ref())
            .context("building approval coordinator")?,
    );

    let manager = Arc::new(ConnectionManager::new(audit.clone()));
    let config_handle = ConfigHandle::new(snapshot);

    let state = Arc::new(AppState {
        config: config_handle,
        manager: manager.clone(),
        audit,
        approval,
        validator,
        tunnel_addr,
    });

    info!(%control_addr, %tunnel_addr, "listeners configured");

    let tasks = vec![
        tokio::spawn(http_surface::serve(control_addr, state.clone())),
        tokio::spawn(http_surface::serve_tunnel(tunnel_addr, state)),
        tokio::spawn(async move {
            manager::run_sweeper(manager, sweep_interval).await;
            Ok(())
        }),
    ];

    let tasks = tasks.into_iter().map(flatten_err);
    let _: Vec<()> = futures::future::try_join_all(tasks).await?;

    Ok(())
}
