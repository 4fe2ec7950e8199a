//! `b2b-router`: consumes inbound B2B documents and starts their workflows.
//!
//! SIGHUP reloads configuration; SIGTERM or Ctrl-C shuts down gracefully.
//! Exits non-zero if startup fails.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use b2b_router_server::config::{LogFormat, ObservabilitySettings};
use b2b_router_server::{ConfigSource, DefaultComponents, FileConfigSource, LifecycleManager};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "b2b-router", version, about = "B2B inbound workflow router")]
struct Cli {
    /// Configuration file (TOML, YAML or JSON).
    #[arg(long, short, env = "B2B_ROUTER_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides `observability.log_format`.
    #[arg(long, env = "B2B_ROUTER_LOG_FORMAT", value_enum)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let source = FileConfigSource::new(cli.config.clone());
    let config = source.load().context("loading configuration")?;

    init_tracing(&config.observability, cli.log_format);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        service = %config.service_name,
        config = ?cli.config,
        "b2b-router starting"
    );

    if let Some(addr) = config.observability.metrics_listen_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("installing Prometheus exporter")?;
        info!(%addr, "metrics exporter listening");
    }

    // SIGHUP is handled from here on; a reload requested during startup
    // waits for `run`.
    let background = CancellationToken::new();
    let (reload_tx, reload_rx) = mpsc::channel(1);
    spawn_reload_listener(reload_tx, background.clone())?;

    let health_addr = config.observability.health_listen_addr;
    let mut manager = LifecycleManager::new(Arc::new(source), Arc::new(DefaultComponents::new()));
    let status = manager.status();
    manager.start_with(config).await.context("starting router")?;

    let health = match health_addr {
        Some(addr) => Some(
            b2b_router_server::lifecycle::serve_health(addr, status, background.clone())
                .await
                .with_context(|| format!("binding health server on {addr}"))?,
        ),
        None => None,
    };

    let result = manager.run(reload_rx, shutdown_signal()).await;
    background.cancel();
    if let Some(health) = health {
        if let Err(e) = health.await {
            warn!(error = %e, "health server task failed");
        }
    }

    let report = result.context("router stopped abnormally")?;
    info!(?report, "b2b-router exited");
    Ok(())
}

fn init_tracing(settings: &ObservabilitySettings, format_override: Option<LogFormat>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.log_filter));
    let registry = tracing_subscriber::registry().with(filter);
    match format_override.unwrap_or(settings.log_format) {
        LogFormat::Json => registry.with(fmt::layer().json().with_target(true)).init(),
        LogFormat::Plain => registry.with(fmt::layer().with_target(false)).init(),
    }
}

/// Forwards SIGHUP to the lifecycle; a reload already queued absorbs
/// further signals.
#[cfg(unix)]
fn spawn_reload_listener(reload_tx: mpsc::Sender<()>, cancel: CancellationToken) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                    info!("SIGHUP received");
                    if reload_tx.try_send(()).is_err() {
                        warn!("reload already pending, signal coalesced");
                    }
                }
            }
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn spawn_reload_listener(_reload_tx: mpsc::Sender<()>, _cancel: CancellationToken) -> anyhow::Result<()> {
    warn!("configuration reload by signal is not supported on this platform");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Ctrl-C received"),
        () = terminate => info!("SIGTERM received"),
    }
}
