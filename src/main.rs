use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use automation_hub::channels::spawn_email_poller;
use automation_hub::config::HubConfig;
use automation_hub::context::HubContext;
use automation_hub::webhooks::webhook_routes;

/// Directory for an additional daily-rolling log file.
const LOG_DIR_ENV: &str = "AUTOMATION_LOG_DIR";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Keep the guard alive so buffered file logs are flushed on exit.
    let _log_guard = init_tracing(std::env::var_os(LOG_DIR_ENV).map(PathBuf::from));

    // Install rustls crypto provider before any TLS usage
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("rustls crypto provider was already installed");
    }

    info!(version = env!("CARGO_PKG_VERSION"), "Automation hub starting");

    let config = HubConfig::load().context("Failed to load configuration")?;
    let address = config.server.address.clone();
    let ctx = HubContext::from_config(config).context("Failed to initialize notifier")?;

    // ── Email ingestion ─────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let poller = match ctx
        .mailbox_connector()
        .context("Invalid email configuration")?
    {
        Some(connector) => {
            let registry = Arc::new(ctx.processor_registry());
            info!(
                host = %connector.host(),
                processors = registry.processors().len(),
                "Email processing enabled"
            );
            Some(spawn_email_poller(
                registry,
                Arc::new(connector),
                ctx.config.email.poll_interval(),
                shutdown_rx,
            ))
        }
        None => {
            info!("No email host configured, mailbox polling disabled");
            None
        }
    };

    // ── Webhook server ──────────────────────────────────────────────────
    let app = webhook_routes(&ctx.config.hook, Arc::clone(&ctx.notifier));
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind webhook server to {address}"))?;
    info!(address = %address, hooks = ctx.config.hook.len(), "Webhook server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Webhook server failed")?;

    // ── Shutdown ────────────────────────────────────────────────────────
    let _ = shutdown_tx.send(true);
    if let Some(handle) = poller
        && let Err(e) = handle.await
    {
        error!(error = %e, "Email poller task failed");
    }

    info!("Automation hub stopped");
    Ok(())
}

/// Stdout logging filtered by `RUST_LOG` (default `info`), plus an optional
/// non-blocking daily file.
fn init_tracing(log_dir: Option<PathBuf>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "automation-hub.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    guard
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutdown signal received");
}
