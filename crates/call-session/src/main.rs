//! Call Session loopback harness
//!
//! Runs one meeting in a single process: the configured local participant
//! plus `CALL_SIMULATED_PEERS` simulated participants, all connected through
//! an in-process [`LocalHub`] standing in for presence, signaling, the peer
//! transport and capture devices.
//!
//! # Startup Flow
//!
//! 1. Initialize tracing
//! 2. Load configuration from environment
//! 3. Optionally install the Prometheus recorder and serve `/metrics`
//! 4. Start the local session, then the simulated sessions
//! 5. Log view changes of the local session
//! 6. Wait for shutdown signal, then leave every session

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)]

use std::collections::HashMap;
use std::net::SocketAddr;

use anyhow::Context;
use axum::Router;
use call_session::config::Config;
use call_session::local::LocalHub;
use call_session::observability::init_metrics_recorder;
use call_session::session::{CallSession, CallSessionHandle, SessionArgs};
use common::config::ObservabilityConfig;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let vars: HashMap<String, String> = std::env::vars().collect();
    init_tracing(&ObservabilityConfig::from_vars(&vars));

    info!("Starting call session harness");

    let config = Config::from_vars(&vars).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        meeting_id = %config.meeting_id,
        environment = ?config.environment,
        signaling_url = %config.transport.signaling_url(),
        heartbeat_interval_seconds = config.heartbeat_interval_seconds,
        backoff_floor_ms = config.backoff_floor_ms,
        backoff_ceiling_ms = config.backoff_ceiling_ms,
        simulated_peers = config.simulated_peers,
        "Configuration loaded successfully"
    );

    let root_token = CancellationToken::new();

    if let Some(bind_address) = &config.metrics_bind_address {
        serve_metrics(bind_address, root_token.child_token()).await?;
    }

    let hub = LocalHub::new();
    let settings = config.session_settings();
    let mut sessions: Vec<CallSessionHandle> = Vec::new();

    let (local, _local_task) = CallSession::start(
        config.session_args(),
        settings.clone(),
        hub.collaborators(),
        root_token.child_token(),
    )
    .await
    .context("Failed to start local call session")?;
    spawn_view_logger(&local);
    sessions.push(local);

    for index in 1..=config.simulated_peers {
        let args = SessionArgs {
            meeting_id: config.meeting_id.clone(),
            account_key: format!("sim-{index}@loopback.local"),
            display_name: format!("Simulated {index}"),
            avatar_url: String::new(),
        };
        match CallSession::start(
            args,
            settings.clone(),
            hub.collaborators(),
            root_token.child_token(),
        )
        .await
        {
            Ok((handle, _task)) => sessions.push(handle),
            Err(e) => warn!(index, error = %e, "Failed to start simulated participant"),
        }
    }

    info!(
        sessions = sessions.len(),
        "Call session harness running - press Ctrl+C to shutdown"
    );
    shutdown_signal().await;

    info!("Shutdown signal received, leaving call...");
    for session in &sessions {
        match session.leave().await {
            Ok(report) if report.is_clean() => {}
            Ok(report) => {
                warn!(failed_steps = ?report.failed_steps, "Leave completed with failures");
            }
            Err(e) => warn!(error = %e, "Leave failed"),
        }
    }
    root_token.cancel();

    info!("Call session harness shutdown complete");
    Ok(())
}

fn init_tracing(observability: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| observability.log_filter.as_str().into());
    let registry = tracing_subscriber::registry().with(filter);
    if observability.json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Installs the Prometheus recorder and serves `/metrics` until `shutdown`.
async fn serve_metrics(bind_address: &str, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr: SocketAddr = bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %bind_address, "Invalid metrics bind address");
        anyhow::anyhow!("Invalid metrics bind address: {e}")
    })?;

    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        anyhow::anyhow!(e)
    })?;

    let app = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );

    // Bind before spawning to fail fast on bind errors
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind metrics server to {addr}"))?;

    tokio::spawn(async move {
        info!(addr = %addr, "Metrics server starting");
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("Metrics server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Metrics server failed");
        }
    });
    Ok(())
}

fn spawn_view_logger(session: &CallSessionHandle) {
    let mut view = session.view();
    tokio::spawn(async move {
        while view.changed().await.is_ok() {
            let current = view.borrow_and_update().clone();
            info!(
                phase = current.phase.as_str(),
                identity = %current.local_identity,
                participants = current.participants.len(),
                remote_peers = current.remote_peers.len(),
                streaming = current.remote_peers.iter().filter(|p| p.stream.is_some()).count(),
                signaling_degraded = current.signaling_degraded,
                audio = current.audio_enabled,
                video = current.video_enabled,
                "Call view updated"
            );
            if let Some(notice) = &current.fatal_notice {
                warn!(notice = %notice, "Call ended");
            }
            if current.is_closed() {
                break;
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
