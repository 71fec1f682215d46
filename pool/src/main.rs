// Shaicoin pool: WebSocket share server with per-miner adaptive difficulty

use anyhow::{Context, Result};
use axum::{http::{header, StatusCode}, response::IntoResponse, routing::get};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use shai_pool::blockchain::{NodeRpcClient, TemplateManager};
use shai_pool::config::Config;
use shai_pool::jobs::{JobDispatcher, TemplateJobBuilder};
use shai_pool::metrics::prometheus as metrics;
use shai_pool::session::SessionRegistry;
use shai_pool::shares::{BoundedVerifier, RedisStorage, Sha3Verifier};
use shai_pool::stratum::server::bind_listener;
use shai_pool::stratum::{Collaborators, ProtocolSettings, ShareProtocol, StratumServer};
use shai_pool::sweeper::StaleSweeper;
use shai_pool::vardiff::DifficultyController;

/// Time given to writer tasks to flush close frames before the listener stops.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

async fn api_metrics() -> impl IntoResponse {
    let body = metrics::render();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Resolves on SIGINT, or SIGTERM on Unix.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("Failed to register SIGTERM handler")?;
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("SIGTERM, shutting down"),
            r = tokio::signal::ctrl_c() => {
                r.context("Failed to listen for Ctrl+C")?;
                tracing::info!("SIGINT, shutting down");
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
        tracing::info!("Ctrl+C, shutting down");
    }
    Ok(())
}

fn stopped(mut rx: watch::Receiver<bool>) -> impl std::future::Future<Output = ()> + Send + 'static {
    async move {
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let cfg = Config::load();
    tracing::info!(
        "Shaicoin pool starting: listen={} node={} target_share={}s window={}",
        cfg.listen,
        cfg.node_rpc_url,
        cfg.vardiff.target_share_secs,
        cfg.vardiff.window_size
    );

    let node = Arc::new(NodeRpcClient::new(
        cfg.node_rpc_url.clone(),
        cfg.node_rpc_auth.clone(),
        Some(Duration::from_secs(30)),
    ));

    let storage = Arc::new(
        RedisStorage::new(&cfg.redis_url, cfg.share_retention).context("Invalid Redis URL")?,
    );
    if let Err(e) = storage.ping().await {
        tracing::warn!("Redis not reachable yet ({}); shares will be retried per submission", e);
    }

    let verifier = Arc::new(BoundedVerifier::new(
        Arc::new(Sha3Verifier::new()),
        cfg.max_concurrent_validations,
        cfg.validation_timeout(),
    ));

    let registry = Arc::new(SessionRegistry::new(cfg.vardiff.window_size));
    let dispatcher = Arc::new(JobDispatcher::new(Arc::new(TemplateJobBuilder::new()), registry.clone()));
    let controller = DifficultyController::new(cfg.vardiff);

    let protocol = Arc::new(ShareProtocol::new(
        dispatcher.clone(),
        controller,
        Collaborators {
            verifier,
            node: node.clone(),
            store: storage.clone(),
            bans: storage,
        },
        ProtocolSettings {
            max_message_size: cfg.max_message_size,
            invalid_share_limit: cfg.invalid_share_limit,
            job_mismatch_tolerance: cfg.job_mismatch_tolerance,
        },
    ));

    let templates = Arc::new(TemplateManager::new(
        node,
        dispatcher.clone(),
        Some(cfg.template_poll_interval()),
    ));
    if let Err(e) = templates.poll_once().await {
        tracing::warn!("Initial template fetch failed: {}; miners get work on the next poll", e);
    }
    let template_task = templates.spawn();

    let sweeper = Arc::new(StaleSweeper::new(
        dispatcher.clone(),
        registry,
        cfg.vardiff.target_share_secs,
        cfg.sweep,
    ));
    let sweep_task = sweeper.spawn();

    let (stop_tx, stop_rx) = watch::channel(false);

    let metrics_listener = bind_listener(&cfg.metrics_listen)?;
    let metrics_app = axum::Router::new().route("/metrics", get(api_metrics));
    let metrics_stop = stopped(stop_rx.clone());
    tracing::info!("Metrics listening on http://{}/metrics", cfg.metrics_listen);
    let metrics_task = tokio::spawn(async move {
        axum::serve(metrics_listener, metrics_app)
            .with_graceful_shutdown(metrics_stop)
            .await
    });

    let server = Arc::new(StratumServer::new(cfg.listen.clone(), protocol));
    let mut server_task = tokio::spawn(server.clone().start(stopped(stop_rx)));

    let early_exit = tokio::select! {
        r = shutdown_signal() => {
            if let Err(e) = r {
                tracing::error!("Signal handling failed: {}", e);
            }
            None
        }
        res = &mut server_task => Some(res),
    };

    // Stop issuing work first, then close connections, then the sockets.
    dispatcher.begin_draining();
    sweep_task.abort();
    template_task.abort();
    server.shutdown().await;
    if early_exit.is_none() {
        tokio::time::sleep(CLOSE_GRACE).await;
    }
    let _ = stop_tx.send(true);

    let served = match early_exit {
        Some(res) => res,
        None => server_task.await,
    };
    match served {
        Ok(Err(e)) => tracing::error!("Share server failed: {}", e),
        Err(e) => tracing::error!("Share server task panicked: {}", e),
        Ok(Ok(())) => {}
    }
    if let Ok(Err(e)) = metrics_task.await {
        tracing::error!("Metrics server failed: {}", e);
    }

    tracing::info!("Shaicoin pool shut down cleanly");
    Ok(())
}
