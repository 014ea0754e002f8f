#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

mod bridge;
mod cli;
mod config;
mod db;
mod matrix;
mod media;
mod utils;
mod viber;
mod web;

use bridge::capabilities::{MatrixPort, MediaFetcher};
use bridge::commands::CommandHandler;
use bridge::{BridgeCore, RelaySettings};
use cli::Cli;
use config::Config;
use matrix::{DefaultRoute, MatrixClient, MatrixEventProcessor};
use media::MediaHandler;
use utils::retry::RetryPolicy;
use viber::{SignatureVerifier, ViberClient};
use web::metrics::BridgeMetrics;
use web::{WebServer, WebState};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;
    utils::logging::init_tracing(&config.logging);
    info!("matrix-viber bridge starting up");

    let db = db::DatabaseManager::new(&config.database, &config.cache).await?;
    db.migrate().await?;

    let metrics = Arc::new(BridgeMetrics::new());
    let viber = Arc::new(ViberClient::new(&config.viber)?);
    let media: Arc<dyn MediaFetcher> = Arc::new(MediaHandler::new(
        config.bridge.max_media_bytes,
        config.viber.http_timeout(),
    )?);

    let matrix = if config.matrix.is_configured() {
        let client = Arc::new(MatrixClient::new(&config.matrix, config.viber.http_timeout())?);
        let own_user_id = client
            .whoami()
            .await
            .context("matrix access token was rejected")?;
        info!("matrix client ready user_id={own_user_id}");
        Some((client, own_user_id))
    } else {
        warn!("matrix is not configured, viber events will be acknowledged but not relayed");
        None
    };

    let core = Arc::new(BridgeCore::new(
        SignatureVerifier::new(config.viber.signing_secret(), config.viber.allow_unsigned),
        db.clone(),
        matrix
            .as_ref()
            .map(|(client, _)| client.clone() as Arc<dyn MatrixPort>),
        Some(media),
        RelaySettings {
            create_portal_rooms: config.matrix.create_portal_rooms,
            default_room_id: config.matrix.default_room_id.clone(),
            request_timeout: config.bridge.request_timeout(),
        },
        metrics.clone(),
    ));

    let router = web::create_router(WebState {
        bridge: core,
        db: db.clone(),
        metrics: metrics.clone(),
        max_body_bytes: config.bridge.max_body_bytes,
        webhook_rate_limit: config.bridge.webhook_rate_limit(),
    });
    let web_server = WebServer::start(&config.bridge, router).await?;

    let webhook_registered = Arc::new(AtomicBool::new(false));
    if cli.skip_webhook_registration {
        info!("viber webhook registration skipped");
    } else {
        let registration = viber::register_webhook(
            &viber,
            &config.viber.webhook_url,
            &config.viber.event_types,
            &RetryPolicy::webhook_registration(),
        )
        .await;
        if let Err(err) = registration {
            web_server.shutdown().await;
            return Err(err).context("viber webhook registration failed");
        }
        webhook_registered.store(true, Ordering::Relaxed);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sync_task = matrix.map(|(client, own_user_id)| {
        let processor = Arc::new(MatrixEventProcessor::new(
            own_user_id,
            client.homeserver().clone(),
            db.clone(),
            viber.clone(),
            client.clone(),
            CommandHandler::new(
                db.clone(),
                config.matrix.admin_users.clone(),
                webhook_registered.clone(),
            ),
            DefaultRoute {
                room_id: config.matrix.default_room_id.clone(),
                receiver_id: config.viber.default_receiver_id.clone(),
            },
            metrics.clone(),
        ));
        tokio::spawn(matrix::run_sync_loop(client, processor, shutdown_rx))
    });

    wait_for_shutdown_signal().await;
    info!("matrix-viber bridge shutting down");

    let _ = shutdown_tx.send(true);
    if let Some(task) = sync_task
        && let Err(err) = task.await
    {
        error!("matrix sync task failed: {err}");
    }
    web_server.shutdown().await;

    info!("matrix-viber bridge stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!("failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
}
