//! capture-receiver: session-grouped frame storage for camlink
//!
//! Announces itself as `capture_receiver`, stores frames from `POST /upload`
//! and from the TCP frame stream, and optionally annotates stored images.
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. `config/receiver.toml`, then `/etc/camlink/receiver.toml`
//! 2. Environment variables (prefixed with `RECEIVER__`)

use anyhow::{Context, Result};
use camlink::{logging, Beacon, PeerKind};
use camlink_receiver::annotation::{self, AnnotationPool, HttpAnnotator};
use camlink_receiver::upload_api::{self, AppState};
use camlink_receiver::{FrameServer, ReceiverConfig, SessionManager};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = ReceiverConfig::load().context("Failed to load configuration")?;

    logging::init(&config.logging, "capture_receiver")?;

    info!(
        service = "capture-receiver",
        version = env!("CARGO_PKG_VERSION"),
        root = %config.sessions.root.display(),
        "Starting capture receiver"
    );

    config.validate()?;

    if let Some(port) = config.service.metrics_port {
        init_metrics(port)?;
    }

    std::fs::create_dir_all(&config.sessions.root).with_context(|| {
        format!("Failed to create session root {}", config.sessions.root.display())
    })?;
    let sessions = Arc::new(SessionManager::new(
        config.sessions.root.clone(),
        config.sessions.reuse_window(),
    ));

    // Annotation workers
    let (annotations, pool, failure_log) = if config.annotation.enabled {
        let annotator = HttpAnnotator::from_config(&config.annotation)
            .context("Failed to create annotation client")?;
        let (queue, pool, failures) = AnnotationPool::start(
            Arc::new(annotator),
            sessions.clone(),
            config.annotation.workers,
            config.annotation.queue_size,
            config.annotation.settle(),
        );
        info!(url = %config.annotation.url, mode = %config.annotation.mode, "Annotation enabled");
        (Some(queue), Some(pool), Some(annotation::log_failures(failures)))
    } else {
        (None, None, None)
    };

    // TCP frame stream
    let frame_server = if config.frame_stream.enabled {
        let addr: SocketAddr = format!("{}:{}", config.frame_stream.host, config.frame_stream.port)
            .parse()
            .context("Invalid frame stream address")?;
        let server = FrameServer::bind(addr, sessions.clone(), config.frame_stream.max_image_bytes)
            .await
            .context("Failed to start frame server")?
            .with_annotations(annotations.clone());
        Some(server.spawn())
    } else {
        None
    };

    // Announce this receiver
    let beacon = config.service.advertise.then(|| {
        Beacon::new(PeerKind::CaptureReceiver, config.service.port, config.discovery.clone()).spawn()
    });

    let state = AppState {
        sessions: sessions.clone(),
        annotations: annotations.clone(),
        annotation_info: config
            .annotation
            .enabled
            .then(|| (config.annotation.url.clone(), config.annotation.mode.clone())),
        max_upload_bytes: config.sessions.max_upload_bytes,
    };
    let mut api_handle = tokio::spawn({
        let host = config.service.host.clone();
        let port = config.service.port;
        async move {
            if let Err(e) = upload_api::start_api_server(state, &host, port).await {
                error!(error = %e, "API server failed");
            }
        }
    });

    info!("Capture receiver started successfully");

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = &mut api_handle => {
            warn!("API server exited unexpectedly");
        }
    }

    info!("Shutting down capture receiver");

    if let Some(beacon) = beacon {
        beacon.stop();
    }
    if let Some(server) = frame_server {
        server.stop();
    }
    api_handle.abort();

    // Dropping the last queue handle lets the workers drain and exit.
    drop(annotations);
    if let Some(pool) = pool {
        if tokio::time::timeout(config.annotation.timeout(), pool.join())
            .await
            .is_err()
        {
            warn!("Annotation workers did not finish in time");
        }
    }
    if let Some(failure_log) = failure_log {
        failure_log.abort();
    }

    info!("Capture receiver stopped");

    Ok(())
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
