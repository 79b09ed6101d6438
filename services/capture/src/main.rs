//! capture-service: HTTP-triggered camera capture for camlink nodes
//!
//! Announces itself as `raspi_cam`, listens for `capture_receiver` beacons,
//! and serves `POST /capture` and `GET /health`.
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. `config/capture.toml`, then `/etc/camlink/capture.toml`
//! 2. Environment variables (prefixed with `CAPTURE__`)

use anyhow::{Context, Result};
use camlink::{logging, Beacon, PeerKind, Registry, RegistryListener};
use camlink_capture::api::{self, AppState};
use camlink_capture::camera::factory_from_config;
use camlink_capture::sink::{FrameSink, HttpUploadSink, ReceiverResolver, TcpFrameSink};
use camlink_capture::{CaptureServiceConfig, CaptureWorker, JpegEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = CaptureServiceConfig::load().context("Failed to load configuration")?;

    logging::init(&config.logging, "capture_service")?;

    info!(
        service = "capture-service",
        version = env!("CARGO_PKG_VERSION"),
        backend = %config.camera.backend,
        transport = %config.receiver.transport,
        "Starting capture service"
    );

    config.validate()?;

    if let Some(port) = config.service.metrics_port {
        init_metrics(port)?;
    }

    let fixed_receiver = match config.receiver.transport.as_str() {
        "http" => config.receiver.upload_url.is_some(),
        _ => config.receiver.frame_addr.is_some(),
    };

    // Receiver discovery
    let registry = Arc::new(
        Registry::new(&[PeerKind::CaptureReceiver])
            .with_stale_after(config.discovery.stale_after()),
    );
    let listen_addr = SocketAddr::from(([0, 0, 0, 0], config.discovery.port));
    let listener = match RegistryListener::bind(
        registry.clone(),
        listen_addr,
        config.discovery.poll_interval(),
    )
    .await
    {
        Ok(listener) => Some(listener.spawn()),
        Err(e) if fixed_receiver => {
            warn!(error = %e, "Receiver discovery disabled");
            None
        }
        Err(e) => return Err(e).context("Failed to start receiver discovery"),
    };

    let resolver = ReceiverResolver::new(config.receiver.frame_port, config.receiver.upload_port)
        .with_frame_addr(config.receiver.frame_addr.clone())
        .with_upload_url(config.receiver.upload_url.clone())
        .with_registry(registry.clone());

    let sink: Arc<dyn FrameSink> = match config.receiver.transport.as_str() {
        "http" => Arc::new(HttpUploadSink::new(
            resolver,
            config.receiver.session.clone(),
            config.receiver.upload_timeout(),
        )),
        _ => Arc::new(TcpFrameSink::new(
            resolver,
            config.receiver.connect_timeout(),
            config.receiver.ack_timeout(),
        )),
    };

    let worker = Arc::new(CaptureWorker::new(
        factory_from_config(&config.camera)?,
        Arc::new(JpegEncoder::new(config.encoder.quality)),
        sink,
    ));

    // Announce this node
    let beacon = config.service.advertise.then(|| {
        let receiver_url = config
            .receiver
            .upload_url
            .clone()
            .or_else(|| config.receiver.frame_addr.clone());
        Beacon::new(PeerKind::RaspiCam, config.service.port, config.discovery.clone())
            .with_receiver_url(receiver_url)
            .spawn()
    });

    let state = AppState {
        worker: worker.clone(),
        host: camlink::net::local_hostname(),
    };
    let api_handle = tokio::spawn({
        let host = config.service.host.clone();
        let port = config.service.port;
        async move {
            if let Err(e) = api::start_api_server(state, &host, port).await {
                error!(error = %e, "API server failed");
            }
        }
    });

    info!("Capture service started successfully");

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = api_handle => {
            warn!("API server exited unexpectedly");
        }
    }

    info!("Shutting down capture service");

    if let Some(beacon) = beacon {
        beacon.stop();
    }
    if let Some(listener) = listener {
        listener.shutdown().await;
    }
    worker.reset().await;

    let stats = worker.stats();
    info!(
        requests = stats.requests,
        failures = stats.failures,
        frames_sent = stats.frames_sent,
        "Capture service stopped"
    );

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
