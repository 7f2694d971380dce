use bytes::Bytes;
use clap::ValueEnum;
use http_body_util::Full;
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, Registry, TextEncoder};
use sniforward_config::{Config, ConfigError};
use sniforward_core::{ProxyError, run_proxy};
use std::io;
use std::path::Path;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to initialise logging: {0}")]
    Logging(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to bind metrics endpoint {address}: {source}")]
    MetricsBind {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

/// Installs the global subscriber. `RUST_LOG` overrides the `info` default.
pub fn init_logging(format: LogFormat) -> Result<(), RunError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter).with_target(false);

    match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    }
    .map_err(|e| RunError::Logging(e.to_string()))
}

/// Loads configuration from `config_path`, or from the environment when no
/// file is given, and serves until Ctrl-C or SIGTERM.
pub async fn run(config_path: Option<&Path>) -> Result<(), RunError> {
    let config = match config_path {
        Some(path) => {
            info!(path = %path.display(), "Loading configuration file");
            Config::from_file(path)?
        }
        None => {
            info!("Loading configuration from environment");
            Config::from_env()?
        }
    };
    debug!(?config, "Configuration loaded");

    let registry = if config.metrics.enabled {
        let registry = Registry::new();
        let listener = TcpListener::bind(config.metrics.address.as_str())
            .await
            .map_err(|source| RunError::MetricsBind {
                address: config.metrics.address.clone(),
                source,
            })?;
        info!(address = %config.metrics.address, "Metrics endpoint listening");
        tokio::spawn(serve_metrics(listener, registry.clone()));
        Some(registry)
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(());
    });

    run_proxy(config, registry, shutdown_rx).await?;
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("Shutdown signal received");
}

async fn serve_metrics(listener: TcpListener, registry: Registry) {
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "Metrics accept error");
                continue;
            }
        };
        let registry = registry.clone();
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            let service = hyper::service::service_fn(move |req: Request<hyper::body::Incoming>| {
                let response = metrics_response(&registry, req.uri().path());
                async move { response }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!(error = %e, "Metrics connection error");
            }
        });
    }
}

/// Renders the text exposition for `/metrics` (or `/`); anything else is 404.
pub fn metrics_response(registry: &Registry, path: &str) -> Result<Response<Full<Bytes>>, String> {
    if path != "/metrics" && path != "/" {
        return Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::new()))
            .map_err(|e| e.to_string());
    }

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .map_err(|e| format!("Metrics encoding error: {e}"))?;

    Response::builder()
        .header(CONTENT_TYPE, encoder.format_type())
        .body(Full::new(Bytes::from(buffer)))
        .map_err(|e| e.to_string())
}
