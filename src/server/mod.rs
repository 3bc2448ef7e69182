pub mod admission;
pub mod error;
pub mod registry;
pub mod settings;
pub mod state;
pub mod tls;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

use state::AppState;

/// Run the webhook HTTP(S) server until a shutdown signal arrives.
///
/// TLS is enabled when both certificate files exist at startup; the key pair
/// is then served through [`tls::CertReloader`] so external rotation of the
/// files takes effect without a restart. Otherwise the server runs plain
/// HTTP (useful behind a TLS-terminating proxy or in local development).
pub async fn run_server(settings: settings::Settings) -> Result<()> {
    let state = AppState::new(&settings);
    info!(
        cache = state.catalog.cache_hostname(),
        "registry catalog initialized"
    );

    let app = Router::new()
        .route("/", get(root_banner))
        .route("/health", get(health_check))
        .route("/version", get(version_info))
        .route("/mutate", post(admission::handle_mutate))
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

    let addr: SocketAddr = format!("{}:{}", settings.server.host, settings.server.port)
        .parse()
        .context("invalid server host/port")?;

    let cert_path = Path::new(&settings.tls.cert_path);
    let key_path = Path::new(&settings.tls.key_path);
    if !cert_path.exists() || !key_path.exists() {
        info!("TLS key pair not found, starting server without TLS");
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("HTTP server listening on http://{}", addr);
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        info!("HTTP server shutdown complete");
        return Ok(());
    }

    // Install default CryptoProvider for rustls
    rustls::crypto::ring::default_provider().install_default().ok();

    let reloader = Arc::new(tls::CertReloader::new(cert_path, key_path));
    let mut tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(reloader);
    tls_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    let handle = axum_server::Handle::new();
    tokio::spawn({
        let handle = handle.clone();
        async move {
            shutdown_signal().await;
            handle.graceful_shutdown(Some(Duration::from_secs(10)));
        }
    });

    info!(
        "HTTPS server listening on https://{} with dynamic TLS reloading",
        addr
    );
    axum_server::bind_rustls(addr, RustlsConfig::from_config(Arc::new(tls_config)))
        .handle(handle)
        .serve(app.into_make_service())
        .await?;
    info!("HTTPS server shutdown complete");

    Ok(())
}

async fn root_banner() -> &'static str {
    "ECR pull-through webhook"
}

async fn health_check() -> &'static str {
    "OK"
}

async fn version_info() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "repository": env!("CARGO_PKG_REPOSITORY"),
    }))
}

/// Wait for a shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), shutting down gracefully");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
