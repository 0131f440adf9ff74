//! Startup and serving
//!
//! Builds the shared state from a validated [`RelayConfig`], binds the
//! listener and serves plain HTTP or HTTPS until Ctrl-C.

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use tracing::{info, warn};

use crate::broadcast::BroadcastChannel;
use crate::config::{display_host, RelayConfig};
use crate::crypto::CryptoGate;
use crate::locks::{FsLockStore, LockStore};
use crate::router::create_router;
use crate::state::AppState;
use crate::{SERVICE_NAME, SERVICE_VERSION};

/// Time in-flight requests get to finish after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Build the shared state. Lock records from a previous run are discarded.
pub async fn build_state(config: &RelayConfig) -> anyhow::Result<AppState> {
    let store = FsLockStore::open(&config.locks_dir).await?;
    store.clear().await?;

    Ok(AppState::new(
        BroadcastChannel::new(config.broadcast),
        CryptoGate::new(&config.crypto),
        Arc::new(store),
    ))
}

pub async fn run(config: RelayConfig) -> anyhow::Result<()> {
    let tls = match &config.tls {
        Some(paths) => Some(
            RustlsConfig::from_pem_file(&paths.cert, &paths.key)
                .await
                .with_context(|| format!("loading TLS certificate {}", paths.cert.display()))?,
        ),
        None => None,
    };

    let state = build_state(&config).await?;
    let app = create_router(state, config.max_concurrent_requests);

    let listener = TcpListener::bind(config.listen)
        .with_context(|| format!("binding {}", config.listen))?;
    listener.set_nonblocking(true)?;
    let local = listener.local_addr()?;

    print_banner(&config, local);
    info!(address = %local, scheme = config.scheme(), "Listening");

    let handle = Handle::new();
    tokio::spawn(shutdown_on_signal(handle.clone()));

    serve(listener, app, tls, handle).await?;
    info!("Relay stopped");
    Ok(())
}

async fn serve(
    listener: TcpListener,
    app: Router,
    tls: Option<RustlsConfig>,
    handle: Handle,
) -> std::io::Result<()> {
    match tls {
        Some(tls) => {
            axum_server::from_tcp_rustls(listener, tls)
                .handle(handle)
                .serve(app.into_make_service())
                .await
        }
        None => {
            axum_server::from_tcp(listener)
                .handle(handle)
                .serve(app.into_make_service())
                .await
        }
    }
}

async fn shutdown_on_signal(handle: Handle) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => warn!(error = %e, "Failed to listen for shutdown signal"),
    }
    handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
}

fn print_banner(config: &RelayConfig, local: SocketAddr) {
    println!("{} {}", SERVICE_NAME, SERVICE_VERSION);
    println!("Session: {}", config.session_name);
    for key in &config.generated_keys {
        println!("\n{}", key);
    }
    println!(
        "\nRunning at {}://{}:{}\n--",
        config.scheme(),
        display_host(&local),
        local.port()
    );
}
