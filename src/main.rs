use anyhow::Result;
use std::net::SocketAddr;
use tracing::{error, info};
use tracing_subscriber::prelude::*;

use simdex::{config, routes, server, state};

#[tokio::main]
async fn main() -> Result<()> {
    // Resolve log directory (same parent as the data dir or from env)
    let log_dir = std::env::var("SIMDEX_LOG_DIR").unwrap_or_else(|_| {
        dirs::data_local_dir()
            .map(|d| d.join("simdex").join("logs").to_string_lossy().to_string())
            .unwrap_or_else(|| ".simdex-data/logs".to_string())
    });
    std::fs::create_dir_all(&log_dir).ok();

    // File appender: daily rotated log files
    let file_appender = tracing_appender::rolling::daily(&log_dir, "simdex.log");
    let (non_blocking_writer, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "simdex=info,tower_http=info".into());

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .compact();

    let file_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_ansi(false)
        .with_writer(non_blocking_writer)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    // Log panics (e.g. in shard worker threads) before aborting
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_default();
        let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        error!(target: "simdex::panic", location = %location, payload = %payload, "PANIC: thread panicked");
        default_panic(info);
    }));

    routes::health::init_start_time();

    let config = config::AppConfig::from_env();
    let addr: SocketAddr = config.listen_addr().parse()?;

    info!(
        index_dir = %config.index_dir,
        large_emb_space = config.large_emb_space,
        vectorizer_url = %config.vectorizer_url,
        nprobe = config.nprobe,
        radius = ?config.radius,
        log_dir = %log_dir,
        "simdex starting"
    );

    // Loading shards spawns one worker per on-disk index; a shard that
    // cannot be opened aborts startup rather than serving partial data.
    let app_state = state::AppState::new(config)?;
    let app = server::create_app(app_state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("simdex listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("simdex shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, initiating shutdown"); },
        _ = terminate => { info!("received terminate signal, initiating shutdown"); },
    }
}
