//! rstomp - STOMP message broker
//!
//! Serves STOMP over TCP, TLS and WebSocket from a shared buffer pool.

use rstomp_broker::QueueRegistry;
use rstomp_buffer::{BufferPool, PoolConfig};
use rstomp_server::metrics::run_metrics_server;
use rstomp_server::{
    tls, Config, CredentialStore, FrameHandler, HeartBeat, Metrics, Server, ServerConfig,
    ServerInfo,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if RSTOMP_CONFIG is set, then env overrides)
    let config_path = std::env::var("RSTOMP_CONFIG").ok();
    let mut config = match Config::load() {
        Ok(c) => {
            if let Some(ref path) = config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // An explicitly named config file must load
            if config_path.is_some() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    // Load credentials from external file if configured
    if let Err(e) = config.load_secrets() {
        tracing::error!("Failed to load auth secrets: {}", e);
        return Err(e.into());
    }

    if let Err(e) = config.validate() {
        tracing::error!("Configuration error: {}", e);
        return Err(e.into());
    }

    tracing::info!("Starting rstomp broker");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    match config.network.websocket_bind_addr {
        Some(addr) => tracing::info!("  WebSocket address: {}", addr),
        None => tracing::info!("  WebSocket: disabled"),
    }
    tracing::info!(
        "  Buffers: {} bytes x {} preallocated (pain threshold {} bytes)",
        config.buffers.buffer_size,
        config.buffers.preallocated,
        config.buffers.pain_threshold
    );

    if config.auth.required {
        tracing::info!(
            "  Authentication: enabled ({} user(s), {} failed logins allowed)",
            config.auth.users.len(),
            config.auth.max_failed_logins
        );
    } else {
        tracing::info!("  Authentication: disabled");
    }

    let tls_acceptor = if config.tls.enabled {
        let acceptor = tls::create_tls_acceptor(&config.tls)?;
        tracing::info!("  TLS: enabled");
        if config.tls.require_client_cert {
            tracing::info!("  mTLS: enabled (client certificate required)");
        }
        Some(acceptor)
    } else {
        tracing::info!("  TLS: disabled");
        None
    };

    let pool = Arc::new(BufferPool::new(
        PoolConfig::new(config.buffers.buffer_size)
            .with_preallocated(config.buffers.preallocated)
            .with_pain_threshold(config.buffers.pain_threshold),
    ));
    let registry = Arc::new(QueueRegistry::new());

    let credentials = CredentialStore::new(
        config.auth.required,
        config
            .auth
            .users
            .iter()
            .map(|(login, hash)| (login.clone(), hash.clone())),
    );
    let info = ServerInfo {
        heart_beat: HeartBeat::new(config.network.heartbeat_ms, config.network.heartbeat_ms),
        ..ServerInfo::default()
    };

    let mut handler = FrameHandler::new(registry.clone())
        .with_auth(Arc::new(credentials))
        .with_info(info)
        .with_max_failed_logins(config.auth.max_failed_logins);

    let mut server_config = ServerConfig::from_config(&config);
    if let Some(acceptor) = tls_acceptor {
        server_config = server_config.with_tls(acceptor);
    }

    // Metrics are shared by the handler, the connection tasks and the HTTP endpoint
    let (metrics_shutdown, _) = broadcast::channel(1);
    let metrics_handle = if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        handler = handler.with_metrics(metrics.clone());
        server_config = server_config.with_metrics(metrics.clone());

        let refresh = {
            let pool = pool.clone();
            let registry = registry.clone();
            let metrics = metrics.clone();
            move || metrics.update_gauges(&pool.stats(), &registry.stats())
        };
        let addr = config.metrics.bind_addr;
        let shutdown_rx = metrics_shutdown.subscribe();
        Some(tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, refresh, shutdown_rx).await {
                tracing::error!("Metrics server error: {}", e);
            }
        }))
    } else {
        tracing::info!("  Metrics: disabled");
        None
    };

    let server = Arc::new(Server::new(server_config, Arc::new(handler), pool));

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping broker...");
        shutdown_server.shutdown();
        let _ = metrics_shutdown.send(());
    });

    // Run server (blocks until shutdown)
    server.run().await?;

    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    let stats = server.pool().stats();
    if stats.checked_out > 0 {
        tracing::warn!(
            "{} buffer(s) still checked out at shutdown ({} bytes)",
            stats.checked_out,
            stats.outstanding_bytes
        );
    }

    tracing::info!("Broker stopped");
    Ok(())
}
