use std::{sync::Arc, time::Duration};

use tokio::{signal, sync::Notify, time};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use zklock::{
    app::{router, AppState},
    bootstrap::bootstrap,
    config::{Backend, Config},
    metrics::Metrics,
    CoordinationClient, MemoryEnsemble,
};

// Blocked /lock requests never finish on their own.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// The server's coordination session and how to end it.
struct Connection {
    client: Arc<dyn CoordinationClient>,
    close: Box<dyn FnOnce() -> anyhow::Result<()> + Send>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "zklock=debug,tower_http=debug,axum::rejection=trace".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!(
        "Starting zklock on {} ({:?} backend)",
        config.bind_addr, config.backend
    );

    let connection = connect(&config).await?;
    let metrics = Metrics::new();
    let (lock_manager, bootstrap_status) =
        bootstrap(connection.client.clone(), &config, metrics.clone()).await?;

    let app = router(AppState {
        lock_manager,
        bootstrap: bootstrap_status,
        metrics,
    });

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("Server listening on {}", config.bind_addr);

    let stop = Arc::new(Notify::new());
    let server_stop = stop.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_stop.notified().await })
            .await
    });

    tokio::select! {
        result = &mut server => {
            result??;
        }
        _ = shutdown_signal() => {
            stop.notify_one();
            match time::timeout(SHUTDOWN_GRACE, server).await {
                Ok(result) => result??,
                Err(_) => warn!(
                    "In-flight requests still pending after {:?}, shutting down anyway",
                    SHUTDOWN_GRACE
                ),
            }
        }
    }

    // Ending the session drops every lock node this server still holds.
    match (connection.close)() {
        Ok(()) => info!("Coordination session closed"),
        Err(e) => warn!("Failed to close coordination session: {}", e),
    }

    info!("Server stopped");
    Ok(())
}

async fn connect(config: &Config) -> anyhow::Result<Connection> {
    match config.backend {
        Backend::Memory => {
            let ensemble = MemoryEnsemble::new();
            ensemble.clone().start_expiry_task();

            let ttl = u32::try_from(config.session_timeout_secs).unwrap_or(u32::MAX);
            let session = ensemble.connect(Some(ttl));
            session.start_keepalive_task();

            let closing = session.clone();
            Ok(Connection {
                client: Arc::new(session),
                close: Box::new(move || closing.close().map_err(anyhow::Error::from)),
            })
        }
        #[cfg(feature = "zookeeper")]
        Backend::ZooKeeper => {
            let connect_string = config.zk_connect.clone();
            let timeout = Duration::from_secs(config.session_timeout_secs);
            let zk = tokio::task::spawn_blocking(move || {
                zklock::zk::ZkCoordinator::connect(&connect_string, timeout)
            })
            .await??;

            let zk = Arc::new(zk);
            let closing = zk.clone();
            Ok(Connection {
                client: zk,
                close: Box::new(move || closing.close().map_err(anyhow::Error::from)),
            })
        }
        #[cfg(not(feature = "zookeeper"))]
        Backend::ZooKeeper => Err(anyhow::anyhow!(
            "COORDINATION_BACKEND=zookeeper requires building with the `zookeeper` feature"
        )),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
