use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::fmt::init as tracing_init;
use tracing_subscriber::EnvFilter;
use van_core::{ControllerConfig, Engine, SyncMetrics};
use van_kube::{KubeCluster, SiteClient};

mod controllers;
mod server;

const ENV_LOG_FORMAT: &str = "VAN_LOG_FORMAT";

fn init_tracing() {
    if std::env::var(ENV_LOG_FORMAT).as_deref() == Ok("json") {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .init();
    } else {
        tracing_init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting van-controller...");

    let config = ControllerConfig::from_env()?;
    info!(
        origin = %config.origin,
        namespace = %config.namespace,
        "Configuration loaded, services defined in {}",
        config.config_source
    );
    let metrics_addr: SocketAddr = config.metrics_addr.parse()?;

    let client = SiteClient::new(config.namespace.clone()).await?;
    let metrics = SyncMetrics::new()?;
    let cluster = Arc::new(KubeCluster::new(client.clone(), config.config_source.clone()));
    let engine = Engine::new(config.clone(), cluster, metrics.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks = controllers::spawn_controllers(&client, &config, &engine, shutdown_rx.clone());
    tasks.extend(start_service_sync(&engine, shutdown_rx.clone()));

    let server_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) = server::serve(metrics_addr, metrics, server_shutdown).await {
            error!("Metrics server error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting...");

    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            error!("Task failed during shutdown: {}", e);
        }
    }

    Ok(())
}

#[cfg(feature = "amqp")]
fn start_service_sync(engine: &Engine, shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
    use van_core::sync::{AmqpBus, ServiceSync};

    let config = engine.config();
    let bus = Arc::new(AmqpBus::new(config.bus_url.clone(), &config.origin));
    let sync = ServiceSync::new(engine.clone(), bus);
    Some(tokio::spawn(sync.run(shutdown)))
}

#[cfg(not(feature = "amqp"))]
fn start_service_sync(_engine: &Engine, _shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
    tracing::warn!("Built without the amqp feature, service sync with peer sites is disabled");
    None
}
