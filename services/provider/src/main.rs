//! modulet provider daemon.
//!
//! Runs the pod-to-module provider engine standalone: the queue workers,
//! the status sync loop, and the tunnel callback wiring. Pod lifecycle
//! calls arrive from the embedding virtual-kubelet host; this binary is
//! the local/dev harness around the engine.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use modulet_provider::cluster::HttpClusterClient;
use modulet_provider::config::Config;
use modulet_provider::provider::{ModuleProvider, ProviderConfig};
use modulet_provider::sync::run_status_sync_loop;
use modulet_provider::tunnel::{MockTunnel, Tunnel, TunnelCallbacks};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting modulet provider");

    let config = Config::from_env()?;
    info!(
        node_name = %config.node_name,
        cluster_url = %config.cluster_url,
        "Configuration loaded"
    );

    // The in-process tunnel stands in until a transport tunnel (MQTT or
    // HTTP to a live base) is linked in.
    let tunnel = Arc::new(MockTunnel::new());
    let cluster = Arc::new(HttpClusterClient::new(config.cluster_url.clone()));

    let provider = Arc::new(ModuleProvider::new(
        ProviderConfig {
            namespace: config.namespace.clone(),
            node_name: config.node_name.clone(),
            local_ip: config.local_ip.clone(),
            ..Default::default()
        },
        tunnel.clone(),
        cluster,
    ));

    provider.notify_pods(|pod| {
        tracing::debug!(
            pod_key = %modulet_api::pod_key(&pod),
            phase = %pod.status.phase,
            "Pod status changed"
        );
    });

    // Route base-side status arrivals into the sync entry points.
    let handle = tokio::runtime::Handle::current();
    tunnel.register_callback(TunnelCallbacks {
        on_base_discovered: Arc::new(|info| {
            tracing::info!(node_name = %info.node_name, "Base discovered");
        }),
        on_base_status_arrived: Arc::new(|status| {
            tracing::debug!(
                node_name = %status.node_name,
                healthy = status.healthy,
                "Base status arrived"
            );
        }),
        on_all_biz_status_arrived: {
            let provider = provider.clone();
            let handle = handle.clone();
            Arc::new(move |statuses| {
                let provider = provider.clone();
                handle.spawn(async move {
                    provider.sync_all_biz_status(statuses).await;
                });
            })
        },
        on_single_biz_status_arrived: {
            let provider = provider.clone();
            let handle = handle.clone();
            Arc::new(move |status| {
                let provider = provider.clone();
                handle.spawn(async move {
                    provider.sync_biz_status(status).await;
                });
            })
        },
    });

    tunnel.start().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = provider.run(shutdown_rx.clone());
    let sync_tunnel: Arc<dyn Tunnel> = tunnel.clone();
    workers.push(tokio::spawn(run_status_sync_loop(
        sync_tunnel,
        config.node_name.clone(),
        Duration::from_secs(config.status_sync_interval_secs),
        shutdown_rx,
    )));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);
    for worker in workers {
        let _ = worker.await;
    }

    Ok(())
}
