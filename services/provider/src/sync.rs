//! Periodic base status solicitation.
//!
//! The tunnel delivers module status asynchronously through callbacks;
//! this loop keeps soliciting heartbeats and full snapshots so pod
//! statuses converge even when the base never pushes on its own.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::tunnel::Tunnel;

/// Runs until the shutdown signal flips.
pub async fn run_status_sync_loop(
    tunnel: Arc<dyn Tunnel>,
    node_name: String,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        node_name = %node_name,
        interval_secs = interval.as_secs(),
        "Starting status sync loop"
    );

    let mut tick = tokio::time::interval(interval);
    let mut consecutive_failures = 0u32;

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let result = async {
                    tunnel.fetch_health_data(&node_name).await?;
                    tunnel.query_all_biz_status_data(&node_name).await
                }
                .await;

                match result {
                    Ok(()) => {
                        consecutive_failures = 0;
                        debug!(node_name = %node_name, "Status solicitation sent");
                    }
                    Err(err) => {
                        consecutive_failures += 1;
                        warn!(
                            node_name = %node_name,
                            error = %err,
                            consecutive_failures,
                            "Status solicitation failed"
                        );
                    }
                }
            }

            changed = shutdown.changed() => {
                // A dropped sender counts as shutdown.
                if changed.is_err() || *shutdown.borrow() {
                    info!("Status sync loop shutting down");
                    break;
                }
            }
        }
    }
}
