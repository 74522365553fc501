//! Install and uninstall queue handlers.
//!
//! Items are biz keys. Both handlers are idempotent: they query the base
//! for the module's current state and only issue the tunnel call that
//! moves it toward the desired one. Transport errors propagate to the
//! queue, which retries with backoff; everything else is logged and
//! dropped.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{error, info};

use modulet_api::{pod_key, split_biz_key, BizState, Container, EnvVar, BIZ_VERSION_ENV};
use modulet_workqueue::OperationHandler;

use crate::store::PodStore;
use crate::tunnel::Tunnel;

/// Handles items on the install queue.
pub struct InstallHandler {
    pub store: Arc<PodStore>,
    pub tunnel: Arc<dyn Tunnel>,
    pub node_name: String,
}

#[async_trait]
impl OperationHandler for InstallHandler {
    async fn handle(&self, biz_key: &str) -> Result<()> {
        info!(biz_key = %biz_key, "HandleInstallOperationStarted");

        let Some((pod, container)) = self.store.get_biz_model(biz_key).await else {
            // The reconciler asked to install a module it never stored;
            // retrying cannot fix that.
            error!(biz_key = %biz_key, "InstallingNonExistentModule");
            return Ok(());
        };

        let info = self.tunnel.query_biz_status(&self.node_name, biz_key).await?;

        match info.map(|i| i.state) {
            Some(BizState::Activated) => {
                info!(biz_key = %biz_key, "BizAlreadyActivated");
                return Ok(());
            }
            Some(BizState::Resolved) => {
                // Another install is already in flight.
                info!(biz_key = %biz_key, "BizInstalling");
                return Ok(());
            }
            Some(state) if state != BizState::Deactivated => {
                error!(biz_key = %biz_key, state = %state, "BizInstalledButNotActivated");
                return Ok(());
            }
            _ => {}
        }

        self.tunnel
            .start_biz(&self.node_name, &pod_key(&pod), &container)
            .await?;

        info!(biz_key = %biz_key, "HandleInstallOperationFinished");
        Ok(())
    }
}

/// Handles items on the uninstall queue.
pub struct UninstallHandler {
    pub tunnel: Arc<dyn Tunnel>,
    pub node_name: String,
}

#[async_trait]
impl OperationHandler for UninstallHandler {
    async fn handle(&self, biz_key: &str) -> Result<()> {
        info!(biz_key = %biz_key, "HandleUninstallOperationStarted");

        let Some(info) = self.tunnel.query_biz_status(&self.node_name, biz_key).await? else {
            // Already gone.
            info!(biz_key = %biz_key, "HandleUninstallOperationFinished");
            return Ok(());
        };

        // The pod snapshot may already be gone from the store, so the stop
        // target is rebuilt from what the base reports.
        let (name, version) = split_biz_key(&info.key);
        let container = Container {
            name,
            image: String::new(),
            env: vec![EnvVar {
                name: BIZ_VERSION_ENV.to_string(),
                value: version,
            }],
        };
        self.tunnel
            .stop_biz(&self.node_name, &info.pod_key, &container)
            .await?;

        info!(biz_key = %biz_key, "HandleUninstallOperationFinished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use modulet_api::{BizStatusData, ObjectMeta, Pod, PodSpec};

    use crate::tunnel::MockTunnel;

    fn biz_container(name: &str, version: &str) -> Container {
        Container {
            name: name.to_string(),
            image: format!("repo/{name}-{version}.jar"),
            env: vec![EnvVar {
                name: BIZ_VERSION_ENV.to_string(),
                value: version.to_string(),
            }],
        }
    }

    fn make_pod(containers: Vec<Container>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: "pod1".to_string(),
                namespace: "ns1".to_string(),
                ..Default::default()
            },
            spec: PodSpec { containers },
            ..Default::default()
        }
    }

    fn remote_status(name: &str, version: &str, state: BizState) -> BizStatusData {
        BizStatusData {
            key: format!("{name}:{version}"),
            name: name.to_string(),
            pod_key: "ns1/pod1".to_string(),
            state,
            change_time: Utc::now(),
            reason: None,
            message: None,
            revision: 0,
        }
    }

    async fn install_setup(remote: Option<BizState>) -> (Arc<MockTunnel>, InstallHandler) {
        let store = Arc::new(PodStore::new());
        store
            .put_pod(make_pod(vec![biz_container("biz-a", "1.0")]))
            .await;

        let tunnel = Arc::new(MockTunnel::new());
        if let Some(state) = remote {
            tunnel.set_biz_status(remote_status("biz-a", "1.0", state));
        }

        let handler = InstallHandler {
            store,
            tunnel: tunnel.clone(),
            node_name: "node-1".to_string(),
        };
        (tunnel, handler)
    }

    #[tokio::test]
    async fn install_starts_absent_module() {
        let (tunnel, handler) = install_setup(None).await;
        handler.handle("biz-a:1.0").await.unwrap();

        let starts = tunnel.start_calls();
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0].biz_key, "biz-a:1.0");
        assert_eq!(starts[0].pod_key, "ns1/pod1");
    }

    #[tokio::test]
    async fn install_starts_deactivated_module() {
        let (tunnel, handler) = install_setup(Some(BizState::Deactivated)).await;
        handler.handle("biz-a:1.0").await.unwrap();
        assert_eq!(tunnel.start_calls().len(), 1);
    }

    #[tokio::test]
    async fn install_skips_activated_module() {
        let (tunnel, handler) = install_setup(Some(BizState::Activated)).await;
        handler.handle("biz-a:1.0").await.unwrap();
        assert!(tunnel.start_calls().is_empty());
    }

    #[tokio::test]
    async fn install_skips_module_already_installing() {
        let (tunnel, handler) = install_setup(Some(BizState::Resolved)).await;
        handler.handle("biz-a:1.0").await.unwrap();
        assert!(tunnel.start_calls().is_empty());
    }

    #[tokio::test]
    async fn install_drops_broken_module_without_retry() {
        let (tunnel, handler) = install_setup(Some(BizState::Broken)).await;
        // Drop, not retry: the handler reports success to the queue.
        handler.handle("biz-a:1.0").await.unwrap();
        assert!(tunnel.start_calls().is_empty());
    }

    #[tokio::test]
    async fn install_drops_unknown_model() {
        let store = Arc::new(PodStore::new());
        let tunnel = Arc::new(MockTunnel::new());
        let handler = InstallHandler {
            store,
            tunnel: tunnel.clone(),
            node_name: "node-1".to_string(),
        };

        handler.handle("biz-missing:1.0").await.unwrap();
        assert!(tunnel.start_calls().is_empty());
    }

    #[tokio::test]
    async fn install_propagates_transport_errors() {
        let store = Arc::new(PodStore::new());
        store
            .put_pod(make_pod(vec![biz_container("biz-a", "1.0")]))
            .await;
        let tunnel = Arc::new(MockTunnel::failing_starts());
        let handler = InstallHandler {
            store,
            tunnel: tunnel.clone(),
            node_name: "node-1".to_string(),
        };

        assert!(handler.handle("biz-a:1.0").await.is_err());
    }

    #[tokio::test]
    async fn uninstall_stops_present_module() {
        let tunnel = Arc::new(MockTunnel::new());
        tunnel.set_biz_status(remote_status("biz-a", "1.0", BizState::Activated));
        let handler = UninstallHandler {
            tunnel: tunnel.clone(),
            node_name: "node-1".to_string(),
        };

        handler.handle("biz-a:1.0").await.unwrap();

        let stops = tunnel.stop_calls();
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].biz_key, "biz-a:1.0");
        assert_eq!(stops[0].pod_key, "ns1/pod1");
    }

    #[tokio::test]
    async fn uninstall_is_noop_for_absent_module() {
        let tunnel = Arc::new(MockTunnel::new());
        let handler = UninstallHandler {
            tunnel: tunnel.clone(),
            node_name: "node-1".to_string(),
        };

        handler.handle("biz-a:1.0").await.unwrap();
        assert!(tunnel.stop_calls().is_empty());
    }
}
