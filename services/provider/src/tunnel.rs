//! Tunnel contract to the remote runtime base.
//!
//! The provider consumes this narrow capability set; transports (MQTT,
//! HTTP to a live base) implement it at a single boundary. [`MockTunnel`]
//! is the in-process implementation used by tests and standalone runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use modulet_api::{biz_unique_key, BaseInfo, BaseStatus, BizState, BizStatusData, Container};

pub type OnBaseDiscovered = Arc<dyn Fn(BaseInfo) + Send + Sync>;
pub type OnBaseStatusArrived = Arc<dyn Fn(BaseStatus) + Send + Sync>;
pub type OnAllBizStatusArrived = Arc<dyn Fn(Vec<BizStatusData>) + Send + Sync>;
pub type OnSingleBizStatusArrived = Arc<dyn Fn(BizStatusData) + Send + Sync>;

/// Callbacks a tunnel fires as base-side events arrive.
#[derive(Clone)]
pub struct TunnelCallbacks {
    pub on_base_discovered: OnBaseDiscovered,
    pub on_base_status_arrived: OnBaseStatusArrived,
    pub on_all_biz_status_arrived: OnAllBizStatusArrived,
    pub on_single_biz_status_arrived: OnSingleBizStatusArrived,
}

/// Capability set of a remote runtime base.
///
/// Every call is a blocking I/O boundary and may fail with a transport
/// error. `start_biz`/`stop_biz` must be safe to repeat: activating an
/// already activated module and deactivating one that is already gone both
/// succeed.
#[async_trait]
pub trait Tunnel: Send + Sync {
    /// Stable identifier for this tunnel implementation.
    fn key(&self) -> &str;

    /// Whether the tunnel is connected and able to carry operations.
    fn ready(&self) -> bool;

    /// Starts the transport.
    async fn start(&self) -> Result<()>;

    /// Registers the virtual node with the base side.
    async fn register_node(&self, info: &BaseInfo) -> Result<()>;

    /// Withdraws the virtual node.
    async fn unregister_node(&self, node_name: &str);

    /// Invoked when the node is declared not ready upstream.
    fn on_node_not_ready(&self, node_name: &str);

    /// Installs the status callbacks. Must happen before `start`.
    fn register_callback(&self, callbacks: TunnelCallbacks);

    /// Requests installation/activation of the module described by
    /// `container` on the base.
    async fn start_biz(&self, node_name: &str, pod_key: &str, container: &Container)
        -> Result<()>;

    /// Requests deactivation/uninstallation of the module.
    async fn stop_biz(&self, node_name: &str, pod_key: &str, container: &Container) -> Result<()>;

    /// Solicits a health heartbeat from the base.
    async fn fetch_health_data(&self, node_name: &str) -> Result<()>;

    /// Solicits a full module status snapshot, delivered asynchronously
    /// through `on_all_biz_status_arrived`.
    async fn query_all_biz_status_data(&self, node_name: &str) -> Result<()>;

    /// Point query for the current state of one module.
    async fn query_biz_status(
        &self,
        node_name: &str,
        biz_key: &str,
    ) -> Result<Option<BizStatusData>>;

    /// Deterministic module key derivation for a container.
    fn biz_unique_key(&self, container: &Container) -> String {
        biz_unique_key(container)
    }
}

/// Which tunnel operation a recorded call came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BizOp {
    Start,
    Stop,
}

/// A recorded start/stop invocation on the mock tunnel.
#[derive(Debug, Clone, PartialEq)]
pub struct BizCall {
    pub op: BizOp,
    pub node_name: String,
    pub pod_key: String,
    pub biz_key: String,
}

#[derive(Default)]
struct MockState {
    biz: HashMap<String, BizStatusData>,
    calls: Vec<BizCall>,
}

/// In-memory tunnel for tests and standalone runs.
///
/// Keeps a module table keyed by biz key: `start_biz` activates the
/// module, `stop_biz` removes it. Failure flags let tests exercise the
/// queue retry paths; calls are recorded even when they fail.
#[derive(Default)]
pub struct MockTunnel {
    state: Mutex<MockState>,
    callbacks: Mutex<Option<TunnelCallbacks>>,
    fail_starts: bool,
    fail_stops: bool,
}

impl MockTunnel {
    pub fn new() -> Self {
        Self::default()
    }

    /// A tunnel whose `start_biz` always fails.
    pub fn failing_starts() -> Self {
        Self {
            fail_starts: true,
            ..Default::default()
        }
    }

    /// A tunnel whose `stop_biz` always fails.
    pub fn failing_stops() -> Self {
        Self {
            fail_stops: true,
            ..Default::default()
        }
    }

    /// All recorded start/stop calls, in invocation order.
    pub fn calls(&self) -> Vec<BizCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn start_calls(&self) -> Vec<BizCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.op == BizOp::Start)
            .collect()
    }

    pub fn stop_calls(&self) -> Vec<BizCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.op == BizOp::Stop)
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    /// Seeds the remote module table directly.
    pub fn set_biz_status(&self, status: BizStatusData) {
        self.state
            .lock()
            .unwrap()
            .biz
            .insert(status.key.clone(), status);
    }

    /// Fires the single-status callback as if the base pushed an update.
    pub fn deliver_biz_status(&self, status: BizStatusData) {
        let callbacks = self.callbacks.lock().unwrap().clone();
        if let Some(callbacks) = callbacks {
            (callbacks.on_single_biz_status_arrived)(status);
        }
    }

    /// Fires the all-statuses callback as if the base answered a snapshot
    /// query.
    pub fn deliver_all_biz_status(&self, statuses: Vec<BizStatusData>) {
        let callbacks = self.callbacks.lock().unwrap().clone();
        if let Some(callbacks) = callbacks {
            (callbacks.on_all_biz_status_arrived)(statuses);
        }
    }
}

#[async_trait]
impl Tunnel for MockTunnel {
    fn key(&self) -> &str {
        "mock"
    }

    fn ready(&self) -> bool {
        true
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn register_node(&self, info: &BaseInfo) -> Result<()> {
        info!(node_name = %info.node_name, "[MOCK] Registering node");
        Ok(())
    }

    async fn unregister_node(&self, node_name: &str) {
        info!(node_name = %node_name, "[MOCK] Unregistering node");
    }

    fn on_node_not_ready(&self, node_name: &str) {
        debug!(node_name = %node_name, "[MOCK] Node not ready");
    }

    fn register_callback(&self, callbacks: TunnelCallbacks) {
        *self.callbacks.lock().unwrap() = Some(callbacks);
    }

    async fn start_biz(
        &self,
        node_name: &str,
        pod_key: &str,
        container: &Container,
    ) -> Result<()> {
        let biz_key = self.biz_unique_key(container);
        {
            let mut state = self.state.lock().unwrap();
            state.calls.push(BizCall {
                op: BizOp::Start,
                node_name: node_name.to_string(),
                pod_key: pod_key.to_string(),
                biz_key: biz_key.clone(),
            });
            if self.fail_starts {
                anyhow::bail!("mock tunnel configured to fail starts");
            }
            state.biz.insert(
                biz_key.clone(),
                BizStatusData {
                    key: biz_key.clone(),
                    name: container.name.clone(),
                    pod_key: pod_key.to_string(),
                    state: BizState::Activated,
                    change_time: Utc::now(),
                    reason: None,
                    message: None,
                    revision: 0,
                },
            );
        }
        debug!(biz_key = %biz_key, "[MOCK] Module activated");
        Ok(())
    }

    async fn stop_biz(&self, node_name: &str, pod_key: &str, container: &Container) -> Result<()> {
        let biz_key = self.biz_unique_key(container);
        {
            let mut state = self.state.lock().unwrap();
            state.calls.push(BizCall {
                op: BizOp::Stop,
                node_name: node_name.to_string(),
                pod_key: pod_key.to_string(),
                biz_key: biz_key.clone(),
            });
            if self.fail_stops {
                anyhow::bail!("mock tunnel configured to fail stops");
            }
            // Stopping an absent module is a no-op, not an error.
            state.biz.remove(&biz_key);
        }
        debug!(biz_key = %biz_key, "[MOCK] Module deactivated");
        Ok(())
    }

    async fn fetch_health_data(&self, _node_name: &str) -> Result<()> {
        Ok(())
    }

    async fn query_all_biz_status_data(&self, _node_name: &str) -> Result<()> {
        let statuses: Vec<BizStatusData> =
            self.state.lock().unwrap().biz.values().cloned().collect();
        self.deliver_all_biz_status(statuses);
        Ok(())
    }

    async fn query_biz_status(
        &self,
        _node_name: &str,
        biz_key: &str,
    ) -> Result<Option<BizStatusData>> {
        Ok(self.state.lock().unwrap().biz.get(biz_key).cloned())
    }
}
