//! The provider façade.
//!
//! Projects pods onto the remote base: every module container becomes an
//! install/uninstall operation against the tunnel, serialized through the
//! two operation queues and guarded by the per-module revision map. The
//! reconciler drives the pod entry points; tunnel callbacks drive the
//! status sync entry points; both meet in the store.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use modulet_api::{
    pod_key, BizState, BizStatusData, Container, ContainerState, MetricFamily, NodeStats, Pod,
    PodReference, PodStats, PodStatus, StatsSummary, POD_REVISION_ANNOTATION, TRACE_ID_LABEL,
};
use modulet_workqueue::{OperationQueue, RetryPolicy};

use crate::cluster::{ClusterClient, ClusterError};
use crate::error::{ProviderError, Result};
use crate::operations::{InstallHandler, UninstallHandler};
use crate::status::build_pod_status;
use crate::store::PodStore;
use crate::tracker::{
    NoopTracker, Tracker, EVENT_CONTAINER_START, EVENT_CONTAINER_STOP, EVENT_POD_UPDATE,
    SCENE_MODULE_DEPLOY,
};
use crate::tunnel::Tunnel;

/// Callback informing the virtual-kubelet host that a pod changed.
pub type PodNotifier = Arc<dyn Fn(Pod) + Send + Sync>;

/// Tunables for the provider façade.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub namespace: String,

    pub node_name: String,

    /// Address reported as the pod IP; modules share the base's network.
    pub local_ip: String,

    /// How long a replacement waits for the stopped containers to show
    /// terminated upstream before abandoning the pending starts.
    pub stop_wait_timeout: Duration,

    /// Poll cadence for that wait.
    pub stop_wait_interval: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            node_name: "modulet-node".to_string(),
            local_ip: "127.0.0.1".to_string(),
            stop_wait_timeout: Duration::from_secs(60),
            stop_wait_interval: Duration::from_secs(1),
        }
    }
}

/// The pod-to-module provider engine.
pub struct ModuleProvider {
    config: ProviderConfig,
    store: Arc<PodStore>,
    tunnel: Arc<dyn Tunnel>,
    cluster: Arc<dyn ClusterClient>,
    tracker: Arc<dyn Tracker>,
    install_queue: Arc<OperationQueue>,
    uninstall_queue: Arc<OperationQueue>,
    notify: RwLock<Option<PodNotifier>>,
}

impl ModuleProvider {
    pub fn new(
        config: ProviderConfig,
        tunnel: Arc<dyn Tunnel>,
        cluster: Arc<dyn ClusterClient>,
    ) -> Self {
        let store = Arc::new(PodStore::new());

        let install_queue = OperationQueue::new(
            "module_install",
            Arc::new(InstallHandler {
                store: store.clone(),
                tunnel: tunnel.clone(),
                node_name: config.node_name.clone(),
            }),
            RetryPolicy::default(),
        );
        let uninstall_queue = OperationQueue::new(
            "module_uninstall",
            Arc::new(UninstallHandler {
                tunnel: tunnel.clone(),
                node_name: config.node_name.clone(),
            }),
            RetryPolicy::default(),
        );

        Self {
            config,
            store,
            tunnel,
            cluster,
            tracker: Arc::new(NoopTracker),
            install_queue,
            uninstall_queue,
            notify: RwLock::new(None),
        }
    }

    /// Replaces the no-op tracker.
    pub fn with_tracker(mut self, tracker: Arc<dyn Tracker>) -> Self {
        self.tracker = tracker;
        self
    }

    /// The underlying store, exposed for read access and tests.
    pub fn store(&self) -> &Arc<PodStore> {
        &self.store
    }

    /// Starts the install/uninstall queue workers.
    pub fn run(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            self.install_queue.clone().run(shutdown.clone()),
            self.uninstall_queue.clone().run(shutdown),
        ]
    }

    /// Registers the upstream callback invoked whenever a pod snapshot
    /// changes.
    pub fn notify_pods(&self, callback: impl Fn(Pod) + Send + Sync + 'static) {
        *self.notify.write().unwrap() = Some(Arc::new(callback));
    }

    fn notify(&self, pod: &Pod) {
        let callback = self.notify.read().unwrap().clone();
        if let Some(callback) = callback {
            callback(pod.clone());
        }
    }

    fn trace_id(pod: &Pod) -> &str {
        pod.metadata
            .labels
            .get(TRACE_ID_LABEL)
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Revision carried by the pod annotation, if present and parseable.
    fn annotated_revision(pod: &Pod) -> Option<i64> {
        let raw = pod.metadata.annotations.get(POD_REVISION_ANNOTATION)?;
        match raw.parse::<i64>() {
            Ok(revision) => Some(revision),
            Err(err) => {
                warn!(
                    pod_key = %pod_key(pod),
                    revision = %raw,
                    error = %err,
                    "failed to parse pod revision annotation"
                );
                None
            }
        }
    }

    /// Claims `biz_key` for a start path. A pod without a usable
    /// annotation still claims the module: a wall-clock revision strictly
    /// greater than the current claim is synthesized.
    async fn claim_module_revision(&self, biz_key: &str, annotated: Option<i64>) -> i64 {
        let requested = match annotated {
            Some(revision) => revision,
            None => {
                let current = self.store.get_biz_revision(biz_key).await;
                Utc::now()
                    .timestamp_nanos_opt()
                    .unwrap_or(0)
                    .max(current + 1)
            }
        };
        self.store.advance_biz_revision(biz_key, requested).await
    }

    /// Stores the pod and schedules an install for each of its modules.
    pub async fn create_pod(&self, pod: Pod) -> Result<()> {
        let key = pod_key(&pod);
        info!(pod_key = %key, "CreatePodStarted");

        // Store first so the async install handlers can see the model.
        self.store.put_pod(pod.clone()).await;

        let annotated = Self::annotated_revision(&pod);
        for container in &pod.spec.containers {
            let biz_key = self.tunnel.biz_unique_key(container);
            let revision = self.claim_module_revision(&biz_key, annotated).await;

            info!(pod_key = %key, biz_key = %biz_key, revision, "StartingModule");
            self.install_queue.enqueue(biz_key);
        }

        self.tracker.event(
            Self::trace_id(&pod),
            SCENE_MODULE_DEPLOY,
            EVENT_CONTAINER_START,
            &pod.metadata.labels,
        );
        self.notify(&pod);
        Ok(())
    }

    /// Applies a new pod snapshot.
    ///
    /// Containers present in both specs with any changed field are
    /// replaced stop-then-start (stop uses the old spec, start the new);
    /// additions are started, removals stopped. When anything was
    /// stopped, the starts are released only after the upstream cluster
    /// observes the stopped containers terminated.
    pub async fn update_pod(&self, pod: Pod) -> Result<()> {
        let key = pod_key(&pod);
        info!(pod_key = %key, "UpdatePodStarted");

        if pod.metadata.deletion_timestamp.is_some() {
            // The host follows up with DeletePod for these.
            debug!(pod_key = %key, "skipping update for pod in deletion");
            return Ok(());
        }

        let Some(old_pod) = self.store.get_pod_by_key(&key).await else {
            return Err(ProviderError::PodNotFound(key));
        };

        let annotated = Self::annotated_revision(&pod);

        let old_by_name: HashMap<&str, &Container> = old_pod
            .spec
            .containers
            .iter()
            .map(|c| (c.name.as_str(), c))
            .collect();
        let new_by_name: HashMap<&str, &Container> = pod
            .spec
            .containers
            .iter()
            .map(|c| (c.name.as_str(), c))
            .collect();

        let mut to_stop: Vec<Container> = Vec::new();
        let mut to_start: Vec<Container> = Vec::new();
        for (name, old_container) in &old_by_name {
            match new_by_name.get(name) {
                Some(new_container) if *new_container != *old_container => {
                    to_stop.push((*old_container).clone());
                    to_start.push((*new_container).clone());
                }
                Some(_) => {}
                None => to_stop.push((*old_container).clone()),
            }
        }
        for (name, new_container) in &new_by_name {
            if !old_by_name.contains_key(name) {
                to_start.push((*new_container).clone());
            }
        }

        // Stops are always enqueued before any start is released.
        if !to_stop.is_empty() {
            self.stop_modules(&old_pod, &to_stop).await;
        }

        // Advance the revision claim for every module in the new spec.
        // An update is a start path, so a missing annotation synthesizes
        // here exactly as it does on create.
        for container in &pod.spec.containers {
            let biz_key = self.tunnel.biz_unique_key(container);
            let revision = self.claim_module_revision(&biz_key, annotated).await;
            debug!(pod_key = %key, biz_key = %biz_key, revision, "UpdatedModuleRevision");
        }

        self.store.put_pod(pod.clone()).await;

        if to_start.is_empty() {
            self.notify(&pod);
            return Ok(());
        }

        let released = to_stop.is_empty() || self.await_containers_terminated(&pod, &to_stop).await;
        if released {
            for container in &to_start {
                let biz_key = self.tunnel.biz_unique_key(container);
                info!(pod_key = %key, biz_key = %biz_key, "StartingModule");
                self.install_queue.enqueue(biz_key);
            }
            self.tracker.event(
                Self::trace_id(&pod),
                SCENE_MODULE_DEPLOY,
                EVENT_POD_UPDATE,
                &pod.metadata.labels,
            );
        } else {
            error!(pod_key = %key, "stop of replaced containers not observed, not starting new containers");
            self.tracker.error(
                Self::trace_id(&pod),
                SCENE_MODULE_DEPLOY,
                EVENT_POD_UPDATE,
                "stop of replaced containers not observed",
                &pod.metadata.labels,
            );
        }

        self.notify(&pod);
        Ok(())
    }

    /// Removes the pod and schedules revision-guarded uninstalls for its
    /// modules.
    pub async fn delete_pod(&self, pod: Pod) -> Result<()> {
        let key = pod_key(&pod);
        info!(pod_key = %key, "DeletePodStarted");

        self.store.delete_pod(&key).await;
        self.stop_modules(&pod, &pod.spec.containers).await;
        self.notify(&pod);
        Ok(())
    }

    /// Enqueues revision-guarded uninstalls for the given containers.
    /// A stop whose pod revision predates the module's current claim is
    /// skipped: a stale pod cannot tear down a module a newer pod owns.
    async fn stop_modules(&self, pod: &Pod, containers: &[Container]) {
        let key = pod_key(pod);
        let pod_revision = Self::annotated_revision(pod).unwrap_or(0);

        for container in containers {
            let biz_key = self.tunnel.biz_unique_key(container);
            if !self.store.should_delete_biz(&biz_key, pod_revision).await {
                let current = self.store.get_biz_revision(&biz_key).await;
                info!(
                    pod_key = %key,
                    biz_key = %biz_key,
                    pod_revision,
                    current_revision = current,
                    "SkippingStaleModuleStop"
                );
                continue;
            }

            info!(pod_key = %key, biz_key = %biz_key, "StoppingModule");
            self.uninstall_queue.enqueue(biz_key);
        }

        self.tracker.event(
            Self::trace_id(pod),
            SCENE_MODULE_DEPLOY,
            EVENT_CONTAINER_STOP,
            &pod.metadata.labels,
        );
    }

    /// Polls the upstream cluster until every stopped container reports
    /// terminated. Returns false when the wait is abandoned: the pod is
    /// gone upstream, or the deadline passed.
    async fn await_containers_terminated(&self, pod: &Pod, stopped: &[Container]) -> bool {
        let key = pod_key(pod);
        let deadline = tokio::time::Instant::now() + self.config.stop_wait_timeout;

        loop {
            match self
                .cluster
                .get_pod(&pod.metadata.namespace, &pod.metadata.name)
                .await
            {
                Ok(upstream) => {
                    let all_terminated = stopped.iter().all(|container| {
                        upstream
                            .status
                            .container_statuses
                            .iter()
                            .find(|cs| cs.name == container.name)
                            // A container the cluster no longer reports
                            // counts as stopped.
                            .map_or(true, |cs| {
                                matches!(cs.state, Some(ContainerState::Terminated { .. }))
                            })
                    });
                    if all_terminated {
                        return true;
                    }
                }
                Err(ClusterError::NotFound { .. }) => {
                    warn!(pod_key = %key, "pod disappeared upstream during replacement wait");
                    return false;
                }
                Err(err) => {
                    warn!(pod_key = %key, error = %err, "failed to read pod from cluster, will retry");
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.config.stop_wait_interval).await;
        }
    }

    /// Returns the observed pod so the outer control loop can diff against
    /// it.
    pub async fn get_pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.store
            .get_pod_by_key(&format!("{namespace}/{name}"))
            .await
    }

    pub async fn get_pods(&self) -> Vec<Pod> {
        self.store.get_pods().await
    }

    /// Recomputes the pod status from the stored snapshot.
    pub async fn get_pod_status(&self, namespace: &str, name: &str) -> Result<PodStatus> {
        let key = format!("{namespace}/{name}");
        let pod = self
            .store
            .get_pod_by_key(&key)
            .await
            .ok_or(ProviderError::PodNotFound(key))?;
        Ok(build_pod_status(&self.config.local_ip, &pod, None))
    }

    /// Entry point for a single module status arriving from the tunnel.
    pub async fn sync_biz_status(&self, status: BizStatusData) {
        if status.revision > 0 {
            self.store
                .update_biz_revision(&status.key, status.revision)
                .await;
            info!(biz_key = %status.key, revision = status.revision, "UpdatedModuleRevision");
        }

        let Some(pod) = self.store.get_pod_by_key(&status.pod_key).await else {
            error!(
                biz_key = %status.key,
                pod_key = %status.pod_key,
                "skip updating status for unknown pod"
            );
            return;
        };

        let need_sync = self
            .store
            .check_container_status_need_sync(&pod, &status)
            .await;
        debug!(
            pod_key = %status.pod_key,
            biz_key = %status.key,
            need_sync,
            "module status checked"
        );
        if need_sync {
            self.sync_to_kube(&status).await;
        }
    }

    /// Entry point for a full module status snapshot.
    pub async fn sync_all_biz_status(&self, statuses: Vec<BizStatusData>) {
        let mut by_key: HashMap<String, BizStatusData> = HashMap::new();
        for status in statuses {
            if status.revision > 0 {
                self.store
                    .update_biz_revision(&status.key, status.revision)
                    .await;
                info!(biz_key = %status.key, revision = status.revision, "UpdatedModuleRevision");
            }
            by_key.insert(status.key.clone(), status);
        }

        let mut pods = self.store.get_pods().await;
        pods.sort_by_key(|p| std::cmp::Reverse(p.metadata.creation_timestamp));

        let now = Utc::now();
        let mut to_sync: Vec<BizStatusData> = Vec::new();
        for pod in pods {
            let key = pod_key(&pod);
            for container in &pod.spec.containers {
                let biz_key = self.tunnel.biz_unique_key(container);
                let status = match by_key.get(&biz_key) {
                    Some(status) => status.clone(),
                    // A module the base did not report is treated as not
                    // resolved yet.
                    None => BizStatusData {
                        key: biz_key.clone(),
                        name: container.name.clone(),
                        pod_key: key.clone(),
                        state: BizState::Unresolved,
                        change_time: now,
                        reason: None,
                        message: None,
                        revision: self.store.get_biz_revision(&biz_key).await,
                    },
                };

                let need_sync = self
                    .store
                    .check_container_status_need_sync(&pod, &status)
                    .await;
                debug!(pod_key = %key, biz_key = %biz_key, need_sync, "module status checked");
                if need_sync {
                    to_sync.push(status);
                }
            }
        }

        for status in to_sync {
            self.sync_to_kube(&status).await;
        }
    }

    /// Rebuilds the pod status from the observation, stores it, and pushes
    /// the pod upstream.
    async fn sync_to_kube(&self, status: &BizStatusData) {
        let Some(pod) = self.store.get_pod_by_key(&status.pod_key).await else {
            error!(
                biz_key = %status.key,
                pod_key = %status.pod_key,
                "skip updating status for unknown pod"
            );
            return;
        };

        let pod_status = build_pod_status(&self.config.local_ip, &pod, Some(status));
        let mut updated = pod;
        updated.status = pod_status;
        self.store.put_pod(updated.clone()).await;
        self.notify(&updated);
    }

    /// The base offers no exec channel.
    pub fn run_in_container(
        &self,
        _namespace: &str,
        _name: &str,
        _container: &str,
        _command: &[String],
    ) -> Result<()> {
        Err(ProviderError::Unsupported("run in container"))
    }

    pub fn attach_to_container(
        &self,
        _namespace: &str,
        _name: &str,
        _container: &str,
    ) -> Result<()> {
        Err(ProviderError::Unsupported("attach to container"))
    }

    pub fn port_forward(&self, _namespace: &str, _name: &str, _port: i32) -> Result<()> {
        Err(ProviderError::Unsupported("port forward"))
    }

    /// Module logs are not streamed through the provider; callers get an
    /// empty stream.
    pub fn get_container_logs(
        &self,
        _namespace: &str,
        _name: &str,
        _container: &str,
    ) -> impl tokio::io::AsyncRead + Send + Unpin {
        tokio::io::empty()
    }

    /// Node stats shell: the pod list with no resource counters.
    pub async fn get_stats_summary(&self) -> StatsSummary {
        let pods = self.store.get_pods().await;
        StatsSummary {
            node: NodeStats {
                node_name: self.config.node_name.clone(),
                start_time: None,
            },
            pods: pods
                .iter()
                .map(|p| PodStats {
                    pod_ref: PodReference {
                        name: p.metadata.name.clone(),
                        namespace: p.metadata.namespace.clone(),
                    },
                    start_time: p.metadata.creation_timestamp,
                })
                .collect(),
        }
    }

    /// Resource metrics are not collected.
    pub fn get_metrics_resource(&self) -> Vec<MetricFamily> {
        Vec::new()
    }
}
