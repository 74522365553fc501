//! Revision-keyed in-memory store of observed pods.

use std::collections::HashMap;

use chrono::{DateTime, Timelike, Utc};
use tokio::sync::RwLock;

use modulet_api::{
    biz_unique_key, is_biz_image, pod_key, BizStatusData, Container, ContainerState, Pod,
};

/// Thread-safe map of observed pod snapshots and module revisions.
///
/// One readers-writer lock serializes the whole store; lock windows cover
/// only the map accesses and no remote call ever runs under the lock.
/// Revision entries are created lazily and never deleted, so a stale stop
/// request can still be rejected after its pod is gone.
#[derive(Default)]
pub struct PodStore {
    inner: RwLock<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    pods: HashMap<String, Pod>,
    biz_revisions: HashMap<String, i64>,
}

impl PodStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upserts a pod snapshot under its pod key. Callers hand over their
    /// own copy; the store never shares mutable references.
    pub async fn put_pod(&self, pod: Pod) {
        let key = pod_key(&pod);
        self.inner.write().await.pods.insert(key, pod);
    }

    /// Removes a pod. Idempotent.
    pub async fn delete_pod(&self, pod_key: &str) {
        self.inner.write().await.pods.remove(pod_key);
    }

    pub async fn get_pod_by_key(&self, pod_key: &str) -> Option<Pod> {
        self.inner.read().await.pods.get(pod_key).cloned()
    }

    /// All stored snapshots, in no particular order. Callers sort by
    /// creation timestamp when ordering matters.
    pub async fn get_pods(&self) -> Vec<Pod> {
        self.inner.read().await.pods.values().cloned().collect()
    }

    /// Unconditional write. Callers that want monotonicity compute
    /// `max(current, revision)` before calling.
    pub async fn update_biz_revision(&self, biz_key: &str, revision: i64) {
        self.inner
            .write()
            .await
            .biz_revisions
            .insert(biz_key.to_string(), revision);
    }

    /// Monotonic write: raises the revision to `candidate` if that is
    /// higher than the current claim, in one lock window. Returns the
    /// stored value.
    pub async fn advance_biz_revision(&self, biz_key: &str, candidate: i64) -> i64 {
        let mut inner = self.inner.write().await;
        let entry = inner
            .biz_revisions
            .entry(biz_key.to_string())
            .or_insert(0);
        *entry = (*entry).max(candidate);
        *entry
    }

    /// Current revision for a biz key, 0 when untracked.
    pub async fn get_biz_revision(&self, biz_key: &str) -> i64 {
        self.inner
            .read()
            .await
            .biz_revisions
            .get(biz_key)
            .copied()
            .unwrap_or(0)
    }

    /// Deletion admission: allowed iff the key was never claimed or the
    /// requesting revision is at least the current one.
    pub async fn should_delete_biz(&self, biz_key: &str, revision: i64) -> bool {
        match self.inner.read().await.biz_revisions.get(biz_key) {
            None => true,
            Some(current) => revision >= *current,
        }
    }

    /// Finds the live pod and container spec backing a biz key.
    pub async fn get_biz_model(&self, biz_key: &str) -> Option<(Pod, Container)> {
        let inner = self.inner.read().await;
        for pod in inner.pods.values() {
            if let Some(container) = pod
                .spec
                .containers
                .iter()
                .find(|c| biz_unique_key(c) == biz_key)
            {
                return Some((pod.clone(), container.clone()));
            }
        }
        None
    }

    /// Whether `biz_status` differs from the last status synced for the
    /// matching container of `pod`. Updates the revision entry as a side
    /// effect when the observation carries one.
    pub async fn check_container_status_need_sync(
        &self,
        pod: &Pod,
        biz_status: &BizStatusData,
    ) -> bool {
        let mut inner = self.inner.write().await;

        let matched_status = pod
            .status
            .container_statuses
            .iter()
            .find(|cs| cs.name == biz_status.name && is_biz_image(&cs.image));
        let Some(matched_container) = pod
            .spec
            .containers
            .iter()
            .find(|c| c.name == biz_status.name)
        else {
            return false;
        };

        // Earliest representable change time when the container has never
        // reported one.
        let mut old_change_time: DateTime<Utc> = DateTime::<Utc>::UNIX_EPOCH;
        if let Some(status) = matched_status {
            match &status.state {
                Some(ContainerState::Running { started_at }) => {
                    if let Some(t) = started_at {
                        old_change_time = *t;
                    }
                }
                Some(ContainerState::Terminated { finished_at, .. }) => {
                    if let Some(t) = finished_at {
                        old_change_time = *t;
                    }
                }
                Some(ContainerState::Waiting { .. }) => {
                    if let Some(condition) = pod.status.conditions.first() {
                        if let Some(t) = condition.last_transition_time {
                            old_change_time = t;
                        }
                    }
                }
                None => {}
            }
        }

        let biz_key = biz_unique_key(matched_container);
        if !biz_key.is_empty() && biz_status.revision > 0 {
            inner.biz_revisions.insert(biz_key, biz_status.revision);
        }

        // The cluster records change times at second precision, so only
        // the seconds field takes part in the comparison.
        biz_status.change_time.second() > old_change_time.second()
    }
}
