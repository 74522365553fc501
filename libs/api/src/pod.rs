//! Pod object model.
//!
//! The slice of the pod API the provider consumes: metadata with the
//! revision annotation and deletion timestamp, container specs, and the
//! status tree the engine writes back after translating module states.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Condition type reported when the pod as a whole is ready.
pub const CONDITION_READY: &str = "Ready";

/// Condition type reported when every module container is ready.
pub const CONDITION_CONTAINERS_READY: &str = "ContainersReady";

/// Object metadata carried by a pod snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,

    pub namespace: String,

    #[serde(default)]
    pub annotations: HashMap<String, String>,

    #[serde(default)]
    pub labels: HashMap<String, String>,

    #[serde(default)]
    pub creation_timestamp: Option<DateTime<Utc>>,

    /// Set by the cluster once the pod enters graceful deletion.
    #[serde(default)]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

/// A pod snapshot as observed from the reconciler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub spec: PodSpec,

    #[serde(default)]
    pub status: PodStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodSpec {
    #[serde(default)]
    pub containers: Vec<Container>,
}

/// A container spec. For module containers the image names the module
/// artifact and the env block may carry a version override.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,

    pub image: String,

    #[serde(default)]
    pub env: Vec<EnvVar>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,

    #[serde(default)]
    pub value: String,
}

/// Lifecycle state of a single container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Waiting {
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
    Running {
        #[serde(default)]
        started_at: Option<DateTime<Utc>>,
    },
    Terminated {
        exit_code: i32,
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        finished_at: Option<DateTime<Utc>>,
    },
}

/// Status of one container. A `None` state means the container has not
/// been initialized on the base at all.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub name: String,

    #[serde(default)]
    pub image: String,

    #[serde(default)]
    pub ready: bool,

    #[serde(default)]
    pub state: Option<ContainerState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodCondition {
    #[serde(rename = "type")]
    pub condition_type: String,

    pub status: ConditionStatus,

    #[serde(default)]
    pub last_probe_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub last_transition_time: Option<DateTime<Utc>>,
}

/// High-level pod lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl std::fmt::Display for PodPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PodPhase::Pending => write!(f, "Pending"),
            PodPhase::Running => write!(f, "Running"),
            PodPhase::Succeeded => write!(f, "Succeeded"),
            PodPhase::Failed => write!(f, "Failed"),
            PodPhase::Unknown => write!(f, "Unknown"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodIp {
    pub ip: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodStatus {
    #[serde(default)]
    pub phase: PodPhase,

    #[serde(default)]
    pub pod_ip: Option<String>,

    #[serde(default)]
    pub pod_ips: Vec<PodIp>,

    #[serde(default)]
    pub conditions: Vec<PodCondition>,

    #[serde(default)]
    pub container_statuses: Vec<ContainerStatus>,
}

/// Stable `namespace/name` identifier for a pod.
pub fn pod_key(pod: &Pod) -> String {
    format!("{}/{}", pod.metadata.namespace, pod.metadata.name)
}

/// Splits a pod key back into `(namespace, name)`. A key without a
/// separator maps to an empty namespace.
pub fn split_pod_key(key: &str) -> (String, String) {
    match key.split_once('/') {
        Some((namespace, name)) => (namespace.to_string(), name.to_string()),
        None => (String::new(), key.to_string()),
    }
}
