//! Shared data model for the modulet virtual node.
//!
//! Defines the pod snapshot types the provider observes from the cluster,
//! the module (biz) status payloads arriving from the base side, and the
//! key helpers both sides agree on. Everything here is a plain serde value;
//! consumers clone freely and never share mutable references.

pub mod biz;
pub mod pod;
pub mod stats;

pub use biz::{
    biz_unique_key, is_biz_container, is_biz_image, split_biz_key, BaseInfo, BaseStatus, BizState,
    BizStatusData, BIZ_VERSION_ENV,
};
pub use pod::{
    pod_key, split_pod_key, ConditionStatus, Container, ContainerState, ContainerStatus, EnvVar,
    ObjectMeta, Pod, PodCondition, PodIp, PodPhase, PodSpec, PodStatus,
    CONDITION_CONTAINERS_READY, CONDITION_READY,
};
pub use stats::{MetricFamily, NodeStats, PodReference, PodStats, StatsSummary};

/// Annotation carrying the pod's monotonic revision token (textual i64).
pub const POD_REVISION_ANNOTATION: &str = "modulet.io/pod-revision";

/// Label carrying an opaque trace id forwarded to the deploy tracker.
pub const TRACE_ID_LABEL: &str = "modulet.io/trace-id";
