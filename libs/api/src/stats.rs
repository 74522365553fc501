//! Stats and metrics shells for the node-level read endpoints.
//!
//! The provider reports the pod list without resource counters; the
//! numeric fields stay absent until a base exposes usage data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Node stats summary: the node shell plus one entry per observed pod.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsSummary {
    pub node: NodeStats,

    #[serde(default)]
    pub pods: Vec<PodStats>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeStats {
    pub node_name: String,

    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodStats {
    pub pod_ref: PodReference,

    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodReference {
    pub name: String,

    pub namespace: String,
}

/// A named metric family. The provider currently exposes none; the type
/// exists so the metrics endpoint has a stable shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricFamily {
    pub name: String,

    #[serde(default)]
    pub help: String,
}
