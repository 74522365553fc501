//! Deploy-tracking collaborator.
//!
//! The provider reports lifecycle milestones (module starts and stops,
//! pod replacements) so deploy pipelines can correlate them by the trace
//! id carried on the pod label. The default implementation discards
//! everything; hosts inject their own through
//! [`crate::provider::ModuleProvider::with_tracker`].

use std::collections::HashMap;

/// Scene under which pod deploy events are reported.
pub const SCENE_MODULE_DEPLOY: &str = "module_deploy";

pub const EVENT_CONTAINER_START: &str = "container_start";
pub const EVENT_CONTAINER_STOP: &str = "container_stop";
pub const EVENT_POD_UPDATE: &str = "pod_update";

pub trait Tracker: Send + Sync {
    /// Records a milestone.
    fn event(&self, trace_id: &str, scene: &str, event: &str, labels: &HashMap<String, String>);

    /// Records a failed milestone.
    fn error(
        &self,
        trace_id: &str,
        scene: &str,
        event: &str,
        message: &str,
        labels: &HashMap<String, String>,
    );
}

/// Tracker that discards all reports.
#[derive(Debug, Default)]
pub struct NoopTracker;

impl Tracker for NoopTracker {
    fn event(&self, _: &str, _: &str, _: &str, _: &HashMap<String, String>) {}

    fn error(&self, _: &str, _: &str, _: &str, _: &str, _: &HashMap<String, String>) {}
}
