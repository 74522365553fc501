//! Module (biz) status model and key derivation.
//!
//! A biz is the unit of code deployed into the remote base; within one
//! node it is identified by its biz key (`name:version`). Status
//! observations arrive from the tunnel as [`BizStatusData`] payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pod::Container;

/// Env var that pins a container's module version, overriding the image tag.
pub const BIZ_VERSION_ENV: &str = "BIZ_VERSION";

/// Runtime state of a module on the base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BizState {
    /// Known to the base but not resolved yet.
    Unresolved,
    /// Resolved and installing.
    Resolved,
    /// Running and ready.
    Activated,
    /// Stopped; may be installed again.
    Deactivated,
    /// Installed but failed.
    Broken,
}

impl std::fmt::Display for BizState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BizState::Unresolved => write!(f, "UNRESOLVED"),
            BizState::Resolved => write!(f, "RESOLVED"),
            BizState::Activated => write!(f, "ACTIVATED"),
            BizState::Deactivated => write!(f, "DEACTIVATED"),
            BizState::Broken => write!(f, "BROKEN"),
        }
    }
}

/// A module status observation arriving from the tunnel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BizStatusData {
    /// Biz key (`name:version`).
    pub key: String,

    /// Module name, matching the container name in the owning pod.
    pub name: String,

    /// Key of the pod this module belongs to.
    pub pod_key: String,

    pub state: BizState,

    /// When the base observed the state change.
    pub change_time: DateTime<Utc>,

    #[serde(default)]
    pub reason: Option<String>,

    #[serde(default)]
    pub message: Option<String>,

    /// Revision claimed by the base, 0 when the base does not track one.
    #[serde(default)]
    pub revision: i64,
}

/// Identity of a base announcing itself over the tunnel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BaseInfo {
    pub node_name: String,

    #[serde(default)]
    pub version: Option<String>,
}

/// A base heartbeat payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BaseStatus {
    pub node_name: String,

    #[serde(default)]
    pub healthy: bool,

    #[serde(default)]
    pub message: Option<String>,
}

/// Deterministic module key for a container: `name:version`.
///
/// Version resolution order: the `BIZ_VERSION` env var, then the image
/// tag, then `latest`.
pub fn biz_unique_key(container: &Container) -> String {
    let version = container
        .env
        .iter()
        .find(|e| e.name == BIZ_VERSION_ENV)
        .map(|e| e.value.clone())
        .or_else(|| image_tag(&container.image))
        .unwrap_or_else(|| "latest".to_string());
    format!("{}:{}", container.name, version)
}

/// Splits a `name:version` biz key. A key without a separator maps to
/// version `latest`.
pub fn split_biz_key(key: &str) -> (String, String) {
    match key.rsplit_once(':') {
        Some((name, version)) => (name.to_string(), version.to_string()),
        None => (key.to_string(), "latest".to_string()),
    }
}

/// Whether a container image denotes a module artifact. Only such
/// containers take part in pod phase aggregation.
pub fn is_biz_image(image: &str) -> bool {
    image.contains(".jar")
}

/// See [`is_biz_image`].
pub fn is_biz_container(container: &Container) -> bool {
    is_biz_image(&container.image)
}

fn image_tag(image: &str) -> Option<String> {
    // Only the final path segment can carry a tag; a colon earlier in the
    // reference is a registry port.
    let last_segment = image.rsplit('/').next().unwrap_or(image);
    last_segment
        .split_once(':')
        .map(|(_, tag)| tag.to_string())
        .filter(|tag| !tag.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pod::EnvVar;

    fn container(name: &str, image: &str, env: Vec<EnvVar>) -> Container {
        Container {
            name: name.to_string(),
            image: image.to_string(),
            env,
        }
    }

    #[test]
    fn biz_key_prefers_env_version() {
        let c = container(
            "biz-a",
            "repo/biz-a:2.0",
            vec![EnvVar {
                name: BIZ_VERSION_ENV.to_string(),
                value: "1.0".to_string(),
            }],
        );
        assert_eq!(biz_unique_key(&c), "biz-a:1.0");
    }

    #[test]
    fn biz_key_falls_back_to_image_tag() {
        let c = container("biz-a", "registry:5000/repo/biz-a:3.1", vec![]);
        assert_eq!(biz_unique_key(&c), "biz-a:3.1");
    }

    #[test]
    fn biz_key_defaults_to_latest() {
        let c = container("biz-a", "repo/biz-a", vec![]);
        assert_eq!(biz_unique_key(&c), "biz-a:latest");
    }

    #[test]
    fn split_biz_key_round_trip() {
        assert_eq!(
            split_biz_key("biz-a:1.0"),
            ("biz-a".to_string(), "1.0".to_string())
        );
        assert_eq!(
            split_biz_key("biz-a"),
            ("biz-a".to_string(), "latest".to_string())
        );
    }

    #[test]
    fn biz_container_detection() {
        assert!(is_biz_image("repo/biz-a-1.0.jar"));
        assert!(!is_biz_image("nginx:1.27"));
    }

    #[test]
    fn biz_state_wire_format() {
        let json = serde_json::to_string(&BizState::Activated).unwrap();
        assert_eq!(json, "\"ACTIVATED\"");

        let state: BizState = serde_json::from_str("\"DEACTIVATED\"").unwrap();
        assert_eq!(state, BizState::Deactivated);
    }
}
