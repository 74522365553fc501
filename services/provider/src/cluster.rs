//! Upstream cluster read path.
//!
//! During a pod replacement the provider waits for the cluster to observe
//! the old containers terminated before releasing the new ones; this is
//! the narrow client that wait consumes. Tests substitute their own
//! implementation through the [`ClusterClient`] trait.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use modulet_api::Pod;

/// Errors from cluster reads.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The pod is gone upstream. Ends the replacement wait.
    #[error("pod {namespace}/{name} not found")]
    NotFound { namespace: String, name: String },

    /// Any other transport or decoding failure; retried until the wait
    /// deadline.
    #[error("cluster request failed: {0}")]
    Transport(#[source] anyhow::Error),
}

#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetches the pod as currently observed by the cluster.
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ClusterError>;
}

/// HTTP client against the cluster API server.
pub struct HttpClusterClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpClusterClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ClusterClient for HttpClusterClient {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ClusterError> {
        let url = format!(
            "{}/api/v1/namespaces/{}/pods/{}",
            self.base_url, namespace, name
        );
        debug!(url = %url, "Fetching pod from cluster");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ClusterError::Transport(e.into()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ClusterError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ClusterError::Transport(anyhow::anyhow!(
                "cluster returned {status}: {body}"
            )));
        }

        response
            .json()
            .await
            .map_err(|e| ClusterError::Transport(e.into()))
    }
}
