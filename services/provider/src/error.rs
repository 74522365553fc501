//! Error types for the provider engine.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Failures surfaced by the provider façade. Asynchronous failures inside
/// the operation queues are observable only through logs and later status
/// syncs; these variants cover the synchronous entry points.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Operation against a pod key the store has never seen.
    #[error("pod not found: {0}")]
    PodNotFound(String),

    /// The base offers no channel for this operation.
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
}
