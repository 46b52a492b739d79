//! Error types shared across the crate.

use thiserror::Error;

/// Failures surfaced by a resource group backend.
#[derive(Debug, Error)]
pub enum ResourceGroupError {
    #[error("failed to modify target capacity: {0}")]
    ModificationFailed(String),
    #[error("failed to terminate instances: {0}")]
    TerminationFailed(String),
    #[error("mark_stale is not supported by this resource group")]
    MarkStaleUnsupported,
    #[error("malformed resource group config: {0}")]
    MalformedConfig(String),
    #[error("unknown resource group type: {0}")]
    UnknownGroupType(String),
}

/// Failures from the cluster connector.
#[derive(Debug, Error)]
#[error("cluster connector failure: {0}")]
pub struct ClusterConnectorError(pub String);

/// Whole-pool failures. Per-group failures are handled locally and never
/// become a `PoolManagerError`.
#[derive(Debug, Error)]
pub enum PoolManagerError {
    #[error("no resource groups available")]
    NoResourceGroups,
    #[error("every resource group in the pool is stale")]
    AllResourceGroupsAreStale,
    #[error(transparent)]
    Connector(#[from] ClusterConnectorError),
    #[error(transparent)]
    ResourceGroup(#[from] ResourceGroupError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Failures from the message-queue transport.
#[derive(Debug, Error)]
#[error("queue operation failed: {0}")]
pub struct QueueError(pub String);

/// Failures from the cluster operator API.
#[derive(Debug, Error)]
#[error("operator call failed: {0}")]
pub struct OperatorError(pub String);

/// Failures while bootstrapping the drain worker.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("failed to read config from {path}: {reason}")]
    ConfigUnreadable { path: String, reason: String },
    #[error("no such cluster in config: {0}")]
    UnknownCluster(String),
}
