//! Capability trait for the cluster-scheduler connector.

use crate::core::node::AgentMetadata;
use crate::errors::ClusterConnectorError;

/// Read-only view of the cluster scheduler's agents, keyed by node IP.
///
/// The connector owns a snapshot which is only refreshed by `reload_state`;
/// all other calls answer from that snapshot so a planning pass sees a
/// consistent (if slightly stale) picture of the cluster.
pub trait ClusterConnector {
    /// Refresh the agent snapshot from the cluster scheduler.
    fn reload_state(&mut self) -> Result<(), ClusterConnectorError>;

    /// Agent metadata for the node at `ip`. Nodes the scheduler does not
    /// know about (or instances with no IP yet) get a default record in
    /// state `Unknown`.
    fn get_agent_metadata(&self, ip: Option<&str>) -> AgentMetadata;
}
