//! Node model: cloud-side instance metadata joined with the scheduler-side
//! agent view.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::resources::Resources;

/// Cloud lifecycle states which count as live capacity.
pub const CLOUD_RUNNING_STATES: [&str; 1] = ["running"];

/// State of the cluster-scheduler agent running on a node.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    Orphaned,
    Running,
    /// No agent matched the instance, or the connector has no data for it.
    #[default]
    Unknown,
}

/// An instance market: the (type, zone) pair capacity is bought in.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub struct Market {
    pub instance_type: String,
    pub availability_zone: String,
}

impl Market {
    pub fn new(instance_type: &str, availability_zone: &str) -> Self {
        Self {
            instance_type: instance_type.to_string(),
            availability_zone: availability_zone.to_string(),
        }
    }
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.instance_type, self.availability_zone)
    }
}

/// What the cloud backend knows about an instance.
#[derive(Clone, Debug, PartialEq)]
pub struct InstanceMetadata {
    pub group_id: String,
    pub hostname: Option<String>,
    pub instance_id: String,
    pub ip_address: Option<String>,
    /// Whether the owning resource group has been marked for replacement.
    pub is_stale: bool,
    pub market: Market,
    /// Cloud lifecycle state, e.g. "running".
    pub state: String,
    pub uptime: Duration,
    pub weight: f64,
}

/// What the cluster connector knows about the agent on an instance.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AgentMetadata {
    pub agent_id: String,
    pub allocated_resources: Resources,
    pub batch_task_count: u64,
    pub is_safe_to_kill: bool,
    pub state: AgentState,
    pub task_count: u64,
    pub total_resources: Resources,
}

/// Joined view of one node: the instance record plus its agent record.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeMetadata {
    pub agent: AgentMetadata,
    pub instance: InstanceMetadata,
}
