//! Capability trait for cloud-managed resource groups.

use std::collections::HashMap;

use crate::core::node::{InstanceMetadata, Market, NodeMetadata};
use crate::core::resources::Resources;
use crate::errors::ResourceGroupError;

/// Per-group plan accumulator filled in by the capacity planner.
///
/// `target_capacity` is the planner's running tally for the group, not the
/// group's live target; it starts at the live target (or zero for stale
/// groups) and moves as options are applied.
#[derive(Clone, Debug, Default)]
pub struct ResourceGroupActions {
    pub to_launch: Vec<NodeMetadata>,
    pub to_terminate: Vec<NodeMetadata>,
    pub target_capacity: Resources,
}

impl ResourceGroupActions {
    pub fn new(target_capacity: Resources) -> Self {
        Self {
            to_launch: Vec::new(),
            to_terminate: Vec::new(),
            target_capacity,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to_launch.is_empty() && self.to_terminate.is_empty()
    }
}

/// A collection of cloud instances with a single target-capacity knob
/// (a spot fleet, an auto-scaling group, ...).
///
/// Implementations wrap a concrete cloud API; the pool manager only ever
/// talks to this trait.
pub trait ResourceGroup {
    /// Unique, stable identifier for the group.
    fn id(&self) -> &str;

    /// Whether the group has been marked for replacement. Stale groups are
    /// excluded from planning and have their target forced to zero.
    fn is_stale(&self) -> bool;

    fn target_capacity(&self) -> Resources;

    fn fulfilled_capacity(&self) -> Resources;

    fn min_capacity(&self) -> Resources;

    fn max_capacity(&self) -> Resources;

    /// Fulfilled capacity broken down by instance market.
    fn market_capacities(&self) -> HashMap<Market, Resources>;

    /// Instances in this group, optionally restricted to a set of cloud
    /// lifecycle states.
    fn get_instance_metadatas(&self, state_filter: Option<&[&str]>) -> Vec<InstanceMetadata>;

    /// Candidate launches the group could perform right now, one entry per
    /// launchable node shape.
    fn scale_up_options(&self) -> Vec<NodeMetadata>;

    /// Apply a planned capacity change to the cloud.
    fn modify_target_capacity(
        &mut self,
        actions: &ResourceGroupActions,
        dry_run: bool,
    ) -> Result<(), ResourceGroupError>;

    /// Terminate instances by id. Already-terminated ids are no-ops.
    fn terminate_instances_by_id(
        &mut self,
        instance_ids: &[String],
    ) -> Result<Vec<String>, ResourceGroupError>;

    /// Mark the group for replacement. Backends without that notion return
    /// [`ResourceGroupError::MarkStaleUnsupported`].
    fn mark_stale(&mut self, dry_run: bool) -> Result<(), ResourceGroupError>;

    /// Short backend tag (e.g. "sfr") used as the `Sender` attribute on
    /// drain-queue messages and to route termination back to the backend.
    fn sender_tag(&self) -> &str;
}
