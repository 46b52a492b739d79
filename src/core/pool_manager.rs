//! Capacity control for one pool of compute nodes backed by a set of cloud
//! resource groups.
//!
//! The manager operates on a snapshot loaded by `reload_state`: the caller
//! serializes control ticks, and a single tick never refreshes its own view.
//! Capacity changes are distributed roughly evenly across the non-stale
//! resource groups so that nodes stay diversified in the cluster.

use std::collections::{BTreeMap, HashMap};

use log::{error, info, warn};

use crate::config::PoolConfig;
use crate::core::cluster_connector::ClusterConnector;
use crate::core::node::{AgentState, Market, NodeMetadata, CLOUD_RUNNING_STATES};
use crate::core::resources::{Resources, RESOURCE_NAMES};
use crate::draining::queue::DrainingClient;
use crate::errors::{PoolManagerError, ResourceGroupError};
use crate::metrics::collector::{MonitoringClient, RESOURCE_GROUP_MODIFICATION_FAILED};
use crate::resource_groups::interface::{ResourceGroup, ResourceGroupActions};
use crate::resource_groups::registry::resource_group_provider;

/// Instances terminated per backend call when draining is disabled.
const TERMINATE_BATCH_SIZE: usize = 500;

pub struct PoolManager {
    pub cluster: String,
    pub pool: String,

    min_capacity: Resources,
    max_capacity: Resources,
    max_capacity_to_add: Resources,
    max_capacity_to_remove: Resources,
    max_tasks_to_kill: f64,
    draining_enabled: bool,
    resource_group_configs: Vec<BTreeMap<String, serde_yaml::Value>>,

    cluster_connector: Box<dyn ClusterConnector>,
    draining_client: Option<DrainingClient>,
    monitoring: Box<dyn MonitoringClient>,

    pub resource_groups: BTreeMap<String, Box<dyn ResourceGroup>>,
    /// Total resources of cloud-running nodes whose agent is known and not
    /// orphaned. Recomputed by `reload_state`.
    pub non_orphan_fulfilled_capacity: Resources,
}

impl PoolManager {
    pub fn new(
        cluster: &str,
        pool: &str,
        config: &PoolConfig,
        cluster_connector: Box<dyn ClusterConnector>,
        draining_client: Option<DrainingClient>,
        monitoring: Box<dyn MonitoringClient>,
    ) -> Self {
        let mut draining_enabled = config.draining_enabled;
        if draining_enabled && draining_client.is_none() {
            warn!("Draining enabled for {} but no draining client was provided; falling back to direct termination", pool);
            draining_enabled = false;
        }
        Self {
            cluster: cluster.to_string(),
            pool: pool.to_string(),
            min_capacity: config.scaling_limits.min_capacity(),
            max_capacity: config.scaling_limits.max_capacity(),
            max_capacity_to_add: config.scaling_limits.max_capacity_to_add(),
            max_capacity_to_remove: config.scaling_limits.max_capacity_to_remove(),
            max_tasks_to_kill: config.scaling_limits.max_tasks_to_kill,
            draining_enabled,
            resource_group_configs: config.resource_groups.clone(),
            cluster_connector,
            draining_client,
            monitoring,
            resource_groups: BTreeMap::new(),
            non_orphan_fulfilled_capacity: Resources::default(),
        }
    }

    /// Fetch any state that may have changed behind our back, but which must
    /// not change during a control tick.
    pub fn reload_state(&mut self) -> Result<(), PoolManagerError> {
        info!("Reloading cluster connector state");
        self.cluster_connector.reload_state()?;

        info!("Reloading resource groups");
        self.reload_resource_groups();

        info!("Recalculating non-orphan fulfilled capacity");
        self.recompute_non_orphan_fulfilled_capacity();
        Ok(())
    }

    /// Recompute [`Self::non_orphan_fulfilled_capacity`] from the current
    /// snapshot.
    pub fn recompute_non_orphan_fulfilled_capacity(&mut self) {
        self.non_orphan_fulfilled_capacity = self
            .get_node_metadatas(Some(&CLOUD_RUNNING_STATES))
            .into_iter()
            .filter(|node| {
                !matches!(node.agent.state, AgentState::Orphaned | AgentState::Unknown)
            })
            .map(|node| node.agent.total_resources)
            .sum();
    }

    /// Mark every group in the pool for replacement. Backends without the
    /// operation are logged and skipped.
    pub fn mark_stale(&mut self, dry_run: bool) -> Result<(), PoolManagerError> {
        if dry_run {
            warn!("Running in \"dry-run\" mode; cluster state will not be modified");
        }
        for (group_id, group) in self.resource_groups.iter_mut() {
            info!("Marking {} as stale!", group_id);
            match group.mark_stale(dry_run) {
                Ok(()) => {}
                Err(ResourceGroupError::MarkStaleUnsupported) => {
                    warn!("Skipping {}: mark_stale is not supported", group_id);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Change the desired target capacity of the pool.
    ///
    /// The requested value is clamped by the pool's scaling limits (unless
    /// `force`), distributed across the non-stale resource groups, applied
    /// per group, and finally excess fulfilled capacity is pruned (unless
    /// `prune` is off). Returns the clamped target that was actually set.
    ///
    /// A group rejecting its change does not stop the others; the failure is
    /// counted to monitoring and skipped.
    pub fn modify_target_capacity(
        &mut self,
        new_target_capacity: Resources,
        dry_run: bool,
        force: bool,
        prune: bool,
    ) -> Result<Resources, PoolManagerError> {
        if dry_run {
            warn!("Running in \"dry-run\" mode; cluster state will not be modified");
        }
        if self.resource_groups.is_empty() {
            return Err(PoolManagerError::NoResourceGroups);
        }

        let orig_target_capacity = self.target_capacity()?;
        let new_target_capacity = self.constrain_target_capacity(new_target_capacity, force)?;

        let actions = self.compute_new_resource_group_actions(new_target_capacity)?;
        for (group_id, group_actions) in &actions {
            if group_actions.is_empty() {
                continue;
            }
            let group = match self.resource_groups.get_mut(group_id) {
                Some(group) => group,
                None => continue,
            };
            if let Err(e) = group.modify_target_capacity(group_actions, dry_run) {
                error!("Failed to modify target capacity of {}: {}", group_id, e);
                let dimensions = BTreeMap::from([
                    ("cluster".to_string(), self.cluster.clone()),
                    ("pool".to_string(), self.pool.clone()),
                ]);
                self.monitoring
                    .create_counter(RESOURCE_GROUP_MODIFICATION_FAILED, &dimensions)
                    .count();
                continue;
            }
        }

        if prune {
            let group_targets = actions
                .iter()
                .map(|(group_id, group_actions)| {
                    (group_id.clone(), group_actions.target_capacity)
                })
                .collect();
            self.prune_excess_fulfilled_capacity(
                new_target_capacity,
                Some(group_targets),
                dry_run,
            )?;
        }
        info!(
            "Target capacity for {} changed from {:?} to {:?}",
            self.pool, orig_target_capacity, new_target_capacity
        );
        Ok(new_target_capacity)
    }

    /// Decrease fulfilled capacity down towards `new_target_capacity`.
    ///
    /// `group_targets` carries the per-group targets a planning pass just
    /// decided on; without it the groups' live targets are used (needed so
    /// dry runs and standalone prunes compute against the right floors).
    pub fn prune_excess_fulfilled_capacity(
        &mut self,
        new_target_capacity: Resources,
        group_targets: Option<BTreeMap<String, Resources>>,
        dry_run: bool,
    ) -> Result<(), PoolManagerError> {
        let marked_nodes_by_group =
            self.choose_nodes_to_prune(new_target_capacity, group_targets.as_ref());

        if dry_run {
            return Ok(());
        }

        if self.draining_enabled {
            let draining_client = match &self.draining_client {
                Some(client) => client,
                None => return Ok(()),
            };
            for (group_id, node_metadatas) in &marked_nodes_by_group {
                let sender = match self.resource_groups.get(group_id) {
                    Some(group) => group.sender_tag().to_string(),
                    None => continue,
                };
                for node_metadata in node_metadatas {
                    draining_client
                        .submit_instance_for_draining(&node_metadata.instance, &sender)?;
                }
            }
        } else {
            for (group_id, node_metadatas) in &marked_nodes_by_group {
                let instance_ids: Vec<String> = node_metadatas
                    .iter()
                    .map(|node_metadata| node_metadata.instance.instance_id.clone())
                    .collect();
                if let Some(group) = self.resource_groups.get_mut(group_id) {
                    for batch in instance_ids.chunks(TERMINATE_BATCH_SIZE) {
                        group.terminate_instances_by_id(batch)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Metadata for the nodes currently in the pool, each instance joined
    /// with its agent record (keyed by IP), optionally restricted to a set
    /// of cloud lifecycle states.
    pub fn get_node_metadatas(&self, state_filter: Option<&[&str]>) -> Vec<NodeMetadata> {
        self.resource_groups
            .values()
            .flat_map(|group| group.get_instance_metadatas(state_filter))
            .map(|instance| NodeMetadata {
                agent: self
                    .cluster_connector
                    .get_agent_metadata(instance.ip_address.as_deref()),
                instance,
            })
            .collect()
    }

    /// Total fulfilled capacity per market across all groups. Overlapping
    /// groups reporting the same market are summed as-is.
    pub fn get_market_capacities(
        &self,
        market_filter: Option<&[Market]>,
    ) -> HashMap<Market, Resources> {
        let mut total_market_capacities: HashMap<Market, Resources> = HashMap::new();
        for group in self.resource_groups.values() {
            for (market, capacity) in group.market_capacities() {
                if market_filter.map_or(true, |filter| filter.contains(&market)) {
                    *total_market_capacities.entry(market).or_default() += capacity;
                }
            }
        }
        total_market_capacities
    }

    /// The desired capacity of the pool: the sum over non-stale groups.
    /// There is no guarantee the fulfilled capacity matches it.
    pub fn target_capacity(&self) -> Result<Resources, PoolManagerError> {
        let non_stale_groups: Vec<_> = self
            .resource_groups
            .values()
            .filter(|group| !group.is_stale())
            .collect();
        if non_stale_groups.is_empty() {
            return Err(PoolManagerError::AllResourceGroupsAreStale);
        }
        Ok(non_stale_groups
            .iter()
            .map(|group| group.target_capacity())
            .sum())
    }

    /// The actual capacity currently live in the pool, stale groups
    /// included.
    pub fn fulfilled_capacity(&self) -> Resources {
        self.resource_groups
            .values()
            .map(|group| group.fulfilled_capacity())
            .sum()
    }

    fn reload_resource_groups(&mut self) {
        let mut resource_groups: BTreeMap<String, Box<dyn ResourceGroup>> = BTreeMap::new();
        for group_config in &self.resource_group_configs {
            if group_config.len() != 1 {
                error!("Malformed config: {:?}", group_config);
                continue;
            }
            let (group_type, backend_config) =
                group_config.iter().next().expect("len checked above");
            let provider = match resource_group_provider(group_type) {
                Some(provider) => provider,
                None => {
                    error!("Unknown resource group {}", group_type);
                    continue;
                }
            };
            match provider.load(&self.cluster, &self.pool, backend_config) {
                Ok(groups) => resource_groups.extend(groups),
                Err(e) => {
                    error!("Failed to load {} resource groups: {}", group_type, e);
                    continue;
                }
            }
        }
        info!(
            "Loaded resource groups: {:?}",
            resource_groups.keys().collect::<Vec<_>>()
        );
        self.resource_groups = resource_groups;
    }

    /// Clamp an arbitrary requested target to the pool's scaling limits.
    ///
    /// Per resource, the delta is first bounded to move towards the
    /// configured [min, max] band (even when the current target is already
    /// outside it), then bounded by the per-tick add/remove limits. With
    /// `force`, limits are bypassed with a warning.
    fn constrain_target_capacity(
        &self,
        requested_target_capacity: Resources,
        force: bool,
    ) -> Result<Resources, PoolManagerError> {
        let current = self.target_capacity()?.as_array();
        let requested = requested_target_capacity.as_array();
        let min = self.min_capacity.as_array();
        let max = self.max_capacity.as_array();
        let max_to_add = self.max_capacity_to_add.as_array();
        let max_to_remove = self.max_capacity_to_remove.as_array();

        let mut constrained = [0.0; 4];
        for (idx, resource) in RESOURCE_NAMES.iter().enumerate() {
            let requested_delta = requested[idx] - current[idx];

            let mut delta = if requested_delta > 0.0 {
                (max[idx] - current[idx]).min(requested_delta)
            } else if requested_delta < 0.0 {
                (min[idx] - current[idx]).max(requested_delta)
            } else {
                0.0
            };

            if delta > 0.0 {
                delta = max_to_add[idx].min(delta);
            } else if delta < 0.0 {
                delta = (-max_to_remove[idx]).max(delta);
            }

            let mut constrained_value = current[idx] + delta;
            if requested_delta != delta {
                if force {
                    let forced_value = current[idx] + requested_delta;
                    warn!(
                        "Forcing target {} to {} even though scaling limits would restrict to {}.",
                        resource, forced_value, constrained_value
                    );
                    constrained_value = forced_value;
                } else {
                    warn!(
                        "Requested target {} {}; restricting to {} due to scaling limits.",
                        resource, requested[idx], constrained_value
                    );
                }
            }
            constrained[idx] = constrained_value;
        }
        Ok(Resources::from_array(constrained))
    }

    /// Distribute `new_target_capacity` across the resource groups.
    ///
    /// Greedy loop: list the capacity moves that do not violate any limit
    /// and still make progress towards the target, apply the one that keeps
    /// the groups closest to a perfectly even split, repeat until no move is
    /// left. Stale groups take no moves and get a zero target.
    fn compute_new_resource_group_actions(
        &self,
        new_target_capacity: Resources,
    ) -> Result<BTreeMap<String, ResourceGroupActions>, PoolManagerError> {
        let current_target = self.target_capacity()?;

        // Scaling down runs the identical logic with the sign flipped.
        let coeff: f64 = if new_target_capacity.any_gt(&current_target) {
            1.0
        } else {
            -1.0
        };

        let mut actions: BTreeMap<String, ResourceGroupActions> = BTreeMap::new();
        for group in self.resource_groups.values() {
            let starting_target = if group.is_stale() {
                // Forced to zero; a no-op for backends that drain stale
                // groups themselves.
                Resources::default()
            } else {
                group.target_capacity()
            };
            actions.insert(
                group.id().to_string(),
                ResourceGroupActions::new(starting_target),
            );
        }

        let non_stale_count = self
            .resource_groups
            .values()
            .filter(|group| !group.is_stale())
            .count();
        let perfectly_balanced = new_target_capacity / non_stale_count as f64;

        loop {
            let options = self.planner_options(&actions, new_target_capacity, coeff);

            // Strictly-better only, so ties keep the earliest option.
            let mut best: Option<(f64, (String, NodeMetadata))> = None;
            for option in options {
                let score = balance_score(&actions, perfectly_balanced, coeff, &option);
                let better = match &best {
                    Some((best_score, _)) => score < *best_score,
                    None => true,
                };
                if better {
                    best = Some((score, option));
                }
            }

            let (group_id, option_metadata) = match best {
                Some((_, option)) => option,
                None => {
                    let total: Resources =
                        actions.values().map(|a| a.target_capacity).sum();
                    warn!(
                        "All resource groups are stale or constrained. The closest we could get to {:?} is {:?}",
                        new_target_capacity, total
                    );
                    break;
                }
            };

            if let Some(group_actions) = actions.get_mut(&group_id) {
                let change = option_metadata.agent.total_resources;
                if coeff > 0.0 {
                    group_actions.target_capacity += change;
                    group_actions.to_launch.push(option_metadata);
                } else {
                    group_actions.target_capacity -= change;
                    group_actions.to_terminate.push(option_metadata);
                }
            }
        }

        Ok(actions)
    }

    /// The capacity moves that stay within every limit and advance at least
    /// one not-yet-satisfied resource towards the target: launches drawn
    /// from the groups' scale-up options, or terminations drawn from the
    /// live node metadata.
    fn planner_options(
        &self,
        actions: &BTreeMap<String, ResourceGroupActions>,
        new_target_capacity: Resources,
        coeff: f64,
    ) -> Vec<(String, NodeMetadata)> {
        let total_target_capacity: Resources =
            actions.values().map(|a| a.target_capacity).sum();
        let mut options = Vec::new();

        if coeff > 0.0 {
            for group in self
                .resource_groups
                .values()
                .filter(|group| !group.is_stale())
            {
                let group_actions = match actions.get(group.id()) {
                    Some(group_actions) => group_actions,
                    None => continue,
                };
                for option in group.scale_up_options() {
                    let total_with_option =
                        total_target_capacity + option.agent.total_resources;
                    let group_with_option =
                        group_actions.target_capacity + option.agent.total_resources;
                    if group_with_option.all_le(&group.max_capacity())
                        && total_with_option.all_le(&self.max_capacity)
                        && total_with_option
                            .clamp(&new_target_capacity)
                            .any_gt(&total_target_capacity)
                    {
                        options.push((group.id().to_string(), option));
                    }
                }
            }
        } else {
            for option in self.get_node_metadatas(None) {
                let group_id = option.instance.group_id.clone();
                let group = match self.resource_groups.get(&group_id) {
                    Some(group) => group,
                    None => continue,
                };
                let group_actions = match actions.get(&group_id) {
                    Some(group_actions) => group_actions,
                    None => continue,
                };
                let total_with_option =
                    total_target_capacity - option.agent.total_resources;
                let group_with_option =
                    group_actions.target_capacity - option.agent.total_resources;
                if group_with_option.all_ge(&group.min_capacity())
                    && total_with_option.all_ge(&self.min_capacity)
                    && total_with_option.all_ge(&new_target_capacity)
                    && total_with_option
                        .clamp(&new_target_capacity)
                        .any_lt(&total_target_capacity)
                {
                    options.push((group_id, option));
                }
            }
        }
        options
    }

    /// Choose nodes to kill to bring fulfilled capacity down to the target.
    ///
    /// Candidates are walked in priority order and each one is skipped when
    /// killing it would
    ///   0) go over the pool's max capacity to remove,
    ///   1) push its group under that group's target,
    ///   2) kill more tasks than `max_tasks_to_kill` allows, or
    ///   3) drop non-orphan capacity under the target (non-orphans only).
    fn choose_nodes_to_prune(
        &self,
        new_target_capacity: Resources,
        group_targets: Option<&BTreeMap<String, Resources>>,
    ) -> BTreeMap<String, Vec<NodeMetadata>> {
        let live_targets: BTreeMap<String, Resources>;
        let group_targets = match group_targets {
            Some(targets) => targets,
            None => {
                live_targets = self
                    .resource_groups
                    .iter()
                    .map(|(group_id, group)| (group_id.clone(), group.target_capacity()))
                    .collect();
                &live_targets
            }
        };

        let mut curr_capacity = self.fulfilled_capacity();

        // Under-scaled on every resource: nothing to prune.
        if curr_capacity.all_le(&new_target_capacity) {
            return BTreeMap::new();
        }

        let prioritized_killable_nodes = self.get_prioritized_killable_nodes();
        info!(
            "Killable instance IDs in kill order: {:?}",
            prioritized_killable_nodes
                .iter()
                .map(|node_metadata| node_metadata.instance.instance_id.as_str())
                .collect::<Vec<_>>()
        );
        if prioritized_killable_nodes.is_empty() {
            return BTreeMap::new();
        }

        let mut rem_group_capacities: BTreeMap<String, Resources> = self
            .resource_groups
            .iter()
            .map(|(group_id, group)| (group_id.clone(), group.fulfilled_capacity()))
            .collect();

        // How much capacity is actually up and registered in the scheduler.
        let mut remaining_non_orphan_capacity = self.non_orphan_fulfilled_capacity;

        let mut marked_nodes: BTreeMap<String, Vec<NodeMetadata>> = BTreeMap::new();
        let mut removed_resources = Resources::default();
        let mut killed_task_count: u64 = 0;

        for node_metadata in prioritized_killable_nodes {
            let instance_id = node_metadata.instance.instance_id.clone();
            let group_id = node_metadata.instance.group_id.clone();
            let instance_resources = node_metadata.agent.total_resources;

            if (instance_resources + removed_resources).any_gt(&self.max_capacity_to_remove) {
                info!(
                    "Killing instance {} with resources {:?} would take us over our max_capacity_to_remove of {:?}. Skipping this instance.",
                    instance_id, instance_resources, self.max_capacity_to_remove
                );
                continue;
            }

            let group_remaining = rem_group_capacities
                .get(&group_id)
                .copied()
                .unwrap_or_default();
            let new_group_capacity = group_remaining - instance_resources;
            let group_target = group_targets.get(&group_id).copied().unwrap_or_default();
            if new_group_capacity.any_lt(&group_target) {
                info!(
                    "Resource group {} is at target capacity; skipping {}",
                    group_id, instance_id
                );
                continue;
            }

            if (killed_task_count + node_metadata.agent.task_count) as f64
                > self.max_tasks_to_kill
            {
                info!(
                    "Killing instance {} with {} tasks would take us over our max_tasks_to_kill of {}. Skipping this instance.",
                    instance_id, node_metadata.agent.task_count, self.max_tasks_to_kill
                );
                continue;
            }

            if node_metadata.agent.state != AgentState::Orphaned
                && (remaining_non_orphan_capacity - instance_resources)
                    .any_lt(&new_target_capacity)
            {
                info!(
                    "Killing instance {} with resources {:?} would take us under our target capacity for non-orphan boxes. Skipping this instance.",
                    instance_id, instance_resources
                );
                continue;
            }

            info!("Marking {} for termination", instance_id);
            rem_group_capacities.insert(group_id.clone(), new_group_capacity);
            curr_capacity -= instance_resources;
            killed_task_count += node_metadata.agent.task_count;
            removed_resources += instance_resources;
            if node_metadata.agent.state != AgentState::Orphaned {
                remaining_non_orphan_capacity -= instance_resources;
            }
            marked_nodes
                .entry(group_id)
                .or_default()
                .push(node_metadata);

            if curr_capacity.any_le(&new_target_capacity) {
                info!("Picked enough nodes to kill; finishing");
                break;
            }
        }

        marked_nodes
    }

    /// Killable nodes in the order in which they should be considered for
    /// termination.
    fn get_prioritized_killable_nodes(&self) -> Vec<NodeMetadata> {
        let mut killable_nodes: Vec<NodeMetadata> = self
            .get_node_metadatas(Some(&CLOUD_RUNNING_STATES))
            .into_iter()
            .filter(|node_metadata| self.is_node_killable(node_metadata))
            .collect();
        killable_nodes.sort_by_key(|node_metadata| {
            (
                if node_metadata.agent.state == AgentState::Orphaned {
                    0
                } else {
                    1
                },
                if node_metadata.agent.state == AgentState::Idle {
                    0
                } else {
                    1
                },
                if node_metadata.instance.is_stale { 0 } else { 1 },
                node_metadata.agent.batch_task_count,
                node_metadata.agent.task_count,
            )
        });
        killable_nodes
    }

    fn is_node_killable(&self, node_metadata: &NodeMetadata) -> bool {
        if node_metadata.agent.state == AgentState::Unknown {
            false
        } else if !node_metadata.agent.is_safe_to_kill {
            false
        } else if self.max_tasks_to_kill > node_metadata.agent.task_count as f64 {
            true
        } else {
            node_metadata.agent.task_count == 0
        }
    }
}

/// Squared percent deviation from the ideal per-group split, summed over
/// resources; the chosen option minimizes the change in deviation. Resources
/// with a zero balanced value are skipped.
fn balance_score(
    actions: &BTreeMap<String, ResourceGroupActions>,
    perfectly_balanced: Resources,
    coeff: f64,
    option: &(String, NodeMetadata),
) -> f64 {
    let (option_group, option_metadata) = option;
    let group_target = match actions.get(option_group) {
        Some(group_actions) => group_actions.target_capacity.as_array(),
        None => return f64::INFINITY,
    };
    let balanced = perfectly_balanced.as_array();
    let change = option_metadata.agent.total_resources.as_array();

    let mut score = 0.0;
    for idx in 0..balanced.len() {
        if balanced[idx] != 0.0 {
            score +=
                (group_target[idx] + coeff * change[idx] - balanced[idx]).powi(2) / balanced[idx];
            score -= (group_target[idx] - balanced[idx]).powi(2) / balanced[idx];
        }
    }
    score
}
