//! Shared fixtures: fake backends and builders used by unit and
//! integration tests.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;

use crate::config::{PoolConfig, ScalingLimits};
use crate::core::cluster_connector::ClusterConnector;
use crate::core::node::{AgentMetadata, AgentState, InstanceMetadata, Market, NodeMetadata};
use crate::core::pool_manager::PoolManager;
use crate::core::resources::Resources;
use crate::errors::{ClusterConnectorError, ResourceGroupError};
use crate::metrics::collector::NoopMonitoringClient;
use crate::resource_groups::interface::{ResourceGroup, ResourceGroupActions};
use crate::resource_groups::registry::ResourceGroupProvider;

/// Shorthand for a cpus/mem-only vector.
pub fn res(cpus: f64, mem: f64) -> Resources {
    Resources::new(cpus, mem, 0.0, 0.0)
}

pub fn default_test_scaling_limits() -> ScalingLimits {
    serde_yaml::from_str(
        r#"
        min_capacity_cpus: 0
        min_capacity_mem: 0
        min_capacity_disk: 0
        min_capacity_gpus: 0
        max_capacity_cpus: 100
        max_capacity_mem: 400
        max_capacity_disk: 10000
        max_capacity_gpus: 80
        max_cpus_to_add: 20
        max_mem_to_add: 80
        max_disk_to_add: 2000
        max_gpus_to_add: 16
        max_cpus_to_remove: 100
        max_mem_to_remove: 400
        max_disk_to_remove: 10000
        max_gpus_to_remove: 80
        max_tasks_to_kill: inf
        "#,
    )
    .unwrap()
}

pub fn default_test_pool_config() -> PoolConfig {
    PoolConfig {
        draining_enabled: false,
        scaling_limits: default_test_scaling_limits(),
        resource_groups: Vec::new(),
    }
}

pub fn fake_instance(group_id: &str, instance_id: &str, ip: &str) -> InstanceMetadata {
    InstanceMetadata {
        group_id: group_id.to_string(),
        hostname: Some(format!("{}.example.com", instance_id)),
        instance_id: instance_id.to_string(),
        ip_address: Some(ip.to_string()),
        is_stale: false,
        market: Market::new("m5.large", "us-west-2a"),
        state: "running".to_string(),
        uptime: Duration::from_secs(3600),
        weight: 1.0,
    }
}

pub fn fake_agent(state: AgentState, total_resources: Resources) -> AgentMetadata {
    AgentMetadata {
        agent_id: String::new(),
        allocated_resources: Resources::default(),
        batch_task_count: 0,
        is_safe_to_kill: true,
        state,
        task_count: 0,
        total_resources,
    }
}

/// In-memory stand-in for a cloud resource group. All knobs are public;
/// recorded calls are shared so tests keep a handle after the group moves
/// into a manager.
pub struct FakeResourceGroup {
    pub id: String,
    pub tag: String,
    pub stale: bool,
    pub target: Resources,
    pub fulfilled: Resources,
    pub min: Resources,
    pub max: Resources,
    pub markets: HashMap<Market, Resources>,
    pub instances: Vec<InstanceMetadata>,
    /// Resources contributed by each scale-up candidate the group offers.
    pub scale_up_option: Option<Resources>,
    pub fail_modification: bool,
    pub supports_mark_stale: bool,
    pub modify_calls: Rc<RefCell<Vec<ResourceGroupActions>>>,
    pub terminated: Rc<RefCell<Vec<Vec<String>>>>,
}

impl FakeResourceGroup {
    pub fn new(id: &str, target: Resources) -> Self {
        Self {
            id: id.to_string(),
            tag: "sfr".to_string(),
            stale: false,
            target,
            fulfilled: target,
            min: Resources::default(),
            max: Resources::new(1000.0, 4000.0, 100000.0, 800.0),
            markets: HashMap::new(),
            instances: Vec::new(),
            scale_up_option: None,
            fail_modification: false,
            supports_mark_stale: true,
            modify_calls: Rc::new(RefCell::new(Vec::new())),
            terminated: Rc::new(RefCell::new(Vec::new())),
        }
    }
}

impl ResourceGroup for FakeResourceGroup {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_stale(&self) -> bool {
        self.stale
    }

    fn target_capacity(&self) -> Resources {
        self.target
    }

    fn fulfilled_capacity(&self) -> Resources {
        self.fulfilled
    }

    fn min_capacity(&self) -> Resources {
        self.min
    }

    fn max_capacity(&self) -> Resources {
        self.max
    }

    fn market_capacities(&self) -> HashMap<Market, Resources> {
        self.markets.clone()
    }

    fn get_instance_metadatas(&self, state_filter: Option<&[&str]>) -> Vec<InstanceMetadata> {
        self.instances
            .iter()
            .filter(|instance| {
                state_filter.map_or(true, |states| states.contains(&instance.state.as_str()))
            })
            .cloned()
            .collect()
    }

    fn scale_up_options(&self) -> Vec<NodeMetadata> {
        match self.scale_up_option {
            Some(option_resources) => vec![NodeMetadata {
                agent: fake_agent(AgentState::Unknown, option_resources),
                instance: InstanceMetadata {
                    group_id: self.id.clone(),
                    hostname: None,
                    instance_id: format!("{}-option", self.id),
                    ip_address: None,
                    is_stale: false,
                    market: Market::new("m5.large", "us-west-2a"),
                    state: "requested".to_string(),
                    uptime: Duration::from_secs(0),
                    weight: 1.0,
                },
            }],
            None => Vec::new(),
        }
    }

    fn modify_target_capacity(
        &mut self,
        actions: &ResourceGroupActions,
        dry_run: bool,
    ) -> Result<(), ResourceGroupError> {
        if self.fail_modification {
            return Err(ResourceGroupError::ModificationFailed(
                "injected failure".to_string(),
            ));
        }
        self.modify_calls.borrow_mut().push(actions.clone());
        if !dry_run {
            self.target = actions.target_capacity;
        }
        Ok(())
    }

    fn terminate_instances_by_id(
        &mut self,
        instance_ids: &[String],
    ) -> Result<Vec<String>, ResourceGroupError> {
        self.terminated.borrow_mut().push(instance_ids.to_vec());
        Ok(instance_ids.to_vec())
    }

    fn mark_stale(&mut self, dry_run: bool) -> Result<(), ResourceGroupError> {
        if !self.supports_mark_stale {
            return Err(ResourceGroupError::MarkStaleUnsupported);
        }
        if !dry_run {
            self.stale = true;
        }
        Ok(())
    }

    fn sender_tag(&self) -> &str {
        &self.tag
    }
}

#[derive(Default)]
pub struct FakeClusterConnector {
    pub agents: HashMap<String, AgentMetadata>,
}

impl FakeClusterConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, ip: &str, agent: AgentMetadata) {
        self.agents.insert(ip.to_string(), agent);
    }
}

impl ClusterConnector for FakeClusterConnector {
    fn reload_state(&mut self) -> Result<(), ClusterConnectorError> {
        Ok(())
    }

    fn get_agent_metadata(&self, ip: Option<&str>) -> AgentMetadata {
        ip.and_then(|ip| self.agents.get(ip))
            .cloned()
            .unwrap_or_default()
    }
}

/// Install fake groups into a manager and refresh the derived capacity, the
/// way `reload_state` would have.
pub fn set_resource_groups(manager: &mut PoolManager, groups: Vec<FakeResourceGroup>) {
    manager.resource_groups = groups
        .into_iter()
        .map(|group| (group.id.clone(), Box::new(group) as Box<dyn ResourceGroup>))
        .collect();
    manager.recompute_non_orphan_fulfilled_capacity();
}

pub fn test_pool_manager(
    config: &PoolConfig,
    connector: FakeClusterConnector,
    groups: Vec<FakeResourceGroup>,
) -> PoolManager {
    let mut manager = PoolManager::new(
        "test-cluster",
        "test-pool",
        config,
        Box::new(connector),
        None,
        Box::new(NoopMonitoringClient),
    );
    set_resource_groups(&mut manager, groups);
    manager
}

#[derive(Deserialize)]
struct RecordingProviderConfig {
    group_ids: Vec<String>,
}

/// Registry-side fake: loads empty groups named by the config and records
/// which instances get terminated through transient handles.
pub struct RecordingResourceGroupProvider {
    pub tag: String,
    pub terminated: Arc<Mutex<Vec<(String, Vec<String>)>>>,
}

impl RecordingResourceGroupProvider {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            terminated: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl ResourceGroupProvider for RecordingResourceGroupProvider {
    fn load(
        &self,
        _cluster: &str,
        _pool: &str,
        config: &serde_yaml::Value,
    ) -> Result<BTreeMap<String, Box<dyn ResourceGroup>>, ResourceGroupError> {
        let config: RecordingProviderConfig = serde_yaml::from_value(config.clone())
            .map_err(|e| ResourceGroupError::MalformedConfig(e.to_string()))?;
        Ok(config
            .group_ids
            .into_iter()
            .map(|group_id| {
                let group = TransientGroup {
                    id: group_id.clone(),
                    tag: self.tag.clone(),
                    terminated: self.terminated.clone(),
                };
                (group_id, Box::new(group) as Box<dyn ResourceGroup>)
            })
            .collect())
    }

    fn attach(&self, group_id: &str) -> Result<Box<dyn ResourceGroup>, ResourceGroupError> {
        Ok(Box::new(TransientGroup {
            id: group_id.to_string(),
            tag: self.tag.clone(),
            terminated: self.terminated.clone(),
        }))
    }
}

struct TransientGroup {
    id: String,
    tag: String,
    terminated: Arc<Mutex<Vec<(String, Vec<String>)>>>,
}

impl ResourceGroup for TransientGroup {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_stale(&self) -> bool {
        false
    }

    fn target_capacity(&self) -> Resources {
        Resources::default()
    }

    fn fulfilled_capacity(&self) -> Resources {
        Resources::default()
    }

    fn min_capacity(&self) -> Resources {
        Resources::default()
    }

    fn max_capacity(&self) -> Resources {
        Resources::default()
    }

    fn market_capacities(&self) -> HashMap<Market, Resources> {
        HashMap::new()
    }

    fn get_instance_metadatas(&self, _state_filter: Option<&[&str]>) -> Vec<InstanceMetadata> {
        Vec::new()
    }

    fn scale_up_options(&self) -> Vec<NodeMetadata> {
        Vec::new()
    }

    fn modify_target_capacity(
        &mut self,
        _actions: &ResourceGroupActions,
        _dry_run: bool,
    ) -> Result<(), ResourceGroupError> {
        Ok(())
    }

    fn terminate_instances_by_id(
        &mut self,
        instance_ids: &[String],
    ) -> Result<Vec<String>, ResourceGroupError> {
        self.terminated
            .lock()
            .expect("terminated record poisoned")
            .push((self.id.clone(), instance_ids.to_vec()));
        Ok(instance_ids.to_vec())
    }

    fn mark_stale(&mut self, _dry_run: bool) -> Result<(), ResourceGroupError> {
        Err(ResourceGroupError::MarkStaleUnsupported)
    }

    fn sender_tag(&self) -> &str {
        &self.tag
    }
}

/// Operator client that records every call for later assertions.
#[derive(Clone, Default)]
pub struct RecordingOperatorApi {
    pub calls: Arc<Mutex<Vec<OperatorCall>>>,
    pub fail_drain: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum OperatorCall {
    Drain {
        hosts: Vec<String>,
        start_ns: u64,
        duration_ns: u64,
    },
    Down(Vec<String>),
    Up(Vec<String>),
}

impl RecordingOperatorApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<OperatorCall> {
        self.calls.lock().expect("operator calls poisoned").clone()
    }
}

impl crate::draining::mesos::MesosOperatorApi for RecordingOperatorApi {
    fn drain(
        &self,
        hosts: &[String],
        start_ns: u64,
        duration_ns: u64,
    ) -> Result<(), crate::errors::OperatorError> {
        self.calls
            .lock()
            .expect("operator calls poisoned")
            .push(OperatorCall::Drain {
                hosts: hosts.to_vec(),
                start_ns,
                duration_ns,
            });
        if self.fail_drain {
            return Err(crate::errors::OperatorError("injected drain failure".to_string()));
        }
        Ok(())
    }

    fn down(&self, hosts: &[String]) -> Result<(), crate::errors::OperatorError> {
        self.calls
            .lock()
            .expect("operator calls poisoned")
            .push(OperatorCall::Down(hosts.to_vec()));
        Ok(())
    }

    fn up(&self, hosts: &[String]) -> Result<(), crate::errors::OperatorError> {
        self.calls
            .lock()
            .expect("operator calls poisoned")
            .push(OperatorCall::Up(hosts.to_vec()));
        Ok(())
    }
}
