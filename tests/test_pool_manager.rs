use std::collections::BTreeMap;
use std::sync::Arc;

use poolscaler::config::PoolConfig;
use poolscaler::core::node::{AgentState, Market};
use poolscaler::core::pool_manager::PoolManager;
use poolscaler::errors::PoolManagerError;
use poolscaler::metrics::collector::{InMemoryMonitoringClient, RESOURCE_GROUP_MODIFICATION_FAILED};
use poolscaler::resource_groups::registry::register_resource_group_provider;
use poolscaler::test_util::helpers::{
    default_test_pool_config, fake_agent, fake_instance, res, set_resource_groups,
    test_pool_manager, FakeClusterConnector, FakeResourceGroup, RecordingResourceGroupProvider,
};

#[test]
fn test_modify_target_capacity_without_groups_fails() {
    let mut manager = test_pool_manager(
        &default_test_pool_config(),
        FakeClusterConnector::new(),
        vec![],
    );
    assert!(matches!(
        manager.modify_target_capacity(res(10.0, 40.0), false, false, true),
        Err(PoolManagerError::NoResourceGroups)
    ));
}

#[test]
fn test_target_capacity_fails_when_all_groups_stale() {
    let mut group_a = FakeResourceGroup::new("a", res(10.0, 40.0));
    group_a.stale = true;
    let manager = test_pool_manager(
        &default_test_pool_config(),
        FakeClusterConnector::new(),
        vec![group_a],
    );
    assert!(matches!(
        manager.target_capacity(),
        Err(PoolManagerError::AllResourceGroupsAreStale)
    ));
}

#[test]
fn test_capacity_accessors_handle_stale_groups() {
    let group_a = FakeResourceGroup::new("a", res(10.0, 40.0));
    let mut group_b = FakeResourceGroup::new("b", res(30.0, 120.0));
    group_b.stale = true;

    let manager = test_pool_manager(
        &default_test_pool_config(),
        FakeClusterConnector::new(),
        vec![group_a, group_b],
    );

    // Stale groups count towards fulfilled but not target capacity.
    assert_eq!(res(10.0, 40.0), manager.target_capacity().unwrap());
    assert_eq!(res(40.0, 160.0), manager.fulfilled_capacity());
}

#[test]
fn test_non_orphan_fulfilled_capacity_excludes_orphans_and_unknowns() {
    let mut connector = FakeClusterConnector::new();
    let mut group = FakeResourceGroup::new("a", res(20.0, 80.0));
    group.instances.push(fake_instance("a", "a-1", "10.0.0.1"));
    group.instances.push(fake_instance("a", "a-2", "10.0.0.2"));
    group.instances.push(fake_instance("a", "a-3", "10.0.0.3"));
    // a-4 is not in AWS state "running" and never counts.
    let mut stopped = fake_instance("a", "a-4", "10.0.0.4");
    stopped.state = "stopped".to_string();
    group.instances.push(stopped);

    connector.insert("10.0.0.1", fake_agent(AgentState::Running, res(5.0, 20.0)));
    connector.insert("10.0.0.2", fake_agent(AgentState::Orphaned, res(5.0, 20.0)));
    connector.insert("10.0.0.4", fake_agent(AgentState::Running, res(5.0, 20.0)));
    // 10.0.0.3 is not registered with the scheduler at all: Unknown.

    let manager = test_pool_manager(&default_test_pool_config(), connector, vec![group]);
    assert_eq!(res(5.0, 20.0), manager.non_orphan_fulfilled_capacity);
}

#[test]
fn test_get_node_metadatas_joins_agents_by_ip() {
    let mut connector = FakeClusterConnector::new();
    let mut group = FakeResourceGroup::new("a", res(10.0, 40.0));
    group.instances.push(fake_instance("a", "a-1", "10.0.0.1"));
    group.instances.push(fake_instance("a", "a-2", "10.0.0.2"));
    connector.insert("10.0.0.1", fake_agent(AgentState::Idle, res(5.0, 20.0)));

    let manager = test_pool_manager(&default_test_pool_config(), connector, vec![group]);

    let metadatas = manager.get_node_metadatas(None);
    assert_eq!(2, metadatas.len());
    assert_eq!(AgentState::Idle, metadatas[0].agent.state);
    assert_eq!(res(5.0, 20.0), metadatas[0].agent.total_resources);
    assert_eq!(AgentState::Unknown, metadatas[1].agent.state);

    let running_only = manager.get_node_metadatas(Some(&["stopped"]));
    assert!(running_only.is_empty());
}

#[test]
fn test_get_market_capacities_sums_and_filters() {
    let us_west = Market::new("m5.large", "us-west-2a");
    let us_east = Market::new("m5.large", "us-east-1a");

    let mut group_a = FakeResourceGroup::new("a", res(10.0, 40.0));
    group_a.markets.insert(us_west.clone(), res(10.0, 40.0));
    let mut group_b = FakeResourceGroup::new("b", res(10.0, 40.0));
    group_b.markets.insert(us_west.clone(), res(5.0, 20.0));
    group_b.markets.insert(us_east.clone(), res(2.0, 8.0));

    let manager = test_pool_manager(
        &default_test_pool_config(),
        FakeClusterConnector::new(),
        vec![group_a, group_b],
    );

    let capacities = manager.get_market_capacities(None);
    assert_eq!(res(15.0, 60.0), capacities[&us_west]);
    assert_eq!(res(2.0, 8.0), capacities[&us_east]);

    let filtered = manager.get_market_capacities(Some(&[us_east.clone()]));
    assert_eq!(1, filtered.len());
    assert_eq!(res(2.0, 8.0), filtered[&us_east]);
}

#[test]
fn test_group_modification_failure_is_counted_and_skipped() {
    let mut group_a = FakeResourceGroup::new("a", res(10.0, 40.0));
    group_a.scale_up_option = Some(res(5.0, 20.0));
    group_a.fail_modification = true;
    let mut group_b = FakeResourceGroup::new("b", res(10.0, 40.0));
    group_b.scale_up_option = Some(res(5.0, 20.0));
    let b_calls = group_b.modify_calls.clone();

    let monitoring = InMemoryMonitoringClient::new();
    let mut manager = PoolManager::new(
        "test-cluster",
        "test-pool",
        &default_test_pool_config(),
        Box::new(FakeClusterConnector::new()),
        None,
        Box::new(monitoring.clone()),
    );
    set_resource_groups(&mut manager, vec![group_a, group_b]);

    let new_target = manager
        .modify_target_capacity(res(40.0, 160.0), false, false, false)
        .unwrap();
    assert_eq!(res(40.0, 160.0), new_target);

    // Group b still got its share applied.
    assert_eq!(1, b_calls.borrow().len());

    let dimensions = BTreeMap::from([
        ("cluster".to_string(), "test-cluster".to_string()),
        ("pool".to_string(), "test-pool".to_string()),
    ]);
    assert_eq!(
        1,
        monitoring.count_for(RESOURCE_GROUP_MODIFICATION_FAILED, &dimensions)
    );
}

#[test]
fn test_modify_target_capacity_dry_run_changes_nothing() {
    let mut group_a = FakeResourceGroup::new("a", res(10.0, 40.0));
    group_a.scale_up_option = Some(res(5.0, 20.0));
    let a_calls = group_a.modify_calls.clone();
    let terminated = group_a.terminated.clone();

    let mut manager = test_pool_manager(
        &default_test_pool_config(),
        FakeClusterConnector::new(),
        vec![group_a],
    );

    let new_target = manager
        .modify_target_capacity(res(20.0, 80.0), true, false, true)
        .unwrap();
    assert_eq!(res(20.0, 80.0), new_target);

    // The group saw the dry-run call but its live target is untouched.
    assert_eq!(1, a_calls.borrow().len());
    assert_eq!(res(10.0, 40.0), manager.target_capacity().unwrap());
    assert!(terminated.borrow().is_empty());
}

#[test]
fn test_reload_resource_groups_skips_bad_entries() {
    let provider = Arc::new(RecordingResourceGroupProvider::new("fake-reload"));
    register_resource_group_provider("fake-reload", provider);

    let group_ids: serde_yaml::Value =
        serde_yaml::from_str("group_ids: [reload-1, reload-2]").unwrap();
    let malformed: serde_yaml::Value = serde_yaml::from_str("group_ids: 17").unwrap();
    let config = PoolConfig {
        draining_enabled: false,
        scaling_limits: default_test_pool_config().scaling_limits,
        resource_groups: vec![
            BTreeMap::from([("fake-reload".to_string(), group_ids)]),
            // Unknown tag: logged and skipped.
            BTreeMap::from([("no-such-backend".to_string(), serde_yaml::Value::Null)]),
            // Multi-key mapping: malformed, skipped.
            BTreeMap::from([
                ("x".to_string(), serde_yaml::Value::Null),
                ("y".to_string(), serde_yaml::Value::Null),
            ]),
            // Provider rejects the config: logged and skipped.
            BTreeMap::from([("fake-reload".to_string(), malformed)]),
        ],
    };

    let mut manager = PoolManager::new(
        "test-cluster",
        "test-pool",
        &config,
        Box::new(FakeClusterConnector::new()),
        None,
        Box::new(InMemoryMonitoringClient::new()),
    );
    manager.reload_state().unwrap();

    assert_eq!(
        vec!["reload-1", "reload-2"],
        manager.resource_groups.keys().collect::<Vec<_>>()
    );
}

#[test]
fn test_mark_stale_skips_unsupported_groups() {
    let group_a = FakeResourceGroup::new("a", res(10.0, 40.0));
    let mut group_b = FakeResourceGroup::new("b", res(10.0, 40.0));
    group_b.supports_mark_stale = false;

    let mut manager = test_pool_manager(
        &default_test_pool_config(),
        FakeClusterConnector::new(),
        vec![group_a, group_b],
    );

    manager.mark_stale(false).unwrap();
    assert!(manager.resource_groups["a"].is_stale());
    assert!(!manager.resource_groups["b"].is_stale());
}
