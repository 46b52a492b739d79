use poolscaler::core::node::AgentState;
use poolscaler::test_util::helpers::{
    default_test_pool_config, fake_agent, fake_instance, res, test_pool_manager,
    FakeClusterConnector, FakeResourceGroup,
};

#[test]
fn test_scale_up_is_balanced_across_groups() {
    let mut group_a = FakeResourceGroup::new("a", res(10.0, 40.0));
    group_a.scale_up_option = Some(res(5.0, 20.0));
    let mut group_b = FakeResourceGroup::new("b", res(10.0, 40.0));
    group_b.scale_up_option = Some(res(5.0, 20.0));
    let a_calls = group_a.modify_calls.clone();
    let b_calls = group_b.modify_calls.clone();

    let mut manager = test_pool_manager(
        &default_test_pool_config(),
        FakeClusterConnector::new(),
        vec![group_a, group_b],
    );

    let new_target = manager
        .modify_target_capacity(res(40.0, 160.0), false, false, true)
        .unwrap();
    assert_eq!(res(40.0, 160.0), new_target);

    // Each group launches two nodes and lands on an even split.
    for calls in [&a_calls, &b_calls] {
        let calls = calls.borrow();
        assert_eq!(1, calls.len());
        assert_eq!(2, calls[0].to_launch.len());
        assert!(calls[0].to_terminate.is_empty());
        assert_eq!(res(20.0, 80.0), calls[0].target_capacity);
    }
    assert_eq!(res(40.0, 160.0), manager.target_capacity().unwrap());
}

#[test]
fn test_scale_up_clamped_by_max_capacity_to_add() {
    let mut config = default_test_pool_config();
    config.scaling_limits.max_cpus_to_add = 10.0;
    config.scaling_limits.max_mem_to_add = 40.0;

    let mut group_a = FakeResourceGroup::new("a", res(10.0, 40.0));
    group_a.scale_up_option = Some(res(5.0, 20.0));
    let mut group_b = FakeResourceGroup::new("b", res(10.0, 40.0));
    group_b.scale_up_option = Some(res(5.0, 20.0));
    let a_calls = group_a.modify_calls.clone();
    let b_calls = group_b.modify_calls.clone();

    let mut manager =
        test_pool_manager(&config, FakeClusterConnector::new(), vec![group_a, group_b]);

    let new_target = manager
        .modify_target_capacity(res(100.0, 400.0), false, false, true)
        .unwrap();

    // Only one tick's worth of capacity gets added, then exactly enough
    // launches to reach it.
    assert_eq!(res(30.0, 120.0), new_target);
    for calls in [&a_calls, &b_calls] {
        let calls = calls.borrow();
        assert_eq!(1, calls.len());
        assert_eq!(1, calls[0].to_launch.len());
        assert_eq!(res(15.0, 60.0), calls[0].target_capacity);
    }
}

#[test]
fn test_scale_up_respects_group_max_capacity() {
    let mut group_a = FakeResourceGroup::new("a", res(10.0, 40.0));
    group_a.scale_up_option = Some(res(5.0, 20.0));
    group_a.max = res(15.0, 60.0);
    let mut group_b = FakeResourceGroup::new("b", res(10.0, 40.0));
    group_b.scale_up_option = Some(res(5.0, 20.0));
    let a_calls = group_a.modify_calls.clone();
    let b_calls = group_b.modify_calls.clone();

    let mut manager = test_pool_manager(
        &default_test_pool_config(),
        FakeClusterConnector::new(),
        vec![group_a, group_b],
    );

    manager
        .modify_target_capacity(res(40.0, 160.0), false, false, true)
        .unwrap();

    // Group a is capped at one launch; the remainder lands in group b as
    // far as its own limits allow.
    let a_calls = a_calls.borrow();
    let b_calls = b_calls.borrow();
    assert_eq!(res(15.0, 60.0), a_calls[0].target_capacity);
    assert_eq!(1, a_calls[0].to_launch.len());
    assert_eq!(res(25.0, 100.0), b_calls[0].target_capacity);
    assert_eq!(3, b_calls[0].to_launch.len());
}

#[test]
fn test_scale_down_terminates_evenly() {
    let mut connector = FakeClusterConnector::new();
    let mut groups = Vec::new();
    for (group_idx, group_id) in ["a", "b"].into_iter().enumerate() {
        let mut group = FakeResourceGroup::new(group_id, res(20.0, 80.0));
        for idx in 0..4 {
            let instance_id = format!("{}-{}", group_id, idx);
            let ip = format!("10.0.{}.{}", group_idx, idx);
            group.instances.push(fake_instance(group_id, &instance_id, &ip));
            connector.insert(&ip, fake_agent(AgentState::Running, res(5.0, 20.0)));
        }
        groups.push(group);
    }
    let a_calls = groups[0].modify_calls.clone();
    let b_calls = groups[1].modify_calls.clone();

    let mut manager = test_pool_manager(&default_test_pool_config(), connector, groups);

    let new_target = manager
        .modify_target_capacity(res(20.0, 80.0), false, false, false)
        .unwrap();
    assert_eq!(res(20.0, 80.0), new_target);

    for calls in [&a_calls, &b_calls] {
        let calls = calls.borrow();
        assert_eq!(1, calls.len());
        assert_eq!(2, calls[0].to_terminate.len());
        assert!(calls[0].to_launch.is_empty());
        assert_eq!(res(10.0, 40.0), calls[0].target_capacity);
    }
    assert_eq!(res(20.0, 80.0), manager.target_capacity().unwrap());
}

#[test]
fn test_stale_group_gets_no_actions() {
    let mut group_a = FakeResourceGroup::new("a", res(10.0, 40.0));
    group_a.scale_up_option = Some(res(5.0, 20.0));
    let mut group_b = FakeResourceGroup::new("b", res(10.0, 40.0));
    group_b.scale_up_option = Some(res(5.0, 20.0));
    group_b.stale = true;
    let a_calls = group_a.modify_calls.clone();
    let b_calls = group_b.modify_calls.clone();

    let mut manager = test_pool_manager(
        &default_test_pool_config(),
        FakeClusterConnector::new(),
        vec![group_a, group_b],
    );

    // Target already satisfied by the non-stale group alone.
    let new_target = manager
        .modify_target_capacity(res(10.0, 40.0), false, false, false)
        .unwrap();
    assert_eq!(res(10.0, 40.0), new_target);
    assert!(a_calls.borrow().is_empty());
    assert!(b_calls.borrow().is_empty());
    assert_eq!(res(10.0, 40.0), manager.target_capacity().unwrap());
}

#[test]
fn test_scale_up_skips_stale_groups() {
    let mut group_a = FakeResourceGroup::new("a", res(10.0, 40.0));
    group_a.scale_up_option = Some(res(5.0, 20.0));
    let mut group_b = FakeResourceGroup::new("b", res(10.0, 40.0));
    group_b.scale_up_option = Some(res(5.0, 20.0));
    group_b.stale = true;
    let a_calls = group_a.modify_calls.clone();
    let b_calls = group_b.modify_calls.clone();

    let mut manager = test_pool_manager(
        &default_test_pool_config(),
        FakeClusterConnector::new(),
        vec![group_a, group_b],
    );

    let new_target = manager
        .modify_target_capacity(res(20.0, 80.0), false, false, false)
        .unwrap();
    assert_eq!(res(20.0, 80.0), new_target);

    // All new capacity lands on the non-stale group.
    let a_calls = a_calls.borrow();
    assert_eq!(1, a_calls.len());
    assert_eq!(2, a_calls[0].to_launch.len());
    assert_eq!(res(20.0, 80.0), a_calls[0].target_capacity);
    assert!(b_calls.borrow().is_empty());
}

#[test]
fn test_planner_stops_when_no_options_remain() {
    // No scale-up options at all: the constrained target is returned but
    // nothing can move.
    let group_a = FakeResourceGroup::new("a", res(10.0, 40.0));
    let a_calls = group_a.modify_calls.clone();

    let mut manager = test_pool_manager(
        &default_test_pool_config(),
        FakeClusterConnector::new(),
        vec![group_a],
    );

    let new_target = manager
        .modify_target_capacity(res(30.0, 120.0), false, false, false)
        .unwrap();
    assert_eq!(res(30.0, 120.0), new_target);
    assert!(a_calls.borrow().is_empty());
    assert_eq!(res(10.0, 40.0), manager.target_capacity().unwrap());
}

#[test]
fn test_moving_toward_band_when_target_above_max() {
    // Current target above the pool max: even an upward request moves the
    // target back down to the band edge.
    let mut config = default_test_pool_config();
    config.scaling_limits.max_capacity_cpus = 25.0;
    config.scaling_limits.max_capacity_mem = 100.0;

    let group_a = FakeResourceGroup::new("a", res(15.0, 60.0));
    let group_b = FakeResourceGroup::new("b", res(15.0, 60.0));

    let mut manager =
        test_pool_manager(&config, FakeClusterConnector::new(), vec![group_a, group_b]);

    let new_target = manager
        .modify_target_capacity(res(40.0, 160.0), false, false, false)
        .unwrap();
    assert_eq!(res(25.0, 100.0), new_target);
}

#[test]
fn test_force_bypasses_scaling_limits() {
    let mut config = default_test_pool_config();
    config.scaling_limits.max_cpus_to_add = 5.0;

    let mut group_a = FakeResourceGroup::new("a", res(10.0, 40.0));
    group_a.scale_up_option = Some(res(5.0, 20.0));

    let mut manager = test_pool_manager(&config, FakeClusterConnector::new(), vec![group_a]);

    let new_target = manager
        .modify_target_capacity(res(40.0, 160.0), false, true, false)
        .unwrap();
    assert_eq!(res(40.0, 160.0), new_target);
}
