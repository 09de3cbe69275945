use std::time::Duration;

use crate::{
    bson::oid::ObjectId,
    error::ErrorKind,
    event::start_dispatcher,
    options::{ClientOptions, ServerAddress},
    sdam::{
        description::topology::test::{addr, rs_member_reply},
        Topology,
        TopologyType,
    },
};

fn test_topology(seeds: &[&str]) -> Topology {
    let mut options = ClientOptions::builder()
        .hosts(seeds.iter().map(|s| addr(s)).collect::<Vec<_>>())
        .build();
    options.test_options_mut().disable_monitoring_tasks = true;

    let emitter = start_dispatcher(Default::default());
    Topology::new(options, emitter).unwrap()
}

#[tokio::test]
async fn failover_marks_primary_unknown_and_recovers() {
    let topology = test_topology(&["a:27017"]);
    let e1 = ObjectId::new();
    let e2 = ObjectId::new();

    // The monitor for A reports it as primary of a three-member set.
    topology
        .updater()
        .update(rs_member_reply(
            "a:27017",
            true,
            "rs0",
            &["a:27017", "b:27017", "c:27017"],
            1,
            e1,
        ))
        .await;

    let state = topology.watch().peek_latest();
    assert_eq!(
        state.description.topology_type(),
        TopologyType::ReplicaSetWithPrimary
    );
    // The two discovered members got servers (and pools) of their own.
    assert_eq!(state.servers.len(), 3);
    assert!(state.servers.contains_key(&addr("b:27017")));

    // A heartbeat against A fails with a network error.
    topology
        .updater()
        .handle_monitor_error(
            addr("a:27017"),
            ErrorKind::from(std::io::ErrorKind::ConnectionReset).into(),
        )
        .await;

    let state = topology.watch().peek_latest();
    assert_eq!(
        state.description.topology_type(),
        TopologyType::ReplicaSetNoPrimary
    );

    // B wins the election and reports itself primary.
    topology
        .updater()
        .update(rs_member_reply(
            "b:27017",
            true,
            "rs0",
            &["a:27017", "b:27017", "c:27017"],
            1,
            e2,
        ))
        .await;

    let state = topology.watch().peek_latest();
    assert_eq!(
        state.description.topology_type(),
        TopologyType::ReplicaSetWithPrimary
    );
    assert_eq!(
        state.description.primary().unwrap().address,
        addr("b:27017")
    );
}

#[tokio::test]
async fn removed_servers_are_dropped_from_state() {
    let topology = test_topology(&["a:27017", "d:27017"]);

    // The primary's host list does not include D, so it is removed from the topology.
    topology
        .updater()
        .update(rs_member_reply(
            "a:27017",
            true,
            "rs0",
            &["a:27017", "b:27017"],
            1,
            ObjectId::new(),
        ))
        .await;

    let state = topology.watch().peek_latest();
    assert!(!state.servers.contains_key(&addr("d:27017")));
    assert!(state.servers.contains_key(&addr("b:27017")));
    assert_eq!(state.servers.len(), 2);
}

#[tokio::test]
async fn selection_waiters_wake_on_topology_change() {
    let topology = test_topology(&["a:27017"]);
    let mut watcher = topology.watch();

    let handle = tokio::spawn(async move {
        watcher.wait_for_update(Duration::from_secs(5)).await
    });

    // A published update must wake the parked waiter well before its timeout.
    topology
        .updater()
        .update(rs_member_reply(
            "a:27017",
            true,
            "rs0",
            &["a:27017"],
            1,
            ObjectId::new(),
        ))
        .await;

    assert!(handle.await.unwrap());
}

#[tokio::test]
async fn load_balanced_topology_is_immediately_selectable() {
    let mut options = ClientOptions::builder()
        .hosts(vec![ServerAddress::parse("lb:27017").unwrap()])
        .load_balanced(true)
        .build();
    options.test_options_mut().disable_monitoring_tasks = true;

    let emitter = start_dispatcher(Default::default());
    let topology = Topology::new(options, emitter).unwrap();

    let state = topology.watch().peek_latest();
    assert_eq!(state.description.topology_type(), TopologyType::LoadBalanced);

    let criteria = crate::selection_criteria::SelectionCriteria::ReadPreference(
        crate::selection_criteria::ReadPreference::Primary,
    );
    let suitable = state.description.selection_candidates(&criteria).unwrap();
    assert_eq!(suitable.len(), 1);
}
