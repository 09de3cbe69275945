use std::time::Duration;

use pretty_assertions::assert_eq;

use super::{TopologyDescription, TopologyType};
use crate::{
    bson::oid::ObjectId,
    error::{CommandError, Error, ErrorKind},
    hello::{HelloCommandResponse, HelloReply},
    options::{ClientOptions, ServerAddress},
    sdam::description::server::{Observation, ServerDescription, ServerType},
    sdam::TopologyVersion,
};

pub(crate) fn addr(s: &str) -> ServerAddress {
    ServerAddress::parse(s).unwrap()
}

/// Builds the snapshot a replica set member would produce for the given role.
pub(crate) fn rs_member_reply(
    address: &str,
    primary: bool,
    set_name: &str,
    hosts: &[&str],
    set_version: impl Into<Option<i32>>,
    election_id: impl Into<Option<ObjectId>>,
) -> ServerDescription {
    let response = HelloCommandResponse {
        is_writable_primary: Some(primary),
        secondary: Some(!primary),
        set_name: Some(set_name.to_string()),
        hosts: Some(hosts.iter().map(|h| h.to_string()).collect()),
        me: Some(address.to_string()),
        set_version: set_version.into(),
        election_id: election_id.into(),
        min_wire_version: Some(6),
        max_wire_version: Some(17),
        logical_session_timeout_minutes: Some(30),
        ..Default::default()
    };
    let reply = HelloReply {
        server_address: addr(address),
        command_response: response,
        raw_command_response: Default::default(),
        cluster_time: None,
    };
    ServerDescription::from_reply(addr(address), reply, Duration::from_millis(5))
}

pub(crate) fn standalone_reply(address: &str) -> ServerDescription {
    let response = HelloCommandResponse {
        is_writable_primary: Some(true),
        min_wire_version: Some(6),
        max_wire_version: Some(17),
        logical_session_timeout_minutes: Some(30),
        ..Default::default()
    };
    let reply = HelloReply {
        server_address: addr(address),
        command_response: response,
        raw_command_response: Default::default(),
        cluster_time: None,
    };
    ServerDescription::from_reply(addr(address), reply, Duration::from_millis(5))
}

/// Edits the hello response carried by a description, for simulating reply variations.
fn patch_response(
    description: &mut ServerDescription,
    patch: impl FnOnce(&mut HelloCommandResponse),
) {
    match description.observation {
        Observation::Reply(ref mut reply) => patch(&mut reply.command_response),
        ref other => panic!("expected a reply observation, got {:?}", other),
    }
}

fn topology_with_seeds(seeds: &[&str]) -> TopologyDescription {
    let options = ClientOptions::builder()
        .hosts(seeds.iter().map(|s| addr(s)).collect::<Vec<_>>())
        .build();
    TopologyDescription::new(&options)
}

#[test]
fn primary_discovery_absorbs_host_list() {
    let mut topology = topology_with_seeds(&["a:27017"]);

    topology
        .apply(rs_member_reply(
            "a:27017",
            true,
            "rs0",
            &["a:27017", "b:27017", "c:27017"],
            1,
            ObjectId::new(),
        ))
        .unwrap();

    assert_eq!(topology.topology_type(), TopologyType::ReplicaSetWithPrimary);
    assert_eq!(topology.servers.len(), 3);
    assert_eq!(topology.set_name.as_deref(), Some("rs0"));
    assert!(topology.servers.contains_key(&addr("b:27017")));
    assert_eq!(
        topology.logical_session_timeout,
        Some(Duration::from_secs(30 * 60))
    );
}

#[test]
fn primary_failover_and_reelection() {
    let mut topology = topology_with_seeds(&["a:27017"]);
    let e1 = ObjectId::new();
    let e2 = ObjectId::new();

    topology
        .apply(rs_member_reply(
            "a:27017",
            true,
            "rs0",
            &["a:27017", "b:27017", "c:27017"],
            1,
            e1,
        ))
        .unwrap();
    assert_eq!(topology.topology_type(), TopologyType::ReplicaSetWithPrimary);

    // The primary fails with a network error and becomes Unknown.
    topology
        .apply(ServerDescription::from_error(
            addr("a:27017"),
            ErrorKind::from(std::io::ErrorKind::ConnectionReset).into(),
        ))
        .unwrap();
    assert_eq!(topology.topology_type(), TopologyType::ReplicaSetNoPrimary);
    assert_eq!(
        topology.server(&addr("a:27017")).unwrap().server_type,
        ServerType::Unknown
    );

    // A different member reports itself primary with a newer election.
    topology
        .apply(rs_member_reply(
            "b:27017",
            true,
            "rs0",
            &["a:27017", "b:27017", "c:27017"],
            1,
            e2,
        ))
        .unwrap();
    assert_eq!(topology.topology_type(), TopologyType::ReplicaSetWithPrimary);
    assert_eq!(topology.primary().unwrap().address, addr("b:27017"));
}

#[test]
fn stale_primary_is_rejected() {
    let mut topology = topology_with_seeds(&["a:27017", "b:27017"]);

    // ObjectIds generated by one process are ordered; e1 precedes e2.
    let e1 = ObjectId::new();
    let e2 = ObjectId::new();
    assert!(e2 > e1);

    topology
        .apply(rs_member_reply(
            "b:27017",
            true,
            "rs0",
            &["a:27017", "b:27017"],
            5,
            e2,
        ))
        .unwrap();
    assert_eq!(topology.primary().unwrap().address, addr("b:27017"));

    // A stale former primary reports the same set version but an older election id; it is
    // reset to Unknown and the current primary is untouched.
    topology
        .apply(rs_member_reply(
            "a:27017",
            true,
            "rs0",
            &["a:27017", "b:27017"],
            5,
            e1,
        ))
        .unwrap();

    assert_eq!(topology.topology_type(), TopologyType::ReplicaSetWithPrimary);
    assert_eq!(topology.primary().unwrap().address, addr("b:27017"));
    assert_eq!(
        topology.server(&addr("a:27017")).unwrap().server_type,
        ServerType::Unknown
    );
}

#[test]
fn out_of_order_topology_versions_are_dropped() {
    let mut topology = topology_with_seeds(&["a:27017"]);
    let process_id = ObjectId::new();

    let mut newer = rs_member_reply("a:27017", true, "rs0", &["a:27017"], 1, ObjectId::new());
    patch_response(&mut newer, |response| {
        response.topology_version = Some(TopologyVersion {
            process_id,
            counter: 7,
        });
    });
    topology.apply(newer).unwrap();

    // An error stamped by the same server process with a lower counter must be ignored
    // entirely.
    let stale_error: Error = ErrorKind::Command(CommandError {
        code: 11600,
        code_name: "InterruptedAtShutdown".to_string(),
        message: "shutting down".to_string(),
        topology_version: Some(TopologyVersion {
            process_id,
            counter: 6,
        }),
    })
    .into();
    let older = ServerDescription::from_error(addr("a:27017"), stale_error);

    let before = topology.clone();
    topology.apply(older).unwrap();
    assert_eq!(before, topology);
    assert_eq!(topology.primary().unwrap().address, addr("a:27017"));
}

#[test]
fn standalone_in_multi_seed_topology_is_removed() {
    let mut topology = topology_with_seeds(&["a:27017", "b:27017"]);
    topology.apply(standalone_reply("a:27017")).unwrap();

    assert_eq!(topology.topology_type(), TopologyType::Unknown);
    assert!(!topology.servers.contains_key(&addr("a:27017")));

    // A single seed transitions to Single instead.
    let mut topology = topology_with_seeds(&["a:27017"]);
    topology.apply(standalone_reply("a:27017")).unwrap();
    assert_eq!(topology.topology_type(), TopologyType::Single);
}

#[test]
fn set_name_mismatch_removes_server() {
    let options = ClientOptions::builder()
        .hosts(vec![addr("a:27017")])
        .repl_set_name("expected".to_string())
        .build();
    let mut topology = TopologyDescription::new(&options);
    assert_eq!(topology.topology_type(), TopologyType::ReplicaSetNoPrimary);

    topology
        .apply(rs_member_reply(
            "a:27017",
            false,
            "other",
            &["a:27017"],
            None,
            None,
        ))
        .unwrap();
    assert!(!topology.servers.contains_key(&addr("a:27017")));
}

#[test]
fn session_timeout_is_min_across_data_bearing_servers() {
    let mut topology = topology_with_seeds(&["a:27017"]);

    topology
        .apply(rs_member_reply(
            "a:27017",
            true,
            "rs0",
            &["a:27017", "b:27017"],
            1,
            ObjectId::new(),
        ))
        .unwrap();
    assert_eq!(
        topology.logical_session_timeout,
        Some(Duration::from_secs(30 * 60))
    );

    let mut secondary = rs_member_reply(
        "b:27017",
        false,
        "rs0",
        &["a:27017", "b:27017"],
        None,
        None,
    );
    patch_response(&mut secondary, |response| {
        response.logical_session_timeout_minutes = Some(10);
    });
    topology.apply(secondary).unwrap();
    assert_eq!(
        topology.logical_session_timeout,
        Some(Duration::from_secs(10 * 60))
    );

    // A data-bearing server without a timeout disables sessions entirely.
    let mut no_timeout = rs_member_reply(
        "b:27017",
        false,
        "rs0",
        &["a:27017", "b:27017"],
        None,
        None,
    );
    patch_response(&mut no_timeout, |response| {
        response.logical_session_timeout_minutes = None;
    });
    topology.apply(no_timeout).unwrap();
    assert_eq!(topology.logical_session_timeout, None);
}

#[test]
fn incompatible_wire_version_is_reported() {
    let mut topology = topology_with_seeds(&["a:27017"]);

    let mut old_server = standalone_reply("a:27017");
    patch_response(&mut old_server, |response| {
        response.min_wire_version = Some(0);
        response.max_wire_version = Some(2);
    });
    topology.apply(old_server).unwrap();

    assert!(topology.compatibility_error().is_some());
}
