use std::time::Duration;

use pretty_assertions::assert_eq;

use crate::{
    bson::oid::ObjectId,
    options::ClientOptions,
    sdam::description::{
        server::Observation,
        topology::{
            test::{addr, rs_member_reply},
            TopologyDescription,
        },
    },
    selection_criteria::{ReadPreference, ReadPreferenceOptions, SelectionCriteria, TagSet},
};

fn replica_set_topology(members: &[(&str, bool, u64)]) -> TopologyDescription {
    let options = ClientOptions::builder()
        .hosts(
            members
                .iter()
                .map(|(address, _, _)| addr(address))
                .collect::<Vec<_>>(),
        )
        .build();
    let mut topology = TopologyDescription::new(&options);

    let hosts: Vec<&str> = members.iter().map(|(address, _, _)| *address).collect();
    for (address, primary, rtt_ms) in members {
        let mut description = rs_member_reply(
            address,
            *primary,
            "rs0",
            &hosts,
            1,
            if *primary { Some(ObjectId::new()) } else { None },
        );
        description.average_round_trip_time = Some(Duration::from_millis(*rtt_ms));
        topology.apply(description).unwrap();
    }

    topology
}

fn nearest() -> SelectionCriteria {
    SelectionCriteria::ReadPreference(ReadPreference::Nearest {
        options: Default::default(),
    })
}

#[test]
fn latency_window_excludes_slow_servers() {
    // RTTs of 5, 7, and 40 ms with the default 15 ms threshold: only the first two servers
    // are within the window.
    let topology = replica_set_topology(&[
        ("a:27017", true, 5),
        ("b:27017", false, 7),
        ("c:27017", false, 40),
    ]);

    let criteria = nearest();
    let mut in_window: Vec<_> = topology
        .selection_candidates(&criteria)
        .unwrap()
        .into_iter()
        .map(|description| description.address.clone())
        .collect();
    in_window.sort_by_key(|a| a.to_string());

    assert_eq!(in_window, vec![addr("a:27017"), addr("b:27017")]);
}

#[test]
fn local_threshold_of_zero_keeps_only_fastest() {
    let options = ClientOptions::builder()
        .hosts(vec![addr("a:27017"), addr("b:27017")])
        .local_threshold(Duration::from_millis(0))
        .build();
    let mut topology = TopologyDescription::new(&options);
    for (address, primary, rtt_ms) in [("a:27017", true, 5u64), ("b:27017", false, 7)] {
        let mut description = rs_member_reply(
            address,
            primary,
            "rs0",
            &["a:27017", "b:27017"],
            1,
            if primary { Some(ObjectId::new()) } else { None },
        );
        description.average_round_trip_time = Some(Duration::from_millis(rtt_ms));
        topology.apply(description).unwrap();
    }

    let criteria = nearest();
    let in_window = topology.selection_candidates(&criteria).unwrap();
    assert_eq!(in_window.len(), 1);
    assert_eq!(in_window[0].address, addr("a:27017"));
}

#[test]
fn primary_preference_filters_by_type() {
    let topology = replica_set_topology(&[
        ("a:27017", true, 5),
        ("b:27017", false, 5),
        ("c:27017", false, 5),
    ]);

    let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
    let candidates = topology.selection_candidates(&criteria).unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].address, addr("a:27017"));

    let criteria = SelectionCriteria::ReadPreference(ReadPreference::Secondary {
        options: Default::default(),
    });
    let candidates = topology.selection_candidates(&criteria).unwrap();
    assert_eq!(candidates.len(), 2);
    assert!(candidates
        .iter()
        .all(|description| description.address != addr("a:27017")));
}

#[test]
fn secondary_preferred_falls_back_to_primary() {
    let topology = replica_set_topology(&[("a:27017", true, 5)]);

    let criteria = SelectionCriteria::ReadPreference(ReadPreference::SecondaryPreferred {
        options: Default::default(),
    });
    let candidates = topology.selection_candidates(&criteria).unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].address, addr("a:27017"));
}

#[test]
fn first_matching_tag_set_wins() {
    let mut topology = replica_set_topology(&[
        ("a:27017", true, 5),
        ("b:27017", false, 5),
        ("c:27017", false, 5),
    ]);

    let mut ny = TagSet::new();
    ny.insert("dc".to_string(), "ny".to_string());
    let mut sf = TagSet::new();
    sf.insert("dc".to_string(), "sf".to_string());

    for (address, tags) in [("b:27017", ny.clone()), ("c:27017", sf.clone())] {
        let mut description = topology.server(&addr(address)).unwrap().clone();
        match description.observation {
            Observation::Reply(ref mut reply) => {
                reply.command_response.tags = Some(tags);
            }
            ref other => panic!("expected a reply observation, got {:?}", other),
        }
        topology.apply(description).unwrap();
    }

    // The first tag set with any match is the one used for filtering; later sets are
    // ignored.
    let mut no_match = TagSet::new();
    no_match.insert("dc".to_string(), "tokyo".to_string());
    let criteria = SelectionCriteria::ReadPreference(ReadPreference::Secondary {
        options: ReadPreferenceOptions::builder()
            .tag_sets(vec![no_match, sf])
            .build(),
    });
    let candidates = topology.selection_candidates(&criteria).unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].address, addr("c:27017"));
}

#[test]
fn max_staleness_below_minimum_is_an_argument_error() {
    let topology = replica_set_topology(&[("a:27017", true, 5), ("b:27017", false, 5)]);

    let criteria = SelectionCriteria::ReadPreference(ReadPreference::Secondary {
        options: ReadPreferenceOptions::builder()
            .max_staleness(Duration::from_secs(45))
            .build(),
    });

    let error = topology.selection_candidates(&criteria).unwrap_err();
    assert!(matches!(
        error.kind.as_ref(),
        crate::error::ErrorKind::InvalidArgument { .. }
    ));
}

#[test]
fn unknown_topology_has_no_suitable_servers() {
    let options = ClientOptions::builder()
        .hosts(vec![addr("a:27017")])
        .build();
    let topology = TopologyDescription::new(&options);

    let criteria = nearest();
    let candidates = topology.selection_candidates(&criteria).unwrap();
    assert!(candidates.is_empty());
}
