use std::{ops::RangeInclusive, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    bson::{doc, oid::ObjectId, Bson, DateTime},
    client::ClusterTime,
    error::Error,
    hello::{HelloCommandResponse, HelloReply},
    options::ServerAddress,
    selection_criteria::TagSet,
    serde_util,
};

/// The wire versions this driver can speak. Servers whose advertised range does not overlap
/// this one are flagged as incompatible at the topology level.
const SUPPORTED_WIRE_VERSIONS: RangeInclusive<i32> = 6..=21;
const OLDEST_SUPPORTED_SERVER: &str = "3.6";

/// Enum representing the possible types of servers that the driver can connect to.
#[derive(Debug, Deserialize, Clone, Copy, Eq, PartialEq, Serialize, Default)]
#[non_exhaustive]
pub enum ServerType {
    /// A single, non-replica-set server.
    Standalone,

    /// A router used in sharded deployments.
    Mongos,

    /// The primary node in a replica set.
    #[serde(rename = "RSPrimary")]
    RsPrimary,

    /// A secondary node in a replica set.
    #[serde(rename = "RSSecondary")]
    RsSecondary,

    /// A non-data-bearing node in a replica set which can participate in elections.
    #[serde(rename = "RSArbiter")]
    RsArbiter,

    /// Hidden, starting up, or recovering nodes in a replica set.
    #[serde(rename = "RSOther")]
    RsOther,

    /// A member of an uninitialized replica set or a member that has been removed from the
    /// replica set config.
    #[serde(rename = "RSGhost")]
    RsGhost,

    /// A load-balancing proxy between the driver and the deployment.
    LoadBalancer,

    /// A server that the driver hasn't yet communicated with or can't connect to.
    #[serde(alias = "PossiblePrimary")]
    #[default]
    Unknown,
}

impl ServerType {
    /// Whether servers of this type hold data and answer queries. Arbiters, ghosts, and
    /// unreachable servers do not.
    pub(crate) fn is_data_bearing(self) -> bool {
        match self {
            ServerType::Standalone
            | ServerType::Mongos
            | ServerType::RsPrimary
            | ServerType::RsSecondary
            | ServerType::LoadBalancer => true,
            ServerType::RsArbiter
            | ServerType::RsOther
            | ServerType::RsGhost
            | ServerType::Unknown => false,
        }
    }

    pub(crate) fn is_available(self) -> bool {
        self != ServerType::Unknown
    }

    pub(crate) fn can_auth(self) -> bool {
        self != ServerType::RsArbiter
    }
}

/// An opaque (process id, counter) pair the server attaches to monitoring replies so that
/// out-of-order observations can be detected.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TopologyVersion {
    pub(crate) process_id: ObjectId,
    pub(crate) counter: i64,
}

impl TopologyVersion {
    /// Whether an observation tagged with `incoming` is older than one tagged with `self`.
    /// Versions from different server processes are never ordered relative to each other.
    pub(crate) fn makes_stale(&self, incoming: TopologyVersion) -> bool {
        self.process_id == incoming.process_id && incoming.counter < self.counter
    }
}

impl From<TopologyVersion> for Bson {
    fn from(tv: TopologyVersion) -> Self {
        Bson::Document(doc! {
            "processId": tv.process_id,
            "counter": tv.counter,
        })
    }
}

/// The outcome of the most recent contact with a server. A description holds exactly one of
/// these, so a reply and an error can never coexist.
#[derive(Debug, Clone, Serialize)]
pub(crate) enum Observation {
    /// The server was added to the topology but no heartbeat has completed yet.
    Pending,

    /// The last heartbeat (or application handshake) produced a reply.
    Reply(Box<HelloReply>),

    /// The last heartbeat or application command failed.
    #[serde(serialize_with = "serde_util::serialize_error_as_string")]
    Failure(Error),
}

/// An immutable snapshot of everything known about one server. A fresh description is created
/// for every heartbeat outcome or application error and replaces the previous one wholesale;
/// descriptions are never mutated in place.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct ServerDescription {
    /// The canonical (lowercased) address of the server.
    pub(crate) address: ServerAddress,

    /// The role the server reported for itself, or `Unknown` if unreachable.
    pub(crate) server_type: ServerType,

    /// When this snapshot was taken; `None` only for pending placeholders.
    pub(crate) last_update_time: Option<DateTime>,

    /// Moving average of heartbeat round trips, maintained by the server's monitor.
    pub(crate) average_round_trip_time: Option<Duration>,

    /// What the contact that produced this snapshot observed.
    pub(crate) observation: Observation,
}

impl ServerDescription {
    /// A placeholder for a server that has been discovered but not yet checked. Also used to
    /// demote a server (e.g. a primary that lost an election race) back to the unchecked state.
    pub(crate) fn unknown(address: &ServerAddress) -> Self {
        Self {
            address: canonical(address),
            server_type: ServerType::Unknown,
            last_update_time: None,
            average_round_trip_time: None,
            observation: Observation::Pending,
        }
    }

    /// Builds a snapshot from a successful heartbeat reply.
    pub(crate) fn from_reply(
        address: ServerAddress,
        mut reply: HelloReply,
        average_round_trip_time: Duration,
    ) -> Self {
        normalize_hostnames(&mut reply.command_response);
        Self {
            address: canonical(&address),
            server_type: reply.command_response.server_type(),
            last_update_time: Some(DateTime::now()),
            average_round_trip_time: Some(average_round_trip_time),
            observation: Observation::Reply(Box::new(reply)),
        }
    }

    /// Builds a snapshot recording a failed contact. The server type is `Unknown` and the
    /// error is carried for reporting and for its topology version, if any.
    pub(crate) fn from_error(address: ServerAddress, error: Error) -> Self {
        Self {
            address: canonical(&address),
            server_type: ServerType::Unknown,
            last_update_time: Some(DateTime::now()),
            average_round_trip_time: None,
            observation: Observation::Failure(error),
        }
    }

    fn response(&self) -> Option<&HelloCommandResponse> {
        match self.observation {
            Observation::Reply(ref reply) => Some(&reply.command_response),
            _ => None,
        }
    }

    pub(crate) fn error(&self) -> Option<&Error> {
        match self.observation {
            Observation::Failure(ref error) => Some(error),
            _ => None,
        }
    }

    pub(crate) fn is_available(&self) -> bool {
        self.server_type.is_available()
    }

    pub(crate) fn set_name(&self) -> Option<&str> {
        self.response()?.set_name.as_deref()
    }

    pub(crate) fn replica_set_version(&self) -> Option<i32> {
        self.response()?.set_version
    }

    pub(crate) fn election_id(&self) -> Option<ObjectId> {
        self.response()?.election_id
    }

    /// The addresses this server believes are part of its replica set: hosts, passives, and
    /// arbiters combined. Fails if the server reported a malformed address.
    pub(crate) fn peer_addresses(&self) -> crate::error::Result<Vec<ServerAddress>> {
        let mut peers = Vec::new();
        if let Some(response) = self.response() {
            for list in [&response.hosts, &response.passives, &response.arbiters] {
                for peer in list.iter().flatten() {
                    peers.push(ServerAddress::parse(peer)?);
                }
            }
        }
        Ok(peers)
    }

    /// Whether the server identified itself under a different address (its `me` field) than
    /// the one it was contacted at. Such members are dropped during replica set discovery.
    pub(crate) fn reports_foreign_address(&self) -> bool {
        match self.response().and_then(|r| r.me.as_deref()) {
            Some(me) => me != self.address.to_string(),
            None => false,
        }
    }

    pub(crate) fn wire_version_range(&self) -> Option<(i32, i32)> {
        let response = self.response()?;
        Some((
            response.min_wire_version.unwrap_or(0),
            response.max_wire_version.unwrap_or(0),
        ))
    }

    pub(crate) fn max_wire_version(&self) -> Option<i32> {
        self.response()?.max_wire_version
    }

    pub(crate) fn logical_session_timeout(&self) -> Option<Duration> {
        let minutes = self.response()?.logical_session_timeout_minutes?;
        Some(Duration::from_secs(minutes as u64 * 60))
    }

    pub(crate) fn last_write_date(&self) -> Option<DateTime> {
        Some(self.response()?.last_write.as_ref()?.last_write_date)
    }

    pub(crate) fn cluster_time(&self) -> Option<&ClusterTime> {
        match self.observation {
            Observation::Reply(ref reply) => reply.cluster_time.as_ref(),
            _ => None,
        }
    }

    /// The ordering tag for this snapshot: from the reply when the contact succeeded, or from
    /// the error body when the server rejected a command with one attached.
    pub(crate) fn topology_version(&self) -> Option<TopologyVersion> {
        match self.observation {
            Observation::Pending => None,
            Observation::Reply(ref reply) => reply.command_response.topology_version,
            Observation::Failure(ref error) => error.topology_version(),
        }
    }

    pub(crate) fn tags(&self) -> Option<&TagSet> {
        self.response()?.tags.as_ref()
    }

    /// Whether every tag in `tag_set` is present on this server with the same value. Servers
    /// without reported tags match nothing.
    pub(crate) fn has_all_tags(&self, tag_set: &TagSet) -> bool {
        match self.response().and_then(|r| r.tags.as_ref()) {
            Some(own_tags) => tag_set
                .iter()
                .all(|(key, value)| own_tags.get(key) == Some(value)),
            None => false,
        }
    }

    /// A human-readable description of the wire version gap between this driver and the
    /// server, if their supported ranges do not overlap.
    pub(crate) fn wire_incompatibility(&self) -> Option<String> {
        let (server_min, server_max) = self.wire_version_range()?;

        if server_min > *SUPPORTED_WIRE_VERSIONS.end() {
            return Some(format!(
                "Server at {} requires wire version {}, but this driver only supports up to {}",
                self.address,
                server_min,
                SUPPORTED_WIRE_VERSIONS.end(),
            ));
        }

        if server_max < *SUPPORTED_WIRE_VERSIONS.start() {
            return Some(format!(
                "Server at {} only supports wire version {}, but this driver requires at least \
                 {} (server version {})",
                self.address,
                server_max,
                SUPPORTED_WIRE_VERSIONS.start(),
                OLDEST_SUPPORTED_SERVER,
            ));
        }

        None
    }
}

// Equality between descriptions only considers fields that influence topology decisions;
// bookkeeping like update times and round trip averages is deliberately excluded so that a
// steady-state heartbeat does not read as a change.
impl PartialEq for ServerDescription {
    fn eq(&self, other: &Self) -> bool {
        if self.address != other.address || self.server_type != other.server_type {
            return false;
        }

        match (&self.observation, &other.observation) {
            (Observation::Pending, Observation::Pending) => true,
            (Observation::Reply(a), Observation::Reply(b)) => {
                describes_same_topology(&a.command_response, &b.command_response)
            }
            (Observation::Failure(a), Observation::Failure(b)) => same_failure(a, b),
            _ => false,
        }
    }
}

fn describes_same_topology(a: &HelloCommandResponse, b: &HelloCommandResponse) -> bool {
    a.server_type() == b.server_type()
        && (a.min_wire_version, a.max_wire_version) == (b.min_wire_version, b.max_wire_version)
        && (&a.me, &a.set_name, &a.primary) == (&b.me, &b.set_name, &b.primary)
        && (&a.hosts, &a.passives, &a.arbiters) == (&b.hosts, &b.passives, &b.arbiters)
        && (a.set_version, a.election_id) == (b.set_version, b.election_id)
        && a.tags == b.tags
        && a.logical_session_timeout_minutes == b.logical_session_timeout_minutes
        && a.topology_version == b.topology_version
}

fn same_failure(a: &Error, b: &Error) -> bool {
    use crate::error::ErrorKind;
    match (a.kind.as_ref(), b.kind.as_ref()) {
        (ErrorKind::Command(a), ErrorKind::Command(b)) => a.code == b.code,
        _ => a.to_string() == b.to_string(),
    }
}

/// Address identity is case-insensitive on the host, so descriptions always store the
/// lowercased form.
fn canonical(address: &ServerAddress) -> ServerAddress {
    ServerAddress::Tcp {
        host: address.host().to_lowercase(),
        port: address.port(),
    }
}

fn normalize_hostnames(response: &mut HelloCommandResponse) {
    for list in [
        &mut response.hosts,
        &mut response.passives,
        &mut response.arbiters,
    ] {
        if let Some(list) = list {
            for hostname in list.iter_mut() {
                *hostname = hostname.to_lowercase();
            }
        }
    }

    if let Some(ref mut me) = response.me {
        *me = me.to_lowercase();
    }
}
