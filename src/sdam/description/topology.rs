pub(crate) mod server_selection;
#[cfg(test)]
pub(crate) mod test;

use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    bson::oid::ObjectId,
    client::ClusterTime,
    cmap::Command,
    error::{Error, Result},
    options::{ClientOptions, ServerAddress},
    sdam::{
        description::server::{ServerDescription, ServerType},
        DEFAULT_HEARTBEAT_FREQUENCY,
    },
    selection_criteria::{ReadPreference, SelectionCriteria},
};

use self::server_selection::IDLE_WRITE_PERIOD;

/// The possible types for a topology.
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Deserialize, Serialize, Default, derive_more::Display,
)]
#[non_exhaustive]
pub enum TopologyType {
    /// A single server.
    Single,

    /// A replica set with no primary.
    ReplicaSetNoPrimary,

    /// A replica set with a primary.
    ReplicaSetWithPrimary,

    /// A sharded topology.
    Sharded,

    /// A load balanced topology.
    LoadBalanced,

    /// A topology whose type is not known.
    #[default]
    Unknown,
}

/// An immutable classification of the deployment, derived purely from the sequence of
/// [`ServerDescription`]s that have been applied to it.
///
/// The topology worker owns the only mutable copy; everyone else sees snapshots.
#[derive(Debug, Clone, Default, Serialize)]
#[non_exhaustive]
pub(crate) struct TopologyDescription {
    /// Whether the topology was seeded with exactly one address. Only a single seed may
    /// transition to the `Single` type on discovering a standalone.
    #[serde(skip)]
    pub(crate) single_seed: bool,

    /// The current classification of the deployment.
    pub(crate) topology_type: TopologyType,

    /// The replica set name this topology is locked to, from the options or the first member
    /// that reported one.
    pub(crate) set_name: Option<String>,

    /// The newest replica set config version any primary has reported.
    pub(crate) max_set_version: Option<i32>,

    /// The newest election id any primary has reported.
    pub(crate) max_election_id: Option<ObjectId>,

    /// Why this deployment cannot be used, if any server's wire version range does not
    /// overlap the driver's.
    pub(crate) compatibility_error: Option<String>,

    /// How long the deployment keeps an unused session alive: the minimum over all
    /// data-bearing members, or `None` (sessions disabled) if any of them omits it.
    pub(crate) logical_session_timeout: Option<Duration>,

    /// Whether the deployment is able to run transactions.
    #[serde(skip)]
    pub(crate) transaction_support_status: TransactionSupportStatus,

    /// The highest `$clusterTime` observed from any member.
    #[serde(skip)]
    pub(crate) cluster_time: Option<ClusterTime>,

    /// How much slower than the fastest suitable server a server may be and still be
    /// selected.
    #[serde(skip)]
    pub(crate) local_threshold: Option<Duration>,

    /// The configured interval between heartbeats, used in staleness estimates.
    #[serde(skip)]
    pub(crate) heartbeat_freq: Option<Duration>,

    /// The latest snapshot of every member of the topology.
    pub(crate) servers: HashMap<ServerAddress, ServerDescription>,
}

// Equality is only used to decide whether parked selection operations should wake up and look
// again, so it covers exactly the inputs of the selection algorithm.
impl PartialEq for TopologyDescription {
    fn eq(&self, other: &Self) -> bool {
        self.topology_type == other.topology_type
            && self.compatibility_error == other.compatibility_error
            && self.servers == other.servers
    }
}

impl TopologyDescription {
    /// Builds the initial description for the given options: every seed starts as an unknown
    /// server, and the options may pre-commit the topology to a type.
    pub(crate) fn new(options: &ClientOptions) -> Self {
        let topology_type = if options.direct_connection == Some(true) {
            TopologyType::Single
        } else if options.repl_set_name.is_some() {
            TopologyType::ReplicaSetNoPrimary
        } else if options.load_balanced == Some(true) {
            TopologyType::LoadBalanced
        } else {
            TopologyType::Unknown
        };

        let servers: HashMap<_, _> = options
            .hosts
            .iter()
            .map(|address| (address.clone(), ServerDescription::unknown(address)))
            .collect();

        Self {
            single_seed: servers.len() == 1,
            topology_type,
            set_name: options.repl_set_name.clone(),
            local_threshold: options.local_threshold,
            heartbeat_freq: options.heartbeat_freq,
            transaction_support_status: if topology_type == TopologyType::LoadBalanced {
                // Load balancers front servers new enough to support transactions.
                TransactionSupportStatus::Supported
            } else {
                TransactionSupportStatus::Undetermined
            },
            servers,
            ..Default::default()
        }
    }

    pub(crate) fn topology_type(&self) -> TopologyType {
        self.topology_type
    }

    pub(crate) fn server_addresses(&self) -> impl Iterator<Item = &ServerAddress> {
        self.servers.keys()
    }

    pub(crate) fn server(&self, address: &ServerAddress) -> Option<&ServerDescription> {
        self.servers.get(address)
    }

    pub(crate) fn cluster_time(&self) -> Option<&ClusterTime> {
        self.cluster_time.as_ref()
    }

    pub(crate) fn compatibility_error(&self) -> Option<&String> {
        self.compatibility_error.as_ref()
    }

    pub(crate) fn transaction_support_status(&self) -> TransactionSupportStatus {
        self.transaction_support_status
    }

    fn heartbeat_frequency(&self) -> Duration {
        self.heartbeat_freq.unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY)
    }

    /// Folds a new server snapshot into the topology. This is the topology transition
    /// function: aside from I/O-free bookkeeping it decides only two things, what type the
    /// topology has and which servers belong to it.
    pub(crate) fn apply(&mut self, incoming: ServerDescription) -> Result<()> {
        // Snapshots for servers that have already been removed are not reabsorbed.
        let Some(existing) = self.servers.get(&incoming.address) else {
            return Ok(());
        };

        // A reply that the server stamped as older than what we already hold is dropped, so
        // reordered monitor streams cannot roll the topology backwards.
        if let (Some(current), Some(new)) = (existing.topology_version(), incoming.topology_version())
        {
            if current.makes_stale(new) {
                return Ok(());
            }
        }

        let incoming = self.coerce_for_direct_connection(incoming);
        self.servers
            .insert(incoming.address.clone(), incoming.clone());

        if self.topology_type == TopologyType::LoadBalanced {
            // There is no monitoring behind a load balancer; the synthesized description is
            // the whole story.
            return Ok(());
        }

        if let Some(cluster_time) = incoming.cluster_time().cloned() {
            self.advance_cluster_time(&cluster_time);
        }

        if self.topology_type != TopologyType::Single {
            self.transition(&incoming)?;
        }

        self.refresh_session_timeout();
        self.refresh_transaction_support(&incoming);
        self.refresh_compatibility();

        Ok(())
    }

    /// Membership and type changes, dispatched on what the server reported itself to be.
    fn transition(&mut self, incoming: &ServerDescription) -> Result<()> {
        use TopologyType::*;

        match incoming.server_type {
            // An unreachable or uninitialized member carries no membership information; the
            // only consequence is that a vanished primary may demote the topology type.
            ServerType::Unknown | ServerType::RsGhost => {
                if self.topology_type == ReplicaSetWithPrimary {
                    self.settle_replica_set_type();
                }
            }

            ServerType::Standalone => {
                if self.topology_type == Unknown && self.single_seed {
                    self.topology_type = Single;
                } else {
                    // A standalone has no place in a multi-server deployment.
                    self.servers.remove(&incoming.address);
                    if self.topology_type == ReplicaSetWithPrimary {
                        self.settle_replica_set_type();
                    }
                }
            }

            ServerType::Mongos => match self.topology_type {
                Unknown => self.topology_type = Sharded,
                Sharded => {}
                ReplicaSetNoPrimary => {
                    self.servers.remove(&incoming.address);
                }
                ReplicaSetWithPrimary => {
                    self.servers.remove(&incoming.address);
                    self.settle_replica_set_type();
                }
                Single | LoadBalanced => {}
            },

            ServerType::RsPrimary => {
                if self.topology_type == Sharded {
                    self.servers.remove(&incoming.address);
                } else {
                    self.install_primary(incoming)?;
                }
            }

            ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther => {
                match self.topology_type {
                    Sharded => {
                        self.servers.remove(&incoming.address);
                    }
                    Unknown => {
                        self.topology_type = ReplicaSetNoPrimary;
                        self.absorb_rs_member(incoming)?;
                    }
                    ReplicaSetNoPrimary => self.absorb_rs_member(incoming)?,
                    ReplicaSetWithPrimary => self.cross_check_member(incoming),
                    Single | LoadBalanced => {}
                }
            }

            ServerType::LoadBalancer => {
                return Err(Error::internal(
                    "a monitored server cannot become a load balancer",
                ))
            }
        }

        Ok(())
    }

    /// Accepts a server that claims to be the primary of the set, unless it is reporting a
    /// stale election. An accepted primary's member list is authoritative for the topology.
    fn install_primary(&mut self, incoming: &ServerDescription) -> Result<()> {
        match self.set_name {
            None => self.set_name = incoming.set_name().map(str::to_string),
            Some(ref expected) => {
                if incoming.set_name() != Some(expected.as_str()) {
                    self.servers.remove(&incoming.address);
                    self.settle_replica_set_type();
                    return Ok(());
                }
            }
        }

        // Elections are ordered by the (set version, election id) pair. A "primary"
        // reporting an older pair than the newest one seen has already lost; it is reset to
        // unknown so its next heartbeat reveals its real role.
        if let (Some(version), Some(id)) = (incoming.replica_set_version(), incoming.election_id())
        {
            if let (Some(max_version), Some(max_id)) = (self.max_set_version, self.max_election_id)
            {
                if (max_version, max_id) > (version, id) {
                    self.servers.insert(
                        incoming.address.clone(),
                        ServerDescription::unknown(&incoming.address),
                    );
                    self.settle_replica_set_type();
                    return Ok(());
                }
            }
            self.max_election_id = Some(id);
        }

        if let Some(version) = incoming.replica_set_version() {
            if self.max_set_version.map_or(true, |max| version > max) {
                self.max_set_version = Some(version);
            }
        }

        // At most one primary: any other member still marked primary lost the election and
        // gets rechecked.
        let demoted: Vec<ServerAddress> = self
            .servers
            .iter()
            .filter(|(address, description)| {
                description.server_type == ServerType::RsPrimary && **address != incoming.address
            })
            .map(|(address, _)| address.clone())
            .collect();
        for address in demoted {
            self.servers
                .insert(address.clone(), ServerDescription::unknown(&address));
        }

        // Adopt the primary's member list: newcomers join as unknown, absentees are dropped.
        let members = incoming.peer_addresses()?;
        for address in &members {
            self.servers
                .entry(address.clone())
                .or_insert_with(|| ServerDescription::unknown(address));
        }
        self.servers.retain(|address, _| members.contains(address));

        self.settle_replica_set_type();

        Ok(())
    }

    /// Folds a non-primary replica set member into a topology that has no primary yet,
    /// learning the set name and candidate members from it.
    fn absorb_rs_member(&mut self, incoming: &ServerDescription) -> Result<()> {
        match self.set_name {
            None => self.set_name = incoming.set_name().map(str::to_string),
            Some(ref expected) if incoming.set_name() != Some(expected.as_str()) => {
                self.servers.remove(&incoming.address);
                return Ok(());
            }
            _ => {}
        }

        for address in incoming.peer_addresses()? {
            self.servers
                .entry(address.clone())
                .or_insert_with(|| ServerDescription::unknown(&address));
        }

        // A member that identifies itself under a different address will be (re)discovered
        // under that address via the host lists; the entry under this one is wrong.
        if incoming.reports_foreign_address() {
            self.servers.remove(&incoming.address);
        }

        Ok(())
    }

    /// Validates a non-primary member against a topology that has a primary. The primary owns
    /// the member list, so the member is only checked for belonging, never absorbed.
    fn cross_check_member(&mut self, incoming: &ServerDescription) {
        let wrong_set = self.set_name.as_deref() != incoming.set_name();
        if wrong_set || incoming.reports_foreign_address() {
            self.servers.remove(&incoming.address);
            self.settle_replica_set_type();
        }
    }

    /// Recomputes whether this replica set topology currently has a primary.
    fn settle_replica_set_type(&mut self) {
        let has_primary = self
            .servers
            .values()
            .any(|description| description.server_type == ServerType::RsPrimary);
        self.topology_type = if has_primary {
            TopologyType::ReplicaSetWithPrimary
        } else {
            TopologyType::ReplicaSetNoPrimary
        };
    }

    /// In direct connection mode a configured replica set name is a hard requirement; a
    /// reachable server reporting a different one is treated as an error rather than used.
    fn coerce_for_direct_connection(&self, incoming: ServerDescription) -> ServerDescription {
        if self.topology_type != TopologyType::Single {
            return incoming;
        }
        let Some(expected) = self.set_name.as_deref() else {
            return incoming;
        };
        if !incoming.is_available() || incoming.set_name() == Some(expected) {
            return incoming;
        }

        let found = incoming.set_name().map(str::to_string);
        ServerDescription::from_error(
            incoming.address,
            Error::invalid_argument(format!(
                "the connection string requires replica set {:?}, but the server is a member \
                 of {:?}",
                expected, found,
            )),
        )
    }

    /// Recomputes the session timeout over the current membership: the minimum over all
    /// data-bearing members, or disabled outright if any of them does not report one.
    fn refresh_session_timeout(&mut self) {
        let mut minimum = None;
        for description in self
            .servers
            .values()
            .filter(|d| d.server_type.is_data_bearing())
        {
            match description.logical_session_timeout() {
                None => {
                    self.logical_session_timeout = None;
                    return;
                }
                Some(timeout) => {
                    minimum = Some(match minimum {
                        None => timeout,
                        Some(current) => std::cmp::min(current, timeout),
                    });
                }
            }
        }
        self.logical_session_timeout = minimum;
    }

    fn refresh_transaction_support(&mut self, incoming: &ServerDescription) {
        if self.logical_session_timeout.is_none() {
            self.transaction_support_status = TransactionSupportStatus::Unsupported;
        }

        // Transactions need wire version 7, or 8 when going through a router.
        if let Some(max_wire) = incoming.max_wire_version() {
            let required = if self.topology_type == TopologyType::Sharded {
                8
            } else {
                7
            };
            self.transaction_support_status = if max_wire >= required {
                TransactionSupportStatus::Supported
            } else {
                TransactionSupportStatus::Unsupported
            };
        }
    }

    /// A single incompatible server poisons the whole deployment; record the first offender's
    /// explanation.
    fn refresh_compatibility(&mut self) {
        self.compatibility_error = self
            .servers
            .values()
            .find_map(|description| description.wire_incompatibility());
    }

    /// Raises the recorded cluster time if the provided one is newer.
    pub(crate) fn advance_cluster_time(&mut self, cluster_time: &ClusterTime) {
        let newer = match self.cluster_time {
            Some(ref current) => cluster_time > current,
            None => true,
        };
        if newer {
            self.cluster_time = Some(cluster_time.clone());
        }
    }

    /// Compares this description against the one that succeeded it, returning `None` when
    /// nothing selection-relevant changed. The references in the diff point into both
    /// descriptions.
    pub(crate) fn diff<'a>(&'a self, next: &'a Self) -> Option<TopologyDescriptionDiff<'a>> {
        if self == next {
            return None;
        }

        let mut diff = TopologyDescriptionDiff {
            removed: Vec::new(),
            added: Vec::new(),
            changed: Vec::new(),
        };

        for (address, description) in &self.servers {
            match next.servers.get(address) {
                None => diff.removed.push(address),
                Some(next_description) if next_description != description => {
                    diff.changed.push((address, description, next_description));
                }
                _ => {}
            }
        }
        for address in next.servers.keys() {
            if !self.servers.contains_key(address) {
                diff.added.push(address);
            }
        }

        Some(diff)
    }

    /// Decorates an outgoing command with `$readPreference` when the receiving server routes
    /// reads itself or needs to be told to serve non-primary reads.
    pub(crate) fn attach_read_preference(
        &self,
        address: &ServerAddress,
        command: &mut Command,
        criteria: Option<&SelectionCriteria>,
    ) {
        if let Some(read_pref) = self.passthrough_read_preference(address, criteria) {
            command.set_read_preference(read_pref);
        }
    }

    fn passthrough_read_preference(
        &self,
        address: &ServerAddress,
        criteria: Option<&SelectionCriteria>,
    ) -> Option<ReadPreference> {
        let server_type = self
            .server(address)
            .map(|description| description.server_type)
            .unwrap_or(ServerType::Unknown);
        let requested = criteria.and_then(SelectionCriteria::as_read_pref);

        // Routers and load balancers apply the preference on our behalf, so anything other
        // than the default primary mode is forwarded verbatim.
        if server_type == ServerType::Mongos || self.topology_type == TopologyType::LoadBalanced {
            return match requested? {
                ReadPreference::Primary => None,
                other => Some(other.clone()),
            };
        }

        match (self.topology_type, server_type) {
            (TopologyType::Single, ServerType::Standalone) => None,
            // A direct connection to a replica set member must be readable even when the
            // member is not primary.
            (TopologyType::Single, _) => Some(match requested {
                None | Some(ReadPreference::Primary) => ReadPreference::PrimaryPreferred {
                    options: Default::default(),
                },
                Some(other) => other.clone(),
            }),
            _ => match criteria {
                Some(SelectionCriteria::ReadPreference(rp)) if *rp != ReadPreference::Primary => {
                    Some(rp.clone())
                }
                Some(SelectionCriteria::Predicate(_)) => Some(ReadPreference::PrimaryPreferred {
                    options: Default::default(),
                }),
                _ => None,
            },
        }
    }
}

#[cfg(test)]
impl TopologyDescription {
    pub(crate) fn primary(&self) -> Option<&ServerDescription> {
        self.servers
            .values()
            .find(|description| description.server_type == ServerType::RsPrimary)
    }
}

/// The selection-relevant delta between two consecutive topology descriptions.
#[derive(Debug)]
pub(crate) struct TopologyDescriptionDiff<'a> {
    pub(crate) removed: Vec<&'a ServerAddress>,
    pub(crate) added: Vec<&'a ServerAddress>,
    pub(crate) changed: Vec<(&'a ServerAddress, &'a ServerDescription, &'a ServerDescription)>,
}

/// Enum representing whether transactions are supported by the topology.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) enum TransactionSupportStatus {
    /// No data-bearing server has reported in yet, so support cannot be determined.
    #[default]
    Undetermined,

    /// The deployment cannot run transactions.
    Unsupported,

    /// The deployment is new enough to run transactions. Note that the server may still
    /// reject an individual transaction for reasons of its own.
    Supported,
}

/// Rejects staleness bounds tighter than the deployment can meaningfully distinguish: a
/// secondary can always appear behind by a heartbeat interval plus the primary's idle write
/// period, and never less than 90 seconds.
pub(crate) fn verify_max_staleness(
    max_staleness: Duration,
    heartbeat_frequency: Duration,
) -> Result<()> {
    let floor = std::cmp::max(
        Duration::from_secs(90),
        heartbeat_frequency.saturating_add(IDLE_WRITE_PERIOD),
    );

    if max_staleness < floor {
        return Err(Error::invalid_argument(format!(
            "maxStalenessSeconds must be at least {} seconds",
            floor.as_secs()
        )));
    }

    Ok(())
}
