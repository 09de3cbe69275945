#[cfg(test)]
mod test;

use std::{collections::HashMap, fmt, ops::Deref, sync::Arc, time::Duration};

use rand::Rng;

use super::TopologyDescription;
use crate::{
    error::{ErrorKind, Result},
    options::ServerAddress,
    sdam::{
        description::{
            server::{ServerDescription, ServerType},
            topology::TopologyType,
        },
        public::ServerInfo,
        Server,
    },
    selection_criteria::{ReadPreference, SelectionCriteria, TagSet},
};

const DEFAULT_LOCAL_THRESHOLD: Duration = Duration::from_millis(15);
pub(crate) const IDLE_WRITE_PERIOD: Duration = Duration::from_secs(10);

/// A selected server, held for the duration of one operation. Holding it keeps the server's
/// in-flight operation count accurate, which in turn feeds the load-based tie-breaking below.
#[derive(Debug)]
pub(crate) struct SelectedServer {
    inner: Arc<Server>,
}

impl SelectedServer {
    fn new(inner: Arc<Server>) -> Self {
        inner.increment_operation_count();
        Self { inner }
    }
}

impl Deref for SelectedServer {
    type Target = Server;

    fn deref(&self) -> &Server {
        &self.inner
    }
}

impl Drop for SelectedServer {
    fn drop(&mut self) {
        self.inner.decrement_operation_count();
    }
}

/// Runs one round of server selection: filter to the servers suitable for `criteria`, keep
/// those within the latency window, then break ties by load. Returns `None` when nothing
/// qualifies right now; the caller decides whether to wait for the topology to change.
///
/// `skip` names a server to avoid when alternatives exist, used to steer a retry away from
/// the server that just failed.
pub(crate) fn try_select_server<'a>(
    criteria: &'a SelectionCriteria,
    description: &'a TopologyDescription,
    servers: &'a HashMap<ServerAddress, Arc<Server>>,
    skip: Option<&ServerAddress>,
) -> Result<Option<SelectedServer>> {
    let mut candidates = description.selection_candidates(criteria)?;

    if candidates.len() > 1 {
        if let Some(skip) = skip {
            candidates.retain(|description| &description.address != skip);
        }
    }

    let live: Vec<&Arc<Server>> = candidates
        .iter()
        .filter_map(|description| servers.get(&description.address))
        .collect();

    Ok(pick_by_load(&live).map(SelectedServer::new))
}

/// Final tie-break within the latency window: sample two distinct members at random and take
/// the one with fewer operations in flight. Randomizing first spreads load; comparing loads
/// keeps a busy server from being picked while an idle peer is available.
fn pick_by_load(in_window: &[&Arc<Server>]) -> Option<Arc<Server>> {
    match in_window {
        [] => None,
        [only] => Some(Arc::clone(only)),
        _ => {
            let mut rng = rand::thread_rng();
            let first = rng.gen_range(0..in_window.len());
            let mut second = rng.gen_range(0..in_window.len() - 1);
            if second >= first {
                second += 1;
            }

            let (a, b) = (in_window[first], in_window[second]);
            let winner = if a.operation_count() <= b.operation_count() {
                a
            } else {
                b
            };
            Some(Arc::clone(winner))
        }
    }
}

impl TopologyDescription {
    /// The servers that selection may hand out for `criteria`: suitable for the topology type
    /// and read preference, not too stale, matching a tag set, and within the latency window.
    pub(crate) fn selection_candidates<'a>(
        &'a self,
        criteria: &'a SelectionCriteria,
    ) -> Result<Vec<&'a ServerDescription>> {
        if let Some(reason) = self.compatibility_error() {
            return Err(ErrorKind::IncompatibleServer {
                message: reason.clone(),
            }
            .into());
        }

        let mut candidates = match criteria {
            SelectionCriteria::ReadPreference(read_pref) => match self.topology_type() {
                // Nothing is known yet, so nothing can be selected yet.
                TopologyType::Unknown => Vec::new(),
                // The sole server is the answer no matter what was asked for.
                TopologyType::Single | TopologyType::LoadBalanced => {
                    self.servers.values().collect()
                }
                TopologyType::Sharded => self.members_of_type(ServerType::Mongos),
                TopologyType::ReplicaSetWithPrimary | TopologyType::ReplicaSetNoPrimary => {
                    self.replica_set_candidates(read_pref)?
                }
            },
            SelectionCriteria::Predicate(predicate) => self
                .servers
                .values()
                .filter(|description| {
                    // In direct mode the lone server is eligible whatever its role.
                    let role_ok = self.topology_type() == TopologyType::Single
                        || description.server_type.is_data_bearing();
                    role_ok && predicate(&ServerInfo::new_borrowed(description))
                })
                .collect(),
        };

        self.keep_within_latency_window(&mut candidates);

        Ok(candidates)
    }

    pub(crate) fn has_available_servers(&self) -> bool {
        self.servers.values().any(ServerDescription::is_available)
    }

    pub(crate) fn selection_timeout_message(&self, criteria: &SelectionCriteria) -> String {
        if self.has_available_servers() {
            format!(
                "Server selection timeout: none of the available servers is suitable for \
                 criteria {:?}. Topology: {}",
                criteria, self
            )
        } else {
            format!(
                "Server selection timeout: no servers are available. Topology: {}",
                self
            )
        }
    }

    fn members_of_type(&self, server_type: ServerType) -> Vec<&ServerDescription> {
        self.servers
            .values()
            .filter(|description| description.server_type == server_type)
            .collect()
    }

    /// Applies the read preference mode to a replica set. The preferred role is tried first;
    /// the "-preferred" modes fall back to the other role when the preferred one yields no
    /// eligible member.
    fn replica_set_candidates(
        &self,
        read_pref: &ReadPreference,
    ) -> Result<Vec<&ServerDescription>> {
        if let Some(max_staleness) = read_pref.max_staleness() {
            super::verify_max_staleness(max_staleness, self.heartbeat_frequency())?;
        }

        let candidates = match read_pref {
            ReadPreference::Primary => self.members_of_type(ServerType::RsPrimary),
            ReadPreference::Secondary { .. } => self.eligible_secondaries(read_pref),
            ReadPreference::PrimaryPreferred { .. } => {
                let primary = self.members_of_type(ServerType::RsPrimary);
                if primary.is_empty() {
                    self.eligible_secondaries(read_pref)
                } else {
                    primary
                }
            }
            ReadPreference::SecondaryPreferred { .. } => {
                let secondaries = self.eligible_secondaries(read_pref);
                if secondaries.is_empty() {
                    self.members_of_type(ServerType::RsPrimary)
                } else {
                    secondaries
                }
            }
            ReadPreference::Nearest { .. } => {
                let mut everyone: Vec<_> = self
                    .servers
                    .values()
                    .filter(|description| {
                        matches!(
                            description.server_type,
                            ServerType::RsPrimary | ServerType::RsSecondary
                        )
                    })
                    .collect();
                self.apply_member_filters(&mut everyone, read_pref);
                everyone
            }
        };

        Ok(candidates)
    }

    fn eligible_secondaries(&self, read_pref: &ReadPreference) -> Vec<&ServerDescription> {
        let mut secondaries = self.members_of_type(ServerType::RsSecondary);
        self.apply_member_filters(&mut secondaries, read_pref);
        secondaries
    }

    fn apply_member_filters(
        &self,
        candidates: &mut Vec<&ServerDescription>,
        read_pref: &ReadPreference,
    ) {
        if let Some(max_staleness) = read_pref.max_staleness() {
            // Zero or negative staleness bounds mean "no bound".
            if max_staleness > Duration::ZERO {
                self.filter_by_staleness(candidates, max_staleness);
            }
        }

        if let Some(tag_sets) = read_pref.tag_sets() {
            filter_by_tag_sets(candidates, tag_sets);
        }
    }

    /// Drops candidates estimated to be further behind the newest writes than
    /// `max_staleness`. The estimate is pessimistic by one heartbeat interval, since that is
    /// how old our knowledge of any server can be.
    fn filter_by_staleness(
        &self,
        candidates: &mut Vec<&ServerDescription>,
        max_staleness: Duration,
    ) {
        let limit_ms = i64::try_from(max_staleness.as_millis()).unwrap_or(i64::MAX);
        let heartbeat_ms =
            i64::try_from(self.heartbeat_frequency().as_millis()).unwrap_or(i64::MAX);

        let primary = self
            .servers
            .values()
            .find(|description| description.server_type == ServerType::RsPrimary);

        match primary {
            // With a primary, staleness is how much further a secondary's replication lags
            // behind the primary's own write recency.
            Some(primary) => {
                let primary_lag = write_lag_ms(primary);
                candidates.retain(|secondary| {
                    match (write_lag_ms(secondary), primary_lag) {
                        (Some(lag), Some(primary_lag)) => {
                            lag - primary_lag + heartbeat_ms <= limit_ms
                        }
                        // A member with unknown write recency cannot be shown to satisfy the
                        // bound.
                        _ => false,
                    }
                });
            }
            // Without a primary, the most recently written-to secondary stands in as the
            // reference point.
            None => {
                let newest_write_ms = self
                    .servers
                    .values()
                    .filter(|description| description.server_type == ServerType::RsSecondary)
                    .filter_map(ServerDescription::last_write_date)
                    .map(|date| date.timestamp_millis())
                    .max();
                let Some(newest_write_ms) = newest_write_ms else {
                    return;
                };

                candidates.retain(|secondary| match secondary.last_write_date() {
                    Some(written) => {
                        newest_write_ms - written.timestamp_millis() + heartbeat_ms <= limit_ms
                    }
                    None => false,
                });
            }
        }
    }

    /// Keeps only candidates whose average round trip time is within the local threshold of
    /// the fastest candidate.
    fn keep_within_latency_window(&self, candidates: &mut Vec<&ServerDescription>) {
        let threshold = self.local_threshold.unwrap_or(DEFAULT_LOCAL_THRESHOLD);

        let fastest = candidates
            .iter()
            .filter_map(|description| description.average_round_trip_time)
            .min();

        match fastest {
            Some(fastest) => {
                let cutoff = fastest.saturating_add(threshold);
                candidates.retain(|description| match description.average_round_trip_time {
                    Some(rtt) => rtt <= cutoff,
                    // Load balancers are not monitored and so never have an RTT; they are
                    // always in the window.
                    None => description.server_type == ServerType::LoadBalancer,
                });
            }
            None => {
                candidates
                    .retain(|description| description.server_type == ServerType::LoadBalancer);
            }
        }
    }
}

/// How far behind its own heartbeat a server's newest write was, in milliseconds.
fn write_lag_ms(description: &ServerDescription) -> Option<i64> {
    let checked = description.last_update_time?.timestamp_millis();
    let written = description.last_write_date()?.timestamp_millis();
    Some(checked - written)
}

/// Tag sets are tried in order; the first one that matches any candidate becomes the filter,
/// and if none matches anything, nothing is eligible.
fn filter_by_tag_sets(candidates: &mut Vec<&ServerDescription>, tag_sets: &[TagSet]) {
    if tag_sets.is_empty() {
        return;
    }

    let first_matching = tag_sets
        .iter()
        .find(|tags| candidates.iter().any(|c| c.has_all_tags(tags)));

    match first_matching {
        Some(tags) => candidates.retain(|candidate| candidate.has_all_tags(tags)),
        None => candidates.clear(),
    }
}

impl fmt::Display for TopologyDescription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{ Type: {}", self.topology_type)?;

        if let Some(ref name) = self.set_name {
            write!(f, ", Set Name: {}", name)?;
        }
        if let Some(version) = self.max_set_version {
            write!(f, ", Max Set Version: {}", version)?;
        }
        if let Some(id) = self.max_election_id {
            write!(f, ", Max Election ID: {}", id)?;
        }
        if let Some(ref error) = self.compatibility_error {
            write!(f, ", Compatibility Error: {}", error)?;
        }

        if !self.servers.is_empty() {
            let members: Vec<String> = self
                .servers
                .values()
                .map(|description| ServerInfo::new_borrowed(description).to_string())
                .collect();
            write!(f, ", Servers: [ {} ]", members.join(", "))?;
        }

        write!(f, " }}")
    }
}
