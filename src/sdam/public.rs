use std::{borrow::Cow, fmt, time::Duration};

use crate::{bson::DateTime, options::ServerAddress, selection_criteria::TagSet};

pub use super::description::{server::ServerType, topology::TopologyType};
use super::description::server::ServerDescription;

/// A description of the most up-to-date information known about a server.
#[derive(Clone, Debug)]
pub struct ServerInfo<'a> {
    description: Cow<'a, ServerDescription>,
}

impl<'a> ServerInfo<'a> {
    pub(crate) fn new_borrowed(description: &'a ServerDescription) -> Self {
        Self {
            description: Cow::Borrowed(description),
        }
    }

    /// Gets the address of the server.
    pub fn address(&self) -> &ServerAddress {
        &self.description.address
    }

    /// Gets the weighted average of the time it has taken for a heartbeat to round-trip
    /// between the driver and the server.
    pub fn average_round_trip_time(&self) -> Option<Duration> {
        self.description.average_round_trip_time
    }

    /// Gets the last time that the driver's monitor for the server updated the internal
    /// information about the server.
    pub fn last_update_time(&self) -> Option<DateTime> {
        self.description.last_update_time
    }

    /// Gets the maximum wire version that the server supports.
    pub fn max_wire_version(&self) -> Option<i32> {
        self.description.max_wire_version()
    }

    /// Gets the minimum wire version that the server supports.
    pub fn min_wire_version(&self) -> Option<i32> {
        self.description.wire_version_range().map(|(min, _)| min)
    }

    /// Gets the name of the replica set that the server is part of.
    pub fn replica_set_name(&self) -> Option<&str> {
        self.description.set_name()
    }

    /// Gets the version of the replica set config.
    pub fn replica_set_version(&self) -> Option<i32> {
        self.description.replica_set_version()
    }

    /// Gets the type of the server.
    pub fn server_type(&self) -> ServerType {
        self.description.server_type
    }

    /// Gets the tags associated with the server.
    pub fn tags(&self) -> Option<&TagSet> {
        self.description.tags()
    }

    /// Gets the error that occurred during the server's last heartbeat, if any.
    pub fn error(&self) -> Option<&crate::error::Error> {
        self.description.error()
    }
}

impl fmt::Display for ServerInfo<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ Address: {}, Type: {:?}",
            self.address(),
            self.server_type()
        )?;

        match self.error() {
            Some(error) => write!(f, ", Error: {}", error)?,
            None => {
                if let Some(avg_rtt) = self.average_round_trip_time() {
                    write!(f, ", Average RTT: {:?}", avg_rtt)?;
                }
                if let Some(last_update_time) = self.last_update_time() {
                    write!(f, ", Last Updated: {}", last_update_time)?;
                }
                if let Some(max_wire_version) = self.max_wire_version() {
                    write!(f, ", Max Wire Version: {}", max_wire_version)?;
                }
                if let Some(min_wire_version) = self.min_wire_version() {
                    write!(f, ", Min Wire Version: {}", min_wire_version)?;
                }
                if let Some(set_name) = self.replica_set_name() {
                    write!(f, ", Replica Set Name: {}", set_name)?;
                }
                if let Some(set_version) = self.replica_set_version() {
                    write!(f, ", Replica Set Version: {}", set_version)?;
                }
            }
        }

        write!(f, " }}")
    }
}
