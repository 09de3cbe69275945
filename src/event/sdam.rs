//! Contains the events and functionality for monitoring server discovery and topology changes.

use std::time::Duration;

use crate::{
    bson::{oid::ObjectId, Document},
    error::Error,
    options::ServerAddress,
    sdam::{ServerDescription, TopologyDescription},
};

/// A description of the most up-to-date information known about a server, provided to
/// subscribers when it changes.
pub use crate::sdam::public::ServerInfo;

/// Published when a topology is initialized.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TopologyOpeningEvent {
    /// The unique ID of the topology.
    pub topology_id: ObjectId,
}

/// Published when a topology description changes.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TopologyDescriptionChangedEvent {
    /// The unique ID of the topology.
    pub topology_id: ObjectId,

    /// The topology's previous description.
    pub(crate) previous_description: TopologyDescription,

    /// The topology's new description.
    pub(crate) new_description: TopologyDescription,
}

impl TopologyDescriptionChangedEvent {
    /// The type the topology transitioned out of.
    pub fn previous_topology_type(&self) -> crate::TopologyType {
        self.previous_description.topology_type
    }

    /// The type the topology transitioned into.
    pub fn new_topology_type(&self) -> crate::TopologyType {
        self.new_description.topology_type
    }
}

/// Published when a topology is closed. This event is not published until the client associated
/// with the topology is shut down or dropped.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TopologyClosedEvent {
    /// The unique ID of the topology.
    pub topology_id: ObjectId,
}

/// Published when a server is initialized.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerOpeningEvent {
    /// The address of the server.
    pub address: ServerAddress,

    /// The unique ID of the topology.
    pub topology_id: ObjectId,
}

/// Published when a server description changes.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerDescriptionChangedEvent {
    /// The address of the server.
    pub address: ServerAddress,

    /// The unique ID of the topology.
    pub topology_id: ObjectId,

    /// The server's previous description.
    pub(crate) previous_description: ServerDescription,

    /// The server's new description.
    pub(crate) new_description: ServerDescription,
}

impl ServerDescriptionChangedEvent {
    /// Information about the server before it changed.
    pub fn previous_server_info(&self) -> ServerInfo {
        ServerInfo::new_borrowed(&self.previous_description)
    }

    /// Information about the server after it changed.
    pub fn new_server_info(&self) -> ServerInfo {
        ServerInfo::new_borrowed(&self.new_description)
    }
}

/// Published when a server is removed from the topology.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerClosedEvent {
    /// The address of the server.
    pub address: ServerAddress,

    /// The unique ID of the topology.
    pub topology_id: ObjectId,
}

/// Published when a server monitor's `hello` command is started.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatStartedEvent {
    /// The address of the server.
    pub server_address: ServerAddress,

    /// Whether the heartbeat is an awaited (streaming) check.
    pub awaited: bool,

    /// The driver-generated ID of the monitoring connection.
    pub driver_connection_id: u32,
}

/// Published when a server monitor's `hello` command succeeds.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatSucceededEvent {
    /// The execution time of the heartbeat.
    pub duration: Duration,

    /// The reply to the `hello` command.
    pub reply: Document,

    /// The address of the server.
    pub server_address: ServerAddress,

    /// Whether the heartbeat was an awaited (streaming) check.
    pub awaited: bool,

    /// The driver-generated ID of the monitoring connection.
    pub driver_connection_id: u32,
}

/// Published when a server monitor's `hello` command fails.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatFailedEvent {
    /// The execution time of the heartbeat.
    pub duration: Duration,

    /// The error that caused the heartbeat to fail.
    pub failure: Error,

    /// The address of the server.
    pub server_address: ServerAddress,

    /// Whether the heartbeat was an awaited (streaming) check.
    pub awaited: bool,

    /// The driver-generated ID of the monitoring connection.
    pub driver_connection_id: u32,
}

/// The set of topology and heartbeat events.
#[derive(Clone, Debug)]
pub(crate) enum SdamEvent {
    TopologyOpening(TopologyOpeningEvent),
    TopologyDescriptionChanged(Box<TopologyDescriptionChangedEvent>),
    TopologyClosed(TopologyClosedEvent),
    ServerOpening(ServerOpeningEvent),
    ServerDescriptionChanged(Box<ServerDescriptionChangedEvent>),
    ServerClosed(ServerClosedEvent),
    ServerHeartbeatStarted(ServerHeartbeatStartedEvent),
    ServerHeartbeatSucceeded(ServerHeartbeatSucceededEvent),
    ServerHeartbeatFailed(ServerHeartbeatFailedEvent),
}

/// Applications can implement this trait to specify custom logic to run on each SDAM event sent
/// by the driver.
#[allow(unused_variables)]
pub trait SdamEventHandler: Send + Sync {
    /// Called when a topology is initialized.
    fn handle_topology_opening_event(&self, event: TopologyOpeningEvent) {}

    /// Called when the topology description changes.
    fn handle_topology_description_changed_event(&self, event: TopologyDescriptionChangedEvent) {}

    /// Called when a topology is closed.
    fn handle_topology_closed_event(&self, event: TopologyClosedEvent) {}

    /// Called when a server is added to the topology.
    fn handle_server_opening_event(&self, event: ServerOpeningEvent) {}

    /// Called when a server's description changes.
    fn handle_server_description_changed_event(&self, event: ServerDescriptionChangedEvent) {}

    /// Called when a server is removed from the topology.
    fn handle_server_closed_event(&self, event: ServerClosedEvent) {}

    /// Called when a heartbeat is started.
    fn handle_server_heartbeat_started_event(&self, event: ServerHeartbeatStartedEvent) {}

    /// Called when a heartbeat succeeds.
    fn handle_server_heartbeat_succeeded_event(&self, event: ServerHeartbeatSucceededEvent) {}

    /// Called when a heartbeat fails.
    fn handle_server_heartbeat_failed_event(&self, event: ServerHeartbeatFailedEvent) {}
}
