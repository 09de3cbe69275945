//! Contains the events and functionality for monitoring the behavior of the connection pooling of
//! a `Client`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    bson::oid::ObjectId,
    error::Error,
    options::ServerAddress,
};

pub use crate::cmap::options::ConnectionPoolOptions;

/// Event emitted when a connection pool is created.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct PoolCreatedEvent {
    /// The address of the server that the pool's connections will connect to.
    pub address: ServerAddress,

    /// The options used for the pool.
    pub options: Option<ConnectionPoolOptions>,
}

/// Event emitted when a connection pool becomes ready.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct PoolReadyEvent {
    /// The address of the server that the pool's connections will connect to.
    pub address: ServerAddress,
}

/// Event emitted when a connection pool is cleared.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct PoolClearedEvent {
    /// The address of the server that the pool's connections will connect to.
    pub address: ServerAddress,

    /// The service id of connections affected by this event, if the client is connected to a
    /// load balancer.
    pub service_id: Option<ObjectId>,
}

/// Event emitted when a connection pool is closed.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct PoolClosedEvent {
    /// The address of the server that the pool's connections will connect to.
    pub address: ServerAddress,
}

/// Event emitted when a connection is created.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionCreatedEvent {
    /// The address of the server that the connection will connect to.
    pub address: ServerAddress,

    /// The unique ID of the connection. This is not used for anything internally, but can be
    /// used to identify other events related to this connection.
    pub connection_id: u32,
}

/// Event emitted when a connection is ready to be used. This indicates that all the necessary
/// prerequisites for using a connection (handshake, authentication, etc.) have been completed.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionReadyEvent {
    /// The address of the server that the connection is connected to.
    pub address: ServerAddress,

    /// The unique ID of the connection.
    pub connection_id: u32,

    /// The time it took to establish the connection.
    pub duration: Duration,
}

/// Event emitted when a connection is closed.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionClosedEvent {
    /// The address of the server that the connection was connected to.
    pub address: ServerAddress,

    /// The unique ID of the connection.
    pub connection_id: u32,

    /// The reason that the connection was closed.
    pub reason: ConnectionClosedReason,

    /// The error that caused the connection to close, if any.
    pub(crate) error: Option<Error>,
}

/// The reasons that a connection may be closed.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum ConnectionClosedReason {
    /// The connection pool has been cleared since the connection was created.
    Stale,

    /// The connection has been available for longer than `max_idle_time` without being used.
    Idle,

    /// An error occurred while using the connection.
    Error,

    /// The connection was dropped during read or write.
    Dropped,

    /// The pool that the connection belongs to has been closed.
    PoolClosed,
}

/// Event emitted when a thread begins checking out a connection to use for an operation.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionCheckoutStartedEvent {
    /// The address of the server that the connection will connect to.
    pub address: ServerAddress,
}

/// Event emitted when a thread is unable to check out a connection.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionCheckoutFailedEvent {
    /// The address of the server that the connection would have connected to.
    pub address: ServerAddress,

    /// The reason a connection was unable to be checked out.
    pub reason: ConnectionCheckoutFailedReason,

    /// The error that caused the checkout to fail, if any.
    pub(crate) error: Option<Error>,

    /// The time it took for the checkout attempt to fail.
    pub duration: Duration,
}

/// The reasons a connection may not be able to be checked out.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum ConnectionCheckoutFailedReason {
    /// The pool was closed or cleared before the checkout could complete.
    PoolClosed,

    /// The `wait_queue_timeout` has elapsed while waiting for a connection to be available.
    Timeout,

    /// An error occurred while trying to establish a connection (e.g. during the handshake or
    /// authentication).
    ConnectionError,
}

/// Event emitted when a connection is successfully checked out.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionCheckedOutEvent {
    /// The address of the server that the connection will connect to.
    pub address: ServerAddress,

    /// The unique ID of the connection.
    pub connection_id: u32,

    /// The time it took to check out the connection.
    pub duration: Duration,
}

/// Event emitted when a connection is checked back into a connection pool.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionCheckedInEvent {
    /// The address of the server that the connection was connected to.
    pub address: ServerAddress,

    /// The unique ID of the connection.
    pub connection_id: u32,
}

/// The set of connection pool events.
#[derive(Clone, Debug)]
pub(crate) enum CmapEvent {
    PoolCreated(PoolCreatedEvent),
    PoolReady(PoolReadyEvent),
    PoolCleared(PoolClearedEvent),
    PoolClosed(PoolClosedEvent),
    ConnectionCreated(ConnectionCreatedEvent),
    ConnectionReady(ConnectionReadyEvent),
    ConnectionClosed(ConnectionClosedEvent),
    ConnectionCheckoutStarted(ConnectionCheckoutStartedEvent),
    ConnectionCheckoutFailed(ConnectionCheckoutFailedEvent),
    ConnectionCheckedOut(ConnectionCheckedOutEvent),
    ConnectionCheckedIn(ConnectionCheckedInEvent),
}

macro_rules! cmap_event_from {
    ($variant:ident, $event:ty) => {
        impl From<$event> for CmapEvent {
            fn from(event: $event) -> Self {
                CmapEvent::$variant(event)
            }
        }
    };
}

cmap_event_from!(PoolCreated, PoolCreatedEvent);
cmap_event_from!(PoolReady, PoolReadyEvent);
cmap_event_from!(PoolCleared, PoolClearedEvent);
cmap_event_from!(PoolClosed, PoolClosedEvent);
cmap_event_from!(ConnectionCreated, ConnectionCreatedEvent);
cmap_event_from!(ConnectionReady, ConnectionReadyEvent);
cmap_event_from!(ConnectionClosed, ConnectionClosedEvent);
cmap_event_from!(ConnectionCheckoutStarted, ConnectionCheckoutStartedEvent);
cmap_event_from!(ConnectionCheckoutFailed, ConnectionCheckoutFailedEvent);
cmap_event_from!(ConnectionCheckedOut, ConnectionCheckedOutEvent);
cmap_event_from!(ConnectionCheckedIn, ConnectionCheckedInEvent);

/// Emits CMAP events to the client's dispatcher. Cloned into each pool and connection so they
/// can report their lifecycle without holding any reference back to the client.
#[derive(Clone, Debug)]
pub(crate) struct CmapEventEmitter {
    inner: crate::event::EventEmitter,
}

impl CmapEventEmitter {
    pub(crate) fn new(inner: crate::event::EventEmitter) -> Self {
        Self { inner }
    }

    pub(crate) fn emit_event<F>(&self, generate_event: F)
    where
        F: FnOnce() -> CmapEvent,
    {
        self.inner.emit(generate_event());
    }
}

/// Applications can implement this trait to specify custom logic to run on each CMAP event sent
/// by the driver. Each method has a no-op default, so implementations only need to override the
/// events they care about.
#[allow(unused_variables)]
pub trait CmapEventHandler: Send + Sync {
    /// Called whenever a connection pool is created.
    fn handle_pool_created_event(&self, event: PoolCreatedEvent) {}

    /// Called whenever a connection pool is marked as ready for use.
    fn handle_pool_ready_event(&self, event: PoolReadyEvent) {}

    /// Called whenever a connection pool is cleared.
    fn handle_pool_cleared_event(&self, event: PoolClearedEvent) {}

    /// Called whenever a connection pool is closed.
    fn handle_pool_closed_event(&self, event: PoolClosedEvent) {}

    /// Called whenever a connection is created.
    fn handle_connection_created_event(&self, event: ConnectionCreatedEvent) {}

    /// Called whenever a connection finishes its handshake and authentication.
    fn handle_connection_ready_event(&self, event: ConnectionReadyEvent) {}

    /// Called whenever a connection is closed.
    fn handle_connection_closed_event(&self, event: ConnectionClosedEvent) {}

    /// Called whenever a checkout request is made.
    fn handle_connection_checkout_started_event(&self, event: ConnectionCheckoutStartedEvent) {}

    /// Called whenever a checkout request fails.
    fn handle_connection_checkout_failed_event(&self, event: ConnectionCheckoutFailedEvent) {}

    /// Called whenever a connection is checked out of a pool.
    fn handle_connection_checked_out_event(&self, event: ConnectionCheckedOutEvent) {}

    /// Called whenever a connection is checked back into a pool.
    fn handle_connection_checked_in_event(&self, event: ConnectionCheckedInEvent) {}
}
