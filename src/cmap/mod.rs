#[cfg(test)]
mod test;

mod checkout;
pub(crate) mod conn;
pub(crate) mod establish;
mod manager;
pub(crate) mod options;
mod status;
mod worker;

use std::time::Instant;

use derive_where::derive_where;

pub use self::conn::ConnectionInfo;
pub(crate) use self::{
    conn::{Command, Connection, PinnedConnectionHandle, RawCommandResponse, StreamDescription},
    worker::PoolGeneration,
};
use self::{
    checkout::{CheckoutRequester, CheckoutResponse},
    establish::ConnectionEstablisher,
    manager::PoolManager,
    options::ConnectionPoolOptions,
    status::PoolGenerationSubscriber,
    worker::PoolWorker,
};
use crate::{
    bson::oid::ObjectId,
    error::{Error, Result},
    event::cmap::{
        CmapEventEmitter,
        ConnectionCheckoutFailedEvent,
        ConnectionCheckoutFailedReason,
        ConnectionCheckoutStartedEvent,
        PoolCreatedEvent,
    },
    options::ServerAddress,
    sdam::TopologyUpdater,
};

pub(crate) const DEFAULT_MAX_POOL_SIZE: u32 = 100;

/// A bounded pool of established connections to one server.
///
/// This type is actually a handle to a task that manages the connections and is cheap to clone
/// and pass around.
#[derive_where(Debug)]
#[derive(Clone)]
pub(crate) struct ConnectionPool {
    address: ServerAddress,
    manager: PoolManager,
    requester: CheckoutRequester,
    generation_subscriber: PoolGenerationSubscriber,

    wait_queue_timeout: Option<std::time::Duration>,

    #[derive_where(skip)]
    event_emitter: CmapEventEmitter,
}

impl ConnectionPool {
    pub(crate) fn new(
        address: ServerAddress,
        connection_establisher: ConnectionEstablisher,
        server_updater: TopologyUpdater,
        event_emitter: CmapEventEmitter,
        options: Option<ConnectionPoolOptions>,
    ) -> Self {
        let wait_queue_timeout = options.as_ref().and_then(|opts| opts.wait_queue_timeout);

        let (manager, requester, generation_subscriber) = PoolWorker::start(
            address.clone(),
            connection_establisher,
            server_updater,
            event_emitter.clone(),
            options.clone(),
        );

        event_emitter.emit_event(|| {
            PoolCreatedEvent {
                address: address.clone(),
                options,
            }
            .into()
        });

        Self {
            address,
            manager,
            requester,
            generation_subscriber,
            wait_queue_timeout,
            event_emitter,
        }
    }

    /// Checks out a connection from the pool. The request waits its turn behind earlier ones;
    /// first to ask is first served.
    pub(crate) async fn check_out(&self) -> Result<Connection> {
        let time_started = Instant::now();
        self.event_emitter.emit_event(|| {
            ConnectionCheckoutStartedEvent {
                address: self.address.clone(),
            }
            .into()
        });

        let checkout = async {
            match self.requester.request().await {
                CheckoutResponse::Ready(connection) => Ok(*connection),
                CheckoutResponse::Establishing(establishment) => establishment.await,
                CheckoutResponse::Rejected(cause) => {
                    Err(Error::pool_cleared_error(&self.address, &cause))
                }
            }
        };

        // The deadline covers both waiting in the queue and any establishment performed on
        // this request's behalf. An abandoned establishment continues in the background and
        // lands in the pool when it completes.
        let outcome = match self.wait_queue_timeout {
            Some(timeout) => crate::runtime::timeout(timeout, checkout)
                .await
                .unwrap_or_else(|_| Err(Error::wait_queue_timeout(&self.address))),
            None => checkout.await,
        };

        match outcome {
            Ok(ref connection) => {
                self.event_emitter
                    .emit_event(|| connection.checked_out_event(time_started).into());
            }
            Err(ref error) => {
                let duration = time_started.elapsed();
                let reason = if matches!(
                    error.kind.as_ref(),
                    crate::error::ErrorKind::WaitQueueTimeout { .. }
                ) {
                    ConnectionCheckoutFailedReason::Timeout
                } else if error.is_pool_cleared() {
                    ConnectionCheckoutFailedReason::PoolClosed
                } else {
                    ConnectionCheckoutFailedReason::ConnectionError
                };
                tracing::debug!(address = %self.address, error = %error, "connection check out failed");
                self.event_emitter.emit_event(|| {
                    ConnectionCheckoutFailedEvent {
                        address: self.address.clone(),
                        reason,
                        error: Some(error.clone()),
                        duration,
                    }
                    .into()
                });
            }
        }

        outcome
    }

    /// Increments the generation of the pool, or of the specified service in load-balanced
    /// mode. Rather than eagerly closing stale connections in the pool, they are closed when
    /// they attempt to be checked out or back in.
    pub(crate) async fn clear(&self, cause: Error, service_id: Option<ObjectId>) {
        self.manager
            .clear(cause, service_id)
            .wait_for_acknowledgment()
            .await;
    }

    /// Marks the pool as "ready", allowing connections to be created and checked out.
    pub(crate) async fn mark_as_ready(&self) {
        self.manager.mark_as_ready().wait_for_acknowledgment().await;
    }

    pub(crate) fn generation(&self) -> PoolGeneration {
        self.generation_subscriber.generation()
    }
}
