use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

use super::{
    checkout::{self, CheckoutQueue, CheckoutRequester, CheckoutResponse, ConnectionRequest},
    conn::PendingConnection,
    establish::ConnectionEstablisher,
    manager::{EstablishedConnection, PoolCommand, PoolCommandReceiver, PoolManager},
    options::ConnectionPoolOptions,
    status,
    status::{PoolGenerationPublisher, PoolGenerationSubscriber},
    Connection,
    DEFAULT_MAX_POOL_SIZE,
};
use crate::{
    bson::oid::ObjectId,
    client::auth::Credential,
    error::{load_balanced_mode_mismatch, Error, Result},
    event::cmap::{
        CmapEventEmitter,
        ConnectionClosedEvent,
        ConnectionClosedReason,
        PoolClearedEvent,
        PoolClosedEvent,
        PoolReadyEvent,
    },
    options::ServerAddress,
    runtime::{self, AsyncJoinHandle, WorkerHandleListener},
    sdam::TopologyUpdater,
};

const DEFAULT_MAX_CONNECTING: u32 = 2;
const MAINTENANCE_FREQUENCY: Duration = Duration::from_millis(500);

/// The pool's sizing and timing knobs, fixed at construction.
struct PoolConfig {
    max_size: u32,
    min_size: u32,
    max_connecting: u32,
    max_idle_time: Option<Duration>,
    maintenance_interval: Duration,
}

impl PoolConfig {
    fn from_options(options: Option<&ConnectionPoolOptions>) -> Self {
        // An explicit zero means "never prune for idleness".
        let max_idle_time = options
            .and_then(|opts| opts.max_idle_time)
            .filter(|time| !time.is_zero());

        #[cfg(test)]
        let maintenance_interval = options
            .and_then(|opts| opts.background_thread_interval)
            .map(|interval| match interval {
                // A year is as good as never for a test, without risking interval overflow.
                super::options::BackgroundThreadInterval::Never => Duration::from_secs(31_556_952),
                super::options::BackgroundThreadInterval::Every(d) => d,
            })
            .unwrap_or(MAINTENANCE_FREQUENCY);
        #[cfg(not(test))]
        let maintenance_interval = MAINTENANCE_FREQUENCY;

        Self {
            max_size: options
                .and_then(|opts| opts.max_pool_size)
                .unwrap_or(DEFAULT_MAX_POOL_SIZE),
            min_size: options.and_then(|opts| opts.min_pool_size).unwrap_or(0),
            max_connecting: options
                .and_then(|opts| opts.max_connecting)
                .unwrap_or(DEFAULT_MAX_CONNECTING),
            max_idle_time,
            maintenance_interval,
        }
    }
}

/// Running totals for the connections a pool is responsible for.
#[derive(Default)]
struct ConnectionCounts {
    /// Every live or in-progress connection: idle, checked out, and pending alike. This is
    /// the number bounded by `max_size`.
    total: u32,

    /// Establishments currently in flight, bounded by `max_connecting`.
    pending: u32,

    /// The id the next created connection will get.
    next_id: u32,

    /// Per-service connection counts, tracked only behind a load balancer so that a
    /// service's generation entry can be retired with its last connection.
    per_service: HashMap<ObjectId, u32>,
}

/// The lifecycle states of a connection pool.
///
/// There is no "closed" state: a pool closes by its worker exiting once every checkout
/// requester is gone.
#[derive(Debug)]
enum PoolState {
    /// Freshly created and never yet usable. Like Paused, but distinguishable in errors.
    New,

    /// Not serving checkouts, and not creating reserve connections, until the server's
    /// monitor sees it healthy again. Carries the error that caused the pause.
    Paused(Error),

    /// Serving checkouts.
    Ready,
}

/// The task that owns a pool's state. All mutations funnel through its single event loop, so
/// the invariants (FIFO fairness, `total <= max_size`, generation monotonicity) hold without
/// any locking.
pub(crate) struct PoolWorker {
    address: ServerAddress,
    state: PoolState,

    /// Bumped on every clear; connections created under an older generation are discarded on
    /// their next touch rather than reused.
    generation: PoolGeneration,

    counts: ConnectionCounts,
    config: PoolConfig,

    /// Established connections waiting to be handed out. Checkouts reuse the most recently
    /// returned connection first, so the queue's front holds the longest-idle ones.
    idle: VecDeque<Connection>,

    /// Checkout requests in arrival order; the front of the line is always served first.
    waiters: VecDeque<ConnectionRequest>,

    establisher: ConnectionEstablisher,
    credential: Option<Credential>,
    event_emitter: CmapEventEmitter,
    manager: PoolManager,
    server_updater: TopologyUpdater,
    generation_publisher: PoolGenerationPublisher,

    commands: PoolCommandReceiver,
    checkouts: CheckoutQueue,

    /// Fires once the last checkout requester is dropped, which is the pool's cue to close.
    liveness: WorkerHandleListener,
}

impl PoolWorker {
    /// Spawns the worker for a new pool and returns the three handles to it: the manager for
    /// state changes, the requester for checkouts, and a subscriber to generation updates.
    pub(super) fn start(
        address: ServerAddress,
        establisher: ConnectionEstablisher,
        server_updater: TopologyUpdater,
        event_emitter: CmapEventEmitter,
        options: Option<ConnectionPoolOptions>,
    ) -> (PoolManager, CheckoutRequester, PoolGenerationSubscriber) {
        let config = PoolConfig::from_options(options.as_ref());

        let load_balanced = options
            .as_ref()
            .and_then(|opts| opts.load_balanced)
            .unwrap_or(false);
        let generation = if load_balanced {
            PoolGeneration::LoadBalanced(HashMap::new())
        } else {
            PoolGeneration::normal()
        };
        let (generation_publisher, generation_subscriber) = status::channel(generation.clone());

        let mut state = PoolState::New;
        #[cfg(test)]
        if options.as_ref().and_then(|opts| opts.ready) == Some(true) {
            state = PoolState::Ready;
        }
        if load_balanced {
            // With no monitor to declare the backend healthy, a load-balanced pool serves
            // checkouts from the start.
            state = PoolState::Ready;
        }

        let (liveness_handle, liveness) = WorkerHandleListener::channel();
        let (requester, checkouts) = checkout::channel(liveness_handle);
        let (manager, commands) = PoolManager::channel();

        let worker = PoolWorker {
            address,
            state,
            generation,
            counts: ConnectionCounts {
                next_id: 1,
                ..Default::default()
            },
            config,
            idle: VecDeque::new(),
            waiters: VecDeque::new(),
            establisher,
            credential: options.and_then(|opts| opts.credential),
            event_emitter,
            manager: manager.clone(),
            server_updater,
            generation_publisher,
            commands,
            checkouts,
            liveness,
        };

        runtime::spawn(worker.execute());

        (manager, requester, generation_subscriber)
    }

    async fn execute(mut self) {
        let mut maintenance = tokio::time::interval(self.config.maintenance_interval);

        loop {
            tokio::select! {
                // Management traffic is handled ahead of new checkouts so that a clear or a
                // returning connection is never starved behind a full wait queue, and pool
                // closure wins over everything.
                biased;

                Some(command) = self.commands.recv() => self.run_command(command),
                _ = self.liveness.wait_for_all_handle_drops() => break,
                Some(request) = self.checkouts.recv() => self.admit(request),
                _ = maintenance.tick() => self.perform_maintenance(),
                else => break,
            }

            // Whatever just happened may have freed capacity; hand it to the head of the
            // line. One request per wakeup, so this loop stays responsive to management.
            self.serve_waiting_checkouts();
        }

        self.close();
    }

    fn run_command(&mut self, command: PoolCommand) {
        match command {
            PoolCommand::CheckIn(connection) => self.receive(*connection),
            PoolCommand::Clear {
                cause,
                service_id,
                done,
            } => {
                self.clear(cause, service_id);
                done.acknowledge(());
            }
            PoolCommand::Ready { done } => {
                self.become_ready();
                done.acknowledge(());
            }
            PoolCommand::EstablishmentFailed => {
                // The reserved slot is surrendered.
                self.counts.total -= 1;
                self.counts.pending -= 1;
            }
            PoolCommand::EstablishmentSucceeded(outcome) => self.absorb_established(outcome),
        }
    }

    /// Takes in a brand-new checkout request: park it when serving, refuse it when not.
    fn admit(&mut self, request: ConnectionRequest) {
        match self.state {
            PoolState::Ready => self.waiters.push_back(request),
            PoolState::Paused(ref cause) => {
                // The requester may have timed out already; an unheard refusal is fine.
                let _ = request.respond(CheckoutResponse::Rejected(cause.clone()));
            }
            PoolState::New => {
                let _ = request.respond(CheckoutResponse::Rejected(Error::internal(
                    "checked out from a pool that was never marked ready",
                )));
            }
        }
    }

    fn can_reserve_slot(&self) -> bool {
        self.counts.total < self.config.max_size
            && self.counts.pending < self.config.max_connecting
    }

    fn serve_waiting_checkouts(&mut self) {
        if !matches!(self.state, PoolState::Ready) {
            return;
        }
        if self.idle.is_empty() && !self.can_reserve_slot() {
            return;
        }
        if let Some(request) = self.waiters.pop_front() {
            self.fulfill(request);
        }
    }

    /// Answers one checkout: with an idle connection when one survives pruning, otherwise by
    /// establishing on the requester's behalf.
    fn fulfill(&mut self, request: ConnectionRequest) {
        if let Some(mut connection) = self.next_usable_idle() {
            connection.lease(self.manager.clone());
            if let Err(unclaimed) = request.respond(CheckoutResponse::Ready(Box::new(connection)))
            {
                // The requester hit its deadline while parked; the connection goes straight
                // back on the shelf.
                if let Some(mut connection) = unclaimed.into_ready_connection() {
                    connection.park();
                    self.idle.push_back(connection);
                }
            }
            return;
        }

        if self.counts.total < self.config.max_size {
            let handle = self.establish_for_requester();
            // A requester that already gave up just leaves the establishment to finish in
            // the background; the connection will check itself in.
            let _ = request.respond(CheckoutResponse::Establishing(handle));
        } else {
            // Pruning emptied the shelf and the pool is at capacity: the request keeps its
            // place at the head of the line.
            self.waiters.push_front(request);
        }
    }

    /// Pops idle connections newest-first until one is still fit for use, discarding the
    /// stale and over-idle ones encountered on the way.
    fn next_usable_idle(&mut self) -> Option<Connection> {
        while let Some(connection) = self.idle.pop_back() {
            if connection.generation.is_stale(&self.generation) {
                self.discard(connection, ConnectionClosedReason::Stale);
            } else if connection.idle_longer_than(self.config.max_idle_time) {
                self.discard(connection, ConnectionClosedReason::Idle);
            } else {
                return Some(connection);
            }
        }
        None
    }

    /// Reserves a connection slot, which counts against `max_size` immediately even though
    /// the connection does not exist yet.
    fn reserve_slot(&mut self) -> PendingConnection {
        self.counts.total += 1;
        self.counts.pending += 1;

        let slot = PendingConnection {
            id: self.counts.next_id,
            address: self.address.clone(),
            generation: self.generation.clone(),
            event_emitter: self.event_emitter.clone(),
            time_created: Instant::now(),
        };
        self.counts.next_id += 1;
        self.event_emitter.emit_event(|| slot.created_event().into());

        slot
    }

    fn establishment_deps(&self) -> EstablishmentDeps {
        EstablishmentDeps {
            establisher: self.establisher.clone(),
            manager: self.manager.clone(),
            server_updater: self.server_updater.clone(),
            credential: self.credential.clone(),
            event_emitter: self.event_emitter.clone(),
        }
    }

    /// Starts an establishment whose connection will be handed to a waiting requester via the
    /// returned handle.
    fn establish_for_requester(&mut self) -> AsyncJoinHandle<Result<Connection>> {
        let deps = self.establishment_deps();
        let slot = self.reserve_slot();

        runtime::spawn(async move {
            let mut connection = run_establishment(&deps, slot).await?;
            connection.lease(deps.manager.clone());
            deps.manager
                .establishment_succeeded(EstablishedConnection::HandedOut {
                    service_id: connection.generation.service_id(),
                });
            Ok(connection)
        })
    }

    /// Starts an establishment whose connection will be stored as idle, for satisfying the
    /// pool's minimum size.
    fn establish_for_reserve(&mut self) {
        let deps = self.establishment_deps();
        let slot = self.reserve_slot();

        runtime::spawn(async move {
            if let Ok(connection) = run_establishment(&deps, slot).await {
                deps.manager
                    .establishment_succeeded(EstablishedConnection::Stored(Box::new(connection)));
            }
        });
    }

    /// Books a finished establishment into the counts, and shelves the connection if it was
    /// created for the reserve.
    fn absorb_established(&mut self, outcome: EstablishedConnection) {
        self.counts.pending -= 1;
        if let Some(service_id) = outcome.service_id() {
            *self.counts.per_service.entry(service_id).or_default() += 1;
        }
        if let EstablishedConnection::Stored(connection) = outcome {
            let mut connection = *connection;
            connection.park();
            self.idle.push_back(connection);
        }
    }

    /// Takes back a connection from an operation. Poisoned, stale, and abandoned-mid-reply
    /// connections are closed instead of shelved.
    fn receive(&mut self, mut connection: Connection) {
        self.event_emitter
            .emit_event(|| connection.checked_in_event().into());

        connection.park();

        let verdict = if connection.is_faulted() {
            Some(ConnectionClosedReason::Error)
        } else if connection.generation.is_stale(&self.generation) {
            Some(ConnectionClosedReason::Stale)
        } else if connection.has_unfinished_exchange() {
            Some(ConnectionClosedReason::Dropped)
        } else {
            None
        };

        match verdict {
            Some(reason) => self.discard(connection, reason),
            None => self.idle.push_back(connection),
        }
    }

    /// Advances the generation (for one service in load-balanced mode) and pauses the pool.
    /// Parked checkouts are woken with the cause rather than left to time out.
    fn clear(&mut self, cause: Error, service_id: Option<ObjectId>) {
        let newly_cleared = match (&mut self.generation, service_id) {
            (PoolGeneration::Normal(generation), None) => {
                *generation += 1;
                let previous = std::mem::replace(&mut self.state, PoolState::Paused(cause.clone()));
                matches!(previous, PoolState::Ready)
            }
            (PoolGeneration::LoadBalanced(map), Some(service_id)) => {
                *map.entry(service_id).or_insert(0) += 1;
                // Only the one service's connections age out; the pool keeps serving.
                true
            }
            _ => load_balanced_mode_mismatch!(),
        };
        self.generation_publisher.publish(self.generation.clone());

        if newly_cleared {
            tracing::debug!(address = %self.address, error = %cause, "connection pool cleared");
            self.event_emitter.emit_event(|| {
                PoolClearedEvent {
                    address: self.address.clone(),
                    service_id,
                }
                .into()
            });

            if service_id.is_none() {
                for waiter in self.waiters.drain(..) {
                    // A waiter that stopped listening was getting an error anyway.
                    let _ = waiter.respond(CheckoutResponse::Rejected(cause.clone()));
                }
            }
        }
    }

    fn become_ready(&mut self) {
        if matches!(self.state, PoolState::Ready) {
            return;
        }

        self.state = PoolState::Ready;
        self.event_emitter.emit_event(|| {
            PoolReadyEvent {
                address: self.address.clone(),
            }
            .into()
        });
    }

    /// Closes a connection for `reason` and releases its slot (and, in load-balanced mode,
    /// its service bookkeeping).
    fn discard(&mut self, connection: Connection, reason: ConnectionClosedReason) {
        if let Some(service_id) = connection.generation.service_id() {
            self.forget_service_connection(service_id);
        }
        connection.close_and_drop(reason);
        self.counts.total -= 1;
    }

    /// Drops one connection from a service's count; a service with no connections left has
    /// its generation entry retired too.
    fn forget_service_connection(&mut self, service_id: ObjectId) {
        match (
            self.counts.per_service.get_mut(&service_id),
            &mut self.generation,
        ) {
            (Some(count), PoolGeneration::LoadBalanced(map)) => {
                *count -= 1;
                if *count == 0 {
                    self.counts.per_service.remove(&service_id);
                    map.remove(&service_id);
                }
            }
            _ => load_balanced_mode_mismatch!(),
        }
    }

    /// Periodic housekeeping: shed perished idle connections and keep the reserve topped up.
    fn perform_maintenance(&mut self) {
        self.prune_idle();
        if matches!(self.state, PoolState::Ready) {
            self.top_up_reserve();
        }
    }

    /// Idle connections age from the front of the queue, so pruning can stop at the first
    /// keeper.
    fn prune_idle(&mut self) {
        while let Some(connection) = self.idle.pop_front() {
            if connection.generation.is_stale(&self.generation) {
                self.discard(connection, ConnectionClosedReason::Stale);
            } else if connection.idle_longer_than(self.config.max_idle_time) {
                self.discard(connection, ConnectionClosedReason::Idle);
            } else {
                self.idle.push_front(connection);
                break;
            }
        }
    }

    fn top_up_reserve(&mut self) {
        while self.counts.total < self.config.min_size
            && self.counts.pending < self.config.max_connecting
        {
            self.establish_for_reserve();
        }
    }

    fn close(mut self) {
        while let Some(connection) = self.idle.pop_front() {
            connection.close_and_drop(ConnectionClosedReason::PoolClosed);
        }

        self.event_emitter.emit_event(|| {
            PoolClosedEvent {
                address: self.address.clone(),
            }
            .into()
        });
    }
}

/// Everything an establishment task needs, detached from the worker so the worker keeps
/// processing while establishments run.
#[derive(Clone)]
struct EstablishmentDeps {
    establisher: ConnectionEstablisher,
    manager: PoolManager,
    server_updater: TopologyUpdater,
    credential: Option<Credential>,
    event_emitter: CmapEventEmitter,
}

/// Drives one establishment to completion. Failures are routed to the topology (so the server
/// can be marked unknown and the pool cleared as appropriate), reported to monitoring, and
/// booked against the pool's counts.
async fn run_establishment(
    deps: &EstablishmentDeps,
    slot: PendingConnection,
) -> Result<Connection> {
    let connection_id = slot.id;
    let address = slot.address.clone();

    match deps
        .establisher
        .establish_connection(slot, deps.credential.as_ref())
        .await
    {
        Ok(connection) => {
            deps.event_emitter
                .emit_event(|| connection.ready_event().into());
            Ok(connection)
        }
        Err(failure) => {
            deps.server_updater
                .handle_application_error(
                    address.clone(),
                    failure.cause.clone(),
                    failure.handshake_phase.clone(),
                )
                .await;
            deps.event_emitter.emit_event(|| {
                ConnectionClosedEvent {
                    address,
                    connection_id,
                    reason: ConnectionClosedReason::Error,
                    error: Some(failure.cause.clone()),
                }
                .into()
            });
            deps.manager.establishment_failed();
            Err(failure.cause)
        }
    }
}

/// The pool's current generation: a single counter normally, or a map of per-service counters
/// when connected through a load balancer.
#[derive(Debug, Clone)]
pub(crate) enum PoolGeneration {
    Normal(u32),
    LoadBalanced(HashMap<ObjectId, u32>),
}

impl PoolGeneration {
    pub(crate) fn normal() -> Self {
        Self::Normal(0)
    }

    /// The counter to compare a connection's generation against, scoped to the connection's
    /// service in load-balanced mode.
    pub(crate) fn as_u32(&self, service_id: Option<ObjectId>) -> Option<u32> {
        match (self, service_id) {
            (PoolGeneration::Normal(generation), None) => Some(*generation),
            (PoolGeneration::LoadBalanced(map), Some(service_id)) => {
                Some(map.get(&service_id).copied().unwrap_or(0))
            }
            _ => None,
        }
    }
}
