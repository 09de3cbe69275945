mod command;
pub(crate) mod stream_description;
pub(crate) mod wire;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use derive_where::derive_where;
use serde::Serialize;
use tokio::{
    io::BufStream,
    sync::{mpsc, Mutex},
};

use self::wire::{Message, MessageFlags};
use super::manager::PoolManager;
use crate::{
    bson::oid::ObjectId,
    cmap::PoolGeneration,
    compression::Compressor,
    error::{load_balanced_mode_mismatch, Error, ErrorKind, Result},
    event::cmap::{
        CmapEventEmitter,
        ConnectionCheckedInEvent,
        ConnectionCheckedOutEvent,
        ConnectionClosedEvent,
        ConnectionClosedReason,
        ConnectionCreatedEvent,
        ConnectionReadyEvent,
    },
    options::ServerAddress,
    runtime::AsyncStream,
};
pub(crate) use command::{Command, RawCommandResponse};
pub(crate) use stream_description::StreamDescription;

/// User-facing information about a connection to the database.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ConnectionInfo {
    /// A driver-generated identifier that uniquely identifies the connection within its pool.
    pub id: u32,

    /// A server-generated identifier that uniquely identifies the connection. This may be
    /// used to correlate driver connections with server logs.
    pub server_id: Option<i64>,

    /// The address that the connection is connected to.
    pub address: ServerAddress,
}

/// Where a connection currently lives relative to its pool.
#[derive(Debug)]
enum Attachment {
    /// Checked into the pool and unused since the recorded instant.
    Idle { since: Instant },

    /// Checked out; the held manager is how the connection finds its way back on drop.
    Leased { pool: PoolManager },

    /// Not owned by any pool: a monitoring connection, or one mid-transfer.
    Detached,
}

/// The transport half of a connection: the buffered stream plus the bookkeeping needed to
/// keep request/reply exchanges strictly sequential and to poison the connection after an
/// I/O failure.
#[derive_where(Debug)]
struct WireState {
    #[derive_where(skip)]
    stream: BufStream<AsyncStream>,

    /// Set while a request has been written whose reply has not been fully read. If the task
    /// driving the exchange is cancelled in that window, the reply can no longer be
    /// correlated and the connection must not be reused.
    busy: bool,

    /// Whether the server announced (via the moreToCome flag) that it will keep sending
    /// replies without further requests.
    more_to_come: bool,

    /// The first I/O error seen on this stream. A faulted connection is closed at check-in.
    fault: Option<Error>,
}

impl WireState {
    async fn write(&mut self, message: &Message, compressor: Option<&Compressor>) -> Result<()> {
        let outcome = match compressor {
            Some(compressor) => message.write_compressed_to(&mut self.stream, compressor).await,
            None => message.write_to(&mut self.stream).await,
        };
        if let Err(ref error) = outcome {
            self.fault = Some(error.clone());
        }
        outcome
    }

    async fn read(&mut self, size_limit: Option<i32>) -> Result<Message> {
        let outcome = Message::read_from(&mut self.stream, size_limit).await;
        if let Err(ref error) = outcome {
            self.fault = Some(error.clone());
        }
        outcome
    }
}

/// One authenticated duplex channel to a server, carrying framed commands one at a time.
#[derive(Debug)]
pub(crate) struct Connection {
    /// Driver-generated ID for the connection, unique within its pool.
    pub(crate) id: u32,

    /// Server-generated ID for the connection, learned in the handshake.
    pub(crate) server_id: Option<i64>,

    pub(crate) address: ServerAddress,

    /// The pool generation this connection was created under. A connection whose generation
    /// is behind its pool's is stale and will never be reused.
    pub(crate) generation: ConnectionGeneration,

    pub(crate) time_created: Instant,

    /// The handshake's summary of the server, cached for the connection's lifetime.
    pub(super) stream_description: Option<StreamDescription>,

    /// The compressor negotiated in the handshake, applied to eligible outgoing commands.
    /// Inbound messages are decompressed by whatever algorithm the server chose, regardless
    /// of this field.
    pub(super) compressor: Option<Compressor>,

    attachment: Attachment,

    wire: WireState,

    /// When pinned to a cursor or transaction, the channel that returns this connection to
    /// the pin holder instead of the pool.
    pinned_sender: Option<mpsc::Sender<Connection>>,

    /// Emitter for this connection's lifecycle events; absent on monitoring connections,
    /// which are not observable.
    event_emitter: Option<CmapEventEmitter>,
}

impl Connection {
    fn new(
        address: ServerAddress,
        stream: AsyncStream,
        id: u32,
        generation: ConnectionGeneration,
        time_created: Instant,
    ) -> Self {
        Self {
            id,
            server_id: None,
            address,
            generation,
            time_created,
            stream_description: None,
            compressor: None,
            attachment: Attachment::Detached,
            wire: WireState {
                stream: BufStream::new(stream),
                busy: false,
                more_to_come: false,
                fault: None,
            },
            pinned_sender: None,
            event_emitter: None,
        }
    }

    /// Creates a connection destined for a connection pool.
    pub(crate) fn new_pooled(pending: PendingConnection, stream: AsyncStream) -> Self {
        let generation = match pending.generation {
            PoolGeneration::Normal(gen) => ConnectionGeneration::Normal(gen),
            // The true generation is only knowable once the handshake reveals the backend.
            PoolGeneration::LoadBalanced(_) => ConnectionGeneration::LoadBalanced(None),
        };
        let mut connection = Self::new(
            pending.address,
            stream,
            pending.id,
            generation,
            pending.time_created,
        );
        connection.event_emitter = Some(pending.event_emitter);
        connection
    }

    /// Creates a dedicated monitoring connection. It never enters a pool and emits no events.
    pub(crate) fn new_monitoring(address: ServerAddress, stream: AsyncStream, id: u32) -> Self {
        Self::new(
            address,
            stream,
            id,
            ConnectionGeneration::Monitoring,
            Instant::now(),
        )
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            server_id: self.server_id,
            address: self.address.clone(),
        }
    }

    pub(crate) fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub(crate) fn service_id(&self) -> Option<ObjectId> {
        self.stream_description
            .as_ref()
            .and_then(|description| description.service_id)
    }

    /// Marks the connection as checked out, remembering how to return it.
    pub(super) fn lease(&mut self, pool: PoolManager) {
        self.attachment = Attachment::Leased { pool };
    }

    /// Marks the connection as checked in and starts its idle clock.
    pub(super) fn park(&mut self) {
        self.attachment = Attachment::Idle {
            since: Instant::now(),
        };
    }

    /// Whether the connection has sat idle in the pool for at least `limit`.
    pub(super) fn idle_longer_than(&self, limit: Option<Duration>) -> bool {
        match (limit, &self.attachment) {
            (Some(limit), Attachment::Idle { since }) => since.elapsed() >= limit,
            _ => false,
        }
    }

    /// Whether an I/O error has poisoned this connection.
    pub(super) fn is_faulted(&self) -> bool {
        self.wire.fault.is_some()
    }

    /// Whether a request was written whose reply never finished arriving; such a connection
    /// may have reply bytes in flight and cannot be reused.
    pub(super) fn has_unfinished_exchange(&self) -> bool {
        self.wire.busy
    }

    /// Whether the server has promised further replies without new requests.
    pub(crate) fn is_streaming(&self) -> bool {
        self.wire.more_to_come
    }

    /// Whether the server this connection talks to supports sessions.
    pub(crate) fn supports_sessions(&self) -> bool {
        self.stream_description
            .as_ref()
            .map(|description| description.logical_session_timeout.is_some())
            .unwrap_or(false)
    }

    pub(crate) fn stream_description(&self) -> Result<&StreamDescription> {
        self.stream_description.as_ref().ok_or_else(|| {
            ErrorKind::Internal {
                message: "connection used before its handshake completed".to_string(),
            }
            .into()
        })
    }

    fn reply_size_limit(&self) -> Option<i32> {
        self.stream_description
            .as_ref()
            .map(|description| description.max_message_size_bytes)
    }

    /// Writes one message and reads its reply. Commands on one connection are strictly
    /// sequential; interleaving is rejected rather than queued.
    pub(crate) async fn send_message(
        &mut self,
        message: Message,
        to_compress: bool,
    ) -> Result<RawCommandResponse> {
        if self.wire.more_to_come {
            return Err(Error::internal(format!(
                "attempted a request to {} while its replies are still streaming",
                self.address
            )));
        }

        let compressor = if to_compress {
            self.compressor.clone()
        } else {
            None
        };

        self.wire.busy = true;
        self.wire.write(&message, compressor.as_ref()).await?;

        let reply = self.wire.read(self.reply_size_limit()).await;
        self.wire.busy = false;

        let reply = reply?;
        self.wire.more_to_come = reply.flags.contains(MessageFlags::MORE_TO_COME);

        RawCommandResponse::new(self.address.clone(), reply)
    }

    /// Builds the wire message for `command` and exchanges it.
    ///
    /// An `Ok` result means the exchange completed; whether the command itself succeeded is
    /// for the caller to judge from the reply body.
    pub(crate) async fn send_command(
        &mut self,
        command: Command,
        request_id: impl Into<Option<i32>>,
    ) -> Result<RawCommandResponse> {
        let to_compress = command.should_compress();
        let message = Message::from_command(command, request_id.into());
        self.send_message(message, to_compress).await
    }

    /// Reads the next streamed reply. Only valid while [`Connection::is_streaming`] is true.
    pub(crate) async fn receive_message(&mut self) -> Result<RawCommandResponse> {
        if !self.wire.more_to_come {
            return Err(Error::internal(format!(
                "attempted to await a streamed reply from {} outside of streaming",
                self.address
            )));
        }

        self.wire.busy = true;
        let reply = self.wire.read(self.reply_size_limit()).await;
        self.wire.busy = false;

        let reply = reply?;
        self.wire.more_to_come = reply.flags.contains(MessageFlags::MORE_TO_COME);

        RawCommandResponse::new(self.address.clone(), reply)
    }

    /// Diverts this connection from the pool to a pin holder: on drop it travels through the
    /// returned handle instead of checking in. Used for transactions and cursors that must
    /// stay on one connection.
    pub(crate) fn pin(&mut self) -> Result<PinnedConnectionHandle> {
        if self.pinned_sender.is_some() {
            return Err(Error::internal(format!(
                "connection {} is already pinned",
                self.id
            )));
        }
        if !matches!(self.attachment, Attachment::Leased { .. }) {
            return Err(Error::internal(format!(
                "only a checked-out connection can be pinned (id = {})",
                self.id
            )));
        }

        let (sender, receiver) = mpsc::channel(1);
        self.pinned_sender = Some(sender);
        Ok(PinnedConnectionHandle {
            id: self.id,
            receiver: Arc::new(Mutex::new(receiver)),
        })
    }

    /// Permanently closes this connection, reporting `reason` to monitoring.
    pub(super) fn close_and_drop(mut self, reason: ConnectionClosedReason) {
        self.close(reason);
    }

    fn close(&mut self, reason: ConnectionClosedReason) {
        self.attachment = Attachment::Detached;
        if let Some(ref emitter) = self.event_emitter {
            emitter.emit_event(|| self.closed_event(reason).into());
        }
    }

    /// Moves the connection's guts into a fresh value so `Drop` can ship it elsewhere. The
    /// drained original is left detached with a dead stream.
    fn extract(&mut self) -> Connection {
        Connection {
            id: self.id,
            server_id: self.server_id,
            address: self.address.clone(),
            generation: self.generation,
            time_created: self.time_created,
            stream_description: self.stream_description.take(),
            compressor: self.compressor.take(),
            attachment: Attachment::Detached,
            wire: WireState {
                stream: std::mem::replace(&mut self.wire.stream, BufStream::new(AsyncStream::Null)),
                busy: self.wire.busy,
                more_to_come: false,
                fault: self.wire.fault.take(),
            },
            pinned_sender: self.pinned_sender.clone(),
            event_emitter: self.event_emitter.take(),
        }
    }

    pub(super) fn checked_out_event(&self, time_started: Instant) -> ConnectionCheckedOutEvent {
        ConnectionCheckedOutEvent {
            address: self.address.clone(),
            connection_id: self.id,
            duration: time_started.elapsed(),
        }
    }

    pub(super) fn checked_in_event(&self) -> ConnectionCheckedInEvent {
        ConnectionCheckedInEvent {
            address: self.address.clone(),
            connection_id: self.id,
        }
    }

    pub(super) fn ready_event(&self) -> ConnectionReadyEvent {
        ConnectionReadyEvent {
            address: self.address.clone(),
            connection_id: self.id,
            duration: self.time_created.elapsed(),
        }
    }

    pub(super) fn closed_event(&self, reason: ConnectionClosedReason) -> ConnectionClosedEvent {
        ConnectionClosedEvent {
            address: self.address.clone(),
            connection_id: self.id,
            reason,
            error: self.wire.fault.clone(),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Only a leased connection has anywhere to go on drop: back to its pin holder if
        // pinned, otherwise back to its pool. Idle and detached connections are closed
        // explicitly by their owners before being dropped.
        let previous = std::mem::replace(&mut self.attachment, Attachment::Detached);
        let Attachment::Leased { pool } = previous else {
            return;
        };

        let mut freed = self.extract();

        if let Some(sender) = self.pinned_sender.clone() {
            // Keep the lease alive across the pin channel so that the connection still finds
            // its pool if the pin holder disappears.
            freed.lease(pool.clone());
            let rejected = match sender.try_send(freed) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Closed(conn)) => conn,
                Err(mpsc::error::TrySendError::Full(conn)) => {
                    // Two connections bound for one pin buffer cannot happen; recover by
                    // treating it as unpinned.
                    tracing::error!(
                        connection_id = conn.id,
                        "pinned connection buffer unexpectedly full"
                    );
                    conn
                }
            };

            let mut conn = rejected;
            conn.pinned_sender = None;
            conn.attachment = Attachment::Detached;
            if let Err(mut conn) = pool.check_in(conn) {
                conn.close(ConnectionClosedReason::PoolClosed);
            }
        } else if let Err(mut conn) = pool.check_in(freed) {
            // The pool has shut down; nothing left to do but report the closure.
            conn.close(ConnectionClosedReason::PoolClosed);
        }
    }
}

/// A handle to a pinned connection: the pin holder retrieves the connection from it for each
/// use, and the connection flows back into it after every drop.
#[derive(Debug)]
pub(crate) struct PinnedConnectionHandle {
    id: u32,
    receiver: Arc<Mutex<mpsc::Receiver<Connection>>>,
}

impl PinnedConnectionHandle {
    /// Creates another handle to the same pinned connection, for lending it out in ways a
    /// plain borrow cannot express.
    #[allow(unused)]
    pub(crate) fn replicate(&self) -> Self {
        Self {
            id: self.id,
            receiver: self.receiver.clone(),
        }
    }

    /// Waits for the pinned connection to come back from its previous use. Fails if it has
    /// been unpinned in the meantime.
    pub(crate) async fn take_connection(&self) -> Result<Connection> {
        let mut receiver = self.receiver.lock().await;
        receiver.recv().await.ok_or_else(|| {
            Error::internal(format!(
                "pinned connection {} was unpinned before it could be reused",
                self.id
            ))
        })
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct LoadBalancedGeneration {
    pub(crate) generation: u32,
    pub(crate) service_id: ObjectId,
}

/// The generation a connection was created under: a plain counter normally, or a per-service
/// counter behind a load balancer (unknowable until the handshake names the service).
#[derive(Debug, Clone, Copy)]
pub(crate) enum ConnectionGeneration {
    Monitoring,
    Normal(u32),
    LoadBalanced(Option<LoadBalancedGeneration>),
}

impl ConnectionGeneration {
    pub(crate) fn service_id(self) -> Option<ObjectId> {
        match self {
            ConnectionGeneration::LoadBalanced(Some(lb)) => Some(lb.service_id),
            _ => None,
        }
    }

    /// Whether this connection predates `current` and must therefore not be reused.
    pub(crate) fn is_stale(self, current: &PoolGeneration) -> bool {
        match (self, current) {
            (ConnectionGeneration::Normal(mine), PoolGeneration::Normal(pools)) => mine != *pools,
            (ConnectionGeneration::LoadBalanced(Some(mine)), PoolGeneration::LoadBalanced(map)) => {
                mine.generation != map.get(&mine.service_id).copied().unwrap_or(0)
            }
            // A handshake failure can leave the service unknown; with no service to compare
            // against, the connection is not considered stale.
            (ConnectionGeneration::LoadBalanced(None), PoolGeneration::LoadBalanced(_)) => false,
            (ConnectionGeneration::Monitoring, _) => false,
            _ => load_balanced_mode_mismatch!(false),
        }
    }
}

impl From<LoadBalancedGeneration> for ConnectionGeneration {
    fn from(lb: LoadBalancedGeneration) -> Self {
        ConnectionGeneration::LoadBalanced(Some(lb))
    }
}

/// A reserved slot for a connection that is still being established. The slot counts against
/// the pool's size limit from the moment it is created, so concurrent establishment can never
/// overshoot the cap.
pub(crate) struct PendingConnection {
    pub(crate) id: u32,
    pub(crate) address: ServerAddress,
    pub(crate) generation: PoolGeneration,
    pub(crate) event_emitter: CmapEventEmitter,
    pub(crate) time_created: Instant,
}

impl PendingConnection {
    pub(super) fn created_event(&self) -> ConnectionCreatedEvent {
        ConnectionCreatedEvent {
            address: self.address.clone(),
            connection_id: self.id,
        }
    }
}
