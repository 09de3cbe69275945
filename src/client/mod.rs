pub(crate) mod auth;
mod executor;
pub(crate) mod options;
pub(crate) mod session;
#[cfg(test)]
mod test;

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
        LazyLock,
    },
    time::{Duration, Instant},
};

use derive_where::derive_where;

use crate::{
    bson::Document,
    concern::WriteConcern,
    cursor::CursorSpecification,
    error::{ErrorKind, Result},
    event::{command::CommandEvent, start_dispatcher, EventEmitter, MonitoringRegistry},
    hello::LEGACY_HELLO_COMMAND_NAME_LOWERCASE,
    operation::{
        EndSessions,
        Find,
        FindOptions,
        GetMore,
        Insert,
        InsertManyResult,
        Operation,
        RunCommand,
    },
    options::{ClientOptions, ServerAddress, SessionOptions},
    sdam::{try_select_server, SelectedServer, Topology, TransactionSupportStatus},
    selection_criteria::{ReadPreference, SelectionCriteria},
    Namespace,
};

pub(crate) use session::ClusterTime;
use session::{ClientSession, ServerSession, ServerSessionPool};

const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Commands whose bodies must never reach command monitoring.
pub(crate) static REDACTED_COMMANDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "authenticate",
        "saslstart",
        "saslcontinue",
        "getnonce",
        "createuser",
        "updateuser",
        "copydbgetnonce",
        "copydbsaslstart",
        "copydb",
    ]
    .into_iter()
    .collect()
});

pub(crate) static HELLO_COMMAND_NAMES: LazyLock<HashSet<&'static str>> =
    LazyLock::new(|| ["hello", LEGACY_HELLO_COMMAND_NAME_LOWERCASE].into_iter().collect());

/// The entry point of the driver: discovers the deployment named by its options, maintains
/// per-server connection pools, and dispatches operations against selected servers.
///
/// `Client` uses [`std::sync::Arc`] internally, so it can be shared and cloned across tasks
/// cheaply; all clones observe the same topology and pools.
#[derive(Clone, Debug)]
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

#[derive_where(Debug)]
pub(crate) struct ClientInner {
    pub(crate) topology: Topology,
    pub(crate) options: ClientOptions,
    pub(crate) session_pool: ServerSessionPool,
    pub(crate) shutdown: AtomicBool,
    #[derive_where(skip)]
    pub(crate) monitoring: MonitoringRegistry,
    #[derive_where(skip)]
    pub(crate) event_emitter: EventEmitter,
}

impl Client {
    /// Creates a new `Client` connected to the cluster specified by `uri`. `uri` must be a
    /// valid connection string.
    pub async fn with_uri_str(uri: impl AsRef<str>) -> Result<Self> {
        let options = ClientOptions::parse(uri.as_ref()).await?;

        Client::with_options(options)
    }

    /// Creates a new `Client` connected to the cluster specified by `options`.
    pub fn with_options(options: ClientOptions) -> Result<Self> {
        options.validate()?;

        // A client without an explicit registry reports to the process-wide default one.
        let monitoring = options
            .monitoring
            .clone()
            .unwrap_or_else(MonitoringRegistry::global);
        let event_emitter = start_dispatcher(monitoring.clone());
        let topology = Topology::new(options.clone(), event_emitter.clone())?;

        let inner = Arc::new(ClientInner {
            topology,
            options,
            session_pool: ServerSessionPool::new(),
            shutdown: AtomicBool::new(false),
            monitoring,
            event_emitter,
        });
        Ok(Self { inner })
    }

    /// The options this client was created with.
    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    /// Runs a database-level command against the given database, returning the server's reply
    /// verbatim.
    ///
    /// Note that no inspection is done on the reply, so users must keep in mind that this
    /// method does not take the client's read or write concerns into account.
    pub async fn run_command(
        &self,
        db: impl AsRef<str>,
        command: Document,
    ) -> Result<Document> {
        let operation = RunCommand::new(db.as_ref().to_string(), command, None, None)?;
        self.execute_operation(operation, None).await
    }

    /// Runs a database-level command using the provided session.
    pub async fn run_command_with_session(
        &self,
        db: impl AsRef<str>,
        command: Document,
        session: &mut ClientSession,
    ) -> Result<Document> {
        let operation = RunCommand::new(db.as_ref().to_string(), command, None, None)?;
        self.execute_operation(operation, session).await
    }

    /// Finds documents in the given namespace matching `filter`, returning the server cursor's
    /// initial state. Further batches can be fetched with [`Client::get_more`].
    pub async fn find(
        &self,
        ns: Namespace,
        filter: Document,
        options: impl Into<Option<FindOptions>>,
    ) -> Result<CursorSpecification> {
        let operation = Find::new(ns, filter, options.into());
        let mut details = self.execute_operation_with_details(operation, None).await?;

        // In load-balanced mode cursors must be iterated on the connection that created them,
        // so the connection is pinned and carried by the cursor state.
        if self.inner.options.load_balanced.unwrap_or(false) && !details.output.is_exhausted() {
            details.output.pinned_connection = Some(details.connection.pin()?);
        }

        Ok(details.output)
    }

    /// Fetches the next batch for a cursor created by a previous operation, updating the
    /// cursor's state in place and returning the batch. Returns an empty batch when the cursor
    /// is exhausted.
    pub async fn get_more(&self, spec: &mut CursorSpecification) -> Result<Vec<Document>> {
        if spec.is_exhausted() {
            return Ok(Vec::new());
        }

        let operation = GetMore::new(spec, spec.pinned_connection.as_ref());
        let new_spec = self.execute_operation(operation, None).await?;

        spec.id = new_spec.id;
        if spec.is_exhausted() {
            spec.pinned_connection = None;
        }
        Ok(new_spec.buffer.into_iter().collect())
    }

    /// Inserts the given documents into the given namespace.
    pub async fn insert(
        &self,
        ns: Namespace,
        documents: Vec<Document>,
        ordered: impl Into<Option<bool>>,
        write_concern: impl Into<Option<WriteConcern>>,
    ) -> Result<InsertManyResult> {
        let write_concern = write_concern
            .into()
            .or_else(|| self.inner.options.write_concern.clone());
        let operation = Insert::new(ns, documents, ordered.into(), write_concern);
        self.execute_operation(operation, None).await
    }

    /// Inserts the given documents using the provided session.
    pub async fn insert_with_session(
        &self,
        ns: Namespace,
        documents: Vec<Document>,
        ordered: impl Into<Option<bool>>,
        write_concern: impl Into<Option<WriteConcern>>,
        session: &mut ClientSession,
    ) -> Result<InsertManyResult> {
        let write_concern = write_concern
            .into()
            .or_else(|| self.inner.options.write_concern.clone());
        let operation = Insert::new(ns, documents, ordered.into(), write_concern);
        self.execute_operation(operation, session).await
    }

    /// Starts a new [`ClientSession`].
    pub async fn start_session(
        &self,
        options: impl Into<Option<SessionOptions>>,
    ) -> Result<ClientSession> {
        let options = options.into();
        if let Some(ref options) = options {
            options.validate()?;
        }
        Ok(ClientSession::new(self.clone(), options, false).await)
    }

    /// Shuts the client down: open transactions are not affected, but pooled server sessions
    /// are released, connection pools are closed, and monitoring stops. Subsequent operations
    /// on this client (or any clone of it) fail with a shutdown error.
    pub async fn shutdown(self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        // Releasing sessions is best-effort: the server expires abandoned ones on its own.
        let session_ids = self.inner.session_pool.drain().await;
        if !session_ids.is_empty() {
            let _: Result<_> = self
                .execute_shutdown_operation(EndSessions::new(session_ids))
                .await;
        }

        self.inner.topology.shutdown().await;
    }

    /// Run an operation during shutdown, bypassing the shutdown flag check.
    async fn execute_shutdown_operation(&self, mut op: EndSessions) -> Result<()> {
        // the shutdown flag is already set, so route around `execute_operation`.
        let server = self
            .select_server(op.selection_criteria(), op.name(), None)
            .await?;
        let mut conn = server.pool.check_out().await?;
        let stream_description = conn.stream_description()?.clone();
        let cmd = op.build(&stream_description)?;
        let response = conn.send_command(cmd, None).await?;
        response.validate()
    }

    pub(crate) async fn check_in_server_session(&self, session: ServerSession) {
        let timeout = self.inner.topology.logical_session_timeout();
        self.inner.session_pool.check_in(session, timeout).await;
    }

    /// Gets whether the topology supports transactions. If it has yet to be determined, this
    /// method will perform a server selection that will force that determination to be made.
    pub(crate) async fn transaction_support_status(&self) -> Result<TransactionSupportStatus> {
        let initial_status = self.inner.topology.transaction_support_status();

        // Need to be connected to at least one server that can determine if sessions are
        // supported or not.
        match initial_status {
            TransactionSupportStatus::Undetermined => {
                let criteria = SelectionCriteria::Predicate(Arc::new(move |server_info| {
                    server_info.server_type().is_data_bearing()
                }));
                let _: SelectedServer = self
                    .select_server(Some(&criteria), "Check transactions support status", None)
                    .await?;
                Ok(self.inner.topology.transaction_support_status())
            }
            _ => Ok(initial_status),
        }
    }

    /// Select a server using the provided criteria. If none is provided, a primary read
    /// preference will be used instead.
    pub(crate) async fn select_server(
        &self,
        criteria: Option<&SelectionCriteria>,
        operation_name: &str,
        deprioritized: Option<&ServerAddress>,
    ) -> Result<SelectedServer> {
        let default_criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
        let criteria = criteria.unwrap_or(&default_criteria);

        let timeout = self
            .inner
            .options
            .server_selection_timeout
            .unwrap_or(DEFAULT_SERVER_SELECTION_TIMEOUT);
        let try_once = self
            .inner
            .options
            .server_selection_try_once
            .unwrap_or(false);

        let start_time = Instant::now();
        let mut watcher = self.inner.topology.watch();

        loop {
            let state = watcher.observe_latest();

            if let Some(server) =
                try_select_server(criteria, &state.description, &state.servers, deprioritized)?
            {
                tracing::debug!(
                    operation = operation_name,
                    address = %server.address,
                    "selected server"
                );
                return Ok(server);
            }

            // No suitable server: ask the monitors to check now and wait for the topology to
            // change under us, up to the selection deadline.
            self.inner.topology.request_update();

            if try_once {
                return Err(ErrorKind::ServerSelection {
                    message: state.description.selection_timeout_message(criteria),
                }
                .into());
            }

            let remaining = match timeout.checked_sub(start_time.elapsed()) {
                Some(remaining) if !remaining.is_zero() => remaining,
                _ => {
                    return Err(ErrorKind::ServerSelection {
                        message: state.description.selection_timeout_message(criteria),
                    }
                    .into())
                }
            };

            watcher.wait_for_update(remaining).await;
        }
    }

    /// Emit a command monitoring event, unless command monitoring is disabled or nothing is
    /// subscribed. Note that disabling command monitoring has no effect on the topology or pool
    /// eventing that the driver itself depends on.
    pub(crate) fn emit_command_event(&self, generate_event: impl FnOnce() -> CommandEvent) {
        if self.inner.options.command_events_disabled.unwrap_or(false) {
            return;
        }
        if !self.inner.monitoring.has_command_handlers() {
            return;
        }
        self.inner.event_emitter.emit(generate_event());
    }
}
