use std::{
    collections::HashMap,
    sync::Arc,
    time::Duration,
};

use tokio::sync::{
    broadcast,
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    watch,
};

use super::{
    description::{
        server::{ServerDescription, ServerType},
        topology::{TopologyDescription, TopologyType, TransactionSupportStatus},
    },
    monitor::Monitor,
    server::Server,
};
use crate::{
    bson::oid::ObjectId,
    client::ClusterTime,
    cmap::{
        conn::ConnectionGeneration,
        establish::{ConnectionEstablisher, EstablisherOptions},
        Connection,
        PoolGeneration,
    },
    error::{Error, Result},
    event::{
        sdam::{
            SdamEvent,
            ServerClosedEvent,
            ServerDescriptionChangedEvent,
            ServerOpeningEvent,
            TopologyClosedEvent,
            TopologyDescriptionChangedEvent,
            TopologyOpeningEvent,
        },
        EventEmitter,
    },
    options::{ClientOptions, ServerAddress},
    runtime::{self, AcknowledgedMessage, WorkerHandle, WorkerHandleListener},
};

/// A struct providing access to the client's current view of the topology.
/// When this is dropped, monitors will stop performing checks.
#[derive(Debug)]
pub(crate) struct Topology {
    watcher: TopologyWatcher,
    updater: TopologyUpdater,
    check_requester: TopologyCheckRequester,
    _worker_handle: WorkerHandle,
}

impl Topology {
    pub(crate) fn new(options: ClientOptions, event_emitter: EventEmitter) -> Result<Topology> {
        let description = TopologyDescription::default();

        let id = ObjectId::new();
        event_emitter.emit(SdamEvent::TopologyOpening(TopologyOpeningEvent {
            topology_id: id,
        }));

        let establisher = ConnectionEstablisher::new(EstablisherOptions::from(&options))?;

        let (updater, update_receiver) = TopologyUpdater::channel();
        let (worker_handle, handle_listener) = WorkerHandleListener::channel();
        let state = TopologyState {
            description,
            servers: Default::default(),
        };
        let (watch_sender, watch_receiver) = watch::channel(state);
        let watcher = TopologyWatcher {
            receiver: watch_receiver,
        };
        let check_requester = TopologyCheckRequester::new();

        let worker = TopologyWorker {
            id,
            update_receiver,
            publisher: watch_sender,
            options,
            topology_watcher: watcher.clone(),
            topology_updater: updater.clone(),
            check_requester: check_requester.clone(),
            event_emitter,
            establisher,
            handle_listener,
        };

        worker.start()?;

        Ok(Topology {
            watcher,
            updater,
            check_requester,
            _worker_handle: worker_handle,
        })
    }

    pub(crate) fn watch(&self) -> TopologyWatcher {
        let mut watcher = self.watcher.clone();
        // mark the latest topology as seen
        watcher.receiver.borrow_and_update();
        watcher
    }

    /// Requests that all monitors check their servers as soon as their rate limits allow.
    pub(crate) fn request_update(&self) {
        self.check_requester.request()
    }

    /// Handle an error that occurred during operation execution.
    pub(crate) async fn handle_application_error(
        &self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        self.updater
            .handle_application_error(address, error, phase)
            .await
    }

    /// Updates the topology's highest seen cluster time.
    pub(crate) async fn advance_cluster_time(&self, to: ClusterTime) {
        self.updater.advance_cluster_time(to).await
    }

    pub(crate) fn cluster_time(&self) -> Option<ClusterTime> {
        self.watcher
            .peek_latest()
            .description
            .cluster_time()
            .cloned()
    }

    pub(crate) fn topology_type(&self) -> TopologyType {
        self.watcher.peek_latest().description.topology_type
    }

    pub(crate) fn logical_session_timeout(&self) -> Option<Duration> {
        self.watcher.peek_latest().description.logical_session_timeout
    }

    pub(crate) fn transaction_support_status(&self) -> TransactionSupportStatus {
        self.watcher
            .peek_latest()
            .description
            .transaction_support_status()
    }

    /// Attach the appropriate read preference to the given command.
    pub(crate) fn attach_read_preference(
        &self,
        address: &ServerAddress,
        command: &mut crate::cmap::Command,
        criteria: Option<&crate::selection_criteria::SelectionCriteria>,
    ) {
        self.watcher
            .peek_latest()
            .description
            .attach_read_preference(address, command, criteria)
    }

    /// Shut the topology down, closing all servers and stopping all monitors.
    pub(crate) async fn shutdown(&self) {
        self.updater.shutdown().await;
    }

    #[cfg(test)]
    pub(crate) fn updater(&self) -> &TopologyUpdater {
        &self.updater
    }
}

/// The current state of the topology: an immutable description plus the live server handles.
#[derive(Debug, Clone)]
pub(crate) struct TopologyState {
    pub(crate) description: TopologyDescription,
    pub(crate) servers: HashMap<ServerAddress, Arc<Server>>,
}

/// The messages that can be processed by the topology worker.
#[derive(Debug)]
pub(crate) enum UpdateMessage {
    ServerUpdate(Box<ServerDescription>),
    MonitorError {
        address: ServerAddress,
        error: Error,
    },
    ApplicationError {
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    },
    AdvanceClusterTime(ClusterTime),
    Shutdown,
}

/// The single writer of the topology: a task that applies updates serially and publishes
/// immutable snapshots.
struct TopologyWorker {
    id: ObjectId,
    update_receiver: UpdateRequestReceiver,
    publisher: watch::Sender<TopologyState>,
    options: ClientOptions,
    topology_watcher: TopologyWatcher,
    topology_updater: TopologyUpdater,
    check_requester: TopologyCheckRequester,
    event_emitter: EventEmitter,
    establisher: ConnectionEstablisher,
    handle_listener: WorkerHandleListener,
}

impl TopologyWorker {
    fn start(self) -> Result<()> {
        let initial_description = TopologyDescription::new(&self.options);

        let mut servers = HashMap::new();
        for address in initial_description.server_addresses() {
            servers.insert(address.clone(), self.new_server(address.clone()));
        }

        self.event_emitter
            .emit(SdamEvent::TopologyDescriptionChanged(Box::new(
                TopologyDescriptionChangedEvent {
                    topology_id: self.id,
                    previous_description: TopologyDescription::default(),
                    new_description: initial_description.clone(),
                },
            )));
        for address in initial_description.server_addresses() {
            self.event_emitter
                .emit(SdamEvent::ServerOpening(ServerOpeningEvent {
                    topology_id: self.id,
                    address: address.clone(),
                }));
        }

        let mut state = TopologyState {
            description: initial_description,
            servers,
        };

        // Load-balanced topologies have no monitors; a server description is synthesized so
        // that selection can succeed immediately.
        if state.description.topology_type == TopologyType::LoadBalanced {
            for address in self.options.hosts.clone() {
                let mut sd = ServerDescription::unknown(&address);
                sd.server_type = ServerType::LoadBalancer;
                sd.average_round_trip_time = Some(Duration::from_nanos(0));
                state.description.apply(sd)?;
            }
        } else {
            self.start_monitors(&state);
        }

        let _ = self.publisher.send(state);

        runtime::spawn(async move { self.execute().await });

        Ok(())
    }

    async fn execute(mut self) {
        loop {
            tokio::select! {
                Some(update) = self.update_receiver.recv() => {
                    let (update, ack) = update.into_parts();
                    let mut shutdown = false;
                    let changed = match update {
                        UpdateMessage::ServerUpdate(sd) => self.update_server(*sd).await,
                        UpdateMessage::MonitorError { address, error } => {
                            self.handle_monitor_error(address, error).await
                        }
                        UpdateMessage::ApplicationError {
                            address,
                            error,
                            phase,
                        } => self.handle_application_error(address, error, phase).await,
                        UpdateMessage::AdvanceClusterTime(to) => {
                            let mut state = self.latest_state();
                            state.description.advance_cluster_time(&to);
                            self.publish_state(state);
                            true
                        }
                        UpdateMessage::Shutdown => {
                            shutdown = true;
                            true
                        }
                    };
                    ack.acknowledge(changed);
                    if shutdown {
                        break;
                    }
                },
                _ = self.handle_listener.wait_for_all_handle_drops() => {
                    break
                }
            }
        }

        // Drop the server handles, closing their pools and stopping their monitors.
        let mut state = self.latest_state();
        let addresses: Vec<_> = state.servers.keys().cloned().collect();
        state.servers.clear();
        self.publish_state(state);

        for address in addresses {
            self.event_emitter
                .emit(SdamEvent::ServerClosed(ServerClosedEvent {
                    topology_id: self.id,
                    address,
                }));
        }
        self.event_emitter
            .emit(SdamEvent::TopologyClosed(TopologyClosedEvent {
                topology_id: self.id,
            }));
    }

    fn latest_state(&self) -> TopologyState {
        self.publisher.borrow().clone()
    }

    fn publish_state(&self, state: TopologyState) {
        let _ = self.publisher.send(state);
    }

    fn new_server(&self, address: ServerAddress) -> Arc<Server> {
        Server::new(
            address,
            &self.options,
            self.establisher.clone(),
            self.topology_updater.clone(),
            self.event_emitter.clone(),
        )
    }

    fn start_monitors(&self, state: &TopologyState) {
        for address in state.servers.keys() {
            self.start_monitor(address.clone());
        }
    }

    fn start_monitor(&self, address: ServerAddress) {
        #[cfg(test)]
        if self
            .options
            .test_options
            .as_ref()
            .map(|to| to.disable_monitoring_tasks)
            .unwrap_or(false)
        {
            return;
        }

        Monitor::start(
            address,
            self.topology_updater.clone(),
            self.topology_watcher.clone(),
            self.event_emitter.clone(),
            self.check_requester.subscribe(),
            self.establisher.clone(),
            self.options.clone(),
        );
    }

    /// Update the topology using the provided `ServerDescription`.
    async fn update_server(&mut self, sd: ServerDescription) -> bool {
        let mut latest_state = self.latest_state();
        let old_description = latest_state.description.clone();

        let server_type = sd.server_type;
        let server_address = sd.address.clone();

        if let Err(e) = latest_state.description.apply(sd) {
            tracing::warn!(address = %server_address, error = %e, "invalid server description");
            return false;
        }

        // Add and remove servers as dictated by the new description, starting monitors for new
        // ones.
        let old_addresses: Vec<_> = latest_state.servers.keys().cloned().collect();
        for address in latest_state.description.server_addresses() {
            if !latest_state.servers.contains_key(address) {
                let server = self.new_server(address.clone());
                latest_state.servers.insert(address.clone(), server);
                self.event_emitter
                    .emit(SdamEvent::ServerOpening(ServerOpeningEvent {
                        topology_id: self.id,
                        address: address.clone(),
                    }));
                self.start_monitor(address.clone());
            }
        }
        let mut removed = Vec::new();
        for address in old_addresses {
            if latest_state.description.server(&address).is_none() {
                latest_state.servers.remove(&address);
                removed.push(address);
            }
        }

        if let Some(server) = latest_state.servers.get(&server_address) {
            if server_type.is_data_bearing()
                || (server_type != ServerType::Unknown
                    && latest_state.description.topology_type == TopologyType::Single)
            {
                server.pool.mark_as_ready().await;
            }
        }

        let diff = old_description.diff(&latest_state.description);
        let topology_changed = diff.is_some();

        if let Some(diff) = diff {
            for (address, previous_description, new_description) in diff.changed {
                self.event_emitter
                    .emit(SdamEvent::ServerDescriptionChanged(Box::new(
                        ServerDescriptionChangedEvent {
                            topology_id: self.id,
                            address: address.clone(),
                            previous_description: previous_description.clone(),
                            new_description: new_description.clone(),
                        },
                    )));
            }

            self.event_emitter
                .emit(SdamEvent::TopologyDescriptionChanged(Box::new(
                    TopologyDescriptionChangedEvent {
                        topology_id: self.id,
                        previous_description: old_description,
                        new_description: latest_state.description.clone(),
                    },
                )));
        }

        self.publish_state(latest_state);

        for address in removed {
            self.event_emitter
                .emit(SdamEvent::ServerClosed(ServerClosedEvent {
                    topology_id: self.id,
                    address,
                }));
        }

        topology_changed
    }

    /// Mark the server at the given address as Unknown, reporting the error that caused it.
    async fn mark_server_as_unknown(&mut self, address: ServerAddress, error: Error) -> bool {
        let description = ServerDescription::from_error(address, error);
        self.update_server(description).await
    }

    /// Handle an error that occurred during a monitor check.
    async fn handle_monitor_error(&mut self, address: ServerAddress, error: Error) -> bool {
        let server = self.latest_state().servers.get(&address).cloned();
        match server {
            Some(server) => {
                tracing::debug!(address = %address, error = %error, "heartbeat failed");
                let updated = self.mark_server_as_unknown(address, error.clone()).await;
                if updated {
                    // Monitors are disabled in load-balanced mode, so this will never have a
                    // service id.
                    server.pool.clear(error, None).await;
                }
                updated
            }
            None => false,
        }
    }

    /// Handle an error that occurred during operation execution or connection establishment.
    async fn handle_application_error(
        &mut self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        let server = match self.latest_state().servers.get(&address).cloned() {
            Some(server) => server,
            None => return false,
        };

        // Stale errors (from a connection established under a previous generation) must not
        // drive state changes, other than bookkeeping done by the pool itself.
        match &phase {
            HandshakePhase::PreHello { generation } => {
                match (generation, server.pool.generation()) {
                    (PoolGeneration::Normal(hgen), PoolGeneration::Normal(sgen)) => {
                        if *hgen < sgen {
                            return false;
                        }
                    }
                    // Pre-hello handshake errors are ignored in load-balanced mode.
                    (PoolGeneration::LoadBalanced(_), PoolGeneration::LoadBalanced(_)) => {
                        return false
                    }
                    _ => crate::error::load_balanced_mode_mismatch!(false),
                }
            }
            HandshakePhase::PostHello { generation }
            | HandshakePhase::AfterCompletion { generation, .. } => {
                if generation.is_stale(&server.pool.generation()) {
                    return false;
                }
            }
        }

        let is_load_balanced =
            self.latest_state().description.topology_type == TopologyType::LoadBalanced;

        if error.is_state_change_error() {
            let updated = is_load_balanced
                || self
                    .mark_server_as_unknown(address, error.clone())
                    .await;

            if updated && (error.is_shutting_down() || phase.wire_version().unwrap_or(0) < 8) {
                server.pool.clear(error, phase.service_id()).await;
            }
            self.check_requester.request();

            updated
        } else if error.is_non_timeout_network_error()
            || (phase.is_before_completion()
                && (error.is_auth_error()
                    || error.is_network_timeout()
                    || error.is_command_error()))
        {
            let updated = if is_load_balanced {
                true
            } else {
                self.mark_server_as_unknown(address, error.clone()).await
            };
            if updated {
                server.pool.clear(error, phase.service_id()).await;
            }
            updated
        } else {
            false
        }
    }
}

/// Struct used to update the topology from monitors, pools, and operation execution.
#[derive(Debug, Clone)]
pub(crate) struct TopologyUpdater {
    sender: UnboundedSender<AcknowledgedMessage<UpdateMessage, bool>>,
}

impl TopologyUpdater {
    pub(crate) fn channel() -> (TopologyUpdater, UpdateRequestReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            TopologyUpdater { sender },
            UpdateRequestReceiver { receiver },
        )
    }

    async fn send_message(&self, update: UpdateMessage) -> bool {
        let (message, receiver) = AcknowledgedMessage::package(update);

        match self.sender.send(message) {
            Ok(_) => receiver.wait_for_acknowledgment().await.unwrap_or(false),
            _ => false,
        }
    }

    /// Update the topology using the provided server description, returning whether the topology
    /// changed as a result.
    pub(crate) async fn update(&self, sd: ServerDescription) -> bool {
        self.send_message(UpdateMessage::ServerUpdate(Box::new(sd))).await
    }

    pub(crate) async fn handle_monitor_error(&self, address: ServerAddress, error: Error) -> bool {
        self.send_message(UpdateMessage::MonitorError { address, error })
            .await
    }

    pub(crate) async fn handle_application_error(
        &self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        self.send_message(UpdateMessage::ApplicationError {
            address,
            error,
            phase,
        })
        .await
    }

    pub(crate) async fn advance_cluster_time(&self, to: ClusterTime) {
        self.send_message(UpdateMessage::AdvanceClusterTime(to)).await;
    }

    pub(crate) async fn shutdown(&self) {
        self.send_message(UpdateMessage::Shutdown).await;
    }
}

/// Receiving end of the topology worker's message queue.
pub(crate) struct UpdateRequestReceiver {
    receiver: UnboundedReceiver<AcknowledgedMessage<UpdateMessage, bool>>,
}

impl UpdateRequestReceiver {
    pub(crate) async fn recv(&mut self) -> Option<AcknowledgedMessage<UpdateMessage, bool>> {
        self.receiver.recv().await
    }
}

/// A handle used for observing changes that occur in the topology.
#[derive(Debug, Clone)]
pub(crate) struct TopologyWatcher {
    receiver: watch::Receiver<TopologyState>,
}

impl TopologyWatcher {
    #[cfg(test)]
    pub(crate) fn new_test(receiver: watch::Receiver<TopologyState>) -> Self {
        Self { receiver }
    }

    /// Whether the topology that this handle points to is still in use by a client.
    pub(crate) fn is_alive(&self) -> bool {
        self.receiver.has_changed().is_ok()
    }

    /// Clone the latest state, marking it as seen.
    pub(crate) fn observe_latest(&mut self) -> TopologyState {
        self.receiver.borrow_and_update().clone()
    }

    /// Clone the latest state without marking it as seen.
    pub(crate) fn peek_latest(&self) -> TopologyState {
        self.receiver.borrow().clone()
    }

    /// Get the description of the server at the given address, if it is part of the topology.
    pub(crate) fn server_description(&self, address: &ServerAddress) -> Option<ServerDescription> {
        self.receiver.borrow().description.server(address).cloned()
    }

    pub(crate) fn server_exists(&self, address: &ServerAddress) -> bool {
        self.receiver.borrow().servers.contains_key(address)
    }

    /// Wait for a new state to be published or for the timeout to be reached, returning a bool
    /// indicating whether an update was seen or not.
    pub(crate) async fn wait_for_update(&mut self, timeout: Duration) -> bool {
        let changed = runtime::timeout(timeout, self.receiver.changed()).await;
        matches!(changed, Ok(Ok(())))
    }
}

/// Handle for requesting immediate checks from all of the topology's monitors.
#[derive(Debug, Clone)]
pub(crate) struct TopologyCheckRequester {
    sender: broadcast::Sender<()>,
}

impl TopologyCheckRequester {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self { sender }
    }

    /// Request that all monitors check their server as soon as possible.
    pub(crate) fn request(&self) {
        // an error just means there are no monitors to notify.
        let _: std::result::Result<_, _> = self.sender.send(());
    }

    pub(crate) fn subscribe(&self) -> TopologyCheckRequestReceiver {
        TopologyCheckRequestReceiver {
            receiver: self.sender.subscribe(),
        }
    }
}

/// Receiver for immediate check requests, used by monitors.
pub(crate) struct TopologyCheckRequestReceiver {
    receiver: broadcast::Receiver<()>,
}

impl TopologyCheckRequestReceiver {
    #[cfg(test)]
    pub(crate) fn new_test(receiver: broadcast::Receiver<()>) -> Self {
        Self { receiver }
    }

    /// Wait until a check request is received or the timeout is reached, whichever comes first.
    pub(crate) async fn wait_for_check_request(&mut self, timeout: Duration) {
        let _: std::result::Result<_, _> =
            runtime::timeout(timeout, self.receiver.recv()).await;
    }

    /// Discard any check requests that arrived while the monitor was already checking.
    pub(crate) fn clear_check_requests(&mut self) {
        loop {
            match self.receiver.try_recv() {
                Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                _ => break,
            }
        }
    }
}

/// The phase of connection establishment or use that an application error was observed in, used
/// to determine how the error should affect the topology.
#[derive(Debug, Clone)]
pub(crate) enum HandshakePhase {
    /// An error that occurred before the initial hello completed.
    PreHello { generation: PoolGeneration },

    /// An error that occurred after the initial hello completed but before the connection was
    /// fully established (e.g. during authentication).
    PostHello { generation: ConnectionGeneration },

    /// An error that occurred on an established connection.
    AfterCompletion {
        generation: ConnectionGeneration,
        max_wire_version: Option<i32>,
    },
}

impl HandshakePhase {
    pub(crate) fn after_completion(handshaked_connection: &Connection) -> Self {
        Self::AfterCompletion {
            generation: handshaked_connection.generation,
            max_wire_version: handshaked_connection
                .stream_description()
                .ok()
                .and_then(|sd| sd.max_wire_version),
        }
    }

    /// The `serviceId` reported by the server, or `None` if the server did not report one or
    /// the handshake failed before one could be received.
    fn service_id(&self) -> Option<ObjectId> {
        match self {
            HandshakePhase::PreHello { .. } => None,
            HandshakePhase::PostHello { generation, .. }
            | HandshakePhase::AfterCompletion { generation, .. } => generation.service_id(),
        }
    }

    /// Whether this phase is before the handshake completed or not.
    fn is_before_completion(&self) -> bool {
        !matches!(self, HandshakePhase::AfterCompletion { .. })
    }

    /// The wire version of the server as reported by the handshake. If the handshake did not
    /// complete, this returns `None`.
    fn wire_version(&self) -> Option<i32> {
        match self {
            HandshakePhase::AfterCompletion {
                max_wire_version, ..
            } => *max_wire_version,
            _ => None,
        }
    }
}
