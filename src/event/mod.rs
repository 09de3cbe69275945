//! Contains the types for command, SDAM, and connection-pool monitoring.

pub mod cmap;
pub mod command;
pub mod sdam;

use std::sync::{Arc, LazyLock, RwLock};

use tokio::sync::mpsc;

use self::{
    cmap::{CmapEvent, CmapEventHandler},
    command::{CommandEvent, CommandEventHandler},
    sdam::{SdamEvent, SdamEventHandler},
};

/// An explicit registry of monitoring subscribers.
///
/// Handlers are registered before the registry is handed to a
/// [`Client`](crate::Client) via [`ClientOptions`](crate::options::ClientOptions), so no events
/// can be missed between client construction and subscription. Cloning a registry yields a handle
/// to the same underlying subscriber lists.
///
/// Event delivery happens on a dedicated dispatcher task, in registration order per handler and
/// in emission order per topic; a slow subscriber delays other subscribers but never the topology
/// or pool workers that produced the event.
#[derive(Clone, Debug, Default)]
pub struct MonitoringRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    command_handlers: RwLock<Vec<Arc<dyn CommandEventHandler>>>,
    cmap_handlers: RwLock<Vec<Arc<dyn CmapEventHandler>>>,
    sdam_handlers: RwLock<Vec<Arc<dyn SdamEventHandler>>>,
}

impl std::fmt::Debug for RegistryInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryInner")
            .field(
                "command_handlers",
                &self.command_handlers.read().map(|h| h.len()).unwrap_or(0),
            )
            .field(
                "cmap_handlers",
                &self.cmap_handlers.read().map(|h| h.len()).unwrap_or(0),
            )
            .field(
                "sdam_handlers",
                &self.sdam_handlers.read().map(|h| h.len()).unwrap_or(0),
            )
            .finish()
    }
}

static GLOBAL_REGISTRY: LazyLock<MonitoringRegistry> = LazyLock::new(Default::default);

impl MonitoringRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns a handle to the process-wide default registry. Clients that are not handed an
    /// explicit registry report to this one.
    pub fn global() -> Self {
        GLOBAL_REGISTRY.clone()
    }

    /// Registers a handler for command started/succeeded/failed events.
    pub fn register_command_handler(&self, handler: Arc<dyn CommandEventHandler>) {
        if let Ok(mut handlers) = self.inner.command_handlers.write() {
            handlers.push(handler);
        }
    }

    /// Registers a handler for connection pool events.
    pub fn register_cmap_handler(&self, handler: Arc<dyn CmapEventHandler>) {
        if let Ok(mut handlers) = self.inner.cmap_handlers.write() {
            handlers.push(handler);
        }
    }

    /// Registers a handler for topology and heartbeat events.
    pub fn register_sdam_handler(&self, handler: Arc<dyn SdamEventHandler>) {
        if let Ok(mut handlers) = self.inner.sdam_handlers.write() {
            handlers.push(handler);
        }
    }

    /// Removes a previously registered command handler. Handlers are compared by identity.
    pub fn unregister_command_handler(&self, handler: &Arc<dyn CommandEventHandler>) {
        if let Ok(mut handlers) = self.inner.command_handlers.write() {
            handlers.retain(|h| !Arc::ptr_eq(h, handler));
        }
    }

    /// Removes a previously registered connection pool handler. Handlers are compared by
    /// identity.
    pub fn unregister_cmap_handler(&self, handler: &Arc<dyn CmapEventHandler>) {
        if let Ok(mut handlers) = self.inner.cmap_handlers.write() {
            handlers.retain(|h| !Arc::ptr_eq(h, handler));
        }
    }

    /// Removes a previously registered topology handler. Handlers are compared by identity.
    pub fn unregister_sdam_handler(&self, handler: &Arc<dyn SdamEventHandler>) {
        if let Ok(mut handlers) = self.inner.sdam_handlers.write() {
            handlers.retain(|h| !Arc::ptr_eq(h, handler));
        }
    }

    pub(crate) fn has_command_handlers(&self) -> bool {
        self.inner
            .command_handlers
            .read()
            .map(|h| !h.is_empty())
            .unwrap_or(false)
    }

    fn dispatch(&self, event: Event) {
        match event {
            Event::Command(event) => {
                if let Ok(handlers) = self.inner.command_handlers.read() {
                    for handler in handlers.iter() {
                        dispatch_command_event(handler.as_ref(), &event);
                    }
                }
            }
            Event::Cmap(event) => {
                if let Ok(handlers) = self.inner.cmap_handlers.read() {
                    for handler in handlers.iter() {
                        dispatch_cmap_event(handler.as_ref(), &event);
                    }
                }
            }
            Event::Sdam(event) => {
                if let Ok(handlers) = self.inner.sdam_handlers.read() {
                    for handler in handlers.iter() {
                        dispatch_sdam_event(handler.as_ref(), &event);
                    }
                }
            }
        }
    }
}

fn dispatch_command_event(handler: &dyn CommandEventHandler, event: &CommandEvent) {
    match event {
        CommandEvent::Started(e) => handler.handle_command_started_event(e.clone()),
        CommandEvent::Succeeded(e) => handler.handle_command_succeeded_event(e.clone()),
        CommandEvent::Failed(e) => handler.handle_command_failed_event(e.clone()),
    }
}

fn dispatch_cmap_event(handler: &dyn CmapEventHandler, event: &CmapEvent) {
    match event {
        CmapEvent::PoolCreated(e) => handler.handle_pool_created_event(e.clone()),
        CmapEvent::PoolReady(e) => handler.handle_pool_ready_event(e.clone()),
        CmapEvent::PoolCleared(e) => handler.handle_pool_cleared_event(e.clone()),
        CmapEvent::PoolClosed(e) => handler.handle_pool_closed_event(e.clone()),
        CmapEvent::ConnectionCreated(e) => handler.handle_connection_created_event(e.clone()),
        CmapEvent::ConnectionReady(e) => handler.handle_connection_ready_event(e.clone()),
        CmapEvent::ConnectionClosed(e) => handler.handle_connection_closed_event(e.clone()),
        CmapEvent::ConnectionCheckoutStarted(e) => {
            handler.handle_connection_checkout_started_event(e.clone())
        }
        CmapEvent::ConnectionCheckoutFailed(e) => {
            handler.handle_connection_checkout_failed_event(e.clone())
        }
        CmapEvent::ConnectionCheckedOut(e) => {
            handler.handle_connection_checked_out_event(e.clone())
        }
        CmapEvent::ConnectionCheckedIn(e) => handler.handle_connection_checked_in_event(e.clone()),
    }
}

fn dispatch_sdam_event(handler: &dyn SdamEventHandler, event: &SdamEvent) {
    match event {
        SdamEvent::TopologyOpening(e) => handler.handle_topology_opening_event(e.clone()),
        SdamEvent::TopologyDescriptionChanged(e) => {
            handler.handle_topology_description_changed_event(*e.clone())
        }
        SdamEvent::TopologyClosed(e) => handler.handle_topology_closed_event(e.clone()),
        SdamEvent::ServerOpening(e) => handler.handle_server_opening_event(e.clone()),
        SdamEvent::ServerDescriptionChanged(e) => {
            handler.handle_server_description_changed_event(*e.clone())
        }
        SdamEvent::ServerClosed(e) => handler.handle_server_closed_event(e.clone()),
        SdamEvent::ServerHeartbeatStarted(e) => {
            handler.handle_server_heartbeat_started_event(e.clone())
        }
        SdamEvent::ServerHeartbeatSucceeded(e) => {
            handler.handle_server_heartbeat_succeeded_event(e.clone())
        }
        SdamEvent::ServerHeartbeatFailed(e) => {
            handler.handle_server_heartbeat_failed_event(e.clone())
        }
    }
}

/// An event from any of the monitored topics.
#[derive(Clone, Debug)]
pub(crate) enum Event {
    Command(CommandEvent),
    Cmap(CmapEvent),
    Sdam(SdamEvent),
}

/// Spawns the dispatcher task for a registry, returning the emitter that producers use to queue
/// events. Dropping all emitters terminates the task.
pub(crate) fn start_dispatcher(registry: MonitoringRegistry) -> EventEmitter {
    let (sender, mut receiver) = mpsc::unbounded_channel::<Event>();
    crate::runtime::spawn(async move {
        while let Some(event) = receiver.recv().await {
            registry.dispatch(event);
        }
    });
    EventEmitter { sender }
}

/// Queues events for delivery by the dispatcher task. The closure-based emit methods avoid
/// constructing events when nothing is subscribed on the other end of the channel.
#[derive(Clone, Debug)]
pub(crate) struct EventEmitter {
    sender: mpsc::UnboundedSender<Event>,
}

impl EventEmitter {
    pub(crate) fn emit(&self, event: impl Into<Event>) {
        // If the dispatcher has shut down there is nobody left to observe the event.
        let _: std::result::Result<_, _> = self.sender.send(event.into());
    }
}

impl From<CommandEvent> for Event {
    fn from(event: CommandEvent) -> Self {
        Self::Command(event)
    }
}

impl From<CmapEvent> for Event {
    fn from(event: CmapEvent) -> Self {
        Self::Cmap(event)
    }
}

impl From<SdamEvent> for Event {
    fn from(event: SdamEvent) -> Self {
        Self::Sdam(event)
    }
}
