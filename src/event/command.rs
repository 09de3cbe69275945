//! Contains the events and functionality to monitor the commands and responses that a `Client`
//! sends and receives from the server.

use std::time::Duration;

use crate::{
    bson::{oid::ObjectId, Document},
    cmap::ConnectionInfo,
    error::Error,
};

/// An event that triggers when a database command is initiated.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct CommandStartedEvent {
    /// The command being run.
    pub command: Document,

    /// The name of the database the command is being run against.
    pub db: String,

    /// The type of command being run, e.g. "find" or "hello".
    pub command_name: String,

    /// The driver-generated identifier for the request. Applications can use this to identify
    /// the corresponding event triggered by the completion of this command (i.e. either
    /// [`CommandSucceededEvent`] or [`CommandFailedEvent`]).
    pub request_id: i32,

    /// Information about the connection the command will be run on.
    pub connection: ConnectionInfo,

    /// If the client is connected to a load balancer, the id of the selected backend.
    pub service_id: Option<ObjectId>,
}

/// An event that triggers when a database command completes without an error.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct CommandSucceededEvent {
    /// The total execution time of the command (including the network round-trip).
    pub duration: Duration,

    /// The server's reply to the command.
    pub reply: Document,

    /// The type of command that was run, e.g. "find" or "hello".
    pub command_name: String,

    /// The driver-generated identifier for the request.
    pub request_id: i32,

    /// Information about the connection the command was run on.
    pub connection: ConnectionInfo,

    /// If the client is connected to a load balancer, the id of the selected backend.
    pub service_id: Option<ObjectId>,
}

/// An event that triggers when a command failed to complete successfully.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct CommandFailedEvent {
    /// The total execution time of the command (including the network round-trip).
    pub duration: Duration,

    /// The type of command that was run, e.g. "find" or "hello".
    pub command_name: String,

    /// The error that the driver returned due to the event failing.
    pub failure: Error,

    /// The driver-generated identifier for the request.
    pub request_id: i32,

    /// Information about the connection the command was run on.
    pub connection: ConnectionInfo,

    /// If the client is connected to a load balancer, the id of the selected backend.
    pub service_id: Option<ObjectId>,
}

/// The set of command monitoring events.
#[derive(Clone, Debug)]
pub(crate) enum CommandEvent {
    Started(CommandStartedEvent),
    Succeeded(CommandSucceededEvent),
    Failed(CommandFailedEvent),
}

/// Applications can implement this trait to specify custom logic to run on each command event
/// sent by the driver.
///
/// ```rust
/// # use std::sync::Arc;
/// #
/// # use docdb::{
/// #     error::Result,
/// #     event::command::{CommandEventHandler, CommandFailedEvent},
/// #     options::ClientOptions,
/// #     Client,
/// #     MonitoringRegistry,
/// # };
/// #
/// struct FailedCommandLogger;
///
/// impl CommandEventHandler for FailedCommandLogger {
///     fn handle_command_failed_event(&self, event: CommandFailedEvent) {
///         eprintln!("Failed command: {:?}", event);
///     }
/// }
///
/// # fn do_stuff() -> Result<()> {
/// let registry = MonitoringRegistry::new();
/// registry.register_command_handler(Arc::new(FailedCommandLogger));
///
/// let options = ClientOptions::builder().monitoring(registry).build();
/// let client = Client::with_options(options)?;
///
/// // Do things with the client, and failed command events will be logged to stderr.
/// # Ok(())
/// # }
/// ```
#[allow(unused_variables)]
pub trait CommandEventHandler: Send + Sync {
    /// Called whenever a database command is initiated.
    fn handle_command_started_event(&self, event: CommandStartedEvent) {}

    /// Called whenever a database command successfully completes.
    fn handle_command_succeeded_event(&self, event: CommandSucceededEvent) {}

    /// Called whenever a database command fails.
    fn handle_command_failed_event(&self, event: CommandFailedEvent) {}
}
