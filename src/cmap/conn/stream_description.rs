use std::time::Duration;

use crate::{hello::HelloReply, options::ServerAddress, sdam::public::ServerType};

/// Contains information about a given server in a format digestible by a connection.
#[derive(Debug, Clone)]
pub(crate) struct StreamDescription {
    /// The address of the server.
    pub(crate) server_address: ServerAddress,

    /// The type of the server when the handshake occurred.
    pub(crate) initial_server_type: ServerType,

    /// The maximum wire version that the server understands.
    pub(crate) max_wire_version: Option<i32>,

    /// The minimum wire version that the server understands.
    pub(crate) min_wire_version: Option<i32>,

    /// The supported authentication mechanisms that the server advertised for the handshake's
    /// user, if any.
    pub(crate) sasl_supported_mechs: Option<Vec<String>>,

    /// How long sessions started on this server remain active after their most recent use.
    pub(crate) logical_session_timeout: Option<Duration>,

    /// The maximum permitted size of a wire protocol message.
    pub(crate) max_message_size_bytes: i32,

    /// Whether the server understands the modern `hello` command.
    pub(crate) hello_ok: bool,

    /// In load-balanced mode, the id of the backend behind the load balancer.
    pub(crate) service_id: Option<crate::bson::oid::ObjectId>,
}

impl StreamDescription {
    /// Constructs a new StreamDescription from a `HelloReply`.
    pub(crate) fn from_hello_reply(reply: &HelloReply) -> Self {
        Self {
            server_address: reply.server_address.clone(),
            initial_server_type: reply.command_response.server_type(),
            max_wire_version: reply.command_response.max_wire_version,
            min_wire_version: reply.command_response.min_wire_version,
            sasl_supported_mechs: reply.command_response.sasl_supported_mechs.clone(),
            logical_session_timeout: reply
                .command_response
                .logical_session_timeout_minutes
                .map(|mins| Duration::from_secs(mins as u64 * 60)),
            max_message_size_bytes: reply
                .command_response
                .max_message_size_bytes
                .unwrap_or(48 * 1024 * 1024),
            hello_ok: reply.command_response.hello_ok.unwrap_or(false),
            service_id: reply.command_response.service_id,
        }
    }

    /// Whether this server supports retryable writes.
    pub(crate) fn supports_retryable_writes(&self) -> bool {
        self.initial_server_type != ServerType::Standalone
            && self.logical_session_timeout.is_some()
            && self.max_wire_version.map_or(false, |version| version >= 6)
    }

    /// Gets a description of a stream for a pre-wire-9 server, for test purposes.
    #[cfg(test)]
    pub(crate) fn new_testing() -> Self {
        Self {
            server_address: ServerAddress::Tcp {
                host: "localhost".to_string(),
                port: None,
            },
            initial_server_type: ServerType::RsPrimary,
            max_wire_version: Some(8),
            min_wire_version: Some(8),
            sasl_supported_mechs: None,
            logical_session_timeout: Some(Duration::from_secs(30 * 60)),
            max_message_size_bytes: 48 * 1024 * 1024,
            hello_ok: false,
            service_id: None,
        }
    }
}
