use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    bson::{doc, DateTime, Document},
    client::ClusterTime,
    cmap::{Command, Connection},
    error::Result,
    options::ServerAddress,
    sdam::{public::ServerType, TopologyVersion},
    selection_criteria::TagSet,
};

/// The legacy version of the `hello` command, retained for handshakes with servers that predate
/// it. To limit usages of the legacy name in the codebase, this constant should be used wherever
/// possible.
pub(crate) const LEGACY_HELLO_COMMAND_NAME: &str = "isMaster";
pub(crate) const LEGACY_HELLO_COMMAND_NAME_LOWERCASE: &str = "ismaster";

#[derive(Debug, Clone, Copy)]
pub(crate) struct AwaitableHelloOptions {
    pub(crate) topology_version: TopologyVersion,
    pub(crate) max_await_time: Duration,
}

/// Construct a hello or legacy hello command, depending on the circumstances.
///
/// If `load_balanced` is true or the server previously indicated `helloOk: true`, `hello` is
/// used. Otherwise the legacy command is used, and if it's unknown whether the server supports
/// hello, the command also advertises `helloOk: true`.
pub(crate) fn hello_command(
    load_balanced: Option<bool>,
    hello_ok: Option<bool>,
    awaitable_options: Option<AwaitableHelloOptions>,
) -> Command {
    let (mut body, command_name) = if matches!(load_balanced, Some(true))
        || matches!(hello_ok, Some(true))
    {
        (doc! { "hello": 1 }, "hello")
    } else {
        let mut body = doc! { LEGACY_HELLO_COMMAND_NAME: 1 };
        if hello_ok.is_none() {
            body.insert("helloOk", true);
        }
        (body, LEGACY_HELLO_COMMAND_NAME)
    };

    if let Some(opts) = awaitable_options {
        body.insert("topologyVersion", opts.topology_version);
        body.insert(
            "maxAwaitTimeMS",
            i64::try_from(opts.max_await_time.as_millis()).unwrap_or(i64::MAX),
        );
    }

    let mut command = Command::new(command_name, "admin", body);
    command.exhaust_allowed = awaitable_options.is_some();
    command
}

/// Execute a hello or legacy hello command.
pub(crate) async fn run_hello(conn: &mut Connection, command: Command) -> Result<HelloReply> {
    let response = conn.send_command(command, None).await?;
    response.validate()?;

    let server_address = conn.address().clone();
    let cluster_time = response.cluster_time();
    let raw_command_response = response.into_raw();
    let command_response: HelloCommandResponse =
        crate::bson::from_document(raw_command_response.clone())?;

    Ok(HelloReply {
        server_address,
        command_response,
        raw_command_response,
        cluster_time,
    })
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct HelloReply {
    pub(crate) server_address: ServerAddress,
    pub(crate) command_response: HelloCommandResponse,
    pub(crate) raw_command_response: Document,
    pub(crate) cluster_time: Option<ClusterTime>,
}

/// The response to a `hello` command.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HelloCommandResponse {
    /// Whether the server is writable. If true, this instance is a primary in a replica set, a
    /// router in a sharded deployment, or a standalone.
    pub(crate) is_writable_primary: Option<bool>,

    /// Legacy name for the `is_writable_primary` field.
    #[serde(rename = "ismaster")]
    pub(crate) is_master: Option<bool>,

    /// Whether or not the server supports using the `hello` command for monitoring instead of
    /// the legacy command.
    pub(crate) hello_ok: Option<bool>,

    /// The list of all hosts.
    pub(crate) hosts: Option<Vec<String>>,

    /// The list of all passive members in a replica set.
    pub(crate) passives: Option<Vec<String>>,

    /// The list of all arbiters in a replica set.
    pub(crate) arbiters: Option<Vec<String>>,

    /// An optional message. This contains the value "isdbgrid" when returned from a sharded
    /// cluster router.
    pub(crate) msg: Option<String>,

    /// The address of the server that returned this response, from its own point of view.
    pub(crate) me: Option<String>,

    /// The list of compatible compressors that the server returned.
    #[serde(rename = "compression")]
    pub(crate) compressors: Option<Vec<String>>,

    /// The current replica set config version.
    pub(crate) set_version: Option<i32>,

    /// The id of the most recent election in which this node became primary.
    pub(crate) election_id: Option<crate::bson::oid::ObjectId>,

    /// The address of the member the server believes to be primary, if any.
    pub(crate) primary: Option<String>,

    /// The name of the current replica set.
    pub(crate) set_name: Option<String>,

    /// Whether the server is hidden.
    pub(crate) hidden: Option<bool>,

    /// Whether the server is a secondary.
    pub(crate) secondary: Option<bool>,

    /// Whether the server is an arbiter.
    pub(crate) arbiter_only: Option<bool>,

    /// Whether the server is a member of an uninitialized replica set.
    #[serde(rename = "isreplicaset")]
    pub(crate) is_replica_set: Option<bool>,

    /// The time in minutes that a session remains active after its most recent use.
    pub(crate) logical_session_timeout_minutes: Option<i64>,

    /// Optime and date information for the server's most recent write operation.
    pub(crate) last_write: Option<LastWrite>,

    /// The minimum wire version that the server supports.
    pub(crate) min_wire_version: Option<i32>,

    /// The maximum wire version that the server supports.
    pub(crate) max_wire_version: Option<i32>,

    /// The server-generated id for the connection the `hello` was run on.
    pub(crate) connection_id: Option<i64>,

    /// Whether the server supports the `saslSupportedMechs` negotiation and, if so, which
    /// mechanisms it supports for the handshake's user.
    pub(crate) sasl_supported_mechs: Option<Vec<String>>,

    /// The reply to speculative authentication done in the handshake.
    pub(crate) speculative_authenticate: Option<Document>,

    /// The maximum permitted size of a BSON object in bytes.
    pub(crate) max_bson_object_size: Option<i64>,

    /// The maximum permitted size of a wire protocol message.
    pub(crate) max_message_size_bytes: Option<i32>,

    /// The maximum number of write operations permitted in a write batch.
    pub(crate) max_write_batch_size: Option<i64>,

    /// The tags assigned to this replica set member.
    pub(crate) tags: Option<TagSet>,

    /// A process-scoped counter used to order monitoring updates from this server.
    pub(crate) topology_version: Option<TopologyVersion>,

    /// In load-balanced mode, the id of the backend behind the load balancer.
    pub(crate) service_id: Option<crate::bson::oid::ObjectId>,
}

impl HelloCommandResponse {
    /// Derives the server's type from this reply, following the monitoring rules for type
    /// inference.
    pub(crate) fn server_type(&self) -> ServerType {
        if self.msg.as_deref() == Some("isdbgrid") {
            ServerType::Mongos
        } else if self.set_name.is_some() {
            if self.hidden == Some(true) {
                ServerType::RsOther
            } else if self.is_writable_primary == Some(true) || self.is_master == Some(true) {
                ServerType::RsPrimary
            } else if self.secondary == Some(true) {
                ServerType::RsSecondary
            } else if self.arbiter_only == Some(true) {
                ServerType::RsArbiter
            } else {
                ServerType::RsOther
            }
        } else if self.is_replica_set == Some(true) {
            ServerType::RsGhost
        } else {
            ServerType::Standalone
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LastWrite {
    pub(crate) last_write_date: DateTime,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn server_type_inference() {
        let mut response = HelloCommandResponse {
            msg: Some("isdbgrid".to_string()),
            ..Default::default()
        };
        assert_eq!(response.server_type(), ServerType::Mongos);

        response.msg = None;
        response.set_name = Some("rs0".to_string());
        response.is_writable_primary = Some(true);
        assert_eq!(response.server_type(), ServerType::RsPrimary);

        response.is_writable_primary = None;
        response.secondary = Some(true);
        assert_eq!(response.server_type(), ServerType::RsSecondary);

        response.hidden = Some(true);
        assert_eq!(response.server_type(), ServerType::RsOther);

        let ghost = HelloCommandResponse {
            is_replica_set: Some(true),
            ..Default::default()
        };
        assert_eq!(ghost.server_type(), ServerType::RsGhost);

        assert_eq!(
            HelloCommandResponse::default().server_type(),
            ServerType::Standalone
        );
    }

    #[test]
    fn legacy_command_advertises_hello_ok() {
        let command = hello_command(None, None, None);
        assert_eq!(command.name, LEGACY_HELLO_COMMAND_NAME);
        assert_eq!(command.body.get_bool("helloOk"), Ok(true));

        let command = hello_command(None, Some(true), None);
        assert_eq!(command.name, "hello");

        let command = hello_command(Some(true), None, None);
        assert_eq!(command.name, "hello");
    }
}
