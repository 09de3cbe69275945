mod abort_transaction;
mod commit_transaction;
mod end_sessions;
mod find;
mod get_more;
mod insert;
mod run_command;

#[cfg(test)]
mod test;

use serde::Deserialize;

use crate::{
    bson::Document,
    cmap::{Command, PinnedConnectionHandle, RawCommandResponse, StreamDescription},
    concern::WriteConcern,
    error::{CommandError, Error, Result},
    selection_criteria::SelectionCriteria,
};

pub(crate) use abort_transaction::{AbortTransaction, TransactionPin};
pub(crate) use commit_transaction::CommitTransaction;
pub(crate) use end_sessions::EndSessions;
pub(crate) use find::Find;
pub use find::FindOptions;
pub(crate) use get_more::GetMore;
pub(crate) use insert::Insert;
pub use insert::InsertManyResult;
pub(crate) use run_command::RunCommand;

/// A trait modeling the behavior of a server side operation.
pub(crate) trait Operation {
    /// The output type of this operation.
    type O;

    /// The name of the server side command associated with this operation.
    const NAME: &'static str;

    /// Returns the command that should be sent to the server as part of this operation.
    /// The operation may store some additional state that is required for handling the
    /// response.
    fn build(&mut self, description: &StreamDescription) -> Result<Command>;

    /// Interprets the server response to the command.
    fn handle_response(
        &self,
        response: RawCommandResponse,
        description: &StreamDescription,
    ) -> Result<Self::O>;

    /// Interpret an error encountered while sending the built command to the server,
    /// potentially recovering.
    fn handle_error(&self, error: Error) -> Result<Self::O> {
        Err(error)
    }

    /// Criteria to use for selecting the server that this operation will be executed on.
    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        None
    }

    /// Whether or not this operation will request acknowledgment from the server.
    fn is_acknowledged(&self) -> bool {
        self.write_concern()
            .map(WriteConcern::is_acknowledged)
            .unwrap_or(true)
    }

    /// The write concern to use for this operation, if any.
    fn write_concern(&self) -> Option<&WriteConcern> {
        None
    }

    /// Whether this operation supports sessions or not.
    fn supports_sessions(&self) -> bool {
        true
    }

    /// Whether the command body for this operation may carry a read concern, and by extension
    /// an `afterClusterTime` for causally consistent sessions.
    fn supports_read_concern(&self) -> bool {
        false
    }

    /// The level of retryability the operation supports.
    fn retryability(&self) -> Retryability {
        Retryability::None
    }

    /// Updates this operation as needed for a retry.
    fn update_for_retry(&mut self) {}

    /// The connection this operation is pinned to, if any.
    fn pinned_connection(&self) -> Option<&PinnedConnectionHandle> {
        None
    }

    fn name(&self) -> &str {
        Self::NAME
    }
}

/// The retryability level of an operation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Retryability {
    Write,
    Read,
    None,
}

/// The body of a `{ok: 0}` server reply.
#[derive(Deserialize, Clone, Debug)]
pub(crate) struct CommandErrorBody {
    #[serde(rename = "errorLabels")]
    pub(crate) error_labels: Option<Vec<String>>,

    #[serde(flatten)]
    pub(crate) command_error: CommandError,
}

impl From<CommandErrorBody> for Error {
    fn from(command_error_response: CommandErrorBody) -> Error {
        Error::new(
            crate::error::ErrorKind::Command(command_error_response.command_error),
            command_error_response.error_labels,
        )
    }
}

/// The shape of a server reply carrying a cursor.
#[derive(Debug, Deserialize)]
pub(crate) struct CursorBody {
    pub(crate) cursor: CursorInfo,
}

/// The `cursor` subdocument of a cursor-bearing reply.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CursorInfo {
    pub(crate) id: i64,

    pub(crate) ns: crate::Namespace,

    #[serde(default)]
    pub(crate) first_batch: Vec<Document>,

    #[serde(default)]
    pub(crate) next_batch: Vec<Document>,
}

/// Appends a serialized write concern to a command body if the write concern is non-empty.
pub(crate) fn append_write_concern(
    body: &mut Document,
    write_concern: Option<&WriteConcern>,
) -> Result<()> {
    if let Some(write_concern) = write_concern {
        if !write_concern.is_empty() {
            write_concern.validate()?;
            body.insert("writeConcern", crate::bson::to_document(write_concern)?);
        }
    }
    Ok(())
}
