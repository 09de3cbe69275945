use super::Operation;
use crate::{
    bson::Document,
    bson_util,
    cmap::{Command, PinnedConnectionHandle, RawCommandResponse, StreamDescription},
    error::{ErrorKind, Result},
    selection_criteria::SelectionCriteria,
};

/// An arbitrary command to be run against a given database, returning the reply verbatim.
#[derive(Debug)]
pub(crate) struct RunCommand<'conn> {
    db: String,
    command: Document,
    selection_criteria: Option<SelectionCriteria>,
    pinned_connection: Option<&'conn PinnedConnectionHandle>,
}

impl<'conn> RunCommand<'conn> {
    pub(crate) fn new(
        db: String,
        command: Document,
        selection_criteria: Option<SelectionCriteria>,
        pinned_connection: Option<&'conn PinnedConnectionHandle>,
    ) -> Result<Self> {
        if bson_util::first_key(&command).is_none() {
            return Err(ErrorKind::InvalidArgument {
                message: "an empty document cannot be passed to a run_command operation"
                    .to_string(),
            }
            .into());
        }

        Ok(Self {
            db,
            command,
            selection_criteria,
            pinned_connection,
        })
    }

    fn command_name(&self) -> &str {
        bson_util::first_key(&self.command).unwrap_or("")
    }
}

impl Operation for RunCommand<'_> {
    type O = Document;

    // Since this command needs to handle arbitrary commands, we use the name of the first key
    // in the command document instead of a constant.
    const NAME: &'static str = "";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        Ok(Command::new(
            self.command_name(),
            self.db.clone(),
            self.command.clone(),
        ))
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        Ok(response.into_raw())
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.selection_criteria.as_ref()
    }

    fn supports_sessions(&self) -> bool {
        !matches!(self.command_name().to_lowercase().as_str(), "killcursors")
    }

    fn pinned_connection(&self) -> Option<&PinnedConnectionHandle> {
        self.pinned_connection
    }

    fn name(&self) -> &str {
        self.command_name()
    }
}
