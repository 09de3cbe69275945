use super::Operation;
use crate::{
    bson::{doc, Document},
    bson_util,
    cmap::{Command, RawCommandResponse, StreamDescription},
    error::Result,
    selection_criteria::{ReadPreference, SelectionCriteria},
};

/// Releases a batch of pooled server sessions on shutdown. Failure is inconsequential: the
/// server expires abandoned sessions on its own after the logical session timeout.
#[derive(Debug)]
pub(crate) struct EndSessions {
    session_ids: Vec<Document>,
    selection_criteria: SelectionCriteria,
}

impl EndSessions {
    pub(crate) fn new(session_ids: Vec<Document>) -> Self {
        Self {
            session_ids,
            selection_criteria: SelectionCriteria::ReadPreference(
                ReadPreference::PrimaryPreferred {
                    options: Default::default(),
                },
            ),
        }
    }
}

impl Operation for EndSessions {
    type O = ();
    const NAME: &'static str = "endSessions";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let body = doc! {
            Self::NAME: bson_util::to_bson_array(&self.session_ids),
        };

        Ok(Command::new(Self::NAME, "admin", body))
    }

    fn handle_response(
        &self,
        _response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        Ok(())
    }

    fn supports_sessions(&self) -> bool {
        false
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        Some(&self.selection_criteria)
    }
}
