use std::time::Duration;

use super::{CursorBody, Operation, Retryability};
use crate::{
    bson::doc,
    cmap::{Command, PinnedConnectionHandle, RawCommandResponse, StreamDescription},
    cursor::CursorSpecification,
    error::Result,
    selection_criteria::SelectionCriteria,
    Namespace,
};

/// Fetches the next batch from a cursor created by a previous operation. Always runs against
/// the server the cursor was created on.
#[derive(Debug)]
pub(crate) struct GetMore<'conn> {
    ns: Namespace,
    cursor_id: i64,
    selection_criteria: SelectionCriteria,
    batch_size: Option<u32>,
    max_await_time: Option<Duration>,
    pinned_connection: Option<&'conn PinnedConnectionHandle>,
}

impl<'conn> GetMore<'conn> {
    pub(crate) fn new(
        spec: &CursorSpecification,
        pinned_connection: Option<&'conn PinnedConnectionHandle>,
    ) -> Self {
        Self {
            ns: spec.ns.clone(),
            cursor_id: spec.id,
            selection_criteria: SelectionCriteria::from_address(spec.address.clone()),
            batch_size: spec.batch_size,
            max_await_time: spec.max_await_time,
            pinned_connection,
        }
    }
}

impl Operation for GetMore<'_> {
    type O = CursorSpecification;
    const NAME: &'static str = "getMore";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut body = doc! {
            Self::NAME: self.cursor_id,
            "collection": self.ns.coll.clone(),
        };

        if let Some(batch_size) = self.batch_size {
            if batch_size != 0 {
                body.insert("batchSize", batch_size as i64);
            }
        }

        if let Some(max_await_time) = self.max_await_time {
            body.insert(
                "maxTimeMS",
                i32::try_from(max_await_time.as_millis()).unwrap_or(i32::MAX),
            );
        }

        Ok(Command::new(Self::NAME, self.ns.db.clone(), body))
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        description: &StreamDescription,
    ) -> Result<Self::O> {
        let body: CursorBody = response.body()?;

        Ok(CursorSpecification::new(
            body.cursor,
            description.server_address.clone(),
            self.batch_size,
            self.max_await_time,
        ))
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        Some(&self.selection_criteria)
    }

    fn retryability(&self) -> Retryability {
        Retryability::None
    }

    fn pinned_connection(&self) -> Option<&PinnedConnectionHandle> {
        self.pinned_connection
    }
}
