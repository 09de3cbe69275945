use std::time::Duration;

use super::{append_write_concern, Operation, Retryability};
use crate::{
    bson::doc,
    cmap::{Command, RawCommandResponse, StreamDescription},
    concern::{Acknowledgment, WriteConcern},
    error::Result,
    options::TransactionOptions,
};

#[derive(Debug)]
pub(crate) struct CommitTransaction {
    options: Option<TransactionOptions>,
}

impl CommitTransaction {
    pub(crate) fn new(options: Option<TransactionOptions>) -> Self {
        Self { options }
    }
}

impl Operation for CommitTransaction {
    type O = ();
    const NAME: &'static str = "commitTransaction";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut body = doc! {
            Self::NAME: 1,
        };

        append_write_concern(&mut body, self.write_concern())?;

        if let Some(max_commit_time) = self.options.as_ref().and_then(|o| o.max_commit_time) {
            body.insert(
                "maxTimeMS",
                i32::try_from(max_commit_time.as_millis()).unwrap_or(i32::MAX),
            );
        }

        Ok(Command::new(Self::NAME, "admin", body))
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        response.validate()
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.options
            .as_ref()
            .and_then(|options| options.write_concern.as_ref())
    }

    fn retryability(&self) -> Retryability {
        Retryability::Write
    }

    /// When a commit is retried, a majority write concern with a default wtimeout is applied so
    /// a retry cannot succeed with weaker durability than the first attempt.
    fn update_for_retry(&mut self) {
        let options = self
            .options
            .get_or_insert_with(|| TransactionOptions::builder().build());
        let write_concern = match options.write_concern.take() {
            Some(wc) => WriteConcern {
                w: Some(Acknowledgment::Majority),
                w_timeout: wc.w_timeout.or(Some(Duration::from_secs(10))),
                journal: wc.journal,
            },
            None => WriteConcern {
                w: Some(Acknowledgment::Majority),
                w_timeout: Some(Duration::from_secs(10)),
                journal: None,
            },
        };
        options.write_concern = Some(write_concern);
    }
}
