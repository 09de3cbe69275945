use std::time::Duration;

use serde::Deserialize;
use serde_with::skip_serializing_none;
use typed_builder::TypedBuilder;

use super::{CursorBody, Operation, Retryability};
use crate::{
    bson::{doc, Document},
    cmap::{Command, RawCommandResponse, StreamDescription},
    concern::ReadConcern,
    cursor::CursorSpecification,
    error::{ErrorKind, Result},
    selection_criteria::SelectionCriteria,
    Namespace,
};

/// The options for a find operation.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct FindOptions {
    /// The maximum number of documents to return; a negative value requests a single batch.
    pub limit: Option<i64>,

    /// The number of documents the server returns per batch.
    pub batch_size: Option<u32>,

    /// The number of documents to skip before returning.
    pub skip: Option<u64>,

    /// The order of the documents returned.
    pub sort: Option<Document>,

    /// Limits the fields of the documents returned.
    pub projection: Option<Document>,

    /// The maximum amount of time the server should spend servicing the operation.
    #[serde(skip)]
    pub max_time: Option<Duration>,

    /// The read concern for the operation.
    #[serde(skip)]
    pub read_concern: Option<ReadConcern>,

    /// The criteria for selecting the server the operation runs on.
    #[serde(skip)]
    pub selection_criteria: Option<SelectionCriteria>,
}

#[derive(Debug)]
pub(crate) struct Find {
    ns: Namespace,
    filter: Document,
    options: Option<Box<FindOptions>>,
}

impl Find {
    pub(crate) fn new(ns: Namespace, filter: Document, options: Option<FindOptions>) -> Self {
        Self {
            ns,
            filter,
            options: options.map(Box::new),
        }
    }
}

impl Operation for Find {
    type O = CursorSpecification;
    const NAME: &'static str = "find";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut body = doc! {
            Self::NAME: self.ns.coll.clone(),
        };

        if let Some(ref options) = self.options {
            // negative limits are requests for a single batch.
            if let Some(limit) = options.limit {
                body.insert("limit", limit.abs());
                if limit < 0 {
                    body.insert("singleBatch", true);
                }
            }

            if let Some(batch_size) = options.batch_size {
                if batch_size > i32::MAX as u32 {
                    return Err(ErrorKind::InvalidArgument {
                        message: "the batch size must fit into a signed 32-bit integer"
                            .to_string(),
                    }
                    .into());
                }
                body.insert("batchSize", batch_size as i32);
            }

            if let Some(skip) = options.skip {
                body.insert("skip", skip as i64);
            }

            if let Some(ref sort) = options.sort {
                body.insert("sort", sort.clone());
            }

            if let Some(ref projection) = options.projection {
                body.insert("projection", projection.clone());
            }

            if let Some(max_time) = options.max_time {
                body.insert(
                    "maxTimeMS",
                    i32::try_from(max_time.as_millis()).unwrap_or(i32::MAX),
                );
            }
        }

        body.insert("filter", self.filter.clone());

        Command::new_read(
            Self::NAME,
            self.ns.db.clone(),
            self.options
                .as_ref()
                .and_then(|o| o.read_concern.clone())
                .map(Into::into),
            body,
        )
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        description: &StreamDescription,
    ) -> Result<Self::O> {
        let body: CursorBody = response.body()?;

        // Cursors must be iterated on the server that created them.
        Ok(CursorSpecification::new(
            body.cursor,
            description.server_address.clone(),
            self.options.as_ref().and_then(|opts| opts.batch_size),
            None,
        ))
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.options
            .as_ref()
            .and_then(|opts| opts.selection_criteria.as_ref())
    }

    fn supports_read_concern(&self) -> bool {
        true
    }

    fn retryability(&self) -> Retryability {
        Retryability::Read
    }
}
