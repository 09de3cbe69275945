use std::collections::HashMap;

use super::{append_write_concern, Operation, Retryability};
use crate::{
    bson::{doc, oid::ObjectId, Bson, Document},
    bson_util,
    cmap::{Command, RawCommandResponse, StreamDescription},
    concern::WriteConcern,
    error::{Error, ErrorKind, Result, WriteConcernError, WriteError, WriteFailure},
    Namespace,
};

/// The results of an insert operation.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct InsertManyResult {
    /// The `_id` values of the inserted documents, keyed by their index in the input.
    pub inserted_ids: HashMap<usize, Bson>,
}

#[derive(Debug)]
pub(crate) struct Insert {
    ns: Namespace,
    documents: Vec<Document>,
    inserted_ids: Vec<Bson>,
    ordered: bool,
    write_concern: Option<WriteConcern>,
}

impl Insert {
    pub(crate) fn new(
        ns: Namespace,
        documents: Vec<Document>,
        ordered: Option<bool>,
        write_concern: Option<WriteConcern>,
    ) -> Self {
        Self {
            ns,
            documents,
            inserted_ids: vec![],
            ordered: ordered.unwrap_or(true),
            write_concern,
        }
    }
}

impl Operation for Insert {
    type O = InsertManyResult;
    const NAME: &'static str = "insert";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        if self.documents.is_empty() {
            return Err(ErrorKind::InvalidArgument {
                message: "no documents provided for insert".to_string(),
            }
            .into());
        }

        // Generate missing `_id`s client-side so the caller can correlate results with inputs.
        self.inserted_ids.clear();
        let mut documents = Vec::with_capacity(self.documents.len());
        for document in &self.documents {
            let mut document = document.clone();
            let id = document
                .entry("_id".to_string())
                .or_insert_with(|| Bson::ObjectId(ObjectId::new()))
                .clone();
            self.inserted_ids.push(id);
            documents.push(document);
        }

        let mut body = doc! {
            Self::NAME: self.ns.coll.clone(),
            "documents": bson_util::to_bson_array(&documents),
            "ordered": self.ordered,
        };

        append_write_concern(&mut body, self.write_concern.as_ref())?;

        Ok(Command::new(Self::NAME, self.ns.db.clone(), body))
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        let reply = response.raw();

        if let Ok(write_errors) = reply.get_array("writeErrors") {
            if let Some(Bson::Document(first)) = write_errors.first() {
                let write_error: WriteError =
                    crate::bson::from_document(first.clone()).map_err(|e| {
                        Error::from(ErrorKind::InvalidResponse {
                            message: format!("invalid writeErrors in reply: {}", e),
                        })
                    })?;
                return Err(ErrorKind::Write(WriteFailure::WriteError(write_error)).into());
            }
        }

        if let Ok(wc_error) = reply.get_document("writeConcernError") {
            let wc_error: WriteConcernError = crate::bson::from_document(wc_error.clone())
                .map_err(|e| {
                    Error::from(ErrorKind::InvalidResponse {
                        message: format!("invalid writeConcernError in reply: {}", e),
                    })
                })?;
            return Err(ErrorKind::Write(WriteFailure::WriteConcernError(wc_error)).into());
        }

        let inserted_ids = self
            .inserted_ids
            .iter()
            .enumerate()
            .map(|(index, id)| (index, id.clone()))
            .collect();
        Ok(InsertManyResult { inserted_ids })
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.write_concern.as_ref()
    }

    fn retryability(&self) -> Retryability {
        Retryability::Write
    }
}
