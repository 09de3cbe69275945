//! A combiner that groups heterogeneous write models into per-command batches.
//!
//! Servers accept one kind of write per command (`insert`, `update`, or `delete`), so a mixed
//! list of write models has to be split into runs. An ordered bulk preserves the caller's
//! sequence, cutting a new batch at every change of write kind; an unordered bulk groups all
//! models of a kind into a single batch. The combiner is a pure producer of batches: malformed
//! input is rejected before any batch is yielded, never partway through.

use crate::{
    bson::{doc, Document},
    bson_util,
    error::{ErrorKind, Result},
};

/// The maximum number of writes the server accepts in one command.
const MAX_WRITE_BATCH_SIZE: usize = 100_000;

/// A single write in a bulk operation.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum WriteModel {
    /// Insert the given document.
    InsertOne {
        /// The document to insert.
        document: Document,
    },

    /// Update the first document matching `filter`.
    UpdateOne {
        /// The filter selecting the document to update.
        filter: Document,
        /// The modifications to apply; every top-level key must be an update operator.
        update: Document,
    },

    /// Update all documents matching `filter`.
    UpdateMany {
        /// The filter selecting the documents to update.
        filter: Document,
        /// The modifications to apply; every top-level key must be an update operator.
        update: Document,
    },

    /// Replace the first document matching `filter` with `replacement`.
    ReplaceOne {
        /// The filter selecting the document to replace.
        filter: Document,
        /// The new document; must not contain update operators.
        replacement: Document,
    },

    /// Delete the first document matching `filter`.
    DeleteOne {
        /// The filter selecting the document to delete.
        filter: Document,
    },

    /// Delete all documents matching `filter`.
    DeleteMany {
        /// The filter selecting the documents to delete.
        filter: Document,
    },
}

/// The write command kinds that batches are grouped under.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum WriteKind {
    /// An `insert` command.
    Insert,
    /// An `update` command.
    Update,
    /// A `delete` command.
    Delete,
}

impl WriteKind {
    /// The name of the server command for this kind of write.
    pub fn command_name(&self) -> &'static str {
        match self {
            WriteKind::Insert => "insert",
            WriteKind::Update => "update",
            WriteKind::Delete => "delete",
        }
    }
}

/// A run of same-kind writes to be sent in one command.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct WriteBatch {
    /// The command the batch belongs to.
    pub kind: WriteKind,

    /// The documents making up the command's write payload, in input order.
    pub documents: Vec<Document>,
}

impl WriteModel {
    fn kind(&self) -> WriteKind {
        match self {
            WriteModel::InsertOne { .. } => WriteKind::Insert,
            WriteModel::UpdateOne { .. }
            | WriteModel::UpdateMany { .. }
            | WriteModel::ReplaceOne { .. } => WriteKind::Update,
            WriteModel::DeleteOne { .. } | WriteModel::DeleteMany { .. } => WriteKind::Delete,
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            WriteModel::UpdateOne { update, .. } | WriteModel::UpdateMany { update, .. } => {
                match bson_util::first_key(update) {
                    Some(key) if key.starts_with('$') => Ok(()),
                    _ => Err(ErrorKind::InvalidBulkOperation {
                        message: "update documents must only contain update operators".to_string(),
                    }
                    .into()),
                }
            }
            WriteModel::ReplaceOne { replacement, .. } => {
                match bson_util::first_key(replacement) {
                    Some(key) if key.starts_with('$') => Err(ErrorKind::InvalidBulkOperation {
                        message: "replacement documents must not contain update operators"
                            .to_string(),
                    }
                    .into()),
                    _ => Ok(()),
                }
            }
            WriteModel::InsertOne { .. }
            | WriteModel::DeleteOne { .. }
            | WriteModel::DeleteMany { .. } => Ok(()),
        }
    }

    fn into_wire_model(self) -> Document {
        match self {
            WriteModel::InsertOne { document } => document,
            WriteModel::UpdateOne { filter, update } => {
                doc! { "q": filter, "u": update, "multi": false }
            }
            WriteModel::UpdateMany { filter, update } => {
                doc! { "q": filter, "u": update, "multi": true }
            }
            WriteModel::ReplaceOne {
                filter,
                replacement,
            } => doc! { "q": filter, "u": replacement, "multi": false },
            WriteModel::DeleteOne { filter } => doc! { "q": filter, "limit": 1 },
            WriteModel::DeleteMany { filter } => doc! { "q": filter, "limit": 0 },
        }
    }
}

/// Groups the given write models into command batches.
///
/// When `ordered` is true, input order is preserved and a new batch begins whenever the write
/// kind changes; when false, each kind yields at most `MAX_WRITE_BATCH_SIZE`-document batches
/// in order of first appearance.
pub fn combine_batches(models: Vec<WriteModel>, ordered: bool) -> Result<Vec<WriteBatch>> {
    if models.is_empty() {
        return Err(ErrorKind::InvalidBulkOperation {
            message: "no writes were provided".to_string(),
        }
        .into());
    }

    for model in &models {
        model.validate()?;
    }

    let mut batches: Vec<WriteBatch> = Vec::new();
    for model in models {
        let kind = model.kind();
        let document = model.into_wire_model();

        // Ordered bulks may only extend the trailing batch; unordered bulks fold the model
        // into any open batch of its kind.
        let target = if ordered {
            batches
                .last_mut()
                .filter(|b| b.kind == kind && b.documents.len() < MAX_WRITE_BATCH_SIZE)
        } else {
            batches
                .iter_mut()
                .find(|b| b.kind == kind && b.documents.len() < MAX_WRITE_BATCH_SIZE)
        };

        match target {
            Some(batch) => batch.documents.push(document),
            None => batches.push(WriteBatch {
                kind,
                documents: vec![document],
            }),
        }
    }

    Ok(batches)
}

#[cfg(test)]
mod test {
    use super::*;

    fn insert(x: i32) -> WriteModel {
        WriteModel::InsertOne {
            document: doc! { "x": x },
        }
    }

    fn delete(x: i32) -> WriteModel {
        WriteModel::DeleteOne {
            filter: doc! { "x": x },
        }
    }

    #[test]
    fn ordered_batches_split_on_kind_change() {
        let batches = combine_batches(
            vec![insert(1), insert(2), delete(1), insert(3)],
            true,
        )
        .unwrap();

        let shape: Vec<(WriteKind, usize)> = batches
            .iter()
            .map(|b| (b.kind, b.documents.len()))
            .collect();
        assert_eq!(
            shape,
            vec![
                (WriteKind::Insert, 2),
                (WriteKind::Delete, 1),
                (WriteKind::Insert, 1),
            ]
        );
    }

    #[test]
    fn unordered_batches_group_by_kind() {
        let batches = combine_batches(
            vec![insert(1), delete(1), insert(2), delete(2), insert(3)],
            false,
        )
        .unwrap();

        let shape: Vec<(WriteKind, usize)> = batches
            .iter()
            .map(|b| (b.kind, b.documents.len()))
            .collect();
        assert_eq!(shape, vec![(WriteKind::Insert, 3), (WriteKind::Delete, 2)]);
    }

    #[test]
    fn malformed_updates_fail_before_batching() {
        let models = vec![
            insert(1),
            WriteModel::UpdateOne {
                filter: doc! { "x": 1 },
                update: doc! { "x": 2 },
            },
        ];
        let err = combine_batches(models, true).unwrap_err();
        assert!(matches!(
            err.kind.as_ref(),
            crate::error::ErrorKind::InvalidBulkOperation { .. }
        ));

        let models = vec![WriteModel::ReplaceOne {
            filter: doc! { "x": 1 },
            replacement: doc! { "$set": { "x": 2 } },
        }];
        assert!(combine_batches(models, true).is_err());
    }

    #[test]
    fn empty_input_is_rejected() {
        assert!(combine_batches(vec![], true).is_err());
    }

    #[test]
    fn wire_models_have_command_shapes() {
        let batches = combine_batches(
            vec![
                WriteModel::UpdateMany {
                    filter: doc! { "x": 1 },
                    update: doc! { "$inc": { "x": 1 } },
                },
                WriteModel::DeleteMany {
                    filter: doc! {},
                },
            ],
            true,
        )
        .unwrap();

        assert_eq!(batches[0].documents[0].get_bool("multi"), Ok(true));
        assert_eq!(batches[1].documents[0].get_i32("limit"), Ok(0));
    }
}
