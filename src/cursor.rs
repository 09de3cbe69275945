use std::{collections::VecDeque, time::Duration};

use crate::{bson::Document, options::ServerAddress, Namespace};

/// The client-side state of a server cursor created by a cursor-bearing operation: its id, where
/// it lives, and the documents returned in the creating reply.
///
/// A cursor id of 0 means the server exhausted the cursor in the initial reply. Further batches
/// can be fetched with [`Client::get_more`](crate::Client::get_more).
#[derive(Debug)]
#[non_exhaustive]
pub struct CursorSpecification {
    /// The namespace the cursor is iterating.
    pub ns: Namespace,

    /// The server-assigned cursor id; 0 if the cursor is exhausted.
    pub id: i64,

    /// The address of the server the cursor lives on. Subsequent batches must be fetched from
    /// this server.
    pub address: ServerAddress,

    /// The requested size for subsequent batches.
    pub batch_size: Option<u32>,

    /// The time limit applied to subsequent batches of a tailable await cursor.
    pub max_await_time: Option<Duration>,

    /// Documents received but not yet iterated.
    pub buffer: VecDeque<Document>,

    /// In load-balanced mode, the connection the cursor must be iterated on.
    pub(crate) pinned_connection: Option<crate::cmap::PinnedConnectionHandle>,
}

impl CursorSpecification {
    pub(crate) fn new(
        info: crate::operation::CursorInfo,
        address: ServerAddress,
        batch_size: Option<u32>,
        max_await_time: Option<Duration>,
    ) -> Self {
        let mut buffer: VecDeque<Document> = info.first_batch.into();
        buffer.extend(info.next_batch);
        Self {
            ns: info.ns,
            id: info.id,
            address,
            batch_size,
            max_await_time,
            buffer,
            pinned_connection: None,
        }
    }

    /// Whether the server has exhausted this cursor.
    pub fn is_exhausted(&self) -> bool {
        self.id == 0
    }
}
