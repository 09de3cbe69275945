use tokio::sync::mpsc;

use super::conn::Connection;
use crate::{
    bson::oid::ObjectId,
    error::Error,
    runtime::{AcknowledgedMessage, AcknowledgmentReceiver},
};

/// A handle for steering a pool from outside: clearing it, readying it, and returning
/// connections to it. Unlike a checkout requester, holding a manager does not keep the pool's
/// worker alive.
#[derive(Clone, Debug)]
pub(crate) struct PoolManager {
    sender: mpsc::UnboundedSender<PoolCommand>,
}

impl PoolManager {
    pub(super) fn channel() -> (PoolManager, PoolCommandReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (PoolManager { sender }, PoolCommandReceiver { receiver })
    }

    /// Asks the pool to bump its generation (for one service, in load-balanced mode) and
    /// pause. The returned receiver resolves once the pool has done so.
    pub(crate) fn clear(
        &self,
        cause: Error,
        service_id: Option<ObjectId>,
    ) -> AcknowledgmentReceiver<()> {
        let (done, acknowledgment) = AcknowledgedMessage::package(());
        let _ = self.sender.send(PoolCommand::Clear {
            cause,
            service_id,
            done,
        });
        acknowledgment
    }

    /// Asks the pool to start serving checkouts. The returned receiver resolves once it has.
    pub(crate) fn mark_as_ready(&self) -> AcknowledgmentReceiver<()> {
        let (done, acknowledgment) = AcknowledgedMessage::package(());
        let _ = self.sender.send(PoolCommand::Ready { done });
        acknowledgment
    }

    /// Returns a connection to the pool. If the pool is already gone, the connection comes
    /// back in the error position so the caller can close it properly.
    pub(crate) fn check_in(&self, connection: Connection) -> std::result::Result<(), Connection> {
        match self
            .sender
            .send(PoolCommand::CheckIn(Box::new(connection)))
        {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(PoolCommand::CheckIn(connection))) => Err(*connection),
            Err(_) => unreachable!("a check-in send error returns the check-in command"),
        }
    }

    /// Reports that an establishment attempt failed, releasing its reserved slot.
    pub(super) fn establishment_failed(&self) {
        let _ = self.sender.send(PoolCommand::EstablishmentFailed);
    }

    /// Reports that an establishment attempt produced a connection.
    pub(super) fn establishment_succeeded(&self, outcome: EstablishedConnection) {
        let _ = self
            .sender
            .send(PoolCommand::EstablishmentSucceeded(outcome));
    }
}

#[derive(Debug)]
pub(super) struct PoolCommandReceiver {
    receiver: mpsc::UnboundedReceiver<PoolCommand>,
}

impl PoolCommandReceiver {
    pub(super) async fn recv(&mut self) -> Option<PoolCommand> {
        self.receiver.recv().await
    }
}

/// The instructions a pool worker accepts from its managers.
#[derive(Debug)]
pub(super) enum PoolCommand {
    Clear {
        cause: Error,
        service_id: Option<ObjectId>,
        done: AcknowledgedMessage<()>,
    },
    Ready {
        done: AcknowledgedMessage<()>,
    },
    CheckIn(Box<Connection>),
    EstablishmentFailed,
    EstablishmentSucceeded(EstablishedConnection),
}

/// Where a freshly established connection ended up.
#[derive(Debug)]
pub(super) enum EstablishedConnection {
    /// Handed directly to the requester that triggered the establishment.
    HandedOut { service_id: Option<ObjectId> },

    /// Created to satisfy the pool's minimum size; stored as idle.
    Stored(Box<Connection>),
}

impl EstablishedConnection {
    pub(super) fn service_id(&self) -> Option<ObjectId> {
        match self {
            EstablishedConnection::HandedOut { service_id } => *service_id,
            EstablishedConnection::Stored(connection) => connection.generation.service_id(),
        }
    }
}
