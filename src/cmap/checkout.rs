use tokio::sync::{mpsc, oneshot};

use super::conn::Connection;
use crate::{
    error::{Error, Result},
    runtime::{AsyncJoinHandle, WorkerHandle},
};

/// Builds the checkout channel for a pool: the requester half hands out connections to
/// operations, the queue half is drained by the pool's worker task.
pub(super) fn channel(worker: WorkerHandle) -> (CheckoutRequester, CheckoutQueue) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        CheckoutRequester {
            sender,
            _worker: worker,
        },
        CheckoutQueue { receiver },
    )
}

/// The handle operations use to ask the pool for a connection.
///
/// Requesters double as the pool's liveness token: the worker runs for exactly as long as at
/// least one requester exists.
#[derive(Clone, Debug)]
pub(super) struct CheckoutRequester {
    sender: mpsc::UnboundedSender<ConnectionRequest>,
    _worker: WorkerHandle,
}

impl CheckoutRequester {
    /// Submits a checkout request and waits for the pool to answer it.
    pub(super) async fn request(&self) -> CheckoutResponse {
        let (request, reply) = ConnectionRequest::package();

        if self.sender.send(request).is_err() {
            // Unreachable while we hold a worker handle, but fail soft regardless.
            return CheckoutResponse::Rejected(Error::internal(
                "connection pool stopped accepting requests",
            ));
        }

        match reply.await {
            Ok(response) => response,
            Err(_) => CheckoutResponse::Rejected(Error::internal(
                "connection pool dropped a checkout request",
            )),
        }
    }
}

/// The worker-side end of the checkout channel.
#[derive(Debug)]
pub(super) struct CheckoutQueue {
    receiver: mpsc::UnboundedReceiver<ConnectionRequest>,
}

impl CheckoutQueue {
    pub(super) async fn recv(&mut self) -> Option<ConnectionRequest> {
        self.receiver.recv().await
    }
}

/// One parked checkout: completing it hands the requester its answer.
#[derive(Debug)]
pub(super) struct ConnectionRequest {
    reply: oneshot::Sender<CheckoutResponse>,
}

impl ConnectionRequest {
    fn package() -> (Self, oneshot::Receiver<CheckoutResponse>) {
        let (reply, receiver) = oneshot::channel();
        (Self { reply }, receiver)
    }

    /// Answers the request. If the requester already gave up (e.g. its deadline passed), the
    /// unclaimed response is handed back so the caller can salvage its contents.
    pub(super) fn respond(
        self,
        response: CheckoutResponse,
    ) -> std::result::Result<(), CheckoutResponse> {
        self.reply.send(response)
    }
}

/// What the pool had to offer a checkout request.
#[derive(Debug)]
pub(super) enum CheckoutResponse {
    /// An idle connection, ready for use.
    Ready(Box<Connection>),

    /// Nothing was idle, so an establishment was started on the requester's behalf; awaiting
    /// the handle yields the connection.
    Establishing(AsyncJoinHandle<Result<Connection>>),

    /// The pool cannot serve requests right now; the error is the reason why.
    Rejected(Error),
}

impl CheckoutResponse {
    /// Recovers the connection from an unclaimed `Ready` response.
    pub(super) fn into_ready_connection(self) -> Option<Connection> {
        match self {
            CheckoutResponse::Ready(connection) => Some(*connection),
            _ => None,
        }
    }
}
