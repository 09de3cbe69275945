mod acknowledged_message;
mod join_handle;
pub(crate) mod stream;
mod tls;
mod worker_handle;

use std::{future::Future, time::Duration};

pub(crate) use self::{
    acknowledged_message::{AcknowledgedMessage, AcknowledgmentReceiver, AcknowledgmentSender},
    join_handle::AsyncJoinHandle,
    stream::AsyncStream,
    tls::TlsConfig,
    worker_handle::{WorkerHandle, WorkerHandleListener},
};
use crate::error::{Error, ErrorKind, Result};

/// Spawn a task in the background to run a future.
///
/// The spawned task is detached from the returned handle; dropping the handle does not cancel
/// the task.
pub(crate) fn spawn<F, O>(fut: F) -> AsyncJoinHandle<O>
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    AsyncJoinHandle::new(tokio::task::spawn(fut))
}

/// Await a future for a maximum amount of time, returning a timeout I/O error if the time limit
/// elapses first.
pub(crate) async fn timeout<F: Future>(timeout: Duration, future: F) -> Result<F::Output> {
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| Error::from(ErrorKind::Io(std::sync::Arc::new(std::io::ErrorKind::TimedOut.into()))))
}

/// Pause for the given amount of time.
pub(crate) async fn delay_for(delay: Duration) {
    tokio::time::sleep(delay).await
}
