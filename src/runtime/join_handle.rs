use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

/// A handle to an asynchronously running task. Awaiting the handle yields the task's output.
///
/// The underlying task continues to run even if this handle is dropped.
#[derive(Debug)]
pub(crate) struct AsyncJoinHandle<T>(tokio::task::JoinHandle<T>);

impl<T> AsyncJoinHandle<T> {
    pub(crate) fn new(handle: tokio::task::JoinHandle<T>) -> Self {
        Self(handle)
    }
}

impl<T> Future for AsyncJoinHandle<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx).map(|result| {
            // Tasks spawned by this crate neither panic nor get aborted, so join errors are
            // not recoverable.
            result.unwrap_or_else(|e| panic!("task failed to execute: {}", e))
        })
    }
}
