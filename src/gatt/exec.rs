use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use futures_core::future::BoxFuture;
use pin_project::pin_project;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::debug;

use super::{Error, Result};

/// Queued unit of work.
type Work = BoxFuture<'static, ()>;

/// Single-worker executor that runs units of work one at a time in
/// submission order.
///
/// The underlying stack is not safe for overlapping mutating calls against
/// one session, so every session-touching operation is funneled through
/// here. A unit of work runs to completion, including any suspension while
/// awaiting a stack callback, before the next one starts; an error surfaces
/// to exactly one caller and does not affect subsequent units.
#[derive(Debug)]
pub(super) struct SerialExecutor {
    tx: mpsc::UnboundedSender<Work>,
    ct: CancellationToken,
}

impl SerialExecutor {
    /// Creates the executor and spawns its worker task. Must be called
    /// within a Tokio runtime.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let ct = CancellationToken::new();
        tokio::spawn(Self::run(rx, ct.clone()));
        Self { tx, ct }
    }

    /// Submits a unit of work. The returned future resolves with the work's
    /// result once every previously submitted unit has run to completion.
    ///
    /// Dropping the returned future cancels the unit of work at its next
    /// suspension point, abandoning any wait on a pending stack callback;
    /// the callback is later discarded without resolving a stale caller.
    pub fn submit<T, F>(&self, work: F) -> Pending<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let ct = CancellationToken::new();
        let unit = {
            let ct = ct.clone();
            Box::pin(async move {
                tokio::select! {
                    () = ct.cancelled() => {}
                    r = work => {
                        // The caller may have given up; nothing to do then.
                        let _ = tx.send(r);
                    }
                }
            })
        };
        if self.tx.send(unit).is_err() {
            debug!("Unit of work submitted after shutdown");
        }
        Pending {
            rx,
            _cancel: ct.drop_guard(),
        }
    }

    /// Stops the worker. The running unit of work is dropped at its next
    /// suspension point and queued units never start; their callers observe
    /// [`Error::Closed`]. Idempotent.
    pub fn stop(&self) {
        self.ct.cancel();
    }

    /// Receives and runs units of work until cancellation.
    async fn run(mut rx: mpsc::UnboundedReceiver<Work>, ct: CancellationToken) {
        debug!("Request worker started");
        loop {
            let unit = tokio::select! {
                biased;
                () = ct.cancelled() => break,
                unit = rx.recv() => match unit {
                    Some(unit) => unit,
                    None => break,
                },
            };
            tokio::select! {
                biased;
                () = ct.cancelled() => break,
                () = unit => {}
            }
        }
        debug!("Request worker terminating");
    }
}

/// Reply future for a submitted unit of work.
#[pin_project]
#[derive(Debug)]
pub(super) struct Pending<T> {
    #[pin]
    rx: oneshot::Receiver<Result<T>>,
    _cancel: DropGuard,
}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match ready!(self.project().rx.poll(cx)) {
            Ok(r) => Poll::Ready(r),
            Err(_) => Poll::Ready(Err(Error::Closed)),
        }
    }
}
