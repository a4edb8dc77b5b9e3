use std::fmt;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{CleanerError, ErrorCode};

/// Capacity of every event channel; a slow consumer blocks the producer.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Event delivered by a long-running operation. A stream carries any
/// number of `Progress` events and ends with exactly one `Complete` or
/// one `Error`.
#[derive(Debug)]
pub enum Event<P, C> {
    Progress(P),
    Complete(C),
    Error(CleanerError),
}

impl<P, C> Event<P, C> {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Event::Progress(_))
    }
}

/// Drain `rx` until its terminal event, handing progress to `on_progress`.
/// A stream that closes without a terminal event counts as cancelled.
pub async fn wait_for_completion<P, C>(
    rx: &mut mpsc::Receiver<Event<P, C>>,
    mut on_progress: impl FnMut(P),
) -> Result<C, CleanerError> {
    while let Some(event) = rx.recv().await {
        match event {
            Event::Progress(progress) => on_progress(progress),
            Event::Complete(completion) => return Ok(completion),
            Event::Error(err) => return Err(err),
        }
    }
    Err(CleanerError::cancelled())
}

/// Why an emit did not reach the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EmitError {
    Cancelled,
    Closed,
}

impl fmt::Display for EmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmitError::Cancelled => f.write_str("cancelled"),
            EmitError::Closed => f.write_str("receiver dropped"),
        }
    }
}

impl From<EmitError> for CleanerError {
    fn from(err: EmitError) -> Self {
        match err {
            EmitError::Cancelled => CleanerError::cancelled(),
            EmitError::Closed => CleanerError::new(
                ErrorCode::CleanFailed,
                "event receiver dropped before the operation finished",
            ),
        }
    }
}

/// Producer half of an event stream, used from blocking threads.
///
/// Every send races the cancellation token, so a cancelled producer never
/// waits on a full channel and emits nothing but its final error.
pub(crate) struct EventEmitter<P, C> {
    tx: mpsc::Sender<Event<P, C>>,
    token: CancellationToken,
}

impl<P, C> EventEmitter<P, C> {
    pub(crate) fn channel(token: CancellationToken) -> (Self, mpsc::Receiver<Event<P, C>>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (EventEmitter { tx, token }, rx)
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) fn progress(&self, progress: P) -> Result<(), EmitError> {
        self.send(Event::Progress(progress))
    }

    pub(crate) fn complete(&self, completion: C) -> Result<(), EmitError> {
        self.send(Event::Complete(completion))
    }

    /// Terminal errors go out even after cancellation; that is the one
    /// event a cancelled stream still carries.
    pub(crate) fn error(&self, error: CleanerError) {
        if self.tx.blocking_send(Event::Error(error)).is_err() {
            log::debug!("Event receiver dropped before the terminal error");
        }
    }

    fn send(&self, event: Event<P, C>) -> Result<(), EmitError> {
        if self.token.is_cancelled() {
            return Err(EmitError::Cancelled);
        }
        futures::executor::block_on(async {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => Err(EmitError::Cancelled),
                sent = self.tx.send(event) => sent.map_err(|_| EmitError::Closed),
            }
        })
    }
}
