//! Cancellable blocking operations on bounded queues.
//!
//! `crossbeam-channel` queues are the only backpressure mechanism: a full
//! queue blocks the producer, an empty one blocks the consumer. Every wait
//! here also watches the cancel token's signals.

use crossbeam_channel::{Receiver, Select, Sender};

use crate::error::{AnalysisError, Result};
use crate::pipeline::cancel::CancelToken;

/// Block until an item arrives, the queue disconnects (`Ok(None)`), or the
/// token is cancelled (`Err(Cancelled)`).
pub fn recv<T>(rx: &Receiver<T>, cancel: &CancelToken) -> Result<Option<T>> {
    cancel.check()?;
    let signals: Vec<&Receiver<()>> = cancel.signals().collect();

    let mut sel = Select::new();
    let data = sel.recv(rx);
    for signal in signals.iter().copied() {
        sel.recv(signal);
    }

    let op = sel.select();
    let index = op.index();
    if index == data {
        return Ok(op.recv(rx).ok());
    }
    let _ = op.recv(signals[index - 1]);
    Err(AnalysisError::Cancelled)
}

/// Like [`recv`], for a consumer that is owed an item.
///
/// An upstream that disconnects before delivering has shut down early,
/// which is reported as `Cancelled`; the upstream's own failure is what the
/// pipeline returns.
pub fn recv_owed<T>(rx: &Receiver<T>, cancel: &CancelToken) -> Result<T> {
    recv(rx, cancel)?.ok_or(AnalysisError::Cancelled)
}

/// Block until `item` is accepted or the token is cancelled.
///
/// A disconnected receiver means the downstream stage has stopped, which
/// only happens on shutdown, so it is reported as `Cancelled`.
pub fn send<T>(tx: &Sender<T>, item: T, cancel: &CancelToken) -> Result<()> {
    cancel.check()?;
    let signals: Vec<&Receiver<()>> = cancel.signals().collect();

    let mut sel = Select::new();
    let data = sel.send(tx);
    for signal in signals.iter().copied() {
        sel.recv(signal);
    }

    let op = sel.select();
    let index = op.index();
    if index == data {
        return op.send(tx, item).map_err(|_| AnalysisError::Cancelled);
    }
    let _ = op.recv(signals[index - 1]);
    Err(AnalysisError::Cancelled)
}
