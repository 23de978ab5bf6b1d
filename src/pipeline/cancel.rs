//! Cooperative cancellation for pipeline workers.
//!
//! A token is a flag plus a channel that is never sent on: cancelling drops
//! the only sender, which disconnects the channel and wakes every thread
//! selecting on it. Blocking queue operations (see [`super::queue`]) select
//! on the data channel and on every signal in the token's chain, so a
//! cancelled wait returns immediately.
//!
//! Child tokens observe their parent: cancelling a parent cancels every
//! child, cancelling a child leaves the parent untouched. Pipelines run on a
//! child of the caller's token so that an internal failure never cancels
//! the caller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::error::{AnalysisError, Result};

#[derive(Debug)]
struct Signal {
    cancelled: AtomicBool,
    trigger: Mutex<Option<Sender<()>>>,
    receiver: Receiver<()>,
}

impl Signal {
    fn new() -> Arc<Self> {
        let (tx, rx) = bounded(0);
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            trigger: Mutex::new(Some(tx)),
            receiver: rx,
        })
    }

    fn fire(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Ok(mut trigger) = self.trigger.lock() {
            trigger.take();
        }
    }
}

/// Shared cancellation handle. Cloning shares the same state.
#[derive(Debug, Clone)]
pub struct CancelToken {
    // chain[0] is this token's own signal; the rest are ancestors.
    chain: Vec<Arc<Signal>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            chain: vec![Signal::new()],
        }
    }

    /// A token cancelled by `self.cancel()` or by its own `cancel()`.
    pub fn child(&self) -> Self {
        let mut chain = Vec::with_capacity(self.chain.len() + 1);
        chain.push(Signal::new());
        chain.extend(self.chain.iter().cloned());
        Self { chain }
    }

    /// Cancel this token and all of its children. Idempotent.
    pub fn cancel(&self) {
        self.chain[0].fire();
    }

    pub fn is_cancelled(&self) -> bool {
        self.chain
            .iter()
            .any(|s| s.cancelled.load(Ordering::SeqCst))
    }

    /// `Err(Cancelled)` once cancelled, `Ok(())` otherwise.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(AnalysisError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Receivers that disconnect when this token (or an ancestor) is
    /// cancelled.
    pub fn signals(&self) -> impl Iterator<Item = &Receiver<()>> {
        self.chain.iter().map(|s| &s.receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_new_token_is_live() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());
    }

    #[test]
    fn test_cancel_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        clone.cancel();
        assert!(token.is_cancelled());
        assert!(token.check().unwrap_err().is_cancelled());
    }

    #[test]
    fn test_parent_cancels_child_but_not_reverse() {
        let parent = CancelToken::new();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let other = parent.child();
        parent.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn test_signal_wakes_blocked_thread() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = thread::spawn(move || {
            let signal = waiter.signals().next().unwrap().clone();
            signal.recv().is_err()
        });
        thread::sleep(Duration::from_millis(20));
        token.cancel();
        assert!(handle.join().unwrap());
    }
}
