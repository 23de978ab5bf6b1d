//! Fail-fast worker pools.
//!
//! Every stage role of a pipeline runs on named OS threads spawned through
//! one [`WorkerPool`]. The first worker that fails (returns an error other
//! than `Cancelled`, or panics) cancels the pool's token, which interrupts
//! every blocked queue wait in the pipeline. `join` then reports that first
//! failure.

use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use tracing::Span;

use crate::error::{AnalysisError, Result};
use crate::pipeline::cancel::CancelToken;

struct Worker<T> {
    role: &'static str,
    handle: JoinHandle<Result<T>>,
}

/// Threads of one pipeline run, sharing one cancel token.
pub struct WorkerPool<T> {
    cancel: CancelToken,
    span: Span,
    workers: Vec<Worker<T>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Workers observe `cancel`; their events are recorded under `span`.
    pub fn new(cancel: CancelToken, span: Span) -> Self {
        Self {
            cancel,
            span,
            workers: Vec::new(),
        }
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Start worker `id` of `role`.
    pub fn spawn<F>(&mut self, role: &'static str, id: usize, work: F) -> Result<()>
    where
        F: FnOnce(&CancelToken) -> Result<T> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let span = tracing::debug_span!(parent: &self.span, "worker", role, id);
        let handle = thread::Builder::new()
            .name(format!("{role}-{id}"))
            .spawn(move || {
                let _entered = span.enter();
                let result = match panic::catch_unwind(AssertUnwindSafe(|| work(&cancel))) {
                    Ok(result) => result,
                    Err(_) => Err(AnalysisError::WorkerPanicked {
                        role: role.to_string(),
                    }),
                };
                if let Err(err) = &result {
                    if !err.is_cancelled() {
                        tracing::warn!(error = %err, "worker failed, shutting down pipeline");
                        cancel.cancel();
                    }
                }
                result
            })
            .map_err(|e| AnalysisError::Pipeline(format!("spawn {role}-{id}: {e}")))?;

        self.workers.push(Worker { role, handle });
        Ok(())
    }

    /// Wait for every worker.
    ///
    /// Returns the first real failure if any worker failed, `Cancelled` if
    /// a worker stopped because the token was cancelled, otherwise every
    /// worker's output in spawn order.
    pub fn join(mut self) -> Result<Vec<T>> {
        let workers = std::mem::take(&mut self.workers);
        let mut outputs = Vec::with_capacity(workers.len());
        let mut failure: Option<AnalysisError> = None;
        let mut cancelled = false;

        for worker in workers {
            match worker.handle.join() {
                Ok(Ok(output)) => outputs.push(output),
                Ok(Err(err)) if err.is_cancelled() => cancelled = true,
                Ok(Err(err)) => {
                    failure.get_or_insert(err);
                }
                Err(_) => {
                    failure.get_or_insert(AnalysisError::WorkerPanicked {
                        role: worker.role.to_string(),
                    });
                }
            }
        }

        if let Some(err) = failure {
            return Err(err);
        }
        if cancelled || self.cancel.is_cancelled() {
            return Err(AnalysisError::Cancelled);
        }
        Ok(outputs)
    }
}

impl<T> Drop for WorkerPool<T> {
    /// Dropping a pool that was never joined cancels its workers.
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.cancel.cancel();
        }
    }
}
