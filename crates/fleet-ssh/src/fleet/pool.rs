//! Bounded fan-out of per-host tasks.
//!
//! A [`Wave`] runs one task per host with at most `concurrency` running at
//! once. Each task sends `(host, outcome)` over a channel; the caller drains
//! the channel as the single owner of the results. A task that panics still
//! reports, with the panic message in place of its outcome.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;

/// What a worker reports: its value, or the message it panicked with.
pub type TaskOutcome<T> = Result<T, String>;

/// One round of per-host tasks.
pub struct Wave<T> {
    permits: Arc<Semaphore>,
    tasks: JoinSet<()>,
    tx: mpsc::UnboundedSender<(String, TaskOutcome<T>)>,
    rx: mpsc::UnboundedReceiver<(String, TaskOutcome<T>)>,
}

impl<T> std::fmt::Debug for Wave<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wave")
            .field("available_permits", &self.permits.available_permits())
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

impl<T: Send + 'static> Wave<T> {
    /// Create a wave running at most `concurrency` tasks at a time.
    #[must_use]
    pub fn new(concurrency: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            tasks: JoinSet::new(),
            tx,
            rx,
        }
    }

    /// Queue `task` for `host`. It starts once a permit is free.
    pub fn spawn<F>(&mut self, host: String, task: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let tx = self.tx.clone();
        self.tasks.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            let outcome = AssertUnwindSafe(task)
                .catch_unwind()
                .await
                .map_err(panic_message);
            let _ = tx.send((host, outcome));
        });
    }

    /// Number of tasks not yet finished.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether every task has finished.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Next reported outcome, or `None` once every task has finished and
    /// every report has been taken.
    pub async fn next(&mut self) -> Option<(String, TaskOutcome<T>)> {
        loop {
            tokio::select! {
                biased;
                Some(report) = self.rx.recv() => return Some(report),
                joined = self.tasks.join_next() => {
                    if joined.is_none() {
                        return self.rx.try_recv().ok();
                    }
                }
            }
        }
    }

    /// Cancel every task still queued or running.
    pub fn abort(&mut self) {
        self.tasks.abort_all();
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "task panicked".to_string())
}
