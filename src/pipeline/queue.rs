//! Serial execution queue with queue-affinity detection

use anyhow::{Context, Result};
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};

type Job = Box<dyn FnOnce() + Send + 'static>;

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Id of the queue the current thread is serving, 0 if none
    static CURRENT_QUEUE: Cell<u64> = const { Cell::new(0) };
}

/// Runs submitted jobs one at a time, in order, on a dedicated thread.
///
/// Work submitted from a job already running on this queue executes inline,
/// so a callback on the queue can call back into queue-affine methods
/// without deadlocking. The thread exits once the queue is dropped and the
/// backlog is drained.
pub struct SerialQueue {
    id: u64,
    label: String,
    tx: mpsc::UnboundedSender<Job>,
}

impl SerialQueue {
    pub fn new(label: impl Into<String>) -> Result<Self> {
        let label = label.into();
        let id = NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

        std::thread::Builder::new()
            .name(label.clone())
            .spawn(move || {
                CURRENT_QUEUE.with(|current| current.set(id));
                while let Some(job) = rx.blocking_recv() {
                    job();
                }
                CURRENT_QUEUE.with(|current| current.set(0));
            })
            .with_context(|| format!("Failed to spawn queue thread {label}"))?;

        Ok(Self { id, label, tx })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// True when called from a job running on this queue
    pub fn is_current(&self) -> bool {
        CURRENT_QUEUE.with(|current| current.get() == self.id)
    }

    /// Run `job` asynchronously (inline when already on the queue).
    /// Returns false if the queue thread is gone.
    pub fn dispatch(&self, job: impl FnOnce() + Send + 'static) -> bool {
        if self.is_current() {
            job();
            return true;
        }
        self.tx.send(Box::new(job)).is_ok()
    }

    /// Run `job` and block the calling thread for its result.
    ///
    /// Must not be called from an async task; use `run` there.
    pub fn sync<R: Send + 'static>(&self, job: impl FnOnce() -> R + Send + 'static) -> Option<R> {
        if self.is_current() {
            return Some(job());
        }
        let (done_tx, done_rx) = oneshot::channel();
        let sent = self.tx.send(Box::new(move || {
            let _ = done_tx.send(job());
        }));
        if sent.is_err() {
            return None;
        }
        done_rx.blocking_recv().ok()
    }

    /// Run `job` on the queue and await its result
    pub async fn run<R: Send + 'static>(
        &self,
        job: impl FnOnce() -> R + Send + 'static,
    ) -> Option<R> {
        if self.is_current() {
            return Some(job());
        }
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Box::new(move || {
                let _ = done_tx.send(job());
            }))
            .ok()?;
        done_rx.await.ok()
    }
}

impl std::fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialQueue")
            .field("id", &self.id)
            .field("label", &self.label)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_jobs_run_in_order() {
        let queue = SerialQueue::new("test.order").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..50 {
            let seen = seen.clone();
            assert!(queue.dispatch(move || seen.lock().unwrap().push(i)));
        }
        // a sync job runs after everything queued before it
        queue.sync(|| ()).unwrap();
        assert_eq!(*seen.lock().unwrap(), (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_reentrant_sync_runs_inline() {
        let queue = Arc::new(SerialQueue::new("test.reentrant").unwrap());
        assert!(!queue.is_current());

        let inner = queue.clone();
        let result = queue
            .sync(move || {
                assert!(inner.is_current());
                // would deadlock if it re-entered the queue
                inner.sync(|| 41).map(|v| v + 1)
            })
            .flatten();
        assert_eq!(result, Some(42));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_run_from_async() {
        let queue = SerialQueue::new("test.async").unwrap();
        assert_eq!(queue.run(|| "done").await, Some("done"));
        assert_eq!(queue.label(), "test.async");
    }
}
