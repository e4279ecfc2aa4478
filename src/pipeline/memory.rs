//! In-memory reader and writer collaborators

use anyhow::anyhow;
use async_trait::async_trait;
use log::debug;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::media::{MediaKind, SampleBuffer};
use crate::pipeline::io::{ReadyCallback, SampleConsumer, SampleProducer, drive_ready_callback};

/// Reader that serves a fixed list of samples
pub struct VecProducer {
    media_kind: MediaKind,
    samples: Mutex<VecDeque<SampleBuffer>>,
    served: AtomicUsize,
    /// Fail instead of serving sample number `n`
    fail_after: Option<usize>,
    /// Delay before each sample
    pace: Option<Duration>,
    error: Mutex<Option<Arc<anyhow::Error>>>,
    cancel: CancellationToken,
}

impl VecProducer {
    pub fn new(media_kind: MediaKind, samples: Vec<SampleBuffer>) -> Self {
        Self {
            media_kind,
            samples: Mutex::new(samples.into()),
            served: AtomicUsize::new(0),
            fail_after: None,
            pace: None,
            error: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_failure_after(mut self, served: usize) -> Self {
        self.fail_after = Some(served);
        self
    }

    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = Some(pace);
        self
    }

    pub fn served(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }

    pub fn remaining(&self) -> usize {
        self.samples.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[async_trait]
impl SampleProducer for VecProducer {
    async fn next_buffer(&self) -> Option<SampleBuffer> {
        if self.cancel.is_cancelled() {
            return None;
        }
        if let Some(pace) = self.pace {
            tokio::select! {
                _ = tokio::time::sleep(pace) => {}
                _ = self.cancel.cancelled() => return None,
            }
        }
        if self.fail_after.is_some_and(|n| self.served() >= n) {
            if let Ok(mut error) = self.error.lock()
                && error.is_none()
            {
                *error = Some(Arc::new(anyhow!("read error after {} samples", self.served())));
            }
            return None;
        }
        let sample = self.samples.lock().ok()?.pop_front()?;
        self.served.fetch_add(1, Ordering::SeqCst);
        Some(sample)
    }

    fn media_kind(&self) -> MediaKind {
        self.media_kind
    }

    fn cancel(&self) {
        debug!("VecProducer: cancelled after {} samples", self.served());
        self.cancel.cancel();
    }

    fn error(&self) -> Option<Arc<anyhow::Error>> {
        self.error.lock().ok()?.clone()
    }
}

struct CollectorInner {
    samples: Mutex<Vec<SampleBuffer>>,
    finished: AtomicBool,
    cancelled: AtomicBool,
    /// Refuse sample number `n` and fail
    reject_after: Option<usize>,
    error: Mutex<Option<Arc<anyhow::Error>>>,
    changed: Notify,
}

/// Writer that keeps every appended sample; always ready until finished
#[derive(Clone)]
pub struct CollectingConsumer {
    inner: Arc<CollectorInner>,
}

impl CollectingConsumer {
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn rejecting_after(count: usize) -> Self {
        Self::build(Some(count))
    }

    fn build(reject_after: Option<usize>) -> Self {
        Self {
            inner: Arc::new(CollectorInner {
                samples: Mutex::new(Vec::new()),
                finished: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                reject_after,
                error: Mutex::new(None),
                changed: Notify::new(),
            }),
        }
    }

    pub fn samples(&self) -> Vec<SampleBuffer> {
        self.inner
            .samples
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.samples.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    fn has_error(&self) -> bool {
        self.inner.error.lock().map(|e| e.is_some()).unwrap_or(true)
    }
}

impl Default for CollectingConsumer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SampleConsumer for CollectingConsumer {
    fn append(&self, sample: SampleBuffer) -> bool {
        if !self.is_ready_for_more() {
            return false;
        }
        let Ok(mut samples) = self.inner.samples.lock() else {
            return false;
        };
        if self.inner.reject_after.is_some_and(|n| samples.len() >= n) {
            drop(samples);
            if let Ok(mut error) = self.inner.error.lock() {
                *error = Some(Arc::new(anyhow!("writer refused sample at {}", sample.pts())));
            }
            self.inner.changed.notify_waiters();
            return false;
        }
        samples.push(sample);
        drop(samples);
        self.inner.changed.notify_waiters();
        true
    }

    fn is_ready_for_more(&self) -> bool {
        !self.is_finished() && !self.is_cancelled() && !self.has_error()
    }

    fn mark_finished(&self) {
        if !self.inner.finished.swap(true, Ordering::SeqCst) {
            debug!("CollectingConsumer: finished with {} samples", self.len());
        }
        self.inner.changed.notify_waiters();
    }

    async fn wait_ready(&self) -> bool {
        self.is_ready_for_more()
    }

    async fn ready_changed(&self) {
        let notified = self.inner.changed.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_ready_for_more() {
            notified.await;
        }
    }

    fn request_data_when_ready(&self, handle: &Handle, callback: ReadyCallback) -> JoinHandle<()> {
        drive_ready_callback(Arc::new(self.clone()), handle, callback)
    }

    fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.changed.notify_waiters();
    }

    fn error(&self) -> Option<Arc<anyhow::Error>> {
        self.inner.error.lock().ok()?.clone()
    }
}
