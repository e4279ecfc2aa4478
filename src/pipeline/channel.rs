//! Track channel
//!
//! Binds one producer to one consumer for a single track and pumps samples
//! from the first into the second on its own task. Channels of different
//! tracks run independently.

use anyhow::{Result, anyhow, bail};
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::media::{MediaKind, SampleBuffer};
use crate::pipeline::io::{SampleConsumer, SampleProducer};

/// Observer told about every sample a channel moves
pub trait ChannelDelegate: Send + Sync {
    /// `count` includes `sample`
    fn did_read_buffer(&self, track: u32, sample: &SampleBuffer, count: u64);
}

#[derive(Debug, Clone)]
pub enum ChannelOutcome {
    Completed,
    Cancelled,
    Failed(Arc<anyhow::Error>),
}

impl ChannelOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, ChannelOutcome::Failed(_))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelOutcome::Completed => "completed",
            ChannelOutcome::Cancelled => "cancelled",
            ChannelOutcome::Failed(_) => "failed",
        }
    }
}

impl Serialize for ChannelOutcome {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            ChannelOutcome::Failed(err) => serializer.serialize_str(&format!("failed: {err:#}")),
            outcome => serializer.serialize_str(outcome.as_str()),
        }
    }
}

/// Final state of one channel, handed to the completion handler
#[derive(Debug, Clone, Serialize)]
pub struct ChannelReport {
    pub track: u32,
    pub media_kind: MediaKind,
    pub count: u64,
    pub outcome: ChannelOutcome,
}

pub struct TrackChannel {
    track: u32,
    producer: Arc<dyn SampleProducer>,
    consumer: Arc<dyn SampleConsumer>,
    count: Arc<AtomicU64>,
    finished: Arc<AtomicBool>,
    started: AtomicBool,
    cancel: CancellationToken,
}

impl TrackChannel {
    pub fn new(
        track: u32,
        producer: Arc<dyn SampleProducer>,
        consumer: Arc<dyn SampleConsumer>,
    ) -> Self {
        Self {
            track,
            producer,
            consumer,
            count: Arc::new(AtomicU64::new(0)),
            finished: Arc::new(AtomicBool::new(false)),
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    pub fn track(&self) -> u32 {
        self.track
    }

    pub fn media_kind(&self) -> MediaKind {
        self.producer.media_kind()
    }

    /// Samples moved so far
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Stop pumping; a pending `next_buffer` returns promptly
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            debug!("TrackChannel[{}]: cancel requested", self.track);
            self.cancel.cancel();
        }
    }

    /// Start the pump on the current runtime.
    ///
    /// `completion` runs exactly once, after the channel finished for any
    /// reason. A channel can only be started once.
    pub fn start(
        &self,
        delegate: Option<Arc<dyn ChannelDelegate>>,
        completion: impl FnOnce(ChannelReport) + Send + 'static,
    ) -> Result<JoinHandle<ChannelReport>> {
        if self.started.swap(true, Ordering::SeqCst) {
            bail!("track {} channel already started", self.track);
        }

        let pump = Pump {
            track: self.track,
            producer: self.producer.clone(),
            consumer: self.consumer.clone(),
            delegate,
            count: self.count.clone(),
            cancel: self.cancel.clone(),
        };
        let finished = self.finished.clone();
        let media_kind = self.media_kind();

        info!("TrackChannel[{}]: started ({})", self.track, media_kind);
        Ok(tokio::spawn(async move {
            let outcome = pump.run().await;
            finished.store(true, Ordering::SeqCst);
            let report = ChannelReport {
                track: pump.track,
                media_kind,
                count: pump.count.load(Ordering::SeqCst),
                outcome,
            };
            match &report.outcome {
                ChannelOutcome::Failed(err) => warn!(
                    "TrackChannel[{}]: failed after {} samples: {:#}",
                    report.track, report.count, err
                ),
                outcome => info!(
                    "TrackChannel[{}]: {} after {} samples",
                    report.track,
                    outcome.as_str(),
                    report.count
                ),
            }
            completion(report.clone());
            report
        }))
    }
}

struct Pump {
    track: u32,
    producer: Arc<dyn SampleProducer>,
    consumer: Arc<dyn SampleConsumer>,
    delegate: Option<Arc<dyn ChannelDelegate>>,
    count: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl Pump {
    async fn run(&self) -> ChannelOutcome {
        loop {
            let ready = tokio::select! {
                _ = self.cancel.cancelled() => return self.cancelled(),
                ready = self.consumer.wait_ready() => ready,
            };
            if !ready {
                // consumer stopped accepting before the producer ran dry
                self.producer.cancel();
                return match self.consumer.error() {
                    Some(err) => ChannelOutcome::Failed(err),
                    None => ChannelOutcome::Cancelled,
                };
            }

            while self.consumer.is_ready_for_more() {
                let next = tokio::select! {
                    _ = self.cancel.cancelled() => return self.cancelled(),
                    next = self.producer.next_buffer() => next,
                };

                let Some(sample) = next else {
                    return self.producer_exhausted();
                };

                let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some(delegate) = &self.delegate {
                    delegate.did_read_buffer(self.track, &sample, count);
                }
                if !self.consumer.append(sample) {
                    self.producer.cancel();
                    let err = self.consumer.error().unwrap_or_else(|| {
                        Arc::new(anyhow!("track {} consumer refused sample {}", self.track, count))
                    });
                    return ChannelOutcome::Failed(err);
                }
            }
        }
    }

    fn producer_exhausted(&self) -> ChannelOutcome {
        if let Some(err) = self.producer.error() {
            self.consumer.cancel();
            return ChannelOutcome::Failed(err);
        }
        if self.cancel.is_cancelled() {
            return self.cancelled();
        }
        self.consumer.mark_finished();
        ChannelOutcome::Completed
    }

    fn cancelled(&self) -> ChannelOutcome {
        self.producer.cancel();
        self.consumer.cancel();
        ChannelOutcome::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{FormatDescription, MediaTime};
    use crate::pipeline::memory::{CollectingConsumer, VecProducer};
    use bytes::Bytes;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn samples(count: i64) -> Vec<SampleBuffer> {
        let format = Arc::new(FormatDescription::compressed(MediaKind::Audio, "aac"));
        (0..count)
            .map(|i| {
                SampleBuffer::compressed(
                    Bytes::from_static(b"\x21\x10"),
                    format.clone(),
                    MediaTime::new(i * 1024, 48000),
                    None,
                    MediaTime::new(1024, 48000),
                    true,
                )
            })
            .collect()
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(u32, i64, u64)>>,
    }

    impl ChannelDelegate for Recorder {
        fn did_read_buffer(&self, track: u32, sample: &SampleBuffer, count: u64) {
            self.seen
                .lock()
                .unwrap()
                .push((track, sample.pts().value, count));
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pumps_everything_in_order() {
        let producer = Arc::new(VecProducer::new(MediaKind::Audio, samples(25)));
        let consumer = CollectingConsumer::new();
        let channel = TrackChannel::new(2, producer, Arc::new(consumer.clone()));
        let recorder = Arc::new(Recorder::default());

        let (done_tx, done_rx) = oneshot::channel();
        let handle = channel
            .start(Some(recorder.clone()), move |report| {
                let _ = done_tx.send(report.count);
            })
            .unwrap();

        let report = handle.await.unwrap();
        assert_eq!(done_rx.await.unwrap(), 25);
        assert!(matches!(report.outcome, ChannelOutcome::Completed));
        assert_eq!(report.media_kind, MediaKind::Audio);
        assert!(channel.is_finished());
        assert_eq!(channel.count(), 25);
        assert!(consumer.is_finished());

        let pts: Vec<i64> = consumer.samples().iter().map(|s| s.pts().value).collect();
        assert_eq!(pts, (0..25).map(|i| i * 1024).collect::<Vec<_>>());
        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen.len(), 25);
        assert_eq!(seen[24], (2, 24 * 1024, 25));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancel_ends_blocked_channel() {
        let producer = Arc::new(
            VecProducer::new(MediaKind::Audio, samples(1000)).with_pace(Duration::from_millis(50)),
        );
        let consumer = CollectingConsumer::new();
        let channel = TrackChannel::new(1, producer, Arc::new(consumer.clone()));
        let completions = Arc::new(AtomicU64::new(0));
        let counter = completions.clone();
        let handle = channel
            .start(None, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        channel.cancel();
        let report = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("channel did not stop after cancel")
            .unwrap();

        assert!(matches!(report.outcome, ChannelOutcome::Cancelled));
        assert!(report.count < 1000);
        assert!(consumer.is_cancelled());
        assert!(!consumer.is_finished());
        assert_eq!(completions.load(Ordering::SeqCst), 1);
        assert!(channel.is_finished());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_producer_error_fails_channel() {
        let producer = Arc::new(VecProducer::new(MediaKind::Audio, samples(10)).with_failure_after(4));
        let consumer = CollectingConsumer::new();
        let channel = TrackChannel::new(3, producer, Arc::new(consumer.clone()));
        let report = channel.start(None, |_| {}).unwrap().await.unwrap();

        assert!(report.outcome.is_failed());
        assert_eq!(report.count, 4);
        assert!(consumer.is_cancelled());
        assert!(!consumer.is_finished());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_consumer_refusal_fails_channel() {
        let producer = Arc::new(VecProducer::new(MediaKind::Audio, samples(10)));
        let consumer = CollectingConsumer::rejecting_after(3);
        let channel = TrackChannel::new(4, producer.clone(), Arc::new(consumer.clone()));
        let report = channel.start(None, |_| {}).unwrap().await.unwrap();

        assert!(report.outcome.is_failed());
        assert_eq!(consumer.len(), 3);
        assert_eq!(producer.served(), 4);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_second_start_is_rejected() {
        let producer = Arc::new(VecProducer::new(MediaKind::Audio, Vec::new()));
        let channel = TrackChannel::new(5, producer, Arc::new(CollectingConsumer::new()));
        let first = channel.start(None, |_| {}).unwrap();
        assert!(channel.start(None, |_| {}).is_err());
        let report = first.await.unwrap();
        assert_eq!(report.count, 0);
        assert!(matches!(report.outcome, ChannelOutcome::Completed));
    }
}
