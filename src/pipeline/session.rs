//! Pipeline driver
//!
//! Wires one or two track channels per track (reader → writer directly, or
//! reader → processor → writer), runs them concurrently and folds their
//! outcomes into one report. The first failure cancels every other channel.

use anyhow::{Result, anyhow};
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use log::{error, info, warn};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::pipeline::channel::{ChannelDelegate, ChannelOutcome, ChannelReport, TrackChannel};
use crate::pipeline::coordinator::Processor;
use crate::pipeline::health::HealthSummary;
use crate::pipeline::io::{SampleConsumer, SampleProducer};
use crate::pipeline::state::{ReaderStatus, WriterStatus};

/// Which leg of a track a channel drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelRole {
    /// Reader straight into the writer
    Passthrough,
    /// Reader into a processor
    Input,
    /// Processor into the writer
    Output,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackReport {
    pub role: ChannelRole,
    #[serde(flatten)]
    pub channel: ChannelReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessorReport {
    pub label: String,
    pub writer_status: WriterStatus,
    pub reader_status: ReaderStatus,
    pub failed: bool,
    pub health: HealthSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub tracks: Vec<TrackReport>,
    pub processors: Vec<ProcessorReport>,
    pub cancelled: bool,
}

impl SessionReport {
    /// Samples that reached the writer on `track`
    pub fn written(&self, track: u32) -> u64 {
        self.tracks
            .iter()
            .filter(|t| t.channel.track == track && t.role != ChannelRole::Input)
            .map(|t| t.channel.count)
            .sum()
    }
}

struct Wiring {
    role: ChannelRole,
    channel: Arc<TrackChannel>,
}

#[derive(Default)]
pub struct Session {
    wiring: Vec<Wiring>,
    processors: Vec<Processor>,
    progress: Option<Arc<dyn ChannelDelegate>>,
    cancel: CancellationToken,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report every sample reaching a writer to `delegate`
    pub fn with_progress(mut self, delegate: Arc<dyn ChannelDelegate>) -> Self {
        self.progress = Some(delegate);
        self
    }

    /// Token that cancels the whole session when triggered
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn track_count(&self) -> usize {
        self.wiring.len()
    }

    pub fn add_passthrough(
        &mut self,
        track: u32,
        producer: Arc<dyn SampleProducer>,
        consumer: Arc<dyn SampleConsumer>,
    ) {
        self.wiring.push(Wiring {
            role: ChannelRole::Passthrough,
            channel: Arc::new(TrackChannel::new(track, producer, consumer)),
        });
    }

    pub fn add_processed(
        &mut self,
        track: u32,
        producer: Arc<dyn SampleProducer>,
        processor: Processor,
        consumer: Arc<dyn SampleConsumer>,
    ) {
        let shared = Arc::new(processor.clone());
        self.wiring.push(Wiring {
            role: ChannelRole::Input,
            channel: Arc::new(TrackChannel::new(track, producer, shared.clone())),
        });
        self.wiring.push(Wiring {
            role: ChannelRole::Output,
            channel: Arc::new(TrackChannel::new(track, shared, consumer)),
        });
        self.processors.push(processor);
    }

    /// Run every channel to completion.
    ///
    /// Returns the report when all tracks completed or the session was
    /// cancelled; the first channel failure becomes the error.
    pub async fn run(self) -> Result<SessionReport> {
        let Session {
            wiring,
            processors,
            progress,
            cancel,
        } = self;

        let mut pending = FuturesUnordered::new();
        for (index, wire) in wiring.iter().enumerate() {
            let delegate = match wire.role {
                ChannelRole::Input => None,
                _ => progress.clone(),
            };
            let handle = wire.channel.start(delegate, |_| {})?;
            pending.push(async move { (index, handle.await) });
        }
        info!("Session: running {} channels", wiring.len());

        let cancel_all = || {
            for wire in &wiring {
                wire.channel.cancel();
            }
        };

        let mut reports: Vec<Option<ChannelReport>> = vec![None; wiring.len()];
        let mut first_failure: Option<(u32, Arc<anyhow::Error>)> = None;
        let mut cancelled = false;

        loop {
            let next = if cancelled || first_failure.is_some() {
                pending.next().await
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        warn!("Session: cancelled");
                        cancelled = true;
                        cancel_all();
                        continue;
                    }
                    next = pending.next() => next,
                }
            };
            let Some((index, joined)) = next else {
                break;
            };

            let report = match joined {
                Ok(report) => report,
                Err(e) => {
                    let track = wiring[index].channel.track();
                    error!("Session: track {} channel panicked: {}", track, e);
                    ChannelReport {
                        track,
                        media_kind: wiring[index].channel.media_kind(),
                        count: wiring[index].channel.count(),
                        outcome: ChannelOutcome::Failed(Arc::new(anyhow!("channel task failed: {e}"))),
                    }
                }
            };
            if let ChannelOutcome::Failed(err) = &report.outcome
                && first_failure.is_none()
            {
                first_failure = Some((report.track, err.clone()));
                cancel_all();
            }
            reports[index] = Some(report);
        }

        let processors: Vec<ProcessorReport> = processors
            .iter()
            .map(|p| ProcessorReport {
                label: p.label().to_string(),
                writer_status: p.writer_status(),
                reader_status: p.reader_status(),
                failed: p.is_failed(),
                health: p.health().summary(),
            })
            .collect();

        if let Some((track, err)) = first_failure {
            error!("Session: track {} failed: {:#}", track, err);
            return Err(anyhow!("track {} failed: {:#}", track, err));
        }

        let tracks = wiring
            .iter()
            .zip(reports)
            .filter_map(|(wire, report)| {
                report.map(|channel| TrackReport {
                    role: wire.role,
                    channel,
                })
            })
            .collect();
        info!("Session: finished{}", if cancelled { " (cancelled)" } else { "" });
        Ok(SessionReport {
            tracks,
            processors,
            cancelled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProcessorConfig, VideoEncoderConfig};
    use crate::engine::testing::MockEngines;
    use crate::media::{FormatDescription, MediaKind, MediaTime, PixelBuffer, PixelFormat, SampleBuffer};
    use crate::pipeline::memory::{CollectingConsumer, VecProducer};
    use crate::pipeline::progress::{ProgressInfo, ProgressReporter};
    use bytes::Bytes;
    use std::sync::Mutex;
    use std::time::Duration;

    fn video(count: i64) -> Vec<SampleBuffer> {
        let format = Arc::new(FormatDescription::raw_video(PixelFormat::Nv12, 16, 8));
        (0..count)
            .map(|i| {
                SampleBuffer::image(
                    Arc::new(PixelBuffer::new(PixelFormat::Nv12, 16, 8)),
                    format.clone(),
                    MediaTime::new(i * 1001, 30000),
                    MediaTime::new(1001, 30000),
                )
            })
            .collect()
    }

    fn audio(count: i64) -> Vec<SampleBuffer> {
        let format = Arc::new(FormatDescription::compressed(MediaKind::Audio, "aac"));
        (0..count)
            .map(|i| {
                SampleBuffer::compressed(
                    Bytes::from_static(b"\xff\xf1"),
                    format.clone(),
                    MediaTime::new(i * 1024, 48000),
                    None,
                    MediaTime::new(1024, 48000),
                    true,
                )
            })
            .collect()
    }

    fn encoding_processor(engines: MockEngines) -> Processor {
        let config = ProcessorConfig {
            filter: Some("yadif".into()),
            encoder: Some(VideoEncoderConfig::new("libx264")),
            ..Default::default()
        };
        Processor::new("video", config, Arc::new(engines)).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_processed_and_passthrough_tracks() {
        let engines = MockEngines {
            filter_lookahead: 1,
            encoder_delay: 3,
            ..Default::default()
        };
        let processor = encoding_processor(engines);
        let video_out = CollectingConsumer::new();
        let audio_out = CollectingConsumer::new();

        let progress = Arc::new(Mutex::new(Vec::<ProgressInfo>::new()));
        let sink = progress.clone();
        let reporter = ProgressReporter::new(
            MediaTime::new(0, 30000),
            MediaTime::new(60 * 1001, 30000),
            Box::new(move |info| sink.lock().unwrap().push(info)),
        );

        let mut session = Session::new().with_progress(Arc::new(reporter));
        session.add_processed(
            1,
            Arc::new(VecProducer::new(MediaKind::Video, video(60))),
            processor,
            Arc::new(video_out.clone()),
        );
        session.add_passthrough(
            2,
            Arc::new(VecProducer::new(MediaKind::Audio, audio(90))),
            Arc::new(audio_out.clone()),
        );
        assert_eq!(session.track_count(), 3);

        let report = session.run().await.unwrap();
        assert!(!report.cancelled);
        assert_eq!(report.written(1), 60);
        assert_eq!(report.written(2), 90);
        assert_eq!(video_out.len(), 60);
        assert_eq!(audio_out.len(), 90);
        assert!(video_out.is_finished() && audio_out.is_finished());

        let processor = &report.processors[0];
        assert_eq!(processor.writer_status, WriterStatus::Completed);
        assert_eq!(processor.reader_status, ReaderStatus::Completed);
        assert!(!processor.failed);
        assert_eq!(processor.health.frames_out, 60);

        let progress = progress.lock().unwrap();
        assert_eq!(progress.len(), 150);
        assert!(progress.iter().any(|p| p.tag == "libx264"));
        assert!(progress.iter().any(|p| p.tag == "aac"));
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"role\":\"output\""));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_processor_failure_fails_session() {
        let engines = MockEngines {
            fail_after_packets: Some(5),
            ..Default::default()
        };
        let processor = encoding_processor(engines);
        let audio_out = CollectingConsumer::new();

        let mut session = Session::new();
        session.add_processed(
            1,
            Arc::new(VecProducer::new(MediaKind::Video, video(40))),
            processor.clone(),
            Arc::new(CollectingConsumer::new()),
        );
        session.add_passthrough(
            2,
            Arc::new(
                VecProducer::new(MediaKind::Audio, audio(10_000)).with_pace(Duration::from_millis(5)),
            ),
            Arc::new(audio_out.clone()),
        );

        let err = tokio::time::timeout(Duration::from_secs(10), session.run())
            .await
            .expect("session did not stop after failure")
            .unwrap_err();
        assert!(format!("{err:#}").contains("track 1"));
        assert!(processor.is_failed());
        assert!(audio_out.len() < 10_000);
        assert!(audio_out.is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_external_cancel() {
        let mut session = Session::new();
        let out = CollectingConsumer::new();
        session.add_passthrough(
            1,
            Arc::new(VecProducer::new(MediaKind::Audio, audio(1000)).with_pace(Duration::from_millis(10))),
            Arc::new(out.clone()),
        );
        let token = session.cancel_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            token.cancel();
        });

        let report = session.run().await.unwrap();
        assert!(report.cancelled);
        assert!(matches!(report.tracks[0].channel.outcome, ChannelOutcome::Cancelled));
        assert!(out.len() < 1000);
    }

    fn assert_cancelled(report: &SessionReport) {
        assert!(report.cancelled);
        assert_eq!(report.tracks.len(), 2);
        for track in &report.tracks {
            assert!(
                matches!(track.channel.outcome, ChannelOutcome::Cancelled),
                "{:?} channel ended {}",
                track.role,
                track.channel.outcome.as_str()
            );
        }
        let processor = &report.processors[0];
        assert!(!processor.failed);
        assert_eq!(processor.writer_status, WriterStatus::Cancelled);
        assert_eq!(processor.reader_status, ReaderStatus::Cancelled);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancel_processed_track_mid_stream() {
        let engines = MockEngines {
            filter_lookahead: 1,
            encoder_delay: 3,
            ..Default::default()
        };
        let out = CollectingConsumer::new();
        let mut session = Session::new();
        session.add_processed(
            1,
            Arc::new(VecProducer::new(MediaKind::Video, video(1000)).with_pace(Duration::from_millis(5))),
            encoding_processor(engines),
            Arc::new(out.clone()),
        );
        let token = session.cancel_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(80)).await;
            token.cancel();
        });

        let report = tokio::time::timeout(Duration::from_secs(5), session.run())
            .await
            .expect("session did not stop after cancel")
            .unwrap();
        assert_cancelled(&report);
        assert!(report.written(1) < 1000);
        assert!(out.is_cancelled());
        assert!(!out.is_finished());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancel_while_encoder_refuses_input() {
        let engines = MockEngines {
            stubborn_again: true,
            ..Default::default()
        };
        let config = ProcessorConfig {
            encoder: Some(VideoEncoderConfig::new("libx264")),
            again_retry_limit: 1000,
            again_retry_delay_ms: 20,
            ..Default::default()
        };
        let processor = Processor::new("video", config, Arc::new(engines)).unwrap();
        let mut session = Session::new();
        session.add_processed(
            1,
            Arc::new(VecProducer::new(MediaKind::Video, video(100)).with_pace(Duration::from_millis(1))),
            processor.clone(),
            Arc::new(CollectingConsumer::new()),
        );
        let token = session.cancel_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel();
        });

        let report = tokio::time::timeout(Duration::from_secs(5), session.run())
            .await
            .expect("session did not stop after cancel")
            .unwrap();
        assert_cancelled(&report);
        assert_eq!(report.written(1), 0);
        assert!(report.processors[0].health.again_retries >= 1);
        assert!(SampleConsumer::error(&processor).is_none());
    }
}
