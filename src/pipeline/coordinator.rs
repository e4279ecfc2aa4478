//! Processing coordinator
//!
//! A `Processor` sits between the reader and the writer of one track. The
//! reader side feeds it through the consumer contract; every accepted sample
//! is processed on a dedicated serial input queue (convert, filter, encode,
//! convert back). The writer side drains results through the producer
//! contract on its own task, so a blocked writer never stalls the input queue
//! and vice versa.
//!
//! Cross-side state (flags, timestamps, the output queue) lives behind a
//! single mutex. The engine stages and the converter caches live behind a
//! second mutex that only the input queue takes.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ProcessorConfig;
use crate::convert::FrameConverter;
use crate::engine::{EngineFactory, EngineStatus, FrameFormat, FrameSlot};
use crate::error::{PipelineError, classify};
use crate::media::{
    ColorMetadata, FieldInfo, FormatDescription, MediaKind, MediaTime, Rational, SampleBuffer,
};
use crate::pipeline::encode_stage::EncodeStage;
use crate::pipeline::filter_stage::FilterStage;
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::io::{ReadyCallback, SampleConsumer, SampleProducer, drive_ready_callback};
use crate::pipeline::queue::SerialQueue;
use crate::pipeline::signals::{GapSignal, ReadySignal, RetryThrottle};
use crate::pipeline::state::{ReaderStatus, StageState, WriterStatus};

/// Readiness and end-of-stream flags of the two stages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StageFlags {
    pub filter_ready: bool,
    pub filter_eof: bool,
    pub encoder_ready: bool,
    pub encoder_eof: bool,
}

struct TrackState {
    failed: bool,
    error: Option<Arc<anyhow::Error>>,
    cancelled: bool,
    flags: StageFlags,
    /// Latest PTS accepted from the input side
    last_enqueued_pts: Option<MediaTime>,
    /// Latest PTS handed to the output side
    last_dequeued_pts: Option<MediaTime>,
    /// Accepted samples whose processing job has not finished yet
    in_flight: usize,
    output: VecDeque<SampleBuffer>,
    input_finished: bool,
    output_eof: bool,
    writer_status: WriterStatus,
    reader_status: ReaderStatus,
    accepted: u64,
    time_scale: Option<i32>,
    output_format: Option<Arc<FormatDescription>>,
}

impl TrackState {
    fn new() -> Self {
        Self {
            failed: false,
            error: None,
            cancelled: false,
            flags: StageFlags::default(),
            last_enqueued_pts: None,
            last_dequeued_pts: None,
            in_flight: 0,
            output: VecDeque::new(),
            input_finished: false,
            output_eof: false,
            writer_status: WriterStatus::Unknown,
            reader_status: ReaderStatus::Unknown,
            accepted: 0,
            time_scale: None,
            output_format: None,
        }
    }

    fn is_terminal(&self) -> bool {
        self.failed || self.cancelled
    }
}

/// State owned by the input queue
struct ProcessingCore {
    converter: FrameConverter,
    /// Reused input frame
    input: FrameSlot,
    filter: Option<FilterStage>,
    encoder: Option<EncodeStage>,
    /// Color captured from the first sample, reattached after filtering
    color: Option<ColorMetadata>,
    field: FieldInfo,
    /// Duration and aspect of the latest input frame, for filtered frames
    /// that come back without them
    frame_duration: i64,
    pixel_aspect: Option<Rational>,
    last_input_pts: Option<MediaTime>,
}

struct OutputLane {
    started: bool,
}

struct Shared {
    label: String,
    config: ProcessorConfig,
    factory: Arc<dyn EngineFactory>,
    state: Mutex<TrackState>,
    core: Mutex<ProcessingCore>,
    input_queue: SerialQueue,
    output_lane: tokio::sync::Mutex<OutputLane>,
    /// Wakes the output side: sample queued, EOF, failure
    output_ready: Notify,
    /// Wakes the input side: capacity freed, terminal state
    input_ready: Notify,
    filter_ready: Arc<ReadySignal>,
    encoder_ready: Arc<ReadySignal>,
    gaps: GapSignal,
    throttle: RetryThrottle,
    health: Arc<PipelineHealth>,
    cancel: CancellationToken,
}

/// Per-track processor implementing both the consumer and producer contracts.
///
/// Cheap to clone; clones share the same pipeline.
#[derive(Clone)]
pub struct Processor {
    shared: Arc<Shared>,
}

impl Processor {
    pub fn new(
        label: impl Into<String>,
        config: ProcessorConfig,
        factory: Arc<dyn EngineFactory>,
    ) -> Result<Self> {
        config.validate()?;
        let label = label.into();
        let health = Arc::new(PipelineHealth::new());
        let filter_ready = Arc::new(ReadySignal::new("filter"));
        let encoder_ready = Arc::new(ReadySignal::new("encoder"));

        let filter = config
            .filter
            .as_ref()
            .map(|f| FilterStage::new(f.clone(), filter_ready.clone(), health.clone()));
        let encoder = config
            .encoder
            .as_ref()
            .map(|e| EncodeStage::new(e.clone(), encoder_ready.clone(), health.clone()));
        let converter = match &config.encoder {
            Some(e) => FrameConverter::new().with_geometry(e.clean_aperture, e.pixel_aspect),
            None => FrameConverter::new(),
        };

        let input_queue = SerialQueue::new(format!("trackflow.input.{label}"))?;
        let throttle = RetryThrottle::new(config.again_retry_limit, config.again_retry_delay());

        info!(
            "Processor[{}]: created (filter: {:?}, encoder: {:?})",
            label,
            config.filter,
            config.encoder.as_ref().map(|e| e.codec.as_str())
        );

        Ok(Self {
            shared: Arc::new(Shared {
                label,
                factory,
                state: Mutex::new(TrackState::new()),
                core: Mutex::new(ProcessingCore {
                    converter,
                    input: FrameSlot::new(),
                    filter,
                    encoder,
                    color: None,
                    field: FieldInfo::PROGRESSIVE,
                    frame_duration: 0,
                    pixel_aspect: None,
                    last_input_pts: None,
                }),
                input_queue,
                output_lane: tokio::sync::Mutex::new(OutputLane { started: false }),
                output_ready: Notify::new(),
                input_ready: Notify::new(),
                filter_ready,
                encoder_ready,
                gaps: GapSignal::new(),
                throttle,
                health,
                cancel: CancellationToken::new(),
                config,
            }),
        })
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.shared.config
    }

    pub fn health(&self) -> Arc<PipelineHealth> {
        self.shared.health.clone()
    }

    pub fn is_failed(&self) -> bool {
        self.shared.lock_state().failed
    }

    pub fn writer_status(&self) -> WriterStatus {
        self.shared.lock_state().writer_status
    }

    pub fn reader_status(&self) -> ReaderStatus {
        self.shared.lock_state().reader_status
    }

    pub fn stage_flags(&self) -> StageFlags {
        self.shared.lock_state().flags
    }

    pub fn last_enqueued_pts(&self) -> Option<MediaTime> {
        self.shared.lock_state().last_enqueued_pts
    }

    pub fn last_dequeued_pts(&self) -> Option<MediaTime> {
        self.shared.lock_state().last_dequeued_pts
    }

    /// Time scale of engine timestamps, known once the first sample arrived
    pub fn media_time_scale(&self) -> Option<i32> {
        self.shared.lock_state().time_scale
    }

    /// Format description of the samples produced so far
    pub fn output_format(&self) -> Option<Arc<FormatDescription>> {
        self.shared.lock_state().output_format.clone()
    }

    /// Display size of the encoded output (declared size times pixel aspect)
    pub fn natural_size(&self) -> Option<(f64, f64)> {
        self.shared
            .config
            .encoder
            .as_ref()
            .and_then(|e| e.natural_size())
    }

    /// Wait until every configured stage has opened; false if one never will
    pub async fn wait_until_ready(&self) -> bool {
        let shared = &self.shared;
        if shared.config.filter.is_some() && !shared.filter_ready.wait().await {
            return false;
        }
        if shared.config.encoder.is_some() && !shared.encoder_ready.wait().await {
            return false;
        }
        !self.is_failed()
    }
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, TrackState> {
        // a panicking job must not take the other side down with it
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_core(&self) -> MutexGuard<'_, ProcessingCore> {
        self.core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_ready_for_more(&self) -> bool {
        let state = self.lock_state();
        !state.is_terminal()
            && !state.input_finished
            && state.in_flight + state.output.len() < self.config.max_queued_input
    }

    /// Record a failure; every later contract call becomes a no-op.
    /// Errors surfacing after a cancel are not failures.
    fn fail(&self, err: anyhow::Error) {
        {
            let mut state = self.lock_state();
            if state.failed {
                return;
            }
            if state.cancelled {
                debug!("Processor[{}]: ignoring error after cancel: {:#}", self.label, err);
                return;
            }
            error!("Processor[{}]: failed: {:#}", self.label, err);
            state.failed = true;
            state.error = Some(Arc::new(err));
            state.writer_status = WriterStatus::Failed;
            state.reader_status = ReaderStatus::Failed;
            for _ in 0..state.output.len() + state.in_flight {
                self.health.record_drop();
            }
            state.output.clear();
        }
        self.filter_ready.close();
        self.encoder_ready.close();
        self.throttle.wake();
        self.output_ready.notify_one();
        self.input_ready.notify_waiters();
    }

    /// Queue a produced sample for the output side
    fn deliver(&self, sample: SampleBuffer) {
        let mut state = self.lock_state();
        if state.is_terminal() {
            self.health.record_drop();
            return;
        }
        self.health.record_output(sample.size(), sample.is_sync());
        if state
            .output_format
            .as_ref()
            .is_none_or(|f| !Arc::ptr_eq(f, sample.format()))
        {
            state.output_format = Some(sample.format().clone());
        }
        state.output.push_back(sample);
        drop(state);
        self.output_ready.notify_one();
    }

    fn set_flags(&self, flags: StageFlags) {
        self.lock_state().flags = flags;
    }

    /// Processing job for one accepted sample (input queue)
    fn process(&self, sample: SampleBuffer) {
        let terminal = self.lock_state().is_terminal();
        let result = if terminal {
            self.health.record_drop();
            Ok(())
        } else {
            let mut core = self.lock_core();
            let result = core.accept(self, sample);
            let flags = core.flags();
            drop(core);
            self.set_flags(flags);
            result
        };

        self.lock_state().in_flight -= 1;
        if let Err(e) = result {
            self.fail_unless_cancelled(e);
        }
        self.input_ready.notify_waiters();
    }

    fn fail_unless_cancelled(&self, err: anyhow::Error) {
        if matches!(classify(&err), Some(PipelineError::Cancelled)) {
            debug!("Processor[{}]: stopped by cancel", self.label);
        } else {
            self.fail(err);
        }
    }

    /// End-of-stream job (input queue): flush both stages, then mark output EOF
    fn finish(&self) {
        if self.lock_state().is_terminal() {
            return;
        }
        let mut core = self.lock_core();
        let result = core.drain_all(self);
        let flags = core.flags();
        drop(core);
        self.set_flags(flags);

        if let Err(e) = result {
            self.fail_unless_cancelled(e);
            return;
        }

        {
            let mut state = self.lock_state();
            if state.is_terminal() {
                return;
            }
            state.output_eof = true;
            state.writer_status = WriterStatus::Completed;
        }
        info!("Processor[{}]: end of stream. {}", self.label, self.health.summary());
        self.output_ready.notify_one();
        self.input_ready.notify_waiters();
    }
}

impl ProcessingCore {
    fn flags(&self) -> StageFlags {
        StageFlags {
            filter_ready: self.filter.as_ref().is_some_and(|f| f.is_ready()),
            filter_eof: self.filter.as_ref().is_some_and(|f| f.is_eof()),
            encoder_ready: self.encoder.as_ref().is_some_and(|e| e.is_ready()),
            encoder_eof: self.encoder.as_ref().is_some_and(|e| e.is_eof()),
        }
    }

    fn detect_gap(&mut self, shared: &Shared, sample: &SampleBuffer) {
        let pts = sample.pts();
        if let Some(previous) = self.last_input_pts {
            let step = pts.seconds() - previous.seconds();
            let duration = sample.duration().seconds();
            if duration > 0.0 && step > duration * shared.config.gap_tolerance {
                warn!(
                    "Processor[{}]: timestamp gap of {:.3}s before {}",
                    shared.label, step, pts
                );
                shared.gaps.mark();
                shared.health.record_gap();
            }
        }
        self.last_input_pts = Some(pts);
    }

    /// Convert, filter and encode one sample, delivering whatever comes out
    fn accept(&mut self, shared: &Shared, sample: SampleBuffer) -> Result<()> {
        self.detect_gap(shared, &sample);

        if sample.image_buffer().is_none() {
            if self.filter.is_none() && self.encoder.is_none() {
                shared.deliver(sample);
                return Ok(());
            }
            return Err(PipelineError::Unsupported(
                "compressed samples cannot be filtered or encoded".into(),
            )
            .into());
        }

        let time_scale = shared
            .lock_state()
            .time_scale
            .unwrap_or(sample.pts().timescale);
        self.converter
            .sample_to_frame(&sample, &mut self.input, time_scale)?;
        drop(sample);

        if self.color.is_none()
            && let Some(frame) = self.input.lend()
        {
            self.color = Some(frame.color);
            self.field = frame.field;
            debug!("Processor[{}]: cached color {:?}", shared.label, frame.color);
        }
        if let Some(frame) = self.input.lend() {
            self.frame_duration = frame.duration;
            self.pixel_aspect = frame.pixel_aspect;
        }

        if self.filter.is_some() {
            self.filter_input(shared)
        } else if let Some(encoder) = self.encoder.as_mut() {
            encode_slot(
                shared,
                encoder,
                &mut self.input,
                &mut self.converter,
                self.color.unwrap_or_default(),
                self.field,
            )
        } else {
            let result = match self.input.lend() {
                Some(frame) => self.converter.frame_to_sample(frame, self.color),
                None => Err(anyhow!(PipelineError::Conversion("input frame missing".into()))),
            };
            self.input.release();
            shared.deliver(result?);
            Ok(())
        }
    }

    fn filter_input(&mut self, shared: &Shared) -> Result<()> {
        let (Some(filter), Some(frame)) = (self.filter.as_mut(), self.input.lend()) else {
            return Err(PipelineError::Conversion("input frame missing".into()).into());
        };
        filter.prepare(shared.factory.as_ref(), &FrameFormat::of(frame))?;

        let mut attempt = 0;
        loop {
            let status = match (self.filter.as_mut(), self.input.lend()) {
                (Some(filter), Some(frame)) => filter.push(frame),
                _ => Err(anyhow!(PipelineError::Conversion("input frame missing".into()))),
            };
            match status {
                Ok(EngineStatus::Done) => break,
                Ok(EngineStatus::Again) => {
                    // graph is full: drain it before pushing again
                    shared.health.record_again();
                    self.drain_filter(shared, false)?;
                    let retry = !shared.cancel.is_cancelled() && shared.throttle.backoff(attempt);
                    if shared.cancel.is_cancelled() {
                        self.input.release();
                        return Err(PipelineError::Cancelled.into());
                    }
                    if !retry {
                        self.input.release();
                        return Err(PipelineError::stage(
                            "FilterStage",
                            format!("graph refused input {} times", attempt + 1),
                        )
                        .into());
                    }
                    attempt += 1;
                }
                Ok(EngineStatus::EndOfStream) => {
                    self.input.release();
                    return Err(PipelineError::stage("FilterStage", "push after end of stream").into());
                }
                Err(e) => {
                    self.input.release();
                    return Err(e);
                }
            }
        }
        // pushing borrowed the frame; our reference is dropped here
        self.input.release();
        self.drain_filter(shared, false)
    }

    /// Pull every filtered frame currently available and pass it on.
    ///
    /// While draining after end of stream, "try again" is retried under the
    /// throttle and then treated as the end.
    fn drain_filter(&mut self, shared: &Shared, draining: bool) -> Result<()> {
        let mut attempt = 0;
        loop {
            let Some(filter) = self.filter.as_mut() else {
                return Ok(());
            };
            match filter.pull()? {
                EngineStatus::Done => {
                    let slot = filter.filtered_mut();
                    if let Some(frame) = slot.get_mut() {
                        if let Some(color) = self.color {
                            frame.color = color;
                        }
                        if frame.field == FieldInfo::PROGRESSIVE {
                            frame.field = self.field;
                        }
                        if frame.duration == 0 {
                            frame.duration = self.frame_duration;
                        }
                        if frame.pixel_aspect.is_none() {
                            frame.pixel_aspect = self.pixel_aspect;
                        }
                    }
                    match self.encoder.as_mut() {
                        Some(encoder) => encode_slot(
                            shared,
                            encoder,
                            slot,
                            &mut self.converter,
                            self.color.unwrap_or_default(),
                            self.field,
                        )?,
                        None => {
                            let result = match slot.lend() {
                                Some(frame) => self.converter.frame_to_sample(frame, self.color),
                                None => Err(anyhow!(PipelineError::Conversion(
                                    "filtered frame missing".into()
                                ))),
                            };
                            slot.release();
                            shared.deliver(result?);
                        }
                    }
                }
                EngineStatus::Again if draining => {
                    let retry = !shared.cancel.is_cancelled() && shared.throttle.backoff(attempt);
                    if shared.cancel.is_cancelled() {
                        return Ok(());
                    }
                    if !retry {
                        warn!(
                            "Processor[{}]: filter graph did not reach end of stream, giving up",
                            shared.label
                        );
                        return Ok(());
                    }
                    attempt += 1;
                }
                EngineStatus::Again | EngineStatus::EndOfStream => return Ok(()),
            }
        }
    }

    /// Flush the filter through the encoder, then flush the encoder
    fn drain_all(&mut self, shared: &Shared) -> Result<()> {
        if let Some(filter) = self.filter.as_mut() {
            filter.push_eof()?;
            self.drain_filter(shared, true)?;
        }

        if let Some(encoder) = self.encoder.as_mut() {
            encoder.flush()?;
            let color = self.color.unwrap_or_default();
            let mut attempt = 0;
            loop {
                drain_encoder(shared, encoder, &mut self.converter, color, self.field)?;
                if encoder.is_eof() {
                    break;
                }
                let retry = !shared.cancel.is_cancelled() && shared.throttle.backoff(attempt);
                if shared.cancel.is_cancelled() {
                    break;
                }
                if !retry {
                    warn!(
                        "Processor[{}]: encoder did not reach end of stream, giving up",
                        shared.label
                    );
                    break;
                }
                attempt += 1;
            }
        }
        Ok(())
    }
}

/// Send the frame in `slot` to the encoder, draining packets while it
/// refuses input, then drain whatever became available.
fn encode_slot(
    shared: &Shared,
    encoder: &mut EncodeStage,
    slot: &mut FrameSlot,
    converter: &mut FrameConverter,
    color: ColorMetadata,
    field: FieldInfo,
) -> Result<()> {
    let Some(frame) = slot.lend() else {
        return Err(PipelineError::Conversion("frame to encode missing".into()).into());
    };
    encoder.prepare(shared.factory.as_ref(), &FrameFormat::of(frame))?;

    let mut attempt = 0;
    loop {
        match encoder.send(slot) {
            Ok(EngineStatus::Done) => break,
            Ok(EngineStatus::Again) => {
                shared.health.record_again();
                let drained = drain_encoder(shared, encoder, converter, color, field)?;
                if drained > 0 {
                    continue;
                }
                let retry = !shared.cancel.is_cancelled() && shared.throttle.backoff(attempt);
                if shared.cancel.is_cancelled() {
                    slot.release();
                    return Err(PipelineError::Cancelled.into());
                }
                if !retry {
                    slot.release();
                    return Err(PipelineError::stage(
                        "EncodeStage",
                        format!("encoder refused input {} times", attempt + 1),
                    )
                    .into());
                }
                attempt += 1;
            }
            Ok(EngineStatus::EndOfStream) => {
                slot.release();
                return Err(PipelineError::stage("EncodeStage", "send after flush").into());
            }
            Err(e) => {
                slot.release();
                return Err(e);
            }
        }
    }
    drain_encoder(shared, encoder, converter, color, field)?;
    Ok(())
}

/// Receive packets until the encoder wants more input or is exhausted
fn drain_encoder(
    shared: &Shared,
    encoder: &mut EncodeStage,
    converter: &mut FrameConverter,
    color: ColorMetadata,
    field: FieldInfo,
) -> Result<usize> {
    let mut drained = 0;
    loop {
        match encoder.receive()? {
            EngineStatus::Done => {
                let Some(info) = encoder.info() else {
                    return Err(PipelineError::stage("EncodeStage", "encoder info missing").into());
                };
                let sample = converter.packet_to_sample(encoder.packet(), info, color, field)?;
                shared.deliver(sample);
                drained += 1;
            }
            EngineStatus::Again | EngineStatus::EndOfStream => return Ok(drained),
        }
    }
}

#[async_trait]
impl SampleConsumer for Processor {
    fn append(&self, sample: SampleBuffer) -> bool {
        let shared = &self.shared;
        {
            let mut state = shared.lock_state();
            if state.is_terminal() || state.input_finished {
                debug!("Processor[{}]: append refused", shared.label);
                return false;
            }
            state.in_flight += 1;
            state.accepted += 1;
            state.writer_status = WriterStatus::Writing;
            let pts = sample.pts();
            if state.last_enqueued_pts.is_none_or(|last| pts > last) {
                state.last_enqueued_pts = Some(pts);
            }
            if state.time_scale.is_none() {
                let scale = shared.config.media_time_scale.unwrap_or(pts.timescale);
                state.time_scale = Some(if scale > 0 { scale } else { 600 });
            }
        }
        shared.health.record_input();

        let job_shared = shared.clone();
        if !shared
            .input_queue
            .dispatch(move || job_shared.process(sample))
        {
            shared.lock_state().in_flight -= 1;
            shared.fail(anyhow!(PipelineError::stage("Processor", "input queue stopped")));
            return false;
        }
        shared.input_ready.notify_waiters();
        true
    }

    fn is_ready_for_more(&self) -> bool {
        self.shared.is_ready_for_more()
    }

    fn mark_finished(&self) {
        let shared = &self.shared;
        {
            let mut state = shared.lock_state();
            if state.input_finished {
                return;
            }
            state.input_finished = true;
        }
        debug!("Processor[{}]: input finished", shared.label);
        let job_shared = shared.clone();
        if !shared.input_queue.dispatch(move || job_shared.finish()) {
            shared.fail(anyhow!(PipelineError::stage("Processor", "input queue stopped")));
        }
        shared.input_ready.notify_waiters();
    }

    async fn wait_ready(&self) -> bool {
        let shared = &self.shared;
        loop {
            let notified = shared.input_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = shared.lock_state();
                if state.is_terminal() || state.input_finished {
                    return false;
                }
            }
            if shared.is_ready_for_more() {
                return true;
            }

            tokio::select! {
                _ = notified => {}
                _ = shared.cancel.cancelled() => return false,
            }
        }
    }

    async fn ready_changed(&self) {
        let shared = &self.shared;
        let notified = shared.input_ready.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if !shared.is_ready_for_more() {
            return;
        }
        tokio::select! {
            _ = notified => {}
            _ = shared.cancel.cancelled() => {}
        }
    }

    fn request_data_when_ready(&self, handle: &Handle, callback: ReadyCallback) -> JoinHandle<()> {
        drive_ready_callback(Arc::new(self.clone()), handle, callback)
    }

    fn cancel(&self) {
        let shared = &self.shared;
        {
            let mut state = shared.lock_state();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            if state.writer_status != WriterStatus::Completed && !state.failed {
                state.writer_status = WriterStatus::Cancelled;
            }
            if state.reader_status != ReaderStatus::Completed && !state.failed {
                state.reader_status = ReaderStatus::Cancelled;
            }
            state.output.clear();
        }
        info!("Processor[{}]: cancelled", shared.label);
        shared.cancel.cancel();
        shared.throttle.wake();
        shared.filter_ready.close();
        shared.encoder_ready.close();
        shared.output_ready.notify_one();
        shared.input_ready.notify_waiters();
    }

    fn error(&self) -> Option<Arc<anyhow::Error>> {
        self.shared.lock_state().error.clone()
    }
}

#[async_trait]
impl SampleProducer for Processor {
    async fn next_buffer(&self) -> Option<SampleBuffer> {
        let shared = &self.shared;
        let mut lane = shared.output_lane.lock().await;

        if !lane.started {
            lane.started = true;
            {
                let mut state = shared.lock_state();
                if state.reader_status == ReaderStatus::Unknown {
                    state.reader_status = ReaderStatus::Reading;
                }
            }
            let delay = shared.config.initial_delay();
            if !delay.is_zero() {
                debug!("Processor[{}]: delaying first output by {:?}", shared.label, delay);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shared.cancel.cancelled() => {}
                }
            }
        }

        let mut stall_reported = false;
        loop {
            let notified = shared.output_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = shared.lock_state();
                if state.cancelled {
                    return None;
                }
                if state.failed {
                    state.reader_status = ReaderStatus::Failed;
                    return None;
                }
                if let Some(sample) = state.output.pop_front() {
                    let pts = sample.pts();
                    if let Some(enqueued) = state.last_enqueued_pts
                        && pts > enqueued
                    {
                        warn!(
                            "Processor[{}]: dequeued PTS {} ahead of enqueued {}",
                            shared.label, pts, enqueued
                        );
                    }
                    if state.last_dequeued_pts.is_none_or(|last| pts > last) {
                        state.last_dequeued_pts = Some(pts);
                    }
                    drop(state);
                    shared.input_ready.notify_waiters();
                    return Some(sample);
                }
                if state.output_eof {
                    state.reader_status = ReaderStatus::Completed;
                    return None;
                }
            }

            match shared.config.stall_watch() {
                Some(interval) => tokio::select! {
                    _ = notified => {}
                    _ = shared.cancel.cancelled() => {}
                    _ = tokio::time::sleep(interval) => {
                        if shared.gaps.try_consume() {
                            debug!("Processor[{}]: output wait explained by timestamp gap", shared.label);
                        } else if !stall_reported {
                            stall_reported = true;
                            warn!("Processor[{}]: no output for {:?}", shared.label, interval);
                        }
                    }
                },
                None => tokio::select! {
                    _ = notified => {}
                    _ = shared.cancel.cancelled() => {}
                },
            }
        }
    }

    fn media_kind(&self) -> MediaKind {
        MediaKind::Video
    }

    fn cancel(&self) {
        SampleConsumer::cancel(self);
    }

    fn error(&self) -> Option<Arc<anyhow::Error>> {
        SampleConsumer::error(self)
    }
}

impl Processor {
    /// Stage states, for diagnostics (waits for the input queue to be idle)
    pub async fn stage_states(&self) -> (Option<StageState>, Option<StageState>) {
        let shared = self.shared.clone();
        self.shared
            .input_queue
            .run(move || {
                let core = shared.lock_core();
                (
                    core.filter.as_ref().map(|f| f.state()),
                    core.encoder.as_ref().map(|e| e.state()),
                )
            })
            .await
            .unwrap_or((None, None))
    }
}
