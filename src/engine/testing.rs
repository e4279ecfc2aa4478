//! Scripted engines for exercising the pipeline without FFmpeg

use anyhow::{Result, bail};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{
    EncoderEngine, EncoderInfo, EngineFactory, EngineFrame, EnginePacket, EngineStatus,
    FilterEngine, FrameFormat, FrameSlot,
};
use crate::config::VideoEncoderConfig;
use crate::error::PipelineError;
use crate::media::ColorMetadata;

#[derive(Debug, Clone, Default)]
pub struct MockEngines {
    /// Frames the filter holds back before emitting
    pub filter_lookahead: usize,
    /// Filter drops color metadata like many real graphs do
    pub filter_strips_color: bool,
    /// Filter output carries no duration or pixel aspect
    pub filter_strips_timing: bool,
    /// Frames the encoder holds back before emitting packets
    pub encoder_delay: usize,
    /// Encoder refuses input with `Again` once this many frames are pending (0 = unbounded)
    pub encoder_capacity: usize,
    /// Encoder refuses every frame
    pub stubborn_again: bool,
    pub fail_open_filter: bool,
    pub fail_open_encoder: bool,
    /// Encoder errors after emitting this many packets
    pub fail_after_packets: Option<usize>,
    pub filters_opened: Arc<AtomicUsize>,
    pub encoders_opened: Arc<AtomicUsize>,
}

impl EngineFactory for MockEngines {
    fn open_filter(&self, description: &str, input: &FrameFormat) -> Result<Box<dyn FilterEngine>> {
        if self.fail_open_filter {
            bail!(PipelineError::stage_open("FilterStage", format!("cannot parse '{description}'")));
        }
        self.filters_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockFilter {
            lookahead: self.filter_lookahead,
            strips_color: self.filter_strips_color,
            strips_timing: self.filter_strips_timing,
            format: *input,
            held: VecDeque::new(),
            eof: false,
        }))
    }

    fn open_encoder(
        &self,
        config: &VideoEncoderConfig,
        input: &FrameFormat,
    ) -> Result<Box<dyn EncoderEngine>> {
        if self.fail_open_encoder {
            bail!(PipelineError::stage_open("EncodeStage", format!("no encoder '{}'", config.codec)));
        }
        self.encoders_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockEncoder {
            delay: self.encoder_delay,
            capacity: self.encoder_capacity,
            stubborn: self.stubborn_again,
            fail_after: self.fail_after_packets,
            emitted: 0,
            held: VecDeque::new(),
            flushed: false,
            info: EncoderInfo {
                codec_name: config.codec.clone(),
                extradata: Some(Bytes::from_static(b"\x01mock")),
                time_base: input.time_base,
                width: input.width,
                height: input.height,
            },
        }))
    }
}

struct MockFilter {
    lookahead: usize,
    strips_color: bool,
    strips_timing: bool,
    format: FrameFormat,
    held: VecDeque<EngineFrame>,
    eof: bool,
}

impl FilterEngine for MockFilter {
    fn push_frame(&mut self, frame: Option<&EngineFrame>) -> Result<EngineStatus> {
        match frame {
            Some(frame) => {
                let mut copy = frame.clone();
                if self.strips_color {
                    copy.color = ColorMetadata::default();
                }
                if self.strips_timing {
                    copy.duration = 0;
                    copy.pixel_aspect = None;
                }
                self.held.push_back(copy);
            }
            None => self.eof = true,
        }
        Ok(EngineStatus::Done)
    }

    fn pull_frame(&mut self, out: &mut FrameSlot) -> Result<EngineStatus> {
        if self.held.len() > self.lookahead || (self.eof && !self.held.is_empty()) {
            if let Some(frame) = self.held.pop_front() {
                out.store(frame);
                return Ok(EngineStatus::Done);
            }
        }
        Ok(if self.eof {
            EngineStatus::EndOfStream
        } else {
            EngineStatus::Again
        })
    }

    fn output_format(&self) -> FrameFormat {
        self.format
    }
}

struct MockEncoder {
    delay: usize,
    capacity: usize,
    stubborn: bool,
    fail_after: Option<usize>,
    emitted: usize,
    held: VecDeque<EngineFrame>,
    flushed: bool,
    info: EncoderInfo,
}

impl EncoderEngine for MockEncoder {
    fn send_frame(&mut self, slot: Option<&mut FrameSlot>) -> Result<EngineStatus> {
        let Some(slot) = slot else {
            self.flushed = true;
            return Ok(EngineStatus::Done);
        };
        if self.stubborn || (self.capacity > 0 && self.held.len() >= self.capacity) {
            return Ok(EngineStatus::Again);
        }
        match slot.lend() {
            Some(frame) => self.held.push_back(frame.clone()),
            None => bail!(PipelineError::stage("EncodeStage", "empty frame slot")),
        }
        slot.release();
        Ok(EngineStatus::Done)
    }

    fn receive_packet(&mut self, packet: &mut EnginePacket) -> Result<EngineStatus> {
        if self.fail_after.is_some_and(|n| self.emitted >= n) {
            bail!(PipelineError::stage("EncodeStage", "corrupt bitstream"));
        }
        if self.held.len() > self.delay || (self.flushed && !self.held.is_empty()) {
            if let Some(frame) = self.held.pop_front() {
                packet.unref();
                let pts = frame.pts.unwrap_or_default();
                packet.set_data(&pts.to_le_bytes());
                packet.pts = frame.pts;
                packet.dts = frame.pts;
                packet.duration = frame.duration;
                packet.time_base = frame.time_base;
                packet.key = self.emitted % 10 == 0;
                self.emitted += 1;
                return Ok(EngineStatus::Done);
            }
        }
        Ok(if self.flushed {
            EngineStatus::EndOfStream
        } else {
            EngineStatus::Again
        })
    }

    fn info(&self) -> &EncoderInfo {
        &self.info
    }
}
