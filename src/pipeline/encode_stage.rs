//! Encode stage
//!
//! Wraps an encoder opened lazily from the first frame it is sent. Frames are
//! lent to the engine and the slot is released on success, so the caller's
//! allocation survives; encoded packets are received into one reused packet.

use anyhow::Result;
use log::{error, info};
use std::sync::Arc;

use crate::config::VideoEncoderConfig;
use crate::engine::{
    EncoderEngine, EncoderInfo, EngineFactory, EnginePacket, EngineStatus, FrameFormat, FrameSlot,
};
use crate::error::PipelineError;
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::signals::ReadySignal;
use crate::pipeline::state::StageState;

pub struct EncodeStage {
    config: VideoEncoderConfig,
    state: StageState,
    engine: Option<Box<dyn EncoderEngine>>,
    packet: EnginePacket,
    ready: Arc<ReadySignal>,
    health: Arc<PipelineHealth>,
    sent: u64,
    received: u64,
}

impl EncodeStage {
    pub fn new(
        config: VideoEncoderConfig,
        ready: Arc<ReadySignal>,
        health: Arc<PipelineHealth>,
    ) -> Self {
        Self {
            config,
            state: StageState::Uninitialized,
            engine: None,
            packet: EnginePacket::new(),
            ready,
            health,
            sent: 0,
            received: 0,
        }
    }

    pub fn name(&self) -> &'static str {
        "EncodeStage"
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    /// True once flushed and fully drained
    pub fn is_eof(&self) -> bool {
        self.state == StageState::Eof
    }

    pub fn is_flushed(&self) -> bool {
        matches!(self.state, StageState::Draining | StageState::Eof)
    }

    pub fn config(&self) -> &VideoEncoderConfig {
        &self.config
    }

    fn transition(&mut self, target: StageState) -> Result<()> {
        if !self.state.can_transition_to(&target) {
            return Err(PipelineError::stage(
                "EncodeStage",
                format!("invalid transition {} -> {}", self.state, target),
            )
            .into());
        }
        self.state = target;
        Ok(())
    }

    fn fail(&mut self, err: anyhow::Error) -> anyhow::Error {
        error!("EncodeStage: {:#}", err);
        self.state = StageState::Failed;
        self.engine = None;
        self.packet.unref();
        self.ready.close();
        self.health.record_stage_failure();
        err
    }

    /// Open the encoder for frames of `input`; no-op once opened
    pub fn prepare(&mut self, factory: &dyn EngineFactory, input: &FrameFormat) -> Result<()> {
        if self.state != StageState::Uninitialized {
            return Ok(());
        }
        self.transition(StageState::Preparing)?;
        match factory.open_encoder(&self.config, input) {
            Ok(engine) => {
                self.engine = Some(engine);
                self.transition(StageState::Ready)?;
                info!(
                    "EncodeStage: opened {} for {} {}x{} (bit rate {:?}, frame rate {:?})",
                    self.config.codec,
                    input.pixel_format,
                    input.width,
                    input.height,
                    self.config.bit_rate,
                    self.config.frame_rate
                );
                self.ready.signal();
                Ok(())
            }
            Err(e) => Err(self.fail(e.context(format!(
                "Failed to open encoder {}",
                self.config.codec
            )))),
        }
    }

    /// Send the frame held by `slot`; on `Done` the slot is released
    pub fn send(&mut self, slot: &mut FrameSlot) -> Result<EngineStatus> {
        if self.state != StageState::Ready {
            return Err(PipelineError::stage("EncodeStage", format!("send in state {}", self.state)).into());
        }
        let result = match self.engine.as_mut() {
            Some(engine) => engine.send_frame(Some(slot)),
            None => return Err(PipelineError::stage("EncodeStage", "encoder missing").into()),
        };
        match result {
            Ok(EngineStatus::Done) => {
                self.sent += 1;
                Ok(EngineStatus::Done)
            }
            Ok(status) => Ok(status),
            Err(e) => Err(self.fail(e.context("Failed to send frame to encoder"))),
        }
    }

    /// Flush with a null frame. An encoder that never opened goes straight to EOF.
    pub fn flush(&mut self) -> Result<()> {
        match self.state {
            StageState::Uninitialized => self.transition(StageState::Eof),
            StageState::Ready => {
                self.transition(StageState::Draining)?;
                let result = match self.engine.as_mut() {
                    Some(engine) => engine.send_frame(None),
                    None => return Err(PipelineError::stage("EncodeStage", "encoder missing").into()),
                };
                match result {
                    Ok(_) => Ok(()),
                    Err(e) => Err(self.fail(e.context("Failed to flush encoder"))),
                }
            }
            StageState::Draining | StageState::Eof => Ok(()),
            state => Err(PipelineError::stage("EncodeStage", format!("flush in state {state}")).into()),
        }
    }

    /// Receive one packet into the reused packet
    pub fn receive(&mut self) -> Result<EngineStatus> {
        if self.state == StageState::Eof {
            return Ok(EngineStatus::EndOfStream);
        }
        if !self.state.is_ready() {
            return Err(PipelineError::stage("EncodeStage", format!("receive in state {}", self.state)).into());
        }
        let result = match self.engine.as_mut() {
            Some(engine) => engine.receive_packet(&mut self.packet),
            None => return Err(PipelineError::stage("EncodeStage", "encoder missing").into()),
        };
        match result {
            Ok(EngineStatus::Done) => {
                self.received += 1;
                Ok(EngineStatus::Done)
            }
            Ok(EngineStatus::EndOfStream) => {
                if self.state == StageState::Draining {
                    self.transition(StageState::Eof)?;
                    info!(
                        "EncodeStage: finished, {} frames in, {} packets out",
                        self.sent, self.received
                    );
                }
                Ok(EngineStatus::EndOfStream)
            }
            Ok(EngineStatus::Again) => Ok(EngineStatus::Again),
            Err(e) => Err(self.fail(e.context("Failed to receive packet from encoder"))),
        }
    }

    /// The packet filled by the last successful `receive`
    pub fn packet(&self) -> &EnginePacket {
        &self.packet
    }

    pub fn info(&self) -> Option<&EncoderInfo> {
        self.engine.as_ref().map(|e| e.info())
    }

    pub fn counts(&self) -> (u64, u64) {
        (self.sent, self.received)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::MockEngines;
    use crate::media::{PixelFormat, Rational};

    fn input() -> FrameFormat {
        FrameFormat {
            pixel_format: PixelFormat::Yuv420p,
            width: 16,
            height: 16,
            time_base: Rational::new(1, 30000),
            pixel_aspect: None,
        }
    }

    fn stage(engines: &MockEngines) -> EncodeStage {
        let mut stage = EncodeStage::new(
            VideoEncoderConfig::new("libx264"),
            Arc::new(ReadySignal::new("encoder")),
            Arc::new(PipelineHealth::new()),
        );
        stage.prepare(engines, &input()).unwrap();
        stage
    }

    fn fill(slot: &mut FrameSlot, pts: i64) {
        slot.prepare(PixelFormat::Yuv420p, 16, 16, Rational::new(1, 30000)).pts = Some(pts);
    }

    #[test]
    fn test_delay_then_flush() {
        let engines = MockEngines {
            encoder_delay: 2,
            ..Default::default()
        };
        let mut stage = stage(&engines);
        let mut slot = FrameSlot::new();
        let mut pts = Vec::new();

        for i in 0..4 {
            fill(&mut slot, i * 1001);
            assert_eq!(stage.send(&mut slot).unwrap(), EngineStatus::Done);
            assert!(!slot.is_referenced());
            while stage.receive().unwrap() == EngineStatus::Done {
                pts.push(stage.packet().pts.unwrap());
            }
        }
        assert_eq!(pts, vec![0, 1001]);

        stage.flush().unwrap();
        assert!(stage.is_flushed());
        while stage.receive().unwrap() == EngineStatus::Done {
            pts.push(stage.packet().pts.unwrap());
        }
        assert_eq!(pts, vec![0, 1001, 2002, 3003]);
        assert!(stage.is_eof());
        assert_eq!(stage.info().map(|i| i.codec_name.as_str()), Some("libx264"));
    }

    #[test]
    fn test_send_keeps_slot_allocation() {
        let engines = MockEngines {
            encoder_delay: 8,
            ..Default::default()
        };
        let mut stage = stage(&engines);
        let mut slot = FrameSlot::new();
        let mut allocations = Vec::new();

        for i in 0..3 {
            fill(&mut slot, i * 1001);
            allocations.push(slot.lend().unwrap().planes()[0].data.as_ptr());
            assert_eq!(stage.send(&mut slot).unwrap(), EngineStatus::Done);
            assert!(!slot.is_referenced());
        }
        assert!(allocations.iter().all(|p| *p == allocations[0]));
        assert_eq!(stage.counts(), (3, 0));
    }

    #[test]
    fn test_again_leaves_frame_with_caller() {
        let engines = MockEngines {
            encoder_delay: 4,
            encoder_capacity: 1,
            ..Default::default()
        };
        let mut stage = stage(&engines);
        let mut slot = FrameSlot::new();
        fill(&mut slot, 0);
        assert_eq!(stage.send(&mut slot).unwrap(), EngineStatus::Done);
        fill(&mut slot, 1001);
        assert_eq!(stage.send(&mut slot).unwrap(), EngineStatus::Again);
        assert!(slot.is_referenced());
    }

    #[test]
    fn test_receive_error_fails_stage() {
        let engines = MockEngines {
            fail_after_packets: Some(0),
            ..Default::default()
        };
        let mut stage = stage(&engines);
        let mut slot = FrameSlot::new();
        fill(&mut slot, 0);
        stage.send(&mut slot).unwrap();
        assert!(stage.receive().is_err());
        assert_eq!(stage.state(), StageState::Failed);
        assert!(stage.flush().is_err());
    }

    #[test]
    fn test_unopened_flush_goes_to_eof() {
        let mut stage = EncodeStage::new(
            VideoEncoderConfig::new("libx264"),
            Arc::new(ReadySignal::new("encoder")),
            Arc::new(PipelineHealth::new()),
        );
        stage.flush().unwrap();
        assert!(stage.is_eof());
        assert_eq!(stage.receive().unwrap(), EngineStatus::EndOfStream);
    }
}
