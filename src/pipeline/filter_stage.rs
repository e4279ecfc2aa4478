//! Filter stage
//!
//! Wraps a filter graph opened lazily from the first frame. Frames are pushed
//! by reference and filtered frames are pulled into a reused output slot.

use anyhow::{Result, anyhow};
use log::{debug, error, info};
use std::sync::Arc;

use crate::engine::{EngineFactory, EngineFrame, EngineStatus, FilterEngine, FrameFormat, FrameSlot};
use crate::error::PipelineError;
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::signals::ReadySignal;
use crate::pipeline::state::StageState;

pub struct FilterStage {
    description: String,
    state: StageState,
    engine: Option<Box<dyn FilterEngine>>,
    /// Second reused frame, distinct from the coordinator's input frame
    filtered: FrameSlot,
    ready: Arc<ReadySignal>,
    health: Arc<PipelineHealth>,
    pushed: u64,
    pulled: u64,
}

impl FilterStage {
    pub fn new(
        description: impl Into<String>,
        ready: Arc<ReadySignal>,
        health: Arc<PipelineHealth>,
    ) -> Self {
        Self {
            description: description.into(),
            state: StageState::Uninitialized,
            engine: None,
            filtered: FrameSlot::new(),
            ready,
            health,
            pushed: 0,
            pulled: 0,
        }
    }

    pub fn name(&self) -> &'static str {
        "FilterStage"
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    pub fn is_eof(&self) -> bool {
        self.state == StageState::Eof
    }

    fn transition(&mut self, target: StageState) -> Result<()> {
        if !self.state.can_transition_to(&target) {
            return Err(PipelineError::stage(
                "FilterStage",
                format!("invalid transition {} -> {}", self.state, target),
            )
            .into());
        }
        self.state = target;
        Ok(())
    }

    fn fail(&mut self, err: anyhow::Error) -> anyhow::Error {
        error!("FilterStage: {:#}", err);
        self.state = StageState::Failed;
        self.engine = None;
        self.filtered.release();
        self.ready.close();
        self.health.record_stage_failure();
        err
    }

    /// Open the graph for frames of `input`; no-op once opened
    pub fn prepare(&mut self, factory: &dyn EngineFactory, input: &FrameFormat) -> Result<()> {
        if self.state != StageState::Uninitialized {
            return Ok(());
        }
        self.transition(StageState::Preparing)?;
        match factory.open_filter(&self.description, input) {
            Ok(engine) => {
                self.engine = Some(engine);
                self.transition(StageState::Ready)?;
                info!(
                    "FilterStage: opened '{}' for {} {}x{}",
                    self.description, input.pixel_format, input.width, input.height
                );
                self.ready.signal();
                Ok(())
            }
            Err(e) => Err(self.fail(e.context(format!(
                "Failed to open filter graph '{}'",
                self.description
            )))),
        }
    }

    fn engine(&mut self) -> Result<&mut Box<dyn FilterEngine>> {
        let state = self.state;
        self.engine
            .as_mut()
            .ok_or_else(|| anyhow!(PipelineError::stage("FilterStage", format!("no graph in state {state}"))))
    }

    /// Push a borrowed frame; the caller keeps ownership and releases it
    pub fn push(&mut self, frame: &EngineFrame) -> Result<EngineStatus> {
        if self.state != StageState::Ready {
            return Err(PipelineError::stage("FilterStage", format!("push in state {}", self.state)).into());
        }
        let result = self.engine()?.push_frame(Some(frame));
        match result {
            Ok(status) => {
                if status == EngineStatus::Done {
                    self.pushed += 1;
                }
                Ok(status)
            }
            Err(e) => Err(self.fail(e.context("Failed to push frame into filter graph"))),
        }
    }

    /// Signal end of stream. A graph that never opened goes straight to EOF.
    pub fn push_eof(&mut self) -> Result<()> {
        match self.state {
            StageState::Uninitialized => self.transition(StageState::Eof),
            StageState::Ready => {
                self.transition(StageState::Draining)?;
                let result = self.engine()?.push_frame(None);
                match result {
                    Ok(_) => {
                        debug!("FilterStage: draining after {} frames", self.pushed);
                        Ok(())
                    }
                    Err(e) => Err(self.fail(e.context("Failed to flush filter graph"))),
                }
            }
            StageState::Draining | StageState::Eof => Ok(()),
            state => Err(PipelineError::stage("FilterStage", format!("flush in state {state}")).into()),
        }
    }

    /// Pull one filtered frame into the output slot.
    ///
    /// `Again` means more input is needed; `EndOfStream` moves a draining
    /// stage to EOF.
    pub fn pull(&mut self) -> Result<EngineStatus> {
        if self.state == StageState::Eof {
            return Ok(EngineStatus::EndOfStream);
        }
        if !self.state.is_ready() {
            return Err(PipelineError::stage("FilterStage", format!("pull in state {}", self.state)).into());
        }
        let Self {
            engine, filtered, ..
        } = &mut *self;
        let result = match engine.as_mut() {
            Some(engine) => engine.pull_frame(filtered),
            None => return Err(PipelineError::stage("FilterStage", "graph missing").into()),
        };
        match result {
            Ok(EngineStatus::Done) => {
                self.pulled += 1;
                Ok(EngineStatus::Done)
            }
            Ok(EngineStatus::EndOfStream) => {
                if self.state == StageState::Draining {
                    self.transition(StageState::Eof)?;
                    info!(
                        "FilterStage: finished, {} frames in, {} frames out",
                        self.pushed, self.pulled
                    );
                }
                Ok(EngineStatus::EndOfStream)
            }
            Ok(EngineStatus::Again) => Ok(EngineStatus::Again),
            Err(e) => Err(self.fail(e.context("Failed to pull frame from filter graph"))),
        }
    }

    /// Slot holding the last pulled frame
    pub fn filtered_mut(&mut self) -> &mut FrameSlot {
        &mut self.filtered
    }

    pub fn output_format(&self) -> Option<FrameFormat> {
        self.engine.as_ref().map(|e| e.output_format())
    }

    pub fn counts(&self) -> (u64, u64) {
        (self.pushed, self.pulled)
    }
}
