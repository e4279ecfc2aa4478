//! Filter/encoder engine abstraction
//!
//! Every push/pull call answers with the same four-way contract: done,
//! "try again" (needs more input or output must be drained first),
//! end-of-stream, or an error.

use anyhow::Result;

use crate::config::VideoEncoderConfig;

pub mod builtin;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod frame;
#[cfg(test)]
pub mod testing;

pub use frame::{EncoderInfo, EngineFrame, EnginePacket, FrameFormat, FramePlane, FrameSlot};

/// Non-error outcome of an engine call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    /// The call did its work (frame accepted, frame or packet produced)
    Done,
    /// Nothing to do right now: push more input, or drain output first
    Again,
    /// The stage has been flushed and has nothing left
    EndOfStream,
}

/// Filter graph
pub trait FilterEngine: Send {
    /// Push one frame, or `None` to signal end of stream.
    ///
    /// The frame is borrowed: the engine takes its own reference and the
    /// caller still owns (and must release) the original.
    fn push_frame(&mut self, frame: Option<&EngineFrame>) -> Result<EngineStatus>;

    /// Pull one filtered frame into `out`
    fn pull_frame(&mut self, out: &mut FrameSlot) -> Result<EngineStatus>;

    /// Format of the frames this graph produces
    fn output_format(&self) -> FrameFormat;
}

/// Encoder
pub trait EncoderEngine: Send {
    /// Send the frame held by `slot`, or `None` to flush.
    ///
    /// The frame is borrowed with `FrameSlot::lend`. On `Done` the engine has
    /// taken its own copy and released the slot, which keeps its allocation
    /// for the next frame. On `Again` the slot is untouched and the caller
    /// retries after draining packets.
    fn send_frame(&mut self, slot: Option<&mut FrameSlot>) -> Result<EngineStatus>;

    /// Receive one packet into the reused `packet`
    fn receive_packet(&mut self, packet: &mut EnginePacket) -> Result<EngineStatus>;

    fn info(&self) -> &EncoderInfo;
}

/// Opens stages lazily from the first frame's format
pub trait EngineFactory: Send + Sync {
    fn open_filter(&self, description: &str, input: &FrameFormat) -> Result<Box<dyn FilterEngine>>;

    fn open_encoder(
        &self,
        config: &VideoEncoderConfig,
        input: &FrameFormat,
    ) -> Result<Box<dyn EncoderEngine>>;
}
