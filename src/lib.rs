//! Per-track media processing between a container reader and writer.
//!
//! Samples pulled from a reader are converted to engine frames, optionally
//! run through a filter graph and an encoder, converted back and pushed to a
//! writer, one channel per track.

pub mod config;
pub mod convert;
pub mod engine;
pub mod error;
pub mod media;
pub mod pipeline;

pub use config::{ProcessorConfig, VideoEncoderConfig};
pub use error::PipelineError;
pub use pipeline::{Processor, Session, SessionReport, TrackChannel};
