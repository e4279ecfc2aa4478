//! Track processing pipeline
//!
//! The pipeline is organized per track:
//! - A `TrackChannel` pumps samples from a producer into a consumer
//! - A `Processor` sits between reader and writer when a track is filtered
//!   or re-encoded; it is a consumer on its input side and a producer on its
//!   output side
//! - Filter and encode stages wrap the external engine behind a
//!   `Uninitialized → Preparing → Ready → Draining → Eof` state machine
//! - Health monitoring tracks per-processor counters
//!
//! A `Session` wires the channels of every track and runs them concurrently.

pub mod channel;
pub mod coordinator;
pub mod encode_stage;
pub mod filter_stage;
pub mod health;
pub mod io;
pub mod memory;
pub mod progress;
pub mod queue;
pub mod session;
pub mod signals;
pub mod state;

pub use channel::{ChannelDelegate, ChannelOutcome, ChannelReport, TrackChannel};
pub use coordinator::{Processor, StageFlags};
pub use health::{HealthSummary, PipelineHealth};
pub use io::{ReadyCallback, SampleConsumer, SampleProducer};
pub use memory::{CollectingConsumer, VecProducer};
pub use progress::{ProgressInfo, ProgressReporter};
pub use session::{Session, SessionReport};
pub use state::{ReaderStatus, StageState, WriterStatus};
