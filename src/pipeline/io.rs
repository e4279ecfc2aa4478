//! Producer (output side) and consumer (input side) contracts

use async_trait::async_trait;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::media::{MediaKind, SampleBuffer};

/// Callback re-armed while a consumer wants more data.
/// Returning false ends the registration.
pub type ReadyCallback = Box<dyn FnMut() -> bool + Send + 'static>;

/// Pull side of a track: a reader, or the output of a processor
#[async_trait]
pub trait SampleProducer: Send + Sync {
    /// Next sample, or `None` once exhausted, cancelled or failed.
    ///
    /// Suspends until a sample is available; never spins.
    async fn next_buffer(&self) -> Option<SampleBuffer>;

    fn media_kind(&self) -> MediaKind;

    /// Make pending and future `next_buffer` calls return `None` promptly
    fn cancel(&self);

    /// The failure that ended the stream, if any
    fn error(&self) -> Option<Arc<anyhow::Error>>;
}

/// Push side of a track: a writer, or the input of a processor
#[async_trait]
pub trait SampleConsumer: Send + Sync {
    /// Hand over one sample. Only valid after `is_ready_for_more` reported
    /// true; false once the consumer failed, was cancelled or finished.
    fn append(&self, sample: SampleBuffer) -> bool;

    fn is_ready_for_more(&self) -> bool;

    /// No further `append` calls will follow. Idempotent.
    fn mark_finished(&self);

    /// Wait until more input is wanted (true) or never will be (false)
    async fn wait_ready(&self) -> bool;

    /// Resolve on the next readiness edge: input accepted or released,
    /// end of input, failure or cancellation. Returns at once if the
    /// consumer is no longer ready.
    async fn ready_changed(&self);

    /// Invoke `callback` on `handle` now and whenever more input is wanted,
    /// until the consumer stops accepting or the callback returns false.
    fn request_data_when_ready(&self, handle: &Handle, callback: ReadyCallback) -> JoinHandle<()>;

    fn cancel(&self);

    fn error(&self) -> Option<Arc<anyhow::Error>>;
}

/// Shared driver for `request_data_when_ready`
pub fn drive_ready_callback(
    consumer: Arc<dyn SampleConsumer>,
    handle: &Handle,
    mut callback: ReadyCallback,
) -> JoinHandle<()> {
    handle.spawn(async move {
        while consumer.wait_ready().await {
            if !callback() {
                break;
            }
            if consumer.is_ready_for_more() {
                // callback had nothing to give; re-arm on the next edge
                consumer.ready_changed().await;
            }
        }
    })
}
