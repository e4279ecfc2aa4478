use std::collections::VecDeque;
use std::sync::Arc;

use crate::media::{PixelBuffer, PixelFormat};

/// Pool for reusing pixel buffers of one geometry.
///
/// A buffer handed out as `Arc<PixelBuffer>` returns to service once every
/// sample referencing it has been dropped.
pub struct PixelBufferPool {
    buffers: VecDeque<Arc<PixelBuffer>>,
    format: PixelFormat,
    width: u32,
    height: u32,
}

/// Buffers kept for reuse; beyond this the pool stops tracking new ones
const MAX_POOL_SIZE: usize = 8;

impl PixelBufferPool {
    pub fn new(format: PixelFormat, width: u32, height: u32) -> Self {
        Self {
            buffers: VecDeque::with_capacity(MAX_POOL_SIZE),
            format,
            width,
            height,
        }
    }

    pub fn matches(&self, format: PixelFormat, width: u32, height: u32) -> bool {
        self.format == format && self.width == width && self.height == height
    }

    /// A writable buffer, recycled if one is no longer referenced
    pub fn take(&mut self) -> PixelBuffer {
        // Scan each pooled buffer at most once
        let available = self.buffers.len();
        for _ in 0..available {
            let Some(buffer) = self.buffers.pop_front() else {
                break;
            };
            match Arc::try_unwrap(buffer) {
                Ok(buffer) => return buffer,
                Err(buffer) => self.buffers.push_back(buffer),
            }
        }
        PixelBuffer::new(self.format, self.width, self.height)
    }

    /// Freeze a filled buffer and keep a reference for later reuse
    pub fn put(&mut self, buffer: PixelBuffer) -> Arc<PixelBuffer> {
        let buffer = Arc::new(buffer);
        if self.buffers.len() < MAX_POOL_SIZE {
            self.buffers.push_back(buffer.clone());
        }
        buffer
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}
