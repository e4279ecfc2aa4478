//! Container-side media model: timing, formats and sample buffers

pub mod format;
pub mod sample;
pub mod time;

pub use format::{
    ChromaLocation, CleanAperture, CodecTag, ColorMetadata, ColorRange, FieldInfo,
    FormatDescription, MediaKind, PixelFormat,
};
pub use sample::{Payload, PixelBuffer, Plane, SampleBuffer};
pub use time::{MediaTime, Rational};
