//! Conversion between container sample buffers and engine frames/packets
//!
//! The converter owns the caches that make steady-state conversion cheap:
//! a pixel buffer pool and the uncompressed format description for filtered
//! output, and the compressed format description for encoded output. Both
//! are rebuilt when the frame geometry changes.

use anyhow::Result;
use bytes::Bytes;
use std::sync::Arc;

use crate::engine::{EncoderInfo, EngineFrame, EnginePacket, FrameSlot};
use crate::error::PipelineError;
use crate::media::{
    CleanAperture, CodecTag, ColorMetadata, FieldInfo, FormatDescription, MediaKind, MediaTime,
    Payload, PixelBuffer, Rational, SampleBuffer,
};

mod planes;
mod pool;

pub use planes::copy_plane;
pub use pool::PixelBufferPool;

/// Express an engine timestamp as a media time
pub fn media_time(value: i64, time_base: Rational) -> MediaTime {
    if time_base.num == 1 && time_base.den <= i32::MAX as i64 {
        MediaTime::new(value, time_base.den as i32)
    } else {
        // fall back to microseconds for odd time bases
        let micros = value as i128 * time_base.num as i128 * 1_000_000 / time_base.den.max(1) as i128;
        MediaTime::new(micros as i64, 1_000_000)
    }
}

/// Reuse the cached description while it still describes the output
fn cached(
    cache: &mut Option<Arc<FormatDescription>>,
    wanted: FormatDescription,
) -> Arc<FormatDescription> {
    match cache {
        Some(current) if **current == wanted => current.clone(),
        _ => {
            let description = Arc::new(wanted);
            *cache = Some(description.clone());
            description
        }
    }
}

#[derive(Default)]
pub struct FrameConverter {
    pool: Option<PixelBufferPool>,
    raw_description: Option<Arc<FormatDescription>>,
    compressed_description: Option<Arc<FormatDescription>>,
    clean_aperture: Option<CleanAperture>,
    pixel_aspect: Option<Rational>,
}

impl FrameConverter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clean aperture and pixel aspect attached to encoded output
    pub fn with_geometry(
        mut self,
        clean_aperture: Option<CleanAperture>,
        pixel_aspect: Option<Rational>,
    ) -> Self {
        self.clean_aperture = clean_aperture;
        self.pixel_aspect = pixel_aspect;
        self
    }

    /// Fill the reused input frame from an image sample.
    ///
    /// Timing is rescaled to `time_scale`; color, field and aspect attachments
    /// are copied from the pixel buffer, falling back to the format description.
    pub fn sample_to_frame(
        &self,
        sample: &SampleBuffer,
        slot: &mut FrameSlot,
        time_scale: i32,
    ) -> Result<()> {
        let Payload::Image(pixels) = sample.payload() else {
            return Err(PipelineError::Conversion("sample carries no image buffer".into()).into());
        };

        let format = pixels.format();
        let (width, height) = (pixels.width(), pixels.height());
        let frame = slot.prepare(format, width, height, Rational::new(1, time_scale as i64));

        for (i, plane) in pixels.planes().iter().enumerate() {
            let row_bytes = format.row_bytes(i, width);
            let rows = format.rows(i, height);
            let destination = &mut frame.planes_mut()[i];
            if !copy_plane(
                &plane.data,
                plane.stride,
                &mut destination.data,
                destination.line_size,
                row_bytes,
                rows,
            ) {
                slot.release();
                return Err(PipelineError::Conversion(format!(
                    "plane {i} of {format} {width}x{height} is truncated"
                ))
                .into());
            }
        }

        frame.pts = Some(sample.pts().rescale(time_scale).value);
        frame.duration = sample.duration().rescale(time_scale).value;

        let description = sample.format();
        frame.color = if pixels.color.is_unspecified() {
            description.color
        } else {
            pixels.color
        };
        frame.field = if pixels.field != FieldInfo::PROGRESSIVE {
            pixels.field
        } else {
            description.field
        };
        frame.pixel_aspect = pixels.pixel_aspect.or(description.pixel_aspect);
        Ok(())
    }

    /// Build an uncompressed sample from a filtered frame.
    ///
    /// `color` overrides whatever the frame carries.
    pub fn frame_to_sample(
        &mut self,
        frame: &EngineFrame,
        color: Option<ColorMetadata>,
    ) -> Result<SampleBuffer> {
        let pts = frame
            .pts
            .ok_or_else(|| PipelineError::Conversion("frame has no timestamp".into()))?;
        let format = frame.pixel_format();
        let (width, height) = (frame.width(), frame.height());

        if !self
            .pool
            .as_ref()
            .is_some_and(|p| p.matches(format, width, height))
        {
            if self.pool.is_some() {
                log::info!(
                    "FrameConverter: geometry changed to {} {}x{}, resetting caches",
                    format,
                    width,
                    height
                );
            }
            self.pool = Some(PixelBufferPool::new(format, width, height));
            self.raw_description = None;
        }
        let Some(pool) = self.pool.as_mut() else {
            return Err(PipelineError::Conversion("pixel buffer pool unavailable".into()).into());
        };

        let mut pixels = pool.take();
        for (i, plane) in frame.planes().iter().enumerate() {
            let row_bytes = format.row_bytes(i, width);
            let rows = format.rows(i, height);
            let stride = pixels.stride(i);
            let destination = &mut pixels.planes_mut()[i].data;
            if !copy_plane(&plane.data, plane.line_size, destination, stride, row_bytes, rows) {
                return Err(PipelineError::Conversion(format!(
                    "engine plane {i} of {format} {width}x{height} is truncated"
                ))
                .into());
            }
        }
        pixels.color = color.unwrap_or(frame.color);
        pixels.field = frame.field;
        pixels.pixel_aspect = frame.pixel_aspect;

        let description = Self::raw_description(&mut self.raw_description, &pixels);
        let pixels = pool.put(pixels);

        Ok(SampleBuffer::image(
            pixels,
            description,
            media_time(pts, frame.time_base),
            media_time(frame.duration, frame.time_base),
        ))
    }

    fn raw_description(
        cache: &mut Option<Arc<FormatDescription>>,
        pixels: &PixelBuffer,
    ) -> Arc<FormatDescription> {
        let wanted = FormatDescription {
            media_kind: MediaKind::Video,
            codec: CodecTag::Raw(pixels.format()),
            width: pixels.width(),
            height: pixels.height(),
            color: pixels.color,
            field: pixels.field,
            pixel_aspect: pixels.pixel_aspect,
            clean_aperture: None,
            extradata: None,
        };
        cached(cache, wanted)
    }

    /// Build a compressed sample from an encoded packet
    pub fn packet_to_sample(
        &mut self,
        packet: &EnginePacket,
        info: &EncoderInfo,
        color: ColorMetadata,
        field: FieldInfo,
    ) -> Result<SampleBuffer> {
        if packet.is_empty() {
            return Err(PipelineError::Conversion("empty packet".into()).into());
        }
        let pts = packet
            .pts
            .ok_or_else(|| PipelineError::Conversion("packet has no timestamp".into()))?;

        let description = self.compressed_description(info, color, field);
        Ok(SampleBuffer::compressed(
            Bytes::copy_from_slice(packet.data()),
            description,
            media_time(pts, packet.time_base),
            packet.dts.map(|dts| media_time(dts, packet.time_base)),
            media_time(packet.duration, packet.time_base),
            packet.key,
        ))
    }

    fn compressed_description(
        &mut self,
        info: &EncoderInfo,
        color: ColorMetadata,
        field: FieldInfo,
    ) -> Arc<FormatDescription> {
        let wanted = FormatDescription {
            media_kind: MediaKind::Video,
            codec: CodecTag::Compressed(info.codec_name.clone()),
            width: info.width,
            height: info.height,
            color,
            field,
            pixel_aspect: self.pixel_aspect,
            clean_aperture: self.clean_aperture,
            extradata: info.extradata.clone(),
        };
        cached(&mut self.compressed_description, wanted)
    }

    /// Description of the most recently produced output, compressed first
    pub fn output_description(&self) -> Option<Arc<FormatDescription>> {
        self.compressed_description
            .clone()
            .or_else(|| self.raw_description.clone())
    }

    pub fn reset_caches(&mut self) {
        self.pool = None;
        self.raw_description = None;
        self.compressed_description = None;
    }
}
