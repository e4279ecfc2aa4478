//! Container-native sample buffers

use bytes::Bytes;
use std::sync::Arc;

use super::format::{ColorMetadata, FieldInfo, FormatDescription, PixelFormat};
use super::time::{MediaTime, Rational};

/// Row alignment used when allocating pixel buffers
pub const STRIDE_ALIGNMENT: usize = 64;

/// One image plane with its row stride
#[derive(Debug, Clone)]
pub struct Plane {
    pub data: Vec<u8>,
    pub stride: usize,
}

/// Uncompressed image storage with color attachments
#[derive(Debug, Clone)]
pub struct PixelBuffer {
    format: PixelFormat,
    width: u32,
    height: u32,
    planes: Vec<Plane>,
    pub color: ColorMetadata,
    pub field: FieldInfo,
    pub pixel_aspect: Option<Rational>,
}

impl PixelBuffer {
    /// Allocate a zeroed buffer with rows padded to `STRIDE_ALIGNMENT`
    pub fn new(format: PixelFormat, width: u32, height: u32) -> Self {
        Self::with_alignment(format, width, height, STRIDE_ALIGNMENT)
    }

    /// Allocate a zeroed buffer with the given row alignment (1 = tightly packed)
    pub fn with_alignment(format: PixelFormat, width: u32, height: u32, alignment: usize) -> Self {
        let alignment = alignment.max(1);
        let planes = (0..format.planes().len())
            .map(|i| {
                let stride = format.row_bytes(i, width).next_multiple_of(alignment);
                Plane {
                    data: vec![0; stride * format.rows(i, height)],
                    stride,
                }
            })
            .collect();

        Self {
            format,
            width,
            height,
            planes,
            color: ColorMetadata::default(),
            field: FieldInfo::PROGRESSIVE,
            pixel_aspect: None,
        }
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }

    pub fn planes_mut(&mut self) -> &mut [Plane] {
        &mut self.planes
    }

    pub fn stride(&self, plane: usize) -> usize {
        self.planes[plane].stride
    }

    pub fn plane_data(&self, plane: usize) -> &[u8] {
        &self.planes[plane].data
    }

    /// Visible bytes of one row (stride padding excluded)
    pub fn row(&self, plane: usize, row: usize) -> &[u8] {
        let p = &self.planes[plane];
        let start = row * p.stride;
        &p.data[start..start + self.format.row_bytes(plane, self.width)]
    }

    pub fn matches_geometry(&self, format: PixelFormat, width: u32, height: u32) -> bool {
        self.format == format && self.width == width && self.height == height
    }

    /// Total visible payload size in bytes
    pub fn byte_len(&self) -> usize {
        (0..self.planes.len())
            .map(|i| self.format.row_bytes(i, self.width) * self.format.rows(i, self.height))
            .sum()
    }
}

/// Sample payload
#[derive(Debug, Clone)]
pub enum Payload {
    Image(Arc<PixelBuffer>),
    Compressed(Bytes),
}

#[derive(Debug)]
struct SampleInner {
    pts: MediaTime,
    dts: Option<MediaTime>,
    duration: MediaTime,
    sync: bool,
    format: Arc<FormatDescription>,
    payload: Payload,
}

/// One timed media sample.
///
/// Cheap to clone; the contents are immutable once built.
#[derive(Debug, Clone)]
pub struct SampleBuffer(Arc<SampleInner>);

impl SampleBuffer {
    /// Uncompressed image sample; every raw frame is a sync sample
    pub fn image(
        pixels: Arc<PixelBuffer>,
        format: Arc<FormatDescription>,
        pts: MediaTime,
        duration: MediaTime,
    ) -> Self {
        Self(Arc::new(SampleInner {
            pts,
            dts: None,
            duration,
            sync: true,
            format,
            payload: Payload::Image(pixels),
        }))
    }

    pub fn compressed(
        data: Bytes,
        format: Arc<FormatDescription>,
        pts: MediaTime,
        dts: Option<MediaTime>,
        duration: MediaTime,
        sync: bool,
    ) -> Self {
        Self(Arc::new(SampleInner {
            pts,
            dts,
            duration,
            sync,
            format,
            payload: Payload::Compressed(data),
        }))
    }

    pub fn pts(&self) -> MediaTime {
        self.0.pts
    }

    pub fn dts(&self) -> Option<MediaTime> {
        self.0.dts
    }

    /// Decode time, falling back to the presentation time
    pub fn decode_time(&self) -> MediaTime {
        self.0.dts.unwrap_or(self.0.pts)
    }

    pub fn duration(&self) -> MediaTime {
        self.0.duration
    }

    pub fn is_sync(&self) -> bool {
        self.0.sync
    }

    pub fn format(&self) -> &Arc<FormatDescription> {
        &self.0.format
    }

    pub fn payload(&self) -> &Payload {
        &self.0.payload
    }

    pub fn image_buffer(&self) -> Option<&Arc<PixelBuffer>> {
        match &self.0.payload {
            Payload::Image(pixels) => Some(pixels),
            Payload::Compressed(_) => None,
        }
    }

    pub fn data(&self) -> Option<&Bytes> {
        match &self.0.payload {
            Payload::Compressed(data) => Some(data),
            Payload::Image(_) => None,
        }
    }

    /// Payload size in bytes
    pub fn size(&self) -> usize {
        match &self.0.payload {
            Payload::Image(pixels) => pixels.byte_len(),
            Payload::Compressed(data) => data.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_buffer_strides() {
        let buf = PixelBuffer::new(PixelFormat::Yuv420p, 100, 50);
        assert_eq!(buf.planes().len(), 3);
        assert_eq!(buf.stride(0), 128);
        assert_eq!(buf.stride(1), 64);
        assert_eq!(buf.plane_data(1).len(), 64 * 25);
        assert_eq!(buf.row(0, 49).len(), 100);
        assert_eq!(buf.byte_len(), 100 * 50 + 2 * 50 * 25);

        let packed = PixelBuffer::with_alignment(PixelFormat::Nv12, 100, 50, 1);
        assert_eq!(packed.stride(0), 100);
        assert_eq!(packed.stride(1), 100);
    }

    #[test]
    fn test_sample_accessors() {
        let format = Arc::new(FormatDescription::raw_video(PixelFormat::Gray8, 4, 4));
        let pixels = Arc::new(PixelBuffer::new(PixelFormat::Gray8, 4, 4));
        let sample = SampleBuffer::image(
            pixels,
            format.clone(),
            MediaTime::new(10, 600),
            MediaTime::new(20, 600),
        );
        assert!(sample.is_sync());
        assert_eq!(sample.decode_time(), MediaTime::new(10, 600));
        assert_eq!(sample.size(), 16);
        assert!(sample.data().is_none());

        let compressed = SampleBuffer::compressed(
            Bytes::from_static(b"\x00\x00\x01"),
            format,
            MediaTime::new(30, 600),
            Some(MediaTime::new(10, 600)),
            MediaTime::new(20, 600),
            false,
        );
        assert_eq!(compressed.size(), 3);
        assert_eq!(compressed.decode_time(), MediaTime::new(10, 600));
        assert!(compressed.image_buffer().is_none());
    }
}
