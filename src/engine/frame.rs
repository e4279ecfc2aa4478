//! Engine-native frames and packets, and the ownership-tagged frame slot

use bytes::Bytes;

use crate::media::{ColorMetadata, FieldInfo, PixelFormat, Rational};

/// Line alignment of engine frame planes (matches FFmpeg's default)
pub const LINE_ALIGNMENT: usize = 32;

/// Geometry and timing of a frame stream, used to open stages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFormat {
    pub pixel_format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub time_base: Rational,
    pub pixel_aspect: Option<Rational>,
}

impl FrameFormat {
    pub fn of(frame: &EngineFrame) -> Self {
        Self {
            pixel_format: frame.pixel_format(),
            width: frame.width(),
            height: frame.height(),
            time_base: frame.time_base,
            pixel_aspect: frame.pixel_aspect,
        }
    }
}

/// One plane of an engine frame
#[derive(Debug, Clone)]
pub struct FramePlane {
    pub data: Vec<u8>,
    pub line_size: usize,
}

/// Uncompressed engine frame
#[derive(Debug, Clone)]
pub struct EngineFrame {
    pixel_format: PixelFormat,
    width: u32,
    height: u32,
    planes: Vec<FramePlane>,
    /// Presentation time in `time_base` units
    pub pts: Option<i64>,
    pub duration: i64,
    pub time_base: Rational,
    pub color: ColorMetadata,
    pub field: FieldInfo,
    pub pixel_aspect: Option<Rational>,
}

impl EngineFrame {
    /// Allocate a zeroed frame
    pub fn alloc(pixel_format: PixelFormat, width: u32, height: u32, time_base: Rational) -> Self {
        let planes = (0..pixel_format.planes().len())
            .map(|i| {
                let line_size = pixel_format
                    .row_bytes(i, width)
                    .next_multiple_of(LINE_ALIGNMENT);
                FramePlane {
                    data: vec![0; line_size * pixel_format.rows(i, height)],
                    line_size,
                }
            })
            .collect();

        Self {
            pixel_format,
            width,
            height,
            planes,
            pts: None,
            duration: 0,
            time_base,
            color: ColorMetadata::default(),
            field: FieldInfo::PROGRESSIVE,
            pixel_aspect: None,
        }
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn planes(&self) -> &[FramePlane] {
        &self.planes
    }

    pub fn planes_mut(&mut self) -> &mut [FramePlane] {
        &mut self.planes
    }

    pub fn line_size(&self, plane: usize) -> usize {
        self.planes[plane].line_size
    }

    pub fn has_geometry(&self, pixel_format: PixelFormat, width: u32, height: u32) -> bool {
        self.pixel_format == pixel_format && self.width == width && self.height == height
    }

    /// Visible bytes of one row
    pub fn row(&self, plane: usize, row: usize) -> &[u8] {
        let p = &self.planes[plane];
        let start = row * p.line_size;
        &p.data[start..start + self.pixel_format.row_bytes(plane, self.width)]
    }

    pub fn row_mut(&mut self, plane: usize, row: usize) -> &mut [u8] {
        let len = self.pixel_format.row_bytes(plane, self.width);
        let p = &mut self.planes[plane];
        let start = row * p.line_size;
        &mut p.data[start..start + len]
    }
}

/// Reusable holder of one engine frame with explicit transfer rules.
///
/// * `prepare` / `store` fill the slot and mark it referenced.
/// * `lend` borrows the contents; the slot stays referenced and the caller
///   must `release` it afterwards.
/// * `hand_over` moves the contents out; the slot is unreferenced afterwards.
/// * `release` drops the reference but keeps the allocation for reuse.
#[derive(Debug, Default)]
pub struct FrameSlot {
    frame: Option<EngineFrame>,
    referenced: bool,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writable frame with the given geometry; the previous allocation is
    /// reused when the geometry matches.
    pub fn prepare(
        &mut self,
        pixel_format: PixelFormat,
        width: u32,
        height: u32,
        time_base: Rational,
    ) -> &mut EngineFrame {
        let reusable = self
            .frame
            .as_ref()
            .is_some_and(|f| f.has_geometry(pixel_format, width, height));
        if !reusable {
            self.frame = Some(EngineFrame::alloc(pixel_format, width, height, time_base));
        }
        self.referenced = true;

        let frame = self
            .frame
            .get_or_insert_with(|| EngineFrame::alloc(pixel_format, width, height, time_base));
        frame.time_base = time_base;
        frame.pts = None;
        frame.duration = 0;
        frame.color = ColorMetadata::default();
        frame.field = FieldInfo::PROGRESSIVE;
        frame.pixel_aspect = None;
        frame
    }

    /// Place a frame produced elsewhere (a filter pull) into the slot
    pub fn store(&mut self, frame: EngineFrame) {
        self.frame = Some(frame);
        self.referenced = true;
    }

    pub fn is_referenced(&self) -> bool {
        self.referenced && self.frame.is_some()
    }

    pub fn lend(&self) -> Option<&EngineFrame> {
        if self.referenced {
            self.frame.as_ref()
        } else {
            None
        }
    }

    pub fn get_mut(&mut self) -> Option<&mut EngineFrame> {
        if self.referenced {
            self.frame.as_mut()
        } else {
            None
        }
    }

    pub fn hand_over(&mut self) -> Option<EngineFrame> {
        if !self.referenced {
            return None;
        }
        self.referenced = false;
        self.frame.take()
    }

    pub fn release(&mut self) {
        self.referenced = false;
    }
}

/// Compressed engine packet, reused across encode cycles
#[derive(Debug, Clone, Default)]
pub struct EnginePacket {
    data: Vec<u8>,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub duration: i64,
    pub time_base: Rational,
    pub key: bool,
}

impl EnginePacket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Overwrite the payload, keeping the allocation
    pub fn set_data(&mut self, data: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(data);
    }

    /// Drop the payload and timing, keeping the allocation
    pub fn unref(&mut self) {
        self.data.clear();
        self.pts = None;
        self.dts = None;
        self.duration = 0;
        self.key = false;
    }
}

/// What an opened encoder reports about its output
#[derive(Debug, Clone)]
pub struct EncoderInfo {
    pub codec_name: String,
    /// Codec configuration record, available once the encoder is open
    pub extradata: Option<Bytes>,
    pub time_base: Rational,
    pub width: u32,
    pub height: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_transfer_rules() {
        let mut slot = FrameSlot::new();
        assert!(slot.lend().is_none());
        assert!(slot.hand_over().is_none());

        slot.prepare(PixelFormat::Gray8, 4, 2, Rational::new(1, 600)).pts = Some(7);
        assert!(slot.is_referenced());
        assert_eq!(slot.lend().and_then(|f| f.pts), Some(7));

        // borrow: still referenced until released
        assert!(slot.lend().is_some());
        slot.release();
        assert!(slot.lend().is_none());

        let frame = slot.prepare(PixelFormat::Gray8, 4, 2, Rational::new(1, 600));
        assert_eq!(frame.pts, None);
        let taken = slot.hand_over();
        assert!(taken.is_some());
        assert!(!slot.is_referenced());
    }

    #[test]
    fn test_slot_reuses_allocation() {
        let mut slot = FrameSlot::new();
        let first = slot
            .prepare(PixelFormat::Nv12, 64, 32, Rational::new(1, 90000))
            .planes()[0]
            .data
            .as_ptr();
        slot.release();
        let second = slot
            .prepare(PixelFormat::Nv12, 64, 32, Rational::new(1, 90000))
            .planes()[0]
            .data
            .as_ptr();
        assert_eq!(first, second);

        let resized = slot.prepare(PixelFormat::Nv12, 128, 32, Rational::new(1, 90000));
        assert_eq!(resized.width(), 128);
        assert_eq!(resized.line_size(0), 128);
    }

    #[test]
    fn test_packet_reuse() {
        let mut packet = EnginePacket::new();
        packet.set_data(&[1, 2, 3]);
        packet.key = true;
        assert_eq!(packet.data(), &[1, 2, 3]);
        packet.unref();
        assert!(packet.is_empty());
        assert!(!packet.key);
    }
}
