//! Pixel formats, color metadata and format descriptions

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::time::Rational;

/// Kind of media carried by a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    Video,
    Audio,
    /// Timecode, captions and any other track passed through untouched
    Other,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Video => "vide",
            MediaKind::Audio => "soun",
            MediaKind::Other => "othr",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Video => write!(f, "Video"),
            MediaKind::Audio => write!(f, "Audio"),
            MediaKind::Other => write!(f, "Other"),
        }
    }
}

/// Uncompressed pixel layouts understood by both the container side and the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// Planar YUV 4:2:0, 8-bit
    Yuv420p,
    /// Semi-planar YUV 4:2:0, 8-bit (interleaved CbCr)
    Nv12,
    /// Planar YUV 4:2:2, 8-bit
    Yuv422p,
    /// Planar YUV 4:4:4, 8-bit
    Yuv444p,
    /// Planar YUV 4:2:0, 10-bit little endian in 16-bit words
    Yuv420p10,
    /// Planar YUV 4:2:2, 10-bit little endian in 16-bit words
    Yuv422p10,
    /// Packed 4:2:2, Cb Y0 Cr Y1
    Uyvy422,
    /// Packed 4:2:2, Y0 Cb Y1 Cr
    Yuyv422,
    /// Packed BGRA, 32bpp
    Bgra,
    /// Packed RGB, 24bpp
    Rgb24,
    /// Single 8-bit luma plane
    Gray8,
}

/// Geometry of one plane relative to the luma dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneGeometry {
    /// Bytes per sample group in a row
    pub bytes_per_unit: usize,
    /// Horizontal subsampling shift (width is divided by 2^shift, rounding up)
    pub width_shift: u32,
    /// Vertical subsampling shift
    pub height_shift: u32,
    /// Pixels covered by one sample group (2 for packed 4:2:2)
    pub pixels_per_unit: usize,
}

const fn plane(bytes_per_unit: usize, width_shift: u32, height_shift: u32) -> PlaneGeometry {
    PlaneGeometry {
        bytes_per_unit,
        width_shift,
        height_shift,
        pixels_per_unit: 1,
    }
}

const PACKED_422: PlaneGeometry = PlaneGeometry {
    bytes_per_unit: 4,
    width_shift: 0,
    height_shift: 0,
    pixels_per_unit: 2,
};

impl PixelFormat {
    pub const ALL: [PixelFormat; 11] = [
        PixelFormat::Yuv420p,
        PixelFormat::Nv12,
        PixelFormat::Yuv422p,
        PixelFormat::Yuv444p,
        PixelFormat::Yuv420p10,
        PixelFormat::Yuv422p10,
        PixelFormat::Uyvy422,
        PixelFormat::Yuyv422,
        PixelFormat::Bgra,
        PixelFormat::Rgb24,
        PixelFormat::Gray8,
    ];

    pub fn planes(self) -> &'static [PlaneGeometry] {
        const YUV420P: [PlaneGeometry; 3] = [plane(1, 0, 0), plane(1, 1, 1), plane(1, 1, 1)];
        const NV12: [PlaneGeometry; 2] = [plane(1, 0, 0), plane(2, 1, 1)];
        const YUV422P: [PlaneGeometry; 3] = [plane(1, 0, 0), plane(1, 1, 0), plane(1, 1, 0)];
        const YUV444P: [PlaneGeometry; 3] = [plane(1, 0, 0), plane(1, 0, 0), plane(1, 0, 0)];
        const YUV420P10: [PlaneGeometry; 3] = [plane(2, 0, 0), plane(2, 1, 1), plane(2, 1, 1)];
        const YUV422P10: [PlaneGeometry; 3] = [plane(2, 0, 0), plane(2, 1, 0), plane(2, 1, 0)];
        const PACKED: [PlaneGeometry; 1] = [PACKED_422];
        const BGRA: [PlaneGeometry; 1] = [plane(4, 0, 0)];
        const RGB24: [PlaneGeometry; 1] = [plane(3, 0, 0)];
        const GRAY8: [PlaneGeometry; 1] = [plane(1, 0, 0)];

        match self {
            PixelFormat::Yuv420p => &YUV420P,
            PixelFormat::Nv12 => &NV12,
            PixelFormat::Yuv422p => &YUV422P,
            PixelFormat::Yuv444p => &YUV444P,
            PixelFormat::Yuv420p10 => &YUV420P10,
            PixelFormat::Yuv422p10 => &YUV422P10,
            PixelFormat::Uyvy422 | PixelFormat::Yuyv422 => &PACKED,
            PixelFormat::Bgra => &BGRA,
            PixelFormat::Rgb24 => &RGB24,
            PixelFormat::Gray8 => &GRAY8,
        }
    }

    /// Visible bytes in one row of `plane` for a picture `width` pixels wide
    pub fn row_bytes(self, plane: usize, width: u32) -> usize {
        let g = self.planes()[plane];
        let w = shifted(width, g.width_shift);
        w.div_ceil(g.pixels_per_unit) * g.bytes_per_unit
    }

    /// Number of rows of `plane` for a picture `height` pixels high
    pub fn rows(self, plane: usize, height: u32) -> usize {
        shifted(height, self.planes()[plane].height_shift)
    }

    /// Name used by the engine (FFmpeg pixel format name)
    pub fn engine_name(self) -> &'static str {
        match self {
            PixelFormat::Yuv420p => "yuv420p",
            PixelFormat::Nv12 => "nv12",
            PixelFormat::Yuv422p => "yuv422p",
            PixelFormat::Yuv444p => "yuv444p",
            PixelFormat::Yuv420p10 => "yuv420p10le",
            PixelFormat::Yuv422p10 => "yuv422p10le",
            PixelFormat::Uyvy422 => "uyvy422",
            PixelFormat::Yuyv422 => "yuyv422",
            PixelFormat::Bgra => "bgra",
            PixelFormat::Rgb24 => "rgb24",
            PixelFormat::Gray8 => "gray",
        }
    }

    pub fn from_engine_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.engine_name() == name)
    }

    /// Container-native four character code of the pixel layout
    pub fn fourcc(self) -> [u8; 4] {
        match self {
            PixelFormat::Yuv420p => *b"y420",
            PixelFormat::Nv12 => *b"420v",
            PixelFormat::Yuv422p => *b"y422",
            PixelFormat::Yuv444p => *b"y444",
            PixelFormat::Yuv420p10 => *b"x420",
            PixelFormat::Yuv422p10 => *b"x422",
            PixelFormat::Uyvy422 => *b"2vuy",
            PixelFormat::Yuyv422 => *b"yuvs",
            PixelFormat::Bgra => *b"BGRA",
            PixelFormat::Rgb24 => *b"24RG",
            PixelFormat::Gray8 => *b"L008",
        }
    }

    pub fn from_fourcc(code: [u8; 4]) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.fourcc() == code)
    }
}

fn shifted(value: u32, shift: u32) -> usize {
    ((value as usize) + (1 << shift) - 1) >> shift
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.engine_name())
    }
}

/// Sample value range
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColorRange {
    #[default]
    Unspecified,
    /// Limited ("video") range
    Limited,
    Full,
}

/// Chroma sample siting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChromaLocation {
    #[default]
    Unspecified,
    Left,
    Center,
    TopLeft,
    Top,
    BottomLeft,
    Bottom,
}

/// Color description captured from the first sample of a track.
///
/// Primaries, transfer and matrix are carried as ITU-T H.273 code points,
/// which both the container and the engine understand; 2 means unspecified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColorMetadata {
    pub range: ColorRange,
    pub primaries: u8,
    pub transfer: u8,
    pub matrix: u8,
    pub chroma_location: ChromaLocation,
}

impl ColorMetadata {
    pub const UNSPECIFIED_CODE: u8 = 2;

    pub const BT709: ColorMetadata = ColorMetadata {
        range: ColorRange::Limited,
        primaries: 1,
        transfer: 1,
        matrix: 1,
        chroma_location: ChromaLocation::Left,
    };

    pub fn is_unspecified(&self) -> bool {
        *self == Self::default()
    }
}

impl Default for ColorMetadata {
    fn default() -> Self {
        Self {
            range: ColorRange::Unspecified,
            primaries: Self::UNSPECIFIED_CODE,
            transfer: Self::UNSPECIFIED_CODE,
            matrix: Self::UNSPECIFIED_CODE,
            chroma_location: ChromaLocation::Unspecified,
        }
    }
}

/// Interlacing description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldInfo {
    /// 1 = progressive, 2 = interlaced
    pub count: u8,
    pub top_field_first: bool,
}

impl FieldInfo {
    pub const PROGRESSIVE: FieldInfo = FieldInfo {
        count: 1,
        top_field_first: false,
    };

    pub fn is_interlaced(&self) -> bool {
        self.count == 2
    }
}

impl Default for FieldInfo {
    fn default() -> Self {
        Self::PROGRESSIVE
    }
}

/// Clean aperture: the visible region centered in the encoded picture
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CleanAperture {
    pub width: f64,
    pub height: f64,
    pub horizontal_offset: f64,
    pub vertical_offset: f64,
}

/// What the payload of a sample is
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CodecTag {
    /// Uncompressed image in the given layout
    Raw(PixelFormat),
    /// Compressed bitstream; the engine codec name (e.g. "libx264") or fourcc
    Compressed(String),
}

/// Format description shared by all samples of a track segment
#[derive(Debug, Clone, PartialEq)]
pub struct FormatDescription {
    pub media_kind: MediaKind,
    pub codec: CodecTag,
    pub width: u32,
    pub height: u32,
    pub color: ColorMetadata,
    pub field: FieldInfo,
    pub pixel_aspect: Option<Rational>,
    pub clean_aperture: Option<CleanAperture>,
    /// Codec configuration record (avcC/hvcC payload or Annex B parameter sets)
    pub extradata: Option<Bytes>,
}

impl FormatDescription {
    pub fn raw_video(format: PixelFormat, width: u32, height: u32) -> Self {
        Self {
            media_kind: MediaKind::Video,
            codec: CodecTag::Raw(format),
            width,
            height,
            color: ColorMetadata::default(),
            field: FieldInfo::PROGRESSIVE,
            pixel_aspect: None,
            clean_aperture: None,
            extradata: None,
        }
    }

    pub fn compressed(media_kind: MediaKind, codec: impl Into<String>) -> Self {
        Self {
            media_kind,
            codec: CodecTag::Compressed(codec.into()),
            width: 0,
            height: 0,
            color: ColorMetadata::default(),
            field: FieldInfo::PROGRESSIVE,
            pixel_aspect: None,
            clean_aperture: None,
            extradata: None,
        }
    }

    pub fn with_color(mut self, color: ColorMetadata) -> Self {
        self.color = color;
        self
    }

    pub fn with_field(mut self, field: FieldInfo) -> Self {
        self.field = field;
        self
    }

    pub fn with_pixel_aspect(mut self, aspect: Rational) -> Self {
        self.pixel_aspect = Some(aspect);
        self
    }

    pub fn pixel_format(&self) -> Option<PixelFormat> {
        match self.codec {
            CodecTag::Raw(format) => Some(format),
            CodecTag::Compressed(_) => None,
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self.codec, CodecTag::Compressed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plane_geometry() {
        let f = PixelFormat::Yuv420p;
        assert_eq!(f.planes().len(), 3);
        assert_eq!(f.row_bytes(0, 721), 721);
        assert_eq!(f.row_bytes(1, 721), 361);
        assert_eq!(f.rows(2, 481), 241);

        let nv12 = PixelFormat::Nv12;
        assert_eq!(nv12.row_bytes(1, 720), 720);
        assert_eq!(nv12.rows(1, 480), 240);

        assert_eq!(PixelFormat::Uyvy422.row_bytes(0, 720), 1440);
        assert_eq!(PixelFormat::Uyvy422.row_bytes(0, 7), 16);
        assert_eq!(PixelFormat::Yuv422p10.row_bytes(1, 1920), 1920);
        assert_eq!(PixelFormat::Bgra.row_bytes(0, 10), 40);
    }

    #[test]
    fn test_name_and_fourcc_lookup() {
        for format in PixelFormat::ALL {
            assert_eq!(PixelFormat::from_engine_name(format.engine_name()), Some(format));
            assert_eq!(PixelFormat::from_fourcc(format.fourcc()), Some(format));
        }
        assert_eq!(PixelFormat::from_fourcc(*b"2vuy"), Some(PixelFormat::Uyvy422));
        assert!(PixelFormat::from_engine_name("p010le").is_none());
    }

    #[test]
    fn test_color_defaults() {
        assert!(ColorMetadata::default().is_unspecified());
        assert!(!ColorMetadata::BT709.is_unspecified());
        assert!(!FieldInfo::default().is_interlaced());
    }
}
