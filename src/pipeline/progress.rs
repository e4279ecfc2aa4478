//! Per-sample progress reporting

use serde::Serialize;

use crate::media::{CodecTag, MediaKind, MediaTime, SampleBuffer};
use crate::pipeline::channel::ChannelDelegate;

#[derive(Debug, Clone, Serialize)]
pub struct ProgressInfo {
    pub media_kind: MediaKind,
    /// Four-character code or codec name of the sample's format
    pub tag: String,
    pub track: u32,
    pub pts_seconds: f64,
    pub dts_seconds: f64,
    /// 0..=100 relative to the session time range
    pub percent: f64,
    pub count: u64,
}

pub type ProgressCallback = Box<dyn Fn(ProgressInfo) + Send + Sync + 'static>;

/// Channel delegate that turns every moved sample into a `ProgressInfo`
pub struct ProgressReporter {
    start: MediaTime,
    end: MediaTime,
    callback: ProgressCallback,
}

impl ProgressReporter {
    pub fn new(start: MediaTime, end: MediaTime, callback: ProgressCallback) -> Self {
        Self {
            start,
            end,
            callback,
        }
    }

    pub fn percent(&self, pts: MediaTime) -> f64 {
        let span = self.end.seconds() - self.start.seconds();
        if span <= 0.0 {
            return 0.0;
        }
        ((pts.seconds() - self.start.seconds()) / span * 100.0).clamp(0.0, 100.0)
    }

    pub fn tag(sample: &SampleBuffer) -> String {
        match &sample.format().codec {
            CodecTag::Raw(format) => String::from_utf8_lossy(&format.fourcc()).into_owned(),
            CodecTag::Compressed(name) => name.clone(),
        }
    }
}

impl ChannelDelegate for ProgressReporter {
    fn did_read_buffer(&self, track: u32, sample: &SampleBuffer, count: u64) {
        let pts = sample.pts();
        (self.callback)(ProgressInfo {
            media_kind: sample.format().media_kind,
            tag: Self::tag(sample),
            track,
            pts_seconds: pts.seconds(),
            dts_seconds: sample.decode_time().seconds(),
            percent: self.percent(pts),
            count,
        });
    }
}
