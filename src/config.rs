//! Typed pipeline configuration and its validating parse step

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::PipelineError;
use crate::media::{CleanAperture, Rational};

/// Encoder family, used to route codec-private parameter strings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodecKind {
    X264,
    X265,
    Other,
}

impl CodecKind {
    pub fn from_codec_name(name: &str) -> Self {
        let name = name.to_ascii_lowercase();
        if name.contains("264") {
            CodecKind::X264
        } else if name.contains("265") || name.contains("hevc") {
            CodecKind::X265
        } else {
            CodecKind::Other
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

/// Encoder configuration, read once when the encode stage opens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoEncoderConfig {
    /// Engine encoder name, e.g. `libx264`
    pub codec: String,
    #[serde(default)]
    pub frame_rate: Option<Rational>,
    /// Target bit rate in bits per second
    #[serde(default)]
    pub bit_rate: Option<u64>,
    #[serde(default)]
    pub declared_size: Option<Size>,
    #[serde(default)]
    pub pixel_aspect: Option<Rational>,
    #[serde(default)]
    pub codec_options: BTreeMap<String, String>,
    #[serde(default)]
    pub x264_params: Option<String>,
    #[serde(default)]
    pub x265_params: Option<String>,
    #[serde(default)]
    pub clean_aperture: Option<CleanAperture>,
    /// Soft validation messages collected while parsing
    #[serde(skip)]
    pub issues: Vec<String>,
}

impl VideoEncoderConfig {
    pub fn new(codec: impl Into<String>) -> Self {
        Self {
            codec: codec.into(),
            frame_rate: None,
            bit_rate: None,
            declared_size: None,
            pixel_aspect: None,
            codec_options: BTreeMap::new(),
            x264_params: None,
            x265_params: None,
            clean_aperture: None,
            issues: Vec::new(),
        }
    }

    /// Build from a string dictionary (`codec`, `bitrate`, `frame-rate`, `size`,
    /// `par`, `codec-options`, `x264-params`, `x265-params`, `clean-aperture`;
    /// the ffmpeg-style short keys `c`, `b`, `r`, `s` are accepted too).
    ///
    /// A missing codec is an error; anything else that does not parse is
    /// recorded in `issues` and skipped.
    pub fn from_params(params: &BTreeMap<String, String>) -> Result<Self> {
        let codec = params
            .get("codec")
            .or_else(|| params.get("c"))
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| PipelineError::Config("missing encoder codec name".into()))?;

        let mut config = VideoEncoderConfig::new(codec);
        for (key, value) in params {
            let value = value.trim();
            let applied = match key.as_str() {
                "codec" | "c" => Ok(()),
                "bitrate" | "b" => parse_bitrate(value).map(|b| config.bit_rate = Some(b)),
                "frame-rate" | "r" => parse_rational(value).map(|r| config.frame_rate = Some(r)),
                "size" | "s" => parse_size(value).map(|s| config.declared_size = Some(s)),
                "par" | "aspect" => parse_rational(value).map(|r| config.pixel_aspect = Some(r)),
                "codec-options" => {
                    parse_codec_options(value).map(|o| config.codec_options.extend(o))
                }
                "x264-params" => {
                    config.x264_params = Some(value.to_string());
                    Ok(())
                }
                "x265-params" => {
                    config.x265_params = Some(value.to_string());
                    Ok(())
                }
                "clean-aperture" => {
                    parse_clean_aperture(value).map(|c| config.clean_aperture = Some(c))
                }
                _ => Err(anyhow!("unknown key")),
            };
            if let Err(e) = applied {
                config.issues.push(format!("{key}={value}: {e}"));
            }
        }

        if config.x264_params.is_some() && config.codec_kind() != CodecKind::X264 {
            config
                .issues
                .push(format!("x264-params ignored for codec {}", config.codec));
        }
        if config.x265_params.is_some() && config.codec_kind() != CodecKind::X265 {
            config
                .issues
                .push(format!("x265-params ignored for codec {}", config.codec));
        }

        for issue in &config.issues {
            log::warn!("VideoEncoderConfig: {}", issue);
        }
        Ok(config)
    }

    pub fn codec_kind(&self) -> CodecKind {
        CodecKind::from_codec_name(&self.codec)
    }

    /// The codec-private parameter string matching the codec family
    pub fn private_params(&self) -> Option<(&'static str, &str)> {
        match self.codec_kind() {
            CodecKind::X264 => self.x264_params.as_deref().map(|p| ("x264-params", p)),
            CodecKind::X265 => self.x265_params.as_deref().map(|p| ("x265-params", p)),
            CodecKind::Other => None,
        }
    }

    /// Display size: declared width stretched by the pixel aspect ratio
    pub fn natural_size(&self) -> Option<(f64, f64)> {
        let size = self.declared_size?;
        let aspect = self
            .pixel_aspect
            .and_then(|a| if a.is_valid() { a.to_f64() } else { None })
            .unwrap_or(1.0);
        Some((size.width as f64 * aspect, size.height as f64))
    }
}

/// Per-track processor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Filter graph description; no filter stage when absent
    pub filter: Option<String>,
    /// No encode stage when absent
    pub encoder: Option<VideoEncoderConfig>,
    /// Bound on samples accepted but not yet drained by the output side
    pub max_queued_input: usize,
    /// Delay before the first output sample is handed out
    pub initial_delay_ms: u64,
    /// Time scale for engine timestamps; the first sample's when absent
    pub media_time_scale: Option<i32>,
    /// A PTS step above this many frame durations counts as a gap
    pub gap_tolerance: f64,
    /// Back-off attempts when an encoder keeps refusing input
    pub again_retry_limit: u32,
    pub again_retry_delay_ms: u64,
    /// Interval after which a waiting output side reports a stall
    pub stall_watch_ms: Option<u64>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            filter: None,
            encoder: None,
            max_queued_input: 8,
            initial_delay_ms: 0,
            media_time_scale: None,
            gap_tolerance: 1.5,
            again_retry_limit: 16,
            again_retry_delay_ms: 2,
            stall_watch_ms: Some(2000),
        }
    }
}

impl ProcessorConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: ProcessorConfig =
            serde_json::from_str(json).context("Failed to parse processor configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_queued_input == 0 {
            bail!(PipelineError::Config("max_queued_input must be positive".into()));
        }
        if let Some(scale) = self.media_time_scale
            && scale <= 0
        {
            bail!(PipelineError::Config(format!("invalid media time scale {scale}")));
        }
        if self.filter.as_deref().is_some_and(|f| f.trim().is_empty()) {
            bail!(PipelineError::Config("empty filter description".into()));
        }
        Ok(())
    }

    /// True when neither a filter nor an encoder is configured
    pub fn is_passthrough(&self) -> bool {
        self.filter.is_none() && self.encoder.is_none()
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn again_retry_delay(&self) -> Duration {
        Duration::from_millis(self.again_retry_delay_ms)
    }

    pub fn stall_watch(&self) -> Option<Duration> {
        self.stall_watch_ms.map(Duration::from_millis)
    }
}

/// `WxH`
pub fn parse_size(value: &str) -> Result<Size> {
    let (w, h) = value
        .split_once(['x', 'X'])
        .ok_or_else(|| anyhow!("expected WxH"))?;
    let width: u32 = w.trim().parse().context("bad width")?;
    let height: u32 = h.trim().parse().context("bad height")?;
    if width == 0 || height == 0 {
        bail!("size must be positive");
    }
    Ok(Size { width, height })
}

/// `N:D`, `N/D` or a decimal number
pub fn parse_rational(value: &str) -> Result<Rational> {
    if let Some((n, d)) = value.split_once([':', '/']) {
        let num: i64 = n.trim().parse().context("bad numerator")?;
        let den: i64 = d.trim().parse().context("bad denominator")?;
        let r = Rational::new(num, den);
        if !r.is_valid() {
            bail!("rational must be positive");
        }
        return Ok(r);
    }

    let v: f64 = value.parse().context("bad number")?;
    if !(v.is_finite() && v > 0.0) {
        bail!("rational must be positive");
    }
    if v.fract() == 0.0 {
        return Ok(Rational::new(v as i64, 1));
    }
    // decimals are kept to millisecond precision
    Ok(Rational::new((v * 1000.0).round() as i64, 1000))
}

/// Bits per second with an optional decimal `k`/`M` suffix, e.g. `2.5M`
pub fn parse_bitrate(value: &str) -> Result<u64> {
    let (number, multiplier) = match value.char_indices().last() {
        Some((i, 'k' | 'K')) => (&value[..i], 1_000.0),
        Some((i, 'm' | 'M')) => (&value[..i], 1_000_000.0),
        _ => (value, 1.0),
    };
    let v: f64 = number.trim().parse().context("bad bit rate")?;
    if !(v.is_finite() && v > 0.0) {
        bail!("bit rate must be positive");
    }
    Ok((v * multiplier).round() as u64)
}

/// `key=value` pairs separated by `:` or `,`
pub fn parse_codec_options(value: &str) -> Result<BTreeMap<String, String>> {
    let mut options = BTreeMap::new();
    for pair in value.split([':', ',']).map(str::trim).filter(|p| !p.is_empty()) {
        let (k, v) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("expected key=value, got '{pair}'"))?;
        if k.trim().is_empty() {
            bail!("empty option name in '{pair}'");
        }
        options.insert(k.trim().to_string(), v.trim().to_string());
    }
    Ok(options)
}

/// `width:height:hOffset:vOffset`
pub fn parse_clean_aperture(value: &str) -> Result<CleanAperture> {
    let parts = value
        .split(':')
        .map(|p| p.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .context("bad clean aperture number")?;
    let [width, height, horizontal_offset, vertical_offset] = parts[..] else {
        bail!("expected width:height:hOffset:vOffset");
    };
    if width <= 0.0 || height <= 0.0 {
        bail!("clean aperture must have a positive size");
    }
    Ok(CleanAperture {
        width,
        height,
        horizontal_offset,
        vertical_offset,
    })
}
