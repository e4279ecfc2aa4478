//! FFmpeg-backed engines (libavfilter graphs and libavcodec encoders)

use ac_ffmpeg::codec::video::filter::VideoFilter;
use ac_ffmpeg::codec::video::frame::{PixelFormat as AvPixelFormat, get_pixel_format};
use ac_ffmpeg::codec::video::{VideoCodecParameters, VideoEncoder, VideoFrame, VideoFrameMut};
use ac_ffmpeg::codec::{Encoder, Filter};
use ac_ffmpeg::time::{TimeBase, Timestamp};
use anyhow::{Result, anyhow};
use bytes::Bytes;
use log::{debug, info};

use super::{
    EncoderEngine, EncoderInfo, EngineFactory, EngineFrame, EnginePacket, EngineStatus,
    FilterEngine, FrameFormat, FrameSlot,
};
use crate::config::VideoEncoderConfig;
use crate::convert::copy_plane;
use crate::error::PipelineError;
use crate::media::{PixelFormat, Rational};

fn time_base(rational: Rational) -> TimeBase {
    TimeBase::new(rational.num as i32, rational.den as i32)
}

fn rational(time_base: TimeBase) -> Rational {
    Rational::new(time_base.num() as i64, time_base.den() as i64)
}

fn from_av(format: AvPixelFormat) -> Option<PixelFormat> {
    PixelFormat::ALL
        .into_iter()
        .find(|f| get_pixel_format(f.engine_name()) == format)
}

/// Copy an engine frame into a new libav frame
fn to_av_frame(frame: &EngineFrame) -> Result<VideoFrame> {
    let format = frame.pixel_format();
    let tb = time_base(frame.time_base);
    let pts = frame
        .pts
        .map(|pts| Timestamp::new(pts, tb))
        .unwrap_or_else(Timestamp::null);
    let mut av = VideoFrameMut::black(
        get_pixel_format(format.engine_name()),
        frame.width() as usize,
        frame.height() as usize,
    )
    .with_time_base(tb)
    .with_pts(pts);

    let mut planes = av.planes_mut();
    for (i, source) in frame.planes().iter().enumerate() {
        let line_size = planes[i].line_size();
        let copied = copy_plane(
            &source.data,
            source.line_size,
            planes[i].data_mut(),
            line_size,
            format.row_bytes(i, frame.width()),
            format.rows(i, frame.height()),
        );
        if !copied {
            return Err(PipelineError::Conversion(format!("plane {i} does not fit libav frame")).into());
        }
    }
    drop(planes);
    Ok(av.freeze())
}

/// Copy a libav frame into the reused slot. Timing and aspect the graph does
/// not carry come from the last pushed frame.
fn from_av_frame(av: &VideoFrame, slot: &mut FrameSlot, last: &PushedFrame) -> Result<()> {
    let format = from_av(av.pixel_format())
        .ok_or_else(|| PipelineError::Unsupported("filter produced an unknown pixel format".into()))?;
    let (width, height) = (av.width() as u32, av.height() as u32);
    let frame = slot.prepare(format, width, height, rational(av.time_base()));

    let planes = av.planes();
    for i in 0..format.planes().len() {
        let source = &planes[i];
        let destination = &mut frame.planes_mut()[i];
        if !copy_plane(
            source.data(),
            source.line_size(),
            &mut destination.data,
            destination.line_size,
            format.row_bytes(i, width),
            format.rows(i, height),
        ) {
            slot.release();
            return Err(PipelineError::Conversion(format!("libav plane {i} is truncated")).into());
        }
    }
    let pts = av.pts();
    frame.pts = (!pts.is_null()).then(|| pts.timestamp());
    frame.duration = last.duration;
    frame.pixel_aspect = last.pixel_aspect;
    Ok(())
}

#[derive(Debug, Default, Clone, Copy)]
struct PushedFrame {
    duration: i64,
    pixel_aspect: Option<Rational>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegEngines;

impl EngineFactory for FfmpegEngines {
    fn open_filter(&self, description: &str, input: &FrameFormat) -> Result<Box<dyn FilterEngine>> {
        let parameters = VideoCodecParameters::builder("rawvideo")
            .map_err(|e| PipelineError::stage_open("FilterStage", e))?
            .pixel_format(get_pixel_format(input.pixel_format.engine_name()))
            .width(input.width as usize)
            .height(input.height as usize)
            .build();
        let filter = VideoFilter::builder(parameters, description)
            .map_err(|e| PipelineError::stage_open("FilterStage", e))?
            .input_time_base(time_base(input.time_base))
            .build()
            .map_err(|e| PipelineError::stage_open("FilterStage", e))?;
        debug!("FfmpegEngines: filter graph '{}' configured", description);
        Ok(Box::new(AvFilter {
            filter,
            format: *input,
            last: PushedFrame {
                duration: 0,
                pixel_aspect: input.pixel_aspect,
            },
            flushed: false,
        }))
    }

    fn open_encoder(
        &self,
        config: &VideoEncoderConfig,
        input: &FrameFormat,
    ) -> Result<Box<dyn EncoderEngine>> {
        let (width, height) = match config.declared_size {
            Some(size) => (size.width, size.height),
            None => (input.width, input.height),
        };
        if (width, height) != (input.width, input.height) {
            return Err(PipelineError::stage_open(
                "EncodeStage",
                format!(
                    "declared size {}x{} differs from frames {}x{}",
                    width, height, input.width, input.height
                ),
            )
            .into());
        }

        let tb = time_base(input.time_base);
        let mut builder = VideoEncoder::builder(&config.codec)
            .map_err(|e| PipelineError::stage_open("EncodeStage", e))?
            .pixel_format(get_pixel_format(input.pixel_format.engine_name()))
            .width(width as usize)
            .height(height as usize)
            .time_base(tb);
        if let Some(bit_rate) = config.bit_rate {
            builder = builder.set_option("b", bit_rate);
        }
        if let Some(rate) = config.frame_rate {
            builder = builder.set_option("framerate", rate);
        }
        if let Some(aspect) = config.pixel_aspect {
            builder = builder.set_option("aspect", aspect);
        }
        for (key, value) in &config.codec_options {
            builder = builder.set_option(key, value);
        }
        if let Some((key, value)) = config.private_params() {
            builder = builder.set_option(key, value);
        }
        let encoder = builder
            .build()
            .map_err(|e| PipelineError::stage_open("EncodeStage", e))?;

        let extradata = encoder
            .codec_parameters()
            .extradata()
            .map(Bytes::copy_from_slice);
        info!(
            "FfmpegEngines: encoder {} ready ({} bytes of extradata)",
            config.codec,
            extradata.as_ref().map_or(0, |e| e.len())
        );

        let frame_duration = config
            .frame_rate
            .filter(|r| r.is_valid())
            .map(|r| {
                crate::media::time::rescale_value(r.den, r.num as i32, input.time_base.den as i32)
            })
            .unwrap_or(0);

        Ok(Box::new(AvEncoder {
            encoder,
            flushed: false,
            frame_duration,
            info: EncoderInfo {
                codec_name: config.codec.clone(),
                extradata,
                time_base: input.time_base,
                width,
                height,
            },
        }))
    }
}

struct AvFilter {
    filter: VideoFilter,
    format: FrameFormat,
    last: PushedFrame,
    flushed: bool,
}

// libav contexts are only touched from the owning stage
unsafe impl Send for AvFilter {}

impl FilterEngine for AvFilter {
    fn push_frame(&mut self, frame: Option<&EngineFrame>) -> Result<EngineStatus> {
        let Some(frame) = frame else {
            if !self.flushed {
                self.filter.flush().map_err(|e| anyhow!("filter flush: {e}"))?;
                self.flushed = true;
            }
            return Ok(EngineStatus::Done);
        };
        match self.filter.try_push(to_av_frame(frame)?) {
            Ok(()) => {
                self.last = PushedFrame {
                    duration: frame.duration,
                    pixel_aspect: frame.pixel_aspect,
                };
                Ok(EngineStatus::Done)
            }
            Err(e) if e.is_again() => Ok(EngineStatus::Again),
            Err(e) => Err(PipelineError::stage("FilterStage", e).into()),
        }
    }

    fn pull_frame(&mut self, out: &mut FrameSlot) -> Result<EngineStatus> {
        match self.filter.take().map_err(|e| PipelineError::stage("FilterStage", e))? {
            Some(frame) => {
                from_av_frame(&frame, out, &self.last)?;
                if let Some(format) = from_av(frame.pixel_format()) {
                    self.format.pixel_format = format;
                    self.format.width = frame.width() as u32;
                    self.format.height = frame.height() as u32;
                }
                Ok(EngineStatus::Done)
            }
            None if self.flushed => Ok(EngineStatus::EndOfStream),
            None => Ok(EngineStatus::Again),
        }
    }

    fn output_format(&self) -> FrameFormat {
        self.format
    }
}

struct AvEncoder {
    encoder: VideoEncoder,
    flushed: bool,
    frame_duration: i64,
    info: EncoderInfo,
}

unsafe impl Send for AvEncoder {}

impl EncoderEngine for AvEncoder {
    fn send_frame(&mut self, slot: Option<&mut FrameSlot>) -> Result<EngineStatus> {
        let Some(slot) = slot else {
            if !self.flushed {
                self.encoder.flush().map_err(|e| anyhow!("encoder flush: {e}"))?;
                self.flushed = true;
            }
            return Ok(EngineStatus::Done);
        };
        let frame = match slot.lend() {
            Some(frame) => to_av_frame(frame)?,
            None => return Err(PipelineError::stage("EncodeStage", "empty frame slot").into()),
        };
        match self.encoder.try_push(frame) {
            Ok(()) => {
                // libav holds its own copy; the slot keeps its allocation
                slot.release();
                Ok(EngineStatus::Done)
            }
            Err(e) if e.is_again() => Ok(EngineStatus::Again),
            Err(e) => Err(PipelineError::stage("EncodeStage", e).into()),
        }
    }

    fn receive_packet(&mut self, packet: &mut EnginePacket) -> Result<EngineStatus> {
        match self.encoder.take().map_err(|e| PipelineError::stage("EncodeStage", e))? {
            Some(av) => {
                packet.unref();
                packet.set_data(av.data());
                let (pts, dts) = (av.pts(), av.dts());
                packet.pts = (!pts.is_null()).then(|| pts.timestamp());
                packet.dts = (!dts.is_null()).then(|| dts.timestamp());
                packet.duration = self.frame_duration;
                packet.time_base = self.info.time_base;
                packet.key = av.is_key();
                Ok(EngineStatus::Done)
            }
            None if self.flushed => Ok(EngineStatus::EndOfStream),
            None => Ok(EngineStatus::Again),
        }
    }

    fn info(&self) -> &EncoderInfo {
        &self.info
    }
}
