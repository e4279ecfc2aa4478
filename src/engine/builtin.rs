//! Pure-Rust engines available without FFmpeg
//!
//! Filters: `null` and `vflip`, chainable with `,`. Encoder: `rawvideo`,
//! which packs the visible rows of each frame into one key packet.

use anyhow::{Result, bail};
use std::collections::VecDeque;

use super::{
    EncoderEngine, EncoderInfo, EngineFactory, EngineFrame, EnginePacket, EngineStatus,
    FilterEngine, FrameFormat, FrameSlot,
};
use crate::config::VideoEncoderConfig;
use crate::error::PipelineError;
use crate::media::Rational;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Null,
    VFlip,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinEngines;

impl EngineFactory for BuiltinEngines {
    fn open_filter(&self, description: &str, input: &FrameFormat) -> Result<Box<dyn FilterEngine>> {
        let mut ops = Vec::new();
        for name in description.split(',').map(str::trim) {
            match name {
                "null" | "copy" => ops.push(Op::Null),
                "vflip" => ops.push(Op::VFlip),
                other => bail!(PipelineError::stage_open(
                    "FilterStage",
                    format!("unknown filter '{other}'")
                )),
            }
        }
        log::debug!("BuiltinFilter: opened '{}' for {:?}", description, input);
        Ok(Box::new(BuiltinFilter {
            ops,
            format: *input,
            queue: VecDeque::new(),
            eof: false,
        }))
    }

    fn open_encoder(
        &self,
        config: &VideoEncoderConfig,
        input: &FrameFormat,
    ) -> Result<Box<dyn EncoderEngine>> {
        if config.codec != "rawvideo" {
            bail!(PipelineError::stage_open(
                "EncodeStage",
                format!("encoder '{}' not available without FFmpeg", config.codec)
            ));
        }
        if let Some(size) = config.declared_size
            && (size.width != input.width || size.height != input.height)
        {
            bail!(PipelineError::stage_open(
                "EncodeStage",
                format!(
                    "rawvideo cannot scale {}x{} to {}x{}",
                    input.width, input.height, size.width, size.height
                )
            ));
        }
        Ok(Box::new(RawVideoEncoder {
            info: EncoderInfo {
                codec_name: "rawvideo".into(),
                extradata: None,
                time_base: input.time_base,
                width: input.width,
                height: input.height,
            },
            pending: None,
            flushed: false,
        }))
    }
}

struct BuiltinFilter {
    ops: Vec<Op>,
    format: FrameFormat,
    queue: VecDeque<EngineFrame>,
    eof: bool,
}

impl BuiltinFilter {
    fn apply(&self, frame: &EngineFrame) -> EngineFrame {
        let mut out = frame.clone();
        for op in &self.ops {
            if *op == Op::VFlip {
                vflip(&mut out);
            }
        }
        out
    }
}

fn vflip(frame: &mut EngineFrame) {
    let format = frame.pixel_format();
    let height = frame.height();
    for (i, plane) in frame.planes_mut().iter_mut().enumerate() {
        let rows = format.rows(i, height);
        let line = plane.line_size;
        for r in 0..rows / 2 {
            let (top, bottom) = plane.data.split_at_mut((rows - 1 - r) * line);
            top[r * line..(r + 1) * line].swap_with_slice(&mut bottom[..line]);
        }
    }
}

impl FilterEngine for BuiltinFilter {
    fn push_frame(&mut self, frame: Option<&EngineFrame>) -> Result<EngineStatus> {
        if self.eof {
            bail!(PipelineError::stage("FilterStage", "push after end of stream"));
        }
        match frame {
            Some(frame) => {
                let filtered = self.apply(frame);
                self.queue.push_back(filtered);
            }
            None => self.eof = true,
        }
        Ok(EngineStatus::Done)
    }

    fn pull_frame(&mut self, out: &mut FrameSlot) -> Result<EngineStatus> {
        match self.queue.pop_front() {
            Some(frame) => {
                out.store(frame);
                Ok(EngineStatus::Done)
            }
            None if self.eof => Ok(EngineStatus::EndOfStream),
            None => Ok(EngineStatus::Again),
        }
    }

    fn output_format(&self) -> FrameFormat {
        self.format
    }
}

/// Packed payload waiting to be received
struct RawPacket {
    data: Vec<u8>,
    pts: Option<i64>,
    duration: i64,
    time_base: Rational,
}

struct RawVideoEncoder {
    info: EncoderInfo,
    pending: Option<RawPacket>,
    flushed: bool,
}

fn pack_rows(frame: &EngineFrame) -> Vec<u8> {
    let format = frame.pixel_format();
    let mut data = Vec::new();
    for plane in 0..frame.planes().len() {
        for row in 0..format.rows(plane, frame.height()) {
            data.extend_from_slice(frame.row(plane, row));
        }
    }
    data
}

impl EncoderEngine for RawVideoEncoder {
    fn send_frame(&mut self, slot: Option<&mut FrameSlot>) -> Result<EngineStatus> {
        if self.flushed {
            bail!(PipelineError::stage("EncodeStage", "send after flush"));
        }
        let Some(slot) = slot else {
            self.flushed = true;
            return Ok(EngineStatus::Done);
        };
        if self.pending.is_some() {
            return Ok(EngineStatus::Again);
        }
        let Some(frame) = slot.lend() else {
            bail!(PipelineError::stage("EncodeStage", "empty frame slot"));
        };
        self.pending = Some(RawPacket {
            data: pack_rows(frame),
            pts: frame.pts,
            duration: frame.duration,
            time_base: frame.time_base,
        });
        slot.release();
        Ok(EngineStatus::Done)
    }

    fn receive_packet(&mut self, packet: &mut EnginePacket) -> Result<EngineStatus> {
        let Some(raw) = self.pending.take() else {
            return Ok(if self.flushed {
                EngineStatus::EndOfStream
            } else {
                EngineStatus::Again
            });
        };

        packet.unref();
        packet.set_data(&raw.data);
        packet.pts = raw.pts;
        packet.dts = raw.pts;
        packet.duration = raw.duration;
        packet.time_base = raw.time_base;
        packet.key = true;
        Ok(EngineStatus::Done)
    }

    fn info(&self) -> &EncoderInfo {
        &self.info
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::PixelFormat;

    fn format() -> FrameFormat {
        FrameFormat {
            pixel_format: PixelFormat::Gray8,
            width: 2,
            height: 3,
            time_base: Rational::new(1, 600),
            pixel_aspect: None,
        }
    }

    #[test]
    fn test_vflip_filter() {
        let mut filter = BuiltinEngines.open_filter("null, vflip", &format()).unwrap();
        let mut frame = EngineFrame::alloc(PixelFormat::Gray8, 2, 3, Rational::new(1, 600));
        for r in 0..3 {
            frame.row_mut(0, r).fill(r as u8);
        }

        let mut out = FrameSlot::new();
        assert_eq!(filter.pull_frame(&mut out).unwrap(), EngineStatus::Again);
        filter.push_frame(Some(&frame)).unwrap();
        assert_eq!(filter.pull_frame(&mut out).unwrap(), EngineStatus::Done);
        let flipped = out.lend().unwrap();
        assert_eq!(flipped.row(0, 0), &[2, 2]);
        assert_eq!(flipped.row(0, 2), &[0, 0]);

        filter.push_frame(None).unwrap();
        assert_eq!(filter.pull_frame(&mut out).unwrap(), EngineStatus::EndOfStream);
        assert!(filter.push_frame(Some(&frame)).is_err());
    }

    #[test]
    fn test_unknown_filter_fails_to_open() {
        assert!(BuiltinEngines.open_filter("scale=1:1", &format()).is_err());
        assert!(
            BuiltinEngines
                .open_encoder(&VideoEncoderConfig::new("libx264"), &format())
                .is_err()
        );
    }

    #[test]
    fn test_rawvideo_backpressure() {
        let mut encoder = BuiltinEngines
            .open_encoder(&VideoEncoderConfig::new("rawvideo"), &format())
            .unwrap();
        let mut slot = FrameSlot::new();
        let frame = slot.prepare(PixelFormat::Gray8, 2, 3, Rational::new(1, 600));
        frame.pts = Some(5);
        let allocation = frame.planes()[0].data.as_ptr();
        assert_eq!(encoder.send_frame(Some(&mut slot)).unwrap(), EngineStatus::Done);
        assert!(!slot.is_referenced());

        let frame = slot.prepare(PixelFormat::Gray8, 2, 3, Rational::new(1, 600));
        frame.pts = Some(6);
        assert_eq!(frame.planes()[0].data.as_ptr(), allocation);
        assert_eq!(encoder.send_frame(Some(&mut slot)).unwrap(), EngineStatus::Again);
        assert!(slot.is_referenced());

        let mut packet = EnginePacket::new();
        assert_eq!(encoder.receive_packet(&mut packet).unwrap(), EngineStatus::Done);
        assert_eq!(packet.data().len(), 6);
        assert_eq!(packet.pts, Some(5));
        assert_eq!(encoder.receive_packet(&mut packet).unwrap(), EngineStatus::Again);

        assert_eq!(encoder.send_frame(Some(&mut slot)).unwrap(), EngineStatus::Done);
        encoder.send_frame(None).unwrap();
        assert_eq!(encoder.receive_packet(&mut packet).unwrap(), EngineStatus::Done);
        assert_eq!(packet.pts, Some(6));
        assert_eq!(
            encoder.receive_packet(&mut packet).unwrap(),
            EngineStatus::EndOfStream
        );
    }
}
