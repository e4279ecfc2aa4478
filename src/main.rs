use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Arg, ArgAction, ArgMatches, Command};
use log::info;
use std::collections::BTreeMap;
use std::sync::Arc;

use trackflow::config::{ProcessorConfig, VideoEncoderConfig, parse_rational, parse_size};
use trackflow::engine::EngineFactory;
use trackflow::media::{
    ColorMetadata, FormatDescription, MediaKind, MediaTime, PixelBuffer, PixelFormat, Rational,
    SampleBuffer,
};
use trackflow::pipeline::{CollectingConsumer, ProgressReporter, Session, VecProducer};
use trackflow::Processor;

/// Encoder option flags forwarded verbatim to `VideoEncoderConfig::from_params`
const ENCODER_FLAGS: &[&str] = &[
    "codec",
    "bitrate",
    "codec-options",
    "x264-params",
    "x265-params",
    "clean-aperture",
];

fn engines() -> Arc<dyn EngineFactory> {
    #[cfg(feature = "ffmpeg")]
    {
        Arc::new(trackflow::engine::ffmpeg::FfmpegEngines)
    }
    #[cfg(not(feature = "ffmpeg"))]
    {
        Arc::new(trackflow::engine::builtin::BuiltinEngines)
    }
}

fn cli() -> Command {
    let mut command = Command::new(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about("Run a synthetic video track and a passthrough data track through the pipeline")
        .arg(
            Arg::new("frames")
                .short('n')
                .long("frames")
                .value_name("COUNT")
                .value_parser(clap::value_parser!(u32))
                .default_value("120"),
        )
        .arg(
            Arg::new("size")
                .short('s')
                .long("size")
                .value_name("WxH")
                .default_value("320x240"),
        )
        .arg(
            Arg::new("fps")
                .short('r')
                .long("fps")
                .value_name("RATE")
                .help("Frame rate (N:D, N/D or decimal)")
                .default_value("30000/1001"),
        )
        .arg(
            Arg::new("filter")
                .short('f')
                .long("filter")
                .value_name("GRAPH")
                .help("Filter graph description"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .help("JSON processor configuration; flags override it"),
        )
        .arg(
            Arg::new("progress")
                .long("progress")
                .action(ArgAction::SetTrue)
                .help("Log progress for every written sample"),
        );
    for flag in ENCODER_FLAGS {
        command = command.arg(Arg::new(*flag).long(*flag).value_name("VALUE"));
    }
    command
}

fn processor_config(matches: &ArgMatches, size: (u32, u32), fps: Rational) -> Result<ProcessorConfig> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {path}"))?;
            ProcessorConfig::from_json(&json)?
        }
        None => ProcessorConfig::default(),
    };

    if let Some(filter) = matches.get_one::<String>("filter") {
        config.filter = Some(filter.clone());
    }

    let mut params: BTreeMap<String, String> = ENCODER_FLAGS
        .iter()
        .filter_map(|flag| {
            matches
                .get_one::<String>(flag)
                .map(|value| (flag.to_string(), value.clone()))
        })
        .collect();
    if !params.is_empty() {
        params.insert("frame-rate".into(), fps.to_string());
        params.insert("size".into(), format!("{}x{}", size.0, size.1));
        config.encoder = Some(VideoEncoderConfig::from_params(&params)?);
    }
    config.validate()?;
    Ok(config)
}

/// Moving luma ramp over neutral chroma
fn synthetic_video(count: u32, width: u32, height: u32, fps: Rational) -> Vec<SampleBuffer> {
    let timescale = fps.num.clamp(1, i32::MAX as i64) as i32;
    let format = Arc::new(
        FormatDescription::raw_video(PixelFormat::Yuv420p, width, height)
            .with_color(ColorMetadata::BT709),
    );
    (0..count as i64)
        .map(|index| {
            let mut pixels = PixelBuffer::new(PixelFormat::Yuv420p, width, height);
            let stride = pixels.stride(0);
            for (i, byte) in pixels.planes_mut()[0].data.iter_mut().enumerate() {
                let x = (i % stride) as i64;
                *byte = ((x + index * 4) % 220 + 16) as u8;
            }
            for plane in &mut pixels.planes_mut()[1..] {
                plane.data.fill(128);
            }
            pixels.color = ColorMetadata::BT709;
            SampleBuffer::image(
                Arc::new(pixels),
                format.clone(),
                MediaTime::new(index * fps.den, timescale),
                MediaTime::new(fps.den, timescale),
            )
        })
        .collect()
}

/// One timecode sample per frame
fn synthetic_timecode(count: u32, fps: Rational) -> Vec<SampleBuffer> {
    let timescale = fps.num.clamp(1, i32::MAX as i64) as i32;
    let format = Arc::new(FormatDescription::compressed(MediaKind::Other, "tmcd"));
    (0..count as i64)
        .map(|index| {
            SampleBuffer::compressed(
                Bytes::copy_from_slice(&(index as u32).to_be_bytes()),
                format.clone(),
                MediaTime::new(index * fps.den, timescale),
                None,
                MediaTime::new(fps.den, timescale),
                true,
            )
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let matches = cli().get_matches();
    let frames = matches.get_one::<u32>("frames").copied().unwrap_or(120);
    let size = matches
        .get_one::<String>("size")
        .map(|s| parse_size(s))
        .transpose()?
        .map(|s| (s.width, s.height))
        .unwrap_or((320, 240));
    let fps = matches
        .get_one::<String>("fps")
        .map(|r| parse_rational(r))
        .transpose()?
        .unwrap_or(Rational::new(30000, 1001));

    let config = processor_config(&matches, size, fps)?;
    if let Some(encoder) = &config.encoder
        && let Some((width, height)) = encoder.natural_size()
    {
        info!("trackflow: natural size {:.0}x{:.0}", width, height);
    }
    let processor = Processor::new("video", config, engines())?;

    let video = synthetic_video(frames, size.0, size.1, fps);
    let timecode = synthetic_timecode(frames, fps);
    let end = video
        .last()
        .map(|s| s.pts().add(s.duration()))
        .unwrap_or(MediaTime::zero(600));

    let mut session = Session::new();
    if matches.get_flag("progress") {
        let reporter = ProgressReporter::new(
            MediaTime::zero(end.timescale),
            end,
            Box::new(|p| {
                info!(
                    "progress: track {} [{}] {} pts {:.3}s {:.1}% ({} samples)",
                    p.track, p.tag, p.media_kind, p.pts_seconds, p.percent, p.count
                )
            }),
        );
        session = session.with_progress(Arc::new(reporter));
    }

    let cancel = session.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let video_out = CollectingConsumer::new();
    session.add_processed(
        1,
        Arc::new(VecProducer::new(MediaKind::Video, video)),
        processor.clone(),
        Arc::new(video_out.clone()),
    );
    session.add_passthrough(
        2,
        Arc::new(VecProducer::new(MediaKind::Other, timecode)),
        Arc::new(CollectingConsumer::new()),
    );

    let report = session.run().await?;
    if let Some(format) = processor.output_format() {
        info!(
            "trackflow: output {:?} {}x{}",
            format.codec, format.width, format.height
        );
    }
    let bytes: usize = video_out.samples().iter().map(|s| s.size()).sum();
    info!("trackflow: {} video samples, {} bytes", video_out.len(), bytes);

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoder_flags_become_params() {
        let matches = cli()
            .try_get_matches_from([
                "trackflow",
                "--codec",
                "libx264",
                "--bitrate",
                "2M",
                "--x264-params",
                "keyint=60",
            ])
            .unwrap();
        let config = processor_config(&matches, (320, 240), Rational::new(30000, 1001)).unwrap();
        let encoder = config.encoder.unwrap();
        assert_eq!(encoder.codec, "libx264");
        assert_eq!(encoder.bit_rate, Some(2_000_000));
        assert_eq!(encoder.x264_params.as_deref(), Some("keyint=60"));
        assert_eq!(encoder.frame_rate, Some(Rational::new(30000, 1001)));
        assert!(encoder.issues.is_empty());
    }

    #[test]
    fn test_no_encoder_flags_means_no_encoder() {
        let matches = cli().try_get_matches_from(["trackflow", "--filter", "vflip"]).unwrap();
        let config = processor_config(&matches, (320, 240), Rational::new(30, 1)).unwrap();
        assert!(config.encoder.is_none());
        assert_eq!(config.filter.as_deref(), Some("vflip"));
    }
}
