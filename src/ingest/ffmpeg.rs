//! FFmpeg backend.
//!
//! Decodes anything libavformat can open (files, HTTP progressive, HLS/DASH
//! manifests, RTSP, RTMP) into RGB24 and writes chunks as MPEG-4 Part 2 video in
//! an `.mp4` container. No audio is carried into chunks.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{FrameSink, FrameSource, MediaBackend, SinkFormat};
use crate::frame::{pack_rows, VideoFrame, BYTES_PER_PIXEL};
use crate::stream::SourceMetadata;

const MICROS_PER_SECOND: f64 = 1_000_000.0;
const CHUNK_BIT_RATE: usize = 2_000_000;

#[derive(Clone, Debug)]
pub struct FfmpegBackend {
    /// Network read timeout handed to libavformat.
    pub read_timeout: Duration,
}

impl Default for FfmpegBackend {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(10),
        }
    }
}

impl MediaBackend for FfmpegBackend {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn accepts(&self, url: &str) -> bool {
        !url.starts_with("stub://")
    }

    fn open_source(&self, url: &str) -> Result<Box<dyn FrameSource>> {
        Ok(Box::new(FfmpegSource::open(url, self.read_timeout)?))
    }

    fn open_sink(&self, path: &Path, format: &SinkFormat) -> Result<Box<dyn FrameSink>> {
        Ok(Box::new(Mp4Sink::create(path, format)?))
    }

    fn container_extension(&self) -> &'static str {
        "mp4"
    }
}

struct FfmpegSource {
    input: Option<ffmpeg::format::context::Input>,
    stream_index: usize,
    decoder: ffmpeg::decoder::Video,
    scaler: ffmpeg::software::scaling::context::Context,
    metadata: SourceMetadata,
    eof_sent: bool,
}

impl FfmpegSource {
    fn open(url: &str, read_timeout: Duration) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;

        let mut options = ffmpeg::Dictionary::new();
        options.set("rw_timeout", &read_timeout.as_micros().to_string());
        if url.starts_with("rtsp://") {
            options.set("rtsp_transport", "tcp");
        }
        let input = ffmpeg::format::input_with_dictionary(&url, options)
            .with_context(|| format!("ffmpeg could not open '{}'", url))?;

        let (stream_index, frame_rate, reported_frames, parameters) = {
            let stream = input
                .streams()
                .best(ffmpeg::media::Type::Video)
                .ok_or_else(|| anyhow!("source has no video track"))?;
            let rate = stream.avg_frame_rate();
            let frame_rate = if rate.denominator() != 0 {
                rate.numerator() as f64 / rate.denominator() as f64
            } else {
                0.0
            };
            (stream.index(), frame_rate, stream.frames(), stream.parameters())
        };

        // Containers that omit nb_frames still carry a duration for finite media;
        // live inputs report no duration at all.
        let mut total_frames = reported_frames;
        if total_frames <= 0 && input.duration() > 0 && frame_rate > 0.0 {
            total_frames = (input.duration() as f64 / MICROS_PER_SECOND * frame_rate).round() as i64;
        }

        let context = ffmpeg::codec::context::Context::from_parameters(parameters)
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        let metadata = SourceMetadata {
            frame_rate,
            width: decoder.width(),
            height: decoder.height(),
            total_frames,
        };
        log::info!(
            "FfmpegSource: opened {}x{} @ {:.2} fps, {} frames reported",
            metadata.width,
            metadata.height,
            metadata.frame_rate,
            metadata.total_frames
        );

        Ok(Self {
            input: Some(input),
            stream_index,
            decoder,
            scaler,
            metadata,
            eof_sent: false,
        })
    }
}

impl FrameSource for FfmpegSource {
    fn metadata(&self) -> SourceMetadata {
        self.metadata
    }

    fn read_frame(&mut self) -> Result<VideoFrame> {
        let input = self
            .input
            .as_mut()
            .ok_or_else(|| anyhow!("ffmpeg source is closed"))?;
        let mut decoded = ffmpeg::frame::Video::empty();

        loop {
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                return to_rgb_frame(&mut self.scaler, &decoded);
            }
            if self.eof_sent {
                return Err(anyhow!("end of stream"));
            }

            let mut packet = ffmpeg::Packet::empty();
            match packet.read(input) {
                Ok(()) => {
                    if packet.stream() != self.stream_index {
                        continue;
                    }
                    self.decoder
                        .send_packet(&packet)
                        .context("send packet to ffmpeg decoder")?;
                }
                Err(ffmpeg::Error::Eof) => {
                    self.decoder.send_eof().context("flush ffmpeg decoder")?;
                    self.eof_sent = true;
                }
                Err(err) => return Err(err).context("read packet"),
            }
        }
    }

    fn close(&mut self) {
        if self.input.take().is_some() {
            log::debug!("FfmpegSource: input closed");
        }
    }
}

fn to_rgb_frame(
    scaler: &mut ffmpeg::software::scaling::context::Context,
    decoded: &ffmpeg::frame::Video,
) -> Result<VideoFrame> {
    let mut rgb = ffmpeg::frame::Video::empty();
    scaler
        .run(decoded, &mut rgb)
        .context("scale frame to RGB")?;
    let pixels = pack_rows(rgb.data(0), rgb.stride(0), rgb.width(), rgb.height())?;
    VideoFrame::new(pixels, rgb.width(), rgb.height())
}

struct Mp4Sink {
    path: PathBuf,
    output: ffmpeg::format::context::Output,
    encoder: ffmpeg::encoder::video::Encoder,
    scaler: Option<(u32, u32, ffmpeg::software::scaling::context::Context)>,
    encoder_time_base: ffmpeg::Rational,
    stream_time_base: ffmpeg::Rational,
    width: u32,
    height: u32,
    next_pts: i64,
    finished: bool,
}

impl Mp4Sink {
    fn create(path: &Path, format: &SinkFormat) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;

        let mut output = ffmpeg::format::output(&path)
            .with_context(|| format!("create chunk container {}", path.display()))?;
        let codec = ffmpeg::encoder::find(ffmpeg::codec::Id::MPEG4)
            .ok_or_else(|| anyhow!("mpeg4 encoder is not available"))?;
        let global_header = output
            .format()
            .flags()
            .contains(ffmpeg::format::Flags::GLOBAL_HEADER);

        // yuv420p needs even dimensions
        let width = (format.width & !1).max(2);
        let height = (format.height & !1).max(2);
        let fps = format.frame_rate.round().clamp(1.0, 240.0) as i32;
        let encoder_time_base = ffmpeg::Rational::new(1, fps);

        let encoder = {
            let mut stream = output.add_stream(codec).context("add chunk video stream")?;
            let mut encoder = ffmpeg::codec::context::Context::new_with_codec(codec)
                .encoder()
                .video()
                .context("create mpeg4 encoder")?;
            encoder.set_width(width);
            encoder.set_height(height);
            encoder.set_format(ffmpeg::util::format::pixel::Pixel::YUV420P);
            encoder.set_time_base(encoder_time_base);
            encoder.set_frame_rate(Some(ffmpeg::Rational::new(fps, 1)));
            encoder.set_bit_rate(CHUNK_BIT_RATE);
            if global_header {
                encoder.set_flags(ffmpeg::codec::Flags::GLOBAL_HEADER);
            }
            let encoder = encoder.open_as(codec).context("open mpeg4 encoder")?;
            stream.set_parameters(&encoder);
            stream.set_time_base(encoder_time_base);
            encoder
        };

        output
            .write_header()
            .with_context(|| format!("write container header {}", path.display()))?;
        let stream_time_base = output
            .stream(0)
            .ok_or_else(|| anyhow!("chunk container lost its video stream"))?
            .time_base();

        Ok(Self {
            path: path.to_path_buf(),
            output,
            encoder,
            scaler: None,
            encoder_time_base,
            stream_time_base,
            width,
            height,
            next_pts: 0,
            finished: false,
        })
    }

    fn drain_packets(&mut self) -> Result<()> {
        let mut packet = ffmpeg::Packet::empty();
        while self.encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(0);
            packet.rescale_ts(self.encoder_time_base, self.stream_time_base);
            packet
                .write_interleaved(&mut self.output)
                .context("write chunk packet")?;
        }
        Ok(())
    }

    fn scaler_for(&mut self, width: u32, height: u32) -> Result<&mut ffmpeg::software::scaling::context::Context> {
        let stale = !matches!(&self.scaler, Some((w, h, _)) if *w == width && *h == height);
        if stale {
            let scaler = ffmpeg::software::scaling::context::Context::get(
                ffmpeg::util::format::pixel::Pixel::RGB24,
                width,
                height,
                ffmpeg::util::format::pixel::Pixel::YUV420P,
                self.width,
                self.height,
                ffmpeg::software::scaling::flag::Flags::BILINEAR,
            )
            .context("create chunk scaler")?;
            self.scaler = Some((width, height, scaler));
        }
        match self.scaler.as_mut() {
            Some((_, _, scaler)) => Ok(scaler),
            None => Err(anyhow!("chunk scaler missing")),
        }
    }
}

impl FrameSink for Mp4Sink {
    fn path(&self) -> &Path {
        &self.path
    }

    fn write_frame(&mut self, frame: &VideoFrame) -> Result<()> {
        if self.finished {
            return Err(anyhow!("chunk sink already finished"));
        }

        let mut rgb = ffmpeg::frame::Video::new(
            ffmpeg::util::format::pixel::Pixel::RGB24,
            frame.width,
            frame.height,
        );
        let stride = rgb.stride(0);
        let row_bytes = frame.width as usize * BYTES_PER_PIXEL;
        {
            let plane = rgb.data_mut(0);
            for row in 0..frame.height as usize {
                let src = frame
                    .row(row)
                    .ok_or_else(|| anyhow!("frame row {} is out of bounds", row))?;
                let start = row * stride;
                plane
                    .get_mut(start..start + row_bytes)
                    .ok_or_else(|| anyhow!("ffmpeg frame row {} is out of bounds", row))?
                    .copy_from_slice(src);
            }
        }

        let mut yuv = ffmpeg::frame::Video::empty();
        self.scaler_for(frame.width, frame.height)?
            .run(&rgb, &mut yuv)
            .context("scale frame to YUV")?;
        yuv.set_pts(Some(self.next_pts));
        self.next_pts += 1;

        self.encoder
            .send_frame(&yuv)
            .context("send frame to mpeg4 encoder")?;
        self.drain_packets()
    }

    fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.encoder.send_eof().context("flush mpeg4 encoder")?;
        self.drain_packets()?;
        self.output
            .write_trailer()
            .with_context(|| format!("write container trailer {}", self.path.display()))?;
        Ok(())
    }
}

impl Drop for Mp4Sink {
    fn drop(&mut self) {
        if let Err(err) = self.finish() {
            log::warn!("chunk {} not finalized: {:#}", self.path.display(), err);
        }
    }
}
