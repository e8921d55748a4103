//! Synthetic backend for `stub://` URLs.
//!
//! The host part of the URL picks the behaviour:
//! - `stub://live`: unbounded stream (reports zero frames)
//! - `stub://vod?frames=N`: finite stream, reads fail once N frames were produced
//! - `stub://dead`: opens fine but never decodes a frame
//! - `stub://unopenable`: open always fails
//!
//! Query parameters: `fps` (default 30), `width`/`height` (default 64x48),
//! `realtime` (default 1; 0 disables frame pacing), `stall_after` (live only,
//! reads fail after this many frames).
//!
//! Chunks are written as raw concatenated RGB24 frames.

use anyhow::{anyhow, Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use url::Url;

use super::{FrameSink, FrameSource, MediaBackend, SinkFormat};
use crate::frame::{VideoFrame, BYTES_PER_PIXEL};
use crate::stream::SourceMetadata;

const SCHEME_PREFIX: &str = "stub://";
const MIN_FPS: f64 = 0.01;
const MAX_FPS: f64 = 1000.0;

#[derive(Clone, Copy, Debug, Default)]
pub struct SyntheticBackend;

impl SyntheticBackend {
    pub const NAME: &'static str = "synthetic";
}

impl MediaBackend for SyntheticBackend {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn accepts(&self, url: &str) -> bool {
        url.starts_with(SCHEME_PREFIX)
    }

    fn open_source(&self, url: &str) -> Result<Box<dyn FrameSource>> {
        let config = SyntheticConfig::parse(url)?;
        if config.kind == SyntheticKind::Unopenable {
            return Err(anyhow!("synthetic source {} refuses to open", url));
        }
        log::info!("SyntheticSource: connected to {}", url);
        Ok(Box::new(SyntheticSource::new(config)))
    }

    fn open_sink(&self, path: &Path, format: &SinkFormat) -> Result<Box<dyn FrameSink>> {
        Ok(Box::new(RawFrameSink::create(path, format)?))
    }

    fn container_extension(&self) -> &'static str {
        "rgb"
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SyntheticKind {
    Live,
    Vod,
    Dead,
    Unopenable,
}

#[derive(Clone, Debug)]
struct SyntheticConfig {
    kind: SyntheticKind,
    fps: f64,
    width: u32,
    height: u32,
    total_frames: u64,
    realtime: bool,
    stall_after: Option<u64>,
}

impl SyntheticConfig {
    fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).with_context(|| format!("parse synthetic url '{}'", raw))?;
        let kind = match url.host_str().unwrap_or_default() {
            "live" => SyntheticKind::Live,
            "vod" => SyntheticKind::Vod,
            "dead" => SyntheticKind::Dead,
            "unopenable" => SyntheticKind::Unopenable,
            other => return Err(anyhow!("unknown synthetic stream kind '{}'", other)),
        };

        let mut config = Self {
            kind,
            fps: 30.0,
            width: 64,
            height: 48,
            total_frames: 300,
            realtime: true,
            stall_after: None,
        };
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "fps" => config.fps = parse_param(&key, &value)?,
                "width" => config.width = parse_param(&key, &value)?,
                "height" => config.height = parse_param(&key, &value)?,
                "frames" => config.total_frames = parse_param(&key, &value)?,
                "realtime" => config.realtime = value != "0" && value != "false",
                "stall_after" => config.stall_after = Some(parse_param(&key, &value)?),
                _ => log::debug!("ignoring synthetic url parameter {}", key),
            }
        }
        if config.width == 0 || config.height == 0 {
            return Err(anyhow!("synthetic frame size must be non-zero"));
        }
        if !(config.fps.is_finite() && (MIN_FPS..=MAX_FPS).contains(&config.fps)) {
            return Err(anyhow!(
                "synthetic fps must be between {} and {}, got {}",
                MIN_FPS,
                MAX_FPS,
                config.fps
            ));
        }
        Ok(config)
    }
}

fn parse_param<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow!("invalid synthetic url parameter {}={}", key, value))
}

struct SyntheticSource {
    config: SyntheticConfig,
    frame_count: u64,
    started_at: Instant,
    closed: bool,
}

impl SyntheticSource {
    fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            frame_count: 0,
            started_at: Instant::now(),
            closed: false,
        }
    }

    fn exhausted(&self) -> bool {
        match self.config.kind {
            SyntheticKind::Vod => self.frame_count >= self.config.total_frames,
            SyntheticKind::Live => self
                .config
                .stall_after
                .is_some_and(|limit| self.frame_count >= limit),
            SyntheticKind::Dead | SyntheticKind::Unopenable => true,
        }
    }

    /// Sleep until the next frame is due so the stream plays at its frame rate.
    fn pace(&self) {
        if !self.config.realtime {
            return;
        }
        let due = Duration::from_secs_f64(self.frame_count as f64 / self.config.fps);
        let elapsed = self.started_at.elapsed();
        if due > elapsed {
            std::thread::sleep(due - elapsed);
        }
    }

    fn generate_pixels(&self) -> Vec<u8> {
        let pixel_count = self.config.width as usize * self.config.height as usize * BYTES_PER_PIXEL;
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count) % 256) as u8;
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    fn metadata(&self) -> SourceMetadata {
        let total_frames = match self.config.kind {
            SyntheticKind::Vod => self.config.total_frames as i64,
            _ => 0,
        };
        SourceMetadata {
            frame_rate: self.config.fps,
            width: self.config.width,
            height: self.config.height,
            total_frames,
        }
    }

    fn read_frame(&mut self) -> Result<VideoFrame> {
        if self.closed {
            return Err(anyhow!("synthetic source is closed"));
        }
        if self.exhausted() {
            return Err(anyhow!("synthetic source has no more frames"));
        }
        self.pace();
        let pixels = self.generate_pixels();
        self.frame_count += 1;
        VideoFrame::new(pixels, self.config.width, self.config.height)
    }

    fn close(&mut self) {
        if !self.closed {
            log::debug!(
                "SyntheticSource: closed after {} frames",
                self.frame_count
            );
            self.closed = true;
        }
    }
}

/// Writes frames back to back as raw RGB24.
struct RawFrameSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    width: u32,
    height: u32,
}

impl RawFrameSink {
    fn create(path: &Path, format: &SinkFormat) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("create chunk file {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Some(BufWriter::new(file)),
            width: format.width,
            height: format.height,
        })
    }
}

impl FrameSink for RawFrameSink {
    fn path(&self) -> &Path {
        &self.path
    }

    fn write_frame(&mut self, frame: &VideoFrame) -> Result<()> {
        if frame.width != self.width || frame.height != self.height {
            return Err(anyhow!(
                "frame is {}x{}, sink expects {}x{}",
                frame.width,
                frame.height,
                self.width,
                self.height
            ));
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| anyhow!("chunk sink already finished"))?;
        writer.write_all(frame.pixels()).context("write raw frame")?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().context("flush raw chunk")?;
        }
        Ok(())
    }
}

impl Drop for RawFrameSink {
    fn drop(&mut self) {
        if let Err(err) = self.finish() {
            log::warn!("raw chunk {} not flushed: {:#}", self.path.display(), err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vod_source_reports_frame_count_and_exhausts() -> Result<()> {
        let mut source = SyntheticBackend.open_source("stub://vod?frames=3&fps=30&realtime=0")?;
        let meta = source.metadata();
        assert_eq!(meta.total_frames, 3);
        assert_eq!(meta.frame_rate, 30.0);

        for _ in 0..3 {
            source.read_frame()?;
        }
        assert!(source.read_frame().is_err());
        Ok(())
    }

    #[test]
    fn live_source_reports_zero_frames() -> Result<()> {
        let mut source =
            SyntheticBackend.open_source("stub://live?width=8&height=4&realtime=0")?;
        assert_eq!(source.metadata().total_frames, 0);
        let frame = source.read_frame()?;
        assert_eq!((frame.width, frame.height), (8, 4));
        assert_eq!(frame.byte_len(), 8 * 4 * 3);
        Ok(())
    }

    #[test]
    fn dead_and_unopenable_sources() {
        let mut dead = SyntheticBackend
            .open_source("stub://dead")
            .expect("dead source opens");
        assert!(dead.read_frame().is_err());
        assert!(SyntheticBackend.open_source("stub://unopenable").is_err());
        assert!(SyntheticBackend.open_source("stub://bogus").is_err());
    }

    #[test]
    fn rejects_unusable_frame_rates() {
        for fps in ["NaN", "inf", "0", "-5", "1e-300", "1e9"] {
            let url = format!("stub://live?fps={fps}");
            assert!(SyntheticBackend.open_source(&url).is_err(), "fps={fps} accepted");
        }
        assert!(SyntheticBackend.open_source("stub://live?fps=0.5").is_ok());
    }

    #[test]
    fn close_is_idempotent() -> Result<()> {
        let mut source = SyntheticBackend.open_source("stub://live?realtime=0")?;
        source.close();
        source.close();
        assert!(source.read_frame().is_err());
        Ok(())
    }

    #[test]
    fn raw_sink_writes_frames() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("chunk.rgb");
        let format = SinkFormat {
            frame_rate: 30.0,
            width: 4,
            height: 2,
        };
        let mut sink = SyntheticBackend.open_sink(&path, &format)?;
        let frame = VideoFrame::new(vec![7u8; 4 * 2 * 3], 4, 2)?;
        sink.write_frame(&frame)?;
        sink.write_frame(&frame)?;
        sink.finish()?;
        sink.finish()?;
        assert_eq!(std::fs::metadata(&path)?.len(), 48);

        let wrong = VideoFrame::new(vec![0u8; 3], 1, 1)?;
        assert!(sink.write_frame(&wrong).is_err());
        Ok(())
    }
}
