//! GStreamer backend.
//!
//! Decodes through `uridecodebin ! videoconvert ! appsink` and hands RGB24
//! frames to the recorder. Used as the fallback decoder when FFmpeg cannot open
//! a source; it does not write chunks itself.

use anyhow::{anyhow, Context, Result};
use gstreamer::prelude::*;
use std::path::Path;
use std::time::Duration;

use super::{FrameSink, FrameSource, MediaBackend, SinkFormat};
use crate::frame::{pack_rows, VideoFrame};
use crate::stream::SourceMetadata;

#[derive(Clone, Debug)]
pub struct GstreamerBackend {
    /// How long to wait for the pipeline to preroll its first sample.
    pub preroll_timeout: Duration,
    /// How long a single frame pull may block.
    pub frame_timeout: Duration,
}

impl Default for GstreamerBackend {
    fn default() -> Self {
        Self {
            preroll_timeout: Duration::from_secs(10),
            frame_timeout: Duration::from_secs(2),
        }
    }
}

impl MediaBackend for GstreamerBackend {
    fn name(&self) -> &'static str {
        "gstreamer"
    }

    fn accepts(&self, url: &str) -> bool {
        !url.starts_with("stub://")
    }

    fn open_source(&self, url: &str) -> Result<Box<dyn FrameSource>> {
        Ok(Box::new(GstreamerSource::open(url, self)?))
    }

    fn open_sink(&self, _path: &Path, _format: &SinkFormat) -> Result<Box<dyn FrameSink>> {
        Err(anyhow!("gstreamer backend does not write chunks"))
    }

    fn container_extension(&self) -> &'static str {
        "mp4"
    }

    fn writes_chunks(&self) -> bool {
        false
    }
}

struct GstreamerSource {
    pipeline: Option<gstreamer::Pipeline>,
    appsink: gstreamer_app::AppSink,
    metadata: SourceMetadata,
    /// First sample pulled while reading caps; returned by the first read.
    prerolled: Option<VideoFrame>,
    frame_timeout: Duration,
}

impl GstreamerSource {
    fn open(url: &str, backend: &GstreamerBackend) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let uri = to_uri(url)?;
        let pipeline_description = format!(
            "uridecodebin uri=\"{}\" ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=8",
            uri
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .context("build decode pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("decode pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        pipeline
            .set_state(gstreamer::State::Playing)
            .context("set decode pipeline to Playing")?;

        let sample = match appsink.try_pull_sample(to_clock_time(backend.preroll_timeout)) {
            Some(sample) => sample,
            None => {
                let _ = pipeline.set_state(gstreamer::State::Null);
                return Err(anyhow!("pipeline produced no sample within {:?}", backend.preroll_timeout));
            }
        };
        let (first, frame_rate) = match sample_to_frame(&sample) {
            Ok(decoded) => decoded,
            Err(err) => {
                let _ = pipeline.set_state(gstreamer::State::Null);
                return Err(err);
            }
        };

        let total_frames = pipeline
            .query_duration::<gstreamer::ClockTime>()
            .filter(|_| frame_rate > 0.0)
            .map(|duration| (duration.seconds_f64() * frame_rate).round() as i64)
            .unwrap_or(0);

        let metadata = SourceMetadata {
            frame_rate,
            width: first.width,
            height: first.height,
            total_frames,
        };
        log::info!(
            "GstreamerSource: opened {}x{} @ {:.2} fps, {} frames reported",
            metadata.width,
            metadata.height,
            metadata.frame_rate,
            metadata.total_frames
        );

        Ok(Self {
            pipeline: Some(pipeline),
            appsink,
            metadata,
            prerolled: Some(first),
            frame_timeout: backend.frame_timeout,
        })
    }

    fn poll_bus(&self) -> Result<()> {
        let Some(bus) = self.pipeline.as_ref().and_then(|pipeline| pipeline.bus()) else {
            return Ok(());
        };
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    return Err(anyhow!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => return Err(anyhow!("gstreamer reached EOS")),
                _ => {}
            }
        }
        Ok(())
    }
}

impl FrameSource for GstreamerSource {
    fn metadata(&self) -> SourceMetadata {
        self.metadata
    }

    fn read_frame(&mut self) -> Result<VideoFrame> {
        if self.pipeline.is_none() {
            return Err(anyhow!("gstreamer source is closed"));
        }
        if let Some(frame) = self.prerolled.take() {
            return Ok(frame);
        }
        self.poll_bus()?;
        let sample = self
            .appsink
            .try_pull_sample(to_clock_time(self.frame_timeout))
            .ok_or_else(|| anyhow!("decode pipeline stalled"))?;
        sample_to_frame(&sample).map(|(frame, _)| frame)
    }

    fn close(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            if let Err(err) = pipeline.set_state(gstreamer::State::Null) {
                log::warn!("GstreamerSource: failed to stop pipeline: {}", err);
            }
        }
    }
}

impl Drop for GstreamerSource {
    fn drop(&mut self) {
        self.close();
    }
}

fn to_uri(url: &str) -> Result<String> {
    if url.contains("://") {
        return Ok(url.to_string());
    }
    let path = std::fs::canonicalize(url).with_context(|| format!("resolve local path {}", url))?;
    url::Url::from_file_path(&path)
        .map(|uri| uri.to_string())
        .map_err(|_| anyhow!("cannot express {} as a file uri", path.display()))
}

fn to_clock_time(duration: Duration) -> gstreamer::ClockTime {
    gstreamer::ClockTime::from_mseconds(duration.as_millis() as u64)
}

fn sample_to_frame(sample: &gstreamer::Sample) -> Result<(VideoFrame, f64)> {
    let buffer = sample.buffer().context("sample missing buffer")?;
    let caps = sample.caps().context("sample missing caps")?;
    let info = gstreamer_video::VideoInfo::from_caps(caps).context("parse caps as video info")?;

    let width = info.width();
    let height = info.height();
    let stride = info.stride()[0] as usize;
    let fps = info.fps();
    let frame_rate = if fps.denom() != 0 {
        fps.numer() as f64 / fps.denom() as f64
    } else {
        0.0
    };

    let map = buffer.map_readable().context("map sample buffer")?;
    let pixels = pack_rows(map.as_slice(), stride, width, height)?;
    Ok((VideoFrame::new(pixels, width, height)?, frame_rate))
}
