//! Frame sources and chunk sinks.
//!
//! This module abstracts the decode/encode engine behind three traits:
//! - `FrameSource`: an open stream handle that yields RGB24 frames
//! - `FrameSink`: a chunk file being written
//! - `MediaBackend`: a decode/encode engine that opens both
//!
//! Backends:
//! - Synthetic source and raw sink for `stub://` URLs (always compiled)
//! - FFmpeg decode + MPEG-4 `.mp4` writer (feature: backend-ffmpeg)
//! - GStreamer `uridecodebin` decode (feature: backend-gstreamer)
//!
//! `MediaEngine` owns the "primary backend, then fallback" policy so the recorder
//! and the probe never care which engine is doing the work.

#[cfg(feature = "backend-ffmpeg")]
mod ffmpeg;
#[cfg(feature = "backend-gstreamer")]
mod gst;
pub mod synthetic;

#[cfg(feature = "backend-ffmpeg")]
pub use ffmpeg::FfmpegBackend;
#[cfg(feature = "backend-gstreamer")]
pub use gst::GstreamerBackend;
pub use synthetic::SyntheticBackend;

use anyhow::{anyhow, Result};
use std::path::Path;
use std::sync::Arc;

use crate::frame::VideoFrame;
use crate::stream::SourceMetadata;

/// An open stream handle.
pub trait FrameSource: Send {
    fn metadata(&self) -> SourceMetadata;

    /// Decode the next frame. An error is a failed read, not necessarily the end
    /// of the stream; callers decide when repeated failures mean the source ended.
    fn read_frame(&mut self) -> Result<VideoFrame>;

    /// Release the handle. Must be safe to call more than once.
    fn close(&mut self);
}

/// A chunk file being written.
pub trait FrameSink: Send {
    fn path(&self) -> &Path;

    fn write_frame(&mut self, frame: &VideoFrame) -> Result<()>;

    /// Flush and close the container. Must be safe to call more than once.
    fn finish(&mut self) -> Result<()>;
}

/// Output parameters for a chunk sink.
#[derive(Clone, Debug, PartialEq)]
pub struct SinkFormat {
    pub frame_rate: f64,
    pub width: u32,
    pub height: u32,
}

/// A decode/encode engine.
pub trait MediaBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns true when this backend is willing to try the URL.
    fn accepts(&self, url: &str) -> bool;

    fn open_source(&self, url: &str) -> Result<Box<dyn FrameSource>>;

    fn open_sink(&self, path: &Path, format: &SinkFormat) -> Result<Box<dyn FrameSink>>;

    /// File extension (without dot) of the chunks this backend writes.
    fn container_extension(&self) -> &'static str;

    fn writes_chunks(&self) -> bool {
        true
    }
}

/// A source opened by the engine, together with the backend that opened it.
pub struct OpenedSource {
    pub backend: Arc<dyn MediaBackend>,
    pub source: Box<dyn FrameSource>,
}

/// Ordered set of backends.
#[derive(Clone)]
pub struct MediaEngine {
    backends: Vec<Arc<dyn MediaBackend>>,
}

impl MediaEngine {
    /// Backends are tried in the given order.
    pub fn new(backends: Vec<Arc<dyn MediaBackend>>) -> Self {
        Self { backends }
    }

    /// Engine with every backend compiled into this build: synthetic for
    /// `stub://`, FFmpeg as primary and GStreamer as fallback for real URLs.
    pub fn detect() -> Self {
        #[allow(unused_mut)]
        let mut backends: Vec<Arc<dyn MediaBackend>> = vec![Arc::new(SyntheticBackend)];
        #[cfg(feature = "backend-ffmpeg")]
        backends.push(Arc::new(FfmpegBackend::default()));
        #[cfg(feature = "backend-gstreamer")]
        backends.push(Arc::new(GstreamerBackend::default()));
        Self::new(backends)
    }

    pub fn backend_names(&self) -> Vec<&'static str> {
        self.backends.iter().map(|backend| backend.name()).collect()
    }

    /// Backends willing to open `url`, in preference order.
    pub fn candidates(&self, url: &str) -> Vec<Arc<dyn MediaBackend>> {
        self.backends
            .iter()
            .filter(|backend| backend.accepts(url))
            .cloned()
            .collect()
    }

    /// Open `url` with the first backend that succeeds.
    pub fn open_source(&self, url: &str) -> Result<OpenedSource> {
        let candidates = self.candidates(url);
        if candidates.is_empty() {
            return Err(anyhow!(
                "no media backend accepts this source (compiled backends: {})",
                self.backend_names().join(", ")
            ));
        }

        let mut failures = Vec::new();
        for backend in candidates {
            match backend.open_source(url) {
                Ok(source) => {
                    if !failures.is_empty() {
                        log::info!("source opened with fallback backend {}", backend.name());
                    }
                    return Ok(OpenedSource { backend, source });
                }
                Err(err) => {
                    log::warn!("backend {} could not open source: {:#}", backend.name(), err);
                    failures.push(format!("{}: {:#}", backend.name(), err));
                }
            }
        }
        Err(anyhow!("all backends failed ({})", failures.join("; ")))
    }

    /// True when a backend other than the synthetic one is compiled in.
    pub fn has_media_backends(&self) -> bool {
        self.backends
            .iter()
            .any(|backend| backend.name() != SyntheticBackend::NAME)
    }

    /// Chunk writer for `url`, checked before a session starts recording.
    /// `opened_with` narrows the search to the backend that decoded the probe
    /// frame; without it any accepting backend will do.
    pub fn chunk_writer_for(
        &self,
        url: &str,
        opened_with: Option<&str>,
    ) -> Result<Arc<dyn MediaBackend>> {
        let candidates: Vec<_> = self
            .candidates(url)
            .into_iter()
            .filter(|backend| opened_with.map_or(true, |name| backend.name() == name))
            .collect();
        let mut last_err = anyhow!("no media backend accepts this source");
        for backend in &candidates {
            match self.sink_backend(backend) {
                Ok(writer) => return Ok(writer),
                Err(err) => last_err = err,
            }
        }
        Err(last_err)
    }

    /// Backend used to write chunks for a source opened by `source_backend`.
    pub fn sink_backend(&self, source_backend: &Arc<dyn MediaBackend>) -> Result<Arc<dyn MediaBackend>> {
        if source_backend.writes_chunks() {
            return Ok(source_backend.clone());
        }
        self.backends
            .iter()
            .find(|backend| backend.writes_chunks() && backend.name() != SyntheticBackend::NAME)
            .cloned()
            .ok_or_else(|| {
                anyhow!(
                    "no chunk writer available for sources opened by {}",
                    source_backend.name()
                )
            })
    }
}

impl Default for MediaEngine {
    fn default() -> Self {
        Self::detect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RefusingBackend {
        opens: AtomicUsize,
    }

    impl MediaBackend for RefusingBackend {
        fn name(&self) -> &'static str {
            "refusing"
        }
        fn accepts(&self, url: &str) -> bool {
            url.starts_with("stub://")
        }
        fn open_source(&self, _url: &str) -> Result<Box<dyn FrameSource>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Err(anyhow!("refused"))
        }
        fn open_sink(&self, _path: &Path, _format: &SinkFormat) -> Result<Box<dyn FrameSink>> {
            Err(anyhow!("refused"))
        }
        fn container_extension(&self) -> &'static str {
            "bin"
        }
        fn writes_chunks(&self) -> bool {
            false
        }
    }

    #[test]
    fn falls_back_to_secondary_backend() -> Result<()> {
        let primary = Arc::new(RefusingBackend {
            opens: AtomicUsize::new(0),
        });
        let backends: Vec<Arc<dyn MediaBackend>> = vec![primary.clone() as Arc<dyn MediaBackend>, Arc::new(SyntheticBackend)];
        let engine = MediaEngine::new(backends);

        let opened = engine.open_source("stub://live?realtime=0")?;
        assert_eq!(opened.backend.name(), SyntheticBackend::NAME);
        assert_eq!(primary.opens.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn fails_when_every_backend_fails() {
        let backends: Vec<Arc<dyn MediaBackend>> = vec![
            Arc::new(RefusingBackend {
                opens: AtomicUsize::new(0),
            }),
            Arc::new(SyntheticBackend),
        ];
        let engine = MediaEngine::new(backends);
        let err = engine
            .open_source("stub://unopenable")
            .err()
            .expect("open must fail");
        let message = format!("{err:#}");
        assert!(message.contains("refusing"));
        assert!(message.contains("synthetic"));
    }

    #[test]
    fn decode_only_backends_have_no_chunk_writer() {
        let decode_only: Arc<dyn MediaBackend> = Arc::new(RefusingBackend {
            opens: AtomicUsize::new(0),
        });
        let engine = MediaEngine::new(vec![decode_only]);
        let err = engine
            .chunk_writer_for("stub://live", Some("refusing"))
            .err()
            .expect("no writer available");
        assert!(format!("{err:#}").contains("no chunk writer"));

        let engine = MediaEngine::new(vec![Arc::new(SyntheticBackend)]);
        let writer = engine.chunk_writer_for("stub://live", None).unwrap();
        assert_eq!(writer.name(), SyntheticBackend::NAME);
        assert!(engine.chunk_writer_for("rtsp://camera/stream", None).is_err());
    }

    #[test]
    fn synthetic_only_engine_has_no_media_backends() {
        let engine = MediaEngine::new(vec![Arc::new(SyntheticBackend)]);
        assert!(!engine.has_media_backends());
        let refusing: Arc<dyn MediaBackend> = Arc::new(RefusingBackend {
            opens: AtomicUsize::new(0),
        });
        let backends: Vec<Arc<dyn MediaBackend>> = vec![refusing, Arc::new(SyntheticBackend)];
        let engine = MediaEngine::new(backends);
        assert!(engine.has_media_backends());
    }

    #[test]
    fn rejects_urls_no_backend_accepts() {
        let engine = MediaEngine::new(vec![Arc::new(SyntheticBackend)]);
        assert!(engine.candidates("rtsp://camera/stream").is_empty());
        assert!(engine.open_source("rtsp://camera/stream").is_err());
    }
}
