//! Chunk recording loop.
//!
//! One frame source is opened per session and kept open while a sequence of
//! time-boxed chunk sinks is filled from it. Each closed chunk is uploaded
//! before the next one starts.
//!
//! State flow: `Idle -> Opening -> Recording(n) -> ... -> Closing -> Idle`, with
//! `Aborted` reachable when the source cannot be opened.
//!
//! End of source is detected by consecutive failed reads: once the failure
//! counter reaches the threshold for the stream kind, the current chunk is
//! closed and the session ends.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{CaptureConfig, RecorderTuning};
use crate::error::{CaptureError, CaptureResult};
use crate::ingest::{FrameSink, FrameSource, MediaBackend, MediaEngine, SinkFormat};
use crate::stream::StreamProperties;
use crate::upload::{UploadReceipt, UploadSink};

const STOP_POLL: Duration = Duration::from_millis(50);
const FALLBACK_NAME: &str = "stream";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Opening,
    Recording { chunk: u64 },
    Closing,
    Aborted,
}

impl RecorderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecorderState::Idle => "idle",
            RecorderState::Opening => "opening",
            RecorderState::Recording { .. } => "recording",
            RecorderState::Closing => "closing",
            RecorderState::Aborted => "aborted",
        }
    }

    pub fn chunk(&self) -> Option<u64> {
        match self {
            RecorderState::Recording { chunk } => Some(*chunk),
            _ => None,
        }
    }
}

/// Why a session left the recording loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    MaxDuration,
    SourceEnded,
    StopRequested,
}

impl CloseReason {
    pub fn describe(&self) -> &'static str {
        match self {
            CloseReason::MaxDuration => "max duration reached",
            CloseReason::SourceEnded => "source ended",
            CloseReason::StopRequested => "stop requested",
        }
    }
}

/// A closed chunk file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkRecord {
    pub path: PathBuf,
    pub file_name: String,
    pub started_at: DateTime<Utc>,
    pub frames_written: u64,
    pub size_bytes: u64,
}

/// Progress notifications from the recording loop.
pub trait RecorderEvents: Send + Sync {
    fn state_changed(&self, state: RecorderState);
    fn stream_classified(&self, properties: &StreamProperties, backend: &'static str);
    fn chunk_opened(&self, path: &Path);
    /// The chunk has frames and is about to be uploaded.
    fn chunk_closed(&self, record: &ChunkRecord);
    fn chunk_discarded(&self, path: &Path);
    fn chunk_uploaded(&self, record: &ChunkRecord, receipt: &UploadReceipt);
    fn chunk_upload_failed(&self, record: &ChunkRecord, error: &CaptureError);
    fn finished(&self, outcome: &CaptureResult<CloseReason>);
}

/// Consecutive failed-read counter.
#[derive(Clone, Debug)]
pub struct FailureCounter {
    consecutive: u32,
    threshold: u32,
}

impl FailureCounter {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive: 0,
            threshold: threshold.max(1),
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    /// Returns true once the threshold is reached.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive = self.consecutive.saturating_add(1);
        self.consecutive >= self.threshold
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

/// Checked before each chunk. Live streams are never bounded by duration.
pub fn max_duration_reached(is_live: bool, elapsed: Duration, max_duration: Duration) -> bool {
    !is_live && elapsed >= max_duration
}

/// `{name}_{YYYYmmdd_HHMMSS}_{8 hex}.{ext}`
pub fn chunk_file_name(name: &str, started_at: DateTime<Utc>, extension: &str) -> String {
    let suffix = hex::encode(rand::random::<[u8; 4]>());
    format!(
        "{}_{}_{}.{}",
        sanitize_name(name),
        started_at.format("%Y%m%d_%H%M%S"),
        suffix,
        extension
    )
}

fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.trim_matches('_').is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        cleaned
    }
}

/// Closes the source on every exit path.
struct SourceGuard {
    source: Box<dyn FrameSource>,
}

impl SourceGuard {
    fn read(&mut self) -> anyhow::Result<crate::frame::VideoFrame> {
        self.source.read_frame()
    }
}

impl Drop for SourceGuard {
    fn drop(&mut self) {
        self.source.close();
    }
}

/// Finishes the sink on every exit path.
struct SinkGuard {
    sink: Box<dyn FrameSink>,
}

impl SinkGuard {
    fn finish(mut self) -> anyhow::Result<()> {
        self.sink.finish()
    }
}

impl Drop for SinkGuard {
    fn drop(&mut self) {
        if let Err(err) = self.sink.finish() {
            log::warn!("chunk {} not finalized: {:#}", self.sink.path().display(), err);
        }
    }
}

pub struct ChunkRecorder {
    engine: Arc<MediaEngine>,
    uploader: UploadSink,
    tuning: RecorderTuning,
    name: String,
    chunk_interval: Duration,
    max_duration: Duration,
    running: Arc<AtomicBool>,
    events: Arc<dyn RecorderEvents>,
}

impl ChunkRecorder {
    pub fn new(
        engine: Arc<MediaEngine>,
        uploader: UploadSink,
        config: &CaptureConfig,
        tuning: RecorderTuning,
        running: Arc<AtomicBool>,
        events: Arc<dyn RecorderEvents>,
    ) -> Self {
        Self {
            engine,
            uploader,
            tuning,
            name: sanitize_name(&config.name),
            chunk_interval: config.chunk_interval,
            max_duration: config.max_duration,
            running,
            events,
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Record `url` until it ends, the duration bound hits, or stop is requested.
    pub fn run(self, url: &str) -> CaptureResult<CloseReason> {
        let outcome = self.record(url);
        match &outcome {
            Ok(reason) => log::info!("recording finished: {}", reason.describe()),
            Err(err) => log::error!("recording aborted: {}", err),
        }
        self.running.store(false, Ordering::SeqCst);
        self.events.finished(&outcome);
        outcome
    }

    fn record(&self, url: &str) -> CaptureResult<CloseReason> {
        self.events.state_changed(RecorderState::Opening);
        let opened = match self.engine.open_source(url) {
            Ok(opened) => opened,
            Err(err) => {
                self.events.state_changed(RecorderState::Aborted);
                return Err(CaptureError::SourceOpenFailed {
                    url: crate::config::redact_url_credentials(url),
                    reason: format!("{err:#}"),
                });
            }
        };
        let mut source = SourceGuard {
            source: opened.source,
        };

        let properties = StreamProperties::classify(&source.source.metadata());
        log::info!(
            "stream classified as {} ({}x{} @ {:.2} fps, {} frames)",
            properties.kind(),
            properties.width,
            properties.height,
            properties.frame_rate,
            properties.total_frames
        );
        self.events
            .stream_classified(&properties, opened.backend.name());

        let sink_backend = match self.engine.sink_backend(&opened.backend) {
            Ok(backend) => backend,
            Err(err) => {
                self.events.state_changed(RecorderState::Aborted);
                return Err(CaptureError::Internal(format!("{err:#}")));
            }
        };

        let reason = self.chunk_loop(&mut source, &properties, sink_backend.as_ref());
        self.events.state_changed(RecorderState::Closing);
        drop(source);
        self.events.state_changed(RecorderState::Idle);
        Ok(reason)
    }

    fn chunk_loop(
        &self,
        source: &mut SourceGuard,
        properties: &StreamProperties,
        sink_backend: &dyn MediaBackend,
    ) -> CloseReason {
        let format = SinkFormat {
            frame_rate: properties.frame_rate,
            width: properties.width,
            height: properties.height,
        };
        let session_start = Instant::now();
        let mut failures = FailureCounter::new(self.tuning.failure_threshold_for(properties.is_live));
        let mut chunk_index = 0u64;

        loop {
            if !self.is_running() {
                return CloseReason::StopRequested;
            }
            if max_duration_reached(properties.is_live, session_start.elapsed(), self.max_duration) {
                log::info!(
                    "max duration of {}s reached, not starting another chunk",
                    self.max_duration.as_secs()
                );
                return CloseReason::MaxDuration;
            }

            chunk_index += 1;
            let started_at = Utc::now();
            let file_name =
                chunk_file_name(&self.name, started_at, sink_backend.container_extension());
            let path = self.tuning.work_dir.join(&file_name);

            let Some(sink) = self.open_sink(sink_backend, &path, &format) else {
                return CloseReason::StopRequested;
            };
            self.events
                .state_changed(RecorderState::Recording { chunk: chunk_index });
            self.events.chunk_opened(&path);

            let (frames_written, ended) =
                self.fill_chunk(source, sink, properties, &mut failures);
            let size_bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            let record = ChunkRecord {
                path,
                file_name,
                started_at,
                frames_written,
                size_bytes,
            };
            self.hand_off(record);

            if ended {
                return CloseReason::SourceEnded;
            }
            if !self.is_running() {
                return CloseReason::StopRequested;
            }
            self.pause(self.tuning.inter_chunk_pause);
        }
    }

    /// Opens a sink, retrying until it succeeds or a stop is requested.
    fn open_sink(
        &self,
        backend: &dyn MediaBackend,
        path: &Path,
        format: &SinkFormat,
    ) -> Option<SinkGuard> {
        loop {
            match backend.open_sink(path, format) {
                Ok(sink) => return Some(SinkGuard { sink }),
                Err(err) => {
                    let err = CaptureError::SinkOpenFailed {
                        path: path.to_path_buf(),
                        reason: format!("{err:#}"),
                    };
                    log::warn!("{}; retrying", err);
                    let _ = std::fs::remove_file(path);
                }
            }
            self.pause(self.tuning.sink_retry_backoff);
            if !self.is_running() {
                return None;
            }
        }
    }

    /// Returns (frames written, source ended).
    fn fill_chunk(
        &self,
        source: &mut SourceGuard,
        sink: SinkGuard,
        properties: &StreamProperties,
        failures: &mut FailureCounter,
    ) -> (u64, bool) {
        let mut sink = sink;
        let chunk_start = Instant::now();
        let idle = properties.frame_period() / 10;
        let mut frames_written = 0u64;
        let mut write_errors = 0u64;
        let mut ended = false;

        while self.is_running() && chunk_start.elapsed() < self.chunk_interval {
            match source.read() {
                Ok(frame) => {
                    failures.record_success();
                    match sink.sink.write_frame(&frame) {
                        Ok(()) => frames_written += 1,
                        Err(err) => {
                            if write_errors == 0 {
                                log::warn!("chunk write failed: {:#}", err);
                            }
                            write_errors += 1;
                        }
                    }
                    std::thread::sleep(idle);
                }
                Err(err) => {
                    if failures.record_failure() {
                        log::info!(
                            "{} consecutive failed reads, treating source as ended (last: {:#})",
                            failures.consecutive(),
                            err
                        );
                        ended = true;
                        break;
                    }
                    std::thread::sleep(self.tuning.failed_read_backoff);
                }
            }
        }

        if write_errors > 0 {
            log::warn!("{} frames could not be written to this chunk", write_errors);
        }
        if let Err(err) = sink.finish() {
            log::warn!("chunk could not be finalized: {:#}", err);
        }
        (frames_written, ended)
    }

    /// Upload a non-empty chunk or remove an empty one.
    fn hand_off(&self, record: ChunkRecord) {
        if record.frames_written == 0 || record.size_bytes == 0 {
            if let Err(err) = std::fs::remove_file(&record.path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("could not remove empty chunk {}: {}", record.path.display(), err);
                }
            }
            log::info!("discarded empty chunk {}", record.file_name);
            self.events.chunk_discarded(&record.path);
            return;
        }

        self.events.chunk_closed(&record);
        match self.uploader.upload(&record) {
            Ok(receipt) => self.events.chunk_uploaded(&record, &receipt),
            Err(err) => {
                log::error!("{}; keeping {}", err, record.path.display());
                self.events.chunk_upload_failed(&record, &err);
            }
        }
    }

    /// Sleep in short slices so a stop request is noticed early.
    fn pause(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while self.is_running() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep(STOP_POLL.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageSettings;
    use crate::ingest::SyntheticBackend;
    use crate::upload::{InMemoryObjectStore, ObjectStore};
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[derive(Default)]
    struct EventLog {
        states: Mutex<Vec<RecorderState>>,
        closed: Mutex<Vec<ChunkRecord>>,
        discarded: AtomicUsize,
        uploaded: AtomicUsize,
        failed: AtomicUsize,
        outcome: Mutex<Option<Result<CloseReason, String>>>,
    }

    impl RecorderEvents for EventLog {
        fn state_changed(&self, state: RecorderState) {
            self.states.lock().unwrap().push(state);
        }
        fn stream_classified(&self, _properties: &StreamProperties, _backend: &'static str) {}
        fn chunk_opened(&self, _path: &Path) {}
        fn chunk_closed(&self, record: &ChunkRecord) {
            self.closed.lock().unwrap().push(record.clone());
        }
        fn chunk_discarded(&self, _path: &Path) {
            self.discarded.fetch_add(1, Ordering::SeqCst);
        }
        fn chunk_uploaded(&self, _record: &ChunkRecord, _receipt: &UploadReceipt) {
            self.uploaded.fetch_add(1, Ordering::SeqCst);
        }
        fn chunk_upload_failed(&self, _record: &ChunkRecord, _error: &CaptureError) {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
        fn finished(&self, outcome: &CaptureResult<CloseReason>) {
            *self.outcome.lock().unwrap() =
                Some(outcome.as_ref().map(|r| *r).map_err(|e| e.code().to_string()));
        }
    }

    fn tuning(dir: &Path) -> RecorderTuning {
        RecorderTuning {
            failure_threshold: 3,
            live_failure_threshold: 3,
            failed_read_backoff: Duration::from_millis(1),
            inter_chunk_pause: Duration::from_millis(1),
            sink_retry_backoff: Duration::from_millis(5),
            stop_timeout: Duration::from_secs(2),
            work_dir: dir.to_path_buf(),
        }
    }

    struct Harness {
        store: Arc<InMemoryObjectStore>,
        events: Arc<EventLog>,
        running: Arc<AtomicBool>,
        recorder: ChunkRecorder,
    }

    fn harness(dir: &Path, engine: MediaEngine, interval: Duration, max: Duration) -> Harness {
        let store = Arc::new(InMemoryObjectStore::new());
        let events = Arc::new(EventLog::default());
        let running = Arc::new(AtomicBool::new(true));
        let mut config = CaptureConfig::new("stub://live", "chunks", StorageSettings::default());
        config.name = "north cam".into();
        config.chunk_interval = interval;
        config.max_duration = max;
        let uploader = UploadSink::new(store.clone() as Arc<dyn ObjectStore>, &config);
        let recorder = ChunkRecorder::new(
            Arc::new(engine),
            uploader,
            &config,
            tuning(dir),
            running.clone(),
            events.clone(),
        );
        Harness {
            store,
            events,
            running,
            recorder,
        }
    }

    fn synthetic() -> MediaEngine {
        MediaEngine::new(vec![Arc::new(SyntheticBackend)])
    }

    #[test]
    fn failure_counter_resets_on_success() {
        let mut counter = FailureCounter::new(30);
        for _ in 0..29 {
            assert!(!counter.record_failure());
        }
        counter.record_success();
        assert_eq!(counter.consecutive(), 0);
        for _ in 0..29 {
            assert!(!counter.record_failure());
        }
        assert!(counter.record_failure());
    }

    #[test]
    fn duration_bound_only_applies_to_finite_streams() {
        let max = Duration::from_secs(5);
        assert!(max_duration_reached(false, Duration::from_secs(6), max));
        assert!(max_duration_reached(false, Duration::from_secs(5), max));
        assert!(!max_duration_reached(false, Duration::from_secs(4), max));
        assert!(!max_duration_reached(true, Duration::from_secs(10_000), max));
    }

    #[test]
    fn chunk_names_are_unique() {
        let now = Utc::now();
        let names: HashSet<String> = (0..500)
            .map(|_| chunk_file_name("north cam/1", now, "mp4"))
            .collect();
        assert_eq!(names.len(), 500);
        let sample = names.iter().next().unwrap();
        assert!(sample.starts_with("north_cam_1_"));
        assert!(sample.ends_with(".mp4"));
        assert_eq!(chunk_file_name("///", now, "rgb").split('_').next(), Some("stream"));
    }

    #[test]
    fn vod_ends_when_frames_run_out() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(
            dir.path(),
            synthetic(),
            Duration::from_secs(30),
            Duration::from_secs(60),
        );
        let reason = h
            .recorder
            .run("stub://vod?frames=20&fps=200&realtime=0")
            .unwrap();
        assert_eq!(reason, CloseReason::SourceEnded);
        assert!(!h.running.load(Ordering::SeqCst));
        assert_eq!(h.events.uploaded.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.len(), 1);

        let closed = h.events.closed.lock().unwrap();
        assert_eq!(closed[0].frames_written, 20);
        assert!(closed[0].file_name.starts_with("north_cam_"));
        assert!(!closed[0].path.exists());

        let states = h.events.states.lock().unwrap();
        assert_eq!(states.first(), Some(&RecorderState::Opening));
        assert!(states.contains(&RecorderState::Recording { chunk: 1 }));
        assert_eq!(states.last(), Some(&RecorderState::Idle));
    }

    #[test]
    fn finite_stream_stops_at_max_duration_between_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(
            dir.path(),
            synthetic(),
            Duration::from_millis(60),
            Duration::from_millis(100),
        );
        let reason = h
            .recorder
            .run("stub://vod?frames=100000&fps=100&realtime=1")
            .unwrap();
        assert_eq!(reason, CloseReason::MaxDuration);
        let uploaded = h.events.uploaded.load(Ordering::SeqCst);
        assert!((2..=3).contains(&uploaded), "uploaded {uploaded} chunks");
    }

    #[test]
    fn empty_chunks_are_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(
            dir.path(),
            synthetic(),
            Duration::from_secs(5),
            Duration::from_secs(60),
        );
        let reason = h.recorder.run("stub://dead").unwrap();
        assert_eq!(reason, CloseReason::SourceEnded);
        assert_eq!(h.events.discarded.load(Ordering::SeqCst), 1);
        assert_eq!(h.events.uploaded.load(Ordering::SeqCst), 0);
        assert!(h.store.is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn upload_failure_keeps_file_and_continues() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(
            dir.path(),
            synthetic(),
            Duration::from_millis(50),
            Duration::from_secs(60),
        );
        h.store.fail_next(1);
        let reason = h
            .recorder
            .run("stub://live?fps=100&stall_after=12&realtime=1")
            .unwrap();
        assert_eq!(reason, CloseReason::SourceEnded);
        assert_eq!(h.events.failed.load(Ordering::SeqCst), 1);
        assert!(h.events.uploaded.load(Ordering::SeqCst) >= 1);

        let closed = h.events.closed.lock().unwrap();
        assert!(closed[0].path.exists());
        assert!(!closed[closed.len() - 1].path.exists());
    }

    #[test]
    fn unopenable_source_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(
            dir.path(),
            synthetic(),
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let err = h.recorder.run("stub://unopenable").unwrap_err();
        assert!(matches!(err, CaptureError::SourceOpenFailed { .. }));
        assert!(!h.running.load(Ordering::SeqCst));
        assert_eq!(
            h.events.states.lock().unwrap().last(),
            Some(&RecorderState::Aborted)
        );
        assert_eq!(
            *h.events.outcome.lock().unwrap(),
            Some(Err("source_open_failed".to_string()))
        );
    }

    /// Synthetic decode, sink opens fail a fixed number of times.
    struct FlakySinkBackend {
        sink_failures: AtomicUsize,
    }

    impl MediaBackend for FlakySinkBackend {
        fn name(&self) -> &'static str {
            "flaky"
        }
        fn accepts(&self, url: &str) -> bool {
            SyntheticBackend.accepts(url)
        }
        fn open_source(&self, url: &str) -> anyhow::Result<Box<dyn FrameSource>> {
            SyntheticBackend.open_source(url)
        }
        fn open_sink(&self, path: &Path, format: &SinkFormat) -> anyhow::Result<Box<dyn FrameSink>> {
            let remaining = self.sink_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.sink_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(anyhow::anyhow!("disk full"));
            }
            SyntheticBackend.open_sink(path, format)
        }
        fn container_extension(&self) -> &'static str {
            "rgb"
        }
    }

    #[test]
    fn sink_open_failures_are_retried() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FlakySinkBackend {
            sink_failures: AtomicUsize::new(2),
        });
        let engine = MediaEngine::new(vec![backend.clone() as Arc<dyn MediaBackend>]);
        let h = harness(
            dir.path(),
            engine,
            Duration::from_secs(5),
            Duration::from_secs(60),
        );
        let reason = h
            .recorder
            .run("stub://vod?frames=5&realtime=0")
            .unwrap();
        assert_eq!(reason, CloseReason::SourceEnded);
        assert_eq!(backend.sink_failures.load(Ordering::SeqCst), 0);
        assert_eq!(h.events.uploaded.load(Ordering::SeqCst), 1);
    }

    #[derive(Default)]
    struct HandleCounts {
        opened: AtomicUsize,
        closed: AtomicUsize,
    }

    /// Synthetic backend that counts source opens and closes.
    struct CountingBackend {
        counts: Arc<HandleCounts>,
    }

    struct CountingSource {
        inner: Box<dyn FrameSource>,
        counts: Arc<HandleCounts>,
        closed: bool,
    }

    impl FrameSource for CountingSource {
        fn metadata(&self) -> crate::stream::SourceMetadata {
            self.inner.metadata()
        }
        fn read_frame(&mut self) -> anyhow::Result<crate::frame::VideoFrame> {
            self.inner.read_frame()
        }
        fn close(&mut self) {
            if !self.closed {
                self.closed = true;
                self.counts.closed.fetch_add(1, Ordering::SeqCst);
            }
            self.inner.close();
        }
    }

    impl MediaBackend for CountingBackend {
        fn name(&self) -> &'static str {
            "counting"
        }
        fn accepts(&self, url: &str) -> bool {
            SyntheticBackend.accepts(url)
        }
        fn open_source(&self, url: &str) -> anyhow::Result<Box<dyn FrameSource>> {
            let inner = SyntheticBackend.open_source(url)?;
            self.counts.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(CountingSource {
                inner,
                counts: self.counts.clone(),
                closed: false,
            }))
        }
        fn open_sink(&self, path: &Path, format: &SinkFormat) -> anyhow::Result<Box<dyn FrameSink>> {
            SyntheticBackend.open_sink(path, format)
        }
        fn container_extension(&self) -> &'static str {
            "rgb"
        }
    }

    fn counting() -> (MediaEngine, Arc<HandleCounts>) {
        let counts = Arc::new(HandleCounts::default());
        let backend: Arc<dyn MediaBackend> = Arc::new(CountingBackend {
            counts: counts.clone(),
        });
        (MediaEngine::new(vec![backend]), counts)
    }

    fn assert_one_handle(counts: &HandleCounts) {
        assert_eq!(counts.opened.load(Ordering::SeqCst), 1);
        assert_eq!(counts.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn source_handle_lives_for_the_whole_session() {
        // stopped live stream, several chunks
        let dir = tempfile::tempdir().unwrap();
        let (engine, counts) = counting();
        let h = harness(
            dir.path(),
            engine,
            Duration::from_millis(40),
            Duration::from_secs(60),
        );
        let running = h.running.clone();
        let recorder = h.recorder;
        let worker = std::thread::spawn(move || recorder.run("stub://live?fps=50"));
        std::thread::sleep(Duration::from_millis(200));
        running.store(false, Ordering::SeqCst);
        assert_eq!(worker.join().unwrap().unwrap(), CloseReason::StopRequested);
        assert!(h.events.uploaded.load(Ordering::SeqCst) >= 2);
        assert_one_handle(&counts);

        // finite stream that runs out of frames
        let (engine, counts) = counting();
        let h = harness(
            dir.path(),
            engine,
            Duration::from_millis(30),
            Duration::from_secs(60),
        );
        let reason = h.recorder.run("stub://vod?frames=40&fps=200&realtime=1").unwrap();
        assert_eq!(reason, CloseReason::SourceEnded);
        assert!(h.events.uploaded.load(Ordering::SeqCst) >= 2);
        assert_one_handle(&counts);

        // finite stream cut off by the duration bound
        let (engine, counts) = counting();
        let h = harness(
            dir.path(),
            engine,
            Duration::from_millis(40),
            Duration::from_millis(100),
        );
        let reason = h
            .recorder
            .run("stub://vod?frames=100000&fps=100&realtime=1")
            .unwrap();
        assert_eq!(reason, CloseReason::MaxDuration);
        assert!(h.events.uploaded.load(Ordering::SeqCst) >= 2);
        assert_one_handle(&counts);
    }

    #[test]
    fn stop_flag_ends_live_recording() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(
            dir.path(),
            synthetic(),
            Duration::from_millis(40),
            Duration::from_millis(1),
        );
        let running = h.running.clone();
        let recorder = h.recorder;
        let worker = std::thread::spawn(move || recorder.run("stub://live?fps=50"));
        std::thread::sleep(Duration::from_millis(200));
        running.store(false, Ordering::SeqCst);
        let reason = worker.join().unwrap().unwrap();
        assert_eq!(reason, CloseReason::StopRequested);
        // live streams ignore the 1ms duration bound
        assert!(h.events.uploaded.load(Ordering::SeqCst) >= 2);
    }
}
