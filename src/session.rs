//! Capture session lifecycle.
//!
//! `CaptureSession` runs at most one recorder worker at a time. `start` resolves
//! and probes the source synchronously, then spawns the worker and returns.
//! Each session owns its own ledger (running flag plus status book behind one
//! lock), so a worker that outlives `stop()` can only ever touch its own
//! session's records.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::{
    redact_url_credentials, CaptureConfig, ProbeSettings, RecorderTuning, SanitizedConfig,
    ServiceConfig,
};
use crate::error::{CaptureError, CaptureResult};
use crate::ingest::MediaEngine;
use crate::probe::StreamProbe;
use crate::recorder::{ChunkRecord, ChunkRecorder, CloseReason, RecorderEvents, RecorderState};
use crate::resolve::{resolve_source, Resolver, YtDlpResolver};
use crate::stream::StreamProperties;
use crate::upload::{ObjectStoreConnector, S3Connector, UploadReceipt, UploadSink};

const STOP_POLL: Duration = Duration::from_millis(25);

/// Collaborators shared by every session of a service instance.
#[derive(Clone)]
pub struct SessionServices {
    pub resolver: Arc<dyn Resolver>,
    pub engine: Arc<MediaEngine>,
    pub stores: Arc<dyn ObjectStoreConnector>,
    /// Resolution ceiling handed to the resolver's format selectors.
    pub max_height: u32,
    pub probe: ProbeSettings,
    pub tuning: RecorderTuning,
}

impl SessionServices {
    pub fn from_config(cfg: &ServiceConfig) -> Self {
        Self {
            resolver: Arc::new(YtDlpResolver::new(&cfg.resolver)),
            engine: Arc::new(MediaEngine::detect()),
            stores: Arc::new(S3Connector),
            max_height: cfg.resolver.max_height,
            probe: cfg.probe.clone(),
            tuning: cfg.tuning.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SourceInfo {
    /// Resolved URL with credentials removed.
    pub url: String,
    pub degraded: bool,
    /// False when the probe passed without decoding a frame.
    pub probe_verified: bool,
    pub backend: Option<&'static str>,
}

/// Point-in-time view of the current session.
#[derive(Clone, Debug, Serialize)]
pub struct SessionStatus {
    pub running: bool,
    pub state: &'static str,
    pub current_chunk: Option<u64>,
    pub session_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub config: Option<SanitizedConfig>,
    /// Local chunk files not yet deleted (upload pending or failed).
    pub pending_cleanup: usize,
    pub chunks_uploaded: u64,
    pub chunks_failed: u64,
    pub chunks_discarded: u64,
    pub stream: Option<StreamProperties>,
    pub source: Option<SourceInfo>,
    pub end_reason: Option<String>,
    pub last_error: Option<String>,
}

impl SessionStatus {
    fn idle() -> Self {
        Self {
            running: false,
            state: RecorderState::Idle.as_str(),
            current_chunk: None,
            session_id: None,
            started_at: None,
            config: None,
            pending_cleanup: 0,
            chunks_uploaded: 0,
            chunks_failed: 0,
            chunks_discarded: 0,
            stream: None,
            source: None,
            end_reason: None,
            last_error: None,
        }
    }
}

struct StatusBook {
    session_id: String,
    started_at: DateTime<Utc>,
    config: SanitizedConfig,
    source: SourceInfo,
    state: RecorderState,
    stream: Option<StreamProperties>,
    pending: BTreeSet<PathBuf>,
    active_chunk: Option<PathBuf>,
    uploaded: u64,
    failed: u64,
    discarded: u64,
    end_reason: Option<String>,
    last_error: Option<String>,
}

/// Per-session shared state. Written by the worker, read by status.
struct SessionLedger {
    running: Arc<AtomicBool>,
    book: Mutex<StatusBook>,
}

impl SessionLedger {
    fn book(&self) -> MutexGuard<'_, StatusBook> {
        self.book.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn snapshot(&self, stopping: bool) -> SessionStatus {
        let book = self.book();
        SessionStatus {
            running: self.running.load(Ordering::SeqCst) && !stopping,
            state: book.state.as_str(),
            current_chunk: book.state.chunk(),
            session_id: Some(book.session_id.clone()),
            started_at: Some(book.started_at),
            config: Some(book.config.clone()),
            pending_cleanup: book.pending.len(),
            chunks_uploaded: book.uploaded,
            chunks_failed: book.failed,
            chunks_discarded: book.discarded,
            stream: book.stream,
            source: Some(book.source.clone()),
            end_reason: book.end_reason.clone(),
            last_error: book.last_error.clone(),
        }
    }

    /// Local files this session may still own.
    fn leftover_files(&self) -> Vec<PathBuf> {
        let book = self.book();
        book.pending
            .iter()
            .cloned()
            .chain(book.active_chunk.clone())
            .collect()
    }

    fn mark_crashed(&self) {
        self.running.store(false, Ordering::SeqCst);
        let mut book = self.book();
        book.state = RecorderState::Aborted;
        book.last_error = Some("recorder worker panicked".into());
    }
}

impl RecorderEvents for SessionLedger {
    fn state_changed(&self, state: RecorderState) {
        self.book().state = state;
    }

    fn stream_classified(&self, properties: &StreamProperties, backend: &'static str) {
        let mut book = self.book();
        book.stream = Some(*properties);
        book.source.backend = Some(backend);
    }

    fn chunk_opened(&self, path: &Path) {
        self.book().active_chunk = Some(path.to_path_buf());
    }

    fn chunk_closed(&self, record: &ChunkRecord) {
        let mut book = self.book();
        book.active_chunk = None;
        book.pending.insert(record.path.clone());
    }

    fn chunk_discarded(&self, _path: &Path) {
        let mut book = self.book();
        book.active_chunk = None;
        book.discarded += 1;
    }

    fn chunk_uploaded(&self, record: &ChunkRecord, receipt: &UploadReceipt) {
        let mut book = self.book();
        book.uploaded += 1;
        if receipt.local_removed {
            book.pending.remove(&record.path);
        }
    }

    fn chunk_upload_failed(&self, _record: &ChunkRecord, error: &CaptureError) {
        let mut book = self.book();
        book.failed += 1;
        book.last_error = Some(error.to_string());
    }

    fn finished(&self, outcome: &CaptureResult<CloseReason>) {
        let mut book = self.book();
        match outcome {
            Ok(reason) => book.end_reason = Some(reason.describe().to_string()),
            Err(err) => {
                book.end_reason = Some("aborted".into());
                book.last_error = Some(err.to_string());
            }
        }
    }
}

/// Marks the session dead if the worker unwinds.
struct WorkerExit {
    ledger: Arc<SessionLedger>,
}

impl Drop for WorkerExit {
    fn drop(&mut self) {
        if std::thread::panicking() {
            log::error!("recorder worker panicked");
            self.ledger.mark_crashed();
        }
    }
}

struct ActiveSession {
    ledger: Arc<SessionLedger>,
    worker: Option<JoinHandle<()>>,
    stopping: bool,
}

impl ActiveSession {
    fn is_running(&self) -> bool {
        !self.stopping && self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    fn occupies_slot(&self) -> bool {
        self.stopping || self.is_running()
    }
}

#[derive(Default)]
struct Slot {
    starting: bool,
    active: Option<ActiveSession>,
}

/// Releases a start reservation on every failure path.
struct StartReservation<'a> {
    slot: &'a Mutex<Slot>,
    armed: bool,
}

impl Drop for StartReservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            lock_slot(self.slot).starting = false;
        }
    }
}

fn lock_slot(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One capture session at a time.
pub struct CaptureSession {
    services: SessionServices,
    slot: Mutex<Slot>,
}

impl CaptureSession {
    pub fn new(services: SessionServices) -> Self {
        Self {
            services,
            slot: Mutex::new(Slot::default()),
        }
    }

    /// Validate, resolve and probe, then start recording in the background.
    pub fn start(&self, config: CaptureConfig) -> CaptureResult<String> {
        let mut reservation = self.reserve()?;

        config.validate()?;
        let store = self
            .services
            .stores
            .connect(&config.storage)
            .map_err(|err| CaptureError::InvalidConfig(format!("storage: {err:#}")))?;

        log::info!("resolving {}", redact_url_credentials(&config.source));
        let resolved = resolve_source(
            self.services.resolver.as_ref(),
            &config.source,
            self.services.max_height,
        )?;
        let probe = StreamProbe::new(&self.services.engine, &self.services.probe).check(&resolved)?;
        let writer = self
            .services
            .engine
            .chunk_writer_for(&resolved.url, probe.backend)
            .map_err(|err| CaptureError::StreamUnusable {
                url: redact_url_credentials(&resolved.url),
                reason: format!("{err:#}"),
            })?;
        log::debug!("chunks will be written by {}", writer.name());

        std::fs::create_dir_all(&self.services.tuning.work_dir).map_err(|err| {
            CaptureError::Internal(format!(
                "create work dir {}: {}",
                self.services.tuning.work_dir.display(),
                err
            ))
        })?;

        let session_id = hex::encode(rand::random::<[u8; 6]>());
        let running = Arc::new(AtomicBool::new(true));
        let ledger = Arc::new(SessionLedger {
            running: running.clone(),
            book: Mutex::new(StatusBook {
                session_id: session_id.clone(),
                started_at: Utc::now(),
                config: config.sanitized(),
                source: SourceInfo {
                    url: redact_url_credentials(&resolved.url),
                    degraded: resolved.degraded,
                    probe_verified: probe.verified,
                    backend: probe.backend,
                },
                state: RecorderState::Idle,
                stream: None,
                pending: BTreeSet::new(),
                active_chunk: None,
                uploaded: 0,
                failed: 0,
                discarded: 0,
                end_reason: None,
                last_error: None,
            }),
        });

        let recorder = ChunkRecorder::new(
            self.services.engine.clone(),
            UploadSink::new(store, &config),
            &config,
            self.services.tuning.clone(),
            running,
            ledger.clone(),
        );
        let worker_ledger = ledger.clone();
        let url = resolved.url.clone();
        let worker = std::thread::Builder::new()
            .name(format!("recorder-{session_id}"))
            .spawn(move || {
                let _exit = WorkerExit {
                    ledger: worker_ledger,
                };
                let _ = recorder.run(&url);
            })
            .map_err(|err| CaptureError::Internal(format!("spawn recorder worker: {err}")))?;

        let mut slot = lock_slot(&self.slot);
        if let Some(previous) = slot.active.take() {
            let leftovers = previous.ledger.leftover_files();
            if !leftovers.is_empty() {
                log::warn!(
                    "{} chunk files from the previous session remain on disk: {:?}",
                    leftovers.len(),
                    leftovers
                );
            }
        }
        slot.active = Some(ActiveSession {
            ledger,
            worker: Some(worker),
            stopping: false,
        });
        slot.starting = false;
        reservation.armed = false;

        let message = format!(
            "capture session {} started for {}{}",
            session_id,
            redact_url_credentials(&config.source),
            if resolved.degraded { " (degraded source)" } else { "" }
        );
        log::info!("{}", message);
        Ok(message)
    }

    fn reserve(&self) -> CaptureResult<StartReservation<'_>> {
        let mut slot = lock_slot(&self.slot);
        if slot.starting || slot.active.as_ref().is_some_and(ActiveSession::occupies_slot) {
            return Err(CaptureError::AlreadyRunning);
        }
        slot.starting = true;
        Ok(StartReservation {
            slot: &self.slot,
            armed: true,
        })
    }

    /// Signal the worker, wait up to the stop timeout, then remove local files.
    pub fn stop(&self) -> CaptureResult<String> {
        let (ledger, worker) = {
            let mut slot = lock_slot(&self.slot);
            let active = match slot.active.as_mut() {
                Some(active) if active.is_running() => active,
                _ => return Err(CaptureError::NotRunning),
            };
            active.stopping = true;
            active.ledger.running.store(false, Ordering::SeqCst);
            (active.ledger.clone(), active.worker.take())
        };
        log::info!("stop requested, waiting for recorder");

        let exited = match worker {
            Some(worker) => self.wait_for_worker(worker),
            None => true,
        };
        if !exited {
            log::warn!(
                "recorder did not exit within {}s, cleaning up anyway",
                self.services.tuning.stop_timeout.as_secs()
            );
        }

        let mut removed = 0usize;
        for path in ledger.leftover_files() {
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => log::warn!("could not remove {}: {}", path.display(), err),
            }
        }

        let mut slot = lock_slot(&self.slot);
        if slot
            .active
            .as_ref()
            .is_some_and(|active| Arc::ptr_eq(&active.ledger, &ledger))
        {
            slot.active = None;
        }

        let message = format!("capture stopped, removed {} local chunk files", removed);
        log::info!("{}", message);
        Ok(message)
    }

    fn wait_for_worker(&self, worker: JoinHandle<()>) -> bool {
        let deadline = Instant::now() + self.services.tuning.stop_timeout;
        while !worker.is_finished() {
            if Instant::now() >= deadline {
                // detached; it exits on its own once the blocked read returns
                return false;
            }
            std::thread::sleep(STOP_POLL);
        }
        if worker.join().is_err() {
            log::error!("recorder worker panicked");
        }
        true
    }

    pub fn status(&self) -> SessionStatus {
        let slot = lock_slot(&self.slot);
        match slot.active.as_ref() {
            Some(active) => {
                let mut status = active.ledger.snapshot(active.stopping);
                if active.worker.as_ref().is_some_and(|w| w.is_finished()) {
                    status.running = false;
                }
                status
            }
            None => {
                let mut status = SessionStatus::idle();
                if slot.starting {
                    status.state = "starting";
                }
                status
            }
        }
    }

    pub fn is_running(&self) -> bool {
        lock_slot(&self.slot)
            .active
            .as_ref()
            .is_some_and(ActiveSession::is_running)
    }
}
