//! Stream Chunker
//!
//! Captures a live or on-demand video stream, slices it into fixed-length
//! chunks and uploads each chunk to S3-compatible object storage.
//!
//! # Pipeline
//!
//! `CaptureSession::start` resolves the source (`resolve`), checks that a frame
//! can be decoded (`probe`) and hands the URL to a background `ChunkRecorder`.
//! The recorder opens the source once, classifies it as live or finite
//! (`stream`) and fills one chunk file after another, passing each closed
//! chunk to the `UploadSink`.
//!
//! # Module Structure
//!
//! - `ingest`: media backends (`FrameSource`, `FrameSink`, `MediaEngine`)
//! - `frame`: decoded RGB24 frames
//! - `recorder`: the chunk loop and its state machine
//! - `upload`: object storage clients and the upload sink
//! - `session`: lifecycle and status
//! - `api`: HTTP control plane
//! - `config`: per-session and service configuration

pub mod api;
pub mod config;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod probe;
pub mod recorder;
pub mod resolve;
pub mod session;
pub mod stream;
pub mod upload;

pub use config::{CaptureConfig, CaptureTags, ServiceConfig, StorageSettings};
pub use error::{CaptureError, CaptureResult};
pub use frame::VideoFrame;
pub use ingest::{FrameSink, FrameSource, MediaBackend, MediaEngine, SyntheticBackend};
pub use probe::{ProbeOutcome, StreamProbe};
pub use recorder::{ChunkRecord, ChunkRecorder, CloseReason, RecorderState};
pub use resolve::{resolve_source, ResolvedSource, Resolver, YtDlpResolver};
pub use session::{CaptureSession, SessionServices, SessionStatus};
pub use stream::{SourceMetadata, StreamProperties};
pub use upload::{
    InMemoryObjectStore, ObjectStore, ObjectStoreConnector, S3Connector, S3ObjectStore,
    SharedStoreConnector, UploadSink,
};
