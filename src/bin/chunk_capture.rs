//! chunk_capture - one-shot capture from the command line
//!
//! Runs a single session in the foreground, stops it on Ctrl-C or when the
//! source ends, and prints the final status as JSON.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use stream_chunker::config::{CaptureTags, ServiceConfig};
use stream_chunker::{CaptureSession, SessionServices};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Stream URL, local path or platform link.
    source: String,
    /// Display name used as the chunk filename stem.
    #[arg(long)]
    name: Option<String>,
    /// Destination bucket (defaults to CAPTURE_BUCKET).
    #[arg(long)]
    bucket: Option<String>,
    /// Object key prefix.
    #[arg(long)]
    prefix: Option<String>,
    /// Chunk length in seconds.
    #[arg(long)]
    chunk_secs: Option<u64>,
    /// Session bound in seconds for finite sources.
    #[arg(long)]
    max_duration_secs: Option<u64>,
    #[arg(long)]
    camera_id: Option<String>,
    #[arg(long)]
    capture_type: Option<String>,
    #[arg(long)]
    neighborhood: Option<String>,
    /// Storage access key.
    #[arg(long, env = "CAPTURE_STORAGE_ACCESS_KEY", hide_env_values = true)]
    access_key: Option<String>,
    /// Storage secret key.
    #[arg(long, env = "CAPTURE_STORAGE_SECRET_KEY", hide_env_values = true)]
    secret_key: Option<String>,
    /// Status log interval in seconds.
    #[arg(long, default_value_t = 10)]
    report_secs: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let service = ServiceConfig::load()?;
    let mut config = service.capture_config(&args.source);
    if let Some(name) = args.name {
        config.name = name;
    }
    if let Some(bucket) = args.bucket {
        config.bucket = bucket;
    }
    if let Some(prefix) = args.prefix {
        config.prefix = prefix;
    }
    if let Some(secs) = args.chunk_secs {
        config.chunk_interval = Duration::from_secs(secs);
    }
    if let Some(secs) = args.max_duration_secs {
        config.max_duration = Duration::from_secs(secs);
    }
    if let Some(key) = args.access_key {
        config.storage.access_key = key;
    }
    if let Some(secret) = args.secret_key {
        config.storage.secret_key = secret;
    }
    config.tags = CaptureTags {
        camera_id: args.camera_id,
        capture_type: args.capture_type,
        neighborhood: args.neighborhood,
    };

    let services = SessionServices::from_config(&service);
    if !services.engine.has_media_backends() && !args.source.starts_with("stub://") {
        log::warn!("built without a media backend; enable backend-ffmpeg or backend-gstreamer");
    }
    let session = CaptureSession::new(services);
    let message = session.start(config).map_err(|e| anyhow!("{}", e))?;
    log::info!("{}", message);

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let report_every = Duration::from_secs(args.report_secs.max(1));
    let mut since_report = Duration::ZERO;
    let tick = Duration::from_millis(200);
    while session.is_running() && !interrupted.load(Ordering::SeqCst) {
        std::thread::sleep(tick);
        since_report += tick;
        if since_report >= report_every {
            let status = session.status();
            log::info!(
                "state={} chunk={:?} uploaded={} failed={} pending={}",
                status.state,
                status.current_chunk,
                status.chunks_uploaded,
                status.chunks_failed,
                status.pending_cleanup
            );
            since_report = Duration::ZERO;
        }
    }

    // snapshot before stop clears the session
    let mut final_status = session.status();
    if session.is_running() {
        log::info!("interrupted, stopping capture");
        session.stop().map_err(|e| anyhow!("{}", e))?;
        final_status.running = false;
    }
    println!("{}", serde_json::to_string_pretty(&final_status)?);
    Ok(())
}
