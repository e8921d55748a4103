//! chunkerd - capture service daemon
//!
//! Loads the service config, wires a capture session and serves the control
//! API until Ctrl-C. A running session is stopped (and its local chunks
//! removed) before exit.

use anyhow::{anyhow, Result};
use std::sync::{mpsc, Arc};

use stream_chunker::{
    api::{ApiConfig, ApiServer},
    config::ServiceConfig,
    CaptureSession, SessionServices,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Arc::new(ServiceConfig::load()?);
    let services = SessionServices::from_config(&config);
    log::info!(
        "media backends: {}",
        services.engine.backend_names().join(", ")
    );
    if !services.engine.has_media_backends() {
        log::warn!(
            "built without a media backend; only stub:// sources can be recorded \
             (enable the backend-ffmpeg or backend-gstreamer feature)"
        );
    }
    if config.defaults.bucket.is_empty() {
        log::warn!("no default bucket configured; every start request must name one");
    }
    let session = Arc::new(CaptureSession::new(services));

    let api_config = ApiConfig {
        addr: config.api_addr.clone(),
    };
    let api_handle = ApiServer::new(api_config, session.clone(), config.clone()).spawn()?;
    log::info!(
        "chunkerd {} running. chunks staged in {}",
        env!("CARGO_PKG_VERSION"),
        config.tuning.work_dir.display()
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("chunkerd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received");
    if session.is_running() {
        match session.stop() {
            Ok(message) => log::info!("{}", message),
            Err(err) => log::warn!("stop on shutdown: {}", err),
        }
    }
    api_handle.stop()?;

    Ok(())
}
