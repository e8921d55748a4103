//! HTTP control plane.
//!
//! Routes:
//! - `GET /health`
//! - `GET /status`
//! - `POST /start` with a JSON `StartRequest` body
//! - `POST /stop`
//!
//! Every response is JSON. Lifecycle responses use the envelope
//! `{"ok": bool, "message": string, "error": code?}`.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::{CaptureConfig, CaptureTags, ServiceConfig};
use crate::error::CaptureError;
use crate::session::CaptureSession;

const MAX_HEADER_BYTES: usize = 8192;
const MAX_BODY_BYTES: usize = 64 * 1024;
const MAX_IN_FLIGHT: usize = 16;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8787".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

/// Body of `POST /start`. Omitted fields fall back to the service defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StartRequest {
    #[serde(alias = "url")]
    pub source: String,
    pub name: Option<String>,
    pub bucket: Option<String>,
    pub prefix: Option<String>,
    pub chunk_interval_secs: Option<f64>,
    pub max_duration_secs: Option<f64>,
    pub camera_id: Option<String>,
    pub capture_type: Option<String>,
    pub neighborhood: Option<String>,
    pub storage: Option<StorageOverride>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageOverride {
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub region: Option<String>,
    pub secure: Option<bool>,
}

impl StartRequest {
    pub fn into_capture_config(self, defaults: &ServiceConfig) -> Result<CaptureConfig, CaptureError> {
        let mut cfg = defaults.capture_config(&self.source);
        if let Some(name) = self.name {
            cfg.name = name;
        }
        if let Some(bucket) = self.bucket {
            cfg.bucket = bucket;
        }
        if let Some(prefix) = self.prefix {
            cfg.prefix = prefix;
        }
        if let Some(secs) = self.chunk_interval_secs {
            cfg.chunk_interval = seconds("chunk_interval_secs", secs)?;
        }
        if let Some(secs) = self.max_duration_secs {
            cfg.max_duration = seconds("max_duration_secs", secs)?;
        }
        cfg.tags = CaptureTags {
            camera_id: self.camera_id,
            capture_type: self.capture_type,
            neighborhood: self.neighborhood,
        };
        if let Some(storage) = self.storage {
            if let Some(endpoint) = storage.endpoint {
                cfg.storage.endpoint = endpoint;
            }
            if let Some(access_key) = storage.access_key {
                cfg.storage.access_key = access_key;
            }
            if let Some(secret_key) = storage.secret_key {
                cfg.storage.secret_key = secret_key;
            }
            if let Some(region) = storage.region {
                cfg.storage.region = region;
            }
            if let Some(secure) = storage.secure {
                cfg.storage.secure = secure;
            }
        }
        Ok(cfg)
    }
}

fn seconds(field: &str, value: f64) -> Result<Duration, CaptureError> {
    Duration::try_from_secs_f64(value)
        .ok()
        .filter(|d| !d.is_zero())
        .ok_or_else(|| CaptureError::InvalidConfig(format!("{field} must be a positive number")))
}

pub struct ApiServer {
    cfg: ApiConfig,
    session: Arc<CaptureSession>,
    defaults: Arc<ServiceConfig>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, session: Arc<CaptureSession>, defaults: Arc<ServiceConfig>) -> Self {
        Self {
            cfg,
            session,
            defaults,
        }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let session = self.session;
        let defaults = self.defaults;
        let join = std::thread::Builder::new()
            .name("control-api".into())
            .spawn(move || {
                if let Err(err) = run_api(listener, session, defaults, shutdown_thread) {
                    log::error!("control api stopped: {}", err);
                }
            })?;
        log::info!("control api listening on {}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    session: Arc<CaptureSession>,
    defaults: Arc<ServiceConfig>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let in_flight = Arc::new(AtomicUsize::new(0));
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((mut stream, _)) => {
                let Some(slot) = HandlerSlot::acquire(&in_flight, MAX_IN_FLIGHT) else {
                    log::warn!("control api busy, rejecting connection");
                    let _ = stream.set_nonblocking(false);
                    let _ = write_json_response(&mut stream, 503, r#"{"error":"busy"}"#);
                    continue;
                };
                // start blocks on resolution and probing; keep status responsive
                let session = session.clone();
                let defaults = defaults.clone();
                std::thread::spawn(move || {
                    let _slot = slot;
                    if let Err(err) = handle_connection(stream, &session, &defaults) {
                        log::warn!("control api request rejected: {}", err);
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// One of a bounded number of concurrent request handlers.
struct HandlerSlot {
    in_flight: Arc<AtomicUsize>,
}

impl HandlerSlot {
    fn acquire(in_flight: &Arc<AtomicUsize>, limit: usize) -> Option<Self> {
        in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < limit).then_some(n + 1))
            .ok()?;
        Some(Self {
            in_flight: in_flight.clone(),
        })
    }
}

impl Drop for HandlerSlot {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

fn handle_connection(
    mut stream: TcpStream,
    session: &CaptureSession,
    defaults: &ServiceConfig,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, r#"{"error":"forbidden"}"#)?;
        return Ok(());
    }

    let request = read_request(&mut stream)?;
    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/health") => write_json_response(&mut stream, 200, r#"{"status":"ok"}"#),
        ("GET", "/status") => {
            let payload = serde_json::to_vec(&session.status())?;
            write_response(&mut stream, 200, "application/json", &payload)
        }
        ("POST", "/start") => {
            let outcome = serde_json::from_slice::<StartRequest>(&request.body)
                .map_err(|err| CaptureError::InvalidConfig(format!("invalid start request: {err}")))
                .and_then(|req| req.into_capture_config(defaults))
                .and_then(|cfg| session.start(cfg));
            write_outcome(&mut stream, outcome)
        }
        ("POST", "/stop") => write_outcome(&mut stream, session.stop()),
        (_, "/health" | "/status" | "/start" | "/stop") => {
            write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)
        }
        _ => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
    }
}

fn write_outcome(stream: &mut TcpStream, outcome: Result<String, CaptureError>) -> Result<()> {
    let (status, body) = match outcome {
        Ok(message) => (200, serde_json::json!({ "ok": true, "message": message })),
        Err(err) => {
            log::warn!("control request failed: {}", err);
            (
                err.http_status(),
                serde_json::json!({ "ok": false, "error": err.code(), "message": err.to_string() }),
            )
        }
    };
    write_response(stream, status, "application/json", &serde_json::to_vec(&body)?)
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of headers"));
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_HEADER_BYTES + MAX_BODY_BYTES {
            return Err(anyhow!("request too large"));
        }
    };
    if header_end > MAX_HEADER_BYTES {
        return Err(anyhow!("request headers too large"));
    }

    let text = String::from_utf8_lossy(&data[..header_end]).into_owned();
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid content-length"))?,
        None => 0,
    };
    if content_length > MAX_BODY_BYTES {
        return Err(anyhow!("request body too large"));
    }
    let mut body = data[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of body"));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        body,
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        409 => "HTTP/1.1 409 Conflict",
        422 => "HTTP/1.1 422 Unprocessable Entity",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    body: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CaptureDefaults, ProbeSettings, RecorderTuning, ResolverSettings, StorageSettings};

    fn defaults() -> ServiceConfig {
        ServiceConfig {
            api_addr: "127.0.0.1:0".into(),
            storage: StorageSettings {
                endpoint: "minio.local:9000".into(),
                region: "us-east-1".into(),
                ..StorageSettings::default()
            },
            defaults: CaptureDefaults {
                bucket: "chunks".into(),
                prefix: "cams".into(),
                ..CaptureDefaults::default()
            },
            resolver: ResolverSettings::default(),
            probe: ProbeSettings::default(),
            tuning: RecorderTuning::default(),
        }
    }

    #[test]
    fn handler_slots_are_bounded_and_released() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let first = HandlerSlot::acquire(&in_flight, 2).unwrap();
        let second = HandlerSlot::acquire(&in_flight, 2).unwrap();
        assert!(HandlerSlot::acquire(&in_flight, 2).is_none());
        assert_eq!(in_flight.load(Ordering::SeqCst), 2);

        drop(first);
        let third = HandlerSlot::acquire(&in_flight, 2).unwrap();
        drop(second);
        drop(third);
        assert_eq!(in_flight.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn start_request_falls_back_to_defaults() {
        let req: StartRequest =
            serde_json::from_str(r#"{"url":"rtsp://cam/live","camera_id":"cam-3"}"#).unwrap();
        let cfg = req.into_capture_config(&defaults()).unwrap();
        assert_eq!(cfg.source, "rtsp://cam/live");
        assert_eq!(cfg.bucket, "chunks");
        assert_eq!(cfg.prefix, "cams");
        assert_eq!(cfg.chunk_interval, Duration::from_secs(10));
        assert_eq!(cfg.tags.camera_id.as_deref(), Some("cam-3"));
        assert_eq!(cfg.storage.endpoint, "minio.local:9000");
    }

    #[test]
    fn start_request_overrides() {
        let req: StartRequest = serde_json::from_str(
            r#"{"source":"stub://live","chunk_interval_secs":0.5,"bucket":"other","storage":{"secure":false}}"#,
        )
        .unwrap();
        let cfg = req.into_capture_config(&defaults()).unwrap();
        assert_eq!(cfg.chunk_interval, Duration::from_millis(500));
        assert_eq!(cfg.bucket, "other");
        assert!(!cfg.storage.secure);
    }

    #[test]
    fn rejects_non_positive_durations_and_unknown_fields() {
        let req: StartRequest =
            serde_json::from_str(r#"{"source":"stub://live","max_duration_secs":-1}"#).unwrap();
        assert!(req.into_capture_config(&defaults()).is_err());
        assert!(serde_json::from_str::<StartRequest>(r#"{"source":"x","bogus":1}"#).is_err());
    }
}
