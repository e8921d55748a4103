//! Chunk upload to object storage.
//!
//! `ObjectStore` is the single "put object with metadata" operation the
//! recorder needs. `S3ObjectStore` talks to any S3-compatible endpoint using
//! presigned PUT requests; `InMemoryObjectStore` keeps objects in memory.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusty_s3::S3Action;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::{CaptureConfig, CaptureTags, StorageSettings};
use crate::error::{CaptureError, CaptureResult};
use crate::recorder::ChunkRecord;

const PRESIGN_TTL: Duration = Duration::from_secs(900);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(120);

pub type ObjectMetadata = BTreeMap<String, String>;

/// Destination object storage.
pub trait ObjectStore: Send + Sync {
    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        path: &Path,
        content_type: &str,
        metadata: &ObjectMetadata,
    ) -> Result<()>;
}

/// Builds a store client from per-session storage settings.
pub trait ObjectStoreConnector: Send + Sync {
    fn connect(&self, settings: &StorageSettings) -> Result<Arc<dyn ObjectStore>>;
}

// -------------------- S3 --------------------

pub struct S3ObjectStore {
    base_url: url::Url,
    region: String,
    credentials: Option<rusty_s3::Credentials>,
    agent: ureq::Agent,
}

impl S3ObjectStore {
    pub fn new(settings: &StorageSettings) -> Result<Self> {
        let scheme = if settings.secure { "https" } else { "http" };
        let base_url = url::Url::parse(&format!("{}://{}", scheme, settings.endpoint))
            .with_context(|| format!("invalid storage endpoint '{}'", settings.endpoint))?;
        let credentials = if settings.access_key.is_empty() {
            None
        } else {
            Some(rusty_s3::Credentials::new(
                settings.access_key.clone(),
                settings.secret_key.clone(),
            ))
        };
        let agent = ureq::AgentBuilder::new().timeout(UPLOAD_TIMEOUT).build();
        Ok(Self {
            base_url,
            region: settings.region.clone(),
            credentials,
            agent,
        })
    }
}

impl ObjectStore for S3ObjectStore {
    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        path: &Path,
        content_type: &str,
        metadata: &ObjectMetadata,
    ) -> Result<()> {
        let bucket = rusty_s3::Bucket::new(
            self.base_url.clone(),
            rusty_s3::UrlStyle::Path,
            bucket.to_string(),
            self.region.clone(),
        )
        .map_err(|e| anyhow!("invalid bucket '{}': {}", bucket, e))?;

        let mut headers = vec![("content-type".to_string(), content_type.to_string())];
        headers.extend(
            metadata
                .iter()
                .map(|(name, value)| (format!("x-amz-meta-{}", name), value.clone())),
        );

        let mut action = bucket.put_object(self.credentials.as_ref(), key);
        for (name, value) in &headers {
            action.headers_mut().insert(name.clone(), value.clone());
        }
        let signed = action.sign(PRESIGN_TTL);

        let file = File::open(path).with_context(|| format!("open chunk {}", path.display()))?;
        let length = file
            .metadata()
            .with_context(|| format!("stat chunk {}", path.display()))?
            .len();

        let mut request = self
            .agent
            .put(signed.as_str())
            .set("Content-Length", &length.to_string());
        for (name, value) in &headers {
            request = request.set(name, value);
        }
        match request.send(file) {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(code, response)) => {
                let body = response.into_string().unwrap_or_default();
                Err(anyhow!(
                    "object store rejected {} with HTTP {}: {}",
                    key,
                    code,
                    body.chars().take(200).collect::<String>()
                ))
            }
            Err(err) => Err(anyhow!("object store request for {} failed: {}", key, err)),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct S3Connector;

impl ObjectStoreConnector for S3Connector {
    fn connect(&self, settings: &StorageSettings) -> Result<Arc<dyn ObjectStore>> {
        Ok(Arc::new(S3ObjectStore::new(settings)?))
    }
}

// -------------------- In-memory --------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub metadata: ObjectMetadata,
}

/// Keeps objects in memory. Failures can be injected.
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<BTreeMap<(String, String), StoredObject>>,
    fail_next: AtomicUsize,
    fail_all: AtomicBool,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `count` uploads.
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_all.store(failing, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.objects.lock().map(|objects| objects.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects
            .lock()
            .map(|objects| objects.keys().map(|(_, key)| key.clone()).collect())
            .unwrap_or_default()
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.objects
            .lock()
            .ok()?
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    fn should_fail(&self) -> bool {
        if self.fail_all.load(Ordering::SeqCst) {
            return true;
        }
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        path: &Path,
        content_type: &str,
        metadata: &ObjectMetadata,
    ) -> Result<()> {
        if self.should_fail() {
            return Err(anyhow!("injected upload failure"));
        }
        let bytes = std::fs::read(path).with_context(|| format!("read chunk {}", path.display()))?;
        let mut objects = self
            .objects
            .lock()
            .map_err(|_| anyhow!("object store lock poisoned"))?;
        objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                bytes,
                content_type: content_type.to_string(),
                metadata: metadata.clone(),
            },
        );
        Ok(())
    }
}

/// Hands out the same store for every session.
pub struct SharedStoreConnector {
    store: Arc<dyn ObjectStore>,
}

impl SharedStoreConnector {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

impl ObjectStoreConnector for SharedStoreConnector {
    fn connect(&self, _settings: &StorageSettings) -> Result<Arc<dyn ObjectStore>> {
        Ok(self.store.clone())
    }
}

// -------------------- Upload sink --------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadReceipt {
    pub key: String,
    /// False when the object was stored but the local file could not be removed.
    pub local_removed: bool,
}

/// Pushes finished chunks to the session's bucket.
pub struct UploadSink {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    prefix: String,
    tags: CaptureTags,
}

impl UploadSink {
    pub fn new(store: Arc<dyn ObjectStore>, config: &CaptureConfig) -> Self {
        Self {
            store,
            bucket: config.bucket.clone(),
            prefix: config.prefix.trim_matches('/').to_string(),
            tags: config.tags.clone(),
        }
    }

    pub fn object_key(&self, file_name: &str) -> String {
        if self.prefix.is_empty() {
            file_name.to_string()
        } else {
            format!("{}/{}", self.prefix, file_name)
        }
    }

    pub fn metadata(&self, captured_at: DateTime<Utc>) -> ObjectMetadata {
        let mut metadata = ObjectMetadata::new();
        let tags = [
            ("camera-id", self.tags.camera_id.as_deref()),
            ("capture-type", self.tags.capture_type.as_deref()),
            ("neighborhood", self.tags.neighborhood.as_deref()),
        ];
        for (name, value) in tags {
            if let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) {
                metadata.insert(name.to_string(), value.to_string());
            }
        }
        metadata.insert(
            "capture-timestamp".to_string(),
            captured_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        );
        metadata
    }

    /// Push the chunk and delete the local copy. On failure the file is left
    /// in place.
    pub fn upload(&self, chunk: &ChunkRecord) -> CaptureResult<UploadReceipt> {
        let key = self.object_key(&chunk.file_name);
        let metadata = self.metadata(chunk.started_at);
        self.store
            .put_object(
                &self.bucket,
                &key,
                &chunk.path,
                content_type_for(&chunk.path),
                &metadata,
            )
            .map_err(|err| CaptureError::UploadFailed {
                key: key.clone(),
                reason: format!("{err:#}"),
            })?;

        let local_removed = match std::fs::remove_file(&chunk.path) {
            Ok(()) => true,
            Err(err) => {
                log::warn!(
                    "uploaded {} but could not remove {}: {}",
                    key,
                    chunk.path.display(),
                    err
                );
                false
            }
        };
        log::info!(
            "uploaded {} ({} bytes, {} frames)",
            key,
            chunk.size_bytes,
            chunk.frames_written
        );
        Ok(UploadReceipt { key, local_removed })
    }
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("mp4") => "video/mp4",
        Some("mkv") => "video/x-matroska",
        Some("ts") => "video/mp2t",
        _ => "application/octet-stream",
    }
}
