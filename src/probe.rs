//! Pre-start decode check.

use crate::config::ProbeSettings;
use crate::error::{CaptureError, CaptureResult};
use crate::ingest::{FrameSource, MediaEngine};
use crate::resolve::ResolvedSource;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeOutcome {
    /// Backend that decoded the first frame. None when the probe passed on trust.
    pub backend: Option<&'static str>,
    pub verified: bool,
}

pub struct StreamProbe<'a> {
    engine: &'a MediaEngine,
    settings: &'a ProbeSettings,
}

impl<'a> StreamProbe<'a> {
    pub fn new(engine: &'a MediaEngine, settings: &'a ProbeSettings) -> Self {
        Self { engine, settings }
    }

    /// Confirms `source` yields a frame with at least one backend.
    pub fn check(&self, source: &ResolvedSource) -> CaptureResult<ProbeOutcome> {
        let candidates = self.engine.candidates(&source.url);
        let mut failures = Vec::new();

        for backend in candidates {
            let mut handle = match backend.open_source(&source.url) {
                Ok(handle) => handle,
                Err(err) => {
                    log::warn!("probe: {} could not open source: {:#}", backend.name(), err);
                    failures.push(format!("{}: {:#}", backend.name(), err));
                    continue;
                }
            };
            let decoded = self.decode_one(handle.as_mut());
            handle.close();
            if decoded {
                log::info!("probe: {} decoded a frame", backend.name());
                return Ok(ProbeOutcome {
                    backend: Some(backend.name()),
                    verified: true,
                });
            }
            failures.push(format!(
                "{}: no frame after {} reads",
                backend.name(),
                self.settings.reads_per_backend
            ));
        }

        if source.degraded && self.settings.trust_degraded_sources {
            log::warn!("probe: no frame decoded from degraded source, starting anyway");
            return Ok(ProbeOutcome {
                backend: None,
                verified: false,
            });
        }

        Err(CaptureError::StreamUnusable {
            url: crate::config::redact_url_credentials(&source.url),
            reason: if failures.is_empty() {
                "no media backend accepts this source".into()
            } else {
                failures.join("; ")
            },
        })
    }

    fn decode_one(&self, handle: &mut dyn FrameSource) -> bool {
        for attempt in 0..self.settings.reads_per_backend.max(1) {
            if handle.read_frame().is_ok() {
                return true;
            }
            if attempt + 1 < self.settings.reads_per_backend {
                std::thread::sleep(self.settings.read_backoff);
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::SyntheticBackend;
    use std::sync::Arc;
    use std::time::Duration;

    fn engine() -> MediaEngine {
        MediaEngine::new(vec![Arc::new(SyntheticBackend)])
    }

    fn settings(trust: bool) -> ProbeSettings {
        ProbeSettings {
            reads_per_backend: 2,
            read_backoff: Duration::from_millis(1),
            trust_degraded_sources: trust,
        }
    }

    #[test]
    fn passes_for_decodable_source() {
        let engine = engine();
        let settings = settings(false);
        let outcome = StreamProbe::new(&engine, &settings)
            .check(&ResolvedSource::direct("stub://live?realtime=0"))
            .unwrap();
        assert!(outcome.verified);
        assert_eq!(outcome.backend, Some(SyntheticBackend::NAME));
    }

    #[test]
    fn rejects_direct_source_without_frames() {
        let engine = engine();
        let settings = settings(true);
        let err = StreamProbe::new(&engine, &settings)
            .check(&ResolvedSource::direct("stub://dead"))
            .unwrap_err();
        assert!(matches!(err, CaptureError::StreamUnusable { .. }));
    }

    #[test]
    fn degraded_source_passes_only_when_trusted() {
        let engine = engine();
        let degraded = ResolvedSource {
            url: "stub://dead".into(),
            degraded: true,
        };

        let trusting = settings(true);
        let outcome = StreamProbe::new(&engine, &trusting).check(&degraded).unwrap();
        assert!(!outcome.verified);
        assert_eq!(outcome.backend, None);

        let strict = settings(false);
        assert!(StreamProbe::new(&engine, &strict).check(&degraded).is_err());
    }

    #[test]
    fn unopenable_source_is_unusable() {
        let engine = engine();
        let settings = settings(false);
        let err = StreamProbe::new(&engine, &settings)
            .check(&ResolvedSource::direct("stub://unopenable"))
            .unwrap_err();
        assert_eq!(err.code(), "stream_unusable");
    }
}
