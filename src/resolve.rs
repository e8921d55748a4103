//! Source resolution.
//!
//! Platform links (YouTube, Twitch, ...) are handed to an external resolver with
//! a preference-ordered list of format selectors. Direct URLs and local paths
//! are returned untouched. Adaptive manifests (HLS/DASH) are only accepted as a
//! degraded fallback once every direct option is exhausted.

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use crate::config::ResolverSettings;
use crate::error::{CaptureError, CaptureResult};

const PLATFORM_HOSTS: &[&str] = &[
    "youtube.com",
    "youtu.be",
    "twitch.tv",
    "vimeo.com",
    "dailymotion.com",
    "facebook.com",
    "fb.watch",
    "instagram.com",
    "tiktok.com",
    "kick.com",
];

const WAIT_POLL: Duration = Duration::from_millis(50);

/// Turns a stream reference into a direct media URL using a format selector.
pub trait Resolver: Send + Sync {
    fn resolve(&self, reference: &str, selector: &str) -> Result<String>;
}

/// Output of resolution. `degraded` marks a manifest URL accepted as last resort.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedSource {
    pub url: String,
    pub degraded: bool,
}

impl ResolvedSource {
    pub fn direct(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            degraded: false,
        }
    }
}

pub fn is_platform_link(reference: &str) -> bool {
    let Ok(url) = url::Url::parse(reference) else {
        return false;
    };
    if !matches!(url.scheme(), "http" | "https") {
        return false;
    }
    let Some(host) = url.host_str() else {
        return false;
    };
    let host = host.to_ascii_lowercase();
    PLATFORM_HOSTS
        .iter()
        .any(|platform| host == *platform || host.ends_with(&format!(".{platform}")))
}

pub fn is_manifest_url(url: &str) -> bool {
    static MANIFEST: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = MANIFEST.get_or_init(|| {
        Regex::new(r"(?i)(\.m3u8|\.mpd)(\?|$|/)|/manifest(/|\?|$)|/(hls|dash)/|\bmanifest\.(m3u8|mpd)")
            .ok()
    });
    match pattern {
        Some(re) => re.is_match(url),
        None => url.contains(".m3u8") || url.contains(".mpd"),
    }
}

/// Format selectors in preference order, capped at `max_height`.
pub fn preferred_selectors(max_height: u32) -> Vec<String> {
    vec![
        format!("best[height<={max_height}][protocol^=http][protocol!*=m3u8][protocol!*=dash]"),
        format!("bestvideo[height<={max_height}][protocol^=http][protocol!*=m3u8]+bestaudio[protocol^=http]"),
        format!("best[height<={max_height}]"),
        "best".to_string(),
    ]
}

/// Selector restricted to progressive transports.
pub const DIRECT_PROTOCOL_SELECTOR: &str = "best[protocol=https]/best[protocol=http]";

/// Resolve `reference` into something the media engine can open.
pub fn resolve_source(
    resolver: &dyn Resolver,
    reference: &str,
    max_height: u32,
) -> CaptureResult<ResolvedSource> {
    let reference = reference.trim();
    if reference.is_empty() {
        return Err(CaptureError::ResolutionFailed {
            reference: String::new(),
            reason: "empty source reference".into(),
        });
    }
    if !is_platform_link(reference) {
        return Ok(ResolvedSource::direct(reference));
    }

    let mut manifest_fallback: Option<String> = None;
    let mut failures = Vec::new();

    for selector in preferred_selectors(max_height) {
        match resolver.resolve(reference, &selector) {
            Ok(url) if is_manifest_url(&url) => {
                log::info!("selector '{}' produced a manifest, trying next", selector);
                manifest_fallback.get_or_insert(url);
            }
            Ok(url) => {
                log::info!("resolved {} with selector '{}'", reference, selector);
                return Ok(ResolvedSource::direct(url));
            }
            Err(err) => {
                log::warn!("selector '{}' failed: {:#}", selector, err);
                failures.push(format!("{selector}: {err:#}"));
            }
        }
    }

    match resolver.resolve(reference, DIRECT_PROTOCOL_SELECTOR) {
        Ok(url) if !is_manifest_url(&url) => {
            log::info!("resolved {} with direct-protocol selector", reference);
            return Ok(ResolvedSource::direct(url));
        }
        Ok(url) => {
            manifest_fallback.get_or_insert(url);
        }
        Err(err) => {
            log::warn!("direct-protocol selector failed: {:#}", err);
            failures.push(format!("{DIRECT_PROTOCOL_SELECTOR}: {err:#}"));
        }
    }

    match manifest_fallback {
        Some(url) => {
            log::warn!(
                "no direct media URL for {}, continuing with manifest (degraded)",
                reference
            );
            Ok(ResolvedSource {
                url,
                degraded: true,
            })
        }
        None => Err(CaptureError::ResolutionFailed {
            reference: reference.to_string(),
            reason: if failures.is_empty() {
                "resolver produced no URL".into()
            } else {
                failures.join("; ")
            },
        }),
    }
}

/// Runs `yt-dlp -g` (or a compatible tool) as a bounded child process.
#[derive(Clone, Debug)]
pub struct YtDlpResolver {
    pub program: String,
    pub timeout: Duration,
}

impl YtDlpResolver {
    pub fn new(settings: &ResolverSettings) -> Self {
        Self {
            program: settings.program.clone(),
            timeout: settings.timeout,
        }
    }
}

impl Resolver for YtDlpResolver {
    fn resolve(&self, reference: &str, selector: &str) -> Result<String> {
        let mut child = Command::new(&self.program)
            .args(["-g", "-f", selector, "--no-playlist", "--no-warnings", reference])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("spawn resolver '{}'", self.program))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("resolver stdout unavailable"))?;
        let reader = std::thread::spawn(move || {
            let mut out = String::new();
            let _ = stdout.read_to_string(&mut out);
            out
        });

        let started = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait().context("wait for resolver")? {
                break status;
            }
            if started.elapsed() >= self.timeout {
                let _ = child.kill();
                let _ = child.wait();
                let _ = reader.join();
                return Err(anyhow!(
                    "resolver timed out after {}s",
                    self.timeout.as_secs()
                ));
            }
            std::thread::sleep(WAIT_POLL);
        };

        let output = reader
            .join()
            .map_err(|_| anyhow!("resolver output reader panicked"))?;
        if !status.success() {
            return Err(anyhow!("resolver exited with {}", status));
        }
        output
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("resolver printed no URL"))
    }
}
