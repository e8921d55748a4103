//! Stream classification.
//!
//! A stream that reports no frame count is treated as live: recording runs until
//! an explicit stop or until the source dies. A stream with a known frame count
//! is finite and additionally bounded by the session's maximum duration.

use serde::Serialize;
use std::time::Duration;

/// Frame rate assumed when a source reports zero or a negative value.
pub const DEFAULT_FRAME_RATE: f64 = 30.0;

/// Raw metadata as reported by a freshly opened frame source.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SourceMetadata {
    pub frame_rate: f64,
    pub width: u32,
    pub height: u32,
    /// Reported total frame count. Zero or negative when unknown (live).
    pub total_frames: i64,
}

/// Immutable properties of the stream for the lifetime of a session.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct StreamProperties {
    pub frame_rate: f64,
    pub width: u32,
    pub height: u32,
    pub total_frames: i64,
    pub is_live: bool,
    /// Approximate duration in seconds for finite streams.
    pub approx_duration_secs: Option<f64>,
}

impl StreamProperties {
    pub fn classify(meta: &SourceMetadata) -> Self {
        let frame_rate = if meta.frame_rate.is_finite() && meta.frame_rate > 0.0 {
            meta.frame_rate
        } else {
            DEFAULT_FRAME_RATE
        };
        let is_live = meta.total_frames <= 0;
        let approx_duration_secs = if is_live {
            None
        } else {
            Some(meta.total_frames as f64 / frame_rate)
        };
        Self {
            frame_rate,
            width: meta.width,
            height: meta.height,
            total_frames: meta.total_frames,
            is_live,
            approx_duration_secs,
        }
    }

    /// Time between frames, never longer than one second.
    pub fn frame_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.frame_rate.max(1.0))
    }

    pub fn kind(&self) -> &'static str {
        if self.is_live {
            "live"
        } else {
            "vod"
        }
    }
}
