//! Progress parsing and aggregation
//!
//! Each external tool reports progress in its own line format on its
//! diagnostic stream. The parsers normalize those into [`ProgressRecord`]s,
//! and the [`readout::Readout`] collects the latest record per stage for the
//! terminal UI to pull at its own cadence.

pub mod parser;
pub mod readout;

use std::time::Duration;

use crate::command::StageRole;

/// Stage-specific signal-quality counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QualityCounters {
    /// Decoder dropout concealments
    pub dropouts: u64,
    /// Decoder warning/critical lines
    pub warnings: u64,
    /// Encoder dropped frames
    pub dropped_frames: u64,
    /// Encoder duplicated frames
    pub duplicated_frames: u64,
}

/// Normalized progress for one stage. Older records are replaced wholesale,
/// never merged.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressRecord {
    pub role: StageRole,
    /// Frames completed so far
    pub frames: u64,
    /// Total frames, when the stage has announced or been told one
    pub total_frames: Option<u64>,
    /// Current processing rate in frames per second
    pub fps: Option<f64>,
    /// Output bitrate in kbit/s (encoder only)
    pub bitrate_kbps: Option<f64>,
    /// Bytes written so far (encoder only)
    pub out_size: Option<u64>,
    pub quality: QualityCounters,
}

impl ProgressRecord {
    pub fn new(role: StageRole) -> Self {
        Self {
            role,
            frames: 0,
            total_frames: None,
            fps: None,
            bitrate_kbps: None,
            out_size: None,
            quality: QualityCounters::default(),
        }
    }

    /// Estimated time remaining, when both a total and a rate are known.
    pub fn eta(&self) -> Option<Duration> {
        let total = self.total_frames?;
        let fps = self.fps.filter(|f| *f > 0.0)?;
        let remaining = total.saturating_sub(self.frames);
        Some(Duration::from_secs_f64(remaining as f64 / fps))
    }

    /// Completion in percent, when a total is known.
    pub fn percent(&self) -> Option<f64> {
        let total = self.total_frames.filter(|t| *t > 0)?;
        Some((self.frames as f64 / total as f64 * 100.0).min(100.0))
    }
}
