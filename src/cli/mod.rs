//! CLI module for tbc-export
//!
//! Argument parsing and the mapping from pipeline outcomes to process exit
//! codes. The readout printer here is the one consumer of the aggregator's
//! pull-based snapshot.

pub mod args;

use std::time::Duration;

use tracing::{info, warn};

use crate::command::StageRole;
use crate::error::ExportError;
use crate::pipeline::ExportSummary;
use crate::progress::readout::{PipelineState, Readout};

pub use args::Cli;

/// Periodically pull a snapshot and log one status line per stage. Runs
/// until the pipeline reaches a terminal state; the cadence belongs to this
/// consumer, not to the stages producing the records.
pub async fn print_readout(readout: Readout, refresh: Duration) {
    let mut interval = tokio::time::interval(refresh);
    loop {
        interval.tick().await;
        let snapshot = readout.snapshot();

        for record in snapshot.records.values() {
            let percent = record
                .percent()
                .map(|p| format!("{p:5.1}%"))
                .unwrap_or_else(|| "  ?  ".into());
            let fps = record
                .fps
                .map(|f| format!("{f:.1} fps"))
                .unwrap_or_else(|| "- fps".into());
            let eta = record
                .eta()
                .map(|d| format!("eta {}s", d.as_secs()))
                .unwrap_or_else(|| "eta -".into());
            info!(
                "{:>14}: {} {:>8} frames  {}  {}",
                record.role.to_string(),
                percent,
                record.frames,
                fps,
                eta
            );
        }

        if matches!(
            snapshot.state,
            PipelineState::Completed | PipelineState::Aborted
        ) {
            break;
        }
    }
}

/// One terminal summary for a finished run.
pub fn report_success(summary: &ExportSummary) {
    info!(
        "export finished in {:.1}s: {}",
        summary.elapsed.as_secs_f64(),
        summary.output_path.display()
    );
    for digest in &summary.digests {
        info!(
            "stream '{}': {} bytes, sha256 {}",
            digest.pipe_id, digest.bytes, digest.sha256
        );
    }
    for warning in &summary.warnings {
        warn!("integrity: {warning}");
    }
}

/// One terminal failure summary naming the failing stage and its last
/// diagnostic lines. Never a raw trace dump.
pub fn report_failure(error: &ExportError) {
    tracing::error!("export failed: {error}");
    let tail = error.diagnostic_tail();
    if !tail.is_empty() {
        let role = match error {
            ExportError::StageFailed { role, .. } => *role,
            _ => StageRole::Encoder,
        };
        tracing::error!("last output from {role}:");
        for line in tail {
            tracing::error!("  {line}");
        }
    }
}
