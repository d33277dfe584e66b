//! Error handling module for tbc-export

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::command::StageRole;

/// Main error type for export operations.
///
/// Configuration errors are detected before any process launches and leave
/// zero side effects; everything else is surfaced by the pipeline controller
/// as the single terminal outcome of a run.
#[derive(Error, Debug)]
pub enum ExportError {
    /// Requested profile does not exist in the registry
    #[error("unknown profile: {name}")]
    UnknownProfile { name: String },

    /// Profile definition failed validation at the loading boundary
    #[error("invalid profile definition: {message}")]
    InvalidProfile { message: String },

    /// Profile cannot be combined with the detected signal type
    #[error("profile '{profile}' cannot encode a {signal} source: {reason}")]
    InvalidCombination {
        profile: String,
        signal: String,
        reason: String,
    },

    /// Input descriptor is malformed (missing TBC data or metadata sidecar)
    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    /// An external executable is missing or failed to start
    #[error("failed to launch {role}: {source}")]
    Launch {
        role: StageRole,
        #[source]
        source: std::io::Error,
    },

    /// A running stage exited with a non-zero status or crashed
    #[error("{role} exited with status {code}")]
    StageFailed {
        role: StageRole,
        code: i32,
        /// Last diagnostic lines captured from the failing stage
        tail: Vec<String>,
    },

    /// Watchdog timeout: no exit and no progress within the window
    #[error("{role} stalled: no liveness signal within {window:?}")]
    Stalled { role: StageRole, window: Duration },

    /// Explicit external cancellation
    #[error("export cancelled by user")]
    Cancelled,

    /// Inter-process pipe could not be created or released
    #[error("pipe error: {message}")]
    Pipe { message: String },

    /// Pipeline finished but the output file is missing or empty
    #[error("output file missing or empty: {path}")]
    OutputMissing { path: PathBuf },

    /// I/O error
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExportError {
    /// True for errors detected before any process launches.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ExportError::UnknownProfile { .. }
                | ExportError::InvalidProfile { .. }
                | ExportError::InvalidCombination { .. }
                | ExportError::InvalidInput { .. }
        )
    }

    /// Process exit code the CLI layer maps this error to.
    ///
    /// Configuration errors and runtime failures are distinct so scripts can
    /// tell a bad invocation from a broken run; cancellation follows the
    /// conventional 128+SIGINT value.
    pub fn exit_code(&self) -> u8 {
        match self {
            ExportError::Cancelled => 130,
            e if e.is_configuration() => 2,
            _ => 1,
        }
    }

    /// Diagnostic tail of the failing stage, if one was captured.
    pub fn diagnostic_tail(&self) -> &[String] {
        match self {
            ExportError::StageFailed { tail, .. } => tail,
            _ => &[],
        }
    }
}

/// Result type alias for export operations
pub type ExportResult<T> = std::result::Result<T, ExportError>;
