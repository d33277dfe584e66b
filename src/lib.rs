//! tbc-export library
//!
//! Converts raw time-base-corrected (TBC) video captures into standard
//! container files by orchestrating external decode and encode tools: it
//! builds the process graph, streams media between stages over named pipes,
//! checksums every inter-stage stream, normalizes each tool's progress
//! output into one readout, and guarantees ordered startup and teardown.
//! It never inspects decoded pixel data itself.

pub mod cli;
pub mod command;
pub mod error;
pub mod input;
pub mod integrity;
pub mod pipeline;
pub mod profile;
pub mod progress;

// Re-export commonly used types
pub use command::{CommandBuilder, Overrides, PipelinePlan, ProcessSpec, StageRole};
pub use error::{ExportError, ExportResult};
pub use input::{InputDescriptor, SignalType};
pub use integrity::{IntegrityWarning, StreamDigest};
pub use pipeline::{
    export, CancelFlag, ExportSummary, PipelineController, PipelineOptions, ProcessLauncher,
    TokioLauncher,
};
pub use profile::{Profile, ProfileRegistry};
pub use progress::readout::{PipelineState, Readout, ReadoutSnapshot};
pub use progress::ProgressRecord;
