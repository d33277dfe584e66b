//! Process launcher port
//!
//! The controller talks to the operating system through this seam so tests
//! can count or fake launches without touching real executables.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use crate::command::{ProcessSpec, StageOutput};
use crate::error::{ExportError, ExportResult};

/// Port for spawning pipeline stages.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Spawn the process described by `spec` with its streams wired for the
    /// orchestrator: stdin closed, stderr captured, stdout captured unless
    /// the spec marks it uninteresting.
    async fn launch(&self, spec: &ProcessSpec) -> ExportResult<Child>;
}

/// Production launcher backed by `tokio::process`.
pub struct TokioLauncher;

#[async_trait]
impl ProcessLauncher for TokioLauncher {
    async fn launch(&self, spec: &ProcessSpec) -> ExportResult<Child> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(match spec.stdout {
                StageOutput::Null => Stdio::null(),
                _ => Stdio::piped(),
            })
            .stderr(Stdio::piped())
            // a dropped handle must never leave an orphan writing to a pipe
            .kill_on_drop(true);

        command.spawn().map_err(|source| ExportError::Launch {
            role: spec.role,
            source,
        })
    }
}
