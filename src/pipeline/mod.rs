//! Pipeline controller
//!
//! Owns the lifecycle of the whole process graph: ordered launch, liveness
//! supervision, cancellation and unified failure reporting. Stages launch
//! upstream-before-downstream and tear down downstream-before-upstream, so
//! a reader never blocks on a writer-less pipe and a killed encoder never
//! leaves a decoder writing into a closed pipe indefinitely.

pub mod launcher;
pub mod stage;

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::command::{
    CommandBuilder, DiagnosticStream, Overrides, PipeSpec, PipelinePlan, StageOutput, StageRole,
};
use crate::error::{ExportError, ExportResult};
use crate::input::InputDescriptor;
use crate::integrity::{IntegrityWarning, StreamDigest};
use crate::profile::ProfileRegistry;
use crate::progress::parser::{LineAssembler, LineParser};
use crate::progress::readout::{PipelineState, Readout, StageEventKind};

pub use launcher::{ProcessLauncher, TokioLauncher};
pub use stage::{StageRuntime, StageState};

/// Timing knobs of the supervisory loop.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Supervisor tick: liveness poll and snapshot republish interval
    pub tick: Duration,
    /// Watchdog window: a stage with neither output nor exit for this long
    /// is treated as hung
    pub watchdog: Duration,
    /// Grace period between the termination signal and a forced kill
    pub grace: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(250),
            watchdog: Duration::from_secs(60),
            grace: Duration::from_secs(3),
        }
    }
}

/// One cancellation signal shared between the CLI signal handler and the
/// controller; the controller translates it into the full reverse-order
/// termination sequence.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Successful terminal outcome of a run.
#[derive(Debug)]
pub struct ExportSummary {
    pub output_path: std::path::PathBuf,
    /// Checksum per monitored inter-stage stream
    pub digests: Vec<StreamDigest>,
    /// Encoder output total derived from the source field count
    pub expected_frames: u64,
    /// Final frame count the encoder reported, when it reported one
    pub encoded_frames: Option<u64>,
    pub warnings: Vec<IntegrityWarning>,
    pub elapsed: Duration,
}

/// Resolve, build and run the whole export. This is the entry point the CLI
/// layer calls; a configuration error returns before any process launches.
#[allow(clippy::too_many_arguments)]
pub async fn export(
    input: &InputDescriptor,
    profile_name: &str,
    registry: &ProfileRegistry,
    overrides: &Overrides,
    output: Option<&Path>,
    expected_checksums: &[(String, String)],
    launcher: &dyn ProcessLauncher,
    options: PipelineOptions,
    readout: Readout,
    cancel: CancelFlag,
) -> ExportResult<ExportSummary> {
    let profile = registry.resolve(profile_name)?;

    // per-run pipe directory; removed when the run ends
    let run_dir = tempfile::Builder::new().prefix("tbc-export-").tempdir()?;
    let plan = CommandBuilder::new(input, profile, overrides, run_dir.path()).build(output)?;

    preflight(&plan)?;

    let controller = PipelineController::new(launcher, readout, cancel, options)
        .with_expected_checksums(expected_checksums.to_vec());
    controller.run(&plan).await
}

/// Verify every stage executable exists before launching anything, so a
/// missing tool aborts with zero processes started.
fn preflight(plan: &PipelinePlan) -> ExportResult<()> {
    for spec in &plan.stages {
        which::which(&spec.program).map_err(|_| ExportError::Launch {
            role: spec.role,
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("'{}' not found in PATH", spec.program),
            ),
        })?;
    }
    Ok(())
}

type PumpHandle = JoinHandle<std::io::Result<StreamDigest>>;

/// Supervises one pipeline run from launch to terminal state.
pub struct PipelineController<'a> {
    launcher: &'a dyn ProcessLauncher,
    readout: Readout,
    cancel: CancelFlag,
    options: PipelineOptions,
    /// Externally supplied (pipe id, sha256) pairs checked against the
    /// collected digests after a completed run
    expected_checksums: Vec<(String, String)>,
}

impl<'a> PipelineController<'a> {
    pub fn new(
        launcher: &'a dyn ProcessLauncher,
        readout: Readout,
        cancel: CancelFlag,
        options: PipelineOptions,
    ) -> Self {
        Self {
            launcher,
            readout,
            cancel,
            options,
            expected_checksums: Vec::new(),
        }
    }

    /// Expected stream checksums, typically from a previous run of the same
    /// capture. A mismatch is reported as a warning, never a failure.
    pub fn with_expected_checksums(mut self, expected: Vec<(String, String)>) -> Self {
        self.expected_checksums = expected;
        self
    }

    /// Run the plan to completion or teardown.
    pub async fn run(&self, plan: &PipelinePlan) -> ExportResult<ExportSummary> {
        let started = Instant::now();
        self.readout.set_state(PipelineState::Launching);

        // pipes exist before either side starts, so neither end can block
        // on an open that will never be matched
        for pipe in &plan.pipes {
            make_fifo(&pipe.path)?;
        }

        let mut stages: Vec<StageRuntime> = plan.stages.iter().map(StageRuntime::new).collect();
        let mut pumps: Vec<PumpHandle> = Vec::new();
        let mut readers: Vec<JoinHandle<()>> = Vec::new();

        // upstream-before-downstream: the plan is in dependency order and
        // each stage reaches Running before the next one spawns
        let mut launch_error = None;
        for index in 0..stages.len() {
            stages[index].state = StageState::Starting;
            match self
                .launch_stage(&mut stages[index], plan, &mut pumps, &mut readers)
                .await
            {
                Ok(()) => stages[index].state = StageState::Running,
                Err(error) => {
                    stages[index].state = StageState::Failed;
                    launch_error = Some(error);
                    break;
                }
            }
        }

        if let Some(error) = launch_error {
            self.teardown(&mut stages, &plan.pipes, false).await;
            abort_pumps(pumps);
            self.readout.set_state(PipelineState::Aborted);
            return Err(error);
        }

        self.readout.set_state(PipelineState::Active);
        info!(stages = stages.len(), "pipeline active");

        let failure = self.supervise(&mut stages).await;

        if let Some(error) = failure {
            let cancelled = matches!(error, ExportError::Cancelled);
            self.teardown(&mut stages, &plan.pipes, cancelled).await;
            abort_pumps(pumps);
            self.readout.set_state(PipelineState::Aborted);
            return Err(error);
        }

        // every stage exited zero; collect the stream digests
        let mut digests = Vec::with_capacity(pumps.len());
        for pump in pumps {
            match pump.await {
                Ok(Ok(digest)) => digests.push(digest),
                Ok(Err(e)) => {
                    self.readout.set_state(PipelineState::Aborted);
                    return Err(ExportError::Pipe {
                        message: e.to_string(),
                    });
                }
                Err(e) => {
                    self.readout.set_state(PipelineState::Aborted);
                    return Err(ExportError::Pipe {
                        message: e.to_string(),
                    });
                }
            }
        }
        for reader in readers {
            let _ = reader.await;
        }

        let output_len = std::fs::metadata(&plan.output_path)
            .map(|m| m.len())
            .unwrap_or(0);
        if output_len == 0 {
            self.readout.set_state(PipelineState::Aborted);
            return Err(ExportError::OutputMissing {
                path: plan.output_path.clone(),
            });
        }

        let snapshot = self.readout.snapshot();
        let encoded_frames = snapshot
            .records
            .get(&StageRole::Encoder)
            .map(|r| r.frames)
            .filter(|f| *f > 0);

        let mut warnings = crate::integrity::verify(&digests, &self.expected_checksums);
        if let Some(encoded) = encoded_frames {
            if encoded != plan.expected_frames {
                warnings.push(IntegrityWarning::FrameCountMismatch {
                    expected: plan.expected_frames,
                    reported: encoded,
                });
            }
        }

        self.readout.set_state(PipelineState::Completed);
        info!(output = %plan.output_path.display(), "pipeline completed");

        Ok(ExportSummary {
            output_path: plan.output_path.clone(),
            digests,
            expected_frames: plan.expected_frames,
            encoded_frames,
            warnings,
            elapsed: started.elapsed(),
        })
    }

    async fn launch_stage(
        &self,
        runtime: &mut StageRuntime,
        plan: &PipelinePlan,
        pumps: &mut Vec<PumpHandle>,
        readers: &mut Vec<JoinHandle<()>>,
    ) -> ExportResult<()> {
        let spec = runtime.spec.clone();
        debug!(role = %spec.role, command = %spec.render(), "launching stage");

        let mut child = self.launcher.launch(&spec).await?;
        if let Ok(mut at) = runtime.liveness.lock() {
            *at = Instant::now();
        }

        if let Some(stderr) = child.stderr.take() {
            let parser = match spec.diagnostics {
                DiagnosticStream::Stderr => Some(LineParser::for_role(spec.role)),
                DiagnosticStream::Stdout => None,
            };
            readers.push(tokio::spawn(drain_lines(
                stderr,
                parser,
                self.readout.clone(),
                Arc::clone(&runtime.liveness),
                Some(Arc::clone(&runtime.tail)),
            )));
        }

        match &spec.stdout {
            StageOutput::Media { pipe_id } => {
                let stdout = child.stdout.take().ok_or_else(|| ExportError::Pipe {
                    message: format!("{} stdout was not captured", spec.role),
                })?;
                let pipe = plan
                    .pipes
                    .iter()
                    .find(|p| &p.id == pipe_id)
                    .cloned()
                    .ok_or_else(|| ExportError::Pipe {
                        message: format!("no pipe named '{pipe_id}' in the plan"),
                    })?;
                pumps.push(tokio::spawn(async move {
                    // blocks until the downstream reader opens its end
                    let writer = tokio::fs::OpenOptions::new()
                        .write(true)
                        .open(&pipe.path)
                        .await?;
                    crate::integrity::pump(stdout, writer, &pipe.id).await
                }));
            }
            StageOutput::Progress => {
                let stdout = child.stdout.take().ok_or_else(|| ExportError::Pipe {
                    message: format!("{} stdout was not captured", spec.role),
                })?;
                let mut parser = LineParser::for_role(spec.role);
                parser.set_total(plan.expected_frames);
                readers.push(tokio::spawn(drain_lines(
                    stdout,
                    Some(parser),
                    self.readout.clone(),
                    Arc::clone(&runtime.liveness),
                    None,
                )));
            }
            StageOutput::Null => {}
        }

        self.readout
            .record_event(spec.role, StageEventKind::Launched);

        runtime.child = Some(child);
        Ok(())
    }

    /// Poll liveness until every stage succeeds, one fails, one stalls, or
    /// the run is cancelled. Returns the error that should abort the
    /// pipeline, or `None` on full success.
    async fn supervise(&self, stages: &mut [StageRuntime]) -> Option<ExportError> {
        let mut interval = tokio::time::interval(self.options.tick);

        loop {
            interval.tick().await;

            if self.cancel.is_cancelled() {
                return Some(ExportError::Cancelled);
            }

            let mut all_done = true;
            for stage in stages.iter_mut() {
                if stage.state != StageState::Running {
                    continue;
                }

                let Some(child) = stage.child.as_mut() else {
                    continue;
                };
                match child.try_wait() {
                    Ok(Some(status)) => {
                        let code = status.code().unwrap_or(-1);
                        stage.exit_code = Some(code);
                        self.readout
                            .record_event(stage.spec.role, StageEventKind::Exited { code });

                        if code == 0 {
                            // a clean exit with live siblings is normal:
                            // upstream stages finish first
                            debug!(role = %stage.spec.role, "stage succeeded");
                            stage.state = StageState::Succeeded;
                        } else {
                            warn!(role = %stage.spec.role, code, "stage failed");
                            stage.state = StageState::Failed;
                            return Some(ExportError::StageFailed {
                                role: stage.spec.role,
                                code,
                                tail: stage.tail_lines(),
                            });
                        }
                    }
                    Ok(None) => {
                        all_done = false;
                        let idle = stage
                            .liveness
                            .lock()
                            .map(|at| at.elapsed())
                            .unwrap_or_default();
                        if idle > self.options.watchdog {
                            warn!(role = %stage.spec.role, "stage stalled");
                            return Some(ExportError::Stalled {
                                role: stage.spec.role,
                                window: self.options.watchdog,
                            });
                        }
                    }
                    Err(e) => return Some(ExportError::Io(e)),
                }
            }

            if all_done {
                return None;
            }
        }
    }

    /// Terminate every still-running stage in reverse dependency order:
    /// downstream first, graceful signal first, forced kill after the grace
    /// period. Upstream stages dying of a broken pipe during this sequence
    /// is expected and not reported as a secondary failure.
    async fn teardown(&self, stages: &mut [StageRuntime], pipes: &[PipeSpec], cancelled: bool) {
        for stage in stages.iter_mut().rev() {
            if stage.state != StageState::Running {
                continue;
            }

            let Some(child) = stage.child.as_mut() else {
                continue;
            };

            debug!(role = %stage.spec.role, "terminating stage");
            terminate(child);
            self.readout
                .record_event(stage.spec.role, StageEventKind::Terminated);

            match tokio::time::timeout(self.options.grace, child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    warn!(role = %stage.spec.role, "grace period expired, killing");
                    let _ = child.kill().await;
                    self.readout
                        .record_event(stage.spec.role, StageEventKind::Killed);
                }
            }

            stage.state = if cancelled {
                StageState::Cancelled
            } else {
                StageState::Failed
            };
        }

        // release any pump still blocked opening a pipe's write end
        for pipe in pipes {
            unblock_fifo(&pipe.path);
        }
    }
}

fn abort_pumps(pumps: Vec<PumpHandle>) {
    for pump in pumps {
        pump.abort();
    }
}

/// Drain one diagnostic stream: buffer partial lines, feed the grammar
/// parser, publish records, keep the failure tail and bump the liveness
/// clock. Runs until EOF; decode errors end the drain, never the stage.
async fn drain_lines<R>(
    mut reader: R,
    mut parser: Option<LineParser>,
    readout: Readout,
    liveness: Arc<Mutex<Instant>>,
    tail: Option<Arc<Mutex<VecDeque<String>>>>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut assembler = LineAssembler::new();
    let mut buf = vec![0u8; 8192];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };

        if let Ok(mut at) = liveness.lock() {
            *at = Instant::now();
        }

        for line in assembler.push(&buf[..n]) {
            handle_line(&line, &mut parser, &readout, &tail);
        }
    }

    if let Some(line) = assembler.finish() {
        handle_line(&line, &mut parser, &readout, &tail);
    }
}

fn handle_line(
    line: &str,
    parser: &mut Option<LineParser>,
    readout: &Readout,
    tail: &Option<Arc<Mutex<VecDeque<String>>>>,
) {
    if let Some(tail) = tail {
        stage::push_tail(tail, line);
    }
    if let Some(parser) = parser {
        if let Some(record) = parser.parse_line(line) {
            readout.publish(record);
        }
    }
}

#[cfg(unix)]
fn make_fifo(path: &Path) -> ExportResult<()> {
    nix::unistd::mkfifo(path, nix::sys::stat::Mode::from_bits_truncate(0o600)).map_err(|e| {
        ExportError::Pipe {
            message: format!("mkfifo {}: {e}", path.display()),
        }
    })
}

#[cfg(not(unix))]
fn make_fifo(_path: &Path) -> ExportResult<()> {
    Err(ExportError::Pipe {
        message: "named pipes are only supported on unix".into(),
    })
}

/// Graceful termination signal; the forced kill happens after the grace
/// period.
#[cfg(unix)]
fn terminate(child: &tokio::process::Child) {
    if let Some(pid) = child.id() {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGTERM,
        );
    }
}

#[cfg(not(unix))]
fn terminate(_child: &tokio::process::Child) {}

/// Open the read end non-blocking and drop it, so a pump blocked opening
/// the write end of an abandoned FIFO wakes up and sees EOF.
#[cfg(unix)]
fn unblock_fifo(path: &Path) {
    use std::os::unix::fs::OpenOptionsExt;
    let _ = std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(nix::libc::O_NONBLOCK)
        .open(path);
}

#[cfg(not(unix))]
fn unblock_fifo(_path: &Path) {}
