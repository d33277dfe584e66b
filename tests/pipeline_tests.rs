//! End-to-end pipeline controller tests against real processes.
//!
//! Stages are small `sh` scripts, so the tests exercise real named pipes,
//! real exits and real signals without any of the media tools installed.

#![cfg(unix)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use tbc_export::command::{
    DiagnosticStream, PipeSpec, PipelinePlan, ProcessSpec, StageInput, StageOutput, StageRole,
};
use tbc_export::error::ExportError;
use tbc_export::input::{InputDescriptor, SignalType, TbcMetadata, VideoSystem};
use tbc_export::integrity::IntegrityWarning;
use tbc_export::pipeline::{
    export, CancelFlag, PipelineController, PipelineOptions, ProcessLauncher, TokioLauncher,
};
use tbc_export::profile::ProfileRegistry;
use tbc_export::progress::readout::{PipelineState, Readout, StageEventKind};

fn sh(role: StageRole, script: &str, stdout: StageOutput) -> ProcessSpec {
    ProcessSpec {
        role,
        program: "sh".into(),
        args: vec!["-c".into(), script.into()],
        input: StageInput::Files(Vec::new()),
        stdout,
        diagnostics: DiagnosticStream::Stderr,
    }
}

fn fast_options() -> PipelineOptions {
    PipelineOptions {
        tick: Duration::from_millis(20),
        watchdog: Duration::from_secs(10),
        grace: Duration::from_millis(500),
    }
}

fn controller_parts() -> (Readout, CancelFlag) {
    (Readout::new(), CancelFlag::new())
}

#[tokio::test]
async fn media_flows_through_the_pipe_and_is_checksummed() {
    let dir = tempfile::tempdir().unwrap();
    let pipe = PipeSpec {
        id: "video".into(),
        path: dir.path().join("video.y4m"),
    };
    let output = dir.path().join("out.bin");

    let payload = b"y4m frame data";
    let decoder = sh(
        StageRole::Decoder,
        "printf 'y4m frame data'",
        StageOutput::Media {
            pipe_id: "video".into(),
        },
    );
    let encoder = sh(
        StageRole::Encoder,
        &format!("cat {} > {}", pipe.path.display(), output.display()),
        StageOutput::Null,
    );

    let plan = PipelinePlan {
        stages: vec![decoder, encoder],
        pipes: vec![pipe],
        expected_frames: 0,
        output_path: output.clone(),
    };

    let (readout, cancel) = controller_parts();
    let controller =
        PipelineController::new(&TokioLauncher, readout.clone(), cancel, fast_options());
    let summary = controller.run(&plan).await.unwrap();

    // the bytes the encoder saw are the bytes the decoder wrote
    assert_eq!(std::fs::read(&output).unwrap(), payload);

    assert_eq!(summary.digests.len(), 1);
    let digest = &summary.digests[0];
    assert_eq!(digest.pipe_id, "video");
    assert_eq!(digest.bytes, payload.len() as u64);
    assert_eq!(digest.sha256, hex::encode(Sha256::digest(payload)));

    assert!(summary.warnings.is_empty());
    assert_eq!(readout.snapshot().state, PipelineState::Completed);
}

#[tokio::test]
async fn checksum_expectations_flag_diverging_streams() {
    let payload = b"y4m frame data";
    let good_hash = hex::encode(Sha256::digest(payload));

    for (expected_hash, expect_warning) in [(good_hash.as_str(), false), ("deadbeef", true)] {
        let dir = tempfile::tempdir().unwrap();
        let pipe = PipeSpec {
            id: "video".into(),
            path: dir.path().join("video.y4m"),
        };
        let output = dir.path().join("out.bin");

        let decoder = sh(
            StageRole::Decoder,
            "printf 'y4m frame data'",
            StageOutput::Media {
                pipe_id: "video".into(),
            },
        );
        let encoder = sh(
            StageRole::Encoder,
            &format!("cat {} > {}", pipe.path.display(), output.display()),
            StageOutput::Null,
        );

        let plan = PipelinePlan {
            stages: vec![decoder, encoder],
            pipes: vec![pipe],
            expected_frames: 0,
            output_path: output,
        };

        let (readout, cancel) = controller_parts();
        let controller =
            PipelineController::new(&TokioLauncher, readout, cancel, fast_options())
                .with_expected_checksums(vec![("video".to_string(), expected_hash.to_string())]);
        let summary = controller.run(&plan).await.unwrap();

        if expect_warning {
            // a diverging stream is reported, never a failure
            assert_eq!(summary.warnings.len(), 1);
            assert!(matches!(
                &summary.warnings[0],
                IntegrityWarning::ChecksumMismatch { pipe_id, actual, .. }
                    if pipe_id == "video" && *actual == good_hash
            ));
        } else {
            assert!(summary.warnings.is_empty());
        }
    }
}

#[tokio::test]
async fn clean_exit_of_an_upstream_stage_does_not_abort_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("out.bin");

    // the decoder finishes long before the encoder does
    let decoder = sh(StageRole::Decoder, "exit 0", StageOutput::Null);
    let encoder = sh(
        StageRole::Encoder,
        &format!("sleep 0.3; printf done > {}", output.display()),
        StageOutput::Null,
    );

    let plan = PipelinePlan {
        stages: vec![decoder, encoder],
        pipes: Vec::new(),
        expected_frames: 0,
        output_path: output,
    };

    let (readout, cancel) = controller_parts();
    let controller =
        PipelineController::new(&TokioLauncher, readout.clone(), cancel, fast_options());
    controller.run(&plan).await.unwrap();

    let events = readout.events();
    assert!(events
        .iter()
        .any(|e| e.role == StageRole::Decoder && e.kind == StageEventKind::Exited { code: 0 }));
    assert!(events
        .iter()
        .all(|e| !matches!(e.kind, StageEventKind::Terminated | StageEventKind::Killed)));
}

#[tokio::test]
async fn decoder_failure_names_the_stage_and_tears_down_the_encoder() {
    let dir = tempfile::tempdir().unwrap();
    let pipe = PipeSpec {
        id: "video".into(),
        path: dir.path().join("video.y4m"),
    };
    let output = dir.path().join("out.bin");

    let decoder = sh(
        StageRole::Decoder,
        "echo 'Error: tape unreadable' 1>&2; sleep 0.2; exit 2",
        StageOutput::Media {
            pipe_id: "video".into(),
        },
    );
    let encoder = sh(
        StageRole::Encoder,
        &format!("cat {} > {}; sleep 30", pipe.path.display(), output.display()),
        StageOutput::Null,
    );

    let plan = PipelinePlan {
        stages: vec![decoder, encoder],
        pipes: vec![pipe],
        expected_frames: 0,
        output_path: output,
    };

    let (readout, cancel) = controller_parts();
    let controller =
        PipelineController::new(&TokioLauncher, readout.clone(), cancel, fast_options());
    let err = controller.run(&plan).await.unwrap_err();

    match &err {
        ExportError::StageFailed { role, code, tail } => {
            assert_eq!(*role, StageRole::Decoder);
            assert_eq!(*code, 2);
            assert!(tail.iter().any(|l| l.contains("tape unreadable")));
        }
        other => panic!("expected a stage failure, got {other:?}"),
    }
    assert_eq!(err.exit_code(), 1);

    // the report names the failing stage, the teardown hits the survivor
    let events = readout.events();
    let decoder_exit = events
        .iter()
        .position(|e| e.role == StageRole::Decoder && matches!(e.kind, StageEventKind::Exited { .. }))
        .unwrap();
    let encoder_term = events
        .iter()
        .position(|e| e.role == StageRole::Encoder && e.kind == StageEventKind::Terminated)
        .unwrap();
    assert!(decoder_exit < encoder_term);
    assert_eq!(readout.snapshot().state, PipelineState::Aborted);
}

#[tokio::test]
async fn cancellation_tears_down_in_reverse_launch_order() {
    let dir = tempfile::tempdir().unwrap();

    let plan = PipelinePlan {
        stages: vec![
            sh(StageRole::Decoder, "sleep 30", StageOutput::Null),
            sh(StageRole::ChromaDecoder, "sleep 30", StageOutput::Null),
            sh(StageRole::Encoder, "sleep 30", StageOutput::Null),
        ],
        pipes: Vec::new(),
        expected_frames: 0,
        output_path: dir.path().join("out.bin"),
    };

    let (readout, cancel) = controller_parts();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        trigger.cancel();
    });

    let controller =
        PipelineController::new(&TokioLauncher, readout.clone(), cancel, fast_options());
    let err = controller.run(&plan).await.unwrap_err();
    assert!(matches!(err, ExportError::Cancelled));
    assert_eq!(err.exit_code(), 130);

    let events = readout.events();
    let launched: Vec<StageRole> = events
        .iter()
        .filter(|e| e.kind == StageEventKind::Launched)
        .map(|e| e.role)
        .collect();
    let terminated: Vec<StageRole> = events
        .iter()
        .filter(|e| e.kind == StageEventKind::Terminated)
        .map(|e| e.role)
        .collect();

    assert_eq!(
        launched,
        vec![
            StageRole::Decoder,
            StageRole::ChromaDecoder,
            StageRole::Encoder
        ]
    );
    let mut reversed = launched.clone();
    reversed.reverse();
    assert_eq!(terminated, reversed);
}

#[tokio::test]
async fn a_silent_stage_trips_the_watchdog() {
    let dir = tempfile::tempdir().unwrap();

    let plan = PipelinePlan {
        stages: vec![sh(StageRole::Decoder, "sleep 30", StageOutput::Null)],
        pipes: Vec::new(),
        expected_frames: 0,
        output_path: dir.path().join("out.bin"),
    };

    let options = PipelineOptions {
        watchdog: Duration::from_millis(200),
        ..fast_options()
    };
    let (readout, cancel) = controller_parts();
    let controller = PipelineController::new(&TokioLauncher, readout, cancel, options);
    let err = controller.run(&plan).await.unwrap_err();

    assert!(matches!(
        err,
        ExportError::Stalled {
            role: StageRole::Decoder,
            ..
        }
    ));
}

#[tokio::test]
async fn a_failed_launch_tears_down_already_running_stages() {
    let dir = tempfile::tempdir().unwrap();

    let missing = ProcessSpec {
        role: StageRole::Encoder,
        program: "tbc-export-no-such-binary".into(),
        args: Vec::new(),
        input: StageInput::Files(Vec::new()),
        stdout: StageOutput::Null,
        diagnostics: DiagnosticStream::Stderr,
    };

    let plan = PipelinePlan {
        stages: vec![sh(StageRole::Decoder, "sleep 30", StageOutput::Null), missing],
        pipes: Vec::new(),
        expected_frames: 0,
        output_path: dir.path().join("out.bin"),
    };

    let (readout, cancel) = controller_parts();
    let controller =
        PipelineController::new(&TokioLauncher, readout.clone(), cancel, fast_options());
    let err = controller.run(&plan).await.unwrap_err();

    assert!(matches!(
        err,
        ExportError::Launch {
            role: StageRole::Encoder,
            ..
        }
    ));

    let events = readout.events();
    assert!(events
        .iter()
        .any(|e| e.role == StageRole::Decoder && e.kind == StageEventKind::Terminated));
    assert_eq!(readout.snapshot().state, PipelineState::Aborted);
}

/// Launcher that counts spawns, for asserting that configuration errors
/// surface before anything starts.
struct CountingLauncher {
    launches: AtomicUsize,
}

#[async_trait]
impl ProcessLauncher for CountingLauncher {
    async fn launch(
        &self,
        spec: &ProcessSpec,
    ) -> tbc_export::error::ExportResult<tokio::process::Child> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        TokioLauncher.launch(spec).await
    }
}

#[tokio::test]
async fn unknown_profile_fails_before_any_process_launches() {
    let input = InputDescriptor {
        tbc_path: PathBuf::from("/captures/tape.tbc"),
        chroma_tbc_path: None,
        metadata_path: PathBuf::from("/captures/tape.tbc.json"),
        signal_type: SignalType::Cvbs,
        metadata: TbcMetadata {
            field_count: 1000,
            sample_rate: None,
            system: VideoSystem::Pal,
        },
    };

    let launcher = CountingLauncher {
        launches: AtomicUsize::new(0),
    };
    let registry = ProfileRegistry::builtin();
    let err = export(
        &input,
        "no_such_profile",
        &registry,
        &Default::default(),
        None,
        &[],
        &launcher,
        fast_options(),
        Readout::new(),
        CancelFlag::new(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, ExportError::UnknownProfile { ref name } if name == "no_such_profile"));
    assert_eq!(err.exit_code(), 2);
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 0);
}
