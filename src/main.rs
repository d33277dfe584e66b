//! tbc-export
//!
//! Export time-base-corrected captures produced by analog decode hardware
//! to standard video containers, driving `ld-chroma-decoder` and `ffmpeg`
//! as a supervised pipeline.
//!
//! # Usage
//!
//! ```bash
//! tbc-export tape.tbc                        # CVBS or S-Video, FFV1/MKV
//! tbc-export tape.tbc --profile x264_web     # web-friendly H.264
//! tbc-export tape.tbc --dry-run              # show the commands only
//! ```

use std::process::ExitCode;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use tbc_export::cli::{self, Cli};
use tbc_export::command::{ChromaDecoder, Overrides};
use tbc_export::error::{ExportError, ExportResult};
use tbc_export::input::InputDescriptor;
use tbc_export::pipeline::{self, CancelFlag, PipelineOptions, TokioLauncher};
use tbc_export::profile::ProfileRegistry;
use tbc_export::progress::readout::Readout;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Cli::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            cli::report_failure(&error);
            ExitCode::from(error.exit_code())
        }
    }
}

async fn run(args: Cli) -> ExportResult<()> {
    let mut registry = ProfileRegistry::builtin();
    if let Some(path) = &args.profile_file {
        let document = std::fs::read_to_string(path)?;
        registry.merge_toml(&document)?;
    }

    if args.list_profiles {
        for profile in registry.iter() {
            info!(
                "{:<12} {} / {} in .{}{}",
                profile.name,
                profile.video_codec,
                profile.pixel_format,
                profile.container,
                if profile.doubles_rate {
                    " (doubled frame rate)"
                } else {
                    ""
                }
            );
        }
        return Ok(());
    }

    let input_path = args.input.as_deref().ok_or(ExportError::InvalidInput {
        message: "no input file given".into(),
    })?;
    let input = InputDescriptor::detect(input_path)?;
    info!(
        "detected {} capture, {} fields (~{:.1}s of {})",
        input.signal_type,
        input.metadata.field_count,
        input.metadata.duration().as_secs_f64(),
        input.metadata.system
    );
    if let Some(rate) = input.metadata.sample_rate {
        info!("source sample rate {:.3} MHz", rate / 1_000_000.0);
    }

    let chroma_decoder = match &args.decoder {
        Some(name) => Some(ChromaDecoder::from_str(name).map_err(|message| {
            ExportError::InvalidInput { message }
        })?),
        None => None,
    };

    let overrides = Overrides {
        extra_encoder_args: args.ffmpeg_args.clone(),
        container: args.container.clone(),
        threads: args.threads,
        chroma_decoder,
        audio_path: args.audio.clone(),
    };

    let mut expected_checksums = Vec::with_capacity(args.expect_checksums.len());
    for entry in &args.expect_checksums {
        let (pipe, hash) = entry.split_once('=').ok_or_else(|| ExportError::InvalidInput {
            message: format!("--expect-checksum takes PIPE=HEX, got '{entry}'"),
        })?;
        expected_checksums.push((pipe.to_string(), hash.to_ascii_lowercase()));
    }

    if args.dry_run {
        let profile = registry.resolve(&args.profile)?;
        let run_dir = tempfile::Builder::new().prefix("tbc-export-").tempdir()?;
        let plan = tbc_export::CommandBuilder::new(&input, profile, &overrides, run_dir.path())
            .build(args.output.as_deref())?;
        for (step, command) in plan.render().iter().enumerate() {
            info!("step {}: {command}", step + 1);
        }
        return Ok(());
    }

    let options = PipelineOptions {
        watchdog: Duration::from_secs(args.watchdog_secs),
        grace: Duration::from_secs(args.grace_secs),
        ..Default::default()
    };

    let readout = Readout::new();
    let cancel = CancelFlag::new();

    // one cancellation signal fans out to the whole graph
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("cancellation requested");
            ctrl_c_cancel.cancel();
        }
    });

    let printer = tokio::spawn(cli::print_readout(
        readout.clone(),
        Duration::from_secs(args.refresh_secs.max(1)),
    ));

    let result = pipeline::export(
        &input,
        &args.profile,
        &registry,
        &overrides,
        args.output.as_deref(),
        &expected_checksums,
        &TokioLauncher,
        options,
        readout,
        cancel,
    )
    .await;

    if result.is_err() {
        // configuration errors never reach a terminal pipeline state
        printer.abort();
    }
    let _ = printer.await;

    let summary = result?;
    cli::report_success(&summary);
    Ok(())
}
