//! Command-line argument definitions

use std::path::PathBuf;

use clap::Parser;

/// Export a time-base-corrected capture to a standard video container
#[derive(Parser, Debug)]
#[command(name = "tbc-export")]
#[command(about = "Export TBC captures via ld-chroma-decoder and ffmpeg")]
#[command(version)]
pub struct Cli {
    /// TBC data file (luma file for S-Video captures)
    #[arg(required_unless_present = "list_profiles")]
    pub input: Option<PathBuf>,

    /// Output file path (default: next to the input, extension from profile)
    pub output: Option<PathBuf>,

    /// Encoding profile name
    #[arg(short, long, default_value = "ffv1")]
    pub profile: String,

    /// TOML file with additional profiles, merged over the built-ins
    #[arg(long)]
    pub profile_file: Option<PathBuf>,

    /// List available profiles and exit
    #[arg(long)]
    pub list_profiles: bool,

    /// Print the commands that would run, without launching anything
    #[arg(long)]
    pub dry_run: bool,

    /// Chroma decoder algorithm (pal2d, transform2d, transform3d, ntsc1d,
    /// ntsc2d, ntsc3d, ntsc3dnoadapt, mono)
    #[arg(long)]
    pub decoder: Option<String>,

    /// Extra encoder argument, appended after profile flags (repeatable)
    #[arg(long = "ffmpeg-arg")]
    pub ffmpeg_args: Vec<String>,

    /// Force the output container extension
    #[arg(long)]
    pub container: Option<String>,

    /// Expected SHA-256 of an inter-stage stream, as PIPE=HEX (repeatable);
    /// a mismatch is reported as a warning after the run
    #[arg(long = "expect-checksum", value_name = "PIPE=HEX")]
    pub expect_checksums: Vec<String>,

    /// PCM audio track to mux alongside the video
    #[arg(long)]
    pub audio: Option<PathBuf>,

    /// Decoder thread count (default: logical CPUs)
    #[arg(short, long)]
    pub threads: Option<usize>,

    /// Watchdog window in seconds: a stage with no output and no exit for
    /// this long is treated as hung
    #[arg(long, default_value = "60")]
    pub watchdog_secs: u64,

    /// Grace period in seconds between the termination signal and a forced
    /// kill during teardown
    #[arg(long, default_value = "3")]
    pub grace_secs: u64,

    /// Readout refresh interval in seconds
    #[arg(long, default_value = "1")]
    pub refresh_secs: u64,
}
