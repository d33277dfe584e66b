//! Command construction for the external process pipeline
//!
//! Turns an input descriptor, a profile and user overrides into the exact
//! argument vectors for every stage, plus the named pipes that connect them.
//! Specs are built once per run and never mutated afterwards.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{ExportError, ExportResult};
use crate::input::{InputDescriptor, SignalType, VideoSystem};
use crate::profile::Profile;

/// Role of a stage within the pipeline. Exactly one stage runs per role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StageRole {
    /// Combined (CVBS) or luma (S-Video) decoder
    Decoder,
    /// Chroma decoder, present only for S-Video sources
    ChromaDecoder,
    Encoder,
}

impl fmt::Display for StageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageRole::Decoder => write!(f, "decoder"),
            StageRole::ChromaDecoder => write!(f, "chroma-decoder"),
            StageRole::Encoder => write!(f, "encoder"),
        }
    }
}

/// Chroma decoder algorithm passed to `ld-chroma-decoder`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChromaDecoder {
    Mono,
    Pal2D,
    Transform2D,
    Transform3D,
    Ntsc1D,
    Ntsc2D,
    Ntsc3D,
    Ntsc3DNoAdapt,
}

impl ChromaDecoder {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChromaDecoder::Mono => "mono",
            ChromaDecoder::Pal2D => "pal2d",
            ChromaDecoder::Transform2D => "transform2d",
            ChromaDecoder::Transform3D => "transform3d",
            ChromaDecoder::Ntsc1D => "ntsc1d",
            ChromaDecoder::Ntsc2D => "ntsc2d",
            ChromaDecoder::Ntsc3D => "ntsc3d",
            ChromaDecoder::Ntsc3DNoAdapt => "ntsc3dnoadapt",
        }
    }

    /// Whether this algorithm is valid for the source video system.
    pub fn valid_for(&self, system: VideoSystem) -> bool {
        match system {
            VideoSystem::Pal | VideoSystem::PalM => matches!(
                self,
                ChromaDecoder::Mono
                    | ChromaDecoder::Pal2D
                    | ChromaDecoder::Transform2D
                    | ChromaDecoder::Transform3D
            ),
            VideoSystem::Ntsc => matches!(
                self,
                ChromaDecoder::Mono
                    | ChromaDecoder::Ntsc1D
                    | ChromaDecoder::Ntsc2D
                    | ChromaDecoder::Ntsc3D
                    | ChromaDecoder::Ntsc3DNoAdapt
            ),
        }
    }

    /// Default algorithm for a video system.
    pub fn default_for(system: VideoSystem) -> Self {
        match system {
            VideoSystem::Pal | VideoSystem::PalM => ChromaDecoder::Transform2D,
            VideoSystem::Ntsc => ChromaDecoder::Ntsc2D,
        }
    }
}

impl FromStr for ChromaDecoder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mono" => Ok(ChromaDecoder::Mono),
            "pal2d" => Ok(ChromaDecoder::Pal2D),
            "transform2d" => Ok(ChromaDecoder::Transform2D),
            "transform3d" => Ok(ChromaDecoder::Transform3D),
            "ntsc1d" => Ok(ChromaDecoder::Ntsc1D),
            "ntsc2d" => Ok(ChromaDecoder::Ntsc2D),
            "ntsc3d" => Ok(ChromaDecoder::Ntsc3D),
            "ntsc3dnoadapt" => Ok(ChromaDecoder::Ntsc3DNoAdapt),
            other => Err(format!("unknown chroma decoder '{other}'")),
        }
    }
}

/// A named pipe connecting two stages. Paths live under a per-run temporary
/// directory, so identifiers never collide across concurrent runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeSpec {
    pub id: String,
    pub path: PathBuf,
}

/// Where a stage's media input comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageInput {
    /// Reads data files named in its argument vector
    Files(Vec<PathBuf>),
    /// Reads one or more upstream pipes named in its argument vector
    Pipes(Vec<String>),
}

/// Where a stage's standard output goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutput {
    /// Media bytes, forwarded into the named pipe by the orchestrator's
    /// hashing pump
    Media { pipe_id: String },
    /// Machine-readable progress lines (ffmpeg `-progress pipe:1`)
    Progress,
    /// Nothing of interest
    Null,
}

/// Which stream carries the stage's parseable progress output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticStream {
    Stderr,
    Stdout,
}

/// Immutable description of one external process.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub role: StageRole,
    pub program: String,
    pub args: Vec<String>,
    pub input: StageInput,
    pub stdout: StageOutput,
    pub diagnostics: DiagnosticStream,
}

impl ProcessSpec {
    /// Render the command line for display (dry-run output).
    pub fn render(&self) -> String {
        let mut out = String::from(self.program.as_str());
        for arg in &self.args {
            out.push(' ');
            if arg.contains(' ') {
                out.push('"');
                out.push_str(arg);
                out.push('"');
            } else {
                out.push_str(arg);
            }
        }
        out
    }
}

/// User overrides applied on top of profile-derived flags.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    /// Extra encoder flags, appended after all profile flags so they can
    /// shadow defaults (the encoder's convention is last-flag-wins)
    pub extra_encoder_args: Vec<String>,
    /// Forced container extension
    pub container: Option<String>,
    /// Decoder thread count; defaults to the machine's logical CPUs
    pub threads: Option<usize>,
    /// Chroma decoder algorithm selection
    pub chroma_decoder: Option<ChromaDecoder>,
    /// Optional PCM audio track muxed alongside the video
    pub audio_path: Option<PathBuf>,
}

/// Fully constructed pipeline: stages in dependency order (upstream first),
/// the pipes connecting them, and the progress totals derived from the
/// source metadata.
#[derive(Debug, Clone)]
pub struct PipelinePlan {
    pub stages: Vec<ProcessSpec>,
    pub pipes: Vec<PipeSpec>,
    /// Expected encoder output frame count: the source field count, doubled
    /// when the profile doubles the frame rate
    pub expected_frames: u64,
    pub output_path: PathBuf,
}

impl PipelinePlan {
    /// Command lines in launch order, for dry-run display.
    pub fn render(&self) -> Vec<String> {
        self.stages.iter().map(ProcessSpec::render).collect()
    }
}

/// Builds the per-run [`PipelinePlan`].
pub struct CommandBuilder<'a> {
    input: &'a InputDescriptor,
    profile: &'a Profile,
    overrides: &'a Overrides,
    /// Per-run directory holding the named pipes
    run_dir: &'a Path,
}

impl<'a> CommandBuilder<'a> {
    pub fn new(
        input: &'a InputDescriptor,
        profile: &'a Profile,
        overrides: &'a Overrides,
        run_dir: &'a Path,
    ) -> Self {
        Self {
            input,
            profile,
            overrides,
            run_dir,
        }
    }

    /// Build the ordered stage list. Rejects unsupported signal/profile
    /// combinations before anything launches.
    pub fn build(&self, output: Option<&Path>) -> ExportResult<PipelinePlan> {
        self.validate()?;

        let output_path = self.output_path(output);
        let expected_frames = self.expected_frames();

        let (stages, pipes) = match self.input.signal_type {
            SignalType::Cvbs => self.build_cvbs()?,
            SignalType::SVideo => self.build_svideo()?,
        };

        let mut stages = stages;
        stages.push(self.build_encoder(&pipes, &output_path));

        Ok(PipelinePlan {
            stages,
            pipes,
            expected_frames,
            output_path,
        })
    }

    fn validate(&self) -> ExportResult<()> {
        if self.input.signal_type == SignalType::SVideo && self.profile.is_luma_only() {
            return Err(ExportError::InvalidCombination {
                profile: self.profile.name.clone(),
                signal: self.input.signal_type.to_string(),
                reason: format!(
                    "pixel format '{}' is luma-only and cannot take a dual-source merge",
                    self.profile.pixel_format
                ),
            });
        }

        if let Some(decoder) = self.overrides.chroma_decoder {
            if !decoder.valid_for(self.input.metadata.system) {
                return Err(ExportError::InvalidCombination {
                    profile: self.profile.name.clone(),
                    signal: self.input.signal_type.to_string(),
                    reason: format!(
                        "{} is not a valid chroma decoder for {}",
                        decoder.as_str(),
                        self.input.metadata.system
                    ),
                });
            }
        }

        Ok(())
    }

    /// Progress total for the encoder. Derived strictly from the source
    /// field count; frame-rate doubling doubles it. Encoder-reported totals
    /// that diverge are flagged as an integrity warning, never trusted.
    fn expected_frames(&self) -> u64 {
        let fields = self.input.metadata.field_count;
        if self.profile.doubles_rate {
            fields * 2
        } else {
            fields
        }
    }

    fn output_path(&self, output: Option<&Path>) -> PathBuf {
        let container = self
            .overrides
            .container
            .as_deref()
            .unwrap_or(&self.profile.container);
        match output {
            Some(path) => path.with_extension(container),
            None => self.input.tbc_path.with_extension(container),
        }
    }

    fn pipe(&self, id: &str) -> PipeSpec {
        PipeSpec {
            id: id.to_string(),
            path: self.run_dir.join(format!("{id}.y4m")),
        }
    }

    fn build_cvbs(&self) -> ExportResult<(Vec<ProcessSpec>, Vec<PipeSpec>)> {
        let pipe = self.pipe("video");
        let decoder = self.decoder_spec(StageRole::Decoder, &self.input.tbc_path, &pipe)?;
        Ok((vec![decoder], vec![pipe]))
    }

    fn build_svideo(&self) -> ExportResult<(Vec<ProcessSpec>, Vec<PipeSpec>)> {
        let luma_pipe = self.pipe("luma");
        let chroma_pipe = self.pipe("chroma");

        let chroma_path = self
            .input
            .chroma_tbc_path
            .as_ref()
            .ok_or_else(|| ExportError::InvalidInput {
                message: "S-Video input is missing its chroma TBC file".into(),
            })?;

        let luma = self.decoder_spec(StageRole::Decoder, &self.input.tbc_path, &luma_pipe)?;
        let chroma = self.decoder_spec(StageRole::ChromaDecoder, chroma_path, &chroma_pipe)?;

        Ok((vec![luma, chroma], vec![luma_pipe, chroma_pipe]))
    }

    /// `ld-chroma-decoder` invocation writing y4m to stdout, which the
    /// orchestrator forwards into the stage's named pipe.
    fn decoder_spec(
        &self,
        role: StageRole,
        tbc_path: &Path,
        pipe: &PipeSpec,
    ) -> ExportResult<ProcessSpec> {
        let threads = self.overrides.threads.unwrap_or_else(num_cpus::get);
        let mut args = vec!["-p".into(), "y4m".into()];

        match role {
            // luma of a separated capture decodes as mono
            StageRole::Decoder if self.input.signal_type == SignalType::SVideo => {
                args.extend(["-f".into(), "mono".into()]);
                args.extend(["--chroma-gain".into(), "0".into()]);
            }
            StageRole::Decoder => {
                let decoder = self
                    .overrides
                    .chroma_decoder
                    .unwrap_or_else(|| ChromaDecoder::default_for(self.input.metadata.system));
                args.extend(["-f".into(), decoder.as_str().into()]);
            }
            StageRole::ChromaDecoder => {
                let decoder = self
                    .overrides
                    .chroma_decoder
                    .unwrap_or_else(|| ChromaDecoder::default_for(self.input.metadata.system));
                args.extend(["-f".into(), decoder.as_str().into()]);
                args.extend(["--luma-nr".into(), "0".into()]);
            }
            StageRole::Encoder => unreachable!("encoder is not a decoder stage"),
        }

        args.extend(["-t".into(), threads.to_string()]);
        args.extend([
            "--input-json".into(),
            self.input.metadata_path.display().to_string(),
        ]);
        args.push(tbc_path.display().to_string());
        args.push("-".into());

        Ok(ProcessSpec {
            role,
            program: "ld-chroma-decoder".into(),
            args,
            input: StageInput::Files(vec![tbc_path.to_path_buf()]),
            stdout: StageOutput::Media {
                pipe_id: pipe.id.clone(),
            },
            diagnostics: DiagnosticStream::Stderr,
        })
    }

    /// `ffmpeg` invocation reading the named pipe(s) and writing the output
    /// container. Progress goes to stdout, error text to stderr.
    fn build_encoder(&self, pipes: &[PipeSpec], output_path: &Path) -> ProcessSpec {
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-nostats".into(),
            "-progress".into(),
            "pipe:1".into(),
        ];

        for pipe in pipes {
            args.extend(["-i".into(), pipe.path.display().to_string()]);
        }

        let audio_input_index = pipes.len();
        if let Some(audio) = &self.overrides.audio_path {
            args.extend(["-i".into(), audio.display().to_string()]);
        }

        // video mapping and filters
        let mut filter = String::new();
        if pipes.len() == 2 {
            // merge the separated luma and chroma planes into one picture
            filter.push_str(&format!(
                "[0:v][1:v]mergeplanes=map1s=1:map1p=1:map2s=1:map2p=2:format={}",
                self.profile.pixel_format
            ));
        }
        if self.profile.doubles_rate {
            if !filter.is_empty() {
                filter.push(',');
            }
            filter.push_str("bwdif=mode=send_field");
        }
        if let Some(extra) = &self.profile.video_filter {
            if !filter.is_empty() {
                filter.push(',');
            }
            filter.push_str(extra);
        }

        if pipes.len() == 2 {
            let mut graph = filter.clone();
            graph.push_str("[v]");
            args.extend(["-filter_complex".into(), graph]);
            args.extend(["-map".into(), "[v]".into()]);
        } else {
            args.extend(["-map".into(), "0:v".into()]);
            if !filter.is_empty() {
                args.extend(["-vf".into(), filter]);
            }
        }

        args.extend(["-c:v".into(), self.profile.video_codec.clone()]);
        args.extend(["-pix_fmt".into(), self.profile.pixel_format.clone()]);
        args.extend(self.profile.codec_opts.iter().cloned());

        if self.overrides.audio_path.is_some() {
            args.extend(["-map".into(), format!("{audio_input_index}:a")]);
            args.extend(["-c:a".into(), self.profile.audio_codec.clone()]);
        } else {
            args.push("-an".into());
        }

        // overrides last so they shadow profile defaults; profile flags are
        // still emitted (last-flag-wins is ffmpeg's convention)
        args.extend(self.overrides.extra_encoder_args.iter().cloned());

        args.push("-y".into());
        args.push(output_path.display().to_string());

        ProcessSpec {
            role: StageRole::Encoder,
            program: "ffmpeg".into(),
            args,
            input: StageInput::Pipes(pipes.iter().map(|p| p.id.clone()).collect()),
            stdout: StageOutput::Progress,
            diagnostics: DiagnosticStream::Stdout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::TbcMetadata;

    fn descriptor(signal_type: SignalType, system: VideoSystem) -> InputDescriptor {
        InputDescriptor {
            tbc_path: PathBuf::from("/captures/tape.tbc"),
            chroma_tbc_path: match signal_type {
                SignalType::SVideo => Some(PathBuf::from("/captures/tape_chroma.tbc")),
                SignalType::Cvbs => None,
            },
            metadata_path: PathBuf::from("/captures/tape.tbc.json"),
            signal_type,
            metadata: TbcMetadata {
                field_count: 1000,
                sample_rate: Some(17_734_375.0),
                system,
            },
        }
    }

    fn profile(name: &str) -> Profile {
        crate::profile::ProfileRegistry::builtin()
            .resolve(name)
            .unwrap()
            .clone()
    }

    #[test]
    fn chroma_decoder_system_validation() {
        assert!(ChromaDecoder::Transform3D.valid_for(VideoSystem::Pal));
        assert!(!ChromaDecoder::Transform3D.valid_for(VideoSystem::Ntsc));
        assert!(ChromaDecoder::Ntsc3D.valid_for(VideoSystem::Ntsc));
        assert!(!ChromaDecoder::Ntsc3D.valid_for(VideoSystem::Pal));
        assert!(ChromaDecoder::Mono.valid_for(VideoSystem::Pal));
        assert!(ChromaDecoder::Mono.valid_for(VideoSystem::Ntsc));
    }

    #[test]
    fn invalid_decoder_for_system_is_rejected() {
        let input = descriptor(SignalType::Cvbs, VideoSystem::Pal);
        let prof = profile("ffv1");
        let overrides = Overrides {
            chroma_decoder: Some(ChromaDecoder::Ntsc3D),
            ..Default::default()
        };
        let run_dir = PathBuf::from("/tmp/run");
        let err = CommandBuilder::new(&input, &prof, &overrides, &run_dir)
            .build(None)
            .unwrap_err();
        assert!(matches!(err, ExportError::InvalidCombination { .. }));
    }

    #[test]
    fn override_args_follow_profile_flags() {
        let input = descriptor(SignalType::Cvbs, VideoSystem::Pal);
        let prof = profile("x264_web");
        let overrides = Overrides {
            extra_encoder_args: vec!["-crf".into(), "14".into()],
            ..Default::default()
        };
        let run_dir = PathBuf::from("/tmp/run");
        let plan = CommandBuilder::new(&input, &prof, &overrides, &run_dir)
            .build(None)
            .unwrap();

        let encoder = plan.stages.last().unwrap();
        let positions: Vec<usize> = encoder
            .args
            .iter()
            .enumerate()
            .filter(|(_, a)| a.as_str() == "-crf")
            .map(|(i, _)| i)
            .collect();
        // both the profile flag and the override are emitted, override last
        assert_eq!(positions.len(), 2);
        assert_eq!(encoder.args[positions[0] + 1], "18");
        assert_eq!(encoder.args[positions[1] + 1], "14");
    }
}
