//! Input descriptor detection
//!
//! Maps a TBC capture on disk to an immutable [`InputDescriptor`]: the data
//! file(s), the metadata sidecar and the detected signal type. A capture is
//! S-Video when a `_chroma.tbc` sibling exists next to the luma file,
//! otherwise composite (CVBS).

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ExportError, ExportResult};

/// Detected signal type of a TBC capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalType {
    /// Composite: luma and chroma combined in one channel
    Cvbs,
    /// S-Video: luma and chroma on two separate channels
    SVideo,
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalType::Cvbs => write!(f, "CVBS"),
            SignalType::SVideo => write!(f, "S-Video"),
        }
    }
}

/// Video system of the source capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoSystem {
    Pal,
    PalM,
    Ntsc,
}

impl VideoSystem {
    /// Nominal field rate of the system.
    pub fn fields_per_second(&self) -> f64 {
        match self {
            VideoSystem::Pal => 50.0,
            VideoSystem::PalM | VideoSystem::Ntsc => 60000.0 / 1001.0,
        }
    }
}

impl fmt::Display for VideoSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VideoSystem::Pal => write!(f, "PAL"),
            VideoSystem::PalM => write!(f, "PAL-M"),
            VideoSystem::Ntsc => write!(f, "NTSC"),
        }
    }
}

/// Metadata parsed from the `.tbc.json` sidecar produced by the decode tools.
#[derive(Debug, Clone, PartialEq)]
pub struct TbcMetadata {
    /// Number of sequential fields in the capture
    pub field_count: u64,
    /// Source sample rate in Hz
    pub sample_rate: Option<f64>,
    pub system: VideoSystem,
}

impl TbcMetadata {
    /// Capture duration implied by the field count and the system's nominal
    /// field rate.
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.field_count as f64 / self.system.fields_per_second())
    }
}

#[derive(Debug, Deserialize)]
struct SidecarDocument {
    #[serde(rename = "videoParameters")]
    video_parameters: SidecarVideoParameters,
}

#[derive(Debug, Deserialize)]
struct SidecarVideoParameters {
    #[serde(rename = "numberOfSequentialFields")]
    number_of_sequential_fields: u64,
    #[serde(rename = "sampleRate", default)]
    sample_rate: Option<f64>,
    #[serde(default)]
    system: Option<String>,
    #[serde(rename = "isSourcePal", default)]
    is_source_pal: Option<bool>,
}

/// Immutable description of the capture being exported.
#[derive(Debug, Clone)]
pub struct InputDescriptor {
    /// Combined (CVBS) or luma (S-Video) TBC data file
    pub tbc_path: PathBuf,
    /// Chroma TBC data file, present only for S-Video captures
    pub chroma_tbc_path: Option<PathBuf>,
    /// Metadata sidecar path, passed on to the decoder
    pub metadata_path: PathBuf,
    pub signal_type: SignalType,
    pub metadata: TbcMetadata,
}

impl InputDescriptor {
    /// Detect the capture layout rooted at `tbc_path` and parse its sidecar.
    pub fn detect(tbc_path: &Path) -> ExportResult<Self> {
        if !tbc_path.is_file() {
            return Err(ExportError::InvalidInput {
                message: format!("TBC file not found: {}", tbc_path.display()),
            });
        }

        let metadata_path = sidecar_path(tbc_path);
        if !metadata_path.is_file() {
            return Err(ExportError::InvalidInput {
                message: format!("metadata sidecar not found: {}", metadata_path.display()),
            });
        }

        let chroma_tbc_path = chroma_sibling(tbc_path).filter(|p| p.is_file());
        let signal_type = if chroma_tbc_path.is_some() {
            SignalType::SVideo
        } else {
            SignalType::Cvbs
        };

        let metadata = parse_sidecar(&metadata_path)?;

        Ok(Self {
            tbc_path: tbc_path.to_path_buf(),
            chroma_tbc_path,
            metadata_path,
            signal_type,
            metadata,
        })
    }
}

/// `foo.tbc` -> `foo.tbc.json`
fn sidecar_path(tbc_path: &Path) -> PathBuf {
    let mut os = tbc_path.as_os_str().to_os_string();
    os.push(".json");
    PathBuf::from(os)
}

/// `foo.tbc` -> `foo_chroma.tbc`
fn chroma_sibling(tbc_path: &Path) -> Option<PathBuf> {
    let stem = tbc_path.file_stem()?.to_str()?;
    if stem.ends_with("_chroma") {
        return None;
    }
    Some(tbc_path.with_file_name(format!("{stem}_chroma.tbc")))
}

fn parse_sidecar(path: &Path) -> ExportResult<TbcMetadata> {
    let raw = std::fs::read_to_string(path)?;
    let doc: SidecarDocument =
        serde_json::from_str(&raw).map_err(|e| ExportError::InvalidInput {
            message: format!("malformed metadata sidecar {}: {e}", path.display()),
        })?;

    let params = doc.video_parameters;
    let system = match params.system.as_deref() {
        Some("PAL") => VideoSystem::Pal,
        Some("PAL-M") => VideoSystem::PalM,
        Some("NTSC") => VideoSystem::Ntsc,
        Some(other) => {
            return Err(ExportError::InvalidInput {
                message: format!("unknown video system '{other}' in sidecar"),
            })
        }
        // older sidecars carry a boolean instead of a system name
        None => match params.is_source_pal {
            Some(true) => VideoSystem::Pal,
            Some(false) => VideoSystem::Ntsc,
            None => {
                return Err(ExportError::InvalidInput {
                    message: "sidecar does not declare a video system".into(),
                })
            }
        },
    };

    if params.number_of_sequential_fields == 0 {
        return Err(ExportError::InvalidInput {
            message: "sidecar reports zero fields".into(),
        });
    }

    Ok(TbcMetadata {
        field_count: params.number_of_sequential_fields,
        sample_rate: params.sample_rate,
        system,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_capture(dir: &Path, stem: &str, svideo: bool, system: &str) -> PathBuf {
        let tbc = dir.join(format!("{stem}.tbc"));
        fs::write(&tbc, b"tbc-data").unwrap();
        if svideo {
            fs::write(dir.join(format!("{stem}_chroma.tbc")), b"tbc-chroma").unwrap();
        }
        fs::write(
            sidecar_path(&tbc),
            format!(
                r#"{{"videoParameters": {{"numberOfSequentialFields": 1000,
                     "sampleRate": 17734375, "system": "{system}"}}}}"#
            ),
        )
        .unwrap();
        tbc
    }

    #[test]
    fn detects_cvbs_capture() {
        let dir = tempfile::tempdir().unwrap();
        let tbc = write_capture(dir.path(), "tape", false, "PAL");

        let input = InputDescriptor::detect(&tbc).unwrap();
        assert_eq!(input.signal_type, SignalType::Cvbs);
        assert!(input.chroma_tbc_path.is_none());
        assert_eq!(input.metadata.field_count, 1000);
        assert_eq!(input.metadata.system, VideoSystem::Pal);
    }

    #[test]
    fn detects_svideo_capture() {
        let dir = tempfile::tempdir().unwrap();
        let tbc = write_capture(dir.path(), "tape", true, "NTSC");

        let input = InputDescriptor::detect(&tbc).unwrap();
        assert_eq!(input.signal_type, SignalType::SVideo);
        assert!(input.chroma_tbc_path.unwrap().ends_with("tape_chroma.tbc"));
        assert_eq!(input.metadata.system, VideoSystem::Ntsc);
    }

    #[test]
    fn duration_follows_the_system_field_rate() {
        let pal = TbcMetadata {
            field_count: 1000,
            sample_rate: Some(17_734_375.0),
            system: VideoSystem::Pal,
        };
        assert_eq!(pal.duration(), Duration::from_secs(20));

        let ntsc = TbcMetadata {
            field_count: 60,
            sample_rate: None,
            system: VideoSystem::Ntsc,
        };
        // 60 fields at 60000/1001 fields per second
        assert!((ntsc.duration().as_secs_f64() - 1.001).abs() < 1e-6);
    }

    #[test]
    fn missing_sidecar_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let tbc = dir.path().join("tape.tbc");
        fs::write(&tbc, b"tbc-data").unwrap();

        let err = InputDescriptor::detect(&tbc).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn legacy_sidecar_boolean_system() {
        let dir = tempfile::tempdir().unwrap();
        let tbc = dir.path().join("tape.tbc");
        fs::write(&tbc, b"tbc-data").unwrap();
        fs::write(
            sidecar_path(&tbc),
            r#"{"videoParameters": {"numberOfSequentialFields": 20, "isSourcePal": true}}"#,
        )
        .unwrap();

        let input = InputDescriptor::detect(&tbc).unwrap();
        assert_eq!(input.metadata.system, VideoSystem::Pal);
        assert!(input.metadata.sample_rate.is_none());
    }
}
