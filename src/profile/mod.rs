//! Encoding profile registry
//!
//! A profile is a named bundle of encoder codec/format/flag choices. The
//! registry carries built-in defaults and can merge user-defined profiles
//! from a TOML document; resolution is a pure lookup with no side effects.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::{ExportError, ExportResult};

/// A validated encoding profile.
#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    /// Profile identifier used for lookup
    pub name: String,
    /// Encoder video codec (e.g. `ffv1`, `libx264`)
    pub video_codec: String,
    /// Encoder pixel format (e.g. `yuv422p10le`)
    pub pixel_format: String,
    /// Optional video filter chain appended to the encoder graph
    pub video_filter: Option<String>,
    /// Whether the profile doubles the output frame rate (one frame per field)
    pub doubles_rate: bool,
    /// Audio codec applied when a PCM track is supplied
    pub audio_codec: String,
    /// Extra encoder flags emitted after codec/pixel-format selection,
    /// in order
    pub codec_opts: Vec<String>,
    /// Output container extension (e.g. `mkv`, `mov`, `mp4`)
    pub container: String,
}

impl Profile {
    /// True when this profile encodes a luma-only (grayscale) picture and
    /// therefore cannot take a dual-source S-Video merge.
    pub fn is_luma_only(&self) -> bool {
        self.pixel_format.starts_with("gray") || self.pixel_format.starts_with("y8")
    }
}

/// Raw profile shape as it appears in a user TOML document.
///
/// Validated and converted into [`Profile`] at the loading boundary so the
/// core only ever sees typed data.
#[derive(Debug, Deserialize)]
struct RawProfile {
    video_codec: String,
    pixel_format: String,
    #[serde(default)]
    video_filter: Option<String>,
    #[serde(default)]
    doubles_rate: bool,
    #[serde(default = "default_audio_codec")]
    audio_codec: String,
    #[serde(default)]
    codec_opts: Vec<String>,
    container: String,
}

fn default_audio_codec() -> String {
    "flac".to_string()
}

#[derive(Debug, Deserialize)]
struct ProfileDocument {
    #[serde(default)]
    profiles: BTreeMap<String, RawProfile>,
}

/// Flat namespace of profiles, looked up by name.
#[derive(Debug, Clone)]
pub struct ProfileRegistry {
    profiles: BTreeMap<String, Profile>,
}

impl ProfileRegistry {
    /// Registry with the built-in default profiles.
    pub fn builtin() -> Self {
        let mut profiles = BTreeMap::new();

        for profile in [
            Profile {
                name: "ffv1".into(),
                video_codec: "ffv1".into(),
                pixel_format: "yuv422p10le".into(),
                video_filter: None,
                doubles_rate: false,
                audio_codec: "flac".into(),
                codec_opts: vec![
                    "-coder".into(),
                    "1".into(),
                    "-context".into(),
                    "1".into(),
                    "-level".into(),
                    "3".into(),
                    "-slicecrc".into(),
                    "1".into(),
                ],
                container: "mkv".into(),
            },
            Profile {
                name: "ffv1_luma".into(),
                video_codec: "ffv1".into(),
                pixel_format: "gray16le".into(),
                video_filter: None,
                doubles_rate: false,
                audio_codec: "flac".into(),
                codec_opts: vec!["-coder".into(), "1".into(), "-context".into(), "1".into()],
                container: "mkv".into(),
            },
            Profile {
                name: "prores_hq".into(),
                video_codec: "prores_ks".into(),
                pixel_format: "yuv422p10le".into(),
                video_filter: None,
                doubles_rate: false,
                audio_codec: "pcm_s16le".into(),
                codec_opts: vec![
                    "-profile:v".into(),
                    "3".into(),
                    "-vendor".into(),
                    "apl0".into(),
                ],
                container: "mov".into(),
            },
            Profile {
                name: "v210".into(),
                video_codec: "v210".into(),
                pixel_format: "yuv422p10le".into(),
                video_filter: None,
                doubles_rate: false,
                audio_codec: "pcm_s16le".into(),
                codec_opts: vec![],
                container: "mov".into(),
            },
            Profile {
                name: "x264_web".into(),
                video_codec: "libx264".into(),
                pixel_format: "yuv420p".into(),
                video_filter: None,
                doubles_rate: true,
                audio_codec: "aac".into(),
                codec_opts: vec![
                    "-crf".into(),
                    "18".into(),
                    "-preset".into(),
                    "medium".into(),
                    "-movflags".into(),
                    "+faststart".into(),
                ],
                container: "mp4".into(),
            },
            Profile {
                name: "x265_web".into(),
                video_codec: "libx265".into(),
                pixel_format: "yuv420p".into(),
                video_filter: None,
                doubles_rate: true,
                audio_codec: "aac".into(),
                codec_opts: vec!["-crf".into(), "20".into(), "-preset".into(), "medium".into()],
                container: "mp4".into(),
            },
        ] {
            profiles.insert(profile.name.clone(), profile);
        }

        Self { profiles }
    }

    /// Parse user-defined profiles from a TOML document and merge them over
    /// the current set. A user profile with the same name shadows a built-in.
    pub fn merge_toml(&mut self, document: &str) -> ExportResult<()> {
        let parsed: ProfileDocument =
            toml::from_str(document).map_err(|e| ExportError::InvalidProfile {
                message: e.to_string(),
            })?;

        for (name, raw) in parsed.profiles {
            if raw.video_codec.is_empty() || raw.pixel_format.is_empty() {
                return Err(ExportError::InvalidProfile {
                    message: format!("profile '{name}' requires a video codec and pixel format"),
                });
            }
            if raw.container.is_empty() {
                return Err(ExportError::InvalidProfile {
                    message: format!("profile '{name}' requires a container extension"),
                });
            }

            self.profiles.insert(
                name.clone(),
                Profile {
                    name,
                    video_codec: raw.video_codec,
                    pixel_format: raw.pixel_format,
                    video_filter: raw.video_filter,
                    doubles_rate: raw.doubles_rate,
                    audio_codec: raw.audio_codec,
                    codec_opts: raw.codec_opts,
                    container: raw.container,
                },
            );
        }

        Ok(())
    }

    /// Resolve a profile by name. Unknown names are a configuration error
    /// surfaced before anything launches.
    pub fn resolve(&self, name: &str) -> ExportResult<&Profile> {
        self.profiles
            .get(name)
            .ok_or_else(|| ExportError::UnknownProfile { name: name.into() })
    }

    /// Iterate all registered profiles in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Profile> {
        self.profiles.values()
    }
}
