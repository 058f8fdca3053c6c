//! ffmpeg invocation for media re-encoding.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Target video codec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    #[default]
    #[serde(alias = "hevc")]
    H265,
    Vp9,
    Av1,
    /// Passed to `-c:v` verbatim.
    Custom(String),
}

impl VideoCodec {
    fn as_ffmpeg_args(&self) -> Vec<String> {
        let codec = match self {
            Self::H264 => "libx264",
            Self::H265 => "libx265",
            Self::Vp9 => "libvpx-vp9",
            Self::Av1 => "libaom-av1",
            Self::Custom(codec) => codec.as_str(),
        };
        vec!["-c:v".to_string(), codec.to_string()]
    }

    /// Whether the encoder understands `-preset`.
    fn supports_preset(&self) -> bool {
        matches!(self, Self::H264 | Self::H265)
    }
}

impl std::fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::H264 => f.write_str("h264"),
            Self::H265 => f.write_str("h265"),
            Self::Vp9 => f.write_str("vp9"),
            Self::Av1 => f.write_str("av1"),
            Self::Custom(codec) => f.write_str(codec),
        }
    }
}

impl std::str::FromStr for VideoCodec {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "h264" | "avc" => Self::H264,
            "h265" | "hevc" => Self::H265,
            "vp9" => Self::Vp9,
            "av1" => Self::Av1,
            _ => Self::Custom(s.to_string()),
        })
    }
}

/// Audio handling for re-encoded output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    #[default]
    Copy,
    Aac,
    Opus,
    None,
}

impl AudioCodec {
    fn as_ffmpeg_args(&self) -> Vec<String> {
        match self {
            Self::Copy => vec!["-c:a".to_string(), "copy".to_string()],
            Self::Aac => vec!["-c:a".to_string(), "aac".to_string()],
            Self::Opus => vec!["-c:a".to_string(), "libopus".to_string()],
            Self::None => vec!["-an".to_string()],
        }
    }
}

/// Encoder speed/quality preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    Ultrafast,
    Superfast,
    Veryfast,
    Faster,
    Fast,
    #[default]
    Medium,
    Slow,
    Slower,
    Veryslow,
}

impl Preset {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Ultrafast => "ultrafast",
            Self::Superfast => "superfast",
            Self::Veryfast => "veryfast",
            Self::Faster => "faster",
            Self::Fast => "fast",
            Self::Medium => "medium",
            Self::Slow => "slow",
            Self::Slower => "slower",
            Self::Veryslow => "veryslow",
        }
    }
}

/// Encoding parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodeSettings {
    pub video_codec: VideoCodec,
    pub audio_codec: AudioCodec,
    /// Constant Rate Factor (0-51, lower is better).
    pub crf: u8,
    pub preset: Preset,
}

impl Default for EncodeSettings {
    fn default() -> Self {
        Self {
            video_codec: VideoCodec::default(),
            audio_codec: AudioCodec::default(),
            crf: 28,
            preset: Preset::default(),
        }
    }
}

pub fn build_args(input: &Path, output: &Path, settings: &EncodeSettings) -> Vec<String> {
    let mut args = vec![
        "-y".to_string(),
        "-hide_banner".to_string(),
        "-nostats".to_string(),
    ];
    args.extend(["-loglevel".to_string(), "error".to_string()]);
    args.extend(["-i".to_string(), input.to_string_lossy().into_owned()]);

    args.extend(settings.video_codec.as_ffmpeg_args());
    args.extend(["-crf".to_string(), settings.crf.to_string()]);
    if settings.video_codec.supports_preset() {
        args.extend(["-preset".to_string(), settings.preset.as_str().to_string()]);
    }
    args.extend(settings.audio_codec.as_ffmpeg_args());

    let is_mp4 = output
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("mp4") || e.eq_ignore_ascii_case("mov"));
    if is_mp4 {
        args.extend(["-movflags".to_string(), "+faststart".to_string()]);
    }

    args.push(output.to_string_lossy().into_owned());
    args
}

/// Run ffmpeg to re-encode `input` into `output`.
///
/// The child is killed if `token` is cancelled first.
pub async fn encode(
    ffmpeg_path: &Path,
    input: &Path,
    output: &Path,
    settings: &EncodeSettings,
    token: &CancellationToken,
) -> anyhow::Result<()> {
    let args = build_args(input, output, settings);
    debug!(ffmpeg = %ffmpeg_path.display(), ?args, "Spawning ffmpeg");

    let child = Command::new(ffmpeg_path)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| anyhow::anyhow!("failed to spawn {}: {e}", ffmpeg_path.display()))?;

    let output_result = tokio::select! {
        _ = token.cancelled() => anyhow::bail!("ffmpeg cancelled"),
        out = child.wait_with_output() => out?,
    };

    if !output_result.status.success() {
        let stderr = String::from_utf8_lossy(&output_result.stderr);
        let last_line = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
        anyhow::bail!(
            "ffmpeg exited with code {}: {}",
            output_result.status.code().unwrap_or(-1),
            last_line.trim()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_args_h265_mp4() {
        let args = build_args(
            Path::new("in/a.mp4"),
            Path::new("out/a.mp4"),
            &EncodeSettings::default(),
        );
        let joined = args.join(" ");
        assert!(joined.starts_with("-y -hide_banner -nostats -loglevel error -i in/a.mp4"));
        assert!(joined.contains("-c:v libx265 -crf 28 -preset medium -c:a copy"));
        assert!(joined.ends_with("-movflags +faststart out/a.mp4"));
    }

    #[test]
    fn test_build_args_vp9_has_no_preset() {
        let settings = EncodeSettings {
            video_codec: VideoCodec::Vp9,
            audio_codec: AudioCodec::Opus,
            crf: 33,
            preset: Preset::Slow,
        };
        let args = build_args(Path::new("a.mkv"), Path::new("b.webm"), &settings);
        assert!(!args.contains(&"-preset".to_string()));
        assert!(!args.contains(&"-movflags".to_string()));
        assert!(args.contains(&"libvpx-vp9".to_string()));
        assert!(args.contains(&"libopus".to_string()));
    }

    #[test]
    fn test_codec_from_str() {
        assert_eq!("HEVC".parse::<VideoCodec>().unwrap(), VideoCodec::H265);
        assert_eq!(
            "h264_nvenc".parse::<VideoCodec>().unwrap(),
            VideoCodec::Custom("h264_nvenc".to_string())
        );
    }
}
