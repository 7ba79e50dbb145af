use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use tiny_skia::{IntSize, Pixmap};
use tokio::process::Command;

use crate::config::EncoderConfig;
use crate::error::{RenderError, RenderResult};
use crate::request::ClipRef;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaInfo {
    pub width: u32,
    pub height: u32,
    pub duration: f64,
    pub has_audio: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaHandle {
    pub index: usize,
    pub path: PathBuf,
    pub trim_start: f64,
    pub info: MediaInfo,
}

impl MediaHandle {
    pub fn source_time(&self, local: f64) -> f64 {
        wrap_source_time(self.trim_start + local.max(0.0), self.info.duration)
    }
}

pub fn wrap_source_time(position: f64, duration: f64) -> f64 {
    if duration <= 0.0 || !position.is_finite() {
        return 0.0;
    }
    position.rem_euclid(duration)
}

pub fn ffprobe_path(encoder: &EncoderConfig, ffmpeg: &Path) -> PathBuf {
    if let Some(path) = &encoder.ffprobe_path {
        return path.clone();
    }
    let sibling = ffmpeg
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| name.starts_with("ffmpeg"))
        .map(|name| name.replacen("ffmpeg", "ffprobe", 1));
    match (ffmpeg.parent(), sibling) {
        (Some(parent), Some(name)) if !parent.as_os_str().is_empty() => parent.join(name),
        (_, Some(name)) => PathBuf::from(name),
        _ => PathBuf::from("ffprobe"),
    }
}

#[derive(Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    duration: Option<String>,
}

#[derive(Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

#[derive(Deserialize)]
struct ProbeOut {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

pub fn parse_ffprobe_output(stdout: &[u8]) -> Result<MediaInfo> {
    let parsed: ProbeOut = serde_json::from_slice(stdout).context("ffprobe json parse failed")?;
    let video = parsed
        .streams
        .iter()
        .find(|stream| stream.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| anyhow!("no video stream found"))?;
    let width = video.width.ok_or_else(|| anyhow!("missing video width"))?;
    let height = video.height.ok_or_else(|| anyhow!("missing video height"))?;
    let duration = parsed
        .format
        .as_ref()
        .and_then(|format| format.duration.as_deref())
        .or(video.duration.as_deref())
        .and_then(|value| value.parse::<f64>().ok())
        .filter(|value| value.is_finite() && *value > 0.0)
        .ok_or_else(|| anyhow!("clip reports no usable duration"))?;
    let has_audio = parsed
        .streams
        .iter()
        .any(|stream| stream.codec_type.as_deref() == Some("audio"));
    Ok(MediaInfo {
        width,
        height,
        duration,
        has_audio,
    })
}

pub async fn inspect_media(ffprobe: &Path, path: &Path, budget: Duration) -> Result<MediaInfo> {
    let output = tokio::time::timeout(
        budget,
        Command::new(ffprobe)
            .kill_on_drop(true)
            .args([
                "-v",
                "error",
                "-print_format",
                "json",
                "-show_streams",
                "-show_format",
            ])
            .arg(path)
            .stdin(Stdio::null())
            .output(),
    )
    .await
    .map_err(|_| anyhow!("ffprobe timed out after {:.0}s", budget.as_secs_f64()))?
    .with_context(|| format!("failed to run {}", ffprobe.display()))?;
    if !output.status.success() {
        bail!(
            "ffprobe failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    parse_ffprobe_output(&output.stdout)
}

pub async fn check_decodes(
    ffmpeg: &Path,
    path: &Path,
    trim_start: f64,
    budget: Duration,
) -> Result<()> {
    let output = tokio::time::timeout(
        budget,
        Command::new(ffmpeg)
            .kill_on_drop(true)
            .args(["-hide_banner", "-v", "error", "-ss"])
            .arg(format!("{trim_start:.3}"))
            .arg("-i")
            .arg(path)
            .args(["-frames:v", "1", "-an", "-f", "null", "-"])
            .stdin(Stdio::null())
            .output(),
    )
    .await
    .map_err(|_| anyhow!("decode check timed out after {:.0}s", budget.as_secs_f64()))?
    .with_context(|| format!("failed to run {}", ffmpeg.display()))?;
    if !output.status.success() {
        bail!(
            "first frame failed to decode: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

pub struct MediaLoader {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    budget: Duration,
}

impl MediaLoader {
    pub fn new(ffmpeg: PathBuf, ffprobe: PathBuf, budget: Duration) -> Self {
        Self {
            ffmpeg,
            ffprobe,
            budget,
        }
    }

    pub async fn load_clip(&self, index: usize, clip: &ClipRef) -> RenderResult<MediaHandle> {
        let fail = |reason: anyhow::Error| RenderError::media_load(Some(index), &clip.path, format!("{reason:#}"));
        let info = inspect_media(&self.ffprobe, &clip.path, self.budget)
            .await
            .map_err(fail)?;
        if clip.trim_start >= info.duration {
            tracing::warn!(
                clip = index,
                trim_start = clip.trim_start,
                duration = info.duration,
                "trim start is past the end of the clip; playback wraps"
            );
        }
        check_decodes(
            &self.ffmpeg,
            &clip.path,
            wrap_source_time(clip.trim_start, info.duration),
            self.budget,
        )
        .await
        .map_err(fail)?;
        tracing::debug!(
            clip = index,
            width = info.width,
            height = info.height,
            duration = info.duration,
            has_audio = info.has_audio,
            "clip ready"
        );
        Ok(MediaHandle {
            index,
            path: clip.path.clone(),
            trim_start: clip.trim_start,
            info,
        })
    }

    pub async fn load_clips(&self, clips: &[ClipRef]) -> RenderResult<Vec<MediaHandle>> {
        let mut handles = Vec::with_capacity(clips.len());
        for (index, clip) in clips.iter().enumerate() {
            handles.push(self.load_clip(index, clip).await?);
        }
        Ok(handles)
    }

    pub async fn load_image(&self, path: &Path) -> Option<Pixmap> {
        let owned = path.to_path_buf();
        let load = tokio::task::spawn_blocking(move || decode_image(&owned));
        match tokio::time::timeout(self.budget, load).await {
            Ok(Ok(Ok(pixmap))) => Some(pixmap),
            Ok(Ok(Err(error))) => {
                tracing::warn!(path = %path.display(), error = %format!("{error:#}"), "CTA image unusable; continuing without it");
                None
            }
            Ok(Err(error)) => {
                tracing::warn!(path = %path.display(), %error, "CTA image loader failed; continuing without it");
                None
            }
            Err(_) => {
                tracing::warn!(path = %path.display(), "CTA image load timed out; continuing without it");
                None
            }
        }
    }
}

pub fn decode_image(path: &Path) -> Result<Pixmap> {
    let rgba = image::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?
        .to_rgba8();
    let (width, height) = rgba.dimensions();
    let size = IntSize::from_wh(width, height).ok_or_else(|| anyhow!("image has no pixels"))?;
    let mut data = rgba.into_raw();
    for px in data.chunks_exact_mut(4) {
        let alpha = u16::from(px[3]);
        for channel in &mut px[..3] {
            *channel = ((u16::from(*channel) * alpha + 127) / 255) as u8;
        }
    }
    Pixmap::from_vec(data, size).ok_or_else(|| anyhow!("image buffer does not match its size"))
}
