use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use crate::config::NarrationMix;
use crate::encoding::last_n_chars;
use crate::error::{RenderError, RenderResult};
use crate::media::MediaHandle;
use crate::playback::AudioSpan;

const SAMPLE_RATE: u32 = 48_000;

#[derive(Debug, Clone)]
pub struct MuxRequest<'a> {
    pub video: &'a Path,
    pub clips: &'a [MediaHandle],
    pub spans: &'a [AudioSpan],
    pub narration: Option<&'a Path>,
    pub narration_mix: NarrationMix,
    pub total_secs: f64,
    pub audio_bitrate: &'a str,
    pub output: &'a Path,
}

fn secs(value: f64) -> String {
    format!("{:.3}", value.max(0.0))
}

pub fn mux_args(request: &MuxRequest<'_>) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-y", "-i"]
        .iter()
        .map(|arg| arg.to_string())
        .collect();
    args.push(request.video.to_string_lossy().into_owned());

    let use_clip_audio = request.narration.is_none() || request.narration_mix == NarrationMix::Mix;
    let spans: Vec<&AudioSpan> = if use_clip_audio {
        request
            .spans
            .iter()
            .filter(|span| span.duration() > 1e-6)
            .filter(|span| request.clips.get(span.clip).is_some_and(|clip| clip.info.has_audio))
            .collect()
    } else {
        Vec::new()
    };

    // one input per clip that is heard at all
    let mut clip_inputs: Vec<(usize, usize)> = Vec::new();
    let mut next_input = 1;
    for span in &spans {
        if !clip_inputs.iter().any(|(clip, _)| *clip == span.clip) {
            args.push("-i".to_owned());
            args.push(request.clips[span.clip].path.to_string_lossy().into_owned());
            clip_inputs.push((span.clip, next_input));
            next_input += 1;
        }
    }
    let narration_input = request.narration.map(|path| {
        args.push("-i".to_owned());
        args.push(path.to_string_lossy().into_owned());
        let input = next_input;
        next_input += 1;
        input
    });

    let mut filters = Vec::new();
    let mut labels = Vec::new();
    for (index, span) in spans.iter().enumerate() {
        let Some(&(_, input)) = clip_inputs.iter().find(|(clip, _)| *clip == span.clip) else {
            continue;
        };
        let delay_ms = (span.timeline_start * 1000.0).round() as u64;
        filters.push(format!(
            "[{input}:a]atrim=start={}:end={},asetpts=PTS-STARTPTS,aresample={SAMPLE_RATE},adelay={delay_ms}:all=1[a{index}]",
            secs(span.source_start),
            secs(span.source_start + span.duration()),
        ));
        labels.push(format!("[a{index}]"));
    }
    if let Some(input) = narration_input {
        filters.push(format!("[{input}:a]aresample={SAMPLE_RATE}[nar]"));
        labels.push("[nar]".to_owned());
    }

    let total = secs(request.total_secs);
    if labels.is_empty() {
        args.extend(
            [
                "-f".to_owned(),
                "lavfi".to_owned(),
                "-t".to_owned(),
                total.clone(),
                "-i".to_owned(),
                format!("anullsrc=channel_layout=stereo:sample_rate={SAMPLE_RATE}"),
                "-map".to_owned(),
                "0:v:0".to_owned(),
                "-map".to_owned(),
                format!("{next_input}:a:0"),
            ],
        );
    } else {
        let mix = if labels.len() == 1 {
            format!("{}apad,atrim=end={total}[aout]", labels[0])
        } else {
            format!(
                "{}amix=inputs={}:duration=longest:normalize=0,apad,atrim=end={total}[aout]",
                labels.concat(),
                labels.len()
            )
        };
        filters.push(mix);
        args.push("-filter_complex".to_owned());
        args.push(filters.join(";"));
        args.extend(["-map", "0:v:0", "-map", "[aout]"].iter().map(|arg| arg.to_string()));
    }

    args.extend(
        [
            "-c:v",
            "copy",
            "-c:a",
            "aac",
            "-b:a",
            request.audio_bitrate,
            "-ac",
            "2",
            "-t",
            total.as_str(),
            "-movflags",
            "+faststart",
        ]
        .iter()
        .map(|arg| arg.to_string()),
    );
    args.push(request.output.to_string_lossy().into_owned());
    args
}

pub async fn run_mux(ffmpeg: &Path, request: &MuxRequest<'_>) -> RenderResult<PathBuf> {
    let args = mux_args(request);
    tracing::debug!(args = %args.join(" "), "muxing");
    let output = Command::new(ffmpeg)
        .kill_on_drop(true)
        .args(&args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|error| {
            RenderError::encoding(format!(
                "failed to spawn {} for mux: {error}",
                ffmpeg.display()
            ))
        })?;
    if !output.status.success() {
        return Err(RenderError::Encoding {
            message: format!("mux exited with {}", output.status),
            frame: None,
            stderr_tail: last_n_chars(&String::from_utf8_lossy(&output.stderr), 500),
        });
    }
    let size = tokio::fs::metadata(request.output)
        .await
        .map(|meta| meta.len())
        .unwrap_or(0);
    if size == 0 {
        return Err(RenderError::encoding(format!(
            "mux produced an empty file at {}",
            request.output.display()
        )));
    }
    Ok(request.output.to_path_buf())
}
