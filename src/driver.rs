use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tiny_skia::Pixmap;

use crate::clock::FrameClock;
use crate::compositor::Compositor;
use crate::config::{RenderConfig, RenderMode};
use crate::decoding::ClipPlayer;
use crate::encoding::FrameSink;
use crate::error::{RenderDiagnostics, RenderError, RenderResult};
use crate::media::MediaHandle;
use crate::playback::{AudioSpan, ClipTransport, PlaybackController};
use crate::request::TemplateKind;

pub const MAX_LOOP_PROGRESS: f64 = 0.99;

pub struct DriverOptions<'a> {
    pub mode: RenderMode,
    pub seek_poll_interval: Duration,
    pub seek_poll_attempts: u32,
    pub cancel: Arc<AtomicBool>,
    pub progress: Option<&'a mut dyn FnMut(f64)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DriverOutcome {
    pub mode: RenderMode,
    pub frames: u64,
    pub spans: Vec<AudioSpan>,
    pub diagnostics: RenderDiagnostics,
}

pub fn run_frames<P: ClipTransport>(
    compositor: &mut Compositor,
    mut playback: PlaybackController<P>,
    clock: &mut dyn FrameClock,
    mut sink: Box<dyn FrameSink + '_>,
    mut options: DriverOptions<'_>,
) -> RenderResult<DriverOutcome> {
    let schedule = compositor.schedule().clone();
    let total = schedule.total_duration();
    let (width, height) = compositor.canvas_size();
    let mut surface = Pixmap::new(width, height)
        .ok_or_else(|| RenderError::validation("canvas size must be non-zero"))?;
    let mut diagnostics = RenderDiagnostics::default();
    let report_every = u64::from(schedule.fps().max(1));

    tracing::info!(
        mode = ?options.mode,
        template = schedule.kind().as_str(),
        frames = schedule.frame_count(),
        total_secs = total,
        "render loop starting"
    );

    while let Some(tick) = clock.next_tick() {
        if options.cancel.load(Ordering::Relaxed) {
            tracing::warn!(frame = tick.frame, "render cancelled");
            return Err(RenderError::Cancelled);
        }
        let state = schedule.state_at(tick.frame, tick.t);
        playback.advance(&state, tick.t);

        let clips = match options.mode {
            RenderMode::Live => playback.live_frames(&state, tick.t),
            RenderMode::Offline => {
                let (clips, failures) = playback.offline_frames(
                    &state,
                    options.seek_poll_interval,
                    options.seek_poll_attempts,
                );
                for (clip, reason) in failures {
                    let error = RenderError::FrameRender {
                        frame: tick.frame,
                        t: tick.t,
                        phase: state.phase,
                        clip: Some(clip),
                        reason: format!("{reason:#}"),
                    };
                    tracing::warn!(frame = tick.frame, clip, error = %error, "frame degraded");
                    diagnostics.record(&error);
                }
                clips
            }
        };

        compositor.draw_frame(&state, &clips, &mut surface);
        sink.submit(surface.data(), tick)?;

        if tick.frame % report_every == 0 {
            let fraction = ((tick.t + schedule.frame_interval()) / total).min(MAX_LOOP_PROGRESS);
            tracing::debug!(frame = tick.frame, t = tick.t, phase = %state.phase, "rendered");
            if let Some(progress) = options.progress.as_deref_mut() {
                progress(fraction);
            }
        }
    }

    if options.cancel.load(Ordering::Relaxed) {
        return Err(RenderError::Cancelled);
    }
    let frames = sink.finish()?;
    let expected = schedule.frame_count();
    if frames != expected {
        return Err(RenderError::encoding(format!(
            "encoded {frames} frames but the schedule has {expected}"
        )));
    }
    let spans = playback.finish(total);
    if !diagnostics.is_clean() {
        tracing::warn!(
            failures = diagnostics.frame_failures,
            "render finished with degraded frames"
        );
    }
    Ok(DriverOutcome {
        mode: options.mode,
        frames,
        spans,
        diagnostics,
    })
}

pub fn clip_target(kind: TemplateKind, config: &RenderConfig) -> (u32, u32) {
    match kind {
        TemplateKind::Grid4 => (config.canvas.width / 2, config.canvas.height / 2),
        TemplateKind::NewsSequence => (config.canvas.width, config.canvas.height),
    }
}

pub fn start_players(
    handles: &[MediaHandle],
    ffmpeg: &Path,
    kind: TemplateKind,
    config: &RenderConfig,
) -> RenderResult<Vec<ClipPlayer>> {
    let target = clip_target(kind, config);
    handles
        .iter()
        .map(|handle| {
            let mut player =
                ClipPlayer::new(handle.clone(), ffmpeg.to_path_buf(), config.canvas.fps, target);
            player.load().map_err(|error| {
                RenderError::media_load(Some(handle.index), &handle.path, format!("{error:#}"))
            })?;
            Ok(player)
        })
        .collect()
}

pub fn render_still<P: ClipTransport>(
    compositor: &mut Compositor,
    playback: &mut PlaybackController<P>,
    t: f64,
    seek_poll_interval: Duration,
    seek_poll_attempts: u32,
) -> RenderResult<Pixmap> {
    let schedule = compositor.schedule().clone();
    let t = t.clamp(0.0, (schedule.total_duration() - schedule.frame_interval()).max(0.0));
    let frame = (t * f64::from(schedule.fps())).floor() as u64;
    let state = schedule.state_at(frame, t);
    playback.advance(&state, t);
    let (clips, failures) = playback.offline_frames(&state, seek_poll_interval, seek_poll_attempts);
    for (clip, reason) in failures {
        tracing::warn!(clip, error = %format!("{reason:#}"), "still frame missing a clip");
    }
    let (width, height) = compositor.canvas_size();
    let mut surface = Pixmap::new(width, height)
        .ok_or_else(|| RenderError::validation("canvas size must be non-zero"))?;
    compositor.draw_frame(&state, &clips, &mut surface);
    Ok(surface)
}
