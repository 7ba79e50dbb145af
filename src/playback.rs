//! Clip transport control shared by live and offline rendering.
//!
//! The controller issues play/pause/seek/mute calls exactly at phase and
//! clip transitions and keeps an [`AudioRouter`] log of which clip was
//! audible when. The log is what the final mux turns into the soundtrack.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;

use crate::decoding::{ClipPlayer, VideoFrame};
use crate::media::{wrap_source_time, MediaHandle};
use crate::timeline::{ClipRouting, FrameState, Phase, Schedule};

/// Transport surface the controller drives. [`ClipPlayer`] is the real
/// implementation.
pub trait ClipTransport {
    fn media(&self) -> &MediaHandle;
    fn set_muted(&mut self, muted: bool);
    fn is_muted(&self) -> bool;
    fn set_looping(&mut self, looping: bool);
    fn play(&mut self, clock: f64);
    fn pause(&mut self, clock: f64);
    fn seek(&mut self, source: f64) -> Result<()>;
    fn latest_frame(&mut self, clock: f64) -> Option<Arc<VideoFrame>>;
    fn poll_frame_at(
        &mut self,
        source: f64,
        interval: Duration,
        attempts: u32,
    ) -> Result<Arc<VideoFrame>>;
    /// Whatever frame was last shown, for best-effort fallback.
    fn last_frame(&self) -> Option<Arc<VideoFrame>>;
}

impl ClipTransport for ClipPlayer {
    fn media(&self) -> &MediaHandle {
        self.handle()
    }

    fn set_muted(&mut self, muted: bool) {
        ClipPlayer::set_muted(self, muted);
    }

    fn is_muted(&self) -> bool {
        ClipPlayer::is_muted(self)
    }

    fn set_looping(&mut self, looping: bool) {
        ClipPlayer::set_looping(self, looping);
    }

    fn play(&mut self, clock: f64) {
        ClipPlayer::play(self, clock);
    }

    fn pause(&mut self, clock: f64) {
        ClipPlayer::pause(self, clock);
    }

    fn seek(&mut self, source: f64) -> Result<()> {
        ClipPlayer::seek(self, source)
    }

    fn latest_frame(&mut self, clock: f64) -> Option<Arc<VideoFrame>> {
        ClipPlayer::latest_frame(self, clock)
    }

    fn poll_frame_at(
        &mut self,
        source: f64,
        interval: Duration,
        attempts: u32,
    ) -> Result<Arc<VideoFrame>> {
        ClipPlayer::poll_frame_at(self, source, interval, attempts)
    }

    fn last_frame(&self) -> Option<Arc<VideoFrame>> {
        self.cached_frame()
    }
}

/// A stretch of output timeline during which one clip was audible.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AudioSpan {
    pub clip: usize,
    pub timeline_start: f64,
    pub timeline_end: f64,
    /// Source position heard at `timeline_start`.
    pub source_start: f64,
}

impl AudioSpan {
    pub fn duration(&self) -> f64 {
        self.timeline_end - self.timeline_start
    }
}

#[derive(Debug, Clone, Copy)]
struct OpenSpan {
    timeline_start: f64,
    source_start: f64,
}

/// Records unmute/mute events as [`AudioSpan`]s. A span that runs past
/// its clip's end is split at the loop point.
#[derive(Debug, Clone)]
pub struct AudioRouter {
    durations: Vec<f64>,
    has_audio: Vec<bool>,
    open: Vec<Option<OpenSpan>>,
    spans: Vec<AudioSpan>,
    peak_unmuted: usize,
}

impl AudioRouter {
    pub fn new(clips: &[MediaHandle]) -> Self {
        Self {
            durations: clips.iter().map(|clip| clip.info.duration).collect(),
            has_audio: clips.iter().map(|clip| clip.info.has_audio).collect(),
            open: vec![None; clips.len()],
            spans: Vec::new(),
            peak_unmuted: 0,
        }
    }

    pub fn unmute(&mut self, clip: usize, t: f64, source: f64) {
        let Some(slot) = self.open.get_mut(clip) else {
            return;
        };
        if slot.is_none() {
            *slot = Some(OpenSpan {
                timeline_start: t,
                source_start: source,
            });
        }
        let unmuted = self.unmuted_count();
        self.peak_unmuted = self.peak_unmuted.max(unmuted);
    }

    pub fn mute(&mut self, clip: usize, t: f64) {
        let Some(open) = self.open.get_mut(clip).and_then(Option::take) else {
            return;
        };
        if !self.has_audio.get(clip).copied().unwrap_or(false) {
            return;
        }
        let duration = self.durations.get(clip).copied().unwrap_or(0.0);
        self.spans
            .extend(split_at_loops(clip, open.timeline_start, t, open.source_start, duration));
    }

    pub fn mute_all(&mut self, t: f64) {
        for clip in 0..self.open.len() {
            self.mute(clip, t);
        }
    }

    pub fn unmuted_count(&self) -> usize {
        self.open.iter().filter(|span| span.is_some()).count()
    }

    /// Most clips ever audible at the same moment.
    pub fn peak_unmuted(&self) -> usize {
        self.peak_unmuted
    }

    pub fn spans(&self) -> &[AudioSpan] {
        &self.spans
    }

    pub fn finish(mut self, t: f64) -> Vec<AudioSpan> {
        self.mute_all(t);
        self.spans
    }
}

fn split_at_loops(
    clip: usize,
    start: f64,
    end: f64,
    source_start: f64,
    duration: f64,
) -> Vec<AudioSpan> {
    let mut spans = Vec::new();
    if end - start <= 1e-9 {
        return spans;
    }
    if duration <= 0.0 {
        return spans;
    }
    let mut timeline = start;
    let mut source = wrap_source_time(source_start, duration);
    while end - timeline > 1e-9 {
        let available = duration - source;
        let piece_end = (timeline + available).min(end);
        if piece_end - timeline > 1e-9 {
            spans.push(AudioSpan {
                clip,
                timeline_start: timeline,
                timeline_end: piece_end,
                source_start: source,
            });
        }
        timeline = piece_end;
        source = 0.0;
    }
    spans
}

/// Drives the clip transports for one render.
pub struct PlaybackController<P: ClipTransport> {
    players: Vec<P>,
    schedule: Schedule,
    router: AudioRouter,
    active: Option<usize>,
    in_cta: bool,
    started: bool,
}

impl<P: ClipTransport> PlaybackController<P> {
    pub fn new(players: Vec<P>, schedule: Schedule) -> Self {
        let handles: Vec<MediaHandle> = players.iter().map(|p| p.media().clone()).collect();
        Self {
            router: AudioRouter::new(&handles),
            players,
            schedule,
            active: None,
            in_cta: false,
            started: false,
        }
    }

    pub fn players(&self) -> &[P] {
        &self.players
    }

    pub fn router(&self) -> &AudioRouter {
        &self.router
    }

    pub fn active_clip(&self) -> Option<usize> {
        self.active
    }

    /// Source position of clip `index` at render time `t`.
    pub fn source_time(&self, index: usize, t: f64) -> f64 {
        let local = self.schedule.clip_local_time(index, t);
        self.players
            .get(index)
            .map(|player| player.media().source_time(local))
            .unwrap_or(0.0)
    }

    /// Applies the transitions due at `state`. `clock` is the transport
    /// clock in seconds (render time in both modes).
    pub fn advance(&mut self, state: &FrameState, clock: f64) {
        if !self.started {
            self.start(clock);
        }
        if state.phase == Phase::Cta {
            if !self.in_cta {
                self.enter_cta(state.t, clock);
            }
            return;
        }
        if let ClipRouting::Sequential { .. } = self.schedule.routing() {
            if state.active_clip != self.active {
                if let Some(next) = state.active_clip {
                    self.switch_to(next, state.t, clock);
                }
            }
        }
    }

    fn start(&mut self, clock: f64) {
        self.started = true;
        match self.schedule.routing() {
            ClipRouting::ConcurrentLoop => {
                for index in 0..self.players.len() {
                    let source = self.source_time(index, 0.0);
                    let player = &mut self.players[index];
                    player.set_muted(true);
                    player.set_looping(true);
                    if let Err(error) = player.seek(source) {
                        tracing::warn!(clip = index, error = %format!("{error:#}"), "seek to trim failed");
                    }
                    player.play(clock);
                }
            }
            ClipRouting::Sequential { .. } => {
                for player in &mut self.players {
                    player.set_muted(true);
                    player.set_looping(true);
                    player.pause(clock);
                }
            }
        }
    }

    fn switch_to(&mut self, next: usize, t: f64, clock: f64) {
        tracing::debug!(from = ?self.active, to = next, t, "clip switch");
        for (index, player) in self.players.iter_mut().enumerate() {
            player.pause(clock);
            player.set_muted(true);
            self.router.mute(index, t);
        }
        let source = self.source_time(next, t);
        if let Some(player) = self.players.get_mut(next) {
            if let Err(error) = player.seek(source) {
                tracing::warn!(clip = next, error = %format!("{error:#}"), "seek on switch failed");
            }
            player.set_muted(false);
            player.play(clock);
            self.router.unmute(next, t, source);
        }
        self.active = Some(next);
    }

    fn enter_cta(&mut self, t: f64, clock: f64) {
        tracing::debug!(t, "entering call to action");
        self.in_cta = true;
        for player in &mut self.players {
            player.pause(clock);
            player.set_muted(true);
        }
        self.router.mute_all(t);
        self.active = None;
    }

    fn visible(&self, state: &FrameState) -> Vec<bool> {
        let mut visible = vec![false; self.players.len()];
        if state.phase == Phase::Cta {
            return visible;
        }
        match self.schedule.routing() {
            ClipRouting::ConcurrentLoop => visible.iter_mut().for_each(|v| *v = true),
            ClipRouting::Sequential { .. } => {
                if let Some(slot) = state.active_clip.and_then(|index| visible.get_mut(index)) {
                    *slot = true;
                }
            }
        }
        visible
    }

    /// Live mode: each visible clip's newest frame at `clock`.
    pub fn live_frames(&mut self, state: &FrameState, clock: f64) -> Vec<Option<Arc<VideoFrame>>> {
        let visible = self.visible(state);
        self.players
            .iter_mut()
            .zip(visible)
            .map(|(player, shown)| if shown { player.latest_frame(clock) } else { None })
            .collect()
    }

    /// Offline mode: each visible clip's frame at its exact source time.
    /// A clip that cannot deliver in time falls back to its last frame and
    /// is reported alongside.
    pub fn offline_frames(
        &mut self,
        state: &FrameState,
        interval: Duration,
        attempts: u32,
    ) -> (Vec<Option<Arc<VideoFrame>>>, Vec<(usize, anyhow::Error)>) {
        let visible = self.visible(state);
        let mut failures = Vec::new();
        let mut frames = Vec::with_capacity(self.players.len());
        for (index, shown) in visible.into_iter().enumerate() {
            if !shown {
                frames.push(None);
                continue;
            }
            let source = self.source_time(index, state.t);
            let player = &mut self.players[index];
            match player.poll_frame_at(source, interval, attempts) {
                Ok(frame) => frames.push(Some(frame)),
                Err(error) => {
                    frames.push(player.last_frame());
                    failures.push((index, error));
                }
            }
        }
        (frames, failures)
    }

    /// Closes every audible span at `t` and returns the routing log.
    pub fn finish(self, t: f64) -> Vec<AudioSpan> {
        self.router.finish(t)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use anyhow::anyhow;

    use super::*;
    use crate::config::TimingConfig;
    use crate::media::MediaInfo;
    use crate::request::TemplateKind;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Play(f64),
        Pause(f64),
        Seek(f64),
    }

    struct FakeTransport {
        media: MediaHandle,
        muted: bool,
        looping: bool,
        calls: Vec<Call>,
        fail_polls: bool,
    }

    impl FakeTransport {
        fn new(index: usize, duration: f64, trim: f64) -> Self {
            Self {
                media: MediaHandle {
                    index,
                    path: PathBuf::from(format!("clip{index}.mp4")),
                    trim_start: trim,
                    info: MediaInfo {
                        width: 4,
                        height: 4,
                        duration,
                        has_audio: true,
                    },
                },
                muted: true,
                looping: false,
                calls: Vec::new(),
                fail_polls: false,
            }
        }

        fn frame(pts: f64) -> Arc<VideoFrame> {
            Arc::new(VideoFrame {
                pts,
                pixmap: tiny_skia::Pixmap::new(4, 4).unwrap(),
            })
        }
    }

    impl ClipTransport for FakeTransport {
        fn media(&self) -> &MediaHandle {
            &self.media
        }
        fn set_muted(&mut self, muted: bool) {
            self.muted = muted;
        }
        fn is_muted(&self) -> bool {
            self.muted
        }
        fn set_looping(&mut self, looping: bool) {
            self.looping = looping;
        }
        fn play(&mut self, clock: f64) {
            self.calls.push(Call::Play(clock));
        }
        fn pause(&mut self, clock: f64) {
            self.calls.push(Call::Pause(clock));
        }
        fn seek(&mut self, source: f64) -> Result<()> {
            self.calls.push(Call::Seek(source));
            Ok(())
        }
        fn latest_frame(&mut self, clock: f64) -> Option<Arc<VideoFrame>> {
            Some(Self::frame(clock))
        }
        fn poll_frame_at(&mut self, source: f64, _: Duration, _: u32) -> Result<Arc<VideoFrame>> {
            if self.fail_polls {
                Err(anyhow!("stuck"))
            } else {
                Ok(Self::frame(source))
            }
        }
        fn last_frame(&self) -> Option<Arc<VideoFrame>> {
            None
        }
    }

    fn news(durations: &[f64]) -> PlaybackController<FakeTransport> {
        let schedule = Schedule::new(TemplateKind::NewsSequence, &TimingConfig::default(), 30);
        let players = durations
            .iter()
            .enumerate()
            .map(|(index, &duration)| FakeTransport::new(index, duration, 0.5))
            .collect();
        PlaybackController::new(players, schedule)
    }

    fn run(controller: &mut PlaybackController<FakeTransport>) -> usize {
        let schedule = controller.schedule.clone();
        let mut max_unmuted = 0;
        for state in schedule.frames() {
            controller.advance(&state, state.t);
            let unmuted = controller.players().iter().filter(|p| !p.is_muted()).count();
            max_unmuted = max_unmuted.max(unmuted);
        }
        max_unmuted
    }

    #[test]
    fn news_unmutes_exactly_one_clip_at_a_time() {
        let mut controller = news(&[10.0; 5]);
        assert_eq!(run(&mut controller), 1);
        assert_eq!(controller.router().peak_unmuted(), 1);
        assert!(controller.players().iter().all(|p| p.is_muted()));

        let spans = controller.finish(35.0);
        assert_eq!(spans.len(), 5);
        for (index, span) in spans.iter().enumerate() {
            assert_eq!(span.clip, index);
            assert!((span.timeline_start - index as f64 * 6.0).abs() < 0.04);
            assert!((span.source_start - 0.5).abs() < 0.04);
        }
        assert!((spans[4].timeline_end - 30.0).abs() < 1e-9);
    }

    #[test]
    fn news_switch_seeks_next_clip_to_its_trim() {
        let mut controller = news(&[10.0; 5]);
        run(&mut controller);
        let third = &controller.players()[2];
        let first_seek = third.calls.iter().find_map(|call| match call {
            Call::Seek(source) => Some(*source),
            _ => None,
        });
        assert!((first_seek.unwrap() - 0.5).abs() < 0.04);
        assert!(matches!(third.calls.last(), Some(Call::Pause(_))));
    }

    #[test]
    fn short_news_clip_audio_splits_at_loop() {
        let mut controller = news(&[4.0, 10.0, 10.0, 10.0, 10.0]);
        run(&mut controller);
        let spans = controller.finish(35.0);
        let first: Vec<_> = spans.iter().filter(|span| span.clip == 0).collect();
        assert_eq!(first.len(), 2);
        assert!((first[0].timeline_end - 3.5).abs() < 1e-9);
        assert_eq!(first[1].source_start, 0.0);
        assert!((first[1].timeline_end - 6.0).abs() < 0.04);
    }

    #[test]
    fn grid_plays_all_clips_muted_and_looping() {
        let schedule = Schedule::new(TemplateKind::Grid4, &TimingConfig::default(), 30);
        let players = (0..4).map(|index| FakeTransport::new(index, 3.0, 0.0)).collect();
        let mut controller = PlaybackController::new(players, schedule);
        assert_eq!(run(&mut controller), 0);
        for player in controller.players() {
            assert!(player.looping);
            assert_eq!(player.calls.iter().filter(|c| matches!(c, Call::Play(_))).count(), 1);
            // paused only once, on entering the CTA
            assert_eq!(player.calls.iter().filter(|c| matches!(c, Call::Pause(_))).count(), 1);
        }
        assert!(controller.finish(25.0).is_empty());
    }

    #[test]
    fn offline_grid_source_time_wraps_per_clip() {
        let schedule = Schedule::new(TemplateKind::Grid4, &TimingConfig::default(), 30);
        let players = (0..4).map(|index| FakeTransport::new(index, 3.0, 1.0)).collect();
        let mut controller = PlaybackController::new(players, schedule.clone());
        let state = schedule.state_at(0, 7.5);
        controller.advance(&state, state.t);
        let (frames, failures) = controller.offline_frames(&state, Duration::ZERO, 1);
        assert!(failures.is_empty());
        let pts: Vec<f64> = frames.iter().map(|f| f.as_ref().unwrap().pts).collect();
        assert!(pts.iter().all(|&p| (p - 2.5).abs() < 1e-9));
    }

    #[test]
    fn offline_failure_is_reported_not_raised() {
        let mut controller = news(&[10.0; 5]);
        controller.players[0].fail_polls = true;
        let schedule = controller.schedule.clone();
        let state = schedule.frame_state(10);
        controller.advance(&state, state.t);
        let (frames, failures) = controller.offline_frames(&state, Duration::ZERO, 1);
        assert_eq!(frames.len(), 5);
        assert!(frames.iter().all(Option::is_none));
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, 0);
    }

    #[test]
    fn cta_hides_every_clip() {
        let mut controller = news(&[10.0; 5]);
        let schedule = controller.schedule.clone();
        let state = schedule.frame_state(schedule.frame_count() - 1);
        controller.advance(&state, state.t);
        assert!(controller.live_frames(&state, state.t).iter().all(Option::is_none));
        assert_eq!(controller.active_clip(), None);
    }
}
