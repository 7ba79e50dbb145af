use std::fmt;

use serde::Serialize;

use crate::config::TimingConfig;
use crate::request::TemplateKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Header,
    Content,
    Cta,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Header => "header",
            Self::Content => "content",
            Self::Cta => "cta",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PhaseWindow {
    pub phase: Phase,
    pub start: f64,
    pub end: f64,
}

impl PhaseWindow {
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    fn contains(&self, t: f64) -> bool {
        t >= self.start && t < self.end
    }
}

/// How input clips map onto the Content phase.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "routing", rename_all = "snake_case")]
pub enum ClipRouting {
    /// One clip at a time, each owning `clip_duration` seconds from t=0.
    Sequential { clip_duration: f64 },
    /// Every clip visible at once, looping from t=0.
    ConcurrentLoop,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TickerSlot {
    pub index: usize,
    pub start: f64,
    pub end: f64,
}

impl TickerSlot {
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TickerState {
    pub index: usize,
    pub alpha: f32,
}

/// Everything the compositor and playback controller need for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FrameState {
    pub frame: u64,
    pub t: f64,
    pub phase: Phase,
    pub active_clip: Option<usize>,
    pub ticker: Option<TickerState>,
    pub live_dot_visible: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Schedule {
    kind: TemplateKind,
    fps: u32,
    clip_count: usize,
    routing: ClipRouting,
    phases: Vec<PhaseWindow>,
    tickers: Vec<TickerSlot>,
    fade: f64,
}

impl Schedule {
    /// Derives the schedule once from the timing constants. `timing` is
    /// expected to have passed [`TimingConfig::validate`].
    pub fn new(kind: TemplateKind, timing: &TimingConfig, fps: u32) -> Self {
        let clip_count = kind.required_clips();
        match kind {
            TemplateKind::Grid4 => {
                let content_end = timing.grid_content_secs;
                Self {
                    kind,
                    fps,
                    clip_count,
                    routing: ClipRouting::ConcurrentLoop,
                    phases: vec![
                        PhaseWindow {
                            phase: Phase::Content,
                            start: 0.0,
                            end: content_end,
                        },
                        PhaseWindow {
                            phase: Phase::Cta,
                            start: content_end,
                            end: content_end + timing.cta_secs,
                        },
                    ],
                    tickers: Vec::new(),
                    fade: timing.fade_secs,
                }
            }
            TemplateKind::NewsSequence => {
                let header_end = timing.news_header_secs;
                let content_end = timing.news_clip_secs * clip_count as f64;
                Self {
                    kind,
                    fps,
                    clip_count,
                    routing: ClipRouting::Sequential {
                        clip_duration: timing.news_clip_secs,
                    },
                    phases: vec![
                        PhaseWindow {
                            phase: Phase::Header,
                            start: 0.0,
                            end: header_end,
                        },
                        PhaseWindow {
                            phase: Phase::Content,
                            start: header_end,
                            end: content_end,
                        },
                        PhaseWindow {
                            phase: Phase::Cta,
                            start: content_end,
                            end: content_end + timing.cta_secs,
                        },
                    ],
                    tickers: ticker_slots(header_end, content_end, timing.ticker_count),
                    fade: timing.fade_secs,
                }
            }
        }
    }

    pub fn kind(&self) -> TemplateKind {
        self.kind
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    pub fn clip_count(&self) -> usize {
        self.clip_count
    }

    pub fn routing(&self) -> ClipRouting {
        self.routing
    }

    pub fn phases(&self) -> &[PhaseWindow] {
        &self.phases
    }

    pub fn tickers(&self) -> &[TickerSlot] {
        &self.tickers
    }

    pub fn total_duration(&self) -> f64 {
        self.phases.last().map(|window| window.end).unwrap_or(0.0)
    }

    /// End of clip playback (start of the CTA phase).
    pub fn content_end(&self) -> f64 {
        self.window(Phase::Cta)
            .map(|window| window.start)
            .unwrap_or_else(|| self.total_duration())
    }

    pub fn window(&self, phase: Phase) -> Option<PhaseWindow> {
        self.phases.iter().copied().find(|window| window.phase == phase)
    }

    pub fn frame_count(&self) -> u64 {
        (self.total_duration() * f64::from(self.fps)).round() as u64
    }

    pub fn frame_interval(&self) -> f64 {
        1.0 / f64::from(self.fps)
    }

    pub fn frame_time(&self, frame: u64) -> f64 {
        frame as f64 / f64::from(self.fps)
    }

    pub fn phase_at(&self, t: f64) -> Phase {
        self.phases
            .iter()
            .find(|window| window.contains(t))
            .map(|window| window.phase)
            .unwrap_or_else(|| {
                if t < 0.0 {
                    self.phases[0].phase
                } else {
                    Phase::Cta
                }
            })
    }

    /// Clamped clip index for sequential routing; `None` when all clips are
    /// visible together.
    pub fn active_clip_index_at(&self, t: f64) -> Option<usize> {
        match self.routing {
            ClipRouting::Sequential { clip_duration } => {
                let index = (t.max(0.0) / clip_duration).floor() as usize;
                Some(index.min(self.clip_count - 1))
            }
            ClipRouting::ConcurrentLoop => None,
        }
    }

    /// Seconds into clip `index`'s own window.
    pub fn clip_local_time(&self, index: usize, t: f64) -> f64 {
        match self.routing {
            ClipRouting::Sequential { clip_duration } => t - index as f64 * clip_duration,
            ClipRouting::ConcurrentLoop => t,
        }
    }

    pub fn clip_start(&self, index: usize) -> f64 {
        match self.routing {
            ClipRouting::Sequential { clip_duration } => index as f64 * clip_duration,
            ClipRouting::ConcurrentLoop => 0.0,
        }
    }

    pub fn active_ticker_at(&self, t: f64) -> Option<TickerState> {
        let slot = self
            .tickers
            .iter()
            .find(|slot| t >= slot.start && t < slot.end)?;
        Some(TickerState {
            index: slot.index,
            alpha: fade_alpha(t - slot.start, slot.duration(), self.fade),
        })
    }

    /// True while clips are on screen (header and content).
    pub fn is_content_phase(&self, t: f64) -> bool {
        self.phase_at(t) != Phase::Cta
    }

    pub fn state_at(&self, frame: u64, t: f64) -> FrameState {
        let phase = self.phase_at(t);
        let clips_visible = phase != Phase::Cta;
        FrameState {
            frame,
            t,
            phase,
            active_clip: if clips_visible {
                self.active_clip_index_at(t)
            } else {
                None
            },
            ticker: if phase == Phase::Content {
                self.active_ticker_at(t)
            } else {
                None
            },
            live_dot_visible: (t * 2.0).floor() as i64 % 2 == 0,
        }
    }

    pub fn frame_state(&self, frame: u64) -> FrameState {
        self.state_at(frame, self.frame_time(frame))
    }

    /// Every frame's state in order; used for schedule comparisons.
    pub fn frames(&self) -> impl Iterator<Item = FrameState> + '_ {
        (0..self.frame_count()).map(move |frame| self.frame_state(frame))
    }
}

fn ticker_slots(start: f64, end: f64, count: usize) -> Vec<TickerSlot> {
    if count == 0 {
        return Vec::new();
    }
    let slot = (end - start) / count as f64;
    (0..count)
        .map(|index| TickerSlot {
            index,
            start: start + index as f64 * slot,
            end: if index + 1 == count {
                end
            } else {
                start + (index + 1) as f64 * slot
            },
        })
        .collect()
}

/// Symmetric trapezoid: ramps over `fade` at both ends of a `duration` window.
pub fn fade_alpha(local: f64, duration: f64, fade: f64) -> f32 {
    if local < 0.0 || local > duration {
        return 0.0;
    }
    if fade <= 0.0 {
        return 1.0;
    }
    let alpha = (local / fade).min((duration - local) / fade).min(1.0);
    alpha.clamp(0.0, 1.0) as f32
}
