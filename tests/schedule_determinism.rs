use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tiny_skia::{Color, Pixmap};

use reelcast::clock::{FrameClock, StepClock, Tick};
use reelcast::compositor::Compositor;
use reelcast::config::{RenderConfig, RenderMode};
use reelcast::decoding::VideoFrame;
use reelcast::driver::{run_frames, DriverOptions, DriverOutcome};
use reelcast::encoding::FrameSink;
use reelcast::error::RenderResult;
use reelcast::media::{MediaHandle, MediaInfo};
use reelcast::playback::{ClipTransport, PlaybackController};
use reelcast::request::{ClipRef, Labels, RenderRequest, TemplateKind};
use reelcast::templates::select_layout;
use reelcast::text::TextPainter;
use reelcast::timeline::{Phase, Schedule};

const WIDTH: u32 = 216;
const HEIGHT: u32 = 384;

const CLIP_COLORS: [(u8, u8, u8); 5] = [
    (200, 10, 10),
    (10, 200, 10),
    (10, 10, 200),
    (200, 200, 10),
    (10, 200, 200),
];

/// A clip that always has a solid frame in its own color.
struct SolidClip {
    media: MediaHandle,
    frame: Arc<VideoFrame>,
    muted: bool,
    polls: Option<PollLog>,
}

/// Clip indices asked for a frame, in call order.
type PollLog = Arc<Mutex<Vec<usize>>>;

impl SolidClip {
    fn new(index: usize) -> Self {
        let (r, g, b) = CLIP_COLORS[index];
        let mut pixmap = Pixmap::new(16, 16).unwrap();
        pixmap.fill(Color::from_rgba8(r, g, b, 255));
        Self {
            media: MediaHandle {
                index,
                path: PathBuf::from(format!("clip{index}.mp4")),
                trim_start: 0.0,
                info: MediaInfo {
                    width: 1080,
                    height: 1920,
                    duration: 8.0,
                    has_audio: true,
                },
            },
            frame: Arc::new(VideoFrame { pts: 0.0, pixmap }),
            muted: true,
            polls: None,
        }
    }

    fn logged(index: usize, trim_start: f64, polls: &PollLog) -> Self {
        let mut clip = Self::new(index);
        clip.media.trim_start = trim_start;
        clip.polls = Some(Arc::clone(polls));
        clip
    }
}

impl ClipTransport for SolidClip {
    fn media(&self) -> &MediaHandle {
        &self.media
    }
    fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }
    fn is_muted(&self) -> bool {
        self.muted
    }
    fn set_looping(&mut self, _: bool) {}
    fn play(&mut self, _: f64) {}
    fn pause(&mut self, _: f64) {}
    fn seek(&mut self, _: f64) -> Result<()> {
        Ok(())
    }
    fn latest_frame(&mut self, _: f64) -> Option<Arc<VideoFrame>> {
        Some(Arc::clone(&self.frame))
    }
    fn poll_frame_at(&mut self, _: f64, _: Duration, _: u32) -> Result<Arc<VideoFrame>> {
        if let Some(polls) = &self.polls {
            polls.lock().unwrap().push(self.media.index);
        }
        Ok(Arc::clone(&self.frame))
    }
    fn last_frame(&self) -> Option<Arc<VideoFrame>> {
        Some(Arc::clone(&self.frame))
    }
}

type FrameCheck = Box<dyn FnMut(&[u8], Tick) -> Option<String>>;

/// Runs a check over every submitted frame and collects the failures.
struct CheckingSink {
    check: FrameCheck,
    frames: u64,
    failures: Vec<String>,
}

impl FrameSink for CheckingSink {
    fn submit(&mut self, rgba: &[u8], tick: Tick) -> RenderResult<()> {
        if let Some(failure) = (self.check)(rgba, tick) {
            self.failures.push(failure);
        }
        self.frames += 1;
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.frames
    }

    fn finish(self: Box<Self>) -> RenderResult<u64> {
        assert!(
            self.failures.is_empty(),
            "{} bad frames, first: {}",
            self.failures.len(),
            self.failures[0]
        );
        Ok(self.frames)
    }
}

fn rgb(rgba: &[u8], x: u32, y: u32) -> (u8, u8, u8) {
    let offset = ((y * WIDTH + x) * 4) as usize;
    (rgba[offset], rgba[offset + 1], rgba[offset + 2])
}

fn config() -> RenderConfig {
    let mut config = RenderConfig::default();
    config.canvas.width = WIDTH;
    config.canvas.height = HEIGHT;
    config.canvas.fps = 10;
    config
}

fn request(template: TemplateKind, labels: Labels) -> RenderRequest {
    RenderRequest {
        template,
        clips: (0..template.required_clips())
            .map(|index| ClipRef {
                path: PathBuf::from(format!("clip{index}.mp4")),
                trim_start: 0.0,
            })
            .collect(),
        labels,
        cta_image: None,
        narration: None,
    }
}

fn drive<P: ClipTransport>(
    request: &RenderRequest,
    players: impl FnOnce(usize) -> Vec<P>,
    sink: Box<dyn FrameSink>,
) -> DriverOutcome {
    let config = config();
    let painter = TextPainter::headless();
    let layout = select_layout(request, &config, &painter);
    let mut compositor = Compositor::new(layout, painter, None, &config.branding, WIDTH, HEIGHT);
    let schedule = compositor.schedule().clone();
    let playback = PlaybackController::new(players(schedule.clip_count()), schedule.clone());
    let mut clock: Box<dyn FrameClock> =
        Box::new(StepClock::new(schedule.frame_count(), schedule.fps()));
    let options = DriverOptions {
        mode: RenderMode::Offline,
        seek_poll_interval: Duration::from_millis(1),
        seek_poll_attempts: 3,
        cancel: Arc::new(AtomicBool::new(false)),
        progress: None,
    };
    run_frames(&mut compositor, playback, clock.as_mut(), sink, options).unwrap()
}

fn render(request: &RenderRequest, check: FrameCheck) -> DriverOutcome {
    let sink = Box::new(CheckingSink {
        check,
        frames: 0,
        failures: Vec::new(),
    });
    drive(request, |count| (0..count).map(SolidClip::new).collect(), sink)
}

/// What one emitted frame showed, as the driver saw it.
#[derive(Debug, Clone, PartialEq)]
struct FrameRecord {
    frame: u64,
    t: f64,
    phase: Phase,
    active_clip: Option<usize>,
    ticker: Option<usize>,
    polled: Vec<usize>,
    digest: u64,
}

struct RecordingSink {
    schedule: Schedule,
    polls: PollLog,
    records: Arc<Mutex<Vec<FrameRecord>>>,
}

impl FrameSink for RecordingSink {
    fn submit(&mut self, rgba: &[u8], tick: Tick) -> RenderResult<()> {
        let state = self.schedule.state_at(tick.frame, tick.t);
        let polled = std::mem::take(&mut *self.polls.lock().unwrap());
        let mut hasher = DefaultHasher::new();
        rgba.hash(&mut hasher);
        self.records.lock().unwrap().push(FrameRecord {
            frame: tick.frame,
            t: tick.t,
            phase: state.phase,
            active_clip: state.active_clip,
            ticker: state.ticker.map(|ticker| ticker.index),
            polled,
            digest: hasher.finish(),
        });
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.records.lock().unwrap().len() as u64
    }

    fn finish(self: Box<Self>) -> RenderResult<u64> {
        Ok(self.frames_written())
    }
}

fn record(request: &RenderRequest) -> (Vec<FrameRecord>, DriverOutcome) {
    let polls: PollLog = Arc::new(Mutex::new(Vec::new()));
    let records = Arc::new(Mutex::new(Vec::new()));
    let sink = Box::new(RecordingSink {
        schedule: Schedule::new(request.template, &config().timing, config().canvas.fps),
        polls: Arc::clone(&polls),
        records: Arc::clone(&records),
    });
    let trims: Vec<f64> = request.clips.iter().map(|clip| clip.trim_start).collect();
    let outcome = drive(
        request,
        |count| {
            (0..count)
                .map(|index| SolidClip::logged(index, trims[index], &polls))
                .collect()
        },
        sink,
    );
    let records = records.lock().unwrap().clone();
    (records, outcome)
}

fn news_labels() -> Labels {
    Labels {
        country: "chile".to_owned(),
        date: "12 march".to_owned(),
        tickers: vec![
            "one two three four".to_owned(),
            "five six seven".to_owned(),
            "eight nine ten eleven".to_owned(),
        ],
        ..Labels::default()
    }
}

#[test]
fn grid_shows_four_quadrants_then_cta() {
    let labels = Labels {
        countries: ["chile", "peru", "japan", "iceland"].map(String::from).to_vec(),
        date: "12 МАРТА".to_owned(),
        ..Labels::default()
    };
    let outcome = render(
        &request(TemplateKind::Grid4, labels),
        Box::new(|rgba, tick| {
            let expected: Vec<((u32, u32), (u8, u8, u8))> = if tick.t < 20.0 {
                vec![
                    ((27, 20), CLIP_COLORS[0]),
                    ((189, 20), CLIP_COLORS[1]),
                    ((27, 364), CLIP_COLORS[2]),
                    ((189, 364), CLIP_COLORS[3]),
                    ((108, 20), (255, 0, 0)),
                    ((108, 364), (255, 0, 0)),
                ]
            } else {
                vec![((2, 2), (15, 15, 18))]
            };
            expected
                .into_iter()
                .find(|&((x, y), color)| rgb(rgba, x, y) != color)
                .map(|((x, y), color)| {
                    format!("frame {} pixel ({x},{y}) is {:?}, wanted {color:?}", tick.frame, rgb(rgba, x, y))
                })
        }),
    );

    assert_eq!(outcome.frames, 250);
    assert!(outcome.diagnostics.is_clean());
    // grid audio stays muted
    assert!(outcome.spans.is_empty());
}

#[test]
fn news_switches_clips_every_six_seconds() {
    let outcome = render(&request(TemplateKind::NewsSequence, news_labels()), Box::new(|_, _| None));

    assert_eq!(outcome.frames, 350);
    let spans = &outcome.spans;
    assert_eq!(spans.len(), 5);
    for (index, span) in spans.iter().enumerate() {
        assert_eq!(span.clip, index);
        assert!((span.timeline_start - 6.0 * index as f64).abs() < 0.11, "{span:?}");
    }
    for pair in spans.windows(2) {
        assert!(pair[0].timeline_end <= pair[1].timeline_start + 1e-9);
    }
    assert!((spans[4].timeline_end - 30.0).abs() < 0.11);

    let schedule = Schedule::new(TemplateKind::NewsSequence, &config().timing, 10);
    let switches: Vec<u64> = schedule
        .frames()
        .collect::<Vec<_>>()
        .windows(2)
        .filter(|pair| pair[0].active_clip != pair[1].active_clip && pair[1].active_clip.is_some())
        .map(|pair| pair[1].frame)
        .collect();
    assert_eq!(switches, vec![60, 120, 180, 240]);
}

#[test]
fn empty_ticker_keeps_its_window() {
    let timing = config().timing;
    let full = Schedule::new(TemplateKind::NewsSequence, &timing, 10);
    let labels = Labels {
        country: "chile".to_owned(),
        date: "12 march".to_owned(),
        tickers: vec!["first".to_owned(), String::new(), "third".to_owned()],
        ..Labels::default()
    };
    let request = request(TemplateKind::NewsSequence, labels);
    assert_eq!(request.ticker(1), None);

    let slots = full.tickers();
    assert_eq!(slots.len(), 3);
    let width = slots[0].duration();
    for slot in slots {
        assert!((slot.duration() - width).abs() < 1e-9);
    }
    let middle = slots[1].start + slots[1].duration() / 2.0;
    assert_eq!(full.active_ticker_at(middle).map(|ticker| ticker.index), Some(1));

    let outcome = render(&request, Box::new(|_, _| None));
    assert_eq!(outcome.frames, 350);
}

#[test]
fn identical_inputs_render_identical_frames() {
    let config = config();
    let request = request(TemplateKind::Grid4, Labels::default());
    let draw = |frame: u64| {
        let painter = TextPainter::headless();
        let layout = select_layout(&request, &config, &painter);
        let mut compositor = Compositor::new(layout, painter, None, &config.branding, WIDTH, HEIGHT);
        let state = compositor.schedule().frame_state(frame);
        let clips: Vec<_> = (0..4).map(|index| Some(Arc::clone(&SolidClip::new(index).frame))).collect();
        let mut surface = Pixmap::new(WIDTH, HEIGHT).unwrap();
        compositor.draw_frame(&state, &clips, &mut surface);
        surface.data().to_vec()
    };
    assert_eq!(draw(42), draw(42));
    assert_ne!(draw(42), draw(245));
}

#[test]
fn offline_renders_repeat_the_same_schedule() {
    for job in [
        request(TemplateKind::NewsSequence, news_labels()),
        request(TemplateKind::Grid4, Labels::default()),
    ] {
        let (first, first_outcome) = record(&job);
        let (second, second_outcome) = record(&job);
        assert_eq!(first.len() as u64, first_outcome.frames);
        assert_eq!(first, second);
        assert_eq!(first_outcome.spans, second_outcome.spans);

        for pair in first.windows(2) {
            assert_eq!(pair[1].frame, pair[0].frame + 1);
            assert!(pair[1].t > pair[0].t);
        }
        for record in &first {
            let expected: Vec<usize> = match (record.phase, job.template) {
                (Phase::Cta, _) => Vec::new(),
                (_, TemplateKind::Grid4) => (0..4).collect(),
                (_, TemplateKind::NewsSequence) => record.active_clip.into_iter().collect(),
            };
            assert_eq!(record.polled, expected, "frame {}", record.frame);
        }
    }
}

#[test]
fn clip_trims_leave_the_schedule_unchanged() {
    let plain = request(TemplateKind::NewsSequence, news_labels());
    let mut trimmed = plain.clone();
    for (index, clip) in trimmed.clips.iter_mut().enumerate() {
        clip.trim_start = 0.5 + index as f64 * 0.25;
    }

    let config = config();
    let painter = TextPainter::headless();
    assert_eq!(
        select_layout(&plain, &config, &painter).schedule(),
        select_layout(&trimmed, &config, &painter).schedule()
    );

    let (plain_frames, plain_outcome) = record(&plain);
    let (trimmed_frames, trimmed_outcome) = record(&trimmed);
    assert_eq!(plain_frames, trimmed_frames);
    let windows = |outcome: &DriverOutcome| -> Vec<(usize, f64, f64)> {
        outcome
            .spans
            .iter()
            .map(|span| (span.clip, span.timeline_start, span.timeline_end))
            .collect()
    };
    assert_eq!(windows(&plain_outcome), windows(&trimmed_outcome));
    assert_ne!(
        plain_outcome.spans.first().map(|span| span.source_start),
        trimmed_outcome.spans.first().map(|span| span.source_start)
    );
}
