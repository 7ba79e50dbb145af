use std::sync::Arc;

use crate::casing::{capitalize_first, format_date, title_case};
use crate::compositor::{
    draw_caption, draw_cover, fill_bottom_fade, fill_circle, fill_rect, layout_caption, Canvas,
    CaptionLayout, ACCENT_RED, LIVE_RED, WHITE,
};
use crate::config::RenderConfig;
use crate::decoding::VideoFrame;
use crate::request::{RenderRequest, TemplateKind};
use crate::text::{FontFace, HAlign, TextMeasure, TextShadow, TextStyle, VAlign};
use crate::timeline::{FrameState, Schedule};

pub trait TemplateLayout: Send {
    fn kind(&self) -> TemplateKind;

    fn schedule(&self) -> &Schedule;

    fn draw_content_frame(
        &self,
        canvas: &mut Canvas<'_>,
        state: &FrameState,
        clips: &[Option<Arc<VideoFrame>>],
    );

    fn draw_header(&self, _canvas: &mut Canvas<'_>, _state: &FrameState) {}
}

pub fn select_layout<M: TextMeasure + ?Sized>(
    request: &RenderRequest,
    config: &RenderConfig,
    measure: &M,
) -> Box<dyn TemplateLayout> {
    let schedule = Schedule::new(request.template, &config.timing, config.canvas.fps);
    match request.template {
        TemplateKind::Grid4 => Box::new(Grid4Layout::new(schedule, request)),
        TemplateKind::NewsSequence => Box::new(NewsLayout::new(
            schedule,
            request,
            measure,
            config.canvas.width as f32,
            config.canvas.height as f32,
        )),
    }
}

pub const GRID_DIVIDER_WIDTH: f32 = 15.0;
pub const GRID_LABEL_OFFSET: f32 = 120.0;
pub const GRID_LABEL_SIZE: f32 = 36.0;
pub const GRID_DATE_STRIP_HEIGHT: f32 = 120.0;
pub const GRID_DATE_SIZE: f32 = 65.0;

pub struct Grid4Layout {
    schedule: Schedule,
    countries: Vec<String>,
    date: String,
}

impl Grid4Layout {
    pub fn new(schedule: Schedule, request: &RenderRequest) -> Self {
        Self {
            schedule,
            countries: request
                .labels
                .countries
                .iter()
                .map(|label| title_case(label.trim()))
                .collect(),
            date: format_date(request.labels.date.trim()),
        }
    }

    pub fn quadrants(width: f32, height: f32) -> [(f32, f32, f32, f32); 4] {
        let (mid_x, mid_y) = (width / 2.0, height / 2.0);
        [
            (0.0, 0.0, mid_x, mid_y),
            (mid_x, 0.0, mid_x, mid_y),
            (0.0, mid_y, mid_x, mid_y),
            (mid_x, mid_y, mid_x, mid_y),
        ]
    }

    pub fn label_anchors(width: f32, height: f32) -> [(f32, f32); 4] {
        let (mid_x, mid_y) = (width / 2.0, height / 2.0);
        [
            (mid_x / 2.0, mid_y - GRID_LABEL_OFFSET),
            (mid_x + mid_x / 2.0, mid_y - GRID_LABEL_OFFSET),
            (mid_x / 2.0, mid_y + GRID_LABEL_OFFSET),
            (mid_x + mid_x / 2.0, mid_y + GRID_LABEL_OFFSET),
        ]
    }
}

impl TemplateLayout for Grid4Layout {
    fn kind(&self) -> TemplateKind {
        TemplateKind::Grid4
    }

    fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    fn draw_content_frame(
        &self,
        canvas: &mut Canvas<'_>,
        _state: &FrameState,
        clips: &[Option<Arc<VideoFrame>>],
    ) {
        let (width, height) = (canvas.width(), canvas.height());
        for (quadrant, clip) in Self::quadrants(width, height).iter().zip(clips) {
            if let Some(frame) = clip {
                let (x, y, w, h) = *quadrant;
                draw_cover(canvas.surface, &frame.pixmap, x, y, w, h);
            }
        }

        let (mid_x, mid_y) = (width / 2.0, height / 2.0);
        let half = GRID_DIVIDER_WIDTH / 2.0;
        fill_rect(canvas.surface, 0.0, mid_y - half, width, GRID_DIVIDER_WIDTH, ACCENT_RED);
        fill_rect(canvas.surface, mid_x - half, 0.0, GRID_DIVIDER_WIDTH, height, ACCENT_RED);

        let label_style = TextStyle {
            size: GRID_LABEL_SIZE,
            face: FontFace::Display,
            color: WHITE,
            halign: HAlign::Center,
            valign: VAlign::Middle,
        };
        let label_shadow = TextShadow {
            offset_y: 4.0,
            spread: 6.0,
            alpha: 0.8,
        };
        for (label, (x, y)) in self.countries.iter().zip(Self::label_anchors(width, height)) {
            if !label.is_empty() {
                canvas
                    .text
                    .draw_shadowed(canvas.surface, label, x, y, label_style, label_shadow);
            }
        }

        if !self.date.is_empty() {
            fill_rect(
                canvas.surface,
                0.0,
                mid_y - GRID_DATE_STRIP_HEIGHT / 2.0,
                width,
                GRID_DATE_STRIP_HEIGHT,
                ACCENT_RED,
            );
            canvas.text.draw_shadowed(
                canvas.surface,
                &self.date,
                mid_x,
                mid_y + 5.0,
                TextStyle {
                    size: GRID_DATE_SIZE,
                    ..label_style
                },
                TextShadow {
                    offset_y: 5.0,
                    spread: 8.0,
                    alpha: 0.8,
                },
            );
        }
    }
}

pub const NEWS_FADE_HEIGHT: f32 = 800.0;
pub const NEWS_FADE_ALPHA: f32 = 0.7;
pub const LIVE_BADGE_WIDTH: f32 = 160.0;
pub const LIVE_BADGE_HEIGHT: f32 = 50.0;
pub const LIVE_BADGE_TOP: f32 = 160.0;
pub const LIVE_BADGE_RIGHT_INSET: f32 = 40.0;
pub const HEADER_BOX_HEIGHT: f32 = 170.0;
pub const HEADER_COUNTRY_SIZE: f32 = 90.0;
pub const HEADER_COUNTRY_MIN_SIZE: f32 = 40.0;
pub const HEADER_DATE_SIZE: f32 = 60.0;

#[derive(Debug, Clone, PartialEq)]
pub struct HeaderBadge {
    pub country: String,
    pub country_size: f32,
    pub date: String,
    pub box_x: f32,
    pub box_y: f32,
    pub box_width: f32,
}

impl HeaderBadge {
    pub fn layout<M: TextMeasure + ?Sized>(
        measure: &M,
        country: &str,
        date: &str,
        width: f32,
        height: f32,
    ) -> Self {
        let country = country.trim().to_uppercase();
        let mut country_size = HEADER_COUNTRY_SIZE;
        let mut country_width = 0.0;
        if !country.is_empty() {
            let max_width = width - 100.0;
            country_width = measure.measure(&country, country_size, FontFace::Display);
            while country_width + 80.0 > max_width && country_size > HEADER_COUNTRY_MIN_SIZE {
                country_size -= 5.0;
                country_width = measure.measure(&country, country_size, FontFace::Display);
            }
        }
        let date = date.trim().to_owned();
        let date_width = if date.is_empty() {
            0.0
        } else {
            measure.measure(&date, HEADER_DATE_SIZE, FontFace::Display)
        };
        let box_width = country_width.max(date_width) + 120.0;
        Self {
            country,
            country_size,
            date,
            box_x: width / 2.0 - box_width / 2.0,
            box_y: height / 2.0 - HEADER_BOX_HEIGHT / 2.0,
            box_width,
        }
    }
}

pub struct NewsLayout {
    schedule: Schedule,
    captions: Vec<Option<CaptionLayout>>,
    header: HeaderBadge,
}

impl NewsLayout {
    pub fn new<M: TextMeasure + ?Sized>(
        schedule: Schedule,
        request: &RenderRequest,
        measure: &M,
        width: f32,
        height: f32,
    ) -> Self {
        let captions = (0..schedule.tickers().len())
            .map(|slot| {
                request
                    .ticker(slot)
                    .and_then(|text| layout_caption(measure, &capitalize_first(text), width, height))
            })
            .collect();
        let header = HeaderBadge::layout(
            measure,
            &request.labels.country,
            &request.labels.date,
            width,
            height,
        );
        Self {
            schedule,
            captions,
            header,
        }
    }

    pub fn caption(&self, slot: usize) -> Option<&CaptionLayout> {
        self.captions.get(slot).and_then(Option::as_ref)
    }

    pub fn header(&self) -> &HeaderBadge {
        &self.header
    }

    fn draw_live_badge(&self, canvas: &mut Canvas<'_>, dot_visible: bool) {
        let x = canvas.width() - LIVE_BADGE_RIGHT_INSET - LIVE_BADGE_WIDTH;
        let y = LIVE_BADGE_TOP;
        fill_rect(canvas.surface, x, y, LIVE_BADGE_WIDTH, LIVE_BADGE_HEIGHT, LIVE_RED);
        if dot_visible {
            fill_circle(canvas.surface, x + 30.0, y + 25.0, 8.0, WHITE);
        }
        canvas.text.draw(
            canvas.surface,
            "LIVE",
            x + 60.0,
            y + 26.0,
            TextStyle {
                size: 30.0,
                face: FontFace::Body,
                color: WHITE,
                halign: HAlign::Left,
                valign: VAlign::Middle,
            },
        );
    }
}

impl TemplateLayout for NewsLayout {
    fn kind(&self) -> TemplateKind {
        TemplateKind::NewsSequence
    }

    fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    fn draw_content_frame(
        &self,
        canvas: &mut Canvas<'_>,
        state: &FrameState,
        clips: &[Option<Arc<VideoFrame>>],
    ) {
        let (width, height) = (canvas.width(), canvas.height());
        if let Some(frame) = state
            .active_clip
            .and_then(|index| clips.get(index))
            .and_then(Option::as_ref)
        {
            draw_cover(canvas.surface, &frame.pixmap, 0.0, 0.0, width, height);
        }

        fill_bottom_fade(canvas.surface, height - NEWS_FADE_HEIGHT, height, NEWS_FADE_ALPHA);
        self.draw_live_badge(canvas, state.live_dot_visible);

        if let Some(ticker) = state.ticker {
            if let Some(caption) = self.caption(ticker.index) {
                draw_caption(canvas, caption, ticker.alpha, None);
            }
        }
    }

    fn draw_header(&self, canvas: &mut Canvas<'_>, _state: &FrameState) {
        let badge = &self.header;
        let center_x = canvas.width() / 2.0;
        fill_rect(
            canvas.surface,
            badge.box_x,
            badge.box_y,
            badge.box_width,
            HEADER_BOX_HEIGHT,
            WHITE,
        );
        if !badge.date.is_empty() {
            canvas.text.draw(
                canvas.surface,
                &badge.date,
                center_x,
                badge.box_y + 12.0,
                TextStyle {
                    size: HEADER_DATE_SIZE,
                    face: FontFace::Display,
                    color: crate::compositor::BLACK,
                    halign: HAlign::Center,
                    valign: VAlign::Top,
                },
            );
        }
        if !badge.country.is_empty() {
            canvas.text.draw(
                canvas.surface,
                &badge.country,
                center_x,
                badge.box_y + HEADER_BOX_HEIGHT - 12.0,
                TextStyle {
                    size: badge.country_size,
                    face: FontFace::Display,
                    color: ACCENT_RED,
                    halign: HAlign::Center,
                    valign: VAlign::Bottom,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tiny_skia::{Color, Pixmap};

    use super::*;
    use crate::compositor::Compositor;
    use crate::request::{ClipRef, Labels};
    use crate::text::tests::HalfEm;
    use crate::text::TextPainter;
    use crate::timeline::Phase;

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

    fn solid_frame(r: u8, g: u8, b: u8) -> Option<Arc<VideoFrame>> {
        let mut pixmap = Pixmap::new(32, 18).unwrap();
        pixmap.fill(Color::from_rgba8(r, g, b, 255));
        Some(Arc::new(VideoFrame { pts: 0.0, pixmap }))
    }

    fn compositor(template: TemplateKind, labels: Labels) -> Compositor {
        let config = RenderConfig::default();
        let request = request(template, labels);
        let layout = select_layout(&request, &config, &HalfEm);
        Compositor::new(
            layout,
            TextPainter::headless(),
            None,
            &config.branding,
            1080,
            1920,
        )
    }

    fn rgb(surface: &Pixmap, x: u32, y: u32) -> (u8, u8, u8) {
        let px = surface.pixel(x, y).unwrap();
        (px.red(), px.green(), px.blue())
    }

    #[test]
    fn grid_draws_four_quadrants_and_divider() {
        let mut compositor = compositor(TemplateKind::Grid4, Labels::default());
        let clips = vec![
            solid_frame(10, 0, 0),
            solid_frame(0, 20, 0),
            solid_frame(0, 0, 30),
            solid_frame(40, 40, 0),
        ];
        let state = compositor.schedule().frame_state(0);
        let mut surface = Pixmap::new(1080, 1920).unwrap();
        compositor.draw_frame(&state, &clips, &mut surface);

        assert_eq!(rgb(&surface, 100, 100), (10, 0, 0));
        assert_eq!(rgb(&surface, 900, 100), (0, 20, 0));
        assert_eq!(rgb(&surface, 100, 1800), (0, 0, 30));
        assert_eq!(rgb(&surface, 900, 1800), (40, 40, 0));
        assert_eq!(rgb(&surface, 540, 100), (255, 0, 0));
        assert_eq!(rgb(&surface, 100, 960), (255, 0, 0));
    }

    #[test]
    fn grid_missing_clip_leaves_quadrant_black() {
        let mut compositor = compositor(TemplateKind::Grid4, Labels::default());
        let clips = vec![solid_frame(10, 0, 0), None, None, None];
        let state = compositor.schedule().frame_state(30);
        let mut surface = Pixmap::new(1080, 1920).unwrap();
        compositor.draw_frame(&state, &clips, &mut surface);
        assert_eq!(rgb(&surface, 900, 100), (0, 0, 0));
        assert_eq!(rgb(&surface, 540, 1800), (255, 0, 0));
    }

    #[test]
    fn grid_date_strip_spans_width() {
        let labels = Labels {
            date: "12 МАРТА".to_owned(),
            ..Labels::default()
        };
        let mut compositor = compositor(TemplateKind::Grid4, labels);
        let clips = vec![None, None, None, None];
        let state = compositor.schedule().frame_state(0);
        let mut surface = Pixmap::new(1080, 1920).unwrap();
        compositor.draw_frame(&state, &clips, &mut surface);
        assert_eq!(rgb(&surface, 5, 960 - 55), (255, 0, 0));
        assert_eq!(rgb(&surface, 1075, 960 + 55), (255, 0, 0));
        assert_eq!(rgb(&surface, 5, 960 - 70), (0, 0, 0));
    }

    fn news_labels(tickers: [&str; 3]) -> Labels {
        Labels {
            country: "Chile".to_owned(),
            date: "12 March".to_owned(),
            tickers: tickers.iter().map(|t| t.to_string()).collect(),
            ..Labels::default()
        }
    }

    #[test]
    fn news_header_badge_is_centered() {
        let badge = HeaderBadge::layout(&HalfEm, "Chile", "12 March", 1080.0, 1920.0);
        assert_eq!(badge.country, "CHILE");
        assert_eq!(badge.country_size, 90.0);
        assert_eq!(badge.box_width, 8.0 * 30.0 + 120.0);
        assert_eq!(badge.box_x + badge.box_width / 2.0, 540.0);
        assert_eq!(badge.box_y, 960.0 - 85.0);
    }

    #[test]
    fn long_country_shrinks_to_fit() {
        let badge = HeaderBadge::layout(
            &HalfEm,
            "Saint Vincent and the Grenadines",
            "",
            1080.0,
            1920.0,
        );
        assert!(badge.country_size < 90.0);
        assert!(badge.country_size >= 40.0);
    }

    #[test]
    fn news_header_phase_draws_badge_over_clip() {
        let mut compositor = compositor(TemplateKind::NewsSequence, news_labels(["a", "b", "c"]));
        let clips = vec![solid_frame(0, 0, 200), None, None, None, None];
        let state = compositor.schedule().frame_state(0);
        assert_eq!(state.phase, Phase::Header);
        let mut surface = Pixmap::new(1080, 1920).unwrap();
        compositor.draw_frame(&state, &clips, &mut surface);
        assert_eq!(rgb(&surface, 540, 960), (255, 255, 255));
        assert_eq!(rgb(&surface, 540, 100), (0, 0, 200));
        // live badge, away from the dot and label
        assert_eq!(rgb(&surface, 1080 - 40 - 5, 165), (204, 0, 0));
    }

    #[test]
    fn empty_ticker_slot_draws_no_caption() {
        let mut compositor =
            compositor(TemplateKind::NewsSequence, news_labels(["first", "", "third"]));
        let clips = vec![None, None, solid_frame(0, 0, 0), None, None];
        let schedule = compositor.schedule().clone();
        let slot = schedule.tickers()[1];
        let t = slot.start + slot.duration() / 2.0;
        let state = schedule.state_at(0, t);
        assert_eq!(state.ticker.map(|ticker| ticker.index), Some(1));

        let mut surface = Pixmap::new(1080, 1920).unwrap();
        compositor.draw_frame(&state, &clips, &mut surface);
        let caption_row = 1920 - 400 - 10;
        assert!((160..700).all(|x| rgb(&surface, x, caption_row).0 < 200));

        let slot0 = schedule.tickers()[0];
        let state = schedule.state_at(0, slot0.start + slot0.duration() / 2.0);
        compositor.draw_frame(&state, &clips, &mut surface);
        assert_eq!(rgb(&surface, 160 + 50 + 12 + 4, caption_row), (255, 255, 255));
    }

    #[test]
    fn cta_phase_uses_dark_background() {
        let mut compositor = compositor(TemplateKind::Grid4, Labels::default());
        let clips = vec![solid_frame(10, 0, 0), None, None, None];
        let state = compositor.schedule().frame_state(compositor.schedule().frame_count() - 1);
        assert_eq!(state.phase, Phase::Cta);
        let mut surface = Pixmap::new(1080, 1920).unwrap();
        compositor.draw_frame(&state, &clips, &mut surface);
        assert_eq!(rgb(&surface, 20, 20), (15, 15, 18));
    }
}
