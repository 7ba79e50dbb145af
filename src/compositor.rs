use std::ops::Range;
use std::sync::Arc;

use tiny_skia::{
    Color, ColorU8, FillRule, FilterQuality, GradientStop, LinearGradient, Mask, Paint, Path,
    PathBuilder, Pattern, Pixmap, PixmapPaint, Point, RadialGradient, Rect, SpreadMode, Stroke,
    Transform,
};

use crate::config::BrandingConfig;
use crate::decoding::VideoFrame;
use crate::templates::TemplateLayout;
use crate::text::{fit_lines, FitRule, FontFace, HAlign, TextMeasure, TextPainter, TextStyle, VAlign};
use crate::timeline::{FrameState, Phase, Schedule};

pub const BLACK: ColorU8 = ColorU8::from_rgba(0, 0, 0, 255);
pub const WHITE: ColorU8 = ColorU8::from_rgba(255, 255, 255, 255);
pub const ACCENT_RED: ColorU8 = ColorU8::from_rgba(255, 0, 0, 255);
pub const LIVE_RED: ColorU8 = ColorU8::from_rgba(204, 0, 0, 255);
pub const QUOTE_GREEN: ColorU8 = ColorU8::from_rgba(74, 222, 128, 255);
pub const CTA_BACKGROUND: ColorU8 = ColorU8::from_rgba(15, 15, 18, 255);

pub const MIN_CAPTION_ALPHA: f32 = 0.01;

pub struct Canvas<'a> {
    pub surface: &'a mut Pixmap,
    pub text: &'a mut TextPainter,
}

impl Canvas<'_> {
    pub fn width(&self) -> f32 {
        self.surface.width() as f32
    }

    pub fn height(&self) -> f32 {
        self.surface.height() as f32
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceCrop {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

pub fn cover_fit(src_width: f32, src_height: f32, dst_width: f32, dst_height: f32) -> SourceCrop {
    let src_ratio = src_width / src_height;
    let dst_ratio = dst_width / dst_height;
    if src_ratio > dst_ratio {
        let width = src_height * dst_ratio;
        SourceCrop {
            x: (src_width - width) / 2.0,
            y: 0.0,
            width,
            height: src_height,
        }
    } else {
        let height = src_width / dst_ratio;
        SourceCrop {
            x: 0.0,
            y: (src_height - height) / 2.0,
            width: src_width,
            height,
        }
    }
}

pub fn solid(color: ColorU8) -> Paint<'static> {
    let mut paint = Paint::default();
    paint.set_color_rgba8(color.red(), color.green(), color.blue(), color.alpha());
    paint.anti_alias = true;
    paint
}

pub fn with_alpha(color: ColorU8, alpha: f32) -> ColorU8 {
    let scaled = (f32::from(color.alpha()) * alpha.clamp(0.0, 1.0)).round() as u8;
    ColorU8::from_rgba(color.red(), color.green(), color.blue(), scaled)
}

pub fn draw_cover(surface: &mut Pixmap, frame: &Pixmap, x: f32, y: f32, width: f32, height: f32) {
    let Some(target) = Rect::from_xywh(x, y, width, height) else {
        return;
    };
    if frame.width() == 0 || frame.height() == 0 {
        return;
    }
    let crop = cover_fit(frame.width() as f32, frame.height() as f32, width, height);
    let scale = width / crop.width;
    let pattern_transform =
        Transform::from_row(scale, 0.0, 0.0, scale, x - crop.x * scale, y - crop.y * scale);
    let paint = Paint {
        shader: Pattern::new(
            frame.as_ref(),
            SpreadMode::Pad,
            FilterQuality::Bilinear,
            1.0,
            pattern_transform,
        ),
        anti_alias: false,
        ..Paint::default()
    };
    surface.fill_rect(target, &paint, Transform::identity(), None);
}

pub fn fill_rect(surface: &mut Pixmap, x: f32, y: f32, width: f32, height: f32, color: ColorU8) {
    if let Some(rect) = Rect::from_xywh(x, y, width, height) {
        surface.fill_rect(rect, &solid(color), Transform::identity(), None);
    }
}

pub fn fill_circle(surface: &mut Pixmap, cx: f32, cy: f32, radius: f32, color: ColorU8) {
    if let Some(path) = PathBuilder::from_circle(cx, cy, radius) {
        surface.fill_path(&path, &solid(color), FillRule::Winding, Transform::identity(), None);
    }
}

pub fn round_rect_path(x: f32, y: f32, width: f32, height: f32, radius: f32) -> Option<Path> {
    let r = radius.min(width / 2.0).min(height / 2.0).max(0.0);
    let mut pb = PathBuilder::new();
    pb.move_to(x + r, y);
    pb.line_to(x + width - r, y);
    pb.quad_to(x + width, y, x + width, y + r);
    pb.line_to(x + width, y + height - r);
    pb.quad_to(x + width, y + height, x + width - r, y + height);
    pb.line_to(x + r, y + height);
    pb.quad_to(x, y + height, x, y + height - r);
    pb.line_to(x, y + r);
    pb.quad_to(x, y, x + r, y);
    pb.close();
    pb.finish()
}

pub fn fill_bottom_fade(surface: &mut Pixmap, top: f32, bottom: f32, bottom_alpha: f32) {
    let width = surface.width() as f32;
    let Some(rect) = Rect::from_xywh(0.0, top, width, bottom - top) else {
        return;
    };
    let Some(shader) = LinearGradient::new(
        Point::from_xy(0.0, top),
        Point::from_xy(0.0, bottom),
        vec![
            GradientStop::new(0.0, Color::from_rgba8(0, 0, 0, 0)),
            GradientStop::new(1.0, Color::from_rgba8(0, 0, 0, (bottom_alpha * 255.0).round() as u8)),
        ],
        SpreadMode::Pad,
        Transform::identity(),
    ) else {
        return;
    };
    let paint = Paint {
        shader,
        ..Paint::default()
    };
    surface.fill_rect(rect, &paint, Transform::identity(), None);
}

pub fn draw_soft_shadow(
    surface: &mut Pixmap,
    rect: (f32, f32, f32, f32),
    radius: f32,
    offset_y: f32,
    blur: f32,
    alpha: f32,
) {
    const LAYERS: usize = 6;
    let (x, y, width, height) = rect;
    let layer_alpha = alpha / LAYERS as f32;
    for layer in 0..LAYERS {
        let spread = blur * (LAYERS - layer) as f32 / LAYERS as f32;
        if let Some(path) = round_rect_path(
            x - spread / 2.0,
            y + offset_y - spread / 2.0,
            width + spread,
            height + spread,
            radius + spread / 2.0,
        ) {
            surface.fill_path(
                &path,
                &solid(with_alpha(BLACK, layer_alpha)),
                FillRule::Winding,
                Transform::identity(),
                None,
            );
        }
    }
}

pub const CAPTION_SAFE_BOTTOM_INSET: f32 = 400.0;
pub const CAPTION_MARGIN_X: f32 = 160.0;
pub const CAPTION_QUOTE_SIZE: f32 = 50.0;
pub const CAPTION_FONT_SIZE: f32 = 32.0;
pub const CAPTION_MIN_FONT_SIZE: f32 = 20.0;
pub const CAPTION_FONT_STEP: f32 = 2.0;
pub const CAPTION_MAX_LINES: usize = 10;
pub const CAPTION_LINE_GAP: f32 = 2.0;

#[derive(Debug, Clone, PartialEq)]
pub struct CaptionLine {
    pub text: String,
    pub x: f32,
    pub y: f32,
    pub box_width: f32,
    pub first_word: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptionLayout {
    pub size: f32,
    pub box_height: f32,
    pub icon_x: f32,
    pub icon_y: f32,
    pub lines: Vec<CaptionLine>,
}

impl CaptionLayout {
    pub fn bounds(&self) -> (f32, f32, f32, f32) {
        let left = self.icon_x.floor();
        let top = self
            .lines
            .first()
            .map(|line| line.y)
            .unwrap_or(self.icon_y)
            .min(self.icon_y)
            .floor();
        let right = self
            .lines
            .iter()
            .map(|line| line.x + line.box_width)
            .fold(self.icon_x + CAPTION_QUOTE_SIZE, f32::max)
            .ceil();
        let bottom = self
            .lines
            .last()
            .map(|line| line.y + self.box_height)
            .unwrap_or(0.0)
            .max(self.icon_y + CAPTION_QUOTE_SIZE)
            .ceil();
        (left, top, right - left, bottom - top)
    }
}

pub fn layout_caption<M: TextMeasure + ?Sized>(
    measure: &M,
    text: &str,
    canvas_width: f32,
    canvas_height: f32,
) -> Option<CaptionLayout> {
    if text.trim().is_empty() {
        return None;
    }
    let rule = FitRule {
        start_size: CAPTION_FONT_SIZE,
        min_size: CAPTION_MIN_FONT_SIZE,
        step: CAPTION_FONT_STEP,
        max_lines: CAPTION_MAX_LINES,
        max_width: canvas_width - CAPTION_MARGIN_X * 2.0 - CAPTION_QUOTE_SIZE - 40.0,
    };
    let fitted = fit_lines(measure, text, FontFace::Body, rule);
    let box_height = fitted.size + 4.0;
    let count = fitted.lines.len() as f32;
    let total_height = count * box_height + (count - 1.0).max(0.0) * CAPTION_LINE_GAP;
    let start_y = canvas_height - CAPTION_SAFE_BOTTOM_INSET - total_height;
    let text_x = CAPTION_MARGIN_X + CAPTION_QUOTE_SIZE + 12.0;

    let mut first_word = 0;
    let lines = fitted
        .lines
        .into_iter()
        .enumerate()
        .map(|(index, line)| {
            let words = line.split_whitespace().count();
            let laid = CaptionLine {
                box_width: measure.measure(&line, fitted.size, FontFace::Body) + 20.0,
                x: text_x,
                y: start_y + index as f32 * (box_height + CAPTION_LINE_GAP),
                text: line,
                first_word,
            };
            first_word += words;
            laid
        })
        .collect();

    Some(CaptionLayout {
        size: fitted.size,
        box_height,
        icon_x: CAPTION_MARGIN_X,
        icon_y: start_y,
        lines,
    })
}

pub fn highlight_range(text: &str, phrase: &str) -> Option<Range<usize>> {
    let needle: Vec<String> = phrase.split_whitespace().map(str::to_lowercase).collect();
    if needle.is_empty() {
        return None;
    }
    let words: Vec<String> = text.split_whitespace().map(str::to_lowercase).collect();
    words
        .windows(needle.len())
        .position(|window| window == needle.as_slice())
        .map(|start| start..start + needle.len())
}

pub fn draw_caption(
    canvas: &mut Canvas<'_>,
    layout: &CaptionLayout,
    alpha: f32,
    highlight: Option<&Range<usize>>,
) {
    if alpha <= MIN_CAPTION_ALPHA {
        return;
    }
    if alpha >= 0.999 {
        paint_caption(canvas.surface, canvas.text, layout, highlight, (0.0, 0.0));
        return;
    }
    let (x, y, width, height) = layout.bounds();
    let Some(mut layer) = Pixmap::new(width.max(1.0) as u32, height.max(1.0) as u32) else {
        return;
    };
    paint_caption(&mut layer, canvas.text, layout, highlight, (x, y));
    canvas.surface.draw_pixmap(
        x as i32,
        y as i32,
        layer.as_ref(),
        &PixmapPaint {
            opacity: alpha,
            ..PixmapPaint::default()
        },
        Transform::identity(),
        None,
    );
}

fn paint_caption(
    target: &mut Pixmap,
    text: &mut TextPainter,
    layout: &CaptionLayout,
    highlight: Option<&Range<usize>>,
    origin: (f32, f32),
) {
    let (ox, oy) = origin;
    let icon_x = layout.icon_x - ox;
    let icon_y = layout.icon_y - oy;
    fill_rect(target, icon_x, icon_y, CAPTION_QUOTE_SIZE, CAPTION_QUOTE_SIZE, QUOTE_GREEN);
    text.draw(
        target,
        "\u{201C}",
        icon_x + CAPTION_QUOTE_SIZE / 2.0,
        icon_y + CAPTION_QUOTE_SIZE / 2.0 + 10.0,
        TextStyle {
            size: CAPTION_QUOTE_SIZE,
            face: FontFace::Body,
            color: WHITE,
            halign: HAlign::Center,
            valign: VAlign::Middle,
        },
    );

    for line in &layout.lines {
        let x = line.x - ox;
        let y = line.y - oy;
        fill_rect(target, x, y, line.box_width, layout.box_height, WHITE);
        let mut pen = x + 10.0;
        for (run, highlighted) in line_runs(line, highlight) {
            let style = TextStyle {
                size: layout.size,
                face: FontFace::Body,
                color: if highlighted { ACCENT_RED } else { BLACK },
                halign: HAlign::Left,
                valign: VAlign::Top,
            };
            text.draw(target, &run, pen, y + 2.0, style);
            pen += text.measure(&run, layout.size, FontFace::Body);
        }
    }
}

fn line_runs(line: &CaptionLine, highlight: Option<&Range<usize>>) -> Vec<(String, bool)> {
    let mut runs: Vec<(String, bool)> = Vec::new();
    for (offset, word) in line.text.split_whitespace().enumerate() {
        let lit = highlight.is_some_and(|range| range.contains(&(line.first_word + offset)));
        match runs.last_mut() {
            Some((run, state)) if *state == lit => {
                run.push(' ');
                run.push_str(word);
            }
            Some((run, _)) => {
                run.push(' ');
                runs.push((word.to_owned(), lit));
            }
            None => runs.push((word.to_owned(), lit)),
        }
    }
    runs
}

pub struct CtaScene {
    image: Option<Pixmap>,
    image_mask: Option<Mask>,
    image_rect: (f32, f32, f32, f32),
    caption: Option<CaptionLayout>,
    highlight: Option<Range<usize>>,
    logo_lines: Vec<String>,
}

pub const CTA_IMAGE_WIDTH: f32 = 700.0;
pub const CTA_IMAGE_TOP: f32 = 300.0;
pub const CTA_IMAGE_RADIUS: f32 = 30.0;

impl CtaScene {
    pub fn new<M: TextMeasure + ?Sized>(
        measure: &M,
        width: u32,
        height: u32,
        image: Option<Pixmap>,
        branding: &BrandingConfig,
    ) -> Self {
        let canvas_width = width as f32;
        let canvas_height = height as f32;
        let image_x = (canvas_width - CTA_IMAGE_WIDTH) / 2.0;
        let image_rect = match &image {
            Some(image) if image.width() > 0 => {
                let ratio = image.width() as f32 / image.height() as f32;
                (image_x, CTA_IMAGE_TOP, CTA_IMAGE_WIDTH, CTA_IMAGE_WIDTH / ratio)
            }
            _ => (image_x, canvas_height / 2.0 - 400.0, CTA_IMAGE_WIDTH, 600.0),
        };
        let image_mask = image.as_ref().and_then(|_| {
            let (x, y, w, h) = image_rect;
            let path = round_rect_path(x, y, w, h, CTA_IMAGE_RADIUS)?;
            let mut mask = Mask::new(width, height)?;
            mask.fill_path(&path, FillRule::Winding, true, Transform::identity());
            Some(mask)
        });
        let caption = layout_caption(measure, &branding.cta_caption, canvas_width, canvas_height);
        let highlight = highlight_range(&branding.cta_caption, &branding.cta_highlight);
        Self {
            image,
            image_mask,
            image_rect,
            caption,
            highlight,
            logo_lines: branding.logo_lines.iter().take(2).cloned().collect(),
        }
    }

    pub fn has_image(&self) -> bool {
        self.image.is_some()
    }

    pub fn draw(&self, canvas: &mut Canvas<'_>, frame: u64) {
        let width = canvas.width();
        let height = canvas.height();
        fill_rect(canvas.surface, 0.0, 0.0, width, height, CTA_BACKGROUND);

        let (x, y, w, h) = self.image_rect;
        if let Some(image) = &self.image {
            draw_soft_shadow(canvas.surface, self.image_rect, CTA_IMAGE_RADIUS, 20.0, 30.0, 0.5);
            if let Some(target) = Rect::from_xywh(x, y, w, h) {
                let scale = w / image.width() as f32;
                let paint = Paint {
                    shader: Pattern::new(
                        image.as_ref(),
                        SpreadMode::Pad,
                        FilterQuality::Bilinear,
                        1.0,
                        Transform::from_row(scale, 0.0, 0.0, scale, x, y),
                    ),
                    anti_alias: true,
                    ..Paint::default()
                };
                canvas
                    .surface
                    .fill_rect(target, &paint, Transform::identity(), self.image_mask.as_ref());
            }
        }

        if let Some(caption) = &self.caption {
            draw_caption(canvas, caption, 1.0, self.highlight.as_ref());
        }

        if !self.logo_lines.is_empty() {
            draw_logo(canvas, width - 220.0, height - 220.0, 180.0, &self.logo_lines);
        }

        let offset = hand_offset(frame);
        draw_hand_cursor(canvas.surface, x + w + 20.0 - offset, y + h - 50.0 + offset);
    }
}

pub fn hand_offset(frame: u64) -> f32 {
    let phase = (frame % 60) as f32 / 60.0;
    (phase * std::f32::consts::TAU).sin() * 10.0
}

fn hand_path() -> Option<Path> {
    let mut pb = PathBuilder::new();
    pb.move_to(0.0, 0.0);
    for (x, y) in [(18.0, 15.0), (10.0, 15.0), (15.0, 28.0), (11.0, 30.0), (6.0, 16.0), (0.0, 22.0)] {
        pb.line_to(x, y);
    }
    pb.close();
    pb.finish()
}

fn draw_hand_cursor(surface: &mut Pixmap, x: f32, y: f32) {
    let Some(path) = hand_path() else {
        return;
    };
    let transform = Transform::from_translate(x, y)
        .pre_concat(Transform::from_rotate(-45.0))
        .pre_concat(Transform::from_scale(2.5, 2.5));
    let shadow = Transform::from_translate(x + 2.0, y + 3.0)
        .pre_concat(Transform::from_rotate(-45.0))
        .pre_concat(Transform::from_scale(2.5, 2.5));
    surface.fill_path(&path, &solid(with_alpha(BLACK, 0.35)), FillRule::Winding, shadow, None);
    surface.fill_path(&path, &solid(WHITE), FillRule::Winding, transform, None);
    let stroke = Stroke {
        width: 2.0,
        ..Stroke::default()
    };
    surface.stroke_path(&path, &solid(BLACK), &stroke, transform, None);
}

fn draw_logo(canvas: &mut Canvas<'_>, x: f32, y: f32, size: f32, lines: &[String]) {
    let radius = size / 2.0;
    let (cx, cy) = (x + radius, y + radius);
    let Some(circle) = PathBuilder::from_circle(cx, cy, radius) else {
        return;
    };
    if let Some(shader) = RadialGradient::new(
        Point::from_xy(cx, cy),
        Point::from_xy(cx, cy),
        radius,
        vec![
            GradientStop::new(0.0, Color::from_rgba8(0xff, 0x6b, 0x35, 255)),
            GradientStop::new(0.5, Color::from_rgba8(0xff, 0x45, 0x00, 255)),
            GradientStop::new(1.0, Color::from_rgba8(0xcc, 0x33, 0x00, 255)),
        ],
        SpreadMode::Pad,
        Transform::identity(),
    ) {
        let paint = Paint {
            shader,
            anti_alias: true,
            ..Paint::default()
        };
        canvas
            .surface
            .fill_path(&circle, &paint, FillRule::Winding, Transform::identity(), None);
    }
    let ring = Stroke {
        width: 3.0,
        ..Stroke::default()
    };
    canvas.surface.stroke_path(
        &circle,
        &solid(with_alpha(WHITE, 0.3)),
        &ring,
        Transform::identity(),
        None,
    );

    let style = TextStyle {
        size: 24.0,
        face: FontFace::Body,
        color: WHITE,
        halign: HAlign::Center,
        valign: VAlign::Middle,
    };
    match lines {
        [single] => canvas.text.draw(canvas.surface, single, cx, cy, style),
        [first, second, ..] => {
            canvas.text.draw(canvas.surface, first, cx, cy - 12.0, style);
            canvas.text.draw(canvas.surface, second, cx, cy + 12.0, style);
        }
        [] => {}
    }
}

pub struct Compositor {
    layout: Box<dyn TemplateLayout>,
    text: TextPainter,
    cta: CtaScene,
    width: u32,
    height: u32,
}

impl Compositor {
    pub fn new(
        layout: Box<dyn TemplateLayout>,
        text: TextPainter,
        cta_image: Option<Pixmap>,
        branding: &BrandingConfig,
        width: u32,
        height: u32,
    ) -> Self {
        let cta = CtaScene::new(&text, width, height, cta_image, branding);
        Self {
            layout,
            text,
            cta,
            width,
            height,
        }
    }

    pub fn canvas_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn schedule(&self) -> &Schedule {
        self.layout.schedule()
    }

    pub fn layout(&self) -> &dyn TemplateLayout {
        self.layout.as_ref()
    }

    pub fn draw_frame(
        &mut self,
        state: &FrameState,
        clips: &[Option<Arc<VideoFrame>>],
        surface: &mut Pixmap,
    ) {
        surface.fill(Color::BLACK);
        let mut canvas = Canvas {
            surface,
            text: &mut self.text,
        };
        match state.phase {
            Phase::Header => {
                self.layout.draw_content_frame(&mut canvas, state, clips);
                self.layout.draw_header(&mut canvas, state);
            }
            Phase::Content => self.layout.draw_content_frame(&mut canvas, state, clips),
            Phase::Cta => self.cta.draw(&mut canvas, state.frame),
        }
    }
}
