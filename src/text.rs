use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use fontdue::{Font, FontSettings, Metrics};
use tiny_skia::{ColorU8, Pixmap};

const HEADLESS_ADVANCE_EM: f32 = 0.56;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FontFace {
    Body,
    Display,
}

pub trait TextMeasure {
    fn measure(&self, text: &str, size: f32, face: FontFace) -> f32;
}

pub fn wrap_words<M: TextMeasure + ?Sized>(
    measure: &M,
    text: &str,
    size: f32,
    face: FontFace,
    max_width: f32,
) -> Vec<String> {
    let mut words = text.split_whitespace();
    let Some(first) = words.next() else {
        return Vec::new();
    };
    let mut lines = Vec::new();
    let mut line = first.to_owned();
    for word in words {
        let candidate = format!("{line} {word}");
        if measure.measure(&candidate, size, face) < max_width {
            line = candidate;
        } else {
            lines.push(std::mem::replace(&mut line, word.to_owned()));
        }
    }
    lines.push(line);
    lines
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitRule {
    pub start_size: f32,
    pub min_size: f32,
    pub step: f32,
    pub max_lines: usize,
    pub max_width: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FittedText {
    pub size: f32,
    pub lines: Vec<String>,
}

pub fn fit_lines<M: TextMeasure + ?Sized>(
    measure: &M,
    text: &str,
    face: FontFace,
    rule: FitRule,
) -> FittedText {
    let mut size = rule.start_size;
    let mut lines = wrap_words(measure, text, size, face, rule.max_width);
    while lines.len() > rule.max_lines && size > rule.min_size {
        size = (size - rule.step).max(rule.min_size);
        lines = wrap_words(measure, text, size, face, rule.max_width);
    }
    FittedText { size, lines }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HAlign {
    Left,
    Center,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VAlign {
    Top,
    Middle,
    Bottom,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextStyle {
    pub size: f32,
    pub face: FontFace,
    pub color: ColorU8,
    pub halign: HAlign,
    pub valign: VAlign,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextShadow {
    pub offset_y: f32,
    pub spread: f32,
    pub alpha: f32,
}

struct Glyph {
    metrics: Metrics,
    coverage: Vec<u8>,
}

pub struct FontSet {
    body: Font,
    display: Option<Font>,
}

impl FontSet {
    pub fn load(body: &Path, display: Option<&Path>) -> Result<Self> {
        Ok(Self {
            body: read_font(body)?,
            display: display.map(read_font).transpose()?,
        })
    }

    fn face(&self, face: FontFace) -> &Font {
        match face {
            FontFace::Display => self.display.as_ref().unwrap_or(&self.body),
            FontFace::Body => &self.body,
        }
    }
}

fn read_font(path: &Path) -> Result<Font> {
    let bytes = fs::read(path).with_context(|| format!("failed to read font {}", path.display()))?;
    Font::from_bytes(bytes, FontSettings::default())
        .map_err(|error| anyhow!("failed to parse font {}: {error}", path.display()))
}

pub struct TextPainter {
    fonts: Option<FontSet>,
    glyph_cache: HashMap<(FontFace, char, u32), Glyph>,
}

impl TextPainter {
    pub fn new(fonts: FontSet) -> Self {
        Self {
            fonts: Some(fonts),
            glyph_cache: HashMap::new(),
        }
    }

    pub fn headless() -> Self {
        Self {
            fonts: None,
            glyph_cache: HashMap::new(),
        }
    }

    pub fn has_fonts(&self) -> bool {
        self.fonts.is_some()
    }

    pub fn line_metrics(&self, size: f32, face: FontFace) -> (f32, f32) {
        let line = self
            .fonts
            .as_ref()
            .and_then(|fonts| fonts.face(face).horizontal_line_metrics(size));
        match line {
            Some(line) => (line.ascent, line.ascent - line.descent),
            None => (size * 0.8, size),
        }
    }

    pub fn draw(&mut self, surface: &mut Pixmap, text: &str, x: f32, y: f32, style: TextStyle) {
        self.draw_with_alpha(surface, text, x, y, style, 1.0);
    }

    pub fn draw_with_alpha(
        &mut self,
        surface: &mut Pixmap,
        text: &str,
        x: f32,
        y: f32,
        style: TextStyle,
        alpha: f32,
    ) {
        if text.is_empty() || alpha <= 0.0 || self.fonts.is_none() {
            return;
        }
        let width = self.measure(text, style.size, style.face);
        let (ascent, height) = self.line_metrics(style.size, style.face);
        let left = match style.halign {
            HAlign::Left => x,
            HAlign::Center => x - width / 2.0,
            HAlign::Right => x - width,
        };
        let top = match style.valign {
            VAlign::Top => y,
            VAlign::Middle => y - height / 2.0,
            VAlign::Bottom => y - height,
        };
        let baseline = top + ascent;
        let size_key = style.size.to_bits();

        let mut pen = left;
        let mut previous: Option<char> = None;
        for ch in text.chars() {
            let Some(fonts) = self.fonts.as_ref() else {
                return;
            };
            let font = fonts.face(style.face);
            if let Some(prev) = previous {
                pen += font.horizontal_kern(prev, ch, style.size).unwrap_or(0.0);
            }
            let glyph = self
                .glyph_cache
                .entry((style.face, ch, size_key))
                .or_insert_with(|| {
                    let (metrics, coverage) = font.rasterize(ch, style.size);
                    Glyph { metrics, coverage }
                });
            let gx = (pen + glyph.metrics.xmin as f32).round() as i32;
            let gy = (baseline - glyph.metrics.height as f32 - glyph.metrics.ymin as f32).round() as i32;
            blend_coverage(surface, gx, gy, glyph, style.color, alpha);
            pen += glyph.metrics.advance_width;
            previous = Some(ch);
        }
    }

    pub fn draw_shadowed(
        &mut self,
        surface: &mut Pixmap,
        text: &str,
        x: f32,
        y: f32,
        style: TextStyle,
        shadow: TextShadow,
    ) {
        let rings = [(0.0_f32, 0.0_f32), (1.0, 0.0), (-1.0, 0.0), (0.0, 1.0), (0.0, -1.0)];
        let shadow_style = TextStyle {
            color: ColorU8::from_rgba(0, 0, 0, 255),
            ..style
        };
        for step in 1..=3 {
            let reach = shadow.spread * step as f32 / 3.0;
            let layer_alpha = shadow.alpha / (3.0 * rings.len() as f32) * 2.0;
            for (dx, dy) in rings {
                self.draw_with_alpha(
                    surface,
                    text,
                    x + dx * reach,
                    y + shadow.offset_y + dy * reach,
                    shadow_style,
                    layer_alpha,
                );
            }
        }
        self.draw(surface, text, x, y, style);
    }
}

impl TextMeasure for TextPainter {
    fn measure(&self, text: &str, size: f32, face: FontFace) -> f32 {
        let Some(fonts) = &self.fonts else {
            return text.chars().count() as f32 * size * HEADLESS_ADVANCE_EM;
        };
        let font = fonts.face(face);
        let mut width = 0.0;
        let mut previous: Option<char> = None;
        for ch in text.chars() {
            if let Some(prev) = previous {
                width += font.horizontal_kern(prev, ch, size).unwrap_or(0.0);
            }
            width += font.metrics(ch, size).advance_width;
            previous = Some(ch);
        }
        width
    }
}

fn blend_coverage(surface: &mut Pixmap, x: i32, y: i32, glyph: &Glyph, color: ColorU8, alpha: f32) {
    let width = surface.width() as i32;
    let height = surface.height() as i32;
    let glyph_width = glyph.metrics.width;
    let data = surface.data_mut();
    let base_alpha = f32::from(color.alpha()) / 255.0 * alpha.clamp(0.0, 1.0);
    let src = [
        f32::from(color.red()),
        f32::from(color.green()),
        f32::from(color.blue()),
    ];

    for row in 0..glyph.metrics.height {
        let py = y + row as i32;
        if py < 0 || py >= height {
            continue;
        }
        for col in 0..glyph_width {
            let px = x + col as i32;
            if px < 0 || px >= width {
                continue;
            }
            let mask = glyph.coverage[row * glyph_width + col];
            if mask == 0 {
                continue;
            }
            let a = f32::from(mask) / 255.0 * base_alpha;
            let idx = ((py * width + px) * 4) as usize;
            let inv = 1.0 - a;
            for channel in 0..3 {
                let dst = f32::from(data[idx + channel]);
                data[idx + channel] = (src[channel] * a + dst * inv).round().min(255.0) as u8;
            }
            let dst_alpha = f32::from(data[idx + 3]);
            data[idx + 3] = (255.0 * a + dst_alpha * inv).round().min(255.0) as u8;
        }
    }
}
