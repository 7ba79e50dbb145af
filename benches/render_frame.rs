//! Full-frame compositing at production size.
//! Run: cargo bench
//!
//! Text is measured but not painted, so the numbers cover clip drawing,
//! overlays and captions without glyph rasterization.

use std::path::PathBuf;
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tiny_skia::{Color, Pixmap};

use reelcast::compositor::Compositor;
use reelcast::config::RenderConfig;
use reelcast::decoding::VideoFrame;
use reelcast::request::{ClipRef, Labels, RenderRequest, TemplateKind};
use reelcast::templates::select_layout;
use reelcast::text::TextPainter;

fn compositor(template: TemplateKind, labels: Labels, config: &RenderConfig) -> Compositor {
    let request = RenderRequest {
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
    };
    let painter = TextPainter::headless();
    let layout = select_layout(&request, config, &painter);
    Compositor::new(
        layout,
        painter,
        None,
        &config.branding,
        config.canvas.width,
        config.canvas.height,
    )
}

fn clip_frames(count: usize, width: u32, height: u32) -> Vec<Option<Arc<VideoFrame>>> {
    (0..count)
        .map(|index| {
            let mut pixmap = Pixmap::new(width, height).expect("clip frame");
            pixmap.fill(Color::from_rgba8(40 * index as u8, 90, 160, 255));
            Some(Arc::new(VideoFrame { pts: 0.0, pixmap }))
        })
        .collect()
}

fn bench_composite(c: &mut Criterion) {
    let config = RenderConfig::default();
    let mut surface = Pixmap::new(config.canvas.width, config.canvas.height).expect("surface");

    let mut group = c.benchmark_group("render_frame");
    group.sample_size(30);

    let mut grid = compositor(
        TemplateKind::Grid4,
        Labels {
            countries: ["chile", "peru", "japan", "iceland"].map(String::from).to_vec(),
            date: "12 МАРТА".to_owned(),
            ..Labels::default()
        },
        &config,
    );
    let grid_clips = clip_frames(4, 540, 960);
    let grid_state = grid.schedule().frame_state(90);
    group.bench_function("grid4_content_1080x1920", |b| {
        b.iter(|| {
            grid.draw_frame(black_box(&grid_state), &grid_clips, &mut surface);
            black_box(surface.data()[0])
        });
    });

    let mut news = compositor(
        TemplateKind::NewsSequence,
        Labels {
            country: "chile".to_owned(),
            date: "12 march".to_owned(),
            tickers: vec![
                "heavy rain flooded the capital overnight and rivers are still rising".to_owned(),
                String::new(),
                "officials expect the water to recede by the weekend".to_owned(),
            ],
            ..Labels::default()
        },
        &config,
    );
    let news_clips = clip_frames(5, 1080, 1920);
    let slot = news.schedule().tickers()[0];
    let news_state = news
        .schedule()
        .state_at(0, slot.start + slot.duration() / 2.0);
    group.bench_function("news_caption_1080x1920", |b| {
        b.iter(|| {
            news.draw_frame(black_box(&news_state), &news_clips, &mut surface);
            black_box(surface.data()[0])
        });
    });

    group.finish();
}

criterion_group!(benches, bench_composite);
criterion_main!(benches);
