use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::request::TemplateKind;

pub const ENV_FFMPEG: &str = "REELCAST_FFMPEG";
pub const ENV_FONT: &str = "REELCAST_FONT";
pub const ENV_TEMP_DIR: &str = "REELCAST_TEMP_DIR";
pub const ENV_JOB_TIMEOUT_SECS: &str = "REELCAST_JOB_TIMEOUT_SECS";

/// Regular places a bold sans face lives on Linux and macOS hosts.
const SYSTEM_FONT_CANDIDATES: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans-Bold.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans-Bold.ttf",
    "/usr/share/fonts/TTF/DejaVuSans-Bold.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Bold.ttf",
    "/usr/share/fonts/liberation-sans/LiberationSans-Bold.ttf",
    "/usr/share/fonts/truetype/noto/NotoSans-Bold.ttf",
    "/usr/share/fonts/noto/NotoSans-Bold.ttf",
    "/Library/Fonts/Arial Bold.ttf",
    "/System/Library/Fonts/Supplemental/Arial Bold.ttf",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RenderConfig {
    pub canvas: CanvasConfig,
    pub timing: TimingConfig,
    pub modes: ModeConfig,
    pub timeouts: TimeoutConfig,
    pub encoder: EncoderConfig,
    pub fonts: FontConfig,
    pub branding: BrandingConfig,
    /// Parent directory for per-job scratch directories. System temp when unset.
    pub temp_root: Option<PathBuf>,
    pub max_concurrent_jobs: usize,
    pub logging: LoggingConfig,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            canvas: CanvasConfig::default(),
            timing: TimingConfig::default(),
            modes: ModeConfig::default(),
            timeouts: TimeoutConfig::default(),
            encoder: EncoderConfig::default(),
            fonts: FontConfig::default(),
            branding: BrandingConfig::default(),
            temp_root: None,
            max_concurrent_jobs: 2,
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CanvasConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for CanvasConfig {
    fn default() -> Self {
        Self {
            width: 1080,
            height: 1920,
            fps: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimingConfig {
    pub grid_content_secs: f64,
    pub news_clip_secs: f64,
    pub news_header_secs: f64,
    pub ticker_count: usize,
    pub cta_secs: f64,
    pub fade_secs: f64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            grid_content_secs: 20.0,
            news_clip_secs: 6.0,
            news_header_secs: 2.0,
            ticker_count: 3,
            cta_secs: 5.0,
            fade_secs: 0.3,
        }
    }
}

impl TimingConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("grid_content_secs", self.grid_content_secs),
            ("news_clip_secs", self.news_clip_secs),
            ("cta_secs", self.cta_secs),
        ] {
            if !value.is_finite() || value <= 0.0 {
                bail!("timing.{name} must be a positive number of seconds, got {value}");
            }
        }
        if !self.news_header_secs.is_finite() || self.news_header_secs < 0.0 {
            bail!("timing.news_header_secs must be >= 0");
        }
        let news_content = self.news_clip_secs * TemplateKind::NewsSequence.required_clips() as f64;
        if self.news_header_secs >= news_content {
            bail!(
                "timing.news_header_secs ({}) must be shorter than the news clip run ({news_content})",
                self.news_header_secs
            );
        }
        if self.ticker_count == 0 {
            bail!("timing.ticker_count must be at least 1");
        }
        if !self.fade_secs.is_finite() || self.fade_secs < 0.0 {
            bail!("timing.fade_secs must be >= 0");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderMode {
    /// Wall-clock loop with continuous capture.
    Live,
    /// Frame stepping with explicit seeks.
    Offline,
}

impl std::str::FromStr for RenderMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "live" => Ok(Self::Live),
            "offline" | "snapshot" => Ok(Self::Offline),
            other => bail!("unknown render mode '{other}' (expected live or offline)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModeConfig {
    pub grid4: RenderMode,
    pub news_sequence: RenderMode,
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self {
            grid4: RenderMode::Live,
            news_sequence: RenderMode::Offline,
        }
    }
}

impl ModeConfig {
    pub fn for_template(&self, kind: TemplateKind) -> RenderMode {
        match kind {
            TemplateKind::Grid4 => self.grid4,
            TemplateKind::NewsSequence => self.news_sequence,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutConfig {
    pub media_load_secs: f64,
    pub job_secs: f64,
    pub seek_poll_interval_ms: u64,
    pub seek_poll_attempts: u32,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            media_load_secs: 60.0,
            job_secs: 600.0,
            seek_poll_interval_ms: 5,
            seek_poll_attempts: 400,
        }
    }
}

/// Longest accepted media-load or job budget: one day.
pub const MAX_TIMEOUT_SECS: f64 = 86_400.0;

fn is_valid_timeout(secs: f64) -> bool {
    secs.is_finite() && secs > 0.0 && secs <= MAX_TIMEOUT_SECS
}

fn budget(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.clamp(0.0, MAX_TIMEOUT_SECS))
        .unwrap_or(Duration::from_secs_f64(MAX_TIMEOUT_SECS))
}

impl TimeoutConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("media_load_secs", self.media_load_secs),
            ("job_secs", self.job_secs),
        ] {
            if !is_valid_timeout(value) {
                bail!("timeouts.{name} must be within (0, {MAX_TIMEOUT_SECS}] seconds, got {value}");
            }
        }
        if self.seek_poll_attempts == 0 {
            bail!("timeouts.seek_poll_attempts must be at least 1");
        }
        Ok(())
    }

    pub fn media_load(&self) -> Duration {
        budget(self.media_load_secs)
    }

    pub fn job(&self) -> Duration {
        budget(self.job_secs)
    }

    pub fn seek_poll_interval(&self) -> Duration {
        Duration::from_millis(self.seek_poll_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FfmpegMode {
    System,
    Sidecar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NarrationMix {
    /// Narration is the only audio in the output.
    Replace,
    /// Narration is mixed over the routed clip audio.
    Mix,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EncoderConfig {
    pub ffmpeg_mode: FfmpegMode,
    pub ffmpeg_path: PathBuf,
    /// Defaults to the `ffprobe` next to `ffmpeg_path`.
    pub ffprobe_path: Option<PathBuf>,
    pub crf: u8,
    pub preset: String,
    pub audio_bitrate: String,
    pub frame_buffer: usize,
    pub narration_mix: NarrationMix,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_mode: FfmpegMode::System,
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: None,
            crf: 16,
            preset: "slow".to_owned(),
            audio_bitrate: "192k".to_owned(),
            frame_buffer: 4,
            narration_mix: NarrationMix::Replace,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FontConfig {
    /// Bold sans face used for captions and badges.
    pub body: Option<PathBuf>,
    /// Heavy face for labels and headers; falls back to `body`.
    pub display: Option<PathBuf>,
}

impl FontConfig {
    /// Configured body font, or the first system candidate that exists.
    pub fn resolve_body(&self) -> Option<PathBuf> {
        if let Some(path) = &self.body {
            return Some(path.clone());
        }
        SYSTEM_FONT_CANDIDATES
            .iter()
            .map(PathBuf::from)
            .find(|path| path.is_file())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrandingConfig {
    pub cta_caption: String,
    /// Substring of `cta_caption` drawn in the accent color.
    pub cta_highlight: String,
    /// Up to two lines drawn in a round badge during the CTA. Empty disables it.
    pub logo_lines: Vec<String>,
}

impl Default for BrandingConfig {
    fn default() -> Self {
        Self {
            cta_caption: "О причинах учащения природных катастроф и прогнозах на ближайшие годы - в климатическом докладе учёных АЛЛАТРА".to_owned(),
            cta_highlight: "учёных АЛЛАТРА".to_owned(),
            logo_lines: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            json: false,
        }
    }
}

/// Values that may come from the environment or CLI flags.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigOverrides {
    pub ffmpeg_path: Option<PathBuf>,
    pub font: Option<PathBuf>,
    pub temp_root: Option<PathBuf>,
    pub job_timeout_secs: Option<f64>,
    pub grid4_mode: Option<RenderMode>,
    pub news_mode: Option<RenderMode>,
}

impl RenderConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse config {}", path.display()))?,
            _ => serde_yaml::from_str(&raw)
                .with_context(|| format!("failed to parse config {}", path.display()))?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let canvas = &self.canvas;
        if canvas.width == 0 || canvas.height == 0 {
            bail!("canvas dimensions must be non-zero");
        }
        if canvas.width % 2 != 0 || canvas.height % 2 != 0 {
            bail!(
                "canvas dimensions must be even for yuv420p output, got {}x{}",
                canvas.width,
                canvas.height
            );
        }
        if canvas.fps == 0 || canvas.fps > 120 {
            bail!("canvas.fps must be within 1..=120, got {}", canvas.fps);
        }
        self.timing.validate()?;
        self.timeouts.validate()?;
        if self.encoder.frame_buffer == 0 {
            bail!("encoder.frame_buffer must be at least 1");
        }
        if self.encoder.crf > 51 {
            bail!("encoder.crf must be within 0..=51");
        }
        if self.max_concurrent_jobs == 0 {
            bail!("max_concurrent_jobs must be at least 1");
        }
        if !self.branding.cta_highlight.is_empty()
            && !self.branding.cta_caption.contains(&self.branding.cta_highlight)
        {
            bail!("branding.cta_highlight must be a substring of branding.cta_caption");
        }
        Ok(())
    }

    /// Apply resolved overrides. Later sources already won inside `overrides`.
    pub fn with_overrides(mut self, overrides: &ConfigOverrides) -> Result<Self> {
        if let Some(path) = &overrides.ffmpeg_path {
            self.encoder.ffmpeg_path = path.clone();
        }
        if let Some(font) = &overrides.font {
            self.fonts.body = Some(font.clone());
        }
        if let Some(root) = &overrides.temp_root {
            self.temp_root = Some(root.clone());
        }
        if let Some(secs) = overrides.job_timeout_secs {
            self.timeouts.job_secs = secs;
        }
        if let Some(mode) = overrides.grid4_mode {
            self.modes.grid4 = mode;
        }
        if let Some(mode) = overrides.news_mode {
            self.modes.news_sequence = mode;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn frame_interval(&self) -> f64 {
        1.0 / f64::from(self.canvas.fps)
    }
}

/// CLI wins over env; unparsable env values are ignored.
pub fn resolve_path_override(cli_arg: Option<PathBuf>, env_var: Option<String>) -> Option<PathBuf> {
    if cli_arg.is_some() {
        return cli_arg;
    }
    env_var
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

/// CLI wins over env. An unusable env value is ignored; an unusable CLI
/// value is an error.
pub fn resolve_secs_override(cli_arg: Option<f64>, env_var: Option<String>) -> Result<Option<f64>> {
    if let Some(secs) = cli_arg {
        if !is_valid_timeout(secs) {
            bail!("timeout must be within (0, {MAX_TIMEOUT_SECS}] seconds, got {secs}");
        }
        return Ok(Some(secs));
    }
    Ok(env_var
        .and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|secs| is_valid_timeout(*secs)))
}
