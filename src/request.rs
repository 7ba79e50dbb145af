use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::RenderConfig;
use crate::error::{RenderError, RenderResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    #[serde(alias = "grid")]
    Grid4,
    #[serde(alias = "news")]
    NewsSequence,
}

impl TemplateKind {
    pub fn required_clips(self) -> usize {
        match self {
            Self::Grid4 => 4,
            Self::NewsSequence => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Grid4 => "grid4",
            Self::NewsSequence => "news_sequence",
        }
    }
}

impl FromStr for TemplateKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "grid4" | "grid" => Ok(Self::Grid4),
            "news_sequence" | "news-sequence" | "news" => Ok(Self::NewsSequence),
            other => bail!("unknown template '{other}' (expected grid4 or news_sequence)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClipRef {
    pub path: PathBuf,
    #[serde(default)]
    pub trim_start: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Labels {
    pub countries: Vec<String>,
    pub country: String,
    pub date: String,
    pub tickers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NarrationSegment {
    pub slot: usize,
    pub start_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NarrationTrack {
    pub path: PathBuf,
    pub total_duration_secs: f64,
    pub segments: Vec<NarrationSegment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RenderRequest {
    pub template: TemplateKind,
    pub clips: Vec<ClipRef>,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub cta_image: Option<PathBuf>,
    #[serde(default)]
    pub narration: Option<NarrationTrack>,
}

impl RenderRequest {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read request {}", path.display()))?;
        let mut request: Self = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse request {}", path.display()))?,
            _ => serde_yaml::from_str(&raw)
                .with_context(|| format!("failed to parse request {}", path.display()))?,
        };
        if let Some(base) = path.parent() {
            request.resolve_paths(base);
        }
        Ok(request)
    }

    pub fn resolve_paths(&mut self, base: &Path) {
        let join = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        for clip in &mut self.clips {
            join(&mut clip.path);
        }
        if let Some(image) = &mut self.cta_image {
            join(image);
        }
        if let Some(narration) = &mut self.narration {
            join(&mut narration.path);
        }
    }

    pub fn validate(&self, config: &RenderConfig) -> RenderResult<()> {
        let required = self.template.required_clips();
        if self.clips.len() != required {
            return Err(RenderError::validation(format!(
                "{} requires exactly {required} clips, got {}",
                self.template.as_str(),
                self.clips.len()
            )));
        }

        for (index, clip) in self.clips.iter().enumerate() {
            if clip.path.as_os_str().is_empty() {
                return Err(RenderError::validation(format!("clip {index} has an empty path")));
            }
            if !clip.trim_start.is_finite() || clip.trim_start < 0.0 {
                return Err(RenderError::validation(format!(
                    "clip {index} trim_start must be >= 0, got {}",
                    clip.trim_start
                )));
            }
            if !clip.path.is_file() {
                return Err(RenderError::validation(format!(
                    "clip {index} not found: {}",
                    clip.path.display()
                )));
            }
        }

        match self.template {
            TemplateKind::Grid4 => self.validate_grid_labels()?,
            TemplateKind::NewsSequence => self.validate_news_labels(config)?,
        }

        if let Some(narration) = &self.narration {
            if self.template != TemplateKind::NewsSequence {
                return Err(RenderError::validation(
                    "narration audio is only supported for news_sequence",
                ));
            }
            validate_narration_shape(narration, config.timing.ticker_count)?;
        }

        Ok(())
    }

    fn validate_grid_labels(&self) -> RenderResult<()> {
        let labels = &self.labels;
        if labels.countries.len() > 4 {
            return Err(RenderError::validation(format!(
                "grid4 accepts at most 4 country labels, got {}",
                labels.countries.len()
            )));
        }
        if !labels.country.is_empty() || !labels.tickers.is_empty() {
            return Err(RenderError::validation(
                "grid4 labels take `countries` and `date` only",
            ));
        }
        Ok(())
    }

    fn validate_news_labels(&self, config: &RenderConfig) -> RenderResult<()> {
        let labels = &self.labels;
        if labels.country.trim().is_empty() {
            return Err(RenderError::validation("news_sequence requires a country label"));
        }
        if labels.date.trim().is_empty() {
            return Err(RenderError::validation("news_sequence requires a date label"));
        }
        if !labels.countries.is_empty() {
            return Err(RenderError::validation(
                "news_sequence labels take `country`, `date` and `tickers` only",
            ));
        }
        let expected = config.timing.ticker_count;
        if labels.tickers.len() != expected {
            return Err(RenderError::validation(format!(
                "news_sequence requires exactly {expected} ticker entries (empty strings allowed), got {}",
                labels.tickers.len()
            )));
        }
        Ok(())
    }

    pub fn ticker(&self, slot: usize) -> Option<&str> {
        self.labels
            .tickers
            .get(slot)
            .map(|text| text.trim())
            .filter(|text| !text.is_empty())
    }
}

fn validate_narration_shape(narration: &NarrationTrack, ticker_count: usize) -> RenderResult<()> {
    if !narration.total_duration_secs.is_finite() || narration.total_duration_secs <= 0.0 {
        return Err(RenderError::validation(
            "narration total_duration_secs must be positive",
        ));
    }
    if !narration.path.is_file() {
        return Err(RenderError::validation(format!(
            "narration audio not found: {}",
            narration.path.display()
        )));
    }
    let mut seen = vec![false; ticker_count];
    for segment in &narration.segments {
        let Some(slot_seen) = seen.get_mut(segment.slot) else {
            return Err(RenderError::validation(format!(
                "narration segment references slot {} but only {ticker_count} exist",
                segment.slot
            )));
        };
        if *slot_seen {
            return Err(RenderError::validation(format!(
                "narration slot {} has more than one segment",
                segment.slot
            )));
        }
        *slot_seen = true;
        if !segment.start_secs.is_finite() || segment.start_secs < 0.0 {
            return Err(RenderError::validation(format!(
                "narration segment for slot {} has invalid start {}",
                segment.slot, segment.start_secs
            )));
        }
    }
    Ok(())
}
