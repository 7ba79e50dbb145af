use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};

use crate::timeline::Phase;

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("media load error for {} (clip {}): {reason}", .path.display(), clip_label(.clip))]
    MediaLoad {
        clip: Option<usize>,
        path: PathBuf,
        reason: String,
    },

    #[error("frame {frame} ({phase} at {t:.3}s) failed: {reason}")]
    FrameRender {
        frame: u64,
        t: f64,
        phase: Phase,
        clip: Option<usize>,
        reason: String,
    },

    #[error("encoding error: {message}")]
    Encoding {
        message: String,
        frame: Option<u64>,
        stderr_tail: String,
    },

    #[error("render timed out after {}s ({frames_done} frames completed)", .budget.as_secs_f64())]
    Timeout { budget: Duration, frames_done: u64 },

    #[error("render cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type RenderResult<T> = Result<T, RenderError>;

fn clip_label(clip: &Option<usize>) -> String {
    match clip {
        Some(index) => index.to_string(),
        None => "-".to_owned(),
    }
}

impl RenderError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn media_load(clip: Option<usize>, path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::MediaLoad {
            clip,
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding {
            message: message.into(),
            frame: None,
            stderr_tail: String::new(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::MediaLoad { .. } => "media_load_error",
            Self::FrameRender { .. } => "frame_render_error",
            Self::Encoding { .. } => "encoding_error",
            Self::Timeout { .. } => "timeout_error",
            Self::Cancelled => "cancelled",
            Self::Io(_) => "io_error",
            Self::Other(_) => "internal_error",
        }
    }

    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::FrameRender { .. })
    }

    fn context_value(&self) -> Option<Value> {
        match self {
            Self::MediaLoad { clip, path, .. } => Some(json!({
                "clip": clip,
                "path": path.display().to_string(),
            })),
            Self::FrameRender {
                frame,
                t,
                phase,
                clip,
                ..
            } => Some(json!({
                "frame": frame,
                "t": t,
                "phase": phase.as_str(),
                "clip": clip,
            })),
            Self::Encoding {
                frame, stderr_tail, ..
            } => Some(json!({
                "frame": frame,
                "stderr_tail": stderr_tail,
            })),
            Self::Timeout {
                budget,
                frames_done,
            } => Some(json!({
                "budget_secs": budget.as_secs_f64(),
                "frames_done": frames_done,
            })),
            _ => None,
        }
    }

    pub fn report(&self) -> FailureReport {
        let root_cause = match self {
            Self::Other(error) => error.root_cause().to_string(),
            Self::Io(error) => error.to_string(),
            Self::MediaLoad { reason, .. } | Self::FrameRender { reason, .. } => reason.clone(),
            Self::Encoding {
                message,
                stderr_tail,
                ..
            } => {
                if stderr_tail.is_empty() {
                    message.clone()
                } else {
                    stderr_tail.clone()
                }
            }
            other => other.to_string(),
        };
        FailureReport {
            ok: false,
            kind: self.kind().to_owned(),
            message: self.to_string(),
            root_cause,
            context: self.context_value(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub ok: bool,
    pub kind: String,
    pub message: String,
    pub root_cause: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

impl FailureReport {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{{\"ok\":false,\"kind\":\"{}\"}}", self.kind))
    }

    pub fn human(&self) -> String {
        if self.root_cause.is_empty() || self.message.contains(&self.root_cause) {
            self.message.clone()
        } else {
            format!("{}\ncaused by: {}", self.message, self.root_cause)
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct RenderDiagnostics {
    pub frame_failures: u64,
    pub samples: Vec<String>,
}

impl RenderDiagnostics {
    const MAX_SAMPLES: usize = 16;

    pub fn record(&mut self, error: &RenderError) {
        self.frame_failures += 1;
        if self.samples.len() < Self::MAX_SAMPLES {
            self.samples.push(error.to_string());
        }
    }

    pub fn is_clean(&self) -> bool {
        self.frame_failures == 0
    }
}
