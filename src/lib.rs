pub mod casing;
pub mod clock;
pub mod compositor;
pub mod config;
pub mod decoding;
pub mod driver;
pub mod encoding;
pub mod error;
pub mod job;
pub mod logging;
pub mod media;
pub mod mux;
pub mod narration;
pub mod playback;
pub mod request;
pub mod templates;
pub mod text;
pub mod timeline;

pub use config::RenderConfig;
pub use error::{FailureReport, RenderError, RenderResult};
pub use job::{JobOutcome, JobRunner, RenderJob, RenderProgress, RenderStage};
pub use request::{RenderRequest, TemplateKind};
pub use timeline::Schedule;
