use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tempfile::TempDir;
use tiny_skia::Pixmap;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::clock::{FrameClock, PacedClock, StepClock, WallClock};
use crate::compositor::Compositor;
use crate::config::{RenderConfig, RenderMode};
use crate::driver::{render_still, run_frames, start_players, DriverOptions, MAX_LOOP_PROGRESS};
use crate::encoding::{resolve_ffmpeg, CaptureStream, ExactSink, FfmpegPipe, FrameSink};
use crate::error::{RenderDiagnostics, RenderError, RenderResult};
use crate::media::{ffprobe_path, MediaHandle, MediaLoader};
use crate::mux::{run_mux, MuxRequest};
use crate::narration::check_alignment;
use crate::playback::PlaybackController;
use crate::request::RenderRequest;
use crate::templates::select_layout;
use crate::text::{FontSet, TextPainter};
use crate::timeline::Schedule;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderStage {
    Validating,
    Loading,
    Rendering,
    Muxing,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RenderProgress {
    pub stage: RenderStage,
    pub fraction: f64,
}

impl RenderProgress {
    const RENDER_START: f64 = 0.1;
    const RENDER_SPAN: f64 = 0.8;

    fn at(stage: RenderStage, fraction: f64) -> Self {
        let fraction = match stage {
            RenderStage::Done => 1.0,
            _ => fraction.clamp(0.0, MAX_LOOP_PROGRESS),
        };
        Self { stage, fraction }
    }

    fn rendering(loop_fraction: f64) -> Self {
        Self::at(
            RenderStage::Rendering,
            Self::RENDER_START + Self::RENDER_SPAN * loop_fraction,
        )
    }
}

pub type ProgressCallback = Arc<dyn Fn(RenderProgress) + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub job_id: String,
    pub output: PathBuf,
    pub mode: RenderMode,
    pub frames: u64,
    pub duration_secs: f64,
    pub elapsed_secs: f64,
    pub diagnostics: RenderDiagnostics,
}

static JOB_COUNTER: AtomicU32 = AtomicU32::new(0);

fn next_job_id() -> String {
    let serial = JOB_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}-{serial:04}", chrono::Utc::now().format("%Y%m%dT%H%M%S"))
}

pub fn validate_job(config: &RenderConfig, request: &RenderRequest) -> RenderResult<FontSet> {
    config
        .validate()
        .map_err(|error| RenderError::validation(format!("{error:#}")))?;
    request.validate(config)?;
    if let Some(track) = &request.narration {
        let schedule = Schedule::new(request.template, &config.timing, config.canvas.fps);
        check_alignment(track, &schedule)?;
    }
    load_fonts(config)
}

pub fn load_fonts(config: &RenderConfig) -> RenderResult<FontSet> {
    let body = config.fonts.resolve_body().ok_or_else(|| {
        RenderError::validation(
            "no usable font: set fonts.body, --font or REELCAST_FONT to a .ttf/.otf file",
        )
    })?;
    FontSet::load(&body, config.fonts.display.as_deref())
        .map_err(|error| RenderError::validation(format!("{error:#}")))
}

fn create_job_dir(config: &RenderConfig) -> RenderResult<TempDir> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("reelcast-job-");
    let dir = match &config.temp_root {
        Some(root) => {
            std::fs::create_dir_all(root)?;
            builder.tempdir_in(root)?
        }
        None => builder.tempdir()?,
    };
    Ok(dir)
}

fn staged_name(prefix: &str, source: &Path) -> String {
    match source.extension().and_then(|ext| ext.to_str()) {
        Some(ext) => format!("{prefix}.{ext}"),
        None => prefix.to_owned(),
    }
}

pub async fn stage_inputs(request: &RenderRequest, dir: &Path) -> RenderResult<RenderRequest> {
    let mut staged = request.clone();
    for (index, clip) in staged.clips.iter_mut().enumerate() {
        let target = dir.join(staged_name(&format!("clip{index}"), &clip.path));
        tokio::fs::copy(&clip.path, &target).await.map_err(|error| {
            RenderError::media_load(Some(index), &clip.path, format!("failed to stage clip: {error}"))
        })?;
        clip.path = target;
    }
    if let Some(image) = &mut staged.cta_image {
        let target = dir.join(staged_name("cta", image));
        match tokio::fs::copy(&*image, &target).await {
            Ok(_) => *image = target,
            Err(error) => {
                tracing::warn!(path = %image.display(), %error, "CTA image could not be staged; continuing without it");
                staged.cta_image = None;
            }
        }
    }
    if let Some(narration) = &mut staged.narration {
        let target = dir.join(staged_name("narration", &narration.path));
        tokio::fs::copy(&narration.path, &target).await.map_err(|error| {
            RenderError::media_load(None, &narration.path, format!("failed to stage narration: {error}"))
        })?;
        narration.path = target;
    }
    Ok(staged)
}

struct PreparedJob {
    request: RenderRequest,
    handles: Vec<MediaHandle>,
    cta_image: Option<Pixmap>,
    fonts: FontSet,
    ffmpeg: PathBuf,
}

impl PreparedJob {
    fn compositor(self, config: &RenderConfig) -> (Compositor, Vec<MediaHandle>, PathBuf) {
        let painter = TextPainter::new(self.fonts);
        let layout = select_layout(&self.request, config, &painter);
        let compositor = Compositor::new(
            layout,
            painter,
            self.cta_image,
            &config.branding,
            config.canvas.width,
            config.canvas.height,
        );
        (compositor, self.handles, self.ffmpeg)
    }
}

async fn prepare(
    config: &RenderConfig,
    request: RenderRequest,
    fonts: FontSet,
) -> RenderResult<PreparedJob> {
    let ffmpeg = resolve_ffmpeg(config).map_err(|error| RenderError::validation(format!("{error:#}")))?;
    let ffprobe = ffprobe_path(&config.encoder, &ffmpeg);
    let loader = MediaLoader::new(ffmpeg.clone(), ffprobe, config.timeouts.media_load());

    let handles = loader.load_clips(&request.clips).await?;
    let cta_image = match &request.cta_image {
        Some(path) => loader.load_image(path).await,
        None => None,
    };
    Ok(PreparedJob {
        request,
        handles,
        cta_image,
        fonts,
        ffmpeg,
    })
}

pub struct RenderJob {
    id: String,
    config: Arc<RenderConfig>,
    request: RenderRequest,
    output: PathBuf,
    progress: Option<ProgressCallback>,
    cancel: Arc<AtomicBool>,
}

impl RenderJob {
    pub fn new(config: Arc<RenderConfig>, request: RenderRequest, output: impl Into<PathBuf>) -> Self {
        Self {
            id: next_job_id(),
            config,
            request,
            output: output.into(),
            progress: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    fn report(&self, progress: RenderProgress) {
        if let Some(callback) = &self.progress {
            callback(progress);
        }
    }

    pub async fn run(self) -> RenderResult<JobOutcome> {
        let span = tracing::info_span!("job", id = %self.id, template = self.request.template.as_str());
        async move {
            let result = self.execute().await;
            match &result {
                Ok(outcome) => tracing::info!(
                    output = %outcome.output.display(),
                    frames = outcome.frames,
                    elapsed_secs = outcome.elapsed_secs,
                    degraded_frames = outcome.diagnostics.frame_failures,
                    "render finished"
                ),
                Err(error) => tracing::error!(kind = error.kind(), %error, "render failed"),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn execute(self) -> RenderResult<JobOutcome> {
        let started = Instant::now();
        let budget = self.config.timeouts.job();
        let deadline = tokio::time::Instant::now() + budget;
        let frames_done = Arc::new(AtomicU64::new(0));
        let timed_out = |frames_done: &AtomicU64| RenderError::Timeout {
            budget,
            frames_done: frames_done.load(Ordering::Relaxed),
        };

        self.report(RenderProgress::at(RenderStage::Validating, 0.0));
        let config = Arc::clone(&self.config);
        let fonts = validate_job(&config, &self.request)?;

        let job_dir = create_job_dir(&config)?;
        tracing::debug!(dir = %job_dir.path().display(), "job directory created");

        self.report(RenderProgress::at(RenderStage::Loading, 0.02));
        let prepared = tokio::time::timeout_at(deadline, async {
            let staged = stage_inputs(&self.request, job_dir.path()).await?;
            prepare(&config, staged, fonts).await
        })
        .await
        .map_err(|_| timed_out(&frames_done))??;

        let narration = prepared.request.narration.as_ref().map(|track| track.path.clone());
        let template = prepared.request.template;
        let mode = config.modes.for_template(template);
        let video_path = job_dir.path().join("video.mp4");

        self.report(RenderProgress::rendering(0.0));
        let mut render = {
            let config = Arc::clone(&config);
            let cancel = Arc::clone(&self.cancel);
            let frames_done = Arc::clone(&frames_done);
            let progress = self.progress.clone();
            let video_path = video_path.clone();
            let span = tracing::Span::current();
            tokio::task::spawn_blocking(move || {
                let _entered = span.enter();
                let (mut compositor, handles, ffmpeg) = prepared.compositor(&config);
                let players = start_players(&handles, &ffmpeg, template, &config)?;
                let schedule = compositor.schedule().clone();
                let playback = PlaybackController::new(players, schedule.clone());
                let pipe = FfmpegPipe::spawn(&config, &ffmpeg, &video_path)?;

                let frame_count = schedule.frame_count();
                let mut on_progress = |fraction: f64| {
                    frames_done.store((fraction * frame_count as f64) as u64, Ordering::Relaxed);
                    if let Some(callback) = &progress {
                        callback(RenderProgress::rendering(fraction));
                    }
                };
                let options = DriverOptions {
                    mode,
                    seek_poll_interval: config.timeouts.seek_poll_interval(),
                    seek_poll_attempts: config.timeouts.seek_poll_attempts,
                    cancel,
                    progress: Some(&mut on_progress),
                };
                let (mut clock, sink): (Box<dyn FrameClock>, Box<dyn FrameSink>) = match mode {
                    RenderMode::Offline => (
                        Box::new(StepClock::new(frame_count, schedule.fps())),
                        Box::new(ExactSink::new(pipe)),
                    ),
                    RenderMode::Live => (
                        Box::new(PacedClock::new(
                            WallClock::start(),
                            schedule.fps(),
                            schedule.total_duration(),
                        )),
                        Box::new(CaptureStream::new(pipe, schedule.fps(), frame_count)),
                    ),
                };
                let outcome = run_frames(&mut compositor, playback, clock.as_mut(), sink, options)?;
                Ok::<_, RenderError>((outcome, handles, ffmpeg))
            })
        };

        let (outcome, handles, ffmpeg) = match tokio::time::timeout_at(deadline, &mut render).await {
            Ok(joined) => joined.map_err(|error| RenderError::Other(error.into()))??,
            Err(_) => {
                self.cancel.store(true, Ordering::Relaxed);
                tracing::warn!("job budget exhausted; waiting for the frame loop to stop");
                // the decoders and encoder write into the job directory, so
                // it outlives the render task
                if let Err(error) = render.await {
                    tracing::warn!(%error, "render task ended abnormally after cancellation");
                }
                drop(job_dir);
                return Err(timed_out(&frames_done));
            }
        };
        frames_done.store(outcome.frames, Ordering::Relaxed);

        self.report(RenderProgress::at(RenderStage::Muxing, 0.92));
        let total_secs = Schedule::new(template, &config.timing, config.canvas.fps).total_duration();
        let muxed = job_dir.path().join("final.mp4");
        let mux = MuxRequest {
            video: &video_path,
            clips: &handles,
            spans: &outcome.spans,
            narration: narration.as_deref(),
            narration_mix: config.encoder.narration_mix,
            total_secs,
            audio_bitrate: &config.encoder.audio_bitrate,
            output: &muxed,
        };
        tokio::time::timeout_at(deadline, run_mux(&ffmpeg, &mux))
            .await
            .map_err(|_| timed_out(&frames_done))??;

        publish(&muxed, &self.output).await?;
        drop(job_dir);

        self.report(RenderProgress::at(RenderStage::Done, 1.0));
        Ok(JobOutcome {
            job_id: self.id.clone(),
            output: self.output.clone(),
            mode: outcome.mode,
            frames: outcome.frames,
            duration_secs: total_secs,
            elapsed_secs: started.elapsed().as_secs_f64(),
            diagnostics: outcome.diagnostics,
        })
    }
}

async fn publish(source: &Path, output: &Path) -> RenderResult<()> {
    if let Some(parent) = output.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    if tokio::fs::rename(source, output).await.is_err() {
        tokio::fs::copy(source, output).await?;
    }
    Ok(())
}

pub async fn render_still_png(
    config: Arc<RenderConfig>,
    request: RenderRequest,
    t: f64,
    output: &Path,
) -> RenderResult<()> {
    let fonts = validate_job(&config, &request)?;
    let job_dir = create_job_dir(&config)?;
    let staged = stage_inputs(&request, job_dir.path()).await?;
    let prepared = tokio::time::timeout(config.timeouts.job(), prepare(&config, staged, fonts))
        .await
        .map_err(|_| RenderError::Timeout {
            budget: config.timeouts.job(),
            frames_done: 0,
        })??;

    let template = prepared.request.template;
    let still = {
        let config = Arc::clone(&config);
        tokio::task::spawn_blocking(move || {
            let (mut compositor, handles, ffmpeg) = prepared.compositor(&config);
            let players = start_players(&handles, &ffmpeg, template, &config)?;
            let mut playback = PlaybackController::new(players, compositor.schedule().clone());
            render_still(
                &mut compositor,
                &mut playback,
                t,
                config.timeouts.seek_poll_interval(),
                config.timeouts.seek_poll_attempts,
            )
        })
        .await
        .map_err(|error| RenderError::Other(error.into()))??
    };

    if let Some(parent) = output.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    still
        .save_png(output)
        .map_err(|error| RenderError::Other(anyhow::anyhow!("failed to write {}: {error}", output.display())))?;
    drop(job_dir);
    Ok(())
}

#[derive(Clone)]
pub struct JobRunner {
    config: Arc<RenderConfig>,
    permits: Arc<Semaphore>,
}

impl JobRunner {
    pub fn new(config: RenderConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));
        Self {
            config: Arc::new(config),
            permits,
        }
    }

    pub fn config(&self) -> &Arc<RenderConfig> {
        &self.config
    }

    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn submit(
        &self,
        request: RenderRequest,
        output: impl Into<PathBuf>,
        progress: Option<ProgressCallback>,
    ) -> JoinHandle<RenderResult<JobOutcome>> {
        let mut job = RenderJob::new(Arc::clone(&self.config), request, output);
        if let Some(progress) = progress {
            job = job.with_progress(progress);
        }
        let permits = Arc::clone(&self.permits);
        tokio::spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|_| RenderError::Cancelled)?;
            job.run().await
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::request::{ClipRef, Labels, TemplateKind};

    fn grid_request(dir: &Path, clips: usize) -> RenderRequest {
        RenderRequest {
            template: TemplateKind::Grid4,
            clips: (0..clips)
                .map(|index| {
                    let path = dir.join(format!("in{index}.mp4"));
                    std::fs::write(&path, b"not really video").unwrap();
                    ClipRef {
                        path,
                        trim_start: 0.0,
                    }
                })
                .collect(),
            labels: Labels::default(),
            cta_image: None,
            narration: None,
        }
    }

    fn config_in(root: &Path) -> RenderConfig {
        let mut config = RenderConfig::default();
        config.temp_root = Some(root.to_path_buf());
        config
    }

    fn entries(dir: &Path) -> usize {
        std::fs::read_dir(dir).map(|read| read.count()).unwrap_or(0)
    }

    #[test]
    fn progress_stays_below_one_until_done() {
        assert_eq!(RenderProgress::rendering(0.0).fraction, 0.1);
        assert!(RenderProgress::rendering(5.0).fraction <= MAX_LOOP_PROGRESS);
        assert_eq!(RenderProgress::at(RenderStage::Muxing, 3.0).fraction, MAX_LOOP_PROGRESS);
        assert_eq!(RenderProgress::at(RenderStage::Done, 0.0).fraction, 1.0);
    }

    #[test]
    fn job_ids_are_unique() {
        assert_ne!(next_job_id(), next_job_id());
    }

    #[test]
    fn staged_names_keep_extension() {
        assert_eq!(staged_name("clip0", Path::new("/in/a.MOV")), "clip0.MOV");
        assert_eq!(staged_name("cta", Path::new("/in/image")), "cta");
    }

    #[tokio::test]
    async fn invalid_request_fails_before_temp_dir() {
        let inputs = tempfile::tempdir().unwrap();
        let root = inputs.path().join("jobs");
        let request = grid_request(inputs.path(), 3);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let job = RenderJob::new(Arc::new(config_in(&root)), request, inputs.path().join("out.mp4"))
            .with_progress(Arc::new(move |progress: RenderProgress| sink.lock().unwrap().push(progress.stage)));

        let err = job.run().await.unwrap_err();
        assert_eq!(err.kind(), "validation_error");
        assert!(!root.exists());
        assert_eq!(*seen.lock().unwrap(), vec![RenderStage::Validating]);
    }

    #[tokio::test]
    async fn missing_font_is_validation_error() {
        let inputs = tempfile::tempdir().unwrap();
        let root = inputs.path().join("jobs");
        let mut config = config_in(&root);
        config.fonts.body = Some(inputs.path().join("missing.ttf"));
        let job = RenderJob::new(
            Arc::new(config),
            grid_request(inputs.path(), 4),
            inputs.path().join("out.mp4"),
        );
        let err = job.run().await.unwrap_err();
        assert_eq!(err.kind(), "validation_error");
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn staging_copies_into_job_dir() {
        let inputs = tempfile::tempdir().unwrap();
        let job_dir = tempfile::tempdir().unwrap();
        let mut request = grid_request(inputs.path(), 4);
        request.cta_image = Some(inputs.path().join("absent.png"));

        let staged = stage_inputs(&request, job_dir.path()).await.unwrap();
        for (index, clip) in staged.clips.iter().enumerate() {
            assert_eq!(clip.path, job_dir.path().join(format!("clip{index}.mp4")));
            assert!(clip.path.is_file());
        }
        assert!(staged.cta_image.is_none());
        assert_eq!(entries(job_dir.path()), 4);
    }

    #[tokio::test]
    async fn runner_slots_follow_config() {
        let mut config = RenderConfig::default();
        config.max_concurrent_jobs = 3;
        let runner = JobRunner::new(config);
        assert_eq!(runner.available_slots(), 3);
        assert_eq!(runner.config().max_concurrent_jobs, 3);
    }

    #[tokio::test]
    async fn runner_reports_job_errors() {
        let inputs = tempfile::tempdir().unwrap();
        let runner = JobRunner::new(config_in(&inputs.path().join("jobs")));
        let handle = runner.submit(grid_request(inputs.path(), 2), inputs.path().join("out.mp4"), None);
        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), "validation_error");
        assert_eq!(runner.available_slots(), 2);
    }
}
