use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Context, Result};

use crate::clock::Tick;
use crate::config::{FfmpegMode, RenderConfig};
use crate::error::{RenderError, RenderResult};

pub fn resolve_ffmpeg(config: &RenderConfig) -> Result<PathBuf> {
    match config.encoder.ffmpeg_mode {
        FfmpegMode::System => Ok(config.encoder.ffmpeg_path.clone()),
        FfmpegMode::Sidecar => {
            #[cfg(feature = "sidecar_ffmpeg")]
            {
                let path = ffmpeg_sidecar::paths::ffmpeg_path();
                if !path.exists() {
                    ffmpeg_sidecar::download::auto_download()
                        .context("failed to auto-download ffmpeg sidecar binary")?;
                }
                Ok(path)
            }
            #[cfg(not(feature = "sidecar_ffmpeg"))]
            {
                Err(anyhow!(
                    "ffmpeg sidecar mode requested but reelcast was built without `sidecar_ffmpeg`. Rebuild with `--features sidecar_ffmpeg`."
                ))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoOutputSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub crf: u8,
    pub preset: String,
}

impl VideoOutputSettings {
    pub fn from_config(config: &RenderConfig) -> Self {
        Self {
            width: config.canvas.width,
            height: config.canvas.height,
            fps: config.canvas.fps,
            crf: config.encoder.crf,
            preset: config.encoder.preset.clone(),
        }
    }

    pub fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

pub struct FfmpegPipe {
    sender: Option<mpsc::SyncSender<Vec<u8>>>,
    worker: Option<JoinHandle<RenderResult<()>>>,
    frames_sent: u64,
}

trait VideoEncoderBackend: Send {
    fn mode_label(&self) -> &'static str;
    fn run(self: Box<Self>, receiver: mpsc::Receiver<Vec<u8>>) -> RenderResult<()>;
}

struct SystemFfmpegBackend {
    ffmpeg: PathBuf,
    settings: VideoOutputSettings,
    output_path: PathBuf,
}

#[cfg(feature = "sidecar_ffmpeg")]
struct SidecarFfmpegBackend {
    settings: VideoOutputSettings,
    output_path: PathBuf,
}

impl FfmpegPipe {
    pub fn spawn(
        config: &RenderConfig,
        ffmpeg: &Path,
        output_path: &Path,
    ) -> RenderResult<Self> {
        let settings = VideoOutputSettings::from_config(config);
        let backend = select_backend(
            config.encoder.ffmpeg_mode,
            ffmpeg.to_path_buf(),
            settings,
            output_path.to_path_buf(),
        )?;
        let (sender, receiver) = mpsc::sync_channel::<Vec<u8>>(config.encoder.frame_buffer.max(1));
        let worker_name = format!("reelcast-encoder-{}", backend.mode_label());

        let worker = thread::Builder::new()
            .name(worker_name)
            .spawn(move || backend.run(receiver))
            .context("failed to spawn ffmpeg writer thread")?;

        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
            frames_sent: 0,
        })
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    pub fn write_frame(&mut self, rgba_frame: Vec<u8>) -> RenderResult<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| RenderError::encoding("encoder has already been finalized"))?;
        if sender.send(rgba_frame).is_ok() {
            self.frames_sent += 1;
            return Ok(());
        }
        drop(self.sender.take());
        let frame = self.frames_sent;
        match self.join_worker() {
            Err(RenderError::Encoding {
                message,
                stderr_tail,
                ..
            }) => Err(RenderError::Encoding {
                message,
                frame: Some(frame),
                stderr_tail,
            }),
            Err(other) => Err(other),
            Ok(()) => Err(RenderError::Encoding {
                message: "encoder pipe closed before all frames were written".to_owned(),
                frame: Some(frame),
                stderr_tail: String::new(),
            }),
        }
    }

    pub fn finish(mut self) -> RenderResult<u64> {
        drop(self.sender.take());
        self.join_worker()?;
        Ok(self.frames_sent)
    }

    fn join_worker(&mut self) -> RenderResult<()> {
        let handle = self
            .worker
            .take()
            .ok_or_else(|| RenderError::encoding("ffmpeg worker thread missing"))?;
        match handle.join() {
            Ok(result) => result,
            Err(_) => Err(RenderError::encoding("ffmpeg worker thread panicked")),
        }
    }
}

impl Drop for FfmpegPipe {
    // an abandoned pipe still waits for ffmpeg so nothing writes into a
    // job directory after it is removed
    fn drop(&mut self) {
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn select_backend(
    mode: FfmpegMode,
    ffmpeg: PathBuf,
    settings: VideoOutputSettings,
    output_path: PathBuf,
) -> RenderResult<Box<dyn VideoEncoderBackend>> {
    match mode {
        FfmpegMode::System => Ok(Box::new(SystemFfmpegBackend {
            ffmpeg,
            settings,
            output_path,
        })),
        FfmpegMode::Sidecar => {
            #[cfg(feature = "sidecar_ffmpeg")]
            {
                let _ = ffmpeg;
                Ok(Box::new(SidecarFfmpegBackend {
                    settings,
                    output_path,
                }))
            }
            #[cfg(not(feature = "sidecar_ffmpeg"))]
            {
                let _ = (ffmpeg, settings, output_path);
                Err(RenderError::encoding(
                    "ffmpeg sidecar mode requested but reelcast was built without `sidecar_ffmpeg`. Rebuild with `--features sidecar_ffmpeg`.",
                ))
            }
        }
    }
}

impl VideoEncoderBackend for SystemFfmpegBackend {
    fn mode_label(&self) -> &'static str {
        "system"
    }

    fn run(self: Box<Self>, receiver: mpsc::Receiver<Vec<u8>>) -> RenderResult<()> {
        run_ffmpeg_process(
            &self.ffmpeg,
            receiver,
            &self.settings,
            &self.output_path,
            self.mode_label(),
        )
    }
}

#[cfg(feature = "sidecar_ffmpeg")]
impl VideoEncoderBackend for SidecarFfmpegBackend {
    fn mode_label(&self) -> &'static str {
        "sidecar"
    }

    fn run(self: Box<Self>, receiver: mpsc::Receiver<Vec<u8>>) -> RenderResult<()> {
        let path = ffmpeg_sidecar::paths::ffmpeg_path();
        if !path.exists() {
            ffmpeg_sidecar::download::auto_download()
                .context("failed to auto-download ffmpeg sidecar binary")?;
        }
        run_ffmpeg_process(
            &path,
            receiver,
            &self.settings,
            &self.output_path,
            self.mode_label(),
        )
    }
}

fn run_ffmpeg_process(
    ffmpeg_path: &Path,
    receiver: mpsc::Receiver<Vec<u8>>,
    settings: &VideoOutputSettings,
    output_path: &Path,
    mode_label: &str,
) -> RenderResult<()> {
    let args = video_encode_args(settings, output_path);
    let mut child = Command::new(ffmpeg_path)
        .args(args.iter().map(String::as_str))
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                RenderError::encoding(format!(
                    "ffmpeg executable not found (mode={mode_label}, resolved_path={}). Install ffmpeg or set REELCAST_FFMPEG.",
                    ffmpeg_path.display()
                ))
            } else {
                RenderError::encoding(format!(
                    "failed to spawn ffmpeg process (mode={mode_label}, resolved_path={}): {error}",
                    ffmpeg_path.display()
                ))
            }
        })?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| RenderError::encoding("failed to capture ffmpeg stdin"))?;
    let mut stderr_pipe = child.stderr.take();

    let mut written = 0u64;
    let mut write_error = None;
    while let Ok(frame) = receiver.recv() {
        if let Err(error) = stdin.write_all(&frame) {
            write_error = Some(error);
            break;
        }
        written += 1;
    }
    // stop accepting frames so the producer sees a closed pipe
    drop(receiver);
    if write_error.is_none() {
        if let Err(error) = stdin.flush() {
            write_error = Some(error);
        }
    }
    drop(stdin);

    let status = child.wait().context("failed waiting for ffmpeg process")?;
    let stderr_tail = read_stderr_tail(&mut stderr_pipe);
    if !status.success() || write_error.is_some() {
        let reason = match write_error {
            Some(error) => format!("failed to write frame {written} to ffmpeg: {error}"),
            None => format!("ffmpeg exited with {status}"),
        };
        return Err(RenderError::Encoding {
            message: format!("{reason} (mode={mode_label}, args='{}')", args.join(" ")),
            frame: Some(written),
            stderr_tail,
        });
    }
    tracing::debug!(frames = written, output = %output_path.display(), "video encode finished");
    Ok(())
}

pub fn video_encode_args(settings: &VideoOutputSettings, output_path: &Path) -> Vec<String> {
    let size = format!("{}x{}", settings.width, settings.height);
    let fps = settings.fps.to_string();
    let mut args = ffmpeg_rawvideo_input_args(&size, &fps);
    args.extend(h264_output_args(settings));
    args.push(output_path.to_string_lossy().into_owned());
    args
}

pub fn ffmpeg_rawvideo_input_args(size: &str, fps: &str) -> Vec<String> {
    vec![
        "-hide_banner".to_owned(),
        "-loglevel".to_owned(),
        "error".to_owned(),
        "-y".to_owned(),
        "-f".to_owned(),
        "rawvideo".to_owned(),
        "-pix_fmt".to_owned(),
        "rgba".to_owned(),
        "-s:v".to_owned(),
        size.to_owned(),
        "-r".to_owned(),
        fps.to_owned(),
        "-i".to_owned(),
        "-".to_owned(),
        "-an".to_owned(),
    ]
}

pub fn h264_output_args(settings: &VideoOutputSettings) -> Vec<String> {
    vec![
        "-c:v".to_owned(),
        "libx264".to_owned(),
        "-preset".to_owned(),
        settings.preset.clone(),
        "-crf".to_owned(),
        settings.crf.to_string(),
        "-pix_fmt".to_owned(),
        "yuv420p".to_owned(),
        "-g".to_owned(),
        (settings.fps * 2).to_string(),
        "-bf".to_owned(),
        "0".to_owned(),
        "-movflags".to_owned(),
        "+faststart".to_owned(),
    ]
}

pub(crate) fn read_stderr_tail(stderr: &mut Option<std::process::ChildStderr>) -> String {
    let Some(mut pipe) = stderr.take() else {
        return String::new();
    };
    let mut buf = Vec::new();
    if pipe.read_to_end(&mut buf).is_err() {
        return String::new();
    }
    last_n_chars(&String::from_utf8_lossy(&buf), 500)
}

pub(crate) fn last_n_chars(s: &str, max_chars: usize) -> String {
    let mut chars = s.chars().collect::<Vec<_>>();
    if chars.len() > max_chars {
        chars = chars[chars.len().saturating_sub(max_chars)..].to_vec();
    }
    chars.into_iter().collect::<String>().trim().to_owned()
}

pub trait FrameSink {
    fn submit(&mut self, rgba: &[u8], tick: Tick) -> RenderResult<()>;

    fn frames_written(&self) -> u64;

    fn finish(self: Box<Self>) -> RenderResult<u64>;
}

pub struct ExactSink {
    pipe: FfmpegPipe,
}

impl ExactSink {
    pub fn new(pipe: FfmpegPipe) -> Self {
        Self { pipe }
    }
}

impl FrameSink for ExactSink {
    fn submit(&mut self, rgba: &[u8], _tick: Tick) -> RenderResult<()> {
        self.pipe.write_frame(rgba.to_vec())
    }

    fn frames_written(&self) -> u64 {
        self.pipe.frames_sent()
    }

    fn finish(self: Box<Self>) -> RenderResult<u64> {
        self.pipe.finish()
    }
}

pub struct CaptureStream<W: FrameWriter> {
    writer: W,
    fps: u32,
    frame_count: u64,
    written: u64,
    last: Vec<u8>,
}

pub trait FrameWriter {
    fn write(&mut self, rgba: Vec<u8>) -> RenderResult<()>;
    fn close(self) -> RenderResult<()>;
}

impl FrameWriter for FfmpegPipe {
    fn write(&mut self, rgba: Vec<u8>) -> RenderResult<()> {
        self.write_frame(rgba)
    }

    fn close(self) -> RenderResult<()> {
        self.finish().map(|_| ())
    }
}

impl<W: FrameWriter> CaptureStream<W> {
    pub fn new(writer: W, fps: u32, frame_count: u64) -> Self {
        Self {
            writer,
            fps,
            frame_count,
            written: 0,
            last: Vec::new(),
        }
    }

    pub fn due_frames(&self, t: f64) -> u64 {
        let due = (t.max(0.0) * f64::from(self.fps)).floor() as u64 + 1;
        due.min(self.frame_count)
    }
}

impl<W: FrameWriter> FrameSink for CaptureStream<W> {
    fn submit(&mut self, rgba: &[u8], tick: Tick) -> RenderResult<()> {
        let due = self.due_frames(tick.t);
        if due > self.written + 1 {
            tracing::trace!(
                repeated = due - self.written - 1,
                t = tick.t,
                "capture repeating previous image"
            );
        }
        while self.written + 1 < due && !self.last.is_empty() {
            self.writer.write(self.last.clone())?;
            self.written += 1;
        }
        if self.written < due {
            self.writer.write(rgba.to_vec())?;
            self.written += 1;
        }
        self.last.clear();
        self.last.extend_from_slice(rgba);
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.written
    }

    fn finish(mut self: Box<Self>) -> RenderResult<u64> {
        if self.last.is_empty() && self.written < self.frame_count {
            return Err(RenderError::encoding("live capture received no frames"));
        }
        let padding = self.frame_count - self.written;
        if padding > 0 {
            tracing::debug!(padding, "padding live capture to full length");
        }
        while self.written < self.frame_count {
            let frame = self.last.clone();
            self.writer.write(frame)?;
            self.written += 1;
        }
        let written = self.written;
        let this = *self;
        this.writer.close()?;
        Ok(written)
    }
}
