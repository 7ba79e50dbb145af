use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use tiny_skia::{IntSize, Pixmap};

use crate::media::{wrap_source_time, MediaHandle};

#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub pts: f64,
    pub pixmap: Pixmap,
}

pub enum DecodeStatus {
    Frame(VideoFrame),
    Pending,
    Ended,
}

pub struct FrameDecoder {
    receiver: Option<mpsc::Receiver<Vec<u8>>>,
    worker: Option<JoinHandle<Result<()>>>,
    child: Child,
    start: f64,
    fps: u32,
    size: IntSize,
    produced: u64,
}

const FRAME_QUEUE: usize = 4;

impl FrameDecoder {
    pub fn spawn(
        ffmpeg: &Path,
        input_path: &Path,
        start: f64,
        fps: u32,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let size = IntSize::from_wh(width, height)
            .ok_or_else(|| anyhow!("invalid decode size {width}x{height}"))?;
        let (sender, receiver) = mpsc::sync_channel::<Vec<u8>>(FRAME_QUEUE);

        let mut child = Command::new(ffmpeg)
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-ss")
            .arg(format!("{start:.3}"))
            .arg("-i")
            .arg(input_path)
            .arg("-an")
            .arg("-f")
            .arg("rawvideo")
            .arg("-pix_fmt")
            .arg("rgba")
            .arg("-r")
            .arg(fps.to_string())
            .arg("-s")
            .arg(format!("{width}x{height}"))
            .arg("-sws_flags")
            .arg("area")
            .arg("pipe:1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to spawn {} decoder", ffmpeg.display()))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("failed to capture ffmpeg stdout"))?;
        let frame_size = rgba_frame_len(width, height);

        let worker = thread::Builder::new()
            .name("reelcast-decoder".to_owned())
            .spawn(move || {
                loop {
                    let mut buffer = vec![0u8; frame_size];
                    match stdout.read_exact(&mut buffer) {
                        Ok(()) => {
                            if sender.send(buffer).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                        Err(e) => return Err(anyhow!("failed to read from ffmpeg: {e}")),
                    }
                }
                Ok(())
            })
            .context("failed to spawn ffmpeg reader thread")?;

        Ok(Self {
            receiver: Some(receiver),
            worker: Some(worker),
            child,
            start,
            fps,
            size,
            produced: 0,
        })
    }

    pub fn start(&self) -> f64 {
        self.start
    }

    pub fn try_next(&mut self) -> DecodeStatus {
        let Some(receiver) = self.receiver.as_ref() else {
            return DecodeStatus::Ended;
        };
        match receiver.try_recv() {
            Ok(buffer) => self.wrap(buffer),
            Err(TryRecvError::Empty) => DecodeStatus::Pending,
            Err(TryRecvError::Disconnected) => DecodeStatus::Ended,
        }
    }

    pub fn next_timeout(&mut self, timeout: Duration) -> DecodeStatus {
        let Some(receiver) = self.receiver.as_ref() else {
            return DecodeStatus::Ended;
        };
        match receiver.recv_timeout(timeout) {
            Ok(buffer) => self.wrap(buffer),
            Err(RecvTimeoutError::Timeout) => DecodeStatus::Pending,
            Err(RecvTimeoutError::Disconnected) => DecodeStatus::Ended,
        }
    }

    fn wrap(&mut self, buffer: Vec<u8>) -> DecodeStatus {
        let pts = self.start + self.produced as f64 / f64::from(self.fps);
        self.produced += 1;
        match Pixmap::from_vec(buffer, self.size) {
            Some(pixmap) => DecodeStatus::Frame(VideoFrame { pts, pixmap }),
            None => DecodeStatus::Ended,
        }
    }

    pub fn finish(mut self) -> Result<()> {
        let _ = self.child.kill();
        let _ = self.child.wait();
        // unblocks a reader parked on a full queue
        drop(self.receiver.take());

        match self.worker.take() {
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(anyhow!("ffmpeg reader thread panicked")),
            },
            None => Ok(()),
        }
    }
}

impl Drop for FrameDecoder {
    fn drop(&mut self) {
        if self.worker.is_some() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

pub fn rgba_frame_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * 4
}

pub fn decode_size(source: (u32, u32), target: (u32, u32)) -> (u32, u32) {
    let (sw, sh) = (source.0.max(1) as f64, source.1.max(1) as f64);
    let scale = (target.0 as f64 / sw).max(target.1 as f64 / sh).min(1.0);
    let even = |value: f64| (((value / 2.0).round() as u32) * 2).max(2);
    (even(sw * scale), even(sh * scale))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerState {
    Unloaded,
    Loading,
    Ready,
    Seeking,
    Playing,
    Paused,
    Failed,
}

pub struct ClipPlayer {
    handle: MediaHandle,
    ffmpeg: PathBuf,
    fps: u32,
    size: (u32, u32),
    state: PlayerState,
    resume: PlayerState,
    muted: bool,
    looping: bool,
    decoder: Option<FrameDecoder>,
    pending: Option<VideoFrame>,
    latest: Option<Arc<VideoFrame>>,
    anchor: (f64, f64),
    position: f64,
    last_error: Option<String>,
}

impl ClipPlayer {
    pub fn new(handle: MediaHandle, ffmpeg: PathBuf, fps: u32, target: (u32, u32)) -> Self {
        let size = decode_size((handle.info.width, handle.info.height), target);
        let position = handle.source_time(0.0);
        Self {
            handle,
            ffmpeg,
            fps,
            size,
            state: PlayerState::Unloaded,
            resume: PlayerState::Ready,
            muted: true,
            looping: false,
            decoder: None,
            pending: None,
            latest: None,
            anchor: (position, 0.0),
            position,
            last_error: None,
        }
    }

    pub fn index(&self) -> usize {
        self.handle.index
    }

    pub fn handle(&self) -> &MediaHandle {
        &self.handle
    }

    pub fn state(&self) -> PlayerState {
        self.state
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    pub fn is_looping(&self) -> bool {
        self.looping
    }

    pub fn set_looping(&mut self, looping: bool) {
        self.looping = looping;
    }

    pub fn cached_frame(&self) -> Option<Arc<VideoFrame>> {
        self.latest.clone()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn duration(&self) -> f64 {
        self.handle.info.duration
    }

    pub fn load(&mut self) -> Result<()> {
        self.state = PlayerState::Loading;
        self.resume = PlayerState::Ready;
        let start = self.handle.source_time(0.0);
        self.restart_decoder(start)
    }

    pub fn seek(&mut self, source: f64) -> Result<()> {
        if self.state == PlayerState::Failed {
            return Err(self.failure());
        }
        let target = wrap_source_time(source, self.duration());
        if self.state != PlayerState::Seeking {
            self.resume = match self.state {
                PlayerState::Playing | PlayerState::Paused => self.state,
                _ => PlayerState::Ready,
            };
        }
        self.state = PlayerState::Seeking;
        self.position = target;
        self.restart_decoder(target)
    }

    pub fn play(&mut self, clock: f64) {
        if self.state == PlayerState::Failed {
            return;
        }
        self.anchor = (self.position, clock);
        if self.state == PlayerState::Seeking || self.state == PlayerState::Loading {
            self.resume = PlayerState::Playing;
        } else {
            self.state = PlayerState::Playing;
        }
    }

    pub fn pause(&mut self, clock: f64) {
        if self.state == PlayerState::Failed {
            return;
        }
        self.position = self.position_at(clock);
        if self.state == PlayerState::Seeking || self.state == PlayerState::Loading {
            self.resume = PlayerState::Paused;
        } else {
            self.state = PlayerState::Paused;
        }
    }

    pub fn is_playing(&self) -> bool {
        self.state == PlayerState::Playing
            || (self.state == PlayerState::Seeking && self.resume == PlayerState::Playing)
    }

    pub fn position_at(&self, clock: f64) -> f64 {
        if !self.is_playing() {
            return self.position;
        }
        let raw = self.anchor.0 + (clock - self.anchor.1).max(0.0);
        if self.looping {
            wrap_source_time(raw, self.duration())
        } else {
            raw.min(self.duration())
        }
    }

    pub fn latest_frame(&mut self, clock: f64) -> Option<Arc<VideoFrame>> {
        if self.state == PlayerState::Failed {
            return self.latest.clone();
        }
        if self.is_playing() {
            let raw = self.anchor.0 + (clock - self.anchor.1).max(0.0);
            if self.looping && raw >= self.duration() {
                let wrapped = wrap_source_time(raw, self.duration());
                self.anchor = (wrapped, clock);
                self.position = wrapped;
                tracing::trace!(clip = self.index(), "loop wrap");
                if let Err(error) = self.restart_decoder(wrapped) {
                    self.fail(&error);
                    return self.latest.clone();
                }
                self.drain_until(wrapped);
            } else {
                self.position = raw.min(self.duration());
                self.drain_until(raw);
            }
        } else {
            // paused or still loading: surface the first frame only
            if self.latest.is_none() || self.state == PlayerState::Seeking {
                self.drain_until(self.position);
            }
        }
        self.latest.clone()
    }

    pub fn poll_frame_at(
        &mut self,
        source: f64,
        interval: Duration,
        attempts: u32,
    ) -> Result<Arc<VideoFrame>> {
        if self.state == PlayerState::Failed {
            return Err(self.failure());
        }
        let target = wrap_source_time(source, self.duration());
        let tolerance = 0.5 / f64::from(self.fps);
        let cursor = self
            .latest
            .as_ref()
            .map(|frame| frame.pts)
            .or_else(|| self.decoder.as_ref().map(FrameDecoder::start));
        let needs_seek = match cursor {
            None => true,
            Some(cursor) => target + tolerance < cursor || target > cursor + 1.0,
        };
        if needs_seek {
            self.seek(target)?;
        }
        self.position = target;

        for _ in 0..attempts.max(1) {
            let frame = match self.pending.take() {
                Some(frame) => DecodeStatus::Frame(frame),
                None => match self.decoder.as_mut() {
                    Some(decoder) => decoder.next_timeout(interval),
                    None => DecodeStatus::Ended,
                },
            };
            match frame {
                DecodeStatus::Frame(frame) => {
                    let due = frame.pts + tolerance >= target;
                    self.accept(frame);
                    if due {
                        return self.latest.clone().ok_or_else(|| anyhow!("frame vanished"));
                    }
                }
                DecodeStatus::Pending => {}
                DecodeStatus::Ended => {
                    // clip ran out a hair early; hold its last frame
                    return self.latest.clone().ok_or_else(|| {
                        anyhow!("decoder ended before producing a frame at {target:.3}s")
                    });
                }
            }
        }
        Err(anyhow!(
            "no frame at {target:.3}s after {} polls",
            attempts.max(1)
        ))
    }

    fn drain_until(&mut self, source: f64) {
        let tolerance = 0.5 / f64::from(self.fps);
        loop {
            let frame = match self.pending.take() {
                Some(frame) => frame,
                None => match self.decoder.as_mut().map(FrameDecoder::try_next) {
                    Some(DecodeStatus::Frame(frame)) => frame,
                    Some(DecodeStatus::Pending) | Some(DecodeStatus::Ended) | None => return,
                },
            };
            let first = self.latest.is_none() || self.state == PlayerState::Seeking;
            if frame.pts <= source + tolerance || first {
                self.accept(frame);
            } else {
                self.pending = Some(frame);
                return;
            }
        }
    }

    fn accept(&mut self, frame: VideoFrame) {
        if matches!(self.state, PlayerState::Seeking | PlayerState::Loading) {
            self.state = self.resume;
        }
        self.latest = Some(Arc::new(frame));
    }

    fn restart_decoder(&mut self, start: f64) -> Result<()> {
        if let Some(old) = self.decoder.take() {
            if let Err(error) = old.finish() {
                tracing::debug!(clip = self.index(), %error, "previous decoder ended with error");
            }
        }
        self.pending = None;
        match FrameDecoder::spawn(
            &self.ffmpeg,
            &self.handle.path,
            start,
            self.fps,
            self.size.0,
            self.size.1,
        ) {
            Ok(decoder) => {
                self.decoder = Some(decoder);
                Ok(())
            }
            Err(error) => {
                self.fail(&error);
                Err(error)
            }
        }
    }

    fn fail(&mut self, error: &anyhow::Error) {
        tracing::warn!(clip = self.index(), error = %format!("{error:#}"), "clip player failed");
        self.state = PlayerState::Failed;
        self.last_error = Some(format!("{error:#}"));
        self.decoder = None;
    }

    fn failure(&self) -> anyhow::Error {
        anyhow!(
            "clip {} unavailable: {}",
            self.index(),
            self.last_error.as_deref().unwrap_or("player failed")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaInfo;

    fn handle(duration: f64, trim_start: f64) -> MediaHandle {
        MediaHandle {
            index: 1,
            path: PathBuf::from("/no/such/clip.mp4"),
            trim_start,
            info: MediaInfo {
                width: 1920,
                height: 1080,
                duration,
                has_audio: true,
            },
        }
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn frame_len_does_not_wrap_for_large_sources() {
        assert_eq!(rgba_frame_len(1080, 1920), 1080 * 1920 * 4);
        assert_eq!(rgba_frame_len(40_000, 40_000), 6_400_000_000);
        assert!(rgba_frame_len(40_000, 40_000) > u32::MAX as usize);
    }

    #[test]
    fn decode_size_covers_target_without_upscaling() {
        assert_eq!(decode_size((1920, 1080), (540, 960)), (1706, 960));
        assert_eq!(decode_size((320, 240), (1080, 1920)), (320, 240));
        assert_eq!(decode_size((1081, 1921), (1080, 1920)), (1080, 1920));
    }

    #[test]
    fn new_player_is_unloaded_and_muted() {
        let player = ClipPlayer::new(handle(4.0, 1.0), PathBuf::from("ffmpeg"), 30, (1080, 1920));
        assert_eq!(player.state(), PlayerState::Unloaded);
        assert!(player.is_muted());
        assert!(!player.is_looping());
        assert_eq!(player.position_at(10.0), 1.0);
    }

    #[test]
    fn missing_binary_fails_the_player() {
        let mut player = ClipPlayer::new(
            handle(4.0, 0.0),
            PathBuf::from("/no/such/ffmpeg"),
            30,
            (1080, 1920),
        );
        assert!(player.load().is_err());
        assert_eq!(player.state(), PlayerState::Failed);
        assert!(player.latest_frame(0.5).is_none());
        let err = player
            .poll_frame_at(0.5, Duration::from_millis(1), 3)
            .unwrap_err();
        assert!(err.to_string().contains("clip 1 unavailable"));
    }

    #[test]
    fn looping_position_wraps_against_duration() {
        let mut player = ClipPlayer::new(handle(4.0, 1.0), PathBuf::from("ffmpeg"), 30, (2, 2));
        player.set_looping(true);
        player.state = PlayerState::Ready;
        player.play(10.0);
        assert!(player.is_playing());
        assert!((player.position_at(12.0) - 3.0).abs() < 1e-9);
        assert!((player.position_at(14.0) - 1.0).abs() < 1e-9);

        player.set_looping(false);
        assert_eq!(player.position_at(20.0), 4.0);
    }

    #[test]
    fn pause_freezes_position() {
        let mut player = ClipPlayer::new(handle(6.0, 0.0), PathBuf::from("ffmpeg"), 30, (2, 2));
        player.state = PlayerState::Ready;
        player.play(0.0);
        player.pause(2.5);
        assert_eq!(player.state(), PlayerState::Paused);
        assert!((player.position_at(9.0) - 2.5).abs() < 1e-9);
        player.play(9.0);
        assert!((player.position_at(10.0) - 3.5).abs() < 1e-9);
    }
}
