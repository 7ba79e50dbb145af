//! Clocks that drive the frame loop.
//!
//! Offline renders step through exact frame times. Live renders sample a
//! monotonic clock anchored at render start, rate-limited to the target
//! frame rate.

use std::time::{Duration, Instant};

/// Monotonic time source for live rendering.
pub trait TimeSource {
    fn now_ns(&self) -> u64;
    fn sleep(&mut self, duration: Duration);
}

/// Monotonic timestamps relative to the moment rendering started.
#[derive(Debug, Clone)]
pub struct WallClock {
    epoch: Instant,
    /// Wall-clock time at epoch, RFC 3339.
    epoch_wall: String,
}

impl WallClock {
    pub fn start() -> Self {
        Self {
            epoch: Instant::now(),
            epoch_wall: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    pub fn epoch_wall(&self) -> &str {
        &self.epoch_wall
    }

    pub fn ns_to_secs(ns: u64) -> f64 {
        ns as f64 / 1_000_000_000.0
    }
}

impl TimeSource for WallClock {
    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Admits at most one tick per frame interval.
#[derive(Debug)]
pub struct RateController {
    target_interval_ns: u64,
    last_tick_ns: Option<u64>,
}

impl RateController {
    pub fn new(target_hz: u32) -> Self {
        Self {
            target_interval_ns: 1_000_000_000 / u64::from(target_hz.max(1)),
            last_tick_ns: None,
        }
    }

    /// True, and records the tick, once a full interval has passed. The
    /// first call always ticks.
    pub fn should_tick(&mut self, current_ns: u64) -> bool {
        match self.last_tick_ns {
            None => {
                self.last_tick_ns = Some(current_ns);
                true
            }
            Some(last) if current_ns >= last + self.target_interval_ns => {
                self.last_tick_ns = Some(current_ns);
                true
            }
            _ => false,
        }
    }

    /// Time left until the next tick is admitted.
    pub fn until_next(&self, current_ns: u64) -> Duration {
        match self.last_tick_ns {
            None => Duration::ZERO,
            Some(last) => {
                Duration::from_nanos((last + self.target_interval_ns).saturating_sub(current_ns))
            }
        }
    }

    pub fn interval_ns(&self) -> u64 {
        self.target_interval_ns
    }
}

/// A frame to draw: its sequence number and render time in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tick {
    pub frame: u64,
    pub t: f64,
}

pub trait FrameClock {
    /// The next frame to draw, or `None` once the render is complete.
    fn next_tick(&mut self) -> Option<Tick>;

    /// Render seconds covered so far.
    fn elapsed(&self) -> f64;
}

/// Exact frame times `index / fps` for `frame_count` frames.
#[derive(Debug, Clone)]
pub struct StepClock {
    next: u64,
    frame_count: u64,
    fps: u32,
}

impl StepClock {
    pub fn new(frame_count: u64, fps: u32) -> Self {
        Self {
            next: 0,
            frame_count,
            fps,
        }
    }
}

impl FrameClock for StepClock {
    fn next_tick(&mut self) -> Option<Tick> {
        if self.next >= self.frame_count {
            return None;
        }
        let frame = self.next;
        self.next += 1;
        Some(Tick {
            frame,
            t: frame as f64 / f64::from(self.fps),
        })
    }

    fn elapsed(&self) -> f64 {
        self.next as f64 / f64::from(self.fps)
    }
}

/// Real-time ticks: sleeps until the rate limiter admits the next frame
/// and stamps it with elapsed time. Ends once `total` seconds have passed.
pub struct PacedClock<S: TimeSource> {
    source: S,
    rate: RateController,
    total: f64,
    ticks: u64,
    last_t: f64,
}

impl<S: TimeSource> PacedClock<S> {
    pub fn new(source: S, fps: u32, total: f64) -> Self {
        Self {
            source,
            rate: RateController::new(fps),
            total,
            ticks: 0,
            last_t: 0.0,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }
}

impl<S: TimeSource> FrameClock for PacedClock<S> {
    fn next_tick(&mut self) -> Option<Tick> {
        loop {
            let now = self.source.now_ns();
            let t = WallClock::ns_to_secs(now);
            if t >= self.total {
                self.last_t = self.total;
                return None;
            }
            if self.rate.should_tick(now) {
                let frame = self.ticks;
                self.ticks += 1;
                self.last_t = t;
                return Some(Tick { frame, t });
            }
            let wait = self.rate.until_next(now);
            self.source.sleep(wait.max(Duration::from_micros(200)));
        }
    }

    fn elapsed(&self) -> f64 {
        self.last_t
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Time that only moves when slept on, or when advanced by hand.
    pub(crate) struct ManualTime {
        pub now_ns: u64,
    }

    impl TimeSource for ManualTime {
        fn now_ns(&self) -> u64 {
            self.now_ns
        }

        fn sleep(&mut self, duration: Duration) {
            self.now_ns += duration.as_nanos() as u64;
        }
    }

    #[test]
    fn rate_controller_spaces_ticks() {
        let mut ctrl = RateController::new(60);
        assert!(ctrl.should_tick(0));
        assert!(!ctrl.should_tick(1_000_000));
        assert_eq!(ctrl.until_next(1_000_000), Duration::from_nanos(15_666_666));
        assert!(ctrl.should_tick(17_000_000));
    }

    #[test]
    fn step_clock_yields_exact_frame_times() {
        let mut clock = StepClock::new(3, 30);
        let ticks: Vec<_> = std::iter::from_fn(|| clock.next_tick()).collect();
        assert_eq!(ticks.len(), 3);
        assert_eq!(ticks[2], Tick { frame: 2, t: 2.0 / 30.0 });
        assert!((clock.elapsed() - 0.1).abs() < 1e-12);
    }

    #[test]
    fn paced_clock_stops_at_total_duration() {
        let mut clock = PacedClock::new(ManualTime { now_ns: 0 }, 10, 1.0);
        let ticks: Vec<_> = std::iter::from_fn(|| clock.next_tick()).collect();
        assert_eq!(ticks.len(), 10);
        assert!(ticks.windows(2).all(|pair| pair[1].t > pair[0].t));
        assert_eq!(clock.elapsed(), 1.0);
    }

    #[test]
    fn paced_clock_skips_ahead_when_host_is_slow() {
        let mut clock = PacedClock::new(ManualTime { now_ns: 0 }, 10, 1.0);
        assert_eq!(clock.next_tick().map(|tick| tick.frame), Some(0));
        clock.source.now_ns = 550_000_000;
        let tick = clock.next_tick().unwrap();
        assert_eq!(tick.frame, 1);
        assert!((tick.t - 0.55).abs() < 1e-9);
    }

    #[test]
    fn wall_clock_starts_near_zero() {
        let clock = WallClock::start();
        assert!(clock.elapsed_secs() < 1.0);
        assert!(!clock.epoch_wall().is_empty());
    }
}
