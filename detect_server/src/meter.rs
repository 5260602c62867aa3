//! Frame rate measurement.
//!
use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::{Duration, Instant},
};

use tokio::{task::JoinHandle, time::interval};

use crate::stats::DetectionStats;

/// Number of frames after which the frame rate is recomputed.
pub const FPS_WINDOW: u32 = 30;

/// Counts processed frames and derives the frame rate over windows of [`FPS_WINDOW`] frames.
pub struct FpsMeter {
    window: Mutex<Window>,
    fps_bits: AtomicU32,
}

struct Window {
    frames: u32,
    start: Instant,
}

impl FpsMeter {
    pub fn new() -> Self {
        Self {
            window: Mutex::new(Window {
                frames: 0,
                start: Instant::now(),
            }),
            fps_bits: AtomicU32::new(0.0_f32.to_bits()),
        }
    }

    /// Register one processed frame.
    pub fn tick(&self) {
        self.tick_at(Instant::now());
    }

    pub(crate) fn tick_at(&self, now: Instant) {
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        window.frames += 1;

        if window.frames == FPS_WINDOW {
            let elapsed = now.saturating_duration_since(window.start).as_secs_f32();
            if elapsed > 0.0 {
                self.fps_bits
                    .store((FPS_WINDOW as f32 / elapsed).to_bits(), Ordering::Relaxed);
            }
            window.frames = 0;
            window.start = now;
        }
    }

    /// Restart the current window, e.g. when a new stream begins.
    pub fn restart(&self) {
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        window.frames = 0;
        window.start = Instant::now();
    }

    /// Restart the current window and report no frame rate until it completes.
    pub fn reset(&self) {
        self.restart();
        self.fps_bits.store(0.0_f32.to_bits(), Ordering::Relaxed);
    }

    pub fn fps(&self) -> f32 {
        f32::from_bits(self.fps_bits.load(Ordering::Relaxed))
    }
}

impl Default for FpsMeter {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodically log the measured frame rate while it is non-zero.
pub fn spawn_meter_logger(stats: Arc<DetectionStats>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut log_interval = interval(period);
        log_interval.tick().await;

        let mut last_frames = stats.frames_processed();
        loop {
            log_interval.tick().await;

            let frames = stats.frames_processed();
            if frames != last_frames {
                log::info!(
                    "Processed frames per second: {:.2} ({} frames total)",
                    stats.fps(),
                    frames
                );
            }
            last_frames = frames;
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_fps_is_zero_before_first_window() {
        let meter = FpsMeter::new();
        for _ in 0..FPS_WINDOW - 1 {
            meter.tick();
        }
        assert_eq!(meter.fps(), 0.0);
    }

    #[test]
    fn test_fps_from_window_duration() {
        let meter = FpsMeter::new();
        let start = Instant::now();
        meter.window.lock().unwrap().start = start;

        for i in 1..=FPS_WINDOW {
            meter.tick_at(start + Duration::from_millis(50) * i);
        }
        // 30 frames in 1.5 s
        assert!((meter.fps() - 20.0).abs() < 1.0e-3);

        // Next window starts at the last tick
        let second_start = start + Duration::from_millis(1500);
        for i in 1..=FPS_WINDOW {
            meter.tick_at(second_start + Duration::from_millis(100) * i);
        }
        assert!((meter.fps() - 10.0).abs() < 1.0e-3);
    }

    #[test]
    fn test_reset_clears_fps() {
        let meter = FpsMeter::new();
        let start = Instant::now();
        meter.window.lock().unwrap().start = start;
        for i in 1..=FPS_WINDOW {
            meter.tick_at(start + Duration::from_millis(10) * i);
        }
        assert!(meter.fps() > 0.0);

        meter.reset();
        assert_eq!(meter.fps(), 0.0);
        assert_eq!(meter.window.lock().unwrap().frames, 0);
    }
}
