//! Running detection statistics shared between the capture loop and the HTTP endpoints.
//!
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

use serde::{Deserialize, Serialize};

use crate::{meter::FpsMeter, nn::Detection};

/// Maximum number of frames kept in the detection history.
pub const HISTORY_LEN: usize = 50;

/// A detected object as reported to the dashboard.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct DetectedObject {
    pub class: String,
    /// Confidence in percent.
    pub confidence: f32,
}

impl From<&Detection> for DetectedObject {
    fn from(detection: &Detection) -> Self {
        Self {
            class: detection.label.to_owned(),
            confidence: detection.confidence * 100.0,
        }
    }
}

/// Detections of one frame.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub timestamp: String,
    pub objects: Vec<DetectedObject>,
}

/// Point-in-time view of the statistics, serialized by the `/stats` endpoint.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub total_objects: u64,
    pub avg_confidence: f64,
    pub fps: f64,
    /// Newest entry first.
    pub detection_history: Vec<HistoryEntry>,
    pub is_detecting: bool,
}

#[derive(Default)]
struct Counters {
    total_objects: u64,
    confidence_sum: f64,
    history: VecDeque<HistoryEntry>,
}

/// Statistics aggregator.
///
/// Counters and history live behind one mutex. The frame rate and the detection flag are plain
/// atomics written by a single party each.
pub struct DetectionStats {
    counters: Mutex<Counters>,
    meter: FpsMeter,
    frames_processed: AtomicU64,
    active_streams: AtomicUsize,
    is_detecting: AtomicBool,
}

impl DetectionStats {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(Counters {
                history: VecDeque::with_capacity(HISTORY_LEN + 1),
                ..Default::default()
            }),
            meter: FpsMeter::new(),
            frames_processed: AtomicU64::new(0),
            active_streams: AtomicUsize::new(0),
            is_detecting: AtomicBool::new(true),
        }
    }

    fn counters(&self) -> MutexGuard<'_, Counters> {
        // Counters stay consistent even if a holder panicked
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add the detections of one frame, stamped with the current local time.
    pub fn record_frame(&self, objects: Vec<DetectedObject>) {
        let timestamp = chrono::Local::now().format("%H:%M:%S").to_string();
        self.record_frame_at(timestamp, objects);
    }

    /// Add the detections of one frame.
    ///
    /// Frames without objects only count towards the totals, they do not create a history entry.
    pub fn record_frame_at(&self, timestamp: String, objects: Vec<DetectedObject>) {
        let frame_confidence_sum: f64 = objects.iter().map(|o| o.confidence as f64).sum();

        let mut counters = self.counters();
        counters.total_objects += objects.len() as u64;
        counters.confidence_sum += frame_confidence_sum;

        if !objects.is_empty() {
            counters.history.push_front(HistoryEntry { timestamp, objects });
            counters.history.truncate(HISTORY_LEN);
        }
    }

    /// Register a processed frame for the frame rate, whether or not detection ran on it.
    pub fn tick_frame(&self) {
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
        self.meter.tick();
    }

    /// A video stream started delivering frames.
    ///
    /// The frame rate covers all frames processed by the server, so it restarts with the first
    /// stream only.
    pub fn stream_started(&self) {
        if self.active_streams.fetch_add(1, Ordering::Relaxed) == 0 {
            self.meter.restart();
        }
    }

    /// A video stream stopped; the frame rate drops to zero once no stream is left.
    pub fn stream_ended(&self) {
        if self.active_streams.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.meter.reset();
        }
    }

    pub fn active_streams(&self) -> usize {
        self.active_streams.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let counters = self.counters();
        let avg_confidence = match counters.total_objects {
            0 => 0.0,
            n => counters.confidence_sum / n as f64,
        };

        StatsSnapshot {
            total_objects: counters.total_objects,
            avg_confidence: round_to(avg_confidence, 2),
            fps: round_to(self.fps() as f64, 1),
            detection_history: counters.history.iter().cloned().collect(),
            is_detecting: self.is_detecting(),
        }
    }

    pub fn total_objects(&self) -> u64 {
        self.counters().total_objects
    }

    /// Sum of all recorded confidences in percent.
    pub fn confidence_sum(&self) -> f64 {
        self.counters().confidence_sum
    }

    pub fn history_len(&self) -> usize {
        self.counters().history.len()
    }

    pub fn fps(&self) -> f32 {
        self.meter.fps()
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed.load(Ordering::Relaxed)
    }

    pub fn is_detecting(&self) -> bool {
        self.is_detecting.load(Ordering::Relaxed)
    }

    pub fn set_detecting(&self, enabled: bool) {
        self.is_detecting.store(enabled, Ordering::Relaxed);
    }
}

impl Default for DetectionStats {
    fn default() -> Self {
        Self::new()
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10_f64.powi(decimals);
    (value * factor).round() / factor
}

#[cfg(test)]
mod test {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::meter::FPS_WINDOW;

    fn object(class: &str, confidence: f32) -> DetectedObject {
        DetectedObject {
            class: class.into(),
            confidence,
        }
    }

    #[test]
    fn test_empty_stats() {
        let snapshot = DetectionStats::new().snapshot();

        assert_eq!(snapshot.total_objects, 0);
        assert_eq!(snapshot.avg_confidence, 0.0);
        assert_eq!(snapshot.fps, 0.0);
        assert!(snapshot.detection_history.is_empty());
        assert!(snapshot.is_detecting);
    }

    #[test]
    fn test_totals_are_sums_over_frames() {
        let stats = DetectionStats::new();
        stats.record_frame(vec![object("person", 90.0), object("dog", 60.0)]);
        stats.record_frame(vec![]);
        stats.record_frame(vec![object("cat", 75.5)]);

        assert_eq!(stats.total_objects(), 3);
        assert!((stats.confidence_sum() - 225.5).abs() < 1.0e-6);
        assert_eq!(stats.history_len(), 2);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.avg_confidence, 75.17);
        assert_eq!(snapshot.detection_history[0].objects, vec![object("cat", 75.5)]);
    }

    #[test]
    fn test_history_is_bounded_newest_first() {
        let stats = DetectionStats::new();
        for i in 0..=HISTORY_LEN {
            stats.record_frame_at(format!("t{i}"), vec![object("person", 50.0)]);
        }

        let history = stats.snapshot().detection_history;
        assert_eq!(history.len(), HISTORY_LEN);
        assert_eq!(history[0].timestamp, format!("t{HISTORY_LEN}"));
        assert_eq!(history[HISTORY_LEN - 1].timestamp, "t1");
        assert!(history.iter().all(|entry| entry.timestamp != "t0"));
        assert_eq!(stats.total_objects(), HISTORY_LEN as u64 + 1);
    }

    #[test]
    fn test_toggle_detection_flag() {
        let stats = DetectionStats::new();
        stats.set_detecting(false);
        assert!(!stats.snapshot().is_detecting);
        stats.set_detecting(true);
        assert!(stats.snapshot().is_detecting);
    }

    #[test]
    fn test_timestamp_format() {
        let stats = DetectionStats::new();
        stats.record_frame(vec![object("person", 50.0)]);

        let timestamp = &stats.snapshot().detection_history[0].timestamp;
        assert_eq!(timestamp.len(), 8);
        assert_eq!(timestamp.matches(':').count(), 2);
    }

    #[test]
    fn test_snapshot_json_layout() -> Result<(), serde_json::Error> {
        let stats = DetectionStats::new();
        stats.record_frame_at("12:00:00".into(), vec![object("person", 80.0)]);

        let json = serde_json::to_value(stats.snapshot())?;
        assert_eq!(json["total_objects"], 1);
        assert_eq!(json["avg_confidence"], 80.0);
        assert_eq!(json["detection_history"][0]["timestamp"], "12:00:00");
        assert_eq!(json["detection_history"][0]["objects"][0]["class"], "person");
        assert_eq!(json["is_detecting"], true);

        Ok(())
    }

    #[test]
    fn test_fps_drops_to_zero_after_last_stream() {
        let stats = DetectionStats::new();
        stats.stream_started();
        stats.stream_started();
        assert_eq!(stats.active_streams(), 2);

        let start = Instant::now();
        for i in 1..=FPS_WINDOW {
            stats.meter.tick_at(start + Duration::from_millis(40) * i);
        }
        assert!(stats.fps() > 0.0);

        stats.stream_ended();
        assert!(stats.fps() > 0.0);

        stats.stream_ended();
        assert_eq!(stats.active_streams(), 0);
        assert_eq!(stats.fps(), 0.0);
        assert_eq!(stats.snapshot().fps, 0.0);
    }

    #[test]
    fn test_round_to() {
        assert_eq!(round_to(75.16666, 2), 75.17);
        assert_eq!(round_to(29.96, 1), 30.0);
    }
}
