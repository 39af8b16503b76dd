// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use serde::Serialize;
use std::time::{Duration, Instant};

/// Capture metrics collected during a run
#[derive(Debug, Clone, Serialize)]
pub struct CaptureMetrics {
    /// Total number of frames captured
    pub frames_captured: u64,
    /// Total payload bytes captured
    pub bytes_captured: u64,
    /// Total duration in milliseconds
    pub duration_ms: u64,
    /// Average throughput in frames per second
    pub throughput_fps: f64,
    /// Average bandwidth in megabits per second
    pub bandwidth_mbps: f64,
    /// Minimum presentation interval in microseconds
    pub interval_min_us: u64,
    /// Maximum presentation interval in microseconds
    pub interval_max_us: u64,
    /// 50th percentile (median) interval in microseconds
    pub interval_p50_us: u64,
    /// 99th percentile interval in microseconds
    pub interval_p99_us: u64,
    /// Frames the device reported as dropped
    pub lost_frames: u64,
    /// Whether device timestamps were replaced by synthetic ones
    pub bad_timestamps: bool,
}

/// Metrics collector for tracking capture performance
pub struct MetricsCollector {
    start_time: Instant,
    frames: u64,
    bytes: u64,
    last_pts: Option<Duration>,
    intervals_us: Vec<u64>,
    lost_frames: u64,
    bad_timestamps: bool,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            frames: 0,
            bytes: 0,
            last_pts: None,
            intervals_us: Vec::new(),
            lost_frames: 0,
            bad_timestamps: false,
        }
    }

    /// Record one frame with its payload size and presentation time
    pub fn record_frame(&mut self, bytes: u64, pts: Option<Duration>) {
        self.frames += 1;
        self.bytes += bytes;

        if let Some(pts) = pts {
            if let Some(last) = self.last_pts {
                match pts.checked_sub(last) {
                    Some(delta) => self.intervals_us.push(delta.as_micros() as u64),
                    None => log::warn!("Presentation time went backwards: {:?} -> {:?}", last, pts),
                }
            }
            self.last_pts = Some(pts);
        }
    }

    /// Record the device drop counters, taken from the capture handle
    pub fn record_session(&mut self, lost_frames: u64, bad_timestamps: bool) {
        self.lost_frames = lost_frames;
        self.bad_timestamps = bad_timestamps;
    }

    /// Finalize and calculate all metrics
    pub fn finalize(&mut self) -> CaptureMetrics {
        let duration = self.start_time.elapsed();
        let duration_secs = duration.as_secs_f64();

        let throughput_fps = if duration_secs > 0.0 {
            self.frames as f64 / duration_secs
        } else {
            0.0
        };

        let bandwidth_mbps = if duration_secs > 0.0 {
            (self.bytes as f64 * 8.0) / (duration_secs * 1_000_000.0)
        } else {
            0.0
        };

        self.intervals_us.sort_unstable();

        CaptureMetrics {
            frames_captured: self.frames,
            bytes_captured: self.bytes,
            duration_ms: duration.as_millis() as u64,
            throughput_fps,
            bandwidth_mbps,
            interval_min_us: self.intervals_us.first().copied().unwrap_or(0),
            interval_max_us: self.intervals_us.last().copied().unwrap_or(0),
            interval_p50_us: self.percentile(50.0),
            interval_p99_us: self.percentile(99.0),
            lost_frames: self.lost_frames,
            bad_timestamps: self.bad_timestamps,
        }
    }

    /// Calculate percentile from sorted interval data
    /// Assumes self.intervals_us is already sorted
    fn percentile(&self, p: f64) -> u64 {
        if self.intervals_us.is_empty() {
            return 0;
        }

        let len = self.intervals_us.len();
        let idx = ((p / 100.0) * (len - 1) as f64).round() as usize;
        self.intervals_us[idx.min(len - 1)]
    }

    /// Print metrics in human-readable format
    pub fn print_text(&mut self) {
        let metrics = self.finalize();
        println!("\n=== Capture Metrics ===");
        println!("Frames captured:   {}", metrics.frames_captured);
        println!(
            "Bytes captured:    {} ({:.2} MB)",
            metrics.bytes_captured,
            metrics.bytes_captured as f64 / 1_048_576.0
        );
        println!(
            "Duration:          {:.2} s",
            metrics.duration_ms as f64 / 1000.0
        );
        println!("Throughput:        {:.2} fps", metrics.throughput_fps);
        println!("Bandwidth:         {:.2} Mbps", metrics.bandwidth_mbps);

        if metrics.frames_captured > 1 {
            println!("\nFrame Interval (us):");
            println!("  Min:    {}", metrics.interval_min_us);
            println!("  Max:    {}", metrics.interval_max_us);
            println!("  P50:    {}", metrics.interval_p50_us);
            println!("  P99:    {}", metrics.interval_p99_us);
        }

        println!("\nLost frames:       {}", metrics.lost_frames);
        if metrics.bad_timestamps {
            println!("Timestamps:        synthetic (device timestamps rejected)");
        }
    }

    /// Print metrics in JSON format
    pub fn print_json(&mut self) -> Result<(), serde_json::Error> {
        let metrics = self.finalize();
        let json = serde_json::to_string_pretty(&metrics)?;
        println!("{}", json);
        Ok(())
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Option<Duration> {
        Some(Duration::from_millis(v))
    }

    #[test]
    fn test_interval_percentiles() {
        let mut collector = MetricsCollector::new();

        // Frames at 0, 10, 30, 60 ... ms: intervals 10, 20, 30, ..., 100
        let mut pts = 0;
        collector.record_frame(100, ms(pts));
        for i in 1..=10 {
            pts += i * 10;
            collector.record_frame(100, ms(pts));
        }

        let metrics = collector.finalize();
        assert_eq!(metrics.frames_captured, 11);
        assert_eq!(metrics.bytes_captured, 1100);
        assert_eq!(metrics.interval_min_us, 10_000);
        assert_eq!(metrics.interval_max_us, 100_000);
        assert_eq!(metrics.interval_p50_us, 60_000);
        assert_eq!(metrics.interval_p99_us, 100_000);
    }

    #[test]
    fn test_missing_pts_skips_interval() {
        let mut collector = MetricsCollector::new();
        collector.record_frame(10, ms(0));
        collector.record_frame(10, None);
        collector.record_frame(10, ms(40));

        let metrics = collector.finalize();
        assert_eq!(metrics.frames_captured, 3);
        assert_eq!(metrics.interval_min_us, 40_000);
    }

    #[test]
    fn test_session_counters() {
        let mut collector = MetricsCollector::new();
        collector.record_session(3, true);
        let metrics = collector.finalize();
        assert_eq!(metrics.lost_frames, 3);
        assert!(metrics.bad_timestamps);
    }

    #[test]
    fn test_throughput_calculation() {
        let mut collector = MetricsCollector::new();

        for i in 0..30 {
            collector.record_frame(100_000, ms(i * 33));
        }

        std::thread::sleep(Duration::from_millis(100));

        let metrics = collector.finalize();
        assert_eq!(metrics.frames_captured, 30);
        assert_eq!(metrics.bytes_captured, 3_000_000);

        // Roughly 300 fps (30 frames / 0.1 sec)
        assert!(metrics.throughput_fps > 100.0 && metrics.throughput_fps < 400.0);
    }

    #[test]
    fn test_empty_metrics() {
        let mut collector = MetricsCollector::new();
        let metrics = collector.finalize();

        assert_eq!(metrics.frames_captured, 0);
        assert_eq!(metrics.bytes_captured, 0);
        assert_eq!(metrics.interval_min_us, 0);
        assert_eq!(metrics.interval_max_us, 0);
    }
}
