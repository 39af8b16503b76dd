// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Presentation timestamps and lost-frame detection.
//!
//! Each dequeued buffer is stamped against the capture clock. Device
//! timestamps are trusted until one of them is absent, lies in the future or
//! trails the clock by more than [`TIMESTAMP_TOLERANCE`]; from then on the
//! session counts frame durations instead and never goes back.

use std::{cell::Cell, fmt, rc::Rc, time::Duration};

use vincap_sys::nix::time::{clock_gettime, ClockId};

/// How far a device timestamp may trail the capture clock.
pub const TIMESTAMP_TOLERANCE: Duration = Duration::from_secs(10);

/// Source of capture time, measured from an arbitrary fixed origin.
pub trait Clock {
    fn now(&self) -> Duration;
}

/// `CLOCK_MONOTONIC`, the clock V4L2 drivers stamp buffers with.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        match clock_gettime(ClockId::CLOCK_MONOTONIC) {
            Ok(ts) => Duration::new(ts.tv_sec() as u64, ts.tv_nsec() as u32),
            Err(err) => {
                log::error!("clock_gettime(CLOCK_MONOTONIC) failed: {}", err);
                Duration::ZERO
            }
        }
    }
}

/// Clock moved by hand. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Rc<Cell<Duration>>);

impl ManualClock {
    pub fn new(start: Duration) -> ManualClock {
        ManualClock(Rc::new(Cell::new(start)))
    }

    pub fn set(&self, now: Duration) {
        self.0.set(now);
    }

    pub fn advance(&self, by: Duration) {
        self.0.set(self.0.get() + by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.0.get()
    }
}

/// Frames the device dropped between two dequeues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LostFrames {
    pub count: u64,
    /// Estimate; zero when the frame duration is unknown
    pub duration: Duration,
}

impl fmt::Display for LostFrames {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} frames ({:?})", self.count, self.duration)
    }
}

/// Timing attached to one produced frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTiming {
    /// Presentation time relative to the first frame of the stream
    pub pts: Option<Duration>,
    pub duration: Option<Duration>,
    /// Kernel sequence number of the frame
    pub offset: u64,
    pub lost: Option<LostFrames>,
}

/// Per-stream pacing state, owned by the capture handle.
#[derive(Debug, Clone, Default)]
pub struct CaptureSession {
    last_offset: Option<u64>,
    last_device_ts: Option<Duration>,
    bad_timestamp: bool,
    frame_duration: Option<Duration>,
    next_synthetic: Duration,
    base_time: Option<Duration>,
    frames: u64,
    lost_total: u64,
}

impl CaptureSession {
    pub fn new() -> CaptureSession {
        CaptureSession::default()
    }

    /// Reset for a new stream. The frame duration is kept.
    pub fn start(&mut self) {
        *self = CaptureSession {
            frame_duration: self.frame_duration,
            ..CaptureSession::default()
        };
    }

    pub fn set_frame_duration(&mut self, duration: Option<Duration>) {
        self.frame_duration = duration.filter(|d| !d.is_zero());
    }

    pub fn frame_duration(&self) -> Option<Duration> {
        self.frame_duration
    }

    /// True once a device timestamp has been rejected in this stream.
    pub fn has_bad_timestamp(&self) -> bool {
        self.bad_timestamp
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn lost_total(&self) -> u64 {
        self.lost_total
    }

    pub fn last_device_timestamp(&self) -> Option<Duration> {
        self.last_device_ts
    }

    /// Stamp one dequeued frame.
    pub fn stamp(
        &mut self,
        sequence: u32,
        device_ts: Option<Duration>,
        now: Duration,
    ) -> FrameTiming {
        let base = *self.base_time.get_or_insert(now);

        if !self.bad_timestamp {
            let reason = match device_ts {
                None => Some("absent"),
                Some(ts) if ts > now => Some("in the future"),
                Some(ts) if now - ts > TIMESTAMP_TOLERANCE => Some("too far in the past"),
                Some(_) => None,
            };
            if let Some(reason) = reason {
                log::warn!(
                    "device timestamp {:?} is {} (clock {:?}), using frame durations from now on",
                    device_ts,
                    reason,
                    now
                );
                self.bad_timestamp = true;
            }
        }

        let offset = u64::from(sequence);
        let lost = match self.last_offset {
            Some(last) if offset > last + 1 => {
                let count = offset - last - 1;
                let duration = self
                    .frame_duration
                    .map_or(Duration::ZERO, |d| d * count as u32);
                log::warn!("lost {} frames before offset {}", count, offset);
                Some(LostFrames { count, duration })
            }
            _ => None,
        };
        self.last_offset = Some(offset);

        let pts = if self.bad_timestamp {
            match self.frame_duration {
                Some(duration) => {
                    if let Some(lost) = lost {
                        self.next_synthetic += lost.duration;
                    }
                    let pts = self.next_synthetic;
                    self.next_synthetic += duration;
                    pts
                }
                None => now.saturating_sub(base),
            }
        } else {
            // Checked above: the timestamp is present.
            let ts = device_ts.unwrap_or(now);
            self.last_device_ts = Some(ts);
            let pts = ts.saturating_sub(base);
            self.next_synthetic = pts + self.frame_duration.unwrap_or_default();
            pts
        };

        self.frames += 1;
        if let Some(lost) = lost {
            self.lost_total += lost.count;
        }

        FrameTiming {
            pts: Some(pts),
            duration: self.frame_duration,
            offset,
            lost,
        }
    }
}
