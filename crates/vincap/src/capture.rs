// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! The queue/dequeue state machine.
//!
//! Every slot cycles `Free -> Queued -> Ready -> Held -> Queued`. The device
//! may complete slots in any order; a slot that completes before the one a
//! caller is waiting for stays `Ready` until it is picked.
//!
//! ```no_run
//! # use vincap::{CaptureHandle, CaptureType, MemoryType, fourcc::FourCC};
//! # let mut handle = CaptureHandle::open("/dev/video0", CaptureType::Any)?;
//! handle.set_pixel_format(FourCC::NV12, 640, 480)?;
//! handle.request_buffers(4, MemoryType::Mmap)?;
//! handle.queue_all()?;
//! handle.streamon()?;
//!
//! let frame = handle.pick(0)?;
//! println!("slot 0 at {:?}", frame.as_ptr(0));
//! handle.release(0)?;
//! # Ok::<(), vincap::Error>(())
//! ```

use std::{os::fd::AsFd, ptr::NonNull, slice, time::Duration};

use unix_ts::Timestamp;
use vincap_sys as ffi;

use crate::{
    device::CaptureHandle,
    geometry::FrameGeometry,
    pacing::FrameTiming,
    pool::{PlaneView, SlotState},
    v4l2::Readiness,
    Error, MemoryType,
};

/// What the device reported for a dequeued frame, plus its pacing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameInfo {
    pub index: u32,
    /// Kernel sequence number
    pub sequence: u32,
    /// Driver timestamp on `CLOCK_MONOTONIC`, if it set one
    pub device_timestamp: Option<Duration>,
    /// Bytes of valid data per plane
    pub bytesused: Vec<u32>,
    /// The driver flagged the buffer with `V4L2_BUF_FLAG_ERROR`
    pub corrupted: bool,
    pub timing: FrameTiming,
}

impl FrameInfo {
    pub fn timestamp(&self) -> Option<Timestamp> {
        self.device_timestamp
            .map(|ts| Timestamp::new(ts.as_secs() as i64, ts.subsec_nanos()))
    }
}

/// Raw view of a held slot returned by [`CaptureHandle::pick`].
///
/// The pointers stay valid until the pool is torn down; the contents are only
/// stable until the slot is released.
#[derive(Debug, Clone)]
pub struct PickedFrame {
    pub(crate) planes: Vec<PlaneView>,
    pub(crate) info: FrameInfo,
}

impl PickedFrame {
    pub fn index(&self) -> u32 {
        self.info.index
    }

    pub fn n_planes(&self) -> usize {
        self.planes.len()
    }

    pub fn as_ptr(&self, plane: usize) -> Option<NonNull<u8>> {
        self.planes.get(plane).map(|p| p.ptr)
    }

    /// Mapped length of a plane.
    pub fn plane_len(&self, plane: usize) -> usize {
        self.planes.get(plane).map_or(0, |p| p.len)
    }

    pub fn info(&self) -> &FrameInfo {
        &self.info
    }
}

/// Slice a plane down to the bytes the driver filled.
///
/// # Safety
///
/// `view` must describe a live mapping that nothing writes to for `'a`.
pub(crate) unsafe fn plane_bytes<'a>(view: &PlaneView, bytesused: Option<u32>) -> &'a [u8] {
    let len = match bytesused {
        Some(used) if used > 0 && (used as usize) <= view.len => used as usize,
        _ => view.len,
    };
    // SAFETY: guaranteed by the caller.
    unsafe { slice::from_raw_parts(view.ptr.as_ptr(), len) }
}

impl CaptureHandle {
    /// Submit a free slot to the device.
    ///
    /// Only legal from [`SlotState::Free`]; a second queue without an
    /// intervening dequeue is rejected before it reaches the kernel.
    pub fn queue(&mut self, index: u32) -> Result<(), Error> {
        let n_planes = self.n_planes();
        let driver = self.driver.as_deref().ok_or(Error::Closed)?;
        let pool = self.pool.as_mut().ok_or(Error::NoBuffers)?;
        let memory = pool.memory;
        if memory != MemoryType::Mmap {
            return Err(Error::Unsupported("queueing buffers without process memory"));
        }

        let slot = pool.slot_mut(index)?;
        if slot.state != SlotState::Free {
            log::debug!("buffer {}: queue rejected, {}", index, slot.state);
            return Err(Error::InvalidState {
                index: Some(index),
                state: slot.state.name(),
            });
        }

        self.ops.queue(driver, memory, index, n_planes)?;
        slot.state = SlotState::Queued;
        log::debug!("buffer {}: free -> queued", index);
        Ok(())
    }

    /// Queue every free slot. Returns how many were queued.
    pub fn queue_all(&mut self) -> Result<u32, Error> {
        let free: Vec<u32> = match &self.pool {
            Some(pool) => pool
                .slots
                .iter()
                .filter(|s| s.state == SlotState::Free)
                .map(|s| s.mapped.index())
                .collect(),
            None => return Err(Error::NoBuffers),
        };
        for &index in &free {
            self.queue(index)?;
        }
        Ok(free.len() as u32)
    }

    /// Block until the device completes a buffer, then dequeue it.
    ///
    /// Returns the slot index, now [`SlotState::Ready`]. Without a wait
    /// timeout this blocks until a frame arrives or the
    /// [`Interrupter`](crate::Interrupter) fires.
    pub fn wait_and_dequeue(&mut self) -> Result<u32, Error> {
        let n_planes = self.n_planes();
        let driver = self.driver.as_deref().ok_or(Error::Closed)?;
        match &self.pool {
            Some(pool) if pool.count(SlotState::Queued) > 0 => {}
            _ => return Err(Error::NoBuffers),
        }
        if !self.streaming {
            return Err(Error::NotStreaming);
        }

        match driver
            .wait(self.wake_rx.as_fd(), self.wait_timeout)
            .map_err(crate::ioctl_error("poll", None))?
        {
            Readiness::Ready => {}
            Readiness::Interrupted => {
                self.drain_interrupts();
                log::debug!("wait interrupted");
                return Err(Error::Interrupted);
            }
            Readiness::TimedOut => {
                log::debug!("no frame within {:?}", self.wait_timeout);
                return Err(Error::Timeout);
            }
        }

        let pool = self.pool.as_mut().ok_or(Error::NoBuffers)?;
        let dequeued = self.ops.dequeue(driver, pool.memory, n_planes)?;
        let index = dequeued.index;
        let slot = pool.slot_mut(index)?;
        if slot.state != SlotState::Queued {
            log::error!("device returned buffer {} which is {}", index, slot.state);
            return Err(Error::InvalidState {
                index: Some(index),
                state: slot.state.name(),
            });
        }

        let timing = self
            .session
            .stamp(dequeued.sequence, dequeued.timestamp, self.clock.now());
        let corrupted = dequeued.flags & ffi::V4L2_BUF_FLAG_ERROR != 0;
        if corrupted {
            log::warn!("buffer {} flagged corrupt by the driver", index);
        }

        slot.frame = Some(FrameInfo {
            index,
            sequence: dequeued.sequence,
            device_timestamp: dequeued.timestamp,
            bytesused: dequeued.bytesused,
            corrupted,
            timing,
        });
        slot.state = SlotState::Ready;
        log::debug!("buffer {}: queued -> ready (seq {})", index, dequeued.sequence);
        Ok(index)
    }

    /// Wait for slot `index` specifically and hand it to the caller.
    ///
    /// A free slot is queued first. Other slots completing in the meantime
    /// stay ready for their own pick.
    pub fn pick(&mut self, index: u32) -> Result<PickedFrame, Error> {
        if self.driver.is_none() {
            return Err(Error::Closed);
        }
        if !self.streaming {
            return Err(Error::NotStreaming);
        }

        match self.slot_state(index) {
            None if self.pool.is_none() => return Err(Error::NoBuffers),
            None => {
                return Err(Error::InvalidState {
                    index: Some(index),
                    state: "out of range",
                })
            }
            Some(SlotState::Free) => self.queue(index)?,
            Some(SlotState::Held) => {
                return Err(Error::InvalidState {
                    index: Some(index),
                    state: SlotState::Held.name(),
                })
            }
            Some(SlotState::Queued | SlotState::Ready) => {}
        }

        while self.slot_state(index) != Some(SlotState::Ready) {
            let done = self.wait_and_dequeue()?;
            if done != index {
                log::debug!("buffer {} completed while waiting for {}", done, index);
            }
        }

        self.hold(index)
    }

    fn hold(&mut self, index: u32) -> Result<PickedFrame, Error> {
        let pool = self.pool.as_mut().ok_or(Error::NoBuffers)?;
        let slot = pool.slot_mut(index)?;
        let info = slot.frame.clone().ok_or(Error::InvalidState {
            index: Some(index),
            state: "ready without frame",
        })?;
        slot.state = SlotState::Held;
        log::debug!("buffer {}: ready -> held", index);
        Ok(PickedFrame {
            planes: slot.mapped.views(),
            info,
        })
    }

    /// Give a ready or held slot back to the device.
    ///
    /// When the stream is off the slot becomes free instead. If re-queueing
    /// fails the slot is left free and the error returned.
    pub fn release(&mut self, index: u32) -> Result<(), Error> {
        let n_planes = self.n_planes();
        let streaming = self.streaming;
        let driver = self.driver.as_deref().ok_or(Error::Closed)?;
        let pool = self.pool.as_mut().ok_or(Error::NoBuffers)?;
        let memory = pool.memory;
        let slot = pool.slot_mut(index)?;

        if !matches!(slot.state, SlotState::Ready | SlotState::Held) {
            return Err(Error::InvalidState {
                index: Some(index),
                state: slot.state.name(),
            });
        }

        let previous = slot.state;
        slot.state = SlotState::Free;
        slot.frame = None;
        if !streaming {
            log::debug!("buffer {}: {} -> free", index, previous);
            return Ok(());
        }

        self.ops.queue(driver, memory, index, n_planes)?;
        slot.state = SlotState::Queued;
        log::debug!("buffer {}: {} -> queued", index, previous);
        Ok(())
    }

    /// Take the next completed frame, in completion order.
    ///
    /// The slot is released when the returned frame drops.
    pub fn read(&mut self) -> Result<CapturedFrame<'_>, Error> {
        if !self.streaming {
            return Err(Error::NotStreaming);
        }

        let ready = self.pool.as_ref().and_then(|pool| {
            pool.slots
                .iter()
                .filter(|s| s.state == SlotState::Ready)
                .min_by_key(|s| s.frame.as_ref().map(|f| f.sequence))
                .map(|s| s.mapped.index())
        });
        let index = match ready {
            Some(index) => index,
            None => self.wait_and_dequeue()?,
        };

        let picked = self.hold(index)?;
        Ok(CapturedFrame {
            handle: self,
            picked,
        })
    }

    /// Bound every future wait. `None`, the default, waits forever.
    pub fn set_wait_timeout(&mut self, timeout: Option<Duration>) {
        self.wait_timeout = timeout;
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout
    }

    /// Minimum and maximum latency the pool introduces: one frame, and one
    /// frame per slot.
    pub fn latency(&self) -> Option<(Duration, Duration)> {
        let min = self.session.frame_duration()?;
        Some((min, min * self.slot_count().max(1)))
    }

    /// Frames the device dropped since stream on.
    pub fn lost_frames(&self) -> u64 {
        self.session.lost_total()
    }

    /// True once a device timestamp was rejected in the current stream.
    pub fn has_bad_timestamp(&self) -> bool {
        self.session.has_bad_timestamp()
    }
}

/// A frame held by [`CaptureHandle::read`], released on drop.
#[derive(Debug)]
pub struct CapturedFrame<'a> {
    handle: &'a mut CaptureHandle,
    picked: PickedFrame,
}

impl CapturedFrame<'_> {
    pub fn index(&self) -> u32 {
        self.picked.index()
    }

    pub fn n_planes(&self) -> usize {
        self.picked.n_planes()
    }

    /// Filled bytes of one plane; empty when the plane does not exist.
    pub fn plane(&self, plane: usize) -> &[u8] {
        match self.picked.planes.get(plane) {
            // SAFETY: the slot is held, so the device does not write to it,
            // and the mapping lives as long as the borrowed handle's pool.
            Some(view) => unsafe {
                plane_bytes(view, self.picked.info.bytesused.get(plane).copied())
            },
            None => &[],
        }
    }

    pub fn info(&self) -> &FrameInfo {
        &self.picked.info
    }

    pub fn timing(&self) -> &FrameTiming {
        &self.picked.info.timing
    }

    pub fn timestamp(&self) -> Option<Timestamp> {
        self.picked.info.timestamp()
    }

    pub fn geometry(&self) -> Option<&FrameGeometry> {
        self.handle.geometry()
    }
}

impl Drop for CapturedFrame<'_> {
    fn drop(&mut self) {
        let index = self.picked.index();
        if let Err(err) = self.handle.release(index) {
            log::warn!("failed to release buffer {}: {}", index, err);
        }
    }
}
