// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! In-memory capture node.
//!
//! [`VirtualDevice`] answers the same control requests as a V4L2 capture
//! driver, backed by heap buffers instead of device memory. Completed frames
//! are filled with the low byte of their sequence number. Behaviour that real
//! hardware shows only occasionally can be forced: mapping failures,
//! sequence gaps, missing or skewed timestamps, capped buffer counts, coerced
//! frame rates and out-of-order completion.
//!
//! ```
//! use std::rc::Rc;
//! use vincap::v4l2::VirtualDevice;
//! use vincap::{CaptureHandle, CaptureType};
//!
//! let device = Rc::new(VirtualDevice::new().with_max_buffers(2));
//! let handle = CaptureHandle::with_driver(Box::new(device.clone()), "virtual", CaptureType::Any)?;
//! assert_eq!(handle.info().card(), "vincap virtual camera");
//! assert_eq!(device.stats().maps, 0);
//! # Ok::<(), vincap::Error>(())
//! ```

use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, VecDeque},
    ffi::c_void,
    fmt,
    os::fd::BorrowedFd,
    ptr::{self, NonNull},
    slice,
    time::Duration,
};

use vincap_sys as ffi;
use vincap_sys::nix::{
    self,
    errno::Errno,
    libc,
    poll::{poll, PollFd, PollFlags, PollTimeout},
};

use super::driver::{Access, Driver, Readiness};
use crate::{
    format::{self, FormatFlags},
    fourcc::FourCC,
    geometry::FrameGeometry,
    negotiate::Fraction,
    pacing::{Clock, MonotonicClock},
};

/// Frame sizes offered for one format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameSizes {
    Discrete(Vec<(u32, u32)>),
    Stepwise {
        min: (u32, u32),
        max: (u32, u32),
        step: (u32, u32),
    },
}

/// Frame rates offered for every size of one format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameIntervals {
    Discrete(Vec<Fraction>),
    /// Any rate between the two, in frames per second
    Stepwise { slowest: Fraction, fastest: Fraction },
    /// Interval enumeration is not implemented
    Unsupported,
}

/// One format the virtual node advertises.
#[derive(Debug, Clone)]
pub struct VirtualFormat {
    pub fourcc: FourCC,
    pub description: String,
    pub flags: FormatFlags,
    pub sizes: FrameSizes,
    pub intervals: FrameIntervals,
    /// Planes per buffer in multi-plane mode
    pub planes: usize,
}

impl VirtualFormat {
    pub fn discrete(fourcc: FourCC, sizes: &[(u32, u32)], rates: &[Fraction]) -> VirtualFormat {
        VirtualFormat {
            fourcc,
            description: fourcc.to_string(),
            flags: FormatFlags::NONE,
            sizes: FrameSizes::Discrete(sizes.to_vec()),
            intervals: FrameIntervals::Discrete(rates.to_vec()),
            planes: 1,
        }
    }

    pub fn stepwise(
        fourcc: FourCC,
        min: (u32, u32),
        max: (u32, u32),
        step: (u32, u32),
        intervals: FrameIntervals,
    ) -> VirtualFormat {
        VirtualFormat {
            fourcc,
            description: fourcc.to_string(),
            flags: FormatFlags::NONE,
            sizes: FrameSizes::Stepwise { min, max, step },
            intervals,
            planes: 1,
        }
    }

    pub fn with_planes(mut self, planes: usize) -> VirtualFormat {
        self.planes = planes.clamp(1, ffi::VIDEO_MAX_PLANES);
        self
    }

    pub fn with_flags(mut self, flags: FormatFlags) -> VirtualFormat {
        self.flags = flags;
        self
    }

    pub fn with_intervals(mut self, intervals: FrameIntervals) -> VirtualFormat {
        self.intervals = intervals;
        self
    }

    fn supports(&self, width: u32, height: u32) -> bool {
        match &self.sizes {
            FrameSizes::Discrete(sizes) => sizes.contains(&(width, height)),
            FrameSizes::Stepwise { min, max, step } => {
                (min.0..=max.0).contains(&width)
                    && (min.1..=max.1).contains(&height)
                    && (width - min.0) % step.0.max(1) == 0
                    && (height - min.1) % step.1.max(1) == 0
            }
        }
    }

    /// The size the node settles on for a request, rounding up.
    fn coerce(&self, width: u32, height: u32) -> (u32, u32) {
        match &self.sizes {
            FrameSizes::Discrete(sizes) => {
                if sizes.contains(&(width, height)) {
                    return (width, height);
                }
                sizes
                    .iter()
                    .copied()
                    .filter(|&(w, h)| w >= width && h >= height)
                    .min_by_key(|&(w, h)| u64::from(w) * u64::from(h))
                    .or_else(|| sizes.iter().copied().max_by_key(|&(w, h)| u64::from(w) * u64::from(h)))
                    .unwrap_or((width, height))
            }
            FrameSizes::Stepwise { min, max, step } => {
                let round = |v: u32, lo: u32, hi: u32, step: u32| {
                    let step = step.max(1);
                    let v = v.clamp(lo, hi);
                    (lo + (v - lo).div_ceil(step) * step).min(hi)
                };
                (
                    round(width, min.0, max.0, step.0),
                    round(height, min.1, max.1, step.1),
                )
            }
        }
    }

    fn first_size(&self) -> (u32, u32) {
        match &self.sizes {
            FrameSizes::Discrete(sizes) => sizes.first().copied().unwrap_or((640, 480)),
            FrameSizes::Stepwise { max, .. } => *max,
        }
    }

    /// Per-plane (sizeimage, bytesperline).
    fn layout(&self, width: u32, height: u32, multiplanar: bool) -> Vec<(u32, u32)> {
        match format::lookup(self.fourcc) {
            Some(desc) => {
                let geom = FrameGeometry::new(desc, width, height, false);
                if multiplanar && self.planes > 1 && self.planes == geom.n_planes {
                    (0..geom.n_planes)
                        .map(|i| (geom.plane_size(i) as u32, geom.stride[i]))
                        .collect()
                } else {
                    vec![(geom.size as u32, geom.stride[0])]
                }
            }
            None => vec![(width * height * 2, width * 2)],
        }
    }
}

/// How dequeued buffers are timestamped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimestampMode {
    /// `CLOCK_MONOTONIC` at completion
    #[default]
    Monotonic,
    /// Zero, as drivers without timestamps report
    Absent,
    /// A minute behind the clock
    FarPast,
    /// A minute ahead of the clock
    Future,
}

/// Counters for checking the node's resource balance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VirtualStats {
    pub map_attempts: u32,
    pub maps: u32,
    pub unmaps: u32,
    pub qbufs: u32,
    pub dqbufs: u32,
    pub streamons: u32,
    pub streamoffs: u32,
    pub reqbufs: u32,
}

impl VirtualStats {
    pub fn live_mappings(&self) -> u32 {
        self.maps - self.unmaps
    }
}

struct Storage {
    ptr: NonNull<u8>,
    len: usize,
}

impl Storage {
    fn new(len: usize) -> Storage {
        let boxed = vec![0u8; len.max(1)].into_boxed_slice();
        let len = boxed.len();
        // Box::into_raw never returns null.
        let ptr = NonNull::new(Box::into_raw(boxed).cast::<u8>()).unwrap_or(NonNull::dangling());
        Storage { ptr, len }
    }

    fn fill(&mut self, value: u8, len: usize) {
        // SAFETY: ptr is a live allocation of self.len bytes.
        unsafe { ptr::write_bytes(self.ptr.as_ptr(), value, len.min(self.len)) };
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from Box::into_raw on a boxed slice of this length.
        drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len)) });
    }
}

struct VirtualBuffer {
    planes: Vec<Storage>,
    queued: bool,
}

struct AppliedFormat {
    format: usize,
    width: u32,
    height: u32,
    planes: Vec<(u32, u32)>,
}

struct State {
    format: Option<AppliedFormat>,
    interval: ffi::v4l2_fract,
    capturemode: u32,
    input: i32,
    memory: u32,
    buffers: Vec<VirtualBuffer>,
    queue: VecDeque<u32>,
    streaming: bool,
    sequence: u32,
    completed: u32,
    mappings: HashMap<usize, (u32, usize)>,
    stats: VirtualStats,
}

/// A capture node emulated in process memory.
pub struct VirtualDevice {
    card: String,
    driver: String,
    multiplanar: bool,
    formats: Vec<VirtualFormat>,
    max_buffers: u32,
    fixed_rate: Option<Fraction>,
    fail_map_at: Option<u32>,
    sequence_gaps: Vec<(u32, u32)>,
    sensor_type: Option<i32>,
    inputs: i32,
    reverse_completion: bool,
    timestamps: Cell<TimestampMode>,
    stalled: Cell<bool>,
    state: RefCell<State>,
}

impl fmt::Debug for VirtualDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualDevice")
            .field("card", &self.card)
            .field("multiplanar", &self.multiplanar)
            .field("formats", &self.formats.len())
            .field("stats", &self.stats())
            .finish()
    }
}

impl Default for VirtualDevice {
    fn default() -> Self {
        VirtualDevice::new()
    }
}

/// Offsets handed out by QUERYBUF: one page per (buffer, plane).
fn plane_offset(index: u32, plane: usize) -> u32 {
    (index * ffi::VIDEO_MAX_PLANES as u32 + plane as u32) << 12
}

fn decode_offset(offset: u32) -> (u32, usize) {
    let page = offset >> 12;
    let planes = ffi::VIDEO_MAX_PLANES as u32;
    (page / planes, (page % planes) as usize)
}

fn timeval(ts: Duration) -> libc::timeval {
    libc::timeval {
        tv_sec: ts.as_secs() as libc::time_t,
        tv_usec: ts.subsec_micros() as libc::suseconds_t,
    }
}

impl VirtualDevice {
    /// A single-plane node offering NV21, NV12 and YUYV at discrete sizes,
    /// I420 over a stepwise range and an MJPG format the format table does
    /// not know.
    pub fn new() -> VirtualDevice {
        let rates = [Fraction::new(30, 1), Fraction::new(15, 1)];
        let sizes = [(640, 480), (1280, 720), (1920, 1080)];
        VirtualDevice {
            card: "vincap virtual camera".to_owned(),
            driver: "vincap-virtual".to_owned(),
            multiplanar: false,
            formats: vec![
                VirtualFormat::discrete(FourCC::NV21, &sizes, &rates).with_planes(2),
                VirtualFormat::discrete(FourCC::NV12, &sizes, &rates).with_planes(2),
                VirtualFormat::discrete(FourCC::YUYV, &[(640, 480)], &rates[..1]),
                VirtualFormat::stepwise(
                    FourCC::I420,
                    (64, 64),
                    (1280, 720),
                    (16, 8),
                    FrameIntervals::Stepwise {
                        slowest: Fraction::new(5, 1),
                        fastest: Fraction::new(60, 1),
                    },
                )
                .with_planes(3),
                VirtualFormat::discrete(FourCC(*b"MJPG"), &[(1920, 1080)], &rates[..1])
                    .with_flags(FormatFlags::COMPRESSED),
            ],
            max_buffers: 32,
            fixed_rate: None,
            fail_map_at: None,
            sequence_gaps: Vec::new(),
            sensor_type: None,
            inputs: 3,
            reverse_completion: false,
            timestamps: Cell::new(TimestampMode::Monotonic),
            stalled: Cell::new(false),
            state: RefCell::new(State {
                format: None,
                interval: Fraction::new(30, 1).to_interval(),
                capturemode: 0,
                input: 0,
                memory: ffi::V4L2_MEMORY_MMAP,
                buffers: Vec::new(),
                queue: VecDeque::new(),
                streaming: false,
                sequence: 0,
                completed: 0,
                mappings: HashMap::new(),
                stats: VirtualStats::default(),
            }),
        }
    }

    pub fn with_formats(mut self, formats: Vec<VirtualFormat>) -> VirtualDevice {
        self.formats = formats;
        self
    }

    /// Advertise multi-plane capture instead of single-plane.
    pub fn multiplanar(mut self, multiplanar: bool) -> VirtualDevice {
        self.multiplanar = multiplanar;
        self
    }

    pub fn with_card(mut self, card: &str) -> VirtualDevice {
        self.card = card.to_owned();
        self
    }

    /// Grant at most `max` buffers per request.
    pub fn with_max_buffers(mut self, max: u32) -> VirtualDevice {
        self.max_buffers = max;
        self
    }

    /// Run at `rate` whatever is requested.
    pub fn with_fixed_rate(mut self, rate: Fraction) -> VirtualDevice {
        self.fixed_rate = Some(rate);
        self
    }

    /// Fail the map call with this zero-based number.
    pub fn fail_map_on(mut self, call: u32) -> VirtualDevice {
        self.fail_map_at = Some(call);
        self
    }

    /// Skip `skip` sequence numbers before the `frame`-th completed frame.
    pub fn with_sequence_gap(mut self, frame: u32, skip: u32) -> VirtualDevice {
        self.sequence_gaps.push((frame, skip));
        self
    }

    pub fn with_timestamps(self, mode: TimestampMode) -> VirtualDevice {
        self.timestamps.set(mode);
        self
    }

    /// Expose the sensor type control with this value (0 = YUV, 1 = RAW).
    pub fn with_sensor_type(mut self, value: i32) -> VirtualDevice {
        self.sensor_type = Some(value);
        self
    }

    /// Complete the most recently queued buffer first.
    pub fn with_reverse_completion(mut self) -> VirtualDevice {
        self.reverse_completion = true;
        self
    }

    /// Change how later frames are timestamped.
    pub fn set_timestamps(&self, mode: TimestampMode) {
        self.timestamps.set(mode);
    }

    /// While stalled no queued buffer ever completes.
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.set(stalled);
    }

    pub fn stats(&self) -> VirtualStats {
        self.state.borrow().stats
    }

    pub fn is_streaming(&self) -> bool {
        self.state.borrow().streaming
    }

    /// Buffers currently queued to the node.
    pub fn queued(&self) -> usize {
        self.state.borrow().queue.len()
    }

    pub fn buffer_count(&self) -> usize {
        self.state.borrow().buffers.len()
    }

    pub fn input(&self) -> i32 {
        self.state.borrow().input
    }

    pub fn capture_mode(&self) -> u32 {
        self.state.borrow().capturemode
    }

    fn buf_type(&self) -> u32 {
        if self.multiplanar {
            ffi::V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE
        } else {
            ffi::V4L2_BUF_TYPE_VIDEO_CAPTURE
        }
    }

    fn check_type(&self, buf_type: u32) -> nix::Result<()> {
        if buf_type == self.buf_type() {
            Ok(())
        } else {
            Err(Errno::EINVAL)
        }
    }

    fn find_format(&self, pixelformat: u32) -> Option<usize> {
        self.formats
            .iter()
            .position(|f| f.fourcc.to_v4l2() == pixelformat)
    }

    fn apply(&self, format: usize, width: u32, height: u32) -> AppliedFormat {
        let vf = &self.formats[format];
        let (width, height) = vf.coerce(width, height);
        AppliedFormat {
            format,
            width,
            height,
            planes: vf.layout(width, height, self.multiplanar),
        }
    }

    fn ensure_format<'a>(&self, state: &'a mut State) -> nix::Result<&'a AppliedFormat> {
        if state.format.is_none() {
            let vf = self.formats.first().ok_or(Errno::EINVAL)?;
            let (width, height) = vf.first_size();
            state.format = Some(self.apply(0, width, height));
        }
        state.format.as_ref().ok_or(Errno::EINVAL)
    }

    fn write_format(&self, applied: &AppliedFormat, fmt: &mut ffi::v4l2_format) {
        let fourcc = self.formats[applied.format].fourcc.to_v4l2();
        if self.multiplanar {
            let mut pix_mp = ffi::v4l2_pix_format_mplane::default();
            pix_mp.width = applied.width;
            pix_mp.height = applied.height;
            pix_mp.pixelformat = fourcc;
            pix_mp.field = ffi::V4L2_FIELD_NONE;
            pix_mp.num_planes = applied.planes.len() as u8;
            for (i, &(sizeimage, bytesperline)) in applied.planes.iter().enumerate() {
                pix_mp.plane_fmt[i] = ffi::v4l2_plane_pix_format {
                    sizeimage,
                    bytesperline,
                    reserved: [0; 6],
                };
            }
            fmt.fmt.pix_mp = pix_mp;
        } else {
            let (sizeimage, bytesperline) = applied.planes[0];
            fmt.fmt.pix = ffi::v4l2_pix_format {
                width: applied.width,
                height: applied.height,
                pixelformat: fourcc,
                field: ffi::V4L2_FIELD_NONE,
                bytesperline,
                sizeimage,
                ..Default::default()
            };
        }
    }

    fn timestamp(&self) -> Option<Duration> {
        let now = MonotonicClock.now();
        match self.timestamps.get() {
            TimestampMode::Monotonic => Some(now),
            TimestampMode::Absent => None,
            TimestampMode::FarPast => Some(now.saturating_sub(Duration::from_secs(60))),
            TimestampMode::Future => Some(now + Duration::from_secs(60)),
        }
    }

    fn interrupted(interrupt: BorrowedFd<'_>, timeout: PollTimeout) -> nix::Result<bool> {
        loop {
            let mut fds = [PollFd::new(interrupt, PollFlags::POLLIN)];
            match poll(&mut fds, timeout) {
                Ok(n) => return Ok(n > 0),
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err),
            }
        }
    }
}

impl Driver for VirtualDevice {
    fn querycap(&self, cap: &mut ffi::v4l2_capability) -> nix::Result<()> {
        *cap = ffi::v4l2_capability::default();
        let copy = |dst: &mut [u8], src: &str| {
            let n = src.len().min(dst.len() - 1);
            dst[..n].copy_from_slice(&src.as_bytes()[..n]);
        };
        copy(&mut cap.driver, &self.driver);
        copy(&mut cap.card, &self.card);
        copy(&mut cap.bus_info, "platform:vincap-virtual");
        cap.version = 0x0006_0100;
        let capture = if self.multiplanar {
            ffi::V4L2_CAP_VIDEO_CAPTURE_MPLANE
        } else {
            ffi::V4L2_CAP_VIDEO_CAPTURE
        };
        cap.device_caps = capture | ffi::V4L2_CAP_STREAMING;
        cap.capabilities = cap.device_caps | ffi::V4L2_CAP_DEVICE_CAPS;
        Ok(())
    }

    fn enum_fmt(&self, desc: &mut ffi::v4l2_fmtdesc) -> nix::Result<()> {
        self.check_type(desc.type_)?;
        let vf = self.formats.get(desc.index as usize).ok_or(Errno::EINVAL)?;
        desc.pixelformat = vf.fourcc.to_v4l2();
        desc.flags = vf.flags.bits();
        desc.description = [0; 32];
        let n = vf.description.len().min(31);
        desc.description[..n].copy_from_slice(&vf.description.as_bytes()[..n]);
        Ok(())
    }

    fn enum_framesizes(&self, size: &mut ffi::v4l2_frmsizeenum) -> nix::Result<()> {
        let vf = &self.formats[self.find_format(size.pixel_format).ok_or(Errno::EINVAL)?];
        match &vf.sizes {
            FrameSizes::Discrete(sizes) => {
                let &(width, height) = sizes.get(size.index as usize).ok_or(Errno::EINVAL)?;
                size.type_ = ffi::V4L2_FRMSIZE_TYPE_DISCRETE;
                size.u.discrete = ffi::v4l2_frmsize_discrete { width, height };
            }
            FrameSizes::Stepwise { min, max, step } => {
                if size.index != 0 {
                    return Err(Errno::EINVAL);
                }
                size.type_ = ffi::V4L2_FRMSIZE_TYPE_STEPWISE;
                size.u.stepwise = ffi::v4l2_frmsize_stepwise {
                    min_width: min.0,
                    max_width: max.0,
                    step_width: step.0,
                    min_height: min.1,
                    max_height: max.1,
                    step_height: step.1,
                };
            }
        }
        Ok(())
    }

    fn enum_frameintervals(&self, ival: &mut ffi::v4l2_frmivalenum) -> nix::Result<()> {
        let vf = &self.formats[self.find_format(ival.pixel_format).ok_or(Errno::EINVAL)?];
        if !vf.supports(ival.width, ival.height) {
            return Err(Errno::EINVAL);
        }
        match &vf.intervals {
            FrameIntervals::Discrete(rates) => {
                let rate = rates.get(ival.index as usize).ok_or(Errno::EINVAL)?;
                ival.type_ = ffi::V4L2_FRMIVAL_TYPE_DISCRETE;
                ival.u.discrete = rate.to_interval();
            }
            FrameIntervals::Stepwise { slowest, fastest } => {
                if ival.index != 0 {
                    return Err(Errno::EINVAL);
                }
                ival.type_ = ffi::V4L2_FRMIVAL_TYPE_STEPWISE;
                ival.u.stepwise = ffi::v4l2_frmival_stepwise {
                    min: fastest.to_interval(),
                    max: slowest.to_interval(),
                    step: ffi::v4l2_fract {
                        numerator: 1,
                        denominator: 1000,
                    },
                };
            }
            FrameIntervals::Unsupported => return Err(Errno::ENOTTY),
        }
        Ok(())
    }

    fn g_fmt(&self, fmt: &mut ffi::v4l2_format) -> nix::Result<()> {
        self.check_type(fmt.type_)?;
        let mut state = self.state.borrow_mut();
        let applied = self.ensure_format(&mut state)?;
        self.write_format(applied, fmt);
        Ok(())
    }

    fn s_fmt(&self, fmt: &mut ffi::v4l2_format) -> nix::Result<()> {
        self.check_type(fmt.type_)?;
        let mut state = self.state.borrow_mut();
        if !state.buffers.is_empty() {
            return Err(Errno::EBUSY);
        }

        // SAFETY: the member read matches the node's buffer type.
        let (pixelformat, width, height) = unsafe {
            if self.multiplanar {
                let pix_mp = fmt.fmt.pix_mp;
                (pix_mp.pixelformat, pix_mp.width, pix_mp.height)
            } else {
                (fmt.fmt.pix.pixelformat, fmt.fmt.pix.width, fmt.fmt.pix.height)
            }
        };
        // Unknown formats fall back to the first one, as drivers do.
        let format = self.find_format(pixelformat).unwrap_or(0);
        if self.formats.is_empty() {
            return Err(Errno::EINVAL);
        }
        let applied = self.apply(format, width, height);
        self.write_format(&applied, fmt);
        state.format = Some(applied);
        Ok(())
    }

    fn g_parm(&self, parm: &mut ffi::v4l2_streamparm) -> nix::Result<()> {
        self.check_type(parm.type_)?;
        let state = self.state.borrow();
        parm.parm.capture = ffi::v4l2_captureparm {
            capability: ffi::V4L2_CAP_TIMEPERFRAME,
            capturemode: state.capturemode,
            timeperframe: state.interval,
            ..Default::default()
        };
        Ok(())
    }

    fn s_parm(&self, parm: &mut ffi::v4l2_streamparm) -> nix::Result<()> {
        self.check_type(parm.type_)?;
        // SAFETY: capture member for a capture buffer type.
        let requested = unsafe { parm.parm.capture };
        let mut state = self.state.borrow_mut();
        if state.streaming {
            return Err(Errno::EBUSY);
        }
        state.capturemode = requested.capturemode;
        state.interval = match self.fixed_rate {
            Some(rate) => rate.to_interval(),
            None if requested.timeperframe.numerator != 0
                && requested.timeperframe.denominator != 0 =>
            {
                requested.timeperframe
            }
            None => state.interval,
        };
        parm.parm.capture = ffi::v4l2_captureparm {
            capability: ffi::V4L2_CAP_TIMEPERFRAME,
            capturemode: state.capturemode,
            timeperframe: state.interval,
            ..Default::default()
        };
        Ok(())
    }

    fn reqbufs(&self, req: &mut ffi::v4l2_requestbuffers) -> nix::Result<()> {
        self.check_type(req.type_)?;
        if !matches!(
            req.memory,
            ffi::V4L2_MEMORY_MMAP | ffi::V4L2_MEMORY_USERPTR | ffi::V4L2_MEMORY_DMABUF
        ) {
            return Err(Errno::EINVAL);
        }

        let mut state = self.state.borrow_mut();
        state.stats.reqbufs += 1;
        if state.streaming || !state.mappings.is_empty() {
            return Err(Errno::EBUSY);
        }
        state.buffers.clear();
        state.queue.clear();

        let count = req.count.min(self.max_buffers);
        if count > 0 {
            let sizes: Vec<usize> = self
                .ensure_format(&mut state)?
                .planes
                .iter()
                .map(|&(sizeimage, _)| sizeimage as usize)
                .collect();
            let kernel_memory = req.memory == ffi::V4L2_MEMORY_MMAP;
            state.buffers = (0..count)
                .map(|_| VirtualBuffer {
                    planes: if kernel_memory {
                        sizes.iter().map(|&len| Storage::new(len)).collect()
                    } else {
                        Vec::new()
                    },
                    queued: false,
                })
                .collect();
        }
        state.memory = req.memory;
        req.count = count;
        Ok(())
    }

    unsafe fn querybuf(&self, buf: &mut ffi::v4l2_buffer) -> nix::Result<()> {
        self.check_type(buf.type_)?;
        let state = self.state.borrow();
        let buffer = state.buffers.get(buf.index as usize).ok_or(Errno::EINVAL)?;
        buf.memory = state.memory;
        buf.flags = if buffer.queued {
            ffi::V4L2_BUF_FLAG_QUEUED
        } else {
            0
        };

        if self.multiplanar {
            if unsafe { buf.m.planes }.is_null() || (buf.length as usize) < buffer.planes.len() {
                return Err(Errno::EINVAL);
            }
            // SAFETY: the caller provides buf.length writable entries.
            let planes = unsafe { slice::from_raw_parts_mut(buf.m.planes, buf.length as usize) };
            for (plane, storage) in buffer.planes.iter().enumerate() {
                planes[plane].length = storage.len as u32;
                planes[plane].m.mem_offset = plane_offset(buf.index, plane);
            }
            buf.length = buffer.planes.len() as u32;
        } else {
            buf.length = buffer.planes.first().map_or(0, |s| s.len as u32);
            buf.m.offset = plane_offset(buf.index, 0);
        }
        Ok(())
    }

    unsafe fn qbuf(&self, buf: &mut ffi::v4l2_buffer) -> nix::Result<()> {
        self.check_type(buf.type_)?;
        let mut state = self.state.borrow_mut();
        if buf.memory != state.memory {
            return Err(Errno::EINVAL);
        }
        let index = buf.index;
        let buffer = state.buffers.get_mut(index as usize).ok_or(Errno::EINVAL)?;
        if buffer.queued {
            return Err(Errno::EINVAL);
        }
        if self.multiplanar && (unsafe { buf.m.planes }.is_null() || (buf.length as usize) < buffer.planes.len()) {
            return Err(Errno::EINVAL);
        }
        buffer.queued = true;
        state.queue.push_back(index);
        state.stats.qbufs += 1;
        buf.flags |= ffi::V4L2_BUF_FLAG_QUEUED;
        Ok(())
    }

    unsafe fn dqbuf(&self, buf: &mut ffi::v4l2_buffer) -> nix::Result<()> {
        self.check_type(buf.type_)?;
        let timestamp = self.timestamp();
        let mut state = self.state.borrow_mut();
        if !state.streaming {
            return Err(Errno::EINVAL);
        }
        if self.stalled.get() {
            return Err(Errno::EAGAIN);
        }
        let next = if self.reverse_completion {
            state.queue.pop_back()
        } else {
            state.queue.pop_front()
        };
        let index = next.ok_or(Errno::EAGAIN)?;

        let completed = state.completed;
        let skip: u32 = self
            .sequence_gaps
            .iter()
            .filter(|&&(frame, _)| frame == completed)
            .map(|&(_, skip)| skip)
            .sum();
        let sequence = state.sequence + skip;
        state.sequence = sequence + 1;
        state.completed += 1;
        state.stats.dqbufs += 1;

        let buffer = &mut state.buffers[index as usize];
        buffer.queued = false;
        let used: Vec<u32> = buffer
            .planes
            .iter_mut()
            .map(|storage| {
                storage.fill(sequence as u8, storage.len);
                storage.len as u32
            })
            .collect();

        buf.index = index;
        buf.sequence = sequence;
        buf.field = ffi::V4L2_FIELD_NONE;
        buf.flags = ffi::V4L2_BUF_FLAG_DONE | ffi::V4L2_BUF_FLAG_TIMESTAMP_MONOTONIC;
        buf.timestamp = timeval(timestamp.unwrap_or_default());

        if self.multiplanar {
            if unsafe { buf.m.planes }.is_null() || (buf.length as usize) < used.len() {
                return Err(Errno::EINVAL);
            }
            // SAFETY: the caller provides buf.length writable entries.
            let planes = unsafe { slice::from_raw_parts_mut(buf.m.planes, buf.length as usize) };
            for (plane, &bytes) in used.iter().enumerate() {
                planes[plane].bytesused = bytes;
                planes[plane].length = bytes;
                planes[plane].m.mem_offset = plane_offset(index, plane);
            }
            buf.length = used.len() as u32;
        } else {
            buf.bytesused = used.first().copied().unwrap_or(0);
            buf.length = buf.bytesused;
        }
        Ok(())
    }

    fn expbuf(&self, _exp: &mut ffi::v4l2_exportbuffer) -> nix::Result<()> {
        // Heap buffers have no dma-buf to export.
        Err(Errno::ENOTTY)
    }

    fn streamon(&self, buf_type: u32) -> nix::Result<()> {
        self.check_type(buf_type)?;
        let mut state = self.state.borrow_mut();
        if state.buffers.is_empty() {
            return Err(Errno::EINVAL);
        }
        if !state.streaming {
            state.streaming = true;
            state.sequence = 0;
            state.completed = 0;
        }
        state.stats.streamons += 1;
        Ok(())
    }

    fn streamoff(&self, buf_type: u32) -> nix::Result<()> {
        self.check_type(buf_type)?;
        let mut state = self.state.borrow_mut();
        state.streaming = false;
        state.queue.clear();
        for buffer in &mut state.buffers {
            buffer.queued = false;
        }
        state.stats.streamoffs += 1;
        Ok(())
    }

    fn queryctrl(&self, ctrl: &mut ffi::v4l2_queryctrl) -> nix::Result<()> {
        if ctrl.id != ffi::V4L2_CID_SENSOR_TYPE || self.sensor_type.is_none() {
            return Err(Errno::EINVAL);
        }
        ctrl.minimum = 0;
        ctrl.maximum = 1;
        ctrl.step = 1;
        ctrl.flags = 0;
        Ok(())
    }

    fn g_ctrl(&self, ctrl: &mut ffi::v4l2_control) -> nix::Result<()> {
        match self.sensor_type {
            Some(value) if ctrl.id == ffi::V4L2_CID_SENSOR_TYPE => {
                ctrl.value = value;
                Ok(())
            }
            _ => Err(Errno::EINVAL),
        }
    }

    fn s_input(&self, index: i32) -> nix::Result<()> {
        if !(0..self.inputs).contains(&index) {
            return Err(Errno::EINVAL);
        }
        self.state.borrow_mut().input = index;
        Ok(())
    }

    fn map(&self, length: usize, offset: u32, _access: Access) -> nix::Result<NonNull<c_void>> {
        let mut state = self.state.borrow_mut();
        let attempt = state.stats.map_attempts;
        state.stats.map_attempts += 1;
        if self.fail_map_at == Some(attempt) {
            return Err(Errno::ENOMEM);
        }
        if state.memory != ffi::V4L2_MEMORY_MMAP {
            return Err(Errno::EINVAL);
        }

        let (index, plane) = decode_offset(offset);
        let storage = state
            .buffers
            .get(index as usize)
            .and_then(|b| b.planes.get(plane))
            .ok_or(Errno::EINVAL)?;
        if length == 0 || length > storage.len {
            return Err(Errno::EINVAL);
        }
        let ptr = storage.ptr;

        state.mappings.insert(ptr.as_ptr() as usize, (index, plane));
        state.stats.maps += 1;
        Ok(ptr.cast())
    }

    unsafe fn unmap(&self, addr: NonNull<c_void>, _length: usize) -> nix::Result<()> {
        let mut state = self.state.borrow_mut();
        state
            .mappings
            .remove(&(addr.as_ptr() as usize))
            .ok_or(Errno::EINVAL)?;
        state.stats.unmaps += 1;
        Ok(())
    }

    fn wait(
        &self,
        interrupt: BorrowedFd<'_>,
        timeout: Option<Duration>,
    ) -> nix::Result<Readiness> {
        if Self::interrupted(interrupt, PollTimeout::ZERO)? {
            return Ok(Readiness::Interrupted);
        }
        {
            let state = self.state.borrow();
            if state.streaming && !state.queue.is_empty() && !self.stalled.get() {
                return Ok(Readiness::Ready);
            }
        }

        // Nothing can complete; only the interrupt or the timeout ends the wait.
        let poll_timeout = match timeout {
            None => PollTimeout::NONE,
            Some(timeout) => {
                PollTimeout::from(timeout.as_millis().min(u16::MAX as u128) as u16)
            }
        };
        if Self::interrupted(interrupt, poll_timeout)? {
            Ok(Readiness::Interrupted)
        } else {
            Ok(Readiness::TimedOut)
        }
    }
}
