// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Capture device session.
//!
//! A [`CaptureHandle`] owns one open capture node: the descriptor, the plane
//! mode chosen at open time, the negotiated format and frame rate, the
//! streaming flag and the buffer pool. Dropping the handle closes it.
//!
//! ```no_run
//! use vincap::{CaptureHandle, CaptureType};
//!
//! let mut handle = CaptureHandle::open("/dev/video0", CaptureType::Any)?;
//! println!("{} ({:?})", handle.info().card(), handle.mode());
//! handle.close()?;
//! # Ok::<(), vincap::Error>(())
//! ```

use std::{
    fmt,
    io::{self, Read, Write},
    os::unix::net::UnixStream,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use vincap_sys as ffi;

use crate::{
    format,
    fourcc::FourCC,
    geometry::FrameGeometry,
    ioctl_error,
    isp::{IspHook, IspSession},
    negotiate::Fraction,
    pacing::{CaptureSession, Clock, MonotonicClock},
    pool::BufferPool,
    v4l2::{
        plane::{MultiPlane, PlaneOps, SinglePlane},
        DeviceInfo, Driver, V4l2Device,
    },
    Error,
};

/// Capability requested at open time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CaptureType {
    /// Multi-plane when the device offers it, single-plane otherwise
    #[default]
    Any,
    SinglePlane,
    MultiPlane,
}

/// Plane mode selected for an open handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    SinglePlane,
    MultiPlane,
}

impl CaptureMode {
    pub fn buf_type(self) -> u32 {
        match self {
            CaptureMode::SinglePlane => ffi::V4L2_BUF_TYPE_VIDEO_CAPTURE,
            CaptureMode::MultiPlane => ffi::V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE,
        }
    }
}

/// Sensor behind a `sunxi-vin` capture node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorType {
    /// Sensor outputs YUV directly
    Yuv,
    /// Bayer sensor that needs the ISP running
    Raw,
}

/// Wakes a [`CaptureHandle::wait_and_dequeue`] blocked on another thread.
///
/// Cloneable and `Send`; obtained from [`CaptureHandle::interrupter`].
#[derive(Debug, Clone)]
pub struct Interrupter(Arc<UnixStream>);

impl Interrupter {
    pub fn interrupt(&self) {
        match (&*self.0).write(&[1]) {
            Ok(_) => {}
            // A wake-up is already pending.
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => log::warn!("failed to signal capture interrupt: {}", err),
        }
    }
}

/// The negotiated pixel format, authoritative once read back from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct NegotiatedFormat {
    pub fourcc: FourCC,
    pub width: u32,
    pub height: u32,
    pub sizeimage: Vec<u32>,
    pub bytesperline: Vec<u32>,
    pub geometry: Option<FrameGeometry>,
}

impl NegotiatedFormat {
    pub fn n_planes(&self) -> usize {
        self.sizeimage.len().max(1)
    }
}

pub struct CaptureHandle {
    pub(crate) driver: Option<Box<dyn Driver>>,
    pub(crate) ops: Box<dyn PlaneOps>,
    info: DeviceInfo,
    camera_index: i32,
    sensor: Option<SensorType>,
    pub(crate) format: Option<NegotiatedFormat>,
    pub(crate) frame_rate: Fraction,
    pub(crate) interlaced: bool,
    pub(crate) streaming: bool,
    pub(crate) pool: Option<BufferPool>,
    pub(crate) session: CaptureSession,
    pub(crate) clock: Box<dyn Clock>,
    pub(crate) wait_timeout: Option<Duration>,
    isp: Option<IspSession>,
    pub(crate) wake_rx: UnixStream,
    wake_tx: Arc<UnixStream>,
}

impl fmt::Debug for CaptureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureHandle")
            .field("path", &self.info.path())
            .field("mode", &self.ops.mode())
            .field("format", &self.format)
            .field("frame_rate", &self.frame_rate)
            .field("streaming", &self.streaming)
            .field("slots", &self.slot_count())
            .field("closed", &self.driver.is_none())
            .finish()
    }
}

impl CaptureHandle {
    /// Open a capture node.
    ///
    /// Fails with [`Error::DeviceNotFound`] when the path cannot be opened and
    /// [`Error::NotCapturable`] when the node lacks the requested capability.
    pub fn open<P: AsRef<Path>>(path: P, kind: CaptureType) -> Result<CaptureHandle, Error> {
        let path = path.as_ref();
        let device = V4l2Device::open(path).map_err(|source| {
            log::error!("cannot open {}: {}", path.display(), source);
            Error::DeviceNotFound {
                path: path.to_path_buf(),
                source,
            }
        })?;
        Self::with_driver(Box::new(device), path, kind)
    }

    /// Open a session over any [`Driver`], such as the virtual device.
    pub fn with_driver<P: AsRef<Path>>(
        driver: Box<dyn Driver>,
        path: P,
        kind: CaptureType,
    ) -> Result<CaptureHandle, Error> {
        let path = path.as_ref();
        let mut cap = ffi::v4l2_capability::default();
        driver
            .querycap(&mut cap)
            .map_err(ioctl_error("VIDIOC_QUERYCAP", None))?;
        let info = DeviceInfo::from_capability(path, &cap);

        let single = info.capabilities() & ffi::V4L2_CAP_VIDEO_CAPTURE != 0;
        let multi = info.is_multiplanar();
        let mode = match kind {
            CaptureType::Any if multi => CaptureMode::MultiPlane,
            CaptureType::Any | CaptureType::SinglePlane if single => CaptureMode::SinglePlane,
            CaptureType::MultiPlane if multi => CaptureMode::MultiPlane,
            _ => {
                log::error!(
                    "{} has no {:?} capture capability ({:#010x})",
                    path.display(),
                    kind,
                    info.capabilities()
                );
                return Err(Error::NotCapturable {
                    path: path.to_path_buf(),
                    capabilities: info.capabilities(),
                });
            }
        };
        let ops: Box<dyn PlaneOps> = match mode {
            CaptureMode::SinglePlane => Box::new(SinglePlane),
            CaptureMode::MultiPlane => Box::new(MultiPlane),
        };

        let sensor = if info.card() == "sunxi-vin" {
            query_sensor_type(driver.as_ref())
        } else {
            None
        };

        let (wake_rx, wake_tx) = UnixStream::pair()?;
        wake_rx.set_nonblocking(true)?;
        wake_tx.set_nonblocking(true)?;

        log::info!(
            "opened {}: {} ({}) {:?}",
            path.display(),
            info.card(),
            info.driver(),
            mode
        );

        let frame_rate = Fraction::default();
        let mut session = CaptureSession::new();
        session.set_frame_duration(frame_rate.frame_duration());

        Ok(CaptureHandle {
            driver: Some(driver),
            ops,
            info,
            camera_index: 0,
            sensor,
            format: None,
            frame_rate,
            interlaced: false,
            streaming: false,
            pool: None,
            session,
            clock: Box::new(MonotonicClock),
            wait_timeout: None,
            isp: None,
            wake_rx,
            wake_tx: Arc::new(wake_tx),
        })
    }

    pub(crate) fn driver(&self) -> Result<&dyn Driver, Error> {
        self.driver.as_deref().ok_or(Error::Closed)
    }

    /// Select the device input (`VIDIOC_S_INPUT`), which is also the index
    /// handed to the ISP.
    pub fn select_input(&mut self, index: i32) -> Result<(), Error> {
        self.driver()?
            .s_input(index)
            .map_err(ioctl_error("VIDIOC_S_INPUT", None))?;
        self.camera_index = index;
        Ok(())
    }

    /// Attach a vendor ISP. Only RAW sensors accept one.
    pub fn attach_isp(&mut self, hook: Box<dyn IspHook>) -> Result<(), Error> {
        if self.sensor != Some(SensorType::Raw) {
            return Err(Error::Unsupported("isp"));
        }
        self.isp = Some(IspSession::new(hook));
        Ok(())
    }

    /// Turn the stream on. Buffers must have been requested and mapped.
    pub fn streamon(&mut self) -> Result<(), Error> {
        let driver = self.driver.as_deref().ok_or(Error::Closed)?;
        if self.streaming {
            return Ok(());
        }
        match &self.pool {
            Some(pool) if pool.is_ready() => {}
            _ => return Err(Error::NoBuffers),
        }

        driver
            .streamon(self.ops.buf_type())
            .map_err(ioctl_error("VIDIOC_STREAMON", None))?;
        self.streaming = true;
        self.session.start();

        if let (Some(isp), Some(format)) = (self.isp.as_mut(), self.format.as_ref()) {
            if !format::is_raw_bayer(format.fourcc) {
                isp.start(self.camera_index);
            }
        }

        log::info!("{}: stream on", self.info.path().display());
        Ok(())
    }

    /// Turn the stream off; a no-op when already off.
    ///
    /// Every buffer still queued to the device returns to the free state.
    pub fn streamoff(&mut self) -> Result<(), Error> {
        if !self.streaming {
            return Ok(());
        }
        let driver = self.driver.as_deref().ok_or(Error::Closed)?;
        driver
            .streamoff(self.ops.buf_type())
            .map_err(ioctl_error("VIDIOC_STREAMOFF", None))?;
        self.streaming = false;
        if let Some(pool) = self.pool.as_mut() {
            pool.reclaim();
        }

        log::info!("{}: stream off", self.info.path().display());
        Ok(())
    }

    /// Close the device. Safe to call repeatedly.
    ///
    /// Teardown always runs to the end; the first failure is returned.
    pub fn close(&mut self) -> Result<(), Error> {
        if self.driver.is_none() {
            return Ok(());
        }

        self.interrupter().interrupt();

        let mut first_error = self.streamoff().err();
        // Without a successful STREAMOFF the kernel still owns the buffers,
        // closing the descriptor below releases them.
        self.streaming = false;

        if let Some(isp) = self.isp.as_mut() {
            isp.stop();
        }

        if let Err(err) = self.release_pool() {
            first_error.get_or_insert(err);
        }

        self.driver = None;
        self.drain_interrupts();

        log::info!("{}: closed", self.info.path().display());
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.driver.is_none()
    }

    /// Handle for waking a blocked wait from another thread.
    pub fn interrupter(&self) -> Interrupter {
        Interrupter(Arc::clone(&self.wake_tx))
    }

    pub(crate) fn drain_interrupts(&self) {
        let mut buf = [0u8; 16];
        while let Ok(n) = (&self.wake_rx).read(&mut buf) {
            if n == 0 {
                break;
            }
        }
    }

    /// Replace the capture clock used for timestamps.
    pub fn set_clock(&mut self, clock: Box<dyn Clock>) {
        self.clock = clock;
    }

    /// Mark the source as interlaced; affects geometry and capability strings.
    pub fn set_interlaced(&mut self, interlaced: bool) {
        self.interlaced = interlaced;
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn path(&self) -> &Path {
        self.info.path()
    }

    pub fn mode(&self) -> CaptureMode {
        self.ops.mode()
    }

    pub fn sensor_type(&self) -> Option<SensorType> {
        self.sensor
    }

    /// True while an attached ISP has been started.
    pub fn isp_running(&self) -> bool {
        self.isp.as_ref().is_some_and(|isp| isp.is_running())
    }

    pub fn camera_index(&self) -> i32 {
        self.camera_index
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Negotiated pixel format, once set.
    pub fn fourcc(&self) -> Option<FourCC> {
        self.format.as_ref().map(|f| f.fourcc)
    }

    pub fn width(&self) -> u32 {
        self.format.as_ref().map_or(0, |f| f.width)
    }

    pub fn height(&self) -> u32 {
        self.format.as_ref().map_or(0, |f| f.height)
    }

    pub fn n_planes(&self) -> usize {
        self.format.as_ref().map_or(1, NegotiatedFormat::n_planes)
    }

    /// Bytes per image as reported by the device, summed over planes.
    pub fn frame_size(&self) -> usize {
        self.format
            .as_ref()
            .map_or(0, |f| f.sizeimage.iter().map(|&s| s as usize).sum())
    }

    pub fn geometry(&self) -> Option<&FrameGeometry> {
        self.format.as_ref().and_then(|f| f.geometry.as_ref())
    }

    /// Authoritative frame rate: what the device reported back.
    pub fn frame_rate(&self) -> Fraction {
        self.frame_rate
    }

    pub(crate) fn device_path(&self) -> PathBuf {
        self.info.path().to_path_buf()
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::warn!("error closing {}: {}", self.info.path().display(), err);
        }
    }
}

fn query_sensor_type(driver: &dyn Driver) -> Option<SensorType> {
    let mut query = ffi::v4l2_queryctrl {
        id: ffi::V4L2_CID_SENSOR_TYPE,
        ..Default::default()
    };
    if let Err(errno) = driver.queryctrl(&mut query) {
        log::debug!("sensor type control unavailable: {}", errno);
        return None;
    }
    if query.flags & ffi::V4L2_CTRL_FLAG_DISABLED != 0 {
        return None;
    }

    let mut ctrl = ffi::v4l2_control {
        id: ffi::V4L2_CID_SENSOR_TYPE,
        value: 0,
    };
    if let Err(errno) = driver.g_ctrl(&mut ctrl) {
        log::warn!("failed to read sensor type: {}", errno);
        return None;
    }

    let sensor = if ctrl.value == 1 {
        SensorType::Raw
    } else {
        SensorType::Yuv
    };
    log::debug!("sensor type {:?}", sensor);
    Some(sensor)
}
