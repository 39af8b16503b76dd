// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use crate::{
    device::{CaptureHandle, CaptureType, SensorType},
    fourcc::FourCC,
    isp::IspHook,
    negotiate::{Capability, Fraction},
    v4l2::{Driver, MemoryType},
    Error,
};

type IspBuilder = dyn Fn() -> Result<Box<dyn IspHook>, Error> + Send + Sync;

/// Builds the ISP hook attached when the device reports a RAW sensor.
#[derive(Clone)]
pub struct IspFactory(Arc<IspBuilder>);

impl IspFactory {
    pub fn new<F>(build: F) -> IspFactory
    where
        F: Fn() -> Result<Box<dyn IspHook>, Error> + Send + Sync + 'static,
    {
        IspFactory(Arc::new(build))
    }

    /// The Allwinner ISP from `libAWIspApi.so`.
    #[cfg(feature = "isp")]
    pub fn allwinner() -> IspFactory {
        IspFactory::new(|| -> Result<Box<dyn IspHook>, Error> {
            Ok(Box::new(crate::isp::AwIsp::new()?))
        })
    }

    fn build(&self) -> Result<Box<dyn IspHook>, Error> {
        (self.0)()
    }
}

impl fmt::Debug for IspFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("IspFactory")
    }
}

/// Settings for a fully configured [`CaptureHandle`].
///
/// Every value is a request; the device may adjust resolution, format and
/// frame rate, and what it settled on is read back from the handle.
#[derive(Debug, Clone)]
pub struct Camera {
    /// video device file for the camera
    device: PathBuf,

    /// request capture width
    width: u32,

    /// request capture height
    height: u32,

    /// request pixel format
    format: FourCC,

    /// request frame rate, the device may run at another rate
    frame_rate: Fraction,

    /// number of kernel buffers to request
    num_buffers: u32,

    memory: MemoryType,

    /// device input, also the index handed to a vendor ISP
    camera_index: i32,

    capture_type: CaptureType,

    interlaced: bool,

    /// bound on every frame wait, none waits forever
    timeout: Option<Duration>,

    /// ISP for RAW sensors, the Allwinner one with the `isp` feature
    isp: Option<IspFactory>,
}

impl Camera {
    pub fn with_device<P: AsRef<Path>>(self, device: P) -> Camera {
        Camera {
            device: device.as_ref().to_path_buf(),
            ..self
        }
    }

    pub fn with_resolution(self, width: u32, height: u32) -> Camera {
        Camera {
            width,
            height,
            ..self
        }
    }

    pub fn with_format(self, format: FourCC) -> Camera {
        Camera { format, ..self }
    }

    pub fn with_frame_rate(self, frame_rate: Fraction) -> Camera {
        Camera { frame_rate, ..self }
    }

    pub fn with_buffers(self, num_buffers: u32) -> Camera {
        Camera {
            num_buffers,
            ..self
        }
    }

    pub fn with_memory(self, memory: MemoryType) -> Camera {
        Camera { memory, ..self }
    }

    pub fn with_camera_index(self, camera_index: i32) -> Camera {
        Camera {
            camera_index,
            ..self
        }
    }

    pub fn with_capture_type(self, capture_type: CaptureType) -> Camera {
        Camera {
            capture_type,
            ..self
        }
    }

    pub fn with_interlaced(self, interlaced: bool) -> Camera {
        Camera { interlaced, ..self }
    }

    pub fn with_timeout(self, timeout: Option<Duration>) -> Camera {
        Camera { timeout, ..self }
    }

    /// Replace the ISP attached to RAW sensors; `None` captures without one.
    pub fn with_isp(self, isp: Option<IspFactory>) -> Camera {
        Camera { isp, ..self }
    }

    pub fn device(&self) -> &Path {
        &self.device
    }

    pub fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn format(&self) -> FourCC {
        self.format
    }

    pub fn frame_rate(&self) -> Fraction {
        self.frame_rate
    }

    pub fn buffers(&self) -> u32 {
        self.num_buffers
    }

    /// Open the device node and configure it.
    pub fn open(self) -> Result<CaptureHandle, Error> {
        let handle = CaptureHandle::open(&self.device, self.capture_type)?;
        self.configure(handle)
    }

    /// Configure a session over an already opened driver.
    pub fn open_with_driver(self, driver: Box<dyn Driver>) -> Result<CaptureHandle, Error> {
        let handle = CaptureHandle::with_driver(driver, &self.device, self.capture_type)?;
        self.configure(handle)
    }

    /// Capability list of the device node, without configuring it.
    pub fn formats(self) -> Result<Vec<Capability>, Error> {
        CaptureHandle::open(&self.device, self.capture_type)?.capabilities()
    }

    fn configure(self, mut handle: CaptureHandle) -> Result<CaptureHandle, Error> {
        // Single-input drivers commonly reject S_INPUT.
        if let Err(err) = handle.select_input(self.camera_index) {
            log::warn!(
                "{}: input {} not selected: {}",
                self.device.display(),
                self.camera_index,
                err
            );
        }

        if handle.sensor_type() == Some(SensorType::Raw) {
            match &self.isp {
                Some(isp) => handle.attach_isp(isp.build()?)?,
                None => log::warn!(
                    "{}: RAW sensor without an ISP, frames stay unprocessed",
                    self.device.display()
                ),
            }
        }

        handle.set_interlaced(self.interlaced);
        handle.apply_format(self.format, self.width, self.height, self.frame_rate)?;
        handle.set_pixel_format(self.format, self.width, self.height)?;
        handle.set_wait_timeout(self.timeout);
        let granted = handle.request_buffers(self.num_buffers, self.memory)?;
        if granted != self.num_buffers {
            log::info!(
                "requested {} buffers, device granted {}",
                self.num_buffers,
                granted
            );
        }
        Ok(handle)
    }
}

impl Default for Camera {
    fn default() -> Camera {
        Camera {
            device: PathBuf::from("/dev/video0"),
            width: 320,
            height: 240,
            format: FourCC::NV21,
            frame_rate: Fraction::new(30, 1),
            num_buffers: 3,
            memory: MemoryType::Mmap,
            camera_index: 0,
            capture_type: CaptureType::Any,
            interlaced: false,
            timeout: None,
            #[cfg(feature = "isp")]
            isp: Some(IspFactory::allwinner()),
            #[cfg(not(feature = "isp"))]
            isp: None,
        }
    }
}

impl fmt::Display for Camera {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {} {}x{} @ {} fps, {} buffers",
            self.device.display(),
            self.format,
            self.width,
            self.height,
            self.frame_rate,
            self.num_buffers
        )
    }
}

pub fn create_camera() -> Camera {
    Camera::default()
}
