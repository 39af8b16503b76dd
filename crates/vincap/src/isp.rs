// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Vendor image signal processor hook.
//!
//! RAW sensors behind the Allwinner `sunxi-vin` driver produce nothing useful
//! unless the vendor ISP runs alongside the stream. [`IspHook`] is the seam:
//! the capture handle starts the ISP when streaming begins on a processed
//! format and stops it on close. With the `isp` feature, [`AwIsp`] drives
//! `libAWIspApi.so` loaded at runtime.

use crate::Error;

/// Start/stop control over an image signal processor.
pub trait IspHook {
    /// ISP instance serving video node `video_index`, if any.
    fn get_id(&mut self, video_index: i32) -> Option<i32>;

    fn start(&mut self, id: i32) -> Result<(), Error>;

    fn stop(&mut self, id: i32) -> Result<(), Error>;
}

/// An attached hook plus the instance it is currently running.
pub(crate) struct IspSession {
    hook: Box<dyn IspHook>,
    running: Option<i32>,
}

impl IspSession {
    pub(crate) fn new(hook: Box<dyn IspHook>) -> IspSession {
        IspSession {
            hook,
            running: None,
        }
    }

    /// Failures are logged; capture continues without the ISP.
    pub(crate) fn start(&mut self, video_index: i32) {
        if self.running.is_some() {
            return;
        }
        let Some(id) = self.hook.get_id(video_index).filter(|id| *id >= 0) else {
            log::warn!("no ISP instance for video{}", video_index);
            return;
        };
        match self.hook.start(id) {
            Ok(()) => {
                log::info!("ISP {} started for video{}", id, video_index);
                self.running = Some(id);
            }
            Err(err) => log::warn!("ISP {} failed to start: {}", id, err),
        }
    }

    pub(crate) fn stop(&mut self) {
        if let Some(id) = self.running.take() {
            match self.hook.stop(id) {
                Ok(()) => log::info!("ISP {} stopped", id),
                Err(err) => log::warn!("ISP {} failed to stop: {}", id, err),
            }
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.is_some()
    }
}

#[cfg(feature = "isp")]
pub use self::aw::AwIsp;

#[cfg(feature = "isp")]
mod aw {
    use std::{io, ptr::NonNull};

    use vincap_sys::isp::{self as ffi, AWIspApi, IspLibrary};

    use super::IspHook;
    use crate::Error;

    /// Allwinner ISP driven through `libAWIspApi.so`.
    ///
    /// The library is located through `VINCAP_ISP_LIBRARY` or the default
    /// loader search path and shared by every instance in the process.
    pub struct AwIsp {
        lib: &'static IspLibrary,
        api: NonNull<AWIspApi>,
    }

    fn status(call: &str, id: i32, rc: i32) -> Result<(), Error> {
        if rc == 0 {
            Ok(())
        } else {
            Err(Error::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("{}({}) returned {}", call, id, rc),
            )))
        }
    }

    impl AwIsp {
        pub fn new() -> Result<AwIsp, Error> {
            let lib = ffi::init()?;
            // SAFETY: constructor exported by the loaded library.
            let api = NonNull::new(unsafe { (lib.create)() })
                .ok_or(Error::Unsupported("CreateAWIspApi"))?;
            let isp = AwIsp { lib, api };
            if let Some(init) = isp.table().ispApiInit {
                // SAFETY: function pointer from the live table.
                unsafe { init() };
            }
            Ok(isp)
        }

        fn table(&self) -> &AWIspApi {
            // SAFETY: api stays valid until DestroyAWIspApi in Drop.
            unsafe { self.api.as_ref() }
        }
    }

    impl IspHook for AwIsp {
        fn get_id(&mut self, video_index: i32) -> Option<i32> {
            let get = self.table().ispGetIspId?;
            // SAFETY: function pointer from the live table.
            Some(unsafe { get(video_index) })
        }

        fn start(&mut self, id: i32) -> Result<(), Error> {
            let start = self.table().ispStart.ok_or(Error::Unsupported("ispStart"))?;
            // SAFETY: function pointer from the live table.
            status("ispStart", id, unsafe { start(id) })
        }

        fn stop(&mut self, id: i32) -> Result<(), Error> {
            let table = self.table();
            let stop = table.ispStop.ok_or(Error::Unsupported("ispStop"))?;
            // SAFETY: function pointers from the live table.
            status("ispStop", id, unsafe { stop(id) })?;
            if let Some(wait) = table.ispWaitToExit {
                status("ispWaitToExit", id, unsafe { wait(id) })?;
            }
            Ok(())
        }
    }

    impl Drop for AwIsp {
        fn drop(&mut self) {
            // SAFETY: the table is released exactly once, after its last use.
            unsafe {
                if let Some(uninit) = self.table().ispApiUnInit {
                    uninit();
                }
                (self.lib.destroy)(self.api.as_ptr());
            }
        }
    }
}
