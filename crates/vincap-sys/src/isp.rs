// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Runtime loader for the Allwinner ISP control library (`libAWIspApi.so`).
//!
//! RAW sensors on `sunxi-vin` need the vendor ISP running while the capture
//! node streams. The library is optional and only loaded on demand.

use std::ffi::c_int;
use std::sync::{Mutex, OnceLock};

pub use libloading;

/// Function table returned by `CreateAWIspApi`.
#[repr(C)]
#[allow(non_snake_case)]
pub struct AWIspApi {
    pub ispApiInit: Option<unsafe extern "C" fn() -> c_int>,
    pub ispGetIspId: Option<unsafe extern "C" fn(video_id: c_int) -> c_int>,
    pub ispStart: Option<unsafe extern "C" fn(isp_id: c_int) -> c_int>,
    pub ispStop: Option<unsafe extern "C" fn(isp_id: c_int) -> c_int>,
    pub ispWaitToExit: Option<unsafe extern "C" fn(isp_id: c_int) -> c_int>,
    pub ispApiUnInit: Option<unsafe extern "C" fn() -> c_int>,
}

type CreateFn = unsafe extern "C" fn() -> *mut AWIspApi;
type DestroyFn = unsafe extern "C" fn(api: *mut AWIspApi);

pub struct IspLibrary {
    // Keeps the symbols below valid.
    _lib: libloading::Library,
    pub create: CreateFn,
    pub destroy: DestroyFn,
}

impl IspLibrary {
    /// Loads the library at `path` and resolves the constructor pair.
    ///
    /// # Safety
    ///
    /// Runs the library's initialisers; the caller must trust `path`.
    pub unsafe fn new(path: &str) -> Result<Self, libloading::Error> {
        let lib = unsafe { libloading::Library::new(path)? };
        let create = unsafe { *lib.get::<CreateFn>(b"CreateAWIspApi\0")? };
        let destroy = unsafe { *lib.get::<DestroyFn>(b"DestroyAWIspApi\0")? };
        Ok(IspLibrary {
            _lib: lib,
            create,
            destroy,
        })
    }
}

static LIBRARY: OnceLock<IspLibrary> = OnceLock::new();
static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Load the ISP library once per process.
///
/// The environment variable `VINCAP_ISP_LIBRARY` overrides the default
/// `libAWIspApi.so` search.
pub fn init() -> Result<&'static IspLibrary, libloading::Error> {
    if let Some(lib) = LIBRARY.get() {
        return Ok(lib);
    }

    let _guard = INIT_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

    if let Some(lib) = LIBRARY.get() {
        return Ok(lib);
    }

    let lib_path = std::env::var("VINCAP_ISP_LIBRARY")
        .ok()
        .unwrap_or_else(|| "libAWIspApi.so".to_string());

    let lib = unsafe { IspLibrary::new(lib_path.as_str())? };

    Ok(LIBRARY.get_or_init(move || lib))
}

/// Get the loaded library without attempting to load it.
pub fn try_library() -> Option<&'static IspLibrary> {
    LIBRARY.get()
}
