// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! V4L2 Device Enumerator
//!
//! This module provides the [`DeviceEnumerator`] type for discovering V4L2
//! capture nodes on Linux systems.

use std::{
    fs,
    path::{Path, PathBuf},
};

use vincap_sys as ffi;

use super::{device::DeviceInfo, Driver, Format, V4l2Device};
use crate::{ioctl_error, negotiate, Error};

const DEV_DIR: &str = "/dev";

/// V4L2 Device Enumerator
///
/// Static methods for discovering capture nodes without hardcoding paths.
///
/// # Example: List Capture Devices
///
/// ```no_run
/// use vincap::v4l2::DeviceEnumerator;
///
/// let devices = DeviceEnumerator::enumerate()?;
/// println!("Found {} capture devices:", devices.len());
///
/// for device in &devices {
///     println!("  {}: {} (multi-plane: {})",
///         device.path_str(), device.card(), device.is_multiplanar());
/// }
/// # Ok::<(), vincap::Error>(())
/// ```
///
/// # Notes
///
/// - Nodes that cannot be opened (busy, no permission) are skipped
/// - Nodes without a capture capability are skipped
/// - The result is sorted by device number
pub struct DeviceEnumerator;

impl DeviceEnumerator {
    /// Enumerate every capture node under `/dev`.
    ///
    /// # Errors
    ///
    /// Fails only when `/dev` itself cannot be read.
    pub fn enumerate() -> Result<Vec<DeviceInfo>, Error> {
        Self::scan(Path::new(DEV_DIR), false)
    }

    /// Enumerate every `/dev/video*` node, capture-capable or not.
    pub fn enumerate_all() -> Result<Vec<DeviceInfo>, Error> {
        Self::scan(Path::new(DEV_DIR), true)
    }

    fn scan(dir: &Path, all: bool) -> Result<Vec<DeviceInfo>, Error> {
        let mut nodes: Vec<(u32, PathBuf)> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name();
                let number = name.to_str()?.strip_prefix("video")?.parse().ok()?;
                Some((number, entry.path()))
            })
            .collect();
        nodes.sort();

        let mut devices = Vec::new();
        for (_, path) in nodes {
            match Self::probe(&path) {
                Ok(info) if all || info.is_capture() => devices.push(info),
                Ok(info) => log::debug!("{}: not a capture node", info.path().display()),
                Err(err) => log::debug!("{}: skipped, {}", path.display(), err),
            }
        }
        Ok(devices)
    }

    /// Query one node's identity and, for capture nodes, its formats.
    pub fn probe<P: AsRef<Path>>(path: P) -> Result<DeviceInfo, Error> {
        let path = path.as_ref();
        let device = V4l2Device::open(path).map_err(|source| Error::DeviceNotFound {
            path: path.to_path_buf(),
            source,
        })?;
        Self::probe_driver(&device, path)
    }

    pub(crate) fn probe_driver(driver: &dyn Driver, path: &Path) -> Result<DeviceInfo, Error> {
        let mut cap = ffi::v4l2_capability::default();
        driver
            .querycap(&mut cap)
            .map_err(ioctl_error("VIDIOC_QUERYCAP", None))?;
        let mut info = DeviceInfo::from_capability(path, &cap);

        if info.is_capture() {
            let buf_type = if info.is_multiplanar() {
                ffi::V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE
            } else {
                ffi::V4L2_BUF_TYPE_VIDEO_CAPTURE
            };
            info.formats = negotiate::list_formats(driver, buf_type)?;
        }
        Ok(info)
    }

    /// Capture formats of one node, including ones outside the format table.
    pub fn capabilities<P: AsRef<Path>>(path: P) -> Result<Vec<Format>, Error> {
        let info = Self::probe(path)?;
        if !info.is_capture() {
            return Err(Error::NotCapturable {
                path: info.path().to_path_buf(),
                capabilities: info.capabilities(),
            });
        }
        Ok(info.formats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fourcc::FourCC;
    use crate::v4l2::VirtualDevice;

    #[test]
    fn test_probe_virtual() {
        let device = VirtualDevice::new();
        let info = DeviceEnumerator::probe_driver(&device, Path::new("/dev/video-virtual")).unwrap();
        assert!(info.is_capture());
        assert_eq!(info.card(), "vincap virtual camera");

        let nv21 = info
            .formats()
            .iter()
            .find(|f| f.fourcc == FourCC::NV21)
            .unwrap();
        assert!(nv21
            .resolutions
            .iter()
            .any(|r| r.width == 1920 && r.height == 1080));
        assert!(info.formats().iter().any(|f| f.fourcc == FourCC(*b"MJPG")));
    }

    #[test]
    fn test_missing_node() {
        let err = DeviceEnumerator::probe("/dev/video-does-not-exist").unwrap_err();
        assert!(matches!(err, Error::DeviceNotFound { .. }));
    }
}
