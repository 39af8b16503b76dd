// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! V4L2 device description types
//!
//! - [`MemoryType`] - Buffer memory modes (MMAP, USERPTR, DMABUF)
//! - [`Resolution`] - Width × height descriptor
//! - [`Format`] - Enumerated capture format with its frame sizes
//! - [`DeviceInfo`] - Identity and capabilities reported by `VIDIOC_QUERYCAP`

use std::fmt;
use std::path::{Path, PathBuf};

use crate::format::FormatFlags;
use crate::fourcc::FourCC;
use vincap_sys as ffi;

/// V4L2 buffer memory mode
///
/// | Memory Type | Allocation | Mapped by vincap |
/// |-------------|------------|------------------|
/// | [`MemoryType::Mmap`] | Kernel | Yes |
/// | [`MemoryType::UserPtr`] | User | No |
/// | [`MemoryType::DmaBuf`] | User | No |
///
/// Only [`MemoryType::Mmap`] slots carry mappings; the other modes keep slot
/// bookkeeping for a consumer that brings its own memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MemoryType {
    /// Kernel allocates buffers, user mmaps them.
    #[default]
    Mmap = ffi::V4L2_MEMORY_MMAP,

    /// User allocates buffers and passes pointers.
    UserPtr = ffi::V4L2_MEMORY_USERPTR,

    /// User passes dmabuf file descriptors.
    DmaBuf = ffi::V4L2_MEMORY_DMABUF,
}

impl MemoryType {
    pub fn to_v4l2(self) -> u32 {
        self as u32
    }

    /// Parse the io-mode index used on the command line (1 = MMAP, 2 = USERPTR, 3 = DMABUF).
    pub fn from_io_mode(mode: u32) -> Option<MemoryType> {
        match mode {
            1 => Some(MemoryType::Mmap),
            2 => Some(MemoryType::UserPtr),
            3 => Some(MemoryType::DmaBuf),
            _ => None,
        }
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryType::Mmap => write!(f, "MMAP"),
            MemoryType::UserPtr => write!(f, "USERPTR"),
            MemoryType::DmaBuf => write!(f, "DMABUF"),
        }
    }
}

/// Video resolution
///
/// ```
/// use vincap::v4l2::Resolution;
///
/// let res = Resolution::new(1920, 1080);
/// assert_eq!(res.to_string(), "1920x1080");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Capture format reported by `VIDIOC_ENUM_FMT`
#[derive(Debug, Clone)]
pub struct Format {
    /// Four-character code (e.g., "NV21")
    pub fourcc: FourCC,
    /// Human-readable description from driver
    pub description: String,
    /// Driver flags (compressed, emulated)
    pub flags: FormatFlags,
    /// Frame sizes; ranges are represented by their maximum
    pub resolutions: Vec<Resolution>,
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fourcc)?;
        if self.flags.contains(FormatFlags::COMPRESSED) {
            write!(f, " (compressed)")?;
        }
        if self.flags.contains(FormatFlags::EMULATED) {
            write!(f, " (emulated)")?;
        }
        Ok(())
    }
}

/// Identity and capability bits of one device node
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    path: PathBuf,
    driver: String,
    card: String,
    bus_info: String,
    version: u32,
    capabilities: u32,
    /// Formats are only filled in by the enumerator
    pub(crate) formats: Vec<Format>,
}

pub(crate) fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

impl DeviceInfo {
    pub(crate) fn from_capability(path: &Path, cap: &ffi::v4l2_capability) -> Self {
        // device_caps describes this node; capabilities covers the whole device.
        let capabilities = if cap.capabilities & ffi::V4L2_CAP_DEVICE_CAPS != 0 {
            cap.device_caps
        } else {
            cap.capabilities
        };

        DeviceInfo {
            path: path.to_path_buf(),
            driver: c_string(&cap.driver),
            card: c_string(&cap.card),
            bus_info: c_string(&cap.bus_info),
            version: cap.version,
            capabilities,
            formats: Vec::new(),
        }
    }

    /// Device path (e.g., "/dev/video0")
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn path_str(&self) -> &str {
        self.path.to_str().unwrap_or("<invalid>")
    }

    pub fn driver(&self) -> &str {
        &self.driver
    }

    pub fn card(&self) -> &str {
        &self.card
    }

    pub fn bus_info(&self) -> &str {
        &self.bus_info
    }

    /// Kernel driver version as `major.minor.patch`.
    pub fn version(&self) -> String {
        format!(
            "{}.{}.{}",
            (self.version >> 16) & 0xff,
            (self.version >> 8) & 0xff,
            self.version & 0xff
        )
    }

    /// Capability bits of this node.
    pub fn capabilities(&self) -> u32 {
        self.capabilities
    }

    pub fn is_capture(&self) -> bool {
        self.capabilities
            & (ffi::V4L2_CAP_VIDEO_CAPTURE | ffi::V4L2_CAP_VIDEO_CAPTURE_MPLANE)
            != 0
    }

    pub fn is_multiplanar(&self) -> bool {
        self.capabilities & ffi::V4L2_CAP_VIDEO_CAPTURE_MPLANE != 0
    }

    pub fn supports_streaming(&self) -> bool {
        self.capabilities & ffi::V4L2_CAP_STREAMING != 0
    }

    pub fn formats(&self) -> &[Format] {
        &self.formats
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.path.display(), self.card, self.driver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capability(caps: u32, device_caps: u32) -> ffi::v4l2_capability {
        let mut cap = ffi::v4l2_capability::default();
        cap.driver[..4].copy_from_slice(b"uvc\0");
        cap.card[..6].copy_from_slice(b"webcam");
        cap.version = 0x0006_0102;
        cap.capabilities = caps;
        cap.device_caps = device_caps;
        cap
    }

    #[test]
    fn test_device_caps_preferred() {
        let cap = capability(
            ffi::V4L2_CAP_DEVICE_CAPS
                | ffi::V4L2_CAP_VIDEO_CAPTURE
                | ffi::V4L2_CAP_VIDEO_CAPTURE_MPLANE,
            ffi::V4L2_CAP_VIDEO_CAPTURE | ffi::V4L2_CAP_STREAMING,
        );
        let info = DeviceInfo::from_capability(Path::new("/dev/video3"), &cap);
        assert!(info.is_capture());
        assert!(!info.is_multiplanar());
        assert!(info.supports_streaming());
        assert_eq!(info.driver(), "uvc");
        assert_eq!(info.card(), "webcam");
        assert_eq!(info.version(), "6.1.2");
        assert_eq!(info.to_string(), "/dev/video3: webcam (uvc)");
    }

    #[test]
    fn test_memory_type() {
        assert_eq!(MemoryType::default(), MemoryType::Mmap);
        assert_eq!(MemoryType::from_io_mode(2), Some(MemoryType::UserPtr));
        assert_eq!(MemoryType::from_io_mode(0), None);
        assert_eq!(MemoryType::DmaBuf.to_v4l2(), ffi::V4L2_MEMORY_DMABUF);
        assert_eq!(MemoryType::Mmap.to_string(), "MMAP");
    }
}
