// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! vincap - V4L2 capture for Rust
//!
//! Drives a memory-mapped V4L2 capture device and hands its kernel buffers to
//! a refcounted consumer without ever giving one buffer to two owners or
//! leaking it away from the kernel queue.
//!
//! The pieces, leaves first:
//!
//! | Module | Role |
//! |--------|------|
//! | [`device`] | [`CaptureHandle`]: open/close, capability probe, single vs multi-plane, stream on/off |
//! | [`negotiate`] | Format, frame size and frame interval enumeration; applying a format |
//! | [`pool`] | Requesting, querying and mapping the fixed set of kernel buffers |
//! | [`capture`] | Queue/dequeue state machine and the blocking wait |
//! | [`pacing`] | Presentation timestamps and lost-frame detection |
//! | [`allocator`] | Refcounted hand-off of mapped slots to an external buffer pool |
//!
//! # Quick Start
//!
//! ```no_run
//! use vincap::camera::Camera;
//! use vincap::fourcc::FourCC;
//!
//! let mut capture = Camera::default()
//!     .with_device("/dev/video0")
//!     .with_resolution(1920, 1080)
//!     .with_format(FourCC(*b"NV21"))
//!     .with_buffers(4)
//!     .open()?;
//!
//! capture.queue_all()?;
//! capture.streamon()?;
//! for _ in 0..10 {
//!     let frame = capture.read()?;
//!     println!("frame {} ({} bytes)", frame.timing().offset, frame.plane(0).len());
//! }
//! capture.close()?;
//! # Ok::<(), vincap::Error>(())
//! ```
//!
//! # Testing without hardware
//!
//! Everything above runs against any [`v4l2::Driver`]. The
//! [`v4l2::VirtualDevice`] is an in-memory capture node used by the test
//! suite and the `vincap capture --virtual` command.

use std::{error, fmt, io, path::PathBuf};

use fourcc::FourCC;
use vincap_sys::nix::errno::Errno;

/// Error type for capture operations
#[derive(Debug)]
pub enum Error {
    /// I/O error outside of the ioctl paths (socket pair, directory scans)
    Io(io::Error),

    /// The device node could not be opened
    DeviceNotFound { path: PathBuf, source: io::Error },

    /// The device opened but advertises no usable capture capability
    NotCapturable { path: PathBuf, capabilities: u32 },

    /// The device does not enumerate the requested pixel format
    UnsupportedFormat(FourCC),

    /// No enumerated frame size matches the requested resolution exactly
    UnsupportedResolution {
        fourcc: FourCC,
        width: u32,
        height: u32,
    },

    /// A control request failed
    Ioctl {
        op: &'static str,
        index: Option<u32>,
        errno: Errno,
    },

    /// Mapping one plane of a buffer slot failed; earlier planes were unmapped
    MapFailed {
        index: u32,
        plane: usize,
        errno: Errno,
    },

    /// The operation is not legal in the slot's or handle's current state
    InvalidState { index: Option<u32>, state: &'static str },

    /// No buffers have been requested and mapped, or none is queued
    NoBuffers,

    /// The stream is off
    NotStreaming,

    /// Every slot already has a live consumer handle
    NoSlotAvailable,

    /// The pool has no size and no configuration callback was supplied
    NotConfigured,

    /// The buffer handle was freed or never issued
    NotAllocated(u32),

    /// A pending wait was woken by the interrupter
    Interrupted,

    /// The optional wait timeout expired
    Timeout,

    /// The handle has been closed
    Closed,

    /// The device or build lacks the named feature
    Unsupported(&'static str),

    /// The vendor ISP library could not be loaded
    #[cfg(feature = "isp")]
    IspLibrary(vincap_sys::isp::libloading::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "I/O error: {}", err),
            Error::DeviceNotFound { path, source } => {
                write!(f, "cannot open {}: {}", path.display(), source)
            }
            Error::NotCapturable { path, capabilities } => write!(
                f,
                "{} is not a capture device (capabilities {:#010x})",
                path.display(),
                capabilities
            ),
            Error::UnsupportedFormat(fourcc) => write!(f, "unsupported pixel format {}", fourcc),
            Error::UnsupportedResolution {
                fourcc,
                width,
                height,
            } => write!(f, "{} does not support {}x{}", fourcc, width, height),
            Error::Ioctl {
                op,
                index: Some(index),
                errno,
            } => write!(f, "{} failed on buffer {}: {}", op, index, errno),
            Error::Ioctl {
                op,
                index: None,
                errno,
            } => write!(f, "{} failed: {}", op, errno),
            Error::MapFailed {
                index,
                plane,
                errno,
            } => write!(f, "mmap of buffer {} plane {} failed: {}", index, plane, errno),
            Error::InvalidState {
                index: Some(index),
                state,
            } => write!(f, "buffer {} is {}", index, state),
            Error::InvalidState { index: None, state } => write!(f, "invalid state: {}", state),
            Error::NoBuffers => write!(f, "no buffers requested or queued"),
            Error::NotStreaming => write!(f, "stream is off"),
            Error::NoSlotAvailable => write!(f, "all buffer slots are in use"),
            Error::NotConfigured => write!(f, "buffer pool is not configured"),
            Error::NotAllocated(index) => write!(f, "buffer handle {} is not allocated", index),
            Error::Interrupted => write!(f, "wait interrupted"),
            Error::Timeout => write!(f, "timed out waiting for a frame"),
            Error::Closed => write!(f, "capture handle is closed"),
            Error::Unsupported(what) => write!(f, "{} is not supported", what),
            #[cfg(feature = "isp")]
            Error::IspLibrary(err) => write!(f, "ISP library could not be loaded: {}", err),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::DeviceNotFound { source, .. } => Some(source),
            Error::Ioctl { errno, .. } => Some(errno),
            Error::MapFailed { errno, .. } => Some(errno),
            #[cfg(feature = "isp")]
            Error::IspLibrary(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

#[cfg(feature = "isp")]
impl From<vincap_sys::isp::libloading::Error> for Error {
    fn from(err: vincap_sys::isp::libloading::Error) -> Self {
        Error::IspLibrary(err)
    }
}

/// Builds the mapper for a failed control request, logging it on the way.
pub(crate) fn ioctl_error(op: &'static str, index: Option<u32>) -> impl FnOnce(Errno) -> Error {
    move |errno| {
        match index {
            Some(index) => log::error!("{} failed on buffer {}: {}", op, index, errno),
            None => log::error!("{} failed: {}", op, errno),
        }
        Error::Ioctl { op, index, errno }
    }
}

/// The fourcc module provides portable handling of fourcc codes.
pub mod fourcc;

/// The format module holds the static pixel format table.
pub mod format;

/// Per-format plane layout and colorimetry defaults.
pub mod geometry;

/// Kernel-facing driver abstraction, device discovery and the virtual device.
pub mod v4l2;

/// The device module owns the capture handle and its session lifecycle.
pub mod device;

/// Format negotiation against the device's enumerated capabilities.
pub mod negotiate;

/// Buffer slot requests, mappings and the slot state table.
pub mod pool;

/// The queue/dequeue state machine.
pub mod capture;

/// Frame timestamps, offsets and lost-frame events.
pub mod pacing;

/// Refcounted hand-off of mapped slots to an external consumer.
pub mod allocator;

/// Optional vendor image signal processor hook.
pub mod isp;

/// The camera module provides a builder for a fully configured capture handle.
pub mod camera;

pub use allocator::{Allocator, BufferHandle, FrameRef};
pub use device::{CaptureHandle, CaptureMode, CaptureType, Interrupter};
pub use negotiate::{Capability, Fraction};
pub use v4l2::MemoryType;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Ioctl {
            op: "VIDIOC_QBUF",
            index: Some(2),
            errno: Errno::EINVAL,
        };
        assert_eq!(
            err.to_string(),
            format!("VIDIOC_QBUF failed on buffer 2: {}", Errno::EINVAL)
        );

        let err = Error::UnsupportedResolution {
            fourcc: FourCC(*b"NV21"),
            width: 1000,
            height: 1000,
        };
        assert_eq!(err.to_string(), "NV21 does not support 1000x1000");
    }

    #[test]
    fn test_error_source() {
        use std::error::Error as _;

        let err = Error::MapFailed {
            index: 0,
            plane: 2,
            errno: Errno::ENOMEM,
        };
        assert!(err.source().is_some());
        assert!(Error::NoSlotAvailable.source().is_none());

        let err = Error::from(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(matches!(err, Error::Io(_)));
        assert!(err.source().is_some());
    }
}
