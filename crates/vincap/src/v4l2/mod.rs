// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! V4L2 device access, discovery and emulation
//!
//! This module holds everything that talks to a capture node directly:
//!
//! - **Driver seam**: [`Driver`] has one method per control request the
//!   capture path issues, plus buffer mapping and the readiness wait.
//!   [`V4l2Device`] forwards to a real `/dev/video*` node.
//! - **Device Enumeration**: [`DeviceEnumerator`] scans `/dev/video*`, keeps
//!   the capture nodes and queries their formats and frame sizes.
//! - **Virtual device**: [`VirtualDevice`] emulates a capture node in memory,
//!   including failure injection, for tests and demos.
//!
//! # Quick Start
//!
//! ```no_run
//! use vincap::v4l2::DeviceEnumerator;
//!
//! for device in DeviceEnumerator::enumerate()? {
//!     println!("{}", device);
//!     for format in device.formats() {
//!         println!("  {} {:?}", format, format.resolutions);
//!     }
//! }
//! # Ok::<(), vincap::Error>(())
//! ```
//!
//! # Memory Types
//!
//! | Mode | Description | Mapped |
//! |------|-------------|--------|
//! | [`MemoryType::Mmap`] | Kernel allocates, user mmaps | Yes |
//! | [`MemoryType::UserPtr`] | User allocates, passes pointer | No |
//! | [`MemoryType::DmaBuf`] | User passes dmabuf fd | No |
//!
//! MMAP buffers can still be shared zero-copy through
//! [`CaptureHandle::export_dmabuf`](crate::CaptureHandle::export_dmabuf).
//!
//! # See Also
//!
//! - [`DeviceEnumerator`] - Entry point for device discovery
//! - [`DeviceInfo`] - Node identity, capabilities and formats
//! - [`VirtualDevice`] - In-memory capture node

pub(crate) mod device;
mod driver;
mod enumerator;
pub(crate) mod plane;
mod virtual_device;

pub use device::{DeviceInfo, Format, MemoryType, Resolution};
pub use driver::{Access, Driver, Readiness, V4l2Device};
pub use enumerator::DeviceEnumerator;
pub use virtual_device::{
    FrameSizes, FrameIntervals, TimestampMode, VirtualDevice, VirtualFormat, VirtualStats,
};
