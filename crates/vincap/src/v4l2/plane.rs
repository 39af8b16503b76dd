// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Single-plane and multi-plane variants of the buffer operations.
//!
//! The variant is chosen once when the handle opens; callers never branch on
//! the plane mode afterwards.

use std::fmt;
use std::time::Duration;

use vincap_sys as ffi;
use vincap_sys::nix::libc;

use super::Driver;
use crate::device::CaptureMode;
use crate::fourcc::FourCC;
use crate::pool::{PlaneRegion, SlotDescriptor};
use crate::{ioctl_error, Error, MemoryType};

/// Format as read back from the device after `VIDIOC_S_FMT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AppliedFormat {
    pub fourcc: FourCC,
    pub width: u32,
    pub height: u32,
    pub sizeimage: Vec<u32>,
    pub bytesperline: Vec<u32>,
}

impl AppliedFormat {
    pub fn n_planes(&self) -> usize {
        self.sizeimage.len()
    }
}

/// What `VIDIOC_DQBUF` reported for one buffer.
#[derive(Debug, Clone)]
pub(crate) struct Dequeued {
    pub index: u32,
    pub sequence: u32,
    pub timestamp: Option<Duration>,
    pub bytesused: Vec<u32>,
    pub flags: u32,
}

fn timeval_to_duration(tv: libc::timeval) -> Option<Duration> {
    if tv.tv_sec < 0 || tv.tv_usec < 0 || (tv.tv_sec == 0 && tv.tv_usec == 0) {
        return None;
    }
    Some(Duration::from_secs(tv.tv_sec as u64) + Duration::from_micros(tv.tv_usec as u64))
}

pub(crate) trait PlaneOps: fmt::Debug {
    fn mode(&self) -> CaptureMode;

    fn buf_type(&self) -> u32 {
        self.mode().buf_type()
    }

    fn set_format(
        &self,
        driver: &dyn Driver,
        fourcc: FourCC,
        width: u32,
        height: u32,
    ) -> Result<AppliedFormat, Error>;

    fn query(
        &self,
        driver: &dyn Driver,
        memory: MemoryType,
        index: u32,
        n_planes: usize,
    ) -> Result<SlotDescriptor, Error>;

    fn queue(
        &self,
        driver: &dyn Driver,
        memory: MemoryType,
        index: u32,
        n_planes: usize,
    ) -> Result<(), Error>;

    fn dequeue(
        &self,
        driver: &dyn Driver,
        memory: MemoryType,
        n_planes: usize,
    ) -> Result<Dequeued, Error>;
}

fn buffer(buf_type: u32, memory: MemoryType, index: u32) -> ffi::v4l2_buffer {
    let mut buf = ffi::v4l2_buffer::default();
    buf.type_ = buf_type;
    buf.memory = memory.to_v4l2();
    buf.index = index;
    buf
}

fn read_format(driver: &dyn Driver, buf_type: u32) -> Result<ffi::v4l2_format, Error> {
    let mut fmt = ffi::v4l2_format::default();
    fmt.type_ = buf_type;
    driver
        .g_fmt(&mut fmt)
        .map_err(ioctl_error("VIDIOC_G_FMT", None))?;
    Ok(fmt)
}

#[derive(Debug)]
pub(crate) struct SinglePlane;

impl PlaneOps for SinglePlane {
    fn mode(&self) -> CaptureMode {
        CaptureMode::SinglePlane
    }

    fn set_format(
        &self,
        driver: &dyn Driver,
        fourcc: FourCC,
        width: u32,
        height: u32,
    ) -> Result<AppliedFormat, Error> {
        let mut fmt = ffi::v4l2_format::default();
        fmt.type_ = self.buf_type();
        fmt.fmt.pix = ffi::v4l2_pix_format {
            width,
            height,
            pixelformat: fourcc.to_v4l2(),
            field: ffi::V4L2_FIELD_NONE,
            ..Default::default()
        };
        driver
            .s_fmt(&mut fmt)
            .map_err(ioctl_error("VIDIOC_S_FMT", None))?;

        let fmt = read_format(driver, self.buf_type())?;
        // SAFETY: the driver filled the single-plane member for this buffer type.
        let pix = unsafe { fmt.fmt.pix };
        Ok(AppliedFormat {
            fourcc: FourCC::from_v4l2(pix.pixelformat),
            width: pix.width,
            height: pix.height,
            sizeimage: vec![pix.sizeimage],
            bytesperline: vec![pix.bytesperline],
        })
    }

    fn query(
        &self,
        driver: &dyn Driver,
        memory: MemoryType,
        index: u32,
        _n_planes: usize,
    ) -> Result<SlotDescriptor, Error> {
        let mut buf = buffer(self.buf_type(), memory, index);
        // SAFETY: single-plane buffers carry no plane array.
        unsafe { driver.querybuf(&mut buf) }
            .map_err(ioctl_error("VIDIOC_QUERYBUF", Some(index)))?;

        Ok(SlotDescriptor {
            index,
            planes: vec![PlaneRegion {
                // SAFETY: MMAP buffers report their offset in this member.
                offset: unsafe { buf.m.offset },
                length: buf.length,
            }],
        })
    }

    fn queue(
        &self,
        driver: &dyn Driver,
        memory: MemoryType,
        index: u32,
        _n_planes: usize,
    ) -> Result<(), Error> {
        let mut buf = buffer(self.buf_type(), memory, index);
        // SAFETY: single-plane buffers carry no plane array.
        unsafe { driver.qbuf(&mut buf) }.map_err(ioctl_error("VIDIOC_QBUF", Some(index)))
    }

    fn dequeue(
        &self,
        driver: &dyn Driver,
        memory: MemoryType,
        _n_planes: usize,
    ) -> Result<Dequeued, Error> {
        let mut buf = buffer(self.buf_type(), memory, 0);
        // SAFETY: single-plane buffers carry no plane array.
        unsafe { driver.dqbuf(&mut buf) }.map_err(ioctl_error("VIDIOC_DQBUF", None))?;

        Ok(Dequeued {
            index: buf.index,
            sequence: buf.sequence,
            timestamp: timeval_to_duration(buf.timestamp),
            bytesused: vec![buf.bytesused],
            flags: buf.flags,
        })
    }
}

#[derive(Debug)]
pub(crate) struct MultiPlane;

impl MultiPlane {
    fn planes(n_planes: usize) -> Vec<ffi::v4l2_plane> {
        vec![ffi::v4l2_plane::default(); n_planes.clamp(1, ffi::VIDEO_MAX_PLANES)]
    }

    fn buffer_with_planes(
        &self,
        memory: MemoryType,
        index: u32,
        planes: &mut [ffi::v4l2_plane],
    ) -> ffi::v4l2_buffer {
        let mut buf = buffer(self.buf_type(), memory, index);
        buf.length = planes.len() as u32;
        buf.m.planes = planes.as_mut_ptr();
        buf
    }
}

impl PlaneOps for MultiPlane {
    fn mode(&self) -> CaptureMode {
        CaptureMode::MultiPlane
    }

    fn set_format(
        &self,
        driver: &dyn Driver,
        fourcc: FourCC,
        width: u32,
        height: u32,
    ) -> Result<AppliedFormat, Error> {
        let mut pix_mp = ffi::v4l2_pix_format_mplane::default();
        pix_mp.width = width;
        pix_mp.height = height;
        pix_mp.pixelformat = fourcc.to_v4l2();
        pix_mp.field = ffi::V4L2_FIELD_NONE;

        let mut fmt = ffi::v4l2_format::default();
        fmt.type_ = self.buf_type();
        fmt.fmt.pix_mp = pix_mp;
        driver
            .s_fmt(&mut fmt)
            .map_err(ioctl_error("VIDIOC_S_FMT", None))?;

        let fmt = read_format(driver, self.buf_type())?;
        // SAFETY: the driver filled the multi-plane member for this buffer type.
        let pix_mp = unsafe { fmt.fmt.pix_mp };
        let n_planes = (pix_mp.num_planes as usize).clamp(1, ffi::VIDEO_MAX_PLANES);
        let plane_fmt = pix_mp.plane_fmt;

        Ok(AppliedFormat {
            fourcc: FourCC::from_v4l2(pix_mp.pixelformat),
            width: pix_mp.width,
            height: pix_mp.height,
            sizeimage: plane_fmt[..n_planes].iter().map(|p| p.sizeimage).collect(),
            bytesperline: plane_fmt[..n_planes]
                .iter()
                .map(|p| p.bytesperline)
                .collect(),
        })
    }

    fn query(
        &self,
        driver: &dyn Driver,
        memory: MemoryType,
        index: u32,
        n_planes: usize,
    ) -> Result<SlotDescriptor, Error> {
        let mut planes = Self::planes(n_planes);
        let mut buf = self.buffer_with_planes(memory, index, &mut planes);
        // SAFETY: buf.m.planes points at `planes`, which outlives the call.
        unsafe { driver.querybuf(&mut buf) }
            .map_err(ioctl_error("VIDIOC_QUERYBUF", Some(index)))?;

        let reported = (buf.length as usize).min(planes.len());
        Ok(SlotDescriptor {
            index,
            planes: planes[..reported]
                .iter()
                .map(|plane| PlaneRegion {
                    // SAFETY: MMAP planes report their offset in this member.
                    offset: unsafe { plane.m.mem_offset },
                    length: plane.length,
                })
                .collect(),
        })
    }

    fn queue(
        &self,
        driver: &dyn Driver,
        memory: MemoryType,
        index: u32,
        n_planes: usize,
    ) -> Result<(), Error> {
        let mut planes = Self::planes(n_planes);
        let mut buf = self.buffer_with_planes(memory, index, &mut planes);
        // SAFETY: buf.m.planes points at `planes`; the kernel copies it during the call.
        unsafe { driver.qbuf(&mut buf) }.map_err(ioctl_error("VIDIOC_QBUF", Some(index)))
    }

    fn dequeue(
        &self,
        driver: &dyn Driver,
        memory: MemoryType,
        n_planes: usize,
    ) -> Result<Dequeued, Error> {
        let mut planes = Self::planes(n_planes);
        let mut buf = self.buffer_with_planes(memory, 0, &mut planes);
        // SAFETY: buf.m.planes points at `planes`, which outlives the call.
        unsafe { driver.dqbuf(&mut buf) }.map_err(ioctl_error("VIDIOC_DQBUF", None))?;

        let reported = (buf.length as usize).min(planes.len());
        Ok(Dequeued {
            index: buf.index,
            sequence: buf.sequence,
            timestamp: timeval_to_duration(buf.timestamp),
            bytesused: planes[..reported].iter().map(|p| p.bytesused).collect(),
            flags: buf.flags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeval_conversion() {
        let zero = libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        };
        assert_eq!(timeval_to_duration(zero), None);

        let tv = libc::timeval {
            tv_sec: 12,
            tv_usec: 500_000,
        };
        assert_eq!(timeval_to_duration(tv), Some(Duration::from_millis(12_500)));
    }

    #[test]
    fn test_plane_array_bounds() {
        assert_eq!(MultiPlane::planes(0).len(), 1);
        assert_eq!(MultiPlane::planes(3).len(), 3);
        assert_eq!(MultiPlane::planes(64).len(), ffi::VIDEO_MAX_PLANES);
    }
}
