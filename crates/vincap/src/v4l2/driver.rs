// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! The [`Driver`] seam between the capture state machine and the kernel.
//!
//! Every control request the capture path issues goes through this trait, one
//! method per `VIDIOC_*` request, plus buffer mapping and the readiness wait.
//! [`V4l2Device`] forwards to a real `/dev/video*` node; the
//! [`VirtualDevice`](super::VirtualDevice) emulates one in memory.

use std::{
    ffi::c_void,
    fs::{File, OpenOptions},
    num::NonZeroUsize,
    os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd},
    path::{Path, PathBuf},
    ptr::NonNull,
    rc::Rc,
    time::{Duration, Instant},
};

use vincap_sys as ffi;
use vincap_sys::nix::{
    self,
    errno::Errno,
    libc,
    poll::{poll, PollFd, PollFlags, PollTimeout},
    sys::mman::{mmap, munmap, MapFlags, ProtFlags},
};

/// Outcome of [`Driver::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// At least one buffer can be dequeued
    Ready,
    /// The interrupt descriptor became readable
    Interrupted,
    /// The timeout passed without a buffer
    TimedOut,
}

/// Access requested when mapping a buffer plane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Access {
    Read,
    #[default]
    ReadWrite,
}

impl Access {
    fn prot(self) -> ProtFlags {
        match self {
            Access::Read => ProtFlags::PROT_READ,
            Access::ReadWrite => ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
        }
    }
}

/// Control-request interface of a V4L2 capture node.
///
/// Methods take the kernel structure by mutable reference and return the raw
/// errno on failure; callers attach the operation name and log.
pub trait Driver {
    fn querycap(&self, cap: &mut ffi::v4l2_capability) -> nix::Result<()>;
    fn enum_fmt(&self, desc: &mut ffi::v4l2_fmtdesc) -> nix::Result<()>;
    fn enum_framesizes(&self, size: &mut ffi::v4l2_frmsizeenum) -> nix::Result<()>;
    fn enum_frameintervals(&self, ival: &mut ffi::v4l2_frmivalenum) -> nix::Result<()>;
    fn g_fmt(&self, fmt: &mut ffi::v4l2_format) -> nix::Result<()>;
    fn s_fmt(&self, fmt: &mut ffi::v4l2_format) -> nix::Result<()>;
    fn g_parm(&self, parm: &mut ffi::v4l2_streamparm) -> nix::Result<()>;
    fn s_parm(&self, parm: &mut ffi::v4l2_streamparm) -> nix::Result<()>;
    fn reqbufs(&self, req: &mut ffi::v4l2_requestbuffers) -> nix::Result<()>;

    /// # Safety
    ///
    /// For multi-plane buffer types `buf.m.planes` must point to `buf.length`
    /// writable `v4l2_plane` entries.
    unsafe fn querybuf(&self, buf: &mut ffi::v4l2_buffer) -> nix::Result<()>;

    /// # Safety
    ///
    /// Same plane array requirement as [`Driver::querybuf`].
    unsafe fn qbuf(&self, buf: &mut ffi::v4l2_buffer) -> nix::Result<()>;

    /// # Safety
    ///
    /// Same plane array requirement as [`Driver::querybuf`].
    unsafe fn dqbuf(&self, buf: &mut ffi::v4l2_buffer) -> nix::Result<()>;

    fn expbuf(&self, exp: &mut ffi::v4l2_exportbuffer) -> nix::Result<()>;
    fn streamon(&self, buf_type: u32) -> nix::Result<()>;
    fn streamoff(&self, buf_type: u32) -> nix::Result<()>;
    fn queryctrl(&self, ctrl: &mut ffi::v4l2_queryctrl) -> nix::Result<()>;
    fn g_ctrl(&self, ctrl: &mut ffi::v4l2_control) -> nix::Result<()>;
    fn s_input(&self, index: i32) -> nix::Result<()>;

    /// Map `length` bytes at the kernel-reported `offset` with shared semantics.
    fn map(&self, length: usize, offset: u32, access: Access) -> nix::Result<NonNull<c_void>>;

    /// # Safety
    ///
    /// `addr` and `length` must come from one earlier [`Driver::map`] call on
    /// this driver, and no reference into the region may outlive the call.
    unsafe fn unmap(&self, addr: NonNull<c_void>, length: usize) -> nix::Result<()>;

    /// Block until a buffer is ready, `interrupt` is readable or `timeout` passes.
    fn wait(&self, interrupt: BorrowedFd<'_>, timeout: Option<Duration>)
        -> nix::Result<Readiness>;
}

impl<D: Driver + ?Sized> Driver for Rc<D> {
    fn querycap(&self, cap: &mut ffi::v4l2_capability) -> nix::Result<()> {
        (**self).querycap(cap)
    }
    fn enum_fmt(&self, desc: &mut ffi::v4l2_fmtdesc) -> nix::Result<()> {
        (**self).enum_fmt(desc)
    }
    fn enum_framesizes(&self, size: &mut ffi::v4l2_frmsizeenum) -> nix::Result<()> {
        (**self).enum_framesizes(size)
    }
    fn enum_frameintervals(&self, ival: &mut ffi::v4l2_frmivalenum) -> nix::Result<()> {
        (**self).enum_frameintervals(ival)
    }
    fn g_fmt(&self, fmt: &mut ffi::v4l2_format) -> nix::Result<()> {
        (**self).g_fmt(fmt)
    }
    fn s_fmt(&self, fmt: &mut ffi::v4l2_format) -> nix::Result<()> {
        (**self).s_fmt(fmt)
    }
    fn g_parm(&self, parm: &mut ffi::v4l2_streamparm) -> nix::Result<()> {
        (**self).g_parm(parm)
    }
    fn s_parm(&self, parm: &mut ffi::v4l2_streamparm) -> nix::Result<()> {
        (**self).s_parm(parm)
    }
    fn reqbufs(&self, req: &mut ffi::v4l2_requestbuffers) -> nix::Result<()> {
        (**self).reqbufs(req)
    }
    unsafe fn querybuf(&self, buf: &mut ffi::v4l2_buffer) -> nix::Result<()> {
        unsafe { (**self).querybuf(buf) }
    }
    unsafe fn qbuf(&self, buf: &mut ffi::v4l2_buffer) -> nix::Result<()> {
        unsafe { (**self).qbuf(buf) }
    }
    unsafe fn dqbuf(&self, buf: &mut ffi::v4l2_buffer) -> nix::Result<()> {
        unsafe { (**self).dqbuf(buf) }
    }
    fn expbuf(&self, exp: &mut ffi::v4l2_exportbuffer) -> nix::Result<()> {
        (**self).expbuf(exp)
    }
    fn streamon(&self, buf_type: u32) -> nix::Result<()> {
        (**self).streamon(buf_type)
    }
    fn streamoff(&self, buf_type: u32) -> nix::Result<()> {
        (**self).streamoff(buf_type)
    }
    fn queryctrl(&self, ctrl: &mut ffi::v4l2_queryctrl) -> nix::Result<()> {
        (**self).queryctrl(ctrl)
    }
    fn g_ctrl(&self, ctrl: &mut ffi::v4l2_control) -> nix::Result<()> {
        (**self).g_ctrl(ctrl)
    }
    fn s_input(&self, index: i32) -> nix::Result<()> {
        (**self).s_input(index)
    }
    fn map(&self, length: usize, offset: u32, access: Access) -> nix::Result<NonNull<c_void>> {
        (**self).map(length, offset, access)
    }
    unsafe fn unmap(&self, addr: NonNull<c_void>, length: usize) -> nix::Result<()> {
        unsafe { (**self).unmap(addr, length) }
    }
    fn wait(
        &self,
        interrupt: BorrowedFd<'_>,
        timeout: Option<Duration>,
    ) -> nix::Result<Readiness> {
        (**self).wait(interrupt, timeout)
    }
}

/// A `/dev/video*` node opened read/write.
#[derive(Debug)]
pub struct V4l2Device {
    file: File,
    path: PathBuf,
}

impl V4l2Device {
    pub fn open<P: AsRef<Path>>(path: P) -> std::io::Result<V4l2Device> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(V4l2Device {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl AsFd for V4l2Device {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl Driver for V4l2Device {
    fn querycap(&self, cap: &mut ffi::v4l2_capability) -> nix::Result<()> {
        unsafe { ffi::vidioc_querycap(self.fd(), cap) }.map(drop)
    }

    fn enum_fmt(&self, desc: &mut ffi::v4l2_fmtdesc) -> nix::Result<()> {
        unsafe { ffi::vidioc_enum_fmt(self.fd(), desc) }.map(drop)
    }

    fn enum_framesizes(&self, size: &mut ffi::v4l2_frmsizeenum) -> nix::Result<()> {
        unsafe { ffi::vidioc_enum_framesizes(self.fd(), size) }.map(drop)
    }

    fn enum_frameintervals(&self, ival: &mut ffi::v4l2_frmivalenum) -> nix::Result<()> {
        unsafe { ffi::vidioc_enum_frameintervals(self.fd(), ival) }.map(drop)
    }

    fn g_fmt(&self, fmt: &mut ffi::v4l2_format) -> nix::Result<()> {
        unsafe { ffi::vidioc_g_fmt(self.fd(), fmt) }.map(drop)
    }

    fn s_fmt(&self, fmt: &mut ffi::v4l2_format) -> nix::Result<()> {
        unsafe { ffi::vidioc_s_fmt(self.fd(), fmt) }.map(drop)
    }

    fn g_parm(&self, parm: &mut ffi::v4l2_streamparm) -> nix::Result<()> {
        unsafe { ffi::vidioc_g_parm(self.fd(), parm) }.map(drop)
    }

    fn s_parm(&self, parm: &mut ffi::v4l2_streamparm) -> nix::Result<()> {
        unsafe { ffi::vidioc_s_parm(self.fd(), parm) }.map(drop)
    }

    fn reqbufs(&self, req: &mut ffi::v4l2_requestbuffers) -> nix::Result<()> {
        unsafe { ffi::vidioc_reqbufs(self.fd(), req) }.map(drop)
    }

    unsafe fn querybuf(&self, buf: &mut ffi::v4l2_buffer) -> nix::Result<()> {
        unsafe { ffi::vidioc_querybuf(self.fd(), buf) }.map(drop)
    }

    unsafe fn qbuf(&self, buf: &mut ffi::v4l2_buffer) -> nix::Result<()> {
        unsafe { ffi::vidioc_qbuf(self.fd(), buf) }.map(drop)
    }

    unsafe fn dqbuf(&self, buf: &mut ffi::v4l2_buffer) -> nix::Result<()> {
        unsafe { ffi::vidioc_dqbuf(self.fd(), buf) }.map(drop)
    }

    fn expbuf(&self, exp: &mut ffi::v4l2_exportbuffer) -> nix::Result<()> {
        unsafe { ffi::vidioc_expbuf(self.fd(), exp) }.map(drop)
    }

    fn streamon(&self, buf_type: u32) -> nix::Result<()> {
        let buf_type = buf_type as ffi::v4l2_int;
        unsafe { ffi::vidioc_streamon(self.fd(), &buf_type) }.map(drop)
    }

    fn streamoff(&self, buf_type: u32) -> nix::Result<()> {
        let buf_type = buf_type as ffi::v4l2_int;
        unsafe { ffi::vidioc_streamoff(self.fd(), &buf_type) }.map(drop)
    }

    fn queryctrl(&self, ctrl: &mut ffi::v4l2_queryctrl) -> nix::Result<()> {
        unsafe { ffi::vidioc_queryctrl(self.fd(), ctrl) }.map(drop)
    }

    fn g_ctrl(&self, ctrl: &mut ffi::v4l2_control) -> nix::Result<()> {
        unsafe { ffi::vidioc_g_ctrl(self.fd(), ctrl) }.map(drop)
    }

    fn s_input(&self, index: i32) -> nix::Result<()> {
        let mut index = index as ffi::v4l2_int;
        unsafe { ffi::vidioc_s_input(self.fd(), &mut index) }.map(drop)
    }

    fn map(&self, length: usize, offset: u32, access: Access) -> nix::Result<NonNull<c_void>> {
        let length = NonZeroUsize::new(length).ok_or(Errno::EINVAL)?;
        unsafe {
            mmap(
                None,
                length,
                access.prot(),
                MapFlags::MAP_SHARED,
                &self.file,
                offset as libc::off_t,
            )
        }
    }

    unsafe fn unmap(&self, addr: NonNull<c_void>, length: usize) -> nix::Result<()> {
        unsafe { munmap(addr, length) }
    }

    fn wait(
        &self,
        interrupt: BorrowedFd<'_>,
        timeout: Option<Duration>,
    ) -> nix::Result<Readiness> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        loop {
            let poll_timeout = match deadline {
                None => PollTimeout::NONE,
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    // Longer waits go round the loop again.
                    let ms = remaining.as_millis().min(u16::MAX as u128) as u16;
                    PollTimeout::from(ms)
                }
            };

            let mut fds = [
                PollFd::new(self.file.as_fd(), PollFlags::POLLIN),
                PollFd::new(interrupt, PollFlags::POLLIN),
            ];

            match poll(&mut fds, poll_timeout) {
                Ok(0) => {
                    if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                        return Ok(Readiness::TimedOut);
                    }
                }
                Ok(_) => {
                    let woken = fds[1]
                        .revents()
                        .is_some_and(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP));
                    if woken {
                        return Ok(Readiness::Interrupted);
                    }

                    let revents = fds[0].revents().unwrap_or(PollFlags::empty());
                    if let Some(readiness) = device_events(revents)? {
                        return Ok(readiness);
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err),
            }
        }
    }
}

/// Map the capture descriptor's poll events; `None` means poll again.
///
/// A hung-up or invalid descriptor is an error even without `POLLERR`.
fn device_events(revents: PollFlags) -> nix::Result<Option<Readiness>> {
    if revents.contains(PollFlags::POLLNVAL) {
        return Err(Errno::EBADF);
    }
    if revents.contains(PollFlags::POLLERR) {
        return Err(Errno::EIO);
    }
    if revents.contains(PollFlags::POLLIN) {
        return Ok(Some(Readiness::Ready));
    }
    if revents.contains(PollFlags::POLLHUP) {
        return Err(Errno::EIO);
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_events() {
        assert_eq!(device_events(PollFlags::POLLIN), Ok(Some(Readiness::Ready)));
        assert_eq!(device_events(PollFlags::empty()), Ok(None));
        assert_eq!(device_events(PollFlags::POLLERR), Err(Errno::EIO));
        assert_eq!(
            device_events(PollFlags::POLLIN | PollFlags::POLLERR),
            Err(Errno::EIO)
        );
    }

    #[test]
    fn test_unplugged_device_stops_waiting() {
        assert_eq!(device_events(PollFlags::POLLHUP), Err(Errno::EIO));
        assert_eq!(device_events(PollFlags::POLLNVAL), Err(Errno::EBADF));
        // Buffers already filled before the hang-up are still handed out.
        assert_eq!(
            device_events(PollFlags::POLLIN | PollFlags::POLLHUP),
            Ok(Some(Readiness::Ready))
        );
    }
}
