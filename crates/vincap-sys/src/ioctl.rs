// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! `VIDIOC_*` entry points.
//!
//! Each function takes the raw descriptor and a pointer to the kernel
//! structure, and returns `nix::Result` carrying the errno on failure.

use crate::*;

const VIDIOC_MAGIC: u8 = b'V';

nix::ioctl_read!(vidioc_querycap, VIDIOC_MAGIC, 0, v4l2_capability);
nix::ioctl_readwrite!(vidioc_enum_fmt, VIDIOC_MAGIC, 2, v4l2_fmtdesc);
nix::ioctl_readwrite!(vidioc_g_fmt, VIDIOC_MAGIC, 4, v4l2_format);
nix::ioctl_readwrite!(vidioc_s_fmt, VIDIOC_MAGIC, 5, v4l2_format);
nix::ioctl_readwrite!(vidioc_reqbufs, VIDIOC_MAGIC, 8, v4l2_requestbuffers);
nix::ioctl_readwrite!(vidioc_querybuf, VIDIOC_MAGIC, 9, v4l2_buffer);
nix::ioctl_readwrite!(vidioc_qbuf, VIDIOC_MAGIC, 15, v4l2_buffer);
nix::ioctl_readwrite!(vidioc_expbuf, VIDIOC_MAGIC, 16, v4l2_exportbuffer);
nix::ioctl_readwrite!(vidioc_dqbuf, VIDIOC_MAGIC, 17, v4l2_buffer);
nix::ioctl_write_ptr!(vidioc_streamon, VIDIOC_MAGIC, 18, v4l2_int);
nix::ioctl_write_ptr!(vidioc_streamoff, VIDIOC_MAGIC, 19, v4l2_int);
nix::ioctl_readwrite!(vidioc_g_parm, VIDIOC_MAGIC, 21, v4l2_streamparm);
nix::ioctl_readwrite!(vidioc_s_parm, VIDIOC_MAGIC, 22, v4l2_streamparm);
nix::ioctl_readwrite!(vidioc_g_ctrl, VIDIOC_MAGIC, 27, v4l2_control);
nix::ioctl_readwrite!(vidioc_queryctrl, VIDIOC_MAGIC, 36, v4l2_queryctrl);
nix::ioctl_readwrite!(vidioc_s_input, VIDIOC_MAGIC, 39, v4l2_int);
nix::ioctl_readwrite!(vidioc_enum_framesizes, VIDIOC_MAGIC, 74, v4l2_frmsizeenum);
nix::ioctl_readwrite!(vidioc_enum_frameintervals, VIDIOC_MAGIC, 75, v4l2_frmivalenum);
