// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Plane layout for the formats in [`crate::format::FORMATS`].
//!
//! Strides are rounded to 4 bytes and 4:2:0 chroma heights round up, which is
//! the layout consumers of the capture buffers expect. Colorimetry defaults
//! follow the frame height: UHD gets BT.2020, HD gets BT.709, anything at or
//! below 576 lines gets BT.601.

use std::fmt;

use crate::format::{ColorFormat, PixelFormatDescriptor};

pub const MAX_PLANES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorRange {
    /// 16-235 luma
    Limited,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorMatrix {
    Bt601,
    Bt709,
    Bt2020,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferFunction {
    Bt709,
    Bt2020_12,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorPrimaries {
    Smpte170m,
    Bt709,
    Bt2020,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Colorimetry {
    pub range: ColorRange,
    pub matrix: ColorMatrix,
    pub transfer: TransferFunction,
    pub primaries: ColorPrimaries,
}

impl Colorimetry {
    pub const BT601: Colorimetry = Colorimetry {
        range: ColorRange::Limited,
        matrix: ColorMatrix::Bt601,
        transfer: TransferFunction::Bt709,
        primaries: ColorPrimaries::Smpte170m,
    };

    pub const BT709: Colorimetry = Colorimetry {
        range: ColorRange::Limited,
        matrix: ColorMatrix::Bt709,
        transfer: TransferFunction::Bt709,
        primaries: ColorPrimaries::Bt709,
    };

    pub const BT2020: Colorimetry = Colorimetry {
        range: ColorRange::Limited,
        matrix: ColorMatrix::Bt2020,
        transfer: TransferFunction::Bt2020_12,
        primaries: ColorPrimaries::Bt2020,
    };

    /// Default for YUV content of the given height.
    pub fn for_height(height: u32) -> Colorimetry {
        if height >= 2160 {
            Colorimetry::BT2020
        } else if height > 576 {
            Colorimetry::BT709
        } else {
            Colorimetry::BT601
        }
    }
}

impl fmt::Display for Colorimetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Colorimetry::BT601 => f.write_str("bt601"),
            Colorimetry::BT709 => f.write_str("bt709"),
            Colorimetry::BT2020 => f.write_str("bt2020"),
            other => write!(
                f,
                "{:?}:{:?}:{:?}:{:?}",
                other.range, other.matrix, other.transfer, other.primaries
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChromaSite {
    Unknown,
    /// Chroma samples aligned with the even luma columns
    HCosited,
}

/// Stride/offset description of one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameGeometry {
    pub color: ColorFormat,
    pub width: u32,
    pub height: u32,
    pub interlaced: bool,
    pub n_planes: usize,
    pub stride: [u32; MAX_PLANES],
    pub offset: [usize; MAX_PLANES],
    pub size: usize,
    pub chroma_site: ChromaSite,
    pub colorimetry: Colorimetry,
}

const fn round_up_2(v: u32) -> u32 {
    (v + 1) & !1
}

const fn round_up_4(v: u32) -> u32 {
    (v + 3) & !3
}

impl FrameGeometry {
    pub fn new(
        desc: &PixelFormatDescriptor,
        width: u32,
        height: u32,
        interlaced: bool,
    ) -> FrameGeometry {
        let mut stride = [0u32; MAX_PLANES];
        let mut offset = [0usize; MAX_PLANES];

        // Interlaced 4:2:0 needs whole chroma lines per field.
        let chroma_rows = if interlaced {
            round_up_4(height) / 2
        } else {
            round_up_2(height) / 2
        };
        let luma_rows = chroma_rows as usize * 2;

        let (n_planes, size) = match desc.color {
            ColorFormat::I420 => {
                stride[0] = round_up_4(width);
                stride[1] = round_up_4(round_up_2(width) / 2);
                stride[2] = stride[1];
                offset[1] = stride[0] as usize * luma_rows;
                offset[2] = offset[1] + stride[1] as usize * chroma_rows as usize;
                (3, offset[2] + stride[2] as usize * chroma_rows as usize)
            }
            ColorFormat::Yuy2 => {
                stride[0] = round_up_4(round_up_2(width) * 2);
                (1, stride[0] as usize * height as usize)
            }
            ColorFormat::Nv12 | ColorFormat::Nv21 => {
                stride[0] = round_up_4(width);
                stride[1] = stride[0];
                offset[1] = stride[0] as usize * luma_rows;
                (2, offset[1] + stride[1] as usize * chroma_rows as usize)
            }
            ColorFormat::Nv16 | ColorFormat::Nv61 => {
                stride[0] = round_up_4(width);
                stride[1] = stride[0];
                offset[1] = stride[0] as usize * height as usize;
                (2, offset[1] * 2)
            }
        };

        let chroma_site = if height > 576 {
            ChromaSite::HCosited
        } else {
            ChromaSite::Unknown
        };

        FrameGeometry {
            color: desc.color,
            width,
            height,
            interlaced,
            n_planes,
            stride,
            offset,
            size,
            chroma_site,
            colorimetry: Colorimetry::for_height(height),
        }
    }

    /// Bytes of plane `plane` within a contiguous frame.
    pub fn plane_size(&self, plane: usize) -> usize {
        if plane >= self.n_planes {
            return 0;
        }
        let end = if plane + 1 < self.n_planes {
            self.offset[plane + 1]
        } else {
            self.size
        };
        end - self.offset[plane]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{format::lookup, fourcc::FourCC};

    #[test]
    fn test_nv21_1080p() {
        let geom = FrameGeometry::new(lookup(FourCC::NV21).unwrap(), 1920, 1080, false);
        assert_eq!(geom.n_planes, 2);
        assert_eq!(geom.stride[0], 1920);
        assert_eq!(geom.offset[1], 1920 * 1080);
        assert_eq!(geom.size, 1920 * 1080 * 3 / 2);
        assert_eq!(geom.plane_size(1), 1920 * 540);
        assert_eq!(geom.colorimetry, Colorimetry::BT709);
        assert_eq!(geom.chroma_site, ChromaSite::HCosited);
    }

    #[test]
    fn test_i420_odd_size() {
        let geom = FrameGeometry::new(lookup(FourCC::I420).unwrap(), 321, 241, false);
        assert_eq!(geom.n_planes, 3);
        assert_eq!(geom.stride[0], 324);
        assert_eq!(geom.stride[1], 164);
        assert_eq!(geom.offset[1], 324 * 242);
        assert_eq!(geom.offset[2], 324 * 242 + 164 * 121);
        assert_eq!(geom.size, 324 * 242 + 2 * 164 * 121);
    }

    #[test]
    fn test_packed_and_422() {
        let yuyv = FrameGeometry::new(lookup(FourCC::YUYV).unwrap(), 640, 480, false);
        assert_eq!(yuyv.n_planes, 1);
        assert_eq!(yuyv.stride[0], 1280);
        assert_eq!(yuyv.size, 1280 * 480);
        assert_eq!(yuyv.plane_size(1), 0);

        let nv16 = FrameGeometry::new(lookup(FourCC::NV16).unwrap(), 640, 480, false);
        assert_eq!(nv16.size, 640 * 480 * 2);
    }

    #[test]
    fn test_interlaced_chroma_rows() {
        let geom = FrameGeometry::new(lookup(FourCC::NV12).unwrap(), 720, 486, true);
        assert_eq!(geom.offset[1], 720 * 488);
        assert_eq!(geom.size, 720 * 488 + 720 * 244);
    }

    #[test]
    fn test_colorimetry_defaults() {
        assert_eq!(Colorimetry::for_height(480), Colorimetry::BT601);
        assert_eq!(Colorimetry::for_height(576), Colorimetry::BT601);
        assert_eq!(Colorimetry::for_height(720), Colorimetry::BT709);
        assert_eq!(Colorimetry::for_height(2160), Colorimetry::BT2020);
        assert_eq!(Colorimetry::BT709.to_string(), "bt709");
    }
}
