// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Static pixel format table.
//!
//! Maps device-native fourcc codes to a neutral [`ColorFormat`] tag used by
//! the layout calculator and by capability strings. The table is immutable and
//! has no duplicate fourcc codes; several device codes may share one tag
//! (`YUYV` and `YUY2` are the same packed 4:2:2 layout).
//!
//! | FourCC | Tag | Bits/pixel |
//! |--------|-----|------------|
//! | `I420` | I420 | 12 |
//! | `YUY2` | YUY2 | 16 |
//! | `YUYV` | YUY2 | 16 |
//! | `NV12` | NV12 | 12 |
//! | `NV16` | NV16 | 16 |
//! | `NV21` | NV21 | 12 |
//! | `NV61` | NV61 | 16 |

use std::fmt;

use crate::fourcc::FourCC;

/// Neutral color format tag, independent of the device's code for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorFormat {
    /// Planar 4:2:0, Y then U then V
    I420,
    /// Packed 4:2:2, Y0 U Y1 V
    Yuy2,
    /// Semi-planar 4:2:0, interleaved UV
    Nv12,
    /// Semi-planar 4:2:2, interleaved UV
    Nv16,
    /// Semi-planar 4:2:0, interleaved VU
    Nv21,
    /// Semi-planar 4:2:2, interleaved VU
    Nv61,
}

impl ColorFormat {
    /// Name used in capability strings (`format=(string)NV21`).
    pub fn name(&self) -> &'static str {
        match self {
            ColorFormat::I420 => "I420",
            ColorFormat::Yuy2 => "YUY2",
            ColorFormat::Nv12 => "NV12",
            ColorFormat::Nv16 => "NV16",
            ColorFormat::Nv21 => "NV21",
            ColorFormat::Nv61 => "NV61",
        }
    }

    pub fn from_name(name: &str) -> Option<ColorFormat> {
        FORMATS
            .iter()
            .map(|desc| desc.color)
            .find(|color| color.name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for ColorFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Capability flags carried by a format entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FormatFlags(u32);

impl FormatFlags {
    pub const NONE: FormatFlags = FormatFlags(0);
    /// Compressed bitstream rather than raw pixels
    pub const COMPRESSED: FormatFlags = FormatFlags(vincap_sys::V4L2_FMT_FLAG_COMPRESSED);
    /// Converted in software by the driver or libv4l
    pub const EMULATED: FormatFlags = FormatFlags(vincap_sys::V4L2_FMT_FLAG_EMULATED);

    pub const fn from_bits(bits: u32) -> FormatFlags {
        FormatFlags(bits)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn contains(&self, other: FormatFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// One immutable entry of the format table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelFormatDescriptor {
    pub fourcc: FourCC,
    pub color: ColorFormat,
    pub bits_per_pixel: u32,
    pub flags: FormatFlags,
}

impl PixelFormatDescriptor {
    const fn new(fourcc: FourCC, color: ColorFormat, bits_per_pixel: u32) -> Self {
        PixelFormatDescriptor {
            fourcc,
            color,
            bits_per_pixel,
            flags: FormatFlags::NONE,
        }
    }

    /// Capability-string template for this format, without size or rate.
    pub fn caps_template(&self) -> String {
        format!("video/x-raw, format=(string){}", self.color.name())
    }
}

/// The process-wide format table.
pub static FORMATS: [PixelFormatDescriptor; 7] = [
    PixelFormatDescriptor::new(FourCC::I420, ColorFormat::I420, 12),
    PixelFormatDescriptor::new(FourCC::YUY2, ColorFormat::Yuy2, 16),
    PixelFormatDescriptor::new(FourCC::YUYV, ColorFormat::Yuy2, 16),
    PixelFormatDescriptor::new(FourCC::NV12, ColorFormat::Nv12, 12),
    PixelFormatDescriptor::new(FourCC::NV16, ColorFormat::Nv16, 16),
    PixelFormatDescriptor::new(FourCC::NV21, ColorFormat::Nv21, 12),
    PixelFormatDescriptor::new(FourCC::NV61, ColorFormat::Nv61, 16),
];

/// Find the entry for a device-native code.
pub fn lookup(fourcc: FourCC) -> Option<&'static PixelFormatDescriptor> {
    FORMATS.iter().find(|desc| desc.fourcc == fourcc)
}

/// First entry carrying the given tag; this is the code requested from the
/// device when a consumer asks for a neutral format.
pub fn lookup_color(color: ColorFormat) -> Option<&'static PixelFormatDescriptor> {
    FORMATS.iter().find(|desc| desc.color == color)
}

const RAW_BAYER: [FourCC; 12] = [
    FourCC(*b"BA81"),
    FourCC(*b"GBRG"),
    FourCC(*b"GRBG"),
    FourCC(*b"RGGB"),
    FourCC(*b"BG10"),
    FourCC(*b"GB10"),
    FourCC(*b"BA10"),
    FourCC(*b"RG10"),
    FourCC(*b"BG12"),
    FourCC(*b"GB12"),
    FourCC(*b"BA12"),
    FourCC(*b"RG12"),
];

/// Raw Bayer captures bypass the ISP.
pub fn is_raw_bayer(fourcc: FourCC) -> bool {
    RAW_BAYER.contains(&fourcc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_no_duplicate_codes() {
        let codes: HashSet<FourCC> = FORMATS.iter().map(|d| d.fourcc).collect();
        assert_eq!(codes.len(), FORMATS.len());
    }

    #[test]
    fn test_lookup() {
        let desc = lookup(FourCC::NV21).unwrap();
        assert_eq!(desc.color, ColorFormat::Nv21);
        assert_eq!(desc.bits_per_pixel, 12);
        assert!(lookup(FourCC(*b"MJPG")).is_none());

        assert_eq!(lookup(FourCC::YUYV).unwrap().color, ColorFormat::Yuy2);
        assert_eq!(lookup_color(ColorFormat::Yuy2).unwrap().fourcc, FourCC::YUY2);
    }

    #[test]
    fn test_color_names() {
        assert_eq!(ColorFormat::from_name("nv21"), Some(ColorFormat::Nv21));
        assert_eq!(ColorFormat::from_name("YUY2"), Some(ColorFormat::Yuy2));
        assert_eq!(ColorFormat::from_name("RGBx"), None);
        assert_eq!(
            lookup(FourCC::NV12).unwrap().caps_template(),
            "video/x-raw, format=(string)NV12"
        );
    }

    #[test]
    fn test_raw_bayer() {
        assert!(is_raw_bayer(FourCC(*b"BA10")));
        assert!(!is_raw_bayer(FourCC::NV21));
    }

    #[test]
    fn test_flags() {
        let flags = FormatFlags::from_bits(vincap_sys::V4L2_FMT_FLAG_EMULATED);
        assert!(flags.contains(FormatFlags::EMULATED));
        assert!(!flags.contains(FormatFlags::COMPRESSED));
        assert!(flags.contains(FormatFlags::NONE));
    }
}
