// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies
//
// V4L2 pixel format codes are stored little-endian regardless of host order.
#![forbid(unsafe_code)]

use core::{fmt, str::FromStr};

/// Four-character pixel format code, stored in reading order (`b"NV21"`).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    pub const NV12: FourCC = FourCC(*b"NV12");
    pub const NV21: FourCC = FourCC(*b"NV21");
    pub const NV16: FourCC = FourCC(*b"NV16");
    pub const NV61: FourCC = FourCC(*b"NV61");
    pub const YUYV: FourCC = FourCC(*b"YUYV");
    pub const YUY2: FourCC = FourCC(*b"YUY2");
    pub const I420: FourCC = FourCC(*b"I420");

    /// The value the kernel expects in `pixelformat` fields.
    pub const fn to_v4l2(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    pub const fn from_v4l2(code: u32) -> FourCC {
        FourCC(code.to_le_bytes())
    }
}

impl From<&[u8; 4]> for FourCC {
    fn from(buf: &[u8; 4]) -> FourCC {
        FourCC(*buf)
    }
}

impl From<u32> for FourCC {
    fn from(val: u32) -> FourCC {
        FourCC::from_v4l2(val)
    }
}

impl From<FourCC> for u32 {
    fn from(val: FourCC) -> Self {
        val.to_v4l2()
    }
}

/// Error returned when a string is not exactly four ASCII characters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFourCCError(pub String);

impl fmt::Display for ParseFourCCError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FOURCC must be exactly 4 ASCII characters: {:?}", self.0)
    }
}

impl std::error::Error for ParseFourCCError {}

impl FromStr for FourCC {
    type Err = ParseFourCCError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 4 || !s.is_ascii() {
            return Err(ParseFourCCError(s.to_owned()));
        }
        Ok(FourCC([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match core::str::from_utf8(&self.0) {
            Ok(s) => f.write_str(s),
            // Returning fmt::Error would make format!() panic.
            Err(_) => {
                for b in self.0 {
                    write!(f, "{}", core::ascii::escape_default(b))?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FourCC")
            .field(&format_args!("{}", self))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v4l2_code() {
        assert_eq!(FourCC::YUYV.to_v4l2(), 0x5659_5559);
        assert_eq!(FourCC::NV12.to_v4l2(), 0x3231_564e);
        assert_eq!(FourCC::from(0x3132_564e), FourCC::NV21);
        assert_eq!(u32::from(FourCC::NV21), 0x3132_564e);
    }

    #[test]
    fn test_parse() {
        assert_eq!("NV21".parse::<FourCC>().unwrap(), FourCC::NV21);
        assert!("NV2".parse::<FourCC>().is_err());
        assert!("NV211".parse::<FourCC>().is_err());
        assert!("".parse::<FourCC>().is_err());
    }

    #[test]
    fn test_display_non_utf8() {
        let code = FourCC([b'A', 0xff, b'B', b'C']);
        assert_eq!(code.to_string(), "A\\xffBC");
        assert_eq!(format!("{:?}", FourCC::I420), "FourCC(I420)");
    }
}
