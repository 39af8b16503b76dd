// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Format negotiation against the device's enumerated capabilities.
//!
//! Enumeration walks formats, then frame sizes per format, then frame
//! intervals per size. Continuous and stepwise ranges contribute a single
//! candidate at their maximum. Size matching is exact.
//!
//! V4L2 describes rates as a time per frame; [`Fraction`] always holds frames
//! per second and inverts at the ioctl boundary.

use std::{collections::VecDeque, fmt, num::ParseIntError, str::FromStr, time::Duration};

use vincap_sys as ffi;
use vincap_sys::nix::errno::Errno;

use crate::{
    device::{CaptureHandle, NegotiatedFormat},
    format::{self, FormatFlags, PixelFormatDescriptor},
    fourcc::FourCC,
    geometry::FrameGeometry,
    ioctl_error,
    v4l2::{device::c_string, Driver, Format, Resolution},
    Error,
};

/// Frames per second as a ratio, e.g. `30/1` or `30000/1001`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fraction {
    pub numerator: u32,
    pub denominator: u32,
}

impl Fraction {
    pub const fn new(numerator: u32, denominator: u32) -> Fraction {
        Fraction {
            numerator,
            denominator,
        }
    }

    /// Rate from a V4L2 time-per-frame interval.
    pub fn from_interval(interval: ffi::v4l2_fract) -> Fraction {
        Fraction::new(interval.denominator, interval.numerator)
    }

    /// V4L2 time-per-frame interval for this rate.
    pub fn to_interval(self) -> ffi::v4l2_fract {
        ffi::v4l2_fract {
            numerator: self.denominator,
            denominator: self.numerator,
        }
    }

    pub fn is_valid(self) -> bool {
        self.numerator != 0 && self.denominator != 0
    }

    /// Duration of one frame, `None` for a zero rate.
    pub fn frame_duration(self) -> Option<Duration> {
        if !self.is_valid() {
            return None;
        }
        let nanos = 1_000_000_000u64 * u64::from(self.denominator) / u64::from(self.numerator);
        Some(Duration::from_nanos(nanos))
    }

    pub fn as_f64(self) -> f64 {
        if self.denominator == 0 {
            return 0.0;
        }
        f64::from(self.numerator) / f64::from(self.denominator)
    }
}

impl Default for Fraction {
    fn default() -> Self {
        Fraction::new(30, 1)
    }
}

impl fmt::Display for Fraction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFractionError(String);

impl fmt::Display for ParseFractionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid frame rate '{}', expected N or N/D", self.0)
    }
}

impl std::error::Error for ParseFractionError {}

impl FromStr for Fraction {
    type Err = ParseFractionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |_: ParseIntError| ParseFractionError(s.to_owned());
        let (num, den) = match s.trim().split_once('/') {
            Some((num, den)) => (num.trim().parse().map_err(err)?, den.trim().parse().map_err(err)?),
            None => (s.trim().parse().map_err(err)?, 1),
        };
        if den == 0 {
            return Err(ParseFractionError(s.to_owned()));
        }
        Ok(Fraction::new(num, den))
    }
}

/// One (format, size, rate) combination the device supports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    pub format: &'static PixelFormatDescriptor,
    pub width: u32,
    pub height: u32,
    pub frame_rate: Fraction,
    pub interlaced: bool,
}

impl Capability {
    pub fn fourcc(&self) -> FourCC {
        self.format.fourcc
    }

    /// Plane layout of a frame with this format and size.
    pub fn geometry(&self) -> FrameGeometry {
        FrameGeometry::new(self.format, self.width, self.height, self.interlaced)
    }

    /// Render as a raw-video capability string.
    pub fn caps_string(&self) -> String {
        let mut caps = format!(
            "{}, width=(int){}, height=(int){}, framerate=(fraction){}",
            self.format.caps_template(),
            self.width,
            self.height,
            self.frame_rate
        );
        if self.interlaced {
            caps.push_str(", interlace-mode=(string)interleaved");
        }
        caps
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}x{} @ {}",
            self.format.fourcc, self.width, self.height, self.frame_rate
        )
    }
}

/// One entry of `VIDIOC_ENUM_FRAMESIZES`. Ranges report their maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FrameSize {
    pub index: u32,
    pub width: u32,
    pub height: u32,
    /// Continuous or stepwise: no further entries follow
    pub range: bool,
}

/// Enumeration past the last entry, or no enumeration support at all.
fn is_end(errno: Errno) -> bool {
    matches!(errno, Errno::EINVAL | Errno::ENOTTY)
}

pub(crate) fn enum_format(
    driver: &dyn Driver,
    buf_type: u32,
    index: u32,
) -> Result<Option<ffi::v4l2_fmtdesc>, Error> {
    let mut desc = ffi::v4l2_fmtdesc {
        index,
        type_: buf_type,
        ..Default::default()
    };
    match driver.enum_fmt(&mut desc) {
        Ok(()) => Ok(Some(desc)),
        Err(Errno::EINVAL) => Ok(None),
        Err(errno) => Err(ioctl_error("VIDIOC_ENUM_FMT", None)(errno)),
    }
}

pub(crate) fn enum_frame_size(
    driver: &dyn Driver,
    pixelformat: u32,
    index: u32,
) -> Result<Option<FrameSize>, Error> {
    let mut size = ffi::v4l2_frmsizeenum {
        index,
        pixel_format: pixelformat,
        ..Default::default()
    };
    match driver.enum_framesizes(&mut size) {
        Ok(()) => {}
        Err(errno) if is_end(errno) => return Ok(None),
        Err(errno) => return Err(ioctl_error("VIDIOC_ENUM_FRAMESIZES", None)(errno)),
    }

    // SAFETY: the member read matches the type the driver reported.
    let entry = unsafe {
        match size.type_ {
            ffi::V4L2_FRMSIZE_TYPE_DISCRETE => FrameSize {
                index,
                width: size.u.discrete.width,
                height: size.u.discrete.height,
                range: false,
            },
            _ => FrameSize {
                index,
                width: size.u.stepwise.max_width,
                height: size.u.stepwise.max_height,
                range: true,
            },
        }
    };
    Ok(Some(entry))
}

/// Every rate offered for one size; a range contributes its fastest rate.
pub(crate) fn frame_rates(
    driver: &dyn Driver,
    pixelformat: u32,
    width: u32,
    height: u32,
) -> Result<Vec<Fraction>, Error> {
    let mut rates = Vec::new();
    for index in 0.. {
        let mut ival = ffi::v4l2_frmivalenum {
            index,
            pixel_format: pixelformat,
            width,
            height,
            ..Default::default()
        };
        match driver.enum_frameintervals(&mut ival) {
            Ok(()) => {}
            Err(errno) if is_end(errno) => break,
            Err(errno) => return Err(ioctl_error("VIDIOC_ENUM_FRAMEINTERVALS", None)(errno)),
        }

        if ival.type_ == ffi::V4L2_FRMIVAL_TYPE_DISCRETE {
            // SAFETY: discrete member for a discrete entry.
            rates.push(Fraction::from_interval(unsafe { ival.u.discrete }));
        } else {
            // SAFETY: stepwise member for a range entry.
            rates.push(Fraction::from_interval(unsafe { ival.u.stepwise.min }));
            break;
        }
    }
    Ok(rates)
}

/// Every format the node reports, known to the format table or not, with
/// its frame sizes.
pub(crate) fn list_formats(driver: &dyn Driver, buf_type: u32) -> Result<Vec<Format>, Error> {
    let mut formats = Vec::new();
    for index in 0.. {
        let Some(desc) = enum_format(driver, buf_type, index)? else {
            break;
        };

        let mut resolutions = Vec::new();
        for size_index in 0.. {
            let Some(size) = enum_frame_size(driver, desc.pixelformat, size_index)? else {
                break;
            };
            resolutions.push(Resolution::new(size.width, size.height));
            if size.range {
                break;
            }
        }

        formats.push(Format {
            fourcc: FourCC::from_v4l2(desc.pixelformat),
            description: c_string(&desc.description),
            flags: FormatFlags::from_bits(desc.flags),
            resolutions,
        });
    }
    Ok(formats)
}

#[derive(Debug)]
struct FormatCursor {
    desc: &'static PixelFormatDescriptor,
    pixelformat: u32,
    next_size: Option<u32>,
}

/// Lazy walk over the device's capabilities.
///
/// Yields one [`Capability`] per (format, size, rate); ends after the first
/// error. Start a new enumeration to go again from the first format.
pub struct FormatEnumerator<'a> {
    driver: &'a dyn Driver,
    buf_type: u32,
    default_rate: Fraction,
    interlaced: bool,
    next_format: u32,
    format: Option<FormatCursor>,
    pending: VecDeque<Capability>,
    done: bool,
}

impl fmt::Debug for FormatEnumerator<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormatEnumerator")
            .field("next_format", &self.next_format)
            .field("format", &self.format)
            .field("pending", &self.pending.len())
            .field("done", &self.done)
            .finish()
    }
}

impl FormatEnumerator<'_> {
    fn advance_format(&mut self) -> Result<bool, Error> {
        loop {
            let index = self.next_format;
            let Some(desc) = enum_format(self.driver, self.buf_type, index)? else {
                return Ok(false);
            };
            self.next_format += 1;

            let fourcc = FourCC::from_v4l2(desc.pixelformat);
            match format::lookup(fourcc) {
                Some(known) => {
                    log::debug!("format {}: {}", index, fourcc);
                    self.format = Some(FormatCursor {
                        desc: known,
                        pixelformat: desc.pixelformat,
                        next_size: Some(0),
                    });
                    return Ok(true);
                }
                None => log::debug!("format {}: {} not in the format table, skipped", index, fourcc),
            }
        }
    }

    /// Fill `pending` from the next size of the current format. Returns
    /// false once the format has no more sizes.
    fn advance_size(&mut self) -> Result<bool, Error> {
        let Some(cursor) = self.format.as_mut() else {
            return Ok(false);
        };
        let Some(index) = cursor.next_size else {
            return Ok(false);
        };
        let Some(size) = enum_frame_size(self.driver, cursor.pixelformat, index)? else {
            cursor.next_size = None;
            return Ok(false);
        };
        cursor.next_size = if size.range { None } else { Some(index + 1) };

        let desc = cursor.desc;
        let mut rates = frame_rates(self.driver, cursor.pixelformat, size.width, size.height)?;
        if rates.is_empty() {
            rates.push(self.default_rate);
        }
        log::debug!(
            "{} {}x{}: {} rates",
            desc.fourcc,
            size.width,
            size.height,
            rates.len()
        );

        self.pending.extend(rates.into_iter().map(|frame_rate| Capability {
            format: desc,
            width: size.width,
            height: size.height,
            frame_rate,
            interlaced: self.interlaced,
        }));
        Ok(true)
    }

    fn step(&mut self) -> Result<Option<Capability>, Error> {
        loop {
            if let Some(cap) = self.pending.pop_front() {
                return Ok(Some(cap));
            }
            if self.format.is_some() {
                if !self.advance_size()? {
                    self.format = None;
                }
            } else if !self.advance_format()? {
                return Ok(None);
            }
        }
    }
}

impl Iterator for FormatEnumerator<'_> {
    type Item = Result<Capability, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(cap)) => Some(Ok(cap)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

impl CaptureHandle {
    /// Start a fresh walk over the device's capabilities.
    pub fn enumerate_formats(&self) -> Result<FormatEnumerator<'_>, Error> {
        Ok(FormatEnumerator {
            driver: self.driver()?,
            buf_type: self.ops.buf_type(),
            default_rate: self.frame_rate,
            interlaced: self.interlaced,
            next_format: 0,
            format: None,
            pending: VecDeque::new(),
            done: false,
        })
    }

    /// The full capability list.
    pub fn capabilities(&self) -> Result<Vec<Capability>, Error> {
        self.enumerate_formats()?.collect()
    }

    /// Select the capture mode matching `width`x`height` exactly and request
    /// `rate`.
    ///
    /// Returns the rate the device settled on, which is also recorded as the
    /// handle's frame rate.
    pub fn apply_format(
        &mut self,
        fourcc: FourCC,
        width: u32,
        height: u32,
        rate: Fraction,
    ) -> Result<Fraction, Error> {
        let driver = self.driver()?;
        let buf_type = self.ops.buf_type();
        let pixelformat = fourcc.to_v4l2();

        let mut offered = false;
        for index in 0.. {
            match enum_format(driver, buf_type, index)? {
                Some(desc) if desc.pixelformat == pixelformat => {
                    offered = true;
                    break;
                }
                Some(_) => {}
                None => break,
            }
        }
        if !offered {
            log::error!("{} does not offer {}", self.path().display(), fourcc);
            return Err(Error::UnsupportedFormat(fourcc));
        }

        let mut mode = None;
        for index in 0.. {
            let Some(size) = enum_frame_size(driver, pixelformat, index)? else {
                break;
            };
            if size.width == width && size.height == height {
                mode = Some(size.index);
                break;
            }
            if size.range {
                break;
            }
        }
        let Some(mode) = mode else {
            log::error!("{} has no {} mode of {}x{}", self.path().display(), fourcc, width, height);
            return Err(Error::UnsupportedResolution {
                fourcc,
                width,
                height,
            });
        };
        log::debug!("{} {}x{} is capture mode {}", fourcc, width, height, mode);

        let mut parm = ffi::v4l2_streamparm {
            type_: buf_type,
            ..Default::default()
        };
        parm.parm.capture = ffi::v4l2_captureparm {
            capturemode: mode,
            timeperframe: rate.to_interval(),
            ..Default::default()
        };
        driver
            .s_parm(&mut parm)
            .map_err(ioctl_error("VIDIOC_S_PARM", None))?;

        let mut parm = ffi::v4l2_streamparm {
            type_: buf_type,
            ..Default::default()
        };
        driver
            .g_parm(&mut parm)
            .map_err(ioctl_error("VIDIOC_G_PARM", None))?;
        // SAFETY: capture member for a capture buffer type.
        let reported = Fraction::from_interval(unsafe { parm.parm.capture.timeperframe });

        let actual = if reported.is_valid() { reported } else { rate };
        if actual != rate {
            log::info!("requested {} fps, device runs at {}", rate, actual);
        }
        self.frame_rate = actual;
        self.session.set_frame_duration(actual.frame_duration());
        Ok(actual)
    }

    /// Apply pixel format and size with progressive field order.
    ///
    /// The device may coerce any value; what it reads back is recorded.
    pub fn set_pixel_format(&mut self, fourcc: FourCC, width: u32, height: u32) -> Result<(), Error> {
        if self.pool.is_some() {
            return Err(Error::InvalidState {
                index: None,
                state: "buffers allocated",
            });
        }

        let applied = self.ops.set_format(self.driver()?, fourcc, width, height)?;
        if applied.fourcc != fourcc {
            log::warn!("requested {}, device applied {}", fourcc, applied.fourcc);
        }
        if applied.width != width || applied.height != height {
            log::info!(
                "requested {}x{}, device applied {}x{}",
                width,
                height,
                applied.width,
                applied.height
            );
        }
        log::debug!(
            "format {} {}x{} in {} planes, sizes {:?}",
            applied.fourcc,
            applied.width,
            applied.height,
            applied.n_planes(),
            applied.sizeimage
        );

        let geometry = format::lookup(applied.fourcc)
            .map(|desc| FrameGeometry::new(desc, applied.width, applied.height, self.interlaced));
        self.format = Some(NegotiatedFormat {
            fourcc: applied.fourcc,
            width: applied.width,
            height: applied.height,
            sizeimage: applied.sizeimage,
            bytesperline: applied.bytesperline,
            geometry,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fraction_parse() {
        assert_eq!("30/1".parse::<Fraction>().unwrap(), Fraction::new(30, 1));
        assert_eq!("15".parse::<Fraction>().unwrap(), Fraction::new(15, 1));
        assert_eq!(
            " 30000/1001 ".parse::<Fraction>().unwrap(),
            Fraction::new(30000, 1001)
        );
        assert!("30/0".parse::<Fraction>().is_err());
        assert!("fast".parse::<Fraction>().is_err());
    }

    #[test]
    fn test_interval_inversion() {
        let interval = ffi::v4l2_fract {
            numerator: 1,
            denominator: 30,
        };
        let rate = Fraction::from_interval(interval);
        assert_eq!(rate, Fraction::new(30, 1));
        assert_eq!(rate.to_interval(), interval);
        assert_eq!(rate.frame_duration(), Some(Duration::from_nanos(33_333_333)));
        assert_eq!(Fraction::new(0, 1).frame_duration(), None);
    }

    #[test]
    fn test_caps_string() {
        let cap = Capability {
            format: format::lookup(FourCC::NV21).unwrap(),
            width: 1920,
            height: 1080,
            frame_rate: Fraction::new(30, 1),
            interlaced: false,
        };
        assert_eq!(
            cap.caps_string(),
            "video/x-raw, format=(string)NV21, width=(int)1920, height=(int)1080, framerate=(fraction)30/1"
        );
        assert_eq!(cap.to_string(), "NV21 1920x1080 @ 30/1");

        let interlaced = Capability {
            interlaced: true,
            ..cap
        };
        assert!(interlaced
            .caps_string()
            .ends_with(", interlace-mode=(string)interleaved"));
        assert!(interlaced.geometry().interlaced);
    }
}
