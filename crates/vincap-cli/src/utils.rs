// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use crate::error::CliError;
use signal_hook::consts::SIGINT;
use signal_hook::iterator::{Handle, Signals};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use vincap::{fourcc::FourCC, Fraction, Interrupter};

/// Parse resolution string in format "WxH" or "W*H"
pub fn parse_resolution(s: &str) -> Result<(u32, u32), CliError> {
    let (width_str, height_str) = s
        .split_once('x')
        .or_else(|| s.split_once('*'))
        .ok_or_else(|| {
            CliError::InvalidArgs(format!(
                "Invalid resolution format (expected WxH or W*H): {}",
                s
            ))
        })?;

    let width = width_str
        .parse::<u32>()
        .map_err(|_| CliError::InvalidArgs(format!("Invalid width in resolution: {}", s)))?;
    let height = height_str
        .parse::<u32>()
        .map_err(|_| CliError::InvalidArgs(format!("Invalid height in resolution: {}", s)))?;

    if width == 0 || height == 0 {
        return Err(CliError::InvalidArgs(format!(
            "Resolution dimensions must be positive: {}",
            s
        )));
    }

    Ok((width, height))
}

/// Parse a FOURCC such as "NV12", case preserved.
pub fn parse_fourcc(s: &str) -> Result<FourCC, CliError> {
    s.parse::<FourCC>()
        .map_err(|e| CliError::InvalidArgs(e.to_string()))
}

/// Parse a frame rate given as "N" or "N/D".
pub fn parse_framerate(s: &str) -> Result<Fraction, CliError> {
    let rate = s
        .parse::<Fraction>()
        .map_err(|e| CliError::InvalidArgs(e.to_string()))?;
    if !rate.is_valid() {
        return Err(CliError::InvalidArgs(format!(
            "Frame rate must be positive: {}",
            s
        )));
    }
    Ok(rate)
}

/// Turns Ctrl+C into a capture interrupt.
///
/// A watcher thread waits for SIGINT, raises the flag and wakes any blocked
/// frame wait through the interrupter. Dropping the watcher stops the thread.
pub struct SignalWatcher {
    term: Arc<AtomicBool>,
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

impl SignalWatcher {
    pub fn spawn(interrupter: Interrupter) -> Result<SignalWatcher, CliError> {
        let mut signals = Signals::new([SIGINT])
            .map_err(|e| CliError::General(format!("Failed to register signal handler: {}", e)))?;
        let handle = signals.handle();
        let term = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&term);
        let thread = thread::Builder::new()
            .name("sigint".to_string())
            .spawn(move || {
                for signal in signals.forever() {
                    log::debug!("Received signal {}, interrupting capture", signal);
                    flag.store(true, Ordering::Relaxed);
                    interrupter.interrupt();
                }
            })
            .map_err(|e| CliError::General(format!("Failed to spawn signal watcher: {}", e)))?;

        log::debug!("Installed SIGINT handler");
        Ok(SignalWatcher {
            term,
            handle,
            thread: Some(thread),
        })
    }

    /// True once SIGINT was received.
    pub fn triggered(&self) -> bool {
        self.term.load(Ordering::Relaxed)
    }
}

impl Drop for SignalWatcher {
    fn drop(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_resolution_valid() {
        assert_eq!(parse_resolution("1920x1080").unwrap(), (1920, 1080));
        assert_eq!(parse_resolution("1280x720").unwrap(), (1280, 720));
        assert_eq!(parse_resolution("640x480").unwrap(), (640, 480));
        assert_eq!(parse_resolution("3840x2160").unwrap(), (3840, 2160));

        // Test alternative separator
        assert_eq!(parse_resolution("1920*1080").unwrap(), (1920, 1080));
    }

    #[test]
    fn test_parse_resolution_invalid() {
        assert!(parse_resolution("1920").is_err());
        assert!(parse_resolution("1920x").is_err());
        assert!(parse_resolution("x1080").is_err());
        assert!(parse_resolution("1920x1080x60").is_err());
        assert!(parse_resolution("widthxheight").is_err());
        assert!(parse_resolution("0x0").is_err());
        assert!(parse_resolution("-1920x1080").is_err());
    }

    #[test]
    fn test_parse_fourcc() {
        assert_eq!(parse_fourcc("NV12").unwrap(), FourCC::NV12);
        assert_eq!(parse_fourcc("YUYV").unwrap().to_v4l2(), 0x56595559);
        assert!(parse_fourcc("YUY").is_err());
        assert!(parse_fourcc("YUYVV").is_err());
        assert!(parse_fourcc("").is_err());
    }

    #[test]
    fn test_parse_framerate() {
        assert_eq!(parse_framerate("30").unwrap(), Fraction::new(30, 1));
        assert_eq!(
            parse_framerate("30000/1001").unwrap(),
            Fraction::new(30000, 1001)
        );
        assert!(parse_framerate("0/1").is_err());
        assert!(parse_framerate("30/0").is_err());
        assert!(parse_framerate("fast").is_err());
    }
}
