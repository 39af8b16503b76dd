// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use std::fmt;
use std::process::ExitCode;

/// CLI-specific error type with exit code mapping
#[derive(Debug)]
pub enum CliError {
    /// Invalid command-line arguments
    InvalidArgs(String),
    /// Device node missing, inaccessible or not a capture device
    DeviceNotFound(String),
    /// Pixel format or resolution the device does not offer
    Unsupported(String),
    /// Capture stopped by SIGINT
    Interrupted,
    /// No frame arrived within the wait timeout
    Timeout(String),
    /// General error from the vincap library
    General(String),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::InvalidArgs(msg) => write!(f, "Invalid arguments: {}", msg),
            CliError::DeviceNotFound(msg) => write!(f, "Device not found: {}", msg),
            CliError::Unsupported(msg) => write!(f, "Unsupported: {}", msg),
            CliError::Interrupted => write!(f, "Interrupted"),
            CliError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            CliError::General(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for CliError {}

impl CliError {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }

    fn code(&self) -> u8 {
        match self {
            CliError::General(_) => 1,
            CliError::InvalidArgs(_) => 2,
            CliError::DeviceNotFound(_) => 3,
            CliError::Unsupported(_) => 4,
            CliError::Interrupted => 5,
            CliError::Timeout(_) => 6,
        }
    }
}

/// Map vincap::Error to CliError with appropriate exit codes
impl From<vincap::Error> for CliError {
    fn from(err: vincap::Error) -> Self {
        use vincap::Error;

        match err {
            Error::DeviceNotFound { .. } | Error::NotCapturable { .. } => {
                CliError::DeviceNotFound(err.to_string())
            }
            Error::UnsupportedFormat(_) | Error::UnsupportedResolution { .. } => {
                CliError::Unsupported(err.to_string())
            }
            Error::Interrupted => CliError::Interrupted,
            Error::Timeout => CliError::Timeout("no frame within the wait timeout".to_string()),
            err => CliError::General(err.to_string()),
        }
    }
}

/// Helper function to convert result to exit code
pub fn result_to_exit_code<T>(result: Result<T, CliError>) -> ExitCode {
    match result {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            e.exit_code()
        }
    }
}
