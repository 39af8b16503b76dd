// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Negotiable capabilities of one capture device.

use crate::error::CliError;
use clap::Args as ClapArgs;
use serde::Serialize;
use std::path::PathBuf;
use vincap::{camera::Camera, v4l2::VirtualDevice, Capability, CaptureHandle, CaptureType};

#[derive(ClapArgs, Debug)]
pub struct Args {
    /// Camera device path
    #[arg(default_value = "/dev/video0")]
    device: PathBuf,

    /// Query the built-in virtual camera instead of a device node
    #[arg(long = "virtual")]
    virtual_device: bool,
}

#[derive(Debug, Serialize)]
struct CapabilityOutput {
    fourcc: String,
    width: u32,
    height: u32,
    framerate: String,
    fps: f64,
    caps: String,
}

impl From<&Capability> for CapabilityOutput {
    fn from(cap: &Capability) -> Self {
        CapabilityOutput {
            fourcc: cap.fourcc().to_string(),
            width: cap.width,
            height: cap.height,
            framerate: cap.frame_rate.to_string(),
            fps: cap.frame_rate.as_f64(),
            caps: cap.caps_string(),
        }
    }
}

pub fn execute(args: Args, json: bool) -> Result<(), CliError> {
    log::debug!("Executing formats command: {:?}", args);

    let capabilities = if args.virtual_device {
        CaptureHandle::with_driver(
            Box::new(VirtualDevice::new()),
            &args.device,
            CaptureType::Any,
        )?
        .capabilities()?
    } else {
        Camera::default().with_device(&args.device).formats()?
    };

    if capabilities.is_empty() {
        log::warn!("{} offers no supported raw format", args.device.display());
    }

    if json {
        let output: Vec<CapabilityOutput> = capabilities.iter().map(Into::into).collect();
        let json_str = serde_json::to_string_pretty(&output)
            .map_err(|e| CliError::General(format!("JSON serialization failed: {}", e)))?;
        println!("{}", json_str);
    } else {
        for cap in &capabilities {
            println!("{}", cap.caps_string());
        }
    }

    Ok(())
}
