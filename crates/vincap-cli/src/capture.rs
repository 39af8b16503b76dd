// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use crate::error::CliError;
use crate::metrics::MetricsCollector;
use crate::utils::{self, SignalWatcher};
use clap::Args as ClapArgs;
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::PathBuf,
    time::Duration,
};
use vincap::{camera, v4l2::VirtualDevice, Allocator, BufferHandle, CaptureHandle, Error};

#[derive(ClapArgs, Debug)]
pub struct Args {
    /// Camera device
    #[arg(short, long, default_value = "/dev/video0")]
    device: PathBuf,

    /// Capture from the built-in virtual camera instead of a device node
    #[arg(long = "virtual")]
    virtual_device: bool,

    /// Resolution in WxH format
    #[arg(short, long, default_value = "640x480")]
    resolution: String,

    /// Pixel format FOURCC
    #[arg(long, default_value = "NV12")]
    format: String,

    /// Requested frame rate, N or N/D
    #[arg(short = 'F', long, default_value = "30/1")]
    framerate: String,

    /// Number of kernel buffers to request
    #[arg(short, long, default_value = "4")]
    buffers: u32,

    /// Number of frames to capture (0=unlimited)
    #[arg(short, long, default_value = "0")]
    frames: u64,

    /// Append raw frame data to this file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Device input to select
    #[arg(long, default_value = "0")]
    camera_index: i32,

    /// Give up when no frame arrives within this many milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Print capture metrics on exit
    #[arg(long)]
    metrics: bool,
}

pub fn execute(args: Args, json: bool) -> Result<(), CliError> {
    log::debug!("Capture parameters: {:?}", args);

    let (width, height) = utils::parse_resolution(&args.resolution)?;
    let fourcc = utils::parse_fourcc(&args.format)?;
    let frame_rate = utils::parse_framerate(&args.framerate)?;
    if args.buffers == 0 {
        return Err(CliError::InvalidArgs(
            "At least one buffer is required".to_string(),
        ));
    }

    let camera = camera::create_camera()
        .with_device(&args.device)
        .with_resolution(width, height)
        .with_format(fourcc)
        .with_frame_rate(frame_rate)
        .with_buffers(args.buffers)
        .with_camera_index(args.camera_index)
        .with_timeout(args.timeout_ms.map(Duration::from_millis));

    log::info!("Opening camera: {}", camera);
    let handle = if args.virtual_device {
        camera.open_with_driver(Box::new(VirtualDevice::new()))?
    } else {
        camera.open()?
    };
    log_negotiated(&handle);

    let watcher = SignalWatcher::spawn(handle.interrupter())?;

    let mut output = match &args.output {
        Some(path) => {
            let file = File::create(path).map_err(|e| {
                CliError::General(format!("Failed to create {}: {}", path.display(), e))
            })?;
            log::info!("Writing raw frames to {}", path.display());
            Some(BufWriter::new(file))
        }
        None => None,
    };

    let allocator = Allocator::new(handle);
    let mut buffers = Vec::new();
    loop {
        match allocator.acquire() {
            Ok(buffer) => buffers.push(buffer),
            Err(Error::NoSlotAvailable) if !buffers.is_empty() => break,
            Err(err) => return Err(err.into()),
        }
    }

    let mut metrics = MetricsCollector::new();
    let result = capture_loop(
        &allocator,
        &buffers,
        args.frames,
        &watcher,
        &mut metrics,
        output.as_mut(),
    );

    {
        let handle = allocator.handle();
        metrics.record_session(handle.lost_frames(), handle.has_bad_timestamp());
    }

    for buffer in buffers {
        if let Err(err) = allocator.free(buffer) {
            log::warn!("Failed to free {}: {}", buffer, err);
        }
    }
    let mut handle = allocator.into_handle();
    let mut cleanup = handle.close().map_err(CliError::from);
    if let Some(mut output) = output {
        if let Err(e) = output.flush() {
            let err = CliError::General(format!("Failed to flush output: {}", e));
            match cleanup {
                Ok(()) => cleanup = Err(err),
                Err(_) => log::warn!("{}", err),
            }
        }
    }

    let frame_count = finish(result, cleanup)?;
    log::info!("Captured {} frames total", frame_count);

    if json {
        metrics
            .print_json()
            .map_err(|e| CliError::General(format!("Failed to output JSON metrics: {}", e)))?;
    } else if args.metrics {
        metrics.print_text();
    }

    Ok(())
}

/// Teardown errors surface only when the capture itself succeeded.
fn finish<T>(result: Result<T, CliError>, cleanup: Result<(), CliError>) -> Result<T, CliError> {
    match (result, cleanup) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(err)) => Err(err),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(cleanup)) => {
            log::warn!("Cleanup after failed capture also failed: {}", cleanup);
            Err(err)
        }
    }
}

fn log_negotiated(handle: &CaptureHandle) {
    let format = handle
        .fourcc()
        .map_or_else(|| "unset".to_string(), |f| f.to_string());
    log::info!(
        "Negotiated {} {}x{} @ {} fps with {} buffers ({} planes)",
        format,
        handle.width(),
        handle.height(),
        handle.frame_rate(),
        handle.slot_count(),
        handle.n_planes()
    );
    if let Some((min, max)) = handle.latency() {
        log::debug!("Pool latency {:?} to {:?}", min, max);
    }
}

/// Map the acquired buffers in turn until `max_frames` or SIGINT.
fn capture_loop(
    allocator: &Allocator,
    buffers: &[BufferHandle],
    max_frames: u64,
    watcher: &SignalWatcher,
    metrics: &mut MetricsCollector,
    mut output: Option<&mut BufWriter<File>>,
) -> Result<u64, CliError> {
    let max_frames = if max_frames == 0 {
        u64::MAX
    } else {
        max_frames
    };

    log::info!(
        "Capturing {} frames (Ctrl+C to stop)...",
        if max_frames == u64::MAX {
            "unlimited".to_string()
        } else {
            max_frames.to_string()
        }
    );

    let mut frame_count = 0u64;
    for &buffer in buffers.iter().cycle() {
        if frame_count >= max_frames || watcher.triggered() {
            break;
        }

        let frame = match allocator.map(buffer) {
            Ok(frame) => frame,
            Err(Error::Interrupted) if watcher.triggered() => break,
            Err(err) => return Err(err.into()),
        };

        let mut bytes = 0u64;
        for plane in 0..frame.n_planes() {
            let data = frame.plane(plane);
            bytes += data.len() as u64;
            if let Some(out) = output.as_mut() {
                out.write_all(data)
                    .map_err(|e| CliError::General(format!("Failed to write frame: {}", e)))?;
            }
        }

        let timing = *frame.timing();
        if let Some(lost) = timing.lost {
            log::warn!("Device dropped {} before frame {}", lost, timing.offset);
        }
        log::trace!(
            "{} sequence {} pts {:?} ({} bytes)",
            buffer,
            timing.offset,
            timing.pts,
            bytes
        );
        metrics.record_frame(bytes, timing.pts);
        drop(frame);

        frame_count += 1;
        if frame_count % 30 == 0 {
            log::debug!("Captured {} frames", frame_count);
        }
    }

    if watcher.triggered() {
        log::info!("Received Ctrl+C, stopping...");
    }
    Ok(frame_count)
}
