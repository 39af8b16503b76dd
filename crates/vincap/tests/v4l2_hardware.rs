// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies
//
// V4L2 Hardware Capture Tests
//
// TESTING LAYERS:
//
// Layer 1 (No hardware required):
//   - Graceful handling of missing devices
//
// Layer 3 (Hardware Integration - Requires a V4L2 capture device):
//   - Device enumeration and capability listing
//   - Format negotiation against the first advertised capability
//   - Streaming, pick/release and read through the camera builder
//   - Interrupting a blocked wait from another thread
//
// The device defaults to /dev/video0; set VINCAP_TEST_DEVICE to override.
//
// RUN LAYER 1:
//   cargo test --test v4l2_hardware
//
// RUN LAYER 3 (on hardware):
//   cargo test --test v4l2_hardware -- --ignored --nocapture

use std::{thread, time::Duration};

use serial_test::serial;
use vincap::{
    camera::Camera,
    v4l2::DeviceEnumerator,
    Allocator, CaptureHandle, CaptureType, Error, MemoryType,
};

fn test_device() -> String {
    std::env::var("VINCAP_TEST_DEVICE").unwrap_or_else(|_| "/dev/video0".to_owned())
}

// =============================================================================
// Layer 1: No Hardware Required
// =============================================================================

#[test]
fn test_enumerate_does_not_fail() {
    // /dev always exists on Linux; an empty result is fine.
    let devices = DeviceEnumerator::enumerate().unwrap();
    for device in &devices {
        assert!(device.is_capture());
    }
}

#[test]
fn test_open_missing_device() {
    let err = CaptureHandle::open("/dev/video-nonexistent", CaptureType::Any).unwrap_err();
    assert!(matches!(err, Error::DeviceNotFound { .. }));
}

// =============================================================================
// Layer 3: Hardware Integration
// =============================================================================

#[test]
#[ignore = "test requires V4L2 capture hardware (run with --include-ignored to enable)"]
#[serial]
fn test_hardware_capabilities() -> Result<(), Error> {
    let devices = DeviceEnumerator::enumerate()?;
    assert!(!devices.is_empty(), "no capture devices found");
    for device in &devices {
        println!("{}", device);
        for format in device.formats() {
            println!("  {} {:?}", format, format.resolutions);
        }
    }

    let handle = CaptureHandle::open(test_device(), CaptureType::Any)?;
    let capabilities = handle.capabilities()?;
    assert!(!capabilities.is_empty());
    for cap in &capabilities {
        println!("{}", cap.caps_string());
    }
    Ok(())
}

#[test]
#[ignore = "test requires V4L2 capture hardware (run with --include-ignored to enable)"]
#[serial]
fn test_hardware_pick_release() -> Result<(), Error> {
    let mut handle = CaptureHandle::open(test_device(), CaptureType::Any)?;
    let cap = handle
        .capabilities()?
        .into_iter()
        .next()
        .ok_or(Error::NoBuffers)?;
    println!("using {}", cap);

    handle.apply_format(cap.fourcc(), cap.width, cap.height, cap.frame_rate)?;
    handle.set_pixel_format(cap.fourcc(), cap.width, cap.height)?;
    let granted = handle.request_buffers(4, MemoryType::Mmap)?;
    assert!(granted >= 1 && granted <= 4);
    assert_eq!(handle.mapped_count(), granted);

    handle.set_wait_timeout(Some(Duration::from_secs(5)));
    handle.queue_all()?;
    handle.streamon()?;
    for _ in 0..10 {
        let frame = handle.pick(0)?;
        assert!(frame.as_ptr(0).is_some());
        println!(
            "slot 0 sequence {} pts {:?}",
            frame.info().sequence,
            frame.info().timing.pts
        );
        handle.release(0)?;
    }
    handle.streamoff()?;
    handle.streamoff()?;
    handle.close()?;
    handle.close()?;
    Ok(())
}

#[test]
#[ignore = "test requires V4L2 capture hardware (run with --include-ignored to enable)"]
#[serial]
fn test_hardware_camera_read() -> Result<(), Error> {
    let mut capture = Camera::default()
        .with_device(test_device())
        .with_resolution(640, 480)
        .with_buffers(4)
        .with_timeout(Some(Duration::from_secs(5)))
        .open()?;
    capture.queue_all()?;
    capture.streamon()?;

    for _ in 0..30 {
        let frame = capture.read()?;
        assert!(!frame.plane(0).is_empty());
        if let Some(lost) = frame.timing().lost {
            println!("lost {}", lost);
        }
    }
    println!(
        "lost {} frames, bad timestamps: {}",
        capture.lost_frames(),
        capture.has_bad_timestamp()
    );
    capture.close()
}

#[test]
#[ignore = "test requires V4L2 capture hardware (run with --include-ignored to enable)"]
#[serial]
fn test_hardware_allocator() -> Result<(), Error> {
    let capture = Camera::default()
        .with_device(test_device())
        .with_resolution(640, 480)
        .with_buffers(3)
        .open()?;
    let allocator = Allocator::new(capture);

    let buffer = allocator.acquire()?;
    for _ in 0..10 {
        let frame = allocator.map(buffer)?;
        assert!(!frame.plane(0).is_empty());
    }
    allocator.free(buffer)?;
    allocator.into_handle().close()
}

#[test]
#[ignore = "test requires V4L2 capture hardware (run with --include-ignored to enable)"]
#[serial]
fn test_hardware_interrupt() -> Result<(), Error> {
    let mut capture = Camera::default()
        .with_device(test_device())
        .with_resolution(640, 480)
        .open()?;
    capture.queue_all()?;
    capture.streamon()?;

    // Hold every slot so the next wait cannot complete.
    let mut held = Vec::new();
    while let Ok(index) = capture.wait_and_dequeue() {
        held.push(capture.pick(index)?.index());
        if held.len() as u32 == capture.slot_count() {
            break;
        }
    }

    let interrupter = capture.interrupter();
    let waker = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        interrupter.interrupt();
    });
    let result = capture.wait_and_dequeue();
    waker.join().unwrap();
    assert!(matches!(result, Err(Error::NoBuffers) | Err(Error::Interrupted)));

    for index in held {
        capture.release(index)?;
    }
    capture.close()
}
