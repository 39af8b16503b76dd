// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies
//
// Capture Tests on the Virtual Device
//
// Every test drives a CaptureHandle over vincap::v4l2::VirtualDevice, an
// in-memory capture node, so no hardware is required. The device is shared
// through an Rc so tests can inspect its map/unmap and queue counters after
// handing it to the handle.
//
// RUN:
//   cargo test --test capture_virtual

use std::{cell::RefCell, rc::Rc, thread, time::Duration};

use rand::seq::SliceRandom;
use vincap::{
    camera::Camera,
    fourcc::FourCC,
    geometry::{ChromaSite, Colorimetry},
    isp::IspHook,
    pacing::ManualClock,
    pool::SlotState,
    v4l2::{FrameIntervals, TimestampMode, VirtualDevice, VirtualFormat},
    Allocator, CaptureHandle, CaptureType, Error, Fraction, MemoryType,
};

const PATH: &str = "/dev/video-virtual";

fn open(device: &Rc<VirtualDevice>) -> Result<CaptureHandle, Error> {
    let _ = env_logger::builder().is_test(true).try_init();
    CaptureHandle::with_driver(Box::new(device.clone()), PATH, CaptureType::Any)
}

fn configured(
    device: &Rc<VirtualDevice>,
    fourcc: FourCC,
    width: u32,
    height: u32,
    buffers: u32,
) -> Result<CaptureHandle, Error> {
    let mut handle = open(device)?;
    handle.apply_format(fourcc, width, height, Fraction::new(30, 1))?;
    handle.set_pixel_format(fourcc, width, height)?;
    handle.request_buffers(buffers, MemoryType::Mmap)?;
    Ok(handle)
}

fn streaming(device: &Rc<VirtualDevice>, buffers: u32) -> Result<CaptureHandle, Error> {
    let mut handle = configured(device, FourCC::NV12, 640, 480, buffers)?;
    handle.queue_all()?;
    handle.streamon()?;
    Ok(handle)
}

// =============================================================================
// Format negotiation
// =============================================================================

#[test]
fn test_every_capability_negotiates() -> Result<(), Error> {
    let device = Rc::new(VirtualDevice::new());
    let mut handle = open(&device)?;
    let capabilities = handle.capabilities()?;
    assert!(!capabilities.is_empty());

    for cap in capabilities {
        let rate = handle.apply_format(cap.fourcc(), cap.width, cap.height, cap.frame_rate)?;
        assert!(rate.is_valid(), "{}", cap);
        handle.set_pixel_format(cap.fourcc(), cap.width, cap.height)?;
        assert!(handle.width() >= cap.width, "{}", cap);
        assert!(handle.height() >= cap.height, "{}", cap);
        assert!(handle.frame_size() >= cap.geometry().size, "{}", cap);
        assert_eq!(handle.fourcc(), Some(cap.fourcc()));
    }
    Ok(())
}

#[test]
fn test_capabilities_skip_unknown_formats() -> Result<(), Error> {
    let device = Rc::new(VirtualDevice::new());
    let handle = open(&device)?;
    let capabilities = handle.capabilities()?;

    assert!(capabilities.iter().all(|c| c.fourcc() != FourCC(*b"MJPG")));
    assert!(capabilities
        .iter()
        .any(|c| c.fourcc() == FourCC::I420 && c.width == 1280 && c.height == 720));

    let lazy: Vec<_> = handle.enumerate_formats()?.take(2).collect::<Result<_, _>>()?;
    assert_eq!(lazy, capabilities[..2].to_vec());
    Ok(())
}

#[test]
fn test_device_rounds_up() -> Result<(), Error> {
    let device = Rc::new(VirtualDevice::new());
    let mut handle = open(&device)?;
    handle.set_pixel_format(FourCC::I420, 100, 100)?;
    assert_eq!((handle.width(), handle.height()), (112, 104));
    assert_eq!(handle.geometry().map(|g| g.n_planes), Some(3));
    Ok(())
}

#[test]
fn test_unsupported_format_and_size() -> Result<(), Error> {
    let device = Rc::new(VirtualDevice::new());
    let mut handle = open(&device)?;

    let err = handle
        .apply_format(FourCC::NV16, 640, 480, Fraction::new(30, 1))
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedFormat(f) if f == FourCC::NV16));

    // Sizes match exactly, no nearest fit.
    let err = handle
        .apply_format(FourCC::NV21, 1280, 721, Fraction::new(30, 1))
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedResolution { width: 1280, height: 721, .. }));
    Ok(())
}

#[test]
fn test_device_adjusted_rate_is_recorded() -> Result<(), Error> {
    let device = Rc::new(VirtualDevice::new().with_fixed_rate(Fraction::new(15, 1)));
    let mut handle = open(&device)?;

    let rate = handle.apply_format(FourCC::NV21, 640, 480, Fraction::new(30, 1))?;
    assert_eq!(rate, Fraction::new(15, 1));
    assert_eq!(handle.frame_rate(), Fraction::new(15, 1));

    handle.set_pixel_format(FourCC::NV21, 640, 480)?;
    handle.request_buffers(4, MemoryType::Mmap)?;
    let (min, max) = handle.latency().unwrap();
    assert_eq!(min, Duration::from_nanos(66_666_666));
    assert_eq!(max, min * 4);
    Ok(())
}

#[test]
fn test_stepwise_rate_range() -> Result<(), Error> {
    let device = Rc::new(VirtualDevice::new().with_formats(vec![VirtualFormat::discrete(
        FourCC::YUYV,
        &[(320, 240)],
        &[],
    )
    .with_intervals(FrameIntervals::Stepwise {
        slowest: Fraction::new(1, 1),
        fastest: Fraction::new(120, 1),
    })]));
    let handle = open(&device)?;
    let capabilities = handle.capabilities()?;
    assert_eq!(capabilities.len(), 1);
    assert_eq!(capabilities[0].frame_rate, Fraction::new(120, 1));
    Ok(())
}

#[test]
fn test_geometry_and_colorimetry_defaults() -> Result<(), Error> {
    let device = Rc::new(VirtualDevice::new());
    let mut handle = open(&device)?;

    handle.set_pixel_format(FourCC::NV21, 1920, 1080)?;
    let geometry = handle.geometry().unwrap().clone();
    assert_eq!(geometry.stride[0], 1920);
    assert_eq!(geometry.offset[1], 1920 * 1080);
    assert_eq!(geometry.size, 1920 * 1080 * 3 / 2);
    assert_eq!(geometry.colorimetry, Colorimetry::BT709);
    assert_eq!(geometry.chroma_site, ChromaSite::HCosited);

    handle.set_pixel_format(FourCC::YUYV, 640, 480)?;
    let geometry = handle.geometry().unwrap();
    assert_eq!(geometry.stride[0], 1280);
    assert_eq!(geometry.colorimetry, Colorimetry::BT601);
    assert_eq!(geometry.chroma_site, ChromaSite::Unknown);
    Ok(())
}

// =============================================================================
// Buffer pool
// =============================================================================

#[test]
fn test_granted_count_is_mapped_exactly() -> Result<(), Error> {
    let device = Rc::new(VirtualDevice::new().with_max_buffers(2));
    let handle = configured(&device, FourCC::NV21, 640, 480, 5)?;
    assert_eq!(handle.slot_count(), 2);
    assert_eq!(handle.mapped_count(), 2);
    assert_eq!(device.stats().maps, 2);

    let device = Rc::new(VirtualDevice::new());
    let handle = configured(&device, FourCC::NV21, 640, 480, 3)?;
    assert_eq!(handle.slot_count(), 3);
    assert_eq!(handle.mapped_count(), 3);
    assert_eq!(device.stats().maps, 3);
    Ok(())
}

#[test]
fn test_multiplane_slots_map_every_plane() -> Result<(), Error> {
    let device = Rc::new(VirtualDevice::new().multiplanar(true));
    let handle = configured(&device, FourCC::NV12, 640, 480, 3)?;
    assert_eq!(handle.mode(), vincap::CaptureMode::MultiPlane);
    assert_eq!(handle.n_planes(), 2);
    assert_eq!(device.stats().maps, 6);
    assert_eq!(handle.mapped_count(), 3);

    let desc = handle.query_slot(1)?;
    assert_eq!(desc.planes.len(), 2);
    assert_eq!(desc.planes[0].length, 640 * 480);
    assert_eq!(desc.planes[1].length, 640 * 240);
    Ok(())
}

#[test]
fn test_partial_mapping_rolls_back() -> Result<(), Error> {
    let device = Rc::new(VirtualDevice::new().multiplanar(true).fail_map_on(2));
    let mut handle = open(&device)?;
    handle.apply_format(FourCC::I420, 1280, 720, Fraction::new(30, 1))?;
    handle.set_pixel_format(FourCC::I420, 1280, 720)?;
    assert_eq!(handle.n_planes(), 3);

    let err = handle.request_buffers(2, MemoryType::Mmap).unwrap_err();
    assert!(matches!(err, Error::MapFailed { index: 0, plane: 2, .. }));

    let stats = device.stats();
    assert_eq!(stats.map_attempts, 3);
    assert_eq!(stats.maps, 2);
    assert_eq!(stats.unmaps, 2);
    assert_eq!(stats.live_mappings(), 0);
    assert_eq!(device.buffer_count(), 0);
    assert_eq!(handle.slot_count(), 0);
    Ok(())
}

#[test]
fn test_failure_on_later_slot_unmaps_earlier_slots() -> Result<(), Error> {
    let device = Rc::new(VirtualDevice::new().fail_map_on(2));
    let mut handle = open(&device)?;
    let err = handle.request_buffers(4, MemoryType::Mmap).unwrap_err();
    assert!(matches!(err, Error::MapFailed { index: 2, plane: 0, .. }));
    assert_eq!(device.stats().maps, device.stats().unmaps);
    Ok(())
}

#[test]
fn test_repeated_request_releases_old_pool() -> Result<(), Error> {
    let device = Rc::new(VirtualDevice::new());
    let mut handle = configured(&device, FourCC::NV21, 640, 480, 4)?;
    handle.request_buffers(2, MemoryType::Mmap)?;
    let stats = device.stats();
    assert_eq!(stats.maps, 6);
    assert_eq!(stats.unmaps, 4);
    assert_eq!(handle.slot_count(), 2);
    Ok(())
}

#[test]
fn test_pool_state_guards() -> Result<(), Error> {
    let device = Rc::new(VirtualDevice::new());
    let mut handle = open(&device)?;
    handle.set_pixel_format(FourCC::NV21, 640, 480)?;

    assert!(matches!(handle.streamon(), Err(Error::NoBuffers)));

    handle.request_buffers(2, MemoryType::Mmap)?;
    let err = handle.set_pixel_format(FourCC::NV12, 640, 480).unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));

    handle.queue_all()?;
    handle.streamon()?;
    let err = handle.request_buffers(2, MemoryType::Mmap).unwrap_err();
    assert!(matches!(err, Error::InvalidState { state: "streaming", .. }));

    let err = handle.export_dmabuf(0, 0).unwrap_err();
    assert!(matches!(err, Error::Ioctl { op: "VIDIOC_EXPBUF", .. }));
    Ok(())
}

#[test]
fn test_user_pointer_pool_is_unmapped() -> Result<(), Error> {
    let device = Rc::new(VirtualDevice::new());
    let mut handle = open(&device)?;
    handle.set_pixel_format(FourCC::NV21, 640, 480)?;
    assert_eq!(handle.request_buffers(2, MemoryType::UserPtr)?, 2);
    assert_eq!(handle.memory_type(), MemoryType::UserPtr);
    assert_eq!(handle.mapped_count(), 0);
    assert_eq!(device.stats().maps, 0);
    assert!(matches!(handle.queue(0), Err(Error::Unsupported(_))));
    Ok(())
}

// =============================================================================
// Slot state machine
// =============================================================================

#[test]
fn test_double_queue_is_rejected() -> Result<(), Error> {
    let device = Rc::new(VirtualDevice::new());
    let mut handle = configured(&device, FourCC::NV21, 640, 480, 3)?;

    handle.queue(1)?;
    let err = handle.queue(1).unwrap_err();
    assert!(matches!(err, Error::InvalidState { index: Some(1), state: "queued" }));
    assert_eq!(device.queued(), 1);
    assert_eq!(device.stats().qbufs, 1);

    handle.streamon()?;
    assert_eq!(handle.wait_and_dequeue()?, 1);
    assert_eq!(handle.slot_state(1), Some(SlotState::Ready));
    assert!(handle.queue(1).is_err());

    handle.release(1)?;
    assert_eq!(handle.slot_state(1), Some(SlotState::Queued));
    assert_eq!(device.queued(), 1);
    Ok(())
}

#[test]
fn test_shuffled_queue_order_is_completion_order() -> Result<(), Error> {
    let device = Rc::new(VirtualDevice::new());
    let mut handle = configured(&device, FourCC::NV21, 640, 480, 6)?;

    let mut order: Vec<u32> = (0..6).collect();
    order.shuffle(&mut rand::rng());
    for &index in &order {
        handle.queue(index)?;
    }
    handle.streamon()?;

    for (sequence, &expected) in order.iter().enumerate() {
        let index = handle.wait_and_dequeue()?;
        assert_eq!(index, expected);
        let frame = handle.pick(index)?;
        assert_eq!(frame.info().sequence, sequence as u32);
    }
    assert!(matches!(handle.wait_and_dequeue(), Err(Error::NoBuffers)));
    Ok(())
}

#[test]
fn test_pick_keeps_earlier_completions_ready() -> Result<(), Error> {
    let device = Rc::new(VirtualDevice::new().with_reverse_completion());
    let mut handle = streaming(&device, 3)?;

    let frame = handle.pick(0)?;
    assert_eq!(frame.index(), 0);
    assert_eq!(frame.info().sequence, 2);
    assert_eq!(handle.slot_state(0), Some(SlotState::Held));
    assert_eq!(handle.slot_state(1), Some(SlotState::Ready));
    assert_eq!(handle.slot_state(2), Some(SlotState::Ready));

    let err = handle.pick(0).unwrap_err();
    assert!(matches!(err, Error::InvalidState { index: Some(0), state: "held" }));

    // read() drains ready slots oldest first.
    {
        let frame = handle.read()?;
        assert_eq!(frame.index(), 2);
        assert_eq!(frame.info().sequence, 0);
    }
    assert_eq!(handle.slot_state(2), Some(SlotState::Queued));

    handle.release(0)?;
    handle.release(1)?;
    assert_eq!(device.queued(), 3);
    Ok(())
}

#[test]
fn test_frame_contents() -> Result<(), Error> {
    let device = Rc::new(VirtualDevice::new().multiplanar(true));
    let mut handle = streaming(&device, 2)?;

    for sequence in 0..4u8 {
        let frame = handle.read()?;
        assert_eq!(frame.n_planes(), 2);
        assert_eq!(frame.plane(0).len(), 640 * 480);
        assert_eq!(frame.plane(1).len(), 640 * 240);
        assert!(frame.plane(0).iter().all(|&b| b == sequence));
        assert!(frame.plane(2).is_empty());
        assert!(!frame.info().corrupted);
        assert!(frame.timestamp().is_some());
    }
    Ok(())
}

// =============================================================================
// Pacing
// =============================================================================

#[test]
fn test_lost_frames_reported_at_gap() -> Result<(), Error> {
    let device = Rc::new(VirtualDevice::new().with_sequence_gap(3, 2));
    let mut handle = streaming(&device, 3)?;

    let mut offsets = Vec::new();
    for _ in 0..5 {
        let frame = handle.read()?;
        let timing = *frame.timing();
        offsets.push(timing.offset);
        if timing.offset == 5 {
            let lost = timing.lost.unwrap();
            assert_eq!(lost.count, 2);
            assert_eq!(lost.duration, Duration::from_nanos(33_333_333) * 2);
        } else {
            assert_eq!(timing.lost, None);
        }
    }
    assert_eq!(offsets, vec![0, 1, 2, 5, 6]);
    assert_eq!(handle.lost_frames(), 2);
    Ok(())
}

#[test]
fn test_bad_timestamp_is_sticky() -> Result<(), Error> {
    for bad in [TimestampMode::FarPast, TimestampMode::Future] {
        let device = Rc::new(VirtualDevice::new());
        let mut handle = streaming(&device, 3)?;
        let duration = handle.frame_rate().frame_duration().unwrap();

        for _ in 0..2 {
            handle.read()?;
        }
        assert!(!handle.has_bad_timestamp());

        device.set_timestamps(bad);
        let first_bad = handle.read()?.timing().pts.unwrap();
        assert!(handle.has_bad_timestamp());

        device.set_timestamps(TimestampMode::Monotonic);
        let mut expected = first_bad;
        for _ in 0..3 {
            expected += duration;
            let frame = handle.read()?;
            assert_eq!(frame.timing().pts, Some(expected), "{:?}", bad);
        }
        assert!(handle.has_bad_timestamp());
    }
    Ok(())
}

#[test]
fn test_absent_timestamps_use_frame_durations() -> Result<(), Error> {
    let device = Rc::new(VirtualDevice::new().with_timestamps(TimestampMode::Absent));
    let mut handle = streaming(&device, 2)?;
    let clock = ManualClock::new(Duration::from_secs(100));
    handle.set_clock(Box::new(clock.clone()));

    for n in 0..4u32 {
        clock.advance(Duration::from_millis(5));
        let frame = handle.read()?;
        assert_eq!(frame.timing().pts, Some(Duration::from_nanos(33_333_333) * n));
        assert!(frame.timestamp().is_none());
    }
    Ok(())
}

#[test]
fn test_streamon_resets_pacing() -> Result<(), Error> {
    let device = Rc::new(VirtualDevice::new().with_timestamps(TimestampMode::Absent));
    let mut handle = streaming(&device, 2)?;
    handle.read()?;
    assert!(handle.has_bad_timestamp());

    handle.streamoff()?;
    device.set_timestamps(TimestampMode::Monotonic);
    handle.queue_all()?;
    handle.streamon()?;
    assert!(!handle.has_bad_timestamp());
    assert_eq!(handle.read()?.timing().offset, 0);
    assert!(!handle.has_bad_timestamp());
    Ok(())
}

// =============================================================================
// Waiting and cancellation
// =============================================================================

#[test]
fn test_interrupt_wakes_wait() -> Result<(), Error> {
    let device = Rc::new(VirtualDevice::new());
    let mut handle = streaming(&device, 2)?;
    device.set_stalled(true);

    let interrupter = handle.interrupter();
    let waker = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        interrupter.interrupt();
    });
    assert!(matches!(handle.wait_and_dequeue(), Err(Error::Interrupted)));
    waker.join().unwrap();

    // The wake-up is consumed; frames flow again.
    device.set_stalled(false);
    assert_eq!(handle.read()?.timing().offset, 0);
    Ok(())
}

#[test]
fn test_wait_timeout() -> Result<(), Error> {
    let device = Rc::new(VirtualDevice::new());
    let mut handle = streaming(&device, 2)?;
    device.set_stalled(true);
    handle.set_wait_timeout(Some(Duration::from_millis(20)));
    assert!(matches!(handle.wait_and_dequeue(), Err(Error::Timeout)));
    assert!(matches!(handle.pick(0), Err(Error::Timeout)));
    Ok(())
}

#[test]
fn test_dequeue_requires_stream() -> Result<(), Error> {
    let device = Rc::new(VirtualDevice::new());
    let mut handle = configured(&device, FourCC::NV21, 640, 480, 2)?;
    assert!(matches!(handle.wait_and_dequeue(), Err(Error::NoBuffers)));
    handle.queue_all()?;
    assert!(matches!(handle.wait_and_dequeue(), Err(Error::NotStreaming)));
    assert!(matches!(handle.read(), Err(Error::NotStreaming)));
    Ok(())
}

// =============================================================================
// Lifecycle
// =============================================================================

#[test]
fn test_streamoff_and_close_are_idempotent() -> Result<(), Error> {
    let device = Rc::new(VirtualDevice::new());
    let mut handle = streaming(&device, 3)?;
    handle.read()?;

    handle.streamoff()?;
    handle.streamoff()?;
    assert!(!handle.is_streaming());
    assert!(!device.is_streaming());
    assert_eq!(device.stats().streamoffs, 1);
    assert_eq!(
        (0..3).filter_map(|i| handle.slot_state(i)).collect::<Vec<_>>(),
        vec![SlotState::Free; 3]
    );

    handle.close()?;
    handle.close()?;
    assert!(handle.is_closed());
    assert_eq!(device.stats().live_mappings(), 0);
    assert_eq!(device.buffer_count(), 0);

    assert!(matches!(handle.streamon(), Err(Error::Closed)));
    assert!(matches!(handle.queue(0), Err(Error::Closed)));
    assert!(handle.streamoff().is_ok());
    Ok(())
}

#[test]
fn test_drop_closes() -> Result<(), Error> {
    let device = Rc::new(VirtualDevice::new());
    {
        let _handle = streaming(&device, 2)?;
        assert!(device.is_streaming());
    }
    assert!(!device.is_streaming());
    assert_eq!(device.stats().live_mappings(), 0);
    Ok(())
}

#[test]
fn test_missing_device() {
    let err = CaptureHandle::open("/dev/video-does-not-exist", CaptureType::Any).unwrap_err();
    assert!(matches!(err, Error::DeviceNotFound { .. }));
}

#[test]
fn test_capture_type_must_be_offered() -> Result<(), Error> {
    let device = Rc::new(VirtualDevice::new());
    let err = CaptureHandle::with_driver(Box::new(device.clone()), PATH, CaptureType::MultiPlane)
        .unwrap_err();
    assert!(matches!(err, Error::NotCapturable { .. }));

    let handle = CaptureHandle::with_driver(Box::new(device), PATH, CaptureType::SinglePlane)?;
    assert_eq!(handle.mode(), vincap::CaptureMode::SinglePlane);
    Ok(())
}

#[test]
fn test_end_to_end() -> Result<(), Error> {
    let device = Rc::new(VirtualDevice::new());
    let mut handle = open(&device)?;

    let capabilities = handle.capabilities()?;
    let wanted = capabilities
        .iter()
        .find(|c| {
            c.fourcc() == FourCC::NV21
                && (c.width, c.height) == (1920, 1080)
                && c.frame_rate == Fraction::new(30, 1)
        })
        .cloned()
        .unwrap();

    handle.apply_format(wanted.fourcc(), wanted.width, wanted.height, wanted.frame_rate)?;
    handle.set_pixel_format(wanted.fourcc(), wanted.width, wanted.height)?;
    assert_eq!(handle.request_buffers(4, MemoryType::Mmap)?, 4);
    assert_eq!(handle.mapped_count(), 4);

    handle.queue_all()?;
    handle.streamon()?;
    let frame = handle.pick(0)?;
    assert!(frame.as_ptr(0).is_some());
    assert_eq!(frame.plane_len(0), handle.frame_size());
    assert_eq!(handle.frame_size(), 1920 * 1080 * 3 / 2);

    handle.release(0)?;
    assert_eq!(handle.slot_state(0), Some(SlotState::Queued));
    handle.streamoff()?;
    handle.close()?;
    assert_eq!(device.stats().live_mappings(), 0);
    Ok(())
}

#[test]
fn test_camera_builder() -> Result<(), Error> {
    let device = Rc::new(VirtualDevice::new());
    let mut handle = Camera::default()
        .with_device(PATH)
        .with_resolution(1920, 1080)
        .with_buffers(4)
        .open_with_driver(Box::new(device.clone()))?;
    assert_eq!(handle.fourcc(), Some(FourCC::NV21));
    assert_eq!(handle.slot_count(), 4);

    handle.queue_all()?;
    handle.streamon()?;
    let frame = handle.read()?;
    assert_eq!(frame.plane(0).len(), 1920 * 1080 * 3 / 2);
    Ok(())
}

// =============================================================================
// Vendor ISP
// =============================================================================

struct RecordingIsp(Rc<RefCell<Vec<String>>>);

impl IspHook for RecordingIsp {
    fn get_id(&mut self, video_index: i32) -> Option<i32> {
        self.0.borrow_mut().push(format!("get_id {}", video_index));
        Some(video_index + 10)
    }

    fn start(&mut self, id: i32) -> Result<(), Error> {
        self.0.borrow_mut().push(format!("start {}", id));
        Ok(())
    }

    fn stop(&mut self, id: i32) -> Result<(), Error> {
        self.0.borrow_mut().push(format!("stop {}", id));
        Ok(())
    }
}

#[test]
fn test_isp_runs_with_raw_sensor() -> Result<(), Error> {
    let device = Rc::new(VirtualDevice::new().with_card("sunxi-vin").with_sensor_type(1));
    let calls = Rc::new(RefCell::new(Vec::new()));

    let mut handle = configured(&device, FourCC::NV21, 640, 480, 2)?;
    handle.select_input(1)?;
    assert_eq!(handle.sensor_type(), Some(vincap::device::SensorType::Raw));
    handle.attach_isp(Box::new(RecordingIsp(calls.clone())))?;

    handle.queue_all()?;
    handle.streamon()?;
    assert!(handle.isp_running());
    handle.close()?;
    assert!(!handle.isp_running());
    assert_eq!(*calls.borrow(), vec!["get_id 1", "start 11", "stop 11"]);
    Ok(())
}

#[test]
fn test_isp_rejected_without_raw_sensor() -> Result<(), Error> {
    let calls = Rc::new(RefCell::new(Vec::new()));

    let yuv = Rc::new(VirtualDevice::new().with_card("sunxi-vin").with_sensor_type(0));
    let mut handle = open(&yuv)?;
    assert_eq!(handle.sensor_type(), Some(vincap::device::SensorType::Yuv));
    let err = handle
        .attach_isp(Box::new(RecordingIsp(calls.clone())))
        .unwrap_err();
    assert!(matches!(err, Error::Unsupported("isp")));

    let plain = Rc::new(VirtualDevice::new());
    let mut handle = open(&plain)?;
    assert_eq!(handle.sensor_type(), None);
    assert!(handle.attach_isp(Box::new(RecordingIsp(calls.clone()))).is_err());
    assert!(calls.borrow().is_empty());
    Ok(())
}

// =============================================================================
// Bridging allocator
// =============================================================================

fn allocator(device: &Rc<VirtualDevice>, buffers: u32) -> Result<Allocator, Error> {
    Ok(Allocator::new(open(device)?).with_configurator(
        move |capture: &mut CaptureHandle| -> Result<u32, Error> {
            capture.set_pixel_format(FourCC::NV12, 640, 480)?;
            Ok(buffers)
        },
    ))
}

#[test]
fn test_allocator_requires_configuration() -> Result<(), Error> {
    let device = Rc::new(VirtualDevice::new());
    let allocator = Allocator::new(open(&device)?);
    assert!(matches!(allocator.acquire(), Err(Error::NotConfigured)));
    assert_eq!(device.buffer_count(), 0);
    Ok(())
}

#[test]
fn test_allocator_uses_existing_pool() -> Result<(), Error> {
    let device = Rc::new(VirtualDevice::new());
    let allocator = Allocator::new(configured(&device, FourCC::NV21, 640, 480, 2)?);
    allocator.acquire()?;
    allocator.acquire()?;
    assert!(matches!(allocator.acquire(), Err(Error::NoSlotAvailable)));
    Ok(())
}

#[test]
fn test_allocator_exhaustion() -> Result<(), Error> {
    let device = Rc::new(VirtualDevice::new().with_max_buffers(2));
    let allocator = allocator(&device, 4)?;

    let first = allocator.acquire()?;
    let second = allocator.acquire()?;
    assert_ne!(first.index(), second.index());
    assert_eq!(allocator.handle().slot_count(), 2);
    assert!(matches!(allocator.acquire(), Err(Error::NoSlotAvailable)));

    allocator.free(first)?;
    let third = allocator.acquire()?;
    assert_eq!(third.index(), first.index());
    assert_ne!(third, first);
    assert_eq!(allocator.live_handles(), 2);
    Ok(())
}

#[test]
fn test_allocator_refcounts_borrows() -> Result<(), Error> {
    let device = Rc::new(VirtualDevice::new());
    let allocator = allocator(&device, 3)?;
    let buffer = allocator.acquire()?;

    let frame = allocator.map(buffer)?;
    assert!(allocator.handle().is_streaming());
    assert_eq!(allocator.borrows(buffer), 1);
    assert_eq!(frame.plane(0).len(), 640 * 480 * 3 / 2);
    assert_eq!(frame.geometry().map(|g| g.width), Some(640));

    let again = allocator.map(buffer)?;
    let cloned = frame.clone();
    assert_eq!(allocator.borrows(buffer), 3);
    assert_eq!(again.info(), frame.info());
    assert_eq!(
        allocator.handle().slot_state(buffer.index()),
        Some(SlotState::Held)
    );

    let err = allocator.free(buffer).unwrap_err();
    assert!(matches!(err, Error::InvalidState { state: "borrowed", .. }));

    drop(again);
    allocator.unmap(cloned);
    assert_eq!(
        allocator.handle().slot_state(buffer.index()),
        Some(SlotState::Held)
    );
    drop(frame);
    assert_eq!(allocator.borrows(buffer), 0);
    assert_eq!(
        allocator.handle().slot_state(buffer.index()),
        Some(SlotState::Queued)
    );

    // Memory is never freed by unmap.
    assert_eq!(device.stats().unmaps, 0);
    Ok(())
}

#[test]
fn test_allocator_map_after_free() -> Result<(), Error> {
    let device = Rc::new(VirtualDevice::new());
    let allocator = allocator(&device, 2)?;
    let buffer = allocator.acquire()?;
    allocator.map(buffer)?;
    allocator.free(buffer)?;

    assert!(matches!(allocator.map(buffer), Err(Error::NotAllocated(_))));
    assert!(matches!(allocator.free(buffer), Err(Error::NotAllocated(_))));
    Ok(())
}

#[test]
fn test_allocator_successive_frames() -> Result<(), Error> {
    let device = Rc::new(VirtualDevice::new());
    let allocator = allocator(&device, 2)?;
    let buffers = [allocator.acquire()?, allocator.acquire()?];

    let mut offsets = Vec::new();
    for round in 0..3 {
        for &buffer in &buffers {
            let frame = allocator.map(buffer)?;
            offsets.push(frame.timing().offset);
            assert_eq!(frame.plane(0)[0], frame.timing().offset as u8, "round {}", round);
        }
    }
    assert_eq!(offsets, vec![0, 1, 2, 3, 4, 5]);

    let mut handle = allocator.into_handle();
    handle.close()?;
    assert_eq!(device.stats().live_mappings(), 0);
    Ok(())
}

#[test]
fn test_allocator_release_deferred_while_handle_borrowed() -> Result<(), Error> {
    let device = Rc::new(VirtualDevice::new());
    let allocator = allocator(&device, 2)?;
    let buffer = allocator.acquire()?;
    let frame = allocator.map(buffer)?;

    {
        let handle = allocator.handle();
        drop(frame);
        assert_eq!(handle.slot_state(buffer.index()), Some(SlotState::Held));
    }

    // The next allocator call completes the release.
    allocator.acquire()?;
    assert_eq!(
        allocator.handle().slot_state(buffer.index()),
        Some(SlotState::Queued)
    );
    Ok(())
}
