// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Refcounted hand-off of capture slots to an external buffer pool.
//!
//! Media frameworks manage buffers as allocate, map, unmap and free, with
//! several readers mapping the same buffer at once. [`Allocator`] maps that
//! model onto the fixed kernel slots of a [`CaptureHandle`]:
//!
//! - [`Allocator::acquire`] hands out a [`BufferHandle`] for a slot nobody
//!   else holds. The first acquire sizes the pool through the
//!   [`PoolConfigurator`].
//! - [`Allocator::map`] waits for that slot to be filled and returns a
//!   [`FrameRef`]. Mapping a slot that is already mapped, or cloning the
//!   `FrameRef`, only bumps a borrow count.
//! - Dropping the last `FrameRef` gives the slot back to the device.
//! - [`Allocator::free`] retires the handle. Kernel memory is never freed
//!   here; it lives as long as the pool.
//!
//! ```no_run
//! use vincap::{Allocator, CaptureHandle, CaptureType};
//! use vincap::fourcc::FourCC;
//!
//! let handle = CaptureHandle::open("/dev/video0", CaptureType::Any)?;
//! let allocator = Allocator::new(handle).with_configurator(
//!     |capture: &mut CaptureHandle| -> Result<u32, vincap::Error> {
//!         capture.set_pixel_format(FourCC::NV12, 1280, 720)?;
//!         Ok(4)
//!     },
//! );
//!
//! let buffer = allocator.acquire()?;
//! let frame = allocator.map(buffer)?;
//! println!("{} bytes, offset {}", frame.plane(0).len(), frame.timing().offset);
//! drop(frame);
//! allocator.free(buffer)?;
//! # Ok::<(), vincap::Error>(())
//! ```

use std::{
    cell::{Ref, RefCell},
    fmt,
};

use unix_ts::Timestamp;

use crate::{
    capture::{plane_bytes, FrameInfo, PickedFrame},
    device::CaptureHandle,
    geometry::FrameGeometry,
    pacing::FrameTiming,
    Error, MemoryType,
};

/// Decides the pool size on first acquire.
///
/// It may also negotiate the format, since nothing is allocated yet.
pub trait PoolConfigurator {
    fn configure(&mut self, capture: &mut CaptureHandle) -> Result<u32, Error>;
}

impl<F> PoolConfigurator for F
where
    F: FnMut(&mut CaptureHandle) -> Result<u32, Error>,
{
    fn configure(&mut self, capture: &mut CaptureHandle) -> Result<u32, Error> {
        self(capture)
    }
}

/// Token for one acquired slot.
///
/// A handle stays bound to the generation it was issued in; once freed it can
/// no longer be mapped even if the slot is acquired again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    index: u32,
    generation: u32,
}

impl BufferHandle {
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer {}.{}", self.index, self.generation)
    }
}

#[derive(Debug, Default)]
struct Lease {
    generation: u32,
    live: bool,
    borrows: u32,
    picked: Option<PickedFrame>,
    // Release deferred because the handle was borrowed when the last
    // FrameRef dropped.
    release_pending: bool,
}

/// Bridges an external allocate/map/unmap/free pool onto a capture handle.
pub struct Allocator {
    capture: RefCell<CaptureHandle>,
    leases: RefCell<Vec<Lease>>,
    configurator: RefCell<Option<Box<dyn PoolConfigurator>>>,
    memory: MemoryType,
}

impl fmt::Debug for Allocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocator")
            .field("capture", &self.capture)
            .field("leases", &self.leases)
            .field("configured", &self.configurator.borrow().is_some())
            .field("memory", &self.memory)
            .finish()
    }
}

impl Allocator {
    pub fn new(capture: CaptureHandle) -> Allocator {
        let slots = capture.slot_count() as usize;
        Allocator {
            capture: RefCell::new(capture),
            leases: RefCell::new((0..slots).map(|_| Lease::default()).collect()),
            configurator: RefCell::new(None),
            memory: MemoryType::Mmap,
        }
    }

    pub fn with_configurator<C: PoolConfigurator + 'static>(self, configurator: C) -> Allocator {
        *self.configurator.borrow_mut() = Some(Box::new(configurator));
        self
    }

    pub fn with_memory(mut self, memory: MemoryType) -> Allocator {
        self.memory = memory;
        self
    }

    /// Borrow the underlying capture handle for queries.
    pub fn handle(&self) -> Ref<'_, CaptureHandle> {
        self.capture.borrow()
    }

    /// Take the capture handle back. Every [`FrameRef`] must be gone.
    pub fn into_handle(self) -> CaptureHandle {
        let mut capture = self.capture.into_inner();
        for (index, lease) in self.leases.into_inner().into_iter().enumerate() {
            if lease.release_pending {
                if let Err(err) = capture.release(index as u32) {
                    log::warn!("failed to release buffer {}: {}", index, err);
                }
            }
        }
        capture
    }

    /// Handles acquired and not yet freed.
    pub fn live_handles(&self) -> usize {
        self.leases.borrow().iter().filter(|l| l.live).count()
    }

    /// Current borrow count of the slot behind `handle`.
    pub fn borrows(&self, handle: BufferHandle) -> u32 {
        self.leases
            .borrow()
            .get(handle.index as usize)
            .filter(|l| l.live && l.generation == handle.generation)
            .map_or(0, |l| l.borrows)
    }

    fn ensure_pool(&self) -> Result<(), Error> {
        let mut capture = self.capture.borrow_mut();
        if capture.slot_count() == 0 {
            let mut configurator = self.configurator.borrow_mut();
            let configurator = configurator.as_mut().ok_or(Error::NotConfigured)?;
            let count = configurator.configure(&mut capture)?;
            let granted = capture.request_buffers(count, self.memory)?;
            log::info!("allocator pool configured with {} buffers", granted);
        }

        let slots = capture.slot_count() as usize;
        let mut leases = self.leases.borrow_mut();
        if leases.len() != slots {
            leases.clear();
            leases.resize_with(slots, Lease::default);
        }
        Ok(())
    }

    fn flush_releases(&self) {
        let Ok(mut capture) = self.capture.try_borrow_mut() else {
            return;
        };
        for (index, lease) in self.leases.borrow_mut().iter_mut().enumerate() {
            if lease.release_pending {
                lease.release_pending = false;
                if let Err(err) = capture.release(index as u32) {
                    log::warn!("failed to release buffer {}: {}", index, err);
                }
            }
        }
    }

    /// Hand out a slot no live handle refers to.
    pub fn acquire(&self) -> Result<BufferHandle, Error> {
        self.flush_releases();
        self.ensure_pool()?;

        let mut leases = self.leases.borrow_mut();
        let (index, lease) = leases
            .iter_mut()
            .enumerate()
            .find(|(_, l)| !l.live)
            .ok_or(Error::NoSlotAvailable)?;
        lease.live = true;
        let handle = BufferHandle {
            index: index as u32,
            generation: lease.generation,
        };
        log::debug!("{} acquired", handle);
        Ok(handle)
    }

    /// Borrow the filled contents of the slot behind `handle`.
    ///
    /// The first borrow starts streaming if needed and waits for the slot.
    pub fn map(&self, handle: BufferHandle) -> Result<FrameRef<'_>, Error> {
        self.flush_releases();

        let mut leases = self.leases.borrow_mut();
        let lease = leases
            .get_mut(handle.index as usize)
            .filter(|l| l.live && l.generation == handle.generation)
            .ok_or(Error::NotAllocated(handle.index))?;

        if let Some(picked) = lease.picked.clone() {
            lease.borrows += 1;
            return Ok(self.frame_ref(picked));
        }

        let picked = {
            let mut capture = self.capture.borrow_mut();
            if !capture.is_streaming() {
                capture.queue_all()?;
                capture.streamon()?;
            }
            capture.pick(handle.index)?
        };
        lease.borrows = 1;
        lease.picked = Some(picked.clone());
        log::trace!("{} mapped, sequence {}", handle, picked.info.sequence);
        Ok(self.frame_ref(picked))
    }

    fn frame_ref(&self, picked: PickedFrame) -> FrameRef<'_> {
        FrameRef {
            allocator: self,
            geometry: self.capture.borrow().geometry().cloned(),
            picked,
        }
    }

    /// Drop one borrow. Equivalent to dropping `frame`.
    pub fn unmap(&self, frame: FrameRef<'_>) {
        drop(frame);
    }

    fn unborrow(&self, index: u32) {
        let mut leases = self.leases.borrow_mut();
        let Some(lease) = leases.get_mut(index as usize) else {
            return;
        };
        lease.borrows = lease.borrows.saturating_sub(1);
        if lease.borrows > 0 {
            return;
        }
        lease.picked = None;

        match self.capture.try_borrow_mut() {
            Ok(mut capture) => {
                if let Err(err) = capture.release(index) {
                    log::warn!("failed to release buffer {}: {}", index, err);
                }
            }
            Err(_) => {
                log::debug!("buffer {}: release deferred", index);
                lease.release_pending = true;
            }
        }
    }

    /// Retire `handle`. Its slot may be acquired again under a new handle.
    pub fn free(&self, handle: BufferHandle) -> Result<(), Error> {
        let mut leases = self.leases.borrow_mut();
        let lease = leases
            .get_mut(handle.index as usize)
            .filter(|l| l.live && l.generation == handle.generation)
            .ok_or(Error::NotAllocated(handle.index))?;
        if lease.borrows > 0 {
            return Err(Error::InvalidState {
                index: Some(handle.index),
                state: "borrowed",
            });
        }
        lease.live = false;
        lease.generation = lease.generation.wrapping_add(1);
        log::debug!("{} freed", handle);
        Ok(())
    }
}

/// A borrowed, filled capture slot.
///
/// Clones share the slot. The slot returns to the device when the last clone
/// drops.
pub struct FrameRef<'a> {
    allocator: &'a Allocator,
    picked: PickedFrame,
    geometry: Option<FrameGeometry>,
}

impl fmt::Debug for FrameRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameRef")
            .field("picked", &self.picked)
            .field("geometry", &self.geometry)
            .finish()
    }
}

impl FrameRef<'_> {
    pub fn index(&self) -> u32 {
        self.picked.index()
    }

    pub fn n_planes(&self) -> usize {
        self.picked.n_planes()
    }

    /// Filled bytes of one plane; empty when the plane does not exist.
    pub fn plane(&self, plane: usize) -> &[u8] {
        match self.picked.planes.get(plane) {
            // SAFETY: the slot stays held while any FrameRef exists, and the
            // allocator offers no way to tear the pool down while borrowed.
            Some(view) => unsafe {
                plane_bytes(view, self.picked.info.bytesused.get(plane).copied())
            },
            None => &[],
        }
    }

    pub fn info(&self) -> &FrameInfo {
        &self.picked.info
    }

    pub fn timing(&self) -> &FrameTiming {
        &self.picked.info.timing
    }

    pub fn timestamp(&self) -> Option<Timestamp> {
        self.picked.info.timestamp()
    }

    pub fn geometry(&self) -> Option<&FrameGeometry> {
        self.geometry.as_ref()
    }
}

impl Clone for FrameRef<'_> {
    fn clone(&self) -> Self {
        if let Some(lease) = self
            .allocator
            .leases
            .borrow_mut()
            .get_mut(self.index() as usize)
        {
            lease.borrows += 1;
        }
        FrameRef {
            allocator: self.allocator,
            picked: self.picked.clone(),
            geometry: self.geometry.clone(),
        }
    }
}

impl Drop for FrameRef<'_> {
    fn drop(&mut self) {
        self.allocator.unborrow(self.index());
    }
}
