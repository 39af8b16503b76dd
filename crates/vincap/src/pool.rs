// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Buffer slot requests, mappings and the slot state table.
//!
//! A pool is installed only once every slot the device granted has been
//! queried and mapped; a failure part way through rolls back what was done.
//! Slot count is fixed until the pool is torn down.

use std::{
    ffi::c_void,
    fmt,
    os::fd::FromRawFd,
    ptr::NonNull,
};

use dma_buf::DmaBuf;
use vincap_sys as ffi;
use vincap_sys::nix::libc;

use crate::{
    capture::FrameInfo,
    device::CaptureHandle,
    ioctl_error,
    v4l2::{Access, Driver},
    Error, MemoryType,
};

/// Kernel-reported location of one plane within the device's memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneRegion {
    pub offset: u32,
    pub length: u32,
}

/// Result of `VIDIOC_QUERYBUF` for one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotDescriptor {
    pub index: u32,
    pub planes: Vec<PlaneRegion>,
}

#[derive(Debug)]
struct MappedPlane {
    ptr: Option<NonNull<c_void>>,
    length: usize,
}

/// Plane address and length copied out of a mapping.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PlaneView {
    pub ptr: NonNull<u8>,
    pub len: usize,
}

/// The process-side mappings of one slot.
///
/// Mappings are released by [`unmap_slot`], never on drop.
pub struct MappedSlot {
    index: u32,
    planes: Vec<MappedPlane>,
}

impl fmt::Debug for MappedSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedSlot")
            .field("index", &self.index)
            .field("planes", &self.planes.len())
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

impl MappedSlot {
    fn unmapped(index: u32) -> MappedSlot {
        MappedSlot {
            index,
            planes: Vec::new(),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn n_planes(&self) -> usize {
        self.planes.len()
    }

    /// True when the slot has planes and every one of them is mapped.
    pub fn is_mapped(&self) -> bool {
        !self.planes.is_empty() && self.planes.iter().all(|p| p.ptr.is_some())
    }

    pub fn plane_len(&self, plane: usize) -> Option<usize> {
        self.planes.get(plane).map(|p| p.length)
    }

    pub(crate) fn views(&self) -> Vec<PlaneView> {
        self.planes
            .iter()
            .filter_map(|p| {
                p.ptr.map(|ptr| PlaneView {
                    ptr: ptr.cast(),
                    len: p.length,
                })
            })
            .collect()
    }
}

/// Map every plane of a slot shared with the device.
///
/// On failure of plane `k`, planes `0..k` are unmapped before returning.
pub fn map_slot(
    driver: &dyn Driver,
    desc: &SlotDescriptor,
    access: Access,
) -> Result<MappedSlot, Error> {
    let mut slot = MappedSlot {
        index: desc.index,
        planes: Vec::with_capacity(desc.planes.len()),
    };

    for (plane, region) in desc.planes.iter().enumerate() {
        let length = region.length as usize;
        match driver.map(length, region.offset, access) {
            Ok(ptr) => slot.planes.push(MappedPlane {
                ptr: Some(ptr),
                length,
            }),
            Err(errno) => {
                log::error!(
                    "mmap of buffer {} plane {} ({} bytes at {:#x}) failed: {}",
                    desc.index,
                    plane,
                    length,
                    region.offset,
                    errno
                );
                unmap_slot(driver, &mut slot);
                return Err(Error::MapFailed {
                    index: desc.index,
                    plane,
                    errno,
                });
            }
        }
    }

    Ok(slot)
}

/// Release every plane mapping that is still held. Safe to repeat.
pub fn unmap_slot(driver: &dyn Driver, slot: &mut MappedSlot) {
    for (plane, mapped) in slot.planes.iter_mut().enumerate() {
        if let Some(ptr) = mapped.ptr.take() {
            // SAFETY: ptr/length come from the driver's own map call and the
            // pointer was taken out of the slot, so nothing refers to it anymore.
            if let Err(errno) = unsafe { driver.unmap(ptr, mapped.length) } {
                log::warn!(
                    "munmap of buffer {} plane {} failed: {}",
                    slot.index,
                    plane,
                    errno
                );
            }
        }
    }
}

/// Where a slot is in its capture cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotState {
    /// Owned by the process and not queued
    Free,
    /// Submitted to the device
    Queued,
    /// Dequeued, not yet handed to a consumer
    Ready,
    /// Handed to a consumer
    Held,
}

impl SlotState {
    pub fn name(self) -> &'static str {
        match self {
            SlotState::Free => "free",
            SlotState::Queued => "queued",
            SlotState::Ready => "ready",
            SlotState::Held => "held",
        }
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug)]
pub(crate) struct BufferSlot {
    pub mapped: MappedSlot,
    pub state: SlotState,
    /// Set while Ready or Held
    pub frame: Option<FrameInfo>,
}

#[derive(Debug)]
pub(crate) struct BufferPool {
    pub memory: MemoryType,
    pub slots: Vec<BufferSlot>,
}

impl BufferPool {
    /// A pool with slots may stream. User-pointer and DMABUF pools count as
    /// ready without any process-side mapping.
    pub fn is_ready(&self) -> bool {
        !self.slots.is_empty()
    }

    pub fn slot(&self, index: u32) -> Result<&BufferSlot, Error> {
        self.slots
            .get(index as usize)
            .ok_or(Error::InvalidState {
                index: Some(index),
                state: "out of range",
            })
    }

    pub fn slot_mut(&mut self, index: u32) -> Result<&mut BufferSlot, Error> {
        self.slots
            .get_mut(index as usize)
            .ok_or(Error::InvalidState {
                index: Some(index),
                state: "out of range",
            })
    }

    pub fn count(&self, state: SlotState) -> usize {
        self.slots.iter().filter(|s| s.state == state).count()
    }

    /// After stream off the device holds nothing; queued and undelivered
    /// slots go back to free. Held slots stay with their consumer.
    pub fn reclaim(&mut self) {
        for slot in &mut self.slots {
            if matches!(slot.state, SlotState::Queued | SlotState::Ready) {
                log::debug!("buffer {}: {} -> free", slot.mapped.index, slot.state);
                slot.state = SlotState::Free;
                slot.frame = None;
            }
        }
    }
}

fn free_kernel_buffers(driver: &dyn Driver, buf_type: u32, memory: MemoryType) -> Result<(), Error> {
    let mut req = ffi::v4l2_requestbuffers {
        count: 0,
        type_: buf_type,
        memory: memory.to_v4l2(),
        ..Default::default()
    };
    driver
        .reqbufs(&mut req)
        .map_err(ioctl_error("VIDIOC_REQBUFS", None))
}

impl CaptureHandle {
    /// Request `count` slots from the device and map them.
    ///
    /// The device may grant fewer; the granted count is returned and becomes
    /// the pool size. Any existing pool is torn down first.
    pub fn request_buffers(&mut self, count: u32, memory: MemoryType) -> Result<u32, Error> {
        if self.streaming {
            return Err(Error::InvalidState {
                index: None,
                state: "streaming",
            });
        }
        self.release_pool()?;

        let driver = self.driver()?;
        let buf_type = self.ops.buf_type();
        let mut req = ffi::v4l2_requestbuffers {
            count,
            type_: buf_type,
            memory: memory.to_v4l2(),
            ..Default::default()
        };
        driver
            .reqbufs(&mut req)
            .map_err(ioctl_error("VIDIOC_REQBUFS", None))?;

        let granted = req.count;
        if granted == 0 {
            log::error!("device granted no {} buffers", memory);
            return Err(Error::NoBuffers);
        }
        if granted < count {
            log::warn!("requested {} buffers, device granted {}", count, granted);
        }

        let mut slots: Vec<BufferSlot> = Vec::with_capacity(granted as usize);
        for index in 0..granted {
            let mapped = match memory {
                MemoryType::Mmap => self
                    .query_slot_as(index, memory)
                    .and_then(|desc| map_slot(driver, &desc, Access::ReadWrite)),
                MemoryType::UserPtr | MemoryType::DmaBuf => Ok(MappedSlot::unmapped(index)),
            };

            match mapped {
                Ok(mapped) => slots.push(BufferSlot {
                    mapped,
                    state: SlotState::Free,
                    frame: None,
                }),
                Err(err) => {
                    for slot in &mut slots {
                        unmap_slot(driver, &mut slot.mapped);
                    }
                    if let Err(cleanup) = free_kernel_buffers(driver, buf_type, memory) {
                        log::warn!("releasing buffers after failed setup: {}", cleanup);
                    }
                    return Err(err);
                }
            }
        }

        log::info!(
            "{}: {} {} buffers of {} planes",
            self.path().display(),
            granted,
            memory,
            self.n_planes()
        );
        self.pool = Some(BufferPool { memory, slots });
        Ok(granted)
    }

    /// Query where the kernel keeps slot `index`.
    ///
    /// User-pointer pools have no kernel memory and yield an empty descriptor.
    pub fn query_slot(&self, index: u32) -> Result<SlotDescriptor, Error> {
        self.query_slot_as(index, self.memory_type())
    }

    fn query_slot_as(&self, index: u32, memory: MemoryType) -> Result<SlotDescriptor, Error> {
        if memory == MemoryType::UserPtr {
            return Ok(SlotDescriptor {
                index,
                planes: Vec::new(),
            });
        }
        let desc = self
            .ops
            .query(self.driver()?, memory, index, self.n_planes())?;
        log::debug!("buffer {}: {:?}", index, desc.planes);
        Ok(desc)
    }

    /// Export one plane of a slot as a dma-buf.
    pub fn export_dmabuf(&self, index: u32, plane: u32) -> Result<DmaBuf, Error> {
        let pool = self.pool.as_ref().ok_or(Error::NoBuffers)?;
        if pool.memory != MemoryType::Mmap {
            return Err(Error::Unsupported("dma-buf export of non-MMAP buffers"));
        }
        pool.slot(index)?;

        let mut exp = ffi::v4l2_exportbuffer {
            type_: self.ops.buf_type(),
            index,
            plane,
            flags: (libc::O_CLOEXEC | libc::O_RDWR) as u32,
            ..Default::default()
        };
        self.driver()?
            .expbuf(&mut exp)
            .map_err(ioctl_error("VIDIOC_EXPBUF", Some(index)))?;

        // SAFETY: VIDIOC_EXPBUF returned a new descriptor that we now own.
        Ok(unsafe { DmaBuf::from_raw_fd(exp.fd) })
    }

    /// Unmap every slot and hand the buffers back to the kernel.
    pub(crate) fn release_pool(&mut self) -> Result<(), Error> {
        let Some(mut pool) = self.pool.take() else {
            return Ok(());
        };
        let driver = self.driver()?;
        for slot in &mut pool.slots {
            unmap_slot(driver, &mut slot.mapped);
        }
        log::debug!("released {} buffers", pool.slots.len());
        free_kernel_buffers(driver, self.ops.buf_type(), pool.memory)
    }

    /// Number of slots in the pool, zero before `request_buffers`.
    pub fn slot_count(&self) -> u32 {
        self.pool.as_ref().map_or(0, |p| p.slots.len() as u32)
    }

    /// Number of slots whose planes are all mapped.
    pub fn mapped_count(&self) -> u32 {
        self.pool.as_ref().map_or(0, |p| {
            p.slots.iter().filter(|s| s.mapped.is_mapped()).count() as u32
        })
    }

    pub fn slot_state(&self, index: u32) -> Option<SlotState> {
        self.pool
            .as_ref()
            .and_then(|p| p.slots.get(index as usize))
            .map(|s| s.state)
    }

    /// Memory mode of the current pool, `Mmap` when there is none.
    pub fn memory_type(&self) -> MemoryType {
        self.pool.as_ref().map_or(MemoryType::Mmap, |p| p.memory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_state_names() {
        assert_eq!(SlotState::Free.to_string(), "free");
        assert_eq!(SlotState::Held.name(), "held");
    }

    #[test]
    fn test_reclaim_keeps_held() {
        let mut pool = BufferPool {
            memory: MemoryType::Mmap,
            slots: [SlotState::Queued, SlotState::Ready, SlotState::Held, SlotState::Free]
                .into_iter()
                .enumerate()
                .map(|(i, state)| BufferSlot {
                    mapped: MappedSlot::unmapped(i as u32),
                    state,
                    frame: None,
                })
                .collect(),
        };
        pool.reclaim();
        assert_eq!(pool.count(SlotState::Free), 3);
        assert_eq!(pool.count(SlotState::Held), 1);
        assert_eq!(pool.slots[2].state, SlotState::Held);
    }

    #[test]
    fn test_partially_mapped_slot() {
        let slot = MappedSlot {
            index: 1,
            planes: vec![
                MappedPlane {
                    ptr: Some(NonNull::dangling()),
                    length: 16,
                },
                MappedPlane {
                    ptr: None,
                    length: 8,
                },
            ],
        };
        assert!(!slot.is_mapped());
        assert_eq!(slot.n_planes(), 2);
    }

    #[test]
    fn test_unmapped_pool_is_ready() {
        let pool = BufferPool {
            memory: MemoryType::UserPtr,
            slots: vec![BufferSlot {
                mapped: MappedSlot::unmapped(0),
                state: SlotState::Free,
                frame: None,
            }],
        };
        assert!(pool.is_ready());
        assert!(!pool.slots[0].mapped.is_mapped());
    }

    #[test]
    fn test_unmapped_slot() {
        let slot = MappedSlot::unmapped(4);
        assert_eq!(slot.index(), 4);
        assert!(!slot.is_mapped());
        assert!(slot.views().is_empty());
        assert_eq!(slot.plane_len(0), None);
    }
}
