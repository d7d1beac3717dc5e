//! # Coherent DMA Pool
//!
//! [`CoherentPool`] is a [`DmaSubsystem`] that carves buffers out of one anonymous memory
//! mapping with a [`BuddyAllocator`]. The bus address of a buffer is its offset in the pool plus a
//! configurable bus base address, which lets tests place the pool outside of what a device can
//! address.

use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use memmap2::MmapMut;
use tracing::{trace, warn};

use crate::device::{
    buddy::{BuddyAllocator, BuddyError},
    pci::address::PciAddress,
    platform::{BusAddress, DmaSubsystem, PlatformError, VirtualAddress},
};

/// Errors when creating a [`CoherentPool`].
#[derive(thiserror::Error, Debug)]
pub enum PoolError {
    /// The pool geometry is invalid.
    #[error("Invalid pool geometry: {0}")]
    Geometry(#[from] BuddyError),

    /// The pool memory could not be mapped.
    #[error("Failed to map pool memory: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
struct PoolState {
    allocator: BuddyAllocator,

    /// Which device owns the block at an offset.
    owners: BTreeMap<u64, PciAddress>,
}

/// A pool of DMA-coherent memory.
#[derive(Debug)]
pub struct CoherentPool {
    /// The backing memory. Only accessed via `base`.
    _memory: MmapMut,
    base: VirtualAddress,
    bus_base: u64,
    state: Mutex<PoolState>,
}

impl CoherentPool {
    /// Create a pool of `size` bytes handing out blocks of at least `min_block` bytes. Both must
    /// be powers of two. The device sees the pool at `bus_base`.
    pub fn new(size: u64, min_block: u64, bus_base: u64) -> Result<Self, PoolError> {
        let allocator = BuddyAllocator::new(size, min_block)?;
        let length = usize::try_from(size)
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::OutOfMemory))?;
        let memory = MmapMut::map_anon(length)?;
        let base = VirtualAddress::from_ptr(memory.as_ptr())
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::AddrNotAvailable))?;

        Ok(Self {
            _memory: memory,
            base,
            bus_base,
            state: Mutex::new(PoolState {
                allocator,
                owners: BTreeMap::new(),
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The number of buffers currently handed out.
    #[must_use]
    pub fn live_allocations(&self) -> usize {
        self.state().owners.len()
    }

    /// The number of buffers currently handed out to `device`.
    #[must_use]
    pub fn live_allocations_of(&self, device: PciAddress) -> usize {
        self.state()
            .owners
            .values()
            .filter(|&&owner| owner == device)
            .count()
    }

    /// The number of free bytes.
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.state().allocator.free_bytes()
    }
}

// SAFETY: Buffers are blocks of the pool mapping, which lives as long as the pool. The buddy
// allocator never hands out a block twice before it is freed.
unsafe impl DmaSubsystem for CoherentPool {
    fn allocate_coherent(
        &self,
        device: PciAddress,
        length: u64,
    ) -> Result<(VirtualAddress, BusAddress), PlatformError> {
        let mut state = self.state();

        let offset = state.allocator.allocate(length).map_err(|e| match e {
            BuddyError::OutOfMemory(requested) => PlatformError::OutOfMemory { requested },
            e => PlatformError::Rejected {
                reason: e.to_string(),
            },
        })?;

        // The offset is below the pool size, which fits into usize.
        let offset_usize = offset as usize;
        let cpu = VirtualAddress::from_ptr(self.base.as_ptr().wrapping_add(offset_usize))
            .ok_or(PlatformError::OutOfMemory { requested: length })?;

        // Coherent allocations are handed out zeroed. We zero the whole block, which may be larger
        // than requested.
        let block = state.allocator.block_size(offset).unwrap_or(length);

        // SAFETY: The block lies inside the pool mapping and is owned by nobody else.
        unsafe { std::ptr::write_bytes(cpu.as_ptr(), 0, block as usize) };

        state.owners.insert(offset, device);
        trace!("{device}: coherent block at pool offset {offset:#x} ({block:#x} bytes)");

        Ok((cpu, BusAddress(self.bus_base + offset)))
    }

    fn free_coherent(
        &self,
        device: PciAddress,
        cpu_address: VirtualAddress,
        bus_address: BusAddress,
        _length: u64,
    ) {
        let mut state = self.state();

        let Some(offset) = cpu_address
            .get()
            .checked_sub(self.base.get())
            .map(|o| o as u64)
        else {
            warn!("{device}: freeing {cpu_address:?}, which is not in the pool");
            return;
        };

        if bus_address.0 != self.bus_base + offset {
            warn!("{device}: bus address {bus_address:?} does not match {cpu_address:?}");
            return;
        }

        match state.owners.get(&offset) {
            Some(&owner) if owner == device => {}
            owner => {
                warn!("{device}: freeing buffer at {offset:#x} owned by {owner:?}");
                return;
            }
        }

        match state.allocator.free(offset) {
            Ok(()) => {
                state.owners.remove(&offset);
            }
            Err(e) => warn!("{device}: {e}"),
        }
    }
}
