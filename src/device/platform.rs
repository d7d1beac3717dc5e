//! # Platform Capabilities
//!
//! The resource manager does not talk to hardware itself. Everything it needs from the platform is
//! expressed by three traits:
//!
//! - [`BusSubsystem`] enables devices and maps their BARs,
//! - [`DmaSubsystem`] hands out DMA-coherent memory,
//! - [`InterruptSubsystem`] routes device interrupts to a dispatch function.
//!
//! [`sim`](super::sim) contains implementations that do not need real hardware.

use std::{fmt::Debug, num::NonZeroUsize, sync::Arc};

use crate::device::{
    dma::DmaMask,
    pci::{
        address::PciAddress,
        bar::{BarIndex, RegionInfo},
    },
};

/// An address in the virtual address space of this process.
///
/// This is a plain integer and not a pointer, because it is handed between threads and only
/// dereferenced by code that knows the mapping is still alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtualAddress(NonZeroUsize);

impl VirtualAddress {
    /// Wrap a non-null pointer.
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Option<Self> {
        NonZeroUsize::new(ptr as usize).map(Self)
    }

    /// The address as integer.
    #[must_use]
    pub const fn get(self) -> usize {
        self.0.get()
    }

    /// The address as byte pointer.
    #[must_use]
    pub fn as_ptr(self) -> *mut u8 {
        self.0.get() as *mut u8
    }
}

/// An address as seen by a device performing DMA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BusAddress(pub u64);

/// An opaque registration token handed out by an [`InterruptSubsystem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InterruptToken(pub u64);

/// The function an [`InterruptSubsystem`] calls for each interrupt of a device.
pub type DispatchFn = Arc<dyn Fn() + Send + Sync>;

/// Errors reported by platform subsystems.
#[derive(thiserror::Error, Debug)]
pub enum PlatformError {
    /// The platform does not know the device.
    #[error("No such device: {address}")]
    NoSuchDevice {
        /// The address that was looked up.
        address: PciAddress,
    },

    /// The BAR cannot be mapped.
    #[error("{index} of {address} cannot be mapped")]
    RegionUnavailable {
        /// The device.
        address: PciAddress,
        /// The BAR that was requested.
        index: BarIndex,
    },

    /// No virtual address space was left for the mapping.
    #[error("Out of address space")]
    OutOfAddressSpace,

    /// Not enough memory to satisfy an allocation.
    #[error("Out of memory allocating {requested} bytes")]
    OutOfMemory {
        /// The requested size in bytes.
        requested: u64,
    },

    /// The platform refused the operation.
    #[error("Operation rejected: {reason}")]
    Rejected {
        /// A human-readable explanation.
        reason: String,
    },

    /// An I/O error from the host.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The bus subsystem the device sits on.
///
/// # Safety
///
/// Implementors must guarantee that an address returned by [`map_region`](Self::map_region)
/// points to at least [`RegionInfo::length`] bytes of readable and writable memory that stays
/// mapped until the matching [`unmap_region`](Self::unmap_region) call.
pub unsafe trait BusSubsystem: Debug + Send + Sync {
    /// Enable memory-space decoding and bus mastering for the device.
    fn enable(&self, device: PciAddress) -> Result<(), PlatformError>;

    /// Disable memory-space decoding and bus mastering for the device.
    fn disable(&self, device: PciAddress);

    /// Query location, length and attributes of a BAR.
    fn region_info(&self, device: PciAddress, index: BarIndex)
        -> Result<RegionInfo, PlatformError>;

    /// Map a BAR into the address space of this process.
    fn map_region(&self, device: PciAddress, index: BarIndex)
        -> Result<VirtualAddress, PlatformError>;

    /// Release a mapping created by [`map_region`](Self::map_region).
    fn unmap_region(&self, device: PciAddress, index: BarIndex, address: VirtualAddress);

    /// The range of bus addresses the device can reach with DMA.
    fn dma_mask(&self, _device: PciAddress) -> DmaMask {
        DmaMask::default()
    }
}

/// The DMA subsystem that provides coherent memory.
///
/// # Safety
///
/// Implementors must guarantee that the CPU address returned by
/// [`allocate_coherent`](Self::allocate_coherent) points to `length` bytes of readable and
/// writable memory, that the bus address refers to the same memory, and that both stay valid until
/// the matching [`free_coherent`](Self::free_coherent) call.
pub unsafe trait DmaSubsystem: Debug + Send + Sync {
    /// Allocate a buffer that the CPU and the device see coherently.
    fn allocate_coherent(
        &self,
        device: PciAddress,
        length: u64,
    ) -> Result<(VirtualAddress, BusAddress), PlatformError>;

    /// Release a buffer from [`allocate_coherent`](Self::allocate_coherent).
    fn free_coherent(
        &self,
        device: PciAddress,
        cpu_address: VirtualAddress,
        bus_address: BusAddress,
        length: u64,
    );
}

/// The interrupt subsystem that delivers device interrupts.
///
/// The subsystem calls the dispatch function on whatever execution context it delivers interrupts
/// on. Interrupts raised after [`unregister_handler`](Self::unregister_handler) returned are not
/// dispatched for the token anymore.
pub trait InterruptSubsystem: Debug + Send + Sync {
    /// Route interrupts of `device` to `dispatch`.
    fn register_handler(
        &self,
        device: PciAddress,
        dispatch: DispatchFn,
    ) -> Result<InterruptToken, PlatformError>;

    /// Stop routing interrupts for a registration.
    fn unregister_handler(&self, token: InterruptToken);
}

/// A node in the generic device model that a handle belongs to.
///
/// Handles only keep a weak reference to it.
pub trait DeviceNode: Debug + Send + Sync {
    /// A name for diagnostics.
    fn name(&self) -> String;
}

/// A reference-counted reference to a [`BusSubsystem`].
pub type BusSubsystemRef = Arc<dyn BusSubsystem>;

/// A reference-counted reference to a [`DmaSubsystem`].
pub type DmaSubsystemRef = Arc<dyn DmaSubsystem>;

/// A reference-counted reference to an [`InterruptSubsystem`].
pub type InterruptSubsystemRef = Arc<dyn InterruptSubsystem>;

/// The set of platform capabilities a resource manager works with.
#[derive(Debug, Clone)]
pub struct Platform {
    /// The bus the managed devices sit on.
    pub bus: BusSubsystemRef,

    /// The provider of coherent DMA memory.
    pub dma: DmaSubsystemRef,

    /// The interrupt router.
    pub interrupts: InterruptSubsystemRef,
}
