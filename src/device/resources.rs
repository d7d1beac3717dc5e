//! # Device Resource Manager
//!
//! A [`DeviceResourceManager`] claims PCI devices and hands out one [`DeviceHandle`] per claimed
//! device. The handle owns everything the device was given: up to six BAR mappings, one
//! DMA-coherent buffer and an interrupt registration.
//!
//! ## Lifecycle
//!
//! ```text
//! attach() ──► Attached ──detach()──► Detaching ──► Invalidated
//! ```
//!
//! While a handle is attached, BARs can be mapped and unmapped, the DMA buffer allocated and freed
//! and the interrupt handler registered and unregistered independently. [`DeviceHandle::detach`]
//! releases everything that is still held, disables the device and invalidates the handle. Every
//! later operation fails with [`ResourceError::HandleInvalidated`]. Dropping an attached handle
//! detaches it.
//!
//! ## Locking
//!
//! All structural operations on a handle serialize on one mutex. The interrupt path does not use
//! it: [`DeviceHandle::service_interrupt`] only touches an [`InterruptContext`], which is
//! lock-free.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use edev::device::{
//!     pci::address::PciAddress,
//!     resources::{AttachRequest, DeviceResourceManager, ResourceError},
//!     sim::{
//!         self,
//!         bus::{SimulatedBar, SimulatedBus},
//!         dma::CoherentPool,
//!         irq::SoftInterruptController,
//!     },
//! };
//!
//! let dev = PciAddress::new(0, 3, 0);
//! let bus = Arc::new(SimulatedBus::new());
//! bus.add_device(dev, [(0, SimulatedBar::memory(0x1000))]);
//!
//! let pool = Arc::new(CoherentPool::new(0x10000, 0x1000, 0x8000_0000).unwrap());
//! let manager = DeviceResourceManager::new(sim::platform(
//!     bus,
//!     pool,
//!     Arc::new(SoftInterruptController::new()),
//! ));
//!
//! // BAR1 does not exist, so the whole attach is rolled back.
//! let err = manager
//!     .attach(AttachRequest::new(dev).bars(0b11).dma_buffer_size(4096))
//!     .unwrap_err();
//! assert!(matches!(err, ResourceError::RegionUnavailable(_)));
//! assert!(!manager.is_attached(dev));
//!
//! let handle = manager
//!     .attach(AttachRequest::new(dev).bars(0b1).dma_buffer_size(4096))
//!     .unwrap();
//! assert!(handle.bar(0).is_some());
//! handle.detach();
//! ```

use std::{
    collections::BTreeSet,
    fmt::{self, Debug},
    ops::Range,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use tracing::{debug, info, warn};

use crate::device::{
    bus::{Request, RequestSize},
    dma::{DmaBuffer, DmaBufferInfo},
    interrupt::{InterruptContext, InterruptHandler},
    interval::Interval,
    pci::{
        address::PciAddress,
        bar::{BarIndex, BarMapping, BarMask, BarSlot, InvalidBarIndex},
        constants::config_space::MAX_BARS,
    },
    platform::{BusAddress, DeviceNode, DispatchFn, InterruptToken, Platform, PlatformError},
};

/// Errors of resource operations.
#[derive(thiserror::Error, Debug)]
pub enum ResourceError {
    /// A BAR index outside of `0..6` was used.
    #[error("BAR index {0} is out of range")]
    InvalidIndex(usize),

    /// The BAR is already mapped.
    #[error("{0} is already mapped")]
    AlreadyMapped(BarIndex),

    /// The BAR is not mapped.
    #[error("{0} is not mapped")]
    NotMapped(BarIndex),

    /// The BAR is empty or not a memory BAR.
    #[error("{0} is not a mappable memory region")]
    RegionUnavailable(BarIndex),

    /// The bus subsystem failed to map the BAR.
    #[error("Failed to map {index}")]
    MappingFailed {
        /// The BAR that was to be mapped.
        index: BarIndex,
        /// What the bus subsystem reported.
        #[source]
        source: PlatformError,
    },

    /// The handle already has a DMA buffer.
    #[error("A DMA buffer is already allocated")]
    AlreadyAllocated,

    /// The handle has no DMA buffer.
    #[error("No DMA buffer is allocated")]
    NotAllocated,

    /// The DMA subsystem could not provide the buffer.
    #[error("Out of memory allocating a {requested} byte DMA buffer")]
    OutOfMemory {
        /// The requested size in bytes.
        requested: u64,
    },

    /// The DMA buffer lies outside of what the device can address.
    #[error("DMA buffer at {bus_address:?}+{length:#x} is not addressable by the device")]
    AddressingLimitExceeded {
        /// Where the buffer was placed.
        bus_address: BusAddress,
        /// The size of the buffer.
        length: u64,
    },

    /// A DMA buffer of zero bytes was requested.
    #[error("DMA buffers must not be empty")]
    InvalidLength,

    /// An interrupt handler is already registered.
    #[error("An interrupt handler is already registered")]
    HandlerAlreadyRegistered,

    /// No interrupt handler is registered.
    #[error("No interrupt handler is registered")]
    HandlerNotRegistered,

    /// The interrupt subsystem refused the registration.
    #[error("Interrupt registration failed")]
    InterruptUnavailable(#[source] PlatformError),

    /// The handle was detached.
    #[error("The device handle was detached")]
    HandleInvalidated,

    /// The device is already attached to this manager.
    #[error("{0} is already attached")]
    AlreadyAttached(PciAddress),

    /// The bus subsystem failed to enable the device.
    #[error("Failed to enable {address}")]
    EnableFailed {
        /// The device.
        address: PciAddress,
        /// What the bus subsystem reported.
        #[source]
        source: PlatformError,
    },

    /// An access does not fit into the BAR or DMA buffer.
    #[error("Access at {offset:#x}+{length:#x} is out of bounds")]
    OutOfBounds {
        /// The offset of the access.
        offset: u64,
        /// The length of the access in bytes.
        length: u64,
    },

    /// A register access is not naturally aligned.
    #[error("Register access {0} is misaligned")]
    MisalignedRequest(Request),
}

impl From<InvalidBarIndex> for ResourceError {
    fn from(e: InvalidBarIndex) -> Self {
        Self::InvalidIndex(e.0)
    }
}

/// The lifecycle state of a [`DeviceHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Resources can be acquired and released.
    Attached,

    /// All resources are being released.
    Detaching,

    /// All resources are released and the handle is unusable.
    Invalidated,
}

/// The parameters of [`DeviceResourceManager::attach`].
#[derive(Debug, Clone)]
pub struct AttachRequest {
    address: PciAddress,
    node: Option<Weak<dyn DeviceNode>>,
    bars: u32,
    dma_buffer_size: u64,
}

impl AttachRequest {
    /// Attach the device at `address` without mapping anything.
    #[must_use]
    pub const fn new(address: PciAddress) -> Self {
        Self {
            address,
            node: None,
            bars: 0,
            dma_buffer_size: 0,
        }
    }

    /// Associate the handle with a node in the device model.
    #[must_use]
    pub fn node(mut self, node: &Arc<dyn DeviceNode>) -> Self {
        self.node = Some(Arc::downgrade(node));
        self
    }

    /// Map the BARs selected by `mask` during attach. Bit `n` selects BAR `n`.
    #[must_use]
    pub const fn bars(mut self, mask: u32) -> Self {
        self.bars = mask;
        self
    }

    /// Allocate a DMA buffer of `size` bytes during attach. Zero means no buffer.
    #[must_use]
    pub const fn dma_buffer_size(mut self, size: u64) -> Self {
        self.dma_buffer_size = size;
        self
    }
}

/// The set of devices a manager has attached.
#[derive(Debug, Default)]
struct Registry {
    attached: Mutex<BTreeSet<PciAddress>>,
}

impl Registry {
    fn attached(&self) -> MutexGuard<'_, BTreeSet<PciAddress>> {
        self.attached.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn claim(&self, address: PciAddress) -> Result<(), ResourceError> {
        self.attached()
            .insert(address)
            .then_some(())
            .ok_or(ResourceError::AlreadyAttached(address))
    }

    fn release(&self, address: PciAddress) {
        if !self.attached().remove(&address) {
            warn!("{address} was not registered as attached");
        }
    }
}

/// Claims devices and hands out [`DeviceHandle`]s for them.
#[derive(Debug)]
pub struct DeviceResourceManager {
    platform: Platform,
    registry: Arc<Registry>,
}

impl DeviceResourceManager {
    /// Create a manager for devices on the given platform.
    #[must_use]
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            registry: Arc::default(),
        }
    }

    /// Attach a device.
    ///
    /// The device is enabled, the requested BARs are mapped in ascending order and the DMA buffer
    /// is allocated. If any step fails, everything done so far is undone in reverse order and the
    /// error is returned.
    pub fn attach(&self, request: AttachRequest) -> Result<DeviceHandle, ResourceError> {
        let address = request.address;
        let bars = BarMask::from_bits(request.bars)?;

        self.registry.claim(address)?;

        if let Err(source) = self.platform.bus.enable(address) {
            self.registry.release(address);
            return Err(ResourceError::EnableFailed { address, source });
        }

        let handle = DeviceHandle {
            address,
            node: request.node,
            platform: self.platform.clone(),
            registry: self.registry.clone(),
            interrupts: InterruptContext::new(),
            resources: Mutex::new(Resources::new()),
        };

        if let Err(e) = handle.acquire_initial(bars, request.dma_buffer_size) {
            warn!("{address}: attach failed, rolling back: {e}");
            handle.detach();
            return Err(e);
        }

        info!(
            "{address}: attached ({} BARs mapped, {} byte DMA buffer)",
            bars.iter().count(),
            request.dma_buffer_size
        );

        Ok(handle)
    }

    /// Whether the device at `address` is attached.
    #[must_use]
    pub fn is_attached(&self, address: PciAddress) -> bool {
        self.registry.attached().contains(&address)
    }

    /// The number of attached devices.
    #[must_use]
    pub fn attached_count(&self) -> usize {
        self.registry.attached().len()
    }
}

/// The structural state of a handle, protected by the handle's mutex.
#[derive(Debug)]
struct Resources {
    state: HandleState,
    bars: [BarSlot; MAX_BARS],

    /// Mapped BARs in the order they were mapped.
    map_order: Vec<BarIndex>,

    dma: Option<DmaBuffer>,
    irq_token: Option<InterruptToken>,
}

impl Resources {
    fn new() -> Self {
        Self {
            state: HandleState::Attached,
            bars: [BarSlot::Unmapped; MAX_BARS],
            map_order: Vec::with_capacity(MAX_BARS),
            dma: None,
            irq_token: None,
        }
    }

    fn ensure_attached(&self) -> Result<(), ResourceError> {
        match self.state {
            HandleState::Attached => Ok(()),
            HandleState::Detaching | HandleState::Invalidated => {
                Err(ResourceError::HandleInvalidated)
            }
        }
    }

    fn mapping(&self, index: BarIndex) -> Result<BarMapping, ResourceError> {
        self.bars[index.as_usize()]
            .mapping()
            .ok_or(ResourceError::NotMapped(index))
    }
}

/// The resources of one attached device.
pub struct DeviceHandle {
    address: PciAddress,
    node: Option<Weak<dyn DeviceNode>>,
    platform: Platform,
    registry: Arc<Registry>,
    interrupts: Arc<InterruptContext>,
    resources: Mutex<Resources>,
}

impl Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("address", &self.address)
            .field("node", &self.node_name())
            .field("interrupts", &self.interrupts)
            .field("resources", &*self.resources())
            .finish_non_exhaustive()
    }
}

impl DeviceHandle {
    fn resources(&self) -> MutexGuard<'_, Resources> {
        // Resources are only mutated in short sections that do not call user code, so a poisoned
        // lock still holds consistent state. Detach in particular has to work in any case.
        self.resources.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Map the BARs and allocate the DMA buffer requested at attach time.
    fn acquire_initial(&self, bars: BarMask, dma_buffer_size: u64) -> Result<(), ResourceError> {
        let mut res = self.resources();

        for index in bars.iter() {
            self.map_locked(&mut res, index)?;
        }

        if dma_buffer_size > 0 {
            self.allocate_locked(&mut res, dma_buffer_size)?;
        }

        Ok(())
    }

    /// The address of the device.
    #[must_use]
    pub const fn address(&self) -> PciAddress {
        self.address
    }

    /// The name of the device model node, if it is still alive.
    #[must_use]
    pub fn node_name(&self) -> Option<String> {
        self.node
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|node| node.name())
    }

    /// The lifecycle state of the handle.
    #[must_use]
    pub fn state(&self) -> HandleState {
        self.resources().state
    }

    /// The mapping of BAR `index`, if it is mapped.
    #[must_use]
    pub fn bar(&self, index: usize) -> Option<BarMapping> {
        let index = BarIndex::try_from(index).ok()?;
        self.resources().bars[index.as_usize()].mapping()
    }

    /// The set of mapped BARs.
    #[must_use]
    pub fn mapped_bars(&self) -> BarMask {
        let res = self.resources();

        BarIndex::all()
            .filter(|index| res.bars[index.as_usize()].is_mapped())
            .collect()
    }

    /// Map BAR `index` and return the mapping.
    pub fn map_bar(&self, index: usize) -> Result<BarMapping, ResourceError> {
        let index = BarIndex::try_from(index)?;
        let mut res = self.resources();

        res.ensure_attached()?;
        self.map_locked(&mut res, index)
    }

    fn map_locked(
        &self,
        res: &mut Resources,
        index: BarIndex,
    ) -> Result<BarMapping, ResourceError> {
        if res.bars[index.as_usize()].is_mapped() {
            return Err(ResourceError::AlreadyMapped(index));
        }

        let bus = &self.platform.bus;
        let info = bus
            .region_info(self.address, index)
            .map_err(|source| ResourceError::MappingFailed { index, source })?;

        if !info.is_mappable() {
            return Err(ResourceError::RegionUnavailable(index));
        }

        let address = bus
            .map_region(self.address, index)
            .map_err(|e| match e {
                PlatformError::RegionUnavailable { .. } => ResourceError::RegionUnavailable(index),
                source => ResourceError::MappingFailed { index, source },
            })?;

        let mapping = BarMapping {
            address,
            length: info.length,
        };

        res.bars[index.as_usize()] = BarSlot::Mapped(mapping);
        res.map_order.push(index);

        debug!(
            "{}: mapped {index} ({:#x} bytes at physical {:#x})",
            self.address, info.length, info.physical_base
        );
        Ok(mapping)
    }

    /// Unmap BAR `index`.
    pub fn unmap_bar(&self, index: usize) -> Result<(), ResourceError> {
        let index = BarIndex::try_from(index)?;
        let mut res = self.resources();

        res.ensure_attached()?;
        let mapping = res.mapping(index)?;
        self.unmap_locked(&mut res, index, mapping);

        Ok(())
    }

    fn unmap_locked(&self, res: &mut Resources, index: BarIndex, mapping: BarMapping) {
        self.platform
            .bus
            .unmap_region(self.address, index, mapping.address);

        res.bars[index.as_usize()] = BarSlot::Unmapped;
        res.map_order.retain(|&mapped| mapped != index);

        debug!("{}: unmapped {index}", self.address);
    }

    /// Validate a register access and return the pointer to the register.
    fn register_ptr(
        &self,
        res: &Resources,
        index: usize,
        req: Request,
    ) -> Result<*mut u8, ResourceError> {
        let index = BarIndex::try_from(index)?;

        res.ensure_attached()?;
        let mapping = res.mapping(index)?;

        let out_of_bounds = || ResourceError::OutOfBounds {
            offset: req.addr,
            length: req.size.into(),
        };
        let range: Range<u64> = req.try_into().map_err(|_| out_of_bounds())?;

        if !(0..mapping.length).contains_interval(&range) {
            return Err(out_of_bounds());
        }

        if !req.is_aligned() {
            return Err(ResourceError::MisalignedRequest(req));
        }

        // The range check above makes sure the offset fits into the mapping.
        Ok(mapping.address.as_ptr().wrapping_add(req.addr as usize))
    }

    /// Read a register in BAR `index`.
    pub fn read_bar(&self, index: usize, req: Request) -> Result<u64, ResourceError> {
        let res = self.resources();
        let ptr = self.register_ptr(&res, index, req)?;

        // SAFETY: The BusSubsystem contract keeps the mapping valid until we unmap it, which
        // requires the lock we are holding. The pointer is in bounds and naturally aligned.
        let value = unsafe {
            match req.size {
                RequestSize::Size1 => u64::from(std::ptr::read_volatile(ptr)),
                RequestSize::Size2 => u64::from(std::ptr::read_volatile(ptr as *const u16)),
                RequestSize::Size4 => u64::from(std::ptr::read_volatile(ptr as *const u32)),
                RequestSize::Size8 => std::ptr::read_volatile(ptr as *const u64),
            }
        };

        Ok(value)
    }

    /// Write a register in BAR `index`. Only the low bytes of `value` that fit the request size
    /// are written.
    pub fn write_bar(&self, index: usize, req: Request, value: u64) -> Result<(), ResourceError> {
        let res = self.resources();
        let ptr = self.register_ptr(&res, index, req)?;

        // SAFETY: See read_bar.
        unsafe {
            match req.size {
                RequestSize::Size1 => std::ptr::write_volatile(ptr, value as u8),
                RequestSize::Size2 => std::ptr::write_volatile(ptr as *mut u16, value as u16),
                RequestSize::Size4 => std::ptr::write_volatile(ptr as *mut u32, value as u32),
                RequestSize::Size8 => std::ptr::write_volatile(ptr as *mut u64, value),
            }
        }

        Ok(())
    }

    /// The DMA buffer, if one is allocated.
    #[must_use]
    pub fn dma_buffer(&self) -> Option<DmaBufferInfo> {
        self.resources().dma.as_ref().map(DmaBuffer::info)
    }

    /// Allocate the DMA buffer.
    pub fn allocate_dma_buffer(&self, length: u64) -> Result<DmaBufferInfo, ResourceError> {
        let mut res = self.resources();

        res.ensure_attached()?;
        self.allocate_locked(&mut res, length)
    }

    fn allocate_locked(
        &self,
        res: &mut Resources,
        length: u64,
    ) -> Result<DmaBufferInfo, ResourceError> {
        if res.dma.is_some() {
            return Err(ResourceError::AlreadyAllocated);
        }

        if length == 0 {
            return Err(ResourceError::InvalidLength);
        }

        let (cpu_address, bus_address) = self
            .platform
            .dma
            .allocate_coherent(self.address, length)
            .map_err(|e| {
                warn!("{}: coherent allocation failed: {e}", self.address);
                ResourceError::OutOfMemory { requested: length }
            })?;

        if !self
            .platform
            .bus
            .dma_mask(self.address)
            .reaches(bus_address, length)
        {
            self.platform
                .dma
                .free_coherent(self.address, cpu_address, bus_address, length);

            return Err(ResourceError::AddressingLimitExceeded {
                bus_address,
                length,
            });
        }

        let buffer = DmaBuffer::new(cpu_address, bus_address, length);
        let info = buffer.info();

        res.dma = Some(buffer);

        debug!(
            "{}: allocated {length:#x} byte DMA buffer at bus address {:#x}",
            self.address, bus_address.0
        );
        Ok(info)
    }

    /// Free the DMA buffer.
    pub fn free_dma_buffer(&self) -> Result<(), ResourceError> {
        let mut res = self.resources();

        res.ensure_attached()?;
        let buffer = res.dma.take().ok_or(ResourceError::NotAllocated)?;
        self.free_buffer(buffer);

        Ok(())
    }

    fn free_buffer(&self, buffer: DmaBuffer) {
        let (cpu_address, bus_address, length) = buffer.into_parts();

        self.platform
            .dma
            .free_coherent(self.address, cpu_address, bus_address, length);

        debug!("{}: freed DMA buffer", self.address);
    }

    /// Copy `data` into the DMA buffer at `offset`.
    pub fn write_dma(&self, offset: u64, data: &[u8]) -> Result<(), ResourceError> {
        let res = self.resources();

        res.ensure_attached()?;
        let buffer = res.dma.as_ref().ok_or(ResourceError::NotAllocated)?;
        let range = buffer
            .checked_range(offset, data.len())
            .ok_or(ResourceError::OutOfBounds {
                offset,
                length: data.len() as u64,
            })?;

        buffer.write(range, data);
        Ok(())
    }

    /// Fill `data` from the DMA buffer at `offset`.
    pub fn read_dma(&self, offset: u64, data: &mut [u8]) -> Result<(), ResourceError> {
        let res = self.resources();

        res.ensure_attached()?;
        let buffer = res.dma.as_ref().ok_or(ResourceError::NotAllocated)?;
        let range = buffer
            .checked_range(offset, data.len())
            .ok_or(ResourceError::OutOfBounds {
                offset,
                length: data.len() as u64,
            })?;

        buffer.read(range, data);
        Ok(())
    }

    /// Register the handler for device interrupts.
    ///
    /// The handler runs on the interrupt delivery context and must not block.
    pub fn register_interrupt_handler(
        &self,
        handler: impl InterruptHandler,
    ) -> Result<(), ResourceError> {
        let mut res = self.resources();

        res.ensure_attached()?;
        if res.irq_token.is_some() {
            return Err(ResourceError::HandlerAlreadyRegistered);
        }

        // Install the handler first, so the first dispatched interrupt finds it.
        self.interrupts.install(Box::new(handler));

        let interrupts = self.interrupts.clone();
        let dispatch: DispatchFn = Arc::new(move || interrupts.service());

        match self
            .platform
            .interrupts
            .register_handler(self.address, dispatch)
        {
            Ok(token) => {
                res.irq_token = Some(token);
                debug!("{}: interrupt handler registered", self.address);
                Ok(())
            }
            Err(e) => {
                self.interrupts.clear();
                Err(ResourceError::InterruptUnavailable(e))
            }
        }
    }

    /// Unregister the interrupt handler.
    pub fn unregister_interrupt_handler(&self) -> Result<(), ResourceError> {
        let mut res = self.resources();

        res.ensure_attached()?;
        let token = res
            .irq_token
            .take()
            .ok_or(ResourceError::HandlerNotRegistered)?;

        self.platform.interrupts.unregister_handler(token);
        self.interrupts.clear();

        debug!("{}: interrupt handler unregistered", self.address);
        Ok(())
    }

    /// Whether an interrupt handler is registered.
    #[must_use]
    pub fn has_interrupt_handler(&self) -> bool {
        self.resources().irq_token.is_some()
    }

    /// Count an interrupt and run the registered handler.
    ///
    /// This is what the interrupt subsystem's dispatch calls. It never blocks.
    pub fn service_interrupt(&self) {
        self.interrupts.service();
    }

    /// The number of interrupts serviced so far. Wraps around on overflow.
    ///
    /// This does not take the handle lock.
    #[must_use]
    pub fn interrupt_count(&self) -> u32 {
        self.interrupts.count()
    }

    /// Release all resources, disable the device and invalidate the handle.
    ///
    /// Detaching cannot fail. Detaching an invalidated handle does nothing.
    pub fn detach(&self) {
        let mut res = self.resources();

        if res.state != HandleState::Attached {
            return;
        }
        res.state = HandleState::Detaching;

        if let Some(token) = res.irq_token.take() {
            self.platform.interrupts.unregister_handler(token);
        }
        self.interrupts.clear();

        if let Some(buffer) = res.dma.take() {
            self.free_buffer(buffer);
        }

        while let Some(index) = res.map_order.last().copied() {
            match res.bars[index.as_usize()].mapping() {
                Some(mapping) => self.unmap_locked(&mut res, index, mapping),
                None => {
                    warn!("{}: {index} recorded as mapped, but slot is empty", self.address);
                    res.map_order.pop();
                }
            }
        }

        // Every mapping is recorded in the map order, so this only catches bookkeeping bugs.
        for index in BarIndex::all().rev() {
            if let Some(mapping) = res.bars[index.as_usize()].mapping() {
                warn!("{}: {index} was mapped without being recorded", self.address);
                self.unmap_locked(&mut res, index, mapping);
            }
        }

        self.platform.bus.disable(self.address);

        res.state = HandleState::Invalidated;
        drop(res);

        self.registry.release(self.address);
        info!("{}: detached", self.address);
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        if self.state() == HandleState::Attached {
            warn!("{}: handle dropped while attached", self.address);
            self.detach();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{
        dma::DmaMask,
        sim::{
            self,
            bus::{SimulatedBar, SimulatedBus},
            dma::CoherentPool,
            irq::SoftInterruptController,
        },
    };
    use crate::device::platform::InterruptSubsystem;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    const POOL_BUS_BASE: u64 = 0x8000_0000;

    struct TestPlatform {
        dev: PciAddress,
        bus: Arc<SimulatedBus>,
        pool: Arc<CoherentPool>,
        irq: Arc<SoftInterruptController>,
        manager: DeviceResourceManager,
    }

    impl TestPlatform {
        /// BAR0 0x1000, BAR1 0x2000, BAR2 0x4000 prefetchable, BAR3 unused, BAR4 port I/O,
        /// BAR5 0x1000.
        fn new() -> Self {
            Self::with_pool(CoherentPool::new(0x10_0000, 0x1000, POOL_BUS_BASE).unwrap())
        }

        fn with_pool(pool: CoherentPool) -> Self {
            let dev = PciAddress::new(0, 3, 0);
            let bus = Arc::new(SimulatedBus::new());
            bus.add_device(
                dev,
                [
                    (0, SimulatedBar::memory(0x1000)),
                    (1, SimulatedBar::memory(0x2000)),
                    (2, SimulatedBar::prefetchable(0x4000)),
                    (4, SimulatedBar::port_io(0x20)),
                    (5, SimulatedBar::memory(0x1000)),
                ],
            );

            let pool = Arc::new(pool);
            let irq = Arc::new(SoftInterruptController::new_exclusive());
            let manager =
                DeviceResourceManager::new(sim::platform(bus.clone(), pool.clone(), irq.clone()));

            Self {
                dev,
                bus,
                pool,
                irq,
                manager,
            }
        }

        fn attach(&self, bars: u32, dma: u64) -> Result<DeviceHandle, ResourceError> {
            self.manager
                .attach(AttachRequest::new(self.dev).bars(bars).dma_buffer_size(dma))
        }

        /// Check that nothing is held for the device anymore.
        fn assert_released(&self) {
            assert_eq!(self.bus.live_mappings(self.dev), 0);
            assert_eq!(self.pool.live_allocations_of(self.dev), 0);
            assert_eq!(self.irq.registrations(self.dev), 0);
            assert!(!self.bus.is_enabled(self.dev));
            assert_eq!(self.bus.disabled_while_mapped(self.dev), 0);
            assert!(!self.manager.is_attached(self.dev));
        }
    }

    /// The BARs of the test device that can be mapped.
    const MAPPABLE: [usize; 4] = [0, 1, 2, 5];

    #[test]
    fn attach_maps_bars_and_allocates_buffer() -> Result<(), ResourceError> {
        let p = TestPlatform::new();
        let handle = p.attach(0b000011, 4096)?;

        assert_eq!(handle.state(), HandleState::Attached);
        assert_eq!(handle.bar(0).map(|m| m.length), Some(0x1000));
        assert_eq!(handle.bar(1).map(|m| m.length), Some(0x2000));
        assert_eq!(handle.mapped_bars(), BarMask::from_bits(0b11)?);
        assert_eq!(handle.dma_buffer().map(|b| b.length), Some(4096));
        assert_eq!(handle.interrupt_count(), 0);
        assert!(!handle.has_interrupt_handler());
        assert!(p.bus.is_enabled(p.dev));

        assert!(matches!(
            handle.map_bar(1),
            Err(ResourceError::AlreadyMapped(i)) if usize::from(i) == 1
        ));

        handle.detach();

        assert!(BarIndex::all().all(|i| handle.bar(i.as_usize()).is_none()));
        assert_eq!(handle.dma_buffer(), None);
        p.assert_released();

        Ok(())
    }

    #[test]
    fn failed_mapping_rolls_back_attach() {
        let p = TestPlatform::new();
        let all_mappable: u32 = MAPPABLE.iter().map(|&i| 1u32 << i).sum();

        for n in 1..=MAPPABLE.len() as u64 {
            p.bus.fail_nth_map(n);

            let result = p.attach(all_mappable, 4096);

            assert!(
                matches!(result, Err(ResourceError::MappingFailed { .. })),
                "failure of map call {n} was not reported"
            );
            p.assert_released();
        }

        // Without injected failures the same request succeeds.
        let handle = p.attach(all_mappable, 4096).unwrap();
        assert_eq!(handle.mapped_bars().iter().count(), MAPPABLE.len());
    }

    #[test]
    fn failed_attach_unmaps_in_reverse_order_before_disabling() {
        let p = TestPlatform::new();

        for n in 1..=MAPPABLE.len() {
            let history_before = p.bus.unmap_history(p.dev).len();
            p.bus.fail_nth_map(n as u64);

            let result = p.attach(0b10_0111, 0);

            assert!(matches!(
                result,
                Err(ResourceError::MappingFailed { index, .. })
                    if usize::from(index) == MAPPABLE[n - 1]
            ));

            let unmapped: Vec<usize> = p.bus.unmap_history(p.dev)[history_before..]
                .iter()
                .copied()
                .map(usize::from)
                .collect();
            let expected: Vec<usize> = MAPPABLE[..n - 1].iter().rev().copied().collect();

            assert_eq!(unmapped, expected, "rollback after failing map call {n}");
            p.assert_released();
        }
    }

    #[test]
    fn failed_dma_allocation_rolls_back_attach() {
        let p = TestPlatform::with_pool(CoherentPool::new(0x2000, 0x1000, POOL_BUS_BASE).unwrap());

        assert!(matches!(
            p.attach(0b11, 0x4000),
            Err(ResourceError::OutOfMemory { requested: 0x4000 })
        ));
        p.assert_released();
    }

    #[test]
    fn unmappable_bars_fail_attach() {
        let p = TestPlatform::new();

        for index in [3, 4] {
            assert!(matches!(
                p.attach(0b1 | (1 << index), 0),
                Err(ResourceError::RegionUnavailable(i)) if usize::from(i) == index
            ));
            p.assert_released();
        }
    }

    #[test]
    fn masks_with_nonexistent_bars_are_rejected() {
        let p = TestPlatform::new();

        assert!(matches!(
            p.attach(1 << 6, 0),
            Err(ResourceError::InvalidIndex(6))
        ));
        p.assert_released();
    }

    #[test]
    fn failed_enable_is_reported() {
        let p = TestPlatform::new();
        p.bus.fail_enable(true);

        assert!(matches!(
            p.attach(0b1, 0),
            Err(ResourceError::EnableFailed { .. })
        ));
        p.assert_released();
    }

    #[test]
    fn devices_cannot_be_attached_twice() -> Result<(), ResourceError> {
        let p = TestPlatform::new();
        let handle = p.attach(0b1, 0)?;

        assert!(matches!(
            p.attach(0b1, 0),
            Err(ResourceError::AlreadyAttached(a)) if a == p.dev
        ));
        assert_eq!(p.manager.attached_count(), 1);

        // The failed attach must not have touched the existing handle.
        assert!(handle.bar(0).is_some());
        assert!(p.bus.is_enabled(p.dev));

        handle.detach();
        let again = p.attach(0b1, 0)?;
        assert!(again.bar(0).is_some());

        Ok(())
    }

    #[test]
    fn unknown_devices_fail_to_attach() {
        let p = TestPlatform::new();

        assert!(matches!(
            p.manager.attach(AttachRequest::new(PciAddress::new(1, 0, 0))),
            Err(ResourceError::EnableFailed { .. })
        ));
        assert_eq!(p.manager.attached_count(), 0);
    }

    #[test]
    fn map_bar_reports_errors() -> Result<(), ResourceError> {
        let p = TestPlatform::new();
        let handle = p.attach(0, 0)?;

        assert!(matches!(handle.map_bar(6), Err(ResourceError::InvalidIndex(6))));
        assert!(matches!(handle.unmap_bar(7), Err(ResourceError::InvalidIndex(7))));
        assert!(matches!(handle.map_bar(3), Err(ResourceError::RegionUnavailable(_))));
        assert!(matches!(handle.map_bar(4), Err(ResourceError::RegionUnavailable(_))));
        assert!(matches!(handle.unmap_bar(0), Err(ResourceError::NotMapped(_))));

        p.bus.fail_nth_map(1);
        assert!(matches!(
            handle.map_bar(0),
            Err(ResourceError::MappingFailed {
                source: PlatformError::OutOfAddressSpace,
                ..
            })
        ));
        assert_eq!(handle.bar(0), None);

        let mapping = handle.map_bar(0)?;
        assert_eq!(handle.bar(0), Some(mapping));

        Ok(())
    }

    #[test]
    fn detach_unmaps_in_reverse_mapping_order() -> Result<(), ResourceError> {
        let p = TestPlatform::new();
        let handle = p.attach(0, 0)?;

        handle.map_bar(5)?;
        handle.map_bar(0)?;
        handle.map_bar(2)?;
        handle.unmap_bar(0)?;
        handle.map_bar(1)?;

        assert_eq!(
            handle.resources().map_order.iter().map(|i| i.as_usize()).collect::<Vec<_>>(),
            vec![5, 2, 1]
        );

        handle.detach();
        p.assert_released();

        let unmapped: Vec<usize> = p
            .bus
            .unmap_history(p.dev)
            .into_iter()
            .map(usize::from)
            .collect();
        assert_eq!(unmapped, vec![0, 1, 2, 5]);

        Ok(())
    }

    #[test]
    fn detached_handles_reject_everything() -> Result<(), ResourceError> {
        let p = TestPlatform::new();
        let handle = p.attach(0b111, 0x1000)?;
        handle.register_interrupt_handler(|_: u32| {})?;

        handle.detach();
        p.assert_released();
        assert_eq!(handle.state(), HandleState::Invalidated);
        assert!(!handle.has_interrupt_handler());

        let invalidated = |r: Result<(), ResourceError>| {
            assert!(matches!(r, Err(ResourceError::HandleInvalidated)), "{r:?}");
        };

        invalidated(handle.map_bar(0).map(|_| ()));
        invalidated(handle.unmap_bar(0));
        invalidated(handle.allocate_dma_buffer(0x1000).map(|_| ()));
        invalidated(handle.free_dma_buffer());
        invalidated(handle.register_interrupt_handler(|_: u32| {}));
        invalidated(handle.unregister_interrupt_handler());
        invalidated(handle.read_bar(0, Request::new(0, RequestSize::Size4)).map(|_| ()));
        invalidated(handle.write_bar(0, Request::new(0, RequestSize::Size4), 0));
        invalidated(handle.write_dma(0, &[0]));
        invalidated(handle.read_dma(0, &mut [0]));

        // A second detach is a no-op.
        handle.detach();
        p.assert_released();

        Ok(())
    }

    #[test]
    fn dropping_an_attached_handle_detaches() -> Result<(), ResourceError> {
        let p = TestPlatform::new();
        let handle = p.attach(0b11, 0x1000)?;
        handle.register_interrupt_handler(|_: u32| {})?;

        drop(handle);
        p.assert_released();

        Ok(())
    }

    #[test]
    fn dma_buffer_round_trip_restores_state() -> Result<(), ResourceError> {
        let p = TestPlatform::new();
        let handle = p.attach(0, 0)?;
        let free_before = p.pool.free_bytes();

        assert!(matches!(handle.free_dma_buffer(), Err(ResourceError::NotAllocated)));

        let info = handle.allocate_dma_buffer(0x3000)?;
        assert_eq!(info.length, 0x3000);
        assert_eq!(info.bus_address, BusAddress(POOL_BUS_BASE));
        assert_eq!(handle.dma_buffer(), Some(info));
        assert!(matches!(
            handle.allocate_dma_buffer(0x1000),
            Err(ResourceError::AlreadyAllocated)
        ));

        handle.free_dma_buffer()?;

        assert_eq!(handle.dma_buffer(), None);
        assert_eq!(p.pool.free_bytes(), free_before);
        assert_eq!(p.pool.live_allocations(), 0);

        Ok(())
    }

    #[test]
    fn empty_dma_buffers_are_rejected() -> Result<(), ResourceError> {
        let p = TestPlatform::new();
        let handle = p.attach(0, 0)?;

        assert!(matches!(
            handle.allocate_dma_buffer(0),
            Err(ResourceError::InvalidLength)
        ));
        assert_eq!(handle.dma_buffer(), None);

        Ok(())
    }

    #[test]
    fn unreachable_dma_buffers_are_released() -> Result<(), ResourceError> {
        let p = TestPlatform::with_pool(
            CoherentPool::new(0x10000, 0x1000, 0x1_0000_0000).unwrap(),
        );
        let handle = p.attach(0, 0)?;

        assert!(matches!(
            handle.allocate_dma_buffer(0x1000),
            Err(ResourceError::AddressingLimitExceeded { .. })
        ));
        assert_eq!(handle.dma_buffer(), None);
        assert_eq!(p.pool.live_allocations(), 0);

        p.bus.set_dma_mask(p.dev, DmaMask::new(64));
        handle.allocate_dma_buffer(0x1000)?;

        Ok(())
    }

    #[test]
    fn dma_buffer_contents_are_accessible() -> Result<(), ResourceError> {
        let p = TestPlatform::new();
        let handle = p.attach(0, 0x1000)?;

        handle.write_dma(0xff0, &[1, 2, 3, 4])?;

        let mut data = [0u8; 4];
        handle.read_dma(0xff0, &mut data)?;
        assert_eq!(data, [1, 2, 3, 4]);

        assert!(matches!(
            handle.write_dma(0xffe, &[1, 2, 3]),
            Err(ResourceError::OutOfBounds {
                offset: 0xffe,
                length: 3
            })
        ));

        handle.free_dma_buffer()?;
        assert!(matches!(
            handle.read_dma(0, &mut data),
            Err(ResourceError::NotAllocated)
        ));

        Ok(())
    }

    #[test]
    fn registers_are_accessible_through_mapped_bars() -> Result<(), ResourceError> {
        let p = TestPlatform::new();
        let handle = p.attach(0b1, 0)?;

        handle.write_bar(0, Request::new(0x10, RequestSize::Size8), 0xcafed00dfeedface)?;

        assert_eq!(
            handle.read_bar(0, Request::new(0x10, RequestSize::Size8))?,
            0xcafed00dfeedface
        );
        assert_eq!(
            handle.read_bar(0, Request::new(0x10, RequestSize::Size4))?,
            0xfeedface
        );
        assert_eq!(handle.read_bar(0, Request::new(0x17, RequestSize::Size1))?, 0xca);

        handle.write_bar(0, Request::new(0x12, RequestSize::Size2), 0xffff_beef)?;
        assert_eq!(
            handle.read_bar(0, Request::new(0x10, RequestSize::Size4))?,
            0xbeefface
        );

        assert!(matches!(
            handle.read_bar(0, Request::new(0xffc, RequestSize::Size8)),
            Err(ResourceError::OutOfBounds { .. })
        ));
        assert!(matches!(
            handle.read_bar(0, Request::new(0x2, RequestSize::Size4)),
            Err(ResourceError::MisalignedRequest(_))
        ));
        assert!(matches!(
            handle.read_bar(1, Request::new(0, RequestSize::Size4)),
            Err(ResourceError::NotMapped(_))
        ));

        Ok(())
    }

    #[test]
    fn interrupt_handler_registration() -> Result<(), ResourceError> {
        let p = TestPlatform::new();
        let handle = p.attach(0, 0)?;
        let last_seen = Arc::new(AtomicU32::new(0));
        let last_seen_by_handler = last_seen.clone();

        assert!(matches!(
            handle.unregister_interrupt_handler(),
            Err(ResourceError::HandlerNotRegistered)
        ));

        handle.register_interrupt_handler(move |count: u32| {
            last_seen_by_handler.store(count, Ordering::Relaxed);
        })?;
        assert!(handle.has_interrupt_handler());
        assert!(matches!(
            handle.register_interrupt_handler(|_: u32| {}),
            Err(ResourceError::HandlerAlreadyRegistered)
        ));

        assert_eq!(p.irq.raise(p.dev), 1);
        assert_eq!(p.irq.raise(p.dev), 1);
        assert_eq!(handle.interrupt_count(), 2);
        assert_eq!(last_seen.load(Ordering::Relaxed), 2);

        handle.unregister_interrupt_handler()?;
        assert_eq!(p.irq.raise(p.dev), 0);
        assert_eq!(handle.interrupt_count(), 2);

        Ok(())
    }

    #[test]
    fn refused_interrupt_registration_leaves_no_handler() -> Result<(), ResourceError> {
        let p = TestPlatform::new();
        let handle = p.attach(0, 0)?;

        // The exclusive controller only allows one registration per device.
        p.irq
            .register_handler(p.dev, Arc::new(|| {}))
            .map_err(ResourceError::InterruptUnavailable)?;

        assert!(matches!(
            handle.register_interrupt_handler(|_: u32| {}),
            Err(ResourceError::InterruptUnavailable(_))
        ));
        assert!(!handle.has_interrupt_handler());
        assert!(!handle.interrupts.has_handler());

        Ok(())
    }

    #[test]
    fn concurrent_interrupts_are_all_counted() -> Result<(), ResourceError> {
        const THREADS: u32 = 8;
        const PER_THREAD: u32 = 1000;

        let p = TestPlatform::new();
        let handle = p.attach(0b11, 0x1000)?;
        let handled = Arc::new(AtomicU32::new(0));
        let handled_by_handler = handled.clone();

        handle.register_interrupt_handler(move |_: u32| {
            handled_by_handler.fetch_add(1, Ordering::Relaxed);
        })?;

        std::thread::scope(|s| {
            for t in 0..THREADS {
                let (irq, handle, dev) = (&p.irq, &handle, p.dev);

                s.spawn(move || {
                    for _ in 0..PER_THREAD {
                        // Mix both delivery paths.
                        if t % 2 == 0 {
                            assert_eq!(irq.raise(dev), 1);
                        } else {
                            handle.service_interrupt();
                        }
                    }
                });
            }

            // Structural operations keep working while interrupts arrive.
            s.spawn(|| {
                for _ in 0..100 {
                    handle.unmap_bar(1).unwrap();
                    handle.map_bar(1).unwrap();
                }
            });
        });

        assert_eq!(handle.interrupt_count(), THREADS * PER_THREAD);
        assert_eq!(handled.load(Ordering::Relaxed), THREADS * PER_THREAD);

        Ok(())
    }

    #[derive(Debug)]
    struct NamedNode(&'static str);

    impl DeviceNode for NamedNode {
        fn name(&self) -> String {
            self.0.to_string()
        }
    }

    #[test]
    fn node_reference_does_not_keep_node_alive() -> Result<(), ResourceError> {
        let p = TestPlatform::new();
        let node: Arc<dyn DeviceNode> = Arc::new(NamedNode("edev0"));
        let handle = p.manager.attach(AttachRequest::new(p.dev).node(&node))?;

        assert_eq!(handle.node_name().as_deref(), Some("edev0"));

        drop(node);
        assert_eq!(handle.node_name(), None);

        Ok(())
    }

    #[derive(Debug, Clone, Copy)]
    enum SlotOp {
        Map(usize),
        Unmap(usize),
    }

    fn slot_op() -> impl Strategy<Value = SlotOp> {
        prop_oneof![
            prop::sample::select(MAPPABLE.to_vec()).prop_map(SlotOp::Map),
            prop::sample::select(MAPPABLE.to_vec()).prop_map(SlotOp::Unmap),
        ]
    }

    proptest! {
        #[test]
        fn slot_state_follows_map_unmap_sequences(ops in prop::collection::vec(slot_op(), 0..40)) {
            let p = TestPlatform::new();
            let handle = p.attach(0, 0).unwrap();
            let mut model = [false; MAX_BARS];

            for op in ops {
                match op {
                    SlotOp::Map(i) => {
                        let before = handle.bar(i);
                        let result = handle.map_bar(i);

                        if model[i] {
                            prop_assert!(matches!(result, Err(ResourceError::AlreadyMapped(_))));
                            prop_assert_eq!(handle.bar(i), before);
                        } else {
                            prop_assert!(result.is_ok());
                            model[i] = true;
                        }
                    }
                    SlotOp::Unmap(i) => {
                        let result = handle.unmap_bar(i);

                        if model[i] {
                            prop_assert!(result.is_ok());
                            model[i] = false;
                        } else {
                            prop_assert!(matches!(result, Err(ResourceError::NotMapped(_))));
                        }
                    }
                }

                for i in 0..MAX_BARS {
                    prop_assert_eq!(handle.bar(i).is_some(), model[i]);
                }
                prop_assert_eq!(
                    p.bus.live_mappings(p.dev),
                    model.iter().filter(|&&m| m).count()
                );
            }

            handle.detach();
            p.assert_released();
        }
    }
}
