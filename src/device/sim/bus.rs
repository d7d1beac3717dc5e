//! # Simulated PCI Bus
//!
//! [`SimulatedBus`] knows a set of devices with configurable BARs. Mapping a BAR hands out an
//! anonymous memory mapping of the BAR's size, so register accesses through the mapping behave like
//! plain memory.

use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use memmap2::MmapMut;
use tracing::{debug, warn};

use crate::device::{
    dma::DmaMask,
    pci::{
        address::PciAddress,
        bar::{BarIndex, RegionFlags, RegionInfo, RegionKind},
        constants::config_space::{command, MAX_BARS},
    },
    platform::{BusSubsystem, PlatformError, VirtualAddress},
};

/// The physical address where we start to place BARs.
const MMIO_BASE: u64 = 0xfe00_0000;

/// The first port I/O address handed out for I/O BARs.
const PIO_BASE: u64 = 0xc000;

/// The description of a simulated BAR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulatedBar {
    /// The size of the BAR in bytes.
    pub length: u64,

    /// BAR attributes.
    pub flags: RegionFlags,
}

impl SimulatedBar {
    /// A non-prefetchable memory BAR.
    #[must_use]
    pub const fn memory(length: u64) -> Self {
        Self {
            length,
            flags: RegionFlags::MEMORY,
        }
    }

    /// A prefetchable 64-bit memory BAR.
    #[must_use]
    pub const fn prefetchable(length: u64) -> Self {
        Self {
            length,
            flags: RegionFlags {
                kind: RegionKind::Memory,
                prefetchable: true,
                is_64bit: true,
            },
        }
    }

    /// A port I/O BAR.
    #[must_use]
    pub const fn port_io(length: u64) -> Self {
        Self {
            length,
            flags: RegionFlags::PORT_IO,
        }
    }
}

#[derive(Debug)]
struct SimulatedDevice {
    regions: [RegionInfo; MAX_BARS],
    command: u16,
    dma_mask: DmaMask,
    mappings: BTreeMap<BarIndex, MmapMut>,

    /// Unmapped BARs, oldest first.
    unmapped: Vec<BarIndex>,

    /// How often the device was disabled while BARs were still mapped.
    disabled_while_mapped: usize,
}

#[derive(Debug)]
struct BusState {
    devices: BTreeMap<PciAddress, SimulatedDevice>,

    /// The next free physical address for memory BARs.
    next_mmio: u64,

    /// The next free port for I/O BARs.
    next_pio: u64,

    /// How many calls to `map_region` have been made.
    map_calls: u64,

    /// The `map_region` call (counting from 1) that will fail.
    failing_map_call: Option<u64>,

    /// Whether `enable` fails.
    fail_enable: bool,
}

impl Default for BusState {
    fn default() -> Self {
        Self {
            devices: BTreeMap::new(),
            next_mmio: MMIO_BASE,
            next_pio: PIO_BASE,
            map_calls: 0,
            failing_map_call: None,
            fail_enable: false,
        }
    }
}

/// A PCI bus with simulated devices.
#[derive(Debug, Default)]
pub struct SimulatedBus {
    state: Mutex<BusState>,
}

impl SimulatedBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a device with the given BARs. BARs that are not listed are unimplemented.
    ///
    /// # Panics
    ///
    /// Panics if the device already exists or a BAR index is out of range.
    pub fn add_device(
        &self,
        address: PciAddress,
        bars: impl IntoIterator<Item = (usize, SimulatedBar)>,
    ) {
        let mut state = self.state();
        assert!(!state.devices.contains_key(&address));

        let mut regions = [RegionInfo::UNUSED; MAX_BARS];

        for (index, bar) in bars {
            assert!(index < MAX_BARS);

            let next = match bar.flags.kind {
                RegionKind::PortIo => &mut state.next_pio,
                _ => &mut state.next_mmio,
            };

            // BARs are naturally aligned.
            let alignment = bar.length.next_power_of_two().max(1);
            let physical_base = next.next_multiple_of(alignment);
            *next = physical_base + bar.length;

            regions[index] = RegionInfo {
                physical_base,
                length: bar.length,
                flags: bar.flags,
            };
        }

        state.devices.insert(
            address,
            SimulatedDevice {
                regions,
                command: 0,
                dma_mask: DmaMask::default(),
                mappings: BTreeMap::new(),
                unmapped: Vec::new(),
                disabled_while_mapped: 0,
            },
        );
    }

    /// Limit the DMA addressing capability of a device.
    pub fn set_dma_mask(&self, address: PciAddress, mask: DmaMask) {
        if let Some(device) = self.state().devices.get_mut(&address) {
            device.dma_mask = mask;
        }
    }

    /// Make the `n`-th `map_region` call from now on fail. `n` counts from 1.
    pub fn fail_nth_map(&self, n: u64) {
        let mut state = self.state();
        state.failing_map_call = Some(state.map_calls + n);
    }

    /// Make all `enable` calls fail.
    pub fn fail_enable(&self, fail: bool) {
        self.state().fail_enable = fail;
    }

    /// The number of mappings of a device that are currently alive.
    #[must_use]
    pub fn live_mappings(&self, address: PciAddress) -> usize {
        self.state()
            .devices
            .get(&address)
            .map_or(0, |device| device.mappings.len())
    }

    /// The BARs of a device in the order they were unmapped.
    #[must_use]
    pub fn unmap_history(&self, address: PciAddress) -> Vec<BarIndex> {
        self.state()
            .devices
            .get(&address)
            .map_or_else(Vec::new, |device| device.unmapped.clone())
    }

    /// How often the device was disabled while some of its BARs were still mapped.
    #[must_use]
    pub fn disabled_while_mapped(&self, address: PciAddress) -> usize {
        self.state()
            .devices
            .get(&address)
            .map_or(0, |device| device.disabled_while_mapped)
    }

    /// The value of the device's command register.
    #[must_use]
    pub fn command(&self, address: PciAddress) -> Option<u16> {
        self.state()
            .devices
            .get(&address)
            .map(|device| device.command)
    }

    /// Whether memory decoding and bus mastering are enabled for the device.
    #[must_use]
    pub fn is_enabled(&self, address: PciAddress) -> bool {
        self.command(address)
            .is_some_and(|cmd| cmd & command::ENABLE_BITS == command::ENABLE_BITS)
    }
}

fn device_mut(
    state: &mut BusState,
    address: PciAddress,
) -> Result<&mut SimulatedDevice, PlatformError> {
    state
        .devices
        .get_mut(&address)
        .ok_or(PlatformError::NoSuchDevice { address })
}

// SAFETY: Mappings are anonymous memory mappings of the region length that we keep in
// `SimulatedDevice::mappings` until `unmap_region` is called for them.
unsafe impl BusSubsystem for SimulatedBus {
    fn enable(&self, device: PciAddress) -> Result<(), PlatformError> {
        let mut state = self.state();

        if state.fail_enable {
            return Err(PlatformError::Rejected {
                reason: format!("enabling {device} is not allowed"),
            });
        }

        device_mut(&mut state, device)?.command |= command::ENABLE_BITS;
        Ok(())
    }

    fn disable(&self, device: PciAddress) {
        match device_mut(&mut self.state(), device) {
            Ok(dev) => {
                if !dev.mappings.is_empty() {
                    warn!("Disabling {device} with {} live mappings", dev.mappings.len());
                    dev.disabled_while_mapped += 1;
                }
                dev.command &= !command::ENABLE_BITS;
            }
            Err(e) => warn!("Failed to disable {device}: {e}"),
        }
    }

    fn region_info(
        &self,
        device: PciAddress,
        index: BarIndex,
    ) -> Result<RegionInfo, PlatformError> {
        Ok(device_mut(&mut self.state(), device)?.regions[index.as_usize()])
    }

    fn map_region(
        &self,
        device: PciAddress,
        index: BarIndex,
    ) -> Result<VirtualAddress, PlatformError> {
        let mut state = self.state();

        state.map_calls += 1;
        if state.failing_map_call == Some(state.map_calls) {
            debug!("Injecting mapping failure for {index} of {device}");
            return Err(PlatformError::OutOfAddressSpace);
        }

        let dev = device_mut(&mut state, device)?;
        let region = dev.regions[index.as_usize()];

        if !region.is_mappable() || dev.mappings.contains_key(&index) {
            return Err(PlatformError::RegionUnavailable {
                address: device,
                index,
            });
        }

        let length = usize::try_from(region.length).map_err(|_| PlatformError::OutOfAddressSpace)?;
        let mmap = MmapMut::map_anon(length)?;
        let address =
            VirtualAddress::from_ptr(mmap.as_ptr()).ok_or(PlatformError::OutOfAddressSpace)?;

        dev.mappings.insert(index, mmap);
        Ok(address)
    }

    fn unmap_region(&self, device: PciAddress, index: BarIndex, address: VirtualAddress) {
        let mut state = self.state();

        let Ok(dev) = device_mut(&mut state, device) else {
            warn!("Unmapping {index} of unknown device {device}");
            return;
        };

        match dev.mappings.remove(&index) {
            Some(mmap) if VirtualAddress::from_ptr(mmap.as_ptr()) == Some(address) => {
                dev.unmapped.push(index);
            }
            Some(mmap) => {
                warn!("Unmapping {index} of {device} with wrong address {address:?}");
                dev.mappings.insert(index, mmap);
            }
            None => warn!("Unmapping {index} of {device}, which is not mapped"),
        }
    }

    fn dma_mask(&self, device: PciAddress) -> DmaMask {
        self.state()
            .devices
            .get(&device)
            .map_or_else(DmaMask::default, |dev| dev.dma_mask)
    }
}
