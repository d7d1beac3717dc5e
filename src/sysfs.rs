//! # Linux sysfs PCI Bus
//!
//! A [`BusSubsystem`] for real devices. Linux exposes every PCI function as a directory in
//! `/sys/bus/pci/devices`:
//!
//! - writing `1` or `0` to `enable` enables or disables the device,
//! - `config` exposes the configuration space, including the command register,
//! - `resource` lists start, end and flags of each BAR, one line per BAR,
//! - `resourceN` can be memory-mapped to access BAR `N`.

use std::{
    collections::BTreeMap,
    fs::{self, OpenOptions},
    io,
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};

use edev::device::{
    pci::{
        address::PciAddress,
        bar::{BarIndex, RegionFlags, RegionInfo, RegionKind},
        constants::{
            config_space::{command, COMMAND_OFFSET},
            ioresource,
        },
    },
    platform::{BusSubsystem, PlatformError, VirtualAddress},
};
use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, warn};

/// PCI devices as seen through sysfs.
#[derive(Debug)]
pub struct SysfsBus {
    root: PathBuf,
    mappings: Mutex<BTreeMap<(PciAddress, BarIndex), MmapMut>>,
}

impl SysfsBus {
    /// Use the device directories below `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            mappings: Mutex::default(),
        }
    }

    fn mappings(&self) -> MutexGuard<'_, BTreeMap<(PciAddress, BarIndex), MmapMut>> {
        self.mappings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn device_dir(&self, device: PciAddress) -> Result<PathBuf, PlatformError> {
        let dir = self.root.join(device.to_string());

        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(PlatformError::NoSuchDevice { address: device })
        }
    }

    fn write_enable(&self, device: PciAddress, value: &str) -> Result<(), PlatformError> {
        let path = self.device_dir(device)?.join("enable");

        fs::write(&path, value)?;
        debug!("Wrote {value} to {}", path.display());

        Ok(())
    }

    /// Read-modify-write the command register in the device's configuration space.
    fn update_command(
        &self,
        device: PciAddress,
        update: impl FnOnce(u16) -> u16,
    ) -> Result<u16, PlatformError> {
        let path = self.device_dir(device)?.join("config");
        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut raw = [0u8; 2];
        file.read_exact_at(&mut raw, COMMAND_OFFSET)?;

        let old = u16::from_le_bytes(raw);
        let new = update(old);

        if new != old {
            file.write_all_at(&new.to_le_bytes(), COMMAND_OFFSET)?;
            debug!("{device}: command register {old:#06x} -> {new:#06x}");
        }

        Ok(new)
    }
}

/// Parse one line of a sysfs `resource` file.
fn parse_resource_line(line: &str) -> Option<RegionInfo> {
    let mut fields = line
        .split_whitespace()
        .map(|field| u64::from_str_radix(field.trim_start_matches("0x"), 16));

    let start = fields.next()?.ok()?;
    let end = fields.next()?.ok()?;
    let flags = fields.next()?.ok()?;

    if end <= start {
        return Some(RegionInfo::UNUSED);
    }

    let kind = if flags & ioresource::MEM != 0 {
        RegionKind::Memory
    } else if flags & ioresource::IO != 0 {
        RegionKind::PortIo
    } else {
        return Some(RegionInfo::UNUSED);
    };

    Some(RegionInfo {
        physical_base: start,
        length: end - start + 1,
        flags: RegionFlags {
            kind,
            prefetchable: flags & ioresource::PREFETCH != 0,
            is_64bit: flags & ioresource::MEM_64 != 0,
        },
    })
}

fn invalid_data(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("Malformed resource file {}", path.display()),
    )
}

// SAFETY: Mappings of `resourceN` files have the length sysfs reports for the BAR and are kept in
// `mappings` until they are unmapped.
unsafe impl BusSubsystem for SysfsBus {
    fn enable(&self, device: PciAddress) -> Result<(), PlatformError> {
        self.write_enable(device, "1")?;

        // The enable attribute only turns on decoding. DMA needs bus mastering as well.
        self.update_command(device, |cmd| cmd | command::ENABLE_BITS)?;
        Ok(())
    }

    fn disable(&self, device: PciAddress) {
        if let Err(e) = self.update_command(device, |cmd| cmd & !command::BUS_MASTER) {
            warn!("Failed to clear bus mastering of {device}: {e}");
        }

        if let Err(e) = self.write_enable(device, "0") {
            warn!("Failed to disable {device}: {e}");
        }
    }

    fn region_info(
        &self,
        device: PciAddress,
        index: BarIndex,
    ) -> Result<RegionInfo, PlatformError> {
        let path = self.device_dir(device)?.join("resource");
        let contents = fs::read_to_string(&path)?;

        match contents.lines().nth(index.as_usize()) {
            Some(line) => parse_resource_line(line).ok_or_else(|| invalid_data(&path).into()),
            None => Ok(RegionInfo::UNUSED),
        }
    }

    fn map_region(
        &self,
        device: PciAddress,
        index: BarIndex,
    ) -> Result<VirtualAddress, PlatformError> {
        let info = self.region_info(device, index)?;
        let unavailable = PlatformError::RegionUnavailable {
            address: device,
            index,
        };

        if !info.is_mappable() {
            return Err(unavailable);
        }

        let mut mappings = self.mappings();
        if mappings.contains_key(&(device, index)) {
            return Err(unavailable);
        }

        let path = self
            .device_dir(device)?
            .join(format!("resource{}", index.as_usize()));
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let length = usize::try_from(info.length).map_err(|_| PlatformError::OutOfAddressSpace)?;

        // SAFETY: The mapping is device memory. Nobody else in this process maps it, because we
        // refuse to map a BAR twice.
        let mmap = unsafe { MmapOptions::new().len(length).map_mut(&file)? };
        let address =
            VirtualAddress::from_ptr(mmap.as_ptr()).ok_or(PlatformError::OutOfAddressSpace)?;

        mappings.insert((device, index), mmap);
        debug!("Mapped {} at {address:?}", path.display());

        Ok(address)
    }

    fn unmap_region(&self, device: PciAddress, index: BarIndex, address: VirtualAddress) {
        let mut mappings = self.mappings();

        match mappings.remove(&(device, index)) {
            Some(mmap) if VirtualAddress::from_ptr(mmap.as_ptr()) == Some(address) => {}
            Some(mmap) => {
                warn!("Unmapping {index} of {device} with wrong address {address:?}");
                mappings.insert((device, index), mmap);
            }
            None => warn!("Unmapping {index} of {device}, which is not mapped"),
        }
    }
}
