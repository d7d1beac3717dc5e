//! # Base Address Registers
//!
//! Types describing the (up to six) BARs of a PCI function and the state of their mappings.

use std::fmt;

use crate::device::{pci::constants::config_space::MAX_BARS, platform::VirtualAddress};

/// The index of a BAR, guaranteed to be in `0..MAX_BARS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BarIndex(u8);

/// A BAR index outside of `0..MAX_BARS` was used.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("BAR index {0} is out of range")]
pub struct InvalidBarIndex(pub usize);

impl BarIndex {
    /// Iterate over all valid BAR indices in ascending order.
    pub fn all() -> impl DoubleEndedIterator<Item = Self> {
        (0..MAX_BARS as u8).map(Self)
    }

    /// The index as array index.
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl TryFrom<usize> for BarIndex {
    type Error = InvalidBarIndex;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        if value < MAX_BARS {
            // The check above makes this cast lossless.
            Ok(Self(value as u8))
        } else {
            Err(InvalidBarIndex(value))
        }
    }
}

impl From<BarIndex> for usize {
    fn from(index: BarIndex) -> Self {
        index.as_usize()
    }
}

impl fmt::Display for BarIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BAR{}", self.0)
    }
}

/// A selection of BARs. Bit `n` selects BAR `n`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct BarMask(u8);

impl BarMask {
    /// The mask that selects no BAR.
    pub const NONE: Self = Self(0);

    /// The mask that selects every BAR.
    pub const ALL: Self = Self((1 << MAX_BARS) - 1);

    /// Create a mask from raw bits.
    ///
    /// Bits for BARs beyond the sixth are rejected.
    pub fn from_bits(bits: u32) -> Result<Self, InvalidBarIndex> {
        if let Some(bad) = (MAX_BARS..32).find(|&bit| bits & (1 << bit) != 0) {
            return Err(InvalidBarIndex(bad));
        }

        // No bits above MAX_BARS are set, so this fits.
        Ok(Self(bits as u8))
    }

    /// Return a copy of the mask with `index` selected.
    #[must_use]
    pub const fn with(self, index: BarIndex) -> Self {
        Self(self.0 | (1 << index.0))
    }

    /// Whether `index` is selected.
    #[must_use]
    pub const fn contains(self, index: BarIndex) -> bool {
        self.0 & (1 << index.0) != 0
    }

    /// Iterate over the selected BARs in ascending order.
    pub fn iter(self) -> impl DoubleEndedIterator<Item = BarIndex> {
        BarIndex::all().filter(move |&index| self.contains(index))
    }
}

impl FromIterator<BarIndex> for BarMask {
    fn from_iter<T: IntoIterator<Item = BarIndex>>(iter: T) -> Self {
        iter.into_iter().fold(Self::NONE, Self::with)
    }
}

/// The address space a BAR decodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// The BAR is not implemented by the device.
    Unused,

    /// A legacy port I/O region. These cannot be memory-mapped.
    PortIo,

    /// A memory-mapped I/O region.
    Memory,
}

/// Mapping attributes of a BAR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionFlags {
    /// The address space this region decodes.
    pub kind: RegionKind,

    /// Whether reads have no side effects and the region may be mapped write-combined.
    pub prefetchable: bool,

    /// Whether this is a 64-bit memory BAR.
    pub is_64bit: bool,
}

impl RegionFlags {
    /// Flags of a non-prefetchable 32-bit memory BAR.
    pub const MEMORY: Self = Self {
        kind: RegionKind::Memory,
        prefetchable: false,
        is_64bit: false,
    };

    /// Flags of a port I/O BAR.
    pub const PORT_IO: Self = Self {
        kind: RegionKind::PortIo,
        prefetchable: false,
        is_64bit: false,
    };

    /// Flags of an unimplemented BAR.
    pub const UNUSED: Self = Self {
        kind: RegionKind::Unused,
        prefetchable: false,
        is_64bit: false,
    };
}

/// Information about a BAR as reported by the bus subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionInfo {
    /// The physical base address the BAR was assigned.
    pub physical_base: u64,

    /// The length of the region in bytes.
    pub length: u64,

    /// Mapping attributes.
    pub flags: RegionFlags,
}

impl RegionInfo {
    /// Information for an unimplemented BAR.
    pub const UNUSED: Self = Self {
        physical_base: 0,
        length: 0,
        flags: RegionFlags::UNUSED,
    };

    /// Whether this region can be mapped into the address space.
    ///
    /// Only non-empty memory BARs are mappable.
    #[must_use]
    pub fn is_mappable(&self) -> bool {
        self.flags.kind == RegionKind::Memory && self.length > 0
    }
}

/// A BAR that is mapped into the address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarMapping {
    /// Where the region is mapped.
    pub address: VirtualAddress,

    /// The length of the mapping in bytes. Always positive.
    pub length: u64,
}

/// The state of a single BAR slot of a device handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BarSlot {
    /// No mapping exists.
    #[default]
    Unmapped,

    /// The BAR is mapped.
    Mapped(BarMapping),
}

impl BarSlot {
    /// The mapping, if there is one.
    #[must_use]
    pub const fn mapping(&self) -> Option<BarMapping> {
        match self {
            Self::Unmapped => None,
            Self::Mapped(mapping) => Some(*mapping),
        }
    }

    /// Whether the slot holds a mapping.
    #[must_use]
    pub const fn is_mapped(&self) -> bool {
        matches!(self, Self::Mapped(_))
    }
}
