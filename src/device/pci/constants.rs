//! # PCI Constants
//!
//! This module collects PCI related constants. Definitions are derived from the "PCI Local Bus
//! Specification" and the Linux PCI sysfs interface.

// Allow missing docs to avoid duplicating the PCI spec for all constants.
#![allow(missing_docs)]

/// The name under which the resource manager reports itself.
pub const DRIVER_NAME: &str = "edev";

/// The version of the resource manager.
pub const DRIVER_VERSION: &str = "0.1";

/// Constants related to the configuration space.
pub mod config_space {

    /// The maximum number of Base Address Registers (BARs) per device.
    pub const MAX_BARS: usize = 6;

    /// The offset of the 16-bit command register.
    pub const COMMAND_OFFSET: u64 = 0x04;

    /// Command Register Constants.
    pub mod command {
        pub const MEMORY_SPACE: u16 = 1 << 1;
        pub const BUS_MASTER: u16 = 1 << 2;

        /// The bits a device needs before it may decode MMIO and perform DMA.
        pub const ENABLE_BITS: u16 = MEMORY_SPACE | BUS_MASTER;
    }
}

/// Resource flags as reported in the sysfs `resource` file.
///
/// See `include/linux/ioport.h`.
pub mod ioresource {
    pub const IO: u64 = 0x0000_0100;
    pub const MEM: u64 = 0x0000_0200;
    pub const PREFETCH: u64 = 0x0000_2000;
    pub const MEM_64: u64 = 0x0010_0000;
}

/// DMA addressing constants.
pub mod dma {
    /// Devices that do not report otherwise can address the low 4 GiB.
    pub const DEFAULT_MASK_BITS: u32 = 32;
}
