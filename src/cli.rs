//! This module implements the CLI interface.
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use edev::device::pci::address::PciAddress;

/// Where device resources come from.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    /// A simulated device with memory-backed BARs.
    Sim,

    /// A real device found via the Linux sysfs PCI interface.
    Sysfs,
}

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = env!("CARGO_PKG_DESCRIPTION"),
    long_about = None
)]
pub struct Cli {
    /// Enable verbose logging. Can be specified multiple times to
    /// increase verbosity.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// The PCI address of the device in [dddd:]bb:dd.f notation.
    #[arg(long, default_value = "0000:00:03.0")]
    pub device: PciAddress,

    /// The BARs to map on attach. Bit N selects BAR N. Accepts
    /// decimal, 0x-prefixed hex and 0b-prefixed binary.
    #[arg(long, value_name = "MASK", default_value = "0x3", value_parser = parse_mask)]
    pub bars: u32,

    /// The size of the DMA buffer allocated on attach in bytes. Zero
    /// means no buffer.
    #[arg(long, value_name = "BYTES", default_value_t = 4096)]
    pub dma_size: u64,

    /// The size of the pool DMA buffers are carved from in bytes.
    /// Must be a power of two.
    #[arg(long, value_name = "BYTES", default_value_t = 4 << 20)]
    pub dma_pool_size: u64,

    /// Where devices come from.
    #[arg(long, value_enum, default_value_t = Backend::Sim)]
    pub backend: Backend,

    /// The sysfs directory containing PCI device directories. Only
    /// used with the sysfs backend.
    #[arg(long, value_name = "DIR", default_value = "/sys/bus/pci/devices")]
    pub sysfs_root: PathBuf,

    /// The number of interrupts to raise in software after attaching.
    #[arg(long, value_name = "N", default_value_t = 0)]
    pub interrupts: u32,
}

fn parse_mask(s: &str) -> Result<u32, String> {
    let parsed = if let Some(hex) = s.strip_prefix("0x") {
        u32::from_str_radix(hex, 16)
    } else if let Some(bin) = s.strip_prefix("0b") {
        u32::from_str_radix(bin, 2)
    } else {
        s.parse()
    };

    parsed.map_err(|e| format!("Invalid BAR mask {s:?}: {e}"))
}
