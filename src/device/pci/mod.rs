//! # PCI Device Description
//!
//! Types that describe a PCI function to the resource manager: its [address](address::PciAddress)
//! and its [BARs](bar). The bus itself is an external capability, see
//! [`BusSubsystem`](crate::device::platform::BusSubsystem).

pub mod address;
pub mod bar;
pub mod constants;
