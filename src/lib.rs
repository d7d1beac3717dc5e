//! # edev
//!
//! Resource management for a single PCI device instance: BAR mappings, one
//! DMA-coherent buffer and the interrupt line. See
//! [`device::resources::DeviceResourceManager`] for a starting point.

pub mod device;
