//! # Device Resource Code
//!
//! This module contains the PCI device resource manager and the capability
//! traits it consumes. It should never depend on Linux specific parts; those
//! live in the binary.

#![deny(missing_docs)]
#![deny(rustdoc::all)]
#![deny(clippy::must_use_candidate)]
#![deny(missing_debug_implementations)]

pub mod buddy;
pub mod bus;
pub mod dma;
pub mod interrupt;
pub mod interval;
pub mod pci;
pub mod platform;
pub mod resources;
pub mod sim;
