//! # Simulated Platform
//!
//! Implementations of the [platform capabilities](crate::device::platform) that do not need real
//! hardware. BARs and DMA memory are backed by anonymous memory mappings and interrupts are raised
//! in software. Tests use these to inject failures and to check that no resource is leaked.

pub mod bus;
pub mod dma;
pub mod irq;

use std::sync::Arc;

use crate::device::platform::Platform;

use self::{bus::SimulatedBus, dma::CoherentPool, irq::SoftInterruptController};

/// Bundle simulated subsystems into a [`Platform`].
#[must_use]
pub fn platform(
    bus: Arc<SimulatedBus>,
    pool: Arc<CoherentPool>,
    interrupts: Arc<SoftInterruptController>,
) -> Platform {
    Platform {
        bus,
        dma: pool,
        interrupts,
    }
}
