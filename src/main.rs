mod cli;
mod sysfs;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Backend, Cli};
use edev::device::{
    pci::constants::{DRIVER_NAME, DRIVER_VERSION},
    platform::{DeviceNode, Platform},
    resources::{AttachRequest, DeviceResourceManager},
    sim::{
        bus::{SimulatedBar, SimulatedBus},
        dma::CoherentPool,
        irq::SoftInterruptController,
    },
};
use sysfs::SysfsBus;
use tracing::{debug, info, trace, Level};
use tracing_subscriber::FmtSubscriber;

/// The smallest DMA allocation.
const DMA_MIN_BLOCK: u64 = 4096;

/// Where devices see the DMA pool.
const DMA_BUS_BASE: u64 = 0x8000_0000;

#[derive(Debug)]
struct Node(String);

impl DeviceNode for Node {
    fn name(&self) -> String {
        self.0.clone()
    }
}

fn build_platform(args: &Cli, interrupts: Arc<SoftInterruptController>) -> Result<Platform> {
    let pool = CoherentPool::new(args.dma_pool_size, DMA_MIN_BLOCK, DMA_BUS_BASE)
        .context("Failed to create DMA pool")?;

    let platform = match args.backend {
        Backend::Sim => {
            let bus = SimulatedBus::new();
            bus.add_device(
                args.device,
                [
                    (0, SimulatedBar::memory(0x1000)),
                    (1, SimulatedBar::memory(0x2000)),
                    (2, SimulatedBar::prefetchable(0x4000)),
                    (4, SimulatedBar::port_io(0x20)),
                ],
            );

            edev::device::sim::platform(Arc::new(bus), Arc::new(pool), interrupts)
        }
        Backend::Sysfs => Platform {
            bus: Arc::new(SysfsBus::new(&args.sysfs_root)),
            dma: Arc::new(pool),
            interrupts,
        },
    };

    Ok(platform)
}

fn main() -> Result<()> {
    let args = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(match args.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        })
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global tracing subscriber")?;
    tracing_log::LogTracer::init().context("Failed to forward log records")?;

    info!("{DRIVER_NAME} {DRIVER_VERSION}");

    let irq = Arc::new(SoftInterruptController::new());
    let manager = DeviceResourceManager::new(build_platform(&args, irq.clone())?);
    let node: Arc<dyn DeviceNode> = Arc::new(Node(format!("{DRIVER_NAME}0")));

    let handle = manager
        .attach(
            AttachRequest::new(args.device)
                .node(&node)
                .bars(args.bars)
                .dma_buffer_size(args.dma_size),
        )
        .with_context(|| format!("Failed to attach {}", args.device))?;

    for index in handle.mapped_bars().iter() {
        if let Some(mapping) = handle.bar(index.as_usize()) {
            info!(
                "{index}: {:#x} bytes mapped at {:?}",
                mapping.length, mapping.address
            );
        }
    }

    if let Some(dma) = handle.dma_buffer() {
        info!(
            "DMA buffer: {:#x} bytes, bus address {:#x}",
            dma.length, dma.bus_address.0
        );
    }

    handle
        .register_interrupt_handler(|count: u32| trace!("Interrupt #{count}"))
        .context("Failed to register interrupt handler")?;

    let dispatched: usize = (0..args.interrupts).map(|_| irq.raise(args.device)).sum();
    debug!("Dispatched {dispatched} interrupts");

    info!(
        "{}: serviced {} interrupts",
        handle.node_name().unwrap_or_default(),
        handle.interrupt_count()
    );

    handle.detach();

    Ok(())
}
