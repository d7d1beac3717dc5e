//! # Interrupt Servicing
//!
//! Interrupts arrive on an execution context that runs concurrently with everything else. The
//! state the interrupt path touches is therefore kept apart from the rest of a device handle in an
//! [`InterruptContext`]: an atomic counter and an atomically swappable handler. Servicing an
//! interrupt never takes a lock.

use std::{
    fmt::{self, Debug},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use arc_swap::ArcSwapOption;

/// A callback invoked for every serviced interrupt.
///
/// Handlers run on the interrupt delivery context and must return quickly. Longer work has to be
/// deferred to another thread.
pub trait InterruptHandler: Send + Sync + 'static {
    /// Handle one interrupt. `count` is the interrupt counter after it was incremented for this
    /// interrupt.
    fn handle(&self, count: u32);
}

impl<F> InterruptHandler for F
where
    F: Fn(u32) + Send + Sync + 'static,
{
    fn handle(&self, count: u32) {
        self(count)
    }
}

/// `ArcSwapOption` needs a sized type.
struct HandlerSlot(Box<dyn InterruptHandler>);

/// The part of a device handle that is shared with the interrupt path.
#[derive(Default)]
pub struct InterruptContext {
    count: AtomicU32,
    handler: ArcSwapOption<HandlerSlot>,
}

impl Debug for InterruptContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptContext")
            .field("count", &self.count())
            .field("has_handler", &self.has_handler())
            .finish()
    }
}

impl InterruptContext {
    /// Create a context with a zero counter and no handler.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Count one interrupt and run the handler, if one is installed.
    ///
    /// The counter wraps around on overflow.
    pub fn service(&self) {
        let count = self.count.fetch_add(1, Ordering::Relaxed).wrapping_add(1);

        let handler = self.handler.load();
        if let Some(slot) = &*handler {
            slot.0.handle(count);
        }
    }

    /// The number of interrupts serviced so far.
    #[must_use]
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }

    /// Whether a handler is installed.
    #[must_use]
    pub fn has_handler(&self) -> bool {
        self.handler.load().is_some()
    }

    pub(crate) fn install(&self, handler: Box<dyn InterruptHandler>) {
        self.handler.store(Some(Arc::new(HandlerSlot(handler))));
    }

    pub(crate) fn clear(&self) {
        self.handler.store(None);
    }

    #[cfg(test)]
    pub(crate) fn set_count(&self, count: u32) {
        self.count.store(count, Ordering::Relaxed);
    }
}
