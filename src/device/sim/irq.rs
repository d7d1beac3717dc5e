//! # Software Interrupt Controller
//!
//! [`SoftInterruptController`] is an [`InterruptSubsystem`] where interrupts are raised by calling
//! [`raise`](SoftInterruptController::raise). Raising does not take a lock: registrations are
//! published as an immutable snapshot that is swapped on every change.

use std::{
    fmt::{self, Debug},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use arc_swap::ArcSwap;
use tracing::{debug, warn};

use crate::device::{
    pci::address::PciAddress,
    platform::{DispatchFn, InterruptSubsystem, InterruptToken, PlatformError},
};

#[derive(Clone)]
struct Registration {
    token: InterruptToken,
    device: PciAddress,
    dispatch: DispatchFn,
}

impl Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("token", &self.token)
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

/// An interrupt controller driven by software.
#[derive(Debug, Default)]
pub struct SoftInterruptController {
    /// Serializes writers.
    registrations: Mutex<Vec<Registration>>,

    /// What `raise` looks at.
    snapshot: ArcSwap<Vec<Registration>>,

    next_token: AtomicU64,

    /// Allow only one registration per device, like a non-shared interrupt line.
    exclusive: bool,
}

impl SoftInterruptController {
    /// Create a controller that allows any number of handlers per device.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a controller that allows one handler per device.
    #[must_use]
    pub fn new_exclusive() -> Self {
        Self {
            exclusive: true,
            ..Self::default()
        }
    }

    /// Raise an interrupt for `device`. Returns how many handlers were dispatched.
    #[must_use]
    pub fn raise(&self, device: PciAddress) -> usize {
        let snapshot = self.snapshot.load();
        let mut dispatched = 0;

        for registration in snapshot.iter().filter(|r| r.device == device) {
            (registration.dispatch)();
            dispatched += 1;
        }

        dispatched
    }

    /// The number of handlers registered for `device`.
    #[must_use]
    pub fn registrations(&self, device: PciAddress) -> usize {
        self.snapshot
            .load()
            .iter()
            .filter(|r| r.device == device)
            .count()
    }

    fn publish(&self, registrations: &[Registration]) {
        // It's okay to use store here, because we only have a single
        // writer (serialized by the mutex).
        self.snapshot.store(Arc::new(registrations.to_vec()));
    }
}

impl InterruptSubsystem for SoftInterruptController {
    fn register_handler(
        &self,
        device: PciAddress,
        dispatch: DispatchFn,
    ) -> Result<InterruptToken, PlatformError> {
        let mut registrations = self
            .registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if self.exclusive && registrations.iter().any(|r| r.device == device) {
            return Err(PlatformError::Rejected {
                reason: format!("interrupt of {device} is already claimed"),
            });
        }

        let token = InterruptToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        registrations.push(Registration {
            token,
            device,
            dispatch,
        });
        self.publish(&registrations);

        debug!("{device}: registered interrupt handler {token:?}");
        Ok(token)
    }

    fn unregister_handler(&self, token: InterruptToken) {
        let mut registrations = self
            .registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = registrations.len();

        registrations.retain(|r| r.token != token);

        if registrations.len() == before {
            warn!("Unregistering unknown interrupt handler {token:?}");
            return;
        }

        self.publish(&registrations);
    }
}
