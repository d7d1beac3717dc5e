//! # PCI Addresses
//!
//! A [`PciAddress`] identifies a single PCI function to the platform subsystems. Its textual form
//! is the one Linux uses in `/sys/bus/pci/devices`, e.g. `0000:00:1f.3`.

use std::{fmt, str::FromStr};

/// The maximum device number on a PCI bus.
const MAX_DEVICE: u8 = 31;

/// The maximum function number in a PCI device.
const MAX_FUNCTION: u8 = 7;

/// Segment/bus/device/function address of a PCI function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PciAddress {
    /// PCI segment (domain) number.
    pub domain: u16,
    /// Bus number (0-255).
    pub bus: u8,
    /// Device number (0-31).
    pub device: u8,
    /// Function number (0-7).
    pub function: u8,
}

impl PciAddress {
    /// Create a new address in segment 0.
    ///
    /// # Panics
    ///
    /// Panics if `device` or `function` are out of range.
    #[must_use]
    pub fn new(bus: u8, device: u8, function: u8) -> Self {
        assert!(device <= MAX_DEVICE);
        assert!(function <= MAX_FUNCTION);

        Self {
            domain: 0,
            bus,
            device,
            function,
        }
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{}",
            self.domain, self.bus, self.device, self.function
        )
    }
}

/// A string could not be parsed as [`PciAddress`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid PCI address {input:?}: expected [dddd:]bb:dd.f")]
pub struct ParseAddressError {
    input: String,
}

/// Whether `field` is a non-empty string of hex digits. `from_str_radix` alone also accepts a sign.
fn is_hex_field(field: &str) -> bool {
    !field.is_empty() && field.bytes().all(|b| b.is_ascii_hexdigit())
}

impl FromStr for PciAddress {
    type Err = ParseAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseAddressError {
            input: s.to_string(),
        };

        let (head, function) = s.rsplit_once('.').ok_or_else(err)?;
        let mut parts = head.rsplitn(3, ':');

        let device = parts.next().ok_or_else(err)?;
        let bus = parts.next().ok_or_else(err)?;
        let domain = parts.next().unwrap_or("0");

        if ![domain, bus, device, function].into_iter().all(is_hex_field) {
            return Err(err());
        }

        let address = Self {
            domain: u16::from_str_radix(domain, 16).map_err(|_| err())?,
            bus: u8::from_str_radix(bus, 16).map_err(|_| err())?,
            device: u8::from_str_radix(device, 16).map_err(|_| err())?,
            function: u8::from_str_radix(function, 16).map_err(|_| err())?,
        };

        if address.device > MAX_DEVICE || address.function > MAX_FUNCTION {
            return Err(err());
        }

        Ok(address)
    }
}
