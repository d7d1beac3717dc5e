//! # DMA Buffers
//!
//! A coherent DMA buffer has two addresses: one the CPU uses and one the device uses over the
//! bus. [`DmaBuffer`] keeps both in one owned value, so they cannot be released separately.

use std::ops::Range;

use crate::device::{
    interval::Interval,
    pci::constants::dma::DEFAULT_MASK_BITS,
    platform::{BusAddress, VirtualAddress},
};

/// The range of bus addresses a device can generate for DMA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaMask {
    bits: u32,
}

impl DmaMask {
    /// Create a mask for a device with `bits` address lines.
    ///
    /// # Panics
    ///
    /// Panics if `bits` is zero or larger than 64.
    #[must_use]
    pub fn new(bits: u32) -> Self {
        assert!(bits > 0 && bits <= u64::BITS);

        Self { bits }
    }

    /// Whether the device can reach every byte of `length` bytes starting at `start`.
    #[must_use]
    pub fn reaches(self, start: BusAddress, length: u64) -> bool {
        let Some(end) = start.0.checked_add(length) else {
            return false;
        };

        // The end of the reachable range may not fit into u64 for a 64-bit mask, so we compare
        // inclusive ends instead.
        let limit = u64::MAX >> (u64::BITS - self.bits);

        length == 0 || end - 1 <= limit
    }
}

impl Default for DmaMask {
    fn default() -> Self {
        Self::new(DEFAULT_MASK_BITS)
    }
}

/// A DMA-coherent buffer owned by a device handle.
///
/// There is exactly one owner of a buffer. It is released by handing it back to the DMA
/// subsystem after splitting it into its parts.
#[derive(Debug, PartialEq, Eq)]
pub struct DmaBuffer {
    cpu_address: VirtualAddress,
    bus_address: BusAddress,
    length: u64,
}

impl DmaBuffer {
    pub(crate) const fn new(
        cpu_address: VirtualAddress,
        bus_address: BusAddress,
        length: u64,
    ) -> Self {
        Self {
            cpu_address,
            bus_address,
            length,
        }
    }

    /// Split the buffer into its parts to hand it back to the DMA subsystem.
    pub(crate) const fn into_parts(self) -> (VirtualAddress, BusAddress, u64) {
        (self.cpu_address, self.bus_address, self.length)
    }

    /// A copyable description of the buffer.
    #[must_use]
    pub const fn info(&self) -> DmaBufferInfo {
        DmaBufferInfo {
            cpu_address: self.cpu_address,
            bus_address: self.bus_address,
            length: self.length,
        }
    }

    /// Return the byte range `offset..offset + len` if it lies inside the buffer.
    pub(crate) fn checked_range(&self, offset: u64, len: usize) -> Option<Range<usize>> {
        let requested = offset..offset.checked_add(u64::try_from(len).ok()?)?;

        (0..self.length).contains_interval(&requested).then(|| {
            // Both ends are bounded by the buffer length, which fits into the address space.
            requested.start as usize..requested.end as usize
        })
    }

    /// Copy `data` into the buffer at `offset`.
    ///
    /// The caller has checked the range with [`checked_range`](Self::checked_range).
    pub(crate) fn write(&self, range: Range<usize>, data: &[u8]) {
        assert_eq!(range.len(), data.len());

        // SAFETY: The DmaSubsystem contract guarantees that `length` bytes at `cpu_address` are
        // valid until the buffer is freed, which cannot happen while we are borrowed. The range was
        // checked against the length.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.cpu_address.as_ptr().add(range.start),
                data.len(),
            );
        }
    }

    /// Copy bytes at `offset` out of the buffer into `data`.
    ///
    /// The caller has checked the range with [`checked_range`](Self::checked_range).
    pub(crate) fn read(&self, range: Range<usize>, data: &mut [u8]) {
        assert_eq!(range.len(), data.len());

        // SAFETY: See write.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.cpu_address.as_ptr().add(range.start),
                data.as_mut_ptr(),
                data.len(),
            );
        }
    }
}

/// The addresses and size of a [`DmaBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaBufferInfo {
    /// Where the CPU sees the buffer.
    pub cpu_address: VirtualAddress,

    /// Where the device sees the buffer.
    pub bus_address: BusAddress,

    /// The size of the buffer in bytes.
    pub length: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_mask_covers_low_4g() {
        let mask = DmaMask::default();

        assert!(mask.reaches(BusAddress(0), 0x1000));
        assert!(mask.reaches(BusAddress(0xffff_f000), 0x1000));
        assert!(!mask.reaches(BusAddress(0xffff_f000), 0x1001));
        assert!(!mask.reaches(BusAddress(0x1_0000_0000), 1));
    }

    #[test]
    fn full_mask_reaches_top_of_address_space() {
        let mask = DmaMask::new(64);

        assert!(mask.reaches(BusAddress(u64::MAX - 0xfff), 0xfff));
        assert!(!mask.reaches(BusAddress(u64::MAX), 2));
    }

    #[test]
    fn buffer_ranges_are_bounds_checked() {
        let mut backing = [0u8; 64];
        let cpu = VirtualAddress::from_ptr(backing.as_mut_ptr()).unwrap();
        let buffer = DmaBuffer::new(cpu, BusAddress(0x10_0000), 64);

        assert_eq!(buffer.checked_range(0, 64), Some(0..64));
        assert_eq!(buffer.checked_range(60, 4), Some(60..64));
        assert_eq!(buffer.checked_range(61, 4), None);
        assert_eq!(buffer.checked_range(u64::MAX, 1), None);
    }

    #[test]
    fn buffer_contents_are_visible_through_the_cpu_address() {
        let mut backing = vec![0u8; 32];
        let cpu = VirtualAddress::from_ptr(backing.as_mut_ptr()).unwrap();
        let buffer = DmaBuffer::new(cpu, BusAddress(0x2000), 32);

        buffer.write(8..12, &[0xde, 0xad, 0xbe, 0xef]);

        let mut out = [0u8; 4];
        buffer.read(8..12, &mut out);
        assert_eq!(out, [0xde, 0xad, 0xbe, 0xef]);

        drop(buffer);
        assert_eq!(&backing[8..12], &[0xde, 0xad, 0xbe, 0xef]);
    }
}
