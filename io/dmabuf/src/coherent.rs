// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Coherent DMA region and its allocator.

use core::{fmt, ptr::NonNull};

use crate::{
    error::{DmaError, DmaResult},
    host::{CoherentMemory, PlatformDevice},
};

/// A bus memory address.
///
/// It's a wrapper type around an [`u64`].
#[repr(transparent)]
#[derive(Copy, Clone, Default, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct DmaBusAddress(u64);

impl DmaBusAddress {
    /// Converts an [`u64`] to a bus address.
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Converts the address to an [`u64`].
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Whether the address is a multiple of `align`, which must be a power
    /// of two.
    pub const fn is_aligned(self, align: usize) -> bool {
        self.0 & (align as u64 - 1) == 0
    }
}

impl From<u64> for DmaBusAddress {
    fn from(value: u64) -> Self {
        Self::new(value)
    }
}

impl fmt::Debug for DmaBusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DmaBusAddress")
            .field(&format_args!("{:#X}", self.0))
            .finish()
    }
}

impl fmt::LowerHex for DmaBusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// A live coherent allocation.
///
/// `cpu_addr` and `bus_addr` are valid together: both come from one
/// successful allocation and are handed back together on release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoherentRegion {
    /// The address at which the CPU accesses this memory region.
    cpu_addr: NonNull<u8>,
    /// The address the device uses to reach the same memory.
    bus_addr: DmaBusAddress,
    size: usize,
}

// The region is a plain descriptor of memory that stays put until it is
// released by its single owner.
unsafe impl Send for CoherentRegion {}
unsafe impl Sync for CoherentRegion {}

impl CoherentRegion {
    /// Describes memory a host handed out from a coherent allocation.
    pub const fn new(cpu_addr: NonNull<u8>, bus_addr: DmaBusAddress, size: usize) -> Self {
        Self {
            cpu_addr,
            bus_addr,
            size,
        }
    }

    pub const fn cpu_addr(&self) -> NonNull<u8> {
        self.cpu_addr
    }

    pub const fn bus_addr(&self) -> DmaBusAddress {
        self.bus_addr
    }

    pub const fn size(&self) -> usize {
        self.size
    }
}

/// Allocates and frees the coherent buffer on behalf of one platform device.
///
/// Coherent mappings are device-relative, so the same [`PlatformDevice`] has
/// to be used for allocation, mapping and release.
pub struct CoherentBufferAllocator<'a, H: CoherentMemory> {
    host: &'a H,
    dev: PlatformDevice,
}

impl<'a, H: CoherentMemory> CoherentBufferAllocator<'a, H> {
    pub fn new(host: &'a H, dev: PlatformDevice) -> Self {
        Self { host, dev }
    }

    /// Allocates `size` bytes of cache-coherent, DMA-capable memory.
    pub fn allocate(&self, size: usize) -> DmaResult<CoherentRegion> {
        let (cpu_addr, bus_addr) = self
            .host
            .alloc_coherent(self.dev, size)
            .ok_or(DmaError::NoMemory)?;
        debug!(
            "coherent alloc: dev={:?} cpu={:p} bus={:#x} size={:#x}",
            self.dev, cpu_addr, bus_addr, size
        );
        Ok(CoherentRegion::new(cpu_addr, bus_addr, size))
    }

    /// Returns the region to the platform.
    ///
    /// # Safety
    ///
    /// `region` must be exactly what [`allocate`](Self::allocate) returned
    /// for this device, released once, and no mapping or caller may use the
    /// memory afterwards.
    pub unsafe fn release(&self, region: CoherentRegion) {
        debug!(
            "coherent free: dev={:?} bus={:#x} size={:#x}",
            self.dev,
            region.bus_addr(),
            region.size()
        );
        unsafe { self.host.free_coherent(self.dev, region) }
    }
}
