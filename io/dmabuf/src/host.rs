// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Primitives the hosting runtime provides to the device.
//!
//! The device never touches platform state directly. Device numbers,
//! registrations, coherent memory and caller memory are all reached through
//! the traits below, implemented once per platform.

use core::{fmt, ptr::NonNull};

use bitflags::bitflags;

use crate::{
    coherent::{CoherentRegion, DmaBusAddress},
    error::DmaResult,
};

/// A major/minor device number pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceNumber {
    major: u32,
    minor: u32,
}

impl DeviceNumber {
    /// Bits of the packed number that hold the minor.
    pub const MINOR_BITS: u32 = 20;
    const MINOR_MASK: u32 = (1 << Self::MINOR_BITS) - 1;

    pub const fn new(major: u32, minor: u32) -> Self {
        Self {
            major,
            minor: minor & Self::MINOR_MASK,
        }
    }

    pub const fn major(self) -> u32 {
        self.major
    }

    pub const fn minor(self) -> u32 {
        self.minor
    }

    /// Packs the pair the way `MKDEV` does.
    pub const fn as_raw(self) -> u32 {
        (self.major << Self::MINOR_BITS) | self.minor
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self::new(raw >> Self::MINOR_BITS, raw & Self::MINOR_MASK)
    }
}

impl fmt::Display for DeviceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

macro_rules! host_handle {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
            pub struct $name(u32);

            impl $name {
                pub const fn new(id: u32) -> Self {
                    Self(id)
                }

                pub const fn id(self) -> u32 {
                    self.0
                }
            }
        )*
    };
}

host_handle!(
    /// The registered device that owns coherent allocations and mappings.
    PlatformDevice,
    /// A device class nodes are created under.
    ClassHandle,
    /// A visible device node.
    NodeHandle,
    /// A caller's address space.
    AddressSpaceId,
);

bitflags! {
    /// Protection requested for a mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapProt: u32 {
        const READ   = 1 << 0;
        const WRITE  = 1 << 1;
        const EXEC   = 1 << 2;
        const SHARED = 1 << 3;
    }
}

/// Region of a caller's address space the runtime reserved for a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmRegion {
    /// Start address, chosen by the runtime.
    pub start: usize,
    /// Length in bytes.
    pub len: usize,
    /// Offset into the buffer, in pages.
    pub pgoff: usize,
    pub prot: MapProt,
}

/// A caller's request to map the buffer, consumed synchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingRequest {
    pub space: AddressSpaceId,
    pub region: VmRegion,
}

/// Device numbers and the registrations that make a device visible.
///
/// Each creation fails independently and each has a matching release.
pub trait DeviceHost: Send + Sync {
    /// Reserves one dynamically chosen device number.
    fn alloc_dev_region(&self, name: &str) -> DmaResult<DeviceNumber>;

    fn unregister_dev_region(&self, devno: DeviceNumber);

    /// Registers a platform device, the context for coherent allocations.
    fn register_platform_device(&self, name: &str) -> DmaResult<PlatformDevice>;

    fn unregister_platform_device(&self, dev: PlatformDevice);

    fn create_class(&self, name: &str) -> DmaResult<ClassHandle>;

    fn destroy_class(&self, class: ClassHandle);

    /// Creates the node callers open by `name`.
    fn create_node(
        &self,
        class: ClassHandle,
        devno: DeviceNumber,
        name: &str,
    ) -> DmaResult<NodeHandle>;

    fn destroy_node(&self, class: ClassHandle, devno: DeviceNumber);
}

/// The platform's coherent memory subsystem.
pub trait CoherentMemory: Send + Sync {
    fn page_size(&self) -> usize;

    /// Allocates `size` bytes of coherent memory for `dev`.
    ///
    /// Returns `None` when the request cannot be satisfied.
    fn alloc_coherent(
        &self,
        dev: PlatformDevice,
        size: usize,
    ) -> Option<(NonNull<u8>, DmaBusAddress)>;

    /// Frees a coherent allocation.
    ///
    /// # Safety
    ///
    /// `region` must describe exactly one earlier allocation for `dev` that
    /// has not been freed yet.
    unsafe fn free_coherent(&self, dev: PlatformDevice, region: CoherentRegion);

    /// Maps `region` into the address space named by `request`, keeping the
    /// coherency attributes of the allocation.
    fn mmap_coherent(
        &self,
        dev: PlatformDevice,
        request: &MappingRequest,
        region: &CoherentRegion,
    ) -> DmaResult;
}

/// Access to memory owned by callers.
pub trait UserAccess: Send + Sync {
    /// Copies `src` to the caller address `dst`.
    fn copy_to_user(&self, dst: usize, src: &[u8]) -> DmaResult;
}

/// Everything the DMA buffer device needs from its host.
pub trait DmaHost: DeviceHost + CoherentMemory + UserAccess {}

impl<T: DeviceHost + CoherentMemory + UserAccess> DmaHost for T {}

#[cfg(test)]
mod tests {
    use super::DeviceNumber;

    #[test]
    fn device_number_packing() {
        let devno = DeviceNumber::new(240, 3);
        assert_eq!(devno.as_raw(), (240 << 20) | 3);
        assert_eq!(DeviceNumber::from_raw(devno.as_raw()), devno);
        assert_eq!(DeviceNumber::new(1, 1 << 20).minor(), 0);
    }
}
