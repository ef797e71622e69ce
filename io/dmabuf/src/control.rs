// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Control interface of the live buffer.
//!
//! Callers open the device node, query the bus address of the buffer with
//! [`DMA_BUF_IOCTL_GET_PHYS_ADDR`] and map the buffer into their address
//! space. Everything here only reads state that is fixed once the buffer is
//! live, so any number of callers may use the interface at once.

use alloc::sync::Arc;

use crate::{
    coherent::{CoherentRegion, DmaBusAddress},
    config::DMA_BUF_IOCTL_MAGIC,
    error::{DmaError, DmaResult},
    host::{DeviceNumber, DmaHost, MappingRequest},
    identity::DeviceRegistration,
};

const IOC_NRBITS: u32 = 8;
const IOC_TYPEBITS: u32 = 8;
const IOC_SIZEBITS: u32 = 14;

const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = IOC_NRSHIFT + IOC_NRBITS;
const IOC_SIZESHIFT: u32 = IOC_TYPESHIFT + IOC_TYPEBITS;
const IOC_DIRSHIFT: u32 = IOC_SIZESHIFT + IOC_SIZEBITS;

const IOC_READ: u32 = 2;

/// Encodes a control code the way Linux `_IOC` does.
pub const fn ioc(dir: u32, ty: u8, nr: u8, size: usize) -> u32 {
    (dir << IOC_DIRSHIFT)
        | ((size as u32) << IOC_SIZESHIFT)
        | ((ty as u32) << IOC_TYPESHIFT)
        | ((nr as u32) << IOC_NRSHIFT)
}

/// `_IOR(ty, nr, size)`.
pub const fn ior(ty: u8, nr: u8, size: usize) -> u32 {
    ioc(IOC_READ, ty, nr, size)
}

/// Reads the bus address of the buffer.
///
/// Defined as `_IOR(0xF0, 1, uint32_t)` for compatibility with existing
/// callers; the value copied out is the full 64-bit bus address.
pub const DMA_BUF_IOCTL_GET_PHYS_ADDR: u32 = ior(DMA_BUF_IOCTL_MAGIC, 1, size_of::<u32>());

/// Operations a device node dispatches to.
pub trait FileOps: Send + Sync {
    fn open(&self) -> DmaResult {
        Ok(())
    }

    fn release(&self) -> DmaResult {
        Ok(())
    }

    fn ioctl(&self, cmd: u32, arg: usize) -> DmaResult<usize>;

    fn mmap(&self, request: &MappingRequest) -> DmaResult;
}

/// The buffer as seen by callers.
pub struct DmaBufferDevice<H: DmaHost> {
    host: Arc<H>,
    registration: DeviceRegistration,
    region: CoherentRegion,
}

impl<H: DmaHost> DmaBufferDevice<H> {
    pub(crate) fn new(
        host: Arc<H>,
        registration: DeviceRegistration,
        region: CoherentRegion,
    ) -> Self {
        Self {
            host,
            registration,
            region,
        }
    }

    /// Bus address of the buffer, stable while the buffer is live.
    pub fn phys_addr(&self) -> DmaBusAddress {
        self.region.bus_addr()
    }

    /// Size of the buffer in bytes.
    pub fn size(&self) -> usize {
        self.region.size()
    }

    pub fn devno(&self) -> DeviceNumber {
        self.registration.devno
    }

    pub fn registration(&self) -> &DeviceRegistration {
        &self.registration
    }

    pub(crate) fn region(&self) -> &CoherentRegion {
        &self.region
    }

    /// Copies the bus address into caller storage at `dst`.
    pub fn query_physical_address(&self, dst: usize) -> DmaResult {
        let addr = self.phys_addr().as_u64();
        self.host
            .copy_to_user(dst, &addr.to_ne_bytes())
            .map_err(|_| DmaError::BadAddress)
    }

    /// Maps the whole buffer into the requesting address space.
    ///
    /// The requested range is not interpreted here; the host's mapping
    /// primitive validates it against the buffer.
    pub fn map_into(&self, request: &MappingRequest) -> DmaResult {
        self.host
            .mmap_coherent(self.registration.platform, request, &self.region)
            .inspect_err(|e| error!("dma_mmap_coherent failed: {e:?}"))
    }
}

impl<H: DmaHost> FileOps for DmaBufferDevice<H> {
    fn ioctl(&self, cmd: u32, arg: usize) -> DmaResult<usize> {
        trace!("dma_buffer: ioctl cmd={cmd:#x}, arg={arg:#x}");
        match cmd {
            DMA_BUF_IOCTL_GET_PHYS_ADDR => {
                self.query_physical_address(arg)?;
                Ok(0)
            }
            _ => crate::dma_err!(
                InvalidOperation,
                format_args!("dma_buffer: unsupported ioctl cmd={cmd:#x}")
            ),
        }
    }

    fn mmap(&self, request: &MappingRequest) -> DmaResult {
        self.map_into(request)
    }
}
