// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Software platform for the `dmabuf` device.
//!
//! [`SimHost`] implements every host primitive in memory: a bounded device
//! number space, named registries for platform devices, classes and nodes,
//! page-aligned coherent allocations behind a simulated bus window, and
//! caller address spaces that coherent mappings land in. Every acquire and
//! release is logged as a [`SimEvent`], and any acquisition step can be made
//! to fail once with [`SimHost::fail_at`].
#![no_std]

#[macro_use]
extern crate log;

extern crate alloc;

mod devices;
mod mem;

use alloc::vec::Vec;

use dmabuf::{
    AcquireStep, DmaBusAddress, DmaResult,
    host::{AddressSpaceId, DeviceNumber, MapProt, MappingRequest, VmRegion},
};
use spin::Mutex;

use self::{devices::DeviceRegistry, mem::MemoryState};

/// Page size used unless overridden.
pub const DEFAULT_PAGE_SIZE: usize = 0x1000;

/// One acquisition or release observed by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimEvent {
    Acquire(AcquireStep),
    Release(AcquireStep),
}

struct SimState {
    devices: DeviceRegistry,
    mem: MemoryState,
    fail_at: Option<AcquireStep>,
    events: Vec<SimEvent>,
}

impl SimState {
    /// Consumes a pending injected failure for `step`.
    fn inject(&mut self, step: AcquireStep) -> bool {
        if self.fail_at == Some(step) {
            self.fail_at = None;
            warn!("sim: injected failure at {step}");
            true
        } else {
            false
        }
    }

    fn record(&mut self, event: SimEvent) {
        self.events.push(event);
    }
}

/// In-memory host.
pub struct SimHost {
    page_size: usize,
    state: Mutex<SimState>,
}

impl SimHost {
    pub fn new() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            state: Mutex::new(SimState {
                devices: DeviceRegistry::new(),
                mem: MemoryState::new(),
                fail_at: None,
                events: Vec::new(),
            }),
        }
    }

    /// Uses another page size, which must be a power of two.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        assert!(page_size.is_power_of_two(), "page size must be a power of two");
        self.page_size = page_size;
        self
    }

    /// Limits how many dynamic major numbers can be handed out.
    pub fn with_major_limit(self, limit: u32) -> Self {
        self.state.lock().devices.set_major_limit(limit);
        self
    }

    /// Limits the total bytes of coherent memory.
    pub fn with_coherent_limit(self, bytes: usize) -> Self {
        self.state.lock().mem.set_limit(bytes);
        self
    }

    /// Makes the next attempt at `step` fail.
    pub fn fail_at(&self, step: AcquireStep) {
        self.state.lock().fail_at = Some(step);
    }

    /// Every acquisition and release so far, in order.
    pub fn events(&self) -> Vec<SimEvent> {
        self.state.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    /// Number of host resources currently held by anyone.
    pub fn live_resources(&self) -> usize {
        let state = self.state.lock();
        state.devices.live() + state.mem.live_allocations()
    }

    /// Bytes of coherent memory currently allocated.
    pub fn coherent_in_use(&self) -> usize {
        self.state.lock().mem.in_use()
    }

    /// Whether a node called `name` can be opened.
    pub fn is_discoverable(&self, name: &str) -> bool {
        self.open(name).is_some()
    }

    /// Resolves a node name to the device number behind it.
    pub fn open(&self, name: &str) -> Option<DeviceNumber> {
        self.state.lock().devices.lookup_node(name)
    }

    /// Creates an empty caller address space.
    pub fn create_space(&self) -> AddressSpaceId {
        self.state.lock().mem.create_space()
    }

    /// Tears down a caller address space with its storage and mappings.
    pub fn destroy_space(&self, space: AddressSpaceId) {
        self.state.lock().mem.destroy_space(space);
    }

    /// Reserves `len` zeroed bytes of caller storage in `space`.
    pub fn user_alloc(&self, space: AddressSpaceId, len: usize) -> DmaResult<usize> {
        let page_size = self.page_size;
        self.state.lock().mem.user_alloc(space, len, page_size)
    }

    /// Builds a mapping request at an address chosen by the runtime.
    pub fn new_vma(
        &self,
        space: AddressSpaceId,
        len: usize,
        pgoff: usize,
        prot: MapProt,
    ) -> MappingRequest {
        let page_size = self.page_size;
        let start = self.state.lock().mem.reserve_user_range(len, page_size);
        MappingRequest {
            space,
            region: VmRegion {
                start,
                len,
                pgoff,
                prot,
            },
        }
    }

    /// Reads caller memory, either plain storage or a coherent mapping.
    pub fn user_read(&self, addr: usize, len: usize) -> DmaResult<Vec<u8>> {
        self.state
            .lock()
            .mem
            .with_user_bytes(addr, len, false, |bytes| bytes.to_vec())
    }

    /// Writes caller memory, either plain storage or a coherent mapping.
    pub fn user_write(&self, addr: usize, data: &[u8]) -> DmaResult {
        self.state
            .lock()
            .mem
            .with_user_bytes(addr, data.len(), true, |bytes| bytes.copy_from_slice(data))
    }

    /// Reads coherent memory the way a device would, by bus address.
    pub fn bus_read(&self, bus: DmaBusAddress, len: usize) -> DmaResult<Vec<u8>> {
        self.state
            .lock()
            .mem
            .with_bus_bytes(bus, len, |bytes| bytes.to_vec())
    }

    /// Writes coherent memory the way a device would, by bus address.
    pub fn bus_write(&self, bus: DmaBusAddress, data: &[u8]) -> DmaResult {
        self.state
            .lock()
            .mem
            .with_bus_bytes(bus, data.len(), |bytes| bytes.copy_from_slice(data))
    }
}

impl Default for SimHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SimHost {
    fn drop(&mut self) {
        let page_size = self.page_size;
        let leaked = self.state.get_mut().mem.free_all(page_size);
        if leaked > 0 {
            warn!("sim: {leaked} coherent allocations still live at teardown");
        }
    }
}
