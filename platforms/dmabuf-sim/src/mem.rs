// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Coherent memory, the simulated bus and caller address spaces.
//!
//! Coherent allocations are ordinary page-aligned heap blocks. Their bus
//! addresses come from a window that starts at [`BUS_WINDOW_BASE`]. A
//! mapping into a caller address space points at the very same block, so
//! caller and bus accesses see each other's writes immediately.

use alloc::{
    alloc::{Layout, alloc_zeroed, dealloc},
    collections::BTreeMap,
    vec,
    vec::Vec,
};
use core::{ptr::NonNull, slice};

use dmabuf::{
    AcquireStep, CoherentRegion, DmaBusAddress, DmaError, DmaErrorKind, DmaResult,
    host::{AddressSpaceId, CoherentMemory, MapProt, MappingRequest, PlatformDevice, UserAccess},
};
use linux_raw_sys::errno::{EINVAL, ENXIO, EPERM};

use crate::{SimEvent, SimHost};

/// First bus address handed out.
pub const BUS_WINDOW_BASE: u64 = 0x8000_0000;
/// First caller address handed out.
const USER_WINDOW_BASE: usize = 0x1000_0000;

const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

struct Allocation {
    cpu: usize,
    size: usize,
    dev: PlatformDevice,
}

struct Mapping {
    cpu: usize,
    len: usize,
    prot: MapProt,
}

#[derive(Default)]
struct Space {
    storage: BTreeMap<usize, Vec<u8>>,
    mappings: BTreeMap<usize, Mapping>,
}

pub(crate) struct MemoryState {
    limit: Option<usize>,
    in_use: usize,
    next_bus: u64,
    allocations: BTreeMap<u64, Allocation>,
    next_space: u32,
    spaces: BTreeMap<AddressSpaceId, Space>,
    next_user: usize,
}

impl MemoryState {
    pub(crate) fn new() -> Self {
        Self {
            limit: None,
            in_use: 0,
            next_bus: BUS_WINDOW_BASE,
            allocations: BTreeMap::new(),
            next_space: 0,
            spaces: BTreeMap::new(),
            next_user: USER_WINDOW_BASE,
        }
    }

    pub(crate) fn set_limit(&mut self, bytes: usize) {
        self.limit = Some(bytes);
    }

    pub(crate) fn in_use(&self) -> usize {
        self.in_use
    }

    pub(crate) fn live_allocations(&self) -> usize {
        self.allocations.len()
    }

    pub(crate) fn create_space(&mut self) -> AddressSpaceId {
        self.next_space += 1;
        let id = AddressSpaceId::new(self.next_space);
        self.spaces.insert(id, Space::default());
        id
    }

    pub(crate) fn destroy_space(&mut self, space: AddressSpaceId) {
        self.spaces.remove(&space);
    }

    /// Picks a fresh page-aligned caller range, followed by a guard page.
    pub(crate) fn reserve_user_range(&mut self, len: usize, page_size: usize) -> usize {
        let start = self.next_user;
        self.next_user += align_up(len.max(1), page_size) + page_size;
        start
    }

    pub(crate) fn user_alloc(
        &mut self,
        space: AddressSpaceId,
        len: usize,
        page_size: usize,
    ) -> DmaResult<usize> {
        if !self.spaces.contains_key(&space) {
            return Err(DmaError::BadAddress);
        }
        let start = self.reserve_user_range(len, page_size);
        if let Some(s) = self.spaces.get_mut(&space) {
            s.storage.insert(start, vec![0; len]);
        }
        Ok(start)
    }

    /// Runs `f` on `len` bytes of caller memory at `addr`.
    pub(crate) fn with_user_bytes<R>(
        &mut self,
        addr: usize,
        len: usize,
        write: bool,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> DmaResult<R> {
        let end = addr.checked_add(len).ok_or(DmaError::BadAddress)?;
        let need = if write { MapProt::WRITE } else { MapProt::READ };
        for space in self.spaces.values_mut() {
            if let Some((&start, buf)) = space.storage.range_mut(..=addr).next_back()
                && end <= start + buf.len()
            {
                return Ok(f(&mut buf[addr - start..end - start]));
            }
            if let Some((&start, mapping)) = space.mappings.range(..=addr).next_back()
                && end <= start + mapping.len
            {
                if !mapping.prot.contains(need) {
                    return Err(DmaError::BadAddress);
                }
                // The mapping is dropped before its allocation is freed, and
                // the state lock is held for the whole access.
                let bytes = unsafe {
                    slice::from_raw_parts_mut((mapping.cpu + (addr - start)) as *mut u8, len)
                };
                return Ok(f(bytes));
            }
        }
        Err(DmaError::BadAddress)
    }

    /// Runs `f` on `len` bytes of coherent memory at bus address `bus`.
    pub(crate) fn with_bus_bytes<R>(
        &mut self,
        bus: DmaBusAddress,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> DmaResult<R> {
        let bus = bus.as_u64();
        let (&base, alloc) = self
            .allocations
            .range(..=bus)
            .next_back()
            .ok_or(DmaError::BadAddress)?;
        let offset = (bus - base) as usize;
        if offset.checked_add(len).is_none_or(|end| end > alloc.size) {
            return Err(DmaError::BadAddress);
        }
        // Live allocation, accessed under the state lock.
        let bytes = unsafe { slice::from_raw_parts_mut((alloc.cpu + offset) as *mut u8, len) };
        Ok(f(bytes))
    }

    /// Frees every remaining allocation, returning how many there were.
    pub(crate) fn free_all(&mut self, page_size: usize) -> usize {
        let leaked = self.allocations.len();
        for space in self.spaces.values_mut() {
            space.mappings.clear();
        }
        while let Some((_, alloc)) = self.allocations.pop_first() {
            unsafe { free_block(&alloc, page_size) };
        }
        self.in_use = 0;
        leaked
    }
}

/// # Safety
///
/// `alloc` must describe a live block allocated with `page_size` alignment.
unsafe fn free_block(alloc: &Allocation, page_size: usize) {
    unsafe {
        dealloc(
            alloc.cpu as *mut u8,
            Layout::from_size_align_unchecked(alloc.size, page_size),
        )
    }
}

fn mapping_rejected(errno: u32) -> DmaError {
    DmaError::with_errno(DmaErrorKind::MappingRejected, errno as i32)
}

impl CoherentMemory for SimHost {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn alloc_coherent(
        &self,
        dev: PlatformDevice,
        size: usize,
    ) -> Option<(NonNull<u8>, DmaBusAddress)> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.inject(AcquireStep::AllocBuffer) {
            return None;
        }
        if size == 0 || !state.devices.has_platform_device(dev) {
            return None;
        }
        let mem = &mut state.mem;
        if mem.limit.is_some_and(|limit| mem.in_use + size > limit) {
            debug!("sim: coherent limit reached, {size:#x} bytes refused");
            return None;
        }
        let layout = Layout::from_size_align(size, self.page_size).ok()?;
        let cpu = NonNull::new(unsafe { alloc_zeroed(layout) })?;

        let bus = mem.next_bus;
        mem.next_bus += align_up(size, self.page_size) as u64;
        mem.allocations.insert(
            bus,
            Allocation {
                cpu: cpu.as_ptr() as usize,
                size,
                dev,
            },
        );
        mem.in_use += size;
        state.record(SimEvent::Acquire(AcquireStep::AllocBuffer));
        Some((cpu, DmaBusAddress::new(bus)))
    }

    unsafe fn free_coherent(&self, dev: PlatformDevice, region: CoherentRegion) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mem = &mut state.mem;
        let Some(alloc) = mem.allocations.remove(&region.bus_addr().as_u64()) else {
            error!("sim: freeing unknown coherent region {:?}", region.bus_addr());
            return;
        };
        assert!(
            alloc.cpu == region.cpu_addr().as_ptr() as usize
                && alloc.size == region.size()
                && alloc.dev == dev,
            "sim: coherent free does not match its allocation"
        );
        let range = alloc.cpu..alloc.cpu + alloc.size;
        for space in mem.spaces.values_mut() {
            space.mappings.retain(|_, m| !range.contains(&m.cpu));
        }
        mem.in_use -= alloc.size;
        unsafe { free_block(&alloc, self.page_size) };
        state.record(SimEvent::Release(AcquireStep::AllocBuffer));
    }

    fn mmap_coherent(
        &self,
        dev: PlatformDevice,
        request: &MappingRequest,
        region: &CoherentRegion,
    ) -> DmaResult {
        let page_size = self.page_size;
        let vma = &request.region;
        if vma.prot.contains(MapProt::EXEC) {
            return Err(mapping_rejected(EPERM));
        }
        if vma.len == 0 || vma.len % page_size != 0 || vma.start % page_size != 0 {
            return Err(mapping_rejected(EINVAL));
        }

        let mut guard = self.state.lock();
        let mem = &mut guard.mem;
        let Some(alloc) = mem.allocations.get(&region.bus_addr().as_u64()) else {
            return Err(mapping_rejected(ENXIO));
        };
        if alloc.dev != dev {
            return Err(mapping_rejected(ENXIO));
        }
        // Bounds are in bytes: a block smaller than a page has no room for
        // a whole-page view.
        let offset = vma.pgoff.checked_mul(page_size);
        if offset
            .and_then(|off| off.checked_add(vma.len))
            .is_none_or(|end| end > alloc.size)
        {
            return Err(mapping_rejected(ENXIO));
        }
        let cpu = alloc.cpu + vma.pgoff * page_size;

        let Some(space) = mem.spaces.get_mut(&request.space) else {
            return Err(DmaError::BadAddress);
        };
        space.mappings.insert(
            vma.start,
            Mapping {
                cpu,
                len: vma.len,
                prot: vma.prot,
            },
        );
        debug!(
            "sim: mapped {:#x} bytes at {:#x} in space {}",
            vma.len,
            vma.start,
            request.space.id()
        );
        Ok(())
    }
}

impl UserAccess for SimHost {
    fn copy_to_user(&self, dst: usize, src: &[u8]) -> DmaResult {
        self.state
            .lock()
            .mem
            .with_user_bytes(dst, src.len(), true, |bytes| bytes.copy_from_slice(src))
    }
}
