// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Ordered record of acquired resources.
//!
//! Every successful acquisition pushes a descriptor of what has to be
//! released. Unwinding pops the stack, so resources are released strictly in
//! reverse order, each exactly once, and an empty ledger unwinds to nothing.

use alloc::vec::Vec;
use core::fmt;

use strum::EnumCount;

use crate::{
    coherent::{CoherentBufferAllocator, CoherentRegion},
    host::{ClassHandle, DeviceNumber, DmaHost, NodeHandle, PlatformDevice},
    identity::DeviceIdentity,
};

/// Acquisition steps, in the order they are performed.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, EnumCount)]
pub enum AcquireStep {
    ReserveNumber,
    RegisterDevice,
    CreateClass,
    CreateNode,
    AllocBuffer,
}

impl AcquireStep {
    /// All steps in acquisition order.
    pub const ALL: [AcquireStep; AcquireStep::COUNT] = [
        AcquireStep::ReserveNumber,
        AcquireStep::RegisterDevice,
        AcquireStep::CreateClass,
        AcquireStep::CreateNode,
        AcquireStep::AllocBuffer,
    ];

    /// Position of the step in the acquisition order.
    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AcquireStep::ReserveNumber => "device number region",
            AcquireStep::RegisterDevice => "platform device",
            AcquireStep::CreateClass => "device class",
            AcquireStep::CreateNode => "device node",
            AcquireStep::AllocBuffer => "coherent buffer",
        }
    }
}

impl fmt::Display for AcquireStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An acquired resource together with what is needed to release it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    Number(DeviceNumber),
    Device(PlatformDevice),
    Class(ClassHandle),
    Node {
        class: ClassHandle,
        devno: DeviceNumber,
        node: NodeHandle,
    },
    Buffer {
        dev: PlatformDevice,
        region: CoherentRegion,
    },
}

impl Acquired {
    pub const fn step(&self) -> AcquireStep {
        match self {
            Acquired::Number(_) => AcquireStep::ReserveNumber,
            Acquired::Device(_) => AcquireStep::RegisterDevice,
            Acquired::Class(_) => AcquireStep::CreateClass,
            Acquired::Node { .. } => AcquireStep::CreateNode,
            Acquired::Buffer { .. } => AcquireStep::AllocBuffer,
        }
    }

    fn release<H: DmaHost>(self, host: &H) {
        let identity = DeviceIdentity::new(host);
        match self {
            Acquired::Number(devno) => identity.release_number(devno),
            Acquired::Device(dev) => identity.unregister_logical_device(dev),
            Acquired::Class(class) => identity.destroy_class(class),
            Acquired::Node { class, devno, .. } => identity.destroy_node(class, devno),
            Acquired::Buffer { dev, region } => {
                // The descriptor was popped from the ledger, so this is the
                // only release of the region.
                unsafe { CoherentBufferAllocator::new(host, dev).release(region) }
            }
        }
    }
}

/// Stack of acquired resources.
#[derive(Debug, Default)]
pub struct ResourceLedger {
    stack: Vec<Acquired>,
}

impl ResourceLedger {
    pub const fn new() -> Self {
        Self { stack: Vec::new() }
    }

    /// Records a resource that has just been acquired.
    ///
    /// Resources must be recorded in [`AcquireStep`] order.
    pub fn record(&mut self, acquired: Acquired) {
        debug_assert_eq!(
            acquired.step().index(),
            self.stack.len(),
            "{} recorded out of order",
            acquired.step()
        );
        self.stack.push(acquired);
    }

    /// Whether the resource of `step` is currently held.
    pub fn is_set(&self, step: AcquireStep) -> bool {
        self.stack.iter().any(|a| a.step() == step)
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    /// Held steps, in acquisition order.
    pub fn steps(&self) -> impl Iterator<Item = AcquireStep> + '_ {
        self.stack.iter().map(Acquired::step)
    }

    /// Releases every held resource, most recent first.
    ///
    /// Returns how many resources were released.
    pub fn unwind<H: DmaHost>(&mut self, host: &H) -> usize {
        let mut released = 0;
        while let Some(acquired) = self.stack.pop() {
            debug!("unwind: releasing {}", acquired.step());
            acquired.release(host);
            released += 1;
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use core::ptr::NonNull;
    use std::sync::Mutex;

    use super::{AcquireStep, Acquired, ResourceLedger};
    use crate::{
        coherent::{CoherentRegion, DmaBusAddress},
        error::DmaResult,
        host::*,
    };

    /// Host that only records releases.
    #[derive(Default)]
    struct RecordingHost {
        released: Mutex<Vec<AcquireStep>>,
    }

    impl RecordingHost {
        fn push(&self, step: AcquireStep) {
            self.released.lock().unwrap().push(step);
        }

        fn released(&self) -> Vec<AcquireStep> {
            self.released.lock().unwrap().clone()
        }
    }

    impl DeviceHost for RecordingHost {
        fn alloc_dev_region(&self, _name: &str) -> DmaResult<DeviceNumber> {
            unreachable!()
        }
        fn unregister_dev_region(&self, _devno: DeviceNumber) {
            self.push(AcquireStep::ReserveNumber);
        }
        fn register_platform_device(&self, _name: &str) -> DmaResult<PlatformDevice> {
            unreachable!()
        }
        fn unregister_platform_device(&self, _dev: PlatformDevice) {
            self.push(AcquireStep::RegisterDevice);
        }
        fn create_class(&self, _name: &str) -> DmaResult<ClassHandle> {
            unreachable!()
        }
        fn destroy_class(&self, _class: ClassHandle) {
            self.push(AcquireStep::CreateClass);
        }
        fn create_node(
            &self,
            _class: ClassHandle,
            _devno: DeviceNumber,
            _name: &str,
        ) -> DmaResult<NodeHandle> {
            unreachable!()
        }
        fn destroy_node(&self, _class: ClassHandle, _devno: DeviceNumber) {
            self.push(AcquireStep::CreateNode);
        }
    }

    impl CoherentMemory for RecordingHost {
        fn page_size(&self) -> usize {
            4096
        }
        fn alloc_coherent(
            &self,
            _dev: PlatformDevice,
            _size: usize,
        ) -> Option<(NonNull<u8>, DmaBusAddress)> {
            unreachable!()
        }
        unsafe fn free_coherent(&self, _dev: PlatformDevice, _region: CoherentRegion) {
            self.push(AcquireStep::AllocBuffer);
        }
        fn mmap_coherent(
            &self,
            _dev: PlatformDevice,
            _request: &MappingRequest,
            _region: &CoherentRegion,
        ) -> DmaResult {
            unreachable!()
        }
    }

    impl UserAccess for RecordingHost {
        fn copy_to_user(&self, _dst: usize, _src: &[u8]) -> DmaResult {
            unreachable!()
        }
    }

    fn acquired(step: AcquireStep) -> Acquired {
        let devno = DeviceNumber::new(240, 0);
        let class = ClassHandle::new(1);
        let dev = PlatformDevice::new(1);
        match step {
            AcquireStep::ReserveNumber => Acquired::Number(devno),
            AcquireStep::RegisterDevice => Acquired::Device(dev),
            AcquireStep::CreateClass => Acquired::Class(class),
            AcquireStep::CreateNode => Acquired::Node {
                class,
                devno,
                node: NodeHandle::new(1),
            },
            AcquireStep::AllocBuffer => Acquired::Buffer {
                dev,
                // Never dereferenced: the recording host does not free.
                region: CoherentRegion::new(
                    NonNull::dangling(),
                    DmaBusAddress::new(0x8000_0000),
                    0x10_0000,
                ),
            },
        }
    }

    #[test]
    fn unwind_releases_in_reverse() {
        for n in 0..=AcquireStep::ALL.len() {
            let host = RecordingHost::default();
            let mut ledger = ResourceLedger::new();
            for step in &AcquireStep::ALL[..n] {
                ledger.record(acquired(*step));
            }
            assert_eq!(ledger.len(), n);

            assert_eq!(ledger.unwind(&host), n);
            let expected: Vec<_> = AcquireStep::ALL[..n].iter().rev().copied().collect();
            assert_eq!(host.released(), expected);
            assert!(ledger.is_empty());
        }
    }

    #[test]
    fn unwind_twice_is_noop() {
        let host = RecordingHost::default();
        let mut ledger = ResourceLedger::new();
        ledger.record(acquired(AcquireStep::ReserveNumber));
        ledger.record(acquired(AcquireStep::RegisterDevice));

        assert_eq!(ledger.unwind(&host), 2);
        assert_eq!(ledger.unwind(&host), 0);
        assert_eq!(host.released().len(), 2);
    }

    #[test]
    fn flags_follow_records() {
        let mut ledger = ResourceLedger::new();
        assert!(!ledger.is_set(AcquireStep::ReserveNumber));
        ledger.record(acquired(AcquireStep::ReserveNumber));
        assert!(ledger.is_set(AcquireStep::ReserveNumber));
        assert!(!ledger.is_set(AcquireStep::RegisterDevice));
        assert_eq!(
            ledger.steps().collect::<Vec<_>>(),
            [AcquireStep::ReserveNumber]
        );
    }
}
