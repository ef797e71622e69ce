// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Device numbers and device registrations.

use alloc::{collections::BTreeMap, string::String};

use dmabuf::{
    AcquireStep, DmaError, DmaErrorKind, DmaResult,
    host::{ClassHandle, DeviceHost, DeviceNumber, NodeHandle, PlatformDevice},
};
use linux_raw_sys::errno::{EBUSY, EEXIST, ENOENT};

use crate::{SimEvent, SimHost};

/// Highest dynamically assigned major, majors are handed out downwards.
const DYNAMIC_MAJOR_END: u32 = 254;
/// Size of the dynamic major range, `234..=254`.
const DYNAMIC_MAJOR_COUNT: u32 = 21;

#[derive(Debug, Clone, Copy)]
struct SimNode {
    class: ClassHandle,
    devno: DeviceNumber,
}

pub(crate) struct DeviceRegistry {
    major_limit: u32,
    regions: BTreeMap<u32, String>,
    next_id: u32,
    platform_devices: BTreeMap<PlatformDevice, String>,
    classes: BTreeMap<ClassHandle, String>,
    nodes: BTreeMap<String, SimNode>,
}

impl DeviceRegistry {
    pub(crate) fn new() -> Self {
        Self {
            major_limit: DYNAMIC_MAJOR_COUNT,
            regions: BTreeMap::new(),
            next_id: 0,
            platform_devices: BTreeMap::new(),
            classes: BTreeMap::new(),
            nodes: BTreeMap::new(),
        }
    }

    pub(crate) fn set_major_limit(&mut self, limit: u32) {
        self.major_limit = limit.min(DYNAMIC_MAJOR_COUNT);
    }

    pub(crate) fn live(&self) -> usize {
        self.regions.len() + self.platform_devices.len() + self.classes.len() + self.nodes.len()
    }

    pub(crate) fn lookup_node(&self, name: &str) -> Option<DeviceNumber> {
        self.nodes.get(name).map(|node| node.devno)
    }

    pub(crate) fn has_platform_device(&self, dev: PlatformDevice) -> bool {
        self.platform_devices.contains_key(&dev)
    }

    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn free_major(&self) -> Option<u32> {
        let lowest = DYNAMIC_MAJOR_END + 1 - self.major_limit;
        (lowest..=DYNAMIC_MAJOR_END)
            .rev()
            .find(|major| !self.regions.contains_key(major))
    }
}

fn already_exists() -> DmaError {
    DmaError::with_errno(DmaErrorKind::RegistrationRejected, EEXIST as i32)
}

impl DeviceHost for SimHost {
    fn alloc_dev_region(&self, name: &str) -> DmaResult<DeviceNumber> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let exhausted = DmaError::with_errno(DmaErrorKind::NumbersExhausted, EBUSY as i32);
        if state.inject(AcquireStep::ReserveNumber) {
            return Err(exhausted);
        }
        let major = state.devices.free_major().ok_or(exhausted)?;
        state.devices.regions.insert(major, name.into());
        state.record(SimEvent::Acquire(AcquireStep::ReserveNumber));
        Ok(DeviceNumber::new(major, 0))
    }

    fn unregister_dev_region(&self, devno: DeviceNumber) {
        let mut state = self.state.lock();
        if state.devices.regions.remove(&devno.major()).is_none() {
            warn!("sim: unregistering unknown region {devno}");
            return;
        }
        state.record(SimEvent::Release(AcquireStep::ReserveNumber));
    }

    fn register_platform_device(&self, name: &str) -> DmaResult<PlatformDevice> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.inject(AcquireStep::RegisterDevice) {
            return Err(DmaError::RegistrationRejected);
        }
        if state.devices.platform_devices.values().any(|n| n == name) {
            return Err(already_exists());
        }
        let dev = PlatformDevice::new(state.devices.next_id());
        state.devices.platform_devices.insert(dev, name.into());
        state.record(SimEvent::Acquire(AcquireStep::RegisterDevice));
        Ok(dev)
    }

    fn unregister_platform_device(&self, dev: PlatformDevice) {
        let mut state = self.state.lock();
        if state.devices.platform_devices.remove(&dev).is_none() {
            warn!("sim: unregistering unknown platform device {}", dev.id());
            return;
        }
        state.record(SimEvent::Release(AcquireStep::RegisterDevice));
    }

    fn create_class(&self, name: &str) -> DmaResult<ClassHandle> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.inject(AcquireStep::CreateClass) {
            return Err(DmaError::RegistrationRejected);
        }
        if state.devices.classes.values().any(|n| n == name) {
            return Err(already_exists());
        }
        let class = ClassHandle::new(state.devices.next_id());
        state.devices.classes.insert(class, name.into());
        state.record(SimEvent::Acquire(AcquireStep::CreateClass));
        Ok(class)
    }

    fn destroy_class(&self, class: ClassHandle) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.devices.nodes.values().any(|node| node.class == class) {
            warn!("sim: destroying class {} with live nodes", class.id());
        }
        if state.devices.classes.remove(&class).is_none() {
            warn!("sim: destroying unknown class {}", class.id());
            return;
        }
        state.record(SimEvent::Release(AcquireStep::CreateClass));
    }

    fn create_node(
        &self,
        class: ClassHandle,
        devno: DeviceNumber,
        name: &str,
    ) -> DmaResult<NodeHandle> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.inject(AcquireStep::CreateNode) {
            return Err(DmaError::RegistrationRejected);
        }
        if !state.devices.classes.contains_key(&class)
            || !state.devices.regions.contains_key(&devno.major())
        {
            return Err(DmaError::with_errno(
                DmaErrorKind::RegistrationRejected,
                ENOENT as i32,
            ));
        }
        if state.devices.nodes.contains_key(name) {
            return Err(already_exists());
        }
        let node = NodeHandle::new(state.devices.next_id());
        state
            .devices
            .nodes
            .insert(name.into(), SimNode { class, devno });
        state.record(SimEvent::Acquire(AcquireStep::CreateNode));
        Ok(node)
    }

    fn destroy_node(&self, class: ClassHandle, devno: DeviceNumber) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let name = state
            .devices
            .nodes
            .iter()
            .find(|(_, node)| node.class == class && node.devno == devno)
            .map(|(name, _)| name.clone());
        let Some(name) = name else {
            warn!("sim: destroying unknown node {devno}");
            return;
        };
        state.devices.nodes.remove(&name);
        state.record(SimEvent::Release(AcquireStep::CreateNode));
    }
}
