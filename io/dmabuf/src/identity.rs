// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Registration of the device with the host.
//!
//! Four independent steps make the buffer discoverable: a device number, a
//! platform device, a class and finally the node under that class. Nodes
//! depend on classes and classes are only useful with a number, so they are
//! torn down in the opposite order.

use crate::{
    error::DmaResult,
    host::{ClassHandle, DeviceHost, DeviceNumber, NodeHandle, PlatformDevice},
};

/// Identity of a live device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceRegistration {
    pub devno: DeviceNumber,
    pub platform: PlatformDevice,
    pub class: ClassHandle,
    pub node: NodeHandle,
}

/// Thin wrapper over [`DeviceHost`] that logs every step.
pub struct DeviceIdentity<'a, H: DeviceHost> {
    host: &'a H,
}

impl<'a, H: DeviceHost> DeviceIdentity<'a, H> {
    pub fn new(host: &'a H) -> Self {
        Self { host }
    }

    pub fn reserve_number(&self, name: &str) -> DmaResult<DeviceNumber> {
        let devno = self.host.alloc_dev_region(name).inspect_err(|e| {
            error!("{name}: failed to allocate chrdev region: {e:?}");
        })?;
        debug!("{name}: reserved device number {devno}");
        Ok(devno)
    }

    pub fn register_logical_device(&self, name: &str) -> DmaResult<PlatformDevice> {
        let dev = self.host.register_platform_device(name).inspect_err(|e| {
            error!("{name}: failed to register platform device: {e:?}");
        })?;
        debug!("{name}: registered platform device {}", dev.id());
        Ok(dev)
    }

    pub fn create_class(&self, name: &str) -> DmaResult<ClassHandle> {
        let class = self.host.create_class(name).inspect_err(|e| {
            error!("{name}: failed to create class: {e:?}");
        })?;
        debug!("{name}: created class {}", class.id());
        Ok(class)
    }

    pub fn create_node(
        &self,
        class: ClassHandle,
        devno: DeviceNumber,
        name: &str,
    ) -> DmaResult<NodeHandle> {
        let node = self.host.create_node(class, devno, name).inspect_err(|e| {
            error!("{name}: failed to create device node: {e:?}");
        })?;
        debug!("{name}: created node {} for {devno}", node.id());
        Ok(node)
    }

    pub fn release_number(&self, devno: DeviceNumber) {
        debug!("releasing device number {devno}");
        self.host.unregister_dev_region(devno);
    }

    pub fn unregister_logical_device(&self, dev: PlatformDevice) {
        debug!("unregistering platform device {}", dev.id());
        self.host.unregister_platform_device(dev);
    }

    pub fn destroy_class(&self, class: ClassHandle) {
        debug!("destroying class {}", class.id());
        self.host.destroy_class(class);
    }

    pub fn destroy_node(&self, class: ClassHandle, devno: DeviceNumber) {
        debug!("destroying node {devno}");
        self.host.destroy_node(class, devno);
    }
}
