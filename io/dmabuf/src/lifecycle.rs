// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Load and unload of the DMA buffer device.
//!
//! [`DmaBufferDriver::start`] acquires five resources in a fixed order and
//! records each one in a [`ResourceLedger`]. Any failure unwinds exactly what
//! was recorded, newest first, before the error is returned. The control
//! interface only exists while the driver is [`DriverState::Live`], and it is
//! borrowed from the driver, so shutdown cannot overlap with callers.

use alloc::sync::Arc;

use crate::{
    coherent::CoherentBufferAllocator,
    config::{DmaBufferConfig, buffer_size},
    control::DmaBufferDevice,
    error::DmaResult,
    host::DmaHost,
    identity::{DeviceIdentity, DeviceRegistration},
    ledger::{AcquireStep, Acquired, ResourceLedger},
};

/// Lifecycle state of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Unloaded,
    Initializing,
    Live,
}

/// Owns the device's resources from load to unload.
pub struct DmaBufferDriver<H: DmaHost> {
    host: Arc<H>,
    config: DmaBufferConfig,
    state: DriverState,
    ledger: ResourceLedger,
    device: Option<DmaBufferDevice<H>>,
}

impl<H: DmaHost> DmaBufferDriver<H> {
    pub fn new(host: Arc<H>, config: DmaBufferConfig) -> Self {
        Self {
            host,
            config,
            state: DriverState::Unloaded,
            ledger: ResourceLedger::new(),
            device: None,
        }
    }

    pub fn host(&self) -> &Arc<H> {
        &self.host
    }

    pub fn config(&self) -> &DmaBufferConfig {
        &self.config
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    /// The control interface, present only while live.
    pub fn control(&self) -> Option<&DmaBufferDevice<H>> {
        self.device.as_ref()
    }

    /// Steps whose resources are currently held, in acquisition order.
    pub fn acquired_steps(&self) -> impl Iterator<Item = AcquireStep> + '_ {
        self.ledger.steps()
    }

    /// Acquires every resource and makes the buffer live.
    ///
    /// On failure everything acquired so far has been released and the
    /// error of the failing step is returned.
    pub fn start(&mut self) -> DmaResult {
        if self.state != DriverState::Unloaded {
            crate::dma_bail!(
                BadState,
                format_args!("{}: start requested while {:?}", self.config.device_name, self.state)
            );
        }
        self.state = DriverState::Initializing;

        match self.acquire() {
            Ok(device) => {
                info!("DMA Buffer: loaded");
                info!(
                    "DMA buffer: virt_addr={:p}, phys_addr={:#x}",
                    device.region().cpu_addr(),
                    device.phys_addr()
                );
                self.device = Some(device);
                self.state = DriverState::Live;
                Ok(())
            }
            Err(e) => {
                self.unwind();
                Err(e)
            }
        }
    }

    fn acquire(&mut self) -> DmaResult<DmaBufferDevice<H>> {
        let host = &*self.host;
        let identity = DeviceIdentity::new(host);
        let config = self.config;

        let devno = identity.reserve_number(config.device_name)?;
        self.ledger.record(Acquired::Number(devno));

        let platform = identity.register_logical_device(config.platform_name)?;
        self.ledger.record(Acquired::Device(platform));

        let class = identity.create_class(config.class_name)?;
        self.ledger.record(Acquired::Class(class));

        let node = identity.create_node(class, devno, config.device_name)?;
        self.ledger.record(Acquired::Node { class, devno, node });

        let size = buffer_size(host.page_size());
        let region = CoherentBufferAllocator::new(host, platform)
            .allocate(size)
            .inspect_err(|_| error!("{}: failed to allocate DMA buffer", config.device_name))?;
        self.ledger.record(Acquired::Buffer {
            dev: platform,
            region,
        });

        let registration = DeviceRegistration {
            devno,
            platform,
            class,
            node,
        };
        Ok(DmaBufferDevice::new(self.host.clone(), registration, region))
    }

    /// Releases every held resource, newest first.
    ///
    /// Calling it with nothing held does nothing.
    pub fn unwind(&mut self) {
        self.device = None;
        let released = self.ledger.unwind(&*self.host);
        if released > 0 {
            debug!("{}: released {released} resources", self.config.device_name);
        }
        self.state = DriverState::Unloaded;
    }

    /// Shuts a live device down.
    pub fn stop(&mut self) {
        if self.state == DriverState::Unloaded && self.ledger.is_empty() {
            return;
        }
        self.unwind();
        info!("DMA Buffer: unloaded");
    }
}

impl<H: DmaHost> Drop for DmaBufferDriver<H> {
    fn drop(&mut self) {
        self.unwind();
    }
}
