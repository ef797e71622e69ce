// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! A single physically-contiguous, cache-coherent DMA buffer exposed through
//! a character device.
//!
//! The buffer is allocated once when the device is started and released when
//! it is stopped or when any start step fails. Callers reach it through
//! [`DmaBufferDevice`]: an ioctl returns the bus address a DMA-capable
//! peripheral should be programmed with, and mmap shares the buffer with the
//! caller's address space.
//!
//! All platform primitives are reached through the traits in [`host`].
#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate log;

extern crate alloc;

mod error;

pub mod coherent;
pub mod config;
pub mod control;
pub mod host;
pub mod identity;
pub mod ledger;
pub mod lifecycle;

pub use self::{
    coherent::{CoherentRegion, DmaBusAddress},
    config::DmaBufferConfig,
    control::{DMA_BUF_IOCTL_GET_PHYS_ADDR, DmaBufferDevice, FileOps},
    error::{DmaError, DmaErrorKind, DmaResult},
    host::DmaHost,
    ledger::AcquireStep,
    lifecycle::{DmaBufferDriver, DriverState},
};

#[doc(hidden)]
pub mod __priv {
    pub use log::warn;
}
