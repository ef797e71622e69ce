// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Build-time configuration of the DMA buffer device.

/// Name of the device number range and of the visible device node.
pub const DEVICE_NAME: &str = "dma_buffer";
/// Name of the device class the node is created under.
pub const CLASS_NAME: &str = "dma_buffer_class";
/// Name of the platform device that owns the coherent allocation.
pub const PLATFORM_DEVICE_NAME: &str = "dma_dummy";

/// Number of pages in the buffer. The byte size is this times the host page
/// size, 1 MiB on 4 KiB pages.
pub const BUFFER_PAGES: usize = 256;

/// Byte size of the buffer for a host with the given page size.
pub const fn buffer_size(page_size: usize) -> usize {
    page_size * BUFFER_PAGES
}

/// Magic (type) byte of the control codes.
pub const DMA_BUF_IOCTL_MAGIC: u8 = 0xF0;

/// Names under which the device makes itself known to the host.
///
/// The buffer geometry is deliberately absent: it is fixed at
/// [`BUFFER_PAGES`] pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaBufferConfig {
    pub device_name: &'static str,
    pub class_name: &'static str,
    pub platform_name: &'static str,
}

impl DmaBufferConfig {
    pub const DEFAULT: Self = Self {
        device_name: DEVICE_NAME,
        class_name: CLASS_NAME,
        platform_name: PLATFORM_DEVICE_NAME,
    };

    /// Same config with another node name.
    pub const fn with_device_name(mut self, name: &'static str) -> Self {
        self.device_name = name;
        self
    }

    /// Same config with another class name.
    pub const fn with_class_name(mut self, name: &'static str) -> Self {
        self.class_name = name;
        self
    }

    /// Same config with another platform device name.
    pub const fn with_platform_name(mut self, name: &'static str) -> Self {
        self.platform_name = name;
        self
    }
}

impl Default for DmaBufferConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
