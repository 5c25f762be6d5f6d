//! Flash styles
//!
//! Various microcontrollers have various types of flash memories available to
//! them.  Each style here describes the internal flash of one family, along
//! with where the application region starts (everything below belongs to the
//! bootloader).

use crate::{Result, SimBlockDevice, SimFlash};

/// The configuration of an internal flash device.
pub struct FlashLayout {
    pub name: &'static str,
    pub base: usize,
    pub page_size: usize,
    /// Runs of sectors, as (count, size).
    pub sectors: &'static [(usize, usize)],
    /// First address of the application region.
    pub app_base: usize,
}

impl FlashLayout {
    pub fn build(&self) -> Result<SimFlash> {
        let sizes: Vec<usize> = self
            .sectors
            .iter()
            .flat_map(|&(count, size)| std::iter::repeat(size).take(count))
            .collect();
        SimFlash::new(self.base, self.page_size, &sizes)
    }

    pub fn capacity(&self) -> usize {
        self.sectors.iter().map(|&(count, size)| count * size).sum()
    }

    /// Bytes available to the application.
    pub fn app_capacity(&self) -> usize {
        self.base + self.capacity() - self.app_base
    }
}

/// STM32F4-style.
/// A few small sectors at the bottom of flash, then one medium and several
/// large ones.  The application starts in the small sectors, so an image of
/// any useful size crosses sectors of three different sizes.
pub static STM32F4: FlashLayout = FlashLayout {
    name: "stm32f4",
    base: 0x0800_0000,
    page_size: 8,
    sectors: &[(4, 16 * 1024), (1, 64 * 1024), (3, 128 * 1024)],
    app_base: 0x0800_8000,
};

/// K64-style.
/// These devices have small uniform sectors.
pub static K64: FlashLayout = FlashLayout {
    name: "k64",
    base: 0,
    page_size: 8,
    sectors: &[(256, 4 * 1024)],
    app_base: 0x8000,
};

/// Page-style devices.  Based on the LPC55S69, where erase and program
/// granularity are the same.
pub static LPC55: FlashLayout = FlashLayout {
    name: "lpc55",
    base: 0,
    page_size: 512,
    sectors: &[(512, 512)],
    app_base: 0x1_0000,
};

/// Large write and large erase, based on the STM32H745.
pub static STM32H7: FlashLayout = FlashLayout {
    name: "stm32h7",
    base: 0x0800_0000,
    page_size: 32,
    sectors: &[(8, 128 * 1024)],
    app_base: 0x0802_0000,
};

/// All of the internal flash styles.
pub static ALL_FLASHES: [&FlashLayout; 4] = [&STM32F4, &K64, &LPC55, &STM32H7];

/// Build each of the internal flash styles in turn.
pub fn all_flashes() -> impl Iterator<Item = Result<(&'static FlashLayout, SimFlash)>> {
    ALL_FLASHES
        .iter()
        .map(|&layout| layout.build().map(|flash| (layout, flash)))
}

/// The configuration of an external block device.
pub struct BlockLayout {
    pub read_size: usize,
    pub pages: usize,
}

impl BlockLayout {
    pub fn build(&self) -> Result<SimBlockDevice> {
        SimBlockDevice::new(self.read_size, self.pages)
    }
}

/// A 4MB DataFlash with 512 byte pages, as found on the update boards.
pub static DATAFLASH: BlockLayout = BlockLayout {
    read_size: 512,
    pages: 8192,
};
