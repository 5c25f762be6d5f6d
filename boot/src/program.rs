//! Programming an image into internal flash.
//!
//! The image is streamed from its source one flash page at a time.  Sectors
//! are erased lazily, just before the first page programmed into each, so
//! only the sectors the image actually covers are touched.  The final page is
//! padded with zeros, as flash can only be programmed in whole pages.

use heapless::Vec;
use storage::{Error as StorageError, Flash, ReadStorage};

use crate::{log, progress::Progress, Error, Result};

/// Largest flash page the programmer can buffer.
pub const MAX_PAGE_SIZE: usize = 4096;

/// What an apply did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ApplyStats {
    pub bytes: usize,
    pub pages: usize,
    pub sectors_erased: usize,
}

pub struct FlashProgrammer {
    base: usize,
    progress_interval: usize,
}

impl FlashProgrammer {
    /// Program images starting at flash address `base`, which must be the
    /// start of a sector.
    pub fn new(base: usize) -> Self {
        FlashProgrammer {
            base,
            progress_interval: 5,
        }
    }

    /// Report progress every `pages` pages, and at the end.
    pub fn progress_interval(mut self, pages: usize) -> Self {
        self.progress_interval = pages.max(1);
        self
    }

    pub fn base(&self) -> usize {
        self.base
    }

    /// Copy `total_size` bytes from `source_offset` in `source` to the flash.
    /// The flash is initialized for the duration of the copy, and released
    /// again whether or not the copy succeeds.
    pub fn apply<S, F, P>(
        &self,
        source: &mut S,
        flash: &mut F,
        source_offset: usize,
        total_size: usize,
        progress: &mut P,
    ) -> Result<ApplyStats>
    where
        S: ReadStorage + ?Sized,
        F: Flash + ?Sized,
        P: Progress + ?Sized,
    {
        flash.init().map_err(Error::Flash)?;
        let result = self.stream(source, flash, source_offset, total_size, progress);
        let deinit = flash.deinit().map_err(Error::Flash);
        let stats = result?;
        deinit?;

        log::info!(
            "Programmed {} bytes in {} pages, {} sectors erased",
            stats.bytes,
            stats.pages,
            stats.sectors_erased
        );
        Ok(stats)
    }

    fn stream<S, F, P>(
        &self,
        source: &mut S,
        flash: &mut F,
        source_offset: usize,
        total_size: usize,
        progress: &mut P,
    ) -> Result<ApplyStats>
    where
        S: ReadStorage + ?Sized,
        F: Flash + ?Sized,
        P: Progress + ?Sized,
    {
        let page_size = flash.page_size();
        if page_size == 0 || page_size > MAX_PAGE_SIZE {
            return Err(Error::PageSize(page_size));
        }
        let mut buffer: Vec<u8, MAX_PAGE_SIZE> = Vec::new();
        buffer
            .resize(page_size, 0)
            .map_err(|_| Error::PageSize(page_size))?;

        let mut stats = ApplyStats::default();
        // Everything below this address has been erased.
        let mut erased_to = self.base;

        while stats.bytes < total_size {
            let address = self
                .base
                .checked_add(stats.bytes)
                .ok_or(Error::Flash(StorageError::OutOfBounds))?;
            let from = source_offset
                .checked_add(stats.bytes)
                .ok_or(Error::Storage(StorageError::OutOfBounds))?;
            let todo = (total_size - stats.bytes).min(page_size);

            // A short final read must not leave stale bytes from the previous
            // page in the padding.
            buffer.fill(0);
            source
                .read(from, &mut buffer[..todo])
                .map_err(Error::Storage)?;

            if address >= erased_to {
                let sector = flash.sector_size(address);
                if sector == 0 {
                    return Err(Error::Flash(StorageError::OutOfBounds));
                }
                log::trace!("Erasing sector 0x{:x} ({} bytes)", address, sector);
                flash.erase(address, sector).map_err(Error::Flash)?;
                erased_to = address + sector;
                stats.sectors_erased += 1;
            }

            flash.program(address, &buffer).map_err(Error::Flash)?;
            stats.bytes += todo;
            stats.pages += 1;

            if stats.pages % self.progress_interval == 0 || stats.bytes == total_size {
                progress.report(stats.bytes, total_size);
            }
        }

        Ok(stats)
    }
}
