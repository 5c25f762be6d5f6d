//! The boot sequence.
//!
//! Each reset runs through a small state machine.  Verification always comes
//! before any write to internal flash, and every failure ends in booting
//! whatever application is currently installed.  The descriptor is cleared
//! after every attempt that reached a verdict and ran to completion, so a bad
//! image is never retried; an attempt cut short by a read or flash error
//! leaves it in place to be retried from the still intact external copy.
//! An update that passed verification but can never be applied, such as a
//! patch the patcher refuses, is discarded like a mismatch.

use core::marker::PhantomData;

use heapless::Vec;
use storage::{BlockDevice, Flash};

use crate::{
    config::{BootConfig, ImageLocation},
    delta::{DeltaBackup, NoPatch, Patcher, Region},
    descriptor::{MetadataStore, UpdateDescriptor},
    digest::{Hex, ImageDigest},
    launch::Launcher,
    log,
    program::{ApplyStats, FlashProgrammer},
    progress::{LogProgress, Progress},
    verify::{StreamVerifier, Verdict},
    Error, Result,
};

/// Longest trace a run can record.
pub const MAX_TRACE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BootState {
    Init,
    CheckStorage,
    StorageFailed,
    CheckMetadata,
    NoUpdate,
    Verify,
    VerifyFailed,
    Mismatch,
    Match,
    Apply,
    ApplyFailed,
    Unusable,
    ClearMetadata,
    Boot,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Outcome {
    /// External storage could not be initialized.
    StorageUnavailable,
    /// No update was queued.
    NoUpdate,
    /// The candidate failed verification, or could never be applied, and
    /// was discarded.
    Rejected,
    /// The candidate was verified and installed.
    Installed,
    /// The candidate could not be read; it will be checked again next boot.
    VerifyFailed,
    /// Installing failed part way; it will be retried next boot.
    ApplyFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootReport {
    pub outcome: Outcome,
    /// States visited, in order, ending with `Boot`.
    pub trace: Vec<BootState, MAX_TRACE>,
    /// Where the application will be started.
    pub entry: usize,
    pub stats: Option<ApplyStats>,
    pub metadata_cleared: bool,
}

impl BootReport {
    pub fn visited(&self, state: BootState) -> bool {
        self.trace.contains(&state)
    }
}

/// The update pipeline, owning both devices.  `D` is the digest the
/// descriptor carries, `N` its width in bytes.
pub struct Bootloader<S, F, D, const N: usize, P = NoPatch> {
    storage: S,
    flash: F,
    config: BootConfig,
    patcher: P,
    digest: PhantomData<D>,
}

impl<S, F, D, const N: usize> Bootloader<S, F, D, N, NoPatch> {
    pub fn new(storage: S, flash: F, config: BootConfig) -> Self {
        Bootloader {
            storage,
            flash,
            config,
            patcher: NoPatch,
            digest: PhantomData,
        }
    }
}

impl<S, F, D, const N: usize, P> Bootloader<S, F, D, N, P> {
    /// Use `patcher` for delta updates.
    pub fn with_patcher<Q: Patcher>(self, patcher: Q) -> Bootloader<S, F, D, N, Q> {
        Bootloader {
            storage: self.storage,
            flash: self.flash,
            config: self.config,
            patcher,
            digest: PhantomData,
        }
    }

    pub fn config(&self) -> &BootConfig {
        &self.config
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn patcher(&self) -> &P {
        &self.patcher
    }

    pub fn into_parts(self) -> (S, F) {
        (self.storage, self.flash)
    }
}

impl<S, F, D, const N: usize, P> Bootloader<S, F, D, N, P>
where
    S: BlockDevice,
    F: Flash,
    D: ImageDigest<N>,
    P: Patcher,
{
    /// Run the update sequence, stopping short of starting the application.
    pub fn run<G: Progress + ?Sized>(&mut self, progress: &mut G) -> BootReport {
        let mut report = BootReport {
            outcome: Outcome::NoUpdate,
            trace: Vec::new(),
            entry: self.config.application_addr,
            stats: None,
            metadata_cleared: false,
        };
        let mut store = MetadataStore::<N>::new(0);
        let mut descriptor = UpdateDescriptor::<N>::cleared();
        let mut candidate = Region::new(0, 0);

        let mut state = BootState::Init;
        loop {
            let pushed = report.trace.push(state);
            debug_assert!(pushed.is_ok(), "boot trace overflow");

            state = match state {
                BootState::Init => {
                    log::info!("Hello from the bootloader");
                    BootState::CheckStorage
                }
                BootState::CheckStorage => match self.storage.init() {
                    Ok(()) => BootState::CheckMetadata,
                    Err(e) => {
                        log::error!("Unable to initialize storage: {}", e);
                        BootState::StorageFailed
                    }
                },
                BootState::StorageFailed => {
                    report.outcome = Outcome::StorageUnavailable;
                    BootState::Boot
                }
                BootState::CheckMetadata => match self.read_descriptor() {
                    Ok((slot, d)) if MetadataStore::validate(&d) => {
                        store = slot;
                        descriptor = d;
                        BootState::Verify
                    }
                    Ok(_) => BootState::NoUpdate,
                    Err(e) => {
                        log::error!("Unable to read the update descriptor: {}", e);
                        BootState::NoUpdate
                    }
                },
                BootState::NoUpdate => {
                    log::info!("No pending update");
                    report.outcome = Outcome::NoUpdate;
                    BootState::Boot
                }
                BootState::Verify => match self.image_region(&store, &descriptor) {
                    Some(region) => {
                        candidate = region;
                        self.verify(&descriptor, region)
                    }
                    None => {
                        log::warn!(
                            "Update of {} bytes at 0x{:x} does not fit",
                            descriptor.size,
                            descriptor.offset
                        );
                        BootState::Mismatch
                    }
                },
                BootState::VerifyFailed => {
                    report.outcome = Outcome::VerifyFailed;
                    BootState::Boot
                }
                BootState::Mismatch => {
                    report.outcome = Outcome::Rejected;
                    BootState::ClearMetadata
                }
                BootState::Match => BootState::Apply,
                BootState::Apply => match self.apply(&store, &descriptor, candidate, &mut *progress) {
                    Ok(stats) => {
                        report.outcome = Outcome::Installed;
                        report.stats = Some(stats);
                        BootState::ClearMetadata
                    }
                    // Raised before flash is touched, and the same on every retry.
                    Err(e @ (Error::Patch | Error::InvalidRegion)) => {
                        log::error!("Update cannot be applied: {}", e);
                        BootState::Unusable
                    }
                    Err(e) => {
                        log::error!("Update failed: {}", e);
                        BootState::ApplyFailed
                    }
                },
                BootState::ApplyFailed => {
                    report.outcome = Outcome::ApplyFailed;
                    BootState::Boot
                }
                BootState::Unusable => {
                    report.outcome = Outcome::Rejected;
                    BootState::ClearMetadata
                }
                BootState::ClearMetadata => {
                    match store.clear(&mut self.storage) {
                        Ok(()) => {
                            log::info!("Cleared update descriptor");
                            report.metadata_cleared = true;
                        }
                        Err(e) => log::error!("Unable to clear the update descriptor: {}", e),
                    }
                    // A still pending update must find its backup again.
                    if report.metadata_cleared && report.visited(BootState::Apply) {
                        self.release_backup();
                    }
                    BootState::Boot
                }
                BootState::Boot => break,
            };
        }

        report
    }

    /// Run the update sequence and start the application.
    pub fn boot<L: Launcher + ?Sized>(mut self, launcher: &mut L) -> ! {
        let report = self.run(&mut LogProgress);

        log::info!("Starting the application at 0x{:x}", report.entry);
        if report.outcome != Outcome::StorageUnavailable {
            if let Err(e) = self.storage.deinit() {
                log::warn!("Unable to release storage: {}", e);
            }
        }
        launcher.launch(report.entry)
    }

    fn read_descriptor(&mut self) -> Result<(MetadataStore<N>, UpdateDescriptor<N>)> {
        let store = MetadataStore::at_page(&self.storage, self.config.info_page)?;
        let d = store.read(&mut self.storage)?;
        log::debug!(
            "Descriptor at 0x{:x}: pending {} size {} offset 0x{:x} signature 0x{:x} digest {}",
            store.slot(),
            d.update_pending,
            d.size,
            d.offset,
            d.signature,
            Hex(&d.digest)
        );
        Ok((store, d))
    }

    /// Where the candidate is, if the descriptor describes something that
    /// could be installed at all.
    fn image_region(
        &self,
        store: &MetadataStore<N>,
        descriptor: &UpdateDescriptor<N>,
    ) -> Option<Region> {
        let offset = match self.config.image_location {
            ImageLocation::FixedPage(page) => page.checked_mul(self.storage.read_size())?,
            ImageLocation::Descriptor => descriptor.offset as usize,
        };
        let region = Region::new(offset, descriptor.size as usize);
        if region.size <= self.config.reserved_prefix
            || region.end()? > self.storage.capacity()
            || region.overlaps(&store.region())
        {
            return None;
        }
        match self.config.delta {
            None if !self.fits_flash(region.size) => return None,
            None => (),
            // The backup must not land on the patch or the descriptor.
            Some(layout) => {
                let footprint = layout.footprint::<N>()?;
                if footprint.end()? > self.storage.capacity()
                    || footprint.overlaps(&region)
                    || footprint.overlaps(&store.region())
                {
                    return None;
                }
            }
        }
        Some(region)
    }

    /// Would an image of `size` bytes fit in flash above the application
    /// address.
    fn fits_flash(&self, size: usize) -> bool {
        match self.config.application_addr.checked_add(size - 1) {
            Some(last) => self.flash.sector_size(last) != 0,
            None => false,
        }
    }

    fn verify(&mut self, descriptor: &UpdateDescriptor<N>, region: Region) -> BootState {
        let prefix = self.config.reserved_prefix;
        log::info!(
            "Verifying {} bytes at 0x{:x} ({})",
            region.size - prefix,
            region.offset + prefix,
            D::NAME
        );
        match StreamVerifier::<D>::verify(
            &mut self.storage,
            region.offset + prefix,
            region.size - prefix,
            &descriptor.digest,
        ) {
            Ok(Verdict::Match) => {
                log::info!("Digest matches");
                BootState::Match
            }
            Ok(Verdict::Mismatch { expected, computed }) => {
                log::warn!(
                    "Digest mismatch: expected {}, computed {}",
                    Hex(&expected),
                    Hex(&computed)
                );
                BootState::Mismatch
            }
            Err(e) => {
                log::error!("Unable to read the update: {}", e);
                BootState::VerifyFailed
            }
        }
    }

    fn apply<G: Progress + ?Sized>(
        &mut self,
        store: &MetadataStore<N>,
        descriptor: &UpdateDescriptor<N>,
        candidate: Region,
        progress: &mut G,
    ) -> Result<ApplyStats> {
        let app = self.config.application_addr;
        let source = match self.config.delta {
            None => candidate,
            Some(layout) => {
                DeltaBackup::new(app).ensure_backup(
                    &mut self.flash,
                    &mut self.storage,
                    &layout,
                    &descriptor.digest,
                )?;
                let image = self
                    .patcher
                    .patch(&mut self.storage, layout.scratch(), candidate)?;

                // A retry needs the patch, the backup and the descriptor intact.
                let footprint = layout.footprint::<N>().ok_or(Error::InvalidRegion)?;
                let clobbers = image.overlaps(&candidate)
                    || image.overlaps(&footprint)
                    || image.overlaps(&store.region());
                match image.end() {
                    Some(end)
                        if image.size > 0
                            && !clobbers
                            && end <= self.storage.capacity()
                            && self.fits_flash(image.size) => {}
                    _ => return Err(Error::InvalidRegion),
                }
                image
            }
        };

        let stats = FlashProgrammer::new(app)
            .progress_interval(self.config.progress_interval)
            .apply(
                &mut self.storage,
                &mut self.flash,
                source.offset,
                source.size,
                progress,
            )?;

        // The digest of a delta update covers the patch, not the result.
        if self.config.verify_written && self.config.delta.is_none() {
            self.check_written(descriptor, source.size)?;
        }
        Ok(stats)
    }

    /// Drop the delta backup marker, so the next update takes a fresh copy.
    fn release_backup(&mut self) {
        if let Some(layout) = self.config.delta {
            let backup = DeltaBackup::new(self.config.application_addr);
            if let Err(e) = backup.release::<_, N>(&mut self.storage, &layout) {
                log::warn!("Unable to release the delta backup: {}", e);
            }
        }
    }

    /// Read the programmed image back and compare its digest.
    fn check_written(&mut self, descriptor: &UpdateDescriptor<N>, size: usize) -> Result<()> {
        let prefix = self.config.reserved_prefix;
        let start = self.config.application_addr + prefix;

        self.flash.init().map_err(Error::Flash)?;
        let result: storage::Result<[u8; N]> =
            StreamVerifier::<D>::calculate(&mut self.flash, start, size - prefix);
        let deinit = self.flash.deinit().map_err(Error::Flash);
        let computed = result.map_err(Error::Flash)?;
        deinit?;

        if computed != descriptor.digest {
            log::error!(
                "Programmed image digest {} does not match {}",
                Hex(&computed),
                Hex(&descriptor.digest)
            );
            return Err(Error::ReadBack);
        }
        log::info!("Programmed image verified");
        Ok(())
    }
}
