//! Delta updates.
//!
//! A delta update stores a binary patch against the running application
//! rather than a whole image.  Before the patch can be applied, the running
//! image is copied out of internal flash into a scratch area of external
//! storage, where the patcher combines it with the patch to rebuild the new
//! image.  The patch format itself belongs to the `Patcher`.
//!
//! Once a backup is complete a marker is written after it, naming the patch
//! it was taken for.  An attempt that fails after flash has been touched is
//! retried from that backup, never from the partly written application.

use core::mem::size_of;

use asraw::{AsMutRaw, AsRaw};
use storage::{BlockDevice, Flash};

use crate::{log, Error, Result};

/// Size of the chunks the backup is copied in.
pub const BACKUP_CHUNK: usize = 512;

/// Signature of a completed backup.
pub const BACKUP_MAGIC: u32 = 0x1BEA_C0B5;

/// A byte range of external storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Region {
    pub offset: usize,
    pub size: usize,
}

impl Region {
    pub fn new(offset: usize, size: usize) -> Self {
        Region { offset, size }
    }

    /// One past the last byte, if that is representable.
    pub fn end(&self) -> Option<usize> {
        self.offset.checked_add(self.size)
    }

    /// Do the two ranges share a byte.  Empty ranges share nothing.
    pub fn overlaps(&self, other: &Region) -> bool {
        let end = self.offset.saturating_add(self.size);
        let other_end = other.offset.saturating_add(other.size);
        self.size > 0 && other.size > 0 && self.offset < other_end && other.offset < end
    }
}

/// Where the delta path keeps its working copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaLayout {
    /// Offset of the scratch area in external storage.
    pub scratch_offset: usize,
    /// Bytes of the running image to back up.
    pub image_size: usize,
}

impl DeltaLayout {
    pub fn scratch(&self) -> Region {
        Region::new(self.scratch_offset, self.image_size)
    }

    /// Where the backup marker lives, just past the scratch copy.
    pub fn marker_offset(&self) -> Option<usize> {
        self.scratch().end()
    }

    /// Everything the delta path writes to: the scratch copy and its marker.
    pub fn footprint<const N: usize>(&self) -> Option<Region> {
        let size = self
            .image_size
            .checked_add(size_of::<BackupMarker<N>>())?;
        let region = Region::new(self.scratch_offset, size);
        region.end()?;
        Some(region)
    }
}

/// Written after a complete backup.  `N` is the width of the update digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct BackupMarker<const N: usize> {
    /// `BACKUP_MAGIC` once the backup is complete.
    pub signature: u32,
    /// Bytes backed up.
    pub size: u32,
    /// Digest of the patch the backup was taken for.
    pub digest: [u8; N],
}

impl<const N: usize> AsRaw for BackupMarker<N> {}
unsafe impl<const N: usize> AsMutRaw for BackupMarker<N> {}

impl<const N: usize> BackupMarker<N> {
    const NO_PADDING: () = assert!(
        N % 4 == 0 && size_of::<Self>() == 8 + N,
        "digest width leaves padding in the backup marker"
    );

    pub fn cleared() -> Self {
        let () = Self::NO_PADDING;
        <Self as AsMutRaw>::zeroed()
    }

    pub fn complete(size: u32, digest: [u8; N]) -> Self {
        BackupMarker {
            signature: BACKUP_MAGIC,
            size,
            digest,
        }
    }

    /// Is this a complete backup of `size` bytes, taken for the patch with
    /// `digest`.
    pub fn covers(&self, size: usize, digest: &[u8; N]) -> bool {
        self.signature == BACKUP_MAGIC && self.size as usize == size && self.digest == *digest
    }
}

/// Rebuilds a new image from the backed-up `base` and a verified `patch`,
/// both in external storage.  Returns the region holding the result, from
/// which it will be programmed.
pub trait Patcher {
    fn patch<S: BlockDevice + ?Sized>(
        &mut self,
        storage: &mut S,
        base: Region,
        patch: Region,
    ) -> Result<Region>;
}

/// For builds without a patch algorithm.  Any delta update fails.
pub struct NoPatch;

impl Patcher for NoPatch {
    fn patch<S: BlockDevice + ?Sized>(
        &mut self,
        _storage: &mut S,
        _base: Region,
        _patch: Region,
    ) -> Result<Region> {
        Err(Error::Patch)
    }
}

pub struct DeltaBackup {
    app_base: usize,
}

impl DeltaBackup {
    pub fn new(app_base: usize) -> Self {
        DeltaBackup { app_base }
    }

    /// Copy `scratch.size` bytes of the running application into `scratch`.
    /// The copy is byte for byte; nothing is interpreted.
    pub fn backup_running_image<F, S>(
        &self,
        flash: &mut F,
        storage: &mut S,
        scratch: Region,
    ) -> Result<()>
    where
        F: Flash + ?Sized,
        S: BlockDevice + ?Sized,
    {
        match scratch.end() {
            Some(end) if end <= storage.capacity() => (),
            _ => return Err(Error::InvalidRegion),
        }

        log::info!(
            "Backing up {} bytes of the running image to 0x{:x}",
            scratch.size,
            scratch.offset
        );

        flash.init().map_err(Error::Flash)?;
        let result = self.copy(flash, storage, scratch);
        let deinit = flash.deinit().map_err(Error::Flash);
        result?;
        deinit
    }

    /// Make sure the scratch area of `layout` holds the running image, as it
    /// was before the patch with `digest` was first applied.  A backup left
    /// complete by an earlier attempt is kept; otherwise the image is copied
    /// and the marker written.
    pub fn ensure_backup<F, S, const N: usize>(
        &self,
        flash: &mut F,
        storage: &mut S,
        layout: &DeltaLayout,
        digest: &[u8; N],
    ) -> Result<()>
    where
        F: Flash + ?Sized,
        S: BlockDevice + ?Sized,
    {
        let footprint = layout.footprint::<N>().ok_or(Error::InvalidRegion)?;
        match footprint.end() {
            Some(end) if end <= storage.capacity() => (),
            _ => return Err(Error::InvalidRegion),
        }
        let marker_at = layout.marker_offset().ok_or(Error::InvalidRegion)?;
        let size = u32::try_from(layout.image_size).map_err(|_| Error::InvalidRegion)?;

        let mut marker = BackupMarker::<N>::cleared();
        storage
            .read(marker_at, marker.as_mut_raw())
            .map_err(Error::Storage)?;
        if marker.covers(layout.image_size, digest) {
            log::info!("Reusing the backup at 0x{:x}", layout.scratch_offset);
            return Ok(());
        }

        self.backup_running_image(flash, storage, layout.scratch())?;
        storage
            .program(marker_at, BackupMarker::complete(size, *digest).as_raw())
            .map_err(Error::Storage)
    }

    /// Forget the backup, once its update is finished with.
    pub fn release<S, const N: usize>(&self, storage: &mut S, layout: &DeltaLayout) -> Result<()>
    where
        S: BlockDevice + ?Sized,
    {
        let marker_at = layout.marker_offset().ok_or(Error::InvalidRegion)?;
        storage
            .program(marker_at, BackupMarker::<N>::cleared().as_raw())
            .map_err(Error::Storage)
    }

    fn copy<F, S>(&self, flash: &mut F, storage: &mut S, scratch: Region) -> Result<()>
    where
        F: Flash + ?Sized,
        S: BlockDevice + ?Sized,
    {
        let mut buffer = [0u8; BACKUP_CHUNK];
        let mut pos = 0;
        while pos < scratch.size {
            let todo = (scratch.size - pos).min(buffer.len());
            let buf = &mut buffer[..todo];
            let from = self
                .app_base
                .checked_add(pos)
                .ok_or(Error::InvalidRegion)?;
            flash.read(from, buf).map_err(Error::Flash)?;
            storage
                .program(scratch.offset + pos, buf)
                .map_err(Error::Storage)?;
            pos += todo;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simflash::{SimBlockDevice, SimFlash};

    #[test]
    fn region_end() {
        assert_eq!(Region::new(10, 20).end(), Some(30));
        assert_eq!(Region::new(usize::MAX, 1).end(), None);
    }

    #[test]
    fn region_overlap() {
        let a = Region::new(100, 50);
        assert!(a.overlaps(&Region::new(149, 10)));
        assert!(a.overlaps(&Region::new(0, 101)));
        assert!(a.overlaps(&Region::new(120, 1)));
        assert!(!a.overlaps(&Region::new(150, 10)));
        assert!(!a.overlaps(&Region::new(0, 100)));
        assert!(!a.overlaps(&Region::new(120, 0)));
        assert!(Region::new(usize::MAX - 1, 10).overlaps(&Region::new(usize::MAX - 1, 1)));
    }

    #[test]
    fn marker_layout() {
        assert_eq!(size_of::<BackupMarker<8>>(), 16);
        assert_eq!(size_of::<BackupMarker<32>>(), 40);

        let layout = DeltaLayout {
            scratch_offset: 0x1000,
            image_size: 0x800,
        };
        assert_eq!(layout.marker_offset(), Some(0x1800));
        assert_eq!(layout.footprint::<32>(), Some(Region::new(0x1000, 0x828)));

        let marker = BackupMarker::complete(0x800, [7; 8]);
        assert!(marker.covers(0x800, &[7; 8]));
        assert!(!marker.covers(0x801, &[7; 8]));
        assert!(!marker.covers(0x800, &[8; 8]));
        assert!(!BackupMarker::<8>::cleared().covers(0, &[0; 8]));
    }

    #[test]
    fn backup_is_kept_for_its_patch() {
        let mut flash = SimFlash::new(0, 16, &[2048]).unwrap();
        let running: Vec<u8> = (0..1024).map(|i| (i % 13) as u8).collect();
        flash.install(0, &running).unwrap();
        let mut bd = SimBlockDevice::new(512, 8).unwrap();
        bd.init().unwrap();

        let layout = DeltaLayout {
            scratch_offset: 512,
            image_size: 1024,
        };
        let backup = DeltaBackup::new(0);
        backup
            .ensure_backup(&mut flash, &mut bd, &layout, &[1; 8])
            .unwrap();
        assert_eq!(bd.slice(512, 1024), &running[..]);
        assert_eq!(bd.slice(1536, 16), BackupMarker::complete(1024, [1; 8]).as_raw());

        // The application changes under the backup; the copy stays.
        flash.install(0, &[0xee; 1024]).unwrap();
        let programs = bd.programs().len();
        backup
            .ensure_backup(&mut flash, &mut bd, &layout, &[1; 8])
            .unwrap();
        assert_eq!(bd.programs().len(), programs);
        assert_eq!(bd.slice(512, 1024), &running[..]);

        // A different patch takes a fresh copy.
        backup
            .ensure_backup(&mut flash, &mut bd, &layout, &[2; 8])
            .unwrap();
        assert_eq!(bd.slice(512, 1024), &[0xee; 1024][..]);

        backup.release::<_, 8>(&mut bd, &layout).unwrap();
        assert!(bd.slice(1536, 16).iter().all(|&b| b == 0));
    }

    #[test]
    fn marker_must_fit() {
        let mut flash = SimFlash::new(0, 16, &[1024]).unwrap();
        let mut bd = SimBlockDevice::new(512, 2).unwrap();
        bd.init().unwrap();

        // The copy itself fits, its marker does not.
        let layout = DeltaLayout {
            scratch_offset: 0,
            image_size: 1024,
        };
        assert_eq!(
            DeltaBackup::new(0).ensure_backup(&mut flash, &mut bd, &layout, &[0; 8]),
            Err(Error::InvalidRegion)
        );
        assert!(bd.programs().is_empty());
    }

    #[test]
    fn backup_copies_running_image() {
        let mut flash = SimFlash::new(0x1000, 16, &[1024, 1024]).unwrap();
        let image: Vec<u8> = (0..1500).map(|i| (i % 251) as u8).collect();
        flash.install(0x1000, &image).unwrap();

        let mut bd = SimBlockDevice::new(512, 8).unwrap();
        bd.init().unwrap();

        let backup = DeltaBackup::new(0x1000);
        backup
            .backup_running_image(&mut flash, &mut bd, Region::new(512, 1500))
            .unwrap();

        assert_eq!(bd.slice(512, 1500), &image[..]);
        assert_eq!(bd.programs(), &[(512, 512), (1024, 512), (1536, 476)]);
        assert!(flash.ops().is_empty());
        assert!(!flash.is_initialized());
    }

    #[test]
    fn scratch_must_fit() {
        let mut flash = SimFlash::new(0, 16, &[1024]).unwrap();
        let mut bd = SimBlockDevice::new(512, 2).unwrap();
        bd.init().unwrap();

        let backup = DeltaBackup::new(0);
        assert_eq!(
            backup.backup_running_image(&mut flash, &mut bd, Region::new(512, 1024)),
            Err(Error::InvalidRegion)
        );
        assert!(bd.programs().is_empty());
    }

    #[test]
    fn no_patch() {
        let mut bd = SimBlockDevice::new(512, 2).unwrap();
        assert_eq!(
            NoPatch.patch(&mut bd, Region::new(0, 1), Region::new(1, 1)),
            Err(Error::Patch)
        );
    }
}
