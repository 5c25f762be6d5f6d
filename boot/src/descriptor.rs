//! Update descriptor
//!
//! The companion application queues an update by writing the candidate image
//! to external storage and then a descriptor into a fixed slot.  The
//! bootloader reads the slot once per boot, and zeroes it after every
//! completed update attempt so a bad image is not retried forever.

use core::mem::size_of;

use asraw::{AsMutRaw, AsRaw};
use storage::BlockDevice;

use crate::{config::MAGIC, delta::Region, Error, Result};

/// The descriptor is stored as this C struct, in device byte order.  `N` is
/// the width of the digest, 8 for the checksum and 32 for SHA-256.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct UpdateDescriptor<const N: usize> {
    /// 1 when an update is queued.
    pub update_pending: u8,
    reserved: [u8; 3],
    /// Size of the candidate image, in bytes.
    pub size: u32,
    /// Byte offset of the candidate image in external storage.
    pub offset: u32,
    /// Must be `MAGIC`.
    pub signature: u32,
    /// Expected digest of the candidate image.
    pub digest: [u8; N],
}

impl<const N: usize> AsRaw for UpdateDescriptor<N> {}
unsafe impl<const N: usize> AsMutRaw for UpdateDescriptor<N> {}

impl<const N: usize> UpdateDescriptor<N> {
    /// A digest that isn't a multiple of 4 would leave trailing padding,
    /// which must not be viewed as bytes.
    const NO_PADDING: () = assert!(
        N % 4 == 0 && size_of::<Self>() == 16 + N,
        "digest width leaves padding in the descriptor"
    );

    /// The all-zero record written when the slot is cleared.
    pub fn cleared() -> Self {
        let () = Self::NO_PADDING;
        <Self as AsMutRaw>::zeroed()
    }

    /// A descriptor queuing an update of `size` bytes at `offset`.
    pub fn pending(size: u32, offset: u32, digest: [u8; N]) -> Self {
        UpdateDescriptor {
            update_pending: 1,
            size,
            offset,
            signature: MAGIC,
            digest,
            ..Self::cleared()
        }
    }

    pub fn is_pending(&self) -> bool {
        self.update_pending == 1
    }

    /// Does this describe a queued update.  Anything else, including a
    /// cleared or never written slot, means there is nothing to do.
    pub fn is_valid(&self) -> bool {
        self.signature == MAGIC && self.is_pending()
    }
}

/// Access to the descriptor slot in external storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataStore<const N: usize> {
    slot: usize,
}

impl<const N: usize> MetadataStore<N> {
    /// The slot at byte offset `slot`.
    pub fn new(slot: usize) -> Self {
        MetadataStore { slot }
    }

    /// The slot at the start of device page `page`.
    pub fn at_page<S: BlockDevice + ?Sized>(storage: &S, page: usize) -> Result<Self> {
        let slot = page
            .checked_mul(storage.read_size())
            .ok_or(Error::InvalidRegion)?;
        Ok(Self::new(slot))
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    /// The bytes of external storage the descriptor occupies.
    pub fn region(&self) -> Region {
        Region::new(self.slot, size_of::<UpdateDescriptor<N>>())
    }

    /// Read the slot.  The contents are not interpreted.
    pub fn read<S: BlockDevice + ?Sized>(&self, storage: &mut S) -> Result<UpdateDescriptor<N>> {
        let mut descriptor = UpdateDescriptor::cleared();
        storage
            .read(self.slot, descriptor.as_mut_raw())
            .map_err(Error::Storage)?;
        Ok(descriptor)
    }

    pub fn validate(descriptor: &UpdateDescriptor<N>) -> bool {
        descriptor.is_valid()
    }

    pub fn write<S: BlockDevice + ?Sized>(
        &self,
        storage: &mut S,
        descriptor: &UpdateDescriptor<N>,
    ) -> Result<()> {
        storage
            .program(self.slot, descriptor.as_raw())
            .map_err(Error::Storage)
    }

    /// Overwrite the slot with the all-zero record.
    pub fn clear<S: BlockDevice + ?Sized>(&self, storage: &mut S) -> Result<()> {
        self.write(storage, &UpdateDescriptor::cleared())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout() {
        assert_eq!(size_of::<UpdateDescriptor<8>>(), 24);
        assert_eq!(size_of::<UpdateDescriptor<32>>(), 48);

        let desc = UpdateDescriptor::pending(0x1234, 0x30_0200, [0xab; 32]);
        let raw = desc.as_raw();
        assert_eq!(raw.len(), 48);
        assert_eq!(raw[0], 1);
        assert_eq!(&raw[1..4], &[0, 0, 0]);
        assert_eq!(&raw[4..8], &0x1234u32.to_ne_bytes());
        assert_eq!(&raw[8..12], &0x30_0200u32.to_ne_bytes());
        assert_eq!(&raw[12..16], &MAGIC.to_ne_bytes());
        assert_eq!(&raw[16..], &[0xab; 32]);
    }

    #[test]
    fn validity() {
        let mut desc = UpdateDescriptor::pending(16, 0, [0; 8]);
        assert!(desc.is_valid());

        desc.update_pending = 0;
        assert!(!desc.is_valid());

        // Only exactly 1 counts as pending.
        desc.update_pending = 0xff;
        assert!(!desc.is_valid());

        desc.update_pending = 1;
        desc.signature = 0xffff_ffff;
        assert!(!desc.is_valid());

        assert!(!UpdateDescriptor::<8>::cleared().is_valid());
    }
}
