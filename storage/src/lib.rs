//! Storage device interfaces.
//!
//! Two kinds of device take part in an update.  The external block device
//! holds the update descriptor and the candidate image, and is byte
//! addressable.  The internal flash is the program memory the application
//! runs from; it is addressed absolutely, and is erased in sectors (which may
//! differ in size across the device) and programmed in pages.

#![cfg_attr(not(any(feature = "std", test)), no_std)]

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    #[error("access is not aligned to the device geometry")]
    NotAligned,
    #[error("access is outside of the device")]
    OutOfBounds,
    #[error("programming over data that has not been erased")]
    NotErased,
    #[error("device has not been initialized")]
    NotInitialized,
    #[error("device failure (code {0})")]
    Device(i32),
}

pub type Result<T> = core::result::Result<T, Error>;

/// Read access shared by both kinds of device.
pub trait ReadStorage {
    fn read(&mut self, offset: usize, bytes: &mut [u8]) -> Result<()>;
}

/// The external block device.
pub trait BlockDevice: ReadStorage {
    fn init(&mut self) -> Result<()>;
    fn deinit(&mut self) -> Result<()>;
    /// Size of a device page.  Fixed page indices are converted to byte
    /// offsets with this.
    fn read_size(&self) -> usize;
    fn capacity(&self) -> usize;
    fn program(&mut self, offset: usize, bytes: &[u8]) -> Result<()>;
}

/// Internal program memory.  Addresses are absolute.
pub trait Flash: ReadStorage {
    fn init(&mut self) -> Result<()>;
    fn deinit(&mut self) -> Result<()>;
    /// Program granularity.
    fn page_size(&self) -> usize;
    /// Size of the erase sector containing `address`.
    fn sector_size(&self, address: usize) -> usize;
    fn erase(&mut self, address: usize, length: usize) -> Result<()>;
    fn program(&mut self, address: usize, bytes: &[u8]) -> Result<()>;
}

/// Check that `length` bytes at `offset` fall within `capacity`.
pub fn check_bounds(capacity: usize, offset: usize, length: usize) -> Result<()> {
    if length > capacity || offset > capacity - length {
        return Err(Error::OutOfBounds);
    }
    Ok(())
}

/// Check bounds, and that both offset and length are multiples of `align`.
pub fn check_slice(
    capacity: usize,
    align: usize,
    offset: usize,
    length: usize,
) -> Result<()> {
    check_bounds(capacity, offset, length)?;
    if offset % align != 0 || length % align != 0 {
        return Err(Error::NotAligned);
    }
    Ok(())
}

/// Check a read or program against a block device.  Block devices take any
/// byte range within their capacity.
pub fn check_access<T: BlockDevice + ?Sized>(
    dev: &T,
    offset: usize,
    length: usize,
) -> Result<()> {
    check_bounds(dev.capacity(), offset, length)
}
