//! AsRaw provides a safe way to view a fixed-layout record as its bytes, and
//! an unsafe way to get a mutable view of it.  Records stored on a device are
//! read straight into the mutable view and written from the shared one.  This
//! is only meaningful for `repr(C)` structures without implicit padding.

#![cfg_attr(not(any(feature = "std", test)), no_std)]

use core::{mem, slice};

pub trait AsRaw: Sized {
    /// Number of bytes in the raw view.
    const RAW_SIZE: usize = mem::size_of::<Self>();

    fn as_raw(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self as *const _ as *const u8, Self::RAW_SIZE) }
    }
}

/// Provide a mutable view into a structure.  This is an unsafe trait, because,
/// in general, it isn't safe to interpret arbitrary bytes as another type.
/// Implementing it asserts that the struct is `repr(C)`, and that every field
/// is valid for all possible bit patterns (so no `bool`, enums or references).
pub unsafe trait AsMutRaw: Sized {
    fn as_mut_raw(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self as *mut _ as *mut u8, mem::size_of::<Self>()) }
    }

    /// A record with every byte zero.
    fn zeroed() -> Self {
        // All bit patterns are valid by the contract of this trait.
        unsafe { mem::zeroed() }
    }
}
