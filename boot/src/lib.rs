//! This is an update bootloader built for embedded rust.
//!
//! On every reset it looks in external storage for a pending firmware image,
//! verifies it against the digest stored in the update descriptor, programs
//! it into internal flash, and then hands control to the application.  The
//! pipeline is parameterised by the digest algorithm, and can optionally
//! back up the running image for a patch based (delta) update.

#![cfg_attr(not(any(feature = "std", test)), no_std)]

mod bootloader;
pub mod config;
pub mod delta;
pub mod descriptor;
pub mod digest;
pub mod launch;
pub mod program;
pub mod progress;
pub mod verify;

pub use bootloader::{BootReport, BootState, Bootloader, Outcome, MAX_TRACE};
pub use config::{BootConfig, ImageLocation, IMAGE_PAGE, INFO_PAGE, MAGIC};
pub use delta::{BackupMarker, DeltaBackup, DeltaLayout, NoPatch, Patcher, Region};
pub use descriptor::{MetadataStore, UpdateDescriptor};
pub use digest::{Crc64Digest, Hex, ImageDigest, Sha256Digest};
pub use launch::Launcher;
pub use program::{ApplyStats, FlashProgrammer};
pub use progress::{LogProgress, NoProgress, Progress};
pub use verify::{StreamVerifier, Verdict};

/// The pipeline verifying with SHA-256.
pub type Sha256Bootloader<S, F, P = NoPatch> = Bootloader<S, F, Sha256Digest, 32, P>;
/// The pipeline verifying with a 64-bit checksum.
pub type Crc64Bootloader<S, F, P = NoPatch> = Bootloader<S, F, Crc64Digest, 8, P>;

pub type Result<T> = core::result::Result<T, Error>;

// Keep the device that failed, as the recovery differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    #[error("external storage: {0}")]
    Storage(storage::Error),
    #[error("internal flash: {0}")]
    Flash(storage::Error),
    #[error("unsupported flash page size {0}")]
    PageSize(usize),
    #[error("image region does not fit in storage")]
    InvalidRegion,
    #[error("programmed image does not match its digest")]
    ReadBack,
    #[error("patch could not be applied")]
    Patch,
}

// Logging goes to defmt on target, the log crate on a host, or nowhere.
#[cfg(feature = "defmt")]
pub(crate) use defmt as log;

#[cfg(all(feature = "log", not(feature = "defmt")))]
pub(crate) use log_crate as log;

#[cfg(not(any(feature = "log", feature = "defmt")))]
pub(crate) mod log {
    macro_rules! discard {
        ($($arg:expr),* $(,)?) => {{
            $( let _ = &$arg; )*
        }};
    }
    pub(crate) use discard as trace;
    pub(crate) use discard as debug;
    pub(crate) use discard as info;
    pub(crate) use discard as warn;
    pub(crate) use discard as error;
}
