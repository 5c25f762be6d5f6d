//! Bootloader configuration.
//!
//! The storage layout is fixed at build time: the descriptor lives at a known
//! page of external storage, and the application at a known address of
//! internal flash.

use crate::delta::DeltaLayout;

/// Signature identifying a valid update descriptor.
pub const MAGIC: u32 = 0x1BEA_C000;

/// External storage page holding the update descriptor.
pub const INFO_PAGE: usize = 0x1800;

/// External storage page where the image starts, for layouts that do not
/// carry an offset in the descriptor.
pub const IMAGE_PAGE: usize = 0x1801;

/// Size of the signature block carried in front of signed images.
pub const SIGNATURE_BLOCK_SIZE: usize = 256;

/// Where in external storage the candidate image starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageLocation {
    /// At a fixed page, whatever the descriptor says.
    FixedPage(usize),
    /// At the byte offset given in the descriptor.
    Descriptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootConfig {
    /// Entry of the installed application, and where updates are written.
    pub application_addr: usize,
    pub info_page: usize,
    pub image_location: ImageLocation,
    /// Leading bytes of the image excluded from the digest.
    pub reserved_prefix: usize,
    /// Read the image back from flash after programming and check its digest.
    pub verify_written: bool,
    /// Report progress every this many programmed pages.
    pub progress_interval: usize,
    /// Back up the running image and patch it, instead of installing the
    /// stored image directly.
    pub delta: Option<DeltaLayout>,
}

impl BootConfig {
    pub fn builder(application_addr: usize) -> BootConfigBuilder {
        BootConfigBuilder {
            config: BootConfig {
                application_addr,
                info_page: INFO_PAGE,
                image_location: ImageLocation::Descriptor,
                reserved_prefix: 0,
                verify_written: true,
                progress_interval: 5,
                delta: None,
            },
        }
    }
}

pub struct BootConfigBuilder {
    config: BootConfig,
}

impl BootConfigBuilder {
    pub fn info_page(&mut self, page: usize) -> &mut Self {
        self.config.info_page = page;
        self
    }

    pub fn image_location(&mut self, location: ImageLocation) -> &mut Self {
        self.config.image_location = location;
        self
    }

    pub fn reserved_prefix(&mut self, bytes: usize) -> &mut Self {
        self.config.reserved_prefix = bytes;
        self
    }

    pub fn verify_written(&mut self, verify: bool) -> &mut Self {
        self.config.verify_written = verify;
        self
    }

    pub fn progress_interval(&mut self, pages: usize) -> &mut Self {
        self.config.progress_interval = pages.max(1);
        self
    }

    pub fn delta(&mut self, layout: DeltaLayout) -> &mut Self {
        self.config.delta = Some(layout);
        self
    }

    pub fn build(&self) -> BootConfig {
        self.config
    }
}
