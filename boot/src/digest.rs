//! Image digests.

use core::fmt;

use crc::{Crc, CRC_64_XZ};
use sha2::{Digest as _, Sha256};

/// An incremental digest producing `N` bytes.  The verifier feeds an image
/// through this a chunk at a time, so the result must not depend on how the
/// data was split.
pub trait ImageDigest<const N: usize> {
    /// Name for diagnostics.
    const NAME: &'static str;

    fn new() -> Self;
    fn update(&mut self, data: &[u8]);
    fn finalize(self) -> [u8; N];
}

/// The result of a SHA256 hash, appropriate for stack allocation.
pub type Hash256 = [u8; 32];

pub struct Sha256Digest(Sha256);

impl ImageDigest<32> for Sha256Digest {
    const NAME: &'static str = "SHA256";

    fn new() -> Self {
        Sha256Digest(Sha256::new())
    }

    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn finalize(self) -> Hash256 {
        let mut result = [0u8; 32];
        result.copy_from_slice(self.0.finalize().as_slice());
        result
    }
}

pub static CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

/// CRC-64/XZ, stored little endian.
pub struct Crc64Digest(crc::Digest<'static, u64>);

impl ImageDigest<8> for Crc64Digest {
    const NAME: &'static str = "CRC64";

    fn new() -> Self {
        Crc64Digest(CRC64.digest())
    }

    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn finalize(self) -> [u8; 8] {
        self.0.finalize().to_le_bytes()
    }
}

/// Compute the digest of a buffer already in memory.
pub fn digest_of<D: ImageDigest<N>, const N: usize>(data: &[u8]) -> [u8; N] {
    let mut digest = D::new();
    digest.update(data);
    digest.finalize()
}

/// Displays bytes as lowercase hex, for printing digests.
pub struct Hex<'a>(pub &'a [u8]);

impl fmt::Display for Hex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Hex<'_> {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "{=[u8]:x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_known() {
        let hash = digest_of::<Sha256Digest, 32>(b"abc");
        assert_eq!(
            Hex(&hash).to_string(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn crc64_known() {
        let crc = digest_of::<Crc64Digest, 8>(b"123456789");
        assert_eq!(u64::from_le_bytes(crc), 0x995d_c9bb_df19_39fa);
    }

    #[test]
    fn incremental() {
        let mut digest = Sha256Digest::new();
        digest.update(b"a");
        digest.update(b"");
        digest.update(b"bc");
        assert_eq!(digest.finalize(), digest_of::<Sha256Digest, 32>(b"abc"));
    }

    #[test]
    fn hex() {
        assert_eq!(Hex(&[0x00, 0x1b, 0xea, 0xc0]).to_string(), "001beac0");
        assert_eq!(Hex(&[]).to_string(), "");
    }
}
