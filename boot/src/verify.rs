//! Streaming verification.
//!
//! Images are much larger than the RAM available to the bootloader, so they
//! are never held in memory.  The digest is computed by reading the image a
//! chunk at a time through one fixed buffer.

use core::marker::PhantomData;

use storage::{Error, ReadStorage};

use crate::digest::ImageDigest;

/// Default size of the read buffer.  Independent of any device page size.
pub const CHUNK_SIZE: usize = 512;

/// The outcome of comparing an image against its expected digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict<const N: usize> {
    Match,
    Mismatch { expected: [u8; N], computed: [u8; N] },
}

/// Computes digests of type `D` over any readable storage, through a buffer
/// of `CHUNK` bytes.
pub struct StreamVerifier<D, const CHUNK: usize = CHUNK_SIZE> {
    _digest: PhantomData<D>,
}

impl<D, const CHUNK: usize> StreamVerifier<D, CHUNK> {
    /// Digest `length` bytes of `source` starting at `offset`.
    pub fn calculate<R, const N: usize>(
        source: &mut R,
        offset: usize,
        length: usize,
    ) -> storage::Result<[u8; N]>
    where
        D: ImageDigest<N>,
        R: ReadStorage + ?Sized,
    {
        let mut digest = D::new();
        let mut buffer = [0u8; CHUNK];
        let mut pos = 0;
        while pos < length {
            let todo = (length - pos).min(buffer.len());
            let buf = &mut buffer[..todo];
            let at = offset.checked_add(pos).ok_or(Error::OutOfBounds)?;
            source.read(at, buf)?;
            digest.update(buf);
            pos += todo;
        }
        Ok(digest.finalize())
    }

    /// Digest the region and compare against `expected`.  Any difference is
    /// a mismatch; there is no partial acceptance.
    pub fn verify<R, const N: usize>(
        source: &mut R,
        offset: usize,
        length: usize,
        expected: &[u8; N],
    ) -> storage::Result<Verdict<N>>
    where
        D: ImageDigest<N>,
        R: ReadStorage + ?Sized,
    {
        let computed: [u8; N] = Self::calculate(source, offset, length)?;
        if computed == *expected {
            Ok(Verdict::Match)
        } else {
            Ok(Verdict::Mismatch {
                expected: *expected,
                computed,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::{digest_of, Crc64Digest, Sha256Digest};

    /// Memory as storage, counting reads.
    struct Mem {
        data: Vec<u8>,
        reads: Vec<usize>,
    }

    impl ReadStorage for Mem {
        fn read(&mut self, offset: usize, bytes: &mut [u8]) -> storage::Result<()> {
            storage::check_bounds(self.data.len(), offset, bytes.len())?;
            bytes.copy_from_slice(&self.data[offset..offset + bytes.len()]);
            self.reads.push(bytes.len());
            Ok(())
        }
    }

    fn mem(len: usize) -> Mem {
        Mem {
            data: (0..len).map(|i| (i * 7 + 3) as u8).collect(),
            reads: Vec::new(),
        }
    }

    #[test]
    fn chunked_reads() {
        let mut src = mem(1300);
        let hash: [u8; 32] = StreamVerifier::<Sha256Digest>::calculate(&mut src, 0, 1300).unwrap();
        assert_eq!(hash, digest_of::<Sha256Digest, 32>(&src.data));
        assert_eq!(src.reads, vec![512, 512, 276]);
    }

    #[test]
    fn offset_region() {
        let mut src = mem(1000);
        let crc: [u8; 8] = StreamVerifier::<Crc64Digest, 64>::calculate(&mut src, 100, 800).unwrap();
        assert_eq!(crc, digest_of::<Crc64Digest, 8>(&src.data[100..900]));
    }

    #[test]
    fn empty_region() {
        let mut src = mem(10);
        let hash: [u8; 32] = StreamVerifier::<Sha256Digest>::calculate(&mut src, 4, 0).unwrap();
        assert_eq!(hash, digest_of::<Sha256Digest, 32>(&[]));
        assert!(src.reads.is_empty());
    }

    #[test]
    fn out_of_bounds() {
        let mut src = mem(100);
        let result = StreamVerifier::<Sha256Digest>::calculate::<_, 32>(&mut src, 50, 51);
        assert_eq!(result, Err(Error::OutOfBounds));
    }

    #[test]
    fn verdicts() {
        let mut src = mem(600);
        let good = digest_of::<Crc64Digest, 8>(&src.data);
        let verdict = StreamVerifier::<Crc64Digest>::verify(&mut src, 0, 600, &good).unwrap();
        assert_eq!(verdict, Verdict::Match);

        let mut bad = good;
        bad[7] ^= 1;
        let verdict = StreamVerifier::<Crc64Digest>::verify(&mut src, 0, 600, &bad).unwrap();
        assert_eq!(
            verdict,
            Verdict::Mismatch {
                expected: bad,
                computed: good
            }
        );
    }
}
