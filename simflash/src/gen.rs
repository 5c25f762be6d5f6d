//! Image generation.

use rand::{RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256Plus;

use crate::Result;

pub struct GeneratedImage {
    pub data: Vec<u8>,
}

pub struct GenBuilder {
    /// Size of the zeroed header.  Stands in for a signature block that is
    /// carried in front of the image but not covered by its digest.
    header_size: usize,
    /// Total size of the image, including the header.
    size: usize,
    /// Seed for the PRNG
    seed: usize,
}

impl Default for GenBuilder {
    fn default() -> Self {
        GenBuilder {
            header_size: 0,
            size: 76_137,
            seed: 1,
        }
    }
}

impl GenBuilder {
    pub fn size(&mut self, size: usize) -> &mut Self {
        self.size = size;
        self
    }

    pub fn seed(&mut self, seed: usize) -> &mut Self {
        self.seed = seed;
        self
    }

    pub fn header_size(&mut self, header_size: usize) -> &mut Self {
        self.header_size = header_size;
        self
    }

    pub fn build(&self) -> Result<GeneratedImage> {
        if self.header_size > self.size {
            return Err(anyhow::anyhow!(
                "Header of {} bytes does not fit in a {} byte image",
                self.header_size,
                self.size
            ));
        }
        let mut rng = Xoshiro256Plus::seed_from_u64(self.seed as u64);
        let mut data = vec![0u8; self.size];
        rng.fill_bytes(&mut data);

        data[..self.header_size].fill(0);

        Ok(GeneratedImage { data })
    }
}
