// Streaming digests over external storage.

use boot::{
    digest::digest_of, Crc64Digest, Sha256Digest, StreamVerifier, UpdateDescriptor, Verdict,
};
use proptest::prelude::*;
use simflash::{gen::GenBuilder, SimBlockDevice};
use storage::BlockDevice;

fn device_with(offset: usize, data: &[u8]) -> SimBlockDevice {
    let mut bd = SimBlockDevice::new(512, 16).unwrap();
    bd.install(offset, data).unwrap();
    bd.init().unwrap();
    bd
}

proptest! {
    // The digest must not depend on how the image is split into reads.
    #[test]
    fn chunking_invariant(
        data in proptest::collection::vec(any::<u8>(), 0..3000),
        offset in 0usize..1024,
    ) {
        let mut bd = device_with(offset, &data);
        let len = data.len();

        let sha = digest_of::<Sha256Digest, 32>(&data);
        prop_assert_eq!(StreamVerifier::<Sha256Digest, 1>::calculate::<_, 32>(&mut bd, offset, len).unwrap(), sha);
        prop_assert_eq!(StreamVerifier::<Sha256Digest, 7>::calculate::<_, 32>(&mut bd, offset, len).unwrap(), sha);
        prop_assert_eq!(StreamVerifier::<Sha256Digest>::calculate::<_, 32>(&mut bd, offset, len).unwrap(), sha);

        let crc = digest_of::<Crc64Digest, 8>(&data);
        prop_assert_eq!(StreamVerifier::<Crc64Digest, 13>::calculate::<_, 8>(&mut bd, offset, len).unwrap(), crc);
        prop_assert_eq!(StreamVerifier::<Crc64Digest, 4096>::calculate::<_, 8>(&mut bd, offset, len).unwrap(), crc);
    }
}

#[test]
fn known_vectors() {
    let mut bd = device_with(100, b"123456789");
    let crc: [u8; 8] = StreamVerifier::<Crc64Digest>::calculate(&mut bd, 100, 9).unwrap();
    assert_eq!(u64::from_le_bytes(crc), 0x995d_c9bb_df19_39fa);

    let mut bd = device_with(4000, b"abc");
    let sha: [u8; 32] = StreamVerifier::<Sha256Digest>::calculate(&mut bd, 4000, 3).unwrap();
    assert_eq!(sha[..4], [0xba, 0x78, 0x16, 0xbf]);
}

#[test]
fn single_bit_flip() {
    let image = GenBuilder::default().size(5000).build().unwrap();
    let good = digest_of::<Sha256Digest, 32>(&image.data);

    let mut data = image.data.clone();
    data[4321] ^= 0x10;
    let mut bd = device_with(0, &data);
    let verdict = StreamVerifier::<Sha256Digest>::verify(&mut bd, 0, data.len(), &good).unwrap();
    match verdict {
        Verdict::Mismatch { expected, computed } => {
            assert_eq!(expected, good);
            assert_eq!(computed, digest_of::<Sha256Digest, 32>(&data));
        }
        Verdict::Match => panic!("corrupted image accepted"),
    }
}

#[test]
fn descriptor_digest() {
    // What the companion application writes is what the verifier checks.
    let image = GenBuilder::default().size(3000).seed(4).build().unwrap();
    let desc = UpdateDescriptor::pending(
        image.data.len() as u32,
        512,
        digest_of::<Crc64Digest, 8>(&image.data),
    );

    let mut bd = device_with(512, &image.data);
    let verdict = StreamVerifier::<Crc64Digest>::verify(
        &mut bd,
        desc.offset as usize,
        desc.size as usize,
        &desc.digest,
    )
    .unwrap();
    assert_eq!(verdict, Verdict::Match);
}
