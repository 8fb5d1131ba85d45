//! Content fingerprints used to decide whether a destination already matches its source.
//!
//! Objects below [`FULL_HASH_LIMIT`] are hashed whole. Larger objects are hashed over a
//! [`SAMPLE_CAPACITY`]-byte buffer: the first half read from offset 0, the second half from
//! `size - SAMPLE_CAPACITY / 2`. MD5 is an integrity check here, not a security boundary.

use anyhow::Context;
use md5::Digest;
use tokio::io::AsyncReadExt;

use crate::client::Client;
use crate::error::Result;

pub const SAMPLE_CAPACITY: u64 = 2000;
pub const FULL_HASH_LIMIT: i64 = 10 * 1024 * 1024;

/// Lowercase hex MD5 of `data`.
pub fn digest(data: &[u8]) -> String {
    hex::encode(md5::Md5::digest(data))
}

/// Byte ranges `(offset, len)` that make up the sample of an object of `size` bytes.
pub fn sample_ranges(size: i64) -> Vec<(u64, u64)> {
    let size = u64::try_from(size).unwrap_or(0);
    if size < FULL_HASH_LIMIT as u64 {
        return vec![(0, size)];
    }
    let half = SAMPLE_CAPACITY / 2;
    vec![(0, half), (size - half, half)]
}

#[tracing::instrument(skip(client))]
pub async fn compute<C: Client + ?Sized>(client: &C, path: &str, size: i64) -> Result<String> {
    let mut data = Vec::new();
    for (offset, len) in sample_ranges(size) {
        let mut reader = client.reader(path, offset).await?;
        if size < FULL_HASH_LIMIT {
            reader
                .read_to_end(&mut data)
                .await
                .with_context(|| format!("failed reading {path:?} for fingerprint"))?;
            continue;
        }
        let start = data.len();
        data.resize(start + len as usize, 0);
        reader
            .read_exact(&mut data[start..])
            .await
            .with_context(|| format!("failed reading {len} bytes at {offset} from {path:?}"))?;
    }
    let md5 = digest(&data);
    tracing::debug!("fingerprint of {:?} ({} bytes): {}", path, size, &md5);
    Ok(md5)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_buffer_digest() {
        assert_eq!(digest(b""), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn known_digest() {
        assert_eq!(digest(b"hello"), "5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn small_objects_are_hashed_whole() {
        assert_eq!(sample_ranges(0), vec![(0, 0)]);
        assert_eq!(sample_ranges(5000), vec![(0, 5000)]);
        assert_eq!(
            sample_ranges(FULL_HASH_LIMIT - 1),
            vec![(0, FULL_HASH_LIMIT as u64 - 1)]
        );
    }

    #[test]
    fn large_objects_are_sampled_head_and_tail() {
        let size = FULL_HASH_LIMIT;
        assert_eq!(
            sample_ranges(size),
            vec![(0, 1000), (size as u64 - 1000, 1000)]
        );
        let size = 20 * 1024 * 1024;
        assert_eq!(
            sample_ranges(size),
            vec![(0, 1000), (size as u64 - 1000, 1000)]
        );
    }

    proptest! {
        #[test]
        fn digest_is_deterministic(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
            prop_assert_eq!(digest(&data), digest(&data.clone()));
        }

        #[test]
        fn digest_is_content_addressed(a in proptest::collection::vec(any::<u8>(), 1..512),
                                       b in proptest::collection::vec(any::<u8>(), 1..512)) {
            prop_assert_eq!(a == b, digest(&a) == digest(&b));
        }
    }
}
