//! Content hashes of input files are recorded and used to decide whether a
//! previously built output is still up to date when mtimes alone would say
//! it isn't.

use crate::fs::FileSystem;
use std::hash::{BuildHasher, Hasher};

/// Content fingerprint of a single file.  32 bits, persisted in the hash
/// log; collision resistance is not a goal, the worst a collision can cause
/// is a skipped rebuild.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Hash(pub u32);

// Fixed seeds so hashes are stable across runs of the same binary.  An ahash
// version bump may change values, which at worst forces rebuilds.
const SEEDS: (u64, u64, u64, u64) = (0x6e32, 0x6861, 0x7368, 0x6c67);

pub fn hash_bytes(bytes: &[u8]) -> Hash {
    let mut hasher = ahash::RandomState::with_seeds(SEEDS.0, SEEDS.1, SEEDS.2, SEEDS.3)
        .build_hasher();
    hasher.write(bytes);
    Hash(hasher.finish() as u32)
}

/// Computes the content hash of a file.  Indirected as a trait so tests can
/// observe which files get read.
pub trait FileHasher {
    fn hash_file(&self, path: &str) -> std::io::Result<Hash>;
}

/// Any filesystem can hash files by reading them, so hashing shows up as an
/// ordinary read() on the filesystem it goes through.
impl<F: FileSystem> FileHasher for F {
    fn hash_file(&self, path: &str) -> std::io::Result<Hash> {
        let bytes = self.read(path)?;
        Ok(hash_bytes(&bytes))
    }
}
