//! Merkle trees over record-blob digests.
//!
//! Each SSTable's Metadata component stores a Merkle tree whose leaves are
//! the MD5 digests of the table's record blobs, in data order. The root
//! witnesses the integrity of the whole Data component; comparing a stored
//! tree against one rebuilt from disk pinpoints exactly which records
//! diverged.
//!
//! Only the leaves are serialized (`[leaf_count u32][16-byte digests…]`);
//! internal nodes are recomputed on load, so a corrupted internal node can
//! never mask a corrupted leaf.


use md5::{Digest, Md5};

use crate::encoding::{self, Decode, Encode, EncodingError};

/// Width of one digest in bytes.
pub const DIGEST_SIZE: usize = 16;

/// An MD5 digest used as a Merkle leaf or internal node.
pub type Hash = [u8; DIGEST_SIZE];

/// Digest of a byte slice.
pub fn hash_bytes(data: &[u8]) -> Hash {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// A Merkle tree built bottom-up from leaf digests.
///
/// Levels are stored leaves-first; each parent is the digest of the
/// concatenation of its two children. Odd nodes are paired with
/// themselves, so the tree is defined for any non-zero leaf count; an
/// empty tree has a fixed all-zero root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTree {
    /// `levels[0]` holds the leaves; the last level holds the root alone.
    levels: Vec<Vec<Hash>>,
}

impl MerkleTree {
    /// Builds a tree from pre-hashed leaves.
    pub fn from_leaves(leaves: Vec<Hash>) -> Self {
        if leaves.is_empty() {
            return Self { levels: Vec::new() };
        }

        let mut levels = vec![leaves];
        while levels.last().map(Vec::len).unwrap_or(0) > 1 {
            let below = levels.last().expect("non-empty levels");
            let mut above = Vec::with_capacity(below.len().div_ceil(2));
            for pair in below.chunks(2) {
                let left = &pair[0];
                let right = pair.get(1).unwrap_or(left);
                let mut joined = [0u8; DIGEST_SIZE * 2];
                joined[..DIGEST_SIZE].copy_from_slice(left);
                joined[DIGEST_SIZE..].copy_from_slice(right);
                above.push(hash_bytes(&joined));
            }
            levels.push(above);
        }

        Self { levels }
    }

    /// Builds a tree by hashing raw leaf payloads.
    pub fn from_payloads<'a>(payloads: impl IntoIterator<Item = &'a [u8]>) -> Self {
        Self::from_leaves(payloads.into_iter().map(hash_bytes).collect())
    }

    /// The root digest. An empty tree roots at all zeros.
    pub fn root(&self) -> Hash {
        self.levels
            .last()
            .and_then(|top| top.first())
            .copied()
            .unwrap_or([0u8; DIGEST_SIZE])
    }

    /// Number of leaves.
    pub fn leaf_count(&self) -> usize {
        self.levels.first().map(Vec::len).unwrap_or(0)
    }

    /// The leaf digests in order.
    pub fn leaves(&self) -> &[Hash] {
        self.levels.first().map(Vec::as_slice).unwrap_or(&[])
    }

    /// Compares `self` (typically the tree rebuilt from disk) against
    /// `other` (the stored tree) and returns the positions of every
    /// mismatched leaf.
    ///
    /// Equal roots with equal leaf counts short-circuit to an empty
    /// answer. Otherwise the leaf levels are compared position by
    /// position; positions beyond the shorter tree's leaf count are
    /// reported as mismatched.
    pub fn diff(&self, other: &MerkleTree) -> Vec<usize> {
        if self.root() == other.root() && self.leaf_count() == other.leaf_count() {
            return Vec::new();
        }

        let common = self.leaf_count().min(other.leaf_count());
        let longest = self.leaf_count().max(other.leaf_count());

        let mut mismatched: Vec<usize> = (0..common)
            .filter(|&i| self.leaves()[i] != other.leaves()[i])
            .collect();
        mismatched.extend(common..longest);
        mismatched
    }
}

impl encoding::Encode for MerkleTree {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        (self.leaf_count() as u32).encode_to(buf)?;
        for leaf in self.leaves() {
            leaf.encode_to(buf)?;
        }
        Ok(())
    }
}

impl encoding::Decode for MerkleTree {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (count, mut off) = u32::decode_from(buf)?;
        if count > encoding::MAX_VEC_ELEMENTS {
            return Err(EncodingError::LengthOverflow(format!(
                "merkle leaf count {count} exceeds limit"
            )));
        }
        let mut leaves = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (leaf, n) = Hash::decode_from(&buf[off..])?;
            off += n;
            leaves.push(leaf);
        }
        Ok((Self::from_leaves(leaves), off))
    }
}
