use crate::crypto::{hash_combine, Digest};
use serde::{Deserialize, Serialize};

/// An append-only Merkle accumulator over a sequence of digests.
///
/// Stores one partial root per power-of-two subtree instead of the whole
/// tree: appending is amortized O(1) and the state is O(log n). The root it
/// reports is always identical to [`calculate_merkle`] over the same
/// sequence of leaves.
///
/// Representation: bit `i` of `mask` is set iff a subtree of exactly `2^i`
/// leaves is present, and `trees` holds the subtree roots ordered largest
/// first, so appends only ever touch the tail. Because every append adds one
/// leaf, `mask` is also the leaf count.
///
/// [`calculate_merkle`]: crate::merkle::calculate_merkle
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementalMerkle {
    mask: u64,
    trees: Vec<Digest>,
}

impl IncrementalMerkle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of leaves appended so far.
    pub fn leaf_count(&self) -> u64 {
        self.mask
    }

    fn is_bit_set(&self, idx: u32) -> bool {
        self.mask & (1u64 << idx) != 0
    }

    fn set_bit(&mut self, idx: u32) {
        self.mask |= 1u64 << idx;
    }

    fn clear_bit(&mut self, idx: u32) {
        self.mask &= !(1u64 << idx);
    }

    /// Append one leaf digest. Worst case O(log n) combines when a run of
    /// complete subtrees collapses; amortized O(1).
    pub fn append(&mut self, digest: Digest) {
        debug_assert_eq!(self.mask.count_ones() as usize, self.trees.len());
        self.append_at(digest, 0);
        debug_assert_eq!(self.mask.count_ones() as usize, self.trees.len());
    }

    /// Append every digest of a slice, in order.
    pub fn append_all(&mut self, digests: &[Digest]) {
        for d in digests {
            self.append(*d);
        }
    }

    // Insertion always happens at the tail: bits below `idx` are clear on
    // entry, so the last entry (if bit `idx` is set) is the 2^idx subtree.
    fn append_at(&mut self, digest: Digest, idx: u32) {
        if !self.is_bit_set(idx) {
            self.trees.push(digest);
            self.set_bit(idx);
        } else if !self.is_bit_set(idx + 1) {
            // The next slot up is free: merge into a 2^(idx+1) subtree in place.
            let last = self.trees.last_mut().expect("bit set implies tree present");
            *last = hash_combine(*last, digest);
            self.clear_bit(idx);
            self.set_bit(idx + 1);
        } else {
            // Both slots occupied: collapse the two tail subtrees with the
            // new digest into one 2^(idx+2) candidate and carry upward.
            // Recursion depth is bounded by the 64 bits of the mask.
            let right = self.trees.pop().expect("bit set implies tree present");
            let left = self.trees.pop().expect("two bits set imply two trees");
            self.clear_bit(idx);
            self.clear_bit(idx + 1);
            let combined = hash_combine(left, hash_combine(right, digest));
            self.append_at(combined, idx + 2);
        }
    }

    /// The Merkle root over everything appended so far; the zero digest for
    /// an empty accumulator.
    ///
    /// Folds the partial roots right to left, so the smallest subtree is
    /// absorbed first. O(log n) combines.
    pub fn root(&self) -> Digest {
        if self.mask == 0 {
            return Digest::ZERO;
        }
        self.trees
            .iter()
            .rev()
            .copied()
            .reduce(|acc, tree| hash_combine(tree, acc))
            .expect("non-zero mask implies at least one tree")
    }
}
