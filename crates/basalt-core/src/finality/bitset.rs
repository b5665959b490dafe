use crate::wire::{expect_consumed, read_exact, read_varint, write_varint, WireError};
use bitvec::prelude::*;
use std::fmt;

/// One bit per finalizer of a policy, in finalizer-index order.
///
/// Backed by `u64` blocks, bit `i` living at `blocks[i / 64] & (1 << (i % 64))`.
/// The on-wire form is a varint block count followed by the blocks as
/// little-endian `u64`s, which is exactly the in-memory layout.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct FinalizerBitset {
    bits: BitVec<u64, Lsb0>,
}

impl FinalizerBitset {
    /// An all-clear bitset sized for a policy with `len` finalizers.
    pub fn with_len(len: usize) -> Self {
        Self { bits: BitVec::repeat(false, len) }
    }

    /// Number of finalizer slots (not set bits).
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Whether the finalizer at `index` has voted. Out-of-range reads are
    /// simply false.
    pub fn test(&self, index: usize) -> bool {
        self.bits.get(index).map(|b| *b).unwrap_or(false)
    }

    /// Mark the finalizer at `index`. Panics on out-of-range, which would be
    /// a caller bug: indices come from the policy this bitset was sized for.
    pub fn set(&mut self, index: usize) {
        self.bits.set(index, true);
    }

    /// Number of set bits.
    pub fn count(&self) -> usize {
        self.bits.count_ones()
    }

    /// Indices of all set bits, ascending.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_ones()
    }

    /// Append the wire form: varint block count, then little-endian u64
    /// blocks.
    pub fn encode(&self, out: &mut Vec<u8>) {
        let blocks = self.bits.as_raw_slice();
        write_varint(out, blocks.len() as u64);
        for block in blocks {
            out.extend_from_slice(&block.to_le_bytes());
        }
    }

    /// Decode a bitset sized for `finalizer_count` slots. Rejects a block
    /// count that does not match and stray bits beyond the slot count.
    pub fn decode(input: &mut &[u8], finalizer_count: usize) -> Result<Self, WireError> {
        let block_count = read_varint(input)?;
        let expected_blocks = (finalizer_count as u64).div_ceil(64);
        if block_count != expected_blocks {
            return Err(WireError::BitsetLengthMismatch {
                got: block_count,
                expected_bits: finalizer_count,
            });
        }

        let mut blocks = Vec::with_capacity(block_count as usize);
        for _ in 0..block_count {
            let bytes = read_exact(input, 8, "bitset block")?;
            blocks.push(u64::from_le_bytes(bytes.try_into().expect("8 bytes")));
        }

        let mut bits = BitVec::<u64, Lsb0>::from_vec(blocks);
        // Anything beyond the finalizer count must be zero padding
        if bits.iter_ones().any(|i| i >= finalizer_count) {
            return Err(WireError::BitsetStrayBits);
        }
        bits.truncate(finalizer_count);
        Ok(Self { bits })
    }

    /// Decode from a standalone buffer, requiring full consumption.
    pub fn decode_exact(mut input: &[u8], finalizer_count: usize) -> Result<Self, WireError> {
        let bitset = Self::decode(&mut input, finalizer_count)?;
        expect_consumed(input, "bitset")?;
        Ok(bitset)
    }
}

impl fmt::Debug for FinalizerBitset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FinalizerBitset({}/{} set)", self.count(), self.len())
    }
}
