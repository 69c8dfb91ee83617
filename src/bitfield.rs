//! Piece availability bitfields.
//!
//! The wire representation is MSB-first within each byte (piece 0 is the
//! highest bit of the first byte), which is exactly [`bitvec`]'s `Msb0`
//! ordering, so [`Bitfield`](crate::Bitfield) is used directly rather than
//! wrapped in a newtype. The helpers here add the wire-compatible
//! out-of-range tolerance the raw `bitvec` indexing doesn't give us: peers
//! regularly send bitfields with trailing pad bits or (if malformed)
//! referring to out-of-range pieces, and the protocol says to ignore
//! rather than panic on those.

use crate::{Bitfield, PieceIndex};
use bitvec::prelude::{BitVec, Msb0};

/// Returns a fresh bitfield of `num_pieces` bits, all unset.
pub(crate) fn new(num_pieces: usize) -> Bitfield {
    BitVec::<Msb0, u8>::repeat(false, num_pieces)
}

/// Returns whether `index` is set. Out-of-range indices are not set.
pub(crate) fn has(bf: &Bitfield, index: PieceIndex) -> bool {
    bf.get(index).map(|b| *b).unwrap_or(false)
}

/// Sets `index`, silently ignoring out-of-range indices.
pub(crate) fn set(bf: &mut Bitfield, index: PieceIndex) {
    if let Some(mut bit) = bf.get_mut(index) {
        *bit = true;
    }
}

/// Clears `index`, silently ignoring out-of-range indices.
pub(crate) fn clear(bf: &mut Bitfield, index: PieceIndex) {
    if let Some(mut bit) = bf.get_mut(index) {
        *bit = false;
    }
}

/// Returns the number of set bits.
pub(crate) fn count(bf: &Bitfield) -> usize {
    bf.count_ones()
}

/// Decodes a wire-format bitfield payload into a [`Bitfield`] of exactly
/// `num_pieces` bits, discarding any trailing pad bits the peer may have
/// sent to round the payload up to a whole number of bytes.
pub(crate) fn decode(payload: &[u8], num_pieces: usize) -> Bitfield {
    let mut bf = BitVec::<Msb0, u8>::from_slice(payload);
    bf.resize(num_pieces, false);
    bf
}

/// Encodes a bitfield into its wire-format byte string.
pub(crate) fn encode(bf: &Bitfield) -> Vec<u8> {
    let mut bytes = bf.clone();
    // pad to a whole number of bytes, as the wire format requires
    let pad = (8 - bytes.len() % 8) % 8;
    if pad > 0 {
        bytes.resize(bytes.len() + pad, false);
    }
    bytes.into_vec()
}
