//! 160-bit node/key identifiers and the XOR distance metric.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::BIT_HASH_WIDTH;

/// Number of bytes in an [`Id`] (`BIT_HASH_WIDTH` bits).
pub const ID_BYTES: usize = BIT_HASH_WIDTH / 8;

/// A 160-bit identifier: a node id or a record key, depending on context.
///
/// Both node ids and record keys live in the same space so that XOR distance
/// can be computed between either kind, or one of each.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Id(pub [u8; ID_BYTES]);

impl Id {
    /// The all-zero id.
    pub const ZERO: Id = Id([0u8; ID_BYTES]);

    /// Build an id from raw bytes.
    pub fn new(bytes: [u8; ID_BYTES]) -> Self {
        Self(bytes)
    }

    /// Derive an id from an Ed25519 public key via SHA-1, per the identity collaborator contract.
    pub fn from_public_key(pub_key: &warren_crypto::ed25519::VerifyingKey) -> Self {
        Self(warren_crypto::id::derive_node_id(pub_key))
    }

    /// Raw bytes of this id.
    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    /// XOR distance between two ids, interpreted as an unsigned integer for ordering.
    pub fn distance(&self, other: &Id) -> Distance {
        let mut out = [0u8; ID_BYTES];
        for (o, (a, b)) in out.iter_mut().zip(self.0.iter().zip(other.0.iter())) {
            *o = a ^ b;
        }
        Distance(out)
    }

    /// Number of leading zero bits in `self`, i.e. the depth of the trie leaf
    /// that would hold an entry whose distance from some local id is `self`.
    ///
    /// Returns `ID_BYTES * 8` if `self` is all zero (the two ids are equal).
    pub fn leading_zero_bits(&self) -> usize {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return i * 8 + byte.leading_zeros() as usize;
            }
        }
        ID_BYTES * 8
    }

    /// Test whether `self` shares the first `cutoff` bits with `other`.
    ///
    /// `cutoff == 0` always matches (whole space); `cutoff == ID_BYTES*8`
    /// requires full equality.
    pub fn shares_prefix(&self, other: &Id, cutoff: usize) -> bool {
        let full_bytes = cutoff / 8;
        let rem_bits = cutoff % 8;
        if self.0[..full_bytes] != other.0[..full_bytes] {
            return false;
        }
        if rem_bits == 0 {
            return true;
        }
        let mask = 0xFFu8 << (8 - rem_bits);
        (self.0[full_bytes] & mask) == (other.0[full_bytes] & mask)
    }

    /// The bit at position `i` (0 = most significant bit of byte 0).
    pub fn bit(&self, i: usize) -> bool {
        let byte = self.0[i / 8];
        let shift = 7 - (i % 8);
        (byte >> shift) & 1 == 1
    }

    /// Base58 encoding, used for the wire `i`/`t` fields.
    pub fn to_base58(self) -> String {
        bs58::encode(self.0).into_string()
    }

    /// Decode a base58 string into an id.
    pub fn from_base58(s: &str) -> Result<Self, bs58::decode::Error> {
        let bytes = bs58::decode(s).into_vec()?;
        let mut out = [0u8; ID_BYTES];
        if bytes.len() != ID_BYTES {
            return Err(bs58::decode::Error::BufferTooSmall);
        }
        out.copy_from_slice(&bytes);
        Ok(Id(out))
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", hex::encode(self.0))
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base58())
    }
}

/// An XOR distance between two [`Id`]s. Ordering on `Distance` is the
/// standard unsigned big-endian byte comparison, which is correct for XOR
/// metrics because XOR preserves bit significance.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Distance([u8; ID_BYTES]);

impl Distance {
    pub fn leading_zero_bits(&self) -> usize {
        Id(self.0).leading_zero_bits()
    }
}
