//! 160-bit node identifiers derived from a public key via SHA-1.
//!
//! `id = sha1(pub_key_bytes)`, zero-extended on the left if the hash is
//! narrower than [`ID_BYTES`] and truncated if wider — SHA-1 already produces
//! exactly 20 bytes (160 bits) so in practice this is neither extension nor
//! truncation, just a direct copy.

use sha1::{Digest, Sha1};

use crate::ed25519::VerifyingKey;

/// Width of a node identifier in bytes (160 bits).
pub const ID_BYTES: usize = 20;

/// Derive a 160-bit node id from an Ed25519 public key.
pub fn derive_node_id(pub_key: &VerifyingKey) -> [u8; ID_BYTES] {
    hash(pub_key.as_bytes())
}

/// SHA-1 hash of arbitrary bytes, as a 160-bit id.
pub fn hash(data: &[u8]) -> [u8; ID_BYTES] {
    let digest = Sha1::digest(data);
    let mut out = [0u8; ID_BYTES];
    out.copy_from_slice(&digest);
    out
}
