//! BLAKE3 checksums.
//!
//! Used for the checksum field in `store` responses and for content-addressed
//! chunk hashing; not used for signatures (node ids and record signatures use
//! [`crate::id`] and [`crate::ed25519`] respectively).

/// Compute the BLAKE3 hash of the input data.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *::blake3::hash(data).as_bytes()
}
