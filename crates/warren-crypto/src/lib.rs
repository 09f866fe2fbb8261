//! # warren-crypto
//!
//! Cryptographic primitives for the Warren DHT: Ed25519 signing, BLAKE3
//! checksums, and SHA-1 node-id derivation.
//!
//! ## Modules
//!
//! - [`blake3`] — content checksums
//! - [`ed25519`] — signing and verification (RFC 8032)
//! - [`id`] — 160-bit node-id derivation from a public key

pub mod blake3;
pub mod ed25519;
pub mod id;

/// Error types for cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Ed25519 signature verification failed.
    #[error("signature verification failed")]
    SignatureVerification,

    /// Invalid key length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Invalid input data.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;
