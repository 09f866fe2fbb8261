//! Local identity and the peer keystore.
//!
//! The identity component owns the node's Ed25519 keypair and a mutex-guarded
//! cache of peers' verifying keys learned through the `identify` handshake
//! (§4.5). A key is retained only after its owner has proven control of the
//! matching private key.

use std::collections::HashMap;
use std::sync::Mutex;

use warren_crypto::ed25519::{KeyPair, Signature, SigningKey, VerifyingKey};

use crate::id::Id;
use crate::{DhtError, Result};

/// The local node's signing identity.
pub struct Identity {
    pub id: Id,
    pub keypair: KeyPair,
}

impl Identity {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        let keypair = KeyPair::generate();
        let id = Id::from_public_key(&keypair.verifying_key);
        Self { id, keypair }
    }

    /// Build an identity from an existing signing key.
    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = signing_key.verifying_key();
        let id = Id::from_public_key(&verifying_key);
        Self {
            id,
            keypair: KeyPair {
                signing_key,
                verifying_key,
            },
        }
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.keypair.signing_key.sign(message)
    }

    /// Build the identify-challenge signed blob: `"{token}:{host}:{port}"`.
    pub fn sign_identify_token(&self, token: &[u8], host: &str, port: u16) -> Signature {
        self.sign(&identify_blob(token, host, port))
    }
}

/// Build the byte blob signed during an identify exchange.
pub fn identify_blob(token: &[u8], host: &str, port: u16) -> Vec<u8> {
    let mut blob = Vec::with_capacity(token.len() + host.len() + 8);
    blob.extend_from_slice(token);
    blob.push(b':');
    blob.extend_from_slice(host.as_bytes());
    blob.push(b':');
    blob.extend_from_slice(port.to_string().as_bytes());
    blob
}

/// A verified peer public key, cached after a successful identify exchange.
#[derive(Clone)]
struct KeystoreEntry {
    verifying_key: VerifyingKey,
}

/// Mutex-guarded cache of verified peer public keys, keyed by node id.
///
/// Gatekeeping (§4.5) consults this before processing any RPC other than
/// `identify`/`get_addresses`; an unknown peer triggers an `identify`
/// exchange before its original message is re-dispatched.
#[derive(Default)]
pub struct Keystore {
    entries: Mutex<HashMap<Id, KeystoreEntry>>,
}

impl Keystore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a peer's public key is already known.
    pub fn knows(&self, id: &Id) -> bool {
        self.entries.lock().expect("keystore mutex poisoned").contains_key(id)
    }

    pub fn get(&self, id: &Id) -> Option<VerifyingKey> {
        self.entries
            .lock()
            .expect("keystore mutex poisoned")
            .get(id)
            .map(|e| e.verifying_key.clone())
    }

    /// Verify and retain a peer's claimed identity.
    ///
    /// Checks `hash(pub_key) == claimed_id` before inserting, per the identify
    /// gate (§4.5/§7 Identity-mismatch).
    pub fn verify_and_insert(&self, claimed_id: Id, verifying_key: VerifyingKey) -> Result<()> {
        let derived = Id::from_public_key(&verifying_key);
        if derived != claimed_id {
            return Err(DhtError::IdentityMismatch {
                claimed: claimed_id.to_base58(),
                derived: derived.to_base58(),
            });
        }
        self.entries
            .lock()
            .expect("keystore mutex poisoned")
            .insert(claimed_id, KeystoreEntry { verifying_key });
        Ok(())
    }

    /// Remove a cached key, e.g. after a signature verification failure.
    pub fn evict(&self, id: &Id) {
        self.entries.lock().expect("keystore mutex poisoned").remove(id);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("keystore mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_id_matches_derivation() {
        let identity = Identity::generate();
        assert_eq!(identity.id, Id::from_public_key(&identity.keypair.verifying_key));
    }

    #[test]
    fn test_identify_token_roundtrip() {
        let identity = Identity::generate();
        let token = b"random-token";
        let sig = identity.sign_identify_token(token, "127.0.0.1", 6881);
        let blob = identify_blob(token, "127.0.0.1", 6881);
        assert!(identity.keypair.verifying_key.verify(&blob, &sig).is_ok());
    }

    #[test]
    fn test_keystore_verify_and_insert() {
        let identity = Identity::generate();
        let keystore = Keystore::new();
        keystore
            .verify_and_insert(identity.id, identity.keypair.verifying_key.clone())
            .expect("valid identity");
        assert!(keystore.knows(&identity.id));
    }

    #[test]
    fn test_keystore_rejects_mismatched_id() {
        let identity = Identity::generate();
        let other = Identity::generate();
        let keystore = Keystore::new();
        let err = keystore
            .verify_and_insert(other.id, identity.keypair.verifying_key.clone())
            .expect_err("mismatched id should be rejected");
        assert!(matches!(err, DhtError::IdentityMismatch { .. }));
        assert!(!keystore.knows(&other.id));
    }

    #[test]
    fn test_keystore_evict() {
        let identity = Identity::generate();
        let keystore = Keystore::new();
        keystore
            .verify_and_insert(identity.id, identity.keypair.verifying_key.clone())
            .expect("valid identity");
        keystore.evict(&identity.id);
        assert!(!keystore.knows(&identity.id));
    }
}
