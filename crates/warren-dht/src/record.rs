//! Signed records: data values and provider announcements.
//!
//! Replaces BEP 44's content-addressed mutable/immutable model with the
//! signed-record protocol of §3/§4.5: every record is explicitly keyed,
//! carries its origin peer, and is valid iff the origin's signature over the
//! deterministic `sig_blob` verifies.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use warren_crypto::ed25519::{Signature, VerifyingKey};

use crate::addr::Peer;
use crate::id::Id;
use crate::{DhtError, Result, REPUBLISH_TIME_SECS};

/// The kind of value a [`KV`] record carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordType {
    Data,
    Provider,
}

/// A signed DHT record: `{key, type, value, origin, timestamp, signature}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KV {
    pub key: Id,
    pub record_type: RecordType,
    pub value: Vec<u8>,
    pub origin: Peer,
    pub timestamp: u64,
    pub signature: Signature,
}

impl KV {
    /// Build and sign a new record.
    pub fn sign(
        key: Id,
        record_type: RecordType,
        value: Vec<u8>,
        origin: Peer,
        timestamp: u64,
        signing_key: &warren_crypto::ed25519::SigningKey,
    ) -> Self {
        let blob = sig_blob(&key, &value, &origin.id, timestamp);
        let signature = signing_key.sign(&blob);
        Self {
            key,
            record_type,
            value,
            origin,
            timestamp,
            signature,
        }
    }

    /// Verify the record's signature against its origin's claimed identity.
    ///
    /// The caller supplies the verifying key (looked up via the keystore, or
    /// derived directly if the origin is self-describing); this function
    /// only checks the signature, not identity-to-key binding.
    pub fn verify(&self, origin_key: &VerifyingKey) -> Result<()> {
        let blob = sig_blob(&self.key, &self.value, &self.origin.id, self.timestamp);
        origin_key
            .verify(&blob, &self.signature)
            .map_err(|_| DhtError::InvalidSignature)
    }
}

/// The deterministic byte blob signed/verified for a [`KV`]:
/// encoding of `{key, value, origin.id, timestamp}`.
pub fn sig_blob(key: &Id, value: &[u8], origin_id: &Id, timestamp: u64) -> Vec<u8> {
    let mut blob = Vec::with_capacity(key.as_bytes().len() + value.len() + origin_id.as_bytes().len() + 8);
    blob.extend_from_slice(key.as_bytes());
    blob.extend_from_slice(value);
    blob.extend_from_slice(origin_id.as_bytes());
    blob.extend_from_slice(&timestamp.to_be_bytes());
    blob
}

/// A self-signed provider announcement: `{provider_id, expiry, signature}`,
/// signed over `"{provider_id}:{expiry}"`. Carried as the `value` of a
/// [`RecordType::Provider`] record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Provider {
    pub provider_id: Id,
    pub expiry: u64,
    pub signature: Signature,
}

impl Provider {
    pub fn sign(
        provider_id: Id,
        expiry: u64,
        signing_key: &warren_crypto::ed25519::SigningKey,
    ) -> Self {
        let blob = provider_blob(&provider_id, expiry);
        let signature = signing_key.sign(&blob);
        Self {
            provider_id,
            expiry,
            signature,
        }
    }

    pub fn verify(&self, provider_key: &VerifyingKey) -> Result<()> {
        let blob = provider_blob(&self.provider_id, self.expiry);
        provider_key
            .verify(&blob, &self.signature)
            .map_err(|_| DhtError::InvalidSignature)
    }

    /// Expiry must land within `REPUBLISH_TIME` of `now` to be accepted (§4.5).
    pub fn expiry_in_range(&self, now: u64) -> bool {
        self.expiry > now && self.expiry - now <= REPUBLISH_TIME_SECS
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expiry
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| DhtError::Malformed(format!("encoding provider record: {e}")))?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        ciborium::from_reader(bytes)
            .map_err(|e| DhtError::Malformed(format!("decoding provider record: {e}")))
    }
}

/// The byte blob signed/verified for a [`Provider`]: `"{provider_id}:{expiry}"`.
fn provider_blob(provider_id: &Id, expiry: u64) -> Vec<u8> {
    format!("{}:{}", provider_id.to_base58(), expiry).into_bytes()
}

pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs()
}

/// Mutex-guarded in-memory record table, exclusively owned by the orchestrator.
#[derive(Default)]
pub struct RecordTable {
    records: Mutex<HashMap<Id, KV>>,
}

impl RecordTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &Id) -> Option<KV> {
        self.records.lock().expect("record table mutex poisoned").get(key).cloned()
    }

    pub fn contains(&self, key: &Id) -> bool {
        self.records.lock().expect("record table mutex poisoned").contains_key(key)
    }

    /// Insert a record. Rejects the insert if the key is already present
    /// (§4.5/§7 Duplicate-store: no overwrite, caller reports `status=bad`).
    pub fn insert(&self, record: KV) -> Result<()> {
        let mut guard = self.records.lock().expect("record table mutex poisoned");
        if guard.contains_key(&record.key) {
            return Err(DhtError::DuplicateStore);
        }
        guard.insert(record.key, record);
        Ok(())
    }

    /// Overwrite a record unconditionally, used by the republish loop.
    pub fn put(&self, record: KV) {
        self.records.lock().expect("record table mutex poisoned").insert(record.key, record);
    }

    pub fn remove(&self, key: &Id) -> Option<KV> {
        self.records.lock().expect("record table mutex poisoned").remove(key)
    }

    pub fn keys(&self) -> Vec<Id> {
        self.records.lock().expect("record table mutex poisoned").keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("record table mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::{Addr, Transport};
    use warren_crypto::ed25519::KeyPair;

    fn origin_peer(id: Id) -> Peer {
        Peer::new(id, Addr::new(Transport::Udp, "127.0.0.1", 6881))
    }

    #[test]
    fn test_kv_sign_and_verify() {
        let kp = KeyPair::generate();
        let origin_id = Id::from_public_key(&kp.verifying_key);
        let kv = KV::sign(
            Id::new([1u8; crate::id::ID_BYTES]),
            RecordType::Data,
            b"value".to_vec(),
            origin_peer(origin_id),
            100,
            &kp.signing_key,
        );
        assert!(kv.verify(&kp.verifying_key).is_ok());
    }

    #[test]
    fn test_kv_tampered_value_fails() {
        let kp = KeyPair::generate();
        let origin_id = Id::from_public_key(&kp.verifying_key);
        let mut kv = KV::sign(
            Id::new([1u8; crate::id::ID_BYTES]),
            RecordType::Data,
            b"value".to_vec(),
            origin_peer(origin_id),
            100,
            &kp.signing_key,
        );
        kv.value = b"tampered".to_vec();
        assert!(kv.verify(&kp.verifying_key).is_err());
    }

    #[test]
    fn test_provider_expiry_in_range() {
        let kp = KeyPair::generate();
        let id = Id::from_public_key(&kp.verifying_key);
        let now = now_unix();
        let provider = Provider::sign(id, now + REPUBLISH_TIME_SECS - 1, &kp.signing_key);
        assert!(provider.expiry_in_range(now));
        assert!(provider.verify(&kp.verifying_key).is_ok());
    }

    #[test]
    fn test_provider_expiry_out_of_range() {
        let kp = KeyPair::generate();
        let id = Id::from_public_key(&kp.verifying_key);
        let now = now_unix();
        let provider = Provider::sign(id, now + REPUBLISH_TIME_SECS * 2, &kp.signing_key);
        assert!(!provider.expiry_in_range(now));
    }

    #[test]
    fn test_record_table_rejects_duplicate() {
        let kp = KeyPair::generate();
        let origin_id = Id::from_public_key(&kp.verifying_key);
        let key = Id::new([2u8; crate::id::ID_BYTES]);
        let kv1 = KV::sign(key, RecordType::Data, b"v1".to_vec(), origin_peer(origin_id), 1, &kp.signing_key);
        let kv2 = KV::sign(key, RecordType::Data, b"v2".to_vec(), origin_peer(origin_id), 2, &kp.signing_key);

        let table = RecordTable::new();
        table.insert(kv1).expect("first insert");
        let err = table.insert(kv2).expect_err("duplicate insert should be rejected");
        assert!(matches!(err, DhtError::DuplicateStore));
    }

    #[test]
    fn test_record_table_get_and_remove() {
        let kp = KeyPair::generate();
        let origin_id = Id::from_public_key(&kp.verifying_key);
        let key = Id::new([3u8; crate::id::ID_BYTES]);
        let kv = KV::sign(key, RecordType::Data, b"v".to_vec(), origin_peer(origin_id), 1, &kp.signing_key);

        let table = RecordTable::new();
        table.insert(kv).expect("insert");
        assert!(table.contains(&key));
        assert!(table.remove(&key).is_some());
        assert!(!table.contains(&key));
    }

    #[test]
    fn test_provider_encode_decode_roundtrip() {
        let kp = KeyPair::generate();
        let id = Id::from_public_key(&kp.verifying_key);
        let provider = Provider::sign(id, now_unix() + 100, &kp.signing_key);
        let bytes = provider.encode().expect("encode");
        let decoded = Provider::decode(&bytes).expect("decode");
        assert_eq!(decoded.provider_id, provider.provider_id);
        assert_eq!(decoded.expiry, provider.expiry);
    }
}
