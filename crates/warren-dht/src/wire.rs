//! Wire message envelope and payload schemas.
//!
//! Every message is a self-describing CBOR map with fields `s` (schema
//! version), `m` (message type: query or response), `a` (action), `i`
//! (sender id, base58), `q` (message id), `d` (action-specific payload).
//! This module wraps [`ciborium`] the same way the CBOR codec wraps it
//! elsewhere in the ecosystem: two free functions, errors carried through
//! the crate's own error type.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::addr::{Addr, Transport};
use crate::id::Id;
use crate::{DhtError, Result, MAX_DATA_SIZE};

/// Current schema version.
pub const SCHEMA_VERSION: u8 = 1;

/// Message type: query (request) or response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    Query = 0,
    Response = 1,
}

/// Action codes dispatched by the orchestrator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Action {
    Ping = 0,
    Store = 1,
    FindNode = 2,
    FindValue = 3,
    Identify = 4,
    GetAddresses = 5,
}

/// The message envelope common to every query and response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub s: u8,
    pub m: MessageType,
    pub a: Action,
    pub i: String,
    pub q: u64,
    pub d: ciborium::Value,
}

impl Envelope {
    pub fn new(m: MessageType, a: Action, sender: Id, msg_id: u64, payload: impl Serialize) -> Result<Self> {
        let d = ciborium::Value::serialized(&payload)
            .map_err(|e| DhtError::Malformed(format!("encoding payload: {e}")))?;
        Ok(Self {
            s: SCHEMA_VERSION,
            m,
            a,
            i: sender.to_base58(),
            q: msg_id,
            d,
        })
    }

    pub fn sender_id(&self) -> Result<Id> {
        Id::from_base58(&self.i).map_err(|e| DhtError::Malformed(format!("sender id: {e}")))
    }

    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        self.d
            .deserialized()
            .map_err(|e| DhtError::Malformed(format!("decoding payload: {e}")))
    }
}

/// Encode an envelope to CBOR bytes.
pub fn to_vec(env: &Envelope) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(env, &mut buf)
        .map_err(|e| DhtError::Malformed(format!("encoding envelope: {e}")))?;
    Ok(buf)
}

/// Decode CBOR bytes into an envelope, rejecting oversized datagrams first.
pub fn from_slice(data: &[u8]) -> Result<Envelope> {
    if data.len() > MAX_DATA_SIZE {
        return Err(DhtError::OversizedDatagram {
            size: data.len(),
            max: MAX_DATA_SIZE,
        });
    }
    ciborium::from_reader(data).map_err(|e| DhtError::Malformed(format!("decoding envelope: {e}")))
}

/// `peer_object` `{t,a,p,i}` — transport, host, port, id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerObject {
    pub t: Transport,
    pub a: String,
    pub p: u16,
    pub i: String,
}

impl PeerObject {
    pub fn from_addr_id(addr: &Addr, id: Id) -> Self {
        Self {
            t: addr.transport,
            a: addr.host.clone(),
            p: addr.port,
            i: id.to_base58(),
        }
    }

    pub fn to_addr(&self) -> Addr {
        Addr::new(self.t, self.a.clone(), self.p)
    }

    pub fn id(&self) -> Result<Id> {
        Id::from_base58(&self.i).map_err(|e| DhtError::Malformed(format!("peer id: {e}")))
    }
}

/// `store_query` `{k,d,v,o?,t,s}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreQuery {
    pub k: String,
    pub d: u8,
    pub v: serde_bytes_vec::Bytes,
    pub o: Option<PeerObject>,
    pub t: u64,
    pub s: serde_bytes_vec::Bytes,
}

/// `store_resp` `{c,s}` — checksum, status.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreResp {
    pub c: serde_bytes_vec::Bytes,
    pub s: StoreStatus,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreStatus {
    Ok,
    Bad,
}

/// `find_query` `{t}` — target id (base58).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FindQuery {
    pub t: String,
}

/// `find_node_resp` `{b,s}` — list of peer-objects, signature over serialized list.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FindNodeResp {
    pub b: Vec<PeerObject>,
    pub s: serde_bytes_vec::Bytes,
}

/// `find_value_resp` `{v?,b?}` — exactly one present: stored value or bucket.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FindValueResp {
    pub v: Option<StoredValue>,
    pub b: Option<FindNodeResp>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredValue {
    pub k: String,
    pub d: u8,
    pub v: serde_bytes_vec::Bytes,
    pub o: PeerObject,
    pub t: u64,
    pub s: serde_bytes_vec::Bytes,
}

/// `identify_query` `{s}` — secret token.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdentifyQuery {
    pub s: serde_bytes_vec::Bytes,
}

/// `identify_resp` `{k,s}` — public key, signed token blob.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdentifyResp {
    pub k: serde_bytes_vec::Bytes,
    pub s: serde_bytes_vec::Bytes,
}

/// `get_addresses_query` `{i}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetAddressesQuery {
    pub i: String,
}

/// `get_addresses_resp` `{i,p}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetAddressesResp {
    pub i: String,
    pub p: Vec<PeerObject>,
}

/// Minimal byte-vec wrapper so CBOR encodes these fields as byte strings
/// rather than arrays of integers.
pub mod serde_bytes_vec {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Clone, Debug, PartialEq, Eq, Default)]
    pub struct Bytes(pub Vec<u8>);

    impl From<Vec<u8>> for Bytes {
        fn from(v: Vec<u8>) -> Self {
            Bytes(v)
        }
    }

    impl From<Bytes> for Vec<u8> {
        fn from(b: Bytes) -> Self {
            b.0
        }
    }

    impl AsRef<[u8]> for Bytes {
        fn as_ref(&self) -> &[u8] {
            &self.0
        }
    }

    impl Serialize for Bytes {
        fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
            s.serialize_bytes(&self.0)
        }
    }

    impl<'de> Deserialize<'de> for Bytes {
        fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
            struct BytesVisitor;

            impl<'de> serde::de::Visitor<'de> for BytesVisitor {
                type Value = Vec<u8>;

                fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    write!(f, "a byte string")
                }

                fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
                    Ok(v.to_vec())
                }

                fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
                    Ok(v)
                }

                fn visit_seq<A: serde::de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                    let mut out = Vec::new();
                    while let Some(b) = seq.next_element()? {
                        out.push(b);
                    }
                    Ok(out)
                }
            }

            Ok(Bytes(d.deserialize_byte_buf(BytesVisitor)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_id() -> Id {
        Id::new([7u8; crate::id::ID_BYTES])
    }

    #[test]
    fn test_envelope_roundtrip() {
        let query = FindQuery {
            t: sample_id().to_base58(),
        };
        let env = Envelope::new(MessageType::Query, Action::FindNode, sample_id(), 42, &query)
            .expect("encode envelope");
        let bytes = to_vec(&env).expect("encode bytes");
        let decoded = from_slice(&bytes).expect("decode bytes");
        assert_eq!(decoded.q, 42);
        assert_eq!(decoded.a, Action::FindNode);
        let payload: FindQuery = decoded.payload().expect("decode payload");
        assert_eq!(payload.t, query.t);
    }

    #[test]
    fn test_oversized_datagram_rejected() {
        let data = vec![0u8; MAX_DATA_SIZE + 1];
        let err = from_slice(&data).expect_err("oversized datagram should be rejected");
        assert!(matches!(err, DhtError::OversizedDatagram { .. }));
    }

    #[test]
    fn test_malformed_message_rejected() {
        let err = from_slice(&[0xFF, 0xFF, 0xFF]).expect_err("malformed message should be rejected");
        assert!(matches!(err, DhtError::Malformed(_)));
    }

    #[test]
    fn test_peer_object_roundtrip() {
        let addr = Addr::new(Transport::Udp, "127.0.0.1", 6881);
        let id = sample_id();
        let po = PeerObject::from_addr_id(&addr, id);
        assert_eq!(po.to_addr(), addr);
        assert_eq!(po.id().expect("valid id"), id);
    }

    #[test]
    fn test_store_status_roundtrip() {
        let resp = StoreResp {
            c: vec![1, 2, 3].into(),
            s: StoreStatus::Bad,
        };
        let mut buf = Vec::new();
        ciborium::into_writer(&resp, &mut buf).expect("encode");
        let decoded: StoreResp = ciborium::from_reader(buf.as_slice()).expect("decode");
        assert_eq!(decoded.s, StoreStatus::Bad);
        assert_eq!(decoded.c.0, vec![1, 2, 3]);
    }
}
