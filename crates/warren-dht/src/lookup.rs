//! Iterative node lookup and the libp2p-style quorum value lookup, including
//! disjoint-path mode (§4.3, §4.4).
//!
//! Both lookups are generic over [`NodeRpc`] so they can be driven by an
//! in-memory double in tests and by the real transport/queue/wire stack in
//! [`crate::node`].

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::addr::{Addr, Contact};
use crate::id::Id;
use crate::record::KV;
use crate::routing::RoutingTable;
use crate::{Result, ALPHA, K};

/// The result of a `find_value` RPC: either the stored record, or the
/// responder's routing-table contacts near the key.
pub enum FindValueOutcome {
    Value(KV),
    Contacts(Vec<Contact>),
}

/// RPC surface the lookup engine drives. Implemented by the node
/// orchestrator over the real wire/queue stack; implemented by an in-memory
/// double in tests.
#[async_trait::async_trait]
pub trait NodeRpc: Send + Sync {
    async fn find_node(&self, contact: &Contact, target: Id) -> Result<Vec<Contact>>;
    async fn find_value(&self, contact: &Contact, key: Id) -> Result<FindValueOutcome>;
    async fn store(&self, contact: &Contact, record: KV);
    /// Validate a record's origin signature (§4.4): a value is valid only
    /// when its signature verifies against the origin's known key.
    async fn verify_record(&self, record: &KV) -> bool;
}

/// Iterative `FIND_NODE` lookup (§4.3). Returns up to `K` contacts closest to
/// `target`, excluding `local_id`.
pub async fn find_node_lookup(
    table: &RwLock<RoutingTable>,
    rpc: &dyn NodeRpc,
    local_id: Id,
    target: Id,
) -> Vec<Contact> {
    let seed: Vec<Contact> = {
        let t = table.read().await;
        t.find_alpha(&target).into_iter().map(|e| e.to_contact()).collect()
    };
    find_node_lookup_from(rpc, local_id, target, seed, &mut HashSet::new()).await
}

/// Same as [`find_node_lookup`] but seeded explicitly and sharing a
/// claim-set of visited `(id, addr)` pairs with sibling disjoint paths.
pub async fn find_node_lookup_from(
    rpc: &dyn NodeRpc,
    local_id: Id,
    target: Id,
    seed: Vec<Contact>,
    visited: &mut HashSet<(Id, Addr)>,
) -> Vec<Contact> {
    let mut shortlist: VecDeque<Contact> = seed.into();
    let mut res: Vec<Contact> = Vec::new();
    let mut closest: Option<Id> = None;

    loop {
        let mut round = Vec::new();
        while round.len() < ALPHA {
            match shortlist.pop_front() {
                Some(c) => round.push(c),
                None => break,
            }
        }
        if round.is_empty() {
            break;
        }

        for c in &round {
            for addr in &c.addresses {
                visited.insert((c.id, addr.clone()));
            }
        }

        let replies = futures::future::join_all(
            round.iter().map(|c| async move { (c.clone(), rpc.find_node(c, target).await) }),
        )
        .await;

        for (contact, reply) in replies {
            let Ok(discovered) = reply else { continue };
            if contact.id != local_id && !res.iter().any(|r: &Contact| r.id == contact.id) {
                res.push(contact);
            }
            for d in discovered {
                if d.id == local_id {
                    continue;
                }
                let already_visited = d.addresses.iter().any(|a| visited.contains(&(d.id, a.clone())));
                if !already_visited && !shortlist.iter().any(|s| s.id == d.id) {
                    shortlist.push_back(d);
                }
            }
        }

        res.sort_by_key(|c| c.id.distance(&target));
        let mut sorted_shortlist: Vec<Contact> = shortlist.into_iter().collect();
        sorted_shortlist.sort_by_key(|c| c.id.distance(&target));
        shortlist = sorted_shortlist.into();

        let candidate = res.first().map(|c| c.id);
        let made_progress = match (candidate, closest) {
            (Some(cand), Some(prev)) => cand.distance(&target) < prev.distance(&target),
            (Some(_), None) => true,
            (None, _) => false,
        };
        if let Some(cand) = candidate {
            closest = Some(cand);
        }

        if res.is_empty() || shortlist.is_empty() || !made_progress {
            break;
        }
    }

    res.sort_by_key(|c| c.id.distance(&target));
    res.retain(|c| c.id != local_id);
    res.truncate(K);
    res
}

/// A value collected during a quorum lookup.
struct ValueVote {
    record: KV,
}

/// Run a quorum value lookup for `key` (§4.4). `local_value`, if the local
/// record table holds `key`, seeds `best` per the preprocessing rule. When
/// `Q < 2` and a local value exists, it is returned immediately without
/// touching the network.
pub async fn quorum_value_lookup(
    table: &RwLock<RoutingTable>,
    rpc: &dyn NodeRpc,
    local_id: Id,
    key: Id,
    quorum: usize,
    local_value: Option<KV>,
    claimed: Arc<RwLock<HashSet<(Id, Addr)>>>,
) -> Vec<KV> {
    if let Some(ref v) = local_value {
        if quorum < 2 {
            return vec![v.clone()];
        }
    }

    let seed: Vec<Contact> = {
        let t = table.read().await;
        t.find_alpha(&key).into_iter().map(|e| e.to_contact()).collect()
    };

    let mut pn: VecDeque<Contact> = seed.into();
    let mut pq: HashSet<Id> = HashSet::new();
    let mut best: Option<ValueVote> = None;
    let mut pb: Vec<Contact> = Vec::new();
    let mut po: Vec<Contact> = Vec::new();
    let mut cnt = 0usize;

    if let Some(v) = local_value {
        cnt += 1;
        pb.push(Contact::new(local_id, vec![]));
        best = Some(ValueVote { record: v });
    }

    while cnt < quorum && !pn.is_empty() {
        let mut round = Vec::new();
        while round.len() < ALPHA {
            match pn.pop_front() {
                Some(c) => {
                    if pq.contains(&c.id) {
                        continue;
                    }
                    {
                        let mut claim = claimed.write().await;
                        let already_claimed = c.addresses.iter().any(|a| claim.contains(&(c.id, a.clone())));
                        if already_claimed {
                            continue;
                        }
                        for a in &c.addresses {
                            claim.insert((c.id, a.clone()));
                        }
                    }
                    pq.insert(c.id);
                    round.push(c);
                }
                None => break,
            }
        }
        if round.is_empty() {
            break;
        }

        let replies = futures::future::join_all(
            round.iter().map(|c| async move { (c.clone(), rpc.find_value(c, key).await) }),
        )
        .await;

        for (peer, reply) in replies {
            match reply {
                Ok(FindValueOutcome::Value(record)) => {
                    if !rpc.verify_record(&record).await {
                        continue;
                    }
                    cnt += 1;
                    match &best {
                        None => {
                            pb.push(peer);
                            best = Some(ValueVote { record });
                        }
                        Some(current) if record.timestamp == current.record.timestamp => {
                            pb.push(peer);
                        }
                        Some(current) if record.timestamp > current.record.timestamp => {
                            po.append(&mut pb);
                            pb = vec![peer];
                            best = Some(ValueVote { record });
                        }
                        Some(_) => {
                            po.push(peer);
                        }
                    }
                }
                Ok(FindValueOutcome::Contacts(contacts)) => {
                    for c in contacts {
                        if c.id != local_id && !pq.contains(&c.id) && !pn.iter().any(|p| p.id == c.id) {
                            pn.push_back(c);
                        }
                    }
                }
                Err(_) => {}
            }
        }
    }

    if let Some(ref winner) = best {
        for peer in &po {
            rpc.store(peer, winner.record.clone()).await;
        }
    }

    best.into_iter().map(|v| v.record).collect()
}

/// Run `paths` independent lookups seeded from disjoint partitions of the
/// initial shortlist, sharing one claim-set, then merge by `sig_blob`
/// equality (§4.4 Disjoint path mode).
pub async fn disjoint_quorum_lookup(
    table: &RwLock<RoutingTable>,
    rpc: &dyn NodeRpc,
    local_id: Id,
    key: Id,
    quorum: usize,
    local_value: Option<KV>,
    paths: usize,
) -> Vec<KV> {
    let claimed = Arc::new(RwLock::new(HashSet::new()));
    let paths = paths.max(1);

    let results = futures::future::join_all((0..paths).map(|_| {
        let claimed = claimed.clone();
        let local_value = local_value.clone();
        async move { quorum_value_lookup(table, rpc, local_id, key, quorum, local_value, claimed).await }
    }))
    .await;

    let mut merged: Vec<KV> = Vec::new();
    let mut seen_blobs: Vec<Vec<u8>> = Vec::new();
    for records in results {
        for record in records {
            let blob = crate::record::sig_blob(&record.key, &record.value, &record.origin.id, record.timestamp);
            if !seen_blobs.contains(&blob) {
                seen_blobs.push(blob);
                merged.push(record);
            }
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Transport;
    use crate::record::RecordType;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use warren_crypto::ed25519::{KeyPair, VerifyingKey};

    fn addr(port: u16) -> Addr {
        Addr::new(Transport::Udp, "127.0.0.1", port)
    }

    fn id_from_u8(b: u8) -> Id {
        let mut bytes = [0u8; crate::id::ID_BYTES];
        bytes[0] = b;
        Id::new(bytes)
    }

    /// An in-memory fake peer graph: every peer knows a fixed neighbor list
    /// and optionally holds a value.
    struct FakeNetwork {
        neighbors: StdMutex<HashMap<Id, Vec<Contact>>>,
        values: StdMutex<HashMap<Id, KV>>,
        keys: StdMutex<HashMap<Id, VerifyingKey>>,
    }

    impl FakeNetwork {
        fn new(neighbors: HashMap<Id, Vec<Contact>>, values: HashMap<Id, KV>, keys: HashMap<Id, VerifyingKey>) -> Self {
            Self {
                neighbors: StdMutex::new(neighbors),
                values: StdMutex::new(values),
                keys: StdMutex::new(keys),
            }
        }
    }

    #[async_trait::async_trait]
    impl NodeRpc for FakeNetwork {
        async fn find_node(&self, contact: &Contact, _target: Id) -> Result<Vec<Contact>> {
            Ok(self.neighbors.lock().expect("lock").get(&contact.id).cloned().unwrap_or_default())
        }

        async fn find_value(&self, contact: &Contact, key: Id) -> Result<FindValueOutcome> {
            if let Some(v) = self.values.lock().expect("lock").get(&key) {
                return Ok(FindValueOutcome::Value(v.clone()));
            }
            Ok(FindValueOutcome::Contacts(
                self.neighbors.lock().expect("lock").get(&contact.id).cloned().unwrap_or_default(),
            ))
        }

        async fn store(&self, _contact: &Contact, _record: KV) {}

        async fn verify_record(&self, record: &KV) -> bool {
            match self.keys.lock().expect("lock").get(&record.origin.id) {
                Some(key) => record.verify(key).is_ok(),
                None => false,
            }
        }
    }

    #[tokio::test]
    async fn test_find_node_lookup_converges_on_direct_neighbor() {
        let local_id = id_from_u8(0);
        let target_id = id_from_u8(9);
        let target_contact = Contact::new(target_id, vec![addr(9)]);

        let mut neighbors = HashMap::new();
        neighbors.insert(target_id, vec![]);
        let net = FakeNetwork::new(neighbors, HashMap::new(), HashMap::new());

        let table = RwLock::new(RoutingTable::new(local_id));
        let result = find_node_lookup_from(&net, local_id, target_id, vec![target_contact.clone()], &mut HashSet::new()).await;

        assert!(result.iter().any(|c| c.id == target_id));
        let _ = table;
    }

    #[tokio::test]
    async fn test_quorum_lookup_returns_local_value_when_quorum_below_two() {
        let local_id = id_from_u8(0);
        let kp = KeyPair::generate();
        let origin_id = Id::from_public_key(&kp.verifying_key);
        let key = id_from_u8(5);
        let record = KV::sign(
            key,
            RecordType::Data,
            b"value".to_vec(),
            crate::addr::Peer::new(origin_id, addr(1)),
            100,
            &kp.signing_key,
        );

        let net = FakeNetwork::new(HashMap::new(), HashMap::new(), HashMap::new());
        let table = RwLock::new(RoutingTable::new(local_id));
        let claimed = Arc::new(RwLock::new(HashSet::new()));

        let result = quorum_value_lookup(&table, &net, local_id, key, 1, Some(record.clone()), claimed).await;
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].value, record.value);
    }

    #[tokio::test]
    async fn test_quorum_lookup_dedupes_by_sig_blob() {
        let local_id = id_from_u8(0);
        let kp = KeyPair::generate();
        let origin_id = Id::from_public_key(&kp.verifying_key);
        let key = id_from_u8(6);
        let peer_id = id_from_u8(7);
        let peer_contact = Contact::new(peer_id, vec![addr(7)]);

        let record = KV::sign(
            key,
            RecordType::Data,
            b"v1".to_vec(),
            crate::addr::Peer::new(origin_id, addr(1)),
            50,
            &kp.signing_key,
        );

        let mut values = HashMap::new();
        values.insert(key, record.clone());
        let mut keys = HashMap::new();
        keys.insert(origin_id, kp.verifying_key);
        let net = FakeNetwork::new(HashMap::new(), values, keys);

        let table = RwLock::new(RoutingTable::new(local_id));
        {
            let mut t = table.write().await;
            t.update(&crate::addr::Peer::new(peer_id, addr(7)), 0);
        }
        let result = disjoint_quorum_lookup(&table, &net, local_id, key, 1, None, 2).await;
        let _ = peer_contact;
        assert!(!result.is_empty());
    }

    #[tokio::test]
    async fn test_quorum_lookup_rejects_forged_value() {
        let local_id = id_from_u8(0);
        let kp = KeyPair::generate();
        let origin_id = Id::from_public_key(&kp.verifying_key);
        let key = id_from_u8(8);
        let peer_id = id_from_u8(9);

        let mut record = KV::sign(
            key,
            RecordType::Data,
            b"real".to_vec(),
            crate::addr::Peer::new(origin_id, addr(1)),
            50,
            &kp.signing_key,
        );
        // Tamper the value after signing, simulating a forged reply.
        record.value = b"forged".to_vec();

        let mut values = HashMap::new();
        values.insert(key, record);
        let mut keys = HashMap::new();
        keys.insert(origin_id, kp.verifying_key);
        let net = FakeNetwork::new(HashMap::new(), values, keys);

        let table = RwLock::new(RoutingTable::new(local_id));
        {
            let mut t = table.write().await;
            t.update(&crate::addr::Peer::new(peer_id, addr(9)), 0);
        }
        let result = quorum_value_lookup(&table, &net, local_id, key, 1, None, Arc::new(RwLock::new(HashSet::new()))).await;
        assert!(result.is_empty());
    }
}
