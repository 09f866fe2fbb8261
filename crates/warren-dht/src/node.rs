//! The node orchestrator: RPC handlers, gatekeeping, background refresh and
//! republish loops, and the public `put`/`get`/`provide`/`join` API (§4.5,
//! §4.6).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::RngCore;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::addr::{Addr, Contact, Peer};
use crate::config::NodeConfig;
use crate::id::Id;
use crate::identity::{Identity, Keystore};
use crate::lookup::{self, FindValueOutcome, NodeRpc};
use crate::record::{now_unix, KV, Provider, RecordTable, RecordType};
use crate::routing::{self, RoutingTable, UpdateOutcome};
use crate::transport::Transport;
use crate::wire::{
    Action, Envelope, FindNodeResp, FindQuery, FindValueResp, GetAddressesQuery, GetAddressesResp,
    IdentifyQuery, IdentifyResp, MessageType, PeerObject, StoreQuery, StoreResp, StoreStatus, StoredValue,
};
use crate::{queue::MessageQueue, DhtError, Result};
use warren_crypto::ed25519::{Signature, VerifyingKey};

fn signature_from_slice(bytes: &[u8], what: &str) -> Result<Signature> {
    let arr: [u8; 64] = bytes
        .try_into()
        .map_err(|_| DhtError::Malformed(format!("{what} signature length")))?;
    Ok(Signature::from_bytes(&arr))
}

fn encode_peer_list(peers: &[PeerObject]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(peers, &mut buf).map_err(|e| DhtError::Malformed(e.to_string()))?;
    Ok(buf)
}

/// The DHT node: owns the routing table, record table, keystore, message
/// queue, and transport handle.
pub struct Node {
    pub identity: Identity,
    pub config: NodeConfig,
    pub table: RwLock<RoutingTable>,
    pub records: RecordTable,
    pub keystore: Keystore,
    queue: Arc<MessageQueue>,
    transport: Arc<dyn Transport>,
    msg_id: AtomicU64,
}

impl Node {
    pub fn new(identity: Identity, config: NodeConfig, transport: Arc<dyn Transport>) -> Arc<Self> {
        let table = RwLock::new(RoutingTable::new(identity.id));
        Arc::new(Self {
            identity,
            config,
            table,
            records: RecordTable::new(),
            keystore: Keystore::new(),
            queue: Arc::new(MessageQueue::new()),
            transport,
            msg_id: AtomicU64::new(1),
        })
    }

    fn next_msg_id(&self) -> u64 {
        self.msg_id.fetch_add(1, Ordering::Relaxed)
    }

    fn self_peer_object(&self) -> PeerObject {
        PeerObject::from_addr_id(&self.config.bind_addr, self.identity.id)
    }

    // ---- outbound RPC plumbing -------------------------------------------------

    async fn rpc<T: serde::Serialize>(&self, contact: &Contact, action: Action, payload: T) -> Result<Envelope> {
        let msg_id = self.next_msg_id();
        let env = Envelope::new(MessageType::Query, action, self.identity.id, msg_id, payload)?;
        let bytes = crate::wire::to_vec(&env)?;
        let queue = self.queue.clone();
        let transport = self.transport.clone();
        let reply = crate::queue::send_with_failover(queue, contact, action, msg_id, move |addr| {
            let transport = transport.clone();
            let bytes = bytes.clone();
            async move { transport.send(&addr, bytes).await }
        })
        .await?;
        crate::wire::from_slice(&reply.payload)
    }

    /// Perform the identify handshake against `contact` (§4.5). On success
    /// the peer's verifying key is retained in the keystore and the peer's
    /// id is returned.
    ///
    /// `contact.id` may be [`Id::ZERO`] when the caller does not yet know the
    /// peer's id (e.g. an unresolved bootstrap seed) — in that case the id
    /// is learned from the reply instead of being required to match. When
    /// `contact.id` is a concrete, already-claimed id (resolve,
    /// get_addresses), it must match the derived id or the exchange fails
    /// with `IdentityMismatch`.
    pub async fn identify_peer(&self, contact: &Contact) -> Result<Id> {
        let mut token = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut token);

        let env = self
            .rpc(contact, Action::Identify, IdentifyQuery { s: token.to_vec().into() })
            .await?;
        let resp: IdentifyResp = env.payload()?;

        let key_bytes: [u8; 32] = resp
            .k
            .0
            .as_slice()
            .try_into()
            .map_err(|_| DhtError::Malformed("identify public key length".to_string()))?;
        let verifying_key = VerifyingKey::from_bytes(&key_bytes)?;

        // The responder signs over the requester's address as *it* observed
        // it, i.e. our own advertised bind address, not the address we
        // dialed the responder on (§4.5).
        let blob = crate::identity::identify_blob(&token, &self.config.bind_addr.host, self.config.bind_addr.port);
        let sig = signature_from_slice(resp.s.0.as_slice(), "identify")?;
        verifying_key
            .verify(&blob, &sig)
            .map_err(|_| DhtError::InvalidSignature)?;

        let derived = Id::from_public_key(&verifying_key);
        let claimed = if contact.id == Id::ZERO { derived } else { contact.id };
        self.keystore.verify_and_insert(claimed, verifying_key)?;
        Ok(claimed)
    }

    /// Issue `get_addresses(id)` to `contact` and return addresses whose
    /// owner successfully identifies as `id` (§4.5).
    pub async fn get_addresses(&self, contact: &Contact, target: Id) -> Result<Vec<Addr>> {
        let env = self
            .rpc(contact, Action::GetAddresses, GetAddressesQuery { i: target.to_base58() })
            .await?;
        let resp: GetAddressesResp = env.payload()?;

        let mut verified = Vec::new();
        for po in resp.p {
            let addr = po.to_addr();
            let candidate = Contact::single(target, addr.clone());
            if self.identify_peer(&candidate).await.is_ok() {
                verified.push(addr);
            }
        }
        Ok(verified)
    }

    /// Iterative node lookup for `id`, followed by `get_addresses` against
    /// each returned contact; verified addresses are merged in. If `add`,
    /// each verified address is folded into the routing table (§4.5 resolve).
    pub async fn resolve(self: &Arc<Self>, id: Id, add: bool) -> Vec<Addr> {
        let contacts = lookup::find_node_lookup(&self.table, self.as_ref(), self.identity.id, id).await;
        let mut merged = Vec::new();
        for contact in &contacts {
            if let Ok(addrs) = self.get_addresses(contact, id).await {
                for addr in addrs {
                    if add {
                        let peer = Peer::new(id, addr.clone());
                        self.integrate(&peer).await;
                    }
                    merged.push(addr);
                }
            }
        }
        merged
    }

    /// Feed an observed live peer into the routing table, following through
    /// on any liveness check the split policy requests (§4.1).
    async fn integrate(&self, peer: &Peer) {
        let now = now_unix();
        let outcome = {
            let mut table = self.table.write().await;
            table.update(peer, now)
        };
        if let UpdateOutcome::NeedsLivenessCheck(check) = outcome {
            let head_contact = Contact::new(check.head_id, check.head_addresses.clone());
            match self.rpc(&head_contact, Action::Ping, ()).await {
                Ok(_) => {
                    if let Some(addr) = check.head_addresses.first() {
                        let mut table = self.table.write().await;
                        table.responded(check.head_id, addr.clone(), now_unix());
                    }
                }
                Err(_) => {
                    let mut table = self.table.write().await;
                    for addr in &check.head_addresses {
                        table.stale(check.head_id, addr.clone(), now_unix());
                    }
                }
            }
        }
    }

    // ---- inbound dispatch -------------------------------------------------

    /// Handle one inbound datagram. Malformed or oversized datagrams are
    /// dropped silently (§7).
    pub async fn handle_datagram(self: &Arc<Self>, from_addr: Addr, bytes: Vec<u8>) {
        let env = match crate::wire::from_slice(&bytes) {
            Ok(e) => e,
            Err(e) => {
                debug!(error = %e, "dropping malformed datagram");
                return;
            }
        };
        let sender_id = match env.sender_id() {
            Ok(id) => id,
            Err(_) => return,
        };

        match env.m {
            MessageType::Response => {
                self.queue.satisfy(Some(sender_id), from_addr, env.a, env.q, bytes).await;
            }
            MessageType::Query => {
                self.dispatch_query(from_addr, sender_id, env).await;
            }
        }
    }

    /// Gatekeeping (§4.5): any query other than identify/get_addresses from
    /// an unknown peer triggers an identify exchange first.
    async fn dispatch_query(self: &Arc<Self>, from_addr: Addr, sender_id: Id, env: Envelope) {
        if !matches!(env.a, Action::Identify | Action::GetAddresses) && !self.keystore.knows(&sender_id) {
            let contact = Contact::single(sender_id, from_addr.clone());
            if let Err(e) = self.identify_peer(&contact).await {
                warn!(peer = %sender_id, error = %e, "identify gate failed, dropping original message");
                return;
            }
        }
        self.process_query(from_addr, sender_id, env).await;
    }

    async fn process_query(self: &Arc<Self>, from_addr: Addr, sender_id: Id, env: Envelope) {
        self.integrate(&Peer::new(sender_id, from_addr.clone())).await;

        let action = env.a;
        let msg_id = env.q;
        let result = match action {
            Action::Ping => self.send_response(&from_addr, sender_id, msg_id, Action::Ping, ()).await,
            Action::Store => self.handle_store(&from_addr, sender_id, env).await,
            Action::FindNode => self.handle_find_node(&from_addr, sender_id, env).await,
            Action::FindValue => self.handle_find_value(&from_addr, sender_id, env).await,
            Action::Identify => self.handle_identify(&from_addr, sender_id, env).await,
            Action::GetAddresses => self.handle_get_addresses(&from_addr, sender_id, env).await,
        };
        if let Err(e) = result {
            debug!(peer = %sender_id, action = ?action, error = %e, "query handler failed");
        }
    }

    async fn send_response<T: serde::Serialize>(
        &self,
        to: &Addr,
        _sender_id: Id,
        msg_id: u64,
        action: Action,
        payload: T,
    ) -> Result<()> {
        let env = Envelope::new(MessageType::Response, action, self.identity.id, msg_id, payload)?;
        let bytes = crate::wire::to_vec(&env)?;
        self.transport.send(to, bytes).await
    }

    async fn handle_store(self: &Arc<Self>, from_addr: &Addr, sender_id: Id, env: Envelope) -> Result<()> {
        let query: StoreQuery = env.payload()?;
        let key = Id::from_base58(&query.k).map_err(|e| DhtError::Malformed(e.to_string()))?;
        let origin = match query.o {
            Some(po) => Peer::new(po.id()?, po.to_addr()),
            None => Peer::new(sender_id, from_addr.clone()),
        };

        let record_type = if query.d == 1 { RecordType::Provider } else { RecordType::Data };
        let kv = KV {
            key,
            record_type,
            value: query.v.0.clone(),
            origin: origin.clone(),
            timestamp: query.t,
            signature: signature_from_slice(query.s.0.as_slice(), "store")?,
        };

        let status = self.validate_and_insert(kv).await;
        let checksum = warren_crypto::blake3::hash(&query.v.0).to_vec();
        self.send_response(
            from_addr,
            sender_id,
            env.q,
            Action::Store,
            StoreResp {
                c: checksum.into(),
                s: status,
            },
        )
        .await
    }

    async fn validate_and_insert(&self, kv: KV) -> StoreStatus {
        let Some(origin_key) = self.keystore.get(&kv.origin.id) else {
            return StoreStatus::Bad;
        };
        if kv.verify(&origin_key).is_err() {
            return StoreStatus::Bad;
        }

        if kv.record_type == RecordType::Provider {
            let Ok(provider) = Provider::decode(&kv.value) else {
                return StoreStatus::Bad;
            };
            if !provider.expiry_in_range(now_unix()) {
                return StoreStatus::Bad;
            }
            let Some(provider_key) = self.keystore.get(&provider.provider_id) else {
                return StoreStatus::Bad;
            };
            if provider.verify(&provider_key).is_err() {
                return StoreStatus::Bad;
            }
        }

        match self.records.insert(kv) {
            Ok(()) => StoreStatus::Ok,
            Err(_) => StoreStatus::Bad,
        }
    }

    async fn handle_find_node(self: &Arc<Self>, from_addr: &Addr, sender_id: Id, env: Envelope) -> Result<()> {
        let query: FindQuery = env.payload()?;
        let target = Id::from_base58(&query.t).map_err(|e| DhtError::Malformed(e.to_string()))?;
        let entries = {
            let table = self.table.read().await;
            table.find_closest(&target, crate::K)
        };
        let peers: Vec<PeerObject> = entries
            .iter()
            .flat_map(|e| e.addresses.iter().map(move |(a, _)| PeerObject::from_addr_id(a, e.id)))
            .collect();
        let sig_bytes = self.sign_peer_list(&peers)?;
        self.send_response(
            from_addr,
            sender_id,
            env.q,
            Action::FindNode,
            FindNodeResp {
                b: peers,
                s: sig_bytes.into(),
            },
        )
        .await
    }

    fn sign_peer_list(&self, peers: &[PeerObject]) -> Result<Vec<u8>> {
        let buf = encode_peer_list(peers)?;
        Ok(self.identity.sign(&buf).to_bytes().to_vec())
    }

    /// Fetch `contact`'s verifying key from the keystore, identifying them
    /// first if they aren't already known.
    async fn peer_key(&self, contact: &Contact) -> Result<VerifyingKey> {
        if let Some(key) = self.keystore.get(&contact.id) {
            return Ok(key);
        }
        self.identify_peer(contact).await?;
        self.keystore.get(&contact.id).ok_or(DhtError::InvalidSignature)
    }

    /// Verify a responder's signature over a peer list (§4.5), evicting the
    /// cached key and erroring on failure (§7 signature-invalid).
    fn verify_peer_list(&self, signer: Id, key: &VerifyingKey, peers: &[PeerObject], sig_bytes: &[u8]) -> Result<()> {
        let buf = encode_peer_list(peers)?;
        let sig = signature_from_slice(sig_bytes, "peer list")?;
        if key.verify(&buf, &sig).is_err() {
            self.keystore.evict(&signer);
            return Err(DhtError::InvalidSignature);
        }
        Ok(())
    }

    async fn handle_find_value(self: &Arc<Self>, from_addr: &Addr, sender_id: Id, env: Envelope) -> Result<()> {
        let query: FindQuery = env.payload()?;
        let key = Id::from_base58(&query.t).map_err(|e| DhtError::Malformed(e.to_string()))?;

        if let Some(kv) = self.records.get(&key) {
            let stored = StoredValue {
                k: kv.key.to_base58(),
                d: if kv.record_type == RecordType::Provider { 1 } else { 0 },
                v: kv.value.clone().into(),
                o: PeerObject::from_addr_id(&kv.origin.addr, kv.origin.id),
                t: kv.timestamp,
                s: kv.signature.to_bytes().to_vec().into(),
            };
            return self
                .send_response(
                    from_addr,
                    sender_id,
                    env.q,
                    Action::FindValue,
                    FindValueResp { v: Some(stored), b: None },
                )
                .await;
        }

        let entries = {
            let table = self.table.read().await;
            table.find_closest(&key, crate::K)
        };
        let peers: Vec<PeerObject> = entries
            .iter()
            .flat_map(|e| e.addresses.iter().map(move |(a, _)| PeerObject::from_addr_id(a, e.id)))
            .collect();
        let sig_bytes = self.sign_peer_list(&peers)?;
        self.send_response(
            from_addr,
            sender_id,
            env.q,
            Action::FindValue,
            FindValueResp {
                v: None,
                b: Some(FindNodeResp { b: peers, s: sig_bytes.into() }),
            },
        )
        .await
    }

    async fn handle_identify(self: &Arc<Self>, from_addr: &Addr, sender_id: Id, env: Envelope) -> Result<()> {
        let query: IdentifyQuery = env.payload()?;
        // Sign over the requester's address as observed on this datagram
        // (§4.5), not our own bind address — the caller verifies against
        // its own advertised address.
        let signature = self.identity.sign_identify_token(&query.s.0, &from_addr.host, from_addr.port);
        self.send_response(
            from_addr,
            sender_id,
            env.q,
            Action::Identify,
            IdentifyResp {
                k: self.identity.keypair.verifying_key.to_bytes().to_vec().into(),
                s: signature.to_bytes().to_vec().into(),
            },
        )
        .await
    }

    async fn handle_get_addresses(self: &Arc<Self>, from_addr: &Addr, sender_id: Id, env: Envelope) -> Result<()> {
        let query: GetAddressesQuery = env.payload()?;
        let target = Id::from_base58(&query.i).map_err(|e| DhtError::Malformed(e.to_string()))?;

        let peers = if target == self.identity.id {
            vec![self.self_peer_object()]
        } else {
            let table = self.table.read().await;
            table
                .find(&target)
                .map(|e| e.addresses.iter().map(|(a, _)| PeerObject::from_addr_id(a, e.id)).collect())
                .unwrap_or_default()
        };

        self.send_response(
            from_addr,
            sender_id,
            env.q,
            Action::GetAddresses,
            GetAddressesResp { i: query.i, p: peers },
        )
        .await
    }

    // ---- public API ---------------------------------------------------------

    /// Join the network: contact every configured seed, then resolve the
    /// local id to populate the routing table.
    pub async fn join(self: &Arc<Self>) -> Result<usize> {
        self.config.validate()?;
        let mut responsive = 0usize;
        for seed in &self.config.seeds {
            // The seed's id is unknown ahead of time; probe with `Id::ZERO`
            // and let identify learn the real id from the reply.
            let probe = Contact::new(Id::ZERO, vec![seed.addr.clone()]);
            if let Ok(seed_id) = self.identify_peer(&probe).await {
                responsive += 1;
                self.integrate(&Peer::new(seed_id, seed.addr.clone())).await;
            }
        }
        if responsive == 0 && !self.config.seeds.is_empty() {
            return Err(DhtError::BootstrapFailed("no seed nodes responded".to_string()));
        }
        self.resolve(self.identity.id, true).await;
        Ok(responsive)
    }

    /// Store a record under `key`, broadcasting to the `K` closest peers.
    pub async fn put(self: &Arc<Self>, key: Id, value: Vec<u8>) -> usize {
        let timestamp = now_unix();
        let origin = Peer::new(self.identity.id, self.config.bind_addr.clone());
        let kv = KV::sign(key, RecordType::Data, value, origin, timestamp, &self.identity.keypair.signing_key);
        self.records.put(kv.clone());

        let contacts = lookup::find_node_lookup(&self.table, self.as_ref(), self.identity.id, key).await;
        let mut stored = 0;
        for contact in &contacts {
            if self.store_remote(contact, &kv).await.is_ok() {
                stored += 1;
            }
        }
        stored
    }

    /// Announce that the local node can provide `key`.
    pub async fn provide(self: &Arc<Self>, key: Id) -> usize {
        let expiry = now_unix() + crate::REPUBLISH_TIME_SECS - 1;
        let provider = Provider::sign(self.identity.id, expiry, &self.identity.keypair.signing_key);
        let Ok(value) = provider.encode() else { return 0 };
        let origin = Peer::new(self.identity.id, self.config.bind_addr.clone());
        let kv = KV::sign(key, RecordType::Provider, value, origin, now_unix(), &self.identity.keypair.signing_key);
        self.records.put(kv.clone());

        let contacts = lookup::find_node_lookup(&self.table, self.as_ref(), self.identity.id, key).await;
        let mut stored = 0;
        for contact in &contacts {
            if self.store_remote(contact, &kv).await.is_ok() {
                stored += 1;
            }
        }
        stored
    }

    async fn store_remote(&self, contact: &Contact, kv: &KV) -> Result<()> {
        let query = StoreQuery {
            k: kv.key.to_base58(),
            d: if kv.record_type == RecordType::Provider { 1 } else { 0 },
            v: kv.value.clone().into(),
            o: Some(PeerObject::from_addr_id(&kv.origin.addr, kv.origin.id)),
            t: kv.timestamp,
            s: kv.signature.to_bytes().to_vec().into(),
        };
        let env = self.rpc(contact, Action::Store, query).await?;
        let _resp: StoreResp = env.payload()?;
        Ok(())
    }

    /// Retrieve a value by key, collecting `quorum` corroborating replies
    /// across `disjoint_paths` concurrent lookups.
    pub async fn get(self: &Arc<Self>, key: Id) -> Vec<KV> {
        let local = self.records.get(&key);
        lookup::disjoint_quorum_lookup(
            &self.table,
            self.as_ref(),
            self.identity.id,
            key,
            self.config.quorum,
            local,
            self.config.disjoint_paths,
        )
        .await
    }

    // ---- background loops ----------------------------------------------------

    /// Spawn the refresh loop: every `refresh_interval`, refresh buckets idle
    /// longer than `refresh_time` (§4.6).
    pub fn spawn_refresh_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(node.config.refresh_interval_secs));
            loop {
                interval.tick().await;
                node.refresh_stale_buckets().await;
            }
        })
    }

    async fn refresh_stale_buckets(self: &Arc<Self>) {
        let now = now_unix();
        let stale_leaves: Vec<_> = {
            let table = self.table.read().await;
            table
                .leaves()
                .into_iter()
                .filter(|leaf| now.saturating_sub(leaf.last_seen) > self.config.refresh_time_secs)
                .collect()
        };

        for leaf in stale_leaves {
            let target = routing::random_id_with_prefix(&leaf.bits);
            let contacts = lookup::find_node_lookup(&self.table, self.as_ref(), self.identity.id, target).await;
            let entries: Vec<routing::Entry> = contacts
                .into_iter()
                .filter_map(|c| c.primary().map(|a| routing::Entry::new(c.id, a.clone())))
                .collect();
            info!(cutoff = leaf.cutoff, found = entries.len(), "refreshed bucket");
            let mut table = self.table.write().await;
            table.replace_leaf(&leaf.bits, entries, now);
        }
    }

    /// Spawn the republish loop: every `republish_interval`, expire stale
    /// provider records and republish aging data records (§4.6).
    pub fn spawn_republish_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(node.config.republish_interval_secs));
            loop {
                interval.tick().await;
                node.republish_pass().await;
            }
        })
    }

    async fn republish_pass(self: &Arc<Self>) {
        let now = now_unix();
        for key in self.records.keys() {
            let Some(kv) = self.records.get(&key) else { continue };
            match kv.record_type {
                RecordType::Provider => {
                    if let Ok(provider) = Provider::decode(&kv.value) {
                        if provider.is_expired(now) {
                            self.records.remove(&key);
                        }
                    }
                }
                RecordType::Data => {
                    if now.saturating_sub(kv.timestamp) > self.config.republish_time_secs {
                        let refreshed = KV::sign(
                            kv.key,
                            RecordType::Data,
                            kv.value.clone(),
                            kv.origin.clone(),
                            now,
                            &self.identity.keypair.signing_key,
                        );
                        self.records.put(refreshed.clone());
                        let contacts = lookup::find_node_lookup(&self.table, self.as_ref(), self.identity.id, key).await;
                        for contact in &contacts {
                            let _ = self.store_remote(contact, &refreshed).await;
                        }
                    }
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl NodeRpc for Node {
    async fn find_node(&self, contact: &Contact, target: Id) -> Result<Vec<Contact>> {
        let env = self.rpc(contact, Action::FindNode, FindQuery { t: target.to_base58() }).await?;
        let resp: FindNodeResp = env.payload()?;
        let key = self.peer_key(contact).await?;
        self.verify_peer_list(contact.id, &key, &resp.b, resp.s.0.as_slice())?;
        let mut by_id: std::collections::HashMap<Id, Vec<Addr>> = std::collections::HashMap::new();
        for po in resp.b {
            let Ok(id) = po.id() else { continue };
            by_id.entry(id).or_default().push(po.to_addr());
        }
        Ok(by_id.into_iter().map(|(id, addresses)| Contact::new(id, addresses)).collect())
    }

    async fn find_value(&self, contact: &Contact, key: Id) -> Result<FindValueOutcome> {
        let env = self.rpc(contact, Action::FindValue, FindQuery { t: key.to_base58() }).await?;
        let resp: FindValueResp = env.payload()?;
        if let Some(stored) = resp.v {
            let origin_id = stored.o.id()?;
            let kv = KV {
                key: Id::from_base58(&stored.k).map_err(|e| DhtError::Malformed(e.to_string()))?,
                record_type: if stored.d == 1 { RecordType::Provider } else { RecordType::Data },
                value: stored.v.0,
                origin: Peer::new(origin_id, stored.o.to_addr()),
                timestamp: stored.t,
                signature: signature_from_slice(stored.s.0.as_slice(), "value")?,
            };
            // The record is signed by its origin, which may differ from the
            // responder relaying it (§4.4).
            let origin_contact = Contact::single(origin_id, kv.origin.addr.clone());
            let origin_key = self.peer_key(&origin_contact).await?;
            if kv.verify(&origin_key).is_err() {
                self.keystore.evict(&origin_id);
                return Err(DhtError::InvalidSignature);
            }
            return Ok(FindValueOutcome::Value(kv));
        }
        let bucket = resp.b.unwrap_or(FindNodeResp { b: vec![], s: vec![].into() });
        let key = self.peer_key(contact).await?;
        self.verify_peer_list(contact.id, &key, &bucket.b, bucket.s.0.as_slice())?;
        let mut by_id: std::collections::HashMap<Id, Vec<Addr>> = std::collections::HashMap::new();
        for po in bucket.b {
            let Ok(id) = po.id() else { continue };
            by_id.entry(id).or_default().push(po.to_addr());
        }
        Ok(FindValueOutcome::Contacts(
            by_id.into_iter().map(|(id, addresses)| Contact::new(id, addresses)).collect(),
        ))
    }

    async fn store(&self, contact: &Contact, record: KV) {
        let _ = self.store_remote(contact, &record).await;
    }

    async fn verify_record(&self, record: &KV) -> bool {
        let contact = Contact::single(record.origin.id, record.origin.addr.clone());
        match self.peer_key(&contact).await {
            Ok(key) => record.verify(&key).is_ok(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Transport as WireTransport;
    use crate::transport::LoopbackRegistry;

    fn addr(port: u16) -> Addr {
        Addr::new(WireTransport::Udp, "127.0.0.1", port)
    }

    async fn spawn_node(registry: &Arc<LoopbackRegistry>, port: u16) -> Arc<Node> {
        let identity = Identity::generate();
        let bind_addr = addr(port);
        let config = NodeConfig { bind_addr: bind_addr.clone(), ..NodeConfig::default() };
        let transport = Arc::new(registry.handle(bind_addr.clone()));
        let node = Node::new(identity, config, transport);
        let mut rx = registry.register(bind_addr);
        let node_for_task = node.clone();
        tokio::spawn(async move {
            while let Some((from, bytes)) = rx.recv().await {
                let node_for_task = node_for_task.clone();
                tokio::spawn(async move {
                    node_for_task.handle_datagram(from, bytes).await;
                });
            }
        });
        node
    }

    #[tokio::test]
    async fn test_identify_handshake_populates_keystore() {
        let registry = LoopbackRegistry::new();
        let a = spawn_node(&registry, 1).await;
        let b = spawn_node(&registry, 2).await;

        let contact_b = Contact::single(b.identity.id, addr(2));
        a.identify_peer(&contact_b).await.expect("identify succeeds");
        assert!(a.keystore.knows(&b.identity.id));
    }

    #[tokio::test]
    async fn test_find_node_round_trip() {
        let registry = LoopbackRegistry::new();
        let a = spawn_node(&registry, 10).await;
        let b = spawn_node(&registry, 11).await;

        a.identify_peer(&Contact::single(b.identity.id, addr(11))).await.expect("identify");
        a.integrate(&Peer::new(b.identity.id, addr(11))).await;

        let contacts = NodeRpc::find_node(a.as_ref(), &Contact::single(b.identity.id, addr(11)), a.identity.id)
            .await
            .expect("find_node succeeds");
        let _ = contacts;
    }

    #[tokio::test]
    async fn test_put_and_get_roundtrip() {
        let registry = LoopbackRegistry::new();
        let a = spawn_node(&registry, 20).await;
        let b = spawn_node(&registry, 21).await;

        a.identify_peer(&Contact::single(b.identity.id, addr(21))).await.expect("identify");
        b.identify_peer(&Contact::single(a.identity.id, addr(20))).await.expect("identify");
        a.integrate(&Peer::new(b.identity.id, addr(21))).await;

        let key = Id::new([42u8; crate::id::ID_BYTES]);
        let stored = a.put(key, b"hello".to_vec()).await;
        assert!(stored >= 1);

        let results = a.get(key).await;
        assert!(results.iter().any(|kv| kv.value == b"hello"));
    }

    #[tokio::test]
    async fn test_provide_and_expiry_removal() {
        let registry = LoopbackRegistry::new();
        let a = spawn_node(&registry, 30).await;
        let key = Id::new([5u8; crate::id::ID_BYTES]);
        a.provide(key).await;
        assert!(a.records.contains(&key));

        // Force-expire by writing an already-expired provider record directly.
        let provider = Provider::sign(a.identity.id, now_unix() - 1, &a.identity.keypair.signing_key);
        let value = provider.encode().expect("encode");
        let origin = Peer::new(a.identity.id, a.config.bind_addr.clone());
        let kv = KV::sign(key, RecordType::Provider, value, origin, now_unix(), &a.identity.keypair.signing_key);
        a.records.put(kv);

        a.republish_pass().await;
        assert!(!a.records.contains(&key));
    }
}
