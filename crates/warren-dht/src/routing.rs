//! XOR trie routing table: buckets, replacement caches, stale-address
//! accounting, and the bucket-split policy (§4.1).
//!
//! The trie itself performs no network I/O. The "far and full" branch of the
//! split policy calls for a liveness check against a bucket's head entry;
//! this module surfaces that need as [`UpdateOutcome::NeedsLivenessCheck`]
//! and leaves the actual ping, and the follow-up [`RoutingTable::responded`]
//! or [`RoutingTable::stale`] call, to the orchestrator.

use std::collections::VecDeque;

use rand::RngCore;

use crate::addr::{Addr, Peer};
use crate::id::Id;
use crate::{ADDR_LIMIT, K, MAX_STALE, REPL_CACHE_SIZE};

/// A routing-table entry: an id paired with its known addresses and their
/// per-address staleness counters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub id: Id,
    pub addresses: Vec<(Addr, u32)>,
}

impl Entry {
    pub fn new(id: Id, addr: Addr) -> Self {
        Self {
            id,
            addresses: vec![(addr, 0)],
        }
    }

    pub fn addrs(&self) -> Vec<Addr> {
        self.addresses.iter().map(|(a, _)| a.clone()).collect()
    }

    pub fn to_contact(&self) -> crate::addr::Contact {
        crate::addr::Contact::new(self.id, self.addrs())
    }
}

/// An LRU-ordered bucket of up to [`K`] entries, plus its replacement cache.
///
/// Order is LRU: the back of `entries` is the most-recently-active entry,
/// the front is the eviction/liveness-check candidate.
#[derive(Debug, Default)]
pub struct Bucket {
    pub entries: VecDeque<Entry>,
    pub cache: VecDeque<Peer>,
    pub last_seen: u64,
}

impl Bucket {
    fn new() -> Self {
        Self::default()
    }

    fn touch(&mut self, now: u64) {
        self.last_seen = now;
    }

    /// Add a peer to the replacement cache, or move it to the tail if already present.
    fn cache_push(&mut self, peer: Peer) {
        if let Some(pos) = self.cache.iter().position(|p| p.id == peer.id) {
            self.cache.remove(pos);
        }
        self.cache.push_back(peer);
        if self.cache.len() > REPL_CACHE_SIZE {
            self.cache.pop_front();
        }
    }
}

/// What happened as a result of [`RoutingTable::update`].
#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    /// The peer already had an entry; it was refreshed and moved to the tail.
    Updated,
    /// A new entry was appended to a non-full bucket (possibly after the
    /// bucket split because it shared the local id's prefix).
    Inserted,
    /// The bucket is far and full; the peer was stashed in the replacement
    /// cache and the bucket's head entry needs a liveness check.
    NeedsLivenessCheck(LivenessCheck),
}

/// A pending liveness check against a bucket's head entry, produced when a
/// far, full bucket receives an update. The caller should ping
/// `head_addresses` in order and call [`RoutingTable::responded`] on the
/// first success, or [`RoutingTable::stale`] for each address on total
/// failure.
#[derive(Debug, Clone)]
pub struct LivenessCheck {
    pub head_id: Id,
    pub head_addresses: Vec<Addr>,
}

enum TrieNode {
    Leaf(Bucket),
    Internal {
        left: Box<TrieNode>,
        right: Box<TrieNode>,
    },
}

impl Default for TrieNode {
    fn default() -> Self {
        TrieNode::Leaf(Bucket::new())
    }
}

/// Metadata about a single leaf, returned by [`RoutingTable::leaves`] for the
/// refresh loop to inspect without holding a reference into the trie.
#[derive(Debug, Clone)]
pub struct LeafInfo {
    pub bits: Vec<bool>,
    pub cutoff: usize,
    pub last_seen: u64,
    pub entries: Vec<Entry>,
}

/// The XOR trie. Owns every bucket exclusively; buckets own their entries
/// and replacement cache exclusively (§3 Ownership).
pub struct RoutingTable {
    root: TrieNode,
    local_id: Id,
}

impl RoutingTable {
    pub fn new(local_id: Id) -> Self {
        Self {
            root: TrieNode::Leaf(Bucket::new()),
            local_id,
        }
    }

    pub fn local_id(&self) -> Id {
        self.local_id
    }

    /// Integrate an observation of a live peer (§4.1 split policy).
    pub fn update(&mut self, peer: &Peer, now: u64) -> UpdateOutcome {
        Self::update_node(&mut self.root, 0, &self.local_id, peer, now)
    }

    fn update_node(node: &mut TrieNode, depth: usize, local_id: &Id, peer: &Peer, now: u64) -> UpdateOutcome {
        if let TrieNode::Internal { left, right } = node {
            let next = if peer.id.bit(depth) { right.as_mut() } else { left.as_mut() };
            return Self::update_node(next, depth + 1, local_id, peer, now);
        }

        let bucket = match node {
            TrieNode::Leaf(b) => b,
            TrieNode::Internal { .. } => unreachable!(),
        };

        if let Some(pos) = bucket.entries.iter().position(|e| e.id == peer.id) {
            let mut entry = bucket.entries.remove(pos).expect("position is valid");
            if !entry.addresses.iter().any(|(a, _)| *a == peer.addr) && entry.addresses.len() < ADDR_LIMIT {
                entry.addresses.push((peer.addr.clone(), 0));
            }
            bucket.entries.push_back(entry);
            bucket.touch(now);
            return UpdateOutcome::Updated;
        }

        if bucket.entries.len() < K {
            bucket.entries.push_back(Entry::new(peer.id, peer.addr.clone()));
            bucket.touch(now);
            return UpdateOutcome::Inserted;
        }

        if local_id.shares_prefix(&peer.id, depth) {
            Self::split_leaf(node, depth);
            return Self::update_node(node, depth, local_id, peer, now);
        }

        bucket.cache_push(Peer::new(peer.id, peer.addr.clone()));
        let head = bucket.entries.front().expect("full bucket has a head entry");
        let check = LivenessCheck {
            head_id: head.id,
            head_addresses: head.addrs(),
        };
        bucket.touch(now);
        UpdateOutcome::NeedsLivenessCheck(check)
    }

    fn split_leaf(node: &mut TrieNode, depth: usize) {
        let bucket = match std::mem::replace(node, TrieNode::Leaf(Bucket::new())) {
            TrieNode::Leaf(b) => b,
            TrieNode::Internal { .. } => unreachable!(),
        };

        let mut left = Bucket::new();
        let mut right = Bucket::new();
        for entry in bucket.entries {
            if entry.id.bit(depth) {
                right.entries.push_back(entry);
            } else {
                left.entries.push_back(entry);
            }
        }
        left.entries.truncate(K);
        right.entries.truncate(K);
        left.last_seen = bucket.last_seen;
        right.last_seen = bucket.last_seen;

        *node = TrieNode::Internal {
            left: Box::new(TrieNode::Leaf(left)),
            right: Box::new(TrieNode::Leaf(right)),
        };
    }

    fn find_bucket_mut(&mut self, id: &Id) -> &mut Bucket {
        let mut node = &mut self.root;
        let mut depth = 0;
        loop {
            match node {
                TrieNode::Leaf(_) => break,
                TrieNode::Internal { left, right, .. } => {
                    node = if id.bit(depth) { right.as_mut() } else { left.as_mut() };
                    depth += 1;
                }
            }
        }
        match node {
            TrieNode::Leaf(b) => b,
            TrieNode::Internal { .. } => unreachable!(),
        }
    }

    fn find_bucket(&self, id: &Id) -> &Bucket {
        let mut node = &self.root;
        let mut depth = 0;
        loop {
            match node {
                TrieNode::Leaf(_) => break,
                TrieNode::Internal { left, right, .. } => {
                    node = if id.bit(depth) { right.as_ref() } else { left.as_ref() };
                    depth += 1;
                }
            }
        }
        match node {
            TrieNode::Leaf(b) => b,
            TrieNode::Internal { .. } => unreachable!(),
        }
    }

    /// Record a successful liveness check or RPC reply from `id` at `addr`.
    pub fn responded(&mut self, id: Id, addr: Addr, now: u64) {
        let bucket = self.find_bucket_mut(&id);
        let Some(pos) = bucket.entries.iter().position(|e| e.id == id) else {
            return;
        };
        let is_new = !bucket.entries[pos].addresses.iter().any(|(a, _)| *a == addr);
        if is_new {
            if bucket.entries[pos].addresses.len() < ADDR_LIMIT {
                bucket.entries[pos].addresses.push((addr, 0));
            }
        } else if let Some(slot) = bucket.entries[pos].addresses.iter_mut().find(|(a, _)| *a == addr) {
            slot.1 = slot.1.saturating_sub(1);
        }
        let entry = bucket.entries.remove(pos).expect("position is valid");
        bucket.entries.push_back(entry);
        bucket.touch(now);
    }

    /// Record a failed liveness check or RPC timeout from `id` at `addr`.
    pub fn stale(&mut self, id: Id, addr: Addr, now: u64) {
        let bucket = self.find_bucket_mut(&id);
        let Some(pos) = bucket.entries.iter().position(|e| e.id == id) else {
            return;
        };
        if let Some(slot) = bucket.entries[pos].addresses.iter_mut().find(|(a, _)| *a == addr) {
            slot.1 += 1;
        }
        bucket.entries[pos].addresses.retain(|(_, s)| *s <= MAX_STALE);
        if bucket.entries[pos].addresses.is_empty() {
            bucket.entries.remove(pos);
            if let Some(replacement) = bucket.cache.pop_front() {
                bucket.entries.push_back(Entry::new(replacement.id, replacement.addr));
            }
        }
        bucket.touch(now);
    }

    /// Look up the full entry for `id`, if present.
    pub fn find(&self, id: &Id) -> Option<Entry> {
        self.find_bucket(id).entries.iter().find(|e| e.id == *id).cloned()
    }

    /// Up to `ALPHA` entries closest to `target`; if the target's own leaf
    /// holds fewer, the sibling leaf (one level up, no deeper traversal)
    /// supplies the remainder.
    pub fn find_alpha(&self, target: &Id) -> Vec<Entry> {
        self.find_n(target, crate::ALPHA)
    }

    /// Up to `K` entries closest to `target`, same sibling-supplement rule as [`find_alpha`](Self::find_alpha).
    pub fn find_closest(&self, target: &Id, want: usize) -> Vec<Entry> {
        self.find_n(target, want)
    }

    fn find_n(&self, target: &Id, want: usize) -> Vec<Entry> {
        let mut node = &self.root;
        let mut depth = 0;
        let mut parent: Option<&TrieNode> = None;
        loop {
            match node {
                TrieNode::Leaf(bucket) => {
                    let mut entries: Vec<Entry> = bucket.entries.iter().cloned().collect();
                    if entries.len() < want {
                        if let Some(TrieNode::Internal { left, right, .. }) = parent {
                            let went_right = target.bit(depth - 1);
                            let sibling = if went_right { left.as_ref() } else { right.as_ref() };
                            if let TrieNode::Leaf(sib) = sibling {
                                entries.extend(sib.entries.iter().cloned());
                            }
                        }
                    }
                    entries.sort_by_key(|e| e.id.distance(target));
                    entries.truncate(want);
                    return entries;
                }
                TrieNode::Internal { left, right, .. } => {
                    parent = Some(node);
                    node = if target.bit(depth) { right.as_ref() } else { left.as_ref() };
                    depth += 1;
                }
            }
        }
    }

    /// Visit every non-empty leaf bucket.
    pub fn dfs<F: FnMut(&Bucket)>(&self, mut f: F) {
        fn walk<F: FnMut(&Bucket)>(node: &TrieNode, f: &mut F) {
            match node {
                TrieNode::Leaf(b) => {
                    if !b.entries.is_empty() {
                        f(b);
                    }
                }
                TrieNode::Internal { left, right, .. } => {
                    walk(left, f);
                    walk(right, f);
                }
            }
        }
        walk(&self.root, &mut f);
    }

    /// Snapshot every leaf (including empty ones) for the refresh loop.
    pub fn leaves(&self) -> Vec<LeafInfo> {
        fn walk(node: &TrieNode, bits: &mut Vec<bool>, out: &mut Vec<LeafInfo>) {
            match node {
                TrieNode::Leaf(b) => out.push(LeafInfo {
                    bits: bits.clone(),
                    cutoff: bits.len(),
                    last_seen: b.last_seen,
                    entries: b.entries.iter().cloned().collect(),
                }),
                TrieNode::Internal { left, right, .. } => {
                    bits.push(false);
                    walk(left, bits, out);
                    bits.pop();
                    bits.push(true);
                    walk(right, bits, out);
                    bits.pop();
                }
            }
        }
        let mut bits = Vec::new();
        let mut out = Vec::new();
        walk(&self.root, &mut bits, &mut out);
        out
    }

    /// Replace the contents of the leaf reached by `bits` (§4.1 Refresh),
    /// truncated to `K` entries.
    pub fn replace_leaf(&mut self, bits: &[bool], mut new_entries: Vec<Entry>, now: u64) {
        let mut node = &mut self.root;
        for &bit in bits {
            match node {
                TrieNode::Internal { left, right, .. } => {
                    node = if bit { right.as_mut() } else { left.as_mut() };
                }
                TrieNode::Leaf(_) => return,
            }
        }
        if let TrieNode::Leaf(bucket) = node {
            new_entries.truncate(K);
            bucket.entries = new_entries.into();
            bucket.touch(now);
        }
    }

    pub fn total_entries(&self) -> usize {
        let mut count = 0;
        self.dfs(|b| count += b.entries.len());
        count
    }
}

/// Generate a random id whose leading bits match `bits` (used by the refresh
/// loop to pick a lookup target inside a given bucket's range).
pub fn random_id_with_prefix(bits: &[bool]) -> Id {
    let mut raw = [0u8; crate::id::ID_BYTES];
    rand::thread_rng().fill_bytes(&mut raw);
    let mut id = Id::new(raw);
    for (i, &bit) in bits.iter().enumerate() {
        set_bit(&mut id, i, bit);
    }
    id
}

fn set_bit(id: &mut Id, i: usize, value: bool) {
    let bytes = id.as_bytes();
    let mut raw = *bytes;
    let byte = i / 8;
    let shift = 7 - (i % 8);
    if value {
        raw[byte] |= 1 << shift;
    } else {
        raw[byte] &= !(1 << shift);
    }
    *id = Id::new(raw);
}
