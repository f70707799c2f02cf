//! Kademlia routing table: a splittable tree of k-buckets.
//!
//! The table starts as a single bucket covering the whole 160-bit space.
//! Buckets are addressed by bit prefix: a bucket at depth `d` holds every
//! identifier sharing its first `d` bits. Only the bucket containing the
//! local identifier splits when full; every other full bucket defends its
//! members with an eviction challenge.
//!
//! ## LRS Eviction
//!
//! Contacts within a bucket are ordered least-recently-seen first. When a
//! full non-splittable bucket sees a newcomer, the caller is asked to ping
//! the stale head. A live head is moved to the tail and the newcomer is
//! dropped; a dead head is evicted and the newcomer appended. Long-lived
//! nodes are likelier to remain long-lived, so they win the slot.

use std::collections::VecDeque;

use tracing::trace;

use lodestone_types::contact::Contact;
use lodestone_types::id::{Distance, NodeId};
use lodestone_types::ID_BITS;

use crate::K;

/// Result of feeding an observed contact into the routing table.
#[derive(Clone, Debug)]
pub enum ObserveOutcome {
    /// The contact was newly inserted into a bucket.
    Inserted,
    /// The contact was already present; it moved to the most-recently-seen
    /// position and its address was updated.
    Refreshed,
    /// The contact carries the local identifier; it is never stored.
    Ignored,
    /// The target bucket is full and defended; the newcomer was dropped.
    Dropped,
    /// The target bucket is full. The caller should ping `head` and report
    /// the outcome via [`RoutingTable::challenge_result`]; the newcomer is
    /// parked as the challenge candidate meanwhile.
    Challenge {
        /// The least-recently-seen contact of the full bucket.
        head: Contact,
    },
}

/// A pending eviction challenge. At most one per bucket.
#[derive(Clone, Debug)]
struct Challenge {
    /// The least-recently-seen contact being pinged.
    head: Contact,
    /// The newcomer waiting for the head's slot.
    candidate: Contact,
}

/// A single k-bucket covering the identifiers that share `prefix[..depth]`.
///
/// The front of the deque holds the least-recently-seen contact; the back
/// holds the most-recently-seen.
#[derive(Clone, Debug)]
struct KBucket {
    /// Range prefix; bits at and beyond `depth` are zero.
    prefix: NodeId,
    /// Number of fixed leading bits.
    depth: usize,
    /// Contacts ordered least-recently-seen first.
    contacts: VecDeque<Contact>,
    /// In-flight eviction challenge, if any.
    challenge: Option<Challenge>,
}

impl KBucket {
    fn new(prefix: NodeId, depth: usize, capacity: usize) -> Self {
        Self {
            prefix,
            depth,
            contacts: VecDeque::with_capacity(capacity),
            challenge: None,
        }
    }

    /// Whether `id` falls in this bucket's range.
    fn contains(&self, id: &NodeId) -> bool {
        id.common_prefix_len(&self.prefix) >= self.depth
    }

    /// Find a contact by identifier, returning its index if present.
    fn position(&self, id: &NodeId) -> Option<usize> {
        self.contacts.iter().position(|c| c.id == *id)
    }

    /// Move the contact at `index` to the most-recently-seen position,
    /// replacing it with `latest` (same identifier, possibly new address).
    fn touch(&mut self, index: usize, latest: Contact) {
        if self.contacts.remove(index).is_some() {
            self.contacts.push_back(latest);
        }
    }
}

/// The Kademlia routing table.
///
/// Buckets partition the identifier space with no gaps or overlap, and are
/// kept in ascending range order. Splits happen only along the path toward
/// the local identifier, bounding the table at `O(log n)` buckets.
pub struct RoutingTable {
    /// The local node's identifier.
    local_id: NodeId,
    /// Bucket capacity.
    k: usize,
    /// Buckets in ascending range order.
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    /// Create a routing table with the default bucket capacity [`K`].
    pub fn new(local_id: NodeId) -> Self {
        Self::with_bucket_size(local_id, K)
    }

    /// Create a routing table with an explicit bucket capacity.
    pub fn with_bucket_size(local_id: NodeId, k: usize) -> Self {
        Self {
            local_id,
            k,
            buckets: vec![KBucket::new(NodeId::MIN, 0, k)],
        }
    }

    /// The local node's identifier.
    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// The configured bucket capacity.
    pub fn bucket_size(&self) -> usize {
        self.k
    }

    /// Total number of contacts across all buckets.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.contacts.len()).sum()
    }

    /// Whether the table holds no contacts.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of buckets the space is currently divided into.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Every contact in the table, in bucket order.
    pub fn contacts(&self) -> Vec<Contact> {
        self.buckets
            .iter()
            .flat_map(|b| b.contacts.iter().copied())
            .collect()
    }

    /// Index of the bucket whose range contains `id`.
    fn bucket_index(&self, id: &NodeId) -> usize {
        let index = self.buckets.iter().position(|b| b.contains(id));
        debug_assert!(index.is_some(), "buckets must partition the space");
        index.unwrap_or_default()
    }

    /// Insert or refresh an observed contact.
    ///
    /// Non-blocking: when a full defended bucket is hit, the eviction
    /// challenge is returned to the caller rather than performed here.
    pub fn observe(&mut self, contact: Contact) -> ObserveOutcome {
        if contact.id == self.local_id {
            return ObserveOutcome::Ignored;
        }

        loop {
            let index = self.bucket_index(&contact.id);
            let splittable = {
                let bucket = &mut self.buckets[index];

                if let Some(position) = bucket.position(&contact.id) {
                    bucket.touch(position, contact);
                    return ObserveOutcome::Refreshed;
                }

                if bucket.contacts.len() < self.k {
                    bucket.contacts.push_back(contact);
                    return ObserveOutcome::Inserted;
                }

                bucket.contains(&self.local_id) && bucket.depth < ID_BITS
            };

            if !splittable {
                let bucket = &mut self.buckets[index];
                if bucket.challenge.is_some() {
                    trace!(id = %contact.id, "bucket defended, newcomer dropped");
                    return ObserveOutcome::Dropped;
                }
                let Some(head) = bucket.contacts.front().copied() else {
                    return ObserveOutcome::Dropped;
                };
                bucket.challenge = Some(Challenge {
                    head,
                    candidate: contact,
                });
                return ObserveOutcome::Challenge { head };
            }

            self.split(index);
        }
    }

    /// Split the bucket at `index` at the midpoint of its range and
    /// redistribute its contacts, preserving least-recently-seen order.
    fn split(&mut self, index: usize) {
        let bucket = self.buckets.remove(index);
        debug_assert!(bucket.challenge.is_none(), "only undefended buckets split");

        let depth = bucket.depth;
        let mut zero = KBucket::new(bucket.prefix, depth + 1, self.k);
        let mut one = KBucket::new(bucket.prefix.with_bit(depth, true), depth + 1, self.k);

        for contact in bucket.contacts {
            if contact.id.bit(depth) {
                one.contacts.push_back(contact);
            } else {
                zero.contacts.push_back(contact);
            }
        }

        trace!(
            depth = depth + 1,
            low = zero.contacts.len(),
            high = one.contacts.len(),
            "bucket split"
        );

        // Keep ascending range order: the zero branch covers the lower ids.
        self.buckets.insert(index, one);
        self.buckets.insert(index, zero);
    }

    /// Report the outcome of an eviction-challenge ping.
    ///
    /// A live head moves to the most-recently-seen position and the parked
    /// candidate is dropped. A dead head is removed and the candidate is
    /// appended at the tail.
    pub fn challenge_result(&mut self, head_id: &NodeId, alive: bool) {
        let index = self.bucket_index(head_id);
        let bucket = &mut self.buckets[index];

        let Some(challenge) = bucket.challenge.take() else {
            return;
        };
        if challenge.head.id != *head_id {
            bucket.challenge = Some(challenge);
            return;
        }

        if alive {
            if let Some(position) = bucket.position(head_id) {
                bucket.touch(position, challenge.head);
            }
            trace!(head = %head_id, "challenged head alive, newcomer dropped");
        } else {
            if let Some(position) = bucket.position(head_id) {
                bucket.contacts.remove(position);
            }
            let candidate = challenge.candidate;
            if bucket.contains(&candidate.id)
                && bucket.position(&candidate.id).is_none()
                && bucket.contacts.len() < self.k
            {
                bucket.contacts.push_back(candidate);
            }
            trace!(head = %head_id, "challenged head evicted");
        }
    }

    /// Remove a contact from the table.
    pub fn remove(&mut self, id: &NodeId) -> Option<Contact> {
        let index = self.bucket_index(id);
        let bucket = &mut self.buckets[index];
        let position = bucket.position(id)?;
        bucket.contacts.remove(position)
    }

    /// The up-to-`n` contacts closest to `target` by XOR distance, in
    /// strictly ascending distance order.
    ///
    /// The table is bounded at `O(log n)` buckets of `k` contacts, so a
    /// full scan stays small.
    pub fn closest_to(&self, target: &NodeId, n: usize) -> Vec<Contact> {
        let mut all: Vec<(Distance, Contact)> = self
            .buckets
            .iter()
            .flat_map(|b| b.contacts.iter())
            .map(|c| (c.id.distance(target), *c))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));
        all.into_iter().take(n).map(|(_, c)| c).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use lodestone_types::ID_BYTES;

    fn contact(id: NodeId) -> Contact {
        Contact::new(id, SocketAddr::from(([127, 0, 0, 1], 4100)))
    }

    fn id_from(bytes: &[u8]) -> NodeId {
        let mut arr = [0u8; ID_BYTES];
        arr[..bytes.len()].copy_from_slice(bytes);
        NodeId::from_bytes(arr)
    }

    /// Fill the bucket for ids with a leading 1 bit (the far half of the
    /// space from a local id of zero).
    fn fill_far_bucket(table: &mut RoutingTable, k: usize) -> Vec<NodeId> {
        let mut ids = Vec::new();
        for i in 0..k {
            let id = id_from(&[0x80, 0, i as u8]);
            assert!(matches!(
                table.observe(contact(id)),
                ObserveOutcome::Inserted
            ));
            ids.push(id);
        }
        ids
    }

    #[test]
    fn test_observe_insert_and_refresh() {
        let mut table = RoutingTable::new(NodeId::MIN);
        let c = contact(id_from(&[0x80]));

        assert!(matches!(table.observe(c), ObserveOutcome::Inserted));
        assert_eq!(table.len(), 1);

        // Idempotent: a second observe refreshes, never duplicates.
        assert!(matches!(table.observe(c), ObserveOutcome::Refreshed));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_observe_self_ignored() {
        let local = NodeId::random();
        let mut table = RoutingTable::new(local);
        assert!(matches!(
            table.observe(contact(local)),
            ObserveOutcome::Ignored
        ));
        assert!(table.is_empty());
    }

    #[test]
    fn test_refresh_updates_address_and_position() {
        let mut table = RoutingTable::with_bucket_size(NodeId::MIN, 4);
        let first = id_from(&[0x80, 1]);
        let second = id_from(&[0x80, 2]);
        table.observe(contact(first));
        table.observe(contact(second));

        let moved = Contact::new(first, SocketAddr::from(([127, 0, 0, 1], 9999)));
        assert!(matches!(table.observe(moved), ObserveOutcome::Refreshed));

        let contacts = table.contacts();
        // `first` is now most-recently-seen with the new address.
        assert_eq!(contacts.last().map(|c| c.id), Some(first));
        assert_eq!(
            contacts.last().map(|c| c.addr.port()),
            Some(9999)
        );
    }

    #[test]
    fn test_full_far_bucket_starts_challenge() {
        let k = 4;
        let mut table = RoutingTable::with_bucket_size(NodeId::MIN, k);
        let ids = fill_far_bucket(&mut table, k);

        let newcomer = contact(id_from(&[0x80, 1, 0xFF]));
        match table.observe(newcomer) {
            ObserveOutcome::Challenge { head } => assert_eq!(head.id, ids[0]),
            other => unreachable!("expected challenge, got {other:?}"),
        }

        // A second newcomer while the challenge is pending is dropped.
        let second = contact(id_from(&[0x80, 2, 0xFF]));
        assert!(matches!(table.observe(second), ObserveOutcome::Dropped));
    }

    #[test]
    fn test_challenge_alive_keeps_head_drops_newcomer() {
        let k = 4;
        let mut table = RoutingTable::with_bucket_size(NodeId::MIN, k);
        let ids = fill_far_bucket(&mut table, k);
        let newcomer = contact(id_from(&[0x80, 1, 0xFF]));
        table.observe(newcomer);

        table.challenge_result(&ids[0], true);

        let contacts = table.contacts();
        assert_eq!(contacts.len(), k);
        // Head survived and moved to the most-recently-seen position.
        assert_eq!(contacts.last().map(|c| c.id), Some(ids[0]));
        assert!(!contacts.iter().any(|c| c.id == newcomer.id));
    }

    #[test]
    fn test_challenge_dead_evicts_head_appends_newcomer() {
        let k = 4;
        let mut table = RoutingTable::with_bucket_size(NodeId::MIN, k);
        let ids = fill_far_bucket(&mut table, k);
        let newcomer = contact(id_from(&[0x80, 1, 0xFF]));
        table.observe(newcomer);

        table.challenge_result(&ids[0], false);

        let contacts = table.contacts();
        assert_eq!(contacts.len(), k);
        assert!(!contacts.iter().any(|c| c.id == ids[0]));
        assert_eq!(contacts.last().map(|c| c.id), Some(newcomer.id));

        // The bucket is undefended again.
        let next = contact(id_from(&[0x80, 3, 0xFF]));
        assert!(matches!(
            table.observe(next),
            ObserveOutcome::Challenge { .. }
        ));
    }

    #[test]
    fn test_local_bucket_splits_instead_of_evicting() {
        let k = 4;
        // Local id all-zero: near-side ids share its bucket until a split.
        let mut table = RoutingTable::with_bucket_size(NodeId::MIN, k);

        // Fill the local-range bucket, then push one more near-side
        // contact: the bucket must split rather than challenge.
        for i in 0..k {
            table.observe(contact(id_from(&[0x00, 0x80, i as u8])));
        }
        let before = table.bucket_count();
        let extra = contact(id_from(&[0x00, 0x01, 0xAA]));
        assert!(matches!(table.observe(extra), ObserveOutcome::Inserted));
        assert!(table.bucket_count() > before, "local bucket must split");
        assert_eq!(table.len(), k + 1);
    }

    #[test]
    fn test_buckets_partition_the_space() {
        let k = 4;
        let local = NodeId::MIN;
        let mut table = RoutingTable::with_bucket_size(local, k);
        for i in 0u16..64 {
            let mut bytes = [0u8; ID_BYTES];
            bytes[0] = (i % 8) as u8;
            bytes[1] = (i / 8) as u8;
            bytes[ID_BYTES - 1] = i as u8;
            table.observe(contact(NodeId::from_bytes(bytes)));
        }

        // Every identifier lands in exactly one bucket.
        for _ in 0..256 {
            let id = NodeId::random();
            let holders = table.buckets.iter().filter(|b| b.contains(&id)).count();
            assert_eq!(holders, 1, "id {id} must land in exactly one bucket");
        }

        // Every stored contact lies within its bucket's range, no bucket
        // exceeds k, and no identifier appears twice.
        let mut seen = std::collections::HashSet::new();
        for bucket in &table.buckets {
            assert!(bucket.contacts.len() <= k);
            for c in &bucket.contacts {
                assert!(bucket.contains(&c.id));
                assert!(seen.insert(c.id), "duplicate identifier {}", c.id);
            }
        }
    }

    #[test]
    fn test_split_preserves_lrs_order() {
        let k = 4;
        let mut table = RoutingTable::with_bucket_size(NodeId::MIN, k);
        // Two near-side and two far-side contacts, interleaved.
        let near_old = id_from(&[0x00, 0x10]);
        let far_old = id_from(&[0x80, 0x10]);
        let near_new = id_from(&[0x00, 0x20]);
        let far_new = id_from(&[0x80, 0x20]);
        for id in [near_old, far_old, near_new, far_new] {
            table.observe(contact(id));
        }
        // Force a split of the root bucket.
        table.observe(contact(id_from(&[0x00, 0x30])));

        let contacts = table.contacts();
        let pos = |id: NodeId| contacts.iter().position(|c| c.id == id);
        assert!(pos(near_old) < pos(near_new));
        assert!(pos(far_old) < pos(far_new));
    }

    #[test]
    fn test_closest_to_sorted_and_bounded() {
        let mut table = RoutingTable::new(NodeId::MIN);
        for i in 1..=10u8 {
            table.observe(contact(id_from(&[i])));
        }

        let target = id_from(&[5]);
        let closest = table.closest_to(&target, 5);
        assert_eq!(closest.len(), 5);
        assert_eq!(closest[0].id, target);
        for pair in closest.windows(2) {
            assert!(
                pair[0].id.distance(&target) < pair[1].id.distance(&target),
                "results must be strictly ascending by distance"
            );
        }

        // n larger than the table returns everything.
        assert_eq!(table.closest_to(&target, 100).len(), 10);
    }

    #[test]
    fn test_remove() {
        let mut table = RoutingTable::new(NodeId::MIN);
        let id = id_from(&[0x42]);
        table.observe(contact(id));
        assert_eq!(table.len(), 1);

        assert!(table.remove(&id).is_some());
        assert!(table.is_empty());
        assert!(table.remove(&id).is_none());
    }

    #[test]
    fn test_challenge_result_without_challenge_is_noop() {
        let mut table = RoutingTable::new(NodeId::MIN);
        let id = id_from(&[0x42]);
        table.observe(contact(id));
        table.challenge_result(&id, false);
        assert_eq!(table.len(), 1);
    }
}
