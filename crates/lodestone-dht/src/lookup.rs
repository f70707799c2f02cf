//! Shortlist state machine for iterative lookups.
//!
//! A lookup keeps a working set of candidate contacts sorted by XOR
//! distance to the target, deduplicated by identifier. Candidates advance
//! through `Unqueried -> InFlight -> Responded | Failed`; a failed
//! candidate is never re-queried within the same lookup. The driver in
//! [`crate::node`] asks for batches of the closest unqueried candidates,
//! issues the RPCs, and merges discovered contacts back in.

use lodestone_types::contact::Contact;
use lodestone_types::id::{Distance, NodeId};

/// Query status of a shortlist candidate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CandidateState {
    /// Not yet contacted.
    Unqueried,
    /// An RPC to this candidate is outstanding.
    InFlight,
    /// The candidate answered.
    Responded,
    /// The candidate timed out or errored; never re-queried.
    Failed,
}

/// A candidate with its cached distance to the lookup target.
#[derive(Clone, Debug)]
struct Candidate {
    contact: Contact,
    distance: Distance,
    state: CandidateState,
}

/// The sorted, deduplicated working set of an iterative lookup.
pub struct Shortlist {
    target: NodeId,
    /// Result-set size: batches draw from the `k` closest candidates only.
    k: usize,
    /// Candidates in strictly ascending distance order.
    candidates: Vec<Candidate>,
}

impl Shortlist {
    /// Create a shortlist seeded with the given contacts.
    pub fn new(target: NodeId, k: usize, seeds: impl IntoIterator<Item = Contact>) -> Self {
        let mut shortlist = Self {
            target,
            k,
            candidates: Vec::new(),
        };
        for seed in seeds {
            shortlist.insert(seed);
        }
        shortlist
    }

    /// The lookup target.
    pub fn target(&self) -> &NodeId {
        &self.target
    }

    /// Whether the shortlist holds no candidates at all.
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Merge a discovered contact. Returns true if it was newly added,
    /// false if a candidate with the same identifier already exists.
    pub fn insert(&mut self, contact: Contact) -> bool {
        let distance = contact.id.distance(&self.target);
        let position = self.candidates.binary_search_by(|c| {
            c.distance
                .cmp(&distance)
                .then_with(|| c.contact.id.cmp(&contact.id))
        });
        match position {
            Ok(_) => false,
            Err(index) => {
                self.candidates.insert(
                    index,
                    Candidate {
                        contact,
                        distance,
                        state: CandidateState::Unqueried,
                    },
                );
                true
            }
        }
    }

    /// Select up to `alpha` unqueried candidates among the `k` closest and
    /// mark them in-flight.
    ///
    /// An empty batch means the lookup is over: every candidate among the
    /// `k` closest is in-flight or settled.
    pub fn next_batch(&mut self, alpha: usize) -> Vec<Contact> {
        let mut batch = Vec::with_capacity(alpha);
        for candidate in self.candidates.iter_mut().take(self.k) {
            if batch.len() >= alpha {
                break;
            }
            if candidate.state == CandidateState::Unqueried {
                candidate.state = CandidateState::InFlight;
                batch.push(candidate.contact);
            }
        }
        batch
    }

    /// Mark a candidate as having answered.
    pub fn mark_responded(&mut self, id: &NodeId) {
        self.set_state(id, CandidateState::Responded);
    }

    /// Mark a candidate as failed (timeout or error).
    pub fn mark_failed(&mut self, id: &NodeId) {
        self.set_state(id, CandidateState::Failed);
    }

    fn set_state(&mut self, id: &NodeId, state: CandidateState) {
        if let Some(candidate) = self.candidates.iter_mut().find(|c| c.contact.id == *id) {
            candidate.state = state;
        }
    }

    /// Distance of the closest candidate that has answered, if any.
    pub fn closest_responded_distance(&self) -> Option<Distance> {
        self.candidates
            .iter()
            .find(|c| c.state == CandidateState::Responded)
            .map(|c| c.distance)
    }

    /// The up-to-`n` closest responded contacts, ascending by distance.
    pub fn responded(&self, n: usize) -> Vec<Contact> {
        self.candidates
            .iter()
            .filter(|c| c.state == CandidateState::Responded)
            .take(n)
            .map(|c| c.contact)
            .collect()
    }

    /// Whether any in-flight or unqueried work remains among the `k`
    /// closest candidates.
    pub fn settled(&self) -> bool {
        self.candidates.iter().take(self.k).all(|c| {
            matches!(
                c.state,
                CandidateState::Responded | CandidateState::Failed
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use lodestone_types::ID_BYTES;

    fn contact(first_byte: u8) -> Contact {
        let mut bytes = [0u8; ID_BYTES];
        bytes[0] = first_byte;
        Contact::new(
            NodeId::from_bytes(bytes),
            SocketAddr::from(([127, 0, 0, 1], 4100)),
        )
    }

    #[test]
    fn test_seeds_sorted_by_distance() {
        let mut sl = Shortlist::new(NodeId::MIN, 20, vec![contact(9), contact(1), contact(5)]);
        let batch = sl.next_batch(3);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0], contact(1));
        assert_eq!(batch[1], contact(5));
        assert_eq!(batch[2], contact(9));
    }

    #[test]
    fn test_insert_dedup() {
        let mut sl = Shortlist::new(NodeId::MIN, 20, vec![contact(1)]);
        assert!(!sl.insert(contact(1)));
        assert!(sl.insert(contact(2)));
    }

    #[test]
    fn test_batch_draws_from_k_closest_only() {
        // k = 2: the third-closest candidate must not be selected.
        let mut sl = Shortlist::new(NodeId::MIN, 2, vec![contact(1), contact(2), contact(3)]);
        let batch = sl.next_batch(3);
        assert_eq!(batch.len(), 2);
        assert!(!batch.contains(&contact(3)));
    }

    #[test]
    fn test_failed_candidates_not_requeried() {
        let mut sl = Shortlist::new(NodeId::MIN, 20, vec![contact(1), contact(2)]);
        let first = sl.next_batch(2);
        assert_eq!(first.len(), 2);

        sl.mark_failed(&contact(1).id);
        sl.mark_responded(&contact(2).id);

        // Nothing unqueried remains.
        assert!(sl.next_batch(3).is_empty());
        assert!(sl.settled());

        // A newly discovered contact becomes available again.
        assert!(sl.insert(contact(3)));
        assert!(!sl.settled());
        assert_eq!(sl.next_batch(3), vec![contact(3)]);
    }

    #[test]
    fn test_responded_excludes_failures() {
        let mut sl = Shortlist::new(NodeId::MIN, 20, vec![contact(1), contact(2), contact(3)]);
        sl.next_batch(3);
        sl.mark_responded(&contact(2).id);
        sl.mark_responded(&contact(3).id);
        sl.mark_failed(&contact(1).id);

        let responded = sl.responded(20);
        assert_eq!(responded, vec![contact(2), contact(3)]);
        assert_eq!(sl.closest_responded_distance(), Some(contact(2).id.distance(&NodeId::MIN)));
    }

    #[test]
    fn test_empty_shortlist() {
        let mut sl = Shortlist::new(NodeId::MIN, 20, Vec::new());
        assert!(sl.is_empty());
        assert!(sl.next_batch(3).is_empty());
        assert!(sl.settled());
        assert!(sl.closest_responded_distance().is_none());
    }
}
