//! The DHT node: RPC handlers, iterative lookups, and the public
//! `put` / `get` / `bootstrap` operations.
//!
//! A [`Node`] owns its routing table, value store, and RPC endpoint. Every
//! message the endpoint receives feeds the sender into the routing table
//! before anything else happens, so lookups and handlers always run
//! against a table that has seen the latest traffic.
//!
//! ## Iterative lookups
//!
//! Lookups proceed in rounds: up to alpha of the closest unqueried
//! candidates are queried in parallel, their answers are merged into the
//! shortlist, and the next round starts. A lookup ends when a full round
//! discovers nothing strictly closer than the closest responder so far,
//! or when the K closest candidates have all answered or failed.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use lodestone_rpc::endpoint::{CallReply, InboundHandler, RpcClient, RpcConfig, RpcEndpoint};
use lodestone_rpc::messages::{Request, Response, ValueOrContacts};
use lodestone_types::contact::Contact;
use lodestone_types::id::{Distance, NodeId};

use crate::kademlia::{ObserveOutcome, RoutingTable};
use crate::lookup::Shortlist;
use crate::store::ValueStore;
use crate::{DhtError, Result, ALPHA, K};

/// Configuration for a DHT node.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Local address to bind to. Port 0 asks the OS for an ephemeral port.
    pub bind_addr: SocketAddr,
    /// Bucket capacity and lookup result size.
    pub k: usize,
    /// Lookup parallelism factor.
    pub alpha: usize,
    /// Deadline for each outbound RPC.
    pub call_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            k: K,
            alpha: ALPHA,
            call_timeout: lodestone_rpc::DEFAULT_CALL_TIMEOUT,
        }
    }
}

/// The result of joining the network via seed nodes.
#[derive(Clone, Debug)]
pub struct BootstrapOutcome {
    /// Number of seed addresses that answered a ping.
    pub responsive_seeds: usize,
    /// Routing-table size after the self-lookup.
    pub peers_known: usize,
}

/// The result of an iterative value lookup.
#[derive(Clone, Debug)]
pub enum ValueLookup {
    /// A peer held the value.
    Found {
        /// The retrieved value.
        value: Vec<u8>,
        /// The closest responded contact that did not hold the value, used
        /// for the one-shot cache store.
        cache_to: Option<Contact>,
    },
    /// No peer held the value.
    NotFound {
        /// The K closest contacts that responded during the lookup.
        closest: Vec<Contact>,
    },
}

/// What one run of lookup rounds produced.
struct RoundsResult {
    /// The value and its holder, when a `find_value` round hit.
    value: Option<(Vec<u8>, Contact)>,
    /// The K closest responded contacts.
    closest: Vec<Contact>,
}

/// A running DHT node.
pub struct Node {
    inner: Arc<NodeInner>,
    endpoint: RpcEndpoint,
}

/// Node state shared with the endpoint's receive path.
struct NodeInner {
    local_id: NodeId,
    k: usize,
    alpha: usize,
    table: Arc<Mutex<RoutingTable>>,
    store: Mutex<ValueStore>,
    rpc: RpcClient,
}

/// Lock a mutex, recovering from a poisoned lock.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl NodeInner {
    fn table(&self) -> MutexGuard<'_, RoutingTable> {
        lock(&self.table)
    }

    /// Feed an observed contact into the routing table, driving the
    /// eviction challenge when the table asks for one.
    fn observe_contact(&self, sender: Contact) {
        let outcome = self.table().observe(sender);
        if let ObserveOutcome::Challenge { head } = outcome {
            let table = Arc::clone(&self.table);
            let rpc = self.rpc.clone();
            tokio::spawn(async move {
                let alive = matches!(
                    rpc.call(head.addr, Request::Ping, Some(head.id)).await,
                    Ok(CallReply {
                        id_mismatch: false,
                        ..
                    })
                );
                debug!(head = %head.id, alive, "eviction challenge settled");
                lock(&table).challenge_result(&head.id, alive);
            });
        }
    }
}

impl InboundHandler for NodeInner {
    fn observe(&self, sender: Contact) {
        self.observe_contact(sender);
    }

    fn handle(&self, sender: Contact, request: Request) -> Response {
        match request {
            Request::Ping => Response::Ping { id: self.local_id },
            Request::Store { key_id, key, value } => {
                if NodeId::for_key(&key) != key_id {
                    debug!(
                        from = %sender.id,
                        claimed = %key_id,
                        "store rejected: key digest mismatch"
                    );
                    Response::Store { stored: false }
                } else {
                    lock(&self.store).insert(key, value);
                    trace!(from = %sender.id, key_id = %key_id, "value stored");
                    Response::Store { stored: true }
                }
            }
            Request::FindNode { target } => Response::FindNode {
                contacts: self.table().closest_to(&target, self.k),
            },
            Request::FindValue { target } => match lock(&self.store).get(&target) {
                Some(entry) => Response::FindValue(ValueOrContacts::Value(entry.value.clone())),
                None => Response::FindValue(ValueOrContacts::Contacts(
                    self.table().closest_to(&target, self.k),
                )),
            },
        }
    }
}

impl Node {
    /// Bind a node with a fresh random identifier.
    ///
    /// # Errors
    ///
    /// Returns [`DhtError::Rpc`] if the UDP socket cannot be bound.
    pub async fn bind(config: NodeConfig) -> Result<Self> {
        Self::bind_with_id(config, NodeId::random()).await
    }

    /// Bind a node with a caller-chosen identifier.
    pub async fn bind_with_id(config: NodeConfig, local_id: NodeId) -> Result<Self> {
        let endpoint = RpcEndpoint::bind(
            RpcConfig {
                bind_addr: config.bind_addr,
                call_timeout: config.call_timeout,
            },
            local_id,
        )
        .await?;

        let inner = Arc::new(NodeInner {
            local_id,
            k: config.k,
            alpha: config.alpha,
            table: Arc::new(Mutex::new(RoutingTable::with_bucket_size(
                local_id, config.k,
            ))),
            store: Mutex::new(ValueStore::new()),
            rpc: endpoint.client(),
        });

        endpoint.start(inner.clone());
        info!(id = %local_id, addr = %endpoint.local_addr(), "node online");

        Ok(Self { inner, endpoint })
    }

    /// The local identifier.
    pub fn local_id(&self) -> NodeId {
        self.inner.local_id
    }

    /// The bound socket address.
    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    /// This node as a contact.
    pub fn local_contact(&self) -> Contact {
        Contact::new(self.local_id(), self.local_addr())
    }

    /// Number of contacts in the routing table.
    pub fn peer_count(&self) -> usize {
        self.inner.table().len()
    }

    /// Every contact in the routing table.
    pub fn known_peers(&self) -> Vec<Contact> {
        self.inner.table().contacts()
    }

    /// Number of locally stored values.
    pub fn stored_values(&self) -> usize {
        lock(&self.inner.store).len()
    }

    /// Shut the node down, failing all in-flight calls.
    pub fn close(&self) {
        self.endpoint.close();
    }

    /// Ping a peer, returning its claimed identifier.
    ///
    /// The responder enters the routing table as a side effect of the
    /// reply being received.
    ///
    /// # Errors
    ///
    /// [`DhtError::Rpc`] wraps timeouts and transport failures.
    pub async fn ping(&self, addr: SocketAddr, expected: Option<NodeId>) -> Result<NodeId> {
        let reply = self.inner.rpc.call(addr, Request::Ping, expected).await?;
        match reply.response {
            Response::Ping { id } => Ok(id),
            other => Err(DhtError::UnexpectedResponse {
                expected: "ping",
                got: other.method(),
            }),
        }
    }

    /// Join the network: ping each seed, then look up the local identifier
    /// to populate the buckets around it.
    ///
    /// # Errors
    ///
    /// Returns [`DhtError::NoPeers`] if no seed responded.
    pub async fn bootstrap(&self, seeds: &[SocketAddr]) -> Result<BootstrapOutcome> {
        info!(seed_count = seeds.len(), "starting bootstrap");

        let mut responsive_seeds = 0usize;
        for addr in seeds {
            match self.ping(*addr, None).await {
                Ok(id) => {
                    responsive_seeds += 1;
                    debug!(addr = %addr, id = %id, "seed responded");
                }
                Err(e) => warn!(addr = %addr, error = %e, "seed unreachable"),
            }
        }

        if responsive_seeds == 0 {
            return Err(DhtError::NoPeers);
        }

        if let Err(e) = self.lookup_nodes(self.local_id()).await {
            warn!(error = %e, "self-lookup during bootstrap failed");
        }

        let outcome = BootstrapOutcome {
            responsive_seeds,
            peers_known: self.peer_count(),
        };
        info!(
            responsive_seeds = outcome.responsive_seeds,
            peers_known = outcome.peers_known,
            "bootstrap complete"
        );
        Ok(outcome)
    }

    /// Iteratively locate the K closest responding contacts to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`DhtError::NoPeers`] if the routing table is empty.
    pub async fn lookup_nodes(&self, target: NodeId) -> Result<Vec<Contact>> {
        let rounds = self.run_rounds(target, false).await?;
        Ok(rounds.closest)
    }

    /// Iteratively look up the value stored under `key_id`.
    ///
    /// Terminates on the first peer that answers with the value.
    ///
    /// # Errors
    ///
    /// Returns [`DhtError::NoPeers`] if the routing table is empty.
    pub async fn lookup_value(&self, key_id: NodeId) -> Result<ValueLookup> {
        let rounds = self.run_rounds(key_id, true).await?;
        Ok(match rounds.value {
            Some((value, holder)) => ValueLookup::Found {
                value,
                cache_to: rounds
                    .closest
                    .into_iter()
                    .find(|c| c.id != holder.id),
            },
            None => ValueLookup::NotFound {
                closest: rounds.closest,
            },
        })
    }

    /// Store a key/value pair on the K closest nodes to `SHA-1(key)`.
    ///
    /// Returns the number of peers that acknowledged the store. With no
    /// reachable peers the value is stored locally and the count is 1.
    pub async fn put(&self, key: &[u8], value: &[u8]) -> Result<usize> {
        let key_id = NodeId::for_key(key);

        let targets = match self.lookup_nodes(key_id).await {
            Ok(contacts) => contacts,
            Err(DhtError::NoPeers) => Vec::new(),
            Err(e) => return Err(e),
        };

        if targets.is_empty() {
            lock(&self.inner.store).insert(key.to_vec(), value.to_vec());
            info!(key_id = %key_id, "no peers for key, stored locally");
            return Ok(1);
        }

        let mut calls: JoinSet<bool> = JoinSet::new();
        for peer in targets {
            let rpc = self.inner.rpc.clone();
            let request = Request::Store {
                key_id,
                key: key.to_vec(),
                value: value.to_vec(),
            };
            calls.spawn(async move {
                matches!(
                    rpc.call(peer.addr, request, Some(peer.id)).await,
                    Ok(CallReply {
                        response: Response::Store { stored: true },
                        ..
                    })
                )
            });
        }

        let mut stored = 0usize;
        while let Some(joined) = calls.join_next().await {
            if matches!(joined, Ok(true)) {
                stored += 1;
            }
        }
        debug!(key_id = %key_id, stored, "put complete");
        Ok(stored)
    }

    /// Retrieve the value stored under `SHA-1(key)`.
    ///
    /// Checks the local store first. A value found on the network is
    /// opportunistically cached on the closest responded peer that did not
    /// hold it.
    pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let key_id = NodeId::for_key(key);

        if let Some(entry) = lock(&self.inner.store).get(&key_id) {
            return Ok(Some(entry.value.clone()));
        }

        let lookup = match self.lookup_value(key_id).await {
            Ok(lookup) => lookup,
            Err(DhtError::NoPeers) => return Ok(None),
            Err(e) => return Err(e),
        };

        match lookup {
            ValueLookup::Found { value, cache_to } => {
                if let Some(peer) = cache_to {
                    let request = Request::Store {
                        key_id,
                        key: key.to_vec(),
                        value: value.clone(),
                    };
                    if let Err(e) = self.inner.rpc.call(peer.addr, request, Some(peer.id)).await {
                        debug!(peer = %peer.id, error = %e, "cache store failed");
                    }
                }
                Ok(Some(value))
            }
            ValueLookup::NotFound { .. } => Ok(None),
        }
    }

    /// Drive lookup rounds against the shortlist until closure.
    async fn run_rounds(&self, target: NodeId, want_value: bool) -> Result<RoundsResult> {
        let inner = &self.inner;
        let seeds = inner.table().closest_to(&target, inner.k);
        let mut shortlist = Shortlist::new(target, inner.k, seeds);
        if shortlist.is_empty() {
            return Err(DhtError::NoPeers);
        }

        loop {
            let batch = shortlist.next_batch(inner.alpha);
            if batch.is_empty() {
                break;
            }
            let baseline = shortlist.closest_responded_distance();

            let mut calls: JoinSet<(Contact, lodestone_rpc::Result<CallReply>)> = JoinSet::new();
            for peer in batch {
                let rpc = inner.rpc.clone();
                let request = if want_value {
                    Request::FindValue { target }
                } else {
                    Request::FindNode { target }
                };
                calls.spawn(async move {
                    let result = rpc.call(peer.addr, request, Some(peer.id)).await;
                    (peer, result)
                });
            }

            let mut found_closer = false;
            while let Some(joined) = calls.join_next().await {
                let Ok((peer, result)) = joined else { continue };
                match result {
                    Ok(reply) if reply.id_mismatch => {
                        debug!(peer = %peer.id, "responder identifier mismatch");
                        shortlist.mark_failed(&peer.id);
                    }
                    Ok(reply) => match reply.response {
                        Response::FindNode { contacts } if !want_value => {
                            shortlist.mark_responded(&peer.id);
                            found_closer |= self.merge(&mut shortlist, contacts, baseline);
                        }
                        Response::FindValue(ValueOrContacts::Contacts(contacts)) if want_value => {
                            shortlist.mark_responded(&peer.id);
                            found_closer |= self.merge(&mut shortlist, contacts, baseline);
                        }
                        Response::FindValue(ValueOrContacts::Value(value)) if want_value => {
                            shortlist.mark_responded(&peer.id);
                            trace!(peer = %peer.id, "value found, lookup short-circuits");
                            // Dropping the JoinSet aborts the rest of the round.
                            return Ok(RoundsResult {
                                closest: shortlist.responded(inner.k),
                                value: Some((value, peer)),
                            });
                        }
                        other => {
                            debug!(
                                peer = %peer.id,
                                method = other.method(),
                                "unexpected response body"
                            );
                            shortlist.mark_failed(&peer.id);
                        }
                    },
                    Err(e) => {
                        trace!(peer = %peer.id, error = %e, "lookup call failed");
                        shortlist.mark_failed(&peer.id);
                    }
                }
            }

            // A full round that discovers nothing strictly closer than the
            // closest responder ends the lookup.
            if baseline.is_some() && !found_closer {
                break;
            }
        }

        Ok(RoundsResult {
            value: None,
            closest: shortlist.responded(inner.k),
        })
    }

    /// Merge discovered contacts into the shortlist. Returns true if any
    /// newly added contact is strictly closer than `baseline`.
    fn merge(
        &self,
        shortlist: &mut Shortlist,
        contacts: Vec<Contact>,
        baseline: Option<Distance>,
    ) -> bool {
        let mut found_closer = false;
        for contact in contacts {
            if contact.id == self.inner.local_id {
                continue;
            }
            let distance = contact.id.distance(shortlist.target());
            if shortlist.insert(contact) {
                found_closer |= baseline.map_or(true, |b| distance < b);
            }
        }
        found_closer
    }
}
