//! # lodestone-dht
//!
//! The Kademlia core of the lodestone DHT node.
//!
//! This crate implements:
//! - XOR-metric routing table as a splittable tree of k-buckets with
//!   least-recently-seen eviction challenges
//! - Iterative node and value lookups with bounded parallelism
//! - The four Kademlia RPC handlers (`ping`, `store`, `find_node`,
//!   `find_value`) and the `put` / `get` / `bootstrap` operations on top
//!
//! ## Key Parameters
//!
//! | Parameter | Value |
//! |---|---|
//! | K (bucket size, result size) | 20 |
//! | alpha (lookup parallelism) | 3 |
//! | Call timeout | 5 seconds |
//! | Key derivation | `SHA-1(key_bytes)` |

pub mod kademlia;
pub mod lookup;
pub mod node;
pub mod store;

/// Bucket capacity and lookup result size.
pub const K: usize = 20;

/// Lookup parallelism factor.
pub const ALPHA: usize = 3;

/// Error types for DHT operations.
#[derive(Debug, thiserror::Error)]
pub enum DhtError {
    /// The routing table holds no contacts and no seeds were reachable, so
    /// an iterative lookup cannot start.
    #[error("no known peers")]
    NoPeers,

    /// A peer answered an RPC with a body of the wrong method.
    #[error("unexpected {got} response to {expected} request")]
    UnexpectedResponse {
        expected: &'static str,
        got: &'static str,
    },

    /// RPC-layer failure (timeout, closed transport, protocol violation).
    #[error("rpc error: {0}")]
    Rpc(#[from] lodestone_rpc::RpcError),
}

/// Convenience result type for DHT operations.
pub type Result<T> = std::result::Result<T, DhtError>;
