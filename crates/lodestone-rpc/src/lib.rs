//! # lodestone-rpc
//!
//! Datagram RPC for the lodestone DHT.
//!
//! This crate provides the request/response layer the DHT core runs on:
//!
//! - **Wire codec** for the framed binary message layout via [`wire`]
//! - **Message types** (the closed set of DHT RPCs) via [`messages`]
//! - **UDP endpoint** with per-call correlation and timeouts via [`endpoint`]
//!
//! ## Architecture
//!
//! ```text
//! Caller                              Remote peer
//!   |  call(addr, Request)               |
//!   v                                    v
//! RpcClient -- encode, fresh token --> UDP socket
//!   |                                    |
//!   |  pending table (token -> oneshot)  |  inbound loop: decode,
//!   |                                    |  observe sender, dispatch
//!   +---- reply or timeout <---- RESPONSE with mirrored token
//! ```
//!
//! Every received message, request or response, is reported to the
//! [`endpoint::InboundHandler`] before it has any other effect, so the
//! routing table sees the sender first.

pub mod endpoint;
pub mod messages;
pub mod wire;

use std::time::Duration;

/// Default per-call timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Recommended maximum datagram size (fits an unfragmented UDP datagram).
pub const RECOMMENDED_DATAGRAM_SIZE: usize = 1280;

/// Hard cap on accepted datagrams. Anything larger is truncated by the
/// receive buffer and will fail to decode.
pub const MAX_DATAGRAM_SIZE: usize = 65536;

/// Error types for RPC operations.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// No reply arrived within the call deadline.
    #[error("call timed out")]
    Timeout,

    /// The local endpoint has been closed; no further calls can complete.
    #[error("transport closed")]
    Closed,

    /// A malformed or protocol-violating message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The remote peer answered with an error response.
    #[error("remote error: {0}")]
    Remote(String),

    /// Socket-level I/O failure.
    #[error("I/O error: {0}")]
    Io(String),
}

/// Convenience result type for RPC operations.
pub type Result<T> = std::result::Result<T, RpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(RpcError::Timeout.to_string(), "call timed out");
        assert_eq!(RpcError::Closed.to_string(), "transport closed");
        let err = RpcError::Protocol("bad tag".to_string());
        assert_eq!(err.to_string(), "protocol error: bad tag");
    }

    #[test]
    fn test_size_limits() {
        assert!(RECOMMENDED_DATAGRAM_SIZE <= MAX_DATAGRAM_SIZE);
        assert_eq!(DEFAULT_CALL_TIMEOUT, Duration::from_secs(5));
    }
}
