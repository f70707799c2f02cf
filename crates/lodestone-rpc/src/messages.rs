//! The closed set of DHT RPC messages.
//!
//! Four methods exist on the wire: `ping`, `store`, `find_node` and
//! `find_value`, plus the reserved `error` response. Dispatch is over these
//! sum types rather than method-name reflection, so an unknown method can
//! only arise from a malformed datagram.

use lodestone_types::contact::Contact;
use lodestone_types::id::NodeId;

/// Method name for `ping`.
pub const METHOD_PING: &str = "ping";
/// Method name for `store`.
pub const METHOD_STORE: &str = "store";
/// Method name for `find_node`.
pub const METHOD_FIND_NODE: &str = "find_node";
/// Method name for `find_value`.
pub const METHOD_FIND_VALUE: &str = "find_value";
/// Method name mirrored on error responses.
pub const METHOD_ERROR: &str = "error";

/// An outbound or inbound RPC request body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    /// Liveness probe. The response carries the responder's identifier.
    Ping,
    /// Ask a peer to store a key/value pair under `key_id`.
    ///
    /// `key_id` must equal `SHA-1(key)`; the handler verifies this.
    Store {
        key_id: NodeId,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    /// Ask a peer for its K closest contacts to `target`.
    FindNode { target: NodeId },
    /// Ask a peer for the value stored under `target`, or its K closest
    /// contacts if it has no value.
    FindValue { target: NodeId },
}

impl Request {
    /// The wire method name for this request.
    pub fn method(&self) -> &'static str {
        match self {
            Request::Ping => METHOD_PING,
            Request::Store { .. } => METHOD_STORE,
            Request::FindNode { .. } => METHOD_FIND_NODE,
            Request::FindValue { .. } => METHOD_FIND_VALUE,
        }
    }
}

/// An RPC response body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    /// Reply to [`Request::Ping`]: the responder's identifier.
    Ping { id: NodeId },
    /// Reply to [`Request::Store`]: whether the value was accepted.
    Store { stored: bool },
    /// Reply to [`Request::FindNode`]: up to K closest contacts.
    FindNode { contacts: Vec<Contact> },
    /// Reply to [`Request::FindValue`]: the value, or closest contacts.
    FindValue(ValueOrContacts),
    /// Error reply (unknown method, malformed payload).
    Error { message: String },
}

impl Response {
    /// The wire method name mirrored on this response.
    pub fn method(&self) -> &'static str {
        match self {
            Response::Ping { .. } => METHOD_PING,
            Response::Store { .. } => METHOD_STORE,
            Response::FindNode { .. } => METHOD_FIND_NODE,
            Response::FindValue(_) => METHOD_FIND_VALUE,
            Response::Error { .. } => METHOD_ERROR,
        }
    }
}

/// The two possible `find_value` outcomes.
///
/// A found value is returned alone; contacts are only returned when the
/// responder does not hold the value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValueOrContacts {
    /// The responder holds the value.
    Value(Vec<u8>),
    /// The responder does not hold the value; its closest contacts instead.
    Contacts(Vec<Contact>),
}
