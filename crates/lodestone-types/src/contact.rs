//! Network contacts: an identifier paired with a reachable address.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::id::NodeId;

/// A known peer: its identifier and the UDP address it answers on.
///
/// Contacts are immutable values; two contacts are equal iff both the
/// identifier and the address match.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    /// The peer's 160-bit identifier.
    pub id: NodeId,
    /// The peer's network address.
    #[serde(with = "socket_addr_serde")]
    pub addr: SocketAddr,
}

impl Contact {
    /// Create a contact from an identifier and address.
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self { id, addr }
    }
}

impl fmt::Debug for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Contact({} @ {})", self.id, self.addr)
    }
}

/// Serde support for `SocketAddr` as a string.
mod socket_addr_serde {
    use std::net::SocketAddr;

    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_on_both_components() {
        let id = NodeId::random();
        let a = Contact::new(id, SocketAddr::from(([127, 0, 0, 1], 9000)));
        let b = Contact::new(id, SocketAddr::from(([127, 0, 0, 1], 9000)));
        let c = Contact::new(id, SocketAddr::from(([127, 0, 0, 1], 9001)));
        let d = Contact::new(NodeId::random(), SocketAddr::from(([127, 0, 0, 1], 9000)));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn test_serde_roundtrip() {
        let contact = Contact::new(
            NodeId::for_key(b"peer"),
            SocketAddr::from(([10, 0, 0, 7], 4100)),
        );
        let json = serde_json::to_string(&contact).expect("serialize");
        assert!(json.contains("10.0.0.7:4100"));
        let restored: Contact = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(contact, restored);
    }
}
