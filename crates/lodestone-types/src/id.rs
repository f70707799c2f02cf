//! 160-bit node identifiers and the XOR distance metric.
//!
//! Every node and every stored key lives in the same 160-bit identifier
//! space. The distance between two identifiers is their bitwise XOR,
//! interpreted as an unsigned integer: a strictly smaller XOR means
//! strictly closer. Bit 0 is the most significant bit.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::{TypeError, ID_BITS, ID_BYTES};

/// A 160-bit identifier for a node or a stored key.
///
/// Identifiers compare as unsigned big-endian integers. The derived `Ord`
/// on the backing byte array gives exactly that ordering.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; ID_BYTES]);

impl NodeId {
    /// The all-zero identifier.
    pub const MIN: NodeId = NodeId([0u8; ID_BYTES]);

    /// The all-one identifier.
    pub const MAX: NodeId = NodeId([0xFF; ID_BYTES]);

    /// Construct an identifier from its raw big-endian bytes.
    pub const fn from_bytes(bytes: [u8; ID_BYTES]) -> Self {
        Self(bytes)
    }

    /// Construct an identifier from a byte slice.
    ///
    /// # Errors
    ///
    /// Returns [`TypeError::InvalidIdLength`] if the slice is not exactly
    /// [`ID_BYTES`] long.
    pub fn from_slice(bytes: &[u8]) -> crate::Result<Self> {
        let arr: [u8; ID_BYTES] = bytes
            .try_into()
            .map_err(|_| TypeError::InvalidIdLength { got: bytes.len() })?;
        Ok(Self(arr))
    }

    /// Parse an identifier from a 40-character hex string.
    ///
    /// # Errors
    ///
    /// Returns [`TypeError::InvalidHex`] if the string is not valid hex, or
    /// [`TypeError::InvalidIdLength`] if it decodes to the wrong length.
    pub fn from_hex(s: &str) -> crate::Result<Self> {
        let bytes = hex::decode(s).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    /// Generate a uniformly random identifier.
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_BYTES];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
        Self(bytes)
    }

    /// Derive the identifier for an application-level key: `SHA-1(key)`.
    ///
    /// Keys are routed to the nodes closest to this digest.
    pub fn for_key(key: &[u8]) -> Self {
        let digest = Sha1::digest(key);
        let mut bytes = [0u8; ID_BYTES];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// The raw big-endian bytes of this identifier.
    pub const fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    /// The XOR distance between this identifier and another.
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut out = [0u8; ID_BYTES];
        for i in 0..ID_BYTES {
            out[i] = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }

    /// The bit at `index`, where index 0 is the most significant bit.
    pub fn bit(&self, index: usize) -> bool {
        debug_assert!(index < ID_BITS);
        (self.0[index / 8] >> (7 - (index % 8))) & 1 == 1
    }

    /// A copy of this identifier with the bit at `index` set to `value`.
    ///
    /// Index 0 is the most significant bit.
    pub fn with_bit(&self, index: usize, value: bool) -> NodeId {
        debug_assert!(index < ID_BITS);
        let mut bytes = self.0;
        let mask = 1u8 << (7 - (index % 8));
        if value {
            bytes[index / 8] |= mask;
        } else {
            bytes[index / 8] &= !mask;
        }
        NodeId(bytes)
    }

    /// Whether this identifier lies in the inclusive range `[low, high]`.
    ///
    /// Bounds are inclusive so the top of the space is representable:
    /// a range ending at 2^160 - 1 uses [`NodeId::MAX`] as `high`.
    pub fn in_range(&self, low: &NodeId, high: &NodeId) -> bool {
        low.0 <= self.0 && self.0 <= high.0
    }

    /// The number of leading bits shared with `other`, in `0..=160`.
    ///
    /// This is the depth at which the two identifiers diverge, and the
    /// primary index into the routing table. Equal identifiers share all
    /// 160 bits.
    pub fn common_prefix_len(&self, other: &NodeId) -> usize {
        self.distance(other).leading_zeros()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(self.0))
    }
}

/// The XOR distance between two identifiers.
///
/// Distances are 160-bit unsigned integers and compare lexicographically
/// over their big-endian bytes, which is unsigned integer order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Distance([u8; ID_BYTES]);

impl Distance {
    /// The zero distance (an identifier's distance to itself).
    pub const ZERO: Distance = Distance([0u8; ID_BYTES]);

    /// Whether this distance is zero.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; ID_BYTES]
    }

    /// The raw big-endian bytes of this distance.
    pub const fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    /// The number of leading zero bits, in `0..=160`.
    pub fn leading_zeros(&self) -> usize {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return i * 8 + byte.leading_zeros() as usize;
            }
        }
        ID_BITS
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({})", hex::encode(self.0))
    }
}
