//! Binary wire codec for DHT datagrams.
//!
//! Every datagram carries one message with the layout:
//!
//! ```text
//! [type:1]        REQUEST=0x00 | RESPONSE=0x01
//! [token:8]       correlation token, big-endian
//! [sender:20]     sender identifier
//! [method:1+n]    length-prefixed ASCII method name, n <= 16
//! [payload:...]   method-specific body
//! ```
//!
//! Method payloads (all integers big-endian):
//!
//! ```text
//! ping       req: -                    resp: [id:20]
//! find_node  req: [target:20]          resp: [count:1] count x contact
//! find_value req: [target:20]          resp: [tag:1] tag=0: contact list
//!                                                    tag=1: [len:2][value]
//! store      req: [key_id:20]          resp: [stored:1]
//!                 [len:2][key]
//!                 [len:2][value]
//! error      resp: [len:2][message]
//! ```
//!
//! A contact is `[id:20][family:1][octets:4|16][port:2]` with family 4 or 6.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use lodestone_types::contact::Contact;
use lodestone_types::id::NodeId;
use lodestone_types::ID_BYTES;

use crate::messages::{
    Request, Response, ValueOrContacts, METHOD_ERROR, METHOD_FIND_NODE, METHOD_FIND_VALUE,
    METHOD_PING, METHOD_STORE,
};
use crate::{Result, RpcError};

/// Wire tag for a request message.
pub const TYPE_REQUEST: u8 = 0x00;
/// Wire tag for a response message.
pub const TYPE_RESPONSE: u8 = 0x01;

/// Maximum method-name length on the wire.
pub const MAX_METHOD_LEN: usize = 16;

/// `find_value` response tag: payload is a contact list.
const TAG_CONTACTS: u8 = 0;
/// `find_value` response tag: payload is the value.
const TAG_VALUE: u8 = 1;

/// A decoded message: correlation token, sender, and body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    /// Correlation token matching responses to requests.
    pub token: u64,
    /// The sender's identifier as claimed in the message.
    pub sender: NodeId,
    /// Request or response body.
    pub body: Body,
}

/// The body of a message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Body {
    Request(Request),
    Response(Response),
}

/// A message whose framing decoded but whose payload has not been parsed.
///
/// Splitting decoding in two lets the endpoint answer a malformed or
/// unknown-method request with an error response carrying the right token,
/// while still dropping malformed responses outright.
#[derive(Clone, Debug)]
pub struct RawMessage {
    /// Whether this is a request or a response.
    pub is_request: bool,
    /// Correlation token.
    pub token: u64,
    /// Claimed sender identifier.
    pub sender: NodeId,
    /// Method name as received.
    pub method: String,
    /// Unparsed method-specific payload.
    pub payload: Vec<u8>,
}

/// Encode a message for transmission.
///
/// # Errors
///
/// Returns [`RpcError::Protocol`] if a variable-length field exceeds its
/// wire limit (key/value over 64 KiB, more than 255 contacts).
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(64);

    let (type_byte, method) = match &envelope.body {
        Body::Request(req) => (TYPE_REQUEST, req.method()),
        Body::Response(resp) => (TYPE_RESPONSE, resp.method()),
    };

    out.push(type_byte);
    out.extend_from_slice(&envelope.token.to_be_bytes());
    out.extend_from_slice(envelope.sender.as_bytes());

    debug_assert!(method.len() <= MAX_METHOD_LEN && method.is_ascii());
    out.push(method.len() as u8);
    out.extend_from_slice(method.as_bytes());

    match &envelope.body {
        Body::Request(Request::Ping) => {}
        Body::Request(Request::FindNode { target })
        | Body::Request(Request::FindValue { target }) => {
            out.extend_from_slice(target.as_bytes());
        }
        Body::Request(Request::Store { key_id, key, value }) => {
            out.extend_from_slice(key_id.as_bytes());
            put_prefixed(&mut out, key)?;
            put_prefixed(&mut out, value)?;
        }
        Body::Response(Response::Ping { id }) => {
            out.extend_from_slice(id.as_bytes());
        }
        Body::Response(Response::Store { stored }) => {
            out.push(u8::from(*stored));
        }
        Body::Response(Response::FindNode { contacts }) => {
            put_contacts(&mut out, contacts)?;
        }
        Body::Response(Response::FindValue(ValueOrContacts::Contacts(contacts))) => {
            out.push(TAG_CONTACTS);
            put_contacts(&mut out, contacts)?;
        }
        Body::Response(Response::FindValue(ValueOrContacts::Value(value))) => {
            out.push(TAG_VALUE);
            put_prefixed(&mut out, value)?;
        }
        Body::Response(Response::Error { message }) => {
            put_prefixed(&mut out, message.as_bytes())?;
        }
    }

    Ok(out)
}

/// Decode the framing of a received datagram: type, token, sender, method.
///
/// The method payload is returned unparsed; see [`RawMessage::into_envelope`].
///
/// # Errors
///
/// Returns [`RpcError::Protocol`] if the framing is truncated, the type
/// byte is unknown, or the method name is over-long or not ASCII.
pub fn decode_raw(data: &[u8]) -> Result<RawMessage> {
    let mut cur = Cursor::new(data);

    let type_byte = cur.u8()?;
    let is_request = match type_byte {
        TYPE_REQUEST => true,
        TYPE_RESPONSE => false,
        other => {
            return Err(RpcError::Protocol(format!(
                "unknown message type 0x{other:02x}"
            )))
        }
    };

    let token = cur.u64()?;
    let sender = cur.node_id()?;

    let method_len = cur.u8()? as usize;
    if method_len > MAX_METHOD_LEN {
        return Err(RpcError::Protocol(format!(
            "method name too long: {method_len} bytes"
        )));
    }
    let method_bytes = cur.take(method_len)?;
    if !method_bytes.is_ascii() {
        return Err(RpcError::Protocol("method name is not ASCII".to_string()));
    }
    let method = String::from_utf8_lossy(method_bytes).into_owned();

    Ok(RawMessage {
        is_request,
        token,
        sender,
        method,
        payload: cur.rest().to_vec(),
    })
}

impl RawMessage {
    /// Parse the method payload, yielding a complete [`Envelope`].
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Protocol`] on an unknown method or a payload
    /// that does not match the method's wire shape.
    pub fn into_envelope(self) -> Result<Envelope> {
        let mut cur = Cursor::new(&self.payload);

        let body = if self.is_request {
            let request = match self.method.as_str() {
                METHOD_PING => Request::Ping,
                METHOD_FIND_NODE => Request::FindNode {
                    target: cur.node_id()?,
                },
                METHOD_FIND_VALUE => Request::FindValue {
                    target: cur.node_id()?,
                },
                METHOD_STORE => Request::Store {
                    key_id: cur.node_id()?,
                    key: cur.prefixed()?.to_vec(),
                    value: cur.prefixed()?.to_vec(),
                },
                other => {
                    return Err(RpcError::Protocol(format!("unknown method {other:?}")))
                }
            };
            Body::Request(request)
        } else {
            let response = match self.method.as_str() {
                METHOD_PING => Response::Ping { id: cur.node_id()? },
                METHOD_STORE => Response::Store {
                    stored: cur.bool()?,
                },
                METHOD_FIND_NODE => Response::FindNode {
                    contacts: cur.contacts()?,
                },
                METHOD_FIND_VALUE => match cur.u8()? {
                    TAG_CONTACTS => Response::FindValue(ValueOrContacts::Contacts(cur.contacts()?)),
                    TAG_VALUE => {
                        Response::FindValue(ValueOrContacts::Value(cur.prefixed()?.to_vec()))
                    }
                    tag => {
                        return Err(RpcError::Protocol(format!(
                            "unknown find_value tag {tag}"
                        )))
                    }
                },
                METHOD_ERROR => Response::Error {
                    message: String::from_utf8_lossy(cur.prefixed()?).into_owned(),
                },
                other => {
                    return Err(RpcError::Protocol(format!("unknown method {other:?}")))
                }
            };
            Body::Response(response)
        };

        cur.finish()?;

        Ok(Envelope {
            token: self.token,
            sender: self.sender,
            body,
        })
    }
}

/// Decode a complete datagram in one step.
///
/// # Errors
///
/// Returns [`RpcError::Protocol`] on any framing or payload violation.
pub fn decode(data: &[u8]) -> Result<Envelope> {
    decode_raw(data)?.into_envelope()
}

fn put_prefixed(out: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    let len = u16::try_from(bytes.len()).map_err(|_| {
        RpcError::Protocol(format!(
            "field too long for 2-byte length prefix: {} bytes",
            bytes.len()
        ))
    })?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

fn put_contacts(out: &mut Vec<u8>, contacts: &[Contact]) -> Result<()> {
    let count = u8::try_from(contacts.len()).map_err(|_| {
        RpcError::Protocol(format!("too many contacts: {}", contacts.len()))
    })?;
    out.push(count);
    for contact in contacts {
        out.extend_from_slice(contact.id.as_bytes());
        match contact.addr {
            SocketAddr::V4(v4) => {
                out.push(4);
                out.extend_from_slice(&v4.ip().octets());
                out.extend_from_slice(&v4.port().to_be_bytes());
            }
            SocketAddr::V6(v6) => {
                out.push(6);
                out.extend_from_slice(&v6.ip().octets());
                out.extend_from_slice(&v6.port().to_be_bytes());
            }
        }
    }
    Ok(())
}

/// Bounds-checked reader over a received payload.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| RpcError::Protocol("truncated message".to_string()))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        let arr: [u8; 8] = bytes
            .try_into()
            .map_err(|_| RpcError::Protocol("truncated message".to_string()))?;
        Ok(u64::from_be_bytes(arr))
    }

    fn bool(&mut self) -> Result<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(RpcError::Protocol(format!("invalid boolean {other}"))),
        }
    }

    fn node_id(&mut self) -> Result<NodeId> {
        let bytes = self.take(ID_BYTES)?;
        NodeId::from_slice(bytes).map_err(|e| RpcError::Protocol(e.to_string()))
    }

    fn prefixed(&mut self) -> Result<&'a [u8]> {
        let len = self.u16()? as usize;
        self.take(len)
    }

    fn addr(&mut self) -> Result<SocketAddr> {
        let family = self.u8()?;
        let ip: IpAddr = match family {
            4 => {
                let octets: [u8; 4] = self
                    .take(4)?
                    .try_into()
                    .map_err(|_| RpcError::Protocol("truncated address".to_string()))?;
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            6 => {
                let octets: [u8; 16] = self
                    .take(16)?
                    .try_into()
                    .map_err(|_| RpcError::Protocol("truncated address".to_string()))?;
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            other => {
                return Err(RpcError::Protocol(format!(
                    "unknown address family {other}"
                )))
            }
        };
        let port = self.u16()?;
        Ok(SocketAddr::new(ip, port))
    }

    fn contacts(&mut self) -> Result<Vec<Contact>> {
        let count = self.u8()? as usize;
        let mut contacts = Vec::with_capacity(count);
        for _ in 0..count {
            let id = self.node_id()?;
            let addr = self.addr()?;
            contacts.push(Contact::new(id, addr));
        }
        Ok(contacts)
    }

    /// Reject trailing bytes after a fully parsed payload.
    fn finish(&self) -> Result<()> {
        if self.pos != self.data.len() {
            return Err(RpcError::Protocol(format!(
                "{} trailing bytes after payload",
                self.data.len() - self.pos
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(envelope: Envelope) {
        let bytes = encode(&envelope).expect("encode");
        let decoded = decode(&bytes).expect("decode");
        assert_eq!(envelope, decoded);
    }

    fn contact_v4(seed: u8) -> Contact {
        Contact::new(
            NodeId::for_key(&[seed]),
            SocketAddr::from(([10, 0, 0, seed], 4000 + u16::from(seed))),
        )
    }

    #[test]
    fn test_roundtrip_ping() {
        roundtrip(Envelope {
            token: 0x0102_0304_0506_0708,
            sender: NodeId::random(),
            body: Body::Request(Request::Ping),
        });
        roundtrip(Envelope {
            token: u64::MAX,
            sender: NodeId::random(),
            body: Body::Response(Response::Ping {
                id: NodeId::random(),
            }),
        });
    }

    #[test]
    fn test_roundtrip_find_node() {
        roundtrip(Envelope {
            token: 7,
            sender: NodeId::random(),
            body: Body::Request(Request::FindNode {
                target: NodeId::random(),
            }),
        });
        roundtrip(Envelope {
            token: 7,
            sender: NodeId::random(),
            body: Body::Response(Response::FindNode {
                contacts: (1..=20).map(contact_v4).collect(),
            }),
        });
    }

    #[test]
    fn test_roundtrip_find_value() {
        roundtrip(Envelope {
            token: 9,
            sender: NodeId::random(),
            body: Body::Request(Request::FindValue {
                target: NodeId::for_key(b"k"),
            }),
        });
        roundtrip(Envelope {
            token: 9,
            sender: NodeId::random(),
            body: Body::Response(Response::FindValue(ValueOrContacts::Value(
                b"hello world".to_vec(),
            ))),
        });
        roundtrip(Envelope {
            token: 9,
            sender: NodeId::random(),
            body: Body::Response(Response::FindValue(ValueOrContacts::Contacts(vec![
                contact_v4(1),
                contact_v4(2),
            ]))),
        });
    }

    #[test]
    fn test_roundtrip_store() {
        let key = b"greeting".to_vec();
        roundtrip(Envelope {
            token: 11,
            sender: NodeId::random(),
            body: Body::Request(Request::Store {
                key_id: NodeId::for_key(&key),
                key,
                value: b"hello".to_vec(),
            }),
        });
        roundtrip(Envelope {
            token: 11,
            sender: NodeId::random(),
            body: Body::Response(Response::Store { stored: false }),
        });
    }

    #[test]
    fn test_roundtrip_error() {
        roundtrip(Envelope {
            token: 13,
            sender: NodeId::random(),
            body: Body::Response(Response::Error {
                message: "unknown method \"frobnicate\"".to_string(),
            }),
        });
    }

    #[test]
    fn test_roundtrip_ipv6_contact() {
        let contact = Contact::new(
            NodeId::random(),
            "[2001:db8::7]:4100".parse().expect("valid addr"),
        );
        roundtrip(Envelope {
            token: 17,
            sender: NodeId::random(),
            body: Body::Response(Response::FindNode {
                contacts: vec![contact],
            }),
        });
    }

    #[test]
    fn test_empty_and_truncated_rejected() {
        assert!(decode(&[]).is_err());
        let bytes = encode(&Envelope {
            token: 1,
            sender: NodeId::random(),
            body: Body::Request(Request::FindNode {
                target: NodeId::random(),
            }),
        })
        .expect("encode");
        assert!(decode(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_unknown_type_byte_rejected() {
        let mut bytes = encode(&Envelope {
            token: 1,
            sender: NodeId::random(),
            body: Body::Request(Request::Ping),
        })
        .expect("encode");
        bytes[0] = 0x7F;
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn test_unknown_method_fails_payload_parse_only() {
        // Hand-build a request with a syntactically valid but unknown method.
        let mut bytes = Vec::new();
        bytes.push(TYPE_REQUEST);
        bytes.extend_from_slice(&42u64.to_be_bytes());
        bytes.extend_from_slice(NodeId::MIN.as_bytes());
        bytes.push(6);
        bytes.extend_from_slice(b"gossip");

        let raw = decode_raw(&bytes).expect("framing decodes");
        assert_eq!(raw.token, 42);
        assert!(raw.is_request);
        assert!(raw.into_envelope().is_err());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = encode(&Envelope {
            token: 3,
            sender: NodeId::random(),
            body: Body::Request(Request::Ping),
        })
        .expect("encode");
        bytes.push(0xAA);
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn test_invalid_bool_rejected() {
        let mut bytes = encode(&Envelope {
            token: 3,
            sender: NodeId::random(),
            body: Body::Response(Response::Store { stored: true }),
        })
        .expect("encode");
        let last = bytes.len() - 1;
        bytes[last] = 2;
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn test_request_fits_recommended_datagram() {
        // A full find_node response with 20 IPv6 contacts stays within the
        // recommended single-datagram budget.
        let contacts: Vec<Contact> = (0..20)
            .map(|i| {
                Contact::new(
                    NodeId::random(),
                    SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 4000 + i),
                )
            })
            .collect();
        let bytes = encode(&Envelope {
            token: 1,
            sender: NodeId::random(),
            body: Body::Response(Response::FindNode { contacts }),
        })
        .expect("encode");
        assert!(bytes.len() <= crate::RECOMMENDED_DATAGRAM_SIZE);
    }
}
