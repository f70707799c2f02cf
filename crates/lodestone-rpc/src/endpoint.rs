//! UDP RPC endpoint: outbound calls with correlation, inbound dispatch.
//!
//! One [`RpcEndpoint`] wraps one bound UDP socket. Outbound calls get a
//! fresh random 64-bit correlation token and park on a oneshot until the
//! matching response arrives or the deadline passes. Inbound datagrams are
//! decoded and either dispatched to the [`InboundHandler`] (requests) or
//! matched against the pending-call table (responses).
//!
//! ## Lifecycle
//!
//! 1. [`RpcEndpoint::bind`] binds the socket.
//! 2. [`RpcEndpoint::start`] spawns the receive loop with a handler.
//! 3. [`RpcClient`] handles (cheaply cloneable) issue calls.
//! 4. [`RpcEndpoint::close`] stops the loop and fails every pending call
//!    with [`RpcError::Closed`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use lodestone_types::contact::Contact;
use lodestone_types::id::NodeId;

use crate::messages::{Request, Response};
use crate::wire::{self, Body, Envelope};
use crate::{Result, RpcError, DEFAULT_CALL_TIMEOUT, MAX_DATAGRAM_SIZE};

/// Configuration for an RPC endpoint.
#[derive(Clone, Debug)]
pub struct RpcConfig {
    /// Local address to bind to. Port 0 asks the OS for an ephemeral port.
    pub bind_addr: SocketAddr,
    /// Deadline applied to each outbound call unless overridden.
    pub call_timeout: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

/// Inbound message sink, implemented by the DHT node.
///
/// `observe` runs for every received message, request or response, before
/// the message has any other effect; `handle` produces the response body
/// for a request. Neither may block: both are called with plain references
/// from the receive path, and long work belongs on a spawned task.
pub trait InboundHandler: Send + Sync + 'static {
    /// Feed the observed sender into the routing table.
    fn observe(&self, sender: Contact);

    /// Handle a decoded request, producing the response to send back.
    fn handle(&self, sender: Contact, request: Request) -> Response;
}

/// A successfully correlated reply.
#[derive(Clone, Debug)]
pub struct CallReply {
    /// The response body.
    pub response: Response,
    /// Who answered (claimed identifier + source address).
    pub sender: Contact,
    /// True when the caller expected a specific responder identifier and
    /// the claimed identifier differs. The reply is still delivered; the
    /// caller decides how to treat the mismatch.
    pub id_mismatch: bool,
}

/// Outbound call state parked in the pending table.
struct PendingCall {
    reply_tx: oneshot::Sender<CallReply>,
    expected: Option<NodeId>,
}

/// State shared between the endpoint, its clients, and the receive loop.
struct Shared {
    socket: UdpSocket,
    local_id: NodeId,
    local_addr: SocketAddr,
    call_timeout: Duration,
    closed: AtomicBool,
    pending: Mutex<HashMap<u64, PendingCall>>,
}

impl Shared {
    /// Lock the pending table, recovering from a poisoned lock.
    fn pending(&self) -> MutexGuard<'_, HashMap<u64, PendingCall>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// A bound RPC endpoint.
pub struct RpcEndpoint {
    shared: Arc<Shared>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl RpcEndpoint {
    /// Bind a UDP socket for this endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Io`] if the socket cannot be bound.
    pub async fn bind(config: RpcConfig, local_id: NodeId) -> Result<Self> {
        let socket = UdpSocket::bind(config.bind_addr)
            .await
            .map_err(|e| RpcError::Io(e.to_string()))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| RpcError::Io(e.to_string()))?;

        info!(%local_addr, id = %local_id, "RPC endpoint bound");

        Ok(Self {
            shared: Arc::new(Shared {
                socket,
                local_id,
                local_addr,
                call_timeout: config.call_timeout,
                closed: AtomicBool::new(false),
                pending: Mutex::new(HashMap::new()),
            }),
            recv_task: Mutex::new(None),
        })
    }

    /// The local socket address this endpoint is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// The identifier stamped on every outbound message.
    pub fn local_id(&self) -> NodeId {
        self.shared.local_id
    }

    /// A cloneable handle for issuing outbound calls.
    pub fn client(&self) -> RpcClient {
        RpcClient {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Start the receive loop, dispatching inbound messages to `handler`.
    ///
    /// Idempotent: a second call is ignored.
    pub fn start(&self, handler: Arc<dyn InboundHandler>) {
        let mut slot = match self.recv_task.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.is_some() {
            warn!("receive loop already started");
            return;
        }
        let shared = Arc::clone(&self.shared);
        *slot = Some(tokio::spawn(recv_loop(shared, handler)));
    }

    /// Close the endpoint.
    ///
    /// Stops the receive loop and fails every pending call (and all future
    /// calls) with [`RpcError::Closed`]. Idempotent.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let task = match self.recv_task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            task.abort();
        }
        // Dropping the reply senders resolves every waiting caller with a
        // closed-channel error, surfaced as RpcError::Closed.
        let failed = self.shared.pending().drain().count();
        debug!(
            local_addr = %self.shared.local_addr,
            failed_calls = failed,
            "RPC endpoint closed"
        );
    }
}

/// Cloneable handle for outbound calls on an endpoint.
#[derive(Clone)]
pub struct RpcClient {
    shared: Arc<Shared>,
}

impl RpcClient {
    /// The identifier stamped on every outbound message.
    pub fn local_id(&self) -> NodeId {
        self.shared.local_id
    }

    /// The local socket address of the underlying endpoint.
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// The configured per-call timeout.
    pub fn call_timeout(&self) -> Duration {
        self.shared.call_timeout
    }

    /// Issue a request and await its correlated reply.
    ///
    /// `expected` is the responder identifier the caller anticipates, if
    /// known; a differing responder is delivered with
    /// [`CallReply::id_mismatch`] set.
    ///
    /// # Errors
    ///
    /// [`RpcError::Timeout`] when no reply arrives within the configured
    /// deadline, [`RpcError::Closed`] when the endpoint is closed,
    /// [`RpcError::Remote`] when the peer answers with an error response,
    /// [`RpcError::Io`] on send failure.
    pub async fn call(
        &self,
        addr: SocketAddr,
        request: Request,
        expected: Option<NodeId>,
    ) -> Result<CallReply> {
        self.call_with_timeout(addr, request, expected, self.shared.call_timeout)
            .await
    }

    /// [`call`](Self::call) with an explicit deadline.
    pub async fn call_with_timeout(
        &self,
        addr: SocketAddr,
        request: Request,
        expected: Option<NodeId>,
        timeout: Duration,
    ) -> Result<CallReply> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(RpcError::Closed);
        }

        let (token, reply_rx) = self.register(expected);

        let envelope = Envelope {
            token,
            sender: self.shared.local_id,
            body: Body::Request(request),
        };
        let bytes = wire::encode(&envelope)?;

        if let Err(e) = self.shared.socket.send_to(&bytes, addr).await {
            self.shared.pending().remove(&token);
            return Err(RpcError::Io(e.to_string()));
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => match reply.response {
                Response::Error { message } => Err(RpcError::Remote(message)),
                _ => Ok(reply),
            },
            // Sender dropped: the endpoint was closed under us.
            Ok(Err(_)) => Err(RpcError::Closed),
            Err(_elapsed) => {
                self.shared.pending().remove(&token);
                trace!(%addr, token, "call timed out");
                Err(RpcError::Timeout)
            }
        }
    }

    /// Insert a fresh pending call under an unused random token.
    fn register(&self, expected: Option<NodeId>) -> (u64, oneshot::Receiver<CallReply>) {
        let (reply_tx, reply_rx) = oneshot::channel();
        let mut pending = self.shared.pending();
        let mut token = rand::random::<u64>();
        while pending.contains_key(&token) {
            token = rand::random::<u64>();
        }
        pending.insert(token, PendingCall { reply_tx, expected });
        (token, reply_rx)
    }
}

/// The endpoint's receive loop.
async fn recv_loop(shared: Arc<Shared>, handler: Arc<dyn InboundHandler>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (len, from) = match shared.socket.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(e) => {
                if shared.closed.load(Ordering::SeqCst) {
                    break;
                }
                warn!(error = %e, "socket receive failed");
                continue;
            }
        };

        let raw = match wire::decode_raw(&buf[..len]) {
            Ok(raw) => raw,
            Err(e) => {
                debug!(%from, error = %e, "dropping malformed datagram");
                continue;
            }
        };

        let sender = Contact::new(raw.sender, from);
        let is_request = raw.is_request;
        let token = raw.token;

        match raw.into_envelope() {
            Ok(Envelope {
                body: Body::Request(request),
                ..
            }) => {
                handler.observe(sender);
                let shared = Arc::clone(&shared);
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    let response = handler.handle(sender, request);
                    send_response(&shared, from, token, response).await;
                });
            }
            Ok(Envelope {
                body: Body::Response(response),
                ..
            }) => {
                // Observe before delivery: a caller seeing the reply must
                // also see the updated routing table.
                handler.observe(sender);
                resolve_pending(&shared, token, sender, response);
            }
            Err(e) => {
                let message = e.to_string();
                debug!(%from, error = %message, "unparseable payload");
                if is_request {
                    // Answer so the caller is not left to time out.
                    let shared = Arc::clone(&shared);
                    tokio::spawn(async move {
                        send_response(&shared, from, token, Response::Error { message }).await;
                    });
                }
            }
        }
    }
}

/// Resolve the pending call for `token`, if any. Exactly-once: the entry is
/// removed before the reply is sent, so a duplicate response finds nothing.
fn resolve_pending(shared: &Shared, token: u64, sender: Contact, response: Response) {
    let entry = shared.pending().remove(&token);
    match entry {
        Some(pending) => {
            let id_mismatch = pending
                .expected
                .is_some_and(|expected| expected != sender.id);
            if id_mismatch {
                debug!(
                    from = %sender.addr,
                    claimed = %sender.id,
                    "responder identifier differs from expectation"
                );
            }
            if pending
                .reply_tx
                .send(CallReply {
                    response,
                    sender,
                    id_mismatch,
                })
                .is_err()
            {
                trace!(token, "caller gone before reply delivery");
            }
        }
        None => {
            trace!(token, from = %sender.addr, "spurious or late response discarded");
        }
    }
}

/// Encode and send a response; failures are logged, never fatal.
async fn send_response(shared: &Shared, to: SocketAddr, token: u64, response: Response) {
    let envelope = Envelope {
        token,
        sender: shared.local_id,
        body: Body::Response(response),
    };
    match wire::encode(&envelope) {
        Ok(bytes) => {
            if let Err(e) = shared.socket.send_to(&bytes, to).await {
                debug!(%to, error = %e, "response send failed");
            }
        }
        Err(e) => warn!(error = %e, "response encoding failed"),
    }
}
