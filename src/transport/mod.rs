//! The socket layer a gate is built on. A [Transport] owns all sockets it creates and hands out
//!  [SocketId] handles for them; gates never touch sockets directly.
//!
//! Two implementations exist: [zmq_transport::ZmqTransport] for real networks, and
//!  [inproc::InprocTransport] connecting all gates that share one [inproc::Switchboard] inside
//!  a single process.

pub mod inproc;
pub mod zmq_transport;

use std::fmt::{Debug, Formatter};
use std::time::Duration;

use anyhow::{anyhow, bail};
use bytes::Bytes;
#[cfg(test)] use mockall::automock;


#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SocketId(pub u64);

impl Debug for SocketId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "socket#{}", self.0)
    }
}

/// The two socket flavors the gates need.
///
/// A `Router` prefixes every received message with the identity of the sending socket, and when
///  sending it consumes the first part as the identity of the target. A `Dealer` sends and
///  receives messages as they are.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SocketKind {
    Router,
    Dealer,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendOutcome {
    Sent,
    /// a router socket does not (yet) know a peer with the identity in the first part
    Unroutable,
    /// the socket's send buffer is at its high-water mark
    WouldBlock,
}

/// All calls are non-blocking except [Transport::poll], which waits for at most its timeout.
#[cfg_attr(test, automock)]
pub trait Transport: Send {
    /// Opens a router socket listening on `endpoint`. Peers address it by `identity`.
    fn bind(&mut self, endpoint: &str, identity: &[u8]) -> anyhow::Result<SocketId>;

    /// Opens a socket connected to `endpoint`. Fails for malformed endpoints; the peer being
    ///  unreachable is not an error at this point.
    fn connect(&mut self, endpoint: &str, kind: SocketKind, send_high_water_mark: usize) -> anyhow::Result<SocketId>;

    /// Queues a multi-part message atomically: either all parts are queued or none.
    fn send_multipart(&mut self, socket: SocketId, parts: Vec<Bytes>) -> anyhow::Result<SendOutcome>;

    /// Returns `None` if no complete message is waiting.
    fn recv_multipart(&mut self, socket: SocketId) -> anyhow::Result<Option<Vec<Bytes>>>;

    /// Returns the subset of `sockets` that have messages waiting. A zero timeout only checks.
    fn poll(&mut self, sockets: &[SocketId], timeout: Duration) -> anyhow::Result<Vec<SocketId>>;

    /// Closes a socket, discarding everything it has not sent yet.
    fn close(&mut self, socket: SocketId);

    /// Closes all remaining sockets and releases the transport's resources. Calls after the
    ///  first are no-ops.
    fn terminate(&mut self);
}


/// Splits a `tcp://host:port` endpoint into host and port. `*` is accepted as host (bind to all
///  interfaces).
pub fn parse_endpoint(endpoint: &str) -> anyhow::Result<(&str, u16)> {
    let Some(host_and_port) = endpoint.strip_prefix("tcp://") else {
        bail!("unsupported endpoint {:?}: expected tcp://<host>:<port>", endpoint);
    };
    let Some((host, port)) = host_and_port.rsplit_once(':') else {
        bail!("endpoint {:?} has no port", endpoint);
    };
    if host.is_empty() {
        bail!("endpoint {:?} has no host", endpoint);
    }
    let port = port.parse::<u16>()
        .map_err(|e| anyhow!("endpoint {:?} has an invalid port: {}", endpoint, e))?;
    Ok((host, port))
}
