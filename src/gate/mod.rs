//! Gates are a node's addressable endpoint for sending and receiving messages. Every gate binds
//!  one socket that all peers send to, and lazily opens one outbound connection per peer it sends
//!  to. Nothing happens in the background: received messages are read and dispatched to an
//!  [handler::RpcHandler] only while the owner calls [Gateway::poll].
//!
//! There are two topologies:
//! * [hub::HubGate] sends through fire-and-forget dealer connections that are created on first
//!    use
//! * [peer::PeerGate] uses router sockets on both ends. Connections must be opened explicitly,
//!    and messages are queued until the connection's handshake completes.

pub mod config;
pub mod frame;
pub mod gate_core;
pub mod handler;
pub mod hub;
pub mod peer;
pub mod registry;
pub mod socket_pair;

use std::fmt::{Display, Formatter};
use std::time::Duration;

use bytes::Bytes;

use crate::gate::gate_core::GateStats;


/// What happened to a message handed to [MessageSender::send]. Sending never blocks, and network
///  trouble is reported here rather than as an error.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendStatus {
    /// handed to the transport
    Sent,
    /// waiting in the gate for the connection to become ready, delivered by a later poll
    Queued,
    /// no connection could be established, or the transport refused the message
    Unreachable,
    /// the topology requires an explicit connect before sending to this address
    NotConnected,
    /// the high-water mark for this peer was reached
    Dropped,
}

impl SendStatus {
    /// `true` if the message is on its way (or will be once the connection is ready)
    pub fn is_accepted(&self) -> bool {
        matches!(self, SendStatus::Sent | SendStatus::Queued)
    }
}


/// Returned (wrapped in [anyhow::Error]) by all operations on a gate after it was destroyed
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct GateDestroyed;

impl Display for GateDestroyed {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "gate destroyed")
    }
}

impl std::error::Error for GateDestroyed {}


/// The sending half of a gate. This is what [handler::RpcHandler]s get to reply with.
pub trait MessageSender {
    /// the address other gates use to send to this gate
    fn self_addr(&self) -> &str;

    fn send(&mut self, to: &str, payload: Bytes) -> anyhow::Result<SendStatus>;
}

/// The contract shared by both gate topologies.
pub trait Gateway: MessageSender {
    /// Opens the outbound connection to `peer_addr`. Returns `false` if it already existed.
    fn connect(&mut self, peer_addr: &str) -> anyhow::Result<bool>;

    /// Closes the outbound connection to `peer_addr`, discarding anything not sent yet. Returns
    ///  `false` if there was no such connection.
    fn disconnect(&mut self, peer_addr: &str) -> anyhow::Result<bool>;

    fn has_connection(&self, peer_addr: &str) -> bool;

    fn connection_count(&self) -> usize;

    /// Waits up to `timeout` for incoming messages and dispatches them. Each socket is read at
    ///  most `max_per_poll` times per call. Returns the number of messages dispatched to the
    ///  handler.
    fn poll(&mut self, timeout: Duration) -> anyhow::Result<usize>;

    fn set_max_per_poll(&mut self, max_per_poll: usize) -> anyhow::Result<()>;

    fn stats(&self) -> GateStats;

    /// Closes all sockets without waiting for unsent messages. Calling this again is a no-op.
    fn destroy(&mut self);

    fn is_destroyed(&self) -> bool;
}
