use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::gate::config::GateConfig;
use crate::gate::gate_core::{GateCore, GateStats};
use crate::gate::handler::RpcHandler;
use crate::gate::{Gateway, MessageSender, SendStatus};
use crate::transport::{SendOutcome, SocketId, SocketKind, Transport};


/// The sending half of a [PeerGate]. Router connections can only deliver once the peer's
///  identity is known to them, so messages are kept per peer until then, oldest first, up to
///  the high-water mark.
pub struct PeerSender<T: Transport> {
    core: GateCore<T>,
    high_water_mark: usize,
    pending: FxHashMap<String, VecDeque<Bytes>>,
}

impl<T: Transport> PeerSender<T> {
    fn queue_size(&self) -> usize {
        self.pending.values()
            .map(|q| q.len())
            .sum()
    }

    /// Sends queued messages to a peer in order, stopping at the first one the transport does not
    ///  accept yet.
    fn flush_peer(&mut self, peer_addr: &str, socket: SocketId) {
        let Some(queue) = self.pending.get_mut(peer_addr) else { return };

        while let Some(payload) = queue.front() {
            match self.core.send_rpc(socket, Some(peer_addr), payload.clone()) {
                Ok(SendOutcome::Sent) => {
                    queue.pop_front();
                }
                Ok(_) => break,
                Err(e) => {
                    warn!(to = peer_addr, "error sending queued message - dropping it: {}", e);
                    queue.pop_front();
                }
            }
        }

        if queue.is_empty() {
            trace!(to = peer_addr, "queue flushed");
            self.pending.remove(peer_addr);
        }
    }

    fn flush_all(&mut self) {
        if self.pending.is_empty() {
            return;
        }

        let peers: Vec<String> = self.pending.keys().cloned().collect();
        for peer_addr in peers {
            match self.core.sockets().connections().get(&peer_addr) {
                Some(socket) => self.flush_peer(&peer_addr, socket),
                None => {
                    // connection was closed under the queue
                    self.pending.remove(&peer_addr);
                }
            }
        }
    }
}

impl<T: Transport> MessageSender for PeerSender<T> {
    fn self_addr(&self) -> &str {
        self.core.connect_addr()
    }

    /// Sends immediately if nothing is queued for the peer and the connection is ready, and
    ///  queues otherwise. A full queue drops the new message, never an older one.
    fn send(&mut self, to: &str, payload: Bytes) -> anyhow::Result<SendStatus> {
        self.core.sockets().check_alive()?;

        let Some(socket) = self.core.sockets().connections().get(to) else {
            debug!(to, "no connection - call connect() before sending");
            return Ok(SendStatus::NotConnected);
        };

        self.flush_peer(to, socket);

        if let Some(queue) = self.pending.get_mut(to) {
            if queue.len() >= self.high_water_mark {
                debug!(to, queue_len = queue.len(), "queue full - dropping message");
                return Ok(SendStatus::Dropped);
            }
            queue.push_back(payload);
            return Ok(SendStatus::Queued);
        }

        match self.core.send_rpc(socket, Some(to), payload.clone()) {
            Ok(SendOutcome::Sent) => Ok(SendStatus::Sent),
            Ok(outcome) => {
                trace!(to, ?outcome, "connection not ready - queueing message");
                self.pending.entry(to.to_string())
                    .or_default()
                    .push_back(payload);
                Ok(SendStatus::Queued)
            }
            Err(e) => {
                warn!(to, "error sending - dropping message: {}", e);
                Ok(SendStatus::Unreachable)
            }
        }
    }
}


/// Symmetric gate: both sides use router sockets, so a peer has to be connected explicitly
///  before sending to it. Messages sent before the connection is ready are queued and go out
///  on later sends or polls.
pub struct PeerGate<T: Transport, H: RpcHandler> {
    sender: PeerSender<T>,
    handler: H,
}

impl<T: Transport, H: RpcHandler> PeerGate<T, H> {
    pub fn bind(config: GateConfig, transport: T, handler: H) -> anyhow::Result<PeerGate<T, H>> {
        Ok(PeerGate {
            sender: PeerSender {
                core: GateCore::bind(&config, transport)?,
                high_water_mark: config.high_water_mark,
                pending: FxHashMap::default(),
            },
            handler,
        })
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn bind_addr(&self) -> &str {
        self.sender.core.sockets().bind_addr()
    }

    /// number of messages waiting for their connection, over all peers
    pub fn queue_size(&self) -> usize {
        self.sender.queue_size()
    }
}

impl<T: Transport, H: RpcHandler> MessageSender for PeerGate<T, H> {
    fn self_addr(&self) -> &str {
        self.sender.self_addr()
    }

    fn send(&mut self, to: &str, payload: Bytes) -> anyhow::Result<SendStatus> {
        self.sender.send(to, payload)
    }
}

impl<T: Transport, H: RpcHandler> Gateway for PeerGate<T, H> {
    fn connect(&mut self, peer_addr: &str) -> anyhow::Result<bool> {
        let high_water_mark = self.sender.high_water_mark;
        let (_, created) = self.sender.core.sockets_mut().open_connection(peer_addr, SocketKind::Router, high_water_mark)?;
        Ok(created)
    }

    fn disconnect(&mut self, peer_addr: &str) -> anyhow::Result<bool> {
        let closed = self.sender.core.sockets_mut().close_connection(peer_addr)?;
        if let Some(queue) = self.sender.pending.remove(peer_addr) {
            debug!(peer_addr, discarded = queue.len(), "discarded queued messages");
        }
        Ok(closed)
    }

    fn has_connection(&self, peer_addr: &str) -> bool {
        self.sender.core.sockets().connections().contains(peer_addr)
    }

    fn connection_count(&self) -> usize {
        self.sender.core.sockets().connections().len()
    }

    fn poll(&mut self, timeout: Duration) -> anyhow::Result<usize> {
        self.sender.core.sockets().check_alive()?;
        self.sender.flush_all();

        let frames = self.sender.core.poll_frames(timeout)?;
        let num_dispatched = frames.len();
        for frame in frames {
            self.handler.on_rpc(&mut self.sender, &frame.sender_addr, frame.payload);
        }

        self.sender.flush_all();
        Ok(num_dispatched)
    }

    fn set_max_per_poll(&mut self, max_per_poll: usize) -> anyhow::Result<()> {
        self.sender.core.set_max_per_poll(max_per_poll)
    }

    fn stats(&self) -> GateStats {
        self.sender.core.stats()
    }

    fn destroy(&mut self) {
        if !self.sender.pending.is_empty() {
            debug!(discarded = self.sender.queue_size(), "discarding queued messages");
            self.sender.pending.clear();
        }
        self.sender.core.destroy();
    }

    fn is_destroyed(&self) -> bool {
        self.sender.core.sockets().is_destroyed()
    }
}

impl<T: Transport, H: RpcHandler> Drop for PeerGate<T, H> {
    fn drop(&mut self) {
        self.destroy();
    }
}
