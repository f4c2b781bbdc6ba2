use std::time::Duration;

use anyhow::bail;
use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::gate::config::GateConfig;
use crate::gate::frame::{ControlType, Frame};
use crate::gate::socket_pair::SocketPair;
use crate::transport::{SendOutcome, SocketId, Transport};


/// Counters for everything a gate does silently: malformed frames and unknown control types are
///  dropped, and traffic on outbound connections is discarded.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct GateStats {
    pub rpc_dispatched: u64,
    pub malformed_dropped: u64,
    pub unknown_control_dropped: u64,
    pub connection_frames_discarded: u64,
    pub frames_sent: u64,
    pub send_failures: u64,
}


/// The part shared by both topologies: sockets, the bounded poll loop and the framing. It turns
///  received multi-part messages into [Frame]s, leaving dispatch to the gate.
pub struct GateCore<T: Transport> {
    sockets: SocketPair<T>,
    max_per_poll: usize,
    stats: GateStats,
}

impl<T: Transport> GateCore<T> {
    pub fn bind(config: &GateConfig, transport: T) -> anyhow::Result<GateCore<T>> {
        config.validate()?;

        Ok(GateCore {
            sockets: SocketPair::bind(config, transport)?,
            max_per_poll: config.max_per_poll,
            stats: GateStats::default(),
        })
    }

    pub fn sockets(&self) -> &SocketPair<T> {
        &self.sockets
    }

    pub fn sockets_mut(&mut self) -> &mut SocketPair<T> {
        &mut self.sockets
    }

    pub fn connect_addr(&self) -> &str {
        self.sockets.connect_addr()
    }

    pub fn stats(&self) -> GateStats {
        self.stats
    }

    pub fn max_per_poll(&self) -> usize {
        self.max_per_poll
    }

    pub fn set_max_per_poll(&mut self, max_per_poll: usize) -> anyhow::Result<()> {
        self.sockets.check_alive()?;
        if max_per_poll == 0 {
            bail!("max_per_poll must be positive");
        }
        self.max_per_poll = max_per_poll;
        Ok(())
    }

    /// Sends an RPC frame from this gate. `routing_identity` is prepended for router
    ///  connections.
    pub fn send_rpc(&mut self, socket: SocketId, routing_identity: Option<&str>, payload: Bytes) -> anyhow::Result<SendOutcome> {
        let frame = Frame::rpc(self.sockets.connect_addr(), payload);

        let mut parts = Vec::with_capacity(Frame::NUM_PARTS_WITH_IDENTITY);
        if let Some(identity) = routing_identity {
            parts.push(Bytes::copy_from_slice(identity.as_bytes()));
        }
        parts.extend(frame.to_parts());

        self.send_parts(socket, parts)
    }

    /// Sends pre-built parts, counting the outcome
    pub fn send_parts(&mut self, socket: SocketId, parts: Vec<Bytes>) -> anyhow::Result<SendOutcome> {
        match self.sockets.transport_mut().send_multipart(socket, parts) {
            Ok(SendOutcome::Sent) => {
                trace!(?socket, "sent frame");
                self.stats.frames_sent += 1;
                Ok(SendOutcome::Sent)
            }
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.stats.send_failures += 1;
                Err(e)
            }
        }
    }

    pub fn record_send_failure(&mut self) {
        self.stats.send_failures += 1;
    }

    /// Polls all sockets once, waiting up to `timeout`. From the bound socket, at most
    ///  `max_per_poll` messages are read and returned if they are well-formed RPC frames. Anything
    ///  arriving on outbound connections is read (with the same bound) and discarded.
    pub fn poll_frames(&mut self, timeout: Duration) -> anyhow::Result<Vec<Frame>> {
        self.sockets.check_alive()?;

        let all_sockets = self.sockets.all_sockets();
        let ready = self.sockets.transport_mut().poll(&all_sockets, timeout)?;
        if ready.is_empty() {
            return Ok(Vec::new());
        }

        let bind_socket = self.sockets.bind_socket();
        let mut frames = Vec::new();
        for socket in ready {
            if socket == bind_socket {
                for parts in self.drain(socket) {
                    if let Some(frame) = self.accept(parts) {
                        frames.push(frame);
                    }
                }
            }
            else {
                let discarded = self.drain(socket).len();
                trace!(?socket, discarded, "discarded messages on outbound connection");
                self.stats.connection_frames_discarded += discarded as u64;
            }
        }
        Ok(frames)
    }

    fn drain(&mut self, socket: SocketId) -> Vec<Vec<Bytes>> {
        let mut result = Vec::new();
        while result.len() < self.max_per_poll {
            match self.sockets.transport_mut().recv_multipart(socket) {
                Ok(Some(parts)) => result.push(parts),
                Ok(None) => break,
                Err(e) => {
                    warn!(?socket, "error receiving - skipping socket for this poll: {}", e);
                    break;
                }
            }
        }
        result
    }

    fn accept(&mut self, parts: Vec<Bytes>) -> Option<Frame> {
        match Frame::try_parse(parts) {
            Ok(frame) if frame.control == ControlType::Rpc => {
                trace!(from = %frame.sender_addr, len = frame.payload.len(), "received RPC");
                self.stats.rpc_dispatched += 1;
                Some(frame)
            }
            Ok(frame) => {
                trace!(from = %frame.sender_addr, control = ?frame.control, "ignoring frame with unknown control type");
                self.stats.unknown_control_dropped += 1;
                None
            }
            Err(e) => {
                debug!("dropping malformed message: {}", e);
                self.stats.malformed_dropped += 1;
                None
            }
        }
    }

    pub fn destroy(&mut self) {
        self.sockets.destroy();
    }
}
