use std::time::Duration;

use anyhow::anyhow;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::transport::{parse_endpoint, SendOutcome, SocketId, SocketKind, Transport};


/// [Transport] on top of ZeroMQ. Every socket is created with `LINGER=0`, so closing a socket or
///  terminating the context never waits for unsent messages.
pub struct ZmqTransport {
    context: zmq::Context,
    sockets: FxHashMap<SocketId, zmq::Socket>,
    next_id: u64,
    terminated: bool,
}

impl ZmqTransport {
    pub fn new() -> ZmqTransport {
        ZmqTransport {
            context: zmq::Context::new(),
            sockets: FxHashMap::default(),
            next_id: 0,
            terminated: false,
        }
    }

    fn new_socket(&self, kind: zmq::SocketType) -> anyhow::Result<zmq::Socket> {
        if self.terminated {
            return Err(anyhow!("zmq context was terminated"));
        }
        let socket = self.context.socket(kind)?;
        socket.set_linger(0)?;
        Ok(socket)
    }

    fn register(&mut self, socket: zmq::Socket) -> SocketId {
        let id = SocketId(self.next_id);
        self.next_id += 1;
        self.sockets.insert(id, socket);
        id
    }

    fn socket(&self, id: SocketId) -> anyhow::Result<&zmq::Socket> {
        self.sockets.get(&id)
            .ok_or_else(|| anyhow!("unknown or closed {:?}", id))
    }
}

impl Default for ZmqTransport {
    fn default() -> Self {
        ZmqTransport::new()
    }
}

impl Transport for ZmqTransport {
    fn bind(&mut self, endpoint: &str, identity: &[u8]) -> anyhow::Result<SocketId> {
        let socket = self.new_socket(zmq::ROUTER)?;
        socket.set_identity(identity)?;
        socket.bind(endpoint)
            .map_err(|e| anyhow!("cannot bind to {}: {}", endpoint, e))?;
        Ok(self.register(socket))
    }

    fn connect(&mut self, endpoint: &str, kind: SocketKind, send_high_water_mark: usize) -> anyhow::Result<SocketId> {
        // zmq accepts some endpoints (e.g. without a port) only to fail later in its I/O thread
        parse_endpoint(endpoint)?;

        let socket = match kind {
            SocketKind::Dealer => self.new_socket(zmq::DEALER)?,
            SocketKind::Router => {
                let socket = self.new_socket(zmq::ROUTER)?;
                socket.set_router_mandatory(true)?;
                socket
            }
        };
        socket.set_sndhwm(i32::try_from(send_high_water_mark).unwrap_or(i32::MAX))?;
        socket.connect(endpoint)
            .map_err(|e| anyhow!("cannot connect to {}: {}", endpoint, e))?;
        Ok(self.register(socket))
    }

    fn send_multipart(&mut self, socket: SocketId, parts: Vec<Bytes>) -> anyhow::Result<SendOutcome> {
        let zmq_socket = self.socket(socket)?;
        match zmq_socket.send_multipart(parts.iter().map(|p| p.as_ref()), zmq::DONTWAIT) {
            Ok(()) => Ok(SendOutcome::Sent),
            Err(zmq::Error::EHOSTUNREACH) => Ok(SendOutcome::Unroutable),
            Err(zmq::Error::EAGAIN) => Ok(SendOutcome::WouldBlock),
            Err(e) => Err(anyhow!("error sending on {:?}: {}", socket, e)),
        }
    }

    fn recv_multipart(&mut self, socket: SocketId) -> anyhow::Result<Option<Vec<Bytes>>> {
        let zmq_socket = self.socket(socket)?;
        match zmq_socket.recv_multipart(zmq::DONTWAIT) {
            Ok(parts) => Ok(Some(parts.into_iter().map(Bytes::from).collect())),
            Err(zmq::Error::EAGAIN) => Ok(None),
            Err(e) => Err(anyhow!("error receiving on {:?}: {}", socket, e)),
        }
    }

    fn poll(&mut self, sockets: &[SocketId], timeout: Duration) -> anyhow::Result<Vec<SocketId>> {
        let mut ids = Vec::with_capacity(sockets.len());
        let mut items = Vec::with_capacity(sockets.len());
        for id in sockets {
            match self.sockets.get(id) {
                Some(s) => {
                    ids.push(*id);
                    items.push(s.as_poll_item(zmq::POLLIN));
                }
                None => warn!("polling unknown {:?} - skipping", id),
            }
        }

        let timeout_millis = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
        let num_ready = zmq::poll(&mut items, timeout_millis)?;
        trace!("{} of {} sockets ready", num_ready, items.len());

        Ok(ids.into_iter()
            .zip(items.iter())
            .filter(|(_, item)| item.is_readable())
            .map(|(id, _)| id)
            .collect())
    }

    fn close(&mut self, socket: SocketId) {
        // LINGER was set to 0 on creation, so dropping discards pending messages
        if self.sockets.remove(&socket).is_none() {
            debug!("closing unknown {:?} - ignoring", socket);
        }
    }

    fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.sockets.clear();
        if let Err(e) = self.context.destroy() {
            warn!("error terminating zmq context: {}", e);
        }
        self.terminated = true;
    }
}

impl Drop for ZmqTransport {
    fn drop(&mut self) {
        self.terminate();
    }
}
