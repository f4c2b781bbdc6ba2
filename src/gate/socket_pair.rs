use tracing::{debug, info};

use crate::gate::config::GateConfig;
use crate::gate::registry::ConnectionRegistry;
use crate::gate::GateDestroyed;
use crate::transport::{SocketId, SocketKind, Transport};


/// The sockets of a gate: one bound socket receiving from everybody, and one outbound connection
///  per peer. This layer manages socket lifecycle only, it does not interpret messages.
pub struct SocketPair<T: Transport> {
    transport: T,
    bind_addr: String,
    connect_addr: String,
    bind_socket: SocketId,
    connections: ConnectionRegistry,
    destroyed: bool,
}

impl<T: Transport> SocketPair<T> {
    /// Binding failures (e.g. port in use) are returned as they are, they are not retried.
    pub fn bind(config: &GateConfig, mut transport: T) -> anyhow::Result<SocketPair<T>> {
        let bind_addr = config.bind_endpoint();
        let connect_addr = config.connect_endpoint();

        let bind_socket = transport.bind(&bind_addr, connect_addr.as_bytes())?;
        info!(%bind_addr, %connect_addr, "gate bound");

        Ok(SocketPair {
            transport,
            bind_addr,
            connect_addr,
            bind_socket,
            connections: ConnectionRegistry::default(),
            destroyed: false,
        })
    }

    pub fn bind_addr(&self) -> &str {
        &self.bind_addr
    }

    pub fn connect_addr(&self) -> &str {
        &self.connect_addr
    }

    pub fn bind_socket(&self) -> SocketId {
        self.bind_socket
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn check_alive(&self) -> anyhow::Result<()> {
        if self.destroyed {
            return Err(GateDestroyed.into());
        }
        Ok(())
    }

    /// the bound socket followed by all outbound connections
    pub fn all_sockets(&self) -> Vec<SocketId> {
        let mut result = Vec::with_capacity(self.connections.len() + 1);
        result.push(self.bind_socket);
        result.extend(self.connections.sockets());
        result
    }

    /// Returns the connection to `peer_addr`, creating it if necessary. The flag is `true` if the
    ///  connection was newly created.
    pub fn open_connection(&mut self, peer_addr: &str, kind: SocketKind, send_high_water_mark: usize) -> anyhow::Result<(SocketId, bool)> {
        self.check_alive()?;

        let (socket, created) = self.connections.get_or_try_insert_with(peer_addr, || {
            self.transport.connect(peer_addr, kind, send_high_water_mark)
        })?;
        if created {
            debug!(peer_addr, ?socket, ?kind, "opened connection");
        }
        Ok((socket, created))
    }

    /// Returns `true` if there was a connection
    pub fn close_connection(&mut self, peer_addr: &str) -> anyhow::Result<bool> {
        self.check_alive()?;

        match self.connections.remove(peer_addr) {
            Some(socket) => {
                self.transport.close(socket);
                debug!(peer_addr, ?socket, "closed connection");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Closes all sockets, discarding unsent messages, and releases the transport. Only the first
    ///  call has an effect.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }

        for socket in self.connections.drain() {
            self.transport.close(socket);
        }
        self.transport.close(self.bind_socket);
        self.transport.terminate();
        self.destroyed = true;
        info!(connect_addr = %self.connect_addr, "gate destroyed");
    }
}
