use std::collections::hash_map::Entry;

use rustc_hash::FxHashMap;

use crate::transport::SocketId;


/// Outbound connections of a gate, keyed by the peer's address. There is at most one connection
///  per address.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: FxHashMap<String, SocketId>,
}

impl ConnectionRegistry {
    pub fn get(&self, peer_addr: &str) -> Option<SocketId> {
        self.connections.get(peer_addr).copied()
    }

    pub fn contains(&self, peer_addr: &str) -> bool {
        self.connections.contains_key(peer_addr)
    }

    /// Returns the existing connection if there is one, otherwise registers the socket created by
    ///  `create`. The flag is `true` if the connection was created by this call.
    pub fn get_or_try_insert_with(&mut self, peer_addr: &str, create: impl FnOnce() -> anyhow::Result<SocketId>) -> anyhow::Result<(SocketId, bool)> {
        match self.connections.entry(peer_addr.to_string()) {
            Entry::Occupied(e) => Ok((*e.get(), false)),
            Entry::Vacant(e) => {
                let socket = create()?;
                e.insert(socket);
                Ok((socket, true))
            }
        }
    }

    pub fn remove(&mut self, peer_addr: &str) -> Option<SocketId> {
        self.connections.remove(peer_addr)
    }

    /// empties the registry, returning all connections it held
    pub fn drain(&mut self) -> Vec<SocketId> {
        self.connections.drain()
            .map(|(_, socket)| socket)
            .collect()
    }

    pub fn sockets(&self) -> impl Iterator<Item = SocketId> + '_ {
        self.connections.values().copied()
    }

    pub fn peer_addrs(&self) -> impl Iterator<Item = &str> {
        self.connections.keys().map(|addr| addr.as_str())
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
