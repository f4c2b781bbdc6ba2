use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail};
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::transport::{parse_endpoint, SendOutcome, SocketId, SocketKind, Transport};


/// The shared medium of [InprocTransport]s: all transports created from the same switchboard can
///  reach each other. Host names in endpoints are not resolved, every host refers to the
///  switchboard, and endpoints are distinguished by port only.
#[derive(Clone, Default)]
pub struct Switchboard {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    exchange: Mutex<Exchange>,
    activity: Condvar,
}

#[derive(Default)]
struct Exchange {
    next_socket_id: u64,
    bound_ports: FxHashMap<u16, SocketId>,
    sockets: FxHashMap<SocketId, LocalSocket>,
}

struct LocalSocket {
    kind: SocketKind,
    identity: Bytes,
    /// `None` for bound sockets
    target_port: Option<u16>,
    send_high_water_mark: usize,
    inbox: VecDeque<Vec<Bytes>>,
    /// messages a dealer sent before its target endpoint was bound
    backlog: VecDeque<Vec<Bytes>>,
}

impl Switchboard {
    pub fn new() -> Switchboard {
        Switchboard::default()
    }

    pub fn transport(&self) -> InprocTransport {
        InprocTransport {
            switchboard: self.clone(),
            owned: Vec::new(),
            terminated: false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Exchange> {
        // a panicking test thread must not take the other gates down with it
        self.shared.exchange.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Exchange {
    fn new_socket_id(&mut self) -> SocketId {
        let id = SocketId(self.next_socket_id);
        self.next_socket_id += 1;
        id
    }

    /// moves dealer backlogs to their targets once those are bound, returns `true` if anything
    ///  was delivered
    fn flush_backlogs(&mut self, sockets: &[SocketId]) -> bool {
        let mut delivered = false;
        for id in sockets {
            let Some(socket) = self.sockets.get_mut(id) else { continue };
            if socket.backlog.is_empty() {
                continue;
            }
            let Some(target) = socket.target_port.and_then(|port| self.bound_ports.get(&port).copied()) else { continue };

            let identity = socket.identity.clone();
            let backlog = std::mem::take(&mut socket.backlog);
            if let Some(target_socket) = self.sockets.get_mut(&target) {
                for parts in backlog {
                    target_socket.inbox.push_back(with_identity(&identity, parts));
                }
                delivered = true;
            }
        }
        delivered
    }

    fn ready(&self, sockets: &[SocketId]) -> Vec<SocketId> {
        sockets.iter()
            .filter(|id| self.sockets.get(id).map(|s| !s.inbox.is_empty()).unwrap_or(false))
            .copied()
            .collect()
    }
}

fn with_identity(identity: &Bytes, parts: Vec<Bytes>) -> Vec<Bytes> {
    let mut result = Vec::with_capacity(parts.len() + 1);
    result.push(identity.clone());
    result.extend(parts);
    result
}


/// [Transport] delivering messages between gates of the same process through a [Switchboard].
pub struct InprocTransport {
    switchboard: Switchboard,
    owned: Vec<SocketId>,
    terminated: bool,
}

impl InprocTransport {
    fn check_alive(&self) -> anyhow::Result<()> {
        if self.terminated {
            bail!("inproc transport was terminated");
        }
        Ok(())
    }
}

impl Transport for InprocTransport {
    fn bind(&mut self, endpoint: &str, identity: &[u8]) -> anyhow::Result<SocketId> {
        self.check_alive()?;
        let (_, port) = parse_endpoint(endpoint)?;

        let mut exchange = self.switchboard.lock();
        if exchange.bound_ports.contains_key(&port) {
            bail!("cannot bind to {}: address already in use", endpoint);
        }

        let id = exchange.new_socket_id();
        exchange.sockets.insert(id, LocalSocket {
            kind: SocketKind::Router,
            identity: Bytes::copy_from_slice(identity),
            target_port: None,
            send_high_water_mark: usize::MAX,
            inbox: VecDeque::new(),
            backlog: VecDeque::new(),
        });
        exchange.bound_ports.insert(port, id);
        self.owned.push(id);
        trace!("bound {:?} to port {}", id, port);

        // dealers that sent before the port was bound
        let waiting: Vec<SocketId> = exchange.sockets.iter()
            .filter(|(_, s)| s.target_port == Some(port) && !s.backlog.is_empty())
            .map(|(id, _)| *id)
            .collect();
        if exchange.flush_backlogs(&waiting) {
            self.switchboard.shared.activity.notify_all();
        }
        Ok(id)
    }

    fn connect(&mut self, endpoint: &str, kind: SocketKind, send_high_water_mark: usize) -> anyhow::Result<SocketId> {
        self.check_alive()?;
        let (_, port) = parse_endpoint(endpoint)?;

        let mut exchange = self.switchboard.lock();
        let id = exchange.new_socket_id();
        exchange.sockets.insert(id, LocalSocket {
            kind,
            identity: Bytes::from(format!("inproc-{}", id.0)),
            target_port: Some(port),
            send_high_water_mark,
            inbox: VecDeque::new(),
            backlog: VecDeque::new(),
        });
        self.owned.push(id);
        Ok(id)
    }

    fn send_multipart(&mut self, socket: SocketId, mut parts: Vec<Bytes>) -> anyhow::Result<SendOutcome> {
        let mut exchange = self.switchboard.lock();

        let (kind, identity, target_port, send_high_water_mark, backlog_len) = {
            let s = exchange.sockets.get(&socket)
                .ok_or_else(|| anyhow!("unknown or closed {:?}", socket))?;
            (s.kind, s.identity.clone(), s.target_port, s.send_high_water_mark, s.backlog.len())
        };
        let Some(target_port) = target_port else {
            // bound sockets are receive-only in this protocol
            return Ok(SendOutcome::Unroutable);
        };
        let target = exchange.bound_ports.get(&target_port).copied();

        let outcome = match kind {
            SocketKind::Dealer => match target {
                Some(target) if backlog_len == 0 => {
                    if let Some(target_socket) = exchange.sockets.get_mut(&target) {
                        target_socket.inbox.push_back(with_identity(&identity, parts));
                    }
                    SendOutcome::Sent
                }
                _ => {
                    if backlog_len >= send_high_water_mark {
                        return Ok(SendOutcome::WouldBlock);
                    }
                    if let Some(s) = exchange.sockets.get_mut(&socket) {
                        s.backlog.push_back(parts);
                    }
                    exchange.flush_backlogs(&[socket]);
                    SendOutcome::Sent
                }
            },
            SocketKind::Router => {
                if parts.is_empty() {
                    bail!("router message without an identity part");
                }
                let routing_identity = parts.remove(0);
                let target_socket = match target {
                    Some(t) => exchange.sockets.get_mut(&t),
                    None => None,
                };
                match target_socket {
                    Some(target_socket) if target_socket.identity == routing_identity => {
                        target_socket.inbox.push_back(with_identity(&identity, parts));
                        SendOutcome::Sent
                    }
                    _ => SendOutcome::Unroutable,
                }
            }
        };

        if outcome == SendOutcome::Sent {
            self.switchboard.shared.activity.notify_all();
        }
        Ok(outcome)
    }

    fn recv_multipart(&mut self, socket: SocketId) -> anyhow::Result<Option<Vec<Bytes>>> {
        let mut exchange = self.switchboard.lock();
        let s = exchange.sockets.get_mut(&socket)
            .ok_or_else(|| anyhow!("unknown or closed {:?}", socket))?;
        Ok(s.inbox.pop_front())
    }

    fn poll(&mut self, sockets: &[SocketId], timeout: Duration) -> anyhow::Result<Vec<SocketId>> {
        let deadline = Instant::now() + timeout;

        let mut exchange = self.switchboard.lock();
        if exchange.flush_backlogs(&self.owned) {
            self.switchboard.shared.activity.notify_all();
        }

        loop {
            let ready = exchange.ready(sockets);
            let now = Instant::now();
            if !ready.is_empty() || now >= deadline {
                return Ok(ready);
            }

            exchange = self.switchboard.shared.activity
                .wait_timeout(exchange, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
            exchange.flush_backlogs(&self.owned);
        }
    }

    fn close(&mut self, socket: SocketId) {
        let mut exchange = self.switchboard.lock();
        match exchange.sockets.remove(&socket) {
            Some(s) => {
                if s.target_port.is_none() {
                    exchange.bound_ports.retain(|_, id| *id != socket);
                }
                if !s.backlog.is_empty() {
                    debug!("discarding {} unsent messages of {:?}", s.backlog.len(), socket);
                }
            }
            None => debug!("closing unknown {:?} - ignoring", socket),
        }
        self.owned.retain(|id| *id != socket);
    }

    fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        for socket in self.owned.clone() {
            self.close(socket);
        }
        self.terminated = true;
    }
}

impl Drop for InprocTransport {
    fn drop(&mut self) {
        self.terminate();
    }
}
