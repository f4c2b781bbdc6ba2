use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::gate::config::GateConfig;
use crate::gate::gate_core::{GateCore, GateStats};
use crate::gate::handler::RpcHandler;
use crate::gate::{Gateway, MessageSender, SendStatus};
use crate::transport::{SendOutcome, SocketKind, Transport};


/// The sending half of a [HubGate]: connections are dealer sockets, opened on the first send to
///  a peer and kept until the gate is destroyed or the peer is disconnected explicitly.
pub struct HubSender<T: Transport> {
    core: GateCore<T>,
    high_water_mark: usize,
}

impl<T: Transport> MessageSender for HubSender<T> {
    fn self_addr(&self) -> &str {
        self.core.connect_addr()
    }

    /// Best effort: if no connection can be opened or the transport refuses the message, it is
    ///  dropped and the status says so.
    fn send(&mut self, to: &str, payload: Bytes) -> anyhow::Result<SendStatus> {
        self.core.sockets().check_alive()?;

        let socket = match self.core.sockets_mut().open_connection(to, SocketKind::Dealer, self.high_water_mark) {
            Ok((socket, _)) => socket,
            Err(e) => {
                warn!(to, "cannot connect - dropping message: {}", e);
                self.core.record_send_failure();
                return Ok(SendStatus::Unreachable);
            }
        };

        match self.core.send_rpc(socket, None, payload) {
            Ok(SendOutcome::Sent) => Ok(SendStatus::Sent),
            Ok(SendOutcome::WouldBlock) => {
                debug!(to, "send buffer full - dropping message");
                self.core.record_send_failure();
                Ok(SendStatus::Dropped)
            }
            Ok(SendOutcome::Unroutable) => {
                debug!(to, "peer unroutable - dropping message");
                self.core.record_send_failure();
                Ok(SendStatus::Unreachable)
            }
            Err(e) => {
                warn!(to, "error sending - dropping message: {}", e);
                Ok(SendStatus::Unreachable)
            }
        }
    }
}


/// Asymmetric gate: everything arrives through the bound socket, everything leaves through
///  per-peer dealer connections. A peer that wants to receive runs a gate of its own, so no
///  explicit connect is needed - sending to an address is enough.
///
/// Messages arriving on the dealer connections are protocol internal and discarded.
pub struct HubGate<T: Transport, H: RpcHandler> {
    sender: HubSender<T>,
    handler: H,
}

impl<T: Transport, H: RpcHandler> HubGate<T, H> {
    pub fn bind(config: GateConfig, transport: T, handler: H) -> anyhow::Result<HubGate<T, H>> {
        Ok(HubGate {
            sender: HubSender {
                core: GateCore::bind(&config, transport)?,
                high_water_mark: config.high_water_mark,
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
}

impl<T: Transport, H: RpcHandler> MessageSender for HubGate<T, H> {
    fn self_addr(&self) -> &str {
        self.sender.self_addr()
    }

    fn send(&mut self, to: &str, payload: Bytes) -> anyhow::Result<SendStatus> {
        self.sender.send(to, payload)
    }
}

impl<T: Transport, H: RpcHandler> Gateway for HubGate<T, H> {
    /// Opening connections is optional for this topology, [MessageSender::send] does it on demand
    fn connect(&mut self, peer_addr: &str) -> anyhow::Result<bool> {
        let high_water_mark = self.sender.high_water_mark;
        let (_, created) = self.sender.core.sockets_mut().open_connection(peer_addr, SocketKind::Dealer, high_water_mark)?;
        Ok(created)
    }

    fn disconnect(&mut self, peer_addr: &str) -> anyhow::Result<bool> {
        self.sender.core.sockets_mut().close_connection(peer_addr)
    }

    fn has_connection(&self, peer_addr: &str) -> bool {
        self.sender.core.sockets().connections().contains(peer_addr)
    }

    fn connection_count(&self) -> usize {
        self.sender.core.sockets().connections().len()
    }

    fn poll(&mut self, timeout: Duration) -> anyhow::Result<usize> {
        let frames = self.sender.core.poll_frames(timeout)?;
        let num_dispatched = frames.len();
        for frame in frames {
            self.handler.on_rpc(&mut self.sender, &frame.sender_addr, frame.payload);
        }
        Ok(num_dispatched)
    }

    fn set_max_per_poll(&mut self, max_per_poll: usize) -> anyhow::Result<()> {
        self.sender.core.set_max_per_poll(max_per_poll)
    }

    fn stats(&self) -> GateStats {
        self.sender.core.stats()
    }

    fn destroy(&mut self) {
        self.sender.core.destroy();
    }

    fn is_destroyed(&self) -> bool {
        self.sender.core.sockets().is_destroyed()
    }
}

impl<T: Transport, H: RpcHandler> Drop for HubGate<T, H> {
    fn drop(&mut self) {
        self.destroy();
    }
}


#[cfg(test)]
mod test {
    use std::time::{Duration, Instant};

    use bytes::Bytes;

    use crate::gate::config::GateConfig;
    use crate::gate::handler::{EchoHandler, RecordingHandler};
    use crate::gate::{GateDestroyed, Gateway, MessageSender, SendStatus};
    use crate::transport::inproc::{InprocTransport, Switchboard};
    use super::HubGate;

    const BASE_PORT: u16 = 10000;

    type Recorder = HubGate<InprocTransport, RecordingHandler>;

    fn recorder(switchboard: &Switchboard, port: u16) -> Recorder {
        HubGate::bind(GateConfig::new("127.0.0.1", port), switchboard.transport(), RecordingHandler::new()).unwrap()
    }

    fn recorders(switchboard: &Switchboard, n: u16) -> Vec<Recorder> {
        (0..n)
            .map(|i| recorder(switchboard, BASE_PORT + i))
            .collect()
    }

    fn poll_n_times(gates: &mut [&mut dyn Gateway], n: usize) {
        for _ in 0..n {
            for gate in gates.iter_mut() {
                gate.poll(Duration::from_millis(1)).unwrap();
            }
        }
    }

    fn poll_recorders(gates: &mut [Recorder], n: usize) {
        for _ in 0..n {
            for gate in gates.iter_mut() {
                gate.poll(Duration::from_millis(1)).unwrap();
            }
        }
    }

    fn hello() -> Bytes {
        Bytes::from_static(b"hello world")
    }

    #[test]
    fn test_echo_single_send() {
        let switchboard = Switchboard::new();
        let mut a = recorder(&switchboard, BASE_PORT);
        let mut b = HubGate::bind(GateConfig::new("127.0.0.1", BASE_PORT + 1), switchboard.transport(), EchoHandler::new()).unwrap();

        let b_addr = b.self_addr().to_string();
        for _ in 0..3 {
            assert_eq!(a.send(&b_addr, hello()).unwrap(), SendStatus::Sent);
        }

        poll_n_times(&mut [&mut a as &mut dyn Gateway, &mut b], 10);

        assert_eq!(b.handler().recorder().len(), 3);
        assert_eq!(a.handler().len(), 3);
        for (from, payload) in a.handler().received() {
            assert_eq!(from, &b_addr);
            assert_eq!(payload, &hello());
        }
        for (from, _) in b.handler().recorder().received() {
            assert_eq!(from, a.self_addr());
        }
    }

    #[test]
    fn test_echo_double_side_send() {
        let switchboard = Switchboard::new();
        let mut a = recorder(&switchboard, BASE_PORT);
        let mut b = HubGate::bind(GateConfig::new("127.0.0.1", BASE_PORT + 1), switchboard.transport(), EchoHandler::new()).unwrap();

        let a_addr = a.self_addr().to_string();
        let b_addr = b.self_addr().to_string();
        for _ in 0..3 {
            a.send(&b_addr, hello()).unwrap();
            b.send(&a_addr, hello()).unwrap();
        }

        poll_n_times(&mut [&mut a as &mut dyn Gateway, &mut b], 10);

        assert_eq!(a.handler().len(), 6);
        assert_eq!(b.handler().recorder().len(), 3);
    }

    #[test]
    fn test_many_to_one() {
        let switchboard = Switchboard::new();
        let mut senders = recorders(&switchboard, 10);
        let mut receiver = HubGate::bind(GateConfig::new("127.0.0.1", BASE_PORT + 100), switchboard.transport(), EchoHandler::new()).unwrap();

        let receiver_addr = receiver.self_addr().to_string();
        for _ in 0..3 {
            for sender in senders.iter_mut() {
                sender.send(&receiver_addr, hello()).unwrap();
            }
        }

        for _ in 0..10 {
            receiver.poll(Duration::from_millis(1)).unwrap();
            poll_recorders(&mut senders, 1);
        }

        assert_eq!(receiver.handler().recorder().len(), 30);
        for sender in &senders {
            assert_eq!(sender.handler().len(), 3);
        }
    }

    #[test]
    fn test_fan_in_without_echo() {
        let switchboard = Switchboard::new();
        let mut gates = recorders(&switchboard, 6);
        let receiver_addr = gates[5].self_addr().to_string();

        for _ in 0..4 {
            for sender in gates[..5].iter_mut() {
                sender.send(&receiver_addr, hello()).unwrap();
            }
        }
        poll_recorders(&mut gates, 10);

        assert_eq!(gates[5].handler().len(), 20);
        for sender in &gates[..5] {
            assert!(sender.handler().is_empty());
        }
    }

    #[test]
    fn test_ring_send() {
        let switchboard = Switchboard::new();
        let mut gates = recorders(&switchboard, 10);
        let addrs: Vec<String> = gates.iter().map(|g| g.self_addr().to_string()).collect();

        for _ in 0..3 {
            for (i, gate) in gates.iter_mut().enumerate() {
                gate.send(&addrs[(i + 1) % addrs.len()], hello()).unwrap();
            }
        }
        poll_recorders(&mut gates, 10);

        for (i, gate) in gates.iter().enumerate() {
            assert_eq!(gate.handler().len(), 3);
            assert!(gate.handler().received().iter().all(|(from, _)| from == &addrs[(i + addrs.len() - 1) % addrs.len()]));
        }
    }

    #[test]
    fn test_star_send() {
        let switchboard = Switchboard::new();
        let mut gates = recorders(&switchboard, 10);
        let addrs: Vec<String> = gates.iter().map(|g| g.self_addr().to_string()).collect();

        for _ in 0..3 {
            for (i, gate) in gates.iter_mut().enumerate() {
                for (j, addr) in addrs.iter().enumerate() {
                    if i != j {
                        gate.send(addr, hello()).unwrap();
                    }
                }
            }
        }
        poll_recorders(&mut gates, 10);

        for gate in &gates {
            assert_eq!(gate.handler().len(), 27);
            assert_eq!(gate.connection_count(), 9);
        }
    }

    #[test]
    fn test_bounded_drain_per_poll() {
        let switchboard = Switchboard::new();
        let mut sender = recorder(&switchboard, BASE_PORT);
        let mut receiver = HubGate::bind(GateConfig::new("127.0.0.1", BASE_PORT + 1).with_max_per_poll(2), switchboard.transport(), RecordingHandler::new()).unwrap();

        let receiver_addr = receiver.self_addr().to_string();
        for i in 0..5u8 {
            sender.send(&receiver_addr, Bytes::from(vec![i])).unwrap();
        }

        assert_eq!(receiver.poll(Duration::ZERO).unwrap(), 2);
        assert_eq!(receiver.poll(Duration::ZERO).unwrap(), 2);
        assert_eq!(receiver.poll(Duration::ZERO).unwrap(), 1);
        assert_eq!(receiver.poll(Duration::ZERO).unwrap(), 0);

        let payloads: Vec<u8> = receiver.handler().received().iter().map(|(_, p)| p[0]).collect();
        assert_eq!(payloads, vec![0, 1, 2, 3, 4]);

        receiver.set_max_per_poll(10).unwrap();
        for i in 0..5u8 {
            sender.send(&receiver_addr, Bytes::from(vec![i])).unwrap();
        }
        assert_eq!(receiver.poll(Duration::ZERO).unwrap(), 5);
        assert!(receiver.set_max_per_poll(0).is_err());
    }

    #[test]
    fn test_receiver_bound_after_send() {
        let switchboard = Switchboard::new();
        let mut a = recorder(&switchboard, BASE_PORT);
        assert_eq!(a.send(&format!("tcp://127.0.0.1:{}", BASE_PORT + 1), hello()).unwrap(), SendStatus::Sent);

        // only the receiver polls
        let mut b = recorder(&switchboard, BASE_PORT + 1);
        for _ in 0..10 {
            b.poll(Duration::from_millis(1)).unwrap();
        }
        assert_eq!(b.handler().len(), 1);
        assert_eq!(b.handler().received()[0].0, a.self_addr());
    }

    #[test]
    fn test_full_send_buffer_is_counted_as_failure() {
        let switchboard = Switchboard::new();
        let mut a = HubGate::bind(GateConfig::new("127.0.0.1", BASE_PORT).with_high_water_mark(1), switchboard.transport(), RecordingHandler::new()).unwrap();
        let unbound = format!("tcp://127.0.0.1:{}", BASE_PORT + 1);

        assert_eq!(a.send(&unbound, hello()).unwrap(), SendStatus::Sent);
        assert_eq!(a.send(&unbound, hello()).unwrap(), SendStatus::Dropped);

        let stats = a.stats();
        assert_eq!(stats.frames_sent, 1);
        assert_eq!(stats.send_failures, 1);
    }

    #[test]
    fn test_accessors() {
        let switchboard = Switchboard::new();
        let mut a = recorder(&switchboard, BASE_PORT);
        let mut b = recorder(&switchboard, BASE_PORT + 1);
        assert_eq!(a.bind_addr(), "tcp://*:10000");
        assert_eq!(a.self_addr(), "tcp://127.0.0.1:10000");

        a.send(b.self_addr(), hello()).unwrap();
        b.poll(Duration::ZERO).unwrap();
        assert_eq!(b.handler_mut().take().len(), 1);
        assert!(b.handler().is_empty());
    }

    #[test]
    fn test_poll_waits_for_timeout_when_idle() {
        let switchboard = Switchboard::new();
        let mut gate = recorder(&switchboard, BASE_PORT);

        let start = Instant::now();
        assert_eq!(gate.poll(Duration::from_millis(15)).unwrap(), 0);
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_connections_are_created_lazily_and_once() {
        let switchboard = Switchboard::new();
        let mut a = recorder(&switchboard, BASE_PORT);
        let b = recorder(&switchboard, BASE_PORT + 1);
        let b_addr = b.self_addr().to_string();

        assert!(!a.has_connection(&b_addr));
        a.send(&b_addr, hello()).unwrap();
        a.send(&b_addr, hello()).unwrap();
        assert!(a.has_connection(&b_addr));
        assert_eq!(a.connection_count(), 1);

        assert!(!a.connect(&b_addr).unwrap());
        assert_eq!(a.connection_count(), 1);

        assert!(a.disconnect(&b_addr).unwrap());
        assert!(!a.disconnect(&b_addr).unwrap());
        assert_eq!(a.connection_count(), 0);

        assert!(a.connect(&b_addr).unwrap());
        assert_eq!(a.connection_count(), 1);
    }

    #[test]
    fn test_send_to_malformed_address_is_dropped() {
        let switchboard = Switchboard::new();
        let mut a = recorder(&switchboard, BASE_PORT);

        assert_eq!(a.send("not an address", hello()).unwrap(), SendStatus::Unreachable);
        assert_eq!(a.connection_count(), 0);
        assert_eq!(a.stats().send_failures, 1);
        assert!(a.connect("not an address").is_err());
    }

    #[test]
    fn test_bind_conflict() {
        let switchboard = Switchboard::new();
        let _a = recorder(&switchboard, BASE_PORT);
        let result = HubGate::bind(GateConfig::new("127.0.0.1", BASE_PORT), switchboard.transport(), RecordingHandler::new());
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_config() {
        let switchboard = Switchboard::new();
        let result = HubGate::bind(GateConfig::new("127.0.0.1", BASE_PORT).with_max_per_poll(0), switchboard.transport(), RecordingHandler::new());
        assert!(result.is_err());
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let switchboard = Switchboard::new();
        let mut a = recorder(&switchboard, BASE_PORT);
        let b = recorder(&switchboard, BASE_PORT + 1);
        a.send(b.self_addr(), hello()).unwrap();

        a.destroy();
        assert!(a.is_destroyed());
        assert_eq!(a.connection_count(), 0);
        let stats = a.stats();

        a.destroy();
        assert!(a.is_destroyed());
        assert_eq!(a.connection_count(), 0);
        assert_eq!(a.stats(), stats);

        // the port is free again
        let _c = recorder(&switchboard, BASE_PORT);
    }

    #[test]
    fn test_operations_after_destroy_fail() {
        let switchboard = Switchboard::new();
        let mut a = recorder(&switchboard, BASE_PORT);
        let b = recorder(&switchboard, BASE_PORT + 1);
        let b_addr = b.self_addr().to_string();
        a.destroy();

        let is_destroyed_error = |e: anyhow::Error| e.downcast_ref::<GateDestroyed>().is_some();
        assert!(is_destroyed_error(a.send(&b_addr, hello()).unwrap_err()));
        assert!(is_destroyed_error(a.poll(Duration::ZERO).unwrap_err()));
        assert!(is_destroyed_error(a.connect(&b_addr).unwrap_err()));
        assert!(is_destroyed_error(a.disconnect(&b_addr).unwrap_err()));
        assert!(is_destroyed_error(a.set_max_per_poll(5).unwrap_err()));
        assert!(!a.has_connection(&b_addr));
    }

    #[test]
    fn test_closure_handler() {
        let switchboard = Switchboard::new();
        let mut total_len = 0usize;
        {
            let handler = |_: &mut dyn MessageSender, _: &str, payload: Bytes| total_len += payload.len();
            let mut receiver = HubGate::bind(GateConfig::new("127.0.0.1", BASE_PORT), switchboard.transport(), handler).unwrap();
            let mut sender = recorder(&switchboard, BASE_PORT + 1);

            let receiver_addr = receiver.self_addr().to_string();
            sender.send(&receiver_addr, Bytes::from_static(b"abc")).unwrap();
            sender.send(&receiver_addr, Bytes::from_static(b"defg")).unwrap();
            assert_eq!(receiver.poll(Duration::ZERO).unwrap(), 2);
        }
        assert_eq!(total_len, 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_ring() {
        let switchboard = Switchboard::new();
        let gates = recorders(&switchboard, 6);
        let addrs: Vec<String> = gates.iter().map(|g| g.self_addr().to_string()).collect();

        let mut tasks = Vec::new();
        for (i, mut gate) in gates.into_iter().enumerate() {
            let target = addrs[(i + 1) % addrs.len()].clone();
            tasks.push(tokio::task::spawn_blocking(move || {
                for _ in 0..3 {
                    gate.send(&target, hello()).unwrap();
                    std::thread::sleep(Duration::from_millis(2));
                    gate.poll(Duration::ZERO).unwrap();
                }
                let deadline = Instant::now() + Duration::from_secs(5);
                while gate.handler().len() < 3 && Instant::now() < deadline {
                    gate.poll(Duration::from_millis(5)).unwrap();
                }
                gate.handler().len()
            }));
        }

        for task in tasks {
            assert_eq!(task.await.unwrap(), 3);
        }
    }
}
