use bytes::Bytes;
use tracing::warn;

use crate::gate::MessageSender;


/// Application logic for received RPC messages. A gate calls its handler once per message during
///  [crate::gate::Gateway::poll], passing its sending half so the handler can reply.
///
/// Handlers cannot fail - whatever goes wrong while handling a message is the handler's business.
pub trait RpcHandler {
    fn on_rpc(&mut self, gate: &mut dyn MessageSender, source_addr: &str, payload: Bytes);
}

impl<F> RpcHandler for F
where F: FnMut(&mut dyn MessageSender, &str, Bytes)
{
    fn on_rpc(&mut self, gate: &mut dyn MessageSender, source_addr: &str, payload: Bytes) {
        self(gate, source_addr, payload)
    }
}


/// Keeps every received message, in order of arrival
#[derive(Debug, Default)]
pub struct RecordingHandler {
    received: Vec<(String, Bytes)>,
}

impl RecordingHandler {
    pub fn new() -> RecordingHandler {
        RecordingHandler::default()
    }

    /// (sender address, payload) pairs
    pub fn received(&self) -> &[(String, Bytes)] {
        &self.received
    }

    pub fn len(&self) -> usize {
        self.received.len()
    }

    pub fn is_empty(&self) -> bool {
        self.received.is_empty()
    }

    /// returns received messages, clearing the internal buffer
    pub fn take(&mut self) -> Vec<(String, Bytes)> {
        std::mem::take(&mut self.received)
    }
}

impl RpcHandler for RecordingHandler {
    fn on_rpc(&mut self, _gate: &mut dyn MessageSender, source_addr: &str, payload: Bytes) {
        self.received.push((source_addr.to_string(), payload));
    }
}


/// Records every received message and sends its payload back to the sender
#[derive(Debug, Default)]
pub struct EchoHandler {
    recorder: RecordingHandler,
}

impl EchoHandler {
    pub fn new() -> EchoHandler {
        EchoHandler::default()
    }

    pub fn recorder(&self) -> &RecordingHandler {
        &self.recorder
    }
}

impl RpcHandler for EchoHandler {
    fn on_rpc(&mut self, gate: &mut dyn MessageSender, source_addr: &str, payload: Bytes) {
        self.recorder.on_rpc(gate, source_addr, payload.clone());

        match gate.send(source_addr, payload) {
            Ok(status) if status.is_accepted() => {}
            Ok(status) => warn!(to = source_addr, ?status, "echo was not sent"),
            Err(e) => warn!(to = source_addr, "error sending echo: {}", e),
        }
    }
}
