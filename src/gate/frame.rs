use std::fmt::{Debug, Formatter};

use anyhow::{anyhow, bail};
use bytes::Bytes;


/// The kind of a message, transmitted as a short ASCII tag. Only [ControlType::Rpc] carries
///  application payload; everything else is reserved and ignored on receipt.
#[derive(Clone, Eq, PartialEq)]
pub enum ControlType {
    Rpc,
    Reserved(Bytes),
}

impl ControlType {
    pub const RPC_TAG: &'static [u8] = b"RPC";

    pub fn from_tag(tag: Bytes) -> ControlType {
        if tag.as_ref() == Self::RPC_TAG {
            ControlType::Rpc
        }
        else {
            ControlType::Reserved(tag)
        }
    }

    pub fn tag(&self) -> Bytes {
        match self {
            ControlType::Rpc => Bytes::from_static(Self::RPC_TAG),
            ControlType::Reserved(tag) => tag.clone(),
        }
    }
}

impl Debug for ControlType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlType::Rpc => write!(f, "RPC"),
            ControlType::Reserved(tag) => write!(f, "Reserved({:?})", String::from_utf8_lossy(tag)),
        }
    }
}


/// A message as it travels between gates. On the wire it is a multi-part message:
///
/// ```ascii
/// 0: routing identity (added and consumed by the transport's router sockets)
/// 1: sender address (UTF-8), i.e. the sending gate's connect endpoint
/// 2: control type tag
/// 3: payload (opaque)
/// ```
///
/// Parts beyond these four are ignored.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Frame {
    pub sender_addr: String,
    pub control: ControlType,
    pub payload: Bytes,
}

impl Frame {
    pub const NUM_PARTS_WITH_IDENTITY: usize = 4;

    pub fn rpc(sender_addr: &str, payload: Bytes) -> Frame {
        Frame {
            sender_addr: sender_addr.to_string(),
            control: ControlType::Rpc,
            payload,
        }
    }

    /// The parts to hand to the transport, without routing identity
    pub fn to_parts(&self) -> Vec<Bytes> {
        vec![
            Bytes::copy_from_slice(self.sender_addr.as_bytes()),
            self.control.tag(),
            self.payload.clone(),
        ]
    }

    /// Reads a frame from the parts received on a router socket, i.e. including the routing
    ///  identity.
    pub fn try_parse(parts: Vec<Bytes>) -> anyhow::Result<Frame> {
        if parts.len() < Self::NUM_PARTS_WITH_IDENTITY {
            bail!("expected at least {} message parts, got {}", Self::NUM_PARTS_WITH_IDENTITY, parts.len());
        }

        let mut parts = parts.into_iter().skip(1);
        let sender_addr = parts.next().unwrap_or_default();
        let control = parts.next().unwrap_or_default();
        let payload = parts.next().unwrap_or_default();

        let sender_addr = String::from_utf8(sender_addr.to_vec())
            .map_err(|e| anyhow!("sender address is not valid UTF-8: {}", e))?;

        Ok(Frame {
            sender_addr,
            control: ControlType::from_tag(control),
            payload,
        })
    }
}
