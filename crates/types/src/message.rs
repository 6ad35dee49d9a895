//! Consensus message envelope and payloads.
//!
//! Every message travels as `RLP({code, msg, address, signature,
//! committed_seal})`; the signature covers `Keccak256(RLP(code, msg,
//! address))`. Commit messages additionally carry a committed seal over the
//! commit digest of the proposal hash.

use crate::crypto;
use crate::error::{BftError, BftResult};
use crate::header::Block;
use crate::view::View;
use alloy_primitives::{keccak256, Address, Bytes, B256};
use alloy_rlp::{Decodable, Encodable, RlpDecodable, RlpEncodable};
use std::fmt;

/// Capability name announced to the P2P layer.
pub const PROTOCOL_NAME: &str = "bft";

/// Wire codes of the four consensus messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum MessageCode {
    Preprepare = 0,
    Prepare = 1,
    Commit = 2,
    RoundChange = 3,
}

impl MessageCode {
    /// Replay priority within one view: earlier phases drain first.
    pub fn priority(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageCode {
    type Error = BftError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::Preprepare),
            1 => Ok(Self::Prepare),
            2 => Ok(Self::Commit),
            3 => Ok(Self::RoundChange),
            other => Err(BftError::Decode(format!("unknown message code {other}"))),
        }
    }
}

impl fmt::Display for MessageCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Preprepare => "preprepare",
            Self::Prepare => "prepare",
            Self::Commit => "commit",
            Self::RoundChange => "round-change",
        };
        f.write_str(name)
    }
}

impl Encodable for MessageCode {
    fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        (*self as u8).encode(out);
    }

    fn length(&self) -> usize {
        (*self as u8).length()
    }
}

impl Decodable for MessageCode {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let code = u8::decode(buf)?;
        MessageCode::try_from(code)
            .map_err(|_| alloy_rlp::Error::Custom("unknown message code"))
    }
}

/// Signed consensus message envelope.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct Message {
    pub code: MessageCode,
    /// RLP-encoded payload; a [`Preprepare`] or a [`Subject`].
    pub msg: Bytes,
    /// Claimed sender, checked against the recovered signer.
    pub address: Address,
    pub signature: Bytes,
    /// Populated on commit messages only.
    pub committed_seal: Bytes,
}

#[derive(RlpEncodable)]
struct UnsignedMessage {
    code: MessageCode,
    msg: Bytes,
    address: Address,
}

impl Message {
    pub fn new(code: MessageCode, msg: Bytes, address: Address) -> Self {
        Self {
            code,
            msg,
            address,
            signature: Bytes::new(),
            committed_seal: Bytes::new(),
        }
    }

    /// Digest covered by the envelope signature.
    pub fn sign_hash(&self) -> B256 {
        let unsigned = UnsignedMessage {
            code: self.code,
            msg: self.msg.clone(),
            address: self.address,
        };
        keccak256(alloy_rlp::encode(&unsigned))
    }

    /// Recover the envelope signer.
    pub fn recover(&self) -> BftResult<Address> {
        crypto::recover_signer(self.sign_hash(), &self.signature)
    }

    /// Serialize for the wire.
    pub fn encoded(&self) -> Bytes {
        alloy_rlp::encode(self).into()
    }

    /// Parse a wire payload.
    pub fn decode_bytes(payload: &[u8]) -> BftResult<Self> {
        Ok(Self::decode(&mut &payload[..])?)
    }

    /// Decode the inner payload.
    pub fn payload<T: Decodable>(&self) -> BftResult<T> {
        Ok(T::decode(&mut self.msg.as_ref())?)
    }
}

/// Payload of a preprepare: the view and the full proposal.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct Preprepare {
    pub view: View,
    pub proposal: Block,
}

/// Payload of prepare, commit, and round-change messages.
///
/// Round-change subjects carry the target round in `view` and a zero digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct Subject {
    pub view: View,
    pub digest: B256,
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{view: {}, digest: {}}}", self.view, self.digest)
    }
}
