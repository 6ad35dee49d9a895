//! Block headers and blocks.

use crate::extra;
use alloy_primitives::{b256, keccak256, Address, Bytes, B256, B64, U256};
use alloy_rlp::{RlpDecodable, RlpEncodable};
use std::sync::LazyLock;

/// Mix digest sentinel carried by every BFT-sealed header.
pub static BFT_MIX_DIGEST: LazyLock<B256> = LazyLock::new(|| keccak256(b"BFT"));

/// Keccak256(RLP([])), the hash of an empty uncle list.
pub const EMPTY_UNCLE_HASH: B256 =
    b256!("1dcc4de8dec75d7aab85b567b6ccd41ad312451b948a7413f0a142fd40d49347");

/// Headers are sealed with the zero nonce; votes reuse the field.
pub const NONCE_EMPTY: B64 = B64::ZERO;
/// Magic nonce proposing to authorize a new validator.
pub const NONCE_AUTH_VOTE: B64 = B64::new([0xff; 8]);
/// Magic nonce proposing to drop a validator. Identical to the empty nonce.
pub const NONCE_DROP_VOTE: B64 = B64::ZERO;

/// Fixed difficulty of every BFT block.
pub fn bft_difficulty() -> U256 {
    U256::from(1)
}

/// An account-chain block header.
///
/// The consensus certificate lives in `extra`: a 32-byte vanity prefix
/// followed by the RLP of [`extra::BftExtra`].
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct Header {
    pub parent_hash: B256,
    pub uncle_hash: B256,
    pub coinbase: Address,
    pub state_root: B256,
    pub tx_root: B256,
    pub receipts_root: B256,
    pub difficulty: U256,
    pub number: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub timestamp: u64,
    pub extra: Bytes,
    pub mix_digest: B256,
    pub nonce: B64,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            parent_hash: B256::ZERO,
            uncle_hash: EMPTY_UNCLE_HASH,
            coinbase: Address::ZERO,
            state_root: B256::ZERO,
            tx_root: B256::ZERO,
            receipts_root: B256::ZERO,
            difficulty: bft_difficulty(),
            number: 0,
            gas_limit: 0,
            gas_used: 0,
            timestamp: 0,
            extra: Bytes::new(),
            mix_digest: *BFT_MIX_DIGEST,
            nonce: NONCE_EMPTY,
        }
    }
}

impl Header {
    /// Hash identifying this header.
    ///
    /// Committed seals are excluded so that sealing a finalized block does
    /// not change its identity; the proposer seal is included. Falls back to
    /// hashing the raw encoding when `extra` is not a BFT blob.
    pub fn hash(&self) -> B256 {
        match extra::filtered_header(self, true) {
            Ok(filtered) => keccak256(alloy_rlp::encode(&filtered)),
            Err(_) => keccak256(alloy_rlp::encode(self)),
        }
    }
}

/// A proposal: header plus opaque transaction payloads.
#[derive(Debug, Clone, PartialEq, Eq, Default, RlpEncodable, RlpDecodable)]
pub struct Block {
    pub header: Header,
    pub transactions: Vec<Bytes>,
}

impl Block {
    pub fn new(header: Header, transactions: Vec<Bytes>) -> Self {
        Self {
            header,
            transactions,
        }
    }

    /// The proposal identity.
    pub fn hash(&self) -> B256 {
        self.header.hash()
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    /// Rebuild the block around an updated header, keeping the body.
    pub fn with_header(self, header: Header) -> Self {
        Self {
            header,
            transactions: self.transactions,
        }
    }
}
