//! Boundary traits toward the surrounding node.
//!
//! The chain, the P2P layer, and the on-chain validator contract are
//! external collaborators; the engine sees them only through these
//! interfaces.

use crate::header::{Block, Header};
use alloy_primitives::{Address, Bytes, B256};
use std::collections::HashMap;
use std::sync::Arc;

/// Read access to the local chain.
pub trait ChainReader: Send + Sync {
    /// The current head block.
    fn current_block(&self) -> Block;

    /// Header by hash and number.
    fn header(&self, hash: B256, number: u64) -> Option<Header>;

    /// Canonical header by number.
    fn header_by_number(&self, number: u64) -> Option<Header>;

    /// Whether a proposal hash was previously rejected by block processing.
    fn has_bad_block(&self, _hash: B256) -> bool {
        false
    }
}

/// A connected peer able to receive consensus messages.
pub trait Peer: Send + Sync {
    fn id(&self) -> String;

    /// Send one protocol message. Errors are the P2P layer's business; the
    /// engine treats a failed send like a lost packet.
    fn send(&self, code: u8, payload: Bytes) -> anyhow::Result<()>;
}

/// Handle into the P2P layer.
pub trait Broadcaster: Send + Sync {
    /// Hand a finalized block to the fetcher for chain insertion.
    fn enqueue(&self, id: &str, block: Block);

    /// Look up currently-connected peers among the given validators.
    fn find_peers(&self, targets: &[Address]) -> HashMap<Address, Arc<dyn Peer>>;
}

/// Ordered validator list for a header, e.g. backed by the on-chain
/// election contract. Implementations may run EVM calls; the engine only
/// consumes the resulting address list.
pub trait ValidatorSource: Send + Sync {
    fn validators_at(&self, header: &Header) -> anyhow::Result<Vec<Address>>;
}
