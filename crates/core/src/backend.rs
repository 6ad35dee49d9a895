//! Capability surface the state machine needs from its backend.

use ibft_types::{Address, Block, BftResult, Bytes, ValidatorSet, B256};

/// What the consensus task calls on the backend.
///
/// This is the narrow outbound half of the backend/core pair; the inbound
/// half is the event mux the core subscribes to. Passing the two handles at
/// construction keeps the ownership graph acyclic.
pub trait CoreBackend: Send + Sync {
    /// The local signer address.
    fn address(&self) -> Address;

    /// Validator set authoritative for proposals at `sequence`.
    fn validators(&self, sequence: u64) -> ValidatorSet;

    /// Send a finalized payload to every validator, including ourselves
    /// (loopback through the event mux).
    fn broadcast(&self, validators: &ValidatorSet, payload: Bytes);

    /// Sign a 32-byte digest with the node key.
    fn sign(&self, digest: B256) -> BftResult<Bytes>;

    /// Seal the proposal with the accumulated committed seals and hand it
    /// to the miner (if it is ours) or the chain fetcher (if not).
    fn commit(&self, proposal: Block, seals: Vec<Bytes>) -> BftResult<()>;

    /// Full header verification of an incoming proposal, minus the
    /// committed-seal check this round is about to produce.
    fn verify(&self, proposal: &Block) -> BftResult<()>;

    /// The chain head and the address that sealed it.
    fn last_proposal(&self) -> (Block, Address);

    /// Whether block processing previously rejected this hash.
    fn has_bad_block(&self, hash: B256) -> bool;
}
