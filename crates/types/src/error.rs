//! Error taxonomy for the consensus engine.

use thiserror::Error;

/// Result type for consensus operations
pub type BftResult<T> = Result<T, BftError>;

/// Errors reported across the engine boundary.
///
/// The taxonomy is closed: protocol violations are fatal for the offending
/// message only, transient errors may be retried once the chain advances,
/// and lifecycle errors leave the engine state unchanged.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BftError {
    /// The engine was started while already running
    #[error("started engine")]
    EngineStarted,

    /// The engine was used while stopped
    #[error("stopped engine")]
    EngineStopped,

    /// A header was requested for a block unknown to the local chain
    #[error("unknown block")]
    UnknownBlock,

    /// The parent of the block being verified is not available
    #[error("unknown ancestor")]
    UnknownAncestor,

    /// The block's timestamp is ahead of the local clock
    #[error("block in the future")]
    FutureBlock,

    /// The consensus extra-data blob does not decode
    #[error("invalid extra data format")]
    InvalidExtraDataFormat,

    /// The mix digest is not the BFT sentinel
    #[error("invalid BFT mix digest")]
    InvalidMixDigest,

    /// The nonce is neither zero nor one of the two vote values
    #[error("invalid nonce")]
    InvalidNonce,

    /// The block carries a non-empty uncle list
    #[error("non empty uncle hash")]
    InvalidUncleHash,

    /// The difficulty is not 1
    #[error("invalid difficulty")]
    InvalidDifficulty,

    /// The timestamp is below parent time + block period
    #[error("invalid timestamp")]
    InvalidTimestamp,

    /// The signer is not a member of the authorized validator set
    #[error("unauthorized address")]
    Unauthorized,

    /// A signature failed to verify or recover
    #[error("invalid signature")]
    InvalidSignature,

    /// A seal is not a whole number of 65-byte signatures
    #[error("invalid signature length")]
    InvalidSignatureLength,

    /// A sealed header carries no committed seals
    #[error("zero committed seals")]
    EmptyCommittedSeals,

    /// A committed seal is duplicated, unauthorized, or below quorum
    #[error("invalid committed seals")]
    InvalidCommittedSeals,

    /// A message payload failed to decode
    #[error("failed to decode message: {0}")]
    Decode(String),

    /// The validator source rejected the query
    #[error("validator source: {0}")]
    ValidatorSource(String),
}

impl BftError {
    /// Transient errors may be retried after the chain advances.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::FutureBlock | Self::UnknownAncestor)
    }
}

impl From<alloy_rlp::Error> for BftError {
    fn from(err: alloy_rlp::Error) -> Self {
        Self::Decode(err.to_string())
    }
}
