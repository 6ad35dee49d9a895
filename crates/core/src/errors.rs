//! Internal errors of the consensus task.
//!
//! None of these escape the engine: processing failures for a single
//! message are logged with its view and sender, then discarded.

use ibft_types::BftError;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// The message targets a view we have not reached; park it.
    #[error("future message")]
    FutureMessage,

    /// The message targets a view already decided or abandoned.
    #[error("old message")]
    OldMessage,

    /// Valid but irrelevant in the current state.
    #[error("ignored message")]
    Ignored,

    /// The subject does not match the current round state.
    #[error("inconsistent subject")]
    InconsistentSubject,

    /// A preprepare arrived from someone other than the speaker.
    #[error("message not from the speaker")]
    NotFromSpeaker,

    /// A protocol violation from the shared taxonomy.
    #[error(transparent)]
    Protocol(#[from] BftError),
}
