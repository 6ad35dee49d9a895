//! Per-round consensus state.

use crate::message_set::MessageSet;
use ibft_types::{Block, Preprepare, Subject, ValidatorSet, View, B256};

/// State of one `(sequence, round)` consensus instance.
///
/// Created on entering a round; replaced when the round changes or the
/// sequence advances. The locked hash and (for the former speaker) the
/// accepted preprepare survive round changes within a height.
#[derive(Debug)]
pub struct RoundState {
    round: u64,
    sequence: u64,
    /// Accepted proposal for this round, if any.
    pub preprepare: Option<Preprepare>,
    pub prepares: MessageSet,
    pub commits: MessageSet,
    locked_hash: Option<B256>,
    /// Local proposal waiting for its turn.
    pub pending_request: Option<Block>,
}

impl RoundState {
    pub fn new(
        view: View,
        validators: ValidatorSet,
        locked_hash: Option<B256>,
        preprepare: Option<Preprepare>,
        pending_request: Option<Block>,
    ) -> Self {
        Self {
            round: view.round,
            sequence: view.sequence,
            preprepare,
            prepares: MessageSet::new(view, validators.clone()),
            commits: MessageSet::new(view, validators),
            locked_hash,
            pending_request,
        }
    }

    pub fn view(&self) -> View {
        View::new(self.sequence, self.round)
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn proposal(&self) -> Option<&Block> {
        self.preprepare.as_ref().map(|p| &p.proposal)
    }

    /// Subject of the accepted proposal, if one was accepted.
    pub fn subject(&self) -> Option<Subject> {
        self.preprepare.as_ref().map(|p| Subject {
            view: self.view(),
            digest: p.proposal.hash(),
        })
    }

    /// Lock onto the accepted proposal.
    pub fn lock_hash(&mut self) {
        if let Some(preprepare) = &self.preprepare {
            self.locked_hash = Some(preprepare.proposal.hash());
        }
    }

    pub fn unlock_hash(&mut self) {
        self.locked_hash = None;
    }

    pub fn is_hash_locked(&self) -> bool {
        self.locked_hash.is_some()
    }

    pub fn locked_hash(&self) -> Option<B256> {
        self.locked_hash
    }
}
