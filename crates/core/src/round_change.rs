//! Round changes: vote tracking and the catch-up/advance protocol.

use crate::core::Core;
use crate::errors::CoreError;
use crate::message_set::MessageSet;
use ibft_types::{Message, MessageCode, Subject, ValidatorSet, View, B256};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Round-change messages grouped by target round.
///
/// Two thresholds matter: `F + 1` distinct senders at some round above ours
/// means the network has moved on (catch up to the smallest such round), and
/// a quorum at exactly the target round commits the round change.
#[derive(Debug)]
pub struct RoundChangeSet {
    validators: ValidatorSet,
    round_changes: BTreeMap<u64, MessageSet>,
}

impl RoundChangeSet {
    pub fn new(validators: ValidatorSet) -> Self {
        Self {
            validators,
            round_changes: BTreeMap::new(),
        }
    }

    /// Record a round-change vote. Returns the number of distinct senders
    /// at that round.
    pub fn add(&mut self, round: u64, message: Message) -> Result<usize, CoreError> {
        let set = self
            .round_changes
            .entry(round)
            .or_insert_with(|| MessageSet::new(View::new(0, round), self.validators.clone()));
        set.add(message)?;
        Ok(set.len())
    }

    /// Drop votes for rounds below `round` and any empty buckets.
    pub fn clear(&mut self, round: u64) {
        self.round_changes
            .retain(|&r, set| r >= round && !set.is_empty());
    }

    /// Number of distinct senders voting for exactly `round`.
    pub fn count(&self, round: u64) -> usize {
        self.round_changes.get(&round).map_or(0, MessageSet::len)
    }

    /// Smallest round strictly above `current` backed by at least
    /// `threshold` distinct senders.
    pub fn catchup_round(&self, threshold: usize, current: u64) -> Option<u64> {
        self.round_changes
            .range(current + 1..)
            .find(|(_, set)| set.len() >= threshold)
            .map(|(&round, _)| round)
    }
}

impl Core {
    pub(crate) fn send_next_round_change(&mut self) {
        let round = self.current.round() + 1;
        self.send_round_change(round);
    }

    /// Move to `round` in the waiting state and broadcast our round-change
    /// vote for it.
    pub(crate) fn send_round_change(&mut self, round: u64) {
        if self.current.round() >= round {
            warn!(
                target = round,
                current = self.current.round(),
                "refusing round change into the past"
            );
            return;
        }

        self.catch_up_round(View::new(self.current.sequence(), round));

        let subject = Subject {
            view: self.current_view(),
            digest: B256::ZERO,
        };
        debug!(view = %subject.view, "broadcasting round change");
        let message = Message::new(
            MessageCode::RoundChange,
            alloy_rlp::encode(subject).into(),
            self.backend.address(),
        );
        self.broadcast(message);
    }

    /// Adopt a higher round without entering it: transient proposal state
    /// is cleared, the lock survives, and the round timer restarts with the
    /// doubled duration for the new round.
    fn catch_up_round(&mut self, view: View) {
        self.waiting_for_round_change = true;
        self.update_round_state(view, true);
        self.new_round_timer();
    }

    pub(crate) fn handle_round_change(&mut self, message: &Message) -> Result<(), CoreError> {
        let subject: Subject = message.payload()?;
        self.check_message(MessageCode::RoundChange, subject.view)?;

        let target = subject.view.round;
        let count = self.round_change_set.add(target, message.clone())?;
        debug!(
            sender = %message.address,
            round = target,
            count,
            "accepted round change"
        );

        let current_round = self.current.round();
        let should_advance = self.waiting_for_round_change || target > current_round;

        if count >= self.validators.quorum() && should_advance {
            // A quorum wants this exact round: enter it.
            self.start_new_round(target);
        } else if should_advance {
            // F + 1 validators are already past us: catch up to the
            // smallest such round.
            let threshold = self.validators.f() + 1;
            if let Some(round) = self
                .round_change_set
                .catchup_round(threshold, current_round)
            {
                self.send_round_change(round);
            }
        }
        Ok(())
    }
}
