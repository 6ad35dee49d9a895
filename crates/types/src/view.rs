//! Consensus views.

use alloy_rlp::{RlpDecodable, RlpEncodable};
use std::cmp::Ordering;
use std::fmt;

/// A `(round, sequence)` pair identifying one consensus instance.
///
/// `sequence` is the height of the proposal; `round` restarts at 0 for every
/// new sequence. Ordering is lexicographic with `sequence` first, so a view
/// at a later height always compares greater regardless of round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, RlpEncodable, RlpDecodable)]
pub struct View {
    pub round: u64,
    pub sequence: u64,
}

impl View {
    pub fn new(sequence: u64, round: u64) -> Self {
        Self { round, sequence }
    }
}

impl Ord for View {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sequence
            .cmp(&other.sequence)
            .then(self.round.cmp(&other.round))
    }
}

impl PartialOrd for View {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{sequence: {}, round: {}}}", self.sequence, self.round)
    }
}
