//! Validator sets and proposer selection.

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Rule for picking the proposer of a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProposerPolicy {
    /// Rotate through the set: successor of the last proposer, advanced by
    /// the round number.
    #[default]
    RoundRobin,
    /// Keep the last proposer, advanced only by round changes.
    Sticky,
}

/// Ordered, deduplicated set of authorized signers for one height.
///
/// Membership is fixed for the lifetime of a sequence; a new set is built
/// from the previous header when the height advances. Cloning snapshots the
/// set, which is how the committed-seal check consumes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorSet {
    validators: Vec<Address>,
    policy: ProposerPolicy,
    proposer: Address,
}

impl ValidatorSet {
    /// Build a set from an address list. Addresses are sorted and
    /// deduplicated; the initial proposer is the lowest address.
    pub fn new(mut addresses: Vec<Address>, policy: ProposerPolicy) -> Self {
        addresses.sort_unstable();
        addresses.dedup();
        let proposer = addresses.first().copied().unwrap_or(Address::ZERO);
        Self {
            validators: addresses,
            policy,
            proposer,
        }
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Byzantine fault bound `F = (N - 1) / 3`.
    pub fn f(&self) -> usize {
        (self.validators.len().saturating_sub(1)) / 3
    }

    /// Quorum `Q = ceil(2N / 3)`.
    pub fn quorum(&self) -> usize {
        (2 * self.validators.len() + 2) / 3
    }

    pub fn addresses(&self) -> &[Address] {
        &self.validators
    }

    pub fn get_by_index(&self, index: usize) -> Option<Address> {
        self.validators.get(index).copied()
    }

    /// Index of an address, if it is a member.
    pub fn get_by_address(&self, address: Address) -> Option<usize> {
        self.validators.binary_search(&address).ok()
    }

    pub fn contains(&self, address: Address) -> bool {
        self.get_by_address(address).is_some()
    }

    /// Remove a member. Returns whether it was present.
    pub fn remove(&mut self, address: Address) -> bool {
        match self.validators.binary_search(&address) {
            Ok(index) => {
                self.validators.remove(index);
                true
            }
            Err(_) => false,
        }
    }

    /// The proposer chosen by the last [`Self::calc_proposer`] call.
    pub fn proposer(&self) -> Address {
        self.proposer
    }

    pub fn is_proposer(&self, address: Address) -> bool {
        !self.is_empty() && self.proposer == address
    }

    /// Select the proposer for a round, given the proposer of the previous
    /// sequence (zero when unknown, e.g. at genesis).
    pub fn calc_proposer(&mut self, last_proposer: Address, round: u64) {
        if self.validators.is_empty() {
            return;
        }

        let offset = if last_proposer == Address::ZERO {
            round
        } else {
            let last = self.get_by_address(last_proposer).unwrap_or(0) as u64;
            match self.policy {
                ProposerPolicy::RoundRobin => last + round + 1,
                ProposerPolicy::Sticky => last + round,
            }
        };
        self.proposer = self.validators[(offset % self.validators.len() as u64) as usize];
    }
}

impl fmt::Display for ValidatorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, v) in self.validators.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addresses(n: u8) -> Vec<Address> {
        (1..=n).map(Address::repeat_byte).collect()
    }

    #[test]
    fn sorts_and_dedups() {
        let mut addrs = addresses(4);
        addrs.reverse();
        addrs.push(Address::repeat_byte(2));

        let set = ValidatorSet::new(addrs, ProposerPolicy::RoundRobin);
        assert_eq!(set.len(), 4);
        assert_eq!(set.addresses(), addresses(4).as_slice());
    }

    #[test]
    fn quorum_arithmetic() {
        for (n, f, q) in [(1, 0, 1), (3, 0, 3), (4, 1, 3), (7, 2, 5), (10, 3, 7)] {
            let set = ValidatorSet::new(addresses(n), ProposerPolicy::RoundRobin);
            assert_eq!(set.f(), f, "F for N={n}");
            assert_eq!(set.quorum(), q, "Q for N={n}");
        }
    }

    #[test]
    fn round_robin_rotates() {
        let mut set = ValidatorSet::new(addresses(4), ProposerPolicy::RoundRobin);

        set.calc_proposer(Address::ZERO, 0);
        assert_eq!(set.proposer(), Address::repeat_byte(1));

        // Successor of the last proposer at round 0.
        set.calc_proposer(Address::repeat_byte(1), 0);
        assert_eq!(set.proposer(), Address::repeat_byte(2));

        // Round changes skip further ahead, wrapping around.
        set.calc_proposer(Address::repeat_byte(4), 1);
        assert_eq!(set.proposer(), Address::repeat_byte(2));
    }

    #[test]
    fn sticky_keeps_proposer_until_round_change() {
        let mut set = ValidatorSet::new(addresses(4), ProposerPolicy::Sticky);

        set.calc_proposer(Address::repeat_byte(2), 0);
        assert_eq!(set.proposer(), Address::repeat_byte(2));

        set.calc_proposer(Address::repeat_byte(2), 1);
        assert_eq!(set.proposer(), Address::repeat_byte(3));
    }

    #[test]
    fn remove_is_single_shot() {
        let mut set = ValidatorSet::new(addresses(4), ProposerPolicy::RoundRobin);
        assert!(set.remove(Address::repeat_byte(3)));
        assert!(!set.remove(Address::repeat_byte(3)));
        assert_eq!(set.len(), 3);
        assert!(!set.contains(Address::repeat_byte(3)));
    }

    #[test]
    fn membership_lookup() {
        let set = ValidatorSet::new(addresses(4), ProposerPolicy::RoundRobin);
        assert_eq!(set.get_by_address(Address::repeat_byte(2)), Some(1));
        assert_eq!(set.get_by_address(Address::repeat_byte(9)), None);
        assert_eq!(set.get_by_index(0), Some(Address::repeat_byte(1)));
        assert_eq!(set.get_by_index(4), None);
    }
}
