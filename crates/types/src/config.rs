//! Engine configuration.

use crate::validator::ProposerPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the consensus engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BftConfig {
    /// Base round timeout in milliseconds; doubles every round change.
    pub request_timeout_ms: u64,
    /// Upper bound on the round timeout in milliseconds.
    pub max_round_timeout_ms: u64,
    /// Minimum seconds between a block and its parent.
    pub block_period_secs: u64,
    /// Proposer selection rule.
    pub proposer_policy: ProposerPolicy,
    /// Maximum future messages parked per sender.
    pub backlog_per_sender: usize,
}

impl Default for BftConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            max_round_timeout_ms: 60_000,
            block_period_secs: 1,
            proposer_policy: ProposerPolicy::RoundRobin,
            backlog_per_sender: 64,
        }
    }
}

impl BftConfig {
    /// Timeout for a round: `request_timeout * 2^round`, capped.
    pub fn round_timeout(&self, round: u64) -> Duration {
        let shift = round.min(63) as u32;
        let scaled = self.request_timeout_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(scaled.min(self.max_round_timeout_ms))
    }

    pub fn block_period(&self) -> Duration {
        Duration::from_secs(self.block_period_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_doubles_and_caps() {
        let config = BftConfig::default();
        assert_eq!(config.round_timeout(0), Duration::from_millis(10_000));
        assert_eq!(config.round_timeout(1), Duration::from_millis(20_000));
        assert_eq!(config.round_timeout(2), Duration::from_millis(40_000));
        assert_eq!(config.round_timeout(3), Duration::from_millis(60_000));
        assert_eq!(config.round_timeout(60), Duration::from_millis(60_000));
    }
}
