//! Validator-set snapshots.

use ibft_types::{extra, BftError, BftResult, ChainReader, Header, ProposerPolicy, ValidatorSet, B256};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;

/// Number of recent snapshots kept in memory.
const INMEMORY_SNAPSHOTS: usize = 128;

/// Cache of `(height, hash) → ValidatorSet`.
///
/// The set authoritative for validating a block at height `h` is the one
/// recorded in header `h - 1`'s extra-data; the genesis header seeds the
/// chain. Batch verification passes the not-yet-inserted ancestors in
/// `parents`.
pub struct SnapshotStore {
    policy: ProposerPolicy,
    cache: Mutex<LruCache<(u64, B256), ValidatorSet>>,
}

impl std::fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl SnapshotStore {
    pub fn new(policy: ProposerPolicy) -> Self {
        Self {
            policy,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(INMEMORY_SNAPSHOTS).expect("nonzero capacity"),
            )),
        }
    }

    /// Validator set recorded at `(number, hash)`.
    ///
    /// Fails with `UnknownAncestor` when the header is neither in `parents`
    /// nor in the chain.
    pub fn validator_set(
        &self,
        chain: &dyn ChainReader,
        number: u64,
        hash: B256,
        parents: &[Header],
    ) -> BftResult<ValidatorSet> {
        if let Some(cached) = self.cache.lock().expect("snapshot cache poisoned").get(&(number, hash))
        {
            return Ok(cached.clone());
        }

        let header = parents
            .iter()
            .rev()
            .find(|parent| parent.number == number && parent.hash() == hash)
            .cloned()
            .or_else(|| chain.header(hash, number))
            .ok_or(BftError::UnknownAncestor)?;

        let decoded = extra::extract(&header)?;
        let set = ValidatorSet::new(decoded.validators, self.policy);
        self.cache
            .lock()
            .expect("snapshot cache poisoned")
            .put((number, hash), set.clone());
        Ok(set)
    }
}
