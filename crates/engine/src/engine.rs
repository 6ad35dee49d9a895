//! Engine surface: header verification, block preparation, and sealing.

use crate::Backend;
use async_trait::async_trait;
use ibft_types::{
    crypto, extra,
    header::{bft_difficulty, NONCE_AUTH_VOTE, NONCE_EMPTY},
    Address, BftError, BftResult, Block, Bytes, ChainReader, Header, ValidatorSet, B256,
    BFT_MIX_DIGEST, EMPTY_UNCLE_HASH,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tracing::debug;

/// The engine contract the surrounding node drives.
///
/// One implementation serves every protocol flavor; variant behavior
/// (speaker rule, quorum rule) comes from the configuration record.
#[async_trait]
pub trait ConsensusEngine: Send + Sync {
    /// Signer that sealed a header.
    fn author(&self, header: &Header) -> BftResult<Address>;

    /// Check a header against the consensus rules. `seal` is accepted for
    /// interface compatibility; committed seals are always verified.
    fn verify_header(&self, chain: &dyn ChainReader, header: &Header, seal: bool) -> BftResult<()>;

    /// Reject any block carrying uncles.
    fn verify_uncles(&self, block: &Block) -> BftResult<()>;

    /// Check difficulty and signer authority only.
    fn verify_seal(&self, chain: &dyn ChainReader, header: &Header) -> BftResult<()>;

    /// Fill in the consensus fields of a candidate header.
    fn prepare(&self, chain: &dyn ChainReader, header: &mut Header) -> BftResult<()>;

    /// Write the next validator list into the header and assemble the block.
    fn finalize(
        &self,
        chain: &dyn ChainReader,
        header: &mut Header,
        transactions: Vec<Bytes>,
    ) -> BftResult<Block>;

    /// Run the block through consensus. Resolves with the sealed block,
    /// or `None` when `stop` fires first.
    async fn seal(&self, block: Block, stop: watch::Receiver<bool>) -> BftResult<Option<Block>>;
}

/// Cancellation handle for a [`Backend::verify_headers`] pipeline.
#[derive(Debug, Clone)]
pub struct VerifyCancel {
    flag: Arc<AtomicBool>,
}

impl VerifyCancel {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }
}

impl Backend {
    /// Proposer of a header (may differ from the coinbase).
    pub fn author(&self, header: &Header) -> BftResult<Address> {
        self.ecrecover(header)
    }

    /// Check a single header against the consensus rules.
    pub fn verify_header(&self, chain: &dyn ChainReader, header: &Header) -> BftResult<()> {
        self.verify_header_with_parents(chain, header, &[])
    }

    /// Verify a batch of headers, pipelined, preserving input order.
    /// Results stream on the returned channel; the handle aborts the rest.
    pub fn verify_headers(
        self: &Arc<Self>,
        chain: Arc<dyn ChainReader>,
        headers: Vec<Header>,
    ) -> (VerifyCancel, std::sync::mpsc::Receiver<BftResult<()>>) {
        let (tx, rx) = std::sync::mpsc::channel();
        let flag = Arc::new(AtomicBool::new(false));
        let cancel = VerifyCancel {
            flag: Arc::clone(&flag),
        };
        let backend = Arc::clone(self);
        std::thread::spawn(move || {
            for index in 0..headers.len() {
                if flag.load(Ordering::Relaxed) {
                    return;
                }
                let result = backend.verify_header_with_parents(
                    chain.as_ref(),
                    &headers[index],
                    &headers[..index],
                );
                if tx.send(result).is_err() {
                    return;
                }
            }
        });
        (cancel, rx)
    }

    /// A BFT block never carries uncles.
    pub fn verify_uncles(&self, block: &Block) -> BftResult<()> {
        if block.header.uncle_hash != EMPTY_UNCLE_HASH {
            return Err(BftError::InvalidUncleHash);
        }
        Ok(())
    }

    /// Check the proposer seal only: difficulty and signer authority.
    pub fn verify_seal(&self, chain: &dyn ChainReader, header: &Header) -> BftResult<()> {
        if header.number == 0 {
            return Err(BftError::UnknownBlock);
        }
        if header.difficulty != bft_difficulty() {
            return Err(BftError::InvalidDifficulty);
        }
        self.verify_signer(chain, header, &[])
    }

    pub(crate) fn verify_header_with_parents(
        &self,
        chain: &dyn ChainReader,
        header: &Header,
        parents: &[Header],
    ) -> BftResult<()> {
        // Don't waste time on blocks from the future; the caller retries.
        if header.timestamp > unix_now() {
            return Err(BftError::FutureBlock);
        }
        if extra::extract(header).is_err() {
            return Err(BftError::InvalidExtraDataFormat);
        }
        if header.nonce != NONCE_EMPTY && header.nonce != NONCE_AUTH_VOTE {
            return Err(BftError::InvalidNonce);
        }
        if header.mix_digest != *BFT_MIX_DIGEST {
            return Err(BftError::InvalidMixDigest);
        }
        if header.uncle_hash != EMPTY_UNCLE_HASH {
            return Err(BftError::InvalidUncleHash);
        }
        if header.difficulty != bft_difficulty() {
            return Err(BftError::InvalidDifficulty);
        }
        self.verify_cascading_fields(chain, header, parents)
    }

    /// Checks that depend on the ancestry: parent linkage, block period,
    /// signer authority, and the committed-seal quorum.
    fn verify_cascading_fields(
        &self,
        chain: &dyn ChainReader,
        header: &Header,
        parents: &[Header],
    ) -> BftResult<()> {
        if header.number == 0 {
            // The genesis block is the always-valid dead end.
            return Ok(());
        }

        let parent = match parents.last() {
            Some(parent) => parent.clone(),
            None => chain
                .header(header.parent_hash, header.number - 1)
                .ok_or(BftError::UnknownAncestor)?,
        };
        if parent.number != header.number - 1 || parent.hash() != header.parent_hash {
            return Err(BftError::UnknownAncestor);
        }
        if parent.timestamp + self.config().block_period_secs > header.timestamp {
            return Err(BftError::InvalidTimestamp);
        }

        self.verify_signer(chain, header, parents)?;
        self.verify_committed_seals(chain, header, parents)
    }

    /// The proposer must be a member of the parent's validator set.
    fn verify_signer(
        &self,
        chain: &dyn ChainReader,
        header: &Header,
        parents: &[Header],
    ) -> BftResult<()> {
        if header.number == 0 {
            return Err(BftError::UnknownBlock);
        }
        let validators =
            self.snapshots()
                .validator_set(chain, header.number - 1, header.parent_hash, parents)?;
        let signer = self.ecrecover(header)?;
        if !validators.contains(signer) {
            return Err(BftError::Unauthorized);
        }
        Ok(())
    }

    /// Every committed seal must come from a distinct member of the
    /// parent's validator set, and there must be a quorum of them.
    fn verify_committed_seals(
        &self,
        chain: &dyn ChainReader,
        header: &Header,
        parents: &[Header],
    ) -> BftResult<()> {
        if header.number == 0 {
            return Ok(());
        }
        let validators =
            self.snapshots()
                .validator_set(chain, header.number - 1, header.parent_hash, parents)?;

        let decoded = extra::extract(header)?;
        if decoded.committed_seals.is_empty() {
            return Err(BftError::EmptyCommittedSeals);
        }

        // One seal per validator: remove each recovered signer from a
        // snapshot copy, so duplicates and outsiders both fail the lookup.
        let mut remaining = validators.clone();
        let digest = extra::commit_digest(header.hash());
        let mut valid_seals = 0usize;
        for seal in &decoded.committed_seals {
            let signer =
                crypto::recover_signer(digest, seal).map_err(|_| BftError::InvalidSignature)?;
            if remaining.remove(signer) {
                valid_seals += 1;
            } else {
                return Err(BftError::InvalidCommittedSeals);
            }
        }
        if valid_seals < validators.quorum() {
            return Err(BftError::InvalidCommittedSeals);
        }
        Ok(())
    }

    /// Initialize the consensus fields of a candidate header: zero nonce,
    /// our coinbase, the BFT sentinels, the validator list, and a timestamp
    /// one block period past the parent (clamped up to now).
    pub fn prepare(&self, chain: &dyn ChainReader, header: &mut Header) -> BftResult<()> {
        if header.number == 0 {
            return Err(BftError::UnknownBlock);
        }
        let parent = chain
            .header(header.parent_hash, header.number - 1)
            .ok_or(BftError::UnknownAncestor)?;

        header.coinbase = self.address();
        header.nonce = NONCE_EMPTY;
        header.mix_digest = *BFT_MIX_DIGEST;
        header.difficulty = bft_difficulty();

        let validators =
            self.snapshots()
                .validator_set(chain, header.number - 1, header.parent_hash, &[])?;
        header.extra = extra::prepare_extra(&header.extra, validators.addresses());

        header.timestamp = (parent.timestamp + self.config().block_period_secs).max(unix_now());
        Ok(())
    }

    /// Write the next validator list into the extra-data and assemble the
    /// block. The list comes from the validator contract when one is
    /// registered, otherwise the set carries over.
    pub fn finalize(
        &self,
        chain: &dyn ChainReader,
        header: &mut Header,
        transactions: Vec<Bytes>,
    ) -> BftResult<Block> {
        if header.number == 0 {
            return Err(BftError::UnknownBlock);
        }
        let validators = match self.validator_source() {
            Some(source) => {
                let listed = source
                    .validators_at(header)
                    .map_err(|err| BftError::ValidatorSource(err.to_string()))?;
                ValidatorSet::new(listed, self.config().proposer_policy)
            }
            None => self.snapshots().validator_set(
                chain,
                header.number - 1,
                header.parent_hash,
                &[],
            )?,
        };
        header.extra = extra::prepare_extra(&header.extra, validators.addresses());
        header.uncle_hash = EMPTY_UNCLE_HASH;
        Ok(Block::new(header.clone(), transactions))
    }

    /// Run a candidate block through consensus.
    ///
    /// Signs the proposer seal, waits for the header timestamp, posts the
    /// proposal to the core, and blocks on the commit channel until the
    /// matching sealed block comes back. Stale results from earlier rounds
    /// are discarded. Returns `None` when `stop` fires or the engine shuts
    /// down underneath the call.
    pub async fn seal(
        &self,
        block: Block,
        mut stop: watch::Receiver<bool>,
    ) -> BftResult<Option<Block>> {
        let chain = self.chain().ok_or(BftError::EngineStopped)?;
        let number = block.header.number;
        if number == 0 {
            return Err(BftError::UnknownBlock);
        }

        // Bail out if we are not authorized to sign at this height.
        let validators = self.snapshots().validator_set(
            chain.as_ref(),
            number - 1,
            block.header.parent_hash,
            &[],
        )?;
        if !validators.contains(self.address()) {
            return Err(BftError::Unauthorized);
        }
        if chain.header(block.header.parent_hash, number - 1).is_none() {
            return Err(BftError::UnknownAncestor);
        }

        let block = self.update_block(block)?;

        // Hold the proposal until its slot.
        let delay = Duration::from_secs(block.header.timestamp.saturating_sub(unix_now()));
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop.changed() => return Ok(None),
        }

        let sealed_hash = block.hash();
        *self
            .proposed_block_hash_slot()
            .lock()
            .expect("seal lock poisoned") = Some(sealed_hash);

        self.post_request(block);

        let result = self.wait_for_commit(sealed_hash, &mut stop).await;
        *self
            .proposed_block_hash_slot()
            .lock()
            .expect("seal lock poisoned") = None;
        result
    }

    async fn wait_for_commit(
        &self,
        sealed_hash: B256,
        stop: &mut watch::Receiver<bool>,
    ) -> BftResult<Option<Block>> {
        let mut guard = self.commit_rx_slot().lock().await;
        let Some(rx) = guard.as_mut() else {
            return Err(BftError::EngineStopped);
        };
        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Some(sealed) if sealed.hash() == sealed_hash => return Ok(Some(sealed)),
                    Some(stale) => {
                        debug!(got = %stale.hash(), want = %sealed_hash,
                            "discarding stale commit result");
                    }
                    // Sender dropped: the engine stopped, exit cleanly.
                    None => return Ok(None),
                },
                _ = stop.changed() => return Ok(None),
            }
        }
    }

    /// Sign the proposer seal into the header.
    fn update_block(&self, block: Block) -> BftResult<Block> {
        let mut header = block.header.clone();
        let seal = self.sign_digest(extra::sig_hash(&header)?);
        extra::write_seal(&mut header, &seal)?;
        Ok(block.with_header(header))
    }
}

#[async_trait]
impl ConsensusEngine for Backend {
    fn author(&self, header: &Header) -> BftResult<Address> {
        Backend::author(self, header)
    }

    fn verify_header(
        &self,
        chain: &dyn ChainReader,
        header: &Header,
        _seal: bool,
    ) -> BftResult<()> {
        Backend::verify_header(self, chain, header)
    }

    fn verify_uncles(&self, block: &Block) -> BftResult<()> {
        Backend::verify_uncles(self, block)
    }

    fn verify_seal(&self, chain: &dyn ChainReader, header: &Header) -> BftResult<()> {
        Backend::verify_seal(self, chain, header)
    }

    fn prepare(&self, chain: &dyn ChainReader, header: &mut Header) -> BftResult<()> {
        Backend::prepare(self, chain, header)
    }

    fn finalize(
        &self,
        chain: &dyn ChainReader,
        header: &mut Header,
        transactions: Vec<Bytes>,
    ) -> BftResult<Block> {
        Backend::finalize(self, chain, header, transactions)
    }

    async fn seal(&self, block: Block, stop: watch::Receiver<bool>) -> BftResult<Option<Block>> {
        Backend::seal(self, block, stop).await
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
