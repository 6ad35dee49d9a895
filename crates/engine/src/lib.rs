//! The consensus backend.
//!
//! [`Backend`] is the glue between the consensus core and the surrounding
//! node: it verifies headers for the chain, prepares and seals blocks for
//! the miner, snapshots validator sets, signs with the node key, and moves
//! consensus messages between the core and the P2P layer.

pub mod engine;
pub mod snapshot;

pub use engine::{ConsensusEngine, VerifyCancel};
pub use snapshot::SnapshotStore;

use alloy_primitives::keccak256;
use ibft_core::{ConsensusEvent, Core, CoreBackend, CoreHandle, EventMux};
use ibft_types::{
    crypto, extra, Address, BftConfig, BftError, BftResult, Block, Broadcaster, Bytes,
    ChainReader, ValidatorSet, ValidatorSource, B256, PROTOCOL_NAME,
};
use lru::LruCache;
use secp256k1::SecretKey;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// P2P message code carrying a consensus envelope.
pub const CONSENSUS_MSG_CODE: u8 = 0x11;

const INMEMORY_SIGNERS: usize = 128;
const INMEMORY_PEERS: usize = 40;
const INMEMORY_MESSAGES: usize = 1024;

#[derive(Default)]
struct Lifecycle {
    /// Set for the lifetime of a start/stop cycle, before the core spawns,
    /// so the core task always observes it.
    chain: Option<Arc<dyn ChainReader>>,
    core: Option<CoreHandle>,
}

impl Lifecycle {
    fn is_started(&self) -> bool {
        self.core.is_some()
    }
}

/// The consensus engine backend.
///
/// One instance per node, shared as `Arc<Backend>`. All caches are owned by
/// the instance; two backends in one process never share state.
pub struct Backend {
    config: BftConfig,
    address: Address,
    secret_key: SecretKey,
    validator_source: Option<Arc<dyn ValidatorSource>>,
    mux: Arc<EventMux>,
    snapshots: SnapshotStore,
    /// `header hash → proposer` cache around ecrecover.
    recent_signers: Mutex<LruCache<B256, Address>>,
    /// Message hashes this node has already ingested or gossiped.
    known_messages: Mutex<LruCache<B256, ()>>,
    /// Per-peer view of the same, to avoid re-sending.
    recent_messages: Mutex<LruCache<Address, LruCache<B256, ()>>>,
    /// Lifecycle triad: chain, core handle, started flag.
    inner: RwLock<Lifecycle>,
    commit_tx: Mutex<Option<mpsc::Sender<Block>>>,
    commit_rx: tokio::sync::Mutex<Option<mpsc::Receiver<Block>>>,
    proposed_block_hash: Mutex<Option<B256>>,
    broadcaster: RwLock<Option<Arc<dyn Broadcaster>>>,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("address", &self.address)
            .field("started", &self.is_started())
            .finish_non_exhaustive()
    }
}

impl Backend {
    pub fn new(
        config: BftConfig,
        secret_key: SecretKey,
        validator_source: Option<Arc<dyn ValidatorSource>>,
    ) -> Arc<Self> {
        let address = crypto::secret_to_address(&secret_key);
        let policy = config.proposer_policy;
        Arc::new(Self {
            config,
            address,
            secret_key,
            validator_source,
            mux: Arc::new(EventMux::new()),
            snapshots: SnapshotStore::new(policy),
            recent_signers: Mutex::new(LruCache::new(nonzero(INMEMORY_SIGNERS))),
            known_messages: Mutex::new(LruCache::new(nonzero(INMEMORY_MESSAGES))),
            recent_messages: Mutex::new(LruCache::new(nonzero(INMEMORY_PEERS))),
            inner: RwLock::new(Lifecycle::default()),
            commit_tx: Mutex::new(None),
            commit_rx: tokio::sync::Mutex::new(None),
            proposed_block_hash: Mutex::new(None),
            broadcaster: RwLock::new(None),
        })
    }

    /// The local signer address.
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn config(&self) -> &BftConfig {
        &self.config
    }

    pub fn is_started(&self) -> bool {
        self.inner
            .read()
            .expect("lifecycle lock poisoned")
            .is_started()
    }

    /// Register the P2P handle once the network is up.
    pub fn set_broadcaster(&self, broadcaster: Arc<dyn Broadcaster>) {
        *self.broadcaster.write().expect("broadcaster lock poisoned") = Some(broadcaster);
    }

    /// Start the consensus core against `chain`.
    ///
    /// Waits for a sealer from a previous run to drain before reallocating
    /// the commit channel. Fails with `EngineStarted` when already running.
    pub async fn start(self: &Arc<Self>, chain: Arc<dyn ChainReader>) -> BftResult<()> {
        let mut rx_slot = self.commit_rx.lock().await;

        let mut inner = self.inner.write().expect("lifecycle lock poisoned");
        if inner.is_started() {
            return Err(BftError::EngineStarted);
        }

        let (tx, rx) = mpsc::channel(1);
        *self.commit_tx.lock().expect("commit sender lock poisoned") = Some(tx);
        *rx_slot = Some(rx);
        *self
            .proposed_block_hash
            .lock()
            .expect("seal lock poisoned") = None;

        // The chain must be visible before the core task starts asking for
        // the last proposal.
        inner.chain = Some(chain);
        inner.core = Some(Core::spawn(
            self.config.clone(),
            Arc::clone(self) as Arc<dyn CoreBackend>,
            &self.mux,
        ));
        Ok(())
    }

    /// Stop the consensus core and join its task.
    ///
    /// Closing the commit sender wakes any blocked sealer with a clean
    /// shutdown. Fails with `EngineStopped` when not running.
    pub async fn stop(&self) -> BftResult<()> {
        let core = {
            let mut inner = self.inner.write().expect("lifecycle lock poisoned");
            let core = inner.core.take().ok_or(BftError::EngineStopped)?;
            inner.chain = None;
            core
        };
        *self.commit_tx.lock().expect("commit sender lock poisoned") = None;
        core.stop().await;
        Ok(())
    }

    /// Ingest a consensus wire message received from peer `src`.
    ///
    /// Returns `false` when the payload was already known (gossip dedup),
    /// `true` when it was handed to the core.
    pub fn handle_consensus_message(&self, src: Address, payload: Bytes) -> bool {
        let hash = keccak256(&payload);
        {
            let mut recent = self
                .recent_messages
                .lock()
                .expect("recent messages lock poisoned");
            let seen = recent.get_or_insert_mut(src, || LruCache::new(nonzero(INMEMORY_MESSAGES)));
            seen.put(hash, ());
        }
        {
            let mut known = self
                .known_messages
                .lock()
                .expect("known messages lock poisoned");
            if known.contains(&hash) {
                return false;
            }
            known.put(hash, ());
        }
        self.mux.post(ConsensusEvent::Message { payload });
        true
    }

    /// Notify the core that the chain head changed (a block was inserted).
    pub fn new_chain_head(&self) {
        self.mux.post(ConsensusEvent::FinalCommitted);
    }

    /// Proposer of a header, through the signer cache.
    pub(crate) fn ecrecover(&self, header: &ibft_types::Header) -> BftResult<Address> {
        let hash = header.hash();
        if let Some(signer) = self
            .recent_signers
            .lock()
            .expect("signer cache poisoned")
            .get(&hash)
        {
            return Ok(*signer);
        }
        let signer = extra::recover_proposer(header)?;
        self.recent_signers
            .lock()
            .expect("signer cache poisoned")
            .put(hash, signer);
        Ok(signer)
    }

    pub(crate) fn chain(&self) -> Option<Arc<dyn ChainReader>> {
        self.inner
            .read()
            .expect("lifecycle lock poisoned")
            .chain
            .clone()
    }

    pub(crate) fn proposed_block_hash_slot(&self) -> &Mutex<Option<B256>> {
        &self.proposed_block_hash
    }

    pub(crate) fn commit_rx_slot(&self) -> &tokio::sync::Mutex<Option<mpsc::Receiver<Block>>> {
        &self.commit_rx
    }

    /// Post a local proposal into the core.
    pub(crate) fn post_request(&self, block: Block) {
        self.mux.post(ConsensusEvent::Request { block });
    }

    pub(crate) fn sign_digest(&self, digest: B256) -> [u8; crypto::SIGNATURE_LENGTH] {
        crypto::sign_hash(&self.secret_key, digest)
    }

    pub(crate) fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub(crate) fn validator_source(&self) -> Option<Arc<dyn ValidatorSource>> {
        self.validator_source.clone()
    }

    fn broadcaster(&self) -> Option<Arc<dyn Broadcaster>> {
        self.broadcaster
            .read()
            .expect("broadcaster lock poisoned")
            .clone()
    }

    /// Forward a finalized payload to connected validator peers, skipping
    /// any that already saw it.
    fn gossip(&self, validators: &ValidatorSet, payload: &Bytes) {
        let hash = keccak256(payload);
        self.known_messages
            .lock()
            .expect("known messages lock poisoned")
            .put(hash, ());

        let targets: Vec<Address> = validators
            .addresses()
            .iter()
            .copied()
            .filter(|address| *address != self.address)
            .collect();
        if targets.is_empty() {
            return;
        }
        let Some(broadcaster) = self.broadcaster() else {
            return;
        };

        for (address, peer) in broadcaster.find_peers(&targets) {
            let already_sent = {
                let mut recent = self
                    .recent_messages
                    .lock()
                    .expect("recent messages lock poisoned");
                let seen =
                    recent.get_or_insert_mut(address, || LruCache::new(nonzero(INMEMORY_MESSAGES)));
                let hit = seen.contains(&hash);
                if !hit {
                    seen.put(hash, ());
                }
                hit
            };
            if already_sent {
                continue;
            }
            if let Err(err) = peer.send(CONSENSUS_MSG_CODE, payload.clone()) {
                debug!(peer = %peer.id(), %err, "failed to send consensus message");
            }
        }
    }
}

impl CoreBackend for Backend {
    fn address(&self) -> Address {
        self.address
    }

    fn validators(&self, sequence: u64) -> ValidatorSet {
        let empty = || ValidatorSet::new(Vec::new(), self.config.proposer_policy);
        let Some(chain) = self.chain() else {
            return empty();
        };
        let number = sequence.saturating_sub(1);
        let Some(header) = chain.header_by_number(number) else {
            warn!(number, "validator snapshot header missing");
            return empty();
        };
        match self
            .snapshots
            .validator_set(chain.as_ref(), number, header.hash(), &[])
        {
            Ok(set) => set,
            Err(err) => {
                warn!(%err, sequence, "failed to load validator snapshot");
                empty()
            }
        }
    }

    fn broadcast(&self, validators: &ValidatorSet, payload: Bytes) {
        // Loop back through the mux first so our own core sees the message.
        self.mux.post(ConsensusEvent::Message {
            payload: payload.clone(),
        });
        self.gossip(validators, &payload);
    }

    fn sign(&self, digest: B256) -> BftResult<Bytes> {
        Ok(crypto::sign_hash(&self.secret_key, digest).to_vec().into())
    }

    fn commit(&self, proposal: Block, seals: Vec<Bytes>) -> BftResult<()> {
        let mut header = proposal.header.clone();
        extra::write_committed_seals(&mut header, &seals)?;
        let block = proposal.with_header(header);
        let hash = block.hash();

        let ours = *self
            .proposed_block_hash
            .lock()
            .expect("seal lock poisoned")
            == Some(hash);
        debug!(%hash, ours, "consensus committed a block");

        if ours {
            if let Some(tx) = self
                .commit_tx
                .lock()
                .expect("commit sender lock poisoned")
                .as_ref()
            {
                // Non-blocking: with no sealer waiting the miner will retry.
                if tx.try_send(block).is_err() {
                    debug!(%hash, "no sealer waiting, dropping committed block");
                }
            }
            return Ok(());
        }

        if let Some(broadcaster) = self.broadcaster() {
            broadcaster.enqueue(PROTOCOL_NAME, block);
        } else {
            debug!(%hash, "no broadcaster registered, dropping committed block");
        }
        Ok(())
    }

    fn verify(&self, proposal: &Block) -> BftResult<()> {
        let Some(chain) = self.chain() else {
            return Err(BftError::EngineStopped);
        };
        let header = &proposal.header;

        // Proposals must extend the current head.
        let head = chain.current_block();
        if header.number != head.number() + 1 || header.parent_hash != head.hash() {
            return Err(BftError::UnknownAncestor);
        }

        match self.verify_header_with_parents(chain.as_ref(), header, &[]) {
            // The committed seals are this round's output; their absence is
            // expected on a fresh proposal.
            Ok(()) | Err(BftError::EmptyCommittedSeals) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn last_proposal(&self) -> (Block, Address) {
        let Some(chain) = self.chain() else {
            return (Block::default(), Address::ZERO);
        };
        let block = chain.current_block();
        let proposer = if block.number() > 0 {
            self.ecrecover(&block.header).unwrap_or(Address::ZERO)
        } else {
            Address::ZERO
        };
        (block, proposer)
    }

    fn has_bad_block(&self, hash: B256) -> bool {
        self.chain()
            .map(|chain| chain.has_bad_block(hash))
            .unwrap_or(false)
    }
}

fn nonzero(value: usize) -> NonZeroUsize {
    NonZeroUsize::new(value).expect("nonzero capacity")
}
