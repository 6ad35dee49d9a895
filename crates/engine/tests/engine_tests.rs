//! Backend engine tests: header verification, preparation, lifecycle.

mod common;

use common::{genesis_with, sealed_header, sorted_keys, unix_now, MockChain};
use ibft_engine::{Backend, ConsensusEngine};
use ibft_types::{
    crypto, extra,
    header::{bft_difficulty, NONCE_AUTH_VOTE},
    Address, BftConfig, BftError, Block, Bytes, ChainReader, Header, ValidatorSource, B256, B64,
    EMPTY_UNCLE_HASH,
};
use secp256k1::SecretKey;
use std::sync::Arc;
use tokio::sync::watch;

struct Fixture {
    keys: Vec<SecretKey>,
    addresses: Vec<Address>,
    chain: Arc<MockChain>,
    backend: Arc<Backend>,
}

fn fixture() -> Fixture {
    let (keys, addresses) = sorted_keys(4);
    let genesis = genesis_with(&addresses, unix_now().saturating_sub(100));
    let chain = MockChain::new(genesis);
    let backend = Backend::new(BftConfig::default(), keys[0], None);
    Fixture {
        keys,
        addresses,
        chain,
        backend,
    }
}

impl Fixture {
    /// A fully sealed, valid header for height 1.
    fn valid_header(&self) -> Header {
        sealed_header(
            &self.chain.head().header,
            &self.addresses,
            &self.keys,
            0,
            &[0, 1, 2],
            unix_now().saturating_sub(50),
        )
    }
}

#[test]
fn valid_header_verifies() {
    let f = fixture();
    f.backend.verify_header(&*f.chain, &f.valid_header()).unwrap();
}

#[test]
fn future_timestamp_is_retryable() {
    let f = fixture();
    let mut header = f.valid_header();
    header.timestamp = unix_now() + 2;

    let err = f.backend.verify_header(&*f.chain, &header).unwrap_err();
    assert_eq!(err, BftError::FutureBlock);
    assert!(err.is_retryable());

    // Once the wall clock catches up the same header is acceptable, apart
    // from the seals that were invalidated by editing the timestamp.
    std::thread::sleep(std::time::Duration::from_secs(3));
    let resealed = sealed_header(
        &f.chain.head().header,
        &f.addresses,
        &f.keys,
        0,
        &[0, 1, 2],
        header.timestamp,
    );
    f.backend.verify_header(&*f.chain, &resealed).unwrap();
}

#[test]
fn malformed_extra_is_rejected() {
    let f = fixture();
    let mut header = f.valid_header();
    header.extra = Bytes::from(vec![0u8; 8]);
    assert_eq!(
        f.backend.verify_header(&*f.chain, &header),
        Err(BftError::InvalidExtraDataFormat)
    );
}

#[test]
fn invalid_nonce_is_rejected() {
    let f = fixture();
    let mut header = f.valid_header();
    header.nonce = B64::new([0xde, 0xad, 0xbe, 0xef, 0, 0, 0, 1]);
    assert_eq!(
        f.backend.verify_header(&*f.chain, &header),
        Err(BftError::InvalidNonce)
    );

    // The auth-vote magic value is allowed; it only invalidates the seal.
    let mut voting = f.valid_header();
    voting.nonce = NONCE_AUTH_VOTE;
    assert_ne!(
        f.backend.verify_header(&*f.chain, &voting),
        Err(BftError::InvalidNonce)
    );
}

#[test]
fn wrong_mix_digest_is_rejected() {
    let f = fixture();
    let mut header = f.valid_header();
    header.mix_digest = B256::repeat_byte(7);
    assert_eq!(
        f.backend.verify_header(&*f.chain, &header),
        Err(BftError::InvalidMixDigest)
    );
}

#[test]
fn uncles_are_rejected() {
    let f = fixture();
    let mut header = f.valid_header();
    header.uncle_hash = B256::repeat_byte(7);
    assert_eq!(
        f.backend.verify_header(&*f.chain, &header),
        Err(BftError::InvalidUncleHash)
    );

    let block = Block::new(header, Vec::new());
    assert_eq!(
        f.backend.verify_uncles(&block),
        Err(BftError::InvalidUncleHash)
    );
}

#[test]
fn wrong_difficulty_is_rejected() {
    let f = fixture();
    let mut header = f.valid_header();
    header.difficulty = bft_difficulty() + bft_difficulty();
    assert_eq!(
        f.backend.verify_header(&*f.chain, &header),
        Err(BftError::InvalidDifficulty)
    );
}

#[test]
fn unknown_parent_is_rejected() {
    let f = fixture();
    let mut header = f.valid_header();
    header.parent_hash = B256::repeat_byte(9);
    assert_eq!(
        f.backend.verify_header(&*f.chain, &header),
        Err(BftError::UnknownAncestor)
    );
}

#[test]
fn timestamp_below_block_period_is_rejected() {
    let f = fixture();
    let parent = f.chain.head().header;
    // Same timestamp as the parent: below parent + block_period.
    let header = sealed_header(
        &parent,
        &f.addresses,
        &f.keys,
        0,
        &[0, 1, 2],
        parent.timestamp,
    );
    assert_eq!(
        f.backend.verify_header(&*f.chain, &header),
        Err(BftError::InvalidTimestamp)
    );
}

#[test]
fn outsider_proposer_is_unauthorized() {
    let f = fixture();
    let outsider = SecretKey::new(&mut rand::thread_rng());
    let mut keys = f.keys.clone();
    keys[0] = outsider;
    let header = sealed_header(
        &f.chain.head().header,
        &f.addresses,
        &keys,
        0,
        &[1, 2, 3],
        unix_now().saturating_sub(50),
    );
    assert_eq!(
        f.backend.verify_header(&*f.chain, &header),
        Err(BftError::Unauthorized)
    );
}

#[test]
fn missing_committed_seals_are_rejected() {
    let f = fixture();
    let header = sealed_header(
        &f.chain.head().header,
        &f.addresses,
        &f.keys,
        0,
        &[],
        unix_now().saturating_sub(50),
    );
    assert_eq!(
        f.backend.verify_header(&*f.chain, &header),
        Err(BftError::EmptyCommittedSeals)
    );
}

#[test]
fn foreign_committed_seal_is_rejected() {
    let f = fixture();
    let mut header = f.valid_header();

    // Swap one seal for a signature from outside the validator set.
    let outsider = SecretKey::new(&mut rand::thread_rng());
    let digest = extra::commit_digest(header.hash());
    let mut decoded = extra::extract(&header).unwrap();
    decoded.committed_seals[2] = crypto::sign_hash(&outsider, digest).to_vec().into();
    let seals = decoded.committed_seals.clone();
    extra::write_committed_seals(&mut header, &seals).unwrap();

    assert_eq!(
        f.backend.verify_header(&*f.chain, &header),
        Err(BftError::InvalidCommittedSeals)
    );
}

#[test]
fn duplicate_committed_seal_is_rejected() {
    let f = fixture();
    let header = sealed_header(
        &f.chain.head().header,
        &f.addresses,
        &f.keys,
        0,
        &[0, 0, 1],
        unix_now().saturating_sub(50),
    );
    assert_eq!(
        f.backend.verify_header(&*f.chain, &header),
        Err(BftError::InvalidCommittedSeals)
    );
}

#[test]
fn seal_quorum_floor_is_enforced() {
    let f = fixture();
    // Two of four seals: below Q = 3.
    let header = sealed_header(
        &f.chain.head().header,
        &f.addresses,
        &f.keys,
        0,
        &[0, 1],
        unix_now().saturating_sub(50),
    );
    assert_eq!(
        f.backend.verify_header(&*f.chain, &header),
        Err(BftError::InvalidCommittedSeals)
    );
}

#[test]
fn verify_seal_checks_signer_only() {
    let f = fixture();
    // No committed seals needed for the seal check.
    let header = sealed_header(
        &f.chain.head().header,
        &f.addresses,
        &f.keys,
        2,
        &[],
        unix_now().saturating_sub(50),
    );
    f.backend.verify_seal(&*f.chain, &header).unwrap();

    assert_eq!(
        f.backend.verify_seal(&*f.chain, &f.chain.head().header),
        Err(BftError::UnknownBlock)
    );
}

#[test]
fn author_recovers_the_proposer() {
    let f = fixture();
    for proposer in 0..4 {
        let header = sealed_header(
            &f.chain.head().header,
            &f.addresses,
            &f.keys,
            proposer,
            &[0, 1, 2],
            unix_now().saturating_sub(50),
        );
        assert_eq!(
            f.backend.author(&header).unwrap(),
            f.addresses[proposer]
        );
    }
}

#[test]
fn prepare_fills_consensus_fields() {
    let f = fixture();
    let genesis = f.chain.head().header;
    let mut header = Header {
        parent_hash: genesis.hash(),
        number: 1,
        gas_limit: 8_000_000,
        nonce: B64::new([1; 8]),
        ..Default::default()
    };
    f.backend.prepare(&*f.chain, &mut header).unwrap();

    assert_eq!(header.coinbase, f.backend.address());
    assert_eq!(header.nonce, B64::ZERO);
    assert_eq!(header.mix_digest, *ibft_types::BFT_MIX_DIGEST);
    assert_eq!(header.difficulty, bft_difficulty());
    assert!(header.timestamp >= genesis.timestamp + 1);

    let decoded = extra::extract(&header).unwrap();
    assert_eq!(decoded.validators, f.addresses);
    assert!(decoded.seal.is_empty());
    assert!(decoded.committed_seals.is_empty());
}

#[test]
fn finalize_consults_the_validator_source() {
    struct ReversedSource(Vec<Address>);

    impl ValidatorSource for ReversedSource {
        fn validators_at(&self, _header: &Header) -> anyhow::Result<Vec<Address>> {
            let mut reversed = self.0.clone();
            reversed.reverse();
            Ok(reversed)
        }
    }

    let (keys, addresses) = sorted_keys(4);
    let genesis = genesis_with(&addresses, unix_now().saturating_sub(100));
    let chain = MockChain::new(genesis.clone());
    let backend = Backend::new(
        BftConfig::default(),
        keys[0],
        Some(Arc::new(ReversedSource(addresses.clone()))),
    );

    let mut header = Header {
        parent_hash: genesis.hash(),
        number: 1,
        gas_limit: 8_000_000,
        uncle_hash: B256::repeat_byte(1),
        ..Default::default()
    };
    let block = backend
        .finalize(&*chain, &mut header, vec![Bytes::from(vec![1, 2, 3])])
        .unwrap();

    // The source's list lands in the extra-data, normalized to order.
    let decoded = extra::extract(&block.header).unwrap();
    assert_eq!(decoded.validators, addresses);
    assert_eq!(block.header.uncle_hash, EMPTY_UNCLE_HASH);
    assert_eq!(block.transactions.len(), 1);
}

#[test]
fn verify_headers_pipelines_a_batch() {
    let f = fixture();
    let now = unix_now();
    let first = sealed_header(
        &f.chain.head().header,
        &f.addresses,
        &f.keys,
        0,
        &[0, 1, 2],
        now.saturating_sub(50),
    );
    let second = sealed_header(
        &first,
        &f.addresses,
        &f.keys,
        1,
        &[1, 2, 3],
        now.saturating_sub(40),
    );
    let mut broken = sealed_header(
        &second,
        &f.addresses,
        &f.keys,
        2,
        &[0, 1, 2],
        now.saturating_sub(30),
    );
    broken.mix_digest = B256::repeat_byte(3);

    let (_cancel, results) = f.backend.verify_headers(
        f.chain.clone() as Arc<dyn ChainReader>,
        vec![first, second, broken],
    );

    // Results stream in input order; the second header verifies against
    // the first even though neither is in the chain yet.
    assert_eq!(results.recv().unwrap(), Ok(()));
    assert_eq!(results.recv().unwrap(), Ok(()));
    assert_eq!(results.recv().unwrap(), Err(BftError::InvalidMixDigest));
}

#[tokio::test]
async fn lifecycle_guards_are_enforced() {
    let f = fixture();
    let chain = f.chain.clone() as Arc<dyn ChainReader>;

    assert_eq!(f.backend.stop().await, Err(BftError::EngineStopped));
    f.backend.start(chain.clone()).await.unwrap();
    assert_eq!(
        f.backend.start(chain.clone()).await,
        Err(BftError::EngineStarted)
    );
    f.backend.stop().await.unwrap();
    assert_eq!(f.backend.stop().await, Err(BftError::EngineStopped));

    // A stopped engine can be started again.
    f.backend.start(chain).await.unwrap();
    f.backend.stop().await.unwrap();
}

#[tokio::test]
async fn seal_refuses_when_stopped_or_unauthorized() {
    let f = fixture();
    let candidate = Block::new(f.valid_header(), Vec::new());

    let (_tx, stop) = watch::channel(false);
    assert_eq!(
        f.backend.seal(candidate.clone(), stop).await,
        Err(BftError::EngineStopped)
    );

    // An engine keyed outside the validator set must not sign.
    let outsider = Backend::new(
        BftConfig::default(),
        SecretKey::new(&mut rand::thread_rng()),
        None,
    );
    outsider
        .start(f.chain.clone() as Arc<dyn ChainReader>)
        .await
        .unwrap();
    let (_tx, stop) = watch::channel(false);
    assert_eq!(
        outsider.seal(candidate, stop).await,
        Err(BftError::Unauthorized)
    );
    outsider.stop().await.unwrap();
}

#[test]
fn engine_trait_object_drives_verification() {
    let f = fixture();
    let engine: Arc<dyn ConsensusEngine> = f.backend.clone();

    let header = f.valid_header();
    engine.verify_header(&*f.chain, &header, true).unwrap();
    assert_eq!(engine.author(&header).unwrap(), f.addresses[0]);
}
