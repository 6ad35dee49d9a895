//! Consensus extra-data codec.
//!
//! Layout (bit-exact): `extra = vanity[32] || RLP(BftExtra)` where `BftExtra`
//! is an RLP list of the validator addresses, the proposer seal, and the
//! committed seals.

use crate::crypto::{self, SIGNATURE_LENGTH};
use crate::error::{BftError, BftResult};
use crate::header::Header;
use alloy_primitives::{keccak256, Address, Bytes, B256};
use alloy_rlp::{Decodable, RlpDecodable, RlpEncodable};

/// Fixed number of vanity bytes reserved at the front of the extra field.
pub const VANITY_LENGTH: usize = 32;

/// Byte appended to a block hash to form the committed-seal signing domain.
const COMMIT_MSG_CODE: u8 = 0x02;

/// The decoded tail of a header's extra field.
#[derive(Debug, Clone, PartialEq, Eq, Default, RlpEncodable, RlpDecodable)]
pub struct BftExtra {
    /// Validator set authorized to seal the next block.
    pub validators: Vec<Address>,
    /// Proposer's signature over [`sig_hash`].
    pub seal: Bytes,
    /// Validator signatures over the commit digest of this block's hash.
    pub committed_seals: Vec<Bytes>,
}

/// Decode the `BftExtra` tail of a header's extra field.
pub fn extract(header: &Header) -> BftResult<BftExtra> {
    extract_bytes(&header.extra)
}

/// Decode a raw extra blob.
pub fn extract_bytes(extra: &[u8]) -> BftResult<BftExtra> {
    if extra.len() < VANITY_LENGTH {
        return Err(BftError::InvalidExtraDataFormat);
    }
    BftExtra::decode(&mut &extra[VANITY_LENGTH..])
        .map_err(|_| BftError::InvalidExtraDataFormat)
}

/// Assemble an extra field from the caller's vanity bytes and a validator
/// list. The vanity is right-padded (or truncated) to 32 bytes; seals start
/// out empty.
pub fn prepare_extra(current_extra: &[u8], validators: &[Address]) -> Bytes {
    let mut out = Vec::with_capacity(VANITY_LENGTH + 32 * validators.len());
    let take = current_extra.len().min(VANITY_LENGTH);
    out.extend_from_slice(&current_extra[..take]);
    out.resize(VANITY_LENGTH, 0);

    let extra = BftExtra {
        validators: validators.to_vec(),
        seal: Bytes::new(),
        committed_seals: Vec::new(),
    };
    out.extend_from_slice(&alloy_rlp::encode(&extra));
    out.into()
}

/// Write the proposer seal into a header's extra field.
pub fn write_seal(header: &mut Header, seal: &[u8]) -> BftResult<()> {
    if seal.len() != SIGNATURE_LENGTH {
        return Err(BftError::InvalidSignatureLength);
    }

    let mut extra = extract(header)?;
    extra.seal = Bytes::copy_from_slice(seal);
    replace_tail(header, &extra);
    Ok(())
}

/// Write the committed seals into a header's extra field.
pub fn write_committed_seals(header: &mut Header, seals: &[Bytes]) -> BftResult<()> {
    if seals.is_empty() {
        return Err(BftError::InvalidCommittedSeals);
    }
    if seals.iter().any(|seal| seal.len() != SIGNATURE_LENGTH) {
        return Err(BftError::InvalidCommittedSeals);
    }

    let mut extra = extract(header)?;
    extra.committed_seals = seals.to_vec();
    replace_tail(header, &extra);
    Ok(())
}

/// Copy of a header with its consensus seals filtered out of the extra
/// field. With `keep_seal` the proposer seal survives (the block-hash form);
/// without it both seal fields are cleared (the signing form).
pub fn filtered_header(header: &Header, keep_seal: bool) -> BftResult<Header> {
    let mut extra = extract(header)?;
    if !keep_seal {
        extra.seal = Bytes::new();
    }
    extra.committed_seals = Vec::new();

    let mut filtered = header.clone();
    replace_tail(&mut filtered, &extra);
    Ok(filtered)
}

/// Hash signed by the proposer: the header with both seal fields cleared.
///
/// Writing either kind of seal never changes this value.
pub fn sig_hash(header: &Header) -> BftResult<B256> {
    let filtered = filtered_header(header, false)?;
    Ok(keccak256(alloy_rlp::encode(&filtered)))
}

/// Recover the proposer that sealed a header.
pub fn recover_proposer(header: &Header) -> BftResult<Address> {
    let extra = extract(header)?;
    if extra.seal.is_empty() {
        return Err(BftError::InvalidSignature);
    }
    crypto::recover_signer(sig_hash(header)?, &extra.seal)
}

/// Signing domain of a committed seal: `Keccak256(block_hash || 0x02)`.
pub fn commit_digest(block_hash: B256) -> B256 {
    let mut buf = [0u8; 33];
    buf[..32].copy_from_slice(block_hash.as_slice());
    buf[32] = COMMIT_MSG_CODE;
    keccak256(buf)
}

fn replace_tail(header: &mut Header, extra: &BftExtra) {
    let mut out = header.extra[..VANITY_LENGTH].to_vec();
    out.extend_from_slice(&alloy_rlp::encode(extra));
    header.extra = out.into();
}
