//! secp256k1 signing helpers.
//!
//! Addresses are derived the EVM way: Keccak-256 of the uncompressed public
//! key, last 20 bytes. Signatures are 65 bytes, `r || s || v`.

use crate::error::{BftError, BftResult};
use alloy_primitives::{keccak256, Address, B256};
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, PublicKey, SecretKey, SECP256K1};

/// Length of a recoverable ECDSA signature in bytes.
pub const SIGNATURE_LENGTH: usize = 65;

/// Derive the 20-byte address for a public key.
pub fn pubkey_to_address(pubkey: &PublicKey) -> Address {
    let uncompressed = pubkey.serialize_uncompressed();
    // Skip the 0x04 SEC1 tag, hash the 64-byte point.
    let hash = keccak256(&uncompressed[1..]);
    Address::from_slice(&hash[12..])
}

/// Derive the address controlled by a secret key.
pub fn secret_to_address(secret: &SecretKey) -> Address {
    pubkey_to_address(&secret.public_key(SECP256K1))
}

/// Sign a 32-byte digest, producing a 65-byte recoverable signature.
pub fn sign_hash(secret: &SecretKey, hash: B256) -> [u8; SIGNATURE_LENGTH] {
    let message = Message::from_digest(hash.0);
    let signature = SECP256K1.sign_ecdsa_recoverable(&message, secret);
    let (recovery_id, compact) = signature.serialize_compact();

    let mut out = [0u8; SIGNATURE_LENGTH];
    out[..64].copy_from_slice(&compact);
    out[64] = recovery_id.to_i32() as u8;
    out
}

/// Recover the signer address of a 32-byte digest from a 65-byte signature.
pub fn recover_signer(hash: B256, signature: &[u8]) -> BftResult<Address> {
    if signature.len() != SIGNATURE_LENGTH {
        return Err(BftError::InvalidSignatureLength);
    }

    let recovery_id = RecoveryId::from_i32(signature[64] as i32)
        .map_err(|_| BftError::InvalidSignature)?;
    let recoverable = RecoverableSignature::from_compact(&signature[..64], recovery_id)
        .map_err(|_| BftError::InvalidSignature)?;

    let message = Message::from_digest(hash.0);
    let pubkey = SECP256K1
        .recover_ecdsa(&message, &recoverable)
        .map_err(|_| BftError::InvalidSignature)?;
    Ok(pubkey_to_address(&pubkey))
}
