//! The sign/verify collaborator.
//!
//! Key material crosses this boundary as opaque strings: secret keys are
//! base64-encoded ed25519 seeds, public keys are hex-encoded verifying keys,
//! signatures are base64. The rest of the crate never looks inside them.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;

use crate::core::error::ChainError;

/// Generate a fresh keypair as `(private_key, public_key)` strings.
pub fn generate_keypair() -> (String, String) {
    let sk = SigningKey::generate(&mut OsRng);
    let vk = sk.verifying_key();
    (B64.encode(sk.to_bytes()), hex::encode(vk.to_bytes()))
}

/// Derive the public key string for a private key string.
pub fn public_key_of(private_key: &str) -> Result<String, ChainError> {
    let sk = decode_signing_key(private_key)?;
    Ok(hex::encode(sk.verifying_key().to_bytes()))
}

/// Sign `message`, returning the signature string.
pub fn sign(message: &[u8], private_key: &str) -> Result<String, ChainError> {
    let sk = decode_signing_key(private_key)?;
    let sig: Signature = sk.sign(message);
    Ok(B64.encode(sig.to_bytes()))
}

/// Verify `signature` over `message` against `public_key`.
///
/// Any failure (undecodable key or signature, failed check) is `false`;
/// verification never errors.
pub fn verify(message: &[u8], signature: &str, public_key: &str) -> bool {
    let Some(vk) = decode_verifying_key(public_key) else {
        return false;
    };
    let Ok(sig_bytes) = B64.decode(signature) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(&sig_bytes) else {
        return false;
    };
    vk.verify_strict(message, &sig).is_ok()
}

fn decode_signing_key(private_key: &str) -> Result<SigningKey, ChainError> {
    let bytes = B64
        .decode(private_key)
        .map_err(|e| ChainError::Signing(e.to_string()))?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| ChainError::Signing("private key must be 32 bytes (base64)".into()))?;
    Ok(SigningKey::from_bytes(&arr))
}

fn decode_verifying_key(public_key: &str) -> Option<VerifyingKey> {
    let bytes = hex::decode(public_key).ok()?;
    let arr: [u8; 32] = bytes.try_into().ok()?;
    VerifyingKey::from_bytes(&arr).ok()
}
