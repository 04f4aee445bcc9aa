use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use ed25519_dalek::{Keypair, PublicKey, Signature, Signer, Verifier};
use rand::rngs::OsRng;
use rand::RngCore;
use sha3::{Digest, Sha3_256};

use crate::errors::{IndexerError, IndexerResult};

pub const ADDRESS_PREFIX: &str = "boa";

/// SHA3-256 over a single byte string.
pub fn hash_full(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA3-256 over several parts, each guarded by a little-endian length
/// prefix so part boundaries cannot be forged.
pub fn hash_multi(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    hasher.finalize().into()
}

pub fn generate_keypair() -> Keypair {
    Keypair::generate(&mut OsRng)
}

pub fn address_from_public_key(public_key: &PublicKey) -> String {
    format!("{ADDRESS_PREFIX}{}", hex::encode(public_key.as_bytes()))
}

pub fn public_key_from_address(address: &str) -> IndexerResult<PublicKey> {
    let encoded = address
        .strip_prefix(ADDRESS_PREFIX)
        .ok_or_else(|| IndexerError::Crypto(format!("invalid address prefix: {address}")))?;
    let bytes = hex::decode(encoded)
        .map_err(|err| IndexerError::Crypto(format!("invalid address encoding: {err}")))?;
    PublicKey::from_bytes(&bytes)
        .map_err(|err| IndexerError::Crypto(format!("invalid address key bytes: {err}")))
}

pub fn sign_message(keypair: &Keypair, message: &[u8]) -> Signature {
    keypair.sign(message)
}

pub fn verify_signature(
    public_key: &PublicKey,
    message: &[u8],
    signature: &Signature,
) -> IndexerResult<()> {
    public_key
        .verify(message, signature)
        .map_err(|err| IndexerError::Crypto(format!("signature verification failed: {err}")))
}

pub fn signature_from_hex(data: &str) -> IndexerResult<Signature> {
    let bytes = hex::decode(data)
        .map_err(|err| IndexerError::Crypto(format!("invalid signature encoding: {err}")))?;
    Signature::from_bytes(&bytes)
        .map_err(|err| IndexerError::Crypto(format!("invalid signature bytes: {err}")))
}

pub fn signature_to_hex(signature: &Signature) -> String {
    hex::encode(signature.to_bytes())
}

/// Derives the symmetric key that seals a ballot: the first input is the
/// voter's pre-image at the end of the voting window mixed with the
/// application name, the second binds the key to one proposal.
pub fn encrypt_key_derive(seed: &[u8; 32], proposal_id: &str) -> [u8; 32] {
    hash_multi(&[seed, proposal_id.as_bytes()])
}

/// AES-256-GCM seal; output is `nonce (12 bytes) || ciphertext`.
pub fn seal_ballot(key: &[u8; 32], plaintext: &[u8]) -> IndexerResult<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|err| IndexerError::Crypto(format!("ballot key init failed: {err}")))?;
    let mut nonce_bytes = [0u8; 12];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|err| IndexerError::Crypto(format!("ballot seal failed: {err}")))?;
    let mut out = Vec::with_capacity(12 + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Reverses [`seal_ballot`]; fails on a truncated envelope or a key mismatch.
pub fn open_ballot(key: &[u8; 32], blob: &[u8]) -> IndexerResult<Vec<u8>> {
    if blob.len() < 12 {
        return Err(IndexerError::Crypto("ballot envelope too short".into()));
    }
    let (nonce_bytes, ciphertext) = blob.split_at(12);
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|err| IndexerError::Crypto(format!("ballot key init failed: {err}")))?;
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|err| IndexerError::Crypto(format!("ballot open failed: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_multi_is_sensitive_to_part_boundaries() {
        let joined = hash_multi(&[b"ab", b"c"]);
        let split = hash_multi(&[b"a", b"bc"]);
        assert_ne!(joined, split);
    }

    #[test]
    fn address_round_trips_public_key() {
        let keypair = generate_keypair();
        let address = address_from_public_key(&keypair.public);
        assert!(address.starts_with(ADDRESS_PREFIX));
        let recovered = public_key_from_address(&address).expect("recover key");
        assert_eq!(recovered.as_bytes(), keypair.public.as_bytes());
    }

    #[test]
    fn sealed_ballot_opens_only_with_the_right_key() {
        let key = encrypt_key_derive(&[7u8; 32], "469008972006");
        let sealed = seal_ballot(&key, &[0u8]).expect("seal");
        assert_eq!(open_ballot(&key, &sealed).expect("open"), vec![0u8]);

        let wrong = encrypt_key_derive(&[8u8; 32], "469008972006");
        assert!(open_ballot(&wrong, &sealed).is_err());
    }
}
