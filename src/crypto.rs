//! ECDH key agreement and AES-256-GCM envelope used for pairing and all
//! post-pairing WebSocket traffic.
//!
//! # Wire format
//!
//! Every encrypted envelope (stored on disk or sent over the wire) is:
//! ```json
//! { "iv": "<base64, 12 bytes>", "ct": "<base64>", "tag": "<base64, 16 bytes>" }
//! ```
//!
//! `iv`/`ct`/`tag` are kept as separate fields (rather than one combined
//! ciphertext blob) to match the client-side contract; internally we still
//! call into `aes_gcm`, whose `encrypt()` appends the tag to the ciphertext,
//! and split it back out on the way to the envelope.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;

/// An AES-256-GCM envelope as exchanged over the wire or persisted to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub iv: String,
    pub ct: String,
    pub tag: String,
}

/// A long-term (server identity) or ephemeral (pairing) P-256 key pair,
/// base64-encoded for storage and transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyPairB64 {
    pub private_key: String,
    pub public_key: String,
}

/// Generate a new P-256 key pair, both halves base64-encoded (SEC1 for the
/// public key, raw scalar for the private key).
pub fn generate_key_pair() -> KeyPairB64 {
    let secret = SecretKey::random(&mut rand_core::OsRng);
    let public = secret.public_key();
    KeyPairB64 {
        private_key: BASE64.encode(secret.to_bytes()),
        public_key: BASE64.encode(public.to_encoded_point(false).as_bytes()),
    }
}

/// Derive the 32-byte shared secret for a pairing: `SHA-256(x-coordinate of
/// the ECDH point)`. Both sides reach the same bytes without needing an HKDF
/// info string, because the hash is fixed.
pub fn derive_shared_secret(private_key_b64: &str, peer_public_key_b64: &str) -> Result<[u8; 32]> {
    let private_bytes =
        Zeroizing::new(BASE64.decode(private_key_b64).context("invalid private key encoding")?);
    let secret = SecretKey::from_slice(&private_bytes).context("invalid private key")?;

    let public_bytes = BASE64
        .decode(peer_public_key_b64)
        .context("invalid peer public key encoding")?;
    let peer_public = PublicKey::from_sec1_bytes(&public_bytes).context("invalid peer public key")?;

    let shared = p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), peer_public.as_affine());

    let mut hasher = Sha256::new();
    hasher.update(shared.raw_secret_bytes());
    let digest = hasher.finalize();

    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    Ok(out)
}

/// Generate an ephemeral P-256 key pair for a one-off ECDH agreement, used by
/// tests and anywhere a throwaway peer identity is needed.
pub fn generate_ephemeral() -> (EphemeralSecret, String) {
    let secret = EphemeralSecret::random(&mut rand_core::OsRng);
    let public_b64 = BASE64.encode(secret.public_key().to_encoded_point(false).as_bytes());
    (secret, public_b64)
}

/// Encrypt `plaintext` under `key` with a random 12-byte nonce and empty AAD.
pub fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> Result<Envelope> {
    let cipher = Aes256Gcm::new_from_slice(key).context("invalid key length")?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let mut combined = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| anyhow::anyhow!("encryption failed: {e}"))?;

    anyhow::ensure!(combined.len() >= TAG_SIZE, "ciphertext shorter than GCM tag");
    let tag = combined.split_off(combined.len() - TAG_SIZE);

    Ok(Envelope {
        iv: BASE64.encode(nonce_bytes),
        ct: BASE64.encode(combined),
        tag: BASE64.encode(tag),
    })
}

/// Decrypt an envelope under `key`. Any tampering with `iv`, `ct`, or `tag`,
/// or a wrong key, must fail — callers treat this as `AuthFailure` /
/// `DecryptionFailure` and must not leak which part was wrong.
pub fn decrypt(key: &[u8; 32], envelope: &Envelope) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key).context("invalid key length")?;

    let nonce_bytes = BASE64.decode(&envelope.iv).context("invalid iv encoding")?;
    anyhow::ensure!(nonce_bytes.len() == NONCE_SIZE, "invalid iv length");
    let nonce = Nonce::from_slice(&nonce_bytes);

    let mut combined = BASE64.decode(&envelope.ct).context("invalid ct encoding")?;
    let tag = BASE64.decode(&envelope.tag).context("invalid tag encoding")?;
    anyhow::ensure!(tag.len() == TAG_SIZE, "invalid tag length");
    combined.extend_from_slice(&tag);

    cipher
        .decrypt(nonce, combined.as_ref())
        .map_err(|_| anyhow::anyhow!("decryption failed"))
}
