//! End-to-end encryption primitives for the paired-device channel.
//!
//! ECDH over P-256 establishes a shared secret; HKDF-SHA256 (salted with the
//! pairing code) derives a 256-bit AES-GCM key; AES-256-GCM with a random
//! 12-byte IV per message provides confidentiality and integrity. Replay
//! protection rides on a strictly increasing `seq` carried alongside each
//! frame, independent of the AEAD nonce.

use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit};
use base64::{engine::general_purpose::STANDARD, Engine};
use hkdf::Hkdf;
use p256::ecdh::diffie_hellman;
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::{EncodedPoint, PublicKey, SecretKey};
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use thiserror::Error;

/// Fixed HKDF info label. Both endpoints MUST agree on this exact string for
/// wire interop — it is not a secret, just a domain separator.
const HKDF_INFO: &[u8] = b"claude-studio-e2ee";

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid peer public key")]
    InvalidPublicKey,
    #[error("hkdf expand failed")]
    KeyDerivation,
    #[error("malformed payload: {0}")]
    Format(String),
    #[error("message replayed or out of order (seq {seq} <= last {last})")]
    ReplayRejected { seq: i64, last: i64 },
    #[error("authentication failed — ciphertext tampered or keys desynced")]
    AuthFailed,
}

/// A local ECDH keypair. `public_hex` is the uncompressed SEC1 point
/// (`0x04 || X || Y`), hex-encoded — the form exchanged on the wire.
pub struct KeyPair {
    secret: SecretKey,
    pub public_hex: String,
}

/// Generates a fresh P-256 keypair for a pairing attempt.
pub fn generate_keypair() -> KeyPair {
    let secret = SecretKey::random(&mut OsRng);
    let public = secret.public_key();
    let public_hex = hex::encode(public.to_encoded_point(false).as_bytes());
    KeyPair { secret, public_hex }
}

/// A derived E2EE session between this endpoint and one peer device.
///
/// `outbound_seq` starts at 0 and increments on every `encrypt`.
/// `last_inbound_seq` starts at -1 so the first legitimate frame (seq 0)
/// is accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    derived_key: [u8; 32],
    pub outbound_seq: u64,
    pub last_inbound_seq: i64,
}

impl Session {
    /// Reconstructs a session from persisted state (hex key + counters).
    pub fn from_parts(derived_key_hex: &str, outbound_seq: u64, last_inbound_seq: i64) -> Result<Self, CryptoError> {
        let bytes = hex::decode(derived_key_hex)
            .map_err(|e| CryptoError::Format(e.to_string()))?;
        let derived_key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::Format("derived key must be 32 bytes".into()))?;
        Ok(Self {
            derived_key,
            outbound_seq,
            last_inbound_seq,
        })
    }

    pub fn derived_key_hex(&self) -> String {
        hex::encode(self.derived_key)
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new_from_slice(&self.derived_key).expect("key is exactly 32 bytes")
    }

    /// Encrypts `plaintext`, drawing a fresh random IV, and returns
    /// (base64(IV || ciphertext || tag), seq). Increments `outbound_seq`.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<(String, u64), CryptoError> {
        let mut iv = [0u8; 12];
        OsRng.fill_bytes(&mut iv);
        let nonce = aes_gcm::Nonce::from_slice(&iv);
        let ciphertext = self
            .cipher()
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::AuthFailed)?;

        let mut framed = Vec::with_capacity(12 + ciphertext.len());
        framed.extend_from_slice(&iv);
        framed.extend_from_slice(&ciphertext);

        let seq = self.outbound_seq;
        self.outbound_seq += 1;
        Ok((STANDARD.encode(framed), seq))
    }

    /// Decrypts `payload` if `seq` is strictly greater than the last
    /// accepted inbound sequence number. On success, advances
    /// `last_inbound_seq` to `seq`.
    pub fn decrypt(&mut self, payload: &str, seq: i64) -> Result<Vec<u8>, CryptoError> {
        if seq <= self.last_inbound_seq {
            return Err(CryptoError::ReplayRejected {
                seq,
                last: self.last_inbound_seq,
            });
        }

        let framed = STANDARD
            .decode(payload)
            .map_err(|e| CryptoError::Format(e.to_string()))?;
        if framed.len() < 12 + 16 {
            return Err(CryptoError::Format("payload too short".into()));
        }
        let (iv, body) = framed.split_at(12);
        let nonce = aes_gcm::Nonce::from_slice(iv);

        let plaintext = self
            .cipher()
            .decrypt(nonce, body)
            .map_err(|_| CryptoError::AuthFailed)?;

        self.last_inbound_seq = seq;
        Ok(plaintext)
    }
}

/// Runs ECDH(local_secret, peer_public) -> X-coordinate -> HKDF-SHA256(salt =
/// pairing code, info = the fixed label) -> 32-byte AES key, and builds a
/// fresh `Session` with counters at their initial values.
pub fn derive_session(
    local: &KeyPair,
    peer_public_hex: &str,
    pairing_code: &str,
) -> Result<Session, CryptoError> {
    let peer_bytes = hex::decode(peer_public_hex).map_err(|_| CryptoError::InvalidPublicKey)?;
    let encoded = EncodedPoint::from_bytes(&peer_bytes).map_err(|_| CryptoError::InvalidPublicKey)?;
    let peer_public = Option::<PublicKey>::from(PublicKey::from_encoded_point(&encoded))
        .ok_or(CryptoError::InvalidPublicKey)?;

    let shared = diffie_hellman(
        local.secret.to_nonzero_scalar(),
        peer_public.as_affine(),
    );
    // raw_secret_bytes() is the X-coordinate of the shared point, 32 bytes.
    let shared_x = shared.raw_secret_bytes();

    let hk = Hkdf::<Sha256>::new(Some(pairing_code.as_bytes()), shared_x.as_slice());
    let mut derived_key = [0u8; 32];
    hk.expand(HKDF_INFO, &mut derived_key)
        .map_err(|_| CryptoError::KeyDerivation)?;

    Ok(Session {
        derived_key,
        outbound_seq: 0,
        last_inbound_seq: -1,
    })
}
