//! Cryptographic envelope operations for Agent Chat
//!
//! Pure functions over envelope fields; no I/O beyond the one-time key load.
//! Every message is sealed with a per-message ephemeral X25519 agreement:
//! the AES-256-GCM key is the SHA-256 of the shared secret between the
//! sender's ephemeral key and the recipient's static agreement key. Sender
//! authenticity rides on an Ed25519 signature over the canonical 4-tuple
//! `ciphertext ":" ephemeralKey ":" nonce ":" plaintextHash` (base64 fields;
//! the hash slot is empty for legacy envelopes).

use crate::error::{CryptoError, Result};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use std::path::Path;
use x25519_dalek::{PublicKey as AgreementPublic, StaticSecret};

/// Local key material for one handle: an Ed25519 signing keypair and an
/// X25519 agreement keypair. Private halves are read once at startup and
/// held in memory; they are never written anywhere.
pub struct KeyMaterial {
    signing: SigningKey,
    agreement: StaticSecret,
}

impl KeyMaterial {
    /// Load from `<keys_dir>/<handle>.signing` and
    /// `<keys_dir>/<handle>.agreement` (base64-encoded 32-byte seeds).
    pub fn load(keys_dir: &Path, handle: &str) -> Result<Self> {
        let signing_seed = read_seed(&keys_dir.join(format!("{handle}.signing")))?;
        let agreement_seed = read_seed(&keys_dir.join(format!("{handle}.agreement")))?;
        Ok(Self::from_seeds(signing_seed, agreement_seed))
    }

    pub fn from_seeds(signing_seed: [u8; 32], agreement_seed: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&signing_seed),
            agreement: StaticSecret::from(agreement_seed),
        }
    }

    /// Sign an arbitrary payload string, base64 signature out. Used for the
    /// relay auth headers.
    pub fn sign(&self, payload: &str) -> String {
        STANDARD.encode(self.signing.sign(payload.as_bytes()).to_bytes())
    }

    /// Base64 public signing key, as registered with the relay.
    pub fn signing_public_b64(&self) -> String {
        STANDARD.encode(self.signing.verifying_key().to_bytes())
    }

    /// Base64 public agreement key, as registered with the relay.
    pub fn agreement_public_b64(&self) -> String {
        STANDARD.encode(AgreementPublic::from(&self.agreement).to_bytes())
    }

    /// Decrypt an envelope addressed to this handle.
    pub fn decrypt(
        &self,
        ciphertext_b64: &str,
        ephemeral_pub_b64: &str,
        nonce_b64: &str,
    ) -> Result<String> {
        let ciphertext = decode_field(ciphertext_b64, "ciphertext")?;
        let ephemeral: [u8; 32] = decode_field(ephemeral_pub_b64, "ephemeralKey")?
            .try_into()
            .map_err(|_| CryptoError::Decryption("ephemeral key is not 32 bytes".to_string()))?;
        let nonce_bytes = decode_field(nonce_b64, "nonce")?;
        if nonce_bytes.len() != 12 {
            return Err(CryptoError::Decryption("nonce is not 12 bytes".to_string()).into());
        }

        let shared = self.agreement.diffie_hellman(&AgreementPublic::from(ephemeral));
        let key_bytes = Sha256::digest(shared.as_bytes());
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key_bytes.as_slice()));

        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|e| CryptoError::Decryption(e.to_string()))?;

        String::from_utf8(plaintext).map_err(|e| CryptoError::Decryption(e.to_string()).into())
    }
}

fn read_seed(path: &Path) -> Result<[u8; 32]> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| CryptoError::KeyNotFound(format!("{}: {e}", path.display())))?;
    let bytes = STANDARD
        .decode(content.trim())
        .map_err(|e| CryptoError::InvalidKey(format!("{}: {e}", path.display())))?;
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey(format!("{}: seed is not 32 bytes", path.display())).into())
}

fn decode_field(value: &str, field: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(value)
        .map_err(|e| CryptoError::Decryption(format!("{field} is not valid base64: {e}")).into())
}

/// Canonical signature payload: the exact string concatenation
/// `ciphertext ":" ephemeralKey ":" nonce ":" plaintextHash`.
/// A missing hash verifies over the empty-hash form.
pub fn signature_payload(
    ciphertext: &str,
    ephemeral_key: &str,
    nonce: &str,
    plaintext_hash: Option<&str>,
) -> String {
    format!(
        "{ciphertext}:{ephemeral_key}:{nonce}:{}",
        plaintext_hash.unwrap_or("")
    )
}

/// Verify an envelope signature against the declared sender's signing key.
/// Returns `Ok(false)` on a well-formed signature that does not match;
/// malformed keys or signatures are typed errors.
pub fn verify_signature(payload: &str, sig_b64: &str, signer_pub_b64: &str) -> Result<bool> {
    let sig_bytes = STANDARD
        .decode(sig_b64)
        .map_err(|e| CryptoError::Verification(format!("signature is not valid base64: {e}")))?;
    let signature = Signature::from_slice(&sig_bytes)
        .map_err(|e| CryptoError::Verification(e.to_string()))?;

    let key_bytes: [u8; 32] = STANDARD
        .decode(signer_pub_b64)
        .map_err(|e| CryptoError::InvalidKey(format!("signing key is not valid base64: {e}")))?
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("signing key is not 32 bytes".to_string()))?;
    let key =
        VerifyingKey::from_bytes(&key_bytes).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

    Ok(key.verify(payload.as_bytes(), &signature).is_ok())
}

/// Base64 SHA-256 of the plaintext. Binds the ciphertext to the exact
/// decrypted bytes for the relay-side hash commitment.
pub fn hash_plaintext(plaintext: &str) -> String {
    STANDARD.encode(Sha256::digest(plaintext.as_bytes()))
}

/// Canonical auth payload for POST requests: `timestamp ":" body`.
pub fn post_auth_payload(timestamp: &str, body: &str) -> String {
    format!("{timestamp}:{body}")
}

/// Canonical auth payload for GET requests (and the streaming upgrade):
/// `"GET:" path ":" timestamp`.
pub fn get_auth_payload(path: &str, timestamp: &str) -> String {
    format!("GET:{path}:{timestamp}")
}

/// Seal a plaintext for a recipient's agreement key. The sending side of
/// the envelope contract; the daemon itself only opens envelopes, but the
/// library carries both halves so the construction is testable end to end.
pub fn seal_message(
    plaintext: &str,
    recipient_agreement_pub_b64: &str,
) -> Result<SealedMessage> {
    let recipient: [u8; 32] = STANDARD
        .decode(recipient_agreement_pub_b64)
        .map_err(|e| CryptoError::InvalidKey(format!("agreement key is not valid base64: {e}")))?
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("agreement key is not 32 bytes".to_string()))?;

    let ephemeral = StaticSecret::from(rand::random::<[u8; 32]>());
    let ephemeral_pub = AgreementPublic::from(&ephemeral);
    let nonce_bytes: [u8; 12] = rand::random();

    let shared = ephemeral.diffie_hellman(&AgreementPublic::from(recipient));
    let key_bytes = Sha256::digest(shared.as_bytes());
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key_bytes.as_slice()));

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    Ok(SealedMessage {
        ciphertext: STANDARD.encode(ciphertext),
        ephemeral_key: STANDARD.encode(ephemeral_pub.to_bytes()),
        nonce: STANDARD.encode(nonce_bytes),
        plaintext_hash: hash_plaintext(plaintext),
    })
}

/// Output of [`seal_message`], field-for-field what an envelope carries.
#[derive(Debug, Clone)]
pub struct SealedMessage {
    pub ciphertext: String,
    pub ephemeral_key: String,
    pub nonce: String,
    pub plaintext_hash: String,
}

impl SealedMessage {
    /// The canonical 4-tuple for this sealed message.
    pub fn signature_payload(&self) -> String {
        signature_payload(
            &self.ciphertext,
            &self.ephemeral_key,
            &self.nonce,
            Some(&self.plaintext_hash),
        )
    }
}
