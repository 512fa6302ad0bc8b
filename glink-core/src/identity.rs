//! Node identity and crypto: Ed25519 certificates, X25519 agreement, chunked AEAD.
//!
//! A single 32-byte seed backs both the Ed25519 signing key and the X25519
//! agreement secret. Reusing one scalar for signing and key agreement is a
//! known weakness of the protocol; it is kept so that certificates and public
//! keys stay interoperable between peers.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::codec::fixed_bytes;

/// Largest plaintext slice sealed as one AEAD chunk.
pub const ENCRYPT_CHUNK_SIZE: usize = 300;
/// Random nonce prefixed to every sealed chunk.
pub const NONCE_SIZE: usize = 12;
/// Poly1305 authentication tag appended to every sealed chunk.
pub const TAG_SIZE: usize = 16;
/// Size of one full sealed chunk on the wire.
pub const DECRYPT_CHUNK_SIZE: usize = ENCRYPT_CHUNK_SIZE + NONCE_SIZE + TAG_SIZE;
/// Ed25519 signature length.
pub const SIGNATURE_SIZE: usize = 64;

const SESSION_DOMAIN: &[u8] = b"glink-session-v1";

/// Stable node identity: the Ed25519 verifying key. Also verifies signatures.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Certificate([u8; 32]);

/// X25519 public value used for key agreement.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey([u8; 32]);

macro_rules! base64_key {
    ($name:ident) => {
        impl $name {
            pub fn from_bytes(bytes: [u8; 32]) -> Self {
                $name(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&STANDARD.encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self)
            }
        }

        impl FromStr for $name {
            type Err = IdentityError;

            fn from_str(s: &str) -> Result<Self, IdentityError> {
                decode_base64::<32>(s).map($name)
            }
        }
    };
}

base64_key!(Certificate);
base64_key!(PublicKey);

impl Certificate {
    /// Check an Ed25519 signature. Any malformed key or signature is simply `false`.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify(message, &signature).is_ok()
    }
}

/// Self-description a client presents in the handshake: certificate ‖ public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerKey(#[serde(with = "fixed_bytes")] [u8; 64]);

impl PeerKey {
    pub fn new(certificate: &Certificate, public: &PublicKey) -> Self {
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(certificate.as_bytes());
        out[32..].copy_from_slice(public.as_bytes());
        PeerKey(out)
    }

    pub fn certificate(&self) -> Certificate {
        let mut id = [0u8; 32];
        id.copy_from_slice(&self.0[..32]);
        Certificate(id)
    }

    pub fn public(&self) -> PublicKey {
        let mut key = [0u8; 32];
        key.copy_from_slice(&self.0[32..]);
        PublicKey(key)
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl fmt::Debug for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerKey({})", self.certificate())
    }
}

/// Private identity of one endpoint. Keep it private; share the certificate and public key.
pub struct Identity {
    signing: SigningKey,
    agreement: StaticSecret,
}

impl Identity {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        Self::from_signing(SigningKey::generate(&mut OsRng))
    }

    fn from_signing(signing: SigningKey) -> Self {
        let agreement = StaticSecret::from(signing.to_bytes());
        Self { signing, agreement }
    }

    /// Restore from the 64-byte secret (seed ‖ verifying key). Rejects a mismatched pair.
    pub fn from_bytes(bytes: &[u8; 64]) -> Result<Self, IdentityError> {
        let signing =
            SigningKey::from_keypair_bytes(bytes).map_err(|_| IdentityError::KeyMismatch)?;
        Ok(Self::from_signing(signing))
    }

    /// The 64-byte secret value.
    pub fn to_bytes(&self) -> [u8; 64] {
        self.signing.to_keypair_bytes()
    }

    pub fn from_base64(s: &str) -> Result<Self, IdentityError> {
        Self::from_bytes(&decode_base64::<64>(s)?)
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.to_bytes())
    }

    pub fn certificate(&self) -> Certificate {
        Certificate(self.signing.verifying_key().to_bytes())
    }

    /// X25519 public value, derived from the signing seed by base point multiplication.
    pub fn public(&self) -> PublicKey {
        PublicKey(X25519PublicKey::from(&self.agreement).to_bytes())
    }

    pub fn peer_key(&self) -> PeerKey {
        PeerKey::new(&self.certificate(), &self.public())
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_bytes().to_vec()
    }

    /// Diffie-Hellman shared secret with a peer's public value.
    pub fn shared_secret(&self, peer: &PublicKey) -> [u8; 32] {
        let other = X25519PublicKey::from(peer.0);
        self.agreement.diffie_hellman(&other).to_bytes()
    }

    /// Symmetric session with a peer. Both sides derive the same key.
    pub fn session(&self, peer: &PublicKey) -> SessionKey {
        SessionKey::derive(&self.shared_secret(peer))
    }

    pub fn encrypt(&self, peer: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.session(peer).encrypt(plaintext)
    }

    pub fn decrypt(&self, peer: &PublicKey, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.session(peer).decrypt(ciphertext)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.certificate())
    }
}

/// ChaCha20-Poly1305 key shared by two peers.
#[derive(Clone)]
pub struct SessionKey([u8; 32]);

impl SessionKey {
    /// Derive the session key from a DH shared secret.
    pub fn derive(shared_secret: &[u8; 32]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(SESSION_DOMAIN);
        hasher.update(shared_secret);
        SessionKey(hasher.finalize().into())
    }

    /// Seal `plaintext` in chunks of at most [`ENCRYPT_CHUNK_SIZE`] bytes, each as
    /// nonce ‖ ciphertext ‖ tag. Empty input still yields one authenticated chunk.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.0));
        let chunks = plaintext.len() / ENCRYPT_CHUNK_SIZE + 1;
        let mut out = Vec::with_capacity(plaintext.len() + chunks * (NONCE_SIZE + TAG_SIZE));
        if plaintext.is_empty() {
            seal_chunk(&cipher, &[], &mut out)?;
        }
        for chunk in plaintext.chunks(ENCRYPT_CHUNK_SIZE) {
            seal_chunk(&cipher, chunk, &mut out)?;
        }
        Ok(out)
    }

    /// Open every [`DECRYPT_CHUNK_SIZE`] chunk. Fails as a whole on any bad chunk.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.is_empty() {
            return Err(CryptoError::Malformed);
        }
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.0));
        let mut out = Vec::with_capacity(ciphertext.len());
        for chunk in ciphertext.chunks(DECRYPT_CHUNK_SIZE) {
            if chunk.len() < NONCE_SIZE + TAG_SIZE {
                return Err(CryptoError::Malformed);
            }
            let (nonce, body) = chunk.split_at(NONCE_SIZE);
            let plain = cipher
                .decrypt(Nonce::from_slice(nonce), body)
                .map_err(|_| CryptoError::Decrypt)?;
            out.extend_from_slice(&plain);
        }
        Ok(out)
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

fn seal_chunk(cipher: &ChaCha20Poly1305, chunk: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError> {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), chunk)
        .map_err(|_| CryptoError::Encrypt)?;
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(())
}

fn decode_base64<const N: usize>(s: &str) -> Result<[u8; N], IdentityError> {
    let data = STANDARD.decode(s.trim())?;
    data.as_slice()
        .try_into()
        .map_err(|_| IdentityError::Length {
            expected: N,
            actual: data.len(),
        })
}

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("malformed ciphertext")]
    Malformed,
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
    #[error("secret key does not match its public half")]
    KeyMismatch,
}
