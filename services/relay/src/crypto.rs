//! Crypto gate: decryption and signature verification of inbound events
//!
//! Every body posted by a debugged process passes through [`CryptoGate::open`]
//! before it can reach the broadcast channel. With no keys configured the
//! gate is the identity function.
//!
//! # Envelope
//! ```text
//! base64( nonce[12] ++ ciphertext ++ tag[16] )   AES-256-GCM
//! ```
//! The `X-Signature` header carries a base64 ed25519 signature over the
//! decrypted form fields, canonicalized by [`signed_message`].

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey};
use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use thiserror::Error;

/// Symmetric key length in bytes (AES-256).
pub const SYMMETRIC_KEY_LEN: usize = 32;

/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// AES-GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

/// Request header carrying the body signature.
pub const SIGNATURE_HEADER: &str = "x-signature";

// ── Errors ──────────────────────────────────────────────────────────

/// Startup-time key loading failures. Always fatal.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("failed to read key file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("key file {} is not an ed25519 public or private key in PEM form", .path.display())]
    InvalidPem { path: PathBuf },

    #[error("failed to encode signing key: {0}")]
    Encode(String),
}

/// Per-message rejection. The event is dropped; the process keeps running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("missing signature")]
    MissingSignature,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("malformed signature")]
    MalformedSignature,

    #[error("malformed envelope")]
    MalformedEnvelope,

    #[error("decryption failed")]
    DecryptionFailed,
}

impl Rejection {
    /// Whether the rejection is an authenticity failure rather than a
    /// confidentiality/envelope failure.
    pub fn is_authentication(&self) -> bool {
        matches!(self, Rejection::MissingSignature | Rejection::InvalidSignature)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::MissingSignature => "missing_signature",
            Rejection::InvalidSignature => "invalid_signature",
            Rejection::MalformedSignature => "malformed_signature",
            Rejection::MalformedEnvelope => "malformed_envelope",
            Rejection::DecryptionFailed => "decryption_failed",
        }
    }
}

/// Errors from [`CryptoGate::seal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SealError {
    #[error("no symmetric key configured")]
    NoKey,

    #[error("encryption failed")]
    Encryption,
}

// ── Keys ────────────────────────────────────────────────────────────

/// 32-byte AES-256 key. Debug output never shows the key material.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey([u8; SYMMETRIC_KEY_LEN]);

impl SymmetricKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let key: [u8; SYMMETRIC_KEY_LEN] =
            bytes.try_into().map_err(|_| KeyError::InvalidLength {
                expected: SYMMETRIC_KEY_LEN,
                actual: bytes.len(),
            })?;
        Ok(Self(key))
    }

    /// Fresh random key from the OS generator.
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        let mut bytes = [0u8; SYMMETRIC_KEY_LEN];
        bytes.copy_from_slice(&key);
        Self(bytes)
    }

    /// Load a key file holding either base64 text or 32 raw bytes.
    pub fn load(path: &Path) -> Result<Self, KeyError> {
        let data = std::fs::read(path).map_err(|source| KeyError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let text = String::from_utf8_lossy(&data);
        match BASE64_STANDARD.decode(text.trim()) {
            Ok(decoded) => Self::from_bytes(&decoded),
            Err(_) => Self::from_bytes(&data),
        }
    }

    pub fn to_base64(&self) -> String {
        BASE64_STANDARD.encode(self.0)
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// Load an ed25519 verifying key from a PEM file.
///
/// Accepts a public key (SPKI) directly. A private key (PKCS#8) is also
/// accepted and reduced to its public half; the relay never keeps it.
pub fn load_verifying_key(path: &Path) -> Result<VerifyingKey, KeyError> {
    let pem = std::fs::read_to_string(path).map_err(|source| KeyError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    if let Ok(key) = VerifyingKey::from_public_key_pem(pem.trim()) {
        return Ok(key);
    }
    SigningKey::from_pkcs8_pem(pem.trim())
        .map(|signing| signing.verifying_key())
        .map_err(|_| KeyError::InvalidPem {
            path: path.to_path_buf(),
        })
}

/// Fresh ed25519 signing key for a debugged process to sign with.
pub fn generate_signing_key() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

/// PKCS#8 PEM encoding of a signing key, for the startup banner.
pub fn signing_key_pem(key: &SigningKey) -> Result<String, KeyError> {
    key.to_pkcs8_pem(LineEnding::LF)
        .map(|pem| pem.trim().to_string())
        .map_err(|e| KeyError::Encode(e.to_string()))
}

/// Process-wide key material, immutable after startup.
#[derive(Debug, Clone, Default)]
pub struct CryptoConfig {
    pub symmetric_key: Option<SymmetricKey>,
    pub verifying_key: Option<VerifyingKey>,
}

// ── Gate ────────────────────────────────────────────────────────────

/// Decoded form fields in arrival order.
pub type FormPairs = Vec<(String, String)>;

/// Decode an `application/x-www-form-urlencoded` byte string.
pub fn parse_form(bytes: &[u8]) -> FormPairs {
    url::form_urlencoded::parse(bytes).into_owned().collect()
}

/// The bytes a client signs for a form: every distinct key in byte order,
/// each followed by its first value, with no separators.
///
/// `file_line=7&body=hello` signs as `bodyhellofile_line7`.
pub fn signed_message(pairs: &[(String, String)]) -> Vec<u8> {
    let mut first: BTreeMap<&str, &str> = BTreeMap::new();
    for (key, value) in pairs {
        first.entry(key.as_str()).or_insert(value.as_str());
    }
    let mut message = Vec::new();
    for (key, value) in first {
        message.extend_from_slice(key.as_bytes());
        message.extend_from_slice(value.as_bytes());
    }
    message
}

/// Decrypt+verify boundary guarding the broadcast stream.
///
/// The signature is read from the header up front, so a missing or
/// undecodable signature rejects the request before any decryption. The
/// check itself runs over the decrypted form, and nothing is returned
/// unless both steps pass.
#[derive(Clone)]
pub struct CryptoGate {
    cipher: Option<Aes256Gcm>,
    verifying_key: Option<VerifyingKey>,
}

impl CryptoGate {
    pub fn new(config: &CryptoConfig) -> Self {
        Self {
            cipher: config
                .symmetric_key
                .as_ref()
                .map(|key| Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0))),
            verifying_key: config.verifying_key,
        }
    }

    /// Gate with no keys; `open` returns its input.
    pub fn passthrough() -> Self {
        Self::new(&CryptoConfig::default())
    }

    pub fn is_decrypting(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn is_verifying(&self) -> bool {
        self.verifying_key.is_some()
    }

    /// Verify and decrypt one inbound payload, returning the plaintext form.
    ///
    /// `signature` is the raw `X-Signature` header value, if any.
    pub fn open(&self, raw: &[u8], signature: Option<&str>) -> Result<Vec<u8>, Rejection> {
        let signature = self.signature(signature)?;
        let plaintext = self.decrypt(raw)?;
        if let Some(signature) = &signature {
            self.check(signature, &parse_form(&plaintext))?;
        }
        Ok(plaintext)
    }

    /// Like [`open`](Self::open), but returns the decoded fields. `query`
    /// fields follow the body fields and are covered by the signature.
    pub fn open_form(
        &self,
        raw: &[u8],
        query: Option<&str>,
        signature: Option<&str>,
    ) -> Result<FormPairs, Rejection> {
        let signature = self.signature(signature)?;
        let plaintext = self.decrypt(raw)?;
        let mut pairs = parse_form(&plaintext);
        if let Some(query) = query {
            pairs.extend(parse_form(query.as_bytes()));
        }
        if let Some(signature) = &signature {
            self.check(signature, &pairs)?;
        }
        Ok(pairs)
    }

    /// Verify a bodiless request whose fields are already decoded.
    pub fn verify_form(
        &self,
        pairs: &[(String, String)],
        signature: Option<&str>,
    ) -> Result<(), Rejection> {
        match self.signature(signature)? {
            Some(signature) => self.check(&signature, pairs),
            None => Ok(()),
        }
    }

    /// Encrypt `plaintext` into a base64 envelope that `open` accepts.
    pub fn seal(&self, plaintext: &[u8]) -> Result<String, SealError> {
        let cipher = self.cipher.as_ref().ok_or(SealError::NoKey)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| SealError::Encryption)?;

        let mut envelope = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        envelope.extend_from_slice(&nonce);
        envelope.extend_from_slice(&ciphertext);
        Ok(BASE64_STANDARD.encode(envelope))
    }

    /// Decode the signature header. `None` when verification is off.
    fn signature(&self, header: Option<&str>) -> Result<Option<Signature>, Rejection> {
        if self.verifying_key.is_none() {
            return Ok(None);
        }
        let encoded = header
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(Rejection::MissingSignature)?;
        let bytes = BASE64_STANDARD
            .decode(encoded)
            .map_err(|_| Rejection::MalformedSignature)?;
        Signature::from_slice(&bytes)
            .map(Some)
            .map_err(|_| Rejection::InvalidSignature)
    }

    fn check(&self, signature: &Signature, pairs: &[(String, String)]) -> Result<(), Rejection> {
        match &self.verifying_key {
            Some(key) => key
                .verify_strict(&signed_message(pairs), signature)
                .map_err(|_| Rejection::InvalidSignature),
            None => Ok(()),
        }
    }

    fn decrypt(&self, raw: &[u8]) -> Result<Vec<u8>, Rejection> {
        let Some(cipher) = &self.cipher else {
            return Ok(raw.to_vec());
        };
        let envelope = BASE64_STANDARD
            .decode(raw.trim_ascii())
            .map_err(|_| Rejection::MalformedEnvelope)?;
        if envelope.len() < NONCE_LEN + TAG_LEN {
            return Err(Rejection::MalformedEnvelope);
        }
        let (nonce, ciphertext) = envelope.split_at(NONCE_LEN);
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Rejection::DecryptionFailed)
    }
}

impl fmt::Debug for CryptoGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoGate")
            .field("decrypting", &self.is_decrypting())
            .field("verifying", &self.is_verifying())
            .finish()
    }
}
