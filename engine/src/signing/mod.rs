//! Embedded plugin signatures
//!
//! A signed entry binary carries its signature as a trailer appended to the
//! original content:
//!
//! ```text
//! content | signature block (JSON) | block length (u32 LE) | magic "BWSIG\0\x01\0"
//! ```
//!
//! The signature block holds the signer's certificate chain (leaf first) and
//! the leaf key's Ed25519 signature over `content`. Unsigned binaries simply
//! lack the trailer.
//!
//! Certificates are signed by their issuer over the canonical JSON of every
//! field except the signature. A certificate's thumbprint is the uppercase
//! hex SHA-256 of its full canonical JSON, signature included.
//!
//! # Examples
//!
//! ```
//! use bulwark_engine::signing::{self, Certificate};
//! use chrono::{Duration, Utc};
//! use ed25519_dalek::SigningKey;
//!
//! let root_key = SigningKey::from_bytes(&[1u8; 32]);
//! let root = Certificate::self_signed("1", "Bulwark Root", &root_key, Utc::now(), Duration::days(365)).unwrap();
//!
//! let signed = signing::sign_binary(b"plugin bytes", &root_key, vec![root.clone()]).unwrap();
//! let (content, block) = signing::extract(&signed).unwrap().unwrap();
//! assert_eq!(content, b"plugin bytes");
//! assert_eq!(block.leaf().unwrap().thumbprint(), root.thumbprint());
//! ```

pub mod chain;

pub use chain::{ChainError, ChainValidator, Ed25519ChainValidator, TrustRoot};

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Trailer magic marking a signed binary
pub const SIGNATURE_MAGIC: &[u8; 8] = b"BWSIG\x00\x01\x00";

/// Trailer length: block length field plus magic
const TRAILER_LEN: usize = 4 + SIGNATURE_MAGIC.len();

/// Upper bound on the signature block size
const MAX_BLOCK_LEN: usize = 1024 * 1024;

/// Errors while producing or parsing embedded signatures
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("Malformed signature block: {0}")]
    Malformed(String),

    #[error("Invalid key material: {0}")]
    Key(String),

    #[error("Content signature does not match signer")]
    BadSignature,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Signer identity certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub serial: String,
    pub subject: String,
    pub issuer: String,
    /// Ed25519 public key of the subject (hex)
    pub public_key: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// Whether the subject may issue certificates
    #[serde(default)]
    pub is_ca: bool,
    /// Issuer's Ed25519 signature over the to-be-signed fields (hex)
    pub signature: String,
}

/// Fields of a certificate before it is signed
#[derive(Debug, Clone)]
pub struct CertificateRequest {
    pub serial: String,
    pub subject: String,
    pub public_key: VerifyingKey,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub is_ca: bool,
}

impl Certificate {
    /// Issue a certificate for `request`, signed by `issuer_key` on behalf of `issuer`
    ///
    /// # Errors
    ///
    /// Returns an error if the validity window is empty.
    pub fn issue(
        request: CertificateRequest,
        issuer: &str,
        issuer_key: &SigningKey,
    ) -> Result<Self, SigningError> {
        if request.not_after <= request.not_before {
            return Err(SigningError::Malformed(format!(
                "certificate '{}' has an empty validity window",
                request.serial
            )));
        }

        let mut cert = Certificate {
            serial: request.serial,
            subject: request.subject,
            issuer: issuer.to_string(),
            public_key: hex::encode(request.public_key.to_bytes()),
            not_before: request.not_before,
            not_after: request.not_after,
            is_ca: request.is_ca,
            signature: String::new(),
        };
        let signature = issuer_key.sign(&cert.tbs_bytes());
        cert.signature = hex::encode(signature.to_bytes());
        Ok(cert)
    }

    /// Issue a self-signed certificate authority, typically a trust root
    pub fn self_signed(
        serial: &str,
        subject: &str,
        key: &SigningKey,
        not_before: DateTime<Utc>,
        validity: Duration,
    ) -> Result<Self, SigningError> {
        Self::issue(
            CertificateRequest {
                serial: serial.to_string(),
                subject: subject.to_string(),
                public_key: key.verifying_key(),
                not_before,
                not_after: not_before + validity,
                is_ca: true,
            },
            subject,
            key,
        )
    }

    /// Canonical JSON of the fields covered by the issuer's signature
    pub fn tbs_bytes(&self) -> Vec<u8> {
        self.canonical(false).into_bytes()
    }

    /// Uppercase hex SHA-256 of the full canonical certificate
    pub fn thumbprint(&self) -> String {
        let digest = Sha256::digest(self.canonical(true).as_bytes());
        hex::encode_upper(digest)
    }

    /// Decoded subject public key
    pub fn verifying_key(&self) -> Result<VerifyingKey, SigningError> {
        decode_verifying_key(&self.public_key)
    }

    /// Decoded issuer signature
    pub fn issuer_signature(&self) -> Result<Signature, SigningError> {
        decode_signature(&self.signature)
    }

    pub fn is_self_issued(&self) -> bool {
        self.subject == self.issuer
    }

    // serde_json's map keeps keys sorted, which makes the output canonical
    fn canonical(&self, with_signature: bool) -> String {
        let mut value = serde_json::json!({
            "serial": self.serial,
            "subject": self.subject,
            "issuer": self.issuer,
            "public_key": self.public_key.to_lowercase(),
            "not_before": self.not_before.to_rfc3339_opts(SecondsFormat::Secs, true),
            "not_after": self.not_after.to_rfc3339_opts(SecondsFormat::Secs, true),
            "is_ca": self.is_ca,
        });
        if with_signature {
            value["signature"] = serde_json::Value::String(self.signature.to_lowercase());
        }
        value.to_string()
    }
}

/// Certificate chain and content signature embedded in a binary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureBlock {
    /// Leaf certificate first, then intermediates
    pub certificates: Vec<Certificate>,
    /// Leaf key's signature over the content (hex)
    pub signature: String,
}

impl SignatureBlock {
    /// The signer's certificate
    pub fn leaf(&self) -> Option<&Certificate> {
        self.certificates.first()
    }

    /// Verify the content signature against the leaf certificate's key
    ///
    /// # Errors
    ///
    /// Returns `SigningError::Malformed` if the block has no certificates and
    /// `SigningError::BadSignature` if the signature does not cover `content`.
    pub fn verify_content(&self, content: &[u8]) -> Result<(), SigningError> {
        let leaf = self
            .leaf()
            .ok_or_else(|| SigningError::Malformed("no certificates".to_string()))?;
        let key = leaf.verifying_key()?;
        let signature = decode_signature(&self.signature)?;
        key.verify(content, &signature)
            .map_err(|_| SigningError::BadSignature)
    }
}

/// Append a signature trailer to `content`
///
/// `chain` must start with the certificate for `signer`.
///
/// # Errors
///
/// Returns an error if the chain is empty, the leaf does not belong to
/// `signer`, or the block cannot be serialized.
pub fn sign_binary(
    content: &[u8],
    signer: &SigningKey,
    chain: Vec<Certificate>,
) -> Result<Vec<u8>, SigningError> {
    let leaf = chain
        .first()
        .ok_or_else(|| SigningError::Malformed("empty certificate chain".to_string()))?;
    if leaf.verifying_key()? != signer.verifying_key() {
        return Err(SigningError::Key(format!(
            "leaf certificate '{}' does not belong to the signing key",
            leaf.serial
        )));
    }

    let block = SignatureBlock {
        signature: hex::encode(signer.sign(content).to_bytes()),
        certificates: chain,
    };
    let block_bytes = serde_json::to_vec(&block)?;
    let block_len = u32::try_from(block_bytes.len())
        .map_err(|_| SigningError::Malformed("signature block too large".to_string()))?;

    let mut out = Vec::with_capacity(content.len() + block_bytes.len() + TRAILER_LEN);
    out.extend_from_slice(content);
    out.extend_from_slice(&block_bytes);
    out.extend_from_slice(&block_len.to_le_bytes());
    out.extend_from_slice(SIGNATURE_MAGIC);
    Ok(out)
}

/// Split a binary into its content and embedded signature block
///
/// Returns `Ok(None)` when the binary carries no signature trailer.
///
/// # Errors
///
/// Returns `SigningError::Malformed` when the trailer is present but the
/// block is truncated or not valid JSON.
pub fn extract(bytes: &[u8]) -> Result<Option<(&[u8], SignatureBlock)>, SigningError> {
    if bytes.len() < TRAILER_LEN || !bytes.ends_with(SIGNATURE_MAGIC) {
        return Ok(None);
    }

    let len_start = bytes.len() - TRAILER_LEN;
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&bytes[len_start..len_start + 4]);
    let block_len = u32::from_le_bytes(len_bytes) as usize;

    if block_len == 0 || block_len > MAX_BLOCK_LEN || block_len > len_start {
        return Err(SigningError::Malformed(format!(
            "declared block length {} is out of range",
            block_len
        )));
    }

    let block_start = len_start - block_len;
    let block: SignatureBlock = serde_json::from_slice(&bytes[block_start..len_start])
        .map_err(|e| SigningError::Malformed(e.to_string()))?;
    if block.certificates.is_empty() {
        return Err(SigningError::Malformed("no certificates".to_string()));
    }

    Ok(Some((&bytes[..block_start], block)))
}

/// Drop an embedded signature trailer, leaving only the signed content
///
/// Returns whether a trailer was removed. Used by backends whose loader
/// rejects trailing bytes.
///
/// # Errors
///
/// Returns `SigningError::Malformed` when the trailer is present but invalid.
pub fn strip_signature(bytes: &mut Vec<u8>) -> Result<bool, SigningError> {
    let content_len = match extract(bytes)? {
        Some((content, _)) => content.len(),
        None => return Ok(false),
    };
    bytes.truncate(content_len);
    Ok(true)
}

/// BLAKE3 content hash (hex)
pub fn content_hash(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

pub(crate) fn decode_verifying_key(hex_key: &str) -> Result<VerifyingKey, SigningError> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|e| SigningError::Key(format!("public key is not hex: {}", e)))?;
    let array: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| SigningError::Key(format!("public key must be 32 bytes, got {}", bytes.len())))?;
    VerifyingKey::from_bytes(&array).map_err(|e| SigningError::Key(e.to_string()))
}

fn decode_signature(hex_sig: &str) -> Result<Signature, SigningError> {
    let bytes = hex::decode(hex_sig.trim())
        .map_err(|e| SigningError::Malformed(format!("signature is not hex: {}", e)))?;
    Signature::from_slice(&bytes).map_err(|e| SigningError::Malformed(e.to_string()))
}
