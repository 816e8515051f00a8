//! Certificate chain validation

use super::{Certificate, SigningError};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Verifier, VerifyingKey};
use std::collections::HashSet;
use thiserror::Error;

/// Reasons a certificate chain is rejected
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("certificate chain is empty")]
    Empty,

    #[error("certificate '{serial}' has been revoked")]
    Revoked { serial: String },

    #[error("certificate '{subject}' is not valid before {not_before}")]
    NotYetValid {
        subject: String,
        not_before: DateTime<Utc>,
    },

    #[error("certificate '{subject}' expired at {not_after}")]
    Expired {
        subject: String,
        not_after: DateTime<Utc>,
    },

    #[error("certificate '{subject}' is issued by '{issuer}', which is not the next certificate in the chain")]
    BrokenLink { subject: String, issuer: String },

    #[error("certificate '{subject}' issued another certificate but is not a certificate authority")]
    NotCa { subject: String },

    #[error("issuer signature on certificate '{subject}' is invalid")]
    BadSignature { subject: String },

    #[error("chain ends at '{issuer}', which is not a trusted root")]
    UntrustedRoot { issuer: String },

    #[error("certificate '{subject}' carries malformed key material: {reason}")]
    Malformed { subject: String, reason: String },
}

/// Validates a signer's certificate chain
pub trait ChainValidator: Send + Sync {
    /// Validate `chain` (leaf first) at time `now`
    fn validate(&self, chain: &[Certificate], now: DateTime<Utc>) -> Result<(), ChainError>;
}

/// A trust anchor: subject name plus public key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustRoot {
    pub subject: String,
    pub public_key: VerifyingKey,
}

impl TrustRoot {
    pub fn new(subject: impl Into<String>, public_key: VerifyingKey) -> Self {
        Self {
            subject: subject.into(),
            public_key,
        }
    }

    /// Build a root from a hex-encoded Ed25519 public key
    pub fn from_hex(subject: impl Into<String>, public_key_hex: &str) -> Result<Self, SigningError> {
        Ok(Self::new(subject, super::decode_verifying_key(public_key_hex)?))
    }
}

/// Ed25519 chain validator with revocation and expiry policy
///
/// Each certificate must be signed by the next one in the chain; the last one
/// must be signed by a configured trust root whose subject equals its issuer.
/// Revoked serials are rejected anywhere in the chain. Expired certificates
/// are tolerated when `allow_expired` is set.
#[derive(Debug, Clone)]
pub struct Ed25519ChainValidator {
    roots: Vec<TrustRoot>,
    revoked: HashSet<String>,
    allow_expired: bool,
}

impl Ed25519ChainValidator {
    pub fn new(roots: Vec<TrustRoot>) -> Self {
        Self {
            roots,
            revoked: HashSet::new(),
            allow_expired: true,
        }
    }

    pub fn with_revoked<I, S>(mut self, serials: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.revoked.extend(serials.into_iter().map(Into::into));
        self
    }

    pub fn allow_expired(mut self, allow: bool) -> Self {
        self.allow_expired = allow;
        self
    }

    pub fn roots(&self) -> &[TrustRoot] {
        &self.roots
    }

    fn check_validity(&self, cert: &Certificate, now: DateTime<Utc>) -> Result<(), ChainError> {
        if self.revoked.contains(&cert.serial) {
            return Err(ChainError::Revoked {
                serial: cert.serial.clone(),
            });
        }
        if now < cert.not_before {
            return Err(ChainError::NotYetValid {
                subject: cert.subject.clone(),
                not_before: cert.not_before,
            });
        }
        if now > cert.not_after {
            if !self.allow_expired {
                return Err(ChainError::Expired {
                    subject: cert.subject.clone(),
                    not_after: cert.not_after,
                });
            }
            tracing::warn!(
                "Certificate '{}' expired at {}, accepted by policy",
                cert.subject,
                cert.not_after
            );
        }
        Ok(())
    }
}

fn check_issued_by(cert: &Certificate, issuer_key: &VerifyingKey) -> Result<(), ChainError> {
    let signature = cert
        .issuer_signature()
        .map_err(|e| ChainError::Malformed {
            subject: cert.subject.clone(),
            reason: e.to_string(),
        })?;
    issuer_key
        .verify(&cert.tbs_bytes(), &signature)
        .map_err(|_| ChainError::BadSignature {
            subject: cert.subject.clone(),
        })
}

impl ChainValidator for Ed25519ChainValidator {
    fn validate(&self, chain: &[Certificate], now: DateTime<Utc>) -> Result<(), ChainError> {
        let Some(last) = chain.last() else {
            return Err(ChainError::Empty);
        };

        for cert in chain {
            self.check_validity(cert, now)?;
        }

        for pair in chain.windows(2) {
            let (cert, issuer) = (&pair[0], &pair[1]);
            if cert.issuer != issuer.subject {
                return Err(ChainError::BrokenLink {
                    subject: cert.subject.clone(),
                    issuer: cert.issuer.clone(),
                });
            }
            if !issuer.is_ca {
                return Err(ChainError::NotCa {
                    subject: issuer.subject.clone(),
                });
            }
            let issuer_key = issuer.verifying_key().map_err(|e| ChainError::Malformed {
                subject: issuer.subject.clone(),
                reason: e.to_string(),
            })?;
            check_issued_by(cert, &issuer_key)?;
        }

        let candidates: Vec<&TrustRoot> = self
            .roots
            .iter()
            .filter(|root| root.subject == last.issuer)
            .collect();
        if candidates.is_empty() {
            return Err(ChainError::UntrustedRoot {
                issuer: last.issuer.clone(),
            });
        }

        let mut last_error = None;
        for root in candidates {
            match check_issued_by(last, &root.public_key) {
                Ok(()) => return Ok(()),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or(ChainError::UntrustedRoot {
            issuer: last.issuer.clone(),
        }))
    }
}
