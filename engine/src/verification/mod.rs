//! Plugin verification
//!
//! Produces a [`VerificationResult`] for one plugin's entry binary:
//!
//! 1. Missing entry binary → `Failed`
//! 2. BLAKE3 content hash is computed (evidence only)
//! 3. No embedded signature → `Unsigned` (not fatal; load policy decides)
//! 4. Signature or certificate chain invalid → `Invalid`
//! 5. Manifest's expected thumbprint differs from the signer → `Invalid`
//! 6. Tier from allow-lists: official → `OfficialTrusted`, trusted →
//!    `SignedTrusted`, otherwise `Untrusted`
//!
//! Every branch records an audit event before returning. The allow-lists are
//! read at verification time, so adding or removing a thumbprint affects the
//! next verification only and never re-trusts plugins already loaded.

use crate::audit::{AuditEventKind, AuditSink, AuditSinkExt};
use crate::signing::{self, ChainValidator};
use bulwark_sdk::PluginManifest;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Access level derived from signature verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustTier {
    /// Unsigned, invalid, or signed by an unrecognized authority
    Untrusted,
    /// Signed by a thumbprint on the trusted allow-list
    SignedTrusted,
    /// Signed by a thumbprint on the official allow-list
    OfficialTrusted,
}

impl fmt::Display for TrustTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrustTier::Untrusted => "untrusted",
            TrustTier::SignedTrusted => "signed_trusted",
            TrustTier::OfficialTrusted => "official_trusted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Valid,
    Unsigned,
    Invalid,
    Failed,
}

/// Outcome of one verification pass
///
/// Fields are private so the constructors can uphold the invariant that a
/// tier above `Untrusted` implies a signed, valid binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationResult {
    status: VerificationStatus,
    success: bool,
    signed: bool,
    valid: bool,
    tier: TrustTier,
    thumbprint: Option<String>,
    content_hash: Option<String>,
    error: Option<String>,
}

impl VerificationResult {
    pub fn valid(tier: TrustTier, thumbprint: String, content_hash: String) -> Self {
        Self {
            status: VerificationStatus::Valid,
            success: true,
            signed: true,
            valid: true,
            tier,
            thumbprint: Some(thumbprint),
            content_hash: Some(content_hash),
            error: None,
        }
    }

    pub fn unsigned(content_hash: String) -> Self {
        Self {
            status: VerificationStatus::Unsigned,
            success: false,
            signed: false,
            valid: false,
            tier: TrustTier::Untrusted,
            thumbprint: None,
            content_hash: Some(content_hash),
            error: None,
        }
    }

    pub fn invalid(
        reason: impl Into<String>,
        thumbprint: Option<String>,
        content_hash: Option<String>,
    ) -> Self {
        Self {
            status: VerificationStatus::Invalid,
            success: false,
            signed: true,
            valid: false,
            tier: TrustTier::Untrusted,
            thumbprint,
            content_hash,
            error: Some(reason.into()),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: VerificationStatus::Failed,
            success: false,
            signed: false,
            valid: false,
            tier: TrustTier::Untrusted,
            thumbprint: None,
            content_hash: None,
            error: Some(message.into()),
        }
    }

    pub fn status(&self) -> VerificationStatus {
        self.status
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn signed(&self) -> bool {
        self.signed
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn tier(&self) -> TrustTier {
        self.tier
    }

    pub fn thumbprint(&self) -> Option<&str> {
        self.thumbprint.as_deref()
    }

    pub fn content_hash(&self) -> Option<&str> {
        self.content_hash.as_deref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

/// Result of inspecting the binary, before trust tier resolution
enum Inspection {
    Unsigned,
    Invalid {
        kind: AuditEventKind,
        reason: String,
        thumbprint: Option<String>,
    },
    Signed {
        thumbprint: String,
    },
}

fn inspect(
    bytes: &[u8],
    validator: &dyn ChainValidator,
    expected_thumbprint: Option<&str>,
    now: DateTime<Utc>,
) -> Inspection {
    let (content, block) = match signing::extract(bytes) {
        Ok(Some(found)) => found,
        Ok(None) => return Inspection::Unsigned,
        Err(e) => {
            return Inspection::Invalid {
                kind: AuditEventKind::SignatureInvalid,
                reason: e.to_string(),
                thumbprint: None,
            }
        }
    };

    // extract() guarantees a leaf
    let thumbprint = block.leaf().map(|leaf| leaf.thumbprint());

    if let Err(e) = block.verify_content(content) {
        return Inspection::Invalid {
            kind: AuditEventKind::SignatureInvalid,
            reason: e.to_string(),
            thumbprint,
        };
    }

    if let Err(e) = validator.validate(&block.certificates, now) {
        return Inspection::Invalid {
            kind: AuditEventKind::SignatureInvalid,
            reason: format!("certificate chain invalid: {}", e),
            thumbprint,
        };
    }

    let Some(thumbprint) = thumbprint else {
        return Inspection::Invalid {
            kind: AuditEventKind::SignatureInvalid,
            reason: "no signer certificate".to_string(),
            thumbprint: None,
        };
    };

    if let Some(expected) = expected_thumbprint {
        if !expected.trim().eq_ignore_ascii_case(&thumbprint) {
            return Inspection::Invalid {
                kind: AuditEventKind::ThumbprintMismatch,
                reason: "thumbprint mismatch".to_string(),
                thumbprint: Some(thumbprint),
            };
        }
    }

    Inspection::Signed { thumbprint }
}

fn normalize(thumbprint: &str) -> String {
    thumbprint.trim().to_uppercase()
}

/// Verifies entry binaries and resolves their trust tier
pub struct VerificationService {
    validator: Arc<dyn ChainValidator>,
    trusted: RwLock<BTreeSet<String>>,
    official: RwLock<BTreeSet<String>>,
    audit: Arc<dyn AuditSink>,
}

impl VerificationService {
    pub fn new(validator: Arc<dyn ChainValidator>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            validator,
            trusted: RwLock::new(BTreeSet::new()),
            official: RwLock::new(BTreeSet::new()),
            audit,
        }
    }

    /// Seed the allow-lists, typically from configuration
    pub fn with_allow_lists<T, O>(self, trusted: T, official: O) -> Self
    where
        T: IntoIterator,
        T::Item: AsRef<str>,
        O: IntoIterator,
        O::Item: AsRef<str>,
    {
        for thumbprint in trusted {
            self.add_trusted(thumbprint.as_ref());
        }
        for thumbprint in official {
            self.add_official(thumbprint.as_ref());
        }
        self
    }

    /// Verify the entry binary at `entry_path` for `manifest`
    ///
    /// Never returns an error: every failure is expressed as a `Failed` or
    /// `Invalid` result, and every outcome is audited.
    pub async fn verify(&self, manifest: &PluginManifest, entry_path: &Path) -> VerificationResult {
        let plugin_id = manifest.id.as_str();

        let bytes = match tokio::fs::read(entry_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let result = VerificationResult::failed("Entry binary file not found");
                self.audit.emit(
                    plugin_id,
                    AuditEventKind::VerificationFailed,
                    format!("entry binary not found: {}", entry_path.display()),
                );
                return result;
            }
            Err(e) => {
                self.audit.emit(
                    plugin_id,
                    AuditEventKind::VerificationFailed,
                    format!("failed to read entry binary: {}", e),
                );
                return VerificationResult::failed(format!("Failed to read entry binary: {}", e));
            }
        };

        let validator = Arc::clone(&self.validator);
        let expected = manifest.signer_thumbprint.clone();
        let task = tokio::task::spawn_blocking(move || {
            let hash = signing::content_hash(&bytes);
            let inspection = inspect(&bytes, validator.as_ref(), expected.as_deref(), Utc::now());
            (hash, inspection)
        });

        let (hash, inspection) = match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.audit.emit(
                    plugin_id,
                    AuditEventKind::VerificationFailed,
                    format!("verification aborted: {}", e),
                );
                return VerificationResult::failed(format!("Verification aborted: {}", e));
            }
        };

        self.audit.emit(
            plugin_id,
            AuditEventKind::HashComputed,
            format!("blake3:{}", hash),
        );

        match inspection {
            Inspection::Unsigned => {
                self.audit.emit(
                    plugin_id,
                    AuditEventKind::Unsigned,
                    "entry binary carries no signature",
                );
                VerificationResult::unsigned(hash)
            }
            Inspection::Invalid {
                kind,
                reason,
                thumbprint,
            } => {
                self.audit.emit(
                    plugin_id,
                    kind,
                    match &thumbprint {
                        Some(t) => format!("{} (signer {})", reason, t),
                        None => reason.clone(),
                    },
                );
                VerificationResult::invalid(reason, thumbprint, Some(hash))
            }
            Inspection::Signed { thumbprint } => {
                let tier = self.resolve_tier(&thumbprint);
                if tier == TrustTier::Untrusted {
                    self.audit.emit(
                        plugin_id,
                        AuditEventKind::UntrustedSigner,
                        format!("valid signature by unrecognized signer {}", thumbprint),
                    );
                } else {
                    self.audit.emit(
                        plugin_id,
                        AuditEventKind::SignatureValid,
                        format!("signer {} resolved to {}", thumbprint, tier),
                    );
                }
                VerificationResult::valid(tier, thumbprint, hash)
            }
        }
    }

    /// Map a signer thumbprint to a tier using the current allow-lists
    pub fn resolve_tier(&self, thumbprint: &str) -> TrustTier {
        let thumbprint = normalize(thumbprint);
        if read(&self.official).contains(&thumbprint) {
            TrustTier::OfficialTrusted
        } else if read(&self.trusted).contains(&thumbprint) {
            TrustTier::SignedTrusted
        } else {
            TrustTier::Untrusted
        }
    }

    pub fn add_trusted(&self, thumbprint: &str) -> bool {
        write(&self.trusted).insert(normalize(thumbprint))
    }

    pub fn remove_trusted(&self, thumbprint: &str) -> bool {
        write(&self.trusted).remove(&normalize(thumbprint))
    }

    pub fn add_official(&self, thumbprint: &str) -> bool {
        write(&self.official).insert(normalize(thumbprint))
    }

    pub fn remove_official(&self, thumbprint: &str) -> bool {
        write(&self.official).remove(&normalize(thumbprint))
    }

    pub fn trusted_thumbprints(&self) -> Vec<String> {
        read(&self.trusted).iter().cloned().collect()
    }

    pub fn official_thumbprints(&self) -> Vec<String> {
        read(&self.official).iter().cloned().collect()
    }
}

fn read(lock: &RwLock<BTreeSet<String>>) -> RwLockReadGuard<'_, BTreeSet<String>> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write(lock: &RwLock<BTreeSet<String>>) -> RwLockWriteGuard<'_, BTreeSet<String>> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::signing::{Certificate, Ed25519ChainValidator, TrustRoot};
    use bulwark_sdk::EntryPoint;
    use chrono::Duration;
    use ed25519_dalek::SigningKey;

    fn manifest(expected: Option<String>) -> PluginManifest {
        PluginManifest {
            id: "widget".into(),
            name: "Widget".into(),
            version: "1.0.0".into(),
            author: String::new(),
            description: String::new(),
            kind: Default::default(),
            entry: EntryPoint {
                binary: "widget.bin".into(),
                type_name: "Widget".into(),
            },
            permissions: vec![],
            dependencies: vec![],
            compatibility: Default::default(),
            signer_thumbprint: expected,
            resource_limits: None,
        }
    }

    struct Fixture {
        service: VerificationService,
        audit: Arc<MemoryAuditSink>,
        cert: Certificate,
        key: SigningKey,
        dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let key = SigningKey::from_bytes(&[5u8; 32]);
        let cert = Certificate::self_signed(
            "1",
            "Publisher",
            &key,
            Utc::now() - Duration::hours(1),
            Duration::days(1),
        )
        .unwrap();
        let validator = Ed25519ChainValidator::new(vec![TrustRoot::new("Publisher", key.verifying_key())]);
        let audit = Arc::new(MemoryAuditSink::new());
        let service = VerificationService::new(Arc::new(validator), audit.clone());
        Fixture {
            service,
            audit,
            cert,
            key,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn write_binary(fx: &Fixture, signed: bool) -> std::path::PathBuf {
        let path = fx.dir.path().join("widget.bin");
        let bytes = if signed {
            signing::sign_binary(b"module", &fx.key, vec![fx.cert.clone()]).unwrap()
        } else {
            b"module".to_vec()
        };
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[tokio::test]
    async fn test_missing_binary_fails() {
        let fx = fixture();
        let result = fx
            .service
            .verify(&manifest(None), &fx.dir.path().join("absent.bin"))
            .await;
        assert_eq!(result.status(), VerificationStatus::Failed);
        assert_eq!(fx.audit.count("widget", AuditEventKind::VerificationFailed), 1);
    }

    #[tokio::test]
    async fn test_unsigned_binary() {
        let fx = fixture();
        let path = write_binary(&fx, false);
        let result = fx.service.verify(&manifest(None), &path).await;

        assert_eq!(result.status(), VerificationStatus::Unsigned);
        assert_eq!(result.tier(), TrustTier::Untrusted);
        assert!(!result.signed());
        assert!(result.content_hash().is_some());
        assert_eq!(fx.audit.count("widget", AuditEventKind::Unsigned), 1);
    }

    #[tokio::test]
    async fn test_signed_by_unknown_signer_is_untrusted() {
        let fx = fixture();
        let path = write_binary(&fx, true);
        let result = fx.service.verify(&manifest(None), &path).await;

        assert_eq!(result.status(), VerificationStatus::Valid);
        assert_eq!(result.tier(), TrustTier::Untrusted);
        assert_eq!(fx.audit.count("widget", AuditEventKind::UntrustedSigner), 1);
    }

    #[tokio::test]
    async fn test_allow_lists_resolve_tier() {
        let fx = fixture();
        let path = write_binary(&fx, true);
        let thumbprint = fx.cert.thumbprint();

        fx.service.add_trusted(&thumbprint.to_lowercase());
        let result = fx.service.verify(&manifest(None), &path).await;
        assert_eq!(result.tier(), TrustTier::SignedTrusted);

        fx.service.add_official(&thumbprint);
        let result = fx.service.verify(&manifest(None), &path).await;
        assert_eq!(result.tier(), TrustTier::OfficialTrusted);
        assert_eq!(result.thumbprint(), Some(thumbprint.as_str()));
    }

    #[tokio::test]
    async fn test_thumbprint_mismatch_is_invalid() {
        let fx = fixture();
        let path = write_binary(&fx, true);
        fx.service.add_official(&fx.cert.thumbprint());

        let result = fx
            .service
            .verify(&manifest(Some("00".repeat(32))), &path)
            .await;
        assert_eq!(result.status(), VerificationStatus::Invalid);
        assert_eq!(result.tier(), TrustTier::Untrusted);
        assert_eq!(result.error(), Some("thumbprint mismatch"));
        assert_eq!(fx.audit.count("widget", AuditEventKind::ThumbprintMismatch), 1);
    }

    #[tokio::test]
    async fn test_expected_thumbprint_is_case_insensitive() {
        let fx = fixture();
        let path = write_binary(&fx, true);
        let expected = fx.cert.thumbprint().to_lowercase();

        let result = fx.service.verify(&manifest(Some(expected)), &path).await;
        assert_eq!(result.status(), VerificationStatus::Valid);
    }

    #[tokio::test]
    async fn test_untrusted_root_is_invalid() {
        let fx = fixture();
        let path = write_binary(&fx, true);
        let service = VerificationService::new(
            Arc::new(Ed25519ChainValidator::new(vec![])),
            fx.audit.clone(),
        );

        let result = service.verify(&manifest(None), &path).await;
        assert_eq!(result.status(), VerificationStatus::Invalid);
        assert!(result.signed());
        assert!(!result.is_valid());
    }
}
