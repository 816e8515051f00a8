//! Integration tests for configuration management
//!
//! These tests verify that a TOML configuration file drives verification,
//! the audit stream and loader policy the same way the `bulwark` binary
//! wires them up.

use bulwark_engine::audit::AuditEvent;
use bulwark_engine::config::{Config, TrustRootConfig};
use bulwark_engine::handlers::{build_audit_sink, build_loader, build_verification};
use bulwark_engine::signing::{sign_binary, Certificate, CertificateRequest};
use bulwark_engine::verification::VerificationStatus;
use bulwark_engine::TrustTier;
use bulwark_sdk::{EntryPoint, PluginManifest};
use chrono::{Duration, Utc};
use ed25519_dalek::SigningKey;
use std::path::Path;
use tempfile::TempDir;

fn write_config(dir: &Path, extra: &str) -> Config {
    let toml_content = format!(
        r#"
[core]
log_level = "debug"
data_dir = "{root}/data"

[plugins]
install_dir = "{root}/plugins"
storage_dir = "{root}/storage"
host_version = "2.3"
hook_timeout_secs = 5
require_signed = true

[audit]
jsonl_path = "{root}/audit.jsonl"

[isolation]
extra_denied = ["telemetry-client"]
extra_shared = ["combat_model"]
{extra}
"#,
        root = dir.display(),
        extra = extra
    );
    let path = dir.join("config.toml");
    std::fs::write(&path, toml_content).unwrap();
    Config::load_from_path(&path).unwrap()
}

fn manifest(id: &str) -> PluginManifest {
    PluginManifest {
        id: id.into(),
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
        signer_thumbprint: None,
        resource_limits: None,
    }
}

#[test]
fn test_config_toml_parsing() {
    let temp = TempDir::new().unwrap();
    let config = write_config(temp.path(), "");

    assert_eq!(config.core.log_level, "debug");
    assert_eq!(config.plugins.host_version, "2.3.0");
    assert!(config.plugins.require_signed);
    assert!(config.trust.allow_expired);
    assert!(temp.path().join("plugins").is_dir());
    assert!(temp.path().join("storage").is_dir());

    let options = config.loader_options().unwrap();
    assert_eq!(options.host_version, semver::Version::new(2, 3, 0));
    assert_eq!(options.hook_timeout, std::time::Duration::from_secs(5));
    assert!(options.require_signed);

    let policy = config.isolation_policy();
    assert!(policy.is_denied("telemetry_client::upload"));
    assert!(policy.is_denied("std::process"));
    assert!(!policy.is_denied("combat_model"));
}

#[test]
fn test_missing_sections_use_defaults() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("config.toml");
    std::fs::write(
        &path,
        format!(
            "[core]\ndata_dir = \"{0}/data\"\n\n[plugins]\ninstall_dir = \"{0}/plugins\"\nstorage_dir = \"{0}/storage\"\n",
            temp.path().display()
        ),
    )
    .unwrap();

    let config = Config::load_from_path(&path).unwrap();
    assert_eq!(config.core.log_level, "info");
    assert_eq!(config.plugins.hook_timeout_secs, 30);
    assert!(config.trust.official_thumbprints.is_empty());
    assert!(config.audit.jsonl_path.is_none());
}

#[tokio::test]
async fn test_configured_root_and_allow_list_resolve_official_tier() {
    let temp = TempDir::new().unwrap();
    let root_key = SigningKey::from_bytes(&[21u8; 32]);
    let signer = SigningKey::from_bytes(&[22u8; 32]);
    let now = Utc::now();
    let leaf = Certificate::issue(
        CertificateRequest {
            serial: "vendor-7".into(),
            subject: "Vendor Publisher".into(),
            public_key: signer.verifying_key(),
            not_before: now - Duration::hours(1),
            not_after: now + Duration::days(90),
            is_ca: false,
        },
        "Vendor CA",
        &root_key,
    )
    .unwrap();

    let mut config = write_config(temp.path(), "");
    config.trust.roots.push(TrustRootConfig {
        subject: "Vendor CA".into(),
        public_key: hex::encode(root_key.verifying_key().to_bytes()),
    });
    config
        .add_thumbprint(&leaf.thumbprint().to_lowercase(), true)
        .unwrap();

    let binary = temp.path().join("widget.bin");
    std::fs::write(
        &binary,
        sign_binary(b"vendor module", &signer, vec![leaf.clone()]).unwrap(),
    )
    .unwrap();

    let audit = build_audit_sink(&config).unwrap();
    let verification = build_verification(&config, audit).unwrap();
    let result = verification.verify(&manifest("vendor-widget"), &binary).await;

    assert_eq!(result.status(), VerificationStatus::Valid);
    assert_eq!(result.tier(), TrustTier::OfficialTrusted);

    // Revoking the leaf serial invalidates the same binary
    config.trust.revoked_serials.push("vendor-7".into());
    let audit = build_audit_sink(&config).unwrap();
    let verification = build_verification(&config, audit).unwrap();
    let result = verification.verify(&manifest("vendor-widget"), &binary).await;
    assert_eq!(result.status(), VerificationStatus::Invalid);
    assert_eq!(result.tier(), TrustTier::Untrusted);
}

#[tokio::test]
async fn test_audit_file_receives_events() {
    let temp = TempDir::new().unwrap();
    let config = write_config(temp.path(), "");
    let binary = temp.path().join("widget.bin");
    std::fs::write(&binary, b"unsigned module").unwrap();

    {
        let audit = build_audit_sink(&config).unwrap();
        let verification = build_verification(&config, audit).unwrap();
        verification.verify(&manifest("audited"), &binary).await;
    }

    let contents = std::fs::read_to_string(temp.path().join("audit.jsonl")).unwrap();
    let events: Vec<AuditEvent> = contents
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert!(events.iter().all(|e| e.plugin_id == "audited"));
    assert!(events.iter().any(|e| e.kind.as_str() == "unsigned"));
}

#[tokio::test]
async fn test_loader_built_from_config_enforces_signing() {
    let temp = TempDir::new().unwrap();
    let config = write_config(temp.path(), "");
    let dir = config.plugins.install_dir.join("widget");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("widget.bin"), b"unsigned module").unwrap();
    std::fs::write(dir.join("plugin.json"), manifest("widget").to_json().unwrap()).unwrap();

    let loader = build_loader(&config).unwrap();
    let outcomes = loader
        .load_all(&tokio_util::sync::CancellationToken::new())
        .await;

    assert_eq!(outcomes.len(), 1);
    let err = outcomes[0].result.as_ref().unwrap_err();
    assert_eq!(err.kind(), bulwark_engine::LoadErrorKind::Security);
    assert!(loader.list().await.is_empty());
}
