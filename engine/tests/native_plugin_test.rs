//! Native backend end-to-end tests
//!
//! Builds the `dps-meter` sample plugin as a shared library and drives it
//! through the default loader backends, unsigned and signed.

use bulwark_engine::audit::{AuditEventKind, MemoryAuditSink};
use bulwark_engine::lifecycle::LifecycleState;
use bulwark_engine::signing::{
    sign_binary, Certificate, CertificateRequest, Ed25519ChainValidator, TrustRoot,
};
use bulwark_engine::{LoaderOptions, PluginLoader, TrustTier, VerificationService};
use bulwark_sdk::Permission;
use chrono::{Duration as ChronoDuration, Utc};
use ed25519_dalek::SigningKey;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, OnceLock};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const LIBRARY_NAME: &str = "dps_meter";

/// Path of the compiled `dps-meter` library, built once per test binary
fn dps_meter_library() -> &'static Path {
    static LIBRARY: OnceLock<PathBuf> = OnceLock::new();
    LIBRARY.get_or_init(|| {
        let workspace = Path::new(env!("CARGO_MANIFEST_DIR"))
            .parent()
            .unwrap()
            .to_path_buf();
        // A separate target dir keeps clear of the lock held by the outer build
        let target = workspace.join("target").join("bulwark-fixtures");
        let status = Command::new(env!("CARGO"))
            .current_dir(&workspace)
            .args(["build", "-p", "dps-meter", "--lib", "--target-dir"])
            .arg(&target)
            .status()
            .unwrap();
        assert!(status.success(), "building dps-meter failed");

        target.join("debug").join(format!(
            "{}{}{}",
            std::env::consts::DLL_PREFIX,
            LIBRARY_NAME,
            std::env::consts::DLL_SUFFIX
        ))
    })
}

struct Fixture {
    root: TempDir,
    loader: PluginLoader,
    audit: Arc<MemoryAuditSink>,
    signer: SigningKey,
    leaf: Certificate,
}

impl Fixture {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let root_key = SigningKey::from_bytes(&[5u8; 32]);
        let signer = SigningKey::from_bytes(&[6u8; 32]);
        let now = Utc::now();
        let leaf = Certificate::issue(
            CertificateRequest {
                serial: "native-1".to_string(),
                subject: "Bulwark Team".to_string(),
                public_key: signer.verifying_key(),
                not_before: now - ChronoDuration::hours(1),
                not_after: now + ChronoDuration::days(30),
                is_ca: false,
            },
            "Test Root",
            &root_key,
        )
        .unwrap();

        let audit = Arc::new(MemoryAuditSink::new());
        let validator =
            Ed25519ChainValidator::new(vec![TrustRoot::new("Test Root", root_key.verifying_key())]);
        let verification = Arc::new(
            VerificationService::new(Arc::new(validator), audit.clone())
                .with_allow_lists(Vec::<String>::new(), [leaf.thumbprint()]),
        );

        let mut options = LoaderOptions::new(
            root.path().join("plugins"),
            root.path().join("storage"),
            semver::Version::new(1, 0, 0),
        );
        options.require_signed = false;
        let loader = PluginLoader::new(options, verification, audit.clone());

        Self {
            root,
            loader,
            audit,
            signer,
            leaf,
        }
    }

    fn install_meter(&self, signed: bool) -> PathBuf {
        let library = std::fs::read(dps_meter_library()).unwrap();
        let binary_name = dps_meter_library()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .into_owned();

        let dir = self.root.path().join("plugins").join("dps-meter");
        std::fs::create_dir_all(&dir).unwrap();
        let binary = if signed {
            sign_binary(&library, &self.signer, vec![self.leaf.clone()]).unwrap()
        } else {
            library
        };
        std::fs::write(dir.join(&binary_name), binary).unwrap();

        let manifest = json!({
            "id": "dps-meter",
            "name": "DPS Meter",
            "version": "0.1.0",
            "entry": { "binary": binary_name, "type_name": "DpsMeter" },
            "permissions": ["read_logs", "network"],
        });
        std::fs::write(dir.join("plugin.json"), manifest.to_string()).unwrap();
        dir
    }
}

async fn exercise(fx: &Fixture, dir: &Path) {
    let cancel = CancellationToken::new();

    assert!(fx.loader.enable("dps-meter", &cancel).await);
    assert_eq!(
        fx.loader.get("dps-meter").await.unwrap().state,
        LifecycleState::Enabled
    );
    assert!(fx.loader.disable("dps-meter", &cancel).await);
    assert!(fx.loader.unload("dps-meter").await);

    assert_eq!(fx.loader.active_boundaries("dps-meter"), 0);
    assert_eq!(fx.audit.count("dps-meter", AuditEventKind::Unloaded), 1);
    assert!(fx.root.path().join("storage").join("dps-meter").is_dir());
    assert!(dir.join("plugin.json").exists());
}

#[tokio::test]
async fn test_unsigned_native_plugin_lifecycle() {
    let fx = Fixture::new();
    let dir = fx.install_meter(false);

    let info = fx.loader.load(&dir, &CancellationToken::new()).await.unwrap();
    assert_eq!(info.backend, "native");
    assert_eq!(info.tier, TrustTier::Untrusted);
    assert_eq!(info.state, LifecycleState::Initialized);
    assert!(info.granted.contains(&Permission::ReadLogs));
    assert!(!info.granted.contains(&Permission::Network));
    assert_eq!(fx.loader.active_boundaries("dps-meter"), 1);

    exercise(&fx, &dir).await;
}

#[tokio::test]
async fn test_signed_native_plugin_lifecycle() {
    let fx = Fixture::new();
    let dir = fx.install_meter(true);

    let info = fx.loader.load(&dir, &CancellationToken::new()).await.unwrap();
    assert_eq!(info.backend, "native");
    assert_eq!(info.tier, TrustTier::OfficialTrusted);
    assert_eq!(info.thumbprint, Some(fx.leaf.thumbprint()));
    assert!(info.granted.contains(&Permission::Network));

    exercise(&fx, &dir).await;
}
