//! Command handlers for CLI operations
//!
//! This module implements the handlers for all CLI commands:
//! - plugins list: List plugin directories under the install root
//! - plugins load-all: Load every installed plugin and report per plugin
//! - plugins verify: Verify one plugin's entry binary
//! - plugins install: Copy a plugin into the install root and load it
//! - trust list/add/remove: Manage the signer allow-lists

use anyhow::{Context, Result};
use bulwark_sdk::ErrorExt;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditSink, FanoutAuditSink, JsonlAuditSink, TracingAuditSink};
use crate::config::Config;
use crate::loader::{self, LoadError, LoadOutcome, PluginLoader};
use crate::registry::PluginInfo;
use crate::signing::Ed25519ChainValidator;
use crate::verification::VerificationService;

/// Output format for command results
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

/// Audit sink for this process: tracing, plus the JSONL file when configured
pub fn build_audit_sink(config: &Config) -> Result<Arc<dyn AuditSink>> {
    let mut sinks: Vec<Arc<dyn AuditSink>> = vec![Arc::new(TracingAuditSink)];
    if let Some(path) = &config.audit.jsonl_path {
        let sink = JsonlAuditSink::open(path)
            .with_context(|| format!("Failed to open audit log {}", path.display()))?;
        sinks.push(Arc::new(sink));
    }
    Ok(Arc::new(FanoutAuditSink::new(sinks)))
}

/// Verification service configured from the `[trust]` section
pub fn build_verification(
    config: &Config,
    audit: Arc<dyn AuditSink>,
) -> Result<Arc<VerificationService>> {
    let roots = config.trust_roots().context("Invalid trust roots")?;
    if roots.is_empty() {
        tracing::warn!("No trust roots configured; every signed plugin will fail chain validation");
    }
    let validator = Ed25519ChainValidator::new(roots)
        .with_revoked(config.trust.revoked_serials.iter().cloned())
        .allow_expired(config.trust.allow_expired);

    Ok(Arc::new(
        VerificationService::new(Arc::new(validator), audit).with_allow_lists(
            config.trust.trusted_thumbprints.iter(),
            config.trust.official_thumbprints.iter(),
        ),
    ))
}

/// Plugin loader configured from the whole configuration
pub fn build_loader(config: &Config) -> Result<PluginLoader> {
    let audit = build_audit_sink(config)?;
    let verification = build_verification(config, Arc::clone(&audit))?;
    let options = config.loader_options().context("Invalid plugin configuration")?;
    Ok(PluginLoader::new(options, verification, audit).with_policy(config.isolation_policy()))
}

/// Token cancelled on Ctrl-C
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling in-flight plugin operations");
            trigger.cancel();
        }
    });
    token
}

fn error_json(error: &LoadError) -> serde_json::Value {
    json!({
        "kind": error.kind(),
        "reason": error.reason(),
        "hint": error.user_hint(),
    })
}

fn print_info(info: &PluginInfo) {
    println!("  {} v{} ({})", info.id, info.version, info.name);
    println!("    tier:        {}", info.tier);
    println!("    state:       {}", info.state);
    println!("    backend:     {}", info.backend);
    if let Some(thumbprint) = &info.thumbprint {
        println!("    signer:      {}", thumbprint);
    }
    let granted: Vec<&str> = info.granted.iter().map(|p| p.as_str()).collect();
    println!("    permissions: {}", granted.join(", "));
}

/// List plugin directories under the install root
pub async fn handle_plugins_list(config: &Config, format: OutputFormat) -> Result<()> {
    let found = loader::discover(&config.plugins.install_dir)
        .await
        .context("Failed to list plugin directory")?;

    match format {
        OutputFormat::Text => {
            println!("Installed Plugins ({}):", config.plugins.install_dir.display());
            println!();
            if found.is_empty() {
                println!("  (none)");
            }
            for item in &found {
                match &item.manifest {
                    Ok(manifest) => println!(
                        "  {} v{} - {} [{}]",
                        manifest.id, manifest.version, manifest.name, manifest.entry.binary
                    ),
                    Err(e) => println!("  {}: {}", item.directory.display(), e),
                }
            }
        }
        OutputFormat::Json => {
            let plugins: Vec<serde_json::Value> = found
                .iter()
                .map(|item| match &item.manifest {
                    Ok(manifest) => json!({
                        "directory": item.directory,
                        "manifest": manifest,
                    }),
                    Err(e) => json!({
                        "directory": item.directory,
                        "error": error_json(e),
                    }),
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&json!({ "plugins": plugins }))?);
        }
    }

    Ok(())
}

fn print_outcomes(outcomes: &[LoadOutcome], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            for outcome in outcomes {
                match &outcome.result {
                    Ok(info) => print_info(info),
                    Err(e) => {
                        println!("  {}: FAILED", outcome.directory.display());
                        println!("    {} ({})", e, e.kind());
                        println!("    hint: {}", e.user_hint());
                    }
                }
            }
            let loaded = outcomes.iter().filter(|o| o.result.is_ok()).count();
            println!();
            println!("{}/{} plugins loaded", loaded, outcomes.len());
        }
        OutputFormat::Json => {
            let results: Vec<serde_json::Value> = outcomes
                .iter()
                .map(|outcome| match &outcome.result {
                    Ok(info) => json!({ "directory": outcome.directory, "plugin": info }),
                    Err(e) => json!({ "directory": outcome.directory, "error": error_json(e) }),
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&json!({ "results": results }))?);
        }
    }
    Ok(())
}

/// Load every installed plugin, report, then unload them again
pub async fn handle_plugins_load_all(config: &Config, format: OutputFormat) -> Result<()> {
    let loader = build_loader(config)?;
    let cancel = cancel_on_ctrl_c();

    let outcomes = loader.load_all(&cancel).await;
    print_outcomes(&outcomes, format)?;

    for (id, clean) in loader.unload_all().await {
        if !clean {
            tracing::warn!(plugin = %id, "Plugin did not unload cleanly");
        }
    }
    Ok(())
}

/// Verify a plugin directory's entry binary
pub async fn handle_plugins_verify(dir: &Path, config: &Config, format: OutputFormat) -> Result<()> {
    let manifest = loader::read_manifest(dir)
        .await
        .with_context(|| format!("Failed to read manifest in {}", dir.display()))?;
    let audit = build_audit_sink(config)?;
    let verification = build_verification(config, audit)?;

    let entry = dir.join(&manifest.entry.binary);
    let result = verification.verify(&manifest, &entry).await;

    match format {
        OutputFormat::Text => {
            println!("Plugin:      {} v{}", manifest.id, manifest.version);
            println!("Binary:      {}", entry.display());
            println!("Status:      {:?}", result.status());
            println!("Trust tier:  {}", result.tier());
            if let Some(thumbprint) = result.thumbprint() {
                println!("Signer:      {}", thumbprint);
            }
            if let Some(hash) = result.content_hash() {
                println!("BLAKE3:      {}", hash);
            }
            if let Some(error) = result.error() {
                println!("Error:       {}", error);
            }
            if config.plugins.require_signed && !result.success() {
                println!();
                println!("This plugin would be rejected: signed plugins are required.");
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "plugin": manifest.id,
                "binary": entry,
                "result": result,
                "loadable": result.success() || !config.plugins.require_signed,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Install a plugin from `source` and load it
pub async fn handle_plugins_install(
    source: &Path,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let loader = build_loader(config)?;
    let cancel = cancel_on_ctrl_c();

    let result = loader.install(source, &cancel).await;
    let outcome = LoadOutcome {
        directory: source.to_path_buf(),
        result,
    };
    print_outcomes(std::slice::from_ref(&outcome), format)?;
    loader.unload_all().await;

    if let Err(e) = outcome.result {
        anyhow::bail!("Install failed: {}", e);
    }
    Ok(())
}

/// Show the allow-lists
pub fn handle_trust_list(config: &Config, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            println!("Official thumbprints:");
            for thumbprint in &config.trust.official_thumbprints {
                println!("  {}", thumbprint);
            }
            println!("Trusted thumbprints:");
            for thumbprint in &config.trust.trusted_thumbprints {
                println!("  {}", thumbprint);
            }
            println!("Trust roots:");
            for root in &config.trust.roots {
                println!("  {} ({})", root.subject, root.public_key);
            }
            if crate::config::BUILTIN_OFFICIAL_ROOT.is_some() {
                println!("  {} (built in)", crate::config::OFFICIAL_ROOT_SUBJECT);
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "official": config.trust.official_thumbprints,
                "trusted": config.trust.trusted_thumbprints,
                "roots": config.trust.roots.iter().map(|r| json!({
                    "subject": r.subject,
                    "public_key": r.public_key,
                })).collect::<Vec<_>>(),
                "builtin_official_root": crate::config::BUILTIN_OFFICIAL_ROOT,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

/// Add a thumbprint and persist the configuration
pub fn handle_trust_add(
    thumbprint: &str,
    official: bool,
    config: &mut Config,
    config_path: &Path,
) -> Result<()> {
    let added = config
        .add_thumbprint(thumbprint, official)
        .context("Invalid thumbprint")?;
    if added {
        config.save(config_path).context("Failed to save configuration")?;
        println!(
            "Added {} to the {} allow-list. Takes effect on the next load.",
            thumbprint.to_ascii_uppercase(),
            if official { "official" } else { "trusted" }
        );
    } else {
        println!("{} is already trusted", thumbprint.to_ascii_uppercase());
    }
    Ok(())
}

/// Remove a thumbprint and persist the configuration
pub fn handle_trust_remove(thumbprint: &str, config: &mut Config, config_path: &Path) -> Result<()> {
    let removed = config
        .remove_thumbprint(thumbprint)
        .context("Invalid thumbprint")?;
    if removed {
        config.save(config_path).context("Failed to save configuration")?;
        println!(
            "Removed {}. Plugins it signed load as untrusted from the next load.",
            thumbprint.to_ascii_uppercase()
        );
    } else {
        println!("{} was not on any allow-list", thumbprint.to_ascii_uppercase());
    }
    Ok(())
}
